//! Append-only audit log.
//!
//! One JSON object per line in `audit.log`. The broker only ever appends;
//! rotation is left to the operator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ErrorKind;
use crate::safety::{SecretScrubber, truncate_head};

/// Longest argument summary kept in a record.
pub const MAX_ARGUMENT_SUMMARY: usize = 256;

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Error(ErrorKind),
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn new(operation: impl Into<String>, outcome: AuditOutcome, duration: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            alias: None,
            tool: None,
            arguments: None,
            outcome,
            duration_ms: duration.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn arguments(mut self, summary: String) -> Self {
        self.arguments = Some(summary);
        self
    }
}

/// Compact, scrubbed, truncated rendering of tool arguments.
pub fn summarize_arguments(arguments: &serde_json::Value, scrubber: &SecretScrubber) -> String {
    let mut value = arguments.clone();
    scrubber.scrub_value(&mut value);
    let compact = serde_json::to_string(&value).unwrap_or_default();
    // Scrub again in case a secret spans a string boundary in the JSON text.
    truncate_head(&scrubber.scrub(&compact), MAX_ARGUMENT_SUMMARY)
}

pub struct AuditLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Failures are logged, never returned.
    pub async fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(&record).await {
            tracing::warn!(
                "Failed to write audit record for {} to {}: {}",
                record.operation,
                self.path.display(),
                e
            );
        }
    }

    async fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Environment;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().join("audit.log"));

        logger
            .record(
                AuditRecord::new("invoke", AuditOutcome::Success, Duration::from_millis(42))
                    .alias("weather")
                    .tool("get_forecast")
                    .arguments(r#"{"city":"London"}"#.to_string()),
            )
            .await;
        logger
            .record(
                AuditRecord::new(
                    "discover",
                    AuditOutcome::Error(ErrorKind::NotFound),
                    Duration::from_millis(1),
                )
                .alias("nope"),
            )
            .await;

        let lines = read_lines(logger.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "success");
        assert_eq!(lines[0]["duration_ms"], 42);
        assert_eq!(lines[0]["tool"], "get_forecast");
        assert_eq!(lines[1]["outcome"], serde_json::json!({"error": "not_found"}));
        assert!(lines[1].get("tool").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(AuditLogger::new(dir.path().join("audit.log")));

        let mut handles = Vec::new();
        for i in 0..20 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger
                    .record(
                        AuditRecord::new("invoke", AuditOutcome::Success, Duration::ZERO)
                            .alias(format!("p{}", i)),
                    )
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(read_lines(logger.path()).len(), 20);
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().join("missing").join("audit.log"));
        logger
            .record(AuditRecord::new("list", AuditOutcome::Success, Duration::ZERO))
            .await;
        assert!(!logger.path().exists());
    }

    #[test]
    fn test_summary_is_scrubbed_and_truncated() {
        let mut env = Environment::new();
        env.insert("API_KEY", "sk-live-123");
        let scrubber = SecretScrubber::from_environments([&env]);

        let args = serde_json::json!({"auth": "sk-live-123", "query": "x".repeat(400)});
        let summary = summarize_arguments(&args, &scrubber);

        assert!(!summary.contains("sk-live-123"));
        assert!(summary.contains("[REDACTED]"));
        assert!(summary.chars().count() <= MAX_ARGUMENT_SUMMARY + 3);
    }
}
