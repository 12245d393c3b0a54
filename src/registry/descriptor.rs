//! Provider descriptors and their redacted views.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RegistryError;
use crate::safety::redact_environment;

/// Maximum alias length.
const MAX_ALIAS_LEN: usize = 64;

static ALIAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());

/// How the broker reaches a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking over stdin/stdout.
    Process,
    /// HTTP endpoint.
    Network,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Process => "process",
            TransportKind::Network => "network",
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "process" | "stdio" => Ok(TransportKind::Process),
            "network" | "http" | "sse" | "streamable-http" => Ok(TransportKind::Network),
            other => Err(RegistryError::InvalidDescriptor(format!(
                "unknown transport '{}', expected 'process' or 'network'",
                other
            ))),
        }
    }
}

/// Launch information; the variant determines the transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Network {
        url: String,
    },
}

impl LaunchSpec {
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            LaunchSpec::Process { .. } => TransportKind::Process,
            LaunchSpec::Network { .. } => TransportKind::Network,
        }
    }

    /// Build a launch spec, rejecting fields that do not match the kind.
    pub fn for_kind(
        kind: TransportKind,
        command: Option<String>,
        args: Vec<String>,
        url: Option<String>,
    ) -> Result<Self, RegistryError> {
        let command = command.filter(|c| !c.trim().is_empty());
        let url = url.filter(|u| !u.trim().is_empty());

        let spec = match (kind, command, url) {
            (TransportKind::Process, Some(command), None) => LaunchSpec::Process { command, args },
            (TransportKind::Process, None, _) => {
                return Err(RegistryError::InvalidDescriptor(
                    "process transport requires 'command'".to_string(),
                ));
            }
            (TransportKind::Process, Some(_), Some(_)) => {
                return Err(RegistryError::InvalidDescriptor(
                    "process transport does not take 'url'".to_string(),
                ));
            }
            (TransportKind::Network, None, Some(url)) if args.is_empty() => {
                LaunchSpec::Network { url }
            }
            (TransportKind::Network, _, None) => {
                return Err(RegistryError::InvalidDescriptor(
                    "network transport requires 'url'".to_string(),
                ));
            }
            (TransportKind::Network, _, Some(_)) => {
                return Err(RegistryError::InvalidDescriptor(
                    "network transport does not take 'command' or 'args'".to_string(),
                ));
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        match self {
            LaunchSpec::Process { command, .. } => {
                if command.trim().is_empty() {
                    return Err(RegistryError::InvalidDescriptor(
                        "process transport requires 'command'".to_string(),
                    ));
                }
            }
            LaunchSpec::Network { url } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    RegistryError::InvalidDescriptor(format!("invalid url '{}': {}", url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(RegistryError::InvalidDescriptor(format!(
                        "url must use http or https, got '{}'",
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lifecycle of a managed provider's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    Unbuilt,
    Local,
    Containerized,
}

/// Implementation language of a managed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Node,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "node",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a managed provider's source lives and how to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSource {
    /// Source tree root, under the managed-servers area.
    pub path: PathBuf,
    pub language: Language,
    /// Entry file, relative to `path`.
    pub entry_point: String,
    /// Repository the tree was cloned from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Whether the provider declared that it needs outbound network access.
    #[serde(default)]
    pub network_access: bool,
}

impl ManagedSource {
    pub fn entry_path(&self) -> PathBuf {
        self.path.join(&self.entry_point)
    }
}

/// Environment handed to a provider. Values are secrets.
#[derive(Clone, Default)]
pub struct Environment(BTreeMap<String, SecretString>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plain(vars: BTreeMap<String, String>) -> Self {
        Self(
            vars.into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), SecretString::from(value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Plaintext value for launching a provider. Never surface this.
    pub fn expose(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.expose_secret())
    }

    /// Plaintext pairs for launching a provider. Never surface these.
    pub fn iter_exposed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret()))
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

// Serialized only into the registry document.
impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value.expose_secret())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(Self::from_plain)
    }
}

/// One registered provider, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub alias: String,
    pub launch: LaunchSpec,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub build_state: BuildState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ManagedSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering an external provider.
#[derive(Debug, Clone)]
pub struct Registration {
    pub alias: String,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub description: String,
}

impl ProviderDescriptor {
    /// Descriptor for an externally maintained provider.
    pub fn external(registration: Registration) -> Result<Self, RegistryError> {
        validate_alias(&registration.alias)?;
        let launch = LaunchSpec::for_kind(
            registration.transport,
            registration.command,
            registration.args,
            registration.url,
        )?;
        let now = Utc::now();
        Ok(Self {
            alias: registration.alias,
            launch,
            environment: Environment::from_plain(registration.environment),
            description: registration.description,
            managed: false,
            build_state: BuildState::Unbuilt,
            source: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Descriptor for a provider whose source tree the broker owns.
    pub fn managed(
        alias: impl Into<String>,
        launch: LaunchSpec,
        source: ManagedSource,
        description: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let alias = alias.into();
        validate_alias(&alias)?;
        let now = Utc::now();
        let descriptor = Self {
            alias,
            launch,
            environment: Environment::new(),
            description: description.into(),
            managed: true,
            build_state: BuildState::Unbuilt,
            source: Some(source),
            created_at: now,
            updated_at: now,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.launch.transport_kind()
    }

    /// Check every invariant a stored descriptor must satisfy.
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_alias(&self.alias)?;
        self.launch.validate()?;
        if self.managed && self.source.is_none() {
            return Err(RegistryError::InvalidDescriptor(format!(
                "managed provider '{}' has no source tree",
                self.alias
            )));
        }
        Ok(())
    }

    /// Copy safe to hand to the agent.
    pub fn view(&self) -> ProviderView {
        ProviderView {
            alias: self.alias.clone(),
            transport: self.transport_kind(),
            launch: self.launch.clone(),
            environment: redact_environment(&self.environment),
            description: self.description.clone(),
            managed: self.managed,
            build_state: self.build_state,
            source: self.source.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A descriptor with its environment values masked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderView {
    pub alias: String,
    pub transport: TransportKind,
    pub launch: LaunchSpec,
    pub environment: BTreeMap<String, String>,
    pub description: String,
    pub managed: bool,
    pub build_state: BuildState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ManagedSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Check that an alias can be used as a directory name and image tag.
pub fn validate_alias(alias: &str) -> Result<(), RegistryError> {
    if alias.is_empty() || alias.len() > MAX_ALIAS_LEN {
        return Err(RegistryError::InvalidDescriptor(format!(
            "alias must be 1-{} characters",
            MAX_ALIAS_LEN
        )));
    }
    if !ALIAS_PATTERN.is_match(alias) {
        return Err(RegistryError::InvalidDescriptor(format!(
            "alias '{}' may only contain lowercase letters, digits, '-' and '_'",
            alias
        )));
    }
    Ok(())
}
