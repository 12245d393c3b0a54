//! Language and entry-point detection for fetched source trees.

use std::path::Path;

use crate::error::ScaffoldError;
use crate::registry::Language;

const PYTHON_MARKERS: &[&str] = &["requirements.txt", "pyproject.toml"];
const NODE_MARKERS: &[&str] = &["package.json"];

const PYTHON_ENTRY_CANDIDATES: &[&str] = &["server.py", "main.py", "src/server.py", "app.py"];
const NODE_ENTRY_CANDIDATES: &[&str] = &[
    "index.js",
    "dist/index.js",
    "src/index.js",
    "build/index.js",
];

/// What detection found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub language: Language,
    /// Relative to the tree root.
    pub entry_point: String,
}

/// Pick a language and an entry point for the tree at `root`.
pub fn detect(root: &Path) -> Result<Detection, ScaffoldError> {
    let failure = |reason: String| ScaffoldError::Detection {
        path: root.to_path_buf(),
        reason,
    };

    let language = if PYTHON_MARKERS.iter().any(|m| root.join(m).is_file()) {
        Language::Python
    } else if NODE_MARKERS.iter().any(|m| root.join(m).is_file()) {
        Language::Node
    } else {
        return Err(failure(
            "no requirements.txt, pyproject.toml or package.json".to_string(),
        ));
    };

    let candidates: Vec<String> = match language {
        Language::Python => PYTHON_ENTRY_CANDIDATES.iter().map(|c| c.to_string()).collect(),
        Language::Node => package_main(root)
            .into_iter()
            .chain(NODE_ENTRY_CANDIDATES.iter().map(|c| c.to_string()))
            .collect(),
    };

    let entry_point = candidates
        .into_iter()
        .find(|c| root.join(c).is_file())
        .ok_or_else(|| {
            failure(format!(
                "{} project without a known entry point (tried {})",
                language,
                match language {
                    Language::Python => PYTHON_ENTRY_CANDIDATES.join(", "),
                    Language::Node => NODE_ENTRY_CANDIDATES.join(", "),
                }
            ))
        })?;

    tracing::debug!("Detected {} provider with entry {}", language, entry_point);
    Ok(Detection {
        language,
        entry_point,
    })
}

/// The `main` field of `package.json`, when it names a relative file.
fn package_main(root: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(root.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let main = manifest.get("main")?.as_str()?.trim_start_matches("./");
    let path = Path::new(main);
    if path.is_absolute() || path.components().any(|c| c.as_os_str() == "..") {
        return None;
    }
    Some(main.to_string())
}
