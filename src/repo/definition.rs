use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::normalize_keys;

/// Dependency phase named in definition metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Phase {
    Build,
    Runtime,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a YAML scalar (`1.8` parses as a float) as the string it was
/// written as.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Requirements {
    List(Vec<String>),
    Phased(BTreeMap<String, Option<Vec<String>>>),
}

/// The typed subset of a definition's `metadata.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub version: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub dependencies: Option<Mapping>,
    pub requirements: Option<Requirements>,
    pub variants: Option<Value>,
    pub compilers: Option<Value>,
}

/// A package definition loaded from a repository.
#[derive(Debug, Clone)]
pub struct Definition {
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub kind: String,
    pub name: String,
    pub version: String,
    pub metadata: Metadata,
    pub checksum: String,
    pub file: PathBuf,
    raw: Mapping,
}

impl Definition {
    /// Load `file` (a `metadata.yml` below `package_dir`).
    pub fn load(repo_name: &str, repo_path: &Path, package_dir: &Path, file: &Path) -> Result<Self> {
        let text = fs::read_to_string(file)
            .with_context(|| format!("Unable to parse: {}", file.display()))?;
        let relative = file.strip_prefix(package_dir).unwrap_or(file);
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Self::parse(repo_name, repo_path, &parts, &text, file)
    }

    /// Build a definition from metadata text; `parts` is the path of the
    /// metadata file relative to the repository's `pkg` directory.
    pub fn parse(
        repo_name: &str,
        repo_path: &Path,
        parts: &[String],
        text: &str,
        file: &Path,
    ) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)
            .with_context(|| format!("Unable to parse: {}", file.display()))?;
        let value = normalize_keys(value);
        let raw = match &value {
            Value::Mapping(m) => m.clone(),
            Value::Null => Mapping::new(),
            _ => anyhow::bail!("Unable to parse: {} (not a mapping)", file.display()),
        };
        let metadata: Metadata = serde_yaml::from_value(Value::Mapping(raw.clone()))
            .with_context(|| format!("Unable to parse: {}", file.display()))?;

        // type/name/version/metadata.yml, or type/name/metadata.yml
        let (dir_name, dir_version) = match parts.len() {
            n if n >= 4 => (Some(parts[n - 3].clone()), Some(parts[n - 2].clone())),
            n if n >= 2 => (Some(parts[n - 2].clone()), None),
            _ => (None, None),
        };
        let name = dir_name
            .or_else(|| metadata.name.clone())
            .with_context(|| format!("Unable to determine package name for {}", file.display()))?;
        let version = dir_version
            .or_else(|| metadata.version.clone())
            .unwrap_or_default();
        let kind = metadata
            .kind
            .clone()
            .or_else(|| (parts.len() >= 3).then(|| parts[0].clone()))
            .unwrap_or_else(|| "apps".to_string());

        let checksum = format!("{:x}", Sha256::digest(text.as_bytes()));

        Ok(Definition {
            repo_name: repo_name.to_string(),
            repo_path: repo_path.to_path_buf(),
            kind,
            name,
            version,
            metadata,
            checksum,
            file: file.to_path_buf(),
            raw,
        })
    }

    /// Look up any metadata key, typed or not.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// `repo/type/name/version`
    pub fn path(&self) -> String {
        format!("{}/{}", self.repo_name, self.package_path())
    }

    /// `type/name/version`
    pub fn package_path(&self) -> String {
        format!("{}/{}/{}", self.kind, self.name, self.version)
    }

    pub fn has_variants(&self) -> bool {
        self.metadata
            .variants
            .as_ref()
            .is_some_and(|v| !v.is_null())
    }

    pub fn is_compiler(&self) -> bool {
        self.kind == "compilers"
    }

    /// Requirement strings for `phase`; a flat list applies to every phase.
    pub fn requirements(&self, phase: Phase) -> Vec<String> {
        match &self.metadata.requirements {
            None => Vec::new(),
            Some(Requirements::List(list)) => list.clone(),
            Some(Requirements::Phased(map)) => [phase.as_str(), "default"]
                .iter()
                .filter_map(|key| map.get(*key).cloned().flatten())
                .flatten()
                .collect(),
        }
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
