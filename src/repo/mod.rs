//! Package repositories: where definitions come from.

pub mod definition;
pub mod sync;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::common::git;
use crate::common::version::compare_versions;
use crate::config::{Config, normalize_keys};
pub use definition::{Definition, Phase};
pub use sync::{SyncReport, SyncStatus};

/// Contents of a repository's `repo.yml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoMetadata {
    pub source: Option<String>,
    pub schema: Option<u32>,
    pub branch: Option<String>,
}

#[derive(Debug)]
pub struct Repository {
    pub path: PathBuf,
    pub name: String,
    pub metadata: RepoMetadata,
    last_update_filename: String,
    definitions: OnceCell<Vec<Definition>>,
}

impl Repository {
    pub fn open(path: &Path, last_update_filename: &str) -> Result<Self> {
        let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("Invalid repository path: {}", path.display()))?;
        let repo_yml = path.join("repo.yml");
        let metadata = if repo_yml.exists() {
            let text = fs::read_to_string(&repo_yml)
                .with_context(|| format!("reading {}", repo_yml.display()))?;
            let value: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", repo_yml.display()))?;
            match normalize_keys(value) {
                serde_yaml::Value::Null => RepoMetadata::default(),
                value => serde_yaml::from_value(value)
                    .with_context(|| format!("parsing {}", repo_yml.display()))?,
            }
        } else {
            RepoMetadata::default()
        };

        Ok(Repository {
            path,
            name,
            metadata,
            last_update_filename: last_update_filename.to_string(),
            definitions: OnceCell::new(),
        })
    }

    pub fn package_path(&self) -> PathBuf {
        self.path.join("pkg")
    }

    /// Directory that is the git working copy.
    pub fn working_copy(&self) -> PathBuf {
        if self.metadata.schema == Some(1) {
            self.package_path()
        } else {
            self.path.clone()
        }
    }

    pub fn branch(&self) -> &str {
        self.metadata.branch.as_deref().unwrap_or(git::DEFAULT_BRANCH)
    }

    pub fn head_revision(&self) -> String {
        git::head_revision(&self.working_copy()).unwrap_or_else(|_| "unknown".to_string())
    }

    /// `git+<source>@<rev>` for synced repositories, `file:<path>` otherwise.
    pub fn descriptor(&self) -> String {
        match &self.metadata.source {
            Some(source) => format!("git+{}@{}", source, self.head_revision()),
            None => format!("file:{}", self.path.display()),
        }
    }

    fn last_update_file(&self) -> PathBuf {
        self.path.join(&self.last_update_filename)
    }

    /// Time of the last successful sync; the epoch when never synced.
    pub fn last_update(&self) -> DateTime<Utc> {
        fs::read_to_string(self.last_update_file())
            .ok()
            .and_then(|s| {
                s.lines()
                    .next()
                    .and_then(|l| DateTime::parse_from_rfc3339(l.trim()).ok())
            })
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn set_last_update(&self, at: DateTime<Utc>) -> Result<()> {
        fs::write(self.last_update_file(), at.to_rfc3339())
            .with_context(|| format!("writing {}", self.last_update_file().display()))
    }

    pub fn needs_update(&self, period: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_update() + period < now
    }

    pub fn definitions(&self) -> Result<&[Definition]> {
        if self.definitions.get().is_none() {
            let loaded = self.load_definitions()?;
            let _ = self.definitions.set(loaded);
        }
        Ok(self.definitions.get().map(Vec::as_slice).unwrap_or_default())
    }

    pub fn invalidate_definitions(&mut self) {
        self.definitions.take();
    }

    fn load_definitions(&self) -> Result<Vec<Definition>> {
        let package_dir = self.package_path();
        if !package_dir.is_dir() {
            return Ok(Vec::new());
        }
        crate::ui::emit(
            crate::ui::Level::Debug,
            "repo.load",
            &format!("Loading repo from path: {}", self.path.display()),
            None,
        );

        let mut definitions = Vec::new();
        for entry in WalkDir::new(&package_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry?;
            if entry.file_type().is_file() && entry.file_name() == "metadata.yml" {
                definitions.push(Definition::load(
                    &self.name,
                    &self.path,
                    &package_dir,
                    entry.path(),
                )?);
            }
        }
        Ok(definitions)
    }
}

fn fnmatch(pattern: &Pattern, candidate: &str) -> bool {
    pattern.matches_with(
        candidate,
        MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        },
    )
}

/// Does `defn` match a `/`-separated query of one to four parts?
pub fn query_matches(query: &str, defn: &Definition) -> Result<bool> {
    let pattern = Pattern::new(query).with_context(|| format!("Invalid query: {query}"))?;
    let candidates = match query.split('/').count() {
        1 => vec![defn.name.clone()],
        2 => vec![
            format!("{}/{}", defn.repo_name, defn.kind),
            format!("{}/{}", defn.kind, defn.name),
            format!("{}/{}", defn.name, defn.version),
        ],
        3 => vec![
            format!("{}/{}/{}", defn.repo_name, defn.kind, defn.name),
            format!("{}/{}/{}", defn.kind, defn.name, defn.version),
        ],
        4 => vec![defn.path()],
        _ => Vec::new(),
    };
    Ok(candidates.iter().any(|c| fnmatch(&pattern, c)))
}

/// Ordering used for listings and latest-version selection.
pub fn sort_definitions(defns: &mut [&Definition]) {
    defns.sort_by(|a, b| {
        a.repo_name
            .cmp(&b.repo_name)
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| compare_versions(&a.version, &b.version))
    });
}

/// All configured repositories.
#[derive(Debug)]
pub struct RepositorySet {
    repos: Vec<Repository>,
    update_period: chrono::Duration,
}

impl RepositorySet {
    pub fn from_config(config: &Config) -> Result<Self> {
        let repos = config
            .settings
            .repo_paths
            .iter()
            .map(|p| Repository::open(p, &config.settings.last_update_filename))
            .collect::<Result<Vec<_>>>()?;
        Ok(RepositorySet {
            repos,
            update_period: config.update_period(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repos.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Repository> {
        self.repos.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Repository> {
        self.repos.iter_mut().find(|r| r.name == name)
    }

    /// Names of repositories whose last sync is older than the update period.
    pub fn requiring_update(&self) -> Vec<String> {
        let now = Utc::now();
        self.repos
            .iter()
            .filter(|r| r.needs_update(self.update_period, now))
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn invalidate_definitions(&mut self) {
        for repo in &mut self.repos {
            repo.invalidate_definitions();
        }
    }

    /// Definitions across all repositories matching `query`, sorted.
    pub fn find_definitions(&self, query: &str) -> Result<Vec<&Definition>> {
        let mut found = Vec::new();
        for repo in &self.repos {
            for defn in repo.definitions()? {
                if query_matches(query, defn)? {
                    found.push(defn);
                }
            }
        }
        sort_definitions(&mut found);
        Ok(found)
    }
}
