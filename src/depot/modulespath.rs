use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A module search-path file: one directory per line, `#` lines are comments.
#[derive(Debug, Clone)]
pub struct ModulesPath {
    file: PathBuf,
}

impl ModulesPath {
    pub fn new(file: PathBuf) -> Self {
        ModulesPath { file }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn entries(&self) -> Result<Vec<String>> {
        if !self.file.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.file)
            .with_context(|| format!("reading {}", self.file.display()))?;
        Ok(text.lines().map(str::to_string).collect())
    }

    pub fn contains(&self, entry: &str) -> Result<bool> {
        Ok(self.entries()?.iter().any(|e| e == entry))
    }

    /// Insert `entry` before the first non-comment line. Returns false when it
    /// was already present.
    pub fn insert(&self, entry: &str) -> Result<bool> {
        let mut lines = self.entries()?;
        if lines.iter().any(|l| l == entry) {
            return Ok(false);
        }
        let at = lines
            .iter()
            .position(|l| !l.starts_with('#'))
            .unwrap_or(lines.len());
        lines.insert(at, entry.to_string());
        self.write(&lines)?;
        Ok(true)
    }

    /// Remove every line equal to `entry`. Returns false when none matched.
    pub fn remove(&self, entry: &str) -> Result<bool> {
        let mut lines = self.entries()?;
        let before = lines.len();
        lines.retain(|l| l != entry);
        if lines.len() == before {
            return Ok(false);
        }
        self.write(&lines)?;
        Ok(true)
    }

    fn write(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut text = lines.join("\n");
        text.push('\n');
        fs::write(&self.file, text).with_context(|| format!("writing {}", self.file.display()))
    }
}
