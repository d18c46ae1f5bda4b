use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::common::privileges::Invoker;
use crate::config::normalize_keys;

/// Who and what may install distro packages without asking an admin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Whitelist {
    pub users: Vec<String>,
    pub packages: Vec<String>,
    pub repos: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_all: bool,
}

impl Whitelist {
    pub fn permits(&self, invoker: &Invoker, package: &str, repo_path: &Path) -> bool {
        self.allow_all
            || invoker.true_root
            || invoker
                .user
                .as_ref()
                .is_some_and(|u| self.users.contains(u))
            || self.packages.iter().any(|p| p == package)
            || self
                .repos
                .iter()
                .any(|r| Path::new(r) == repo_path)
    }

    fn merge(&mut self, other: Whitelist) {
        fn union(into: &mut Vec<String>, from: Vec<String>) {
            for item in from {
                if !into.contains(&item) {
                    into.push(item);
                }
            }
        }
        union(&mut self.users, other.users);
        union(&mut self.packages, other.packages);
        union(&mut self.repos, other.repos);
        self.allow_all |= other.allow_all;
    }
}

/// Lazily loaded, append-only whitelist file.
///
/// Each mutation re-reads the file, merges, and replaces it. Two processes
/// writing at once can still lose an entry; there is no locking.
#[derive(Debug)]
pub struct WhitelistStore {
    path: PathBuf,
    cache: RefCell<Option<Whitelist>>,
}

impl WhitelistStore {
    pub fn new(path: PathBuf) -> Self {
        WhitelistStore {
            path,
            cache: RefCell::new(None),
        }
    }

    fn read_file(&self) -> Result<Whitelist> {
        if !self.path.exists() {
            return Ok(Whitelist::default());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading whitelist {}", self.path.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing whitelist {}", self.path.display()))?;
        if value.is_null() {
            return Ok(Whitelist::default());
        }
        serde_yaml::from_value(normalize_keys(value))
            .with_context(|| format!("parsing whitelist {}", self.path.display()))
    }

    pub fn get(&self) -> Result<Whitelist> {
        if let Some(cached) = self.cache.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let loaded = self.read_file()?;
        *self.cache.borrow_mut() = Some(loaded.clone());
        Ok(loaded)
    }

    fn update(&self, apply: impl FnOnce(&mut Whitelist) -> bool) -> Result<()> {
        let mut current = self.get()?;
        if !apply(&mut current) {
            return Ok(());
        }
        let mut on_disk = self.read_file()?;
        on_disk.merge(current);

        let parent = self
            .path
            .parent()
            .context("whitelist path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_yaml::to_string(&on_disk)?.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("writing whitelist {}", self.path.display()))?;

        *self.cache.borrow_mut() = Some(on_disk);
        Ok(())
    }

    fn append(list: &mut Vec<String>, item: &str) -> bool {
        if list.iter().any(|i| i == item) {
            false
        } else {
            list.push(item.to_string());
            true
        }
    }

    pub fn whitelist_package(&self, package: &str) -> Result<()> {
        self.update(|w| Self::append(&mut w.packages, package))
    }

    pub fn whitelist_user(&self, user: &str) -> Result<()> {
        self.update(|w| Self::append(&mut w.users, user))
    }

    pub fn whitelist_repo(&self, repo: &Path) -> Result<()> {
        let repo = repo.to_string_lossy();
        self.update(|w| Self::append(&mut w.repos, &repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_shape() {
        let dir = TempDir::new().unwrap();
        let store = WhitelistStore::new(dir.path().join("etc/whitelist.yml"));
        assert_eq!(store.get().unwrap(), Whitelist::default());
    }

    #[test]
    fn test_partial_file_merged_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.yml");
        fs::write(&path, ":users:\n  - alice\n").unwrap();
        let store = WhitelistStore::new(path);
        let w = store.get().unwrap();
        assert_eq!(w.users, vec!["alice"]);
        assert!(w.packages.is_empty() && w.repos.is_empty());
    }

    #[test]
    fn test_mutations_persist_and_merge_with_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/whitelist.yml");
        let store = WhitelistStore::new(path.clone());
        store.get().unwrap();

        // Another process adds a user after we cached the file.
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "users: [bob]\n").unwrap();

        store.whitelist_package("glibc").unwrap();
        store.whitelist_package("glibc").unwrap();

        let reread = WhitelistStore::new(path).get().unwrap();
        assert_eq!(reread.packages, vec!["glibc"]);
        assert_eq!(reread.users, vec!["bob"]);
    }

    #[test]
    fn test_whitelisted_user_and_repo_are_permitted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.yml");
        let store = WhitelistStore::new(path.clone());
        let repo = Path::new("/opt/gridware/repos/volatile");
        assert!(!store.get().unwrap().permits(&Invoker::via_sudo("carol"), "zlib", repo));

        store.whitelist_user("carol").unwrap();
        store.whitelist_repo(repo).unwrap();
        store.whitelist_repo(repo).unwrap();

        let w = WhitelistStore::new(path).get().unwrap();
        assert_eq!(w.users, vec!["carol"]);
        assert_eq!(w.repos, vec!["/opt/gridware/repos/volatile"]);
        assert!(w.permits(&Invoker::via_sudo("carol"), "glibc", Path::new("/elsewhere")));
        assert!(w.permits(&Invoker::via_sudo("dave"), "glibc", repo));
    }

    #[test]
    fn test_permission_model() {
        let repo = Path::new("/opt/gridware/repos/main");
        let empty = Whitelist::default();
        assert!(empty.permits(&Invoker::root(), "zlib", repo));
        assert!(!empty.permits(&Invoker::via_sudo("alice"), "zlib", repo));

        let by_user = Whitelist {
            users: vec!["alice".into()],
            ..Whitelist::default()
        };
        assert!(by_user.permits(&Invoker::via_sudo("alice"), "zlib", repo));
        assert!(!by_user.permits(&Invoker::via_sudo("bob"), "zlib", repo));

        let by_package = Whitelist {
            packages: vec!["zlib".into()],
            ..Whitelist::default()
        };
        assert!(by_package.permits(&Invoker::via_sudo("bob"), "zlib", repo));
        assert!(!by_package.permits(&Invoker::via_sudo("bob"), "glibc", repo));

        let by_repo = Whitelist {
            repos: vec!["/opt/gridware/repos/main".into()],
            ..Whitelist::default()
        };
        assert!(by_repo.permits(&Invoker::via_sudo("bob"), "glibc", repo));
        assert!(!by_repo.permits(&Invoker::via_sudo("bob"), "glibc", Path::new("/elsewhere")));
    }
}
