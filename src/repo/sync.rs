use anyhow::Result;
use chrono::Utc;
use std::fmt;

use super::Repository;
use crate::common::git::{self, SyncOutcome};
use crate::common::paths::is_writable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Created,
    Updated,
    UpToDate,
    OutOfSync,
    NotUpdateable,
    NoPermission,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub revision: Option<String>,
}

impl SyncReport {
    fn new(status: SyncStatus, revision: Option<String>) -> Self {
        SyncReport { status, revision }
    }

    /// Whether the definition set on disk may have changed.
    pub fn mutated(&self) -> bool {
        matches!(self.status, SyncStatus::Created | SyncStatus::Updated)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rev = self.revision.as_deref().unwrap_or("unknown");
        match &self.status {
            SyncStatus::Created | SyncStatus::Updated => write!(f, "OK (At: {rev})"),
            SyncStatus::UpToDate => write!(f, "OK (Up-to-date: {rev})"),
            SyncStatus::NotUpdateable => write!(f, "SKIP (Not updateable, no remote configured)"),
            SyncStatus::OutOfSync => write!(f, "SKIP (Out of sync: {rev})"),
            SyncStatus::NoPermission => write!(f, "SKIP (No permission)"),
            SyncStatus::Failed(reason) => write!(f, "FAIL ({reason})"),
        }
    }
}

/// Bring `repo` up to date with its declared source.
///
/// Never returns an error for sync failures; those are reported as
/// `SyncStatus::Failed`.
pub fn synchronize(repo: &mut Repository) -> SyncReport {
    if !is_writable(&repo.path) {
        return SyncReport::new(SyncStatus::NoPermission, None);
    }

    let Some(source) = repo.metadata.source.clone() else {
        return match repo.set_last_update(Utc::now()) {
            Ok(()) => SyncReport::new(SyncStatus::NotUpdateable, None),
            Err(e) => SyncReport::new(SyncStatus::Failed(failure(repo, &e)), None),
        };
    };

    let outcome = git::sync(&repo.working_copy(), &source, repo.branch());
    let report = match outcome {
        Ok(SyncOutcome::Created) => SyncStatus::Created,
        Ok(SyncOutcome::Updated) => SyncStatus::Updated,
        Ok(SyncOutcome::UpToDate) => SyncStatus::UpToDate,
        Ok(SyncOutcome::OutOfSync) => SyncStatus::OutOfSync,
        Err(e) => return SyncReport::new(SyncStatus::Failed(failure(repo, &e)), None),
    };

    if report != SyncStatus::OutOfSync
        && let Err(e) = repo.set_last_update(Utc::now())
    {
        return SyncReport::new(SyncStatus::Failed(failure(repo, &e)), None);
    }
    if matches!(report, SyncStatus::Created | SyncStatus::Updated) {
        repo.invalidate_definitions();
    }
    SyncReport::new(report, Some(repo.head_revision()))
}

fn failure(repo: &Repository, err: &anyhow::Error) -> String {
    format!("Unable to sync repo: '{}' ({:#})", repo.name, err)
}

/// Sync a repository by name, for callers holding a `RepositorySet`.
pub fn synchronize_named(repos: &mut super::RepositorySet, name: &str) -> Result<SyncReport> {
    let repo = repos.get_mut(name).ok_or_else(|| {
        crate::error::GridwareError::NotFound(format!("Repository {name} not found"))
    })?;
    Ok(synchronize(repo))
}
