use anyhow::{Context, Result};
use git2::{FetchOptions, Oid, Repository, build::CheckoutBuilder};
use std::path::Path;

pub const UPSTREAM_REMOTE: &str = "upstream";
pub const DEFAULT_BRANCH: &str = "master";

/// Result of reconciling a working copy with its upstream branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    UpToDate,
    OutOfSync,
}

/// Short revision of the checked out commit.
pub fn head_revision(path: &Path) -> Result<String> {
    let repo = Repository::open(path).context("Failed to open repository")?;
    let head = repo.head().context("Failed to get HEAD reference")?;
    let oid = head
        .target()
        .ok_or_else(|| anyhow::anyhow!("HEAD has no target"))?;
    Ok(oid.to_string().chars().take(7).collect())
}

fn open_or_init(path: &Path) -> Result<Repository> {
    if path.join(".git").is_dir() {
        Repository::open(path).context("Failed to open repository")
    } else {
        std::fs::create_dir_all(path).context("Failed to create working copy directory")?;
        Repository::init(path).context("Failed to initialise repository")
    }
}

/// Fetch `branch` from the `upstream` remote
fn fetch_upstream(repo: &Repository, url: &str, branch: &str) -> Result<Oid> {
    let mut remote = match repo.find_remote(UPSTREAM_REMOTE) {
        Ok(remote) => remote,
        Err(_) => repo
            .remote(UPSTREAM_REMOTE, url)
            .context("Failed to create upstream remote")?,
    };

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(git2::RemoteCallbacks::new());

    let refspec = format!("+refs/heads/{branch}:refs/remotes/{UPSTREAM_REMOTE}/{branch}");
    remote
        .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
        .context("Failed to fetch upstream")?;

    let reference = repo
        .find_reference(&format!("refs/remotes/{UPSTREAM_REMOTE}/{branch}"))
        .context("Failed to find upstream branch reference")?;
    reference
        .target()
        .ok_or_else(|| anyhow::anyhow!("Upstream branch has no target"))
}

/// Point the checked out branch at `oid` and hard-reset the working tree.
fn hard_reset(repo: &Repository, oid: Oid, branch: &str) -> Result<()> {
    let commit = repo
        .find_commit(oid)
        .context("Failed to find upstream commit")?;

    if repo.head_detached().unwrap_or(false) || repo.head().is_err() {
        // Unborn HEAD: create the branch before resetting onto it.
        repo.reference(&format!("refs/heads/{branch}"), oid, true, "gridware: sync")
            .context("Failed to create local branch")?;
        repo.set_head(&format!("refs/heads/{branch}"))
            .context("Failed to set HEAD")?;
        repo.checkout_head(Some(
            CheckoutBuilder::new().force().remove_untracked(true),
        ))
        .context("Failed to check out working tree")?;
        return Ok(());
    }

    repo.reset(commit.as_object(), git2::ResetType::Hard, None)
        .context("Failed to reset to upstream commit")?;
    Ok(())
}

/// Bring the working copy at `path` in line with `url`'s `branch`.
///
/// A missing working copy is initialised. Only unborn and fast-forward
/// states are moved; diverged history is reported as `OutOfSync` and left
/// untouched.
pub fn sync(path: &Path, url: &str, branch: &str) -> Result<SyncOutcome> {
    let repo = open_or_init(path)?;
    let upstream_head = fetch_upstream(&repo, url, branch)?;

    let annotated = repo.find_annotated_commit(upstream_head)?;
    let (analysis, _) = repo
        .merge_analysis(&[&annotated])
        .context("Failed to analyse upstream history")?;

    if analysis.is_unborn() {
        hard_reset(&repo, upstream_head, branch)?;
        Ok(SyncOutcome::Created)
    } else if analysis.is_up_to_date() {
        Ok(SyncOutcome::UpToDate)
    } else if analysis.is_fast_forward() {
        hard_reset(&repo, upstream_head, branch)?;
        Ok(SyncOutcome::Updated)
    } else {
        Ok(SyncOutcome::OutOfSync)
    }
}
