use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GridwareError;

pub fn is_remote(location: &str) -> bool {
    location.starts_with("http:") || location.starts_with("https:")
}

/// Where a remote archive is cached: `<archives_dir>/dist/<basename>`.
pub fn cache_target(archives_dir: &Path, url: &str) -> PathBuf {
    let basename = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or(url);
    archives_dir.join("dist").join(basename)
}

fn etag_file(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".etag");
    PathBuf::from(name)
}

fn download_file(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".download");
    PathBuf::from(name)
}

/// The ETag recorded when `target` was downloaded, if any.
pub fn stored_etag(target: &Path) -> Option<String> {
    fs::read_to_string(etag_file(target))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub enum Fetched {
    Cached(PathBuf),
    Downloaded(PathBuf),
}

impl Fetched {
    pub fn path(&self) -> &Path {
        match self {
            Fetched::Cached(p) | Fetched::Downloaded(p) => p,
        }
    }
}

pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("gridware/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Fetcher { client })
    }

    fn remote_etag(&self, url: &str) -> Option<String> {
        let response = self.client.head(url).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
    }

    /// Download `url` into the archive cache unless the cached copy's ETag
    /// still matches the remote one.
    pub fn fetch(&self, url: &str, archives_dir: &Path) -> Result<Fetched> {
        let target = cache_target(archives_dir, url);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let remote = self.remote_etag(url);
        if target.exists() && remote.is_some() && remote == stored_etag(&target) {
            return Ok(Fetched::Cached(target));
        }

        let partial = download_file(&target);
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(GridwareError::from)
            .context("Unable to download archive for import.")?;
        if !response.status().is_success() {
            return Err(GridwareError::NotFound(format!(
                "Unable to download archive for import: {} returned {}",
                url,
                response.status()
            ))
            .into());
        }
        let mut out = fs::File::create(&partial)
            .with_context(|| format!("creating {}", partial.display()))?;
        response
            .copy_to(&mut out)
            .map_err(GridwareError::from)
            .context("Unable to download archive for import.")?;
        fs::rename(&partial, &target)
            .with_context(|| format!("moving download into {}", target.display()))?;

        match remote {
            Some(etag) => fs::write(etag_file(&target), etag)?,
            None => {
                let _ = fs::remove_file(etag_file(&target));
            }
        }
        Ok(Fetched::Downloaded(target))
    }
}
