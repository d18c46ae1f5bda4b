use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::distro::DistroFamily;
use crate::common::exec::CommandRunner;
use crate::common::shell::shell_quote;
use crate::config::normalize_keys;
use crate::error::GridwareError;

/// One pending request for an administrator to install a distro package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRequest {
    pub id: String,
    pub user: String,
    pub gridware_package: String,
    pub distro_package: String,
    pub repo_path: String,
    pub date: DateTime<Local>,
}

/// What the administrator wants done with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Install,
    InstallAll,
    Skip,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Installed,
    InstallFailed,
    Skipped,
    Deleted,
}

/// Directory of request files, one line each:
/// `user gridware_package distro_package repo_path`.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    dir: PathBuf,
}

impl RequestQueue {
    pub fn new(dir: PathBuf) -> Self {
        RequestQueue { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(
        &self,
        user: &str,
        gridware_package: &str,
        distro_package: &str,
        repo_path: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating request queue {}", self.dir.display()))?;
        let id = format!(
            "{}-{:08x}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            rand::thread_rng().r#gen::<u32>()
        );
        let path = self.dir.join(&id);
        fs::write(
            &path,
            format!("{user} {gridware_package} {distro_package} {repo_path}\n"),
        )
        .with_context(|| format!("writing request {}", path.display()))?;
        Ok(path)
    }

    pub fn list(&self) -> Result<Vec<PackageRequest>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !name.starts_with('.'))
            .collect();
        ids.sort();
        ids.iter().map(|id| self.read(id)).collect()
    }

    fn read(&self, id: &str) -> Result<PackageRequest> {
        let path = self.dir.join(id);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading request {}", path.display()))?;
        let line = text.lines().next().unwrap_or_default();
        let mut fields = line.splitn(4, ' ').map(|f| f.trim_matches('"').to_string());
        let mut next = || fields.next().unwrap_or_default();
        let (user, gridware_package, distro_package, repo_path) = (next(), next(), next(), next());
        let date = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        Ok(PackageRequest {
            id: id.to_string(),
            user,
            gridware_package,
            distro_package,
            repo_path,
            date,
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.dir.join(id);
        if !path.exists() {
            return Err(GridwareError::NotFound(format!("No such request: {id}")).into());
        }
        fs::remove_file(&path).with_context(|| format!("removing request {}", path.display()))
    }
}

/// Command line an administrator-driven install runs, logging to
/// `<log_root>/depends.log`.
pub fn admin_install_command(family: DistroFamily, package: &str, log_root: &Path) -> String {
    let install = family.commands().install_command(package);
    let log = shell_quote(&log_root.join("depends.log").to_string_lossy());
    match family {
        // yum misbehaves with the caller's environment
        DistroFamily::El => format!("env -i {install} >>{log} 2>&1"),
        DistroFamily::Ubuntu => format!("{install} >>{log} 2>&1"),
    }
}

/// The `user_email` a user set in `<home>/gridware/etc/gridware.yml`, or an
/// empty string.
pub fn user_email(home: &Path) -> String {
    let file = home.join("gridware").join("etc").join("gridware.yml");
    fs::read_to_string(file)
        .ok()
        .and_then(|text| serde_yaml::from_str::<serde_yaml::Value>(&text).ok())
        .map(normalize_keys)
        .and_then(|value| value.get("user_email").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_default()
}

/// Tell the requesting user their package is installed. A failing hook is
/// reported, not raised.
pub fn notify_user(runner: &impl CommandRunner, hook: &Path, request: &PackageRequest, email: &str) -> Result<()> {
    if !hook.exists() {
        return Ok(());
    }
    let args = [
        request.user.as_str(),
        &request.gridware_package,
        &request.distro_package,
        &request.repo_path,
        email,
    ]
    .map(str::to_string);
    let out = runner.output(&hook.to_string_lossy(), &args)?;
    if !out.success {
        crate::ui::emit(
            crate::ui::Level::Warn,
            "requests.notify.failed",
            &format!("Unable to notify {}: {}", request.user, out.stderr.trim()),
            None,
        );
    }
    Ok(())
}

/// Walks the queue applying administrator decisions.
pub struct RequestProcessor<'a, R: CommandRunner> {
    pub queue: &'a RequestQueue,
    pub runner: &'a R,
    pub family: DistroFamily,
    pub log_root: &'a Path,
}

impl<R: CommandRunner> RequestProcessor<'_, R> {
    /// Handle every pending request. `decide` is asked once per request until
    /// it answers `InstallAll`; `on_installed` runs after a successful install.
    pub fn process(
        &self,
        mut decide: impl FnMut(&PackageRequest) -> Result<Decision>,
        mut on_installed: impl FnMut(&PackageRequest) -> Result<()>,
    ) -> Result<Vec<(PackageRequest, RequestOutcome)>> {
        let mut install_all = false;
        let mut results = Vec::new();
        for request in self.queue.list()? {
            let decision = if install_all {
                Decision::Install
            } else {
                decide(&request)?
            };
            let outcome = match decision {
                Decision::Delete => {
                    self.queue.remove(&request.id)?;
                    RequestOutcome::Deleted
                }
                Decision::Skip => RequestOutcome::Skipped,
                Decision::Install | Decision::InstallAll => {
                    install_all |= decision == Decision::InstallAll;
                    fs::create_dir_all(self.log_root).ok();
                    let line =
                        admin_install_command(self.family, &request.distro_package, self.log_root);
                    if self.runner.status(&line)? {
                        self.queue.remove(&request.id)?;
                        on_installed(&request)?;
                        RequestOutcome::Installed
                    } else {
                        RequestOutcome::InstallFailed
                    }
                }
            };
            results.push((request, outcome));
        }
        Ok(results)
    }
}
