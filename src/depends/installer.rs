use anyhow::Result;
use std::path::Path;

use super::DependencyUtils;
use super::requests::RequestQueue;
use crate::common::exec::CommandRunner;
use crate::common::privileges::Invoker;
use crate::common::progress::with_spinner;
use crate::error::GridwareError;
use crate::repo::{Definition, Phase};
use crate::ui::prelude::*;

pub const DENIED_MESSAGE: &str =
    "Some packages failed to install. A request has been filed with your system administrator.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    AlreadyInstalled,
    Installed,
    Failed,
    Denied,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallReport {
    /// False when nothing was attempted for lack of privilege.
    pub attempted: bool,
    pub packages: Vec<(String, PackageState)>,
}

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    pub phase: Phase,
    pub non_interactive: bool,
}

/// Installs the distro packages a definition needs, subject to the whitelist.
pub struct DistroInstaller<'a, R: CommandRunner> {
    pub utils: &'a DependencyUtils,
    pub runner: &'a R,
    pub invoker: Invoker,
    pub requests: RequestQueue,
    /// Hook run for each filed request (`distro-deps-notify`), when present.
    pub notify_hook: Option<&'a Path>,
}

impl<R: CommandRunner> DistroInstaller<'_, R> {
    pub fn install(&self, defn: &Definition, options: InstallOptions) -> Result<InstallReport> {
        if !self.invoker.effective_root {
            emit(
                Level::Warn,
                "distro_deps.not_root",
                "This command must be executed with sudo.",
                None,
            );
            return Ok(InstallReport::default());
        }

        let commands = self.utils.distro().family().commands();
        let whitelist = self.utils.whitelist().get()?;
        let packages = super::required_distro_packages(defn, options.phase, self.utils.distro());
        let mut report = InstallReport {
            attempted: true,
            packages: Vec::new(),
        };
        let quiet = options.non_interactive;

        for pkg in packages {
            if self.runner.status(&commands.check_command(&pkg))? {
                if !quiet {
                    status(Level::Success, "distro_deps.installed", &pkg, "already installed");
                }
                if self.invoker.true_root {
                    self.utils.whitelist().whitelist_package(&pkg)?;
                }
                report.packages.push((pkg, PackageState::AlreadyInstalled));
            } else if self.runner.status(&commands.available_command(&pkg))? {
                if whitelist.permits(&self.invoker, &pkg, &defn.repo_path) {
                    let ok = with_spinner(format!("Installing {pkg}"), || {
                        self.runner.status(&commands.install_command(&pkg))
                    })?;
                    if ok {
                        if self.invoker.true_root {
                            self.utils.whitelist().whitelist_package(&pkg)?;
                        }
                        if !quiet {
                            status(Level::Success, "distro_deps.install.ok", &pkg, "OK");
                        }
                        report.packages.push((pkg, PackageState::Installed));
                    } else {
                        status(Level::Error, "distro_deps.install.failed", &pkg, "FAILED");
                        report.packages.push((pkg, PackageState::Failed));
                    }
                } else {
                    status(Level::Error, "distro_deps.denied", &pkg, "PERMISSION DENIED");
                    emit(
                        Level::Error,
                        "distro_deps.denied.detail",
                        &format!("Permission denied when trying to install {pkg}"),
                        None,
                    );
                    self.file_request(defn, &pkg)?;
                    report.packages.push((pkg, PackageState::Denied));
                }
            } else {
                return Err(GridwareError::NotFound(format!(
                    "Package {pkg} is required but not available."
                ))
                .into());
            }
        }

        if report
            .packages
            .iter()
            .any(|(_, state)| *state == PackageState::Denied)
        {
            emit(Level::Error, "distro_deps.denied.summary", DENIED_MESSAGE, None);
            return Err(GridwareError::PermissionDenied(DENIED_MESSAGE.to_string()).into());
        }
        Ok(report)
    }

    fn file_request(&self, defn: &Definition, pkg: &str) -> Result<()> {
        let user = self.invoker.user.as_deref().unwrap_or("unknown");
        let repo_path = defn.repo_path.to_string_lossy();
        self.requests.file(user, &defn.path(), pkg, &repo_path)?;
        if let Some(hook) = self.notify_hook.filter(|h| h.exists()) {
            let args = [user, &defn.path(), pkg, &repo_path]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>();
            let out = self.runner.output(&hook.to_string_lossy(), &args)?;
            if !out.success {
                emit(
                    Level::Warn,
                    "distro_deps.notify.failed",
                    &format!("Unable to notify administrator: {}", out.stderr.trim()),
                    None,
                );
            }
        }
        Ok(())
    }
}
