use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::common::shell::shell_quote;
use crate::error::GridwareError;

/// Distro package-manager families gridware knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistroFamily {
    /// Enterprise Linux (RHEL, CentOS, Rocky)
    El,
    /// Ubuntu
    Ubuntu,
}

/// Shell command templates for one family; `%s` is the package name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplates {
    pub check: &'static str,
    pub available: &'static str,
    pub install: &'static str,
}

const EL_COMMANDS: CommandTemplates = CommandTemplates {
    check: "/bin/rpm -q %s",
    available: "/usr/bin/yum -q list available %s",
    install: "/usr/bin/yum install -y %s",
};

const UBUNTU_COMMANDS: CommandTemplates = CommandTemplates {
    check: "/usr/bin/dpkg-query -W -f='${Status}' %s 2>/dev/null | grep -q 'install ok installed'",
    available: "/usr/bin/apt-cache show %s",
    install: "/usr/bin/apt-get install -y %s",
};

impl CommandTemplates {
    /// Substitute a (quoted) package name into `template`.
    pub fn render(template: &str, package: &str) -> String {
        template.replace("%s", &shell_quote(package))
    }

    pub fn check_command(&self, package: &str) -> String {
        Self::render(self.check, package)
    }

    pub fn available_command(&self, package: &str) -> String {
        Self::render(self.available, package)
    }

    pub fn install_command(&self, package: &str) -> String {
        Self::render(self.install, package)
    }
}

impl DistroFamily {
    /// Key used in definition `dependencies` mappings for the whole family.
    pub fn stem(&self) -> &'static str {
        match self {
            Self::El => "el",
            Self::Ubuntu => "ubuntu",
        }
    }

    pub fn commands(&self) -> CommandTemplates {
        match self {
            Self::El => EL_COMMANDS,
            Self::Ubuntu => UBUNTU_COMMANDS,
        }
    }

    fn from_id(id: &str) -> Option<Self> {
        let rest = |stem: &str| {
            id.strip_prefix(stem)
                .is_some_and(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
        };
        if rest("el") {
            Some(Self::El)
        } else if rest("ubuntu") {
            Some(Self::Ubuntu)
        } else {
            None
        }
    }
}

/// A concrete distro identifier such as `el7` or `ubuntu1604`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distro {
    id: String,
    family: DistroFamily,
}

impl Distro {
    pub fn parse(id: &str) -> Result<Self> {
        let family = DistroFamily::from_id(id)
            .ok_or_else(|| GridwareError::Configuration(format!("Unsupported distro: {id}")))?;
        Ok(Distro {
            id: id.to_string(),
            family,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn family(&self) -> DistroFamily {
        self.family
    }

    /// Work out the distro identifier from /etc/os-release.
    pub fn detect() -> Result<Self> {
        let os_release_path = Path::new("/etc/os-release");
        let content = fs::read_to_string(os_release_path).map_err(|_| {
            GridwareError::Configuration("Unable to read /etc/os-release".to_string())
        })?;
        Self::from_os_release(&content)
    }

    fn from_os_release(content: &str) -> Result<Self> {
        let mut id = String::new();
        let mut id_like = String::new();
        let mut version_id = String::new();

        for line in content.lines() {
            if let Some(val) = line.strip_prefix("ID=") {
                id = val.trim_matches('"').to_string();
            } else if let Some(val) = line.strip_prefix("ID_LIKE=") {
                id_like = val.trim_matches('"').to_string();
            } else if let Some(val) = line.strip_prefix("VERSION_ID=") {
                version_id = val.trim_matches('"').to_string();
            }
        }

        let is_el = matches!(id.as_str(), "rhel" | "centos" | "rocky" | "almalinux")
            || id_like.contains("rhel");
        let dist = if is_el {
            let major = version_id.split('.').next().unwrap_or_default();
            format!("el{major}")
        } else if id == "ubuntu" {
            format!("ubuntu{}", version_id.replace('.', ""))
        } else {
            return Err(GridwareError::Configuration(format!(
                "Unsupported distribution: {id}"
            ))
            .into());
        };
        Self::parse(&dist)
    }
}
