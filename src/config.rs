//! Engine configuration.
//!
//! Settings come from `gridware.yml` (optionally merged with a per-user
//! override in userspace mode) and from the environment the clusterware
//! runtime exports (`cw_DIST`, `cw_ROOT`, ...). Everything else in the crate
//! receives a `Config` explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::distro::Distro;
use crate::error::GridwareError;

pub const DEFAULT_CW_ROOT: &str = "/opt/clusterware";
pub const DEFAULT_GRIDWARE_ROOT: &str = "/opt/gridware";

fn default_update_period_hours() -> i64 {
    24
}

fn default_last_update_filename() -> String {
    ".last_update".to_string()
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_binary_url() -> String {
    "https://s3-eu-west-1.amazonaws.com/alces-gridware-eu-west-1/dist".to_string()
}

fn default_repo() -> String {
    "main".to_string()
}

/// Settings read from `gridware.yml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub repo_paths: Vec<PathBuf>,
    #[serde(default = "default_update_period_hours")]
    pub update_period_hours: i64,
    #[serde(default = "default_last_update_filename")]
    pub last_update_filename: String,
    #[serde(default)]
    pub archives_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_root: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_binary_url")]
    pub binary_url: String,
    #[serde(default = "default_repo")]
    pub default_repo: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            repo_paths: Vec::new(),
            update_period_hours: default_update_period_hours(),
            last_update_filename: default_last_update_filename(),
            archives_dir: None,
            log_root: None,
            fetch_timeout: default_fetch_timeout(),
            binary_url: default_binary_url(),
            default_repo: default_repo(),
            user_email: None,
        }
    }
}

/// Inputs owned by the surrounding clusterware environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub distro: Distro,
    pub cw_root: PathBuf,
    pub gridware_root: PathBuf,
    /// Set when operating on a per-user depot tree; holds the user name
    /// (empty means the invoking user).
    pub userspace: Option<String>,
    pub notify: bool,
    pub sudo_user: Option<String>,
    /// Module files currently loaded (`_LMFILES_`).
    pub loaded_modules: Vec<String>,
}

impl Environment {
    pub fn from_env() -> Result<Self> {
        let distro = match env::var("cw_DIST") {
            Ok(dist) if !dist.is_empty() => Distro::parse(&dist)?,
            _ => Distro::detect()?,
        };
        Ok(Environment {
            distro,
            cw_root: env::var_os("cw_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CW_ROOT)),
            gridware_root: env::var_os("cw_GRIDWARE_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GRIDWARE_ROOT)),
            userspace: env::var("cw_GRIDWARE_userspace").ok(),
            notify: env::var("cw_GRIDWARE_notify").is_ok_and(|v| v == "true"),
            sudo_user: env::var("SUDO_USER").ok().filter(|u| !u.is_empty()),
            loaded_modules: env::var("_LMFILES_")
                .map(|v| {
                    v.split(':')
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub env: Environment,
}

impl Config {
    /// Load configuration from the environment and the config files it names.
    pub fn load() -> Result<Config> {
        let env = Environment::from_env()?;
        Self::load_for(env)
    }

    pub fn load_for(env: Environment) -> Result<Config> {
        let system_file = [
            env.cw_root
                .join("etc")
                .join(format!("gridware.{}.yml", env.distro.id())),
            env.cw_root.join("etc").join("gridware.yml"),
        ]
        .into_iter()
        .find(|p| p.exists());

        let mut merged = match &system_file {
            Some(path) => read_yaml(path)?,
            None => Value::Mapping(Default::default()),
        };

        if env.userspace.is_some() {
            let user_file = user_home(&env)?
                .join(".config")
                .join("gridware")
                .join("gridware.yml");
            if user_file.exists() {
                let user = read_yaml(&user_file)?;
                let system: Settings = from_value(merged.clone())?;
                let user_settings: Settings = from_value(user.clone())?;
                check_user_config(&system, &user_settings, &user_file)?;
                deep_merge(&mut merged, user);
            }
        }

        let mut settings: Settings = from_value(merged)?;
        if settings.repo_paths.is_empty() {
            settings.repo_paths = vec![
                env.cw_root
                    .join("var")
                    .join("lib")
                    .join("gridware")
                    .join("repos")
                    .join("main"),
            ];
        }
        settings.repo_paths = settings
            .repo_paths
            .iter()
            .map(|p| expand_path(p))
            .collect();

        Ok(Config { settings, env })
    }

    pub fn from_parts(settings: Settings, env: Environment) -> Config {
        Config { settings, env }
    }

    pub fn dist(&self) -> &str {
        self.env.distro.id()
    }

    pub fn is_userspace(&self) -> bool {
        self.env.userspace.is_some()
    }

    pub fn update_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.settings.update_period_hours)
    }

    /// Directory holding the depot links (`<root>/<name>`).
    pub fn depot_root(&self) -> &Path {
        &self.env.gridware_root
    }

    /// Directory holding the physical depot trees (`<root>/depots/<id>`).
    pub fn depot_storage_root(&self) -> PathBuf {
        self.env.gridware_root.join("depots")
    }

    pub fn depot_link(&self, depot: &str) -> PathBuf {
        self.env.gridware_root.join(depot)
    }

    fn depot_dist_dir(&self, depot: &str) -> PathBuf {
        self.depot_link(depot).join(self.dist())
    }

    pub fn modules_dir(&self, depot: &str) -> PathBuf {
        self.depot_dist_dir(depot).join("etc").join("modules")
    }

    pub fn packages_dir(&self, depot: &str) -> PathBuf {
        self.depot_dist_dir(depot).join("pkg")
    }

    pub fn dependencies_dir(&self, depot: &str) -> PathBuf {
        self.depot_dist_dir(depot).join("etc").join("depends")
    }

    pub fn package_db_path(&self, depot: &str) -> PathBuf {
        self.depot_dist_dir(depot).join("etc").join("packages.db")
    }

    pub fn whitelist_path(&self) -> PathBuf {
        self.env.gridware_root.join("etc").join("whitelist.yml")
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.env.gridware_root.join("etc").join("package-requests")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.settings
            .archives_dir
            .clone()
            .unwrap_or_else(|| self.env.gridware_root.join("archives"))
    }

    pub fn log_root(&self) -> PathBuf {
        self.settings
            .log_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/gridware"))
    }

    pub fn global_modulespath(&self) -> PathBuf {
        self.env.cw_root.join("etc").join("modulerc").join("modulespath")
    }

    pub fn user_modulespath(&self) -> Result<PathBuf> {
        Ok(user_home(&self.env)?.join(".modulespath"))
    }

    /// File the installed runtime uses to advertise its dependency script
    /// dialect.
    pub fn dependencies_version_marker(&self) -> PathBuf {
        self.env
            .cw_root
            .join("etc")
            .join("gridware")
            .join("dependencies.version")
    }

    pub fn libexec(&self, tool: &str) -> PathBuf {
        self.env.cw_root.join("libexec").join("share").join(tool)
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(normalize_keys(value))
}

fn from_value(value: Value) -> Result<Settings> {
    if value.is_null() {
        return Ok(Settings::default());
    }
    serde_yaml::from_value(value).context("parsing gridware configuration")
}

/// Strip Ruby-style leading colons from mapping keys (`:repo_paths:`).
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => {
                            Value::String(s.strip_prefix(':').unwrap_or(&s).to_string())
                        }
                        other => other,
                    };
                    (k, normalize_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Merge `second` into `first`: mappings recursively, sequences as an
/// ordered union, scalars replaced unless the new value is null.
pub fn deep_merge(first: &mut Value, second: Value) {
    match (first, second) {
        (Value::Mapping(a), Value::Mapping(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (Value::Sequence(a), Value::Sequence(b)) => {
            for v in b {
                if !a.contains(&v) {
                    a.push(v);
                }
            }
        }
        (_, Value::Null) => {}
        (slot, v) => *slot = v,
    }
}

fn check_user_config(system: &Settings, user: &Settings, user_file: &Path) -> Result<()> {
    let global_names: Vec<String> = system.repo_paths.iter().filter_map(|p| basename(p)).collect();
    for urp in &user.repo_paths {
        if let Some(urn) = basename(urp)
            && global_names.contains(&urn)
        {
            return Err(GridwareError::Configuration(format!(
                "User repo {} conflicts with system-wide repo with the same name ({}). Please correct your configuration in {}.",
                urp.display(),
                urn,
                user_file.display()
            ))
            .into());
        }
    }
    Ok(())
}

fn basename(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

fn user_home(env: &Environment) -> Result<PathBuf> {
    match env.userspace.as_deref() {
        Some(user) if !user.is_empty() => nix::unistd::User::from_name(user)
            .context("looking up userspace user")?
            .map(|u| u.dir)
            .ok_or_else(|| {
                GridwareError::Configuration(format!("Unknown userspace user: {user}")).into()
            }),
        _ => dirs::home_dir().context("Unable to determine user home directory"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_defaults_from_empty_file() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.update_period_hours, 24);
    }

    #[test]
    fn test_load_system_config_with_symbol_keys() {
        let dir = TempDir::new().unwrap();
        let env = testing::env_in(dir.path(), "el7");
        fs::create_dir_all(env.cw_root.join("etc")).unwrap();
        fs::write(
            env.cw_root.join("etc").join("gridware.yml"),
            ":repo_paths:\n  - /srv/repos/main\n  - /srv/repos/volatile\n:update_period_hours: 2\n",
        )
        .unwrap();

        let config = Config::load_for(env).unwrap();
        assert_eq!(
            config.settings.repo_paths,
            vec![PathBuf::from("/srv/repos/main"), PathBuf::from("/srv/repos/volatile")]
        );
        assert_eq!(config.update_period(), chrono::Duration::hours(2));
    }

    #[test]
    fn test_distro_specific_config_preferred() {
        let dir = TempDir::new().unwrap();
        let env = testing::env_in(dir.path(), "el7");
        let etc = env.cw_root.join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("gridware.yml"), "repo_paths: [/generic]\n").unwrap();
        fs::write(etc.join("gridware.el7.yml"), "repo_paths: [/specific]\n").unwrap();

        let config = Config::load_for(env).unwrap();
        assert_eq!(config.settings.repo_paths, vec![PathBuf::from("/specific")]);
    }

    #[test]
    fn test_default_repo_path_when_unconfigured() {
        let dir = TempDir::new().unwrap();
        let env = testing::env_in(dir.path(), "el7");
        let config = Config::load_for(env.clone()).unwrap();
        assert_eq!(
            config.settings.repo_paths,
            vec![env.cw_root.join("var/lib/gridware/repos/main")]
        );
    }

    #[test]
    fn test_user_repo_collision_rejected() {
        let system = Settings {
            repo_paths: vec![PathBuf::from("/opt/repos/main")],
            ..Settings::default()
        };
        let user = Settings {
            repo_paths: vec![PathBuf::from("/home/alice/repos/main")],
            ..Settings::default()
        };
        let err = check_user_config(&system, &user, Path::new("gridware.yml")).unwrap_err();
        assert!(err.to_string().contains("conflicts with system-wide repo"));

        let user = Settings {
            repo_paths: vec![PathBuf::from("/home/alice/repos/mine")],
            ..Settings::default()
        };
        assert!(check_user_config(&system, &user, Path::new("gridware.yml")).is_ok());
    }

    #[test]
    fn test_deep_merge_unions_sequences() {
        let mut a: Value = serde_yaml::from_str("repo_paths: [/a]\nfetch_timeout: 10\n").unwrap();
        let b: Value =
            serde_yaml::from_str("repo_paths: [/a, /b]\nfetch_timeout: 30\nlog_root: ~\n").unwrap();
        deep_merge(&mut a, b);
        let s: Settings = serde_yaml::from_value(a).unwrap();
        assert_eq!(s.repo_paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(s.fetch_timeout, 30);
        assert_eq!(s.log_root, None);
    }

    #[test]
    fn test_depot_layout_paths() {
        let dir = TempDir::new().unwrap();
        let config = testing::config_in(dir.path(), "el7");
        let root = dir.path().join("gridware");
        assert_eq!(config.modules_dir("local"), root.join("local/el7/etc/modules"));
        assert_eq!(config.packages_dir("local"), root.join("local/el7/pkg"));
        assert_eq!(config.dependencies_dir("local"), root.join("local/el7/etc/depends"));
        assert_eq!(config.package_db_path("local"), root.join("local/el7/etc/packages.db"));
        assert_eq!(config.requests_dir(), root.join("etc/package-requests"));
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_from_process_env() {
        let vars = [
            ("cw_DIST", "ubuntu1604"),
            ("cw_ROOT", "/srv/clusterware"),
            ("cw_GRIDWARE_root", "/srv/gridware"),
            ("cw_GRIDWARE_notify", "true"),
            ("_LMFILES_", "/srv/gridware/local/el7/etc/modules/apps/foo/1.0/gcc::/x"),
        ];
        // SAFETY: serialized with every other test touching the environment.
        unsafe {
            for (key, value) in vars {
                env::set_var(key, value);
            }
            env::remove_var("cw_GRIDWARE_userspace");
        }
        let env = Environment::from_env().unwrap();
        unsafe {
            for (key, _) in vars {
                env::remove_var(key);
            }
        }

        assert_eq!(env.distro.id(), "ubuntu1604");
        assert_eq!(env.cw_root, PathBuf::from("/srv/clusterware"));
        assert_eq!(env.gridware_root, PathBuf::from("/srv/gridware"));
        assert!(env.notify);
        assert!(env.userspace.is_none());
        assert_eq!(env.loaded_modules.len(), 2);
    }
}
