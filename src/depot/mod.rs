//! Depots: named, relocatable install trees.
//!
//! `<root>/<name>` is a symlink to the physical tree `<root>/depots/<id>`.
//! A global depot may carry a `.gridware-userspace` link redirecting it to a
//! per-user location.

pub mod exporter;
pub mod module_tree;
pub mod modulespath;

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::exec::CommandRunner;
use crate::common::paths::remove_path;
use crate::config::Config;
use crate::error::GridwareError;
use crate::ui::prelude::*;
use modulespath::ModulesPath;

pub const USERSPACE_LINK: &str = ".gridware-userspace";
const RESERVED_NAMES: [&str; 2] = ["depots", "etc"];
const ID_LENGTH: usize = 8;

pub const PURGE_REFUSED: &str =
    "Refusing to purge non-interactively; supply the --yes option to override";

fn read_link_absolute(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    if target.is_absolute() {
        Some(target)
    } else {
        link.parent().map(|p| p.join(target))
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

/// Physical location of depot `name`. With `global`, a userspace redirect
/// wins over the depot link itself.
pub fn hash_path_for(config: &Config, name: &str, global: bool) -> Option<PathBuf> {
    let link = config.depot_link(name);
    let userspace = link.join(USERSPACE_LINK);
    if global && is_symlink(&userspace) {
        read_link_absolute(&userspace)
    } else if is_symlink(&link) {
        read_link_absolute(&link)
    } else {
        None
    }
}

/// Names of all depots, sorted.
pub fn list(config: &Config) -> Result<Vec<String>> {
    let root = config.depot_root();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| is_symlink(&e.path()))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| !RESERVED_NAMES.contains(&n.as_str()))
        .collect();
    names.sort();
    Ok(names)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Remove without asking.
    Force,
    /// Ask before removing.
    Interactive,
    /// No way to ask; refuse.
    NonInteractive,
}

#[derive(Debug, Clone)]
pub struct Depot<'a> {
    config: &'a Config,
    pub name: String,
}

impl<'a> Depot<'a> {
    pub fn find(config: &'a Config, name: &str) -> Option<Depot<'a>> {
        if RESERVED_NAMES.contains(&name) || !is_symlink(&config.depot_link(name)) {
            return None;
        }
        Some(Depot {
            config,
            name: name.to_string(),
        })
    }

    /// Like [`Depot::find`], failing with `NotFound`.
    pub fn get(config: &'a Config, name: &str) -> Result<Depot<'a>> {
        Self::find(config, name)
            .ok_or_else(|| GridwareError::NotFound(format!("Depot not found: {name}")).into())
    }

    /// Like [`Depot::get`], also failing when the depot is not on the module
    /// search path.
    pub fn get_enabled(config: &'a Config, name: &str) -> Result<Depot<'a>> {
        let depot = Self::get(config, name)?;
        if !depot.is_enabled()? {
            return Err(GridwareError::DepotDisabled(name.to_string()).into());
        }
        Ok(depot)
    }

    /// Create the storage tree and the depot link. The depot starts disabled.
    pub fn create(config: &'a Config, name: &str) -> Result<Depot<'a>> {
        if RESERVED_NAMES.contains(&name) || name.contains('/') || name.is_empty() {
            return Err(GridwareError::Configuration(format!("Invalid depot name: {name}")).into());
        }
        let link = config.depot_link(name);
        if fs::symlink_metadata(&link).is_ok() {
            return Err(GridwareError::AlreadyExists(format!("depot {name}")).into());
        }

        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_LENGTH)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let storage = config.depot_storage_root().join(&id);
        let dist = storage.join(config.dist());
        for dir in [
            dist.join("etc").join("modules"),
            dist.join("etc").join("depends"),
            dist.join("pkg"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        std::os::unix::fs::symlink(&storage, &link)
            .with_context(|| format!("linking {} to {}", link.display(), storage.display()))?;
        emit(
            Level::Debug,
            "depot.create",
            &format!("Created depot {name} at {}", storage.display()),
            None,
        );
        Ok(Depot {
            config,
            name: name.to_string(),
        })
    }

    pub fn link(&self) -> PathBuf {
        self.config.depot_link(&self.name)
    }

    pub fn hash_path(&self, global: bool) -> Option<PathBuf> {
        hash_path_for(self.config, &self.name, global)
    }

    /// Storage path package files are relocated to.
    pub fn install_path(&self) -> Result<PathBuf> {
        self.hash_path(true).ok_or_else(|| {
            GridwareError::NotFound(format!("Depot not found: {}", self.name)).into()
        })
    }

    /// Module search-path entry, with the distro left for the shell to expand.
    pub fn target(&self) -> String {
        format!("{}/$cw_DIST/etc/modules", self.link().display())
    }

    fn global_modulespath(&self) -> ModulesPath {
        ModulesPath::new(self.config.global_modulespath())
    }

    /// The search-path file this process may edit.
    fn own_modulespath(&self) -> Result<ModulesPath> {
        if self.config.is_userspace() {
            Ok(ModulesPath::new(self.config.user_modulespath()?))
        } else {
            Ok(self.global_modulespath())
        }
    }

    pub fn is_enabled(&self) -> Result<bool> {
        let target = self.target();
        if self.global_modulespath().contains(&target)? {
            return Ok(true);
        }
        if self.config.is_userspace() {
            return self.own_modulespath()?.contains(&target);
        }
        Ok(false)
    }

    /// Currently loaded module files provided by this depot.
    pub fn loaded_modules(&self) -> Vec<String> {
        let prefix = self.link().to_string_lossy().to_string();
        self.config
            .env
            .loaded_modules
            .iter()
            .filter(|m| m.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn enable(&self, runner: &impl CommandRunner) -> Result<()> {
        if self.is_enabled()? {
            emit(
                Level::Warn,
                "depot.enable.already",
                &format!("WARNING! Depot already enabled: {}", self.name),
                None,
            );
        } else {
            title(&format!("Enabling depot: {}", self.name));
            self.own_modulespath()?.insert(&self.target())?;
            println!("module use {}", self.target());
            status(Level::Success, "depot.enable.ok", "Enable", "OK");
        }
        self.notify("enabled", runner)
    }

    /// Returns false, changing nothing, while modules from the depot are loaded.
    pub fn disable(&self, runner: &impl CommandRunner) -> Result<bool> {
        if !self.is_enabled()? {
            emit(
                Level::Warn,
                "depot.disable.already",
                &format!("WARNING! Depot already disabled: {}", self.name),
                None,
            );
        } else {
            let loaded = self.loaded_modules();
            if !loaded.is_empty() {
                let mut msg = String::from(
                    "ERROR: The following modules have been loaded from this depot and must be unloaded to continue:\n",
                );
                for module in &loaded {
                    msg.push_str(&format!("\n - {module}"));
                }
                emit(
                    Level::Error,
                    "depot.disable.loaded",
                    &msg,
                    Some(serde_json::json!({ "modules": loaded })),
                );
                return Ok(false);
            }
            title(&format!("Disabling depot: {}", self.name));
            self.own_modulespath()?.remove(&self.target())?;
            println!("module unuse {}", self.target());
            status(Level::Success, "depot.disable.ok", "Disable", "OK");
        }
        self.notify("disabled", runner)?;
        Ok(true)
    }

    /// Paths a purge removes, in removal order.
    pub fn purge_targets(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in [
            self.hash_path(false),
            Some(self.link()),
            self.hash_path(true),
        ]
        .into_iter()
        .flatten()
        {
            if !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }

    /// Remove the depot. Returns false if the caller declined.
    pub fn purge(
        &self,
        mode: PurgeMode,
        confirm: impl FnOnce(&str) -> Result<bool>,
        runner: &impl CommandRunner,
    ) -> Result<bool> {
        emit(
            Level::Info,
            "depot.purge.start",
            &format!("Purging depot: {}", self.name),
            None,
        );
        let files = self.purge_targets();
        match mode {
            PurgeMode::Force => {}
            PurgeMode::NonInteractive => {
                return Err(GridwareError::PermissionDenied(PURGE_REFUSED.to_string()).into());
            }
            PurgeMode::Interactive => {
                let listing = files
                    .iter()
                    .map(|f| format!("  {}", f.display()))
                    .collect::<Vec<_>>()
                    .join("\n");
                let msg = format!(
                    "Purge operation will remove the following files/directories:\n{listing}\n"
                );
                if !confirm(&msg)? {
                    return Ok(false);
                }
            }
        }

        if self.is_enabled()? && !self.disable(runner)? {
            return Ok(false);
        }
        title("Removing depot");
        for file in &files {
            remove_path(file)?;
        }
        status(Level::Success, "depot.purge.ok", "Purge", "OK");
        Ok(true)
    }

    fn notify(&self, state: &str, runner: &impl CommandRunner) -> Result<()> {
        if self.config.is_userspace() || !self.config.env.notify {
            return Ok(());
        }
        let Some(storage) = self.hash_path(false) else {
            return Ok(());
        };
        let id = storage
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let hook = self.config.libexec("trigger-depot-event");
        let hook = hook.to_string_lossy();
        let install_path = self.config.depot_storage_root().join(&id);
        for args in [
            vec![
                "nfs-export".to_string(),
                install_path.to_string_lossy().to_string(),
            ],
            vec![
                "gridware-depots".to_string(),
                format!("{id}:{}:{state}", self.name),
            ],
        ] {
            let out = runner.output(&hook, &args)?;
            if !out.success {
                return Err(GridwareError::command_failed(
                    hook.to_string(),
                    "Unable to trigger depot event.",
                )
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Create depot `name` with a fixed storage id.
    pub fn depot_with_id(config: &Config, name: &str, id: &str) -> PathBuf {
        let storage = config.depot_storage_root().join(id);
        let dist = storage.join(config.dist());
        fs::create_dir_all(dist.join("etc/modules")).unwrap();
        fs::create_dir_all(dist.join("etc/depends")).unwrap();
        fs::create_dir_all(dist.join("pkg")).unwrap();
        std::os::unix::fs::symlink(&storage, config.depot_link(name)).unwrap();
        storage
    }

    /// [`depot_with_id`], then put the depot on the global module search path.
    pub fn enabled_depot_with_id(config: &Config, name: &str, id: &str) -> PathBuf {
        let storage = depot_with_id(config, name, id);
        let depot = Depot::get(config, name).unwrap();
        ModulesPath::new(config.global_modulespath())
            .insert(&depot.target())
            .unwrap();
        storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::exec::testing::ScriptedRunner;
    use crate::config::testing::config_in;
    use tempfile::TempDir;

    #[test]
    fn test_create_list_and_find() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "el7");
        let depot = Depot::create(&config, "local").unwrap();
        let storage = depot.hash_path(false).unwrap();
        assert_eq!(storage.parent().unwrap(), config.depot_storage_root());
        assert_eq!(storage.file_name().unwrap().len(), ID_LENGTH);
        assert!(config.modules_dir("local").is_dir());

        fs::create_dir_all(config.depot_root().join("etc")).unwrap();
        assert_eq!(list(&config).unwrap(), vec!["local"]);
        assert!(Depot::find(&config, "depots").is_none());
        assert!(Depot::find(&config, "missing").is_none());
        assert!(Depot::create(&config, "local").is_err());
    }

    #[test]
    fn test_userspace_redirect_wins_when_global() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "el7");
        let storage = testing::depot_with_id(&config, "local", "abcd1234");
        let home = dir.path().join("home/alice/gridware/depots/abcd1234");
        fs::create_dir_all(&home).unwrap();
        std::os::unix::fs::symlink(&home, storage.join(USERSPACE_LINK)).unwrap();

        assert_eq!(hash_path_for(&config, "local", true), Some(home.clone()));
        assert_eq!(hash_path_for(&config, "local", false), Some(storage.clone()));
        let depot = Depot::get(&config, "local").unwrap();
        assert_eq!(
            depot.purge_targets(),
            vec![storage, config.depot_link("local"), home]
        );
    }

    #[test]
    fn test_enable_disable_cycle() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "el7");
        testing::depot_with_id(&config, "local", "abcd1234");
        let modulespath = config.global_modulespath();
        fs::create_dir_all(modulespath.parent().unwrap()).unwrap();
        fs::write(&modulespath, "#=Alces modulespath\n/opt/apps/etc/modules\n").unwrap();

        let runner = ScriptedRunner::new();
        let depot = Depot::get(&config, "local").unwrap();
        assert!(!depot.is_enabled().unwrap());
        depot.enable(&runner).unwrap();
        assert!(depot.is_enabled().unwrap());
        let lines = fs::read_to_string(&modulespath).unwrap();
        assert_eq!(
            lines.lines().nth(1).unwrap(),
            format!("{}/local/$cw_DIST/etc/modules", config.depot_root().display())
        );
        // A second enable only warns.
        depot.enable(&runner).unwrap();
        assert_eq!(fs::read_to_string(&modulespath).unwrap(), lines);

        assert!(depot.disable(&runner).unwrap());
        assert!(!depot.is_enabled().unwrap());
        // No notification without cw_GRIDWARE_notify.
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_disable_refused_while_modules_loaded() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path(), "el7");
        let storage = testing::depot_with_id(&config, "local", "abcd1234");
        config.env.loaded_modules = vec![format!(
            "{}/local/el7/etc/modules/apps/foo/1.0/gcc",
            config.depot_root().display()
        )];
        let runner = ScriptedRunner::new();
        let depot = Depot::get(&config, "local").unwrap();
        depot.enable(&runner).unwrap();

        assert!(!depot.disable(&runner).unwrap());
        assert!(depot.is_enabled().unwrap());
        assert!(!depot
            .purge(PurgeMode::Force, |_| Ok(true), &runner)
            .unwrap());
        assert!(storage.exists());
    }

    #[test]
    fn test_purge_modes() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "el7");
        let storage = testing::depot_with_id(&config, "local", "abcd1234");
        let runner = ScriptedRunner::new();
        let depot = Depot::get(&config, "local").unwrap();

        let err = depot
            .purge(PurgeMode::NonInteractive, |_| Ok(true), &runner)
            .unwrap_err();
        assert_eq!(err.to_string(), PURGE_REFUSED);

        let mut prompt = String::new();
        let declined = depot
            .purge(
                PurgeMode::Interactive,
                |msg| {
                    prompt = msg.to_string();
                    Ok(false)
                },
                &runner,
            )
            .unwrap();
        assert!(!declined);
        assert!(prompt.contains(&storage.display().to_string()));
        assert!(storage.exists());

        assert!(depot.purge(PurgeMode::Force, |_| Ok(false), &runner).unwrap());
        assert!(!storage.exists());
        assert!(fs::symlink_metadata(config.depot_link("local")).is_err());
    }

    #[test]
    fn test_notifications_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path(), "el7");
        config.env.notify = true;
        let storage = testing::depot_with_id(&config, "local", "abcd1234");
        let hook = config.libexec("trigger-depot-event");
        let runner = ScriptedRunner::new()
            .succeed(format!("{} nfs-export {}", hook.display(), storage.display()))
            .succeed(format!("{} gridware-depots abcd1234:local:enabled", hook.display()));
        Depot::get(&config, "local").unwrap().enable(&runner).unwrap();
        assert_eq!(runner.calls().len(), 2);

        let failing = ScriptedRunner::new();
        let err = Depot::get(&config, "local").unwrap().enable(&failing).unwrap_err();
        assert!(err.to_string().contains("Unable to trigger depot event."));
    }
}
