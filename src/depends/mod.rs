//! Distro-level dependencies: script generation, the whitelist and the
//! installer that honours it.

pub mod installer;
pub mod requests;
pub mod script;
pub mod whitelist;

use anyhow::Result;
use serde_yaml::Value;
use std::path::PathBuf;

use crate::common::distro::Distro;
use crate::common::shell::current_exe_path;
use crate::config::Config;
use crate::repo::{Definition, Phase};
pub use whitelist::{Whitelist, WhitelistStore};

/// Shared state for dependency handling, constructed once per command.
pub struct DependencyUtils {
    distro: Distro,
    userspace: Option<String>,
    runtime_marker: PathBuf,
    program: String,
    whitelist: WhitelistStore,
}

impl DependencyUtils {
    pub fn new(config: &Config) -> Self {
        DependencyUtils {
            distro: config.env.distro.clone(),
            userspace: config.env.userspace.clone(),
            runtime_marker: config.dependencies_version_marker(),
            program: current_exe_path(),
            whitelist: WhitelistStore::new(config.whitelist_path()),
        }
    }

    pub fn distro(&self) -> &Distro {
        &self.distro
    }

    pub fn whitelist(&self) -> &WhitelistStore {
        &self.whitelist
    }

    pub fn generate_dependency_script(&self, defn: &Definition, phase: Phase) -> Result<String> {
        let packages = required_distro_packages(defn, phase, &self.distro);
        script::render(&script::ScriptContext {
            program: &self.program,
            definition_path: &defn.path(),
            phase,
            userspace: self.userspace.as_deref(),
            runtime_marker: &self.runtime_marker,
            packages: &packages,
            commands: self.distro.family().commands(),
        })
    }
}

fn names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(crate::repo::definition::scalar_to_string)
            .collect(),
        Some(other) => crate::repo::definition::scalar_to_string(other)
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

/// Distro package names a definition needs for `phase`.
///
/// A `dependencies` mapping keyed by phase contributes that phase (plus
/// `runtime` when building); otherwise the whole mapping applies. Within
/// each, both the family stem (`el`) and the exact distro id (`el7`) count.
pub fn required_distro_packages(defn: &Definition, phase: Phase, distro: &Distro) -> Vec<String> {
    let Some(deps) = &defn.metadata.dependencies else {
        return Vec::new();
    };

    let mut hashes: Vec<&Value> = Vec::new();
    match deps.get(phase.as_str()) {
        Some(for_phase) => {
            hashes.push(for_phase);
            if phase == Phase::Build
                && let Some(runtime) = deps.get(Phase::Runtime.as_str())
            {
                hashes.push(runtime);
            }
        }
        None => {
            // The whole mapping is keyed by distro.
            return dedup(
                names(deps.get(distro.family().stem()))
                    .into_iter()
                    .chain(names(deps.get(distro.id())))
                    .collect(),
            );
        }
    }

    let mut packages = Vec::new();
    for hash in hashes {
        if let Value::Mapping(m) = hash {
            packages.extend(names(m.get(distro.family().stem())));
            packages.extend(names(m.get(distro.id())));
        }
    }
    dedup(packages)
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

/// Drop the variant from the name component: `type/name_variant/version[/...]`
/// becomes `type/name/version[/...]`. Also returns the variant.
pub fn strip_variant(path: &str) -> (String, Option<String>) {
    let mut parts: Vec<String> = path.split('/').map(str::to_string).collect();
    if parts.len() >= 3
        && let Some(idx) = parts[1].rfind('_')
        && idx > 0
    {
        let variant = parts[1][idx + 1..].to_string();
        parts[1].truncate(idx);
        return (parts.join("/"), Some(variant));
    }
    (path.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::definition::testing::definition;

    fn el7() -> Distro {
        Distro::parse("el7").unwrap()
    }

    #[test]
    fn test_phase_keyed_dependencies() {
        let defn = definition(
            "main",
            "libs",
            "hdf5",
            "1.8.17",
            r#"
dependencies:
  build:
    el: [zlib-devel, cmake]
    el7: cmake3
  runtime:
    el: [zlib]
    ubuntu1604: [zlib1g]
"#,
        );
        assert_eq!(
            required_distro_packages(&defn, Phase::Build, &el7()),
            vec!["zlib-devel", "cmake", "cmake3", "zlib"]
        );
        assert_eq!(
            required_distro_packages(&defn, Phase::Runtime, &el7()),
            vec!["zlib"]
        );
        assert_eq!(
            required_distro_packages(&defn, Phase::Runtime, &Distro::parse("ubuntu1604").unwrap()),
            vec!["zlib1g"]
        );
    }

    #[test]
    fn test_flat_dependencies_apply_to_every_phase() {
        let defn = definition(
            "main",
            "apps",
            "foo",
            "1.0",
            "dependencies:\n  el: [glibc, glibc]\n  el7: [libX11]\n",
        );
        assert_eq!(
            required_distro_packages(&defn, Phase::Runtime, &el7()),
            vec!["glibc", "libX11"]
        );
        assert_eq!(
            required_distro_packages(&defn, Phase::Build, &el7()),
            vec!["glibc", "libX11"]
        );
    }

    #[test]
    fn test_strip_variant() {
        assert_eq!(
            strip_variant("apps/hdf5_mpi/1.8.17"),
            ("apps/hdf5/1.8.17".to_string(), Some("mpi".to_string()))
        );
        assert_eq!(
            strip_variant("apps/hdf5_mpi/1.8.17/gcc-4.8.5"),
            ("apps/hdf5/1.8.17/gcc-4.8.5".to_string(), Some("mpi".to_string()))
        );
        assert_eq!(strip_variant("apps/hdf5/1.8.17"), ("apps/hdf5/1.8.17".to_string(), None));
        assert_eq!(strip_variant("hdf5_mpi"), ("hdf5_mpi".to_string(), None));
    }
}
