//! Default versions and short aliases for a depot's module files.
//!
//! Module files live at `<type>/<name>/<version>/<tag>` (compilers at
//! `compilers/<name>/<version>`). Every directory below `<type>` gets a
//! `.version` naming its newest child; the root `.modulerc` aliases bare
//! package names to `<type>/<name>` where the name is unambiguous.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::common::version::compare_versions;

const MANAGED_MARKER: &str = "## Managed by gridware";

fn visible_children(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    Ok(names)
}

/// Ours to overwrite: absent, or carrying the marker line.
fn is_managed(file: &Path) -> bool {
    match fs::read_to_string(file) {
        Ok(text) => text.lines().any(|l| l.trim() == MANAGED_MARKER),
        Err(_) => true,
    }
}

fn write_managed(file: &Path, body: &str) -> Result<bool> {
    if !is_managed(file) {
        return Ok(false);
    }
    let text = format!("#%Module1.0\n{MANAGED_MARKER}\n{body}");
    if fs::read_to_string(file).is_ok_and(|existing| existing == text) {
        return Ok(false);
    }
    fs::write(file, text).with_context(|| format!("writing {}", file.display()))?;
    Ok(true)
}

/// Write `.version` files; returns how many changed.
pub fn write_defaults(modules_dir: &Path) -> Result<usize> {
    if !modules_dir.is_dir() {
        return Ok(0);
    }
    let mut written = 0;
    for entry in WalkDir::new(modules_dir)
        .min_depth(2)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let mut children = visible_children(entry.path())?;
        children.sort_by(|a, b| compare_versions(a, b));
        if let Some(latest) = children.last()
            && write_managed(
                &entry.path().join(".version"),
                &format!("set ModulesVersion \"{latest}\"\n"),
            )?
        {
            written += 1;
        }
    }
    Ok(written)
}

/// Write the alias file mapping `<name>` to `<type>/<name>`.
pub fn write_aliases(modules_dir: &Path) -> Result<bool> {
    if !modules_dir.is_dir() {
        return Ok(false);
    }
    let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for kind in visible_children(modules_dir)? {
        let kind_dir = modules_dir.join(&kind);
        if !kind_dir.is_dir() {
            continue;
        }
        for name in visible_children(&kind_dir)? {
            owners.entry(name).or_default().push(kind.clone());
        }
    }

    let mut body = String::new();
    for (name, kinds) in owners {
        if let [kind] = kinds.as_slice() {
            body.push_str(&format!("module-alias {name} {kind}/{name}\n"));
        }
    }
    write_managed(&modules_dir.join(".modulerc"), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#%Module1.0\n").unwrap();
    }

    #[test]
    fn test_defaults_pick_newest_version() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "apps/hdf5/1.8.9/gcc-4.8.5");
        touch(root, "apps/hdf5/1.10.0/gcc-4.8.5");
        touch(root, "compilers/gcc/5.3.0");

        assert!(write_defaults(root).unwrap() >= 3);
        assert!(
            fs::read_to_string(root.join("apps/hdf5/.version"))
                .unwrap()
                .contains("set ModulesVersion \"1.10.0\"")
        );
        assert!(
            fs::read_to_string(root.join("apps/hdf5/1.10.0/.version"))
                .unwrap()
                .contains("\"gcc-4.8.5\"")
        );
        assert!(
            fs::read_to_string(root.join("compilers/gcc/.version"))
                .unwrap()
                .contains("\"5.3.0\"")
        );
        // Rewriting an unchanged tree changes nothing.
        assert_eq!(write_defaults(root).unwrap(), 0);
    }

    #[test]
    fn test_user_defaults_are_preserved() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "apps/hdf5/1.8.9/gcc");
        touch(root, "apps/hdf5/1.10.0/gcc");
        fs::write(root.join("apps/hdf5/.version"), "#%Module1.0\nset ModulesVersion \"1.8.9\"\n").unwrap();
        write_defaults(root).unwrap();
        assert!(
            fs::read_to_string(root.join("apps/hdf5/.version"))
                .unwrap()
                .contains("1.8.9")
        );
    }

    #[test]
    fn test_aliases_skip_ambiguous_names() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "apps/hdf5/1.8.9/gcc");
        touch(root, "apps/fftw/3.3/gcc");
        touch(root, "libs/fftw/3.3/gcc");
        assert!(write_aliases(root).unwrap());
        let rc = fs::read_to_string(root.join(".modulerc")).unwrap();
        assert!(rc.contains("module-alias hdf5 apps/hdf5\n"));
        assert!(!rc.contains("fftw"));
    }
}
