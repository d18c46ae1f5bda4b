//! Depot and package export.
//!
//! Exporting is import in reverse: installed files are staged, references to
//! the depot's physical path are turned back into placeholders, and the result
//! is packed as an importable archive.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::Depot;
use crate::common::exec::CommandRunner;
use crate::common::paths::copy_recursively;
use crate::common::progress::with_spinner;
use crate::depends::strip_variant;
use crate::engine::Engine;
use crate::error::GridwareError;
use crate::import::{ArchiveMetadata, Tagging, archive_name, extract, relocate};
use crate::package::{Package, PackageDb};
use crate::repo::{Definition, Phase};
use crate::ui::prelude::*;

const SYSTEM_COMPILER: &str = "compilers/gcc/system";

const REGION_MAP: [(&str, &str); 14] = [
    ("eu-west-1", "https://s3-eu-west-1.amazonaws.com/alces-gridware-eu-west-1/dist"),
    ("eu-west-2", "https://s3-eu-west-1.amazonaws.com/alces-gridware-eu-west-1/dist"),
    ("eu-central-1", "https://s3-eu-central-1.amazonaws.com/alces-gridware-eu-central-1/dist"),
    ("us-east-1", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
    ("us-east-2", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
    ("us-west-1", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
    ("us-west-2", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
    ("ap-northeast-1", "https://s3-ap-southeast-2.amazonaws.com/alces-gridware-ap-southeast-2/dist"),
    ("ap-northeast-2", "https://s3-ap-southeast-2.amazonaws.com/alces-gridware-ap-southeast-2/dist"),
    ("ap-southeast-1", "https://s3-ap-southeast-2.amazonaws.com/alces-gridware-ap-southeast-2/dist"),
    ("ap-southeast-2", "https://s3-ap-southeast-2.amazonaws.com/alces-gridware-ap-southeast-2/dist"),
    ("ap-south-1", "https://s3-ap-southeast-2.amazonaws.com/alces-gridware-ap-southeast-2/dist"),
    ("sa-east-1", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
    ("ca-central-1", "https://s3.amazonaws.com/alces-gridware-us-east-1/dist"),
];

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Defaults to `/tmp/<depot>`.
    pub output: Option<PathBuf>,
    /// Write an archive per content entry, not just the manifest.
    pub packages: bool,
}

/// The `<depot>.yml` manifest describing an exported depot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepotManifest {
    pub title: String,
    pub summary: String,
    pub description: String,
    pub region_map: BTreeMap<String, String>,
    pub content: Vec<String>,
}

impl DepotManifest {
    fn new(name: &str, content: Vec<String>) -> Self {
        DepotManifest {
            title: name.to_string(),
            summary: format!("Summary of {name}"),
            description: format!("Description of {name}"),
            region_map: REGION_MAP
                .iter()
                .map(|(region, url)| (region.to_string(), url.to_string()))
                .collect(),
            content,
        }
    }
}

/// The one definition an installed package path refers to.
pub fn definition_for_entry<'e, R: CommandRunner>(engine: &'e Engine<R>, entry: &str) -> Result<&'e Definition> {
    let (path, _) = strip_variant(entry);
    let found = engine.find_definitions(&path)?;
    match found.as_slice() {
        [only] => Ok(*only),
        [] => Err(GridwareError::NotFound(format!("No package definition found: {path}")).into()),
        _ => Err(GridwareError::Ambiguous(found.iter().map(|d| d.path()).collect()).into()),
    }
}

fn push_unique(content: &mut Vec<String>, entry: String) {
    if !content.contains(&entry) {
        content.push(entry);
    }
}

/// Export depot `name`: the manifest, and with `packages` an archive for every
/// installed package and its runtime requirements.
pub fn export_depot<R: CommandRunner>(engine: &Engine<R>, name: &str, options: &ExportOptions) -> Result<PathBuf> {
    let depot = Depot::get(&engine.config, name)?;
    title(&format!("Exporting depot: {}", depot.name));
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("/tmp").join(&depot.name));
    if output.exists() {
        return Err(GridwareError::AlreadyExists(format!(
            "output directory {}",
            output.display()
        ))
        .into());
    }

    let mut content = Vec::new();
    for package in engine.package_db(&depot.name)?.all()? {
        if package.path() == SYSTEM_COMPILER {
            continue;
        }
        let defn = definition_for_entry(engine, &package.base_path())?;
        push_unique(&mut content, package.base_path());
        for node in engine.requirements_tree(defn, Phase::Runtime, &depot.name)? {
            match node.installed {
                Some(required) => push_unique(&mut content, required.base_path()),
                None => emit(
                    Level::Warn,
                    "depot.export.missing",
                    &format!(
                        "Requirement {} of {} is not installed in depot '{}'",
                        node.requirement,
                        package.base_path(),
                        depot.name
                    ),
                    None,
                ),
            }
        }
    }

    if options.packages {
        let dist = output.join("dist");
        fs::create_dir_all(&dist).with_context(|| format!("creating directory {}", dist.display()))?;
        let exporter = ArchiveExporter::new(engine, &depot)?;
        for entry in &content {
            exporter.export(entry, &dist)?;
        }
    } else {
        fs::create_dir_all(&output).with_context(|| format!("creating directory {}", output.display()))?;
    }

    let manifest_file = output.join(format!("{}.yml", depot.name));
    let manifest = serde_yaml::to_string(&DepotManifest::new(&depot.name, content))?;
    fs::write(&manifest_file, manifest).with_context(|| format!("writing {}", manifest_file.display()))?;
    emit(
        Level::Success,
        "depot.export.complete",
        &format!("Export of depot '{}' complete: {}", depot.name, output.display()),
        None,
    );
    Ok(output)
}

/// Packs installed packages of one depot into importable archives.
pub struct ArchiveExporter<'a, R: CommandRunner> {
    engine: &'a Engine<R>,
    depot: String,
    depot_path: PathBuf,
    db: PackageDb,
}

impl<'a, R: CommandRunner> ArchiveExporter<'a, R> {
    pub fn new(engine: &'a Engine<R>, depot: &Depot<'_>) -> Result<Self> {
        Ok(ArchiveExporter {
            engine,
            depot: depot.name.clone(),
            depot_path: depot.install_path()?,
            db: engine.package_db(&depot.name)?,
        })
    }

    /// The one installed package (`type/name[_variant]/version`) that
    /// `pattern` names. `*` matches any run of characters and a bare prefix
    /// matches everything under it; an exact entry wins over prefix matches.
    pub fn resolve_entry(&self, pattern: &str) -> Result<String> {
        let mut entries: Vec<String> = self
            .db
            .matching(&pattern.replace('*', "%"))?
            .iter()
            .map(Package::base_path)
            .collect();
        entries.sort();
        entries.dedup();
        if entries.iter().any(|e| e == pattern) {
            return Ok(pattern.to_string());
        }
        match entries.as_slice() {
            [] => Err(GridwareError::NotFound(format!(
                "No installed package matches {pattern} in depot '{}'",
                self.depot
            ))
            .into()),
            [only] => Ok(only.clone()),
            _ => Err(GridwareError::Ambiguous(entries).into()),
        }
    }

    /// Export `entry` (`type/name[_variant]/version`, every tagging of it)
    /// into `output_dir`. Returns the archive path.
    pub fn export(&self, entry: &str, output_dir: &Path) -> Result<PathBuf> {
        let installed: Vec<Package> = self
            .db
            .all()?
            .into_iter()
            .filter(|p| p.base_path() == entry)
            .collect();
        let Some(first) = installed.first() else {
            return Err(GridwareError::NotFound(format!(
                "Package {entry} is not installed in depot '{}'",
                self.depot
            ))
            .into());
        };

        let requirements = definition_for_entry(self.engine, entry)
            .map(|d| d.requirements(Phase::Runtime))
            .unwrap_or_default();
        let mut metadata = ArchiveMetadata {
            kind: first.kind.clone(),
            name: first.name.clone(),
            version: Some(first.version.clone()),
            distro: self.engine.config.dist().to_string(),
            variant: first.variant.clone(),
            taggings: Vec::new(),
            rewritten: None,
        };

        let staging = tempfile::Builder::new()
            .prefix("gridware-export.")
            .tempdir()
            .context("creating export directory")?;
        let root = staging.path().join(self.engine.config.dist());

        with_spinner(format!("Exporting {entry}"), || -> Result<()> {
            if first.is_compiler() {
                metadata.rewritten = Some(self.stage_compiler(&metadata, &root)?);
            } else {
                for package in &installed {
                    let tag = package.tag.clone().unwrap_or_default();
                    let rewritten = self.stage_tagging(&metadata, &tag, &root)?;
                    metadata.taggings.push(Tagging {
                        tag,
                        compiler_tag: package.compiler_tag.clone(),
                        requirements: requirements.clone(),
                        rewritten: Some(rewritten),
                    });
                }
            }
            let yaml = serde_yaml::to_string(&metadata)?;
            fs::write(staging.path().join("metadata.yml"), yaml).context("writing archive metadata")?;

            fs::create_dir_all(output_dir)
                .with_context(|| format!("creating directory {}", output_dir.display()))?;
            Ok(())
        })?;

        let archive = output_dir.join(archive_name(
            &metadata.kind,
            &metadata.name,
            metadata.variant.as_deref(),
            metadata.version(),
            &metadata.distro,
        ));
        with_spinner("Packing", || extract::pack_tar_gz(staging.path(), &archive))?;
        status(Level::Success, "depot.export.package", entry, "OK");
        Ok(archive)
    }

    fn stage_tagging(&self, metadata: &ArchiveMetadata, tag: &str, root: &Path) -> Result<Vec<String>> {
        let config = &self.engine.config;
        let package_path = metadata.package_path();

        let module = root.join("etc/modules").join(&package_path).join(tag);
        self.stage_module(&config.modules_dir(&self.depot).join(&package_path).join(tag), &module)?;

        let depends = format!("{}-{}.sh", metadata.depends_stem(), tag);
        self.stage_depends(&depends, root)?;

        let pkg_dir = root.join("pkg").join(&package_path).join(tag);
        self.stage_payload(&config.packages_dir(&self.depot).join(&package_path).join(tag), &pkg_dir)
    }

    fn stage_compiler(&self, metadata: &ArchiveMetadata, root: &Path) -> Result<Vec<String>> {
        let config = &self.engine.config;
        let modules = config.modules_dir(&self.depot);
        let (name, version) = (&metadata.name, metadata.version());

        self.stage_module(
            &modules.join("compilers").join(name).join(version),
            &root.join("etc/modules/compilers").join(name).join(version),
        )?;
        let lib_module = modules.join("libs").join(name).join(version);
        if lib_module.exists() {
            self.stage_module(&lib_module, &root.join("etc/modules/libs").join(name).join(version))?;
        }
        self.stage_depends(&format!("{}.sh", metadata.depends_stem()), root)?;
        self.stage_payload(
            &config.packages_dir(&self.depot).join("compilers").join(name).join(version),
            &root.join("pkg/compilers").join(name).join(version),
        )
    }

    fn stage_module(&self, installed: &Path, staged: &Path) -> Result<()> {
        if !installed.is_file() {
            return Err(GridwareError::NotFound(format!(
                "Module file not found: {}",
                installed.display()
            ))
            .into());
        }
        copy_into(installed, staged)?;
        relocate::rewrite_text(staged, &self.depot_path.to_string_lossy(), relocate::DEPOT_TOKEN)?;
        Ok(())
    }

    fn stage_depends(&self, file_name: &str, root: &Path) -> Result<()> {
        let installed = self.engine.config.dependencies_dir(&self.depot).join(file_name);
        if installed.is_file() {
            copy_into(&installed, &root.join("etc/depends").join(file_name))?;
        }
        Ok(())
    }

    /// Copy a payload tree and unrelocate it, returning the files that
    /// referenced the depot (relative to the tree).
    fn stage_payload(&self, installed: &Path, staged: &Path) -> Result<Vec<String>> {
        if !installed.is_dir() {
            return Err(GridwareError::NotFound(format!(
                "Package directory not found: {}",
                installed.display()
            ))
            .into());
        }
        copy_into(installed, staged)?;

        let mut rewritten = Vec::new();
        for entry in WalkDir::new(staged).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && relocate::unrelocate_file(entry.path(), &self.depot_path)? {
                let relative = entry.path().strip_prefix(staged)?;
                rewritten.push(relative.to_string_lossy().to_string());
            }
        }
        Ok(rewritten)
    }
}

fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;
    }
    copy_recursively(from, to)
}
