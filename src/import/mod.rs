//! Binary archive import.
//!
//! An archive is a gzip tarball holding `metadata.yml` and a depot fragment
//! (`<dist>/etc/modules`, `<dist>/pkg`, `<dist>/etc/depends`) whose paths
//! are written against placeholders. Importing relocates the fragment to a
//! depot, records the packages and runs their dependency scripts.

pub mod extract;
pub mod fetch;
pub mod relocate;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::common::exec::CommandRunner;
use crate::common::paths::move_path;
use crate::common::progress::with_spinner;
use crate::config::{Config, normalize_keys};
use crate::depends::DependencyUtils;
use crate::depot::{Depot, module_tree};
use crate::error::GridwareError;
use crate::package::{Package, PackageDb, Requirement};
use crate::repo::{Definition, Phase};
use crate::ui::prelude::*;

/// One compiler-tag/variant build inside an archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tagging {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler_tag: Option<String>,
    pub requirements: Vec<String>,
    /// Payload files (relative to the tagging's payload dir) that embed the
    /// install prefix; absent means every file is checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(deserialize_with = "crate::repo::definition::scalar_string")]
    pub version: Option<String>,
    pub distro: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taggings: Vec<Tagging>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten: Option<Vec<String>>,
}

impl ArchiveMetadata {
    pub fn load(dir: &Path) -> Result<Self> {
        let file = dir.join("metadata.yml");
        if !file.exists() {
            return Err(GridwareError::Archive("Archive does not contain metadata".into()).into());
        }
        let text = fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", file.display()))?;
        let metadata: ArchiveMetadata = serde_yaml::from_value(normalize_keys(value))
            .with_context(|| format!("parsing {}", file.display()))?;
        if metadata.kind.is_empty() || metadata.name.is_empty() || metadata.version().is_empty() {
            return Err(GridwareError::Archive(
                "Archive metadata must name a type, name and version".into(),
            )
            .into());
        }
        Ok(metadata)
    }

    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or_default()
    }

    pub fn is_compiler(&self) -> bool {
        self.kind == "compilers"
    }

    fn qualified_name(&self) -> String {
        match self.variant.as_deref() {
            Some(v) if v != "default" => format!("{}_{}", self.name, v),
            _ => self.name.clone(),
        }
    }

    /// `type/name[_variant]/version`
    pub fn package_path(&self) -> String {
        format!("{}/{}/{}", self.kind, self.qualified_name(), self.version())
    }

    /// Prefix shared by this package's dependency scripts.
    pub fn depends_stem(&self) -> String {
        format!("{}-{}-{}", self.kind, self.qualified_name(), self.version())
    }

    fn package(&self, tagging: Option<&Tagging>) -> Package {
        Package {
            kind: self.kind.clone(),
            name: self.name.clone(),
            version: self.version().to_string(),
            compiler_tag: tagging.and_then(|t| t.compiler_tag.clone()),
            variant: self.variant.clone().filter(|v| v != "default"),
            tag: tagging.map(|t| t.tag.clone()).filter(|t| !t.is_empty()),
        }
    }
}

/// `{type}-{name}[_{variant}]-{version}-{dist}.tar.gz`
pub fn archive_name(kind: &str, name: &str, variant: Option<&str>, version: &str, dist: &str) -> String {
    match variant {
        Some(v) if v != "default" => format!("{kind}-{name}_{v}-{version}-{dist}.tar.gz"),
        _ => format!("{kind}-{name}-{version}-{dist}.tar.gz"),
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub depot: String,
    /// Build missing requirements rather than importing binaries.
    pub compile: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaggingOutcome {
    Exists,
    Unresolved(Vec<String>),
    Imported,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub package_path: String,
    /// Per tagging (the package path itself for compilers).
    pub outcomes: Vec<(String, TaggingOutcome)>,
}

impl ImportReport {
    /// No tagging was left unresolved or failed.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, TaggingOutcome::Exists | TaggingOutcome::Imported))
    }
}

/// Installs a package that an archive requires but the depot lacks.
pub trait RequirementInstaller {
    fn install_requirement(&self, requirement: &Requirement, options: &ImportOptions) -> Result<()>;
}

/// Resolves nothing; used when missing requirements must simply be reported.
pub struct NoInstaller;

impl RequirementInstaller for NoInstaller {
    fn install_requirement(&self, requirement: &Requirement, _: &ImportOptions) -> Result<()> {
        Err(GridwareError::Unresolvable(requirement.to_string()).into())
    }
}

/// Where a fragment's files live and where they go.
struct Layout {
    source: PathBuf,
    modules: PathBuf,
    packages: PathBuf,
    depends: PathBuf,
    depot_path: PathBuf,
}

pub struct Importer<'a, R: CommandRunner> {
    pub config: &'a Config,
    pub utils: &'a DependencyUtils,
    pub runner: &'a R,
    pub installer: &'a dyn RequirementInstaller,
}

impl<R: CommandRunner> Importer<'_, R> {
    pub fn import(
        &self,
        definition: Option<&Definition>,
        location: &str,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        let basename = location.rsplit('/').next().unwrap_or(location);
        emit(Level::Info, "import.start", &format!("Importing {basename}"), None);

        let archive = self.acquire(location)?;

        title("Preparing import");
        let extracted = with_spinner("Extracting", || extract::extract_tar_gz(&archive))?;
        status(Level::Success, "import.extract", "Extract", "OK");

        let metadata = ArchiveMetadata::load(extracted.path())?;
        if metadata.distro != self.config.dist() {
            return Err(GridwareError::IncompatibleEnvironment(format!(
                "Incompatible distro in archive ({}) for this system ({})",
                metadata.distro,
                self.config.dist()
            ))
            .into());
        }
        status(Level::Success, "import.verify", "Verify", "OK");

        let depot = Depot::get_enabled(self.config, &options.depot)?;
        let layout = Layout {
            source: extracted.path().join(self.config.dist()),
            modules: self.config.modules_dir(&depot.name),
            packages: self.config.packages_dir(&depot.name),
            depends: self.config.dependencies_dir(&depot.name),
            depot_path: depot.install_path()?,
        };
        let db = PackageDb::open(&self.config.package_db_path(&depot.name))?;

        let outcomes = if metadata.is_compiler() {
            let outcome = self
                .import_compiler(&metadata, &layout, &db, definition)
                .unwrap_or_else(|e| TaggingOutcome::Failed(format!("{e:#}")));
            report_outcome(&metadata.package_path(), &outcome);
            vec![(metadata.package_path(), outcome)]
        } else {
            let mut outcomes = Vec::new();
            for tagging in &metadata.taggings {
                title(&format!("Processing {}/{}", metadata.package_path(), tagging.tag));
                let outcome = self
                    .import_tagging(&metadata, tagging, &layout, &db, definition, options)
                    .unwrap_or_else(|e| TaggingOutcome::Failed(format!("{e:#}")));
                report_outcome(&format!("{}/{}", metadata.package_path(), tagging.tag), &outcome);
                outcomes.push((tagging.tag.clone(), outcome));
            }
            outcomes
        };

        self.finalize(&metadata, &layout, options)?;
        Ok(ImportReport {
            package_path: metadata.package_path(),
            outcomes,
        })
    }

    fn acquire(&self, location: &str) -> Result<PathBuf> {
        if fetch::is_remote(location) {
            title("Fetching archive");
            let fetcher = fetch::Fetcher::new(self.config.settings.fetch_timeout)?;
            let fetched = with_spinner("Downloading", || {
                fetcher.fetch(location, &self.config.archives_dir())
            })?;
            match &fetched {
                fetch::Fetched::Cached(_) => status(
                    Level::Warn,
                    "import.download.cached",
                    "Download",
                    "SKIP (Existing source file detected)",
                ),
                fetch::Fetched::Downloaded(_) => {
                    status(Level::Success, "import.download", "Download", "OK")
                }
            }
            Ok(fetched.path().to_path_buf())
        } else {
            let path = PathBuf::from(location);
            if !path.exists() {
                return Err(GridwareError::NotFound(format!("Archive not found at {location}")).into());
            }
            Ok(path)
        }
    }

    fn unresolved(&self, db: &PackageDb, tagging: &Tagging) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for req in &tagging.requirements {
            let found = match Requirement::parse(req) {
                Ok(parsed) => db.resolve(&parsed, tagging.compiler_tag.as_deref())?.is_some(),
                Err(_) => false,
            };
            if !found {
                missing.push(req.clone());
            }
        }
        Ok(missing)
    }

    fn import_tagging(
        &self,
        metadata: &ArchiveMetadata,
        tagging: &Tagging,
        layout: &Layout,
        db: &PackageDb,
        definition: Option<&Definition>,
        options: &ImportOptions,
    ) -> Result<TaggingOutcome> {
        let package = metadata.package(Some(tagging));
        if db.exists(&package)? {
            return Ok(TaggingOutcome::Exists);
        }

        let missing = self.unresolved(db, tagging)?;
        if !missing.is_empty() {
            let verb = if options.compile { "building" } else { "importing" };
            emit(
                Level::Warn,
                "import.requirements",
                &format!("NOTICE: {verb} requirements"),
                None,
            );
            for req in &missing {
                let attempt = Requirement::parse(req)
                    .and_then(|parsed| self.installer.install_requirement(&parsed, options));
                if let Err(e) = attempt {
                    emit(
                        Level::Warn,
                        "import.requirements.failed",
                        &format!("Unable to install requirement {req}: {e:#}"),
                        None,
                    );
                }
            }
            let still_missing = self.unresolved(db, tagging)?;
            if !still_missing.is_empty() {
                return Ok(TaggingOutcome::Unresolved(still_missing));
            }
            emit(
                Level::Info,
                "import.requirements.ok",
                &format!(
                    "NOTICE: requirements for {} satisfied; proceeding to import",
                    metadata.package_path()
                ),
                None,
            );
        }

        let package_path = metadata.package_path();
        let module_file = layout
            .source
            .join("etc/modules")
            .join(&package_path)
            .join(&tagging.tag);
        let pkg_dir = layout.source.join("pkg").join(&package_path).join(&tagging.tag);
        let depends_file = layout
            .source
            .join("etc/depends")
            .join(format!("{}-{}.sh", metadata.depends_stem(), tagging.tag));

        with_spinner("Importing", || -> Result<()> {
            relocate_module(&module_file, &layout.depot_path)?;
            relocate_payload(&pkg_dir, tagging.rewritten.as_deref(), &layout.depot_path)?;

            db.first_or_create(&package)?;

            move_path(
                &module_file,
                &layout.modules.join(&package_path).join(&tagging.tag),
            )?;
            move_path(&pkg_dir, &layout.packages.join(&package_path).join(&tagging.tag))?;
            self.install_depends_file(&depends_file, layout, definition)
        })?;
        Ok(TaggingOutcome::Imported)
    }

    fn import_compiler(
        &self,
        metadata: &ArchiveMetadata,
        layout: &Layout,
        db: &PackageDb,
        definition: Option<&Definition>,
    ) -> Result<TaggingOutcome> {
        title(&format!("Processing {}", metadata.package_path()));
        let (name, version) = (&metadata.name, metadata.version());
        if db.find(&metadata.kind, name, version, None)?.is_some() {
            return Ok(TaggingOutcome::Exists);
        }

        let modules = layout.source.join("etc/modules");
        let compiler_module = modules.join("compilers").join(name).join(version);
        let lib_module = modules.join("libs").join(name).join(version);
        let pkg_dir = layout.source.join("pkg/compilers").join(name).join(version);
        let depends_file = layout
            .source
            .join("etc/depends")
            .join(format!("{}.sh", metadata.depends_stem()));

        with_spinner("Importing", || -> Result<()> {
            relocate_module(&compiler_module, &layout.depot_path)?;
            if lib_module.exists() {
                relocate_module(&lib_module, &layout.depot_path)?;
            }
            relocate_payload(&pkg_dir, metadata.rewritten.as_deref(), &layout.depot_path)?;

            db.first_or_create(&metadata.package(None))?;

            move_path(
                &compiler_module,
                &layout.modules.join("compilers").join(name).join(version),
            )?;
            if lib_module.exists() {
                move_path(&lib_module, &layout.modules.join("libs").join(name).join(version))?;
            }
            move_path(&pkg_dir, &layout.packages.join("compilers").join(name).join(version))?;
            self.install_depends_file(&depends_file, layout, definition)
        })?;
        Ok(TaggingOutcome::Imported)
    }

    /// Archived dependency scripts are regenerated from the definition when
    /// there is one, then moved into the depot.
    fn install_depends_file(
        &self,
        depends_file: &Path,
        layout: &Layout,
        definition: Option<&Definition>,
    ) -> Result<()> {
        if !depends_file.exists() {
            return Ok(());
        }
        match definition {
            Some(defn) => fs::write(
                depends_file,
                self.utils.generate_dependency_script(defn, Phase::Runtime)?,
            )
            .with_context(|| format!("writing {}", depends_file.display()))?,
            None => emit(
                Level::Warn,
                "import.depends.nodefinition",
                "WARN No definition supplied, unable to generate dependencies file",
                None,
            ),
        }
        let file_name = depends_file
            .file_name()
            .context("dependency script has no file name")?;
        move_path(depends_file, &layout.depends.join(file_name))
    }

    fn finalize(&self, metadata: &ArchiveMetadata, layout: &Layout, options: &ImportOptions) -> Result<()> {
        title("Finalizing import");
        with_spinner("Updating module defaults", || -> Result<()> {
            module_tree::write_defaults(&layout.modules)?;
            module_tree::write_aliases(&layout.modules)?;
            Ok(())
        })?;
        status(Level::Success, "import.finalize.update", "Update", "OK");

        let pattern = format!(
            "{}/{}*.sh",
            glob::Pattern::escape(&layout.depends.to_string_lossy()),
            glob::Pattern::escape(&metadata.depends_stem())
        );
        let mut scripts: Vec<PathBuf> = glob::glob(&pattern)
            .context("invalid dependency script pattern")?
            .filter_map(|p| p.ok())
            .collect();
        scripts.sort();
        for script in scripts {
            let script = script.to_string_lossy().to_string();
            let out = with_spinner("Installing dependencies", || {
                self.runner.output("/bin/bash", std::slice::from_ref(&script))
            })?;
            if !out.success {
                return Err(GridwareError::command_failed(
                    script,
                    dependency_failure(&out.stderr, options.verbose),
                )
                .into());
            }
        }
        status(Level::Success, "import.finalize.depends", "Dependencies", "OK");
        Ok(())
    }
}

fn report_outcome(subject: &str, outcome: &TaggingOutcome) {
    match outcome {
        TaggingOutcome::Imported => status(Level::Success, "import.tagging.ok", subject, "OK"),
        TaggingOutcome::Exists => status(Level::Warn, "import.tagging.exists", subject, "EXISTS"),
        TaggingOutcome::Unresolved(reqs) => {
            status(Level::Error, "import.tagging.missing", subject, "MISSING");
            emit(
                Level::Error,
                "import.tagging.missing.detail",
                &format!("ERROR: Unable to satisfy runtime requirements: {}", reqs.join(", ")),
                None,
            );
        }
        TaggingOutcome::Failed(reason) => {
            status(Level::Error, "import.tagging.failed", subject, "BAD");
            emit(
                Level::Error,
                "import.tagging.failed.detail",
                &format!("ERROR: Unable to import due to failure condition: {reason}"),
                None,
            );
        }
    }
}

fn relocate_module(module_file: &Path, depot_path: &Path) -> Result<()> {
    if !module_file.is_file() {
        return Err(GridwareError::Archive(format!(
            "Archive does not contain module file {}",
            module_file.display()
        ))
        .into());
    }
    relocate::rewrite_text(module_file, relocate::DEPOT_TOKEN, &depot_path.to_string_lossy())?;
    Ok(())
}

fn relocate_payload(pkg_dir: &Path, rewritten: Option<&[String]>, depot_path: &Path) -> Result<()> {
    if !pkg_dir.is_dir() {
        return Err(GridwareError::Archive(format!(
            "Archive does not contain package directory {}",
            pkg_dir.display()
        ))
        .into());
    }
    let files: Vec<PathBuf> = match rewritten {
        Some(list) => list.iter().map(|f| pkg_dir.join(f)).collect(),
        None => WalkDir::new(pkg_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect(),
    };
    for file in files {
        relocate::relocate_file(&file, depot_path)?;
    }
    Ok(())
}

/// Message for a failed dependency script: the last ten lines of its error
/// output, without shell trace lines unless `verbose`.
pub fn dependency_failure(stderr: &str, verbose: bool) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = &lines[lines.len().saturating_sub(10)..];
    let extract = tail
        .iter()
        .filter(|l| verbose || !l.starts_with('+'))
        .map(|l| l.trim())
        .collect::<Vec<_>>()
        .join("\n   > ");
    format!("Installing dependencies failed.\n\n   Extract of script error output:\n   > {extract}")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::exec::HostRunner;
    use crate::common::exec::testing::ScriptedRunner;
    use crate::config::testing::config_in;
    use crate::depot::testing::{depot_with_id, enabled_depot_with_id};
    use crate::package::testing::package;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Config,
        storage: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "el7");
        let storage = enabled_depot_with_id(&config, "local", "abcd1234");
        Fixture { dir, config, storage }
    }

    fn options() -> ImportOptions {
        ImportOptions {
            depot: "local".into(),
            compile: false,
            verbose: false,
        }
    }

    #[derive(Default)]
    struct RecordingInstaller {
        requested: RefCell<Vec<String>>,
    }

    impl RequirementInstaller for RecordingInstaller {
        fn install_requirement(&self, requirement: &Requirement, _: &ImportOptions) -> Result<()> {
            self.requested.borrow_mut().push(requirement.to_string());
            Ok(())
        }
    }

    fn archive(f: &Fixture, metadata: &str, tags: &[&str]) -> PathBuf {
        let src = f.dir.path().join("src");
        let _ = fs::remove_dir_all(&src);
        fs::create_dir_all(&src).unwrap();
        testing::package_tree(&src, "el7", "foo", "1.0", metadata, tags);
        let path = f.dir.path().join("apps-foo-1.0-el7.tar.gz");
        extract::testing::pack_dir(&src, &path);
        path
    }

    fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut entries: Vec<(String, Vec<u8>)> = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with("packages.db"))
            .map(|e| {
                let content = if e.file_type().is_file() {
                    fs::read(e.path()).unwrap()
                } else {
                    Vec::new()
                };
                (e.path().display().to_string(), content)
            })
            .collect();
        entries.sort();
        entries
    }

    const METADATA: &str = r#"
type: apps
name: foo
version: 1.0
distro: el7
taggings:
  - tag: gcc-4.8.5
    compiler_tag: gcc-4.8.5
    requirements: []
"#;

    #[test]
    fn test_import_relocates_and_records() {
        let f = fixture();
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &NoInstaller,
        };
        let report = importer
            .import(None, &archive(&f, METADATA, &["gcc-4.8.5"]).to_string_lossy(), &options())
            .unwrap();
        assert_eq!(report.package_path, "apps/foo/1.0");
        assert_eq!(
            report.outcomes,
            vec![("gcc-4.8.5".to_string(), TaggingOutcome::Imported)]
        );

        let depot = f.storage.display().to_string();
        let module = fs::read_to_string(f.config.modules_dir("local").join("apps/foo/1.0/gcc-4.8.5")).unwrap();
        assert!(module.contains(&format!("set root {depot}/el7/pkg/apps/foo/1.0/gcc-4.8.5")));
        let bin = fs::read_to_string(f.config.packages_dir("local").join("apps/foo/1.0/gcc-4.8.5/bin/foo")).unwrap();
        assert!(bin.contains(&format!("exec {depot}/el7/libexec/foo")));
        assert!(f.config.modules_dir("local").join("apps/foo/.version").exists());

        let db = PackageDb::open(&f.config.package_db_path("local")).unwrap();
        assert_eq!(
            db.all().unwrap(),
            vec![package("apps", "foo", "1.0", Some("gcc-4.8.5"), "gcc-4.8.5")]
        );
    }

    #[test]
    fn test_import_into_disabled_depot_refused() {
        let f = fixture();
        let scratch = depot_with_id(&f.config, "scratch", "wxyz9876");
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &NoInstaller,
        };
        let scratch_options = ImportOptions {
            depot: "scratch".into(),
            ..options()
        };
        let err = importer
            .import(None, &archive(&f, METADATA, &["gcc-4.8.5"]).to_string_lossy(), &scratch_options)
            .unwrap_err();
        assert_eq!(err.to_string(), "Depot is not enabled: scratch");
        assert!(!scratch.join("el7/etc/modules/apps").exists());
    }

    #[test]
    fn test_second_import_reports_exists_without_mutation() {
        let f = fixture();
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &NoInstaller,
        };
        let path = archive(&f, METADATA, &["gcc-4.8.5"]);
        importer.import(None, &path.to_string_lossy(), &options()).unwrap();
        let before = snapshot(&f.storage);

        let report = importer.import(None, &path.to_string_lossy(), &options()).unwrap();
        assert_eq!(
            report.outcomes,
            vec![("gcc-4.8.5".to_string(), TaggingOutcome::Exists)]
        );
        assert_eq!(snapshot(&f.storage), before);
    }

    #[test]
    fn test_incompatible_distro_moves_nothing() {
        let f = fixture();
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &NoInstaller,
        };
        let before = snapshot(&f.storage);
        let err = importer
            .import(
                None,
                &archive(&f, &METADATA.replace("distro: el7", "distro: el8"), &["gcc-4.8.5"])
                    .to_string_lossy(),
                &options(),
            )
            .unwrap_err();
        assert!(matches!(
            GridwareError::classify(&err),
            Some(GridwareError::IncompatibleEnvironment(m))
                if m == "Incompatible distro in archive (el8) for this system (el7)"
        ));
        assert_eq!(snapshot(&f.storage), before);
    }

    #[test]
    fn test_missing_archive_and_metadata() {
        let f = fixture();
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &NoInstaller,
        };
        let err = importer.import(None, "/nonexistent/a.tar.gz", &options()).unwrap_err();
        assert_eq!(err.to_string(), "Archive not found at /nonexistent/a.tar.gz");

        let empty = f.dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let path = f.dir.path().join("empty.tar.gz");
        extract::testing::pack_dir(&empty, &path);
        let err = importer.import(None, &path.to_string_lossy(), &options()).unwrap_err();
        assert_eq!(err.to_string(), "Archive does not contain metadata");
    }

    #[test]
    fn test_satisfied_requirement_needs_no_install() {
        let f = fixture();
        let db = PackageDb::open(&f.config.package_db_path("local")).unwrap();
        db.first_or_create(&package("libs", "zlib", "1.2.8", Some("gcc-4.8.5"), "gcc-4.8.5"))
            .unwrap();
        drop(db);

        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let installer = RecordingInstaller::default();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &installer,
        };
        let metadata = METADATA.replace("requirements: []", "requirements: [libs/zlib]");
        let report = importer
            .import(None, &archive(&f, &metadata, &["gcc-4.8.5"]).to_string_lossy(), &options())
            .unwrap();
        assert!(report.is_complete());
        assert!(installer.requested.borrow().is_empty());
    }

    #[test]
    fn test_unresolved_tagging_does_not_stop_siblings() {
        let f = fixture();
        let utils = DependencyUtils::new(&f.config);
        let runner = ScriptedRunner::new();
        let installer = RecordingInstaller::default();
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &runner,
            installer: &installer,
        };
        let metadata = r#"
type: apps
name: foo
version: 1.0
distro: el7
taggings:
  - tag: intel-2016
    compiler_tag: intel-2016
    requirements: [libs/mkl_ilp64/11.3]
  - tag: gcc-4.8.5
    compiler_tag: gcc-4.8.5
"#;
        let report = importer
            .import(
                None,
                &archive(&f, metadata, &["intel-2016", "gcc-4.8.5"]).to_string_lossy(),
                &options(),
            )
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(
            report.outcomes,
            vec![
                (
                    "intel-2016".to_string(),
                    TaggingOutcome::Unresolved(vec!["libs/mkl_ilp64/11.3".to_string()])
                ),
                ("gcc-4.8.5".to_string(), TaggingOutcome::Imported),
            ]
        );
        assert_eq!(*installer.requested.borrow(), vec!["libs/mkl_ilp64/11.3"]);
        assert!(!f.config.packages_dir("local").join("apps/foo/1.0/intel-2016").exists());
    }

    #[test]
    fn test_failed_dependency_script_reports_stderr_tail() {
        let f = fixture();
        let src = f.dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        testing::package_tree(&src, "el7", "foo", "1.0", METADATA, &["gcc-4.8.5"]);
        let depends = src.join("el7/etc/depends");
        fs::create_dir_all(&depends).unwrap();
        fs::write(
            depends.join("apps-foo-1.0-gcc-4.8.5.sh"),
            "echo '+ yum install x' >&2\necho 'No package x available' >&2\nexit 1\n",
        )
        .unwrap();
        let path = f.dir.path().join("a.tar.gz");
        extract::testing::pack_dir(&src, &path);

        let utils = DependencyUtils::new(&f.config);
        let importer = Importer {
            config: &f.config,
            utils: &utils,
            runner: &HostRunner,
            installer: &NoInstaller,
        };
        let err = importer.import(None, &path.to_string_lossy(), &options()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Installing dependencies failed."));
        assert!(msg.contains("   > No package x available"));
        assert!(!msg.contains("yum install"));
        assert!(f.config.dependencies_dir("local").join("apps-foo-1.0-gcc-4.8.5.sh").exists());
    }

    #[test]
    fn test_dependency_failure_tail() {
        let stderr = (1..=12).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let msg = dependency_failure(&stderr, false);
        assert!(!msg.contains("line 2\n"));
        assert!(msg.ends_with("   > line 12"));
        assert!(msg.contains("   > line 3\n"));
        let traced = dependency_failure("+ set -x\nboom", true);
        assert!(traced.contains("> + set -x"));
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name("apps", "hdf5", None, "1.8.17", "el7"), "apps-hdf5-1.8.17-el7.tar.gz");
        assert_eq!(
            archive_name("apps", "hdf5", Some("mpi"), "1.8.17", "el7"),
            "apps-hdf5_mpi-1.8.17-el7.tar.gz"
        );
    }
}
