//! Resolution glue: finding definitions, installing them from binary
//! archives and walking their requirement trees.

use anyhow::Result;
use std::collections::HashSet;

use crate::common::exec::CommandRunner;
use crate::common::version::version_matches;
use crate::config::Config;
use crate::depends::DependencyUtils;
use crate::error::GridwareError;
use crate::import::{ImportOptions, ImportReport, Importer, RequirementInstaller, archive_name};
use crate::package::{Package, PackageDb, Requirement};
use crate::repo::sync::{SyncReport, synchronize_named};
use crate::repo::{Definition, Phase, RepositorySet};
use crate::ui::prelude::*;

/// What to do when a query matches more than one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Several matches are an error listing the candidates.
    Exact,
    /// Take the newest match.
    Latest,
}

/// One node of a requirement tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementNode {
    pub requirement: String,
    pub depth: usize,
    pub definition: Option<String>,
    pub installed: Option<Package>,
}

pub struct Engine<R: CommandRunner> {
    pub config: Config,
    pub repos: RepositorySet,
    pub utils: DependencyUtils,
    pub runner: R,
}

impl<R: CommandRunner> Engine<R> {
    pub fn new(config: Config, runner: R) -> Result<Self> {
        let repos = RepositorySet::from_config(&config)?;
        let utils = DependencyUtils::new(&config);
        Ok(Engine {
            config,
            repos,
            utils,
            runner,
        })
    }

    /// Synchronize every repository whose freshness interval has lapsed.
    pub fn update_stale_repositories(&mut self) -> Result<Vec<(String, SyncReport)>> {
        let stale = self.repos.requiring_update();
        self.update_repositories(&stale)
    }

    pub fn update_repositories(&mut self, names: &[String]) -> Result<Vec<(String, SyncReport)>> {
        let mut reports = Vec::new();
        for name in names {
            let report = synchronize_named(&mut self.repos, name)?;
            let level = match report.status {
                crate::repo::SyncStatus::Failed(_) => Level::Error,
                crate::repo::SyncStatus::Created
                | crate::repo::SyncStatus::Updated
                | crate::repo::SyncStatus::UpToDate => Level::Success,
                _ => Level::Warn,
            };
            status(level, "repo.update", &format!("Updating repository: {name}"), &report.to_string());
            reports.push((name.clone(), report));
        }
        Ok(reports)
    }

    pub fn find_definitions(&self, query: &str) -> Result<Vec<&Definition>> {
        self.repos.find_definitions(query)
    }

    pub fn find_definition(&self, query: &str, selection: Selection) -> Result<&Definition> {
        let found = self.find_definitions(query)?;
        match found.as_slice() {
            [] => Err(GridwareError::NotFound(format!("No matching package found for: {query}")).into()),
            [only] => Ok(*only),
            [.., latest] if selection == Selection::Latest => Ok(*latest),
            _ => Err(GridwareError::Ambiguous(found.iter().map(|d| d.path()).collect()).into()),
        }
    }

    /// Newest definition satisfying a parsed requirement.
    pub fn definition_for(&self, req: &Requirement) -> Result<&Definition> {
        let candidates: Vec<&Definition> = self
            .find_definitions(&req.definition_query())?
            .into_iter()
            .filter(|d| d.name == req.name)
            .filter(|d| req.version.as_deref().is_none_or(|v| version_matches(&d.version, v)))
            .collect();
        candidates.last().copied().ok_or_else(|| {
            GridwareError::NotFound(format!("No matching package found for: {req}")).into()
        })
    }

    pub fn package_db(&self, depot: &str) -> Result<PackageDb> {
        PackageDb::open(&self.config.package_db_path(depot))
    }

    /// URL of the prebuilt archive for `defn`.
    pub fn binary_url(&self, defn: &Definition, variant: Option<&str>) -> String {
        format!(
            "{}/{}",
            self.config.settings.binary_url.trim_end_matches('/'),
            archive_name(&defn.kind, &defn.name, variant, &defn.version, self.config.dist())
        )
    }

    /// Install `defn` into the options' depot from its binary archive.
    pub fn install_definition(
        &self,
        defn: &Definition,
        variant: Option<&str>,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        if options.compile {
            return Err(GridwareError::Unresolvable(format!(
                "{}: building from source is not supported; install a binary instead",
                defn.path()
            ))
            .into());
        }
        let variant = variant.filter(|v| *v != "default");
        if variant.is_some() && !defn.has_variants() {
            return Err(GridwareError::NotFound(format!(
                "Package {} has no variant {}",
                defn.path(),
                variant.unwrap_or_default()
            ))
            .into());
        }
        self.import(Some(defn), &self.binary_url(defn, variant), options)
    }

    pub fn import(
        &self,
        definition: Option<&Definition>,
        location: &str,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        let importer = Importer {
            config: &self.config,
            utils: &self.utils,
            runner: &self.runner,
            installer: self,
        };
        importer.import(definition, location, options)
    }

    /// Depth-first requirement tree of `defn` for `phase`, with each node
    /// resolved against the depot's installed packages.
    pub fn requirements_tree(&self, defn: &Definition, phase: Phase, depot: &str) -> Result<Vec<RequirementNode>> {
        let installed = self.package_db(depot)?.all()?;
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(defn.path());
        self.walk_requirements(defn, phase, &installed, 0, &mut seen, &mut nodes)?;
        Ok(nodes)
    }

    fn walk_requirements(
        &self,
        defn: &Definition,
        phase: Phase,
        installed: &[Package],
        depth: usize,
        seen: &mut HashSet<String>,
        nodes: &mut Vec<RequirementNode>,
    ) -> Result<()> {
        for requirement in defn.requirements(phase) {
            let parsed = Requirement::parse(&requirement)?;
            let child = self.definition_for(&parsed).ok();
            nodes.push(RequirementNode {
                requirement: requirement.clone(),
                depth,
                definition: child.map(|d| d.path()),
                installed: crate::package::resolve(installed, &parsed, None).cloned(),
            });
            if let Some(child) = child
                && seen.insert(child.path())
            {
                // Installed packages only need what they need at runtime.
                self.walk_requirements(child, Phase::Runtime, installed, depth + 1, seen, nodes)?;
            }
        }
        Ok(())
    }
}

impl<R: CommandRunner> RequirementInstaller for Engine<R> {
    fn install_requirement(&self, requirement: &Requirement, options: &ImportOptions) -> Result<()> {
        let defn = self.definition_for(requirement)?;
        emit(
            Level::Info,
            "import.requirement",
            &format!("Installing requirement {requirement} from {}", defn.path()),
            None,
        );
        let report = self.install_definition(defn, requirement.variant.as_deref(), options)?;
        if report.is_complete() {
            Ok(())
        } else {
            Err(GridwareError::Unresolvable(requirement.to_string()).into())
        }
    }
}
