//! Installed package records.

pub mod db;
pub mod requirement;

use std::fmt;

use crate::common::version::{compare_versions, version_matches};
pub use db::PackageDb;
pub use requirement::Requirement;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Package {
    pub kind: String,
    pub name: String,
    pub version: String,
    pub compiler_tag: Option<String>,
    pub variant: Option<String>,
    pub tag: Option<String>,
}

impl Package {
    pub fn is_compiler(&self) -> bool {
        self.kind == "compilers"
    }

    /// `name` or `name_variant`
    pub fn qualified_name(&self) -> String {
        match &self.variant {
            Some(v) if v != "default" => format!("{}_{}", self.name, v),
            _ => self.name.clone(),
        }
    }

    /// `compilers/name/version` or `type/name[_variant]/version/tag`.
    pub fn path(&self) -> String {
        let base = format!("{}/{}/{}", self.kind, self.qualified_name(), self.version);
        match (&self.tag, self.is_compiler()) {
            (Some(tag), false) if !tag.is_empty() => format!("{base}/{tag}"),
            _ => base,
        }
    }

    /// Path without the build tag.
    pub fn base_path(&self) -> String {
        format!("{}/{}/{}", self.kind, self.qualified_name(), self.version)
    }

    /// Does this package satisfy `req` when building with `compiler_tag`?
    pub fn satisfies(&self, req: &Requirement, compiler_tag: Option<&str>) -> bool {
        if req.kind.as_ref().is_some_and(|k| k != &self.kind) {
            return false;
        }
        let name_ok = self.name == req.name
            && match (&req.variant, &self.variant) {
                (None, None) => true,
                (None, Some(v)) | (Some(v), None) => v == "default",
                (Some(a), Some(b)) => a == b,
            };
        let wanted = match &req.variant {
            Some(v) => format!("{}_{}", req.name, v),
            None => req.name.clone(),
        };
        if !name_ok && self.qualified_name() != wanted {
            return false;
        }
        if let Some(version) = &req.version
            && !version_matches(&self.version, version)
        {
            return false;
        }
        match (compiler_tag, self.compiler_tag.as_deref()) {
            (Some(wanted), Some(have)) if !have.is_empty() => wanted == have,
            _ => true,
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// The newest package in `candidates` satisfying `req`.
pub fn resolve<'a>(
    candidates: &'a [Package],
    req: &Requirement,
    compiler_tag: Option<&str>,
) -> Option<&'a Package> {
    candidates
        .iter()
        .filter(|p| p.satisfies(req, compiler_tag))
        .max_by(|a, b| compare_versions(&a.version, &b.version))
}
