use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::GridwareError;

static VARIANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/\s]+)_([^/\s]*)$").expect("valid variant regex"));

/// A requirement string: `[type/]name[_variant][/version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub kind: Option<String>,
    pub name: String,
    pub variant: Option<String>,
    pub version: Option<String>,
}

fn looks_like_version(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

impl Requirement {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = || GridwareError::NotFound(format!("Invalid requirement: '{input}'"));
        if input.is_empty() || input.split_whitespace().count() > 1 {
            return Err(invalid().into());
        }

        let parts: Vec<&str> = input.split('/').collect();
        let (kind, name, version) = match parts.as_slice() {
            [name] => (None, *name, None),
            [a, b] if looks_like_version(b) => (None, *a, Some(*b)),
            [kind, name] => (Some(*kind), *name, None),
            [kind, name, version] => (Some(*kind), *name, Some(*version)),
            _ => return Err(invalid().into()),
        };

        // The variant is whatever follows the last underscore of the name.
        let (name, variant) = match VARIANT_RE.captures(name) {
            Some(caps) => (
                caps[1].to_string(),
                Some(caps[2].to_string()).filter(|v| !v.is_empty() && v != "default"),
            ),
            None => (name.to_string(), None),
        };
        if name.is_empty() {
            return Err(invalid().into());
        }

        Ok(Requirement {
            kind: kind.map(str::to_string),
            name,
            variant,
            version: version.filter(|v| !v.is_empty()).map(str::to_string),
        })
    }

    /// Query for definition lookup; the version is matched separately.
    pub fn definition_query(&self) -> String {
        match &self.kind {
            Some(kind) => format!("{}/{}", kind, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "{kind}/")?;
        }
        f.write_str(&self.name)?;
        if let Some(variant) = &self.variant {
            write!(f, "_{variant}")?;
        }
        if let Some(version) = &self.version {
            write!(f, "/{version}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(kind: Option<&str>, name: &str, variant: Option<&str>, version: Option<&str>) -> Requirement {
        Requirement {
            kind: kind.map(str::to_string),
            name: name.to_string(),
            variant: variant.map(str::to_string),
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(Requirement::parse("zlib").unwrap(), req(None, "zlib", None, None));
        assert_eq!(
            Requirement::parse("zlib/1.2").unwrap(),
            req(None, "zlib", None, Some("1.2"))
        );
        assert_eq!(
            Requirement::parse("libs/zlib").unwrap(),
            req(Some("libs"), "zlib", None, None)
        );
        assert_eq!(
            Requirement::parse("libs/hdf5_mpi/1.8.17").unwrap(),
            req(Some("libs"), "hdf5", Some("mpi"), Some("1.8.17"))
        );
        assert_eq!(
            Requirement::parse("fftw_default").unwrap(),
            req(None, "fftw", None, None)
        );
    }

    #[test]
    fn test_underscore_names_split_at_last_underscore() {
        assert_eq!(
            Requirement::parse("apps/my_pkg_mpi/1.0").unwrap(),
            req(Some("apps"), "my_pkg", Some("mpi"), Some("1.0"))
        );
        assert_eq!(
            Requirement::parse("libs/foo/1.0_beta").unwrap(),
            req(Some("libs"), "foo", None, Some("1.0_beta"))
        );
    }

    #[test]
    fn test_display_round_trips_canonical_form() {
        for input in ["libs/hdf5_mpi/1.8.17", "zlib", "zlib/1.2"] {
            assert_eq!(Requirement::parse(input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_invalid_requirements() {
        for input in ["", "a b", "a/b/c/d", "/1.0"] {
            assert!(Requirement::parse(input).is_err(), "{input}");
        }
    }
}
