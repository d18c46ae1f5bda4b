use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row};
use std::fs;
use std::path::Path;

use super::{Package, Requirement, resolve};

/// Installed package records for one depot.
pub struct PackageDb {
    conn: Connection,
}

const CURRENT_SCHEMA_VERSION: i32 = 1;

const COLUMNS: &str = "type, name, version, compiler_tag, variant, tag";

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Package> {
    let non_empty = |s: String| (!s.is_empty()).then_some(s);
    Ok(Package {
        kind: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        compiler_tag: non_empty(row.get(3)?),
        variant: non_empty(row.get(4)?),
        tag: non_empty(row.get(5)?),
    })
}

impl PackageDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening package database {}", path.display()))?;
        Self::init_schema(&conn)?;
        Ok(PackageDb { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(PackageDb { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (version)
            )",
            (),
        )?;

        let version = match conn.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                conn.execute(
                    "INSERT INTO schema_version (version, updated) VALUES (0, datetime('now'))",
                    [],
                )?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        if version < CURRENT_SCHEMA_VERSION {
            Self::migrate_schema(conn, version)?;
        }

        Ok(())
    }

    fn migrate_schema(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version == 0 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS packages (
                    type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    version TEXT NOT NULL,
                    compiler_tag TEXT NOT NULL DEFAULT '',
                    variant TEXT NOT NULL DEFAULT '',
                    tag TEXT NOT NULL DEFAULT '',
                    path TEXT NOT NULL,
                    created TEXT NOT NULL,
                    PRIMARY KEY (type, name, version, variant, tag)
                )",
                (),
            )?;
            conn.execute(
                "INSERT INTO schema_version (version, updated) VALUES (1, datetime('now'))",
                [],
            )?;
        }
        Ok(())
    }

    /// The record with this identity, if any.
    pub fn find(&self, kind: &str, name: &str, version: &str, tag: Option<&str>) -> Result<Option<Package>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM packages
             WHERE type = ?1 AND name = ?2 AND version = ?3 AND (?4 IS NULL OR tag = ?4)
             ORDER BY rowid LIMIT 1"
        );
        let found = self
            .conn
            .query_row(&sql, (kind, name, version, tag), from_row)
            .optional()?;
        Ok(found)
    }

    pub fn exists(&self, package: &Package) -> Result<bool> {
        let found: Option<i32> = self
            .conn
            .query_row(
                "SELECT 1 FROM packages
                 WHERE type = ?1 AND name = ?2 AND version = ?3 AND variant = ?4 AND tag = ?5",
                (
                    &package.kind,
                    &package.name,
                    &package.version,
                    opt(&package.variant),
                    opt(&package.tag),
                ),
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert `package` unless an identical record exists.
    pub fn first_or_create(&self, package: &Package) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO packages
                (type, name, version, compiler_tag, variant, tag, path, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
            (
                &package.kind,
                &package.name,
                &package.version,
                opt(&package.compiler_tag),
                opt(&package.variant),
                opt(&package.tag),
                package.path(),
            ),
        )?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Package>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM packages ORDER BY path"))?;
        let rows = stmt.query_map([], from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Packages whose path is LIKE `pattern`, retrying as a prefix match.
    pub fn matching(&self, pattern: &str) -> Result<Vec<Package>> {
        let exact = self.like(pattern)?;
        if exact.is_empty() {
            self.like(&format!("{pattern}%"))
        } else {
            Ok(exact)
        }
    }

    fn like(&self, pattern: &str) -> Result<Vec<Package>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM packages WHERE path LIKE ?1 ORDER BY path"
        ))?;
        let rows = stmt.query_map([pattern], from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Newest installed package satisfying `req` for `compiler_tag`.
    pub fn resolve(&self, req: &Requirement, compiler_tag: Option<&str>) -> Result<Option<Package>> {
        let installed = self.all()?;
        Ok(resolve(&installed, req, compiler_tag).cloned())
    }
}
