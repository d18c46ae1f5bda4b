use anyhow::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A clusterware root, a gridware root and one local repository, all inside
/// a temporary directory.
pub struct TestEnvironment {
    temp_dir: TempDir,
    dist: String,
}

impl TestEnvironment {
    pub fn new(dist: &str) -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let env = TestEnvironment {
            temp_dir,
            dist: dist.to_string(),
        };
        fs::create_dir_all(env.repo())?;
        fs::create_dir_all(env.cw_root().join("etc"))?;
        fs::write(
            env.cw_root().join("etc/gridware.yml"),
            format!(
                ":repo_paths:\n  - {}\n:archives_dir: {}\n:log_root: {}\n",
                env.repo().display(),
                env.path().join("archives").display(),
                env.path().join("log").display()
            ),
        )?;
        Ok(env)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn cw_root(&self) -> PathBuf {
        self.path().join("clusterware")
    }

    pub fn gridware_root(&self) -> PathBuf {
        self.path().join("gridware")
    }

    pub fn repo(&self) -> PathBuf {
        self.path().join("repos").join("main")
    }

    pub fn modules_dir(&self, depot: &str) -> PathBuf {
        self.gridware_root().join(depot).join(&self.dist).join("etc/modules")
    }

    pub fn add_definition(&self, kind: &str, name: &str, version: &str, yaml: &str) -> Result<()> {
        let dir = self.repo().join("pkg").join(kind).join(name).join(version);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("metadata.yml"), yaml)?;
        Ok(())
    }

    /// Build `apps-<name>-<version>-<distro>.tar.gz` with one tagging.
    pub fn build_archive(&self, name: &str, version: &str, distro: &str, tag: &str) -> Result<PathBuf> {
        let src = self.path().join(format!("archive-src-{name}"));
        let modules = src.join(distro).join("etc/modules/apps").join(name).join(version);
        let bin = src.join(distro).join("pkg/apps").join(name).join(version).join(tag).join("bin");
        fs::create_dir_all(&modules)?;
        fs::create_dir_all(&bin)?;
        fs::write(
            src.join("metadata.yml"),
            format!(
                "type: apps\nname: {name}\nversion: '{version}'\ndistro: {distro}\ntaggings:\n  - tag: {tag}\n    compiler_tag: {tag}\n"
            ),
        )?;
        fs::write(
            modules.join(tag),
            format!("#%Module1.0\nset root _DEPOT_/{distro}/pkg/apps/{name}/{version}/{tag}\n"),
        )?;
        fs::write(bin.join(name), "#!/bin/sh\necho hello\n")?;

        let archive = self.path().join(format!("apps-{name}-{version}-{distro}.tar.gz"));
        let mut builder = tar::Builder::new(GzEncoder::new(fs::File::create(&archive)?, Compression::fast()));
        builder.append_dir_all(".", &src)?;
        builder.into_inner()?.finish()?;
        Ok(archive)
    }

    pub fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(env!("CARGO_BIN_EXE_gridware"))
            .args(args)
            .env("cw_ROOT", self.cw_root())
            .env("cw_GRIDWARE_root", self.gridware_root())
            .env("cw_DIST", &self.dist)
            .env("HOME", self.path())
            .env_remove("cw_GRIDWARE_userspace")
            .env_remove("cw_GRIDWARE_notify")
            .env_remove("_LMFILES_")
            .env_remove("SUDO_USER")
            .output()?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
