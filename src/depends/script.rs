use anyhow::Result;
use std::fmt::{self, Write};
use std::path::Path;

use crate::common::distro::CommandTemplates;
use crate::common::shell::shell_quote;
use crate::repo::Phase;

pub const SCRIPT_DIALECT: u32 = 2;
pub const DIALECT_MARKER: &str = "#=Alces-Gridware-Dependencies:";

/// Attempts before giving up on an install or an availability check.
pub const MAX_ATTEMPTS: u32 = 5;

/// Everything needed to render a dependency script.
pub struct ScriptContext<'a> {
    pub program: &'a str,
    pub definition_path: &'a str,
    pub phase: Phase,
    pub userspace: Option<&'a str>,
    pub runtime_marker: &'a Path,
    pub packages: &'a [String],
    pub commands: CommandTemplates,
}

fn script_form(template: &str) -> String {
    template.replace("%s", "\"$pkg\"")
}

/// Render the script that installs distro prerequisites for a package.
///
/// Runtimes advertising dialect 2 or later re-enter `distro-deps`; older
/// ones run the embedded loop against the package manager directly.
pub fn render(ctx: &ScriptContext<'_>) -> Result<String> {
    let mut s = String::new();
    write_script(&mut s, ctx)?;
    Ok(s)
}

fn write_script(s: &mut String, ctx: &ScriptContext<'_>) -> fmt::Result {
    writeln!(s, "#!/bin/bash")?;
    writeln!(s, "{DIALECT_MARKER}{SCRIPT_DIALECT}")?;
    writeln!(
        s,
        "cw_GRIDWARE_userspace={}",
        shell_quote(ctx.userspace.unwrap_or(""))
    )?;
    writeln!(s, "export cw_GRIDWARE_userspace")?;
    writeln!(s)?;
    writeln!(s, "runtime_dialect=1")?;
    let marker = shell_quote(&ctx.runtime_marker.to_string_lossy());
    writeln!(s, "if [ -r {marker} ]; then")?;
    writeln!(s, "  runtime_dialect=\"$(head -n1 {marker})\"")?;
    writeln!(s, "fi")?;
    writeln!(
        s,
        "if [ \"${{runtime_dialect:-1}}\" -ge {SCRIPT_DIALECT} ] 2>/dev/null; then"
    )?;
    writeln!(
        s,
        "  exec sudo -E {} distro-deps {} --phase {} --non-interactive",
        shell_quote(ctx.program),
        shell_quote(ctx.definition_path),
        ctx.phase
    )?;
    writeln!(s, "fi")?;
    writeln!(s)?;

    let list = ctx
        .packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(s, "for pkg in {list}; do")?;
    writeln!(
        s,
        "  if {} >/dev/null 2>&1; then",
        script_form(ctx.commands.check)
    )?;
    writeln!(s, "    continue")?;
    writeln!(s, "  fi")?;
    writeln!(s, "  tries=0")?;
    writeln!(
        s,
        "  until {} >/dev/null 2>&1; do",
        script_form(ctx.commands.available)
    )?;
    writeln!(s, "    tries=$((tries+1))")?;
    writeln!(s, "    if [ $tries -ge {MAX_ATTEMPTS} ]; then")?;
    writeln!(
        s,
        "      echo \"Package $pkg is required but not available.\" >&2"
    )?;
    writeln!(s, "      exit 1")?;
    writeln!(s, "    fi")?;
    writeln!(s, "    sleep 1")?;
    writeln!(s, "  done")?;
    writeln!(s, "  tries=0")?;
    writeln!(s, "  until {}; do", script_form(ctx.commands.install))?;
    writeln!(s, "    tries=$((tries+1))")?;
    writeln!(s, "    if [ $tries -ge {MAX_ATTEMPTS} ]; then")?;
    writeln!(s, "      echo \"Unable to install $pkg\" >&2")?;
    writeln!(s, "      exit 1")?;
    writeln!(s, "    fi")?;
    writeln!(s, "  done")?;
    writeln!(s, "done")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::distro::DistroFamily;
    use crate::common::exec::{CommandRunner, HostRunner};
    use std::fs;
    use tempfile::TempDir;

    fn context<'a>(marker: &'a Path, packages: &'a [String], commands: CommandTemplates) -> ScriptContext<'a> {
        ScriptContext {
            program: "/opt/clusterware/bin/gridware",
            definition_path: "main/libs/hdf5/1.8.17",
            phase: Phase::Runtime,
            userspace: None,
            runtime_marker: marker,
            packages,
            commands,
        }
    }

    #[test]
    fn test_header_lines() {
        let pkgs = vec!["zlib".to_string()];
        let script = render(&context(
            Path::new("/opt/clusterware/etc/gridware/dependencies.version"),
            &pkgs,
            DistroFamily::El.commands(),
        ))
        .unwrap();
        let mut lines = script.lines();
        assert_eq!(lines.next(), Some("#!/bin/bash"));
        assert_eq!(lines.next(), Some("#=Alces-Gridware-Dependencies:2"));
        assert!(script.contains(
            "exec sudo -E /opt/clusterware/bin/gridware distro-deps main/libs/hdf5/1.8.17 --phase runtime --non-interactive"
        ));
        assert!(script.contains("for pkg in zlib; do"));
        assert!(script.contains("/usr/bin/yum install -y \"$pkg\""));
    }

    #[test]
    fn test_program_path_is_quoted() {
        let pkgs = vec!["zlib".to_string()];
        let mut ctx = context(Path::new("/marker"), &pkgs, DistroFamily::El.commands());
        ctx.program = "/opt/my tools/gridware";
        let script = render(&ctx).unwrap();
        assert!(script.contains("exec sudo -E '/opt/my tools/gridware' distro-deps"));
    }

    #[test]
    fn test_legacy_loop_skips_installed_packages() {
        let dir = TempDir::new().unwrap();
        let pkgs = vec!["present".to_string(), "also-present".to_string()];
        let commands = CommandTemplates {
            check: "true %s",
            available: "false %s",
            install: "false %s",
        };
        let script_path = dir.path().join("deps.sh");
        fs::write(
            &script_path,
            render(&context(&dir.path().join("no-marker"), &pkgs, commands)).unwrap(),
        )
        .unwrap();
        assert!(HostRunner
            .status(&format!("/bin/bash {}", script_path.display()))
            .unwrap());
    }

    #[test]
    fn test_legacy_loop_fails_on_install_failure() {
        let dir = TempDir::new().unwrap();
        let pkgs = vec!["missing".to_string()];
        let commands = CommandTemplates {
            check: "false %s",
            available: "true %s",
            install: "false %s",
        };
        let script_path = dir.path().join("deps.sh");
        fs::write(
            &script_path,
            render(&context(&dir.path().join("no-marker"), &pkgs, commands)).unwrap(),
        )
        .unwrap();
        assert!(!HostRunner
            .status(&format!("/bin/bash {}", script_path.display()))
            .unwrap());
    }
}
