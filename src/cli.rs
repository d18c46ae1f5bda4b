use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::repo::Phase;

/// Gridware depot package manager
#[derive(Parser, Debug)]
#[command(name = "gridware", author, version, about, long_about = None)]
pub struct Cli {
    /// Activate debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Emit machine-readable JSON events instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Never prompt; refuse anything that would need confirmation
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Show full output of failing dependency scripts
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synchronize package repositories with their sources
    Update {
        /// Repositories to update (default: all)
        repos: Vec<String>,
    },
    /// Search package definitions
    Search {
        /// Query of one to four `/`-separated glob parts
        #[arg(default_value = "*")]
        query: String,
    },
    /// Show the runtime requirement tree of a package
    Requires {
        package: String,
        /// Use the latest version when several match
        #[arg(short, long)]
        latest: bool,
        #[arg(short = 'D', long, default_value = "local")]
        depot: String,
    },
    /// Install a package from its binary archive
    Install {
        package: String,
        /// Variant to install
        #[arg(long)]
        variant: Option<String>,
        /// Use the latest version when several match
        #[arg(short, long)]
        latest: bool,
        /// Build from source instead of importing binaries
        #[arg(short, long)]
        compile: bool,
        #[arg(short = 'D', long, default_value = "local")]
        depot: String,
    },
    /// Import a binary archive (file path or URL) into a depot
    Import {
        archive: String,
        /// Build missing requirements from source
        #[arg(short, long)]
        compile: bool,
        #[arg(short = 'D', long, default_value = "local")]
        depot: String,
    },
    /// Export an installed package to a binary archive
    Export {
        /// Installed package path, `type/name[_variant]/version`
        package: String,
        /// Directory to write the archive to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        #[arg(short = 'D', long, default_value = "local")]
        depot: String,
    },
    /// Install the distro packages a package definition needs
    #[command(name = "distro-deps")]
    DistroDeps {
        /// Definition path, e.g. `main/libs/hdf5/1.8.17`
        package: String,
        #[arg(short, long, value_enum, default_value_t = Phase::Runtime)]
        phase: Phase,
    },
    /// Depot management
    Depot {
        #[command(subcommand)]
        command: DepotCommands,
    },
    /// Pending distro package installation requests
    Requests {
        #[command(subcommand)]
        command: RequestCommands,
    },
    /// Trust list for non-interactive distro package installs
    Whitelist {
        #[command(subcommand)]
        command: WhitelistCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DepotCommands {
    /// List depots
    List,
    /// Create a new empty depot
    Init {
        name: String,
        /// Don't enable the new depot
        #[arg(long)]
        disabled: bool,
    },
    /// Add a depot to the module search path
    Enable { name: String },
    /// Remove a depot from the module search path
    Disable { name: String },
    /// Delete a depot and everything in it
    Purge { name: String },
    /// Export a depot manifest and its package archives
    Export {
        name: String,
        /// Output directory (default: /tmp/<depot>)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only write the manifest
        #[arg(long)]
        no_packages: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RequestCommands {
    /// List pending requests
    List,
    /// Work through pending requests
    Install,
    /// Delete a request
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum WhitelistCommands {
    /// Show whitelisted users, packages and repositories
    List,
    /// Trust every install requested by a user
    User { name: String },
    /// Trust a distro package for any user
    Package { name: String },
    /// Trust every package coming from a repository
    Repo { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_distro_deps_arguments() {
        let cli = Cli::try_parse_from([
            "gridware",
            "distro-deps",
            "main/libs/hdf5/1.8.17",
            "--phase",
            "build",
            "--non-interactive",
        ])
        .unwrap();
        assert!(cli.non_interactive);
        match cli.command {
            Commands::DistroDeps { package, phase } => {
                assert_eq!(package, "main/libs/hdf5/1.8.17");
                assert_eq!(phase, Phase::Build);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_depot_export_defaults() {
        let cli = Cli::try_parse_from(["gridware", "depot", "export", "local"]).unwrap();
        match cli.command {
            Commands::Depot {
                command: DepotCommands::Export { name, output, no_packages },
            } => {
                assert_eq!(name, "local");
                assert!(output.is_none());
                assert!(!no_packages);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
