//! Command handlers behind the CLI.

use anyhow::Result;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use dialoguer::{Confirm, Input};
use std::io::IsTerminal;

use crate::cli::{Cli, Commands, DepotCommands, RequestCommands, WhitelistCommands};
use crate::common::exec::HostRunner;
use crate::common::privileges::Invoker;
use crate::config::Config;
use crate::depends::installer::{DistroInstaller, InstallOptions};
use crate::depends::WhitelistStore;
use crate::depends::requests::{self, Decision, RequestOutcome, RequestProcessor, RequestQueue};
use crate::depot::exporter::{ArchiveExporter, ExportOptions, export_depot};
use crate::depot::{self, Depot, PurgeMode};
use crate::engine::{Engine, Selection};
use crate::error::GridwareError;
use crate::import::{ImportOptions, ImportReport};
use crate::repo::Phase;
use crate::ui::prelude::*;

struct Prompting {
    yes: bool,
    non_interactive: bool,
}

impl Prompting {
    fn can_ask(&self) -> bool {
        !self.non_interactive && std::io::stdin().is_terminal()
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let prompting = Prompting {
        yes: cli.yes,
        non_interactive: cli.non_interactive,
    };
    let mut engine = Engine::new(config, HostRunner)?;

    match cli.command {
        Commands::Update { repos } => {
            let names = if repos.is_empty() {
                engine.repos.iter().map(|r| r.name.clone()).collect()
            } else {
                repos
            };
            title("Updating repositories");
            for (name, _) in engine.update_repositories(&names)? {
                if let Some(repo) = engine.repos.get(&name) {
                    let descriptor = repo.descriptor();
                    emit(
                        Level::Info,
                        "repo.update.descriptor",
                        &format!("  {name}: {descriptor}"),
                        Some(serde_json::json!({ "repository": name, "descriptor": descriptor })),
                    );
                }
            }
            Ok(())
        }
        Commands::Search { query } => {
            engine.update_stale_repositories()?;
            handle_search(&engine, &query)
        }
        Commands::Requires { package, latest, depot } => {
            engine.update_stale_repositories()?;
            handle_requires(&engine, &package, selection(latest), &depot)
        }
        Commands::Install {
            package,
            variant,
            latest,
            compile,
            depot,
        } => {
            engine.update_stale_repositories()?;
            let defn = engine.find_definition(&package, selection(latest))?;
            let options = ImportOptions {
                depot,
                compile,
                verbose: cli.verbose,
            };
            let report = engine.install_definition(defn, variant.as_deref(), &options)?;
            finish_import(&report)
        }
        Commands::Import { archive, compile, depot } => {
            engine.update_stale_repositories()?;
            let options = ImportOptions {
                depot,
                compile,
                verbose: cli.verbose,
            };
            let report = engine.import(None, &archive, &options)?;
            finish_import(&report)
        }
        Commands::Export { package, output, depot } => {
            let depot = Depot::get_enabled(&engine.config, &depot)?;
            let exporter = ArchiveExporter::new(&engine, &depot)?;
            let package = exporter.resolve_entry(&package)?;
            let archive = exporter.export(&package, &output)?;
            emit(
                Level::Success,
                "export.complete",
                &format!("Exported {package} to {}", archive.display()),
                None,
            );
            Ok(())
        }
        Commands::DistroDeps { package, phase } => {
            engine.update_stale_repositories()?;
            handle_distro_deps(&engine, &package, phase, prompting.non_interactive)
        }
        Commands::Depot { command } => handle_depot(&engine, command, &prompting),
        Commands::Requests { command } => handle_requests(&engine.config, command, &prompting),
        Commands::Whitelist { command } => handle_whitelist(&engine.config, command),
    }
}

fn selection(latest: bool) -> Selection {
    if latest { Selection::Latest } else { Selection::Exact }
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

fn finish_import(report: &ImportReport) -> Result<()> {
    if report.is_complete() {
        emit(
            Level::Success,
            "import.complete",
            &format!("Installation of {} complete", report.package_path),
            None,
        );
        Ok(())
    } else {
        Err(GridwareError::Unresolvable(format!(
            "{} was not fully installed",
            report.package_path
        ))
        .into())
    }
}

fn handle_search(engine: &Engine<HostRunner>, query: &str) -> Result<()> {
    let found = engine.find_definitions(query)?;
    if found.is_empty() {
        emit(
            Level::Warn,
            "search.none",
            &format!("No matching package found for: {query}"),
            None,
        );
        return Ok(());
    }
    if get_output_format() == OutputFormat::Json {
        for defn in found {
            emit(
                Level::Info,
                "search.result",
                &defn.path(),
                Some(serde_json::json!({
                    "path": defn.path(),
                    "summary": defn.metadata.summary,
                    "repository": engine.repos.get(&defn.repo_name).map(|r| r.descriptor()),
                })),
            );
        }
        return Ok(());
    }
    let mut table = table(&["Package", "Summary"]);
    for defn in found {
        table.add_row(vec![
            defn.path(),
            defn.metadata.summary.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn handle_requires(engine: &Engine<HostRunner>, package: &str, selection: Selection, depot: &str) -> Result<()> {
    let defn = engine.find_definition(package, selection)?;
    title(&format!("Requirements of {}", defn.path()));
    let tree = engine.requirements_tree(defn, Phase::Runtime, depot)?;
    if tree.is_empty() {
        emit(Level::Info, "requires.none", "No requirements", None);
    }
    for node in tree {
        let subject = format!("{}{}", "  ".repeat(node.depth), node.requirement);
        match (&node.installed, &node.definition) {
            (Some(pkg), _) => status(Level::Success, "requires.installed", &subject, &format!("OK ({pkg})")),
            (None, Some(defn)) => status(Level::Warn, "requires.missing", &subject, &format!("MISSING ({defn})")),
            (None, None) => status(Level::Error, "requires.unknown", &subject, "NOT FOUND"),
        }
    }
    Ok(())
}

fn handle_distro_deps(engine: &Engine<HostRunner>, package: &str, phase: Phase, non_interactive: bool) -> Result<()> {
    let defn = engine.find_definition(package, Selection::Exact)?;
    let hook = engine.config.libexec("distro-deps-notify");
    let installer = DistroInstaller {
        utils: &engine.utils,
        runner: &engine.runner,
        invoker: Invoker::current(engine.config.env.sudo_user.as_deref()),
        requests: RequestQueue::new(engine.config.requests_dir()),
        notify_hook: Some(&hook),
    };
    installer.install(defn, InstallOptions { phase, non_interactive })?;
    Ok(())
}

fn handle_depot(engine: &Engine<HostRunner>, command: DepotCommands, prompting: &Prompting) -> Result<()> {
    let config = &engine.config;
    match command {
        DepotCommands::List => {
            let names = depot::list(config)?;
            if get_output_format() == OutputFormat::Json {
                for name in names {
                    emit(Level::Info, "depot.list", &name, None);
                }
                return Ok(());
            }
            let mut table = table(&["Depot", "Enabled", "Location"]);
            for name in names {
                let depot = Depot::get(config, &name)?;
                let enabled = if depot.is_enabled()? { "yes" } else { "no" };
                let location = depot
                    .hash_path(config.is_userspace())
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                table.add_row(vec![name, enabled.to_string(), location]);
            }
            println!("{table}");
            Ok(())
        }
        DepotCommands::Init { name, disabled } => {
            let depot = Depot::create(config, &name)?;
            status(Level::Success, "depot.init", &format!("Creating depot: {name}"), "OK");
            if !disabled {
                depot.enable(&engine.runner)?;
            }
            Ok(())
        }
        DepotCommands::Enable { name } => Depot::get(config, &name)?.enable(&engine.runner),
        DepotCommands::Disable { name } => {
            if !Depot::get(config, &name)?.disable(&engine.runner)? {
                return Err(GridwareError::PermissionDenied(format!(
                    "Depot '{name}' has loaded modules; unload them before disabling it"
                ))
                .into());
            }
            Ok(())
        }
        DepotCommands::Purge { name } => {
            let mode = if prompting.yes {
                PurgeMode::Force
            } else if prompting.can_ask() {
                PurgeMode::Interactive
            } else {
                PurgeMode::NonInteractive
            };
            let confirm = |message: &str| -> Result<bool> {
                Ok(Confirm::new().with_prompt(message).default(false).interact()?)
            };
            Depot::get(config, &name)?.purge(mode, confirm, &engine.runner)?;
            Ok(())
        }
        DepotCommands::Export {
            name,
            output,
            no_packages,
        } => {
            let options = ExportOptions {
                output,
                packages: !no_packages,
            };
            export_depot(engine, &name, &options)?;
            Ok(())
        }
    }
}

fn require_root(config: &Config) -> Result<()> {
    if !Invoker::current(config.env.sudo_user.as_deref()).effective_root {
        return Err(GridwareError::PermissionDenied("This command must be executed as root.".into()).into());
    }
    Ok(())
}

fn ask_decision(request: &requests::PackageRequest) -> Result<Decision> {
    let answer: String = Input::new()
        .with_prompt(format!(
            "User {} wants to install package {}. (I)nstall, install (A)ll, (S)kip, (D)elete?",
            request.user, request.distro_package
        ))
        .validate_with(|input: &String| -> std::result::Result<(), &str> {
            match input.trim().to_lowercase().as_str() {
                "i" | "a" | "s" | "d" => Ok(()),
                _ => Err("answer one of I, A, S or D"),
            }
        })
        .interact_text()?;
    Ok(match answer.trim().to_lowercase().as_str() {
        "i" => Decision::Install,
        "a" => Decision::InstallAll,
        "d" => Decision::Delete,
        _ => Decision::Skip,
    })
}

fn handle_requests(config: &Config, command: RequestCommands, prompting: &Prompting) -> Result<()> {
    require_root(config)?;
    let queue = RequestQueue::new(config.requests_dir());
    match command {
        RequestCommands::List => {
            let pending = queue.list()?;
            if get_output_format() == OutputFormat::Json {
                for r in pending {
                    emit(
                        Level::Info,
                        "requests.list",
                        &r.id,
                        Some(serde_json::json!({
                            "user": r.user,
                            "gridware_package": r.gridware_package,
                            "distro_package": r.distro_package,
                            "repo_path": r.repo_path,
                            "date": r.date.to_rfc3339(),
                        })),
                    );
                }
                return Ok(());
            }
            let mut table = table(&["Id", "User", "Gridware package", "Distro package", "Repo path", "Date"]);
            for r in pending {
                table.add_row(vec![
                    r.id,
                    r.user,
                    r.gridware_package,
                    r.distro_package,
                    r.repo_path,
                    r.date.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }
            println!("Pending installation requests");
            println!("{table}");
            Ok(())
        }
        RequestCommands::Install => {
            if !prompting.yes && !prompting.can_ask() {
                return Err(GridwareError::PermissionDenied(
                    "Refusing to install requests non-interactively; supply the --yes option to override"
                        .into(),
                )
                .into());
            }
            let count = queue.list()?.len();
            title(&format!(
                "Processing {count} installation request{}",
                if count == 1 { "" } else { "s" }
            ));
            let runner = HostRunner;
            let log_root = config.log_root();
            let processor = RequestProcessor {
                queue: &queue,
                runner: &runner,
                family: config.env.distro.family(),
                log_root: &log_root,
            };
            let whitelist = WhitelistStore::new(config.whitelist_path());
            let hook = config.libexec("package-install-notify");
            let results = processor.process(
                |request| {
                    if prompting.yes {
                        Ok(Decision::Install)
                    } else {
                        ask_decision(request)
                    }
                },
                |request| {
                    let home = nix::unistd::User::from_name(&request.user)
                        .ok()
                        .flatten()
                        .map(|u| u.dir);
                    let email = home.map(|h| requests::user_email(&h)).unwrap_or_default();
                    requests::notify_user(&runner, &hook, request, &email)?;
                    whitelist.whitelist_package(&request.distro_package)
                },
            )?;
            for (request, outcome) in results {
                let subject = format!("Installing {} on behalf of {}", request.distro_package, request.user);
                match outcome {
                    RequestOutcome::Installed => status(Level::Success, "requests.installed", &subject, "Done"),
                    RequestOutcome::InstallFailed => {
                        status(Level::Error, "requests.failed", &subject, "INSTALL FAILED")
                    }
                    RequestOutcome::Skipped | RequestOutcome::Deleted => {
                        status(Level::Warn, "requests.skipped", &subject, "NOT INSTALLED")
                    }
                }
            }
            Ok(())
        }
        RequestCommands::Delete { id } => {
            queue.remove(&id)?;
            status(Level::Success, "requests.delete", &format!("Deleting request {id}"), "OK");
            Ok(())
        }
    }
}

fn handle_whitelist(config: &Config, command: WhitelistCommands) -> Result<()> {
    let store = WhitelistStore::new(config.whitelist_path());
    let (kind, entry) = match command {
        WhitelistCommands::List => {
            let whitelist = store.get()?;
            if get_output_format() == OutputFormat::Json {
                emit(
                    Level::Info,
                    "whitelist.list",
                    "Whitelist",
                    Some(serde_json::to_value(&whitelist)?),
                );
                return Ok(());
            }
            let mut table = table(&["Kind", "Entry"]);
            for (kind, entries) in [
                ("user", &whitelist.users),
                ("package", &whitelist.packages),
                ("repo", &whitelist.repos),
            ] {
                for entry in entries {
                    table.add_row(vec![kind.to_string(), entry.clone()]);
                }
            }
            println!("{table}");
            return Ok(());
        }
        WhitelistCommands::User { name } => {
            require_root(config)?;
            store.whitelist_user(&name)?;
            ("user", name)
        }
        WhitelistCommands::Package { name } => {
            require_root(config)?;
            store.whitelist_package(&name)?;
            ("package", name)
        }
        WhitelistCommands::Repo { path } => {
            require_root(config)?;
            store.whitelist_repo(&path)?;
            ("repository", path.display().to_string())
        }
    };
    status(Level::Success, "whitelist.add", &format!("Whitelisting {kind} {entry}"), "OK");
    Ok(())
}
