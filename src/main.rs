mod cli;
mod commands;
mod common;
mod config;
mod depends;
mod depot;
mod engine;
mod error;
mod import;
mod package;
mod repo;
mod ui;

use clap::Parser;
use std::io::IsTerminal;

use crate::cli::Cli;
use crate::error::GridwareError;
use crate::ui::prelude::*;

fn error_message(err: &anyhow::Error) -> String {
    if ui::is_debug_enabled() {
        return format!("{err:?}");
    }
    match GridwareError::classify(err) {
        Some(classified) => classified.to_string(),
        None => format!("{err:#}"),
    }
}

fn main() {
    let cli = Cli::parse();

    ui::set_debug_mode(cli.debug);
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let color = !cli.no_color && std::io::stdout().is_terminal();
    colored::control::set_override(color);
    ui::init(format, color);

    if let Err(e) = commands::run(cli) {
        emit(Level::Error, "error", &format!("ERROR: {}", error_message(&e)), None);
        std::process::exit(1);
    }
}
