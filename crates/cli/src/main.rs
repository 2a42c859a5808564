// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

use clap::{CommandFactory, Parser};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = myos_cli::Cli::parse();
    if cli.command.is_none() {
        let mut cmd = myos_cli::Cli::command();
        let _ = cmd.print_help();
        eprintln!();
        return ExitCode::from(2);
    }
    myos_cli::init_tracing(&cli.log_format);
    match myos_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
