// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Command-line front end for MyOS: project initialization, mounting the
//! blueprint overlay, template and ACL introspection, config propagation,
//! and export/import packaging.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "myos", version, about = "Project-oriented virtual filesystem overlay")]
pub struct Cli {
    /// Override the templates directory (otherwise MYOS_TEMPLATES_DIR or `<project>/Templates`).
    #[arg(long, global = true, env = "MYOS_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, env = "MYOS_LOG_FORMAT", default_value = "human")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Initialize a new MyOS project.
    Init {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        template: Option<String>,
    },
    /// Mount the blueprint overlay over a project directory.
    Mount {
        path: PathBuf,
        #[arg(long)]
        foreground: bool,
    },
    /// Inspect configured templates.
    Templates {
        #[command(subcommand)]
        cmd: TemplatesCommand,
    },
    /// Check ACL access for a role/path/right combination.
    AclCheck {
        #[arg(long)]
        role: String,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "read")]
        right: String,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Propagate a Config.md section to child projects.
    ConfigPropagate {
        section: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Export a project subtree into a package.
    Export {
        subtree: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        zip: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Import a previously-exported package.
    Import {
        package: PathBuf,
        #[arg(long)]
        target: Option<PathBuf>,
        #[arg(long, default_value = "adopt")]
        mode: String,
        #[arg(long, default_value = "merge")]
        conflict: String,
    },
    /// Sanity-check a project directory and its templates.
    Doctor {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum TemplatesCommand {
    /// List templates available under the templates directory.
    List {
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Show the roles a template contributes.
    Roles {
        name: String,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

pub fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "jsonl" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_templates_dir(cli: &Cli, project: &PathBuf) -> PathBuf {
    cli.templates_dir
        .clone()
        .unwrap_or_else(|| project.join("Templates"))
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let Some(command) = cli.command.clone() else {
        return Ok(());
    };

    match command {
        Commands::Init { dir, template } => {
            let created = myos_project::ProjectConfig::make_project(&dir, template.as_deref())
                .with_context(|| format!("initializing project at {}", dir.display()))?;
            if !created {
                anyhow::bail!("project initialization did not produce a valid project");
            }
            println!("initialized project at {}", dir.display());
            Ok(())
        }
        Commands::Mount { path, foreground } => myos_overlay::mount(path, foreground),
        Commands::Templates { cmd } => run_templates(&cli, cmd),
        Commands::AclCheck { role, path, right, project } => {
            let templates_dir = resolve_templates_dir(&cli, &project);
            let policy = myos_acl::AclPolicy::from_project(&project, &templates_dir);
            let allowed = policy.can_access(&role, &path, &right);
            println!("{allowed}");
            if allowed {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Commands::ConfigPropagate { section, dry_run, project } => {
            let config = myos_project::ProjectConfig::new(&project);
            let results = config.propagate_config(&section, dry_run);
            for (child, updated) in &results {
                println!("{}: {}", child.display(), if *updated { "updated" } else { "skipped (fix)" });
            }
            Ok(())
        }
        Commands::Export { subtree, out, zip, name } => {
            let result = myos_export::export_subtree(&subtree, &out, name.as_deref(), zip)?;
            println!("exported to {}", result.package_path.display());
            if let Some(zip_path) = result.zip_path {
                println!("zipped to {}", zip_path.display());
            }
            Ok(())
        }
        Commands::Import { package, target, mode, conflict } => {
            let result = myos_export::import_package(&package, target.as_deref(), &mode, &conflict)?;
            println!("imported into {}", result.import_root.display());
            Ok(())
        }
        Commands::Doctor { path } => doctor(&cli, &path),
    }
}

fn run_templates(cli: &Cli, cmd: TemplatesCommand) -> Result<()> {
    match cmd {
        TemplatesCommand::List { project } => {
            let templates_dir = resolve_templates_dir(cli, &project);
            for name in myos_templates::list_templates(&templates_dir) {
                println!("{name}");
            }
            Ok(())
        }
        TemplatesCommand::Roles { name, project } => {
            let templates_dir = resolve_templates_dir(cli, &project);
            for role in myos_templates::list_template_roles(&templates_dir, &name) {
                println!("{role}");
            }
            Ok(())
        }
    }
}

fn doctor(cli: &Cli, path: &PathBuf) -> Result<()> {
    let is_project = myos_project::ProjectFinder::is_project(path);
    println!("project valid: {is_project}");
    if !is_project {
        return Ok(());
    }
    let templates_dir = resolve_templates_dir(cli, path);
    println!("templates dir: {} (exists: {})", templates_dir.display(), templates_dir.is_dir());
    let config = myos_project::ProjectConfig::new(path);
    println!("configured templates: {}", config.templates.join(", "));
    let acls_present = path.join(".MyOS/ACLs.md").is_file();
    println!("ACLs.md present: {acls_present}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn init_subcommand_parses() {
        let cli = Cli::parse_from(["myos", "init", "--dir", "/tmp/p", "--template", "standard"]);
        match cli.command {
            Some(Commands::Init { dir, template }) => {
                assert_eq!(dir, PathBuf::from("/tmp/p"));
                assert_eq!(template.as_deref(), Some("standard"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn doctor_reports_invalid_project_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["myos"]);
        doctor(&cli, &dir.path().to_path_buf()).unwrap();
    }
}
