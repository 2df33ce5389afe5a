// src/main.rs

use anyhow::{bail, Context as _, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use strata::cache::sha256_file;
use strata::config::{Config, DEFAULT_CONFIG_PATH};
use strata::context::Context;
use strata::manifest::FileKind;
use strata::resolver::{self, Goal};
use strata::state::txlog::{self, TxnKind};
use strata::transaction;
use strata::version::Constraint;
use tracing::info;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Package manager with atomic transactions and rollback", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Install root directory
    #[arg(short, long, default_value = "/", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages (name or name@constraint, e.g. openssl@'>= 3.0')
    Install {
        /// Packages to install
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Remove installed packages
    Remove {
        /// Package names to remove
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Upgrade installed packages (all when none given)
    Upgrade {
        /// Package names to upgrade
        names: Vec<String>,
    },
    /// Search repositories for packages
    Search {
        /// Substring to match against names and descriptions
        pattern: String,
    },
    /// Show a package's manifest (installed or best candidate)
    Show {
        /// Package name
        name: String,
    },
    /// Update all repository indexes
    Refresh,
    /// List installed packages
    ListInstalled,
    /// Re-checksum installed files against recorded checksums
    Verify {
        /// Package name to verify (all when omitted)
        name: Option<String>,
    },
    /// Show transaction history
    History,
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse an install target of the form `name` or `name@<constraint>`
fn parse_target(target: &str) -> Result<Goal> {
    match target.split_once('@') {
        Some((name, constraint)) => {
            let constraint: Constraint = constraint
                .parse()
                .with_context(|| format!("invalid constraint in target {target:?}"))?;
            Ok(Goal::Install {
                name: name.to_string(),
                constraint: Some(constraint),
            })
        }
        None => Ok(Goal::Install {
            name: target.to_string(),
            constraint: None,
        }),
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else if path == &PathBuf::from(DEFAULT_CONFIG_PATH) {
        info!("No configuration at {}, using defaults", path.display());
        Ok(Config::default())
    } else {
        bail!("configuration file {} does not exist", path.display());
    }
}

fn print_plan(plan: &resolver::Plan) {
    let installs: Vec<String> = plan.installs().map(|m| m.id().to_string()).collect();
    let removals: Vec<String> = plan.removals().map(|id| id.to_string()).collect();
    if !removals.is_empty() {
        println!("The following packages will be REMOVED:");
        for r in &removals {
            println!("  {r}");
        }
    }
    if !installs.is_empty() {
        println!("The following packages will be installed:");
        for i in &installs {
            println!("  {i}");
        }
    }
}

fn run_transaction(ctx: &mut Context, kind: TxnKind, goals: &[Goal]) -> Result<()> {
    ctx.repos.refresh_stale(&ctx.fetcher);
    let plan = resolver::resolve(goals, ctx.state.records(), &ctx.repos, &ctx.policy())?;
    if plan.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }
    print_plan(&plan);

    let outcome = transaction::execute(ctx, kind, &plan)?;
    println!(
        "Transaction {} {}: {} installed, {} removed",
        outcome.id, outcome.status, outcome.installed, outcome.removed
    );
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Install { targets }) => {
            let goals = targets
                .iter()
                .map(|t| parse_target(t))
                .collect::<Result<Vec<_>>>()?;
            let mut ctx = Context::open(load_config(&cli.config)?, cli.root)?;
            run_transaction(&mut ctx, TxnKind::Install, &goals)
        }
        Some(Commands::Remove { names }) => {
            let goals: Vec<Goal> = names
                .into_iter()
                .map(|name| Goal::Remove { name })
                .collect();
            let mut ctx = Context::open(load_config(&cli.config)?, cli.root)?;
            run_transaction(&mut ctx, TxnKind::Remove, &goals)
        }
        Some(Commands::Upgrade { names }) => {
            let mut ctx = Context::open(load_config(&cli.config)?, cli.root)?;
            let names = if names.is_empty() {
                ctx.state
                    .records()
                    .iter()
                    .map(|r| r.name().to_string())
                    .collect()
            } else {
                names
            };
            if names.is_empty() {
                println!("Nothing installed.");
                return Ok(());
            }
            let goals: Vec<Goal> = names.into_iter().map(|name| Goal::Upgrade { name }).collect();
            run_transaction(&mut ctx, TxnKind::Upgrade, &goals)
        }
        Some(Commands::Search { pattern }) => {
            let mut ctx = Context::open_read_only(load_config(&cli.config)?, cli.root)?;
            ctx.repos.refresh_stale(&ctx.fetcher);
            let hits = ctx.repos.search(&pattern);
            if hits.is_empty() {
                println!("No packages match '{pattern}'.");
            } else {
                for hit in &hits {
                    println!(
                        "{} {} [{}] ({}) - {}",
                        hit.manifest.name,
                        hit.manifest.version,
                        hit.manifest.arch,
                        hit.repo_id,
                        hit.manifest.description
                    );
                }
                println!("\nTotal: {} package(s)", hits.len());
            }
            Ok(())
        }
        Some(Commands::Show { name }) => {
            let mut ctx = Context::open_read_only(load_config(&cli.config)?, cli.root)?;
            ctx.repos.refresh_stale(&ctx.fetcher);

            let (manifest, origin) = if let Some(record) = ctx.state.get(&name) {
                (record.manifest.clone(), "installed".to_string())
            } else if let Some(c) = ctx.repos.candidate(&name, None, ctx.target_arch) {
                (c.manifest.clone(), format!("repository {}", c.repo_id))
            } else {
                bail!("package '{name}' is neither installed nor available");
            };

            println!("Name:         {}", manifest.name);
            println!("Version:      {}", manifest.version);
            println!("Architecture: {}", manifest.arch);
            println!("Source:       {origin}");
            if !manifest.description.is_empty() {
                println!("Description:  {}", manifest.description);
            }
            if !manifest.license.is_empty() {
                println!("License:      {}", manifest.license);
            }
            if !manifest.maintainer.is_empty() {
                println!("Maintainer:   {}", manifest.maintainer);
            }
            println!("Download:     {} bytes", manifest.download_size);
            println!("Installed:    {} bytes", manifest.installed_size);
            if !manifest.depends.is_empty() {
                println!("Depends:");
                for dep in &manifest.depends {
                    println!("  {dep}");
                }
            }
            if !manifest.provides.is_empty() {
                println!("Provides:");
                for p in &manifest.provides {
                    println!("  {p}");
                }
            }
            if !manifest.conflicts.is_empty() {
                println!("Conflicts:");
                for c in &manifest.conflicts {
                    println!("  {c}");
                }
            }
            // Reverse dependencies among installed packages.
            let dependents = strata::state::dependents_of(ctx.state.records(), &name);
            if !dependents.is_empty() {
                println!("Required by:");
                for d in dependents {
                    println!("  {}", d.id());
                }
            }
            Ok(())
        }
        Some(Commands::Refresh) => {
            let mut ctx = Context::open(load_config(&cli.config)?, cli.root)?;
            if ctx.repos.is_empty() {
                println!("No repositories configured.");
                return Ok(());
            }
            let refreshed = ctx.repos.refresh_all(&ctx.fetcher)?;
            println!("Refreshed {refreshed} repository index(es).");
            Ok(())
        }
        Some(Commands::ListInstalled) => {
            let ctx = Context::open_read_only(load_config(&cli.config)?, cli.root)?;
            let records = ctx.state.records();
            if records.is_empty() {
                println!("No packages installed.");
            } else {
                println!("Installed packages:");
                for record in records {
                    let marker = if record.explicit { "" } else { " (dependency)" };
                    println!(
                        "  {} {} [{}]{marker}",
                        record.manifest.name, record.manifest.version, record.manifest.arch
                    );
                }
                println!("\nTotal: {} package(s)", records.len());
            }
            Ok(())
        }
        Some(Commands::Verify { name }) => {
            let ctx = Context::open_read_only(load_config(&cli.config)?, cli.root)?;
            let records: Vec<_> = match &name {
                Some(name) => {
                    let record = ctx
                        .state
                        .get(name)
                        .with_context(|| format!("package '{name}' is not installed"))?;
                    vec![record]
                }
                None => ctx.state.records().iter().collect(),
            };

            let mut problems = 0usize;
            let mut checked = 0usize;
            for record in records {
                for file in &record.files {
                    if !matches!(file.kind, FileKind::Regular | FileKind::Config) {
                        continue;
                    }
                    checked += 1;
                    let path = ctx.prefix.join(&file.path);
                    if !path.is_file() {
                        println!("MISSING  {} ({})", file.path, record.name());
                        problems += 1;
                        continue;
                    }
                    if file.sha256.is_empty() {
                        continue;
                    }
                    if sha256_file(&path)? != file.sha256 {
                        if matches!(file.kind, FileKind::Config) {
                            // User-edited configuration is tracked, not flagged.
                            println!("config   {} (user-edited)", file.path);
                        } else {
                            println!("MODIFIED {} ({})", file.path, record.name());
                            problems += 1;
                        }
                    }
                }
            }
            println!("Checked {checked} file(s), {problems} problem(s).");
            if problems > 0 {
                bail!("{problems} file(s) failed verification");
            }
            Ok(())
        }
        Some(Commands::History) => {
            let ctx = Context::open_read_only(load_config(&cli.config)?, cli.root)?;
            let transactions = txlog::list_transactions(&ctx.state.transactions_dir())?;
            if transactions.is_empty() {
                println!("No transaction history.");
            } else {
                println!("Transaction history:");
                for txn in &transactions {
                    println!(
                        "  [{}] {:?} {} - {}",
                        txn.id,
                        txn.kind,
                        txn.status,
                        txn.targets.join(", ")
                    );
                    if let Some(error) = &txn.error {
                        println!("      error: {error}");
                    }
                }
                println!("\nTotal: {} transaction(s)", transactions.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
        None => {
            println!("Strata Package Manager v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'strata --help' for usage information");
            Ok(())
        }
    }
}
