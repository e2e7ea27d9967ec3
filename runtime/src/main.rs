// Copyright 2026 Lead Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use lead_harvest::cli;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "harvest: adaptive lead harvester for professional directories",
    version,
    after_help = "Run 'harvest <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest one source and stream leads as JSON lines
    Run {
        /// Source configuration file
        source: PathBuf,
        /// Target city. Can be repeated.
        #[arg(long = "city")]
        cities: Vec<String>,
        /// Practice area, resolved against the source's vocabulary
        #[arg(long)]
        practice: Option<String>,
        /// Page cap per enumeration unit
        #[arg(long)]
        max_pages: Option<u32>,
        /// Stop starting new pages after this many seconds
        #[arg(long)]
        time_budget: Option<u64>,
        /// Write leads to this JSONL file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Never launch the headless browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Run a batch of jobs with bounded concurrency
    Batch {
        /// Batch plan file
        plan: PathBuf,
        /// Jobs running at once
        #[arg(long, short = 'j', default_value = "4")]
        concurrency: usize,
        /// Per-job timeout in seconds
        #[arg(long, default_value = "1800")]
        timeout: u64,
        /// Skip jobs the ledger marks done
        #[arg(long)]
        resume: bool,
        /// Ledger file (default ~/.lead-harvest/ledger.json)
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Write each job's leads to <DIR>/<job id>.jsonl
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Launch a shared headless browser for browser-only sources
        #[arg(long)]
        browser: bool,
        /// Run each job as this external command (args after `--`)
        #[arg(long)]
        exec: Option<String>,
        /// Arguments for --exec; {id}, {source} and {cities} are substituted
        #[arg(last = true)]
        exec_args: Vec<String>,
    },
    /// Report which strategies find a usable endpoint for a source
    Probe {
        /// Source configuration file
        source: PathBuf,
        /// Never launch the headless browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("lead_harvest={level}")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("HARVEST_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("HARVEST_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("HARVEST_VERBOSE", "1");
    }
    if !cli.quiet || cli.verbose {
        init_tracing(cli.verbose, cli.json);
    }

    let result = match cli.command {
        Commands::Run {
            source,
            cities,
            practice,
            max_pages,
            time_budget,
            output,
            no_browser,
        } => {
            cli::run_cmd::run(cli::run_cmd::RunArgs {
                source,
                cities,
                practice_area: practice,
                max_pages,
                time_budget_secs: time_budget,
                output,
                no_browser,
            })
            .await
        }
        Commands::Batch {
            plan,
            concurrency,
            timeout,
            resume,
            ledger,
            output_dir,
            browser,
            exec,
            exec_args,
        } => {
            cli::batch_cmd::run(cli::batch_cmd::BatchArgs {
                plan,
                concurrency,
                timeout_secs: timeout,
                resume,
                ledger,
                output_dir,
                browser,
                exec,
                exec_args,
            })
            .await
        }
        Commands::Probe { source, no_browser } => cli::probe_cmd::run(&source, no_browser).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "harvest", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        } else if !cli::output::is_quiet() {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
