//! # gxo-cli
//!
//! Command-line front end for the gxo automation engine.

use clap::{Parser, Subcommand};
use gxo_core::orchestrator::{EngineConfig, EngineDeps};
use gxo_core::playbook::Playbook;
use gxo_core::report::ExecutionReport;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gxo")]
#[command(about = "Run and inspect gxo automation playbooks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a playbook without running it
    Validate {
        /// Path to the playbook YAML file
        file: PathBuf,
    },

    /// Run a playbook to completion
    Run {
        /// Path to the playbook YAML file
        file: PathBuf,

        /// Maximum number of tasks to run concurrently
        #[arg(long, default_value_t = 8)]
        workers: usize,

        /// Consecutive stall-detector ticks tolerated before aborting
        #[arg(long, default_value_t = 5)]
        stall_tolerance: u32,

        /// Print the execution report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run {
            file,
            workers,
            stall_tolerance,
            json,
        } => run(&file, workers, stall_tolerance, json).await,
    }
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(file)?;
    let playbook = Playbook::from_yaml(&bytes)?;
    gxo_core::dag::Dag::build(&playbook)?;
    println!("playbook is valid: {} task(s)", playbook.tasks.len());
    Ok(())
}

async fn run(file: &PathBuf, workers: usize, stall_tolerance: u32, json: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(file)?;
    let playbook = Playbook::from_yaml(&bytes)?;

    let registry = prometheus::Registry::new();
    let metrics = std::sync::Arc::new(gxo_core::metrics::Metrics::new(&registry)?);
    let deps = EngineDeps {
        metrics,
        ..EngineDeps::default()
    };

    let config = EngineConfig {
        worker_count: workers.max(1),
        stall_tolerance: stall_tolerance.max(1),
        stall_tick: Duration::from_millis(500),
        ..EngineConfig::default()
    };

    tracing::info!(file = %file.display(), tasks = playbook.tasks.len(), "starting playbook run");
    let report = gxo_core::run_playbook(&playbook, deps, config).await?;

    print_report(&report, json);

    std::process::exit(report.exit_code());
}

fn print_report(report: &ExecutionReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!("failed to serialize report: {e}"),
        }
        return;
    }
    println!("status: {:?}", report.status);
    println!(
        "tasks: {} total, {} completed, {} failed, {} skipped",
        report.total_tasks, report.completed, report.failed, report.skipped
    );
    for (id, result) in &report.tasks {
        if result.status == gxo_core::runner::TaskStatus::Failed {
            println!("  {id}: {:?} ({})", result.status, result.error.as_deref().unwrap_or(""));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_accepts_minimal_playbook() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "schema_version: \"1.0\"\ntasks:\n  - name: only\n    type: mock\n"
        )
        .unwrap();
        assert!(validate(&file.path().to_path_buf()).is_ok());
    }

    #[test]
    fn validate_rejects_cyclic_playbook() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"schema_version: "1.0"
tasks:
  - name: a
    type: mock
    register: a_out
    params:
      x: "{{{{ .b_out }}}}"
  - name: b
    type: mock
    register: b_out
    params:
      x: "{{{{ .a_out }}}}"
"#
        )
        .unwrap();
        assert!(validate(&file.path().to_path_buf()).is_err());
    }
}
