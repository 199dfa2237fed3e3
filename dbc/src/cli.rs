//! Subcommands of the `dbc` binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbc::critical_path::{self, CriticalPathReport, TraceFile};
use dbc_common::config::LoadedConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "dbc")]
#[command(author, version, about = "Distributed build client - remote build diagnostics")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON (logs and command output)
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze a recorded build trace and print its critical path
    CriticalPath {
        /// JSON trace with per-minion rule windows and dependency edges
        #[arg(long)]
        trace: PathBuf,
    },

    /// Show the effective configuration and where each value came from
    Config,
}

pub fn critical_path(trace: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(trace)
        .with_context(|| format!("failed to read trace {}", trace.display()))?;
    let file: TraceFile = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse trace {}", trace.display()))?;
    let (build_trace, graph) = file.into_parts();
    info!("Analyzing trace with {} minions", build_trace.minions.len());

    let report = critical_path::analyze(&build_trace, &graph);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &CriticalPathReport) {
    match report.root() {
        Some(root) => println!(
            "Critical path: {} ({} ms, {} rules)",
            root.rule,
            report.longest_chain_ms,
            report.critical_path.len()
        ),
        None => {
            println!("Critical path: no rules recorded");
            return;
        }
    }
    for entry in &report.critical_path {
        println!(
            "  {:<40} {:>8} ms  chain {:>8} ms",
            entry.rule, entry.duration_ms, entry.longest_chain_ms
        );
    }
    println!();
    for minion in &report.minions {
        let rules: usize = minion.threads.iter().map(|t| t.rules.len()).sum();
        println!(
            "Minion {}: {} rules on {} threads",
            minion.minion_id,
            rules,
            minion.threads.len()
        );
    }
}

pub fn show_config(loaded: &LoadedConfig, path: Option<&Path>, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "path": path,
            "config": loaded.config,
            "sources": loaded.sources,
            "warnings": loaded.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match path {
        Some(path) => println!("# config file: {}", path.display()),
        None => println!("# config file: none"),
    }
    for entry in &loaded.sources {
        match &entry.var {
            Some(var) => println!("{} = {}  ({} {})", entry.key, entry.value, entry.source, var),
            None => println!("{} = {}  ({})", entry.key, entry.value, entry.source),
        }
    }
    for warning in &loaded.warnings {
        println!("# warning: {}: {}", warning.key, warning.message);
    }
    Ok(())
}
