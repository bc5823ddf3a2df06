//! KL-017: CLI subcommands — apply, validate, compile, version.

use crate::core::catalog::parse_catalog_file;
use crate::core::error::{Error, Result};
use crate::core::executor::RunReport;
use crate::core::graph::Graph;
use crate::core::types::ResourceState;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Converge the host to a catalog
    Apply {
        /// Path to the catalog (JSON, or YAML by extension)
        file: PathBuf,

        /// Exit non-zero when any resource fails
        #[arg(long)]
        strict: bool,
    },

    /// Decode and check a catalog without applying it
    Validate {
        /// Path to the catalog
        file: PathBuf,
    },

    /// Compile a catalog (reserved)
    Compile,

    /// Print the version
    Version,
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Apply { file, strict } => cmd_apply(&file, strict).await,
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Compile => Err(Error::NotImplemented("compile".to_string())),
        Commands::Version => {
            println!("{}", version());
            Ok(())
        }
    }
}

pub fn version() -> String {
    format!("keel version v{}", env!("CARGO_PKG_VERSION"))
}

/// Install the stderr subscriber. `RUST_LOG` wins over the flags.
pub fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A second init (tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Decode a catalog and build a graph, refusing invalid ordering.
fn load_graph(file: &Path) -> Result<Graph> {
    let graph = Graph::new(parse_catalog_file(file)?)?;
    let errors = graph.validate();
    if errors.is_empty() {
        return Ok(graph);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(Error::InvalidSpec(format!("{} validation error(s)", errors.len())))
}

fn cmd_validate(file: &Path) -> Result<()> {
    let graph = load_graph(file)?;
    println!("OK: {} resources", graph.len());
    Ok(())
}

async fn cmd_apply(file: &Path, strict: bool) -> Result<()> {
    let graph = load_graph(file)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            interrupt.cancel();
        }
    });
    let report = graph.apply(&cancel).await;
    watcher.abort();
    let report = report?;

    print_report(&report);
    if strict && report.failed > 0 {
        return Err(Error::Convergence(format!(
            "{} resource(s) failed",
            report.failed
        )));
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for (key, state) in &report.states {
        if *state != ResourceState::Completed {
            println!("  {}: {}", key, state);
        }
    }
    if report.failed > 0 {
        println!(
            "Apply completed with errors: {} completed, {} skipped, {} FAILED ({:.1}s)",
            report.completed,
            report.skipped,
            report.failed,
            report.duration.as_secs_f64()
        );
    } else {
        println!(
            "Apply complete: {} completed, {} skipped ({:.1}s)",
            report.completed,
            report.skipped,
            report.duration.as_secs_f64()
        );
    }
}
