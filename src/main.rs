//! Keel CLI — converge a host to a declarative catalog.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "keel", about = "Declarative host configuration")]
struct Cli {
    /// Log convergence progress (info level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log everything (debug level)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: keel::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    keel::cli::init_logging(cli.verbose, cli.debug);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| keel::core::error::Error::io("unable to start runtime", e))
        .and_then(|rt| rt.block_on(keel::cli::dispatch(cli.command)));

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
