use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Debug adapter for Dart programs, speaking DAP on stdio and the VM Service
/// protocol towards the target.
#[derive(Debug, Parser)]
#[command(name = "dart-dap", version, about)]
struct Args {
    /// Log filter, e.g. `info` or `dart_dap=debug` (overrides RUST_LOG).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout belongs to the DAP client; diagnostics go to stderr.
    let filter = match args.log {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("dart-dap starting on stdio");
    dart_dap::server::run_stdio().await?;
    tracing::info!("dap client disconnected, exiting");
    Ok(())
}
