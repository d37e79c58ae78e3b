use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    trace_sink_cli::init_tracing();
    let cli = trace_sink_cli::Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let cancel = CancellationToken::new();
    let result = runtime.block_on(async {
        tokio::spawn(trace_sink_cli::cancel_on_shutdown_signal(cancel.clone()));
        trace_sink_cli::run_cli(cli, cancel).await
    });

    // A stdin read may still be parked on the blocking pool; do not wait for it.
    runtime.shutdown_background();
    result
}
