mod config;
mod main_lib;

use config::Config;
use main_lib::{build_engine, init_tracing, read_feed, spawn_printer, spawn_status_reporter};
use ratefeed_engine::ChannelSink;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing();

    let (sink, rx) = ChannelSink::new(config.sink_buffer);
    let engine = build_engine(&config, sink)?;
    let printer = spawn_printer(rx, config.output);

    let feed = engine.start().await?;
    let status = spawn_status_reporter(engine.clone(), &config);

    tokio::select! {
        result = read_feed(BufReader::new(tokio::io::stdin()), feed) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
        }
    }

    engine.shutdown().await?;
    if let Some(status) = status {
        status.await?;
    }
    // Dropping the engine releases the sink's sender and ends the printer
    drop(engine);
    printer.await?;
    Ok(())
}
