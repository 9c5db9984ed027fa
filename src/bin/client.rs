//! selector-client: open several connections and send each the same messages.

use selector_server::config::{init_logging, ClientConfig};
use selector_server::ClientDriver;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load()?;
    init_logging(&config.log_level);

    info!(
        server = %config.server,
        connections = config.connections,
        messages = config.messages.len(),
        "Starting selector-client"
    );

    let mut driver = ClientDriver::connect(&config)?;

    #[cfg(unix)]
    selector_server::signal::install(driver.shutdown_handle())?;

    let transcripts = driver.run()?;
    for transcript in &transcripts {
        info!(
            connection = transcript.id,
            bytes = transcript.received.len(),
            all_sent = transcript.all_sent,
            "Connection finished"
        );
    }
    Ok(())
}
