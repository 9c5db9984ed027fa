//! selector-server: serve hello-world or echo responses on one event loop.

use selector_server::config::{init_logging, ServerConfig};
use selector_server::Server;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level);

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        protocol = ?config.protocol,
        read_size = config.read_size,
        "Starting selector-server"
    );

    let mut server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Error creating server socket");
            return Err(e.into());
        }
    };

    #[cfg(unix)]
    selector_server::signal::install(server.shutdown_handle())?;

    server.run()?;
    Ok(())
}
