use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use nl_pg::config::{AppConfig, CliArgs};
use nl_pg::util::logging::init_tracing;
use nl_pg::web::{self, state::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("pretty");
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(&config.logging.format);

    info!(
        "Schema cache TTL {}s, session idle timeout {}s, up to {} pools of {} connections",
        config.cache.schema_ttl_secs,
        config.session.idle_timeout_secs,
        config.database.max_pools,
        config.database.pool_max_size
    );

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config));

    // Start the web server
    info!("Starting nl-pg server on {}:{}", web_config.host, web_config.port);
    match web::run_server(web_config, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
