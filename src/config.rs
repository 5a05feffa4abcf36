use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// Settings applied to every PostgreSQL session the service opens.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseSettings {
    pub statement_timeout_ms: u64,
    pub pool_max_size: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Upper bound on distinct connection pools kept alive at once
    pub max_pools: usize,
}

impl DatabaseSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Server-side defaults for the request-scoped LLM clients.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmSettings {
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: usize,
    pub openrouter_url: String,
    pub ollama_url: String,
    pub app_name: String,
    pub app_url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QuerySettings {
    pub page_size: u32,
    pub execute_page_size: u32,
    pub max_context_queries: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub schema_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String, // "pretty" or "json"
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub web: WebConfig,
    pub database: DatabaseSettings,
    pub llm: LlmSettings,
    pub query: QuerySettings,
    pub cache: CacheSettings,
    pub session: SessionSettings,
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log output format: pretty or json
    #[arg(long)]
    pub log_format: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-pg/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NLPG__WEB__PORT=8080 style overrides
        config_builder = config_builder.add_source(
            Environment::with_prefix("NLPG")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(format) = &args.log_format {
            config.logging.format = format.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.query.page_size == 0 || self.query.execute_page_size == 0 {
            return Err(ConfigError::Message(
                "query page sizes must be greater than zero".to_string(),
            ));
        }
        if self.query.max_context_queries == 0 {
            return Err(ConfigError::Message(
                "query.max_context_queries must be greater than zero".to_string(),
            ));
        }
        if self.database.pool_max_size == 0 {
            return Err(ConfigError::Message(
                "database.pool_max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 30_000,
            pool_max_size: 5,
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
            max_pools: 32,
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            temperature: 0.1,
            max_tokens: 2000,
            openrouter_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            app_name: "nl-pg".to_string(),
            app_url: "http://localhost:3000".to_string(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            page_size: 200,
            execute_page_size: 50,
            max_context_queries: 10,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            schema_ttl_secs: 300,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
        }
    }
}
