use chrono::format::{Item, StrftimeItems};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Port the server binds on every interface.
pub const DEFAULT_PORT: u16 = 8888;

/// Path clients upgrade on.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// Endpoint handed to the handshaker.
pub const WEBSOCKET_URL: &str = "ws://localhost:8888/websocket";

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%a %b %d %H:%M:%S %Z %Y";

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub workers: u32,
    pub max_request_bytes: usize,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    pub timestamp_format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub broadcast: BroadcastConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = Self::with_defaults()?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_SERVER__WORKERS=4` would set `Settings.server.workers`
            .add_source(
                Environment::with_prefix("app")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Built-in defaults only; no files or environment.
    pub fn defaults() -> Result<Self, ConfigError> {
        let settings: Settings = Self::with_defaults()?.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("environment", "development")?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("server.max_request_bytes", 65536_i64)?
            .set_default("server.shutdown_grace_secs", 5_i64)?
            .set_default("broadcast.timestamp_format", DEFAULT_TIMESTAMP_FORMAT)?
            .set_default("logging.level", "info")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.workers == 0 {
            return Err(ConfigError::Message(
                "server.workers must be at least 1".to_string(),
            ));
        }
        if self.server.max_request_bytes == 0 {
            return Err(ConfigError::Message(
                "server.max_request_bytes must be positive".to_string(),
            ));
        }
        // chrono panics while rendering an invalid pattern, so reject it up front
        if StrftimeItems::new(&self.broadcast.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Message(format!(
                "invalid broadcast.timestamp_format: {}",
                self.broadcast.timestamp_format
            )));
        }
        Ok(())
    }
}
