use crate::error::AppError;
use serde::Deserialize;

/// Settings every service in the workspace shares: the HTTP bind port
/// and the deployment environment. Services flatten this into their own
/// config type and hang their sections (database, redis, ...) off it.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Config {
    /// Source `.env`, then layer an optional `configuration` file under
    /// `APP__`-prefixed environment variables. A bare `ENVIRONMENT`
    /// variable wins over both, so deploy manifests stay short.
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let layered = config::Config::builder()
            .add_source(config::File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mut loaded: Self = layered.try_deserialize()?;
        if let Ok(environment) = std::env::var("ENVIRONMENT") {
            loaded.environment = environment;
        }
        Ok(loaded)
    }

    /// Production toggles strict config handling: missing settings are
    /// errors instead of defaults.
    pub fn is_prod(&self) -> bool {
        self.environment == "prod"
    }
}
