use std::env;

const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Postgres connection URL; the in-memory backend is used when unset
    pub database_url: Option<String>,
    /// Upper bound on request bodies (encrypted workspaces can be large)
    pub max_body_bytes: usize,
    /// Allow any origin instead of only same-origin requests
    pub cors_allow_any: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()?;
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let max_body_bytes = match env::var("MAX_BODY_BYTES") {
            Ok(raw) => raw.parse()?,
            Err(_) => DEFAULT_MAX_BODY_BYTES,
        };
        let cors_allow_any = env::var("CORS_ALLOW_ANY")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);

        Ok(Self {
            host,
            port,
            database_url,
            max_body_bytes,
            cors_allow_any,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors_allow_any: true,
        }
    }
}
