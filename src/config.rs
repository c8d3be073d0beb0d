use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub mcmc: McmcConfig,
    pub plots: PlotConfig,
    pub abab: AbabConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Operational mirror of the ingested behavioral events (SQLite), distinct
    /// from the upstream transactional store this crate never touches directly.
    pub analytics_url: String,
    /// Run registry backing store.
    pub registry_url: String,
    /// Directory for immutable Parquet artifacts written by the ingestor.
    pub parquet_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    pub samples_default: usize,
    pub chains_default: usize,
    pub warmup_default: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

/// Computation time budget for the ABAB permutation test, scaled linearly
/// between `timeout_base_secs` at 10,000 permutations and `timeout_max_secs`
/// at 50,000 (the request's validated range).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbabConfig {
    pub timeout_base_secs: u64,
    pub timeout_max_secs: u64,
}

/// Command line arguments for configuration overrides.
#[derive(Parser, Debug, Clone)]
#[command(name = "causal-engine")]
#[command(version, about = "n=1 Causal Analytics Engine")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Analytics database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,causal_engine=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Response cache default TTL (overrides config file, e.g., "300s", "5m")
    #[arg(long, value_name = "DURATION")]
    pub cache_ttl: Option<String>,

    /// Default number of posterior MCMC samples per chain (overrides config file)
    #[arg(long, value_name = "N")]
    pub mcmc_samples: Option<usize>,

    /// Default number of MCMC chains (overrides config file)
    #[arg(long, value_name = "N")]
    pub mcmc_chains: Option<usize>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST, APP_SERVER_PORT
    /// - APP_DATABASE_URL
    /// - APP_LOG_LEVEL
    /// - APP_CACHE_TTL (accepts "300s", "5m")
    /// - APP_MCMC_SAMPLES, APP_MCMC_CHAINS
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.analytics_url = db_url;
            tracing::info!("Override database.analytics_url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(ttl) = std::env::var("APP_CACHE_TTL") {
            match parse_duration_to_secs(&ttl) {
                Ok(val) => {
                    self.cache.default_ttl_secs = val;
                    tracing::info!("Override cache.default_ttl_secs from env: {}", val);
                },
                Err(e) => tracing::warn!(
                    "Invalid APP_CACHE_TTL '{}': {} (keep {})",
                    ttl,
                    e,
                    self.cache.default_ttl_secs
                ),
            }
        }

        if let Ok(samples) = std::env::var("APP_MCMC_SAMPLES")
            && let Ok(val) = samples.parse()
        {
            self.mcmc.samples_default = val;
            tracing::info!("Override mcmc.samples_default from env: {}", val);
        }

        if let Ok(chains) = std::env::var("APP_MCMC_CHAINS")
            && let Ok(val) = chains.parse()
        {
            self.mcmc.chains_default = val;
            tracing::info!("Override mcmc.chains_default from env: {}", val);
        }
    }

    /// Apply command line argument overrides (highest priority).
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.analytics_url = db_url.clone();
            tracing::info!("Override database.analytics_url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(ttl) = &args.cache_ttl {
            match parse_duration_to_secs(ttl) {
                Ok(val) => {
                    self.cache.default_ttl_secs = val;
                    tracing::info!("Override cache.default_ttl_secs from CLI: {}", val);
                },
                Err(e) => tracing::warn!(
                    "Invalid --cache-ttl '{}': {} (keep {})",
                    ttl,
                    e,
                    self.cache.default_ttl_secs
                ),
            }
        }

        if let Some(samples) = args.mcmc_samples {
            self.mcmc.samples_default = samples;
            tracing::info!("Override mcmc.samples_default from CLI: {}", samples);
        }

        if let Some(chains) = args.mcmc_chains {
            self.mcmc.chains_default = chains;
            tracing::info!("Override mcmc.chains_default from CLI: {}", chains);
        }
    }

    /// Validate configuration.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.database.analytics_url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.cache.default_ttl_secs == 0 {
            anyhow::bail!("cache.default_ttl_secs must be > 0");
        }
        if self.mcmc.samples_default == 0 {
            anyhow::bail!("mcmc.samples_default must be > 0");
        }
        if self.mcmc.chains_default < 2 {
            anyhow::bail!("mcmc.chains_default must be >= 2 for a usable R-hat");
        }
        if self.abab.timeout_max_secs < self.abab.timeout_base_secs {
            anyhow::bail!("abab.timeout_max_secs must be >= abab.timeout_base_secs");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            analytics_url: "sqlite://data/analytics.sqlite".to_string(),
            registry_url: "sqlite://data/registry.sqlite".to_string(),
            parquet_dir: "data/raw".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,causal_engine=debug".to_string(),
            file: Some("logs/causal-engine.log".to_string()),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_ttl_secs: 300 }
    }
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self { samples_default: 2000, chains_default: 4, warmup_default: 500, timeout_secs: 30 }
    }
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self { width: 800, height: 500, dpi: 150 }
    }
}

impl Default for AbabConfig {
    fn default() -> Self {
        Self { timeout_base_secs: 10, timeout_max_secs: 30 }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '300s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}
