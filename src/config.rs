//! Service configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Control API bind address
    pub control_addr: SocketAddr,

    /// Orchard base URL, e.g. `https://orchard.internal:8080`
    pub orchard_host: String,

    /// Header name for the Orchard API key, empty to disable
    pub orchard_api_key_name: String,

    /// Orchard API key value
    pub orchard_api_key: String,

    /// Scheduler poll interval
    pub scheduler_interval: Duration,

    /// Activator poll interval
    pub activator_interval: Duration,

    /// Cleanup sweep interval
    pub cleanup_interval: Duration,

    /// TTL for scheduler lease rows
    pub scheduler_lock_ttl: Duration,

    /// TTL for activator lease rows
    pub activator_lock_ttl: Duration,

    /// Retention window for scheduled instance rows
    pub instance_ttl: Duration,

    /// Working directory for generators without a remote artifact
    pub generator_base_dir: PathBuf,

    /// Whether the control API requires an API key
    pub api_key_enabled: bool,

    /// SHA-256 hex digest of the control API key
    pub api_key_sha256: String,

    /// Whether the control API requires a forwarded client cert header
    pub xfcc_enabled: bool,

    /// Header carrying the forwarded client cert
    pub xfcc_header: String,

    /// Substring the forwarded cert header must contain, empty for any
    pub xfcc_must_contain: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("SPRINKLER_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("SPRINKLER_DATABASE_URL must be set"))?;

        let control_addr: SocketAddr = std::env::var("SPRINKLER_CONTROL_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()?;

        let orchard_host = std::env::var("SPRINKLER_ORCHARD_HOST")
            .unwrap_or_else(|_| "http://localhost:8081".to_string());
        let orchard_api_key_name =
            std::env::var("SPRINKLER_ORCHARD_API_KEY_NAME").unwrap_or_default();
        let orchard_api_key = std::env::var("SPRINKLER_ORCHARD_API_KEY").unwrap_or_default();

        let scheduler_interval = duration_env("SPRINKLER_SCHEDULER_INTERVAL_SECS", 10);
        let activator_interval = duration_env("SPRINKLER_ACTIVATOR_INTERVAL_SECS", 10);
        let cleanup_interval = duration_env("SPRINKLER_CLEANUP_INTERVAL_SECS", 5 * 60);
        let scheduler_lock_ttl = duration_env("SPRINKLER_SCHEDULER_LOCK_TTL_SECS", 60 * 60);
        let activator_lock_ttl = duration_env("SPRINKLER_ACTIVATOR_LOCK_TTL_SECS", 60 * 60);
        let instance_ttl = duration_env("SPRINKLER_INSTANCE_TTL_SECS", 24 * 60 * 60);

        let generator_base_dir = std::env::var("SPRINKLER_GENERATOR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/sprinkler"));

        let api_key_sha256 = std::env::var("SPRINKLER_API_KEY_SHA256").unwrap_or_default();
        let api_key_enabled = bool_env("SPRINKLER_API_KEY_ENABLED");
        let xfcc_enabled = bool_env("SPRINKLER_XFCC_ENABLED");
        let xfcc_header = std::env::var("SPRINKLER_XFCC_HEADER")
            .unwrap_or_else(|_| "x-forwarded-client-cert".to_string());
        let xfcc_must_contain = std::env::var("SPRINKLER_XFCC_MUST_CONTAIN").unwrap_or_default();

        Ok(Config {
            database_url,
            control_addr,
            orchard_host,
            orchard_api_key_name,
            orchard_api_key,
            scheduler_interval,
            activator_interval,
            cleanup_interval,
            scheduler_lock_ttl,
            activator_lock_ttl,
            instance_ttl,
            generator_base_dir,
            api_key_enabled,
            api_key_sha256,
            xfcc_enabled,
            xfcc_header,
            xfcc_must_contain,
        })
    }
}

fn duration_env(name: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(false)
}
