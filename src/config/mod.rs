use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Diagnostics API bind address (e.g., "127.0.0.1:8787"). Unused by the worker binary.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory for queue documents, the ledger and processed photos
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite connection string for the photo ledger. Derived from `data_dir` when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Redis connection string. When set, queue documents are kept in Redis instead of files.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Ticket/trip backend base URL
    pub api_base_url: String,

    /// Bearer token forwarded to the backend
    #[serde(default)]
    pub api_token: Option<String>,

    /// Reverse geocoding service base URL
    #[serde(default = "default_geocode_url")]
    pub geocode_url: String,

    /// Device gallery directory; gallery copies are skipped when unset
    #[serde(default)]
    pub gallery_dir: Option<PathBuf>,

    #[serde(default = "default_photo_max_width")]
    pub photo_max_width: u32,

    #[serde(default = "default_photo_quality")]
    pub photo_quality: u8,

    #[serde(default = "default_true")]
    pub overlay_enabled: bool,

    #[serde(default = "default_geocode_attempts")]
    pub geocode_attempts: u32,

    #[serde(default = "default_geocode_retry_delay_ms")]
    pub geocode_retry_delay_ms: u64,

    /// Retry budget shared by the action queue and the photo job queue
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_failed_list_capacity")]
    pub failed_list_capacity: usize,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    #[serde(default = "default_worker_idle_backoff_ms")]
    pub worker_idle_backoff_ms: u64,

    #[serde(default = "default_worker_max_empty_polls")]
    pub worker_max_empty_polls: u32,

    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_geocode_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_true() -> bool {
    true
}

fn default_photo_max_width() -> u32 {
    1280
}

fn default_photo_quality() -> u8 {
    70
}

fn default_geocode_attempts() -> u32 {
    3
}

fn default_geocode_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_retry() -> u32 {
    5
}

fn default_failed_list_capacity() -> usize {
    20
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_worker_poll_interval_ms() -> u64 {
    1_000
}

fn default_worker_idle_backoff_ms() -> u64 {
    5_000
}

fn default_worker_max_empty_polls() -> u32 {
    3
}

fn default_audit_retention_days() -> u32 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.data_dir.join("ledger.db").display()
            ),
        }
    }

    pub fn kv_dir(&self) -> PathBuf {
        self.data_dir.join("kv")
    }

    pub fn photo_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    pub fn geocode_retry_delay(&self) -> Duration {
        Duration::from_millis(self.geocode_retry_delay_ms)
    }
}
