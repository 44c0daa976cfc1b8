use serde::Deserialize;
use strum::{Display, EnumString};

/// Which object store backs the key-value store.
#[derive(Debug, Clone, Copy, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible bucket (production).
    S3,
    /// Directory tree on the local filesystem (development).
    Local,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Trigger server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Samsara API token
    pub samsara_api_key: String,

    /// Samsara API base URL
    #[serde(default = "default_samsara_base_url")]
    pub samsara_base_url: String,

    /// Object store used for rounds and retrieval handles
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    /// Base directory for the local storage backend
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Bucket name (S3 backend)
    pub s3_bucket: Option<String>,

    /// Bucket region (S3 backend)
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// Custom endpoint URL for S3-compatible stores (R2, MinIO)
    pub s3_endpoint: Option<String>,

    /// Access key ID (S3 backend)
    pub s3_access_key: Option<String>,

    /// Secret access key (S3 backend)
    pub s3_secret_key: Option<String>,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Webhook receiving slug bug notifications
    pub notify_webhook_url: String,

    /// Offsets from the alert incident time at which images are captured
    /// (comma-separated milliseconds)
    #[serde(default = "default_capture_offsets_ms")]
    pub capture_offsets_ms: Vec<i64>,

    /// Seconds between worker sweeps
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Run a single worker sweep and exit
    #[serde(default)]
    pub worker_run_once: bool,

    /// Address for the worker's Prometheus scrape listener (e.g., "0.0.0.0:9100")
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_samsara_base_url() -> String {
    "https://api.samsara.com".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_storage_dir() -> String {
    "storage".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

// The alert incident time is 10s before the button press.
// Capture 3s before, 1s after and 4s after the press.
fn default_capture_offsets_ms() -> Vec<i64> {
    vec![7_000, 11_000, 14_000]
}

fn default_poll_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
