//! Noctis settings, which are configurable using environment variables.
//!
//! Every option is mirrored as `NOCTIS_<SECTION>_<KEY>`, e.g.
//! `NOCTIS_SCP_PORT`, `NOCTIS_INDEX_URL`, `NOCTIS_IDS_RATE_LIMIT_REQUESTS`.
use crate::types::{ClientAETitle, OurAETitle};
use camino::Utf8PathBuf;
use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::OnceLock;

static CONFIG: OnceLock<Figment> = OnceLock::new();

pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(|| {
        Figment::new()
            .merge(Env::prefixed("NOCTIS_").split("_"))
            .merge(Env::prefixed("NOCTIS_"))
    })
}

#[derive(Debug, Deserialize)]
pub struct NoctisEnvOptions {
    #[serde(default)]
    pub scp: ScpSettings,
    #[serde(default = "default_max_associations")]
    pub scp_max_associations: usize,
    #[serde(default = "default_max_pdu_length")]
    pub scp_max_pdu_length: u32,
    /// Comma-separated calling AE titles allowed to store. Empty accepts all.
    #[serde(default)]
    pub scp_allowed_calling_ae_titles: String,
    #[serde(default = "default_listener_threads")]
    pub scp_listener_threads: NonZeroUsize,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub scp_idle_timeout: std::time::Duration,
    /// Upper bound on the lifetime of one association, unlimited by default.
    #[serde(with = "humantime_serde", default)]
    pub scp_total_timeout: Option<std::time::Duration>,

    pub store: StoreSettings,
    #[serde(default)]
    pub store_verify_digest_on_read: bool,

    pub index: IndexSettings,
    #[serde(default = "default_max_conns")]
    pub index_max_conns: NonZeroU32,

    #[serde(default)]
    pub ids: IdsSettings,
    #[serde(default = "default_base_path")]
    pub ids_base_path: String,
    #[serde(default)]
    pub ids_render_workers: Option<NonZeroUsize>,
    #[serde(default = "default_rate_limit_requests")]
    pub ids_rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window")]
    pub ids_rate_limit_window_seconds: u64,
    #[serde(default = "default_l1_bytes")]
    pub ids_cache_l1_bytes: u64,
    #[serde(default)]
    pub ids_cache_l2_url: Option<String>,
    #[serde(default = "default_image_ttl")]
    pub ids_cache_image_ttl_seconds: u64,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub ids_request_timeout: std::time::Duration,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Deserialize)]
pub struct ScpSettings {
    /// Our AE title.
    #[serde(default = "default_aet")]
    pub aet: OurAETitle,
    #[serde(default = "default_scp_port")]
    pub port: u16,
    /// Whether receiving PDUs must not surpass the negotiated maximum PDU length.
    #[serde(default)]
    pub strict: bool,
}

impl Default for ScpSettings {
    fn default() -> Self {
        Self {
            aet: default_aet(),
            port: default_scp_port(),
            strict: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreSettings {
    /// Root directory of the object store.
    pub root: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct IndexSettings {
    /// Connection string of the metadata index database.
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct IdsSettings {
    /// Bind address of the image delivery HTTP server.
    #[serde(default = "default_ids_bind")]
    pub bind: String,
}

impl Default for IdsSettings {
    fn default() -> Self {
        Self {
            bind: default_ids_bind(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "plain" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl NoctisEnvOptions {
    /// The configured calling AE title allow list. Empty means accept all.
    pub fn allowed_calling_ae_titles(&self) -> Vec<ClientAETitle> {
        parse_ae_title_list(&self.scp_allowed_calling_ae_titles)
    }

    pub fn render_workers(&self) -> usize {
        self.ids_render_workers
            .map(NonZeroUsize::get)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(4)
            })
    }
}

fn parse_ae_title_list(s: &str) -> Vec<ClientAETitle> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ClientAETitle::from)
        .collect()
}

fn default_aet() -> OurAETitle {
    OurAETitle::from_static("STORE_SCP")
}

fn default_scp_port() -> u16 {
    11112
}

fn default_max_associations() -> usize {
    64
}

fn default_max_pdu_length() -> u32 {
    16384
}

fn default_listener_threads() -> NonZeroUsize {
    NonZeroUsize::new(8).unwrap()
}

fn default_idle_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_max_conns() -> NonZeroU32 {
    NonZeroU32::new(10).unwrap()
}

fn default_base_path() -> String {
    "/api/v1/dicom".to_string()
}

fn default_ids_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_rate_limit_requests() -> u32 {
    1000
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_l1_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_image_ttl() -> u64 {
    1800
}

fn default_request_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "plain".to_string()
}
