//! Bot configuration
//!
//! All the knobs the mirror core reads: download root, cloud destination,
//! status rendering cadence, upload admission and the endpoints of every
//! external engine. Values come from `MIRROR_*` environment variables
//! (optionally via a `.env` file); the core only consumes the typed struct.

use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Telegram bot token
    pub bot_token: String,

    /// Root directory; each mirror downloads into `<download_dir>/<uid>`
    pub download_dir: PathBuf,

    /// Default Google Drive folder (or team drive) receiving uploads
    pub gdrive_parent_id: String,

    /// Base URL of an index site mirroring the drive root
    pub index_url: Option<String>,

    /// Number of transfers per status page
    pub status_page_size: usize,

    /// How often status messages are refreshed
    #[serde(with = "duration_secs")]
    pub status_update_interval: Duration,

    /// Maximum number of simultaneous cloud uploads
    pub upload_concurrency: usize,

    /// Chats allowed to use the bot
    #[serde(default)]
    pub authorized_chats: Vec<i64>,

    /// Users allowed everywhere
    #[serde(default)]
    pub sudo_users: Vec<i64>,

    /// Engine used for plain HTTP links
    #[serde(default)]
    pub http_engine: HttpEngine,

    /// Seeding policy for seed-mode torrents
    #[serde(default)]
    pub seed: SeedConfig,

    /// Retry policy for cloud provider calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// aria2 JSON-RPC endpoint
    pub aria2: Option<Aria2Config>,

    /// Remote torrent microservice ("kedge")
    pub kedge: Option<ServiceConfig>,

    /// Mega REST proxy
    pub mega: Option<ServiceConfig>,

    /// NZBGet JSON-RPC endpoint
    pub nzbget: Option<NzbGetConfig>,

    /// Remote cloud transfer microservice
    pub transfer: Option<ServiceConfig>,

    /// Google Drive REST settings
    #[serde(default)]
    pub drive: DriveConfig,

    /// File the binary also writes its log to; `/log` sends it to sudo users
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Which engine handles plain HTTP(S) links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpEngine {
    /// Built-in streaming downloader
    #[default]
    Native,
    /// aria2 over JSON-RPC
    Aria2,
}

impl FromStr for HttpEngine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "http" => Ok(Self::Native),
            "aria2" | "aria2c" => Ok(Self::Aria2),
            _ => Err(format!("Invalid http engine: {}", s)),
        }
    }
}

/// Seeding policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Stop seeding once uploaded/size reaches this ratio (0 = ignore)
    pub ratio: f64,

    /// Stop seeding after this long (None = no time limit)
    #[serde(default, with = "opt_duration_secs")]
    pub time: Option<Duration>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            time: None,
        }
    }
}

/// Retry policy for rate-limited provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before the error surfaces
    pub max_attempts: u32,

    /// Fixed sleep between attempts
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(3),
        }
    }
}

/// aria2 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aria2Config {
    pub rpc_url: String,
    pub secret: Option<String>,
}

/// Settings for a REST microservice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
}

/// NZBGet connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbGetConfig {
    pub rpc_url: String,
    pub username: String,
    pub password: String,
}

/// Google Drive REST settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// OAuth access token
    pub access_token: String,

    /// Drive v3 API base
    pub api_base: String,

    /// Upload endpoint base
    pub upload_base: String,

    /// Parent id is a shared (team) drive
    pub is_team_drive: bool,

    /// Resumable upload chunk size in bytes (multiple of 256 KiB)
    pub chunk_size: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            is_team_drive: false,
            chunk_size: 8 * 1024 * 1024,
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            download_dir: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mirror-bot"),
            gdrive_parent_id: "root".to_string(),
            index_url: None,
            status_page_size: 4,
            status_update_interval: Duration::from_secs(5),
            upload_concurrency: 4,
            authorized_chats: Vec::new(),
            sudo_users: Vec::new(),
            http_engine: HttpEngine::Native,
            seed: SeedConfig::default(),
            retry: RetryConfig::default(),
            aria2: None,
            kedge: None,
            mega: None,
            nzbget: None,
            transfer: None,
            drive: DriveConfig::default(),
            log_file: None,
        }
    }
}

impl BotConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set the default upload folder
    pub fn gdrive_parent_id(mut self, id: impl Into<String>) -> Self {
        self.gdrive_parent_id = id.into();
        self
    }

    /// Set the index site base URL
    pub fn index_url(mut self, url: Option<String>) -> Self {
        self.index_url = url;
        self
    }

    /// Set the number of entries per status page
    pub fn status_page_size(mut self, size: usize) -> Self {
        self.status_page_size = size;
        self
    }

    /// Set the status refresh interval
    pub fn status_update_interval(mut self, interval: Duration) -> Self {
        self.status_update_interval = interval;
        self
    }

    /// Set the number of simultaneous uploads
    pub fn upload_concurrency(mut self, max: usize) -> Self {
        self.upload_concurrency = max;
        self
    }

    /// Set the log file served by `/log`
    pub fn log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    /// Load configuration from the environment
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self {
            bot_token: required("MIRROR_BOT_TOKEN")?,
            ..Self::default()
        };

        if let Some(dir) = optional("MIRROR_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(id) = optional("MIRROR_GDRIVE_PARENT_ID") {
            config.gdrive_parent_id = id;
        }
        config.index_url =
            optional("MIRROR_INDEX_URL").map(|u| u.trim_end_matches('/').to_string());
        if let Some(size) = parsed("MIRROR_STATUS_PAGE_SIZE")? {
            config.status_page_size = size;
        }
        if let Some(secs) = parsed::<u64>("MIRROR_STATUS_UPDATE_INTERVAL")? {
            config.status_update_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parsed("MIRROR_UPLOAD_CONCURRENCY")? {
            config.upload_concurrency = max;
        }
        config.authorized_chats = id_list("MIRROR_AUTHORIZED_CHATS")?;
        config.sudo_users = id_list("MIRROR_SUDO_USERS")?;
        if let Some(engine) = optional("MIRROR_HTTP_ENGINE") {
            config.http_engine = engine
                .parse()
                .map_err(|e: String| MirrorError::invalid_input("MIRROR_HTTP_ENGINE", e))?;
        }
        if let Some(ratio) = parsed("MIRROR_SEED_RATIO")? {
            config.seed.ratio = ratio;
        }
        config.seed.time = parsed::<u64>("MIRROR_SEED_TIME")?.map(Duration::from_secs);
        if let Some(attempts) = parsed("MIRROR_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = parsed::<u64>("MIRROR_RETRY_BACKOFF")? {
            config.retry.backoff = Duration::from_secs(secs);
        }

        config.aria2 = optional("MIRROR_ARIA2_RPC_URL").map(|rpc_url| Aria2Config {
            rpc_url,
            secret: optional("MIRROR_ARIA2_SECRET"),
        });
        config.kedge = optional("MIRROR_KEDGE_URL").map(|base_url| ServiceConfig { base_url });
        config.mega = optional("MIRROR_MEGA_URL").map(|base_url| ServiceConfig { base_url });
        config.transfer =
            optional("MIRROR_TRANSFER_URL").map(|base_url| ServiceConfig { base_url });
        config.nzbget = match optional("MIRROR_NZBGET_RPC_URL") {
            Some(rpc_url) => Some(NzbGetConfig {
                rpc_url,
                username: optional("MIRROR_NZBGET_USER").unwrap_or_default(),
                password: optional("MIRROR_NZBGET_PASSWORD").unwrap_or_default(),
            }),
            None => None,
        };
        if let Some(token) = optional("MIRROR_DRIVE_ACCESS_TOKEN") {
            config.drive.access_token = token;
        }
        config.log_file = optional("MIRROR_LOG_FILE").map(PathBuf::from);
        config.drive.is_team_drive = optional("MIRROR_IS_TEAM_DRIVE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.status_page_size == 0 {
            return Err(MirrorError::invalid_input(
                "status_page_size",
                "Must be at least 1",
            ));
        }

        if self.upload_concurrency == 0 {
            return Err(MirrorError::invalid_input(
                "upload_concurrency",
                "Must be at least 1",
            ));
        }

        if self.status_update_interval.is_zero() {
            return Err(MirrorError::invalid_input(
                "status_update_interval",
                "Must be greater than zero",
            ));
        }

        if self.seed.ratio < 0.0 {
            return Err(MirrorError::invalid_input("seed_ratio", "Must be non-negative"));
        }

        if self.gdrive_parent_id.trim().is_empty() {
            return Err(MirrorError::invalid_input(
                "gdrive_parent_id",
                "Must not be empty",
            ));
        }

        if self.drive.chunk_size == 0 || self.drive.chunk_size % (256 * 1024) != 0 {
            return Err(MirrorError::invalid_input(
                "drive_chunk_size",
                "Must be a positive multiple of 256 KiB",
            ));
        }

        Ok(())
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &'static str) -> Result<String> {
    optional(key).ok_or_else(|| MirrorError::invalid_input(key, "Missing environment variable"))
}

fn parsed<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MirrorError::invalid_input(key, format!("Cannot parse '{}'", raw))),
        None => Ok(None),
    }
}

fn id_list(key: &'static str) -> Result<Vec<i64>> {
    let Some(raw) = optional(key) else {
        return Ok(Vec::new());
    };
    raw.split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| MirrorError::invalid_input(key, format!("Invalid id '{}'", s)))
        })
        .collect()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
