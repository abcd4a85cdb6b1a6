//! Transfer engine adapters
//!
//! One module per transfer technology. Every download adapter exposes an
//! `add_download` that validates its input, registers a status under the
//! listener's uid and then drives exactly one terminal listener callback
//! from a background task.

pub mod archive;
pub mod aria2;
pub mod gdrive;
pub mod http;
pub mod kedge;
pub mod mega;
pub mod telegram;
pub mod torrent;
pub mod transfer;
pub mod usenet;

use crate::config::BotConfig;
use crate::error::{MirrorError, NetworkErrorKind, Result};
use crate::render::readable_time;
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use self::aria2::{Aria2Client, Aria2Engine};
use self::http::HttpDownloader;
use self::kedge::{KedgeClient, KedgeEngine};
use self::mega::{MegaClient, MegaEngine};
use self::telegram::{TelegramDownloader, TelegramFileClient};
use self::torrent::TorrentDownloader;
use self::transfer::{TransferClient, TransferEngine};
use self::usenet::{NzbGetClient, UsenetEngine};

/// Classify a non-success REST response from `engine`
pub(crate) async fn check_response(engine: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };
    match status {
        StatusCode::NOT_FOUND => Err(MirrorError::NotFound(format!("{}: {}", engine, message))),
        StatusCode::CONFLICT => Err(MirrorError::AlreadyExists(format!(
            "{}: {}",
            engine, message
        ))),
        StatusCode::TOO_MANY_REQUESTS => Err(MirrorError::network(
            NetworkErrorKind::RateLimited,
            format!("{}: {}", engine, message),
        )),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(MirrorError::engine(engine, message))
        }
        _ => Err(MirrorError::network(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("{}: {}", engine, message),
        )),
    }
}

/// Line reported when a torrent stops seeding
pub fn seed_summary(name: &str, ratio: f64, seeding_time: Duration) -> String {
    format!(
        "{} | Ratio: {:.2} | Seed time: {}",
        name,
        ratio,
        readable_time(seeding_time)
    )
}

/// Every download adapter available to the command surface
///
/// Optional adapters are `None` when their service is not configured.
pub struct Engines {
    pub http: Arc<HttpDownloader>,
    pub aria2: Option<Arc<Aria2Engine>>,
    pub torrent: Option<Arc<TorrentDownloader>>,
    pub kedge: Option<Arc<KedgeEngine>>,
    pub mega: Option<Arc<MegaEngine>>,
    pub usenet: Option<Arc<UsenetEngine>>,
    pub telegram: Option<Arc<TelegramDownloader>>,
    pub transfer: Option<Arc<TransferEngine>>,
}

impl Engines {
    /// Build the REST/JSON-RPC backed adapters described by `config`
    pub fn from_config(
        config: &BotConfig,
        telegram: Option<Arc<dyn TelegramFileClient>>,
    ) -> Result<Self> {
        let aria2 = config
            .aria2
            .as_ref()
            .map(|c| Aria2Engine::new(Arc::new(Aria2Client::new(&c.rpc_url, c.secret.clone()))));
        let kedge = config.kedge.as_ref().map(|c| {
            KedgeEngine::new(Arc::new(KedgeClient::new(&c.base_url)), config.seed.clone())
        });
        let mega = config
            .mega
            .as_ref()
            .map(|c| MegaEngine::new(Arc::new(MegaClient::new(&c.base_url))));
        let usenet = config
            .nzbget
            .as_ref()
            .map(|c| UsenetEngine::new(Arc::new(NzbGetClient::new(c))));
        let transfer = config
            .transfer
            .as_ref()
            .map(|c| TransferEngine::new(Arc::new(TransferClient::new(&c.base_url))));

        Ok(Self {
            http: Arc::new(HttpDownloader::new()?),
            aria2,
            torrent: None,
            kedge,
            mega,
            usenet,
            telegram: telegram.map(TelegramDownloader::new),
            transfer,
        })
    }

    /// Plug in a local torrent engine
    pub fn with_torrent(mut self, torrent: Arc<TorrentDownloader>) -> Self {
        self.torrent = Some(torrent);
        self
    }
}
