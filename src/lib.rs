//! # mirror-bot
//!
//! Core of a Telegram bot that mirrors remote content (direct links,
//! torrents, Usenet NZBs, Mega links, Telegram files) into cloud storage.
//!
//! ## Architecture
//!
//! - [`status`]: the [`MirrorStatus`] capability every backend implements
//! - [`engines`]: one adapter per transfer technology
//! - [`registry`]: active, canceled and seeding transfers keyed by [`Uid`]
//! - [`listener`]: per-mirror sequencer (download, archive, extract, upload)
//! - [`render`]: paginated status messages and the refresh spinner
//! - [`commands`]: chat command parsing and dispatch
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mirror_bot::engines::archive::ProcessArchiver;
//! use mirror_bot::engines::gdrive::DriveClient;
//! use mirror_bot::telegram::TeloxideTransport;
//! use mirror_bot::{BotConfig, MirrorContext};
//! use std::sync::Arc;
//!
//! # async fn run() -> mirror_bot::Result<()> {
//! let config = BotConfig::from_env()?;
//! let bot = teloxide::Bot::new(&config.bot_token);
//! let cloud = DriveClient::new(config.drive.clone(), config.retry.clone())?;
//! let ctx = MirrorContext::new(
//!     config,
//!     Arc::new(TeloxideTransport::new(bot)),
//!     Arc::new(cloud),
//!     Arc::new(ProcessArchiver::new()),
//! );
//! assert_eq!(ctx.registry.count(), 0);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod commands;
pub mod config;
pub mod engines;
pub mod error;
pub mod extract;
pub mod fsutil;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod status;
pub mod telegram;
pub mod transport;
pub mod upload_queue;

pub use config::{BotConfig, HttpEngine, RetryConfig, SeedConfig};
pub use error::{MirrorError, NetworkErrorKind, Result, StorageErrorKind, CANCELED_BY_USER};
pub use listener::{CloneListener, MirrorContext, MirrorListener, MirrorOptions, Requester};
pub use protocol::{StatusType, TransferId, Uid};
pub use registry::MirrorRegistry;
pub use render::StatusReporter;
pub use status::{ListenerRef, MirrorStatus, StatusRef, StatusSnapshot, TransferProgress};
pub use transport::{BotTransport, InlineButton, InlineKeyboard, MessageRef};
pub use upload_queue::{UploadPermit, UploadQueue};
