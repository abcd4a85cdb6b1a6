//! Bot command surface
//!
//! Parses incoming chat commands and dispatches them into the engines,
//! the registry and the status reporter. Nothing here is tied to teloxide;
//! the binary converts Telegram updates into [`IncomingCommand`]s.

pub mod cancel;
pub mod clone;
pub mod log;
pub mod mirror;
pub mod status;

use crate::auth::Authorizer;
use crate::engines::telegram::MessageMedia;
use crate::engines::Engines;
use crate::error::{MirrorError, Result};
use crate::extract::ExtractorRegistry;
use crate::listener::{MirrorContext, Requester};
use crate::protocol::Uid;
use crate::render::{escape_html, PageAction, NOOP_CALLBACK};
use std::sync::Arc;

pub use mirror::{Backend, MirrorKind};

/// Message a command replies to
#[derive(Debug, Clone, Default)]
pub struct ReplyContext {
    pub message_id: i32,
    pub text: Option<String>,
    pub media: Option<MessageMedia>,
}

/// A chat message carrying a bot command
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    pub chat_id: i64,
    pub message_id: i32,
    pub user_id: i64,
    pub user_name: String,
    pub text: String,
    pub reply: Option<ReplyContext>,
}

impl IncomingCommand {
    /// Registry key of a mirror started by this message
    pub fn uid(&self) -> Uid {
        Uid::new(self.chat_id, self.message_id)
    }

    pub fn requester(&self) -> Requester {
        Requester::new(self.user_id, self.user_name.clone())
    }

    /// First whitespace-separated token of the replied-to text
    pub fn reply_link(&self) -> Option<String> {
        self.reply
            .as_ref()?
            .text
            .as_deref()?
            .split_whitespace()
            .next()
            .map(str::to_string)
    }
}

/// Parsed command with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mirror { kind: MirrorKind, args: Vec<String> },
    Clone { args: Vec<String> },
    Cancel { gid: Option<String> },
    Status,
    Log,
    Help,
}

impl Command {
    /// Parse `/name[@bot] args...`; `None` for text that is not one of ours
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next()?.to_ascii_lowercase();
        let args: Vec<String> = parts.map(str::to_string).collect();

        let command = match name.as_str() {
            "mirror" | "m" => Self::Mirror {
                kind: MirrorKind::Plain,
                args,
            },
            "tarmirror" | "tm" => Self::Mirror {
                kind: MirrorKind::Tar,
                args,
            },
            "unzipmirror" | "um" => Self::Mirror {
                kind: MirrorKind::Unzip,
                args,
            },
            "seedmirror" | "sm" => Self::Mirror {
                kind: MirrorKind::Seed,
                args,
            },
            "clone" => Self::Clone { args },
            "cancel" => Self::Cancel {
                gid: args.into_iter().next(),
            },
            "status" => Self::Status,
            "log" => Self::Log,
            "help" | "start" => Self::Help,
            _ => return None,
        };
        Some(command)
    }
}

const HELP: &str = "<b>Commands</b>\n\
/mirror &lt;link&gt; [parent_id]: mirror to the cloud\n\
/tarmirror &lt;link&gt; [parent_id]: archive, then mirror\n\
/unzipmirror &lt;link&gt; [parent_id]: extract, then mirror\n\
/seedmirror &lt;torrent&gt; [parent_id]: mirror and keep seeding\n\
/clone &lt;drive link&gt; [parent_id]: copy inside the cloud\n\
/cancel &lt;gid&gt;: stop a download or seed (or reply to the mirror)\n\
/status: show running tasks\n\
/log: send the bot log (sudo only)";

/// Dispatches commands for the whole bot
pub struct CommandHandler {
    ctx: Arc<MirrorContext>,
    engines: Arc<Engines>,
    auth: Arc<dyn Authorizer>,
    extractors: ExtractorRegistry,
}

impl CommandHandler {
    pub fn new(
        ctx: Arc<MirrorContext>,
        engines: Arc<Engines>,
        auth: Arc<dyn Authorizer>,
        extractors: ExtractorRegistry,
    ) -> Self {
        Self {
            ctx,
            engines,
            auth,
            extractors,
        }
    }

    pub fn context(&self) -> &Arc<MirrorContext> {
        &self.ctx
    }

    pub fn engines(&self) -> &Arc<Engines> {
        &self.engines
    }

    pub fn extractors(&self) -> &ExtractorRegistry {
        &self.extractors
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.auth
    }

    /// Handle one message; failures are reported back to the chat
    ///
    /// Returns `false` when the text is not a command of this bot.
    pub async fn handle(&self, incoming: IncomingCommand) -> bool {
        let Some(command) = Command::parse(&incoming.text) else {
            return false;
        };
        if !self
            .auth
            .is_authorized(incoming.user_id, incoming.chat_id)
            .await
        {
            tracing::info!(
                "Ignoring {:?} from unauthorized user {} in {}",
                command,
                incoming.user_id,
                incoming.chat_id
            );
            self.reply(&incoming, "You are not authorized to use this bot.")
                .await;
            return true;
        }

        if let Err(e) = self.dispatch(&incoming, command).await {
            tracing::info!("Command from {} failed: {}", incoming.user_id, e);
            self.reply(&incoming, &escape_html(&e.to_string())).await;
        }
        true
    }

    async fn dispatch(&self, incoming: &IncomingCommand, command: Command) -> Result<()> {
        match command {
            Command::Mirror { kind, args } => {
                mirror::run(self, incoming, kind, &args).await?;
            }
            Command::Clone { args } => {
                clone::run(self, incoming, &args).await?;
            }
            Command::Cancel { gid } => {
                let text = cancel::run(self, incoming, gid.as_deref()).await?;
                self.reply(incoming, &text).await;
            }
            Command::Status => status::run(self, incoming).await?,
            Command::Log => log::run(self, incoming).await?,
            Command::Help => self.reply(incoming, HELP).await,
        }
        Ok(())
    }

    /// Pagination button press; returns whether the page changed
    pub async fn handle_callback(&self, chat_id: i64, data: &str) -> Result<bool> {
        if data == NOOP_CALLBACK {
            return Ok(false);
        }
        let action = PageAction::from_callback(data).ok_or_else(|| {
            MirrorError::invalid_input("callback", format!("unknown callback {}", data))
        })?;
        self.ctx.reporter.turn_page(chat_id, action).await
    }

    pub(crate) async fn reply(&self, incoming: &IncomingCommand, text: &str) {
        if let Err(e) = self
            .ctx
            .transport
            .send_message(incoming.chat_id, Some(incoming.message_id), text, None)
            .await
        {
            tracing::warn!("Failed to reply in {}: {}", incoming.chat_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("/mirror https://a.b/c.zip root2"),
            Some(Command::Mirror {
                kind: MirrorKind::Plain,
                args: vec!["https://a.b/c.zip".to_string(), "root2".to_string()],
            })
        );
        assert_eq!(
            Command::parse("/TarMirror@mirror_bot x"),
            Some(Command::Mirror {
                kind: MirrorKind::Tar,
                args: vec!["x".to_string()],
            })
        );
        assert_eq!(
            Command::parse("/cancel abc"),
            Some(Command::Cancel {
                gid: Some("abc".to_string())
            })
        );
        assert_eq!(Command::parse("/cancel"), Some(Command::Cancel { gid: None }));
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/log@mirror_bot"), Some(Command::Log));
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse("/unknown"), None);
    }

    #[test]
    fn test_reply_link() {
        let incoming = IncomingCommand {
            chat_id: 1,
            message_id: 2,
            user_id: 3,
            user_name: "u".to_string(),
            text: "/mirror".to_string(),
            reply: Some(ReplyContext {
                message_id: 1,
                text: Some("magnet:?xt=urn:btih:abc please".to_string()),
                media: None,
            }),
        };
        assert_eq!(
            incoming.reply_link().as_deref(),
            Some("magnet:?xt=urn:btih:abc")
        );
        assert_eq!(incoming.uid(), Uid::new(1, 2));
    }
}
