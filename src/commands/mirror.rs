//! `/mirror`, `/tarmirror`, `/unzipmirror` and `/seedmirror`

use super::{CommandHandler, IncomingCommand};
use crate::config::HttpEngine;
use crate::engines::gdrive::{extract_file_id, is_drive_link};
use crate::engines::telegram::MessageMedia;
use crate::error::{MirrorError, Result};
use crate::listener::{MirrorListener, MirrorOptions};
use std::sync::Arc;

/// Post-processing requested by the command name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorKind {
    Plain,
    Tar,
    Unzip,
    Seed,
}

impl MirrorKind {
    fn options(self, parent_id: Option<String>) -> MirrorOptions {
        MirrorOptions {
            is_tar: self == Self::Tar,
            do_unarchive: self == Self::Unzip,
            is_seed: self == Self::Seed,
            parent_id,
        }
    }
}

/// Transfer technology picked for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Torrent,
    Mega,
    Drive,
    Usenet,
    Http,
}

impl Backend {
    /// Pick a backend from the shape of `link`
    pub fn sniff(link: &str) -> Self {
        let lower = link.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or(&lower);
        if lower.starts_with("magnet:") || path.ends_with(".torrent") {
            Self::Torrent
        } else if lower.contains("mega.nz/") || lower.contains("mega.co.nz/") {
            Self::Mega
        } else if is_drive_link(link) {
            Self::Drive
        } else if path.ends_with(".nzb") {
            Self::Usenet
        } else {
            Self::Http
        }
    }
}

fn not_configured(what: &str) -> MirrorError {
    MirrorError::invalid_input("link", format!("No {} engine is configured", what))
}

/// Start a mirror; returns the engine gid
pub async fn run(
    handler: &CommandHandler,
    incoming: &IncomingCommand,
    kind: MirrorKind,
    args: &[String],
) -> Result<String> {
    let ctx = handler.context();
    let parent_id = args.get(1).cloned();
    let listener = MirrorListener::new(
        ctx.clone(),
        incoming.uid(),
        incoming.requester(),
        kind.options(parent_id),
    );

    let link = args.first().cloned().or_else(|| incoming.reply_link());
    let media = incoming.reply.as_ref().and_then(|r| r.media.as_ref());

    let gid = match (link, media) {
        (None, Some(media)) => start_media(handler, media, listener).await?,
        (Some(link), _) => start_link(handler, &link, listener).await?,
        (None, None) => {
            return Err(MirrorError::invalid_input(
                "link",
                "Send a link along with the command or reply to a link or file",
            ))
        }
    };
    tracing::info!("Mirror {} started by {} as {}", incoming.uid(), incoming.user_id, gid);

    if let Err(e) = ctx
        .reporter
        .send_status_message(incoming.chat_id, Some(incoming.message_id))
        .await
    {
        tracing::warn!("Failed to send status message: {}", e);
    }
    Ok(gid)
}

async fn start_media(
    handler: &CommandHandler,
    media: &MessageMedia,
    listener: Arc<MirrorListener>,
) -> Result<String> {
    let engines = handler.engines();
    let telegram = engines
        .telegram
        .as_ref()
        .ok_or_else(|| not_configured("Telegram"))?;

    if media.is_nzb() {
        let usenet = engines.usenet.as_ref().ok_or_else(|| not_configured("Usenet"))?;
        let file = MessageMedia::resolve(Some(media))?;
        let content = telegram.client().fetch(&file.file_id).await?;
        let name = file.file_name.as_deref().unwrap_or("download.nzb");
        return usenet.add_download(name, &content, listener).await;
    }
    telegram.add_download(Some(media), listener).await
}

async fn start_link(
    handler: &CommandHandler,
    link: &str,
    listener: Arc<MirrorListener>,
) -> Result<String> {
    let engines = handler.engines();
    match Backend::sniff(link) {
        Backend::Torrent => {
            if let Some(kedge) = &engines.kedge {
                kedge.add_download(link, listener).await
            } else if let Some(torrent) = &engines.torrent {
                torrent.add_download(link, listener).await
            } else if let Some(aria2) = &engines.aria2 {
                if listener.options().is_seed {
                    return Err(MirrorError::invalid_input(
                        "link",
                        "Seeding needs the kedge or built-in torrent engine, neither is configured",
                    ));
                }
                aria2.add_download(link, listener).await
            } else {
                Err(not_configured("torrent"))
            }
        }
        Backend::Mega => {
            let mega = engines.mega.as_ref().ok_or_else(|| not_configured("Mega"))?;
            mega.add_download(link, listener).await
        }
        Backend::Drive => {
            let transfer = engines
                .transfer
                .as_ref()
                .ok_or_else(|| not_configured("cloud transfer"))?;
            let file_id = extract_file_id(link).ok_or_else(|| {
                MirrorError::invalid_input("link", "Could not find a file id in the Drive link")
            })?;
            transfer.add_download(&file_id, listener).await
        }
        Backend::Usenet => {
            let usenet = engines.usenet.as_ref().ok_or_else(|| not_configured("Usenet"))?;
            usenet.add_link(link, listener).await
        }
        Backend::Http => {
            let direct = handler.extractors().resolve(link).await?;
            let aria2 = engines
                .aria2
                .as_ref()
                .filter(|_| handler.context().config.http_engine == HttpEngine::Aria2);
            match aria2 {
                Some(aria2) => aria2.add_download(&direct, listener).await,
                None => engines.http.add_download(&direct, listener, None).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_backends() {
        assert_eq!(Backend::sniff("magnet:?xt=urn:btih:abc"), Backend::Torrent);
        assert_eq!(Backend::sniff("https://x.org/a.torrent?t=1"), Backend::Torrent);
        assert_eq!(Backend::sniff("https://mega.nz/file/abc#key"), Backend::Mega);
        assert_eq!(
            Backend::sniff("https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUv/view"),
            Backend::Drive
        );
        assert_eq!(Backend::sniff("https://indexer.example/get/Release.nzb"), Backend::Usenet);
        assert_eq!(Backend::sniff("https://example.com/file.zip"), Backend::Http);
    }

    #[test]
    fn test_kind_options() {
        let options = MirrorKind::Tar.options(Some("folder".to_string()));
        assert!(options.is_tar);
        assert!(!options.do_unarchive);
        assert_eq!(options.parent_id.as_deref(), Some("folder"));
        assert!(MirrorKind::Seed.options(None).is_seed);
    }
}
