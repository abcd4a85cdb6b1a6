//! mirror-bot binary
//!
//! Wires configuration, engines and the teloxide dispatcher together and
//! tears the mirror core down on Ctrl-C.

use mirror_bot::auth::StaticAuthorizer;
use mirror_bot::commands::{CommandHandler, IncomingCommand, ReplyContext};
use mirror_bot::engines::archive::ProcessArchiver;
use mirror_bot::engines::gdrive::{CloudStorage, DriveClient};
use mirror_bot::engines::telegram::{BotFileClient, MediaFile, MessageMedia, TelegramFileClient};
use mirror_bot::engines::transfer::{TransferClient, TransferCloud};
use mirror_bot::engines::Engines;
use mirror_bot::extract::ExtractorRegistry;
use mirror_bot::telegram::TeloxideTransport;
use mirror_bot::{BotConfig, MirrorContext};
use std::path::Path;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Log to stderr, and also append to `log_file` when one is configured
fn init_logging(log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mirror_bot=info,teloxide=warn"));
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn media_of(msg: &Message) -> Option<MessageMedia> {
    if let Some(doc) = msg.document() {
        return Some(MessageMedia::Document(MediaFile {
            file_id: doc.file.id.to_string(),
            file_name: doc.file_name.clone(),
            size: doc.file.size as i64,
        }));
    }
    if let Some(video) = msg.video() {
        return Some(MessageMedia::Video(MediaFile {
            file_id: video.file.id.to_string(),
            file_name: video.file_name.clone(),
            size: video.file.size as i64,
        }));
    }
    if let Some(audio) = msg.audio() {
        return Some(MessageMedia::Audio(MediaFile {
            file_id: audio.file.id.to_string(),
            file_name: audio.file_name.clone(),
            size: audio.file.size as i64,
        }));
    }
    if msg.photo().is_some() {
        return Some(MessageMedia::Unsupported("Photo"));
    }
    if msg.sticker().is_some() {
        return Some(MessageMedia::Unsupported("Sticker"));
    }
    if msg.voice().is_some() {
        return Some(MessageMedia::Unsupported("Voice"));
    }
    None
}

fn incoming_of(msg: &Message) -> Option<IncomingCommand> {
    let text = msg.text().or_else(|| msg.caption())?;
    let user = msg.from.as_ref()?;
    let reply = msg.reply_to_message().map(|r| ReplyContext {
        message_id: r.id.0,
        text: r.text().or_else(|| r.caption()).map(str::to_string),
        media: media_of(r),
    });
    Some(IncomingCommand {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0,
        user_id: user.id.0 as i64,
        user_name: user.full_name(),
        text: text.to_string(),
        reply,
    })
}

async fn on_message(msg: Message, commands: Arc<CommandHandler>) -> ResponseResult<()> {
    if let Some(incoming) = incoming_of(&msg) {
        tokio::spawn(async move {
            commands.handle(incoming).await;
        });
    }
    Ok(())
}

async fn on_callback(
    bot: Bot,
    query: CallbackQuery,
    commands: Arc<CommandHandler>,
) -> ResponseResult<()> {
    if let (Some(data), Some(message)) = (query.data.as_deref(), query.message.as_ref()) {
        if let Err(e) = commands.handle_callback(message.chat().id.0, data).await {
            tracing::debug!("Callback {} failed: {}", data, e);
        }
    }
    bot.answer_callback_query(query.id.clone()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BotConfig::from_env()?;
    init_logging(config.log_file.as_deref())?;
    tokio::fs::create_dir_all(&config.download_dir).await?;
    info!("Downloads go to {:?}", config.download_dir);

    let bot = Bot::new(&config.bot_token);
    let me = bot.get_me().await?;
    info!("Bot username: @{}", me.username());

    let cloud: Arc<dyn CloudStorage> = match &config.transfer {
        Some(service) => {
            info!("Uploading through the transfer service at {}", service.base_url);
            Arc::new(TransferCloud::new(Arc::new(TransferClient::new(&service.base_url))))
        }
        None => Arc::new(DriveClient::new(config.drive.clone(), config.retry.clone())?),
    };
    let files: Arc<dyn TelegramFileClient> = Arc::new(BotFileClient::new(bot.clone()));
    let engines = Engines::from_config(&config, Some(files))?;
    let auth = StaticAuthorizer::new(
        config.authorized_chats.iter().copied(),
        config.sudo_users.iter().copied(),
    );

    let ctx = MirrorContext::new(
        config,
        Arc::new(TeloxideTransport::new(bot.clone())),
        cloud,
        Arc::new(ProcessArchiver::new()),
    );
    let commands = Arc::new(CommandHandler::new(
        ctx.clone(),
        Arc::new(engines),
        Arc::new(auth),
        ExtractorRegistry::with_defaults()?,
    ));

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    info!("Starting dispatcher");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![commands])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down");
    ctx.uploads.close();
    ctx.reporter.stop();
    ctx.reporter.delete_all().await;
    ctx.registry.clear();
    Ok(())
}
