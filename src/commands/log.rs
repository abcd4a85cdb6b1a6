//! `/log`: send the bot's log file to a sudo user

use super::{CommandHandler, IncomingCommand};
use crate::error::{MirrorError, Result};

pub async fn run(handler: &CommandHandler, incoming: &IncomingCommand) -> Result<()> {
    if !handler.authorizer().is_sudo(incoming.user_id).await {
        return Err(MirrorError::invalid_input(
            "user",
            "Only sudo users can read the log",
        ));
    }
    let ctx = handler.context();
    let path = ctx
        .config
        .log_file
        .as_deref()
        .ok_or_else(|| MirrorError::NotFound("No log file is configured".to_string()))?;
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(MirrorError::NotFound(format!(
            "Log file {} does not exist yet",
            path.display()
        )));
    }

    ctx.transport
        .send_document(incoming.chat_id, Some(incoming.message_id), path, "Bot log")
        .await?;
    Ok(())
}
