//! `/clone`: server-side copy of a Drive item

use super::{CommandHandler, IncomingCommand};
use crate::engines::gdrive::{extract_file_id, start_clone};
use crate::error::{MirrorError, Result};
use crate::listener::CloneListener;

pub async fn run(
    handler: &CommandHandler,
    incoming: &IncomingCommand,
    args: &[String],
) -> Result<String> {
    let ctx = handler.context();
    let link = args
        .first()
        .cloned()
        .or_else(|| incoming.reply_link())
        .ok_or_else(|| {
            MirrorError::invalid_input("link", "Send a Drive link along with the command")
        })?;
    let file_id = extract_file_id(&link).ok_or_else(|| {
        MirrorError::invalid_input("link", "Could not find a file id in the Drive link")
    })?;

    let default_parent = ctx.config.gdrive_parent_id.clone();
    let (parent_id, custom_parent) = match args.get(1) {
        Some(requested) if *requested != default_parent => {
            match ctx.cloud.metadata(requested).await {
                Ok(meta) if meta.is_folder => (requested.clone(), true),
                Ok(_) | Err(_) => {
                    tracing::warn!("Clone parent {} unusable, using default", requested);
                    (default_parent, false)
                }
            }
        }
        _ => (default_parent, false),
    };

    let listener = CloneListener::new(ctx.clone(), incoming.uid(), incoming.requester());
    let gid = start_clone(
        listener,
        ctx.cloud.clone(),
        &file_id,
        &parent_id,
        custom_parent,
    )
    .await?;

    if let Err(e) = ctx
        .reporter
        .send_status_message(incoming.chat_id, Some(incoming.message_id))
        .await
    {
        tracing::warn!("Failed to send status message: {}", e);
    }
    Ok(gid)
}
