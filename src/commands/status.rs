//! `/status`

use super::{CommandHandler, IncomingCommand};
use crate::error::Result;

pub async fn run(handler: &CommandHandler, incoming: &IncomingCommand) -> Result<()> {
    let ctx = handler.context();
    if ctx.registry.count_live() == 0 {
        handler.reply(incoming, "No active tasks.").await;
        return Ok(());
    }
    ctx.reporter
        .send_status_message(incoming.chat_id, Some(incoming.message_id))
        .await
}
