//! `/cancel`: stop a download or a seed
//!
//! Only statuses that are downloading (active partition) or seeding
//! (seeding partition) can be canceled. Anything else is refused without
//! touching the registry.

use super::{CommandHandler, IncomingCommand};
use crate::error::{MirrorError, Result};
use crate::protocol::{StatusType, Uid};
use crate::status::StatusRef;

/// Find the status to cancel, by gid or by the replied-to mirror message
fn lookup(
    handler: &CommandHandler,
    incoming: &IncomingCommand,
    gid: Option<&str>,
) -> Result<StatusRef> {
    let registry = &handler.context().registry;

    if let Some(gid) = gid {
        let active = registry.get_by_gid(gid);
        if let Some(status) = active.as_ref().filter(|s| s.status_type().is_cancellable()) {
            return Ok(status.clone());
        }
        if let Some(seeding) = registry.get_seeding_by_gid(gid) {
            return Ok(seeding);
        }
        return match active {
            Some(status) => Err(refuse(status.status_type())),
            None => Err(MirrorError::NotFound(format!("No task with GID {}", gid))),
        };
    }

    let reply = incoming.reply.as_ref().ok_or_else(|| {
        MirrorError::invalid_input("gid", "Send a GID or reply to the mirror command")
    })?;
    let uid = Uid::new(incoming.chat_id, reply.message_id);
    let active = registry.get_by_uid(uid);
    if let Some(status) = active.as_ref().filter(|s| s.status_type().is_cancellable()) {
        return Ok(status.clone());
    }
    if let Some(seeding) = registry.get_seeding(uid) {
        return Ok(seeding);
    }
    match active {
        Some(status) => Err(refuse(status.status_type())),
        None => Err(MirrorError::NotFound(
            "That message has no running task".to_string(),
        )),
    }
}

fn refuse(current: StatusType) -> MirrorError {
    MirrorError::InvalidState {
        action: "cancel",
        current_state: current.to_string(),
    }
}

/// Cancel the selected task; returns the reply text
pub async fn run(
    handler: &CommandHandler,
    incoming: &IncomingCommand,
    gid: Option<&str>,
) -> Result<String> {
    let status = lookup(handler, incoming, gid)?;

    let owner = status.listener().map(|l| l.requester_id());
    if owner != Some(incoming.user_id) && !handler.authorizer().is_sudo(incoming.user_id).await {
        return Err(MirrorError::InvalidInput {
            field: "gid",
            message: "This task was started by someone else".to_string(),
        });
    }

    let was_seeding = status.status_type() == StatusType::Seeding;
    tracing::info!(
        "User {} cancels {} ({})",
        incoming.user_id,
        status.gid(),
        status.status_type()
    );
    if !status.cancel_mirror().await {
        return Err(MirrorError::engine(
            "cancel",
            format!("The engine refused to stop {}", status.gid()),
        ));
    }
    Ok(if was_seeding {
        format!("Stopping seed of <code>{}</code>", status.gid())
    } else {
        format!("Canceling <code>{}</code>", status.gid())
    })
}
