//! Core protocol types
//!
//! Identities and enums shared by the registry, the listeners, the
//! renderer and every engine adapter.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of the chat message that started a mirror
///
/// This is the registry key: one mirror operation, one uid, for the whole
/// download → archive → upload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid {
    pub chat_id: i64,
    pub message_id: i32,
}

impl Uid {
    pub fn new(chat_id: i64, message_id: i32) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }

    /// Name of the per-mirror directory under the download root
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.chat_id, self.message_id)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.message_id)
    }
}

/// Identifier for transfers driven inside the bot process
///
/// Remote engines (aria2, kedge, NZBGet, ...) hand out their own gids;
/// HTTP downloads, archivers, uploads, clones and Telegram downloads use
/// this one instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Create a new random transfer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// 16-char hex gid shown to users and accepted by `/cancel`.
    ///
    /// Only the first 8 bytes of the UUID are encoded, so use
    /// [`matches_gid`](Self::matches_gid) for lookups.
    pub fn to_gid(&self) -> String {
        hex::encode(&self.0.as_bytes()[0..8])
    }

    /// Check whether this id's first 8 bytes match the given gid
    pub fn matches_gid(&self, gid: &str) -> bool {
        gid.len() == 16 && self.to_gid().eq_ignore_ascii_case(gid)
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_gid())
    }
}

/// Stage a transfer is in, as shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    Downloading,
    Uploading,
    Archiving,
    UnArchiving,
    Waiting,
    Canceled,
    Failed,
    Seeding,
    Cloning,
}

impl StatusType {
    /// Label used in status messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::Downloading => "Downloading...📥",
            Self::Uploading => "Uploading...📤",
            Self::Archiving => "Archiving...🔐",
            Self::UnArchiving => "Extracting...📂",
            Self::Waiting => "Queued...📝",
            Self::Canceled => "Canceled❎",
            Self::Failed => "Failed🚫",
            Self::Seeding => "Seeding...🌧",
            Self::Cloning => "Cloning...♻️",
        }
    }

    /// Whether a user may cancel a transfer in this stage
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Downloading | Self::Seeding)
    }

    /// Whether this stage moves bytes towards the cloud
    pub fn is_upload(&self) -> bool {
        matches!(self, Self::Uploading | Self::Cloning)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Archiving => "archiving",
            Self::UnArchiving => "extracting",
            Self::Waiting => "queued",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Seeding => "seeding",
            Self::Cloning => "cloning",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_gid_returns_16_char_hex_string() {
        let id = TransferId::new();
        let gid = id.to_gid();
        assert_eq!(gid.len(), 16);
        assert!(gid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn matches_gid_works_without_round_trip() {
        let id = TransferId::new();
        let gid = id.to_gid();
        assert!(id.matches_gid(&gid));
        assert!(id.matches_gid(&gid.to_uppercase()));
        assert!(!TransferId::new().matches_gid(&gid));
        assert!(!id.matches_gid("abc"));
    }

    #[test]
    fn uid_dir_name_and_display() {
        let uid = Uid::new(-100123, 42);
        assert_eq!(uid.dir_name(), "-100123_42");
        assert_eq!(uid.to_string(), "-100123:42");
    }

    #[test]
    fn only_downloads_and_seeds_are_cancellable() {
        assert!(StatusType::Downloading.is_cancellable());
        assert!(StatusType::Seeding.is_cancellable());
        for st in [
            StatusType::Uploading,
            StatusType::Archiving,
            StatusType::UnArchiving,
            StatusType::Waiting,
            StatusType::Cloning,
            StatusType::Canceled,
            StatusType::Failed,
        ] {
            assert!(!st.is_cancellable(), "{st} should not be cancellable");
        }
    }
}
