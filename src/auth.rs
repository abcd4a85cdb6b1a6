//! Command authorization

use async_trait::async_trait;
use std::collections::HashSet;

/// Decides who may drive the bot
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(&self, user_id: i64, chat_id: i64) -> bool;

    /// Sudo users may cancel other users' mirrors
    async fn is_sudo(&self, user_id: i64) -> bool;
}

/// Allow-lists taken from the configuration
///
/// An empty chat list authorizes every chat.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    chats: HashSet<i64>,
    sudo: HashSet<i64>,
}

impl StaticAuthorizer {
    pub fn new(
        chats: impl IntoIterator<Item = i64>,
        sudo: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            chats: chats.into_iter().collect(),
            sudo: sudo.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn is_authorized(&self, user_id: i64, chat_id: i64) -> bool {
        self.chats.is_empty()
            || self.chats.contains(&chat_id)
            || self.chats.contains(&user_id)
            || self.sudo.contains(&user_id)
    }

    async fn is_sudo(&self, user_id: i64) -> bool {
        self.sudo.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authorizer() {
        let auth = StaticAuthorizer::new([-100], [7]);
        assert!(auth.is_authorized(1, -100).await);
        assert!(!auth.is_authorized(1, -200).await);
        assert!(auth.is_authorized(7, -200).await);
        assert!(auth.is_sudo(7).await);
        assert!(!auth.is_sudo(1).await);
    }

    #[tokio::test]
    async fn test_open_when_unconfigured() {
        let auth = StaticAuthorizer::default();
        assert!(auth.is_authorized(1, 2).await);
    }
}
