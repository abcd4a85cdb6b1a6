//! Bot transport boundary
//!
//! The mirror core only talks to Telegram through [`BotTransport`]. Message
//! text is HTML. The teloxide-backed implementation lives in
//! [`crate::telegram`]; tests use a recording fake.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// A message the bot has sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

/// One inline keyboard button
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
    pub enabled: bool,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>, enabled: bool) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
            enabled,
        }
    }
}

/// Inline keyboard attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    /// Find a button by its label
    pub fn button(&self, text: &str) -> Option<&InlineButton> {
        self.rows.iter().flatten().find(|b| b.text == text)
    }
}

/// Outbound Telegram operations used by the core
#[async_trait]
pub trait BotTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef>;

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()>;

    async fn delete_message(&self, message: MessageRef) -> Result<()>;

    async fn send_document(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        path: &Path,
        caption: &str,
    ) -> Result<MessageRef>;
}
