//! Telegram Bot API transport backed by teloxide

use crate::error::{MirrorError, Result};
use crate::transport::{BotTransport, InlineKeyboard, MessageRef};
use async_trait::async_trait;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, ReplyParameters,
};
use teloxide::{ApiError, RequestError};

/// [`BotTransport`] over a teloxide [`Bot`]
#[derive(Clone)]
pub struct TeloxideTransport {
    bot: Bot,
}

impl TeloxideTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn markup(keyboard: &InlineKeyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.text.clone(), b.callback_data.clone()))
            .collect::<Vec<_>>()
    }))
}

fn transport_error(err: RequestError) -> MirrorError {
    MirrorError::Transport(err.to_string())
}

fn message_ref(message: &Message) -> MessageRef {
    MessageRef {
        chat_id: message.chat.id.0,
        message_id: message.id.0,
    }
}

#[async_trait]
impl BotTransport for TeloxideTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(id)));
        }
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(markup(keyboard));
        }
        let sent = request.await.map_err(transport_error)?;
        Ok(message_ref(&sent))
    }

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(message.chat_id), MessageId(message.message_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(markup(keyboard));
        }
        match request.await {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(transport_error(e)),
        }
    }

    async fn delete_message(&self, message: MessageRef) -> Result<()> {
        self.bot
            .delete_message(ChatId(message.chat_id), MessageId(message.message_id))
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        path: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        let mut request = self
            .bot
            .send_document(ChatId(chat_id), InputFile::file(path.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::Html);
        if let Some(id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(id)));
        }
        let sent = request.await.map_err(transport_error)?;
        Ok(message_ref(&sent))
    }
}
