//! Status message renderer and spinner
//!
//! [`StatusReporter`] turns the registry into paginated HTML pages, keeps
//! one status message per chat up to date, and runs a background refresh
//! loop that stops by itself once nothing is active or seeding.

pub mod progress;

use crate::error::Result;
use crate::protocol::StatusType;
use crate::registry::MirrorRegistry;
use crate::transport::{BotTransport, InlineButton, InlineKeyboard, MessageRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use progress::{escape_html, readable_size, readable_time, render_entry};

/// Callback data carried by disabled pagination buttons
pub const NOOP_CALLBACK: &str = "status:noop";

/// Pagination button actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    First,
    Previous,
    Next,
    Last,
}

impl PageAction {
    pub fn callback_data(&self) -> &'static str {
        match self {
            Self::First => "status:first",
            Self::Previous => "status:prev",
            Self::Next => "status:next",
            Self::Last => "status:last",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::First => "First",
            Self::Previous => "Previous",
            Self::Next => "Next",
            Self::Last => "Last",
        }
    }

    /// Parse button callback data; `None` for no-op or foreign data
    pub fn from_callback(data: &str) -> Option<Self> {
        match data {
            "status:first" => Some(Self::First),
            "status:prev" => Some(Self::Previous),
            "status:next" => Some(Self::Next),
            "status:last" => Some(Self::Last),
            _ => None,
        }
    }

    fn apply(&self, page: usize, total_pages: usize) -> usize {
        let last = total_pages.saturating_sub(1);
        match self {
            Self::First => 0,
            Self::Previous => page.saturating_sub(1),
            Self::Next => (page + 1).min(last),
            Self::Last => last,
        }
    }
}

/// One rendered status page
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub text: String,
    /// Page actually rendered, after clamping
    pub page: usize,
    pub total_pages: usize,
    pub total_entries: usize,
}

/// First/Previous/Next/Last buttons for `page`, or `None` for a single page
pub fn pagination_markup(page: usize, total_pages: usize) -> Option<InlineKeyboard> {
    if total_pages <= 1 {
        return None;
    }
    let has_prev = page > 0;
    let has_next = page + 1 < total_pages;
    let button = |action: PageAction, enabled: bool| {
        let data = if enabled {
            action.callback_data()
        } else {
            NOOP_CALLBACK
        };
        InlineButton::new(action.label(), data, enabled)
    };
    Some(InlineKeyboard {
        rows: vec![
            vec![
                button(PageAction::First, has_prev),
                button(PageAction::Previous, has_prev),
            ],
            vec![
                button(PageAction::Next, has_next),
                button(PageAction::Last, has_next),
            ],
        ],
    })
}

/// Chat-scoped status message state
struct StatusMessage {
    message: MessageRef,
    last_text: String,
    /// Pagination cursor
    page: usize,
}

/// Renders the registry into per-chat status messages
pub struct StatusReporter {
    self_ref: Weak<Self>,
    registry: Arc<MirrorRegistry>,
    transport: Arc<dyn BotTransport>,
    page_size: usize,
    interval: Duration,
    messages: Mutex<HashMap<i64, StatusMessage>>,
    spinner_running: AtomicBool,
    shutdown: CancellationToken,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<MirrorRegistry>,
        transport: Arc<dyn BotTransport>,
        page_size: usize,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            registry,
            transport,
            page_size: page_size.max(1),
            interval,
            messages: Mutex::new(HashMap::new()),
            spinner_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Build one page of the combined progress report
    ///
    /// Out-of-range pages clamp to the last page.
    pub fn render_page(&self, page: usize) -> RenderedPage {
        let pages = self.registry.display_pages(self.page_size);
        let total_pages = pages.len();
        let total_entries: usize = pages.iter().map(Vec::len).sum();
        let page = page.min(total_pages.saturating_sub(1));

        let mut text = String::new();
        let entries = &pages[page];
        if entries.is_empty() {
            text.push_str("<b>No active mirrors.</b>");
        } else {
            let blocks: Vec<String> = entries.iter().map(|s| render_entry(s.as_ref())).collect();
            text.push_str(&blocks.join("\n\n"));
        }

        let (mut dl, mut ul) = (0i64, 0i64);
        for status in pages.iter().flatten() {
            match status.status_type() {
                StatusType::Downloading => dl += status.speed(),
                StatusType::Uploading | StatusType::Cloning | StatusType::Seeding => {
                    ul += status.speed()
                }
                _ => {}
            }
        }
        let _ = write!(
            text,
            "\n\n<b>Page:</b> {}/{} | <b>Tasks:</b> {}\n<b>DL:</b> {}/s | <b>UL:</b> {}/s",
            page + 1,
            total_pages,
            total_entries,
            readable_size(dl),
            readable_size(ul)
        );

        RenderedPage {
            text,
            page,
            total_pages,
            total_entries,
        }
    }

    /// Replace the chat's status message with a fresh one
    pub async fn send_status_message(&self, chat_id: i64, reply_to: Option<i32>) -> Result<()> {
        let previous = self.messages.lock().remove(&chat_id);
        if let Some(previous) = previous {
            if let Err(e) = self.transport.delete_message(previous.message).await {
                tracing::debug!("Failed to delete old status message: {}", e);
            }
        }

        let rendered = self.render_page(0);
        let keyboard = if rendered.total_entries > self.page_size {
            pagination_markup(rendered.page, rendered.total_pages)
        } else {
            None
        };
        let message = self
            .transport
            .send_message(chat_id, reply_to, &rendered.text, keyboard.as_ref())
            .await?;

        self.messages.lock().insert(
            chat_id,
            StatusMessage {
                message,
                last_text: rendered.text,
                page: rendered.page,
            },
        );
        self.start_spinner();
        Ok(())
    }

    /// Re-render every open status message, editing only those that changed
    pub async fn update_all(&self) {
        let open: Vec<(i64, MessageRef, String, usize)> = self
            .messages
            .lock()
            .iter()
            .map(|(chat, m)| (*chat, m.message, m.last_text.clone(), m.page))
            .collect();

        for (chat_id, message, last_text, page) in open {
            let rendered = self.render_page(page);
            if rendered.text == last_text {
                continue;
            }
            let keyboard = pagination_markup(rendered.page, rendered.total_pages);
            match self
                .transport
                .edit_message(message, &rendered.text, keyboard.as_ref())
                .await
            {
                Ok(()) => {
                    let mut messages = self.messages.lock();
                    if let Some(entry) = messages.get_mut(&chat_id) {
                        if entry.message == message {
                            entry.last_text = rendered.text;
                            entry.page = rendered.page;
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to update status message in {}: {}", chat_id, e),
            }
        }
    }

    /// Delete every open status message
    pub async fn delete_all(&self) {
        let open: Vec<MessageRef> = self
            .messages
            .lock()
            .drain()
            .map(|(_, m)| m.message)
            .collect();
        for message in open {
            if let Err(e) = self.transport.delete_message(message).await {
                tracing::debug!("Failed to delete status message: {}", e);
            }
        }
    }

    /// Handle a pagination button press; returns whether the page changed
    pub async fn turn_page(&self, chat_id: i64, action: PageAction) -> Result<bool> {
        let Some((message, current)) = self
            .messages
            .lock()
            .get(&chat_id)
            .map(|m| (m.message, m.page))
        else {
            return Ok(false);
        };

        let total_pages = self.registry.display_pages(self.page_size).len();
        let target = action.apply(current, total_pages);
        if target == current {
            return Ok(false);
        }

        let rendered = self.render_page(target);
        let keyboard = pagination_markup(rendered.page, rendered.total_pages);
        self.transport
            .edit_message(message, &rendered.text, keyboard.as_ref())
            .await?;

        if let Some(entry) = self.messages.lock().get_mut(&chat_id) {
            if entry.message == message {
                entry.last_text = rendered.text;
                entry.page = rendered.page;
            }
        }
        Ok(true)
    }

    /// Current pagination cursor of a chat's status message
    pub fn current_page(&self, chat_id: i64) -> Option<usize> {
        self.messages.lock().get(&chat_id).map(|m| m.page)
    }

    pub fn open_message(&self, chat_id: i64) -> Option<MessageRef> {
        self.messages.lock().get(&chat_id).map(|m| m.message)
    }

    pub fn open_message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_spinning(&self) -> bool {
        self.spinner_running.load(Ordering::SeqCst)
    }

    /// Start the refresh loop unless it is already running
    pub fn start_spinner(&self) {
        if self.spinner_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            self.spinner_running.store(false, Ordering::SeqCst);
            return;
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.interval) => {}
                }
                if this.registry.count_live() == 0 {
                    this.delete_all().await;
                    break;
                }
                this.update_all().await;
            }
            this.spinner_running.store(false, Ordering::SeqCst);
            tracing::debug!("Status spinner stopped");

            // A status message may have been sent while we were winding down
            if !this.shutdown.is_cancelled()
                && this.registry.count_live() > 0
                && this.open_message_count() > 0
            {
                this.start_spinner();
            }
        });
    }

    /// Stop the refresh loop for good
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_page_has_no_markup() {
        assert!(pagination_markup(0, 1).is_none());
        assert!(pagination_markup(0, 0).is_none());
    }

    #[test]
    fn test_markup_enablement() {
        let first = pagination_markup(0, 3).unwrap();
        assert!(!first.button("Previous").unwrap().enabled);
        assert_eq!(first.button("Previous").unwrap().callback_data, NOOP_CALLBACK);
        assert!(first.button("Next").unwrap().enabled);

        let last = pagination_markup(2, 3).unwrap();
        assert!(last.button("Previous").unwrap().enabled);
        assert!(!last.button("Next").unwrap().enabled);
        assert_eq!(last.button("Last").unwrap().callback_data, NOOP_CALLBACK);
    }

    #[test]
    fn test_page_actions() {
        assert_eq!(PageAction::from_callback("status:next"), Some(PageAction::Next));
        assert_eq!(PageAction::from_callback(NOOP_CALLBACK), None);
        assert_eq!(PageAction::Next.apply(2, 3), 2);
        assert_eq!(PageAction::Previous.apply(0, 3), 0);
        assert_eq!(PageAction::Last.apply(0, 3), 2);
        assert_eq!(PageAction::First.apply(2, 3), 0);
    }
}
