//! Per-mirror state sequencer
//!
//! A [`MirrorListener`] is created when a mirror command is accepted and
//! receives callbacks from the engine adapter driving its download. It
//! sequences the post-download stages (archive, unarchive, upload), swaps
//! the uid's registry entry at every stage, and reports the outcome to the
//! chat. A [`CloneListener`] does the same for server-side clones, which
//! have no download/upload split.
//!
//! Terminal callbacks are guarded: the first one wins and every later
//! terminal callback is a no-op.

use crate::config::BotConfig;
use crate::engines::archive::{ArchiveStatus, ArchiveTool, UnarchiveStatus};
use crate::engines::gdrive::{CloudItem, CloudStorage, UploadStatus};
use crate::fsutil;
use crate::protocol::Uid;
use crate::registry::MirrorRegistry;
use crate::render::{escape_html, readable_size, StatusReporter};
use crate::status::{ListenerRef, StatusRef, TransferProgress};
use crate::transport::BotTransport;
use crate::upload_queue::UploadQueue;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Process-scoped state shared by every listener and adapter
pub struct MirrorContext {
    pub config: Arc<BotConfig>,
    pub registry: Arc<MirrorRegistry>,
    pub transport: Arc<dyn BotTransport>,
    pub reporter: Arc<StatusReporter>,
    pub uploads: Arc<UploadQueue>,
    pub cloud: Arc<dyn CloudStorage>,
    pub archiver: Arc<dyn ArchiveTool>,
}

impl MirrorContext {
    /// Build the registry, reporter and upload queue from `config`
    pub fn new(
        config: BotConfig,
        transport: Arc<dyn BotTransport>,
        cloud: Arc<dyn CloudStorage>,
        archiver: Arc<dyn ArchiveTool>,
    ) -> Arc<Self> {
        let registry = MirrorRegistry::new();
        let reporter = StatusReporter::new(
            registry.clone(),
            transport.clone(),
            config.status_page_size,
            config.status_update_interval,
        );
        let uploads = UploadQueue::new(config.upload_concurrency);
        Arc::new(Self {
            config: Arc::new(config),
            registry,
            transport,
            reporter,
            uploads,
            cloud,
            archiver,
        })
    }

    /// Per-mirror download directory
    pub fn download_dir(&self, uid: Uid) -> PathBuf {
        self.config.download_dir.join(uid.dir_name())
    }

    /// Refresh status messages, or delete them all once nothing is live
    pub async fn refresh_status_messages(&self) {
        if self.registry.count_live() == 0 {
            self.reporter.delete_all().await;
        } else {
            self.reporter.update_all().await;
        }
    }

    /// Reply to the message that started a mirror; failures are logged
    pub async fn notify(&self, uid: Uid, text: &str) {
        if let Err(e) = self
            .transport
            .send_message(uid.chat_id, Some(uid.message_id), text, None)
            .await
        {
            tracing::warn!("Failed to notify {}: {}", uid, e);
        }
    }

    /// Build the success message for an uploaded or cloned item
    fn completion_message(&self, item: &CloudItem, custom_parent: bool, mention: &str) -> String {
        let mut msg = format!(
            "<b>Name:</b> <code>{}</code>\n<b>Size:</b> {}",
            escape_html(&item.name),
            readable_size(item.size)
        );
        if item.is_folder {
            msg.push_str(&format!("\n<b>Type:</b> Folder\n<b>Files:</b> {}", item.files));
        }
        msg.push_str(&format!("\n\n<a href=\"{}\">Drive Link</a>", escape_html(&item.link)));
        if let Some(index) = self.config.index_url.as_deref().filter(|_| !custom_parent) {
            let mut link = format!("{}/{}", index, urlencoding::encode(&item.name));
            if item.is_folder {
                link.push('/');
            }
            msg.push_str(&format!(" | <a href=\"{}\">Index Link</a>", escape_html(&link)));
        }
        msg.push_str(&format!("\n\ncc: {}", mention));
        msg
    }
}

/// Post-download stages requested by the command
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Archive the download before uploading
    pub is_tar: bool,
    /// Extract the download before uploading
    pub do_unarchive: bool,
    /// Keep seeding torrents after the download finishes
    pub is_seed: bool,
    /// Upload destination overriding the configured default
    pub parent_id: Option<String>,
}

/// User who issued the command
#[derive(Debug, Clone)]
pub struct Requester {
    pub user_id: i64,
    pub display_name: String,
}

impl Requester {
    pub fn new(user_id: i64, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }

    /// HTML mention of the user
    pub fn mention(&self) -> String {
        format!(
            "<a href=\"tg://user?id={}\">{}</a>",
            self.user_id,
            escape_html(&self.display_name)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SeedingState {
    #[default]
    NotSeeding,
    Active,
    Finished,
}

#[derive(Debug, Default)]
struct ListenerState {
    /// Set by the first terminal callback
    is_canceled: bool,
    upload_finished: bool,
    seeding: SeedingState,
}

/// Sequencer for one mirror operation
pub struct MirrorListener {
    self_ref: Weak<Self>,
    ctx: Arc<MirrorContext>,
    uid: Uid,
    index: u64,
    requester: Requester,
    options: MirrorOptions,
    is_torrent: AtomicBool,
    state: Mutex<ListenerState>,
}

impl MirrorListener {
    pub fn new(
        ctx: Arc<MirrorContext>,
        uid: Uid,
        requester: Requester,
        options: MirrorOptions,
    ) -> Arc<Self> {
        let index = ctx.registry.generate_index();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            ctx,
            uid,
            index,
            requester,
            options,
            is_torrent: AtomicBool::new(false),
            state: Mutex::new(ListenerState::default()),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Display index shared by every stage of this mirror
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn context(&self) -> &Arc<MirrorContext> {
        &self.ctx
    }

    /// Per-mirror download directory
    pub fn dir(&self) -> PathBuf {
        self.ctx.download_dir(self.uid)
    }

    pub fn set_torrent(&self, is_torrent: bool) {
        self.is_torrent.store(is_torrent, Ordering::SeqCst);
    }

    pub fn is_torrent(&self) -> bool {
        self.is_torrent.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().is_canceled
    }

    /// Handle for statuses to point back at this listener
    pub fn listener_ref(&self) -> Option<ListenerRef> {
        self.self_ref.upgrade().map(ListenerRef::Mirror)
    }

    /// Claim the terminal transition; `false` if another callback already did
    fn begin_terminal(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_canceled {
            return false;
        }
        state.is_canceled = true;
        true
    }

    pub async fn on_download_start(&self, gid: &str) {
        tracing::info!("Mirror {} started as {}", self.uid, gid);
    }

    /// Run the post-download stages and start the upload
    pub async fn on_download_complete(&self) {
        if self.is_canceled() {
            return;
        }
        let Some(status) = self.ctx.registry.get_by_uid(self.uid) else {
            tracing::warn!("Download of {} completed without a registered status", self.uid);
            return;
        };
        let Some(listener) = self.listener_ref() else {
            return;
        };

        let mut name = status.name();
        let mut path = status.path();
        let size = status.total_length();
        tracing::info!("Download complete: {} ({})", name, readable_size(size));

        if self.options.is_seed && self.is_torrent() {
            self.on_seeding_start(status.clone());
        }
        let keep_source = self.seeding_active();

        if self.options.is_tar {
            let progress = Arc::new(TransferProgress::new(name.clone(), size));
            let archive_status = Arc::new(ArchiveStatus::new(
                progress.clone(),
                path.clone(),
                self.index,
                listener.clone(),
            ));
            self.ctx.registry.add(self.uid, archive_status);

            let dir = self.dir();
            let output = dir.join(format!("{}.tar", name));
            match self.ctx.archiver.archive(&path, &output, progress).await {
                Ok(archive) => {
                    if !keep_source && path != dir {
                        if let Err(e) = fsutil::remove_path(&path).await {
                            tracing::warn!("Failed to remove archived source {:?}: {}", path, e);
                        }
                    }
                    name = fsutil::display_name(&archive);
                    path = archive;
                }
                Err(e) => {
                    tracing::warn!("Archiving {} failed: {}", name, e);
                    self.ctx
                        .notify(
                            self.uid,
                            &format!(
                                "Archiving failed: {}\nUploading the original files instead.",
                                escape_html(&e.to_string())
                            ),
                        )
                        .await;
                }
            }
        } else if self.options.do_unarchive {
            let progress = Arc::new(TransferProgress::new(name.clone(), size));
            let unarchive_status = Arc::new(UnarchiveStatus::new(
                progress.clone(),
                path.clone(),
                self.index,
                listener.clone(),
            ));
            self.ctx.registry.add(self.uid, unarchive_status);

            match self.ctx.archiver.extract(&path, progress).await {
                Ok(extracted) => {
                    if !keep_source {
                        if let Err(e) = fsutil::remove_path(&path).await {
                            tracing::warn!("Failed to remove extracted archive {:?}: {}", path, e);
                        }
                    }
                    name = fsutil::display_name(&extracted);
                    path = extracted;
                }
                Err(e) => {
                    tracing::warn!("Extracting {} failed: {}", name, e);
                    self.ctx
                        .notify(
                            self.uid,
                            &format!(
                                "Extraction failed: {}\nUploading the original file instead.",
                                escape_html(&e.to_string())
                            ),
                        )
                        .await;
                }
            }
        }

        if self.is_canceled() {
            return;
        }
        self.start_upload(name, path, listener).await;
    }

    async fn start_upload(&self, name: String, path: PathBuf, listener: ListenerRef) {
        let (parent_id, custom_parent) = self.resolve_parent().await;
        let size = fsutil::path_size(&path).await.unwrap_or(0);

        let progress = Arc::new(TransferProgress::new(name, size));
        let upload_status = Arc::new(UploadStatus::new(
            progress.clone(),
            path.clone(),
            self.index,
            listener,
        ));
        self.ctx.registry.add(self.uid, upload_status.clone());
        tracing::info!("Upload of {} queued into {}", self.uid, parent_id);

        let permit = match self.ctx.uploads.acquire(self.uid).await {
            Ok(permit) => permit,
            Err(e) => {
                self.on_upload_error(&e.to_string()).await;
                return;
            }
        };
        upload_status.set_started();

        let result = self.ctx.cloud.upload(&path, &parent_id, progress).await;
        drop(permit);

        match result {
            Ok(item) => self.on_upload_complete(item, custom_parent).await,
            Err(e) => self.on_upload_error(&e.to_string()).await,
        }
    }

    /// Upload destination and whether it is a custom (non-default) folder
    async fn resolve_parent(&self) -> (String, bool) {
        let default = self.ctx.config.gdrive_parent_id.clone();
        let Some(requested) = self.options.parent_id.as_deref() else {
            return (default, false);
        };
        if requested == default {
            return (default, false);
        }
        match self.ctx.cloud.metadata(requested).await {
            Ok(meta) if meta.is_folder => (requested.to_string(), true),
            Ok(_) => {
                tracing::warn!("Parent {} is not a folder, using default", requested);
                (default, false)
            }
            Err(e) => {
                tracing::warn!("Parent {} lookup failed, using default: {}", requested, e);
                (default, false)
            }
        }
    }

    /// Single funnel for download failures and cancellations
    pub async fn on_download_error(&self, reason: &str) {
        if !self.begin_terminal() {
            return;
        }
        tracing::info!("Mirror {} stopped: {}", self.uid, reason);

        if let Some(status) = self.ctx.registry.get_by_uid(self.uid) {
            self.ctx.registry.move_to_canceled(self.uid, &status);
        }
        self.ctx.refresh_status_messages().await;

        self.ctx
            .notify(
                self.uid,
                &format!(
                    "{} your download has been stopped due to: {}",
                    self.requester.mention(),
                    escape_html(reason)
                ),
            )
            .await;
        self.remove_dir().await;
    }

    pub async fn on_upload_complete(&self, item: CloudItem, custom_parent: bool) {
        if !self.begin_terminal() {
            return;
        }
        tracing::info!("Mirror {} uploaded: {}", self.uid, item.link);

        let seeding = self.finish_upload();
        if let Some(status) = self.ctx.registry.remove(self.uid) {
            status.release();
        }
        self.ctx.refresh_status_messages().await;

        let text = self
            .ctx
            .completion_message(&item, custom_parent, &self.requester.mention());
        self.ctx.notify(self.uid, &text).await;

        if !seeding {
            self.remove_dir().await;
        }
    }

    pub async fn on_upload_error(&self, reason: &str) {
        if !self.begin_terminal() {
            return;
        }
        tracing::warn!("Upload of {} failed: {}", self.uid, reason);

        let seeding = self.finish_upload();
        if let Some(status) = self.ctx.registry.get_by_uid(self.uid) {
            if seeding {
                self.ctx.registry.remove(self.uid);
                status.release();
            } else {
                self.ctx.registry.move_to_canceled(self.uid, &status);
            }
        }
        self.ctx.refresh_status_messages().await;

        self.ctx
            .notify(
                self.uid,
                &format!(
                    "{} upload failed: {}",
                    self.requester.mention(),
                    escape_html(reason)
                ),
            )
            .await;

        if !seeding {
            self.remove_dir().await;
        }
    }

    /// Keep `status` in the seeding partition alongside the upload
    ///
    /// Only the first call has an effect.
    pub fn on_seeding_start(&self, status: StatusRef) {
        {
            let mut state = self.state.lock();
            if state.seeding != SeedingState::NotSeeding {
                return;
            }
            state.seeding = SeedingState::Active;
        }
        self.ctx.registry.move_to_seeding(self.uid, status);
        tracing::info!("Mirror {} is seeding", self.uid);
    }

    /// Seeding reached its ratio or time target, or was stopped by the user
    pub async fn on_seeding_complete(&self, summary: &str) {
        if !self.finish_seeding() {
            return;
        }
        self.ctx
            .notify(
                self.uid,
                &format!("Seeding finished: {}", escape_html(summary)),
            )
            .await;
        self.after_seeding().await;
    }

    pub async fn on_seeding_error(&self, reason: &str) {
        if !self.finish_seeding() {
            return;
        }
        self.ctx
            .notify(
                self.uid,
                &format!("Seeding stopped due to: {}", escape_html(reason)),
            )
            .await;
        self.after_seeding().await;
    }

    fn seeding_active(&self) -> bool {
        self.state.lock().seeding == SeedingState::Active
    }

    /// Mark the upload branch done; returns whether seeding continues
    fn finish_upload(&self) -> bool {
        let mut state = self.state.lock();
        state.upload_finished = true;
        state.seeding == SeedingState::Active
    }

    /// Mark the seeding branch done; `false` if it was not active
    fn finish_seeding(&self) -> bool {
        let mut state = self.state.lock();
        if state.seeding != SeedingState::Active {
            return false;
        }
        state.seeding = SeedingState::Finished;
        true
    }

    async fn after_seeding(&self) {
        if let Some(status) = self.ctx.registry.remove_from_seeding(self.uid) {
            status.release();
        }
        self.ctx.refresh_status_messages().await;

        let upload_finished = self.state.lock().upload_finished;
        if upload_finished {
            self.remove_dir().await;
        }
    }

    async fn remove_dir(&self) {
        let dir = self.dir();
        if let Err(e) = fsutil::remove_path(&dir).await {
            tracing::warn!("Failed to clean {:?}: {}", dir, e);
        }
    }
}

/// Sequencer for a server-side clone
pub struct CloneListener {
    self_ref: Weak<Self>,
    ctx: Arc<MirrorContext>,
    uid: Uid,
    index: u64,
    requester: Requester,
    canceled: AtomicBool,
}

impl CloneListener {
    pub fn new(ctx: Arc<MirrorContext>, uid: Uid, requester: Requester) -> Arc<Self> {
        let index = ctx.registry.generate_index();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            ctx,
            uid,
            index,
            requester,
            canceled: AtomicBool::new(false),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn context(&self) -> &Arc<MirrorContext> {
        &self.ctx
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn listener_ref(&self) -> Option<ListenerRef> {
        self.self_ref.upgrade().map(ListenerRef::Clone)
    }

    pub async fn on_clone_start(&self, gid: &str) {
        tracing::info!("Clone {} started as {}", self.uid, gid);
    }

    pub async fn on_clone_complete(&self, item: CloudItem, custom_parent: bool) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Clone {} done: {}", self.uid, item.link);

        if let Some(status) = self.ctx.registry.remove(self.uid) {
            status.release();
        }
        self.ctx.refresh_status_messages().await;

        let text = self
            .ctx
            .completion_message(&item, custom_parent, &self.requester.mention());
        self.ctx.notify(self.uid, &text).await;
    }

    pub async fn on_clone_error(&self, reason: &str) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Clone {} failed: {}", self.uid, reason);

        if let Some(status) = self.ctx.registry.get_by_uid(self.uid) {
            self.ctx.registry.move_to_canceled(self.uid, &status);
        }
        self.ctx.refresh_status_messages().await;

        self.ctx
            .notify(
                self.uid,
                &format!(
                    "{} clone failed: {}",
                    self.requester.mention(),
                    escape_html(reason)
                ),
            )
            .await;
    }
}
