//! Integration tests for mirror-bot
//!
//! Whole mirrors are driven through the listener, the engines and the
//! command surface. HTTP sources are served by wiremock; the bot transport,
//! cloud, archiver and torrent engine are the fakes in `test_helpers`.


use mirror_bot::auth::StaticAuthorizer;
use mirror_bot::commands::{CommandHandler, IncomingCommand, ReplyContext};
use mirror_bot::engines::aria2::{Aria2Client, Aria2Engine};
use mirror_bot::engines::gdrive::start_clone;
use mirror_bot::engines::http::HttpDownloader;
use mirror_bot::engines::telegram::{MessageMedia, TelegramFileClient};
use mirror_bot::engines::torrent::{TorrentDownloader, TorrentPhase};
use mirror_bot::engines::Engines;
use mirror_bot::extract::ExtractorRegistry;
use mirror_bot::render::{readable_size, PageAction, NOOP_CALLBACK};
use mirror_bot::status::TransferProgress;
use mirror_bot::{
    CloneListener, MirrorError, MirrorOptions, MirrorStatus, Requester, SeedConfig, StatusType,
    Uid, CANCELED_BY_USER,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);
const MAGNET: &str = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=ubuntu";
const MAGNET_HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

/// Serve `body` at `route` on a fresh mock server
async fn serve(route: &str, body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;
    server
}

fn command_handler(bot: &TestBot, auth: StaticAuthorizer, engines: Engines) -> CommandHandler {
    CommandHandler::new(
        bot.ctx.clone(),
        Arc::new(engines),
        Arc::new(auth),
        ExtractorRegistry::new(),
    )
}

fn default_engines(bot: &TestBot) -> Engines {
    Engines::from_config(&bot.ctx.config, None).expect("Failed to build engines")
}

fn command(message_id: i32, user_id: i64, text: &str) -> IncomingCommand {
    IncomingCommand {
        chat_id: CHAT_ID,
        message_id,
        user_id,
        user_name: "tester".to_string(),
        text: text.to_string(),
        reply: None,
    }
}

// =============================================================================
// Direct-link mirrors
// =============================================================================

#[tokio::test]
async fn test_http_mirror_uploads_and_cleans_up() {
    let bot = TestBot::with_config(|c| c.index_url(Some("https://index.example".to_string())));
    let server = serve("/files/report.bin", vec![1u8; 64 * 1024]).await;

    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(1, MirrorOptions::default());
    let dir = listener.dir();
    let uid = listener.uid();

    let gid = http
        .add_download(&format!("{}/files/report.bin", server.uri()), listener, None)
        .await
        .expect("add_download failed");
    assert!(!gid.is_empty());

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(1, "Drive Link") == 1).await);

    let uploads = bot.cloud.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].name, "report.bin");
    assert_eq!(uploads[0].size, 64 * 1024);
    assert_eq!(uploads[0].parent_id, "root");

    let reply = transport
        .replies_to(1)
        .into_iter()
        .find(|t| t.contains("Drive Link"))
        .expect("completion message");
    assert!(reply.contains("<b>Size:</b> 64.0 KB"));
    assert!(reply.contains("https://index.example/report.bin"));

    assert_eq!(bot.ctx.registry.count(), 0);
    assert!(bot.ctx.registry.get_canceled(uid).is_none());
    assert!(wait_until(WAIT, || !dir.exists()).await);
}

#[tokio::test]
async fn test_http_error_lands_in_canceled_partition() {
    let bot = TestBot::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(2, MirrorOptions::default());
    let uid = listener.uid();
    http.add_download(&format!("{}/missing.bin", server.uri()), listener, None)
        .await
        .expect("add_download failed");

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(2, "stopped due to") == 1).await);

    let snapshot = bot.ctx.registry.get_canceled(uid).expect("canceled snapshot");
    assert_eq!(snapshot.status_type, StatusType::Canceled);
    assert_eq!(snapshot.name, "missing.bin");
    assert_eq!(bot.ctx.registry.count(), 0);
    assert!(bot.cloud.uploads().is_empty());
    assert!(transport.replies_to(2)[0].contains("404"));
}

#[tokio::test]
async fn test_invalid_link_registers_nothing() {
    let bot = TestBot::new();
    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(3, MirrorOptions::default());

    let result = http
        .add_download("ftp://example.com/file.bin", listener, None)
        .await;
    assert!(matches!(result, Err(MirrorError::InvalidInput { .. })));
    assert_eq!(bot.ctx.registry.count(), 0);
}

#[test]
fn test_readable_sizes() {
    assert_eq!(readable_size(100 * 1024 * 1024), "100.0 MB");
    assert_eq!(readable_size(512), "512 B");
    assert_eq!(readable_size(1536), "1.5 KB");
}

// =============================================================================
// Archive and extract stages
// =============================================================================

#[tokio::test]
async fn test_tar_mirror_uploads_archive() {
    let bot = TestBot::new();
    let server = serve("/data.bin", vec![3u8; 2048]).await;
    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(
        10,
        MirrorOptions {
            is_tar: true,
            ..Default::default()
        },
    );

    http.add_download(&format!("{}/data.bin", server.uri()), listener, None)
        .await
        .expect("add_download failed");

    let cloud = bot.cloud.clone();
    assert!(wait_until(WAIT, || cloud.uploads().len() == 1).await);
    assert_eq!(cloud.uploads()[0].name, "data.bin.tar");
}

#[tokio::test]
async fn test_tar_of_download_dir_leaves_root_empty() {
    let bot = TestBot::new();
    let listener = bot.listener(
        14,
        MirrorOptions {
            is_tar: true,
            ..Default::default()
        },
    );
    let dir = listener.dir();
    tokio::fs::create_dir_all(dir.join("Season 1"))
        .await
        .expect("mkdir");
    tokio::fs::write(dir.join("Season 1").join("e01.mkv"), vec![1u8; 128])
        .await
        .expect("write payload");
    let status =
        StaticStatus::owned_at("Show", "gid-14", StatusType::Downloading, &listener, dir.clone());
    bot.ctx.registry.add(listener.uid(), status);

    listener.on_download_complete().await;

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(14, "Drive Link") == 1).await);
    assert_eq!(bot.cloud.uploads()[0].name, "Show.tar");
    assert!(wait_until(WAIT, || !dir.exists()).await);

    let mut root = tokio::fs::read_dir(&bot.ctx.config.download_dir)
        .await
        .expect("read download root");
    assert!(root.next_entry().await.expect("list root").is_none());
}

#[tokio::test]
async fn test_archive_failure_uploads_original() {
    let bot = TestBot::with_archiver(FakeArchiver::failing());
    let server = serve("/data.bin", vec![3u8; 2048]).await;
    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(
        11,
        MirrorOptions {
            is_tar: true,
            ..Default::default()
        },
    );

    http.add_download(&format!("{}/data.bin", server.uri()), listener, None)
        .await
        .expect("add_download failed");

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(11, "Drive Link") == 1).await);
    assert_eq!(transport.count_replies(11, "Archiving failed"), 1);

    let uploads = bot.cloud.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].name, "data.bin");
    assert_eq!(uploads[0].size, 2048);
}

#[tokio::test]
async fn test_unzip_mirror_uploads_extracted_folder() {
    let bot = TestBot::new();
    let server = serve("/pack.zip", vec![9u8; 1024]).await;
    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(
        12,
        MirrorOptions {
            do_unarchive: true,
            ..Default::default()
        },
    );

    http.add_download(&format!("{}/pack.zip", server.uri()), listener, None)
        .await
        .expect("add_download failed");

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(12, "Drive Link") == 1).await);
    let uploads = bot.cloud.uploads();
    assert_eq!(uploads[0].name, "pack");
    assert_eq!(transport.count_replies(12, "<b>Type:</b> Folder"), 1);
}

#[tokio::test]
async fn test_upload_failure_lands_in_canceled_partition() {
    let bot = TestBot::new();
    bot.cloud.fail_uploads();
    let server = serve("/data.bin", vec![3u8; 256]).await;
    let http = Arc::new(HttpDownloader::new().expect("Failed to build downloader"));
    let listener = bot.listener(13, MirrorOptions::default());
    let uid = listener.uid();
    let dir = listener.dir();

    http.add_download(&format!("{}/data.bin", server.uri()), listener, None)
        .await
        .expect("add_download failed");

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(13, "upload failed") == 1).await);
    assert!(bot.ctx.registry.get_canceled(uid).is_some());
    assert_eq!(bot.ctx.registry.count(), 0);
    assert!(wait_until(WAIT, || !dir.exists()).await);
}

// =============================================================================
// Terminal callbacks
// =============================================================================

#[tokio::test]
async fn test_terminal_callbacks_fire_once() {
    let bot = TestBot::new();
    let listener = bot.listener(20, MirrorOptions::default());
    let status = StaticStatus::owned_by("x.bin", "gid-20", StatusType::Downloading, &listener);
    bot.ctx.registry.add(listener.uid(), status);

    listener.on_download_error("first").await;
    listener.on_download_error("second").await;
    listener.on_upload_error("third").await;

    assert!(listener.is_canceled());
    assert_eq!(bot.transport.count_replies(20, "stopped due to"), 1);
    assert_eq!(bot.transport.count_replies(20, "second"), 0);
    assert_eq!(bot.transport.count_replies(20, "upload failed"), 0);
    assert!(bot.ctx.registry.get_canceled(listener.uid()).is_some());
}

#[tokio::test]
async fn test_completion_after_cancel_is_ignored() {
    let bot = TestBot::new();
    let listener = bot.listener(21, MirrorOptions::default());
    let status = StaticStatus::owned_by("x.bin", "gid-21", StatusType::Downloading, &listener);
    bot.ctx.registry.add(listener.uid(), status);

    listener.on_download_error(CANCELED_BY_USER).await;
    listener.on_download_complete().await;

    assert!(bot.cloud.uploads().is_empty());
    assert_eq!(bot.transport.count_replies(21, "Drive Link"), 0);
}

// =============================================================================
// Torrents
// =============================================================================

fn torrent_adapter(seed: SeedConfig) -> (Arc<FakeTorrentEngine>, Arc<TorrentDownloader>) {
    let engine = FakeTorrentEngine::new();
    let downloader =
        TorrentDownloader::with_poll_interval(engine.clone(), seed, Duration::from_millis(20));
    (engine, downloader)
}

#[tokio::test]
async fn test_duplicate_torrent_is_rejected() {
    let bot = TestBot::new();
    let (engine, torrents) = torrent_adapter(SeedConfig::default());

    let first = bot.listener(30, MirrorOptions::default());
    let first_uid = first.uid();
    let gid = torrents
        .add_download(MAGNET, first)
        .await
        .expect("first add failed");
    assert_eq!(gid, MAGNET_HASH);

    let second = bot.listener(31, MirrorOptions::default());
    let second_uid = second.uid();
    let second_dir = second.dir();
    let result = torrents.add_download(MAGNET, second).await;

    assert!(matches!(result, Err(MirrorError::AlreadyExists(_))));
    assert_eq!(engine.added(), 1);
    assert_eq!(bot.ctx.registry.count(), 1);
    assert!(bot.ctx.registry.get_by_uid(first_uid).is_some());
    assert!(bot.ctx.registry.get_by_uid(second_uid).is_none());
    assert!(!second_dir.exists());
}

#[tokio::test]
async fn test_duplicate_torrent_command_replies_error() {
    let bot = TestBot::new();
    let (_engine, torrents) = torrent_adapter(SeedConfig::default());
    let handler = command_handler(
        &bot,
        StaticAuthorizer::default(),
        default_engines(&bot).with_torrent(torrents),
    );

    assert!(handler.handle(command(32, USER_ID, &format!("/mirror {}", MAGNET))).await);
    assert!(handler.handle(command(33, USER_ID, &format!("/mirror {}", MAGNET))).await);

    assert_eq!(bot.ctx.registry.count(), 1);
    assert_eq!(bot.transport.count_replies(33, "Already registered"), 1);
    bot.ctx.reporter.stop();
}

#[tokio::test]
async fn test_torrent_mirror_completes() {
    let bot = TestBot::new();
    let (engine, torrents) = torrent_adapter(SeedConfig::default());
    let listener = bot.listener(34, MirrorOptions::default());
    let dir = listener.dir();

    torrents
        .add_download(MAGNET, listener)
        .await
        .expect("add failed");
    let handle = engine.handle(MAGNET_HASH).expect("handle");
    handle.update_stats(|s| s.completed_length = s.total_length);
    handle.set_phase(TorrentPhase::Finished);

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(34, "Drive Link") == 1).await);
    assert!(handle.is_stopped());
    assert_eq!(bot.cloud.uploads()[0].name, FakeTorrentEngine::PAYLOAD);
    assert_eq!(bot.cloud.uploads()[0].size, FakeTorrentEngine::PAYLOAD_SIZE);
    assert!(wait_until(WAIT, || torrents.active_count() == 0).await);
    assert!(wait_until(WAIT, || !dir.exists()).await);
}

#[tokio::test]
async fn test_torrent_engine_error_is_reported() {
    let bot = TestBot::new();
    let (engine, torrents) = torrent_adapter(SeedConfig::default());
    let listener = bot.listener(35, MirrorOptions::default());
    let uid = listener.uid();

    torrents
        .add_download(MAGNET, listener)
        .await
        .expect("add failed");
    engine.handle(MAGNET_HASH).expect("handle").fail("tracker unreachable");

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(35, "tracker unreachable") == 1).await);
    assert!(bot.ctx.registry.get_canceled(uid).is_some());
}

#[tokio::test]
async fn test_seeding_runs_alongside_upload() {
    let bot = TestBot::new();
    let (engine, torrents) = torrent_adapter(SeedConfig {
        ratio: 1.0,
        time: None,
    });
    let listener = bot.listener(
        36,
        MirrorOptions {
            is_seed: true,
            ..Default::default()
        },
    );
    let uid = listener.uid();
    let dir = listener.dir();

    torrents
        .add_download(MAGNET, listener)
        .await
        .expect("add failed");
    let handle = engine.handle(MAGNET_HASH).expect("handle");
    handle.update_stats(|s| s.completed_length = s.total_length);
    handle.set_phase(TorrentPhase::Finished);

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(36, "Drive Link") == 1).await);

    // Upload finished, the torrent keeps seeding from the same files
    let registry = bot.ctx.registry.clone();
    assert!(wait_until(WAIT, || registry.count() == 0).await);
    let seeding = registry.get_seeding(uid).expect("seeding status");
    assert_eq!(seeding.status_type(), StatusType::Seeding);
    assert_eq!(registry.count_live(), 1);
    assert_eq!(registry.display_sorted().len(), 1);
    assert!(dir.join(FakeTorrentEngine::PAYLOAD).exists());
    assert!(!handle.is_stopped());

    handle.update_stats(|s| s.uploaded = s.total_length);
    assert!(wait_until(WAIT, || transport.count_replies(36, "Seeding finished") == 1).await);
    assert_eq!(transport.count_replies(36, "Ratio: 1.00"), 1);
    assert!(handle.is_stopped());
    assert!(wait_until(WAIT, || registry.count_seeding() == 0).await);
    assert!(wait_until(WAIT, || !dir.exists()).await);
}

#[tokio::test]
async fn test_cancel_seed_through_command() {
    let bot = TestBot::new();
    let (engine, torrents) = torrent_adapter(SeedConfig {
        ratio: 0.0,
        time: None,
    });
    let handler = command_handler(
        &bot,
        StaticAuthorizer::default(),
        default_engines(&bot).with_torrent(torrents),
    );

    assert!(handler.handle(command(37, USER_ID, &format!("/seedmirror {}", MAGNET))).await);
    let handle = engine.handle(MAGNET_HASH).expect("handle");
    handle.set_phase(TorrentPhase::Finished);

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(37, "Drive Link") == 1).await);
    let uid = Uid::new(CHAT_ID, 37);
    let registry = bot.ctx.registry.clone();
    assert!(
        wait_until(WAIT, || registry.get_seeding(uid).is_some() && registry.count() == 0).await
    );

    assert!(handler.handle(command(38, USER_ID, &format!("/cancel {}", MAGNET_HASH))).await);
    assert_eq!(transport.count_replies(38, "Stopping seed"), 1);
    assert!(wait_until(WAIT, || transport.count_replies(37, "Seeding finished") == 1).await);
    assert!(wait_until(WAIT, || registry.count_live() == 0).await);
    bot.ctx.reporter.stop();
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn test_cancel_running_download() {
    let bot = TestBot::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));

    let text = format!("/mirror {}/slow.bin", server.uri());
    assert!(handler.handle(command(40, USER_ID, &text)).await);

    let uid = Uid::new(CHAT_ID, 40);
    let status = bot.ctx.registry.get_by_uid(uid).expect("registered");
    assert_eq!(status.status_type(), StatusType::Downloading);
    assert_eq!(bot.ctx.reporter.open_message_count(), 1);

    let gid = status.gid();
    assert!(handler.handle(command(41, USER_ID, &format!("/cancel {}", gid))).await);
    assert_eq!(
        bot.transport
            .count_replies(41, &format!("Canceling <code>{}</code>", gid)),
        1
    );

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(40, CANCELED_BY_USER) == 1).await);
    assert!(bot.ctx.registry.get_canceled(uid).is_some());
    assert_eq!(bot.ctx.registry.count(), 0);
    assert!(wait_until(WAIT, || !transport.deleted().is_empty()).await);
    bot.ctx.reporter.stop();
}

#[tokio::test]
async fn test_cancel_refused_while_uploading() {
    let bot = TestBot::new();
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));
    let listener = bot.listener(50, MirrorOptions::default());
    let status = StaticStatus::owned_by("movie.mkv", "up-1", StatusType::Uploading, &listener);
    bot.ctx.registry.add(listener.uid(), status.clone());

    assert!(handler.handle(command(51, USER_ID, "/cancel up-1")).await);
    assert_eq!(
        bot.transport
            .count_replies(51, "Cannot cancel while uploading"),
        1
    );

    let mut by_reply = command(52, USER_ID, "/cancel");
    by_reply.reply = Some(ReplyContext {
        message_id: 50,
        ..Default::default()
    });
    assert!(handler.handle(by_reply).await);
    assert_eq!(
        bot.transport
            .count_replies(52, "Cannot cancel while uploading"),
        1
    );

    assert_eq!(status.cancel_calls(), 0);
    assert!(bot.ctx.registry.get_by_uid(listener.uid()).is_some());
}

#[tokio::test]
async fn test_cancel_requires_owner_or_sudo() {
    let bot = TestBot::new();
    let listener = bot.listener(60, MirrorOptions::default());
    let status = StaticStatus::owned_by("a.bin", "dl-1", StatusType::Downloading, &listener);
    bot.ctx.registry.add(listener.uid(), status.clone());

    let handler = command_handler(
        &bot,
        StaticAuthorizer::new(Vec::new(), vec![99]),
        default_engines(&bot),
    );

    assert!(handler.handle(command(61, 7, "/cancel dl-1")).await);
    assert_eq!(bot.transport.count_replies(61, "started by someone else"), 1);
    assert_eq!(status.cancel_calls(), 0);

    assert!(handler.handle(command(62, 99, "/cancel dl-1")).await);
    assert_eq!(bot.transport.count_replies(62, "Canceling <code>dl-1</code>"), 1);
    assert_eq!(status.cancel_calls(), 1);
}

#[tokio::test]
async fn test_cancel_unknown_gid() {
    let bot = TestBot::new();
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));

    assert!(handler.handle(command(63, USER_ID, "/cancel nope")).await);
    assert_eq!(bot.transport.count_replies(63, "No task with GID nope"), 1);
}

#[tokio::test]
async fn test_status_without_tasks() {
    let bot = TestBot::new();
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));

    assert!(handler.handle(command(70, USER_ID, "/status")).await);
    assert_eq!(bot.transport.count_replies(70, "No active tasks."), 1);
    assert_eq!(bot.ctx.reporter.open_message_count(), 0);
}

#[tokio::test]
async fn test_unauthorized_chat_is_refused() {
    let bot = TestBot::new();
    let handler = command_handler(
        &bot,
        StaticAuthorizer::new(vec![555], Vec::new()),
        default_engines(&bot),
    );

    assert!(handler.handle(command(71, USER_ID, "/status")).await);
    assert_eq!(bot.transport.count_replies(71, "not authorized"), 1);
    assert!(!handler.handle(command(72, USER_ID, "hello there")).await);
}

#[tokio::test]
async fn test_seedmirror_refused_without_seeding_engine() {
    let bot = TestBot::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let mut engines = default_engines(&bot);
    engines.aria2 = Some(Aria2Engine::new(Arc::new(Aria2Client::new(server.uri(), None))));
    let handler = command_handler(&bot, StaticAuthorizer::default(), engines);

    assert!(handler.handle(command(74, USER_ID, &format!("/seedmirror {}", MAGNET))).await);

    assert_eq!(bot.transport.count_replies(74, "Seeding needs"), 1);
    assert_eq!(bot.ctx.registry.count(), 0);
    assert_eq!(bot.ctx.registry.count_seeding(), 0);
}

#[tokio::test]
async fn test_mirror_without_link_is_refused() {
    let bot = TestBot::new();
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));

    assert!(handler.handle(command(73, USER_ID, "/mirror")).await);
    assert_eq!(bot.transport.replies_to(73).len(), 1);
    assert_eq!(bot.ctx.registry.count(), 0);
}

// =============================================================================
// Upload destination
// =============================================================================

/// Finish a mirror whose payload is a local file, as if an engine had fetched it
async fn complete_local(bot: &TestBot, message_id: i32, parent_id: Option<&str>) {
    let listener = bot.listener(
        message_id,
        MirrorOptions {
            parent_id: parent_id.map(str::to_string),
            ..Default::default()
        },
    );
    let dir = listener.dir();
    tokio::fs::create_dir_all(&dir).await.expect("mkdir");
    tokio::fs::write(dir.join("report.bin"), vec![7u8; 256])
        .await
        .expect("write payload");
    let status = StaticStatus::owned_at(
        "report.bin",
        "gid-local",
        StatusType::Downloading,
        &listener,
        dir.join("report.bin"),
    );
    bot.ctx.registry.add(listener.uid(), status);
    listener.on_download_complete().await;
}

fn index_bot() -> TestBot {
    TestBot::with_config(|c| c.index_url(Some("https://index.example".to_string())))
}

#[tokio::test]
async fn test_custom_parent_suppresses_index_link() {
    let bot = index_bot();
    bot.cloud.add_folder("team-folder");

    complete_local(&bot, 80, Some("team-folder")).await;

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(80, "Drive Link") == 1).await);
    assert_eq!(bot.cloud.uploads()[0].parent_id, "team-folder");
    assert_eq!(transport.count_replies(80, "Index Link"), 0);
}

#[tokio::test]
async fn test_unknown_parent_falls_back_to_default() {
    let bot = index_bot();

    complete_local(&bot, 81, Some("no-such-folder")).await;

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(81, "Drive Link") == 1).await);
    assert_eq!(bot.cloud.uploads()[0].parent_id, "root");
    assert_eq!(transport.count_replies(81, "Index Link"), 1);
}

#[tokio::test]
async fn test_file_parent_falls_back_to_default() {
    let bot = index_bot();
    bot.cloud.add_file("notes-file", "notes.txt", 12);

    complete_local(&bot, 82, Some("notes-file")).await;

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(82, "Drive Link") == 1).await);
    assert_eq!(bot.cloud.uploads()[0].parent_id, "root");
    assert_eq!(transport.count_replies(82, "Index Link"), 1);
}

// =============================================================================
// Telegram attachments
// =============================================================================

/// File client for tests that must be refused before any fetch
struct UnreachableFileClient;

#[async_trait::async_trait]
impl TelegramFileClient for UnreachableFileClient {
    async fn download(
        &self,
        file_id: &str,
        _dest: &std::path::Path,
        _progress: &TransferProgress,
        _cancel: &CancellationToken,
    ) -> mirror_bot::Result<()> {
        Err(MirrorError::Internal(format!("unexpected download of {}", file_id)))
    }

    async fn fetch(&self, file_id: &str) -> mirror_bot::Result<Vec<u8>> {
        Err(MirrorError::Internal(format!("unexpected fetch of {}", file_id)))
    }
}

#[tokio::test]
async fn test_mirror_of_photo_reply_is_not_downloadable() {
    let bot = TestBot::new();
    let engines = Engines::from_config(&bot.ctx.config, Some(Arc::new(UnreachableFileClient)))
        .expect("Failed to build engines");
    let handler = command_handler(&bot, StaticAuthorizer::default(), engines);

    let mut incoming = command(85, USER_ID, "/mirror");
    incoming.reply = Some(ReplyContext {
        message_id: 84,
        text: None,
        media: Some(MessageMedia::Unsupported("Photo")),
    });
    assert!(handler.handle(incoming).await);

    let replies = bot.transport.replies_to(85);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].contains("Not downloadable content: Photo messages cannot be mirrored"));
    assert_eq!(bot.ctx.registry.count(), 0);
    assert!(!bot.ctx.download_dir(Uid::new(CHAT_ID, 85)).exists());
}

// =============================================================================
// Log
// =============================================================================

#[tokio::test]
async fn test_log_is_sent_to_sudo_users() {
    let logs = tempfile::TempDir::new().expect("Failed to create temp dir");
    let log = logs.path().join("bot.log");
    tokio::fs::write(&log, b"started\n").await.expect("write log");
    let bot = TestBot::with_config(|c| c.log_file(Some(log.clone())));
    let handler = command_handler(
        &bot,
        StaticAuthorizer::new(Vec::new(), vec![99]),
        default_engines(&bot),
    );

    assert!(handler.handle(command(90, USER_ID, "/log")).await);
    assert!(bot.transport.documents().is_empty());
    assert_eq!(bot.transport.count_replies(90, "Only sudo users"), 1);

    assert!(handler.handle(command(91, 99, "/log")).await);
    assert_eq!(bot.transport.documents(), vec![(CHAT_ID, Some(91), log)]);
}

#[tokio::test]
async fn test_log_without_file_is_reported() {
    let bot = TestBot::new();
    let handler = command_handler(
        &bot,
        StaticAuthorizer::new(Vec::new(), vec![99]),
        default_engines(&bot),
    );

    assert!(handler.handle(command(92, 99, "/log")).await);
    assert!(bot.transport.documents().is_empty());
    assert_eq!(bot.transport.count_replies(92, "No log file is configured"), 1);
}

// =============================================================================
// Status pagination
// =============================================================================

#[tokio::test]
async fn test_status_pagination() {
    let bot = TestBot::new();
    for i in 0..25 {
        let status = StaticStatus::new(
            &format!("file-{:02}", i),
            &format!("gid-{}", i),
            i as u64,
            StatusType::Downloading,
        );
        bot.ctx.registry.add(Uid::new(CHAT_ID, 100 + i), status);
    }
    let reporter = bot.ctx.reporter.clone();

    reporter
        .send_status_message(CHAT_ID, None)
        .await
        .expect("send failed");
    let sent = bot.transport.sent();
    let first = sent.last().expect("status message");
    assert!(first.text.contains("<b>Page:</b> 1/3"));
    assert!(first.text.contains("<b>Tasks:</b> 25"));
    assert!(first.text.contains("file-00"));
    assert!(!first.text.contains("file-10"));

    let keyboard = first.keyboard.as_ref().expect("pagination buttons");
    let previous = keyboard.button("Previous").expect("previous button");
    assert!(!previous.enabled);
    assert_eq!(previous.callback_data, NOOP_CALLBACK);
    assert!(keyboard.button("Next").expect("next button").enabled);

    assert!(reporter
        .turn_page(CHAT_ID, PageAction::Next)
        .await
        .expect("turn failed"));
    assert_eq!(reporter.current_page(CHAT_ID), Some(1));

    assert!(reporter
        .turn_page(CHAT_ID, PageAction::Last)
        .await
        .expect("turn failed"));
    let (_, text, keyboard) = bot.transport.edited().last().cloned().expect("edit");
    assert!(text.contains("<b>Page:</b> 3/3"));
    assert!(text.contains("file-24"));
    assert!(!text.contains("file-19"));
    assert!(!keyboard.expect("buttons").button("Next").expect("next").enabled);

    assert!(!reporter
        .turn_page(CHAT_ID, PageAction::Next)
        .await
        .expect("turn failed"));
    assert_eq!(reporter.current_page(CHAT_ID), Some(2));

    // Shrinking the registry clamps the cursor to the last page
    for i in 0..10 {
        bot.ctx.registry.remove(Uid::new(CHAT_ID, 100 + i));
    }
    let rendered = reporter.render_page(2);
    assert_eq!(rendered.total_pages, 2);
    assert_eq!(rendered.page, 1);
    reporter.stop();
}

#[tokio::test]
async fn test_pagination_callbacks() {
    let bot = TestBot::new();
    for i in 0..12 {
        let (name, gid) = (format!("f{}", i), format!("g{}", i));
        let status = StaticStatus::new(&name, &gid, i as u64, StatusType::Uploading);
        bot.ctx.registry.add(Uid::new(CHAT_ID, 200 + i), status);
    }
    let handler = command_handler(&bot, StaticAuthorizer::default(), default_engines(&bot));

    assert!(handler.handle(command(80, USER_ID, "/status")).await);
    assert_eq!(bot.ctx.reporter.open_message_count(), 1);

    assert!(!handler
        .handle_callback(CHAT_ID, NOOP_CALLBACK)
        .await
        .expect("noop"));
    assert!(handler
        .handle_callback(CHAT_ID, PageAction::Next.callback_data())
        .await
        .expect("next"));
    assert!(handler.handle_callback(CHAT_ID, "bogus").await.is_err());
    assert_eq!(bot.ctx.reporter.current_page(CHAT_ID), Some(1));
    bot.ctx.reporter.stop();
}

#[tokio::test]
async fn test_spinner_deletes_messages_when_idle() {
    let bot = TestBot::new();
    let uid = Uid::new(CHAT_ID, 90);
    bot.ctx
        .registry
        .add(uid, StaticStatus::new("a", "g", 0, StatusType::Downloading));
    let reporter = bot.ctx.reporter.clone();

    reporter
        .send_status_message(CHAT_ID, None)
        .await
        .expect("send failed");
    assert!(reporter.is_spinning());

    bot.ctx.registry.remove(uid);
    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.deleted().len() == 1).await);
    assert!(wait_until(WAIT, || !reporter.is_spinning()).await);
    assert_eq!(reporter.open_message_count(), 0);
}

// =============================================================================
// Clone
// =============================================================================

#[tokio::test]
async fn test_clone_copies_into_parent() {
    let bot = TestBot::new();
    bot.cloud.add_file("src-file", "doc.pdf", 2048);
    let listener = CloneListener::new(
        bot.ctx.clone(),
        Uid::new(CHAT_ID, 95),
        Requester::new(USER_ID, "tester"),
    );

    let gid = start_clone(listener, bot.cloud.clone(), "src-file", "root", false)
        .await
        .expect("clone failed to start");
    assert!(!gid.is_empty());

    let transport = bot.transport.clone();
    assert!(wait_until(WAIT, || transport.count_replies(95, "Drive Link") == 1).await);
    assert_eq!(transport.count_replies(95, "doc.pdf"), 1);
    assert_eq!(
        bot.cloud.clones(),
        vec![("src-file".to_string(), "root".to_string())]
    );
    assert_eq!(bot.ctx.registry.count(), 0);
}

#[tokio::test]
async fn test_clone_of_missing_item_registers_nothing() {
    let bot = TestBot::new();
    let listener = CloneListener::new(
        bot.ctx.clone(),
        Uid::new(CHAT_ID, 96),
        Requester::new(USER_ID, "tester"),
    );

    let result = start_clone(listener, bot.cloud.clone(), "missing", "root", false).await;
    assert!(matches!(result, Err(MirrorError::NotFound(_))));
    assert_eq!(bot.ctx.registry.count(), 0);
}
