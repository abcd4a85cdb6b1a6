//! Per-entry formatting for status messages

use crate::protocol::StatusType;
use crate::status::MirrorStatus;
use std::fmt::Write;
use std::time::Duration;

/// Escape text for Telegram's HTML parse mode
pub use teloxide::utils::html::escape as escape_html;

const SIZE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
const BAR_CELLS: usize = 12;

/// Format a byte count with a 1024 base, e.g. `"100.0 MB"`
pub fn readable_size(bytes: i64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes.max(0));
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, SIZE_UNITS[unit])
}

/// Format a duration as `1d2h3m4s`, dropping leading zero fields
pub fn readable_time(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{}d", days);
    }
    if hours > 0 || !out.is_empty() {
        let _ = write!(out, "{}h", hours);
    }
    if minutes > 0 || !out.is_empty() {
        let _ = write!(out, "{}m", minutes);
    }
    let _ = write!(out, "{}s", secs);
    out
}

/// Twelve-cell textual progress bar
pub fn progress_bar(percentage: f64) -> String {
    let pct = percentage.clamp(0.0, 100.0);
    let filled = ((pct / 100.0) * BAR_CELLS as f64).floor() as usize;
    let mut bar = String::with_capacity(BAR_CELLS * 3 + 2);
    bar.push('[');
    for i in 0..BAR_CELLS {
        bar.push(if i < filled { '■' } else { '□' });
    }
    bar.push(']');
    bar
}

fn done_label(status_type: StatusType) -> &'static str {
    match status_type {
        StatusType::Downloading => "Downloaded",
        StatusType::Uploading => "Uploaded",
        StatusType::Seeding => "Uploaded",
        _ => "Processed",
    }
}

/// Render one status as an HTML block
pub fn render_entry(status: &dyn MirrorStatus) -> String {
    let status_type = status.status_type();
    let completed = status.completed_length();
    let total = status.total_length();
    let mut out = String::new();

    let _ = writeln!(out, "<b>Name:</b> <code>{}</code>", escape_html(&status.name()));
    let _ = writeln!(out, "<b>Status:</b> <i>{}</i>", status_type.label());

    if status_type == StatusType::Cloning {
        let _ = writeln!(
            out,
            "<b>Cloned:</b> {} of {}",
            readable_size(completed),
            readable_size(total)
        );
        let _ = writeln!(out, "<b>Speed:</b> {}/s", readable_size(status.speed()));
        let _ = write!(out, "<b>GID:</b> <code>{}</code>", escape_html(&status.gid()));
        return out;
    }

    let _ = writeln!(
        out,
        "<code>{}</code> {:.2}%",
        progress_bar(status.percentage()),
        status.percentage()
    );
    let _ = writeln!(
        out,
        "<b>{}:</b> {} of {}",
        done_label(status_type),
        readable_size(completed),
        readable_size(total)
    );

    // Ratio-mode seeding uploads past the payload size; the duration is seed time then
    let time_label = if status_type == StatusType::Seeding && completed > total {
        "ST"
    } else {
        "ETA"
    };
    let time = status
        .eta()
        .map(readable_time)
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "<b>Speed:</b> {}/s | <b>{}:</b> {}",
        readable_size(status.speed()),
        time_label,
        time
    );

    if status.is_torrent() {
        let _ = writeln!(
            out,
            "<b>Peers:</b> {} | <b>Seeders:</b> {}",
            status.peers(),
            status.seeders()
        );
    }
    let _ = write!(out, "<b>GID:</b> <code>{}</code>", escape_html(&status.gid()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusSnapshot;
    use std::path::PathBuf;

    #[test]
    fn test_readable_size() {
        assert_eq!(readable_size(0), "0 B");
        assert_eq!(readable_size(512), "512 B");
        assert_eq!(readable_size(1536), "1.5 KB");
        assert_eq!(readable_size(100 * 1024 * 1024), "100.0 MB");
        assert_eq!(readable_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_readable_time() {
        assert_eq!(readable_time(Duration::ZERO), "0s");
        assert_eq!(readable_time(Duration::from_secs(59)), "59s");
        assert_eq!(readable_time(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(readable_time(Duration::from_secs(90_000)), "1d1h0m0s");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0.0), "[□□□□□□□□□□□□]");
        assert_eq!(progress_bar(50.0), "[■■■■■■□□□□□□]");
        assert_eq!(progress_bar(100.0), "[■■■■■■■■■■■■]");
        assert_eq!(progress_bar(250.0), "[■■■■■■■■■■■■]");
    }

    fn seeding(completed: i64, total: i64) -> StatusSnapshot {
        StatusSnapshot {
            name: "ubuntu.iso".to_string(),
            completed_length: completed,
            total_length: total,
            gid: "abc".to_string(),
            path: PathBuf::from("/tmp/ubuntu.iso"),
            status_type: StatusType::Seeding,
            is_torrent: true,
            peers: 3,
            seeders: 1,
            index: 1,
        }
    }

    #[test]
    fn test_seed_overshoot_shows_seed_time_label() {
        let overshoot = render_entry(&seeding(1500, 1000));
        assert!(overshoot.contains("<b>ST:</b>"));
        assert!(!overshoot.contains("<b>ETA:</b>"));
        assert!(overshoot.contains("<b>Uploaded:</b> 1.5 KB of 1000 B"));

        let below = render_entry(&seeding(500, 1000));
        assert!(below.contains("<b>ETA:</b>"));
        assert!(below.contains("<b>Peers:</b> 3 | <b>Seeders:</b> 1"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
