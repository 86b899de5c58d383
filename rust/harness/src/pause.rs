//! Fixed waits with a visible countdown.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Sleep for `duration`, showing a per-second countdown bar labelled `label`.
///
/// Waits shorter than a second are plain sleeps.
pub async fn countdown(label: &str, duration: Duration) {
    let secs = duration.as_secs();
    if secs == 0 {
        tokio::time::sleep(duration).await;
        return;
    }

    tracing::debug!("{label}: waiting {secs}s");

    let pb = ProgressBar::new(secs);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:30}] {pos:>3}/{len:3}s") {
        pb.set_style(style.progress_chars("#*-"));
    }
    pb.set_message(label.to_string());

    for _ in 0..secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        pb.inc(1);
    }
    tokio::time::sleep(duration - Duration::from_secs(secs)).await;

    pb.finish_and_clear();
}
