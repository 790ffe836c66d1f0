// ABOUTME: window command - shows the sync window the next run of a dataset would use
// ABOUTME: Read-only; nothing is fetched or recorded

use anyhow::Result;

use super::{connect_metadata, watermark_store};
use crate::config::Config;
use crate::remote::models::format_window_timestamp;
use crate::watermark::WatermarkTracker;

pub async fn window(config: &Config, dataset_id: i64, metadata_url: Option<String>) -> Result<()> {
    // The metadata database is only needed when it backs the watermarks
    let metadata = match (&config.sync.state_file, metadata_url.or_else(|| config.metadata.url.clone())) {
        (None, Some(url)) => Some(connect_metadata(&url, config.metadata_statement_timeout()).await?),
        _ => None,
    };

    let tracker = WatermarkTracker::new(watermark_store(config, metadata)?, config.sync.epoch);
    let window = tracker.resolve_window(dataset_id).await?;

    println!("Dataset {}", dataset_id);
    println!("  from: {}", format_window_timestamp(&window.from));
    println!("  to:   {}", format_window_timestamp(&window.to));
    if window.from == tracker.epoch() {
        println!("  (no successful sync recorded, starting from the epoch)");
    }
    Ok(())
}
