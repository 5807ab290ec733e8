use anyhow::Result;
use shared::domain::{MediaKind, MediaReference};
use storage::{FetchPriority, MediaFetcher};

/// Warms the cache for one story's media. Images are fetched whole; videos
/// get their cached first frame extracted and the head of the file fetched so
/// playback can start before the full download lands.
pub async fn preload_story_media(
    fetcher: &dyn MediaFetcher,
    media: MediaReference,
    priority: FetchPriority,
    video_head_bytes: u64,
) -> Result<()> {
    match media.kind {
        MediaKind::Image => fetcher.fetch(media, priority, None).await,
        MediaKind::Video { .. } => {
            fetcher.extract_first_frame(media).await?;
            fetcher.fetch(media, priority, Some(0..video_head_bytes)).await
        }
    }
}

/// Resolves once the media is fully cached, fetching at top priority.
pub async fn wait_until_story_media_preloaded(
    fetcher: &dyn MediaFetcher,
    media: MediaReference,
) -> Result<()> {
    fetcher.fetch(media, FetchPriority(0), None).await
}
