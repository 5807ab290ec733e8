use super::*;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::time::Duration;
use tokio::time::timeout;

fn media(id: i64) -> MediaReference {
    MediaReference {
        media_id: MediaId(id),
        kind: shared::domain::MediaKind::Image,
    }
}

fn item(id: i32) -> StoryItem {
    let timestamp = Utc.timestamp_opt(1_700_000_000 + i64::from(id), 0).unwrap();
    StoryItem::new(
        StoryId(id),
        timestamp,
        timestamp + ChronoDuration::hours(24),
        media(i64::from(id) * 100),
    )
}

#[tokio::test]
async fn stores_and_orders_confirmed_items() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    store.set_stories(peer, vec![item(3), item(1), item(2)]).await;

    let view = store.peer_stories(peer).await;
    let ids: Vec<i32> = view.entries.iter().map(|entry| entry.id().0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(view.pending.is_empty());
}

#[tokio::test]
async fn assigns_local_ids_above_pending_base() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    let first = store.add_pending(peer, item(0)).await;
    let second = store.add_pending(peer, item(0)).await;

    assert_eq!(first, PENDING_STORY_ID_BASE);
    assert_eq!(second.0, PENDING_STORY_ID_BASE.0 + 1);

    let view = store.peer_stories(peer).await;
    assert_eq!(view.pending.len(), 2);
    assert!(view.pending[0].is_pending);
}

#[tokio::test]
async fn commit_pending_records_remap() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    let local_id = store.add_pending(peer, item(0)).await;
    store
        .commit_pending(peer, local_id, item(7))
        .await
        .expect("commit");

    let view = store.peer_stories(peer).await;
    assert!(view.pending.is_empty());
    assert_eq!(view.remaps.get(&local_id), Some(&StoryId(7)));
    let confirmed = view.entries[0].item().expect("loaded item");
    assert_eq!(confirmed.id, StoryId(7));
    assert!(!confirmed.is_pending);
}

#[tokio::test]
async fn commit_pending_rejects_unknown_local_id() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    store.add_pending(peer, item(0)).await;

    let err = store
        .commit_pending(peer, StoryId(12345), item(7))
        .await
        .expect_err("unknown local id");
    assert!(matches!(err, StoreError::NotPending(_)));
}

#[tokio::test]
async fn watermark_is_monotonic() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    store.set_stories(peer, vec![item(1), item(2), item(3)]).await;
    store.mark_seen(StoryKey { peer_id: peer, id: StoryId(2) }).await;
    store.mark_seen(StoryKey { peer_id: peer, id: StoryId(1) }).await;

    let view = store.peer_stories(peer).await;
    assert_eq!(view.max_read_id, StoryId(2));
}

#[tokio::test]
async fn derives_subscription_flags_in_order() {
    let store = StoryStore::new();
    store.set_stories(PeerId(1), vec![item(1)]).await;
    store.set_stories(PeerId(2), vec![item(1)]).await;
    store.mark_seen(StoryKey { peer_id: PeerId(2), id: StoryId(1) }).await;
    store.add_pending(PeerId(2), item(0)).await;
    store
        .set_subscription_order(vec![PeerId(2), PeerId(1), PeerId(9)])
        .await;

    let subscriptions = store.subscriptions().await;
    assert_eq!(subscriptions.len(), 2, "peer 9 has no stories");
    assert_eq!(subscriptions[0].peer_id, PeerId(2));
    assert!(!subscriptions[0].has_unseen);
    assert!(subscriptions[0].has_pending);
    assert_eq!(subscriptions[1].peer_id, PeerId(1));
    assert!(subscriptions[1].has_unseen);
}

#[tokio::test]
async fn notifies_story_subscribers_on_mutation() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    let mut stories_rx = store.subscribe_stories(peer).await;

    store.set_stories(peer, vec![item(1)]).await;
    timeout(Duration::from_secs(5), stories_rx.changed())
        .await
        .expect("notification before timeout")
        .expect("sender alive");
}

#[tokio::test]
async fn resolve_placeholder_fills_content() {
    let store = StoryStore::new();
    let peer = PeerId(1);
    let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    store.insert_placeholder(peer, StoryId(4), timestamp).await;

    store
        .resolve_placeholder(peer, item(4))
        .await
        .expect("placeholder present");
    let view = store.peer_stories(peer).await;
    assert!(view.entries[0].item().is_some());

    let err = store
        .resolve_placeholder(peer, item(9))
        .await
        .expect_err("no placeholder for id 9");
    assert!(matches!(err, StoreError::UnknownStory(_)));
}

#[tokio::test]
async fn gated_fetch_stays_live_until_released() {
    let fetcher = Arc::new(MemoryMediaFetcher::gated());
    let task_fetcher = Arc::clone(&fetcher);
    let handle = tokio::spawn(async move {
        task_fetcher
            .fetch(media(100), FetchPriority(0), None)
            .await
    });

    wait_until(|| fetcher.active() == vec![MediaId(100)]).await;

    fetcher.release(MediaId(100));
    handle.await.expect("join").expect("fetch");
    assert!(fetcher.active().is_empty());
}

#[tokio::test]
async fn aborted_fetch_leaves_live_set() {
    let fetcher = Arc::new(MemoryMediaFetcher::gated());
    let task_fetcher = Arc::clone(&fetcher);
    let handle = tokio::spawn(async move {
        task_fetcher
            .fetch(media(100), FetchPriority(0), None)
            .await
    });

    wait_until(|| fetcher.active() == vec![MediaId(100)]).await;

    handle.abort();
    wait_until(|| fetcher.active().is_empty()).await;
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition before timeout");
}
