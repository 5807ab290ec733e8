use super::*;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use shared::domain::{
    MediaId, MediaKind, MediaReference, PeerId, StoryId, StoryItem, PENDING_STORY_ID_BASE,
};
use std::time::Duration;
use storage::MemoryStoryLoader;
use tokio::time::timeout;

fn media(id: i64) -> MediaReference {
    MediaReference {
        media_id: MediaId(id),
        kind: MediaKind::Image,
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

fn peer(id: i64) -> Peer {
    Peer {
        id: PeerId(id),
        name: format!("peer-{id}"),
        notifications_muted: false,
        presence: PeerPresence::Online,
        can_send_voice_messages: true,
    }
}

fn context(
    store: &StoryStore,
    loader: &Arc<MemoryStoryLoader>,
    peer_id: PeerId,
    focus: Option<StoryId>,
) -> PeerContext {
    PeerContext::new(
        store.clone(),
        Arc::clone(loader) as Arc<dyn StoryLoader>,
        peer_id,
        focus,
        2,
    )
}

async fn wait_slice(
    context: &PeerContext,
    mut predicate: impl FnMut(&StorySlice) -> bool,
) -> StorySlice {
    let mut slice_rx = context.subscribe();
    let slice = timeout(
        Duration::from_secs(5),
        slice_rx.wait_for(|slice| slice.as_ref().is_some_and(|slice| predicate(slice))),
    )
    .await
    .expect("slice before timeout")
    .expect("context alive");
    slice.clone().expect("slice present")
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

#[tokio::test]
async fn resolves_adjacent_neighbors_from_current_list() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store
        .set_stories(PeerId(1), vec![item(1), item(2), item(3)])
        .await;

    let context = context(&store, &loader, PeerId(1), Some(StoryId(2)));
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(StoryId(2))).await;
    assert_eq!(slice.previous_id, Some(StoryId(1)));
    assert_eq!(slice.next_id, Some(StoryId(3)));
    assert_eq!(slice.total_count, 3);

    context.set_focused_id(Some(StoryId(3)));
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(StoryId(3))).await;
    assert_eq!(slice.previous_id, Some(StoryId(2)));
    assert_eq!(slice.next_id, None);
}

#[tokio::test]
async fn follows_pending_remap_after_upload() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    let local_id = store.add_pending(PeerId(1), item(0)).await;

    let context = context(&store, &loader, PeerId(1), Some(local_id));
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(local_id)).await;
    assert!(slice.focused.as_ref().expect("pending item").is_pending);

    store
        .commit_pending(PeerId(1), local_id, item(7))
        .await
        .expect("commit");
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(StoryId(7))).await;
    assert!(!slice.focused.as_ref().expect("confirmed item").is_pending);
}

#[tokio::test]
async fn deleted_focus_falls_back_to_nearest_preceding_item() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store
        .set_stories(PeerId(1), vec![item(1), item(2), item(3)])
        .await;

    let context = context(&store, &loader, PeerId(1), Some(StoryId(3)));
    wait_slice(&context, |slice| slice.focused_id == Some(StoryId(3))).await;

    store
        .delete_story(StoryKey {
            peer_id: PeerId(1),
            id: StoryId(3),
        })
        .await;
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(StoryId(2))).await;
    assert_eq!(slice.next_id, None);
}

#[tokio::test]
async fn deleted_focus_without_predecessor_falls_to_first() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store
        .set_stories(PeerId(1), vec![item(1), item(2), item(3)])
        .await;

    let context = context(&store, &loader, PeerId(1), Some(StoryId(1)));
    wait_slice(&context, |slice| slice.focused_id == Some(StoryId(1))).await;

    store
        .delete_story(StoryKey {
            peer_id: PeerId(1),
            id: StoryId(1),
        })
        .await;
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(StoryId(2))).await;
    assert_eq!(slice.previous_id, None);
}

#[tokio::test]
async fn default_focus_prefers_first_unseen() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store
        .set_stories(PeerId(1), vec![item(1), item(2), item(3)])
        .await;
    store
        .mark_seen(StoryKey {
            peer_id: PeerId(1),
            id: StoryId(1),
        })
        .await;

    let context = context(&store, &loader, PeerId(1), None);
    wait_slice(&context, |slice| slice.focused_id == Some(StoryId(2))).await;
}

#[tokio::test]
async fn default_focus_prefers_pending_over_unseen() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store.set_stories(PeerId(1), vec![item(1), item(2)]).await;
    let local_id = store.add_pending(PeerId(1), item(0)).await;

    let context = context(&store, &loader, PeerId(1), None);
    let slice = wait_slice(&context, |slice| slice.focused_id == Some(local_id)).await;
    assert!(local_id >= PENDING_STORY_ID_BASE);
    assert_eq!(slice.previous_id, Some(StoryId(2)));
}

#[tokio::test]
async fn requests_placeholder_window_once() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());
    store.upsert_peer(peer(1)).await;
    store
        .set_stories(PeerId(1), vec![item(1), item(3), item(5)])
        .await;
    let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    store.insert_placeholder(PeerId(1), StoryId(2), timestamp).await;
    store.insert_placeholder(PeerId(1), StoryId(4), timestamp).await;

    let context = context(&store, &loader, PeerId(1), Some(StoryId(3)));
    wait_slice(&context, |slice| slice.focused_id == Some(StoryId(3))).await;
    wait_until(|| loader.requested_loads().len() == 2).await;
    let requested = loader.requested_loads();
    assert!(requested.contains(&StoryKey {
        peer_id: PeerId(1),
        id: StoryId(2),
    }));
    assert!(requested.contains(&StoryKey {
        peer_id: PeerId(1),
        id: StoryId(4),
    }));

    // Another pass over the same window must not re-request the keys.
    store.upsert_peer(peer(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loader.requested_loads().len(), 2);
}

#[tokio::test]
async fn empty_list_still_signals_ready() {
    let store = StoryStore::new();
    let loader = Arc::new(MemoryStoryLoader::new());

    let context = context(&store, &loader, PeerId(1), None);
    let mut ready_rx = context.subscribe_ready();
    timeout(Duration::from_secs(5), ready_rx.wait_for(|ready| *ready))
        .await
        .expect("ready before timeout")
        .expect("context alive");
    let slice = context.current_slice().expect("slice published");
    assert_eq!(slice.focused_id, None);
    assert_eq!(slice.total_count, 0);
}
