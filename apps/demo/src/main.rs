use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use clap::Parser;
use shared::domain::{
    MediaId, MediaKind, MediaReference, Peer, PeerId, PeerPresence, StoryId, StoryItem,
};
use storage::{MemoryMediaFetcher, MemoryStoryLoader, StoryStore};
use story_core::{
    ItemNavigation, Navigation, PagerConfig, StoryContentContext, StoryFeedContext, StoryFeedState,
};
use tokio::time::timeout;

/// Seeds an in-memory story store and walks the feed pager through every
/// item, printing each committed state as one JSON line.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value_t = 3)]
    peers: i64,
    #[arg(long, default_value_t = 2)]
    stories_per_peer: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let store = StoryStore::new();
    seed(&store, cli.peers, cli.stories_per_peer).await?;

    let fetcher = Arc::new(MemoryMediaFetcher::new());
    let loader = Arc::new(MemoryStoryLoader::new());
    let feed = StoryFeedContext::new(
        store,
        fetcher,
        loader,
        PeerId(1),
        None,
        PagerConfig::default(),
    );

    let mut state_rx = feed.subscribe_state();
    let state = timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|state| state.current.is_some()),
    )
    .await
    .context("feed never became ready")?
    .context("feed context stopped")?
    .clone();
    print_state(&state)?;

    let mut previous = state;
    loop {
        let Some(slice) = &previous.current else {
            break;
        };
        if slice.next_id.is_some() {
            feed.navigate(Navigation::Item(ItemNavigation::Next)).await;
        } else if previous.next.is_some() {
            feed.navigate(Navigation::Peer(story_core::Direction::Next))
                .await;
        } else {
            break;
        }
        let state = timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|state| *state != previous),
        )
        .await
        .context("navigation produced no state change")?
        .context("feed context stopped")?
        .clone();
        print_state(&state)?;
        previous = state;
    }

    Ok(())
}

async fn seed(store: &StoryStore, peers: i64, stories_per_peer: i32) -> Result<()> {
    let mut order = Vec::new();
    for peer_id in 1..=peers {
        store
            .upsert_peer(Peer {
                id: PeerId(peer_id),
                name: format!("peer-{peer_id}"),
                notifications_muted: false,
                presence: PeerPresence::Online,
                can_send_voice_messages: true,
            })
            .await;
        let mut items = Vec::new();
        for id in 1..=stories_per_peer {
            let timestamp = Utc
                .timestamp_opt(1_700_000_000 + i64::from(id), 0)
                .single()
                .context("valid story timestamp")?;
            items.push(StoryItem::new(
                StoryId(id),
                timestamp,
                timestamp + ChronoDuration::hours(24),
                MediaReference {
                    media_id: MediaId(peer_id * 1000 + i64::from(id)),
                    kind: MediaKind::Image,
                },
            ));
        }
        store.set_stories(PeerId(peer_id), items).await;
        order.push(PeerId(peer_id));
    }
    store.set_subscription_order(order).await;
    Ok(())
}

fn print_state(state: &StoryFeedState) -> Result<()> {
    println!("{}", serde_json::to_string(state)?);
    Ok(())
}
