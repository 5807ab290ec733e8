//! Multi-peer story pager with speculative prefetch.
//!
//! [`StoryFeedContext`] keeps a three-peer window (previous/central/next) of
//! [`PeerContext`] reconciliation actors warm over the subscriptions feed,
//! publishes one coalesced [`StoryFeedState`], and derives prefetch and
//! view-receipt poll work from the visible window. [`SingleStoryContext`] and
//! [`PeerStoriesContext`] are single-peer instantiations of the same pattern
//! for deep links and full per-peer lists.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use shared::domain::{
    MediaId, MediaReference, PeerId, StoryId, StoryItem, StoryKey, StorySubscription,
};
use storage::{FetchPriority, MediaFetcher, StoryLoader, StoryStore};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod peer_context;
pub mod prefetch;
pub mod single;
pub mod slice;
pub mod state_context;

pub use peer_context::PeerContext;
pub use single::{PeerStoriesContext, SingleStoryContext};
pub use slice::{StoryFeedState, StorySlice};
pub use state_context::StateContext;

/// Aborts the wrapped task when dropped, so every context's background work
/// dies with its owner.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemNavigation {
    Previous,
    Next,
    Id(StoryId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    /// Swap the central peer; rebuilds the state window.
    Peer(Direction),
    /// Refocus within the central peer; no window rebuild.
    Item(ItemNavigation),
}

/// Explicitly injected tuning knobs; no ambient configuration.
#[derive(Debug, Clone, Copy)]
pub struct PagerConfig {
    /// Upcoming items kept under active prefetch.
    pub prefetch_count: usize,
    /// Placeholder-load radius around the focused index.
    pub load_radius: usize,
    /// Own-peer items polled for fresh view receipts.
    pub poll_count: usize,
    /// Head bytes fetched for video prefetch.
    pub video_head_bytes: u64,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 3,
            load_radius: 2,
            poll_count: 3,
            video_head_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Command-and-observe surface shared by the feed pager and its single-peer
/// variants. `updated` carries no payload; consumers re-read `state`.
#[async_trait]
pub trait StoryContentContext: Send + Sync {
    fn state(&self) -> StoryFeedState;
    fn subscribe_state(&self) -> watch::Receiver<StoryFeedState>;
    fn subscribe_updated(&self) -> broadcast::Receiver<()>;
    async fn navigate(&self, navigation: Navigation);
    async fn mark_as_seen(&self, key: StoryKey);
    /// Drops side contexts' sticky focus back to the default rule. Idempotent.
    async fn reset_side_states(&self);
}

enum Command {
    Navigate(Navigation),
    ResetSideStates,
}

enum Intake {
    Command(Command),
    SubscriptionsChanged,
    PendingReady { generation: u64 },
    CurrentUpdated { generation: u64 },
}

/// Top-level orchestrator over the subscriptions feed.
pub struct StoryFeedContext {
    intake_tx: mpsc::UnboundedSender<Intake>,
    state_rx: watch::Receiver<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,
    store: StoryStore,
    _task: AbortOnDrop,
}

impl StoryFeedContext {
    pub fn new(
        store: StoryStore,
        fetcher: Arc<dyn MediaFetcher>,
        loader: Arc<dyn StoryLoader>,
        my_peer_id: PeerId,
        focused_peer_id: Option<PeerId>,
        config: PagerConfig,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StoryFeedState::default());
        let (updated_tx, _) = broadcast::channel(64);
        let actor = FeedActor {
            store: store.clone(),
            fetcher,
            loader,
            my_peer_id,
            requested_focus: focused_peer_id,
            config,
            intake_tx: intake_tx.clone(),
            state_tx,
            updated_tx: updated_tx.clone(),
            subscriptions: Vec::new(),
            fixed_order: None,
            started_with_unseen: None,
            current: None,
            pending: None,
            generation: 0,
            prefetch_tasks: HashMap::new(),
            poll_tasks: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(intake_rx));
        Self {
            intake_tx,
            state_rx,
            updated_tx,
            store,
            _task: AbortOnDrop(task),
        }
    }
}

#[async_trait]
impl StoryContentContext for StoryFeedContext {
    fn state(&self) -> StoryFeedState {
        self.state_rx.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<StoryFeedState> {
        self.state_rx.clone()
    }

    fn subscribe_updated(&self) -> broadcast::Receiver<()> {
        self.updated_tx.subscribe()
    }

    async fn navigate(&self, navigation: Navigation) {
        let _ = self
            .intake_tx
            .send(Intake::Command(Command::Navigate(navigation)));
    }

    async fn mark_as_seen(&self, key: StoryKey) {
        self.store.mark_seen(key).await;
    }

    async fn reset_side_states(&self) {
        let _ = self.intake_tx.send(Intake::Command(Command::ResetSideStates));
    }
}

struct ActiveState {
    context: StateContext,
    generation: u64,
    _forward_task: AbortOnDrop,
}

impl ActiveState {
    fn window(&self) -> (Option<PeerId>, PeerId, Option<PeerId>) {
        (
            self.context.previous().map(|context| context.peer_id()),
            self.context.central().peer_id(),
            self.context.next().map(|context| context.peer_id()),
        )
    }
}

/// Lives only during a switch-over; promoted atomically once its central
/// context signals readiness, so the old state never flashes empty.
struct PendingState {
    context: StateContext,
    generation: u64,
    _ready_task: AbortOnDrop,
}

struct FeedActor {
    store: StoryStore,
    fetcher: Arc<dyn MediaFetcher>,
    loader: Arc<dyn StoryLoader>,
    my_peer_id: PeerId,
    requested_focus: Option<PeerId>,
    config: PagerConfig,
    intake_tx: mpsc::UnboundedSender<Intake>,
    state_tx: watch::Sender<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,

    subscriptions: Vec<StorySubscription>,
    /// Once the session starts on unseen content, the filtered order is
    /// remembered so the pager never reorders under the user.
    fixed_order: Option<Vec<PeerId>>,
    started_with_unseen: Option<bool>,

    current: Option<ActiveState>,
    pending: Option<PendingState>,
    generation: u64,

    prefetch_tasks: HashMap<MediaId, AbortOnDrop>,
    poll_tasks: HashMap<StoryKey, AbortOnDrop>,
}

impl FeedActor {
    async fn run(mut self, mut intake_rx: mpsc::UnboundedReceiver<Intake>) {
        let mut subscriptions_rx = self.store.subscribe_subscriptions().await;
        let feed_tx = self.intake_tx.clone();
        let _subscriptions_task = AbortOnDrop(tokio::spawn(async move {
            while subscriptions_rx.changed().await.is_ok() {
                if feed_tx.send(Intake::SubscriptionsChanged).is_err() {
                    break;
                }
            }
        }));

        self.handle_subscriptions_changed().await;
        while let Some(intake) = intake_rx.recv().await {
            match intake {
                Intake::Command(command) => self.handle_command(command).await,
                Intake::SubscriptionsChanged => self.handle_subscriptions_changed().await,
                Intake::PendingReady { generation } => self.promote_pending(generation).await,
                Intake::CurrentUpdated { generation } => {
                    let live = self
                        .current
                        .as_ref()
                        .is_some_and(|active| active.generation == generation);
                    if live {
                        self.commit_state();
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Navigate(Navigation::Peer(direction)) => {
                self.navigate_peer(direction).await;
            }
            Command::Navigate(Navigation::Item(navigation)) => {
                self.navigate_item(navigation);
            }
            Command::ResetSideStates => {
                if let Some(active) = &self.current {
                    if let Some(context) = active.context.previous() {
                        context.set_focused_id(None);
                    }
                    if let Some(context) = active.context.next() {
                        context.set_focused_id(None);
                    }
                }
            }
        }
    }

    async fn navigate_peer(&mut self, direction: Direction) {
        let Some(active) = &self.current else {
            return;
        };
        let central_peer = active.context.central().peer_id();
        let Some(index) = self
            .subscriptions
            .iter()
            .position(|subscription| subscription.peer_id == central_peer)
        else {
            return;
        };
        let target = match direction {
            Direction::Previous => index.checked_sub(1),
            Direction::Next => (index + 1 < self.subscriptions.len()).then_some(index + 1),
        };
        match target {
            Some(target_index) => {
                let peer_id = self.subscriptions[target_index].peer_id;
                // A rapid re-navigation discards the in-flight switch whole,
                // readiness wait included.
                self.pending = None;
                self.switch_to(Some(peer_id)).await;
            }
            None => debug!(peer_id = central_peer.0, "peer navigation at feed boundary"),
        }
    }

    fn navigate_item(&self, navigation: ItemNavigation) {
        let Some(active) = &self.current else {
            return;
        };
        let central = active.context.central();
        let Some(current_slice) = central.current_slice() else {
            return;
        };
        let target = match navigation {
            ItemNavigation::Previous => current_slice.previous_id,
            ItemNavigation::Next => current_slice.next_id,
            ItemNavigation::Id(id) => Some(id),
        };
        match target {
            Some(id) => central.set_focused_id(Some(id)),
            None => debug!(
                peer_id = central.peer_id().0,
                "item navigation at list boundary"
            ),
        }
    }

    async fn handle_subscriptions_changed(&mut self) {
        let raw = self.store.subscriptions().await;
        if self.started_with_unseen.is_none() && !raw.is_empty() {
            let central = self
                .requested_focus
                .filter(|peer_id| raw.iter().any(|s| s.peer_id == *peer_id))
                .or_else(|| raw.iter().find(|s| s.has_unseen).map(|s| s.peer_id))
                .unwrap_or(raw[0].peer_id);
            let started_with_unseen = raw
                .iter()
                .find(|s| s.peer_id == central)
                .is_some_and(|s| s.has_unseen);
            self.started_with_unseen = Some(started_with_unseen);
            if started_with_unseen {
                self.fixed_order = Some(
                    raw.iter()
                        .filter(|s| s.has_unseen)
                        .map(|s| s.peer_id)
                        .collect(),
                );
            }
        }
        if let Some(order) = &mut self.fixed_order {
            for subscription in &raw {
                if subscription.has_unseen && !order.contains(&subscription.peer_id) {
                    order.push(subscription.peer_id);
                }
            }
            self.subscriptions = order
                .iter()
                .filter_map(|peer_id| raw.iter().find(|s| s.peer_id == *peer_id).copied())
                .collect();
        } else {
            self.subscriptions = raw;
        }

        let focus = if let Some(pending) = &self.pending {
            Some(pending.context.central().peer_id())
        } else if let Some(active) = &self.current {
            Some(active.context.central().peer_id())
        } else {
            self.requested_focus
        };
        self.switch_to(focus).await;
    }

    /// Decides the central peer and installs a pending three-context window,
    /// reusing live contexts whose peer stays inside the window.
    async fn switch_to(&mut self, focus: Option<PeerId>) {
        if self.subscriptions.is_empty() {
            self.pending = None;
            self.current = None;
            self.commit_state();
            return;
        }
        let central_index = focus
            .and_then(|peer_id| {
                self.subscriptions
                    .iter()
                    .position(|subscription| subscription.peer_id == peer_id)
            })
            .or_else(|| {
                self.subscriptions
                    .iter()
                    .position(|subscription| subscription.has_unseen)
            })
            .unwrap_or(0);
        let previous_peer = central_index
            .checked_sub(1)
            .map(|index| self.subscriptions[index].peer_id);
        let central_peer = self.subscriptions[central_index].peer_id;
        let next_peer = self
            .subscriptions
            .get(central_index + 1)
            .map(|subscription| subscription.peer_id);

        if self.pending.is_none() {
            if let Some(active) = &self.current {
                if active.window() == (previous_peer, central_peer, next_peer) {
                    return;
                }
            }
        }

        let previous = previous_peer.map(|peer_id| self.obtain_context(peer_id));
        let central = self.obtain_context(central_peer);
        let next = next_peer.map(|peer_id| self.obtain_context(peer_id));
        let context = StateContext::new(previous, central, next);

        self.generation += 1;
        let generation = self.generation;
        let mut ready_rx = context.subscribe_ready();
        let intake_tx = self.intake_tx.clone();
        let ready_task = tokio::spawn(async move {
            if ready_rx.wait_for(|ready| *ready).await.is_ok() {
                let _ = intake_tx.send(Intake::PendingReady { generation });
            }
        });
        self.pending = Some(PendingState {
            context,
            generation,
            _ready_task: AbortOnDrop(ready_task),
        });
    }

    fn obtain_context(&self, peer_id: PeerId) -> Arc<PeerContext> {
        if let Some(active) = &self.current {
            if let Some(existing) = active.context.find(peer_id) {
                return existing;
            }
        }
        if let Some(pending) = &self.pending {
            if let Some(existing) = pending.context.find(peer_id) {
                return existing;
            }
        }
        Arc::new(PeerContext::new(
            self.store.clone(),
            Arc::clone(&self.loader),
            peer_id,
            None,
            self.config.load_radius,
        ))
    }

    async fn promote_pending(&mut self, generation: u64) {
        let live = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation);
        if !live {
            debug!(generation, "ignoring readiness of superseded pending state");
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        let mut updated_rx = pending.context.subscribe_updated();
        let intake_tx = self.intake_tx.clone();
        let forward_task = tokio::spawn(async move {
            while updated_rx.changed().await.is_ok() {
                if intake_tx.send(Intake::CurrentUpdated { generation }).is_err() {
                    break;
                }
            }
        });
        self.current = Some(ActiveState {
            context: pending.context,
            generation: pending.generation,
            _forward_task: AbortOnDrop(forward_task),
        });
        self.commit_state();
    }

    /// Publishes the three-slice view; on any committed change fires `updated`
    /// once and re-derives the speculative work sets.
    fn commit_state(&mut self) {
        let state = match &self.current {
            Some(active) => StoryFeedState {
                previous: active
                    .context
                    .previous()
                    .and_then(|context| context.current_slice()),
                current: active.context.central().current_slice(),
                next: active
                    .context
                    .next()
                    .and_then(|context| context.current_slice()),
            },
            None => StoryFeedState::default(),
        };
        let committed = state.clone();
        let changed = self.state_tx.send_if_modified(|value| {
            if *value == state {
                false
            } else {
                *value = state;
                true
            }
        });
        if changed {
            let _ = self.updated_tx.send(());
            self.reconcile_prefetch(&committed);
            self.reconcile_polls(&committed);
        }
    }

    fn reconcile_prefetch(&mut self, state: &StoryFeedState) {
        reconcile_prefetch_tasks(
            &mut self.prefetch_tasks,
            &self.fetcher,
            state,
            self.config.prefetch_count,
            self.config.video_head_bytes,
        );
    }

    /// Own-peer items in the visible window get a view-receipt refresh, one
    /// in-flight request per item.
    fn reconcile_polls(&mut self, state: &StoryFeedState) {
        let mut desired: Vec<StoryKey> = Vec::new();
        if let Some(slice) = &state.current {
            if slice.peer.id == self.my_peer_id {
                if let Some(item) = &slice.focused {
                    desired.push(item.key(slice.peer.id));
                }
            }
        }
        for (peer_id, item) in upcoming_items(state, self.config.poll_count) {
            if peer_id == self.my_peer_id {
                desired.push(item.key(peer_id));
            }
        }
        desired.truncate(self.config.poll_count);

        let desired_keys: HashSet<StoryKey> = desired.iter().copied().collect();
        self.poll_tasks.retain(|key, _| desired_keys.contains(key));
        for key in desired {
            if self.poll_tasks.contains_key(&key) {
                continue;
            }
            let loader = Arc::clone(&self.loader);
            let handle = tokio::spawn(async move {
                if let Err(err) = loader.refresh_story_views(key).await {
                    warn!(
                        peer_id = key.peer_id.0,
                        story_id = key.id.0,
                        error = %err,
                        "view receipt refresh failed"
                    );
                }
            });
            self.poll_tasks.insert(key, AbortOnDrop(handle));
        }
    }
}

/// Keeps exactly the top upcoming items' media under active prefetch:
/// missing tasks are started with descending priority, tasks for media that
/// left the window are cancelled, everything else is left running.
pub(crate) fn reconcile_prefetch_tasks(
    tasks: &mut HashMap<MediaId, AbortOnDrop>,
    fetcher: &Arc<dyn MediaFetcher>,
    state: &StoryFeedState,
    prefetch_count: usize,
    video_head_bytes: u64,
) {
    let mut desired: Vec<MediaReference> = Vec::new();
    let mut desired_ids: HashSet<MediaId> = HashSet::new();
    for (_, item) in upcoming_items(state, prefetch_count) {
        if desired_ids.insert(item.media.media_id) {
            desired.push(item.media);
        }
    }

    tasks.retain(|media_id, _| desired_ids.contains(media_id));
    for (position, media) in desired.into_iter().enumerate() {
        if tasks.contains_key(&media.media_id) {
            continue;
        }
        let fetcher = Arc::clone(fetcher);
        let priority = FetchPriority(position as u32);
        let handle = tokio::spawn(async move {
            let preload =
                prefetch::preload_story_media(fetcher.as_ref(), media, priority, video_head_bytes)
                    .await;
            if let Err(err) = preload {
                warn!(media_id = media.media_id.0, error = %err, "story media preload failed");
            }
        });
        tasks.insert(media.media_id, AbortOnDrop(handle));
    }
}

/// Display-order walk of what the user will most likely see next: loaded
/// items after the central focus, then the next peer's items.
fn upcoming_items(state: &StoryFeedState, limit: usize) -> Vec<(PeerId, StoryItem)> {
    let mut upcoming = Vec::new();
    if limit == 0 {
        return upcoming;
    }
    if let Some(slice) = &state.current {
        if let Some(index) = slice.focused_index() {
            for entry in slice.entries.iter().skip(index + 1) {
                if let Some(item) = entry.item() {
                    upcoming.push((slice.peer.id, item.clone()));
                    if upcoming.len() == limit {
                        return upcoming;
                    }
                }
            }
        }
    }
    if let Some(slice) = &state.next {
        for entry in &slice.entries {
            if let Some(item) = entry.item() {
                upcoming.push((slice.peer.id, item.clone()));
                if upcoming.len() == limit {
                    break;
                }
            }
        }
    }
    upcoming
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
