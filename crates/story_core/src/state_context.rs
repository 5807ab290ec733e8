use std::sync::Arc;

use shared::domain::PeerId;
use tokio::sync::watch;
use tokio_stream::{wrappers::WatchStream, StreamExt, StreamMap};

use crate::{peer_context::PeerContext, slice::StorySlice, AbortOnDrop};

/// Groups the central peer context with its optional previous/next neighbors
/// and forwards every child change into one combined generation counter.
/// Readiness is the central context's readiness only; side contexts may still
/// be loading without blocking display.
pub struct StateContext {
    previous: Option<Arc<PeerContext>>,
    central: Arc<PeerContext>,
    next: Option<Arc<PeerContext>>,
    updated_rx: watch::Receiver<u64>,
    _forward_task: AbortOnDrop,
}

impl StateContext {
    pub fn new(
        previous: Option<Arc<PeerContext>>,
        central: Arc<PeerContext>,
        next: Option<Arc<PeerContext>>,
    ) -> Self {
        let (updated_tx, updated_rx) = watch::channel(0u64);
        let mut children: StreamMap<&'static str, WatchStream<Option<StorySlice>>> =
            StreamMap::new();
        if let Some(context) = &previous {
            children.insert("previous", WatchStream::from_changes(context.subscribe()));
        }
        children.insert("central", WatchStream::from_changes(central.subscribe()));
        if let Some(context) = &next {
            children.insert("next", WatchStream::from_changes(context.subscribe()));
        }
        let forward_task = tokio::spawn(async move {
            while children.next().await.is_some() {
                let next_generation = *updated_tx.borrow() + 1;
                if updated_tx.send(next_generation).is_err() {
                    break;
                }
            }
        });
        Self {
            previous,
            central,
            next,
            updated_rx,
            _forward_task: AbortOnDrop(forward_task),
        }
    }

    pub fn central(&self) -> &Arc<PeerContext> {
        &self.central
    }

    pub fn previous(&self) -> Option<&Arc<PeerContext>> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<&Arc<PeerContext>> {
        self.next.as_ref()
    }

    /// Looks up a contained context by peer id so a sliding window can reuse
    /// it instead of rebuilding and dropping in-flight subscriptions.
    pub fn find(&self, peer_id: PeerId) -> Option<Arc<PeerContext>> {
        [Some(&self.central), self.previous.as_ref(), self.next.as_ref()]
            .into_iter()
            .flatten()
            .find(|context| context.peer_id() == peer_id)
            .cloned()
    }

    /// Fires once per child slice change, coalesced into one counter.
    pub fn subscribe_updated(&self) -> watch::Receiver<u64> {
        self.updated_rx.clone()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.central.subscribe_ready()
    }
}
