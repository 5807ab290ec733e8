use thiserror::Error;

use crate::domain::{PeerId, StoryKey};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("unknown peer {}", (.0).0)]
    UnknownPeer(PeerId),
    #[error("unknown story {} for peer {}", .0.id.0, .0.peer_id.0)]
    UnknownStory(StoryKey),
    #[error("story {} for peer {} is not pending", .0.id.0, .0.peer_id.0)]
    NotPending(StoryKey),
}
