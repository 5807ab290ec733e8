use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident, $repr:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $repr);
    };
}

id_newtype!(PeerId, i64);
id_newtype!(StoryId, i32);
id_newtype!(MediaId, i64);

/// First id handed to locally authored stories. Local ids are allocated from
/// this base upward so a merged item list keeps pending entries after every
/// server-assigned id; the server replaces the local id on upload completion.
pub const PENDING_STORY_ID_BASE: StoryId = StoryId(i32::MAX / 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryKey {
    pub peer_id: PeerId,
    pub id: StoryId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video { duration_seconds: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaReference {
    pub media_id: MediaId,
    pub kind: MediaKind,
}

impl MediaReference {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, MediaKind::Video { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionEntity {
    Bold {
        start: usize,
        length: usize,
    },
    Italic {
        start: usize,
        length: usize,
    },
    Mention {
        start: usize,
        length: usize,
        peer_id: PeerId,
    },
    CustomEmoji {
        start: usize,
        length: usize,
        media_id: MediaId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub entities: Vec<CaptionEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryPrivacy {
    Everyone,
    Contacts,
    CloseFriends,
    SelectedPeers(Vec<PeerId>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryViews {
    pub seen_count: u32,
    pub reacted_count: u32,
    pub seen_peer_ids: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryItem {
    pub id: StoryId,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub media: MediaReference,
    pub caption: Caption,
    /// Media backing custom-emoji caption entities, resolved out of band.
    pub entity_media: Vec<MediaReference>,
    pub views: Option<StoryViews>,
    pub privacy: StoryPrivacy,
    pub is_pinned: bool,
    pub is_expired: bool,
    pub is_public: bool,
    pub is_pending: bool,
    pub is_close_friends: bool,
    pub is_forwarding_disabled: bool,
    pub is_edited: bool,
}

impl StoryItem {
    pub fn new(
        id: StoryId,
        timestamp: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        media: MediaReference,
    ) -> Self {
        Self {
            id,
            timestamp,
            expires_at,
            media,
            caption: Caption::default(),
            entity_media: Vec::new(),
            views: None,
            privacy: StoryPrivacy::Everyone,
            is_pinned: false,
            is_expired: false,
            is_public: true,
            is_pending: false,
            is_close_friends: false,
            is_forwarding_disabled: false,
            is_edited: false,
        }
    }

    pub fn key(&self, peer_id: PeerId) -> StoryKey {
        StoryKey {
            peer_id,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPresence {
    Online,
    LastSeen(DateTime<Utc>),
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub notifications_muted: bool,
    pub presence: PeerPresence,
    pub can_send_voice_messages: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySubscription {
    pub peer_id: PeerId,
    pub has_unseen: bool,
    pub has_pending: bool,
}

/// One slot in a peer's story list. A placeholder is a confirmed id whose
/// content has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryEntry {
    Item(StoryItem),
    Placeholder { id: StoryId, timestamp: DateTime<Utc> },
}

impl StoryEntry {
    pub fn id(&self) -> StoryId {
        match self {
            StoryEntry::Item(item) => item.id,
            StoryEntry::Placeholder { id, .. } => *id,
        }
    }

    pub fn item(&self) -> Option<&StoryItem> {
        match self {
            StoryEntry::Item(item) => Some(item),
            StoryEntry::Placeholder { .. } => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, StoryEntry::Placeholder { .. })
    }

    /// Identity triple used for structural change detection: id, whether the
    /// content is loaded, and whether it has been edited since loading.
    pub fn identity(&self) -> (StoryId, bool, bool) {
        match self {
            StoryEntry::Item(item) => (item.id, true, item.is_edited),
            StoryEntry::Placeholder { id, .. } => (*id, false, false),
        }
    }
}
