use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity for any persisted record (spec §3: "stable unique identifier").
pub type TransferId = String;

pub fn new_transfer_id() -> TransferId {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// The transition table in spec §4.4 applies identically to both record kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    InProgress,
    Paused,
    Complete,
    Failed,
    Canceled,
    Deleted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Canceled | TransferState::Deleted
        )
    }

    /// spec §4.4: `pauseable = state ∈ {pending, inProgress}`.
    pub fn is_pauseable(&self) -> bool {
        matches!(self, TransferState::Pending | TransferState::InProgress)
    }

    /// spec §4.4: `resumable = state ∈ {paused, failed}`.
    pub fn is_resumable(&self) -> bool {
        matches!(self, TransferState::Paused | TransferState::Failed)
    }
}

/// Direction-specific metadata the caller attaches to a [`BlobTransfer`] (spec §3:
/// "direction-dependent... persisted verbatim"). Kept as an opaque `serde_json::Value` bag the
/// same way the teacher's `ObjectMetadata::raw` carries fields it doesn't interpret, plus the
/// handful of fields the transfer engine itself needs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProperties {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// A single logical upload or download (spec §3, parent record).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobTransfer {
    pub id: TransferId,
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    pub client_restoration_id: String,
    pub properties: TransferProperties,
    pub state: TransferState,
    pub total_blocks: u32,
    pub initial_call_complete: bool,
    pub error: Option<String>,
    pub children: Vec<TransferId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlobTransfer {
    pub fn new(
        direction: Direction,
        source: impl Into<String>,
        destination: impl Into<String>,
        client_restoration_id: impl Into<String>,
        properties: TransferProperties,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_transfer_id(),
            direction,
            source: source.into(),
            destination: destination.into(),
            client_restoration_id: client_restoration_id.into(),
            properties,
            state: TransferState::Pending,
            total_blocks: 0,
            initial_call_complete: false,
            error: None,
            children: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One contiguous byte-range chunk of a blob (spec §3, child record).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockTransfer {
    pub id: TransferId,
    pub parent: TransferId,
    pub start_range: u64,
    pub end_range: u64,
    pub state: TransferState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlockTransfer {
    pub fn new(id: TransferId, parent: TransferId, start_range: u64, end_range: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent,
            start_range,
            end_range,
            state: TransferState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn len(&self) -> u64 {
        self.end_range - self.start_range
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Tagged variant replacing subclass dispatch over `{BlobTransfer, BlockTransfer}`
/// (spec §9 REDESIGN FLAG: "Polymorphism over `Transfer`").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record")]
pub enum TransferRecord {
    Blob(BlobTransfer),
    Block(BlockTransfer),
}

impl TransferRecord {
    pub fn id(&self) -> &str {
        match self {
            TransferRecord::Blob(b) => &b.id,
            TransferRecord::Block(b) => &b.id,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            TransferRecord::Blob(_) => None,
            TransferRecord::Block(b) => Some(&b.parent),
        }
    }

    pub fn state(&self) -> TransferState {
        match self {
            TransferRecord::Blob(b) => b.state,
            TransferRecord::Block(b) => b.state,
        }
    }

    pub fn set_state(&mut self, state: TransferState) {
        match self {
            TransferRecord::Blob(b) => {
                b.state = state;
                b.touch();
            }
            TransferRecord::Block(b) => {
                b.state = state;
                b.touch();
            }
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            TransferRecord::Blob(_) => RecordKind::Blob,
            TransferRecord::Block(_) => RecordKind::Block,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobTransfer> {
        match self {
            TransferRecord::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_blob_mut(&mut self) -> Option<&mut BlobTransfer> {
        match self {
            TransferRecord::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockTransfer> {
        match self {
            TransferRecord::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut BlockTransfer> {
        match self {
            TransferRecord::Block(b) => Some(b),
            _ => None,
        }
    }
}

/// The three record kinds named in spec §4.1 / §6. `MultiBlobTransfer` is represented as a plain
/// grouping of [`TransferId`]s elsewhere rather than as a fourth persisted-record variant — see
/// DESIGN.md's Open Question decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Blob,
    Block,
}

/// A caller-supplied, partially populated transfer used with `Manager::add` (spec §4.6).
#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    pub client_restoration_id: String,
    pub properties: TransferProperties,
}
