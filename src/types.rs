//! Core types for the chunk migration subsystem.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Shard identifier in the cluster.
pub type ShardId = u64;

/// Stable identifier of a sharded collection.
pub type CollectionUuid = Uuid;

/// A shard key value, encoded as an ordered byte tuple.
pub type ShardKey = Vec<u8>;

/// One endpoint of a key range.
///
/// Variant order matters: the derived `Ord` gives
/// `NegInfinity < Key(_) < PosInfinity`, with byte-wise comparison
/// between two `Key` bounds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyBound {
    /// Below every key.
    NegInfinity,
    /// A concrete key (inclusive as a min bound, exclusive as a max bound).
    Key(Vec<u8>),
    /// Above every key.
    PosInfinity,
}

impl KeyBound {
    /// Create a concrete key bound.
    pub fn key(k: impl Into<Vec<u8>>) -> Self {
        Self::Key(k.into())
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::NegInfinity => write!(f, "-inf"),
            KeyBound::Key(k) => write!(f, "{}", String::from_utf8_lossy(k)),
            KeyBound::PosInfinity => write!(f, "+inf"),
        }
    }
}

/// A half-open key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub min: KeyBound,
    /// Exclusive upper bound.
    pub max: KeyBound,
}

impl KeyRange {
    /// Create a new range.
    pub fn new(min: KeyBound, max: KeyBound) -> Self {
        Self { min, max }
    }

    /// The full key space `[-inf, +inf)`.
    pub fn full() -> Self {
        Self {
            min: KeyBound::NegInfinity,
            max: KeyBound::PosInfinity,
        }
    }

    /// Check whether the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// Check whether `key` falls inside `[min, max)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_min = match &self.min {
            KeyBound::NegInfinity => true,
            KeyBound::Key(k) => k.as_slice() <= key,
            KeyBound::PosInfinity => false,
        };
        let below_max = match &self.max {
            KeyBound::NegInfinity => false,
            KeyBound::Key(k) => key < k.as_slice(),
            KeyBound::PosInfinity => true,
        };
        above_min && below_max
    }

    /// Check whether two half-open ranges share any key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Monotonic version of a chunk.
///
/// The major term bumps on every ownership change; the minor ordinal
/// bumps on metadata-only changes such as splits. Ordering is
/// lexicographic `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    /// Major term, bumped on ownership changes.
    pub major: u64,
    /// Minor ordinal within a term.
    pub minor: u64,
}

impl ChunkVersion {
    /// Create a version.
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Next major term (minor resets to zero).
    pub fn bump_major(self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }

    /// Next minor ordinal within the current term.
    pub fn bump_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// A contiguous key range owned by exactly one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// The half-open range this chunk covers.
    pub range: KeyRange,
    /// The owning shard.
    pub shard: ShardId,
    /// Monotonic version of this chunk.
    pub version: ChunkVersion,
    /// The collection this chunk belongs to.
    pub collection: CollectionUuid,
}

/// Routing metadata for one sharded collection.
///
/// Chunks are kept sorted by `min` and must partition the entire key
/// space with no gaps and no overlaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRoutingInfo {
    /// The collection.
    pub collection: CollectionUuid,
    /// Opaque identifier invalidated on a full reshard.
    pub epoch: Uuid,
    /// Shard key pattern, retained for display and diagnostics.
    pub key_pattern: String,
    /// Chunks sorted by `min`.
    pub chunks: Vec<Chunk>,
}

impl CollectionRoutingInfo {
    /// Create routing info, sorting the chunks by `min`.
    pub fn new(
        collection: CollectionUuid,
        key_pattern: impl Into<String>,
        mut chunks: Vec<Chunk>,
    ) -> Self {
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        Self {
            collection,
            epoch: Uuid::new_v4(),
            key_pattern: key_pattern.into(),
            chunks,
        }
    }

    /// Validate the partition invariant: the chunks cover `[-inf, +inf)`
    /// contiguously with no gaps or overlaps.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunks.is_empty() {
            return Err("routing info has no chunks".to_string());
        }
        if self.chunks[0].range.min != KeyBound::NegInfinity {
            return Err("first chunk does not start at -inf".to_string());
        }
        if self.chunks.last().unwrap().range.max != KeyBound::PosInfinity {
            return Err("last chunk does not end at +inf".to_string());
        }
        for pair in self.chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return Err(format!(
                    "gap or overlap between {} and {}",
                    pair[0].range, pair[1].range
                ));
            }
        }
        for chunk in &self.chunks {
            if chunk.range.is_empty() {
                return Err(format!("empty chunk {}", chunk.range));
            }
            if chunk.collection != self.collection {
                return Err("chunk belongs to a different collection".to_string());
            }
        }
        Ok(())
    }

    /// The chunk whose range contains `key`.
    pub fn chunk_for(&self, key: &[u8]) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range.contains(key))
    }

    /// The chunk exactly matching `range`.
    pub fn chunk_for_range(&self, range: &KeyRange) -> Option<&Chunk> {
        self.chunks.iter().find(|c| &c.range == range)
    }

    /// The shard owning `key` and the chunk's version.
    pub fn owner_of(&self, key: &[u8]) -> Option<(ShardId, ChunkVersion)> {
        self.chunk_for(key).map(|c| (c.shard, c.version))
    }

    /// The highest chunk version in this collection.
    pub fn max_version(&self) -> ChunkVersion {
        self.chunks
            .iter()
            .map(|c| c.version)
            .max()
            .unwrap_or(ChunkVersion::new(0, 0))
    }
}

/// A document, addressed by its shard key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Shard key of the document.
    pub key: ShardKey,
    /// Opaque document body.
    pub body: Bytes,
}

impl Document {
    /// Create a document.
    pub fn new(key: impl Into<Vec<u8>>, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }
}

/// Index metadata, compared by name when checking migration preconditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Key pattern, retained for diagnostics.
    pub key_pattern: String,
}

impl IndexSpec {
    /// Create an index spec.
    pub fn new(name: impl Into<String>, key_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_pattern: key_pattern.into(),
        }
    }
}

/// The canonical operation kinds applied through the write path and
/// streamed to a migration recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModKind {
    /// Insert a new document.
    Insert(Document),
    /// Replace an existing document.
    Update(Document),
    /// Delete a document by key.
    Delete {
        /// Shard key of the deleted document.
        key: ShardKey,
    },
}

/// A single write operation.
///
/// Legacy command aliases map onto the same canonical `ModKind`; the
/// alias is retained only for error messages and never branches logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModOp {
    /// Canonical operation.
    pub kind: ModKind,
    /// Display alias from a legacy command surface, if any.
    pub alias: Option<String>,
}

impl ModOp {
    /// Create an insert op.
    pub fn insert(doc: Document) -> Self {
        Self {
            kind: ModKind::Insert(doc),
            alias: None,
        }
    }

    /// Create an update op.
    pub fn update(doc: Document) -> Self {
        Self {
            kind: ModKind::Update(doc),
            alias: None,
        }
    }

    /// Create a delete op.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ModKind::Delete { key: key.into() },
            alias: None,
        }
    }

    /// Attach a legacy display alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The shard key this op targets.
    pub fn key(&self) -> &[u8] {
        match &self.kind {
            ModKind::Insert(doc) | ModKind::Update(doc) => &doc.key,
            ModKind::Delete { key } => key,
        }
    }

    /// The name shown in error messages: the legacy alias when one was
    /// used, otherwise the canonical name.
    pub fn display_name(&self) -> &str {
        if let Some(alias) = &self.alias {
            return alias;
        }
        match self.kind {
            ModKind::Insert(_) => "insert",
            ModKind::Update(_) => "update",
            ModKind::Delete { .. } => "delete",
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
