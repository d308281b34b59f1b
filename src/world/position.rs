use serde::{Deserialize, Serialize};

/// Horizontal chunk edge length in blocks, as a shift
pub const CHUNK_SHIFT: i32 = 4;
const CHUNK_MASK: i32 = (1 << CHUNK_SHIFT) - 1;

/// Position of a chunk in a world (chunk coordinates, horizontal plane only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the given block column
    pub fn from_block(x: i32, z: i32) -> Self {
        Self::new(x >> CHUNK_SHIFT, z >> CHUNK_SHIFT)
    }

    pub fn id(&self) -> ChunkId {
        ChunkId::pack(self.x, self.z)
    }
}

/// Packed chunk coordinates, unique within one world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub fn pack(chunk_x: i32, chunk_z: i32) -> Self {
        ChunkId(((chunk_x as u32 as u64) << 32) | (chunk_z as u32 as u64))
    }

    pub fn unpack(&self) -> ChunkPos {
        ChunkPos::new((self.0 >> 32) as u32 as i32, self.0 as u32 as i32)
    }

    /// Chunk owning the given block column
    pub fn from_block(x: i32, z: i32) -> Self {
        ChunkPos::from_block(x, z).id()
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pos = self.unpack();
        write!(f, "[{}, {}]", pos.x, pos.z)
    }
}

/// Hash of a block position relative to its chunk.
///
/// Unique within one chunk for `y` in `[-2^23, 2^23)`; the top 8 bits of `y`
/// are shifted out.
pub fn local_hash(x: i32, y: i32, z: i32) -> i32 {
    (y << 8) | ((x & CHUNK_MASK) << 4) | (z & CHUNK_MASK)
}

/// Block position inside a named world
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerPos {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl TriggerPos {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    pub fn chunk_pos(&self) -> ChunkPos {
        ChunkPos::from_block(self.x, self.z)
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_pos().id()
    }

    pub fn local_hash(&self) -> i32 {
        local_hash(self.x, self.y, self.z)
    }
}

impl std::fmt::Display for TriggerPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@({}, {}, {})", self.world, self.x, self.y, self.z)
    }
}
