mod position;

pub use position::{local_hash, ChunkId, ChunkPos, TriggerPos, CHUNK_SHIFT};
