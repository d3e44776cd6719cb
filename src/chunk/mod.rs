pub mod layout;
pub mod store;

pub use layout::{ChunkLayout, ChunkSpan, split_file_range};
pub use store::{ChunkStore, EvictionCandidate, ScanReport};
