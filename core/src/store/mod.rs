// Store module: persistence, deduplication and the outbound queue

pub mod backend;
pub mod bloom;
pub mod dedup;
pub mod queue;
pub mod snapshot;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use bloom::BloomFilter;
pub use dedup::{DedupEngine, DedupRecord, DedupStats};
pub use queue::{FailureOutcome, PriorityQueue, QueueEntry, QueueError, QueueSnapshot, QueueStats};
pub use snapshot::StateStore;
