pub mod checksum;
pub mod chunk;
pub mod download;
pub mod engine;
pub mod executor;
pub mod progress;
pub mod remove;
pub mod scanner;
pub mod status;
pub mod upload;

pub use checksum::{file_digest, stream_digest, ChecksumStep, HashAlgorithm, DEFAULT_BLOCK_SIZE};
pub use chunk::{plan_chunks, Chunk, ObjectTransferGroup};
pub use engine::{TransferEngine, TransferReport};
pub use executor::{TaskHandle, TaskOutcome, TransferCoordinator, WorkerContext};
pub use progress::{ProgressEvent, ProgressSink, TransferProgress};
pub use remove::{remove_tree, RemoveTree};
pub use scanner::BatchStats;
pub use status::{
    CancelFn, OperationState, OperationStatus, PathStatus, StatusBoard, StatusRegistry,
    StatusSnapshot,
};
