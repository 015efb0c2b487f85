//! 远程存储同步客户端的数据传输核心
//!
//! 分块并行下载和上传、端到端校验、可取消的批次执行以及流式递归删除。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod remote;

pub use config::TransferConfig;
pub use core::{
    OperationState, StatusBoard, TransferEngine, TransferProgress, TransferReport,
};
pub use error::{StoreError, TransferError};
pub use remote::{FsStore, LockedSession, RemoteStore};
