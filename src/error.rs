//! 错误类型
//!
//! 远程存储的原生错误（[`StoreError`]）只在会话边界出现，
//! 进入编排逻辑和状态跟踪器之前统一转换为 [`TransferError`]。

use thiserror::Error;

/// 传输核心对外暴露的错误
#[derive(Debug, Error)]
pub enum TransferError {
    /// 认证或会话失败
    #[error("connection error: {0}")]
    Connection(String),

    /// 传输层失败，由调用方决定是否整批重试
    #[error("network error: {0}")]
    Network(String),

    /// 远程目录服务的逻辑错误（查询错误、描述符越界等）
    #[error("catalog logic error: {0}")]
    CatalogLogic(String),

    /// 远程路径不存在
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// 传输完成后本地与远程摘要不一致
    #[error("file {path} has an incorrect checksum (local='{local}', catalog='{remote}')")]
    Checksum {
        path: String,
        local: String,
        remote: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[{path}] error reading: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: String,
        expected: usize,
        actual: usize,
    },

    /// 工作线程 panic 或被运行时中止
    #[error("worker task failed: {0}")]
    Worker(String),

    /// 调用约定被破坏（缺少必要配置等），直接返回给调用方
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransferError {
    pub fn is_checksum(&self) -> bool {
        matches!(self, TransferError::Checksum { .. })
    }
}

/// 远程存储原生错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid authentication: {0}")]
    AuthenticationFailed(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// 对象不存在（unlink/stat 时可区分的“未找到”信号）
    #[error("no such object: {0}")]
    ObjectNotFound(String),

    /// 集合已存在（create_collection 时可区分的信号）
    #[error("already has an item by that name: {0}")]
    AlreadyExists(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("file descriptor out of range: {0}")]
    DescriptorOutOfRange(String),

    /// 提交时服务端校验和不一致
    #[error("checksum mismatch on {path} (expected '{expected}', computed '{actual}')")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AuthenticationFailed(msg) => TransferError::Connection(msg),
            StoreError::Transport(msg) => TransferError::Network(msg),
            StoreError::UnknownCollection(path) | StoreError::ObjectNotFound(path) => {
                TransferError::FileNotFound(path)
            }
            StoreError::Query(msg) | StoreError::DescriptorOutOfRange(msg) => {
                TransferError::CatalogLogic(msg)
            }
            StoreError::AlreadyExists(path) => {
                TransferError::CatalogLogic(format!("already exists: {}", path))
            }
            StoreError::ChecksumMismatch {
                path,
                expected,
                actual,
            } => TransferError::Checksum {
                path,
                local: expected,
                remote: actual,
            },
            StoreError::Io(e) => TransferError::Io(e),
            StoreError::Other(msg) => TransferError::CatalogLogic(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_translate() {
        let e: TransferError = StoreError::AuthenticationFailed("bad password".into()).into();
        assert!(matches!(e, TransferError::Connection(_)));

        let e: TransferError = StoreError::Transport("reset by peer".into()).into();
        assert!(matches!(e, TransferError::Network(_)));

        let e: TransferError = StoreError::UnknownCollection("/zone/missing".into()).into();
        assert!(matches!(e, TransferError::FileNotFound(ref p) if p == "/zone/missing"));

        let e: TransferError = StoreError::Query("bad sql".into()).into();
        assert!(matches!(e, TransferError::CatalogLogic(_)));
    }

    #[test]
    fn test_checksum_message_names_both_digests() {
        let e = TransferError::Checksum {
            path: "/zone/a.bin".into(),
            local: "abc".into(),
            remote: "def".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("local='abc'"));
        assert!(msg.contains("catalog='def'"));
        assert!(e.is_checksum());
    }
}
