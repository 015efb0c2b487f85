//! 进度事件与批次进度汇报

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// 工作线程发出的进度事件
///
/// `delta` 为 `None` 表示该路径的终止事件（传输和校验都已完成）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub path: String,
    pub delta: Option<u64>,
}

/// 发给调用方的批次进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub completed: u64,
    pub total: u64,
}

/// 批次进度累加器，把增量换算成 (已完成, 总量) 发给调用方
pub struct ProgressSink {
    tx: Option<mpsc::Sender<TransferProgress>>,
    completed: u64,
    total: u64,
}

impl ProgressSink {
    pub fn new(tx: Option<mpsc::Sender<TransferProgress>>, total: u64) -> Self {
        Self {
            tx,
            completed: 0,
            total,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 发送起始进度 (0, 总量)
    pub async fn start(&mut self) {
        self.send().await;
    }

    pub async fn advance(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.completed += delta;
        self.send().await;
    }

    /// 直接设置已完成量（删除等按条目计数的操作）
    pub async fn set(&mut self, completed: u64) {
        self.completed = completed;
        self.send().await;
    }

    async fn send(&self) {
        if let Some(tx) = &self.tx {
            let progress = TransferProgress {
                completed: self.completed,
                total: self.total,
            };
            if tx.send(progress).await.is_err() {
                debug!("进度接收端已关闭");
            }
        }
    }
}
