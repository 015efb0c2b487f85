//! 传输状态跟踪
//!
//! 每个路径一个 [`OperationStatus`]，一批路径由 [`StatusRegistry`] 管理。
//! 宿主程序可以自行实现这两个 trait；[`StatusBoard`] 是内存实现。

use crate::error::TransferError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

/// 取消回调，参数为状态的 `current_element`
pub type CancelFn = Arc<dyn Fn(&str) + Send + Sync>;

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Pending => write!(f, "pending"),
            OperationState::InProgress => write!(f, "in_progress"),
            OperationState::Done => write!(f, "done"),
            OperationState::Failed => write!(f, "failed"),
            OperationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationState::Done | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// 单个路径的操作状态，所有方法可在任意线程调用
pub trait OperationStatus: Send + Sync {
    /// 标记开始，`current_element` 为当前处理的目标（本地文件或远程对象）
    fn in_progress(&self, current_element: Option<&str>);
    fn done(&self);
    fn fail(&self, error: TransferError);
    fn state(&self) -> OperationState;
    fn add_progress(&self, delta: u64);
    fn progress(&self) -> u64;
    /// 预期进度总量（开启校验时为文件大小的两倍）
    fn size(&self) -> u64;
    fn set_size(&self, size: u64);
    fn file_size(&self) -> u64;
    fn current_element(&self) -> Option<String>;
    fn error(&self) -> Option<Arc<TransferError>>;
}

/// 一批路径的状态集合
pub trait StatusRegistry: Send + Sync {
    /// 登记一批路径，已有的条目被替换
    fn update_list(
        &self,
        paths: &[String],
        sizes: &HashMap<String, u64>,
        file_sizes: &HashMap<String, u64>,
        cancel: Option<CancelFn>,
    );

    /// 补充登记路径，已有的条目保持不变
    fn add_keys(&self, paths: &[String]);

    fn get(&self, path: &str) -> Option<Arc<dyn OperationStatus>>;
}

/// 把无法处理的路径（集合或目录）登记为失败，批次继续处理其他路径
pub fn record_failure(registry: &dyn StatusRegistry, path: &str, err: TransferError) {
    registry.add_keys(&[path.to_string()]);
    match registry.get(path) {
        Some(status) => {
            status.in_progress(None);
            status.fail(err);
        }
        None => error!("无法登记失败路径 {}: {}", path, err),
    }
}

#[derive(Debug, Clone)]
struct StatusInner {
    state: OperationState,
    progress: u64,
    size: u64,
    file_size: u64,
    current_element: Option<String>,
    error: Option<Arc<TransferError>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// [`OperationStatus`] 的内存实现
pub struct PathStatus {
    path: String,
    inner: Mutex<StatusInner>,
    cancel: Option<CancelFn>,
}

impl PathStatus {
    pub fn new(path: &str, size: u64, file_size: u64, cancel: Option<CancelFn>) -> Self {
        Self {
            path: path.to_string(),
            inner: Mutex::new(StatusInner {
                state: OperationState::Pending,
                progress: 0,
                size,
                file_size,
                current_element: None,
                error: None,
                started_at: None,
                finished_at: None,
            }),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    /// 取消正在进行的操作并调用取消回调；返回是否确实取消了
    pub fn cancel(&self) -> bool {
        let element = {
            let mut inner = self.lock();
            if inner.state != OperationState::InProgress {
                return false;
            }
            inner.state = OperationState::Cancelled;
            inner.finished_at = Some(Utc::now());
            inner.current_element.clone()
        };

        if let (Some(cancel), Some(element)) = (&self.cancel, element) {
            debug!("执行取消回调: {} -> {}", self.path, element);
            cancel(&element);
        }
        true
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            path: self.path.clone(),
            state: inner.state,
            progress: inner.progress,
            size: inner.size,
            file_size: inner.file_size,
            current_element: inner.current_element.clone(),
            error: inner.error.as_ref().map(|e| e.to_string()),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }
}

impl OperationStatus for PathStatus {
    fn in_progress(&self, current_element: Option<&str>) {
        let mut inner = self.lock();
        inner.state = OperationState::InProgress;
        inner.current_element = current_element.map(str::to_string);
        inner.started_at = Some(Utc::now());
    }

    fn done(&self) {
        let mut inner = self.lock();
        inner.state = OperationState::Done;
        inner.finished_at = Some(Utc::now());
    }

    fn fail(&self, error: TransferError) {
        warn!("{} 失败: {}", self.path, error);
        let mut inner = self.lock();
        inner.state = OperationState::Failed;
        inner.error = Some(Arc::new(error));
        inner.finished_at = Some(Utc::now());
    }

    fn state(&self) -> OperationState {
        self.lock().state
    }

    fn add_progress(&self, delta: u64) {
        self.lock().progress += delta;
    }

    fn progress(&self) -> u64 {
        self.lock().progress
    }

    fn size(&self) -> u64 {
        self.lock().size
    }

    fn set_size(&self, size: u64) {
        self.lock().size = size;
    }

    fn file_size(&self) -> u64 {
        self.lock().file_size
    }

    fn current_element(&self) -> Option<String> {
        self.lock().current_element.clone()
    }

    fn error(&self) -> Option<Arc<TransferError>> {
        self.lock().error.clone()
    }
}

/// 状态快照（用于展示或序列化给前端）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub path: String,
    pub state: OperationState,
    pub progress: u64,
    pub size: u64,
    pub file_size: u64,
    pub current_element: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// [`StatusRegistry`] 的内存实现
#[derive(Default)]
pub struct StatusBoard {
    entries: RwLock<HashMap<String, Arc<PathStatus>>>,
    order: RwLock<Vec<String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, path: &str) -> Option<Arc<PathStatus>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, status: PathStatus, replace: bool) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = status.path.clone();
        if entries.contains_key(&path) {
            if replace {
                entries.insert(path, Arc::new(status));
            }
            return;
        }
        entries.insert(path.clone(), Arc::new(status));
        self.order
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(path);
    }

    /// 按登记顺序返回所有状态
    pub fn snapshot(&self) -> Vec<StatusSnapshot> {
        let order = self
            .order
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        order
            .iter()
            .filter_map(|path| self.status(path))
            .map(|s| s.snapshot())
            .collect()
    }

    /// 取消所有进行中的操作，返回取消的数量
    pub fn cancel_all(&self) -> usize {
        let statuses: Vec<Arc<PathStatus>> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        // 回调可能访问文件系统，不在持锁期间调用
        statuses.iter().filter(|s| s.cancel()).count()
    }

    /// 统计各状态的数量
    pub fn count_by_state(&self) -> HashMap<OperationState, usize> {
        let mut counts = HashMap::new();
        for status in self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
        {
            *counts.entry(status.state()).or_insert(0) += 1;
        }
        counts
    }
}

impl StatusRegistry for StatusBoard {
    fn update_list(
        &self,
        paths: &[String],
        sizes: &HashMap<String, u64>,
        file_sizes: &HashMap<String, u64>,
        cancel: Option<CancelFn>,
    ) {
        for path in paths {
            let file_size = file_sizes.get(path).copied().unwrap_or(0);
            let size = sizes.get(path).copied().unwrap_or(file_size);
            self.insert(PathStatus::new(path, size, file_size, cancel.clone()), true);
        }
    }

    fn add_keys(&self, paths: &[String]) {
        for path in paths {
            self.insert(PathStatus::new(path, 0, 0, None), false);
        }
    }

    fn get(&self, path: &str) -> Option<Arc<dyn OperationStatus>> {
        self.status(path).map(|s| s as Arc<dyn OperationStatus>)
    }
}
