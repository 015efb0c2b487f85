//! 传输引擎：批次级入口
//!
//! 每次调用处理一批路径：统计、登记状态、创建调度器、提交任务、
//! 等待结束并转发进度，最后记录耗时和吞吐量。

use crate::config::TransferConfig;
use crate::core::download::{download_collection, download_objects, register_objects};
use crate::core::executor::TransferCoordinator;
use crate::core::progress::{ProgressSink, TransferProgress};
use crate::core::remove::{remove_tree, RemoveTree};
use crate::core::scanner::{
    local_files_stats, local_key, local_trees_stats, remote_files_stats, remote_trees_stats,
    BatchStats,
};
use crate::core::status::{record_failure, OperationStatus, StatusRegistry};
use crate::core::upload::{register_files, upload_dir, upload_files};
use crate::error::TransferError;
use crate::remote::path::join;
use crate::remote::{LockedSession, RemoteStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 批次报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub batch_id: String,
    pub files: usize,
    /// 文件总字节数
    pub file_bytes: u64,
    /// 预期进度总量（含校验）
    pub bytes_total: u64,
    pub bytes_completed: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// 传输引擎，一个会话一个
pub struct TransferEngine {
    session: LockedSession,
    config: TransferConfig,
    cancelled: Arc<AtomicBool>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn RemoteStore>, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        info!(
            "创建传输引擎: {} (并发 {}, 块大小 {})",
            store.name(),
            config.parallelism,
            config.block_size
        );
        Ok(Self {
            session: LockedSession::new(store),
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn session(&self) -> &LockedSession {
        &self.session
    }

    /// 取消当前批次
    pub fn cancel(&self) {
        info!("收到取消请求");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 取消标志，可交给其他任务在批次运行期间取消
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn checksum_factor(&self) -> u64 {
        self.config.checksum_factor()
    }

    fn coordinator(&self) -> Result<TransferCoordinator, TransferError> {
        TransferCoordinator::new(
            self.session.clone(),
            self.cancelled.clone(),
            self.config.parallelism,
            self.config.compute_threads,
        )
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// 新批次开始时清除上一批次的取消，之后到达的取消一直有效
    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// 统计完成后创建进度汇报
    async fn begin(
        &self,
        stats: &BatchStats,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> ProgressSink {
        if self.is_cancelled() {
            info!("批次在统计阶段已被取消，不再提交任务");
        }

        let total = stats.expected_bytes(self.checksum_factor());
        let mut sink = ProgressSink::new(progress_tx, total);
        // 多个文件或一个大文件时才唤醒进度显示
        if stats.file_count > 1 || total > self.config.block_size {
            sink.start().await;
        }
        sink
    }

    /// 等待所有任务结束、关闭调度器并生成报告
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        operation: &str,
        batch_id: Uuid,
        mut coordinator: TransferCoordinator,
        registry: &dyn StatusRegistry,
        mut sink: ProgressSink,
        stats: &BatchStats,
        start: Instant,
    ) -> TransferReport {
        coordinator
            .wait_progress(self.poll_interval(), registry, &mut sink)
            .await;
        let cancelled = self.is_cancelled();
        coordinator.close().await;

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            info!(
                "{} 完成，耗时 {:.2} 秒 ({:.2} MB/s)",
                operation,
                secs,
                stats.total_bytes as f64 / (secs * 1_000_000.0)
            );
        }
        if cancelled {
            warn!("{} 已取消", operation);
        }

        TransferReport {
            batch_id: batch_id.to_string(),
            files: stats.file_count,
            file_bytes: stats.total_bytes,
            bytes_total: sink.total(),
            bytes_completed: sink.completed(),
            elapsed,
            cancelled,
        }
    }

    /// 下载远程对象到本地目录
    pub async fn download_files(
        &self,
        paths: &[String],
        local_dir: &Path,
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        self.reset_cancel();
        let batch_id = Uuid::new_v4();
        let span = info_span!("download_files", batch = %batch_id);
        async {
            let start = Instant::now();
            info!("开始下载 {} 个对象到 {:?}", paths.len(), local_dir);

            let stats = {
                let paths = paths.to_vec();
                self.session
                    .blocking(move |s| remote_files_stats(s, &paths))
                    .await?
            };
            register_objects(registry, paths, &stats, self.checksum_factor());
            tokio::fs::create_dir_all(local_dir).await?;

            let mut sink = self.begin(&stats, progress_tx).await;
            let mut coordinator = self.coordinator()?;
            download_objects(
                &mut coordinator,
                &self.config,
                registry,
                &mut sink,
                &stats,
                paths,
                local_dir,
            )
            .await;

            Ok(self
                .finish("download_files", batch_id, coordinator, registry, sink, &stats, start)
                .await)
        }
        .instrument(span)
        .await
    }

    /// 下载远程集合树到本地目录
    pub async fn download_directories(
        &self,
        collections: &[String],
        local_dir: &Path,
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        self.reset_cancel();
        let batch_id = Uuid::new_v4();
        let span = info_span!("download_directories", batch = %batch_id);
        async {
            let start = Instant::now();
            info!("开始下载 {} 个集合到 {:?}", collections.len(), local_dir);

            let stats = {
                let collections = collections.to_vec();
                self.session
                    .blocking(move |s| remote_trees_stats(s, &collections))
                    .await?
            };

            let mut sink = self.begin(&stats, progress_tx).await;
            let mut coordinator = self.coordinator()?;
            for collection in collections {
                if self.is_cancelled() {
                    break;
                }
                download_collection(
                    &mut coordinator,
                    &self.config,
                    registry,
                    &mut sink,
                    collection.clone(),
                    local_dir.to_path_buf(),
                )
                .await;
            }

            Ok(self
                .finish(
                    "download_directories",
                    batch_id,
                    coordinator,
                    registry,
                    sink,
                    &stats,
                    start,
                )
                .await)
        }
        .instrument(span)
        .await
    }

    /// 上传本地文件到远程集合
    pub async fn upload_files(
        &self,
        files: &[PathBuf],
        remote_dir: &str,
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        self.reset_cancel();
        let batch_id = Uuid::new_v4();
        let span = info_span!("upload_files", batch = %batch_id);
        async {
            let start = Instant::now();
            info!("开始上传 {} 个文件到 {}", files.len(), remote_dir);

            let stats = {
                let files = files.to_vec();
                tokio::task::spawn_blocking(move || local_files_stats(&files))
                    .await
                    .map_err(|e| TransferError::Worker(e.to_string()))??
            };
            let keys: Vec<String> = files.iter().map(|f| local_key(f)).collect();
            register_files(registry, &self.session, &keys, &stats, self.checksum_factor());

            let mut sink = self.begin(&stats, progress_tx).await;
            let mut coordinator = self.coordinator()?;
            upload_files(
                &mut coordinator,
                &self.config,
                registry,
                &mut sink,
                files,
                remote_dir,
            )
            .await;

            Ok(self
                .finish("upload_files", batch_id, coordinator, registry, sink, &stats, start)
                .await)
        }
        .instrument(span)
        .await
    }

    /// 上传本地目录树到远程集合，每个目录对应 `remote_dir/<目录名>`
    pub async fn upload_directories(
        &self,
        dirs: &[PathBuf],
        remote_dir: &str,
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        self.reset_cancel();
        let batch_id = Uuid::new_v4();
        let span = info_span!("upload_directories", batch = %batch_id);
        async {
            let start = Instant::now();
            info!("开始上传 {} 个目录到 {}", dirs.len(), remote_dir);

            let stats = {
                let dirs = dirs.to_vec();
                tokio::task::spawn_blocking(move || local_trees_stats(&dirs))
                    .await
                    .map_err(|e| TransferError::Worker(e.to_string()))??
            };

            let mut sink = self.begin(&stats, progress_tx).await;
            let mut coordinator = self.coordinator()?;
            for dir in dirs {
                if self.is_cancelled() {
                    break;
                }
                let Some(name) = dir.file_name() else {
                    warn!("无法确定目录名，跳过: {:?}", dir);
                    let key = local_key(dir);
                    record_failure(registry, &key, TransferError::FileNotFound(key.clone()));
                    continue;
                };
                let collection = join(remote_dir, &name.to_string_lossy());
                upload_dir(
                    &mut coordinator,
                    &self.config,
                    registry,
                    &mut sink,
                    dir.clone(),
                    collection,
                )
                .await;
            }

            Ok(self
                .finish(
                    "upload_directories",
                    batch_id,
                    coordinator,
                    registry,
                    sink,
                    &stats,
                    start,
                )
                .await)
        }
        .instrument(span)
        .await
    }

    /// 删除远程对象，进度按条目计数
    pub async fn delete_files(
        &self,
        paths: &[String],
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        let start = Instant::now();
        self.reset_cancel();
        registry.add_keys(paths);

        let mut sink = ProgressSink::new(progress_tx, paths.len() as u64);
        for (i, path) in paths.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }
            let Some(status) = registry.get(path) else {
                continue;
            };
            status.set_size(1);
            status.in_progress(None);

            let target = path.clone();
            match self
                .session
                .blocking(move |s| s.unlink(&target, true))
                .await
            {
                Ok(()) => {
                    status.add_progress(1);
                    status.done();
                }
                Err(e) => {
                    error!("删除 {} 失败: {}", path, e);
                    status.fail(e);
                }
            }
            sink.set(i as u64 + 1).await;
        }

        Ok(self.entry_report("delete_files", paths.len(), sink, start))
    }

    /// 递归删除远程集合，每次状态往返之间检查取消
    pub async fn delete_directories(
        &self,
        collections: &[String],
        registry: &dyn StatusRegistry,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<TransferReport, TransferError> {
        let start = Instant::now();
        self.reset_cancel();
        registry.add_keys(collections);

        let mut sink = ProgressSink::new(progress_tx, collections.len() as u64);
        for (i, collection) in collections.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }
            let Some(status) = registry.get(collection) else {
                continue;
            };
            status.set_size(1);
            status.in_progress(None);

            let target = collection.clone();
            match self
                .session
                .blocking(move |s| remove_tree(s, &target, true, true))
                .await
            {
                Ok(tree) => self.drive_removal(tree, status.as_ref()).await,
                Err(e) => {
                    error!("删除集合 {} 失败: {}", collection, e);
                    status.fail(e);
                }
            }
            sink.set(i as u64 + 1).await;
        }

        Ok(self.entry_report("delete_directories", collections.len(), sink, start))
    }

    /// 逐次推进删除流，取消时放弃
    async fn drive_removal(
        &self,
        mut tree: RemoveTree,
        status: &dyn OperationStatus,
    ) {
        loop {
            if self.is_cancelled() {
                debug!("删除 {} 被取消", tree.path());
                tree.abandon();
                return;
            }

            let step = tokio::task::spawn_blocking(move || {
                let item = tree.next();
                (tree, item)
            })
            .await;

            let (returned, item) = match step {
                Ok(step) => step,
                Err(e) => {
                    status.fail(TransferError::Worker(e.to_string()));
                    return;
                }
            };
            tree = returned;

            match item {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    error!("删除集合 {} 失败: {}", tree.path(), e);
                    status.fail(e);
                    return;
                }
                None => {
                    status.add_progress(1);
                    status.done();
                    return;
                }
            }
        }
    }

    fn entry_report(
        &self,
        operation: &str,
        count: usize,
        sink: ProgressSink,
        start: Instant,
    ) -> TransferReport {
        let elapsed = start.elapsed();
        info!("{} 完成: {} 项, 耗时 {:.2} 秒", operation, count, elapsed.as_secs_f64());
        TransferReport {
            batch_id: Uuid::new_v4().to_string(),
            files: count,
            file_bytes: 0,
            bytes_total: sink.total(),
            bytes_completed: sink.completed(),
            elapsed,
            cancelled: self.is_cancelled(),
        }
    }

    /// 创建远程集合
    pub async fn mkdir(&self, path: &str) -> Result<(), TransferError> {
        let path = path.to_string();
        self.session
            .blocking(move |s| s.create_collection(&path))
            .await
    }
}
