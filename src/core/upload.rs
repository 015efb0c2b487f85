//! 上传流水线
//!
//! 每个文件：登记 -> 计算校验和并删除旧对象（计算池）-> 分块并行写入（传输池）
//! -> 最后一个分块任务提交（put + 校验和验证，必要时更新副本）-> 完成或失败。

use crate::config::TransferConfig;
use crate::core::checksum::{read_full, stream_digest, HashAlgorithm};
use crate::core::chunk::{plan_chunks, Chunk, ObjectTransferGroup};
use crate::core::executor::{TaskOutcome, TransferCoordinator, WorkerContext};
use crate::core::progress::ProgressSink;
use crate::core::scanner::{local_files_stats, local_key, BatchStats};
use crate::core::status::{record_failure, CancelFn, OperationStatus, StatusRegistry};
use crate::error::TransferError;
use crate::remote::path::join;
use crate::remote::{LockedSession, OpenMode, OperationType, StoreOptions};
use futures::future::{BoxFuture, FutureExt};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 单个文件的上传任务
struct UploadJob {
    local: PathBuf,
    /// 状态键和进度事件使用的本地路径字符串
    key: String,
    remote: String,
    file_size: u64,
    status: Arc<dyn OperationStatus>,
    options: StoreOptions,
    failed: AtomicBool,
    parallelism: usize,
    block_size: u64,
    local_checksum: bool,
}

/// 分块写入使用的远程选项
fn upload_options(config: &TransferConfig) -> StoreOptions {
    StoreOptions {
        all_replicas: config.replicate,
        update_replicas: config.replicate,
        ..StoreOptions::default()
    }
    .with_resource(config.default_resource.clone())
}

/// 取消回调：删除未完成的远程对象
pub fn remove_remote_object_callback(session: LockedSession) -> CancelFn {
    Arc::new(move |element: &str| match session.unlink_if_exists(element, true) {
        Ok(true) => info!("已删除未完成的远程对象: {}", element),
        Ok(false) => {}
        Err(e) => warn!("删除远程对象失败 {}: {}", element, e),
    })
}

/// 登记一批本地文件，预期进度按校验倍数放大
pub fn register_files(
    registry: &dyn StatusRegistry,
    session: &LockedSession,
    keys: &[String],
    stats: &BatchStats,
    checksum_factor: u64,
) {
    registry.update_list(
        keys,
        &stats.scaled(checksum_factor),
        &stats.per_path,
        Some(remove_remote_object_callback(session.clone())),
    );
}

/// 上传一批已登记的本地文件到远程集合 `remote_dir`
pub async fn upload_files(
    coordinator: &mut TransferCoordinator,
    config: &TransferConfig,
    registry: &dyn StatusRegistry,
    sink: &mut ProgressSink,
    files: &[PathBuf],
    remote_dir: &str,
) {
    for file in files {
        if coordinator.is_interrupted() {
            debug!("上传已中断，停止提交");
            break;
        }

        let key = local_key(file);
        let Some(status) = registry.get(&key) else {
            warn!("文件未登记，跳过: {}", key);
            continue;
        };
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            status.fail(TransferError::FileNotFound(key));
            continue;
        };

        let remote = join(remote_dir, &name);
        status.in_progress(Some(remote.as_str()));

        let job = Arc::new(UploadJob {
            local: file.clone(),
            key,
            remote,
            file_size: status.file_size(),
            status,
            options: upload_options(config),
            failed: AtomicBool::new(false),
            parallelism: config.parallelism,
            block_size: config.block_size,
            local_checksum: config.local_checksum,
        });
        submit_upload(coordinator.context(), job);

        let drained = coordinator.drain_progress(registry);
        sink.advance(drained).await;
    }
}

/// 在计算池上准备上传：校验和、删除旧对象、提交分块
fn submit_upload(ctx: &WorkerContext, job: Arc<UploadJob>) {
    debug!("提交上传准备: {} -> {}", job.key, job.remote);
    let done_job = job.clone();
    ctx.submit_compute(
        move |ctx| prepare_upload(ctx, job),
        move |_, outcome| {
            if let TaskOutcome::Failed(e) = outcome {
                error!("上传准备失败 {}: {}", done_job.key, e);
                done_job.status.fail(e);
            }
        },
    );
}

fn prepare_upload(ctx: &WorkerContext, job: Arc<UploadJob>) -> Result<(), TransferError> {
    let mut checksum = None;
    if job.local_checksum {
        let algorithm = HashAlgorithm::from_scheme(ctx.session().default_hash_scheme());
        for step in stream_digest(&job.local, algorithm, job.block_size)? {
            if ctx.is_interrupted() {
                return Ok(());
            }
            let step = step?;
            if step.bytes_read > 0 {
                ctx.post_progress(&job.key, Some(step.bytes_read));
            }
            if step.digest.is_some() {
                checksum = step.digest;
            }
        }
    }

    if ctx.is_interrupted() {
        return Ok(());
    }
    // 并行覆盖已有对象不可靠，先删除
    if ctx.session().unlink_if_exists(&job.remote, true)? {
        debug!("已删除旧的远程对象: {}", job.remote);
    }

    if ctx.is_interrupted() {
        return Ok(());
    }

    let chunks = plan_chunks(job.file_size, job.parallelism, job.block_size);
    if chunks.is_empty() {
        // 空文件没有分块任务，直接提交创建空对象
        return finalize_upload(ctx, &job, checksum);
    }

    let group = Arc::new(ObjectTransferGroup::new(chunks.len()));
    let checksum = Arc::new(checksum);
    for chunk in chunks {
        let worker_job = job.clone();
        let done_job = job.clone();
        let group = group.clone();
        let checksum = checksum.clone();
        ctx.submit_transfer(
            move |ctx| write_chunk(ctx, &worker_job, chunk),
            move |ctx, outcome| {
                on_chunk_complete(ctx, &done_job, &group, (*checksum).clone(), outcome)
            },
        );
    }
    Ok(())
}

/// 把本地文件的一个分块写入远程对象
fn write_chunk(ctx: &WorkerContext, job: &UploadJob, chunk: Chunk) -> Result<(), TransferError> {
    let mut file = File::open(&job.local)?;
    let mut remote = ctx
        .session()
        .open(&job.remote, OpenMode::Append, &job.options)?;

    file.seek(SeekFrom::Start(chunk.offset))?;
    remote.seek(chunk.offset)?;

    let block_size = job.block_size.min(chunk.length) as usize;
    let mut buffer = vec![0u8; block_size];
    let mut remaining = chunk.length;

    while remaining > 0 {
        if ctx.is_interrupted() {
            break;
        }

        let want = (remaining as usize).min(block_size);
        let n = read_full(&mut file, &mut buffer[..want])?;
        if n != want {
            return Err(TransferError::ShortRead {
                path: job.key.clone(),
                expected: want,
                actual: n,
            });
        }

        remote.write(&buffer[..n])?;
        remaining -= n as u64;
        ctx.post_progress(&job.key, Some(n as u64));
    }

    remote.close()?;
    Ok(())
}

fn on_chunk_complete(
    ctx: &WorkerContext,
    job: &UploadJob,
    group: &ObjectTransferGroup,
    checksum: Option<String>,
    outcome: TaskOutcome<()>,
) {
    match outcome {
        TaskOutcome::Cancelled => return,
        TaskOutcome::Failed(e) => {
            error!("上传分块失败 {}: {}", job.key, e);
            job.failed.store(true, Ordering::SeqCst);
            job.status.fail(e);
        }
        TaskOutcome::Completed(()) => {}
    }

    if !group.finish_one() || job.failed.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = finalize_upload(ctx, job, checksum) {
        error!("上传提交失败 {}: {}", job.key, e);
        job.status.fail(e);
    }
}

/// 提交上传：以 put 操作重新打开对象触发服务端后处理，并验证校验和
fn finalize_upload(
    ctx: &WorkerContext,
    job: &UploadJob,
    checksum: Option<String>,
) -> Result<(), TransferError> {
    if ctx.is_interrupted() {
        return Ok(());
    }
    debug!("提交上传 {} (校验和 {:?})", job.remote, checksum);

    let mut options = job
        .options
        .clone()
        .with_operation(OperationType::Put)
        .with_verify_checksum(checksum);
    ctx.session()
        .open(&job.remote, OpenMode::Append, &options)?
        .close()?;

    if options.all_replicas {
        if ctx.is_interrupted() {
            return Ok(());
        }
        options.update_replicas = true;
        ctx.session().replicate(&job.remote, &options)?;
    }

    if ctx.is_interrupted() {
        return Ok(());
    }
    ctx.post_progress(&job.key, None);
    Ok(())
}

/// 深度优先上传本地目录到远程集合 `remote_collection`
///
/// 先创建集合（已存在不算错误），登记本目录的文件，再递归子目录，最后上传本目录的文件。
/// 目录无法处理时登记为失败（键为本地目录路径），同级目录继续上传。
pub fn upload_dir<'a>(
    coordinator: &'a mut TransferCoordinator,
    config: &'a TransferConfig,
    registry: &'a dyn StatusRegistry,
    sink: &'a mut ProgressSink,
    local_dir: PathBuf,
    remote_collection: String,
) -> BoxFuture<'a, ()> {
    async move {
        if coordinator.is_interrupted() {
            return;
        }

        let (files, subdirs, stats) =
            match scan_local_dir(coordinator.session(), &local_dir, &remote_collection).await {
                Ok(scanned) => scanned,
                Err(e) => {
                    error!("上传目录 {:?} 失败: {}", local_dir, e);
                    record_failure(registry, &local_key(&local_dir), e);
                    return;
                }
            };

        let keys: Vec<String> = files.iter().map(|f| local_key(f)).collect();
        registry.add_keys(&keys);
        register_files(
            registry,
            coordinator.session(),
            &keys,
            &stats,
            config.checksum_factor(),
        );

        for (subdir, name) in subdirs {
            let collection = join(&remote_collection, &name);
            upload_dir(coordinator, config, registry, sink, subdir, collection).await;
        }

        upload_files(coordinator, config, registry, sink, &files, &remote_collection).await;
    }
    .boxed()
}

/// 创建远程集合并统计本地目录的直接子项
async fn scan_local_dir(
    session: &LockedSession,
    local_dir: &Path,
    remote_collection: &str,
) -> Result<(Vec<PathBuf>, Vec<(PathBuf, String)>, BatchStats), TransferError> {
    let created = {
        let collection = remote_collection.to_string();
        session
            .blocking(move |s| s.create_collection_if_missing(&collection))
            .await?
    };
    debug!("上传目录 {:?} -> {} (新建集合: {})", local_dir, remote_collection, created);

    let (files, subdirs) = list_local_dir(local_dir).await?;
    let stats = {
        let files = files.clone();
        tokio::task::spawn_blocking(move || local_files_stats(&files))
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))??
    };
    Ok((files, subdirs, stats))
}

/// 列出目录的直接子项：(文件, [(子目录, 名称)])，按名称排序
async fn list_local_dir(dir: &Path) -> Result<(Vec<PathBuf>, Vec<(PathBuf, String)>), TransferError> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            subdirs.push((path, name));
        } else {
            files.push(path);
        }
    }

    files.sort();
    subdirs.sort();
    Ok((files, subdirs))
}
