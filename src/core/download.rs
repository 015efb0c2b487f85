//! 下载流水线
//!
//! 每个对象：登记 -> 传输中（分块并行读取）-> 校验 -> 完成或失败。
//! 分块任务全部结束后，最后一个任务提交校验任务（或直接发出终止事件）。

use crate::config::TransferConfig;
use crate::core::checksum::{stream_digest, HashAlgorithm};
use crate::core::chunk::{plan_chunks, Chunk, ObjectTransferGroup};
use crate::core::executor::{TaskOutcome, TransferCoordinator, WorkerContext};
use crate::core::progress::ProgressSink;
use crate::core::scanner::{local_key, BatchStats};
use crate::core::status::{record_failure, CancelFn, OperationStatus, StatusRegistry};
use crate::error::TransferError;
use crate::remote::path::basename;
use crate::remote::{OpenMode, RemoteHandle, StoreOptions};
use futures::future::{BoxFuture, FutureExt};
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 单个对象的下载任务，由该对象的所有分块任务共享
struct DownloadJob {
    remote: String,
    local: PathBuf,
    status: Arc<dyn OperationStatus>,
    group: ObjectTransferGroup,
    /// 任一分块失败后不再校验
    failed: AtomicBool,
    block_size: u64,
    local_checksum: bool,
    strict_checksum: bool,
}

/// 取消回调：删除未完成的本地文件
pub fn remove_local_file_callback() -> CancelFn {
    Arc::new(|element: &str| match std::fs::remove_file(element) {
        Ok(()) => info!("已删除未完成的本地文件: {}", element),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除本地文件失败 {}: {}", element, e),
    })
}

/// 登记一批远程对象，预期进度按校验倍数放大
pub fn register_objects(
    registry: &dyn StatusRegistry,
    paths: &[String],
    stats: &BatchStats,
    checksum_factor: u64,
) {
    registry.update_list(
        paths,
        &stats.scaled(checksum_factor),
        &stats.per_path,
        Some(remove_local_file_callback()),
    );
}

/// 下载一批已登记的对象到 `local_dir`
///
/// 单个对象的失败记录在它的状态上，不影响其他对象。
pub async fn download_objects(
    coordinator: &mut TransferCoordinator,
    config: &TransferConfig,
    registry: &dyn StatusRegistry,
    sink: &mut ProgressSink,
    stats: &BatchStats,
    paths: &[String],
    local_dir: &Path,
) {
    for path in paths {
        if coordinator.is_interrupted() {
            debug!("下载已中断，停止提交");
            break;
        }

        let Some(status) = registry.get(path) else {
            warn!("对象未登记，跳过: {}", path);
            continue;
        };

        let local = local_dir.join(basename(path));
        let Some(&size) = stats.per_path.get(path) else {
            status.in_progress(None);
            status.fail(TransferError::FileNotFound(path.clone()));
            continue;
        };

        status.in_progress(Some(local_key(&local).as_str()));
        if let Err(e) =
            submit_object_download(coordinator.context(), config, status.clone(), path, size, local)
                .await
        {
            error!("下载 {} 失败: {}", path, e);
            status.fail(e);
        }

        // 转发已经完成的任务的进度
        let drained = coordinator.drain_progress(registry);
        sink.advance(drained).await;
    }
}

async fn submit_object_download(
    ctx: &WorkerContext,
    config: &TransferConfig,
    status: Arc<dyn OperationStatus>,
    remote: &str,
    size: u64,
    local: PathBuf,
) -> Result<(), TransferError> {
    match tokio::fs::remove_file(&local).await {
        Ok(()) => debug!("已删除旧的本地文件: {:?}", local),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let chunks = plan_chunks(size, config.parallelism, config.block_size);
    let job = Arc::new(DownloadJob {
        remote: remote.to_string(),
        local,
        status,
        group: ObjectTransferGroup::new(chunks.len()),
        failed: AtomicBool::new(false),
        block_size: config.block_size,
        local_checksum: config.local_checksum,
        strict_checksum: config.strict_checksum,
    });

    if chunks.is_empty() {
        // 空对象不分块，直接创建空文件
        tokio::fs::File::create(&job.local).await?;
        finish_download(ctx, &job);
        return Ok(());
    }

    debug!("提交下载 {}: {} 字节, {} 个分块", remote, size, chunks.len());
    for chunk in chunks {
        let worker_job = job.clone();
        let done_job = job.clone();
        ctx.submit_transfer(
            move |ctx| read_chunk(ctx, &worker_job, chunk),
            move |ctx, outcome| on_chunk_complete(ctx, &done_job, outcome),
        );
    }
    Ok(())
}

/// 读取一个分块写入本地文件
fn read_chunk(ctx: &WorkerContext, job: &DownloadJob, chunk: Chunk) -> Result<(), TransferError> {
    let mut remote = ctx
        .session()
        .open(&job.remote, OpenMode::Read, &StoreOptions::forced())?;
    // 分块任务各自打开本地文件，文件在第一个任务到达时创建
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&job.local)?;

    remote.seek(chunk.offset)?;
    file.seek(SeekFrom::Start(chunk.offset))?;

    let block_size = job.block_size.min(chunk.length) as usize;
    let mut buffer = vec![0u8; block_size];
    let mut remaining = chunk.length;

    while remaining > 0 {
        if ctx.is_interrupted() {
            break;
        }

        let want = (remaining as usize).min(block_size);
        let n = read_remote(remote.as_mut(), &mut buffer[..want])?;
        if n != want {
            return Err(TransferError::ShortRead {
                path: job.remote.clone(),
                expected: want,
                actual: n,
            });
        }

        file.write_all(&buffer[..n])?;
        remaining -= n as u64;
        ctx.post_progress(&job.remote, Some(n as u64));
    }

    remote.close()?;
    Ok(())
}

/// 读满缓冲区，远程对象提前结束时返回实际长度
fn read_remote(handle: &mut dyn RemoteHandle, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = handle.read_into(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn on_chunk_complete(ctx: &WorkerContext, job: &Arc<DownloadJob>, outcome: TaskOutcome<()>) {
    match outcome {
        TaskOutcome::Cancelled => return,
        TaskOutcome::Failed(e) => {
            error!("下载分块失败 {}: {}", job.remote, e);
            job.failed.store(true, Ordering::SeqCst);
            job.status.fail(e);
        }
        TaskOutcome::Completed(()) => {}
    }

    if !job.group.finish_one() {
        return;
    }
    if ctx.is_interrupted() || job.failed.load(Ordering::SeqCst) {
        return;
    }
    finish_download(ctx, job);
}

/// 所有分块完成：校验或直接结束
fn finish_download(ctx: &WorkerContext, job: &Arc<DownloadJob>) {
    if !job.local_checksum {
        ctx.post_progress(&job.remote, None);
        return;
    }

    let worker_job = job.clone();
    let done_job = job.clone();
    ctx.submit_compute(
        move |ctx| verify_download(ctx, &worker_job),
        move |ctx, outcome| match outcome {
            TaskOutcome::Completed(()) => {
                if !ctx.is_interrupted() {
                    ctx.post_progress(&done_job.remote, None);
                }
            }
            TaskOutcome::Failed(e) => done_job.status.fail(e),
            TaskOutcome::Cancelled => {}
        },
    );
}

/// 计算本地文件摘要并与远程目录中的校验和比对
fn verify_download(ctx: &WorkerContext, job: &DownloadJob) -> Result<(), TransferError> {
    debug!("校验下载文件: {:?}", job.local);
    let reference = ctx.session().stat(&job.remote)?.checksum;
    let algorithm =
        HashAlgorithm::for_reference(reference.as_deref(), ctx.session().default_hash_scheme());

    let mut digest = None;
    for step in stream_digest(&job.local, algorithm, job.block_size)? {
        if ctx.is_interrupted() {
            return Ok(());
        }
        let step = step?;
        if step.bytes_read > 0 {
            ctx.post_progress(&job.remote, Some(step.bytes_read));
        }
        if step.digest.is_some() {
            digest = step.digest;
        }
    }
    let local = digest.unwrap_or_default();

    match reference {
        None if job.strict_checksum => Err(TransferError::Checksum {
            path: local_key(&job.local),
            local,
            remote: String::new(),
        }),
        None => {
            warn!("远程对象没有校验和，跳过比对: {} (本地 {})", job.remote, local);
            Ok(())
        }
        Some(remote) if remote != local => Err(TransferError::Checksum {
            path: local_key(&job.local),
            local,
            remote,
        }),
        Some(_) => {
            debug!("校验通过: {} {}", job.remote, local);
            Ok(())
        }
    }
}

/// 深度优先下载集合树到 `dest_dir/<集合名>`
///
/// 集合无法列出或本地目录无法创建时，该集合登记为失败，同级集合继续下载。
pub fn download_collection<'a>(
    coordinator: &'a mut TransferCoordinator,
    config: &'a TransferConfig,
    registry: &'a dyn StatusRegistry,
    sink: &'a mut ProgressSink,
    collection: String,
    dest_dir: PathBuf,
) -> BoxFuture<'a, ()> {
    async move {
        if coordinator.is_interrupted() {
            return;
        }

        let target = dest_dir.join(basename(&collection));
        if let Err(e) = tokio::fs::create_dir_all(&target).await {
            error!("无法创建本地目录 {:?}: {}", target, e);
            record_failure(registry, &collection, e.into());
            return;
        }

        let listing = {
            let collection = collection.clone();
            coordinator
                .session()
                .blocking(move |s| s.list_collection(&collection))
                .await
        };
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                error!("列出集合 {} 失败: {}", collection, e);
                record_failure(registry, &collection, e);
                return;
            }
        };
        debug!(
            "下载集合 {}: {} 个对象, {} 个子集合",
            collection,
            listing.objects.len(),
            listing.subcollections.len()
        );

        let stats = BatchStats::from_entries(&listing.objects);
        let paths: Vec<String> = listing.objects.iter().map(|(p, _)| p.clone()).collect();
        registry.add_keys(&paths);
        register_objects(registry, &paths, &stats, config.checksum_factor());

        download_objects(coordinator, config, registry, sink, &stats, &paths, &target).await;

        for sub in listing.subcollections {
            download_collection(coordinator, config, registry, sink, sub, target.clone()).await;
        }
    }
    .boxed()
}
