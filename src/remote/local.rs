//! 基于本地目录树的远程存储实现
//!
//! 对象对应文件，集合对应目录。校验和目录、副本数和连接池都保存在内存中，
//! 适合作为本地镜像目标，也用于测试传输流水线。

use super::path::normpath;
use super::{
    CollectionListing, CollectionStatus, ObjectStat, OpenMode, OperationType, RemoteHandle,
    RemoteStore, StoreConnection, StoreOptions,
};
use crate::core::checksum::{file_digest, HashAlgorithm, DEFAULT_BLOCK_SIZE};
use crate::error::StoreError;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use walkdir::WalkDir;

type Catalog = Arc<Mutex<HashMap<String, String>>>;

/// 连接池计数
#[derive(Debug, Default)]
struct PoolCounters {
    opened: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

/// 连接池统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: usize,
    pub released: usize,
    pub discarded: usize,
    pub idle: usize,
}

pub struct FsStore {
    base_path: PathBuf,
    name: String,
    hash_scheme: String,
    catalog: Catalog,
    replicas: Mutex<HashMap<String, u32>>,
    idle: Mutex<Vec<Box<dyn StoreConnection>>>,
    counters: Arc<PoolCounters>,
}

impl FsStore {
    pub fn new(path: impl AsRef<Path>, hash_scheme: &str) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        let name = format!("fs:{}", base_path.display());
        Ok(Self {
            base_path,
            name,
            hash_scheme: hash_scheme.to_string(),
            catalog: Arc::new(Mutex::new(HashMap::new())),
            replicas: Mutex::new(HashMap::new()),
            idle: Mutex::new(Vec::new()),
            counters: Arc::new(PoolCounters::default()),
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        resolve(&self.base_path, path)
    }

    /// 绝对路径转换为远程路径
    fn to_remote(&self, full_path: &Path) -> Option<String> {
        let relative = full_path.strip_prefix(&self.base_path).ok()?.to_str()?;
        Some(normpath(&relative.replace('\\', "/")))
    }

    /// 登记对象的目录校验和
    pub fn set_checksum(&self, path: &str, checksum: &str) {
        lock(&self.catalog).insert(normpath(path), checksum.to_string());
    }

    pub fn replica_count(&self, path: &str) -> u32 {
        let path = normpath(path);
        if !self.resolve_path(&path).is_file() {
            return 0;
        }
        lock(&self.replicas).get(&path).copied().unwrap_or(1)
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            opened: self.counters.opened.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
            idle: lock(&self.idle).len(),
        }
    }

    fn forget(&self, path: &str) {
        lock(&self.catalog).remove(path);
        lock(&self.replicas).remove(path);
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = normpath(path);
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_path_buf()
    } else {
        base.join(path)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(path: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::ObjectNotFound(path.to_string())
    } else {
        e.into()
    }
}

fn modified_secs(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

impl RemoteStore for FsStore {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        options: &StoreOptions,
    ) -> Result<Box<dyn RemoteHandle>, StoreError> {
        let path = normpath(path);
        let full_path = self.resolve_path(&path);

        let file = match mode {
            OpenMode::Read => File::open(&full_path).map_err(|e| not_found(&path, e))?,
            OpenMode::Write | OpenMode::Append => {
                let parent_exists = full_path.parent().map_or(false, |p| p.is_dir());
                if !parent_exists {
                    return Err(StoreError::UnknownCollection(
                        super::path::dirname(&path).to_string(),
                    ));
                }
                // 内容即将变化，旧的校验和作废
                lock(&self.catalog).remove(&path);
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(mode == OpenMode::Write)
                    .open(&full_path)?
            }
        };

        let commit = (options.operation == Some(OperationType::Put)).then(|| Commit {
            verify_checksum: options.verify_checksum.clone(),
            hash_scheme: self.hash_scheme.clone(),
            catalog: self.catalog.clone(),
        });

        Ok(Box::new(FsHandle {
            file,
            path,
            full_path,
            commit,
        }))
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), StoreError> {
        let path = normpath(path);
        let file = OpenOptions::new()
            .write(true)
            .open(self.resolve_path(&path))
            .map_err(|e| not_found(&path, e))?;
        file.set_len(size)?;
        lock(&self.catalog).remove(&path);
        Ok(())
    }

    fn unlink(&self, path: &str, _force: bool) -> Result<(), StoreError> {
        let path = normpath(path);
        let full_path = self.resolve_path(&path);
        if !full_path.is_file() {
            return Err(StoreError::ObjectNotFound(path));
        }
        fs::remove_file(&full_path)?;
        self.forget(&path);
        Ok(())
    }

    fn replicate(&self, path: &str, options: &StoreOptions) -> Result<(), StoreError> {
        let path = normpath(path);
        if !self.resolve_path(&path).is_file() {
            return Err(StoreError::ObjectNotFound(path));
        }
        let mut replicas = lock(&self.replicas);
        let count = replicas.entry(path.clone()).or_insert(1);
        if options.update_replicas {
            // 已有副本只做更新，至少保证一个额外副本
            *count = (*count).max(2);
        } else {
            *count += 1;
        }
        debug!("复制对象 {} -> {} 个副本", path, count);
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<ObjectStat, StoreError> {
        let path = normpath(path);
        let full_path = self.resolve_path(&path);
        let metadata = fs::metadata(&full_path).map_err(|e| not_found(&path, e))?;
        if metadata.is_dir() {
            return Err(StoreError::ObjectNotFound(path));
        }
        Ok(ObjectStat {
            size: metadata.len(),
            modify_time: modified_secs(&metadata),
            checksum: lock(&self.catalog).get(&path).cloned(),
        })
    }

    fn stat_tree(&self, path: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let base = self.resolve_path(path);
        if !base.is_dir() {
            return Err(StoreError::UnknownCollection(normpath(path)));
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| StoreError::Other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map_err(|e| StoreError::Other(e.to_string()))?.len();
            if let Some(remote) = self.to_remote(entry.path()) {
                objects.push((remote, size));
            }
        }
        Ok(objects)
    }

    fn list_collection(&self, path: &str) -> Result<CollectionListing, StoreError> {
        let base = self.resolve_path(path);
        if !base.is_dir() {
            return Err(StoreError::UnknownCollection(normpath(path)));
        }

        let mut entries: Vec<_> = fs::read_dir(&base)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut listing = CollectionListing::default();
        for entry in entries {
            let metadata = entry.metadata()?;
            let Some(remote) = self.to_remote(&entry.path()) else {
                continue;
            };
            if metadata.is_dir() {
                listing.subcollections.push(remote);
            } else {
                listing.objects.push((remote, metadata.len()));
            }
        }
        Ok(listing)
    }

    fn create_collection(&self, path: &str) -> Result<(), StoreError> {
        let path = normpath(path);
        let full_path = self.resolve_path(&path);
        if full_path.exists() {
            return Err(StoreError::AlreadyExists(path));
        }
        if !full_path.parent().map_or(false, |p| p.is_dir()) {
            return Err(StoreError::UnknownCollection(
                super::path::dirname(&path).to_string(),
            ));
        }
        fs::create_dir(&full_path)?;
        Ok(())
    }

    fn checkout_connection(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        if let Some(conn) = lock(&self.idle).pop() {
            return Ok(conn);
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FsConnection {
            base_path: self.base_path.clone(),
            catalog: self.catalog.clone(),
            counters: self.counters.clone(),
            pending: VecDeque::new(),
            awaiting_reply: false,
            connected: true,
        }))
    }

    fn release_connection(&self, conn: Box<dyn StoreConnection>) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        lock(&self.idle).push(conn);
    }

    fn default_hash_scheme(&self) -> &str {
        &self.hash_scheme
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// put 提交时需要的信息
struct Commit {
    verify_checksum: Option<String>,
    hash_scheme: String,
    catalog: Catalog,
}

struct FsHandle {
    file: File,
    path: String,
    full_path: PathBuf,
    commit: Option<Commit>,
}

impl RemoteHandle for FsHandle {
    fn seek(&mut self, offset: u64) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.file.flush()?;
        let Some(commit) = self.commit.take() else {
            return Ok(());
        };

        // 服务端重新计算摘要，与客户端提供的校验和比对
        let algorithm = HashAlgorithm::for_reference(
            commit.verify_checksum.as_deref(),
            &commit.hash_scheme,
        );
        let actual = file_digest(&self.full_path, algorithm, DEFAULT_BLOCK_SIZE)?;

        if let Some(expected) = commit.verify_checksum {
            if expected != actual {
                return Err(StoreError::ChecksumMismatch {
                    path: self.path.clone(),
                    expected,
                    actual,
                });
            }
        }

        lock(&commit.catalog).insert(self.path.clone(), actual);
        Ok(())
    }
}

/// 连接：删除集合时每次状态往返删除一个条目
struct FsConnection {
    base_path: PathBuf,
    catalog: Catalog,
    counters: Arc<PoolCounters>,
    pending: VecDeque<PathBuf>,
    awaiting_reply: bool,
    connected: bool,
}

impl FsConnection {
    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected {
            Ok(())
        } else {
            Err(StoreError::Transport("connection closed".to_string()))
        }
    }
}

impl StoreConnection for FsConnection {
    fn send_remove_collection(
        &mut self,
        path: &str,
        options: &StoreOptions,
    ) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let path = normpath(path);
        let base = resolve(&self.base_path, &path);
        if !base.is_dir() || base == self.base_path {
            return Err(StoreError::UnknownCollection(path));
        }

        let entries: Vec<PathBuf> = WalkDir::new(&base)
            .contents_first(true)
            .into_iter()
            .map(|e| e.map(|e| e.into_path()))
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::Other(e.to_string()))?;

        if !options.recursive && entries.len() > 1 {
            return Err(StoreError::Other(format!("collection not empty: {}", path)));
        }

        let prefix = format!("{}/", path);
        lock(&self.catalog).retain(|k, _| !k.starts_with(&prefix));

        self.pending = entries.into();
        self.awaiting_reply = false;
        Ok(())
    }

    fn recv_status(&mut self) -> Result<CollectionStatus, StoreError> {
        self.ensure_connected()?;
        if self.awaiting_reply {
            return Err(StoreError::Other(
                "protocol error: status not acknowledged".to_string(),
            ));
        }

        let Some(entry) = self.pending.pop_front() else {
            return Ok(CollectionStatus::Finished);
        };
        if entry.is_dir() {
            fs::remove_dir(&entry)?;
        } else {
            fs::remove_file(&entry)?;
        }
        self.awaiting_reply = true;
        Ok(CollectionStatus::InProgress)
    }

    fn reply_status(&mut self) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.awaiting_reply = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.pending.clear();
            self.counters.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
