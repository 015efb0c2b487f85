//! 端到端传输场景：本地文件系统模拟的远程存储

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use synccore_lib::core::scanner::local_key;
use synccore_lib::core::{
    file_digest, HashAlgorithm, OperationState, OperationStatus, StatusBoard, TransferProgress,
};
use synccore_lib::error::{StoreError, TransferError};
use synccore_lib::remote::{
    CollectionListing, FsStore, ObjectStat, OpenMode, RemoteHandle, RemoteStore, StoreConnection,
    StoreOptions,
};
use synccore_lib::{TransferConfig, TransferEngine};
use tempfile::TempDir;
use tokio::sync::mpsc;

const MIB: u64 = 1024 * 1024;

fn pattern(len: u64, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn remote_root(dir: &TempDir) -> PathBuf {
    dir.path().join("remote")
}

fn put_remote(dir: &TempDir, path: &str, data: &[u8]) -> PathBuf {
    let full = remote_root(dir).join(path.trim_start_matches('/'));
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(&full, data).unwrap();
    full
}

fn config(parallelism: usize, block_size: u64) -> TransferConfig {
    TransferConfig {
        parallelism,
        block_size,
        poll_interval_ms: 20,
        ..TransferConfig::default()
    }
}

/// 后台收集进度，返回最后一次进度
fn collect_progress() -> (
    mpsc::Sender<TransferProgress>,
    tokio::task::JoinHandle<Option<TransferProgress>>,
) {
    let (tx, mut rx) = mpsc::channel(16);
    let collector = tokio::spawn(async move {
        let mut last = None;
        while let Some(progress) = rx.recv().await {
            last = Some(progress);
        }
        last
    });
    (tx, collector)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn download_with_matching_checksum() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10 * MIB, 7);
    let remote_file = put_remote(&dir, "/zone/big.bin", &data);

    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let checksum = file_digest(&remote_file, HashAlgorithm::Md5, MIB).unwrap();
    store.set_checksum("/zone/big.bin", &checksum);

    let engine = TransferEngine::new(store, config(4, MIB)).unwrap();
    let board = StatusBoard::new();
    let local_dir = dir.path().join("local");
    let (tx, collector) = collect_progress();

    let report = engine
        .download_files(&["/zone/big.bin".to_string()], &local_dir, &board, Some(tx))
        .await
        .unwrap();

    let status = board.status("/zone/big.bin").unwrap();
    assert_eq!(status.state(), OperationState::Done);
    assert_eq!(status.progress(), 20 * MIB);
    assert_eq!(status.size(), 20 * MIB);
    assert_eq!(fs::read(local_dir.join("big.bin")).unwrap(), data);

    assert!(!report.cancelled);
    assert_eq!(report.files, 1);
    assert_eq!(report.file_bytes, 10 * MIB);
    assert_eq!(report.bytes_total, 20 * MIB);
    assert_eq!(report.bytes_completed, 20 * MIB);

    drop(engine);
    assert_eq!(
        collector.await.unwrap(),
        Some(TransferProgress {
            completed: 20 * MIB,
            total: 20 * MIB
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checksum_mismatch_fails_only_that_object() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());

    let mut paths = Vec::new();
    for (i, name) in ["a.bin", "b.bin", "c.bin"].iter().enumerate() {
        let path = format!("/zone/{}", name);
        let file = put_remote(&dir, &path, &pattern(256 * 1024, i as u8));
        let checksum = file_digest(&file, HashAlgorithm::Md5, 64 * 1024).unwrap();
        store.set_checksum(&path, &checksum);
        paths.push(path);
    }
    store.set_checksum("/zone/b.bin", "00000000000000000000000000000000");

    let engine = TransferEngine::new(store, config(2, 64 * 1024)).unwrap();
    let board = StatusBoard::new();
    let local_dir = dir.path().join("local");
    engine
        .download_files(&paths, &local_dir, &board, None)
        .await
        .unwrap();

    assert_eq!(board.status("/zone/a.bin").unwrap().state(), OperationState::Done);
    assert_eq!(board.status("/zone/c.bin").unwrap().state(), OperationState::Done);

    let failed = board.status("/zone/b.bin").unwrap();
    assert_eq!(failed.state(), OperationState::Failed);
    let expected_local = file_digest(local_dir.join("b.bin"), HashAlgorithm::Md5, 4096).unwrap();
    match failed.error().as_deref() {
        Some(TransferError::Checksum { path, local, remote }) => {
            assert_eq!(path, &local_key(&local_dir.join("b.bin")));
            assert_eq!(local, &expected_local);
            assert_eq!(remote, "00000000000000000000000000000000");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_object_is_reported_per_path() {
    let dir = TempDir::new().unwrap();
    put_remote(&dir, "/zone/present.bin", b"present");
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let engine = TransferEngine::new(store, config(2, 1024)).unwrap();
    let board = StatusBoard::new();

    let paths = vec!["/zone/present.bin".to_string(), "/zone/gone.bin".to_string()];
    engine
        .download_files(&paths, &dir.path().join("local"), &board, None)
        .await
        .unwrap();

    // 远程没有校验和时只告警
    assert_eq!(board.status("/zone/present.bin").unwrap().state(), OperationState::Done);
    let gone = board.status("/zone/gone.bin").unwrap();
    assert_eq!(gone.state(), OperationState::Failed);
    assert!(matches!(
        gone.error().as_deref(),
        Some(TransferError::FileNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_empty_file() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let engine = TransferEngine::new(store.clone(), config(4, MIB)).unwrap();
    engine.mkdir("/zone").await.unwrap();

    let local = dir.path().join("empty.bin");
    fs::write(&local, b"").unwrap();
    let board = StatusBoard::new();

    let report = engine
        .upload_files(&[local.clone()], "/zone", &board, None)
        .await
        .unwrap();

    let status = board.status(&local_key(&local)).unwrap();
    assert_eq!(status.state(), OperationState::Done);
    assert_eq!(status.progress(), 0);
    assert_eq!(status.current_element().as_deref(), Some("/zone/empty.bin"));
    assert_eq!(report.bytes_completed, 0);

    let stat = engine.session().stat("/zone/empty.bin").unwrap();
    assert_eq!(stat.size, 0);
    assert_eq!(stat.checksum.as_deref(), Some("d41d8cd98f00b204e9800998ecf8427e"));
    assert_eq!(store.replica_count("/zone/empty.bin"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_tree_twice_then_download_it() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(remote_root(&dir), "SHA256").unwrap());
    let engine = TransferEngine::new(store, config(2, 4096)).unwrap();
    engine.mkdir("/zone").await.unwrap();

    let tree = dir.path().join("local/tree");
    fs::create_dir_all(tree.join("sub")).unwrap();
    let nested = pattern(20_000, 3);
    fs::write(tree.join("sub/f.bin"), &nested).unwrap();
    fs::write(tree.join("top.bin"), b"top level").unwrap();

    for _ in 0..2 {
        let board = StatusBoard::new();
        let report = engine
            .upload_directories(&[tree.clone()], "/zone", &board, None)
            .await
            .unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(board.len(), 2);
        let counts = board.count_by_state();
        assert_eq!(counts.get(&OperationState::Done), Some(&2));
        assert_eq!(counts.get(&OperationState::Failed), None);
    }

    let remote_nested = remote_root(&dir).join("zone/tree/sub/f.bin");
    assert_eq!(fs::read(&remote_nested).unwrap(), nested);
    let stat = engine.session().stat("/zone/tree/sub/f.bin").unwrap();
    assert!(stat.checksum.unwrap().starts_with("sha2:"));

    let board = StatusBoard::new();
    let dest = dir.path().join("restore");
    let report = engine
        .download_directories(&["/zone/tree".to_string()], &dest, &board, None)
        .await
        .unwrap();

    assert_eq!(report.files, 2);
    assert_eq!(fs::read(dest.join("tree/sub/f.bin")).unwrap(), nested);
    assert_eq!(fs::read(dest.join("tree/top.bin")).unwrap(), b"top level");
    assert_eq!(
        board.status("/zone/tree/sub/f.bin").unwrap().state(),
        OperationState::Done
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_tree_after_upload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let engine = TransferEngine::new(store.clone(), config(2, 4096)).unwrap();
    put_remote(&dir, "/zone/coll/a.bin", b"a");
    put_remote(&dir, "/zone/coll/deep/b.bin", b"b");

    let board = StatusBoard::new();
    engine
        .delete_directories(&["/zone/coll".to_string()], &board, None)
        .await
        .unwrap();

    assert_eq!(board.status("/zone/coll").unwrap().state(), OperationState::Done);
    assert!(!remote_root(&dir).join("zone/coll").exists());
    assert_eq!(store.pool_stats().released, 1);
}

/// 取消触发时机
#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// 第一次关闭句柄
    FirstClose,
    /// 第一次列出集合（统计阶段）
    FirstListing,
}

/// 在指定时机触发引擎取消、对指定路径返回传输错误的存储
struct ScriptedStore {
    inner: FsStore,
    trigger: Option<Trigger>,
    cancel: Arc<OnceLock<Arc<AtomicBool>>>,
    fired: Arc<AtomicBool>,
    /// 取消之后仍然发生的远程写入（写模式打开或写数据）
    late_writes: Arc<AtomicUsize>,
    broken_path: Option<String>,
}

impl ScriptedStore {
    fn new(root: PathBuf, scheme: &str) -> Self {
        Self {
            inner: FsStore::new(root, scheme).unwrap(),
            trigger: None,
            cancel: Arc::new(OnceLock::new()),
            fired: Arc::new(AtomicBool::new(false)),
            late_writes: Arc::new(AtomicUsize::new(0)),
            broken_path: None,
        }
    }

    fn cancelling_on(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    fn broken_at(mut self, path: &str) -> Self {
        self.broken_path = Some(path.to_string());
        self
    }

    fn fire(&self, trigger: Trigger) {
        if self.trigger == Some(trigger) {
            fire_once(&self.fired, &self.cancel);
        }
    }

    fn check_broken(&self, path: &str) -> Result<(), StoreError> {
        match &self.broken_path {
            Some(broken) if broken == path => {
                Err(StoreError::Transport(format!("connection reset: {}", path)))
            }
            _ => Ok(()),
        }
    }
}

fn fire_once(fired: &AtomicBool, cancel: &OnceLock<Arc<AtomicBool>>) {
    if !fired.swap(true, Ordering::SeqCst) {
        if let Some(cancel) = cancel.get() {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

fn is_set(cancel: &OnceLock<Arc<AtomicBool>>) -> bool {
    cancel.get().map_or(false, |c| c.load(Ordering::SeqCst))
}

struct ScriptedHandle {
    inner: Box<dyn RemoteHandle>,
    fire_on_close: bool,
    cancel: Arc<OnceLock<Arc<AtomicBool>>>,
    fired: Arc<AtomicBool>,
    late_writes: Arc<AtomicUsize>,
}

impl RemoteHandle for ScriptedHandle {
    fn seek(&mut self, offset: u64) -> Result<(), StoreError> {
        self.inner.seek(offset)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.inner.read_into(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        if is_set(&self.cancel) {
            self.late_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.write(buf)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.close()?;
        if self.fire_on_close {
            fire_once(&self.fired, &self.cancel);
        }
        Ok(())
    }
}

impl RemoteStore for ScriptedStore {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        options: &StoreOptions,
    ) -> Result<Box<dyn RemoteHandle>, StoreError> {
        if mode != OpenMode::Read && is_set(&self.cancel) {
            self.late_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new(ScriptedHandle {
            inner: self.inner.open(path, mode, options)?,
            fire_on_close: self.trigger == Some(Trigger::FirstClose),
            cancel: self.cancel.clone(),
            fired: self.fired.clone(),
            late_writes: self.late_writes.clone(),
        }))
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), StoreError> {
        self.inner.truncate(path, size)
    }

    fn unlink(&self, path: &str, force: bool) -> Result<(), StoreError> {
        self.inner.unlink(path, force)
    }

    fn replicate(&self, path: &str, options: &StoreOptions) -> Result<(), StoreError> {
        self.inner.replicate(path, options)
    }

    fn stat(&self, path: &str) -> Result<ObjectStat, StoreError> {
        self.inner.stat(path)
    }

    fn stat_tree(&self, path: &str) -> Result<Vec<(String, u64)>, StoreError> {
        self.inner.stat_tree(path)
    }

    fn list_collection(&self, path: &str) -> Result<CollectionListing, StoreError> {
        self.check_broken(path)?;
        let listing = self.inner.list_collection(path)?;
        self.fire(Trigger::FirstListing);
        Ok(listing)
    }

    fn create_collection(&self, path: &str) -> Result<(), StoreError> {
        self.check_broken(path)?;
        self.inner.create_collection(path)
    }

    fn checkout_connection(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        self.inner.checkout_connection()
    }

    fn release_connection(&self, conn: Box<dyn StoreConnection>) {
        self.inner.release_connection(conn)
    }

    fn default_hash_scheme(&self) -> &str {
        self.inner.default_hash_scheme()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// 创建引擎并把取消标志交给存储
fn scripted_engine(
    store: ScriptedStore,
    config: TransferConfig,
) -> (TransferEngine, Arc<AtomicUsize>) {
    let cancel = store.cancel.clone();
    let late_writes = store.late_writes.clone();
    let engine = TransferEngine::new(Arc::new(store), config).unwrap();
    cancel.set(engine.cancel_handle()).unwrap();
    (engine, late_writes)
}

fn local_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_after_first_chunk() {
    let dir = TempDir::new().unwrap();
    let mut paths = Vec::new();
    for (i, name) in ["one.bin", "two.bin", "three.bin"].iter().enumerate() {
        let path = format!("/zone/{}", name);
        put_remote(&dir, &path, &pattern(64 * 1024, i as u8));
        paths.push(path);
    }

    let store = ScriptedStore::new(remote_root(&dir), "MD5").cancelling_on(Trigger::FirstClose);
    // 单个传输线程：第一个分块结束前其他分块都在排队
    let (engine, _) = scripted_engine(store, config(1, 16 * 1024));

    let board = StatusBoard::new();
    let local_dir = dir.path().join("local");
    let report = engine
        .download_files(&paths, &local_dir, &board, None)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(engine.is_cancelled());
    assert!(local_exists(&local_dir, "one.bin"));
    assert!(!local_exists(&local_dir, "two.bin"));
    assert!(!local_exists(&local_dir, "three.bin"));

    let first = board.status("/zone/one.bin").unwrap();
    assert_eq!(first.state(), OperationState::InProgress);
    for path in &paths[1..] {
        assert_ne!(board.status(path).unwrap().state(), OperationState::Done);
    }

    assert!(board.cancel_all() >= 1);
    assert_eq!(first.state(), OperationState::Cancelled);
    assert!(!local_exists(&local_dir, "one.bin"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_statistics_is_kept() {
    let dir = TempDir::new().unwrap();
    put_remote(&dir, "/zone/a.bin", &pattern(32 * 1024, 1));

    let store = ScriptedStore::new(remote_root(&dir), "MD5").cancelling_on(Trigger::FirstListing);
    let (engine, _) = scripted_engine(store, config(2, 8 * 1024));

    let board = StatusBoard::new();
    let local_dir = dir.path().join("local");
    let report = engine
        .download_files(&["/zone/a.bin".to_string()], &local_dir, &board, None)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.bytes_completed, 0);
    assert_ne!(board.status("/zone/a.bin").unwrap().state(), OperationState::Done);
    assert!(!local_exists(&local_dir, "a.bin"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_batch_is_cleared_by_next_batch() {
    let dir = TempDir::new().unwrap();
    put_remote(&dir, "/zone/a.bin", b"abc");
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let engine = TransferEngine::new(store, config(2, 1024)).unwrap();

    engine.cancel();
    let board = StatusBoard::new();
    let report = engine
        .download_files(&["/zone/a.bin".to_string()], &dir.path().join("local"), &board, None)
        .await
        .unwrap();

    // 上一批次遗留的取消在新批次开始时清除
    assert!(!report.cancelled);
    assert_eq!(board.status("/zone/a.bin").unwrap().state(), OperationState::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_progress_counts_hash_and_transfer() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(remote_root(&dir), "MD5").unwrap());
    let engine = TransferEngine::new(store, config(2, 4096)).unwrap();
    engine.mkdir("/zone").await.unwrap();

    let local = dir.path().join("data.bin");
    let data = pattern(50_000, 9);
    fs::write(&local, &data).unwrap();

    let board = StatusBoard::new();
    let report = engine
        .upload_files(&[local.clone()], "/zone", &board, None)
        .await
        .unwrap();

    let status = board.status(&local_key(&local)).unwrap();
    assert_eq!(status.state(), OperationState::Done);
    assert_eq!(status.progress(), 100_000);
    assert_eq!(status.size(), 100_000);
    assert_eq!(report.bytes_total, 100_000);
    assert_eq!(report.bytes_completed, 100_000);
    assert_eq!(fs::read(remote_root(&dir).join("zone/data.bin")).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_stops_writing_after_cancel() {
    let dir = TempDir::new().unwrap();
    let store = ScriptedStore::new(remote_root(&dir), "MD5").cancelling_on(Trigger::FirstClose);
    let (engine, late_writes) = scripted_engine(store, config(1, 4096));
    engine.mkdir("/zone").await.unwrap();

    let mut files = Vec::new();
    for (i, name) in ["one.bin", "two.bin"].iter().enumerate() {
        let file = dir.path().join(name);
        fs::write(&file, pattern(40_000, i as u8)).unwrap();
        files.push(file);
    }

    let board = StatusBoard::new();
    let report = engine
        .upload_files(&files, "/zone", &board, None)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(late_writes.load(Ordering::SeqCst), 0);
    for file in &files {
        let status = board.status(&local_key(file)).unwrap();
        assert_ne!(status.state(), OperationState::Done);
    }
    // 提交从未发生：目录中没有校验和
    for name in ["one.bin", "two.bin"] {
        if let Ok(stat) = engine.session().stat(&format!("/zone/{}", name)) {
            assert_eq!(stat.checksum, None);
        }
    }

    // 取消回调删除未完成的远程对象
    board.cancel_all();
    assert!(!remote_root(&dir).join("zone/one.bin").exists());
    assert!(!remote_root(&dir).join("zone/two.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broken_subcollection_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    put_remote(&dir, "/zone/tree/a.bin", &pattern(10_000, 1));
    fs::create_dir_all(remote_root(&dir).join("zone/tree/bad")).unwrap();
    put_remote(&dir, "/zone/other/b.bin", &pattern(10_000, 2));

    let store = ScriptedStore::new(remote_root(&dir), "MD5").broken_at("/zone/tree/bad");
    let (engine, _) = scripted_engine(store, config(2, 4096));

    let board = StatusBoard::new();
    let dest = dir.path().join("restore");
    let collections = vec!["/zone/tree".to_string(), "/zone/other".to_string()];
    let report = engine
        .download_directories(&collections, &dest, &board, None)
        .await
        .unwrap();

    assert!(!report.cancelled);
    assert_eq!(board.status("/zone/tree/a.bin").unwrap().state(), OperationState::Done);
    assert_eq!(board.status("/zone/other/b.bin").unwrap().state(), OperationState::Done);
    assert!(dest.join("other/b.bin").exists());

    let bad = board.status("/zone/tree/bad").unwrap();
    assert_eq!(bad.state(), OperationState::Failed);
    assert!(matches!(bad.error().as_deref(), Some(TransferError::Network(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broken_remote_collection_does_not_stop_upload() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("local");
    fs::create_dir_all(local.join("first/sub")).unwrap();
    fs::create_dir_all(local.join("second")).unwrap();
    fs::write(local.join("first/top.bin"), b"top").unwrap();
    fs::write(local.join("first/sub/deep.bin"), b"deep").unwrap();
    fs::write(local.join("second/other.bin"), b"other").unwrap();

    let store = ScriptedStore::new(remote_root(&dir), "MD5").broken_at("/zone/first/sub");
    let (engine, _) = scripted_engine(store, config(2, 4096));
    engine.mkdir("/zone").await.unwrap();

    let board = StatusBoard::new();
    let dirs = vec![local.join("first"), local.join("second")];
    engine
        .upload_directories(&dirs, "/zone", &board, None)
        .await
        .unwrap();

    let sub = board.status(&local_key(&local.join("first/sub"))).unwrap();
    assert_eq!(sub.state(), OperationState::Failed);
    assert!(board.status(&local_key(&local.join("first/sub/deep.bin"))).is_none());
    assert_eq!(
        board.status(&local_key(&local.join("first/top.bin"))).unwrap().state(),
        OperationState::Done
    );
    assert_eq!(
        board.status(&local_key(&local.join("second/other.bin"))).unwrap().state(),
        OperationState::Done
    );
    assert!(remote_root(&dir).join("zone/second/other.bin").exists());
}
