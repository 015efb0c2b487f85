//! 加锁会话
//!
//! 远程存储并不保证打开、截断、删除、复制和单对象元数据查询可以并发调用，
//! 这些操作共用一把互斥锁串行执行；批量列表查询不加锁。
//! 存储原生错误在这里转换为 [`TransferError`]。

use super::{
    CollectionListing, ObjectStat, OpenMode, RemoteHandle, RemoteStore, StoreConnection,
    StoreOptions,
};
use crate::error::{StoreError, TransferError};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Clone)]
pub struct LockedSession {
    store: Arc<dyn RemoteStore>,
    lock: Arc<Mutex<()>>,
}

impl LockedSession {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // 锁只保护远程调用的串行化，持锁线程 panic 不影响后续调用
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn open(
        &self,
        path: &str,
        mode: OpenMode,
        options: &StoreOptions,
    ) -> Result<Box<dyn RemoteHandle>, TransferError> {
        let _guard = self.guard();
        Ok(self.store.open(path, mode, options)?)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<(), TransferError> {
        let _guard = self.guard();
        Ok(self.store.truncate(path, size)?)
    }

    pub fn unlink(&self, path: &str, force: bool) -> Result<(), TransferError> {
        let _guard = self.guard();
        Ok(self.store.unlink(path, force)?)
    }

    /// 删除对象，对象不存在不算错误；返回是否真的删除了
    pub fn unlink_if_exists(&self, path: &str, force: bool) -> Result<bool, TransferError> {
        let _guard = self.guard();
        match self.store.unlink(path, force) {
            Ok(()) => Ok(true),
            Err(StoreError::ObjectNotFound(_)) => {
                debug!("对象不存在，无需删除: {}", path);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn replicate(&self, path: &str, options: &StoreOptions) -> Result<(), TransferError> {
        let _guard = self.guard();
        Ok(self.store.replicate(path, options)?)
    }

    pub fn stat(&self, path: &str) -> Result<ObjectStat, TransferError> {
        let _guard = self.guard();
        Ok(self.store.stat(path)?)
    }

    pub fn stat_tree(&self, path: &str) -> Result<Vec<(String, u64)>, TransferError> {
        Ok(self.store.stat_tree(path)?)
    }

    pub fn list_collection(&self, path: &str) -> Result<CollectionListing, TransferError> {
        Ok(self.store.list_collection(path)?)
    }

    pub fn create_collection(&self, path: &str) -> Result<(), TransferError> {
        Ok(self.store.create_collection(path)?)
    }

    /// 创建集合，已存在不算错误；返回是否新建
    pub fn create_collection_if_missing(&self, path: &str) -> Result<bool, TransferError> {
        match self.store.create_collection(path) {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn checkout_connection(&self) -> Result<Box<dyn StoreConnection>, TransferError> {
        Ok(self.store.checkout_connection()?)
    }

    pub fn release_connection(&self, conn: Box<dyn StoreConnection>) {
        self.store.release_connection(conn)
    }

    pub fn default_hash_scheme(&self) -> &str {
        self.store.default_hash_scheme()
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// 在阻塞线程池上执行会话调用，供异步编排代码使用
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&LockedSession) -> Result<T, TransferError> + Send + 'static,
    {
        let session = self.clone();
        tokio::task::spawn_blocking(move || f(&session))
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FsStore;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> LockedSession {
        let store = FsStore::new(dir.path(), "MD5").unwrap();
        LockedSession::new(Arc::new(store))
    }

    #[test]
    fn test_unlink_missing_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);

        assert!(!session.unlink_if_exists("/missing.bin", true).unwrap());
        assert!(matches!(
            session.unlink("/missing.bin", true),
            Err(TransferError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_create_collection_twice() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);

        assert!(session.create_collection_if_missing("/coll").unwrap());
        assert!(!session.create_collection_if_missing("/coll").unwrap());
        assert!(session.create_collection("/coll").is_err());
    }

    #[test]
    fn test_truncate_resizes_object() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        std::fs::write(dir.path().join("obj.bin"), b"0123456789").unwrap();

        session.truncate("/obj.bin", 4).unwrap();
        assert_eq!(session.stat("/obj.bin").unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_blocking_runs_off_the_runtime() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        session.create_collection("/c").unwrap();

        let listing = session
            .blocking(|s| s.list_collection("/c"))
            .await
            .unwrap();
        assert!(listing.objects.is_empty());
    }
}
