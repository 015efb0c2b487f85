pub mod local;
pub mod path;
pub mod session;

use crate::error::StoreError;
use serde::{Deserialize, Serialize};

pub use local::FsStore;
pub use session::LockedSession;

// ============ 公共常量 ============

/// MD5 摘要方案名
pub const HASH_SCHEME_MD5: &str = "MD5";
/// SHA-256 摘要方案名
pub const HASH_SCHEME_SHA256: &str = "SHA256";

/// 远程对象元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    pub modify_time: i64,
    pub checksum: Option<String>,
}

/// 集合内容（只含直接子项）
#[derive(Debug, Clone, Default)]
pub struct CollectionListing {
    /// (对象路径, 大小)
    pub objects: Vec<(String, u64)>,
    /// 子集合路径
    pub subcollections: Vec<String>,
}

/// 打开模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 只读
    Read,
    /// 创建并截断
    Write,
    /// 创建但不截断，分块写入使用
    Append,
}

/// 远程操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// 上传完成提交，触发服务端的 put 后处理
    Put,
}

/// 远程调用选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub force: bool,
    pub dest_resource: Option<String>,
    pub verify_checksum: Option<String>,
    pub operation: Option<OperationType>,
    pub update_replicas: bool,
    pub all_replicas: bool,
    pub recursive: bool,
}

impl StoreOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_resource(mut self, resource: Option<String>) -> Self {
        self.dest_resource = resource;
        self
    }

    pub fn with_operation(mut self, operation: OperationType) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_verify_checksum(mut self, checksum: Option<String>) -> Self {
        self.verify_checksum = checksum;
        self
    }
}

/// 删除集合时服务端返回的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// 仍在处理，需要回复后继续接收
    InProgress,
    /// 请求已完成
    Finished,
}

/// 已打开的远程对象句柄
///
/// 句柄不在线程间共享，每个分块任务各自打开。
pub trait RemoteHandle: Send {
    fn seek(&mut self, offset: u64) -> Result<(), StoreError>;

    /// 读取到 buf，返回实际读取的字节数（0 表示结尾）
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, StoreError>;

    fn write(&mut self, buf: &[u8]) -> Result<(), StoreError>;

    /// 关闭句柄；以 put 操作打开的句柄在这里完成提交
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// 远程存储连接，用于需要多次往返的流式协议
pub trait StoreConnection: Send {
    /// 发送删除集合请求
    fn send_remove_collection(
        &mut self,
        path: &str,
        options: &StoreOptions,
    ) -> Result<(), StoreError>;

    /// 接收一次状态
    fn recv_status(&mut self) -> Result<CollectionStatus, StoreError>;

    /// 回复状态，请求服务端继续
    fn reply_status(&mut self) -> Result<(), StoreError>;

    /// 断开连接；断开后的连接不能再放回连接池
    fn disconnect(&mut self);
}

/// 远程存储会话
///
/// 所有方法都是阻塞调用，由工作线程池或 `spawn_blocking` 调用。
pub trait RemoteStore: Send + Sync {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        options: &StoreOptions,
    ) -> Result<Box<dyn RemoteHandle>, StoreError>;

    fn truncate(&self, path: &str, size: u64) -> Result<(), StoreError>;

    /// 删除对象，不存在时返回 [`StoreError::ObjectNotFound`]
    fn unlink(&self, path: &str, force: bool) -> Result<(), StoreError>;

    fn replicate(&self, path: &str, options: &StoreOptions) -> Result<(), StoreError>;

    fn stat(&self, path: &str) -> Result<ObjectStat, StoreError>;

    /// 递归列出集合下所有对象 (路径, 大小)
    fn stat_tree(&self, path: &str) -> Result<Vec<(String, u64)>, StoreError>;

    /// 列出集合的直接子项
    fn list_collection(&self, path: &str) -> Result<CollectionListing, StoreError>;

    /// 创建集合，已存在时返回 [`StoreError::AlreadyExists`]
    fn create_collection(&self, path: &str) -> Result<(), StoreError>;

    /// 从连接池取出一个连接
    fn checkout_connection(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// 把状态正常的连接放回连接池
    fn release_connection(&self, conn: Box<dyn StoreConnection>);

    /// 未显式指定算法时使用的摘要方案（"MD5" 或 "SHA256"）
    fn default_hash_scheme(&self) -> &str;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}
