//! 批次统计
//!
//! 传输开始前统计文件数和总字节数：下载时来自远程列表，上传时来自本地文件。

use crate::error::TransferError;
use crate::remote::path::dirname;
use crate::remote::LockedSession;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 一批路径的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub file_count: usize,
    pub total_bytes: u64,
    /// 路径 -> 字节数（文件批次为单个文件大小，目录批次为整棵树的大小）
    pub per_path: HashMap<String, u64>,
}

impl BatchStats {
    /// 由 (路径, 大小) 列表构建
    pub fn from_entries(entries: &[(String, u64)]) -> Self {
        Self {
            file_count: entries.len(),
            total_bytes: entries.iter().map(|(_, size)| size).sum(),
            per_path: entries.iter().cloned().collect(),
        }
    }

    /// 按校验倍数放大后的每路径预期进度
    pub fn scaled(&self, factor: u64) -> HashMap<String, u64> {
        self.per_path
            .iter()
            .map(|(path, size)| (path.clone(), size * factor))
            .collect()
    }

    pub fn expected_bytes(&self, factor: u64) -> u64 {
        self.total_bytes * factor
    }
}

/// 本地路径作为状态键时的字符串形式
pub fn local_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// 统计本地文件列表
pub fn local_files_stats(files: &[PathBuf]) -> io::Result<BatchStats> {
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let size = std::fs::metadata(file)?.len();
        entries.push((local_key(file), size));
    }
    Ok(BatchStats::from_entries(&entries))
}

/// 统计本地目录树，`per_path` 记录每个目录的总大小
pub fn local_trees_stats(dirs: &[PathBuf]) -> io::Result<BatchStats> {
    let mut stats = BatchStats::default();

    for dir in dirs {
        let mut dir_bytes = 0;
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                stats.file_count += 1;
                dir_bytes += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        debug!("本地目录 {:?}: {} 字节", dir, dir_bytes);
        stats.per_path.insert(local_key(dir), dir_bytes);
        stats.total_bytes += dir_bytes;
    }

    Ok(stats)
}

/// 统计远程对象列表
///
/// 按所在集合列出对象，只保留请求的路径；不存在的对象不会出现在 `per_path` 中，
/// 但仍计入 `file_count`。
pub fn remote_files_stats(
    session: &LockedSession,
    paths: &[String],
) -> Result<BatchStats, TransferError> {
    let wanted: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
    let collections: BTreeSet<&str> = paths.iter().map(|p| dirname(p)).collect();

    let mut per_path = HashMap::new();
    for collection in collections {
        let collection = if collection.is_empty() { "/" } else { collection };
        let listing = match session.list_collection(collection) {
            Ok(listing) => listing,
            Err(TransferError::FileNotFound(_)) => {
                warn!("远程集合不存在: {}", collection);
                continue;
            }
            Err(e) => return Err(e),
        };
        for (path, size) in listing.objects {
            if wanted.contains(path.as_str()) {
                per_path.insert(path, size);
            }
        }
    }

    Ok(BatchStats {
        file_count: paths.len(),
        total_bytes: per_path.values().sum(),
        per_path,
    })
}

/// 统计远程集合树，`per_path` 记录每个集合的总大小
pub fn remote_trees_stats(
    session: &LockedSession,
    dirs: &[String],
) -> Result<BatchStats, TransferError> {
    let mut stats = BatchStats::default();

    for dir in dirs {
        let objects = session.stat_tree(dir)?;
        let dir_bytes: u64 = objects.iter().map(|(_, size)| size).sum();
        stats.file_count += objects.len();
        stats.total_bytes += dir_bytes;
        stats.per_path.insert(dir.clone(), dir_bytes);
    }

    Ok(stats)
}
