//! 分块规划
//!
//! 把一个对象切分成若干连续、互不重叠的字节区间，每个区间由一个传输任务负责。

use std::sync::atomic::{AtomicUsize, Ordering};

/// 一个分块的字节区间 `[offset, offset + length)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 规划分块
///
/// 先按 `block_size` 计算块数，再把块尽量均分给至多 `parallelism` 个分块，
/// 且每个分块至少两块（小对象只用一个分块）。余数分给前面的分块。
/// 大小为 0 的对象不分块，返回空列表。
pub fn plan_chunks(size: u64, parallelism: usize, block_size: u64) -> Vec<Chunk> {
    if size == 0 {
        return Vec::new();
    }

    let block_size = block_size.max(1);
    let parallelism = parallelism.max(1) as u64;

    let blocks = (size - 1) / block_size + 1;
    let count = parallelism.min(blocks / 2).max(1);
    let (per_chunk, extra) = (blocks / count, blocks % count);

    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for i in 0..count {
        let nblocks = if i < extra { per_chunk + 1 } else { per_chunk };
        let end = (offset + nblocks * block_size).min(size);
        chunks.push(Chunk {
            offset,
            length: end - offset,
        });
        offset = end;
    }
    chunks
}

/// 单个对象的剩余分块计数
///
/// 分块任务完成（无论成功与否）时调用 [`finish_one`](Self::finish_one)，
/// 把计数减到 0 的那个任务负责收尾（校验或提交），且只会有一个。
#[derive(Debug)]
pub struct ObjectTransferGroup {
    remaining: AtomicUsize,
}

impl ObjectTransferGroup {
    pub fn new(chunks: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(chunks),
        }
    }

    /// 返回 true 表示这是最后一个完成的分块
    pub fn finish_one(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}
