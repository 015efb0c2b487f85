//! 本地文件校验和
//!
//! 按固定大小的块流式计算摘要，编码方式与远程目录保存的校验和一致：
//! MD5 为小写十六进制，SHA-256 为 `sha2:` 前缀加 base64。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::remote::HASH_SCHEME_SHA256;

/// 默认读块大小（8 MiB，是常见文件系统块大小的整数倍）
pub const DEFAULT_BLOCK_SIZE: u64 = 8192 * 1024;

const SHA256_PREFIX: &str = "sha2:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// 由存储的摘要方案名确定算法，未知方案按 MD5 处理
    pub fn from_scheme(scheme: &str) -> Self {
        if scheme.eq_ignore_ascii_case(HASH_SCHEME_SHA256) {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Md5
        }
    }

    /// 有参考校验和时按其前缀判断，否则使用存储的默认方案
    pub fn for_reference(reference: Option<&str>, default_scheme: &str) -> Self {
        match reference {
            Some(r) if r.starts_with(SHA256_PREFIX) => HashAlgorithm::Sha256,
            Some(_) => HashAlgorithm::Md5,
            None => Self::from_scheme(default_scheme),
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// 把原始摘要编码为远程格式
    pub fn encode(self, digest: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(digest),
            HashAlgorithm::Sha256 => format!("{}{}", SHA256_PREFIX, BASE64.encode(digest)),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// 流式计算的一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumStep {
    /// 本步读取的字节数，最后一步为 0
    pub bytes_read: u64,
    /// 只有最后一步携带编码后的摘要
    pub digest: Option<String>,
}

/// 流式摘要迭代器
///
/// 每读一块产出一步 `(块长度, None)`，读完后产出 `(0, Some(摘要))` 并结束。
/// 出错后迭代结束。
pub struct ChecksumStream {
    file: File,
    algorithm: HashAlgorithm,
    hasher: Option<Hasher>,
    buffer: Vec<u8>,
}

impl Iterator for ChecksumStream {
    type Item = io::Result<ChecksumStep>;

    fn next(&mut self) -> Option<Self::Item> {
        self.hasher.as_ref()?;

        let n = match read_full(&mut self.file, &mut self.buffer) {
            Ok(n) => n,
            Err(e) => {
                self.hasher = None;
                return Some(Err(e));
            }
        };

        if n > 0 {
            self.hasher.as_mut()?.update(&self.buffer[..n]);
            return Some(Ok(ChecksumStep {
                bytes_read: n as u64,
                digest: None,
            }));
        }

        let digest = self.hasher.take()?.finalize();
        Some(Ok(ChecksumStep {
            bytes_read: 0,
            digest: Some(self.algorithm.encode(&digest)),
        }))
    }
}

/// 尽量读满缓冲区，只有到达文件末尾时才返回不足的长度
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// 打开文件并返回流式摘要迭代器
pub fn stream_digest(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
    block_size: u64,
) -> io::Result<ChecksumStream> {
    let file = File::open(path)?;
    let block_size = block_size.clamp(1, DEFAULT_BLOCK_SIZE * 16) as usize;
    Ok(ChecksumStream {
        file,
        algorithm,
        hasher: Some(algorithm.hasher()),
        buffer: vec![0u8; block_size],
    })
}

/// 一次性计算文件摘要
pub fn file_digest(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
    block_size: u64,
) -> io::Result<String> {
    let mut digest = None;
    for step in stream_digest(path, algorithm, block_size)? {
        digest = step?.digest.or(digest);
    }
    digest.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "digest stream ended early"))
}
