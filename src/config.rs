//! 传输配置模块

use crate::core::checksum::DEFAULT_BLOCK_SIZE;
use crate::error::TransferError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "config.json";
const CONFIG_KEY: &str = "transfer";

/// 传输配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 传输池并发数，同时也是单个对象的最大分块数
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// 计算池并发数（校验和计算、上传收尾）
    #[serde(default = "default_compute_threads")]
    pub compute_threads: usize,
    /// 读写块大小（字节）
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// 传输后是否在本地计算校验和并与远程比对
    #[serde(default = "default_true")]
    pub local_checksum: bool,
    /// 远程没有校验和时是否视为失败
    #[serde(default)]
    pub strict_checksum: bool,
    /// 上传的目标资源
    #[serde(default)]
    pub default_resource: Option<String>,
    /// 上传完成后是否更新所有副本
    #[serde(default = "default_true")]
    pub replicate: bool,
    /// 等待阶段转发进度的间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_parallelism() -> usize {
    4
}

fn default_compute_threads() -> usize {
    4
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            compute_threads: default_compute_threads(),
            block_size: default_block_size(),
            local_checksum: true,
            strict_checksum: false,
            default_resource: None,
            replicate: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TransferConfig {
    /// 从配置文件加载传输配置，文件不存在或格式错误时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join(CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get(CONFIG_KEY).cloned())
            .and_then(|section| serde_json::from_value::<TransferConfig>(section).ok())
            .unwrap_or_default()
    }

    /// 保存传输配置，保留文件中的其他配置项
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);

        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config[CONFIG_KEY] = serde_json::to_value(self)?;

        let content = serde_json::to_string_pretty(&config)?;
        fs::write(&config_file, content)
            .with_context(|| format!("写入配置文件失败: {}", config_file.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.parallelism == 0 {
            return Err(TransferError::Config("parallelism must be at least 1".into()));
        }
        if self.compute_threads == 0 {
            return Err(TransferError::Config(
                "compute_threads must be at least 1".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(TransferError::Config("block_size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(TransferError::Config(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// 进度总量相对文件大小的倍数：开启本地校验时每个字节读两遍
    pub fn checksum_factor(&self) -> u64 {
        if self.local_checksum {
            2
        } else {
            1
        }
    }
}
