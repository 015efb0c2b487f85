//! 日志模块 - 文件日志（按大小轮转）和控制台输出

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "synccore.log";

/// 日志配置，保存在 config.json 的 "log" 键下
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 同时输出到标准错误
    #[serde(default)]
    pub console: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            console: false,
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 保存日志配置，保留 config.json 中的其他键
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        let config_file = config_dir.join("config.json");
        let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
            Err(_) => serde_json::json!({}),
        };

        config["log"] = serde_json::to_value(self)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("写入配置失败: {:?}", config_file))
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct LogFile {
    path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl LogFile {
    fn open(path: PathBuf, max_size: u64) -> io::Result<Self> {
        let mut file = Self {
            path,
            max_size,
            written: 0,
            writer: None,
        };
        file.reopen()?;
        Ok(file)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let existing = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if existing > self.max_size {
            self.rotate()?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// 当前文件改名为 .old，覆盖上一份备份
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let backup = self.path.with_extension("log.old");
        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(&self.path, &backup)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > self.max_size {
            self.rotate()?;
            self.reopen()?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file not available"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小轮转的日志文件，可在多个线程间共享
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file: Arc<Mutex<LogFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let max_size = u64::from(max_size_mb) * 1024 * 1024;
        let file = LogFile::open(log_dir.join(LOG_FILE_NAME), max_size)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LogFile> {
        // 写日志时 panic 不应让后续日志全部失败
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 单条日志记录的写入器
pub struct LogWriter {
    file: Arc<Mutex<LogFile>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match file.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
        }
    }
}

/// 按 `log_dir/config.json` 的配置初始化全局日志
///
/// 返回 false 表示日志已禁用或全局 subscriber 已被设置。
pub fn init_logging(log_dir: &Path) -> anyhow::Result<bool> {
    let config = LogConfig::load(log_dir);
    if !config.enabled {
        return Ok(false);
    }

    let env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());

    let file_writer = SizeRotatingWriter::new(log_dir, config.max_size_mb)
        .with_context(|| format!("无法创建日志文件: {:?}", log_dir))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false);

    let console_layer = config.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_config_roundtrip_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"transfer":{"parallelism":8}}"#).unwrap();

        let config = LogConfig {
            level: "debug".to_string(),
            console: true,
            ..LogConfig::default()
        };
        config.save(dir.path()).unwrap();

        assert_eq!(LogConfig::load(dir.path()), config);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(raw["transfer"]["parallelism"], 8);
        assert_eq!(raw["log"]["maxSizeMb"], 5);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());
    }

    #[test]
    fn test_writer_rotates_when_full() {
        let dir = TempDir::new().unwrap();
        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 600 * 1024];

        let mut w = writer.make_writer();
        w.write_all(&line).unwrap();
        w.write_all(&line).unwrap();
        // 超过 1MB 后下一次写入触发轮转
        w.write_all(b"tail\n").unwrap();
        w.flush().unwrap();

        let backup = writer.path().with_extension("log.old");
        assert!(backup.exists());
        assert_eq!(fs::read(writer.path()).unwrap(), b"tail\n");
    }
}
