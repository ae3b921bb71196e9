//! 日志模块 - 文件日志（按大小轮转）与可选的控制台输出

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "foldersync.log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
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
    5 // 默认 5MB
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
    /// 将配置的日志级别转换为 tracing Level
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

/// 带大小限制的日志写入器
///
/// 超过上限时 `foldersync.log` 被重命名为 `foldersync.log.old`（旧备份被覆盖）。
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb as u64) * 1024 * 1024;
        let writer = open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
    let oversized = fs::metadata(file_path)
        .map(|m| m.len() > max_size)
        .unwrap_or(false);
    if oversized {
        rotate_log(file_path)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;
    Ok(BufWriter::new(file))
}

fn rotate_log(file_path: &Path) -> io::Result<()> {
    let backup_path = file_path.with_extension("log.old");
    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(file_path, &backup_path)
}

/// 单次写入使用的写入器
pub struct LogWriter {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
    file_path: PathBuf,
    max_size: u64,
}

impl LogWriter {
    fn rotate_if_needed(&self, slot: &mut Option<BufWriter<File>>) {
        let oversized = fs::metadata(&self.file_path)
            .map(|m| m.len() > self.max_size)
            .unwrap_or(false);
        if !oversized {
            return;
        }

        if let Some(mut w) = slot.take() {
            let _ = w.flush();
        }
        let _ = rotate_log(&self.file_path);
        *slot = open_file(&self.file_path, self.max_size).ok();
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;

        let written = match guard.as_mut() {
            Some(writer) => {
                let n = writer.write(buf)?;
                writer.flush()?;
                n
            }
            None => return Err(io::Error::new(io::ErrorKind::Other, "Writer not available")),
        };

        self.rotate_if_needed(&mut guard);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(writer) => writer.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 获取日志目录路径
pub fn get_log_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("foldersync"))
        .unwrap_or_else(|| PathBuf::from(".foldersync"))
}

/// 初始化日志系统
///
/// `verbose` 时强制 debug 级别并输出到控制台。重复调用时保留第一次的设置。
pub fn init_logging(config: &LogConfig, log_dir: &Path, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let env_filter = ["opendal=warn", "hyper=warn"]
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    let console = config.console || verbose;
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件 {:?}: {}", log_dir, e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
