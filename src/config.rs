//! 应用配置模块

use crate::core::SyncConfig;
use crate::digest::{PartSizePolicy, MIB};
use crate::logging::LogConfig;
use crate::storage::StorageConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 传输配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 上传时使用的分段大小，也是校验时首先尝试的段大小
    #[serde(default = "default_upload_part_size")]
    pub default_upload_part_size: i64,
    /// 其它客户端可能使用的段大小；0 或负数表示允许按文件大小推测
    #[serde(default = "default_available_part_sizes")]
    pub available_part_sizes: Vec<i64>,
    /// 摘要校验的读取缓冲区大小（字节）
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_upload_part_size() -> i64 {
    8 * MIB as i64
}

fn default_available_part_sizes() -> Vec<i64> {
    PartSizePolicy::default().available_part_sizes
}

fn default_read_buffer_size() -> usize {
    MIB as usize
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_upload_part_size: default_upload_part_size(),
            available_part_sizes: default_available_part_sizes(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl From<&TransferConfig> for SyncConfig {
    fn from(transfer: &TransferConfig) -> Self {
        Self {
            part_sizes: PartSizePolicy {
                default_part_size: transfer.default_upload_part_size,
                available_part_sizes: transfer.available_part_sizes.clone(),
            },
            read_buffer_size: transfer.read_buffer_size.max(1),
        }
    }
}

/// config.json 的完整内容，缺失的部分使用默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从配置文件加载；文件不存在时返回默认配置
    pub fn load(config_file: &Path) -> anyhow::Result<Self> {
        if !config_file.exists() {
            tracing::debug!("配置文件不存在，使用默认配置: {:?}", config_file);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_file)
            .with_context(|| format!("读取配置文件失败: {:?}", config_file))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", config_file))?;
        Ok(config)
    }

    /// 保存配置，保留文件中本模块不认识的其它字段
    pub fn save(&self, config_file: &Path) -> anyhow::Result<()> {
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        let ours = serde_json::to_value(self)?;
        if let (Some(target), Some(source)) = (config.as_object_mut(), ours.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        } else {
            config = ours;
        }

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&config)?;
        fs::write(config_file, content)
            .with_context(|| format!("写入配置文件失败: {:?}", config_file))?;
        Ok(())
    }

    /// 默认配置文件位置
    pub fn default_path() -> PathBuf {
        crate::logging::get_log_dir().join(CONFIG_FILE_NAME)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::from(&self.transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageType;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.transfer.default_upload_part_size, 8 * 1024 * 1024);
        assert!(config.sync_config().part_sizes.allows_guessing());
    }

    #[test]
    fn test_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "storage": {"type": "s3", "bucket": "b", "readOnly": true},
                "transfer": {"availablePartSizes": [15728640]}
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.storage.typ, StorageType::S3);
        assert!(config.storage.read_only);
        assert_eq!(config.transfer.available_part_sizes, vec![15 * 1024 * 1024]);
        assert_eq!(config.transfer.read_buffer_size, 1024 * 1024);
        assert!(!config.sync_config().part_sizes.allows_guessing());
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_save_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"extra": 1}"#).unwrap();

        let mut config = AppConfig::default();
        config.log.level = "debug".to_string();
        config.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["extra"], 1);
        assert_eq!(raw["log"]["level"], "debug");
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
