// 配置管理模块

use crate::events::{DEFAULT_EVENT_CAPACITY, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::uploader::{
    ContentPolicy, GeneratedKey, KeyNaming, SchedulerError, DEFAULT_MAX_CONCURRENT_UPLOADS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 调度器配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 文件夹扫描配置
    #[serde(default)]
    pub scan: ScanConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 存储键命名方式
    #[serde(default)]
    pub key_naming: KeyNaming,
    /// 存储键前缀
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// 允许的内容类型（支持 `image/*` 通配）
    #[serde(default = "default_accepted_content_types")]
    pub accepted_content_types: Vec<String>,
    /// 单个文件最大大小（字节），不设置则不限制
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// 事件通道容量
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// 调用方重试上限（调度器本身不自动重试）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_concurrent_uploads() -> usize {
    DEFAULT_MAX_CONCURRENT_UPLOADS
}

fn default_key_prefix() -> String {
    "properties".to_string()
}

fn default_accepted_content_types() -> Vec<String> {
    vec!["image/*".to_string()]
}

fn default_progress_throttle_ms() -> u64 {
    DEFAULT_THROTTLE_INTERVAL_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            key_naming: KeyNaming::default(),
            key_prefix: default_key_prefix(),
            accepted_content_types: default_accepted_content_types(),
            max_file_size: None,
            progress_throttle_ms: default_progress_throttle_ms(),
            event_capacity: default_event_capacity(),
            max_retries: default_max_retries(),
        }
    }
}

impl SchedulerConfig {
    /// 校验配置
    pub fn validate(&self) -> std::result::Result<(), SchedulerError> {
        if self.max_concurrent_uploads == 0 {
            return Err(SchedulerError::Config(
                "max_concurrent_uploads 必须大于 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SchedulerError::Config("event_capacity 必须大于 0".to_string()));
        }
        let prefix = self.key_prefix.trim_matches('/');
        if prefix.split('/').any(|segment| segment == "..") {
            return Err(SchedulerError::Config(format!(
                "key_prefix 包含非法路径: {}",
                self.key_prefix
            )));
        }
        self.content_policy().map(|_| ())
    }

    /// 构造准入策略
    pub fn content_policy(&self) -> std::result::Result<ContentPolicy, SchedulerError> {
        ContentPolicy::new(&self.accepted_content_types, self.max_file_size)
    }

    /// 构造默认的存储键生成器
    pub fn key_strategy(&self) -> GeneratedKey {
        GeneratedKey::new(self.key_naming, self.key_prefix.clone())
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 本地存储根目录
    #[serde(default = "default_storage_root")]
    pub root_dir: PathBuf,
    /// 公开访问地址前缀
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("media")
}

fn default_public_base_url() -> String {
    "http://localhost:8080/media".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// 文件夹扫描配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// 是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default = "default_skip_hidden_files")]
    pub skip_hidden_files: bool,
    /// 是否跟随符号链接
    #[serde(default)]
    pub follow_symlinks: bool,
    /// 单次最多提交的文件数
    #[serde(default)]
    pub max_files: Option<usize>,
}

fn default_skip_hidden_files() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            skip_hidden_files: default_skip_hidden_files(),
            follow_symlinks: false,
            max_files: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path.display());
        Ok(())
    }

    /// 加载配置，文件不存在或无效时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 校验所有配置项
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("scheduler 配置无效")?;

        if self.storage.public_base_url.trim().is_empty() {
            anyhow::bail!("storage.public_base_url 不能为空");
        }
        if self.storage.root_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.root_dir 不能为空");
        }
        if self.scan.max_files == Some(0) {
            anyhow::bail!("scan.max_files 必须大于 0");
        }
        if self.log.max_file_size == 0 {
            anyhow::bail!("log.max_file_size 必须大于 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.max_concurrent_uploads, 3);
        assert_eq!(config.scheduler.key_naming, KeyNaming::Uuid);
        assert_eq!(config.scheduler.accepted_content_types, vec!["image/*"]);
        assert_eq!(config.scheduler.progress_throttle(), Duration::from_millis(200));
        assert!(config.scan.skip_hidden_files);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_uploads = 5
            key_naming = "original_name"

            [storage]
            root_dir = "/srv/media"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent_uploads, 5);
        assert_eq!(config.scheduler.key_naming, KeyNaming::OriginalName);
        assert_eq!(config.scheduler.key_prefix, "properties");
        assert_eq!(config.storage.root_dir, PathBuf::from("/srv/media"));
        assert_eq!(config.storage.public_base_url, "http://localhost:8080/media");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_scheduler_config() {
        let mut config = SchedulerConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SchedulerError::Config(_))));

        config.max_concurrent_uploads = 2;
        config.accepted_content_types = vec!["not-a-mime".to_string()];
        assert!(matches!(config.validate(), Err(SchedulerError::Config(_))));

        config.accepted_content_types = vec!["image/png".to_string()];
        config.key_prefix = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.scheduler.max_concurrent_uploads = 4;
        config.scheduler.max_file_size = Some(10 * 1024 * 1024);
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.scheduler, config.scheduler);
        assert_eq!(loaded.storage, config.storage);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler]\nmax_concurrent_uploads = 0\n").unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());

        let fallback = AppConfig::load_or_default(&path).await;
        assert_eq!(fallback.scheduler.max_concurrent_uploads, 3);
    }
}
