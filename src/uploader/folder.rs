//! 文件夹扫描模块
//!
//! 负责:
//! - 递归扫描本地文件夹中的图片
//! - 按相对路径排序，保证批次内的提交顺序稳定
//! - 转换为调度器可接受的源文件列表

use crate::config::ScanConfig;
use crate::uploader::policy::ContentPolicy;
use crate::uploader::task::SourceFile;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 文件扫描结果
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对于扫描根目录的路径
    pub relative_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
}

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
    /// 最大文件数量，超过此数量将停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

impl ScanOptions {
    /// 由扫描配置和调度器的文件大小上限组合而成
    pub fn from_config(scan: &ScanConfig, max_file_size: Option<u64>) -> Self {
        Self {
            follow_symlinks: scan.follow_symlinks,
            max_file_size,
            max_files: scan.max_files,
            skip_hidden: scan.skip_hidden_files,
        }
    }
}

/// 文件夹扫描器
///
/// 只收集准入策略接受的文件，其余文件跳过而不是让整批被拒绝
pub struct FolderScanner {
    options: ScanOptions,
    policy: ContentPolicy,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::with_options(ScanOptions::default(), ContentPolicy::images_only())
    }

    pub fn with_options(options: ScanOptions, policy: ContentPolicy) -> Self {
        Self { options, policy }
    }

    /// 递归扫描文件夹，结果按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| entry.depth() == 0 || !(skip_hidden && is_hidden(entry)));

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("读取目录条目失败: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let size = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", path.display()))?
                .len();

            if let Some(max_size) = self.options.max_file_size {
                if size > max_size {
                    warn!("跳过超大文件: {} ({})", path.display(), format_bytes(size));
                    continue;
                }
            }

            if !self.accepts(path, size) {
                debug!("跳过不支持的文件: {}", path.display());
                continue;
            }

            let relative_path = path
                .strip_prefix(root_path)
                .with_context(|| {
                    format!(
                        "计算相对路径失败: {} (root: {})",
                        path.display(),
                        root_path.display()
                    )
                })?
                .to_path_buf();

            debug!(
                "扫描到文件: {} ({})",
                relative_path.display(),
                format_bytes(size)
            );

            files.push(ScannedFile {
                local_path: path.to_path_buf(),
                relative_path,
                size,
            });

            if let Some(max_files) = self.options.max_files {
                if files.len() >= max_files {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                    break;
                }
            }
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_bytes(files.iter().map(|f| f.size).sum())
        );

        Ok(files)
    }

    /// 扫描并转换为源文件列表
    pub async fn scan_sources<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<SourceFile>> {
        let files = self.scan(root_path)?;
        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            let source = SourceFile::from_path(&file.local_path)
                .await
                .with_context(|| format!("读取文件失败: {}", file.local_path.display()))?;
            sources.push(source);
        }
        Ok(sources)
    }

    fn accepts(&self, path: &Path, size: u64) -> bool {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let candidate = SourceFile::from_bytes(filename, "", Vec::new());
        let candidate = SourceFile { size, ..candidate };
        self.policy.check(&candidate).is_ok()
    }
}

impl Default for FolderScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
