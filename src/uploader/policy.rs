//! 上传准入规则
//!
//! 提交时检查内容类型和大小，不满足条件的文件不会创建任务

use crate::uploader::error::{Result, SchedulerError};
use crate::uploader::task::SourceFile;

/// 内容类型匹配模式，如 `image/*`、`image/png`
#[derive(Debug, Clone, PartialEq, Eq)]
struct MimePattern {
    top: String,
    /// None 表示通配
    sub: Option<String>,
}

impl MimePattern {
    fn parse(pattern: &str) -> Option<Self> {
        let (top, sub) = split_mime(pattern)?;
        let sub = if sub == "*" { None } else { Some(sub) };
        if top == "*" {
            return None;
        }
        Some(Self { top, sub })
    }

    fn matches(&self, top: &str, sub: &str) -> bool {
        self.top == top && self.sub.as_deref().map_or(true, |s| s == sub)
    }
}

/// 拆分 `type/subtype`，去掉参数并转为小写
fn split_mime(value: &str) -> Option<(String, String)> {
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    let (top, sub) = essence.split_once('/')?;
    if top.is_empty() || sub.is_empty() {
        return None;
    }
    Some((top.to_string(), sub.to_string()))
}

/// 准入策略
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    accepted: Vec<MimePattern>,
    max_file_size: Option<u64>,
}

impl ContentPolicy {
    /// 根据配置创建，非法模式视为配置错误
    pub fn new(accepted: &[String], max_file_size: Option<u64>) -> Result<Self> {
        if accepted.is_empty() {
            return Err(SchedulerError::Config(
                "accepted_content_types 不能为空".to_string(),
            ));
        }

        let accepted = accepted
            .iter()
            .map(|pattern| {
                MimePattern::parse(pattern).ok_or_else(|| {
                    SchedulerError::Config(format!("无效的内容类型模式: {}", pattern))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if max_file_size == Some(0) {
            return Err(SchedulerError::Config("max_file_size 必须大于 0".to_string()));
        }

        Ok(Self {
            accepted,
            max_file_size,
        })
    }

    /// 只接受图片
    pub fn images_only() -> Self {
        Self {
            accepted: vec![MimePattern {
                top: "image".to_string(),
                sub: None,
            }],
            max_file_size: None,
        }
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// 检查文件，返回最终采用的内容类型
    ///
    /// 声明类型为空时按文件扩展名推断
    pub fn check(&self, source: &SourceFile) -> Result<String> {
        if source.filename.trim().is_empty() {
            return Err(SchedulerError::admission(&source.filename, "文件名为空"));
        }

        let content_type = if source.content_type.trim().is_empty() {
            mime_guess::from_path(&source.filename)
                .first()
                .map(|mime| mime.essence_str().to_string())
                .ok_or_else(|| SchedulerError::admission(&source.filename, "无法识别内容类型"))?
        } else {
            source.content_type.clone()
        };

        let (top, sub) = split_mime(&content_type).ok_or_else(|| {
            SchedulerError::admission(&source.filename, format!("无效的内容类型: {}", content_type))
        })?;

        if !self.accepted.iter().any(|p| p.matches(&top, &sub)) {
            return Err(SchedulerError::admission(
                &source.filename,
                format!("不支持的内容类型: {}/{}", top, sub),
            ));
        }

        if let Some(max) = self.max_file_size {
            if source.size > max {
                return Err(SchedulerError::admission(
                    &source.filename,
                    format!("文件大小 {} 超过上限 {}", source.size, max),
                ));
            }
        }

        Ok(format!("{}/{}", top, sub))
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::images_only()
    }
}
