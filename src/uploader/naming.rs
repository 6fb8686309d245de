//! 存储键生成
//!
//! 键格式：`{prefix}/{entity_id}/{name}`，不包含 `..` 且不以 `/` 开头

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use uuid::Uuid;

/// 存储键生成策略
pub trait DestinationKeyStrategy: Send + Sync {
    /// 根据房源 ID 和原始文件名生成存储键
    fn destination_key(&self, entity_id: &str, filename: &str) -> String;
}

impl<F> DestinationKeyStrategy for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn destination_key(&self, entity_id: &str, filename: &str) -> String {
        self(entity_id, filename)
    }
}

/// 内置命名方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNaming {
    /// `{prefix}/{entity}/{uuid}.{ext}`
    #[default]
    Uuid,
    /// `{prefix}/{entity}/{uuid 前 8 位}-{清理后的原文件名}`
    OriginalName,
}

/// 内置策略实现
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    naming: KeyNaming,
    prefix: String,
}

impl GeneratedKey {
    pub fn new(naming: KeyNaming, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { naming, prefix }
    }
}

impl DestinationKeyStrategy for GeneratedKey {
    fn destination_key(&self, entity_id: &str, filename: &str) -> String {
        let entity = sanitize_segment(entity_id);
        let id = Uuid::new_v4().simple().to_string();

        let name = match self.naming {
            KeyNaming::Uuid => match extension_of(filename) {
                Some(ext) => format!("{}.{}", id, ext),
                None => id,
            },
            KeyNaming::OriginalName => format!("{}-{}", &id[..8], sanitize_segment(filename)),
        };

        if self.prefix.is_empty() {
            format!("{}/{}", entity, name)
        } else {
            format!("{}/{}/{}", self.prefix, entity, name)
        }
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("静态正则表达式有效"))
}

/// 清理单个路径段：非法字符替换为 `_`，去掉首尾的点，避免出现 `..`
pub fn sanitize_segment(value: &str) -> String {
    let replaced = unsafe_chars().replace_all(value.trim(), "_");
    let collapsed = replaced.replace("..", "_");
    let trimmed = collapsed.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    let ext = sanitize_segment(&ext.to_ascii_lowercase());
    if ext == "_" {
        None
    } else {
        Some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_naming() {
        let strategy = GeneratedKey::new(KeyNaming::Uuid, "properties");
        let key = strategy.destination_key("prop-7", "Front Door.JPG");

        assert!(key.starts_with("properties/prop-7/"));
        assert!(key.ends_with(".jpg"));
        assert!(!key.contains(' '));
    }

    #[test]
    fn test_uuid_naming_is_unique() {
        let strategy = GeneratedKey::new(KeyNaming::Uuid, "properties");
        let a = strategy.destination_key("prop-7", "a.png");
        let b = strategy.destination_key("prop-7", "a.png");
        assert_ne!(a, b);
    }

    #[test]
    fn test_original_name_naming() {
        let strategy = GeneratedKey::new(KeyNaming::OriginalName, "/media/");
        let key = strategy.destination_key("prop 7", "living room (1).png");

        assert!(key.starts_with("media/prop_7/"));
        assert!(key.ends_with("-living_room_1_.png"));
    }

    #[test]
    fn test_empty_prefix() {
        let strategy = GeneratedKey::new(KeyNaming::Uuid, "");
        let key = strategy.destination_key("p1", "x");
        assert!(key.starts_with("p1/"));
        assert!(!key.contains('.'));
    }

    #[test]
    fn test_keys_cannot_escape() {
        let strategy = GeneratedKey::new(KeyNaming::OriginalName, "properties");
        let key = strategy.destination_key("../../etc", "../passwd");

        assert!(!key.contains(".."));
        assert!(!key.starts_with('/'));
    }

    #[test]
    fn test_closure_strategy() {
        let strategy = |entity: &str, filename: &str| format!("custom/{}/{}", entity, filename);
        assert_eq!(strategy.destination_key("p1", "a.png"), "custom/p1/a.png");
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("a b/c"), "a_b_c");
        assert_eq!(sanitize_segment("..."), "_");
        assert_eq!(sanitize_segment(""), "_");
        assert_eq!(sanitize_segment(".hidden.png"), "hidden.png");
    }
}
