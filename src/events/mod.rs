//! 事件模块
//!
//! - `types.rs`: 上传任务事件类型
//! - `throttle.rs`: 进度事件节流
//! - `publisher.rs`: 基于 broadcast 的状态发布器

mod publisher;
mod throttle;
mod types;

pub use publisher::*;
pub use throttle::*;
pub use types::*;
