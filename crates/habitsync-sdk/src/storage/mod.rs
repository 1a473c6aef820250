//! 本地存储层 - 同源持久化缓存
//!
//! LocalCache 持有每个逻辑键最后一次已知的值。无淘汰策略：
//! 这是持久存储而不是有界缓存，容量管理不在范围内。

pub mod kv;

pub use kv::KvStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 某个逻辑键在本地缓存中的完整条目
///
/// `last_updated` 由远程存储在写入时打戳，是唯一的排序信号——
/// 它不是客户端的墙钟时间。本地写入产生的条目没有时间戳。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// 本地写入产生的条目（尚未经过远程打戳）
    pub fn local(value: serde_json::Value) -> Self {
        Self {
            value,
            last_updated: None,
        }
    }

    /// 远程同步写回的条目，携带服务器时间戳
    pub fn remote(value: serde_json::Value, last_updated: DateTime<Utc>) -> Self {
        Self {
            value,
            last_updated: Some(last_updated),
        }
    }
}
