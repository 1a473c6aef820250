//! 仅本地的远程存储 - mock 模式
//!
//! 没有可达的服务器时（纯客户端运行），"远程"操作全部转接到本地
//! 缓存，完整保留 §RemoteStore 契约（包括缺失键返回 None），上层
//! 组件不需要任何分支逻辑。
//!
//! mock 模式下只有本进程一个写入者，所以用本地时钟打时间戳仍然
//! 构成合法的全序。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{HabitSyncError, Result};
use crate::remote::RemoteStore;
use crate::storage::{CacheEntry, KvStore};

/// mock 模式远程存储
pub struct LocalOnlyRemoteStore {
    kv: Arc<KvStore>,
}

impl LocalOnlyRemoteStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// 读取条目；解析失败的缓存值按"键不存在"处理
    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.kv.get::<_, CacheEntry>(key).await {
            Ok(entry) => Ok(entry),
            Err(HabitSyncError::MalformedPayload(_)) => Ok(None),
            Err(HabitSyncError::NotConnected) => Err(HabitSyncError::Unauthorized),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteStore for LocalOnlyRemoteStore {
    async fn get_timestamps(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            let ts = self.read_entry(key).await?.and_then(|e| e.last_updated);
            result.insert(key.clone(), ts);
        }
        Ok(result)
    }

    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = self.read_entry(key).await?.map(|e| e.value);
            result.insert(key.clone(), value);
        }
        Ok(result)
    }

    async fn get_one(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_entry(key).await?.map(|e| e.value))
    }

    async fn set_one(&self, key: &str, value: &Value) -> Result<()> {
        let entry = CacheEntry::remote(value.clone(), Utc::now());
        match self.kv.set(key, &entry).await {
            Err(HabitSyncError::NotConnected) => Err(HabitSyncError::Unauthorized),
            other => other,
        }
    }
}
