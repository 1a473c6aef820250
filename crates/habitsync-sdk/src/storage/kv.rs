//! KV 存储模块 - 基于 sled 的持久化键值存储
//!
//! 本模块提供：
//! - 逻辑键 -> CacheEntry 的持久化存储
//! - 用户隔离的命名空间（每个用户一棵独立的 Tree，
//!   切换账号不会交叉污染数据）
//! - 与用户无关的系统级配置存储（后端选择等）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{HabitSyncError, Result};

/// 系统级 Tree 名称（不属于任何用户）
const SYSTEM_TREE: &str = "system";

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 用户专属的 Tree 实例
    user_trees: Arc<RwLock<HashMap<String, Tree>>>,
    /// 当前用户ID
    current_user: Arc<RwLock<Option<String>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| HabitSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（切换账号后旧实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            HabitSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            user_trees: Arc::new(RwLock::new(HashMap::new())),
            current_user: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 初始化用户 Tree
    pub async fn init_user_tree(&self, uid: &str) -> Result<()> {
        let tree = self.open_user_tree(uid)?;

        let mut user_trees = self.user_trees.write().await;
        user_trees.insert(uid.to_string(), tree);

        tracing::info!("用户 KV Tree 初始化完成: {}", uid);

        Ok(())
    }

    /// 切换用户
    pub async fn switch_user(&self, uid: &str) -> Result<()> {
        let user_trees = self.user_trees.read().await;
        if !user_trees.contains_key(uid) {
            drop(user_trees);
            self.init_user_tree(uid).await?;
        }

        let mut current_user = self.current_user.write().await;
        *current_user = Some(uid.to_string());

        Ok(())
    }

    /// 退出登录，解除当前用户绑定（数据保留在磁盘上）
    pub async fn detach_user(&self) {
        let mut current_user = self.current_user.write().await;
        *current_user = None;
    }

    /// 当前登录用户
    pub async fn current_user(&self) -> Option<String> {
        self.current_user.read().await.clone()
    }

    /// 清理用户数据（"重置所有数据"入口）
    pub async fn cleanup_user_data(&self, uid: &str) -> Result<()> {
        let mut user_trees = self.user_trees.write().await;
        user_trees.remove(uid);

        let tree_name = format!("user_{}", uid);
        self.db
            .drop_tree(&tree_name)
            .map_err(|e| HabitSyncError::KvStore(format!("删除用户 Tree 失败: {}", e)))?;

        Ok(())
    }

    fn open_user_tree(&self, uid: &str) -> Result<Tree> {
        let tree_name = format!("user_{}", uid);
        self.db
            .open_tree(&tree_name)
            .map_err(|e| HabitSyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))
    }

    /// 获取当前用户的 Tree
    async fn get_current_tree(&self) -> Result<Tree> {
        let current_user = self.current_user.read().await;
        let uid = current_user
            .as_ref()
            .ok_or(HabitSyncError::NotConnected)?;

        let user_trees = self.user_trees.read().await;
        let tree = user_trees
            .get(uid)
            .ok_or_else(|| HabitSyncError::KvStore("用户 Tree 不存在".to_string()))?;

        Ok(tree.clone())
    }

    /// 设置键值对（当前用户命名空间）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.get_current_tree().await?;
        Self::tree_set(&tree, key, value)
    }

    /// 获取键值对（当前用户命名空间）
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.get_current_tree().await?;
        Self::tree_get(&tree, key)
    }

    /// 删除键值对（当前用户命名空间）
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.get_current_tree().await?;

        let result = tree
            .remove(key)
            .map_err(|e| HabitSyncError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.map(|v| v.to_vec()))
    }

    /// 检查键是否存在（当前用户命名空间）
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.get_current_tree().await?;

        tree.contains_key(key)
            .map_err(|e| HabitSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 向指定用户的命名空间写入键值对
    ///
    /// 同步协调器在一轮同步开始时捕获 user_id，落盘时用这里而不是
    /// "当前用户"——登出/换号后迟到的网络响应不会写进别人的 Tree。
    pub async fn set_for_user<K, V>(&self, uid: &str, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.open_user_tree(uid)?;
        Self::tree_set(&tree, key, value)
    }

    /// 设置系统级配置项（与用户无关）
    pub async fn system_set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let tree = self
            .db
            .open_tree(SYSTEM_TREE)
            .map_err(|e| HabitSyncError::KvStore(format!("打开系统 Tree 失败: {}", e)))?;
        Self::tree_set(&tree, key, value)
    }

    /// 读取系统级配置项
    pub async fn system_get<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self
            .db
            .open_tree(SYSTEM_TREE)
            .map_err(|e| HabitSyncError::KvStore(format!("打开系统 Tree 失败: {}", e)))?;
        Self::tree_get(&tree, key)
    }

    /// 刷盘（进程退出前的 best-effort 持久化）
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| HabitSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    fn tree_set<K, V>(tree: &Tree, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| HabitSyncError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| HabitSyncError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    fn tree_get<K, V>(tree: &Tree, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = tree
            .get(key)
            .map_err(|e| HabitSyncError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| HabitSyncError::MalformedPayload(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
