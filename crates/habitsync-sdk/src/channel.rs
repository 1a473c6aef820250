//! KeyValueChannel - 单个逻辑键的响应式状态
//!
//! 每个逻辑键、每个消费者一个实例，向 UI 暴露一对读/写接口，背后
//! 透明地由本地缓存 + 远程存储支撑：
//! - 挂载时立即从本地缓存取值（同步可见，不等网络），并发地向远程
//!   发起单键读取；远程取到非空值则覆盖缓存值——跨会话的缓存可能
//!   任意陈旧，开机时远程是权威
//! - 写入是乐观的：先更新暴露值，再落本地缓存，最后 fire-and-forget
//!   地复制到远程；远程失败只进入错误侧信道，本地写入不回滚
//! - 固定节奏轮询远程，吸收外部变更；比较用的是结构化 JSON 相等，
//!   不是时间戳（本地直写在往返完成前没有服务器时间戳可比）
//! - 无会话时完全跳过轮询

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{HabitSyncError, Result};
use crate::remote::RemoteStore;
use crate::session::SessionSlot;
use crate::storage::{CacheEntry, KvStore};

/// 写入操作：字面值，或基于旧值的函数式更新
pub enum WriteOp {
    Set(Value),
    Update(Box<dyn FnOnce(&Value) -> Value + Send>),
}

/// 单个逻辑键的读/写通道
pub struct KeyValueChannel {
    key: String,
    kv: Arc<KvStore>,
    remote: Arc<dyn RemoteStore>,
    session: SessionSlot,
    value_tx: watch::Sender<Value>,
    error_tx: watch::Sender<Option<String>>,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KeyValueChannel {
    /// 打开一个键的通道
    ///
    /// 本地缓存读取同步完成；远程校对与后续轮询在后台任务里进行，
    /// 任何网络失败都不会阻塞或打断调用方。
    pub async fn open(
        key: impl Into<String>,
        initial_value: Value,
        kv: Arc<KvStore>,
        remote: Arc<dyn RemoteStore>,
        session: SessionSlot,
        poll_interval: Duration,
    ) -> Result<Arc<Self>> {
        let key = key.into();

        // 解析失败的缓存值按"键不存在"处理，重新播种初始值
        let cached = match kv.get::<_, CacheEntry>(&key).await {
            Ok(entry) => entry.map(|e| e.value),
            Err(HabitSyncError::MalformedPayload(e)) => {
                warn!("⚠️ 缓存值损坏，重新播种: key={}, {}", key, e);
                None
            }
            Err(e) => return Err(e),
        };

        let seeded = cached.is_none();
        let current = cached.unwrap_or(initial_value);
        if seeded {
            kv.set(&key, &CacheEntry::local(current.clone())).await?;
        }

        let (value_tx, _) = watch::channel(current);
        let (error_tx, _) = watch::channel(None);

        let channel = Arc::new(Self {
            key,
            kv,
            remote,
            session,
            value_tx,
            error_tx,
            poll_task: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&channel);
        let handle = tokio::spawn(async move {
            if let Some(chan) = weak.upgrade() {
                chan.initial_reconcile(seeded).await;
            }

            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // 第一个 tick 立即完成，跳过

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(chan) => chan.poll_once().await,
                    None => break,
                }
            }
        });
        *channel.poll_task.lock().unwrap() = Some(handle);

        Ok(channel)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 当前暴露值
    pub fn value(&self) -> Value {
        self.value_tx.borrow().clone()
    }

    /// 订阅值变化
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.value_tx.subscribe()
    }

    /// 错误侧信道：最近一次远程复制失败（成功后清空）
    ///
    /// 功能状态（当前值）不受错误影响，调用方可以把它渲染成提示。
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.error_tx.subscribe()
    }

    /// 写入新值
    ///
    /// 顺序：计算新值 -> 更新暴露值 -> 写本地缓存 -> fire-and-forget
    /// 复制到远程。同一消费者随后的读取保证看到本次写入
    /// （read-your-writes）；远程失败不回滚本地。
    pub async fn write(&self, op: WriteOp) -> Result<()> {
        let new_value = match op {
            WriteOp::Set(value) => value,
            WriteOp::Update(f) => {
                let previous = self.value_tx.borrow().clone();
                f(&previous)
            }
        };

        self.value_tx.send_replace(new_value.clone());
        self.kv
            .set(&self.key, &CacheEntry::local(new_value.clone()))
            .await?;

        let remote = self.remote.clone();
        let key = self.key.clone();
        let error_tx = self.error_tx.clone();
        tokio::spawn(async move {
            match remote.set_one(&key, &new_value).await {
                Ok(()) => {
                    error_tx.send_replace(None);
                }
                Err(e) => {
                    warn!("⚠️ 远程写入失败（本地已保存）: key={}, {}", key, e);
                    error_tx.send_replace(Some(e.to_string()));
                }
            }
        });

        Ok(())
    }

    /// 写入字面值
    pub async fn set(&self, value: Value) -> Result<()> {
        self.write(WriteOp::Set(value)).await
    }

    /// 基于旧值的函数式更新
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        self.write(WriteOp::Update(Box::new(f))).await
    }

    /// 停止后台轮询（已停止时为 no-op）
    pub fn stop(&self) {
        if let Some(handle) = self.poll_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// 挂载后的远程校对：远程非空值覆盖本地，失败静默保留缓存值
    async fn initial_reconcile(&self, seeded: bool) {
        match self.remote.get_one(&self.key).await {
            Ok(Some(remote_value)) => {
                if remote_value != *self.value_tx.borrow() {
                    debug!("远程值覆盖启动缓存: key={}", self.key);
                    self.adopt_remote_value(remote_value).await;
                }
            }
            Ok(None) => {
                // 远程也没有历史：把初始值播种上去，保证后续对账
                // 看到的是基线而不是 null
                if seeded {
                    let value = self.value_tx.borrow().clone();
                    if let Err(e) = self.remote.set_one(&self.key, &value).await {
                        debug!("初始值播种远程失败: key={}, {}", self.key, e);
                    }
                }
            }
            Err(e) => {
                debug!("启动校对失败，保留缓存值: key={}, {}", self.key, e);
            }
        }
    }

    /// 定时轮询：仅当远程值与当前暴露值结构化不等时替换
    async fn poll_once(&self) {
        if self.session.read().await.is_none() {
            return;
        }

        match self.remote.get_one(&self.key).await {
            Ok(Some(remote_value)) => {
                if remote_value != *self.value_tx.borrow() {
                    debug!("轮询到外部变更: key={}", self.key);
                    self.adopt_remote_value(remote_value).await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                // 后台失败静默，下个周期自然重试
                debug!("轮询失败: key={}, {}", self.key, e);
            }
        }
    }

    async fn adopt_remote_value(&self, value: Value) {
        self.value_tx.send_replace(value.clone());
        if let Err(e) = self.kv.set(&self.key, &CacheEntry::local(value)).await {
            warn!("⚠️ 回写本地缓存失败: key={}, {}", self.key, e);
        }
    }
}

impl Drop for KeyValueChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
