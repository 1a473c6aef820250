//! SyncCoordinator - 跨键的批量对账
//!
//! 把对账摊销到所有已注册的键上，代替每个 KeyValueChannel 各自
//! 端到端轮询：定时醒来，向远程要一批键的时间戳，和上次观察到的
//! 游标做差，只批量拉取陈旧的键，写回本地缓存（绕过 Channel 自己
//! 的轮询，避免重复往返）。
//!
//! 排序只比较服务器签发的时间戳之间的先后，从不和本地墙钟比较，
//! 避免时钟偏移类 bug。游标只存在内存里，进程启动时为空——每个
//! 会话强制做一次全量对账。
//!
//! 这是一个显式构造、按引用注入的服务实例（`new()` / `init()` /
//! `stop()`），不是隐藏的模块级单例。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{SyncEvent, SyncEventBus};
use crate::remote::RemoteStore;
use crate::session::SessionSlot;
use crate::storage::{CacheEntry, KvStore};

/// 一轮同步被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 无会话凭证
    NoSession,
    /// 注册键集为空
    NoRegisteredKeys,
}

/// `perform_sync` 的结果（单飞守卫命中不是错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 本轮完成，`refreshed` 为写回本地的键数量
    Completed { refreshed: usize },
    /// 已有一轮在进行中，本次调用直接返回
    AlreadyRunning,
    Skipped(SkipReason),
}

/// 单飞守卫：无论哪条路径退出（包括错误），都会释放 in-flight 标记，
/// 协调器不会被卡死在"永远同步中"的状态
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 批量同步协调器
pub struct SyncCoordinator {
    kv: Arc<KvStore>,
    remote: Arc<dyn RemoteStore>,
    session: SessionSlot,
    /// 注册键集（会话开始时填充，登出清空）
    registered: RwLock<HashSet<String>>,
    /// 每个键上次观察到的服务器时间戳
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
    in_flight: AtomicBool,
    events: SyncEventBus,
    sync_interval: Duration,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        kv: Arc<KvStore>,
        remote: Arc<dyn RemoteStore>,
        session: SessionSlot,
        events: SyncEventBus,
        sync_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            remote,
            session,
            registered: RwLock::new(HashSet::new()),
            cursors: Mutex::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
            events,
            sync_interval,
            timer: std::sync::Mutex::new(None),
        })
    }

    /// 注册一个逻辑键（幂等）
    pub async fn register_key(&self, key: impl Into<String>) {
        let key = key.into();
        let mut registered = self.registered.write().await;
        if registered.insert(key.clone()) {
            debug!("注册同步键: {}", key);
        }
    }

    /// 取消注册（幂等）
    pub async fn unregister_key(&self, key: &str) {
        let mut registered = self.registered.write().await;
        if registered.remove(key) {
            debug!("取消注册同步键: {}", key);
        }
    }

    /// 当前注册键集的快照
    pub async fn registered_keys(&self) -> HashSet<String> {
        self.registered.read().await.clone()
    }

    /// 某个键的当前游标（主要用于诊断）
    pub async fn cursor(&self, key: &str) -> Option<DateTime<Utc>> {
        self.cursors.lock().await.get(key).copied()
    }

    /// 会话结束：清空注册键集与游标
    ///
    /// 游标按逻辑键命名，不带用户前缀；不清空的话换号登录会错误地
    /// 抑制新用户的首轮全量对账。
    pub async fn reset(&self) {
        self.registered.write().await.clear();
        self.cursors.lock().await.clear();
    }

    /// 启动定时同步（重复调用为 no-op）
    pub fn init(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            debug!("同步协调器已在运行");
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // 第一个 tick 立即完成，跳过

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(coordinator) => {
                        // 后台轮静默失败，下个周期自然重试
                        if let Err(e) = coordinator.perform_sync(false).await {
                            debug!("后台同步失败: {}", e);
                        }
                    }
                    None => break,
                }
            }
        });
        *timer = Some(handle);
        info!("✅ 同步协调器已启动: interval={:?}", interval);
    }

    /// 停止定时同步（未运行时为 no-op）
    ///
    /// 只阻止之后的调度轮；已经在途的网络请求会照常完成，其结果
    /// 落盘到调用开始时捕获的用户命名空间。
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
            info!("同步协调器已停止");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().unwrap().is_some()
    }

    /// 用户主动触发的同步；成功/失败都会发布用户可见事件
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        match self.perform_sync(true).await {
            Ok(outcome) => {
                if let SyncOutcome::Completed { refreshed } = outcome {
                    self.events.publish(SyncEvent::SyncCompleted { refreshed });
                }
                Ok(outcome)
            }
            Err(e) => {
                self.events.publish(SyncEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 执行一轮批量对账
    ///
    /// 1. 单飞守卫：已有一轮在途则立即返回
    /// 2. 无会话 / 注册键集为空则跳过
    /// 3. 批量查时间戳，和游标做差得到陈旧键集
    /// 4. 批量拉取陈旧键，写回本地缓存并推进游标
    pub async fn perform_sync(&self, immediate: bool) -> Result<SyncOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("同步已在进行中，跳过本次触发");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _guard = InFlightGuard(&self.in_flight);

        // 捕获本轮的用户命名空间；换号后迟到的落盘不会写错 Tree
        let uid = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(s) => s.user_id.clone(),
                None => return Ok(SyncOutcome::Skipped(SkipReason::NoSession)),
            }
        };

        let keys: Vec<String> = {
            let registered = self.registered.read().await;
            registered.iter().cloned().collect()
        };
        if keys.is_empty() {
            return Ok(SyncOutcome::Skipped(SkipReason::NoRegisteredKeys));
        }

        debug!(
            "开始同步: immediate={}, keys={}, user={}",
            immediate,
            keys.len(),
            uid
        );

        let timestamps = self.remote.get_timestamps(&keys).await?;

        // 陈旧 = 服务器时间戳非空，且严格晚于游标（或游标缺失）。
        // 只比较服务器签发的时间戳，从不和本地墙钟比较。
        let stale: Vec<String> = {
            let cursors = self.cursors.lock().await;
            timestamps
                .iter()
                .filter_map(|(key, ts)| {
                    let server_ts = (*ts)?;
                    let is_stale = match cursors.get(key) {
                        None => true,
                        Some(cursor) => server_ts > *cursor,
                    };
                    is_stale.then(|| key.clone())
                })
                .collect()
        };

        if stale.is_empty() {
            debug!("所有键均为最新，无需拉取");
            return Ok(SyncOutcome::Completed { refreshed: 0 });
        }

        let batch = self.remote.get_batch(&stale).await?;

        let mut refreshed = 0usize;
        let mut cursors = self.cursors.lock().await;
        for key in &stale {
            let value = match batch.get(key) {
                Some(Some(value)) => value,
                // 时间戳存在但批量拉取没给值：跳过且不推进游标，
                // 下一轮重试
                _ => continue,
            };
            let server_ts = match timestamps.get(key) {
                Some(Some(ts)) => *ts,
                _ => continue,
            };

            let entry = CacheEntry::remote(value.clone(), server_ts);
            if let Err(e) = self.kv.set_for_user(&uid, key, &entry).await {
                warn!("⚠️ 同步落盘失败: key={}, {}", key, e);
                continue;
            }

            // 游标只向前推进
            match cursors.get(key) {
                Some(cursor) if *cursor >= server_ts => {}
                _ => {
                    cursors.insert(key.clone(), server_ts);
                }
            }
            refreshed += 1;
        }

        info!("✅ 同步完成: {} 个键陈旧, {} 个键已刷新", stale.len(), refreshed);
        Ok(SyncOutcome::Completed { refreshed })
    }
}
