//! 统一 SDK 接口 - HabitSyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! HabitSyncSDK (装配与会话层)
//!   ├── KvStore (本地持久化缓存)
//!   ├── RemoteStore (HTTP 或 mock，启动时一次性选定)
//!   ├── SyncCoordinator (批量对账)
//!   ├── KeyValueChannel (按键的响应式读写)
//!   └── SyncEventBus (用户可见的同步通知)
//! ```
//!
//! 设计原则：
//! - 异步优先：主要 API 使用 async/await
//! - 显式生命周期：`initialize()` / `shutdown()`，组件按引用注入
//! - 离线可用：没有会话或网络时全部降级为本地缓存，UI 永不阻塞

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::channel::KeyValueChannel;
use crate::coordinator::{SyncCoordinator, SyncOutcome};
use crate::error::{HabitSyncError, Result};
use crate::events::{SyncEvent, SyncEventBus};
use crate::remote::{BackendKind, BackendSelector, RemoteStore};
use crate::session::{
    new_session_slot, AuthClient, SessionSlot, UserSession, FALLBACK_USER_ID,
};
use crate::storage::KvStore;

/// HabitSync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 数据服务基础 URL；None 表示纯客户端运行（mock 模式）
    pub server_url: Option<String>,
    /// KeyValueChannel 轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// SyncCoordinator 批量对账间隔（秒）
    pub sync_interval_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_url: None,
            poll_interval_secs: 30,
            sync_interval_secs: 30,
            connect_timeout_secs: 5,
            request_timeout_secs: 15,
            event_buffer_size: 64,
        }
    }
}

/// 获取默认数据目录 ~/.habitsync/
fn default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".habitsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".habitsync")
    } else {
        PathBuf::from("./habitsync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HabitSync SDK 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server_url = Some(url.into());
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs;
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync_interval_secs = secs;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// HabitSync SDK 主入口
pub struct HabitSyncSDK {
    config: SyncConfig,
    kv: Arc<KvStore>,
    remote: Arc<dyn RemoteStore>,
    backend_kind: BackendKind,
    session: SessionSlot,
    events: SyncEventBus,
    coordinator: Arc<SyncCoordinator>,
    auth: Option<AuthClient>,
}

impl HabitSyncSDK {
    /// 初始化 SDK
    ///
    /// 打开本地存储、一次性选定远程后端、装配协调器。mock 模式下
    /// 直接安装占位会话并启动定时同步（没有登录环节）。
    pub async fn initialize(config: SyncConfig) -> Result<Arc<Self>> {
        info!("🚀 初始化 HabitSync SDK: data_dir={}", config.data_dir.display());

        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        let session = new_session_slot();

        let (remote, backend_kind) = BackendSelector::select(
            &kv,
            config.server_url.as_deref(),
            session.clone(),
            config.connect_timeout(),
            config.request_timeout(),
        )
        .await?;

        let events = SyncEventBus::new(config.event_buffer_size);
        let coordinator = SyncCoordinator::new(
            kv.clone(),
            remote.clone(),
            session.clone(),
            events.clone(),
            config.sync_interval(),
        );

        let auth = match backend_kind {
            BackendKind::Http => {
                let url = config
                    .server_url
                    .as_deref()
                    .ok_or_else(|| HabitSyncError::Config("HTTP 后端缺少 server_url".to_string()))?;
                Some(AuthClient::new(url, config.request_timeout())?)
            }
            BackendKind::LocalOnly => None,
        };

        let sdk = Arc::new(Self {
            config,
            kv,
            remote,
            backend_kind,
            session,
            events,
            coordinator,
            auth,
        });

        if sdk.backend_kind == BackendKind::LocalOnly {
            sdk.install_session(UserSession::new(FALLBACK_USER_ID, ""))
                .await?;
        }

        Ok(sdk)
    }

    /// 登录并开启同步
    pub async fn connect(&self, username: &str, password: &str) -> Result<UserSession> {
        let auth = self.auth_client()?;
        let session = auth.login(username, password).await?;
        self.install_session(session.clone()).await?;
        Ok(session)
    }

    /// 注册新账号并开启同步
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<UserSession> {
        let auth = self.auth_client()?;
        let session = auth.register(username, password, email).await?;
        self.install_session(session.clone()).await?;
        Ok(session)
    }

    /// 用已保存的 token 恢复会话
    pub async fn resume(&self, token: &str) -> Result<UserSession> {
        let auth = self.auth_client()?;
        let session = auth.resume(token).await?;
        self.install_session(session.clone()).await?;
        Ok(session)
    }

    /// 登出：停止调度、清空注册键集与游标、丢弃会话
    ///
    /// 已在途的请求不做取消，其落盘命名空间在发起时已捕获。
    pub async fn logout(&self) {
        self.coordinator.stop();
        self.coordinator.reset().await;
        *self.session.write().await = None;
        self.kv.detach_user().await;
        info!("已登出，写入降级为仅本地");
    }

    /// 打开一个逻辑键的读写通道，并把它纳入批量对账
    pub async fn channel(
        &self,
        key: impl Into<String>,
        initial_value: Value,
    ) -> Result<Arc<KeyValueChannel>> {
        let key = key.into();
        let channel = KeyValueChannel::open(
            key.clone(),
            initial_value,
            self.kv.clone(),
            self.remote.clone(),
            self.session.clone(),
            self.config.poll_interval(),
        )
        .await?;
        self.coordinator.register_key(key).await;
        Ok(channel)
    }

    /// 用户主动触发一次同步（结果会通过事件总线通知）
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.coordinator.sync_now().await
    }

    /// 订阅同步事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 清空当前用户的全部本地数据（"重置所有数据"）
    pub async fn reset_user_data(&self) -> Result<()> {
        let uid = self
            .kv
            .current_user()
            .await
            .ok_or(HabitSyncError::NotConnected)?;
        self.coordinator.reset().await;
        self.kv.cleanup_user_data(&uid).await?;
        self.kv.switch_user(&uid).await?;
        info!("✅ 用户数据已重置: {}", uid);
        Ok(())
    }

    /// 关闭 SDK：尝试最后一轮 best-effort 同步，停止调度并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.coordinator.perform_sync(false).await {
            warn!("⚠️ 关闭前的最后一轮同步失败: {}", e);
        }
        self.coordinator.stop();
        self.kv.flush().await?;
        info!("✅ HabitSync SDK 已关闭");
        Ok(())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn cache(&self) -> &Arc<KvStore> {
        &self.kv
    }

    /// 当前会话快照
    pub async fn session(&self) -> Option<UserSession> {
        self.session.read().await.clone()
    }

    fn auth_client(&self) -> Result<&AuthClient> {
        self.auth.as_ref().ok_or_else(|| {
            HabitSyncError::Config("mock 模式没有认证服务，无需登录".to_string())
        })
    }

    async fn install_session(&self, session: UserSession) -> Result<()> {
        self.kv.switch_user(&session.user_id).await?;
        *self.session.write().await = Some(session);
        self.coordinator.init();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn local_sdk(temp_dir: &TempDir) -> Arc<HabitSyncSDK> {
        let config = SyncConfig::builder()
            .data_dir(temp_dir.path())
            .poll_interval_secs(3600)
            .sync_interval_secs(3600)
            .build();
        HabitSyncSDK::initialize(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_without_server_enters_mock_mode() {
        let temp_dir = TempDir::new().unwrap();
        let sdk = local_sdk(&temp_dir).await;

        assert_eq!(sdk.backend_kind(), BackendKind::LocalOnly);

        // mock 模式自动安装占位会话
        let session = sdk.session().await.unwrap();
        assert_eq!(session.user_id, FALLBACK_USER_ID);
        assert!(sdk.coordinator().is_running());

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_write_and_sync_roundtrip_in_mock_mode() {
        let temp_dir = TempDir::new().unwrap();
        let sdk = local_sdk(&temp_dir).await;

        let habits = sdk.channel("habit_list", json!([])).await.unwrap();
        habits.set(json!(["run", "read"])).await.unwrap();
        assert_eq!(habits.value(), json!(["run", "read"]));

        // 等 fire-and-forget 的远程复制（mock 落在本地）打上时间戳
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // 用户触发同步：habit_list 的游标缺失，被视为陈旧并刷新
        let outcome = sdk.sync_now().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Completed { refreshed: 1 });

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected_in_mock_mode() {
        let temp_dir = TempDir::new().unwrap();
        let sdk = local_sdk(&temp_dir).await;

        let err = sdk.connect("alice", "secret").await.unwrap_err();
        assert!(matches!(err, HabitSyncError::Config(_)));

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_user_data_clears_cache() {
        let temp_dir = TempDir::new().unwrap();
        let sdk = local_sdk(&temp_dir).await;

        let habits = sdk.channel("habit_list", json!([])).await.unwrap();
        habits.set(json!(["run"])).await.unwrap();

        sdk.reset_user_data().await.unwrap();

        let entry: Option<crate::storage::CacheEntry> =
            sdk.cache().get("habit_list").await.unwrap();
        assert!(entry.is_none());

        sdk.shutdown().await.unwrap();
    }
}
