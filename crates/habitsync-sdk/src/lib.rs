//! HabitSync SDK - 习惯/任务数据的客户端同步引擎
//!
//! 本 SDK 把多个独立命名的 JSON 状态键在三处之间保持一致：
//! - 🧠 内存视图（UI 直接读写，永不阻塞）
//! - 💾 同源持久化缓存（sled，按用户命名空间隔离）
//! - 📡 远程权威存储（间歇可达、需要认证的 HTTP 服务）
//!
//! 核心能力：
//! - ✍️ 乐观写入：本地立即生效，远程后台复制，失败不回滚
//! - 🔄 批量对账：按服务器时间戳差异只拉取陈旧键，最小化流量
//! - 🔌 离线降级：无网络/无会话时全部落本地，数据"陈旧但可用"
//! - 🎭 mock 模式：无服务器环境下"远程"操作透明转接本地缓存
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use habitsync_sdk::{HabitSyncSDK, SyncConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .server_url("https://tracker.example.com")
//!         .build();
//!
//!     // 初始化并登录
//!     let sdk = HabitSyncSDK::initialize(config).await?;
//!     sdk.connect("alice", "secret").await?;
//!
//!     // 打开一个逻辑键的通道，乐观写入
//!     let habits = sdk.channel("habit_list", json!([])).await?;
//!     habits.set(json!(["run", "read"])).await?;
//!     assert_eq!(habits.value(), json!(["run", "read"]));
//!
//!     // 用户主动触发一次批量同步
//!     sdk.sync_now().await?;
//!
//!     // 关闭 SDK
//!     sdk.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod remote;
pub mod sdk;
pub mod session;
pub mod storage;

// 重新导出核心类型，方便使用
pub use channel::{KeyValueChannel, WriteOp};
pub use coordinator::{SkipReason, SyncCoordinator, SyncOutcome};
pub use error::{HabitSyncError, Result};
pub use events::{SyncEvent, SyncEventBus};
pub use remote::{
    BackendKind, BackendSelector, HttpRemoteStore, LocalOnlyRemoteStore, RemoteStore,
};
pub use sdk::{HabitSyncSDK, SyncConfig, SyncConfigBuilder};
pub use session::{AuthClient, SessionSlot, UserSession};
pub use storage::{CacheEntry, KvStore};
