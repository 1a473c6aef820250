//! 远程存储层 - 网络边界
//!
//! `RemoteStore` 是唯一的挂起点：按键读写、批量拉取、批量时间戳查询。
//! 除请求/响应整形外不包含任何逻辑。实现有两个：
//! - `HttpRemoteStore`：真实的认证 HTTP 服务
//! - `LocalOnlyRemoteStore`：mock 模式，全部操作转接到本地缓存
//!
//! 上层通过 `Arc<dyn RemoteStore>` 注入，不在调用点分支判断模式。

pub mod http;
pub mod local;
pub mod selector;

pub use http::HttpRemoteStore;
pub use local::LocalOnlyRemoteStore;
pub use selector::{BackendKind, BackendSelector};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// 远程存储契约
///
/// 所有操作要求持有 bearer 凭证，凭证缺失/无效以 `Unauthorized` 失败；
/// 网络错误、非 2xx、非 JSON 响应体以 `RemoteUnavailable` 失败。
/// 调用方不允许因此崩溃，只能回退到缓存数据。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 查询一批键的服务器时间戳；`None` 表示该键从未被远程写入
    async fn get_timestamps(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>>;

    /// 批量拉取一批键的值；`None` 表示远程没有该键
    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>>;

    /// 单键读取（KeyValueChannel 自己的路径）
    async fn get_one(&self, key: &str) -> Result<Option<Value>>;

    /// 单键写入；副作用：条目被打上新的服务器端时间戳
    async fn set_one(&self, key: &str, value: &Value) -> Result<()>;
}
