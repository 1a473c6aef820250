//! 后端选择器 - 初始化时一次性决定远程存储的实现
//!
//! 策略：没有配置服务器地址，或首次探测不可达，则进入 mock 模式
//! （所有"远程"操作转接本地缓存）。决定会持久化到系统级存储，
//! UI 重载不会重新探测；之后对调用方完全不可见。

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::remote::{HttpRemoteStore, LocalOnlyRemoteStore, RemoteStore};
use crate::session::SessionSlot;
use crate::storage::KvStore;

/// 持久化选择结果的系统键
const BACKEND_KIND_KEY: &str = "backend_kind";

/// 被选中的后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// 真实的 HTTP 远程存储
    Http,
    /// mock 模式：远程操作转接本地缓存
    LocalOnly,
}

impl BackendKind {
    fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::LocalOnly => "local",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "http" => Some(BackendKind::Http),
            "local" => Some(BackendKind::LocalOnly),
            _ => None,
        }
    }
}

/// 后端选择器
pub struct BackendSelector;

impl BackendSelector {
    /// 选择远程存储实现（进程内只调用一次）
    ///
    /// 返回实现和选择结果；选择结果同时持久化，下次启动直接复用。
    pub async fn select(
        kv: &Arc<KvStore>,
        server_url: Option<&str>,
        session: SessionSlot,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<(Arc<dyn RemoteStore>, BackendKind)> {
        let kind = Self::decide(kv, server_url, connect_timeout).await;

        // 持久化失败不阻塞启动，下次会重新探测
        if let Err(e) = kv.system_set(BACKEND_KIND_KEY, &kind.as_str()).await {
            warn!("⚠️ 持久化后端选择失败: {}", e);
        }

        let store: Arc<dyn RemoteStore> = match kind {
            BackendKind::Http => {
                // decide 只在 server_url 存在时返回 Http
                let url = server_url.unwrap_or_default();
                info!("✅ 远程存储后端: HTTP ({})", url);
                Arc::new(HttpRemoteStore::new(
                    url,
                    session,
                    connect_timeout,
                    request_timeout,
                )?)
            }
            BackendKind::LocalOnly => {
                info!("✅ 远程存储后端: 仅本地（mock 模式）");
                Arc::new(LocalOnlyRemoteStore::new(kv.clone()))
            }
        };

        Ok((store, kind))
    }

    async fn decide(
        kv: &Arc<KvStore>,
        server_url: Option<&str>,
        connect_timeout: Duration,
    ) -> BackendKind {
        let url = match server_url {
            Some(url) if !url.is_empty() => url,
            _ => return BackendKind::LocalOnly,
        };

        // 已持久化的决定优先，避免每次重载都探测
        match kv.system_get::<String>(BACKEND_KIND_KEY).await {
            Ok(Some(saved)) => {
                if let Some(kind) = BackendKind::from_str(&saved) {
                    info!("复用已持久化的后端选择: {}", saved);
                    return kind;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️ 读取后端选择失败，重新探测: {}", e),
        }

        if Self::probe(url, connect_timeout).await {
            BackendKind::Http
        } else {
            warn!("⚠️ 服务器不可达，进入 mock 模式: {}", url);
            BackendKind::LocalOnly
        }
    }

    /// 可达性探测：收到任何 HTTP 响应（包括 401）都算可达，
    /// 只有连接层失败才判定为无服务器环境
    async fn probe(base_url: &str, connect_timeout: Duration) -> bool {
        let client = match reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout)
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };

        let url = format!("{}/api/auth/user", base_url.trim_end_matches('/'));
        client.get(&url).send().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::new_session_slot;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_no_server_url_selects_local_only() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());

        let (_store, kind) = BackendSelector::select(
            &kv,
            None,
            new_session_slot(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert_eq!(kind, BackendKind::LocalOnly);
    }

    #[tokio::test]
    async fn test_unreachable_server_selects_local_only_and_sticks() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());

        let (_store, kind) = BackendSelector::select(
            &kv,
            Some("http://127.0.0.1:1"),
            new_session_slot(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(kind, BackendKind::LocalOnly);

        // 决定已持久化
        let saved: Option<String> = kv.system_get(BACKEND_KIND_KEY).await.unwrap();
        assert_eq!(saved.as_deref(), Some("local"));

        // 第二次选择不再探测，直接复用
        let (_store, kind) = BackendSelector::select(
            &kv,
            Some("http://127.0.0.1:1"),
            new_session_slot(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(kind, BackendKind::LocalOnly);
    }
}
