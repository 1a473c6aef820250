//! HTTP 远程存储 - 认证数据服务的客户端
//!
//! 使用 reqwest 作为底层 HTTP 客户端，所有请求带 bearer token。
//! 错误映射规则：401 -> Unauthorized；其它非 2xx 或非 JSON 响应体
//! -> RemoteUnavailable（调用方只回退缓存，从不崩溃）。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HabitSyncError, Result};
use crate::remote::RemoteStore;
use crate::session::SessionSlot;

/// GET /api/data/:key 的响应条目（响应体可能整体为 null）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataEnvelope {
    value: Value,
    #[serde(default)]
    #[allow(dead_code)]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct KeysRequest<'a> {
    keys: &'a [String],
}

#[derive(Debug, Serialize)]
struct SetValueRequest<'a> {
    value: &'a Value,
}

/// HTTP 远程存储客户端
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    session: SessionSlot,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: &str,
        session: SessionSlot,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| HabitSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    /// 读取当前会话的 bearer token；无会话 -> Unauthorized
    async fn bearer_token(&self) -> Result<String> {
        let session = self.session.read().await;
        session
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or(HabitSyncError::Unauthorized)
    }

    fn data_url(&self, key: &str) -> String {
        format!("{}/api/data/{}", self.base_url, key)
    }

    /// 统一处理响应状态并解析 JSON 响应体
    async fn parse_response<T>(response: reqwest::Response) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(HabitSyncError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HabitSyncError::RemoteUnavailable(format!(
                "HTTP 状态码: {} ({})",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("解析响应失败: {}", e)))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get_timestamps(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        let token = self.bearer_token().await?;
        let url = format!("{}/api/data/sync/timestamps", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&KeysRequest { keys })
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("时间戳查询失败: {}", e)))?;

        Self::parse_response(response).await
    }

    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let token = self.bearer_token().await?;
        let url = format!("{}/api/data/sync/batch", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&KeysRequest { keys })
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("批量拉取失败: {}", e)))?;

        Self::parse_response(response).await
    }

    async fn get_one(&self, key: &str) -> Result<Option<Value>> {
        let token = self.bearer_token().await?;

        let response = self
            .client
            .get(self.data_url(key))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("单键读取失败: {}", e)))?;

        let envelope: Option<DataEnvelope> = Self::parse_response(response).await?;
        Ok(envelope.map(|e| e.value))
    }

    async fn set_one(&self, key: &str, value: &Value) -> Result<()> {
        let token = self.bearer_token().await?;

        let response = self
            .client
            .post(self.data_url(key))
            .bearer_auth(token)
            .json(&SetValueRequest { value })
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("单键写入失败: {}", e)))?;

        // 只关心状态码，{"success": true} 响应体不含有用信息
        let _: Value = Self::parse_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{new_session_slot, UserSession};

    #[tokio::test]
    async fn test_missing_session_fails_unauthorized_without_network() {
        // 无会话时任何操作都不应发出网络请求，直接 Unauthorized
        let slot = new_session_slot();
        let store = HttpRemoteStore::new(
            "http://127.0.0.1:1", // 不可达地址，若真的发请求会得到 RemoteUnavailable
            slot.clone(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = store.get_one("habits").await.unwrap_err();
        assert!(matches!(err, HabitSyncError::Unauthorized));

        let err = store
            .get_timestamps(&["habits".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, HabitSyncError::Unauthorized));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_remote_unavailable() {
        let slot = new_session_slot();
        *slot.write().await = Some(UserSession::new("u1", "token"));

        let store = HttpRemoteStore::new(
            "http://127.0.0.1:1",
            slot,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = store.get_one("habits").await.unwrap_err();
        assert!(matches!(err, HabitSyncError::RemoteUnavailable(_)));
    }
}
