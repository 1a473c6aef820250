//! 会话与认证模块
//!
//! 同步引擎把会话当作一种能力（capability）：持有有效 token 才允许
//! 远程调用，没有会话时所有写入降级为仅本地缓存。token 本身对引擎
//! 是不透明的，只透传给 HTTP 层；唯一的例外是 best-effort 地从
//! JWT 形状的 token 里解出用户 ID 用于缓存命名空间（解析失败时
//! 回退到固定占位符，这是务实的默认值，不是安全边界）。

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{HabitSyncError, Result};

/// JWT 解析失败时的占位用户 ID（纯本地模式也使用它）
pub const FALLBACK_USER_ID: &str = "local_user";

/// 用户会话信息
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: String,
    pub token: String,
    pub login_time: chrono::DateTime<chrono::Utc>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            login_time: chrono::Utc::now(),
        }
    }
}

/// 进程内共享的会话槽位
///
/// Channel / Coordinator / RemoteStore 都持有同一个槽位的引用，
/// 登录写入、登出清空，各组件在每次远程调用前读取。
pub type SessionSlot = Arc<RwLock<Option<UserSession>>>;

pub fn new_session_slot() -> SessionSlot {
    Arc::new(RwLock::new(None))
}

/// 认证接口的通用响应体
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub user: Option<serde_json::Value>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

/// 认证 HTTP 客户端 - 薄封装，只负责 token 的获取与校验
pub struct AuthClient {
    client: Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HabitSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 登录，成功后返回包含 token 的会话
    pub async fn login(&self, username: &str, password: &str) -> Result<UserSession> {
        let url = format!("{}/api/auth/login", self.base_url);
        let body = LoginRequest { username, password };
        let response = self.post_auth(&url, &body).await?;
        self.session_from_response(response, username)
    }

    /// 注册并登录
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<UserSession> {
        let url = format!("{}/api/auth/register", self.base_url);
        let body = RegisterRequest {
            username,
            password,
            email,
        };
        let response = self.post_auth(&url, &body).await?;
        self.session_from_response(response, username)
    }

    /// 用已有 token 恢复会话（校验 token 是否仍有效）
    pub async fn resume(&self, token: &str) -> Result<UserSession> {
        let url = format!("{}/api/auth/user", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("校验会话失败: {}", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HabitSyncError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(HabitSyncError::RemoteUnavailable(format!(
                "校验会话失败，HTTP 状态码: {}",
                response.status()
            )));
        }

        let parsed: AuthResponse = response
            .json()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("解析会话响应失败: {}", e)))?;
        if !parsed.success {
            return Err(HabitSyncError::Auth("会话已失效".to_string()));
        }

        let user_id = resolve_user_id(parsed.user.as_ref(), token);
        info!("✅ 会话恢复成功: user_id={}", user_id);
        Ok(UserSession::new(user_id, token))
    }

    async fn post_auth<B: Serialize>(&self, url: &str, body: &B) -> Result<AuthResponse> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("认证请求失败: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HabitSyncError::Auth("用户名或密码错误".to_string()));
        }
        if !status.is_success() {
            return Err(HabitSyncError::RemoteUnavailable(format!(
                "认证失败，HTTP 状态码: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| HabitSyncError::RemoteUnavailable(format!("解析认证响应失败: {}", e)))
    }

    fn session_from_response(&self, response: AuthResponse, username: &str) -> Result<UserSession> {
        if !response.success {
            return Err(HabitSyncError::Auth(format!("认证被拒绝: {}", username)));
        }
        let token = response
            .token
            .ok_or_else(|| HabitSyncError::Auth("认证响应缺少 token".to_string()))?;

        let user_id = resolve_user_id(response.user.as_ref(), &token);
        info!("✅ 登录成功: user_id={}", user_id);
        Ok(UserSession::new(user_id, token))
    }
}

/// 解析用户 ID：优先取响应里的 user 对象，其次解 JWT payload，
/// 都拿不到时回退到占位符
pub fn resolve_user_id(user: Option<&serde_json::Value>, token: &str) -> String {
    if let Some(user) = user {
        for field in ["id", "userId", "user_id"] {
            match user.get(field) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(serde_json::Value::Number(n)) => return n.to_string(),
                _ => {}
            }
        }
    }

    if let Some(uid) = user_id_from_jwt(token) {
        return uid;
    }

    warn!("⚠️ 无法从会话中解析用户 ID，使用占位符: {}", FALLBACK_USER_ID);
    FALLBACK_USER_ID.to_string()
}

/// best-effort 从 JWT 形状的 token 解出用户 ID
///
/// 只做 base64url 解码，不校验签名——命名空间用途，不是安全边界。
fn user_id_from_jwt(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    for field in ["userId", "user_id", "sub", "id"] {
        match claims.get(field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;

    fn fake_jwt(claims: serde_json::Value) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = engine.encode(serde_json::to_vec(&claims).unwrap());
        format!("{}.{}.fakesig", header, payload)
    }

    #[test]
    fn test_user_id_from_jwt() {
        let token = fake_jwt(json!({"userId": "u42", "exp": 1234567890}));
        assert_eq!(user_id_from_jwt(&token).as_deref(), Some("u42"));

        let token = fake_jwt(json!({"sub": 7}));
        assert_eq!(user_id_from_jwt(&token).as_deref(), Some("7"));
    }

    #[test]
    fn test_user_id_fallback_on_garbage_token() {
        assert_eq!(user_id_from_jwt("not-a-jwt"), None);
        assert_eq!(user_id_from_jwt(""), None);

        // 不是合法 base64 的中段
        assert_eq!(user_id_from_jwt("a.%%%.c"), None);

        assert_eq!(resolve_user_id(None, "not-a-jwt"), FALLBACK_USER_ID);
    }

    #[test]
    fn test_resolve_user_id_prefers_user_object() {
        let user = json!({"id": "alice", "username": "alice"});
        let token = fake_jwt(json!({"userId": "bob"}));
        assert_eq!(resolve_user_id(Some(&user), &token), "alice");
    }
}
