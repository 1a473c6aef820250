use std::fmt;

#[derive(Debug)]
pub enum HabitSyncError {
    /// 无有效会话凭证，远程调用被跳过（不重试）
    Unauthorized,
    /// 网络错误 / 非 2xx 状态码 / 非 JSON 响应体
    RemoteUnavailable(String),
    /// 缓存或远程值 JSON 解析失败（按"键不存在"处理）
    MalformedPayload(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Config(String),
    Auth(String),
    /// 当前无登录用户（KV 用户命名空间未初始化）
    NotConnected,
    Other(String),
}

impl fmt::Display for HabitSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HabitSyncError::Unauthorized => write!(f, "Unauthorized: no valid session"),
            HabitSyncError::RemoteUnavailable(e) => write!(f, "Remote unavailable: {}", e),
            HabitSyncError::MalformedPayload(e) => write!(f, "Malformed payload: {}", e),
            HabitSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            HabitSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            HabitSyncError::IO(e) => write!(f, "IO error: {}", e),
            HabitSyncError::Config(e) => write!(f, "Config error: {}", e),
            HabitSyncError::Auth(e) => write!(f, "Authentication error: {}", e),
            HabitSyncError::NotConnected => write!(f, "Not connected"),
            HabitSyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for HabitSyncError {}

impl From<serde_json::Error> for HabitSyncError {
    fn from(error: serde_json::Error) -> Self {
        HabitSyncError::MalformedPayload(error.to_string())
    }
}

impl From<std::io::Error> for HabitSyncError {
    fn from(error: std::io::Error) -> Self {
        HabitSyncError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for HabitSyncError {
    fn from(error: reqwest::Error) -> Self {
        HabitSyncError::RemoteUnavailable(error.to_string())
    }
}

impl HabitSyncError {
    /// 判断是否是可在下一轮调度时自然恢复的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, HabitSyncError::RemoteUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, HabitSyncError>;
