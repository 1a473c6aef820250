//! 跨组件同步场景测试
//!
//! 覆盖单元测试覆盖不到的组合行为：轮询覆盖本地写入的既定语义、
//! mock 模式与参照模型的等价性、全栈（SDK 层）的离线降级。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration;

use habitsync_sdk::{
    CacheEntry, HabitSyncError, KeyValueChannel, KvStore, LocalOnlyRemoteStore, RemoteStore,
};
use habitsync_sdk::session::{new_session_slot, SessionSlot, UserSession};

/// 固定返回脚本值的远程桩
struct FixedRemote {
    get_one_value: AsyncMutex<Option<Value>>,
    set_one_calls: AsyncMutex<Vec<(String, Value)>>,
}

impl FixedRemote {
    fn new(value: Option<Value>) -> Arc<Self> {
        Arc::new(Self {
            get_one_value: AsyncMutex::new(value),
            set_one_calls: AsyncMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RemoteStore for FixedRemote {
    async fn get_timestamps(
        &self,
        _keys: &[String],
    ) -> habitsync_sdk::Result<HashMap<String, Option<DateTime<Utc>>>> {
        Ok(HashMap::new())
    }

    async fn get_batch(
        &self,
        _keys: &[String],
    ) -> habitsync_sdk::Result<HashMap<String, Option<Value>>> {
        Ok(HashMap::new())
    }

    async fn get_one(&self, _key: &str) -> habitsync_sdk::Result<Option<Value>> {
        Ok(self.get_one_value.lock().await.clone())
    }

    async fn set_one(&self, key: &str, value: &Value) -> habitsync_sdk::Result<()> {
        self.set_one_calls
            .lock()
            .await
            .push((key.to_string(), value.clone()));
        Ok(())
    }
}

async fn fixture() -> (TempDir, Arc<KvStore>, SessionSlot) {
    let temp_dir = TempDir::new().unwrap();
    let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
    kv.switch_user("u1").await.unwrap();

    let session = new_session_slot();
    *session.write().await = Some(UserSession::new("u1", "token"));
    (temp_dir, kv, session)
}

/// 既定的非直觉语义：本地写入 7 之后，周期轮询拿到远程的 5，
/// 最终暴露值是 5。轮询用结构化相等和服务器最新值比较，与本地
/// 写入的新旧无关。这里显式断言，而不是假设。
#[tokio::test]
async fn poll_overwrites_recent_local_write() {
    let (_dir, kv, session) = fixture().await;
    let remote = FixedRemote::new(Some(json!(5)));

    let energy = KeyValueChannel::open(
        "energy",
        json!(0),
        kv.clone(),
        remote.clone(),
        session,
        Duration::from_millis(40),
    )
    .await
    .unwrap();

    // 启动校对先把远程的 5 采纳进来
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(energy.value(), json!(5));

    // 本地写入 7，随后的轮询又拿到远程的 5
    energy.set(json!(7)).await.unwrap();
    assert_eq!(energy.value(), json!(7)); // read-your-writes 先成立

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(energy.value(), json!(5));

    // 本地缓存也被轮询结果覆盖
    let entry: CacheEntry = kv.get("energy").await.unwrap().unwrap();
    assert_eq!(entry.value, json!(5));
}

/// mock 模式等价性：同一操作序列在 mock 后端上执行，(值, 是否为空)
/// 的可观察结果与参照模型一致
#[tokio::test]
async fn mock_mode_matches_reference_model() {
    let (_dir, kv, _session) = fixture().await;
    let mock = LocalOnlyRemoteStore::new(kv.clone());

    // 参照模型：一个普通的内存 map
    let mut reference: HashMap<String, Value> = HashMap::new();

    enum Op {
        Set(&'static str, Value),
        Get(&'static str),
    }

    let script = [
        Op::Get("habits"),
        Op::Set("habits", json!(["run"])),
        Op::Get("habits"),
        Op::Set("energy", json!(7)),
        Op::Set("habits", json!(["run", "read"])),
        Op::Get("habits"),
        Op::Get("energy"),
        Op::Get("never_written"),
    ];

    for op in script {
        match op {
            Op::Set(key, value) => {
                mock.set_one(key, &value).await.unwrap();
                reference.insert(key.to_string(), value);
            }
            Op::Get(key) => {
                let observed = mock.get_one(key).await.unwrap();
                assert_eq!(observed.as_ref(), reference.get(key));
            }
        }
    }

    // 批量接口与单键接口的空值语义一致
    let keys: Vec<String> = ["habits", "energy", "never_written"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let batch = mock.get_batch(&keys).await.unwrap();
    for key in &keys {
        assert_eq!(batch[key].as_ref(), reference.get(key));
    }
    let timestamps = mock.get_timestamps(&keys).await.unwrap();
    for key in &keys {
        assert_eq!(timestamps[key].is_some(), reference.contains_key(key));
    }
}

/// 会话丢失后，通道写入仍然本地生效，远程失败只进入侧信道
#[tokio::test]
async fn writes_degrade_to_local_after_session_loss() {
    let temp_dir = TempDir::new().unwrap();
    let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
    kv.switch_user("u1").await.unwrap();

    let session = new_session_slot();
    *session.write().await = Some(UserSession::new("u1", "token"));

    // 远程：无会话语义的桩（始终 Unauthorized）
    struct UnauthorizedRemote;

    #[async_trait]
    impl RemoteStore for UnauthorizedRemote {
        async fn get_timestamps(
            &self,
            _keys: &[String],
        ) -> habitsync_sdk::Result<HashMap<String, Option<DateTime<Utc>>>> {
            Err(HabitSyncError::Unauthorized)
        }
        async fn get_batch(
            &self,
            _keys: &[String],
        ) -> habitsync_sdk::Result<HashMap<String, Option<Value>>> {
            Err(HabitSyncError::Unauthorized)
        }
        async fn get_one(&self, _key: &str) -> habitsync_sdk::Result<Option<Value>> {
            Err(HabitSyncError::Unauthorized)
        }
        async fn set_one(&self, _key: &str, _value: &Value) -> habitsync_sdk::Result<()> {
            Err(HabitSyncError::Unauthorized)
        }
    }

    let chan = KeyValueChannel::open(
        "habits",
        json!([]),
        kv.clone(),
        Arc::new(UnauthorizedRemote),
        session,
        Duration::from_secs(3600),
    )
    .await
    .unwrap();

    chan.set(json!(["offline"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 本地写入生效且持久化
    assert_eq!(chan.value(), json!(["offline"]));
    let entry: CacheEntry = kv.get("habits").await.unwrap().unwrap();
    assert_eq!(entry.value, json!(["offline"]));

    // 远程失败进入错误侧信道，没有任何异常逃逸
    assert!(chan.last_error().borrow().is_some());
}
