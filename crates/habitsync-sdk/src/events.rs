//! 事件系统 - 同步结果通知
//!
//! 只有用户主动触发的同步（`sync_now`）会发布用户可见的事件；
//! 后台定时同步静默失败，避免通知疲劳。UI 侧订阅后可以把事件
//! 渲染成一条提示。

use tokio::sync::broadcast;

/// 同步事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// 用户触发的同步完成，`refreshed` 为本轮刷新的键数量
    SyncCompleted { refreshed: usize },
    /// 用户触发的同步失败（本地数据仍然可用，不是致命状态）
    SyncFailed { error: String },
}

/// 同步事件总线
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 发布事件；当前没有订阅者时静默丢弃
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = SyncEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(SyncEvent::SyncCompleted { refreshed: 3 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SyncEvent::SyncCompleted { refreshed: 3 });
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = SyncEventBus::default();
        bus.publish(SyncEvent::SyncFailed {
            error: "offline".to_string(),
        });
    }
}
