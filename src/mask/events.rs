//! # 事件通知
//!
//! 引擎对外只有两类通知：`MaskUpdated`（遮罩或其变换发生变化）与一次性 `Notice`。
//! 通过 `tokio::sync::broadcast` 分发，UI 桥接层订阅后直接序列化转发。

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub const NOTICE_MASK_APPLIED: &str = "MASK_APPLIED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MaskEvent {
    #[serde(rename_all = "camelCase")]
    MaskUpdated { shape_id: String },
    #[serde(rename_all = "camelCase")]
    Notice {
        shape_id: String,
        level: NoticeLevel,
        code: &'static str,
        message: String,
    },
}

impl MaskEvent {
    pub fn shape_id(&self) -> &str {
        match self {
            Self::MaskUpdated { shape_id } | Self::Notice { shape_id, .. } => shape_id,
        }
    }
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MaskEvent> {
        self.sender.subscribe()
    }

    /// 发送事件；没有订阅者时静默丢弃。
    pub fn emit(&self, event: MaskEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("📭 无事件订阅者，丢弃事件");
        }
    }

    pub fn mask_updated(&self, shape_id: &str) {
        self.emit(MaskEvent::MaskUpdated {
            shape_id: shape_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = MaskEvent::Notice {
            shape_id: "a".to_string(),
            level: NoticeLevel::Success,
            code: NOTICE_MASK_APPLIED,
            message: "ok".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize event");

        assert_eq!(json["type"], "notice");
        assert_eq!(json["shapeId"], "a");
        assert_eq!(json["level"], "success");
        assert_eq!(json["code"], "MASK_APPLIED");

        let json = serde_json::to_value(MaskEvent::MaskUpdated {
            shape_id: "b".to_string(),
        })
        .expect("serialize event");
        assert_eq!(json["type"], "maskUpdated");
        assert_eq!(json["shapeId"], "b");
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.mask_updated("a");

        let event = rx.recv().await.expect("receive event");
        assert_eq!(event.shape_id(), "a");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::new().mask_updated("a");
    }
}
