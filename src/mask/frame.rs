//! # 帧批处理
//!
//! ## 设计思路
//!
//! 除加载外的所有操作都是同步的，但场景写入统一推迟到下一个帧边界，
//! 同一帧内的多次写入按入队顺序一次性落地，避免中间状态闪烁。
//!
//! ## 实现思路
//!
//! - 写入队列是有序的 `(shape_id, PendingWrite)` 列表。
//! - 同一形状的多次变换写入只保留最新一条，并移到队尾，
//!   保证它排在此前入队的提交之后。
//! - 落地前对每条写入做存活检查；形状已脱离场景时静默丢弃。
//! - `spawn_frame_loop` 用 `tokio::time::interval` 驱动 `flush_frame`，
//!   引擎被释放后循环自动结束。

use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::MaskError;
use crate::transform::TransformState;

use super::builder::{self, ClipMaskResource};
use super::controller::MaskEngine;

/// 等待帧边界落地的场景写入
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    /// 提交（或替换）资源对
    Commit(Arc<ClipMaskResource>),
    /// 更新合成变换
    Transform(TransformState),
    /// 仅刷新更新时间标记
    Touch,
    /// 移除资源对并恢复外观
    Remove,
}

impl PendingWrite {
    fn kind(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Transform(_) => "transform",
            Self::Touch => "touch",
            Self::Remove => "remove",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FrameQueue {
    writes: Vec<(String, PendingWrite)>,
}

impl FrameQueue {
    pub(crate) fn push(&mut self, shape_id: &str, write: PendingWrite) {
        if matches!(write, PendingWrite::Transform(_)) {
            self.writes
                .retain(|(id, pending)| !(id == shape_id && matches!(pending, PendingWrite::Transform(_))));
        }
        self.writes.push((shape_id.to_string(), write));
    }

    /// 最近一条提交/移除意图：提交为 `true`，移除为 `false`。
    pub(crate) fn pending_intent(&self, shape_id: &str) -> Option<bool> {
        self.writes.iter().rev().find_map(|(id, write)| {
            if id != shape_id {
                return None;
            }
            match write {
                PendingWrite::Commit(_) => Some(true),
                PendingWrite::Remove => Some(false),
                _ => None,
            }
        })
    }

    pub(crate) fn drop_shape(&mut self, shape_id: &str) -> usize {
        let before = self.writes.len();
        self.writes.retain(|(id, _)| id != shape_id);
        before - self.writes.len()
    }

    pub(crate) fn take(&mut self) -> Vec<(String, PendingWrite)> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn len(&self) -> usize {
        self.writes.len()
    }
}

/// 单帧落地统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    /// 成功写入
    pub applied: usize,
    /// 无需写入（例如尚无遮罩时的变换）
    pub skipped: usize,
    /// 形状已脱离场景而丢弃
    pub dropped: usize,
    pub failed: usize,
}

impl MaskEngine {
    fn lock_frame(&self) -> Result<MutexGuard<'_, FrameQueue>, MaskError> {
        self.frame
            .lock()
            .map_err(|_| MaskError::State("帧队列锁已中毒".to_string()))
    }

    pub(crate) fn enqueue(&self, shape_id: &str, write: PendingWrite) -> Result<(), MaskError> {
        log::debug!("🗂️ 写入入队 - shape={} kind={}", shape_id, write.kind());
        self.lock_frame()?.push(shape_id, write);
        Ok(())
    }

    pub(crate) fn pending_intent(&self, shape_id: &str) -> Option<bool> {
        match self.frame.lock() {
            Ok(queue) => queue.pending_intent(shape_id),
            Err(_) => None,
        }
    }

    pub(crate) fn drop_pending(&self, shape_id: &str) -> Result<usize, MaskError> {
        Ok(self.lock_frame()?.drop_shape(shape_id))
    }

    /// 当前等待落地的写入数量。
    pub fn pending_writes(&self) -> usize {
        match self.frame.lock() {
            Ok(queue) => queue.len(),
            Err(_) => 0,
        }
    }

    /// 在帧边界落地全部待写入。
    pub fn flush_frame(&self) -> FrameStats {
        let writes = match self.lock_frame() {
            Ok(mut queue) => queue.take(),
            Err(err) => {
                log::error!("❌ {}", err);
                return FrameStats::default();
            }
        };

        let mut stats = FrameStats::default();
        for (shape_id, write) in writes {
            if !self.scene.is_live(&shape_id) {
                log::debug!(
                    "🚮 形状已脱离场景，丢弃写入 - shape={} kind={}",
                    shape_id,
                    write.kind()
                );
                stats.dropped += 1;
                continue;
            }

            let now = builder::now_millis();
            let result = match write {
                PendingWrite::Commit(resource) => self
                    .capture_originals(&shape_id)
                    .and_then(|_| builder::commit(&self.scene, &resource, now))
                    .map(|_| true),
                PendingWrite::Transform(state) => {
                    builder::update_transform(&self.scene, &shape_id, &state, now)
                }
                PendingWrite::Touch => builder::touch(&self.scene, &shape_id, now),
                PendingWrite::Remove => self.take_originals(&shape_id).and_then(|originals| {
                    builder::remove(&self.scene, &shape_id, originals.as_ref()).map(|_| true)
                }),
            };

            match result {
                Ok(true) => stats.applied += 1,
                Ok(false) => stats.skipped += 1,
                Err(err) => {
                    stats.failed += 1;
                    self.report_error(&shape_id, &err);
                }
            }
        }

        if stats != FrameStats::default() {
            log::debug!(
                "🎞️ 帧落地 - applied={} skipped={} dropped={} failed={}",
                stats.applied,
                stats.skipped,
                stats.dropped,
                stats.failed
            );
        }
        stats
    }

    /// 启动帧循环。
    pub fn spawn_frame_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self
            .config_snapshot()
            .map(|config| config.frame_interval())
            .unwrap_or(Duration::from_millis(16));
        let engine = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if engine.pending_writes() > 0 {
                    engine.flush_frame();
                }
            }
            log::debug!("🛑 帧循环结束");
        })
    }
}
