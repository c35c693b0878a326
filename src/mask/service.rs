//! # 服务层（可注入状态）
//!
//! ## 设计思路
//!
//! 使用 `MaskServiceState` 作为 UI 层持有的注入状态，替代全局单例。
//! 生命周期由宿主统一管理，测试可以创建互不影响的独立实例。
//!
//! ## 实现思路
//!
//! 对外仅暴露少量稳定 API，并负责帧循环的启动与停止：
//! - `apply_mask` / `remove_mask` / `has_mask`
//! - `rotate` / `scale_by` / `move_by` / `reset_transform`
//! - `get_config` / `set_config`

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::MaskError;
use crate::scene::SvgScene;
use crate::store::MaskStore;
use crate::transform::TransformState;

use super::controller::MaskEngine;
use super::events::MaskEvent;
use super::source::RasterSource;

/// 遮罩服务状态。
pub struct MaskServiceState {
    engine: Arc<MaskEngine>,
    frame_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MaskServiceState {
    /// 创建服务状态。帧循环需要调用 [`MaskServiceState::start`] 启动。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use footprint_mask::{EngineConfig, MaskServiceState, MemoryStore, SvgScene};
    ///
    /// # async fn demo() -> Result<(), footprint_mask::MaskError> {
    /// let service = MaskServiceState::new(
    ///     EngineConfig::default(),
    ///     Arc::new(SvgScene::new()),
    ///     Arc::new(MemoryStore::new()),
    /// )?;
    /// service.start()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        config: EngineConfig,
        scene: Arc<SvgScene>,
        store: Arc<dyn MaskStore>,
    ) -> Result<Self, MaskError> {
        let engine = MaskEngine::new(config, scene, store)?;
        Ok(Self {
            engine: Arc::new(engine),
            frame_loop: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<MaskEngine> {
        &self.engine
    }

    /// 启动帧循环；重复调用不会启动第二个循环。必须在 tokio 运行时内调用。
    pub fn start(&self) -> Result<(), MaskError> {
        let mut guard = self
            .frame_loop
            .lock()
            .map_err(|_| MaskError::State("帧循环句柄锁已中毒".to_string()))?;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        *guard = Some(self.engine.spawn_frame_loop());
        log::info!("🎬 遮罩帧循环已启动");
        Ok(())
    }

    /// 停止帧循环并结束会话，剩余待写入立即落地。
    pub fn shutdown(&self) -> Result<(), MaskError> {
        let handle = self
            .frame_loop
            .lock()
            .map_err(|_| MaskError::State("帧循环句柄锁已中毒".to_string()))?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.engine.flush_frame();
        self.engine.end_session()
    }

    pub async fn apply_mask(&self, shape_id: &str, source: RasterSource) -> Result<(), MaskError> {
        self.engine.apply_mask(shape_id, source).await
    }

    pub fn remove_mask(&self, shape_id: &str) -> Result<(), MaskError> {
        self.engine.remove_mask(shape_id)
    }

    pub fn has_mask(&self, shape_id: &str) -> bool {
        self.engine.has_mask(shape_id)
    }

    pub fn rotate(&self, shape_id: &str, delta_degrees: i32) -> Result<TransformState, MaskError> {
        self.engine.rotate(shape_id, delta_degrees)
    }

    pub fn scale_by(&self, shape_id: &str, factor: f64) -> Result<TransformState, MaskError> {
        self.engine.scale_by(shape_id, factor)
    }

    pub fn move_by(&self, shape_id: &str, dx: f64, dy: f64) -> Result<TransformState, MaskError> {
        self.engine.move_by(shape_id, dx, dy)
    }

    pub async fn reset_transform(&self, shape_id: &str) -> Result<(), MaskError> {
        self.engine.reset_transform(shape_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MaskEvent> {
        self.engine.subscribe()
    }

    pub fn get_config(&self) -> Result<EngineConfig, MaskError> {
        self.engine.config_snapshot()
    }

    pub fn set_config(&self, config: EngineConfig) -> Result<(), MaskError> {
        self.engine.set_config(config)
    }
}

impl Drop for MaskServiceState {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.frame_loop.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
