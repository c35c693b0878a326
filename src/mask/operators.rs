//! 变换操作：旋转、缩放、平移、重置。
//!
//! 每次操作都先持久化新状态，再把合成变换排入下一帧写入；
//! 形状尚无遮罩（例如仍在加载）时写入会跳过，构建遮罩时读取最新持久化状态。

use crate::error::MaskError;
use crate::transform::TransformState;

use super::controller::MaskEngine;
use super::frame::PendingWrite;

impl MaskEngine {
    fn update_transform_state(
        &self,
        shape_id: &str,
        op: impl FnOnce(TransformState) -> TransformState,
    ) -> Result<TransformState, MaskError> {
        let limits = self.config_snapshot()?.limits();
        let current = self.store.get_transform(shape_id)?.normalized(limits);
        let next = op(current).normalized(limits);

        self.store.put_transform(shape_id, &next)?;
        self.enqueue(shape_id, PendingWrite::Transform(next))?;
        self.events.mask_updated(shape_id);

        log::debug!(
            "🧭 变换已更新 - shape={} rotation={} scale={} offset=({}, {})",
            shape_id,
            next.rotation_degrees,
            next.scale,
            next.offset_x,
            next.offset_y
        );
        Ok(next)
    }

    /// 旋转，结果折算到 `[0, 360)`。
    pub fn rotate(&self, shape_id: &str, delta_degrees: i32) -> Result<TransformState, MaskError> {
        self.update_transform_state(shape_id, |state| state.rotated(delta_degrees))
    }

    /// 按倍数缩放，结果钳制到配置的上下限。
    pub fn scale_by(&self, shape_id: &str, factor: f64) -> Result<TransformState, MaskError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(MaskError::Config(format!("缩放倍数必须为正数: {}", factor)));
        }
        let limits = self.config_snapshot()?.limits();
        self.update_transform_state(shape_id, |state| state.scaled(factor, limits))
    }

    pub fn move_by(&self, shape_id: &str, dx: f64, dy: f64) -> Result<TransformState, MaskError> {
        if !dx.is_finite() || !dy.is_finite() {
            return Err(MaskError::Config(format!("平移量必须为有限值: ({}, {})", dx, dy)));
        }
        self.update_transform_state(shape_id, |state| state.moved(dx, dy))
    }

    /// 当前持久化的变换状态（无记录时为默认值）。
    pub fn transform_of(&self, shape_id: &str) -> Result<TransformState, MaskError> {
        let limits = self.config_snapshot()?.limits();
        Ok(self.store.get_transform(shape_id)?.normalized(limits))
    }

    /// 重置变换。
    ///
    /// 有持久化的原始栅格时移除遮罩并从原始栅格重建，保证与首次应用完全一致；
    /// 否则只把默认变换排入下一帧。
    pub async fn reset_transform(&self, shape_id: &str) -> Result<(), MaskError> {
        let defaults = TransformState::default();
        self.store.put_transform(shape_id, &defaults)?;

        if self.store.get_raster(shape_id)?.is_none() {
            log::info!("↩️ 重置变换（无原始栅格，仅写入默认变换）- shape={}", shape_id);
            self.enqueue(shape_id, PendingWrite::Transform(defaults))?;
            self.events.mask_updated(shape_id);
            return Ok(());
        }

        log::info!("↩️ 重置变换，从原始栅格重建遮罩 - shape={}", shape_id);
        self.remove_mask(shape_id)?;
        let result = self.reapply_from_store(shape_id, false).await;
        if let Err(err) = &result {
            self.report_error(shape_id, err);
        }
        result
    }
}
