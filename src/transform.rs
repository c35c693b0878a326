//! # 变换状态模块
//!
//! ## 设计思路
//!
//! 每个形状持有一份类型化的 `TransformState`（旋转 / 缩放 / 偏移），
//! 它是变换的唯一可信来源；场景上的 `data-mask-*` 属性只是序列化目标，不会被反向解析。
//!
//! ## 实现思路
//!
//! - 所有变换运算都是返回新值的纯函数，调用方负责持久化。
//! - 合成变换严格按 `translate → rotate(绕包围盒中心) → scale` 的顺序输出，
//!   顺序不同视觉结果就不同，因此集中在 `composed_transform` 一处生成。

use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

pub const ATTR_ROTATION: &str = "data-mask-rotation";
pub const ATTR_SCALE: &str = "data-mask-scale";
pub const ATTR_OFFSET_X: &str = "data-mask-offset-x";
pub const ATTR_OFFSET_Y: &str = "data-mask-offset-y";

/// 缩放上下限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformLimits {
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for TransformLimits {
    fn default() -> Self {
        Self {
            min_scale: 0.2,
            max_scale: 5.0,
        }
    }
}

/// 单个形状的栅格变换状态
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformState {
    /// 旋转角度，始终位于 `[0, 360)`
    pub rotation_degrees: i32,
    /// 缩放系数，始终位于 `[min_scale, max_scale]`
    pub scale: f64,
    /// 局部坐标单位下的平移
    pub offset_x: f64,
    pub offset_y: f64,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            rotation_degrees: 0,
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

impl TransformState {
    /// 累加旋转角度并归一化到 `[0, 360)`，支持负增量。
    pub fn rotated(self, delta_degrees: i32) -> Self {
        let rotation = (self.rotation_degrees as i64 + delta_degrees as i64).rem_euclid(360);
        Self {
            rotation_degrees: rotation as i32,
            ..self
        }
    }

    /// 乘法缩放并夹取到上下限内，重复调用会累乘。
    ///
    /// 非有限或非正的系数会被忽略。
    pub fn scaled(self, factor: f64, limits: TransformLimits) -> Self {
        if !factor.is_finite() || factor <= 0.0 {
            log::warn!("忽略非法缩放系数：{}", factor);
            return self;
        }

        Self {
            scale: (self.scale * factor).clamp(limits.min_scale, limits.max_scale),
            ..self
        }
    }

    /// 累加平移。
    pub fn moved(self, delta_x: f64, delta_y: f64) -> Self {
        if !delta_x.is_finite() || !delta_y.is_finite() {
            log::warn!("忽略非法平移量：({}, {})", delta_x, delta_y);
            return self;
        }

        Self {
            offset_x: self.offset_x + delta_x,
            offset_y: self.offset_y + delta_y,
            ..self
        }
    }

    /// 将外部读入的状态收敛到合法范围（存储中的旧数据可能越界）。
    pub fn normalized(self, limits: TransformLimits) -> Self {
        let scale = if self.scale.is_finite() {
            self.scale.clamp(limits.min_scale, limits.max_scale)
        } else {
            1.0
        };
        let offset_x = if self.offset_x.is_finite() { self.offset_x } else { 0.0 };
        let offset_y = if self.offset_y.is_finite() { self.offset_y } else { 0.0 };

        Self {
            rotation_degrees: self.rotation_degrees.rem_euclid(360),
            scale,
            offset_x,
            offset_y,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// 生成作用于 pattern 内图片元素的合成变换字符串。
    ///
    /// 格式固定为 `translate(ox,oy) rotate(deg,cx,cy) scale(s)`，
    /// 其中 `(cx, cy)` 为形状包围盒中心。
    ///
    /// # 示例
    /// ```
    /// use footprint_mask::geometry::BoundingBox;
    /// use footprint_mask::transform::TransformState;
    ///
    /// let state = TransformState { rotation_degrees: 90, scale: 2.0, offset_x: 10.0, offset_y: 5.0 };
    /// let bbox = BoundingBox::new(0.0, 0.0, 100.0, 50.0);
    /// assert_eq!(state.composed_transform(&bbox), "translate(10,5) rotate(90,50,25) scale(2)");
    /// ```
    pub fn composed_transform(&self, bbox: &BoundingBox) -> String {
        let (cx, cy) = bbox.center();
        format!(
            "translate({},{}) rotate({},{},{}) scale({})",
            format_number(self.offset_x),
            format_number(self.offset_y),
            self.rotation_degrees,
            format_number(cx),
            format_number(cy),
            format_number(self.scale)
        )
    }

    /// 扁平属性集，写到形状节点上供渲染层与外部变更检测读取。
    pub fn to_attributes(&self) -> [(&'static str, String); 4] {
        [
            (ATTR_ROTATION, self.rotation_degrees.to_string()),
            (ATTR_SCALE, format_number(self.scale)),
            (ATTR_OFFSET_X, format_number(self.offset_x)),
            (ATTR_OFFSET_Y, format_number(self.offset_y)),
        ]
    }
}

/// SVG 属性用的数字格式：保留 6 位小数精度，去掉多余尾零与 `-0`。
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }

    let rounded = (value * 1_000_000.0).round() / 1_000_000.0;
    if rounded == 0.0 {
        return "0".to_string();
    }
    format!("{}", rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps_past_full_turn() {
        let state = TransformState::default().rotated(370).rotated(370);
        assert_eq!(state.rotation_degrees, 20);
    }

    #[test]
    fn rotation_normalizes_negative_delta() {
        let state = TransformState::default().rotated(-90);
        assert_eq!(state.rotation_degrees, 270);

        let state = state.rotated(-1000);
        assert_eq!(state.rotation_degrees, (270 - 1000_i32).rem_euclid(360));
    }

    #[test]
    fn scale_is_multiplicative_and_clamped() {
        let limits = TransformLimits::default();
        let state = TransformState::default().scaled(2.0, limits).scaled(1.5, limits);
        assert!((state.scale - 3.0).abs() < 1e-12);

        let state = state.scaled(10.0, limits);
        assert_eq!(state.scale, 5.0);

        let state = state.scaled(0.0001, limits);
        assert_eq!(state.scale, 0.2);
    }

    #[test]
    fn invalid_scale_factor_is_ignored() {
        let limits = TransformLimits::default();
        let state = TransformState::default().scaled(2.0, limits);

        assert_eq!(state.scaled(-1.0, limits), state);
        assert_eq!(state.scaled(f64::NAN, limits), state);
        assert_eq!(state.scaled(0.0, limits), state);
    }

    #[test]
    fn move_is_additive() {
        let state = TransformState::default().moved(10.0, 5.0).moved(-2.5, 1.0);
        assert_eq!(state.offset_x, 7.5);
        assert_eq!(state.offset_y, 6.0);
        assert_eq!(state.moved(f64::INFINITY, 0.0), state);
    }

    #[test]
    fn composed_transform_keeps_translate_rotate_scale_order() {
        let limits = TransformLimits::default();
        let state = TransformState::default()
            .rotated(90)
            .scaled(2.0, limits)
            .moved(10.0, 5.0);
        let bbox = BoundingBox::new(0.0, 0.0, 100.0, 50.0);

        assert_eq!(
            state.composed_transform(&bbox),
            "translate(10,5) rotate(90,50,25) scale(2)"
        );
    }

    #[test]
    fn composed_transform_of_default_state() {
        let bbox = BoundingBox::new(-10.0, 4.0, 21.0, 7.0);
        assert_eq!(
            TransformState::default().composed_transform(&bbox),
            "translate(0,0) rotate(0,0.5,7.5) scale(1)"
        );
    }

    #[test]
    fn normalized_repairs_out_of_range_values() {
        let limits = TransformLimits::default();
        let state = TransformState {
            rotation_degrees: -30,
            scale: 99.0,
            offset_x: f64::NAN,
            offset_y: 3.0,
        }
        .normalized(limits);

        assert_eq!(state.rotation_degrees, 330);
        assert_eq!(state.scale, 5.0);
        assert_eq!(state.offset_x, 0.0);
        assert_eq!(state.offset_y, 3.0);
    }

    #[test]
    fn format_number_trims_noise() {
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(105.0), "105");
    }

    #[test]
    fn attributes_use_flat_names() {
        let state = TransformState {
            rotation_degrees: 45,
            scale: 1.25,
            offset_x: -3.0,
            offset_y: 0.5,
        };
        let attrs = state.to_attributes();

        assert_eq!(attrs[0], (ATTR_ROTATION, "45".to_string()));
        assert_eq!(attrs[1], (ATTR_SCALE, "1.25".to_string()));
        assert_eq!(attrs[2], (ATTR_OFFSET_X, "-3".to_string()));
        assert_eq!(attrs[3], (ATTR_OFFSET_Y, "0.5".to_string()));
    }

    #[test]
    fn serde_uses_camel_case_fields() {
        let json = serde_json::to_value(TransformState::default()).expect("serialize");
        assert_eq!(json["rotationDegrees"], 0);
        assert_eq!(json["scale"], 1.0);
    }
}
