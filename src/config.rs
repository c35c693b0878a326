//! # 配置模块
//!
//! ## 设计思路
//!
//! 将遮罩引擎所有“经验值”集中到 `EngineConfig`：过扫描系数、缩放上下限、
//! 加载超时、占位尺寸等。这些数值来自实际调参，没有理论依据，
//! 因此全部作为可配置默认值，而不是硬编码常量。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的默认配置。
//! - 支持从 JSON 文件加载，字段缺省时取默认值；文件缺失或损坏时整体回退默认值。
//! - `validate` 统一做范围校验，非法配置在进入引擎前被拒绝。

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MaskError;
use crate::geometry::DEFAULT_OVERSCAN;
use crate::transform::TransformLimits;

/// 遮罩引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 覆盖拟合的过扫描系数（>= 1.0）
    pub overscan: f64,
    /// 缩放下限
    pub min_scale: f64,
    /// 缩放上限
    pub max_scale: f64,
    /// 图片加载超时（毫秒），超时后降级为占位图
    pub load_timeout_ms: u64,
    /// 等待形状节点挂载的超时（毫秒）
    pub mount_timeout_ms: u64,
    /// 占位图宽度（像素）
    pub placeholder_width: u32,
    /// 占位图高度（像素）
    pub placeholder_height: u32,
    /// 栅格原始字节上限
    pub max_file_size: u64,
    /// pattern 内嵌图片的单边最大尺寸，超出时降采样
    pub max_pattern_dimension: u32,
    /// 解码结果 LRU 缓存容量
    pub decode_cache_entries: usize,
    /// 帧循环周期（毫秒）
    pub frame_interval_ms: u64,
    /// URL 栅格建立连接超时（毫秒）
    pub fetch_connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overscan: DEFAULT_OVERSCAN,
            min_scale: 0.2,
            max_scale: 5.0,
            load_timeout_ms: 10_000,
            mount_timeout_ms: 5_000,
            placeholder_width: 300,
            placeholder_height: 300,
            max_file_size: 50 * 1024 * 1024,
            max_pattern_dimension: 4096,
            decode_cache_entries: 32,
            frame_interval_ms: 16,
            fetch_connect_timeout_ms: 8_000,
        }
    }
}

impl EngineConfig {
    /// 从 JSON 文件加载配置。
    ///
    /// 文件不存在或内容无法解析时回退到默认配置，并记录警告。
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("解析配置文件失败，使用默认配置: {}", err);
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!("读取配置文件失败，使用默认配置: {}", err);
                Self::default()
            }
        }
    }

    /// 将配置写入 JSON 文件。
    pub fn save_to_path(&self, path: &Path) -> Result<(), MaskError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MaskError::Config(format!("序列化配置失败: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 范围校验。
    pub fn validate(&self) -> Result<(), MaskError> {
        if !self.overscan.is_finite() || !(1.0..=2.0).contains(&self.overscan) {
            return Err(MaskError::Config("overscan 必须在 1.0~2.0 之间".to_string()));
        }
        if !self.min_scale.is_finite() || self.min_scale <= 0.0 {
            return Err(MaskError::Config("min_scale 必须为正数".to_string()));
        }
        if !self.max_scale.is_finite() || self.max_scale < self.min_scale {
            return Err(MaskError::Config("max_scale 不能小于 min_scale".to_string()));
        }
        if !(100..=120_000).contains(&self.load_timeout_ms) {
            return Err(MaskError::Config("load_timeout_ms 必须在 100~120000 毫秒之间".to_string()));
        }
        if !(10..=120_000).contains(&self.mount_timeout_ms) {
            return Err(MaskError::Config("mount_timeout_ms 必须在 10~120000 毫秒之间".to_string()));
        }
        if self.placeholder_width == 0 || self.placeholder_height == 0 {
            return Err(MaskError::Config("占位图尺寸必须为正数".to_string()));
        }
        if self.max_file_size < 1024 {
            return Err(MaskError::Config("max_file_size 不能小于 1KB".to_string()));
        }
        if !(64..=16_384).contains(&self.max_pattern_dimension) {
            return Err(MaskError::Config("max_pattern_dimension 必须在 64~16384 之间".to_string()));
        }
        if self.decode_cache_entries == 0 {
            return Err(MaskError::Config("decode_cache_entries 不能为 0".to_string()));
        }
        if !(1..=1_000).contains(&self.frame_interval_ms) {
            return Err(MaskError::Config("frame_interval_ms 必须在 1~1000 毫秒之间".to_string()));
        }
        if !(100..=120_000).contains(&self.fetch_connect_timeout_ms) {
            return Err(MaskError::Config("fetch_connect_timeout_ms 必须在 100~120000 毫秒之间".to_string()));
        }
        Ok(())
    }

    pub fn limits(&self) -> TransformLimits {
        TransformLimits {
            min_scale: self.min_scale,
            max_scale: self.max_scale,
        }
    }

    pub fn placeholder_size(&self) -> (u32, u32) {
        (self.placeholder_width, self.placeholder_height)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_millis(self.mount_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock error")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("footprint-mask-config-test-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("default config should validate");
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let dir = unique_temp_dir();
        let path = dir.join("mask.json");

        let mut config = EngineConfig::default();
        config.overscan = 1.1;
        config.max_scale = 8.0;
        config.save_to_path(&path).expect("save config");

        let loaded = EngineConfig::load_from_path(&path);
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = unique_temp_dir();
        let path = dir.join("mask.json");
        std::fs::write(&path, r#"{ "load_timeout_ms": 2500 }"#).expect("write config");

        let loaded = EngineConfig::load_from_path(&path);
        assert_eq!(loaded.load_timeout_ms, 2500);
        assert_eq!(loaded.overscan, DEFAULT_OVERSCAN);
        assert_eq!(loaded.placeholder_size(), (300, 300));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn bad_config_falls_back_to_default() {
        let dir = unique_temp_dir();
        let path = dir.join("mask.json");
        std::fs::write(&path, "not-json").expect("write invalid config");

        assert_eq!(EngineConfig::load_from_path(&path), EngineConfig::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = EngineConfig::default();
        config.overscan = 0.95;
        assert!(matches!(config.validate(), Err(MaskError::Config(_))));

        let mut config = EngineConfig::default();
        config.min_scale = 2.0;
        config.max_scale = 1.0;
        assert!(matches!(config.validate(), Err(MaskError::Config(_))));

        let mut config = EngineConfig::default();
        config.load_timeout_ms = 10;
        assert!(matches!(config.validate(), Err(MaskError::Config(_))));

        let mut config = EngineConfig::default();
        config.placeholder_height = 0;
        assert!(matches!(config.validate(), Err(MaskError::Config(_))));
    }
}
