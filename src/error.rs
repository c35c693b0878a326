//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 定义全局统一的 `MaskError` 枚举，覆盖遮罩引擎对外暴露的所有失败语义。
//! 几何拟合与遮罩构建的错误以类型化结果向上传递；
//! 图片加载错误在加载流水线内部被吸收为占位图，不会出现在这里的对外结果中。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `GeometryError` / `std::io::Error` 提供 `From` 转换，无需手动 map。
//! - 实现 `Serialize` 将错误序列化为字符串，便于 UI 桥接层直接透传。
//! - `code()` 提供稳定的机器可读错误码，用于一次性提示的去重与前端分支。

use serde::Serialize;

use crate::geometry::GeometryError;

/// 遮罩引擎统一错误类型（对外即 `ClipMaskError`）。
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    /// 形状没有路径数据，不可重试，且不会产生任何场景写入
    #[error("形状缺少几何路径: {0}")]
    MissingGeometry(String),

    /// 几何拟合输入非法
    #[error("{0}")]
    Geometry(#[from] GeometryError),

    /// 图片解码失败或超时（仅在加载流水线内部使用，对外降级为占位图）
    #[error("图片解码失败: {0}")]
    ImageDecode(String),

    /// 旧的 clip-path / pattern 无法移除，强制移除后重试仍失败
    #[error("遮罩资源冲突: {0}")]
    ResourceConflict(String),

    /// 形状节点在操作过程中已被移除
    #[error("形状节点已脱离场景: {0}")]
    DetachedElement(String),

    /// 持久化存储读写失败
    #[error("存储错误: {0}")]
    Storage(String),

    /// 配置非法或配置文件无法读取
    #[error("配置错误: {0}")]
    Config(String),

    /// 内部状态锁不可用
    #[error("内部状态异常: {0}")]
    State(String),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),
}

impl MaskError {
    /// 稳定错误码，供 UI 层区分错误类别。
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingGeometry(_) => "E_MISSING_GEOMETRY",
            Self::Geometry(_) => "E_GEOMETRY",
            Self::ImageDecode(_) => "E_IMAGE_DECODE",
            Self::ResourceConflict(_) => "E_RESOURCE_CONFLICT",
            Self::DetachedElement(_) => "E_DETACHED_ELEMENT",
            Self::Storage(_) => "E_STORAGE",
            Self::Config(_) => "E_CONFIG",
            Self::State(_) => "E_STATE",
            Self::Io(_) => "E_IO",
        }
    }

    /// 是否属于需要一次性提示用户的不可恢复错误。
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::ResourceConflict(_) | Self::DetachedElement(_))
    }
}

impl From<rusqlite::Error> for MaskError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// UI 桥接层要求返回值实现 `Serialize`。
/// 将错误序列化为人类可读的字符串。
impl Serialize for MaskError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_display_string() {
        let err = MaskError::DetachedElement("shape-1".to_string());
        let json = serde_json::to_string(&err).expect("serialize error");
        assert_eq!(json, "\"形状节点已脱离场景: shape-1\"");
    }

    #[test]
    fn only_conflict_and_detached_are_user_visible() {
        assert!(MaskError::ResourceConflict("a".into()).is_user_visible());
        assert!(MaskError::DetachedElement("a".into()).is_user_visible());
        assert!(!MaskError::ImageDecode("a".into()).is_user_visible());
        assert!(!MaskError::MissingGeometry("a".into()).is_user_visible());
    }

    #[test]
    fn geometry_error_converts_with_question_mark() {
        fn fallible() -> Result<(), MaskError> {
            Err(GeometryError::NonPositiveImage { width: 0, height: 10 })?;
            Ok(())
        }

        let err = fallible().unwrap_err();
        assert_eq!(err.code(), "E_GEOMETRY");
    }
}
