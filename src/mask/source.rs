//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入类型”和“流水线中间结果”解耦：
//! - `RasterSource` 表示外部来源语义（上传字节 / 本地文件 / URL / 仍在上传中）
//! - `RawRaster` 表示已加载但未解码的字节
//! - `PreparedRaster` 表示可直接写入 pattern 的图片引用与像素尺寸

use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

/// 栅格输入来源。
#[derive(Debug)]
pub enum RasterSource {
    /// 已在内存中的上传内容。
    Bytes { data: Bytes, file_name: String },
    /// 本地文件路径。
    File(PathBuf),
    /// 网络地址。
    Url(String),
    /// 上传尚未完成，字节稍后通过通道送达。
    Deferred {
        receiver: oneshot::Receiver<Bytes>,
        file_name: String,
    },
}

impl RasterSource {
    pub fn from_bytes(data: impl Into<Bytes>, file_name: impl Into<String>) -> Self {
        Self::Bytes {
            data: data.into(),
            file_name: file_name.into(),
        }
    }

    /// 来源提示（用于日志与诊断）。
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Bytes { .. } => "bytes",
            Self::File(_) => "file",
            Self::Url(_) => "url",
            Self::Deferred { .. } => "deferred",
        }
    }
}

/// 加载阶段输出：原始字节与来源标识。
#[derive(Debug, Clone)]
pub(crate) struct RawRaster {
    pub(crate) bytes: Bytes,
    /// 文件名或 URL，持久化时作为来源标识
    pub(crate) file_name: String,
    pub(crate) source_hint: &'static str,
}

/// 栅格加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    Pending,
    Loaded,
    Failed,
}

/// 解码阶段输出：pattern 可直接引用的图片。
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRaster {
    /// 解码后的原始像素宽度（降采样前）
    pub width: u32,
    pub height: u32,
    /// `data:<mime>;base64,...`
    pub href: String,
    pub mime: String,
    /// 原始字节指纹，作为解码缓存键
    pub fingerprint: u64,
}

impl PreparedRaster {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
