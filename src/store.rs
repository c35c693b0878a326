//! 持久化模块
//!
//! # 设计思路
//!
//! 遮罩引擎只依赖一个“按形状 id 读写”的键值抽象 `MaskStore`：
//! 原始栅格（用于重置时从原图重建）与类型化的 `TransformState`（变换的唯一可信来源）。
//! 存储后端的选择不属于引擎职责，这里提供两种实现：
//!
//! - `MemoryStore`：进程内 `HashMap`，用于测试与无状态场景。
//! - `SqliteStore`：`rusqlite` 持久化，Schema 通过 `PRAGMA user_version` 管理版本。
//!
//! # 约定
//!
//! - `get_transform` 在没有记录时返回默认值，而不是 `None`。
//! - 所有实现都是同步的。

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use serde::Serialize;

use crate::error::MaskError;
use crate::transform::TransformState;

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

/// 持久化的原始栅格
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRaster {
    #[serde(skip)]
    pub data: Bytes,
    pub file_name: String,
    /// 写入时间（毫秒时间戳）
    pub updated_at: i64,
}

/// 遮罩引擎的持久化接口
pub trait MaskStore: Send + Sync {
    fn get_raster(&self, shape_id: &str) -> Result<Option<StoredRaster>, MaskError>;

    fn put_raster(&self, shape_id: &str, data: Bytes, file_name: &str) -> Result<(), MaskError>;

    /// 读取变换状态；没有记录时返回默认值。
    fn get_transform(&self, shape_id: &str) -> Result<TransformState, MaskError>;

    fn put_transform(&self, shape_id: &str, state: &TransformState) -> Result<(), MaskError>;

    /// 删除形状的全部持久化记录。
    fn delete_shape(&self, shape_id: &str) -> Result<(), MaskError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    rasters: RwLock<HashMap<String, StoredRaster>>,
    transforms: RwLock<HashMap<String, TransformState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(name: &str) -> MaskError {
    MaskError::State(format!("{}锁已中毒", name))
}

impl MaskStore for MemoryStore {
    fn get_raster(&self, shape_id: &str) -> Result<Option<StoredRaster>, MaskError> {
        let rasters = self.rasters.read().map_err(|_| poisoned("栅格存储"))?;
        Ok(rasters.get(shape_id).cloned())
    }

    fn put_raster(&self, shape_id: &str, data: Bytes, file_name: &str) -> Result<(), MaskError> {
        let mut rasters = self.rasters.write().map_err(|_| poisoned("栅格存储"))?;
        rasters.insert(
            shape_id.to_string(),
            StoredRaster {
                data,
                file_name: file_name.to_string(),
                updated_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    fn get_transform(&self, shape_id: &str) -> Result<TransformState, MaskError> {
        let transforms = self.transforms.read().map_err(|_| poisoned("变换存储"))?;
        Ok(transforms.get(shape_id).copied().unwrap_or_default())
    }

    fn put_transform(&self, shape_id: &str, state: &TransformState) -> Result<(), MaskError> {
        let mut transforms = self.transforms.write().map_err(|_| poisoned("变换存储"))?;
        transforms.insert(shape_id.to_string(), *state);
        Ok(())
    }

    fn delete_shape(&self, shape_id: &str) -> Result<(), MaskError> {
        self.rasters
            .write()
            .map_err(|_| poisoned("栅格存储"))?
            .remove(shape_id);
        self.transforms
            .write()
            .map_err(|_| poisoned("变换存储"))?
            .remove(shape_id);
        Ok(())
    }
}
