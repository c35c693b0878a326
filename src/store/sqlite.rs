//! SQLite 存储子模块
//!
//! ## 职责
//! - 持久化形状的原始栅格与变换状态
//! - 页面重载（进程重启）后恢复变换，重置时从原图重建
//!
//! ## 错误语义
//! - 连接锁中毒映射为 `MaskError::State`
//! - SQL 执行失败映射为 `MaskError::Storage`

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::MaskError;
use crate::transform::TransformState;

use super::{schema, MaskStore, StoredRaster};

/// `rusqlite` 实现的遮罩存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化 Schema。
    pub fn open(path: &Path) -> Result<Self, MaskError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| MaskError::Storage(format!("创建数据库目录失败: {}", e)))?;
            }
        }
        log::info!("遮罩数据库路径: {}", path.display());

        let conn = Connection::open(path)
            .map_err(|e| MaskError::Storage(format!("打开数据库失败: {}", e)))?;
        schema::initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, MaskError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MaskError::Storage(format!("打开内存数据库失败: {}", e)))?;
        schema::initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, MaskError>,
    ) -> Result<T, MaskError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| MaskError::State("数据库连接锁已中毒".to_string()))?;
        op(&conn)
    }
}

impl MaskStore for SqliteStore {
    fn get_raster(&self, shape_id: &str) -> Result<Option<StoredRaster>, MaskError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT data, file_name, updated_at FROM shape_rasters WHERE shape_id = ?1",
                    params![shape_id],
                    |row| {
                        Ok(StoredRaster {
                            data: Bytes::from(row.get::<_, Vec<u8>>(0)?),
                            file_name: row.get(1)?,
                            updated_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    fn put_raster(&self, shape_id: &str, data: Bytes, file_name: &str) -> Result<(), MaskError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shape_rasters (shape_id, data, file_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(shape_id) DO UPDATE SET
                    data = excluded.data,
                    file_name = excluded.file_name,
                    updated_at = excluded.updated_at",
                params![shape_id, data.as_ref(), file_name, now],
            )?;
            Ok(())
        })
    }

    fn get_transform(&self, shape_id: &str) -> Result<TransformState, MaskError> {
        self.with_conn(|conn| {
            let state = conn
                .query_row(
                    "SELECT rotation_degrees, scale, offset_x, offset_y
                     FROM shape_transforms WHERE shape_id = ?1",
                    params![shape_id],
                    |row| {
                        Ok(TransformState {
                            rotation_degrees: row.get(0)?,
                            scale: row.get(1)?,
                            offset_x: row.get(2)?,
                            offset_y: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(state.unwrap_or_default())
        })
    }

    fn put_transform(&self, shape_id: &str, state: &TransformState) -> Result<(), MaskError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shape_transforms (shape_id, rotation_degrees, scale, offset_x, offset_y, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(shape_id) DO UPDATE SET
                    rotation_degrees = excluded.rotation_degrees,
                    scale = excluded.scale,
                    offset_x = excluded.offset_x,
                    offset_y = excluded.offset_y,
                    updated_at = excluded.updated_at",
                params![
                    shape_id,
                    state.rotation_degrees,
                    state.scale,
                    state.offset_x,
                    state.offset_y,
                    now
                ],
            )?;
            Ok(())
        })
    }

    fn delete_shape(&self, shape_id: &str) -> Result<(), MaskError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM shape_rasters WHERE shape_id = ?1", params![shape_id])?;
            tx.execute("DELETE FROM shape_transforms WHERE shape_id = ?1", params![shape_id])?;
            tx.commit()?;
            Ok(())
        })
    }
}
