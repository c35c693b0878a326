//! Schema 初始化子模块
//!
//! ## 职责
//! - 创建遮罩存储的表结构并校验版本
//! - 设置 SQLite 运行参数（WAL）
//!
//! ## 错误语义
//! - DDL 失败统一映射为 `MaskError::Storage`

use rusqlite::Connection;

use crate::error::MaskError;

const SCHEMA_VERSION: i64 = 1;

fn get_user_version(conn: &Connection) -> Result<i64, MaskError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| MaskError::Storage(format!("读取数据库版本失败: {}", e)))
}

fn set_user_version(conn: &Connection, version: i64) -> Result<(), MaskError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| MaskError::Storage(format!("写入数据库版本失败: {}", e)))
}

fn create_base_tables(conn: &Connection) -> Result<(), MaskError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS shape_rasters (
            shape_id TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            file_name TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS shape_transforms (
            shape_id TEXT PRIMARY KEY,
            rotation_degrees INTEGER NOT NULL DEFAULT 0,
            scale REAL NOT NULL DEFAULT 1.0,
            offset_x REAL NOT NULL DEFAULT 0,
            offset_y REAL NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );",
    )
    .map_err(|e| MaskError::Storage(format!("创建基础表失败: {}", e)))
}

pub(super) fn initialize_schema(conn: &Connection) -> Result<(), MaskError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

    create_base_tables(conn)?;

    let mut version = get_user_version(conn)?;
    if version == 0 {
        set_user_version(conn, SCHEMA_VERSION)?;
        version = SCHEMA_VERSION;
    }

    if version != SCHEMA_VERSION {
        return Err(MaskError::Storage(format!(
            "数据库版本不匹配: current={}, expected={}",
            version, SCHEMA_VERSION
        )));
    }

    Ok(())
}
