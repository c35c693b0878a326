//! # 足迹标注遮罩引擎：库入口
//!
//! 把用户上传的平面图 / 照片裁剪到多边形足迹形状里，并支持旋转、缩放、平移。
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          UI 层（上传 / 拖拽 / 变换按钮 / 删除形状）         │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↕ Result<T, MaskError> + MaskEvent 广播
//! ┌───────┼──────────────────────────────────────────────────┐
//! │  ┌─ mask ─────── MaskServiceState → MaskEngine            │
//! │  │   ├─ loader/pipeline   栅格加载·解码·降级占位           │
//! │  │   ├─ builder           clipPath + pattern 资源对        │
//! │  │   ├─ frame             帧边界写入                      │
//! │  │   └─ operators         旋转·缩放·平移·重置              │
//! │  │                                                       │
//! │  ├─ geometry ─── 包围盒 + cover 拟合                      │
//! │  ├─ transform ── 变换状态 + 合成变换字符串                  │
//! │  ├─ scene ────── SVG 场景（节点 + defs）                  │
//! │  ├─ store ────── 原始栅格与变换状态持久化 (rusqlite)        │
//! │  ├─ config ───── 引擎配置（JSON 文件 + 范围校验）           │
//! │  └─ error ────── MaskError（统一错误类型）                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `MaskError` 与错误码 |
//! | [`config`] | 引擎配置的加载、保存与校验 |
//! | [`geometry`] | 包围盒、路径解析、cover 拟合 |
//! | [`transform`] | 旋转/缩放/平移状态与 SVG 变换字符串 |
//! | [`scene`] | 形状节点与 defs 资源的场景模型，可序列化为 SVG |
//! | [`store`] | `MaskStore` 抽象、内存实现与 SQLite 实现 |
//! | [`mask`] | 遮罩引擎：加载、构建、帧写入、变换操作 |

pub mod config;
pub mod error;
pub mod geometry;
pub mod mask;
pub mod scene;
pub mod store;
pub mod transform;

pub use config::EngineConfig;
pub use error::MaskError;
pub use geometry::{fit, BoundingBox, FitResult, PathData};
pub use mask::{MaskEngine, MaskEvent, MaskPhase, MaskServiceState, RasterSource};
pub use scene::{NodeRef, SvgScene};
pub use store::{MaskStore, MemoryStore, SqliteStore};
pub use transform::{TransformLimits, TransformState};
