//! # 遮罩引擎模块（mask）
//!
//! ## 设计思路
//!
//! 该模块把“栅格来源识别 → 加载解码 → 资源对构建 → 帧边界写入 → 变换操作”
//! 按职责拆分为多个子模块，避免单文件膨胀与耦合。
//!
//! - `service`：承载可注入状态（`MaskServiceState`）与帧循环生命周期
//! - `controller`：编排应用 / 重新应用 / 移除的状态机
//! - `operators`：旋转、缩放、平移、重置
//! - `loader`：负责字节/文件/URL/延迟来源的加载、超时与解码缓存
//! - `pipeline`：负责格式校验、解码、超大图降采样与占位图
//! - `builder`：构建 clipPath + pattern 资源对并写入场景
//! - `frame`：帧边界写入队列
//! - `session/events/source`：会话状态、事件广播、中间数据模型
//!
//! ## 实现思路
//!
//! 对外仅暴露必要类型，内部细节保持 `mod` 私有。
//! 所有场景写入都经过帧队列，引擎内部任何锁都不会跨越 `.await`。
//!
//! ## 新同事快速上手
//!
//! 可以按下面顺序理解调用链：
//!
//! ```text
//! UI 层（上传 / 拖拽 / 旋转按钮）
//!    ↓
//! service.rs（注入状态、帧循环）
//!    ↓
//! controller.rs（状态机 + 阶段耗时日志）
//!    ├─ loader.rs（来源加载 + 超时降级 + 解码缓存）
//!    ├─ pipeline.rs（格式校验 + 解码 + 降采样）
//!    └─ builder.rs（cover 拟合 + 资源对构建）
//!    ↓
//! frame.rs（下一帧落地到 SvgScene）
//!    ↓
//! events.rs（MaskUpdated / Notice 广播给 UI）
//! ```
//!
//! ## 分层职责建议
//!
//! - 业务流程顺序变更优先改 `controller.rs`
//! - 拟合或资源结构变更优先改 `builder.rs` 与 `geometry.rs`
//! - 单阶段行为优化分别改 `loader/pipeline`

mod builder;
mod controller;
mod events;
mod frame;
mod loader;
mod operators;
mod pipeline;
mod service;
mod session;
mod source;

pub use builder::{
    build, clip_path_id, is_mask_present, pattern_id, ClipMaskResource, OriginalAppearance,
    ATTR_MASK_APPLIED, ATTR_MASK_UPDATED,
};
pub use controller::{MaskEngine, MaskPhase};
pub use events::{EventBus, MaskEvent, NoticeLevel, NOTICE_MASK_APPLIED};
pub use frame::FrameStats;
pub use loader::{LoadOutcome, RasterLoader};
pub use service::MaskServiceState;
pub use session::SessionContext;
pub use source::{LoadState, PreparedRaster, RasterSource};
