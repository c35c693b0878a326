//! # 应用 / 重新应用控制器
//!
//! ## 设计思路
//!
//! `MaskEngine` 是遮罩引擎的核心编排器，每个形状对应一条 `MaskRecord`，
//! 状态机为：
//!
//! ```text
//! Unmasked ──apply──▶ Loading ──加载结束──▶ Masked
//!    ▲                                     │  ▲
//!    └────────────remove───────────────────┘  │
//!                        geometry changed /   │
//!                        raster replaced ──▶ Refreshing
//! ```
//!
//! - 已有遮罩时再次 apply 只刷新更新时间标记。
//! - 同一形状在首次加载结束前的重复 apply 合并为一次（加载登记表）。
//! - Refreshing 不先入队移除，新的提交会原子地替换旧资源对，避免闪烁；变换状态保持不变。
//! - 迟到的加载结果（ticket 已被取代或被取消）直接忽略。
//!
//! ## 实现思路
//!
//! - 配置通过 `Arc<RwLock<EngineConfig>>` 支持运行时更新，单次操作使用同一配置快照。
//! - 所有 `Mutex` 都不跨越 `.await` 持有。
//! - 记录 `load/build/total` 阶段耗时，便于性能诊断。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::MaskError;
use crate::scene::{NodeRef, SvgScene};
use crate::store::MaskStore;

use super::builder::{self, ClipMaskResource, OriginalAppearance};
use super::events::{EventBus, MaskEvent, NoticeLevel, NOTICE_MASK_APPLIED};
use super::frame::{FrameQueue, PendingWrite};
use super::loader::RasterLoader;
use super::session::{LoadingGuard, SessionContext};
use super::source::{LoadState, PreparedRaster, RasterSource};

/// 单个形状的遮罩阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MaskPhase {
    #[default]
    Unmasked,
    Loading,
    Masked,
    Refreshing,
}

#[derive(Debug, Default)]
pub(crate) struct MaskRecord {
    phase: MaskPhase,
    raster: Option<Arc<PreparedRaster>>,
    load_state: Option<LoadState>,
    originals: Option<OriginalAppearance>,
}

/// 遮罩引擎
pub struct MaskEngine {
    pub(super) config: Arc<RwLock<EngineConfig>>,
    pub(super) scene: Arc<SvgScene>,
    pub(super) store: Arc<dyn MaskStore>,
    pub(super) loader: RasterLoader,
    pub(super) session: Mutex<SessionContext>,
    pub(super) records: Mutex<HashMap<String, MaskRecord>>,
    pub(super) frame: Mutex<FrameQueue>,
    pub(super) events: EventBus,
}

impl std::fmt::Debug for MaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskEngine")
            .field("scene", &self.scene)
            .field("loader", &self.loader)
            .field("pending_writes", &self.pending_writes())
            .finish_non_exhaustive()
    }
}

impl MaskEngine {
    /// 创建引擎；配置非法时返回 `MaskError::Config`。
    pub fn new(
        config: EngineConfig,
        scene: Arc<SvgScene>,
        store: Arc<dyn MaskStore>,
    ) -> Result<Self, MaskError> {
        config.validate()?;
        let loader = RasterLoader::new(config.decode_cache_entries);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            scene,
            store,
            loader,
            session: Mutex::new(SessionContext::new()),
            records: Mutex::new(HashMap::new()),
            frame: Mutex::new(FrameQueue::default()),
            events: EventBus::new(),
        })
    }

    pub fn scene(&self) -> &Arc<SvgScene> {
        &self.scene
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MaskEvent> {
        self.events.subscribe()
    }

    /// 获取配置快照。
    pub fn config_snapshot(&self) -> Result<EngineConfig, MaskError> {
        self.config
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| MaskError::State("配置读取锁已中毒".to_string()))
    }

    /// 运行时更新配置，已在途的操作继续使用旧快照。
    pub fn set_config(&self, config: EngineConfig) -> Result<(), MaskError> {
        config.validate()?;
        self.loader.resize(config.decode_cache_entries);

        let mut current = self
            .config
            .write()
            .map_err(|_| MaskError::State("配置写入锁已中毒".to_string()))?;
        log::info!(
            "⚙️ 已更新遮罩配置（overscan={}, scale={}~{}, load_timeout={}ms）",
            config.overscan,
            config.min_scale,
            config.max_scale,
            config.load_timeout_ms
        );
        *current = config;
        Ok(())
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, SessionContext>, MaskError> {
        self.session
            .lock()
            .map_err(|_| MaskError::State("会话锁已中毒".to_string()))
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<String, MaskRecord>>, MaskError> {
        self.records
            .lock()
            .map_err(|_| MaskError::State("遮罩记录锁已中毒".to_string()))
    }

    pub fn phase(&self, shape_id: &str) -> MaskPhase {
        match self.records.lock() {
            Ok(records) => records.get(shape_id).map(|r| r.phase).unwrap_or_default(),
            Err(_) => MaskPhase::Unmasked,
        }
    }

    /// 最近一次加载的结果状态（占位图为 `Failed`）。
    pub fn load_state(&self, shape_id: &str) -> Option<LoadState> {
        let records = self.records.lock().ok()?;
        records.get(shape_id)?.load_state
    }

    pub fn is_loading(&self, shape_id: &str) -> bool {
        match self.session.lock() {
            Ok(session) => session.is_loading(shape_id),
            Err(_) => false,
        }
    }

    /// 形状是否有遮罩。
    ///
    /// 有待落地的提交/移除时以最后一条意图为准，否则检查场景。
    pub fn has_mask(&self, shape_id: &str) -> bool {
        self.pending_intent(shape_id)
            .unwrap_or_else(|| builder::is_mask_present(&self.scene, shape_id))
    }

    fn set_phase(&self, shape_id: &str, phase: MaskPhase) -> Result<(), MaskError> {
        self.lock_records()?
            .entry(shape_id.to_string())
            .or_default()
            .phase = phase;
        Ok(())
    }

    /// 进入加载阶段，返回进入前的阶段。
    fn enter_load_phase(&self, shape_id: &str) -> Result<MaskPhase, MaskError> {
        let mut records = self.lock_records()?;
        let record = records.entry(shape_id.to_string()).or_default();
        let previous = record.phase;
        record.phase = match previous {
            MaskPhase::Masked | MaskPhase::Refreshing => MaskPhase::Refreshing,
            MaskPhase::Unmasked | MaskPhase::Loading => MaskPhase::Loading,
        };
        Ok(previous)
    }

    fn settle_phase_after_error(&self, shape_id: &str, previous: MaskPhase) -> Result<(), MaskError> {
        let phase = match previous {
            MaskPhase::Masked | MaskPhase::Refreshing => MaskPhase::Masked,
            MaskPhase::Unmasked | MaskPhase::Loading => MaskPhase::Unmasked,
        };
        self.set_phase(shape_id, phase)
    }

    pub(super) fn capture_originals(&self, shape_id: &str) -> Result<(), MaskError> {
        let Some(node) = self.scene.node(shape_id) else {
            return Ok(());
        };
        if node.attribute(builder::ATTR_MASK_APPLIED).is_some() {
            return Ok(());
        }

        let mut records = self.lock_records()?;
        let record = records.entry(shape_id.to_string()).or_default();
        if record.originals.is_none() {
            record.originals = Some(OriginalAppearance::capture(&node));
        }
        Ok(())
    }

    pub(super) fn take_originals(&self, shape_id: &str) -> Result<Option<OriginalAppearance>, MaskError> {
        let mut records = self.lock_records()?;
        Ok(records.get_mut(shape_id).and_then(|record| record.originals.take()))
    }

    /// 记录错误；不可恢复的错误每个形状只提示一次。
    pub(super) fn report_error(&self, shape_id: &str, err: &MaskError) {
        if !err.is_user_visible() {
            log::warn!("⚠️ 遮罩操作失败 - shape={} code={} err={}", shape_id, err.code(), err);
            return;
        }

        log::error!("❌ 遮罩操作失败 - shape={} code={} err={}", shape_id, err.code(), err);
        let first_time = match self.session.lock() {
            Ok(mut session) => session.mark_notified(shape_id, err.code()),
            Err(_) => false,
        };
        if first_time {
            self.events.emit(MaskEvent::Notice {
                shape_id: shape_id.to_string(),
                level: NoticeLevel::Error,
                code: err.code(),
                message: err.to_string(),
            });
        }
    }

    fn notify_success_once(&self, shape_id: &str) {
        let first_time = match self.session.lock() {
            Ok(mut session) => session.mark_notified(shape_id, NOTICE_MASK_APPLIED),
            Err(_) => false,
        };
        if first_time {
            self.events.emit(MaskEvent::Notice {
                shape_id: shape_id.to_string(),
                level: NoticeLevel::Success,
                code: NOTICE_MASK_APPLIED,
                message: "遮罩已应用".to_string(),
            });
        }
    }

    /// 为形状应用遮罩。
    ///
    /// 加载失败或超时不会返回错误，而是以占位图完成遮罩。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use footprint_mask::{EngineConfig, MaskEngine, MemoryStore, RasterSource, SvgScene};
    ///
    /// # async fn demo(png: Vec<u8>) -> Result<(), footprint_mask::MaskError> {
    /// let scene = Arc::new(SvgScene::new());
    /// scene.mount_shape("footprint-1", "M0 0 L100 0 L100 50 L0 50 Z", None)?;
    ///
    /// let engine = MaskEngine::new(EngineConfig::default(), scene, Arc::new(MemoryStore::new()))?;
    /// engine.apply_mask("footprint-1", RasterSource::from_bytes(png, "plan.png")).await?;
    /// engine.flush_frame();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn apply_mask(&self, shape_id: &str, source: RasterSource) -> Result<(), MaskError> {
        let result = self.apply_internal(shape_id, source, false).await;
        if let Err(err) = &result {
            self.report_error(shape_id, err);
        }
        result
    }

    /// 替换形状的栅格：取代在途加载，保留变换状态。
    pub async fn replace_raster(&self, shape_id: &str, source: RasterSource) -> Result<(), MaskError> {
        log::info!("🔁 替换栅格 - shape={} 来源: {}", shape_id, source.hint());
        let result = self.apply_internal(shape_id, source, true).await;
        if let Err(err) = &result {
            self.report_error(shape_id, err);
        }
        result
    }

    async fn apply_internal(
        &self,
        shape_id: &str,
        source: RasterSource,
        supersede: bool,
    ) -> Result<(), MaskError> {
        let config = self.config_snapshot()?;
        let total_start = Instant::now();

        self.scene.wait_mounted(shape_id, config.mount_timeout()).await?;
        if self.scene.geometry(shape_id).is_none() {
            return Err(MaskError::MissingGeometry(shape_id.to_string()));
        }

        if !supersede && self.has_mask(shape_id) {
            log::debug!("✨ 形状已有遮罩，仅刷新标记 - shape={}", shape_id);
            return self.enqueue(shape_id, PendingWrite::Touch);
        }

        let ticket = {
            let mut session = self.lock_session()?;
            if !supersede && session.is_loading(shape_id) {
                log::debug!("⏳ 加载进行中，合并重复请求 - shape={}", shape_id);
                return Ok(());
            }
            session.begin_load(shape_id)
        };
        let guard = LoadingGuard::new(&self.session, shape_id, ticket);
        let previous = self.enter_load_phase(shape_id)?;

        let load_start = Instant::now();
        let outcome = self.loader.load(source, &config).await;
        let load_elapsed = load_start.elapsed();

        let current = self.lock_session()?.is_current(shape_id, guard.ticket());
        if !current {
            log::debug!("🕰️ 忽略过期的加载结果 - shape={} ticket={}", shape_id, ticket);
            return Ok(());
        }

        if !self.scene.is_live(shape_id) {
            self.set_phase(shape_id, MaskPhase::Unmasked)?;
            return Err(MaskError::DetachedElement(shape_id.to_string()));
        }

        let build_start = Instant::now();
        let committed = self.persist_and_commit(shape_id, &outcome, &config);
        let build_elapsed = build_start.elapsed();
        drop(guard);

        if let Err(err) = committed {
            self.settle_phase_after_error(shape_id, previous)?;
            return Err(err);
        }

        log::info!(
            "✅ 遮罩已应用 - shape={} ready={} load={}ms build={}ms total={}ms",
            shape_id,
            outcome.is_ready(),
            load_elapsed.as_millis(),
            build_elapsed.as_millis(),
            total_start.elapsed().as_millis()
        );
        self.notify_success_once(shape_id);
        Ok(())
    }

    /// 先构建资源对，构建成功后才持久化原始栅格并入队提交；构建失败不留下任何状态。
    fn persist_and_commit(
        &self,
        shape_id: &str,
        outcome: &super::loader::LoadOutcome,
        config: &EngineConfig,
    ) -> Result<(), MaskError> {
        let resource = self.build_resource(shape_id, &outcome.raster, config)?;
        if let Some(raw) = &outcome.raw {
            self.store.put_raster(shape_id, raw.bytes.clone(), &raw.file_name)?;
        }
        self.enqueue_commit(shape_id, resource, Arc::clone(&outcome.raster), outcome.state)
    }

    /// 用给定栅格与最新的几何、变换状态构建资源对并入队提交。
    fn commit_raster(
        &self,
        shape_id: &str,
        raster: Arc<PreparedRaster>,
        state: LoadState,
        config: &EngineConfig,
    ) -> Result<(), MaskError> {
        let resource = self.build_resource(shape_id, &raster, config)?;
        self.enqueue_commit(shape_id, resource, raster, state)
    }

    fn build_resource(
        &self,
        shape_id: &str,
        raster: &PreparedRaster,
        config: &EngineConfig,
    ) -> Result<ClipMaskResource, MaskError> {
        let geometry = self.scene.geometry(shape_id);
        let bbox = self
            .scene
            .bounding_box(shape_id)
            .ok_or_else(|| MaskError::DetachedElement(shape_id.to_string()))?;
        let transform = self.store.get_transform(shape_id)?.normalized(config.limits());

        builder::build(shape_id, geometry, bbox, raster, &transform, config)
    }

    fn enqueue_commit(
        &self,
        shape_id: &str,
        resource: ClipMaskResource,
        raster: Arc<PreparedRaster>,
        state: LoadState,
    ) -> Result<(), MaskError> {
        self.enqueue(shape_id, PendingWrite::Commit(Arc::new(resource)))?;

        {
            let mut records = self.lock_records()?;
            let record = records.entry(shape_id.to_string()).or_default();
            record.phase = MaskPhase::Masked;
            record.raster = Some(raster);
            record.load_state = Some(state);
        }

        self.events.mask_updated(shape_id);
        Ok(())
    }

    fn cached_raster(&self, shape_id: &str) -> Result<Option<(Arc<PreparedRaster>, LoadState)>, MaskError> {
        let records = self.lock_records()?;
        Ok(records.get(shape_id).and_then(|record| {
            match (record.phase, &record.raster) {
                (MaskPhase::Masked | MaskPhase::Refreshing, Some(raster)) => Some((
                    Arc::clone(raster),
                    record.load_state.unwrap_or(LoadState::Loaded),
                )),
                _ => None,
            }
        }))
    }

    /// 移除遮罩：恢复原外观，删除资源对，清除标记。
    pub fn remove_mask(&self, shape_id: &str) -> Result<(), MaskError> {
        if self.lock_session()?.cancel_load(shape_id) {
            log::debug!("✂️ 取消在途加载 - shape={}", shape_id);
        }
        self.enqueue(shape_id, PendingWrite::Remove)?;

        {
            let mut records = self.lock_records()?;
            if let Some(record) = records.get_mut(shape_id) {
                record.phase = MaskPhase::Unmasked;
                record.raster = None;
                record.load_state = None;
            }
        }

        log::info!("🧽 移除遮罩 - shape={}", shape_id);
        self.events.mask_updated(shape_id);
        Ok(())
    }

    /// 绘制层通知：形状几何已变化。
    ///
    /// 已有遮罩时用缓存的栅格按新几何重建；加载中的遮罩在提交时自然读取新几何。
    pub async fn on_shape_geometry_changed(&self, shape_id: &str) -> Result<(), MaskError> {
        let result = match self.phase(shape_id) {
            MaskPhase::Masked | MaskPhase::Refreshing => self.refresh(shape_id).await,
            MaskPhase::Loading | MaskPhase::Unmasked => Ok(()),
        };
        if let Err(err) = &result {
            self.report_error(shape_id, err);
        }
        result
    }

    async fn refresh(&self, shape_id: &str) -> Result<(), MaskError> {
        let config = self.config_snapshot()?;
        match self.cached_raster(shape_id)? {
            Some((raster, state)) => {
                let previous = self.enter_load_phase(shape_id)?;
                log::info!("🔄 几何变化，重建遮罩 - shape={}", shape_id);
                let result = self.commit_raster(shape_id, raster, state, &config);
                if result.is_err() {
                    self.settle_phase_after_error(shape_id, previous)?;
                }
                result
            }
            None => self.reapply_from_store(shape_id, true).await,
        }
    }

    /// 用持久化的原始栅格重新应用遮罩；没有原始栅格时不做任何事。
    pub(super) async fn reapply_from_store(&self, shape_id: &str, supersede: bool) -> Result<(), MaskError> {
        let Some(stored) = self.store.get_raster(shape_id)? else {
            log::debug!("📭 没有持久化的原始栅格 - shape={}", shape_id);
            return Ok(());
        };

        let source = RasterSource::Bytes {
            data: stored.data,
            file_name: stored.file_name,
        };
        self.apply_internal(shape_id, source, supersede).await
    }

    /// 渲染层通知：形状节点已被重建。
    ///
    /// 用缓存的栅格把遮罩重新提交到新节点上，不重新加载。
    /// `node` 不是当前节点时视为过期通知，返回 `Ok(false)`。
    pub fn on_node_replaced(&self, shape_id: &str, node: NodeRef) -> Result<bool, MaskError> {
        if self.scene.node_ref(shape_id) != Some(node) {
            log::debug!("🕰️ 忽略过期的节点替换通知 - shape={} node={}", shape_id, node.id());
            return Ok(false);
        }
        let Some((raster, state)) = self.cached_raster(shape_id)? else {
            return Ok(false);
        };

        let config = self.config_snapshot()?;
        let result = self.commit_raster(shape_id, raster, state, &config);
        if let Err(err) = &result {
            self.report_error(shape_id, err);
        }
        result.map(|_| true)
    }

    /// 视口变化（平移/缩放）后，重新提交属性被剥离的遮罩，返回重新提交的数量。
    pub fn on_viewport_changed(&self) -> Result<usize, MaskError> {
        let candidates: Vec<String> = self
            .lock_records()?
            .iter()
            .filter(|(_, record)| record.phase == MaskPhase::Masked && record.raster.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        let config = self.config_snapshot()?;
        let mut recommitted = 0;
        for shape_id in candidates {
            if self.pending_intent(&shape_id).is_some()
                || !self.scene.is_live(&shape_id)
                || builder::is_mask_present(&self.scene, &shape_id)
            {
                continue;
            }
            let Some((raster, state)) = self.cached_raster(&shape_id)? else {
                continue;
            };
            match self.commit_raster(&shape_id, raster, state, &config) {
                Ok(()) => recommitted += 1,
                Err(err) => self.report_error(&shape_id, &err),
            }
        }

        if recommitted > 0 {
            log::info!("🗺️ 视口变化后重新提交遮罩 - count={}", recommitted);
        }
        Ok(recommitted)
    }

    /// 形状被删除：丢弃待写入、清理资源对与会话状态，并删除持久化记录。
    pub fn forget_shape(&self, shape_id: &str) -> Result<(), MaskError> {
        let dropped = self.drop_pending(shape_id)?;
        self.lock_session()?.clear_shape(shape_id);
        let originals = self
            .lock_records()?
            .remove(shape_id)
            .and_then(|record| record.originals);

        let removed = builder::remove(&self.scene, shape_id, originals.as_ref())?;
        self.store.delete_shape(shape_id)?;
        self.scene.release_readiness(shape_id)?;

        log::info!(
            "🗑️ 已清理形状 - shape={} dropped_writes={} removed_defs={}",
            shape_id,
            dropped,
            removed
        );
        Ok(())
    }

    /// 会话结束：清空加载登记与一次性提示记录。
    pub fn end_session(&self) -> Result<(), MaskError> {
        self.lock_session()?.clear();
        log::info!("👋 遮罩会话已结束");
        Ok(())
    }
}
