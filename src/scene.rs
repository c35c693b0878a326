//! # 场景图模块
//!
//! ## 设计思路
//!
//! 遮罩引擎唯一的共享可变资源是“场景”：形状节点 + `<defs>` 中的 clip-path / pattern。
//! 这里用一个内存中的 SVG 场景图来表达它，扮演浏览器 DOM 的角色：
//!
//! - 绘制层通过 `mount_shape` / `update_geometry` / `unmount_shape` 管理形状节点，
//!   并通过 `geometry` / `bounding_box` 向引擎提供几何信息。
//! - 渲染层在重建节点时调用 `replace_node`，得到新的 `NodeRef`，
//!   再通过引擎的 `on_node_replaced` 回调显式通知，而不是由引擎监听整棵树。
//! - 引擎通过 `wait_mounted` 等待节点就绪（一次性 future），不做轮询重试。
//!
//! ## 实现思路
//!
//! - 内部状态集中在 `Mutex<SceneInner>`，锁中毒统一映射为 `MaskError::State`。
//! - 每个形状一个 `watch` 通道表示“是否已挂载”，`wait_mounted` 等待其变为 `true`。
//! - `to_svg` 输出完整 SVG 文本，供演示程序和断言使用。

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::MaskError;
use crate::geometry::{BoundingBox, PathData};
use crate::transform::format_number;

/// 节点句柄：每次挂载或重建都会分配新的值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(u64);

impl NodeRef {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// 场景中的形状节点（对应 `<path>` 元素）
#[derive(Debug, Clone)]
pub struct SceneNode {
    shape_id: String,
    node: NodeRef,
    geometry: Option<PathData>,
    bbox: BoundingBox,
    attributes: BTreeMap<String, String>,
    style: BTreeMap<String, String>,
}

impl SceneNode {
    pub fn shape_id(&self) -> &str {
        &self.shape_id
    }

    pub fn node_ref(&self) -> NodeRef {
        self.node
    }

    pub fn geometry(&self) -> Option<&PathData> {
        self.geometry.as_ref()
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// 移除属性；值为 `None` 的场景下用于恢复“原本不存在”的属性。
    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn style_property(&self, name: &str) -> Option<&str> {
        self.style.get(name).map(String::as_str)
    }

    pub fn set_style_property(&mut self, name: &str, value: impl Into<String>) {
        self.style.insert(name.to_string(), value.into());
    }

    pub fn remove_style_property(&mut self, name: &str) -> Option<String> {
        self.style.remove(name)
    }

    pub fn style(&self) -> &BTreeMap<String, String> {
        &self.style
    }

    pub fn set_style(&mut self, style: BTreeMap<String, String>) {
        self.style = style;
    }
}

/// `<clipPath>` 资源
#[derive(Debug, Clone, PartialEq)]
pub struct ClipPathDef {
    pub id: String,
    /// 所属形状；渲染层残留的同名资源没有 owner
    pub owner: Option<String>,
    pub path: PathData,
}

/// `<pattern>` 内唯一的 `<image>` 子元素
#[derive(Debug, Clone, PartialEq)]
pub struct PatternImage {
    pub href: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub transform: String,
}

/// `<pattern>` 资源
#[derive(Debug, Clone, PartialEq)]
pub struct PatternDef {
    pub id: String,
    pub owner: Option<String>,
    /// 图块区域，等于形状包围盒；viewBox 与之相同，使内容使用绝对局部坐标
    pub tile: BoundingBox,
    pub image: PatternImage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefResource {
    ClipPath(ClipPathDef),
    Pattern(PatternDef),
}

impl DefResource {
    pub fn id(&self) -> &str {
        match self {
            Self::ClipPath(def) => &def.id,
            Self::Pattern(def) => &def.id,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::ClipPath(def) => def.owner.as_deref(),
            Self::Pattern(def) => def.owner.as_deref(),
        }
    }
}

#[derive(Default)]
struct SceneInner {
    nodes: BTreeMap<String, SceneNode>,
    defs: BTreeMap<String, DefResource>,
    readiness: HashMap<String, watch::Sender<bool>>,
    next_node: u64,
}

impl SceneInner {
    fn allocate_node(&mut self) -> NodeRef {
        self.next_node += 1;
        NodeRef(self.next_node)
    }

    fn set_mounted(&mut self, shape_id: &str, mounted: bool) {
        self.readiness
            .entry(shape_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(mounted);
    }

    /// 节点不在场景中且无人等待时移除就绪通道。
    fn prune_readiness(&mut self, shape_id: &str) -> bool {
        if self.nodes.contains_key(shape_id) {
            return false;
        }
        match self.readiness.get(shape_id) {
            Some(sender) if sender.receiver_count() == 0 => {
                self.readiness.remove(shape_id);
                true
            }
            _ => false,
        }
    }
}

/// 内存 SVG 场景图
#[derive(Default)]
pub struct SvgScene {
    inner: Mutex<SceneInner>,
}

impl std::fmt::Debug for SvgScene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (nodes, defs) = match self.inner.lock() {
            Ok(inner) => (inner.nodes.len(), inner.defs.len()),
            Err(_) => (0, 0),
        };
        f.debug_struct("SvgScene")
            .field("nodes", &nodes)
            .field("defs", &defs)
            .finish()
    }
}

impl SvgScene {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SceneInner>, MaskError> {
        self.inner
            .lock()
            .map_err(|_| MaskError::State("场景锁已中毒".to_string()))
    }

    // ------------------------------------------------------------------
    // 绘制层 / 渲染层接口
    // ------------------------------------------------------------------

    /// 挂载形状节点。
    ///
    /// `bbox` 缺省时从路径坐标推导；路径为空时节点仍会挂载，但没有几何。
    pub fn mount_shape(
        &self,
        shape_id: &str,
        path_d: &str,
        bbox: Option<BoundingBox>,
    ) -> Result<NodeRef, MaskError> {
        let geometry = PathData::parse(path_d);
        let bbox = bbox
            .or_else(|| geometry.as_ref().and_then(PathData::bounding_box))
            .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));

        let mut inner = self.lock()?;
        let node = inner.allocate_node();
        inner.nodes.insert(
            shape_id.to_string(),
            SceneNode {
                shape_id: shape_id.to_string(),
                node,
                geometry,
                bbox,
                attributes: BTreeMap::new(),
                style: BTreeMap::new(),
            },
        );
        inner.set_mounted(shape_id, true);

        log::debug!("🧱 挂载形状节点 - shape={} node={}", shape_id, node.0);
        Ok(node)
    }

    /// 更新形状几何（用户编辑了顶点）。
    pub fn update_geometry(
        &self,
        shape_id: &str,
        path_d: &str,
        bbox: Option<BoundingBox>,
    ) -> Result<(), MaskError> {
        let geometry = PathData::parse(path_d);
        let bbox = bbox
            .or_else(|| geometry.as_ref().and_then(PathData::bounding_box))
            .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));

        let mut inner = self.lock()?;
        let node = inner
            .nodes
            .get_mut(shape_id)
            .ok_or_else(|| MaskError::DetachedElement(shape_id.to_string()))?;
        node.geometry = geometry;
        node.bbox = bbox;
        Ok(())
    }

    /// 渲染层重建节点：几何保留，属性替换为渲染层给出的基础属性。
    pub fn replace_node(
        &self,
        shape_id: &str,
        attributes: &[(&str, &str)],
    ) -> Result<NodeRef, MaskError> {
        let mut inner = self.lock()?;
        let node_ref = inner.allocate_node();
        let node = inner
            .nodes
            .get_mut(shape_id)
            .ok_or_else(|| MaskError::DetachedElement(shape_id.to_string()))?;

        node.node = node_ref;
        node.attributes = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        node.style.clear();
        Ok(node_ref)
    }

    /// 卸载形状节点（用户删除形状）。defs 不在这里清理，由引擎负责。
    pub fn unmount_shape(&self, shape_id: &str) -> Result<bool, MaskError> {
        let mut inner = self.lock()?;
        let removed = inner.nodes.remove(shape_id).is_some();
        inner.set_mounted(shape_id, false);
        inner.prune_readiness(shape_id);
        Ok(removed)
    }

    pub fn set_attribute(&self, shape_id: &str, name: &str, value: &str) -> Result<(), MaskError> {
        self.with_node_mut(shape_id, |node| node.set_attribute(name, value))
    }

    pub fn remove_attribute(&self, shape_id: &str, name: &str) -> Result<Option<String>, MaskError> {
        self.with_node_mut(shape_id, |node| node.remove_attribute(name))
    }

    // ------------------------------------------------------------------
    // 引擎读取接口
    // ------------------------------------------------------------------

    pub fn geometry(&self, shape_id: &str) -> Option<PathData> {
        let inner = self.inner.lock().ok()?;
        inner.nodes.get(shape_id)?.geometry.clone()
    }

    pub fn bounding_box(&self, shape_id: &str) -> Option<BoundingBox> {
        let inner = self.inner.lock().ok()?;
        inner.nodes.get(shape_id).map(|node| node.bbox)
    }

    /// 形状节点是否仍在场景中（所有延迟写入前的存活检查）。
    pub fn is_live(&self, shape_id: &str) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.nodes.contains_key(shape_id),
            Err(_) => false,
        }
    }

    pub fn node_ref(&self, shape_id: &str) -> Option<NodeRef> {
        let inner = self.inner.lock().ok()?;
        inner.nodes.get(shape_id).map(|node| node.node)
    }

    /// 读取节点快照。
    pub fn node(&self, shape_id: &str) -> Option<SceneNode> {
        let inner = self.inner.lock().ok()?;
        inner.nodes.get(shape_id).cloned()
    }

    pub fn shape_ids(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner.nodes.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// 等待形状节点挂载。已挂载时立即返回。
    pub async fn wait_mounted(&self, shape_id: &str, timeout: Duration) -> Result<(), MaskError> {
        let mut receiver = {
            let mut inner = self.lock()?;
            inner
                .readiness
                .entry(shape_id.to_string())
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };

        let mounted = match tokio::time::timeout(timeout, receiver.wait_for(|mounted| *mounted)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                log::warn!(
                    "⏱️ 等待形状节点挂载超时（{}ms）- shape={}",
                    timeout.as_millis(),
                    shape_id
                );
                false
            }
        };
        drop(receiver);

        if mounted {
            return Ok(());
        }
        self.lock()?.prune_readiness(shape_id);
        Err(MaskError::DetachedElement(shape_id.to_string()))
    }

    /// 形状被遗忘后释放其就绪通道；节点仍挂载或仍有等待者时保留。
    pub fn release_readiness(&self, shape_id: &str) -> Result<bool, MaskError> {
        Ok(self.lock()?.prune_readiness(shape_id))
    }

    pub(crate) fn with_node_mut<T>(
        &self,
        shape_id: &str,
        op: impl FnOnce(&mut SceneNode) -> T,
    ) -> Result<T, MaskError> {
        let mut inner = self.lock()?;
        let node = inner
            .nodes
            .get_mut(shape_id)
            .ok_or_else(|| MaskError::DetachedElement(shape_id.to_string()))?;
        Ok(op(node))
    }

    // ------------------------------------------------------------------
    // defs
    // ------------------------------------------------------------------

    pub fn def(&self, id: &str) -> Option<DefResource> {
        let inner = self.inner.lock().ok()?;
        inner.defs.get(id).cloned()
    }

    pub fn has_clip_path(&self, id: &str) -> bool {
        matches!(self.def(id), Some(DefResource::ClipPath(_)))
    }

    pub fn has_pattern(&self, id: &str) -> bool {
        matches!(self.def(id), Some(DefResource::Pattern(_)))
    }

    /// 插入资源；同名资源已存在时返回 `ResourceConflict`，不会覆盖。
    pub fn insert_def(&self, def: DefResource) -> Result<(), MaskError> {
        let mut inner = self.lock()?;
        if inner.defs.contains_key(def.id()) {
            return Err(MaskError::ResourceConflict(def.id().to_string()));
        }
        inner.defs.insert(def.id().to_string(), def);
        Ok(())
    }

    /// 移除属于 `owner` 的指定资源，返回移除数量。
    ///
    /// owner 不匹配的同名资源保持不动。
    pub fn remove_owned_defs(&self, owner: &str, ids: &[&str]) -> Result<usize, MaskError> {
        let mut inner = self.lock()?;
        let mut removed = 0;
        for id in ids {
            let owned = inner
                .defs
                .get(*id)
                .is_some_and(|def| def.owner() == Some(owner));
            if owned {
                inner.defs.remove(*id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 无条件移除资源。
    pub fn force_remove_def(&self, id: &str) -> Result<bool, MaskError> {
        let mut inner = self.lock()?;
        Ok(inner.defs.remove(id).is_some())
    }

    /// 引用了某个形状的资源 id（owner 匹配）。
    pub fn defs_owned_by(&self, owner: &str) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner
                .defs
                .values()
                .filter(|def| def.owner() == Some(owner))
                .map(|def| def.id().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn readiness_len(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.readiness.len(),
            Err(_) => 0,
        }
    }

    pub fn def_count(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.defs.len(),
            Err(_) => 0,
        }
    }

    /// 更新 pattern 图片的变换，pattern 不存在时返回 `false`。
    pub fn set_pattern_transform(&self, pattern_id: &str, transform: &str) -> Result<bool, MaskError> {
        let mut inner = self.lock()?;
        match inner.defs.get_mut(pattern_id) {
            Some(DefResource::Pattern(pattern)) => {
                pattern.image.transform = transform.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // 序列化
    // ------------------------------------------------------------------

    /// 输出完整 SVG 文本。
    pub fn to_svg(&self) -> Result<String, MaskError> {
        let inner = self.lock()?;
        let mut out = String::new();
        let _ = writeln!(out, r#"<svg xmlns="http://www.w3.org/2000/svg">"#);
        let _ = writeln!(out, "  <defs>");
        for def in inner.defs.values() {
            match def {
                DefResource::ClipPath(clip) => {
                    let _ = writeln!(
                        out,
                        r#"    <clipPath id="{}" clipPathUnits="userSpaceOnUse"><path d="{}"/></clipPath>"#,
                        escape_attr(&clip.id),
                        escape_attr(clip.path.as_str())
                    );
                }
                DefResource::Pattern(pattern) => {
                    let tile = pattern.tile;
                    let image = &pattern.image;
                    let _ = writeln!(
                        out,
                        r#"    <pattern id="{}" patternUnits="userSpaceOnUse" x="{}" y="{}" width="{}" height="{}" viewBox="{} {} {} {}"><image href="{}" x="{}" y="{}" width="{}" height="{}" preserveAspectRatio="none" transform="{}"/></pattern>"#,
                        escape_attr(&pattern.id),
                        format_number(tile.x),
                        format_number(tile.y),
                        format_number(tile.width),
                        format_number(tile.height),
                        format_number(tile.x),
                        format_number(tile.y),
                        format_number(tile.width),
                        format_number(tile.height),
                        escape_attr(&image.href),
                        format_number(image.x),
                        format_number(image.y),
                        format_number(image.width),
                        format_number(image.height),
                        escape_attr(&image.transform)
                    );
                }
            }
        }
        let _ = writeln!(out, "  </defs>");

        for node in inner.nodes.values() {
            let _ = write!(out, r#"  <path data-shape-id="{}""#, escape_attr(&node.shape_id));
            if let Some(geometry) = &node.geometry {
                let _ = write!(out, r#" d="{}""#, escape_attr(geometry.as_str()));
            }
            for (name, value) in &node.attributes {
                let _ = write!(out, r#" {}="{}""#, name, escape_attr(value));
            }
            if !node.style.is_empty() {
                let style = node
                    .style
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                let _ = write!(out, r#" style="{}""#, escape_attr(&style));
            }
            let _ = writeln!(out, "/>");
        }
        out.push_str("</svg>\n");
        Ok(out)
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// 解析 `url(#id)` 形式的引用，返回 id。
pub fn parse_url_reference(value: &str) -> Option<&str> {
    let inner = value.trim().strip_prefix("url(")?.strip_suffix(')')?;
    let inner = inner.trim().trim_matches(|c| c == '"' || c == '\'');
    inner.strip_prefix('#').filter(|id| !id.is_empty())
}
