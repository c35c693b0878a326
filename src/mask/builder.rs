//! # 遮罩资源构建模块
//!
//! ## 设计思路
//!
//! 每个形状至多拥有一对资源：`clip-<id>`（引用形状几何）与 `pattern-<id>`（内含一张图片）。
//! 这里负责：
//! - 由拟合结果与变换状态构建资源对（纯计算，不触碰场景）
//! - 在帧边界把资源对提交到场景 / 从场景移除
//! - 判断形状当前是否“已有遮罩”
//!
//! ## 实现思路
//!
//! - 提交前先移除本形状名下的旧资源对，保证同一 id 不会出现两份资源。
//! - 同名资源若不属于本形状（渲染层残留），记录警告后强制移除并重试一次，仍失败则上报冲突。
//! - 形状的 fill / clip-path 同时写入属性与内联样式，两种形式保持一致。
//! - 首次提交前记录形状原本的外观，移除遮罩时按原样恢复（原本不存在的属性会被删除）。

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::error::MaskError;
use crate::geometry::{fit_or_fallback, BoundingBox, FitResult, PathData};
use crate::scene::{parse_url_reference, ClipPathDef, DefResource, PatternDef, PatternImage, SceneNode, SvgScene};
use crate::transform::{TransformState, ATTR_OFFSET_X, ATTR_OFFSET_Y, ATTR_ROTATION, ATTR_SCALE};

use super::source::PreparedRaster;

/// 遮罩标记属性
pub const ATTR_MASK_APPLIED: &str = "data-mask-applied";
/// 最近一次更新时间（毫秒时间戳）
pub const ATTR_MASK_UPDATED: &str = "data-mask-updated";

pub fn clip_path_id(shape_id: &str) -> String {
    format!("clip-{}", shape_id)
}

pub fn pattern_id(shape_id: &str) -> String {
    format!("pattern-{}", shape_id)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 一个形状的 clip-path + pattern 资源对
#[derive(Debug, Clone, PartialEq)]
pub struct ClipMaskResource {
    pub shape_id: String,
    pub clip_path: ClipPathDef,
    pub pattern: PatternDef,
    pub fit: FitResult,
    pub transform: TransformState,
}

/// 形状在首次加遮罩前的外观
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OriginalAppearance {
    pub fill: Option<String>,
    pub fill_opacity: Option<String>,
    pub stroke: Option<String>,
    pub clip_path: Option<String>,
    pub style: BTreeMap<String, String>,
}

impl OriginalAppearance {
    pub fn capture(node: &SceneNode) -> Self {
        Self {
            fill: node.attribute("fill").map(str::to_string),
            fill_opacity: node.attribute("fill-opacity").map(str::to_string),
            stroke: node.attribute("stroke").map(str::to_string),
            clip_path: node.attribute("clip-path").map(str::to_string),
            style: node.style().clone(),
        }
    }

    fn restore(&self, node: &mut SceneNode) {
        restore_attribute(node, "fill", self.fill.as_deref());
        restore_attribute(node, "fill-opacity", self.fill_opacity.as_deref());
        restore_attribute(node, "stroke", self.stroke.as_deref());
        restore_attribute(node, "clip-path", self.clip_path.as_deref());
        node.set_style(self.style.clone());
    }
}

fn restore_attribute(node: &mut SceneNode, name: &str, value: Option<&str>) {
    match value {
        Some(value) => node.set_attribute(name, value),
        None => {
            node.remove_attribute(name);
        }
    }
}

/// 构建资源对。
///
/// 没有几何时返回 `MissingGeometry`；包围盒非法时返回几何错误；
/// 图片尺寸非法时改用占位尺寸拟合。
pub fn build(
    shape_id: &str,
    geometry: Option<PathData>,
    bbox: BoundingBox,
    raster: &PreparedRaster,
    transform: &TransformState,
    config: &EngineConfig,
) -> Result<ClipMaskResource, MaskError> {
    let geometry = geometry.ok_or_else(|| MaskError::MissingGeometry(shape_id.to_string()))?;
    let fit = fit_or_fallback(
        bbox,
        raster.width,
        raster.height,
        config.placeholder_size(),
        config.overscan,
    )?;
    let transform = transform.normalized(config.limits());

    Ok(ClipMaskResource {
        shape_id: shape_id.to_string(),
        clip_path: ClipPathDef {
            id: clip_path_id(shape_id),
            owner: Some(shape_id.to_string()),
            path: geometry,
        },
        pattern: PatternDef {
            id: pattern_id(shape_id),
            owner: Some(shape_id.to_string()),
            tile: bbox,
            image: PatternImage {
                href: raster.href.clone(),
                x: fit.offset_x,
                y: fit.offset_y,
                width: fit.scaled_width,
                height: fit.scaled_height,
                transform: transform.composed_transform(&bbox),
            },
        },
        fit,
        transform,
    })
}

fn insert_with_retry(scene: &SvgScene, def: DefResource) -> Result<(), MaskError> {
    match scene.insert_def(def.clone()) {
        Err(MaskError::ResourceConflict(id)) => {
            log::warn!("⚠️ 遮罩资源冲突，强制移除后重试 - id={}", id);
            scene.force_remove_def(&id)?;
            scene.insert_def(def)
        }
        other => other,
    }
}

/// 把资源对提交到场景。
pub(crate) fn commit(
    scene: &SvgScene,
    resource: &ClipMaskResource,
    updated_at: i64,
) -> Result<(), MaskError> {
    let shape_id = resource.shape_id.as_str();
    let clip_id = clip_path_id(shape_id);
    let pattern_id = pattern_id(shape_id);

    scene.remove_owned_defs(shape_id, &[clip_id.as_str(), pattern_id.as_str()])?;
    insert_with_retry(scene, DefResource::ClipPath(resource.clip_path.clone()))?;
    if let Err(err) = insert_with_retry(scene, DefResource::Pattern(resource.pattern.clone())) {
        scene.remove_owned_defs(shape_id, &[clip_id.as_str()])?;
        return Err(err);
    }

    let written = scene.with_node_mut(shape_id, |node| {
        let fill_ref = format!("url(#{})", pattern_id);
        let clip_ref = format!("url(#{})", clip_id);

        node.set_attribute("fill", fill_ref.as_str());
        node.set_attribute("clip-path", clip_ref.as_str());
        node.set_attribute("fill-opacity", "1");
        node.set_style_property("fill", fill_ref);
        node.set_style_property("clip-path", clip_ref);
        node.set_attribute(ATTR_MASK_APPLIED, "true");
        node.set_attribute(ATTR_MASK_UPDATED, updated_at.to_string());
        for (name, value) in resource.transform.to_attributes() {
            node.set_attribute(name, value);
        }
    });

    if let Err(err) = written {
        scene.remove_owned_defs(shape_id, &[clip_id.as_str(), pattern_id.as_str()])?;
        return Err(err);
    }
    Ok(())
}

/// 从场景移除资源对并恢复形状外观，返回移除的资源数量。
pub(crate) fn remove(
    scene: &SvgScene,
    shape_id: &str,
    originals: Option<&OriginalAppearance>,
) -> Result<usize, MaskError> {
    let clip_id = clip_path_id(shape_id);
    let pattern_id = pattern_id(shape_id);
    let removed = scene.remove_owned_defs(shape_id, &[clip_id.as_str(), pattern_id.as_str()])?;

    if scene.is_live(shape_id) {
        scene.with_node_mut(shape_id, |node| {
            match originals {
                Some(originals) => originals.restore(node),
                None => strip_mask_references(node, &clip_id, &pattern_id),
            }
            for name in [
                ATTR_MASK_APPLIED,
                ATTR_MASK_UPDATED,
                ATTR_ROTATION,
                ATTR_SCALE,
                ATTR_OFFSET_X,
                ATTR_OFFSET_Y,
            ] {
                node.remove_attribute(name);
            }
        })?;
    }

    Ok(removed)
}

fn strip_mask_references(node: &mut SceneNode, clip_id: &str, pattern_id: &str) {
    let points_to = |value: Option<&str>, id: &str| value.and_then(parse_url_reference) == Some(id);

    if points_to(node.attribute("fill"), pattern_id) {
        node.remove_attribute("fill");
    }
    if points_to(node.attribute("clip-path"), clip_id) {
        node.remove_attribute("clip-path");
    }
    if points_to(node.style_property("fill"), pattern_id) {
        node.remove_style_property("fill");
    }
    if points_to(node.style_property("clip-path"), clip_id) {
        node.remove_style_property("clip-path");
    }
}

/// 遮罩存在判定：标记存在，且 clip-path 与 fill 引用都能解析到现存资源。
pub fn is_mask_present(scene: &SvgScene, shape_id: &str) -> bool {
    let Some(node) = scene.node(shape_id) else {
        return false;
    };
    if node.attribute(ATTR_MASK_APPLIED) != Some("true") {
        return false;
    }

    let clip = node
        .attribute("clip-path")
        .or_else(|| node.style_property("clip-path"))
        .and_then(parse_url_reference);
    let fill = node
        .attribute("fill")
        .or_else(|| node.style_property("fill"))
        .and_then(parse_url_reference);

    match (clip, fill) {
        (Some(clip), Some(fill)) => scene.has_clip_path(clip) && scene.has_pattern(fill),
        _ => false,
    }
}

/// 仅刷新更新时间标记。
pub(crate) fn touch(scene: &SvgScene, shape_id: &str, updated_at: i64) -> Result<bool, MaskError> {
    if !is_mask_present(scene, shape_id) {
        return Ok(false);
    }
    scene.with_node_mut(shape_id, |node| {
        node.set_attribute(ATTR_MASK_UPDATED, updated_at.to_string());
    })?;
    Ok(true)
}

/// 把新的合成变换写到 pattern 图片上，并同步扁平属性与更新时间。
///
/// 形状尚无遮罩时不写入，返回 `false`；构建遮罩时会读取最新状态。
pub(crate) fn update_transform(
    scene: &SvgScene,
    shape_id: &str,
    transform: &TransformState,
    updated_at: i64,
) -> Result<bool, MaskError> {
    if !is_mask_present(scene, shape_id) {
        return Ok(false);
    }
    let Some(bbox) = scene.bounding_box(shape_id) else {
        return Ok(false);
    };

    if !scene.set_pattern_transform(&pattern_id(shape_id), &transform.composed_transform(&bbox))? {
        return Ok(false);
    }
    scene.with_node_mut(shape_id, |node| {
        for (name, value) in transform.to_attributes() {
            node.set_attribute(name, value);
        }
        node.set_attribute(ATTR_MASK_UPDATED, updated_at.to_string());
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECT: &str = "M0 0 L100 0 L100 50 L0 50 Z";

    fn raster(width: u32, height: u32) -> PreparedRaster {
        PreparedRaster {
            width,
            height,
            href: "data:image/png;base64,AAAA".to_string(),
            mime: "image/png".to_string(),
            fingerprint: 1,
        }
    }

    fn mounted_scene() -> SvgScene {
        let scene = SvgScene::new();
        scene.mount_shape("a", RECT, None).expect("mount");
        scene.set_attribute("a", "fill", "#3388ff").expect("fill");
        scene.set_attribute("a", "stroke", "#222").expect("stroke");
        scene
    }

    fn build_for(scene: &SvgScene, transform: &TransformState) -> ClipMaskResource {
        build(
            "a",
            scene.geometry("a"),
            scene.bounding_box("a").expect("bbox"),
            &raster(200, 200),
            transform,
            &EngineConfig::default(),
        )
        .expect("build")
    }

    #[test]
    fn build_positions_image_by_cover_fit() {
        let scene = mounted_scene();
        let resource = build_for(&scene, &TransformState::default());
        let image = &resource.pattern.image;

        assert!((image.width - 105.0).abs() < 1e-9);
        assert!((image.height - 105.0).abs() < 1e-9);
        assert!((image.x + 2.5).abs() < 1e-9);
        assert!((image.y + 27.5).abs() < 1e-9);
        assert_eq!(image.transform, "translate(0,0) rotate(0,50,25) scale(1)");
        assert_eq!(resource.clip_path.path.as_str(), RECT);
    }

    #[test]
    fn build_without_geometry_fails() {
        let result = build(
            "a",
            None,
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            &raster(10, 10),
            &TransformState::default(),
            &EngineConfig::default(),
        );
        assert!(matches!(result, Err(MaskError::MissingGeometry(_))));
    }

    #[test]
    fn build_substitutes_placeholder_dimensions_for_zero_image() {
        let scene = mounted_scene();
        let resource = build(
            "a",
            scene.geometry("a"),
            scene.bounding_box("a").expect("bbox"),
            &raster(0, 0),
            &TransformState::default(),
            &EngineConfig::default(),
        )
        .expect("build");

        assert!(resource.pattern.image.width.is_finite());
        assert!(resource.pattern.image.width >= 100.0);
    }

    #[test]
    fn commit_wires_attributes_and_style() {
        let scene = mounted_scene();
        commit(&scene, &build_for(&scene, &TransformState::default()), 42).expect("commit");

        let node = scene.node("a").expect("node");
        assert_eq!(node.attribute("fill"), Some("url(#pattern-a)"));
        assert_eq!(node.attribute("clip-path"), Some("url(#clip-a)"));
        assert_eq!(node.style_property("fill"), Some("url(#pattern-a)"));
        assert_eq!(node.style_property("clip-path"), Some("url(#clip-a)"));
        assert_eq!(node.attribute(ATTR_MASK_UPDATED), Some("42"));
        assert_eq!(node.attribute(ATTR_SCALE), Some("1"));
        assert!(is_mask_present(&scene, "a"));
    }

    #[test]
    fn recommit_keeps_single_pair() {
        let scene = mounted_scene();
        let resource = build_for(&scene, &TransformState::default());

        commit(&scene, &resource, 1).expect("first commit");
        commit(&scene, &resource, 2).expect("second commit");

        assert_eq!(scene.def_count(), 2);
        assert_eq!(scene.defs_owned_by("a").len(), 2);
    }

    #[test]
    fn commit_replaces_foreign_leftover() {
        let scene = mounted_scene();
        scene
            .insert_def(DefResource::ClipPath(ClipPathDef {
                id: "clip-a".to_string(),
                owner: None,
                path: PathData::parse("M0 0 L1 1 Z").expect("path"),
            }))
            .expect("seed leftover");

        commit(&scene, &build_for(&scene, &TransformState::default()), 1).expect("commit");

        match scene.def("clip-a") {
            Some(DefResource::ClipPath(clip)) => assert_eq!(clip.owner.as_deref(), Some("a")),
            other => panic!("unexpected def: {:?}", other),
        }
    }

    #[test]
    fn remove_restores_original_appearance() {
        let scene = mounted_scene();
        let originals = OriginalAppearance::capture(&scene.node("a").expect("node"));
        commit(&scene, &build_for(&scene, &TransformState::default()), 1).expect("commit");

        let removed = remove(&scene, "a", Some(&originals)).expect("remove");
        let node = scene.node("a").expect("node");

        assert_eq!(removed, 2);
        assert_eq!(node.attribute("fill"), Some("#3388ff"));
        assert_eq!(node.attribute("stroke"), Some("#222"));
        assert_eq!(node.attribute("clip-path"), None);
        assert_eq!(node.attribute("fill-opacity"), None);
        assert_eq!(node.attribute(ATTR_MASK_APPLIED), None);
        assert!(node.style().is_empty());
        assert_eq!(scene.def_count(), 0);
    }

    #[test]
    fn mask_presence_requires_resolvable_references() {
        let scene = mounted_scene();
        commit(&scene, &build_for(&scene, &TransformState::default()), 1).expect("commit");

        scene.force_remove_def("pattern-a").expect("drop pattern");
        assert!(!is_mask_present(&scene, "a"));
    }

    #[test]
    fn update_transform_rewrites_pattern_image() {
        let scene = mounted_scene();
        commit(&scene, &build_for(&scene, &TransformState::default()), 1).expect("commit");

        let state = TransformState {
            rotation_degrees: 90,
            scale: 2.0,
            offset_x: 10.0,
            offset_y: 5.0,
        };
        assert!(update_transform(&scene, "a", &state, 7).expect("update"));

        match scene.def("pattern-a") {
            Some(DefResource::Pattern(pattern)) => assert_eq!(
                pattern.image.transform,
                "translate(10,5) rotate(90,50,25) scale(2)"
            ),
            other => panic!("unexpected def: {:?}", other),
        }
        let node = scene.node("a").expect("node");
        assert_eq!(node.attribute(ATTR_ROTATION), Some("90"));
        assert_eq!(node.attribute(ATTR_MASK_UPDATED), Some("7"));
    }

    #[test]
    fn update_transform_without_mask_is_skipped() {
        let scene = mounted_scene();
        let updated = update_transform(&scene, "a", &TransformState::default(), 1).expect("update");
        assert!(!updated);
    }
}
