use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use footprint_mask::mask::{is_mask_present, pattern_id, LoadState, NoticeLevel, ATTR_MASK_APPLIED};
use footprint_mask::scene::DefResource;
use footprint_mask::{
    EngineConfig, MaskEngine, MaskError, MaskEvent, MaskPhase, MaskStore, MemoryStore, RasterSource,
    SvgScene,
};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
use tokio::sync::oneshot;

const RECT: &str = "M0 0 L100 0 L100 50 L0 50 Z";

fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128u8, 255u8])
    });
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("failed to encode test image");
    cursor.into_inner()
}

fn setup() -> (Arc<MaskEngine>, Arc<MemoryStore>) {
    let scene = Arc::new(SvgScene::new());
    scene.mount_shape("a", RECT, None).expect("mount");
    scene
        .set_attribute("a", "fill", "#3388ff")
        .expect("set fill");
    let store = Arc::new(MemoryStore::new());
    let engine = MaskEngine::new(
        EngineConfig::default(),
        scene,
        Arc::clone(&store) as Arc<dyn MaskStore>,
    )
    .expect("engine init failed");
    (Arc::new(engine), store)
}

fn drain_success_notices(rx: &mut tokio::sync::broadcast::Receiver<MaskEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if let MaskEvent::Notice {
            level: NoticeLevel::Success,
            ..
        } = event
        {
            count += 1;
        }
    }
    count
}

fn pattern_image_size(engine: &MaskEngine, shape_id: &str) -> (f64, f64) {
    match engine.scene().def(&pattern_id(shape_id)) {
        Some(DefResource::Pattern(pattern)) => (pattern.image.width, pattern.image.height),
        other => panic!("unexpected def: {:?}", other),
    }
}

#[tokio::test]
async fn repeated_apply_during_load_collapses_to_one_mask() {
    let (engine, _store) = setup();
    let mut events = engine.subscribe();

    let (tx, rx) = oneshot::channel::<Bytes>();
    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .apply_mask(
                    "a",
                    RasterSource::Deferred {
                        receiver: rx,
                        file_name: "plan.png".to_string(),
                    },
                )
                .await
        })
    };

    while !engine.is_loading("a") {
        tokio::task::yield_now().await;
    }
    assert_eq!(engine.phase("a"), MaskPhase::Loading);

    let (_unused_tx, unused_rx) = oneshot::channel::<Bytes>();
    engine
        .apply_mask(
            "a",
            RasterSource::Deferred {
                receiver: unused_rx,
                file_name: "plan.png".to_string(),
            },
        )
        .await
        .expect("collapsed apply");

    tx.send(Bytes::from(create_png_bytes(64, 64)))
        .expect("send upload bytes");
    first.await.expect("join").expect("first apply");

    engine.flush_frame();
    assert_eq!(engine.scene().def_count(), 2);
    assert!(is_mask_present(engine.scene(), "a"));

    engine
        .apply_mask("a", RasterSource::from_bytes(create_png_bytes(64, 64), "plan.png"))
        .await
        .expect("apply on masked shape");
    engine.flush_frame();

    assert_eq!(engine.scene().def_count(), 2);
    assert_eq!(drain_success_notices(&mut events), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_load_degrades_to_placeholder() {
    let (engine, store) = setup();
    let (_tx, rx) = oneshot::channel::<Bytes>();

    engine
        .apply_mask(
            "a",
            RasterSource::Deferred {
                receiver: rx,
                file_name: "stalled.png".to_string(),
            },
        )
        .await
        .expect("degraded apply still succeeds");

    assert_eq!(engine.phase("a"), MaskPhase::Masked);
    assert_eq!(engine.load_state("a"), Some(LoadState::Failed));
    assert!(store.get_raster("a").expect("get raster").is_none());

    engine.flush_frame();
    let (width, height) = pattern_image_size(&engine, "a");
    assert!((width - 105.0).abs() < 1e-9);
    assert!((height - 105.0).abs() < 1e-9);
}

#[tokio::test]
async fn remove_restores_original_appearance() {
    let (engine, _store) = setup();
    engine
        .apply_mask("a", RasterSource::from_bytes(create_png_bytes(40, 40), "plan.png"))
        .await
        .expect("apply");
    engine.flush_frame();

    let node = engine.scene().node("a").expect("node");
    assert_eq!(node.attribute("fill"), Some("url(#pattern-a)"));

    engine.remove_mask("a").expect("remove");
    assert!(!engine.has_mask("a"));
    engine.flush_frame();

    let node = engine.scene().node("a").expect("node");
    assert_eq!(node.attribute("fill"), Some("#3388ff"));
    assert_eq!(node.attribute("clip-path"), None);
    assert_eq!(node.attribute(ATTR_MASK_APPLIED), None);
    assert_eq!(engine.scene().def_count(), 0);
    assert_eq!(engine.phase("a"), MaskPhase::Unmasked);
}

#[tokio::test]
async fn remove_during_load_discards_late_result() {
    let (engine, _store) = setup();
    let (tx, rx) = oneshot::channel::<Bytes>();
    let pending = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .apply_mask(
                    "a",
                    RasterSource::Deferred {
                        receiver: rx,
                        file_name: "late.png".to_string(),
                    },
                )
                .await
        })
    };

    while !engine.is_loading("a") {
        tokio::task::yield_now().await;
    }
    engine.remove_mask("a").expect("remove");

    tx.send(Bytes::from(create_png_bytes(16, 16)))
        .expect("send upload bytes");
    pending.await.expect("join").expect("stale apply");

    engine.flush_frame();
    assert_eq!(engine.scene().def_count(), 0);
    assert!(!engine.has_mask("a"));
}

#[tokio::test]
async fn shape_removed_before_mount_reports_detached() {
    let scene = Arc::new(SvgScene::new());
    let mut config = EngineConfig::default();
    config.mount_timeout_ms = 20;
    let engine = MaskEngine::new(config, scene, Arc::new(MemoryStore::new()))
        .expect("engine init failed");
    let mut events = engine.subscribe();

    let result = engine
        .apply_mask("ghost", RasterSource::from_bytes(create_png_bytes(8, 8), "a.png"))
        .await;
    assert!(matches!(result, Err(MaskError::DetachedElement(_))));

    let again = engine
        .apply_mask("ghost", RasterSource::from_bytes(create_png_bytes(8, 8), "a.png"))
        .await;
    assert!(again.is_err());

    let mut error_notices = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MaskEvent::Notice { level: NoticeLevel::Error, .. }) {
            error_notices += 1;
        }
    }
    assert_eq!(error_notices, 1);
}

#[tokio::test]
async fn unmounted_shape_drops_pending_writes() {
    let (engine, _store) = setup();
    engine
        .apply_mask("a", RasterSource::from_bytes(create_png_bytes(32, 32), "plan.png"))
        .await
        .expect("apply");

    engine.scene().unmount_shape("a").expect("unmount");
    let stats = engine.flush_frame();

    assert_eq!(stats.dropped, 1);
    assert_eq!(engine.scene().def_count(), 0);
}

#[tokio::test]
async fn replace_raster_keeps_transform() {
    let (engine, store) = setup();
    engine
        .apply_mask("a", RasterSource::from_bytes(create_png_bytes(100, 100), "first.png"))
        .await
        .expect("apply");
    engine.rotate("a", 90).expect("rotate");
    engine.flush_frame();

    engine
        .replace_raster("a", RasterSource::from_bytes(create_png_bytes(200, 50), "second.png"))
        .await
        .expect("replace");
    engine.flush_frame();

    let stored = store.get_raster("a").expect("get raster").expect("stored raster");
    assert_eq!(stored.file_name, "second.png");
    assert_eq!(engine.transform_of("a").expect("transform").rotation_degrees, 90);

    let node = engine.scene().node("a").expect("node");
    assert_eq!(node.attribute("data-mask-rotation"), Some("90"));
    assert_eq!(engine.scene().def_count(), 2);

    // 200x50 覆盖 100x50：scale = max(0.5, 1.0) * 1.05
    let (width, height) = pattern_image_size(&engine, "a");
    assert!((width - 210.0).abs() < 1e-9);
    assert!((height - 52.5).abs() < 1e-9);
}

#[tokio::test]
async fn geometry_edit_during_load_uses_latest_geometry() {
    let (engine, _store) = setup();
    let (tx, rx) = oneshot::channel::<Bytes>();
    let pending = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .apply_mask(
                    "a",
                    RasterSource::Deferred {
                        receiver: rx,
                        file_name: "plan.png".to_string(),
                    },
                )
                .await
        })
    };

    while !engine.is_loading("a") {
        tokio::task::yield_now().await;
    }
    engine
        .scene()
        .update_geometry("a", "M0 0 L200 0 L200 200 L0 200 Z", None)
        .expect("update geometry");
    engine
        .on_shape_geometry_changed("a")
        .await
        .expect("geometry change during load");

    tx.send(Bytes::from(create_png_bytes(100, 100)))
        .expect("send upload bytes");
    pending.await.expect("join").expect("apply");
    engine.flush_frame();

    let (width, _) = pattern_image_size(&engine, "a");
    assert!((width - 210.0).abs() < 1e-9);
}
