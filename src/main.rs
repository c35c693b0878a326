//! # 足迹遮罩引擎：命令行演示入口
//!
//! 用法：`footprint-mask <raster> [config.json] [store.db]`
//!
//! 在一个矩形足迹上应用遮罩，执行一组变换后把场景输出为 SVG。
//! 业务逻辑分布在各子模块中，详见 `lib.rs` 架构文档。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use footprint_mask::{
    EngineConfig, MaskError, MaskServiceState, MaskStore, MemoryStore, RasterSource, SqliteStore,
    SvgScene,
};

const DEMO_SHAPE: &str = "demo";
const DEMO_PATH: &str = "M0 0 L200 0 L200 120 L0 120 Z";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(raster) = args.first() else {
        eprintln!("用法: footprint-mask <raster> [config.json] [store.db]");
        std::process::exit(2);
    };

    if let Err(err) = run(
        PathBuf::from(raster),
        args.get(1).map(PathBuf::from),
        args.get(2).map(PathBuf::from),
    )
    .await
    {
        log::error!("❌ 运行失败 [{}]: {}", err.code(), err);
        std::process::exit(1);
    }
}

async fn run(
    raster: PathBuf,
    config_path: Option<PathBuf>,
    store_path: Option<PathBuf>,
) -> Result<(), MaskError> {
    let config = config_path
        .as_deref()
        .map(EngineConfig::load_from_path)
        .unwrap_or_default();
    let store = open_store(store_path.as_deref())?;

    let scene = Arc::new(SvgScene::new());
    scene.mount_shape(DEMO_SHAPE, DEMO_PATH, None)?;

    let service = MaskServiceState::new(config, Arc::clone(&scene), store)?;
    service.start()?;

    service
        .apply_mask(DEMO_SHAPE, RasterSource::File(raster))
        .await?;
    service.rotate(DEMO_SHAPE, 90)?;
    service.scale_by(DEMO_SHAPE, 1.5)?;
    let state = service.move_by(DEMO_SHAPE, 10.0, 5.0)?;
    log::info!(
        "🧭 最终变换 - rotation={} scale={} offset=({}, {})",
        state.rotation_degrees,
        state.scale,
        state.offset_x,
        state.offset_y
    );

    service.shutdown()?;
    println!("{}", scene.to_svg()?);
    Ok(())
}

fn open_store(path: Option<&Path>) -> Result<Arc<dyn MaskStore>, MaskError> {
    match path {
        Some(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
