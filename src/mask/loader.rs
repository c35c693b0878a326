//! # 加载与校验模块
//!
//! ## 设计思路
//!
//! 统一处理不同来源（上传字节 / 本地文件 / URL / 延迟上传）的原始字节加载，
//! 并对整条“加载 + 解码”链路施加单一超时。加载永远不会以错误结束：
//! 失败或超时都降级为占位图，由调用方照常构建遮罩。
//!
//! ## 实现思路
//!
//! - 文件：metadata 体积限制 + `tokio::fs` 读取。
//! - URL：连接/总超时 + 状态码 + 内容类型 + 体积校验 + 流式下载。
//! - 延迟上传：等待 `oneshot` 通道；发送端被丢弃视为上传取消。
//! - 解码结果按字节指纹缓存在 LRU 中，刷新类操作不会重复解码同一栅格。

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

use crate::config::EngineConfig;
use crate::error::MaskError;

use super::pipeline::{fingerprint, placeholder_raster};
use super::source::{LoadState, PreparedRaster, RasterSource, RawRaster};

const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;

/// 一次加载的结果。
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub raster: Arc<PreparedRaster>,
    pub state: LoadState,
    /// 成功时的原始字节，用于持久化；降级时为空
    pub(crate) raw: Option<RawRaster>,
}

impl LoadOutcome {
    pub fn is_ready(&self) -> bool {
        self.state == LoadState::Loaded
    }
}

/// 栅格加载器，持有解码缓存。
pub struct RasterLoader {
    decode_cache: Mutex<LruCache<u64, Arc<PreparedRaster>>>,
}

impl std::fmt::Debug for RasterLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterLoader")
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl RasterLoader {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            decode_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 调整解码缓存容量，超出部分按最久未使用淘汰。
    pub fn resize(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        if let Ok(mut cache) = self.decode_cache.lock() {
            cache.resize(capacity);
        }
    }

    pub fn cached_len(&self) -> usize {
        match self.decode_cache.lock() {
            Ok(cache) => cache.len(),
            Err(_) => 0,
        }
    }

    /// 加载栅格：超时或失败时降级为占位图，永不返回错误。
    pub async fn load(&self, source: RasterSource, config: &EngineConfig) -> LoadOutcome {
        let hint = source.hint();
        let start = Instant::now();

        match tokio::time::timeout(config.load_timeout(), self.fetch_and_prepare(source, config)).await {
            Ok(Ok((raw, raster))) => {
                log::debug!(
                    "📥 栅格加载完成 - 来源: {} 耗时: {}ms",
                    hint,
                    start.elapsed().as_millis()
                );
                LoadOutcome {
                    raster,
                    state: LoadState::Loaded,
                    raw: Some(raw),
                }
            }
            Ok(Err(err)) => {
                log::warn!("⚠️ 栅格加载失败，使用占位图 - 来源: {} 原因: {}", hint, err);
                self.degraded(config)
            }
            Err(_) => {
                log::warn!(
                    "⏱️ 栅格加载超时（{}ms），使用占位图 - 来源: {}",
                    config.load_timeout_ms,
                    hint
                );
                self.degraded(config)
            }
        }
    }

    fn degraded(&self, config: &EngineConfig) -> LoadOutcome {
        let (width, height) = config.placeholder_size();
        LoadOutcome {
            raster: placeholder_raster(width, height),
            state: LoadState::Failed,
            raw: None,
        }
    }

    async fn fetch_and_prepare(
        &self,
        source: RasterSource,
        config: &EngineConfig,
    ) -> Result<(RawRaster, Arc<PreparedRaster>), MaskError> {
        let raw = self.fetch_raw(source, config).await?;

        let key = fingerprint(&raw.bytes, config.max_pattern_dimension);
        if let Some(cached) = self.get_cached(key) {
            log::debug!("♻️ 命中解码缓存 - 文件: {}", raw.file_name);
            return Ok((raw, cached));
        }

        let prepared = Arc::new(Self::decode_blocking(raw.clone(), config.clone()).await?);
        self.store_cached(key, Arc::clone(&prepared));
        Ok((raw, prepared))
    }

    /// 在阻塞线程中解码，不占用运行时工作线程。
    ///
    /// 外层超时触发时 `JoinHandle` 随 future 一起被丢弃，迟到的解码结果不会进入缓存。
    async fn decode_blocking(raw: RawRaster, config: EngineConfig) -> Result<PreparedRaster, MaskError> {
        tokio::task::spawn_blocking(move || Self::decode_and_prepare(&raw, &config))
            .await
            .map_err(|e| MaskError::ImageDecode(format!("解码线程执行失败：{}", e)))?
    }

    pub(crate) async fn fetch_raw(
        &self,
        source: RasterSource,
        config: &EngineConfig,
    ) -> Result<RawRaster, MaskError> {
        match source {
            RasterSource::Bytes { data, file_name } => Ok(RawRaster {
                bytes: data,
                file_name,
                source_hint: "bytes",
            }),
            RasterSource::File(path) => Self::load_from_file(&path, config).await,
            RasterSource::Url(url) => Self::load_from_url(&url, config).await,
            RasterSource::Deferred { receiver, file_name } => {
                let bytes = receiver
                    .await
                    .map_err(|_| MaskError::ImageDecode("上传已取消".to_string()))?;
                Ok(RawRaster {
                    bytes,
                    file_name,
                    source_hint: "deferred",
                })
            }
        }
    }

    async fn load_from_file(path: &Path, config: &EngineConfig) -> Result<RawRaster, MaskError> {
        log::info!("📁 开始读取本地栅格 - 路径: {}", path.display());

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| MaskError::ImageDecode(format!("无法读取文件信息：{}", e)))?;

        if metadata.len() > config.max_file_size {
            return Err(MaskError::ImageDecode(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                metadata.len() as f64 / 1024.0 / 1024.0,
                config.max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MaskError::ImageDecode(format!("无法读取图片文件：{}", e)))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(RawRaster {
            bytes: Bytes::from(bytes),
            file_name,
            source_hint: "file",
        })
    }

    async fn load_from_url(url: &str, config: &EngineConfig) -> Result<RawRaster, MaskError> {
        log::info!("🌐 开始下载栅格 - URL: {}", Self::redact_url_for_log(url));

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| MaskError::ImageDecode(format!("URL 格式错误：{}", e)))?;
        let file_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("remote")
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(config.load_timeout())
            .connect_timeout(Duration::from_millis(config.fetch_connect_timeout_ms))
            .build()
            .map_err(|e| MaskError::ImageDecode(format!("无法创建 HTTP 客户端：{}", e)))?;

        let mut response = client
            .get(parsed)
            .header(reqwest::header::ACCEPT, "image/avif,image/webp,image/apng,image/*,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| MaskError::ImageDecode(format!("网络请求失败：{}", e)))?;

        if !response.status().is_success() {
            return Err(MaskError::ImageDecode(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        if let Some(ct) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            if let Ok(ct_str) = ct.to_str() {
                if !Self::is_image_content_type(ct_str) {
                    return Err(MaskError::ImageDecode(format!("不是图片类型：{}", ct_str)));
                }
            }
        }

        let total_len = response.content_length();
        if let Some(size) = total_len {
            if size > config.max_file_size {
                return Err(MaskError::ImageDecode(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    size as f64 / 1024.0 / 1024.0,
                    config.max_file_size as f64 / 1024.0 / 1024.0
                )));
            }
        }

        let initial_capacity = total_len
            .map(|len| len.min(config.max_file_size) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = Vec::with_capacity(initial_capacity);

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MaskError::ImageDecode(format!("下载失败：{}", e)))?
        {
            if (buffer.len() + chunk.len()) as u64 > config.max_file_size {
                return Err(MaskError::ImageDecode("下载后文件超过大小限制".to_string()));
            }
            buffer.extend_from_slice(&chunk);
        }

        log::debug!("✅ 下载完成 - {} bytes", buffer.len());

        Ok(RawRaster {
            bytes: Bytes::from(buffer),
            file_name,
            source_hint: "url",
        })
    }

    fn is_image_content_type(content_type: &str) -> bool {
        content_type
            .split(';')
            .next()
            .map(|base| base.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }

    fn redact_url_for_log(url: &str) -> String {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return "<invalid-url>".to_string();
        };

        let host = parsed.host_str().unwrap_or("<unknown-host>");
        let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
    }

    fn get_cached(&self, key: u64) -> Option<Arc<PreparedRaster>> {
        let mut cache = match self.decode_cache.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        cache.get(&key).cloned()
    }

    fn store_cached(&self, key: u64, raster: Arc<PreparedRaster>) {
        let mut cache = match self.decode_cache.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        cache.put(key, raster);
    }
}
