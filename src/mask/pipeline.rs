//! # 解码与变换流水线模块
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → pattern 图片引用”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做签名与尺寸检查，再进行完整解码，尽早拒绝非图片输入。
//!
//! ## 实现思路
//!
//! 1. 体积上限 + 文件签名（`infer`）校验
//! 2. 读取 header 尺寸
//! 3. 完整解码
//! 4. 超过 `max_pattern_dimension` 时降采样并重新编码为 PNG
//! 5. 生成 `data:` URI 作为 pattern 内图片的引用
//!
//! 原始字节始终保留在存储中，降采样只影响 pattern 引用，重置时仍从原图重建。

use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::Cursor;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgba};
use once_cell::sync::Lazy;

use crate::config::EngineConfig;
use crate::error::MaskError;

use super::loader::RasterLoader;
use super::source::{PreparedRaster, RawRaster};

const PLACEHOLDER_WIDTH: u32 = 300;
const PLACEHOLDER_HEIGHT: u32 = 300;

/// 默认尺寸的占位图，首次使用时生成。
static DEFAULT_PLACEHOLDER: Lazy<Arc<PreparedRaster>> =
    Lazy::new(|| Arc::new(render_placeholder(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)));

/// 获取指定尺寸的占位图。
pub(crate) fn placeholder_raster(width: u32, height: u32) -> Arc<PreparedRaster> {
    if (width, height) == (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT) {
        return Arc::clone(&DEFAULT_PLACEHOLDER);
    }
    Arc::new(render_placeholder(width, height))
}

/// 生成中性灰棋盘格占位图。
fn render_placeholder(width: u32, height: u32) -> PreparedRaster {
    let width = width.max(1);
    let height = height.max(1);
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if ((x / 20) + (y / 20)) % 2 == 0 {
            Rgba([208u8, 208, 208, 255])
        } else {
            Rgba([232u8, 232, 232, 255])
        }
    });

    let bytes = encode_png(&DynamicImage::ImageRgba8(img)).unwrap_or_else(|err| {
        log::error!("❌ 占位图编码失败: {}", err);
        Vec::new()
    });

    PreparedRaster {
        width,
        height,
        href: to_data_uri("image/png", &bytes),
        mime: "image/png".to_string(),
        fingerprint: fingerprint(&bytes, 0),
    }
}

/// 字节指纹：内容 + 影响输出的配置项。
pub(crate) fn fingerprint(bytes: &[u8], max_pattern_dimension: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    max_pattern_dimension.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn to_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, general_purpose::STANDARD.encode(bytes))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, MaskError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|e| MaskError::ImageDecode(format!("PNG 编码失败：{}", e)))?;
    Ok(cursor.into_inner())
}

impl RasterLoader {
    /// 将原始字节解码为 pattern 可引用的图片。
    pub(crate) fn decode_and_prepare(
        raw: &RawRaster,
        config: &EngineConfig,
    ) -> Result<PreparedRaster, MaskError> {
        if raw.bytes.len() as u64 > config.max_file_size {
            return Err(MaskError::ImageDecode(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                raw.bytes.len() as f64 / 1024.0 / 1024.0,
                config.max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        let mime = Self::validate_image_signature(&raw.bytes)?;
        let (header_width, header_height) = Self::inspect_dimensions_from_memory(&raw.bytes)?;
        if header_width == 0 || header_height == 0 {
            return Err(MaskError::ImageDecode("图片尺寸为 0".to_string()));
        }

        let decoded = image::load_from_memory(&raw.bytes)
            .map_err(|e| MaskError::ImageDecode(format!("图片解码失败：{}", e)))?;
        let (width, height) = decoded.dimensions();

        let max_dim = config.max_pattern_dimension;
        let (href, mime) = if width > max_dim || height > max_dim {
            let resized = Self::downscale_for_pattern(decoded, max_dim);
            let png = encode_png(&resized)?;
            (to_data_uri("image/png", &png), "image/png".to_string())
        } else {
            (to_data_uri(&mime, &raw.bytes), mime)
        };

        log::info!(
            "✅ 栅格解码成功 - 来源: {} 文件: {} 尺寸: {}x{} 类型: {}",
            raw.source_hint,
            raw.file_name,
            width,
            height,
            mime
        );

        Ok(PreparedRaster {
            width,
            height,
            href,
            mime,
            fingerprint: fingerprint(&raw.bytes, max_dim),
        })
    }

    /// 通过文件签名（magic bytes）校验输入是否为图片，返回 MIME 类型。
    pub(crate) fn validate_image_signature(bytes: &[u8]) -> Result<String, MaskError> {
        if bytes.is_empty() {
            return Err(MaskError::ImageDecode("图片内容为空".to_string()));
        }

        let kind = infer::get(bytes)
            .ok_or_else(|| MaskError::ImageDecode("无法识别图片类型".to_string()))?;

        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(MaskError::ImageDecode(format!(
                "文件签名不是图片类型：{}",
                kind.mime_type()
            )));
        }

        Ok(kind.mime_type().to_string())
    }

    /// 仅通过内存中的图片头信息读取宽高。
    fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), MaskError> {
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| MaskError::ImageDecode(format!("无法识别图片格式：{}", e)))?;

        reader
            .into_dimensions()
            .map_err(|e| MaskError::ImageDecode(format!("无法读取图片尺寸：{}", e)))
    }

    /// 等比降采样到最长边不超过 `max_dim`。
    fn downscale_for_pattern(image: DynamicImage, max_dim: u32) -> DynamicImage {
        let (width, height) = image.dimensions();
        let scale = (max_dim as f64 / width as f64).min(max_dim as f64 / height as f64);
        let target_width = ((width as f64 * scale).floor() as u32).max(1);
        let target_height = ((height as f64 * scale).floor() as u32).max(1);

        log::info!(
            "🧩 pattern 降采样：{}x{} -> {}x{}",
            width,
            height,
            target_width,
            target_height
        );

        match Self::resize_with_fast_image_resize(&image, target_width, target_height) {
            Ok(resized) => resized,
            Err(err) => {
                log::warn!(
                    "⚠️ fast_image_resize 降采样失败，回退 image::resize_exact：{}",
                    err
                );
                image.resize_exact(
                    target_width,
                    target_height,
                    image::imageops::FilterType::Lanczos3,
                )
            }
        }
    }

    fn resize_with_fast_image_resize(
        image: &DynamicImage,
        target_width: u32,
        target_height: u32,
    ) -> Result<DynamicImage, MaskError> {
        let src = image.to_rgba8();
        let (src_width, src_height) = src.dimensions();

        let src_image = fr::images::Image::from_vec_u8(
            src_width,
            src_height,
            src.into_raw(),
            fr::PixelType::U8x4,
        )
        .map_err(|e| MaskError::ImageDecode(format!("构建源图像缓冲失败：{}", e)))?;

        let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

        let mut resizer = fr::Resizer::new();
        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));

        resizer
            .resize(&src_image, &mut dst_image, Some(&options))
            .map_err(|e| MaskError::ImageDecode(format!("fast_image_resize 执行失败：{}", e)))?;

        let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(
            target_width,
            target_height,
            dst_image.into_vec(),
        )
        .ok_or_else(|| MaskError::ImageDecode("fast_image_resize 输出缓冲长度异常".to_string()))?;

        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, ((x + y) % 255) as u8, 255])
        });
        encode_png(&DynamicImage::ImageRgba8(img)).expect("failed to encode test image")
    }

    fn raw(bytes: Vec<u8>) -> RawRaster {
        RawRaster {
            bytes: Bytes::from(bytes),
            file_name: "test.png".to_string(),
            source_hint: "bytes",
        }
    }

    #[test]
    fn decode_reports_actual_dimensions_and_data_uri() {
        let prepared =
            RasterLoader::decode_and_prepare(&raw(create_png_bytes(64, 32)), &EngineConfig::default())
                .expect("decode failed");

        assert_eq!(prepared.dimensions(), (64, 32));
        assert_eq!(prepared.mime, "image/png");
        assert!(prepared.href.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn decode_rejects_non_image_payload() {
        let result =
            RasterLoader::decode_and_prepare(&raw(b"hello world".to_vec()), &EngineConfig::default());

        assert!(matches!(result, Err(MaskError::ImageDecode(_))));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut config = EngineConfig::default();
        config.max_file_size = 1024;

        let result = RasterLoader::decode_and_prepare(&raw(vec![0u8; 4096]), &config);
        assert!(matches!(result, Err(MaskError::ImageDecode(_))));
    }

    #[test]
    fn large_raster_is_downscaled_for_pattern_but_keeps_original_dimensions() {
        let mut config = EngineConfig::default();
        config.max_pattern_dimension = 64;

        let prepared = RasterLoader::decode_and_prepare(&raw(create_png_bytes(256, 128)), &config)
            .expect("decode failed");

        assert_eq!(prepared.dimensions(), (256, 128));
        let encoded = prepared
            .href
            .strip_prefix("data:image/png;base64,")
            .expect("png data uri");
        let bytes = general_purpose::STANDARD.decode(encoded).expect("valid base64");
        let embedded = image::load_from_memory(&bytes).expect("embedded png");
        assert_eq!(embedded.dimensions(), (64, 32));
    }

    #[test]
    fn placeholder_has_requested_dimensions() {
        let default = placeholder_raster(300, 300);
        assert_eq!(default.dimensions(), (300, 300));
        assert!(Arc::ptr_eq(&default, &placeholder_raster(300, 300)));

        let custom = placeholder_raster(120, 80);
        assert_eq!(custom.dimensions(), (120, 80));
    }

    #[test]
    fn fingerprint_depends_on_pattern_dimension() {
        let bytes = create_png_bytes(8, 8);
        assert_eq!(fingerprint(&bytes, 4096), fingerprint(&bytes, 4096));
        assert_ne!(fingerprint(&bytes, 4096), fingerprint(&bytes, 64));
    }
}
