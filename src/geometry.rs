//! 几何拟合模块
//!
//! 该模块实现遮罩引擎中唯一的“纯几何”部分：
//!
//! 1. **覆盖拟合** (`fit`)：
//!    给定形状包围盒与图片像素尺寸，计算等比缩放后的尺寸与偏移，
//!    使图片完全覆盖包围盒（cover-fit，而不是 contain-fit），并附带少量过扫描余量，
//!    消除舍入与抗锯齿带来的边缘缝隙。
//!
//! 2. **路径数据** (`PathData`)：
//!    校验形状路径字符串，并在绘制层未提供包围盒时从路径坐标推导包围盒。
//!
//! # 设计思路
//!
//! - 算法纯函数化：输入为包围盒、图片尺寸、过扫描系数，输出唯一结果，便于测试。
//! - 非法输入（零尺寸、负尺寸、NaN）显式返回 `GeometryError`，
//!   由调用方替换为兜底尺寸，绝不把 0 / NaN 写入 SVG 属性。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 默认过扫描系数：多覆盖 5%
pub const DEFAULT_OVERSCAN: f64 = 1.05;

/// 几何输入错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("包围盒尺寸非法：{width}x{height}")]
    NonPositiveBox { width: f64, height: f64 },

    #[error("图片尺寸非法：{width}x{height}")]
    NonPositiveImage { width: u32, height: u32 },

    #[error("过扫描系数非法：{0}")]
    InvalidOverscan(f64),
}

/// 局部坐标系下的轴对齐包围盒
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// 包围盒中心点，旋转变换以此为旋转中心
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// 宽高均为有限正数
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// 拟合结果：缩放后的图片尺寸与左上角位置
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitResult {
    pub scale: f64,
    pub scaled_width: f64,
    pub scaled_height: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

/// 计算覆盖拟合
///
/// # 实现步骤
/// 1. 校验包围盒、图片尺寸与过扫描系数
/// 2. `scale = max(宽比, 高比) * overscan`，取 max 保证完全覆盖
/// 3. 按同一比例缩放宽高，保持纵横比
/// 4. 使缩放后的图片中心与包围盒中心重合
///
/// # 后置条件
/// - `scaled_width >= bbox.width` 且 `scaled_height >= bbox.height`
/// - `offset_x + scaled_width / 2 == bbox.x + bbox.width / 2`（浮点误差内）
///
/// # 示例
/// ```
/// use footprint_mask::geometry::{fit, BoundingBox, DEFAULT_OVERSCAN};
///
/// let result = fit(BoundingBox::new(0.0, 0.0, 100.0, 50.0), 200, 200, DEFAULT_OVERSCAN)?;
/// assert!((result.scaled_width - 105.0).abs() < 1e-9);
/// assert!((result.offset_y + 27.5).abs() < 1e-9);
/// # Ok::<(), footprint_mask::geometry::GeometryError>(())
/// ```
pub fn fit(
    bbox: BoundingBox,
    image_width: u32,
    image_height: u32,
    overscan: f64,
) -> Result<FitResult, GeometryError> {
    if !bbox.is_valid() {
        return Err(GeometryError::NonPositiveBox {
            width: bbox.width,
            height: bbox.height,
        });
    }
    if image_width == 0 || image_height == 0 {
        return Err(GeometryError::NonPositiveImage {
            width: image_width,
            height: image_height,
        });
    }
    if !overscan.is_finite() || overscan < 1.0 {
        return Err(GeometryError::InvalidOverscan(overscan));
    }

    let iw = image_width as f64;
    let ih = image_height as f64;
    let scale = (bbox.width / iw).max(bbox.height / ih) * overscan;

    let scaled_width = iw * scale;
    let scaled_height = ih * scale;

    Ok(FitResult {
        scale,
        scaled_width,
        scaled_height,
        offset_x: bbox.x + (bbox.width - scaled_width) / 2.0,
        offset_y: bbox.y + (bbox.height - scaled_height) / 2.0,
    })
}

/// 带兜底的拟合：图片尺寸非法时改用兜底尺寸重新拟合。
///
/// 包围盒非法时仍返回错误，因为那意味着形状本身不可用。
pub fn fit_or_fallback(
    bbox: BoundingBox,
    image_width: u32,
    image_height: u32,
    fallback: (u32, u32),
    overscan: f64,
) -> Result<FitResult, GeometryError> {
    match fit(bbox, image_width, image_height, overscan) {
        Err(GeometryError::NonPositiveImage { width, height }) => {
            log::warn!(
                "图片尺寸 {}x{} 不可用，改用兜底尺寸 {}x{}",
                width,
                height,
                fallback.0,
                fallback.1
            );
            fit(bbox, fallback.0, fallback.1, overscan)
        }
        other => other,
    }
}

// ============================================================================
// 路径数据
// ============================================================================

/// 路径命令与数字的词法切分
static PATH_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[MmLlHhVvCcSsQqTtAaZz]|[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?")
        .expect("路径词法正则编译失败")
});

/// 形状的闭合路径数据（SVG path `d` 字符串，原样保存，不做简化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathData(String);

impl PathData {
    /// 构造路径数据；空白字符串视为“没有几何”，返回 `None`。
    pub fn parse(d: &str) -> Option<Self> {
        let trimmed = d.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 从路径坐标推导包围盒。
    ///
    /// 控制点同样计入，因此曲线的结果是保守（偏大）的包围盒；
    /// 圆弧只取终点。无法解析出至少一个点时返回 `None`。
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut min = (f64::INFINITY, f64::INFINITY);
        let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        let mut include = |x: f64, y: f64| {
            min = (min.0.min(x), min.1.min(y));
            max = (max.0.max(x), max.1.max(y));
        };

        let mut command: Option<char> = None;
        let mut args: Vec<f64> = Vec::with_capacity(8);
        let mut current = (0.0_f64, 0.0_f64);
        let mut subpath_start = (0.0_f64, 0.0_f64);

        for token in PATH_TOKEN.find_iter(&self.0) {
            let text = token.as_str();
            let first = text.chars().next()?;

            if first.is_ascii_alphabetic() {
                command = Some(first);
                args.clear();
                if first == 'Z' || first == 'z' {
                    current = subpath_start;
                }
                continue;
            }

            let cmd = command?;
            args.push(text.parse::<f64>().ok()?);

            let arity = match cmd.to_ascii_uppercase() {
                'H' | 'V' => 1,
                'M' | 'L' | 'T' => 2,
                'S' | 'Q' => 4,
                'C' => 6,
                'A' => 7,
                _ => return None,
            };
            if args.len() < arity {
                continue;
            }

            let relative = cmd.is_ascii_lowercase();
            let base = if relative { current } else { (0.0, 0.0) };

            match cmd.to_ascii_uppercase() {
                'H' => {
                    current.0 = base.0 + args[0];
                    include(current.0, current.1);
                }
                'V' => {
                    current.1 = base.1 + args[0];
                    include(current.0, current.1);
                }
                'A' => {
                    current = (base.0 + args[5], base.1 + args[6]);
                    include(current.0, current.1);
                }
                _ => {
                    for pair in args.chunks(2) {
                        include(base.0 + pair[0], base.1 + pair[1]);
                    }
                    current = (base.0 + args[arity - 2], base.1 + args[arity - 1]);
                }
            }

            if cmd == 'M' || cmd == 'm' {
                subpath_start = current;
                // 后续隐式坐标按 lineto 处理
                command = Some(if relative { 'l' } else { 'L' });
            }
            args.clear();
        }

        if !min.0.is_finite() || !max.0.is_finite() {
            return None;
        }

        Some(BoundingBox::new(min.0, min.1, max.0 - min.0, max.1 - min.1))
    }
}

impl std::fmt::Display for PathData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
