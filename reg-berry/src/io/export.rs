//! 供检查用的导出: `.npy` 数组与 8 位灰度切片图.

use std::path::Path;

use crate::data::{OrthoSlice, UniformVolume};
use crate::RegResult;

/// 线性灰度窗, 由窗位 (level) 和窗宽 (width) 决定.
///
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IntensityWindow {
    level: f64,
    width: f64,
}

impl IntensityWindow {
    /// 构建灰度窗. `width` 必须为正且两者有限, 否则返回 `None`.
    pub fn new(level: f64, width: f64) -> Option<Self> {
        if level.is_finite() && width.is_finite() && width > 0.0 {
            Some(Self { level, width })
        } else {
            None
        }
    }

    /// 覆盖 `[lo, hi]` 的窗. 区间退化时返回 `None`.
    pub fn from_range(lo: f64, hi: f64) -> Option<Self> {
        Self::new(0.5 * (lo + hi), hi - lo)
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f64 {
        self.level - self.width / 2.0
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f64 {
        self.level + self.width / 2.0
    }

    /// 窗位.
    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f64 {
        self.width
    }

    /// 值 `v` 对应的灰度 (0 <= value <= 255). `v` 无意义 (inf, NaN) 时返回 `None`.
    pub fn eval(&self, v: f64) -> Option<u8> {
        if !v.is_finite() {
            return None;
        }
        let lb = self.lower_bound();
        if v <= lb {
            Some(u8::MIN)
        } else if v >= self.upper_bound() {
            Some(u8::MAX)
        } else {
            // 255, not 256.
            Some(((v - lb) / self.width * 255.0) as u8)
        }
    }
}

/// 表明一个可以按 "可视化友好" 方式保存为灰度图的切片.
pub trait SliceWriteVis {
    /// 按 `window` 把切片保存到 `path`. 缺失像素为黑色.
    fn save<P: AsRef<Path>>(&self, window: &IntensityWindow, path: P) -> RegResult<()>;
}

impl SliceWriteVis for OrthoSlice {
    fn save<P: AsRef<Path>>(&self, window: &IntensityWindow, path: P) -> RegResult<()> {
        let [width, height] = self.dims();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for j in 0..height {
            for i in 0..width {
                let pix = self.get(i, j).and_then(|v| window.eval(v)).unwrap_or(u8::MIN);
                buf.put_pixel(i as u32, j as u32, image::Luma([pix]));
            }
        }
        buf.save(path)?;
        Ok(())
    }
}

/// 以 `(z, y, x)` 形状的 `f64` 数组写出体数据, 缺失值为 NaN.
pub fn write_npy<P: AsRef<Path>>(volume: &UniformVolume, path: P) -> RegResult<()> {
    let arr = volume.to_array3()?;
    ndarray_npy::write_npy(path, &arr)?;
    Ok(())
}
