//! 沿单轴的余弦窗 sinc 插值.

use std::f64::consts::PI;

/// 插值核半径 (样本数).
pub const KERNEL_RADIUS: i64 = 2;

/// 核在距离 `d` 处的权重.
#[inline]
pub fn cosine_sinc(d: f64) -> f64 {
    if d == 0.0 {
        return 1.0;
    }
    if d.abs() >= KERNEL_RADIUS as f64 {
        return 0.0;
    }
    let pd = PI * d;
    0.5 * (1.0 + (pd / KERNEL_RADIUS as f64).cos()) * pd.sin() / pd
}

/// 在 `lane` 的 `base + rel` 处插值, `lane[k]` 取自 `values[start + k * stride]`.
///
/// 支撑区间为 `base - R + 1 ..= base + R`, 在网格边界处截断. 权重和不为正时返回 0.
#[inline]
pub fn interpolate_lane(values: &[f64], start: usize, stride: usize, len: usize, base: i64, rel: f64) -> f64 {
    let last = len as i64 - 1;
    let from = (1 - KERNEL_RADIUS).max(-base);
    let to = KERNEL_RADIUS.min(last - base);
    let mut value = 0.0;
    let mut total = 0.0;
    for i in from..=to {
        let k = (base + i) as usize;
        let w = cosine_sinc(rel - i as f64);
        value += w * values[start + k * stride];
        total += w;
    }
    if total > 0.0 {
        value / total
    } else {
        0.0
    }
}
