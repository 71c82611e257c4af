//! 由灰度直方图粗略估计背景噪声水平.

use crate::data::TypedArray;

/// 朴素高斯噪声估计.
///
/// 在 `bins` 个箱的直方图上找到第一个局部极大值 (背景峰), 沿其右侧严格下降到第一个局部
/// 极小值, 以该箱中心为阈值, 返回阈值以下有效值的均方根. 无有效值或值域宽度为零时返回 0.
pub fn estimate_noise_sigma(data: &TypedArray, bins: usize) -> f64 {
    let Some((lo, hi)) = data.range() else {
        return 0.0;
    };
    if bins == 0 || !(hi > lo) {
        return 0.0;
    }
    let h = data.histogram(bins, (lo, hi));

    let mut i = 0;
    while i + 1 < bins && h[i + 1] >= h[i] {
        i += 1;
    }
    while i + 1 < bins && h[i + 1] < h[i] {
        i += 1;
    }
    let width = (hi - lo) / bins as f64;
    let threshold = lo + (i as f64 + 0.5) * width;
    tracing::trace!("noise threshold {threshold} (bin {i})");

    let (sum, count) = (0..data.len())
        .filter_map(|k| data.get(k))
        .filter(|&v| v <= threshold)
        .fold((0.0, 0usize), |(s, c), v| (s + v * v, c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_peak() {
        let mut values: Vec<f32> = (0..1000).map(|i| (i % 5) as f32).collect();
        values.extend((0..500).map(|i| 100.0 + (i % 21) as f32));
        let sigma = estimate_noise_sigma(&TypedArray::from_vec(values), 64);
        assert!((sigma - 6f64.sqrt()).abs() < 1e-9, "{sigma}");
    }

    #[test]
    fn test_degenerate() {
        assert_eq!(estimate_noise_sigma(&TypedArray::from_vec(vec![3.0f32; 10]), 64), 0.0);
        let empty = TypedArray::from_vec(vec![f32::NAN; 4]);
        assert_eq!(estimate_noise_sigma(&empty, 64), 0.0);
    }
}
