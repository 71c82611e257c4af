//! 由多个低分辨率 "pass" 子体重建高分辨率体数据 (体注入).
//!
//! 每个 pass 带一个仿射变换, 把重建网格坐标映射到 pass 图像的网格坐标. 提供两种注入方式:
//!
//! - 各向同性: 遍历每个 pass 体素, 经逆变换映射到重建网格, 以物理距离高斯核散射.
//! - 各向异性: 遍历每个重建体素, 映射到各 pass 图像中, 在索引邻域内以
//!   (以重建网格间距归一化的) 距离高斯核聚集. 每个输出体素只由一个工作线程写入.
//!
//! 另外提供直方图 KL 散度与离散拉普拉斯粗糙度, 供迭代重建或质量评估使用.

pub mod histogram;
pub mod noise;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::InjectionConfig;
use crate::consts::HISTOGRAM_BINS;
use crate::data::{ScalarType, TypedArray, UniformVolume};
use crate::exec::ExecContext;
use crate::progress::{CancelFlag, ProgressSink};
use crate::transform::AffineXform;
use crate::{Dims, RegError, RegResult};

pub use histogram::Histogram;
pub use noise::estimate_noise_sigma;

/// 根据维度和体素间距猜测交错采集方向.
///
/// 两轴维度相同而第三轴不同时取第三轴; 否则按同样规则比较间距; 都无法判断时返回 `default`.
pub fn guess_interleave_axis(image: &UniformVolume, default: usize) -> usize {
    let d = image.dims();
    if d[0] == d[1] && d[1] != d[2] {
        return 2;
    }
    if d[0] == d[2] && d[1] != d[2] {
        return 1;
    }
    if d[1] == d[2] && d[1] != d[0] {
        return 0;
    }
    let s = image.delta();
    if s[0] == s[1] && s[1] != s[2] {
        return 2;
    }
    if s[0] == s[2] && s[1] != s[2] {
        return 1;
    }
    if s[1] == s[2] && s[1] != s[0] {
        return 0;
    }
    default
}

/// 单个重建体素的注入结果.
#[derive(Copy, Clone, Debug)]
struct Injected {
    value: Option<f64>,
    min: f64,
    max: f64,
}

/// 体注入重建.
#[derive(Clone, Debug)]
pub struct VolumeInjection {
    corrected: UniformVolume,
    passes: Vec<UniformVolume>,
    weights: Vec<f64>,
    xforms: Vec<AffineXform>,
    original_range: (f64, f64),
    kernel: Vec<f64>,
    original_histogram: Histogram,
    corrected_histogram: Histogram,
    neighborhood_min: Vec<f64>,
    neighborhood_max: Vec<f64>,
}

impl VolumeInjection {
    /// 把交错采集的原图沿 `axis` 拆成 `factor` 个 pass, 在原图网格上重建.
    pub fn from_interleaved(image: &UniformVolume, factor: usize, axis: usize) -> RegResult<Self> {
        let passes = (0..factor)
            .map(|pass| image.get_interleaved_sub_volume(axis, factor, pass))
            .collect::<RegResult<Vec<_>>>()?;
        Self::build(image, passes, image.require_data()?)
    }

    /// 在 `grid` 的网格上由给定的 pass 图像重建. `grid` 没有数据时用第一个 pass 的数据统计灰度分布.
    pub fn new(grid: &UniformVolume, passes: Vec<UniformVolume>) -> RegResult<Self> {
        let first = passes.first().ok_or_else(|| RegError::invalid("no pass images"))?;
        let reference = match grid.data() {
            Some(data) => data.clone(),
            None => first.require_data()?.clone(),
        };
        Self::build(grid, passes, &reference)
    }

    fn build(grid: &UniformVolume, passes: Vec<UniformVolume>, original: &TypedArray) -> RegResult<Self> {
        if passes.is_empty() {
            return Err(RegError::invalid("no pass images"));
        }
        for pass in &passes {
            pass.require_data()?;
        }
        let n = passes.len();
        let original_range = original.range().unwrap_or((0.0, 0.0));
        let mut out = Self {
            corrected: grid.clone_geometry(Some(ScalarType::F32)),
            passes,
            weights: vec![1.0; n],
            xforms: vec![AffineXform::default(); n],
            original_range,
            kernel: vec![1.0],
            original_histogram: Histogram::new(HISTOGRAM_BINS, original_range),
            corrected_histogram: Histogram::new(HISTOGRAM_BINS, original_range),
            neighborhood_min: Vec::new(),
            neighborhood_max: Vec::new(),
        };
        out.setup_histogram_kernels(original);
        Ok(out)
    }

    /// 由原图灰度分布与估计噪声确定直方图平滑核, 并据此建立原图直方图.
    fn setup_histogram_kernels(&mut self, original: &TypedArray) {
        let valid: Vec<f64> = (0..original.len()).filter_map(|i| original.get(i)).collect();
        self.original_histogram.reset();
        for &v in &valid {
            let bin = self.original_histogram.value_to_bin(v);
            self.original_histogram.add(bin, 1.0);
        }

        let noise_sigma = estimate_noise_sigma(original, HISTOGRAM_BINS);
        let width = self.original_range.1 - self.original_range.0;
        let kernel_sigma = if width > 0.0 {
            HISTOGRAM_BINS as f64 * noise_sigma / width
        } else {
            0.0
        };
        let mut radius = (1.0 + 2.0 * kernel_sigma) as usize;

        // 核要足够宽, 以跨过原图直方图中的空箱, 否则 KL 散度会发散.
        let mut zero_run = 1;
        for &b in self.original_histogram.bins() {
            if b == 0.0 {
                zero_run += 1;
                radius = radius.max(zero_run);
            } else {
                zero_run = 0;
            }
        }

        self.kernel = if radius > 1 {
            let sigma = kernel_sigma.max(0.5);
            let norm = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma);
            (0..radius)
                .map(|i| norm * (-0.5 * (i as f64 / sigma).powi(2)).exp())
                .collect()
        } else {
            vec![1.0]
        };
        tracing::debug!(
            "noise sigma {noise_sigma:.4}, histogram kernel sigma {kernel_sigma:.4}, radius {}",
            self.kernel.len()
        );

        self.original_histogram.reset();
        for &v in &valid {
            let bin = self.original_histogram.value_to_bin(v);
            self.original_histogram.add_weighted_symmetric_kernel(bin, &self.kernel);
        }
    }

    /// pass 个数.
    #[inline]
    pub fn number_of_passes(&self) -> usize {
        self.passes.len()
    }

    /// pass 图像.
    #[inline]
    pub fn pass_images(&self) -> &[UniformVolume] {
        &self.passes
    }

    /// 原图灰度范围.
    #[inline]
    pub fn original_range(&self) -> (f64, f64) {
        self.original_range
    }

    /// 直方图平滑核 (单侧).
    #[inline]
    pub fn histogram_kernel(&self) -> &[f64] {
        &self.kernel
    }

    /// 设置全部 pass 的变换 (重建网格坐标 → pass 网格坐标).
    pub fn set_transformations(&mut self, xforms: Vec<AffineXform>) -> RegResult<()> {
        if xforms.len() != self.passes.len() {
            return Err(RegError::invalid(format!(
                "{} transforms for {} passes",
                xforms.len(),
                self.passes.len()
            )));
        }
        self.xforms = xforms;
        Ok(())
    }

    /// 各 pass 的变换.
    #[inline]
    pub fn transformations(&self) -> &[AffineXform] {
        &self.xforms
    }

    /// 设置 pass 权重. 权重不为正的 pass 不参与注入.
    pub fn set_pass_weight(&mut self, pass: usize, weight: f64) -> RegResult<()> {
        let w = self
            .weights
            .get_mut(pass)
            .ok_or_else(|| RegError::invalid(format!("no pass #{pass}")))?;
        *w = weight;
        Ok(())
    }

    /// pass 权重.
    #[inline]
    pub fn pass_weights(&self) -> &[f64] {
        &self.weights
    }

    /// 按配置选择注入方式.
    pub fn inject(&mut self, ctx: &ExecContext, cfg: &InjectionConfig, progress: &dyn ProgressSink) -> RegResult<()> {
        cfg.validate()?;
        if cfg.isotropic {
            self.volume_injection_isotropic(cfg.kernel_sigma, cfg.kernel_radius, progress)
        } else {
            self.volume_injection_anisotropic(ctx, cfg.kernel_sigma_factor, cfg.kernel_radius_factor, progress)
        }
    }

    /// 各向异性聚集注入. 核宽度以重建网格间距为单位.
    pub fn volume_injection_anisotropic(
        &mut self,
        ctx: &ExecContext,
        sigma_factor: f64,
        radius_factor: f64,
        progress: &dyn ProgressSink,
    ) -> RegResult<()> {
        let dims = self.corrected.dims();
        let plane = dims[0] * dims[1];
        let (lo, hi) = self.original_range;
        let neg_inv_two_sigma_sq = -1.0 / (2.0 * sigma_factor * sigma_factor);
        let corrected_delta = self.corrected.delta();
        let reach = radius_factor.max(0.0) as i64;

        let cancel = CancelFlag::default();
        let finished = AtomicUsize::new(0);
        progress.begin("anisotropic volume injection", dims[2], 1);

        let mut out = vec![
            Injected {
                value: None,
                min: hi,
                max: lo,
            };
            self.corrected.num_voxels()
        ];
        let corrected = &self.corrected;
        let passes = &self.passes;
        let weights = &self.weights;
        let xforms = &self.xforms;
        ctx.map_chunks_mut(&mut out, plane, || (), |_, z, chunk| {
            if cancel.is_set() {
                return;
            }
            for (p, voxel) in chunk.iter_mut().enumerate() {
                let v = corrected.grid_location_at(z * plane + p);
                let mut sum = 0.0;
                let mut weight = 0.0;
                for ((pass, &pass_weight), xform) in passes.iter().zip(weights).zip(xforms) {
                    if !(pass_weight > 0.0) {
                        continue;
                    }
                    let v_pass = xform.apply(&v);
                    let c = pass.continuous_index(&v_pass);
                    let pass_dims = pass.dims();
                    let range = [0, 1, 2].map(|a| {
                        let center = c[a].floor() as i64;
                        let from = (center - reach).max(0);
                        let to = (center + reach + 1).min(pass_dims[a] as i64);
                        (from, to)
                    });
                    for k in range[2].0..range[2].1 {
                        for j in range[1].0..range[1].1 {
                            for i in range[0].0..range[0].1 {
                                let (i, j, k) = (i as usize, j as usize, k as usize);
                                let Some(value) = pass.get(i, j, k) else {
                                    continue;
                                };
                                let u = pass.grid_location(i, j, k);
                                let m2: f64 = (0..3)
                                    .map(|a| ((u[a] - v_pass[a]) / corrected_delta[a]).powi(2))
                                    .sum();
                                if m2.sqrt() <= radius_factor {
                                    let w = pass_weight * (m2 * neg_inv_two_sigma_sq).exp();
                                    sum += value * w;
                                    weight += w;
                                    voxel.min = voxel.min.min(value);
                                    voxel.max = voxel.max.max(value);
                                }
                            }
                        }
                    }
                }
                voxel.value = (weight > 0.0).then(|| sum / weight);
            }
            let n = finished.fetch_add(1, Ordering::Relaxed);
            cancel.report(progress, n + 1);
        });
        progress.done();
        if cancel.is_set() {
            return Err(RegError::Cancelled);
        }
        self.store(&out)
    }

    /// 各向同性散射注入. 核宽度为物理单位. pass 逐个顺序处理.
    pub fn volume_injection_isotropic(
        &mut self,
        sigma: f64,
        radius: f64,
        progress: &dyn ProgressSink,
    ) -> RegResult<()> {
        let dims = self.corrected.dims();
        let delta = self.corrected.delta();
        let n = self.corrected.num_voxels();
        let (lo, hi) = self.original_range;
        let reach = [0, 1, 2].map(|a| 1 + (radius / delta[a]) as usize);
        let radius_sq = radius * radius;
        let neg_inv_two_sigma_sq = -1.0 / (2.0 * sigma * sigma);

        let mut sums = vec![0.0; n];
        let mut weights = vec![0.0; n];
        let mut out = vec![
            Injected {
                value: None,
                min: hi,
                max: lo,
            };
            n
        ];

        progress.begin("isotropic volume injection", self.passes.len(), 1);
        for (index, ((pass, &pass_weight), xform)) in
            self.passes.iter().zip(&self.weights).zip(&self.xforms).enumerate()
        {
            if progress.set_progress(index).is_interrupt() {
                progress.done();
                return Err(RegError::Cancelled);
            }
            if !(pass_weight > 0.0) {
                continue;
            }
            let inverse = xform.inverse()?;
            let data = pass.require_data()?;
            for offset in 0..pass.num_voxels() {
                let Some(value) = data.get(offset) else {
                    continue;
                };
                let v = inverse.apply(&pass.grid_location_at(offset));
                let Some(center) = self.corrected.find_voxel(&v) else {
                    continue;
                };
                let from = [0, 1, 2].map(|a| center[a].saturating_sub(reach[a]));
                let to = [0, 1, 2].map(|a| (center[a] + reach[a] + 1).min(dims[a]));
                for k in from[2]..to[2] {
                    for j in from[1]..to[1] {
                        for i in from[0]..to[0] {
                            let u = self.corrected.grid_location(i, j, k);
                            let d2 = (u - v).norm_squared();
                            if d2 <= radius_sq {
                                let w = pass_weight * (d2 * neg_inv_two_sigma_sq).exp();
                                let idx = self.corrected.linear_index(i, j, k);
                                sums[idx] += value * w;
                                weights[idx] += w;
                                out[idx].min = out[idx].min.min(value);
                                out[idx].max = out[idx].max.max(value);
                            }
                        }
                    }
                }
            }
        }
        progress.done();

        for ((voxel, s), w) in out.iter_mut().zip(&sums).zip(&weights) {
            voxel.value = (*w > 0.0).then(|| s / w);
        }
        self.store(&out)
    }

    fn store(&mut self, out: &[Injected]) -> RegResult<()> {
        let mut data = TypedArray::new(ScalarType::F32, out.len());
        for (i, voxel) in out.iter().enumerate() {
            match voxel.value {
                Some(v) => data.set(i, v),
                None => data.set_padding_at(i),
            }
        }
        self.corrected.set_data(data)?;
        self.neighborhood_min = out.iter().map(|v| v.min).collect();
        self.neighborhood_max = out.iter().map(|v| v.max).collect();
        let missing = out.iter().filter(|v| v.value.is_none()).count();
        if missing > 0 {
            tracing::warn!("{missing} voxels received no contribution");
        }
        Ok(())
    }

    /// 重建结果 (`f32`). 没有任何贡献的体素为缺失值.
    #[inline]
    pub fn corrected_image(&self) -> &UniformVolume {
        &self.corrected
    }

    /// 取出重建结果.
    #[inline]
    pub fn into_corrected_image(self) -> UniformVolume {
        self.corrected
    }

    /// 每个重建体素的贡献样本最小值. 没有贡献的体素为原图灰度上界.
    #[inline]
    pub fn neighborhood_min(&self) -> &[f64] {
        &self.neighborhood_min
    }

    /// 每个重建体素的贡献样本最大值. 没有贡献的体素为原图灰度下界.
    #[inline]
    pub fn neighborhood_max(&self) -> &[f64] {
        &self.neighborhood_max
    }

    /// 由 `values` (按重建网格排列) 建立经核平滑的直方图, 返回其相对原图直方图的 KL 散度.
    pub fn original_kld(&mut self, values: &[f64]) -> f64 {
        self.corrected_histogram.reset();
        for &v in values.iter().filter(|v| v.is_finite()) {
            let bin = self.corrected_histogram.value_to_bin(v);
            self.corrected_histogram.add_weighted_symmetric_kernel(bin, &self.kernel);
        }
        self.corrected_histogram
            .kullback_leibler_divergence(&self.original_histogram)
    }

    /// 六邻域离散拉普拉斯的均方值. 边界处以镜像邻居代替.
    pub fn laplacian_norm(&self, ctx: &ExecContext, values: &[f64]) -> RegResult<f64> {
        let laplacians = self.laplacians(ctx, values)?;
        if laplacians.is_empty() {
            return Ok(0.0);
        }
        Ok(laplacians.iter().map(|l| l * l).sum::<f64>() / laplacians.len() as f64)
    }

    /// 把 `weight * laplacian_norm` 对 `values` 的梯度加到 `grad` 上.
    pub fn add_laplacian_gradient(
        &self,
        ctx: &ExecContext,
        values: &[f64],
        weight: f64,
        grad: &mut [f64],
    ) -> RegResult<()> {
        if grad.len() != values.len() {
            return Err(RegError::invalid("gradient length does not match values"));
        }
        let laplacians = self.laplacians(ctx, values)?;
        let dims = self.corrected.dims();
        let scale = 2.0 * weight / values.len().max(1) as f64;
        let lap = &laplacians;
        ctx.for_each_mut(grad, |i, g| *g += scale * stencil(dims, lap, i));
        Ok(())
    }

    fn laplacians(&self, ctx: &ExecContext, values: &[f64]) -> RegResult<Vec<f64>> {
        if values.len() != self.corrected.num_voxels() {
            return Err(RegError::invalid("value count does not match reconstruction grid"));
        }
        let dims = self.corrected.dims();
        let mut out = vec![0.0; values.len()];
        ctx.for_each_mut(&mut out, |i, l| *l = stencil(dims, values, i));
        Ok(out)
    }
}

/// 体素 `i` 处的六邻域拉普拉斯 `Σ 邻居 - 6 · 自身`. 边界外的邻居以另一侧邻居镜像代替;
/// 维度为 1 的轴上邻居即自身.
#[inline]
fn stencil(dims: Dims, values: &[f64], i: usize) -> f64 {
    let [nx, ny, _] = dims;
    let idx = [i % nx, (i / nx) % ny, i / (nx * ny)];
    let strides = [1, nx, nx * ny];
    let mut sum = -6.0 * values[i];
    for a in 0..3 {
        let s = strides[a];
        let (minus, plus) = if dims[a] < 2 {
            (i, i)
        } else {
            let minus = if idx[a] > 0 { i - s } else { i + s };
            let plus = if idx[a] + 1 < dims[a] { i + s } else { i - s };
            (minus, plus)
        };
        sum += values[minus] + values[plus];
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{CancelAfter, NullProgress};
    use nalgebra::Vector3;

    fn ramp(dims: Dims) -> UniformVolume {
        let n: usize = dims.iter().product();
        UniformVolume::from_delta(dims, [1.0, 1.0, 2.0])
            .with_data(TypedArray::from_vec((0..n).map(|i| (i % 7) as f32 * 10.0).collect()))
            .unwrap()
    }

    #[test]
    fn test_guess_axis() {
        let v = UniformVolume::from_delta([8, 8, 4], [1.0; 3]);
        assert_eq!(guess_interleave_axis(&v, 0), 2);
        let v = UniformVolume::from_delta([8, 4, 8], [1.0; 3]);
        assert_eq!(guess_interleave_axis(&v, 0), 1);
        let v = UniformVolume::from_delta([4, 8, 8], [1.0; 3]);
        assert_eq!(guess_interleave_axis(&v, 2), 0);
        let v = UniformVolume::from_delta([8, 8, 8], [1.0, 3.0, 1.0]);
        assert_eq!(guess_interleave_axis(&v, 0), 1);
        let v = UniformVolume::from_delta([8, 8, 8], [1.0; 3]);
        assert_eq!(guess_interleave_axis(&v, 2), 2);
    }

    #[test]
    fn test_anisotropic_reproduces_grid_samples() {
        let image = ramp([5, 4, 6]);
        let mut recon = VolumeInjection::from_interleaved(&image, 2, 2).unwrap();
        assert_eq!(recon.number_of_passes(), 2);
        // 半径小于一个体素: 每个输出体素恰好只从一个 pass 取到自身的样本.
        recon
            .volume_injection_anisotropic(&ExecContext::new(2).unwrap(), 1.0, 0.5, &NullProgress)
            .unwrap();
        let out = recon.corrected_image();
        assert_eq!(out.require_data().unwrap().scalar_type(), ScalarType::F32);
        for i in 0..out.num_voxels() {
            assert_eq!(out.get_at(i), image.get_at(i));
            assert_eq!(recon.neighborhood_min()[i], image.get_at(i).unwrap());
            assert_eq!(recon.neighborhood_max()[i], image.get_at(i).unwrap());
        }
    }

    #[test]
    fn test_isotropic_reproduces_grid_samples() {
        let image = ramp([4, 5, 6]);
        let mut recon = VolumeInjection::from_interleaved(&image, 3, 2).unwrap();
        recon.volume_injection_isotropic(1.0, 0.5, &NullProgress).unwrap();
        for i in 0..image.num_voxels() {
            let got = recon.corrected_image().get_at(i).unwrap();
            assert!((got - image.get_at(i).unwrap()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_zero_weight_gives_padding() {
        let image = ramp([3, 3, 4]);
        let mut recon = VolumeInjection::from_interleaved(&image, 2, 2).unwrap();
        recon.set_pass_weight(1, 0.0).unwrap();
        recon.volume_injection_isotropic(1.0, 0.5, &NullProgress).unwrap();
        let out = recon.corrected_image();
        assert!(out.get(0, 0, 0).is_some());
        assert!(out.get(0, 0, 1).is_none());
        assert_eq!(recon.neighborhood_min()[out.linear_index(0, 0, 1)], 60.0);
        assert!(recon.set_pass_weight(5, 1.0).is_err());
    }

    #[test]
    fn test_transform_shifts_samples() {
        let image = ramp([6, 1, 1]);
        let mut recon = VolumeInjection::new(&image, vec![image.clone()]).unwrap();
        recon
            .set_transformations(vec![AffineXform::from_translation(Vector3::new(1.0, 0.0, 0.0))])
            .unwrap();
        recon
            .volume_injection_anisotropic(&ExecContext::sequential(), 1.0, 0.5, &NullProgress)
            .unwrap();
        let out = recon.corrected_image();
        assert_eq!(out.get(0, 0, 0), image.get(1, 0, 0));
        assert!(out.get(5, 0, 0).is_none());
        assert!(recon.set_transformations(Vec::new()).is_err());
    }

    #[test]
    fn test_cancel() {
        let image = ramp([3, 3, 4]);
        let mut recon = VolumeInjection::from_interleaved(&image, 2, 2).unwrap();
        let r = recon.volume_injection_anisotropic(&ExecContext::sequential(), 1.0, 1.0, &CancelAfter::new(1));
        assert!(matches!(r, Err(RegError::Cancelled)));
    }

    #[test]
    fn test_kld() {
        let image = ramp([4, 4, 4]);
        let mut recon = VolumeInjection::from_interleaved(&image, 2, 2).unwrap();
        let same = image.require_data().unwrap().to_f64_vec(0.0);
        assert!(recon.original_kld(&same).abs() < 1e-12);
        let flat = vec![30.0; same.len()];
        assert!(recon.original_kld(&flat) > 0.1);
    }

    #[test]
    fn test_laplacian() {
        let image = ramp([5, 5, 5]);
        let recon = VolumeInjection::from_interleaved(&image, 1, 2).unwrap();
        let ctx = ExecContext::sequential();
        let constant = vec![2.0; 125];
        assert_eq!(recon.laplacian_norm(&ctx, &constant).unwrap(), 0.0);

        let values: Vec<f64> = (0..125).map(|i| ((i * 37) % 11) as f64).collect();
        let mut grad = vec![0.0; 125];
        recon.add_laplacian_gradient(&ctx, &values, 1.0, &mut grad).unwrap();
        // 中心体素及其邻居都不触及边界, 解析梯度与差分一致.
        let center = 2 + 5 * (2 + 5 * 2);
        let h = 1e-4;
        let mut up = values.clone();
        up[center] += h;
        let mut down = values.clone();
        down[center] -= h;
        let fd = (recon.laplacian_norm(&ctx, &up).unwrap() - recon.laplacian_norm(&ctx, &down).unwrap()) / (2.0 * h);
        assert!((fd - grad[center]).abs() < 1e-6 * (1.0 + fd.abs()), "{fd} vs {}", grad[center]);
    }
}
