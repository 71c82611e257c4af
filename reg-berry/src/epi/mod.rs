//! 正反相位编码 EPI 图像对的去畸变.
//!
//! 对每个体素估计沿相位编码轴的一维位移 `u` (以体素为单位). 正向图像在 `k + u` 处采样,
//! 反向图像在 `k - u` 处采样, 各自乘以局部雅可比 `1 ± ∂u/∂k` 后比较. 目标函数为
//!
//! ```text
//! f = MSD(正向校正, 反向校正) + λ2 · 光滑项 + λ3 · 防折叠项
//! ```
//!
//! 在逐级减小的高斯平滑尺度上用 L-BFGS 最小化. 梯度按 "聚集" 方式逐体素求得,
//! 每个梯度分量只由一个工作线程写入.

pub mod interp;

use nalgebra::Vector3;
use ndarray::Array4;

use crate::config::UnwarpConfig;
use crate::data::filter::gaussian_smooth_axis;
use crate::data::{ScalarType, TypedArray, UniformVolume};
use crate::exec::ExecContext;
use crate::optim::{Lbfgs, LbfgsStatus, Objective};
use crate::progress::ProgressSink;
use crate::{Dims, RegError, RegResult};

use interp::interpolate_lane;

/// 相位编码方向.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhaseDirection {
    /// 正向采集, 在 `k + u` 处采样.
    Forward,

    /// 反向采集, 在 `k - u` 处采样.
    Reverse,
}

impl PhaseDirection {
    /// `+1` 或 `-1`.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Reverse => -1.0,
        }
    }
}

/// 一个平滑层级的优化结果.
#[derive(Copy, Clone, Debug)]
pub struct UnwarpLevelReport {
    /// 图像平滑 sigma.
    pub sigma: f64,

    /// 该层级结束时的目标函数值 (基于平滑图像).
    pub f: f64,

    /// 该层级结束时, 以未平滑原图计算的校正图像均方差.
    pub msd: f64,

    /// 优化器终止原因.
    pub status: LbfgsStatus,

    /// 迭代次数.
    pub iterations: usize,
}

/// 目标函数各项.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct UnwarpTerms {
    /// 总目标值.
    pub f: f64,

    /// 均方差项.
    pub msd: f64,

    /// 光滑项 (未乘权重).
    pub smooth: f64,

    /// 防折叠项 (未乘权重).
    pub fold: f64,
}

/// 网格几何, 在并行闭包间按值传递.
#[derive(Copy, Clone, Debug)]
struct Geometry {
    dims: Dims,
    strides: [usize; 3],
    pe: usize,
}

impl Geometry {
    fn new(dims: Dims, pe: usize) -> Self {
        Self {
            dims,
            strides: [1, dims[0], dims[0] * dims[1]],
            pe,
        }
    }

    #[inline]
    fn index_of(&self, i: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [i % nx, (i / nx) % ny, i / (nx * ny)]
    }

    #[inline]
    fn plane(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    /// 沿相位编码轴的内部 (不含首尾一层)?
    #[inline]
    fn inside(&self, k: usize) -> bool {
        k >= 1 && k + 1 < self.dims[self.pe]
    }

    /// 去掉轴 `axis` 首层后的区域大小.
    #[inline]
    fn trimmed_size(&self, axis: usize) -> usize {
        let n: usize = self.dims.iter().product();
        n / self.dims[axis].max(1) * self.dims[axis].saturating_sub(1)
    }

    /// 去掉相位编码轴首尾两层后的区域大小.
    #[inline]
    fn inside_size(&self) -> usize {
        let n: usize = self.dims.iter().product();
        n / self.dims[self.pe].max(1) * self.dims[self.pe].saturating_sub(2)
    }

    /// 体素 `i` 处的局部雅可比偏量 `∂u/∂k` (中心差分); 首尾层为 0.
    #[inline]
    fn partial_jacobian(&self, u: &[f64], i: usize) -> f64 {
        let k = self.index_of(i)[self.pe];
        if self.inside(k) {
            let st = self.strides[self.pe];
            0.5 * (u[i + st] - u[i - st])
        } else {
            0.0
        }
    }

    /// 在体素 `i` 所在的相位编码 lane 上, 位置 `pos` 处插值.
    #[inline]
    fn interpolate(&self, src: &[f64], i: usize, pos: f64) -> f64 {
        let st = self.strides[self.pe];
        let k = self.index_of(i)[self.pe];
        let start = i - k * st;
        let base = pos.floor();
        interpolate_lane(src, start, st, self.dims[self.pe], base as i64, pos - base)
    }
}

/// EPI 去畸变目标函数及其状态.
#[derive(Clone, Debug)]
pub struct EpiUnwarp {
    template: UniformVolume,
    geom: Geometry,
    readout: usize,
    image_fwd: Vec<f64>,
    image_rev: Vec<f64>,
    smooth_fwd: Vec<f64>,
    smooth_rev: Vec<f64>,
    deformation: Vec<f64>,
    smoothness_weight: f64,
    folding_weight: f64,
    unwarp_fwd: Vec<f64>,
    unwarp_rev: Vec<f64>,
    corrected_fwd: Vec<f64>,
    corrected_rev: Vec<f64>,
    gradient_fwd: Vec<f64>,
    gradient_rev: Vec<f64>,
    diff: Vec<f64>,
    composite: Vec<f64>,
}

impl EpiUnwarp {
    /// 由正反向图像创建. 两者网格不一致时返回 `GridMismatch`.
    ///
    /// `init_shift_com` 为真时按逐行质心差初始化形变, 否则初始化为零.
    pub fn new(
        fwd: &UniformVolume,
        rev: &UniformVolume,
        phase_encode_axis: usize,
        init_shift_com: bool,
    ) -> RegResult<Self> {
        if phase_encode_axis > 2 {
            return Err(RegError::invalid(format!(
                "phase-encode axis {phase_encode_axis} out of range"
            )));
        }
        if !fwd.grid_matches(rev) {
            return Err(RegError::GridMismatch {
                left: fwd.dims(),
                right: rev.dims(),
            });
        }
        let dims = fwd.dims();
        let n = fwd.num_voxels();
        let image_fwd = fwd.require_data()?.to_f64_vec(0.0);
        let image_rev = rev.require_data()?.to_f64_vec(0.0);

        // 读出方向: 除相位编码轴外体素最多的轴.
        let mut in_plane = dims;
        in_plane[phase_encode_axis] = 0;
        let readout = (0..3).rev().max_by_key(|&a| in_plane[a]).unwrap_or(0);

        let mut functional = Self {
            template: fwd.clone_geometry(None),
            geom: Geometry::new(dims, phase_encode_axis),
            readout,
            smooth_fwd: image_fwd.clone(),
            smooth_rev: image_rev.clone(),
            image_fwd,
            image_rev,
            deformation: vec![0.0; n],
            smoothness_weight: 0.0,
            folding_weight: 0.0,
            unwarp_fwd: vec![0.0; n],
            unwarp_rev: vec![0.0; n],
            corrected_fwd: vec![0.0; n],
            corrected_rev: vec![0.0; n],
            gradient_fwd: vec![0.0; n],
            gradient_rev: vec![0.0; n],
            diff: vec![0.0; n],
            composite: vec![0.0; n],
        };
        if init_shift_com {
            functional.init_shift_centers_of_mass();
        }
        tracing::debug!(
            "EPI unwarp on {:?}, phase-encode axis {phase_encode_axis}, readout axis {readout}",
            dims
        );
        Ok(functional)
    }

    /// 由配置创建, 并设置正则项权重.
    pub fn from_config(fwd: &UniformVolume, rev: &UniformVolume, cfg: &UnwarpConfig) -> RegResult<Self> {
        cfg.validate()?;
        let mut functional = Self::new(fwd, rev, cfg.phase_encode_axis, cfg.init_shift_com)?;
        functional.set_smoothness_weight(cfg.smoothness_weight);
        functional.set_folding_weight(cfg.folding_weight);
        Ok(functional)
    }

    /// 相位编码轴.
    #[inline]
    pub fn phase_encode_axis(&self) -> usize {
        self.geom.pe
    }

    /// 读出轴.
    #[inline]
    pub fn readout_axis(&self) -> usize {
        self.readout
    }

    /// 光滑项权重 λ2.
    #[inline]
    pub fn set_smoothness_weight(&mut self, w: f64) {
        self.smoothness_weight = w;
    }

    /// 防折叠项权重 λ3.
    #[inline]
    pub fn set_folding_weight(&mut self, w: f64) {
        self.folding_weight = w;
    }

    /// 当前形变 (体素单位, 扁平存储).
    #[inline]
    pub fn deformation(&self) -> &[f64] {
        &self.deformation
    }

    /// 覆盖当前形变.
    pub fn set_deformation(&mut self, u: &[f64]) -> RegResult<()> {
        if u.len() != self.deformation.len() {
            return Err(RegError::invalid("deformation length does not match grid"));
        }
        self.deformation.copy_from_slice(u);
        Ok(())
    }

    /// 逐行质心差初始化: 每条相位编码 lane 的初始位移为两图质心差的一半.
    /// 任一图像在该行的总质量不为正时, 该行位移为零.
    fn init_shift_centers_of_mass(&mut self) {
        let g = self.geom;
        let st = g.strides[g.pe];
        let n_pe = g.dims[g.pe];
        for i in 0..self.deformation.len() {
            if g.index_of(i)[g.pe] != 0 {
                continue;
            }
            let (mut mass_f, mut com_f, mut mass_r, mut com_r) = (0.0, 0.0, 0.0, 0.0);
            for k in 0..n_pe {
                let vf = self.image_fwd[i + k * st];
                let vr = self.image_rev[i + k * st];
                mass_f += vf;
                com_f += k as f64 * vf;
                mass_r += vr;
                com_r += k as f64 * vr;
            }
            let shift = if mass_f > 0.0 && mass_r > 0.0 {
                (com_f / mass_f - com_r / mass_r) / 2.0
            } else {
                0.0
            };
            for k in 0..n_pe {
                self.deformation[i + k * st] = shift;
            }
        }
    }

    /// 以 `sigma` (物理单位) 沿相位编码轴平滑源图像. `sigma <= 0` 时恢复原图.
    pub fn set_smoothing_sigma(&mut self, ctx: &ExecContext, sigma: f64) -> RegResult<()> {
        self.smooth_fwd.copy_from_slice(&self.image_fwd);
        self.smooth_rev.copy_from_slice(&self.image_rev);
        if sigma > 0.0 {
            let (dims, delta, pe) = (self.geom.dims, self.template.delta(), self.geom.pe);
            gaussian_smooth_axis(ctx, &mut self.smooth_fwd, dims, delta, sigma, pe)?;
            gaussian_smooth_axis(ctx, &mut self.smooth_rev, dims, delta, sigma, pe)?;
        }
        Ok(())
    }

    /// 求目标函数值并把梯度写入 `g`.
    pub fn evaluate(&mut self, ctx: &ExecContext, u: &[f64], g: &mut [f64]) -> UnwarpTerms {
        let geom = self.geom;
        compute_deformed(ctx, geom, u, 1.0, &self.smooth_fwd, &mut self.unwarp_fwd, &mut self.corrected_fwd);
        compute_deformed(ctx, geom, u, -1.0, &self.smooth_rev, &mut self.unwarp_rev, &mut self.corrected_rev);
        make_gradient_image(ctx, geom, u, 1.0, &self.smooth_fwd, &mut self.gradient_fwd);
        make_gradient_image(ctx, geom, u, -1.0, &self.smooth_rev, &mut self.gradient_rev);

        let (cf, cr) = (&self.corrected_fwd, &self.corrected_rev);
        ctx.for_each_mut(&mut self.diff, |i, d| *d = cf[i] - cr[i]);
        let (diff, uf, ur) = (&self.diff, &self.unwarp_fwd, &self.unwarp_rev);
        ctx.for_each_mut(&mut self.composite, |i, c| *c = diff[i] * (uf[i] + ur[i]));

        let n_inside = geom.inside_size();
        let inv_inside = if n_inside > 0 { 1.0 / n_inside as f64 } else { 0.0 };
        let lambda2 = self.smoothness_weight;
        let lambda3 = self.folding_weight;
        let inv_trimmed = [0, 1, 2].map(|a| {
            let n = geom.trimmed_size(a);
            if n > 0 {
                1.0 / n as f64
            } else {
                0.0
            }
        });

        let (diff, composite) = (&self.diff, &self.composite);
        let (gf, gr) = (&self.gradient_fwd, &self.gradient_rev);
        let partial = ctx.map_chunks_mut(g, geom.plane(), || (), |_, z, plane| {
            let mut sums = [0.0; 5];
            let base = z * geom.plane();
            for (p, gj) in plane.iter_mut().enumerate() {
                let j = base + p;
                let idx = geom.index_of(j);
                let k = idx[geom.pe];
                let st = geom.strides[geom.pe];
                let mut acc = 0.0;

                // 均方差项, 以及相邻体素雅可比带来的项.
                if geom.inside(k) {
                    let d = diff[j];
                    sums[0] += d * d;
                    acc += 2.0 * d * (gf[j] + gr[j]) * inv_inside;
                }
                if k >= 1 && geom.inside(k - 1) {
                    acc += composite[j - st] * inv_inside;
                }
                if geom.inside(k + 1) {
                    acc -= composite[j + st] * inv_inside;
                }

                if lambda2 > 0.0 {
                    for a in 0..3 {
                        let sa = geom.strides[a];
                        if idx[a] >= 1 {
                            let d = u[j] - u[j - sa];
                            sums[1 + a] += d * d;
                            acc += 2.0 * lambda2 * d * inv_trimmed[a];
                        }
                        if idx[a] + 1 < geom.dims[a] {
                            acc -= 2.0 * lambda2 * (u[j + sa] - u[j]) * inv_trimmed[a];
                        }
                    }
                }

                if lambda3 > 0.0 {
                    if k >= 1 {
                        let d = u[j] - u[j - st];
                        sums[4] += d * d;
                        acc += 2.0 * lambda3 * d * inv_trimmed[geom.pe];
                    }
                    if k + 1 < geom.dims[geom.pe] {
                        acc -= 2.0 * lambda3 * (u[j + st] - u[j]) * inv_trimmed[geom.pe];
                    }
                }
                *gj = acc;
            }
            sums
        });

        let mut sums = [0.0; 5];
        for s in &partial {
            sums.iter_mut().zip(s).for_each(|(a, b)| *a += b);
        }
        let msd = sums[0] * inv_inside;
        let smooth: f64 = (0..3).map(|a| sums[1 + a] * inv_trimmed[a]).sum();
        let fold = sums[4] * inv_trimmed[geom.pe];
        let f = msd + lambda2 * smooth + lambda3 * fold;
        tracing::trace!("f {f} msd {msd} smooth {smooth} fold {fold}");
        UnwarpTerms { f, msd, smooth, fold }
    }

    /// 以未平滑原图和当前形变重新计算校正图像, 返回其均方差.
    pub fn update_corrected_images(&mut self, ctx: &ExecContext) -> f64 {
        let geom = self.geom;
        let u = &self.deformation;
        compute_deformed(ctx, geom, u, 1.0, &self.image_fwd, &mut self.unwarp_fwd, &mut self.corrected_fwd);
        compute_deformed(ctx, geom, u, -1.0, &self.image_rev, &mut self.unwarp_rev, &mut self.corrected_rev);
        let n = geom.inside_size();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..u.len())
            .filter(|&i| geom.inside(geom.index_of(i)[geom.pe]))
            .map(|i| (self.corrected_fwd[i] - self.corrected_rev[i]).powi(2))
            .sum();
        sum / n as f64
    }

    /// 多尺度优化: sigma 从 `smooth_max` 起每层减小 `smooth_diff`, 直到小于 `smooth_min`.
    ///
    /// 每层运行至多 `iterations` 次 L-BFGS 迭代. 优化器失败只记录日志, 继续使用最后的迭代点.
    /// 结束时用未平滑原图重新计算校正图像. 进度接收端请求中止时返回 `Cancelled`.
    pub fn optimize(
        &mut self,
        ctx: &ExecContext,
        iterations: usize,
        smooth_max: f64,
        smooth_min: f64,
        smooth_diff: f64,
        progress: &dyn ProgressSink,
    ) -> RegResult<Vec<UnwarpLevelReport>> {
        let lbfgs = Lbfgs {
            max_iterations: iterations,
            ..Default::default()
        };
        self.optimize_with(ctx, &lbfgs, smooth_max, smooth_min, smooth_diff, progress)
    }

    /// 按配置优化.
    pub fn optimize_config(
        &mut self,
        ctx: &ExecContext,
        cfg: &UnwarpConfig,
        progress: &dyn ProgressSink,
    ) -> RegResult<Vec<UnwarpLevelReport>> {
        cfg.validate()?;
        let lbfgs = Lbfgs {
            memory: cfg.lbfgs_memory,
            max_iterations: cfg.iterations,
            eps_g: cfg.eps_g,
            eps_f: cfg.eps_f,
            eps_x: cfg.eps_x,
        };
        self.optimize_with(
            ctx,
            &lbfgs,
            cfg.smooth_sigma_max,
            cfg.smooth_sigma_min,
            cfg.smooth_sigma_diff,
            progress,
        )
    }

    fn optimize_with(
        &mut self,
        ctx: &ExecContext,
        lbfgs: &Lbfgs,
        smooth_max: f64,
        smooth_min: f64,
        smooth_diff: f64,
        progress: &dyn ProgressSink,
    ) -> RegResult<Vec<UnwarpLevelReport>> {
        if !(smooth_diff > 0.0) {
            return Err(RegError::invalid("smoothing sigma decrement must be positive"));
        }
        let mut reports = Vec::new();
        let mut level = 0;
        loop {
            let sigma = smooth_max - level as f64 * smooth_diff;
            if sigma < smooth_min {
                break;
            }
            level += 1;
            tracing::debug!("setting image smoothing kernel sigma={sigma}");
            self.set_smoothing_sigma(ctx, sigma)?;

            progress.begin("EPI unwarping", lbfgs.max_iterations, 1);
            let mut x = std::mem::take(&mut self.deformation);
            let mut objective = UnwarpObjective {
                functional: &mut *self,
                ctx,
                progress,
                evaluations: 0,
                cancelled: false,
            };
            let report = lbfgs.minimize(&mut objective, &mut x);
            let cancelled = objective.cancelled;
            self.deformation = x;
            progress.done();
            if cancelled {
                return Err(RegError::Cancelled);
            }
            if report.status.is_failure() {
                tracing::error!("L-BFGS returned status code {}", report.status.code());
            }

            let msd = self.update_corrected_images(ctx);
            reports.push(UnwarpLevelReport {
                sigma,
                f: report.f,
                msd,
                status: report.status,
                iterations: report.iterations,
            });
            tracing::info!(
                "sigma {sigma:.3}: f {:.6e}, msd {msd:.6e}, {} iterations",
                report.f,
                report.iterations
            );
        }
        self.update_corrected_images(ctx);
        Ok(reports)
    }

    /// 校正后的图像 (`f32`).
    pub fn corrected_image(&self, direction: PhaseDirection) -> RegResult<UniformVolume> {
        let src = match direction {
            PhaseDirection::Forward => &self.corrected_fwd,
            PhaseDirection::Reverse => &self.corrected_rev,
        };
        let mut out = self.template.clone_geometry(None);
        out.set_data(TypedArray::from_vec(src.iter().map(|&v| v as f32).collect::<Vec<_>>()))?;
        Ok(out)
    }

    /// 雅可比图 `1 ± ∂u/∂k` (`f64`).
    pub fn jacobian_map(&self, direction: PhaseDirection) -> RegResult<UniformVolume> {
        let s = direction.sign();
        let u = &self.deformation;
        let mut out = self.template.clone_geometry(Some(ScalarType::F64));
        let values: Vec<f64> = (0..u.len())
            .map(|i| 1.0 + s * self.geom.partial_jacobian(u, i))
            .collect();
        out.set_data(TypedArray::from_vec(values))?;
        Ok(out)
    }

    /// 物理单位的形变场, 形状为 `(z, y, x, 3)`. 只有相位编码分量非零.
    pub fn deformation_field(&self, direction: PhaseDirection) -> RegResult<Array4<f64>> {
        let [nx, ny, nz] = self.geom.dims;
        let scale = direction.sign() * self.template.delta()[self.geom.pe];
        let pe = self.geom.pe;
        let data: Vec<f64> = self
            .deformation
            .iter()
            .flat_map(|&u| {
                let mut v = Vector3::zeros();
                v[pe] = scale * u;
                [v[0], v[1], v[2]]
            })
            .collect();
        Array4::from_shape_vec((nz, ny, nx, 3), data).map_err(|e| RegError::invalid(e.to_string()))
    }
}

/// 供优化器调用的目标函数适配器.
struct UnwarpObjective<'a> {
    functional: &'a mut EpiUnwarp,
    ctx: &'a ExecContext,
    progress: &'a dyn ProgressSink,
    evaluations: usize,
    cancelled: bool,
}

impl Objective for UnwarpObjective<'_> {
    fn evaluate(&mut self, x: &[f64], g: &mut [f64]) -> f64 {
        if self.cancelled || self.progress.set_progress(self.evaluations).is_interrupt() {
            // 非有限值使优化器立即停止.
            self.cancelled = true;
            return f64::NAN;
        }
        self.evaluations += 1;
        self.functional.evaluate(self.ctx, x, g).f
    }
}

/// 在 `k + s·u` 处重采样 `src`, 得到去畸变图像及乘以雅可比后的校正图像.
fn compute_deformed(
    ctx: &ExecContext,
    geom: Geometry,
    u: &[f64],
    s: f64,
    src: &[f64],
    unwarp: &mut [f64],
    corrected: &mut [f64],
) {
    ctx.map_chunks_mut(unwarp, geom.plane(), || (), |_, z, plane| {
        let base = z * geom.plane();
        for (p, out) in plane.iter_mut().enumerate() {
            let i = base + p;
            let pos = s * u[i] + geom.index_of(i)[geom.pe] as f64;
            *out = geom.interpolate(src, i, pos);
        }
    });
    let unwarp = &*unwarp;
    ctx.for_each_mut(corrected, |i, c| {
        *c = unwarp[i] * (1.0 + s * geom.partial_jacobian(u, i));
    });
}

/// 沿相位编码轴的中心差分强度梯度, 乘以 `0.5 · 雅可比`.
fn make_gradient_image(ctx: &ExecContext, geom: Geometry, u: &[f64], s: f64, src: &[f64], out: &mut [f64]) {
    ctx.map_chunks_mut(out, geom.plane(), || (), |_, z, plane| {
        let base = z * geom.plane();
        for (p, out) in plane.iter_mut().enumerate() {
            let i = base + p;
            let shift = s * u[i] + geom.index_of(i)[geom.pe] as f64;
            let d = geom.interpolate(src, i, shift + 1.0) - geom.interpolate(src, i, shift - 1.0);
            *out = d * 0.5 * (1.0 + s * geom.partial_jacobian(u, i));
        }
    });
}
