//! 体数据滤波: 中值, Sobel, 可分离高斯.

use ndarray::{ArrayViewMut3, Axis};
use ordered_float::OrderedFloat;

use super::grid::DataGrid;
use super::typed_array::TypedArray;
use super::volume::UniformVolume;
use crate::exec::ExecContext;
use crate::progress::{CancelFlag, ProgressSink};
use crate::{Dims, RegError, RegResult};

/// 截断高斯核时允许丢弃的尾部相对权重.
pub const GAUSSIAN_MAX_ERROR: f64 = 1e-5;

/// 半高斯核 (中心在下标 0), 以体素为单位的标准差 `sigma`.
///
/// `sigma <= 0` 时返回 `[1.0]`.
pub fn gaussian_half_kernel(sigma: f64, max_error: f64) -> Vec<f64> {
    if !(sigma > 0.0) {
        return vec![1.0];
    }
    let radius = (sigma * (-2.0 * max_error.ln()).sqrt()).ceil().max(1.0) as usize;
    (0..=radius)
        .map(|i| {
            let t = i as f64 / sigma;
            (-0.5 * t * t).exp()
        })
        .collect()
}

/// 沿一条 lane 做一维高斯卷积. 只累加界内有效 (非 NaN) 样本, 并以其权重和归一化.
fn convolve_lane(kernel: &[f64], input: &[f64], output: &mut [f64]) {
    let n = input.len();
    let r = kernel.len() - 1;
    for (i, out) in output.iter_mut().enumerate() {
        let lo = i.saturating_sub(r);
        let hi = (i + r).min(n - 1);
        let (mut sum, mut weight) = (0.0, 0.0);
        for (j, &v) in input.iter().enumerate().take(hi + 1).skip(lo) {
            if v.is_nan() {
                continue;
            }
            let w = kernel[i.abs_diff(j)];
            sum += w * v;
            weight += w;
        }
        *out = if weight > 0.0 { sum / weight } else { f64::NAN };
    }
}

/// 对 `(z, y, x)` 扁平数组沿各轴依次做高斯平滑. `sigma` 为物理单位, NaN 表示缺失.
pub(crate) fn gaussian_smooth(
    ctx: &ExecContext,
    values: &mut [f64],
    dims: Dims,
    delta: [f64; 3],
    sigma: f64,
) -> RegResult<()> {
    for axis in 0..3 {
        gaussian_smooth_axis(ctx, values, dims, delta, sigma, axis)?;
    }
    Ok(())
}

/// 只沿 `axis` 做一维高斯平滑.
pub(crate) fn gaussian_smooth_axis(
    ctx: &ExecContext,
    values: &mut [f64],
    dims: Dims,
    delta: [f64; 3],
    sigma: f64,
    axis: usize,
) -> RegResult<()> {
    if !(sigma > 0.0) || dims[axis] < 2 {
        return Ok(());
    }
    let [nx, ny, nz] = dims;
    let view = ArrayViewMut3::from_shape((nz, ny, nx), values)
        .map_err(|e| RegError::invalid(e.to_string()))?;
    // 数组轴 2 对应 x, 轴 0 对应 z.
    let kernel = gaussian_half_kernel(sigma / delta[axis], GAUSSIAN_MAX_ERROR);
    ctx.for_each_lane_mut(view, Axis(2 - axis), Vec::<f64>::new, |buf, mut lane| {
        buf.clear();
        buf.extend(lane.iter().copied());
        let mut out = vec![0.0; buf.len()];
        convolve_lane(&kernel, buf, &mut out);
        lane.iter_mut().zip(out).for_each(|(dst, v)| *dst = v);
    });
    Ok(())
}

/// 按邻域排序后取中值. 偶数个样本时取中间两个的平均.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by_key(|&v| OrderedFloat(v));
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2] + values[n / 2 - 1])
    })
}

/// 把 `f64` 结果写回与原数组同类型的新数组, NaN 写为缺失.
fn to_template(template: &TypedArray, values: &[f64]) -> TypedArray {
    let mut out = template.new_template(values.len());
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            out.set_padding_at(i);
        } else {
            out.set(i, v);
        }
    }
    out
}

impl DataGrid {
    /// 中值滤波. 邻域为以体素为中心, 半径 `radius` 的立方体 (在边界处截断), 只统计有效值.
    ///
    /// 按 z 平面并行, 每个平面汇报一次进度. 进度接收端请求中止时返回 `Cancelled`.
    pub fn get_data_median_filtered(
        &self,
        ctx: &ExecContext,
        radius: usize,
        progress: &dyn ProgressSink,
    ) -> RegResult<TypedArray> {
        let data = self.require_data()?;
        let [nx, ny, nz] = self.dims();
        let mut out = vec![f64::NAN; self.num_voxels()];
        let cancel = CancelFlag::default();
        progress.begin("median filter", nz, 1);
        ctx.map_chunks_mut(&mut out, nx * ny, Vec::<f64>::new, |buf, z, plane| {
            if cancel.is_set() {
                return;
            }
            cancel.report(progress, z);
            let (z0, z1) = (z.saturating_sub(radius), (z + radius + 1).min(nz));
            for y in 0..ny {
                let (y0, y1) = (y.saturating_sub(radius), (y + radius + 1).min(ny));
                for x in 0..nx {
                    let (x0, x1) = (x.saturating_sub(radius), (x + radius + 1).min(nx));
                    buf.clear();
                    for zz in z0..z1 {
                        for yy in y0..y1 {
                            let row = self.linear_index(0, yy, zz);
                            buf.extend((x0..x1).filter_map(|xx| data.get(row + xx)));
                        }
                    }
                    plane[x + nx * y] = median(buf).unwrap_or(f64::NAN);
                }
            }
        });
        progress.done();
        if cancel.is_set() {
            return Err(RegError::Cancelled);
        }
        Ok(to_template(data, &out))
    }

    /// Sobel 边缘强度: 三个轴各自在两个正交平面内的 Sobel 响应绝对值之平均.
    ///
    /// 边界体素为 0, 邻域内缺失值按 0 计.
    pub fn get_data_sobel_filtered(&self, ctx: &ExecContext) -> RegResult<TypedArray> {
        let data = self.require_data()?;
        let [nx, ny, nz] = self.dims();
        let mut out = vec![0.0; self.num_voxels()];
        let strides = [self.stride(0), self.stride(1), self.stride(2)];
        ctx.map_chunks_mut(&mut out, nx * ny, || (), |_, z, plane| {
            if z == 0 || z + 1 >= nz {
                return;
            }
            for y in 1..ny.saturating_sub(1) {
                for x in 1..nx.saturating_sub(1) {
                    let center = self.linear_index(x, y, z);
                    let at = |a: usize, da: i64, b: usize, db: i64| {
                        let o = center as i64 + da * strides[a] as i64 + db * strides[b] as i64;
                        data.get_or(o as usize, 0.0)
                    };
                    let mut total = 0.0;
                    for a in 0..3 {
                        for b in (0..3).filter(|&b| b != a) {
                            let response = (at(a, -1, b, -1) - at(a, 1, b, -1))
                                + 2.0 * (at(a, -1, b, 0) - at(a, 1, b, 0))
                                + (at(a, -1, b, 1) - at(a, 1, b, 1));
                            total += response.abs();
                        }
                    }
                    plane[x + nx * y] = total / 6.0;
                }
            }
        });
        Ok(to_template(data, &out))
    }
}

impl UniformVolume {
    /// 三维高斯平滑, `sigma` 为物理单位. 结果为 `f64` 数组, 无有效邻域的体素为缺失.
    pub fn get_gaussian_filtered(&self, ctx: &ExecContext, sigma: f64) -> RegResult<TypedArray> {
        let mut values = self.require_data()?.to_f64_vec(f64::NAN);
        gaussian_smooth(ctx, &mut values, self.dims(), self.delta(), sigma)?;
        Ok(TypedArray::from_vec(values))
    }

    /// 只沿 `axis` 的一维高斯平滑, `sigma` 为物理单位. 结果为 `f64` 数组.
    pub fn get_gaussian_filtered_1d(
        &self,
        ctx: &ExecContext,
        axis: usize,
        sigma: f64,
    ) -> RegResult<TypedArray> {
        let mut values = self.require_data()?.to_f64_vec(f64::NAN);
        gaussian_smooth_axis(ctx, &mut values, self.dims(), self.delta(), sigma, axis)?;
        Ok(TypedArray::from_vec(values))
    }
}
