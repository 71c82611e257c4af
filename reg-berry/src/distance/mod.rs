//! 各向异性欧氏距离变换.
//!
//! 先按规则把体数据二值化, 再分两阶段求平方距离:
//!
//! 1. 每个 z 平面独立求二维距离. 平面内先沿 x 做前向/反向传播 (一维时 L1 与 L2 等价),
//!   乘以间距并平方, 再对每条 y 列做一维 Voronoi 变换.
//! 2. 对每条 (x, y) 柱沿 z 做一维 Voronoi 变换.
//!
//! 两阶段都按互不重叠的平面/柱并行, 每个工作线程持有私有包络暂存区, 结果与线程数无关.

mod voronoi;

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{ArrayViewMut3, Axis};

use crate::config::DistanceMapConfig;
use crate::consts::EDT_MAX_DISTANCE_SQUARED;
use crate::data::{TypedArray, UniformVolume};
use crate::exec::ExecContext;
use crate::progress::{CancelFlag, ProgressSink};
use crate::{RegError, RegResult};

use voronoi::Envelope;

/// 计算 `volume` 上每个体素到最近特征体素的欧氏距离 (物理单位).
///
/// 结果是同一网格上的 `f64` 体数据, 不设 padding. 不含任何特征体素时,
/// 所有体素保持标记值 [`EDT_MAX_DISTANCE_SQUARED`] (或其平方根).
///
/// 进度按平面汇报 (两个阶段共 `nz + ny` 个单元); 接收端请求中止时返回 `Cancelled`.
pub fn distance_map(
    ctx: &ExecContext,
    volume: &UniformVolume,
    cfg: &DistanceMapConfig,
    progress: &dyn ProgressSink,
) -> RegResult<UniformVolume> {
    let data = volume.require_data()?;
    let [nx, ny, nz] = volume.dims();
    let delta = volume.delta();

    let mut values: Vec<f64> = (0..data.len())
        .map(|i| if cfg.is_feature(data.get(i)) { 1.0 } else { 0.0 })
        .collect();

    let cancel = CancelFlag::default();
    progress.begin("distance map", nz + ny, 1);

    // 第一阶段: 平面.
    ctx.map_chunks_mut(
        &mut values,
        nx * ny,
        || (Envelope::default(), Vec::<f64>::new()),
        |(env, column), z, plane| {
            if cancel.is_set() {
                return;
            }
            cancel.report(progress, z);
            edt_2d(plane, nx, ny, delta, env, column);
        },
    );
    if cancel.is_set() {
        progress.done();
        return Err(RegError::Cancelled);
    }

    // 第二阶段: 沿 z 的柱.
    if nz > 1 {
        let done = AtomicUsize::new(0);
        let view = ArrayViewMut3::from_shape((nz, ny, nx), values.as_mut_slice())
            .map_err(|e| RegError::invalid(e.to_string()))?;
        ctx.for_each_lane_mut(
            view,
            Axis(0),
            || (Envelope::default(), Vec::<f64>::new()),
            |(env, f), mut lane| {
                if cancel.is_set() {
                    return;
                }
                f.clear();
                f.extend(lane.iter().copied());
                if env.solve(f, delta[2]) {
                    lane.iter_mut().zip(f.iter()).for_each(|(dst, &v)| *dst = v);
                }
                let k = done.fetch_add(1, Ordering::Relaxed) + 1;
                if k % nx == 0 {
                    cancel.report(progress, nz + k / nx);
                }
            },
        );
    }
    progress.done();
    if cancel.is_set() {
        return Err(RegError::Cancelled);
    }

    if !cfg.squared {
        ctx.for_each_mut(&mut values, |_, v| *v = v.sqrt());
    }

    let mut out = volume.clone_geometry(None);
    out.set_data(TypedArray::from_vec(values))?;
    tracing::debug!("distance map on {:?} grid done", volume.dims());
    Ok(out)
}

/// 单个 z 平面的二维平方距离. 输入中 `1.0` 表示特征, `0.0` 表示背景.
fn edt_2d(
    plane: &mut [f64],
    nx: usize,
    ny: usize,
    delta: [f64; 3],
    env: &mut Envelope,
    column: &mut Vec<f64>,
) {
    const MAX: f64 = EDT_MAX_DISTANCE_SQUARED;

    for row in plane.chunks_mut(nx) {
        // 前向.
        let mut d = MAX;
        for p in row.iter_mut() {
            if *p != 0.0 {
                d = 0.0;
                *p = 0.0;
            } else if d != MAX {
                d += 1.0;
                *p = d;
            } else {
                *p = MAX;
            }
        }

        // 反向. 整行都没有特征时保持标记值.
        if row[nx - 1] != MAX {
            let mut d = MAX;
            for p in row.iter_mut().rev() {
                if *p == 0.0 {
                    d = 0.0;
                } else if d != MAX {
                    d += 1.0;
                    if d < *p {
                        *p = d;
                    }
                }
                let scaled = *p * delta[0];
                *p = scaled * scaled;
            }
        }
    }

    if ny < 2 {
        return;
    }
    for x in 0..nx {
        column.clear();
        column.extend((0..ny).map(|y| plane[x + nx * y]));
        if env.solve(column, delta[1]) {
            for (y, &v) in column.iter().enumerate() {
                plane[x + nx * y] = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureRule;
    use crate::data::ScalarType;
    use crate::progress::{CancelAfter, NullProgress};

    fn single_feature(dims: [usize; 3], delta: [f64; 3], at: [usize; 3]) -> UniformVolume {
        let mut v = UniformVolume::from_delta(dims, delta);
        v.create_data_array(ScalarType::U8);
        v.set(at[0], at[1], at[2], 1.0).unwrap();
        v
    }

    #[test]
    fn test_single_feature_analytic() {
        let delta = [1.0, 1.5, 2.0];
        let at = [2, 1, 3];
        let v = single_feature([5, 4, 6], delta, at);
        let d = distance_map(&ExecContext::sequential(), &v, &Default::default(), &NullProgress)
            .unwrap();
        for z in 0..6 {
            for y in 0..4 {
                for x in 0..5 {
                    let e: f64 = [x, y, z]
                        .iter()
                        .zip(at)
                        .zip(delta)
                        .map(|((&i, c), s)| ((i as f64 - c as f64) * s).powi(2))
                        .sum();
                    let got = d.get(x, y, z).unwrap();
                    assert!((got - e.sqrt()).abs() < 1e-9, "({x},{y},{z}): {got} vs {}", e.sqrt());
                }
            }
        }
    }

    #[test]
    fn test_squared_and_rule() {
        let mut v = UniformVolume::from_delta([4, 1, 1], [1.0; 3]);
        v.set_data(TypedArray::from_vec(vec![5.0f32, 1.0, 2.0, 7.0])).unwrap();
        let cfg = DistanceMapConfig {
            rule: FeatureRule::Threshold,
            value: 6.0,
            squared: true,
            ..Default::default()
        };
        let d = distance_map(&ExecContext::sequential(), &v, &cfg, &NullProgress).unwrap();
        assert_eq!(d.data().unwrap().to_f64_vec(-1.0), vec![9.0, 4.0, 1.0, 0.0]);
        assert_eq!(d.data().unwrap().padding(), None);
    }

    #[test]
    fn test_no_feature_keeps_marker() {
        let mut v = UniformVolume::from_delta([3, 2, 2], [1.0; 3]);
        v.create_data_array(ScalarType::U8);
        let cfg = DistanceMapConfig {
            squared: true,
            ..Default::default()
        };
        let d = distance_map(&ExecContext::sequential(), &v, &cfg, &NullProgress).unwrap();
        assert!(d
            .data()
            .unwrap()
            .to_f64_vec(0.0)
            .iter()
            .all(|&x| x == EDT_MAX_DISTANCE_SQUARED));
    }

    #[test]
    fn test_cancel() {
        let v = single_feature([3, 3, 5], [1.0; 3], [1, 1, 1]);
        let r = distance_map(&ExecContext::sequential(), &v, &Default::default(), &CancelAfter::new(2));
        assert!(matches!(r, Err(RegError::Cancelled)));
    }

    #[test]
    fn test_requires_data() {
        let v = UniformVolume::from_delta([2, 2, 2], [1.0; 3]);
        let r = distance_map(&ExecContext::sequential(), &v, &Default::default(), &NullProgress);
        assert!(matches!(r, Err(RegError::NoData)));
    }
}
