//! 三次 B 样条自由形变.
//!
//! 控制点按规则网格排布, 每个控制点保存其 (绝对) 目标位置. 初始时控制点位置由初始仿射变换给出,
//! 由于三次 B 样条能精确重建线性函数, 未修改控制点时整个形变与初始仿射一致.

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::affine::AffineXform;
use crate::consts::INVERSE_MAX_ITERATIONS;
use crate::{Dims, RegError, RegResult};

/// 三次 B 样条基函数在 `f ∈ [0, 1)` 处的四个值.
#[inline]
fn basis(f: f64) -> [f64; 4] {
    let g = 1.0 - f;
    let f2 = f * f;
    let f3 = f2 * f;
    [
        g * g * g / 6.0,
        (3.0 * f3 - 6.0 * f2 + 4.0) / 6.0,
        (-3.0 * f3 + 3.0 * f2 + 3.0 * f + 1.0) / 6.0,
        f3 / 6.0,
    ]
}

/// 基函数导数.
#[inline]
fn basis_derivative(f: f64) -> [f64; 4] {
    let g = 1.0 - f;
    [
        -0.5 * g * g,
        1.5 * f * f - 2.0 * f,
        (-3.0 * f * f + 2.0 * f + 1.0) / 2.0,
        0.5 * f * f,
    ]
}

/// 三次 B 样条形变场.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SplineWarpXform {
    dims: Dims,
    spacing: [f64; 3],
    domain: [f64; 3],
    initial: AffineXform,
    control: Vec<Vector3<f64>>,
}

impl SplineWarpXform {
    /// 在 `[0, domain]` 上创建控制点间距约为 `spacing` 的形变场.
    ///
    /// 实际间距会略微缩小, 使控制网格恰好覆盖定义域; 每轴控制点数为区间数加 3.
    pub fn new(domain: [f64; 3], spacing: [f64; 3], initial: AffineXform) -> RegResult<Self> {
        let mut dims = [0; 3];
        let mut exact = [0.0; 3];
        for a in 0..3 {
            if !(spacing[a] > 0.0) || !(domain[a] >= 0.0) {
                return Err(RegError::invalid("spline domain and spacing must be positive"));
            }
            let cells = ((domain[a] / spacing[a]).ceil() as usize).max(1);
            dims[a] = cells + 3;
            exact[a] = if domain[a] > 0.0 {
                domain[a] / cells as f64
            } else {
                spacing[a]
            };
        }
        let mut warp = Self {
            dims,
            spacing: exact,
            domain,
            initial,
            control: Vec::with_capacity(dims.iter().product()),
        };
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let p = warp.control_point_grid_position(i, j, k);
                    let q = warp.initial.apply(&p);
                    warp.control.push(q);
                }
            }
        }
        Ok(warp)
    }

    /// 控制点个数 (各轴).
    #[inline]
    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// 控制点间距.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 定义域上界.
    #[inline]
    pub fn domain(&self) -> [f64; 3] {
        self.domain
    }

    /// 初始仿射变换.
    #[inline]
    pub fn initial_affine(&self) -> &AffineXform {
        &self.initial
    }

    #[inline]
    fn control_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.dims[0] * (j + self.dims[1] * k)
    }

    /// 控制点 `(i, j, k)` 在定义域中的未形变位置. 控制点 1 位于原点.
    #[inline]
    pub fn control_point_grid_position(&self, i: usize, j: usize, k: usize) -> Vector3<f64> {
        Vector3::new(
            (i as f64 - 1.0) * self.spacing[0],
            (j as f64 - 1.0) * self.spacing[1],
            (k as f64 - 1.0) * self.spacing[2],
        )
    }

    /// 控制点当前目标位置.
    #[inline]
    pub fn control_point(&self, i: usize, j: usize, k: usize) -> Vector3<f64> {
        self.control[self.control_index(i, j, k)]
    }

    /// 设置控制点相对于初始仿射位置的位移.
    pub fn set_displacement(&mut self, i: usize, j: usize, k: usize, d: Vector3<f64>) {
        let p = self.control_point_grid_position(i, j, k);
        let idx = self.control_index(i, j, k);
        self.control[idx] = self.initial.apply(&p) + d;
    }

    /// 点是否位于定义域内.
    #[inline]
    pub fn in_domain(&self, v: &Vector3<f64>) -> bool {
        (0..3).all(|a| v[a] >= 0.0 && v[a] <= self.domain[a])
    }

    /// 控制网格单元下标与单元内小数坐标. 调用者保证 `v` 在定义域内.
    #[inline]
    fn cell(&self, v: &Vector3<f64>) -> ([usize; 3], [f64; 3]) {
        let mut idx = [0; 3];
        let mut frac = [0.0; 3];
        for a in 0..3 {
            let t = v[a] / self.spacing[a];
            let i = (t.floor().max(0.0) as usize).min(self.dims[a] - 4);
            idx[a] = i;
            frac[a] = t - i as f64;
        }
        (idx, frac)
    }

    /// 不检查定义域的求值.
    fn eval(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let (idx, frac) = self.cell(v);
        let [bx, by, bz] = [basis(frac[0]), basis(frac[1]), basis(frac[2])];
        let mut out = Vector3::zeros();
        for (n, wz) in bz.iter().enumerate() {
            for (m, wy) in by.iter().enumerate() {
                let wyz = wy * wz;
                for (l, wx) in bx.iter().enumerate() {
                    out += self.control_point(idx[0] + l, idx[1] + m, idx[2] + n) * (wx * wyz);
                }
            }
        }
        out
    }

    /// 变换一个点. 定义域外返回 `OutOfDomain`.
    pub fn apply(&self, v: &Vector3<f64>) -> RegResult<Vector3<f64>> {
        if !self.in_domain(v) {
            return Err(RegError::OutOfDomain(v[0], v[1], v[2]));
        }
        Ok(self.eval(v))
    }

    /// 雅可比矩阵 `J[r][c] = ∂out_r / ∂v_c`, 解析求得.
    pub fn jacobian(&self, v: &Vector3<f64>) -> Matrix3<f64> {
        let (idx, frac) = self.cell(v);
        let b = [basis(frac[0]), basis(frac[1]), basis(frac[2])];
        let d = [
            basis_derivative(frac[0]),
            basis_derivative(frac[1]),
            basis_derivative(frac[2]),
        ];
        let mut j = Matrix3::zeros();
        for n in 0..4 {
            for m in 0..4 {
                for l in 0..4 {
                    let p = self.control_point(idx[0] + l, idx[1] + m, idx[2] + n);
                    let g = Vector3::new(
                        d[0][l] * b[1][m] * b[2][n] / self.spacing[0],
                        b[0][l] * d[1][m] * b[2][n] / self.spacing[1],
                        b[0][l] * b[1][m] * d[2][n] / self.spacing[2],
                    );
                    j += p * g.transpose();
                }
            }
        }
        j
    }

    /// 雅可比行列式.
    #[inline]
    pub fn jacobian_determinant(&self, v: &Vector3<f64>) -> f64 {
        self.jacobian(v).determinant()
    }

    /// 求 `u` 使 `apply(u) == v`, 残差低于 `epsilon` 时成功.
    ///
    /// 从初始仿射的逆出发做带阻尼的牛顿迭代, 迭代点始终钳制在定义域内.
    /// 解落在定义域外时返回 `OutOfDomain`, 否则未收敛时返回 `InverseNotConverged`.
    pub fn apply_inverse(&self, v: &Vector3<f64>, epsilon: f64) -> RegResult<Vector3<f64>> {
        let mut u = match self.initial.inverse() {
            Ok(inv) => inv.apply(v),
            Err(_) => *v,
        };
        self.clamp(&mut u);
        let mut residual = self.eval(&u) - v;
        let mut clamped = false;
        for _ in 0..INVERSE_MAX_ITERATIONS {
            if residual.norm() < epsilon {
                return Ok(u);
            }
            let Some(j_inv) = self.jacobian(&u).try_inverse() else {
                break;
            };
            let step = j_inv * residual;
            let mut scale = 1.0;
            let mut improved = false;
            for _ in 0..8 {
                let mut next = u - step * scale;
                clamped = self.clamp(&mut next);
                let r = self.eval(&next) - v;
                if r.norm() < residual.norm() {
                    u = next;
                    residual = r;
                    improved = true;
                    break;
                }
                scale *= 0.5;
            }
            if !improved {
                break;
            }
        }
        if residual.norm() < epsilon {
            Ok(u)
        } else if clamped {
            Err(RegError::OutOfDomain(v[0], v[1], v[2]))
        } else {
            Err(RegError::InverseNotConverged {
                residual: residual.norm(),
            })
        }
    }

    /// 把点钳制到定义域内, 返回是否发生了钳制.
    fn clamp(&self, u: &mut Vector3<f64>) -> bool {
        let mut clamped = false;
        for a in 0..3 {
            let c = u[a].clamp(0.0, self.domain[a]);
            if c != u[a] {
                u[a] = c;
                clamped = true;
            }
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warp() -> SplineWarpXform {
        let initial = AffineXform::from_translation(Vector3::new(1.0, -2.0, 0.5));
        let mut w = SplineWarpXform::new([10.0, 10.0, 10.0], [4.0, 4.0, 4.0], initial).unwrap();
        w.set_displacement(2, 2, 2, Vector3::new(0.4, -0.3, 0.2));
        w.set_displacement(3, 2, 1, Vector3::new(-0.2, 0.1, 0.3));
        w
    }

    #[test]
    fn test_affine_reproduction() {
        let initial = AffineXform::from_scale(Vector3::new(1.5, 1.0, 0.5));
        let w = SplineWarpXform::new([8.0, 8.0, 8.0], [3.0, 3.0, 3.0], initial.clone()).unwrap();
        assert_eq!(w.dims(), [6, 6, 6]);
        let p = Vector3::new(2.3, 7.9, 0.1);
        assert!((w.apply(&p).unwrap() - initial.apply(&p)).norm() < 1e-9);
        assert!((w.jacobian_determinant(&p) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_domain() {
        let w = warp();
        assert!(w.in_domain(&Vector3::new(0.0, 10.0, 5.0)));
        assert!(matches!(
            w.apply(&Vector3::new(-0.1, 1.0, 1.0)),
            Err(RegError::OutOfDomain(..))
        ));
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let w = warp();
        let p = Vector3::new(4.2, 5.1, 3.3);
        let j = w.jacobian(&p);
        let h = 1e-6;
        for c in 0..3 {
            let mut dp = Vector3::zeros();
            dp[c] = h;
            let fd = (w.eval(&(p + dp)) - w.eval(&(p - dp))) / (2.0 * h);
            for r in 0..3 {
                assert!((fd[r] - j[(r, c)]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_inverse() {
        let w = warp();
        let u = Vector3::new(4.0, 6.0, 3.0);
        let v = w.apply(&u).unwrap();
        let back = w.apply_inverse(&v, 1e-8).unwrap();
        assert!((back - u).norm() < 1e-6);

        // 像落在定义域之外.
        let r = w.apply_inverse(&Vector3::new(-50.0, 0.0, 0.0), 1e-8);
        assert!(matches!(r, Err(RegError::OutOfDomain(..))));
    }
}
