//! 三维仿射变换.

use nalgebra::{Matrix3, Matrix4, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::SINGULAR_DETERMINANT;
use crate::{RegError, RegResult};

/// 三维仿射变换, 以 4×4 齐次矩阵 (列向量约定, 第 3 列为平移) 表示.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AffineXform {
    matrix: Matrix4<f64>,
}

impl Default for AffineXform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineXform {
    /// 恒等变换.
    #[inline]
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// 由齐次矩阵创建. 最后一行应为 `(0, 0, 0, 1)`.
    pub fn from_matrix(matrix: Matrix4<f64>) -> RegResult<Self> {
        let last = matrix.row(3);
        if last[0] != 0.0 || last[1] != 0.0 || last[2] != 0.0 || last[3] != 1.0 {
            return Err(RegError::invalid("affine matrix must have last row (0, 0, 0, 1)"));
        }
        Ok(Self { matrix })
    }

    /// 平移.
    pub fn from_translation(t: Vector3<f64>) -> Self {
        Self {
            matrix: Matrix4::new_translation(&t),
        }
    }

    /// 关于原点的各轴缩放.
    pub fn from_scale(s: Vector3<f64>) -> Self {
        Self {
            matrix: Matrix4::new_nonuniform_scaling(&s),
        }
    }

    /// 由线性部分和平移创建.
    pub fn from_linear(linear: Matrix3<f64>, t: Vector3<f64>) -> Self {
        let mut matrix = linear.to_homogeneous();
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        Self { matrix }
    }

    /// 齐次矩阵.
    #[inline]
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// 线性部分.
    #[inline]
    pub fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// 平移部分.
    #[inline]
    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// 变换一个点.
    #[inline]
    pub fn apply(&self, v: &Vector3<f64>) -> Vector3<f64> {
        (self.matrix * v.push(1.0)).xyz()
    }

    /// 显式求逆. 行列式 (数值上) 为零时返回 `SingularMatrix`.
    pub fn inverse(&self) -> RegResult<Self> {
        let det = self.jacobian_determinant();
        if det.abs() < SINGULAR_DETERMINANT {
            return Err(RegError::SingularMatrix(det));
        }
        self.matrix
            .try_inverse()
            .map(|matrix| Self { matrix })
            .ok_or(RegError::SingularMatrix(det))
    }

    /// 雅可比行列式, 即线性部分的行列式. 仿射变换处处相同.
    #[inline]
    pub fn jacobian_determinant(&self) -> f64 {
        self.linear().determinant()
    }

    /// 全局缩放因子 (体积比).
    #[inline]
    pub fn global_scale(&self) -> f64 {
        self.jacobian_determinant().abs()
    }

    /// 复合: 先应用 `self`, 再应用 `next`.
    pub fn then(&self, next: &AffineXform) -> Self {
        Self {
            matrix: next.matrix * self.matrix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        (a - b).norm() < 1e-9
    }

    fn sample() -> AffineXform {
        let linear = Matrix3::new(1.2, 0.1, 0.0, -0.2, 0.9, 0.3, 0.05, 0.0, 1.1);
        AffineXform::from_linear(linear, Vector3::new(3.0, -1.0, 0.5))
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = sample();
        let inv = t.inverse().unwrap();
        for p in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, -3.0, 7.5),
            Vector3::new(-2.5, 100.0, 0.25),
        ] {
            assert!(close(&t.apply(&inv.apply(&p)), &p));
            assert!(close(&inv.apply(&t.apply(&p)), &p));
        }
    }

    #[test]
    fn test_singular() {
        let t = AffineXform::from_scale(Vector3::new(1.0, 0.0, 2.0));
        assert!(matches!(t.inverse(), Err(RegError::SingularMatrix(_))));
    }

    #[test]
    fn test_compose_order() {
        let t1 = AffineXform::from_translation(Vector3::new(1.0, 0.0, 0.0));
        let t2 = AffineXform::from_scale(Vector3::new(2.0, 2.0, 2.0));
        let o = Vector3::zeros();
        assert!(close(&t1.then(&t2).apply(&o), &Vector3::new(2.0, 0.0, 0.0)));
        assert!(close(&t2.then(&t1).apply(&o), &Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(t2.global_scale(), 8.0);
    }

    #[test]
    fn test_from_matrix_checks_last_row() {
        let mut m = Matrix4::identity();
        assert!(AffineXform::from_matrix(m).is_ok());
        m[(3, 0)] = 1.0;
        assert!(AffineXform::from_matrix(m).is_err());
    }
}
