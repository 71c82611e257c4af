//! 坐标变换: 仿射, B 样条形变, 以及按顺序复合的变换链.

pub mod affine;
#[cfg(feature = "serde")]
pub mod io;
pub mod list;
pub mod spline;

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use affine::AffineXform;
#[cfg(feature = "serde")]
pub use io::{BincodeXformIO, XformIO, XformRecord};
pub use list::{XformList, XformListEntry};
pub use spline::SplineWarpXform;

use crate::RegResult;

/// 变换的和类型.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Xform {
    /// 仿射变换.
    Affine(AffineXform),

    /// 形变场.
    Spline(SplineWarpXform),
}

impl From<AffineXform> for Xform {
    fn from(x: AffineXform) -> Self {
        Self::Affine(x)
    }
}

impl From<SplineWarpXform> for Xform {
    fn from(x: SplineWarpXform) -> Self {
        Self::Spline(x)
    }
}

impl Xform {
    /// 变换一个点. 形变场在定义域外返回 `OutOfDomain`.
    #[inline]
    pub fn apply(&self, v: &Vector3<f64>) -> RegResult<Vector3<f64>> {
        match self {
            Xform::Affine(a) => Ok(a.apply(v)),
            Xform::Spline(s) => s.apply(v),
        }
    }

    /// 逆变换. 仿射变换精确求逆, 形变场在 `epsilon` 容差内迭代求逆.
    pub fn try_apply_inverse(&self, v: &Vector3<f64>, epsilon: f64) -> RegResult<Vector3<f64>> {
        match self {
            Xform::Affine(a) => Ok(a.inverse()?.apply(v)),
            Xform::Spline(s) => s.apply_inverse(v, epsilon),
        }
    }

    /// 点 `v` 处的雅可比行列式.
    #[inline]
    pub fn jacobian_determinant(&self, v: &Vector3<f64>) -> f64 {
        match self {
            Xform::Affine(a) => a.jacobian_determinant(),
            Xform::Spline(s) => s.jacobian_determinant(v),
        }
    }

    /// 点是否在定义域内. 仿射变换处处有定义.
    #[inline]
    pub fn in_domain(&self, v: &Vector3<f64>) -> bool {
        match self {
            Xform::Affine(_) => true,
            Xform::Spline(s) => s.in_domain(v),
        }
    }

    /// 全局缩放因子. 形变场取其初始仿射的缩放.
    #[inline]
    pub fn global_scale(&self) -> f64 {
        match self {
            Xform::Affine(a) => a.global_scale(),
            Xform::Spline(s) => s.initial_affine().global_scale(),
        }
    }

    /// 仿射部分: 仿射变换本身, 或形变场的初始仿射.
    #[inline]
    pub fn affine_part(&self) -> &AffineXform {
        match self {
            Xform::Affine(a) => a,
            Xform::Spline(s) => s.initial_affine(),
        }
    }

    /// 是否为形变场?
    #[inline]
    pub fn is_warp(&self) -> bool {
        matches!(self, Xform::Spline(_))
    }
}
