//! 有序变换链.
//!
//! 链中每个条目可以标记为 "逆向": 逆向的仿射条目使用构造时预先求得的逆矩阵,
//! 逆向的形变场条目使用迭代近似逆. 任何一个条目失败都会使整条链失败.

use nalgebra::Vector3;

use super::affine::AffineXform;
use super::Xform;
use crate::consts::DEFAULT_INVERSE_EPSILON;
use crate::{RegError, RegResult};

/// 变换链中的一个条目.
#[derive(Clone, Debug)]
pub struct XformListEntry {
    xform: Xform,
    inverse: bool,
    global_scale: f64,
    inverse_affine: Option<AffineXform>,
}

impl XformListEntry {
    /// 创建条目. 仿射条目会预先求逆; 矩阵奇异时记录警告, 以逆向方式使用该条目将失败.
    pub fn new(xform: Xform, inverse: bool, global_scale: f64) -> Self {
        let inverse_affine = match &xform {
            Xform::Affine(a) => match a.inverse() {
                Ok(inv) => Some(inv),
                Err(e) => {
                    tracing::warn!("transform list entry has no inverse: {e}");
                    None
                }
            },
            Xform::Spline(_) => None,
        };
        Self {
            xform,
            inverse,
            global_scale,
            inverse_affine,
        }
    }

    /// 变换.
    #[inline]
    pub fn xform(&self) -> &Xform {
        &self.xform
    }

    /// 是否逆向使用?
    #[inline]
    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    /// 全局缩放因子.
    #[inline]
    pub fn global_scale(&self) -> f64 {
        self.global_scale
    }

    /// 预先求得的仿射逆.
    #[inline]
    pub fn inverse_affine(&self) -> Option<&AffineXform> {
        self.inverse_affine.as_ref()
    }

    /// 只保留仿射部分的副本. 形变场条目使用其初始仿射.
    pub fn copy_as_affine(&self) -> Self {
        Self::new(
            Xform::Affine(self.xform.affine_part().clone()),
            self.inverse,
            self.global_scale,
        )
    }
}

/// 有序变换链. 点依次经过每个条目.
#[derive(Clone, Debug)]
pub struct XformList {
    entries: Vec<XformListEntry>,
    epsilon: f64,
}

impl Default for XformList {
    fn default() -> Self {
        Self::new()
    }
}

impl XformList {
    /// 空链.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            epsilon: DEFAULT_INVERSE_EPSILON,
        }
    }

    /// 在链尾追加.
    pub fn add(&mut self, xform: impl Into<Xform>, inverse: bool, global_scale: f64) {
        self.entries
            .push(XformListEntry::new(xform.into(), inverse, global_scale));
    }

    /// 在链首插入.
    pub fn add_to_front(&mut self, xform: impl Into<Xform>, inverse: bool, global_scale: f64) {
        self.entries
            .insert(0, XformListEntry::new(xform.into(), inverse, global_scale));
    }

    /// 设置形变场近似求逆的容差.
    #[inline]
    pub fn set_epsilon(&mut self, epsilon: f64) {
        self.epsilon = epsilon;
    }

    /// 近似求逆容差.
    #[inline]
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// 条目数.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 条目迭代器.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &XformListEntry> + '_ {
        self.entries.iter()
    }

    /// 沿逆向条目变换一步.
    fn apply_inverse_entry(&self, n: usize, entry: &XformListEntry, v: &Vector3<f64>) -> RegResult<Vector3<f64>> {
        match &entry.xform {
            Xform::Spline(s) => s.apply_inverse(v, self.epsilon),
            Xform::Affine(_) => entry
                .inverse_affine
                .as_ref()
                .map(|inv| inv.apply(v))
                .ok_or(RegError::NoInverse(n)),
        }
    }

    /// 依次应用整条链. 遇到第一个失败立即返回.
    pub fn apply(&self, v: &Vector3<f64>) -> RegResult<Vector3<f64>> {
        let mut v = *v;
        for (n, entry) in self.entries.iter().enumerate() {
            v = if entry.inverse {
                self.apply_inverse_entry(n, entry, &v)?
            } else {
                entry.xform.apply(&v)?
            };
        }
        Ok(v)
    }

    /// 沿链累积雅可比行列式.
    ///
    /// 正向条目乘以当前点处的行列式, 逆向条目除以逆像点处的行列式.
    /// `correct_global_scale` 为真时分别除以/乘以条目的全局缩放因子.
    /// 乘积按链的顺序累积.
    pub fn get_jacobian(&self, v: &Vector3<f64>, correct_global_scale: bool) -> RegResult<f64> {
        let mut vv = *v;
        let mut jacobian = 1.0;
        for (n, entry) in self.entries.iter().enumerate() {
            if entry.inverse {
                if correct_global_scale {
                    jacobian *= entry.global_scale;
                }
                vv = self.apply_inverse_entry(n, entry, &vv)?;
                jacobian /= entry.xform.jacobian_determinant(&vv);
            } else {
                if !entry.xform.in_domain(&vv) {
                    return Err(RegError::OutOfDomain(vv[0], vv[1], vv[2]));
                }
                jacobian *= entry.xform.jacobian_determinant(&vv);
                if correct_global_scale {
                    jacobian /= entry.global_scale;
                }
                vv = entry.xform.apply(&vv)?;
            }
        }
        Ok(jacobian)
    }

    /// 所有条目只保留仿射部分的新链.
    pub fn make_all_affine(&self) -> XformList {
        XformList {
            entries: self.entries.iter().map(XformListEntry::copy_as_affine).collect(),
            epsilon: self.epsilon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::SplineWarpXform;

    fn translate_x() -> AffineXform {
        AffineXform::from_translation(Vector3::new(1.0, 0.0, 0.0))
    }

    fn scale2() -> AffineXform {
        AffineXform::from_scale(Vector3::new(2.0, 2.0, 2.0))
    }

    #[test]
    fn test_order_matters() {
        let o = Vector3::zeros();
        let mut a = XformList::new();
        a.add(translate_x(), false, 1.0);
        a.add(scale2(), false, 1.0);
        assert_eq!(a.apply(&o).unwrap(), Vector3::new(2.0, 0.0, 0.0));

        let mut b = XformList::new();
        b.add(scale2(), false, 1.0);
        b.add(translate_x(), false, 1.0);
        assert_eq!(b.apply(&o).unwrap(), Vector3::new(1.0, 0.0, 0.0));

        let mut c = XformList::new();
        c.add(translate_x(), false, 1.0);
        c.add_to_front(scale2(), false, 1.0);
        assert_eq!(c.apply(&o).unwrap(), Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_inverse_entries() {
        let mut l = XformList::new();
        l.add(scale2(), false, 1.0);
        l.add(scale2(), true, 1.0);
        let p = Vector3::new(1.0, -3.0, 2.5);
        assert!((l.apply(&p).unwrap() - p).norm() < 1e-12);
        assert!((l.get_jacobian(&p, false).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_inverse_fails() {
        let mut l = XformList::new();
        l.add(AffineXform::from_scale(Vector3::new(0.0, 1.0, 1.0)), true, 1.0);
        assert!(matches!(l.apply(&Vector3::zeros()), Err(RegError::NoInverse(0))));
    }

    #[test]
    fn test_jacobian_global_scale() {
        let mut l = XformList::new();
        l.add(scale2(), false, 8.0);
        let p = Vector3::new(0.5, 0.5, 0.5);
        assert_eq!(l.get_jacobian(&p, false).unwrap(), 8.0);
        assert_eq!(l.get_jacobian(&p, true).unwrap(), 1.0);
    }

    #[test]
    fn test_warp_domain_fails_fast() {
        let w = SplineWarpXform::new([4.0; 3], [2.0; 3], AffineXform::identity()).unwrap();
        let mut l = XformList::new();
        l.add(translate_x(), false, 1.0);
        l.add(w, false, 1.0);
        assert!(l.apply(&Vector3::new(1.0, 1.0, 1.0)).is_ok());
        assert!(matches!(
            l.apply(&Vector3::new(3.5, 1.0, 1.0)),
            Err(RegError::OutOfDomain(..))
        ));
        assert!(l.get_jacobian(&Vector3::new(3.5, 1.0, 1.0), false).is_err());

        let affine = l.make_all_affine();
        assert!(affine.apply(&Vector3::new(3.5, 1.0, 1.0)).is_ok());
    }
}
