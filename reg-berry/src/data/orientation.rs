//! 解剖方向代码与轴置换.
//!
//! 方向代码由三个字母组成, 第 `i` 个字母表示第 `i` 个网格轴索引增大的解剖方向.
//! 例如 `"RAS"`: x 向右, y 向前, z 向上.

use nalgebra::Matrix4;

use crate::{Dims, RegError, RegResult};

/// 解析单个方向字母, 得到 (解剖轴编号, 是否为正方向).
///
/// 解剖轴编号: 0 = 左右, 1 = 前后, 2 = 上下.
#[inline]
fn parse_letter(c: char) -> Option<(usize, bool)> {
    match c.to_ascii_uppercase() {
        'R' => Some((0, true)),
        'L' => Some((0, false)),
        'A' => Some((1, true)),
        'P' => Some((1, false)),
        'S' => Some((2, true)),
        'I' => Some((2, false)),
        _ => None,
    }
}

/// 解析方向代码. 每个解剖轴必须恰好出现一次.
pub fn parse_orientation(code: &str) -> RegResult<[(usize, bool); 3]> {
    let letters: Vec<char> = code.chars().collect();
    if letters.len() != 3 {
        return Err(RegError::invalid(format!(
            "orientation code `{code}` must have 3 letters"
        )));
    }
    let mut out = [(0, true); 3];
    let mut seen = [false; 3];
    for (i, &c) in letters.iter().enumerate() {
        let (axis, positive) = parse_letter(c)
            .ok_or_else(|| RegError::invalid(format!("bad orientation letter `{c}` in `{code}`")))?;
        if seen[axis] {
            return Err(RegError::invalid(format!(
                "orientation code `{code}` repeats an anatomical axis"
            )));
        }
        seen[axis] = true;
        out[i] = (axis, positive);
    }
    Ok(out)
}

/// 方向代码是否合法?
#[inline]
pub fn is_valid_orientation(code: &str) -> bool {
    parse_orientation(code).is_ok()
}

/// 两个方向代码之间的轴置换 (带翻转).
///
/// 新网格的第 `j` 轴取自旧网格的第 `source_axis[j]` 轴, `flip[j]` 为真时方向相反.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PermutationMatrix {
    source_axis: [usize; 3],
    flip: [bool; 3],
    source_dims: Dims,
}

impl PermutationMatrix {
    /// 由旧网格维度, 旧方向代码和新方向代码构造.
    pub fn new(source_dims: Dims, from: &str, to: &str) -> RegResult<Self> {
        let from = parse_orientation(from)?;
        let to = parse_orientation(to)?;
        let mut source_axis = [0; 3];
        let mut flip = [false; 3];
        for (j, &(anat, positive)) in to.iter().enumerate() {
            // 上面已确保 `from` 覆盖每个解剖轴.
            let i = from.iter().position(|&(a, _)| a == anat).unwrap_or(j);
            source_axis[j] = i;
            flip[j] = from[i].1 != positive;
        }
        Ok(Self {
            source_axis,
            flip,
            source_dims,
        })
    }

    /// 是否为恒等置换?
    pub fn is_identity(&self) -> bool {
        self.source_axis == [0, 1, 2] && self.flip == [false; 3]
    }

    /// 新网格第 `j` 轴对应的旧网格轴.
    #[inline]
    pub fn source_axis(&self, j: usize) -> usize {
        self.source_axis[j]
    }

    /// 新网格第 `j` 轴是否翻转?
    #[inline]
    pub fn is_flipped(&self, j: usize) -> bool {
        self.flip[j]
    }

    /// 新网格维度.
    pub fn target_dims(&self) -> Dims {
        self.permute(self.source_dims)
    }

    /// 按置换重排任意逐轴量 (维度, 间距, 尺寸).
    pub fn permute<T: Copy>(&self, v: [T; 3]) -> [T; 3] {
        [
            v[self.source_axis[0]],
            v[self.source_axis[1]],
            v[self.source_axis[2]],
        ]
    }

    /// 新网格索引对应的旧网格索引.
    #[inline]
    pub fn source_index(&self, target: [usize; 3]) -> [usize; 3] {
        let mut src = [0; 3];
        for j in 0..3 {
            let a = self.source_axis[j];
            src[a] = if self.flip[j] {
                self.source_dims[a] - 1 - target[j]
            } else {
                target[j]
            };
        }
        src
    }

    /// 变换索引到物理坐标矩阵 (列向量约定), 使新网格上的索引映射到与旧网格相同的物理点.
    pub fn permute_matrix(&self, m: &Matrix4<f64>) -> Matrix4<f64> {
        let mut out = *m;
        let mut translation = m.fixed_view::<3, 1>(0, 3).into_owned();
        for j in 0..3 {
            let a = self.source_axis[j];
            let col = m.fixed_view::<3, 1>(0, a).into_owned();
            if self.flip[j] {
                translation += col * (self.source_dims[a] as f64 - 1.0);
                out.fixed_view_mut::<3, 1>(0, j).copy_from(&(-col));
            } else {
                out.fixed_view_mut::<3, 1>(0, j).copy_from(&col);
            }
        }
        out.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector4;

    #[test]
    fn test_parse() {
        assert!(is_valid_orientation("RAS"));
        assert!(is_valid_orientation("lps"));
        assert!(!is_valid_orientation("RA"));
        assert!(!is_valid_orientation("RRS"));
        assert!(!is_valid_orientation("RAX"));
    }

    #[test]
    fn test_identity() {
        let p = PermutationMatrix::new([2, 3, 4], "RAS", "RAS").unwrap();
        assert!(p.is_identity());
        assert_eq!(p.source_index([1, 2, 3]), [1, 2, 3]);
    }

    #[test]
    fn test_flip_and_swap() {
        // LPS -> RAS: x, y 翻转.
        let p = PermutationMatrix::new([2, 3, 4], "LPS", "RAS").unwrap();
        assert_eq!(p.target_dims(), [2, 3, 4]);
        assert_eq!(p.source_index([0, 0, 0]), [1, 2, 0]);

        // RAS -> ASR: 新 x 为旧 y.
        let p = PermutationMatrix::new([2, 3, 4], "RAS", "ASR").unwrap();
        assert_eq!(p.target_dims(), [3, 4, 2]);
        assert_eq!(p.source_index([2, 1, 0]), [0, 2, 1]);
    }

    #[test]
    fn test_matrix_maps_same_point() {
        let p = PermutationMatrix::new([3, 4, 5], "LPI", "ASR").unwrap();
        let m = Matrix4::new(
            2.0, 0.0, 0.0, 10.0, //
            0.0, 3.0, 0.0, 20.0, //
            0.0, 0.0, 4.0, 30.0, //
            0.0, 0.0, 0.0, 1.0,
        );
        let pm = p.permute_matrix(&m);
        let t = [1usize, 2, 0];
        let s = p.source_index(t);
        let a = pm * Vector4::new(t[0] as f64, t[1] as f64, t[2] as f64, 1.0);
        let b = m * Vector4::new(s[0] as f64, s[1] as f64, s[2] as f64, 1.0);
        assert!((a - b).norm() < 1e-12);
    }
}
