//! 一维平方距离变换的 Voronoi 下包络求解.
//!
//! 输入为沿一条线的 "到目前为止" 的平方距离, 未到达特征的位置为 [`EDT_MAX_DISTANCE_SQUARED`].
//! 站点按下标顺序入栈, 包络保持单调, 查询指针只前进不回退, 因此整体线性时间.

use crate::consts::EDT_MAX_DISTANCE_SQUARED;

/// 每个工作线程私有的包络暂存区.
#[derive(Debug, Default, Clone)]
pub(crate) struct Envelope {
    g: Vec<f64>,
    h: Vec<f64>,
}

impl Envelope {
    /// 就地求解 `f` 的一维平方距离变换, 样本间距为 `delta`.
    ///
    /// 没有任何有限站点时返回 `false`, 此时 `f` 保持不变.
    pub(crate) fn solve(&mut self, f: &mut [f64], delta: f64) -> bool {
        self.g.clear();
        self.h.clear();

        // 构造部分 Voronoi 图.
        for (i, &fi) in f.iter().enumerate() {
            if fi == EDT_MAX_DISTANCE_SQUARED {
                continue;
            }
            let hi = i as f64 * delta;
            while self.g.len() >= 2 {
                let l = self.g.len() - 1;
                let v = self.h[l];
                let a = v - self.h[l - 1];
                let b = hi - v;
                let c = a + b;
                if c * self.g[l] - b * self.g[l - 1] - a * fi - a * b * c > 0.0 {
                    self.g.pop();
                    self.h.pop();
                } else {
                    break;
                }
            }
            self.g.push(fi);
            self.h.push(hi);
        }

        let sites = self.g.len();
        if sites == 0 {
            return false;
        }

        // 查询.
        let mut l = 0;
        for (i, out) in f.iter_mut().enumerate() {
            let xi = i as f64 * delta;
            let a = self.h[l] - xi;
            let mut lhs = self.g[l] + a * a;
            while l + 1 < sites {
                let a = self.h[l + 1] - xi;
                let rhs = self.g[l + 1] + a * a;
                if lhs > rhs {
                    l += 1;
                    lhs = rhs;
                } else {
                    break;
                }
            }
            *out = lhs;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(f: &[f64], delta: f64) -> Vec<f64> {
        (0..f.len())
            .map(|i| {
                f.iter()
                    .enumerate()
                    .filter(|(_, v)| **v != EDT_MAX_DISTANCE_SQUARED)
                    .map(|(j, &v)| {
                        let d = (i as f64 - j as f64) * delta;
                        v + d * d
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    }

    #[test]
    fn test_no_sites() {
        let mut env = Envelope::default();
        let mut f = vec![EDT_MAX_DISTANCE_SQUARED; 4];
        assert!(!env.solve(&mut f, 1.0));
        assert!(f.iter().all(|&v| v == EDT_MAX_DISTANCE_SQUARED));
    }

    #[test]
    fn test_matches_brute_force() {
        let m = EDT_MAX_DISTANCE_SQUARED;
        let cases: Vec<Vec<f64>> = vec![
            vec![m, m, 0.0, m, m, m],
            vec![4.0, m, 1.0, m, 9.0, 0.0, m],
            vec![0.0, 0.0, 0.0],
            vec![m, 2.25, m, m, m, m, m, m, 0.25],
        ];
        let mut env = Envelope::default();
        for delta in [1.0, 0.7, 2.5] {
            for case in &cases {
                let expect = brute_force(case, delta);
                let mut f = case.clone();
                assert!(env.solve(&mut f, delta));
                for (a, b) in f.iter().zip(&expect) {
                    assert!((a - b).abs() < 1e-9, "{f:?} vs {expect:?}");
                }
            }
        }
    }
}
