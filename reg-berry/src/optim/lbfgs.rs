//! 有限内存 BFGS 无约束最小化.
//!
//! 两循环递推求搜索方向, 回溯 Armijo 线搜索. 梯度范数, 函数值相对变化与步长范数三个收敛
//! 判据相互独立, 任一满足即停止.

use std::collections::VecDeque;

use super::Objective;

/// Armijo 充分下降系数.
const ARMIJO_C1: f64 = 1e-4;

/// 线搜索最多回溯次数.
const MAX_BACKTRACKS: usize = 40;

/// 曲率条件 `y·s` 的下限. 低于此值的修正对被丢弃.
const CURVATURE_EPS: f64 = 1e-10;

/// 终止原因. 负值表示失败, 仅作为信息返回.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LbfgsStatus {
    /// 线搜索未能找到下降点.
    LineSearchFailed = -2,

    /// 目标函数返回了非有限值.
    NotFinite = -1,

    /// 函数值相对变化低于容差.
    FunctionConverged = 1,

    /// 步长范数低于容差.
    StepConverged = 2,

    /// 梯度范数低于容差.
    GradientConverged = 4,

    /// 达到迭代上限.
    MaxIterations = 5,
}

impl LbfgsStatus {
    /// 数值码.
    #[inline]
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// 是否失败?
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.code() < 0
    }
}

/// 一次最小化的结果.
#[derive(Copy, Clone, Debug)]
pub struct LbfgsReport {
    /// 终止原因.
    pub status: LbfgsStatus,

    /// 完成的迭代次数.
    pub iterations: usize,

    /// 最终函数值.
    pub f: f64,
}

/// L-BFGS 参数.
#[derive(Copy, Clone, Debug)]
pub struct Lbfgs {
    /// 历史修正对个数.
    pub memory: usize,

    /// 最大迭代次数.
    pub max_iterations: usize,

    /// 梯度无穷范数容差.
    pub eps_g: f64,

    /// 函数值相对变化容差.
    pub eps_f: f64,

    /// 步长无穷范数容差.
    pub eps_x: f64,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 5,
            max_iterations: 100,
            eps_g: 1e-10,
            eps_f: 1e-10,
            eps_x: 1e-10,
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn max_abs(a: &[f64]) -> f64 {
    a.iter().fold(0.0, |m, v| m.max(v.abs()))
}

impl Lbfgs {
    /// 就地最小化 `x`. 返回时 `x` 为最后接受的迭代点.
    pub fn minimize<O: Objective + ?Sized>(&self, objective: &mut O, x: &mut [f64]) -> LbfgsReport {
        let n = x.len();
        let m = self.memory.max(1);
        let mut g = vec![0.0; n];
        let mut f = objective.evaluate(x, &mut g);
        if !f.is_finite() {
            return LbfgsReport {
                status: LbfgsStatus::NotFinite,
                iterations: 0,
                f,
            };
        }

        let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(m);
        let mut alpha = vec![0.0; m];
        let mut d = vec![0.0; n];
        let mut x_new = vec![0.0; n];
        let mut g_new = vec![0.0; n];

        for iter in 0..self.max_iterations {
            if max_abs(&g) <= self.eps_g {
                return LbfgsReport {
                    status: LbfgsStatus::GradientConverged,
                    iterations: iter,
                    f,
                };
            }

            // 两循环递推: d = -H g.
            d.iter_mut().zip(&g).for_each(|(di, gi)| *di = -gi);
            for (k, (s, y, rho)) in history.iter().enumerate().rev() {
                alpha[k] = rho * dot(s, &d);
                d.iter_mut().zip(y).for_each(|(di, yi)| *di -= alpha[k] * yi);
            }
            let gamma = match history.back() {
                Some((s, y, _)) => dot(s, y) / dot(y, y),
                None => 1.0 / max_abs(&g).max(1.0),
            };
            d.iter_mut().for_each(|di| *di *= gamma);
            for (k, (s, y, rho)) in history.iter().enumerate() {
                let beta = rho * dot(y, &d);
                d.iter_mut().zip(s).for_each(|(di, si)| *di += (alpha[k] - beta) * si);
            }

            let mut slope = dot(&g, &d);
            if slope >= 0.0 {
                // 非下降方向: 重置为最速下降.
                history.clear();
                d.iter_mut().zip(&g).for_each(|(di, gi)| *di = -gi);
                slope = dot(&g, &d);
            }

            // 回溯线搜索.
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                x_new
                    .iter_mut()
                    .zip(x.iter().zip(&d))
                    .for_each(|(xn, (xi, di))| *xn = xi + step * di);
                let f_new = objective.evaluate(&x_new, &mut g_new);
                if f_new.is_finite() && f_new <= f + ARMIJO_C1 * step * slope {
                    accepted = Some(f_new);
                    break;
                }
                step *= 0.5;
            }
            let Some(f_new) = accepted else {
                return LbfgsReport {
                    status: LbfgsStatus::LineSearchFailed,
                    iterations: iter,
                    f,
                };
            };

            let s: Vec<f64> = x_new.iter().zip(x.iter()).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            let ys = dot(&y, &s);
            if ys > CURVATURE_EPS {
                if history.len() == m {
                    history.pop_front();
                }
                history.push_back((s.clone(), y, 1.0 / ys));
            }

            let f_old = f;
            x.copy_from_slice(&x_new);
            g.copy_from_slice(&g_new);
            f = f_new;

            if (f_old - f).abs() <= self.eps_f * f_old.abs().max(f.abs()).max(1.0) {
                return LbfgsReport {
                    status: LbfgsStatus::FunctionConverged,
                    iterations: iter + 1,
                    f,
                };
            }
            if max_abs(&s) <= self.eps_x {
                return LbfgsReport {
                    status: LbfgsStatus::StepConverged,
                    iterations: iter + 1,
                    f,
                };
            }
        }

        LbfgsReport {
            status: LbfgsStatus::MaxIterations,
            iterations: self.max_iterations,
            f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rosenbrock;

    impl Objective for Rosenbrock {
        fn evaluate(&mut self, x: &[f64], g: &mut [f64]) -> f64 {
            let (a, b) = (x[0], x[1]);
            g[0] = -2.0 * (1.0 - a) - 400.0 * a * (b - a * a);
            g[1] = 200.0 * (b - a * a);
            (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2)
        }
    }

    struct Quadratic(Vec<f64>);

    impl Objective for Quadratic {
        fn evaluate(&mut self, x: &[f64], g: &mut [f64]) -> f64 {
            let mut f = 0.0;
            for (i, (xi, ci)) in x.iter().zip(&self.0).enumerate() {
                let w = (i + 1) as f64;
                g[i] = 2.0 * w * (xi - ci);
                f += w * (xi - ci).powi(2);
            }
            f
        }
    }

    #[test]
    fn test_quadratic() {
        let target = vec![1.0, -2.0, 3.0, 0.5];
        let mut x = vec![0.0; 4];
        let report = Lbfgs::default().minimize(&mut Quadratic(target.clone()), &mut x);
        assert!(!report.status.is_failure());
        for (a, b) in x.iter().zip(&target) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rosenbrock() {
        let mut x = vec![-1.2, 1.0];
        let lbfgs = Lbfgs {
            max_iterations: 500,
            ..Default::default()
        };
        let report = lbfgs.minimize(&mut Rosenbrock, &mut x);
        assert!(!report.status.is_failure(), "{report:?}");
        assert!((x[0] - 1.0).abs() < 1e-3 && (x[1] - 1.0).abs() < 1e-3, "{x:?}");
    }

    #[test]
    fn test_iteration_cap() {
        let mut x = vec![-1.2, 1.0];
        let lbfgs = Lbfgs {
            max_iterations: 2,
            ..Default::default()
        };
        let report = lbfgs.minimize(&mut Rosenbrock, &mut x);
        assert_eq!(report.status, LbfgsStatus::MaxIterations);
        assert_eq!(report.iterations, 2);
        assert!(report.f < 24.2);
    }

    #[test]
    fn test_not_finite() {
        struct Nan;
        impl Objective for Nan {
            fn evaluate(&mut self, _x: &[f64], _g: &mut [f64]) -> f64 {
                f64::NAN
            }
        }
        let report = Lbfgs::default().minimize(&mut Nan, &mut [0.0]);
        assert_eq!(report.status, LbfgsStatus::NotFinite);
    }
}
