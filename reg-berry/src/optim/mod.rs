//! 无约束数值优化.

pub mod lbfgs;

pub use lbfgs::{Lbfgs, LbfgsReport, LbfgsStatus};

/// 可微目标函数.
pub trait Objective {
    /// 在 `x` 处求函数值, 并把梯度写入 `g` (与 `x` 等长).
    fn evaluate(&mut self, x: &[f64], g: &mut [f64]) -> f64;
}
