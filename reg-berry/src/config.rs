//! 各算法入口的显式配置.
//!
//! 所有配置都有合理的默认值; 开启 `serde` feature 时可以从 JSON 等格式读入.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::AXIS_Y;
use crate::{RegError, RegResult};

/// 距离变换中判定特征体素的规则.
#[derive(PartialEq, Copy, Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureRule {
    /// 值恰等于 `value` 的体素是特征.
    Exact,

    /// 值不小于 `value` 的体素是特征.
    Threshold,

    /// 值落在 \[value - window, value + window\] 闭区间内的体素是特征.
    Window,

    /// 非零体素是特征.
    #[default]
    NonZero,
}

impl FeatureRule {
    /// 判断体素值 `v` 是否满足规则. 缺失值永远不是特征.
    #[inline]
    pub fn eval(&self, v: Option<f64>, value: f64, window: f64) -> bool {
        let Some(v) = v else {
            return false;
        };
        match *self {
            FeatureRule::Exact => v == value,
            FeatureRule::Threshold => v >= value,
            FeatureRule::Window => (v - value).abs() <= window,
            FeatureRule::NonZero => v != 0.0,
        }
    }
}

/// 距离变换配置.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DistanceMapConfig {
    /// 特征判定规则.
    pub rule: FeatureRule,

    /// 为 `true` 时计算特征区域内部到背景的距离 (即规则取反).
    pub inside: bool,

    /// 规则参数.
    pub value: f64,

    /// `Window` 规则的半宽.
    pub window: f64,

    /// 为 `true` 时输出平方距离, 省略最后的开方.
    pub squared: bool,
}

impl DistanceMapConfig {
    /// 判定体素是否属于特征 (已考虑 `inside`).
    #[inline]
    pub fn is_feature(&self, v: Option<f64>) -> bool {
        self.rule.eval(v, self.value, self.window) != self.inside
    }
}

/// EPI 去畸变配置.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UnwarpConfig {
    /// 相位编码轴.
    pub phase_encode_axis: usize,

    /// 是否以逐行质心差初始化形变场.
    pub init_shift_com: bool,

    /// 光滑项权重.
    pub smoothness_weight: f64,

    /// 防折叠项权重.
    pub folding_weight: f64,

    /// 每个平滑层级的最大迭代次数.
    pub iterations: usize,

    /// 初始 (最大) 平滑 sigma, 物理单位.
    pub smooth_sigma_max: f64,

    /// 最小平滑 sigma. sigma 降到此值以下后停止.
    pub smooth_sigma_min: f64,

    /// sigma 每层的递减量, 必须为正.
    pub smooth_sigma_diff: f64,

    /// L-BFGS 历史长度.
    pub lbfgs_memory: usize,

    /// L-BFGS 梯度范数容差.
    pub eps_g: f64,

    /// L-BFGS 函数值相对变化容差.
    pub eps_f: f64,

    /// L-BFGS 步长范数容差.
    pub eps_x: f64,
}

impl Default for UnwarpConfig {
    fn default() -> Self {
        Self {
            phase_encode_axis: AXIS_Y,
            init_shift_com: true,
            smoothness_weight: 0.0,
            folding_weight: 0.0,
            iterations: 10,
            smooth_sigma_max: 8.0,
            smooth_sigma_min: 0.0,
            smooth_sigma_diff: 0.25,
            lbfgs_memory: 5,
            eps_g: 1e-10,
            eps_f: 1e-10,
            eps_x: 1e-10,
        }
    }
}

impl UnwarpConfig {
    /// 检查参数合法性.
    pub fn validate(&self) -> RegResult<()> {
        if self.phase_encode_axis > 2 {
            return Err(RegError::invalid(format!(
                "phase-encode axis {} out of range",
                self.phase_encode_axis
            )));
        }
        if !(self.smooth_sigma_diff > 0.0) {
            return Err(RegError::invalid("smoothing sigma decrement must be positive"));
        }
        if self.lbfgs_memory == 0 {
            return Err(RegError::invalid("L-BFGS memory must be positive"));
        }
        Ok(())
    }
}

/// 体注入重建配置.
///
/// 各向同性模式的核参数以物理单位给出; 各向异性模式的核参数以重建网格间距为单位.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct InjectionConfig {
    /// 使用各向同性 (物理距离) 散射注入, 否则使用各向异性 (索引距离) 聚集注入.
    pub isotropic: bool,

    /// 各向同性核标准差, 物理单位.
    pub kernel_sigma: f64,

    /// 各向同性核截断半径, 物理单位.
    pub kernel_radius: f64,

    /// 各向异性核标准差, 以重建网格间距为单位.
    pub kernel_sigma_factor: f64,

    /// 各向异性核截断半径, 以重建网格间距为单位.
    pub kernel_radius_factor: f64,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            isotropic: false,
            kernel_sigma: 1.0,
            kernel_radius: 2.0,
            kernel_sigma_factor: 1.0,
            kernel_radius_factor: 2.0,
        }
    }
}

impl InjectionConfig {
    /// 检查参数合法性.
    pub fn validate(&self) -> RegResult<()> {
        let (sigma, radius) = if self.isotropic {
            (self.kernel_sigma, self.kernel_radius)
        } else {
            (self.kernel_sigma_factor, self.kernel_radius_factor)
        };
        if !(sigma > 0.0) || !(radius > 0.0) {
            return Err(RegError::invalid("kernel sigma and radius must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_rules() {
        assert!(FeatureRule::Exact.eval(Some(3.0), 3.0, 0.0));
        assert!(!FeatureRule::Exact.eval(Some(3.5), 3.0, 0.0));
        assert!(FeatureRule::Threshold.eval(Some(3.0), 3.0, 0.0));
        assert!(!FeatureRule::Threshold.eval(Some(2.9), 3.0, 0.0));
        assert!(FeatureRule::Window.eval(Some(4.0), 3.0, 1.0));
        assert!(!FeatureRule::Window.eval(Some(4.1), 3.0, 1.0));
        assert!(FeatureRule::NonZero.eval(Some(-1.0), 0.0, 0.0));
        assert!(!FeatureRule::NonZero.eval(None, 0.0, 0.0));
    }

    #[test]
    fn test_inside_inverts() {
        let cfg = DistanceMapConfig {
            inside: true,
            ..Default::default()
        };
        assert!(cfg.is_feature(Some(0.0)));
        assert!(!cfg.is_feature(Some(2.0)));
        // 缺失值在 inside 模式下成为特征.
        assert!(cfg.is_feature(None));
    }

    #[test]
    fn test_validate() {
        assert!(UnwarpConfig::default().validate().is_ok());
        let bad = UnwarpConfig {
            smooth_sigma_diff: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(InjectionConfig::default().validate().is_ok());
        let bad = InjectionConfig {
            isotropic: true,
            kernel_radius: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
