//! 通用常量.

/// x 轴 (内存中变化最快的轴).
pub const AXIS_X: usize = 0;

/// y 轴.
pub const AXIS_Y: usize = 1;

/// z 轴 (层方向).
pub const AXIS_Z: usize = 2;

/// 未记录或无法解析方向码时采用的解剖方向.
pub const DEFAULT_ORIENTATION: &str = "RAS";

/// 距离变换中 "尚未到达任何特征" 的平方距离标记值.
pub const EDT_MAX_DISTANCE_SQUARED: f64 = 2147329548.0;

/// 注入重建中强度直方图的箱数.
pub const HISTOGRAM_BINS: usize = 64;

/// 形变场近似求逆的默认残差容差 (物理单位).
pub const DEFAULT_INVERSE_EPSILON: f64 = 0.01;

/// 形变场近似求逆的最大迭代次数.
pub const INVERSE_MAX_ITERATIONS: usize = 100;

/// 行列式绝对值低于此值的仿射矩阵视为奇异.
pub const SINGULAR_DETERMINANT: f64 = 1e-12;

/// 坐标轴名.
#[inline]
pub const fn axis_name(axis: usize) -> char {
    match axis {
        AXIS_X => 'x',
        AXIS_Y => 'y',
        _ => 'z',
    }
}
