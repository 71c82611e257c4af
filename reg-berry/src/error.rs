//! 运行时错误.
//!
//! 缺失数据 (padding 体素, 插值越界, 核权重为零) 不属于错误, 以 `Option::None` 表达.

use thiserror::Error;

/// 库内统一错误类型.
#[derive(Error, Debug)]
pub enum RegError {
    /// 仿射矩阵奇异, 无法求逆.
    #[error("singular matrix (det = {0:e})")]
    SingularMatrix(f64),

    /// 坐标位于形变场定义域之外.
    #[error("point ({0:.3}, {1:.3}, {2:.3}) is outside the transform domain")]
    OutOfDomain(f64, f64, f64),

    /// 形变场逆变换迭代在容差内未收敛. 参数为最终残差.
    #[error("approximate inverse did not converge (residual {residual:e})")]
    InverseNotConverged {
        /// 最终残差, 物理单位.
        residual: f64,
    },

    /// 变换链中的逆向条目不存在可用的逆变换.
    #[error("no inverse available for transform list entry #{0}")]
    NoInverse(usize),

    /// 两个体数据的网格不一致.
    #[error("grid mismatch: {left:?} vs {right:?}")]
    GridMismatch {
        /// 左侧维度.
        left: [usize; 3],
        /// 右侧维度.
        right: [usize; 3],
    },

    /// 网格尚未持有数据数组.
    #[error("grid has no data array")]
    NoData,

    /// 参数不合法.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 进度接收端请求中止.
    #[error("operation cancelled by progress sink")]
    Cancelled,

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// nifti 读写错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 图像导出错误.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// `.npy` 导出错误.
    #[error(transparent)]
    Npy(#[from] ndarray_npy::WriteNpyError),

    /// 变换文件编解码错误.
    #[error("codec error: {0}")]
    Codec(String),
}

/// 库内统一结果类型.
pub type RegResult<T> = Result<T, RegError>;

impl RegError {
    /// 构造 `InvalidArgument`.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// 构造 `Codec`.
    #[inline]
    pub fn codec(msg: impl std::fmt::Display) -> Self {
        Self::Codec(msg.to_string())
    }

    /// 是否属于数值退化类错误 (调用者可选择以恒等变换等默认行为替代).
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            Self::SingularMatrix(_)
                | Self::OutOfDomain(..)
                | Self::InverseNotConverged { .. }
                | Self::NoInverse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RegError::invalid("factor must be positive");
        assert_eq!(
            err.to_string(),
            "invalid argument: factor must be positive"
        );

        let err = RegError::GridMismatch {
            left: [4, 4, 4],
            right: [4, 4, 5],
        };
        assert!(err.to_string().contains("[4, 4, 5]"));
    }

    #[test]
    fn test_numerical_taxonomy() {
        assert!(RegError::SingularMatrix(0.0).is_numerical());
        assert!(RegError::NoInverse(1).is_numerical());
        assert!(!RegError::NoData.is_numerical());
        assert!(!RegError::Cancelled.is_numerical());
    }

    #[test]
    fn test_io_conversion() {
        fn open() -> RegResult<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.nii")?)
        }
        assert!(matches!(open(), Err(RegError::Io(_))));
    }
}
