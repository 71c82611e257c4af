//! 体数据模型: 类型擦除数组, 规则网格, 均匀间距体数据, 以及其上的切片, 裁剪,
//! 重定向, 降采样和滤波操作.
//!
//! 派生出的切片, 子体和重采样结果总是拥有独立复制的新数组, 不与源数据共享存储.

pub mod filter;
pub mod grid;
pub mod meta;
pub mod orientation;
pub mod slice;
pub mod typed_array;
pub mod volume;

pub use grid::{DataGrid, Region};
pub use meta::MetaInformation;
pub use orientation::PermutationMatrix;
pub use slice::{OrthoSlice, VolumeSlice};
pub use typed_array::{ArrayData, Scalar, ScalarType, TypedArray};
pub use volume::{PhysicalRegion, UniformVolume};
