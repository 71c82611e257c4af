#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供均匀三维体数据模型, 以及建立在其上的距离变换, 坐标变换链,
//! EPI 去畸变和体注入重建算法.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 约定
//!
//! 1. 体素按 x 最快, z 最慢的顺序扁平存储: `offset = x + nx * (y + ny * z)`.
//!   转换为 `ndarray` 时采用 `(z, y, x)` 形状.
//! 2. 缺失数据 (padding 体素, 插值越界, 核权重为零) 以 `Option::None` 表达, 不是错误.
//!   输入不合法和数值退化以 [`RegError`] 返回, 不会 panic.
//! 3. 所有并行入口都接受 [`ExecContext`], 结果与线程数无关.
//!
//! # 开发计划
//!
//! ### 体数据模型 ✅
//!
//! 类型擦除数组, 规则网格, 切片, 裁剪, 重定向, 镜像, 降采样与滤波.
//!
//! 实现位于 `reg-berry/src/data`.
//!
//! ### 线性时间欧氏距离变换 ✅
//!
//! 各向异性体素间距, 按平面并行.
//!
//! 实现位于 `reg-berry/src/distance`.
//!
//! ### 坐标变换与变换链 ✅
//!
//! 仿射变换, B 样条形变场及其近似逆, 变换链的点映射与雅可比行列式.
//!
//! 实现位于 `reg-berry/src/transform`.
//!
//! ### L-BFGS ✅
//!
//! 实现位于 `reg-berry/src/optim`.
//!
//! ### EPI 去畸变 ✅
//!
//! 正反相位编码图像对, 多尺度优化, 光滑与防折叠正则.
//!
//! 实现位于 `reg-berry/src/epi`.
//!
//! ### 体注入重建 ✅
//!
//! 各向同性散射与各向异性聚集, 直方图 KL 散度与拉普拉斯粗糙度.
//!
//! 实现位于 `reg-berry/src/recon`.
//!
//! ### 读写 ✅
//!
//! nifti 读写, `.npy` 与 PNG 切片导出, 变换文件.
//!
//! 实现位于 `reg-berry/src/io` 与 `reg-berry/src/transform/io.rs`.
//!
//! ### 完善代码文档 ⌛️
//!
//! 给每个 public API 提供文档, 并视情况给 private
//! API 提供文档.

/// 三维网格维度 `[nx, ny, nz]`.
pub type Dims = [usize; 3];

pub mod config;
pub mod consts;
pub mod data;
pub mod distance;
pub mod epi;
mod error;
pub mod exec;
pub mod io;
pub mod optim;
pub mod prelude;
pub mod progress;
pub mod recon;
pub mod transform;

pub use error::{RegError, RegResult};
pub use exec::ExecContext;
