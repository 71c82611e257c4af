//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Dims, ExecContext, RegError, RegResult};

pub use crate::config::{DistanceMapConfig, FeatureRule, InjectionConfig, UnwarpConfig};
pub use crate::consts::{AXIS_X, AXIS_Y, AXIS_Z};
pub use crate::data::{DataGrid, MetaInformation, Region, ScalarType, TypedArray, UniformVolume};
pub use crate::distance::distance_map;
pub use crate::epi::{EpiUnwarp, PhaseDirection};
pub use crate::io::{NiftiVolumeIO, VolumeIO};
pub use crate::progress::{LogProgress, NullProgress, ProgressSink};
pub use crate::recon::VolumeInjection;
pub use crate::transform::{AffineXform, SplineWarpXform, Xform, XformList};

#[cfg(feature = "serde")]
pub use crate::transform::io::{BincodeXformIO, XformIO, XformRecord};
