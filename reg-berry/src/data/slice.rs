//! 正交切片的提取与回写.

use nalgebra::Vector3;

use super::grid::{in_plane_axes, DataGrid};
use super::typed_array::TypedArray;
use super::volume::UniformVolume;
use crate::consts::{AXIS_X, AXIS_Y};
use crate::{RegError, RegResult};

/// 切片内插时, 与某一层距离小于层间距该比例时直接取该层.
const SLICE_SNAP_TOLERANCE: f64 = 0.01;

/// 二维正交切片. 像素按第一维最快的顺序存储.
#[derive(Clone, Debug, PartialEq)]
pub struct OrthoSlice {
    dims: [usize; 2],
    data: TypedArray,
}

impl OrthoSlice {
    /// 由维度和数据创建.
    pub fn new(dims: [usize; 2], data: TypedArray) -> RegResult<Self> {
        if data.len() != dims[0] * dims[1] {
            return Err(RegError::invalid("slice data length does not match dims"));
        }
        Ok(Self { dims, data })
    }

    /// 切片维度.
    #[inline]
    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    /// 切片数据.
    #[inline]
    pub fn data(&self) -> &TypedArray {
        &self.data
    }

    /// 拆出数据.
    #[inline]
    pub fn into_data(self) -> TypedArray {
        self.data
    }

    /// 读取像素.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        if i >= self.dims[0] || j >= self.dims[1] {
            return None;
        }
        self.data.get(i + self.dims[0] * j)
    }
}

/// 带有物理几何信息的正交切片.
#[derive(Clone, Debug)]
pub struct VolumeSlice {
    /// 像素数据.
    pub slice: OrthoSlice,

    /// 像素间距.
    pub pixel_size: [f64; 2],

    /// 第一个像素中心的网格坐标.
    pub origin: Vector3<f64>,

    /// 切片第一维方向.
    pub direction_x: Vector3<f64>,

    /// 切片第二维方向.
    pub direction_y: Vector3<f64>,
}

/// 切片维度, 以及 (切片内 x 步长, 切片内 y 步长, 层步长).
#[inline]
fn slice_strides(dims: [usize; 3], axis: usize) -> ([usize; 2], usize, usize, usize) {
    let [nx, ny, nz] = dims;
    match axis {
        AXIS_X => ([ny, nz], nx, nx * ny, 1),
        AXIS_Y => ([nx, nz], 1, nx * ny, nx),
        _ => ([nx, ny], 1, nx, nx * ny),
    }
}

impl DataGrid {
    /// 提取垂直于 `axis` 的第 `plane` 层. 层号越界时返回全部缺失的切片.
    pub fn get_ortho_slice(&self, axis: usize, plane: usize) -> RegResult<OrthoSlice> {
        let data = self.require_data()?;
        let (sdims, inc_x, inc_y, inc_z) = slice_strides(self.dims(), axis);
        let mut out = data.new_template(sdims[0] * sdims[1]);
        if plane >= self.dims()[axis] {
            out.fill_padding_range(0, out.len());
            return OrthoSlice::new(sdims, out);
        }
        let mut to = 0;
        for j in 0..sdims[1] {
            for i in 0..sdims[0] {
                data.block_copy_to(&mut out, to, plane * inc_z + i * inc_x + j * inc_y, 1);
                to += 1;
            }
        }
        OrthoSlice::new(sdims, out)
    }

    /// 将切片写回第 `plane` 层. 层号越界时什么也不做; 网格尚无数据时以切片类型创建.
    pub fn set_ortho_slice(&mut self, axis: usize, plane: usize, slice: &OrthoSlice) -> RegResult<()> {
        let (sdims, inc_x, inc_y, inc_z) = slice_strides(self.dims(), axis);
        if sdims != slice.dims {
            return Err(RegError::invalid(format!(
                "slice dims {:?} do not match {:?}",
                slice.dims, sdims
            )));
        }
        if plane >= self.dims()[axis] {
            return Ok(());
        }
        if self.data().is_none() {
            let template = slice.data.new_template(self.num_voxels());
            self.set_data(template)?;
        }
        let data = self.data_mut().ok_or(RegError::NoData)?;
        let mut from = 0;
        for j in 0..sdims[1] {
            for i in 0..sdims[0] {
                slice.data.block_copy_to(data, plane * inc_z + i * inc_x + j * inc_y, from, 1);
                from += 1;
            }
        }
        Ok(())
    }

    /// 提取第 `plane` 层为 `axis` 方向长度为 1 的三维网格.
    pub fn extract_slice(&self, axis: usize, plane: usize) -> RegResult<DataGrid> {
        if plane >= self.dims()[axis] {
            return Err(RegError::invalid(format!("plane {plane} out of range")));
        }
        let slice = self.get_ortho_slice(axis, plane)?;
        let mut dims = self.dims();
        dims[axis] = 1;
        let mut grid = DataGrid::with_data(dims, slice.into_data())?;
        *grid.meta_mut() = self.meta().clone();
        Ok(grid)
    }
}

impl UniformVolume {
    /// 提取垂直于 `axis` 的第 `plane` 层, 附带像素间距, 原点与方向.
    pub fn get_ortho_slice_volume(&self, axis: usize, plane: usize) -> RegResult<VolumeSlice> {
        let slice = self.get_ortho_slice(axis, plane)?;
        let (u, v) = in_plane_axes(axis);
        let delta = self.delta();
        let mut origin = self.offset();
        origin[axis] += plane as f64 * delta[axis];
        Ok(VolumeSlice {
            slice,
            pixel_size: [delta[u], delta[v]],
            origin,
            direction_x: Vector3::ith(u, 1.0),
            direction_y: Vector3::ith(v, 1.0),
        })
    }

    /// 距离网格坐标 `location` (沿 `axis`) 最近的一层.
    pub fn get_nearest_ortho_slice(&self, axis: usize, location: f64) -> RegResult<VolumeSlice> {
        let pos = (location - self.offset()[axis]) / self.delta()[axis];
        let plane = if pos < 0.0 { usize::MAX } else { pos.round() as usize };
        self.get_ortho_slice_volume(axis, plane)
    }

    /// 在网格坐标 `location` (沿 `axis`) 处线性内插的切片.
    ///
    /// 与某一层足够接近时直接返回该层; 否则在相邻两层间插值, 任一层缺失的像素结果也缺失.
    pub fn get_ortho_slice_interp(&self, axis: usize, location: f64) -> RegResult<VolumeSlice> {
        let pos = (location - self.offset()[axis]) / self.delta()[axis];
        let last = self.dims()[axis].saturating_sub(1);
        if pos < 0.0 || pos > last as f64 {
            return self.get_ortho_slice_volume(axis, usize::MAX);
        }
        let base = pos.floor() as usize;
        let frac = pos - base as f64;
        if frac < SLICE_SNAP_TOLERANCE || base == last {
            return self.get_ortho_slice_volume(axis, base);
        }
        if frac > 1.0 - SLICE_SNAP_TOLERANCE {
            return self.get_ortho_slice_volume(axis, base + 1);
        }
        let mut lower = self.get_ortho_slice_volume(axis, base)?;
        let upper = self.get_ortho_slice(axis, base + 1)?;
        let n = lower.slice.data.len();
        for p in 0..n {
            match (lower.slice.data.get(p), upper.data.get(p)) {
                (Some(a), Some(b)) => lower.slice.data.set(p, (1.0 - frac) * a + frac * b),
                _ => lower.slice.data.set_padding_at(p),
            }
        }
        lower.origin[axis] = location;
        Ok(lower)
    }

    /// 提取第 `plane` 层为 `axis` 方向长度为 1 的体数据, 原点沿 `axis` 平移到该层.
    pub fn extract_slice(&self, axis: usize, plane: usize) -> RegResult<UniformVolume> {
        let grid = self.grid().extract_slice(axis, plane)?;
        let mut offset = self.offset();
        offset[axis] += plane as f64 * self.delta()[axis];
        Ok(UniformVolume::from_grid(grid, self.delta()).with_offset(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::typed_array::ScalarType;

    fn ramp(dims: [usize; 3]) -> UniformVolume {
        let n: usize = dims.iter().product();
        UniformVolume::from_delta(dims, [1.0, 2.0, 3.0])
            .with_data(TypedArray::from_vec((0..n).map(|i| i as f64).collect()))
            .unwrap()
    }

    #[test]
    fn test_ortho_slices_match_voxels() {
        let v = ramp([3, 4, 5]);
        for axis in 0..3 {
            let plane = 1;
            let s = v.get_ortho_slice(axis, plane).unwrap();
            let (u, w) = in_plane_axes(axis);
            assert_eq!(s.dims(), [v.dims()[u], v.dims()[w]]);
            for j in 0..s.dims()[1] {
                for i in 0..s.dims()[0] {
                    let mut idx = [0; 3];
                    idx[axis] = plane;
                    idx[u] = i;
                    idx[w] = j;
                    assert_eq!(s.get(i, j), v.get(idx[0], idx[1], idx[2]));
                }
            }
        }
    }

    #[test]
    fn test_out_of_range() {
        let mut v = ramp([2, 2, 2]);
        let s = v.get_ortho_slice(2, 5).unwrap();
        assert_eq!(s.data().valid_count(), 0);

        let before = v.data().cloned();
        let src = v.get_ortho_slice(2, 0).unwrap();
        v.set_ortho_slice(2, 9, &src).unwrap();
        assert_eq!(v.data().cloned(), before);
    }

    #[test]
    fn test_set_creates_data() {
        let mut g = DataGrid::new([2, 3, 2]);
        let s = OrthoSlice::new([2, 2], TypedArray::from_vec(vec![1u8, 2, 3, 4])).unwrap();
        g.set_ortho_slice(1, 2, &s).unwrap();
        assert_eq!(g.data().unwrap().scalar_type(), ScalarType::U8);
        assert_eq!(g.get(1, 2, 1), Some(4.0));
        assert_eq!(g.get(1, 1, 1), Some(0.0));
    }

    #[test]
    fn test_extract_slice_offset() {
        let v = ramp([3, 4, 5]);
        let e = v.extract_slice(2, 3).unwrap();
        assert_eq!(e.dims(), [3, 4, 1]);
        assert_eq!(e.delta(), v.delta());
        assert_eq!(e.offset()[2], 9.0);
        assert_eq!(e.get(2, 1, 0), v.get(2, 1, 3));
        assert!(v.extract_slice(2, 5).is_err());
    }

    #[test]
    fn test_interp_slice() {
        let v = ramp([2, 2, 3]);
        // z 间距 3, 位置 4.5 即第 1.5 层.
        let s = v.get_ortho_slice_interp(2, 4.5).unwrap();
        let expect = 0.5 * (v.get(1, 1, 1).unwrap() + v.get(1, 1, 2).unwrap());
        assert_eq!(s.slice.get(1, 1), Some(expect));
        assert_eq!(s.origin[2], 4.5);

        let snapped = v.get_ortho_slice_interp(2, 3.01).unwrap();
        assert_eq!(snapped.slice.get(0, 0), v.get(0, 0, 1));

        let near = v.get_nearest_ortho_slice(2, 4.4).unwrap();
        assert_eq!(near.slice.get(0, 0), v.get(0, 0, 1));
        assert_eq!(near.pixel_size, [1.0, 2.0]);
    }
}
