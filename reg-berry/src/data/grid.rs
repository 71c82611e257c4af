//! 三维规则网格与其数据数组.
//!
//! 体素按 x 最快, z 最慢的顺序扁平存储: `offset = x + nx * (y + ny * z)`.
//! 转换为 `ndarray` 时采用 `(z, y, x)` 形状.

use itertools::iproduct;
use ndarray::{Array3, ShapeBuilder};

use super::meta::{MetaInformation, META_IMAGE_ORIENTATION, META_IMAGE_ORIENTATION_ORIGINAL};
use super::orientation::PermutationMatrix;
use super::typed_array::{ScalarType, TypedArray};
use crate::consts::{AXIS_X, AXIS_Y, AXIS_Z, DEFAULT_ORIENTATION};
use crate::{Dims, RegError, RegResult};

/// 网格上的长方体区域, 下界包含, 上界不包含.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Region {
    /// 下界 (包含).
    pub from: [usize; 3],

    /// 上界 (不包含).
    pub to: [usize; 3],
}

impl Region {
    /// 构造.
    #[inline]
    pub const fn new(from: [usize; 3], to: [usize; 3]) -> Self {
        Self { from, to }
    }

    /// 覆盖整个网格的区域.
    #[inline]
    pub const fn whole(dims: Dims) -> Self {
        Self {
            from: [0; 3],
            to: dims,
        }
    }

    /// 各轴长度.
    #[inline]
    pub fn size(&self) -> Dims {
        [
            self.to[0].saturating_sub(self.from[0]),
            self.to[1].saturating_sub(self.from[1]),
            self.to[2].saturating_sub(self.from[2]),
        ]
    }

    /// 体素个数.
    #[inline]
    pub fn num_voxels(&self) -> usize {
        self.size().iter().product()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_voxels() == 0
    }

    /// 是否包含索引?
    #[inline]
    pub fn contains(&self, idx: [usize; 3]) -> bool {
        (0..3).all(|a| self.from[a] <= idx[a] && idx[a] < self.to[a])
    }

    /// 按 x 最快的顺序遍历区域内所有索引.
    pub fn indices(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let r = *self;
        iproduct!(r.from[2]..r.to[2], r.from[1]..r.to[1], r.from[0]..r.to[0]).map(|(z, y, x)| [x, y, z])
    }
}

/// 三维规则网格, 持有至多一个数据数组.
#[derive(Clone, Debug)]
pub struct DataGrid {
    dims: Dims,
    crop: Region,
    data: Option<TypedArray>,
    meta: MetaInformation,
}

impl DataGrid {
    /// 创建不含数据的网格.
    pub fn new(dims: Dims) -> Self {
        Self {
            dims,
            crop: Region::whole(dims),
            data: None,
            meta: MetaInformation::new(),
        }
    }

    /// 创建网格并附带数据. 数据长度必须等于体素个数.
    pub fn with_data(dims: Dims, data: TypedArray) -> RegResult<Self> {
        let mut grid = Self::new(dims);
        grid.set_data(data)?;
        Ok(grid)
    }

    /// 网格维度 `[nx, ny, nz]`.
    #[inline]
    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// 体素个数.
    #[inline]
    pub fn num_voxels(&self) -> usize {
        self.dims.iter().product()
    }

    /// 扁平偏移.
    #[inline]
    pub fn linear_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    /// 沿 `axis` 前进一格时扁平偏移的增量.
    #[inline]
    pub fn stride(&self, axis: usize) -> usize {
        match axis {
            AXIS_X => 1,
            AXIS_Y => self.dims[0],
            _ => self.dims[0] * self.dims[1],
        }
    }

    /// 扁平偏移对应的索引.
    #[inline]
    pub fn index_of(&self, offset: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [offset % nx, (offset / nx) % ny, offset / (nx * ny)]
    }

    /// 索引是否在网格内?
    #[inline]
    pub fn contains(&self, idx: [usize; 3]) -> bool {
        (0..3).all(|a| idx[a] < self.dims[a])
    }

    /// 数据数组.
    #[inline]
    pub fn data(&self) -> Option<&TypedArray> {
        self.data.as_ref()
    }

    /// 数据数组 (可变).
    #[inline]
    pub fn data_mut(&mut self) -> Option<&mut TypedArray> {
        self.data.as_mut()
    }

    /// 数据数组, 不存在时返回 `NoData`.
    #[inline]
    pub fn require_data(&self) -> RegResult<&TypedArray> {
        self.data.as_ref().ok_or(RegError::NoData)
    }

    /// 替换数据数组.
    pub fn set_data(&mut self, data: TypedArray) -> RegResult<()> {
        if data.len() != self.num_voxels() {
            return Err(RegError::invalid(format!(
                "data length {} does not match grid {:?}",
                data.len(),
                self.dims
            )));
        }
        self.data = Some(data);
        Ok(())
    }

    /// 取出数据数组.
    pub fn take_data(&mut self) -> Option<TypedArray> {
        self.data.take()
    }

    /// 分配全零数据数组并替换原有数组.
    pub fn create_data_array(&mut self, ty: ScalarType) -> &mut TypedArray {
        self.data.insert(TypedArray::new(ty, self.num_voxels()))
    }

    /// 元信息.
    #[inline]
    pub fn meta(&self) -> &MetaInformation {
        &self.meta
    }

    /// 元信息 (可变).
    #[inline]
    pub fn meta_mut(&mut self) -> &mut MetaInformation {
        &mut self.meta
    }

    /// 读取体素值. 无数据, 越界或缺失时返回 `None`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f64> {
        if !self.contains([x, y, z]) {
            return None;
        }
        self.data.as_ref()?.get(self.linear_index(x, y, z))
    }

    /// 按扁平偏移读取.
    #[inline]
    pub fn get_at(&self, offset: usize) -> Option<f64> {
        self.data.as_ref()?.get(offset)
    }

    /// 写入体素值. 无数据时返回 `NoData`, 越界时返回 `InvalidArgument`.
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f64) -> RegResult<()> {
        if !self.contains([x, y, z]) {
            return Err(RegError::invalid(format!("voxel ({x}, {y}, {z}) outside grid {:?}", self.dims)));
        }
        let offset = self.linear_index(x, y, z);
        self.data.as_mut().ok_or(RegError::NoData)?.set(offset, value);
        Ok(())
    }

    // ---------------- 降采样 ----------------

    /// 降采样后的维度: `(dims - 1) / factor + 1`.
    pub fn downsampled_dims(&self, factor: [usize; 3]) -> RegResult<Dims> {
        if factor.iter().any(|&f| f == 0) {
            return Err(RegError::invalid("downsampling factor must be positive"));
        }
        Ok([0, 1, 2].map(|a| (self.dims[a].max(1) - 1) / factor[a] + 1))
    }

    /// 最近邻降采样: 每个块取其原点处的体素.
    pub fn get_downsampled(&self, factor: [usize; 3]) -> RegResult<DataGrid> {
        let new_dims = self.downsampled_dims(factor)?;
        let mut out = DataGrid::new(new_dims);
        out.meta = self.meta.clone();
        if let Some(data) = &self.data {
            let mut dst = data.new_template(out.num_voxels());
            let mut to = 0;
            for z in 0..new_dims[2] {
                for y in 0..new_dims[1] {
                    for x in 0..new_dims[0] {
                        let from = self.linear_index(x * factor[0], y * factor[1], z * factor[2]);
                        data.block_copy_to(&mut dst, to, from, 1);
                        to += 1;
                    }
                }
            }
            out.data = Some(dst);
        }
        Ok(out)
    }

    /// 块平均降采样: 取块内有效体素的均值, 块内无有效体素时为缺失.
    pub fn get_downsampled_and_averaged(&self, factor: [usize; 3]) -> RegResult<DataGrid> {
        let new_dims = self.downsampled_dims(factor)?;
        let mut out = DataGrid::new(new_dims);
        out.meta = self.meta.clone();
        if let Some(data) = &self.data {
            let mut dst = data.new_template(out.num_voxels());
            let mut to = 0;
            for z in 0..new_dims[2] {
                for y in 0..new_dims[1] {
                    for x in 0..new_dims[0] {
                        let block = Region::new(
                            [x * factor[0], y * factor[1], z * factor[2]],
                            [
                                ((x + 1) * factor[0]).min(self.dims[0]),
                                ((y + 1) * factor[1]).min(self.dims[1]),
                                ((z + 1) * factor[2]).min(self.dims[2]),
                            ],
                        );
                        let (sum, n) = block
                            .indices()
                            .filter_map(|[i, j, k]| data.get(self.linear_index(i, j, k)))
                            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                        if n > 0 {
                            dst.set(to, sum / n as f64);
                        } else {
                            dst.set_padding_at(to);
                        }
                        to += 1;
                    }
                }
            }
            out.data = Some(dst);
        }
        Ok(out)
    }

    // ---------------- 重定向 ----------------

    /// 当前方向代码. 缺失或不合法时回退到默认方向并给出警告.
    pub(crate) fn current_orientation(&self) -> String {
        match self.meta.get(META_IMAGE_ORIENTATION) {
            Some(code) if code.chars().count() == 3 => code.to_owned(),
            other => {
                tracing::warn!(
                    "orientation code {:?} is not a 3-letter code, assuming {}",
                    other,
                    DEFAULT_ORIENTATION
                );
                DEFAULT_ORIENTATION.to_owned()
            }
        }
    }

    /// 按置换重排体素, 保留数据类型与 padding.
    pub(crate) fn permuted(&self, perm: &PermutationMatrix, code: &str) -> DataGrid {
        let new_dims = perm.target_dims();
        let mut out = DataGrid::new(new_dims);
        out.meta = self.meta.clone();
        if let Some(data) = &self.data {
            let mut dst = data.new_template(out.num_voxels());
            let mut to = 0;
            for z in 0..new_dims[2] {
                for y in 0..new_dims[1] {
                    for x in 0..new_dims[0] {
                        let [i, j, k] = perm.source_index([x, y, z]);
                        data.block_copy_to(&mut dst, to, self.linear_index(i, j, k), 1);
                        to += 1;
                    }
                }
            }
            out.data = Some(dst);
        }
        let original = self.current_orientation();
        out.meta.set_if_absent(META_IMAGE_ORIENTATION_ORIGINAL, original);
        out.meta.set(META_IMAGE_ORIENTATION, code);
        out
    }

    /// 重定向到方向代码 `code`.
    pub fn get_reoriented(&self, code: &str) -> RegResult<DataGrid> {
        let perm = PermutationMatrix::new(self.dims, &self.current_orientation(), code)?;
        Ok(self.permuted(&perm, code))
    }

    // ---------------- 镜像 ----------------

    /// 沿 `axis` 原地镜像数据.
    pub fn mirror_plane_in_place(&mut self, axis: usize) {
        let [nx, ny, nz] = self.dims;
        let Some(data) = self.data.as_mut() else {
            return;
        };
        match axis {
            AXIS_X => {
                for row in 0..ny * nz {
                    data.block_reverse(row * nx, nx);
                }
            }
            AXIS_Y => {
                for z in 0..nz {
                    let plane = z * nx * ny;
                    for y in 0..ny / 2 {
                        data.block_swap(plane + y * nx, plane + (ny - 1 - y) * nx, nx);
                    }
                }
            }
            _ => {
                let plane = nx * ny;
                for z in 0..nz / 2 {
                    data.block_swap(z * plane, (nz - 1 - z) * plane, plane);
                }
            }
        }
    }

    /// 返回沿 `axis` 镜像后的数据副本, 不修改自身.
    pub fn get_data_mirror_plane(&self, axis: usize) -> RegResult<TypedArray> {
        let mut copy = DataGrid::with_data(self.dims, self.require_data()?.clone())?;
        copy.mirror_plane_in_place(axis);
        copy.take_data().ok_or(RegError::NoData)
    }

    // ---------------- 裁剪 ----------------

    /// 当前裁剪区域.
    #[inline]
    pub fn crop_region(&self) -> Region {
        self.crop
    }

    /// 设置裁剪区域. 负值表示相对于维度的偏移 (`-1` 即 `dims - 1`), 结果截断到网格内.
    pub fn set_crop_region(&mut self, from: [i64; 3], to: [i64; 3]) -> Region {
        let mut region = Region::default();
        for a in 0..3 {
            let d = self.dims[a] as i64;
            let f = if from[a] < 0 { d + from[a] } else { from[a] };
            let t = if to[a] < 0 { d + to[a] } else { to[a] };
            let f = f.clamp(0, d);
            region.from[a] = f as usize;
            region.to[a] = t.clamp(f, d) as usize;
        }
        self.crop = region;
        region
    }

    /// 直接设置裁剪区域 (截断到网格内).
    pub fn set_crop_region_exact(&mut self, region: Region) -> Region {
        self.set_crop_region(region.from.map(|v| v as i64), region.to.map(|v| v as i64))
    }

    /// 恢复为整个网格.
    pub fn reset_crop_region(&mut self) {
        self.crop = Region::whole(self.dims);
    }

    /// 复制裁剪区域内的体素到新数组, x 最快.
    pub fn get_cropped_data(&self) -> RegResult<TypedArray> {
        let data = self.require_data()?;
        let r = self.crop;
        let [cx, _, _] = r.size();
        let mut out = data.new_template(r.num_voxels());
        let mut to = 0;
        for z in r.from[2]..r.to[2] {
            for y in r.from[1]..r.to[1] {
                data.block_copy_to(&mut out, to, self.linear_index(r.from[0], y, z), cx);
                to += cx;
            }
        }
        Ok(out)
    }

    /// 以裁剪区域为新网格, 返回独立的网格.
    pub fn get_cropped_grid(&self) -> RegResult<DataGrid> {
        let mut out = DataGrid::with_data(self.crop.size(), self.get_cropped_data()?)?;
        out.meta = self.meta.clone();
        Ok(out)
    }

    /// 将 `block` (尺寸 `size`) 写回到本网格 `origin` 处.
    pub fn paste(&mut self, block: &TypedArray, size: Dims, origin: [usize; 3]) -> RegResult<()> {
        if (0..3).any(|a| origin[a] + size[a] > self.dims[a]) || block.len() != size.iter().product() {
            return Err(RegError::invalid("block does not fit into grid"));
        }
        let dims = self.dims;
        let data = self.data.as_mut().ok_or(RegError::NoData)?;
        let mut from = 0;
        for z in 0..size[2] {
            for y in 0..size[1] {
                let to = origin[0] + dims[0] * (origin[1] + y + dims[1] * (origin[2] + z));
                block.block_copy_to(data, to, from, size[0]);
                from += size[0];
            }
        }
        Ok(())
    }

    /// 自动裁剪: 在 (当前或整个) 区域内寻找值不小于 `threshold` 的体素的包围盒,
    /// 向外扩展 `margin` 后设为新的裁剪区域.
    ///
    /// 找不到满足条件的体素时, 裁剪区域不变并返回 `None`.
    pub fn auto_crop(&mut self, threshold: f64, recrop: bool, margin: [usize; 3]) -> Option<Region> {
        let data = self.data.as_ref()?;
        let scan = if recrop { self.crop } else { Region::whole(self.dims) };
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut found = false;
        for idx in scan.indices() {
            let v = data.get(self.linear_index(idx[0], idx[1], idx[2]));
            if v.map_or(false, |v| v >= threshold) {
                found = true;
                for a in 0..3 {
                    lo[a] = lo[a].min(idx[a]);
                    hi[a] = hi[a].max(idx[a]);
                }
            }
        }
        if !found {
            return None;
        }
        let mut region = Region::default();
        for a in 0..3 {
            region.from[a] = lo[a].saturating_sub(margin[a]);
            region.to[a] = (hi[a] + 1 + margin[a]).min(self.dims[a]);
        }
        self.crop = region;
        Some(region)
    }

    /// 将裁剪区域外的所有体素设为 `value`.
    pub fn fill_crop_background(&mut self, value: f64) -> RegResult<()> {
        let crop = self.crop;
        let dims = self.dims;
        let data = self.data.as_mut().ok_or(RegError::NoData)?;
        for idx in Region::whole(dims).indices() {
            if !crop.contains(idx) {
                data.set(idx[0] + dims[0] * (idx[1] + dims[1] * idx[2]), value);
            }
        }
        Ok(())
    }

    /// 掩膜: `mask` 中为零或缺失的体素置为缺失. `inverse` 时改为清除掩膜非零处的体素.
    pub fn apply_mask(&mut self, mask: &DataGrid, inverse: bool) -> RegResult<()> {
        if mask.dims != self.dims {
            return Err(RegError::GridMismatch { left: self.dims, right: mask.dims });
        }
        let mask = mask.require_data()?;
        let data = self.data.as_mut().ok_or(RegError::NoData)?;
        for i in 0..data.len() {
            let outside = mask.get(i).map_or(true, |v| v == 0.0);
            if outside != inverse {
                data.set_padding_at(i);
            }
        }
        Ok(())
    }

    // ---------------- 交错子体 ----------------

    /// 将 `axis` 上第 `from` 层复制到 `dst` (维度 `dst_dims`) 的第 `to` 层.
    pub(crate) fn copy_plane_to(
        &self,
        dst: &mut TypedArray,
        dst_dims: Dims,
        axis: usize,
        from: usize,
        to: usize,
    ) -> RegResult<()> {
        let data = self.require_data()?;
        let [nx, ny, nz] = self.dims;
        match axis {
            AXIS_X => {
                for z in 0..nz {
                    for y in 0..ny {
                        let d = to + dst_dims[0] * (y + dst_dims[1] * z);
                        data.block_copy_to(dst, d, self.linear_index(from, y, z), 1);
                    }
                }
            }
            AXIS_Y => {
                for z in 0..nz {
                    let d = dst_dims[0] * (to + dst_dims[1] * z);
                    data.block_copy_to(dst, d, self.linear_index(0, from, z), nx);
                }
            }
            _ => {
                let plane = nx * ny;
                data.block_copy_to(dst, to * plane, from * plane, plane);
            }
        }
        Ok(())
    }

    // ---------------- ndarray ----------------

    /// 转换为 `(z, y, x)` 形状的 `f64` 数组, 缺失值为 NaN.
    pub fn to_array3(&self) -> RegResult<Array3<f64>> {
        let data = self.require_data()?;
        let [nx, ny, nz] = self.dims;
        Array3::from_shape_vec((nz, ny, nx), data.to_f64_vec(f64::NAN))
            .map_err(|e| RegError::invalid(e.to_string()))
    }

    /// 由 `(z, y, x)` 形状的数组创建 `ty` 类型的网格, NaN 视为缺失.
    pub fn from_array3(arr: &Array3<f64>, ty: ScalarType) -> DataGrid {
        let (nz, ny, nx) = arr.dim();
        let mut grid = DataGrid::new([nx, ny, nz]);
        let data = grid.create_data_array(ty);
        // 标准布局下迭代顺序即为 x 最快.
        let standard = arr.as_standard_layout();
        for (i, &v) in standard.iter().enumerate() {
            if v.is_nan() {
                data.set_padding_at(i);
            } else {
                data.set(i, v);
            }
        }
        grid
    }

    /// 以 `(nx, ny, nz)` 的 Fortran 布局视角转换, 与 nifti 的存储顺序一致.
    pub(crate) fn from_fortran_array3(arr: &Array3<f64>, ty: ScalarType) -> DataGrid {
        let (nx, ny, nz) = arr.dim();
        let mut grid = DataGrid::new([nx, ny, nz]);
        let data = grid.create_data_array(ty);
        let mut fortran = Array3::<f64>::zeros((nx, ny, nz).f());
        fortran.assign(arr);
        if let Some(flat) = fortran.as_slice_memory_order() {
            for (i, &v) in flat.iter().enumerate() {
                if v.is_nan() {
                    data.set_padding_at(i);
                } else {
                    data.set(i, v);
                }
            }
        }
        grid
    }
}

/// 垂直于 `axis` 的切片平面内的两个轴, 先快后慢.
#[inline]
pub(crate) fn in_plane_axes(axis: usize) -> (usize, usize) {
    match axis {
        AXIS_X => (AXIS_Y, AXIS_Z),
        AXIS_Y => (AXIS_X, AXIS_Z),
        _ => (AXIS_X, AXIS_Y),
    }
}
