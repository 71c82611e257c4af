//! 均匀间距体数据: 网格 + 物理坐标映射.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use nalgebra::{Matrix3, Matrix4, SymmetricEigen, Vector3, Vector4};

use super::grid::{DataGrid, Region};
use super::meta::META_IMAGE_ORIENTATION;
use super::orientation::PermutationMatrix;
use super::typed_array::{ScalarType, TypedArray};
use crate::{Dims, RegError, RegResult};

/// 读取列向量约定下矩阵第 `a` 列的前三个分量.
#[inline]
pub(crate) fn column(m: &Matrix4<f64>, a: usize) -> Vector3<f64> {
    m.fixed_view::<3, 1>(0, a).into_owned()
}

#[inline]
fn set_column(m: &mut Matrix4<f64>, a: usize, v: &Vector3<f64>) {
    m.fixed_view_mut::<3, 1>(0, a).copy_from(v);
}

/// 物理坐标区域, 用于 [`UniformVolume::get_grid_range`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalRegion {
    /// 下角.
    pub from: Vector3<f64>,

    /// 上角.
    pub to: Vector3<f64>,
}

/// 均匀间距三维体数据.
///
/// 网格坐标 `offset + idx * delta` 与索引到物理坐标矩阵 (4×4, 列向量约定, 第 3 列为平移)
/// 分别维护. 可另外附带若干以整数为键的替代矩阵 (例如对应其它物理空间定义).
#[derive(Clone, Debug)]
pub struct UniformVolume {
    grid: DataGrid,
    delta: [f64; 3],
    size: [f64; 3],
    offset: Vector3<f64>,
    index_to_physical: Matrix4<f64>,
    alternative: BTreeMap<i32, Matrix4<f64>>,
}

impl Deref for UniformVolume {
    type Target = DataGrid;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.grid
    }
}

impl DerefMut for UniformVolume {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.grid
    }
}

impl UniformVolume {
    /// 由维度和物理尺寸创建. 某轴维度不大于 1 或尺寸非正时该轴间距取 1.
    pub fn new(dims: Dims, size: [f64; 3]) -> Self {
        let delta = [0, 1, 2].map(|a| {
            if dims[a] > 1 && size[a] > 0.0 {
                size[a] / (dims[a] - 1) as f64
            } else {
                1.0
            }
        });
        Self::from_parts(DataGrid::new(dims), delta, Vector3::zeros())
    }

    /// 由维度和体素间距创建.
    pub fn from_delta(dims: Dims, delta: [f64; 3]) -> Self {
        Self::from_parts(DataGrid::new(dims), delta, Vector3::zeros())
    }

    /// 由已有网格和体素间距创建.
    pub fn from_grid(grid: DataGrid, delta: [f64; 3]) -> Self {
        Self::from_parts(grid, delta, Vector3::zeros())
    }

    fn from_parts(grid: DataGrid, delta: [f64; 3], offset: Vector3<f64>) -> Self {
        let dims = grid.dims();
        let size = [0, 1, 2].map(|a| delta[a] * (dims[a].max(1) - 1) as f64);
        let mut index_to_physical = Matrix4::identity();
        for a in 0..3 {
            index_to_physical[(a, a)] = delta[a];
            index_to_physical[(a, 3)] = offset[a];
        }
        Self {
            grid,
            delta,
            size,
            offset,
            index_to_physical,
            alternative: BTreeMap::new(),
        }
    }

    /// 附带数据, 返回自身.
    pub fn with_data(mut self, data: TypedArray) -> RegResult<Self> {
        self.grid.set_data(data)?;
        Ok(self)
    }

    /// 设置网格原点, 同时平移索引到物理坐标矩阵.
    pub fn with_offset(mut self, offset: Vector3<f64>) -> Self {
        self.set_offset(offset);
        self
    }

    /// 底层网格.
    #[inline]
    pub fn grid(&self) -> &DataGrid {
        &self.grid
    }

    /// 拆出底层网格.
    #[inline]
    pub fn into_grid(self) -> DataGrid {
        self.grid
    }

    /// 体素间距.
    #[inline]
    pub fn delta(&self) -> [f64; 3] {
        self.delta
    }

    /// 最小体素间距.
    #[inline]
    pub fn min_delta(&self) -> f64 {
        self.delta.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// 物理尺寸, `delta * (dims - 1)`.
    #[inline]
    pub fn size(&self) -> [f64; 3] {
        self.size
    }

    /// 网格原点.
    #[inline]
    pub fn offset(&self) -> Vector3<f64> {
        self.offset
    }

    /// 设置网格原点, 矩阵平移同步变化.
    pub fn set_offset(&mut self, offset: Vector3<f64>) {
        let shift = offset - self.offset;
        self.offset = offset;
        let t = column(&self.index_to_physical, 3) + shift;
        set_column(&mut self.index_to_physical, 3, &t);
    }

    /// 索引到物理坐标矩阵.
    #[inline]
    pub fn index_to_physical(&self) -> &Matrix4<f64> {
        &self.index_to_physical
    }

    /// 替换索引到物理坐标矩阵.
    pub fn set_index_to_physical(&mut self, m: Matrix4<f64>) {
        self.index_to_physical = m;
    }

    /// 替代矩阵表.
    #[inline]
    pub fn alternative_matrices(&self) -> &BTreeMap<i32, Matrix4<f64>> {
        &self.alternative
    }

    /// 设置替代矩阵.
    pub fn set_alternative_matrix(&mut self, key: i32, m: Matrix4<f64>) {
        self.alternative.insert(key, m);
    }

    /// 对主矩阵及所有替代矩阵执行同一修改.
    fn update_matrices(&mut self, mut f: impl FnMut(&mut Matrix4<f64>)) {
        f(&mut self.index_to_physical);
        self.alternative.values_mut().for_each(f);
    }

    /// 网格坐标 `offset + idx * delta`.
    #[inline]
    pub fn grid_location(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        Vector3::new(
            self.offset[0] + x as f64 * self.delta[0],
            self.offset[1] + y as f64 * self.delta[1],
            self.offset[2] + z as f64 * self.delta[2],
        )
    }

    /// 由扁平偏移求网格坐标.
    #[inline]
    pub fn grid_location_at(&self, offset: usize) -> Vector3<f64> {
        let [x, y, z] = self.index_of(offset);
        self.grid_location(x, y, z)
    }

    /// 经索引到物理坐标矩阵映射 (允许非整数索引).
    pub fn index_to_physical_point(&self, idx: [f64; 3]) -> Vector3<f64> {
        let p = self.index_to_physical * Vector4::new(idx[0], idx[1], idx[2], 1.0);
        Vector3::new(p[0], p[1], p[2])
    }

    /// 网格坐标对应的连续索引.
    #[inline]
    pub fn continuous_index(&self, p: &Vector3<f64>) -> [f64; 3] {
        [0, 1, 2].map(|a| (p[a] - self.offset[a]) / self.delta[a])
    }

    /// 查找包含网格坐标 `p` 的体素 (向下取整). 位于网格外时返回 `None`.
    pub fn find_voxel(&self, p: &Vector3<f64>) -> Option<[usize; 3]> {
        let c = self.continuous_index(p);
        let dims = self.dims();
        let mut idx = [0; 3];
        for a in 0..3 {
            if !(c[a] >= 0.0) {
                return None;
            }
            let i = c[a].floor() as usize;
            if i >= dims[a] {
                return None;
            }
            idx[a] = i;
        }
        Some(idx)
    }

    /// 三线性插值. 要求 `idx` 在每个轴上都严格小于 `dims - 1`, 且八个角点均有有效值.
    pub fn trilinear_interpolation(&self, idx: [usize; 3], frac: [f64; 3]) -> Option<f64> {
        let dims = self.dims();
        if (0..3).any(|a| idx[a] + 1 >= dims[a]) {
            return None;
        }
        let data = self.data()?;
        let [x, y, z] = idx;
        let base = self.linear_index(x, y, z);
        let (sy, sz) = (self.stride(1), self.stride(2));
        let c000 = data.get(base)?;
        let c100 = data.get(base + 1)?;
        let c010 = data.get(base + sy)?;
        let c110 = data.get(base + sy + 1)?;
        let c001 = data.get(base + sz)?;
        let c101 = data.get(base + sz + 1)?;
        let c011 = data.get(base + sz + sy)?;
        let c111 = data.get(base + sz + sy + 1)?;
        let [fx, fy, fz] = frac;
        let (gx, gy, gz) = (1.0 - fx, 1.0 - fy, 1.0 - fz);
        Some(
            gz * (gy * (gx * c000 + fx * c100) + fy * (gx * c010 + fx * c110))
                + fz * (gy * (gx * c001 + fx * c101) + fy * (gx * c011 + fx * c111)),
        )
    }

    /// 在网格坐标 `p` 处三线性插值.
    pub fn probe(&self, p: &Vector3<f64>) -> Option<f64> {
        let c = self.continuous_index(p);
        if c.iter().any(|v| !(*v >= 0.0)) {
            return None;
        }
        let idx = c.map(|v| v.floor() as usize);
        let frac = [0, 1, 2].map(|a| c[a] - idx[a] as f64);
        self.trilinear_interpolation(idx, frac)
    }

    // ---------------- 降采样 ----------------

    fn derive_downsampled(&self, grid: DataGrid, factor: [usize; 3], averaged: bool) -> Self {
        let delta = [0, 1, 2].map(|a| self.delta[a] * factor[a] as f64);
        let offset = if averaged {
            self.offset
                + Vector3::from_fn(|a, _| 0.5 * (factor[a] - 1) as f64 * self.delta[a])
        } else {
            self.offset
        };
        let mut out = Self::from_parts(grid, delta, offset);
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        // 两种降采样的矩阵平移都移到块中央.
        out.update_matrices(|m| {
            for a in 0..3 {
                let col = column(m, a);
                let t = column(m, 3) + col * (0.5 * (factor[a] - 1) as f64);
                set_column(m, 3, &t);
                set_column(m, a, &(col * factor[a] as f64));
            }
        });
        // 裁剪区域换算为覆盖原区域的降采样块.
        let crop = self.crop_region();
        let from = [0, 1, 2].map(|a| crop.from[a] / factor[a]);
        let to = [0, 1, 2].map(|a| (crop.to[a] + factor[a] - 1) / factor[a]);
        out.grid.set_crop_region_exact(Region::new(from, to));
        out
    }

    /// 最近邻降采样.
    pub fn get_downsampled(&self, factor: [usize; 3]) -> RegResult<Self> {
        let grid = self.grid.get_downsampled(factor)?;
        Ok(self.derive_downsampled(grid, factor, false))
    }

    /// 块平均降采样.
    pub fn get_downsampled_and_averaged(&self, factor: [usize; 3]) -> RegResult<Self> {
        let grid = self.grid.get_downsampled_and_averaged(factor)?;
        Ok(self.derive_downsampled(grid, factor, true))
    }

    /// 近似各向同性的降采样因子: 在原本就较粗的轴上相应减小因子.
    pub fn isotropic_factor(&self, factor: usize) -> [usize; 3] {
        let min_delta = self.min_delta();
        [0, 1, 2].map(|a| {
            let coarse = ((self.delta[a] / min_delta) as usize).max(1);
            (factor / coarse).max(1)
        })
    }

    /// 近似各向同性的块平均降采样.
    pub fn get_downsampled_isotropic(&self, factor: usize) -> RegResult<Self> {
        self.get_downsampled_and_averaged(self.isotropic_factor(factor))
    }

    // ---------------- 重定向与镜像 ----------------

    /// 重定向到方向代码 `code`, 物理坐标不变.
    pub fn get_reoriented(&self, code: &str) -> RegResult<Self> {
        let perm = PermutationMatrix::new(self.dims(), &self.grid.current_orientation(), code)?;
        let grid = self.grid.permuted(&perm, code);
        let delta = perm.permute(self.delta);
        let offset = perm.permute([self.offset[0], self.offset[1], self.offset[2]]);
        let mut out = Self::from_parts(grid, delta, Vector3::from(offset));
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        out.update_matrices(|m| *m = perm.permute_matrix(m));
        Ok(out)
    }

    /// 当前方向代码 (元信息中记录的).
    pub fn orientation(&self) -> Option<&str> {
        self.meta().get(META_IMAGE_ORIENTATION)
    }

    /// 沿 `axis` 原地镜像数据, 裁剪区域随之镜像.
    pub fn mirror(&mut self, axis: usize) {
        self.grid.mirror_plane_in_place(axis);
        let dims = self.dims();
        let mut crop = self.crop_region();
        let (from, to) = (crop.from[axis], crop.to[axis]);
        crop.from[axis] = dims[axis] - to;
        crop.to[axis] = dims[axis] - from;
        self.grid.set_crop_region_exact(crop);
    }

    // ---------------- 裁剪 ----------------

    /// 以裁剪区域为范围创建新体数据, 原点移至裁剪区域起点.
    pub fn get_cropped_volume(&self) -> RegResult<Self> {
        let grid = self.grid.get_cropped_grid()?;
        let from = self.crop_region().from;
        let offset = self.offset + Vector3::from_fn(|a, _| from[a] as f64 * self.delta[a]);
        let mut out = Self::from_parts(grid, self.delta, offset);
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        out.update_matrices(|m| {
            let mut t = column(m, 3);
            for a in 0..3 {
                t += column(m, a) * from[a] as f64;
            }
            set_column(m, 3, &t);
        });
        Ok(out)
    }

    /// 包含物理区域的网格索引范围, 截断到网格内.
    pub fn get_grid_range(&self, region: &PhysicalRegion) -> Region {
        let dims = self.dims();
        let mut out = Region::default();
        for a in 0..3 {
            let f = ((region.from[a] - self.offset[a]) / self.delta[a]) as i64;
            let t = ((region.to[a] - self.offset[a]) / self.delta[a]) as i64;
            let last = dims[a] as i64 - 1;
            out.from[a] = f.max(0) as usize;
            out.to[a] = (1 + last.min(1 + t)).max(0) as usize;
        }
        out
    }

    // ---------------- 交错子体 ----------------

    /// 沿 `axis` 每 `factor` 层取一层 (从第 `idx` 层开始), 得到更小的网格.
    pub fn get_interleaved_sub_volume(&self, axis: usize, factor: usize, idx: usize) -> RegResult<Self> {
        if axis > 2 || factor == 0 || idx >= factor {
            return Err(RegError::invalid(format!(
                "bad interleave axis {axis}, factor {factor}, index {idx}"
            )));
        }
        let data = self.require_data()?;
        let mut dims = self.dims();
        dims[axis] = dims[axis] / factor + usize::from(dims[axis] % factor > idx);
        let mut delta = self.delta;
        delta[axis] *= factor as f64;
        let mut offset = self.offset;
        offset[axis] += idx as f64 * self.delta[axis];

        let mut grid = DataGrid::new(dims);
        let mut dst = data.new_template(grid.num_voxels());
        for i in 0..dims[axis] {
            self.grid.copy_plane_to(&mut dst, dims, axis, idx + i * factor, i)?;
        }
        grid.set_data(dst)?;
        *grid.meta_mut() = self.meta().clone();

        let mut out = Self::from_parts(grid, delta, offset);
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        out.update_matrices(|m| {
            let col = column(m, axis);
            let t = column(m, 3) + col * idx as f64;
            set_column(m, 3, &t);
            set_column(m, axis, &(col * factor as f64));
        });
        Ok(out)
    }

    /// 与 [`Self::get_interleaved_sub_volume`] 相同的选层, 但保持原网格大小,
    /// 未选中的层为零.
    pub fn get_interleaved_padded_sub_volume(&self, axis: usize, factor: usize, idx: usize) -> RegResult<Self> {
        if axis > 2 || factor == 0 || idx >= factor {
            return Err(RegError::invalid(format!(
                "bad interleave axis {axis}, factor {factor}, index {idx}"
            )));
        }
        let data = self.require_data()?;
        let dims = self.dims();
        let mut dst = data.new_template(self.num_voxels());
        let mut plane = idx;
        while plane < dims[axis] {
            self.grid.copy_plane_to(&mut dst, dims, axis, plane, plane)?;
            plane += factor;
        }
        let mut grid = DataGrid::with_data(dims, dst)?;
        *grid.meta_mut() = self.meta().clone();
        let mut out = Self::from_parts(grid, self.delta, self.offset);
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        Ok(out)
    }

    /// 将若干交错子体沿 `axis` 重新合成为一个体数据.
    ///
    /// 第 `k` 个子体的第 `s` 层成为结果的第 `s * n + k` 层. 各子体平面内维度必须一致,
    /// 交错方向的层数须与第一个子体相同或少一层. `spacing` 缺省时取第一个子体层间距的 `1/n`.
    pub fn stack_interleaved(volumes: &[UniformVolume], axis: usize, spacing: Option<f64>) -> RegResult<Self> {
        let first = volumes.first().ok_or_else(|| RegError::invalid("no volumes to stack"))?;
        if axis > 2 {
            return Err(RegError::invalid(format!("bad interleave axis {axis}")));
        }
        let n = volumes.len();
        let base = first.dims();
        for v in volumes {
            let d = v.dims();
            let in_plane_ok = (0..3).filter(|&a| a != axis).all(|a| d[a] == base[a]);
            let stack_ok = d[axis] == base[axis] || d[axis] + 1 == base[axis];
            if !in_plane_ok || !stack_ok {
                return Err(RegError::GridMismatch { left: base, right: d });
            }
        }
        let mut dims = base;
        dims[axis] = volumes.iter().map(|v| v.dims()[axis]).sum();
        let mut delta = first.delta;
        delta[axis] = spacing.unwrap_or(first.delta[axis] / n as f64);

        let template = first.require_data()?;
        let mut dst = template.new_template(dims.iter().product());
        for (k, v) in volumes.iter().enumerate() {
            for s in 0..v.dims()[axis] {
                v.grid.copy_plane_to(&mut dst, dims, axis, s, s * n + k)?;
            }
        }
        let mut grid = DataGrid::with_data(dims, dst)?;
        *grid.meta_mut() = first.meta().clone();

        let mut out = Self::from_parts(grid, delta, first.offset);
        out.index_to_physical = first.index_to_physical;
        out.alternative = first.alternative.clone();
        let (old_delta, new_delta) = (first.delta[axis], delta[axis]);
        out.update_matrices(|m| {
            let col = column(m, axis) / old_delta * new_delta;
            set_column(m, axis, &col);
        });
        Ok(out)
    }

    // ---------------- 统计 ----------------

    /// 以体素值为权重的质心 (网格坐标), 以及各轴一阶绝对矩 `Σ v |x - c| / Σ v`.
    pub fn center_of_mass(&self) -> RegResult<(Vector3<f64>, Vector3<f64>)> {
        let data = self.require_data()?;
        let mut mass = 0.0;
        let mut com = Vector3::zeros();
        for i in 0..data.len() {
            if let Some(v) = data.get(i) {
                mass += v;
                com += self.grid_location_at(i) * v;
            }
        }
        if mass == 0.0 {
            return Err(RegError::invalid("image has zero total mass"));
        }
        com /= mass;
        let mut moment = Vector3::zeros();
        for i in 0..data.len() {
            if let Some(v) = data.get(i) {
                moment += (self.grid_location_at(i) - com).abs() * v;
            }
        }
        Ok((com, moment / mass))
    }

    /// 主轴. 返回矩阵的每一列为一个单位主轴方向 (按特征值升序), 构成右手系, 以及质心.
    pub fn principal_axes(&self) -> RegResult<(Matrix3<f64>, Vector3<f64>)> {
        let (com, _) = self.center_of_mass()?;
        let data = self.require_data()?;
        let mut inertia = Matrix3::zeros();
        let mut mass = 0.0;
        for i in 0..data.len() {
            if let Some(v) = data.get(i) {
                let d = self.grid_location_at(i) - com;
                inertia += d * d.transpose() * v;
                mass += v;
            }
        }
        inertia /= mass;
        let eigen = SymmetricEigen::new(inertia);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        let mut axes = Matrix3::zeros();
        for (j, &k) in order.iter().enumerate() {
            let v = eigen.eigenvectors.column(k).normalize();
            axes.set_column(j, &v);
        }
        if axes.determinant() < 0.0 {
            let flipped = -axes.column(2).into_owned();
            axes.set_column(2, &flipped);
        }
        Ok((axes, com))
    }

    /// 用同一网格几何创建新体数据, 数据类型为 `ty`.
    pub fn clone_geometry(&self, ty: Option<ScalarType>) -> Self {
        let mut grid = DataGrid::new(self.dims());
        *grid.meta_mut() = self.meta().clone();
        if let Some(ty) = ty {
            grid.create_data_array(ty);
        }
        let mut out = Self::from_parts(grid, self.delta, self.offset);
        out.index_to_physical = self.index_to_physical;
        out.alternative = self.alternative.clone();
        out
    }

    /// 与另一体数据的网格维度是否一致?
    pub fn grid_matches(&self, other: &UniformVolume) -> bool {
        self.dims() == other.dims()
            && (0..3).all(|a| (self.delta[a] - other.delta[a]).abs() <= 1e-6 * self.delta[a].abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: Dims, delta: [f64; 3]) -> UniformVolume {
        let n: usize = dims.iter().product();
        UniformVolume::from_delta(dims, delta)
            .with_data(TypedArray::from_vec((0..n).map(|i| i as f32).collect()))
            .unwrap()
    }

    fn close(a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        (a - b).norm() < 1e-9
    }

    #[test]
    fn test_new_delta_from_size() {
        let v = UniformVolume::new([11, 1, 5], [10.0, 3.0, 0.0]);
        assert_eq!(v.delta(), [1.0, 1.0, 1.0]);
        let v = UniformVolume::new([5, 2, 2], [2.0, 3.0, 4.0]);
        assert_eq!(v.delta(), [0.5, 3.0, 4.0]);
        assert_eq!(v.size(), [2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_downsample_identity() {
        let v = ramp([4, 3, 2], [1.0, 2.0, 3.0]);
        let d = v.get_downsampled([1, 1, 1]).unwrap();
        assert_eq!(d.dims(), v.dims());
        assert_eq!(d.delta(), v.delta());
        assert_eq!(d.data(), v.data());
        assert_eq!(d.index_to_physical(), v.index_to_physical());
    }

    #[test]
    fn test_downsample_matrix_center() {
        let mut v = ramp([5, 5, 5], [1.0, 1.0, 2.0]);
        v.set_alternative_matrix(7, Matrix4::identity());
        let d = v.get_downsampled_and_averaged([2, 1, 1]).unwrap();
        assert_eq!(d.dims(), [3, 5, 5]);
        assert_eq!(d.delta(), [2.0, 1.0, 2.0]);
        assert!(close(&d.offset(), &Vector3::new(0.5, 0.0, 0.0)));
        let p = d.index_to_physical_point([1.0, 0.0, 0.0]);
        assert!(close(&p, &Vector3::new(2.5, 0.0, 0.0)));
        let alt = d.alternative_matrices()[&7];
        assert_eq!(alt[(0, 0)], 2.0);
        assert_eq!(alt[(0, 3)], 0.5);
    }

    #[test]
    fn test_downsample_nearest_matrix() {
        let mut v = ramp([5, 5, 5], [1.0; 3]);
        v.set_alternative_matrix(3, Matrix4::identity());
        let d = v.get_downsampled([2, 1, 1]).unwrap();
        let a = v.get_downsampled_and_averaged([2, 1, 1]).unwrap();
        assert_eq!(d.offset(), v.offset());
        assert_eq!(d.get(1, 0, 0), v.get(2, 0, 0));
        assert_eq!(d.index_to_physical()[(0, 3)], 0.5);
        assert_eq!(d.index_to_physical()[(0, 0)], 2.0);
        assert_eq!(d.index_to_physical(), a.index_to_physical());
        let alt = d.alternative_matrices()[&3];
        assert_eq!(alt[(0, 3)], 0.5);
        assert_eq!(alt[(1, 3)], 0.0);
    }

    #[test]
    fn test_downsample_keeps_crop() {
        let mut v = ramp([9, 6, 4], [1.0; 3]);
        v.set_crop_region([3, 1, 0], [8, 6, 3]);
        let d = v.get_downsampled([2, 2, 1]).unwrap();
        assert_eq!(d.dims(), [5, 3, 4]);
        assert_eq!(d.crop_region(), Region::new([1, 0, 0], [4, 3, 3]));
        let a = v.get_downsampled_and_averaged([2, 2, 1]).unwrap();
        assert_eq!(a.crop_region(), d.crop_region());
        let whole = ramp([5, 5, 5], [1.0; 3]).get_downsampled([2, 2, 2]).unwrap();
        assert_eq!(whole.crop_region(), Region::whole(whole.dims()));
    }

    #[test]
    fn test_isotropic_factor() {
        let v = UniformVolume::from_delta([4, 4, 4], [1.0, 1.0, 3.0]);
        assert_eq!(v.isotropic_factor(4), [4, 4, 1]);
        assert_eq!(v.isotropic_factor(1), [1, 1, 1]);
    }

    #[test]
    fn test_trilinear_missing_corner() {
        let mut v = ramp([3, 3, 3], [1.0; 3]);
        let p = Vector3::new(0.5, 0.5, 0.5);
        assert!(v.probe(&p).is_some());
        let center = v.linear_index(1, 1, 1);
        v.data_mut().unwrap().set_padding_at(center);
        assert!(v.probe(&p).is_none());
        assert!(v.probe(&Vector3::new(1.5, 1.5, 1.5)).is_none());
        assert!(v.probe(&Vector3::new(0.5, 0.5, 0.5)).is_none());
        // 最后一层不满足 `idx < dims - 1`.
        assert!(v.probe(&Vector3::new(2.0, 0.5, 0.5)).is_none());
        assert!(v.probe(&Vector3::new(-0.1, 0.5, 0.5)).is_none());
    }

    #[test]
    fn test_trilinear_value() {
        let v = ramp([3, 3, 3], [1.0; 3]);
        // 线性函数 x + 3y + 9z 的插值是精确的.
        let p = Vector3::new(0.25, 1.5, 0.75);
        let expect = 0.25 + 3.0 * 1.5 + 9.0 * 0.75;
        assert!((v.probe(&p).unwrap() - expect).abs() < 1e-9);
    }

    #[test]
    fn test_mirror_updates_crop() {
        let mut v = ramp([10, 4, 4], [1.0; 3]);
        v.set_crop_region([2, 0, 0], [5, 4, 4]);
        let before = v.data().cloned();
        v.mirror(0);
        assert_eq!(v.crop_region().from[0], 5);
        assert_eq!(v.crop_region().to[0], 8);
        v.mirror(0);
        assert_eq!(v.data().cloned(), before);
        assert_eq!(v.crop_region(), Region::new([2, 0, 0], [5, 4, 4]));
    }

    #[test]
    fn test_cropped_volume_geometry() {
        let mut v = ramp([6, 6, 6], [0.5, 1.0, 2.0]);
        v.set_crop_region([2, 1, 3], [4, 4, 6]);
        let c = v.get_cropped_volume().unwrap();
        assert_eq!(c.dims(), [2, 3, 3]);
        assert!(close(&c.offset(), &Vector3::new(1.0, 1.0, 6.0)));
        assert!(close(&c.index_to_physical_point([0.0; 3]), &v.index_to_physical_point([2.0, 1.0, 3.0])));
        assert_eq!(c.get(1, 2, 0), v.get(3, 3, 3));
    }

    #[test]
    fn test_grid_range() {
        let v = UniformVolume::from_delta([10, 10, 10], [1.0; 3]);
        let r = v.get_grid_range(&PhysicalRegion {
            from: Vector3::new(-5.0, 2.5, 3.0),
            to: Vector3::new(4.2, 20.0, 3.0),
        });
        assert_eq!(r.from, [0, 2, 3]);
        assert_eq!(r.to, [6, 10, 5]);
    }

    #[test]
    fn test_interleaved_round_trip() {
        let v = ramp([3, 3, 7], [1.0, 1.0, 1.0]);
        let parts: Vec<_> = (0..3)
            .map(|i| v.get_interleaved_sub_volume(2, 3, i).unwrap())
            .collect();
        assert_eq!(parts[0].dims()[2], 3);
        assert_eq!(parts[1].dims()[2], 2);
        assert_eq!(parts[2].dims()[2], 2);
        assert_eq!(parts[1].delta()[2], 3.0);
        assert_eq!(parts[1].offset()[2], 1.0);
        assert_eq!(parts[1].get(0, 0, 1), v.get(0, 0, 4));
        assert!(close(
            &parts[2].index_to_physical_point([0.0, 0.0, 1.0]),
            &v.index_to_physical_point([0.0, 0.0, 5.0])
        ));

        let merged = UniformVolume::stack_interleaved(&parts, 2, None).unwrap();
        assert_eq!(merged.dims(), v.dims());
        assert_eq!(merged.delta(), v.delta());
        assert_eq!(merged.data(), v.data());
        assert_eq!(merged.index_to_physical(), v.index_to_physical());
    }

    #[test]
    fn test_stack_rejects_mismatch() {
        let a = ramp([3, 3, 4], [1.0; 3]);
        let b = ramp([3, 3, 2], [1.0; 3]);
        assert!(matches!(
            UniformVolume::stack_interleaved(&[a, b], 2, None),
            Err(RegError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_padded_sub_volume() {
        let v = ramp([2, 5, 1], [1.0; 3]);
        let p = v.get_interleaved_padded_sub_volume(1, 2, 1).unwrap();
        assert_eq!(p.dims(), v.dims());
        assert_eq!(p.get(1, 1, 0), v.get(1, 1, 0));
        assert_eq!(p.get(1, 3, 0), v.get(1, 3, 0));
        assert_eq!(p.get(1, 2, 0), Some(0.0));
    }

    #[test]
    fn test_center_of_mass() {
        let mut v = UniformVolume::from_delta([4, 4, 4], [1.0, 2.0, 1.0]);
        v.create_data_array(ScalarType::F32);
        v.set(1, 1, 1, 1.0).unwrap();
        v.set(3, 1, 1, 1.0).unwrap();
        let (com, moment) = v.center_of_mass().unwrap();
        assert!(close(&com, &Vector3::new(2.0, 2.0, 1.0)));
        assert!(close(&moment, &Vector3::new(1.0, 0.0, 0.0)));

        let (axes, _) = v.principal_axes().unwrap();
        // 质量沿 x 分布, 最大特征值对应 x 轴.
        assert!((axes.column(2)[0].abs() - 1.0).abs() < 1e-9);
        assert!(axes.determinant() > 0.0);
    }

    #[test]
    fn test_reoriented_keeps_physical_points() {
        let mut v = ramp([2, 3, 4], [1.0, 2.0, 3.0]);
        v.meta_mut().set(META_IMAGE_ORIENTATION, "RAS");
        let r = v.get_reoriented("PIL").unwrap();
        assert_eq!(r.dims(), [3, 4, 2]);
        assert_eq!(r.delta(), [2.0, 3.0, 1.0]);
        // 新索引 (0, 0, 0) 对应旧索引 (1, 2, 3).
        assert_eq!(r.get(0, 0, 0), v.get(1, 2, 3));
        assert!(close(
            &r.index_to_physical_point([0.0; 3]),
            &v.index_to_physical_point([1.0, 2.0, 3.0])
        ));
    }
}
