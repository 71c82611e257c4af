//! 体数据的读写.
//!
//! 上层算法只依赖 [`VolumeIO`] 这一按路径读写的接口; [`NiftiVolumeIO`] 是基于 `nifti` 的实现.
//! 读入时由 sform (其次 qform, 再次 pixdim) 建立索引到物理坐标矩阵, 并据此推断方向代码.

pub mod export;

use std::path::Path;

use nalgebra::{Matrix4, Quaternion, UnitQuaternion};
use ndarray::{Array3, ShapeBuilder};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};

use crate::data::meta::{META_FS_PATH, META_IMAGE_ORIENTATION, META_IMAGE_ORIENTATION_ORIGINAL, META_SPACE};
use crate::data::volume::column;
use crate::data::{DataGrid, Scalar, ScalarType, TypedArray, UniformVolume};
use crate::consts::DEFAULT_ORIENTATION;
use crate::{RegError, RegResult};

pub use export::{write_npy, IntensityWindow, SliceWriteVis};

/// 按路径读写体数据.
pub trait VolumeIO {
    /// 读取. `orientation_hint` 给出时, 把结果重定向到该方向代码.
    fn read(&self, path: &Path, orientation_hint: Option<&str>) -> RegResult<UniformVolume>;

    /// 写入.
    fn write(&self, volume: &UniformVolume, path: &Path) -> RegResult<()>;
}

/// `.nii` / `.nii.gz` 读写.
#[derive(Copy, Clone, Debug, Default)]
pub struct NiftiVolumeIO;

/// 由头信息求索引到物理坐标矩阵.
fn header_affine(h: &NiftiHeader) -> Matrix4<f64> {
    if h.sform_code > 0 {
        let mut m = Matrix4::identity();
        for (r, row) in [h.srow_x, h.srow_y, h.srow_z].iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                m[(r, c)] = *v as f64;
            }
        }
        return m;
    }
    let delta = pixel_spacing(h);
    if h.qform_code > 0 {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d)).to_rotation_matrix();
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let mut m = Matrix4::identity();
        for r in 0..3 {
            for c in 0..3 {
                let scale = if c == 2 { delta[c] * qfac } else { delta[c] };
                m[(r, c)] = rotation[(r, c)] * scale;
            }
        }
        m[(0, 3)] = h.quatern_x as f64;
        m[(1, 3)] = h.quatern_y as f64;
        m[(2, 3)] = h.quatern_z as f64;
        return m;
    }
    let mut m = Matrix4::identity();
    for a in 0..3 {
        m[(a, a)] = delta[a];
    }
    m
}

/// pixdim 给出的体素间距. 非正或非有限的分量取 1.
fn pixel_spacing(h: &NiftiHeader) -> [f64; 3] {
    [1, 2, 3].map(|i| {
        let d = (h.pixdim[i] as f64).abs();
        if d.is_finite() && d > 0.0 {
            d
        } else {
            1.0
        }
    })
}

/// 由索引到物理 (RAS) 坐标矩阵推断方向代码: 每个索引轴取其方向向量中绝对值最大的分量.
pub fn orientation_from_matrix(m: &Matrix4<f64>) -> String {
    const LETTERS: [(char, char); 3] = [('R', 'L'), ('A', 'P'), ('S', 'I')];
    let mut used = [false; 3];
    let mut code = String::with_capacity(3);
    for a in 0..3 {
        let col = column(m, a);
        let best = (0..3)
            .filter(|&k| !used[k])
            .max_by(|&i, &j| col[i].abs().total_cmp(&col[j].abs()));
        let Some(k) = best else {
            return DEFAULT_ORIENTATION.to_owned();
        };
        used[k] = true;
        let (pos, neg) = LETTERS[k];
        code.push(if col[k] >= 0.0 { pos } else { neg });
    }
    code
}

/// nifti 数据类型对应的存储类型. 不支持的类型以及带灰度缩放的数据读为 `f32`.
fn scalar_type_of(h: &NiftiHeader) -> ScalarType {
    let scaled = h.scl_slope != 0.0 && (h.scl_slope != 1.0 || h.scl_inter != 0.0);
    if scaled {
        return ScalarType::F32;
    }
    match h.data_type() {
        Ok(NiftiType::Int8) => ScalarType::I8,
        Ok(NiftiType::Uint8) => ScalarType::U8,
        Ok(NiftiType::Int16) => ScalarType::I16,
        Ok(NiftiType::Uint16) => ScalarType::U16,
        Ok(NiftiType::Int32) => ScalarType::I32,
        Ok(NiftiType::Uint32) => ScalarType::U32,
        Ok(NiftiType::Float64) => ScalarType::F64,
        _ => ScalarType::F32,
    }
}

impl VolumeIO for NiftiVolumeIO {
    fn read(&self, path: &Path, orientation_hint: Option<&str>) -> RegResult<UniformVolume> {
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let ndim = (header.dim[0] as usize).clamp(1, 7);
        let dims = [1, 2, 3].map(|i| if i <= ndim { (header.dim[i] as usize).max(1) } else { 1 });
        let n: usize = dims.iter().product();
        let ty = scalar_type_of(&header);

        let arr = obj.into_volume().into_ndarray::<f64>()?;
        if arr.len() < n {
            return Err(RegError::invalid(format!(
                "{} holds {} voxels, expected {n}",
                path.display(),
                arr.len()
            )));
        }
        if arr.len() > n {
            tracing::warn!("{} has more than three dimensions, reading the first volume", path.display());
        }
        // 转置后的逻辑顺序即 x 最快.
        let values: Vec<f64> = arr.t().iter().take(n).copied().collect();
        let data = TypedArray::from_vec(values).convert(ty);

        let mut grid = DataGrid::with_data(dims, data)?;
        let matrix = header_affine(&header);
        let code = orientation_from_matrix(&matrix);
        let meta = grid.meta_mut();
        meta.set(META_IMAGE_ORIENTATION, code.as_str());
        meta.set(META_IMAGE_ORIENTATION_ORIGINAL, code.as_str());
        meta.set(META_SPACE, DEFAULT_ORIENTATION);
        meta.set(META_FS_PATH, path.to_string_lossy());

        let mut volume = UniformVolume::from_grid(grid, pixel_spacing(&header));
        volume.set_index_to_physical(matrix);
        tracing::debug!("read {} as {ty} {:?}, orientation {code}", path.display(), dims);

        match orientation_hint {
            Some(hint) if hint != code => volume.get_reoriented(hint),
            _ => Ok(volume),
        }
    }

    fn write(&self, volume: &UniformVolume, path: &Path) -> RegResult<()> {
        let data = volume.require_data()?;
        let [nx, ny, nz] = volume.dims();
        let delta = volume.delta();
        let m = volume.index_to_physical();

        let mut header = NiftiHeader::default();
        header.pixdim[0] = 1.0;
        for a in 0..3 {
            header.pixdim[a + 1] = delta[a] as f32;
        }
        header.sform_code = 1;
        header.qform_code = 0;
        let row = |r: usize| [0, 1, 2, 3].map(|c| m[(r, c)] as f32);
        header.srow_x = row(0);
        header.srow_y = row(1);
        header.srow_z = row(2);
        header.xyzt_units = 2;

        let fill = data.padding().unwrap_or(f64::NAN);
        let n = data.len();
        let writer = WriterOptions::new(path).reference_header(&header);

        macro_rules! write_as {
            ($t:ty) => {{
                let values: Vec<$t> = (0..n).map(|i| <$t as Scalar>::from_f64(data.get_or(i, fill))).collect();
                let arr = Array3::from_shape_vec((nx, ny, nz).f(), values)
                    .map_err(|e| RegError::invalid(e.to_string()))?;
                writer.write_nifti(&arr)?;
            }};
        }
        match data.scalar_type() {
            ScalarType::I8 => write_as!(i8),
            ScalarType::U8 => write_as!(u8),
            ScalarType::I16 => write_as!(i16),
            ScalarType::U16 => write_as!(u16),
            ScalarType::I32 => write_as!(i32),
            ScalarType::U32 => write_as!(u32),
            ScalarType::F32 => write_as!(f32),
            ScalarType::F64 => write_as!(f64),
        }
        tracing::debug!("wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("reg-berry-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_orientation_from_matrix() {
        let mut m = Matrix4::identity();
        assert_eq!(orientation_from_matrix(&m), "RAS");
        m[(0, 0)] = -1.0;
        m[(1, 1)] = -2.0;
        assert_eq!(orientation_from_matrix(&m), "LPS");

        // 轴交换: 索引 x 指向 S, 索引 z 指向 R.
        let mut m = Matrix4::zeros();
        m[(2, 0)] = 1.0;
        m[(1, 1)] = 1.0;
        m[(0, 2)] = 1.0;
        m[(3, 3)] = 1.0;
        assert_eq!(orientation_from_matrix(&m), "SAR");
    }

    #[test]
    fn test_write_read() {
        let dims = [4, 3, 2];
        let values: Vec<u16> = (0..24).map(|i| i * 3).collect();
        let mut volume = UniformVolume::from_delta(dims, [1.0, 2.0, 3.0])
            .with_data(TypedArray::from_vec(values))
            .unwrap();
        let mut m = *volume.index_to_physical();
        m[(0, 3)] = -10.0;
        volume.set_index_to_physical(m);

        let path = temp_path("rw.nii");
        NiftiVolumeIO.write(&volume, &path).unwrap();
        let back = NiftiVolumeIO.read(&path, None).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(back.dims(), dims);
        assert_eq!(back.delta(), [1.0, 2.0, 3.0]);
        assert_eq!(back.orientation(), Some("RAS"));
        assert_eq!(back.index_to_physical()[(0, 3)], -10.0);
        assert_eq!(back.require_data().unwrap().scalar_type(), ScalarType::U16);
        for i in 0..24 {
            assert_eq!(back.get_at(i), volume.get_at(i));
        }
        assert_eq!(back.get(3, 2, 1), Some(69.0));
    }

    #[test]
    fn test_read_with_hint() {
        let volume = UniformVolume::from_delta([4, 3, 2], [1.0; 3])
            .with_data(TypedArray::from_vec((0..24).map(|i| i as f32).collect()))
            .unwrap();
        let path = temp_path("hint.nii");
        NiftiVolumeIO.write(&volume, &path).unwrap();
        let back = NiftiVolumeIO.read(&path, Some("SAR")).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back.dims(), [2, 3, 4]);
        assert_eq!(back.orientation(), Some("SAR"));
    }

    #[test]
    fn test_missing_file() {
        assert!(NiftiVolumeIO.read(Path::new("/definitely/not/here.nii"), None).is_err());
    }
}
