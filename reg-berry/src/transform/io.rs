//! 变换的持久化.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::Xform;
use crate::data::MetaInformation;
use crate::{RegError, RegResult};

/// 变换文件的魔数, 写在压缩流之前.
const XFORM_MAGIC: &[u8; 4] = b"RBXF";

/// 存储单元: 变换本身, 以及源/目标图像路径等元信息.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XformRecord {
    /// 变换.
    pub xform: Xform,

    /// 元信息.
    pub meta: MetaInformation,
}

impl XformRecord {
    /// 不带元信息的记录.
    pub fn new(xform: impl Into<Xform>) -> Self {
        Self {
            xform: xform.into(),
            meta: MetaInformation::default(),
        }
    }
}

/// 按路径读写变换.
pub trait XformIO {
    /// 读取.
    fn read(&self, path: &Path) -> RegResult<XformRecord>;

    /// 写入.
    fn write(&self, record: &XformRecord, path: &Path) -> RegResult<()>;
}

/// `bincode` 编码并经 zlib 压缩的变换文件.
#[derive(Copy, Clone, Debug, Default)]
pub struct BincodeXformIO;

impl XformIO for BincodeXformIO {
    fn read(&self, path: &Path) -> RegResult<XformRecord> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != XFORM_MAGIC {
            return Err(RegError::codec(format!(
                "{} is not a transform file",
                path.display()
            )));
        }
        let decoder = ZlibDecoder::new(reader);
        bincode::deserialize_from(decoder).map_err(RegError::codec)
    }

    fn write(&self, record: &XformRecord, path: &Path) -> RegResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(XFORM_MAGIC)?;
        let mut encoder = ZlibEncoder::new(writer, Compression::best());
        bincode::serialize_into(&mut encoder, record).map_err(RegError::codec)?;
        encoder.finish()?.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::meta::{META_XFORM_SOURCE, META_XFORM_TARGET};
    use crate::transform::{AffineXform, SplineWarpXform};
    use nalgebra::Vector3;

    #[test]
    fn test_write_read() {
        let dir = std::env::temp_dir().join(format!("reg-berry-xform-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("warp.xform");

        let initial = AffineXform::from_translation(Vector3::new(1.0, 2.0, 3.0));
        let mut warp = SplineWarpXform::new([10.0; 3], [5.0; 3], initial).unwrap();
        warp.set_displacement(1, 2, 3, Vector3::new(0.5, 0.0, -0.5));
        let mut record = XformRecord::new(warp);
        record.meta.set(META_XFORM_SOURCE, "moving.nii");
        record.meta.set(META_XFORM_TARGET, "fixed.nii");

        BincodeXformIO.write(&record, &path).unwrap();
        let back = BincodeXformIO.read(&path).unwrap();
        assert_eq!(back, record);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_foreign_file() {
        let path = std::env::temp_dir().join(format!("reg-berry-bad-{}.xform", std::process::id()));
        std::fs::write(&path, b"not a transform").unwrap();
        assert!(matches!(BincodeXformIO.read(&path), Err(RegError::Codec(_))));
        std::fs::remove_file(&path).unwrap();
    }
}
