//! 附加于体数据和变换上的字符串键值元信息.

use std::collections::BTreeMap;

/// 当前解剖方向代码, 如 `"RAS"`.
pub const META_IMAGE_ORIENTATION: &str = "IMAGE_ORIENTATION";

/// 读入时的原始解剖方向代码. 重定向后保留不变.
pub const META_IMAGE_ORIENTATION_ORIGINAL: &str = "IMAGE_ORIENTATION_ORIGINAL";

/// 物理坐标系的方向代码.
pub const META_SPACE: &str = "SPACE";

/// 变换的源图像路径.
pub const META_XFORM_SOURCE: &str = "XFORM_SOURCE";

/// 变换的目标图像路径.
pub const META_XFORM_TARGET: &str = "XFORM_TARGET";

/// 数据来源文件路径.
pub const META_FS_PATH: &str = "FS_PATH";

/// 有序的字符串键值表. 随拥有者一同克隆.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaInformation(BTreeMap<String, String>);

impl MetaInformation {
    /// 创建空表.
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// 是否存在该键?
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// 写入, 返回旧值.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// 仅当键不存在时写入.
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<String>) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_owned(), value.into());
        }
    }

    /// 删除.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// 按键序遍历.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 条目数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_absent() {
        let mut m = MetaInformation::new();
        m.set(META_IMAGE_ORIENTATION, "LPS");
        m.set_if_absent(META_IMAGE_ORIENTATION_ORIGINAL, "LPS");
        m.set(META_IMAGE_ORIENTATION, "RAS");
        m.set_if_absent(META_IMAGE_ORIENTATION_ORIGINAL, "RAS");
        assert_eq!(m.get(META_IMAGE_ORIENTATION), Some("RAS"));
        assert_eq!(m.get(META_IMAGE_ORIENTATION_ORIGINAL), Some("LPS"));
        assert_eq!(m.len(), 2);
    }
}
