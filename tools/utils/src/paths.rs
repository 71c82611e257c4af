//! 输入输出路径的推导.

use std::env;
use std::path::{Path, PathBuf};

/// 数据目录的环境变量.
pub const DATA_DIR_ENV: &str = "REG_BERRY_DATA_DIR";

/// 获取数据基本路径.
///
/// 1. 若环境变量 `$REG_BERRY_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/reg-data`. 无法确定主目录时返回 `None`.
pub fn data_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var(DATA_DIR_ENV) {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dirs::home_dir().map(|h| h.join("reg-data")),
    }
}

/// 解析输入路径: 相对路径在当前目录下不存在时, 尝试数据目录.
pub fn resolve_input<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }
    match data_dir_from_env_or_home().map(|d| d.join(path)) {
        Some(p) if p.exists() => p,
        _ => path.to_path_buf(),
    }
}

/// 去掉 `.nii` 或 `.nii.gz` 后缀的文件名主干.
pub fn nifti_stem(path: &Path) -> String {
    let name = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem.to_owned();
        }
    }
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
        _ => name,
    }
}

/// 与 `input` 同目录, 主干追加 `suffix` 的 `.nii.gz` 输出路径.
///
/// `derived_path("a/b.nii", "_edt")` 为 `a/b_edt.nii.gz`.
pub fn derived_path(input: &Path, suffix: &str) -> PathBuf {
    let name = format!("{}{suffix}.nii.gz", nifti_stem(input));
    match input.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nifti_stem() {
        assert_eq!(nifti_stem(Path::new("a/b.nii.gz")), "b");
        assert_eq!(nifti_stem(Path::new("b.nii")), "b");
        assert_eq!(nifti_stem(Path::new("dir/c.xform")), "c");
        assert_eq!(nifti_stem(Path::new("plain")), "plain");
    }

    #[test]
    fn test_derived_path() {
        assert_eq!(derived_path(Path::new("a/b.nii"), "_edt"), PathBuf::from("a/b_edt.nii.gz"));
        assert_eq!(derived_path(Path::new("b.nii.gz"), "_1"), PathBuf::from("b_1.nii.gz"));
    }

    #[test]
    fn test_resolve_absolute() {
        let p = Path::new("/definitely/not/here.nii");
        assert_eq!(resolve_input(p), p);
    }
}
