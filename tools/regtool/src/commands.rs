//! 子命令的实现.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use reg_berry::config::{DistanceMapConfig, InjectionConfig, UnwarpConfig};
use reg_berry::consts::AXIS_Z;
use reg_berry::data::{ScalarType, UniformVolume};
use reg_berry::distance::distance_map;
use reg_berry::epi::{EpiUnwarp, PhaseDirection};
use reg_berry::io::{IntensityWindow, NiftiVolumeIO, SliceWriteVis, VolumeIO};
use reg_berry::progress::LogProgress;
use reg_berry::recon::{guess_interleave_axis, VolumeInjection};
use reg_berry::transform::{AffineXform, BincodeXformIO, Xform, XformIO, XformList};
use reg_berry::{ExecContext, RegError};
use serde::de::DeserializeOwned;
use utils::paths::{derived_path, nifti_stem, resolve_input};

use crate::{
    CliResult, ConvertArgs, DescribeArgs, EdtArgs, InjectArgs, SplitArgs, UnsplitArgs, UnwarpArgs,
    XformPointsArgs,
};

/// 读入 JSON 配置; 未给出路径时使用默认值.
fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> CliResult<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = fs::read_to_string(path)?;
    let cfg = serde_json::from_str(&text)?;
    tracing::info!("loaded configuration from {}", path.display());
    Ok(cfg)
}

fn read_volume(path: &Path) -> CliResult<UniformVolume> {
    let path = resolve_input(path);
    Ok(NiftiVolumeIO.read(&path, None)?)
}

fn write_volume(volume: &UniformVolume, path: &Path) -> CliResult<()> {
    NiftiVolumeIO.write(volume, path)?;
    tracing::info!("wrote {}", path.display());
    Ok(())
}

/// `dir` 给出时把推导出的文件名放到 `dir` 下.
fn output_in(dir: Option<&Path>, input: &Path, suffix: &str) -> PathBuf {
    let path = derived_path(input, suffix);
    match (dir, path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path,
    }
}

fn check_axis(axis: usize) -> CliResult<()> {
    if axis > 2 {
        return Err(RegError::invalid(format!("axis {axis} out of range")).into());
    }
    Ok(())
}

pub(crate) fn describe(args: &DescribeArgs) -> CliResult<()> {
    let volume = read_volume(&args.input)?;
    let data = volume.require_data()?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    utils::sep_to(&mut out)?;
    writeln!(out, "file        : {}", args.input.display())?;
    writeln!(out, "dims        : {:?}", volume.dims())?;
    writeln!(out, "spacing     : {:?}", volume.delta())?;
    writeln!(out, "size        : {:?}", volume.size())?;
    writeln!(out, "orientation : {}", volume.orientation().unwrap_or("?"))?;
    writeln!(out, "scalar type : {}", data.scalar_type())?;
    match data.range() {
        Some((lo, hi)) => writeln!(out, "range       : [{lo}, {hi}]")?,
        None => writeln!(out, "range       : (no valid voxels)")?,
    }
    writeln!(out, "valid       : {}/{}", data.valid_count(), data.len())?;
    if let Ok((com, _)) = volume.center_of_mass() {
        writeln!(out, "mass center : ({:.3}, {:.3}, {:.3})", com.x, com.y, com.z)?;
    }
    for (key, value) in volume.meta().iter() {
        writeln!(out, "meta {key} = {value}")?;
    }
    utils::sep_to(&mut out)?;

    if let Some(png) = &args.slice_png {
        check_axis(args.slice_axis)?;
        let plane = args.slice_index.unwrap_or(volume.dims()[args.slice_axis] / 2);
        let window = data
            .range()
            .and_then(|(lo, hi)| IntensityWindow::from_range(lo, hi))
            .or_else(utils::mr_window)
            .ok_or_else(|| RegError::invalid("no usable intensity window"))?;
        volume.get_ortho_slice(args.slice_axis, plane)?.save(&window, png)?;
        tracing::info!("wrote {}", png.display());
    }
    Ok(())
}

/// 读入掩膜, 方向与 `volume` 不同时先重定向.
fn read_mask(path: &Path, volume: &UniformVolume) -> CliResult<UniformVolume> {
    let mask = read_volume(path)?;
    match (mask.orientation(), volume.orientation()) {
        (Some(from), Some(to)) if from != to => {
            tracing::info!("reorienting mask from {from} to {to}");
            Ok(mask.get_reoriented(to)?)
        }
        _ => Ok(mask),
    }
}

pub(crate) fn convert(args: &ConvertArgs) -> CliResult<()> {
    let mut volume = read_volume(&args.input)?;
    if let Some(pad) = args.set_padding {
        volume.data_mut().ok_or(RegError::NoData)?.set_padding_value(Some(pad));
    }
    for (path, inverse) in [(&args.mask, false), (&args.mask_inverse, true)] {
        if let Some(path) = path {
            let mask = read_mask(path, &volume)?;
            volume.apply_mask(&mask, inverse)?;
        }
    }
    for (axis, flip) in [args.flip_x, args.flip_y, args.flip_z].into_iter().enumerate() {
        if flip {
            volume.mirror(axis);
        }
    }
    if let Some(crop) = &args.crop {
        let [x0, y0, z0, x1, y1, z1] = crop[..] else {
            return Err(RegError::invalid(format!("crop needs six values, got {}", crop.len())).into());
        };
        let region = volume.set_crop_region([x0, y0, z0], [x1, y1, z1]);
        if region.is_empty() {
            return Err(RegError::invalid(format!("empty crop region {region:?}")).into());
        }
        volume = volume.get_cropped_volume()?;
    }
    if let Some(ty) = args.scalar_type.map(ScalarType::from) {
        let data = volume.require_data()?;
        if data.scalar_type() != ty {
            let converted = data.convert(ty);
            volume.set_data(converted)?;
        }
    }
    write_volume(&volume, &args.out)
}

pub(crate) fn edt(ctx: &ExecContext, args: &EdtArgs) -> CliResult<()> {
    let mut cfg: DistanceMapConfig = load_config(args.config.as_deref())?;
    if let Some(rule) = args.rule {
        cfg.rule = rule.into();
    }
    if let Some(value) = args.value {
        cfg.value = value;
    }
    if let Some(window) = args.window {
        cfg.window = window;
    }
    cfg.inside |= args.inside;
    cfg.squared |= args.squared;

    let volume = read_volume(&args.input)?;
    let map = distance_map(ctx, &volume, &cfg, &LogProgress::new())?;
    let path = args.out.clone().unwrap_or_else(|| derived_path(&args.input, "_edt"));
    write_volume(&map, &path)
}

pub(crate) fn unwarp(ctx: &ExecContext, args: &UnwarpArgs) -> CliResult<()> {
    let mut cfg: UnwarpConfig = load_config(args.config.as_deref())?;
    if let Some(axis) = args.phase_encode_axis {
        cfg.phase_encode_axis = axis;
    }
    if let Some(n) = args.iterations {
        cfg.iterations = n;
    }
    if let Some(w) = args.smoothness {
        cfg.smoothness_weight = w;
    }
    if let Some(w) = args.folding {
        cfg.folding_weight = w;
    }
    if let Some(s) = args.sigma_max {
        cfg.smooth_sigma_max = s;
    }
    if let Some(s) = args.sigma_min {
        cfg.smooth_sigma_min = s;
    }
    if let Some(s) = args.sigma_step {
        cfg.smooth_sigma_diff = s;
    }
    if args.no_com_init {
        cfg.init_shift_com = false;
    }
    cfg.validate()?;

    let fwd = read_volume(&args.forward)?;
    let rev = read_volume(&args.reverse)?;
    let mut functional = EpiUnwarp::from_config(&fwd, &rev, &cfg)?;
    let reports = functional.optimize_config(ctx, &cfg, &LogProgress::new())?;
    for r in &reports {
        tracing::info!(
            "sigma {:.2}: f = {:.6e}, msd = {:.6e}, {} iteration(s), {:?}",
            r.sigma,
            r.f,
            r.msd,
            r.iterations,
            r.status
        );
    }

    let dir = args
        .out_dir
        .clone()
        .or_else(|| args.forward.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = nifti_stem(&args.forward);
    for (direction, tag) in [(PhaseDirection::Forward, "fwd"), (PhaseDirection::Reverse, "rev")] {
        let corrected = functional.corrected_image(direction)?;
        write_volume(&corrected, &dir.join(format!("{stem}_unwarp_{tag}.nii.gz")))?;
        let jacobian = functional.jacobian_map(direction)?;
        write_volume(&jacobian, &dir.join(format!("{stem}_jacobian_{tag}.nii.gz")))?;
        if args.write_fields {
            let path = dir.join(format!("{stem}_deformation_{tag}.npy"));
            ndarray_npy::write_npy(&path, &functional.deformation_field(direction)?)?;
            tracing::info!("wrote {}", path.display());
        }
    }
    Ok(())
}

/// 读入仿射变换文件. 形变场不能用于注入.
fn read_affine(path: &Path) -> CliResult<AffineXform> {
    match BincodeXformIO.read(&resolve_input(path))?.xform {
        Xform::Affine(a) => Ok(a),
        Xform::Spline(_) => Err(RegError::invalid(format!(
            "{} holds a deformation, expected an affine transformation",
            path.display()
        ))
        .into()),
    }
}

pub(crate) fn inject(ctx: &ExecContext, args: &InjectArgs) -> CliResult<()> {
    let mut cfg: InjectionConfig = load_config(args.config.as_deref())?;
    cfg.isotropic |= args.isotropic;
    if let Some(s) = args.sigma {
        if cfg.isotropic {
            cfg.kernel_sigma = s;
        } else {
            cfg.kernel_sigma_factor = s;
        }
    }
    if let Some(r) = args.radius {
        if cfg.isotropic {
            cfg.kernel_radius = r;
        } else {
            cfg.kernel_radius_factor = r;
        }
    }
    cfg.validate()?;

    let image = read_volume(&args.input)?;
    let axis = args.axis.unwrap_or_else(|| guess_interleave_axis(&image, AXIS_Z));
    check_axis(axis)?;
    tracing::info!("{} passes along axis {axis}", args.factor);

    let mut injection = VolumeInjection::from_interleaved(&image, args.factor, axis)?;
    if !args.xforms.is_empty() {
        let xforms = args.xforms.iter().map(|p| read_affine(p)).collect::<CliResult<Vec<_>>>()?;
        injection.set_transformations(xforms)?;
    }
    for (pass, &w) in args.weights.iter().enumerate() {
        injection.set_pass_weight(pass, w)?;
    }
    injection.inject(ctx, &cfg, &LogProgress::new())?;

    let path = args.out.clone().unwrap_or_else(|| derived_path(&args.input, "_injected"));
    write_volume(injection.corrected_image(), &path)
}

pub(crate) fn split(args: &SplitArgs) -> CliResult<()> {
    let image = read_volume(&args.input)?;
    let axis = args.axis.unwrap_or_else(|| guess_interleave_axis(&image, AXIS_Z));
    check_axis(axis)?;
    for idx in 0..args.factor {
        let pass = if args.padded {
            image.get_interleaved_padded_sub_volume(axis, args.factor, idx)?
        } else {
            image.get_interleaved_sub_volume(axis, args.factor, idx)?
        };
        let path = output_in(args.out_dir.as_deref(), &args.input, &format!("_pass{idx}"));
        write_volume(&pass, &path)?;
    }
    Ok(())
}

pub(crate) fn unsplit(args: &UnsplitArgs) -> CliResult<()> {
    let volumes = args.inputs.iter().map(|p| read_volume(p)).collect::<CliResult<Vec<_>>>()?;
    let stacked = UniformVolume::stack_interleaved(&volumes, args.axis, args.spacing)?;
    write_volume(&stacked, &args.out)
}

/// 解析一行点坐标. 空行与 `#` 开头的注释行返回 `None`.
fn parse_point(line: &str) -> CliResult<Option<Vector3<f64>>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let coords = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()?;
    match coords[..] {
        [x, y, z] => Ok(Some(Vector3::new(x, y, z))),
        _ => Err(RegError::invalid(format!("expected three coordinates, got `{line}`")).into()),
    }
}

pub(crate) fn xform_points(args: &XformPointsArgs) -> CliResult<()> {
    let mut list = XformList::new();
    for (i, path) in args.xforms.iter().enumerate() {
        let record = BincodeXformIO.read(&resolve_input(path))?;
        list.add(record.xform, args.inverted.contains(&i), 1.0);
    }
    if let Some(eps) = args.epsilon {
        list.set_epsilon(eps);
    }

    let reader: Box<dyn BufRead> = match &args.points {
        Some(p) => Box::new(BufReader::new(fs::File::open(p)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in reader.lines() {
        let Some(v) = parse_point(&line?)? else {
            continue;
        };
        match list.apply(&v) {
            Ok(p) if args.jacobian => {
                let j = list.get_jacobian(&v, true)?;
                writeln!(out, "{} {} {} {j}", p.x, p.y, p.z)?;
            }
            Ok(p) => writeln!(out, "{} {} {}", p.x, p.y, p.z)?,
            Err(e) if e.is_numerical() => {
                tracing::warn!("({}, {}, {}): {e}", v.x, v.y, v.z);
                writeln!(out, "nan nan nan")?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("  ").unwrap(), None);
        assert_eq!(parse_point("# comment").unwrap(), None);
        assert_eq!(parse_point("1 2.5 -3").unwrap(), Some(Vector3::new(1.0, 2.5, -3.0)));
        assert_eq!(parse_point("1,2,3").unwrap(), Some(Vector3::new(1.0, 2.0, 3.0)));
        assert!(parse_point("1 2").is_err());
        assert!(parse_point("1 2 x").is_err());
    }

    #[test]
    fn test_load_config() {
        let cfg: UnwarpConfig = load_config(None).unwrap();
        assert_eq!(cfg.iterations, UnwarpConfig::default().iterations);

        let path = std::env::temp_dir().join(format!("regtool-cfg-{}.json", std::process::id()));
        fs::write(&path, r#"{ "iterations": 3, "folding_weight": 0.5 }"#).unwrap();
        let cfg: UnwarpConfig = load_config(Some(&path)).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cfg.iterations, 3);
        assert_eq!(cfg.folding_weight, 0.5);
        assert_eq!(cfg.lbfgs_memory, UnwarpConfig::default().lbfgs_memory);
    }

    #[test]
    fn test_output_in() {
        let input = Path::new("a/b.nii");
        assert_eq!(output_in(None, input, "_pass0"), PathBuf::from("a/b_pass0.nii.gz"));
        assert_eq!(output_in(Some(Path::new("out")), input, "_pass1"), PathBuf::from("out/b_pass1.nii.gz"));
    }

    #[test]
    fn test_convert_file() {
        let dir = std::env::temp_dir().join(format!("regtool-convert-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("v.nii");
        let mask = dir.join("m.nii");
        let volume = UniformVolume::from_delta([4, 3, 2], [1.0; 3])
            .with_data(reg_berry::data::TypedArray::from_vec((0..24).map(|i| i as f32 + 0.4).collect()))
            .unwrap();
        NiftiVolumeIO.write(&volume, &input).unwrap();
        let m = UniformVolume::from_delta([4, 3, 2], [1.0; 3])
            .with_data(reg_berry::data::TypedArray::from_vec((0..24).map(|i| u8::from(i != 5)).collect()))
            .unwrap();
        NiftiVolumeIO.write(&m, &mask).unwrap();

        let out = dir.join("out.nii");
        convert(&ConvertArgs {
            input: input.clone(),
            out: out.clone(),
            scalar_type: Some(crate::TypeArg::I16),
            set_padding: None,
            mask: Some(mask),
            mask_inverse: None,
            flip_x: true,
            flip_y: false,
            flip_z: false,
            crop: Some(vec![0, 1, 0, 4, 3, 1]),
        })
        .unwrap();
        let back = NiftiVolumeIO.read(&out, None).unwrap();
        let bad_crop = convert(&ConvertArgs {
            input,
            out: dir.join("bad.nii"),
            scalar_type: None,
            set_padding: None,
            mask: None,
            mask_inverse: None,
            flip_x: false,
            flip_y: false,
            flip_z: false,
            crop: Some(vec![0, 0, 0]),
        });
        fs::remove_dir_all(&dir).unwrap();

        assert!(bad_crop.is_err());
        assert_eq!(back.dims(), [4, 2, 1]);
        assert_eq!(back.require_data().unwrap().scalar_type(), ScalarType::I16);
        // 翻转后第 (2, 0) 个体素来自原 (1, 1), 即被掩膜清除的第 5 个体素, 以 i16 的 padding 值写出.
        assert_eq!(back.get(2, 0, 0), Some(i16::MIN as f64));
        assert_eq!(back.get(0, 0, 0), Some(7.0));
        assert_eq!(back.get(3, 1, 0), Some(8.0));
    }

    #[test]
    fn test_split_unsplit_files() {
        let dir = std::env::temp_dir().join(format!("regtool-split-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("v.nii");
        let volume = UniformVolume::from_delta([2, 2, 4], [1.0; 3])
            .with_data(reg_berry::data::TypedArray::from_vec((0..16).map(|i| i as f32).collect()))
            .unwrap();
        NiftiVolumeIO.write(&volume, &input).unwrap();

        split(&SplitArgs {
            input: input.clone(),
            factor: 2,
            axis: Some(2),
            padded: false,
            out_dir: None,
        })
        .unwrap();
        let out = dir.join("back.nii");
        unsplit(&UnsplitArgs {
            inputs: vec![dir.join("v_pass0.nii.gz"), dir.join("v_pass1.nii.gz")],
            axis: 2,
            spacing: None,
            out: out.clone(),
        })
        .unwrap();

        let back = NiftiVolumeIO.read(&out, None).unwrap();
        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(back.dims(), [2, 2, 4]);
        for i in 0..16 {
            assert_eq!(back.get_at(i), Some(i as f64));
        }
    }
}
