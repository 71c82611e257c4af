//! reg-berry 的命令行前端.
//!
//! 所有子命令通过 nifti 读写体数据, 可以用 `--config` 指定 JSON 配置文件,
//! 命令行参数会覆盖配置文件中的同名项.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use reg_berry::config::FeatureRule;
use reg_berry::data::ScalarType;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "regtool")]
#[command(about = "Volume utilities: distance maps, EPI unwarping, interleaved-slice reconstruction")]
#[command(version)]
struct Cli {
    /// Number of worker threads (defaults to the number of available cores).
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print geometry, data type and intensity range of a volume.
    Describe(DescribeArgs),

    /// Convert scalar type, flip, mask or crop a volume.
    Convert(ConvertArgs),

    /// Compute the Euclidean distance map of a volume.
    Edt(EdtArgs),

    /// Correct a reversed phase-encoding EPI image pair.
    Unwarp(UnwarpArgs),

    /// Reconstruct an interleaved acquisition by volume injection.
    Inject(InjectArgs),

    /// Split an interleaved volume into its passes.
    Split(SplitArgs),

    /// Interleave several passes back into one volume.
    Unsplit(UnsplitArgs),

    /// Map points read from a file (or stdin) through a chain of transformations.
    XformPoints(XformPointsArgs),
}

#[derive(Debug, Clone, Args)]
struct DescribeArgs {
    /// Input volume.
    input: PathBuf,

    /// Save an 8-bit PNG of one orthogonal slice.
    #[arg(long)]
    slice_png: Option<PathBuf>,

    /// Axis perpendicular to the saved slice.
    #[arg(long, default_value = "2")]
    slice_axis: usize,

    /// Index of the saved slice (defaults to the middle plane).
    #[arg(long)]
    slice_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TypeArg {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl From<TypeArg> for ScalarType {
    fn from(t: TypeArg) -> Self {
        match t {
            TypeArg::I8 => ScalarType::I8,
            TypeArg::U8 => ScalarType::U8,
            TypeArg::I16 => ScalarType::I16,
            TypeArg::U16 => ScalarType::U16,
            TypeArg::I32 => ScalarType::I32,
            TypeArg::U32 => ScalarType::U32,
            TypeArg::F32 => ScalarType::F32,
            TypeArg::F64 => ScalarType::F64,
        }
    }
}

// 操作按固定顺序执行: padding, 掩膜, 翻转, 裁剪, 类型转换.
#[derive(Debug, Clone, Args)]
struct ConvertArgs {
    /// Input volume.
    input: PathBuf,

    /// Output volume.
    out: PathBuf,

    /// Scalar type of the output data.
    #[arg(long = "type", value_enum)]
    scalar_type: Option<TypeArg>,

    /// Treat this input value as padding.
    #[arg(long, allow_negative_numbers = true)]
    set_padding: Option<f64>,

    /// Binary mask: voxels where the mask is zero become padding.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Inverse binary mask: voxels where the mask is not zero become padding.
    #[arg(long)]
    mask_inverse: Option<PathBuf>,

    /// Mirror along x.
    #[arg(long)]
    flip_x: bool,

    /// Mirror along y.
    #[arg(long)]
    flip_y: bool,

    /// Mirror along z.
    #[arg(long)]
    flip_z: bool,

    /// Crop region `x0,y0,z0,x1,y1,z1` in grid indices; negative values count from the far end.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    crop: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RuleArg {
    Exact,
    Threshold,
    Window,
    NonZero,
}

impl From<RuleArg> for FeatureRule {
    fn from(r: RuleArg) -> Self {
        match r {
            RuleArg::Exact => FeatureRule::Exact,
            RuleArg::Threshold => FeatureRule::Threshold,
            RuleArg::Window => FeatureRule::Window,
            RuleArg::NonZero => FeatureRule::NonZero,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct EdtArgs {
    /// Input volume.
    input: PathBuf,

    /// Output volume (defaults to `<input>_edt.nii.gz`).
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// JSON distance map configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Feature voxel rule.
    #[arg(long, value_enum)]
    rule: Option<RuleArg>,

    /// Rule parameter.
    #[arg(long)]
    value: Option<f64>,

    /// Half width of the `window` rule.
    #[arg(long)]
    window: Option<f64>,

    /// Measure distances inside the feature region instead.
    #[arg(long)]
    inside: bool,

    /// Write squared distances.
    #[arg(long)]
    squared: bool,
}

#[derive(Debug, Clone, Args)]
struct UnwarpArgs {
    /// Image acquired with forward phase encoding.
    #[arg(long)]
    forward: PathBuf,

    /// Image acquired with reverse phase encoding.
    #[arg(long)]
    reverse: PathBuf,

    /// Output directory (defaults to the directory of the forward image).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// JSON unwarp configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Phase-encoding axis (0, 1 or 2).
    #[arg(long)]
    phase_encode_axis: Option<usize>,

    /// L-BFGS iterations per smoothing level.
    #[arg(long)]
    iterations: Option<usize>,

    /// Smoothness weight.
    #[arg(long)]
    smoothness: Option<f64>,

    /// Folding prevention weight.
    #[arg(long)]
    folding: Option<f64>,

    /// Smoothing sigma of the first level.
    #[arg(long)]
    sigma_max: Option<f64>,

    /// Smallest smoothing sigma.
    #[arg(long)]
    sigma_min: Option<f64>,

    /// Sigma decrement between levels.
    #[arg(long)]
    sigma_step: Option<f64>,

    /// Start from zero deformation instead of the center-of-mass shift.
    #[arg(long)]
    no_com_init: bool,

    /// Also write the deformation fields as `.npy` arrays.
    #[arg(long)]
    write_fields: bool,
}

#[derive(Debug, Clone, Args)]
struct InjectArgs {
    /// Interleaved input volume.
    input: PathBuf,

    /// Number of passes.
    #[arg(long)]
    factor: usize,

    /// Interleave axis (guessed from the grid when omitted).
    #[arg(long)]
    axis: Option<usize>,

    /// Output volume (defaults to `<input>_injected.nii.gz`).
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// JSON injection configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use isotropic (physical distance) injection.
    #[arg(long)]
    isotropic: bool,

    /// Kernel sigma, physical for isotropic injection, grid units otherwise.
    #[arg(long)]
    sigma: Option<f64>,

    /// Kernel radius, physical for isotropic injection, grid units otherwise.
    #[arg(long)]
    radius: Option<f64>,

    /// Affine transformation file per pass, in pass order.
    #[arg(long = "xform")]
    xforms: Vec<PathBuf>,

    /// Weight per pass, in pass order.
    #[arg(long = "weight")]
    weights: Vec<f64>,
}

#[derive(Debug, Clone, Args)]
struct SplitArgs {
    /// Interleaved input volume.
    input: PathBuf,

    /// Number of passes.
    #[arg(long)]
    factor: usize,

    /// Interleave axis (guessed from the grid when omitted).
    #[arg(long)]
    axis: Option<usize>,

    /// Keep the full grid, zeroing the planes of other passes.
    #[arg(long)]
    padded: bool,

    /// Output directory (defaults to the directory of the input).
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct UnsplitArgs {
    /// Pass volumes, in pass order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Interleave axis.
    #[arg(long, default_value = "2")]
    axis: usize,

    /// Plane spacing of the result (defaults to the pass spacing divided by the pass count).
    #[arg(long)]
    spacing: Option<f64>,

    /// Output volume.
    #[arg(long, short)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct XformPointsArgs {
    /// Transformation files, applied in order.
    #[arg(long = "xform", required = true)]
    xforms: Vec<PathBuf>,

    /// Zero-based positions of transformations to apply inversely.
    #[arg(long = "invert")]
    inverted: Vec<usize>,

    /// Point file with one `x y z` triple per line (defaults to stdin).
    #[arg(long)]
    points: Option<PathBuf>,

    /// Tolerance of numerical inversion.
    #[arg(long)]
    epsilon: Option<f64>,

    /// Append the Jacobian determinant of the chain at each point.
    #[arg(long)]
    jacobian: bool,
}

fn main() -> CliResult<()> {
    utils::init_tracing();

    let cli = Cli::parse();
    let ctx = utils::exec_context(cli.threads)?;

    match cli.command {
        Commands::Describe(args) => commands::describe(&args),
        Commands::Convert(args) => commands::convert(&args),
        Commands::Edt(args) => commands::edt(&ctx, &args),
        Commands::Unwarp(args) => commands::unwarp(&ctx, &args),
        Commands::Inject(args) => commands::inject(&ctx, &args),
        Commands::Split(args) => commands::split(&args),
        Commands::Unsplit(args) => commands::unsplit(&args),
        Commands::XformPoints(args) => commands::xform_points(&args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_edt() {
        let cli = Cli::parse_from(["regtool", "--threads", "3", "edt", "in.nii", "--rule", "non-zero", "--inside"]);
        assert_eq!(cli.threads, Some(3));
        let Commands::Edt(args) = cli.command else {
            panic!("expected edt");
        };
        assert_eq!(args.rule, Some(RuleArg::NonZero));
        assert!(args.inside);
        assert!(!args.squared);
    }

    #[test]
    fn test_parse_convert() {
        let cli = Cli::parse_from([
            "regtool", "convert", "in.nii", "out.nii", "--type", "u16", "--flip-y", "--crop", "1,0,0,-1,-2,4",
        ]);
        let Commands::Convert(args) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(args.scalar_type, Some(TypeArg::U16));
        assert!(args.flip_y && !args.flip_x);
        assert_eq!(args.crop, Some(vec![1, 0, 0, -1, -2, 4]));
        assert!(args.mask.is_none());
    }

    #[test]
    fn test_parse_xform_points() {
        let cli = Cli::parse_from(["regtool", "xform-points", "--xform", "a.xf", "--xform", "b.xf", "--invert", "1"]);
        let Commands::XformPoints(args) = cli.command else {
            panic!("expected xform-points");
        };
        assert_eq!(args.xforms.len(), 2);
        assert_eq!(args.inverted, vec![1]);
    }
}
