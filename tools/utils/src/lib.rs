//! 命令行工具依赖的通用组件.

use reg_berry::io::IntensityWindow;
use reg_berry::ExecContext;
use reg_berry::RegResult;

pub mod paths;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 按 `threads` (缺省为 [`cpus`]) 创建执行上下文.
pub fn exec_context(threads: Option<usize>) -> RegResult<ExecContext> {
    let threads = threads.unwrap_or_else(cpus);
    tracing::debug!("using {threads} worker thread(s)");
    ExecContext::new(threads)
}

/// 安装 `tracing` 订阅者. 默认级别为 `info`, 可由 `RUST_LOG` 覆盖.
///
/// 重复调用是无害的: 之后的调用不会替换已安装的订阅者.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 覆盖脑部 T1/T2 加权 MR 常见强度范围的窗口. 窗位为 500, 窗宽为 1000.
#[inline]
pub fn mr_window() -> Option<IntensityWindow> {
    IntensityWindow::new(500.0, 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpus() {
        assert!(cpus() >= 1);
        let ctx = exec_context(Some(2)).unwrap();
        assert_eq!(ctx.threads(), 2);
    }

    #[test]
    fn test_sep_to() {
        let mut buf = Vec::new();
        sep_to(&mut buf).unwrap();
        assert_eq!(buf.len(), SEP.len() + 1);
    }

    #[test]
    fn test_mr_window() {
        let w = mr_window().unwrap();
        assert_eq!(w.lower_bound(), 0.0);
        assert_eq!(w.upper_bound(), 1000.0);
    }
}
