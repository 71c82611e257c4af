//! 长耗时操作的进度汇报.
//!
//! 进度接收端可能被多个工作线程同时调用, 收到的 `current` 不保证单调,
//! 仅用于展示. 接收端可以通过返回 [`ProgressStatus::Interrupt`] 请求中止,
//! 被中止的操作丢弃部分结果并返回 [`crate::RegError::Cancelled`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 进度接收端对一次汇报的答复.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgressStatus {
    /// 继续.
    Ok,

    /// 请求中止当前任务.
    Interrupt,
}

impl ProgressStatus {
    /// 是否请求中止?
    #[inline]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt)
    }
}

/// 轮询式进度接收端.
pub trait ProgressSink: Sync {
    /// 开始一个共 `total` 个单元的任务, 建议每 `interval` 个单元汇报一次.
    fn begin(&self, task: &str, total: usize, interval: usize);

    /// 汇报当前进度.
    fn set_progress(&self, current: usize) -> ProgressStatus;

    /// 任务结束.
    fn done(&self);
}

/// 什么都不做的接收端.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    #[inline]
    fn begin(&self, _task: &str, _total: usize, _interval: usize) {}

    #[inline]
    fn set_progress(&self, _current: usize) -> ProgressStatus {
        ProgressStatus::Ok
    }

    #[inline]
    fn done(&self) {}
}

/// 通过 `tracing` 输出进度的接收端.
///
/// 仅当 `current` 恰为汇报间隔的整数倍时输出.
#[derive(Debug, Default)]
pub struct LogProgress {
    total: AtomicUsize,
    interval: AtomicUsize,
}

impl LogProgress {
    /// 创建.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LogProgress {
    fn begin(&self, task: &str, total: usize, interval: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.interval.store(interval.max(1), Ordering::Relaxed);
        tracing::info!("{task}: {total} units");
    }

    fn set_progress(&self, current: usize) -> ProgressStatus {
        let interval = self.interval.load(Ordering::Relaxed).max(1);
        if current % interval == 0 {
            let total = self.total.load(Ordering::Relaxed).max(1);
            tracing::debug!(
                "progress {current}/{total} ({:.1}%)",
                100.0 * current as f64 / total as f64
            );
        }
        ProgressStatus::Ok
    }

    fn done(&self) {
        tracing::debug!("done");
    }
}

/// 在收到第 `limit` 次汇报后请求中止的接收端.
#[derive(Debug)]
pub struct CancelAfter {
    limit: usize,
    calls: AtomicUsize,
    fired: AtomicBool,
}

impl CancelAfter {
    /// 在第 `limit` 次 `set_progress` 时开始返回 `Interrupt`.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            calls: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
        }
    }

    /// 是否已经请求过中止?
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl ProgressSink for CancelAfter {
    fn begin(&self, _task: &str, _total: usize, _interval: usize) {}

    fn set_progress(&self, _current: usize) -> ProgressStatus {
        let n = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= self.limit {
            self.fired.store(true, Ordering::Release);
            ProgressStatus::Interrupt
        } else {
            ProgressStatus::Ok
        }
    }

    fn done(&self) {}
}

/// 多线程共享的中止标志. 任一线程收到 `Interrupt` 后置位, 其他线程跳过剩余工作.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// 汇报进度, 必要时置位.
    #[inline]
    pub(crate) fn report(&self, sink: &dyn ProgressSink, current: usize) {
        if sink.set_progress(current).is_interrupt() {
            self.0.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_after() {
        let sink = CancelAfter::new(3);
        assert_eq!(sink.set_progress(0), ProgressStatus::Ok);
        assert_eq!(sink.set_progress(1), ProgressStatus::Ok);
        assert!(!sink.fired());
        assert_eq!(sink.set_progress(2), ProgressStatus::Interrupt);
        assert!(sink.fired());
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::default();
        flag.report(&NullProgress, 10);
        assert!(!flag.is_set());
        flag.report(&CancelAfter::new(1), 0);
        assert!(flag.is_set());
    }

    #[test]
    fn test_log_progress_accepts_out_of_order() {
        let sink = LogProgress::new();
        sink.begin("test", 10, 2);
        for i in [5, 1, 9, 0, 3] {
            assert_eq!(sink.set_progress(i), ProgressStatus::Ok);
        }
        sink.done();
    }
}
