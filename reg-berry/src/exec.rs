//! 执行上下文.
//!
//! 线程池在程序启动时创建一次, 以引用的方式传入每个并行入口.
//! 所有并行循环都按互不重叠的区间划分输出, 归约按平面收集后顺序求和,
//! 因此结果与线程数无关.

use ndarray::{ArrayViewMut1, ArrayViewMut3, Axis};

use crate::{RegError, RegResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use ndarray::Zip;
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, IntoParallelRefMutIterator, ParallelIterator};
        use rayon::slice::ParallelSliceMut;
    }
}

/// 执行上下文. 不开启 `rayon` feature 或只有一个线程时所有操作在调用线程上顺序执行.
#[derive(Debug)]
pub struct ExecContext {
    #[cfg(feature = "rayon")]
    pool: Option<rayon::ThreadPool>,
    threads: usize,
}

impl ExecContext {
    /// 创建拥有 `threads` 个工作线程的上下文. `threads` 为 0 时报错.
    pub fn new(threads: usize) -> RegResult<Self> {
        if threads == 0 {
            return Err(RegError::invalid("thread count must be positive"));
        }
        if threads == 1 {
            return Ok(Self::sequential());
        }
        #[cfg(feature = "rayon")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("reg-berry-{i}"))
            .build()
            .map_err(|e| RegError::invalid(e.to_string()))?;
        Ok(Self {
            #[cfg(feature = "rayon")]
            pool: Some(pool),
            threads,
        })
    }

    /// 单线程上下文.
    pub fn sequential() -> Self {
        Self {
            #[cfg(feature = "rayon")]
            pool: None,
            threads: 1,
        }
    }

    /// 工作线程数.
    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// 将 `data` 按每块 `chunk` 个元素划分 (最后一块可能更短), 对每块执行 `op`,
    /// 按块顺序返回结果. `init` 为每个工作线程创建一份私有暂存区.
    pub fn map_chunks_mut<T, R, S, I, F>(
        &self,
        data: &mut [T],
        chunk: usize,
        init: I,
        op: F,
    ) -> Vec<R>
    where
        T: Send,
        R: Send,
        I: Fn() -> S + Sync + Send,
        F: Fn(&mut S, usize, &mut [T]) -> R + Sync + Send,
    {
        if chunk == 0 || data.is_empty() {
            return Vec::new();
        }
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            return pool.install(|| {
                data.par_chunks_mut(chunk)
                    .enumerate()
                    .map_init(&init, |s, (k, c)| op(s, k, c))
                    .collect()
            });
        }
        let mut scratch = init();
        data.chunks_mut(chunk)
            .enumerate()
            .map(|(k, c)| op(&mut scratch, k, c))
            .collect()
    }

    /// 对 `0..n` 中每个下标执行 `op`, 按下标顺序收集结果.
    pub fn map_range<R, F>(&self, n: usize, op: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            return pool.install(|| (0..n).into_par_iter().map(&op).collect());
        }
        (0..n).map(op).collect()
    }

    /// 对 `data` 中每个元素 (连同其下标) 执行 `op`.
    pub fn for_each_mut<T, F>(&self, data: &mut [T], op: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            pool.install(|| data.par_iter_mut().enumerate().for_each(|(i, v)| op(i, v)));
            return;
        }
        data.iter_mut().enumerate().for_each(|(i, v)| op(i, v))
    }

    /// 对三维视图沿 `axis` 的每条 lane 执行 `op`. `init` 为每个工作线程创建一份私有暂存区.
    pub fn for_each_lane_mut<A, S, I, F>(
        &self,
        mut view: ArrayViewMut3<'_, A>,
        axis: Axis,
        init: I,
        op: F,
    )
    where
        A: Send,
        I: Fn() -> S + Sync + Send,
        F: Fn(&mut S, ArrayViewMut1<'_, A>) + Sync + Send,
    {
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            pool.install(|| {
                Zip::from(view.lanes_mut(axis))
                    .into_par_iter()
                    .for_each_init(&init, |s, (lane,)| op(s, lane))
            });
            return;
        }
        let mut scratch = init();
        for lane in view.lanes_mut(axis) {
            op(&mut scratch, lane);
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::sequential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ExecContext::new(0).is_err());
    }

    #[test]
    fn test_map_chunks_in_order() {
        let ctx = ExecContext::new(3).unwrap();
        let mut data: Vec<u32> = (0..10).collect();
        let sums = ctx.map_chunks_mut(&mut data, 4, || (), |_, k, c| {
            c.iter_mut().for_each(|v| *v += 1);
            (k, c.iter().sum::<u32>())
        });
        assert_eq!(sums, vec![(0, 10), (1, 26), (2, 19)]);
        assert_eq!(data[9], 10);
    }

    #[test]
    fn test_lanes_cover_every_element() {
        let ctx = ExecContext::new(2).unwrap();
        let mut a = Array3::<f64>::zeros((3, 4, 5));
        ctx.for_each_lane_mut(a.view_mut(), Axis(0), Vec::<f64>::new, |buf, mut lane| {
            buf.clear();
            buf.extend(lane.iter().copied());
            lane.iter_mut().for_each(|v| *v += 1.0);
        });
        assert!(a.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_single_thread_is_sequential() {
        let ctx = ExecContext::new(1).unwrap();
        assert_eq!(ctx.threads(), 1);
        let mut data = vec![0usize; 6];
        ctx.for_each_mut(&mut data, |i, v| *v = i * 2);
        assert_eq!(data, vec![0, 2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_map_range() {
        let ctx = ExecContext::sequential();
        assert_eq!(ctx.map_range(4, |i| i * i), vec![0, 1, 4, 9]);
    }
}
