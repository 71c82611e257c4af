//! 定长浮点直方图, 用于比较原始图像与重建图像的灰度分布.

/// 在固定值域上等宽分箱的直方图, 箱内为实数权重.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    bins: Vec<f64>,
    lo: f64,
    hi: f64,
}

impl Histogram {
    /// 在 `[lo, hi]` 上创建 `n` 个空箱.
    pub fn new(n: usize, (lo, hi): (f64, f64)) -> Self {
        Self {
            bins: vec![0.0; n],
            lo,
            hi,
        }
    }

    /// 箱数.
    #[inline]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// 是否没有箱?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// 值域.
    #[inline]
    pub fn range(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    /// 各箱权重.
    #[inline]
    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// 清空.
    pub fn reset(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0.0);
    }

    /// 值所在的箱. 值域外的值归入首尾两箱.
    pub fn value_to_bin(&self, v: f64) -> usize {
        let n = self.bins.len();
        let width = self.hi - self.lo;
        if n == 0 || !(width > 0.0) || !(v > self.lo) {
            return 0;
        }
        ((n as f64 * (v - self.lo) / width) as usize).min(n - 1)
    }

    /// 第 `bin` 箱加权重 `w`.
    #[inline]
    pub fn add(&mut self, bin: usize, w: f64) {
        if let Some(b) = self.bins.get_mut(bin) {
            *b += w;
        }
    }

    /// 以 `bin` 为中心加一个对称核. `kernel[i]` 加到距中心 `i` 箱的两侧, 越界部分丢弃.
    pub fn add_weighted_symmetric_kernel(&mut self, bin: usize, kernel: &[f64]) {
        let Some((&center, tail)) = kernel.split_first() else {
            return;
        };
        self.add(bin, center);
        for (i, &w) in tail.iter().enumerate() {
            let d = i + 1;
            if bin >= d {
                self.add(bin - d, w);
            }
            self.add(bin + d, w);
        }
    }

    /// 权重和.
    #[inline]
    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }

    /// 相对于 `reference` 的 KL 散度 `Σ p ln(p / q)`. 两侧归一化后, 只统计两者均为正的箱.
    pub fn kullback_leibler_divergence(&self, reference: &Histogram) -> f64 {
        let (tp, tq) = (self.total(), reference.total());
        if !(tp > 0.0) || !(tq > 0.0) {
            return 0.0;
        }
        self.bins
            .iter()
            .zip(&reference.bins)
            .filter(|(p, q)| **p > 0.0 && **q > 0.0)
            .map(|(p, q)| {
                let (p, q) = (p / tp, q / tq);
                p * (p / q).ln()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_bin() {
        let h = Histogram::new(4, (0.0, 8.0));
        assert_eq!(h.value_to_bin(-1.0), 0);
        assert_eq!(h.value_to_bin(1.9), 0);
        assert_eq!(h.value_to_bin(2.0), 1);
        assert_eq!(h.value_to_bin(8.0), 3);
        assert_eq!(h.value_to_bin(100.0), 3);
        assert_eq!(Histogram::new(4, (1.0, 1.0)).value_to_bin(1.0), 0);
    }

    #[test]
    fn test_symmetric_kernel_clips() {
        let mut h = Histogram::new(5, (0.0, 5.0));
        h.add_weighted_symmetric_kernel(1, &[1.0, 0.5, 0.25]);
        assert_eq!(h.bins(), &[0.5, 1.0, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_kld() {
        let mut p = Histogram::new(3, (0.0, 3.0));
        let mut q = Histogram::new(3, (0.0, 3.0));
        [1.0, 2.0, 1.0].iter().enumerate().for_each(|(i, w)| p.add(i, *w));
        [2.0, 4.0, 2.0].iter().enumerate().for_each(|(i, w)| q.add(i, *w));
        assert!(p.kullback_leibler_divergence(&q).abs() < 1e-15);

        q.reset();
        [1.0, 1.0, 2.0].iter().enumerate().for_each(|(i, w)| q.add(i, *w));
        let expected = 0.25 * (0.25f64 / 0.25).ln() + 0.5 * (0.5f64 / 0.25).ln() + 0.25 * (0.25f64 / 0.5).ln();
        assert!((p.kullback_leibler_divergence(&q) - expected).abs() < 1e-12);
    }
}
