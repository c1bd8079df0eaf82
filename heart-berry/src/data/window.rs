use ndarray::{ArrayView3, ArrayViewMut3};
use ordered_float::OrderedFloat;

use crate::config::{EnsembleConfig, Modality};

/// 强度窗口, 包含窗位 (window level) 和窗宽 (window width).
///
/// 窗口内的值线性映射到 `[-1, 1]`, 窗外的值截断到两端.
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntensityWindow {
    level: f32,
    width: f32,
}

impl IntensityWindow {
    /// 构建强度窗.
    ///
    /// `level` 和 `width` 必须是有限值且 `width > 0`, 否则返回 `None`.
    pub fn new(level: f32, width: f32) -> Option<IntensityWindow> {
        if level.is_finite() && width.is_finite() && width > 0.0 {
            Some(Self { level, width })
        } else {
            None
        }
    }

    /// 由下界和上界构建强度窗. 要求 `lower < upper`.
    #[inline]
    pub fn from_bounds(lower: f32, upper: f32) -> Option<IntensityWindow> {
        Self::new((lower + upper) / 2.0, upper - lower)
    }

    /// 心脏 CT 使用的窗口: `[-750, 750]` HU.
    #[inline]
    pub const fn from_ct_heart() -> IntensityWindow {
        Self {
            level: 0.0,
            width: 2.0 * crate::consts::CT_HALF_WINDOW,
        }
    }

    /// 以 `data` 中有限值的 `lower` 和 `upper` 百分位作为窗口上下界.
    ///
    /// 百分位按 numpy 默认的线性插值计算. 若 `data` 没有有限值,
    /// 或两个百分位相等 (如常数图像), 则返回 `None`.
    pub fn from_percentiles(data: ArrayView3<f32>, lower: f64, upper: f64) -> Option<Self> {
        let mut sorted: Vec<OrderedFloat<f32>> = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|v| OrderedFloat(*v))
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let lo = percentile(&sorted, lower);
        let hi = percentile(&sorted, upper);
        Self::from_bounds(lo, hi)
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f32 {
        self.level - self.width / 2.0
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f32 {
        self.level + self.width / 2.0
    }

    /// 窗位.
    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f32 {
        self.width
    }

    /// 求在当前窗设置下, 原始强度 `v` 对应的网络输入值 (-1.0 <= value <= 1.0).
    ///
    /// 如果 `v` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval(&self, v: f32) -> Option<f32> {
        if !v.is_finite() {
            return None;
        }
        let clipped = v.clamp(self.lower_bound(), self.upper_bound());
        Some((clipped - self.level) / (self.width / 2.0))
    }
}

/// 有序序列的百分位 (线性插值). `sorted` 必须非空.
fn percentile(sorted: &[OrderedFloat<f32>], q: f64) -> f32 {
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    sorted[lo].0 + (sorted[hi].0 - sorted[lo].0) * frac
}

/// 按模态把原始体素强度原地归一化到 `[-1, 1]`.
///
/// CT 使用配置中的固定窗口; MR 使用逐体数据计算的百分位窗口.
/// 无法建立 MR 窗口时 (常数图像) 全部置 0. 非有限值同样置 0.
pub fn normalize_intensity(mut data: ArrayViewMut3<f32>, config: &EnsembleConfig) {
    let window = match config.modality() {
        Modality::Ct => Some(config.ct_window()),
        Modality::Mr => {
            let (lo, hi) = config.mr_percentiles();
            IntensityWindow::from_percentiles(data.view(), lo, hi)
        }
    };
    match window {
        Some(w) => data.mapv_inplace(|v| w.eval(v).unwrap_or(0.0)),
        None => {
            log::warn!("degenerate MR intensity range, normalized volume is all zero");
            data.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array3};

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_window_invalid_input() {
        assert!(IntensityWindow::new(0.0, -1.0).is_none());
        assert!(IntensityWindow::new(0.0, 0.0).is_none());
        assert!(IntensityWindow::new(f32::NAN, 10.0).is_none());
        assert!(IntensityWindow::from_bounds(5.0, 5.0).is_none());
    }

    #[test]
    fn test_ct_window() {
        let w = IntensityWindow::from_ct_heart();
        assert_eq!(w.lower_bound(), -750.0);
        assert_eq!(w.upper_bound(), 750.0);
        assert_eq!(w.eval(f32::NAN), None);
        assert!(float_eq(w.eval(-2000.0).unwrap(), -1.0));
        assert!(float_eq(w.eval(3000.0).unwrap(), 1.0));
        assert!(float_eq(w.eval(375.0).unwrap(), 0.5));
        assert!(float_eq(w.eval(0.0).unwrap(), 0.0));
    }

    #[test]
    fn test_percentile_matches_linear_interpolation() {
        let v: Vec<OrderedFloat<f32>> = (0..11).map(|i| OrderedFloat(i as f32)).collect();
        assert!(float_eq(percentile(&v, 20.0), 2.0));
        assert!(float_eq(percentile(&v, 99.0), 9.9));
        assert!(float_eq(percentile(&v, 0.0), 0.0));
        assert!(float_eq(percentile(&v, 100.0), 10.0));
    }

    #[test]
    fn test_normalize_ct_and_mr() {
        let raw = Array::linspace(-1000.0f32, 1000.0, 64)
            .into_shape((4, 4, 4))
            .unwrap();

        let mut ct = raw.clone();
        normalize_intensity(ct.view_mut(), &EnsembleConfig::new(Modality::Ct));
        assert!(ct.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(float_eq(ct[(0, 0, 0)], -1.0));
        assert!(float_eq(ct[(3, 3, 3)], 1.0));

        let mut mr = raw;
        normalize_intensity(mr.view_mut(), &EnsembleConfig::new(Modality::Mr));
        assert!(mr.iter().all(|v| (-1.0..=1.0).contains(v)));
        // 20% 分位以下全部截断到 -1.
        assert!(float_eq(mr[(0, 0, 0)], -1.0));
        assert!(float_eq(mr[(0, 1, 0)], -1.0));
        assert!(float_eq(mr[(3, 3, 3)], 1.0));
    }

    #[test]
    fn test_normalize_constant_mr_is_zero() {
        let mut mr = Array3::<f32>::from_elem((2, 2, 2), 42.0);
        normalize_intensity(mr.view_mut(), &EnsembleConfig::new(Modality::Mr));
        assert!(mr.iter().all(|v| *v == 0.0));
    }
}
