//! 逐类别 Dice 相似度评分.

use itertools::Itertools;
use ndarray::ArrayView3;

use crate::error::{ensure_shape, PredictResult};

/// 单个类别的混淆计数.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct MaskCounts {
    /// 预测与真值都属于该类.
    both: u64,
    /// 只有真值属于该类.
    truth_only: u64,
    /// 只有预测属于该类.
    pred_only: u64,
}

impl MaskCounts {
    /// `1 - dice 距离`. 两个掩码都为空时约定为 1.0 (对 "不存在" 的完全一致).
    fn similarity(&self) -> f64 {
        let disagree = (self.truth_only + self.pred_only) as f64;
        let denom = (2 * self.both) as f64 + disagree;
        if denom == 0.0 {
            1.0
        } else {
            1.0 - disagree / denom
        }
    }
}

/// 一次评分的结果: 真值中出现过的每个类别值及其相似度, 按类别值升序.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiceScores {
    scores: Vec<(u16, f64)>,
}

impl DiceScores {
    /// 评分的类别个数. 等于真值中不同标签值的个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// 是否没有任何类别.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// 按类别值升序迭代 (类别值, 相似度).
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (u16, f64)> + '_ {
        self.scores.iter().copied()
    }

    /// 类别值 `class` 的相似度. 真值中没有该类别时返回 `None`.
    pub fn get(&self, class: u16) -> Option<f64> {
        self.scores
            .binary_search_by_key(&class, |(c, _)| *c)
            .ok()
            .map(|i| self.scores[i].1)
    }

    /// 按固定的类别列表对齐, 缺失的类别为 `None`.
    pub fn aligned(&self, classes: &[u16]) -> Vec<Option<f64>> {
        classes.iter().map(|c| self.get(*c)).collect()
    }
}

/// 比较预测和真值, 为真值中出现的每个标签值计算 Dice 相似度.
///
/// 两者形状必须一致, 否则返回 [`crate::PredictError::ShapeMismatch`].
pub fn score(pred: ArrayView3<u16>, truth: ArrayView3<u16>) -> PredictResult<DiceScores> {
    ensure_shape("dice score", truth.shape(), pred.shape())?;

    let classes: Vec<u16> = truth.iter().copied().unique().sorted().collect();
    let mut counts = vec![MaskCounts::default(); classes.len()];
    let slot = |c: u16| classes.binary_search(&c).ok();

    for (p, t) in pred.iter().zip(truth.iter()) {
        if p == t {
            if let Some(i) = slot(*t) {
                counts[i].both += 1;
            }
        } else {
            if let Some(i) = slot(*t) {
                counts[i].truth_only += 1;
            }
            if let Some(i) = slot(*p) {
                counts[i].pred_only += 1;
            }
        }
    }

    Ok(DiceScores {
        scores: classes
            .iter()
            .zip(counts.iter())
            .map(|(c, n)| (*c, n.similarity()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PredictError;
    use ndarray::Array3;

    #[test]
    fn test_identical_is_one_and_disjoint_is_zero() {
        let a = Array3::from_shape_fn((4, 4, 4), |(i, _, _)| if i < 2 { 500u16 } else { 0 });
        let s = score(a.view(), a.view()).unwrap();
        assert_eq!(s.len(), 2);
        assert!(s.iter().all(|(_, v)| v == 1.0));

        let b = a.mapv(|v| if v == 500 { 0 } else { 500 });
        let s = score(b.view(), a.view()).unwrap();
        assert_eq!(s.get(500), Some(0.0));
        assert_eq!(s.get(0), Some(0.0));
    }

    #[test]
    fn test_partial_overlap() {
        // 真值 4 个体素, 预测 2 个, 重叠 2 个: 2 * 2 / (4 + 2).
        let truth = Array3::from_shape_vec((1, 1, 6), vec![205u16, 205, 205, 205, 0, 0]).unwrap();
        let pred = Array3::from_shape_vec((1, 1, 6), vec![205u16, 205, 0, 0, 0, 0]).unwrap();
        let s = score(pred.view(), truth.view()).unwrap();
        assert!((s.get(205).unwrap() - 4.0 / 6.0).abs() < 1e-12);
        // 背景: 真值 2, 预测 4, 重叠 2.
        assert!((s.get(0).unwrap() - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_scores_follow_ground_truth_classes() {
        let truth = Array3::from_shape_vec((1, 1, 4), vec![0u16, 0, 850, 850]).unwrap();
        let pred = Array3::from_shape_vec((1, 1, 4), vec![0u16, 500, 850, 850]).unwrap();
        let s = score(pred.view(), truth.view()).unwrap();
        // 预测中的 500 不在真值中, 不产生分数.
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(500), None);
        let row = s.aligned(&crate::consts::label::WHOLE_HEART);
        assert_eq!(row.len(), 8);
        assert_eq!(row[7], Some(1.0));
        assert_eq!(row[3], None);
    }

    #[test]
    fn test_empty_masks_convention() {
        assert_eq!(MaskCounts::default().similarity(), 1.0);
        let hit = MaskCounts { both: 1, ..Default::default() };
        assert_eq!(hit.similarity(), 1.0);
        let miss = MaskCounts { truth_only: 1, pred_only: 1, ..Default::default() };
        assert_eq!(miss.similarity(), 0.0);

        // 类别在两边都不存在的体数据, 不会出现在评分里.
        let truth = Array3::from_elem((1, 2, 2), 0u16);
        let s = score(truth.view(), truth.view()).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(500), None);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array3::<u16>::zeros((2, 2, 2));
        let b = Array3::<u16>::zeros((2, 2, 3));
        assert!(matches!(
            score(a.view(), b.view()),
            Err(PredictError::ShapeMismatch { .. })
        ));
    }
}
