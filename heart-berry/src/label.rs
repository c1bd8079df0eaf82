//! 标签映射: 概率 -> 内部类别 -> 临床标签, 以及真值载入时的反向映射.

use std::path::Path;

use itertools::Itertools;
use ndarray::{Array3, ArrayView1, ArrayView3, ArrayView4, Axis};

use crate::consts::label::{LA, LA_LEGACY, WHOLE_HEART};
use crate::data::{self, LabelVolume};
use crate::error::{PredictError, PredictResult};

/// 遗留重复编码折叠为规范编码后的临床标签值.
#[inline]
pub const fn canonical_code(code: u16) -> u16 {
    match code {
        LA_LEGACY => LA,
        c => c,
    }
}

/// 内部类别编号 (0, 1, ...) 与临床标签值之间的双射.
///
/// 临床标签值按升序排列, 第 `i` 个值对应内部类别 `i`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelTable {
    codes: Vec<u16>,
}

impl LabelTable {
    /// 全心分割的固定 8 类标签表.
    pub fn whole_heart() -> Self {
        Self {
            codes: WHOLE_HEART.to_vec(),
        }
    }

    /// 由任意标签值构造. 标签值会被折叠、去重并升序排列. 为空时返回 `None`.
    pub fn from_codes<I: IntoIterator<Item = u16>>(codes: I) -> Option<Self> {
        let codes: Vec<u16> = codes.into_iter().map(canonical_code).unique().sorted().collect();
        (!codes.is_empty()).then_some(Self { codes })
    }

    /// 以参考 (真值) 体数据中出现过的标签值构造标签表.
    #[inline]
    pub fn from_reference(reference: &LabelVolume) -> Self {
        // 体数据总是非空的, 因此总能得到至少一个标签值.
        Self::from_codes(reference.data().iter().copied()).unwrap_or_else(Self::whole_heart)
    }

    /// 类别个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// 是否为空. 合法构造的实例总是返回 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// 全部临床标签值, 升序.
    #[inline]
    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    /// 内部类别 `index` 对应的临床标签值.
    #[inline]
    pub fn code(&self, index: usize) -> PredictResult<u16> {
        self.codes
            .get(index)
            .copied()
            .ok_or(PredictError::UnmappedLabel {
                index,
                table_len: self.codes.len(),
            })
    }

    /// 临床标签值 `code` (折叠后) 对应的内部类别.
    #[inline]
    pub fn index_of(&self, code: u16) -> Option<usize> {
        self.codes.binary_search(&canonical_code(code)).ok()
    }
}

/// 一条类别概率上的 arg-max. 相等时取较小的类别编号; NaN 永远不会胜出.
#[inline]
fn argmax_lane(lane: ArrayView1<f32>) -> u8 {
    let mut best = 0usize;
    let mut best_v = f32::NEG_INFINITY;
    for (i, v) in lane.iter().enumerate() {
        if *v > best_v {
            best = i;
            best_v = *v;
        }
    }
    best as u8
}

/// 沿最后一个 (类别) 轴取 arg-max, 得到内部类别体数据.
pub fn argmax_labels(prob: ArrayView4<f32>) -> Array3<u8> {
    prob.map_axis(Axis(3), argmax_lane)
}

/// 把内部类别映射为临床标签值.
///
/// 若存在标签表之外的内部类别, 返回 [`PredictError::UnmappedLabel`], 绝不钳制.
pub fn to_clinical_labels(internal: ArrayView3<u8>, table: &LabelTable) -> PredictResult<Array3<u16>> {
    if let Some(max) = internal.iter().max() {
        table.code(*max as usize)?;
    }
    Ok(internal.mapv(|i| table.codes[i as usize]))
}

/// 把临床标签值映射为内部类别. 遗留编码会先被折叠.
///
/// 若存在标签表之外的标签值, 返回 [`PredictError::UnknownClinicalCode`].
pub fn to_internal_labels(clinical: ArrayView3<u16>, table: &LabelTable) -> PredictResult<Array3<u8>> {
    let mut out = Array3::zeros(clinical.dim());
    for (o, c) in out.iter_mut().zip(clinical.iter()) {
        *o = table
            .index_of(*c)
            .ok_or(PredictError::UnknownClinicalCode(*c))? as u8;
    }
    Ok(out)
}

/// 把遗留重复编码原地折叠为规范编码. 返回被改写的体素个数.
#[inline]
pub fn fold_legacy_codes(label: &mut LabelVolume) -> usize {
    label.replace_label(LA_LEGACY, LA)
}

/// 载入真值标签, 并在任何比较或映射之前折叠遗留编码.
///
/// 文件不存在时返回 [`PredictError::MissingGroundTruth`].
pub fn load_ground_truth<P: AsRef<Path>>(path: P) -> PredictResult<LabelVolume> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PredictError::MissingGroundTruth(path.to_owned()));
    }
    let mut label = data::read_label(path)?;
    let folded = fold_legacy_codes(&mut label);
    if folded != 0 {
        log::debug!("folded {folded} voxels of legacy code {LA_LEGACY} into {LA}");
    }
    Ok(label)
}
