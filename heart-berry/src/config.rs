//! 集成预测配置: 成像模态, 视图, 融合策略以及视图-模型配对.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::consts::{self, VIEW_NAMES};
use crate::data::IntensityWindow;
use crate::error::{PredictError, PredictResult};
use crate::label::LabelTable;

/// 成像模态.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Modality {
    /// CT 扫描.
    Ct,

    /// MR 扫描.
    Mr,
}

impl Modality {
    /// MR 数据的存储轴序与 CT 不同, 送入网络前后需要一次固定的轴置换.
    #[inline]
    pub const fn needs_axis_correction(&self) -> bool {
        matches!(self, Self::Mr)
    }

    /// 小写名称, 同时也是数据集子目录的前缀.
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ct => "ct",
            Self::Mr => "mr",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 无法识别的模态名称.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseModalityError(pub String);

impl fmt::Display for ParseModalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown modality `{}`, expected `ct` or `mr`", self.0)
    }
}

impl std::error::Error for ParseModalityError {}

impl FromStr for Modality {
    type Err = ParseModalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ct" => Ok(Self::Ct),
            "mr" => Ok(Self::Mr),
            _ => Err(ParseModalityError(s.to_owned())),
        }
    }
}

/// 解剖学切片方向. 每个视图对应体数据的一个数组轴.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum View {
    /// 横断面, 轴 0.
    Axial,

    /// 冠状面, 轴 1.
    Coronal,

    /// 矢状面, 轴 2.
    Sagittal,
}

impl View {
    /// 全部视图, 按轴序排列.
    pub const ALL: [View; 3] = [Self::Axial, Self::Coronal, Self::Sagittal];

    /// 由数组轴编号得到视图. 越界时返回 `None`.
    #[inline]
    pub const fn from_axis(axis: usize) -> Option<View> {
        match axis {
            0 => Some(Self::Axial),
            1 => Some(Self::Coronal),
            2 => Some(Self::Sagittal),
            _ => None,
        }
    }

    /// 视图对应的数组轴.
    #[inline]
    pub const fn axis(&self) -> usize {
        match self {
            Self::Axial => 0,
            Self::Coronal => 1,
            Self::Sagittal => 2,
        }
    }

    /// 视图名称.
    #[inline]
    pub const fn name(&self) -> &'static str {
        VIEW_NAMES[self.axis()]
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 多模型输出的融合策略.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FusionPolicy {
    /// 概率求和后按模型总数取平均, 再取 arg-max.
    #[default]
    Average,

    /// 每个模型独立给出离散标签, 逐体素多数投票.
    MajorityVote,

    /// 只使用第一个模型. 在标准网格上取 arg-max 后, 用最近邻缩放标签.
    Single,
}

/// 不可变的集成预测配置. 所有组件都从这里读取类别数、切片尺寸等参数.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnsembleConfig {
    num_classes: usize,
    canonical_size: usize,
    modality: Modality,
    fusion: FusionPolicy,
    partitions: NonZeroUsize,
    ct_window: IntensityWindow,
    mr_percentiles: (f64, f64),
    label_table: LabelTable,
}

impl EnsembleConfig {
    /// 使用全心分割的默认参数创建配置: 8 类, 256 x 256 切片, 平均融合, 2 批推理.
    pub fn new(modality: Modality) -> Self {
        Self {
            num_classes: consts::NUM_CLASSES,
            canonical_size: consts::CANONICAL_SIZE,
            modality,
            fusion: FusionPolicy::default(),
            partitions: NonZeroUsize::new(consts::DEFAULT_PARTITIONS)
                .unwrap_or(NonZeroUsize::MIN),
            ct_window: IntensityWindow::from_ct_heart(),
            mr_percentiles: consts::MR_PERCENTILES,
            label_table: LabelTable::whole_heart(),
        }
    }

    /// 指定标准切片边长. `size` 为 0 时保持原值.
    #[must_use]
    pub fn with_canonical_size(mut self, size: usize) -> Self {
        if size != 0 {
            self.canonical_size = size;
        }
        self
    }

    /// 指定融合策略.
    #[must_use]
    pub fn with_fusion(mut self, fusion: FusionPolicy) -> Self {
        self.fusion = fusion;
        self
    }

    /// 指定推理分批个数.
    #[must_use]
    pub fn with_partitions(mut self, partitions: NonZeroUsize) -> Self {
        self.partitions = partitions;
        self
    }

    /// 指定 CT 强度窗口.
    #[must_use]
    pub fn with_ct_window(mut self, window: IntensityWindow) -> Self {
        self.ct_window = window;
        self
    }

    /// 指定 MR 截断百分位. 需满足 `0 <= lower < upper <= 100`, 否则保持原值.
    #[must_use]
    pub fn with_mr_percentiles(mut self, lower: f64, upper: f64) -> Self {
        if (0.0..upper).contains(&lower) && upper <= 100.0 {
            self.mr_percentiles = (lower, upper);
        }
        self
    }

    /// 指定没有真值时使用的标签表.
    ///
    /// 类别数由网络输出决定, 不随标签表改变. 表比类别数短时, 落在表外的预测类别
    /// 在映射时报错.
    #[must_use]
    pub fn with_label_table(mut self, table: LabelTable) -> Self {
        self.label_table = table;
        self
    }

    /// 类别数.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// 标准切片边长.
    #[inline]
    pub fn canonical_size(&self) -> usize {
        self.canonical_size
    }

    /// 成像模态.
    #[inline]
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// 融合策略.
    #[inline]
    pub fn fusion(&self) -> FusionPolicy {
        self.fusion
    }

    /// 推理分批个数.
    #[inline]
    pub fn partitions(&self) -> NonZeroUsize {
        self.partitions
    }

    /// CT 强度窗口.
    #[inline]
    pub fn ct_window(&self) -> IntensityWindow {
        self.ct_window
    }

    /// MR 截断百分位 (下, 上).
    #[inline]
    pub fn mr_percentiles(&self) -> (f64, f64) {
        self.mr_percentiles
    }

    /// 没有真值可参考时使用的标签表.
    #[inline]
    pub fn label_table(&self) -> &LabelTable {
        &self.label_table
    }
}

/// 集成描述: 第 `i` 个模型文件是为第 `i` 个视图训练的.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnsembleSpec {
    members: Vec<(View, PathBuf)>,
}

impl EnsembleSpec {
    /// 由等长的视图列表和模型路径列表构建.
    ///
    /// 两者长度不一致, 或都为空时, 立即返回
    /// [`PredictError::MissingViewModelPairing`], 不做任何截断.
    pub fn new<P: Into<PathBuf>>(views: Vec<View>, models: Vec<P>) -> PredictResult<Self> {
        if views.len() != models.len() || views.is_empty() {
            return Err(PredictError::MissingViewModelPairing {
                views: views.len(),
                models: models.len(),
            });
        }
        Ok(Self {
            members: views
                .into_iter()
                .zip(models.into_iter().map(Into::into))
                .collect(),
        })
    }

    /// 按 `{dir}/weights_multi-all-{view}_{postfix}.{ext}` 的命名规则,
    /// 为每个视图生成一个模型路径.
    pub fn from_model_dir<P: AsRef<Path>>(
        dir: P,
        views: &[View],
        postfix: &str,
        ext: &str,
    ) -> PredictResult<Self> {
        let models: Vec<PathBuf> = views
            .iter()
            .map(|v| {
                dir.as_ref()
                    .join(format!("weights_multi-all-{}_{postfix}.{ext}", v.name()))
            })
            .collect();
        Self::new(views.to_vec(), models)
    }

    /// 成员个数 (即模型个数).
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// 是否没有成员. 合法构造的实例总是返回 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 按配置顺序迭代 (视图, 模型路径).
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (View, &Path)> {
        self.members.iter().map(|(v, p)| (*v, p.as_path()))
    }

    /// 按配置顺序迭代视图.
    #[inline]
    pub fn views(&self) -> impl ExactSizeIterator<Item = View> + '_ {
        self.members.iter().map(|(v, _)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_mismatch_fails_fast() {
        let err = EnsembleSpec::new(
            vec![View::Axial, View::Coronal, View::Sagittal],
            vec!["a.onnx", "b.onnx"],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PredictError::MissingViewModelPairing {
                views: 3,
                models: 2
            }
        ));

        let empty: Vec<&str> = vec![];
        assert!(EnsembleSpec::new(vec![], empty).is_err());
    }

    #[test]
    fn test_spec_from_model_dir() {
        let spec =
            EnsembleSpec::from_model_dir("/models", &[View::Axial, View::Sagittal], "small2", "onnx")
                .unwrap();
        let members: Vec<_> = spec.iter().collect();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, View::Axial);
        assert_eq!(
            members[1].1,
            Path::new("/models/weights_multi-all-sagittal_small2.onnx")
        );
    }

    #[test]
    fn test_modality_and_view() {
        assert_eq!("MR".parse::<Modality>().unwrap(), Modality::Mr);
        assert!("pet".parse::<Modality>().is_err());
        assert!(Modality::Mr.needs_axis_correction());
        assert!(!Modality::Ct.needs_axis_correction());

        assert_eq!(View::from_axis(1), Some(View::Coronal));
        assert_eq!(View::from_axis(3), None);
        for v in View::ALL {
            assert_eq!(View::from_axis(v.axis()), Some(v));
        }
    }

    #[test]
    fn test_config_builders() {
        let cfg = EnsembleConfig::new(Modality::Ct)
            .with_canonical_size(0)
            .with_mr_percentiles(50.0, 10.0);
        assert_eq!(cfg.canonical_size(), 256);
        assert_eq!(cfg.num_classes(), 8);
        assert_eq!(cfg.mr_percentiles(), (20.0, 99.0));
        assert_eq!(cfg.partitions().get(), 2);

        let cfg = cfg.with_label_table(LabelTable::from_codes([0, 500]).unwrap());
        assert_eq!(cfg.num_classes(), 8);
        assert_eq!(cfg.label_table().len(), 2);
    }
}
