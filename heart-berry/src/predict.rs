//! 单个体数据的预测编排.
//!
//! 一个 [`Prediction`] 只负责一个输入体数据: 它独占该体数据、其真值 (若有) 以及预测结果,
//! 而以只读方式共享整个批处理的 [`Ensemble`] 和 [`EnsembleConfig`].
//! 每个步骤都会按需执行尚未完成的前置步骤, 因此可以直接调用 [`Prediction::write`]
//! 或 [`Prediction::dice`].

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EnsembleConfig;
use crate::data::{self, ImageVolume, LabelVolume};
use crate::error::{PredictError, PredictResult};
use crate::fuse;
use crate::infer::Ensemble;
use crate::label::{self, LabelTable};
use crate::resample::{self, Interpolation};
use crate::score::{self, DiceScores};

/// 编排器所处的阶段. 阶段只会前进.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Stage {
    /// 尚未读入任何数据.
    Unloaded,
    /// 已读入并预处理强度体数据.
    ImageLoaded,
    /// 已读入真值标签.
    LabelLoaded,
    /// 已在各向同性网格上得到临床标签.
    Predicted,
    /// 预测已重采样回原始网格.
    Resampled,
    /// 已完成评分.
    Scored,
    /// 已写出预测.
    Written,
}

/// 单个体数据的预测过程.
pub struct Prediction<'e> {
    ensemble: &'e Ensemble,
    config: &'e EnsembleConfig,
    image_path: PathBuf,
    label_path: Option<PathBuf>,
    stage: Stage,
    label_checked: bool,

    /// 原始扫描, 决定输出网格.
    original: Option<ImageVolume>,
    /// 各向同性、已归一化的强度体数据.
    image: Option<ImageVolume>,
    /// 真值标签 (已折叠遗留编码).
    label: Option<LabelVolume>,
    /// 各向同性网格上的预测.
    prediction: Option<LabelVolume>,
    /// 原始网格上的预测.
    resampled: Option<LabelVolume>,
    scores: Option<DiceScores>,
}

impl std::fmt::Debug for Prediction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prediction")
            .field("image_path", &self.image_path)
            .field("label_path", &self.label_path)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl<'e> Prediction<'e> {
    /// 为 `image_path` 处的体数据创建编排器. 不做任何 I/O.
    pub fn new<P: Into<PathBuf>>(
        ensemble: &'e Ensemble,
        config: &'e EnsembleConfig,
        image_path: P,
        label_path: Option<PathBuf>,
    ) -> Self {
        Self {
            ensemble,
            config,
            image_path: image_path.into(),
            label_path,
            stage: Stage::Unloaded,
            label_checked: false,
            original: None,
            image: None,
            label: None,
            prediction: None,
            resampled: None,
            scores: None,
        }
    }

    #[inline]
    fn advance(&mut self, stage: Stage) {
        self.stage = self.stage.max(stage);
    }

    /// 当前阶段.
    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// 输入体数据路径.
    #[inline]
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// 预处理后的强度体数据 (各向同性, 已归一化).
    #[inline]
    pub fn image(&self) -> Option<&ImageVolume> {
        self.image.as_ref()
    }

    /// 真值标签.
    #[inline]
    pub fn ground_truth(&self) -> Option<&LabelVolume> {
        self.label.as_ref()
    }

    /// 各向同性网格上的预测.
    #[inline]
    pub fn prediction(&self) -> Option<&LabelVolume> {
        self.prediction.as_ref()
    }

    /// 原始网格上的预测.
    #[inline]
    pub fn resampled(&self) -> Option<&LabelVolume> {
        self.resampled.as_ref()
    }

    /// 最近一次评分结果.
    #[inline]
    pub fn scores(&self) -> Option<&DiceScores> {
        self.scores.as_ref()
    }

    /// 读入强度体数据, 重采样到各向同性分辨率并按模态归一化.
    pub fn load_image(&mut self) -> PredictResult<()> {
        if self.image.is_some() {
            return Ok(());
        }
        log::info!("loading image {}", self.image_path.display());
        let original = data::read_image(&self.image_path)?;
        let mut image = resample::resample_isotropic(&original, Interpolation::Linear);
        log::debug!(
            "resampled {:?} @ {:?} to {:?} @ {:?}",
            original.shape(),
            original.geometry().spacing(),
            image.shape(),
            image.geometry().spacing()
        );
        data::normalize_intensity(image.data_mut(), self.config);
        self.original = Some(original);
        self.image = Some(image);
        self.advance(Stage::ImageLoaded);
        Ok(())
    }

    /// 读入真值标签. 返回真值是否可用.
    ///
    /// 没有真值路径或文件不存在时只记录警告, 返回 `Ok(false)`; 其他读取错误照常返回.
    pub fn load_label(&mut self) -> PredictResult<bool> {
        if self.label_checked {
            return Ok(self.label.is_some());
        }
        self.label_checked = true;
        let Some(path) = self.label_path.as_deref() else {
            return Ok(false);
        };
        match label::load_ground_truth(path) {
            Ok(label) => {
                log::info!("loaded ground truth {}", path.display());
                self.label = Some(label);
                self.advance(Stage::LabelLoaded);
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("{e}, scoring will be skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 本次预测使用的标签表: 有真值时取真值中出现的标签值, 否则取配置中的标签表.
    fn label_table(&self) -> LabelTable {
        match &self.label {
            Some(label) => LabelTable::from_reference(label),
            None => self.config.label_table().clone(),
        }
    }

    /// 集成预测, 得到各向同性网格上的临床标签.
    pub fn predict(&mut self) -> PredictResult<()> {
        if self.prediction.is_some() {
            return Ok(());
        }
        self.load_image()?;
        self.load_label()?;
        let table = self.label_table();
        let Some(image) = self.image.as_ref() else {
            return Err(PredictError::Inference("image is not loaded".into()));
        };

        log::info!(
            "predicting {} with {} models ({} modality)",
            self.image_path.display(),
            self.ensemble.len(),
            self.config.modality()
        );
        let internal = fuse::fuse(self.ensemble, image.data(), self.config)?;
        let clinical = label::to_clinical_labels(internal.view(), &table)?;
        self.prediction = Some(image.replace(clinical, *image.geometry()));
        self.advance(Stage::Predicted);
        Ok(())
    }

    /// 把预测从各向同性网格最近邻重采样回原始扫描的网格. 视野之外为背景.
    pub fn resample_prediction(&mut self) -> PredictResult<()> {
        if self.resampled.is_some() {
            return Ok(());
        }
        self.predict()?;
        let (Some(prediction), Some(original)) = (self.prediction.as_ref(), self.original.as_ref())
        else {
            return Err(PredictError::Inference("prediction is not available".into()));
        };
        self.resampled = Some(resample::resample_label_onto(prediction, original));
        self.advance(Stage::Resampled);
        Ok(())
    }

    /// 在原始网格上比较预测和真值.
    ///
    /// 没有真值时返回 [`PredictError::MissingGroundTruth`], 其余状态不受影响.
    pub fn dice(&mut self) -> PredictResult<DiceScores> {
        if !self.load_label()? {
            let path = self.label_path.clone().unwrap_or_else(|| self.image_path.clone());
            return Err(PredictError::MissingGroundTruth(path));
        }
        self.resample_prediction()?;
        let (Some(pred), Some(truth)) = (self.resampled.as_ref(), self.label.as_ref()) else {
            return Err(PredictError::Inference("prediction is not available".into()));
        };
        let scores = score::score(pred.data(), truth.data())?;
        log::info!(
            "dice of {}: {:?}",
            self.image_path.display(),
            scores.iter().collect::<Vec<_>>()
        );
        self.scores = Some(scores.clone());
        self.advance(Stage::Scored);
        Ok(scores)
    }

    /// 把原始网格上的预测以 16-bit 整数写出到 `path`. 父目录不存在时会被创建.
    pub fn write<P: AsRef<Path>>(&mut self, path: P) -> PredictResult<()> {
        let path = path.as_ref();
        self.resample_prediction()?;
        let Some(pred) = self.resampled.as_ref() else {
            return Err(PredictError::Inference("prediction is not available".into()));
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        data::write_label(pred, path)?;
        log::info!("wrote prediction to {}", path.display());
        self.advance(Stage::Written);
        Ok(())
    }
}
