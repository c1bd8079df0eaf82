//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::config::{EnsembleConfig, EnsembleSpec, FusionPolicy, Modality, View};
pub use crate::data::{read_image, read_label, write_label, ImageVolume, LabelVolume};
pub use crate::error::{PredictError, PredictResult};
pub use crate::infer::{Ensemble, ModelLoader, SegmentationModel};
pub use crate::predict::{Prediction, Stage};
pub use crate::score::DiceScores;

pub use crate::consts::label::{REPORT_HEADER, WHOLE_HEART};

pub use crate::dataset::{case_loader, home_dataset_dir_with, Case, RunMode};
pub use crate::report::{report_path, write_dice_report};

#[cfg(feature = "onnx")]
pub use crate::onnx::{OnnxLoader, OnnxModel};
