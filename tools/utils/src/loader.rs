//! 对 `heart-berry::dataset` 的更一层封装. 提供更直接的数据集加载器.

use heart_berry::dataset::{self, CaseLoader, RunMode};
use heart_berry::{Modality, PredictResult};
use std::env;
use std::path::{Path, PathBuf};

/// 获取全心分割数据集基本路径.
///
/// 1. 若环境变量 `$WHS_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/whs`.
pub fn data_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("WHS_DATA_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dataset::home_dataset_dir_with(["whs"]),
    }
}

/// 获取模型目录.
///
/// 1. 若环境变量 `$WHS_MODEL_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/whs/models`.
pub fn model_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("WHS_MODEL_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dataset::home_dataset_dir_with(["whs", "models"]),
    }
}

/// 获取某一模态的体数据加载器.
#[inline]
pub fn case_loader<P: AsRef<Path>>(data: P, modality: Modality, mode: RunMode) -> PredictResult<CaseLoader> {
    dataset::case_loader(data, modality, mode)
}
