//! 数据集操作.
//!
//! 数据集目录按模态组织:
//!
//! ```text
//! {data}/ct_test/*.nii.gz        {data}/ct_test_masks/*.nii.gz
//! {data}/mr_test/*.nii.gz        {data}/mr_test_masks/*.nii.gz
//! ```
//!
//! 图像与标签各自按文件名排序后, 按位置一一配对.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::Modality;
use crate::data::VolumeFormat;
use crate::error::PredictResult;

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 运行模式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum RunMode {
    /// 只预测, 不读取真值.
    #[default]
    Test,
    /// 预测并与真值比较.
    Validation,
}

impl RunMode {
    /// 是否需要读取真值.
    #[inline]
    pub fn with_ground_truth(self) -> bool {
        matches!(self, Self::Validation)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Test => "test",
            Self::Validation => "validation",
        })
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "validation" => Ok(Self::Validation),
            _ => Err(format!("unknown mode `{s}`, expected `test` or `validation`")),
        }
    }
}

/// 一个待预测的体数据及其真值 (若有).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Case {
    /// 强度体数据路径.
    pub image: PathBuf,
    /// 真值标签路径.
    pub label: Option<PathBuf>,
}

impl Case {
    /// 输入文件名. 输出文件沿用该文件名.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        self.image.file_name().unwrap_or(self.image.as_os_str())
    }
}

/// `{data}/{modality}_test` 目录.
#[inline]
pub fn image_dir<P: AsRef<Path>>(data: P, modality: Modality) -> PathBuf {
    data.as_ref().join(format!("{}_test", modality.name()))
}

/// `{data}/{modality}_test_masks` 目录.
#[inline]
pub fn mask_dir<P: AsRef<Path>>(data: P, modality: Modality) -> PathBuf {
    data.as_ref().join(format!("{}_test_masks", modality.name()))
}

/// 按文件名排序, 列出 `dir` 下所有可识别格式的体数据文件.
pub fn list_volumes<P: AsRef<Path>>(dir: P) -> PredictResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path.is_file() && VolumeFormat::from_path(&path).is_ok() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// 从数据集目录创建某一模态的体数据加载器.
///
/// # 注意
///
/// 1. 图像目录不存在时返回 I/O 错误.
/// 2. 验证模式下标签目录不存在, 或标签少于图像时, 多出的图像没有真值 (只记录警告).
pub fn case_loader<P: AsRef<Path>>(data: P, modality: Modality, mode: RunMode) -> PredictResult<CaseLoader> {
    let data = data.as_ref();
    let images = list_volumes(image_dir(data, modality))?;
    let masks = if mode.with_ground_truth() {
        let dir = mask_dir(data, modality);
        if dir.is_dir() {
            list_volumes(dir)?
        } else {
            log::warn!("mask directory {} does not exist", dir.display());
            Vec::new()
        }
    } else {
        Vec::new()
    };
    log::info!(
        "{modality}: {} image volumes, {} mask volumes",
        images.len(),
        masks.len()
    );
    if mode.with_ground_truth() && masks.len() != images.len() {
        log::warn!(
            "{modality}: {} images but {} masks, pairing by sorted order",
            images.len(),
            masks.len()
        );
    }

    let mut masks = masks.into_iter();
    let mut cases: Vec<Case> = images
        .into_iter()
        .map(|image| Case {
            image,
            label: masks.next(),
        })
        .collect();
    cases.reverse();
    Ok(CaseLoader { data_rev: cases })
}

/// 体数据加载器. 按文件名顺序迭代 [`Case`].
#[derive(Debug)]
pub struct CaseLoader {
    data_rev: Vec<Case>,
}

impl Iterator for CaseLoader {
    type Item = Case;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.data_rev.pop()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.data_rev.len(), Some(self.data_rev.len()))
    }
}

impl ExactSizeIterator for CaseLoader {
    #[inline]
    fn len(&self) -> usize {
        self.data_rev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_home_dataset_dir_with() {
        if let Some(home) = dirs::home_dir() {
            let dir = home_dataset_dir_with(["whs", "models"]).unwrap();
            assert_eq!(dir, home.join("dataset").join("whs").join("models"));
        }
    }

    #[test]
    fn test_pairs_by_sorted_order() {
        let root = tempfile::tempdir().unwrap();
        let images = image_dir(root.path(), Modality::Ct);
        let masks = mask_dir(root.path(), Modality::Ct);
        touch(&images, "ct_1002_image.nii.gz");
        touch(&images, "ct_1001_image.nii.gz");
        touch(&images, "notes.txt");
        touch(&masks, "ct_1002_label.nii.gz");
        touch(&masks, "ct_1001_label.nii.gz");

        let cases: Vec<Case> = case_loader(root.path(), Modality::Ct, RunMode::Validation)
            .unwrap()
            .collect();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].file_name(), "ct_1001_image.nii.gz");
        assert_eq!(cases[0].label.as_deref(), Some(masks.join("ct_1001_label.nii.gz").as_path()));
        assert_eq!(cases[1].label.as_deref(), Some(masks.join("ct_1002_label.nii.gz").as_path()));

        let loader = case_loader(root.path(), Modality::Ct, RunMode::Test).unwrap();
        assert_eq!(loader.len(), 2);
        assert!(loader.into_iter().all(|c| c.label.is_none()));
    }

    #[test]
    fn test_missing_masks_leave_ground_truth_absent() {
        let root = tempfile::tempdir().unwrap();
        touch(&image_dir(root.path(), Modality::Mr), "mr_1001_image.nii.gz");
        let cases: Vec<Case> = case_loader(root.path(), Modality::Mr, RunMode::Validation)
            .unwrap()
            .collect();
        assert_eq!(cases.len(), 1);
        assert!(cases[0].label.is_none());

        assert!(case_loader(root.path(), Modality::Ct, RunMode::Test).is_err());
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("Validation".parse::<RunMode>().unwrap(), RunMode::Validation);
        assert_eq!("test".parse::<RunMode>().unwrap(), RunMode::Test);
        assert!("train".parse::<RunMode>().is_err());
    }
}
