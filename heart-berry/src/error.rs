//! 运行时错误.

use std::path::PathBuf;

use ndarray_npy::{ReadNpyError, WriteNpyError};
use thiserror::Error;

/// 预测流水线的运行时错误.
///
/// 除 [`PredictError::MissingGroundTruth`] 外, 其余错误对当前体数据都是致命的,
/// 但批处理外层循环只会记录它们并继续处理下一个体数据.
#[derive(Debug, Error)]
pub enum PredictError {
    /// 不支持的文件扩展名.
    #[error("unrecognized volume format: {}", .0.display())]
    UnrecognizedFormat(PathBuf),

    /// 融合 / 重采样的操作数形状不一致.
    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// 出错位置.
        context: &'static str,
        /// 期望形状.
        expected: Vec<usize>,
        /// 实际形状.
        found: Vec<usize>,
    },

    /// 真值标签缺失. 跳过评分, 预测与写出照常进行.
    #[error("ground truth label is missing for {}", .0.display())]
    MissingGroundTruth(PathBuf),

    /// 集成配置中模型数与视图数不一致.
    #[error("missing view attributes for models: {views} views vs {models} models")]
    MissingViewModelPairing {
        /// 视图个数.
        views: usize,
        /// 模型个数.
        models: usize,
    },

    /// 推理时资源耗尽 (通常是显存或内存).
    #[error("resource exhausted during inference: {0}")]
    ResourceExhaustion(String),

    /// 内部类别编号在临床标签表中没有对应项.
    #[error("internal class {index} has no clinical code (table has {table_len} entries)")]
    UnmappedLabel {
        /// 内部类别编号.
        index: usize,
        /// 标签表长度.
        table_len: usize,
    },

    /// 临床标签值不在标签表中.
    #[error("clinical code {0} is not in the label table")]
    UnknownClinicalCode(u16),

    /// 推理后端的其他错误.
    #[error("inference failed: {0}")]
    Inference(String),

    /// 读写 nifti 文件错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 读取 npy 文件错误.
    #[error(transparent)]
    ReadNpy(#[from] ReadNpyError),

    /// 写出 npy 文件错误.
    #[error(transparent)]
    WriteNpy(#[from] WriteNpyError),

    /// 写出 CSV 报告错误.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// 其他底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PredictError {
    /// 构造形状不一致错误.
    pub(crate) fn shape(context: &'static str, expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// 该错误是否只影响评分步骤.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingGroundTruth(_))
    }
}

/// 预测流水线运行时结果.
pub type PredictResult<T> = Result<T, PredictError>;

/// 检查两个形状是否一致, 否则返回 [`PredictError::ShapeMismatch`].
#[inline]
pub(crate) fn ensure_shape(
    context: &'static str,
    expected: &[usize],
    found: &[usize],
) -> PredictResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(PredictError::shape(context, expected, found))
    }
}
