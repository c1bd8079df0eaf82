//! 模型推理适配层.
//!
//! 网络本身是外部协作者, 这里只约定一个 [`SegmentationModel::predict`] 能力:
//! 输入 `(N, H, W)` 切片栈, 输出 `(N, H, W, C)` 逐切片逐类别概率.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{concatenate, Array4, ArrayView3, Axis};

use crate::config::{EnsembleSpec, View};
use crate::error::{ensure_shape, PredictError, PredictResult};

/// 训练好的单视图 2D 分割网络.
///
/// 实现必须是纯函数式的: 对同一输入多次调用给出相同结果,
/// 且不同批次之间互不影响 (因此允许任意分批).
pub trait SegmentationModel: Send + Sync {
    /// 对切片栈 `(N, H, W)` 推理, 返回 `(N, H, W, C)` 概率.
    ///
    /// 显存或内存不足时应返回 [`PredictError::ResourceExhaustion`].
    fn predict(&self, slices: ArrayView3<f32>) -> PredictResult<Array4<f32>>;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    #[inline]
    fn predict(&self, slices: ArrayView3<f32>) -> PredictResult<Array4<f32>> {
        (**self).predict(slices)
    }
}

/// 从模型文件构造网络实例.
///
/// 每次调用都必须返回独立的实例, 不同模型之间不共享可变权重.
pub trait ModelLoader {
    /// 加载 `path` 处为 `view` 训练的模型. 该操作阻塞直至权重完全就绪.
    fn load(&self, view: View, path: &Path) -> PredictResult<Box<dyn SegmentationModel>>;
}

/// 把 `0..n` 顺序划分为至多 `parts` 段. 空段会被丢弃.
pub fn partition_ranges(n: usize, parts: NonZeroUsize) -> Vec<Range<usize>> {
    let parts = parts.get();
    (0..parts)
        .map(|i| (n * i / parts)..(n * (i + 1) / parts))
        .filter(|r| !r.is_empty())
        .collect()
}

/// 按给定区间依次推理, 再按原切片顺序拼接.
///
/// `ranges` 必须首尾相接地覆盖 `0..N`. 每段输出的形状都会被检查,
/// 不一致时返回 [`PredictError::ShapeMismatch`].
pub fn infer_ranges<M: SegmentationModel + ?Sized>(
    model: &M,
    slices: ArrayView3<f32>,
    ranges: &[Range<usize>],
    num_classes: usize,
) -> PredictResult<Array4<f32>> {
    let (n, h, w) = slices.dim();
    let mut cursor = 0;
    for r in ranges {
        if r.start != cursor || r.end < r.start {
            return Err(PredictError::shape("partition", &[cursor], &[r.start]));
        }
        cursor = r.end;
    }
    if cursor != n || n == 0 {
        return Err(PredictError::shape("partition", &[n], &[cursor]));
    }

    let mut parts = Vec::with_capacity(ranges.len());
    for r in ranges {
        let batch = slices.slice_axis(Axis(0), r.clone().into());
        let prob = model.predict(batch)?;
        ensure_shape("inference output", &[r.len(), h, w, num_classes], prob.shape())?;
        parts.push(prob);
    }
    if parts.len() == 1 {
        return Ok(parts.pop().unwrap_or_else(|| Array4::zeros((0, h, w, num_classes))));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views)
        .map_err(|_| PredictError::shape("concatenate", &[n, h, w, num_classes], &[]))
}

/// 把切片栈分为 `partitions` 批依次推理. 分批只是内存策略,
/// 结果与不分批逐位相同.
#[inline]
pub fn infer<M: SegmentationModel + ?Sized>(
    model: &M,
    slices: ArrayView3<f32>,
    partitions: NonZeroUsize,
    num_classes: usize,
) -> PredictResult<Array4<f32>> {
    let ranges = partition_ranges(slices.len_of(Axis(0)), partitions);
    infer_ranges(model, slices, &ranges, num_classes)
}

/// 一个已加载的单视图模型. 由 (视图, 模型路径) 标识, 在整个批处理期间只读共享.
pub struct LoadedModel {
    view: View,
    path: PathBuf,
    model: Box<dyn SegmentationModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("view", &self.view)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LoadedModel {
    /// 直接由网络实例创建.
    pub fn new<P: Into<PathBuf>>(view: View, path: P, model: Box<dyn SegmentationModel>) -> Self {
        Self {
            view,
            path: path.into(),
            model,
        }
    }

    /// 模型所属视图.
    #[inline]
    pub fn view(&self) -> View {
        self.view
    }

    /// 模型文件路径.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 网络实例.
    #[inline]
    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }
}

/// 一组已加载的模型, 顺序与 [`EnsembleSpec`] 一致.
#[derive(Debug)]
pub struct Ensemble {
    members: Vec<LoadedModel>,
}

impl Ensemble {
    /// 按集成描述逐个加载模型. 任一模型加载失败即返回错误.
    pub fn load<L: ModelLoader + ?Sized>(spec: &EnsembleSpec, loader: &L) -> PredictResult<Self> {
        let mut members = Vec::with_capacity(spec.len());
        for (view, path) in spec.iter() {
            log::info!("loading {view} model from {}", path.display());
            members.push(LoadedModel::new(view, path, loader.load(view, path)?));
        }
        Ok(Self { members })
    }

    /// 由已加载的模型直接创建. 为空时返回
    /// [`PredictError::MissingViewModelPairing`].
    pub fn from_models(members: Vec<LoadedModel>) -> PredictResult<Self> {
        if members.is_empty() {
            return Err(PredictError::MissingViewModelPairing {
                views: 0,
                models: 0,
            });
        }
        Ok(Self { members })
    }

    /// 模型总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// 是否为空. 合法构造的实例总是返回 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 按配置顺序迭代全部模型.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &LoadedModel> {
        self.members.iter()
    }

    /// 出现过的不同视图, 按轴序升序排列.
    pub fn distinct_views(&self) -> Vec<View> {
        let mut views: Vec<View> = self.members.iter().map(|m| m.view).collect();
        views.sort_unstable();
        views.dedup();
        views
    }

    /// 为 `view` 训练的全部模型, 保持配置顺序.
    pub fn members_of(&self, view: View) -> impl Iterator<Item = &LoadedModel> {
        self.members.iter().filter(move |m| m.view == view)
    }
}
