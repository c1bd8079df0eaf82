//! 集成融合.
//!
//! 三种策略都以同一个存储序的强度体数据为输入, 以该体数据的形状为目标形状,
//! 输出内部类别体数据 (`0..num_classes`):
//!
//! 1. [`average_probability`]: 对每个视图, 该视图所有模型的概率先求和,
//!    缩放回目标形状后累加, 最后除以**模型**总数;
//! 2. [`majority_vote_fusion`]: 每个模型独立得到离散标签, 逐体素投票;
//! 3. [`single_fusion`]: 只用第一个模型, 在标准网格上取 arg-max 后最近邻缩放标签.

use ndarray::{Array3, Array4, ArrayView3, Zip};

use crate::config::{EnsembleConfig, FusionPolicy, View};
use crate::error::{ensure_shape, PredictError, PredictResult};
use crate::infer::{self, Ensemble, LoadedModel};
use crate::label::argmax_labels;
use crate::resample::{self, Interpolation};
use crate::view;
use crate::Idx3d;

/// 把网络序的体数据缩放到 `view` 的标准形状, 并分解为切片栈.
fn view_slices(net: ArrayView3<f32>, view: View, config: &EnsembleConfig) -> PredictResult<Array3<f32>> {
    let resized = resample::resample_to_shape(net, view, config.canonical_size())?;
    Ok(view::to_slice_major(resized.view(), view))
}

/// 单个模型对切片栈的推理.
#[inline]
fn run(member: &LoadedModel, slices: ArrayView3<f32>, config: &EnsembleConfig) -> PredictResult<Array4<f32>> {
    log::debug!("running {} model {}", member.view(), member.path().display());
    infer::infer(member.model(), slices, config.partitions(), config.num_classes())
}

/// 切片主序概率 -> 存储序概率 (仍在标准网格上).
#[inline]
fn reassemble(prob: Array4<f32>, view: View, config: &EnsembleConfig) -> Array4<f32> {
    view::restore_storage_order(view::probs_from_slice_major(prob.view(), view), config.modality())
}

/// 把标准网格上的概率线性缩放回目标形状.
fn to_target(prob: Array4<f32>, target: Idx3d) -> PredictResult<Array4<f32>> {
    let prob = resample::resize_channels(prob.view(), target, Interpolation::Linear)?;
    let (d0, d1, d2, _) = prob.dim();
    ensure_shape("per-view probability", &[target.0, target.1, target.2], &[d0, d1, d2])?;
    Ok(prob)
}

/// 平均融合, 返回目标形状上的 `(d0, d1, d2, C)` 平均概率.
///
/// 对每个出现过的视图, 切片栈只准备一次, 该视图的所有模型共享.
pub fn average_probability(
    ensemble: &Ensemble,
    image: ArrayView3<f32>,
    config: &EnsembleConfig,
) -> PredictResult<Array4<f32>> {
    let target = image.dim();
    let net = view::to_network_order(image, config.modality());
    let mut acc = Array4::<f32>::zeros((target.0, target.1, target.2, config.num_classes()));

    for view in ensemble.distinct_views() {
        let slices = view_slices(net.view(), view, config)?;
        let mut view_sum: Option<Array4<f32>> = None;
        for member in ensemble.members_of(view) {
            let prob = run(member, slices.view(), config)?;
            match view_sum.as_mut() {
                Some(sum) => add_probabilities(sum, &prob)?,
                None => view_sum = Some(prob),
            }
        }
        let Some(view_sum) = view_sum else {
            continue;
        };
        let prob = to_target(reassemble(view_sum, view, config), target)?;
        add_probabilities(&mut acc, &prob)?;
    }

    acc /= ensemble.len() as f32;
    Ok(acc)
}

/// 平均融合后取 arg-max.
#[inline]
pub fn average_fusion(
    ensemble: &Ensemble,
    image: ArrayView3<f32>,
    config: &EnsembleConfig,
) -> PredictResult<Array3<u8>> {
    Ok(argmax_labels(average_probability(ensemble, image, config)?.view()))
}

/// 逐体素多数投票. 票数最多的类别胜出, 票数相同时取较小的类别.
///
/// 所有投票体数据的形状必须一致, 否则返回 [`PredictError::ShapeMismatch`].
pub fn majority_vote(votes: &[Array3<u8>], num_classes: usize) -> PredictResult<Array3<u8>> {
    let Some(first) = votes.first() else {
        return Err(PredictError::MissingViewModelPairing {
            views: 0,
            models: 0,
        });
    };
    for v in &votes[1..] {
        ensure_shape("majority vote", first.shape(), v.shape())?;
    }
    if let Some(max) = votes.iter().flat_map(|v| v.iter()).max() {
        if *max as usize >= num_classes {
            return Err(PredictError::UnmappedLabel {
                index: *max as usize,
                table_len: num_classes,
            });
        }
    }
    if votes.len() == 1 {
        return Ok(first.clone());
    }

    let mut counts = vec![0u32; num_classes];
    Ok(Array3::from_shape_fn(first.dim(), |idx| {
        counts.iter_mut().for_each(|c| *c = 0);
        for v in votes {
            counts[v[idx] as usize] += 1;
        }
        // 严格大于: 平票时保留先出现的 (较小的) 类别.
        let mut best = 0;
        for (class, n) in counts.iter().enumerate() {
            if *n > counts[best] {
                best = class;
            }
        }
        best as u8
    }))
}

/// 多数投票融合. 每个模型都投一票, 包括只有一个模型的情形.
pub fn majority_vote_fusion(
    ensemble: &Ensemble,
    image: ArrayView3<f32>,
    config: &EnsembleConfig,
) -> PredictResult<Array3<u8>> {
    let target = image.dim();
    let net = view::to_network_order(image, config.modality());
    let mut votes = Vec::with_capacity(ensemble.len());

    for view in ensemble.distinct_views() {
        let slices = view_slices(net.view(), view, config)?;
        for member in ensemble.members_of(view) {
            let prob = run(member, slices.view(), config)?;
            let prob = to_target(reassemble(prob, view, config), target)?;
            votes.push(argmax_labels(prob.view()));
        }
    }
    majority_vote(&votes, config.num_classes())
}

/// 单模型预测: 只使用第一个模型, 在标准网格上取 arg-max, 再把标签最近邻缩放到目标形状.
pub fn single_fusion(
    ensemble: &Ensemble,
    image: ArrayView3<f32>,
    config: &EnsembleConfig,
) -> PredictResult<Array3<u8>> {
    let Some(member) = ensemble.iter().next() else {
        return Err(PredictError::MissingViewModelPairing {
            views: 0,
            models: 0,
        });
    };
    let view = member.view();
    let net = view::to_network_order(image, config.modality());
    let slices = view_slices(net.view(), view, config)?;
    let prob = run(member, slices.view(), config)?;
    let labels = argmax_labels(view::probs_from_slice_major(prob.view(), view).view());
    let labels = view::restore_storage_order_3d(labels, config.modality());
    resample::resize_nearest(labels.view(), image.dim())
}

/// 按配置的融合策略得到内部类别体数据.
pub fn fuse(
    ensemble: &Ensemble,
    image: ArrayView3<f32>,
    config: &EnsembleConfig,
) -> PredictResult<Array3<u8>> {
    log::debug!(
        "fusing {} models over {:?} views with {:?}",
        ensemble.len(),
        ensemble.distinct_views(),
        config.fusion()
    );
    match config.fusion() {
        FusionPolicy::Average => average_fusion(ensemble, image, config),
        FusionPolicy::MajorityVote => majority_vote_fusion(ensemble, image, config),
        FusionPolicy::Single => single_fusion(ensemble, image, config),
    }
}

/// 把 `other` 逐元素累加到 `acc`. 形状不一致时返回 [`PredictError::ShapeMismatch`].
pub fn add_probabilities(acc: &mut Array4<f32>, other: &Array4<f32>) -> PredictResult<()> {
    ensure_shape("probability sum", acc.shape(), other.shape())?;
    Zip::from(acc).and(other).for_each(|a, b| *a += *b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Modality;
    use crate::infer::tests::{IntensityModel, OneHotModel};
    use crate::label::{to_clinical_labels, LabelTable};
    use std::num::NonZeroUsize;

    fn image(shape: Idx3d) -> Array3<f32> {
        Array3::from_shape_fn(shape, |(i, j, k)| ((i * 7 + j * 3 + k) % 11) as f32 / 5.0 - 1.0)
    }

    fn member(view: View, model: impl infer::SegmentationModel + 'static) -> LoadedModel {
        LoadedModel::new(view, format!("{view}.onnx"), Box::new(model))
    }

    fn config(modality: Modality) -> EnsembleConfig {
        EnsembleConfig::new(modality).with_canonical_size(8)
    }

    #[test]
    fn test_single_model_average_is_plain_inference() {
        let img = image((5, 6, 7));
        let cfg = config(Modality::Ct);
        let ensemble = Ensemble::from_models(vec![member(View::Coronal, IntensityModel::new(8))]).unwrap();
        let fused = average_probability(&ensemble, img.view(), &cfg).unwrap();

        // 直接按流程手算一遍.
        let model = IntensityModel::new(8);
        let resized = resample::resample_to_shape(img.view(), View::Coronal, 8).unwrap();
        let slices = view::to_slice_major(resized.view(), View::Coronal);
        let prob = infer::infer(&model, slices.view(), NonZeroUsize::MIN, 8).unwrap();
        let prob = view::probs_from_slice_major(prob.view(), View::Coronal);
        let expected = resample::resize_channels(prob.view(), (5, 6, 7), Interpolation::Linear).unwrap();

        assert_eq!(fused.dim(), (5, 6, 7, 8));
        for (a, b) in fused.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_two_view_one_hot_ensemble_yields_class_three() {
        let img = image((4, 5, 6));
        let cfg = config(Modality::Ct);
        let ensemble = Ensemble::from_models(vec![
            member(View::Axial, OneHotModel { classes: 8, hot: 3 }),
            member(View::Coronal, OneHotModel { classes: 8, hot: 3 }),
        ])
        .unwrap();

        let prob = average_probability(&ensemble, img.view(), &cfg).unwrap();
        assert!(prob
            .indexed_iter()
            .all(|((.., c), v)| if c == 3 { (*v - 1.0).abs() < 1e-6 } else { v.abs() < 1e-6 }));

        let internal = fuse(&ensemble, img.view(), &cfg).unwrap();
        let clinical = to_clinical_labels(internal.view(), &LabelTable::whole_heart()).unwrap();
        assert_eq!(clinical.dim(), (4, 5, 6));
        assert!(clinical.iter().all(|v| *v == 500));
    }

    #[test]
    fn test_average_divides_by_model_count() {
        let img = image((3, 4, 5));
        let cfg = config(Modality::Ct);
        // 轴向两个模型, 矢状一个模型: 类别 1 的平均概率为 2/3.
        let ensemble = Ensemble::from_models(vec![
            member(View::Axial, OneHotModel { classes: 8, hot: 1 }),
            member(View::Sagittal, OneHotModel { classes: 8, hot: 6 }),
            member(View::Axial, OneHotModel { classes: 8, hot: 1 }),
        ])
        .unwrap();
        let prob = average_probability(&ensemble, img.view(), &cfg).unwrap();
        assert!((prob[(1, 2, 3, 1)] - 2.0 / 3.0).abs() < 1e-6);
        assert!((prob[(1, 2, 3, 6)] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(argmax_labels(prob.view())[(0, 0, 0)], 1);
    }

    #[test]
    fn test_mr_axis_correction_keeps_storage_shape() {
        let img = image((3, 4, 5));
        let cfg = config(Modality::Mr);
        let ensemble = Ensemble::from_models(vec![
            member(View::Axial, IntensityModel::new(8)),
            member(View::Sagittal, IntensityModel::new(8)),
        ])
        .unwrap();
        let prob = average_probability(&ensemble, img.view(), &cfg).unwrap();
        assert_eq!(prob.dim(), (3, 4, 5, 8));
        let single = single_fusion(&ensemble, img.view(), &cfg.clone().with_fusion(FusionPolicy::Single)).unwrap();
        assert_eq!(single.dim(), (3, 4, 5));
    }

    /// 强度大于 0 的像素给类别 1, 其余给类别 0.
    struct ThresholdModel;

    impl infer::SegmentationModel for ThresholdModel {
        fn predict(&self, slices: ArrayView3<f32>) -> PredictResult<Array4<f32>> {
            let (n, h, w) = slices.dim();
            Ok(Array4::from_shape_fn((n, h, w, 8), |(i, j, k, l)| {
                let hot = usize::from(slices[(i, j, k)] > 0.0);
                if l == hot {
                    1.0
                } else {
                    0.0
                }
            }))
        }
    }

    fn thresholded(img: &Array3<f32>) -> Array3<u8> {
        img.mapv(|v| u8::from(v > 0.0))
    }

    #[test]
    fn test_mr_voxels_stay_aligned_per_view() {
        // 立方体边长等于标准尺寸, 缩放全部是原样复制, 结果只取决于轴置换.
        let img = image((8, 8, 8));
        let expected = thresholded(&img);
        assert!(expected.iter().any(|v| *v == 1) && expected.iter().any(|v| *v == 0));

        for modality in [Modality::Mr, Modality::Ct] {
            for view in View::ALL {
                let ensemble = Ensemble::from_models(vec![member(view, ThresholdModel)]).unwrap();
                for policy in [FusionPolicy::Average, FusionPolicy::MajorityVote, FusionPolicy::Single] {
                    let cfg = config(modality).with_fusion(policy);
                    let labels = fuse(&ensemble, img.view(), &cfg).unwrap();
                    assert_eq!(labels, expected, "{modality:?} {view} {policy:?}");
                }
            }
        }
    }

    #[test]
    fn test_mr_voxels_stay_aligned_across_views() {
        let img = image((8, 8, 8));
        let expected = thresholded(&img);
        let ensemble = Ensemble::from_models(
            View::ALL.into_iter().map(|v| member(v, ThresholdModel)).collect(),
        )
        .unwrap();
        for policy in [FusionPolicy::Average, FusionPolicy::MajorityVote, FusionPolicy::Single] {
            let cfg = config(Modality::Mr).with_fusion(policy);
            assert_eq!(fuse(&ensemble, img.view(), &cfg).unwrap(), expected, "{policy:?}");
        }
    }

    #[test]
    fn test_short_label_table_keeps_network_classes() {
        let img = image((4, 4, 4));
        let table = LabelTable::from_codes([0, 500]).unwrap();
        let cfg = config(Modality::Ct).with_label_table(table);

        let ensemble = Ensemble::from_models(vec![member(View::Axial, OneHotModel { classes: 8, hot: 1 })]).unwrap();
        let internal = fuse(&ensemble, img.view(), &cfg).unwrap();
        let clinical = to_clinical_labels(internal.view(), cfg.label_table()).unwrap();
        assert!(clinical.iter().all(|v| *v == 500));

        let ensemble = Ensemble::from_models(vec![member(View::Axial, OneHotModel { classes: 8, hot: 3 })]).unwrap();
        let internal = fuse(&ensemble, img.view(), &cfg).unwrap();
        assert!(matches!(
            to_clinical_labels(internal.view(), cfg.label_table()),
            Err(PredictError::UnmappedLabel { index: 3, .. })
        ));
    }

    #[test]
    fn test_majority_vote_counts_and_ties() {
        let a = Array3::from_shape_vec((1, 1, 3), vec![2u8, 5, 7]).unwrap();
        let b = Array3::from_shape_vec((1, 1, 3), vec![4u8, 5, 1]).unwrap();
        let c = Array3::from_shape_vec((1, 1, 3), vec![4u8, 0, 3]).unwrap();

        let voted = majority_vote(&[a.clone(), b.clone(), c], 8).unwrap();
        // 4 得两票; 5 得两票; 三方平票取最小值 1.
        assert_eq!(voted.into_raw_vec(), vec![4, 5, 1]);

        // 两个模型平票时取较小的标签.
        let voted = majority_vote(&[a.clone(), b], 8).unwrap();
        assert_eq!(voted.into_raw_vec(), vec![2, 5, 1]);

        // 单个模型的投票就是它自己的预测.
        assert_eq!(majority_vote(&[a.clone()], 8).unwrap(), a);
    }

    #[test]
    fn test_majority_vote_fusion_uses_every_model() {
        let img = image((4, 4, 4));
        let cfg = config(Modality::Ct).with_fusion(FusionPolicy::MajorityVote);
        let ensemble = Ensemble::from_models(vec![
            member(View::Axial, OneHotModel { classes: 8, hot: 2 }),
            member(View::Coronal, OneHotModel { classes: 8, hot: 5 }),
            member(View::Sagittal, OneHotModel { classes: 8, hot: 5 }),
        ])
        .unwrap();
        let labels = fuse(&ensemble, img.view(), &cfg).unwrap();
        assert!(labels.iter().all(|v| *v == 5));
    }

    #[test]
    fn test_shape_mismatch_fails_fast() {
        let a = Array3::<u8>::zeros((2, 2, 2));
        let b = Array3::<u8>::zeros((2, 2, 3));
        assert!(matches!(
            majority_vote(&[a, b], 8),
            Err(PredictError::ShapeMismatch { .. })
        ));

        let mut acc = Array4::<f32>::zeros((2, 2, 2, 8));
        let other = Array4::<f32>::zeros((2, 2, 3, 8));
        assert!(matches!(
            add_probabilities(&mut acc, &other),
            Err(PredictError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_vote_is_mapping_error() {
        let a = Array3::from_elem((1, 1, 1), 9u8);
        assert!(matches!(
            majority_vote(&[a], 8),
            Err(PredictError::UnmappedLabel { index: 9, .. })
        ));
    }
}
