//! 视图分解与重组.
//!
//! 把体数据的某个轴换到最前面 (切片主序), 以便按 2D 切片批量推理;
//! 推理完成后再换回去. 这些操作都是纯轴置换, 不做任何插值.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

use crate::config::{Modality, View};

/// `to_slice_major` 使用的轴置换: 视图轴在前, 其余轴保持相对顺序.
#[inline]
const fn slice_major_axes(view: View) -> [usize; 3] {
    match view {
        View::Axial => [0, 1, 2],
        View::Coronal => [1, 0, 2],
        View::Sagittal => [2, 0, 1],
    }
}

/// `from_slice_major` 使用的轴置换, 即 [`slice_major_axes`] 的逆.
#[inline]
const fn volume_major_axes(view: View) -> [usize; 3] {
    match view {
        View::Axial => [0, 1, 2],
        View::Coronal => [1, 0, 2],
        View::Sagittal => [1, 2, 0],
    }
}

#[inline]
fn with_channel([a, b, c]: [usize; 3]) -> [usize; 4] {
    [a, b, c, 3]
}

/// 把 `view` 对应的轴换到轴 0. 结果按标准布局存储.
pub fn to_slice_major<A: Clone>(volume: ArrayView3<A>, view: View) -> Array3<A> {
    volume
        .permuted_axes(slice_major_axes(view))
        .as_standard_layout()
        .into_owned()
}

/// [`to_slice_major`] 的精确逆操作.
pub fn from_slice_major<A: Clone>(volume: ArrayView3<A>, view: View) -> Array3<A> {
    volume
        .permuted_axes(volume_major_axes(view))
        .as_standard_layout()
        .into_owned()
}

/// 对 `(N, H, W, C)` 概率体数据的空间部分做 [`from_slice_major`]. 通道轴保持在最后.
pub fn probs_from_slice_major(prob: ArrayView4<f32>, view: View) -> Array4<f32> {
    prob.permuted_axes(with_channel(volume_major_axes(view)))
        .as_standard_layout()
        .into_owned()
}

/// 送入网络前的模态轴序修正. MR 数据把轴 0 移到最后, CT 数据原样复制.
pub fn to_network_order<A: Clone>(volume: ArrayView3<A>, modality: Modality) -> Array3<A> {
    if modality.needs_axis_correction() {
        volume.permuted_axes([1, 2, 0]).as_standard_layout().into_owned()
    } else {
        volume.to_owned()
    }
}

/// 网络输出的模态轴序修正 (在 [`probs_from_slice_major`] 之后调用).
/// MR 概率把空间轴 2 移到轴 0, 恰好抵消 [`to_network_order`]; CT 原样返回.
pub fn restore_storage_order(prob: Array4<f32>, modality: Modality) -> Array4<f32> {
    if modality.needs_axis_correction() {
        prob.permuted_axes([2, 0, 1, 3])
            .as_standard_layout()
            .into_owned()
    } else {
        prob
    }
}

/// 与 [`restore_storage_order`] 相同, 但作用于 3D 体数据.
pub fn restore_storage_order_3d<A: Clone>(volume: Array3<A>, modality: Modality) -> Array3<A> {
    if modality.needs_axis_correction() {
        volume.permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
    } else {
        volume
    }
}
