//! 几何重采样.
//!
//! 提供两类操作:
//!
//! 1. 纯数组缩放 ([`resample_to_shape`], [`resample_to_geometry`], [`resize_channels`]).
//!   坐标映射与 `skimage.transform.resize` 一致: 输出体素中心 `o` 对应输入连续坐标
//!   `(o + 0.5) * in / out - 0.5`, 越界部分钳制到边缘.
//!   与 `skimage` 不同, 缩小时不做高斯抗混叠平滑 (`anti_aliasing=False`),
//!   因此 512 -> 256 这类下采样的强度会与 `skimage` 默认结果有数值差异.
//! 2. 物理空间重采样 ([`resample_isotropic`], [`resample_label_onto`]).
//!   借助 [`Geometry`] 把目标网格的体素中心映射回源网格.
//!
//! 所有操作对相同输入都给出逐位相同的输出. 目标形状与源形状相同时直接复制.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};

use crate::config::View;
use crate::data::{Geometry, ImageVolume, LabelVolume};
use crate::error::{PredictError, PredictResult};
use crate::Idx3d;

/// 插值方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interpolation {
    /// 最近邻 (order 0). 用于离散标签.
    Nearest,

    /// 线性 (order 1). 用于连续强度和概率.
    Linear,
}

impl Interpolation {
    /// 由插值阶数得到插值方式. 只支持 0 和 1.
    #[inline]
    pub const fn from_order(order: u8) -> Option<Self> {
        match order {
            0 => Some(Self::Nearest),
            1 => Some(Self::Linear),
            _ => None,
        }
    }
}

/// 单轴插值表: 第 `o` 个输出位置取 `lo[o]`, `hi[o]` 两个源位置, `hi` 的权重为 `w[o]`.
struct AxisTable {
    lo: Vec<usize>,
    hi: Vec<usize>,
    w: Vec<f32>,
}

impl AxisTable {
    fn new(src_len: usize, dst_len: usize, interp: Interpolation) -> Self {
        let scale = src_len as f64 / dst_len as f64;
        let last = src_len.saturating_sub(1);
        let mut t = Self {
            lo: Vec::with_capacity(dst_len),
            hi: Vec::with_capacity(dst_len),
            w: Vec::with_capacity(dst_len),
        };
        for o in 0..dst_len {
            let c = ((o as f64 + 0.5) * scale - 0.5).clamp(0.0, last as f64);
            match interp {
                Interpolation::Nearest => {
                    let i = (c.round() as usize).min(last);
                    t.lo.push(i);
                    t.hi.push(i);
                    t.w.push(0.0);
                }
                Interpolation::Linear => {
                    let i = c.floor() as usize;
                    t.lo.push(i);
                    t.hi.push((i + 1).min(last));
                    t.w.push((c - i as f64) as f32);
                }
            }
        }
        t
    }
}

#[inline]
fn lerp(a: f32, b: f32, w: f32) -> f32 {
    if w == 0.0 {
        a
    } else {
        a + (b - a) * w
    }
}

fn check_resizable(src: &[usize], dst: Idx3d) -> PredictResult<()> {
    let (a, b, c) = dst;
    if src.iter().any(|n| *n == 0) || a == 0 || b == 0 || c == 0 {
        Err(PredictError::shape("resize", &[a, b, c], src))
    } else {
        Ok(())
    }
}

/// 最近邻缩放, 可用于任意可复制的体素类型.
pub fn resize_nearest<T: Clone>(src: ArrayView3<T>, shape: Idx3d) -> PredictResult<Array3<T>> {
    if src.dim() == shape {
        return Ok(src.to_owned());
    }
    check_resizable(src.shape(), shape)?;
    let (d0, d1, d2) = src.dim();
    let t0 = AxisTable::new(d0, shape.0, Interpolation::Nearest);
    let t1 = AxisTable::new(d1, shape.1, Interpolation::Nearest);
    let t2 = AxisTable::new(d2, shape.2, Interpolation::Nearest);
    Ok(Array3::from_shape_fn(shape, |(i, j, k)| {
        src[(t0.lo[i], t1.lo[j], t2.lo[k])].clone()
    }))
}

fn resize_linear(src: ArrayView3<f32>, shape: Idx3d) -> PredictResult<Array3<f32>> {
    if src.dim() == shape {
        return Ok(src.to_owned());
    }
    check_resizable(src.shape(), shape)?;
    let (d0, d1, d2) = src.dim();
    let t0 = AxisTable::new(d0, shape.0, Interpolation::Linear);
    let t1 = AxisTable::new(d1, shape.1, Interpolation::Linear);
    let t2 = AxisTable::new(d2, shape.2, Interpolation::Linear);
    Ok(Array3::from_shape_fn(shape, |(i, j, k)| {
        let (i0, i1, wi) = (t0.lo[i], t0.hi[i], t0.w[i]);
        let (j0, j1, wj) = (t1.lo[j], t1.hi[j], t1.w[j]);
        let (k0, k1, wk) = (t2.lo[k], t2.hi[k], t2.w[k]);
        let c00 = lerp(src[(i0, j0, k0)], src[(i0, j0, k1)], wk);
        let c01 = lerp(src[(i0, j1, k0)], src[(i0, j1, k1)], wk);
        let c10 = lerp(src[(i1, j0, k0)], src[(i1, j0, k1)], wk);
        let c11 = lerp(src[(i1, j1, k0)], src[(i1, j1, k1)], wk);
        lerp(lerp(c00, c01, wj), lerp(c10, c11, wj), wi)
    }))
}

/// 把 `src` 缩放到任意形状 `shape`.
pub fn resample_to_geometry(
    src: ArrayView3<f32>,
    shape: Idx3d,
    interp: Interpolation,
) -> PredictResult<Array3<f32>> {
    match interp {
        Interpolation::Nearest => resize_nearest(src, shape),
        Interpolation::Linear => resize_linear(src, shape),
    }
}

/// 按视图缩放: 除 `view` 对应的轴保持原长度 (成为切片个数) 外,
/// 其余两个轴都线性缩放到 `size`.
pub fn resample_to_shape(src: ArrayView3<f32>, view: View, size: usize) -> PredictResult<Array3<f32>> {
    let mut shape = [size; 3];
    shape[view.axis()] = src.shape()[view.axis()];
    resize_linear(src, (shape[0], shape[1], shape[2]))
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};

        fn resize_each_channel(
            prob: ArrayView4<f32>,
            shape: Idx3d,
            interp: Interpolation,
        ) -> PredictResult<Vec<Array3<f32>>> {
            let channels: Vec<_> = prob.axis_iter(Axis(3)).collect();
            channels
                .into_par_iter()
                .map(|c| resample_to_geometry(c, shape, interp))
                .collect()
        }
    } else {
        fn resize_each_channel(
            prob: ArrayView4<f32>,
            shape: Idx3d,
            interp: Interpolation,
        ) -> PredictResult<Vec<Array3<f32>>> {
            prob.axis_iter(Axis(3))
                .map(|c| resample_to_geometry(c, shape, interp))
                .collect()
        }
    }
}

/// 逐通道缩放 `(d0, d1, d2, C)` 概率体数据的空间部分.
///
/// 开启 `rayon` feature 时, 各通道并行处理. 结果与串行一致.
pub fn resize_channels(
    prob: ArrayView4<f32>,
    shape: Idx3d,
    interp: Interpolation,
) -> PredictResult<Array4<f32>> {
    let (d0, d1, d2, _) = prob.dim();
    if (d0, d1, d2) == shape {
        return Ok(prob.to_owned());
    }

    let resized = resize_each_channel(prob, shape, interp)?;
    let views: Vec<_> = resized.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(3), &views).map_err(|_| {
        PredictError::shape("resize channels", &[shape.0, shape.1, shape.2], prob.shape())
    })
}

/// 源网格连续索引 = `m · 目标网格索引 + b`.
struct IndexMap {
    m: [[f64; 3]; 3],
    b: [f64; 3],
}

impl IndexMap {
    fn new(src: &Geometry, dst: &Geometry) -> Self {
        let b = src.physical_to_index(dst.origin());
        let mut m = [[0.0; 3]; 3];
        for axis in 0..3 {
            let mut unit = [0.0; 3];
            unit[axis] = 1.0;
            let p = src.physical_to_index(dst.index_to_physical(unit));
            for (r, row) in m.iter_mut().enumerate() {
                row[axis] = p[r] - b[r];
            }
        }
        Self { m, b }
    }

    #[inline]
    fn apply(&self, (i, j, k): Idx3d) -> [f64; 3] {
        let idx = [i as f64, j as f64, k as f64];
        let mut out = self.b;
        for (r, o) in out.iter_mut().enumerate() {
            *o += self.m[r][0] * idx[0] + self.m[r][1] * idx[1] + self.m[r][2] * idx[2];
        }
        out
    }
}

/// 把 `src` (元信息 `src_geom`) 最近邻重采样到目标网格. 落在源视野之外的体素取 `fill`.
pub fn resample_onto_nearest<T: Clone>(
    src: ArrayView3<T>,
    src_geom: &Geometry,
    shape: Idx3d,
    geom: &Geometry,
    fill: T,
) -> Array3<T> {
    if src.dim() == shape && src_geom == geom {
        return src.to_owned();
    }
    let map = IndexMap::new(src_geom, geom);
    let dims = src.dim();
    let lens = [dims.0, dims.1, dims.2];
    Array3::from_shape_fn(shape, |pos| {
        let c = map.apply(pos);
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            let r = c[axis].round();
            if r < 0.0 || r > (lens[axis] as f64 - 1.0) {
                return fill.clone();
            }
            idx[axis] = r as usize;
        }
        src[(idx[0], idx[1], idx[2])].clone()
    })
}

/// 把 `src` 线性重采样到目标网格. 距离源视野超过半个体素的位置取 `fill`.
pub fn resample_onto_linear(
    src: ArrayView3<f32>,
    src_geom: &Geometry,
    shape: Idx3d,
    geom: &Geometry,
    fill: f32,
) -> Array3<f32> {
    if src.dim() == shape && src_geom == geom {
        return src.to_owned();
    }
    let map = IndexMap::new(src_geom, geom);
    let dims = src.dim();
    let lens = [dims.0, dims.1, dims.2];
    Array3::from_shape_fn(shape, |pos| {
        let c = map.apply(pos);
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut w = [0f32; 3];
        for axis in 0..3 {
            let last = lens[axis] as f64 - 1.0;
            if c[axis] < -0.5 || c[axis] > last + 0.5 {
                return fill;
            }
            let x = c[axis].clamp(0.0, last);
            let f = x.floor();
            lo[axis] = f as usize;
            hi[axis] = (lo[axis] + 1).min(lens[axis] - 1);
            w[axis] = (x - f) as f32;
        }
        let at = |a: usize, b: usize, c: usize| src[(a, b, c)];
        let c00 = lerp(at(lo[0], lo[1], lo[2]), at(lo[0], lo[1], hi[2]), w[2]);
        let c01 = lerp(at(lo[0], hi[1], lo[2]), at(lo[0], hi[1], hi[2]), w[2]);
        let c10 = lerp(at(hi[0], lo[1], lo[2]), at(hi[0], lo[1], hi[2]), w[2]);
        let c11 = lerp(at(hi[0], hi[1], lo[2]), at(hi[0], hi[1], hi[2]), w[2]);
        lerp(lerp(c00, c01, w[1]), lerp(c10, c11, w[1]), w[0])
    })
}

/// 把强度体数据重采样到各向同性分辨率 (取原最小分辨率), 保持原点和方向.
///
/// 若原数据已经各向同性, 则返回一份复制.
pub fn resample_isotropic(volume: &ImageVolume, interp: Interpolation) -> ImageVolume {
    let geom = volume.geometry();
    if geom.is_isotropic() {
        return volume.clone();
    }
    let s = geom.min_spacing();
    let (d0, d1, d2) = volume.shape();
    let sp = geom.spacing();
    let len = |n: usize, a: usize| ((n as f64 * sp[a] / s).round() as usize).max(1);
    let shape = (len(d0, 0), len(d1, 1), len(d2, 2));
    let target = geom.with_spacing([s; 3]);
    let data = match interp {
        Interpolation::Linear => resample_onto_linear(volume.data(), geom, shape, &target, 0.0),
        Interpolation::Nearest => resample_onto_nearest(volume.data(), geom, shape, &target, 0.0),
    };
    volume.replace(data, target)
}

/// 把标签体数据最近邻重采样到 `reference` 的网格上 (形状与元信息都取自
/// `reference`). 视野之外的体素设为背景.
pub fn resample_label_onto<T>(label: &LabelVolume, reference: &crate::data::Volume<T>) -> LabelVolume {
    let data = resample_onto_nearest(
        label.data(),
        label.geometry(),
        reference.shape(),
        reference.geometry(),
        crate::consts::label::BACKGROUND,
    );
    reference.replace(data, *reference.geometry())
}
