use std::ops::{Index, IndexMut};

use ndarray::{Array3, ArrayView3, ArrayViewMut3};
use nifti::NiftiHeader;

use crate::Idx3d;

mod io;
mod window;

pub use io::{read_image, read_label, write_label, VolumeFormat};
pub use window::{normalize_intensity, IntensityWindow};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据的物理空间元信息.
///
/// 所有分量均按 **数组轴** 排列 (与 [`Volume`] 的 `(d0, d1, d2)` 索引一致),
/// 而不是按 nifti 的 `(x, y, z)` 排列. 第 `a` 个数组轴上相邻体素的物理距离为
/// `spacing[a]`, 方向为单位向量 `direction[a]`. `origin` 是体素 `(0, 0, 0)`
/// 中心的物理坐标.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Geometry {
    origin: [f64; 3],
    spacing: [f64; 3],
    direction: [[f64; 3]; 3],
}

impl Default for Geometry {
    #[inline]
    fn default() -> Self {
        Self::identity()
    }
}

impl Geometry {
    /// 原点为 0, 分辨率为 1 mm, 方向为单位阵.
    pub const fn identity() -> Self {
        Self {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// 直接创建. 非正或非有限的分辨率会被替换为 1.0.
    pub fn new(origin: [f64; 3], spacing: [f64; 3], direction: [[f64; 3]; 3]) -> Self {
        Self {
            origin,
            spacing: spacing.map(|s| if s.is_finite() && s > 0.0 { s } else { 1.0 }),
            direction,
        }
    }

    /// 原点物理坐标.
    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// 各数组轴的体素分辨率, 以毫米为单位.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 各数组轴的物理方向 (单位向量).
    #[inline]
    pub fn direction(&self) -> [[f64; 3]; 3] {
        self.direction
    }

    /// 保持原点和方向, 替换分辨率.
    #[must_use]
    pub fn with_spacing(&self, spacing: [f64; 3]) -> Self {
        Self::new(self.origin, spacing, self.direction)
    }

    /// 最小的体素分辨率.
    #[inline]
    pub fn min_spacing(&self) -> f64 {
        self.spacing.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    pub fn is_isotropic(&self) -> bool {
        let [a, b, c] = self.spacing;
        a == b && a == c
    }

    /// 连续体素索引 -> 物理坐标.
    pub fn index_to_physical(&self, idx: [f64; 3]) -> [f64; 3] {
        let mut p = self.origin;
        for (axis, i) in idx.iter().enumerate() {
            let step = i * self.spacing[axis];
            for (k, pk) in p.iter_mut().enumerate() {
                *pk += self.direction[axis][k] * step;
            }
        }
        p
    }

    /// 物理坐标 -> 连续体素索引. 要求方向向量两两正交.
    pub fn physical_to_index(&self, p: [f64; 3]) -> [f64; 3] {
        let d = [
            p[0] - self.origin[0],
            p[1] - self.origin[1],
            p[2] - self.origin[2],
        ];
        let mut idx = [0.0; 3];
        for (axis, i) in idx.iter_mut().enumerate() {
            let dir = &self.direction[axis];
            *i = (dir[0] * d[0] + dir[1] * d[1] + dir[2] * d[2]) / self.spacing[axis];
        }
        idx
    }

    /// 从 nifti header 中读取元信息. 优先使用 sform, 其次 qform,
    /// 都缺失时退化为 `pixdim` + 单位方向.
    pub fn from_header(h: &NiftiHeader) -> Self {
        // 按 nifti 轴 (i, j, k) 排列的列向量和分辨率.
        let (cols, spacing, origin) = if h.sform_code > 0 {
            let mut cols = [[0.0; 3]; 3];
            for (j, col) in cols.iter_mut().enumerate() {
                *col = [h.srow_x[j] as f64, h.srow_y[j] as f64, h.srow_z[j] as f64];
            }
            let spacing = cols.map(norm);
            let origin = [h.srow_x[3] as f64, h.srow_y[3] as f64, h.srow_z[3] as f64];
            (cols, spacing, origin)
        } else if h.qform_code > 0 {
            let rot = quaternion_to_matrix(
                h.quatern_b as f64,
                h.quatern_c as f64,
                h.quatern_d as f64,
            );
            let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let mut cols = [[0.0; 3]; 3];
            for (j, col) in cols.iter_mut().enumerate() {
                *col = [rot[0][j], rot[1][j], rot[2][j]];
            }
            cols[2] = cols[2].map(|v| v * qfac);
            let spacing = [1, 2, 3].map(|j| (h.pixdim[j] as f64).abs());
            let origin = [
                h.qoffset_x as f64,
                h.qoffset_y as f64,
                h.qoffset_z as f64,
            ];
            (cols, spacing, origin)
        } else {
            let cols = Self::identity().direction;
            let spacing = [1, 2, 3].map(|j| (h.pixdim[j] as f64).abs());
            (cols, spacing, [0.0; 3])
        };

        // (i, j, k) -> (d0, d1, d2) = (k, j, i).
        let mut direction = [[0.0; 3]; 3];
        let mut sp = [1.0; 3];
        for axis in 0..3 {
            let j = 2 - axis;
            let s = spacing[j];
            sp[axis] = s;
            direction[axis] = if s > 0.0 && h.sform_code > 0 {
                cols[j].map(|v| v / s)
            } else {
                cols[j]
            };
        }
        Self::new(origin, sp, direction)
    }

    /// 将元信息写入 `h` 的 `pixdim` 和 sform 部分, 并关闭 qform.
    pub fn write_to_header(&self, h: &mut NiftiHeader) {
        for axis in 0..3 {
            let j = 2 - axis;
            let s = self.spacing[axis];
            h.pixdim[j + 1] = s as f32;
            h.srow_x[j] = (self.direction[axis][0] * s) as f32;
            h.srow_y[j] = (self.direction[axis][1] * s) as f32;
            h.srow_z[j] = (self.direction[axis][2] * s) as f32;
        }
        h.srow_x[3] = self.origin[0] as f32;
        h.srow_y[3] = self.origin[1] as f32;
        h.srow_z[3] = self.origin[2] as f32;
        h.pixdim[0] = 1.0;
        h.sform_code = h.sform_code.max(1);
        h.qform_code = 0;
    }
}

#[inline]
fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// nifti 四元数 `(b, c, d)` -> 旋转矩阵 (行优先).
fn quaternion_to_matrix(b: f64, c: f64, d: f64) -> [[f64; 3]; 3] {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - b * b - c * c,
        ],
    ]
}

/// 带物理空间元信息的 3D 体数据. 数据按 `(d0, d1, d2)` 行优先存储.
///
/// 对从 nifti 读入的体数据, 会同时保留原 header, 写出时以其作为参考.
#[derive(Debug, Clone)]
pub struct Volume<T> {
    data: Array3<T>,
    geometry: Geometry,
    header: Option<BoxedHeader>,
}

/// 体素值为强度 (HU 或 MR 信号) 的体数据.
pub type ImageVolume = Volume<f32>;

/// 体素值为临床标签的体数据.
pub type LabelVolume = Volume<u16>;

impl<T> Volume<T> {
    /// 直接由数组和元信息创建.
    #[inline]
    pub fn new(data: Array3<T>, geometry: Geometry) -> Self {
        Self {
            data,
            geometry,
            header: None,
        }
    }

    #[inline]
    pub(crate) fn with_header(mut self, header: BoxedHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// 获取数据形状大小.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获取数据体素个数.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 物理空间元信息.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// 读入时的 nifti header (若有).
    #[inline]
    pub fn header(&self) -> Option<&NiftiHeader> {
        self.header.as_deref()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, T> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, T> {
        self.data.view_mut()
    }

    /// 取出底层数组, 丢弃元信息.
    #[inline]
    pub fn into_data(self) -> Array3<T> {
        self.data
    }

    /// 用新数组替换数据, 保留 header. 新数组可以有不同形状和元信息.
    pub fn replace<U>(&self, data: Array3<U>, geometry: Geometry) -> Volume<U> {
        Volume {
            data,
            geometry,
            header: self.header.clone(),
        }
    }

    /// 逐体素变换, 保留形状和全部元信息.
    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Volume<U> {
        self.replace(self.data.map(f), self.geometry)
    }
}

impl<T> Index<Idx3d> for Volume<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl<T> IndexMut<Idx3d> for Volume<T> {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl LabelVolume {
    /// 获取 3D 标注中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u16) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 将 3D 标注中值为 `old` 的体素全部替换为 `new`.
    ///
    /// 返回总共成功替换的个数.
    pub fn replace_label(&mut self, old: u16, new: u16) -> usize {
        let mut cnt = 0usize;
        self.data
            .iter_mut()
            .filter(|pix| **pix == old)
            .for_each(|p| {
                cnt += 1;
                *p = new;
            });
        cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_index_physical_roundtrip() {
        let g = Geometry::new(
            [10.0, -5.0, 2.5],
            [2.0, 0.5, 0.75],
            [[0.0, 0.0, 1.0], [0.0, -1.0, 0.0], [1.0, 0.0, 0.0]],
        );
        let idx = [3.0, 7.5, 1.25];
        let p = g.index_to_physical(idx);
        assert!(close(p, [10.0 + 1.25 * 0.75, -5.0 - 7.5 * 0.5, 2.5 + 3.0 * 2.0]));
        assert!(close(g.physical_to_index(p), idx));
    }

    #[test]
    fn test_header_roundtrip() {
        let g = Geometry::new(
            [-100.0, 50.0, 12.0],
            [2.5, 0.8, 0.6],
            [[0.0, 0.0, 1.0], [0.0, -1.0, 0.0], [-1.0, 0.0, 0.0]],
        );
        let mut h = NiftiHeader::default();
        g.write_to_header(&mut h);
        let back = Geometry::from_header(&h);
        assert!(close(back.origin(), g.origin()));
        assert!(close(back.spacing(), g.spacing()));
        for axis in 0..3 {
            assert!(close(back.direction()[axis], g.direction()[axis]));
        }
    }

    #[test]
    fn test_identity_quaternion_header() {
        let mut h = NiftiHeader::default();
        h.qform_code = 1;
        h.pixdim = [1.0, 0.5, 0.6, 2.0, 0.0, 0.0, 0.0, 0.0];
        h.qoffset_x = 1.0;
        let g = Geometry::from_header(&h);
        assert!(close(g.spacing(), [2.0, 0.6, 0.5]));
        assert!(close(g.origin(), [1.0, 0.0, 0.0]));
        assert!(close(g.direction()[0], [0.0, 0.0, 1.0]));
        assert!(close(g.direction()[2], [1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_label_replace() {
        let mut v = LabelVolume::new(
            Array3::from_shape_vec((1, 2, 2), vec![421, 420, 0, 421]).unwrap(),
            Geometry::identity(),
        );
        assert_eq!(v.replace_label(421, 420), 2);
        assert_eq!(v.count(420), 3);
        assert_eq!(v[(0, 1, 0)], 0);
    }
}
