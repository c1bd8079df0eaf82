//! 体数据文件读写. 按扩展名分派格式.

use std::path::Path;

use ndarray::{Array3, ArrayD};
use ndarray_npy::{read_npy, write_npy, ReadNpyError};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use num::ToPrimitive;

use super::{Geometry, ImageVolume, LabelVolume, Volume};
use crate::error::{PredictError, PredictResult};

/// 支持的体数据文件格式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VolumeFormat {
    /// `.nii` 或 `.nii.gz`. 带完整的物理空间元信息.
    Nifti,

    /// `.npy`. 只有数组, 元信息取 [`Geometry::identity`].
    Npy,
}

impl VolumeFormat {
    /// 由文件扩展名判断格式. 不支持的扩展名返回
    /// [`PredictError::UnrecognizedFormat`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> PredictResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Ok(Self::Nifti)
        } else if name.ends_with(".npy") {
            Ok(Self::Npy)
        } else {
            Err(PredictError::UnrecognizedFormat(path.to_owned()))
        }
    }
}

/// 读入 nifti 文件, 返回 `(d0, d1, d2)` = `(z, y, x)` 排列的数组和 header.
fn read_nifti(path: &Path) -> PredictResult<(Array3<f32>, Box<NiftiHeader>)> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = Box::new(obj.header().clone());
    let [_, x, y, z, ..] = header.dim;
    let shape = (z.max(1) as usize, y.max(1) as usize, x.max(1) as usize);

    // [x, y, z, (t)] -> [(t), z, y, x].
    let data: ArrayD<f32> = obj.into_volume().into_ndarray::<f32>()?.reversed_axes();

    // The nature of nifti data field layout.
    debug_assert!(data.is_standard_layout());

    let found = data.shape().to_vec();
    let data = Array3::from_shape_vec(shape, data.into_raw_vec()).map_err(|_| {
        PredictError::shape("nifti volume", &[shape.0, shape.1, shape.2], &found)
    })?;
    Ok((data, header))
}

/// 读入 npy 文件. 依次尝试 `f32`, `f64`, `i16`, `u16`, `u8` 元素类型.
fn read_npy_as_f32(path: &Path) -> PredictResult<Array3<f32>> {
    fn retry<T, F>(r: Result<Array3<T>, ReadNpyError>, next: F) -> Result<Array3<f32>, ReadNpyError>
    where
        T: Copy + ToPrimitive,
        F: FnOnce() -> Result<Array3<f32>, ReadNpyError>,
    {
        match r {
            Ok(a) => Ok(a.mapv(|v| v.to_f32().unwrap_or(0.0))),
            Err(ReadNpyError::WrongDescriptor(_)) => next(),
            Err(e) => Err(e),
        }
    }

    let data = retry(read_npy::<_, Array3<f32>>(path), || {
        retry(read_npy::<_, Array3<f64>>(path), || {
            retry(read_npy::<_, Array3<i16>>(path), || {
                retry(read_npy::<_, Array3<u16>>(path), || {
                    read_npy::<_, Array3<u8>>(path).map(|a| a.mapv(f32::from))
                })
            })
        })
    })?;
    Ok(data)
}

fn read_f32_volume(path: &Path) -> PredictResult<ImageVolume> {
    match VolumeFormat::from_path(path)? {
        VolumeFormat::Nifti => {
            let (data, header) = read_nifti(path)?;
            let geometry = Geometry::from_header(&header);
            Ok(Volume::new(data, geometry).with_header(header))
        }
        VolumeFormat::Npy => Ok(Volume::new(read_npy_as_f32(path)?, Geometry::identity())),
    }
}

/// 读入强度体数据.
pub fn read_image<P: AsRef<Path>>(path: P) -> PredictResult<ImageVolume> {
    read_f32_volume(path.as_ref())
}

/// 读入标签体数据. 体素值四舍五入到 `u16`; 负值及非有限值视为背景.
///
/// 注意该函数 **不会** 折叠遗留标签, 载入真值请使用
/// [`crate::label::load_ground_truth`].
pub fn read_label<P: AsRef<Path>>(path: P) -> PredictResult<LabelVolume> {
    let vol = read_f32_volume(path.as_ref())?;
    Ok(vol.map(|v| v.round().to_u16().unwrap_or(0)))
}

/// 以 16-bit 有符号整数写出标签体数据.
///
/// nifti 输出以读入时的 header 为参考 (若有), 并用体数据的元信息覆盖
/// 分辨率、sform 和缩放参数.
pub fn write_label<P: AsRef<Path>>(volume: &LabelVolume, path: P) -> PredictResult<()> {
    let path = path.as_ref();
    let format = VolumeFormat::from_path(path)?;
    let data: Array3<i16> = volume.data().mapv(|v| v.to_i16().unwrap_or(i16::MAX));
    match format {
        VolumeFormat::Nifti => {
            let mut header = volume.header().cloned().unwrap_or_default();
            volume.geometry().write_to_header(&mut header);
            header.scl_slope = 1.0;
            header.scl_inter = 0.0;
            // [z, y, x] -> [x, y, z].
            let xyz = data.reversed_axes();
            WriterOptions::new(path)
                .reference_header(&header)
                .write_nifti(&xyz)?;
        }
        VolumeFormat::Npy => write_npy(path, &data)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dispatch() {
        assert_eq!(
            VolumeFormat::from_path("a/b/ct_1001.nii.gz").unwrap(),
            VolumeFormat::Nifti
        );
        assert_eq!(VolumeFormat::from_path("x.NII").unwrap(), VolumeFormat::Nifti);
        assert_eq!(VolumeFormat::from_path("x.npy").unwrap(), VolumeFormat::Npy);
        assert!(matches!(
            VolumeFormat::from_path("x.vti"),
            Err(PredictError::UnrecognizedFormat(_))
        ));
        assert!(read_image("missing.mha").is_err());
    }

    #[test]
    fn test_nifti_label_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label.nii.gz");

        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| {
            [0u16, 205, 420, 500, 850][(z + y + x) % 5]
        });
        let geometry = Geometry::new(
            [-20.0, 15.0, 3.0],
            [2.0, 0.75, 0.5],
            Geometry::identity().direction(),
        );
        let vol = LabelVolume::new(data.clone(), geometry);
        write_label(&vol, &path).unwrap();

        let back = read_label(&path).unwrap();
        assert_eq!(back.shape(), (3, 4, 5));
        assert_eq!(back.data(), data.view());
        let sp = back.geometry().spacing();
        assert!((sp[0] - 2.0).abs() < 1e-6 && (sp[2] - 0.5).abs() < 1e-6);
        assert!((back.geometry().origin()[0] + 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_npy_label_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label.npy");
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| ((z * 12 + y * 4 + x) * 10) as u16);
        write_label(&LabelVolume::new(data.clone(), Geometry::identity()), &path).unwrap();

        let back = read_label(&path).unwrap();
        assert_eq!(back.data(), data.view());
        assert_eq!(*back.geometry(), Geometry::identity());
    }
}
