//! ONNX Runtime 推理后端. 需要开启 `onnx` feature.
//!
//! 导出的网络以 `(N, H, W, 1)` f32 为输入, `(N, H, W, C)` f32 softmax 概率为输出
//! (Keras 的通道在后布局).

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array4, ArrayView3};
use ort::session::Session;
use ort::value::TensorRef;

use crate::config::View;
use crate::error::{PredictError, PredictResult};
use crate::infer::{ModelLoader, SegmentationModel};

/// 一个独占会话的 ONNX 模型. 会话在加载时一次性建立, 之后只做推理.
pub struct OnnxModel {
    session: Mutex<Session>,
    name: String,
}

/// 区分资源耗尽和其他运行时错误.
fn classify(name: &str, stage: &str, e: impl std::fmt::Display) -> PredictError {
    let msg = format!("model `{name}` {stage}: {e}");
    let lower = msg.to_ascii_lowercase();
    if lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("bad_alloc")
    {
        PredictError::ResourceExhaustion(msg)
    } else {
        PredictError::Inference(msg)
    }
}

impl OnnxModel {
    /// 从 `.onnx` 文件建立会话. 其他扩展名返回 [`PredictError::UnrecognizedFormat`].
    pub fn open<P: AsRef<Path>>(path: P) -> PredictResult<Self> {
        let path = path.as_ref();
        let is_onnx = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));
        if !is_onnx {
            return Err(PredictError::UnrecognizedFormat(path.to_owned()));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_owned();
        let session = Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| classify(&name, "loading", e))?;
        Ok(Self {
            session: Mutex::new(session),
            name,
        })
    }
}

impl SegmentationModel for OnnxModel {
    fn predict(&self, slices: ArrayView3<f32>) -> PredictResult<Array4<f32>> {
        let (n, h, w) = slices.dim();
        let input = slices.as_standard_layout();
        let data = input
            .as_slice()
            .ok_or_else(|| PredictError::Inference("input slices are not contiguous".into()))?;
        let dims: Vec<i64> = vec![n as i64, h as i64, w as i64, 1];
        let tensor = TensorRef::from_array_view((dims, data))
            .map_err(|e| classify(&self.name, "tensor conversion", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| PredictError::Inference(format!("model `{}`: session lock poisoned", self.name)))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| classify(&self.name, "forward pass", e))?;
        let (shape, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| classify(&self.name, "output extraction", e))?;

        let shape: Vec<usize> = shape.iter().map(|d| (*d).max(0) as usize).collect();
        let [on, oh, ow, oc] = shape[..] else {
            return Err(PredictError::shape("onnx output rank", &[n, h, w, 0], &shape));
        };
        Array4::from_shape_vec((on, oh, ow, oc), probs.to_vec())
            .map_err(|_| PredictError::shape("onnx output", &[on, oh, ow, oc], &[probs.len()]))
    }
}

/// 为每个模型文件建立独立会话的加载器.
#[derive(Copy, Clone, Debug, Default)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
    fn load(&self, view: View, path: &Path) -> PredictResult<Box<dyn SegmentationModel>> {
        log::debug!("creating onnx session for {view} view: {}", path.display());
        Ok(Box::new(OnnxModel::open(path)?))
    }
}
