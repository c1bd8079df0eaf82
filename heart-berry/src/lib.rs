#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 基于多视图 2D 分割网络集成, 对心脏 CT/MR 3D 体数据做全心分割预测.
//!
//! 一个体数据沿若干解剖视图 (轴向/冠状/矢状) 分解为 2D 切片栈, 每个视图由各自训练的
//! 网络推理, 逐视图的概率在 3D 中重组并重采样到同一网格, 最后融合为一个多类别标签体数据,
//! 并可以与真值比较得到逐类别 Dice 分数.
//!
//! 网络本身不在该 crate 内: 任何实现了 [`SegmentationModel`] 的类型都可以参与集成.
//! 打开 `onnx` feature 后, `onnx::OnnxModel` 提供基于 ONNX Runtime 的实现.
//!
//! # 注意
//!
//! 1. 体数据在内存中总是按 `(d0, d1, d2)` = nifti 的 `(z, y, x)` 存储,
//!   视图 `axial | coronal | sagittal` 对应数组轴 `0 | 1 | 2`.
//! 2. MR 数据在送入网络前会做一次固定的轴序修正, 输出时再修正回来.
//!   这是 [`Modality`] 的性质, 调用方无需也无法选择.
//! 3. 标签映射失败 (网络给出标签表之外的类别) 总是错误, 绝不钳制.
//!
//! # 开发计划
//!
//! ### 强度归一化与各向同性重采样 ✅
//!
//! CT 固定窗口, MR 百分位窗口.
//!
//! 实现位于 `heart-berry/src/data/window.rs` 和 `heart-berry/src/resample.rs`.
//!
//! ### 视图分解与重组 ✅
//!
//! 纯轴置换, 往返精确.
//!
//! 实现位于 `heart-berry/src/view.rs`.
//!
//! ### 分批推理 ✅
//!
//! 分批只是内存策略, 与不分批逐位相同.
//!
//! ### 集成融合 ✅
//!
//! 1. 平均融合 (按模型总数取平均). ✅
//! 2. 多数投票 (每个模型都投票, 平票取较小标签). ✅
//! 3. 单模型. ✅
//!
//! 实现位于 `heart-berry/src/fuse.rs`.
//!
//! ### 物理空间重采样 ✅
//!
//! 预测经由原点/分辨率/方向回到原始扫描网格.
//!
//! ### ONNX 推理后端 ✅
//!
//! 实现位于 `heart-berry/src/onnx.rs`, 需要 `onnx` feature.
//!
//! ### GPU 执行后端 ⌛️
//!
//! 目前 ONNX 会话只使用默认 (CPU) 执行后端.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

pub mod consts;
pub mod error;

pub mod config;

/// 3D 体数据基础数据结构及其读写.
pub mod data;

pub mod resample;
pub mod view;

pub mod infer;

#[cfg(feature = "onnx")]
pub mod onnx;

pub mod fuse;
pub mod label;
pub mod score;

pub mod predict;

pub mod dataset;
pub mod report;

pub mod prelude;

pub use config::{EnsembleConfig, EnsembleSpec, FusionPolicy, Modality, View};
pub use data::{Geometry, ImageVolume, IntensityWindow, LabelVolume, Volume};
pub use error::{PredictError, PredictResult};
pub use infer::{Ensemble, LoadedModel, ModelLoader, SegmentationModel};
pub use label::LabelTable;
pub use predict::{Prediction, Stage};
pub use score::DiceScores;
