use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, Module, ModuleT, VarBuilder};
use image::imageops::{self, FilterType};
use tracing::{error, info};

use crate::error::AnalysisError;
use crate::frame::SampledFrame;

/// 模型输入边长
pub const MODEL_INPUT_SIZE: usize = 256;
/// 每批推理的帧数
pub const INFERENCE_BATCH_SIZE: usize = 8;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 帧序列分类器
///
/// 实现必须只读：同一个实例会被多个分析请求同时使用。
pub trait FrameClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// 返回整个序列为合成内容的概率 p_model
    ///
    /// 耗时较长的实现应在批次之间检查 `cancel`，置位时返回 `AnalysisError::Cancelled`。
    fn predict(&self, frames: &[SampledFrame], cancel: &AtomicBool) -> Result<f64, AnalysisError>;
}

/// 启动时决定的评分方式
#[derive(Clone)]
pub enum ScoringMode {
    HeuristicOnly,
    ModelAugmented(Arc<dyn FrameClassifier>),
}

impl fmt::Debug for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringMode::HeuristicOnly => f.write_str("HeuristicOnly"),
            ScoringMode::ModelAugmented(classifier) => write!(f, "ModelAugmented({})", classifier.name()),
        }
    }
}

impl ScoringMode {
    /// 根据配置加载模型
    ///
    /// 加载失败只记录一次错误，进程继续以纯启发式方式运行。
    pub fn from_weights_path(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("ℹ️ [模型] 未配置 MODEL_WEIGHTS_PATH，使用纯启发式检测");
            return ScoringMode::HeuristicOnly;
        };

        let start = Instant::now();
        match MesoNetClassifier::load(path) {
            Ok(classifier) => {
                info!(
                    "✅ [模型] 加载完成: {}，耗时: {:.2}秒",
                    path.display(),
                    start.elapsed().as_secs_f64()
                );
                ScoringMode::ModelAugmented(Arc::new(classifier))
            }
            Err(e) => {
                error!("❌ [模型] {}，本进程改用纯启发式检测", e);
                ScoringMode::HeuristicOnly
            }
        }
    }

    pub fn classifier(&self) -> Option<&Arc<dyn FrameClassifier>> {
        match self {
            ScoringMode::HeuristicOnly => None,
            ScoringMode::ModelAugmented(classifier) => Some(classifier),
        }
    }
}

/// 卷积块：conv3x3 -> batch-norm -> ReLU -> max-pool 2
struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl ConvBlock {
    fn new(in_channels: usize, out_channels: usize, conv_idx: usize, vb: &VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(in_channels, out_channels, 3, cfg, vb.pp(format!("features.{conv_idx}")))?;
        let norm = candle_nn::batch_norm(out_channels, 1e-5, vb.pp(format!("features.{}", conv_idx + 1)))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, false)?;
        xs.relu()?.max_pool2d(2)
    }
}

/// MesoNet 风格的小型 CNN，权重名与 PyTorch state_dict 一致
struct MesoNet {
    blocks: Vec<ConvBlock>,
    fc1: Linear,
    fc2: Linear,
}

impl MesoNet {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let blocks = vec![
            ConvBlock::new(3, 8, 0, &vb)?,
            ConvBlock::new(8, 8, 4, &vb)?,
            ConvBlock::new(8, 16, 8, &vb)?,
            ConvBlock::new(16, 16, 12, &vb)?,
        ];
        let fc1 = candle_nn::linear(16, 16, vb.pp("classifier.1"))?;
        let fc2 = candle_nn::linear(16, 1, vb.pp("classifier.4"))?;
        Ok(Self { blocks, fc1, fc2 })
    }

    /// 输入 (N, 3, H, W)，输出每帧的 sigmoid 概率 (N,)
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        // 全局平均池化
        let xs = xs.mean((2, 3))?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        let logits = self.fc2.forward(&xs)?;
        candle_nn::ops::sigmoid(&logits)?.flatten_all()
    }
}

/// 基于 candle 的 MesoNet 分类器，在 CPU 上推理
pub struct MesoNetClassifier {
    model: MesoNet,
    device: Device,
    batch_size: usize,
}

impl MesoNetClassifier {
    /// 从 safetensors 权重文件加载
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        if !path.is_file() {
            return Err(AnalysisError::ModelLoad(format!("权重文件不存在: {}", path.display())));
        }
        let device = Device::Cpu;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device) }
            .map_err(|e| AnalysisError::ModelLoad(format!("读取权重失败 {}: {}", path.display(), e)))?;
        Self::from_var_builder(vb, device)
    }

    fn from_var_builder(vb: VarBuilder, device: Device) -> Result<Self, AnalysisError> {
        let model = MesoNet::new(vb).map_err(|e| AnalysisError::ModelLoad(format!("权重与网络结构不匹配: {e}")))?;
        Ok(Self {
            model,
            device,
            batch_size: INFERENCE_BATCH_SIZE,
        })
    }

    /// 缩放到 256x256 并按 ImageNet 均值方差归一化，排成 NCHW
    fn preprocess(&self, frames: &[SampledFrame]) -> candle_core::Result<Tensor> {
        let plane = MODEL_INPUT_SIZE * MODEL_INPUT_SIZE;
        let mut data = vec![0f32; frames.len() * 3 * plane];

        for (n, frame) in frames.iter().enumerate() {
            let resized = imageops::resize(
                frame.pixels(),
                MODEL_INPUT_SIZE as u32,
                MODEL_INPUT_SIZE as u32,
                FilterType::Triangle,
            );
            let offset = n * 3 * plane;
            for (i, pixel) in resized.pixels().enumerate() {
                for c in 0..3 {
                    let v = pixel[c] as f32 / 255.0;
                    data[offset + c * plane + i] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
                }
            }
        }

        Tensor::from_vec(data, (frames.len(), 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE), &self.device)
    }
}

impl FrameClassifier for MesoNetClassifier {
    fn name(&self) -> &str {
        "mesonet"
    }

    fn predict(&self, frames: &[SampledFrame], cancel: &AtomicBool) -> Result<f64, AnalysisError> {
        if frames.is_empty() {
            return Err(AnalysisError::internal("模型推理没有输入帧"));
        }

        let mut total = 0.0f64;
        for batch in frames.chunks(self.batch_size) {
            if cancel.load(Ordering::Relaxed) {
                return Err(AnalysisError::Cancelled);
            }
            let probs = self
                .preprocess(batch)
                .and_then(|input| self.model.forward(&input))
                .and_then(|probs| probs.to_vec1::<f32>())
                .map_err(|e| AnalysisError::internal(format!("模型推理失败: {e}")))?;
            total += probs.iter().map(|&p| p as f64).sum::<f64>();
        }
        Ok(total / frames.len() as f64)
    }
}
