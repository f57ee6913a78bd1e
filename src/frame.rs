use image::{imageops, GrayImage, RgbImage};

use crate::features::BlockStepStats;

/// 采样得到的一帧
///
/// 序列中的插入顺序即时间顺序，构造后不可变。
/// 灰度平面在构造时计算一次，各特征提取器共享。
#[derive(Debug, Clone)]
pub struct SampledFrame {
    index: usize,
    timestamp: f64,
    pixels: RgbImage,
    luma: GrayImage,
    native_block_stats: Option<BlockStepStats>,
}

impl SampledFrame {
    pub fn new(index: usize, timestamp: f64, pixels: RgbImage) -> Self {
        let luma = imageops::grayscale(&pixels);
        Self {
            index,
            timestamp,
            pixels,
            luma,
            native_block_stats: None,
        }
    }

    /// 附上缩放前在原始分辨率上测得的块边界统计
    pub fn with_native_block_stats(mut self, stats: BlockStepStats) -> Self {
        self.native_block_stats = Some(stats);
        self
    }

    /// 在采样序列中的序号（从 0 开始）
    pub fn index(&self) -> usize {
        self.index
    }

    /// 距视频开头的秒数
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn luma(&self) -> &GrayImage {
        &self.luma
    }

    pub fn native_block_stats(&self) -> Option<&BlockStepStats> {
        self.native_block_stats.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// 将灰度图转换为行优先的 f64 平面
pub(crate) fn luma_plane(luma: &GrayImage) -> Vec<f64> {
    luma.as_raw().iter().map(|&v| v as f64).collect()
}

/// 总体均值与标准差（与 numpy 的默认 std 一致，ddof = 0）
pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
