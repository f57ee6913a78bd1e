use rayon::prelude::*;

use super::{ExtractorOutcome, FeatureExtractor, Indicator};
use crate::frame::SampledFrame;

/// 压缩伪影（块效应）
///
/// 在固定 8x8 网格边界上统计亮度跳变，与块内部的跳变对比。
/// 自然视频重编码后两者接近，块边界明显更“整齐”时分数升高。
#[derive(Debug, Clone)]
pub struct CompressionArtifact {
    /// 编解码块大小
    pub block_size: u32,
    /// 超过该值的跳变视为真实边缘，不计入统计
    pub edge_magnitude_threshold: f64,
    /// 边界/内部比值超出 1 的部分除以该值后得到分数
    pub blockiness_range: f64,
}

impl Default for CompressionArtifact {
    fn default() -> Self {
        Self {
            block_size: 8,
            edge_magnitude_threshold: 30.0,
            blockiness_range: 1.0,
        }
    }
}

/// 亮度跳变在块边界与块内部的统计
///
/// 记录测量时使用的网格参数，参数不同的提取器不会误用这份统计。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStepStats {
    block_size: u32,
    edge_magnitude_threshold: f64,
    boundary_sum: f64,
    boundary_count: u64,
    interior_sum: f64,
    interior_count: u64,
}

impl BlockStepStats {
    fn empty(block_size: u32, edge_magnitude_threshold: f64) -> Self {
        Self {
            block_size,
            edge_magnitude_threshold,
            boundary_sum: 0.0,
            boundary_count: 0,
            interior_sum: 0.0,
            interior_count: 0,
        }
    }

    fn push(&mut self, step: f64, on_boundary: bool) {
        if on_boundary {
            self.boundary_sum += step;
            self.boundary_count += 1;
        } else {
            self.interior_sum += step;
            self.interior_count += 1;
        }
    }

    /// 块效应超出量，范围 [0, 1]
    fn excess(&self, blockiness_range: f64) -> f64 {
        if self.boundary_count == 0 || self.interior_count == 0 {
            return 0.0;
        }

        let boundary_mean = self.boundary_sum / self.boundary_count as f64;
        let interior_mean = self.interior_sum / self.interior_count as f64;
        if boundary_mean + interior_mean < 1e-9 {
            // 完全平坦的画面没有块效应可言
            return 0.0;
        }

        let ratio = boundary_mean / interior_mean.max(1e-6);
        ((ratio - 1.0).max(0.0) / blockiness_range).min(1.0)
    }
}

impl CompressionArtifact {
    /// 在一个 8 位亮度平面上统计跳变，`stride` 为每行字节数
    ///
    /// 网格从平面左上角开始，平面必须是解码后的原始分辨率，
    /// 缩放之后的画面与编码块已经对不齐。
    pub fn measure(&self, data: &[u8], width: usize, height: usize, stride: usize) -> BlockStepStats {
        let block = self.block_size.max(1) as usize;
        let mut stats = BlockStepStats::empty(self.block_size, self.edge_magnitude_threshold);
        if width < 2 || height < 2 || stride < width || data.len() < stride * (height - 1) + width {
            return stats;
        }

        // 水平方向：x 与 x+1 之间的跳变，x+1 落在块起点即为边界
        for y in 0..height {
            let row = &data[y * stride..y * stride + width];
            for x in 0..(width - 1) {
                let step = (row[x + 1] as f64 - row[x] as f64).abs();
                if step < self.edge_magnitude_threshold {
                    stats.push(step, (x + 1) % block == 0);
                }
            }
        }

        // 垂直方向
        for y in 0..(height - 1) {
            for x in 0..width {
                let step = (data[(y + 1) * stride + x] as f64 - data[y * stride + x] as f64).abs();
                if step < self.edge_magnitude_threshold {
                    stats.push(step, (y + 1) % block == 0);
                }
            }
        }

        stats
    }

    /// 单帧的块效应超出量
    ///
    /// 采样时按原始分辨率测得的统计优先，没有时退回到帧本身的灰度平面。
    fn frame_excess(&self, frame: &SampledFrame) -> f64 {
        let stats = match frame.native_block_stats() {
            Some(stats)
                if stats.block_size == self.block_size
                    && stats.edge_magnitude_threshold == self.edge_magnitude_threshold =>
            {
                *stats
            }
            _ => {
                let luma = frame.luma();
                let (width, height) = luma.dimensions();
                self.measure(luma.as_raw(), width as usize, height as usize, width as usize)
            }
        };
        stats.excess(self.blockiness_range)
    }
}

impl FeatureExtractor for CompressionArtifact {
    fn indicator(&self) -> Indicator {
        Indicator::CompressionArtifact
    }

    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome {
        if frames.is_empty() {
            return ExtractorOutcome::degraded("没有可用的帧");
        }
        let min_side = self.block_size * 2;
        if frames.iter().any(|f| f.width() < min_side || f.height() < min_side) {
            return ExtractorOutcome::degraded(format!("帧尺寸小于 {min_side}x{min_side}，无法分析块边界"));
        }

        let excess: Vec<f64> = frames.par_iter().map(|f| self.frame_excess(f)).collect();
        let mean = excess.iter().sum::<f64>() / excess.len() as f64;
        ExtractorOutcome::from_raw(mean)
    }
}
