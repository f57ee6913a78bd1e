use image::RgbImage;
use rayon::prelude::*;

use super::{ExtractorOutcome, FeatureExtractor, Indicator};
use crate::frame::{mean_std, SampledFrame};

/// 色彩熵波动
///
/// 每帧计算色调-饱和度二维直方图的香农熵（比特），
/// 熵在序列上剧烈波动说明色彩分布不连贯。
#[derive(Debug, Clone)]
pub struct ColorEntropyVariation {
    /// 色调方向的分箱数
    pub hue_bins: usize,
    /// 饱和度方向的分箱数
    pub saturation_bins: usize,
    /// 归一化后每个分箱的下限，避免 log(0)
    pub bin_floor: f64,
    /// 熵标准差的归一化除数
    pub entropy_std_divisor: f64,
}

impl Default for ColorEntropyVariation {
    fn default() -> Self {
        Self {
            hue_bins: 32,
            saturation_bins: 32,
            bin_floor: 1e-6,
            entropy_std_divisor: 1.0,
        }
    }
}

impl ColorEntropyVariation {
    fn frame_entropy(&self, img: &RgbImage) -> f64 {
        let mut hist = vec![0u64; self.hue_bins * self.saturation_bins];
        for pixel in img.pixels() {
            let (h, s, _) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            let hb = ((h / 360.0 * self.hue_bins as f64) as usize).min(self.hue_bins - 1);
            let sb = ((s * self.saturation_bins as f64) as usize).min(self.saturation_bins - 1);
            hist[hb * self.saturation_bins + sb] += 1;
        }

        let total = hist.iter().sum::<u64>().max(1) as f64;
        hist.iter()
            .map(|&count| (count as f64 / total).max(self.bin_floor))
            .map(|p| -p * p.log2())
            .sum()
    }
}

impl FeatureExtractor for ColorEntropyVariation {
    fn indicator(&self) -> Indicator {
        Indicator::ColorEntropyVariation
    }

    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome {
        if frames.is_empty() {
            return ExtractorOutcome::degraded("没有可用的帧");
        }
        if frames.iter().any(|f| f.width() == 0 || f.height() == 0) {
            return ExtractorOutcome::degraded("帧为空");
        }

        let entropies: Vec<f64> = frames.par_iter().map(|f| self.frame_entropy(f.pixels())).collect();
        let (_, std) = mean_std(&entropies);
        ExtractorOutcome::from_raw(std / self.entropy_std_divisor)
    }
}

/// RGB 转 HSV，色调以度为单位 [0, 360)，饱和度与明度在 [0, 1]
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}
