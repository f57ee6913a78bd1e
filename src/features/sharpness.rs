use image::GrayImage;
use rayon::prelude::*;

use super::{ExtractorOutcome, FeatureExtractor, Indicator};
use crate::frame::{mean_std, SampledFrame};

/// 清晰度一致性
///
/// 逐帧计算拉普拉斯响应的方差（边缘能量），再看它在序列上的离散程度。
/// 过于一致和过于飘忽都会推高分数。
#[derive(Debug, Clone)]
pub struct SharpnessConsistency {
    /// 变异系数的归一化除数，越大越宽松
    pub consistency_divisor: f64,
    /// 变异系数低于该值视为“过于一致”
    pub uniform_cv_floor: f64,
    /// 过于一致时的最大附加分
    pub uniform_penalty: f64,
    /// 判定过于一致所需的最少帧数
    pub min_frames_for_uniformity: usize,
    /// 拉普拉斯方差低于该值的帧视为严重模糊
    pub min_laplacian_variance: f64,
    /// 模糊帧占比的附加分权重
    pub blur_penalty: f64,
}

impl Default for SharpnessConsistency {
    fn default() -> Self {
        Self {
            consistency_divisor: 2.0,
            uniform_cv_floor: 0.02,
            uniform_penalty: 0.5,
            min_frames_for_uniformity: 3,
            min_laplacian_variance: 50.0,
            blur_penalty: 0.2,
        }
    }
}

impl SharpnessConsistency {
    fn score(&self, variances: &[f64]) -> f64 {
        let (mean, std) = mean_std(variances);
        let cv = std / mean.max(1e-6);

        let erratic = (cv / self.consistency_divisor).min(1.0);

        let uniform = if variances.len() >= self.min_frames_for_uniformity && cv < self.uniform_cv_floor {
            self.uniform_penalty * (1.0 - cv / self.uniform_cv_floor)
        } else {
            0.0
        };

        let blurry = variances
            .iter()
            .filter(|&&v| v < self.min_laplacian_variance)
            .count() as f64
            / variances.len() as f64;

        erratic + uniform + blurry * self.blur_penalty
    }
}

impl FeatureExtractor for SharpnessConsistency {
    fn indicator(&self) -> Indicator {
        Indicator::SharpnessConsistency
    }

    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome {
        if frames.is_empty() {
            return ExtractorOutcome::degraded("没有可用的帧");
        }

        let variances: Option<Vec<f64>> = frames
            .par_iter()
            .map(|frame| laplacian_variance(frame.luma()))
            .collect();

        match variances {
            Some(variances) => ExtractorOutcome::from_raw(self.score(&variances)),
            None => ExtractorOutcome::degraded("帧尺寸小于 3x3，无法计算拉普拉斯响应"),
        }
    }
}

/// 4 邻域拉普拉斯响应的方差，只统计内部像素
pub(crate) fn laplacian_variance(img: &GrayImage) -> Option<f64> {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 {
        return None;
    }

    let w = width as usize;
    let data = img.as_raw();
    let mut responses = Vec::with_capacity((width as usize - 2) * (height as usize - 2));

    for y in 1..(height as usize - 1) {
        for x in 1..(w - 1) {
            let center = data[y * w + x] as f64;
            let up = data[(y - 1) * w + x] as f64;
            let down = data[(y + 1) * w + x] as f64;
            let left = data[y * w + x - 1] as f64;
            let right = data[y * w + x + 1] as f64;
            responses.push(up + down + left + right - 4.0 * center);
        }
    }

    let (_, std) = mean_std(&responses);
    Some(std * std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames;
    use image::Luma;

    #[test]
    fn test_laplacian_variance_of_flat_image_is_zero() {
        let img = GrayImage::from_pixel(10, 10, Luma([128]));
        assert_eq!(laplacian_variance(&img), Some(0.0));
        assert_eq!(laplacian_variance(&GrayImage::new(2, 8)), None);
    }

    #[test]
    fn test_laplacian_variance_grows_with_detail() {
        let checker = GrayImage::from_fn(16, 16, |x, y| if (x + y) % 2 == 0 { Luma([0]) } else { Luma([255]) });
        let soft = GrayImage::from_fn(16, 16, |x, _| Luma([(x * 8) as u8]));
        assert!(laplacian_variance(&checker).unwrap() > laplacian_variance(&soft).unwrap());
    }

    #[test]
    fn test_uniform_flat_sequence_is_flagged() {
        let frames = test_frames::solid_sequence(4, 32, 32, [90, 90, 90]);
        let score = SharpnessConsistency::default().extract(&frames).score();
        // 完全一致 (0.5) 加上全部模糊 (0.2)
        assert!((score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_erratic_sharpness_raises_score() {
        let mut frames = test_frames::noisy_sequence(11, 2, 32, 32);
        frames.extend(test_frames::solid_sequence(2, 32, 32, [10, 10, 10]));
        let erratic = SharpnessConsistency::default().extract(&frames).score();
        let steady = SharpnessConsistency::default()
            .extract(&test_frames::noisy_sequence(11, 4, 32, 32))
            .score();
        assert!(erratic > steady);
    }

    #[test]
    fn test_tiny_frames_degrade() {
        let frames = test_frames::solid_sequence(2, 2, 2, [0, 0, 0]);
        assert!(SharpnessConsistency::default().extract(&frames).is_degraded());
    }
}
