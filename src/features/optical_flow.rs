use image::GrayImage;
use rayon::prelude::*;

use super::{ExtractorOutcome, FeatureExtractor, Indicator};
use crate::frame::{mean_std, SampledFrame};

/// 光流一致性
///
/// 相邻帧之间用块匹配估计运动场，检查运动是否异常平滑（几乎静止）、
/// 异常跳变（整帧剧变）、幅度抖动，以及运动场内部的不连续。
/// 少于两帧时无法运行，返回降级。
#[derive(Debug, Clone)]
pub struct OpticalFlowConsistency {
    /// 块大小（半分辨率平面上）
    pub block_size: usize,
    /// 搜索半径（像素）
    pub search_radius: i32,
    /// 平均帧差低于该值视为过于静止
    pub temporal_diff_low: f64,
    pub temporal_diff_low_penalty: f64,
    /// 平均帧差高于该值视为跳变/拼接
    pub temporal_diff_high: f64,
    pub temporal_diff_high_penalty: f64,
    /// 运动幅度标准差的归一化除数
    pub magnitude_std_divisor: f64,
    pub jitter_weight: f64,
    /// 运动场粗糙度的归一化除数
    pub roughness_divisor: f64,
    pub discontinuity_weight: f64,
}

impl Default for OpticalFlowConsistency {
    fn default() -> Self {
        Self {
            block_size: 8,
            search_radius: 4,
            temporal_diff_low: 2.0,
            temporal_diff_low_penalty: 0.25,
            temporal_diff_high: 30.0,
            temporal_diff_high_penalty: 0.2,
            magnitude_std_divisor: 4.0,
            jitter_weight: 0.25,
            roughness_divisor: 2.0,
            discontinuity_weight: 0.3,
        }
    }
}

/// 半分辨率灰度平面
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Plane {
    /// 2x2 均值下采样
    fn half_of(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let (hw, hh) = (w / 2, h / 2);
        let src = img.as_raw();
        let mut data = Vec::with_capacity(hw * hh);
        for y in 0..hh {
            for x in 0..hw {
                let sum = src[(2 * y) * w + 2 * x] as f64
                    + src[(2 * y) * w + 2 * x + 1] as f64
                    + src[(2 * y + 1) * w + 2 * x] as f64
                    + src[(2 * y + 1) * w + 2 * x + 1] as f64;
                data.push(sum / 4.0);
            }
        }
        Self {
            width: hw,
            height: hh,
            data,
        }
    }

    fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }
}

/// 一对相邻帧的运动统计
#[derive(Debug, Clone, Copy)]
struct PairFlow {
    mean_magnitude: f64,
    roughness: f64,
    mean_abs_diff: f64,
}

impl OpticalFlowConsistency {
    fn block_vector(&self, prev: &Plane, next: &Plane, bx: usize, by: usize) -> (i32, i32) {
        let bs = self.block_size;
        let sad = |dx: i32, dy: i32| -> Option<f64> {
            let ox = bx as i32 + dx;
            let oy = by as i32 + dy;
            if ox < 0 || oy < 0 || ox as usize + bs > next.width || oy as usize + bs > next.height {
                return None;
            }
            let mut total = 0.0;
            for y in 0..bs {
                for x in 0..bs {
                    total += (prev.at(bx + x, by + y) - next.at(ox as usize + x, oy as usize + y)).abs();
                }
            }
            Some(total)
        };

        // 零位移优先，只有严格更优时才替换，保证结果确定
        let mut best = (0, 0);
        let mut best_sad = sad(0, 0).unwrap_or(f64::MAX);
        let r = self.search_radius;
        for dy in -r..=r {
            for dx in -r..=r {
                if let Some(cost) = sad(dx, dy) {
                    if cost < best_sad {
                        best_sad = cost;
                        best = (dx, dy);
                    }
                }
            }
        }
        best
    }

    fn pair_flow(&self, prev: &Plane, next: &Plane, prev_luma: &GrayImage, next_luma: &GrayImage) -> PairFlow {
        let bs = self.block_size;
        let cols = prev.width / bs;
        let rows = prev.height / bs;

        let mut field = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for col in 0..cols {
                field.push(self.block_vector(prev, next, col * bs, row * bs));
            }
        }

        let magnitudes: Vec<f64> = field
            .iter()
            .map(|&(dx, dy)| ((dx * dx + dy * dy) as f64).sqrt())
            .collect();
        let (mean_magnitude, _) = mean_std(&magnitudes);

        // 相邻块运动向量之差
        let mut neighbour_diffs = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                let (ax, ay) = field[row * cols + col];
                if col + 1 < cols {
                    let (bx, by) = field[row * cols + col + 1];
                    neighbour_diffs.push((((ax - bx).pow(2) + (ay - by).pow(2)) as f64).sqrt());
                }
                if row + 1 < rows {
                    let (bx, by) = field[(row + 1) * cols + col];
                    neighbour_diffs.push((((ax - bx).pow(2) + (ay - by).pow(2)) as f64).sqrt());
                }
            }
        }
        let (mean_neighbour_diff, _) = mean_std(&neighbour_diffs);

        let diff_sum: f64 = prev_luma
            .as_raw()
            .iter()
            .zip(next_luma.as_raw())
            .map(|(&a, &b)| (a as f64 - b as f64).abs())
            .sum();
        let mean_abs_diff = diff_sum / prev_luma.as_raw().len().max(1) as f64;

        PairFlow {
            mean_magnitude,
            roughness: mean_neighbour_diff / (mean_magnitude + 1.0),
            mean_abs_diff,
        }
    }

    fn score(&self, pairs: &[PairFlow]) -> f64 {
        let diffs: Vec<f64> = pairs.iter().map(|p| p.mean_abs_diff).collect();
        let magnitudes: Vec<f64> = pairs.iter().map(|p| p.mean_magnitude).collect();
        let roughness: Vec<f64> = pairs.iter().map(|p| p.roughness).collect();

        let (diff_mean, _) = mean_std(&diffs);
        let (_, magnitude_std) = mean_std(&magnitudes);
        let (roughness_mean, _) = mean_std(&roughness);

        let mut raw = 0.0;
        if diff_mean < self.temporal_diff_low {
            raw += self.temporal_diff_low_penalty;
        } else if diff_mean > self.temporal_diff_high {
            raw += self.temporal_diff_high_penalty;
        }
        raw += (magnitude_std / self.magnitude_std_divisor).min(1.0) * self.jitter_weight;
        raw += (roughness_mean / self.roughness_divisor).min(1.0) * self.discontinuity_weight;
        raw
    }
}

impl FeatureExtractor for OpticalFlowConsistency {
    fn indicator(&self) -> Indicator {
        Indicator::OpticalFlowConsistency
    }

    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome {
        if frames.len() < 2 {
            return ExtractorOutcome::degraded("需要至少两帧才能计算光流");
        }
        let (width, height) = (frames[0].width(), frames[0].height());
        if frames.iter().any(|f| f.width() != width || f.height() != height) {
            return ExtractorOutcome::degraded("帧尺寸不一致，无法计算光流");
        }
        let min_side = (self.block_size * 2) as u32;
        if width < min_side || height < min_side {
            return ExtractorOutcome::degraded(format!("帧尺寸小于 {min_side}x{min_side}，无法进行块匹配"));
        }

        let planes: Vec<Plane> = frames.par_iter().map(|f| Plane::half_of(f.luma())).collect();
        let pairs: Vec<PairFlow> = (0..frames.len() - 1)
            .into_par_iter()
            .map(|i| self.pair_flow(&planes[i], &planes[i + 1], frames[i].luma(), frames[i + 1].luma()))
            .collect();

        ExtractorOutcome::from_raw(self.score(&pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_single_frame_degrades_to_neutral() {
        let frames = test_frames::noisy_sequence(1, 1, 32, 32);
        let outcome = OpticalFlowConsistency::default().extract(&frames);
        assert!(outcome.is_degraded());
        assert_eq!(outcome.score(), 0.5);
    }

    #[test]
    fn test_static_sequence_is_flagged_as_too_static() {
        let frames = test_frames::solid_sequence(4, 32, 32, [80, 80, 80]);
        let outcome = OpticalFlowConsistency::default().extract(&frames);
        assert_eq!(outcome, ExtractorOutcome::Computed(0.25));
    }

    #[test]
    fn test_flashing_sequence_is_flagged_as_glitch() {
        let frames: Vec<SampledFrame> = (0..4)
            .map(|i| {
                let level = if i % 2 == 0 { 0 } else { 255 };
                SampledFrame::new(i, i as f64, RgbImage::from_pixel(32, 32, Rgb([level, level, level])))
            })
            .collect();
        let outcome = OpticalFlowConsistency::default().extract(&frames);
        assert_eq!(outcome, ExtractorOutcome::Computed(0.2));
    }

    #[test]
    fn test_block_matching_finds_translation() {
        let frames = test_frames::moving_square(2, 64, 64, 4);
        let extractor = OpticalFlowConsistency::default();
        let prev = Plane::half_of(frames[0].luma());
        let next = Plane::half_of(frames[1].luma());
        // 方块左上角在半分辨率下位于 (4, 4)，向右移动 2 个像素
        assert_eq!(extractor.block_vector(&prev, &next, 4, 4), (2, 0));
    }

    #[test]
    fn test_mismatched_sizes_degrade() {
        let mut frames = test_frames::solid_sequence(1, 32, 32, [0, 0, 0]);
        frames.extend(test_frames::solid_sequence(1, 40, 32, [0, 0, 0]));
        assert!(OpticalFlowConsistency::default().extract(&frames).is_degraded());
    }
}
