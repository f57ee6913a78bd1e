use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use super::{ExtractorOutcome, FeatureExtractor, Indicator};
use crate::frame::{luma_plane, mean_std, SampledFrame};

/// 频域异常
///
/// 自然图像的径向功率谱近似服从幂律，对数坐标下斜率在 -2 附近。
/// 生成内容常见的是斜率偏离，或高频段出现周期性尖峰（上采样网格）。
#[derive(Debug, Clone)]
pub struct FrequencyAnomaly {
    /// FFT 前统一缩放到的边长
    pub analysis_size: u32,
    /// 低于该边长的帧不做频谱分析
    pub min_side: u32,
    /// 自然图像的参考斜率
    pub reference_slope: f64,
    /// 斜率偏差的归一化除数
    pub slope_tolerance: f64,
    pub slope_weight: f64,
    /// 高频残差 RMS 的归一化除数
    pub residual_tolerance: f64,
    pub residual_weight: f64,
}

impl Default for FrequencyAnomaly {
    fn default() -> Self {
        Self {
            analysis_size: 128,
            min_side: 32,
            reference_slope: -2.0,
            slope_tolerance: 1.5,
            slope_weight: 0.7,
            residual_tolerance: 0.5,
            residual_weight: 0.3,
        }
    }
}

const POWER_EPSILON: f64 = 1e-12;

impl FrequencyAnomaly {
    fn frame_score(&self, luma: &GrayImage) -> f64 {
        let n = self.analysis_size as usize;
        let resized = imageops::resize(luma, self.analysis_size, self.analysis_size, FilterType::Triangle);
        let spectrum = radial_power_spectrum(&luma_plane(&resized), n);

        let (log_r, log_p): (Vec<f64>, Vec<f64>) = spectrum
            .iter()
            .enumerate()
            .skip(1)
            .map(|(r, &p)| ((r as f64).ln(), (p + POWER_EPSILON).ln()))
            .unzip();

        let (slope, intercept) = fit_line(&log_r, &log_p);

        // 只看高频段（半径超过 n/4）的拟合残差
        let quarter = n / 4;
        let residuals: Vec<f64> = log_r
            .iter()
            .zip(&log_p)
            .enumerate()
            .filter(|(i, _)| i + 1 > quarter)
            .map(|(_, (x, y))| y - (slope * x + intercept))
            .collect();
        let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len().max(1) as f64).sqrt();

        let slope_term = ((slope - self.reference_slope).abs() / self.slope_tolerance).min(1.0);
        let residual_term = (rms / self.residual_tolerance).min(1.0);
        self.slope_weight * slope_term + self.residual_weight * residual_term
    }
}

impl FeatureExtractor for FrequencyAnomaly {
    fn indicator(&self) -> Indicator {
        Indicator::FrequencyAnomaly
    }

    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome {
        if frames.is_empty() {
            return ExtractorOutcome::degraded("没有可用的帧");
        }
        let min_side = self.min_side;
        if frames.iter().any(|f| f.width() < min_side || f.height() < min_side) {
            return ExtractorOutcome::degraded(format!("帧尺寸小于 {min_side}x{min_side}，频谱分辨率不足"));
        }

        let scores: Vec<f64> = frames.par_iter().map(|f| self.frame_score(f.luma())).collect();
        let (mean, _) = mean_std(&scores);
        ExtractorOutcome::from_raw(mean)
    }
}

/// n x n 平面的径向平均功率谱，下标为整数半径（0..=n/2）
fn radial_power_spectrum(plane: &[f64], n: usize) -> Vec<f64> {
    // 去掉直流分量
    let (mean, _) = mean_std(plane);
    let mut buffer: Vec<Complex<f64>> = plane.iter().map(|&v| Complex::new(v - mean, 0.0)).collect();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);

    for row in buffer.chunks_exact_mut(n) {
        fft.process(row);
    }

    let mut column = vec![Complex::new(0.0, 0.0); n];
    for x in 0..n {
        for y in 0..n {
            column[y] = buffer[y * n + x];
        }
        fft.process(&mut column);
        for y in 0..n {
            buffer[y * n + x] = column[y];
        }
    }

    let max_radius = n / 2;
    let mut sums = vec![0.0; max_radius + 1];
    let mut counts = vec![0u32; max_radius + 1];
    for y in 0..n {
        let fy = if y <= n / 2 { y } else { n - y };
        for x in 0..n {
            let fx = if x <= n / 2 { x } else { n - x };
            let r = ((fx * fx + fy * fy) as f64).sqrt().round() as usize;
            if r <= max_radius {
                sums[r] += buffer[y * n + x].norm_sqr();
                counts[r] += 1;
            }
        }
    }

    sums.iter()
        .zip(&counts)
        .map(|(&s, &c)| if c == 0 { 0.0 } else { s / c as f64 })
        .collect()
}

/// 最小二乘直线拟合，返回 (斜率, 截距)
fn fit_line(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let (mean_x, _) = mean_std(xs);
    let (mean_y, _) = mean_std(ys);
    let mut cov = 0.0;
    let mut var = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var == 0.0 {
        return (0.0, mean_y);
    }
    let slope = cov / var;
    (slope, mean_y - slope * mean_x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_fit_line_recovers_power_law() {
        let xs: Vec<f64> = (1..=32).map(|r| (r as f64).ln()).collect();
        let ys: Vec<f64> = (1..=32).map(|r| (5.0 * (r as f64).powi(-2)).ln()).collect();
        let (slope, intercept) = fit_line(&xs, &ys);
        assert!((slope + 2.0).abs() < 1e-9);
        assert!((intercept - 5.0f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_single_sinusoid_peaks_at_its_radius() {
        let n = 32;
        let plane: Vec<f64> = (0..n * n)
            .map(|i| {
                let x = (i % n) as f64;
                (2.0 * std::f64::consts::PI * 4.0 * x / n as f64).sin()
            })
            .collect();
        let spectrum = radial_power_spectrum(&plane, n);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(r, _)| r);
        assert_eq!(peak, Some(4));
    }

    #[test]
    fn test_white_noise_is_anomalous() {
        let mut rng = StdRng::seed_from_u64(2024);
        let img = RgbImage::from_fn(128, 128, |_, _| {
            let v: u8 = rng.random();
            Rgb([v, v, v])
        });
        let frames = vec![SampledFrame::new(0, 0.0, img)];
        let score = FrequencyAnomaly::default().extract(&frames).score();
        // 白噪声谱近似平坦，斜率远离 -2
        assert!(score >= 0.65, "score = {score}");
    }

    #[test]
    fn test_small_frames_degrade() {
        let frames = test_frames::solid_sequence(1, 16, 64, [0, 0, 0]);
        assert!(FrequencyAnomaly::default().extract(&frames).is_degraded());
    }
}
