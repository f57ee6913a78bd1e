//! 启发式特征提取器
//!
//! 每个提取器都是帧序列的纯函数：不读写共享状态、不依赖其他提取器的执行顺序、
//! 不使用随机数或时钟。相同的帧序列必然得到逐位相同的分数。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::error::AnalysisError;
use crate::frame::SampledFrame;

mod color_entropy;
mod compression;
mod frequency;
mod optical_flow;
mod sharpness;

pub use color_entropy::ColorEntropyVariation;
pub use compression::{BlockStepStats, CompressionArtifact};
pub use frequency::FrequencyAnomaly;
pub use optical_flow::OpticalFlowConsistency;
pub use sharpness::SharpnessConsistency;

/// 降级时替代的中性分数
pub const NEUTRAL_SCORE: f64 = 0.5;

/// 五个启发式指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    SharpnessConsistency,
    CompressionArtifact,
    OpticalFlowConsistency,
    FrequencyAnomaly,
    ColorEntropyVariation,
}

impl Indicator {
    pub const ALL: [Indicator; 5] = [
        Indicator::SharpnessConsistency,
        Indicator::CompressionArtifact,
        Indicator::OpticalFlowConsistency,
        Indicator::FrequencyAnomaly,
        Indicator::ColorEntropyVariation,
    ];

    /// 输出记录 detailBreakdown 中使用的名字
    pub fn name(self) -> &'static str {
        match self {
            Indicator::SharpnessConsistency => "sharpness_consistency",
            Indicator::CompressionArtifact => "compression_artifact",
            Indicator::OpticalFlowConsistency => "optical_flow_consistency",
            Indicator::FrequencyAnomaly => "frequency_anomaly",
            Indicator::ColorEntropyVariation => "color_entropy_variation",
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 单个提取器的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractorOutcome {
    /// 正常计算出的分数，已限定在 [0, 1]
    Computed(f64),
    /// 输入不足以计算该指标，附原因
    Degraded(String),
}

impl ExtractorOutcome {
    /// 由原始分数构造结果；非有限值视为降级而不是 NaN 分数
    pub fn from_raw(raw: f64) -> Self {
        if raw.is_finite() {
            ExtractorOutcome::Computed(raw.clamp(0.0, 1.0))
        } else {
            ExtractorOutcome::Degraded(format!("计算得到非有限值: {raw}"))
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        ExtractorOutcome::Degraded(reason.into())
    }

    /// 用于输出的分数：降级时为中性值
    pub fn score(&self) -> f64 {
        match self {
            ExtractorOutcome::Computed(score) => *score,
            ExtractorOutcome::Degraded(_) => NEUTRAL_SCORE,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ExtractorOutcome::Degraded(_))
    }
}

/// 一个指标及其结果
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorScore {
    pub indicator: Indicator,
    pub outcome: ExtractorOutcome,
}

/// 特征提取器接口
pub trait FeatureExtractor: Send + Sync {
    fn indicator(&self) -> Indicator;

    /// 在整个帧序列上计算指标
    fn extract(&self, frames: &[SampledFrame]) -> ExtractorOutcome;
}

/// 按固定顺序运行全部五个提取器
///
/// 空序列在采样阶段已经被拒绝，这里不会出现。每个提取器开始前检查一次取消标志。
pub fn extract_all(frames: &[SampledFrame], cancel: &AtomicBool) -> Result<Vec<IndicatorScore>, AnalysisError> {
    default_extractors()
        .iter()
        .map(|extractor| {
            if cancel.load(Ordering::Relaxed) {
                return Err(AnalysisError::Cancelled);
            }
            Ok(IndicatorScore {
                indicator: extractor.indicator(),
                outcome: extractor.extract(frames),
            })
        })
        .collect()
}

pub fn default_extractors() -> Vec<Box<dyn FeatureExtractor>> {
    vec![
        Box::new(SharpnessConsistency::default()),
        Box::new(CompressionArtifact::default()),
        Box::new(OpticalFlowConsistency::default()),
        Box::new(FrequencyAnomaly::default()),
        Box::new(ColorEntropyVariation::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames;

    #[test]
    fn test_from_raw_clamps_and_rejects_nan() {
        assert_eq!(ExtractorOutcome::from_raw(1.7), ExtractorOutcome::Computed(1.0));
        assert_eq!(ExtractorOutcome::from_raw(-0.2), ExtractorOutcome::Computed(0.0));
        assert!(ExtractorOutcome::from_raw(f64::NAN).is_degraded());
        assert_eq!(ExtractorOutcome::degraded("x").score(), NEUTRAL_SCORE);
    }

    #[test]
    fn test_extract_all_covers_every_indicator_in_order() {
        let frames = test_frames::noisy_sequence(7, 4, 64, 48);
        let scores = extract_all(&frames, &AtomicBool::new(false)).unwrap();
        let order: Vec<Indicator> = scores.iter().map(|s| s.indicator).collect();
        assert_eq!(order, Indicator::ALL.to_vec());
        for s in &scores {
            let score = s.outcome.score();
            assert!((0.0..=1.0).contains(&score), "{} out of range: {}", s.indicator, score);
        }
    }

    #[test]
    fn test_extractors_are_deterministic_over_seeds() {
        for seed in [1u64, 42, 1234, 987654] {
            let frames = test_frames::noisy_sequence(seed, 5, 64, 64);
            let first = extract_all(&frames, &AtomicBool::new(false)).unwrap();
            let second = extract_all(&frames, &AtomicBool::new(false)).unwrap();
            for (a, b) in first.iter().zip(second.iter()) {
                assert_eq!(a.indicator, b.indicator);
                assert_eq!(a.outcome.score().to_bits(), b.outcome.score().to_bits());
            }
        }
    }

    #[test]
    fn test_extract_all_stops_when_cancelled() {
        let frames = test_frames::noisy_sequence(7, 4, 64, 48);
        let cancel = AtomicBool::new(true);
        assert!(matches!(extract_all(&frames, &cancel), Err(AnalysisError::Cancelled)));
    }

    #[test]
    fn test_single_frame_only_degrades_optical_flow() {
        let frames = test_frames::noisy_sequence(3, 1, 64, 64);
        let scores = extract_all(&frames, &AtomicBool::new(false)).unwrap();
        for s in &scores {
            if s.indicator == Indicator::OpticalFlowConsistency {
                assert!(s.outcome.is_degraded());
                assert_eq!(s.outcome.score(), NEUTRAL_SCORE);
            } else {
                assert!(!s.outcome.is_degraded(), "{} unexpectedly degraded", s.indicator);
            }
        }
    }
}
