use std::collections::BTreeMap;

use crate::error::AnalysisError;
use crate::features::{Indicator, IndicatorScore};

/// 启发式指标权重
///
/// 默认五项等权；配置后必须非负且总和为正，使用时会归一化。
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicWeights {
    weights: BTreeMap<Indicator, f64>,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            weights: Indicator::ALL.iter().map(|&i| (i, 0.2)).collect(),
        }
    }
}

impl HeuristicWeights {
    pub fn new(weights: impl IntoIterator<Item = (Indicator, f64)>) -> Result<Self, AnalysisError> {
        let mut out = Self::default();
        for (indicator, weight) in weights {
            out.weights.insert(indicator, weight);
        }
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        for (indicator, &weight) in &self.weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AnalysisError::Config(format!("指标 {indicator} 的权重无效: {weight}")));
            }
        }
        if self.weights.values().sum::<f64>() <= 0.0 {
            return Err(AnalysisError::Config("启发式权重之和必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn get(&self, indicator: Indicator) -> f64 {
        self.weights.get(&indicator).copied().unwrap_or(0.0)
    }
}

/// 按权重合成 p_heuristic
///
/// 降级的指标不参与加权，其余权重重新归一化为 1。
/// 全部降级（或剩余权重全为 0）时没有依据可言，返回内部错误。
pub fn aggregate(scores: &[IndicatorScore], weights: &HeuristicWeights) -> Result<f64, AnalysisError> {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for score in scores.iter().filter(|s| !s.outcome.is_degraded()) {
        let w = weights.get(score.indicator);
        weighted += w * score.outcome.score();
        total += w;
    }

    if total <= 0.0 {
        return Err(AnalysisError::internal("所有启发式指标均不可用"));
    }
    Ok((weighted / total).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ExtractorOutcome;

    fn uniform(value: f64) -> Vec<IndicatorScore> {
        Indicator::ALL
            .iter()
            .map(|&indicator| IndicatorScore {
                indicator,
                outcome: ExtractorOutcome::Computed(value),
            })
            .collect()
    }

    #[test]
    fn test_all_zero_scores() {
        assert_eq!(aggregate(&uniform(0.0), &HeuristicWeights::default()).unwrap(), 0.0);
    }

    #[test]
    fn test_all_one_scores() {
        let p = aggregate(&uniform(1.0), &HeuristicWeights::default()).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_equal_weights_give_mean() {
        let p = aggregate(&uniform(0.2), &HeuristicWeights::default()).unwrap();
        assert!((p - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_degraded_indicator_is_excluded() {
        let mut scores = uniform(0.8);
        scores[2].outcome = ExtractorOutcome::degraded("单帧");
        scores[0].outcome = ExtractorOutcome::Computed(0.4);
        // 剩余四项: 0.4, 0.8, 0.8, 0.8
        let p = aggregate(&scores, &HeuristicWeights::default()).unwrap();
        assert!((p - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_all_degraded_is_an_error() {
        let scores: Vec<IndicatorScore> = Indicator::ALL
            .iter()
            .map(|&indicator| IndicatorScore {
                indicator,
                outcome: ExtractorOutcome::degraded("x"),
            })
            .collect();
        assert!(matches!(
            aggregate(&scores, &HeuristicWeights::default()),
            Err(AnalysisError::Internal(_))
        ));
    }

    #[test]
    fn test_custom_weights_are_renormalized() {
        let weights = HeuristicWeights::new([
            (Indicator::SharpnessConsistency, 3.0),
            (Indicator::CompressionArtifact, 1.0),
            (Indicator::OpticalFlowConsistency, 0.0),
            (Indicator::FrequencyAnomaly, 0.0),
            (Indicator::ColorEntropyVariation, 0.0),
        ])
        .unwrap();
        let mut scores = uniform(0.0);
        scores[0].outcome = ExtractorOutcome::Computed(1.0);
        let p = aggregate(&scores, &weights).unwrap();
        assert!((p - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_weights_are_rejected() {
        assert!(HeuristicWeights::new([(Indicator::FrequencyAnomaly, -0.1)]).is_err());
        assert!(HeuristicWeights::new(Indicator::ALL.map(|i| (i, 0.0))).is_err());
    }
}
