use tracing::warn;

use crate::error::AnalysisError;
use crate::result::DetectionMethod;

/// 启发式与模型概率的融合权重
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleWeights {
    heuristic: f64,
    model: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            heuristic: 0.5,
            model: 0.5,
        }
    }
}

impl EnsembleWeights {
    /// 权重须为非负有限值且不能同时为 0，内部归一化为和 1
    pub fn new(heuristic: f64, model: f64) -> Result<Self, AnalysisError> {
        for (name, w) in [("heuristic", heuristic), ("model", model)] {
            if !w.is_finite() || w < 0.0 {
                return Err(AnalysisError::Config(format!("融合权重 {name} 无效: {w}")));
            }
        }
        let total = heuristic + model;
        if total <= 0.0 {
            return Err(AnalysisError::Config("融合权重之和必须大于 0".to_string()));
        }
        Ok(Self {
            heuristic: heuristic / total,
            model: model / total,
        })
    }

    pub fn heuristic(&self) -> f64 {
        self.heuristic
    }

    pub fn model(&self) -> f64 {
        self.model
    }
}

/// 合成最终概率并给出检测方式
///
/// 没有模型概率，或模型概率不是 [0, 1] 内的有限值时，退回纯启发式。
pub fn combine(p_heuristic: f64, p_model: Option<f64>, weights: &EnsembleWeights) -> (f64, DetectionMethod) {
    let p_model = match p_model {
        None => return (p_heuristic, DetectionMethod::Heuristic),
        Some(p) if !p.is_finite() || !(0.0..=1.0).contains(&p) => {
            warn!("⚠️ [融合] 模型概率无效 ({}), 使用启发式结果", p);
            return (p_heuristic, DetectionMethod::Heuristic);
        }
        Some(p) => p,
    };

    if weights.heuristic == 0.0 {
        return (p_model, DetectionMethod::Model);
    }
    if weights.model == 0.0 {
        return (p_heuristic, DetectionMethod::Heuristic);
    }

    let p = weights.heuristic * p_heuristic + weights.model * p_model;
    (p.clamp(0.0, 1.0), DetectionMethod::Ensemble)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_average() {
        let (p, method) = combine(0.4, Some(0.8), &EnsembleWeights::default());
        assert!((p - 0.6).abs() < 1e-12);
        assert_eq!(method, DetectionMethod::Ensemble);
    }

    #[test]
    fn test_without_model_is_heuristic() {
        assert_eq!(
            combine(0.3, None, &EnsembleWeights::default()),
            (0.3, DetectionMethod::Heuristic)
        );
    }

    #[test]
    fn test_invalid_model_probability_falls_back() {
        let weights = EnsembleWeights::default();
        assert_eq!(combine(0.3, Some(f64::NAN), &weights), (0.3, DetectionMethod::Heuristic));
        assert_eq!(combine(0.3, Some(1.5), &weights), (0.3, DetectionMethod::Heuristic));
    }

    #[test]
    fn test_weights_are_normalized() {
        let weights = EnsembleWeights::new(1.0, 3.0).unwrap();
        assert_eq!(weights.heuristic(), 0.25);
        assert_eq!(weights.model(), 0.75);
        let (p, _) = combine(0.0, Some(1.0), &weights);
        assert_eq!(p, 0.75);
    }

    #[test]
    fn test_model_only_weights() {
        let weights = EnsembleWeights::new(0.0, 1.0).unwrap();
        assert_eq!(combine(0.1, Some(0.9), &weights), (0.9, DetectionMethod::Model));
        assert!(EnsembleWeights::new(0.0, 0.0).is_err());
        assert!(EnsembleWeights::new(-1.0, 1.0).is_err());
    }
}
