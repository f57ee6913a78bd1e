use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::AnalysisError;
use crate::features::{ExtractorOutcome, Indicator, IndicatorScore};

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// 最终概率的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Heuristic,
    Model,
    Ensemble,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectionMethod::Heuristic => "heuristic",
            DetectionMethod::Model => "model",
            DetectionMethod::Ensemble => "ensemble",
        })
    }
}

/// 分类与风险阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub classification: f64,
    pub risk_low: f64,
    pub risk_medium: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            classification: 0.5,
            risk_low: 0.35,
            risk_medium: 0.65,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        for (name, value) in [
            ("CLASSIFICATION_THRESHOLD", self.classification),
            ("RISK_LEVEL_LOW_THRESHOLD", self.risk_low),
            ("RISK_LEVEL_MEDIUM_THRESHOLD", self.risk_medium),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::Config(format!("{name} 必须在 [0, 1] 内，当前为 {value}")));
            }
        }
        if self.risk_low > self.risk_medium {
            return Err(AnalysisError::Config(format!(
                "RISK_LEVEL_LOW_THRESHOLD ({}) 不能大于 RISK_LEVEL_MEDIUM_THRESHOLD ({})",
                self.risk_low, self.risk_medium
            )));
        }
        Ok(())
    }

    pub fn is_ai_generated(&self, p: f64) -> bool {
        p >= self.classification
    }

    pub fn risk_level(&self, p: f64) -> RiskLevel {
        if p < self.risk_low {
            RiskLevel::Low
        } else if p < self.risk_medium {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorStatus {
    Computed,
    Degraded,
}

/// detailBreakdown 中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorEntry {
    pub score: f64,
    pub status: IndicatorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&ExtractorOutcome> for IndicatorEntry {
    fn from(outcome: &ExtractorOutcome) -> Self {
        match outcome {
            ExtractorOutcome::Computed(score) => Self {
                score: *score,
                status: IndicatorStatus::Computed,
                reason: None,
            },
            ExtractorOutcome::Degraded(reason) => Self {
                score: outcome.score(),
                status: IndicatorStatus::Degraded,
                reason: Some(reason.clone()),
            },
        }
    }
}

/// 一次分析的完整结果，构造后不可变
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(rename = "isAIGenerated")]
    is_ai_generated: bool,
    confidence: f64,
    risk_level: RiskLevel,
    detection_method: DetectionMethod,
    frame_count: usize,
    processing_time: f64,
    analyzed_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_breakdown")]
    detail_breakdown: Vec<(Indicator, IndicatorEntry)>,
}

impl AnalysisResult {
    /// 按阈值分类并组装结果
    ///
    /// confidence 直接取最终概率 p，与预测类别无关。
    pub fn build(
        p: f64,
        method: DetectionMethod,
        scores: &[IndicatorScore],
        frame_count: usize,
        processing_time: f64,
        thresholds: &Thresholds,
    ) -> Self {
        Self {
            is_ai_generated: thresholds.is_ai_generated(p),
            confidence: p,
            risk_level: thresholds.risk_level(p),
            detection_method: method,
            frame_count,
            processing_time: processing_time.max(0.0),
            analyzed_at: Utc::now(),
            detail_breakdown: scores
                .iter()
                .map(|s| (s.indicator, IndicatorEntry::from(&s.outcome)))
                .collect(),
        }
    }

    pub fn is_ai_generated(&self) -> bool {
        self.is_ai_generated
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn detection_method(&self) -> DetectionMethod {
        self.detection_method
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn processing_time(&self) -> f64 {
        self.processing_time
    }

    pub fn analyzed_at(&self) -> DateTime<Utc> {
        self.analyzed_at
    }

    pub fn detail_breakdown(&self) -> &[(Indicator, IndicatorEntry)] {
        &self.detail_breakdown
    }

    pub fn indicator(&self, indicator: Indicator) -> Option<&IndicatorEntry> {
        self.detail_breakdown
            .iter()
            .find(|(i, _)| *i == indicator)
            .map(|(_, entry)| entry)
    }
}

fn serialize_breakdown<S>(entries: &[(Indicator, IndicatorEntry)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (indicator, entry) in entries {
        map.serialize_entry(indicator.name(), entry)?;
    }
    map.end()
}

/// 对外输出的记录：成功时为完整结果，失败时只有 error 字段
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AnalysisResponse {
    Completed(AnalysisResult),
    Failed { error: String },
}

impl From<Result<AnalysisResult, AnalysisError>> for AnalysisResponse {
    fn from(result: Result<AnalysisResult, AnalysisError>) -> Self {
        match result {
            Ok(result) => AnalysisResponse::Completed(result),
            Err(err) => AnalysisResponse::Failed {
                error: err.public_message(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(value: f64) -> Vec<IndicatorScore> {
        Indicator::ALL
            .iter()
            .map(|&indicator| IndicatorScore {
                indicator,
                outcome: ExtractorOutcome::Computed(value),
            })
            .collect()
    }

    #[test]
    fn test_threshold_boundaries() {
        let t = Thresholds::default();
        assert!(t.is_ai_generated(0.5));
        assert!(!t.is_ai_generated(0.499999));
        assert_eq!(t.risk_level(0.349999), RiskLevel::Low);
        assert_eq!(t.risk_level(0.35), RiskLevel::Medium);
        assert_eq!(t.risk_level(0.649999), RiskLevel::Medium);
        assert_eq!(t.risk_level(0.65), RiskLevel::High);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::default().validate().is_ok());
        let inverted = Thresholds {
            risk_low: 0.7,
            risk_medium: 0.3,
            ..Thresholds::default()
        };
        assert!(inverted.validate().is_err());
        let out_of_range = Thresholds {
            classification: 1.2,
            ..Thresholds::default()
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_build_all_zero() {
        let r = AnalysisResult::build(0.0, DetectionMethod::Heuristic, &scores(0.0), 8, 0.1, &Thresholds::default());
        assert!(!r.is_ai_generated());
        assert_eq!(r.risk_level(), RiskLevel::Low);
        assert_eq!(r.confidence(), 0.0);
        assert_eq!(r.detail_breakdown().len(), 5);
    }

    #[test]
    fn test_build_all_one() {
        let r = AnalysisResult::build(1.0, DetectionMethod::Heuristic, &scores(1.0), 8, 0.1, &Thresholds::default());
        assert!(r.is_ai_generated());
        assert_eq!(r.risk_level(), RiskLevel::High);
        assert_eq!(r.confidence(), 1.0);
    }

    #[test]
    fn test_success_record_shape() {
        let mut s = scores(0.3);
        s[2].outcome = ExtractorOutcome::degraded("需要至少两帧");
        let r = AnalysisResult::build(0.3, DetectionMethod::Heuristic, &s, 1, 0.25, &Thresholds::default());
        let json = serde_json::to_value(AnalysisResponse::Completed(r)).unwrap();

        let obj = json.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "analyzedAt",
                "confidence",
                "detailBreakdown",
                "detectionMethod",
                "frameCount",
                "isAIGenerated",
                "processingTime",
                "riskLevel"
            ]
        );
        assert_eq!(json["riskLevel"], "low");
        assert_eq!(json["detectionMethod"], "heuristic");
        assert_eq!(json["frameCount"], 1);
        assert_eq!(json["detailBreakdown"]["optical_flow_consistency"]["status"], "degraded");
        assert_eq!(json["detailBreakdown"]["optical_flow_consistency"]["score"], 0.5);
        assert!(json["detailBreakdown"]["sharpness_consistency"].get("reason").is_none());
        assert!(json["analyzedAt"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_failure_record_has_only_error() {
        let response = AnalysisResponse::from(Err(AnalysisError::decode("moov atom not found")));
        let json = serde_json::to_value(response).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj["error"].as_str().unwrap().contains("moov atom not found"));
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let response = AnalysisResponse::from(Err(AnalysisError::internal("panic in worker thread 7")));
        let json = serde_json::to_value(response).unwrap();
        assert!(!json["error"].as_str().unwrap().contains("worker"));
    }
}
