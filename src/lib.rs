pub mod aggregator;
pub mod analyzer;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod frame;
pub mod handler;
pub mod model;
pub mod processor;
pub mod result;
pub mod video_processor;

pub use aggregator::HeuristicWeights;
pub use analyzer::Analyzer;
pub use config::{AnalysisConfig, ConfigLoader, ConfigOverrides};
pub use ensemble::EnsembleWeights;
pub use error::AnalysisError;
pub use features::{ExtractorOutcome, FeatureExtractor, Indicator, IndicatorScore};
pub use frame::SampledFrame;
pub use model::{FrameClassifier, MesoNetClassifier, ScoringMode};
pub use processor::{analyze_bytes, score_frames, AnalysisContext};
pub use result::{AnalysisResponse, AnalysisResult, DetectionMethod, RiskLevel, Thresholds};
pub use video_processor::{sampling_plan, FrameSampler, SamplingConfig, VideoAsset, VideoInfo};
