use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{self, HeuristicWeights};
use crate::ensemble::{self, EnsembleWeights};
use crate::error::AnalysisError;
use crate::features::{self, IndicatorScore};
use crate::frame::SampledFrame;
use crate::model::ScoringMode;
use crate::result::{AnalysisResult, Thresholds};
use crate::video_processor::{FrameSampler, SamplingConfig, VideoAsset};

/// 一次分析所需的只读上下文
///
/// 启动时构造一次，所有请求共享；模型（如有）也在这里。
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub sampling: SamplingConfig,
    pub heuristic_weights: HeuristicWeights,
    pub ensemble_weights: EnsembleWeights,
    pub thresholds: Thresholds,
    pub scoring: ScoringMode,
}

impl Default for AnalysisContext {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            heuristic_weights: HeuristicWeights::default(),
            ensemble_weights: EnsembleWeights::default(),
            thresholds: Thresholds::default(),
            scoring: ScoringMode::HeuristicOnly,
        }
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), AnalysisError> {
    if cancel.load(Ordering::Relaxed) {
        Err(AnalysisError::Cancelled)
    } else {
        Ok(())
    }
}

/// 同步执行完整的分析流程：写入临时文件 → 采样 → 评分
///
/// 临时目录在函数返回时释放，包括出错和取消的情况。
pub fn analyze_bytes(
    bytes: &[u8],
    ctx: &AnalysisContext,
    cancel: &AtomicBool,
) -> Result<AnalysisResult, AnalysisError> {
    let total_start = Instant::now();
    info!("🎬 [视频分析] 开始分析，上传大小: {} 字节", bytes.len());

    let asset = VideoAsset::from_bytes(bytes)?;

    let sample_start = Instant::now();
    let sampler = FrameSampler::new(ctx.sampling)?;
    let (video_info, frames) = sampler.sample(asset.path(), cancel).map_err(|e| {
        error!("❌ [视频分析] 帧采样失败: {}", e);
        e
    })?;
    info!(
        "✅ [视频分析] 帧采样完成，耗时: {:.2}秒",
        sample_start.elapsed().as_secs_f64()
    );
    info!("  • 分辨率: {}x{}", video_info.width, video_info.height);
    info!("  • 帧率: {:.2} fps", video_info.fps);
    info!("  • 采样帧数: {} 帧", frames.len());

    // 帧已经在内存里，可以先释放临时文件
    drop(asset);

    score_frames(&frames, ctx, cancel, total_start)
}

/// 对已采样的帧序列评分并组装结果
pub fn score_frames(
    frames: &[SampledFrame],
    ctx: &AnalysisContext,
    cancel: &AtomicBool,
    started: Instant,
) -> Result<AnalysisResult, AnalysisError> {
    if frames.is_empty() {
        return Err(AnalysisError::decode("未能解码出任何帧"));
    }
    check_cancelled(cancel)?;

    let feature_start = Instant::now();
    let scores = features::extract_all(frames, cancel)?;
    info!(
        "✅ [视频分析] 特征提取完成，耗时: {:.2}秒",
        feature_start.elapsed().as_secs_f64()
    );
    log_scores(&scores);

    let p_heuristic = aggregator::aggregate(&scores, &ctx.heuristic_weights).map_err(|e| {
        error!("❌ [视频分析] 启发式聚合失败: {}", e);
        e
    })?;
    check_cancelled(cancel)?;

    let p_model = match ctx.scoring.classifier() {
        None => None,
        Some(classifier) => {
            let model_start = Instant::now();
            match classifier.predict(frames, cancel) {
                Ok(p) => {
                    info!(
                        "✅ [视频分析] 模型推理完成 ({})，p_model = {:.4}，耗时: {:.2}秒",
                        classifier.name(),
                        p,
                        model_start.elapsed().as_secs_f64()
                    );
                    Some(p)
                }
                Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
                Err(e) => {
                    warn!("⚠️ [视频分析] {}，本次请求改用纯启发式结果", e);
                    None
                }
            }
        }
    };
    check_cancelled(cancel)?;

    let (p, method) = ensemble::combine(p_heuristic, p_model, &ctx.ensemble_weights);
    let result = AnalysisResult::build(
        p,
        method,
        &scores,
        frames.len(),
        started.elapsed().as_secs_f64(),
        &ctx.thresholds,
    );

    info!(
        "✅ [视频分析] 完成: p = {:.4}, 方式: {}, 风险: {}, 总耗时: {:.2}秒",
        p,
        method,
        result.risk_level(),
        result.processing_time()
    );
    Ok(result)
}

fn log_scores(scores: &[IndicatorScore]) {
    for s in scores {
        if let features::ExtractorOutcome::Degraded(reason) = &s.outcome {
            warn!("  • {}: 降级为 {:.2}（{}）", s.indicator, s.outcome.score(), reason);
        } else {
            debug!("  • {}: {:.4}", s.indicator, s.outcome.score());
        }
    }
}
