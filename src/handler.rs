use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::analyzer::Analyzer;
use crate::error::AnalysisError;
use crate::model::ScoringMode;
use crate::result::AnalysisResponse;

type AnalyzeReply = (StatusCode, ResponseJson<AnalysisResponse>);

/// 构建 HTTP 路由
///
/// 超过上传上限的请求体在读取阶段就被拒绝，不会进入解码。
pub fn router(analyzer: Arc<Analyzer>) -> Router {
    let body_limit = analyzer.upload_size_limit();
    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(health_check))
        .route("/api/analyze", post(handle_analyze))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(analyzer)
}

/// 错误对应的 HTTP 状态码
pub fn status_for(err: &AnalysisError) -> StatusCode {
    match err {
        AnalysisError::Decode(_) | AnalysisError::EmptyUpload => StatusCode::BAD_REQUEST,
        AnalysisError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        AnalysisError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(status: StatusCode, message: String) -> AnalyzeReply {
    (status, ResponseJson(AnalysisResponse::Failed { error: message }))
}

/// 健康检查
pub async fn health_check(State(analyzer): State<Arc<Analyzer>>) -> ResponseJson<Value> {
    let mode = match analyzer.context().scoring {
        ScoringMode::HeuristicOnly => "heuristic",
        ScoringMode::ModelAugmented(_) => "model_augmented",
    };
    ResponseJson(json!({
        "status": "ok",
        "scoringMode": mode,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 分析上传的视频，请求体为原始视频字节
pub async fn handle_analyze(
    State(analyzer): State<Arc<Analyzer>>,
    body: Result<Bytes, BytesRejection>,
) -> AnalyzeReply {
    let request_id = uuid::Uuid::new_v4();
    let start = Instant::now();

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            warn!("⚠️ [{}] 读取请求体失败 ({}): {}", request_id, status, rejection.body_text());
            let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
                format!("上传文件过大，上限 {} 字节", analyzer.upload_size_limit())
            } else {
                format!("读取请求体失败: {}", rejection.body_text())
            };
            return failure(status, message);
        }
    };

    info!("📥 [{}] 收到分析请求，大小: {} 字节", request_id, body.len());

    match analyzer.analyze(body.to_vec()).await {
        Ok(result) => {
            info!(
                "✅ [{}] 分析完成: {} / {}，耗时: {:.2}秒",
                request_id,
                result.detection_method(),
                result.risk_level(),
                start.elapsed().as_secs_f64()
            );
            (StatusCode::OK, ResponseJson(AnalysisResponse::Completed(result)))
        }
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!("❌ [{}] 分析失败: {}", request_id, e);
            } else {
                warn!("⚠️ [{}] 请求无效: {}", request_id, e);
            }
            failure(status, e.public_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::AnalysisContext;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(limit: usize) -> Router {
        let analyzer = Analyzer::new(AnalysisContext::default(), 2, Duration::from_secs(30), limit);
        router(Arc::new(analyzer))
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_analyze(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/analyze")
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        for uri in ["/health", "/api/health"] {
            let response = test_router(1024)
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = json_body(response).await;
            assert_eq!(body["status"], "ok");
            assert_eq!(body["scoringMode"], "heuristic");
        }
    }

    #[tokio::test]
    async fn test_empty_upload_is_bad_request() {
        let response = test_router(1024).oneshot(post_analyze(Vec::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body.as_object().unwrap().len(), 1);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected_before_decode() {
        let response = test_router(1024).oneshot(post_analyze(vec![7u8; 4096])).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert_eq!(body.as_object().unwrap().len(), 1);
        assert!(body["error"].as_str().unwrap().contains("1024"));
    }

    #[tokio::test]
    async fn test_malformed_video_returns_only_error() {
        let response = test_router(1 << 20)
            .oneshot(post_analyze(b"this is not a video at all".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let obj = body.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("error"));
        assert!(!obj.contains_key("isAIGenerated"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&AnalysisError::decode("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&AnalysisError::UploadTooLarge { size: 2, limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(status_for(&AnalysisError::Timeout(120)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&AnalysisError::Cancelled), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(&AnalysisError::internal("x")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
