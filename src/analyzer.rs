use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::model::ScoringMode;
use crate::processor::{self, AnalysisContext};
use crate::result::AnalysisResult;

/// 丢弃时置位取消标志
///
/// 调用方放弃等待（超时或请求断开）时，阻塞线程里的流水线据此尽快退出。
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// 异步分析入口
///
/// 并发数由信号量限制，CPU 密集的流水线放在 blocking 线程池执行，
/// 整个请求（含排队）受超时约束。
pub struct Analyzer {
    context: Arc<AnalysisContext>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    upload_size_limit: usize,
}

impl Analyzer {
    pub fn new(context: AnalysisContext, max_concurrent: usize, timeout: Duration, upload_size_limit: usize) -> Self {
        Self {
            context: Arc::new(context),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            upload_size_limit,
        }
    }

    /// 按配置构造；模型在这里加载一次，之后只读共享
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let context = AnalysisContext {
            sampling: config.sampling(),
            heuristic_weights: config.heuristic_weights()?,
            ensemble_weights: config.ensemble_weights()?,
            thresholds: config.thresholds(),
            scoring: ScoringMode::from_weights_path(config.model_weights_path.as_deref()),
        };
        info!(
            "✅ [分析器] 初始化完成: 并发上限 {}, 超时 {}秒, 评分方式 {:?}",
            config.max_concurrent_analyses, config.timeout_secs, context.scoring
        );
        Ok(Self::new(
            context,
            config.max_concurrent_analyses,
            config.timeout(),
            config.upload_size_limit,
        ))
    }

    pub fn upload_size_limit(&self) -> usize {
        self.upload_size_limit
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.context
    }

    /// 分析一段上传的视频字节
    pub async fn analyze(&self, bytes: Vec<u8>) -> Result<AnalysisResult, AnalysisError> {
        if bytes.is_empty() {
            return Err(AnalysisError::EmptyUpload);
        }
        if bytes.len() > self.upload_size_limit {
            return Err(AnalysisError::UploadTooLarge {
                size: bytes.len(),
                limit: self.upload_size_limit,
            });
        }
        self.run_blocking(move |ctx, cancel| processor::analyze_bytes(&bytes, ctx, cancel))
            .await
    }

    /// 在 blocking 线程中执行任务，带并发限制、超时与取消
    async fn run_blocking<F>(&self, job: F) -> Result<AnalysisResult, AnalysisError>
    where
        F: FnOnce(&AnalysisContext, &AtomicBool) -> Result<AnalysisResult, AnalysisError> + Send + 'static,
    {
        let timeout_secs = self.timeout.as_secs();
        match tokio::time::timeout(self.timeout, self.execute(job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏰ [分析器] 分析超过 {} 秒未完成，已取消", timeout_secs);
                Err(AnalysisError::Timeout(timeout_secs))
            }
        }
    }

    async fn execute<F>(&self, job: F) -> Result<AnalysisResult, AnalysisError>
    where
        F: FnOnce(&AnalysisContext, &AtomicBool) -> Result<AnalysisResult, AnalysisError> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancel.clone());

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AnalysisError::internal(format!("并发控制已关闭: {e}")))?;

        let context = self.context.clone();
        let handle = tokio::task::spawn_blocking(move || {
            // 许可随任务一起释放，超时后任务真正停下来才让出名额
            let _permit = permit;
            job(&context, &cancel)
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("❌ [分析器] 分析任务异常退出: {}", e);
                Err(AnalysisError::internal(format!("分析任务异常退出: {e}")))
            }
        }
    }
}
