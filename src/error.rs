use thiserror::Error;

/// 分析流程中的错误类型
///
/// 单个特征提取器无法计算属于“降级”，不在这里出现，
/// 由 `features::ExtractorOutcome::Degraded` 在本地处理。
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// 容器无法打开、编码不支持或解码不出任何帧
    #[error("视频解码失败: {0}")]
    Decode(String),

    #[error("上传内容为空")]
    EmptyUpload,

    #[error("上传文件过大: {size} 字节，上限 {limit} 字节")]
    UploadTooLarge { size: usize, limit: usize },

    /// 模型权重缺失或无效，只在启动时出现
    #[error("模型加载失败: {0}")]
    ModelLoad(String),

    #[error("分析超时（{0} 秒）")]
    Timeout(u64),

    #[error("分析已取消")]
    Cancelled,

    #[error("配置无效: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl AnalysisError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 面向调用方的错误信息
    ///
    /// 内部错误只返回通用描述，细节留在日志里
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "分析失败，请稍后重试".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("IO 错误: {err}"))
    }
}

impl From<ffmpeg_next::Error> for AnalysisError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
