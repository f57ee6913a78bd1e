use anyhow::{anyhow, Context, Result};
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::HeuristicWeights;
use crate::ensemble::EnsembleWeights;
use crate::features::Indicator;
use crate::result::Thresholds;
use crate::video_processor::SamplingConfig;

const MIB: usize = 1024 * 1024;

/// 默认配置文件名
pub const CONFIG_FILE_NAME: &str = "video-authenticity.ini";

/// 启发式权重对应的配置项，顺序与 `Indicator::ALL` 一致
const HEURISTIC_WEIGHT_KEYS: [(&str, Indicator); 5] = [
    ("HEURISTIC_WEIGHT_SHARPNESS", Indicator::SharpnessConsistency),
    ("HEURISTIC_WEIGHT_COMPRESSION", Indicator::CompressionArtifact),
    ("HEURISTIC_WEIGHT_OPTICAL_FLOW", Indicator::OpticalFlowConsistency),
    ("HEURISTIC_WEIGHT_FREQUENCY", Indicator::FrequencyAnomaly),
    ("HEURISTIC_WEIGHT_COLOR_ENTROPY", Indicator::ColorEntropyVariation),
];

/// 分析服务配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// 上传大小上限（字节）
    pub upload_size_limit: usize,
    /// 每秒采样帧数
    pub samples_per_second: f64,
    /// 最多采样帧数
    pub max_frames: usize,
    /// 采样帧长边上限（像素）
    pub max_dimension: u32,
    /// 模型权重路径（safetensors），未设置时纯启发式
    pub model_weights_path: Option<PathBuf>,
    pub classification_threshold: f64,
    pub risk_low_threshold: f64,
    pub risk_medium_threshold: f64,
    /// 单次分析超时（秒）
    pub timeout_secs: u64,
    /// 同时进行的分析数上限
    pub max_concurrent_analyses: usize,
    pub ensemble_weight_heuristic: f64,
    pub ensemble_weight_model: f64,
    /// 五项启发式权重，顺序与 `Indicator::ALL` 一致
    pub heuristic_weights: [f64; 5],
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
    /// HTTP 服务监听地址
    pub server_bind: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            upload_size_limit: 100 * MIB,
            samples_per_second: 1.0,
            max_frames: 64,
            max_dimension: 512,
            model_weights_path: None,
            classification_threshold: 0.5,
            risk_low_threshold: 0.35,
            risk_medium_threshold: 0.65,
            timeout_secs: 120,
            max_concurrent_analyses: num_cpus::get(),
            ensemble_weight_heuristic: 0.5,
            ensemble_weight_model: 0.5,
            heuristic_weights: [0.2; 5],
            log_level: "info".to_string(),
            server_bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl AnalysisConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            samples_per_second: self.samples_per_second,
            max_frames: self.max_frames,
            max_dimension: self.max_dimension,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            classification: self.classification_threshold,
            risk_low: self.risk_low_threshold,
            risk_medium: self.risk_medium_threshold,
        }
    }

    pub fn heuristic_weights(&self) -> Result<HeuristicWeights> {
        let pairs = HEURISTIC_WEIGHT_KEYS
            .iter()
            .zip(self.heuristic_weights)
            .map(|((_, indicator), weight)| (*indicator, weight));
        Ok(HeuristicWeights::new(pairs)?)
    }

    pub fn ensemble_weights(&self) -> Result<EnsembleWeights> {
        Ok(EnsembleWeights::new(
            self.ensemble_weight_heuristic,
            self.ensemble_weight_model,
        )?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// 检查取值范围，启动时调用
    pub fn validate(&self) -> Result<()> {
        if self.upload_size_limit == 0 {
            return Err(anyhow!("UPLOAD_SIZE_LIMIT 必须大于 0"));
        }
        if !self.samples_per_second.is_finite() || self.samples_per_second <= 0.0 {
            return Err(anyhow!(
                "FRAMES_PER_SECOND_SAMPLED 必须为正数，当前为 {}",
                self.samples_per_second
            ));
        }
        if self.max_frames == 0 {
            return Err(anyhow!("MAX_FRAMES 必须大于 0"));
        }
        if self.max_dimension < 16 {
            return Err(anyhow!("ANALYSIS_MAX_DIMENSION 不能小于 16，当前为 {}", self.max_dimension));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("ANALYSIS_TIMEOUT_SECS 必须大于 0"));
        }
        if self.max_concurrent_analyses == 0 {
            return Err(anyhow!("MAX_CONCURRENT_ANALYSES 必须大于 0"));
        }
        self.thresholds().validate()?;
        self.heuristic_weights()?;
        self.ensemble_weights()?;
        Ok(())
    }
}

/// 命令行覆盖项，None 表示未指定
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub samples_per_second: Option<f64>,
    pub max_frames: Option<usize>,
    pub model_weights_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub server_bind: Option<String>,
    pub log_level: Option<String>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<AnalysisConfig> {
        let ini = match config_file {
            Some(path) => Some(Self::load_ini(path)?),
            None => Self::find_default_config().map(|p| Self::load_ini(&p)).transpose()?,
        };
        Self::resolve(ini.as_ref(), &|key: &str| env::var(key).ok(), overrides)
    }

    /// 按优先级合并各来源并校验
    fn resolve(
        ini: Option<&Ini>,
        env_lookup: &dyn Fn(&str) -> Option<String>,
        overrides: ConfigOverrides,
    ) -> Result<AnalysisConfig> {
        let sources = Sources { ini, env_lookup };
        let defaults = AnalysisConfig::default();

        let upload_size_limit = match sources.env_value::<usize>("UPLOAD_SIZE_LIMIT")? {
            Some(bytes) => bytes,
            None => match sources.env_value::<usize>("MAX_VIDEO_SIZE_MB")? {
                Some(mb) => megabytes_to_bytes(mb)?,
                None => match sources.ini_value::<usize>("analysis", "UPLOAD_SIZE_LIMIT")? {
                    Some(bytes) => bytes,
                    None => match sources.ini_value::<usize>("analysis", "MAX_VIDEO_SIZE_MB")? {
                        Some(mb) => megabytes_to_bytes(mb)?,
                        None => defaults.upload_size_limit,
                    },
                },
            },
        };

        let mut heuristic_weights = defaults.heuristic_weights;
        for (slot, (key, _)) in heuristic_weights.iter_mut().zip(HEURISTIC_WEIGHT_KEYS) {
            *slot = sources.layered(None, key, "analysis", *slot)?;
        }

        let model_weights_path = overrides
            .model_weights_path
            .or_else(|| sources.raw("MODEL_WEIGHTS_PATH", "model").map(PathBuf::from));

        let log_level = match overrides.log_level {
            Some(level) => level,
            None => (sources.env_lookup)("LOG_LEVEL")
                .or_else(|| sources.ini_get("logging", "level"))
                .or_else(|| sources.ini_get("DEFAULT", "log_level"))
                .unwrap_or(defaults.log_level),
        };

        let config = AnalysisConfig {
            upload_size_limit,
            samples_per_second: sources.layered(
                overrides.samples_per_second,
                "FRAMES_PER_SECOND_SAMPLED",
                "analysis",
                defaults.samples_per_second,
            )?,
            max_frames: sources.layered(overrides.max_frames, "MAX_FRAMES", "analysis", defaults.max_frames)?,
            max_dimension: sources.layered(None, "ANALYSIS_MAX_DIMENSION", "analysis", defaults.max_dimension)?,
            model_weights_path,
            classification_threshold: sources.layered(
                None,
                "CLASSIFICATION_THRESHOLD",
                "analysis",
                defaults.classification_threshold,
            )?,
            risk_low_threshold: sources.layered(
                None,
                "RISK_LEVEL_LOW_THRESHOLD",
                "analysis",
                defaults.risk_low_threshold,
            )?,
            risk_medium_threshold: sources.layered(
                None,
                "RISK_LEVEL_MEDIUM_THRESHOLD",
                "analysis",
                defaults.risk_medium_threshold,
            )?,
            timeout_secs: sources.layered(
                overrides.timeout_secs,
                "ANALYSIS_TIMEOUT_SECS",
                "analysis",
                defaults.timeout_secs,
            )?,
            max_concurrent_analyses: sources.layered(
                None,
                "MAX_CONCURRENT_ANALYSES",
                "analysis",
                defaults.max_concurrent_analyses,
            )?,
            ensemble_weight_heuristic: sources.layered(
                None,
                "ENSEMBLE_WEIGHT_HEURISTIC",
                "model",
                defaults.ensemble_weight_heuristic,
            )?,
            ensemble_weight_model: sources.layered(
                None,
                "ENSEMBLE_WEIGHT_MODEL",
                "model",
                defaults.ensemble_weight_model,
            )?,
            heuristic_weights,
            log_level,
            server_bind: overrides
                .server_bind
                .or_else(|| sources.raw("SERVER_BIND", "server"))
                .unwrap_or(defaults.server_bind),
        };

        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    /// 读取 INI 配置文件
    fn load_ini(config_path: &Path) -> Result<Ini> {
        if !config_path.exists() {
            return Err(anyhow!("配置文件不存在: {}", config_path.display()));
        }
        let mut config_parser = Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(config_parser)
    }

    /// 按顺序查找默认位置的配置文件
    fn find_default_config() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{CONFIG_FILE_NAME}")),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(format!(".{CONFIG_FILE_NAME}")));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        candidates.into_iter().find(|p| p.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AnalysisConfig::default();
        let mut config_parser = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            config_parser.set(section, &key.to_lowercase(), Some(value));
        };

        set("analysis", "UPLOAD_SIZE_LIMIT", defaults.upload_size_limit.to_string());
        set("analysis", "FRAMES_PER_SECOND_SAMPLED", defaults.samples_per_second.to_string());
        set("analysis", "MAX_FRAMES", defaults.max_frames.to_string());
        set("analysis", "ANALYSIS_MAX_DIMENSION", defaults.max_dimension.to_string());
        set("analysis", "ANALYSIS_TIMEOUT_SECS", defaults.timeout_secs.to_string());
        set("analysis", "MAX_CONCURRENT_ANALYSES", defaults.max_concurrent_analyses.to_string());
        set("analysis", "CLASSIFICATION_THRESHOLD", defaults.classification_threshold.to_string());
        set("analysis", "RISK_LEVEL_LOW_THRESHOLD", defaults.risk_low_threshold.to_string());
        set("analysis", "RISK_LEVEL_MEDIUM_THRESHOLD", defaults.risk_medium_threshold.to_string());
        for ((key, _), weight) in HEURISTIC_WEIGHT_KEYS.iter().zip(defaults.heuristic_weights) {
            set("analysis", *key, weight.to_string());
        }
        set("model", "MODEL_WEIGHTS_PATH", String::new());
        set("model", "ENSEMBLE_WEIGHT_HEURISTIC", defaults.ensemble_weight_heuristic.to_string());
        set("model", "ENSEMBLE_WEIGHT_MODEL", defaults.ensemble_weight_model.to_string());
        set("server", "SERVER_BIND", defaults.server_bind.clone());
        set("logging", "level", defaults.log_level.clone());

        config_parser
            .write(config_path)
            .map_err(|e| anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

/// 环境变量与 INI 两个来源
struct Sources<'a> {
    ini: Option<&'a Ini>,
    env_lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Sources<'_> {
    /// INI 中先查指定节，再查 [DEFAULT]；空值视为未设置
    fn ini_get(&self, section: &str, key: &str) -> Option<String> {
        let ini = self.ini?;
        let key = key.to_lowercase();
        ini.get(section, &key)
            .or_else(|| ini.get("DEFAULT", &key))
            .filter(|v| !v.trim().is_empty())
    }

    /// 环境变量优先，其次 INI，不做解析
    fn raw(&self, env_key: &str, section: &str) -> Option<String> {
        (self.env_lookup)(env_key)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.ini_get(section, env_key))
    }

    fn env_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        (self.env_lookup)(key)
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_value(key, &v, "环境变量"))
            .transpose()
    }

    fn ini_value<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>> {
        self.ini_get(section, key)
            .map(|v| parse_value(key, &v, "配置文件"))
            .transpose()
    }

    /// 命令行 > 环境变量 > 配置文件 > 默认值
    fn layered<T: FromStr>(&self, cli: Option<T>, key: &str, section: &str, default: T) -> Result<T> {
        if let Some(value) = cli {
            return Ok(value);
        }
        if let Some(value) = self.env_value(key)? {
            return Ok(value);
        }
        Ok(self.ini_value(section, key)?.unwrap_or(default))
    }
}

fn megabytes_to_bytes(mb: usize) -> Result<usize> {
    mb.checked_mul(MIB)
        .ok_or_else(|| anyhow!("MAX_VIDEO_SIZE_MB 的值过大: {mb}"))
}

fn parse_value<T: FromStr>(key: &str, raw: &str, source: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow!("{source}中 {key} 的值无效: {raw:?}"))
}
