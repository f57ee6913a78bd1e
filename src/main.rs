use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use video_authenticity::config::{AnalysisConfig, ConfigLoader, ConfigOverrides, CONFIG_FILE_NAME};
use video_authenticity::{handler, AnalysisError, AnalysisResponse, Analyzer};

/// 视频真实性检测工具 - 判断视频是否为 AI 生成或篡改
#[derive(Parser, Debug)]
#[command(name = "video-authenticity", version)]
#[command(about = "视频真实性检测：帧采样、启发式特征、可选模型融合、风险分级", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别（trace, debug, info, warn, error），也可通过 LOG_LEVEL 或 RUST_LOG 设置
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CLI 模式：分析本地视频文件，结果以 JSON 输出到标准输出
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 每秒采样帧数（FRAMES_PER_SECOND_SAMPLED）
        #[arg(long)]
        samples_per_second: Option<f64>,

        /// 最多采样帧数（MAX_FRAMES）
        #[arg(long)]
        max_frames: Option<usize>,

        /// 模型权重文件（MODEL_WEIGHTS_PATH，safetensors 格式）
        #[arg(long)]
        model: Option<PathBuf>,

        /// 单次分析超时秒数（ANALYSIS_TIMEOUT_SECS）
        #[arg(long)]
        timeout: Option<u64>,

        /// 以缩进格式输出 JSON
        #[arg(long)]
        pretty: bool,
    },
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（SERVER_BIND，未设置时读取 FC_SERVER_PORT，默认 0.0.0.0:8000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 模型权重文件（MODEL_WEIGHTS_PATH）
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(short, long, default_value = CONFIG_FILE_NAME)]
        output: PathBuf,

        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
}

/// 兼容函数计算环境：未设置 SERVER_BIND 时使用 FC_SERVER_PORT
fn fc_server_bind() -> Option<String> {
    if std::env::var_os("SERVER_BIND").is_some() {
        return None;
    }
    std::env::var("FC_SERVER_PORT")
        .ok()
        .map(|port| format!("0.0.0.0:{port}"))
}

/// 初始化日志，RUST_LOG 优先于配置中的级别；日志写到标准错误，标准输出只留给结果
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Analyze {
            input,
            samples_per_second,
            max_frames,
            model,
            timeout,
            pretty,
        } => {
            let overrides = ConfigOverrides {
                samples_per_second,
                max_frames,
                model_weights_path: model,
                timeout_secs: timeout,
                log_level: args.log_level,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load_config(args.config.as_deref(), overrides).context("加载配置失败")?;
            init_logging(&config.log_level);

            let analyzer = Analyzer::from_config(&config).context("初始化分析器失败")?;
            let outcome = match std::fs::read(&input) {
                Ok(bytes) => analyzer.analyze(bytes).await,
                Err(e) => Err(AnalysisError::decode(format!("无法读取输入文件 {}: {}", input.display(), e))),
            };
            let failed = outcome.is_err();

            let response = AnalysisResponse::from(outcome);
            let output = if pretty {
                serde_json::to_string_pretty(&response)
            } else {
                serde_json::to_string(&response)
            }
            .context("序列化结果失败")?;
            println!("{output}");

            if failed {
                std::process::exit(1);
            }
        }
        Commands::Serve { bind, model } => {
            let bind = bind.or_else(fc_server_bind);
            let overrides = ConfigOverrides {
                model_weights_path: model,
                server_bind: bind,
                log_level: args.log_level,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load_config(args.config.as_deref(), overrides).context("加载配置失败")?;
            init_logging(&config.log_level);
            start_web_server(&config).await?;
        }
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                anyhow::bail!("配置文件已存在: {}（使用 --force 覆盖）", output.display());
            }
            ConfigLoader::create_default_config(&output).context("创建配置文件失败")?;
            println!("已生成默认配置文件: {}", output.display());
        }
    }

    Ok(())
}

async fn start_web_server(config: &AnalysisConfig) -> Result<()> {
    let analyzer = Arc::new(Analyzer::from_config(config).context("初始化分析器失败")?);
    let app = handler::router(analyzer);
    let bind = config.server_bind.as_str();

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 健康检查: GET  http://{}/api/health", bind);
    tracing::info!("  • 视频分析: POST http://{}/api/analyze（请求体为视频文件字节）", bind);
    tracing::info!("  • 上传上限: {} 字节", config.upload_size_limit);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("启动服务器失败")?;

    Ok(())
}
