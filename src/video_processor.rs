use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::AnalysisError;
use crate::features::{BlockStepStats, CompressionArtifact};
use crate::frame::SampledFrame;

/// 容器没有报告帧率时使用的默认值
pub const DEFAULT_FPS: f64 = 25.0;

/// 每个采样点在估算包数之外额外允许读取的数据包数
const PACKET_BUDGET_SLACK: usize = 64;

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() -> Result<(), AnalysisError> {
    ffmpeg::init().map_err(|e| AnalysisError::internal(format!("初始化 FFmpeg 失败: {e}")))?;
    FFMPEG_INIT.call_once(|| {
        // 只保留错误级别日志，损坏输入的告警由我们自己的日志报告
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }
    });
    Ok(())
}

/// 一次分析独占的视频文件
///
/// 上传的字节写入临时目录，资产被丢弃时目录连同文件一起删除，
/// 无论分析成功、失败还是被取消。
pub struct VideoAsset {
    dir: TempDir,
    path: PathBuf,
}

impl VideoAsset {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AnalysisError> {
        if bytes.is_empty() {
            return Err(AnalysisError::EmptyUpload);
        }
        let dir = tempfile::Builder::new().prefix("video-authenticity-").tempdir()?;
        let path = dir.path().join("upload");
        std::fs::write(&path, bytes)?;
        debug!("📁 [视频资产] 写入临时文件: {} ({} 字节)", path.display(), bytes.len());
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }
}

/// 容器探测得到的视频信息
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// 时长（秒），容器和流都无法给出时为 None
    pub duration_secs: Option<f64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// 采样参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub samples_per_second: f64,
    pub max_frames: usize,
    /// 输出帧长边的上限（像素）
    pub max_dimension: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            samples_per_second: 1.0,
            max_frames: 64,
            max_dimension: 512,
        }
    }
}

/// 计算采样时间点
///
/// 帧数 = min(max_frames, floor(duration * samples_per_second))，
/// 从 t=0 开始等间隔分布。不足一个采样间隔或时长未知时只取 t=0。
pub fn sampling_plan(duration_secs: Option<f64>, samples_per_second: f64, max_frames: usize) -> Vec<f64> {
    let duration = match duration_secs {
        Some(d) if d.is_finite() && d > 0.0 => d,
        _ => return vec![0.0],
    };
    let desired = (duration * samples_per_second).floor() as usize;
    let count = desired.min(max_frames);
    if count == 0 {
        return vec![0.0];
    }
    let stride = duration / count as f64;
    (0..count).map(|i| i as f64 * stride).collect()
}

/// 长边不超过 max_dimension 的等比缩放尺寸
fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// 帧采样器：解码视频并取出有界、等间隔的帧序列
pub struct FrameSampler {
    config: SamplingConfig,
}

impl FrameSampler {
    pub fn new(config: SamplingConfig) -> Result<Self, AnalysisError> {
        init_ffmpeg()?;
        Ok(Self { config })
    }

    /// 探测视频信息
    pub fn probe(&self, path: &Path) -> Result<VideoInfo, AnalysisError> {
        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| AnalysisError::decode(format!("无法打开视频文件: {e}")))?;
        probe_input(&ictx)
    }

    /// 按采样计划取帧
    ///
    /// 每个时间点之间检查一次取消标志。
    pub fn sample(&self, path: &Path, cancel: &AtomicBool) -> Result<(VideoInfo, Vec<SampledFrame>), AnalysisError> {
        let start = Instant::now();
        let mut ictx = ffmpeg::format::input(&path)
            .map_err(|e| AnalysisError::decode(format!("无法打开视频文件: {e}")))?;
        let info = probe_input(&ictx)?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| AnalysisError::decode("未找到视频流"))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let start_pts = stream.start_time();

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| AnalysisError::decode(format!("无法创建解码器上下文: {e}")))?;
        let mut decoder = decoder_context
            .decoder()
            .video()
            .map_err(|e| AnalysisError::decode(format!("无法创建视频解码器: {e}")))?;

        let mut converter = FrameConverter::new(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            self.config.max_dimension,
        )?;

        let targets = sampling_plan(info.duration_secs, self.config.samples_per_second, self.config.max_frames);
        let stride = match (targets.len(), info.duration_secs) {
            (n, Some(d)) if n > 1 => d / n as f64,
            _ => f64::INFINITY,
        };
        let tolerance = stride / 2.0;
        // 容器起始时间（AV_TIME_BASE 单位），跳转目标要加上这个偏移
        let container_start = match unsafe { (*ictx.as_ptr()).start_time } {
            t if t != ffmpeg::ffi::AV_NOPTS_VALUE && t > 0 => t,
            _ => 0,
        };

        debug!(
            "📊 [帧采样] 时长: {:?}s, 目标帧数: {}, 采样间隔: {:.3}s, 输出尺寸: {}x{}",
            info.duration_secs,
            targets.len(),
            stride,
            converter.output_width(),
            converter.output_height()
        );

        let to_seconds = |pts: i64| -> f64 {
            let base = if start_pts != ffmpeg::ffi::AV_NOPTS_VALUE { start_pts } else { 0 };
            (pts - base) as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
        };

        let mut frames = Vec::with_capacity(targets.len());
        let mut decoded = ffmpeg::frame::Video::empty();

        for (i, &target) in targets.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!("⏹️ [帧采样] 已取消，已采样 {} 帧", frames.len());
                return Err(AnalysisError::Cancelled);
            }

            // 第一个时间点直接从头解码，其余时间点跳到之前最近的关键帧
            if i > 0 {
                let timestamp = container_start + (target * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
                let ret = unsafe {
                    ffmpeg::sys::av_seek_frame(
                        ictx.as_mut_ptr(),
                        -1,
                        timestamp,
                        ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
                    )
                };
                if ret < 0 {
                    warn!("⚠️ [帧采样] 跳转到 {:.3}s 失败，跳过该时间点", target);
                    continue;
                }
                decoder.flush();
            }

            let mut best: Option<(f64, RgbImage, BlockStepStats)> = None;
            let mut best_diff = f64::MAX;
            let mut reached_target = false;
            let mut packets_read = 0usize;
            let mut packet_limit: Option<usize> = None;

            let mut consider = |decoded: &ffmpeg::frame::Video,
                                best: &mut Option<(f64, RgbImage, BlockStepStats)>,
                                best_diff: &mut f64|
             -> bool {
                let frame_time = decoded.timestamp().map(|pts| to_seconds(pts)).unwrap_or(0.0);
                let diff = (frame_time - target).abs();
                if diff < *best_diff && diff <= tolerance {
                    match converter.convert(decoded) {
                        Ok((img, stats)) => {
                            *best = Some((frame_time, img, stats));
                            *best_diff = diff;
                        }
                        Err(e) => warn!("⚠️ [帧采样] {:.3}s 处的帧转换失败: {}", frame_time, e),
                    }
                }
                // 越过目标之后的帧只会更远
                frame_time >= target
            };

            for (stream, packet) in ictx.packets() {
                if stream.index() != stream_index {
                    continue;
                }
                // 以跳转后第一个数据包的时间估算到达目标需要读多少包
                let limit = *packet_limit.get_or_insert_with(|| {
                    let landed = packet.pts().or(packet.dts()).map(|pts| to_seconds(pts)).unwrap_or(0.0);
                    packet_budget(info.fps, landed, target)
                });
                packets_read += 1;
                if packets_read > limit {
                    warn!(
                        "⚠️ [帧采样] 读取 {} 个数据包仍未到达 {:.3}s，放弃该时间点",
                        limit, target
                    );
                    break;
                }
                if decoder.send_packet(&packet).is_err() {
                    continue;
                }
                while decoder.receive_frame(&mut decoded).is_ok() {
                    if consider(&decoded, &mut best, &mut best_diff) {
                        reached_target = true;
                        break;
                    }
                }
                if reached_target {
                    break;
                }
            }

            // 流已读完时，解码器里可能还缓存着目标附近的帧
            if !reached_target && decoder.send_eof().is_ok() {
                while decoder.receive_frame(&mut decoded).is_ok() {
                    if consider(&decoded, &mut best, &mut best_diff) {
                        break;
                    }
                }
            }

            match best {
                Some((time, img, stats)) => {
                    frames.push(SampledFrame::new(frames.len(), time, img).with_native_block_stats(stats))
                }
                None => debug!("[帧采样] {:.3}s 附近没有可解码的帧", target),
            }
        }

        if frames.is_empty() {
            return Err(AnalysisError::decode("未能解码出任何帧"));
        }

        info!(
            "✅ [帧采样] 完成，采样 {}/{} 帧，耗时: {:.2}秒",
            frames.len(),
            targets.len(),
            start.elapsed().as_secs_f64()
        );
        Ok((info, frames))
    }
}

/// 从 `from` 解码到 `target` 最多读取的数据包数
///
/// 按帧率估算两点之间的帧数，再加上解码器缓冲与 B 帧重排的余量。
fn packet_budget(fps: f64, from: f64, target: f64) -> usize {
    let fps = if fps.is_finite() && fps > 0.0 { fps } else { DEFAULT_FPS };
    let span = (target - from).max(0.0);
    (span * fps).ceil() as usize + PACKET_BUDGET_SLACK
}

/// 解码帧到采样帧的转换
///
/// 在缩放之前先按原始分辨率统计块边界跳变，缩放会让编码块网格失准。
struct FrameConverter {
    rgb: ffmpeg::software::scaling::Context,
    luma: ffmpeg::software::scaling::Context,
    blocks: CompressionArtifact,
    output_width: u32,
    output_height: u32,
}

impl FrameConverter {
    fn new(format: ffmpeg::format::Pixel, width: u32, height: u32, max_dimension: u32) -> Result<Self, AnalysisError> {
        let (output_width, output_height) = scaled_dimensions(width, height, max_dimension);
        let rgb = ffmpeg::software::scaling::Context::get(
            format,
            width,
            height,
            ffmpeg::format::Pixel::RGB24,
            output_width,
            output_height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| AnalysisError::decode(format!("无法创建缩放器: {e}")))?;
        let luma = ffmpeg::software::scaling::Context::get(
            format,
            width,
            height,
            ffmpeg::format::Pixel::GRAY8,
            width,
            height,
            ffmpeg::software::scaling::Flags::POINT,
        )
        .map_err(|e| AnalysisError::decode(format!("无法创建亮度转换器: {e}")))?;

        Ok(Self {
            rgb,
            luma,
            blocks: CompressionArtifact::default(),
            output_width,
            output_height,
        })
    }

    fn output_width(&self) -> u32 {
        self.output_width
    }

    fn output_height(&self) -> u32 {
        self.output_height
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<(RgbImage, BlockStepStats), AnalysisError> {
        let mut gray = ffmpeg::frame::Video::empty();
        self.luma
            .run(decoded, &mut gray)
            .map_err(|e| AnalysisError::decode(format!("亮度平面转换失败: {e}")))?;
        let stats = self.blocks.measure(
            gray.data(0),
            gray.width() as usize,
            gray.height() as usize,
            gray.stride(0),
        );

        let mut rgb = ffmpeg::frame::Video::empty();
        self.rgb
            .run(decoded, &mut rgb)
            .map_err(|e| AnalysisError::decode(format!("像素格式转换失败: {e}")))?;
        let img = frame_to_image(&rgb).ok_or_else(|| AnalysisError::decode("帧数据不完整"))?;

        Ok((img, stats))
    }
}

fn probe_input(ictx: &ffmpeg::format::context::Input) -> Result<VideoInfo, AnalysisError> {
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| AnalysisError::decode("未找到视频流"))?;

    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .and_then(|ctx| ctx.decoder().video())
        .map_err(|e| AnalysisError::decode(format!("无法创建视频解码器: {e}")))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        DEFAULT_FPS
    };

    // 优先容器时长，其次流时长，最后用帧数 / 帧率推算
    let duration_secs = if ictx.duration() > 0 {
        Some(ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64)
    } else if stream.duration() > 0 {
        let tb = stream.time_base();
        Some(stream.duration() as f64 * tb.numerator() as f64 / tb.denominator() as f64)
    } else if stream.frames() > 0 {
        Some(stream.frames() as f64 / fps)
    } else {
        None
    };

    if decoder.width() == 0 || decoder.height() == 0 {
        return Err(AnalysisError::decode("视频流分辨率无效"));
    }

    Ok(VideoInfo {
        duration_secs,
        fps,
        width: decoder.width(),
        height: decoder.height(),
    })
}

/// RGB24 帧转为 RgbImage，按行跳过 stride 填充
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Option<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width * 3;

    let mut buf = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let row = data.get(y * stride..y * stride + row_bytes)?;
        buf.extend_from_slice(row);
    }
    RgbImage::from_raw(width as u32, height as u32, buf)
}

/// 测试用的真实视频：用 FFmpeg 自带的 MPEG-4 编码器现场生成
#[cfg(test)]
pub(crate) mod test_video {
    use super::ffmpeg;
    use ffmpeg::{codec, encoder, format, frame, Packet, Rational};
    use std::path::Path;

    /// 生成视频的参数
    #[derive(Debug, Clone, Copy)]
    pub struct ClipSpec {
        pub width: u32,
        pub height: u32,
        pub fps: i32,
        pub frame_count: usize,
        /// 关键帧间隔（帧）
        pub gop: u32,
    }

    impl Default for ClipSpec {
        fn default() -> Self {
            Self {
                width: 160,
                height: 120,
                fps: 25,
                frame_count: 300,
                gop: 300,
            }
        }
    }

    /// 平移的纹理，亮度带 8 像素块结构，色度恒定
    fn fill_frame(frame: &mut frame::Video, index: usize) {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let shift = index * 2;

        let stride = frame.stride(0);
        let luma = frame.data_mut(0);
        for y in 0..height {
            for x in 0..width {
                let block = ((x + shift) / 8 + y / 8) % 5;
                let texture = ((x + shift) * 3 + y * 2) % 24;
                luma[y * stride + x] = (40 + block * 30 + texture) as u8;
            }
        }
        for plane in 1..3 {
            let stride = frame.stride(plane);
            let data = frame.data_mut(plane);
            for y in 0..height / 2 {
                data[y * stride..y * stride + width / 2].fill(128);
            }
        }
    }

    fn drain(
        encoder: &mut encoder::video::Encoder,
        octx: &mut format::context::Output,
        stream_index: usize,
        encoder_time_base: Rational,
        stream_time_base: Rational,
    ) -> Result<(), ffmpeg::Error> {
        let mut packet = Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(stream_index);
            if packet.duration() == 0 {
                // 每个包一帧，显式写出时长，容器总时长才包含最后一帧
                packet.set_duration(1);
            }
            packet.rescale_ts(encoder_time_base, stream_time_base);
            packet.write_interleaved(octx)?;
        }
        Ok(())
    }

    /// 按扩展名选择容器写出视频文件
    pub fn write_clip(path: &Path, spec: ClipSpec) -> Result<(), ffmpeg::Error> {
        ffmpeg::init()?;
        let codec = encoder::find(codec::Id::MPEG4).ok_or(ffmpeg::Error::EncoderNotFound)?;
        let mut octx = format::output(&path)?;
        let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);
        let time_base = Rational::new(1, spec.fps);

        let mut video = codec::context::Context::new_with_codec(codec).encoder().video()?;
        video.set_width(spec.width);
        video.set_height(spec.height);
        video.set_format(format::Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(Rational::new(spec.fps, 1)));
        video.set_gop(spec.gop);
        video.set_max_b_frames(0);
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = video.open_as(codec)?;

        let stream_index = {
            let mut stream = octx.add_stream(codec)?;
            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            stream.index()
        };
        octx.write_header()?;
        let stream_time_base = octx
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .ok_or(ffmpeg::Error::StreamNotFound)?;

        for index in 0..spec.frame_count {
            let mut frame = frame::Video::new(format::Pixel::YUV420P, spec.width, spec.height);
            fill_frame(&mut frame, index);
            frame.set_pts(Some(index as i64));
            encoder.send_frame(&frame)?;
            drain(&mut encoder, &mut octx, stream_index, time_base, stream_time_base)?;
        }
        encoder.send_eof()?;
        drain(&mut encoder, &mut octx, stream_index, time_base, stream_time_base)?;
        octx.write_trailer()?;
        Ok(())
    }

    /// 生成 MP4 并返回文件字节
    pub fn clip_bytes(spec: ClipSpec) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        write_clip(&path, spec).unwrap();
        std::fs::read(&path).unwrap()
    }
}
