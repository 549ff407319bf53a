use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, info_span, Span};

use crate::audio_decoder::init_ffmpeg;

/// 未设置的时间戳（AV_NOPTS_VALUE）
const NO_PTS: i64 = i64::MIN;

/// 视频信息：帧率、时长（秒）、分辨率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub duration: f64,
    /// 视频流首帧的时间戳（秒），MPEG-TS 等容器通常不为 0
    pub start_time: f64,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// 总帧数 = floor(时长 × 帧率)
    pub fn frame_count(&self) -> usize {
        frame_count(self.duration, self.fps)
    }
}

/// 流的起始时间（秒）：优先取流自身的 start_time，其次取容器的，都没有时为 0
pub fn start_offset(stream_start: i64, time_base: f64, container_start: i64) -> f64 {
    if stream_start != NO_PTS && time_base > 0.0 {
        stream_start as f64 * time_base
    } else if container_start != NO_PTS {
        container_start as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
    } else {
        0.0
    }
}

pub fn frame_count(duration: f64, fps: f64) -> usize {
    if duration <= 0.0 || fps <= 0.0 {
        return 0;
    }
    (duration * fps).floor() as usize
}

/// 采样的帧序号：0, N, 2N, ... < frame_count
pub fn sample_indices(frame_count: usize, stride: usize) -> impl Iterator<Item = usize> {
    (0..frame_count).step_by(stride.max(1))
}

/// 帧文件名，序号补零到 4 位
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{:04}.jpg", index)
}

/// 帧提取器：按固定步长抽帧并保存为 JPEG
pub struct FrameExtractor {
    input_path: PathBuf,
    output_dir: PathBuf,
    quality: u8,
    stride: usize,
    span: Span,
}

impl FrameExtractor {
    pub fn new(
        input_path: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        quality: u8,
        stride: usize,
    ) -> Result<Self> {
        if stride == 0 {
            anyhow::bail!("抽帧步长必须大于 0");
        }
        if !(1..=100).contains(&quality) {
            anyhow::bail!("JPEG 质量必须在 1-100 之间: {}", quality);
        }
        init_ffmpeg()?;

        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            quality,
            stride,
            span: info_span!("frame_extractor"),
        })
    }

    /// 由调用方指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 获取视频信息
    pub fn get_video_info(&self) -> Result<VideoInfo> {
        let ictx = ffmpeg::format::input(&self.input_path)
            .with_context(|| format!("无法打开视频文件: {}", self.input_path.display()))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .context("无法创建解码器上下文")?;
        let decoder = decoder_context.decoder()
            .video()
            .context("无法创建视频解码器")?;

        let fps = rational_to_f64(video_stream.avg_frame_rate())
            .or_else(|| rational_to_f64(video_stream.rate()))
            .unwrap_or(30.0); // 默认值

        // 容器时长未知时退回到视频流自身的时长
        let duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else if video_stream.duration() > 0 {
            video_stream.duration() as f64 * rational_to_f64(video_stream.time_base()).unwrap_or(0.0)
        } else {
            anyhow::bail!("无法确定视频时长");
        };

        // SAFETY: ictx 在此作用域内有效，只读取一个字段
        let container_start = unsafe { (*ictx.as_ptr()).start_time };
        let start_time = start_offset(
            video_stream.start_time(),
            rational_to_f64(video_stream.time_base()).unwrap_or(0.0),
            container_start,
        );

        Ok(VideoInfo {
            fps,
            duration,
            start_time,
            width: decoder.width(),
            height: decoder.height(),
        })
    }

    /// 抽帧并写出 JPEG，返回成功写出的帧数
    ///
    /// 出错时记录日志并停止，已写出的帧保留在磁盘上。
    pub fn extract_frames(&self) -> usize {
        let _guard = self.span.enter();
        let mut written = 0;

        if let Err(e) = self.try_extract(&mut written) {
            error!(
                "❌ [抽帧] 提取帧失败: {} - {:#} (已写出 {} 帧)",
                self.input_path.display(),
                e,
                written
            );
        }
        written
    }

    fn try_extract(&self, written: &mut usize) -> Result<()> {
        let info = self.get_video_info()?;
        let total_frames = info.frame_count();
        let expected = total_frames.div_ceil(self.stride);

        info!("🎬 [抽帧] 开始处理视频: {}", self.input_path.display());
        info!("  • 分辨率: {}x{}", info.width, info.height);
        info!("  • 帧率: {:.2} fps, 时长: {:.2}秒, 总帧数: {}", info.fps, info.duration, total_frames);
        if info.start_time != 0.0 {
            debug!("[抽帧] 视频流起始时间: {:.3}s", info.start_time);
        }
        info!("  • 步长: {}, 预计输出: {} 帧", self.stride, expected);

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("创建输出目录失败: {}", self.output_dir.display()))?;

        let mut ictx = ffmpeg::format::input(&self.input_path)
            .with_context(|| format!("无法打开视频文件: {}", self.input_path.display()))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;
        let video_stream_index = video_stream.index();
        let time_base = video_stream.time_base();

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .context("无法创建解码器上下文")?;
        let mut decoder = decoder_context.decoder()
            .video()
            .context("无法创建视频解码器")?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("无法创建缩放器")?;

        let mut seeker = FrameSeeker {
            ictx: &mut ictx,
            decoder: &mut decoder,
            stream_index: video_stream_index,
            time_base: rational_to_f64(time_base).unwrap_or(0.0),
            half_frame: 0.5 / info.fps,
            start_time: info.start_time,
        };

        let start = Instant::now();
        let log_interval = (expected / 10).max(1);

        for index in sample_indices(total_frames, self.stride) {
            let target_time = index as f64 / info.fps;
            let decoded = seeker.frame_at(target_time)?;

            let mut rgb_frame = ffmpeg::frame::Video::empty();
            scaler
                .run(&decoded, &mut rgb_frame)
                .context("帧格式转换失败")?;
            let image = frame_to_image(&rgb_frame)?;

            let frame_name = frame_file_name(index);
            let frame_path = self.output_dir.join(&frame_name);
            write_jpeg(&image, &frame_path, self.quality)?;
            *written += 1;
            debug!("💾 [抽帧] 已保存: {} ({:.3}s)", frame_name, target_time);

            if *written % log_interval == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "  📝 进度: {}/{} | 已用: {:.1}s | 速度: {:.1} 帧/s",
                    written,
                    expected,
                    elapsed,
                    *written as f64 / elapsed.max(0.001)
                );
            }
        }

        info!(
            "✅ [抽帧] 完成: {} 帧, 耗时 {:.2}秒, 输出目录: {}",
            written,
            start.elapsed().as_secs_f64(),
            self.output_dir.display()
        );
        Ok(())
    }
}

/// 按时间点 seek 并解码单帧
struct FrameSeeker<'a> {
    ictx: &'a mut ffmpeg::format::context::Input,
    decoder: &'a mut ffmpeg::decoder::Video,
    stream_index: usize,
    time_base: f64,
    half_frame: f64,
    /// 流起始时间（秒），目标时间都相对于它
    start_time: f64,
}

impl FrameSeeker<'_> {
    /// 返回第一帧显示时间到达目标时间（误差半帧以内）的帧；
    /// 若视频在此之前结束，则返回最后解码出的帧。`target_time` 相对于流起点
    fn frame_at(&mut self, target_time: f64) -> Result<ffmpeg::frame::Video> {
        let timestamp = ((target_time + self.start_time) * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;

        // Seek 到目标时间点之前最近的关键帧
        unsafe {
            let ret = ffmpeg::sys::av_seek_frame(
                self.ictx.as_mut_ptr(),
                -1,
                timestamp,
                ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
            );
            if ret < 0 {
                anyhow::bail!("Seek 失败: {:.3}s (错误码 {})", target_time, ret);
            }
        }
        self.decoder.flush();

        let clock = self.clock();
        let mut last: Option<ffmpeg::frame::Video> = None;

        for (stream, packet) in self.ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                // 损坏的数据包直接跳过
                continue;
            }
            if let Some(frame) =
                receive_until(self.decoder, clock, target_time, &mut last)
            {
                return Ok(frame);
            }
        }

        // 读到文件末尾，取出解码器中剩余的帧
        self.decoder.send_eof().context("结束视频解码失败")?;
        if let Some(frame) =
            receive_until(self.decoder, clock, target_time, &mut last)
        {
            return Ok(frame);
        }

        last.with_context(|| format!("无法解码时间点 {:.3}s 的帧", target_time))
    }

    fn clock(&self) -> FrameClock {
        FrameClock {
            time_base: self.time_base,
            start_time: self.start_time,
            half_frame: self.half_frame,
        }
    }
}

/// 把帧时间戳换算为相对流起点的秒数
#[derive(Debug, Clone, Copy)]
struct FrameClock {
    time_base: f64,
    start_time: f64,
    half_frame: f64,
}

impl FrameClock {
    fn seconds(&self, pts: Option<i64>) -> f64 {
        pts.map(|ts| ts as f64 * self.time_base - self.start_time)
            .unwrap_or(0.0)
    }

    /// 帧显示时间是否已到达目标时间（误差半帧以内）
    fn reaches(&self, pts: Option<i64>, target_time: f64) -> bool {
        self.seconds(pts) + self.half_frame >= target_time
    }
}

/// 从解码器取帧，直到某帧的显示时间到达目标时间；更早的帧记入 `last`
fn receive_until(
    decoder: &mut ffmpeg::decoder::Video,
    clock: FrameClock,
    target_time: f64,
    last: &mut Option<ffmpeg::frame::Video>,
) -> Option<ffmpeg::frame::Video> {
    let mut decoded = ffmpeg::frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        if clock.reaches(decoded.timestamp(), target_time) {
            return Some(decoded);
        }
        *last = Some(std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty()));
    }
    None
}

fn rational_to_f64(r: ffmpeg::Rational) -> Option<f64> {
    if r.numerator() > 0 && r.denominator() > 0 {
        Some(r.numerator() as f64 / r.denominator() as f64)
    } else {
        None
    }
}

/// 将 RGB24 的 FFmpeg 帧转换为 RgbImage（逐行去掉 stride 填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let row_bytes = width * 3;
    let mut buffer = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let start = y * stride;
        let row = data
            .get(start..start + row_bytes)
            .context("帧数据长度不足")?;
        buffer.extend_from_slice(row);
    }

    RgbImage::from_raw(width as u32, height as u32, buffer).context("构建图像缓冲区失败")
}

/// 以指定质量写出 JPEG
pub fn write_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let file = File::create(path).with_context(|| format!("无法创建文件: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    encoder
        .encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgb8)
        .with_context(|| format!("JPEG 编码失败: {}", path.display()))?;
    writer.flush().with_context(|| format!("写入文件失败: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_is_ceiling_of_frames_over_stride() {
        for (frames, stride) in [(0, 1), (1, 25), (100, 25), (101, 25), (250, 7), (10, 1), (10, 20)] {
            let indices: Vec<_> = sample_indices(frames, stride).collect();
            assert_eq!(indices.len(), frames.div_ceil(stride), "frames={} stride={}", frames, stride);
            assert!(indices.iter().all(|i| i % stride == 0 && *i < frames));
        }
    }

    #[test]
    fn test_frame_count_truncates() {
        assert_eq!(frame_count(10.0, 25.0), 250);
        assert_eq!(frame_count(3.99, 30.0), 119);
        assert_eq!(frame_count(0.0, 30.0), 0);
        assert_eq!(frame_count(5.0, 0.0), 0);
    }

    #[test]
    fn test_frame_file_name_is_zero_padded() {
        assert_eq!(frame_file_name(0), "frame_0000.jpg");
        assert_eq!(frame_file_name(25), "frame_0025.jpg");
        assert_eq!(frame_file_name(12345), "frame_12345.jpg");
    }

    #[test]
    fn test_write_jpeg_respects_quality() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_fn(64, 48, |x, y| image::Rgb([(x * 4) as u8, (y * 5) as u8, 128]));

        let low = dir.path().join("low.jpg");
        let high = dir.path().join("high.jpg");
        write_jpeg(&image, &low, 10).unwrap();
        write_jpeg(&image, &high, 95).unwrap();

        let decoded = image::open(&high).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        assert!(fs::metadata(&low).unwrap().len() < fs::metadata(&high).unwrap().len());
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        assert!(FrameExtractor::new("in.mp4", "out", 50, 0).is_err());
        assert!(FrameExtractor::new("in.mp4", "out", 0, 25).is_err());
        assert!(FrameExtractor::new("in.mp4", "out", 101, 25).is_err());
    }

    #[test]
    fn test_start_offset_prefers_stream_then_container() {
        // 90kHz 时基，1.4 秒
        assert!((start_offset(126_000, 1.0 / 90_000.0, NO_PTS) - 1.4).abs() < 1e-9);
        assert!((start_offset(NO_PTS, 1.0 / 90_000.0, 1_400_000) - 1.4).abs() < 1e-9);
        assert_eq!(start_offset(NO_PTS, 1.0 / 90_000.0, NO_PTS), 0.0);
        assert_eq!(start_offset(0, 1.0 / 25.0, 1_400_000), 0.0);
    }

    #[test]
    fn test_frame_clock_is_relative_to_stream_start() {
        let clock = FrameClock {
            time_base: 1.0 / 90_000.0,
            start_time: 1.4,
            half_frame: 0.02,
        };
        // 首帧 pts = 1.4s，相对时间 0
        assert!(clock.reaches(Some(126_000), 0.0));
        assert!(!clock.reaches(Some(126_000), 1.0));
        // 1.4s + 0.985s，距 1.0s 不到半帧
        assert!(clock.reaches(Some(214_650), 1.0));
    }

    #[test]
    fn test_extracts_every_nth_frame_from_real_video() {
        let dir = tempfile::tempdir().unwrap();
        let video = crate::test_media::synth_video(dir.path(), "clip.mp4", 2, false);
        let output = dir.path().join("frames");

        let extractor = FrameExtractor::new(&video, &output, 80, 10).unwrap();
        let info = extractor.get_video_info().unwrap();
        assert!((info.fps - 25.0).abs() < 1e-6);
        assert_eq!((info.width, info.height), (160, 120));

        let written = extractor.extract_frames();
        let expected = info.frame_count().div_ceil(10);
        assert!(expected >= 5);
        assert_eq!(written, expected);

        let mut names: Vec<String> = fs::read_dir(&output)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let expected_names: Vec<String> = sample_indices(info.frame_count(), 10)
            .map(frame_file_name)
            .collect();
        assert_eq!(names, expected_names);

        let frame = image::open(output.join("frame_0010.jpg")).unwrap();
        assert_eq!((frame.width(), frame.height()), (160, 120));
    }

    #[test]
    fn test_offset_stream_samples_distinct_frames() {
        let dir = tempfile::tempdir().unwrap();
        let video = crate::test_media::synth_transport_stream(dir.path(), "clip.ts", 2);
        let output = dir.path().join("frames");

        let extractor = FrameExtractor::new(&video, &output, 90, 25).unwrap();
        let info = extractor.get_video_info().unwrap();
        assert!(info.start_time > 0.5, "start_time = {}", info.start_time);

        assert!(extractor.extract_frames() >= 2);
        let first = fs::read(output.join("frame_0000.jpg")).unwrap();
        let second = fs::read(output.join("frame_0025.jpg")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_unreadable_video_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("frames");

        let extractor = FrameExtractor::new(dir.path().join("missing.mp4"), &output, 50, 25).unwrap();
        assert_eq!(extractor.extract_frames(), 0);
        assert!(!output.exists());
    }
}
