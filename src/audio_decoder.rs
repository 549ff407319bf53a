use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;
use std::process::{Command, Stdio};

/// 解码后的音轨：单声道 f32 采样及其采样率
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioTrack {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// 初始化 FFmpeg 并把日志级别压到 ERROR
pub(crate) fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().context("初始化 FFmpeg 失败")?;

    // 日志级别：panic, fatal, error, warning, info, verbose, debug, trace
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

/// 检查输入文件是否包含音频流，返回其编码
pub(crate) fn probe_audio_stream(input_path: &Path) -> Result<ffmpeg::codec::Id> {
    let ictx = ffmpeg::format::input(&input_path)
        .with_context(|| format!("无法打开媒体文件: {}", input_path.display()))?;

    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Audio)
        .with_context(|| format!("未找到音频流: {}", input_path.display()))?;
    Ok(stream.parameters().id())
}

/// 解码音频文件（或视频中的音轨），混音为单声道并重采样到 `target_rate`
///
/// 解码交给 ffmpeg 命令行，输出原始 f32le 采样到 stdout。
pub fn decode_mono(input_path: impl AsRef<Path>, target_rate: u32) -> Result<AudioTrack> {
    let input_path = input_path.as_ref();
    if target_rate == 0 {
        anyhow::bail!("采样率必须大于 0");
    }

    init_ffmpeg()?;
    probe_audio_stream(input_path)?;

    let output = Command::new("ffmpeg")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(input_path)
        .arg("-vn")
        .arg("-ac")
        .arg("1") // 混音为单声道
        .arg("-ar")
        .arg(target_rate.to_string())
        .arg("-f")
        .arg("f32le")
        .arg("-acodec")
        .arg("pcm_f32le")
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("执行 ffmpeg 解码失败: {}", input_path.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "音频解码失败: {} - {}",
            input_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(AudioTrack {
        samples: samples_from_f32le(&output.stdout),
        sample_rate: target_rate,
    })
}

/// 小端 f32 字节流转换为采样，末尾不足 4 字节的部分丢弃
fn samples_from_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = decode_mono(dir.path().join("missing.wav"), 22050).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.wav"));
    }

    #[test]
    fn test_f32le_conversion() {
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.5, -1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0xff);
        assert_eq!(samples_from_f32le(&bytes), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_track_duration() {
        let track = AudioTrack {
            samples: vec![0.0; 44100],
            sample_rate: 22050,
        };
        assert!((track.duration() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_resamples_to_target_rate() {
        let dir = tempfile::tempdir().unwrap();
        let wav = crate::test_media::synth_wav(dir.path(), "tone.wav", 1, 0);

        let track = decode_mono(&wav, 22050).unwrap();
        assert_eq!(track.sample_rate, 22050);
        assert!(
            (track.samples.len() as i64 - 22050).abs() <= 64,
            "samples = {}",
            track.samples.len()
        );
        let peak = track.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.05 && peak <= 1.0, "peak = {}", peak);
    }

    #[test]
    fn test_decode_audio_track_of_video() {
        let dir = tempfile::tempdir().unwrap();
        let video = crate::test_media::synth_video(dir.path(), "clip.mp4", 2, true);

        let track = decode_mono(&video, 16000).unwrap();
        assert!((track.duration() - 2.0).abs() < 0.1, "duration = {}", track.duration());
    }

    #[test]
    fn test_video_without_audio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let video = crate::test_media::synth_video(dir.path(), "silent.mp4", 1, false);
        assert!(decode_mono(&video, 22050).is_err());
    }
}
