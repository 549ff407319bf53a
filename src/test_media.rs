//! 测试用的合成媒体文件，通过 ffmpeg 的 lavfi 虚拟输入生成

use std::path::{Path, PathBuf};
use std::process::Command;

fn run_ffmpeg(args: &[&str], output: &Path) -> PathBuf {
    let status = Command::new("ffmpeg")
        .args(["-loglevel", "error", "-y"])
        .args(args)
        .arg(output)
        .status()
        .expect("ffmpeg 不可用");
    assert!(status.success(), "ffmpeg 生成测试媒体失败: {}", output.display());
    output.to_path_buf()
}

/// 25fps 的 testsrc 画面（逐帧变化），可选 440Hz 正弦音轨
pub fn synth_video(dir: &Path, name: &str, seconds: u32, with_audio: bool) -> PathBuf {
    let video = format!("testsrc=duration={}:size=160x120:rate=25", seconds);
    let audio = format!("sine=frequency=440:sample_rate=44100:duration={}", seconds);

    let mut args = vec!["-f", "lavfi", "-i", video.as_str()];
    if with_audio {
        args.extend(["-f", "lavfi", "-i", audio.as_str(), "-c:a", "aac", "-shortest"]);
    }
    args.extend(["-c:v", "mpeg4", "-g", "10", "-pix_fmt", "yuv420p"]);
    run_ffmpeg(&args, &dir.join(name))
}

/// 与 [`synth_video`] 相同的画面，封装为 MPEG-TS（首帧时间戳不为 0）
pub fn synth_transport_stream(dir: &Path, name: &str, seconds: u32) -> PathBuf {
    let video = format!("testsrc=duration={}:size=160x120:rate=25", seconds);
    run_ffmpeg(
        &["-f", "lavfi", "-i", video.as_str(), "-c:v", "mpeg4", "-g", "10", "-f", "mpegts"],
        &dir.join(name),
    )
}

/// 44.1kHz 单声道 WAV：前 `silent` 秒静音，之后为正弦音，总长 `seconds` 秒
pub fn synth_wav(dir: &Path, name: &str, seconds: u32, silent: u32) -> PathBuf {
    let source = format!(
        "sine=frequency=440:sample_rate=44100:duration={},volume=volume=0:enable='lt(t,{})'",
        seconds, silent
    );
    run_ffmpeg(&["-f", "lavfi", "-i", source.as_str(), "-c:a", "pcm_s16le"], &dir.join(name))
}

/// 媒体文件中音频流的编码器
pub fn audio_codec(path: &Path) -> ffmpeg_next::codec::Id {
    ffmpeg_next::init().unwrap();
    let ictx = ffmpeg_next::format::input(&path).unwrap();
    let stream = ictx.streams().best(ffmpeg_next::media::Type::Audio).unwrap();
    stream.parameters().id()
}
