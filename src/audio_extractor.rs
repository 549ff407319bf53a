use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use ffmpeg_next::codec::Id;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::audio_decoder::{init_ffmpeg, probe_audio_stream};

/// 音频提取器，从视频中提取音轨
pub struct AudioExtractor {
    input_path: PathBuf,
    span: Span,
}

impl AudioExtractor {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self> {
        init_ffmpeg()?;

        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
            span: info_span!("audio_extractor"),
        })
    }

    /// 由调用方指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 提取音频到文件，容器格式由输出文件扩展名决定
    ///
    /// 失败时记录错误并返回 `None`，不会留下不完整的输出文件。
    pub fn extract_audio(&self, output_path: impl AsRef<Path>) -> Option<PathBuf> {
        let output_path = output_path.as_ref();
        let _guard = self.span.enter();

        match self.extract_to_file(output_path) {
            Ok(()) => {
                info!("✅ [音频提取] 音频提取完成: {}", output_path.display());
                Some(output_path.to_path_buf())
            }
            Err(e) => {
                error!("❌ [音频提取] 提取音频失败: {} - {:#}", self.input_path.display(), e);
                None
            }
        }
    }

    fn extract_to_file(&self, output_path: &Path) -> Result<()> {
        // 没有音轨时不启动 ffmpeg，也就不会创建输出文件
        let codec = probe_audio_stream(&self.input_path)?;

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建输出目录失败: {}", parent.display()))?;
        }

        // 源编码正好是目标容器的默认编码时，直接复制音频流
        if stream_copy_compatible(output_path, codec) {
            let status = Command::new("ffmpeg")
                .arg("-loglevel")
                .arg("error") // 只显示错误信息
                .arg("-i")
                .arg(&self.input_path)
                .arg("-vn") // 不包含视频
                .arg("-acodec")
                .arg("copy")
                .arg("-y") // 覆盖输出文件
                .arg(output_path)
                .status()
                .context("执行 ffmpeg 命令失败")?;

            if status.success() {
                return Ok(());
            }
            info!("[音频提取] 直接复制音频流失败，改为重新编码");
        } else {
            debug!("[音频提取] 源编码 {:?} 与输出格式不匹配，重新编码", codec);
        }

        // 由 ffmpeg 按扩展名选择编码器
        let status = Command::new("ffmpeg")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&self.input_path)
            .arg("-vn")
            .arg("-y")
            .arg(output_path)
            .status()
            .context("执行 ffmpeg 重新编码失败")
            .inspect_err(|_| remove_partial_output(output_path))?;

        if !status.success() {
            remove_partial_output(output_path);
            anyhow::bail!("音频提取失败: ffmpeg 退出码 {:?}", status.code());
        }

        Ok(())
    }
}

/// 输出扩展名对应容器的默认音频编码是否就是源编码
fn stream_copy_compatible(output_path: &Path, codec: Id) -> bool {
    let extension = output_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "m4a" | "aac" | "mka" => codec == Id::AAC,
        "mp3" => codec == Id::MP3,
        "ogg" | "oga" => codec == Id::VORBIS,
        "opus" => codec == Id::OPUS,
        "flac" => codec == Id::FLAC,
        "wav" => codec == Id::PCM_S16LE,
        _ => false,
    }
}

/// ffmpeg 失败后可能留下不完整的文件
fn remove_partial_output(output_path: &Path) {
    if output_path.exists() {
        if let Err(e) = fs::remove_file(output_path) {
            warn!("⚠️  [音频提取] 清理不完整的输出失败: {} - {}", output_path.display(), e);
        }
    }
}
