use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, info_span, warn, Span};

/// 默认保存的文件名
pub const DEFAULT_VIDEO_NAME: &str = "video.mp4";

/// 解析出的单个远程流
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// 格式编号
    pub format_id: String,
    /// 可直接下载的地址
    pub url: String,
    /// 容器扩展名，例如 `mp4`、`webm`
    pub container: String,
    pub has_video: bool,
    pub has_audio: bool,
    /// 传输协议，例如 `https`、`m3u8_native`
    pub protocol: String,
}

impl StreamInfo {
    /// 同时包含音频和视频，并且可以通过普通 HTTP 直接下载
    pub fn is_progressive(&self) -> bool {
        self.has_video && self.has_audio && matches!(self.protocol.as_str(), "http" | "https")
    }
}

/// 选出第一个 mp4 容器的渐进式流
pub fn select_progressive_mp4(streams: &[StreamInfo]) -> Option<&StreamInfo> {
    streams
        .iter()
        .find(|s| s.is_progressive() && s.container == "mp4")
}

/// 把视频页面地址解析为可下载的流列表
pub trait StreamResolver {
    fn resolve(&self, url: &str) -> Result<Vec<StreamInfo>>;
}

/// 基于 yt-dlp 的流解析器
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl StreamResolver for YtDlpResolver {
    fn resolve(&self, url: &str) -> Result<Vec<StreamInfo>> {
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--no-playlist")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(url)
            .output()
            .with_context(|| format!("执行 {} 失败", self.binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "解析视频地址失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_yt_dlp_json(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    #[serde(default)]
    format_id: String,
    url: Option<String>,
    #[serde(default)]
    ext: String,
    vcodec: Option<String>,
    acodec: Option<String>,
    protocol: Option<String>,
}

fn has_codec(codec: &Option<String>) -> bool {
    codec.as_deref().is_some_and(|c| !c.is_empty() && c != "none")
}

/// 解析 `yt-dlp --dump-single-json` 的输出，保持原有顺序，跳过没有地址的格式
pub fn parse_yt_dlp_json(bytes: &[u8]) -> Result<Vec<StreamInfo>> {
    let info: YtDlpInfo = serde_json::from_slice(bytes).context("解析 yt-dlp 输出失败")?;

    Ok(info
        .formats
        .into_iter()
        .filter_map(|f| {
            let url = f.url?;
            let protocol = f.protocol.unwrap_or_else(|| {
                url.split_once("://")
                    .map(|(scheme, _)| scheme.to_string())
                    .unwrap_or_default()
            });
            Some(StreamInfo {
                has_video: has_codec(&f.vcodec),
                has_audio: has_codec(&f.acodec),
                format_id: f.format_id,
                url,
                container: f.ext,
                protocol,
            })
        })
        .collect())
}

/// 视频下载器
pub struct VideoDownloader<R: StreamResolver = YtDlpResolver> {
    resolver: R,
    client: reqwest::blocking::Client,
    span: Span,
}

impl<R: StreamResolver> VideoDownloader<R> {
    pub fn new(resolver: R) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            resolver,
            client,
            span: info_span!("video_downloader"),
        })
    }

    /// 由调用方指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 下载视频到 `output_dir/name`（默认 `video.mp4`）
    ///
    /// 没有可用的 mp4 渐进式流时记录警告并返回 `None`，不写任何文件；
    /// 解析或传输失败时记录错误并返回 `None`。
    pub fn download_video(
        &self,
        url: &str,
        output_dir: impl AsRef<Path>,
        name: Option<&str>,
    ) -> Option<PathBuf> {
        let _guard = self.span.enter();
        let name = name.unwrap_or(DEFAULT_VIDEO_NAME);

        match self.try_download(url, output_dir.as_ref(), name) {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                warn!("⚠️  [下载] 该视频没有 mp4 格式的渐进式流: {}", url);
                None
            }
            Err(e) => {
                error!("❌ [下载] 下载失败: {} - {:#}", url, e);
                None
            }
        }
    }

    fn try_download(&self, url: &str, output_dir: &Path, name: &str) -> Result<Option<PathBuf>> {
        info!("⏳ [下载] 正在解析视频地址: {}", url);
        let streams = self.resolver.resolve(url)?;
        debug!("[下载] 解析到 {} 个流", streams.len());

        let Some(stream) = select_progressive_mp4(&streams) else {
            return Ok(None);
        };
        debug!("[下载] 选中格式: {} ({})", stream.format_id, stream.container);

        fs::create_dir_all(output_dir)
            .with_context(|| format!("创建输出目录失败: {}", output_dir.display()))?;
        let output_path = output_dir.join(name);

        let bytes = self
            .transfer(&stream.url, &output_path)
            .inspect_err(|_| remove_partial_download(&output_path))?;

        info!("✅ [下载] 下载完成: {} ({} 字节)", output_path.display(), bytes);
        Ok(Some(output_path))
    }

    fn transfer(&self, url: &str, output_path: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().context("下载请求失败")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("下载文件失败: HTTP {}", status);
        }

        let file = File::create(output_path)
            .with_context(|| format!("无法创建文件: {}", output_path.display()))?;
        let mut writer = BufWriter::new(file);
        let bytes = response.copy_to(&mut writer).context("读取响应数据失败")?;
        writer.flush().context("保存文件失败")?;
        Ok(bytes)
    }
}

fn remove_partial_download(output_path: &Path) {
    if output_path.exists() {
        if let Err(e) = fs::remove_file(output_path) {
            warn!("⚠️  [下载] 清理不完整的文件失败: {} - {}", output_path.display(), e);
        }
    }
}
