use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::face_detection::{DetectionParams, ErrorMode, ImageExtension};
use crate::sound_intervals::SoundIntervalParams;
use crate::video_downloader::DEFAULT_VIDEO_NAME;

/// 下载配置
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    pub file_name: String,
    /// yt-dlp 可执行文件
    pub yt_dlp_path: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_name: DEFAULT_VIDEO_NAME.to_string(),
            yt_dlp_path: "yt-dlp".to_string(),
        }
    }
}

/// 抽帧配置
#[derive(Debug, Clone, PartialEq)]
pub struct FrameConfig {
    /// JPEG 质量 (1-100)
    pub quality: u8,
    /// 每隔多少帧保存一帧
    pub stride: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            quality: 50,
            stride: 25,
        }
    }
}

/// 人脸检测配置
#[derive(Debug, Clone, PartialEq)]
pub struct FaceConfig {
    pub extensions: Vec<ImageExtension>,
    /// Haar 级联分类器 XML 文件
    pub cascade_path: Option<PathBuf>,
    pub params: DetectionParams,
    pub on_error: ErrorMode,
}

/// 默认的正脸级联模型文件名
pub const DEFAULT_CASCADE_FILE: &str = "haarcascade_frontalface_alt.xml";

/// OpenCV 常见的级联模型安装目录
const CASCADE_SEARCH_DIRS: &[&str] = &[
    "/usr/share/opencv4/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/opt/homebrew/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv/haarcascades",
];

impl FaceConfig {
    /// 级联模型路径：配置值优先；否则依次查找当前目录和 OpenCV 安装目录，
    /// 都找不到时返回文件名本身（加载时报错）
    pub fn cascade_file(&self) -> PathBuf {
        if let Some(path) = &self.cascade_path {
            return path.clone();
        }
        let mut dirs = vec![PathBuf::from(".")];
        dirs.extend(CASCADE_SEARCH_DIRS.iter().map(PathBuf::from));
        locate_cascade(&dirs, DEFAULT_CASCADE_FILE)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CASCADE_FILE))
    }
}

fn locate_cascade(dirs: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    dirs.iter().map(|d| d.join(file_name)).find(|p| p.is_file())
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            extensions: ImageExtension::defaults(),
            cascade_path: None,
            params: DetectionParams::default(),
            on_error: ErrorMode::default(),
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    pub download: DownloadConfig,
    pub frames: FrameConfig,
    pub sound: SoundIntervalParams,
    pub faces: FaceConfig,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            frames: FrameConfig::default(),
            sound: SoundIntervalParams::default(),
            faces: FaceConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AnalyzerConfig {
    /// 检查合并后的配置是否可用
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.frames.quality) {
            anyhow::bail!("JPEG 质量必须在 1-100 之间: {}", self.frames.quality);
        }
        if self.frames.stride == 0 {
            anyhow::bail!("抽帧间隔必须大于 0");
        }
        if self.faces.extensions.is_empty() {
            anyhow::bail!("图片扩展名列表不能为空");
        }
        if self.faces.params.scale_factor <= 1.0 {
            anyhow::bail!("scale_factor 必须大于 1.0: {}", self.faces.params.scale_factor);
        }
        self.sound.validate()
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    ///
    /// 命令行参数由调用方在返回值上覆盖。
    pub fn load_config(config_file: Option<&Path>) -> Result<AnalyzerConfig> {
        Self::load_config_with_env(config_file, &|key| env::var(key).ok())
    }

    /// 与 [`ConfigLoader::load_config`] 相同，环境变量从 `lookup` 读取
    pub fn load_config_with_env(
        config_file: Option<&Path>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<AnalyzerConfig> {
        let mut config = AnalyzerConfig::default();

        // 1. 配置文件：显式指定的文件必须存在，默认位置找不到就跳过
        let ini = match config_file {
            Some(path) => Some(Self::read_ini(path)?),
            None => Self::find_default_location()
                .map(|path| Self::read_ini(&path))
                .transpose()?,
        };
        if let Some(ini) = &ini {
            Self::apply_file(&mut config, ini)?;
        }

        // 2. 环境变量
        Self::apply_env(&mut config, lookup)?;

        Ok(config)
    }

    fn read_ini(config_path: &Path) -> Result<Ini> {
        if !config_path.exists() {
            anyhow::bail!("配置文件不存在: {}", config_path.display());
        }

        let mut ini = Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(ini)
    }

    /// 默认位置，按顺序取第一个存在的文件
    fn find_default_location() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("video-analyzer.ini"),
            PathBuf::from(".video-analyzer.ini"),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".video-analyzer.ini"));
        }
        candidates.push(PathBuf::from("/etc/video-analyzer.ini"));

        candidates.into_iter().find(|p| p.exists())
    }

    fn apply_file(config: &mut AnalyzerConfig, ini: &Ini) -> Result<()> {
        // 先查对应节，再查 [default] 节；空值视为未设置
        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("default", key))
                .filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("download", "output_dir") {
            config.download.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("download", "file_name") {
            config.download.file_name = v;
        }
        if let Some(v) = get("download", "yt_dlp_path") {
            config.download.yt_dlp_path = v;
        }

        if let Some(v) = parse_value(get("frames", "quality"), "frames.quality")? {
            config.frames.quality = v;
        }
        if let Some(v) = parse_value(get("frames", "stride"), "frames.stride")? {
            config.frames.stride = v;
        }

        let sound = &mut config.sound;
        if let Some(v) = parse_value(get("sound", "n_fft"), "sound.n_fft")? {
            sound.n_fft = v;
        }
        if let Some(v) = parse_value(get("sound", "hop_length"), "sound.hop_length")? {
            sound.hop_length = v;
        }
        if let Some(v) = parse_value(get("sound", "threshold_db"), "sound.threshold_db")? {
            sound.threshold_db = v;
        }
        if let Some(v) = parse_value(
            get("sound", "min_silence_duration"),
            "sound.min_silence_duration",
        )? {
            sound.min_silence_duration = v;
        }
        if let Some(v) = parse_value(get("sound", "sample_rate"), "sound.sample_rate")? {
            sound.sample_rate = v;
        }
        if let Some(v) = parse_value(get("sound", "top_db"), "sound.top_db")? {
            sound.top_db = v;
        }
        if let Some(v) = get("sound", "output_json") {
            sound.output_json = Some(PathBuf::from(v));
        }

        let faces = &mut config.faces;
        if let Some(v) = get("faces", "extensions") {
            faces.extensions =
                ImageExtension::parse_list(&v).context("配置项 faces.extensions 无效")?;
        }
        if let Some(v) = get("faces", "cascade_path") {
            faces.cascade_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_value(get("faces", "scale_factor"), "faces.scale_factor")? {
            faces.params.scale_factor = v;
        }
        if let Some(v) = parse_value(get("faces", "min_neighbors"), "faces.min_neighbors")? {
            faces.params.min_neighbors = v;
        }
        if let Some(v) = parse_value(get("faces", "min_size"), "faces.min_size")? {
            faces.params.min_size = v;
        }
        if let Some(v) = parse_value(get("faces", "on_error"), "faces.on_error")? {
            faces.on_error = v;
        }

        if let Some(v) = get("logging", "level") {
            config.log_level = v;
        }

        Ok(())
    }

    fn apply_env(config: &mut AnalyzerConfig, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VIDEO_ANALYZER_DOWNLOAD_DIR") {
            config.download.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIDEO_ANALYZER_VIDEO_NAME") {
            config.download.file_name = v;
        }
        if let Some(v) = get("VIDEO_ANALYZER_YT_DLP") {
            config.download.yt_dlp_path = v;
        }
        if let Some(v) = parse_value(get("VIDEO_ANALYZER_FRAME_QUALITY"), "VIDEO_ANALYZER_FRAME_QUALITY")? {
            config.frames.quality = v;
        }
        if let Some(v) = parse_value(get("VIDEO_ANALYZER_FRAME_STRIDE"), "VIDEO_ANALYZER_FRAME_STRIDE")? {
            config.frames.stride = v;
        }
        if let Some(v) = parse_value(get("VIDEO_ANALYZER_THRESHOLD_DB"), "VIDEO_ANALYZER_THRESHOLD_DB")? {
            config.sound.threshold_db = v;
        }
        if let Some(v) = parse_value(
            get("VIDEO_ANALYZER_MIN_SILENCE_DURATION"),
            "VIDEO_ANALYZER_MIN_SILENCE_DURATION",
        )? {
            config.sound.min_silence_duration = v;
        }
        if let Some(v) = get("VIDEO_ANALYZER_CASCADE") {
            config.faces.cascade_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }

        Ok(())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AnalyzerConfig::default();
        let sound = &defaults.sound;
        let faces = &defaults.faces;

        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };

        set("download", "output_dir", defaults.download.output_dir.display().to_string());
        set("download", "file_name", defaults.download.file_name.clone());
        set("download", "yt_dlp_path", defaults.download.yt_dlp_path.clone());
        set("frames", "quality", defaults.frames.quality.to_string());
        set("frames", "stride", defaults.frames.stride.to_string());
        set("sound", "n_fft", sound.n_fft.to_string());
        set("sound", "hop_length", sound.hop_length.to_string());
        set("sound", "threshold_db", format!("{:.1}", sound.threshold_db));
        set("sound", "min_silence_duration", sound.min_silence_duration.to_string());
        set("sound", "sample_rate", sound.sample_rate.to_string());
        set("sound", "top_db", format!("{:.1}", sound.top_db));
        set(
            "sound",
            "output_json",
            sound
                .output_json
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        set("faces", "extensions", ImageExtension::join(&faces.extensions));
        set("faces", "cascade_path", String::new());
        set("faces", "scale_factor", faces.params.scale_factor.to_string());
        set("faces", "min_neighbors", faces.params.min_neighbors.to_string());
        set("faces", "min_size", faces.params.min_size.to_string());
        set("faces", "on_error", faces.on_error.to_string());
        set("logging", "level", defaults.log_level.clone());

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn parse_value<T>(raw: Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    raw.map(|v| {
        v.trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("配置项 {} 无效: {:?} ({})", name, v, e))
    })
    .transpose()
}
