use anyhow::{Context, Result};
use image::GrayImage;
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::metadata::{DetectionReport, FaceBox, ImageFaces};

/// 允许处理的图片扩展名（大小写敏感的后缀匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExtension {
    Jpg,
    Jpeg,
    Png,
    Bmp,
}

impl ImageExtension {
    pub fn suffix(&self) -> &'static str {
        match self {
            ImageExtension::Jpg => ".jpg",
            ImageExtension::Jpeg => ".jpeg",
            ImageExtension::Png => ".png",
            ImageExtension::Bmp => ".bmp",
        }
    }

    /// 默认允许列表：`.jpg` 和 `.png`
    pub fn defaults() -> Vec<ImageExtension> {
        vec![ImageExtension::Jpg, ImageExtension::Png]
    }

    /// 文件名是否以允许列表中的某个后缀结尾
    pub fn matches(allowed: &[ImageExtension], file_name: &str) -> bool {
        allowed.iter().any(|ext| file_name.ends_with(ext.suffix()))
    }

    /// 解析逗号分隔的扩展名列表，例如 `jpg,png`
    pub fn parse_list(value: &str) -> Result<Vec<ImageExtension>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse())
            .collect()
    }

    pub fn join(list: &[ImageExtension]) -> String {
        list.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(",")
    }
}

impl FromStr for ImageExtension {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.') {
            "jpg" => Ok(ImageExtension::Jpg),
            "jpeg" => Ok(ImageExtension::Jpeg),
            "png" => Ok(ImageExtension::Png),
            "bmp" => Ok(ImageExtension::Bmp),
            other => Err(anyhow::anyhow!("不支持的图片扩展名: {}", other)),
        }
    }
}

impl fmt::Display for ImageExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix().trim_start_matches('.'))
    }
}

/// 单张图片处理失败时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// 任意图片失败即中止整个目录扫描，错误返回给调用方
    #[default]
    FailFast,
    /// 记录警告，跳过该图片继续处理
    SkipAndContinue,
}

impl FromStr for ErrorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "abort" => Ok(ErrorMode::FailFast),
            "skip" | "skip-and-continue" | "continue" => Ok(ErrorMode::SkipAndContinue),
            other => Err(anyhow::anyhow!("未知的错误处理模式: {}", other)),
        }
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMode::FailFast => f.write_str("fail-fast"),
            ErrorMode::SkipAndContinue => f.write_str("skip"),
        }
    }
}

/// 多尺度滑动窗口检测参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// 相邻尺度之间的缩放因子
    pub scale_factor: f64,
    /// 候选框保留所需的最少邻居数
    pub min_neighbors: i32,
    /// 最小可检测人脸边长（像素）
    pub min_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: 30,
        }
    }
}

/// 人脸检测后端，输入为单通道灰度图
pub trait FaceDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>> {
        (**self).detect(image)
    }
}

/// 人脸检测器：扫描目录中的图片并输出 JSON 报告
pub struct FaceDetection<D: FaceDetector> {
    detector: D,
    extensions: Vec<ImageExtension>,
    on_error: ErrorMode,
    span: Span,
}

impl<D: FaceDetector> FaceDetection<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            extensions: ImageExtension::defaults(),
            on_error: ErrorMode::default(),
            span: info_span!("face_detection"),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<ImageExtension>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_error_mode(mut self, on_error: ErrorMode) -> Self {
        self.on_error = on_error;
        self
    }

    /// 由调用方指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 扫描目录，逐张检测人脸，全部完成后一次性写出报告
    ///
    /// 处理顺序与目录遍历顺序一致，不做排序。
    /// `FailFast` 模式下任意图片失败都会中止扫描，并且不写出报告。
    pub fn detect_faces(
        &mut self,
        input_dir: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<DetectionReport> {
        let input_dir = input_dir.as_ref();
        let output_path = output_path.as_ref();
        let span = self.span.clone();
        let _guard = span.enter();

        info!("🔍 [人脸检测] 开始扫描目录: {}", input_dir.display());

        let entries = fs::read_dir(input_dir)
            .with_context(|| format!("无法读取目录: {}", input_dir.display()))?;

        let mut report: DetectionReport = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("遍历目录失败: {}", input_dir.display()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();

            if !ImageExtension::matches(&self.extensions, &file_name) {
                debug!("[人脸检测] 跳过非图片文件: {}", file_name);
                continue;
            }

            match self.process_image(&entry.path(), &file_name) {
                Ok(record) => {
                    debug!("[人脸检测] {}: {} 张人脸", file_name, record.num_faces);
                    report.push(record);
                }
                Err(e) => match self.on_error {
                    ErrorMode::FailFast => {
                        error!("❌ [人脸检测] 处理图片失败，中止扫描: {} - {:#}", file_name, e);
                        return Err(e.context(format!("处理图片失败: {}", file_name)));
                    }
                    ErrorMode::SkipAndContinue => {
                        warn!("⚠️  [人脸检测] 处理图片失败，已跳过: {} - {:#}", file_name, e);
                    }
                },
            }
        }

        save_results(&report, output_path)?;

        let total_faces: usize = report.iter().map(|r| r.num_faces).sum();
        info!(
            "✅ [人脸检测] 完成: {} 张图片, {} 张人脸, 结果已写入 {}",
            report.len(),
            total_faces,
            output_path.display()
        );

        Ok(report)
    }

    fn process_image(&mut self, image_path: &Path, file_name: &str) -> Result<ImageFaces> {
        let image = image::io::Reader::open(image_path)
            .with_context(|| format!("无法打开图片: {}", image_path.display()))?
            .with_guessed_format()
            .with_context(|| format!("无法识别图片格式: {}", image_path.display()))?
            .decode()
            .with_context(|| format!("图片解码失败: {}", image_path.display()))?;

        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray)?;
        Ok(ImageFaces::new(file_name, faces))
    }
}

/// 写出报告 JSON（4 空格缩进，非 ASCII 字符转义为 `\uXXXX`）
fn save_results(report: &[ImageFaces], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建输出目录失败: {}", parent.display()))?;
    }

    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    report
        .serialize(&mut serializer)
        .context("序列化检测结果失败")?;
    let json = String::from_utf8(buffer).context("检测结果不是合法的 UTF-8")?;

    let file = File::create(output_path)
        .with_context(|| format!("无法创建结果文件: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(escape_non_ascii(&json).as_bytes())
        .context("写入检测结果失败")?;
    writer.flush().context("写入检测结果失败")?;
    Ok(())
}

/// 非 ASCII 字符只会出现在 JSON 字符串内部，逐字符替换为 UTF-16 转义
fn escape_non_ascii(json: &str) -> String {
    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    escaped
}
