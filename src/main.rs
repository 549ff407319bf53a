use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use video_analyzer::{
    AnalyzerConfig, AudioExtractor, ConfigLoader, FrameExtractor, SoundIntervalAnalyzer,
    VideoDownloader, YtDlpResolver,
};

/// 视频分析工具 - 下载视频，抽帧、提取音频、检测静音区间和人脸
#[derive(Parser, Debug)]
#[command(name = "video-analyzer")]
#[command(about = "视频分析工具：下载、抽帧、音频提取、静音区间检测、人脸检测", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 下载视频（mp4 渐进式流）
    Download {
        /// 视频页面地址
        #[arg(short, long)]
        url: String,

        /// 输出目录
        /// 可通过环境变量 VIDEO_ANALYZER_DOWNLOAD_DIR 或配置文件设置
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 保存的文件名（默认 video.mp4）
        #[arg(long)]
        name: Option<String>,
    },
    /// 按固定间隔抽帧，保存为 JPEG
    Frames {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出目录
        #[arg(short, long, default_value = "./frames")]
        output: PathBuf,

        /// JPEG 质量 (1-100)
        /// 可通过环境变量 VIDEO_ANALYZER_FRAME_QUALITY 或配置文件设置
        #[arg(long)]
        quality: Option<u8>,

        /// 每隔多少帧保存一帧
        /// 可通过环境变量 VIDEO_ANALYZER_FRAME_STRIDE 或配置文件设置
        #[arg(long)]
        stride: Option<usize>,
    },
    /// 提取音轨，格式由输出文件扩展名决定
    Audio {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出音频文件路径
        #[arg(short, long)]
        output: PathBuf,
    },
    /// 检测静音区间，输出 [[start, end], ...] JSON
    Intervals {
        /// 输入音频（或视频）文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出 JSON 路径（默认 sound_intervals.json）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// FFT 窗口长度
        #[arg(long)]
        n_fft: Option<usize>,

        /// 分析窗口步长（采样点）
        #[arg(long)]
        hop_length: Option<usize>,

        /// 静音阈值（dB，相对峰值）
        #[arg(long, allow_hyphen_values = true)]
        threshold_db: Option<f32>,

        /// 最短静音时长（秒）
        #[arg(long)]
        min_silence_duration: Option<f64>,
    },
    /// 检测目录中每张图片的人脸，输出 JSON 报告
    Faces {
        /// 图片目录
        #[arg(short, long)]
        input: PathBuf,

        /// 输出 JSON 路径
        #[arg(short, long, default_value = "face_detection.json")]
        output: PathBuf,

        /// Haar 级联模型 XML 文件
        /// 未指定时依次查找当前目录和 OpenCV 安装目录（如 /usr/share/opencv4/haarcascades）
        /// 中的 haarcascade_frontalface_alt.xml，也可通过 VIDEO_ANALYZER_CASCADE 或配置文件设置
        #[arg(long)]
        cascade: Option<PathBuf>,

        /// 单张图片失败时跳过并继续，而不是中止
        #[arg(long)]
        skip_errors: bool,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load_config(args.config.as_deref()).context("加载配置失败")?;

    // 初始化日志：RUST_LOG 优先，否则使用配置中的级别
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Download { url, output, name } => {
            if let Some(output) = output {
                config.download.output_dir = output;
            }
            if let Some(name) = name {
                config.download.file_name = name;
            }

            let resolver = YtDlpResolver::new(config.download.yt_dlp_path.clone());
            let downloader = VideoDownloader::new(resolver)?;
            let path = downloader
                .download_video(
                    &url,
                    &config.download.output_dir,
                    Some(&config.download.file_name),
                )
                .context("下载视频失败")?;
            println!("{}", path.display());
        }
        Commands::Frames {
            input,
            output,
            quality,
            stride,
        } => {
            if let Some(quality) = quality {
                config.frames.quality = quality;
            }
            if let Some(stride) = stride {
                config.frames.stride = stride;
            }
            config.validate()?;

            let extractor =
                FrameExtractor::new(&input, &output, config.frames.quality, config.frames.stride)?;
            let count = extractor.extract_frames();
            if count == 0 {
                anyhow::bail!("未能提取任何帧: {}", input.display());
            }
            println!("{}", count);
        }
        Commands::Audio { input, output } => {
            let extractor = AudioExtractor::new(&input)?;
            let path = extractor
                .extract_audio(&output)
                .context("提取音频失败")?;
            println!("{}", path.display());
        }
        Commands::Intervals {
            input,
            output,
            n_fft,
            hop_length,
            threshold_db,
            min_silence_duration,
        } => {
            let sound = &mut config.sound;
            if let Some(output) = output {
                sound.output_json = Some(output);
            }
            if let Some(n_fft) = n_fft {
                sound.n_fft = n_fft;
            }
            if let Some(hop_length) = hop_length {
                sound.hop_length = hop_length;
            }
            if let Some(threshold_db) = threshold_db {
                sound.threshold_db = threshold_db;
            }
            if let Some(min_silence_duration) = min_silence_duration {
                sound.min_silence_duration = min_silence_duration;
            }
            config.validate()?;

            let analyzer = SoundIntervalAnalyzer::new(&input, config.sound.clone());
            let intervals = analyzer
                .create_sound_intervals_json()
                .context("静音区间分析失败")?;
            println!("{}", serde_json::to_string(&intervals)?);
        }
        Commands::Faces {
            input,
            output,
            cascade,
            skip_errors,
        } => {
            if let Some(cascade) = cascade {
                config.faces.cascade_path = Some(cascade);
            }
            if skip_errors {
                config.faces.on_error = video_analyzer::ErrorMode::SkipAndContinue;
            }
            config.validate()?;

            run_face_detection(&config, &input, &output)?;
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)
                .with_context(|| format!("生成配置文件失败: {}", path.display()))?;
            println!("配置文件已生成: {}", path.display());
        }
    }

    Ok(())
}

#[cfg(feature = "opencv")]
fn run_face_detection(
    config: &AnalyzerConfig,
    input: &std::path::Path,
    output: &std::path::Path,
) -> Result<()> {
    use video_analyzer::{FaceDetection, HaarCascadeDetector};

    let cascade = config.faces.cascade_file();
    let detector = HaarCascadeDetector::from_file(&cascade, config.faces.params)?;

    let report = FaceDetection::new(detector)
        .with_extensions(config.faces.extensions.clone())
        .with_error_mode(config.faces.on_error)
        .detect_faces(input, output)
        .context("人脸检测失败")?;
    println!("{}", report.len());
    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn run_face_detection(
    _config: &AnalyzerConfig,
    _input: &std::path::Path,
    _output: &std::path::Path,
) -> Result<()> {
    anyhow::bail!("人脸检测需要 OpenCV 支持，请使用 `--features opencv` 重新编译")
}
