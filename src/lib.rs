pub mod metadata;
pub mod config;
pub mod video_downloader;
pub mod frame_extractor;
pub mod audio_decoder;
pub mod audio_extractor;
pub mod spectrum;
pub mod sound_intervals;
pub mod face_detection;
#[cfg(feature = "opencv")]
pub mod haar_cascade;
#[cfg(test)]
mod test_media;

pub use metadata::{DetectionReport, FaceBox, ImageFaces, SilenceInterval};
pub use config::{AnalyzerConfig, ConfigLoader};
pub use video_downloader::{StreamInfo, StreamResolver, VideoDownloader, YtDlpResolver};
pub use frame_extractor::{FrameExtractor, VideoInfo};
pub use audio_decoder::{decode_mono, AudioTrack};
pub use audio_extractor::AudioExtractor;
pub use sound_intervals::{SoundIntervalAnalyzer, SoundIntervalParams};
pub use face_detection::{DetectionParams, ErrorMode, FaceDetection, FaceDetector, ImageExtension};
#[cfg(feature = "opencv")]
pub use haar_cascade::HaarCascadeDetector;
