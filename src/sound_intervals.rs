use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, info_span, Span};

use crate::audio_decoder::{decode_mono, AudioTrack};
use crate::metadata::SilenceInterval;
use crate::spectrum::{amplitude_to_db, frame_peak_magnitudes};

/// 静音区间分析参数
#[derive(Debug, Clone, PartialEq)]
pub struct SoundIntervalParams {
    /// FFT 窗口长度
    pub n_fft: usize,
    /// 相邻分析窗口之间的采样步长
    pub hop_length: usize,
    /// 帧峰值不超过该分贝值时视为静音
    pub threshold_db: f32,
    /// 最短静音时长（秒）
    pub min_silence_duration: f64,
    /// 解码后的目标采样率
    pub sample_rate: u32,
    /// 相对峰值的动态范围下限（dB）
    pub top_db: f32,
    /// 输出 JSON 路径，为空时只计算不写文件
    pub output_json: Option<PathBuf>,
}

impl Default for SoundIntervalParams {
    fn default() -> Self {
        Self {
            n_fft: 2048,
            hop_length: 512,
            threshold_db: -40.0,
            min_silence_duration: 0.2,
            sample_rate: 22050,
            top_db: 80.0,
            output_json: Some(PathBuf::from("sound_intervals.json")),
        }
    }
}

impl SoundIntervalParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_fft == 0 {
            anyhow::bail!("n_fft 必须大于 0");
        }
        if self.hop_length == 0 {
            anyhow::bail!("hop_length 必须大于 0");
        }
        if self.sample_rate == 0 {
            anyhow::bail!("sample_rate 必须大于 0");
        }
        if self.min_silence_duration < 0.0 {
            anyhow::bail!("min_silence_duration 不能为负数");
        }
        Ok(())
    }

    /// 帧序号对应的时间（秒）
    pub fn frame_time(&self, frame: usize) -> f64 {
        (frame * self.hop_length) as f64 / self.sample_rate as f64
    }
}

/// 扫描状态：是否存在尚未闭合的静音候选
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanState {
    NoCandidate,
    CandidateOpen { start: f64 },
}

/// 单帧状态转移产生的动作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanAction {
    Continue,
    /// 静音候选闭合且满足最短时长
    Emit(SilenceInterval),
    /// 静音候选闭合但时长不足
    Discard,
}

impl ScanState {
    pub fn new() -> Self {
        ScanState::NoCandidate
    }

    pub fn transition(&self, silent: bool, time: f64, min_duration: f64) -> (ScanState, ScanAction) {
        match (*self, silent) {
            (ScanState::NoCandidate, true) => {
                (ScanState::CandidateOpen { start: time }, ScanAction::Continue)
            }
            (ScanState::NoCandidate, false) => (ScanState::NoCandidate, ScanAction::Continue),
            (ScanState::CandidateOpen { start }, true) => {
                (ScanState::CandidateOpen { start }, ScanAction::Continue)
            }
            (ScanState::CandidateOpen { start }, false) => {
                if time - start >= min_duration {
                    (ScanState::NoCandidate, ScanAction::Emit(SilenceInterval(start, time)))
                } else {
                    (ScanState::NoCandidate, ScanAction::Discard)
                }
            }
        }
    }

    /// 信号结束：仍然打开的候选直接丢弃，不输出
    pub fn finish(self) -> Option<f64> {
        match self {
            ScanState::NoCandidate => None,
            ScanState::CandidateOpen { start } => Some(start),
        }
    }
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

/// 对逐帧峰值分贝做单次扫描，得到静音区间
pub fn scan_silence(frame_db: &[f32], params: &SoundIntervalParams) -> Vec<SilenceInterval> {
    let mut intervals = Vec::new();
    let mut state = ScanState::new();

    for (frame, &db) in frame_db.iter().enumerate() {
        let silent = db <= params.threshold_db;
        let time = params.frame_time(frame);
        let (next, action) = state.transition(silent, time, params.min_silence_duration);
        match action {
            ScanAction::Emit(interval) => intervals.push(interval),
            ScanAction::Discard => {
                debug!("[静音分析] 丢弃过短的静音: {:.3}s", time);
            }
            ScanAction::Continue => {}
        }
        state = next;
    }

    if let Some(start) = state.finish() {
        debug!("[静音分析] 信号结尾的静音未闭合，已丢弃 (起点 {:.3}s)", start);
    }

    intervals
}

/// 对已解码的音轨计算静音区间
pub fn analyze_track(track: &AudioTrack, params: &SoundIntervalParams) -> Result<Vec<SilenceInterval>> {
    params.validate()?;
    if track.sample_rate != params.sample_rate {
        anyhow::bail!(
            "音轨采样率 {} 与参数 {} 不一致",
            track.sample_rate,
            params.sample_rate
        );
    }

    let peaks = frame_peak_magnitudes(&track.samples, params.n_fft, params.hop_length)?;
    let frame_db = amplitude_to_db(&peaks, params.top_db);
    Ok(scan_silence(&frame_db, params))
}

/// 静音区间 JSON 文本（2 空格缩进）
pub fn intervals_to_json(intervals: &[SilenceInterval]) -> Result<String> {
    serde_json::to_string_pretty(intervals).context("序列化静音区间失败")
}

/// 声音区间分析器：解码音频、计算频谱并输出静音区间
pub struct SoundIntervalAnalyzer {
    audio_path: PathBuf,
    params: SoundIntervalParams,
    span: Span,
}

impl SoundIntervalAnalyzer {
    pub fn new(audio_path: impl AsRef<Path>, params: SoundIntervalParams) -> Self {
        Self {
            audio_path: audio_path.as_ref().to_path_buf(),
            params,
            span: info_span!("sound_intervals"),
        }
    }

    /// 由调用方指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn params(&self) -> &SoundIntervalParams {
        &self.params
    }

    /// 分析音频并写出 JSON；失败时记录错误并返回 `None`
    pub fn create_sound_intervals_json(&self) -> Option<Vec<SilenceInterval>> {
        let _guard = self.span.enter();

        match self.try_create() {
            Ok(intervals) => Some(intervals),
            Err(e) => {
                error!("❌ [静音分析] 分析失败: {} - {:#}", self.audio_path.display(), e);
                None
            }
        }
    }

    fn try_create(&self) -> Result<Vec<SilenceInterval>> {
        self.params.validate()?;

        info!("⏳ [静音分析] 正在解码音频: {}", self.audio_path.display());
        let track = decode_mono(&self.audio_path, self.params.sample_rate)?;
        info!(
            "  • 采样点: {} ({:.2}秒, {} Hz)",
            track.samples.len(),
            track.duration(),
            track.sample_rate
        );

        let intervals = analyze_track(&track, &self.params)?;
        info!("✅ [静音分析] 检测到静音区间: {} 个", intervals.len());

        if let Some(output_json) = &self.params.output_json {
            write_intervals(&intervals, output_json)?;
            info!("💾 [静音分析] 区间已保存: {}", output_json.display());
        }

        Ok(intervals)
    }
}

fn write_intervals(intervals: &[SilenceInterval], output_json: &Path) -> Result<()> {
    if let Some(parent) = output_json.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建输出目录失败: {}", parent.display()))?;
    }
    let json = intervals_to_json(intervals)?;
    fs::write(output_json, json)
        .with_context(|| format!("写入静音区间文件失败: {}", output_json.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min_silence_duration: f64) -> SoundIntervalParams {
        SoundIntervalParams {
            min_silence_duration,
            output_json: None,
            ..SoundIntervalParams::default()
        }
    }

    fn tone(seconds: f64, sample_rate: u32) -> Vec<f32> {
        let n = (seconds * sample_rate as f64) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn silence(seconds: f64, sample_rate: u32) -> Vec<f32> {
        vec![0.0; (seconds * sample_rate as f64) as usize]
    }

    #[test]
    fn test_state_machine_transitions() {
        let state = ScanState::new();
        let (state, action) = state.transition(true, 1.0, 0.2);
        assert_eq!(state, ScanState::CandidateOpen { start: 1.0 });
        assert_eq!(action, ScanAction::Continue);

        // 持续静音不移动起点
        let (state, action) = state.transition(true, 1.1, 0.2);
        assert_eq!(state, ScanState::CandidateOpen { start: 1.0 });
        assert_eq!(action, ScanAction::Continue);

        let (state, action) = state.transition(false, 1.5, 0.2);
        assert_eq!(state, ScanState::NoCandidate);
        assert_eq!(action, ScanAction::Emit(SilenceInterval(1.0, 1.5)));

        let (state, action) = state.transition(false, 1.6, 0.2);
        assert_eq!(state, ScanState::NoCandidate);
        assert_eq!(action, ScanAction::Continue);
    }

    #[test]
    fn test_short_silence_is_discarded() {
        let (state, _) = ScanState::new().transition(true, 2.0, 0.2);
        let (state, action) = state.transition(false, 2.1, 0.2);
        assert_eq!(state, ScanState::NoCandidate);
        assert_eq!(action, ScanAction::Discard);
    }

    #[test]
    fn test_trailing_silence_is_dropped() {
        let p = params(0.0);
        // 响 - 静 - 响 - 静（结尾）
        let frame_db = [-10.0, -60.0, -60.0, -5.0, -70.0, -70.0, -70.0];
        let intervals = scan_silence(&frame_db, &p);
        assert_eq!(intervals, vec![SilenceInterval(p.frame_time(1), p.frame_time(3))]);

        let (state, _) = ScanState::new().transition(true, 0.0, 0.0);
        assert_eq!(state.finish(), Some(0.0));
        assert_eq!(ScanState::NoCandidate.finish(), None);
    }

    #[test]
    fn test_threshold_is_inclusive_for_silence() {
        let p = params(0.0);
        let frame_db = [-40.0, -39.9];
        assert_eq!(
            scan_silence(&frame_db, &p),
            vec![SilenceInterval(0.0, p.frame_time(1))]
        );
    }

    #[test]
    fn test_minimum_duration_gate_on_frames() {
        let p = params(0.2);
        // 每帧约 23.2ms，8 帧静音约 0.186s，不足 0.2s
        let mut frame_db = vec![-5.0f32];
        frame_db.extend(std::iter::repeat(-60.0).take(8));
        frame_db.push(-5.0);
        // 9 帧静音约 0.209s，满足
        frame_db.extend(std::iter::repeat(-60.0).take(9));
        frame_db.push(-5.0);

        let intervals = scan_silence(&frame_db, &p);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0], SilenceInterval(p.frame_time(10), p.frame_time(19)));
        assert!(intervals[0].duration() >= 0.2);
    }

    #[test]
    fn test_leading_silence_then_tone() {
        let p = params(0.2);
        let mut samples = silence(2.0, p.sample_rate);
        samples.extend(tone(1.0, p.sample_rate));
        let track = AudioTrack { samples, sample_rate: p.sample_rate };

        let intervals = analyze_track(&track, &p).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start(), 0.0);
        assert!((intervals[0].end() - 2.0).abs() < 0.1, "end = {}", intervals[0].end());
    }

    #[test]
    fn test_brief_gap_between_tones_emits_nothing() {
        let p = params(0.2);
        let mut samples = tone(1.0, p.sample_rate);
        samples.extend(silence(0.1, p.sample_rate));
        samples.extend(tone(1.0, p.sample_rate));
        let track = AudioTrack { samples, sample_rate: p.sample_rate };

        assert!(analyze_track(&track, &p).unwrap().is_empty());
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let p = params(0.2);
        let mut samples = tone(0.5, p.sample_rate);
        samples.extend(silence(0.6, p.sample_rate));
        samples.extend(tone(0.5, p.sample_rate));
        let track = AudioTrack { samples, sample_rate: p.sample_rate };

        let first = intervals_to_json(&analyze_track(&track, &p).unwrap()).unwrap();
        let second = intervals_to_json(&analyze_track(&track, &p).unwrap()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("[\n  [\n    "));
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() {
        let p = params(0.2);
        let track = AudioTrack { samples: vec![0.0; 1024], sample_rate: 16000 };
        assert!(analyze_track(&track, &p).is_err());
    }

    #[test]
    fn test_unreadable_audio_returns_none_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("intervals.json");
        let analyzer = SoundIntervalAnalyzer::new(
            dir.path().join("missing.wav"),
            SoundIntervalParams {
                output_json: Some(output.clone()),
                ..SoundIntervalParams::default()
            },
        );

        assert!(analyzer.create_sound_intervals_json().is_none());
        assert!(!output.exists());
    }

    #[test]
    fn test_end_to_end_on_audio_file() {
        let dir = tempfile::tempdir().unwrap();
        let wav = crate::test_media::synth_wav(dir.path(), "speech.wav", 3, 2);
        let output = dir.path().join("json").join("intervals.json");

        let analyzer = SoundIntervalAnalyzer::new(
            &wav,
            SoundIntervalParams {
                output_json: Some(output.clone()),
                ..SoundIntervalParams::default()
            },
        );
        let intervals = analyzer.create_sound_intervals_json().unwrap();

        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start(), 0.0);
        assert!((intervals[0].end() - 2.0).abs() < 0.1, "end = {}", intervals[0].end());

        let first = fs::read_to_string(&output).unwrap();
        assert_eq!(first, intervals_to_json(&intervals).unwrap());
        analyzer.create_sound_intervals_json().unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), first);
    }
}
