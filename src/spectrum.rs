use anyhow::Result;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// 幅度下限，避免对 0 取对数
const AMIN: f32 = 1e-5;

/// 周期 Hann 窗
pub fn hann_window(n_fft: usize) -> Vec<f32> {
    (0..n_fft)
        .map(|n| {
            let phase = 2.0 * std::f64::consts::PI * n as f64 / n_fft as f64;
            (0.5 - 0.5 * phase.cos()) as f32
        })
        .collect()
}

/// 计算 STFT，返回每一帧单边频谱的峰值幅度
///
/// 帧以 `t * hop_length` 为中心，信号两端各补 `n_fft / 2` 个零，
/// 因此帧数为 `1 + len / hop_length`。
pub fn frame_peak_magnitudes(samples: &[f32], n_fft: usize, hop_length: usize) -> Result<Vec<f32>> {
    if n_fft == 0 || hop_length == 0 {
        anyhow::bail!("n_fft 和 hop_length 必须大于 0");
    }
    if samples.is_empty() {
        anyhow::bail!("音频没有任何采样点");
    }

    let pad = n_fft / 2;
    let mut padded = vec![0.0f32; samples.len() + 2 * pad];
    padded[pad..pad + samples.len()].copy_from_slice(samples);

    let n_frames = 1 + (padded.len() - n_fft) / hop_length;
    let window = hann_window(n_fft);
    let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);

    let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
    let mut scratch = vec![Complex::new(0.0f32, 0.0); fft.get_inplace_scratch_len()];
    let mut peaks = Vec::with_capacity(n_frames);

    for frame in 0..n_frames {
        let start = frame * hop_length;
        let segment = &padded[start..start + n_fft];
        for ((slot, &sample), &w) in buffer.iter_mut().zip(segment).zip(&window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        fft.process_with_scratch(&mut buffer, &mut scratch);

        let peak = buffer[..=n_fft / 2]
            .iter()
            .map(|c| c.norm())
            .fold(0.0f32, f32::max);
        peaks.push(peak);
    }

    Ok(peaks)
}

/// 幅度转分贝，参考值为全局峰值，并以 `max_db - top_db` 为下限
pub fn amplitude_to_db(magnitudes: &[f32], top_db: f32) -> Vec<f32> {
    let reference = magnitudes.iter().copied().fold(0.0f32, f32::max);
    let ref_db = 20.0 * reference.max(AMIN).log10();

    let mut db: Vec<f32> = magnitudes
        .iter()
        .map(|m| 20.0 * m.max(AMIN).log10() - ref_db)
        .collect();

    let max_db = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let floor = max_db - top_db;
    for value in db.iter_mut() {
        *value = value.max(floor);
    }
    db
}
