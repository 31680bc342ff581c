use std::f64::consts::PI;

use tch::{Device, Kind, Tensor};
use vits_core::DataConfig;

fn hz_to_mel(freq: f64) -> f64 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, shape `[n_mels, n_fft / 2 + 1]`.
pub fn mel_filterbank(
    sampling_rate: u32,
    n_fft: i64,
    n_mels: i64,
    fmin: f64,
    fmax: Option<f64>,
) -> Vec<f32> {
    let n_freqs = (n_fft / 2 + 1) as usize;
    let n_mels = n_mels as usize;
    let fmax = fmax.unwrap_or(sampling_rate as f64 / 2.0);
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let hz_points = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect::<Vec<_>>();
    let fft_freqs = (0..n_freqs)
        .map(|k| k as f64 * sampling_rate as f64 / n_fft as f64)
        .collect::<Vec<_>>();

    let mut filterbank = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let weight = if freq >= lower && freq <= center {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper {
                (upper - freq) / (upper - center)
            } else {
                0.0
            };
            filterbank[m * n_freqs + k] = weight as f32;
        }
    }
    filterbank
}

/// Windowed DFT basis laid out as conv1d weights `[2 * n_freqs, 1, n_fft]`.
///
/// The first `n_freqs` rows are the real part, the rest the imaginary part.
/// A window shorter than `n_fft` is centered and zero padded.
fn dft_kernels(n_fft: i64, win_length: i64) -> Vec<f32> {
    let n_fft = n_fft as usize;
    let win_length = win_length as usize;
    let n_freqs = n_fft / 2 + 1;
    let offset = (n_fft - win_length) / 2;

    // periodic hann window
    let mut window = vec![0.0f64; n_fft];
    for i in 0..win_length {
        window[offset + i] = 0.5 * (1.0 - (2.0 * PI * i as f64 / win_length as f64).cos());
    }

    let mut kernels = vec![0.0f32; 2 * n_freqs * n_fft];
    for k in 0..n_freqs {
        for (n, w) in window.iter().enumerate() {
            let angle = 2.0 * PI * (k * n) as f64 / n_fft as f64;
            kernels[k * n_fft + n] = (w * angle.cos()) as f32;
            kernels[(n_freqs + k) * n_fft + n] = (-w * angle.sin()) as f32;
        }
    }
    kernels
}

/// Spectrogram and mel transforms on device.
///
/// Frames are taken after reflection padding by `(n_fft - hop) / 2` on both
/// sides, so a waveform of `T` samples yields `T / hop` frames.
#[derive(Debug)]
pub struct SpectralTransform {
    n_fft: i64,
    hop_length: i64,
    n_mels: i64,
    dft: Tensor,
    mel_basis: Tensor,
}

impl SpectralTransform {
    pub fn new(config: &DataConfig, device: Device) -> Self {
        let n_fft = config.filter_length;
        let n_freqs = n_fft / 2 + 1;
        let dft = Tensor::from_slice(&dft_kernels(n_fft, config.win_length))
            .view([2 * n_freqs, 1, n_fft])
            .to_device(device);
        let mel_basis = Tensor::from_slice(&mel_filterbank(
            config.sampling_rate,
            n_fft,
            config.n_mel_channels,
            config.mel_fmin,
            config.mel_fmax,
        ))
        .view([config.n_mel_channels, n_freqs])
        .to_device(device);
        Self {
            n_fft,
            hop_length: config.hop_length,
            n_mels: config.n_mel_channels,
            dft,
            mel_basis,
        }
    }

    pub fn n_freqs(&self) -> i64 {
        self.n_fft / 2 + 1
    }

    pub fn n_mels(&self) -> i64 {
        self.n_mels
    }

    pub fn hop_length(&self) -> i64 {
        self.hop_length
    }

    /// Linear magnitude spectrogram. `y` is `[B, T]` or `[B, 1, T]`, the
    /// result is `[B, n_fft / 2 + 1, T / hop]`.
    pub fn spectrogram(&self, y: &Tensor) -> Tensor {
        let y = match y.dim() {
            2 => y.unsqueeze(1),
            _ => y.shallow_clone(),
        };
        let pad = (self.n_fft - self.hop_length) / 2;
        let padded = y.to_kind(Kind::Float).reflection_pad1d([pad, pad]);
        let frames = padded.conv1d(
            &self.dft,
            None::<Tensor>,
            [self.hop_length],
            [0],
            [1],
            1,
        );
        let n_freqs = self.n_freqs();
        let real = frames.narrow(1, 0, n_freqs);
        let imag = frames.narrow(1, n_freqs, n_freqs);
        (real.square() + imag.square() + 1e-6).sqrt()
    }

    /// Projects a linear spectrogram onto the mel basis and log-compresses it.
    pub fn spec_to_mel(&self, spec: &Tensor) -> Tensor {
        let mel = self.mel_basis.matmul(&spec.to_kind(Kind::Float));
        mel.clamp_min(1e-5).log()
    }

    pub fn mel_spectrogram(&self, y: &Tensor) -> Tensor {
        self.spec_to_mel(&self.spectrogram(y))
    }
}

/// Cuts a `size`-wide window out of the last axis of `x` (`[B, C, T]`),
/// starting at the per-row offsets in `ids`.
pub fn slice_segments(x: &Tensor, ids: &Tensor, size: i64) -> Tensor {
    let dims = x.size();
    let offsets = Tensor::arange(size, (Kind::Int64, x.device()));
    let index = (ids.to_kind(Kind::Int64).unsqueeze(-1) + offsets)
        .unsqueeze(1)
        .expand([dims[0], dims[1], size], false);
    x.gather(-1, &index, false)
}

/// Draws one slice offset per row so that `[start, start + size)` stays
/// inside each row's valid length.
pub fn rand_slice_ids(lengths: &Tensor, size: i64) -> Tensor {
    let span = (lengths.to_kind(Kind::Int64) - size).clamp_min(0);
    let draw = Tensor::rand(span.size(), (Kind::Float, span.device()));
    (draw * (span.to_kind(Kind::Float) + 1.0))
        .floor()
        .to_kind(Kind::Int64)
        .minimum(&span)
}

/// Truncates or zero-pads the last axis to exactly `len`.
pub fn fit_length(x: &Tensor, len: i64) -> Tensor {
    let current = x.size().last().copied().unwrap_or(0);
    if current >= len {
        x.narrow(-1, 0, len)
    } else {
        x.constant_pad_nd([0, len - current])
    }
}

/// `[B, max_len]` float mask with ones at positions below each length.
pub fn sequence_mask(lengths: &Tensor, max_len: i64) -> Tensor {
    let positions = Tensor::arange(max_len, (Kind::Int64, lengths.device())).unsqueeze(0);
    positions
        .lt_tensor(&lengths.to_kind(Kind::Int64).unsqueeze(1))
        .to_kind(Kind::Float)
}
