use tch::{
    nn::{self, Module, VarStore},
    Device, Kind, Tensor,
};
use vits_core::HParams;

use super::{
    modules::{leaky_relu, same_padding, ConvStack},
    GeneratorOutput, InferenceOutput, SynthesisGenerator,
};
use crate::{
    audio::{fit_length, rand_slice_ids, sequence_mask, slice_segments},
    TrainingBatch,
};

const TEXT_ENCODER_LAYERS: usize = 4;
const POSTERIOR_ENCODER_LAYERS: usize = 4;
const FLOW_COUPLINGS: usize = 2;
const FLOW_CONV_LAYERS: usize = 2;
const NOISE_SCALE: f64 = 0.667;

#[derive(Debug)]
struct TextEncoder {
    emb: nn::Embedding,
    encoder: ConvStack,
    proj: nn::Conv1D,
    hidden_channels: i64,
    inter_channels: i64,
}

impl TextEncoder {
    fn new(vs: nn::Path, hparams: &HParams) -> Self {
        let model = &hparams.model;
        Self {
            emb: nn::embedding(
                &vs / "emb",
                hparams.data.n_symbols,
                model.hidden_channels,
                Default::default(),
            ),
            encoder: ConvStack::new(
                &vs / "encoder",
                model.hidden_channels,
                model.kernel_size,
                TEXT_ENCODER_LAYERS,
                0,
                model.p_dropout,
            ),
            proj: nn::conv1d(
                &vs / "proj",
                model.hidden_channels,
                model.inter_channels * 2,
                1,
                Default::default(),
            ),
            hidden_channels: model.hidden_channels,
            inter_channels: model.inter_channels,
        }
    }

    /// Returns the hidden text features, prior mean, prior log-scale and mask.
    fn forward(&self, tokens: &Tensor, lengths: &Tensor, train: bool) -> [Tensor; 4] {
        let xs = self.emb.forward(tokens) * (self.hidden_channels as f64).sqrt();
        let xs = xs.transpose(1, 2);
        let x_mask = sequence_mask(lengths, xs.size()[2]).unsqueeze(1);
        let xs = self.encoder.forward(&xs, &x_mask, None, train);
        let stats = self.proj.forward(&xs) * &x_mask;
        let mut parts = stats.split(self.inter_channels, 1);
        let logs_p = parts.remove(1);
        let m_p = parts.remove(0);
        [xs, m_p, logs_p, x_mask]
    }
}

#[derive(Debug)]
struct PosteriorEncoder {
    pre: nn::Conv1D,
    encoder: ConvStack,
    proj: nn::Conv1D,
    inter_channels: i64,
}

impl PosteriorEncoder {
    fn new(vs: nn::Path, hparams: &HParams, gin_channels: i64) -> Self {
        let model = &hparams.model;
        let spec_channels = hparams.data.filter_length / 2 + 1;
        Self {
            pre: nn::conv1d(
                &vs / "pre",
                spec_channels,
                model.hidden_channels,
                1,
                Default::default(),
            ),
            encoder: ConvStack::new(
                &vs / "encoder",
                model.hidden_channels,
                model.kernel_size,
                POSTERIOR_ENCODER_LAYERS,
                gin_channels,
                0.0,
            ),
            proj: nn::conv1d(
                &vs / "proj",
                model.hidden_channels,
                model.inter_channels * 2,
                1,
                Default::default(),
            ),
            inter_channels: model.inter_channels,
        }
    }

    /// Returns the sampled latent, posterior mean, posterior log-scale and mask.
    fn forward(&self, spec: &Tensor, lengths: &Tensor, g: Option<&Tensor>, train: bool) -> [Tensor; 4] {
        let mask = sequence_mask(lengths, spec.size()[2]).unsqueeze(1);
        let xs = self.pre.forward(spec) * &mask;
        let xs = self.encoder.forward(&xs, &mask, g, train);
        let stats = self.proj.forward(&xs) * &mask;
        let mut parts = stats.split(self.inter_channels, 1);
        let logs_q = parts.remove(1);
        let m_q = parts.remove(0);
        let z = (&m_q + m_q.randn_like() * logs_q.exp()) * &mask;
        [z, m_q, logs_q, mask]
    }
}

/// Mean-only affine coupling: the second half of the channels is shifted by
/// a function of the first half.
#[derive(Debug)]
struct CouplingLayer {
    half_channels: i64,
    pre: nn::Conv1D,
    encoder: ConvStack,
    post: nn::Conv1D,
}

impl CouplingLayer {
    fn new(vs: nn::Path, hparams: &HParams, gin_channels: i64) -> Self {
        let model = &hparams.model;
        let half_channels = model.inter_channels / 2;
        let zeros = nn::ConvConfig {
            ws_init: nn::Init::Const(0.0),
            bs_init: nn::Init::Const(0.0),
            ..Default::default()
        };
        Self {
            half_channels,
            pre: nn::conv1d(
                &vs / "pre",
                half_channels,
                model.hidden_channels,
                1,
                Default::default(),
            ),
            encoder: ConvStack::new(
                &vs / "encoder",
                model.hidden_channels,
                model.kernel_size,
                FLOW_CONV_LAYERS,
                gin_channels,
                0.0,
            ),
            post: nn::conv1d(&vs / "post", model.hidden_channels, half_channels, 1, zeros),
        }
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor, g: Option<&Tensor>, reverse: bool) -> Tensor {
        let parts = xs.split(self.half_channels, 1);
        let (x0, x1) = (&parts[0], &parts[1]);
        let h = self.pre.forward(x0) * mask;
        let h = self.encoder.forward(&h, mask, g, false);
        let shift = self.post.forward(&h) * mask;
        let x1 = if reverse {
            (x1 - shift) * mask
        } else {
            shift + x1 * mask
        };
        Tensor::cat(&[x0, &x1], 1)
    }
}

#[derive(Debug)]
struct DurationPredictor {
    cond: Option<nn::Conv1D>,
    conv_1: nn::Conv1D,
    conv_2: nn::Conv1D,
    proj: nn::Conv1D,
    dropout: f64,
}

impl DurationPredictor {
    fn new(vs: nn::Path, hparams: &HParams, gin_channels: i64) -> Self {
        let model = &hparams.model;
        Self {
            cond: (gin_channels > 0).then(|| {
                nn::conv1d(
                    &vs / "cond",
                    gin_channels,
                    model.hidden_channels,
                    1,
                    Default::default(),
                )
            }),
            conv_1: nn::conv1d(
                &vs / "conv_1",
                model.hidden_channels,
                model.filter_channels,
                model.kernel_size,
                same_padding(model.kernel_size, 1),
            ),
            conv_2: nn::conv1d(
                &vs / "conv_2",
                model.filter_channels,
                model.filter_channels,
                model.kernel_size,
                same_padding(model.kernel_size, 1),
            ),
            proj: nn::conv1d(&vs / "proj", model.filter_channels, 1, 1, Default::default()),
            dropout: model.p_dropout,
        }
    }

    /// Log durations per token. Text features are detached so the duration
    /// loss never reaches the text encoder.
    fn forward(&self, xs: &Tensor, mask: &Tensor, g: Option<&Tensor>, train: bool) -> Tensor {
        let mut xs = xs.detach();
        if let (Some(cond), Some(g)) = (&self.cond, g) {
            xs = xs + cond.forward(&g.detach());
        }
        let xs = self
            .conv_1
            .forward(&(&xs * mask))
            .relu()
            .dropout(self.dropout, train);
        let xs = self
            .conv_2
            .forward(&(&xs * mask))
            .relu()
            .dropout(self.dropout, train);
        self.proj.forward(&(&xs * mask)) * mask
    }
}

#[derive(Debug)]
struct ResBlock {
    convs: Vec<nn::Conv1D>,
}

impl ResBlock {
    fn new(vs: nn::Path, channels: i64) -> Self {
        let convs = [1, 3]
            .into_iter()
            .enumerate()
            .map(|(i, dilation)| nn::conv1d(&vs / i, channels, channels, 3, same_padding(3, dilation)))
            .collect();
        Self { convs }
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        self.convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward(&leaky_relu(&xs)) + xs)
    }
}

/// Transposed-convolution vocoder. Each stage upsamples by its rate, so the
/// output has `frames * prod(upsample_rates)` samples.
#[derive(Debug)]
struct Decoder {
    conv_pre: nn::Conv1D,
    cond: Option<nn::Conv1D>,
    ups: Vec<nn::ConvTranspose1D>,
    resblocks: Vec<ResBlock>,
    conv_post: nn::Conv1D,
}

impl Decoder {
    fn new(vs: nn::Path, hparams: &HParams, gin_channels: i64) -> Self {
        let model = &hparams.model;
        let initial = model.upsample_initial_channel;
        let conv_pre = nn::conv1d(
            &vs / "conv_pre",
            model.inter_channels,
            initial,
            7,
            same_padding(7, 1),
        );
        let cond = (gin_channels > 0)
            .then(|| nn::conv1d(&vs / "cond", gin_channels, initial, 1, Default::default()));

        let mut channels = initial;
        let mut ups = Vec::new();
        let mut resblocks = Vec::new();
        for (i, (&rate, &kernel)) in model
            .upsample_rates
            .iter()
            .zip(&model.upsample_kernel_sizes)
            .enumerate()
        {
            let out = (initial >> (i + 1)).max(1);
            ups.push(nn::conv_transpose1d(
                &vs / "ups" / i,
                channels,
                out,
                kernel,
                nn::ConvTransposeConfig {
                    stride: rate,
                    padding: (kernel - rate) / 2,
                    ..Default::default()
                },
            ));
            resblocks.push(ResBlock::new(&vs / "resblocks" / i, out));
            channels = out;
        }
        let conv_post = nn::conv1d(
            &vs / "conv_post",
            channels,
            1,
            7,
            nn::ConvConfig {
                padding: 3,
                bias: false,
                ..Default::default()
            },
        );
        Self {
            conv_pre,
            cond,
            ups,
            resblocks,
            conv_post,
        }
    }

    fn forward(&self, xs: &Tensor, g: Option<&Tensor>) -> Tensor {
        let mut xs = self.conv_pre.forward(xs);
        if let (Some(cond), Some(g)) = (&self.cond, g) {
            xs = xs + cond.forward(g);
        }
        for (up, resblock) in self.ups.iter().zip(&self.resblocks) {
            xs = resblock.forward(&up.forward(&leaky_relu(&xs)));
        }
        self.conv_post.forward(&xs.leaky_relu()).tanh()
    }
}

/// Frame `j` of a row attends to token `floor(j * tokens / frames)`.
fn uniform_alignment(token_lengths: &Tensor, spec_lengths: &Tensor, t_x: i64, t_y: i64) -> Tensor {
    let device = token_lengths.device();
    let token_lengths = token_lengths.to_kind(Kind::Int64);
    let frames = Tensor::arange(t_y, (Kind::Float, device)).unsqueeze(0);
    let ratio = token_lengths.to_kind(Kind::Float).unsqueeze(1)
        / spec_lengths.to_kind(Kind::Float).clamp_min(1.0).unsqueeze(1);
    let last_token = (&token_lengths - 1).clamp_min(0).unsqueeze(1);
    let index = (frames * ratio)
        .floor()
        .to_kind(Kind::Int64)
        .minimum(&last_token);
    let x_mask = sequence_mask(&token_lengths, t_x).unsqueeze(1);
    let y_mask = sequence_mask(spec_lengths, t_y).unsqueeze(2);
    (index.one_hot(t_x).to_kind(Kind::Float) * x_mask * y_mask).unsqueeze(1)
}

/// Hard monotonic path from integer durations, `[B, 1, t_y, tokens]`.
fn generate_path(durations: &Tensor, t_y: i64) -> Tensor {
    let end = durations.cumsum(1, Kind::Float);
    let start = &end - durations;
    let frames = Tensor::arange(t_y, (Kind::Float, durations.device())).view([1, t_y, 1]);
    frames
        .ge_tensor(&start.unsqueeze(1))
        .logical_and(&frames.lt_tensor(&end.unsqueeze(1)))
        .to_kind(Kind::Float)
        .unsqueeze(1)
}

/// Spread token-rate statistics `[B, C, tokens]` to frame rate through `attn`.
fn expand_to_frames(attn: &Tensor, stats: &Tensor) -> Tensor {
    attn.squeeze_dim(1)
        .matmul(&stats.transpose(1, 2))
        .transpose(1, 2)
}

/// Conditional VAE generator with a text prior, a spectrogram posterior, a
/// coupling flow between them and a waveform decoder.
pub struct SynthesizerTrn {
    vs: VarStore,
    enc_p: TextEncoder,
    enc_q: PosteriorEncoder,
    flows: Vec<CouplingLayer>,
    dp: DurationPredictor,
    pitch_proj: nn::Conv1D,
    dec: Decoder,
    emb_g: Option<nn::Embedding>,
    segment_frames: i64,
    training: bool,
}

impl SynthesizerTrn {
    pub fn new(hparams: &HParams, device: Device) -> Self {
        let vs = VarStore::new(device);
        let root = vs.root();
        let gin_channels = if hparams.data.n_speakers > 1 {
            hparams.model.gin_channels
        } else {
            0
        };

        let enc_p = TextEncoder::new(&root / "enc_p", hparams);
        let enc_q = PosteriorEncoder::new(&root / "enc_q", hparams, gin_channels);
        let flows = (0..FLOW_COUPLINGS)
            .map(|i| CouplingLayer::new(&root / "flow" / i, hparams, gin_channels))
            .collect();
        let dp = DurationPredictor::new(&root / "dp", hparams, gin_channels);
        let pitch_proj = nn::conv1d(
            &root / "pitch_proj",
            1,
            hparams.model.inter_channels,
            1,
            Default::default(),
        );
        let dec = Decoder::new(&root / "dec", hparams, gin_channels);
        let emb_g = (gin_channels > 0).then(|| {
            nn::embedding(
                &root / "emb_g",
                hparams.data.n_speakers,
                gin_channels,
                Default::default(),
            )
        });

        Self {
            vs,
            enc_p,
            enc_q,
            flows,
            dp,
            pitch_proj,
            dec,
            emb_g,
            segment_frames: hparams.segment_frames(),
            training: true,
        }
    }

    fn speaker_embedding(&self, speakers: &Tensor) -> Option<Tensor> {
        self.emb_g
            .as_ref()
            .map(|emb| emb.forward(speakers).unsqueeze(-1))
    }

    fn pitch_embedding(&self, pitch: &Tensor) -> Tensor {
        let pitch = (pitch.to_kind(Kind::Float).clamp_min(0.0) + 1.0).log();
        self.pitch_proj.forward(&pitch.unsqueeze(1))
    }

    fn flow(&self, xs: &Tensor, mask: &Tensor, g: Option<&Tensor>, reverse: bool) -> Tensor {
        if reverse {
            self.flows.iter().rev().fold(xs.shallow_clone(), |xs, layer| {
                layer.forward(&xs.flip([1]), mask, g, true)
            })
        } else {
            self.flows.iter().fold(xs.shallow_clone(), |xs, layer| {
                layer.forward(&xs, mask, g, false).flip([1])
            })
        }
    }
}

impl SynthesisGenerator for SynthesizerTrn {
    fn forward_train(&self, batch: &TrainingBatch) -> GeneratorOutput {
        let train = self.training;
        let g = self.speaker_embedding(&batch.speakers);
        let [x, m_p, logs_p, x_mask] =
            self.enc_p
                .forward(&batch.tokens, &batch.token_lengths, train);
        let [z, m_q, logs_q, z_mask] =
            self.enc_q
                .forward(&batch.spec, &batch.spec_lengths, g.as_ref(), train);
        let z_p = self.flow(&z, &z_mask, g.as_ref(), false);

        let attn = tch::no_grad(|| {
            uniform_alignment(
                &batch.token_lengths,
                &batch.spec_lengths,
                x_mask.size()[2],
                z_mask.size()[2],
            )
        });

        let w = attn.sum_dim_intlist(2, false, Kind::Float);
        let logw_target = (w + 1e-6).log() * &x_mask;
        let logw = self.dp.forward(&x, &x_mask, g.as_ref(), train);
        let l_length = (logw - logw_target).square().sum(Kind::Float) / x_mask.sum(Kind::Float);

        let m_p = expand_to_frames(&attn, &m_p);
        let logs_p = expand_to_frames(&attn, &logs_p);

        let frames = z.size()[2].max(self.segment_frames);
        let decoder_input = fit_length(&(&z + self.pitch_embedding(&batch.pitch)), frames);
        let ids_slice = rand_slice_ids(&batch.spec_lengths, self.segment_frames);
        let z_slice = slice_segments(&decoder_input, &ids_slice, self.segment_frames);
        let y_hat = self.dec.forward(&z_slice, g.as_ref());

        GeneratorOutput {
            y_hat,
            l_length,
            attn,
            ids_slice,
            x_mask,
            z_mask,
            z,
            z_p,
            m_p,
            logs_p,
            m_q,
            logs_q,
        }
    }

    fn infer(&self, batch: &TrainingBatch, max_len: Option<i64>) -> InferenceOutput {
        let g = self.speaker_embedding(&batch.speakers);
        let [x, m_p, logs_p, x_mask] =
            self.enc_p
                .forward(&batch.tokens, &batch.token_lengths, false);
        let logw = self.dp.forward(&x, &x_mask, g.as_ref(), false);
        let durations = (logw.exp() * &x_mask).ceil().squeeze_dim(1);

        let total = durations
            .sum_dim_intlist(1, false, Kind::Float)
            .clamp_min(1.0);
        let longest = total.max().double_value(&[]) as i64;
        let t_y = max_len.map_or(longest, |max_len| longest.min(max_len.max(1)));
        let y_lengths = total.clamp_max(t_y as f64).to_kind(Kind::Int64);
        let y_mask = sequence_mask(&y_lengths, t_y).unsqueeze(1);
        let attn = generate_path(&durations, t_y) * y_mask.unsqueeze(-1);

        let m_p = expand_to_frames(&attn, &m_p);
        let logs_p = expand_to_frames(&attn, &logs_p);
        let z_p = (&m_p + m_p.randn_like() * logs_p.exp() * NOISE_SCALE) * &y_mask;
        let z = self.flow(&z_p, &y_mask, g.as_ref(), true);
        let pitch = fit_length(&batch.pitch.unsqueeze(1), t_y).squeeze_dim(1);
        let z = (z + self.pitch_embedding(&pitch)) * &y_mask;
        let audio = self.dec.forward(&z, g.as_ref());

        InferenceOutput {
            audio,
            attn,
            y_mask,
        }
    }

    fn var_store(&self) -> &VarStore {
        &self.vs
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tiny_batch, tiny_hparams};

    #[test]
    fn training_forward_produces_one_segment() {
        tch::manual_seed(0);
        let hparams = tiny_hparams();
        let generator = SynthesizerTrn::new(&hparams, Device::Cpu);
        let batch = tiny_batch(&hparams, Device::Cpu);
        let out = generator.forward_train(&batch);
        assert_eq!(
            out.y_hat.size(),
            vec![batch.size(), 1, hparams.train.segment_size]
        );
        assert_eq!(out.z_p.size(), out.m_p.size());
        assert_eq!(out.attn.size()[2], batch.spec.size()[2]);
        assert!(out.l_length.double_value(&[]).is_finite());
    }

    #[test]
    fn alignment_covers_every_valid_frame_once() {
        let attn = uniform_alignment(
            &Tensor::from_slice(&[3i64, 2]),
            &Tensor::from_slice(&[6i64, 4]),
            3,
            6,
        );
        let per_frame = attn.sum_dim_intlist(-1, false, Kind::Float);
        assert_eq!(
            Vec::<f32>::try_from(&per_frame.flatten(0, -1)).unwrap(),
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]
        );
        let per_token = attn.sum_dim_intlist(2, false, Kind::Float);
        assert_eq!(
            Vec::<f32>::try_from(&per_token.flatten(0, -1)).unwrap(),
            vec![2.0, 2.0, 2.0, 2.0, 2.0, 0.0]
        );
    }

    #[test]
    fn path_follows_durations() {
        let path = generate_path(&Tensor::from_slice(&[1.0f32, 2.0]).view([1, 2]), 4);
        assert_eq!(
            Vec::<f32>::try_from(&path.flatten(0, -1)).unwrap(),
            vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn inference_respects_max_len() {
        tch::manual_seed(0);
        let hparams = tiny_hparams();
        let generator = SynthesizerTrn::new(&hparams, Device::Cpu);
        let batch = tiny_batch(&hparams, Device::Cpu).first();
        let out = tch::no_grad(|| generator.infer(&batch, Some(2)));
        assert!(out.audio.size()[2] <= 2 * hparams.data.hop_length);
        assert_eq!(out.audio.size()[2] % hparams.data.hop_length, 0);
    }
}
