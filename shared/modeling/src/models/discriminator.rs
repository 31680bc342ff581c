use tch::{
    nn::{self, Module, VarStore},
    Device, Tensor,
};
use vits_core::HParams;

use super::{modules::leaky_relu, Discriminator, DiscriminatorOutput};

const PERIODS: [i64; 5] = [2, 3, 5, 7, 11];

fn conv(
    vs: nn::Path,
    in_channels: i64,
    out_channels: i64,
    kernel_size: i64,
    stride: i64,
    groups: i64,
) -> nn::Conv1D {
    nn::conv1d(
        vs,
        in_channels,
        out_channels,
        kernel_size,
        nn::ConvConfig {
            stride,
            padding: (kernel_size - 1) / 2,
            groups,
            ..Default::default()
        },
    )
}

/// Scores a waveform folded into `period` interleaved columns.
///
/// Each column goes through the same 1-D convolutions, which is a `(k, 1)`
/// 2-D convolution over the folded signal.
#[derive(Debug)]
struct DiscriminatorP {
    period: i64,
    convs: Vec<nn::Conv1D>,
    conv_post: nn::Conv1D,
}

impl DiscriminatorP {
    fn new(vs: nn::Path, period: i64, divisor: i64) -> Self {
        let channels = [1, 32, 128, 512, 1024, 1024].map(|c: i64| (c / divisor).max(1));
        let convs = (0..5)
            .map(|i| {
                let stride = if i < 4 { 3 } else { 1 };
                conv(&vs / "convs" / i, channels[i], channels[i + 1], 5, stride, 1)
            })
            .collect();
        let conv_post = conv(&vs / "conv_post", channels[5], 1, 3, 1, 1);
        Self {
            period,
            convs,
            conv_post,
        }
    }

    fn forward(&self, xs: &Tensor) -> (Tensor, Vec<Tensor>) {
        let size = xs.size();
        let (b, c, t) = (size[0], size[1], size[2]);
        let (xs, t) = if t % self.period != 0 {
            let n_pad = self.period - t % self.period;
            (xs.reflection_pad1d([0, n_pad]), t + n_pad)
        } else {
            (xs.shallow_clone(), t)
        };
        let mut xs = xs
            .view([b, c, t / self.period, self.period])
            .permute([0, 3, 1, 2])
            .reshape([b * self.period, c, t / self.period]);

        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        for layer in &self.convs {
            xs = leaky_relu(&layer.forward(&xs));
            fmap.push(xs.shallow_clone());
        }
        let xs = self.conv_post.forward(&xs);
        fmap.push(xs.shallow_clone());
        let score = xs.view([b, self.period, -1]).transpose(1, 2).flatten(1, -1);
        (score, fmap)
    }
}

/// Scores the raw waveform with strided grouped convolutions.
#[derive(Debug)]
struct DiscriminatorS {
    convs: Vec<nn::Conv1D>,
    conv_post: nn::Conv1D,
}

impl DiscriminatorS {
    fn new(vs: nn::Path, divisor: i64) -> Self {
        let channels = [1, 16, 64, 256, 1024, 1024, 1024].map(|c: i64| (c / divisor).max(1));
        let groups = [1, 4, 16, 64, 256, 1].map(|g: i64| (g / divisor).max(1));
        let kernels = [15, 41, 41, 41, 41, 5];
        let strides = [1, 4, 4, 4, 4, 1];
        let convs = (0..6)
            .map(|i| {
                conv(
                    &vs / "convs" / i,
                    channels[i],
                    channels[i + 1],
                    kernels[i],
                    strides[i],
                    groups[i],
                )
            })
            .collect();
        let conv_post = conv(&vs / "conv_post", channels[6], 1, 3, 1, 1);
        Self { convs, conv_post }
    }

    fn forward(&self, xs: &Tensor) -> (Tensor, Vec<Tensor>) {
        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        let mut xs = xs.shallow_clone();
        for layer in &self.convs {
            xs = leaky_relu(&layer.forward(&xs));
            fmap.push(xs.shallow_clone());
        }
        let xs = self.conv_post.forward(&xs);
        fmap.push(xs.shallow_clone());
        (xs.flatten(1, -1), fmap)
    }
}

#[derive(Debug)]
enum SubDiscriminator {
    Scale(DiscriminatorS),
    Period(DiscriminatorP),
}

impl SubDiscriminator {
    fn forward(&self, xs: &Tensor) -> (Tensor, Vec<Tensor>) {
        match self {
            SubDiscriminator::Scale(d) => d.forward(xs),
            SubDiscriminator::Period(d) => d.forward(xs),
        }
    }
}

/// One scale discriminator plus period discriminators for periods 2, 3, 5, 7 and 11.
pub struct MultiPeriodDiscriminator {
    vs: VarStore,
    discriminators: Vec<SubDiscriminator>,
}

impl MultiPeriodDiscriminator {
    pub fn new(hparams: &HParams, device: Device) -> Self {
        let vs = VarStore::new(device);
        let root = vs.root();
        let divisor = 1024 / hparams.model.discriminator_channels;
        let mut discriminators = vec![SubDiscriminator::Scale(DiscriminatorS::new(
            &root / "discriminators" / 0,
            divisor,
        ))];
        discriminators.extend(PERIODS.iter().enumerate().map(|(i, &period)| {
            SubDiscriminator::Period(DiscriminatorP::new(
                &root / "discriminators" / (i + 1),
                period,
                divisor,
            ))
        }));
        Self { vs, discriminators }
    }
}

impl Discriminator for MultiPeriodDiscriminator {
    fn forward(&self, y: &Tensor, y_hat: &Tensor) -> DiscriminatorOutput {
        let n = self.discriminators.len();
        let mut out = DiscriminatorOutput {
            real: Vec::with_capacity(n),
            fake: Vec::with_capacity(n),
            fmap_real: Vec::with_capacity(n),
            fmap_fake: Vec::with_capacity(n),
        };
        for discriminator in &self.discriminators {
            let (real, fmap_real) = discriminator.forward(y);
            let (fake, fmap_fake) = discriminator.forward(y_hat);
            out.real.push(real);
            out.fake.push(fake);
            out.fmap_real.push(fmap_real);
            out.fmap_fake.push(fmap_fake);
        }
        out
    }

    fn var_store(&self) -> &VarStore {
        &self.vs
    }
}
