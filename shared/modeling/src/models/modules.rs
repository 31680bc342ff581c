use tch::{
    nn::{self, Module},
    Tensor,
};

pub(super) const LRELU_SLOPE: f64 = 0.1;

pub(super) fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LRELU_SLOPE))
}

pub(super) fn same_padding(kernel_size: i64, dilation: i64) -> nn::ConvConfig {
    nn::ConvConfig {
        padding: (kernel_size * dilation - dilation) / 2,
        dilation,
        ..Default::default()
    }
}

/// Residual stack of masked convolutions with optional global conditioning.
#[derive(Debug)]
pub(super) struct ConvStack {
    layers: Vec<nn::Conv1D>,
    cond: Option<nn::Conv1D>,
    dropout: f64,
}

impl ConvStack {
    pub(super) fn new(
        vs: nn::Path,
        channels: i64,
        kernel_size: i64,
        n_layers: usize,
        gin_channels: i64,
        dropout: f64,
    ) -> Self {
        let layers = (0..n_layers)
            .map(|i| {
                nn::conv1d(
                    &vs / "layers" / i,
                    channels,
                    channels,
                    kernel_size,
                    same_padding(kernel_size, 1),
                )
            })
            .collect();
        let cond = (gin_channels > 0)
            .then(|| nn::conv1d(&vs / "cond", gin_channels, channels, 1, Default::default()));
        Self {
            layers,
            cond,
            dropout,
        }
    }

    pub(super) fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        g: Option<&Tensor>,
        train: bool,
    ) -> Tensor {
        let cond = match (&self.cond, g) {
            (Some(cond), Some(g)) => Some(cond.forward(g)),
            _ => None,
        };
        let mut xs = xs * mask;
        for layer in &self.layers {
            let mut h = layer.forward(&xs);
            if let Some(cond) = &cond {
                h = h + cond;
            }
            let h = h.relu().dropout(self.dropout, train);
            xs = (xs + h) * mask;
        }
        xs
    }
}
