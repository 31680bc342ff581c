//! Least-squares adversarial losses, feature matching and the VAE KL term.

use tch::{Kind, Tensor};

/// Returns the summed loss plus the per-discriminator real and generated terms.
pub fn discriminator_loss(real: &[Tensor], fake: &[Tensor]) -> (Tensor, Vec<f64>, Vec<f64>) {
    let mut total = Tensor::from(0f32).to_device(device_of(real));
    let mut real_losses = Vec::with_capacity(real.len());
    let mut fake_losses = Vec::with_capacity(fake.len());
    for (dr, dg) in real.iter().zip(fake) {
        let r_loss = (dr.to_kind(Kind::Float) - 1.0).square().mean(Kind::Float);
        let g_loss = dg.to_kind(Kind::Float).square().mean(Kind::Float);
        real_losses.push(r_loss.double_value(&[]));
        fake_losses.push(g_loss.double_value(&[]));
        total = total + r_loss + g_loss;
    }
    (total, real_losses, fake_losses)
}

pub fn generator_loss(fake: &[Tensor]) -> (Tensor, Vec<f64>) {
    let mut total = Tensor::from(0f32).to_device(device_of(fake));
    let mut losses = Vec::with_capacity(fake.len());
    for dg in fake {
        let loss = (dg.to_kind(Kind::Float) - 1.0).square().mean(Kind::Float);
        losses.push(loss.double_value(&[]));
        total = total + loss;
    }
    (total, losses)
}

/// L1 distance between feature maps, real side detached, times two.
pub fn feature_loss(fmap_real: &[Vec<Tensor>], fmap_fake: &[Vec<Tensor>]) -> Tensor {
    let device = fmap_fake
        .first()
        .and_then(|maps| maps.first())
        .map(|t| t.device())
        .unwrap_or(tch::Device::Cpu);
    let mut total = Tensor::from(0f32).to_device(device);
    for (dr, dg) in fmap_real.iter().zip(fmap_fake) {
        for (rl, gl) in dr.iter().zip(dg) {
            let rl = rl.to_kind(Kind::Float).detach();
            let gl = gl.to_kind(Kind::Float);
            total = total + (rl - gl).abs().mean(Kind::Float);
        }
    }
    total * 2.0
}

/// KL between the flowed posterior sample and the prior, averaged over valid frames.
pub fn kl_loss(
    z_p: &Tensor,
    logs_q: &Tensor,
    m_p: &Tensor,
    logs_p: &Tensor,
    z_mask: &Tensor,
) -> Tensor {
    let z_p = z_p.to_kind(Kind::Float);
    let logs_q = logs_q.to_kind(Kind::Float);
    let m_p = m_p.to_kind(Kind::Float);
    let logs_p = logs_p.to_kind(Kind::Float);

    let kl = &logs_p - logs_q - 0.5 + (z_p - m_p).square() * (&logs_p * -2.0).exp() * 0.5;
    let mask = z_mask.to_kind(Kind::Float);
    (kl * &mask).sum(Kind::Float) / mask.sum(Kind::Float)
}

pub fn mel_loss(mel_real: &Tensor, mel_fake: &Tensor) -> Tensor {
    (mel_real.to_kind(Kind::Float) - mel_fake.to_kind(Kind::Float))
        .abs()
        .mean(Kind::Float)
}

fn device_of(tensors: &[Tensor]) -> tch::Device {
    tensors
        .first()
        .map(|t| t.device())
        .unwrap_or(tch::Device::Cpu)
}
