//! Helpers for balancing the reconstruction and adversarial terms of VQ-GAN training.
use crate::error::{Result, VqError};
use candle_core::Tensor;

const LAMBDA_EPS: f64 = 1e-4;
const LAMBDA_MAX: f64 = 1e4;
const LAMBDA_SCALE: f64 = 0.8;

/// L2 norm of `d loss / d weight`, or `None` when backprop never reached `weight`
fn grad_norm(loss: &Tensor, weight: &Tensor) -> Result<Option<Tensor>> {
    // Each backward call walks the whole graph again; nothing is freed in between
    let grads = loss.backward()?;
    match grads.get(weight) {
        Some(grad) => Ok(Some(grad.sqr()?.sum_all()?.sqrt()?)),
        None => Ok(None),
    }
}

/// Adaptive weight for the adversarial loss.
///
/// `0.8 * clamp(|d nll / dW| / (|d gan / dW| + 1e-4), 0, 1e4)` where `W` is the
/// decoder's last layer weight. The result is detached.
///
/// candle prunes zero-multiplier and non-differentiable paths from the graph, so an
/// adversarial loss that no longer reaches the weight counts as a zero gradient and
/// the ratio clamps. The reconstruction loss must reach the weight.
pub fn calculate_lambda(
    nll_loss: &Tensor,
    gan_loss: &Tensor,
    last_layer_weight: &Tensor,
) -> Result<Tensor> {
    let nll_norm = grad_norm(nll_loss, last_layer_weight)?
        .ok_or(VqError::MissingGradient("nll_loss"))?;
    let gan_norm = match grad_norm(gan_loss, last_layer_weight)? {
        Some(norm) => norm,
        None => nll_norm.zeros_like()?,
    };

    let lambda = nll_norm.div(&(gan_norm + LAMBDA_EPS)?)?;
    let lambda = lambda.clamp(0.0, LAMBDA_MAX)?.detach();
    Ok((lambda * LAMBDA_SCALE)?)
}

/// Returns `value` until `step` reaches `threshold`, `disc_factor` afterwards.
///
/// Used to keep the discriminator out of the loss while the autoencoder warms up.
pub fn adopt_weight(disc_factor: f64, step: usize, threshold: usize, value: f64) -> f64 {
    if step < threshold {
        value
    } else {
        disc_factor
    }
}
