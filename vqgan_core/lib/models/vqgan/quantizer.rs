use super::ops::straight_through;
use candle_core::{bail, DType, Result, Tensor, D};
use candle_nn::{Embedding, Init, Module, VarBuilder};

/// Nearest-neighbour codebook bottleneck with a straight-through estimator.
///
/// Codebook lives at `embedding.weight` with shape `(n_e, e_dim)`.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    embedding: Embedding,
    pub n_e: usize,
    pub e_dim: usize,
    beta: f64,
}

impl VectorQuantizer {
    pub fn load(vb: VarBuilder, n_e: usize, e_dim: usize, beta: f64) -> Result<Self> {
        let bound = 1.0 / n_e as f64;
        let weight = vb.get_with_hints(
            (n_e, e_dim),
            "embedding.weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            embedding: Embedding::new(weight, e_dim),
            n_e,
            e_dim,
            beta,
        })
    }

    pub fn codebook(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// `(n, e_dim)` -> `(n,)` u32 indices of the closest codebook rows
    fn nearest_indices(&self, z_flat: &Tensor) -> Result<Tensor> {
        // No gradient through the argmin, so keep the distance graph out of backprop
        let z_flat = z_flat.detach();
        let codebook = self.codebook().detach();

        // |z - e|^2 = |z|^2 + |e|^2 - 2 z.e
        let z2 = z_flat.sqr()?.sum_keepdim(1)?;
        let e2 = codebook.sqr()?.sum(1)?.unsqueeze(0)?;
        let ze = z_flat.matmul(&codebook.t()?)?;
        let distances = z2.broadcast_add(&e2)?.sub(&(ze * 2.0)?)?;
        distances.argmin(D::Minus1)
    }

    /// `(b, e_dim, h, w)` -> `(z_q, embedding_loss, indices)`.
    ///
    /// `z_q` has the codebook values in the forward pass and passes gradients
    /// straight through to `z`. `indices` is `(b, h, w)` u32.
    pub fn forward(&self, z: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, c, h, w) = z.dims4()?;
        if c != self.e_dim {
            bail!(
                "quantizer expects {} channels, got input of shape {:?}",
                self.e_dim,
                z.shape()
            );
        }

        // b c h w -> b h w c
        let z = z.permute((0, 2, 3, 1))?.contiguous()?;
        let z_flat = z.reshape((b * h * w, c))?;
        let indices = self.nearest_indices(&z_flat)?;
        let z_q = self.embedding.forward(&indices)?.reshape((b, h, w, c))?;

        // Commitment pulls the encoder towards the codes, the codebook term pulls codes
        // towards the encoder.
        let commitment = (z_q.detach() - &z)?.sqr()?.mean_all()?;
        let codebook_loss = (&z_q - z.detach())?.sqr()?.mean_all()?;
        let loss = ((commitment * self.beta)? + codebook_loss)?;

        let z_q = straight_through(&z, &z_q)?;
        let z_q = z_q.permute((0, 3, 1, 2))?.contiguous()?;

        Ok((z_q, loss, indices.reshape((b, h, w))?))
    }

    /// Same as `forward`, plus the codebook usage perplexity of the batch
    pub fn forward_with_stats(&self, z: &Tensor) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let (z_q, loss, indices) = self.forward(z)?;
        let perplexity = self.perplexity(&indices)?;
        Ok((z_q, loss, indices, perplexity))
    }

    /// Codebook lookup: `(b, h, w)` indices -> `(b, e_dim, h, w)`.
    ///
    /// Indices outside `0..n_e` are not checked.
    pub fn embed_code(&self, indices: &Tensor) -> Result<Tensor> {
        let (_b, _h, _w) = indices.dims3()?;
        self.embedding
            .forward(indices)?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }

    /// exp(entropy) of the code histogram: 1 when a single code is used, `n_e` when
    /// usage is uniform.
    pub fn perplexity(&self, indices: &Tensor) -> Result<Tensor> {
        let flat = indices.flatten_all()?.to_dtype(DType::U32)?.unsqueeze(1)?;
        let codes = Tensor::arange(0u32, self.n_e as u32, indices.device())?.unsqueeze(0)?;
        let one_hot = flat.broadcast_eq(&codes)?.to_dtype(DType::F32)?;
        let avg_probs = one_hot.mean(0)?;
        let entropy = (&avg_probs * (&avg_probs + 1e-10)?.log()?)?
            .sum_all()?
            .neg()?;
        entropy.exp()
    }
}
