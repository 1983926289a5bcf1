use candle_core::{Result, Tensor, D};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

/// Row/column of a flattened image token on an `image_tokens_per_dim`-wide grid
pub fn grid_position(
    position: usize,
    past_length: usize,
    image_tokens_per_dim: usize,
) -> (usize, usize) {
    let p = position + past_length;
    (p / image_tokens_per_dim, p % image_tokens_per_dim)
}

/// Factorised 2-D position embeddings for image tokens: `row[p / w] + col[p % w]`.
///
/// Used by the image-token transformer; `past_length` offsets positions when
/// decoding with a KV cache.
#[derive(Debug, Clone)]
pub struct ImagePosEmbeddings {
    image_row_embeddings: Embedding,
    image_col_embeddings: Embedding,
    image_tokens_per_dim: usize,
}

impl ImagePosEmbeddings {
    pub fn load(vb: VarBuilder, image_tokens_per_dim: usize, hidden_size: usize) -> Result<Self> {
        Ok(Self {
            image_row_embeddings: embedding(
                image_tokens_per_dim,
                hidden_size,
                vb.pp("image_row_embeddings"),
            )?,
            image_col_embeddings: embedding(
                image_tokens_per_dim,
                hidden_size,
                vb.pp("image_col_embeddings"),
            )?,
            image_tokens_per_dim,
        })
    }

    /// `(..., seq_len)` token ids -> `(1, seq_len, hidden)`, broadcastable over the batch.
    ///
    /// Only the length of the ids matters, not their values.
    pub fn forward(&self, image_input_ids: &Tensor, past_length: usize) -> Result<Tensor> {
        let seq_len = image_input_ids.dim(D::Minus1)?;
        let device = image_input_ids.device();

        let (row_ids, col_ids): (Vec<u32>, Vec<u32>) = (0..seq_len)
            .map(|i| {
                let (row, col) = grid_position(i, past_length, self.image_tokens_per_dim);
                (row as u32, col as u32)
            })
            .unzip();
        let row_ids = Tensor::from_vec(row_ids, (1, seq_len), device)?;
        let col_ids = Tensor::from_vec(col_ids, (1, seq_len), device)?;

        self.image_row_embeddings.forward(&row_ids)? + self.image_col_embeddings.forward(&col_ids)?
    }
}
