//! Sentence embeddings.

use tracing::debug;

use crate::batch::LlamaBatch;
use crate::context::{LlamaContext, PoolingType};
use crate::error::{LlamaError, Result};
use crate::token::LlamaToken;

/// Embed each tokenized input.
///
/// Inputs are packed into one batch as separate sequences, up to
/// `n_seq_max` sequences and `min(n_batch, n_ubatch)` tokens per decode,
/// so encoder-only models see the whole batch in one ubatch. With pooling
/// enabled the pooled vector is read per sequence; with `PoolingType::None`
/// the per-token vectors are mean-pooled here.
///
/// The context is switched to embeddings mode for the call and restored
/// to its previous mode afterwards, including on error.
pub fn embed(ctx: &mut LlamaContext, inputs: &[Vec<LlamaToken>], normalize: bool) -> Result<Vec<Vec<f32>>> {
    let limit = ctx.n_batch().min(ctx.n_ubatch()).max(1) as usize;
    for (i, tokens) in inputs.iter().enumerate() {
        if tokens.is_empty() {
            return Err(LlamaError::InvalidArgument(format!("input {i} is empty")));
        }
        if tokens.len() > limit {
            return Err(LlamaError::InvalidArgument(format!(
                "input {i} has {} tokens, more than min(n_batch, n_ubatch) ({limit})",
                tokens.len()
            )));
        }
    }

    let previous = ctx.embeddings_enabled();
    ctx.set_embeddings(true);
    let result = embed_all(ctx, inputs, limit, normalize);
    if !previous {
        ctx.set_embeddings(false);
    }
    result
}

fn embed_all(
    ctx: &mut LlamaContext,
    inputs: &[Vec<LlamaToken>],
    limit: usize,
    normalize: bool,
) -> Result<Vec<Vec<f32>>> {
    let n_seq_max = (ctx.n_seq_max() as usize).max(1);
    let encoder_only = ctx.model().has_encoder() && !ctx.model().has_decoder();

    let mut batch = LlamaBatch::new(limit, n_seq_max)?;
    let mut out = Vec::with_capacity(inputs.len());
    let mut group: Vec<&[LlamaToken]> = Vec::new();
    for tokens in inputs {
        if group.len() == n_seq_max || batch.n_tokens() + tokens.len() > limit {
            embed_group(ctx, &mut batch, &mut group, encoder_only, normalize, &mut out)?;
        }
        batch.add_sequence(tokens, 0, group.len() as i32, true)?;
        group.push(tokens.as_slice());
    }
    embed_group(ctx, &mut batch, &mut group, encoder_only, normalize, &mut out)?;

    Ok(out)
}

/// Decode one packed batch and read one vector per sequence.
fn embed_group(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch<'static>,
    group: &mut Vec<&[LlamaToken]>,
    encoder_only: bool,
    normalize: bool,
    out: &mut Vec<Vec<f32>>,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }
    ctx.kv_cache_clear();
    if encoder_only {
        ctx.encode(batch)?;
    } else {
        ctx.decode(batch)?;
    }
    debug!(sequences = group.len(), tokens = batch.n_tokens(), "embedding batch");

    let n_embd = ctx.model().n_embd() as usize;
    let pooling = ctx.pooling_type();
    let mut row = 0usize;
    for (seq, tokens) in group.iter().enumerate() {
        let mut v = if pooling == PoolingType::None {
            let mut acc = vec![0.0f32; n_embd];
            for k in 0..tokens.len() {
                let e = ctx
                    .embeddings_ith((row + k) as i32)
                    .ok_or(LlamaError::NullPointer("llama_get_embeddings_ith"))?;
                acc.iter_mut().zip(e).for_each(|(a, x)| *a += x);
            }
            acc.iter_mut().for_each(|a| *a /= tokens.len() as f32);
            acc
        } else {
            ctx.embeddings_seq(seq as i32)
                .ok_or(LlamaError::NullPointer("llama_get_embeddings_seq"))?
                .to_vec()
        };
        if normalize {
            normalize_l2(&mut v);
        }
        out.push(v);
        row += tokens.len();
    }

    batch.clear();
    group.clear();
    Ok(())
}

/// Scale `v` to unit length. Zero vectors are left unchanged.
pub fn normalize_l2(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity of two vectors; 0 when either is zero or their
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}
