//! Scaled dot-product attention over per-head tensors
//!
//! Host models hand cross-attention projections around in flat
//! `[batch, seq, heads * head_dim]` form. These helpers move between that
//! layout and the `[batch, heads, seq, head_dim]` layout the attention
//! kernel works on.

use burn::prelude::*;

/// Split a flat projection into attention heads
///
/// `[batch, seq, heads * head_dim]` -> `[batch, heads, seq, head_dim]`
pub fn split_heads<B: Backend>(
    x: Tensor<B, 3>,
    num_heads: usize,
    head_dim: usize,
) -> Tensor<B, 4> {
    let [batch, seq_len, _] = x.dims();
    x.reshape([batch, seq_len, num_heads, head_dim]).swap_dims(1, 2)
}

/// Merge attention heads back into a flat projection
///
/// `[batch, heads, seq, head_dim]` -> `[batch, seq, heads * head_dim]`
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, num_heads, seq_len, head_dim] = x.dims();
    x.swap_dims(1, 2).reshape([batch, seq_len, num_heads * head_dim])
}

/// Scaled dot-product attention without masking or dropout
///
/// Computes `softmax(q k^T / sqrt(head_dim)) v`.
///
/// # Arguments
///
/// * `q` - Queries `[batch, heads, seq_q, head_dim]`
/// * `k` - Keys `[batch, heads, seq_k, head_dim]`
/// * `v` - Values `[batch, heads, seq_k, head_dim]`
///
/// # Returns
///
/// Attention output `[batch, heads, seq_q, head_dim]`
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let [_, _, _, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.5);

    // [batch, heads, seq_q, seq_k]
    let scores = q.matmul(k.transpose()) * scale;
    let probs = burn::tensor::activation::softmax(scores, 3);

    probs.matmul(v)
}

/// Multi-head attention on flat projections
///
/// Splits `q`, `k` and `v` into `num_heads` heads of `head_dim`, attends,
/// and merges the result back. Output has the same shape as `q`.
pub fn multi_head_attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    num_heads: usize,
    head_dim: usize,
) -> Tensor<B, 3> {
    let q = split_heads(q, num_heads, head_dim);
    let k = split_heads(k, num_heads, head_dim);
    let v = split_heads(v, num_heads, head_dim);

    merge_heads(scaled_dot_product_attention(q, k, v))
}
