//! Llama transformer building blocks
//!
//! Contains `RotaryEmbedding` (with llama3 frequency scaling), the padded
//! causal mask, `Attention`, `Mlp` and `DecoderLayer`. Everything takes
//! explicit per-row position ids and an additive mask so that left-padded
//! batches produce the same activations as each row run alone.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, rms_norm, Linear, RmsNorm, VarBuilder};

use super::config::{OrpheusConfig, RopeScaling};
use super::kv_cache::KVCache;

/// Build the additive attention mask for a (possibly left-padded) batch.
///
/// `key_mask[b]` covers every key position seen so far (cache plus the
/// current chunk), 1 for real tokens and 0 for padding. The current `q_len`
/// queries are the last `q_len` of those positions.
///
/// Returns `[batch, 1, q_len, keys]` where `(i, j)` is `0.0` if query `i` may
/// attend to key `j` and `NEG_INFINITY` otherwise. A query always sees
/// itself, so rows made only of padding still softmax to finite values.
pub fn create_padded_causal_mask(
    key_mask: &[Vec<u32>],
    q_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let batch = key_mask.len();
    let total_len = key_mask.first().map_or(0, Vec::len);
    anyhow::ensure!(
        q_len <= total_len,
        "query length {q_len} exceeds key length {total_len}"
    );
    let offset = total_len - q_len;

    let mut mask = Vec::with_capacity(batch * q_len * total_len);
    for row in key_mask {
        anyhow::ensure!(row.len() == total_len, "ragged attention mask");
        for i in 0..q_len {
            let query_pos = offset + i;
            mask.extend(row.iter().enumerate().map(|(j, &m)| {
                if j == query_pos || (j < query_pos && m != 0) {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            }));
        }
    }

    Ok(Tensor::from_vec(mask, (batch, 1, q_len, total_len), device)?)
}

/// Apply RoPE rotation to a tensor.
///
/// `x` has shape `[batch, heads, seq_len, head_dim]`.
/// `cos` and `sin` have shape `[batch, 1, seq_len, head_dim/2]`.
fn apply_rope_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_b, _h, _seq, d) = x.dims4()?;
    let x1 = x.narrow(D::Minus1, 0, d / 2)?;
    let x2 = x.narrow(D::Minus1, d / 2, d / 2)?;

    let cos = cos.to_dtype(x.dtype())?.broadcast_as(x1.shape())?;
    let sin = sin.to_dtype(x.dtype())?.broadcast_as(x1.shape())?;

    // [x1*cos - x2*sin, x2*cos + x1*sin]
    let rotated = Tensor::cat(
        &[
            &(x1.mul(&cos)? - x2.mul(&sin)?)?,
            &(x2.mul(&cos)? + x1.mul(&sin)?)?,
        ],
        D::Minus1,
    )?;

    Ok(rotated)
}

/// Inverse RoPE frequencies, rescaled per the llama3 scheme when configured.
pub fn rope_inv_freq(dim: usize, theta: f64, scaling: Option<&RopeScaling>) -> Vec<f32> {
    let base: Vec<f64> = (0..dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f64 / dim as f64))
        .collect();

    let Some(s) = scaling else {
        return base.into_iter().map(|f| f as f32).collect();
    };

    let old_ctx = s.original_max_position_embeddings as f64;
    let low_freq_wavelen = old_ctx / s.low_freq_factor;
    let high_freq_wavelen = old_ctx / s.high_freq_factor;

    base.into_iter()
        .map(|freq| {
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            let scaled = if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / s.factor
            } else {
                let smooth = (old_ctx / wavelen - s.low_freq_factor)
                    / (s.high_freq_factor - s.low_freq_factor);
                (1.0 - smooth) * freq / s.factor + smooth * freq
            };
            scaled as f32
        })
        .collect()
}

/// Rotary position embedding driven by explicit position ids
pub struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        dim: usize,
        theta: f64,
        scaling: Option<&RopeScaling>,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq = rope_inv_freq(dim, theta, scaling);
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, 1, half), device)?;
        Ok(Self { inv_freq })
    }

    pub fn from_config(config: &OrpheusConfig, device: &Device) -> Result<Self> {
        Self::new(
            config.head_dim(),
            config.rope_theta,
            config.llama3_scaling(),
            device,
        )
    }

    /// Rotate `q` and `k` (`[batch, heads, seq, head_dim]`) using
    /// `positions` (`[batch, seq]`, any integer dtype).
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        // [batch, seq, 1] * [1, 1, half] -> [batch, 1, seq, half]
        let freqs = positions
            .to_dtype(DType::F32)?
            .unsqueeze(2)?
            .broadcast_mul(&self.inv_freq)?
            .unsqueeze(1)?;
        let cos = freqs.cos()?;
        let sin = freqs.sin()?;

        let q_rot = apply_rope_rotation(q, &cos, &sin)?;
        let k_rot = apply_rope_rotation(k, &cos, &sin)?;

        Ok((q_rot, k_rot))
    }
}

/// Multi-head attention with grouped-query attention
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &OrpheusConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        positions: &Tensor,
        attention_mask: Option<&Tensor>,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, seq, heads, head_dim] -> [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rope.apply(&q, &k, positions)?;

        let (k, v) = if let Some(cache) = kv_cache {
            cache.update(&k, &v)?
        } else {
            (k, v)
        };

        let k = self.repeat_kv(&k)?.contiguous()?;
        let v = self.repeat_kv(&v)?.contiguous()?;
        let q = q.contiguous()?;

        let attn_weights =
            (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn_weights = match attention_mask {
            Some(mask) => attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?,
            None => attn_weights,
        };
        // softmax in f32; bf16 loses too much over long contexts
        let in_dtype = attn_weights.dtype();
        let attn_weights =
            candle_nn::ops::softmax_last_dim(&attn_weights.to_dtype(DType::F32)?)?
                .to_dtype(in_dtype)?;
        let attn_output = attn_weights.matmul(&v)?;
        let attn_output =
            attn_output
                .transpose(1, 2)?
                .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&attn_output)?)
    }

    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }

        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        let x = x
            .unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?;
        Ok(x)
    }
}

/// MLP block with SwiGLU activation
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(config: &OrpheusConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Pre-norm transformer decoder layer
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &OrpheusConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            input_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        positions: &Tensor,
        attention_mask: Option<&Tensor>,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let hidden_states = self.input_layernorm.forward(hidden_states)?;
        let hidden_states =
            self.self_attn
                .forward(&hidden_states, rope, positions, attention_mask, kv_cache)?;
        let hidden_states = (hidden_states + residual)?;

        let residual = &hidden_states;
        let mlp_out = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&hidden_states)?)?;
        Ok((mlp_out + residual)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn create_mock_vb(device: &Device) -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, device)
    }

    fn small_config() -> OrpheusConfig {
        OrpheusConfig {
            vocab_size: 1000,
            hidden_size: 64,
            intermediate_size: 128,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            max_position_embeddings: 512,
            rope_theta: 10000.0,
            rope_scaling: None,
            rms_norm_eps: 1e-6,
            tie_word_embeddings: true,
        }
    }

    fn positions(batch: usize, start: u32, len: u32, device: &Device) -> Tensor {
        let row: Vec<u32> = (start..start + len).collect();
        Tensor::new(row.as_slice(), device)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .repeat((batch, 1))
            .unwrap()
    }

    #[test]
    fn test_padded_mask_without_padding_is_causal() {
        let mask = create_padded_causal_mask(&[vec![1, 1, 1]], 3, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        let inf = f32::NEG_INFINITY;
        assert_eq!(rows[0], vec![0.0, inf, inf]);
        assert_eq!(rows[1], vec![0.0, 0.0, inf]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_padded_mask_hides_padding_keys() {
        let mask = create_padded_causal_mask(&[vec![0, 0, 1, 1]], 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        let inf = f32::NEG_INFINITY;
        // Padding queries only see themselves
        assert_eq!(rows[0], vec![0.0, inf, inf, inf]);
        assert_eq!(rows[1], vec![inf, 0.0, inf, inf]);
        // Real queries skip the padding prefix
        assert_eq!(rows[2], vec![inf, inf, 0.0, inf]);
        assert_eq!(rows[3], vec![inf, inf, 0.0, 0.0]);
    }

    #[test]
    fn test_padded_mask_decode_step() {
        let key_mask = vec![vec![0, 1, 1, 1], vec![1, 1, 1, 1]];
        let mask = create_padded_causal_mask(&key_mask, 1, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 1, 4]);
        let flat: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat[..4], [f32::NEG_INFINITY, 0.0, 0.0, 0.0]);
        assert_eq!(flat[4..], [0.0; 4]);
    }

    #[test]
    fn test_padded_mask_rejects_long_query() {
        assert!(create_padded_causal_mask(&[vec![1, 1]], 3, &Device::Cpu).is_err());
    }

    #[test]
    fn test_inv_freq_unscaled() {
        let freqs = rope_inv_freq(8, 10000.0, None);
        assert_eq!(freqs.len(), 4);
        assert!((freqs[0] - 1.0).abs() < 1e-7);
        assert!((freqs[2] - 0.01).abs() < 1e-7);
    }

    #[test]
    fn test_inv_freq_llama3_scaling() {
        let scaling = RopeScaling::default();
        let base = rope_inv_freq(128, 500000.0, None);
        let scaled = rope_inv_freq(128, 500000.0, Some(&scaling));

        // High frequencies are untouched
        assert_eq!(base[0], scaled[0]);
        // Low frequencies are divided by the factor
        let last = base.len() - 1;
        assert!((scaled[last] - base[last] / 32.0).abs() < 1e-12);
        // Everything in between is bounded by the two regimes
        for (b, s) in base.iter().zip(&scaled) {
            assert!(*s <= *b && *s >= b / 32.0 - 1e-12);
        }
    }

    #[test]
    fn test_rotary_embedding_apply() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 10000.0, None, &device).unwrap();

        let q = Tensor::randn(0.0f32, 1.0, (2, 4, 10, 16), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (2, 2, 10, 16), &device).unwrap();
        let (q_rot, k_rot) = rope.apply(&q, &k, &positions(2, 0, 10, &device)).unwrap();

        assert_eq!(q_rot.dims(), q.dims());
        assert_eq!(k_rot.dims(), k.dims());
    }

    #[test]
    fn test_rotary_position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 10000.0, None, &device).unwrap();
        let q = Tensor::randn(0.0f32, 1.0, (1, 2, 1, 16), &device).unwrap();
        let (q_rot, _) = rope.apply(&q, &q, &positions(1, 0, 1, &device)).unwrap();
        let diff: f32 = (q_rot - &q)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rotary_uses_per_row_positions() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 10000.0, None, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 1, 16), &device).unwrap();
        let x2 = Tensor::cat(&[&x, &x], 0).unwrap();

        // Row 0 at position 5, row 1 at position 7
        let pos = Tensor::new(&[[5u32], [7u32]], &device).unwrap();
        let (rot, _) = rope.apply(&x2, &x2, &pos).unwrap();
        let (at5, _) = rope.apply(&x, &x, &positions(1, 5, 1, &device)).unwrap();
        let (at7, _) = rope.apply(&x, &x, &positions(1, 7, 1, &device)).unwrap();

        let row0: Vec<f32> = rot.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let row1: Vec<f32> = rot.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let e5: Vec<f32> = at5.flatten_all().unwrap().to_vec1().unwrap();
        let e7: Vec<f32> = at7.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in row0.iter().zip(&e5) {
            assert!((a - b).abs() < 1e-6);
        }
        for (a, b) in row1.iter().zip(&e7) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mlp() {
        let device = Device::Cpu;
        let mlp = Mlp::new(&small_config(), create_mock_vb(&device)).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (2, 10, 64), &device).unwrap();
        let output = mlp.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 10, 64]);
    }

    #[test]
    fn test_attention_dims() {
        let device = Device::Cpu;
        let attn = Attention::new(&small_config(), create_mock_vb(&device)).unwrap();
        assert_eq!(attn.num_heads, 4);
        assert_eq!(attn.num_kv_heads, 2);
        assert_eq!(attn.head_dim, 16);
    }

    #[test]
    fn test_attention_with_cache() {
        let device = Device::Cpu;
        let attn = Attention::new(&small_config(), create_mock_vb(&device)).unwrap();
        let rope = RotaryEmbedding::new(16, 10000.0, None, &device).unwrap();
        let mut cache = KVCache::new();

        let input1 = Tensor::randn(0.0f32, 1.0, (2, 5, 64), &device).unwrap();
        let mask1 = create_padded_causal_mask(&[vec![1; 5], vec![0, 1, 1, 1, 1]], 5, &device).unwrap();
        let out1 = attn
            .forward(&input1, &rope, &positions(2, 0, 5, &device), Some(&mask1), Some(&mut cache))
            .unwrap();
        assert_eq!(out1.dims(), &[2, 5, 64]);

        let input2 = Tensor::randn(0.0f32, 1.0, (2, 1, 64), &device).unwrap();
        let mask2 =
            create_padded_causal_mask(&[vec![1; 6], vec![0, 1, 1, 1, 1, 1]], 1, &device).unwrap();
        let out2 = attn
            .forward(&input2, &rope, &positions(2, 5, 1, &device), Some(&mask2), Some(&mut cache))
            .unwrap();
        assert_eq!(out2.dims(), &[2, 1, 64]);
        assert_eq!(cache.seq_len(), 6);
    }

    #[test]
    fn test_decoder_layer() {
        let device = Device::Cpu;
        let layer = DecoderLayer::new(&small_config(), create_mock_vb(&device)).unwrap();
        let rope = RotaryEmbedding::new(16, 10000.0, None, &device).unwrap();
        let mut cache = KVCache::new();

        let input = Tensor::randn(0.0f32, 1.0, (1, 8, 64), &device).unwrap();
        let mask = create_padded_causal_mask(&[vec![1; 8]], 8, &device).unwrap();
        let output = layer
            .forward(&input, &rope, &positions(1, 0, 8, &device), Some(&mask), Some(&mut cache))
            .unwrap();
        assert_eq!(output.dims(), &[1, 8, 64]);
    }

    #[test]
    fn test_repeat_kv_with_repeat() {
        let device = Device::Cpu;
        let config = OrpheusConfig {
            num_attention_heads: 8,
            num_key_value_heads: Some(2),
            hidden_size: 128,
            ..small_config()
        };
        let attn = Attention::new(&config, create_mock_vb(&device)).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 10, 16), &device).unwrap();
        assert_eq!(attn.repeat_kv(&x).unwrap().dims(), &[1, 8, 10, 16]);
    }

    #[test]
    fn test_repeat_kv_no_repeat() {
        let device = Device::Cpu;
        let config = OrpheusConfig {
            num_key_value_heads: Some(4),
            ..small_config()
        };
        let attn = Attention::new(&config, create_mock_vb(&device)).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 10, 16), &device).unwrap();
        assert_eq!(attn.repeat_kv(&x).unwrap().dims(), x.dims());
    }
}
