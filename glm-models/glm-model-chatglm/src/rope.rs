/// How rotated lanes are paired inside the rotary span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeStyle {
    /// Lane `i` pairs with lane `i + dim/2` (GPT-NeoX `rotate_half`).
    Neox,
    /// Lane `2i` pairs with lane `2i + 1` (GPT-J).
    Interleaved,
}

/// Rotary position embedding over a `dim`-wide span of every head.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    dim: usize,
    inv_freq: Vec<f32>,
    style: RopeStyle,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, base: f32, style: RopeStyle) -> Self {
        let inv_freq = (0..dim / 2)
            .map(|i| 1.0 / (base as f64).powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        Self {
            dim,
            inv_freq,
            style,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rotate lanes `[offset, offset + dim)` of each head in place.
    ///
    /// `x` is `[rows, num_heads * head_dim]`; row `r` is rotated by
    /// `positions[r]`.
    pub fn apply(
        &self,
        x: &mut [f32],
        positions: &[usize],
        num_heads: usize,
        head_dim: usize,
        offset: usize,
    ) {
        let half = self.dim / 2;
        let stride = num_heads * head_dim;
        for (row, &pos) in x.chunks_exact_mut(stride).zip(positions) {
            for head in row.chunks_exact_mut(head_dim) {
                let span = &mut head[offset..offset + self.dim];
                for (i, &freq) in self.inv_freq.iter().enumerate() {
                    let (sin, cos) = (pos as f32 * freq).sin_cos();
                    let (a, b) = match self.style {
                        RopeStyle::Neox => (i, i + half),
                        RopeStyle::Interleaved => (2 * i, 2 * i + 1),
                    };
                    let (x0, x1) = (span[a], span[b]);
                    span[a] = x0 * cos - x1 * sin;
                    span[b] = x1 * cos + x0 * sin;
                }
            }
        }
    }
}
