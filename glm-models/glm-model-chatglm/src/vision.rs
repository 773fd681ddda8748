//! EVA2-CLIP vision tower of GLM-4V.

use glm_core::{AttentionMask, Backend, GlmError, Image, Result, VisionModelConfig};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::layers::{GeluMLP, LayerNorm, Linear};
use crate::weights::{WeightBinder, WeightSpecs};

/// CLIP normalization constants.
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

/// The projector's LayerNorm runs with the framework default epsilon.
const PROJECTOR_NORM_EPS: f32 = 1e-5;

/// Resize to `size x size` with Catmull-Rom and normalize to planar
/// `[3, size, size]` floats.
pub fn preprocess_image(image: &Image, size: usize) -> Result<Vec<f32>> {
    let buffer = RgbImage::from_raw(
        image.width() as u32,
        image.height() as u32,
        image.pixels().to_vec(),
    )
    .ok_or_else(|| GlmError::InvalidInput(format!("{image:?} has an inconsistent pixel buffer")))?;
    let resized = imageops::resize(&buffer, size as u32, size as u32, FilterType::CatmullRom);

    let plane = size * size;
    let mut out = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            out[c * plane + offset] = (pixel.0[c] as f32 / 255.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }
    Ok(out)
}

struct VisionLayer<B: Backend> {
    input_layernorm: LayerNorm<B>,
    query_key_value: Linear<B>,
    dense: Linear<B>,
    mlp: GeluMLP<B>,
    post_attention_layernorm: LayerNorm<B>,
}

/// Gated projection from vision features into the language model width.
struct GluProjector<B: Backend> {
    linear_proj: Linear<B>,
    norm1: LayerNorm<B>,
    gate_proj: Linear<B>,
    dense_h_to_4h: Linear<B>,
    dense_4h_to_h: Linear<B>,
}

pub struct VisionTower<B: Backend> {
    config: VisionModelConfig,
    /// `[in_channels * patch * patch, hidden]`
    patch_proj: Linear<B>,
    cls_embedding: B::Tensor,
    position_embedding: B::Tensor,
    layers: Vec<VisionLayer<B>>,
    /// 2x2 stride-2 downsampling conv as `[hidden * 4, text_hidden]`.
    conv: Linear<B>,
    projector: GluProjector<B>,
    boi: B::Tensor,
    eoi: B::Tensor,
}

const PREFIX: &str = "transformer.vision";

/// Vision tower tensors, projecting into a `text_hidden`-wide model with
/// `text_ffn` projector width.
pub(crate) fn vision_specs(
    specs: &mut WeightSpecs,
    config: &VisionModelConfig,
    text_hidden: usize,
    text_ffn: usize,
) {
    let h = config.hidden_size;
    let p = config.patch_size;
    let pe = format!("{PREFIX}.patch_embedding");
    specs.push(format!("{pe}.cls_embedding"), &[1, h]);
    specs.push(format!("{pe}.proj.weight"), &[h, config.in_channels, p, p]);
    specs.push(format!("{pe}.proj.bias"), &[h]);
    specs.push(format!("{pe}.position_embedding.weight"), &[config.num_positions, h]);
    for i in 0..config.num_hidden_layers {
        let l = format!("{PREFIX}.transformer.layers.{i}");
        specs.layer_norm(&format!("{l}.input_layernorm"), h);
        specs.linear(&format!("{l}.attention.query_key_value"), 3 * h, h, true);
        specs.linear(&format!("{l}.attention.dense"), h, h, true);
        specs.linear(&format!("{l}.mlp.fc1"), config.intermediate_size, h, true);
        specs.linear(&format!("{l}.mlp.fc2"), h, config.intermediate_size, true);
        specs.layer_norm(&format!("{l}.post_attention_layernorm"), h);
    }
    specs.push(format!("{PREFIX}.conv.weight"), &[text_hidden, h, 2, 2]);
    specs.push(format!("{PREFIX}.conv.bias"), &[text_hidden]);
    let lp = format!("{PREFIX}.linear_proj");
    specs.linear(&format!("{lp}.linear_proj"), text_hidden, text_hidden, false);
    specs.layer_norm(&format!("{lp}.norm1"), text_hidden);
    specs.linear(&format!("{lp}.gate_proj"), text_ffn, text_hidden, false);
    specs.linear(&format!("{lp}.dense_h_to_4h"), text_ffn, text_hidden, false);
    specs.linear(&format!("{lp}.dense_4h_to_h"), text_hidden, text_ffn, false);
    specs.push(format!("{PREFIX}.boi"), &[1, 1, text_hidden]);
    specs.push(format!("{PREFIX}.eoi"), &[1, 1, text_hidden]);
}

impl<B: Backend> VisionTower<B> {
    pub(crate) fn load(
        binder: &WeightBinder<'_, B>,
        config: &VisionModelConfig,
        text_hidden: usize,
        text_ffn: usize,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let p = config.patch_size;
        let eps = config.norm_eps;
        let pe = format!("{PREFIX}.patch_embedding");
        let patch_proj = Linear::new(
            binder.conv_weight(&format!("{pe}.proj.weight"), h, config.in_channels, p)?,
            Some(binder.tensor(&format!("{pe}.proj.bias"), &[h])?),
        );
        let cls_embedding = binder.tensor(&format!("{pe}.cls_embedding"), &[1, h])?;
        let position_embedding =
            binder.tensor(&format!("{pe}.position_embedding.weight"), &[config.num_positions, h])?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let l = format!("{PREFIX}.transformer.layers.{i}");
            layers.push(VisionLayer {
                input_layernorm: LayerNorm::load(binder, &format!("{l}.input_layernorm"), h, eps)?,
                query_key_value: Linear::load(
                    binder,
                    &format!("{l}.attention.query_key_value"),
                    3 * h,
                    h,
                    true,
                )?,
                dense: Linear::load(binder, &format!("{l}.attention.dense"), h, h, true)?,
                mlp: GeluMLP::new(
                    Linear::load(binder, &format!("{l}.mlp.fc1"), config.intermediate_size, h, true)?,
                    Linear::load(binder, &format!("{l}.mlp.fc2"), h, config.intermediate_size, true)?,
                ),
                post_attention_layernorm: LayerNorm::load(
                    binder,
                    &format!("{l}.post_attention_layernorm"),
                    h,
                    eps,
                )?,
            });
        }

        let conv = Linear::new(
            binder.conv_weight(&format!("{PREFIX}.conv.weight"), text_hidden, h, 2)?,
            Some(binder.tensor(&format!("{PREFIX}.conv.bias"), &[text_hidden])?),
        );
        let lp = format!("{PREFIX}.linear_proj");
        let projector = GluProjector {
            linear_proj: Linear::load(binder, &format!("{lp}.linear_proj"), text_hidden, text_hidden, false)?,
            norm1: LayerNorm::load(binder, &format!("{lp}.norm1"), text_hidden, PROJECTOR_NORM_EPS)?,
            gate_proj: Linear::load(binder, &format!("{lp}.gate_proj"), text_ffn, text_hidden, false)?,
            dense_h_to_4h: Linear::load(binder, &format!("{lp}.dense_h_to_4h"), text_ffn, text_hidden, false)?,
            dense_4h_to_h: Linear::load(binder, &format!("{lp}.dense_4h_to_h"), text_hidden, text_ffn, false)?,
        };
        let boi = binder.tensor_as(&format!("{PREFIX}.boi"), &[1, 1, text_hidden], &[1, text_hidden])?;
        let eoi = binder.tensor_as(&format!("{PREFIX}.eoi"), &[1, 1, text_hidden], &[1, text_hidden])?;

        Ok(Self {
            config: config.clone(),
            patch_proj,
            cls_embedding,
            position_embedding,
            layers,
            conv,
            projector,
            boi,
            eoi,
        })
    }

    /// Encode planar `[in_channels, image_size, image_size]` pixels into
    /// `[num_image_tokens + 2, text_hidden]` embeddings framed by boi/eoi.
    pub fn forward(&self, pixel_values: &[f32], backend: &B) -> Result<B::Tensor> {
        let config = &self.config;
        let size = config.image_size;
        let expected = config.in_channels * size * size;
        if pixel_values.len() != expected {
            return Err(GlmError::shape_mismatch(
                "pixel_values",
                &[config.in_channels, size, size],
                &[pixel_values.len()],
            ));
        }
        let grid = config.grid_size();
        let h = config.hidden_size;
        let heads = config.num_attention_heads;
        let head_dim = h / heads;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let patches = im2col(pixel_values, config.in_channels, size, config.patch_size);
        let patches = backend.copy_from_host_f32(
            &patches,
            &[grid * grid, config.in_channels * config.patch_size * config.patch_size],
        )?;
        let x = self.patch_proj.forward(&patches, backend)?;
        let x = backend.cat(&[&self.cls_embedding, &x], 0)?;
        let mut x = backend.add(&x, &self.position_embedding)?;

        // Post-norm: the LayerNorms wrap each sub-layer's output.
        for layer in &self.layers {
            let qkv = layer.query_key_value.forward(&x, backend)?;
            let (q, k, v) = backend.split_qkv(&qkv, h, h)?;
            let attn = backend.attention(&q, &k, &v, heads, heads, head_dim, scale, AttentionMask::None)?;
            let attn = layer.dense.forward(&attn, backend)?;
            x = backend.add(&x, &layer.input_layernorm.forward(&attn, backend)?)?;
            let mlp = layer.mlp.forward(&x, backend)?;
            x = backend.add(&x, &layer.post_attention_layernorm.forward(&mlp, backend)?)?;
        }

        let x = backend.slice_rows(&x, 1, grid * grid)?;
        let x = backend.copy_to_host_f32(&x)?;
        let cells = downsample_cells(&x, grid, h);
        let cells = backend.copy_from_host_f32(&cells, &[(grid / 2) * (grid / 2), 4 * h])?;
        let x = self.conv.forward(&cells, backend)?;

        let p = &self.projector;
        let x = p.linear_proj.forward(&x, backend)?;
        let x = backend.gelu(&p.norm1.forward(&x, backend)?)?;
        let gate = p.gate_proj.forward(&x, backend)?;
        let up = p.dense_h_to_4h.forward(&x, backend)?;
        let x = p.dense_4h_to_h.forward(&backend.fused_silu_mul(&gate, &up)?, backend)?;

        let x = backend.cat(&[&self.boi, &x, &self.eoi], 0)?;
        backend.mul_scalar(&x, 1.0 / config.scaling_factor)
    }
}

/// Unfold non-overlapping `patch x patch` tiles of a planar image into rows
/// ordered `(channel, dy, dx)`, one row per tile in raster order.
fn im2col(pixels: &[f32], channels: usize, size: usize, patch: usize) -> Vec<f32> {
    let grid = size / patch;
    let mut out = Vec::with_capacity(channels * size * size);
    for gy in 0..grid {
        for gx in 0..grid {
            for c in 0..channels {
                for dy in 0..patch {
                    let row = c * size * size + (gy * patch + dy) * size + gx * patch;
                    out.extend_from_slice(&pixels[row..row + patch]);
                }
            }
        }
    }
    out
}

/// Gather each 2x2 cell of a `[grid * grid, dim]` feature map into one row
/// ordered `(channel, dy, dx)`.
fn downsample_cells(x: &[f32], grid: usize, dim: usize) -> Vec<f32> {
    let half = grid / 2;
    let mut out = Vec::with_capacity(x.len());
    for cy in 0..half {
        for cx in 0..half {
            for c in 0..dim {
                for dy in 0..2 {
                    for dx in 0..2 {
                        let cell = (2 * cy + dy) * grid + 2 * cx + dx;
                        out.push(x[cell * dim + c]);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn im2col_orders_tiles_then_channels() {
        // 1 channel, 4x4 image, 2x2 patches.
        let pixels: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let cols = im2col(&pixels, 1, 4, 2);
        assert_eq!(&cols[..4], &[0.0, 1.0, 4.0, 5.0]);
        assert_eq!(&cols[4..8], &[2.0, 3.0, 6.0, 7.0]);
        assert_eq!(&cols[12..], &[10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn downsample_groups_channel_major() {
        // 2x2 grid of 2-channel features collapses to one cell.
        let x = vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0, 3.0, 13.0];
        let cells = downsample_cells(&x, 2, 2);
        assert_eq!(cells, vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn preprocess_normalizes_planes() {
        let image = Image::new(2, 2, vec![255; 12]).unwrap();
        let out = preprocess_image(&image, 2).unwrap();
        assert_eq!(out.len(), 12);
        for c in 0..3 {
            let expected = (1.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
            for v in &out[c * 4..(c + 1) * 4] {
                assert!((v - expected).abs() < 1e-4);
            }
        }
    }
}
