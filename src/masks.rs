//! Attention mask and position id utilities for bidirectional encoders
//!
//! Encoders attend in both directions, so the only mask needed is the
//! padding mask. Position ids are computed once from the unmasked input and
//! reused for every perturbed query, so replacing a token with the mask
//! token never shifts the positions of its neighbours.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Expand a `[batch, seq]` 0/1 attention mask into an additive mask
///
/// # Returns
///
/// A tensor of shape `[batch, 1, 1, seq]` where:
/// - `0.0` for positions that can be attended
/// - `-inf` for padding positions
pub fn create_attention_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let keep: Vec<f32> = attention_mask
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    let additive: Vec<f32> = keep
        .iter()
        .map(|&m| if m > 0.5 { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    Ok(
        Tensor::from_vec(additive, (batch, 1, 1, seq_len), attention_mask.device())?
            .to_dtype(dtype)?,
    )
}

/// RoBERTa-style position ids
///
/// Non-padding tokens are numbered `padding_idx + 1, padding_idx + 2, ...`;
/// padding tokens get `padding_idx`.
pub fn roberta_position_ids(input_ids: &[u32], padding_idx: u32) -> Vec<u32> {
    let mut count = 0;
    input_ids
        .iter()
        .map(|&id| {
            if id == padding_idx {
                padding_idx
            } else {
                count += 1;
                padding_idx + count
            }
        })
        .collect()
}

/// Absolute position ids `0..seq_len` as used by BERT
pub fn absolute_position_ids(seq_len: usize) -> Vec<u32> {
    (0..seq_len as u32).collect()
}

/// Build a `[1, seq]` position id tensor
pub fn create_position_ids(
    input_ids: &[u32],
    padding_idx: Option<u32>,
    device: &Device,
) -> Result<Tensor> {
    let positions = match padding_idx {
        Some(pad) => roberta_position_ids(input_ids, pad),
        None => absolute_position_ids(input_ids.len()),
    };
    Ok(Tensor::new(&positions[..], device)?.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_mask_shape_and_values() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let additive = create_attention_mask(&mask, DType::F32).unwrap();
        assert_eq!(additive.dims(), &[1, 1, 1, 3]);

        let values: Vec<f32> = additive.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 0.0);
        assert!(values[2].is_infinite() && values[2] < 0.0);
    }

    #[test]
    fn test_roberta_position_ids() {
        // padding_idx = 1
        let ids = [0, 31414, 232, 2, 1, 1];
        assert_eq!(roberta_position_ids(&ids, 1), vec![2, 3, 4, 5, 1, 1]);
    }

    #[test]
    fn test_positions_unchanged_by_mask_token() {
        let full = [0, 10, 11, 2];
        let masked = [0, 50264, 50264, 2];
        assert_eq!(roberta_position_ids(&full, 1), roberta_position_ids(&masked, 1));
    }

    #[test]
    fn test_position_tensor() {
        let device = Device::Cpu;
        let t = create_position_ids(&[5, 6, 7], None, &device).unwrap();
        assert_eq!(t.dims(), &[1, 3]);
        let v: Vec<u32> = t.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![0, 1, 2]);
    }
}
