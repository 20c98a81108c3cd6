//! Token batching for the gated forward and classifier training.

use std::path::Path;

use candle_core::{Device, Result, Tensor};

use crate::error::GatingError;

/// Convert flat token buffers into `(batch_size, seq_len)` tensors.
pub fn batch_to_tensors(
    input_ids: &[u32],
    labels: &[u32],
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let input = Tensor::from_vec(input_ids.to_vec(), (batch_size, seq_len), device)?;
    let labels = Tensor::from_vec(labels.to_vec(), (batch_size, seq_len), device)?;
    Ok((input, labels))
}

/// Split a token sequence into next-token `(inputs, labels)` pairs of
/// exactly `seq_len` tokens. Trailing tokens that do not fill a window are
/// dropped.
pub fn shift_for_next_token(tokens: &[u32], seq_len: usize) -> Vec<(Vec<u32>, Vec<u32>)> {
    if seq_len == 0 || tokens.len() < seq_len + 1 {
        return Vec::new();
    }
    tokens
        .windows(seq_len + 1)
        .step_by(seq_len)
        .map(|w| (w[..seq_len].to_vec(), w[1..].to_vec()))
        .collect()
}

/// Read whitespace-separated token ids, one sequence per non-empty line.
pub fn parse_token_lines(path: &Path) -> std::result::Result<Vec<Vec<u32>>, GatingError> {
    let text = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ids = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>().map_err(|e| {
                    GatingError::InvalidConfig(format!(
                        "{}:{}: bad token id {s:?}: {e}",
                        path.display(),
                        lineno + 1
                    ))
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.push(ids);
    }
    Ok(out)
}
