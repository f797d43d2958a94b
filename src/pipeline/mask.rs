//! In-process artifact masking: zero out chunks whose energy is an outlier.

use tracing::debug;

use super::Recording;

pub const CHUNK_SIZE: usize = 2000;
pub const THRESHOLD: f64 = 6.0;

/// Returns the number of chunks zeroed (neighbours included).
pub fn mask_out_artifacts(rec: &mut Recording) -> usize {
    let n = rec.num_timepoints();
    let num_chunks = n / CHUNK_SIZE;
    if num_chunks < 2 {
        return 0;
    }

    let norms: Vec<f64> = (0..num_chunks)
        .map(|c| {
            let range = c * CHUNK_SIZE..(c + 1) * CHUNK_SIZE;
            rec.channels
                .iter()
                .map(|ch| ch[range.clone()].iter().map(|&v| (v as f64).powi(2)).sum::<f64>())
                .sum::<f64>()
                .sqrt()
        })
        .collect();

    let mean = norms.iter().sum::<f64>() / num_chunks as f64;
    let var = norms.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / num_chunks as f64;
    let cutoff = mean + THRESHOLD * var.sqrt();

    let mut zero = vec![false; num_chunks];
    for (c, &norm) in norms.iter().enumerate() {
        if norm > cutoff {
            zero[c] = true;
            if c > 0 {
                zero[c - 1] = true;
            }
            if c + 1 < num_chunks {
                zero[c + 1] = true;
            }
        }
    }

    let mut masked = 0;
    for (c, _) in zero.iter().enumerate().filter(|(_, z)| **z) {
        for ch in rec.channels.iter_mut() {
            ch[c * CHUNK_SIZE..(c + 1) * CHUNK_SIZE].fill(0.0);
        }
        masked += 1;
    }
    debug!(masked, num_chunks, "artifact masking done");
    masked
}
