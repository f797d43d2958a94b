//! Event detection, per-channel clustering and optional curation.
//!
//! Channels are scanned on scoped threads; each thread owns a contiguous
//! block of channels and the blocks are concatenated in channel order, so
//! the result does not depend on how many threads ran.

use std::collections::BTreeMap;
use std::thread;
use tracing::debug;

use super::{Event, Firings, Recording};
use crate::config::PipelineConfig;

/// MAD to standard deviation for gaussian noise.
const MAD_SCALE: f64 = 0.6745;
/// Events under this multiple of the detection threshold count as noise-like.
const NOISE_LIKE_FACTOR: f64 = 2.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DetectParams {
    pub detect_sign: i8,
    pub adjacency_radius: f64,
    pub clip_size: usize,
    pub detect_threshold: f64,
    pub detect_interval: usize,
    pub noise_overlap_threshold: Option<f64>,
}

impl From<&PipelineConfig> for DetectParams {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            detect_sign: cfg.detect_sign,
            adjacency_radius: cfg.adjacency_radius,
            clip_size: cfg.clip_size as usize,
            detect_threshold: cfg.detect_threshold,
            detect_interval: cfg.detect_interval as usize,
            noise_overlap_threshold: cfg.noise_overlap_threshold,
        }
    }
}

fn neighborhoods(geometry: &[[f64; 2]], radius: f64) -> Vec<Vec<usize>> {
    let m = geometry.len();
    (0..m)
        .map(|i| {
            (0..m)
                .filter(|&j| {
                    if radius < 0.0 {
                        return true;
                    }
                    let dx = geometry[i][0] - geometry[j][0];
                    let dy = geometry[i][1] - geometry[j][1];
                    (dx * dx + dy * dy).sqrt() <= radius
                })
                .collect()
        })
        .collect()
}

/// Polarity-adjusted amplitude in units of the channel's noise level.
fn normalized(ch: &[f32], sign: i8) -> Vec<f32> {
    if ch.is_empty() {
        return Vec::new();
    }
    let mut abs: Vec<f32> = ch.iter().map(|v| v.abs()).collect();
    let mid = abs.len() / 2;
    let (_, median, _) = abs.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let sigma = *median as f64 / MAD_SCALE;
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![0.0; ch.len()];
    }
    ch.iter()
        .map(|&v| {
            let v = v as f64 / sigma;
            (match sign {
                s if s < 0 => -v,
                s if s > 0 => v,
                _ => v.abs(),
            }) as f32
        })
        .collect()
}

// Ordering used to pick one winner per window: larger amplitude first,
// then earlier time, then lower channel.
fn beats(a: (f32, usize, usize), b: (f32, usize, usize)) -> bool {
    match a.0.total_cmp(&b.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => (a.1, a.2) < (b.1, b.2),
    }
}

fn detect_channel(
    m: usize,
    amps: &[Vec<f32>],
    neighbors: &[usize],
    p: &DetectParams,
) -> Vec<(usize, f32)> {
    let n = amps[m].len();
    let half = p.clip_size / 2;
    let threshold = p.detect_threshold as f32;
    let mut out = Vec::new();

    if n < p.clip_size {
        return out;
    }
    // clip window [t - half, t - half + clip_size) must lie inside the data
    let last = n - (p.clip_size - half);

    for t in half..=last {
        let a = amps[m][t];
        if a < threshold {
            continue;
        }
        let lo = t.saturating_sub(p.detect_interval);
        let hi = (t + p.detect_interval).min(n - 1);
        let wins = neighbors.iter().all(|&nb| {
            (lo..=hi).all(|t2| (nb == m && t2 == t) || beats((a, t, m), (amps[nb][t2], t2, nb)))
        });
        if wins {
            out.push((t, a));
        }
    }
    out
}

/// Detect and label events. `threads` only changes speed, never the output.
pub fn sort(rec: &Recording, p: &DetectParams, threads: usize) -> Firings {
    let m = rec.num_channels();
    if m == 0 {
        return Firings::default();
    }
    let amps: Vec<Vec<f32>> = rec
        .channels
        .iter()
        .map(|ch| normalized(ch, p.detect_sign))
        .collect();
    let neigh = neighborhoods(&rec.geometry, p.adjacency_radius);

    let threads = threads.clamp(1, m);
    let block = m.div_ceil(threads);
    let channel_ids: Vec<usize> = (0..m).collect();

    let per_channel: Vec<Vec<(usize, f32)>> = thread::scope(|s| {
        let handles: Vec<_> = channel_ids
            .chunks(block)
            .map(|ids| {
                let amps = &amps;
                let neigh = &neigh;
                s.spawn(move || {
                    ids.iter()
                        .map(|&ch| detect_channel(ch, amps, &neigh[ch], p))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(v) => v,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });

    let mut detected: Vec<(Event, f32)> = per_channel
        .into_iter()
        .enumerate()
        .flat_map(|(ch, events)| {
            events.into_iter().map(move |(time, amp)| {
                (
                    Event {
                        channel: ch,
                        time,
                        label: ch as u32 + 1,
                    },
                    amp,
                )
            })
        })
        .collect();
    detected.sort_by_key(|(e, _)| (e.time, e.channel));
    debug!(events = detected.len(), channels = m, threads, "detection done");

    if let Some(max_overlap) = p.noise_overlap_threshold {
        let rejected = noisy_clusters(&detected, p.detect_threshold, max_overlap);
        if !rejected.is_empty() {
            debug!(?rejected, "curation rejected clusters");
            detected.retain(|(e, _)| !rejected.contains(&e.label));
        }
    }

    Firings {
        events: detected.into_iter().map(|(e, _)| e).collect(),
    }
}

/// Labels whose share of noise-like events exceeds `max_overlap`.
fn noisy_clusters(events: &[(Event, f32)], detect_threshold: f64, max_overlap: f64) -> Vec<u32> {
    let cutoff = (NOISE_LIKE_FACTOR * detect_threshold) as f32;
    let mut counts: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
    for (e, amp) in events {
        let entry = counts.entry(e.label).or_default();
        entry.0 += 1;
        if *amp < cutoff {
            entry.1 += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, (total, noisy))| *noisy as f64 / *total as f64 > max_overlap)
        .map(|(label, _)| label)
        .collect()
}
