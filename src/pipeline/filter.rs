//! Zero-phase band-pass: second-order high-pass at `freq_min` then low-pass
//! at `freq_max`, run forward and backward.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use super::Recording;

#[derive(Clone, Copy, Debug)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn highpass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 + cos) / 2.0 / a0,
            b1: -(1.0 + cos) / a0,
            b2: (1.0 + cos) / 2.0 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn lowpass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 - cos) / 2.0 / a0,
            b1: (1.0 - cos) / a0,
            b2: (1.0 - cos) / 2.0 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    // transposed direct form II
    fn run(&self, x: &mut [f64]) {
        let (mut z1, mut z2) = (0.0, 0.0);
        for v in x.iter_mut() {
            let input = *v;
            let y = self.b0 * input + z1;
            z1 = self.b1 * input - self.a1 * y + z2;
            z2 = self.b2 * input - self.a2 * y;
            *v = y;
        }
    }
}

fn filtfilt(sections: &[Biquad], x: &mut [f64]) {
    for s in sections {
        s.run(x);
    }
    x.reverse();
    for s in sections {
        s.run(x);
    }
    x.reverse();
}

/// Band-pass every channel in place. Callers skip this stage when either
/// bound is 0.
pub fn bandpass(rec: &mut Recording, freq_min: f64, freq_max: f64) {
    let sections = [
        Biquad::highpass(freq_min, rec.sample_rate),
        Biquad::lowpass(freq_max, rec.sample_rate),
    ];
    for ch in rec.channels.iter_mut() {
        let mut buf: Vec<f64> = ch.iter().map(|&v| v as f64).collect();
        filtfilt(&sections, &mut buf);
        for (dst, src) in ch.iter_mut().zip(buf) {
            *dst = src as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sr: f64, n: usize, amp: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (amp * (2.0 * PI * freq * i as f64 / sr).sin()) as f32)
            .collect()
    }

    fn rms(x: &[f32]) -> f64 {
        (x.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn removes_dc_offset() {
        let mut rec = Recording::new(30000.0, vec![vec![5.0; 30000]]);
        bandpass(&mut rec, 300.0, 6000.0);
        let mid = &rec.channels[0][10000..20000];
        assert!(mid.iter().all(|v| v.abs() < 1e-3), "dc leaked: {:?}", &mid[..4]);
    }

    #[test]
    fn keeps_in_band_and_attenuates_out_of_band() {
        let sr = 30000.0;
        let mut rec = Recording::new(
            sr,
            vec![sine(1000.0, sr, 30000, 1.0), sine(20.0, sr, 30000, 1.0)],
        );
        bandpass(&mut rec, 300.0, 6000.0);

        let in_band = rms(&rec.channels[0][5000..25000]);
        let low = rms(&rec.channels[1][5000..25000]);
        assert!((in_band - FRAC_1_SQRT_2).abs() < 0.05, "in-band rms {in_band}");
        assert!(low < 0.01, "20 Hz rms {low}");
    }

    #[test]
    fn deterministic() {
        let sr = 20000.0;
        let data = sine(700.0, sr, 4000, 3.0);
        let mut a = Recording::new(sr, vec![data.clone()]);
        let mut b = Recording::new(sr, vec![data]);
        bandpass(&mut a, 300.0, 6000.0);
        bandpass(&mut b, 300.0, 6000.0);
        assert_eq!(a, b);
    }
}
