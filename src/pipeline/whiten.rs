//! ZCA whitening across channels.

use super::Recording;

const MAX_SWEEPS: usize = 100;

/// Symmetric eigen-decomposition by cyclic Jacobi rotations.
/// Returns (eigenvalues, eigenvectors as columns of a row-major m x m matrix).
fn jacobi_eigen(mut a: Vec<f64>, m: usize) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0; m * m];
    for i in 0..m {
        v[i * m + i] = 1.0;
    }

    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..m)
            .flat_map(|i| (0..m).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i * m + j].powi(2))
            .sum();
        let scale: f64 = (0..m).map(|i| a[i * m + i].powi(2)).sum::<f64>().max(f64::MIN_POSITIVE);
        if off <= 1e-24 * scale {
            break;
        }

        for p in 0..m {
            for q in (p + 1)..m {
                let apq = a[p * m + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * m + q] - a[p * m + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..m {
                    let akp = a[k * m + p];
                    let akq = a[k * m + q];
                    a[k * m + p] = c * akp - s * akq;
                    a[k * m + q] = s * akp + c * akq;
                }
                for k in 0..m {
                    let apk = a[p * m + k];
                    let aqk = a[q * m + k];
                    a[p * m + k] = c * apk - s * aqk;
                    a[q * m + k] = s * apk + c * aqk;
                }
                for k in 0..m {
                    let vkp = v[k * m + p];
                    let vkq = v[k * m + q];
                    v[k * m + p] = c * vkp - s * vkq;
                    v[k * m + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eig = (0..m).map(|i| a[i * m + i]).collect();
    (eig, v)
}

/// Whitening matrix W = V diag(1/sqrt(l + eps)) V^T for covariance `cov`.
fn whitening_matrix(cov: Vec<f64>, m: usize) -> Vec<f64> {
    let trace: f64 = (0..m).map(|i| cov[i * m + i]).sum();
    let eps = 1e-10 * (trace / m as f64) + 1e-20;
    let (eig, v) = jacobi_eigen(cov, m);

    let mut w = vec![0.0; m * m];
    for (k, &l) in eig.iter().enumerate() {
        let d = 1.0 / (l.max(0.0) + eps).sqrt();
        for i in 0..m {
            let vik = v[i * m + k] * d;
            for j in 0..m {
                w[i * m + j] += vik * v[j * m + k];
            }
        }
    }
    w
}

pub fn whiten(rec: &mut Recording) {
    let m = rec.num_channels();
    let n = rec.num_timepoints();
    if m == 0 || n == 0 {
        return;
    }

    let means: Vec<f64> = rec
        .channels
        .iter()
        .map(|ch| ch.iter().map(|&v| v as f64).sum::<f64>() / n as f64)
        .collect();

    let mut cov = vec![0.0; m * m];
    for i in 0..m {
        for j in i..m {
            let s: f64 = rec.channels[i]
                .iter()
                .zip(&rec.channels[j])
                .map(|(&a, &b)| (a as f64 - means[i]) * (b as f64 - means[j]))
                .sum();
            cov[i * m + j] = s / n as f64;
            cov[j * m + i] = s / n as f64;
        }
    }

    let w = whitening_matrix(cov, m);

    let mut column = vec![0.0; m];
    for t in 0..n {
        for (i, c) in column.iter_mut().enumerate() {
            *c = rec.channels[i][t] as f64 - means[i];
        }
        for i in 0..m {
            let y: f64 = (0..m).map(|j| w[i * m + j] * column[j]).sum();
            rec.channels[i][t] = y as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // small deterministic generator so the test data is fixed
    fn noise(seed: &mut u64) -> f64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*seed >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }

    fn covariance(rec: &Recording) -> Vec<f64> {
        let m = rec.num_channels();
        let n = rec.num_timepoints() as f64;
        let mut c = vec![0.0; m * m];
        for i in 0..m {
            for j in 0..m {
                c[i * m + j] = rec.channels[i]
                    .iter()
                    .zip(&rec.channels[j])
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum::<f64>()
                    / n;
            }
        }
        c
    }

    #[test]
    fn output_covariance_is_identity() {
        let mut seed = 7u64;
        let n = 20000;
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        let mut c = Vec::with_capacity(n);
        for _ in 0..n {
            let x = noise(&mut seed);
            let y = noise(&mut seed);
            let z = noise(&mut seed);
            a.push((3.0 * x) as f32);
            b.push((2.0 * x + 0.5 * y) as f32);
            c.push((x - y + 0.1 * z + 4.0) as f32);
        }
        let mut rec = Recording::new(30000.0, vec![a, b, c]);
        whiten(&mut rec);

        let cov = covariance(&rec);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (cov[i * 3 + j] - expected).abs() < 1e-3,
                    "cov[{i}][{j}] = {}",
                    cov[i * 3 + j]
                );
            }
        }
    }

    #[test]
    fn jacobi_diagonalises_symmetric_matrix() {
        let a = vec![4.0, 1.0, 1.0, 3.0];
        let (mut eig, _) = jacobi_eigen(a, 2);
        eig.sort_by(|x, y| x.total_cmp(y));
        let disc = 5.0f64.sqrt();
        assert!((eig[0] - (7.0 - disc) / 2.0).abs() < 1e-9);
        assert!((eig[1] - (7.0 + disc) / 2.0).abs() < 1e-9);
    }
}
