//! Linear algebra modulo `2^64`. Native wraparound on `u64` is the modular
//! reduction, so every product and sum goes through the `wrapping_*` ops.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Hard cap on the magnitude of one error sample. Recovery needs the
/// accumulated noise of a whole column, `m * (p/2) * NOISE_BOUND`, to stay
/// under half a scaling slot.
pub const NOISE_BOUND: i64 = 8;

pub fn dot(u: ArrayView1<u64>, v: ArrayView1<u64>) -> u64 {
    u.iter()
        .zip(v.iter())
        .fold(0u64, |acc, (&a, &b)| acc.wrapping_add(a.wrapping_mul(b)))
}

pub fn vec_sum(v: ArrayView1<u64>) -> u64 {
    v.iter().fold(0u64, |acc, &x| acc.wrapping_add(x))
}

/// `m · v` with rows farmed out to the rayon pool.
pub fn matvec(m: ArrayView2<u64>, v: ArrayView1<u64>) -> Array1<u64> {
    assert_eq!(m.ncols(), v.len(), "matvec dimension mismatch");
    let out: Vec<u64> = m
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| dot(row, v))
        .collect();
    Array1::from_vec(out)
}

/// `a · b`, accumulated in ikj order so the inner loop walks both `b` and
/// the output row contiguously.
pub fn matmul(a: ArrayView2<u64>, b: ArrayView2<u64>) -> Array2<u64> {
    assert_eq!(a.ncols(), b.nrows(), "matmul dimension mismatch");
    let mut out: Array2<u64> = Array2::zeros((a.nrows(), b.ncols()));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut out_row)| {
            for (k, &aik) in a.row(i).iter().enumerate() {
                if aik == 0 {
                    continue;
                }
                for (o, &bkj) in out_row.iter_mut().zip(b.row(k).iter()) {
                    *o = o.wrapping_add(aik.wrapping_mul(bkj));
                }
            }
        });
    out
}

pub fn sample_uniform_vec<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Array1<u64> {
    Array1::from_iter((0..len).map(|_| rng.gen::<u64>()))
}

pub fn sample_uniform_matrix<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Array2<u64> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen::<u64>())
}

/// One centred discrete Gaussian draw, rejection-sampled into
/// `[-NOISE_BOUND, NOISE_BOUND]`.
pub fn sample_noise<R: Rng + ?Sized>(std_dev: f64, rng: &mut R) -> i64 {
    let normal = Normal::new(0.0, std_dev).expect("std_dev is finite and positive");
    loop {
        let e = normal.sample(rng).round() as i64;
        if e.abs() <= NOISE_BOUND {
            return e;
        }
    }
}
