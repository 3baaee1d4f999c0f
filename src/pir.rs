//! SimplePIR: single-server private information retrieval from LWE.
//!
//! The server holds a square `m x m` database of values below the plaintext
//! modulus `p = 2^ell` and publishes a hint `Aᵀ · DB` once. A client encrypts
//! a one-hot row selector under a fresh secret, the server answers with one
//! mat-vec, and the client peels the hint back off to read the row. The
//! ciphertext modulus is fixed to `2^64` so the ring arithmetic is native
//! integer wraparound.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{Error, Result};
use crate::math::{self, NOISE_BOUND};

pub const DEFAULT_SECRET_DIM: usize = 2048;
pub const DEFAULT_PLAIN_BITS: u32 = 17;
pub const DEFAULT_STD_DEV: f64 = 3.2;

const MIN_SECRET_DIM: usize = 512;

/// Public parameters of one PIR instance. Immutable once generated; `a` is
/// a pure function of `seed`, which is what actually crosses the wire.
#[derive(Debug, Clone)]
pub struct Params {
    /// Secret dimension.
    pub n: usize,
    /// Database side length.
    pub m: usize,
    /// Plaintext modulus is `2^ell`; ciphertext modulus is `2^64`.
    pub ell: u32,
    pub std_dev: f64,
    pub seed: u64,
    /// `m x n`, uniform, sampled independently of the database.
    pub a: Array2<u64>,
}

impl Params {
    pub fn plain_mod(&self) -> u64 {
        1u64 << self.ell
    }

    /// Scaling factor `delta = q / p = 2^(64 - ell)`.
    pub fn delta(&self) -> u64 {
        1u64 << (64 - self.ell)
    }
}

/// Deterministically expands the public matrix from its transmission seed.
pub fn expand_a(seed: u64, m: usize, n: usize) -> Array2<u64> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    math::sample_uniform_matrix(m, n, &mut rng)
}

pub fn gen_params<R: Rng + ?Sized>(m: usize, n: usize, ell: u32, rng: &mut R) -> Result<Params> {
    if m == 0 {
        return Err(Error::Config("database side length must be positive".into()));
    }
    if n < MIN_SECRET_DIM {
        return Err(Error::Config(format!(
            "secret dimension {n} below minimum {MIN_SECRET_DIM}"
        )));
    }
    if ell == 0 || ell >= 64 {
        return Err(Error::Config(format!(
            "plaintext modulus 2^{ell} outside (1, 2^64)"
        )));
    }
    let p = 1u64 << ell;
    let delta = 1u64 << (64 - ell);
    // Worst-case column noise: m error samples against recentred entries of
    // magnitude at most p/2.
    let worst = m as u128 * NOISE_BOUND as u128 * (p / 2) as u128;
    if worst >= (delta / 2) as u128 {
        return Err(Error::NoiseOverflow);
    }
    let seed = rng.gen::<u64>();
    let a = expand_a(seed, m, n);
    Ok(Params {
        n,
        m,
        ell,
        std_dev: DEFAULT_STD_DEV,
        seed,
        a,
    })
}

/// Server-side hint `Aᵀ · (DB - ⌊p/2⌋·𝟙)`, shape `n x m`. Recentring the
/// plaintexts to `[-p/2, p/2)` halves the noise the answer picks up and is
/// the offset under which `recover` cancels the `A·s` mass with a single
/// sum over the query ciphertext.
pub fn gen_hint(params: &Params, db: ArrayView2<u64>) -> Array2<u64> {
    let half = params.plain_mod() / 2;
    let shifted = db.mapv(|x| x.wrapping_sub(half));
    math::matmul(params.a.t(), shifted.view())
}

/// Encrypts a one-hot selector for `index` under a fresh secret. Returns
/// `(s, A·s + e + delta·u_index)`.
pub fn query<R: Rng + ?Sized>(
    index: usize,
    params: &Params,
    rng: &mut R,
) -> Result<(Array1<u64>, Array1<u64>)> {
    if index >= params.m {
        return Err(Error::Bounds {
            index,
            len: params.m,
        });
    }
    let secret = math::sample_uniform_vec(params.n, rng);
    let mut cipher = math::matvec(params.a.view(), secret.view());
    for c in cipher.iter_mut() {
        *c = c.wrapping_add(math::sample_noise(params.std_dev, rng) as u64);
    }
    cipher[index] = cipher[index].wrapping_add(params.delta());
    Ok((secret, cipher))
}

/// Server side: `DBᵀ · c_q`, evaluated against the pre-transposed database
/// so the inner loop walks rows.
pub fn answer(db_t: ArrayView2<u64>, query_cipher: ArrayView1<u64>) -> Result<Array1<u64>> {
    if query_cipher.len() != db_t.ncols() {
        return Err(Error::Protocol(format!(
            "query length {} does not match database side {}",
            query_cipher.len(),
            db_t.ncols()
        )));
    }
    Ok(math::matvec(db_t, query_cipher))
}

/// Decrypts one column of the answer. Deterministic; correct whenever the
/// accumulated noise stays under `delta / 2`.
pub fn recover(
    secret: ArrayView1<u64>,
    hint_col: ArrayView1<u64>,
    answer_entry: u64,
    query_cipher: ArrayView1<u64>,
    params: &Params,
) -> u64 {
    let p = params.plain_mod();
    let half = p / 2;
    let delta = params.delta();
    let hint_term = math::dot(secret, hint_col);
    let shift = half.wrapping_mul(math::vec_sum(query_cipher));
    let noised = answer_entry.wrapping_sub(shift).wrapping_sub(hint_term);
    // Nearest rounding: add delta/2 before dropping the low 64 - ell bits.
    let denoised = noised.wrapping_add(delta >> 1) >> (64 - params.ell);
    denoised.wrapping_sub(half) & (p - 1)
}

/// Decrypts the full row, stepping `recover` across the hint columns.
pub fn recover_row(
    secret: ArrayView1<u64>,
    hint: ArrayView2<u64>,
    answer_cipher: ArrayView1<u64>,
    query_cipher: ArrayView1<u64>,
    params: &Params,
) -> Array1<u64> {
    Array1::from_iter((0..hint.ncols()).map(|j| {
        recover(
            secret,
            hint.column(j),
            answer_cipher[j],
            query_cipher,
            params,
        )
    }))
}
