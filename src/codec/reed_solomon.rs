//! Reed-Solomon codec over GF(2^8) with four parity symbols per chunk.
//!
//! Protects the length and hash fields of the block header: each chunk
//! carries up to [`CHUNK_DATA_LEN`] data bytes followed by [`N_SYM`]
//! parity bytes and survives up to two corrupted bytes.

use std::sync::LazyLock;

use thiserror::Error;

/// Parity symbols per chunk.
pub const N_SYM: usize = 4;
/// Data bytes per full chunk.
pub const CHUNK_DATA_LEN: usize = 4;
/// Total bytes per full chunk.
pub const CHUNK_LEN: usize = CHUNK_DATA_LEN + N_SYM;

/// GF(2^8) reduction polynomial x^8 + x^4 + x^3 + x^2 + 1.
const FIELD_POLY: u16 = 0x11d;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RsError {
    /// A chunk is shorter than the parity region plus one data byte.
    #[error("chunk of {len} bytes is too short to decode")]
    ChunkTooShort { len: usize },
    /// The error locator degree exceeds the correction capacity.
    #[error("too many errors to correct")]
    TooManyErrors,
    /// The locator roots do not match the located error count.
    #[error("could not find error positions")]
    CouldNotFindErrors,
    /// Correction produced a word that still fails the syndrome check.
    #[error("could not correct errors")]
    CouldNotCorrect,
}

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

// exp is doubled so products of two log values index without a modulo.
static TABLES: LazyLock<Tables> = LazyLock::new(|| {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= FIELD_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    Tables { exp, log }
});

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert_ne!(b, 0);
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[(t.log[a as usize] as usize + 255 - t.log[b as usize] as usize) % 255]
}

fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0);
    let t = &*TABLES;
    t.exp[255 - t.log[a as usize] as usize]
}

/// alpha^power for the generator element alpha = 2.
fn gf_alpha_pow(power: usize) -> u8 {
    TABLES.exp[power % 255]
}

/// Evaluate a polynomial (highest-degree coefficient first) at `x`.
fn poly_eval(poly: &[u8], x: u8) -> u8 {
    let mut y = poly[0];
    for &coef in &poly[1..] {
        y = gf_mul(y, x) ^ coef;
    }
    y
}

fn poly_scale(poly: &[u8], scalar: u8) -> Vec<u8> {
    poly.iter().map(|&c| gf_mul(c, scalar)).collect()
}

/// Add (xor) two polynomials, aligning their low-order ends.
fn poly_add(p: &[u8], q: &[u8]) -> Vec<u8> {
    let len = p.len().max(q.len());
    let mut out = vec![0u8; len];
    out[len - p.len()..].copy_from_slice(p);
    for (i, &coef) in q.iter().enumerate() {
        out[len - q.len() + i] ^= coef;
    }
    out
}

fn poly_mul(p: &[u8], q: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; p.len() + q.len() - 1];
    for (i, &a) in p.iter().enumerate() {
        for (j, &b) in q.iter().enumerate() {
            out[i + j] ^= gf_mul(a, b);
        }
    }
    out
}

/// Generator polynomial prod_{i=0..N_SYM-1} (x - alpha^i).
fn generator_poly() -> Vec<u8> {
    let mut gen_poly = vec![1u8];
    for i in 0..N_SYM {
        gen_poly = poly_mul(&gen_poly, &[1, gf_alpha_pow(i)]);
    }
    gen_poly
}

/// Systematically encode one chunk: the data bytes followed by the
/// remainder of `data * x^N_SYM` modulo the generator polynomial.
fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    let gen_poly = generator_poly();
    let mut msg = vec![0u8; data.len() + N_SYM];
    msg[..data.len()].copy_from_slice(data);
    for i in 0..data.len() {
        let coef = msg[i];
        if coef != 0 {
            for (j, &g) in gen_poly.iter().enumerate().skip(1) {
                msg[i + j] ^= gf_mul(g, coef);
            }
        }
    }
    out.extend_from_slice(data);
    out.extend_from_slice(&msg[data.len()..]);
}

/// Encode arbitrary-length input, [`CHUNK_DATA_LEN`] data bytes per chunk
/// (the final chunk may carry fewer). Output length is input length plus
/// [`N_SYM`] per chunk.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(input.len() + input.len().div_ceil(CHUNK_DATA_LEN) * N_SYM);
    for chunk in input.chunks(CHUNK_DATA_LEN) {
        encode_chunk(chunk, &mut out);
    }
    out
}

fn syndromes(chunk: &[u8]) -> [u8; N_SYM] {
    let mut syn = [0u8; N_SYM];
    for (i, s) in syn.iter_mut().enumerate() {
        *s = poly_eval(chunk, gf_alpha_pow(i));
    }
    syn
}

/// Berlekamp-Massey: find the error locator polynomial
/// (highest-degree coefficient first).
fn error_locator(syn: &[u8; N_SYM]) -> Result<Vec<u8>, RsError> {
    let mut err_loc = vec![1u8];
    let mut old_loc = vec![1u8];

    for i in 0..N_SYM {
        let mut delta = syn[i];
        for j in 1..err_loc.len() {
            delta ^= gf_mul(err_loc[err_loc.len() - 1 - j], syn[i - j]);
        }
        old_loc.push(0);
        if delta != 0 {
            if old_loc.len() > err_loc.len() {
                let new_loc = poly_scale(&old_loc, delta);
                old_loc = poly_scale(&err_loc, gf_inv(delta));
                err_loc = new_loc;
            }
            err_loc = poly_add(&err_loc, &poly_scale(&old_loc, delta));
        }
    }

    while err_loc.first() == Some(&0) {
        err_loc.remove(0);
    }
    if (err_loc.len() - 1) * 2 > N_SYM {
        return Err(RsError::TooManyErrors);
    }
    Ok(err_loc)
}

/// Chien search: byte positions (from the chunk start) whose locator root
/// matches. Fails if the count disagrees with the locator degree.
fn error_positions(err_loc: &[u8], chunk_len: usize) -> Result<Vec<usize>, RsError> {
    let errs = err_loc.len() - 1;
    let reversed: Vec<u8> = err_loc.iter().rev().copied().collect();
    let mut positions = Vec::with_capacity(errs);
    for i in 0..chunk_len {
        if poly_eval(&reversed, gf_alpha_pow(i)) == 0 {
            positions.push(chunk_len - 1 - i);
        }
    }
    if positions.len() != errs {
        return Err(RsError::CouldNotFindErrors);
    }
    Ok(positions)
}

/// Forney's formula: correct the chunk in place at the given positions.
fn correct_errata(
    chunk: &mut [u8],
    syn: &[u8; N_SYM],
    positions: &[usize],
) -> Result<(), RsError> {
    let coef_pos: Vec<usize> = positions.iter().map(|&p| chunk.len() - 1 - p).collect();

    let mut errata_loc = vec![1u8];
    for &cp in &coef_pos {
        errata_loc = poly_mul(&errata_loc, &poly_add(&[1], &[gf_alpha_pow(cp), 0]));
    }

    // Error evaluator: (reversed syndromes * errata locator) mod x^(errs+1).
    let syn_rev: Vec<u8> = syn.iter().rev().copied().collect();
    let product = poly_mul(&syn_rev, &errata_loc);
    let err_eval = &product[product.len() - errata_loc.len()..];

    let locations: Vec<u8> = coef_pos.iter().map(|&cp| gf_alpha_pow(cp)).collect();
    for (i, &xi) in locations.iter().enumerate() {
        let xi_inv = gf_inv(xi);
        let mut loc_prime = 1u8;
        for (j, &xj) in locations.iter().enumerate() {
            if j != i {
                loc_prime = gf_mul(loc_prime, 1 ^ gf_mul(xi_inv, xj));
            }
        }
        if loc_prime == 0 {
            return Err(RsError::CouldNotCorrect);
        }
        let magnitude = gf_div(poly_eval(err_eval, xi_inv), loc_prime);
        chunk[positions[i]] ^= magnitude;
    }
    Ok(())
}

fn decode_chunk(chunk: &mut [u8]) -> Result<(), RsError> {
    if chunk.len() <= N_SYM {
        return Err(RsError::ChunkTooShort { len: chunk.len() });
    }
    let syn = syndromes(chunk);
    if syn.iter().all(|&s| s == 0) {
        return Ok(());
    }
    let err_loc = error_locator(&syn)?;
    let positions = error_positions(&err_loc, chunk.len())?;
    correct_errata(chunk, &syn, &positions)?;
    if syndromes(chunk).iter().any(|&s| s != 0) {
        return Err(RsError::CouldNotCorrect);
    }
    Ok(())
}

/// Decode a stream produced by [`encode`], correcting up to two byte
/// errors per chunk. Returns the corrected codeword (data and parity).
pub fn decode(input: &[u8]) -> Result<Vec<u8>, RsError> {
    let mut out = input.to_vec();
    for chunk in out.chunks_mut(CHUNK_LEN) {
        decode_chunk(chunk)?;
    }
    Ok(out)
}

/// Strip the parity bytes from a corrected codeword.
pub fn data_of(codeword: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(codeword.len());
    for chunk in codeword.chunks(CHUNK_LEN) {
        out.extend_from_slice(&chunk[..chunk.len() - N_SYM]);
    }
    out
}
