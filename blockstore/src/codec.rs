//! Block payload codec.
//!
//! Blocks are stored as `xxtea(snappy(plaintext), key = blake2b128(plaintext))`.
//! Decoding reverses both layers and checks the plaintext against its hash.

use bytes::Bytes;

use crate::{BlockHash, Error};

const DELTA: u32 = 0x9E37_79B9;

/// Decrypts, decompresses and verifies a raw block.
pub fn decode_block(raw: &[u8], hash: &BlockHash) -> Result<Bytes, Error> {
    let compressed = xxtea_decrypt(raw, hash.as_slice())?;
    let plaintext = snap::raw::Decoder::new().decompress_vec(&compressed)?;

    let actual = BlockHash::of(&plaintext);
    if &actual != hash {
        return Err(Error::Integrity {
            expected: *hash,
            actual,
        });
    }

    Ok(plaintext.into())
}

/// Produces the stored form of a plaintext block, along with its hash.
pub fn encode_block(plaintext: &[u8]) -> Result<(BlockHash, Bytes), Error> {
    let hash = BlockHash::of(plaintext);
    let compressed = snap::raw::Encoder::new().compress_vec(plaintext)?;
    Ok((hash, xxtea_encrypt(&compressed, hash.as_slice()).into()))
}

fn to_words(data: &[u8], include_length: bool) -> Vec<u32> {
    let n = data.len().div_ceil(4);
    let mut v = vec![0u32; if include_length { n + 1 } else { n }];
    for (i, b) in data.iter().enumerate() {
        v[i >> 2] |= (*b as u32) << ((i & 3) << 3);
    }
    if include_length {
        v[n] = data.len() as u32;
    }
    v
}

fn to_bytes(v: &[u32], include_length: bool) -> Option<Vec<u8>> {
    let mut n = v.len() * 4;
    if include_length {
        let m = *v.last()? as usize;
        n -= 4;
        if n < 3 || m < n - 3 || m > n {
            return None;
        }
        n = m;
    }
    Some((0..n).map(|i| (v[i >> 2] >> ((i & 3) << 3)) as u8).collect())
}

fn key_words(key: &[u8]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, w) in to_words(key, false).into_iter().take(4).enumerate() {
        k[i] = w;
    }
    k
}

#[inline]
fn mx(sum: u32, y: u32, z: u32, p: usize, e: u32, k: &[u32; 4]) -> u32 {
    ((z >> 5 ^ y << 2).wrapping_add(y >> 3 ^ z << 4))
        ^ ((sum ^ y).wrapping_add(k[(p & 3) ^ e as usize] ^ z))
}

fn xxtea_encrypt(data: &[u8], key: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut v = to_words(data, true);
    let k = key_words(key);
    let n = v.len() - 1;

    let mut z = v[n];
    let mut sum: u32 = 0;
    let mut q = 6 + 52 / v.len();
    while q > 0 {
        sum = sum.wrapping_add(DELTA);
        let e = (sum >> 2) & 3;
        let mut p = 0;
        while p < n {
            let y = v[p + 1];
            v[p] = v[p].wrapping_add(mx(sum, y, z, p, e, &k));
            z = v[p];
            p += 1;
        }
        let y = v[0];
        v[n] = v[n].wrapping_add(mx(sum, y, z, p, e, &k));
        z = v[n];
        q -= 1;
    }

    // the length word is already part of v, nothing to strip
    to_bytes(&v, false).unwrap_or_default()
}

fn xxtea_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
    if data.is_empty() {
        return Err(Error::Decode("empty block".into()));
    }
    let mut v = to_words(data, false);
    let k = key_words(key);
    let n = v.len() - 1;

    let mut y = v[0];
    let q = 6 + 52 / v.len() as u32;
    let mut sum = q.wrapping_mul(DELTA);
    while sum != 0 {
        let e = (sum >> 2) & 3;
        let mut p = n;
        while p > 0 {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(mx(sum, y, z, p, e, &k));
            y = v[p];
            p -= 1;
        }
        let z = v[n];
        v[0] = v[0].wrapping_sub(mx(sum, y, z, p, e, &k));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
    }

    to_bytes(&v, true).ok_or_else(|| Error::Decode("invalid xxtea payload length".into()))
}
