//! Murmur3 partitioner tokens

use std::fmt;

/// Position on the token ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);

    /// Token of a serialized partition key
    pub fn of(partition_key: &[u8]) -> Self {
        Token(murmur3_token(partition_key))
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Parse the decimal form stored in `system.local` / `system.peers`
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i64>().ok().map(Token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Token {
    fn from(v: i64) -> Self {
        Token(v)
    }
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

#[inline]
fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[inline]
fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

#[inline]
fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
}

/// Tail bytes are sign extended before mixing
#[inline]
fn signed(b: u8) -> u64 {
    b as i8 as i64 as u64
}

/// First half of the x64 128-bit Murmur3 hash (seed 0) with the tail quirk
/// of the Cassandra partitioner; `i64::MIN` is folded into `i64::MAX`
pub fn murmur3_token(data: &[u8]) -> i64 {
    let len = data.len();
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&block[..8]);
        hi.copy_from_slice(&block[8..]);
        let k1 = u64::from_le_bytes(lo);
        let k2 = u64::from_le_bytes(hi);

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(27).wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = h2.rotate_left(31).wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    if tail.len() > 8 {
        let mut k2 = 0u64;
        for (i, b) in tail[8..].iter().enumerate() {
            k2 ^= signed(*b) << (i * 8);
        }
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        let mut k1 = 0u64;
        for (i, b) in tail.iter().take(8).enumerate() {
            k1 ^= signed(*b) << (i * 8);
        }
        h1 ^= mix_k1(k1);
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);

    match h1 as i64 {
        i64::MIN => i64::MAX,
        token => token,
    }
}
