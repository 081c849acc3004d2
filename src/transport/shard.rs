//! Shard discovery and token-to-shard mapping
//!
//! A shard-aware node advertises its sharding parameters in the SUPPORTED
//! response. The shard serving a connection accepted on the shard-aware port
//! is `source_port % nr_shards`, which [`ShardPortIterator`] exploits to
//! target a specific shard.

use std::collections::HashMap;

use rand::Rng;

use crate::cluster::token::Token;
use crate::error::{DriverError, DriverResult};

pub const SCYLLA_SHARD: &str = "SCYLLA_SHARD";
pub const SCYLLA_NR_SHARDS: &str = "SCYLLA_NR_SHARDS";
pub const SCYLLA_MSB_IGNORE: &str = "SCYLLA_MSB_IGNORE";
/// Key used by current server releases for the same value
pub const SCYLLA_SHARDING_IGNORE_MSB: &str = "SCYLLA_SHARDING_IGNORE_MSB";
pub const SCYLLA_SHARD_AWARE_PORT: &str = "SCYLLA_SHARD_AWARE_PORT";

/// Ephemeral port range used for shard-targeted source ports
pub const SOURCE_PORT_MIN: u16 = 49152;
pub const SOURCE_PORT_MAX: u16 = 65535;

/// Sharding parameters reported by one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfo {
    /// Shard that accepted this connection
    pub shard: u32,
    pub nr_shards: u32,
    pub msb_ignore: u8,
    pub shard_aware_port: Option<u16>,
}

fn first<'a>(options: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

fn parse_field<T: std::str::FromStr>(
    options: &HashMap<String, Vec<String>>,
    key: &str,
) -> DriverResult<Option<T>> {
    match first(options, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DriverError::Protocol(format!("invalid {} value '{}'", key, raw))),
    }
}

impl ShardInfo {
    /// Parse the SUPPORTED options; `None` when the node is not shard-aware
    pub fn from_supported(options: &HashMap<String, Vec<String>>) -> DriverResult<Option<Self>> {
        let (shard, nr_shards, msb_ignore) = match (
            parse_field::<u32>(options, SCYLLA_SHARD)?,
            parse_field::<u32>(options, SCYLLA_NR_SHARDS)?,
            match parse_field::<u8>(options, SCYLLA_MSB_IGNORE)? {
                Some(v) => Some(v),
                None => parse_field::<u8>(options, SCYLLA_SHARDING_IGNORE_MSB)?,
            },
        ) {
            (Some(shard), Some(nr_shards), Some(msb_ignore)) => (shard, nr_shards, msb_ignore),
            _ => return Ok(None),
        };
        if nr_shards == 0 || shard >= nr_shards {
            return Err(DriverError::Protocol(format!(
                "shard {} out of range for {} shards",
                shard, nr_shards
            )));
        }
        Ok(Some(Self {
            shard,
            nr_shards,
            msb_ignore,
            shard_aware_port: parse_field::<u16>(options, SCYLLA_SHARD_AWARE_PORT)?,
        }))
    }

    pub fn sharder(&self) -> Sharder {
        Sharder::new(self.nr_shards, self.msb_ignore)
    }
}

/// Maps tokens and source ports to shards of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharder {
    nr_shards: u32,
    msb_ignore: u8,
}

impl Sharder {
    pub fn new(nr_shards: u32, msb_ignore: u8) -> Self {
        Self {
            nr_shards: nr_shards.max(1),
            msb_ignore,
        }
    }

    /// A node without sharding information behaves as one shard
    pub fn single() -> Self {
        Self::new(1, 0)
    }

    pub fn nr_shards(&self) -> u32 {
        self.nr_shards
    }

    pub fn msb_ignore(&self) -> u8 {
        self.msb_ignore
    }

    /// Fixed-point multiply-shift of the biased token into `0..nr_shards`
    pub fn shard_of(&self, token: Token) -> u32 {
        let biased = (token.value() as u64).wrapping_add(1u64 << 63);
        let z = biased.checked_shl(self.msb_ignore as u32).unwrap_or(0);
        let lo = z & 0xffff_ffff;
        let hi = z >> 32;
        let n = self.nr_shards as u64;
        let mul1 = lo * n;
        let mul2 = hi * n;
        ((mul2 + (mul1 >> 32)) >> 32) as u32
    }

    pub fn shard_of_source_port(&self, port: u16) -> u32 {
        port as u32 % self.nr_shards
    }

    pub fn source_ports_for(&self, shard: u32) -> ShardPortIterator {
        ShardPortIterator::new(shard, self.nr_shards)
    }
}

/// Source ports congruent to a shard modulo the shard count, starting at a
/// random position and wrapping once through the ephemeral range
#[derive(Debug, Clone)]
pub struct ShardPortIterator {
    low: u32,
    step: u32,
    total: u32,
    start_idx: u32,
    yielded: u32,
}

impl ShardPortIterator {
    pub fn new(shard: u32, nr_shards: u32) -> Self {
        let n = nr_shards.max(1);
        let lo = SOURCE_PORT_MIN as u32 + n - 1;
        let hi = (SOURCE_PORT_MAX as u32).saturating_sub(n - 1);
        let r = if lo <= hi {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            SOURCE_PORT_MIN as u32
        };
        Self::starting_at(shard, nr_shards, r)
    }

    /// Iterate starting from `start` rounded down to the shard's residue
    pub fn starting_at(shard: u32, nr_shards: u32, start: u32) -> Self {
        let n = nr_shards.max(1);
        let s = shard % n;
        let min = SOURCE_PORT_MIN as u32;
        let max = SOURCE_PORT_MAX as u32;

        let low = min + ((s + n - min % n) % n);
        if low > max {
            return Self {
                low,
                step: n,
                total: 0,
                start_idx: 0,
                yielded: 0,
            };
        }
        let total = (max - low) / n + 1;
        let rounded = (start - start % n + s).max(low);
        let start_idx = ((rounded - low) / n) % total;
        Self {
            low,
            step: n,
            total,
            start_idx,
            yielded: 0,
        }
    }
}

impl Iterator for ShardPortIterator {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.yielded >= self.total {
            return None;
        }
        let idx = (self.start_idx + self.yielded) % self.total;
        self.yielded += 1;
        Some((self.low + idx * self.step) as u16)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.yielded) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ShardPortIterator {}
