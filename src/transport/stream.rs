//! Stream id allocation for one connection

use crate::config::MAX_STREAMS;

/// Bitmap of in-use stream ids in `0..capacity`
#[derive(Debug)]
pub struct StreamIdAllocator {
    used: Box<[u64]>,
    capacity: usize,
    in_use: usize,
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new(MAX_STREAMS)
    }
}

impl StreamIdAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_STREAMS);
        Self {
            used: vec![0u64; capacity.div_ceil(64)].into_boxed_slice(),
            capacity,
            in_use: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Lowest free id, or `None` when every id is in flight
    pub fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used.iter_mut().enumerate() {
            if *block == !0 {
                continue;
            }
            let off = block.trailing_ones() as usize;
            let id = block_id * 64 + off;
            if id >= self.capacity {
                return None;
            }
            *block |= 1u64 << off;
            self.in_use += 1;
            return Some(id as i16);
        }
        None
    }

    /// Release an id; freeing an id that is not in use is a no-op
    pub fn free(&mut self, stream_id: i16) {
        if stream_id < 0 || stream_id as usize >= self.capacity {
            return;
        }
        let block_id = stream_id as usize / 64;
        let mask = 1u64 << (stream_id as usize % 64);
        if self.used[block_id] & mask != 0 {
            self.used[block_id] &= !mask;
            self.in_use -= 1;
        }
    }

    pub fn is_used(&self, stream_id: i16) -> bool {
        if stream_id < 0 || stream_id as usize >= self.capacity {
            return false;
        }
        self.used[stream_id as usize / 64] & (1u64 << (stream_id as usize % 64)) != 0
    }
}
