// BlockPool - lock-free pool of interleaved audio blocks
//
// Blocks circulate between the graph's realtime thread and the bridge's
// management thread without any allocation on the realtime side.
//
// Architecture:
// - SUPPLY: management thread hands empty blocks to the realtime thread
// - the realtime thread fills a block with captured audio and sends it back
//   inside a capture-post message
// - the management thread posts the audio to the host and recycles the block
//   into SUPPLY
//
// Render blocks follow the same path in the other direction: the realtime
// thread lends its render block with each render request and gets it back,
// filled, in the reply.

use rtrb::{Consumer, Producer};

/// Configuration constants for the block pool
pub const DEFAULT_BLOCK_COUNT: usize = 8;

/// Interleaved 32-bit float samples
pub type AudioBlock = Vec<f32>;

/// Split block pool channels for producer/consumer separation
pub struct BlockPoolChannels {
    /// Producer for returning empty blocks from the management thread
    pub recycle: Producer<AudioBlock>,
    /// Consumer for retrieving empty blocks on the realtime thread
    pub supply: Consumer<AudioBlock>,
}

/// Lock-free block pool over an SPSC ring buffer
///
/// Pre-allocates `block_count` blocks of `block_len` samples. Every heap
/// allocation happens here or on the management thread when it grows a block.
///
/// # Thread Safety
/// - Lock-free: no mutex in push/pop
/// - Wait-free: push/pop have bounded execution time
pub struct BlockPool;

impl BlockPool {
    /// Create the pool with its blocks already queued in `supply`.
    ///
    /// A zero `block_count` or `block_len` is raised to one.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(block_count: usize, block_len: usize) -> BlockPoolChannels {
        let block_count = block_count.max(1);
        let block_len = block_len.max(1);

        let (mut recycle, supply) = rtrb::RingBuffer::new(block_count);
        for _ in 0..block_count {
            if recycle.push(vec![0.0_f32; block_len]).is_err() {
                break;
            }
        }

        BlockPoolChannels { recycle, supply }
    }
}

/// Grow `block` so that it holds at least `len` samples.
///
/// Only called on the management thread.
pub fn ensure_len(block: &mut AudioBlock, len: usize) {
    if block.len() < len {
        block.resize(len, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_pool_creation() {
        let mut channels = BlockPool::new(DEFAULT_BLOCK_COUNT, 512);

        let mut available = 0;
        while let Ok(block) = channels.supply.pop() {
            assert_eq!(block.len(), 512, "Block should have requested length");
            available += 1;
        }
        assert_eq!(available, DEFAULT_BLOCK_COUNT, "All blocks start in supply");
    }

    #[test]
    fn test_block_circulation() {
        let mut channels = BlockPool::new(2, 16);

        let mut block = channels.supply.pop().expect("Should have block in supply");
        block[0] = 1.0;
        channels
            .recycle
            .push(block)
            .expect("Should return block to supply");

        let mut seen_filled = false;
        while let Ok(block) = channels.supply.pop() {
            seen_filled |= block[0] == 1.0;
        }
        assert!(seen_filled, "Recycled block content should be preserved");
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let mut channels = BlockPool::new(0, 0);
        let block = channels.supply.pop().expect("One block expected");
        assert_eq!(block.len(), 1);
        assert!(channels.supply.pop().is_err());
    }

    #[test]
    fn test_ensure_len_only_grows() {
        let mut block = vec![1.0; 4];
        ensure_len(&mut block, 2);
        assert_eq!(block.len(), 4);
        ensure_len(&mut block, 8);
        assert_eq!(block.len(), 8);
        assert_eq!(block[3], 1.0);
        assert_eq!(block[7], 0.0);
    }

    #[test]
    fn test_send() {
        fn assert_send<T: Send>() {}
        assert_send::<BlockPoolChannels>();
    }
}
