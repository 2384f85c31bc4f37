//! # FEC Block Codec
//!
//! Systematic Reed-Solomon over the pool's shard layout: `k` source shards
//! in, `n` parity shards out; any `k` of the `k + n` recover the sources.
//!
//! The codec operates on whole shards (length prefix + payload + zero
//! padding, always an even byte count — see [`crate::pool`]), so recovered
//! shards self-describe their payload length and short segments survive
//! coding without a separate length channel.

use anyhow::{ensure, Context, Result};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

/// Hard cap on `k + n`, imposed by the 8-bit segment index on the wire.
pub const MAX_BLOCK_SEGMENTS: usize = 256;

/// Reusable Reed-Solomon encoder/decoder pair for one shard width.
pub struct BlockCodec {
    encoder: ReedSolomonEncoder,
    decoder: ReedSolomonDecoder,
    shard_width: usize,
}

impl BlockCodec {
    /// Create a codec for shards of `shard_width` bytes (must be even).
    pub fn new(shard_width: usize) -> Result<Self> {
        ensure!(
            shard_width >= 2 && shard_width % 2 == 0,
            "shard width {shard_width} must be even and >= 2"
        );
        // Dimensions are reconfigured per block via reset().
        let encoder = ReedSolomonEncoder::new(1, 1, shard_width)
            .context("reed-solomon encoder init")?;
        let decoder = ReedSolomonDecoder::new(1, 1, shard_width)
            .context("reed-solomon decoder init")?;
        Ok(BlockCodec {
            encoder,
            decoder,
            shard_width,
        })
    }

    pub fn shard_width(&self) -> usize {
        self.shard_width
    }

    /// Compute `n` parity shards from `k` source shards.
    ///
    /// `sources.len()` is the block's `k` (the last block of an object may
    /// be short). Returns empty when `n == 0`.
    pub fn encode_parity(&mut self, n: usize, sources: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if n == 0 || sources.is_empty() {
            return Ok(Vec::new());
        }
        let k = sources.len();
        ensure!(k + n <= MAX_BLOCK_SEGMENTS, "k + n exceeds {MAX_BLOCK_SEGMENTS}");
        self.encoder
            .reset(k, n, self.shard_width)
            .context("encoder reset")?;
        for shard in sources {
            ensure!(shard.len() == self.shard_width, "source shard width mismatch");
            self.encoder.add_original_shard(shard)?;
        }
        let result = self.encoder.encode()?;
        Ok(result.recovery_iter().map(|s| s.to_vec()).collect())
    }

    /// Recover missing source shards for a block.
    ///
    /// `k`/`n` are the block's dimensions; `sources` and `parity` list the
    /// shards that arrived as `(index, shard)` pairs. Decodable iff
    /// `sources.len() + parity.len() >= k`. Returns the restored
    /// `(source_index, shard)` pairs — only the missing ones.
    pub fn decode(
        &mut self,
        k: usize,
        n: usize,
        sources: &[(usize, &[u8])],
        parity: &[(usize, &[u8])],
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        ensure!(
            sources.len() + parity.len() >= k,
            "undecodable: {} of {k} shards present",
            sources.len() + parity.len()
        );
        if sources.len() >= k {
            return Ok(Vec::new());
        }
        self.decoder
            .reset(k, n, self.shard_width)
            .context("decoder reset")?;
        for &(idx, shard) in sources {
            self.decoder.add_original_shard(idx, shard)?;
        }
        for &(idx, shard) in parity {
            self.decoder.add_recovery_shard(idx, shard)?;
        }
        let result = self.decoder.decode()?;
        Ok(result
            .restored_original_iter()
            .map(|(idx, shard)| (idx, shard.to_vec()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SegmentPool;

    fn make_shards(k: usize, seg_size: usize, seed: u8) -> Vec<Vec<u8>> {
        let width = SegmentPool::shard_width(seg_size);
        (0..k)
            .map(|i| {
                let payload: Vec<u8> = (0..seg_size)
                    .map(|j| (i as u8).wrapping_mul(31).wrapping_add(j as u8 ^ seed))
                    .collect();
                let mut shard = vec![0u8; width];
                shard[..2].copy_from_slice(&(seg_size as u16).to_be_bytes());
                shard[2..2 + seg_size].copy_from_slice(&payload);
                shard
            })
            .collect()
    }

    #[test]
    fn parity_count_matches_n() {
        let width = SegmentPool::shard_width(64);
        let mut codec = BlockCodec::new(width).unwrap();
        let shards = make_shards(16, 64, 1);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(4, &refs).unwrap();
        assert_eq!(parity.len(), 4);
        assert!(parity.iter().all(|p| p.len() == width));
    }

    #[test]
    fn zero_parity_is_empty() {
        let mut codec = BlockCodec::new(SegmentPool::shard_width(64)).unwrap();
        let shards = make_shards(4, 64, 1);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        assert!(codec.encode_parity(0, &refs).unwrap().is_empty());
    }

    #[test]
    fn recovers_erased_sources_from_parity() {
        let width = SegmentPool::shard_width(100);
        let mut codec = BlockCodec::new(width).unwrap();
        let shards = make_shards(8, 100, 7);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(3, &refs).unwrap();

        // Lose sources 2 and 5; present: 6 sources + 2 parity = 8 >= k.
        let present_sources: Vec<(usize, &[u8])> = (0..8)
            .filter(|i| *i != 2 && *i != 5)
            .map(|i| (i, shards[i].as_slice()))
            .collect();
        let present_parity: Vec<(usize, &[u8])> =
            vec![(0, parity[0].as_slice()), (2, parity[2].as_slice())];

        let restored = codec.decode(8, 3, &present_sources, &present_parity).unwrap();
        assert_eq!(restored.len(), 2);
        for (idx, shard) in restored {
            assert_eq!(shard, shards[idx], "restored shard {idx} must match");
        }
    }

    #[test]
    fn undecodable_below_k_errors() {
        let width = SegmentPool::shard_width(100);
        let mut codec = BlockCodec::new(width).unwrap();
        let shards = make_shards(8, 100, 3);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(2, &refs).unwrap();

        // Only 5 sources + 2 parity = 7 < k = 8.
        let present_sources: Vec<(usize, &[u8])> =
            (0..5).map(|i| (i, shards[i].as_slice())).collect();
        let present_parity: Vec<(usize, &[u8])> =
            vec![(0, parity[0].as_slice()), (1, parity[1].as_slice())];
        assert!(codec.decode(8, 2, &present_sources, &present_parity).is_err());
    }

    #[test]
    fn all_sources_present_is_noop() {
        let width = SegmentPool::shard_width(50);
        let mut codec = BlockCodec::new(width).unwrap();
        let shards = make_shards(4, 50, 9);
        let present: Vec<(usize, &[u8])> =
            shards.iter().enumerate().map(|(i, s)| (i, s.as_slice())).collect();
        let restored = codec.decode(4, 2, &present, &[]).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn short_last_block_k_one() {
        let width = SegmentPool::shard_width(32);
        let mut codec = BlockCodec::new(width).unwrap();
        let shards = make_shards(1, 32, 5);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(2, &refs).unwrap();
        assert_eq!(parity.len(), 2);

        // Source lost entirely; one parity shard must restore it.
        let restored = codec
            .decode(1, 2, &[], &[(1, parity[1].as_slice())])
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].1, shards[0]);
    }

    #[test]
    fn odd_shard_width_rejected() {
        assert!(BlockCodec::new(101).is_err());
    }

    #[test]
    fn varying_block_dims_reuse_codec() {
        let width = SegmentPool::shard_width(64);
        let mut codec = BlockCodec::new(width).unwrap();
        for (k, n) in [(16usize, 4usize), (8, 2), (3, 1), (16, 4)] {
            let shards = make_shards(k, 64, k as u8);
            let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
            let parity = codec.encode_parity(n, &refs).unwrap();
            assert_eq!(parity.len(), n);

            let present_sources: Vec<(usize, &[u8])> =
                (1..k).map(|i| (i, shards[i].as_slice())).collect();
            let present_parity: Vec<(usize, &[u8])> = vec![(0, parity[0].as_slice())];
            let restored = codec.decode(k, n, &present_sources, &present_parity).unwrap();
            assert_eq!(restored.len(), 1);
            assert_eq!(restored[0].0, 0);
            assert_eq!(restored[0].1, shards[0]);
        }
    }
}
