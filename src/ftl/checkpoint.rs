//! Checkpointing: replacing the P2LN/OP block pair with a fresh pair holding a full P2LM snapshot.
//!
//! A swap goes through these steps, each of which may be interrupted by power loss:
//!
//! 1. Allocate and erase the new P2LN and OP blocks
//! 2. Log a P2LN-SWAP record naming old and new blocks in the *old* OP block
//! 3. Write the P2LM snapshot to pages 1.. of the new P2LN block
//! 4. Write the checkpoint header, naming the old blocks, to page 0 of the new P2LN block
//! 5. Switch the in-memory tables and pointers to the new pair
//! 6. Erase the old P2LN block
//! 7. Erase the old OP block
//!
//! Until step 6 the old checkpoint stays the one recovery trusts, and its log ends in the
//! P2LN-SWAP record, so recovery erases the new blocks and runs steps 3 through 7 again. From
//! step 6 on, the new checkpoint is trusted and the old OP block is just a stale free block.
//!
//! Nothing in memory changes before step 5. A swap that fails earlier leaves the old pair live,
//! and the next write carries on logging to it.

use bytes::{Buf, BufMut};

use super::disk::NandDisk;
use super::error::{FtlError, Result};
use super::map::{BlockMap, BlockTag};
use super::oplog::OpLog;
use super::records::{Checkpoint, Op, Swap};
use crate::nand::Nand;

/// Pack a P2LM the way it is stored after a checkpoint header
pub(super) fn encode_p2lm(map: &BlockMap) -> Vec<u8> {
    let mut snapshot = Vec::with_capacity(2 * usize::from(map.physical_blocks()));
    for entry in map.raw_p2lm() {
        snapshot.put_u16_le(entry);
    }
    snapshot
}

impl<N: Nand> NandDisk<N> {
    /// Checkpoint if the replay log is about to run out of pages
    pub(super) fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.log.offset + 2 >= self.geo.pages_per_block {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Write a fresh checkpoint and start a new, empty replay log
    ///
    /// On failure the current checkpoint and log stay in use.
    pub fn checkpoint(&mut self) -> Result<()> {
        let new_p2ln = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::P2ln)?;

        // Hold on to it while the OP block is allocated
        self.map.set_tag(new_p2ln, BlockTag::P2ln);
        let result = self
            .log_swap(new_p2ln)
            .and_then(|swap| self.finish_swap(swap));

        if let Err(e) = result {
            log::warn!(
                "Checkpoint to block {new_p2ln} failed, staying with block {}",
                self.p2ln_block
            );
            self.map.set_tag(new_p2ln, BlockTag::Free);
            return Err(e);
        }
        Ok(())
    }

    /// Allocate the new OP block and log the swap to it
    fn log_swap(&mut self, new_p2ln: u16) -> Result<Swap> {
        let new_op = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::OpTable)?;
        let swap = Swap {
            old_p2ln: self.p2ln_block,
            old_op: self.log.block,
            new_p2ln,
            new_op,
        };
        self.log
            .append(&mut self.media, Op::P2lnSwap(swap), &mut self.page_buf)?;
        self.last_op = Some(Op::P2lnSwap(swap));
        Ok(swap)
    }

    /// Carry out a logged swap whose new blocks are erased, from the snapshot onwards
    pub(super) fn finish_swap(&mut self, swap: Swap) -> Result<()> {
        log::info!(
            "Checkpointing: P2LN {} -> {}, OP {} -> {}",
            swap.old_p2ln,
            swap.new_p2ln,
            swap.old_op,
            swap.new_op
        );

        let mut swapped = self.map.clone();
        swapped.set_tag(swap.old_p2ln, BlockTag::Free);
        swapped.set_tag(swap.old_op, BlockTag::Free);
        swapped.set_tag(swap.new_p2ln, BlockTag::P2ln);
        swapped.set_tag(swap.new_op, BlockTag::OpTable);

        self.write_checkpoint(
            swap.new_p2ln,
            Checkpoint {
                op_block: swap.new_op,
                old_op_block: swap.old_op,
                old_p2ln: swap.old_p2ln,
                blocks: self.geo.physical_blocks.into(),
            },
            &encode_p2lm(&swapped),
        )?;

        self.map = swapped;
        self.p2ln_block = swap.new_p2ln;
        self.log = OpLog::new(swap.new_op);
        self.last_op = None;

        // A superseded header left behind would outrank the new one at the next mount
        for old in [swap.old_p2ln, swap.old_op] {
            if let Err(e) = self.media.erase(old) {
                log::warn!(
                    "Superseded block {old} failed to erase, retiring it: {:#}",
                    anyhow::Error::from(e)
                );
                self.media.retire(old);
                self.map.set_tag(old, BlockTag::Bad);
            }
        }
        Ok(())
    }

    /// Write a P2LM snapshot, then the checkpoint header that makes it visible, to an erased block
    pub(super) fn write_checkpoint(
        &mut self,
        p2ln: u16,
        cp: Checkpoint,
        snapshot: &[u8],
    ) -> Result<()> {
        for (page, chunk) in (1..).zip(snapshot.chunks(self.geo.page_size)) {
            self.page_buf.fill(0xFF);
            self.page_buf[..chunk.len()].copy_from_slice(chunk);
            self.media.program(p2ln, page, &self.page_buf)?;
        }

        self.page_buf.fill(0xFF);
        cp.encode(&mut self.page_buf).map_err(FtlError::Io)?;
        self.media.program(p2ln, 0, &self.page_buf)?;

        log::debug!("Wrote checkpoint {cp:?} to block {p2ln}");
        Ok(())
    }

    /// Read the P2LM snapshot following a checkpoint header
    pub(super) fn read_snapshot(&mut self, p2ln: u16) -> Result<Vec<u16>> {
        let entries = usize::from(self.geo.physical_blocks);
        let mut snapshot = Vec::with_capacity(2 * entries);
        for page in 1..=self.geo.snapshot_pages() {
            self.media.read_for_copy(p2ln, page, &mut self.page_buf)?;
            snapshot.extend_from_slice(&self.page_buf);
        }

        let mut raw = &snapshot[..2 * entries];
        let mut p2lm = Vec::with_capacity(entries);
        while raw.has_remaining() {
            p2lm.push(raw.get_u16_le());
        }
        Ok(p2lm)
    }

    /// Read the checkpoint header at page 0 of a block, if there is one
    pub(super) fn read_checkpoint(&mut self, pba: u16) -> Option<Checkpoint> {
        if !self.media.is_valid(pba) || !self.media.is_dirty(pba, 0) {
            return None;
        }
        match self.media.read(pba, 0, &mut self.page_buf) {
            Ok(_) => Checkpoint::decode(&self.page_buf),
            Err(e) => {
                log::warn!(
                    "Can't read page 0 of block {pba}: {:#}",
                    anyhow::Error::from(e)
                );
                None
            }
        }
    }

    /// The P2LN-SWAP record a replay log ends with, if it ends with one
    pub(super) fn logged_swap(&mut self, op_block: u16) -> Option<Swap> {
        let mut last = None;
        for page in 0..self.geo.pages_per_block {
            if !self.media.is_dirty(op_block, page)
                || self.media.read(op_block, page, &mut self.page_buf).is_err()
            {
                break;
            }
            match Op::decode(&self.page_buf) {
                Some(op) => last = Some(op),
                None => break,
            }
        }

        match last {
            Some(Op::P2lnSwap(swap)) => Some(swap),
            _ => None,
        }
    }
}
