//! Mounting: finding the trusted checkpoint, replaying the log after it, and finishing whatever
//! the last session left half-done. A device without a usable checkpoint is formatted instead.

use super::checkpoint::encode_p2lm;
use super::config::MountOptions;
use super::disk::{Geometry, NandDisk};
use super::error::{FtlError, Result};
use super::map::BlockTag;
use super::oplog::OpLog;
use super::records::{Checkpoint, Op};
use crate::nand::Nand;

impl<N: Nand> NandDisk<N> {
    /// Mount a NAND device, recovering from any interrupted operation
    pub fn mount(mut nand: N, options: &MountOptions) -> Result<Self> {
        let layout = nand.init().map_err(FtlError::UnknownId)?;
        let geo = Geometry::new(layout, options)?;
        log::info!(
            "Mounting {}x{}x{} NAND as {} logical blocks",
            layout.blocks,
            layout.pages_per_block,
            layout.bytes_per_page,
            geo.logical_blocks
        );

        let mut disk = Self::new(nand, geo)?;
        match disk.find_checkpoint() {
            Some((p2ln, cp)) if cp.blocks == u32::from(geo.physical_blocks) => {
                disk.recover(p2ln, cp)?
            }
            found => {
                match found {
                    Some((p2ln, cp)) => log::warn!(
                        "Checkpoint in block {p2ln} describes {} blocks, not {}",
                        cp.blocks,
                        geo.physical_blocks
                    ),
                    None => log::info!("No checkpoint found"),
                }
                if !options.auto_format {
                    return Err(FtlError::FormatError);
                }
                disk.format_media()?;
            }
        }

        disk.sweep();
        Ok(disk)
    }

    /// Format a NAND device unconditionally, destroying its contents, and mount it
    pub fn format(mut nand: N, options: &MountOptions) -> Result<Self> {
        let layout = nand.init().map_err(FtlError::UnknownId)?;
        let geo = Geometry::new(layout, options)?;

        let mut disk = Self::new(nand, geo)?;
        disk.format_media()?;
        Ok(disk)
    }

    /// Erase everything and write an initial, self-referencing checkpoint
    fn format_media(&mut self) -> Result<()> {
        let blocks = self.geo.physical_blocks;
        let rpt = howudoin::new()
            .label("Formatting")
            .set_len(u64::from(blocks));

        for pba in 0..blocks {
            rpt.inc();

            if !self.media.is_valid(pba) {
                self.map.set_tag(pba, BlockTag::Bad);
                continue;
            }

            if let Err(e) = self.media.erase(pba) {
                let e = anyhow::Error::from(e);
                rpt.add_info(format!("Block {pba} failed to erase, marking bad"));
                log::warn!("Block {pba} failed to erase, marking bad: {e:#}");
                self.media.retire(pba);
                self.map.set_tag(pba, BlockTag::Bad);
            }
        }
        rpt.close();

        let p2ln = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::P2ln)?;
        self.map.set_tag(p2ln, BlockTag::P2ln);
        let op = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::OpTable)?;
        self.map.set_tag(op, BlockTag::OpTable);

        let snapshot = encode_p2lm(&self.map);
        self.write_checkpoint(
            p2ln,
            Checkpoint {
                op_block: op,
                old_op_block: op,
                old_p2ln: p2ln,
                blocks: blocks.into(),
            },
            &snapshot,
        )?;
        self.p2ln_block = p2ln;
        self.log = OpLog::new(op);
        self.last_op = None;

        log::info!(
            "Formatted: P2LN in block {p2ln}, OP in block {op}, {} bad block(s)",
            self.bad_blocks()
        );
        Ok(())
    }

    /// Scan every block for a checkpoint header and pick the one to trust
    ///
    /// A checkpoint is trusted if it references itself (fresh format) or if the checkpoint it
    /// superseded is gone. If that doesn't single one out, a swap was interrupted between two
    /// checkpoints that name each other; the older one is the one whose log ends with the swap.
    fn find_checkpoint(&mut self) -> Option<(u16, Checkpoint)> {
        let blocks = self.geo.physical_blocks;
        let rpt = howudoin::new()
            .label("Scanning for checkpoint")
            .set_len(u64::from(blocks));

        let mut found = Vec::new();
        for pba in 0..blocks {
            if let Some(cp) = self.read_checkpoint(pba) {
                let in_range = [cp.op_block, cp.old_op_block, cp.old_p2ln]
                    .into_iter()
                    .all(|b| b < blocks);
                if in_range {
                    log::debug!("Block {pba} holds checkpoint {cp:?}");
                    found.push((pba, cp));
                } else {
                    log::warn!("Block {pba} holds out-of-range checkpoint {cp:?}");
                }
            }
            rpt.inc();
        }
        rpt.close();

        let has_header = |pba: u16| found.iter().any(|&(other, _)| other == pba);
        let trusted: Vec<(u16, Checkpoint)> = found
            .iter()
            .copied()
            .filter(|&(pba, cp)| cp.old_p2ln == pba || !has_header(cp.old_p2ln))
            .collect();
        if let [only] = trusted[..] {
            return Some(only);
        }

        for &(pba, cp) in &found {
            if let Some(swap) = self.logged_swap(cp.op_block) {
                if swap.old_p2ln == pba && has_header(swap.new_p2ln) {
                    log::info!("Checkpoint swap from block {pba} was interrupted");
                    return Some((pba, cp));
                }
            }
        }

        let pick = trusted.first().or(found.first()).copied();
        if let Some((pba, _)) = pick {
            log::warn!(
                "{} checkpoint(s) found, none clearly current; using block {pba}",
                found.len()
            );
        }
        pick
    }

    /// Load a checkpoint, replay its log, and finish whatever the last logged operation started
    fn recover(&mut self, p2ln: u16, cp: Checkpoint) -> Result<()> {
        log::info!("Recovering from checkpoint in block {p2ln}: {cp:?}");

        let p2lm = self.read_snapshot(p2ln)?;
        for pba in self.map.load_p2lm(p2lm) {
            log::warn!("Block {pba} maps a logical block beyond the disk, releasing it");
        }
        self.map.set_tag(p2ln, BlockTag::P2ln);
        self.map.set_tag(cp.op_block, BlockTag::OpTable);

        self.p2ln_block = p2ln;
        self.log = OpLog::new(cp.op_block);
        self.last_op = self
            .log
            .replay(&mut self.media, &mut self.map, &mut self.page_buf)?;

        match self.last_op {
            None => self.release_superseded(p2ln, cp),
            Some(Op::Link { .. }) => {}
            Some(op @ Op::Relink { .. }) => OpLog::apply(&mut self.media, &mut self.map, op),
            Some(Op::P2lnSwap(swap)) => {
                if (swap.old_p2ln, swap.old_op) != (p2ln, cp.op_block) {
                    return Err(FtlError::P2lnSync {
                        swap_p2ln: swap.old_p2ln,
                        swap_op: swap.old_op,
                        p2ln,
                        op: cp.op_block,
                    });
                }
                log::info!("Completing interrupted checkpoint");
                self.media.erase(swap.new_op)?;
                self.media.erase(swap.new_p2ln)?;
                self.finish_swap(swap)?;
            }
        }

        // An unrecognized record that isn't an erased page can't be appended over
        let pages = self.geo.pages_per_block;
        if self.log.offset < pages && self.media.is_dirty(self.log.block, self.log.offset) {
            log::warn!("Replay log ends in a torn record, starting a new one");
            return self.checkpoint();
        }

        self.maybe_checkpoint()
    }

    /// Erase the blocks a checkpoint superseded, if that never happened
    fn release_superseded(&mut self, p2ln: u16, cp: Checkpoint) {
        for (old, current) in [(cp.old_p2ln, p2ln), (cp.old_op_block, cp.op_block)] {
            if old == current || self.map.tag(old) != BlockTag::Free {
                continue;
            }
            if let Err(e) = self.media.check_empty(old) {
                log::warn!(
                    "Can't erase superseded block {old}: {:#}",
                    anyhow::Error::from(e)
                );
            }
        }
    }

    /// Release stale holder blocks and erase free blocks that still hold data
    fn sweep(&mut self) {
        for pba in 0..self.geo.physical_blocks {
            let stale = match self.map.tag(pba) {
                BlockTag::Free => true,
                BlockTag::OpTable => pba != self.log.block,
                BlockTag::P2ln => pba != self.p2ln_block,
                BlockTag::Bad | BlockTag::Data(_) => false,
            };
            if !stale {
                continue;
            }

            if !self.media.is_valid(pba) {
                self.map.set_tag(pba, BlockTag::Bad);
                continue;
            }
            if self.map.tag(pba) != BlockTag::Free {
                log::info!("Releasing stale {:?} block {pba}", self.map.tag(pba));
                self.map.set_tag(pba, BlockTag::Free);
            }
            if let Err(e) = self.media.check_empty(pba) {
                log::warn!("Can't erase free block {pba}: {:#}", anyhow::Error::from(e));
            }
        }

        log::info!(
            "Mounted: {} free, {} bad, P2LN {}, OP {} at {}",
            self.free_blocks(),
            self.bad_blocks(),
            self.p2ln_block,
            self.log.block,
            self.log.offset
        );
    }
}
