//! The replay log: one [Op] record per page of the OP block, appended in order.

use super::error::{FtlError, Result};
use super::map::{BlockMap, BlockTag};
use super::media::Media;
use super::records::Op;
use crate::nand::Nand;

/// Position of the replay log on flash
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OpLog {
    /// The OP block
    pub block: u16,

    /// The next page to be appended
    pub offset: u32,
}

impl OpLog {
    /// A log that hasn't been written to yet
    pub fn new(block: u16) -> Self {
        Self { block, offset: 0 }
    }

    /// Append a record; `buf` is page-sized scratch space
    pub fn append<N: Nand>(&mut self, media: &mut Media<N>, op: Op, buf: &mut [u8]) -> Result<()> {
        let pages = media.dirty.pages_per_block();
        if self.offset >= pages {
            return Err(FtlError::Io(anyhow::anyhow!(
                "OP block {} is full",
                self.block
            )));
        }

        buf.fill(0xFF);
        op.encode(buf).map_err(FtlError::Io)?;
        media.program(self.block, self.offset, buf)?;
        log::debug!("Logged {op:?} at OP page {}", self.offset);

        self.offset += 1;
        Ok(())
    }

    /// Apply every record in the log to `map`, returning the last one found
    ///
    /// P2LN-SWAP records change nothing here; the caller decides what to do about a swap that
    /// was the last thing logged. On return, `offset` points just past the last page consumed.
    pub fn replay<N: Nand>(
        &mut self,
        media: &mut Media<N>,
        map: &mut BlockMap,
        buf: &mut [u8],
    ) -> Result<Option<Op>> {
        let pages = media.dirty.pages_per_block();
        let mut last = None;
        self.offset = 0;

        while self.offset < pages {
            let page = self.offset;
            if !media.is_dirty(self.block, page) {
                break;
            }

            if let Err(e) = media.read(self.block, page, buf) {
                log::warn!(
                    "Skipping unreadable OP page {page}: {:#}",
                    anyhow::Error::from(e)
                );
                self.offset += 1;
                continue;
            }

            let Some(op) = Op::decode(buf) else {
                log::warn!("OP page {page} holds no valid record, ending replay");
                break;
            };
            if !Self::in_range(map, op) {
                log::warn!("OP page {page} record {op:?} is out of range, ending replay");
                break;
            }

            Self::apply(media, map, op);
            last = Some(op);
            self.offset += 1;
        }

        log::info!(
            "Replayed {} OP page(s) from block {}",
            self.offset,
            self.block
        );
        Ok(last)
    }

    fn in_range(map: &BlockMap, op: Op) -> bool {
        match op {
            Op::Link { lba, pba } => map.is_lba(lba) && map.is_pba(pba),
            Op::Relink {
                lba,
                old_pba,
                new_pba,
                ..
            } => map.is_lba(lba) && map.is_pba(old_pba) && map.is_pba(new_pba),
            Op::P2lnSwap(swap) => [swap.old_p2ln, swap.old_op, swap.new_p2ln, swap.new_op]
                .into_iter()
                .all(|pba| map.is_pba(pba)),
        }
    }

    /// Apply one record's mapping change; safe to repeat
    pub fn apply<N: Nand>(media: &mut Media<N>, map: &mut BlockMap, op: Op) {
        match op {
            Op::Link { lba, pba } => map.link(lba, pba),
            Op::Relink {
                lba,
                old_pba,
                new_pba,
                ..
            } => {
                // The old block may have been retired after the record was written
                let release_as = if media.is_valid(old_pba) {
                    BlockTag::Free
                } else {
                    BlockTag::Bad
                };
                map.relink(lba, old_pba, new_pba, release_as);
            }
            Op::P2lnSwap(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::dirty::DirtyPages;
    use crate::ftl::records::Swap;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 6,
        bytes_per_page: 64,
        ecc_strength: 4,
    };

    fn media() -> Media<SimNand> {
        Media {
            nand: SimNand::new(TEST_LAYOUT),
            dirty: DirtyPages::new(8, 6).unwrap(),
        }
    }

    #[test]
    fn test_append_replay() -> anyhow::Result<()> {
        let mut media = media();
        let mut buf = vec![0u8; 64];
        let mut log = OpLog::new(7);

        let swap = Op::P2lnSwap(Swap {
            old_p2ln: 6,
            old_op: 7,
            new_p2ln: 4,
            new_op: 5,
        });
        for op in [
            Op::Link { lba: 0, pba: 1 },
            Op::Link { lba: 2, pba: 3 },
            Op::Relink {
                lba: 0,
                old_pba: 1,
                new_pba: 2,
                start_page: 0,
                page_count: 1,
            },
            swap,
        ] {
            log.append(&mut media, op, &mut buf)?;
        }
        assert_eq!(log.offset, 4);

        let mut map = BlockMap::new(8, 3)?;
        let mut replayed = OpLog::new(7);
        let last = replayed.replay(&mut media, &mut map, &mut buf)?;
        assert_eq!(last, Some(swap));
        assert_eq!(replayed, log);
        assert_eq!(map.lookup(0), Some(2));
        assert_eq!(map.lookup(2), Some(3));
        assert_eq!(map.tag(1), BlockTag::Free);
        assert!(map.check_consistency().is_ok());
        Ok(())
    }

    #[test]
    fn test_replay_stops() -> anyhow::Result<()> {
        let mut media = media();
        let mut buf = vec![0u8; 64];
        let mut log = OpLog::new(0);

        log.append(&mut media, Op::Link { lba: 1, pba: 2 }, &mut buf)?;
        // lba 9 doesn't exist on a 3-block logical disk
        log.append(&mut media, Op::Link { lba: 9, pba: 3 }, &mut buf)?;
        log.append(&mut media, Op::Link { lba: 2, pba: 4 }, &mut buf)?;

        let mut map = BlockMap::new(8, 3)?;
        let last = log.replay(&mut media, &mut map, &mut buf)?;
        assert_eq!(last, Some(Op::Link { lba: 1, pba: 2 }));
        assert_eq!(log.offset, 1);
        assert_eq!(map.lookup(2), None);
        Ok(())
    }

    #[test]
    fn test_replay_skips_unreadable() -> anyhow::Result<()> {
        let mut media = media();
        let mut buf = vec![0u8; 64];
        let mut log = OpLog::new(0);

        log.append(&mut media, Op::Link { lba: 0, pba: 2 }, &mut buf)?;
        log.append(&mut media, Op::Link { lba: 1, pba: 3 }, &mut buf)?;
        media.nand.fail_reads(0, 0, 1);

        let mut map = BlockMap::new(8, 3)?;
        let last = log.replay(&mut media, &mut map, &mut buf)?;
        assert_eq!(last, Some(Op::Link { lba: 1, pba: 3 }));
        assert_eq!(log.offset, 2);
        assert_eq!(map.lookup(0), None);
        Ok(())
    }

    #[test]
    fn test_full_log() -> anyhow::Result<()> {
        let mut media = media();
        let mut buf = vec![0u8; 64];
        let mut log = OpLog::new(0);
        for lba in 0..6 {
            log.append(&mut media, Op::Link { lba, pba: 1 }, &mut buf)?;
        }
        assert!(log
            .append(&mut media, Op::Link { lba: 0, pba: 1 }, &mut buf)
            .is_err());
        Ok(())
    }
}
