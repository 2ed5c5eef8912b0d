//! Round-robin search for a free physical block.

use super::error::{FtlError, Result};
use super::map::{BlockMap, BlockTag};
use super::media::Media;
use crate::nand::Nand;

/// The free-block search, remembering where the last one ended
#[derive(Debug, Default)]
pub struct Allocator {
    cursor: u16,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a free, valid physical block and erase it
    ///
    /// The erase is unconditional: a block that lost power mid-erase can read back as clean
    /// without being fully erased. `purpose` is what the caller intends to tag the block with;
    /// the allocator itself does not tag it. Invalid candidates are tagged [BlockTag::Bad] on the
    /// spot; candidates that fail to erase are skipped.
    pub fn allocate<N: Nand>(
        &mut self,
        media: &mut Media<N>,
        map: &mut BlockMap,
        purpose: BlockTag,
    ) -> Result<u16> {
        let blocks = map.physical_blocks();
        let start = self.cursor.min(blocks);

        for pba in (start..blocks).chain(0..start) {
            if map.tag(pba) != BlockTag::Free {
                continue;
            }

            if !media.is_valid(pba) {
                log::warn!("Free block {pba} is marked bad, retiring it");
                map.set_tag(pba, BlockTag::Bad);
                continue;
            }

            if let Err(e) = media.erase(pba) {
                log::warn!("Skipping free block {pba}: {:#}", anyhow::Error::from(e));
                continue;
            }

            self.cursor = pba + 1;
            log::debug!("Allocated block {pba} for {purpose:?}");
            return Ok(pba);
        }

        Err(FtlError::BlockPoolExhausted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::dirty::DirtyPages;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 6,
        pages_per_block: 4,
        bytes_per_page: 64,
        ecc_strength: 4,
    };

    fn setup() -> (Media<SimNand>, BlockMap) {
        let media = Media {
            nand: SimNand::new(TEST_LAYOUT),
            dirty: DirtyPages::new(6, 4).unwrap(),
        };
        (media, BlockMap::new(6, 2).unwrap())
    }

    #[test]
    fn test_round_robin() -> Result<()> {
        let (mut media, mut map) = setup();
        let mut alloc = Allocator::new();
        media.nand.set_factory_bad(1);
        map.set_tag(3, BlockTag::OpTable);

        let first = alloc.allocate(&mut media, &mut map, BlockTag::Data(0))?;
        assert_eq!(first, 0);
        map.link(0, first);

        // Block 1 is bad, and stays retired
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::P2ln)?, 2);
        assert_eq!(map.tag(1), BlockTag::Bad);

        // Cursor moves past 2 even though it wasn't tagged, then wraps
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(1))?, 4);
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(1))?, 5);
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(1))?, 2);
        Ok(())
    }

    #[test]
    fn test_allocation_erases() -> Result<()> {
        let (mut media, mut map) = setup();
        let mut alloc = Allocator::new();
        media.program(0, 2, &[0x11; 64])?;

        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(0))?, 0);
        assert_eq!(media.nand.erase_count(0), 1);
        assert!(!media.dirty.is_set(0, 2));

        // Blocks that look clean are erased too
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(1))?, 1);
        assert_eq!(media.nand.erase_count(1), 1);
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> Result<()> {
        let (mut media, mut map) = setup();
        let mut alloc = Allocator::new();
        for pba in 0..6 {
            map.set_tag(pba, if pba % 2 == 0 { BlockTag::Bad } else { BlockTag::OpTable });
        }
        assert!(matches!(
            alloc.allocate(&mut media, &mut map, BlockTag::Data(0)),
            Err(FtlError::BlockPoolExhausted)
        ));

        // Blocks that can't be erased are skipped, not retired
        map.set_tag(4, BlockTag::Free);
        media.program(4, 0, &[0u8; 64])?;
        media.nand.cut_power_after(0);
        assert!(matches!(
            alloc.allocate(&mut media, &mut map, BlockTag::Data(0)),
            Err(FtlError::BlockPoolExhausted)
        ));
        assert_eq!(map.tag(4), BlockTag::Free);

        media.nand.restore_power();
        assert_eq!(alloc.allocate(&mut media, &mut map, BlockTag::Data(0))?, 4);
        Ok(())
    }
}
