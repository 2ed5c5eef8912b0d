//! The two translation tables: physical-to-logical (P2LM) and logical-to-physical (L2PM).

use super::error::{FtlError, Result};

const FREE_BLOCK: u16 = 0xFFFF;
const BAD_BLOCK: u16 = 0xFFF0;
const OP_BLOCK: u16 = 0xFFAA;
const P2LN_BLOCK: u16 = 0xFF55;

/// Physical block numbers must stay below every sentinel
pub const MAX_BLOCKS: u32 = P2LN_BLOCK as u32;

/// What a physical block is currently used for
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockTag {
    /// Available for allocation (possibly still holding stale data)
    Free,

    /// Permanently retired
    Bad,

    /// Holds the replay log
    OpTable,

    /// Holds a checkpoint
    P2ln,

    /// Holds the data of a logical block
    Data(u16),
}

impl From<u16> for BlockTag {
    fn from(value: u16) -> Self {
        match value {
            FREE_BLOCK => Self::Free,
            BAD_BLOCK => Self::Bad,
            OP_BLOCK => Self::OpTable,
            P2LN_BLOCK => Self::P2ln,
            lba => Self::Data(lba),
        }
    }
}

impl From<BlockTag> for u16 {
    fn from(value: BlockTag) -> Self {
        match value {
            BlockTag::Free => FREE_BLOCK,
            BlockTag::Bad => BAD_BLOCK,
            BlockTag::OpTable => OP_BLOCK,
            BlockTag::P2ln => P2LN_BLOCK,
            BlockTag::Data(lba) => lba,
        }
    }
}

/// Allocate a table without aborting the process if memory runs out
fn try_table<T: Clone>(len: usize, fill: T) -> Result<Box<[T]>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| FtlError::OutOfMemory)?;
    table.resize(len, fill);
    Ok(table.into_boxed_slice())
}

/// The P2LM and L2PM, kept mutually consistent
///
/// Whenever `l2pm[l] == Some(p)`, `p2lm[p] == Data(l)`. The methods here maintain that on their
/// own; callers only need to pick the right one.
#[derive(Debug, Clone)]
pub struct BlockMap {
    p2lm: Box<[BlockTag]>,
    l2pm: Box<[Option<u16>]>,
}

impl BlockMap {
    /// Create a map with every physical block free and every logical block unmapped
    pub fn new(physical_blocks: u16, logical_blocks: u16) -> Result<Self> {
        Ok(Self {
            p2lm: try_table(physical_blocks.into(), BlockTag::Free)?,
            l2pm: try_table(logical_blocks.into(), None)?,
        })
    }

    pub fn physical_blocks(&self) -> u16 {
        self.p2lm.len() as u16
    }

    /// Look up the tag of a physical block
    pub fn tag(&self, pba: u16) -> BlockTag {
        self.p2lm[pba as usize]
    }

    /// Look up the physical block backing a logical block, if any
    pub fn lookup(&self, lba: u16) -> Option<u16> {
        self.l2pm[lba as usize]
    }

    /// Iterate over every physical block and its tag
    pub fn tags(&self) -> impl Iterator<Item = (u16, BlockTag)> + '_ {
        self.p2lm.iter().enumerate().map(|(i, &t)| (i as u16, t))
    }

    /// Is `lba` a valid logical block number?
    pub fn is_lba(&self, lba: u16) -> bool {
        (lba as usize) < self.l2pm.len()
    }

    /// Is `pba` a valid physical block number?
    pub fn is_pba(&self, pba: u16) -> bool {
        (pba as usize) < self.p2lm.len()
    }

    /// Set the tag of a non-data block, unlinking any logical block that pointed at it
    pub fn set_tag(&mut self, pba: u16, tag: BlockTag) {
        debug_assert!(!matches!(tag, BlockTag::Data(_)));
        if let BlockTag::Data(lba) = self.p2lm[pba as usize] {
            if self.l2pm[lba as usize] == Some(pba) {
                self.l2pm[lba as usize] = None;
            }
        }
        self.p2lm[pba as usize] = tag;
    }

    /// Point `lba` at `pba`, in both directions
    pub fn link(&mut self, lba: u16, pba: u16) {
        if let BlockTag::Data(prev) = self.p2lm[pba as usize] {
            if prev != lba && self.l2pm[prev as usize] == Some(pba) {
                self.l2pm[prev as usize] = None;
            }
        }
        self.p2lm[pba as usize] = BlockTag::Data(lba);
        self.l2pm[lba as usize] = Some(pba);
    }

    /// Move `lba` from `old_pba` to `new_pba`, leaving `old_pba` with the tag `release_as`
    pub fn relink(&mut self, lba: u16, old_pba: u16, new_pba: u16, release_as: BlockTag) {
        if self.p2lm[old_pba as usize] == BlockTag::Data(lba) {
            self.p2lm[old_pba as usize] = release_as;
        }
        self.link(lba, new_pba);
    }

    /// Replace the whole P2LM (e.g. from a checkpoint) and derive the L2PM from it
    ///
    /// Entries naming a logical block that doesn't exist are released, and reported back.
    pub fn load_p2lm(&mut self, entries: impl IntoIterator<Item = u16>) -> Vec<u16> {
        let mut rejected = Vec::new();
        for (slot, raw) in self.p2lm.iter_mut().zip(entries) {
            *slot = raw.into();
        }
        for (pba, tag) in self.p2lm.iter_mut().enumerate() {
            if let BlockTag::Data(lba) = *tag {
                if (lba as usize) >= self.l2pm.len() {
                    rejected.push(pba as u16);
                    *tag = BlockTag::Free;
                }
            }
        }
        self.rebuild_l2pm();
        rejected
    }

    /// Derive the L2PM from the P2LM
    pub fn rebuild_l2pm(&mut self) {
        self.l2pm.fill(None);
        for (pba, tag) in self.p2lm.iter().enumerate() {
            if let BlockTag::Data(lba) = *tag {
                self.l2pm[lba as usize] = Some(pba as u16);
            }
        }
    }

    /// The raw P2LM, as persisted in a checkpoint
    pub fn raw_p2lm(&self) -> impl Iterator<Item = u16> + '_ {
        self.p2lm.iter().map(|&t| t.into())
    }

    /// Count the physical blocks carrying a tag
    pub fn count(&self, tag: BlockTag) -> usize {
        self.p2lm.iter().filter(|&&t| t == tag).count()
    }

    /// Verify that the two tables agree
    ///
    /// On failure, returns the first offending (lba, pba) pair.
    pub fn check_consistency(&self) -> Result<(), (u16, u16)> {
        for (lba, pba) in self.l2pm.iter().enumerate() {
            if let Some(pba) = *pba {
                if self.p2lm[pba as usize] != BlockTag::Data(lba as u16) {
                    return Err((lba as u16, pba));
                }
            }
        }
        for (pba, tag) in self.p2lm.iter().enumerate() {
            if let BlockTag::Data(lba) = *tag {
                if self.l2pm[lba as usize] != Some(pba as u16) {
                    return Err((lba, pba as u16));
                }
            }
        }
        Ok(())
    }
}

#[test]
fn test_tag_conversion() {
    for tag in [
        BlockTag::Free,
        BlockTag::Bad,
        BlockTag::OpTable,
        BlockTag::P2ln,
        BlockTag::Data(0),
        BlockTag::Data(59),
    ] {
        assert_eq!(BlockTag::from(u16::from(tag)), tag);
    }
    assert_eq!(u16::from(BlockTag::Free), 0xFFFF);
    assert_eq!(BlockTag::from(0xFFAA), BlockTag::OpTable);
}

#[test]
fn test_link_relink() {
    let mut map = BlockMap::new(8, 4).unwrap();
    map.link(2, 5);
    assert_eq!(map.lookup(2), Some(5));
    assert_eq!(map.tag(5), BlockTag::Data(2));

    map.relink(2, 5, 1, BlockTag::Free);
    assert_eq!(map.lookup(2), Some(1));
    assert_eq!(map.tag(5), BlockTag::Free);
    assert_eq!(map.tag(1), BlockTag::Data(2));

    // Re-applying the same relink changes nothing
    map.relink(2, 5, 1, BlockTag::Free);
    assert_eq!(map.lookup(2), Some(1));
    assert_eq!(map.tag(5), BlockTag::Free);
    assert!(map.check_consistency().is_ok());

    map.set_tag(1, BlockTag::Bad);
    assert_eq!(map.lookup(2), None);
    assert!(map.check_consistency().is_ok());
}

#[test]
fn test_load_p2lm() {
    let mut map = BlockMap::new(6, 4).unwrap();
    let rejected = map.load_p2lm([0xFF55, 3, 0xFFAA, 0xFFFF, 0, 9]);
    assert_eq!(rejected, vec![5]);
    assert_eq!(map.lookup(3), Some(1));
    assert_eq!(map.lookup(0), Some(4));
    assert_eq!(map.lookup(1), None);
    assert_eq!(map.tag(5), BlockTag::Free);
    assert_eq!(map.count(BlockTag::P2ln), 1);
    assert!(map.check_consistency().is_ok());
}
