//! The dirty-page bitmap: one bit per (physical block, page).
//!
//! A clear bit means the page is known to be erased. A set bit means the page *may* hold data;
//! [DirtyPages::check] settles the question with the driver and caches a "clean" answer.

use super::error::{FtlError, Result};
use crate::nand::Nand;

#[derive(Debug, Clone)]
pub struct DirtyPages {
    bits: Box<[u8]>,
    pages_per_block: u32,
}

impl DirtyPages {
    /// Create a bitmap with every page marked possibly-dirty
    pub fn new(blocks: u16, pages_per_block: u32) -> Result<Self> {
        let len = (usize::from(blocks) * pages_per_block as usize).div_ceil(8);
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)
            .map_err(|_| FtlError::OutOfMemory)?;
        bits.resize(len, 0xFF);

        Ok(Self {
            bits: bits.into_boxed_slice(),
            pages_per_block,
        })
    }

    pub fn pages_per_block(&self) -> u32 {
        self.pages_per_block
    }

    fn index(&self, pba: u16, page: u32) -> (usize, u8) {
        let bit = usize::from(pba) * self.pages_per_block as usize + page as usize;
        (bit / 8, 1 << (bit % 8))
    }

    pub fn set(&mut self, pba: u16, page: u32) {
        let (idx, mask) = self.index(pba, page);
        self.bits[idx] |= mask;
    }

    pub fn clear(&mut self, pba: u16, page: u32) {
        let (idx, mask) = self.index(pba, page);
        self.bits[idx] &= !mask;
    }

    pub fn is_set(&self, pba: u16, page: u32) -> bool {
        let (idx, mask) = self.index(pba, page);
        self.bits[idx] & mask != 0
    }

    /// Mark a whole block as erased
    pub fn clear_block(&mut self, pba: u16) {
        for page in 0..self.pages_per_block {
            self.clear(pba, page);
        }
    }

    /// Does any page of this block possibly hold data?
    #[cfg(test)]
    pub fn any_in_block(&self, pba: u16) -> bool {
        (0..self.pages_per_block).any(|page| self.is_set(pba, page))
    }

    /// Is the page dirty? A set bit is confirmed with the driver, and cleared if the driver says
    /// the page is actually erased.
    pub fn check<N: Nand>(&mut self, nand: &mut N, pba: u16, page: u32) -> bool {
        if !self.is_set(pba, page) {
            return false;
        }
        if nand.is_dirty_page(pba.into(), page) {
            return true;
        }
        self.clear(pba, page);
        false
    }
}

#[test]
fn test_dirty_bits() -> Result<()> {
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 4,
        pages_per_block: 12,
        bytes_per_page: 128,
        ecc_strength: 4,
    };

    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut dirty = DirtyPages::new(4, 12)?;

    // Everything starts out unknown, and the driver says it's all erased
    assert!(dirty.is_set(3, 11));
    assert!(!dirty.check(&mut nand, 3, 11));
    assert!(!dirty.is_set(3, 11));

    nand.write_page(1, 5, &[0u8; 128]).unwrap();
    assert!(dirty.check(&mut nand, 1, 5));

    dirty.clear_block(1);
    assert!(!dirty.any_in_block(1));
    assert!(dirty.any_in_block(2));
    assert!(dirty.is_set(0, 11));
    assert!(dirty.is_set(2, 0));

    dirty.set(1, 11);
    assert!(dirty.any_in_block(1));
    Ok(())
}
