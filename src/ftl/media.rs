//! The driver, paired with the dirty-page bitmap that must follow every program and erase.

use retry::{delay::NoDelay, retry};

use super::dirty::DirtyPages;
use super::error::{FtlError, Result};
use crate::nand::Nand;

/// Extra attempts given to a page read while copying a block
pub const COPY_RETRIES: usize = 3;

#[derive(Debug)]
pub struct Media<N: Nand> {
    pub nand: N,
    pub dirty: DirtyPages,
}

impl<N: Nand> Media<N> {
    /// Erase a block and forget its dirty pages
    pub fn erase(&mut self, pba: u16) -> Result<()> {
        self.nand.erase(pba.into()).map_err(FtlError::Io)?;
        self.dirty.clear_block(pba);
        Ok(())
    }

    /// Program a page and remember it is dirty
    pub fn program(&mut self, pba: u16, page: u32, content: &[u8]) -> Result<()> {
        self.nand
            .write_page(pba.into(), page, content)
            .map_err(FtlError::Io)?;
        self.dirty.set(pba, page);
        Ok(())
    }

    /// Read a page, returning the number of corrected bits
    pub fn read(&mut self, pba: u16, page: u32, content: &mut [u8]) -> Result<u32> {
        self.nand
            .read_page(pba.into(), page, content)
            .map_err(FtlError::Io)
    }

    /// Read a page that is being copied elsewhere, tolerating transient failures
    pub fn read_for_copy(&mut self, pba: u16, page: u32, content: &mut [u8]) -> Result<u32> {
        let nand = &mut self.nand;
        let mut attempt = 0;
        retry(NoDelay.take(COPY_RETRIES), || {
            attempt += 1;
            let result = nand.read_page(pba.into(), page, content);
            if let Err(e) = &result {
                log::warn!("read of block {pba} page {page} failed (attempt {attempt}): {e}");
            }
            result
        })
        .map_err(|e| {
            FtlError::Io(anyhow::anyhow!(
                "block {pba} page {page} unreadable after {attempt} attempts: {e}"
            ))
        })
    }

    /// Copy one page between blocks, if the source page holds anything
    ///
    /// Returns whether a copy took place.
    pub fn copy_page(&mut self, from: u16, to: u16, page: u32, buf: &mut [u8]) -> Result<bool> {
        if !self.is_dirty(from, page) {
            return Ok(false);
        }
        self.read_for_copy(from, page, buf)?;
        self.program(to, page, buf)?;
        Ok(true)
    }

    /// Is this page dirty? (See [DirtyPages::check].)
    pub fn is_dirty(&mut self, pba: u16, page: u32) -> bool {
        self.dirty.check(&mut self.nand, pba, page)
    }

    pub fn is_valid(&mut self, pba: u16) -> bool {
        self.nand.is_valid_block(pba.into())
    }

    /// Erase a block if its first page has been programmed
    pub fn check_empty(&mut self, pba: u16) -> Result<()> {
        if self.nand.is_dirty_page(pba.into(), 0) {
            self.erase(pba)?;
        }
        Ok(())
    }

    /// Ask the driver to mark a block bad, and forget its pages
    ///
    /// Failure to mark it is only logged; the caller tags the block BAD in the map either way.
    pub fn retire(&mut self, pba: u16) {
        if let Err(e) = self.nand.mark_bad(pba.into()) {
            log::warn!("Marking block {pba} bad failed: {e:#}");
        }
        self.dirty.clear_block(pba);
    }
}
