use super::disk::{NandDisk, SECTOR_SIZE};
use super::error::Result;
use super::map::BlockTag;
use super::records::Op;
use crate::nand::Nand;

impl<N: Nand> NandDisk<N> {
    /// Read whole sectors into `buf`
    ///
    /// Never-written sectors read as 0xFF. A page that needed more ECC corrections than the
    /// relocation threshold gets its block moved to fresh media before this returns.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.geo.check_request(sector, buf.len())?;

        let page_size = self.geo.page_size;
        let start = sector * SECTOR_SIZE as u64;
        let mut done = 0;
        while done < buf.len() {
            let (lba, offset) = self.geo.locate(start + done as u64);
            let page = (offset / page_size) as u32;
            let col = offset % page_size;
            let len = (page_size - col).min(buf.len() - done);

            self.read_page_range(lba, page, col, &mut buf[done..][..len])?;
            done += len;
        }

        Ok(())
    }

    fn read_page_range(&mut self, lba: u16, page: u32, col: usize, out: &mut [u8]) -> Result<()> {
        let Some(pba) = self.map.lookup(lba) else {
            out.fill(0xFF);
            return Ok(());
        };
        if !self.media.is_dirty(pba, page) {
            out.fill(0xFF);
            return Ok(());
        }

        let corrected = self.media.read(pba, page, &mut self.page_buf)?;
        out.copy_from_slice(&self.page_buf[col..][..out.len()]);

        if corrected > self.geo.relocate_threshold {
            log::warn!("Block {pba} page {page} needed {corrected} corrections, relocating");
            if let Err(e) = self.relocate(lba, pba) {
                log::warn!("Relocating block {pba} failed: {:#}", anyhow::Error::from(e));
            }
        }

        Ok(())
    }

    /// Move a logical block off a physical block that is wearing out, and retire the latter
    fn relocate(&mut self, lba: u16, old: u16) -> Result<()> {
        let new = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::Data(lba))?;
        for page in 0..self.geo.pages_per_block {
            self.media.copy_page(old, new, page, &mut self.page_buf)?;
        }

        let op = Op::Relink {
            lba,
            old_pba: old,
            new_pba: new,
            start_page: 0,
            page_count: 0,
        };
        self.log.append(&mut self.media, op, &mut self.page_buf)?;
        self.map.relink(lba, old, new, BlockTag::Bad);
        self.last_op = Some(op);

        self.media.retire(old);
        log::info!("LBA {lba} relocated from block {old} to {new}");

        self.maybe_checkpoint()
    }
}
