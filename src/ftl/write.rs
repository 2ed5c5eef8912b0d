use super::disk::{NandDisk, SECTOR_SIZE};
use super::error::Result;
use super::map::BlockTag;
use super::oplog::OpLog;
use super::records::Op;
use crate::nand::Nand;

impl<N: Nand> NandDisk<N> {
    /// Write whole sectors from `data`
    pub fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        self.geo.check_request(sector, data.len())?;

        let block_bytes = self.geo.block_bytes();
        let mut pos = sector * SECTOR_SIZE as u64;
        let mut rest = data;
        while !rest.is_empty() {
            let (lba, offset) = self.geo.locate(pos);
            let (chunk, tail) = rest.split_at((block_bytes - offset).min(rest.len()));
            self.write_block(lba, offset, chunk)?;

            pos += chunk.len() as u64;
            rest = tail;
        }

        Ok(())
    }

    /// Write `data` at byte `offset` of a logical block
    ///
    /// An unmapped block gets a fresh physical block. A mapped one is written in place if every
    /// page touched is still erased; otherwise the block is rewritten to a fresh physical block.
    fn write_block(&mut self, lba: u16, offset: usize, data: &[u8]) -> Result<()> {
        let page_size = self.geo.page_size;
        let first = (offset / page_size) as u32;
        let last = ((offset + data.len() - 1) / page_size) as u32;

        let Some(old) = self.map.lookup(lba) else {
            let pba = self
                .alloc
                .allocate(&mut self.media, &mut self.map, BlockTag::Data(lba))?;
            self.program_range(pba, offset, data, None)?;
            return self.commit(Op::Link { lba, pba });
        };

        if !(first..=last).any(|page| self.media.is_dirty(old, page)) {
            return self.program_range(old, offset, data, None);
        }

        let new = self
            .alloc
            .allocate(&mut self.media, &mut self.map, BlockTag::Data(lba))?;
        for page in 0..first {
            self.media.copy_page(old, new, page, &mut self.page_buf)?;
        }
        self.program_range(new, offset, data, Some(old))?;
        for page in last + 1..self.geo.pages_per_block {
            self.media.copy_page(old, new, page, &mut self.page_buf)?;
        }

        self.commit(Op::Relink {
            lba,
            old_pba: old,
            new_pba: new,
            start_page: first as u16,
            page_count: (last - first + 1) as u16,
        })
    }

    /// Program `data` at byte `offset` of a physical block
    ///
    /// Partial pages are filled in from the same page of `merge_from` if it holds data, and
    /// with 0xFF otherwise.
    fn program_range(
        &mut self,
        pba: u16,
        offset: usize,
        data: &[u8],
        merge_from: Option<u16>,
    ) -> Result<()> {
        let page_size = self.geo.page_size;
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let page = (pos / page_size) as u32;
            let col = pos % page_size;
            let (chunk, tail) = rest.split_at((page_size - col).min(rest.len()));

            if chunk.len() == page_size {
                self.media.program(pba, page, chunk)?;
            } else {
                match merge_from {
                    Some(old) if self.media.is_dirty(old, page) => {
                        self.media.read_for_copy(old, page, &mut self.page_buf)?;
                    }
                    _ => self.page_buf.fill(0xFF),
                }
                self.page_buf[col..][..chunk.len()].copy_from_slice(chunk);
                self.media.program(pba, page, &self.page_buf)?;
            }

            pos += chunk.len();
            rest = tail;
        }

        Ok(())
    }

    /// Log a mapping change, then make it
    fn commit(&mut self, op: Op) -> Result<()> {
        self.log.append(&mut self.media, op, &mut self.page_buf)?;
        OpLog::apply(&mut self.media, &mut self.map, op);
        self.last_op = Some(op);
        self.maybe_checkpoint()
    }
}
