use super::alloc::Allocator;
use super::config::MountOptions;
use super::dirty::DirtyPages;
use super::error::{FtlError, Result};
use super::map::{BlockMap, BlockTag, MAX_BLOCKS};
use super::media::Media;
use super::oplog::OpLog;
use super::records::Op;
use crate::nand::{Nand, NandLayout};

/// Sectors are always this size, whatever the page size
pub const SECTOR_SIZE: usize = 512;

const PAGE_SIZES: [usize; 3] = [2048, 4096, 8192];

/// Spare physical blocks required beyond the logical capacity
const MIN_SPARE_BLOCKS: u16 = 4;

/// A sector-addressed device, as seen by a filesystem
pub trait BlockDevice {
    /// Total number of sectors
    fn sector_count(&self) -> u64;

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Size of the underlying erase unit, in bytes
    fn erase_block_size(&self) -> usize;

    /// Read `buf.len() / 512` sectors starting at `sector`
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data.len() / 512` sectors starting at `sector`
    fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<()>;
}

/// The fixed shape of a mounted device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub physical_blocks: u16,
    pub logical_blocks: u16,
    pub pages_per_block: u32,
    pub page_size: usize,

    /// Reads needing more corrections than this trigger a relocation
    pub relocate_threshold: u32,
}

impl Geometry {
    /// Check that the FTL can run on `layout`
    pub fn new(layout: NandLayout, options: &MountOptions) -> Result<Self> {
        let unsupported =
            |msg: String| -> Result<Self> { Err(FtlError::UnsupportedGeometry(msg)) };

        if !PAGE_SIZES.contains(&layout.bytes_per_page) {
            return unsupported(format!("page size {}", layout.bytes_per_page));
        }
        if layout.blocks >= MAX_BLOCKS {
            return unsupported(format!("{} blocks is too many", layout.blocks));
        }
        if layout.pages_per_block < 4 {
            return unsupported(format!("{} pages per block", layout.pages_per_block));
        }

        let physical_blocks = layout.blocks as u16;
        let snapshot_pages = (2 * layout.blocks as usize).div_ceil(layout.bytes_per_page);
        if snapshot_pages > layout.pages_per_block as usize - 1 {
            return unsupported(format!(
                "P2LM needs {snapshot_pages} pages, a block has {}",
                layout.pages_per_block
            ));
        }

        let logical_blocks = options.logical_blocks_for(physical_blocks);
        if logical_blocks == 0 || logical_blocks > physical_blocks.saturating_sub(MIN_SPARE_BLOCKS)
        {
            return unsupported(format!(
                "{logical_blocks} logical blocks on {physical_blocks} physical blocks"
            ));
        }

        Ok(Self {
            physical_blocks,
            logical_blocks,
            pages_per_block: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            relocate_threshold: layout.ecc_strength.saturating_sub(options.relocate_margin),
        })
    }

    pub fn sectors_per_page(&self) -> u64 {
        (self.page_size / SECTOR_SIZE) as u64
    }

    pub fn block_bytes(&self) -> usize {
        self.page_size * self.pages_per_block as usize
    }

    pub fn sector_count(&self) -> u64 {
        self.sectors_per_page() * u64::from(self.pages_per_block) * u64::from(self.logical_blocks)
    }

    /// Pages after page 0 of the P2LN block holding the P2LM snapshot
    pub fn snapshot_pages(&self) -> u32 {
        (2 * usize::from(self.physical_blocks)).div_ceil(self.page_size) as u32
    }

    /// Check that a transfer is whole sectors and within the disk
    pub(super) fn check_request(&self, sector: u64, len: usize) -> Result<()> {
        if len % SECTOR_SIZE != 0 {
            return Err(FtlError::InvalidRequest(format!(
                "{len} bytes is not a whole number of sectors"
            )));
        }
        let count = (len / SECTOR_SIZE) as u64;
        match sector.checked_add(count) {
            Some(end) if end <= self.sector_count() => Ok(()),
            _ => Err(FtlError::InvalidRequest(format!(
                "sectors {sector}+{count} beyond end of disk ({} sectors)",
                self.sector_count()
            ))),
        }
    }

    /// Split a byte offset into the disk into (lba, byte offset within the block)
    pub(super) fn locate(&self, byte: u64) -> (u16, usize) {
        let block_bytes = self.block_bytes() as u64;
        ((byte / block_bytes) as u16, (byte % block_bytes) as usize)
    }
}

/// A mounted NAND device: the driver plus all the FTL state that goes with it
///
/// Created by [NandDisk::mount] or [NandDisk::format]; [NandDisk::unmount] gives the driver back.
#[derive(Debug)]
pub struct NandDisk<N: Nand> {
    pub(super) media: Media<N>,
    pub(super) geo: Geometry,
    pub(super) map: BlockMap,
    pub(super) alloc: Allocator,
    pub(super) p2ln_block: u16,
    pub(super) log: OpLog,
    pub(super) last_op: Option<Op>,

    /// Scratch space for a single page
    pub(super) page_buf: Box<[u8]>,
}

impl<N: Nand> NandDisk<N> {
    /// Set up empty tables for the given geometry
    pub(super) fn new(nand: N, geo: Geometry) -> Result<Self> {
        let mut page_buf = Vec::new();
        page_buf
            .try_reserve_exact(geo.page_size)
            .map_err(|_| FtlError::OutOfMemory)?;
        page_buf.resize(geo.page_size, 0xFF);

        Ok(Self {
            media: Media {
                nand,
                dirty: DirtyPages::new(geo.physical_blocks, geo.pages_per_block)?,
            },
            geo,
            map: BlockMap::new(geo.physical_blocks, geo.logical_blocks)?,
            alloc: Allocator::new(),
            p2ln_block: 0,
            log: OpLog::new(0),
            last_op: None,
            page_buf: page_buf.into_boxed_slice(),
        })
    }

    /// Release the driver
    pub fn unmount(mut self) -> Result<N> {
        self.media.nand.deinit().map_err(FtlError::Io)?;
        log::info!("Unmounted");
        Ok(self.media.nand)
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Borrow the driver, e.g. to inspect a simulated device
    pub fn nand(&self) -> &N {
        &self.media.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.media.nand
    }

    pub fn free_blocks(&self) -> usize {
        self.map.count(BlockTag::Free)
    }

    pub fn bad_blocks(&self) -> usize {
        self.map.count(BlockTag::Bad)
    }

    pub fn p2ln_block(&self) -> u16 {
        self.p2ln_block
    }

    pub fn op_block(&self) -> u16 {
        self.log.block
    }

    /// Number of records in the current replay log
    pub fn op_offset(&self) -> u32 {
        self.log.offset
    }

    /// The tag of every physical block
    pub fn block_tags(&self) -> impl Iterator<Item = (u16, BlockTag)> + '_ {
        self.map.tags()
    }

    /// The physical block backing a logical block, if it has been written
    pub fn lookup(&self, lba: u16) -> Option<u16> {
        if self.map.is_lba(lba) {
            self.map.lookup(lba)
        } else {
            None
        }
    }

    /// Verify that the mapping tables agree with each other and hold exactly one holder of each
    /// kind, namely the current ones
    pub fn check_consistency(&self) -> anyhow::Result<()> {
        if let Err((lba, pba)) = self.map.check_consistency() {
            anyhow::bail!("LBA {lba} and PBA {pba} disagree");
        }

        for (tag, current) in [
            (BlockTag::P2ln, self.p2ln_block),
            (BlockTag::OpTable, self.log.block),
        ] {
            let holders: Vec<u16> = self
                .map
                .tags()
                .filter(|&(_, t)| t == tag)
                .map(|(pba, _)| pba)
                .collect();
            anyhow::ensure!(
                holders == [current],
                "{tag:?} holders are {holders:?}, expected [{current}]"
            );
        }

        Ok(())
    }
}

impl<N: Nand> BlockDevice for NandDisk<N> {
    fn sector_count(&self) -> u64 {
        self.geo.sector_count()
    }

    fn erase_block_size(&self) -> usize {
        self.geo.block_bytes()
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        NandDisk::read_sectors(self, sector, buf)
    }

    fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        NandDisk::write_sectors(self, sector, data)
    }
}

#[test]
fn test_geometry() -> anyhow::Result<()> {
    let options = MountOptions::new();
    let geo = Geometry::new("64x64x2048".parse()?, &options)?;
    assert_eq!(geo.logical_blocks, 60);
    assert_eq!(geo.sector_count(), 60 * 64 * 4);
    assert_eq!(geo.snapshot_pages(), 1);
    assert_eq!(geo.relocate_threshold, 6);
    assert_eq!(geo.locate(3 * 64 * 2048 + 5), (3, 5));

    assert!(geo.check_request(0, 512).is_ok());
    assert!(geo.check_request(0, 100).is_err());
    assert!(geo.check_request(geo.sector_count() - 1, 1024).is_err());
    assert!(geo.check_request(u64::MAX, 512).is_err());

    for bad in ["64x64x512", "65365x64x2048", "64x2x2048", "4096x4x2048"] {
        assert!(matches!(
            Geometry::new(bad.parse()?, &options),
            Err(FtlError::UnsupportedGeometry(_))
        ));
    }

    // Not enough spare blocks
    assert!(Geometry::new("64x64x2048".parse()?, &options.clone().logical_blocks(61)).is_err());
    Ok(())
}
