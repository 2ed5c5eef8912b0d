//! Abstractions and code to access NAND flash
//!
//! The flash translation layer only ever talks to a [Nand]: a page-granular driver that knows how
//! to program, read, and erase, and which blocks the factory (or wear) has rendered unusable.

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Correctable bits assumed when a layout string does not say otherwise
const DEFAULT_ECC_STRENGTH: u32 = 8;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,

    /// How many bit errors per ECC step the controller can correct
    pub ecc_strength: u32,
}

impl NandLayout {
    /// Compute the number of bytes in one erase block
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES", optionally followed by "xECC"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page, ecc) = match parts[..] {
            [b, p, s] => (b, p, s, None),
            [b, p, s, e] => (b, p, s, Some(e)),
            _ => bail!("expected #x#x# or #x#x#x#"),
        };
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let ecc_strength = match ecc {
            Some(e) => e.parse()?,
            None => DEFAULT_ECC_STRENGTH,
        };

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            ecc_strength,
        })
    }
}

/// Represents a NAND flash device, addressed by (block, page)
///
/// Implementations are expected to be blocking: every call runs to completion (or to a hardware
/// timeout, reported as an error) before returning.
pub trait Nand {
    /// Detect the chip and report its geometry
    fn init(&mut self) -> anyhow::Result<NandLayout>;

    /// Release the chip
    fn deinit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Read one page into `content`, which must be exactly one page long
    ///
    /// On success, returns the number of bit errors the ECC engine had to correct.
    fn read_page(&mut self, block: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32>;

    /// Program one page; the page must not have been programmed since the last erase
    fn write_page(&mut self, block: u32, page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Has this page been programmed since its block was last erased?
    fn is_dirty_page(&mut self, block: u32, page: u32) -> bool;

    /// Is this block usable (i.e. not marked bad)?
    fn is_valid_block(&mut self, block: u32) -> bool;

    /// Erase a block, making all pages writable again
    fn erase(&mut self, block: u32) -> anyhow::Result<()>;

    /// Permanently retire a block
    fn mark_bad(&mut self, block: u32) -> anyhow::Result<()>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Besides plain storage, this can inject the failures an FTL must survive: factory-bad blocks,
/// reads that need ECC correction, reads that transiently fail, and loss of power partway through
/// a sequence of program/erase operations.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,

    /// How many more program/erase operations succeed before "power is lost"
    power_budget: Option<u64>,

    /// Total program/erase operations performed
    mutations: u64,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes of all pages (erased pages hold 0xFF)
    data: Vec<u8>,

    /// Which pages have been programmed since the last erase
    programmed: Vec<bool>,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Bit errors reported as corrected on every read of this block
    bitflips: u32,

    /// Remaining transient read failures, per page
    read_failures: Vec<u32>,

    /// How many times this block has been erased
    erase_count: u32,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            power_budget: None,
            mutations: 0,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            read.read_exact(&mut buf)?;

            let block = &mut self.blocks[block as usize];
            *block = SimBlock::new(self.layout);
            for (page, content) in buf.chunks_exact(self.layout.bytes_per_page).enumerate() {
                block.write_page(page as u32, content)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter() {
            if block.marked_bad {
                buf.fill(0xBD);
            } else {
                buf.copy_from_slice(&block.data);
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }

    fn sim_block(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }

    /// Account for one program/erase, failing if the power budget is exhausted
    fn spend_power(&mut self) -> anyhow::Result<()> {
        if let Some(budget) = self.power_budget.as_mut() {
            ensure!(*budget > 0, "power lost");
            *budget -= 1;
        }
        self.mutations += 1;
        Ok(())
    }

    /// Mark a block as bad from the factory
    pub fn set_factory_bad(&mut self, block: u32) {
        self.blocks[block as usize].marked_bad = true;
    }

    /// Make every read of `block` report `bits` corrected bit errors
    pub fn set_bitflips(&mut self, block: u32, bits: u32) {
        self.blocks[block as usize].bitflips = bits;
    }

    /// Make the next `count` reads of one page fail
    pub fn fail_reads(&mut self, block: u32, page: u32, count: u32) {
        self.blocks[block as usize].read_failures[page as usize] = count;
    }

    /// Allow only `ops` more program/erase operations; everything after that fails, leaving the
    /// flash untouched, as if the power had been cut
    pub fn cut_power_after(&mut self, ops: u64) {
        self.power_budget = Some(ops);
    }

    /// Lift any power budget set by [SimNand::cut_power_after]
    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    /// Total program/erase operations performed so far
    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    /// How many times a block has been erased
    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks[block as usize].erase_count
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: vec![0xFF; layout.block_size()],
            programmed: vec![false; layout.pages_per_block as usize],
            marked_bad: false,
            bitflips: 0,
            read_failures: vec![0; layout.pages_per_block as usize],
            erase_count: 0,
        }
    }

    fn page_size(&self) -> usize {
        self.data.len() / self.programmed.len()
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size(), "content not page-sized");
        ensure!(
            (index as usize) < self.programmed.len(),
            "page index out of bounds"
        );
        ensure!(
            !self.programmed[index as usize],
            "page {index} already programmed"
        );

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            let begin = index as usize * self.page_size();
            self.data[begin..][..content.len()].copy_from_slice(content);
            self.programmed[index as usize] = true;
        }

        Ok(())
    }

    fn read_page(&mut self, index: u32, content: &mut [u8]) -> anyhow::Result<u32> {
        ensure!(content.len() == self.page_size(), "content not page-sized");
        ensure!(
            (index as usize) < self.programmed.len(),
            "page index out of bounds"
        );

        let failures = &mut self.read_failures[index as usize];
        if *failures > 0 {
            *failures -= 1;
            bail!("uncorrectable ECC error on page {index}");
        }

        let begin = index as usize * self.page_size();
        content.copy_from_slice(&self.data[begin..][..content.len()]);

        Ok(self.bitflips)
    }

    fn erase(&mut self) {
        self.data.fill(0xFF);
        self.programmed.fill(false);
        self.erase_count += 1;
    }
}

impl Nand for SimNand {
    fn init(&mut self) -> anyhow::Result<NandLayout> {
        Ok(self.layout)
    }

    fn read_page(&mut self, block: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32> {
        let block = self.sim_block(block)?;
        ensure!(!block.marked_bad, "read from bad block");
        block.read_page(page, content)
    }

    fn write_page(&mut self, block: u32, page: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(!self.sim_block(block)?.marked_bad, "write to bad block");
        self.spend_power()?;
        self.sim_block(block)?.write_page(page, content)
    }

    fn is_dirty_page(&mut self, block: u32, page: u32) -> bool {
        self.blocks
            .get(block as usize)
            .and_then(|b| b.programmed.get(page as usize).copied())
            .unwrap_or(false)
    }

    fn is_valid_block(&mut self, block: u32) -> bool {
        self.blocks
            .get(block as usize)
            .is_some_and(|b| !b.marked_bad)
    }

    fn erase(&mut self, block: u32) -> anyhow::Result<()> {
        ensure!(!self.sim_block(block)?.marked_bad, "erase of bad block");
        self.spend_power()?;
        self.sim_block(block)?.erase();
        Ok(())
    }

    fn mark_bad(&mut self, block: u32) -> anyhow::Result<()> {
        self.sim_block(block)?;
        self.spend_power()?;
        let block = self.sim_block(block)?;
        block.erase();
        block.marked_bad = true;
        Ok(())
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    ecc_strength: 4,
};

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    let layout: NandLayout = "64x64x2048".parse()?;
    assert_eq!(layout.blocks, 64);
    assert_eq!(layout.pages_per_block, 64);
    assert_eq!(layout.bytes_per_page, 2048);
    assert_eq!(layout.ecc_strength, DEFAULT_ECC_STRENGTH);

    let layout: NandLayout = "1024x128x4096x24".parse()?;
    assert_eq!(layout.ecc_strength, 24);

    assert!("64x64".parse::<NandLayout>().is_err());
    assert!("64xAx2048".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_mark_bad() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.is_valid_block(0));
    nand.mark_bad(0)?;
    assert!(!nand.is_valid_block(0));
    assert!(nand.erase(0).is_err());
    assert!(!nand.is_valid_block(TEST_LAYOUT.blocks));
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    // Pages may be programmed out of order, but only once per erase
    nand.write_page(0, 2, &data_in)?;
    nand.write_page(0, 1, &data_in)?;
    assert!(nand.write_page(0, 2, &data_in).is_err());

    assert!(nand.is_dirty_page(0, 2));
    assert!(!nand.is_dirty_page(0, 3));

    nand.read_page(0, 3, &mut data_out)?;
    assert!(data_out.is_erased());

    nand.read_page(0, 2, &mut data_out)?;
    assert_eq!(data_out, data_in);

    // Erased content doesn't make a page dirty
    nand.write_page(0, 4, &vec![0xFF; TEST_LAYOUT.bytes_per_page])?;
    assert!(!nand.is_dirty_page(0, 4));

    nand.erase(0)?;
    assert!(!nand.is_dirty_page(0, 2));
    assert_eq!(nand.erase_count(0), 1);
    Ok(())
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];

    nand.set_bitflips(1, 3);
    assert_eq!(nand.read_page(1, 0, &mut buf)?, 3);

    nand.fail_reads(1, 5, 2);
    assert!(nand.read_page(1, 5, &mut buf).is_err());
    assert!(nand.read_page(1, 5, &mut buf).is_err());
    assert!(nand.read_page(1, 5, &mut buf).is_ok());

    nand.cut_power_after(1);
    nand.erase(2)?;
    assert!(nand.write_page(2, 0, &[0u8; 256]).is_err());
    assert!(!nand.is_dirty_page(2, 0));
    nand.restore_power();
    nand.write_page(2, 0, &[0u8; 256])?;
    assert_eq!(nand.mutations(), 2);
    Ok(())
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.write_page(3, 7, &[0x55u8; 256])?;
    nand.mark_bad(5)?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(image.len(), TEST_LAYOUT.block_size() * TEST_LAYOUT.blocks as usize);

    let mut copy = SimNand::new(TEST_LAYOUT);
    copy.load(&mut &image[..])?;

    let mut buf = vec![0u8; 256];
    copy.read_page(3, 7, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55));
    assert!(copy.is_dirty_page(3, 7));
    assert!(!copy.is_dirty_page(3, 6));
    Ok(())
}
