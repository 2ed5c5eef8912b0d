//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandLayout, PageUtil};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// MTD does not report the ECC strength through MEMGETINFO; this matches common 4-bit BCH parts
const MTD_DEFAULT_ECC_STRENGTH: u32 = 4;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,

    /// Scratch page, used to probe pages for dirtiness
    probe: Vec<u8>,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout: NandLayout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;
        let probe = vec![0; layout.bytes_per_page];

        Ok(Self {
            file,
            layout,
            probe,
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the offset of the first byte of a block
    fn block_base(&self, block: u32) -> anyhow::Result<u64> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        Ok(self.layout.block_size() as u64 * u64::from(block))
    }

    /// Ensure that the buffer and page are valid, and compute the /dev/mtdX offset for the page
    fn offset_for(&self, block: u32, page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes == self.layout.bytes_per_page,
            "buffer not exactly one page"
        );
        ensure!(
            page < self.layout.pages_per_block,
            "block {block}, page {page} out of bounds"
        );

        Ok(self.block_base(block)? + (self.layout.bytes_per_page as u64) * u64::from(page))
    }

    fn ecc_stats(&self) -> anyhow::Result<ioctl::mtd_ecc_stats> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            stats.assume_init()
        };
        Ok(stats)
    }
}

impl Nand for MtdNand {
    fn init(&mut self) -> anyhow::Result<NandLayout> {
        Ok(self.layout)
    }

    fn read_page(&mut self, block: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32> {
        let offset = self.offset_for(block, page, content.len())?;

        // The kernel only reports corrections through the running ECC counters
        let before = self.ecc_stats()?;
        self.file.read_exact_at(content, offset)?;
        let after = self.ecc_stats()?;

        ensure!(
            after.failed == before.failed,
            "uncorrectable ECC error at block {block}, page {page}"
        );
        Ok(after.corrected.wrapping_sub(before.corrected))
    }

    fn write_page(&mut self, block: u32, page: u32, content: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(block, page, content.len())?;
        Ok(self.file.write_all_at(content, offset)?)
    }

    fn is_dirty_page(&mut self, block: u32, page: u32) -> bool {
        let Ok(offset) = self.offset_for(block, page, self.probe.len()) else {
            return false;
        };

        // An unreadable page certainly isn't erased
        match self.file.read_exact_at(&mut self.probe, offset) {
            Ok(()) => !self.probe.is_erased(),
            Err(_) => true,
        }
    }

    fn is_valid_block(&mut self, block: u32) -> bool {
        let Ok(block_base) = self.block_base(block) else {
            return false;
        };
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) };
        matches!(bad, Ok(0))
    }

    fn erase(&mut self, block: u32) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.block_base(block)?.try_into()?,
            length: self.layout.block_size().try_into()?,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn mark_bad(&mut self, block: u32) -> anyhow::Result<()> {
        let block_base = self.block_base(block)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{NandLayout, MTD_DEFAULT_ECC_STRENGTH};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
                ecc_strength: MTD_DEFAULT_ECC_STRENGTH,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
