//! A command-line tool for inspecting and exercising the flash translation layer.
//!
//! Works either against a real MTD device, or against a NAND image file simulated in memory (and
//! optionally written back afterward), which makes it handy for examining images offline.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nandftl::nand::mtd::MtdNand;
use nandftl::{
    ftl::{BlockDevice, BlockTag, MountOptions, NandDisk, SECTOR_SIZE},
    nand::{Nand, NandLayout, SimNand},
    util::{hexdump, ReadExt},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES[xECC]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done, including any changes made by mounting it
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)
                    .with_context(|| format!("loading {}", path.display()))?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// Dispatch to whichever NAND was opened
macro_rules! dispatch {
    ($self:expr, $nand:ident => $call:expr) => {
        match $self {
            NandImpl::Sim($nand) => $call,

            #[cfg(target_os = "linux")]
            NandImpl::Mtd($nand) => $call,
        }
    };
}

impl Nand for NandImpl {
    fn init(&mut self) -> Result<NandLayout> {
        dispatch!(self, nand => nand.init())
    }

    fn deinit(&mut self) -> Result<()> {
        dispatch!(self, nand => nand.deinit())
    }

    fn read_page(&mut self, block: u32, page: u32, content: &mut [u8]) -> Result<u32> {
        dispatch!(self, nand => nand.read_page(block, page, content))
    }

    fn write_page(&mut self, block: u32, page: u32, content: &[u8]) -> Result<()> {
        dispatch!(self, nand => nand.write_page(block, page, content))
    }

    fn is_dirty_page(&mut self, block: u32, page: u32) -> bool {
        dispatch!(self, nand => nand.is_dirty_page(block, page))
    }

    fn is_valid_block(&mut self, block: u32) -> bool {
        dispatch!(self, nand => nand.is_valid_block(block))
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        dispatch!(self, nand => nand.erase(block))
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        dispatch!(self, nand => nand.mark_bad(block))
    }

    fn get_layout(&self) -> NandLayout {
        dispatch!(self, nand => nand.get_layout())
    }
}

#[derive(Args, Debug)]
struct FtlOptions {
    /// Number of logical blocks to expose (default: leave 1/16 of the device spare)
    #[clap(long)]
    logical_blocks: Option<u16>,

    /// Fail instead of formatting a device that holds no checkpoint
    #[clap(long)]
    no_format: bool,
}

impl FtlOptions {
    fn mount_options(&self) -> MountOptions {
        let options = MountOptions::new().auto_format(!self.no_format);
        match self.logical_blocks {
            Some(blocks) => options.logical_blocks(blocks),
            None => options,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount the device and summarize its state
    Info,

    /// Erase the whole device and write an empty checkpoint
    Format,

    /// Read sectors, as a hex dump or into a file
    Read {
        /// First sector to read
        sector: u64,

        /// Number of sectors
        #[clap(default_value_t = 1)]
        count: u64,

        /// Write the sectors to this file instead of dumping them
        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Write a file to the disk, starting at a sector; the last sector is padded with 0xFF
    Write {
        /// First sector to write
        sector: u64,

        /// The file to write
        path: PathBuf,
    },

    /// Verify the mapping tables, then force a checkpoint
    Check,

    /// Print what every physical block is used for
    ///
    /// Mounting may still change the device first, by finishing recovery or by formatting it
    /// unless --no-format is given.
    Map,
}

impl Command {
    fn execute(self, nand: NandImpl, ftl: &FtlOptions) -> Result<NandImpl> {
        let options = ftl.mount_options();

        let mut disk = match self {
            Command::Format => NandDisk::format(nand, &options)?,
            _ => NandDisk::mount(nand, &options)?,
        };

        match self {
            Command::Info | Command::Format => {
                let geo = disk.geometry();
                println!(
                    "Physical: {} blocks x {} pages x {} bytes",
                    geo.physical_blocks, geo.pages_per_block, geo.page_size
                );
                println!(
                    "Logical:  {} blocks, {} sectors of {} bytes",
                    geo.logical_blocks,
                    disk.sector_count(),
                    disk.sector_size()
                );
                println!(
                    "Blocks:   {} free, {} bad",
                    disk.free_blocks(),
                    disk.bad_blocks()
                );
                println!("P2LN:     block {}", disk.p2ln_block());
                println!(
                    "OP log:   block {}, {} record(s)",
                    disk.op_block(),
                    disk.op_offset()
                );
            }

            Command::Read {
                sector,
                count,
                output,
            } => {
                let len = usize::try_from(count)? * SECTOR_SIZE;
                let mut buf = vec![0u8; len];
                disk.read_sectors(sector, &mut buf)?;

                match output {
                    Some(path) => File::create(path)?.write_all(&buf)?,
                    None => print!("{}", hexdump(sector * SECTOR_SIZE as u64, &buf)),
                }
            }

            Command::Write { sector, path } => {
                let room = disk.sector_count().saturating_sub(sector);
                let data = File::open(&path)?.read_sectors(room)?;
                disk.write_sectors(sector, &data)?;
                println!(
                    "Wrote {} sector(s) from {}",
                    data.len() / SECTOR_SIZE,
                    path.display()
                );
            }

            Command::Check => {
                disk.check_consistency()?;
                disk.checkpoint()?;
                disk.check_consistency()?;
                println!("OK, checkpoint now in block {}", disk.p2ln_block());
            }

            Command::Map => {
                for (pba, tag) in disk.block_tags() {
                    let desc = match tag {
                        BlockTag::Free => "free".to_string(),
                        BlockTag::Bad => "BAD".to_string(),
                        BlockTag::OpTable => "OP log".to_string(),
                        BlockTag::P2ln => "checkpoint".to_string(),
                        BlockTag::Data(lba) => format!("LBA {lba}"),
                    };
                    println!("{pba:5} => {desc}");
                }
            }
        }

        Ok(disk.unmount()?)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How to mount it
    #[clap(flatten)]
    ftl: FtlOptions,

    /// The command to run against the mounted disk
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = args.cmd.execute(nand, &args.ftl)?;
    args.nand.cleanup(nand)?;
    Ok(())
}
