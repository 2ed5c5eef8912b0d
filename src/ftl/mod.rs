//! A log-structured flash translation layer, presenting a [Nand](crate::nand::Nand) as a
//! sector-addressed [BlockDevice].
//!
//! Each logical block lives in exactly one physical block at a time. Rewriting pages that already
//! hold data moves the logical block to a freshly erased physical block; every such move is
//! recorded in the replay log (the OP block) before the in-memory tables change, and the tables
//! are periodically checkpointed to a P2LN block so the log stays short. Mounting replays the log
//! on top of the newest trustworthy checkpoint and completes any checkpoint swap that power loss
//! interrupted.
//!
//! ```
//! use nandftl::ftl::{MountOptions, NandDisk};
//! use nandftl::nand::SimNand;
//!
//! # fn main() -> anyhow::Result<()> {
//! let nand = SimNand::new("64x64x2048".parse()?);
//! let mut disk = NandDisk::mount(nand, &MountOptions::new())?;
//!
//! disk.write_sectors(0, &[0xAA; 512])?;
//! let mut buf = [0u8; 512];
//! disk.read_sectors(0, &mut buf)?;
//! assert_eq!(buf, [0xAA; 512]);
//! # Ok(())
//! # }
//! ```

mod alloc;
mod checkpoint;
mod config;
mod dirty;
mod disk;
mod error;
mod map;
mod media;
mod mount;
mod oplog;
mod read;
mod records;
mod write;

#[cfg(test)]
mod tests;

pub use config::MountOptions;
pub use disk::{BlockDevice, Geometry, NandDisk, SECTOR_SIZE};
pub use error::{FtlError, Result};
pub use map::BlockTag;
pub use records::{Checkpoint, Op, Swap};
