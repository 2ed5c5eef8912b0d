//! A flash translation layer that turns raw NAND flash into a sector-addressed block device.

pub mod ftl;
pub mod nand;
pub mod util;
