//! This module contains the code necessary to read and write the two on-flash structures the FTL
//! owns: the checkpoint header at page 0 of the P2LN block, and the operation records appended,
//! one per page, to the OP block.
//!
//! Both are little-endian. Bytes past the end of a structure are left erased (0xFF).

use crc::{Crc, CRC_16_IBM_3740};
use deku::prelude::*;

/// "PTOL"
pub const P2LN_MAGIC: u32 = 0x5054_4F4C;
/// Format version 1.00
pub const P2LN_VERSION: u32 = 0x0100_0000;

/// Size of one operation record, in bytes
pub const OP_RECORD_LEN: usize = 16;

/// Protects the RELINK record, the one record that fills all 16 bytes
const RELINK_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const RELINK_CHECKED_LEN: usize = OP_RECORD_LEN - std::mem::size_of::<u16>();

/// The raw checkpoint header, exactly as laid out on flash
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct P2lnHdr {
    magic: u32,
    version: u32,
    op_block: u16,
    old_op_block: u16,
    old_p2ln: u16,
    reserved: u16,
    blocks: u32,
}

/// The raw operation record, tagged 'L', 'R' or 'P'
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(type = "u32", endian = "little")]
enum OpHdr {
    #[deku(id = "0x4C")]
    Link { lba: u16, pba: u16 },

    #[deku(id = "0x52")]
    Relink {
        lba: u16,
        old_pba: u16,
        new_pba: u16,
        start_page: u16,
        page_count: u16,
        check_mark: u16,
    },

    #[deku(id = "0x50")]
    P2ln {
        old_p2ln: u16,
        old_op: u16,
        new_p2ln: u16,
        new_op: u16,
    },
}

/// Copy `bytes` into the front of `out_bytes`
fn place(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// The fields of a checkpoint header that matter once magic and version have been checked
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Checkpoint {
    /// The OP block that logs changes made after this checkpoint
    pub op_block: u16,

    /// The OP block this checkpoint superseded (equal to `op_block` for a fresh format)
    pub old_op_block: u16,

    /// The P2LN block this checkpoint superseded (equal to its own block for a fresh format)
    pub old_p2ln: u16,

    /// Physical block count of the device that was formatted
    pub blocks: u32,
}

impl Checkpoint {
    /// Convert from a byte slice
    ///
    /// Returns `None` unless the magic and version are recognized.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, hdr) = P2lnHdr::from_bytes((bytes, 0)).ok()?;
        if (hdr.magic, hdr.version) != (P2LN_MAGIC, P2LN_VERSION) {
            return None;
        }

        let P2lnHdr {
            op_block,
            old_op_block,
            old_p2ln,
            blocks,
            ..
        } = hdr;
        Some(Self {
            op_block,
            old_op_block,
            old_p2ln,
            blocks,
        })
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let Checkpoint {
            op_block,
            old_op_block,
            old_p2ln,
            blocks,
        } = self;
        let hdr = P2lnHdr {
            magic: P2LN_MAGIC,
            version: P2LN_VERSION,
            op_block,
            old_op_block,
            old_p2ln,
            reserved: 0xFFFF,
            blocks,
        };
        place(&hdr.to_bytes()?, out_bytes)
    }
}

/// The block pairs involved in replacing the current checkpoint with a new one
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Swap {
    pub old_p2ln: u16,
    pub old_op: u16,
    pub new_p2ln: u16,
    pub new_op: u16,
}

/// One mapping mutation, as recorded in the OP block
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Op {
    /// A previously-unmapped logical block got its first physical block
    Link { lba: u16, pba: u16 },

    /// A logical block moved to a new physical block; `old_pba` is released
    Relink {
        lba: u16,
        old_pba: u16,
        new_pba: u16,
        start_page: u16,
        page_count: u16,
    },

    /// A checkpoint swap began
    P2lnSwap(Swap),
}

impl Op {
    /// Convert from a byte slice
    ///
    /// Returns `None` for anything that isn't an intact record, which marks the end of the log.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, hdr) = OpHdr::from_bytes((bytes, 0)).ok()?;

        let op = match hdr {
            OpHdr::Link { lba, pba } => Self::Link { lba, pba },
            OpHdr::Relink {
                lba,
                old_pba,
                new_pba,
                start_page,
                page_count,
                check_mark,
            } => {
                let checked = bytes.get(..RELINK_CHECKED_LEN)?;
                if RELINK_CRC.checksum(checked) != check_mark {
                    return None;
                }
                Self::Relink {
                    lba,
                    old_pba,
                    new_pba,
                    start_page,
                    page_count,
                }
            }
            OpHdr::P2ln {
                old_p2ln,
                old_op,
                new_p2ln,
                new_op,
            } => Self::P2lnSwap(Swap {
                old_p2ln,
                old_op,
                new_p2ln,
                new_op,
            }),
        };

        Some(op)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let hdr = match self {
            Self::Link { lba, pba } => OpHdr::Link { lba, pba },
            Self::Relink {
                lba,
                old_pba,
                new_pba,
                start_page,
                page_count,
            } => {
                let unchecked = OpHdr::Relink {
                    lba,
                    old_pba,
                    new_pba,
                    start_page,
                    page_count,
                    check_mark: 0,
                }
                .to_bytes()?;
                OpHdr::Relink {
                    lba,
                    old_pba,
                    new_pba,
                    start_page,
                    page_count,
                    check_mark: RELINK_CRC.checksum(&unchecked[..RELINK_CHECKED_LEN]),
                }
            }
            Self::P2lnSwap(Swap {
                old_p2ln,
                old_op,
                new_p2ln,
                new_op,
            }) => OpHdr::P2ln {
                old_p2ln,
                old_op,
                new_p2ln,
                new_op,
            },
        };
        place(&hdr.to_bytes()?, out_bytes)
    }
}

#[test]
fn test_checkpoint_layout() -> anyhow::Result<()> {
    let cp = Checkpoint {
        op_block: 3,
        old_op_block: 1,
        old_p2ln: 0,
        blocks: 64,
    };

    let mut buf = vec![0xFFu8; 2048];
    cp.encode(&mut buf)?;
    assert_eq!(&buf[..4], b"LOTP");
    assert_eq!(&buf[4..8], &[0x00, 0x00, 0x00, 0x01]);
    assert_eq!(&buf[8..14], &[3, 0, 1, 0, 0, 0]);
    assert_eq!(&buf[16..20], &[64, 0, 0, 0]);
    assert!(buf[20..].iter().all(|&x| x == 0xFF));
    assert_eq!(Checkpoint::decode(&buf), Some(cp));

    // Wrong version is not ours
    buf[7] = 0x02;
    assert_eq!(Checkpoint::decode(&buf), None);

    // Neither is an erased page
    assert_eq!(Checkpoint::decode(&[0xFFu8; 2048]), None);
    Ok(())
}

#[test]
fn test_op_records() -> anyhow::Result<()> {
    let link = Op::Link { lba: 7, pba: 300 };
    let relink = Op::Relink {
        lba: 7,
        old_pba: 300,
        new_pba: 12,
        start_page: 4,
        page_count: 2,
    };
    let swap = Op::P2lnSwap(Swap {
        old_p2ln: 1,
        old_op: 2,
        new_p2ln: 9,
        new_op: 10,
    });

    let mut buf = vec![0xFFu8; 2048];
    link.encode(&mut buf)?;
    assert_eq!(&buf[..8], &[b'L', 0, 0, 0, 7, 0, 0x2C, 0x01]);
    assert_eq!(Op::decode(&buf), Some(link));

    for op in [relink, swap] {
        let mut buf = vec![0xFFu8; 2048];
        op.encode(&mut buf)?;
        assert!(buf[OP_RECORD_LEN..].iter().all(|&x| x == 0xFF));
        assert_eq!(Op::decode(&buf), Some(op));
    }

    // A torn RELINK is rejected
    let mut buf = vec![0xFFu8; 2048];
    relink.encode(&mut buf)?;
    buf[6] ^= 0x01;
    assert_eq!(Op::decode(&buf), None);

    // An erased page ends the log
    assert_eq!(Op::decode(&[0xFFu8; 2048]), None);
    Ok(())
}
