//! Useful traits and other utilities that don't really belong anywhere else.

use std::fmt::Write;
use std::io::{self, Read};

use crate::ftl::SECTOR_SIZE;

pub trait ReadExt {
    /// Read at most `max_sectors` sectors' worth of bytes, stopping early at EOF.
    ///
    /// A trailing partial sector is padded out with 0xFF, the value of erased flash, so the
    /// result is always a whole number of sectors.
    fn read_sectors(&mut self, max_sectors: u64) -> io::Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_sectors(&mut self, max_sectors: u64) -> io::Result<Vec<u8>> {
        let limit = max_sectors.saturating_mul(SECTOR_SIZE as u64);
        let mut vec = Vec::new();
        self.take(limit).read_to_end(&mut vec)?;

        let padded = vec.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        vec.resize(padded, 0xFF);
        Ok(vec)
    }
}

/// Format bytes as a classic 16-bytes-per-line hex dump, addresses starting at `base`
pub fn hexdump(base: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in (0..).zip(bytes.chunks(16)) {
        let _ = write!(out, "{:08x}:", base + line * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }

        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

#[test]
fn test_read_sectors() -> io::Result<()> {
    let data = io::repeat(0xAA).read_sectors(2)?;
    assert_eq!(data, [0xAA; 1024]);

    let data = (&[1u8, 2, 3][..]).read_sectors(8)?;
    assert_eq!(data.len(), 512);
    assert_eq!(&data[..3], [1, 2, 3]);
    assert!(data[3..].iter().all(|&x| x == 0xFF));

    assert!(io::empty().read_sectors(4)?.is_empty());
    Ok(())
}

#[test]
fn test_hexdump() {
    let dump = hexdump(0x200, b"NAND flash\x00\xff\x01\x02\x03\x04xyz");
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(
        lines[0],
        "00000200: 4e 41 4e 44 20 66 6c 61 73 68 00 ff 01 02 03 04  |NAND flash......|"
    );
    assert_eq!(
        lines[1],
        "00000210: 78 79 7a                                         |xyz|"
    );
}
