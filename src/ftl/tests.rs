//! End-to-end tests of the FTL against a simulated NAND.

use std::io::{Seek, SeekFrom};

use anyhow::{bail, Context};

use super::*;
use crate::nand::{Nand, NandLayout, SimNand};

const SMALL_LAYOUT: NandLayout = NandLayout {
    blocks: 32,
    pages_per_block: 16,
    bytes_per_page: 2048,
    ecc_strength: 8,
};

/// Deterministic, non-repeating test data
fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as u8
        })
        .collect()
}

fn small_disk(logical_blocks: u16) -> anyhow::Result<(NandDisk<SimNand>, MountOptions)> {
    let options = MountOptions::new().logical_blocks(logical_blocks);
    let disk = NandDisk::mount(SimNand::new(SMALL_LAYOUT), &options)?;
    Ok((disk, options))
}

fn remount(disk: NandDisk<SimNand>, options: &MountOptions) -> anyhow::Result<NandDisk<SimNand>> {
    let nand = disk.unmount()?;
    Ok(NandDisk::mount(nand, options)?)
}

/// What the whole disk should read back as
struct Model(Vec<u8>);

impl Model {
    fn new(disk: &NandDisk<SimNand>) -> Self {
        Self(vec![0xFF; disk.sector_count() as usize * SECTOR_SIZE])
    }

    fn write(&mut self, sector: u64, data: &[u8]) {
        self.0[sector as usize * SECTOR_SIZE..][..data.len()].copy_from_slice(data);
    }

    /// Compare against the disk, accepting either old or new content for the sectors of a write
    /// that was interrupted
    fn verify(
        &self,
        disk: &mut NandDisk<SimNand>,
        torn: Option<(u64, &[u8])>,
    ) -> anyhow::Result<()> {
        let mut actual = vec![0u8; self.0.len()];
        disk.read_sectors(0, &mut actual)?;

        let sectors = actual.chunks(SECTOR_SIZE).zip(self.0.chunks(SECTOR_SIZE));
        for (sector, (got, want)) in (0u64..).zip(sectors) {
            if got == want {
                continue;
            }
            if let Some((start, data)) = torn {
                let new = sector
                    .checked_sub(start)
                    .and_then(|i| data.chunks(SECTOR_SIZE).nth(i as usize));
                if new == Some(got) {
                    continue;
                }
            }
            bail!("sector {sector} holds unexpected data");
        }

        Ok(())
    }
}

#[test]
fn test_example_scenario() -> anyhow::Result<()> {
    let mut disk = NandDisk::mount(SimNand::new("64x64x2048".parse()?), &MountOptions::new())?;
    assert_eq!(disk.geometry().logical_blocks, 60);

    disk.write_sectors(0, &[0xAA; 512])?;
    let mut sector = [0u8; 512];
    disk.read_sectors(0, &mut sector)?;
    assert_eq!(sector, [0xAA; 512]);

    let incrementing: Vec<u8> = (0..2048).map(|i| i as u8).collect();
    disk.write_sectors(0, &incrementing)?;
    disk.write_sectors(1, &[0xBB; 512])?;

    let mut page = vec![0u8; 2048];
    disk.read_sectors(0, &mut page)?;
    assert_eq!(page[..512], incrementing[..512]);
    assert_eq!(page[512..1024], [0xBB; 512]);
    assert_eq!(page[1024..], incrementing[1024..]);

    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_round_trip() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let mut model = Model::new(&disk);
    assert_eq!(disk.sector_count(), 24 * 16 * 4);

    // Sub-page, page, multi-page, block-crossing, multi-block, and end-of-disk writes, with
    // overwrites mixed in
    let writes = [
        (0, 1),
        (3, 1),
        (4, 4),
        (6, 5),
        (60, 10),
        (100, 200),
        (5, 3),
        (0, 64),
        (63, 2),
        (1530, 6),
        (150, 1),
        (101, 130),
    ];
    for (seed, &(sector, count)) in (0..).zip(writes.iter()) {
        let data = pattern(seed, count * SECTOR_SIZE);
        disk.write_sectors(sector, &data)?;
        model.write(sector, &data);

        model
            .verify(&mut disk, None)
            .with_context(|| format!("after writing {count} sector(s) at {sector}"))?;
        disk.check_consistency()?;
    }

    // Unaligned reads see the same bytes
    let mut buf = vec![0u8; 7 * SECTOR_SIZE];
    disk.read_sectors(61, &mut buf)?;
    assert!(buf == model.0[61 * SECTOR_SIZE..][..buf.len()]);

    let mut disk = remount(disk, &options)?;
    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_unwritten_reads_erased() -> anyhow::Result<()> {
    let (mut disk, _) = small_disk(24)?;
    disk.write_sectors(64, &[0x00; 512])?;

    // Unmapped block, and an unwritten page of a mapped block
    let mut buf = vec![0u8; 8 * SECTOR_SIZE];
    disk.read_sectors(0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0xFF));
    disk.read_sectors(68, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0xFF));
    assert_eq!(disk.lookup(0), None);

    let end = disk.sector_count();
    assert!(matches!(
        disk.read_sectors(end, &mut buf[..512]),
        Err(FtlError::InvalidRequest(_))
    ));
    assert!(matches!(
        disk.write_sectors(0, &[0u8; 100]),
        Err(FtlError::InvalidRequest(_))
    ));
    Ok(())
}

#[test]
fn test_block_update() -> anyhow::Result<()> {
    let (mut disk, _) = small_disk(24)?;
    let mut model = Model::new(&disk);

    // Filling a block one page at a time never needs a new block
    for page in 0..16 {
        let data = pattern(page, 2048);
        disk.write_sectors(page * 4, &data)?;
        model.write(page * 4, &data);
    }
    let first = disk.lookup(0).context("LBA 0 not mapped")?;
    assert_eq!(disk.op_offset(), 1);

    // Once it's full, any rewrite does
    let data = pattern(99, 2048);
    disk.write_sectors(3 * 4, &data)?;
    model.write(3 * 4, &data);

    let second = disk.lookup(0).context("LBA 0 not mapped")?;
    assert_ne!(first, second);
    assert_eq!(disk.op_offset(), 2);
    assert!(disk
        .block_tags()
        .any(|(pba, tag)| pba == first && tag == BlockTag::Free));

    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_ecc_relocation() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let data = pattern(1, 8 * SECTOR_SIZE);
    disk.write_sectors(64, &data)?;
    let worn = disk.lookup(1).context("LBA 1 not mapped")?;

    // Below the threshold, nothing happens
    disk.nand_mut().set_bitflips(worn.into(), 6);
    let mut buf = vec![0u8; data.len()];
    disk.read_sectors(64, &mut buf)?;
    assert_eq!(buf, data);
    assert_eq!(disk.lookup(1), Some(worn));

    // Above it, the block moves and is retired
    disk.nand_mut().set_bitflips(worn.into(), 7);
    disk.read_sectors(64, &mut buf)?;
    assert_eq!(buf, data);
    assert_ne!(disk.lookup(1), Some(worn));
    assert!(!disk.nand_mut().is_valid_block(worn.into()));
    assert_eq!(disk.bad_blocks(), 1);
    disk.check_consistency()?;

    let mut disk = remount(disk, &options)?;
    assert_eq!(disk.bad_blocks(), 1);
    disk.read_sectors(64, &mut buf)?;
    assert_eq!(buf, data);
    Ok(())
}

#[test]
fn test_copy_retry() -> anyhow::Result<()> {
    let (mut disk, _) = small_disk(24)?;
    let mut model = Model::new(&disk);

    disk.write_sectors(128, &[0x11; 512])?;
    model.write(128, &[0x11; 512]);
    let pba = disk.lookup(2).context("LBA 2 not mapped")?;

    // Merging the rest of the page in survives three failed reads...
    disk.nand_mut().fail_reads(pba.into(), 0, 3);
    disk.write_sectors(129, &[0x22; 512])?;
    model.write(129, &[0x22; 512]);
    let pba = disk.lookup(2).context("LBA 2 not mapped")?;

    // ...but not four
    disk.nand_mut().fail_reads(pba.into(), 0, 4);
    assert!(matches!(
        disk.write_sectors(130, &[0x33; 512]),
        Err(FtlError::Io(_))
    ));
    assert_eq!(disk.lookup(2), Some(pba));

    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_checkpoint_on_full_log() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let mut model = Model::new(&disk);
    let initial_p2ln = disk.p2ln_block();

    // One LINK record each; the 14th fills the log up to the checkpoint threshold
    for lba in 0..20u64 {
        let data = pattern(lba, SECTOR_SIZE);
        disk.write_sectors(lba * 64, &data)?;
        model.write(lba * 64, &data);
    }
    assert_ne!(disk.p2ln_block(), initial_p2ln);
    assert_eq!(disk.op_offset(), 6);
    disk.check_consistency()?;

    let mut disk = remount(disk, &options)?;
    assert_eq!(disk.op_offset(), 6);
    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_explicit_checkpoint() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let mut model = Model::new(&disk);

    let data = pattern(7, 40 * SECTOR_SIZE);
    disk.write_sectors(50, &data)?;
    model.write(50, &data);

    let (old_p2ln, old_op) = (disk.p2ln_block(), disk.op_block());
    disk.checkpoint()?;
    assert_eq!(disk.op_offset(), 0);
    assert_ne!(disk.p2ln_block(), old_p2ln);
    assert_ne!(disk.op_block(), old_op);
    disk.check_consistency()?;

    // The superseded blocks were erased and freed
    assert!(!disk.nand_mut().is_dirty_page(old_p2ln.into(), 0));
    assert!(!disk.nand_mut().is_dirty_page(old_op.into(), 0));

    let mut disk = remount(disk, &options)?;
    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_failed_checkpoint_keeps_live_blocks() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let mut model = Model::new(&disk);
    for lba in 0..6u64 {
        let data = pattern(lba, 5 * SECTOR_SIZE);
        disk.write_sectors(lba * 64 + 3, &data)?;
        model.write(lba * 64 + 3, &data);
    }
    let base = disk.unmount()?;

    // Fail each program/erase of the checkpoint in turn, with power coming straight back
    for budget in 0.. {
        let mut disk = NandDisk::mount(base.clone(), &options)?;
        let mut model = Model(model.0.clone());
        let (p2ln, op) = (disk.p2ln_block(), disk.op_block());

        disk.nand_mut().cut_power_after(budget);
        let result = disk.checkpoint();
        disk.nand_mut().restore_power();
        if result.is_ok() {
            assert!(budget > 0);
            break;
        }

        assert_eq!((disk.p2ln_block(), disk.op_block()), (p2ln, op));
        disk.check_consistency()
            .with_context(|| format!("tables after failure at {budget}"))?;

        // Enough writes to cycle through every free block and checkpoint again
        for i in 0..40u64 {
            let sector = (i * 131) % 1500;
            let data = pattern(100 + i, 8 * SECTOR_SIZE);
            disk.write_sectors(sector, &data)?;
            model.write(sector, &data);
        }
        disk.check_consistency()?;
        model
            .verify(&mut disk, None)
            .with_context(|| format!("content after failure at {budget}"))?;

        let mut disk = remount(disk, &options)?;
        disk.check_consistency()?;
        model
            .verify(&mut disk, None)
            .with_context(|| format!("content after failure at {budget} and remount"))?;
    }

    Ok(())
}

#[test]
fn test_fresh_blocks_erased() -> anyhow::Result<()> {
    let (mut disk, _) = small_disk(24)?;
    let erases = |disk: &NandDisk<SimNand>, pba: u16| disk.nand().erase_count(pba.into());

    disk.write_sectors(0, &[0xAA; 512])?;
    let first = disk.lookup(0).context("LBA 0 unmapped")?;
    assert_eq!(erases(&disk, first), 2);

    // Rewriting moves it to another block, which also gets erased first
    disk.write_sectors(0, &[0xBB; 512])?;
    let second = disk.lookup(0).context("LBA 0 unmapped")?;
    assert_ne!(first, second);
    assert_eq!(erases(&disk, second), 2);
    Ok(())
}

#[test]
fn test_format_required() -> anyhow::Result<()> {
    let strict = MountOptions::new().auto_format(false);
    assert!(matches!(
        NandDisk::mount(SimNand::new(SMALL_LAYOUT), &strict),
        Err(FtlError::FormatError)
    ));

    // Once formatted, it mounts without formatting
    let nand = NandDisk::format(SimNand::new(SMALL_LAYOUT), &MountOptions::new())?.unmount()?;
    let disk = NandDisk::mount(nand, &strict)?;
    disk.check_consistency()?;

    // A checkpoint written for a different block count isn't ours
    let mut nand = disk.unmount()?;
    let mut header = vec![0xFFu8; 2048];
    nand.read_page(0, 0, &mut header)?;
    let other = "64x16x2048".parse()?;
    let mut bigger = SimNand::new(other);
    bigger.write_page(0, 0, &header)?;
    assert!(matches!(
        NandDisk::mount(bigger, &strict),
        Err(FtlError::FormatError)
    ));
    Ok(())
}

#[test]
fn test_unsupported_geometry() -> anyhow::Result<()> {
    let err = NandDisk::mount(SimNand::new("64x64x512".parse()?), &MountOptions::new())
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, FtlError::UnsupportedGeometry(_)));
    assert_eq!(err.error_code(), 0xFFFF_C042);
    Ok(())
}

#[test]
fn test_factory_bad_blocks() -> anyhow::Result<()> {
    let mut nand = SimNand::new(SMALL_LAYOUT);
    nand.set_factory_bad(0);
    nand.set_factory_bad(5);

    let options = MountOptions::new().logical_blocks(24);
    let mut disk = NandDisk::mount(nand, &options)?;
    assert_eq!(disk.bad_blocks(), 2);
    assert_ne!(disk.p2ln_block(), 0);

    let mut model = Model::new(&disk);
    for lba in 0..8u64 {
        let data = pattern(lba, 3 * SECTOR_SIZE);
        disk.write_sectors(lba * 64 + 1, &data)?;
        model.write(lba * 64 + 1, &data);
    }
    assert!(disk.block_tags().all(|(pba, tag)| {
        !matches!(pba, 0 | 5) || tag == BlockTag::Bad
    }));

    let mut disk = remount(disk, &options)?;
    model.verify(&mut disk, None)?;
    Ok(())
}

#[test]
fn test_image_persistence() -> anyhow::Result<()> {
    let (mut disk, options) = small_disk(24)?;
    let mut model = Model::new(&disk);
    let data = pattern(3, 150 * SECTOR_SIZE);
    disk.write_sectors(10, &data)?;
    model.write(10, &data);

    let mut file = tempfile::tempfile()?;
    disk.unmount()?.save(&mut file)?;
    file.seek(SeekFrom::Start(0))?;

    let mut nand = SimNand::new(SMALL_LAYOUT);
    nand.load(&mut file)?;
    let mut disk = NandDisk::mount(nand, &options)?;
    model.verify(&mut disk, None)?;
    disk.check_consistency()?;
    Ok(())
}

#[test]
fn test_interrupted_swap_between_alternating_blocks() -> anyhow::Result<()> {
    // Block 5 holds the checkpoint being replaced, and block 8 the one replacing it; block 8 was
    // itself block 5's predecessor, so the two headers name each other.
    let mut nand = SimNand::new(SMALL_LAYOUT);
    let mut page = vec![0xFFu8; 2048];

    Checkpoint {
        op_block: 6,
        old_op_block: 9,
        old_p2ln: 8,
        blocks: 32,
    }
    .encode(&mut page)?;
    nand.write_page(5, 0, &page)?;

    let mut snapshot = vec![0xFFu8; 2048];
    snapshot[10..12].copy_from_slice(&0xFF55u16.to_le_bytes());
    snapshot[12..14].copy_from_slice(&0xFFAAu16.to_le_bytes());
    snapshot[40..42].copy_from_slice(&0u16.to_le_bytes());
    nand.write_page(5, 1, &snapshot)?;
    nand.write_page(20, 0, &[0x5A; 2048])?;

    let swap = Swap {
        old_p2ln: 5,
        old_op: 6,
        new_p2ln: 8,
        new_op: 9,
    };
    page.fill(0xFF);
    Op::P2lnSwap(swap).encode(&mut page)?;
    nand.write_page(6, 0, &page)?;

    // The new header got written, but the old blocks were never erased; the new block's snapshot
    // is missing too, which doesn't matter as recovery rewrites it
    page.fill(0xFF);
    Checkpoint {
        op_block: 9,
        old_op_block: 6,
        old_p2ln: 5,
        blocks: 32,
    }
    .encode(&mut page)?;
    nand.write_page(8, 0, &page)?;

    let options = MountOptions::new().logical_blocks(24).auto_format(false);
    let mut disk = NandDisk::mount(nand, &options)?;
    assert_eq!(disk.p2ln_block(), 8);
    assert_eq!(disk.op_block(), 9);
    assert_eq!(disk.lookup(0), Some(20));
    disk.check_consistency()?;
    assert!(!disk.nand_mut().is_dirty_page(5, 0));
    assert!(!disk.nand_mut().is_dirty_page(6, 0));

    let mut disk = remount(disk, &options)?;
    assert_eq!(disk.p2ln_block(), 8);
    let mut buf = vec![0u8; 512];
    disk.read_sectors(0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x5A));
    Ok(())
}

#[test]
fn test_power_loss() -> anyhow::Result<()> {
    let options = MountOptions::new().logical_blocks(20);
    let base = NandDisk::mount(SimNand::new(SMALL_LAYOUT), &options)?.unmount()?;

    // Mixed sizes and offsets, including block-spanning writes and rewrites
    let workload: Vec<(u64, Vec<u8>)> = (0..30u64)
        .map(|i| {
            let sector = (i * 97) % 1180;
            let count = 1 + (i as usize * 7) % 90;
            (sector, pattern(i, count * SECTOR_SIZE))
        })
        .collect();

    // How many program/erase operations does the whole workload take?
    let mut disk = NandDisk::mount(base.clone(), &options)?;
    for (sector, data) in &workload {
        disk.write_sectors(*sector, data)?;
    }
    let total = disk.nand().mutations() - base.mutations();
    assert!(total > 100);

    for budget in 0..total {
        let mut disk = NandDisk::mount(base.clone(), &options)?;
        let mut model = Model::new(&disk);
        disk.nand_mut().cut_power_after(budget);

        let mut torn = None;
        for (sector, data) in &workload {
            if disk.write_sectors(*sector, data).is_err() {
                torn = Some((*sector, &data[..]));
                break;
            }
            model.write(*sector, data);
        }
        // Failing to erase superseded checkpoint blocks only warns, so a cut during the final
        // checkpoint's last two erases goes unreported
        assert!(
            torn.is_some() || budget + 2 >= total,
            "power loss at {budget} went unnoticed"
        );

        let mut nand = disk.unmount()?;
        nand.restore_power();
        let mut disk = NandDisk::mount(nand, &options)
            .with_context(|| format!("mount after power loss at {budget}"))?;
        disk.check_consistency()
            .with_context(|| format!("tables after power loss at {budget}"))?;
        model
            .verify(&mut disk, torn)
            .with_context(|| format!("content after power loss at {budget}"))?;

        // The recovered disk keeps working
        disk.write_sectors(0, &[0x42; 512])?;
        let mut disk = remount(disk, &options)?;
        disk.check_consistency()?;
        let mut buf = [0u8; 512];
        disk.read_sectors(0, &mut buf)?;
        assert_eq!(buf, [0x42; 512]);
    }

    Ok(())
}
