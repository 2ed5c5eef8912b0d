/// Settings that control how a NAND device is mounted
///
/// Built in the usual builder style:
///
/// ```
/// # use nandftl::ftl::MountOptions;
/// let options = MountOptions::new().logical_blocks(60).auto_format(false);
/// ```
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub(crate) logical_blocks: Option<u16>,
    pub(crate) auto_format: bool,
    pub(crate) relocate_margin: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            logical_blocks: None,
            auto_format: true,
            relocate_margin: 2,
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logical blocks to expose (default: physical blocks minus max(4, blocks/16))
    pub fn logical_blocks(mut self, blocks: u16) -> Self {
        self.logical_blocks = Some(blocks);
        self
    }

    /// Whether to format a device that holds no recognizable checkpoint (default: true)
    pub fn auto_format(mut self, enable: bool) -> Self {
        self.auto_format = enable;
        self
    }

    /// Relocate a block once a read needs more than `ecc_strength - margin` corrections
    /// (default: 2)
    pub fn relocate_margin(mut self, margin: u32) -> Self {
        self.relocate_margin = margin;
        self
    }

    /// The logical block count for a device with `physical` blocks
    pub(crate) fn logical_blocks_for(&self, physical: u16) -> u16 {
        self.logical_blocks
            .unwrap_or_else(|| physical.saturating_sub((physical / 16).max(4)))
    }
}

#[test]
fn test_default_logical_blocks() {
    let options = MountOptions::new();
    assert_eq!(options.logical_blocks_for(64), 60);
    assert_eq!(options.logical_blocks_for(1024), 960);
    assert_eq!(options.logical_blocks_for(3), 0);
    assert_eq!(
        MountOptions::new()
            .logical_blocks(10)
            .logical_blocks_for(1024),
        10
    );
}
