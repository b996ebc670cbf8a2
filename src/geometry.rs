//! Physical layout of the NAND flash device under inspection.
//!
//! The tool targets dumps of an ST-Micro NAND512W3A2C as used on the CPX00:
//! 4096 blocks of 32 pages, each page 512 data bytes plus 16 spare bytes.
//! The geometry is a fixed configuration object; nothing about it is
//! negotiated at runtime.

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceGeometry {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page_main: u32,
    pub bytes_per_page_spare: u32,
}

/// The NAND512W3A2C layout the CPX00 ships with.
pub const NAND512: DeviceGeometry = DeviceGeometry {
    blocks: 4096,
    pages_per_block: 32,
    bytes_per_page_main: 512,
    bytes_per_page_spare: 16,
};

impl DeviceGeometry {
    /// Bytes in one page, spare area included.
    pub const fn bytes_per_page(&self) -> u32 {
        self.bytes_per_page_main + self.bytes_per_page_spare
    }

    /// Bytes in one block, spare areas included.
    pub const fn bytes_per_block(&self) -> u32 {
        self.pages_per_block * self.bytes_per_page()
    }

    /// Total bytes in a dump of the whole device.
    pub const fn total_bytes(&self) -> u64 {
        self.blocks as u64 * self.bytes_per_block() as u64
    }

    /// Offset, within a block, of the factory bad-block marker: the 6th
    /// byte of the spare area of page 0.
    pub const fn bad_marker_offset(&self) -> u32 {
        self.bytes_per_page_main + 5
    }
}

#[test]
fn test_nand512_derived_sizes() {
    assert_eq!(NAND512.bytes_per_page(), 528);
    assert_eq!(NAND512.bytes_per_block(), 16896);
    assert_eq!(NAND512.bad_marker_offset(), 517);
    assert_eq!(NAND512.total_bytes(), 69_206_016);
}
