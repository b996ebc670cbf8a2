//! Decoding and cross-validation of the device's Bad Block Map.
//!
//! FlashFX reserves a group of blocks at the end of the device for
//! bad-block replacement and stores two redundant BBM header copies there:
//! a "low" table (status word 0x0000) followed by a "high" table (status
//! word 0xFFFF). Each header carries a replacement map of 32-bit slots,
//! one per reserved block. The two maps must agree with each other and
//! with the factory bad-block markers scanned from the blocks themselves;
//! this module decodes both copies and reconciles the three data sets.

pub mod headers;
pub mod scan;
pub mod validate;

pub use headers::{BbmHeader, Marker, RawBbmHeader};
pub use scan::decode_headers;
pub use validate::{cross_validate, ValidationSummary};

#[cfg(test)]
pub(crate) mod testimg {
    //! Synthetic device images for tests.

    use super::headers::{RawBbmHeader, BBM_SIGNATURE};
    use crate::cursor::ByteCursor;
    use crate::geometry::DeviceGeometry;

    use bytes::{BufMut, BytesMut};
    use deku::DekuContainerWrite;
    use std::io;

    /// A plausible fixed field block for one header copy.
    pub(crate) fn fields(status: u16, spare_blocks: u16) -> RawBbmHeader {
        use super::headers::*;

        RawBbmHeader {
            data_blocks: EXPECTED_DATA_BLOCKS,
            block_size: EXPECTED_BLOCK_SIZE,
            status,
            data_blocks_copy: EXPECTED_DATA_BLOCKS,
            block_size_copy: EXPECTED_BLOCK_SIZE,
            map_size: EXPECTED_MAP_SIZE,
            in_progress_idx: EXPECTED_IN_PROGRESS,
            spare_blocks,
            spare_blocks_copy: spare_blocks,
            reserved: EXPECTED_RESERVED,
        }
    }

    /// Builds an erased (all-0xFF) image and splices test content into it.
    pub(crate) struct ImageBuilder {
        bytes: Vec<u8>,
    }

    impl ImageBuilder {
        pub(crate) fn erased(len: usize) -> Self {
            Self {
                bytes: vec![0xFF; len],
            }
        }

        pub(crate) fn for_geometry(geometry: &DeviceGeometry) -> Self {
            Self::erased(geometry.total_bytes() as usize)
        }

        /// Set the factory bad-block marker of `block`.
        pub(crate) fn mark_bad(&mut self, geometry: &DeviceGeometry, block: u32) -> &mut Self {
            let offset = block * geometry.bytes_per_block() + geometry.bad_marker_offset();
            self.bytes[offset as usize] = 0x00;
            self
        }

        /// Write a BBM header (signature, fields, map) at `offset`.
        pub(crate) fn header(
            &mut self,
            offset: usize,
            fields: &RawBbmHeader,
            map: &[u32],
        ) -> &mut Self {
            let mut segment = BytesMut::new();
            segment.put_slice(&BBM_SIGNATURE);
            segment.put_slice(&fields.to_bytes().unwrap());
            for &slot in map {
                segment.put_u32_le(slot);
            }

            self.bytes[offset..offset + segment.len()].copy_from_slice(&segment);
            self
        }

        pub(crate) fn into_cursor(self) -> ByteCursor<io::Cursor<Vec<u8>>> {
            ByteCursor::new(io::Cursor::new(self.bytes)).unwrap()
        }

        pub(crate) fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }
}
