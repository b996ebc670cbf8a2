//! Sequential, seekable access to the device image.
//!
//! Every analysis pass does its own independent linear read over the image,
//! so the cursor stays deliberately simple: an absolute position, one byte
//! at a time, and `Ok(None)` once the data runs out.

use std::io::{self, ErrorKind, Read, Seek, SeekFrom};

/// Absolute position within the device image.
pub type ByteOffset = u32;

/// A byte-at-a-time reader over a finite byte source.
#[derive(Debug)]
pub struct ByteCursor<R> {
    inner: R,
    pos: ByteOffset,
    len: ByteOffset,
}

impl<R: Read + Seek> ByteCursor<R> {
    /// Wrap an open byte source, measuring its total length up front.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        let len = ByteOffset::try_from(len)
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "image larger than 4 GiB"))?;
        inner.seek(SeekFrom::Start(0))?;

        Ok(Self { inner, pos: 0, len })
    }

    /// Reposition exactly to `offset`.
    pub fn seek(&mut self, offset: ByteOffset) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(u64::from(offset)))?;
        self.pos = offset;
        Ok(())
    }

    /// Current absolute offset; advances by one per byte read.
    pub fn position(&self) -> ByteOffset {
        self.pos
    }

    /// Total length of the byte source.
    pub fn len(&self) -> ByteOffset {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the next byte, or `Ok(None)` at end of data.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.pos += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Fill `buf` completely, or return `Ok(false)` if the data ends first.
    ///
    /// The position advances by however many bytes were actually read.
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.pos += filled as ByteOffset;
                    return Ok(false);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
        self.pos += filled as ByteOffset;
        Ok(true)
    }
}

#[test]
fn test_read_and_position() -> io::Result<()> {
    let mut cursor = ByteCursor::new(io::Cursor::new(vec![0x10, 0x20, 0x30]))?;
    assert_eq!(cursor.len(), 3);
    assert_eq!(cursor.position(), 0);
    assert_eq!(cursor.read_byte()?, Some(0x10));
    assert_eq!(cursor.position(), 1);
    assert_eq!(cursor.read_byte()?, Some(0x20));
    assert_eq!(cursor.read_byte()?, Some(0x30));
    assert_eq!(cursor.read_byte()?, None);
    assert_eq!(cursor.position(), 3);
    Ok(())
}

#[test]
fn test_seek() -> io::Result<()> {
    let mut cursor = ByteCursor::new(io::Cursor::new(vec![0, 1, 2, 3, 4]))?;
    cursor.seek(3)?;
    assert_eq!(cursor.position(), 3);
    assert_eq!(cursor.read_byte()?, Some(3));
    cursor.seek(0)?;
    assert_eq!(cursor.read_byte()?, Some(0));
    Ok(())
}

#[test]
fn test_read_into_short() -> io::Result<()> {
    let mut cursor = ByteCursor::new(io::Cursor::new(vec![7, 8]))?;
    let mut buf = [0u8; 4];
    assert!(!cursor.read_into(&mut buf)?);
    assert_eq!(cursor.position(), 2);

    cursor.seek(0)?;
    let mut buf = [0u8; 2];
    assert!(cursor.read_into(&mut buf)?);
    assert_eq!(buf, [7, 8]);
    Ok(())
}
