//! TFRecord framing
//!
//! Each record on disk is laid out as
//!
//! ```text
//! u64   length (little endian)
//! u32   masked crc32c of the length bytes
//! [u8]  data[length]
//! u32   masked crc32c of the data
//! ```
//!
//! The reader yields raw record payloads; decoding them is left to
//! [`crate::dataset::example`]. The writer is used for TensorBoard event
//! files and for test fixtures.

use std::io::{self, Read, Write};

use crate::utils::error::{Result, XrayError};

const MASK_DELTA: u32 = 0xa282_ead8;
const HEADER_LEN: usize = 12;
const FOOTER_LEN: usize = 4;

/// Masked CRC32-C as used by TFRecord files
pub fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(bytes);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Streaming reader over TFRecord frames
pub struct TfRecordReader<R> {
    reader: R,
    verify_checksums: bool,
    offset: u64,
    finished: bool,
}

impl<R: Read> TfRecordReader<R> {
    /// Create a reader that verifies both checksums of every record
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            verify_checksums: true,
            offset: 0,
            finished: false,
        }
    }

    /// Enable or disable checksum verification
    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Byte offset of the next record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read until `buf` is full or the stream ends, returning bytes read
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    fn read_exact_or_truncated(&mut self, buf: &mut [u8], record_start: u64) -> Result<()> {
        if self.fill(buf)? < buf.len() {
            return Err(XrayError::TruncatedRecord {
                offset: record_start,
            });
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let start = self.offset;
        let mut header = [0u8; HEADER_LEN];
        match self.fill(&mut header)? {
            0 => return Ok(None),
            n if n < HEADER_LEN => return Err(XrayError::TruncatedRecord { offset: start }),
            _ => {}
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[..8]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&header[8..]);

        if self.verify_checksums && masked_crc32c(&len_bytes) != u32::from_le_bytes(crc_bytes) {
            return Err(XrayError::CorruptedRecord {
                offset: start,
                what: "length",
            });
        }

        let len = usize::try_from(u64::from_le_bytes(len_bytes)).map_err(|_| {
            XrayError::CorruptedRecord {
                offset: start,
                what: "length",
            }
        })?;

        // bounded by the bytes present, not the claimed length
        let mut data = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut data)?;
        if data.len() < len {
            return Err(XrayError::TruncatedRecord { offset: start });
        }

        let mut footer = [0u8; FOOTER_LEN];
        self.read_exact_or_truncated(&mut footer, start)?;

        if self.verify_checksums && masked_crc32c(&data) != u32::from_le_bytes(footer) {
            return Err(XrayError::CorruptedRecord {
                offset: start,
                what: "data",
            });
        }

        self.offset += (HEADER_LEN + len + FOOTER_LEN) as u64;
        Ok(Some(data))
    }
}

impl<R: Read> Iterator for TfRecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Writer producing TFRecord frames
pub struct TfRecordWriter<W: Write> {
    writer: W,
}

impl<W: Write> TfRecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append one record
    pub fn write_record(&mut self, data: &[u8]) -> Result<()> {
        let len = (data.len() as u64).to_le_bytes();
        self.writer.write_all(&len)?;
        self.writer.write_all(&masked_crc32c(&len).to_le_bytes())?;
        self.writer.write_all(data)?;
        self.writer.write_all(&masked_crc32c(data).to_le_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(records: &[&[u8]]) -> Vec<u8> {
        let mut writer = TfRecordWriter::new(Vec::new());
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_masked_crc_known_values() {
        assert_eq!(crc32c::crc32c(b"123456789"), 0xE306_9283);
        assert_eq!(masked_crc32c(b"123456789"), 0xC78A_B0E5);
        assert_eq!(masked_crc32c(b"hello"), 0x191C_1FBB);
    }

    #[test]
    fn test_frame_layout() {
        let bytes = encode(&[b"hello"]);
        assert_eq!(bytes.len(), HEADER_LEN + 5 + FOOTER_LEN);
        assert_eq!(&bytes[..8], &5u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x3E04_B2EAu32.to_le_bytes());
        assert_eq!(&bytes[12..17], b"hello");
    }

    #[test]
    fn test_reads_all_records_in_order() {
        let bytes = encode(&[b"first", b"", b"third record"]);
        let records: Vec<Vec<u8>> = TfRecordReader::new(Cursor::new(bytes))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, vec![b"first".to_vec(), Vec::new(), b"third record".to_vec()]);
    }

    #[test]
    fn test_empty_stream_yields_nothing() {
        let mut reader = TfRecordReader::new(Cursor::new(Vec::new()));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_truncated_record_is_reported() {
        let mut bytes = encode(&[b"complete", b"cut short"]);
        bytes.truncate(bytes.len() - 6);
        let mut reader = TfRecordReader::new(Cursor::new(bytes));

        assert_eq!(reader.next().unwrap().unwrap(), b"complete");
        let second_offset = reader.offset();
        match reader.next() {
            Some(Err(XrayError::TruncatedRecord { offset })) => assert_eq!(offset, second_offset),
            other => panic!("expected truncation, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_partial_header_is_truncation() {
        let mut bytes = encode(&[b"abc"]);
        bytes.extend_from_slice(&[1, 2, 3]);
        let results: Vec<_> = TfRecordReader::new(Cursor::new(bytes)).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(XrayError::TruncatedRecord { .. })));
    }

    #[test]
    fn test_flipped_data_byte_is_detected() {
        let mut bytes = encode(&[b"payload"]);
        bytes[HEADER_LEN + 2] ^= 0x40;
        let result = TfRecordReader::new(Cursor::new(bytes.clone())).next().unwrap();
        assert!(matches!(
            result,
            Err(XrayError::CorruptedRecord { what: "data", .. })
        ));

        // Without verification the altered payload is returned as-is
        let unchecked = TfRecordReader::new(Cursor::new(bytes))
            .with_checksums(false)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(unchecked.len(), 7);
    }

    #[test]
    fn test_flipped_length_byte_is_detected() {
        let mut bytes = encode(&[b"payload"]);
        bytes[0] ^= 0x01;
        let result = TfRecordReader::new(Cursor::new(bytes)).next().unwrap();
        assert!(matches!(
            result,
            Err(XrayError::CorruptedRecord { what: "length", .. })
        ));
    }

    #[test]
    fn test_huge_length_without_checksums_is_truncated() {
        let mut bytes = (1u64 << 46).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(b"short");

        let result = TfRecordReader::new(Cursor::new(bytes))
            .with_checksums(false)
            .next()
            .unwrap();
        assert!(matches!(result, Err(XrayError::TruncatedRecord { offset: 0 })));
    }
}
