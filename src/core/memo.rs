// Companion memo stores: .fpt length-prefixed blocks and .dbt fixed blocks.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bstr::ByteSlice;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::field::FieldType;
use crate::core::header::TableLayout;

/// Standard block size for .dbt files.
pub const DBT_BLOCK_SIZE: usize = 0x200;
/// A .fpt file declares its own block size at this offset, big-endian.
const FPT_BLOCK_SIZE_OFFSET: u64 = 6;
const FPT_SUBHEADER_LEN: usize = 8;
/// Two consecutive sentinels terminate a .dbt memo.
const DBT_SENTINEL: u8 = 0x1A;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoVariant {
    /// .fpt: 4-byte little-endian block pointer, length-prefixed blocks.
    LengthPrefixed,
    /// .dbt: 10-byte ASCII decimal block pointer, fixed-size blocks.
    FixedBlock,
}

impl MemoVariant {
    pub fn from_field_length(length: usize) -> Result<Self, Error> {
        match length {
            4 => Ok(MemoVariant::LengthPrefixed),
            10 => Ok(MemoVariant::FixedBlock),
            _ => Err(Error::new(ErrorKind::Format)
                .with_message(format!("unsupported memo field length {length}"))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MemoVariant::LengthPrefixed => "fpt",
            MemoVariant::FixedBlock => "dbt",
        }
    }

    /// Variant required by the layout's exported memo fields, if any.
    pub fn detect(layout: &TableLayout) -> Result<Option<Self>, Error> {
        for field in &layout.fields {
            if field.exported && field.field_type == FieldType::Memo {
                return Self::from_field_length(field.length).map(Some);
            }
        }
        Ok(None)
    }
}

#[derive(Debug)]
pub struct MemoStore {
    file: File,
    variant: MemoVariant,
    block_size: usize,
}

impl MemoStore {
    /// Open the companion memo file next to `table_path` (same base name,
    /// variant-specific extension).
    pub fn open(table_path: &Path, variant: MemoVariant) -> Result<Self, Error> {
        let path = table_path.with_extension(variant.extension());
        if !path.exists() {
            return Err(Error::new(ErrorKind::MissingMemo)
                .with_message("table declares memo fields but the companion file is missing")
                .with_path(path));
        }
        let mut file = File::open(&path)
            .map_err(|err| Error::from(err).with_path(path.clone()))?;

        let block_size = match variant {
            MemoVariant::FixedBlock => DBT_BLOCK_SIZE,
            MemoVariant::LengthPrefixed => {
                file.seek(SeekFrom::Start(FPT_BLOCK_SIZE_OFFSET))
                    .map_err(|err| truncated(err, &path))?;
                let mut raw = [0u8; 2];
                file.read_exact(&mut raw)
                    .map_err(|err| truncated(err, &path))?;
                usize::from(u16::from(raw[0]) << 8 | u16::from(raw[1]))
            }
        };
        if block_size == 0 {
            return Err(Error::new(ErrorKind::Format)
                .with_message("memo block size is zero")
                .with_path(path));
        }

        debug!(path = %path.display(), ?variant, block_size, "opened memo store");
        Ok(Self {
            file,
            variant,
            block_size,
        })
    }

    pub fn variant(&self) -> MemoVariant {
        self.variant
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Resolve one memo pointer (the raw in-record bytes) to its text.
    pub fn resolve(&mut self, pointer: &[u8]) -> Result<String, Error> {
        match self.variant {
            MemoVariant::LengthPrefixed => self.resolve_length_prefixed(pointer),
            MemoVariant::FixedBlock => self.resolve_fixed_block(pointer),
        }
    }

    fn resolve_length_prefixed(&mut self, pointer: &[u8]) -> Result<String, Error> {
        let raw: [u8; 4] = pointer.try_into().map_err(|_| {
            Error::new(ErrorKind::Format).with_message("memo pointer is not 4 bytes")
        })?;
        let index = i32::from_le_bytes(raw);
        if index == 0 {
            return Ok(String::new());
        }
        let offset = block_offset(i64::from(index), self.block_size)?;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut subheader = [0u8; FPT_SUBHEADER_LEN];
        self.file
            .read_exact(&mut subheader)
            .map_err(|err| truncated_read(err))?;
        let length = u32::from_be_bytes([subheader[4], subheader[5], subheader[6], subheader[7]]);

        let mut memo = vec![0u8; length as usize];
        self.file
            .read_exact(&mut memo)
            .map_err(|err| truncated_read(err))?;
        Ok(memo.to_str_lossy().into_owned())
    }

    fn resolve_fixed_block(&mut self, pointer: &[u8]) -> Result<String, Error> {
        let text = pointer.trim();
        if text.is_empty() {
            return Ok(String::new());
        }
        let index: i64 = text.to_str_lossy().parse().map_err(|_| {
            Error::new(ErrorKind::Format).with_message("memo pointer is not an ASCII integer")
        })?;
        if index == 0 {
            return Ok(String::new());
        }
        let offset = block_offset(index, self.block_size)?;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut memo: Vec<u8> = Vec::new();
        let mut block = vec![0u8; self.block_size];
        loop {
            // Resume one byte before the previous scan end so a sentinel pair
            // split across a block boundary is still seen as a pair.
            let scan_from = memo.len().saturating_sub(1);
            self.file
                .read_exact(&mut block)
                .map_err(|err| truncated_read(err))?;
            memo.extend_from_slice(&block);
            if let Some(end) = find_sentinel_pair(&memo, scan_from) {
                memo.truncate(end);
                return Ok(memo.to_str_lossy().into_owned());
            }
        }
    }
}

/// Index of the first sentinel of a `0x1A 0x1A` pair at or after `from`.
/// A lone sentinel as the final byte does not match; the next block decides.
fn find_sentinel_pair(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == DBT_SENTINEL && buf[i + 1] == DBT_SENTINEL {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn block_offset(index: i64, block_size: usize) -> Result<u64, Error> {
    index
        .checked_mul(block_size as i64)
        .and_then(|offset| u64::try_from(offset).ok())
        .ok_or_else(|| {
            Error::new(ErrorKind::Format)
                .with_message(format!("memo block index {index} is out of range"))
        })
}

fn truncated(err: std::io::Error, path: &Path) -> Error {
    Error::new(ErrorKind::TruncatedMemo)
        .with_message("memo file ends before the referenced block")
        .with_path(path)
        .with_source(err)
}

fn truncated_read(err: std::io::Error) -> Error {
    Error::new(ErrorKind::TruncatedMemo)
        .with_message("memo file ends before the referenced block")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{MemoStore, MemoVariant, DBT_BLOCK_SIZE};
    use crate::core::error::ErrorKind;
    use std::path::PathBuf;

    fn write_fixture(dir: &std::path::Path, extension: &str, bytes: &[u8]) -> PathBuf {
        let memo_path = dir.join("table").with_extension(extension);
        std::fs::write(&memo_path, bytes).expect("write memo");
        dir.join("table.dbf")
    }

    fn fpt_fixture(block_size: u16, memo: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; block_size as usize];
        bytes[6..8].copy_from_slice(&block_size.to_be_bytes());
        let mut subheader = [0u8; 8];
        subheader[4..8].copy_from_slice(&(memo.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&subheader);
        bytes.extend_from_slice(memo);
        bytes
    }

    #[test]
    fn fpt_block_size_is_read_big_endian_from_offset_six() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = write_fixture(dir.path(), "fpt", &fpt_fixture(64, b"irrelevant"));
        let store = MemoStore::open(&table, MemoVariant::LengthPrefixed).expect("open");
        assert_eq!(store.block_size(), 64);
    }

    #[test]
    fn fpt_memo_returns_exactly_the_declared_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = fpt_fixture(64, b"hello memo");
        bytes.extend_from_slice(b"trailing garbage");
        let table = write_fixture(dir.path(), "fpt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::LengthPrefixed).expect("open");
        let text = store.resolve(&1i32.to_le_bytes()).expect("resolve");
        assert_eq!(text, "hello memo");
    }

    #[test]
    fn fpt_zero_index_is_empty_without_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = write_fixture(dir.path(), "fpt", &fpt_fixture(64, b""));
        let mut store = MemoStore::open(&table, MemoVariant::LengthPrefixed).expect("open");
        assert_eq!(store.resolve(&0i32.to_le_bytes()).expect("resolve"), "");
    }

    #[test]
    fn fpt_truncated_memo_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0u8; 64];
        bytes[6..8].copy_from_slice(&64u16.to_be_bytes());
        let mut subheader = [0u8; 8];
        subheader[4..8].copy_from_slice(&1000u32.to_be_bytes());
        bytes.extend_from_slice(&subheader);
        bytes.extend_from_slice(b"short");
        let table = write_fixture(dir.path(), "fpt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::LengthPrefixed).expect("open");
        let err = store.resolve(&1i32.to_le_bytes()).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::TruncatedMemo);
    }

    #[test]
    fn dbt_memo_terminates_on_a_sentinel_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0u8; DBT_BLOCK_SIZE];
        let mut block = Vec::from(&b"note text"[..]);
        block.extend_from_slice(&[0x1A, 0x1A]);
        block.resize(DBT_BLOCK_SIZE, 0);
        bytes.extend_from_slice(&block);
        let table = write_fixture(dir.path(), "dbt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::FixedBlock).expect("open");
        let text = store.resolve(b"         1").expect("resolve");
        assert_eq!(text, "note text");
    }

    #[test]
    fn dbt_sentinel_pair_across_a_block_boundary_is_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0u8; DBT_BLOCK_SIZE];
        let mut body = vec![b'x'; DBT_BLOCK_SIZE - 1];
        body.push(0x1A);
        bytes.extend_from_slice(&body);
        let mut next = vec![0x1A];
        next.resize(DBT_BLOCK_SIZE, 0);
        bytes.extend_from_slice(&next);
        let table = write_fixture(dir.path(), "dbt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::FixedBlock).expect("open");
        let text = store.resolve(b"1         ").expect("resolve");
        assert_eq!(text.len(), DBT_BLOCK_SIZE - 1);
        assert!(text.bytes().all(|byte| byte == b'x'));
    }

    #[test]
    fn dbt_lone_sentinel_mid_text_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0u8; DBT_BLOCK_SIZE];
        let mut block = Vec::from(&b"a\x1Ab"[..]);
        block.extend_from_slice(&[0x1A, 0x1A]);
        block.resize(DBT_BLOCK_SIZE, 0);
        bytes.extend_from_slice(&block);
        let table = write_fixture(dir.path(), "dbt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::FixedBlock).expect("open");
        assert_eq!(store.resolve(b"1").expect("resolve"), "a\u{1A}b");
    }

    #[test]
    fn dbt_blank_or_zero_pointer_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = write_fixture(dir.path(), "dbt", &vec![0u8; DBT_BLOCK_SIZE]);
        let mut store = MemoStore::open(&table, MemoVariant::FixedBlock).expect("open");
        assert_eq!(store.resolve(b"          ").expect("resolve"), "");
        assert_eq!(store.resolve(b"         0").expect("resolve"), "");
    }

    #[test]
    fn dbt_unterminated_memo_is_reported_as_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0u8; DBT_BLOCK_SIZE];
        bytes.extend_from_slice(&vec![b'x'; DBT_BLOCK_SIZE]);
        let table = write_fixture(dir.path(), "dbt", &bytes);

        let mut store = MemoStore::open(&table, MemoVariant::FixedBlock).expect("open");
        let err = store.resolve(b"1").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::TruncatedMemo);
    }

    #[test]
    fn missing_companion_file_is_a_distinct_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = dir.path().join("table.dbf");
        let err = MemoStore::open(&table, MemoVariant::FixedBlock).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::MissingMemo);
    }

    #[test]
    fn memo_field_lengths_other_than_4_and_10_are_rejected() {
        let err = MemoVariant::from_field_length(5).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(matches!(
            MemoVariant::from_field_length(4),
            Ok(MemoVariant::LengthPrefixed)
        ));
        assert!(matches!(
            MemoVariant::from_field_length(10),
            Ok(MemoVariant::FixedBlock)
        ));
    }
}
