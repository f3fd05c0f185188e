// DBF file header and field-descriptor parsing into an immutable table layout.
use std::collections::HashMap;
use std::io::Read;

use bstr::ByteSlice;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::field::FieldType;
use crate::core::table::OpenOptions;

pub const HEADER_LEN: usize = 32;
pub const DESCRIPTOR_LEN: usize = 32;

/// Visual FoxPro marker byte; tables carrying it interpose a 263-byte
/// region between the descriptor array and the first record.
const VFP_MARKER: u8 = 0x30;
const VFP_EXTRA_SKIP: usize = 263;

const RECORD_COUNT_OFFSET: usize = 4;
const HEADER_LEN_OFFSET: usize = 8;
const NAME_LEN: usize = 11;
const TYPE_OFFSET: usize = 11;
const LENGTH_OFFSET: usize = 16;
const DECIMALS_OFFSET: usize = 17;

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    /// Identifier exactly as stored, NUL padding trimmed. Not sanitized.
    pub name: String,
    /// Identifier after the caller's rename map; what `columns()` reports.
    pub export_name: String,
    pub tag: u8,
    pub field_type: FieldType,
    pub length: usize,
    /// Byte offset within the record body (the deletion flag is not counted).
    pub offset: usize,
    pub decimal_count: u8,
    pub exported: bool,
}

#[derive(Clone, Debug)]
pub struct TableLayout {
    pub record_count: u32,
    pub record_body_len: usize,
    pub skip_bytes: usize,
    pub fields: Vec<FieldDescriptor>,
}

/// Parse the 32-byte header and the descriptor array, leaving the reader
/// positioned at the first record.
pub fn parse_layout(reader: &mut impl Read, options: &OpenOptions) -> Result<TableLayout, Error> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(|err| {
        Error::new(ErrorKind::Format)
            .with_message("file too short for a table header")
            .with_source(err)
    })?;

    let mut skip_bytes = if header[0] == VFP_MARKER {
        VFP_EXTRA_SKIP
    } else {
        0
    };
    let record_count = u32::from_le_bytes(slice_4(&header, RECORD_COUNT_OFFSET));
    let declared_header_len = u16::from_le_bytes([
        header[HEADER_LEN_OFFSET],
        header[HEADER_LEN_OFFSET + 1],
    ]);

    // One byte past the descriptors terminates the array; some writers pad
    // a further byte, detected by the size landing one over a multiple of 32.
    let mut array_size = i64::from(declared_header_len) - HEADER_LEN as i64 - skip_bytes as i64 - 1;
    if array_size % DESCRIPTOR_LEN as i64 == 1 {
        skip_bytes += 1;
        array_size -= 1;
    }
    if array_size <= 0 {
        return Err(Error::new(ErrorKind::Format).with_message(format!(
            "declared header length {declared_header_len} leaves no room for field descriptors"
        )));
    }
    let array_size = array_size as usize;
    let field_count = array_size / DESCRIPTOR_LEN;

    let mut descriptors = vec![0u8; array_size];
    reader.read_exact(&mut descriptors).map_err(|err| {
        Error::new(ErrorKind::Format)
            .with_message("file too short for its field descriptor array")
            .with_source(err)
    })?;

    let include: Vec<String> = options
        .include
        .iter()
        .map(|name| name.to_uppercase())
        .collect();
    let renames: HashMap<String, String> = options
        .renames
        .iter()
        .map(|(old, new)| (old.to_uppercase(), new.clone()))
        .collect();

    let mut fields = Vec::with_capacity(field_count);
    let mut offset = 0usize;
    for index in 0..field_count {
        let raw = &descriptors[index * DESCRIPTOR_LEN..(index + 1) * DESCRIPTOR_LEN];
        let name_bytes = &raw[..NAME_LEN];
        let name_end = name_bytes.find_byte(0).unwrap_or(NAME_LEN);
        let name = name_bytes[..name_end].to_str_lossy().into_owned();
        let tag = raw[TYPE_OFFSET];
        let length = raw[LENGTH_OFFSET] as usize;
        let decimal_count = raw[DECIMALS_OFFSET];

        let field_type = if options.logical_as_char && tag == b'L' {
            FieldType::Character
        } else {
            FieldType::from_tag(tag)
        };
        let export_name = renames
            .get(&name.to_uppercase())
            .cloned()
            .unwrap_or_else(|| name.clone());
        let exported = include.is_empty() || include.contains(&export_name.to_uppercase());

        fields.push(FieldDescriptor {
            name,
            export_name,
            tag,
            field_type,
            length,
            offset,
            decimal_count,
            exported,
        });
        offset += length;
    }

    // Consume the version-specific skip region and the array terminator so
    // the stream rests on the first record's deletion flag.
    let mut padding = vec![0u8; skip_bytes + 1];
    reader.read_exact(&mut padding).map_err(|err| {
        Error::new(ErrorKind::Format)
            .with_message("file too short for its declared header region")
            .with_source(err)
    })?;

    debug!(
        record_count,
        field_count,
        record_body_len = offset,
        skip_bytes,
        "parsed table layout"
    );

    Ok(TableLayout {
        record_count,
        record_body_len: offset,
        skip_bytes,
        fields,
    })
}

fn slice_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}
