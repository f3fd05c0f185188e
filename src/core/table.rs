// Decoding session: header parse at open, single-pass column/row consumption.
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::field::FieldType;
use crate::core::header::{self, FieldDescriptor, TableLayout};
use crate::core::memo::{MemoStore, MemoVariant};

/// Records flagged with this byte are soft-deleted and never emitted.
pub const DELETED_FLAG: u8 = b'*';

#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    /// Exported column names; empty means every field is exported.
    /// Matched case-insensitively against post-rename names.
    pub include: Vec<String>,
    /// Stored name → exported name, keys matched case-insensitively.
    pub renames: HashMap<String, String>,
    /// Decode logical fields as their raw flag character instead of `t`/`f`.
    pub logical_as_char: bool,
}

/// One exported column as reported by [`Table::columns`].
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub tag: char,
    pub length: usize,
    pub decimal_count: u8,
}

/// A single-pass decoding session over one table file. The layout is parsed
/// once at open; `columns()` and `rows()` each succeed at most once, matching
/// the forward-only read of the underlying stream.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    layout: TableLayout,
    file: Option<BufReader<File>>,
    memo: Option<MemoStore>,
    columns_taken: bool,
}

impl Table {
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            Error::new(ErrorKind::MissingFile)
                .with_message("table file does not exist or is unreadable")
                .with_path(path)
                .with_source(err)
        })?;
        let mut reader = BufReader::new(file);
        let layout = header::parse_layout(&mut reader, &options)?;
        let memo = match MemoVariant::detect(&layout)? {
            Some(variant) => Some(MemoStore::open(path, variant)?),
            None => None,
        };

        debug!(
            path = %path.display(),
            record_count = layout.record_count,
            fields = layout.fields.len(),
            memo = memo.is_some(),
            "opened table"
        );
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            file: Some(reader),
            memo,
            columns_taken: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn memo_variant(&self) -> Option<MemoVariant> {
        self.memo.as_ref().map(|store| store.variant())
    }

    /// Exported columns in declaration order. One call per session.
    pub fn columns(&mut self) -> Result<Vec<Column>, Error> {
        if self.columns_taken {
            return Err(Error::new(ErrorKind::Consumed)
                .with_message("column names have already been read"));
        }
        self.columns_taken = true;
        Ok(self
            .layout
            .fields
            .iter()
            .filter(|field| field.exported)
            .map(|field| Column {
                name: field.export_name.clone(),
                tag: field.tag as char,
                length: field.length,
                decimal_count: field.decimal_count,
            })
            .collect())
    }

    /// The lazy row sequence. Ownership of both file handles moves into the
    /// returned iterator; dropping it, exhausted or not, releases them.
    /// One call per session.
    pub fn rows(&mut self) -> Result<Rows, Error> {
        let Some(file) = self.file.take() else {
            return Err(
                Error::new(ErrorKind::Consumed).with_message("rows have already been read")
            );
        };
        // The stream is past the descriptors now; a later columns() call
        // would be misuse of the single-pass contract.
        self.columns_taken = true;
        Ok(Rows {
            file: Some(file),
            memo: self.memo.take(),
            fields: self.layout.fields.clone(),
            body_len: self.layout.record_body_len,
            remaining: self.layout.record_count,
        })
    }
}

/// Iterator over decoded rows. Soft-deleted records are skipped; every
/// stored record, deleted or not, counts against the declared record count.
#[derive(Debug)]
pub struct Rows {
    file: Option<BufReader<File>>,
    memo: Option<MemoStore>,
    fields: Vec<FieldDescriptor>,
    body_len: usize,
    remaining: u32,
}

impl Rows {
    fn next_row(&mut self) -> Result<Option<Vec<String>>, Error> {
        while self.remaining > 0 {
            let Some(file) = self.file.as_mut() else {
                break;
            };
            self.remaining -= 1;

            let mut flag = [0u8; 1];
            file.read_exact(&mut flag)?;
            if flag[0] == DELETED_FLAG {
                file.seek_relative(self.body_len as i64)?;
                continue;
            }

            let mut body = vec![0u8; self.body_len];
            file.read_exact(&mut body)?;

            let mut row = Vec::new();
            for field in &self.fields {
                if !field.exported {
                    continue;
                }
                let raw = &body[field.offset..field.offset + field.length];
                let value = if field.field_type == FieldType::Memo {
                    match self.memo.as_mut() {
                        Some(store) => store.resolve(raw)?,
                        None => String::new(),
                    }
                } else {
                    field.field_type.decode(raw)
                };
                row.push(value);
            }
            return Ok(Some(row));
        }

        self.close();
        Ok(None)
    }

    fn close(&mut self) {
        self.file = None;
        self.memo = None;
    }
}

impl Iterator for Rows {
    type Item = Result<Vec<String>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(err) => {
                self.close();
                Some(Err(err))
            }
        }
    }
}
