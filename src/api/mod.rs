//! Purpose: Define the stable public Rust API boundary for dbfport.
//! Exports: Core types and operations needed by the CLI and embedders.
//! Role: Public, additive-only surface; hides internal decoding modules.
//! Invariants: This module is the only public path embedders should rely on.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::field::{FieldType, JULIAN_DAY_OFFSET};
pub use crate::core::header::{FieldDescriptor, TableLayout};
pub use crate::core::memo::{MemoStore, MemoVariant};
pub use crate::core::table::{Column, OpenOptions, Rows, Table};
