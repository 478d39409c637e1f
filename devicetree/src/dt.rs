//! Devicetree source (DTS) parsing.
//!
//! [`DeviceTree::parse_file`] turns a `.dts` file into a tree of [`Node`]s and
//! [`Property`]s. Label and path references inside property values are
//! resolved when parsing ends, phandles are allocated for referenced nodes,
//! and the alias, label and phandle tables are built.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod lexer;
mod parser;
mod property;
mod tree;

pub use lexer::Location;
pub use property::{Marker, MarkerKind, Property, Type};
pub use tree::{DeviceTree, LabelTarget, MemReserve, Node, NodeId};

#[derive(Debug, Error)]
pub enum Error {
    /// Lexical or syntactic fault, located in the source.
    #[error("{file}:{line} (column {column}): parse error: {msg}")]
    Parse {
        file: String,
        line: u32,
        column: usize,
        msg: String,
    },

    /// Semantic fault found after parsing, or a failed value conversion.
    #[error("{0}")]
    Invalid(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub(crate) fn err<T>(msg: impl Into<String>) -> Result<T, Error> {
    Err(Error::Invalid(msg.into()))
}
