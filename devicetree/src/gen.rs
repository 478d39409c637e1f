//! C header generation from an [`Edt`](crate::edt::Edt).
//!
//! Every node gets an identifier built from its path (`/soc/uart@1000`
//! becomes `N_S_soc_S_uart_1000`), and every macro about the node starts
//! with `DT_` followed by that identifier.

mod device_extern;
mod header;
mod writer;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

pub use device_extern::write_device_extern;
pub use header::write_header;

use crate::edt::Edt;

#[derive(Debug, Clone, Default)]
pub struct GenOptions {
    /// Paths under this directory are shown relative to `$ZEPHYR_BASE` in
    /// header comments.
    pub zephyr_base: Option<PathBuf>,
}

impl GenOptions {
    /// Takes `zephyr_base` from the `ZEPHYR_BASE` environment variable.
    pub fn from_env() -> Self {
        Self {
            zephyr_base: std::env::var_os("ZEPHYR_BASE").map(PathBuf::from),
        }
    }

    fn relativize(&self, path: &Path) -> String {
        match self
            .zephyr_base
            .as_deref()
            .and_then(|base| path.strip_prefix(base).ok())
        {
            Some(rel) => format!("$ZEPHYR_BASE/{}", rel.display()),
            None => path.display().to_string(),
        }
    }
}

/// Lowercases `s` and turns the characters that may appear in node names,
/// compatibles and property names but not in C identifiers into `_`.
pub fn str2ident(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            '-' | ',' | '.' | '@' | '/' | '+' => '_',
            c => c,
        })
        .collect()
}

/// The identifier of the node at `path`, without the `DT_` prefix.
pub fn node_ident(path: &str) -> String {
    let mut ident = String::from("N");
    for component in path.split('/').filter(|c| !c.is_empty()) {
        ident.push_str("_S_");
        ident.push_str(&str2ident(component));
    }
    ident
}

/// Identifiers of all nodes, by node index. Fails with
/// [`io::ErrorKind::InvalidData`] if two nodes map to the same identifier,
/// as `/a-b` and `/a_b` do.
fn node_idents(edt: &Edt) -> io::Result<Vec<String>> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut idents = Vec::with_capacity(edt.nodes().len());
    for node in edt.nodes() {
        let ident = node_ident(node.path());
        if let Some(other) = seen.insert(ident.clone(), node.path()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "nodes {other} and {} both have the identifier DT_{ident}",
                    node.path()
                ),
            ));
        }
        idents.push(ident);
    }
    Ok(idents)
}

/// Escapes backslashes and double quotes for a C string literal.
pub fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn quote_str(s: &str) -> String {
    format!("\"{}\"", escape(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert_eq!(str2ident("vnd,Serial-Port@1.0+x/y"), "vnd_serial_port_1_0_x_y");
        assert_eq!(node_ident("/"), "N");
        assert_eq!(node_ident("/soc/uart@40001000"), "N_S_soc_S_uart_40001000");
    }

    #[test]
    fn string_literals() {
        assert_eq!(escape(r#"a\b"c"#), r#"a\\b\"c"#);
        assert_eq!(quote_str("x\"y"), "\"x\\\"y\"");
    }

    #[test]
    fn zephyr_base_relative_paths() {
        let options = GenOptions {
            zephyr_base: Some("/work/zephyr".into()),
        };
        assert_eq!(
            options.relativize(Path::new("/work/zephyr/dts/bindings")),
            "$ZEPHYR_BASE/dts/bindings"
        );
        assert_eq!(options.relativize(Path::new("/opt/bindings")), "/opt/bindings");
        assert_eq!(
            GenOptions::default().relativize(Path::new("/work/zephyr/dts")),
            "/work/zephyr/dts"
        );
    }
}
