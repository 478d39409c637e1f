use std::fmt;

use indexmap::IndexMap;

use super::tree::{DeviceTree, NodeId};
use super::{err, Error};

/// What the bytes starting at a [`Marker`] hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    String,
    /// `&label` or `&{/path}` outside `< >`. Expanded to the path string.
    Path(String),
    /// `&label` inside `< >`. Four bytes, patched with the phandle.
    Phandle(String),
    /// Label on a position inside the value.
    Label(String),
}

impl MarkerKind {
    fn elem_size(&self) -> Option<usize> {
        match self {
            MarkerKind::Uint8 => Some(1),
            MarkerKind::Uint16 => Some(2),
            MarkerKind::Uint32 => Some(4),
            MarkerKind::Uint64 => Some(8),
            _ => None,
        }
    }

    pub(crate) fn for_elem_size(size: usize) -> Self {
        match size {
            1 => MarkerKind::Uint8,
            2 => MarkerKind::Uint16,
            8 => MarkerKind::Uint64,
            _ => MarkerKind::Uint32,
        }
    }
}

/// Records what kind of data starts at `offset` in a property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub offset: usize,
    pub kind: MarkerKind,
}

/// Property type, inferred from how the value was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// `foo;`
    Empty,
    /// `foo = [01 02];` or `foo = /bits/ 8 <1 2>;`
    Bytes,
    /// `foo = <1>;`
    Num,
    /// `foo = <1 2>;` or `foo = <1>, <2>;`
    Nums,
    String,
    Strings,
    /// `foo = &bar;`
    Path,
    /// `foo = <&bar>;`
    Phandle,
    /// `foo = <&bar &baz>;`
    Phandles,
    /// `foo = <&bar 1 2 &baz 3>;`
    PhandlesAndNums,
    /// Anything else, such as a string mixed with numbers.
    Compound,
}

/// A property with its raw big-endian value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) value: Vec<u8>,
    pub(crate) markers: Vec<Marker>,
    pub(crate) labels: Vec<String>,
    pub(crate) offset_labels: IndexMap<String, usize>,
}

impl Property {
    pub(crate) fn new(name: &str, node: NodeId) -> Self {
        Self {
            name: name.to_owned(),
            node,
            value: Vec::new(),
            markers: Vec::new(),
            labels: Vec::new(),
            offset_labels: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node the property belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Labels inside the value, mapped to their byte offset.
    pub fn offset_labels(&self) -> &IndexMap<String, usize> {
        &self.offset_labels
    }

    /// Appends a marker at the current end of the value. Phandle markers
    /// reserve four bytes for the phandle.
    pub(crate) fn add_marker(&mut self, kind: MarkerKind) {
        let is_phandle = matches!(kind, MarkerKind::Phandle(_));
        self.markers.push(Marker {
            offset: self.value.len(),
            kind,
        });
        if is_phandle {
            self.value.extend_from_slice(&[0; 4]);
        }
    }

    pub fn ty(&self) -> Type {
        let kinds: Vec<&MarkerKind> = self
            .markers
            .iter()
            .map(|m| &m.kind)
            .filter(|k| !matches!(k, MarkerKind::Label(_)))
            .collect();

        let all = |f: fn(&MarkerKind) -> bool| kinds.iter().all(|k| f(k));

        match kinds[..] {
            [] => return Type::Empty,
            [MarkerKind::Uint8] => return Type::Bytes,
            [MarkerKind::Uint32] => {
                return if self.value.len() == 4 {
                    Type::Num
                } else {
                    Type::Nums
                }
            }
            [MarkerKind::Path(_)] => return Type::Path,
            [MarkerKind::Uint32, MarkerKind::Phandle(_)] if self.value.len() == 4 => {
                return Type::Phandle
            }
            _ => {}
        }

        if all(|k| *k == MarkerKind::Uint32) {
            return Type::Nums;
        }
        if all(|k| *k == MarkerKind::String) {
            return if kinds.len() == 1 {
                Type::String
            } else {
                Type::Strings
            };
        }
        if all(|k| matches!(k, MarkerKind::Uint32 | MarkerKind::Phandle(_))) {
            let phandles = kinds
                .iter()
                .filter(|k| matches!(k, MarkerKind::Phandle(_)))
                .count();
            return if self.value.len() == 4 * phandles {
                Type::Phandles
            } else {
                Type::PhandlesAndNums
            };
        }
        Type::Compound
    }

    fn type_error<T>(&self, expected: &str) -> Result<T, Error> {
        err(format!(
            "expected property '{}' to be assigned with '{} = {};', not '{}'",
            self.name, self.name, expected, self
        ))
    }

    /// Interprets `foo = <1>;`.
    pub fn to_num(&self) -> Result<u32, Error> {
        if self.ty() != Type::Num {
            return self.type_error("< (number) >");
        }
        Ok(be_u32(&self.value))
    }

    /// Like [`Property::to_num`], as a two's complement signed value.
    pub fn to_num_signed(&self) -> Result<i32, Error> {
        self.to_num().map(|n| n as i32)
    }

    /// Interprets `foo = <1 2 ...>;`. A single number also works.
    pub fn to_nums(&self) -> Result<Vec<u32>, Error> {
        if !matches!(self.ty(), Type::Num | Type::Nums) {
            return self.type_error("< (number) (number) ... >");
        }
        Ok(self.value.chunks_exact(4).map(be_u32).collect())
    }

    pub fn to_nums_signed(&self) -> Result<Vec<i32>, Error> {
        Ok(self.to_nums()?.into_iter().map(|n| n as i32).collect())
    }

    /// Interprets `foo = [ 01 ... ];`.
    pub fn to_bytes(&self) -> Result<&[u8], Error> {
        if self.ty() != Type::Bytes {
            return self.type_error("[ (byte) (byte) ... ]");
        }
        Ok(&self.value)
    }

    /// Interprets `foo = "string";`, without the NUL terminator.
    pub fn to_str(&self) -> Result<&str, Error> {
        if self.ty() != Type::String {
            return self.type_error("\"string\"");
        }
        let bytes = self.value.strip_suffix(&[0]).unwrap_or(&self.value);
        std::str::from_utf8(bytes).or_else(|_| {
            err(format!(
                "value of property '{}' ({:?}) is not valid UTF-8",
                self.name, self.value
            ))
        })
    }

    /// Interprets `foo = "s1", "s2", ...;`. A single string also works.
    pub fn to_strings(&self) -> Result<Vec<&str>, Error> {
        if !matches!(self.ty(), Type::String | Type::Strings) {
            return self.type_error("\"string\", \"string\", ...");
        }
        let bytes = self.value.strip_suffix(&[0]).unwrap_or(&self.value);
        bytes
            .split(|b| *b == 0)
            .map(|s| {
                std::str::from_utf8(s).or_else(|_| {
                    err(format!(
                        "value of property '{}' ({:?}) is not valid UTF-8",
                        self.name, self.value
                    ))
                })
            })
            .collect()
    }

    /// Interprets `foo = <&bar>;` as the node it points to.
    pub fn to_node(&self, dt: &DeviceTree) -> Result<NodeId, Error> {
        if self.ty() != Type::Phandle {
            return self.type_error("< &foo >");
        }
        self.phandle_target(dt, be_u32(&self.value))
    }

    /// Interprets `foo = <&bar &baz ...>;`. An empty `foo = < >;` gives no
    /// nodes.
    pub fn to_nodes(&self, dt: &DeviceTree) -> Result<Vec<NodeId>, Error> {
        match self.ty() {
            Type::Phandle | Type::Phandles => {}
            Type::Nums if self.value.is_empty() => return Ok(Vec::new()),
            _ => return self.type_error("< &foo &bar ... >"),
        }
        self.value
            .chunks_exact(4)
            .map(|c| self.phandle_target(dt, be_u32(c)))
            .collect()
    }

    /// Interprets `foo = &bar;` or `foo = "/bar";` as the node it points to.
    pub fn to_path(&self, dt: &DeviceTree) -> Result<NodeId, Error> {
        if !matches!(self.ty(), Type::Path | Type::String) {
            return self.type_error("&foo or \"/foo\"");
        }
        let bytes = self.value.strip_suffix(&[0]).unwrap_or(&self.value);
        let path = std::str::from_utf8(bytes)
            .or_else(|_| err(format!("value of property '{}' is not valid UTF-8", self.name)))?;
        dt.get_node(path).or_else(|_| {
            err(format!(
                "property '{}' on {} points to the non-existent node \"{}\"",
                self.name,
                dt.path(self.node),
                path
            ))
        })
    }

    fn phandle_target(&self, dt: &DeviceTree, phandle: u32) -> Result<NodeId, Error> {
        dt.phandle2node(phandle).ok_or_else(|| {
            Error::Invalid(format!(
                "property '{}' on {} refers to unknown phandle {:#x}",
                self.name,
                dt.path(self.node),
                phandle
            ))
        })
    }
}

pub(crate) fn be_u32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0, |acc, b| (acc << 8) | u32::from(*b))
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

/// Writes `bytes` as the inside of a DTS string literal.
pub(crate) fn write_escaped(f: &mut impl fmt::Write, mut bytes: &[u8]) -> fmt::Result {
    while !bytes.is_empty() {
        let (valid, bad) = match std::str::from_utf8(bytes) {
            Ok(s) => (s, &[][..]),
            Err(e) => {
                let (ok, rest) = bytes.split_at(e.valid_up_to());
                let n = e.error_len().unwrap_or(rest.len());
                bytes = &rest[n..];
                (std::str::from_utf8(ok).unwrap_or_default(), &rest[..n])
            }
        };
        for c in valid.chars() {
            match c {
                '\\' => f.write_str("\\\\")?,
                '"' => f.write_str("\\\"")?,
                '\x07' => f.write_str("\\a")?,
                '\x08' => f.write_str("\\b")?,
                '\t' => f.write_str("\\t")?,
                '\n' => f.write_str("\\n")?,
                '\x0b' => f.write_str("\\v")?,
                '\x0c' => f.write_str("\\f")?,
                '\r' => f.write_str("\\r")?,
                c => f.write_char(c)?,
            }
        }
        for b in bad {
            write!(f, "\\x{b:02x}")?;
        }
        if bad.is_empty() {
            break;
        }
    }
    Ok(())
}

impl fmt::Display for Property {
    /// Formats the property as DTS source, e.g. `l: foo = <0x1 &bar>, "s";`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in &self.labels {
            write!(f, "{label}: ")?;
        }
        f.write_str(&self.name)?;

        if self.value.is_empty() {
            return f.write_str(";");
        }
        f.write_str(" =")?;

        let len = self.value.len();
        let mut elem_size = 4;
        for (i, marker) in self.markers.iter().enumerate() {
            let next = self.markers.get(i + 1);
            let end = next.map_or(len, |m| m.offset);

            match &marker.kind {
                MarkerKind::String => {
                    f.write_str(" \"")?;
                    let text = &self.value[marker.offset..end.max(marker.offset + 1) - 1];
                    write_escaped(f, text)?;
                    f.write_str("\"")?;
                    if end != len {
                        f.write_str(",")?;
                    }
                }
                MarkerKind::Path(r) => {
                    write!(f, " &{r}")?;
                    if end != len {
                        f.write_str(",")?;
                    }
                }
                kind => {
                    let mut pos = marker.offset;
                    match kind {
                        MarkerKind::Label(l) => write!(f, " {l}:")?,
                        MarkerKind::Phandle(r) => {
                            write!(f, " &{r}")?;
                            pos += 4;
                        }
                        _ => {
                            elem_size = kind.elem_size().unwrap_or(4);
                            f.write_str(match elem_size {
                                1 => " [",
                                2 => " /bits/ 16 <",
                                8 => " /bits/ 64 <",
                                _ => " <",
                            })?;
                        }
                    }

                    while pos + elem_size <= end {
                        let num = be_uint(&self.value[pos..pos + elem_size]);
                        if elem_size == 1 {
                            write!(f, " {num:02X}")?;
                        } else {
                            write!(f, " {num:#x}")?;
                        }
                        pos += elem_size;
                    }

                    let continues = matches!(
                        next.map(|m| &m.kind),
                        Some(MarkerKind::Phandle(_) | MarkerKind::Label(_))
                    );
                    if pos != 0 && !continues {
                        f.write_str(if elem_size == 1 { " ]" } else { " >" })?;
                        if pos != len {
                            f.write_str(",")?;
                        }
                    }
                }
            }
        }
        f.write_str(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(value: &[u8], kinds: &[(usize, MarkerKind)]) -> Property {
        let mut p = Property::new("p", NodeId::ROOT);
        p.value = value.to_vec();
        p.markers = kinds
            .iter()
            .map(|(offset, kind)| Marker {
                offset: *offset,
                kind: kind.clone(),
            })
            .collect();
        p
    }

    #[test]
    fn infer_types() {
        use MarkerKind::*;

        for (p, exp) in [
            (prop(b"", &[]), Type::Empty),
            (prop(b"", &[(0, Uint32)]), Type::Nums),
            (prop(&[1, 2], &[(0, Uint8)]), Type::Bytes),
            (prop(&[0, 0, 0, 1], &[(0, Uint32)]), Type::Num),
            (prop(&[0, 0, 0, 1, 0, 0, 0, 2], &[(0, Uint32)]), Type::Nums),
            (
                prop(&[0, 0, 0, 1, 0, 0, 0, 2], &[(0, Uint32), (4, Uint32)]),
                Type::Nums,
            ),
            (prop(b"a\0", &[(0, String)]), Type::String),
            (prop(b"a\0b\0", &[(0, String), (2, String)]), Type::Strings),
            (prop(b"/a\0", &[(0, Path("a".into()))]), Type::Path),
            (
                prop(&[0, 0, 0, 1], &[(0, Uint32), (0, Phandle("a".into()))]),
                Type::Phandle,
            ),
            (
                prop(
                    &[0, 0, 0, 1, 0, 0, 0, 2],
                    &[(0, Uint32), (0, Phandle("a".into())), (4, Phandle("b".into()))],
                ),
                Type::Phandles,
            ),
            (
                prop(
                    &[0, 0, 0, 1, 0, 0, 0, 2],
                    &[(0, Uint32), (0, Phandle("a".into()))],
                ),
                Type::PhandlesAndNums,
            ),
            (
                prop(b"a\0\0\0\0\x01", &[(0, String), (2, Uint32)]),
                Type::Compound,
            ),
            (
                prop(&[0, 0, 0, 1], &[(0, Label("l".into())), (0, Uint32)]),
                Type::Num,
            ),
        ] {
            assert_eq!(p.ty(), exp, "{p:?}");
        }
    }

    #[test]
    fn convert_values() {
        use MarkerKind::*;

        let p = prop(&[0xff, 0xff, 0xff, 0xfe], &[(0, Uint32)]);
        assert_eq!(p.to_num().unwrap(), 0xffff_fffe);
        assert_eq!(p.to_num_signed().unwrap(), -2);
        assert_eq!(p.to_nums().unwrap(), vec![0xffff_fffe]);
        assert!(p.to_bytes().is_err());

        let p = prop(b"ab\0cd\0", &[(0, String), (3, String)]);
        assert_eq!(p.to_strings().unwrap(), vec!["ab", "cd"]);
        let err = p.to_str().unwrap_err().to_string();
        assert_eq!(
            err,
            "expected property 'p' to be assigned with 'p = \"string\";', not 'p = \"ab\", \"cd\";'"
        );
    }

    #[test]
    fn format_values() {
        use MarkerKind::*;

        for (p, exp) in [
            (prop(b"", &[]), "p;"),
            (prop(&[0, 0, 0, 1, 0, 0, 0, 2], &[(0, Uint32)]), "p = < 0x1 0x2 >;"),
            (prop(&[0xab, 0x01], &[(0, Uint8)]), "p = [ AB 01 ];"),
            (prop(&[0, 0x10], &[(0, Uint16)]), "p = /bits/ 16 < 0x10 >;"),
            (
                prop(b"a\"\n\0x\0", &[(0, String), (4, String)]),
                "p = \"a\\\"\\n\", \"x\";",
            ),
            (
                prop(
                    &[0, 0, 0, 1, 0, 0, 0, 5],
                    &[(0, Uint32), (0, Phandle("foo".into())), (4, Label("l".into()))],
                ),
                "p = < &foo l: 0x5 >;",
            ),
            (
                prop(b"/a\0\0\0\0\x01", &[(0, Path("a".into())), (3, Uint32)]),
                "p = &a, < 0x1 >;",
            ),
        ] {
            assert_eq!(p.to_string(), exp);
        }
    }
}
