use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;

use super::lexer::Lexer;
use super::parser;
use super::property::{be_u32, MarkerKind, Property};
use super::{err, Error};

/// Index of a node in its [`DeviceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// A devicetree node. Children and properties keep their source order.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: IndexMap<String, NodeId>,
    pub(crate) props: IndexMap<String, Property>,
    pub(crate) labels: Vec<String>,
    pub(crate) omit_if_no_ref: bool,
    pub(crate) is_referenced: bool,
}

impl Node {
    pub(crate) fn new(name: &str, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_owned(),
            parent,
            children: IndexMap::new(),
            props: IndexMap::new(),
            labels: Vec::new(),
            omit_if_no_ref: false,
            is_referenced: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The part of the name after `@`, or an empty string.
    pub fn unit_addr(&self) -> &str {
        self.name.split_once('@').map_or("", |(_, addr)| addr)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &IndexMap<String, NodeId> {
        &self.children
    }

    pub fn props(&self) -> &IndexMap<String, Property> {
        &self.props
    }

    pub fn prop(&self, name: &str) -> Option<&Property> {
        self.props.get(name)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// A `/memreserve/` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReserve {
    pub labels: Vec<String>,
    pub address: u64,
    pub size: u64,
}

/// What a label is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTarget {
    Node(NodeId),
    Property(NodeId, String),
    /// A position inside a property value.
    Offset(NodeId, String, usize),
}

/// A parsed devicetree.
///
/// Nodes live in an arena and refer to each other through [`NodeId`]s.
/// Deleted nodes stay in the arena but are unreachable from the root.
#[derive(Debug, Clone)]
pub struct DeviceTree {
    filename: PathBuf,
    include_path: Vec<PathBuf>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) memreserves: Vec<MemReserve>,
    aliases: IndexMap<String, NodeId>,
    labels: IndexMap<String, LabelTarget>,
    phandles: BTreeMap<u32, NodeId>,
}

impl DeviceTree {
    /// Parses the `.dts` file at `path`, searching `include_path` for
    /// `/include/`d and `/incbin/`d files.
    pub fn parse_file(path: impl AsRef<Path>, include_path: &[PathBuf]) -> Result<Self, Error> {
        let path = path.as_ref();
        let lexer = Lexer::open(path, include_path)?;
        Self::parse(path, lexer, include_path)
    }

    /// Parses devicetree source held in memory. `name` is used for
    /// diagnostics and to resolve relative includes.
    pub fn parse_str(
        name: impl AsRef<Path>,
        text: &str,
        include_path: &[PathBuf],
    ) -> Result<Self, Error> {
        let name = name.as_ref();
        let lexer = Lexer::new(name, text, include_path);
        Self::parse(name, lexer, include_path)
    }

    fn parse(path: &Path, lexer: Lexer, include_path: &[PathBuf]) -> Result<Self, Error> {
        let mut dt = Self {
            filename: path.to_path_buf(),
            include_path: include_path.to_vec(),
            nodes: vec![Node::new("/", None)],
            memreserves: Vec::new(),
            aliases: IndexMap::new(),
            labels: IndexMap::new(),
            phandles: BTreeMap::new(),
        };
        parser::parse(lexer, &mut dt)?;
        dt.finalize()?;
        debug!(
            "parsed {}: {} nodes, {} labels, {} phandles",
            path.display(),
            dt.node_iter().count(),
            dt.labels.len(),
            dt.phandles.len()
        );
        Ok(dt)
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn include_path(&self) -> &[PathBuf] {
        &self.include_path
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn memreserves(&self) -> &[MemReserve] {
        &self.memreserves
    }

    /// Aliases from `/aliases`, in source order.
    pub fn aliases(&self) -> &IndexMap<String, NodeId> {
        &self.aliases
    }

    pub fn alias2node(&self, alias: &str) -> Option<NodeId> {
        self.aliases.get(alias).copied()
    }

    pub fn labels(&self) -> &IndexMap<String, LabelTarget> {
        &self.labels
    }

    pub fn label2node(&self, label: &str) -> Option<NodeId> {
        match self.labels.get(label)? {
            LabelTarget::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn label2prop(&self, label: &str) -> Option<&Property> {
        match self.labels.get(label)? {
            LabelTarget::Property(id, name) => self.node(*id).prop(name),
            _ => None,
        }
    }

    /// Returns the property and byte offset a value label points at.
    pub fn label2prop_offset(&self, label: &str) -> Option<(&Property, usize)> {
        match self.labels.get(label)? {
            LabelTarget::Offset(id, name, offset) => Some((self.node(*id).prop(name)?, *offset)),
            _ => None,
        }
    }

    pub fn phandle2node(&self, phandle: u32) -> Option<NodeId> {
        self.phandles.get(&phandle).copied()
    }

    pub fn phandles(&self) -> &BTreeMap<u32, NodeId> {
        &self.phandles
    }

    /// Absolute path of a node, e.g. `/soc/uart@1000`.
    pub fn path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur.0].parent {
            names.push(self.nodes[cur.0].name.as_str());
            cur = parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Visits all live nodes in preorder, root first.
    pub fn node_iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.values().rev());
        }
        order.into_iter()
    }

    /// Looks up a node by absolute path or by `alias[/rest/of/path]`.
    pub fn get_node(&self, path: &str) -> Result<NodeId, Error> {
        if path.starts_with('/') {
            return self.walk(NodeId::ROOT, path, path);
        }
        let (alias, rest) = path.split_once('/').unwrap_or((path, ""));
        match self.aliases.get(alias) {
            Some(&node) => self.walk(node, rest, path),
            None => err(format!(
                "no alias '{alias}' found -- did you forget the leading '/' in the node path?"
            )),
        }
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.get_node(path).is_ok()
    }

    fn walk(&self, start: NodeId, rest: &str, full: &str) -> Result<NodeId, Error> {
        let mut cur = start;
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            match self.nodes[cur.0].children.get(component) {
                Some(&child) => cur = child,
                None => {
                    return err(format!(
                        "component '{component}' in path '{full}' does not exist"
                    ))
                }
            }
        }
        Ok(cur)
    }

    /* === Construction, used by the parser === */

    pub(crate) fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, Some(parent)));
        self.nodes[parent.0].children.insert(name.to_owned(), id);
        id
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Detaches a node from its parent. Deleting the root empties it.
    pub(crate) fn del_node(&mut self, id: NodeId) {
        match self.nodes[id.0].parent {
            Some(parent) => {
                let name = self.nodes[id.0].name.clone();
                self.nodes[parent.0].children.shift_remove(&name);
            }
            None => {
                let root = &mut self.nodes[id.0];
                root.children.clear();
                root.props.clear();
            }
        }
    }

    /// Resolves a reference as written after `&`: a label, or a path in
    /// braces.
    pub(crate) fn ref2node(&self, r: &str) -> Result<NodeId, String> {
        if let Some(path) = r.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            if !path.starts_with('/') {
                return Err(format!("node path '{path}' does not start with '/'"));
            }
            return self
                .walk(NodeId::ROOT, path, path)
                .map_err(|e| e.to_string());
        }

        self.node_iter()
            .find(|id| self.nodes[id.0].labels.iter().any(|l| l == r))
            .ok_or_else(|| format!("undefined node label '{r}'"))
    }

    /* === Finalization === */

    fn finalize(&mut self) -> Result<(), Error> {
        self.register_phandles()?;
        self.fixup_props()?;
        self.register_aliases()?;
        self.remove_unreferenced();
        self.register_labels()
    }

    /// Fills the phandle table from explicit `phandle` properties.
    fn register_phandles(&mut self) -> Result<(), Error> {
        let ids: Vec<NodeId> = self.node_iter().collect();
        for id in ids {
            let Some(prop) = self.nodes[id.0].props.get("phandle") else {
                continue;
            };
            let path = self.path(id);

            if prop.value.len() != 4 {
                return err(format!(
                    "{path}: bad phandle length ({}), expected 4 bytes",
                    prop.value.len()
                ));
            }

            let mut self_ref = false;
            for marker in &prop.markers {
                if let MarkerKind::Phandle(r) = &marker.kind {
                    let target = self.ref2node(r).map_err(|e| Error::Invalid(format!("{path}: {e}")))?;
                    if target != id {
                        return err(format!("{path}: {r} refers to another node"));
                    }
                    self_ref = true;
                    break;
                }
            }
            if self_ref {
                continue;
            }

            let phandle = be_u32(&prop.value);
            if phandle == 0 || phandle == 0xffff_ffff {
                return err(format!("{path}: bad value {phandle:#010x} for phandle"));
            }
            if let Some(&other) = self.phandles.get(&phandle) {
                return err(format!(
                    "{path}: duplicated phandle {phandle:#x} (seen before at {})",
                    self.path(other)
                ));
            }
            self.phandles.insert(phandle, id);
        }
        Ok(())
    }

    /// Returns the phandle of `id`, allocating the lowest free one if the
    /// node has none yet.
    fn node_phandle(&mut self, id: NodeId) -> [u8; 4] {
        let node = &self.nodes[id.0];
        if let Some(prop) = node.props.get("phandle") {
            if prop.value.len() == 4 && prop.value != [0; 4] {
                return [prop.value[0], prop.value[1], prop.value[2], prop.value[3]];
            }
        }

        let mut phandle = 1;
        while self.phandles.contains_key(&phandle) {
            phandle += 1;
        }
        self.phandles.insert(phandle, id);

        let prop = self.nodes[id.0]
            .props
            .entry("phandle".to_owned())
            .or_insert_with(|| {
                let mut prop = Property::new("phandle", id);
                prop.add_marker(MarkerKind::Uint32);
                prop
            });
        prop.value = phandle.to_be_bytes().to_vec();
        phandle.to_be_bytes()
    }

    /// Replaces path and phandle references with the data they stand for,
    /// and records where value labels ended up.
    fn fixup_props(&mut self) -> Result<(), Error> {
        let ids: Vec<NodeId> = self.node_iter().collect();
        for id in ids {
            let names: Vec<String> = self.nodes[id.0].props.keys().cloned().collect();
            for name in names {
                let Some(prop) = self.nodes[id.0].props.get(&name) else {
                    continue;
                };
                let old = prop.value.clone();
                let mut markers = prop.markers.clone();

                let mut value = Vec::with_capacity(old.len());
                let mut offset_labels = IndexMap::new();
                let mut prev = 0;
                for marker in &mut markers {
                    let mut pos = marker.offset;
                    value.extend_from_slice(&old[prev.min(pos)..pos]);
                    marker.offset = value.len();

                    match &marker.kind {
                        MarkerKind::Label(l) => {
                            offset_labels.insert(l.clone(), value.len());
                        }
                        MarkerKind::Path(r) | MarkerKind::Phandle(r) => {
                            let target = self.ref2node(r).map_err(|e| {
                                Error::Invalid(format!("{}: {e}", self.path(id)))
                            })?;
                            self.nodes[target.0].is_referenced = true;
                            if matches!(marker.kind, MarkerKind::Path(_)) {
                                value.extend_from_slice(self.path(target).as_bytes());
                                value.push(0);
                            } else {
                                value.extend_from_slice(&self.node_phandle(target));
                                pos += 4;
                            }
                        }
                        _ => {}
                    }
                    prev = pos;
                }
                value.extend_from_slice(&old[prev.min(old.len())..]);

                if let Some(prop) = self.nodes[id.0].props.get_mut(&name) {
                    prop.value = value;
                    prop.markers = markers;
                    prop.offset_labels = offset_labels;
                }
            }
        }
        Ok(())
    }

    fn register_aliases(&mut self) -> Result<(), Error> {
        let Some(&aliases) = self.nodes[0].children.get("aliases") else {
            return Ok(());
        };

        let mut table = IndexMap::new();
        for prop in self.nodes[aliases.0].props.values() {
            let valid = prop
                .name
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || c == '-');
            if !valid {
                return err(format!(
                    "/aliases: alias property name '{}' should include only characters from [0-9a-z-]",
                    prop.name
                ));
            }
            let target = prop
                .to_path(self)
                .map_err(|e| Error::Invalid(format!("/aliases: {e}")))?;
            table.insert(prop.name.clone(), target);
        }
        self.aliases = table;
        Ok(())
    }

    /// Drops `/omit-if-no-ref/` nodes that nothing points at.
    fn remove_unreferenced(&mut self) {
        let ids: Vec<NodeId> = self.node_iter().collect();
        for id in ids {
            let node = &self.nodes[id.0];
            if node.omit_if_no_ref && !node.is_referenced {
                debug!("omitting unreferenced node {}", self.path(id));
                self.del_node(id);
            }
        }
    }

    fn register_labels(&mut self) -> Result<(), Error> {
        let mut seen: IndexMap<String, Vec<LabelTarget>> = IndexMap::new();
        let mut add = |label: &str, target: LabelTarget| {
            let targets = seen.entry(label.to_owned()).or_default();
            if !targets.contains(&target) {
                targets.push(target);
            }
        };

        for id in self.node_iter() {
            let node = &self.nodes[id.0];
            for label in &node.labels {
                add(label, LabelTarget::Node(id));
            }
            for prop in node.props.values() {
                for label in &prop.labels {
                    add(label, LabelTarget::Property(id, prop.name.clone()));
                }
                for (label, &offset) in &prop.offset_labels {
                    add(label, LabelTarget::Offset(id, prop.name.clone(), offset));
                }
            }
        }

        let mut labels = IndexMap::new();
        for (label, mut targets) in seen {
            if targets.len() > 1 {
                let mut places: Vec<String> =
                    targets.iter().map(|t| self.describe(t)).collect();
                places.sort();
                return err(format!(
                    "duplicate label '{label}': appears {}",
                    places.join(" and ")
                ));
            }
            if let Some(target) = targets.pop() {
                labels.insert(label, target);
            }
        }
        self.labels = labels;
        Ok(())
    }

    fn describe(&self, target: &LabelTarget) -> String {
        match target {
            LabelTarget::Node(id) => format!("on {}", self.path(*id)),
            LabelTarget::Property(id, name) => {
                format!("on property '{name}' of node {}", self.path(*id))
            }
            LabelTarget::Offset(id, name, _) => {
                format!("in the value of property '{name}' of node {}", self.path(*id))
            }
        }
    }

    fn fmt_node(&self, out: &mut String, id: NodeId) -> fmt::Result {
        let node = &self.nodes[id.0];
        for label in &node.labels {
            write!(out, "{label}: ")?;
        }
        writeln!(out, "{} {{", node.name)?;
        for prop in node.props.values() {
            writeln!(out, "\t{prop}")?;
        }
        for &child in node.children.values() {
            let mut text = String::new();
            self.fmt_node(&mut text, child)?;
            for line in text.split_inclusive('\n') {
                if !line.trim().is_empty() {
                    out.push('\t');
                }
                out.push_str(line);
            }
            out.push('\n');
        }
        out.push_str("};");
        Ok(())
    }
}

impl fmt::Display for DeviceTree {
    /// Writes the tree back out as DTS source.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/dts-v1/;\n\n")?;

        if !self.memreserves.is_empty() {
            for mr in &self.memreserves {
                for label in &mr.labels {
                    write!(f, "{label}: ")?;
                }
                writeln!(f, "/memreserve/ {:#018x} {:#018x};", mr.address, mr.size)?;
            }
            f.write_str("\n")?;
        }

        let mut root = String::new();
        self.fmt_node(&mut root, NodeId::ROOT)?;
        f.write_str(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn parse(src: &str) -> Result<DeviceTree, Error> {
        DeviceTree::parse_str("test.dts", src, &[])
    }

    #[test]
    fn allocate_phandles() {
        let dt = parse(
            "/dts-v1/;
            / {
                a: a { phandle = <1>; };
                b: b { };
                c: c { phandle = <&c>; };
                user { p = <&b &c &a>; };
            };",
        )
        .unwrap();

        let a = dt.get_node("/a").unwrap();
        let b = dt.get_node("/b").unwrap();
        let c = dt.get_node("/c").unwrap();
        assert_eq!(dt.phandle2node(1), Some(a));
        assert_eq!(dt.phandle2node(2), Some(c));
        assert_eq!(dt.phandle2node(3), Some(b));

        let user = dt.get_node("/user").unwrap();
        let p = dt.node(user).prop("p").unwrap();
        assert_eq!(p.to_nodes(&dt).unwrap(), vec![b, c, a]);
        assert_eq!(dt.node(c).prop("phandle").unwrap().value(), [0, 0, 0, 2]);
    }

    #[test]
    fn reject_bad_phandles() {
        for (src, exp) in [
            (
                "/dts-v1/; / { a { phandle = <0>; }; };",
                "/a: bad value 0x00000000 for phandle",
            ),
            (
                "/dts-v1/; / { a { phandle = <1>; }; b { phandle = <1>; }; };",
                "/b: duplicated phandle 0x1 (seen before at /a)",
            ),
            (
                "/dts-v1/; / { a { phandle = <&l>; }; l: b { }; };",
                "/a: l refers to another node",
            ),
            (
                "/dts-v1/; / { a { phandle = [00]; }; };",
                "/a: bad phandle length (1), expected 4 bytes",
            ),
        ] {
            assert_matches!(parse(src), Err(Error::Invalid(msg)) if msg == exp);
        }
    }

    #[test]
    fn paths_and_aliases() {
        let dt = parse(
            "/dts-v1/;
            / {
                aliases { serial0 = &u0; spi = \"/soc/spi@100\"; };
                soc { u0: uart@40 { }; spi@100 { flash@0 { }; }; };
            };",
        )
        .unwrap();

        let uart = dt.get_node("/soc/uart@40").unwrap();
        assert_eq!(dt.get_node("serial0").unwrap(), uart);
        assert_eq!(dt.alias2node("serial0"), Some(uart));
        assert_eq!(dt.path(dt.get_node("spi/flash@0").unwrap()), "/soc/spi@100/flash@0");
        assert_eq!(dt.node(uart).unit_addr(), "40");

        assert_matches!(dt.get_node("/soc/nope"), Err(Error::Invalid(msg))
            if msg == "component 'nope' in path '/soc/nope' does not exist");
        assert_matches!(dt.get_node("nope"), Err(Error::Invalid(msg))
            if msg.starts_with("no alias 'nope' found"));
    }

    #[test]
    fn reject_bad_aliases() {
        assert_matches!(
            parse("/dts-v1/; / { aliases { Bad = &a; }; a: a {}; };"),
            Err(Error::Invalid(msg)) if msg.contains("alias property name 'Bad'")
        );
        assert_matches!(
            parse("/dts-v1/; / { aliases { x = \"/nope\"; }; };"),
            Err(Error::Invalid(msg)) if msg.starts_with("/aliases: ") && msg.contains("non-existent node")
        );
    }

    #[test]
    fn label_tables() {
        let dt = parse(
            "/dts-v1/;
            / {
                n: node {
                    p: prop = <1 v: 2>;
                };
            };",
        )
        .unwrap();

        let node = dt.get_node("/node").unwrap();
        assert_eq!(dt.label2node("n"), Some(node));
        assert_eq!(dt.label2prop("p").map(Property::name), Some("prop"));
        assert_matches!(dt.label2prop_offset("v"), Some((prop, 4)) if prop.name() == "prop");
        assert_eq!(dt.label2node("p"), None);
    }

    #[test]
    fn reject_duplicate_labels() {
        assert_matches!(
            parse("/dts-v1/; / { l1: foo {}; l1: bar {}; };"),
            Err(Error::Invalid(msg)) if msg == "duplicate label 'l1': appears on /bar and on /foo"
        );
        assert_matches!(
            parse("/dts-v1/; / { l1: foo { l1: p; }; };"),
            Err(Error::Invalid(msg)) if msg.starts_with("duplicate label 'l1'")
        );
    }

    #[test]
    fn omit_unreferenced_nodes() {
        let dt = parse(
            "/dts-v1/;
            / {
                /omit-if-no-ref/ a: a { };
                /omit-if-no-ref/ b: b { };
                user { p = <&b>; };
            };",
        )
        .unwrap();

        assert!(!dt.has_node("/a"));
        assert!(dt.has_node("/b"));
        assert!(!dt.to_string().contains("a {"));
    }

    #[test]
    fn format_tree() {
        let dt = parse(
            "/dts-v1/;
            m: /memreserve/ 0x1000 0x100;
            / {
                compatible = \"x,y\";
                l: child@1 {
                    e;
                    p = <&l>, [01 02], /bits/ 64 <5>;
                };
            };",
        )
        .unwrap();

        assert_eq!(
            dt.to_string(),
            "/dts-v1/;

m: /memreserve/ 0x0000000000001000 0x0000000000000100;

/ {
\tcompatible = \"x,y\";
\tl: child@1 {
\t\te;
\t\tp = < &l >, [ 01 02 ], /bits/ 64 < 0x5 >;
\t\tphandle = < 0x1 >;
\t};
};"
        );
    }

    #[test]
    fn reformatted_tree_parses_the_same() {
        let src = "/dts-v1/;
            / {
                #address-cells = <1>;
                a: a@10 { reg = <0x10 0x4>; s = \"x\\ty\", \"z\"; b = [ab cd]; };
                b { p = <&a 1>; q = &a; };
            };";
        let dt = parse(src).unwrap();
        let again = parse(&dt.to_string()).unwrap();
        assert_eq!(again.to_string(), dt.to_string());

        let a = again.get_node("/a@10").unwrap();
        assert_eq!(again.node(a).prop("reg").unwrap().to_nums().unwrap(), vec![0x10, 4]);
        assert_eq!(
            again.node(a).prop("s").unwrap().to_strings().unwrap(),
            vec!["x\ty", "z"]
        );
    }
}
