use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::binding::{str_as_token, Binding, Literal, PropType, PropertySpec};
use crate::dt;

/// Index of a node in an [`Edt`](super::Edt). Nodes are numbered in
/// devicetree preorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// A `reg` entry. `addr` is translated through the `ranges` of all
/// ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: Option<String>,
    /// `None` when `#address-cells` is 0.
    pub addr: Option<u128>,
    /// `None` when `#size-cells` is 0.
    pub size: Option<u128>,
}

/// A `ranges` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub child_bus_cells: u32,
    pub child_bus_addr: Option<u128>,
    pub parent_bus_cells: u32,
    pub parent_bus_addr: Option<u128>,
    pub length_cells: u32,
    pub length: Option<u128>,
}

/// One entry of `interrupts` or of a `phandle-array` property, e.g.
/// `<&gpio0 4 0>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerAndData {
    pub controller: NodeId,
    /// Cells keyed by the names from the controller's `<space>-cells:`.
    pub data: IndexMap<String, u32>,
    /// From `<space>-names` or `interrupt-names`.
    pub name: Option<String>,
    pub basename: Option<String>,
    /// For interrupts, the `irq` cell as a linear IRQ number.
    pub linear_irq: Option<u64>,
}

/// A `pinctrl-<index>` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinCtrl {
    pub name: Option<String>,
    pub conf_nodes: Vec<NodeId>,
}

impl PinCtrl {
    pub fn name_as_token(&self) -> Option<String> {
        self.name.as_deref().map(str_as_token)
    }
}

/// A property value, typed by its binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Array(Vec<i64>),
    Bytes(Vec<u8>),
    String(String),
    Strings(Vec<String>),
    Phandle(NodeId),
    Phandles(Vec<NodeId>),
    /// `None` marks an unspecified entry (a zero phandle with no cells).
    PhandleArray(Vec<Option<ControllerAndData>>),
    Path(NodeId),
}

impl PropValue {
    /// Converts a binding `default:` to a value of type `ty`.
    pub(crate) fn from_default(ty: PropType, default: &Literal) -> Option<Self> {
        Some(match (ty, default) {
            (PropType::Int, Literal::Int(n)) => PropValue::Int(*n),
            (PropType::Array, Literal::Ints(v)) => PropValue::Array(v.clone()),
            (PropType::Uint8Array, Literal::Ints(v)) => PropValue::Bytes(
                v.iter()
                    .map(|n| u8::try_from(*n).ok())
                    .collect::<Option<_>>()?,
            ),
            (PropType::String, Literal::Str(s)) => PropValue::String(s.clone()),
            (PropType::StringArray, Literal::Strs(v)) => PropValue::Strings(v.clone()),
            (PropType::StringArray, Literal::Ints(v)) if v.is_empty() => {
                PropValue::Strings(Vec::new())
            }
            _ => return None,
        })
    }

    /// True if this value equals a binding `enum:` entry or `const:`.
    pub(crate) fn matches(&self, lit: &Literal) -> bool {
        match (self, lit) {
            (PropValue::Int(n), Literal::Int(m)) => n == m,
            (PropValue::String(s), Literal::Str(t)) => s == t,
            (PropValue::Array(v), Literal::Ints(w)) => v == w,
            (PropValue::Bytes(b), Literal::Ints(w)) => {
                b.len() == w.len() && b.iter().zip(w).all(|(x, y)| i64::from(*x) == *y)
            }
            (PropValue::Strings(v), Literal::Strs(w)) => v == w,
            _ => false,
        }
    }

    /// Number of elements, for the value kinds that have one.
    pub fn len(&self) -> Option<usize> {
        match self {
            PropValue::Array(v) => Some(v.len()),
            PropValue::Bytes(v) => Some(v.len()),
            PropValue::Strings(v) => Some(v.len()),
            PropValue::Phandles(v) => Some(v.len()),
            PropValue::PhandleArray(v) => Some(v.len()),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(b) => write!(f, "{b}"),
            PropValue::Int(n) => write!(f, "{n}"),
            PropValue::Array(v) => write!(f, "{v:?}"),
            PropValue::Bytes(v) => write!(f, "{v:02x?}"),
            PropValue::String(s) => write!(f, "'{s}'"),
            PropValue::Strings(v) => write!(f, "{v:?}"),
            PropValue::Phandle(id) | PropValue::Path(id) => write!(f, "<node {}>", id.0),
            PropValue::Phandles(ids) => {
                let ids: Vec<usize> = ids.iter().map(|id| id.0).collect();
                write!(f, "<nodes {ids:?}>")
            }
            PropValue::PhandleArray(entries) => write!(f, "<{} entries>", entries.len()),
        }
    }
}

/// A node property together with the binding entry that describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Prop {
    pub spec: PropertySpec,
    pub value: PropValue,
}

impl Prop {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn ty(&self) -> PropType {
        self.spec.ty
    }

    pub fn description(&self) -> Option<&str> {
        self.spec.description.as_deref().map(str::trim)
    }

    /// Position of the value in the binding's `enum:` list.
    pub fn enum_index(&self) -> Option<usize> {
        self.spec
            .enum_values
            .as_ref()?
            .iter()
            .position(|lit| self.value.matches(lit))
    }

    /// The string value as a C token.
    pub fn val_as_token(&self) -> Option<String> {
        match &self.value {
            PropValue::String(s) => Some(str_as_token(s)),
            _ => None,
        }
    }
}

/// A devicetree node combined with its binding.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) dt_id: dt::NodeId,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) labels: Vec<String>,
    pub(crate) aliases: Vec<String>,
    pub(crate) compats: Vec<String>,
    pub(crate) matching_compat: Option<String>,
    pub(crate) binding: Option<Arc<Binding>>,
    pub(crate) inferred_binding: bool,
    pub(crate) status: String,
    pub(crate) bus_node: Option<NodeId>,
    pub(crate) on_buses: Vec<String>,
    pub(crate) regs: Vec<Register>,
    pub(crate) ranges: Vec<Range>,
    pub(crate) props: IndexMap<String, Prop>,
    pub(crate) interrupts: Vec<ControllerAndData>,
    pub(crate) pinctrls: Vec<PinCtrl>,
    pub(crate) dep_ordinal: usize,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The underlying devicetree node.
    pub fn dt_id(&self) -> dt::NodeId {
        self.dt_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn compats(&self) -> &[String] {
        &self.compats
    }

    /// The `compatible` string the binding was matched on.
    pub fn matching_compat(&self) -> Option<&str> {
        self.matching_compat.as_deref()
    }

    pub fn binding(&self) -> Option<&Arc<Binding>> {
        self.binding.as_ref()
    }

    pub fn binding_path(&self) -> Option<&Path> {
        self.binding.as_ref()?.path.as_deref()
    }

    /// True if the binding was synthesized from the node's own properties.
    pub fn has_inferred_binding(&self) -> bool {
        self.inferred_binding
    }

    pub fn description(&self) -> Option<&str> {
        self.binding.as_ref()?.description.as_deref()
    }

    /// `status`, with `ok` normalized to `okay`. Missing means `okay`.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_okay(&self) -> bool {
        self.status == "okay"
    }

    /// Buses this node provides.
    pub fn buses(&self) -> &[String] {
        match &self.binding {
            Some(binding) => &binding.buses,
            None => &[],
        }
    }

    /// The closest ancestor that provides a bus.
    pub fn bus_node(&self) -> Option<NodeId> {
        self.bus_node
    }

    /// Buses this node sits on.
    pub fn on_buses(&self) -> &[String] {
        &self.on_buses
    }

    pub fn is_pci_device(&self) -> bool {
        self.on_buses.iter().any(|b| b == "pcie")
    }

    pub fn regs(&self) -> &[Register] {
        &self.regs
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn props(&self) -> &IndexMap<String, Prop> {
        &self.props
    }

    pub fn prop(&self, name: &str) -> Option<&Prop> {
        self.props.get(name)
    }

    pub fn interrupts(&self) -> &[ControllerAndData] {
        &self.interrupts
    }

    pub fn pinctrls(&self) -> &[PinCtrl] {
        &self.pinctrls
    }

    pub fn dep_ordinal(&self) -> usize {
        self.dep_ordinal
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binding_path() {
            Some(path) => write!(f, "<Node {}, binding {}>", self.path, path.display()),
            None => write!(f, "<Node {}, no binding>", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_by_type() {
        for (ty, lit, exp) in [
            (PropType::Int, Literal::Int(-3), Some(PropValue::Int(-3))),
            (
                PropType::Uint8Array,
                Literal::Ints(vec![1, 255]),
                Some(PropValue::Bytes(vec![1, 255])),
            ),
            (PropType::Uint8Array, Literal::Ints(vec![256]), None),
            (
                PropType::StringArray,
                Literal::Ints(vec![]),
                Some(PropValue::Strings(vec![])),
            ),
            (PropType::String, Literal::Int(1), None),
        ] {
            assert_eq!(PropValue::from_default(ty, &lit), exp, "{ty} {lit}");
        }
    }

    #[test]
    fn enum_positions() {
        let mut spec = PropertySpec::inferred("mode", PropType::String);
        spec.enum_values = Some(vec![Literal::Str("slow".into()), Literal::Str("fast".into())]);
        let prop = Prop {
            spec,
            value: PropValue::String("fast".into()),
        };
        assert_eq!(prop.enum_index(), Some(1));
        assert_eq!(prop.val_as_token().as_deref(), Some("fast"));

        let bytes = PropValue::Bytes(vec![1, 2]);
        assert!(bytes.matches(&Literal::Ints(vec![1, 2])));
        assert!(!bytes.matches(&Literal::Ints(vec![1])));
    }
}
