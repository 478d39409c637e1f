//! Extended devicetree (EDT).
//!
//! An [`Edt`] joins a parsed [`DeviceTree`] with the [`Bindings`] that
//! describe its nodes. Every devicetree node gets an EDT [`Node`] carrying
//! typed property values, translated `reg` addresses, resolved interrupts,
//! phandle-array entries split into named cells, pinctrl groups and a
//! dependency ordinal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use thiserror::Error;

use crate::binding::{self, display_path, Binding, Bindings, Literal, PropType, PropertySpec};
use crate::dt::{self, DeviceTree, Type};

mod addr;
mod graph;
mod nexus;
mod node;
mod pickle;

use graph::Graph;
pub use node::{ControllerAndData, Node, NodeId, PinCtrl, Prop, PropValue, Range, Register};
pub use pickle::{
    read_pickle, write_pickle, EdtSnapshot, NodeSnapshot, RegisterSnapshot, SpecifierSnapshot,
    ValueSnapshot,
};

#[derive(Debug, Error)]
pub enum Error {
    /// Semantic fault combining the devicetree and its bindings.
    #[error("{0}")]
    Invalid(String),

    /// A devicetree value conversion that failed on a specific node.
    #[error("{path}: {source}")]
    Node {
        path: String,
        #[source]
        source: dt::Error,
    },

    #[error(transparent)]
    Dt(#[from] dt::Error),

    #[error(transparent)]
    Binding(#[from] binding::Error),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to pickle the EDT: {0}")]
    Pickle(#[from] serde_pickle::Error),
}

pub(crate) fn err<T>(msg: impl Into<String>) -> Result<T, Error> {
    Err(Error::Invalid(msg.into()))
}

/// Attaches the path of the node being processed to devicetree errors.
pub(crate) trait NodeContext<T> {
    fn at(self, path: &str) -> Result<T, Error>;
}

impl<T> NodeContext<T> for Result<T, dt::Error> {
    fn at(self, path: &str) -> Result<T, Error> {
        self.map_err(|source| Error::Node {
            path: path.to_owned(),
            source,
        })
    }
}

/// Logs `msg`, or fails with it when warnings are errors.
fn warn(werror: bool, msg: String) -> Result<(), Error> {
    if werror {
        return err(msg);
    }
    warn!("{msg}");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EdtOptions {
    /// Warn when a node's unit address differs from its first `reg` address.
    pub warn_reg_unit_address_mismatch: bool,
    /// Type well-known properties of nodes without a binding.
    pub default_prop_types: bool,
    /// Treat `fixed-partitions` nodes as not sitting on any bus.
    pub support_fixed_partitions_on_any_bus: bool,
    /// Nodes whose binding is synthesized from their own properties.
    pub infer_binding_for_paths: HashSet<String>,
    /// Vendor prefix to vendor name, see [`load_vendor_prefixes`].
    pub vendor_prefixes: IndexMap<String, String>,
    /// Turn every warning into an error.
    pub werror: bool,
}

impl Default for EdtOptions {
    fn default() -> Self {
        Self {
            warn_reg_unit_address_mismatch: true,
            default_prop_types: true,
            support_fixed_partitions_on_any_bus: true,
            infer_binding_for_paths: HashSet::new(),
            vendor_prefixes: IndexMap::new(),
            werror: false,
        }
    }
}

/// A devicetree with bindings applied.
#[derive(Debug)]
pub struct Edt {
    dt: DeviceTree,
    bindings: Bindings,
    options: EdtOptions,
    nodes: Vec<Node>,
    dt2edt: HashMap<dt::NodeId, NodeId>,
    graph: Graph,
    label2node: IndexMap<String, NodeId>,
    compat2nodes: IndexMap<String, Vec<NodeId>>,
    compat2okay: IndexMap<String, Vec<NodeId>>,
    compat2vendor: IndexMap<String, String>,
    compat2model: IndexMap<String, String>,
    dep_ord2node: Vec<NodeId>,
    chosen: IndexMap<String, NodeId>,
}

impl Edt {
    /// Parses `dts`, loads the bindings for the compatibles it uses from
    /// `bindings_dirs` and builds the EDT.
    pub fn load(
        dts: &Path,
        include_path: &[PathBuf],
        bindings_dirs: &[PathBuf],
        options: EdtOptions,
    ) -> Result<Self, Error> {
        let dt = DeviceTree::parse_file(dts, include_path)?;
        let compats = dt_compats(&dt)?;
        let bindings = Bindings::load(bindings_dirs, Some(&compats))?;
        Self::new(dt, bindings, options)
    }

    pub fn new(dt: DeviceTree, bindings: Bindings, options: EdtOptions) -> Result<Self, Error> {
        addr::check_dt(&dt)?;

        let mut edt = Edt {
            dt,
            bindings,
            options,
            nodes: Vec::new(),
            dt2edt: HashMap::new(),
            graph: Graph::default(),
            label2node: IndexMap::new(),
            compat2nodes: IndexMap::new(),
            compat2okay: IndexMap::new(),
            compat2vendor: IndexMap::new(),
            compat2model: IndexMap::new(),
            dep_ord2node: Vec::new(),
            chosen: IndexMap::new(),
        };
        edt.init_nodes()?;
        edt.init_graph()?;
        edt.init_luts()?;
        edt.check()?;

        debug!(
            "built EDT for {} with {} nodes",
            edt.dt.filename().display(),
            edt.nodes.len()
        );
        Ok(edt)
    }

    /// The underlying devicetree.
    pub fn dt(&self) -> &DeviceTree {
        &self.dt
    }

    pub fn dts_path(&self) -> &Path {
        self.dt.filename()
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn bindings_dirs(&self) -> &[PathBuf] {
        &self.bindings.dirs
    }

    /// All nodes, in devicetree preorder.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The node at the devicetree path or alias `path`.
    pub fn get_node(&self, path: &str) -> Result<NodeId, Error> {
        let dt_id = self.dt.get_node(path)?;
        self.edt_id(dt_id)
    }

    /// `/chosen` entries that point at a node.
    pub fn chosen(&self) -> &IndexMap<String, NodeId> {
        &self.chosen
    }

    pub fn chosen_node(&self, name: &str) -> Option<NodeId> {
        self.chosen.get(name).copied()
    }

    pub fn label2node(&self) -> &IndexMap<String, NodeId> {
        &self.label2node
    }

    /// Nodes per compatible, with status "okay" nodes first.
    pub fn compat2nodes(&self) -> &IndexMap<String, Vec<NodeId>> {
        &self.compat2nodes
    }

    pub fn compat2okay(&self) -> &IndexMap<String, Vec<NodeId>> {
        &self.compat2okay
    }

    /// Vendor name per compatible, for compatibles with a known vendor
    /// prefix.
    pub fn compat2vendor(&self) -> &IndexMap<String, String> {
        &self.compat2vendor
    }

    /// The part after the vendor prefix, for the same compatibles as
    /// [`Edt::compat2vendor`].
    pub fn compat2model(&self) -> &IndexMap<String, String> {
        &self.compat2model
    }

    /// Nodes indexed by dependency ordinal.
    pub fn dep_ord2node(&self) -> &[NodeId] {
        &self.dep_ord2node
    }

    /// Nodes in dependency order.
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.dep_ord2node.iter().map(|id| &self.nodes[id.0])
    }

    /// Nodes `node` directly depends on.
    pub fn depends_on(&self, node: NodeId) -> &[NodeId] {
        self.graph.depends_on(node)
    }

    /// Nodes that directly depend on `node`.
    pub fn required_by(&self, node: NodeId) -> &[NodeId] {
        self.graph.required_by(node)
    }

    /// Position of `node` among its parent's children.
    pub fn child_index(&self, node: NodeId) -> Option<usize> {
        let parent = self.nodes[node.0].parent?;
        self.nodes[parent.0].children.iter().position(|&c| c == node)
    }

    /// The address from the node name (`foo@1000`), translated to the root
    /// address space. `None` without a unit address and for PCI devices.
    pub fn unit_addr(&self, node: NodeId) -> Result<Option<u128>, Error> {
        let node = &self.nodes[node.0];
        let Some((_, unit)) = node.name.split_once('@') else {
            return Ok(None);
        };
        if node.is_pci_device() {
            return Ok(None);
        }
        let Ok(addr) = u128::from_str_radix(unit, 16) else {
            return err(format!("{} has non-hex unit address", node.path));
        };
        addr::translate(&self.dt, addr, node.dt_id).map(Some)
    }

    fn edt_id(&self, dt_id: dt::NodeId) -> Result<NodeId, Error> {
        match self.dt2edt.get(&dt_id) {
            Some(&id) => Ok(id),
            None => err(format!("no EDT node for {}", self.dt.path(dt_id))),
        }
    }

    fn init_nodes(&mut self) -> Result<(), Error> {
        let order: Vec<dt::NodeId> = self.dt.node_iter().collect();
        for dt_id in order {
            let node = self.new_node(dt_id)?;
            if let Some(parent) = node.parent {
                self.nodes[parent.0].children.push(node.id);
            }
            self.dt2edt.insert(dt_id, node.id);
            self.nodes.push(node);
        }

        // These reference other nodes and their bindings.
        for i in 0..self.nodes.len() {
            let id = NodeId(i);
            let props = self.node_props(id)?;
            let interrupts = self.node_interrupts(id)?;
            let pinctrls = self.node_pinctrls(id)?;

            let node = &mut self.nodes[i];
            node.props = props;
            node.interrupts = interrupts;
            node.pinctrls = pinctrls;
        }

        for i in 0..self.nodes.len() {
            let linear: Vec<Option<u64>> = self.nodes[i]
                .interrupts
                .iter()
                .map(|irq| self.linear_irq(irq))
                .collect::<Result<_, _>>()?;
            for (irq, linear) in self.nodes[i].interrupts.iter_mut().zip(linear) {
                irq.linear_irq = linear;
            }
        }

        if self.options.warn_reg_unit_address_mismatch {
            for node in &self.nodes {
                let Some(addr) = node.regs.first().and_then(|reg| reg.addr) else {
                    continue;
                };
                if node.is_pci_device() {
                    continue;
                }
                if self.unit_addr(node.id)? != Some(addr) {
                    warn(
                        self.options.werror,
                        format!(
                            "unit address and first address in 'reg' (0x{addr:x}) don't match for {}",
                            node.path
                        ),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn new_node(&self, dt_id: dt::NodeId) -> Result<Node, Error> {
        let dt_node = self.dt.node(dt_id);
        let path = self.dt.path(dt_id);

        let compats = match dt_node.prop("compatible") {
            Some(prop) => prop
                .to_strings()
                .at(&path)?
                .into_iter()
                .map(str::to_owned)
                .collect(),
            None => Vec::new(),
        };
        let status = match dt_node.prop("status") {
            Some(prop) => match prop.to_str().at(&path)? {
                "ok" => "okay".to_owned(),
                status => status.to_owned(),
            },
            None => "okay".to_owned(),
        };
        let aliases = self
            .dt
            .aliases()
            .iter()
            .filter(|(_, target)| **target == dt_id)
            .map(|(alias, _)| alias.clone())
            .collect();

        let mut node = Node {
            id: NodeId(self.nodes.len()),
            dt_id,
            name: dt_node.name().to_owned(),
            path,
            parent: dt_node.parent().and_then(|p| self.dt2edt.get(&p).copied()),
            children: Vec::new(),
            labels: dt_node.labels().to_vec(),
            aliases,
            compats,
            matching_compat: None,
            binding: None,
            inferred_binding: false,
            status,
            bus_node: None,
            on_buses: Vec::new(),
            regs: Vec::new(),
            ranges: Vec::new(),
            props: IndexMap::new(),
            interrupts: Vec::new(),
            pinctrls: Vec::new(),
            dep_ordinal: 0,
        };

        node.bus_node = self.bus_node(&node);
        node.on_buses = node
            .bus_node
            .map(|bus| self.nodes[bus.0].buses().to_vec())
            .unwrap_or_default();
        self.init_binding(&mut node)?;
        node.regs = addr::regs(&self.dt, dt_id, node.is_pci_device())?;
        node.ranges = addr::ranges(&self.dt, dt_id)?;
        Ok(node)
    }

    fn bus_node(&self, node: &Node) -> Option<NodeId> {
        let parent = &self.nodes[node.parent?.0];
        if self.options.support_fixed_partitions_on_any_bus
            && node.compats.iter().any(|c| c == "fixed-partitions")
        {
            return None;
        }
        if !parent.buses().is_empty() {
            return Some(parent.id);
        }
        parent.bus_node
    }

    fn init_binding(&self, node: &mut Node) -> Result<(), Error> {
        if self.options.infer_binding_for_paths.contains(&node.path) {
            return self.infer_binding(node);
        }

        if node.compats.is_empty() {
            let from_parent = node
                .parent
                .and_then(|p| self.nodes[p.0].binding.as_ref())
                .and_then(|b| b.child_binding.clone());
            if let Some(binding) = from_parent {
                node.matching_compat = binding.compatible.clone();
                node.binding = Some(binding);
            }
            return Ok(());
        }

        // Respect the order of 'compatible', and prefer a binding for the bus
        // the node is on.
        for compat in &node.compats {
            let binding = node
                .on_buses
                .iter()
                .find_map(|bus| self.bindings.get(compat, Some(bus)))
                .or_else(|| self.bindings.get(compat, None));
            if let Some(binding) = binding {
                node.binding = Some(binding.clone());
                node.matching_compat = Some(compat.clone());
                break;
            }
        }
        Ok(())
    }

    fn infer_binding(&self, node: &mut Node) -> Result<(), Error> {
        if !node.compats.is_empty() {
            return err(format!(
                "compatible in node with inferred binding: {}",
                node.path
            ));
        }

        let mut specs = IndexMap::new();
        for (name, prop) in self.dt.node(node.dt_id).props() {
            let ty = match prop.ty() {
                Type::Empty => PropType::Boolean,
                Type::Bytes => PropType::Uint8Array,
                Type::Num => PropType::Int,
                Type::Nums => PropType::Array,
                Type::String => PropType::String,
                Type::Strings => PropType::StringArray,
                Type::Phandle => PropType::Phandle,
                Type::Phandles => PropType::Phandles,
                Type::PhandlesAndNums => PropType::PhandleArray,
                Type::Path => PropType::Path,
                Type::Compound => {
                    return err(format!(
                        "cannot infer binding from property: {prop} with type {:?}",
                        prop.ty()
                    ))
                }
            };
            specs.insert(name.clone(), PropertySpec::inferred(name, ty));
        }

        let mut binding = Binding::from_specs(specs);
        binding.description = Some("Inferred binding from properties".to_owned());
        node.binding = Some(Arc::new(binding));
        node.inferred_binding = true;
        Ok(())
    }

    fn node_props(&self, id: NodeId) -> Result<IndexMap<String, Prop>, Error> {
        let node = &self.nodes[id.0];
        let mut props = IndexMap::new();

        match &node.binding {
            Some(binding) if !binding.prop2specs.is_empty() => {
                for spec in binding.prop2specs.values() {
                    let Some(value) = self.prop_val(node, spec)? else {
                        continue;
                    };
                    self.check_value(node, spec, &value)?;
                    if spec.name.starts_with('#') || spec.name.ends_with("-map") {
                        continue;
                    }
                    props.insert(
                        spec.name.clone(),
                        Prop {
                            spec: spec.clone(),
                            value,
                        },
                    );
                }
            }
            _ if self.options.default_prop_types => {
                for name in self.dt.node(node.dt_id).props().keys() {
                    let Some(spec) = default_prop_spec(name) else {
                        continue;
                    };
                    if let Some(value) = self.prop_val(node, &spec)? {
                        props.insert(name.clone(), Prop { spec, value });
                    }
                }
            }
            _ => {}
        }
        Ok(props)
    }

    fn prop_val(&self, node: &Node, spec: &PropertySpec) -> Result<Option<PropValue>, Error> {
        let name = spec.name.as_str();
        let path = node.path.as_str();
        let binding_path = display_path(node.binding_path());
        let prop = self.dt.node(node.dt_id).prop(name);

        if prop.is_some() && spec.deprecated {
            warn(
                self.options.werror,
                format!(
                    "'{name}' is marked as deprecated in 'properties:' in {binding_path} for node {path}."
                ),
            )?;
        }

        let Some(prop) = prop else {
            if spec.required && node.is_okay() {
                return err(format!(
                    "'{name}' is marked as required in 'properties:' in {binding_path}, \
                     but does not appear in {path}"
                ));
            }
            if let Some(default) = &spec.default {
                return Ok(PropValue::from_default(spec.ty, default));
            }
            return Ok((spec.ty == PropType::Boolean).then_some(PropValue::Bool(false)));
        };

        let value = match spec.ty {
            PropType::Boolean => {
                if prop.ty() != Type::Empty {
                    return err(format!(
                        "'{name}' in {path} is defined with 'type: boolean' in {binding_path}, \
                         but is assigned a value ('{prop}') instead of being empty ('{name};')"
                    ));
                }
                PropValue::Bool(true)
            }
            PropType::Int => PropValue::Int(i64::from(prop.to_num().at(path)?)),
            PropType::Array => PropValue::Array(
                prop.to_nums()
                    .at(path)?
                    .into_iter()
                    .map(i64::from)
                    .collect(),
            ),
            PropType::Uint8Array => PropValue::Bytes(prop.to_bytes().at(path)?.to_vec()),
            PropType::String => PropValue::String(prop.to_str().at(path)?.to_owned()),
            PropType::StringArray => PropValue::Strings(
                prop.to_strings()
                    .at(path)?
                    .into_iter()
                    .map(str::to_owned)
                    .collect(),
            ),
            PropType::Phandle => PropValue::Phandle(self.edt_id(prop.to_node(&self.dt).at(path)?)?),
            PropType::Phandles => PropValue::Phandles(
                prop.to_nodes(&self.dt)
                    .at(path)?
                    .into_iter()
                    .map(|n| self.edt_id(n))
                    .collect::<Result<_, _>>()?,
            ),
            PropType::PhandleArray => {
                if !matches!(
                    prop.ty(),
                    Type::Phandle | Type::Phandles | Type::PhandlesAndNums
                ) {
                    return err(format!(
                        "expected property '{name}' in {path} in {} to be assigned with \
                         '{name} = < &foo ... &bar 1 ... &baz 2 3 >' (a mix of phandles and \
                         numbers), not '{prop}'",
                        self.dt.filename().display()
                    ));
                }
                PropValue::PhandleArray(self.phandle_array(node, prop, spec)?)
            }
            PropType::Path => PropValue::Path(self.edt_id(prop.to_path(&self.dt).at(path)?)?),
            PropType::Compound => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Checks a value against the `enum:` and `const:` of its spec.
    fn check_value(&self, node: &Node, spec: &PropertySpec, value: &PropValue) -> Result<(), Error> {
        let name = &spec.name;
        let dts = self.dt.filename().display();
        let binding_path = display_path(node.binding_path());

        if let Some(values) = &spec.enum_values {
            if !values.iter().any(|lit| value.matches(lit)) {
                return err(format!(
                    "value of property '{name}' on {} in {dts} ({value}) is not in 'enum' list \
                     in {binding_path} ({})",
                    node.path,
                    show_literals(values)
                ));
            }
        }
        if let Some(lit) = &spec.const_value {
            if !value.matches(lit) {
                return err(format!(
                    "value of property '{name}' on {} in {dts} ({value}) is different from the \
                     'const' value specified in {binding_path} ({lit})",
                    node.path
                ));
            }
        }
        Ok(())
    }

    fn phandle_array(
        &self,
        node: &Node,
        prop: &dt::Property,
        spec: &PropertySpec,
    ) -> Result<Vec<Option<ControllerAndData>>, Error> {
        let space = spec.specifier_space();
        let mut res = Vec::new();

        for entry in nexus::phandle_val_list(&self.dt, prop, &space)? {
            let Some((ctrl, data)) = entry else {
                res.push(None);
                continue;
            };
            let (ctrl, data) = nexus::map_phandle_array_entry(&self.dt, node.dt_id, ctrl, data, &space)?;
            let controller = self.edt_id(ctrl)?;
            res.push(Some(ControllerAndData {
                controller,
                data: self.named_cells(node, controller, &data, &space)?,
                name: None,
                basename: Some(space.clone()),
                linear_irq: None,
            }));
        }

        let names = addr::names(&self.dt, node.dt_id, &space, res.len())?;
        for (entry, name) in res.iter_mut().zip(names) {
            if let Some(entry) = entry {
                entry.name = name;
            }
        }
        Ok(res)
    }

    /// Maps the cells in `data` to the names from the controller binding's
    /// `<basename>-cells:`.
    fn named_cells(
        &self,
        node: &Node,
        controller: NodeId,
        data: &[u8],
        basename: &str,
    ) -> Result<IndexMap<String, u32>, Error> {
        let ctrl = &self.nodes[controller.0];
        let Some(binding) = &ctrl.binding else {
            return err(format!(
                "{basename} controller {} for {} lacks binding",
                ctrl.path, node.path
            ));
        };
        // No '<basename>-cells:' counts as an empty one.
        let names = binding
            .specifier2cells
            .get(basename)
            .map(Vec::as_slice)
            .unwrap_or_default();

        if data.len() % 4 != 0 {
            return err(format!(
                "{basename} specifier for {} has a length that isn't a multiple of 4",
                node.path
            ));
        }
        let cells: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if cells.len() != names.len() {
            return err(format!(
                "unexpected '{basename}-cells:' length in binding for {} - {} instead of {}",
                ctrl.path,
                names.len(),
                cells.len()
            ));
        }
        Ok(names.iter().cloned().zip(cells).collect())
    }

    fn node_interrupts(&self, id: NodeId) -> Result<Vec<ControllerAndData>, Error> {
        let node = &self.nodes[id.0];
        let mut res = Vec::new();
        for (ctrl, data) in nexus::interrupts(&self.dt, node.dt_id)? {
            let controller = self.edt_id(ctrl)?;
            res.push(ControllerAndData {
                controller,
                data: self.named_cells(node, controller, &data, "interrupt")?,
                name: None,
                basename: None,
                linear_irq: None,
            });
        }

        let names = addr::names(&self.dt, node.dt_id, "interrupt", res.len())?;
        for (irq, name) in res.iter_mut().zip(names) {
            irq.name = name;
        }
        Ok(res)
    }

    fn node_pinctrls(&self, id: NodeId) -> Result<Vec<PinCtrl>, Error> {
        let node = &self.nodes[id.0];
        let mut indexed: Vec<(usize, &dt::Property)> = self
            .dt
            .node(node.dt_id)
            .props()
            .iter()
            .filter_map(|(name, prop)| {
                let index = name.strip_prefix("pinctrl-")?;
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some((index.parse().ok()?, prop))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);

        for (i, (index, _)) in indexed.iter().enumerate() {
            if *index != i {
                return err(format!(
                    "missing 'pinctrl-{i}' property on {} - indices should be contiguous and \
                     start from zero",
                    node.path
                ));
            }
        }

        let mut pinctrls = indexed
            .into_iter()
            .map(|(_, prop)| {
                let conf_nodes = prop
                    .to_nodes(&self.dt)
                    .at(&node.path)?
                    .into_iter()
                    .map(|n| self.edt_id(n))
                    .collect::<Result<_, _>>()?;
                Ok(PinCtrl {
                    name: None,
                    conf_nodes,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let names = addr::names(&self.dt, node.dt_id, "pinctrl", pinctrls.len())?;
        for (pinctrl, name) in pinctrls.iter_mut().zip(names) {
            pinctrl.name = name;
        }
        Ok(pinctrls)
    }

    /// The `irq` cell of an interrupt as a linear IRQ number. GIC SPIs and
    /// PPIs are offset by 32 and 16. Each further level of interrupt
    /// controller shifts the number up by 8 bits and puts the parent
    /// controller's own `irq` in the low bits.
    fn linear_irq(&self, irq: &ControllerAndData) -> Result<Option<u64>, Error> {
        let Some(&num) = irq.data.get("irq") else {
            return Ok(None);
        };
        let mut num = u64::from(num);

        let ctrl = &self.nodes[irq.controller.0];
        if ctrl.compats.iter().any(|c| c == "arm,gic") {
            num = match irq.data.get("type") {
                Some(0) => num + 32,
                Some(1) => num + 16,
                Some(ty) => {
                    return err(format!(
                        "invalid interrupt type {ty} specified for interrupt controlled by {}",
                        ctrl.path
                    ))
                }
                None => {
                    return err(format!(
                        "expected binding for {} to have 'type' in interrupt-cells",
                        ctrl.path
                    ))
                }
            };
        }

        let mut seen = vec![irq.controller];
        let mut ctrl = irq.controller;
        while let Some(parent) = self.nodes[ctrl.0].interrupts.first() {
            let Some(&parent_irq) = parent.data.get("irq") else {
                return err(format!(
                    "expected binding for {} to have 'irq' in interrupt-cells",
                    self.nodes[ctrl.0].path
                ));
            };
            num = ((num + 1) << 8) | u64::from(parent_irq);
            if seen.contains(&parent.controller) {
                break;
            }
            seen.push(parent.controller);
            ctrl = parent.controller;
        }
        Ok(Some(num))
    }

    fn init_graph(&mut self) -> Result<(), Error> {
        let mut graph = Graph::new(self.nodes.len());
        for node in &self.nodes {
            // A node always depends on its parent.
            for &child in &node.children {
                graph.add_edge(child, node.id);
            }
            self.add_prop_edges(&mut graph, node.id, node.id);
        }

        let order = graph.scc_order();
        for scc in &order {
            if scc.len() > 1 {
                let paths: Vec<&str> = scc.iter().map(|id| self.nodes[id.0].path.as_str()).collect();
                return err(format!("cycle in devicetree involving {}", paths.join(", ")));
            }
        }

        for (ordinal, scc) in order.iter().enumerate() {
            for id in scc {
                self.nodes[id.0].dep_ordinal = ordinal;
            }
        }
        self.dep_ord2node = order.iter().filter_map(|scc| scc.first().copied()).collect();
        self.graph = graph;
        Ok(())
    }

    /// Makes `root` depend on everything the properties and interrupts of
    /// `node` point at. Children described by `node`'s child-binding are
    /// folded into `root` as well.
    fn add_prop_edges(&self, graph: &mut Graph, root: NodeId, node: NodeId) {
        let node = &self.nodes[node.0];
        for prop in node.props.values() {
            match &prop.value {
                PropValue::Phandle(to) => graph.add_edge(root, *to),
                PropValue::Phandles(to) => {
                    for &to in to {
                        graph.add_edge(root, to);
                    }
                }
                PropValue::PhandleArray(entries) => {
                    for entry in entries.iter().flatten() {
                        graph.add_edge(root, entry.controller);
                    }
                }
                _ => {}
            }
        }

        for irq in &node.interrupts {
            graph.add_edge(root, irq.controller);
        }

        if node.binding.as_ref().is_some_and(|b| b.child_binding.is_some()) {
            for &child in &node.children {
                let dt_child = self.dt.node(self.nodes[child.0].dt_id);
                if dt_child.prop("compatible").is_none() {
                    self.add_prop_edges(graph, root, child);
                }
            }
        }
    }

    fn init_luts(&mut self) -> Result<(), Error> {
        let werror = self.options.werror;

        for node in &self.nodes {
            for label in &node.labels {
                self.label2node.insert(label.clone(), node.id);
            }

            for compat in &node.compats {
                self.compat2nodes
                    .entry(compat.clone())
                    .or_default()
                    .push(node.id);
                if node.is_okay() {
                    self.compat2okay
                        .entry(compat.clone())
                        .or_default()
                        .push(node.id);
                }

                if self.compat2vendor.contains_key(compat) {
                    continue;
                }
                if !valid_compat(compat) {
                    return err(format!(
                        "node '{}' compatible '{compat}' must match this regular expression: \
                         '^[a-zA-Z][a-zA-Z0-9,+\\-._]+$'",
                        node.path
                    ));
                }

                if self.options.vendor_prefixes.is_empty() {
                    continue;
                }
                let Some((vendor, model)) = compat.split_once(',') else {
                    continue;
                };
                if let Some(name) = self.options.vendor_prefixes.get(vendor) {
                    self.compat2vendor.insert(compat.clone(), name.clone());
                    self.compat2model.insert(compat.clone(), model.to_owned());
                } else if node.path != "/" {
                    // The root node may have whatever compatibles it wants.
                    warn(
                        werror,
                        format!(
                            "node '{}' compatible '{compat}' has unknown vendor prefix '{vendor}'",
                            node.path
                        ),
                    )?;
                }
            }
        }

        let nodes = &self.nodes;
        for ids in self.compat2nodes.values_mut() {
            ids.sort_by_key(|id| !nodes[id.0].is_okay());
        }

        if let Ok(chosen) = self.dt.get_node("/chosen") {
            for (name, prop) in self.dt.node(chosen).props() {
                // Values that aren't paths, or paths that don't exist, are
                // skipped.
                let Ok(target) = prop.to_path(&self.dt) else {
                    continue;
                };
                if let Some(&id) = self.dt2edt.get(&target) {
                    self.chosen.insert(name.clone(), id);
                }
            }
        }
        Ok(())
    }

    /// Tree-wide checks.
    fn check(&self) -> Result<(), Error> {
        for binding in self.bindings.iter() {
            for spec in binding.prop2specs.values() {
                if spec.ty != PropType::String {
                    continue;
                }
                let Some(values) = &spec.enum_values else {
                    continue;
                };
                let compat = binding.compatible.as_deref().unwrap_or_default();
                let path = display_path(binding.path.as_deref());

                if !spec.enum_tokenizable() {
                    warn(
                        self.options.werror,
                        format!(
                            "compatible '{compat}' in binding '{path}' has non-tokenizable enum \
                             for property '{}': {}",
                            spec.name,
                            show_literals(values)
                        ),
                    )?;
                } else if !spec.enum_upper_tokenizable() {
                    warn(
                        self.options.werror,
                        format!(
                            "compatible '{compat}' in binding '{path}' has enum for property \
                             '{}' that is only tokenizable in lowercase: {}",
                            spec.name,
                            show_literals(values)
                        ),
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Edt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dirs: Vec<String> = self
            .bindings
            .dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect();
        write!(
            f,
            "<EDT for '{}', binding directories '{dirs:?}'>",
            self.dt.filename().display()
        )
    }
}

/// Every string in a `compatible` property of `dt`.
pub fn dt_compats(dt: &DeviceTree) -> Result<HashSet<String>, Error> {
    let mut compats = HashSet::new();
    for id in dt.node_iter() {
        if let Some(prop) = dt.node(id).prop("compatible") {
            let strings = prop.to_strings().at(&dt.path(id))?;
            compats.extend(strings.into_iter().map(str::to_owned));
        }
    }
    Ok(compats)
}

/// Reads a vendor prefix file: `<prefix><TAB><vendor name>` per line, with
/// blank lines and `#` comments ignored.
pub fn load_vendor_prefixes(path: &Path) -> Result<IndexMap<String, String>, Error> {
    let text = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut prefixes = IndexMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((prefix, vendor)) = line.split_once('\t') else {
            return err(format!(
                "{}:{}: expected '<prefix><TAB><vendor>', got '{line}'",
                path.display(),
                lineno + 1
            ));
        };
        prefixes.insert(prefix.to_owned(), vendor.to_owned());
    }
    Ok(prefixes)
}

/// Property types assumed for nodes that have no binding.
fn default_prop_spec(name: &str) -> Option<PropertySpec> {
    let ty = match name {
        "compatible" | "reg-names" | "interrupt-names" => PropType::StringArray,
        "status" | "label" => PropType::String,
        "reg" | "interrupts" => PropType::Array,
        "ranges" | "interrupts-extended" => PropType::Compound,
        "interrupt-controller" => PropType::Boolean,
        _ => return None,
    };
    let mut spec = PropertySpec::inferred(name, ty);
    if name == "status" {
        spec.enum_values = Some(
            ["ok", "okay", "disabled", "reserved", "fail", "fail-sss"]
                .into_iter()
                .map(|s| Literal::Str(s.to_owned()))
                .collect(),
        );
    }
    Some(spec)
}

/// Same rule as dt-schema: `^[a-zA-Z][a-zA-Z0-9,+\-._]+$`.
fn valid_compat(compat: &str) -> bool {
    let mut chars = compat.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let rest = chars.as_str();
    first.is_ascii_alphabetic()
        && !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ",+-._".contains(c))
}

fn show_literals(values: &[Literal]) -> String {
    let values: Vec<String> = values.iter().map(Literal::to_string).collect();
    format!("[{}]", values.join(", "))
}
