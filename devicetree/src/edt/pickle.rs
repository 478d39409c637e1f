//! A plain-data snapshot of the EDT, pickled for tools that post-process the
//! devicetree after the header is generated.

use std::io::{Read, Write};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_pickle::{DeOptions, SerOptions};

use super::node::{ControllerAndData, Node, NodeId, PropValue};
use super::{Edt, Error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdtSnapshot {
    pub dts_path: String,
    pub bindings_dirs: Vec<String>,
    /// In devicetree preorder.
    pub nodes: Vec<NodeSnapshot>,
    /// `/chosen` name to node path.
    pub chosen: IndexMap<String, String>,
    /// Compatible to node paths, status "okay" only.
    pub compat2okay: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub path: String,
    pub name: String,
    pub dep_ordinal: usize,
    pub parent: Option<String>,
    pub labels: Vec<String>,
    pub compats: Vec<String>,
    pub matching_compat: Option<String>,
    pub binding_path: Option<String>,
    pub status: String,
    pub bus_node: Option<String>,
    pub regs: Vec<RegisterSnapshot>,
    pub interrupts: Vec<SpecifierSnapshot>,
    pub props: IndexMap<String, ValueSnapshot>,
}

/// Addresses and sizes are hex strings, as they may not fit in 64 bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub name: Option<String>,
    pub addr: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecifierSnapshot {
    /// Path of the controller node.
    pub controller: String,
    pub name: Option<String>,
    pub data: IndexMap<String, u32>,
}

/// A property value with node references replaced by paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSnapshot {
    Bool(bool),
    Int(i64),
    Array(Vec<i64>),
    Bytes(Vec<u8>),
    String(String),
    Strings(Vec<String>),
    Node(String),
    Nodes(Vec<String>),
    PhandleArray(Vec<Option<SpecifierSnapshot>>),
}

impl Edt {
    pub fn snapshot(&self) -> EdtSnapshot {
        let path = |id: NodeId| self.node(id).path().to_owned();
        let paths = |ids: &[NodeId]| ids.iter().map(|&id| path(id)).collect::<Vec<_>>();

        EdtSnapshot {
            dts_path: self.dts_path().display().to_string(),
            bindings_dirs: self
                .bindings_dirs()
                .iter()
                .map(|d| d.display().to_string())
                .collect(),
            nodes: self.nodes.iter().map(|n| self.node_snapshot(n)).collect(),
            chosen: self
                .chosen
                .iter()
                .map(|(name, &id)| (name.clone(), path(id)))
                .collect(),
            compat2okay: self
                .compat2okay
                .iter()
                .map(|(compat, ids)| (compat.clone(), paths(ids)))
                .collect(),
        }
    }

    fn node_snapshot(&self, node: &Node) -> NodeSnapshot {
        let path = |id: NodeId| self.node(id).path().to_owned();
        let hex = |n: Option<u128>| n.map(|n| format!("{n:#x}"));

        NodeSnapshot {
            path: node.path.clone(),
            name: node.name.clone(),
            dep_ordinal: node.dep_ordinal,
            parent: node.parent.map(path),
            labels: node.labels.clone(),
            compats: node.compats.clone(),
            matching_compat: node.matching_compat.clone(),
            binding_path: node.binding_path().map(|p| p.display().to_string()),
            status: node.status.clone(),
            bus_node: node.bus_node.map(path),
            regs: node
                .regs
                .iter()
                .map(|reg| RegisterSnapshot {
                    name: reg.name.clone(),
                    addr: hex(reg.addr),
                    size: hex(reg.size),
                })
                .collect(),
            interrupts: node.interrupts.iter().map(|irq| self.specifier(irq)).collect(),
            props: node
                .props
                .iter()
                .map(|(name, prop)| (name.clone(), self.value_snapshot(&prop.value)))
                .collect(),
        }
    }

    fn specifier(&self, entry: &ControllerAndData) -> SpecifierSnapshot {
        SpecifierSnapshot {
            controller: self.node(entry.controller).path().to_owned(),
            name: entry.name.clone(),
            data: entry.data.clone(),
        }
    }

    fn value_snapshot(&self, value: &PropValue) -> ValueSnapshot {
        let path = |id: &NodeId| self.node(*id).path().to_owned();
        match value {
            PropValue::Bool(b) => ValueSnapshot::Bool(*b),
            PropValue::Int(n) => ValueSnapshot::Int(*n),
            PropValue::Array(v) => ValueSnapshot::Array(v.clone()),
            PropValue::Bytes(v) => ValueSnapshot::Bytes(v.clone()),
            PropValue::String(s) => ValueSnapshot::String(s.clone()),
            PropValue::Strings(v) => ValueSnapshot::Strings(v.clone()),
            PropValue::Phandle(id) | PropValue::Path(id) => ValueSnapshot::Node(path(id)),
            PropValue::Phandles(ids) => ValueSnapshot::Nodes(ids.iter().map(path).collect()),
            PropValue::PhandleArray(entries) => ValueSnapshot::PhandleArray(
                entries
                    .iter()
                    .map(|e| e.as_ref().map(|e| self.specifier(e)))
                    .collect(),
            ),
        }
    }
}

/// Pickles a snapshot of `edt` into `writer`.
pub fn write_pickle<W: Write>(edt: &Edt, writer: &mut W) -> Result<(), Error> {
    serde_pickle::to_writer(writer, &edt.snapshot(), SerOptions::new())?;
    Ok(())
}

pub fn read_pickle<R: Read>(reader: R) -> Result<EdtSnapshot, Error> {
    Ok(serde_pickle::from_reader(reader, DeOptions::new())?)
}
