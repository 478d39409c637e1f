//! `reg` and `ranges` decoding and address translation.

use crate::dt::{DeviceTree, NodeId, Type};

use super::node::{Range, Register};
use super::{err, Error, NodeContext};

/// `#address-cells` of the parent of `node`, which sizes addresses in the
/// node's `reg`.
pub(super) fn address_cells(dt: &DeviceTree, node: NodeId) -> Result<u32, Error> {
    parent_cells(dt, node, "#address-cells", 2)
}

/// `#size-cells` of the parent of `node`.
pub(super) fn size_cells(dt: &DeviceTree, node: NodeId) -> Result<u32, Error> {
    parent_cells(dt, node, "#size-cells", 1)
}

fn parent_cells(dt: &DeviceTree, node: NodeId, name: &str, default: u32) -> Result<u32, Error> {
    let Some(parent) = dt.node(node).parent() else {
        return Ok(default);
    };
    own_cells(dt, parent, name, default)
}

/// Addresses and sizes are held in a `u128`, which fits four cells.
const MAX_CELLS: u32 = 4;

fn own_cells(dt: &DeviceTree, node: NodeId, name: &str, default: u32) -> Result<u32, Error> {
    let Some(prop) = dt.node(node).prop(name) else {
        return Ok(default);
    };
    let path = dt.path(node);
    let cells = prop.to_num().at(&path)?;
    if cells > MAX_CELLS {
        return err(format!(
            "'{name}' in {path} is {cells}, but addresses and sizes wider than {MAX_CELLS} \
             cells are not supported"
        ));
    }
    Ok(cells)
}

/// Big-endian value of a run of at most four cells.
pub(super) fn to_num(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | u128::from(*b))
}

/// Splits the value of `prop_name` on `node` into `size`-byte records.
pub(super) fn slice<'a>(
    dt: &'a DeviceTree,
    node: NodeId,
    prop_name: &str,
    size: usize,
    size_hint: &str,
) -> Result<Vec<&'a [u8]>, Error> {
    let value = dt.node(node).prop(prop_name).map_or(&[][..], |p| p.value());
    if size == 0 {
        if value.is_empty() {
            return Ok(Vec::new());
        }
        return err(format!(
            "'{prop_name}' property in {} has a value, but its records are zero bytes long (= {size_hint})",
            dt.path(node)
        ));
    }
    if value.len() % size != 0 {
        return err(format!(
            "'{prop_name}' property in {} has length {}, which is not evenly divisible by {size} \
             (= {size_hint}). Note that #*-cells properties come either from the parent node or \
             from the controller (in the case of 'interrupts').",
            dt.path(node),
            value.len()
        ));
    }
    Ok(value.chunks_exact(size).collect())
}

/// Translates `addr` on `node` into the address space of the root, through
/// every ancestor's `ranges`.
pub(super) fn translate(dt: &DeviceTree, addr: u128, node: NodeId) -> Result<u128, Error> {
    let Some(parent) = dt.node(node).parent() else {
        return Ok(addr);
    };
    let Some(ranges) = dt.node(parent).prop("ranges") else {
        return Ok(addr);
    };
    if ranges.value().is_empty() {
        return translate(dt, addr, parent);
    }

    let child_address_cells = address_cells(dt, node)? as usize;
    let parent_address_cells = address_cells(dt, parent)? as usize;
    let child_size_cells = size_cells(dt, node)? as usize;
    let entry_cells = child_address_cells + parent_address_cells + child_size_cells;

    let hint = format!(
        "4*(<#address-cells> (= {child_address_cells}) + <#address-cells for parent> \
         (= {parent_address_cells}) + <#size-cells> (= {child_size_cells}))"
    );
    for raw in slice(dt, parent, "ranges", 4 * entry_cells, &hint)? {
        let (child_addr, rest) = raw.split_at(4 * child_address_cells);
        let (parent_addr, len) = rest.split_at(4 * parent_address_cells);
        let (child_addr, parent_addr, len) = (to_num(child_addr), to_num(parent_addr), to_num(len));

        if child_addr <= addr && addr - child_addr < len {
            let Some(translated) = parent_addr.checked_add(addr - child_addr) else {
                return err(format!(
                    "address {addr:#x} in {} overflows when translated through the 'ranges' \
                     of {}",
                    dt.path(node),
                    dt.path(parent)
                ));
            };
            return translate(dt, translated, parent);
        }
    }
    Ok(addr)
}

pub(super) fn regs(dt: &DeviceTree, node: NodeId, is_pci: bool) -> Result<Vec<Register>, Error> {
    if dt.node(node).prop("reg").is_none() {
        return Ok(Vec::new());
    }

    let address_cells = address_cells(dt, node)? as usize;
    let size_cells = size_cells(dt, node)? as usize;
    let hint = format!(
        "4*(<#address-cells> (= {address_cells}) + <#size-cells> (= {size_cells}))"
    );

    let mut regs = Vec::new();
    for raw in slice(dt, node, "reg", 4 * (address_cells + size_cells), &hint)? {
        let (addr, size) = raw.split_at(4 * address_cells);
        let addr = match address_cells {
            0 => None,
            _ => Some(translate(dt, to_num(addr), node)?),
        };
        let size = match size_cells {
            0 => None,
            _ => Some(to_num(size)),
        };
        if size == Some(0) && !is_pci {
            return err(format!(
                "zero-sized 'reg' in {} seems meaningless (maybe you want a size of one or \
                 #size-cells = 0 instead)",
                dt.path(node)
            ));
        }
        regs.push(Register {
            name: None,
            addr,
            size,
        });
    }

    let names = names(dt, node, "reg", regs.len())?;
    for (reg, name) in regs.iter_mut().zip(names) {
        reg.name = name;
    }
    Ok(regs)
}

pub(super) fn ranges(dt: &DeviceTree, node: NodeId) -> Result<Vec<Range>, Error> {
    let Some(prop) = dt.node(node).prop("ranges") else {
        return Ok(Vec::new());
    };

    let child_address_cells = own_cells(dt, node, "#address-cells", 2)?;
    let parent_address_cells = address_cells(dt, node)?;
    let child_size_cells = own_cells(dt, node, "#size-cells", 1)?;
    let entry_cells = (child_address_cells + parent_address_cells + child_size_cells) as usize;

    if entry_cells == 0 {
        if prop.value().is_empty() {
            return Ok(Vec::new());
        }
        return err(format!(
            "'ranges' should be empty in {} since <#address-cells> = {child_address_cells}, \
             <#address-cells for parent> = {parent_address_cells} and <#size-cells> = {child_size_cells}",
            dt.path(node)
        ));
    }

    let hint = format!(
        "4*(<#address-cells> (= {child_address_cells}) + <#address-cells for parent> \
         (= {parent_address_cells}) + <#size-cells> (= {child_size_cells}))"
    );
    let cells = |n: u32, raw: &[u8]| (n != 0).then(|| to_num(raw));

    slice(dt, node, "ranges", 4 * entry_cells, &hint)?
        .into_iter()
        .map(|raw| {
            let (child, rest) = raw.split_at(4 * child_address_cells as usize);
            let (parent, len) = rest.split_at(4 * parent_address_cells as usize);
            Ok(Range {
                child_bus_cells: child_address_cells,
                child_bus_addr: cells(child_address_cells, child),
                parent_bus_cells: parent_address_cells,
                parent_bus_addr: cells(parent_address_cells, parent),
                length_cells: child_size_cells,
                length: cells(child_size_cells, len),
            })
        })
        .collect()
}

/// Names for `count` objects from the `<ident>-names` property, if present.
pub(super) fn names(
    dt: &DeviceTree,
    node: NodeId,
    ident: &str,
    count: usize,
) -> Result<Vec<Option<String>>, Error> {
    let full = format!("{ident}-names");
    let Some(prop) = dt.node(node).prop(&full) else {
        return Ok(vec![None; count]);
    };

    let path = dt.path(node);
    let names = prop.to_strings().at(&path)?;
    if names.len() != count {
        return err(format!(
            "{full} property in {path} in {} has {} strings, expected {count} strings",
            dt.filename().display(),
            names.len()
        ));
    }
    Ok(names.into_iter().map(|n| Some(n.to_owned())).collect())
}

/// Devicetree checks stricter than what parsing enforces.
pub(super) fn check_dt(dt: &DeviceTree) -> Result<(), Error> {
    const OK_STATUS: [&str; 6] = ["ok", "okay", "disabled", "reserved", "fail", "fail-sss"];

    for id in dt.node_iter() {
        let node = dt.node(id);
        if let Some(status) = node.prop("status") {
            let path = dt.path(id);
            let value = status.to_str().at(&path)?;
            if !OK_STATUS.contains(&value) {
                return err(format!(
                    "unknown 'status' value \"{value}\" in {path} in {}, expected one of {} \
                     (see the devicetree specification)",
                    dt.filename().display(),
                    OK_STATUS.join(", ")
                ));
            }
        }

        if let Some(ranges) = node.prop("ranges") {
            if !matches!(ranges.ty(), Type::Empty | Type::Nums) {
                return err(format!(
                    "expected 'ranges = < ... >;' in {} in {}, not '{ranges}' \
                     (see the devicetree specification)",
                    dt.path(id),
                    dt.filename().display()
                ));
            }
        }
    }
    Ok(())
}
