//! Specifier lists (`<&ctrl 1 2 &ctrl2 3>`) and their translation through
//! nexus nodes (`interrupt-map`, `gpio-map`, ...).

use crate::dt::{DeviceTree, NodeId, Property};

use super::addr::{address_cells, slice};
use super::{err, Error, NodeContext};

/// A resolved specifier: the controller and its raw cells.
pub(super) type Specifier = (NodeId, Vec<u8>);

/// Parses a `<phandle> <cells...> <phandle> <cells...>` value. Each phandle's
/// node supplies the cell count through `#<cells_name>-cells`. A phandle that
/// points nowhere yields `None`.
pub(super) fn phandle_val_list(
    dt: &DeviceTree,
    prop: &Property,
    cells_name: &str,
) -> Result<Vec<Option<Specifier>>, Error> {
    let full = format!("#{cells_name}-cells");
    let mut raw = prop.value();
    let mut res = Vec::new();

    while !raw.is_empty() {
        if raw.len() < 4 {
            return err(format!("bad value for {prop}"));
        }
        let phandle = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        raw = &raw[4..];

        let Some(node) = dt.phandle2node(phandle) else {
            res.push(None);
            continue;
        };
        let Some(cells) = dt.node(node).prop(&full) else {
            return err(format!("{} lacks {full}", dt.path(node)));
        };
        let n = 4 * cells.to_num().at(&dt.path(node))? as usize;
        if raw.len() < n {
            return err(format!(
                "missing data after phandle in '{}' on {}",
                prop.name(),
                dt.path(prop.node())
            ));
        }
        res.push(Some((node, raw[..n].to_vec())));
        raw = &raw[n..];
    }
    Ok(res)
}

/// The interrupts generated by `node`, each with its final controller after
/// `interrupt-map` translation. `interrupts-extended` wins over
/// `interrupts`.
pub(super) fn interrupts(dt: &DeviceTree, node: NodeId) -> Result<Vec<Specifier>, Error> {
    let dt_node = dt.node(node);

    if let Some(prop) = dt_node.prop("interrupts-extended") {
        return phandle_val_list(dt, prop, "interrupt")?
            .into_iter()
            .map(|entry| match entry {
                Some((iparent, spec)) => map_interrupt(dt, node, iparent, spec),
                None => err(format!(
                    "node '{}' interrupts-extended property has an empty element",
                    dt.path(node)
                )),
            })
            .collect();
    }

    if dt_node.prop("interrupts").is_some() {
        let iparent = interrupt_parent(dt, node)?;
        let cells = interrupt_cells(dt, iparent)? as usize;
        return slice(dt, node, "interrupts", 4 * cells, "4*<#interrupt-cells>")?
            .into_iter()
            .map(|raw| map_interrupt(dt, node, iparent, raw.to_vec()))
            .collect();
    }

    Ok(Vec::new())
}

/// The node named by the closest `interrupt-parent`, searching upwards from
/// `start`.
fn interrupt_parent(dt: &DeviceTree, start: NodeId) -> Result<NodeId, Error> {
    let mut cur = Some(start);
    while let Some(node) = cur {
        if let Some(prop) = dt.node(node).prop("interrupt-parent") {
            return prop.to_node(dt).at(&dt.path(node));
        }
        cur = dt.node(node).parent();
    }
    err(format!(
        "{} has an 'interrupts' property, but neither the node nor any of its parents has an \
         'interrupt-parent' property",
        dt.path(start)
    ))
}

fn interrupt_cells(dt: &DeviceTree, node: NodeId) -> Result<u32, Error> {
    match dt.node(node).prop("#interrupt-cells") {
        Some(prop) => prop.to_num().at(&dt.path(node)),
        None => err(format!("{} lacks #interrupt-cells", dt.path(node))),
    }
}

/// `#address-cells` on `node` itself, as needed by `interrupt-map`.
fn own_address_cells(dt: &DeviceTree, node: NodeId) -> Result<u32, Error> {
    match dt.node(node).prop("#address-cells") {
        Some(prop) => prop.to_num().at(&dt.path(node)),
        None => err(format!(
            "missing #address-cells on {} (while handling interrupt-map)",
            dt.path(node)
        )),
    }
}

fn map_interrupt(
    dt: &DeviceTree,
    child: NodeId,
    parent: NodeId,
    child_spec: Vec<u8>,
) -> Result<Specifier, Error> {
    if dt.node(parent).prop("interrupt-controller").is_some() {
        return Ok((parent, child_spec));
    }

    let mut spec = raw_unit_addr(dt, child)?.to_vec();
    spec.extend_from_slice(&child_spec);

    let spec_len = |node: NodeId| -> Result<usize, Error> {
        Ok((own_address_cells(dt, node)? + interrupt_cells(dt, node)?) as usize)
    };
    let (parent, raw) = map(dt, "interrupt", child, parent, spec, &spec_len, true)?;

    let skip = 4 * own_address_cells(dt, parent)? as usize;
    Ok((parent, raw.get(skip..).unwrap_or_default().to_vec()))
}

/// Follows `<basename>-map` on `parent` for one phandle-array entry.
pub(super) fn map_phandle_array_entry(
    dt: &DeviceTree,
    child: NodeId,
    parent: NodeId,
    child_spec: Vec<u8>,
    basename: &str,
) -> Result<Specifier, Error> {
    let cells_name = format!("#{basename}-cells");
    let spec_len = |node: NodeId| -> Result<usize, Error> {
        match dt.node(node).prop(&cells_name) {
            Some(prop) => Ok(prop.to_num().at(&dt.path(node))? as usize),
            None => err(format!(
                "expected '{cells_name}' property on {} (referenced by {})",
                dt.path(node),
                dt.path(child)
            )),
        }
    };
    map(dt, basename, child, parent, child_spec, &spec_len, false)
}

/// Translates `child_spec` headed from `child` to `parent` through
/// `<prefix>-map` on `parent`, recursively, and returns the final
/// destination. `spec_len` gives the specifier length in cells of a parent
/// named in the map.
fn map(
    dt: &DeviceTree,
    prefix: &str,
    child: NodeId,
    parent: NodeId,
    child_spec: Vec<u8>,
    spec_len: &dyn Fn(NodeId) -> Result<usize, Error>,
    require_controller: bool,
) -> Result<Specifier, Error> {
    let parent_node = dt.node(parent);
    let map_name = format!("{prefix}-map");
    let Some(map_prop) = parent_node.prop(&map_name) else {
        if require_controller && parent_node.prop(&format!("{prefix}-controller")).is_none() {
            return err(format!(
                "expected '{prefix}-controller' property on {} (referenced by {})",
                dt.path(parent),
                dt.path(child)
            ));
        }
        return Ok((parent, child_spec));
    };

    let masked = mask(dt, prefix, child, parent, &child_spec)?;
    let bad = |what: &str| {
        err(format!(
            "bad value for '{map_name}' on {}, {what}",
            dt.path(parent)
        ))
    };

    let mut raw = map_prop.value();
    while !raw.is_empty() {
        if raw.len() < child_spec.len() {
            return bad("missing/truncated child data");
        }
        let (entry, rest) = raw.split_at(child_spec.len());
        raw = rest;

        if raw.len() < 4 {
            return bad("missing/truncated phandle");
        }
        let phandle = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        raw = &raw[4..];
        let Some(map_parent) = dt.phandle2node(phandle) else {
            return err(format!(
                "bad phandle ({phandle}) in '{map_name}' on {}",
                dt.path(parent)
            ));
        };

        let len = 4 * spec_len(map_parent)?;
        if raw.len() < len {
            return bad("missing/truncated parent data");
        }
        let (parent_spec, rest) = raw.split_at(len);
        raw = rest;

        if entry == masked.as_slice() {
            let parent_spec = pass_thru(dt, prefix, child, parent, &child_spec, parent_spec)?;
            return map(
                dt,
                prefix,
                parent,
                map_parent,
                parent_spec,
                spec_len,
                require_controller,
            );
        }
    }

    err(format!(
        "child specifier for {} ({:02x?}) does not appear in '{map_name}' on {}",
        dt.path(child),
        child_spec,
        dt.path(parent)
    ))
}

fn mask(
    dt: &DeviceTree,
    prefix: &str,
    child: NodeId,
    parent: NodeId,
    child_spec: &[u8],
) -> Result<Vec<u8>, Error> {
    let Some(mask) = dt.node(parent).prop(&format!("{prefix}-map-mask")) else {
        return Ok(child_spec.to_vec());
    };
    let mask = mask.value();
    if mask.len() != child_spec.len() {
        return err(format!(
            "{}: expected '{prefix}-mask' in {} to be {} bytes, is {} bytes",
            dt.path(child),
            dt.path(parent),
            child_spec.len(),
            mask.len()
        ));
    }
    Ok(and(child_spec, mask))
}

fn pass_thru(
    dt: &DeviceTree,
    prefix: &str,
    child: NodeId,
    parent: NodeId,
    child_spec: &[u8],
    parent_spec: &[u8],
) -> Result<Vec<u8>, Error> {
    let Some(prop) = dt.node(parent).prop(&format!("{prefix}-map-pass-thru")) else {
        return Ok(parent_spec.to_vec());
    };
    let pass = prop.value();
    if pass.len() != child_spec.len() {
        return err(format!(
            "{}: expected '{prefix}-map-pass-thru' in {} to be {} bytes, is {} bytes",
            dt.path(child),
            dt.path(parent),
            child_spec.len(),
            pass.len()
        ));
    }

    let res = or(&and(child_spec, pass), &and(parent_spec, &not(pass)));
    Ok(res[res.len().saturating_sub(parent_spec.len())..].to_vec())
}

/// The unit address of `node`, from the first `#address-cells` of `reg`.
fn raw_unit_addr(dt: &DeviceTree, node: NodeId) -> Result<&[u8], Error> {
    let Some(reg) = dt.node(node).prop("reg") else {
        return err(format!(
            "{} lacks 'reg' property (needed for 'interrupt-map' unit address lookup)",
            dt.path(node)
        ));
    };
    let len = 4 * address_cells(dt, node)? as usize;
    match reg.value().get(..len) {
        Some(addr) => Ok(addr),
        None => err(format!(
            "{} has too short 'reg' property (while doing 'interrupt-map' unit address lookup)",
            dt.path(node)
        )),
    }
}

/// Pads the shorter operand on the left with `fill`.
fn zip_padded(a: &[u8], b: &[u8], fill: u8) -> impl Iterator<Item = (u8, u8)> {
    let len = a.len().max(b.len());
    let pad = |s: &[u8]| {
        let mut v = vec![fill; len - s.len()];
        v.extend_from_slice(s);
        v
    };
    pad(a).into_iter().zip(pad(b))
}

fn and(a: &[u8], b: &[u8]) -> Vec<u8> {
    zip_padded(a, b, 0xff).map(|(x, y)| x & y).collect()
}

fn or(a: &[u8], b: &[u8]) -> Vec<u8> {
    zip_padded(a, b, 0).map(|(x, y)| x | y).collect()
}

fn not(a: &[u8]) -> Vec<u8> {
    a.iter().map(|x| !x).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> DeviceTree {
        DeviceTree::parse_str("test.dts", text, &[]).unwrap()
    }

    fn cells(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn bitwise_helpers() {
        assert_eq!(and(&[0x0f, 0xf0], &[0xff]), [0x0f, 0xf0]);
        assert_eq!(or(&[0x01], &[0x10, 0x02]), [0x10, 0x03]);
        assert_eq!(not(&[0x0f]), [0xf0]);
    }

    #[test]
    fn split_phandle_list() {
        let dt = parse(
            "/dts-v1/;
/ {
	a: a { #gpio-cells = <2>; };
	b: b { #gpio-cells = <1>; };
	user { gpios = <&a 1 2>, <0>, <&b 3>; };
};",
        );
        let user = dt.get_node("/user").unwrap();
        let prop = dt.node(user).prop("gpios").unwrap();
        let list = phandle_val_list(&dt, prop, "gpio").unwrap();
        assert_eq!(
            list,
            [
                Some((dt.get_node("/a").unwrap(), cells(&[1, 2]))),
                None,
                Some((dt.get_node("/b").unwrap(), cells(&[3]))),
            ]
        );
    }

    #[test]
    fn interrupts_from_parent_and_extended() {
        let dt = parse(
            "/dts-v1/;
/ {
	interrupt-parent = <&intc>;
	intc: intc { interrupt-controller; #interrupt-cells = <2>; };
	intc2: intc2 { interrupt-controller; #interrupt-cells = <1>; };
	dev { interrupts = <1 2 3 4>; };
	ext { interrupts-extended = <&intc 5 6>, <&intc2 7>; };
};",
        );
        let intc = dt.get_node("/intc").unwrap();
        let intc2 = dt.get_node("/intc2").unwrap();

        let dev = dt.get_node("/dev").unwrap();
        assert_eq!(
            interrupts(&dt, dev).unwrap(),
            [(intc, cells(&[1, 2])), (intc, cells(&[3, 4]))]
        );

        let ext = dt.get_node("/ext").unwrap();
        assert_eq!(
            interrupts(&dt, ext).unwrap(),
            [(intc, cells(&[5, 6])), (intc2, cells(&[7]))]
        );
    }

    #[test]
    fn interrupt_map_translation() {
        let dt = parse(
            "/dts-v1/;
/ {
	#address-cells = <1>;
	intc: intc { interrupt-controller; #interrupt-cells = <1>; #address-cells = <0>; };
	nexus: nexus {
		#address-cells = <1>;
		#size-cells = <0>;
		#interrupt-cells = <1>;
		interrupt-map-mask = <0xffffffff 0xffffffff>;
		interrupt-map = <0x1 0x9 &intc 42>, <0x2 0x9 &intc 43>;
		dev@2 { reg = <2>; interrupt-parent = <&nexus>; interrupts = <9>; };
	};
};",
        );
        let dev = dt.get_node("/nexus/dev@2").unwrap();
        let intc = dt.get_node("/intc").unwrap();
        assert_eq!(interrupts(&dt, dev).unwrap(), [(intc, cells(&[43]))]);
    }

    #[test]
    fn gpio_map_with_pass_thru() {
        let dt = parse(
            "/dts-v1/;
/ {
	gpio: gpio { gpio-controller; #gpio-cells = <2>; };
	conn: connector {
		#gpio-cells = <2>;
		gpio-map-mask = <0xffffffff 0x0>;
		gpio-map-pass-thru = <0x0 0xffffffff>;
		gpio-map = <0 0 &gpio 10 0>, <1 0 &gpio 11 0>;
	};
	user { gpios = <&conn 1 5>; };
};",
        );
        let user = dt.get_node("/user").unwrap();
        let conn = dt.get_node("/connector").unwrap();
        let gpio = dt.get_node("/gpio").unwrap();
        let (ctrl, spec) =
            map_phandle_array_entry(&dt, user, conn, cells(&[1, 5]), "gpio").unwrap();
        assert_eq!(ctrl, gpio);
        assert_eq!(spec, cells(&[11, 5]));
    }

    #[test]
    fn missing_interrupt_parent() {
        let dt = parse("/dts-v1/; / { dev { interrupts = <1>; }; };");
        let dev = dt.get_node("/dev").unwrap();
        let msg = interrupts(&dt, dev).unwrap_err().to_string();
        assert!(msg.contains("neither the node nor any of its parents"), "{msg}");
    }
}
