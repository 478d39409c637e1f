use std::fmt::Display;
use std::io::{self, Write};

use super::writer::Writer;
use super::{escape, node_idents, quote_str, str2ident, GenOptions};
use crate::binding::str_as_token;
use crate::edt::{ControllerAndData, Edt, Node, NodeId, Prop, PropValue};

/// Writes the devicetree macro header for `edt`.
///
/// Nodes are written in dependency order, followed by the `/chosen` macros
/// and the per-compatible macros. Fails with
/// [`io::ErrorKind::InvalidData`] if two nodes share an identifier.
pub fn write_header<W: Write>(edt: &Edt, out: W, options: &GenOptions) -> io::Result<()> {
    let idents = node_idents(edt)?;
    let mut gen = HeaderGen {
        edt,
        options,
        idents: &idents,
        partition_ids: partition_ids(edt),
        w: Writer::new(out),
    };

    gen.top_comment()?;
    gen.utils()?;
    for node in edt.ordered_nodes() {
        gen.node(node)?;
    }
    gen.chosen()?;
    gen.global_macros()?;
    gen.w.finish()?;
    Ok(())
}

/// Children of `fixed-partitions` nodes are numbered in tree order.
fn partition_ids(edt: &Edt) -> Vec<Option<usize>> {
    let mut next = 0;
    edt.nodes()
        .iter()
        .map(|node| {
            let parent = edt.node(node.parent()?);
            if !parent.compats().iter().any(|c| c == "fixed-partitions") {
                return None;
            }
            next += 1;
            Some(next - 1)
        })
        .collect()
}

/// A batch of `DT_`-prefixed macros, collected before being written so that
/// a section can be laid out once its contents are known.
#[derive(Default)]
struct Macros(Vec<(String, String, Option<String>)>);

impl Macros {
    fn add(&mut self, name: String, val: impl Display) {
        self.0.push((name, val.to_string(), None));
    }

    fn add_deprecated(&mut self, name: String, val: impl Display, msg: String) {
        self.0.push((name, val.to_string(), Some(msg)));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct HeaderGen<'a, W: Write> {
    edt: &'a Edt,
    options: &'a GenOptions,
    /// By node index.
    idents: &'a [String],
    partition_ids: Vec<Option<usize>>,
    w: Writer<W>,
}

impl<'a, W: Write> HeaderGen<'a, W> {
    fn id(&self, node: NodeId) -> &'a str {
        &self.idents[node.index()]
    }

    fn write(&mut self, macros: Macros) -> io::Result<()> {
        for (name, val, deprecation) in macros.0 {
            self.w
                .define(&format!("DT_{name}"), val, None, deprecation.as_deref())?;
        }
        Ok(())
    }

    /// `fn(DT_<id>)` for each node, or `fn(DT_<id>, __VA_ARGS__)`.
    fn calls(&self, nodes: &[NodeId], vargs: bool) -> Vec<String> {
        nodes
            .iter()
            .map(|&n| {
                if vargs {
                    format!("fn(DT_{}, __VA_ARGS__)", self.id(n))
                } else {
                    format!("fn(DT_{})", self.id(n))
                }
            })
            .collect()
    }

    fn top_comment(&mut self) -> io::Result<()> {
        let edt = self.edt;
        let dirs: Vec<String> = edt
            .bindings_dirs()
            .iter()
            .map(|dir| self.options.relativize(dir))
            .collect();

        let mut s = format!(
            "Generated by gen-defines\n\
             \n\
             DTS input file:\n  {}\n\
             \n\
             Directories with bindings:\n  {}\n\
             \n\
             Node dependency ordering (ordinal and path):\n",
            edt.dts_path().display(),
            dirs.join(", ")
        );
        for node in edt.ordered_nodes() {
            s += &format!("  {:<3} {}\n", node.dep_ordinal(), node.path());
        }
        s += "\nDefinitions derived from these nodes in dependency order are next,\n\
              followed by /chosen nodes.\n";
        self.w.comment_here(&s)
    }

    fn utils(&mut self) -> io::Result<()> {
        self.w
            .comment("Used to remove brackets from around a single argument")?;
        self.w
            .define("DT_DEBRACKET_INTERNAL(...)", "__VA_ARGS__", None, None)
    }

    fn node(&mut self, node: &Node) -> io::Result<()> {
        let id = self.id(node.id());
        self.node_comment(node, id)?;

        self.w.comment("Node's full path:")?;
        self.w
            .dt_define(&format!("{id}_PATH"), quote_str(node.path()))?;

        let name = node.name();
        let token = str_as_token(&escape(name));
        self.w.comment("Node's name with unit-address:")?;
        self.w
            .dt_define(&format!("{id}_FULL_NAME"), quote_str(name))?;
        self.w
            .dt_define(&format!("{id}_FULL_NAME_UNQUOTED"), escape(name))?;
        self.w
            .dt_define(&format!("{id}_FULL_NAME_TOKEN"), &token)?;
        self.w
            .dt_define(&format!("{id}_FULL_NAME_UPPER_TOKEN"), token.to_uppercase())?;

        if let Some(parent) = node.parent() {
            let parent_path = self.edt.node(parent).path();
            let parent_id = self.id(parent);
            self.w
                .comment(&format!("Node parent ({parent_path}) identifier:"))?;
            self.w
                .dt_define(&format!("{id}_PARENT"), format!("DT_{parent_id}"))?;
            if let Some(idx) = self.edt.child_index(node.id()) {
                self.w
                    .comment("Node's index in its parent's list of children:")?;
                self.w.dt_define(&format!("{id}_CHILD_IDX"), idx)?;
            }
        }

        let labels = node.labels();
        self.w.comment("Helpers for dealing with node labels:")?;
        self.w
            .dt_define(&format!("{id}_NODELABEL_NUM"), labels.len())?;
        let calls: Vec<String> = labels.iter().map(|l| format!("fn({l})")).collect();
        self.w
            .dt_define(&format!("{id}_FOREACH_NODELABEL(fn)"), calls.join(" "))?;
        let calls: Vec<String> = labels
            .iter()
            .map(|l| format!("fn({l}, __VA_ARGS__)"))
            .collect();
        self.w.dt_define(
            &format!("{id}_FOREACH_NODELABEL_VARGS(fn, ...)"),
            calls.join(" "),
        )?;

        self.children(node, id)?;
        self.dep_info(node, id)?;
        self.idents_and_existence(node, id)?;
        self.bus(node, id)?;
        self.special_props(node, id)?;
        self.vanilla_props(node, id)
    }

    fn node_comment(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut s = format!(
            "Devicetree node: {}\n\nNode identifier: DT_{id}\n",
            node.path()
        );
        match (node.matching_compat(), node.binding_path()) {
            (Some(compat), Some(path)) => {
                s += &format!(
                    "\nBinding (compatible = {compat}):\n  {}\n",
                    self.options.relativize(path)
                );
            }
            (Some(compat), None) => {
                s += &format!(
                    "\nBinding (compatible = {compat}):\n  No yaml (bindings inferred from properties)\n"
                );
            }
            (None, _) if node.has_inferred_binding() => {
                s += "\nBinding:\n  No yaml (bindings inferred from properties)\n";
            }
            (None, Some(path)) => {
                s += &format!("\nBinding (child binding):\n  {}\n", self.options.relativize(path));
            }
            (None, None) => {
                s += "\nNo binding (property types inferred from the devicetree)\n";
            }
        }
        self.w.comment(&s)
    }

    fn children(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let all = node.children();
        let okay: Vec<NodeId> = all
            .iter()
            .copied()
            .filter(|&c| self.edt.node(c).is_okay())
            .collect();

        self.w.comment("Helper macros for child nodes of this node.")?;
        self.w.dt_define(&format!("{id}_CHILD_NUM"), all.len())?;
        self.w
            .dt_define(&format!("{id}_CHILD_NUM_STATUS_OKAY"), okay.len())?;

        for (suffix, children) in [("", all), ("_STATUS_OKAY", okay.as_slice())] {
            let calls = self.calls(children, false);
            let vcalls = self.calls(children, true);
            self.w
                .dt_define(&format!("{id}_FOREACH_CHILD{suffix}(fn)"), calls.join(" "))?;
            self.w.dt_define(
                &format!("{id}_FOREACH_CHILD{suffix}_SEP(fn, sep)"),
                calls.join(" DT_DEBRACKET_INTERNAL sep "),
            )?;
            self.w.dt_define(
                &format!("{id}_FOREACH_CHILD{suffix}_VARGS(fn, ...)"),
                vcalls.join(" "),
            )?;
            self.w.dt_define(
                &format!("{id}_FOREACH_CHILD{suffix}_SEP_VARGS(fn, sep, ...)"),
                vcalls.join(" DT_DEBRACKET_INTERNAL sep "),
            )?;
        }
        Ok(())
    }

    fn ords(&self, deps: &[NodeId]) -> String {
        if deps.is_empty() {
            return "/* nothing */".to_owned();
        }
        let mut deps: Vec<&Node> = deps.iter().map(|&d| self.edt.node(d)).collect();
        deps.sort_by_key(|d| d.dep_ordinal());
        let entries: Vec<String> = deps
            .iter()
            .map(|d| format!("{}, /* {} */", d.dep_ordinal(), d.path()))
            .collect();
        format!("\\\n\t{}", entries.join(" \\\n\t"))
    }

    fn dep_info(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let ord = node.dep_ordinal();
        self.w.comment("Node's dependency ordinal:")?;
        self.w.dt_define(&format!("{id}_ORD"), ord)?;
        self.w
            .dt_define(&format!("{id}_ORD_STR_SORTABLE"), format!("{ord:0>5}"))?;

        let requires = self.ords(self.edt.depends_on(node.id()));
        self.w
            .comment("Ordinals for what this node depends on directly:")?;
        self.w.dt_define(&format!("{id}_REQUIRES_ORDS"), requires)?;

        let supports = self.ords(self.edt.required_by(node.id()));
        self.w
            .comment("Ordinals for what depends directly on this node:")?;
        self.w.dt_define(&format!("{id}_SUPPORTS_ORDS"), supports)
    }

    /// Alias, instance and label identifiers, which all expand to the node
    /// identifier.
    fn idents_and_existence(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut idents: Vec<String> = node
            .aliases()
            .iter()
            .map(|alias| format!("DT_N_ALIAS_{}", str2ident(alias)))
            .collect();
        for compat in node.compats() {
            let inst = self
                .edt
                .compat2nodes()
                .get(compat)
                .and_then(|nodes| nodes.iter().position(|&n| n == node.id()));
            if let Some(inst) = inst {
                idents.push(format!("DT_N_INST_{inst}_{}", str2ident(compat)));
            }
        }
        idents.extend(
            node.labels()
                .iter()
                .map(|label| format!("DT_N_NODELABEL_{}", str2ident(label))),
        );

        self.w.comment("Existence and alternate IDs:")?;
        self.w.dt_define(&format!("{id}_EXISTS"), 1)?;
        let width = idents.iter().map(String::len).max();
        for ident in &idents {
            self.w.define(ident, format!("DT_{id}"), width, None)?;
        }
        Ok(())
    }

    fn bus(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let Some(bus) = node.bus_node() else {
            return Ok(());
        };
        let bus_path = self.edt.node(bus).path();
        let bus_id = self.id(bus);
        self.w.comment(&format!(
            "Bus info (controller: '{bus_path}', type: '{}')",
            node.on_buses().join(", ")
        ))?;
        for on_bus in node.on_buses() {
            self.w
                .dt_define(&format!("{id}_BUS_{}", str2ident(on_bus)), 1)?;
        }
        self.w.dt_define(&format!("{id}_BUS"), format!("DT_{bus_id}"))
    }

    fn special_props(&mut self, node: &Node, id: &str) -> io::Result<()> {
        self.w
            .comment("Macros for properties that are special in the specification:")?;
        self.regs(node, id)?;
        self.ranges(node, id)?;
        self.interrupts(node, id)?;
        self.compatibles(node, id)?;
        self.w
            .dt_define(&format!("{id}_STATUS_{}", str2ident(node.status())), 1)?;
        self.pinctrls(node, id)?;
        self.fixed_partition(node, id)
    }

    fn regs(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut idx = Macros::default();
        let mut named = Macros::default();

        idx.add(format!("{id}_REG_NUM"), node.regs().len());
        for (i, reg) in node.regs().iter().enumerate() {
            idx.add(format!("{id}_REG_IDX_{i}_EXISTS"), 1);
            let name = reg.name.as_deref().map(str2ident);
            if let Some(name) = &name {
                named.add(format!("{id}_REG_NAME_{name}_EXISTS"), 1);
            }
            for (what, val) in [("ADDRESS", reg.addr), ("SIZE", reg.size)] {
                let Some(val) = val else { continue };
                let idx_macro = format!("{id}_REG_IDX_{i}_VAL_{what}");
                idx.add(idx_macro.clone(), format!("{val:#x}"));
                if let Some(name) = &name {
                    named.add(
                        format!("{id}_REG_NAME_{name}_VAL_{what}"),
                        format!("DT_{idx_macro}"),
                    );
                }
            }
        }
        self.write(idx)?;
        self.write(named)
    }

    fn ranges(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let pcie = node.buses().iter().any(|b| b == "pcie");
        let mut m = Macros::default();

        m.add(format!("{id}_RANGES_NUM"), node.ranges().len());
        for (i, range) in node.ranges().iter().enumerate() {
            let prefix = format!("{id}_RANGES_IDX_{i}");
            m.add(format!("{prefix}_EXISTS"), 1);

            let mut child_addr = range.child_bus_addr;
            if let Some(addr) = child_addr.filter(|_| pcie && range.child_bus_cells > 0) {
                // The top cell of a PCI address holds the space code flags.
                let shift = (range.child_bus_cells - 1) * 32;
                let flags = addr.checked_shr(shift).unwrap_or(0);
                m.add(format!("{prefix}_VAL_CHILD_BUS_FLAGS_EXISTS"), 1);
                m.add(format!("{prefix}_VAL_CHILD_BUS_FLAGS"), format!("{flags:#x}"));
                let mask = 1u128.checked_shl(shift).map_or(u128::MAX, |bit| bit - 1);
                child_addr = Some(addr & mask);
            }

            for (what, val) in [
                ("CHILD_BUS_ADDRESS", child_addr),
                ("PARENT_BUS_ADDRESS", range.parent_bus_addr),
                ("LENGTH", range.length),
            ] {
                if let Some(val) = val {
                    m.add(format!("{prefix}_VAL_{what}"), format!("{val:#x}"));
                }
            }
        }
        self.write(m)?;

        let calls: Vec<String> = (0..node.ranges().len())
            .map(|i| format!("fn(DT_{id}, {i})"))
            .collect();
        self.w
            .dt_define(&format!("{id}_FOREACH_RANGE(fn)"), calls.join(" "))
    }

    fn interrupts(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut idx = Macros::default();
        let mut named = Macros::default();

        idx.add(format!("{id}_IRQ_NUM"), node.interrupts().len());
        for (i, irq) in node.interrupts().iter().enumerate() {
            let name = irq.name.as_deref().map(str2ident);
            idx.add(format!("{id}_IRQ_IDX_{i}_EXISTS"), 1);
            for (cell, &val) in &irq.data {
                let cell = str2ident(cell);
                let val = match (cell.as_str(), irq.linear_irq) {
                    ("irq", Some(linear)) => linear,
                    _ => u64::from(val),
                };
                let idx_macro = format!("{id}_IRQ_IDX_{i}_VAL_{cell}");
                idx.add(idx_macro.clone(), val);
                idx.add(format!("{idx_macro}_EXISTS"), 1);
                if let Some(name) = &name {
                    let name_macro = format!("{id}_IRQ_NAME_{name}_VAL_{cell}");
                    named.add(name_macro.clone(), format!("DT_{idx_macro}"));
                    named.add(format!("{name_macro}_EXISTS"), 1);
                }
            }

            let controller_macro = format!("{id}_IRQ_IDX_{i}_CONTROLLER");
            idx.add(controller_macro.clone(), format!("DT_{}", self.id(irq.controller)));
            if let Some(name) = &name {
                named.add(
                    format!("{id}_IRQ_NAME_{name}_CONTROLLER"),
                    format!("DT_{controller_macro}"),
                );
            }
        }
        idx.add(format!("{id}_IRQ_LEVEL"), self.irq_level(node));

        self.write(idx)?;
        self.write(named)
    }

    /// Length of the chain of first interrupts, starting at `node`.
    fn irq_level(&self, node: &Node) -> usize {
        let mut level = 0;
        let mut cur = node;
        while let Some(irq) = cur.interrupts().first() {
            level += 1;
            if irq.controller == cur.id() || level > self.edt.nodes().len() {
                break;
            }
            cur = self.edt.node(irq.controller);
        }
        level
    }

    fn compatibles(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut m = Macros::default();
        for (i, compat) in node.compats().iter().enumerate() {
            m.add(format!("{id}_COMPAT_MATCHES_{}", str2ident(compat)), 1);
            if let Some(vendor) = self.edt.compat2vendor().get(compat) {
                m.add(format!("{id}_COMPAT_VENDOR_IDX_{i}_EXISTS"), 1);
                m.add(format!("{id}_COMPAT_VENDOR_IDX_{i}"), quote_str(vendor));
            }
            if let Some(model) = self.edt.compat2model().get(compat) {
                m.add(format!("{id}_COMPAT_MODEL_IDX_{i}_EXISTS"), 1);
                m.add(format!("{id}_COMPAT_MODEL_IDX_{i}"), quote_str(model));
            }
        }
        self.write(m)
    }

    fn pinctrls(&mut self, node: &Node, id: &str) -> io::Result<()> {
        self.w
            .comment("Pin control (pinctrl-<i>, pinctrl-names) properties:")?;
        let mut m = Macros::default();
        m.add(format!("{id}_PINCTRL_NUM"), node.pinctrls().len());
        for (i, pinctrl) in node.pinctrls().iter().enumerate() {
            m.add(format!("{id}_PINCTRL_IDX_{i}_EXISTS"), 1);
            let Some(name) = pinctrl.name_as_token() else {
                continue;
            };
            m.add(format!("{id}_PINCTRL_IDX_{i}_TOKEN"), &name);
            m.add(format!("{id}_PINCTRL_IDX_{i}_UPPER_TOKEN"), name.to_uppercase());
            m.add(format!("{id}_PINCTRL_NAME_{name}_EXISTS"), 1);
            m.add(format!("{id}_PINCTRL_NAME_{name}_IDX"), i);
            for (j, &conf) in pinctrl.conf_nodes.iter().enumerate() {
                m.add(
                    format!("{id}_PINCTRL_NAME_{name}_IDX_{j}_PH"),
                    format!("DT_{}", self.id(conf)),
                );
            }
        }
        self.write(m)
    }

    fn fixed_partition(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let Some(partition_id) = self.partition_ids[node.id().index()] else {
            return Ok(());
        };
        self.w.comment("fixed-partitions identifier:")?;
        self.w
            .dt_define(&format!("{id}_PARTITION_ID"), partition_id)
    }

    fn vanilla_props(&mut self, node: &Node, id: &str) -> io::Result<()> {
        let mut m = Macros::default();
        for (name, prop) in node.props() {
            self.prop_macros(&mut m, id, &str2ident(name), prop);
        }

        if m.is_empty() {
            return self.w.comment("(No generic property macros)");
        }
        self.w.comment("Generic property macros:")?;
        self.write(m)
    }

    /// Macros for property `prop_id` of node `id`.
    fn prop_macros(&self, m: &mut Macros, id: &str, prop_id: &str, prop: &Prop) {
        let macro_ = &format!("{id}_P_{prop_id}");
        if let Some(val) = prop_value(&prop.value) {
            if prop.spec.deprecated {
                let msg = format!("'{}' is deprecated", prop.name());
                m.add_deprecated(macro_.clone(), val, msg);
            } else {
                m.add(macro_.clone(), val);
            }
        }

        if let PropValue::String(s) = &prop.value {
            let token = str_as_token(s);
            m.add(format!("{macro_}_STRING_UNQUOTED"), s);
            m.add(format!("{macro_}_STRING_UPPER_TOKEN"), token.to_uppercase());
            m.add(format!("{macro_}_STRING_TOKEN"), token);
            m.add(format!("{macro_}_IDX_0"), quote_str(s));
            m.add(format!("{macro_}_IDX_0_EXISTS"), 1);
        }

        if let Some(enum_idx) = prop.enum_index() {
            let val = match &prop.value {
                PropValue::String(s) => str_as_token(s),
                other => other.to_string(),
            };
            m.add(format!("{macro_}_ENUM_VAL_{val}_EXISTS"), 1);
            m.add(format!("{macro_}_ENUM_IDX"), enum_idx);
            if let Some(token) = prop.val_as_token().filter(|_| prop.spec.enum_tokenizable()) {
                if prop.spec.enum_upper_tokenizable() {
                    m.add(format!("{macro_}_ENUM_UPPER_TOKEN"), token.to_uppercase());
                }
                m.add(format!("{macro_}_ENUM_TOKEN"), token);
            }
        }

        match &prop.value {
            PropValue::Phandle(target) => self.phandle_macros(m, macro_, 0, *target),
            PropValue::Phandles(targets) => {
                for (i, &target) in targets.iter().enumerate() {
                    self.phandle_macros(m, macro_, i, target);
                }
            }
            PropValue::PhandleArray(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    match entry {
                        Some(entry) => self.specifier_macros(m, macro_, i, entry),
                        None => m.add(format!("{macro_}_IDX_{i}_EXISTS"), 0),
                    }
                }
            }
            PropValue::Array(v) => elem_macros(m, macro_, v),
            PropValue::Bytes(v) => elem_macros(m, macro_, v),
            PropValue::Strings(v) => {
                for (i, s) in v.iter().enumerate() {
                    let token = str_as_token(s);
                    m.add(format!("{macro_}_IDX_{i}"), quote_str(s));
                    m.add(format!("{macro_}_IDX_{i}_STRING_UNQUOTED"), s);
                    m.add(format!("{macro_}_IDX_{i}_STRING_UPPER_TOKEN"), token.to_uppercase());
                    m.add(format!("{macro_}_IDX_{i}_STRING_TOKEN"), token);
                    m.add(format!("{macro_}_IDX_{i}_EXISTS"), 1);
                }
            }
            _ => {}
        }

        if let Some(len) = prop_len(prop) {
            let elems = |args: &str| -> Vec<String> {
                (0..len)
                    .map(|i| format!("fn(DT_{id}, {prop_id}, {i}{args})"))
                    .collect()
            };
            m.add(format!("{macro_}_FOREACH_PROP_ELEM(fn)"), elems("").join(" \\\n\t"));
            m.add(
                format!("{macro_}_FOREACH_PROP_ELEM_SEP(fn, sep)"),
                elems("").join(" DT_DEBRACKET_INTERNAL sep \\\n\t"),
            );
            m.add(
                format!("{macro_}_FOREACH_PROP_ELEM_VARGS(fn, ...)"),
                elems(", __VA_ARGS__").join(" \\\n\t"),
            );
            m.add(
                format!("{macro_}_FOREACH_PROP_ELEM_SEP_VARGS(fn, sep, ...)"),
                elems(", __VA_ARGS__").join(" DT_DEBRACKET_INTERNAL sep \\\n\t"),
            );
            m.add(format!("{macro_}_LEN"), len);
        }

        m.add(format!("{macro_}_EXISTS"), 1);
    }

    fn phandle_macros(&self, m: &mut Macros, macro_: &str, i: usize, target: NodeId) {
        let target = format!("DT_{}", self.id(target));
        m.add(format!("{macro_}_IDX_{i}"), &target);
        m.add(format!("{macro_}_IDX_{i}_PH"), target);
        m.add(format!("{macro_}_IDX_{i}_EXISTS"), 1);
    }

    fn specifier_macros(&self, m: &mut Macros, macro_: &str, i: usize, entry: &ControllerAndData) {
        let controller = format!("DT_{}", self.id(entry.controller));
        m.add(format!("{macro_}_IDX_{i}_EXISTS"), 1);
        m.add(format!("{macro_}_IDX_{i}_PH"), &controller);
        for (cell, val) in &entry.data {
            let cell = str2ident(cell);
            m.add(format!("{macro_}_IDX_{i}_VAL_{cell}"), val);
            m.add(format!("{macro_}_IDX_{i}_VAL_{cell}_EXISTS"), 1);
        }

        let Some(name) = &entry.name else {
            return;
        };
        let ident = str2ident(name);
        m.add(format!("{macro_}_IDX_{i}_NAME"), quote_str(name));
        m.add(format!("{macro_}_NAME_{ident}_PH"), controller);
        m.add(format!("{macro_}_NAME_{ident}_EXISTS"), 1);
        for cell in entry.data.keys() {
            let cell = str2ident(cell);
            let name_macro = format!("{macro_}_NAME_{ident}_VAL_{cell}");
            m.add(name_macro.clone(), format!("DT_{macro_}_IDX_{i}_VAL_{cell}"));
            m.add(format!("{name_macro}_EXISTS"), 1);
        }
    }

    fn chosen(&mut self) -> io::Result<()> {
        self.w.comment("Chosen nodes\n")?;
        let mut chosen = Vec::new();
        for (name, &node) in self.edt.chosen() {
            let macro_ = format!("DT_CHOSEN_{}", str2ident(name));
            let exists = format!("{macro_}_EXISTS");
            chosen.push((macro_, format!("DT_{}", self.id(node))));
            chosen.push((exists, "1".to_owned()));
        }
        let width = chosen.iter().map(|(name, _)| name.len()).max();
        for (name, val) in chosen {
            self.w.define(&name, val, width, None)?;
        }
        Ok(())
    }

    fn global_macros(&mut self) -> io::Result<()> {
        let edt = self.edt;
        let all: Vec<NodeId> = edt.nodes().iter().map(Node::id).collect();
        let okay: Vec<NodeId> = edt
            .nodes()
            .iter()
            .filter(|n| n.is_okay())
            .map(Node::id)
            .collect();

        let helpers = [
            ("FOREACH_HELPER(fn)", self.calls(&all, false)),
            ("FOREACH_OKAY_HELPER(fn)", self.calls(&okay, false)),
            ("FOREACH_VARGS_HELPER(fn, ...)", self.calls(&all, true)),
            ("FOREACH_OKAY_VARGS_HELPER(fn, ...)", self.calls(&okay, true)),
        ];
        self.w
            .comment("Macros for iterating over all nodes and enabled nodes")?;
        for (name, calls) in helpers {
            self.w.dt_define(name, calls.join(" "))?;
        }

        let mut labels = Macros::default();
        for &partitions in edt.compat2nodes().get("fixed-partitions").into_iter().flatten() {
            for &child in edt.node(partitions).children() {
                if let Some(PropValue::String(label)) =
                    edt.node(child).prop("label").map(|p| &p.value)
                {
                    let macro_ = format!("COMPAT_fixed_partitions_LABEL_{}", str2ident(label));
                    labels.add(macro_.clone(), format!("DT_{}", self.id(child)));
                    labels.add(format!("{macro_}_EXISTS"), 1);
                }
            }
        }
        self.write(labels)?;

        let mut n_okay = Vec::new();
        let mut for_each = Vec::new();
        let mut compat2buses: Vec<(&str, Vec<&str>)> = Vec::new();
        for (compat, nodes) in edt.compat2okay() {
            let ident = str2ident(compat);

            let mut buses = Vec::new();
            for &node in nodes {
                for bus in edt.node(node).on_buses() {
                    if !buses.contains(&bus.as_str()) {
                        buses.push(bus.as_str());
                    }
                }
            }
            compat2buses.push((compat.as_str(), buses));

            n_okay.push((format!("DT_N_INST_{ident}_NUM_OKAY"), nodes.len().to_string()));
            for_each.push((
                format!("DT_FOREACH_OKAY_{ident}(fn)"),
                self.calls(nodes, false).join(" "),
            ));
            for_each.push((
                format!("DT_FOREACH_OKAY_VARGS_{ident}(fn, ...)"),
                self.calls(nodes, true).join(" "),
            ));

            let insts: Vec<usize> = nodes
                .iter()
                .filter_map(|n| edt.compat2nodes().get(compat)?.iter().position(|m| m == n))
                .collect();
            let calls: Vec<String> = insts.iter().map(|i| format!("fn({i})")).collect();
            for_each.push((format!("DT_FOREACH_OKAY_INST_{ident}(fn)"), calls.join(" ")));
            let calls: Vec<String> = insts
                .iter()
                .map(|i| format!("fn({i}, __VA_ARGS__)"))
                .collect();
            for_each.push((
                format!("DT_FOREACH_OKAY_INST_VARGS_{ident}(fn, ...)"),
                calls.join(" "),
            ));
        }

        self.w
            .comment("Macros for compatibles with status \"okay\" nodes\n")?;
        for compat in edt.compat2okay().keys() {
            self.w
                .dt_define(&format!("COMPAT_HAS_OKAY_{}", str2ident(compat)), 1)?;
        }

        self.w
            .comment("Macros for status \"okay\" instances of each compatible\n")?;
        for (name, val) in n_okay.into_iter().chain(for_each) {
            self.w.define(&name, val, None, None)?;
        }

        self.w
            .comment("Bus information for status \"okay\" nodes of each compatible\n")?;
        for (compat, buses) in compat2buses {
            for bus in buses {
                self.w.dt_define(
                    &format!("COMPAT_{}_BUS_{}", str2ident(compat), str2ident(bus)),
                    1,
                )?;
            }
        }
        Ok(())
    }
}

/// The value of the `_P_<prop>` macro, for properties that have one.
fn prop_value(value: &PropValue) -> Option<String> {
    Some(match value {
        PropValue::String(s) => quote_str(s),
        PropValue::Int(n) => n.to_string(),
        PropValue::Bool(b) => u8::from(*b).to_string(),
        PropValue::Array(v) => list2init(v.iter().map(|&n| format!("{n} /* {} */", hex(n)))),
        PropValue::Bytes(v) => list2init(v.iter().map(|b| format!("{b} /* {b:#x} */"))),
        PropValue::Strings(v) => list2init(v.iter().map(|s| quote_str(s))),
        _ => return None,
    })
}

/// Number of elements `_FOREACH_PROP_ELEM` iterates over. The special
/// properties have their own iteration macros.
fn prop_len(prop: &Prop) -> Option<usize> {
    match &prop.value {
        PropValue::Phandle(_) | PropValue::String(_) => Some(1),
        _ if matches!(prop.name(), "reg" | "ranges" | "dma-ranges" | "interrupts") => None,
        value => value.len(),
    }
}

fn elem_macros<T: Display>(m: &mut Macros, macro_: &str, elems: &[T]) {
    for (i, elem) in elems.iter().enumerate() {
        m.add(format!("{macro_}_IDX_{i}"), elem);
        m.add(format!("{macro_}_IDX_{i}_EXISTS"), 1);
    }
}

fn list2init(items: impl Iterator<Item = String>) -> String {
    format!("{{{}}}", items.collect::<Vec<_>>().join(", "))
}

fn hex(n: i64) -> String {
    if n < 0 {
        format!("-{:#x}", n.unsigned_abs())
    } else {
        format!("{n:#x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binding::tests::write_bindings;
    use crate::binding::Bindings;
    use crate::dt::DeviceTree;
    use crate::edt::EdtOptions;

    fn header(dts: &str, bindings: &[(&str, &str)]) -> String {
        let dir = write_bindings(bindings);
        let dt = DeviceTree::parse_str("board.dts", dts, &[]).unwrap();
        let bindings = Bindings::load(&[dir.path().to_path_buf()], None).unwrap();
        let edt = Edt::new(dt, bindings, EdtOptions::default()).unwrap();
        let mut out = Vec::new();
        write_header(&edt, &mut out, &GenOptions::default()).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn has(out: &str, line: &str) -> bool {
        out.lines().any(|l| l == line)
    }

    const UART: (&str, &str) = (
        "uart.yaml",
        "description: UART
compatible: \"vnd,uart\"
properties:
  reg:
    type: array
  current-speed:
    type: int
  parity:
    type: string
    enum: [\"none\", \"odd\", \"even\"]
  clocks:
    type: phandle-array
  baud-list:
    type: array
  label:
    type: string
    deprecated: true
",
    );

    const CLOCK: (&str, &str) = (
        "clock.yaml",
        "description: Clock controller
compatible: \"vnd,clock\"
properties:
  \"#clock-cells\":
    type: int
clock-cells:
  - id
",
    );

    const SOC: &str = "/dts-v1/;
/ {
	#address-cells = <1>;
	#size-cells = <1>;
	aliases { serial0 = &uart0; };
	chosen { zephyr,console = &uart0; };
	soc {
		#address-cells = <1>;
		#size-cells = <1>;
		ranges;
		clk: clock@1000 {
			compatible = \"vnd,clock\";
			reg = <0x1000 0x10>;
			#clock-cells = <1>;
		};
		uart0: uart@40001000 {
			compatible = \"vnd,uart\";
			reg = <0x40001000 0x1000>;
			reg-names = \"rx\";
			current-speed = <115200>;
			parity = \"odd\";
			clocks = <&clk 7>;
			clock-names = \"core\";
			baud-list = <9600 0x10>;
			label = \"UART_0\";
		};
		uart@40002000 {
			compatible = \"vnd,uart\";
			reg = <0x40002000 0x1000>;
			status = \"disabled\";
		};
	};
};
";

    #[test]
    fn node_identity() {
        let out = header(SOC, &[UART, CLOCK]);
        let id = "DT_N_S_soc_S_uart_40001000";

        assert!(has(&out, &format!("#define {id}_PATH \"/soc/uart@40001000\"")));
        assert!(has(&out, &format!("#define {id}_FULL_NAME \"uart@40001000\"")));
        assert!(has(&out, &format!("#define {id}_FULL_NAME_TOKEN uart_40001000")));
        assert!(has(&out, &format!("#define {id}_PARENT DT_N_S_soc")));
        assert!(has(&out, &format!("#define {id}_CHILD_IDX 1")));
        assert!(has(&out, &format!("#define {id}_EXISTS 1")));
        assert!(has(&out, &format!("#define {id}_FOREACH_NODELABEL(fn) fn(uart0)")));
        // Padded to the longest of the three.
        assert!(has(&out, "#define DT_N_ALIAS_serial0   DT_N_S_soc_S_uart_40001000"));
        assert!(has(&out, "#define DT_N_INST_0_vnd_uart DT_N_S_soc_S_uart_40001000"));
        assert!(has(&out, "#define DT_N_NODELABEL_uart0 DT_N_S_soc_S_uart_40001000"));
        assert!(has(&out, "#define DT_N_S_soc_S_uart_40002000_STATUS_disabled 1"));
        assert!(has(&out, &format!("#define {id}_STATUS_okay 1")));
        assert!(has(&out, &format!("#define {id}_COMPAT_MATCHES_vnd_uart 1")));
        assert!(out.starts_with("/*\n * Generated by gen-defines\n"));
        assert!(out.contains(" * Devicetree node: /soc/uart@40001000\n"));
    }

    #[test]
    fn children_and_dependencies() {
        let out = header(SOC, &[UART, CLOCK]);

        assert!(has(&out, "#define DT_N_S_soc_CHILD_NUM 3"));
        assert!(has(&out, "#define DT_N_S_soc_CHILD_NUM_STATUS_OKAY 2"));
        assert!(has(
            &out,
            "#define DT_N_S_soc_FOREACH_CHILD_STATUS_OKAY(fn) \
             fn(DT_N_S_soc_S_clock_1000) fn(DT_N_S_soc_S_uart_40001000)"
        ));
        assert!(has(
            &out,
            "#define DT_N_S_soc_FOREACH_CHILD_SEP(fn, sep) fn(DT_N_S_soc_S_clock_1000) \
             DT_DEBRACKET_INTERNAL sep fn(DT_N_S_soc_S_uart_40001000) \
             DT_DEBRACKET_INTERNAL sep fn(DT_N_S_soc_S_uart_40002000)"
        ));
        assert!(has(&out, "#define DT_N_REQUIRES_ORDS /* nothing */"));

        // The UART depends on its parent and on the clock.
        let uart_requires = out
            .split("#define DT_N_S_soc_S_uart_40001000_REQUIRES_ORDS ")
            .nth(1)
            .unwrap();
        let uart_requires = uart_requires.split("\n\n").next().unwrap();
        assert!(uart_requires.contains(", /* /soc */"));
        assert!(uart_requires.contains(", /* /soc/clock@1000 */"));
    }

    #[test]
    fn reg_macros() {
        let out = header(SOC, &[UART, CLOCK]);
        let id = "DT_N_S_soc_S_uart_40001000";

        assert!(has(&out, &format!("#define {id}_REG_NUM 1")));
        assert!(has(&out, &format!("#define {id}_REG_IDX_0_EXISTS 1")));
        assert!(has(&out, &format!("#define {id}_REG_IDX_0_VAL_ADDRESS 0x40001000")));
        assert!(has(&out, &format!("#define {id}_REG_IDX_0_VAL_SIZE 0x1000")));
        assert!(has(&out, &format!("#define {id}_REG_NAME_rx_EXISTS 1")));
        assert!(has(
            &out,
            &format!("#define {id}_REG_NAME_rx_VAL_ADDRESS {id}_REG_IDX_0_VAL_ADDRESS")
        ));
        assert!(has(
            &out,
            &format!("#define {id}_REG_NAME_rx_VAL_SIZE {id}_REG_IDX_0_VAL_SIZE")
        ));
        assert!(!out.contains(&format!("{id}_P_reg_LEN")));
    }

    #[test]
    fn vanilla_prop_macros() {
        let out = header(SOC, &[UART, CLOCK]);
        let p = "DT_N_S_soc_S_uart_40001000_P";

        assert!(has(&out, &format!("#define {p}_current_speed 115200")));
        assert!(has(&out, &format!("#define {p}_current_speed_EXISTS 1")));
        assert!(has(&out, &format!("#define {p}_parity \"odd\"")));
        assert!(has(&out, &format!("#define {p}_parity_STRING_TOKEN odd")));
        assert!(has(&out, &format!("#define {p}_parity_STRING_UPPER_TOKEN ODD")));
        assert!(has(&out, &format!("#define {p}_parity_ENUM_IDX 1")));
        assert!(has(&out, &format!("#define {p}_parity_ENUM_VAL_odd_EXISTS 1")));
        assert!(has(&out, &format!("#define {p}_parity_ENUM_TOKEN odd")));
        assert!(has(&out, &format!("#define {p}_parity_ENUM_UPPER_TOKEN ODD")));
        assert!(has(&out, &format!("#define {p}_parity_LEN 1")));

        assert!(has(&out, &format!("#define {p}_baud_list {{9600 /* 0x2580 */, 16 /* 0x10 */}}")));
        assert!(has(&out, &format!("#define {p}_baud_list_IDX_1 16")));
        assert!(has(&out, &format!("#define {p}_baud_list_LEN 2")));
        assert!(has(
            &out,
            &format!(
                "#define {p}_baud_list_FOREACH_PROP_ELEM(fn) \
                 fn(DT_N_S_soc_S_uart_40001000, baud_list, 0) \\"
            )
        ));

        assert!(has(
            &out,
            &format!("#define {p}_label __WARN(\"'label' is deprecated\") \"UART_0\"")
        ));
    }

    #[test]
    fn phandle_array_macros() {
        let out = header(SOC, &[UART, CLOCK]);
        let p = "DT_N_S_soc_S_uart_40001000_P_clocks";

        assert!(!out.contains(&format!("#define {p} ")));
        assert!(has(&out, &format!("#define {p}_IDX_0_EXISTS 1")));
        assert!(has(&out, &format!("#define {p}_IDX_0_PH DT_N_S_soc_S_clock_1000")));
        assert!(has(&out, &format!("#define {p}_IDX_0_VAL_id 7")));
        assert!(has(&out, &format!("#define {p}_IDX_0_NAME \"core\"")));
        assert!(has(&out, &format!("#define {p}_NAME_core_PH DT_N_S_soc_S_clock_1000")));
        assert!(has(&out, &format!("#define {p}_NAME_core_VAL_id {p}_IDX_0_VAL_id")));
        assert!(has(&out, &format!("#define {p}_LEN 1")));
    }

    #[test]
    fn chosen_and_global_macros() {
        let out = header(SOC, &[UART, CLOCK]);

        assert!(has(
            &out,
            &format!(
                "#define {:<31} DT_N_S_soc_S_uart_40001000",
                "DT_CHOSEN_zephyr_console"
            )
        ));
        assert!(has(&out, "#define DT_CHOSEN_zephyr_console_EXISTS 1"));
        assert!(has(&out, "#define DT_COMPAT_HAS_OKAY_vnd_uart 1"));
        assert!(has(&out, "#define DT_N_INST_vnd_uart_NUM_OKAY 1"));
        assert!(has(&out, "#define DT_FOREACH_OKAY_vnd_uart(fn) fn(DT_N_S_soc_S_uart_40001000)"));
        assert!(has(&out, "#define DT_FOREACH_OKAY_INST_vnd_uart(fn) fn(0)"));
        assert!(has(&out, "#define DT_DEBRACKET_INTERNAL(...) __VA_ARGS__"));
        assert!(out.contains("#define DT_FOREACH_HELPER(fn) fn(DT_N) fn(DT_N_S_aliases)"));
    }

    #[test]
    fn fixed_partitions() {
        let out = header(
            "/dts-v1/;
/ {
	flash {
		partitions {
			compatible = \"fixed-partitions\";
			#address-cells = <1>;
			#size-cells = <1>;
			boot@0 { reg = <0x0 0x1000>; label = \"mcuboot\"; };
			slot0@1000 { reg = <0x1000 0x1000>; };
		};
	};
};",
            &[],
        );

        assert!(has(&out, "#define DT_N_S_flash_S_partitions_S_boot_0_PARTITION_ID 0"));
        assert!(has(&out, "#define DT_N_S_flash_S_partitions_S_slot0_1000_PARTITION_ID 1"));
        assert!(has(
            &out,
            "#define DT_COMPAT_fixed_partitions_LABEL_mcuboot DT_N_S_flash_S_partitions_S_boot_0"
        ));
    }

    #[test]
    fn reject_colliding_identifiers() {
        let dt = DeviceTree::parse_str("board.dts", "/dts-v1/; / { a-b { }; a_b { }; };", &[])
            .unwrap();
        let edt = Edt::new(dt, Bindings::default(), EdtOptions::default()).unwrap();

        let mut out = Vec::new();
        let err = write_header(&edt, &mut out, &GenOptions::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(
            err.to_string(),
            "nodes /a-b and /a_b both have the identifier DT_N_S_a_b"
        );
    }

    #[test]
    fn number_formatting() {
        assert_eq!(hex(26), "0x1a");
        assert_eq!(hex(-1), "-0x1");
        assert_eq!(list2init(["1".to_owned(), "2".to_owned()].into_iter()), "{1, 2}");
    }
}
