//! Recursive descent over the token stream, building a [`DeviceTree`].
//!
//! Integer expressions inside `< >` and in `/memreserve/` are evaluated as
//! they are parsed. The grammar, lowest precedence first:
//!
//! ```text
//! ternary := or ('?' ternary ':' ternary)?
//! or      := and ('||' and)*
//! and     := bitor ('&&' bitor)*
//! bitor   := xor ('|' xor)*
//! xor     := bitand ('^' bitand)*
//! bitand  := eq ('&' eq)*
//! eq      := rel (('==' | '!=') rel)*
//! rel     := shift (('<' | '>' | '<=' | '>=') shift)*
//! shift   := add (('<<' | '>>') add)*
//! add     := mul (('+' | '-') mul)*
//! mul     := unary (('*' | '/' | '%') unary)*
//! unary   := ('-' | '~' | '!') unary | prim
//! prim    := number | '(' ternary ')'
//! ```

use std::collections::HashSet;
use std::fs;

use super::lexer::{Lexer, Token};
use super::property::{MarkerKind, Property};
use super::tree::{DeviceTree, MemReserve, NodeId};
use super::Error;

pub(crate) fn parse(lexer: Lexer, dt: &mut DeviceTree) -> Result<(), Error> {
    let mut parser = Parser {
        lexer,
        dt,
        root_defined: false,
    };
    parser.header()?;
    parser.memreserves()?;
    parser.top_level()
}

struct Parser<'a> {
    lexer: Lexer,
    dt: &'a mut DeviceTree,
    root_defined: bool,
}

impl Parser<'_> {
    fn error<T>(&self, msg: impl Into<String>) -> Result<T, Error> {
        Err(self.lexer.error(msg))
    }

    fn peek(&mut self) -> Result<&Token, Error> {
        self.lexer.peek()
    }

    fn next(&mut self) -> Result<Token, Error> {
        self.lexer.next_token()
    }

    /* === File structure === */

    fn header(&mut self) -> Result<(), Error> {
        let mut seen = false;
        while *self.peek()? == Token::DtsV1 {
            seen = true;
            self.next()?;
            self.lexer.expect(";")?;
            if *self.peek()? == Token::Plugin {
                return self.error("/plugin/ is not supported");
            }
        }
        if !seen {
            return self.error("expected '/dts-v1/;' at start of file");
        }
        Ok(())
    }

    fn memreserves(&mut self) -> Result<(), Error> {
        loop {
            let mut labels = Vec::new();
            while let Token::Label(label) = self.peek()? {
                push_unique(&mut labels, label.clone());
                self.next()?;
            }

            if *self.peek()? != Token::Memreserve {
                if !labels.is_empty() {
                    return self.error("expected /memreserve/ after labels at beginning of file");
                }
                return Ok(());
            }
            self.next()?;

            let address = self.u64_prim()?;
            let size = self.u64_prim()?;
            self.lexer.expect(";")?;
            self.dt.memreserves.push(MemReserve {
                labels,
                address,
                size,
            });
        }
    }

    fn top_level(&mut self) -> Result<(), Error> {
        loop {
            match self.next()? {
                Token::Punct("/") => {
                    self.root_defined = true;
                    self.node_body(NodeId::ROOT)?;
                }
                Token::Label(label) => {
                    let node = self.next_ref()?;
                    self.node_body(node)?;
                    push_unique(&mut self.dt.node_mut(node).labels, label);
                }
                Token::Ref(r) => {
                    let node = self.resolve(&r)?;
                    self.node_body(node)?;
                }
                Token::DeleteNode => {
                    let node = self.next_ref()?;
                    self.dt.del_node(node);
                    self.lexer.expect(";")?;
                }
                Token::OmitIfNoRef => {
                    let node = self.next_ref()?;
                    self.dt.node_mut(node).omit_if_no_ref = true;
                    self.lexer.expect(";")?;
                }
                Token::Eof => {
                    if !self.root_defined {
                        return self.error("no root node defined");
                    }
                    return Ok(());
                }
                _ => return self.error("expected '/' or label reference (&foo)"),
            }
        }
    }

    fn next_ref(&mut self) -> Result<NodeId, Error> {
        match self.next()? {
            Token::Ref(r) => self.resolve(&r),
            _ => self.error("expected label reference (&foo)"),
        }
    }

    fn resolve(&self, r: &str) -> Result<NodeId, Error> {
        self.dt.ref2node(r).map_err(|e| self.lexer.error(e))
    }

    /* === Nodes and properties === */

    /// Parses `{ ... };`, merging its contents into `node`.
    fn node_body(&mut self, node: NodeId) -> Result<(), Error> {
        self.lexer.expect("{")?;

        let mut seen_here = HashSet::new();
        loop {
            let (labels, omit) = self.propnode_prefix()?;

            match self.next()? {
                Token::Name(name) => {
                    if self.peek()?.is("{") {
                        let child = match self.dt.node(node).children.get(&name) {
                            Some(&child) => child,
                            None => {
                                self.check_node_name(node, &name)?;
                                self.dt.add_child(node, &name)
                            }
                        };
                        if !seen_here.insert(name) {
                            let path = self.dt.path(child);
                            return self.error(format!("{path}: duplicate node name"));
                        }

                        let child_node = self.dt.node_mut(child);
                        for label in labels {
                            push_unique(&mut child_node.labels, label);
                        }
                        if omit {
                            child_node.omit_if_no_ref = true;
                        }
                        self.node_body(child)?;
                    } else {
                        if omit {
                            return self.error("/omit-if-no-ref/ can only be used on nodes");
                        }
                        if name.contains('@') {
                            return self.error("'@' is only allowed in node names");
                        }

                        self.dt
                            .node_mut(node)
                            .props
                            .entry(name.clone())
                            .or_insert_with(|| Property::new(&name, node));

                        if self.lexer.check("=")? {
                            self.assignment(node, &name)?;
                        } else if !self.lexer.check(";")? {
                            return self.error("expected '{', '=', or ';'");
                        }

                        if let Some(prop) = self.dt.node_mut(node).props.get_mut(&name) {
                            for label in labels {
                                push_unique(&mut prop.labels, label);
                            }
                        }
                    }
                }
                Token::DeleteNode => {
                    let Token::Name(name) = self.next()? else {
                        return self.error("expected node name");
                    };
                    match self.dt.node(node).children.get(&name) {
                        Some(&child) => self.dt.del_node(child),
                        None => {
                            let path = self.dt.path(node);
                            return self.error(format!(
                                "/delete-node/: node '{name}' does not exist under {path}"
                            ));
                        }
                    }
                    self.lexer.expect(";")?;
                }
                Token::DeleteProp => {
                    let Token::Name(name) = self.next()? else {
                        return self.error("expected property name");
                    };
                    self.dt.node_mut(node).props.shift_remove(&name);
                    self.lexer.expect(";")?;
                }
                Token::Punct("}") => {
                    self.lexer.expect(";")?;
                    return Ok(());
                }
                _ => return self.error("expected node name, property name, or '}'"),
            }
        }
    }

    /// Parses the labels and `/omit-if-no-ref/` in front of a node or
    /// property name.
    fn propnode_prefix(&mut self) -> Result<(Vec<String>, bool), Error> {
        let mut labels = Vec::new();
        let mut omit = false;
        loop {
            match self.peek()? {
                Token::Label(label) => {
                    let label = label.clone();
                    push_unique(&mut labels, label);
                }
                Token::OmitIfNoRef => omit = true,
                _ => break,
            }
            self.next()?;
        }

        if (!labels.is_empty() || omit) && !matches!(self.peek()?, Token::Name(_)) {
            return self.error("expected node or property name");
        }
        Ok((labels, omit))
    }

    fn check_node_name(&self, parent: NodeId, name: &str) -> Result<(), Error> {
        if name.matches('@').count() > 1 {
            return self.error("multiple '@' in node name");
        }
        let bad = name
            .chars()
            .find(|&c| !(c.is_ascii_alphanumeric() || ",._+-@".contains(c)));
        if let Some(c) = bad {
            let parent = self.dt.path(parent);
            let path = if parent == "/" {
                format!("/{name}")
            } else {
                format!("{parent}/{name}")
            };
            return self.error(format!("{path}: bad character '{c}' in node name"));
        }
        Ok(())
    }

    /* === Property values === */

    /// Parses the value list after `name =`, replacing any earlier value.
    fn assignment(&mut self, node: NodeId, name: &str) -> Result<(), Error> {
        let mut prop = Property::new(name, node);

        loop {
            self.value_labels(&mut prop)?;

            match self.next()? {
                Token::Punct("<") => self.cells(&mut prop, 4)?,
                Token::Bits => {
                    let bits = self.u64_prim()?;
                    if ![8, 16, 32, 64].contains(&bits) {
                        return self.error("expected 8, 16, 32, or 64");
                    }
                    self.lexer.expect("<")?;
                    self.cells(&mut prop, (bits / 8) as usize)?;
                }
                Token::Punct("[") => self.bytes(&mut prop)?,
                Token::Str(s) => {
                    prop.add_marker(MarkerKind::String);
                    prop.value.extend_from_slice(&s);
                    prop.value.push(0);
                }
                Token::Ref(r) => prop.add_marker(MarkerKind::Path(r)),
                Token::Incbin => self.incbin(&mut prop)?,
                _ => return self.error("malformed value"),
            }

            self.value_labels(&mut prop)?;

            match self.next()? {
                Token::Punct(";") => break,
                Token::Punct(",") => continue,
                _ => return self.error("expected ';' or ','"),
            }
        }

        if let Some(existing) = self.dt.node_mut(node).props.get_mut(name) {
            existing.value = prop.value;
            existing.markers = prop.markers;
        }
        Ok(())
    }

    fn value_labels(&mut self, prop: &mut Property) -> Result<(), Error> {
        while let Token::Label(label) = self.peek()? {
            let label = label.clone();
            prop.add_marker(MarkerKind::Label(label));
            self.next()?;
        }
        Ok(())
    }

    /// Parses the inside of `< ... >` with `size`-byte elements.
    fn cells(&mut self, prop: &mut Property, size: usize) -> Result<(), Error> {
        prop.add_marker(MarkerKind::for_elem_size(size));

        loop {
            match self.peek()? {
                Token::Ref(r) => {
                    let r = r.clone();
                    self.next()?;
                    if size != 4 {
                        return self.error(
                            "phandle references are only allowed in arrays with 32-bit elements",
                        );
                    }
                    prop.add_marker(MarkerKind::Phandle(r));
                }
                Token::Label(label) => {
                    let label = label.clone();
                    self.next()?;
                    prop.add_marker(MarkerKind::Label(label));
                }
                tok if tok.is(">") => {
                    self.next()?;
                    return Ok(());
                }
                _ => {
                    let num = self.prim()?;
                    match fit(num, size) {
                        Some(bytes) => prop.value.extend_from_slice(&bytes),
                        None => {
                            return self.error(format!(
                                "{num} does not fit in {} bits",
                                8 * size
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Parses the inside of `[ ... ]`.
    fn bytes(&mut self, prop: &mut Property) -> Result<(), Error> {
        prop.add_marker(MarkerKind::Uint8);

        loop {
            match self.next()? {
                Token::Byte(b) => prop.value.push(b),
                Token::Label(label) => prop.add_marker(MarkerKind::Label(label)),
                Token::Punct("]") => return Ok(()),
                _ => return self.error("expected two-digit byte or ']'"),
            }
        }
    }

    /// Parses `("file" [, offset, size])` after `/incbin/`.
    fn incbin(&mut self, prop: &mut Property) -> Result<(), Error> {
        prop.add_marker(MarkerKind::Uint8);

        self.lexer.expect("(")?;
        let Token::Str(name) = self.next()? else {
            return self.error("expected quoted filename");
        };
        let name = String::from_utf8_lossy(&name).into_owned();

        let range = match self.next()? {
            Token::Punct(",") => {
                let offset = self.u64_prim()?;
                self.lexer.expect(",")?;
                let size = self.u64_prim()?;
                self.lexer.expect(")")?;
                Some((offset, size))
            }
            Token::Punct(")") => None,
            _ => return self.error("expected ',' or ')'"),
        };

        let path = self.lexer.find_file(&name)?;
        let data = fs::read(&path).map_err(|e| {
            self.lexer
                .error(format!("could not read '{}': {e}", path.display()))
        })?;

        let data = match range {
            Some((offset, size)) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = usize::try_from(size)
                    .map_or(data.len(), |size| start.saturating_add(size))
                    .min(data.len());
                &data[start..end]
            }
            None => &data[..],
        };
        prop.value.extend_from_slice(data);
        Ok(())
    }

    /* === Expressions === */

    fn u64_prim(&mut self) -> Result<u64, Error> {
        let num = self.prim()?;
        u64::try_from(num).or_else(|_| self.error(format!("{num} does not fit in 64 bits")))
    }

    fn prim(&mut self) -> Result<i128, Error> {
        if let Token::Num(n) = *self.peek()? {
            self.next()?;
            return Ok(n.into());
        }
        if !self.next()?.is("(") {
            return self.error("expected number or parenthesized expression");
        }
        let val = self.ternary()?;
        self.lexer.expect(")")?;
        Ok(val)
    }

    fn ternary(&mut self) -> Result<i128, Error> {
        let val = self.or()?;
        if self.lexer.check("?")? {
            let if_val = self.ternary()?;
            self.lexer.expect(":")?;
            let else_val = self.ternary()?;
            return Ok(if val != 0 { if_val } else { else_val });
        }
        Ok(val)
    }

    fn or(&mut self) -> Result<i128, Error> {
        let mut val = self.and()?;
        while self.lexer.check("||")? {
            let rhs = self.and()?;
            val = (val != 0 || rhs != 0).into();
        }
        Ok(val)
    }

    fn and(&mut self) -> Result<i128, Error> {
        let mut val = self.bitor()?;
        while self.lexer.check("&&")? {
            let rhs = self.bitor()?;
            val = (val != 0 && rhs != 0).into();
        }
        Ok(val)
    }

    fn bitor(&mut self) -> Result<i128, Error> {
        let mut val = self.xor()?;
        while self.lexer.check("|")? {
            val |= self.xor()?;
        }
        Ok(val)
    }

    fn xor(&mut self) -> Result<i128, Error> {
        let mut val = self.bitand()?;
        while self.lexer.check("^")? {
            val ^= self.bitand()?;
        }
        Ok(val)
    }

    fn bitand(&mut self) -> Result<i128, Error> {
        let mut val = self.eq()?;
        while self.lexer.check("&")? {
            val &= self.eq()?;
        }
        Ok(val)
    }

    fn eq(&mut self) -> Result<i128, Error> {
        let mut val = self.rel()?;
        loop {
            if self.lexer.check("==")? {
                val = (val == self.rel()?).into();
            } else if self.lexer.check("!=")? {
                val = (val != self.rel()?).into();
            } else {
                return Ok(val);
            }
        }
    }

    fn rel(&mut self) -> Result<i128, Error> {
        let mut val = self.shift()?;
        loop {
            if self.lexer.check("<")? {
                val = (val < self.shift()?).into();
            } else if self.lexer.check(">")? {
                val = (val > self.shift()?).into();
            } else if self.lexer.check("<=")? {
                val = (val <= self.shift()?).into();
            } else if self.lexer.check(">=")? {
                val = (val >= self.shift()?).into();
            } else {
                return Ok(val);
            }
        }
    }

    fn shift(&mut self) -> Result<i128, Error> {
        let mut val = self.add()?;
        loop {
            let left = if self.lexer.check("<<")? {
                true
            } else if self.lexer.check(">>")? {
                false
            } else {
                return Ok(val);
            };
            let count = self.add()?;
            val = match shift(val, count, left) {
                Some(v) => v,
                None => return self.error(format!("bad shift of {val} by {count}")),
            };
        }
    }

    fn add(&mut self) -> Result<i128, Error> {
        let mut val = self.mul()?;
        loop {
            let res = if self.lexer.check("+")? {
                val.checked_add(self.mul()?)
            } else if self.lexer.check("-")? {
                val.checked_sub(self.mul()?)
            } else {
                return Ok(val);
            };
            val = match res {
                Some(v) => v,
                None => return self.error("integer overflow in expression"),
            };
        }
    }

    fn mul(&mut self) -> Result<i128, Error> {
        let mut val = self.unary()?;
        loop {
            let op = if self.lexer.check("*")? {
                '*'
            } else if self.lexer.check("/")? {
                '/'
            } else if self.lexer.check("%")? {
                '%'
            } else {
                return Ok(val);
            };
            let rhs = self.unary()?;
            if op != '*' && rhs == 0 {
                return self.error("division by zero");
            }
            let res = match op {
                '*' => val.checked_mul(rhs),
                '/' => Some(floor_div(val, rhs)),
                _ => Some(val - rhs * floor_div(val, rhs)),
            };
            val = match res {
                Some(v) => v,
                None => return self.error("integer overflow in expression"),
            };
        }
    }

    fn unary(&mut self) -> Result<i128, Error> {
        if self.lexer.check("-")? {
            let val = self.unary()?;
            return val
                .checked_neg()
                .map_or_else(|| self.error("integer overflow in expression"), Ok);
        }
        if self.lexer.check("~")? {
            return Ok(!self.unary()?);
        }
        if self.lexer.check("!")? {
            return Ok((self.unary()? == 0).into());
        }
        self.prim()
    }
}

/* === Utility functions === */

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Encodes `num` as a `size`-byte big-endian value. Numbers that fit as
/// either unsigned or two's complement signed are accepted.
fn fit(num: i128, size: usize) -> Option<Vec<u8>> {
    let bits = 8 * size as u32;
    let range = 1i128 << bits;
    let num = if (0..range).contains(&num) {
        num
    } else if (-(range >> 1)..0).contains(&num) {
        num + range
    } else {
        return None;
    };
    Some(num.to_be_bytes()[16 - size..].to_vec())
}

/// Division rounding toward negative infinity.
fn floor_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn shift(val: i128, count: i128, left: bool) -> Option<i128> {
    let count = u32::try_from(count).ok().filter(|c| *c < 128)?;
    if left {
        let res = val << count;
        (res >> count == val).then_some(res)
    } else {
        Some(val >> count)
    }
}

/* === Unit Tests === */

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use rstest::rstest;

    use crate::dt::Type;

    fn parse(src: &str) -> Result<DeviceTree, Error> {
        DeviceTree::parse_str("test.dts", src, &[])
    }

    fn prop_value(src: &str) -> Vec<u8> {
        let dt = parse(&format!("/dts-v1/; / {{ p = {src}; }};")).unwrap();
        dt.node(dt.root()).prop("p").unwrap().value().to_vec()
    }

    fn parse_error(src: &str) -> String {
        match parse(src) {
            Err(Error::Parse { msg, .. }) => msg,
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_values() {
        for (input, exp) in [
            ("<>", vec![]),
            ("< 10 20 >", vec![0, 0, 0, 10, 0, 0, 0, 20]),
            ("/bits/ 8 < 0x10 0x20 (-1) >", vec![0x10, 0x20, 0xff]),
            ("/bits/ 16 < 0x1234 >", vec![0x12, 0x34]),
            ("/bits/ 64 < 1 >", vec![0, 0, 0, 0, 0, 0, 0, 1]),
            ("[ 01 23ab ]", vec![0x01, 0x23, 0xab]),
            ("\"ab\", \"\"", vec![b'a', b'b', 0, 0]),
            ("< 'a' >", vec![0, 0, 0, 0x61]),
            ("< (-1) >", vec![0xff, 0xff, 0xff, 0xff]),
            ("< 0xffffffff >", vec![0xff, 0xff, 0xff, 0xff]),
        ] {
            assert_eq!(prop_value(input), exp, "{input}");
        }
    }

    #[rstest]
    #[case("1 + 2 * 3", 7)]
    #[case("(1 + 2) * 3", 9)]
    #[case("7 / 2", 3)]
    #[case("-7 / 2", -4)]
    #[case("-7 % 3", 2)]
    #[case("7 % -3", -2)]
    #[case("1 << 4 | 1", 17)]
    #[case("0x100 >> 4", 16)]
    #[case("~0 & 0xff", 0xff)]
    #[case("!0 + !5", 1)]
    #[case("3 > 2 && 2 >= 2", 1)]
    #[case("1 < 0 || 0", 0)]
    #[case("1 == 1 ? 10 : 20", 10)]
    #[case("0 ? 1 : 0 ? 2 : 3", 3)]
    #[case("5 ^ 1 != 4", 4)]
    #[case("-(-3)", 3)]
    fn evaluate_expressions(#[case] expr: &str, #[case] exp: i128) {
        let dt = parse(&format!("/dts-v1/; / {{ p = /bits/ 64 < ({expr}) >; }};")).unwrap();
        let value = dt.node(dt.root()).prop("p").unwrap().value().to_vec();
        assert_eq!(value, fit(exp, 8).unwrap());
    }

    #[rstest]
    #[case("/ { };", "expected '/dts-v1/;' at start of file")]
    #[case("/dts-v1/; /plugin/;", "/plugin/ is not supported")]
    #[case("/dts-v1/; l: / { };", "expected /memreserve/ after labels at beginning of file")]
    #[case("/dts-v1/;", "no root node defined")]
    #[case("/dts-v1/; foo", "expected '/' or label reference (&foo)")]
    #[case("/dts-v1/; / { a = /bits/ 16 < 0x10000 >; };", "65536 does not fit in 16 bits")]
    #[case("/dts-v1/; / { a = < 0x100000000 >; };", "4294967296 does not fit in 32 bits")]
    #[case("/dts-v1/; / { a = [ 123 ]; };", "expected two-digit byte or ']'")]
    #[case("/dts-v1/; / { foo@1@2 { }; };", "multiple '@' in node name")]
    #[case("/dts-v1/; / { foo*bar { }; };", "/foo*bar: bad character '*' in node name")]
    #[case("/dts-v1/; / { a@1 = <1>; };", "'@' is only allowed in node names")]
    #[case("/dts-v1/; / { a = < (1 / 0) >; };", "division by zero")]
    #[case("/dts-v1/; / { a = < (5 % 0) >; };", "division by zero")]
    #[case("/dts-v1/; / { a = /bits/ 7 < 1 >; };", "expected 8, 16, 32, or 64")]
    #[case("/dts-v1/; / { a = /bits/ 8 < &b >; };", "phandle references are only allowed in arrays with 32-bit elements")]
    #[case("/dts-v1/; / { a = /incbin/ (\"missing\"); };", "'missing' could not be found")]
    #[case("/dts-v1/; / { a = ; };", "malformed value")]
    #[case("/dts-v1/; / { a = <1> <2>; };", "expected ';' or ','")]
    #[case("/dts-v1/; / { a { }; a { }; };", "/a: duplicate node name")]
    #[case("/dts-v1/; / { /omit-if-no-ref/ a; };", "/omit-if-no-ref/ can only be used on nodes")]
    #[case("/dts-v1/; / { a }; };", "expected '{', '=', or ';'")]
    #[case("/dts-v1/; / { /delete-node/ nope; };", "/delete-node/: node 'nope' does not exist under /")]
    #[case("/dts-v1/; / { }; &nope { };", "undefined node label 'nope'")]
    #[case("/dts-v1/; / { }; &{/nope} { };", "component 'nope' in path '/nope' does not exist")]
    #[case("/dts-v1/; / { }; &{nope} { };", "node path 'nope' does not start with '/'")]
    #[case("/dts-v1/; / { }; l: / { };", "expected label reference (&foo)")]
    #[case("/dts-v1/; / { a = < ( 1 ; >; };", "expected ')', not ';'")]
    #[case("/dts-v1/; / { a = < + >; };", "expected number or parenthesized expression")]
    fn reject_malformed_input(#[case] src: &str, #[case] exp: &str) {
        assert_eq!(parse_error(src), exp);
    }

    #[test]
    fn report_error_location() {
        let err = parse("/dts-v1/;\n/ {\n\ta = < 0x100000000 >;\n};").unwrap_err();
        assert_matches!(err, Error::Parse { file, line: 3, column, .. } if file == "test.dts" && column > 1);
    }

    #[test]
    fn merge_nodes_and_properties() {
        let dt = parse(
            "/dts-v1/;
            / {
                l: a { x = <1>; y = <2>; };
            };
            / {
                a { x = \"over\"; z; };
            };
            &l { w = <3>; /delete-property/ y; /delete-property/ nope; };
            &{/a} { v; };",
        )
        .unwrap();

        let a = dt.get_node("/a").unwrap();
        let names: Vec<&str> = dt.node(a).props().keys().map(String::as_str).collect();
        assert_eq!(names, ["x", "z", "w", "v"]);
        assert_eq!(dt.node(a).prop("x").unwrap().to_str().unwrap(), "over");
        assert_eq!(dt.node(a).prop("z").unwrap().ty(), Type::Empty);
    }

    #[test]
    fn delete_and_redeclare_labelled_node() {
        let dt = parse(
            "/dts-v1/;
            / {
                aliases { s = &u; };
                u: u@1 { };
            };
            /delete-node/ &u;
            / {
                u: u@2 { };
            };",
        )
        .unwrap();

        assert!(!dt.has_node("/u@1"));
        assert_eq!(dt.get_node("s").unwrap(), dt.get_node("/u@2").unwrap());
    }

    #[test]
    fn delete_child_node() {
        let dt = parse(
            "/dts-v1/;
            / { a { b { }; }; };
            / { a { /delete-node/ b; }; };",
        )
        .unwrap();
        assert!(dt.has_node("/a"));
        assert!(!dt.has_node("/a/b"));
    }

    #[test]
    fn parse_memreserves() {
        let dt = parse(
            "/dts-v1/;
            /memreserve/ 0x1000 (0x10 * 2);
            a: b: /memreserve/ 0 1;
            / { };",
        )
        .unwrap();

        assert_eq!(
            dt.memreserves(),
            [
                MemReserve {
                    labels: vec![],
                    address: 0x1000,
                    size: 0x20
                },
                MemReserve {
                    labels: vec!["a".into(), "b".into()],
                    address: 0,
                    size: 1
                },
            ]
        );
    }

    #[test]
    fn top_level_omit_and_labels() {
        let dt = parse(
            "/dts-v1/;
            / { n: node { }; m: other { }; };
            /omit-if-no-ref/ &n;
            extra: &m { };",
        )
        .unwrap();

        assert!(!dt.has_node("/node"));
        let other = dt.get_node("/other").unwrap();
        assert_eq!(dt.node(other).labels(), ["m", "extra"]);
    }

    #[test]
    fn repeated_header_is_accepted() {
        assert!(parse("/dts-v1/; /dts-v1/; / { };").is_ok());
    }

    #[test]
    fn include_and_incbin() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("inc");
        fs::create_dir(&inc).unwrap();
        fs::write(inc.join("common.dtsi"), "/ { from-include; };").unwrap();
        fs::write(dir.path().join("blob.bin"), [1u8, 2, 3, 4, 5]).unwrap();
        let main = dir.path().join("main.dts");
        fs::write(
            &main,
            "/dts-v1/;
            /include/ \"common.dtsi\"
            / {
                all = /incbin/ (\"blob.bin\");
                part = /incbin/ (\"blob.bin\", 1, 2);
            };",
        )
        .unwrap();

        let dt = DeviceTree::parse_file(&main, &[inc]).unwrap();
        let root = dt.node(dt.root());
        assert!(root.prop("from-include").is_some());
        assert_eq!(root.prop("all").unwrap().to_bytes().unwrap(), [1, 2, 3, 4, 5]);
        assert_eq!(root.prop("part").unwrap().to_bytes().unwrap(), [2, 3]);
    }

    #[test]
    fn fit_numbers() {
        assert_eq!(fit(255, 1), Some(vec![0xff]));
        assert_eq!(fit(-128, 1), Some(vec![0x80]));
        assert_eq!(fit(-129, 1), None);
        assert_eq!(fit(256, 1), None);
        assert_eq!(fit(-1, 8), Some(vec![0xff; 8]));
        assert_eq!(fit(u64::MAX.into(), 8), Some(vec![0xff; 8]));
    }
}
