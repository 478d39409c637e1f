use std::io::{self, Write};

use super::node_idents;
use super::writer::Writer;
use crate::edt::Edt;

/// Writes a header declaring the `struct device` of every node, in
/// dependency order.
pub fn write_device_extern<W: Write>(edt: &Edt, out: W) -> io::Result<()> {
    let idents = node_idents(edt)?;
    let mut w = Writer::new(out);

    w.line("#ifndef DEVICE_EXTERN_GEN_H")?;
    w.line("#define DEVICE_EXTERN_GEN_H")?;
    w.line("")?;
    w.line("#ifdef __cplusplus")?;
    w.line("extern \"C\" {")?;
    w.line("#endif")?;
    w.line("")?;

    for node in edt.ordered_nodes() {
        w.line(&format!(
            "extern const struct device DEVICE_DT_NAME_GET(DT_{}); /* dts_ord_{} */",
            idents[node.id().index()],
            node.dep_ordinal()
        ))?;
    }

    w.line("")?;
    w.line("#ifdef __cplusplus")?;
    w.line("}")?;
    w.line("#endif")?;
    w.line("")?;
    w.line("#endif /* DEVICE_EXTERN_GEN_H */")?;
    w.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binding::Bindings;
    use crate::dt::DeviceTree;
    use crate::edt::EdtOptions;

    #[test]
    fn one_extern_per_node() {
        let dt = DeviceTree::parse_str(
            "board.dts",
            "/dts-v1/; / { a { }; b { }; };",
            &[],
        )
        .unwrap();
        let edt = Edt::new(dt, Bindings::default(), EdtOptions::default()).unwrap();

        let mut out = Vec::new();
        write_device_extern(&edt, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.starts_with("#ifndef DEVICE_EXTERN_GEN_H\n#define DEVICE_EXTERN_GEN_H\n"));
        assert!(out.ends_with("#endif /* DEVICE_EXTERN_GEN_H */\n"));
        assert!(out.contains("extern const struct device DEVICE_DT_NAME_GET(DT_N); /* dts_ord_0 */\n"));
        assert!(out.contains("DEVICE_DT_NAME_GET(DT_N_S_a); /* dts_ord_1 */"));
        assert!(out.contains("DEVICE_DT_NAME_GET(DT_N_S_b); /* dts_ord_2 */"));
    }

    #[test]
    fn reject_colliding_identifiers() {
        let dt = DeviceTree::parse_str("board.dts", "/dts-v1/; / { a-b { }; a_b { }; };", &[])
            .unwrap();
        let edt = Edt::new(dt, Bindings::default(), EdtOptions::default()).unwrap();

        let err = write_device_extern(&edt, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
