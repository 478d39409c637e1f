//! Devicetree tooling: a DTS parser ([`dt`]), a YAML binding loader
//! ([`binding`]), the extended devicetree that joins the two ([`edt`]) and a
//! C header generator ([`gen`]).

pub mod binding;
pub mod dt;
pub mod edt;
pub mod gen;
