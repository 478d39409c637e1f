//! Validation of merged binding contents.

use serde_yaml::{Mapping, Value};

use super::include::type_name;
use super::{err, show, string_list, Error, PropType};

const TOP_KEYS: [&str; 6] = [
    "description",
    "compatible",
    "bus",
    "on-bus",
    "properties",
    "child-binding",
];

const PROP_KEYS: [&str; 8] = [
    "description",
    "type",
    "required",
    "enum",
    "const",
    "default",
    "deprecated",
    "specifier-space",
];

const LEGACY_KEYS: [(&str, &str); 7] = [
    ("#cells", "expected *-cells syntax"),
    ("child", "use 'bus: <bus>' instead"),
    ("child-bus", "use 'bus: <bus>' instead"),
    ("parent", "use 'on-bus: <bus>' instead"),
    ("parent-bus", "use 'on-bus: <bus>' instead"),
    ("sub-node", "use 'child-binding' instead"),
    ("title", "use 'description' instead"),
];

pub(super) fn check_binding(
    raw: &Mapping,
    path: &str,
    require_compatible: bool,
    require_description: bool,
) -> Result<(), Error> {
    match raw.get("compatible") {
        Some(Value::String(_)) => {}
        Some(other) => {
            return err(format!(
                "malformed 'compatible: {}' field in {path} - should be a string, not {}",
                show(other),
                type_name(other)
            ))
        }
        None if require_compatible => return err(format!("missing 'compatible' in {path}")),
        None => {}
    }

    match raw.get("description") {
        Some(Value::String(d)) if !d.is_empty() => {}
        Some(_) => return err(format!("malformed or empty 'description' in {path}")),
        None if require_description => return err(format!("missing 'description' in {path}")),
        None => {}
    }

    for (key, _) in raw {
        let Some(key) = key.as_str() else {
            return err(format!("non-string key in {path}"));
        };
        if let Some((_, hint)) = LEGACY_KEYS.iter().find(|(k, _)| *k == key) {
            return err(format!("legacy '{key}:' in {path}, {hint}"));
        }
        if !TOP_KEYS.contains(&key) && !key.ends_with("-cells") {
            return err(format!(
                "unknown key '{key}' in {path}, expected one of {}, or *-cells",
                TOP_KEYS.join(", ")
            ));
        }
    }

    match raw.get("bus") {
        None | Some(Value::String(_)) => {}
        Some(bus) if string_list(bus).is_some() => {}
        Some(_) => {
            return err(format!(
                "malformed 'bus:' value in {path}, expected string or list of strings"
            ))
        }
    }
    if let Some(bus) = raw.get("on-bus") {
        if !bus.is_string() {
            return err(format!("malformed 'on-bus:' value in {path}, expected string"));
        }
    }

    for (key, val) in raw {
        let Some(key) = key.as_str().filter(|k| k.ends_with("-cells")) else {
            continue;
        };
        if string_list(val).is_none() {
            return err(format!(
                "malformed '{key}:' in {path}, expected a list of strings"
            ));
        }
    }

    match raw.get("properties") {
        None => Ok(()),
        Some(Value::Mapping(props)) => check_properties(props, path),
        Some(_) => err(format!("malformed 'properties:' in {path}, expected a mapping")),
    }
}

fn check_properties(props: &Mapping, path: &str) -> Result<(), Error> {
    for (name, options) in props {
        let name = name.as_str().unwrap_or_default();
        let Value::Mapping(options) = options else {
            return err(format!(
                "malformed 'properties: {name}' in {path}, expected a mapping"
            ));
        };

        for key in options.keys() {
            let key = key.as_str().unwrap_or_default();
            if !PROP_KEYS.contains(&key) {
                return err(format!(
                    "unknown setting '{key}' in 'properties: {name}: ...' in {path}, expected one of {}",
                    PROP_KEYS.join(", ")
                ));
            }
        }

        check_by_type(name, options, path)?;

        for key in ["required", "deprecated"] {
            if options.get(key).is_some_and(|v| !v.is_bool()) {
                return err(format!(
                    "malformed '{key}:' setting '{}' for '{name}' in 'properties' in {path}, expected true/false",
                    show(&options[key])
                ));
            }
        }
        let flag = |key: &str| options.get(key).and_then(Value::as_bool) == Some(true);
        if flag("deprecated") && flag("required") {
            return err(format!(
                "'{name}' in 'properties' in {path} should not have both 'deprecated' and 'required' set"
            ));
        }

        if options.get("description").is_some_and(|d| !d.is_string()) {
            return err(format!(
                "missing, malformed, or empty 'description' for '{name}' in 'properties' in {path}"
            ));
        }
        if options.get("enum").is_some_and(|e| !e.is_sequence()) {
            return err(format!(
                "enum in {path} for property '{name}' is not a list"
            ));
        }
    }
    Ok(())
}

fn check_by_type(name: &str, options: &Mapping, path: &str) -> Result<(), Error> {
    let Some(ty) = options.get("type") else {
        return err(format!("missing 'type:' for '{name}' in 'properties' in {path}"));
    };
    let Some(ty) = ty.as_str().and_then(|t| t.parse::<PropType>().ok()) else {
        let all: Vec<&str> = PropType::ALL.iter().map(|t| t.as_str()).collect();
        return err(format!(
            "'{name}' in 'properties:' in {path} has unknown type '{}', expected one of {}",
            show(ty),
            all.join(", ")
        ));
    };

    if options.contains_key("specifier-space") && ty != PropType::PhandleArray {
        return err(format!(
            "'specifier-space' in 'properties: {name}' has type '{ty}', expected 'phandle-array'"
        ));
    }
    if ty == PropType::PhandleArray
        && !name.ends_with('s')
        && !options.contains_key("specifier-space")
    {
        return err(format!(
            "'{name}' in 'properties:' in {path} has type 'phandle-array' and its name does not \
             end in 's', but no 'specifier-space' was provided."
        ));
    }

    if options.contains_key("const")
        && !matches!(
            ty,
            PropType::Int
                | PropType::Array
                | PropType::Uint8Array
                | PropType::String
                | PropType::StringArray
        )
    {
        return err(format!(
            "const in {path} for property '{name}' has type '{ty}', expected one of int, array, \
             uint8-array, string, string-array"
        ));
    }

    let Some(default) = options.get("default") else {
        return Ok(());
    };
    if matches!(
        ty,
        PropType::Boolean
            | PropType::Compound
            | PropType::Phandle
            | PropType::Phandles
            | PropType::PhandleArray
            | PropType::Path
    ) {
        return err(format!(
            "'default:' can't be combined with 'type: {ty}' for '{name}' in 'properties:' in {path}"
        ));
    }

    let is_int = |v: &Value| v.as_i64().is_some();
    let ok = match ty {
        PropType::Int => is_int(default),
        PropType::Array => default.as_sequence().is_some_and(|s| s.iter().all(is_int)),
        PropType::Uint8Array => default
            .as_sequence()
            .is_some_and(|s| s.iter().all(|v| v.as_u64().is_some_and(|n| n <= 255))),
        PropType::String => default.is_string(),
        PropType::StringArray => string_list(default).is_some(),
        _ => false,
    };
    if !ok {
        return err(format!(
            "'default: {}' is invalid for '{name}' in 'properties:' in {path}, which has type {ty}",
            show(default)
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn check(yaml: &str) -> Result<(), Error> {
        let raw: Mapping = serde_yaml::from_str(yaml).unwrap();
        check_binding(&raw, "test.yaml", true, true)
    }

    #[test]
    fn accept_complete_binding() {
        check(
            "
description: d
compatible: vnd,dev
bus: [i2c, i3c]
on-bus: spi
gpio-cells: [pin, flags]
properties:
  a:
    type: uint8-array
    default: [1, 255]
  b:
    type: string-array
    const: [x, y]
  c:
    type: phandle-array
    specifier-space: gpio
  d-gpios:
    type: phandle-array
    deprecated: true
",
        )
        .unwrap();
    }

    #[rstest]
    #[case("description: d\n", "missing 'compatible' in test.yaml")]
    #[case("compatible: [a]\ndescription: d\n", "malformed 'compatible: [a]' field")]
    #[case("compatible: c\n", "missing 'description' in test.yaml")]
    #[case("compatible: c\ndescription: ''\n", "malformed or empty 'description'")]
    #[case("compatible: c\ndescription: d\ntitle: t\n", "legacy 'title:' in test.yaml, use 'description' instead")]
    #[case("compatible: c\ndescription: d\nsub-node: {}\n", "use 'child-binding' instead")]
    #[case("compatible: c\ndescription: d\nfoo: 1\n", "unknown key 'foo' in test.yaml")]
    #[case("compatible: c\ndescription: d\nbus: 3\n", "malformed 'bus:'")]
    #[case("compatible: c\ndescription: d\non-bus: [a]\n", "malformed 'on-bus:'")]
    #[case("compatible: c\ndescription: d\ngpio-cells: pin\n", "malformed 'gpio-cells:'")]
    fn reject_bad_top_level(#[case] yaml: &str, #[case] exp: &str) {
        let msg = check(yaml).unwrap_err().to_string();
        assert!(msg.contains(exp), "{msg}");
    }

    #[rstest]
    #[case("p:\n  required: true\n", "missing 'type:' for 'p'")]
    #[case("p:\n  type: float\n", "has unknown type 'float'")]
    #[case("p:\n  type: int\n  foo: 1\n", "unknown setting 'foo' in 'properties: p: ...'")]
    #[case("p:\n  type: int\n  required: yes please\n", "malformed 'required:' setting")]
    #[case("p:\n  type: int\n  required: true\n  deprecated: true\n", "should not have both 'deprecated' and 'required' set")]
    #[case("p:\n  type: int\n  enum: 3\n", "is not a list")]
    #[case("p:\n  type: int\n  specifier-space: gpio\n", "expected 'phandle-array'")]
    #[case("pwm:\n  type: phandle-array\n", "does not end in 's'")]
    #[case("p:\n  type: boolean\n  const: 1\n", "const in test.yaml for property 'p'")]
    #[case("p:\n  type: boolean\n  default: true\n", "can't be combined with 'type: boolean'")]
    #[case("p:\n  type: int\n  default: foo\n", "'default: foo' is invalid for 'p'")]
    #[case("p:\n  type: uint8-array\n  default: [256]\n", "'default: [256]' is invalid")]
    fn reject_bad_properties(#[case] props: &str, #[case] exp: &str) {
        let indented: String = props.lines().map(|l| format!("  {l}\n")).collect();
        let yaml = format!("compatible: c\ndescription: d\nproperties:\n{indented}");
        let msg = check(&yaml).unwrap_err().to_string();
        assert!(msg.contains(exp), "{msg}");
    }
}
