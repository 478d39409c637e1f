//! `include:` handling: loading, filtering and merging included bindings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};

use super::{display_path, err, read_mapping, show, string_list, Binding, Error, Filter, PropertySpec};

/// Keys an including binding may overwrite freely.
const FREE_KEYS: [&str; 3] = ["title", "description", "compatible"];

/// Collects the merged contents and property specs of everything a binding
/// includes.
pub(super) struct Builder<'a> {
    fname2path: &'a HashMap<String, PathBuf>,
    /// Filters inherited from whoever included this binding.
    filter: Filter,
    specs: IndexMap<String, PropertySpec>,
}

impl<'a> Builder<'a> {
    pub fn new(fname2path: &'a HashMap<String, PathBuf>, filter: Filter) -> Self {
        Self {
            fname2path,
            filter,
            specs: IndexMap::new(),
        }
    }

    pub fn into_specs(self) -> IndexMap<String, PropertySpec> {
        self.specs
    }

    /// Merges the files named by `include:` into `raw` and returns the
    /// result. Properties in `raw` take precedence but may not weaken what
    /// they override.
    pub fn merge_includes(&mut self, mut raw: Mapping, path: Option<&Path>) -> Result<Mapping, Error> {
        let where_ = display_path(path);
        let Some(include) = raw.remove("include") else {
            return Ok(raw);
        };
        let include = match include {
            Value::Tagged(tagged) if tagged.tag == "!include" => tagged.value,
            other => other,
        };

        let mut merged = Mapping::new();
        match include {
            Value::String(name) => {
                let contents = self.load_raw(&name, Filter::default())?;
                merge_props(&mut merged, &contents, None, &where_, false)?;
            }
            Value::Sequence(elems) => {
                for elem in elems {
                    let contents = match elem {
                        Value::String(name) => self.load_raw(&name, Filter::default())?,
                        Value::Mapping(map) => {
                            let (name, filter) = include_entry(map, &where_)?;
                            self.load_raw(&name, filter)?
                        }
                        other => {
                            return err(format!(
                                "all elements in 'include:' in {where_} should be either strings or \
                                 maps with a 'name' key and optional 'property-allowlist' or \
                                 'property-blocklist' keys, but got: {}",
                                show(&other)
                            ))
                        }
                    };
                    merge_props(&mut merged, &contents, None, &where_, false)?;
                }
            }
            other => {
                return err(format!(
                    "'include:' in {where_} should be a string or list, but has type {}",
                    type_name(&other)
                ))
            }
        }

        merge_props(&mut raw, &merged, None, &where_, true)?;
        Ok(raw)
    }

    /// Loads the included file `fname`, applies `filter` and the inherited
    /// filters, and returns its contents with its own includes merged.
    fn load_raw(&mut self, fname: &str, filter: Filter) -> Result<Mapping, Error> {
        let Some(path) = self.fname2path.get(fname) else {
            return err(format!("'{fname}' not found"));
        };
        let mut contents = read_mapping(path)?;
        filter.apply(&mut contents);
        self.filter.apply(&mut contents);

        let inherited = self.filter.narrow(&filter);
        let binding = Binding::new(Some(path), self.fname2path, contents, false, false, inherited)?;
        for (name, spec) in binding.prop2specs {
            self.specs.entry(name).or_insert(spec);
        }
        Ok(binding.raw)
    }
}

/// Splits an `include:` map into the file name and its property filters.
fn include_entry(mut map: Mapping, where_: &str) -> Result<(String, Filter), Error> {
    let name = map.remove("name");
    let filter = Filter::from_map(&mut map, where_)?;

    if !map.is_empty() {
        return err(format!(
            "'include:' in {where_} should not have these unexpected contents: {}",
            show(&Value::Mapping(map))
        ));
    }
    let Some(name) = name else {
        return err(format!(
            "'include:' element in {where_} should have a 'name' key"
        ));
    };
    let Value::String(name) = name else {
        return err(format!(
            "'name' in 'include:' in {where_} should be a string, not {}",
            show(&name)
        ));
    };

    filter.check(&name, where_)?;
    Ok((name, filter))
}

impl Filter {
    fn from_map(map: &mut Mapping, where_: &str) -> Result<Self, Error> {
        let list = |value: Option<Value>, key: &str| -> Result<Option<Vec<String>>, Error> {
            match value {
                None => Ok(None),
                Some(v) => match string_list(&v) {
                    Some(list) => Ok(Some(list)),
                    None => err(format!("'{key}' value {} in {where_} should be a list", show(&v))),
                },
            }
        };

        let allow = list(map.remove("property-allowlist"), "property-allowlist")?;
        let block = list(map.remove("property-blocklist"), "property-blocklist")?;
        let child = match map.remove("child-binding") {
            None => None,
            Some(Value::Mapping(mut child)) => {
                let filter = Filter::from_map(&mut child, where_)?;
                if !child.is_empty() {
                    return err(format!(
                        "'include:' in {where_} should not have these unexpected contents: {}",
                        show(&Value::Mapping(child))
                    ));
                }
                Some(Box::new(filter))
            }
            Some(other) => {
                return err(format!(
                    "'child-binding' value {} in 'include:' in {where_} should be a mapping",
                    show(&other)
                ))
            }
        };

        Ok(Self { allow, block, child })
    }

    fn check(&self, name: &str, where_: &str) -> Result<(), Error> {
        if self.allow.is_some() && self.block.is_some() {
            return err(format!(
                "'include:' of file '{name}' in {where_} should not specify both \
                 'property-allowlist:' and 'property-blocklist:'"
            ));
        }
        match &self.child {
            Some(child) => child.check(name, where_),
            None => Ok(()),
        }
    }

    fn keeps(&self, prop: &str) -> bool {
        let allowed = self.allow.as_ref().map_or(true, |l| l.iter().any(|p| p == prop));
        let blocked = self.block.as_ref().is_some_and(|l| l.iter().any(|p| p == prop));
        allowed && !blocked
    }

    /// Drops filtered properties from `contents`, descending into
    /// `child-binding:` for nested filters.
    pub(super) fn apply(&self, contents: &mut Mapping) {
        if let Some(Value::Mapping(props)) = contents.get_mut("properties") {
            props.retain(|k, _| k.as_str().map_or(true, |k| self.keeps(k)));
        }
        if let (Some(child), Some(Value::Mapping(binding))) =
            (&self.child, contents.get_mut("child-binding"))
        {
            child.apply(binding);
        }
    }

    /// The top-level filter that applies once both `self` and `other` do.
    fn narrow(&self, other: &Filter) -> Filter {
        let allow = match (&self.allow, &other.allow) {
            (Some(a), Some(b)) => Some(a.iter().filter(|p| b.contains(p)).cloned().collect()),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let block = match (&self.block, &other.block) {
            (Some(a), Some(b)) => Some(a.iter().chain(b).cloned().collect()),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        Filter {
            allow,
            block,
            child: None,
        }
    }
}

/// Merges `from` into `to`. Nested mappings are merged recursively and keys
/// already in `to` win, unless that would weaken what `from` declared.
pub(super) fn merge_props(
    to: &mut Mapping,
    from: &Mapping,
    parent: Option<&str>,
    where_: &str,
    check_required: bool,
) -> Result<(), Error> {
    for (key, from_val) in from {
        let Some(name) = key.as_str() else {
            if !to.contains_key(key) {
                to.insert(key.clone(), from_val.clone());
            }
            continue;
        };

        if !to.contains_key(name) {
            to.insert(key.clone(), from_val.clone());
            continue;
        }

        let Some(to_val) = to.get_mut(name) else {
            continue;
        };
        if let (Value::Mapping(to_map), Value::Mapping(from_map)) = (&mut *to_val, from_val) {
            merge_props(to_map, from_map, Some(name), where_, check_required)?;
            continue;
        }
        if *to_val == *from_val || FREE_KEYS.contains(&name) {
            continue;
        }

        let overwritten = || {
            err(format!(
                "{where_} (in '{}'): '{name}' from included file overwritten ('{}' replaced with '{}')",
                parent.unwrap_or("None"),
                show(from_val),
                show(to_val)
            ))
        };

        if name != "required" {
            return overwritten();
        }
        let (Some(to_req), Some(from_req)) = (to_val.as_bool(), from_val.as_bool()) else {
            return err(format!(
                "malformed 'required:' setting for '{}' in 'properties' in {where_}, expected true/false",
                parent.unwrap_or("None")
            ));
        };
        if check_required && from_req && !to_req {
            return overwritten();
        }
        *to_val = Value::Bool(to_req || from_req);
    }
    Ok(())
}

pub(super) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "dict",
        Value::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{load, write_bindings};
    use super::super::{Literal, PropType};
    use super::*;

    use assert_matches::assert_matches;

    const BASE: &str = "
description: base
properties:
  reg:
    type: array
  label:
    type: string
    required: false
  status:
    type: string
    enum: [okay, disabled]
  clock-frequency:
    type: int
    required: true
";

    #[test]
    fn include_and_extend() {
        let dir = write_bindings(&[
            ("base.yaml", BASE),
            (
                "dev.yaml",
                "
description: dev
compatible: vnd,dev
include: base.yaml
properties:
  label:
    required: true
  extra:
    type: boolean
",
            ),
        ]);

        let binding = load(&dir, "dev.yaml").unwrap();
        let names: Vec<&str> = binding.prop2specs.keys().map(String::as_str).collect();
        assert_eq!(names, ["reg", "label", "status", "clock-frequency", "extra"]);

        let label = &binding.prop2specs["label"];
        assert!(label.required);
        assert_eq!(label.ty, PropType::String);
        assert_eq!(label.path.as_deref(), Some(dir.path().join("dev.yaml").as_path()));

        let reg = &binding.prop2specs["reg"];
        assert_eq!(reg.path.as_deref(), Some(dir.path().join("base.yaml").as_path()));
        assert!(binding.prop2specs["clock-frequency"].required);
    }

    #[test]
    fn include_tag_and_list_forms() {
        let dir = write_bindings(&[
            ("base.yaml", BASE),
            ("more.yaml", "properties:\n  more:\n    type: int\n"),
            (
                "tagged.yaml",
                "description: t\ncompatible: vnd,t\ninclude: !include base.yaml\n",
            ),
            (
                "list.yaml",
                "description: l\ncompatible: vnd,l\ninclude: [base.yaml, more.yaml]\n",
            ),
        ]);

        assert!(load(&dir, "tagged.yaml").unwrap().prop2specs.contains_key("reg"));
        let list = load(&dir, "list.yaml").unwrap();
        assert!(list.prop2specs.contains_key("reg"));
        assert!(list.prop2specs.contains_key("more"));
    }

    #[test]
    fn filter_included_properties() {
        let dir = write_bindings(&[
            ("base.yaml", BASE),
            (
                "allow.yaml",
                "
description: a
compatible: vnd,a
include:
  - name: base.yaml
    property-allowlist: [reg, status]
",
            ),
            (
                "block.yaml",
                "
description: b
compatible: vnd,b
include:
  - name: base.yaml
    property-blocklist: [reg]
",
            ),
        ]);

        let allow = load(&dir, "allow.yaml").unwrap();
        let names: Vec<&str> = allow.prop2specs.keys().map(String::as_str).collect();
        assert_eq!(names, ["reg", "status"]);

        let block = load(&dir, "block.yaml").unwrap();
        assert!(!block.prop2specs.contains_key("reg"));
        assert!(block.prop2specs.contains_key("label"));
    }

    #[test]
    fn filters_reach_nested_includes() {
        let dir = write_bindings(&[
            ("base.yaml", BASE),
            ("middle.yaml", "include: base.yaml\nproperties:\n  mid:\n    type: int\n"),
            (
                "top.yaml",
                "
description: top
compatible: vnd,top
include:
  - name: middle.yaml
    property-blocklist: [reg, mid]
",
            ),
        ]);

        let binding = load(&dir, "top.yaml").unwrap();
        assert!(!binding.prop2specs.contains_key("reg"));
        assert!(!binding.prop2specs.contains_key("mid"));
        assert!(binding.prop2specs.contains_key("status"));
    }

    #[test]
    fn filter_child_binding_properties() {
        let dir = write_bindings(&[
            (
                "parent.yaml",
                "
child-binding:
  properties:
    keep:
      type: int
    drop:
      type: int
",
            ),
            (
                "top.yaml",
                "
description: top
compatible: vnd,top
include:
  - name: parent.yaml
    child-binding:
      property-allowlist: [keep]
",
            ),
        ]);

        let binding = load(&dir, "top.yaml").unwrap();
        let child = binding.child_binding.as_ref().unwrap();
        assert!(child.prop2specs.contains_key("keep"));
        assert!(!child.prop2specs.contains_key("drop"));
    }

    #[test]
    fn tightening_is_allowed() {
        let dir = write_bindings(&[
            ("base.yaml", BASE),
            (
                "dev.yaml",
                "
description: dev
compatible: vnd,dev
include: base.yaml
properties:
  label:
    default: foo
  reg:
    description: Overridden
",
            ),
        ]);

        let binding = load(&dir, "dev.yaml").unwrap();
        assert_eq!(
            binding.prop2specs["label"].default,
            Some(Literal::Str("foo".into()))
        );
        assert_eq!(
            binding.prop2specs["reg"].description.as_deref(),
            Some("Overridden")
        );
    }

    #[test]
    fn weakening_is_rejected() {
        const FIXED: &str = "
description: fixed values
properties:
  cells:
    type: int
    const: 5
  speed:
    type: int
    default: 1
";
        for (base, props, key) in [
            (BASE, "  reg:\n    type: int\n", "'type'"),
            (BASE, "  status:\n    enum: [okay]\n", "'enum'"),
            (BASE, "  clock-frequency:\n    required: false\n", "'required'"),
            (FIXED, "  cells:\n    const: 6\n", "'const'"),
            (FIXED, "  speed:\n    default: 2\n", "'default'"),
        ] {
            let dev = format!("description: d\ncompatible: vnd,d\ninclude: base.yaml\nproperties:\n{props}");
            let dir = write_bindings(&[("base.yaml", base), ("dev.yaml", &dev)]);
            assert_matches!(
                load(&dir, "dev.yaml"),
                Err(Error::Invalid(msg)) if msg.contains(key) && msg.contains("from included file overwritten"),
                "{props}"
            );
        }
    }

    #[test]
    fn reject_malformed_includes() {
        for (include, exp) in [
            ("include: missing.yaml", "'missing.yaml' not found"),
            ("include: 3", "should be a string or list, but has type int"),
            ("include: [3]", "all elements in 'include:'"),
            ("include: [{property-allowlist: [x]}]", "should have a 'name' key"),
            (
                "include: [{name: base.yaml, property-allowlist: [x], property-blocklist: [y]}]",
                "should not specify both 'property-allowlist:' and 'property-blocklist:'",
            ),
            ("include: [{name: base.yaml, foo: bar}]", "unexpected contents: {foo: bar}"),
            ("include: [{name: base.yaml, property-allowlist: x}]", "should be a list"),
        ] {
            let dev = format!("description: d\ncompatible: vnd,d\n{include}\n");
            let dir = write_bindings(&[("base.yaml", BASE), ("dev.yaml", &dev)]);
            assert_matches!(
                load(&dir, "dev.yaml"),
                Err(Error::Invalid(msg)) if msg.contains(exp),
                "{include}"
            );
        }
    }
}
