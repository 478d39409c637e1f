//! YAML binding files.
//!
//! A binding describes the properties a node with a given `compatible` may
//! have, the names of its specifier cells, and which bus it provides or sits
//! on. Bindings may `include:` other binding files; included property
//! definitions can be extended but never weakened.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

mod check;
mod include;

use include::Builder;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed binding, or a conflict between a binding and a file it
    /// includes. The message names the offending file and property.
    #[error("{0}")]
    Invalid(String),

    #[error("'{}' appears in binding directories but isn't valid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn err<T>(msg: impl Into<String>) -> Result<T, Error> {
    Err(Error::Invalid(msg.into()))
}

/// Property types a binding can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropType {
    Boolean,
    Int,
    Array,
    Uint8Array,
    String,
    StringArray,
    Phandle,
    Phandles,
    PhandleArray,
    Path,
    Compound,
}

impl PropType {
    pub const ALL: [PropType; 11] = [
        PropType::Boolean,
        PropType::Int,
        PropType::Array,
        PropType::Uint8Array,
        PropType::String,
        PropType::StringArray,
        PropType::Phandle,
        PropType::Phandles,
        PropType::PhandleArray,
        PropType::Path,
        PropType::Compound,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PropType::Boolean => "boolean",
            PropType::Int => "int",
            PropType::Array => "array",
            PropType::Uint8Array => "uint8-array",
            PropType::String => "string",
            PropType::StringArray => "string-array",
            PropType::Phandle => "phandle",
            PropType::Phandles => "phandles",
            PropType::PhandleArray => "phandle-array",
            PropType::Path => "path",
            PropType::Compound => "compound",
        }
    }
}

impl FromStr for PropType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `const:`, `default:` or `enum:` value from a binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Str(String),
    Ints(Vec<i64>),
    Strs(Vec<String>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Str(s) => write!(f, "'{s}'"),
            Literal::Ints(v) => write!(f, "{v:?}"),
            Literal::Strs(v) => write!(f, "{v:?}"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSpec {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    required: bool,
    #[serde(rename = "enum")]
    enum_values: Option<Vec<Literal>>,
    #[serde(rename = "const")]
    const_value: Option<Literal>,
    default: Option<Literal>,
    description: Option<String>,
    #[serde(default)]
    deprecated: bool,
    specifier_space: Option<String>,
}

/// How a binding describes one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    pub name: String,
    /// The binding file that last modified this property.
    pub path: Option<PathBuf>,
    pub ty: PropType,
    pub description: Option<String>,
    pub enum_values: Option<Vec<Literal>>,
    pub const_value: Option<Literal>,
    pub default: Option<Literal>,
    pub required: bool,
    pub deprecated: bool,
    pub specifier_space: Option<String>,
}

impl PropertySpec {
    pub(crate) fn from_raw(name: &str, path: Option<&Path>, raw: &Value) -> Result<Self, Error> {
        let where_ = path.map_or_else(|| "<inferred>".into(), |p| p.display().to_string());
        let raw: RawSpec = serde_yaml::from_value(raw.clone()).map_err(|e| {
            Error::Invalid(format!("malformed 'properties: {name}' in {where_}: {e}"))
        })?;
        let ty = raw.ty.parse().or_else(|_| {
            err(format!(
                "'{name}' in 'properties:' in {where_} has unknown type '{}'",
                raw.ty
            ))
        })?;

        Ok(Self {
            name: name.to_owned(),
            path: path.map(Path::to_path_buf),
            ty,
            description: raw.description,
            enum_values: raw.enum_values,
            const_value: raw.const_value,
            default: raw.default,
            required: raw.required,
            deprecated: raw.deprecated,
            specifier_space: raw.specifier_space,
        })
    }

    /// Builds a spec of the given type that lives in no binding file.
    pub(crate) fn inferred(name: &str, ty: PropType) -> Self {
        Self {
            name: name.to_owned(),
            path: None,
            ty,
            description: None,
            enum_values: None,
            const_value: None,
            default: None,
            required: false,
            deprecated: false,
            specifier_space: None,
        }
    }

    fn enum_tokens(&self) -> Option<Vec<String>> {
        if self.ty != PropType::String {
            return None;
        }
        self.enum_values
            .as_ref()?
            .iter()
            .map(|v| match v {
                Literal::Str(s) => Some(str_as_token(s)),
                _ => None,
            })
            .collect()
    }

    /// True if this is a string property with an enum whose values stay
    /// unique after turning non-word characters into underscores.
    pub fn enum_tokenizable(&self) -> bool {
        match self.enum_tokens() {
            Some(tokens) => tokens.iter().collect::<HashSet<_>>().len() == tokens.len(),
            None => false,
        }
    }

    /// Like [`PropertySpec::enum_tokenizable`], but the tokens must also
    /// stay unique when uppercased.
    pub fn enum_upper_tokenizable(&self) -> bool {
        if !self.enum_tokenizable() {
            return false;
        }
        let tokens = self.enum_tokens().unwrap_or_default();
        tokens
            .iter()
            .map(|t| t.to_uppercase())
            .collect::<HashSet<_>>()
            .len()
            == tokens.len()
    }

    /// The specifier space used for a phandle-array, e.g. `gpio` for
    /// `cs-gpios` and `pwm` for `pwms`.
    pub fn specifier_space(&self) -> String {
        match &self.specifier_space {
            Some(space) => space.clone(),
            None if self.name.ends_with("gpios") => "gpio".to_owned(),
            None => self.name.strip_suffix('s').unwrap_or(&self.name).to_owned(),
        }
    }
}

/// Replaces every character that can't appear in a C identifier with `_`.
pub fn str_as_token(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A parsed binding, with all of its includes merged in.
#[derive(Debug, Clone)]
pub struct Binding {
    pub path: Option<PathBuf>,
    pub compatible: Option<String>,
    pub description: Option<String>,
    /// Buses nodes with this binding provide (`bus:`).
    pub buses: Vec<String>,
    /// The bus nodes with this binding sit on (`on-bus:`).
    pub on_bus: Option<String>,
    pub prop2specs: IndexMap<String, PropertySpec>,
    /// Cell names per specifier space, from `<space>-cells:` keys.
    pub specifier2cells: IndexMap<String, Vec<String>>,
    pub child_binding: Option<Arc<Binding>>,
    /// The merged YAML contents.
    pub raw: Mapping,
}

impl Binding {
    /// Loads the binding at `path`. `fname2path` maps file names that may
    /// appear in `include:` to their location.
    pub fn from_path(path: &Path, fname2path: &HashMap<String, PathBuf>) -> Result<Self, Error> {
        let raw = read_mapping(path)?;
        Self::new(Some(path), fname2path, raw, true, true, Filter::default())
    }

    pub(crate) fn new(
        path: Option<&Path>,
        fname2path: &HashMap<String, PathBuf>,
        raw: Mapping,
        require_compatible: bool,
        require_description: bool,
        filter: Filter,
    ) -> Result<Self, Error> {
        let modified: Vec<String> = match raw.get("properties") {
            Some(Value::Mapping(props)) => props
                .keys()
                .filter_map(|k| k.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        };

        let mut builder = Builder::new(fname2path, filter);
        let raw = builder.merge_includes(raw, path)?;
        let mut prop2specs = builder.into_specs();

        let where_ = display_path(path);
        let child_binding = match raw.get("child-binding") {
            Some(Value::Mapping(child)) => Some(Arc::new(Binding::new(
                path,
                fname2path,
                child.clone(),
                false,
                false,
                Filter::default(),
            )?)),
            Some(_) => {
                return err(format!(
                    "malformed 'child-binding:' in {where_}, expected a binding (dictionary with keys/values)"
                ))
            }
            None => None,
        };

        check::check_binding(&raw, &where_, require_compatible, require_description)?;

        if let Some(Value::Mapping(props)) = raw.get("properties") {
            for name in modified {
                if let Some(options) = props.get(name.as_str()) {
                    let spec = PropertySpec::from_raw(&name, path, options)?;
                    prop2specs.insert(name, spec);
                }
            }
        }

        let mut specifier2cells = IndexMap::new();
        for (key, val) in &raw {
            let Some(space) = key.as_str().and_then(|k| k.strip_suffix("-cells")) else {
                continue;
            };
            specifier2cells.insert(space.to_owned(), string_list(val).unwrap_or_default());
        }

        let buses = match raw.get("bus") {
            Some(Value::String(bus)) => vec![bus.clone()],
            Some(val) => string_list(val).unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            path: path.map(Path::to_path_buf),
            compatible: raw.get("compatible").and_then(Value::as_str).map(str::to_owned),
            description: raw.get("description").and_then(Value::as_str).map(str::to_owned),
            buses,
            on_bus: raw.get("on-bus").and_then(Value::as_str).map(str::to_owned),
            prop2specs,
            specifier2cells,
            child_binding,
            raw,
        })
    }

    /// A binding holding only the given property specs.
    pub(crate) fn from_specs(specs: IndexMap<String, PropertySpec>) -> Self {
        Self {
            path: None,
            compatible: None,
            description: None,
            buses: Vec::new(),
            on_bus: None,
            prop2specs: specs,
            specifier2cells: IndexMap::new(),
            child_binding: None,
            raw: Mapping::new(),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        write!(f, "<Binding {name}")?;
        if let Some(compat) = &self.compatible {
            write!(f, " for compatible '{compat}'")?;
        }
        f.write_str(">")
    }
}

/// Property filters from an `include:` entry, applied to the included file
/// and everything it includes in turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct Filter {
    pub allow: Option<Vec<String>>,
    pub block: Option<Vec<String>>,
    /// Filters for the properties of `child-binding:`.
    pub child: Option<Box<Filter>>,
}

/// All bindings found in a set of directories, keyed by
/// `(compatible, on-bus)`.
#[derive(Debug, Default)]
pub struct Bindings {
    pub dirs: Vec<PathBuf>,
    by_compat: IndexMap<(String, Option<String>), Arc<Binding>>,
}

impl Bindings {
    /// Loads the bindings under `dirs`. With `compats`, files whose
    /// `compatible:` is not in the set are skipped.
    pub fn load(dirs: &[PathBuf], compats: Option<&HashSet<String>>) -> Result<Self, Error> {
        let paths = binding_paths(dirs)?;
        let fname2path: HashMap<String, PathBuf> = paths
            .iter()
            .filter_map(|p| Some((p.file_name()?.to_string_lossy().into_owned(), p.clone())))
            .collect();

        let mut bindings = Bindings {
            dirs: dirs.to_vec(),
            by_compat: IndexMap::new(),
        };

        for path in &paths {
            let text = fs::read_to_string(path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            if let Some(compats) = compats {
                if !compats.iter().any(|c| text.contains(c.as_str())) {
                    continue;
                }
            }

            let raw: Value = serde_yaml::from_str(&text).map_err(|source| Error::Yaml {
                path: path.clone(),
                source,
            })?;
            let Value::Mapping(raw) = raw else {
                continue;
            };
            let Some(compat) = raw.get("compatible").and_then(Value::as_str) else {
                continue;
            };
            if compats.is_some_and(|c| !c.contains(compat)) {
                continue;
            }

            trace!("loading binding {}", path.display());
            let binding = Binding::new(Some(path), &fname2path, raw, true, true, Filter::default())?;

            let mut next = Some(Arc::new(binding));
            while let Some(binding) = next {
                next = binding.child_binding.clone();
                if binding.compatible.is_some() {
                    bindings.register(binding)?;
                }
            }
        }

        debug!(
            "loaded {} bindings from {} files",
            bindings.by_compat.len(),
            paths.len()
        );
        Ok(bindings)
    }

    fn register(&mut self, binding: Arc<Binding>) -> Result<(), Error> {
        let Some(compat) = binding.compatible.clone() else {
            return Ok(());
        };
        let key = (compat, binding.on_bus.clone());

        if let Some(old) = self.by_compat.get(&key) {
            if old.path == binding.path {
                return Ok(());
            }
            let mut msg = format!(
                "both {} and {} have 'compatible: {}'",
                display_path(old.path.as_deref()),
                display_path(binding.path.as_deref()),
                key.0
            );
            if let Some(bus) = &key.1 {
                msg.push_str(&format!(" and 'on-bus: {bus}'"));
            }
            return err(msg);
        }
        self.by_compat.insert(key, binding);
        Ok(())
    }

    /// The binding for `compat` on `bus`, if any.
    pub fn get(&self, compat: &str, bus: Option<&str>) -> Option<&Arc<Binding>> {
        self.by_compat
            .get(&(compat.to_owned(), bus.map(str::to_owned)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.by_compat.values()
    }

    pub fn len(&self) -> usize {
        self.by_compat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_compat.is_empty()
    }
}

/// Returns every `.yaml`/`.yml` file below `dirs`, sorted within each
/// directory.
pub fn binding_paths(dirs: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
        let io_err = |source| Error::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir)
            .map_err(io_err)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                walk(&path, out)?;
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            ) {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    for dir in dirs {
        walk(dir, &mut out)?;
    }
    Ok(out)
}

pub(crate) fn read_mapping(path: &Path) -> Result<Mapping, Error> {
    let text = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_yaml::from_str(&text) {
        Ok(Value::Mapping(map)) => Ok(map),
        Ok(_) => err(format!(
            "{}: invalid contents, expected a mapping",
            path.display()
        )),
        Err(source) => Err(Error::Yaml {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn display_path(path: Option<&Path>) -> String {
    path.map_or_else(|| "<no file>".to_owned(), |p| p.display().to_string())
}

/// Converts a YAML sequence of strings.
pub(crate) fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_sequence()?
        .iter()
        .map(|v| v.as_str().map(str::to_owned))
        .collect()
}

/// Renders a YAML value on one line, for diagnostics.
pub(crate) fn show(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(seq) => {
            let items: Vec<String> = seq.iter().map(show).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Mapping(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", show(k), show(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Value::Tagged(tagged) => format!("{} {}", tagged.tag, show(&tagged.value)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use rstest::rstest;
    use tempfile::TempDir;

    pub(crate) fn write_bindings(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, text) in files {
            fs::write(dir.path().join(name), text).unwrap();
        }
        dir
    }

    pub(crate) fn load(dir: &TempDir, name: &str) -> Result<Binding, Error> {
        let paths = binding_paths(&[dir.path().to_path_buf()]).unwrap();
        let fname2path = paths
            .iter()
            .map(|p| (p.file_name().unwrap().to_string_lossy().into_owned(), p.clone()))
            .collect();
        Binding::from_path(&dir.path().join(name), &fname2path)
    }

    #[test]
    fn load_simple_binding() {
        let dir = write_bindings(&[(
            "uart.yaml",
            "
description: A UART
compatible: vnd,uart
on-bus: apb
gpio-cells: [pin, flags]
properties:
  current-speed:
    type: int
    required: true
    enum: [9600, 115200]
  mode:
    type: string
    default: fast
  cs-gpios:
    type: phandle-array
",
        )]);

        let binding = load(&dir, "uart.yaml").unwrap();
        assert_eq!(binding.compatible.as_deref(), Some("vnd,uart"));
        assert_eq!(binding.on_bus.as_deref(), Some("apb"));
        assert_eq!(binding.specifier2cells["gpio"], ["pin", "flags"]);

        let speed = &binding.prop2specs["current-speed"];
        assert_eq!(speed.ty, PropType::Int);
        assert!(speed.required);
        assert_eq!(
            speed.enum_values,
            Some(vec![Literal::Int(9600), Literal::Int(115200)])
        );
        assert_eq!(
            binding.prop2specs["mode"].default,
            Some(Literal::Str("fast".into()))
        );
        assert_eq!(binding.prop2specs["cs-gpios"].specifier_space(), "gpio");
        assert_eq!(binding.to_string(), "<Binding uart.yaml for compatible 'vnd,uart'>");
    }

    #[rstest]
    #[case(&["a", "b"], true, true)]
    #[case(&["a b", "a_b"], false, false)]
    #[case(&["foo", "FOO"], true, false)]
    fn tokenizable_enums(#[case] values: &[&str], #[case] lower: bool, #[case] upper: bool) {
        let mut spec = PropertySpec::inferred("p", PropType::String);
        spec.enum_values = Some(values.iter().map(|v| Literal::Str(v.to_string())).collect());
        assert_eq!(spec.enum_tokenizable(), lower);
        assert_eq!(spec.enum_upper_tokenizable(), upper);
    }

    #[test]
    fn int_enums_are_not_tokenizable() {
        let mut spec = PropertySpec::inferred("p", PropType::Int);
        spec.enum_values = Some(vec![Literal::Int(1)]);
        assert!(!spec.enum_tokenizable());
    }

    #[test]
    fn specifier_spaces() {
        for (name, exp) in [
            ("gpios", "gpio"),
            ("cs-gpios", "gpio"),
            ("pwms", "pwm"),
            ("io-channels", "io-channel"),
        ] {
            let spec = PropertySpec::inferred(name, PropType::PhandleArray);
            assert_eq!(spec.specifier_space(), exp, "{name}");
        }
    }

    #[test]
    fn index_by_compatible_and_bus() {
        let dir = write_bindings(&[
            (
                "i2c-dev.yaml",
                "description: d\ncompatible: vnd,dev\non-bus: i2c\n",
            ),
            (
                "spi-dev.yaml",
                "description: d\ncompatible: vnd,dev\non-bus: spi\n",
            ),
            ("other.yaml", "description: d\ncompatible: vnd,other\n"),
            ("fragment.yaml", "properties:\n  x:\n    type: int\n"),
        ]);

        let compats: HashSet<String> = ["vnd,dev".to_owned()].into();
        let bindings = Bindings::load(&[dir.path().to_path_buf()], Some(&compats)).unwrap();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.get("vnd,dev", Some("i2c")).is_some());
        assert!(bindings.get("vnd,dev", Some("spi")).is_some());
        assert!(bindings.get("vnd,dev", None).is_none());
        assert!(bindings.get("vnd,other", None).is_none());

        let all = Bindings::load(&[dir.path().to_path_buf()], None).unwrap();
        assert!(all.get("vnd,other", None).is_some());
    }

    #[test]
    fn reject_duplicate_compatibles() {
        let dir = write_bindings(&[
            ("a.yaml", "description: d\ncompatible: vnd,dup\n"),
            ("b.yaml", "description: e\ncompatible: vnd,dup\n"),
        ]);
        assert_matches!(
            Bindings::load(&[dir.path().to_path_buf()], None),
            Err(Error::Invalid(msg)) if msg.starts_with("both ") && msg.ends_with("have 'compatible: vnd,dup'")
        );
    }

    #[test]
    fn register_child_binding_compatibles() {
        let dir = write_bindings(&[(
            "parent.yaml",
            "
description: parent
compatible: vnd,parent
child-binding:
  compatible: vnd,child
  properties:
    reg:
      type: array
",
        )]);

        let bindings = Bindings::load(&[dir.path().to_path_buf()], None).unwrap();
        let child = bindings.get("vnd,child", None).unwrap();
        assert_eq!(child.prop2specs["reg"].ty, PropType::Array);
        let parent = bindings.get("vnd,parent", None).unwrap();
        assert!(parent.child_binding.is_some());
    }

    #[test]
    fn reject_invalid_yaml() {
        let dir = write_bindings(&[("bad.yaml", "compatible: [unclosed\n")]);
        assert_matches!(
            Bindings::load(&[dir.path().to_path_buf()], None),
            Err(Error::Yaml { .. })
        );
    }
}
