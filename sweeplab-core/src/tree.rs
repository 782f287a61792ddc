//! Immutable configuration tree with dotted-path access.
//!
//! Branches are reference counted, so an override copies only the spine from
//! the root to the changed leaf and shares every untouched namespace with the
//! tree it was derived from. Trees are never mutated in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ConfigError, SchemaError};
use crate::path::{validate_segment, ConfigPath};
use crate::value::Value;

type Branch = BTreeMap<String, Node>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Leaf(Value),
    Branch(Arc<Branch>),
}

/// A nested configuration whose leaves are addressed by [`ConfigPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConfigTree {
    root: Arc<Branch>,
}

impl ConfigTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a tree from `(path, value)` leaves. Used for programmatic bases
    /// and tests; a path that collides with an existing leaf or namespace is a
    /// schema error.
    pub fn from_leaves<I, P>(leaves: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (P, Value)>,
        P: AsRef<str>,
    {
        let mut root = Branch::new();
        for (path, value) in leaves {
            let path = ConfigPath::parse(path.as_ref())?;
            insert_leaf(&mut root, path.segments(), value, &path)?;
        }
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Load a YAML (`.yaml`, `.yml`) or TOML (`.toml`) document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let tree = match ext.as_str() {
            "yaml" | "yml" => {
                let doc: serde_yaml::Value =
                    serde_yaml::from_str(&text).map_err(|e| ConfigError::Yaml {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                Self::from_yaml_value(&doc)
            }
            "toml" => {
                let doc: toml::Table = text.parse().map_err(|e: toml::de::Error| {
                    ConfigError::Toml {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    }
                })?;
                Self::from_toml_table(&doc)
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        tree.map_err(|source| ConfigError::Schema {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaError> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| SchemaError::MalformedDocument(e.to_string()))?;
        Self::from_yaml_value(&doc)
    }

    pub fn from_yaml_value(doc: &serde_yaml::Value) -> Result<Self, SchemaError> {
        match doc {
            serde_yaml::Value::Null => Ok(Self::empty()),
            serde_yaml::Value::Mapping(map) => Ok(Self {
                root: Arc::new(yaml_branch(map, &[])?),
            }),
            other => Err(SchemaError::MalformedDocument(format!(
                "top level must be a mapping, found {}",
                yaml_kind(other)
            ))),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SchemaError> {
        let doc: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| SchemaError::MalformedDocument(e.to_string()))?;
        Self::from_toml_table(&doc)
    }

    pub fn from_toml_table(doc: &toml::Table) -> Result<Self, SchemaError> {
        Ok(Self {
            root: Arc::new(toml_branch(doc, &[])?),
        })
    }

    /// Leaf value at `path`, or `None` if absent or a namespace.
    pub fn get(&self, path: &ConfigPath) -> Option<&Value> {
        match self.node(path)? {
            Node::Leaf(value) => Some(value),
            Node::Branch(_) => None,
        }
    }

    /// Convenience lookup by dotted string; malformed paths are absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        ConfigPath::parse(path).ok().and_then(|p| self.get(&p))
    }

    /// True if `path` names a leaf.
    pub fn contains(&self, path: &ConfigPath) -> bool {
        self.get(path).is_some()
    }

    /// True if `path` names a namespace.
    pub fn is_namespace(&self, path: &ConfigPath) -> bool {
        matches!(self.node(path), Some(Node::Branch(_)))
    }

    /// The namespace at `path` as its own tree, sharing structure with `self`.
    pub fn subtree(&self, path: &ConfigPath) -> Option<ConfigTree> {
        match self.node(path)? {
            Node::Branch(branch) => Some(ConfigTree {
                root: Arc::clone(branch),
            }),
            Node::Leaf(_) => None,
        }
    }

    fn node(&self, path: &ConfigPath) -> Option<&Node> {
        let (first, rest) = path.segments().split_first()?;
        let mut node = self.root.get(first)?;
        for segment in rest {
            match node {
                Node::Branch(branch) => node = branch.get(segment)?,
                Node::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    /// Derive a new tree with the leaf at `path` replaced. The path must
    /// already exist as a leaf; `self` is left untouched either way.
    pub fn with_override(&self, path: &ConfigPath, value: Value) -> Result<ConfigTree, SchemaError> {
        let root = replace_leaf(&self.root, path.segments(), value, path)?;
        Ok(ConfigTree {
            root: Arc::new(root),
        })
    }

    /// Apply several overrides at once. Fails without producing a partial tree.
    pub fn merge<I>(&self, overrides: I) -> Result<ConfigTree, SchemaError>
    where
        I: IntoIterator<Item = (ConfigPath, Value)>,
    {
        overrides
            .into_iter()
            .try_fold(self.clone(), |tree, (path, value)| {
                tree.with_override(&path, value)
            })
    }

    /// Every leaf, sorted by path segments.
    pub fn flatten(&self) -> Vec<(ConfigPath, &Value)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        flatten_into(&self.root, &mut prefix, &mut out);
        out
    }

    pub fn leaf_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Content hash of the resolved configuration (BLAKE3 over the typed,
    /// flattened form). Equal trees always share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (path, value) in self.flatten() {
            hasher.update(format!("{path}={}\n", typed_repr(value)).as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Nested YAML representation of the tree.
    pub fn to_yaml_value(&self) -> serde_yaml::Value {
        serde_yaml::Value::Mapping(branch_to_yaml(&self.root))
    }

    pub fn to_yaml_string(&self) -> Result<String, SchemaError> {
        serde_yaml::to_string(&self.to_yaml_value())
            .map_err(|e| SchemaError::MalformedDocument(e.to_string()))
    }

    /// Write the tree as a YAML document.
    pub fn write_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.to_yaml_string().map_err(|source| ConfigError::Schema {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Parse a command-line override `path=value`. The value is read as a YAML
/// scalar or flow list, so `lr=0.01`, `name=adamw` and `seeds=[1,2]` all work.
pub fn parse_override(text: &str) -> Result<(ConfigPath, Value), SchemaError> {
    let (path, raw) = text
        .split_once('=')
        .ok_or_else(|| SchemaError::MalformedPath {
            path: text.to_string(),
            reason: "expected path=value".into(),
        })?;
    let path = ConfigPath::parse(path.trim())?;
    let doc: serde_yaml::Value = serde_yaml::from_str(raw.trim())
        .map_err(|e| SchemaError::MalformedDocument(e.to_string()))?;
    let value = yaml_leaf(&doc, &path)?;
    Ok((path, value))
}

fn insert_leaf(
    branch: &mut Branch,
    segments: &[String],
    value: Value,
    full: &ConfigPath,
) -> Result<(), SchemaError> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        if branch.contains_key(head) {
            return Err(SchemaError::MalformedDocument(format!(
                "'{full}' is defined more than once"
            )));
        }
        branch.insert(head.clone(), Node::Leaf(value));
        return Ok(());
    }
    let entry = branch
        .entry(head.clone())
        .or_insert_with(|| Node::Branch(Arc::new(Branch::new())));
    match entry {
        Node::Branch(sub) => insert_leaf(Arc::make_mut(sub), rest, value, full),
        Node::Leaf(_) => Err(SchemaError::MalformedDocument(format!(
            "'{full}' descends into a leaf"
        ))),
    }
}

fn replace_leaf(
    branch: &Branch,
    segments: &[String],
    value: Value,
    full: &ConfigPath,
) -> Result<Branch, SchemaError> {
    let unknown = || SchemaError::UnknownPath {
        path: full.to_string(),
    };
    let (head, rest) = segments.split_first().ok_or_else(unknown)?;
    let replacement = match (branch.get(head).ok_or_else(unknown)?, rest.is_empty()) {
        (Node::Leaf(_), true) => Node::Leaf(value),
        (Node::Leaf(_), false) => return Err(unknown()),
        (Node::Branch(_), true) => {
            return Err(SchemaError::NotALeaf {
                path: full.to_string(),
            })
        }
        (Node::Branch(sub), false) => Node::Branch(Arc::new(replace_leaf(sub, rest, value, full)?)),
    };
    let mut next = branch.clone();
    next.insert(head.clone(), replacement);
    Ok(next)
}

fn flatten_into<'a>(
    branch: &'a Branch,
    prefix: &mut Vec<String>,
    out: &mut Vec<(ConfigPath, &'a Value)>,
) {
    for (key, node) in branch {
        prefix.push(key.clone());
        match node {
            Node::Leaf(value) => out.push((ConfigPath::from_trusted(prefix.clone()), value)),
            Node::Branch(sub) => flatten_into(sub, prefix, out),
        }
        prefix.pop();
    }
}

fn typed_repr(value: &Value) -> String {
    match value {
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(typed_repr).collect();
            format!("list:[{}]", inner.join(","))
        }
        other => format!("{}:{other}", other.type_name()),
    }
}

fn location(prefix: &[String], key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{key}", prefix.join("."))
    }
}

fn checked_key(prefix: &[String], key: &str) -> Result<String, SchemaError> {
    validate_segment(key).map_err(|reason| SchemaError::MalformedPath {
        path: location(prefix, key),
        reason,
    })?;
    Ok(key.to_string())
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

fn yaml_branch(map: &serde_yaml::Mapping, prefix: &[String]) -> Result<Branch, SchemaError> {
    let mut branch = Branch::new();
    for (key, value) in map {
        let key = match key {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            other => {
                return Err(SchemaError::MalformedDocument(format!(
                    "unsupported {} key under '{}'",
                    yaml_kind(other),
                    prefix.join(".")
                )))
            }
        };
        let key = checked_key(prefix, &key)?;
        let node = match value {
            serde_yaml::Value::Mapping(sub) => {
                let mut child = prefix.to_vec();
                child.push(key.clone());
                Node::Branch(Arc::new(yaml_branch(sub, &child)?))
            }
            other => {
                let path = ConfigPath::from_trusted(
                    prefix.iter().cloned().chain([key.clone()]).collect(),
                );
                Node::Leaf(yaml_leaf(other, &path)?)
            }
        };
        branch.insert(key, node);
    }
    Ok(branch)
}

fn yaml_leaf(value: &serde_yaml::Value, path: &ConfigPath) -> Result<Value, SchemaError> {
    match value {
        serde_yaml::Value::Sequence(items) => items
            .iter()
            .map(|item| yaml_scalar(item, path))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        other => yaml_scalar(other, path),
    }
}

fn yaml_scalar(value: &serde_yaml::Value, path: &ConfigPath) -> Result<Value, SchemaError> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::from_text(s)),
        other => Err(SchemaError::InvalidValue {
            path: path.to_string(),
            expected: "a scalar or a list of scalars".into(),
            found: yaml_kind(other).into(),
        }),
    }
}

fn toml_branch(table: &toml::Table, prefix: &[String]) -> Result<Branch, SchemaError> {
    let mut branch = Branch::new();
    for (key, value) in table {
        let key = checked_key(prefix, key)?;
        let node = match value {
            toml::Value::Table(sub) => {
                let mut child = prefix.to_vec();
                child.push(key.clone());
                Node::Branch(Arc::new(toml_branch(sub, &child)?))
            }
            toml::Value::Array(items) => {
                let path = location(prefix, &key);
                Node::Leaf(Value::List(
                    items
                        .iter()
                        .map(|item| toml_scalar(item, &path))
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
            other => Node::Leaf(toml_scalar(other, &location(prefix, &key))?),
        };
        branch.insert(key, node);
    }
    Ok(branch)
}

fn toml_scalar(value: &toml::Value, path: &str) -> Result<Value, SchemaError> {
    match value {
        toml::Value::String(s) => Ok(Value::from_text(s)),
        toml::Value::Integer(i) => Ok(Value::Int(*i)),
        toml::Value::Float(f) => Ok(Value::Float(*f)),
        toml::Value::Boolean(b) => Ok(Value::Bool(*b)),
        toml::Value::Datetime(dt) => Ok(Value::Str(dt.to_string())),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(SchemaError::InvalidValue {
            path: path.to_string(),
            expected: "a scalar".into(),
            found: value.type_str().into(),
        }),
    }
}

fn branch_to_yaml(branch: &Branch) -> serde_yaml::Mapping {
    let mut map = serde_yaml::Mapping::new();
    for (key, node) in branch {
        let value = match node {
            Node::Leaf(value) => value_to_yaml(value),
            Node::Branch(sub) => serde_yaml::Value::Mapping(branch_to_yaml(sub)),
        };
        map.insert(serde_yaml::Value::String(key.clone()), value);
    }
    map
}

fn value_to_yaml(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Int(i) => serde_yaml::Value::Number((*i).into()),
        Value::Float(f) => serde_yaml::Value::Number((*f).into()),
        Value::Str(s) => serde_yaml::Value::String(s.clone()),
        Value::Duration(_) | Value::Size(_) => serde_yaml::Value::String(value.to_string()),
        Value::List(items) => serde_yaml::Value::Sequence(items.iter().map(value_to_yaml).collect()),
    }
}
