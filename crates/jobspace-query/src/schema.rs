//! Schema detection over heterogeneous parameter documents.
//!
//! A schema is an ephemeral, derived mapping from key-path to the set of
//! `(type, value)` pairs observed across a job subset. Mappings are
//! flattened recursively; sequences are leaf values. Key-paths that are
//! constant over the whole subset (exactly one distinct observation) are
//! included by default and excludable on request.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use jobspace_doc::canonical_string;
use serde_json::Value;

/// An ordered sequence of mapping keys from the document root to a leaf.
pub type KeyPath = Vec<String>;

/// The leaf value types a schema distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
}

impl ValueType {
    /// The type of a leaf value. Mappings are not leaves (they are
    /// flattened away), so they have no schema type. Integral floats
    /// count as `Int`, consistent with the canonical encoding that
    /// defines job identity (a manifest stores `1.0` as `1`).
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Int),
            Value::Number(n) => {
                let integral = n.as_f64().is_some_and(|f| {
                    f.is_finite()
                        && f.fract() == 0.0
                        && f >= i64::MIN as f64
                        && f <= u64::MAX as f64
                });
                Some(if integral { Self::Int } else { Self::Float })
            }
            Value::String(_) => Some(Self::Str),
            Value::Array(_) => Some(Self::List),
            Value::Object(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// One observed `(type, value)` pair. Ordered by type, then by the
/// value's canonical encoding, so observation sets are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypedValue {
    type_tag: ValueType,
    repr: String,
}

impl TypedValue {
    pub fn of(value: &Value) -> Option<Self> {
        let type_tag = ValueType::of(value)?;
        // Canonical encoding normalizes `1.0` to `1`, keeping observation
        // sets consistent with job-id semantics. Values held by a parsed
        // document always have a canonical form.
        let repr = canonical_string(value).unwrap_or_else(|_| value.to_string());
        Some(Self { type_tag, repr })
    }

    pub fn type_tag(&self) -> ValueType {
        self.type_tag
    }

    /// The canonical encoding of the observed value.
    pub fn repr(&self) -> &str {
        &self.repr
    }

    /// A human-oriented label: strings lose their quotes, everything else
    /// renders as its canonical encoding. Used for view path segments.
    pub fn label(&self) -> String {
        if self.type_tag == ValueType::Str {
            if let Ok(Value::String(s)) = serde_json::from_str::<Value>(&self.repr) {
                return s;
            }
        }
        self.repr.clone()
    }
}

/// Flatten a document into `(key-path, leaf value)` pairs. Mappings
/// recurse; sequences and scalars are leaves. An empty mapping yields no
/// leaves.
pub fn flatten(doc: &Value) -> Vec<(KeyPath, &Value)> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    walk(&mut prefix, doc, &mut out);
    out
}

fn walk<'a>(prefix: &mut KeyPath, value: &'a Value, out: &mut Vec<(KeyPath, &'a Value)>) {
    match value.as_object() {
        Some(map) => {
            for (key, child) in map {
                prefix.push(key.clone());
                walk(prefix, child, out);
                prefix.pop();
            }
        }
        None => {
            if !prefix.is_empty() {
                out.push((prefix.clone(), value));
            }
        }
    }
}

/// The detected schema of a job subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSchema {
    keys: BTreeMap<KeyPath, BTreeSet<TypedValue>>,
}

impl ProjectSchema {
    /// Accumulate the schema of `docs`. With `exclude_const`, key-paths
    /// with exactly one distinct observation over the subset are dropped.
    pub fn detect<'a, I>(docs: I, exclude_const: bool) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut keys: BTreeMap<KeyPath, BTreeSet<TypedValue>> = BTreeMap::new();
        for doc in docs {
            for (path, value) in flatten(doc) {
                if let Some(observed) = TypedValue::of(value) {
                    keys.entry(path).or_default().insert(observed);
                }
            }
        }
        if exclude_const {
            keys.retain(|_, observed| observed.len() > 1);
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Membership by dotted key path.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Membership by key-path segments.
    pub fn contains_segments<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        self.get_segments(segments).is_some()
    }

    /// The observation set for a dotted key path.
    pub fn get(&self, path: &str) -> Option<&BTreeSet<TypedValue>> {
        let segments: KeyPath = path.split('.').map(str::to_owned).collect();
        self.keys.get(&segments)
    }

    pub fn get_segments<S: AsRef<str>>(&self, segments: &[S]) -> Option<&BTreeSet<TypedValue>> {
        let segments: KeyPath = segments.iter().map(|s| s.as_ref().to_owned()).collect();
        self.keys.get(&segments)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyPath, &BTreeSet<TypedValue>)> {
        self.keys.iter()
    }

    /// Key-paths present here whose observation set differs in `other`
    /// (or is absent there). With `ignore_values`, only the observed
    /// types are compared.
    pub fn difference(&self, other: &Self, ignore_values: bool) -> BTreeSet<KeyPath> {
        self.keys
            .iter()
            .filter(|(path, observed)| match other.keys.get(*path) {
                None => true,
                Some(theirs) => {
                    if ignore_values {
                        let ours: BTreeSet<ValueType> =
                            observed.iter().map(TypedValue::type_tag).collect();
                        let theirs: BTreeSet<ValueType> =
                            theirs.iter().map(TypedValue::type_tag).collect();
                        ours != theirs
                    } else {
                        *observed != theirs
                    }
                }
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Deterministic, key-path-ordered rendering.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for (path, observed) in &self.keys {
            out.push_str(&path.join("."));
            out.push_str(": ");
            // Group observations by type for readability.
            let mut by_type: BTreeMap<ValueType, Vec<&TypedValue>> = BTreeMap::new();
            for tv in observed {
                by_type.entry(tv.type_tag()).or_default().push(tv);
            }
            let mut first = true;
            for (type_tag, values) in by_type {
                if !first {
                    out.push_str(" | ");
                }
                first = false;
                let rendered: Vec<&str> = values.iter().map(|tv| tv.repr()).collect();
                out.push_str(&format!("{type_tag} [{}]", rendered.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for ProjectSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
