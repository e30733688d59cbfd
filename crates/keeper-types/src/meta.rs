use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Attribute names that every [`ValueMeta`] carries.
pub const DEFAULT_ATTRIBUTES: [&str; 3] = ["length", "mime", "encoding"];

/// A scalar metadata attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for MetaValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for MetaValue {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Caller-supplied metadata for a write, everything except `length`.
///
/// ```
/// use keeper_types::MetaOptions;
///
/// let opts = MetaOptions::new()
///     .with_mime("text/plain")
///     .with_extension("author", "rjs");
/// assert_eq!(opts.mime(), Some("text/plain"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaOptions {
    mime: Option<String>,
    encoding: Option<String>,
    extensions: Vec<(String, MetaValue)>,
}

impl MetaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Append an extension attribute. Names are validated when the
    /// [`ValueMeta`] is built.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.extensions.push((name.into(), value.into()));
        self
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn extensions(&self) -> &[(String, MetaValue)] {
        &self.extensions
    }

    pub(crate) fn set_encoding(&mut self, encoding: Option<String>) {
        self.encoding = encoding;
    }
}

/// Immutable metadata describing a stored value.
///
/// Always carries `length`, `mime` and `encoding` (the latter two possibly
/// null), followed by caller extensions in insertion order. The serialized
/// form is part of the key derivation, so it must be byte-stable: field
/// order is fixed and extensions are written in the order they were given.
/// Equality ignores extension order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValueMeta {
    length: u64,
    mime: Option<String>,
    encoding: Option<String>,
    #[serde(default)]
    extensions: Vec<(String, MetaValue)>,
}

impl ValueMeta {
    /// Build the metadata for a value of `length` bytes.
    pub fn new(length: u64, options: MetaOptions) -> Result<Self, TypeError> {
        validate_extensions(&options.extensions)?;
        Ok(Self {
            length,
            mime: options.mime,
            encoding: options.encoding,
            extensions: options.extensions,
        })
    }

    /// Same as [`ValueMeta::new`] but with the encoding replaced.
    pub fn with_encoding(length: u64, mut options: MetaOptions, encoding: Option<String>) -> Result<Self, TypeError> {
        options.set_encoding(encoding);
        Self::new(length, options)
    }

    /// Length of the data in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// Extension attributes in insertion order.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.extensions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn extension(&self, name: &str) -> Option<&MetaValue> {
        self.extensions.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        DEFAULT_ATTRIBUTES.contains(&name) || self.extension(name).is_some()
    }

    /// Look up any attribute, default or extension, by name.
    pub fn attribute(&self, name: &str) -> Option<MetaValue> {
        let text = |v: &Option<String>| v.clone().map_or(MetaValue::Null, MetaValue::Text);
        match name {
            "length" => Some(MetaValue::Int(i64::try_from(self.length).unwrap_or(i64::MAX))),
            "mime" => Some(text(&self.mime)),
            "encoding" => Some(text(&self.encoding)),
            other => self.extension(other).cloned(),
        }
    }

    /// All attribute names: the defaults, then extensions in insertion order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        DEFAULT_ATTRIBUTES
            .iter()
            .copied()
            .chain(self.extensions.iter().map(|(k, _)| k.as_str()))
    }

    /// Serialize to the blob stored alongside the data and fed to the key hash.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypeError> {
        serde_json::to_vec(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        let meta: Self =
            serde_json::from_slice(bytes).map_err(|e| TypeError::Serialization(e.to_string()))?;
        validate_extensions(&meta.extensions)
            .map_err(|e| TypeError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl PartialEq for ValueMeta {
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length
            && self.mime == other.mime
            && self.encoding == other.encoding
            && self.extensions.len() == other.extensions.len()
            && self
                .extensions
                .iter()
                .all(|(k, v)| other.extension(k) == Some(v))
    }
}

impl Eq for ValueMeta {}

fn validate_extensions(extensions: &[(String, MetaValue)]) -> Result<(), TypeError> {
    for (i, (name, _)) in extensions.iter().enumerate() {
        if DEFAULT_ATTRIBUTES.contains(&name.as_str()) {
            return Err(TypeError::ReservedAttribute(name.clone()));
        }
        if extensions[..i].iter().any(|(earlier, _)| earlier == name) {
            return Err(TypeError::DuplicateAttribute(name.clone()));
        }
    }
    Ok(())
}
