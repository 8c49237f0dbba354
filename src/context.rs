//! Evaluation contexts.
//!
//! A [Context] is the subject of every flag evaluation: either a single
//! (kind, key, attributes) triple or a multi-context collecting several
//! kinds. Invalid contexts cannot be constructed; all building goes
//! through [ContextBuilder] and [MultiContextBuilder].

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

/// Kind used when none is specified.
pub const DEFAULT_KIND: &str = "user";

const KIND_MULTI: &str = "multi";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context key must be non-empty")]
    EmptyKey,

    #[error("context kind {0:?} is not valid")]
    InvalidKind(String),

    #[error("multi-context must contain at least one context")]
    EmptyMulti,

    #[error("multi-context has duplicate kind {0:?}")]
    DuplicateKind(String),
}

/// A validated context kind.
///
/// Kinds are restricted to `[a-zA-Z0-9._-]` and may not be `"kind"`
/// itself. `"multi"` is reserved for multi-contexts and is rejected for
/// individual contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(String);

impl Kind {
    pub fn user() -> Self {
        Kind(DEFAULT_KIND.to_string())
    }

    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(kind: &str) -> Result<(), ContextError> {
        let well_formed = !kind.is_empty()
            && kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
        if !well_formed || kind == "kind" || kind == KIND_MULTI {
            return Err(ContextError::InvalidKind(kind.to_string()));
        }
        Ok(())
    }
}

impl TryFrom<&str> for Kind {
    type Error = ContextError;

    fn try_from(kind: &str) -> Result<Self, Self::Error> {
        Kind::validate(kind)?;
        Ok(Kind(kind.to_string()))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// An individual (single-kind) context.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleContext {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
}

impl SingleContext {
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Look up an attribute through a parsed [Reference].
    ///
    /// Depth-1 references can address the built-in attributes `key`,
    /// `kind`, `name` and `anonymous`; anything else is resolved against
    /// the custom attributes, descending into nested objects for each
    /// additional path component.
    pub fn get_value(&self, reference: &Reference) -> Option<Value> {
        let components = reference.components()?;
        let first = components.first()?;

        let mut current = if components.len() == 1 {
            match first.as_str() {
                "key" => return Some(Value::String(self.key.clone())),
                "kind" => return Some(Value::String(self.kind.0.clone())),
                "name" => return self.name.clone().map(Value::String),
                "anonymous" => return Some(Value::Bool(self.anonymous)),
                _ => self.attributes.get(first)?,
            }
        } else {
            self.attributes.get(first)?
        };

        for component in &components[1..] {
            match current {
                Value::Object(map) => current = map.get(component)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }

    fn canonical_key(&self) -> String {
        if self.kind.is_user() {
            self.key.clone()
        } else {
            format!("{}:{}", self.kind, escape_key(&self.key))
        }
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

/// The subject of an evaluation.
///
/// Either a single context or an unordered set of single contexts with
/// distinct kinds. A multi-context may not contain multi-contexts.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    Single(SingleContext),
    Multi(MultiContext),
}

/// A context holding one individual context per kind.
///
/// Members are kept sorted by kind so that the canonical key is stable.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiContext {
    contexts: Vec<SingleContext>,
}

impl Context {
    /// Shorthand for a default-kind context with only a key.
    pub fn user<K: Into<String>>(key: K) -> Result<Self, ContextError> {
        ContextBuilder::new(key).build()
    }

    /// The fully-qualified key for this context.
    ///
    /// Single user-kind contexts use the bare key; other single contexts
    /// use `kind:key` with `%` and `:` escaped; multi-contexts join the
    /// member pairs sorted by kind.
    pub fn canonical_key(&self) -> String {
        match self {
            Context::Single(c) => c.canonical_key(),
            Context::Multi(m) => {
                let parts: Vec<String> = m
                    .contexts
                    .iter()
                    .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
                    .collect();
                parts.join(":")
            }
        }
    }

    /// The individual context of the given kind, if any.
    pub fn as_kind(&self, kind: &str) -> Option<&SingleContext> {
        match self {
            Context::Single(c) if c.kind == *kind => Some(c),
            Context::Single(_) => None,
            Context::Multi(m) => m.contexts.iter().find(|c| c.kind == *kind),
        }
    }

    /// All individual contexts, one for a single, each member for a multi.
    pub fn individual_contexts(&self) -> impl Iterator<Item = &SingleContext> {
        let slice = match self {
            Context::Single(c) => std::slice::from_ref(c),
            Context::Multi(m) => m.contexts.as_slice(),
        };
        slice.iter()
    }

    /// Kind string for the whole context, `"multi"` for multi-contexts.
    pub fn kind_str(&self) -> &str {
        match self {
            Context::Single(c) => c.kind.as_str(),
            Context::Multi(_) => KIND_MULTI,
        }
    }
}

/// Builder for single contexts.
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
}

impl ContextBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn kind<K: Into<String>>(mut self, kind: K) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn set_value<N: Into<String>, V: Into<Value>>(mut self, name: N, value: V) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        let kind = Kind::try_from(self.kind.as_str())?;
        Ok(Context::Single(SingleContext {
            kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
        }))
    }
}

/// Builder for multi-contexts.
pub struct MultiContextBuilder {
    contexts: Vec<SingleContext>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        Self {
            contexts: Vec::new(),
        }
    }

    /// Add an individual context. Multi-contexts are flattened into their
    /// members rather than nested.
    pub fn add(mut self, context: Context) -> Self {
        match context {
            Context::Single(c) => self.contexts.push(c),
            Context::Multi(m) => self.contexts.extend(m.contexts),
        }
        self
    }

    pub fn build(mut self) -> Result<Context, ContextError> {
        if self.contexts.is_empty() {
            return Err(ContextError::EmptyMulti);
        }
        if self.contexts.len() == 1 {
            return Ok(Context::Single(self.contexts.remove(0)));
        }
        self.contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        for pair in self.contexts.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(ContextError::DuplicateKind(pair[0].kind.0.clone()));
            }
        }
        Ok(Context::Multi(MultiContext {
            contexts: self.contexts,
        }))
    }
}

impl Default for MultiContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed attribute path.
///
/// Either a plain attribute name (depth 1) or a slash-delimited pointer
/// like `/address/street` (depth 2+ possible). `~1` and `~0` unescape to
/// `/` and `~` inside pointer components. Invalid forms are retained, but
/// carry no components and never match anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    raw: String,
    components: Option<Vec<String>>,
}

impl Reference {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        let raw = raw.into();
        let components = Self::parse(&raw);
        Self { raw, components }
    }

    fn parse(raw: &str) -> Option<Vec<String>> {
        if raw.is_empty() || raw == "/" {
            return None;
        }
        if let Some(path) = raw.strip_prefix('/') {
            let mut components = Vec::new();
            for part in path.split('/') {
                if part.is_empty() {
                    return None;
                }
                components.push(part.replace("~1", "/").replace("~0", "~"));
            }
            Some(components)
        } else {
            Some(vec![raw.to_string()])
        }
    }

    pub fn is_valid(&self) -> bool {
        self.components.is_some()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Components of the path, or `None` for an invalid reference.
    pub fn components(&self) -> Option<&Vec<String>> {
        self.components.as_ref()
    }

    /// Whether this is the top-level `kind` attribute, which gets special
    /// treatment in clause matching.
    pub fn is_kind(&self) -> bool {
        matches!(self.components(), Some(c) if c.len() == 1 && c[0] == "kind")
    }
}

impl Default for Reference {
    fn default() -> Self {
        Reference::new("")
    }
}

impl<'de> serde::Deserialize<'de> for Reference {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Reference::new(raw))
    }
}

impl serde::Serialize for Reference {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_default_kind() {
        let context = ContextBuilder::new("alice").build().unwrap();
        assert_eq!(context.kind_str(), "user");
        assert_eq!(context.canonical_key(), "alice");
    }

    #[test]
    fn rejects_empty_key() {
        assert_eq!(
            ContextBuilder::new("").build().unwrap_err(),
            ContextError::EmptyKey
        );
    }

    #[test]
    fn rejects_bad_kinds() {
        for kind in &["", "kind", "multi", "no spaces", "ümlaut"] {
            assert!(
                ContextBuilder::new("k").kind(*kind).build().is_err(),
                "kind {:?} should be rejected",
                kind
            );
        }
        assert!(ContextBuilder::new("k").kind("org-2.x_y").build().is_ok());
    }

    #[test]
    fn canonical_key_escapes_non_user_kinds() {
        let context = ContextBuilder::new("my:key%x")
            .kind("org")
            .build()
            .unwrap();
        assert_eq!(context.canonical_key(), "org:my%3Akey%25x");
    }

    #[test]
    fn multi_context_sorts_and_joins() {
        let user = ContextBuilder::new("u").build().unwrap();
        let org = ContextBuilder::new("o").kind("org").build().unwrap();
        let multi = MultiContextBuilder::new()
            .add(user)
            .add(org)
            .build()
            .unwrap();
        assert_eq!(multi.kind_str(), "multi");
        assert_eq!(multi.canonical_key(), "org:o:user:u");
        assert_eq!(multi.as_kind("org").unwrap().key(), "o");
        assert_eq!(multi.as_kind("user").unwrap().key(), "u");
        assert!(multi.as_kind("device").is_none());
    }

    #[test]
    fn multi_context_rejects_duplicates_and_empty() {
        let a = ContextBuilder::new("a").kind("org").build().unwrap();
        let b = ContextBuilder::new("b").kind("org").build().unwrap();
        assert_eq!(
            MultiContextBuilder::new().add(a).add(b).build().unwrap_err(),
            ContextError::DuplicateKind("org".to_string())
        );
        assert_eq!(
            MultiContextBuilder::new().build().unwrap_err(),
            ContextError::EmptyMulti
        );
    }

    #[test]
    fn single_member_multi_collapses() {
        let a = ContextBuilder::new("a").kind("org").build().unwrap();
        let built = MultiContextBuilder::new().add(a).build().unwrap();
        assert!(matches!(built, Context::Single(_)));
    }

    #[test]
    fn gets_builtin_and_custom_values() {
        let context = ContextBuilder::new("alice")
            .name("Alice")
            .anonymous(true)
            .set_value("email", "a@example.com")
            .set_value("address", json!({"street": {"line1": "123 Main"}}))
            .build()
            .unwrap();
        let single = context.as_kind("user").unwrap();

        let get = |path: &str| single.get_value(&Reference::new(path));
        assert_eq!(get("key"), Some(json!("alice")));
        assert_eq!(get("kind"), Some(json!("user")));
        assert_eq!(get("name"), Some(json!("Alice")));
        assert_eq!(get("anonymous"), Some(json!(true)));
        assert_eq!(get("email"), Some(json!("a@example.com")));
        assert_eq!(get("/address/street/line1"), Some(json!("123 Main")));
        assert_eq!(get("/address/missing"), None);
        assert_eq!(get("missing"), None);
    }

    #[test]
    fn nested_reference_does_not_hit_builtins() {
        let context = ContextBuilder::new("alice").build().unwrap();
        let single = context.as_kind("user").unwrap();
        assert_eq!(single.get_value(&Reference::new("/key/sub")), None);
    }

    #[test]
    fn reference_parsing() {
        assert_eq!(
            Reference::new("name").components(),
            Some(&vec!["name".to_string()])
        );
        assert_eq!(
            Reference::new("/address/street").components(),
            Some(&vec!["address".to_string(), "street".to_string()])
        );
        assert_eq!(
            Reference::new("/a~1b/c~0d").components(),
            Some(&vec!["a/b".to_string(), "c~d".to_string()])
        );
        // a plain name containing a slash-free tilde is literal
        assert_eq!(
            Reference::new("a~1b").components(),
            Some(&vec!["a~1b".to_string()])
        );
        for bad in &["", "/", "//", "/a//b", "/a/"] {
            assert!(!Reference::new(*bad).is_valid(), "{:?}", bad);
        }
        assert!(Reference::new("/kind").is_kind());
        assert!(Reference::new("kind").is_kind());
        assert!(!Reference::new("/kind/sub").is_kind());
    }
}
