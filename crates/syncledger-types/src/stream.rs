//! Logical stream identity.

use serde::{Deserialize, Serialize};

/// A `(name, namespace)` pair identifying a logical stream.
///
/// Serialises as the wire-level stream descriptor
/// (`{"name": .., "namespace": ..}`). Equality is structural, so a stream
/// without a namespace is distinct from the same name in any namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl StreamKey {
    /// Create a stream key.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }

    /// Stream key without a namespace.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream namespace, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_namespace_when_present() {
        assert_eq!(StreamKey::named("orders").to_string(), "orders");
        assert_eq!(
            StreamKey::new("orders", Some("public".into())).to_string(),
            "public.orders"
        );
    }

    #[test]
    fn namespace_is_part_of_identity() {
        let bare = StreamKey::named("orders");
        let scoped = StreamKey::new("orders", Some("public".into()));
        assert_ne!(bare, scoped);
        assert_eq!(bare, StreamKey::new("orders", None));
    }

    #[test]
    fn absent_namespace_is_not_serialized() {
        let json = serde_json::to_string(&StreamKey::named("orders")).unwrap();
        assert_eq!(json, r#"{"name":"orders"}"#);

        let back: StreamKey = serde_json::from_str(r#"{"name":"orders","namespace":null}"#).unwrap();
        assert_eq!(back, StreamKey::named("orders"));
    }
}
