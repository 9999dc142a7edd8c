//! Upcasting of stored event payloads across schema versions.
//!
//! When an event type's attribute layout changes, its
//! [`SCHEMA_VERSION`](crate::event::DomainEvent::SCHEMA_VERSION) is bumped
//! and an upcaster is registered for the transition. On read, the mapper
//! composes the registered upcasters in version order to rewrite the stored
//! attribute mapping before the event is materialized. Upcasts may add
//! fields with defaults, rename fields, split or merge attributes, or drop
//! a field entirely.
//!
//! Upcasters operate on the decoded `serde_json::Value` payload, between
//! deserialization of the canonical bytes and materialization of the typed
//! event.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Error raised when a stored payload cannot be brought to the current
/// schema version.
#[derive(Debug, Error)]
pub enum UpcastError {
    /// The chain has no registered step starting at the stored version.
    #[error("no upcaster registered for `{topic}` from schema version {from}")]
    MissingUpcaster { topic: String, from: u32 },
    /// A registered step skipped past the requested target version.
    #[error("upcasting `{topic}` overshot schema version {target}, reached {reached}")]
    Overshot {
        topic: String,
        target: u32,
        reached: u32,
    },
    /// A transform rejected the payload.
    #[error("upcast transform failed: {0}")]
    Transform(String),
}

/// One schema migration step for a single topic.
pub trait Upcast: Send + Sync {
    /// Schema version this step consumes.
    fn from_version(&self) -> u32;

    /// Schema version this step produces.
    fn to_version(&self) -> u32;

    /// Rewrite the attribute mapping from `from_version` to `to_version`.
    ///
    /// # Errors
    ///
    /// Returns [`UpcastError::Transform`] when the payload cannot be
    /// migrated.
    fn upcast(&self, value: Value) -> Result<Value, UpcastError>;
}

/// An [`Upcast`] step built from a closure.
///
/// ```
/// use chronicle_core::upcast::from_fn;
/// use serde_json::json;
///
/// // v1 -> v2: add `when` with a null default.
/// let step = from_fn(1, 2, |mut value| {
///     value["when"] = json!(null);
///     Ok(value)
/// });
/// ```
pub struct FnUpcast {
    from: u32,
    to: u32,
    transform: Box<dyn Fn(Value) -> Result<Value, UpcastError> + Send + Sync>,
}

/// Build an upcast step from a closure.
pub fn from_fn<F>(from: u32, to: u32, transform: F) -> FnUpcast
where
    F: Fn(Value) -> Result<Value, UpcastError> + Send + Sync + 'static,
{
    FnUpcast {
        from,
        to,
        transform: Box::new(transform),
    }
}

impl Upcast for FnUpcast {
    fn from_version(&self) -> u32 {
        self.from
    }

    fn to_version(&self) -> u32 {
        self.to
    }

    fn upcast(&self, value: Value) -> Result<Value, UpcastError> {
        (self.transform)(value)
    }
}

/// Registered upcaster chains, keyed by topic.
///
/// Populated at startup and read-only afterwards.
#[derive(Default)]
pub struct UpcasterRegistry {
    chains: HashMap<String, Vec<Box<dyn Upcast>>>,
}

impl UpcasterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration step for `topic`.
    ///
    /// Steps may be registered in any order; application walks them by
    /// version.
    pub fn register<U: Upcast + 'static>(&mut self, topic: impl Into<String>, upcaster: U) {
        self.chains
            .entry(topic.into())
            .or_default()
            .push(Box::new(upcaster));
    }

    /// Whether any step is registered for `topic`.
    #[must_use]
    pub fn has_upcasters(&self, topic: &str) -> bool {
        self.chains.contains_key(topic)
    }

    /// Rewrite `value` from schema version `from` to `target` by composing
    /// the registered steps for `topic` in version order.
    ///
    /// # Errors
    ///
    /// Returns an [`UpcastError`] when the chain cannot reach `target`.
    pub fn upcast(
        &self,
        topic: &str,
        from: u32,
        target: u32,
        mut value: Value,
    ) -> Result<Value, UpcastError> {
        let mut version = from;
        let chain = self.chains.get(topic);

        while version < target {
            let step = chain
                .and_then(|steps| steps.iter().find(|s| s.from_version() == version))
                .ok_or_else(|| UpcastError::MissingUpcaster {
                    topic: topic.to_string(),
                    from: version,
                })?;

            value = step.upcast(value)?;
            version = step.to_version();
            tracing::trace!(topic, version, "applied upcaster");
        }

        if version != target {
            return Err(UpcastError::Overshot {
                topic: topic.to_string(),
                target,
                reached: version,
            });
        }

        Ok(value)
    }
}

impl std::fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<(&str, usize)> = self
            .chains
            .iter()
            .map(|(topic, steps)| (topic.as_str(), steps.len()))
            .collect();
        topics.sort_unstable();
        f.debug_struct("UpcasterRegistry")
            .field("topics", &topics)
            .finish()
    }
}
