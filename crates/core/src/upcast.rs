//! Schema evolution for snapshots and event payloads.
//!
//! Stored data is never rewritten. Instead, each schema change registers a pure
//! transform `raw -> raw` from version `n` to `n + 1`, and readers walk the
//! chain from the stored version up to the current one before decoding.
//!
//! - [`UpcastChain`]: one chain per snapshot type or event type.
//! - [`EventUpcasters`]: chains indexed by event type, applied by the event
//!   store on load.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;
use thiserror::Error;

/// A single schema step: transforms a payload from version `n` to `n + 1`.
pub type UpcastFn = fn(JsonValue) -> Result<JsonValue, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpcastError {
    #[error("no upcaster registered for '{subject}' from schema version {from_version}")]
    MissingStep { subject: String, from_version: u32 },

    #[error("'{subject}' has schema version {found}, newer than current version {current}")]
    FutureVersion {
        subject: String,
        found: u32,
        current: u32,
    },

    #[error("upcasting '{subject}' from schema version {from_version} failed: {message}")]
    StepFailed {
        subject: String,
        from_version: u32,
        message: String,
    },

    #[error("upcaster chain for '{0}' registered twice")]
    DuplicateChain(String),
}

/// Version-keyed chain of pure transforms ending at `current_version`.
///
/// A chain with no steps at version 1 is the identity.
#[derive(Debug, Clone)]
pub struct UpcastChain {
    current_version: u32,
    steps: BTreeMap<u32, UpcastFn>,
}

impl Default for UpcastChain {
    fn default() -> Self {
        Self::identity(1)
    }
}

impl UpcastChain {
    /// Chain with no transforms: every payload is already at `current_version`.
    pub fn identity(current_version: u32) -> Self {
        Self {
            current_version: current_version.max(1),
            steps: BTreeMap::new(),
        }
    }

    /// Register the transform from `from_version` to `from_version + 1`.
    ///
    /// The chain's current version grows to cover the new step.
    pub fn with_step(mut self, from_version: u32, step: UpcastFn) -> Self {
        self.steps.insert(from_version, step);
        self.current_version = self.current_version.max(from_version + 1);
        self
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Walk `raw` from `from_version` up to the current version.
    ///
    /// `subject` only labels errors (snapshot or event type).
    pub fn upcast(
        &self,
        subject: &str,
        raw: JsonValue,
        from_version: u32,
    ) -> Result<JsonValue, UpcastError> {
        // Payloads written before schema versions were tracked count as v1.
        let mut version = from_version.max(1);
        if version > self.current_version {
            return Err(UpcastError::FutureVersion {
                subject: subject.to_string(),
                found: version,
                current: self.current_version,
            });
        }

        let mut value = raw;
        while version < self.current_version {
            let step = self.steps.get(&version).ok_or_else(|| UpcastError::MissingStep {
                subject: subject.to_string(),
                from_version: version,
            })?;
            value = step(value).map_err(|message| UpcastError::StepFailed {
                subject: subject.to_string(),
                from_version: version,
                message,
            })?;
            version += 1;
        }

        Ok(value)
    }
}

/// Upcaster chains indexed by event type.
///
/// Event types without a registered chain pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct EventUpcasters {
    chains: HashMap<String, UpcastChain>,
}

impl EventUpcasters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        chain: UpcastChain,
    ) -> Result<(), UpcastError> {
        let event_type = event_type.into();
        if self.chains.contains_key(&event_type) {
            return Err(UpcastError::DuplicateChain(event_type));
        }
        self.chains.insert(event_type, chain);
        Ok(())
    }

    /// Schema version new events of this type are written with.
    pub fn current_version(&self, event_type: &str) -> u32 {
        self.chains
            .get(event_type)
            .map(UpcastChain::current_version)
            .unwrap_or(1)
    }

    /// Upcast a stored payload, returning it together with its new schema version.
    pub fn upcast(
        &self,
        event_type: &str,
        from_version: u32,
        payload: JsonValue,
    ) -> Result<(JsonValue, u32), UpcastError> {
        match self.chains.get(event_type) {
            Some(chain) => {
                let upcast = chain.upcast(event_type, payload, from_version)?;
                Ok((upcast, chain.current_version()))
            }
            None => Ok((payload, from_version.max(1))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rename_total(mut raw: JsonValue) -> Result<JsonValue, String> {
        let obj = raw.as_object_mut().ok_or("expected object")?;
        let total = obj.remove("total").ok_or("missing total")?;
        obj.insert("amount".to_string(), total);
        Ok(raw)
    }

    fn add_currency(mut raw: JsonValue) -> Result<JsonValue, String> {
        let obj = raw.as_object_mut().ok_or("expected object")?;
        obj.entry("currency").or_insert(json!("EUR"));
        Ok(raw)
    }

    #[test]
    fn identity_chain_passes_payload_through() {
        let chain = UpcastChain::default();
        let raw = json!({ "a": 1 });
        assert_eq!(chain.upcast("x", raw.clone(), 1).unwrap(), raw);
    }

    #[test]
    fn chain_applies_steps_in_order() {
        let chain = UpcastChain::identity(1)
            .with_step(1, rename_total)
            .with_step(2, add_currency);
        assert_eq!(chain.current_version(), 3);

        let upcast = chain.upcast("order", json!({ "total": 10 }), 1).unwrap();
        assert_eq!(upcast, json!({ "amount": 10, "currency": "EUR" }));

        // Starting mid-chain only runs the remaining steps.
        let upcast = chain.upcast("order", json!({ "amount": 5 }), 2).unwrap();
        assert_eq!(upcast, json!({ "amount": 5, "currency": "EUR" }));
    }

    #[test]
    fn missing_step_is_reported() {
        let chain = UpcastChain::identity(1).with_step(2, add_currency);
        let err = chain.upcast("order", json!({}), 1).unwrap_err();
        assert_eq!(
            err,
            UpcastError::MissingStep {
                subject: "order".to_string(),
                from_version: 1
            }
        );
    }

    #[test]
    fn future_versions_are_rejected() {
        let chain = UpcastChain::identity(2);
        assert!(matches!(
            chain.upcast("order", json!({}), 3),
            Err(UpcastError::FutureVersion { found: 3, current: 2, .. })
        ));
    }

    #[test]
    fn event_upcasters_are_keyed_by_type() {
        let mut upcasters = EventUpcasters::new();
        upcasters
            .register("OrderCreated", UpcastChain::identity(1).with_step(1, rename_total))
            .unwrap();

        let (payload, version) = upcasters
            .upcast("OrderCreated", 1, json!({ "total": 3 }))
            .unwrap();
        assert_eq!(payload, json!({ "amount": 3 }));
        assert_eq!(version, 2);

        let (payload, version) = upcasters.upcast("OrderShipped", 1, json!({ "x": 1 })).unwrap();
        assert_eq!(payload, json!({ "x": 1 }));
        assert_eq!(version, 1);

        assert!(matches!(
            upcasters.register("OrderCreated", UpcastChain::default()),
            Err(UpcastError::DuplicateChain(_))
        ));
    }
}
