// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide endpoint registry.
//!
//! Factories are registered during process init; each registration validates
//! the supplied config against the factory's JSON Schema descriptor and
//! constructs the endpoint eagerly, so malformed config fails registration,
//! never silently at run time. After [`EndpointRegistryBuilder::build`] the
//! registry is immutable and lookups are lock-free reads of a shared map.

use crate::Endpoint;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use ucl_core::{EndpointError, EndpointId, EndpointResult, VectorProfile};

/// Builds endpoint instances from validated config.
pub trait EndpointFactory: Send + Sync {
    /// JSON Schema describing the config this factory accepts: required
    /// fields, regex constraints, dependencies.
    fn config_schema(&self) -> serde_json::Value;

    /// Construct an endpoint. Config has already passed schema validation;
    /// factories still own semantic checks (e.g. mutually exclusive auth).
    fn build(
        &self,
        id: &EndpointId,
        config: &serde_json::Value,
    ) -> EndpointResult<Arc<dyn Endpoint>>;
}

/// Mutable registry under construction. Populated during process init.
#[derive(Default)]
pub struct EndpointRegistryBuilder {
    endpoints: BTreeMap<EndpointId, Arc<dyn Endpoint>>,
}

impl EndpointRegistryBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` against the factory's schema and register the
    /// constructed endpoint under `id`.
    pub fn register(
        &mut self,
        id: EndpointId,
        factory: &dyn EndpointFactory,
        config: &serde_json::Value,
    ) -> EndpointResult<&mut Self> {
        if self.endpoints.contains_key(&id) {
            return Err(EndpointError::validation(format!(
                "endpoint {id} is already registered"
            )));
        }

        let schema = factory.config_schema();
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            EndpointError::validation(format!("factory for {id} has an invalid config schema: {e}"))
        })?;
        if let Err(error) = validator.validate(config) {
            return Err(EndpointError::validation(format!(
                "config for {id} rejected: {error}"
            ))
            .with_detail("endpoint", id.as_str()));
        }

        let endpoint = factory.build(&id, config)?;
        info!(target: "ucl.endpoint.registry", endpoint = %id, "registered endpoint");
        self.endpoints.insert(id, endpoint);
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> EndpointRegistry {
        EndpointRegistry {
            inner: Arc::new(self.endpoints),
        }
    }
}

/// Immutable, cheaply cloneable endpoint registry.
///
/// Runtime lookups are plain reads of a shared map; no locking.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<BTreeMap<EndpointId, Arc<dyn Endpoint>>>,
}

impl EndpointRegistry {
    /// Resolve an endpoint by id.
    #[must_use]
    pub fn get(&self, id: &EndpointId) -> Option<Arc<dyn Endpoint>> {
        self.inner.get(id).cloned()
    }

    /// Resolve an endpoint or fail with `E_VALIDATION`.
    pub fn resolve(&self, id: &EndpointId) -> EndpointResult<Arc<dyn Endpoint>> {
        self.get(id).ok_or_else(|| {
            EndpointError::validation(format!("no endpoint registered for {id}"))
                .with_detail("endpoint", id.as_str())
        })
    }

    /// Registered endpoint ids, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<EndpointId> {
        self.inner.keys().cloned().collect()
    }

    /// Vector profiles declared by any registered endpoint.
    #[must_use]
    pub fn vector_profiles(&self) -> Vec<(EndpointId, VectorProfile)> {
        let mut profiles = Vec::new();
        for (id, endpoint) in self.inner.iter() {
            if let Some(provider) = endpoint.as_vector_profiles() {
                for profile in provider.vector_profiles() {
                    profiles.push((id.clone(), profile));
                }
            }
        }
        profiles
    }
}
