//! Service plan catalog.
//!
//! [`PlanRegistry`] is an immutable, bijective plan ID <-> plan name mapping.
//! It is built once at startup and handed to the components that need it
//! (step constructors, request intake) by reference.

use std::collections::BTreeMap;

/// Well-known plan identifiers.
pub mod plan_ids {
    pub const GCP: &str = "ca6e5357-707f-4565-bbbd-b3ab732597c6";
    pub const AWS: &str = "361c511f-f939-4621-b228-d0fb79a1fe15";
    pub const AZURE: &str = "4deee563-e5ec-4731-b9b1-53b42d855f0c";
    pub const AZURE_LITE: &str = "8cb22518-aa26-44c5-91a0-e669ec9bf443";
    pub const TRIAL: &str = "7d55d31d-35ae-4438-bf13-6ffdfa107d9f";
    pub const SAP_CONVERGED_CLOUD: &str = "03b812ac-c991-4528-b5bd-08b303523a63";
    pub const FREEMIUM: &str = "b1a5764e-2ea1-4f95-94c0-2b4538b37b55";
    pub const OWN_CLUSTER: &str = "03e3cb66-a4c6-4c6a-b4b0-5d42224debea";
    pub const PREVIEW: &str = "5cb3d976-b85c-42ea-a636-79cadda109a9";
    pub const BUILD_RUNTIME_AWS: &str = "6aae0ff3-89f7-4f12-86de-51466145422e";
    pub const BUILD_RUNTIME_GCP: &str = "a310cd6b-6452-45a0-935d-d24ab53f9eba";
    pub const BUILD_RUNTIME_AZURE: &str = "499244b4-1bef-48c9-be68-495269899f8e";
    pub const ALICLOUD: &str = "9f2c3b4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d";
}

/// Errors from building a [`PlanRegistry`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan id {id} is mapped to more than one plan name")]
    DuplicateId { id: String },
    #[error("plan name {name} is mapped to more than one plan id")]
    DuplicateName { name: String },
}

/// Immutable bijective mapping between plan IDs and plan names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRegistry {
    id_to_name: BTreeMap<String, String>,
    name_to_id: BTreeMap<String, String>,
}

impl PlanRegistry {
    /// Builds a registry from `(name, id)` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping is not bijective.
    pub fn new<I, N, D>(pairs: I) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<String>,
    {
        let mut id_to_name = BTreeMap::new();
        let mut name_to_id = BTreeMap::new();
        for (name, id) in pairs {
            let (name, id) = (name.into(), id.into());
            if name_to_id.contains_key(&name) {
                return Err(PlanError::DuplicateName { name });
            }
            if id_to_name.contains_key(&id) {
                return Err(PlanError::DuplicateId { id });
            }
            id_to_name.insert(id.clone(), name.clone());
            name_to_id.insert(name, id);
        }
        Ok(Self {
            id_to_name,
            name_to_id,
        })
    }

    /// The standard Kyma plan catalog.
    #[must_use]
    pub fn kyma_defaults() -> Self {
        let pairs = [
            ("gcp", plan_ids::GCP),
            ("aws", plan_ids::AWS),
            ("azure", plan_ids::AZURE),
            ("azure_lite", plan_ids::AZURE_LITE),
            ("trial", plan_ids::TRIAL),
            ("sap-converged-cloud", plan_ids::SAP_CONVERGED_CLOUD),
            ("free", plan_ids::FREEMIUM),
            ("own_cluster", plan_ids::OWN_CLUSTER),
            ("preview", plan_ids::PREVIEW),
            ("build-runtime-aws", plan_ids::BUILD_RUNTIME_AWS),
            ("build-runtime-gcp", plan_ids::BUILD_RUNTIME_GCP),
            ("build-runtime-azure", plan_ids::BUILD_RUNTIME_AZURE),
            ("alicloud", plan_ids::ALICLOUD),
        ];
        let mut id_to_name = BTreeMap::new();
        let mut name_to_id = BTreeMap::new();
        for (name, id) in pairs {
            id_to_name.insert(id.to_string(), name.to_string());
            name_to_id.insert(name.to_string(), id.to_string());
        }
        Self {
            id_to_name,
            name_to_id,
        }
    }

    #[must_use]
    pub fn plan_name(&self, plan_id: &str) -> Option<&str> {
        self.id_to_name.get(plan_id).map(String::as_str)
    }

    #[must_use]
    pub fn plan_id(&self, plan_name: &str) -> Option<&str> {
        self.name_to_id.get(plan_name).map(String::as_str)
    }

    /// All plan IDs, sorted.
    pub fn plan_ids(&self) -> impl Iterator<Item = &str> {
        self.id_to_name.keys().map(String::as_str)
    }

    /// All plan names, sorted.
    pub fn plan_names(&self) -> impl Iterator<Item = &str> {
        self.name_to_id.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }
}

/// Returns `true` if `plan_id` is the own cluster plan, where the broker
/// attaches to an existing cluster instead of creating one.
#[must_use]
pub fn is_own_cluster_plan(plan_id: &str) -> bool {
    plan_id == plan_ids::OWN_CLUSTER
}
