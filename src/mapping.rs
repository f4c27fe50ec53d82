//! Mapping store: the vendor set and the model → details table.
//!
//! Both live in the key-value store under fixed keys: a set at `vendors`
//! and a hash at `model_mapping` whose values are JSON-encoded
//! [`ModelDetails`]. Every key and value is normalized (trimmed,
//! lower-cased) before it is written or compared.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::kv::KvStore;
use crate::models::{normalize, ModelDetails};
use crate::vendor::VendorSet;

pub const VENDORS_KEY: &str = "vendors";
pub const MODEL_MAPPING_KEY: &str = "model_mapping";

/// Snapshot of the model table, keyed by normalized model.
pub type ModelMapping = HashMap<String, ModelDetails>;

/// Batch lookup of model details.
///
/// Implemented by the live [`MappingStore`] (one store round trip per
/// call) and by a [`ModelMapping`] snapshot.
#[async_trait]
pub trait ModelLookup: Send + Sync {
    /// Resolve distinct normalized model keys. Absent models are omitted.
    async fn bulk_lookup(&self, models: &[String]) -> Result<HashMap<String, ModelDetails>>;
}

/// Handle on the vendor set and model table.
#[derive(Clone)]
pub struct MappingStore {
    kv: Arc<dyn KvStore>,
    default_vendors: Vec<String>,
}

impl MappingStore {
    pub fn new(kv: Arc<dyn KvStore>, default_vendors: Vec<String>) -> Self {
        Self {
            kv,
            default_vendors,
        }
    }

    /// Load the persisted vendor set, seeding it from the defaults when empty.
    ///
    /// Any store failure here is [`PipelineError::StoreUnavailable`].
    pub async fn load_or_create_vendors(&self) -> Result<VendorSet> {
        self.kv.ping().await.map_err(PipelineError::store)?;

        let members = self
            .kv
            .set_members(VENDORS_KEY)
            .await
            .map_err(PipelineError::store)?;
        if !members.is_empty() {
            let vendors = VendorSet::new(&members);
            info!(count = vendors.len(), "loaded vendor set");
            return Ok(vendors);
        }

        let seed = VendorSet::new(&self.default_vendors);
        warn!(count = seed.len(), "vendor set empty, seeding defaults");
        if !seed.is_empty() {
            let tokens: Vec<String> = seed.iter().map(str::to_string).collect();
            self.kv
                .set_add(VENDORS_KEY, &tokens)
                .await
                .map_err(PipelineError::store)?;
        }
        Ok(seed)
    }

    /// Full model table. Entries that fail to decode are skipped.
    pub async fn get_model_mapping(&self) -> Result<ModelMapping> {
        let raw = self
            .kv
            .hash_get_all(MODEL_MAPPING_KEY)
            .await
            .map_err(PipelineError::store)?;

        let mut mapping = ModelMapping::with_capacity(raw.len());
        for (model, value) in raw {
            match serde_json::from_str::<ModelDetails>(&value) {
                Ok(details) => {
                    mapping.insert(model, details);
                }
                Err(e) => warn!(model = %model, error = %e, "skipping malformed model entry"),
            }
        }
        Ok(mapping)
    }

    pub async fn get_model(&self, model: &str) -> Result<Option<ModelDetails>> {
        let raw = self
            .kv
            .hash_get(MODEL_MAPPING_KEY, &normalize(model))
            .await
            .map_err(PipelineError::store)?;
        Ok(raw.and_then(|value| serde_json::from_str(&value).ok()))
    }

    /// Add a vendor. Returns `true` when it was not known before.
    pub async fn save_vendor(&self, name: &str) -> Result<bool> {
        let token = normalize(name);
        if token.is_empty() {
            return Ok(false);
        }
        let added = self
            .kv
            .set_add(VENDORS_KEY, &[token.clone()])
            .await
            .map_err(PipelineError::store)?;
        if added > 0 {
            info!(vendor = %token, "saved new vendor");
        }
        Ok(added > 0)
    }

    /// Write `details` under the normalized model key, unless the stored
    /// entry is already equal after normalization. Returns `true` on write.
    pub async fn update_model_mapping(&self, model: &str, details: &ModelDetails) -> Result<bool> {
        let key = normalize(model);
        let updated = details.normalized();

        if let Some(existing) = self.get_model(&key).await? {
            if existing.normalized() == updated {
                debug!(model = %key, "model mapping unchanged");
                return Ok(false);
            }
        }

        let value = serde_json::to_string(&updated).map_err(PipelineError::store)?;
        self.kv
            .hash_set(MODEL_MAPPING_KEY, &key, &value)
            .await
            .map_err(PipelineError::store)?;
        debug!(model = %key, vendor = %updated.vendor, "model mapping updated");
        Ok(true)
    }

    /// One round trip for a batch of models.
    pub async fn bulk_lookup_models(
        &self,
        models: &[String],
    ) -> Result<HashMap<String, ModelDetails>> {
        let keys: Vec<String> = models.iter().map(|m| normalize(m)).collect();
        let values = self
            .kv
            .hash_get_many(MODEL_MAPPING_KEY, &keys)
            .await
            .map_err(PipelineError::store)?;

        let mut found = HashMap::new();
        for (key, value) in keys.into_iter().zip(values) {
            let Some(value) = value else { continue };
            match serde_json::from_str::<ModelDetails>(&value) {
                Ok(details) => {
                    found.insert(key, details);
                }
                Err(e) => warn!(model = %key, error = %e, "skipping malformed model entry"),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ModelLookup for MappingStore {
    async fn bulk_lookup(&self, models: &[String]) -> Result<HashMap<String, ModelDetails>> {
        self.bulk_lookup_models(models).await
    }
}

#[async_trait]
impl ModelLookup for ModelMapping {
    async fn bulk_lookup(&self, models: &[String]) -> Result<HashMap<String, ModelDetails>> {
        Ok(models
            .iter()
            .filter_map(|m| self.get(m).map(|d| (m.clone(), d.clone())))
            .collect())
    }
}
