//! Identity binding registry.
//!
//! A binding links an operator to one actor on one channel tenant. The
//! outbox fan-out delivers one wake envelope per active binding. At most
//! one active binding may exist per `(channel, tenant, actor)` triple;
//! binding ids are immutable.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::store::JsonlStore;

/// One operator-to-channel-actor link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBinding {
    /// Stable id, `bd-<12 hex>`.
    pub binding_id: String,
    /// Operator the binding belongs to.
    pub operator_id: String,
    /// Channel name (e.g. `slack`).
    pub channel: String,
    /// Channel tenant (workspace, guild, …).
    pub channel_tenant_id: String,
    /// Actor inside the tenant.
    pub channel_actor_id: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Whether the binding participates in fan-out.
    pub active: bool,
    /// Creation time.
    pub created_at_ms: i64,
    /// Revocation time, once revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<i64>,
}

/// Fields accepted by `bind`.
#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest {
    /// Operator the binding belongs to.
    pub operator_id: String,
    /// Channel name.
    pub channel: String,
    /// Channel tenant.
    pub channel_tenant_id: String,
    /// Actor inside the tenant.
    pub channel_actor_id: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Persistent registry of identity bindings (`identities.jsonl`).
pub struct IdentityRegistry {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    bindings: Mutex<Option<Vec<IdentityBinding>>>,
}

impl IdentityRegistry {
    /// Create a registry persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            clock,
            bindings: Mutex::new(None),
        })
    }

    /// All bindings, active and revoked.
    pub fn list(&self) -> CoreResult<Vec<IdentityBinding>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        Ok(guard.as_ref().cloned().unwrap_or_default())
    }

    /// Active bindings, optionally restricted to one channel.
    pub fn list_active(&self, channel: Option<&str>) -> CoreResult<Vec<IdentityBinding>> {
        let mut bindings = self.list()?;
        bindings.retain(|b| b.active && channel.map_or(true, |c| b.channel == c));
        Ok(bindings)
    }

    /// Fetch one binding.
    pub fn get(&self, binding_id: &str) -> CoreResult<IdentityBinding> {
        self.list()?
            .into_iter()
            .find(|b| b.binding_id == binding_id)
            .ok_or_else(|| CoreError::NotFound(format!("binding {binding_id}")))
    }

    /// Create a binding. A triple that already has an active binding is a
    /// conflict.
    pub fn bind(&self, req: BindRequest) -> CoreResult<IdentityBinding> {
        if req.channel.trim().is_empty() || req.channel_actor_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "channel and channel_actor_id must not be empty".to_owned(),
            ));
        }

        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let bindings = guard
            .as_mut()
            .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;

        let duplicate = bindings.iter().any(|b| {
            b.active
                && b.channel == req.channel
                && b.channel_tenant_id == req.channel_tenant_id
                && b.channel_actor_id == req.channel_actor_id
        });
        if duplicate {
            return Err(CoreError::Conflict(format!(
                "active binding already exists for {}/{}/{}",
                req.channel, req.channel_tenant_id, req.channel_actor_id
            )));
        }

        let binding = IdentityBinding {
            binding_id: ids::binding_id(),
            operator_id: req.operator_id,
            channel: req.channel,
            channel_tenant_id: req.channel_tenant_id,
            channel_actor_id: req.channel_actor_id,
            scopes: req.scopes,
            active: true,
            created_at_ms: self.clock.now_ms(),
            revoked_at_ms: None,
        };
        bindings.push(binding.clone());
        self.persist_locked(&guard)?;
        info!(binding_id = %binding.binding_id, channel = %binding.channel, "identity bound");
        Ok(binding)
    }

    /// Deactivate a binding. Idempotent on already revoked bindings.
    pub fn revoke(&self, binding_id: &str) -> CoreResult<IdentityBinding> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let bindings = guard
            .as_mut()
            .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;
        let now = self.clock.now_ms();
        let binding = bindings
            .iter_mut()
            .find(|b| b.binding_id == binding_id)
            .ok_or_else(|| CoreError::NotFound(format!("binding {binding_id}")))?;
        if binding.active {
            binding.active = false;
            binding.revoked_at_ms = Some(now);
        }
        let revoked = binding.clone();
        self.persist_locked(&guard)?;
        Ok(revoked)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<IdentityBinding>>> {
        match self.bindings.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_loaded_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<Vec<IdentityBinding>>>,
    ) -> CoreResult<()> {
        if guard.is_none() {
            **guard = Some(self.store.read_all()?);
        }
        Ok(())
    }

    fn persist_locked(
        &self,
        guard: &MutexGuard<'_, Option<Vec<IdentityBinding>>>,
    ) -> CoreResult<()> {
        let bindings = guard.as_ref().cloned().unwrap_or_default();
        self.store.rewrite(&bindings)
    }
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}
