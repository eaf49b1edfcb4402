//! Display secret manager
//!
//! Owns the `<vm>-display-secret` Secret holding the SPICE password and its
//! expiry. Two entry points write it:
//! - [`DisplaySecretManager::ensure_present`] from the reconciler: creates
//!   the secret and rotates it when the display spec changes, never because
//!   it expired
//! - [`DisplaySecretManager::ensure_secret`] from console hand-off: returns
//!   the current password, generating a new one if it has expired
//!
//! Both serialize on one write lock, so a hand-off never races a
//! reconciler rotation inside this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use cluster_client::{ChildKind, ClusterClientTrait, ClusterError, ManagedObject, ObjectKey};
use crds::{
    DISPLAY_PASSWORD_KEY, DISPLAY_SPEC_HASH_ANNOTATION, PASSWORD_EXPIRY_KEY, VirtualMachine, display_secret_name,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::RngCore;
use tracing::{debug, info};

use crate::channel::{CancelToken, ChangeType, HandlerOutcome, VmChannelEvent, VmEventHandler};
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::hashing::json_hash;
use crate::metrics::Metrics;
use crate::reconciler::children::{child_metadata, wants_display_secret};
use crate::store::VmState;

/// Attempts at writing the secret from the console path before giving up
const WRITE_ATTEMPTS: usize = 3;

/// Random bytes in a generated password
const PASSWORD_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordExpiry {
    Never,
    At(DateTime<Utc>),
}

impl PasswordExpiry {
    /// `validity` of `None` means the password never expires
    pub fn after(validity: Option<Duration>, now: DateTime<Utc>) -> Self {
        match validity.and_then(|v| chrono::Duration::from_std(v).ok()) {
            Some(validity) => PasswordExpiry::At(now + validity),
            None => PasswordExpiry::Never,
        }
    }

    /// Stored form: `never` or Unix epoch seconds
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == "never" {
            return Some(PasswordExpiry::Never);
        }
        let seconds: i64 = raw.parse().ok()?;
        DateTime::from_timestamp(seconds, 0).map(PasswordExpiry::At)
    }

    pub fn encode(&self) -> String {
        match self {
            PasswordExpiry::Never => "never".to_string(),
            PasswordExpiry::At(at) => at.timestamp().to_string(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            PasswordExpiry::Never => false,
            PasswordExpiry::At(at) => now >= *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCredentials {
    pub password: String,
    pub expiry: PasswordExpiry,
}

impl DisplayCredentials {
    /// 128 random bits, base64 encoded
    pub fn generate(expiry: PasswordExpiry) -> Self {
        let mut bytes = [0u8; PASSWORD_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            password: BASE64.encode(bytes),
            expiry,
        }
    }

    /// Read the credentials from a secret, `None` if they are missing or unreadable
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let read = |key: &str| -> Option<String> { String::from_utf8(data.get(key)?.0.clone()).ok() };
        Some(Self {
            password: read(DISPLAY_PASSWORD_KEY)?,
            expiry: PasswordExpiry::parse(&read(PASSWORD_EXPIRY_KEY)?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep(DisplayCredentials),
    Generate,
}

/// Keep unexpired credentials, replace missing or expired ones
pub fn decide(existing: Option<&DisplayCredentials>, now: DateTime<Utc>) -> Decision {
    match existing {
        Some(credentials) if !credentials.expiry.is_expired(now) => Decision::Keep(credentials.clone()),
        _ => Decision::Generate,
    }
}

fn secret_key(vm: &VirtualMachine) -> ObjectKey {
    ObjectKey::new(
        ChildKind::Secret,
        vm.namespace().unwrap_or_default(),
        display_secret_name(&vm.name_any()),
    )
}

fn display_spec_hash(vm: &VirtualMachine) -> Result<String, ControllerError> {
    Ok(json_hash(&vm.spice())?)
}

/// Numeric resourceVersion comparison, unknown versions count as newer
fn is_older(candidate: &Secret, known: &Secret) -> bool {
    let version = |s: &Secret| s.metadata.resource_version.as_deref()?.parse::<u64>().ok();
    matches!((version(candidate), version(known)), (Some(c), Some(k)) if c < k)
}

pub struct DisplaySecretManager {
    client: Arc<dyn ClusterClientTrait>,
    config: Arc<OperatorConfig>,
    metrics: Arc<Metrics>,
    cache: Mutex<HashMap<ObjectKey, Secret>>,
    writes: tokio::sync::Mutex<()>,
}

impl DisplaySecretManager {
    pub fn new(client: Arc<dyn ClusterClientTrait>, config: Arc<OperatorConfig>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            config,
            metrics,
            cache: Mutex::new(HashMap::new()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Password validity for `vm`, `None` when passwords never expire
    pub fn validity(&self, vm: &VirtualMachine) -> Option<Duration> {
        let validity = vm
            .spice()
            .and_then(|s| s.password_validity)
            .map(Duration::from_secs)
            .unwrap_or(self.config.display_password_validity);
        (!validity.is_zero()).then_some(validity)
    }

    /// Current credentials of `vm`, rotating them if they expired
    ///
    /// `None` when the VM's display does not use a generated password.
    pub async fn ensure_secret(&self, vm: &VirtualMachine) -> Result<Option<DisplayCredentials>, ControllerError> {
        self.ensure_secret_at(vm, Utc::now()).await
    }

    pub async fn ensure_secret_at(
        &self,
        vm: &VirtualMachine,
        now: DateTime<Utc>,
    ) -> Result<Option<DisplayCredentials>, ControllerError> {
        if !wants_display_secret(vm) {
            return Ok(None);
        }
        let key = secret_key(vm);
        let hash = display_spec_hash(vm)?;
        let _guard = self.writes.lock().await;

        for attempt in 1..=WRITE_ATTEMPTS {
            let existing = self.current(&key).await?;
            let credentials = existing.as_ref().and_then(DisplayCredentials::from_secret);
            if let Decision::Keep(credentials) = decide(credentials.as_ref(), now) {
                return Ok(Some(credentials));
            }

            let fresh = DisplayCredentials::generate(PasswordExpiry::after(self.validity(vm), now));
            match self.write(vm, &key, existing.as_ref(), &fresh, &hash).await {
                Ok(()) => {
                    info!(vm = %vm.name_any(), expiry = %fresh.expiry.encode(), "Rotated expired display password");
                    return Ok(Some(fresh));
                }
                Err(e) if e.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(vm = %vm.name_any(), "Display secret changed underneath us, re-reading");
                    self.invalidate(&key);
                }
                Err(e) => {
                    if e.is_conflict() {
                        self.invalidate(&key);
                    }
                    return Err(e.into());
                }
            }
        }
        Err(ClusterError::Conflict(key.to_string()).into())
    }

    /// Reconciler path: the secret exists exactly when the display needs one
    ///
    /// A secret is (re)generated when missing or when the display spec it was
    /// generated for changed. Expiry alone never triggers a rotation here.
    pub async fn ensure_present(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let key = secret_key(vm);
        let _guard = self.writes.lock().await;

        if !wants_display_secret(vm) {
            // The cache may not have seen a secret left over from before a restart
            if self.current(&key).await?.is_some() {
                self.metrics.api_call("delete");
                match self.client.delete_child(&key).await {
                    Ok(()) | Err(ClusterError::NotFound(_)) => {
                        info!(vm = %vm.name_any(), "Removed display secret no longer needed");
                        self.invalidate(&key);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(());
        }

        let hash = display_spec_hash(vm)?;
        let existing = self.current(&key).await?;
        let current = existing.as_ref().is_some_and(|secret| {
            secret
                .annotations()
                .get(DISPLAY_SPEC_HASH_ANNOTATION)
                .is_some_and(|h| *h == hash)
                && DisplayCredentials::from_secret(secret).is_some()
        });
        if current {
            return Ok(());
        }

        let fresh = DisplayCredentials::generate(PasswordExpiry::after(self.validity(vm), Utc::now()));
        match self.write(vm, &key, existing.as_ref(), &fresh, &hash).await {
            Ok(()) => {
                info!(vm = %vm.name_any(), "Generated display password");
                Ok(())
            }
            Err(e) => {
                if e.is_conflict() {
                    self.invalidate(&key);
                }
                Err(e.into())
            }
        }
    }

    /// Track a Secret seen through the watch
    pub fn observe(&self, change: ChangeType, secret: &Secret) {
        let key = ObjectKey::new(
            ChildKind::Secret,
            secret.namespace().unwrap_or_default(),
            secret.name_any(),
        );
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        match change {
            ChangeType::Added | ChangeType::Modified => {
                if cache.get(&key).is_some_and(|known| is_older(secret, known)) {
                    return;
                }
                cache.insert(key, secret.clone());
            }
            ChangeType::Deleted => {
                cache.remove(&key);
            }
        }
    }

    fn cached(&self, key: &ObjectKey) -> Option<Secret> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn invalidate(&self, key: &ObjectKey) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
    }

    /// Cached secret, read from the cluster on a miss
    async fn current(&self, key: &ObjectKey) -> Result<Option<Secret>, ClusterError> {
        if let Some(secret) = self.cached(key) {
            return Ok(Some(secret));
        }
        let Some(ManagedObject::Secret(secret)) = self.client.get_child(key).await? else {
            return Ok(None);
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.clone(), secret.clone());
        }
        Ok(Some(secret))
    }

    fn build(&self, vm: &VirtualMachine, credentials: &DisplayCredentials, hash: &str) -> Result<Secret, ControllerError> {
        let mut metadata = child_metadata(vm, &display_secret_name(&vm.name_any()), &self.config)?;
        metadata.annotations = Some([(DISPLAY_SPEC_HASH_ANNOTATION.to_string(), hash.to_string())].into());
        Ok(Secret {
            metadata,
            data: Some(
                [
                    (
                        DISPLAY_PASSWORD_KEY.to_string(),
                        ByteString(credentials.password.clone().into_bytes()),
                    ),
                    (
                        PASSWORD_EXPIRY_KEY.to_string(),
                        ByteString(credentials.expiry.encode().into_bytes()),
                    ),
                ]
                .into(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }

    async fn write(
        &self,
        vm: &VirtualMachine,
        key: &ObjectKey,
        existing: Option<&Secret>,
        credentials: &DisplayCredentials,
        hash: &str,
    ) -> Result<(), ControllerError> {
        let mut object = ManagedObject::from(self.build(vm, credentials, hash)?);
        let written = match existing {
            Some(existing) => {
                object.set_resource_version(existing.metadata.resource_version.clone());
                self.metrics.api_call("patch");
                self.client.patch_child(&object).await?
            }
            None => {
                self.metrics.api_call("create");
                self.client.create_child(&object).await?
            }
        };
        if let (ManagedObject::Secret(secret), Ok(mut cache)) = (written, self.cache.lock()) {
            cache.insert(key.clone(), secret);
        }
        self.metrics.secret_rotations.inc();
        Ok(())
    }
}

#[async_trait::async_trait]
impl VmEventHandler for DisplaySecretManager {
    async fn handle(&self, _state: &mut VmState, event: &VmChannelEvent, _cancel: &CancelToken) -> HandlerOutcome {
        match event {
            VmChannelEvent::Child {
                change,
                object: ManagedObject::Secret(secret),
            } => self.observe(*change, secret),
            VmChannelEvent::Vm {
                change: ChangeType::Deleted,
                vm,
            } => self.invalidate(&secret_key(vm)),
            _ => {}
        }
        HandlerOutcome::Done
    }
}
