//! Signed-in user identity and the per-device guest id.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{OwnerId, RecordId};
use crate::store::LocalStore;
use crate::util::normalize_text_option;

const GUEST_ID_KEY: &str = "device.guest_id";
const GUEST_ID_PREFIX: &str = "guest-";

/// The authenticated user, as reported by the host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: OwnerId,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<OwnerId>, email: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: normalize_text_option(email),
        }
    }
}

/// Publishes the current identity (`None` = signed out) to every engine.
///
/// Engines read the latest value whenever they need it, so a session that
/// started before a change notices it on its next check.
#[derive(Debug, Clone)]
pub struct IdentityFeed {
    sender: Arc<watch::Sender<Option<Identity>>>,
}

impl Default for IdentityFeed {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IdentityFeed {
    pub fn new(initial: Option<Identity>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish a new identity. Returns whether the signed-in user changed.
    pub fn publish(&self, identity: Option<Identity>) -> bool {
        self.sender.send_if_modified(|current| {
            let changed = current.as_ref().map(|i| &i.user_id)
                != identity.as_ref().map(|i| &i.user_id);
            if changed {
                tracing::info!(
                    "Identity changed: {}",
                    identity
                        .as_ref()
                        .map_or("signed out", |i| i.user_id.as_str())
                );
            }
            *current = identity;
            changed
        })
    }

    pub fn sign_in(&self, identity: Identity) -> bool {
        self.publish(Some(identity))
    }

    pub fn sign_out(&self) -> bool {
        self.publish(None)
    }

    pub fn current(&self) -> Option<Identity> {
        self.sender.borrow().clone()
    }

    pub fn current_user(&self) -> Option<OwnerId> {
        self.sender.borrow().as_ref().map(|i| i.user_id.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.sender.subscribe()
    }
}

/// Stable owner id for records created while signed out on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestId(OwnerId);

impl GuestId {
    /// Load the device's guest id, generating and persisting one on first use.
    pub fn load_or_create(store: &dyn LocalStore) -> Result<Self> {
        if let Some(existing) = store.read(GUEST_ID_KEY)? {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(Self(OwnerId::new(existing)));
            }
        }

        let generated = format!("{GUEST_ID_PREFIX}{}", RecordId::new());
        store.write(&[(GUEST_ID_KEY, generated.clone())])?;
        tracing::debug!("Generated guest id {}", generated);
        Ok(Self(OwnerId::new(generated)))
    }

    pub const fn owner(&self) -> &OwnerId {
        &self.0
    }

    pub fn into_owner(self) -> OwnerId {
        self.0
    }
}
