//! Sender identity resolution and role-based access.
//!
//! Resolution order:
//! 1. configured Root uid matches the message uid: Root
//! 2. Root display name with a present but different uid: Stranger, spoofed
//! 3. explicit grant in `user_permissions`
//! 4. message from an allow-listed group: Guest
//! 5. otherwise Stranger
//!
//! When no Root uid is configured at all, the Root display name alone is
//! accepted (compatibility mode for channels without stable ids).

pub mod sudo;

pub use sudo::SudoChallenges;

use crate::config::schema::AuthConfig;
use crate::state::Database;
use crate::types::{AuthInfo, RoleLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};

pub struct AuthGate {
    root_uid: Option<u64>,
    root_name: String,
    db: Arc<Mutex<Database>>,
    sudo: std::sync::Mutex<SudoChallenges>,
}

impl AuthGate {
    pub fn new(config: &AuthConfig, db: Arc<Mutex<Database>>) -> Self {
        Self {
            root_uid: config.root_uid,
            root_name: config.root_name.trim().to_string(),
            db,
            sudo: std::sync::Mutex::new(SudoChallenges::new(Duration::from_secs(
                config.sudo_ttl_secs,
            ))),
        }
    }

    fn is_root_name(&self, sender: &str) -> bool {
        !self.root_name.is_empty() && sender.trim() == self.root_name
    }

    pub async fn resolve(&self, sender: &str, uid: Option<u64>, room: Option<&str>) -> AuthInfo {
        if let (Some(root), Some(id)) = (self.root_uid, uid) {
            if root == id {
                return AuthInfo::new(sender, RoleLevel::Root, uid);
            }
        }

        if self.is_root_name(sender) {
            match (self.root_uid, uid) {
                (Some(_), Some(id)) => {
                    warn!(sender = %sender, uid = id, "Root display name with foreign uid");
                    return AuthInfo::spoofed(sender, uid);
                }
                (None, _) => return AuthInfo::new(sender, RoleLevel::Root, uid),
                // A uid is configured but the channel gave none: the name
                // alone is not enough, fall through to ordinary lookups.
                (Some(_), None) => {}
            }
        }

        let db = self.db.lock().await;
        match db.permission_for(sender) {
            Ok(Some(role)) => return AuthInfo::new(sender, role, uid),
            Ok(None) => {}
            Err(e) => {
                error!("Permission lookup failed for {}: {}", sender, e);
                return AuthInfo::stranger(sender, uid);
            }
        }

        if let Some(room) = room {
            match db.group_allows_guests(room) {
                Ok(true) => return AuthInfo::new(sender, RoleLevel::Guest, uid),
                Ok(false) => {}
                Err(e) => error!("Group lookup failed for {}: {}", room, e),
            }
        }

        AuthInfo::stranger(sender, uid)
    }

    /// Issue a step-up code for `name` that will release `action`.
    pub fn challenge(&self, name: &str, action: &str) -> String {
        let mut sudo = self.sudo.lock().unwrap_or_else(|p| p.into_inner());
        sudo.issue(name, action)
    }

    /// Confirm a pending code; returns the action it guarded.
    pub fn confirm(&self, name: &str, code: &str) -> Option<String> {
        let mut sudo = self.sudo.lock().unwrap_or_else(|p| p.into_inner());
        sudo.verify(name, code)
    }
}
