//! In-memory users and workspaces, optionally seeded from a JSON file.
//!
//! ```json
//! {
//!   "users": { "<user-uuid>": { "display_name": "Alice", "avatar_url": null } },
//!   "workspaces": {
//!     "<workspace-uuid>": { "members": ["<user-uuid>"], "documents": ["<doc-uuid>"] }
//!   }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{IdentityProvider, UserProfile};
use crate::error::RelayError;
use crate::registry::AccessValidator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub members: HashSet<Uuid>,
    #[serde(default)]
    pub documents: HashSet<Uuid>,
}

/// Static directory backing both the session gate and the access checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    users: HashMap<Uuid, UserProfile>,
    #[serde(default)]
    workspaces: HashMap<Uuid, Workspace>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        serde_json::from_str(json).map_err(|e| RelayError::Config(format!("directory: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let directory = Self::from_json(&json)?;
        log::info!(
            "Directory loaded from {}: {} user(s), {} workspace(s)",
            path.display(),
            directory.users.len(),
            directory.workspaces.len()
        );
        Ok(directory)
    }

    pub fn with_user(mut self, user_id: Uuid, display_name: Option<&str>) -> Self {
        self.users.insert(
            user_id,
            UserProfile {
                display_name: display_name.map(str::to_string),
                avatar_url: None,
            },
        );
        self
    }

    pub fn with_member(mut self, workspace_id: Uuid, user_id: Uuid) -> Self {
        self.workspaces
            .entry(workspace_id)
            .or_default()
            .members
            .insert(user_id);
        self
    }

    pub fn with_document(mut self, workspace_id: Uuid, document_id: Uuid) -> Self {
        self.workspaces
            .entry(workspace_id)
            .or_default()
            .documents
            .insert(document_id);
        self
    }

    pub fn user(&self, user_id: Uuid) -> Option<&UserProfile> {
        self.users.get(&user_id)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for Directory {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserProfile>, RelayError> {
        Ok(self.users.get(&user_id).cloned())
    }
}

#[async_trait::async_trait]
impl AccessValidator for Directory {
    async fn is_member(&self, user_id: Uuid, workspace_id: Uuid) -> Result<bool, RelayError> {
        Ok(self
            .workspaces
            .get(&workspace_id)
            .is_some_and(|ws| ws.members.contains(&user_id)))
    }

    async fn document_exists(
        &self,
        workspace_id: Uuid,
        document_id: Uuid,
    ) -> Result<bool, RelayError> {
        Ok(self
            .workspaces
            .get(&workspace_id)
            .is_some_and(|ws| ws.documents.contains(&document_id)))
    }
}
