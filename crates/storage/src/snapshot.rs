use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::domain::Jid;
use tokio::sync::RwLock;

/// Application state shared by the running process and written back by [`crate::StateSaver`].
pub type SharedState = Arc<RwLock<AppStateSnapshot>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    #[serde(default)]
    pub antidelete: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStateSnapshot {
    #[serde(default)]
    pub users: Map<String, Value>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupSettings>,
    #[serde(default)]
    pub database: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl AppStateSnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.groups.is_empty()
            && self.database.is_empty()
            && self.settings.is_empty()
    }

    pub fn group(&self, group: &Jid) -> Option<&GroupSettings> {
        self.groups.get(group.as_str())
    }

    pub fn group_mut(&mut self, group: &Jid) -> &mut GroupSettings {
        self.groups.entry(group.as_str().to_string()).or_default()
    }

    pub fn antidelete_enabled(&self, group: &Jid) -> bool {
        self.group(group).is_some_and(|settings| settings.antidelete)
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }
}
