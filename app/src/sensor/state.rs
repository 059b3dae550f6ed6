use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::write_private;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastState {
    pub state: String,
    pub last_updated: DateTime<Utc>,
}

/// Last written state per sensor unique id, kept across restarts.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    states: BTreeMap<String, LastState>,
}

impl StateStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let states = match read_states(&path) {
            Ok(states) => states,
            Err(e) => {
                tracing::warn!("Ignoring sensor states in {}: {:?}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self { path, states }
    }

    pub fn get(&self, unique_id: &str) -> Option<&LastState> {
        self.states.get(unique_id)
    }

    pub fn record(&mut self, unique_id: &str, state: String) {
        self.states.insert(
            unique_id.to_owned(),
            LastState {
                state,
                last_updated: Utc::now(),
            },
        );
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(&self.states)?;
        write_private(&self.path, &content)
            .with_context(|| format!("Error writing sensor states to {}", self.path.display()))
    }
}

fn read_states(path: &Path) -> anyhow::Result<BTreeMap<String, LastState>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_states_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");

        let mut store = StateStore::load(&path);
        assert_eq!(store.get("X1_TEMP"), None);

        store.record("X1_TEMP", "21.5".to_owned());
        store.save().unwrap();

        let reloaded = StateStore::load(&path);
        assert_eq!(reloaded.get("X1_TEMP").map(|s| s.state.as_str()), Some("21.5"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = StateStore::load(&path);
        assert_eq!(store.get("X1_TEMP"), None);
    }
}
