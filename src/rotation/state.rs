//! On-disk rotation state
//!
//! Both catalogs with their counters, written as one JSON document through a
//! temp file and a rename so a crash mid-write leaves the previous state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{IdentityRecord, ProxyRecord, RotationError};

/// Serialized catalogs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proxies: Vec<ProxyRecord>,
    #[serde(default)]
    pub identities: Vec<IdentityRecord>,
}

impl RotationState {
    /// Read a saved state; `None` when the file does not exist yet
    pub async fn load(path: &Path) -> Result<Option<Self>, RotationError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RotationError::state(path, e)),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| RotationError::state(path, e))?;
        tracing::debug!(path = %path.display(), "Rotation state loaded");
        Ok(Some(state))
    }

    /// Write atomically
    pub async fn save(&self, path: &Path) -> Result<(), RotationError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RotationError::state(path, e))?;
        }

        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(self).map_err(|e| RotationError::state(path, e))?;
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| RotationError::state(&temp_path, e))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| RotationError::state(path, e))?;

        tracing::debug!(path = %path.display(), "Rotation state saved");
        Ok(())
    }

    /// Overlay saved records on the configured seed
    ///
    /// Saved counters win for entries present in both; entries added at
    /// runtime are appended. Nothing from the seed is dropped.
    pub fn merge_into(self, proxies: &mut Vec<ProxyRecord>, identities: &mut Vec<IdentityRecord>) {
        for saved in self.proxies {
            match proxies.iter_mut().find(|p| p.url == saved.url) {
                Some(existing) => *existing = saved,
                None => proxies.push(saved),
            }
        }

        for saved in self.identities {
            match identities.iter_mut().find(|i| i.same_entry(&saved)) {
                Some(existing) => existing.usage_count = saved.usage_count,
                None => identities.push(saved),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_seed_and_counters() {
        let mut proxies = vec![ProxyRecord::new("http://p1:3128"), ProxyRecord::new("http://p2:3128")];
        let mut identities = vec![IdentityRecord::new("ua", "desktop", "chrome")];

        let mut used = ProxyRecord::new("http://p2:3128");
        used.usage_count = 7;
        used.failure_count = 2;
        let mut identity = IdentityRecord::new("ua", "desktop", "chrome");
        identity.usage_count = 3;

        RotationState {
            saved_at: Some(Utc::now()),
            proxies: vec![used, ProxyRecord::new("http://added:3128")],
            identities: vec![identity, IdentityRecord::new("ua-2", "mobile", "safari")],
        }
        .merge_into(&mut proxies, &mut identities);

        let urls: Vec<&str> = proxies.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["http://p1:3128", "http://p2:3128", "http://added:3128"]);
        assert_eq!(proxies[1].usage_count, 7);
        assert_eq!(proxies[1].failure_count, 2);
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].usage_count, 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = RotationState::load(&dir.path().join("rotation.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotation.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let err = RotationState::load(&path).await.unwrap_err();
        assert!(matches!(err, RotationError::State { .. }));
    }

    #[tokio::test]
    async fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rotation.json");
        let state = RotationState {
            proxies: vec![ProxyRecord::new("http://p1:3128")],
            ..Default::default()
        };
        state.save(&path).await.unwrap();

        let loaded = RotationState::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.proxies, state.proxies);
        assert!(!path.with_extension("tmp").exists());
    }
}
