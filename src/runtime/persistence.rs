use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::order::Order;
use crate::models::position::Position;

/// Snapshot written per account namespace. Used only for restart recovery;
/// the exchange remains the source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub account: String,
    pub market_slug: String,
    pub taken_at_unix: i64,
    pub active_orders: Vec<Order>,
    pub positions: Vec<Position>,
}

/// JSON-file persistence, one directory per account.
pub struct PersistenceService {
    root: PathBuf,
}

impl PersistenceService {
    pub fn new(dir: &str) -> Self {
        Self {
            root: PathBuf::from(dir),
        }
    }

    fn state_path(&self, account: &str) -> PathBuf {
        self.root.join(account).join("state.json")
    }

    pub fn load(&self, account: &str) -> Option<StateSnapshot> {
        let path = self.state_path(account);
        if !path.exists() {
            return None;
        }
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<StateSnapshot>(&raw) {
            Ok(snapshot) => {
                debug!(
                    "loaded snapshot for {account}: {} orders, {} positions",
                    snapshot.active_orders.len(),
                    snapshot.positions.len()
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("snapshot for {account} unreadable: {e}");
                None
            }
        }
    }

    /// Write atomically: temp file then rename.
    pub fn save(&self, snapshot: &StateSnapshot) -> std::io::Result<()> {
        let path = self.state_path(&snapshot.account);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = tmp_path(&path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("updn-persist-{}", uuid::Uuid::new_v4()));
        let service = PersistenceService::new(dir.to_str().unwrap());

        let snapshot = StateSnapshot {
            account: "0xabc".into(),
            market_slug: "btc-updown-15m-1700000000".into(),
            taken_at_unix: Utc::now().timestamp(),
            active_orders: Vec::new(),
            positions: Vec::new(),
        };

        service.save(&snapshot).unwrap();
        let loaded = service.load("0xabc").unwrap();
        assert_eq!(loaded.market_slug, snapshot.market_slug);

        assert!(service.load("0xother").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }
}
