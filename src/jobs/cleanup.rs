//! Background job: garbage-collect dead tokens.
//!
//! Deletes tokens trashed longer ago than the retention period and tokens whose
//! `expiresIfUnused` deadline passed without a restore, together with their ApiHosts.
//! Trashed user shares record `oldUsers` on their grain first, so a later share to the same
//! account gets its old identity back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;

use crate::errors::AuthzResult;
use crate::tokens::{TokenQuery, TokenStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub trashed: usize,
    pub unused: usize,
}

/// Spawn the background cleanup task. Call this once at startup.
pub fn spawn(tokens: Arc<TokenStore>, retention: chrono::Duration, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = sweep(&tokens, retention, Utc::now()).await {
                tracing::error!("cleanup job failed: {}", e);
            }
        }
    });
}

pub async fn sweep(
    tokens: &TokenStore,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> AuthzResult<SweepReport> {
    let report = SweepReport {
        trashed: tokens
            .remove(&TokenQuery::TrashedBefore(now - retention), true)
            .await?,
        unused: tokens
            .remove(&TokenQuery::ExpiredIfUnusedBefore(now), false)
            .await?,
    };

    if report.trashed > 0 || report.unused > 0 {
        tracing::info!(
            trashed = report.trashed,
            unused = report.unused,
            "removed dead tokens"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Collection, DocumentStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_sweep_respects_retention_and_deadlines() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let seed = [
            ("old-trash", json!({"grainId": "g", "trashed": now - chrono::Duration::days(40)})),
            ("new-trash", json!({"grainId": "g", "trashed": now - chrono::Duration::days(2)})),
            ("lapsed", json!({"grainId": "g", "expiresIfUnused": now - chrono::Duration::minutes(1)})),
            ("pending", json!({"grainId": "g", "expiresIfUnused": now + chrono::Duration::hours(1)})),
        ];
        for (id, doc) in seed {
            store.put(Collection::ApiTokens, id, doc).await.unwrap();
        }

        let tokens = TokenStore::new(store.clone());
        let report = sweep(&tokens, chrono::Duration::days(30), now).await.unwrap();
        assert_eq!(report, SweepReport { trashed: 1, unused: 1 });

        let left: Vec<String> = store
            .find(Collection::ApiTokens, &crate::store::Filter::All)
            .await
            .unwrap()
            .iter()
            .map(|d| d["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(left, vec!["new-trash".to_string(), "pending".to_string()]);
    }
}
