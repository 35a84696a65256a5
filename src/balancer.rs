use crate::accounts::{Account, AccountPool};
use crate::error::GatewayError;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Weighted account selector.
///
/// List, draw and usage increment for one call run under a single lock, so
/// concurrent callers are serialized for the duration of a selection.
#[derive(Clone)]
pub struct LoadBalancer {
    pool: Arc<dyn AccountPool>,
    lock: Arc<Mutex<()>>,
}

impl LoadBalancer {
    pub fn new(pool: Arc<dyn AccountPool>) -> Self {
        Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Picks one enabled account not in `exclude` and records its use.
    pub async fn pick(&self, exclude: &HashSet<i64>) -> Result<Account, GatewayError> {
        let _guard = self.lock.lock().await;

        let candidates: Vec<Account> = self
            .pool
            .list_enabled()
            .await
            .map_err(GatewayError::Store)?
            .into_iter()
            .filter(|acc| !exclude.contains(&acc.id))
            .collect();

        let chosen = {
            let mut rng = rand::thread_rng();
            select_weighted(&candidates, &mut rng)
        };
        let Some(chosen) = chosen else {
            return Err(GatewayError::NoAccountsAvailable);
        };
        let mut account = candidates[chosen].clone();

        self.pool
            .increment_usage(account.id)
            .await
            .map_err(GatewayError::Store)?;
        account.request_count += 1;
        account.last_used_at = Some(Utc::now());

        metrics::counter!("orchids_account_selections_total").increment(1);
        tracing::debug!(
            account_id = account.id,
            account_name = %account.name,
            email = %account.email,
            weight = account.weight,
            excluded = exclude.len(),
            "selected account"
        );
        Ok(account)
    }
}

/// Index of the chosen candidate, or `None` for an empty slice.
///
/// Probability is `weight / total` over the candidates. Negative weights
/// count as zero; a zero total falls back to a uniform draw.
pub fn select_weighted<R: Rng + ?Sized>(candidates: &[Account], rng: &mut R) -> Option<usize> {
    match candidates.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }

    let total: u128 = candidates
        .iter()
        .map(|acc| acc.weight.max(0) as u128)
        .sum();
    if total == 0 {
        return Some(rng.gen_range(0..candidates.len()));
    }

    let target = rng.gen_range(0..total);
    let mut cumulative = 0u128;
    for (idx, acc) in candidates.iter().enumerate() {
        cumulative += acc.weight.max(0) as u128;
        if cumulative > target {
            return Some(idx);
        }
    }
    Some(candidates.len() - 1)
}
