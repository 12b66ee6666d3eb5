use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::types::{SimulationInput, SimulationOutput};

struct CacheEntry {
    output: SimulationOutput,
    expires_at: Instant,
}

/// Process-local TTL memoization of full simulation outputs.
///
/// Expired entries are deleted lazily on lookup; inserts sweep the whole map
/// once it grows past the sweep threshold. There is no background timer.
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    sweep_threshold: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_threshold,
        }
    }

    pub fn get(&self, key: &str) -> Option<SimulationOutput> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.output.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, output: SimulationOutput) {
        let mut entries = self.lock();
        if entries.len() >= self.sweep_threshold {
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
        }
        entries.insert(
            key,
            CacheEntry {
                output,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds the memoization key from the user and every input field that can
/// change the output. Goals are encoded as `amount:deadline` pairs.
pub fn cache_key(user_id: &str, input: &SimulationInput) -> String {
    let goals = input
        .goals
        .iter()
        .map(|g| format!("{}:{}", g.amount, g.deadline))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "{user_id}|{}|{}|{:?}|{}|[{goals}]|{:?}|{:?}|{}|{}|{:?}|{:?}|{:?}|{:?}|{}|{:?}|{}",
        input.savings_rate,
        input.monthly_income,
        input.monthly_expenses,
        input.net_worth,
        input.goal_amount,
        input.goal_deadline,
        input.expected_return_rate,
        input.inflation_rate,
        input.income_growth_rate,
        input.expense_growth_rate,
        input.tax_rate,
        input.monthly_withdrawal,
        input.enable_market_regimes,
        input.seed,
        input.currency,
    )
}
