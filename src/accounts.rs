use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Account, QuotaSnapshot};

// Shared account pool: one JSON file per account under `<dir>/accounts`,
// mirrored into a DashMap for the dispatch path. The dispatcher mutates rows
// only through the rate-limit ledger; everything else is operator-driven.
pub struct AccountStore {
    accounts: DashMap<String, Account>,
    // Insertion order; selection tie-breaks and round-robin cursors need a
    // stable pool ordering, which DashMap iteration does not give.
    order: std::sync::Mutex<Vec<String>>,
    data_dir: Option<PathBuf>,
}

impl AccountStore {
    pub fn in_memory() -> Self {
        Self {
            accounts: DashMap::new(),
            order: std::sync::Mutex::new(Vec::new()),
            data_dir: None,
        }
    }

    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            accounts: DashMap::new(),
            order: std::sync::Mutex::new(Vec::new()),
            data_dir: Some(data_dir),
        }
    }

    fn accounts_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("accounts"))
    }

    // Reload should reflect current on-disk state (accounts can be added,
    // removed or disabled between reloads).
    pub fn load(&self) -> AppResult<usize> {
        let Some(dir) = self.accounts_dir() else {
            return Ok(self.accounts.len());
        };
        if !dir.exists() {
            return Err(AppError::Account(format!(
                "account directory does not exist: {}",
                dir.display()
            )));
        }

        self.accounts.clear();
        self.order.lock().expect("order lock").clear();
        let mut paths: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut count = 0;
        for path in paths {
            match Self::load_file(&path) {
                Ok(account) => {
                    debug!(email = %account.email, "loaded account");
                    self.insert(account);
                    count += 1;
                }
                Err(e) => {
                    warn!("skipping unreadable account file {}: {}", path.display(), e);
                }
            }
        }
        info!("account store loaded {} account(s)", count);
        Ok(count)
    }

    fn load_file(path: &Path) -> AppResult<Account> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| AppError::Account(format!("invalid account JSON: {}", e)))
    }

    pub fn insert(&self, account: Account) {
        let mut order = self.order.lock().expect("order lock");
        if !order.contains(&account.email) {
            order.push(account.email.clone());
        }
        drop(order);
        self.accounts.insert(account.email.clone(), account);
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, email: &str) -> Option<Account> {
        self.accounts.get(email).map(|a| a.clone())
    }

    // Consistent per-row snapshot for selection, in insertion order;
    // strategies never hold a live reference into the map across an await
    // point.
    pub fn snapshot(&self) -> Vec<Account> {
        let order = self.order.lock().expect("order lock").clone();
        order
            .iter()
            .filter_map(|email| self.accounts.get(email).map(|a| a.clone()))
            .collect()
    }

    // Applies `mutate` under the row lock, then persists the row if the store
    // is file-backed. Returns false when the account is unknown.
    pub fn update<F>(&self, email: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Account),
    {
        let updated = match self.accounts.get_mut(email) {
            Some(mut row) => {
                mutate(&mut row);
                Some(row.clone())
            }
            None => None,
        };
        match updated {
            Some(account) => {
                self.persist(&account);
                true
            }
            None => false,
        }
    }

    pub fn touch_last_used(&self, email: &str, now_ms: i64) {
        if let Some(mut row) = self.accounts.get_mut(email) {
            row.last_used = now_ms;
        }
        // last_used is scheduling state, not worth a disk write per request
    }

    pub fn set_quota_snapshot(&self, email: &str, quota: QuotaSnapshot) {
        self.update(email, |account| account.quota = quota);
    }

    fn persist(&self, account: &Account) {
        let Some(dir) = self.accounts_dir() else {
            return;
        };
        let path = dir.join(format!("{}.json", account.email));
        match serde_json::to_string_pretty(account) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!("failed to persist account {}: {}", account.email, e);
                }
            }
            Err(e) => warn!("failed to serialize account {}: {}", account.email, e),
        }
    }
}
