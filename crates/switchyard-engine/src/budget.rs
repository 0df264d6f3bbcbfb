//! Live monthly spend per project.
//!
//! Before a step runs, the engine reserves its estimated cost against the
//! project's monthly cap. The check and the reservation happen under one
//! lock, so concurrent runs of the same project cannot both pass a check
//! that only one of them fits under. A reservation is settled with the actual
//! cost on success; dropping it unsettled releases the hold.
//!
//! Spend resets at the start of each calendar month (UTC).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use switchyard_types::{SpendTracker, StoreResult, Usd};
use thiserror::Error;

/// A (year, month) accounting period.
pub type Period = (i32, u32);

fn current_period() -> Period {
    let now = Utc::now();
    (now.year(), now.month())
}

/// A reservation that does not fit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "project '{project_id}' needs {requested} but only {available} of its monthly {monthly_cap} remains"
)]
pub struct BudgetDenied {
    pub project_id: String,
    pub requested: Usd,
    pub available: Usd,
    pub monthly_cap: Usd,
}

#[derive(Debug, Clone, Default)]
struct Account {
    period: Period,
    spent: Usd,
    reserved: Usd,
}

impl Account {
    fn roll(&mut self, period: Period) {
        if self.period != period {
            self.period = period;
            self.spent = Usd::ZERO;
            self.reserved = Usd::ZERO;
        }
    }
}

/// Per-project spend for the current month.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    accounts: Mutex<HashMap<String, Account>>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record spend that happened outside the engine, e.g. when seeding from
    /// billing records at start-up.
    pub fn record_spend(&self, project_id: &str, amount: Usd) {
        self.record_spend_in(project_id, amount, current_period());
    }

    fn record_spend_in(&self, project_id: &str, amount: Usd, period: Period) {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(project_id.to_string()).or_default();
        account.roll(period);
        account.spent += amount;
    }

    /// Committed spend this month.
    pub fn spent(&self, project_id: &str) -> Usd {
        self.spent_in(project_id, current_period())
    }

    fn spent_in(&self, project_id: &str, period: Period) -> Usd {
        self.accounts
            .lock()
            .get(project_id)
            .filter(|a| a.period == period)
            .map_or(Usd::ZERO, |a| a.spent)
    }

    /// Amount currently held by unsettled reservations.
    pub fn reserved(&self, project_id: &str) -> Usd {
        let period = current_period();
        self.accounts
            .lock()
            .get(project_id)
            .filter(|a| a.period == period)
            .map_or(Usd::ZERO, |a| a.reserved)
    }

    /// Hold `amount` against `monthly_cap`. `None` means uncapped.
    pub fn reserve(
        self: &Arc<Self>,
        project_id: &str,
        monthly_cap: Option<Usd>,
        amount: Usd,
    ) -> Result<Reservation, BudgetDenied> {
        self.reserve_in(project_id, monthly_cap, amount, current_period())
    }

    fn reserve_in(
        self: &Arc<Self>,
        project_id: &str,
        monthly_cap: Option<Usd>,
        amount: Usd,
        period: Period,
    ) -> Result<Reservation, BudgetDenied> {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(project_id.to_string()).or_default();
        account.roll(period);

        if let Some(cap) = monthly_cap {
            let available = cap.saturating_sub(account.spent + account.reserved);
            if account.spent + account.reserved + amount > cap {
                return Err(BudgetDenied {
                    project_id: project_id.to_string(),
                    requested: amount,
                    available,
                    monthly_cap: cap,
                });
            }
        }

        account.reserved += amount;
        Ok(Reservation {
            ledger: Arc::clone(self),
            project_id: project_id.to_string(),
            amount,
            period,
            settled: false,
        })
    }

    fn settle(&self, reservation: &Reservation, actual: Option<Usd>) {
        let mut accounts = self.accounts.lock();
        let Some(account) = accounts.get_mut(&reservation.project_id) else {
            return;
        };
        if account.period == reservation.period {
            account.reserved = account.reserved.saturating_sub(reservation.amount);
        }
        if let Some(actual) = actual {
            account.spent += actual;
        }
    }
}

impl SpendTracker for BudgetLedger {
    fn spent_this_period(&self, project_id: &str) -> StoreResult<Usd> {
        Ok(self.spent(project_id))
    }
}

/// A hold on part of a project's monthly budget.
#[derive(Debug)]
#[must_use = "an unsettled reservation is released when dropped"]
pub struct Reservation {
    ledger: Arc<BudgetLedger>,
    project_id: String,
    amount: Usd,
    period: Period,
    settled: bool,
}

impl Reservation {
    pub fn amount(&self) -> Usd {
        self.amount
    }

    /// Replace the hold with the cost actually incurred.
    pub fn commit(mut self, actual: Usd) {
        self.ledger.settle(&self, Some(actual));
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle(self, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(dollars: f64) -> Usd {
        Usd::from_dollars(dollars)
    }

    #[test]
    fn test_reserve_commit() {
        let ledger = Arc::new(BudgetLedger::new());
        let hold = ledger.reserve("p1", Some(usd(1.0)), usd(0.40)).unwrap();
        assert_eq!(ledger.reserved("p1"), usd(0.40));
        hold.commit(usd(0.25));
        assert_eq!(ledger.reserved("p1"), Usd::ZERO);
        assert_eq!(ledger.spent("p1"), usd(0.25));
    }

    #[test]
    fn test_drop_releases() {
        let ledger = Arc::new(BudgetLedger::new());
        {
            let _hold = ledger.reserve("p1", Some(usd(1.0)), usd(0.70)).unwrap();
            assert!(ledger.reserve("p1", Some(usd(1.0)), usd(0.70)).is_err());
        }
        assert_eq!(ledger.reserved("p1"), Usd::ZERO);
        assert!(ledger.reserve("p1", Some(usd(1.0)), usd(0.70)).is_ok());
    }

    #[test]
    fn test_denied_reports_available() {
        let ledger = Arc::new(BudgetLedger::new());
        ledger.record_spend("p1", usd(4.50));
        let err = ledger.reserve("p1", Some(usd(5.0)), usd(1.0)).unwrap_err();
        assert_eq!(err.available, usd(0.50));
        assert_eq!(err.requested, usd(1.0));
    }

    #[test]
    fn test_uncapped_always_fits() {
        let ledger = Arc::new(BudgetLedger::new());
        ledger.record_spend("p1", usd(1_000.0));
        assert!(ledger.reserve("p1", None, usd(50.0)).is_ok());
    }

    #[test]
    fn test_exact_fit_allowed() {
        let ledger = Arc::new(BudgetLedger::new());
        let a = ledger.reserve("p1", Some(usd(0.30)), usd(0.10)).unwrap();
        let b = ledger.reserve("p1", Some(usd(0.30)), usd(0.20)).unwrap();
        a.commit(usd(0.10));
        b.commit(usd(0.20));
        assert_eq!(ledger.spent("p1"), usd(0.30));
    }

    #[test]
    fn test_new_month_resets() {
        let ledger = Arc::new(BudgetLedger::new());
        ledger.record_spend_in("p1", usd(5.0), (2026, 9));
        assert_eq!(ledger.spent_in("p1", (2026, 9)), usd(5.0));
        assert!(ledger.reserve_in("p1", Some(usd(5.0)), usd(1.0), (2026, 9)).is_err());
        let hold = ledger
            .reserve_in("p1", Some(usd(5.0)), usd(1.0), (2026, 10))
            .unwrap();
        hold.commit(usd(1.0));
        assert_eq!(ledger.spent_in("p1", (2026, 10)), usd(1.0));
    }

    #[test]
    fn test_projects_are_independent() {
        let ledger = Arc::new(BudgetLedger::new());
        ledger.record_spend("p1", usd(5.0));
        assert!(ledger.reserve("p2", Some(usd(5.0)), usd(5.0)).is_ok());
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let ledger = Arc::new(BudgetLedger::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .reserve("p1", Some(usd(1.0)), usd(0.25))
                        .map(|hold| hold.commit(usd(0.25)))
                        .is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 4);
        assert_eq!(ledger.spent("p1"), usd(1.0));
    }

    #[test]
    fn test_spend_tracker() {
        let ledger = BudgetLedger::new();
        ledger.record_spend("p1", usd(2.0));
        assert_eq!(ledger.spent_this_period("p1").unwrap(), usd(2.0));
    }
}
