use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::bid::{BidSignature, NewBid};
use crate::config::ConfigSnapshot;
use crate::db::Database;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub inserted: usize,
    pub inactivated: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.inactivated == 0
    }
}

/// Bring today's stored bids of one resource in line with a fresh fetch.
///
/// Stored active bids whose signature is missing from `fetched` become
/// INACTIVE. Fetched bids with no `in_use` row of the same signature today
/// are inserted as NEW, carrying the snapshot's dry-run flag. Feeding the
/// same fetch twice changes nothing the second time.
///
/// Both halves run in one SQLite transaction.
pub fn reconcile(
    db: &Database,
    resource_id: i64,
    fetched: &[NewBid],
    snapshot: &ConfigSnapshot,
    now: NaiveDateTime,
) -> Result<ReconcileReport> {
    let day = now.date();
    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to start reconcile transaction")?;

    let mut report = ReconcileReport {
        fetched: fetched.len(),
        ..ReconcileReport::default()
    };

    let seen: HashSet<BidSignature> = fetched.iter().map(NewBid::signature).collect();
    for stored in db.active_daily_bids(resource_id, day)? {
        if seen.contains(&stored.signature()) {
            continue;
        }
        if db.mark_bid_inactive(stored.id)? {
            warn!(
                bid_id = stored.id,
                rate = stored.rate,
                amount = stored.amount,
                currency = %stored.currency,
                phone = %stored.phone,
                bid_type = %stored.bid_type,
                "Bid disappeared, marked inactive"
            );
            report.inactivated += 1;
        }
    }

    for bid in fetched {
        if let Some(existing) = db.find_in_use_bid(resource_id, bid, day)? {
            debug!(bid_id = existing, "Bid already recorded");
            continue;
        }
        let id = db.insert_bid(bid, resource_id, snapshot.dry_run, now)?;
        debug!(bid_id = id, rate = bid.rate, amount = bid.amount, "New bid");
        report.inserted += 1;
    }

    tx.commit().context("Failed to commit reconcile")?;
    Ok(report)
}
