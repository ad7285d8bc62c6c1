use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;

use crate::bid::{Bid, BidQuery, BidStatus, BidType};
use crate::config::ConfigSnapshot;
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStatistics {
    pub date: NaiveDate,
    /// Sell side minus buy side over every bid of the day.
    pub total_profit: f64,
    /// `total_profit` scaled by the share of bids that usually close.
    pub expected_profit: f64,
    /// Same as `total_profit`, over closed bids only.
    pub current_profit: f64,
    pub total_bids: usize,
    pub dropped_bids: usize,
    pub closed_bids: usize,
}

// In bids are ours to buy, out bids ours to sell
fn profit(bids: &[Bid]) -> f64 {
    bids.iter()
        .map(|b| match b.bid_type {
            BidType::Out => b.value(),
            BidType::In => -b.value(),
        })
        .sum()
}

pub fn daily_statistics(
    db: &Database,
    snapshot: &ConfigSnapshot,
    day: NaiveDate,
) -> Result<DailyStatistics> {
    let bids = db.daily_bids(day, &BidQuery::default())?;
    let closed: Vec<Bid> = bids
        .iter()
        .filter(|b| b.status == BidStatus::Closed)
        .cloned()
        .collect();
    let dropped = bids
        .iter()
        .filter(|b| BidStatus::GONE.contains(&b.status))
        .count();

    let total_profit = profit(&bids);
    Ok(DailyStatistics {
        date: day,
        total_profit,
        expected_profit: total_profit * snapshot.closed_bids_factor,
        current_profit: profit(&closed),
        total_bids: bids.len(),
        dropped_bids: dropped,
        closed_bids: closed.len(),
    })
}
