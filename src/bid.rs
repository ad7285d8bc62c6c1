use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::Database;
use crate::error::CrawlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidType {
    /// Someone offers to buy currency from us.
    In,
    /// Someone offers to sell currency to us.
    Out,
}

impl BidType {
    pub const ALL: [BidType; 2] = [BidType::In, BidType::Out];

    pub fn as_str(&self) -> &'static str {
        match self {
            BidType::In => "in",
            BidType::Out => "out",
        }
    }
}

impl FromStr for BidType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "in" => Ok(BidType::In),
            "out" => Ok(BidType::Out),
            _ => anyhow::bail!("Invalid bid type: '{}'. Must be 'in' or 'out'", s),
        }
    }
}

impl fmt::Display for BidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    New,
    Notified,
    Called,
    Rejected,
    Inactive,
    Closed,
}

impl BidStatus {
    /// Statuses of offers that are still considered live on the resource.
    pub const ACTIVE: [BidStatus; 2] = [BidStatus::New, BidStatus::Notified];
    /// Statuses of offers that dropped out without being closed.
    pub const GONE: [BidStatus; 2] = [BidStatus::Inactive, BidStatus::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::New => "new",
            BidStatus::Notified => "notified",
            BidStatus::Called => "called",
            BidStatus::Rejected => "rejected",
            BidStatus::Inactive => "inactive",
            BidStatus::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: BidStatus) -> bool {
        use BidStatus::*;
        matches!(
            (self, next),
            (New, Notified)
                | (New | Notified, Inactive)
                | (New | Notified, Called)
                | (New | Notified | Called, Rejected)
                | (Notified | Called, Closed)
        )
    }
}

impl FromStr for BidStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "new" => Ok(BidStatus::New),
            "notified" => Ok(BidStatus::Notified),
            "called" => Ok(BidStatus::Called),
            "rejected" => Ok(BidStatus::Rejected),
            "inactive" => Ok(BidStatus::Inactive),
            "closed" => Ok(BidStatus::Closed),
            _ => anyhow::bail!("Invalid bid status: '{}'", s),
        }
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tuple that identifies an offer across fetches. Two bids with the same
/// signature are the same offer no matter what else differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BidSignature {
    rate_bits: u64,
    amount_bits: u64,
    currency: String,
    phone: String,
    bid_type: BidType,
}

impl BidSignature {
    pub fn new(rate: f64, amount: f64, currency: &str, phone: &str, bid_type: BidType) -> Self {
        // +0.0 and -0.0 compare equal in SQL, keep them equal here too
        let normalize = |v: f64| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() };
        BidSignature {
            rate_bits: normalize(rate),
            amount_bits: normalize(amount),
            currency: currency.to_string(),
            phone: phone.to_string(),
            bid_type,
        }
    }
}

/// A freshly fetched offer, tagged with currency and direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBid {
    pub rate: f64,
    pub amount: f64,
    pub currency: String,
    pub phone: String,
    pub bid_type: BidType,
}

impl NewBid {
    pub fn signature(&self) -> BidSignature {
        BidSignature::new(
            self.rate,
            self.amount,
            &self.currency,
            &self.phone,
            self.bid_type,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bid {
    pub id: i64,
    pub rate: f64,
    pub amount: f64,
    pub currency: String,
    pub phone: String,
    pub bid_type: BidType,
    pub status: BidStatus,
    pub in_use: bool,
    pub dry_run: bool,
    pub created: NaiveDateTime,
    pub resource_id: Option<i64>,
    pub resource: Option<String>,
}

impl Bid {
    pub fn signature(&self) -> BidSignature {
        BidSignature::new(
            self.rate,
            self.amount,
            &self.currency,
            &self.phone,
            self.bid_type,
        )
    }

    /// Value of the offer in the local currency.
    pub fn value(&self) -> f64 {
        self.rate * self.amount
    }
}

/// Filters for [`Database::daily_bids`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BidQuery {
    pub resource_id: Option<i64>,
    pub bid_type: Option<BidType>,
    pub statuses: Vec<BidStatus>,
    pub in_use_only: bool,
    pub limit: Option<i64>,
}

/// `[midnight, next midnight)` of the given day.
pub fn day_bounds(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = day.and_time(chrono::NaiveTime::MIN);
    (start, start + chrono::Duration::days(1))
}

const BID_COLUMNS: &str = "b.id, b.rate, b.amount, b.currency, b.phone, b.bid_type, b.status,
     b.in_use, b.dry_run, b.created, b.resource_id, r.name";

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn bid_from_row(row: &Row<'_>) -> rusqlite::Result<Bid> {
    Ok(Bid {
        id: row.get(0)?,
        rate: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        phone: row.get(4)?,
        bid_type: parse_column(row, 5)?,
        status: parse_column(row, 6)?,
        in_use: row.get(7)?,
        dry_run: row.get(8)?,
        created: row.get(9)?,
        resource_id: row.get(10)?,
        resource: row.get(11)?,
    })
}

impl Database {
    pub fn insert_bid(
        &self,
        bid: &NewBid,
        resource_id: i64,
        dry_run: bool,
        created: NaiveDateTime,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO bid (rate, amount, currency, phone, bid_type, status, in_use,
                                  dry_run, created, resource_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'new', 1, ?6, ?7, ?8)",
                params![
                    bid.rate,
                    bid.amount,
                    bid.currency,
                    bid.phone,
                    bid.bid_type.as_str(),
                    dry_run,
                    created,
                    resource_id,
                ],
            )
            .context("Failed to insert bid")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Point lookup of an `in_use` bid with the same signature recorded for
    /// this resource on `day`.
    pub fn find_in_use_bid(
        &self,
        resource_id: i64,
        bid: &NewBid,
        day: NaiveDate,
    ) -> Result<Option<i64>> {
        let (start, end) = day_bounds(day);
        self.conn
            .query_row(
                "SELECT id FROM bid
                 WHERE rate = ?1 AND amount = ?2 AND currency = ?3 AND phone = ?4
                   AND bid_type = ?5 AND in_use = 1 AND resource_id = ?6
                   AND created >= ?7 AND created < ?8
                 LIMIT 1",
                params![
                    bid.rate,
                    bid.amount,
                    bid.currency,
                    bid.phone,
                    bid.bid_type.as_str(),
                    resource_id,
                    start,
                    end,
                ],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up bid by signature")
    }

    pub fn daily_bids(&self, day: NaiveDate, query: &BidQuery) -> Result<Vec<Bid>> {
        let (start, end) = day_bounds(day);
        let mut sql = format!(
            "SELECT {} FROM bid b LEFT JOIN resource r ON r.id = b.resource_id
             WHERE b.created >= ? AND b.created < ?",
            BID_COLUMNS
        );
        let mut values: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(start.format("%F %T%.f").to_string()),
            rusqlite::types::Value::Text(end.format("%F %T%.f").to_string()),
        ];

        if let Some(resource_id) = query.resource_id {
            sql.push_str(" AND b.resource_id = ?");
            values.push(resource_id.into());
        }
        if let Some(bid_type) = query.bid_type {
            sql.push_str(" AND b.bid_type = ?");
            values.push(bid_type.as_str().to_string().into());
        }
        if !query.statuses.is_empty() {
            let placeholders = vec!["?"; query.statuses.len()].join(", ");
            sql.push_str(&format!(" AND b.status IN ({})", placeholders));
            for status in &query.statuses {
                values.push(status.as_str().to_string().into());
            }
        }
        if query.in_use_only {
            sql.push_str(" AND b.in_use = 1");
        }
        sql.push_str(" ORDER BY b.id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(limit.into());
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let bids = stmt
            .query_map(params_from_iter(values), bid_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read daily bids")?;
        Ok(bids)
    }

    /// Today's still-live bids of one resource: the set a fresh fetch is
    /// compared against.
    pub fn active_daily_bids(&self, resource_id: i64, day: NaiveDate) -> Result<Vec<Bid>> {
        self.daily_bids(
            day,
            &BidQuery {
                resource_id: Some(resource_id),
                statuses: BidStatus::ACTIVE.to_vec(),
                in_use_only: true,
                ..BidQuery::default()
            },
        )
    }

    pub fn get_bid(&self, id: i64) -> Result<Option<Bid>> {
        let sql = format!(
            "SELECT {} FROM bid b LEFT JOIN resource r ON r.id = b.resource_id WHERE b.id = ?1",
            BID_COLUMNS
        );
        self.conn
            .query_row(&sql, [id], bid_from_row)
            .optional()
            .context("Failed to read bid")
    }

    /// Flag a vanished offer. Also releases `in_use` so the same signature
    /// can be recorded again if the offer comes back. Returns false when the
    /// bid was no longer active.
    pub fn mark_bid_inactive(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE bid SET status = 'inactive', in_use = 0
                 WHERE id = ?1 AND status IN ('new', 'notified')",
                [id],
            )
            .context("Failed to mark bid inactive")?;
        Ok(changed == 1)
    }

    /// Move a NEW bid to NOTIFIED. Returns false when it was no longer NEW.
    pub fn mark_bid_notified(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE bid SET status = 'notified' WHERE id = ?1 AND status = 'new'",
                [id],
            )
            .context("Failed to mark bid notified")?;
        Ok(changed == 1)
    }

    /// Operator-driven status change, validated against the bid lifecycle.
    pub fn set_bid_status(&self, id: i64, status: BidStatus) -> Result<Bid> {
        let bid = self
            .get_bid(id)?
            .ok_or(CrawlerError::NotFound { entity: "bid", id })?;

        if !bid.status.can_transition_to(status) {
            return Err(CrawlerError::InvalidTransition {
                entity: "bid",
                id,
                from: bid.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }

        let in_use = !matches!(status, BidStatus::Inactive);
        self.conn
            .execute(
                "UPDATE bid SET status = ?1, in_use = ?2 WHERE id = ?3",
                params![status.as_str(), in_use, id],
            )
            .context("Failed to update bid status")?;

        Ok(Bid { status, in_use, ..bid })
    }

    /// Physically remove a bid. Only ever triggered by an operator.
    pub fn delete_bid(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM bid WHERE id = ?1", [id])
            .context("Failed to delete bid")?;
        Ok(deleted == 1)
    }

    /// Close every NOTIFIED bid recorded on `day`.
    pub fn auto_close_notified(&self, day: NaiveDate) -> Result<usize> {
        let (start, end) = day_bounds(day);
        self.conn
            .execute(
                "UPDATE bid SET status = 'closed'
                 WHERE status = 'notified' AND created >= ?1 AND created < ?2",
                params![start, end],
            )
            .context("Failed to auto-close bids")
    }
}
