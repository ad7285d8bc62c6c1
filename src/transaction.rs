use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::Database;
use crate::error::CrawlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Buy is recorded but not yet confirmed by the operator.
    WaitBuy,
    /// Currency is held, waiting for a profitable sale.
    Hanging,
    /// Sale is recorded but not yet confirmed by the operator.
    WaitSale,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::WaitBuy => "wait_buy",
            TransactionStatus::Hanging => "hanging",
            TransactionStatus::WaitSale => "wait_sale",
            TransactionStatus::Completed => "completed",
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (WaitBuy, Hanging) | (Hanging, WaitSale) | (WaitSale, Completed)
        )
    }
}

impl FromStr for TransactionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "wait_buy" => Ok(TransactionStatus::WaitBuy),
            "hanging" => Ok(TransactionStatus::Hanging),
            "wait_sale" => Ok(TransactionStatus::WaitSale),
            "completed" => Ok(TransactionStatus::Completed),
            _ => anyhow::bail!("Invalid transaction status: '{}'", s),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub bank: String,
    pub currency: String,
    /// Units of foreign currency bought.
    pub amount: f64,
    /// Rate we paid.
    pub rate_buy: f64,
    /// Rate we could have sold at on the same day.
    pub rate_sale: f64,
    pub date_opened: NaiveDateTime,
}

impl NewTransaction {
    /// Local currency spent on the buy.
    pub fn price(&self) -> f64 {
        self.amount * self.rate_buy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub bank: String,
    pub currency: String,
    pub amount: f64,
    pub rate_buy: f64,
    pub rate_sale: f64,
    pub rate_close: Option<f64>,
    pub date_opened: NaiveDateTime,
    pub date_closed: Option<NaiveDateTime>,
    pub status: TransactionStatus,
}

impl Transaction {
    pub fn price(&self) -> f64 {
        self.amount * self.rate_buy
    }

    /// Local currency received when selling everything at `rate`.
    pub fn sale_value(&self, rate: f64) -> f64 {
        self.amount * rate
    }

    pub fn profit_at(&self, rate: f64) -> f64 {
        self.amount * (rate - self.rate_buy)
    }
}

const TRANSACTION_COLUMNS: &str = "id, bank, currency, amount, rate_buy, rate_sale, rate_close,
     date_opened, date_closed, status";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let raw_status: String = row.get(9)?;
    let status = raw_status.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(9, Type::Text, e.into())
    })?;
    Ok(Transaction {
        id: row.get(0)?,
        bank: row.get(1)?,
        currency: row.get(2)?,
        amount: row.get(3)?,
        rate_buy: row.get(4)?,
        rate_sale: row.get(5)?,
        rate_close: row.get(6)?,
        date_opened: row.get(7)?,
        date_closed: row.get(8)?,
        status,
    })
}

impl Database {
    /// Record a buy. The currency is held right away, so the row starts out
    /// HANGING.
    pub fn insert_transaction(&self, t: &NewTransaction) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO transactions (bank, currency, amount, rate_buy, rate_sale,
                                           date_opened, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    t.bank,
                    t.currency,
                    t.amount,
                    t.rate_buy,
                    t.rate_sale,
                    t.date_opened,
                    TransactionStatus::Hanging.as_str(),
                ],
            )
            .context("Failed to insert transaction")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS);
        self.conn
            .query_row(&sql, [id], transaction_from_row)
            .optional()
            .context("Failed to read transaction")
    }

    /// All transactions, newest first. An empty `statuses` matches all.
    pub fn transactions(&self, statuses: &[TransactionStatus]) -> Result<Vec<Transaction>> {
        let mut sql = format!("SELECT {} FROM transactions", TRANSACTION_COLUMNS);
        if !statuses.is_empty() {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" WHERE status IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(statuses.iter().map(|s| s.as_str())),
                transaction_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read transactions")?;
        Ok(rows)
    }

    /// Open positions: HANGING and not closed yet, oldest first.
    pub fn hanging_transactions(&self) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions
             WHERE status = 'hanging' AND date_closed IS NULL AND rate_close IS NULL
             ORDER BY date_opened, id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read hanging transactions")?;
        Ok(rows)
    }

    /// Record a sale of a hanging transaction. Returns false when it was no
    /// longer hanging.
    pub fn close_transaction(
        &self,
        id: i64,
        rate_close: f64,
        date_closed: NaiveDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE transactions SET rate_close = ?1, date_closed = ?2, status = 'wait_sale'
                 WHERE id = ?3 AND status = 'hanging'",
                params![rate_close, date_closed, id],
            )
            .context("Failed to close transaction")?;
        Ok(changed == 1)
    }

    /// Operator confirmation of a pending buy or sale.
    pub fn set_transaction_status(&self, id: i64, status: TransactionStatus) -> Result<Transaction> {
        let t = self
            .get_transaction(id)?
            .ok_or(CrawlerError::NotFound { entity: "transaction", id })?;

        // Closing goes through close_transaction, which needs a rate
        if !t.status.can_transition_to(status) || status == TransactionStatus::WaitSale {
            return Err(CrawlerError::InvalidTransition {
                entity: "transaction",
                id,
                from: t.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }

        self.conn
            .execute(
                "UPDATE transactions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update transaction status")?;
        Ok(Transaction { status, ..t })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn opened(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn buy(day: u32, rate_buy: f64) -> NewTransaction {
        NewTransaction {
            bank: "privatbank".to_string(),
            currency: "USD".to_string(),
            amount: 100.0,
            rate_buy,
            rate_sale: rate_buy - 0.4,
            date_opened: opened(day),
        }
    }

    #[test]
    fn test_money_math() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_transaction(&buy(1, 26.0)).unwrap();
        let t = db.get_transaction(id).unwrap().unwrap();
        assert_eq!(t.price(), 2600.0);
        assert_eq!(t.sale_value(26.5), 2650.0);
        assert!((t.profit_at(26.5) - 50.0).abs() < 1e-9);
        assert_eq!(buy(1, 26.0).price(), 2600.0);
    }

    #[test]
    fn test_insert_starts_hanging() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transaction(&buy(2, 26.2)).unwrap();
        db.insert_transaction(&buy(1, 26.0)).unwrap();

        let hanging = db.hanging_transactions().unwrap();
        assert_eq!(hanging.len(), 2);
        // Oldest first
        assert_eq!(hanging[0].rate_buy, 26.0);
        assert!(hanging.iter().all(|t| t.status == TransactionStatus::Hanging));
    }

    #[test]
    fn test_close_transaction_once() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_transaction(&buy(1, 26.0)).unwrap();

        assert!(db.close_transaction(id, 26.5, opened(3)).unwrap());
        assert!(!db.close_transaction(id, 27.0, opened(4)).unwrap());

        let t = db.get_transaction(id).unwrap().unwrap();
        assert_eq!(t.status, TransactionStatus::WaitSale);
        assert_eq!(t.rate_close, Some(26.5));
        assert_eq!(t.date_closed, Some(opened(3)));
        assert!(db.hanging_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_status_confirmation() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_transaction(&buy(1, 26.0)).unwrap();

        // A hanging transaction cannot be marked sold without a closing rate
        assert!(db
            .set_transaction_status(id, TransactionStatus::WaitSale)
            .is_err());
        assert!(db
            .set_transaction_status(id, TransactionStatus::Completed)
            .is_err());

        db.close_transaction(id, 26.5, opened(2)).unwrap();
        let done = db
            .set_transaction_status(id, TransactionStatus::Completed)
            .unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);

        assert_eq!(db.transactions(&[]).unwrap().len(), 1);
        assert_eq!(
            db.transactions(&[TransactionStatus::Completed]).unwrap().len(),
            1
        );
        assert!(db
            .transactions(&[TransactionStatus::Hanging])
            .unwrap()
            .is_empty());

        let err = db
            .set_transaction_status(42, TransactionStatus::Hanging)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrawlerError>(),
            Some(CrawlerError::NotFound { .. })
        ));
    }
}
