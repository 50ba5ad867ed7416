use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use murmur_db::{Database, ledger};
use murmur_types::models::UsageRecord;

use crate::clock::Clock;
use crate::store::run_blocking;

/// Daily usage counters, keyed by user and UTC calendar day.
#[derive(Clone)]
pub struct UsageLedger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Today's record, created with a zero count on first access.
    pub async fn ensure_today(&self, user_id: Uuid) -> anyhow::Result<UsageRecord> {
        let day = self.today();
        let message_count = run_blocking(&self.db, move |db| {
            db.with_conn(|conn| ledger::ensure_record(conn, &user_id.to_string(), day))
        })
        .await?;
        Ok(UsageRecord {
            user_id,
            day,
            message_count,
        })
    }

    /// Today's count without touching the table.
    pub async fn used_today(&self, user_id: Uuid) -> anyhow::Result<u32> {
        let day = self.today();
        run_blocking(&self.db, move |db| {
            db.with_conn(|conn| ledger::count(conn, &user_id.to_string(), day))
        })
        .await
    }
}
