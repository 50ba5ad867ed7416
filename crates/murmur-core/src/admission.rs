use chrono::NaiveDate;
use uuid::Uuid;

use murmur_db::{DbConnection, ledger};
use murmur_types::models::Tier;

use crate::error::PipelineError;
use crate::ledger::UsageLedger;
use crate::store::MessageStore;

/// Permission to charge one send against a user's quota. Issued by
/// [`AdmissionController::admit`] and redeemed inside the transaction that
/// stores the message.
#[derive(Debug, Clone, Copy)]
pub struct SendTicket {
    user_id: Uuid,
    limit: Option<u32>,
}

impl SendTicket {
    /// Increment-and-compare for `day` against the limit in effect at
    /// admission. `day` is taken at commit, so a send admitted just before
    /// midnight and stored after it counts toward the new day. Returns the
    /// new count, or `None` if the limit for that day is already reached.
    pub fn record_send(&self, conn: &DbConnection, day: NaiveDate) -> anyhow::Result<Option<u32>> {
        ledger::try_increment(conn, &self.user_id.to_string(), day, self.limit)
    }
}

#[derive(Debug)]
pub enum Admission {
    Allowed(SendTicket),
    Denied,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    store: MessageStore,
    ledger: UsageLedger,
    basic_daily_limit: u32,
}

impl AdmissionController {
    pub fn new(store: MessageStore, ledger: UsageLedger, basic_daily_limit: u32) -> Self {
        Self {
            store,
            ledger,
            basic_daily_limit,
        }
    }

    /// Daily limit for a tier; `None` is unlimited.
    pub fn limit_for(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Basic => Some(self.basic_daily_limit),
            Tier::Pro => None,
        }
    }

    /// Reads the tier fresh on every call, so an upgrade applies to the very
    /// next message.
    pub async fn admit(&self, user_id: Uuid) -> Result<Admission, PipelineError> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(PipelineError::UserNotFound)?;

        let Some(limit) = self.limit_for(user.tier) else {
            return Ok(Admission::Allowed(SendTicket { user_id, limit: None }));
        };

        let record = self.ledger.ensure_today(user_id).await?;
        if record.message_count < limit {
            Ok(Admission::Allowed(SendTicket {
                user_id,
                limit: Some(limit),
            }))
        } else {
            Ok(Admission::Denied)
        }
    }
}
