use crate::error::MembershipError;
use crate::models::Membership;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};

/// How many more suspension days a membership may take.
#[async_trait]
pub trait SuspensionAllowance: Send + Sync {
    async fn remaining_days(
        &self,
        membership: &Membership,
        on: NaiveDate,
    ) -> Result<u32, MembershipError>;
}

/// Fixed number of suspension days per calendar year, counted by the year a
/// suspension starts in.
#[derive(Debug, Clone, Copy)]
pub struct YearlyAllowance {
    pub days_per_year: u32,
}

impl YearlyAllowance {
    pub fn new(days_per_year: u32) -> Self {
        Self { days_per_year }
    }
}

#[async_trait]
impl SuspensionAllowance for YearlyAllowance {
    async fn remaining_days(
        &self,
        membership: &Membership,
        on: NaiveDate,
    ) -> Result<u32, MembershipError> {
        let used = membership.suspended_days_in_year(on.year());
        Ok(self.days_per_year.saturating_sub(used))
    }
}
