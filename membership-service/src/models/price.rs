//! Price model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billing frequency of a recurring price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    Weekly,
    Fortnightly,
    Monthly,
    Yearly,
}

impl BillingFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Weekly => "weekly",
            BillingFrequency::Fortnightly => "fortnightly",
            BillingFrequency::Monthly => "monthly",
            BillingFrequency::Yearly => "yearly",
        }
    }

    /// Nominal days in one period, used for daily-rate proration.
    pub fn nominal_days(&self) -> u32 {
        match self {
            BillingFrequency::Weekly => 7,
            BillingFrequency::Fortnightly => 14,
            BillingFrequency::Monthly => 30,
            BillingFrequency::Yearly => 365,
        }
    }
}

impl std::str::FromStr for BillingFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "week" | "weekly" => Ok(BillingFrequency::Weekly),
            "fortnight" | "fortnightly" => Ok(BillingFrequency::Fortnightly),
            "month" | "monthly" => Ok(BillingFrequency::Monthly),
            "year" | "yearly" | "annually" => Ok(BillingFrequency::Yearly),
            _ => Err(format!("Invalid billing frequency: {}", s)),
        }
    }
}

/// A recurring price for a product. Memberships keep a snapshot of the price
/// they were sold at; the catalog holds the current definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: Option<String>,
    pub name: String,
    pub amount: Decimal,
    pub currency: String,
    pub billing_frequency: BillingFrequency,
    /// Minimum number of billing cycles before a cancellation may take effect.
    pub min_contract: Option<u32>,
}

/// Pick the price a membership is billed on.
///
/// Matches by id first, then by name, then falls back to the only price when
/// the product has exactly one.
pub fn resolve_price<'a>(candidates: &'a [Price], wanted: &Price) -> Option<&'a Price> {
    if let Some(id) = wanted.id.as_deref() {
        if let Some(p) = candidates.iter().find(|p| p.id.as_deref() == Some(id)) {
            return Some(p);
        }
    }

    if let Some(p) = candidates.iter().find(|p| p.name == wanted.name) {
        return Some(p);
    }

    match candidates {
        [only] => Some(only),
        _ => None,
    }
}
