//! Structured service attributes collected by the booking form.

use std::collections::BTreeSet;
use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::QuoteError;
use crate::pricing::PricingRuleTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    Residential,
    Commercial,
    Airbnb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Regular,
    Deep,
    EndOfLease,
}

/// Bedrooms for homes and short stays, floor area for commercial premises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMetric {
    Bedrooms(u8),
    FloorAreaSqm(u32),
}

impl fmt::Display for SizeMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bedrooms(n) => write!(f, "{n} bedroom(s)"),
            Self::FloorAreaSqm(n) => write!(f, "{n} m²"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionTier {
    #[default]
    Standard,
    Moderate,
    Heavy,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UrgencyTier {
    #[default]
    Standard,
    SameDay,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimingTier {
    WeekdayDaytime,
    AfterHours,
    Weekend,
    PublicHoliday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecurringFrequency {
    #[default]
    OneTime,
    Weekly,
    Fortnightly,
    Monthly,
}

const MAX_DISTANCE_KM: Decimal = dec!(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAttributes {
    pub category: ServiceCategory,
    pub service_tier: ServiceTier,
    pub size: SizeMetric,
    #[serde(default)]
    pub condition: ConditionTier,
    #[serde(default)]
    pub urgency: UrgencyTier,
    /// Every tier that applies to the booking window; empty means weekday daytime.
    #[serde(default)]
    pub timing: BTreeSet<TimingTier>,
    #[serde(default)]
    pub distance_km: Decimal,
    #[serde(default)]
    pub frequency: RecurringFrequency,
    #[serde(default)]
    pub subscription: bool,
    #[serde(default)]
    pub add_ons: BTreeSet<String>,
    #[serde(default)]
    pub visits_per_week: Option<u8>,
}

impl ServiceAttributes {
    /// Boundary validation; the calculator never sees unchecked input.
    pub fn validate(&self, table: &PricingRuleTable) -> Result<(), QuoteError> {
        if self.distance_km.is_sign_negative() && !self.distance_km.is_zero() {
            return Err(QuoteError::Validation("distance_km must not be negative".into()));
        }
        if self.distance_km > MAX_DISTANCE_KM {
            return Err(QuoteError::Validation(format!(
                "distance_km {} is outside the service area",
                self.distance_km
            )));
        }
        match self.size {
            SizeMetric::Bedrooms(0) => {
                return Err(QuoteError::Validation("bedrooms must be at least 1".into()))
            }
            SizeMetric::FloorAreaSqm(0) => {
                return Err(QuoteError::Validation("floor_area_sqm must be at least 1".into()))
            }
            _ => {}
        }
        if self.subscription && self.category != ServiceCategory::Residential {
            return Err(QuoteError::Validation(
                "the one-year subscription is offered for residential services only".into(),
            ));
        }
        match (self.category, self.visits_per_week) {
            (ServiceCategory::Commercial, Some(v)) if v == 0 || v > 7 => {
                return Err(QuoteError::Validation(format!(
                    "visits_per_week must be between 1 and 7, got {v}"
                )));
            }
            (ServiceCategory::Commercial, _) | (_, None) => {}
            (_, Some(_)) => {
                return Err(QuoteError::Validation(
                    "visits_per_week only applies to commercial services".into(),
                ));
            }
        }
        if let Some(unknown) = self.add_ons.iter().find(|id| table.add_on(id).is_none()) {
            return Err(QuoteError::Validation(format!("unknown add-on `{unknown}`")));
        }
        Ok(())
    }
}
