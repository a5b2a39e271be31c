//! Versioned pricing rule table. Pure data, loaded once and shared read-only.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::attributes::{
    ConditionTier, RecurringFrequency, ServiceCategory, ServiceTier, SizeMetric, UrgencyTier,
};
use crate::error::RuleTableError;
use crate::money::PriceRange;

const EMBEDDED_RULES: &str = include_str!("../../../rules/pricing.yaml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRuleTable {
    pub version: String,
    pub currency: String,
    pub base_prices: Vec<BasePriceRow>,
    pub surcharges: SurchargeRules,
    pub travel: TravelPolicy,
    pub add_ons: Vec<AddOnPrice>,
    pub discounts: DiscountRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasePriceRow {
    pub category: ServiceCategory,
    pub tier: ServiceTier,
    #[serde(default)]
    pub bedrooms: Option<u8>,
    #[serde(default)]
    pub max_floor_area_sqm: Option<u32>,
    pub low: Decimal,
    pub high: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurchargeRules {
    pub condition: ConditionSurcharges,
    pub timing: TimingSurcharges,
    pub urgency: UrgencySurcharges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSurcharges {
    pub moderate: Decimal,
    pub heavy: Decimal,
    pub extreme_low: Decimal,
    pub extreme_high: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSurcharges {
    pub after_hours: Decimal,
    pub weekend: Decimal,
    pub public_holiday: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgencySurcharges {
    pub same_day: Decimal,
    pub emergency: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelPolicy {
    pub free_radius_km: Decimal,
    pub per_km_rate: Decimal,
    pub round_trip_multiplier: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOnPrice {
    pub id: String,
    pub name: String,
    pub low: Decimal,
    pub high: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRules {
    pub residential_frequency: FrequencyDiscounts,
    pub subscription_one_year: Decimal,
    #[serde(default)]
    pub commercial_visits_per_week: Vec<VisitTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyDiscounts {
    pub weekly: Decimal,
    pub fortnightly: Decimal,
    pub monthly: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitTier {
    pub min_visits: u8,
    pub percent: Decimal,
}

/// How the condition tier affects the running range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionRule {
    None,
    Percent(Decimal),
    /// Indicative range only; a person has to quote it.
    ManualRange { low: Decimal, high: Decimal },
}

impl PricingRuleTable {
    /// The table shipped with the binary (`rules/pricing.yaml`).
    pub fn embedded() -> Result<Self, RuleTableError> {
        Self::from_yaml_str(EMBEDDED_RULES)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleTableError> {
        let table: Self =
            serde_yaml::from_str(text).map_err(|err| RuleTableError::Parse(err.to_string()))?;
        table.check()?;
        Ok(table)
    }

    fn check(&self) -> Result<(), RuleTableError> {
        for row in &self.base_prices {
            if row.bedrooms.is_some() == row.max_floor_area_sqm.is_some() {
                return Err(RuleTableError::Invalid(format!(
                    "{:?}/{:?} row must key on exactly one of bedrooms or max_floor_area_sqm",
                    row.category, row.tier
                )));
            }
            if row.low > row.high || row.low.is_sign_negative() {
                return Err(RuleTableError::Invalid(format!(
                    "{:?}/{:?} row has an invalid range {}..{}",
                    row.category, row.tier, row.low, row.high
                )));
            }
        }
        for add_on in &self.add_ons {
            if add_on.low > add_on.high {
                return Err(RuleTableError::Invalid(format!(
                    "add-on {} has an invalid range",
                    add_on.id
                )));
            }
        }
        let c = &self.surcharges.condition;
        if c.extreme_low > c.extreme_high {
            return Err(RuleTableError::Invalid("extreme surcharge range is inverted".into()));
        }
        Ok(())
    }

    pub fn base_price(
        &self,
        category: ServiceCategory,
        tier: ServiceTier,
        size: SizeMetric,
    ) -> Option<PriceRange> {
        let mut rows = self
            .base_prices
            .iter()
            .filter(|row| row.category == category && row.tier == tier);
        let row = match size {
            SizeMetric::Bedrooms(n) => rows.find(|row| row.bedrooms == Some(n)),
            SizeMetric::FloorAreaSqm(area) => rows
                .filter(|row| row.max_floor_area_sqm.is_some_and(|max| max >= area))
                .min_by_key(|row| row.max_floor_area_sqm),
        }?;
        Some(PriceRange::new(row.low, row.high))
    }

    pub fn condition_rule(&self, condition: ConditionTier) -> ConditionRule {
        let c = &self.surcharges.condition;
        match condition {
            ConditionTier::Standard => ConditionRule::None,
            ConditionTier::Moderate => ConditionRule::Percent(c.moderate),
            ConditionTier::Heavy => ConditionRule::Percent(c.heavy),
            ConditionTier::Extreme => ConditionRule::ManualRange {
                low: c.extreme_low,
                high: c.extreme_high,
            },
        }
    }

    pub fn urgency_percent(&self, urgency: UrgencyTier) -> Decimal {
        match urgency {
            UrgencyTier::Standard => Decimal::ZERO,
            UrgencyTier::SameDay => self.surcharges.urgency.same_day,
            UrgencyTier::Emergency => self.surcharges.urgency.emergency,
        }
    }

    pub fn add_on(&self, id: &str) -> Option<&AddOnPrice> {
        self.add_ons.iter().find(|a| a.id == id)
    }

    pub fn residential_frequency_discount(&self, frequency: RecurringFrequency) -> Decimal {
        let d = &self.discounts.residential_frequency;
        match frequency {
            RecurringFrequency::OneTime => Decimal::ZERO,
            RecurringFrequency::Weekly => d.weekly,
            RecurringFrequency::Fortnightly => d.fortnightly,
            RecurringFrequency::Monthly => d.monthly,
        }
    }

    pub fn commercial_visit_discount(&self, visits_per_week: u8) -> Decimal {
        self.discounts
            .commercial_visits_per_week
            .iter()
            .filter(|tier| visits_per_week >= tier.min_visits)
            .map(|tier| tier.percent)
            .max()
            .unwrap_or(Decimal::ZERO)
    }
}
