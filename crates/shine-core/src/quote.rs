//! Quote calculator: service attributes in, traceable price breakdown out.
//!
//! Pure and deterministic. Every step rounds to cents before the next one
//! runs, so `total == base + Σ line-item deltas` holds exactly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::attributes::{ServiceAttributes, ServiceCategory, TimingTier};
use crate::error::QuoteError;
use crate::money::{deposit_for, round_cents, PriceRange};
use crate::pricing::{ConditionRule, PricingRuleTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    Percent { percent: Decimal },
    PercentRange { low: Decimal, high: Decimal },
    Fixed { amount: Decimal },
    FixedRange { low: Decimal, high: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub adjustment: Adjustment,
    pub delta: PriceRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub rule_table_version: String,
    pub currency: String,
    pub base: PriceRange,
    pub surcharges: Vec<LineItem>,
    pub travel: Decimal,
    pub add_ons: Vec<LineItem>,
    pub discounts: Vec<LineItem>,
    /// Absent when a person has to quote the job.
    pub total: Option<PriceRange>,
    pub deposit: Option<Decimal>,
    pub requires_manual_quote: bool,
}

impl PriceBreakdown {
    /// Every adjustment in application order, travel included.
    pub fn line_items(&self) -> Vec<LineItem> {
        let mut items = self.surcharges.clone();
        if !self.travel.is_zero() {
            items.push(LineItem {
                name: "Travel".to_string(),
                adjustment: Adjustment::Fixed { amount: self.travel },
                delta: PriceRange::single(self.travel),
            });
        }
        items.extend(self.add_ons.iter().cloned());
        items.extend(self.discounts.iter().cloned());
        items
    }
}

/// Running low/high range plus the line items that produced it.
struct Ledger {
    running: PriceRange,
    surcharges: Vec<LineItem>,
    add_ons: Vec<LineItem>,
    discounts: Vec<LineItem>,
}

impl Ledger {
    fn scale(&mut self, name: &str, low_pct: Decimal, high_pct: Decimal) -> LineItem {
        let next = self.running.scale_percent(low_pct, high_pct);
        let delta = next.minus(self.running);
        self.running = next;
        LineItem {
            name: name.to_string(),
            adjustment: if low_pct == high_pct {
                Adjustment::Percent { percent: low_pct }
            } else {
                Adjustment::PercentRange {
                    low: low_pct,
                    high: high_pct,
                }
            },
            delta,
        }
    }

    fn surcharge(&mut self, name: &str, low_pct: Decimal, high_pct: Decimal) {
        let item = self.scale(name, low_pct, high_pct);
        self.surcharges.push(item);
    }

    fn discount(&mut self, name: &str, pct: Decimal) {
        let item = self.scale(name, -pct, -pct);
        self.discounts.push(item);
    }
}

pub fn calculate(
    table: &PricingRuleTable,
    attrs: &ServiceAttributes,
) -> Result<PriceBreakdown, QuoteError> {
    attrs.validate(table)?;

    // 1. base
    let base = table
        .base_price(attrs.category, attrs.service_tier, attrs.size)
        .ok_or(QuoteError::UnknownServiceCombination {
            category: attrs.category,
            tier: attrs.service_tier,
            size: attrs.size,
        })?;
    let mut ledger = Ledger {
        running: base,
        surcharges: Vec::new(),
        add_ons: Vec::new(),
        discounts: Vec::new(),
    };

    // 2. condition
    let mut requires_manual_quote = false;
    match table.condition_rule(attrs.condition) {
        ConditionRule::None => {}
        ConditionRule::Percent(pct) => ledger.surcharge("Condition surcharge", pct, pct),
        ConditionRule::ManualRange { low, high } => {
            requires_manual_quote = true;
            ledger.surcharge("Condition surcharge (indicative)", low, high);
        }
    }

    // 3. timing
    if let Some((name, pct)) = timing_surcharge(table, attrs) {
        ledger.surcharge(&name, pct, pct);
    }

    // 4. urgency
    let urgency = table.urgency_percent(attrs.urgency);
    if !urgency.is_zero() {
        ledger.surcharge("Urgency surcharge", urgency, urgency);
    }

    // 5. travel
    let billable_km = (attrs.distance_km - table.travel.free_radius_km).max(Decimal::ZERO);
    let travel =
        round_cents(billable_km * table.travel.per_km_rate * table.travel.round_trip_multiplier);
    ledger.running = ledger.running.add(PriceRange::single(travel));

    // 6. add-ons
    for id in &attrs.add_ons {
        let Some(add_on) = table.add_on(id) else {
            return Err(QuoteError::Validation(format!("unknown add-on `{id}`")));
        };
        let delta = PriceRange::new(add_on.low, add_on.high);
        ledger.running = ledger.running.add(delta);
        ledger.add_ons.push(LineItem {
            name: add_on.name.clone(),
            adjustment: if add_on.low == add_on.high {
                Adjustment::Fixed { amount: add_on.low }
            } else {
                Adjustment::FixedRange {
                    low: add_on.low,
                    high: add_on.high,
                }
            },
            delta,
        });
    }

    // 7. discounts, on the post-surcharge total
    if let Some((name, pct)) = discount(table, attrs) {
        ledger.discount(&name, pct);
    }

    debug_assert!(ledger.running.is_ordered());

    // 8./9. totals are already cent-rounded; deposit comes off the low end
    let (total, deposit) = if requires_manual_quote {
        (None, None)
    } else {
        (Some(ledger.running), Some(deposit_for(ledger.running.low)))
    };

    Ok(PriceBreakdown {
        rule_table_version: table.version.clone(),
        currency: table.currency.clone(),
        base,
        surcharges: ledger.surcharges,
        travel,
        add_ons: ledger.add_ons,
        discounts: ledger.discounts,
        total,
        deposit,
        requires_manual_quote,
    })
}

/// Public holidays override every other tier. After-hours and weekend are
/// independent properties of the booking window and add together.
fn timing_surcharge(
    table: &PricingRuleTable,
    attrs: &ServiceAttributes,
) -> Option<(String, Decimal)> {
    let rates = &table.surcharges.timing;
    if attrs.timing.contains(&TimingTier::PublicHoliday) {
        return Some(("Public holiday surcharge".to_string(), rates.public_holiday));
    }
    let mut names = Vec::new();
    let mut pct = Decimal::ZERO;
    if attrs.timing.contains(&TimingTier::AfterHours) {
        names.push("after-hours");
        pct += rates.after_hours;
    }
    if attrs.timing.contains(&TimingTier::Weekend) {
        names.push("weekend");
        pct += rates.weekend;
    }
    if pct.is_zero() {
        return None;
    }
    Some((format!("Timing surcharge ({})", names.join(" + ")), pct))
}

fn discount(table: &PricingRuleTable, attrs: &ServiceAttributes) -> Option<(String, Decimal)> {
    let found = match attrs.category {
        ServiceCategory::Residential if attrs.subscription => Some((
            "One-year subscription discount".to_string(),
            table.discounts.subscription_one_year,
        )),
        ServiceCategory::Residential => Some((
            "Recurring service discount".to_string(),
            table.residential_frequency_discount(attrs.frequency),
        )),
        ServiceCategory::Commercial => attrs.visits_per_week.map(|visits| {
            (
                format!("Commercial frequency discount ({visits}/week)"),
                table.commercial_visit_discount(visits),
            )
        }),
        ServiceCategory::Airbnb => None,
    };
    found.filter(|(_, pct)| !pct.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{
        ConditionTier, RecurringFrequency, ServiceTier, SizeMetric, UrgencyTier,
    };
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn table() -> PricingRuleTable {
        PricingRuleTable::embedded().expect("embedded rules")
    }

    fn residential_deep(bedrooms: u8) -> ServiceAttributes {
        ServiceAttributes {
            category: ServiceCategory::Residential,
            service_tier: ServiceTier::Deep,
            size: SizeMetric::Bedrooms(bedrooms),
            condition: ConditionTier::Standard,
            urgency: UrgencyTier::Standard,
            timing: BTreeSet::new(),
            distance_km: Decimal::ZERO,
            frequency: RecurringFrequency::OneTime,
            subscription: false,
            add_ons: BTreeSet::new(),
            visits_per_week: None,
        }
    }

    #[test]
    fn three_bedroom_deep_clean_worked_example() {
        let mut attrs = residential_deep(3);
        attrs.condition = ConditionTier::Moderate;
        attrs.timing = BTreeSet::from([TimingTier::Weekend]);
        attrs.distance_km = dec!(15);

        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.base, PriceRange::new(dec!(330), dec!(450)));
        assert_eq!(quote.surcharges.len(), 2);
        assert_eq!(quote.surcharges[0].delta, PriceRange::new(dec!(49.50), dec!(67.50)));
        assert_eq!(quote.surcharges[1].delta, PriceRange::new(dec!(56.93), dec!(77.63)));
        assert_eq!(quote.travel, dec!(9.20));
        assert_eq!(quote.total, Some(PriceRange::new(dec!(445.63), dec!(604.33))));
        assert_eq!(quote.deposit, Some(dec!(111.41)));
        assert!(!quote.requires_manual_quote);
    }

    #[test]
    fn total_is_traceable_to_line_items() {
        let mut attrs = residential_deep(4);
        attrs.condition = ConditionTier::Heavy;
        attrs.urgency = UrgencyTier::SameDay;
        attrs.timing = BTreeSet::from([TimingTier::AfterHours, TimingTier::Weekend]);
        attrs.distance_km = dec!(23.5);
        attrs.add_ons = BTreeSet::from(["oven".to_string(), "laundry".to_string()]);
        attrs.frequency = RecurringFrequency::Fortnightly;

        let quote = calculate(&table(), &attrs).unwrap();
        let sum = quote
            .line_items()
            .iter()
            .fold(quote.base, |acc, item| acc.add(item.delta));
        assert_eq!(Some(sum), quote.total);
        let total = quote.total.unwrap();
        assert!(total.low <= total.high);
        assert_eq!(quote.deposit, Some(round_cents(total.low * dec!(0.25))));
    }

    #[test]
    fn after_hours_and_weekend_stack_but_holiday_wins() {
        let mut attrs = residential_deep(2);
        attrs.timing = BTreeSet::from([TimingTier::AfterHours, TimingTier::Weekend]);
        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.surcharges[0].adjustment, Adjustment::Percent { percent: dec!(35) });

        attrs.timing.insert(TimingTier::PublicHoliday);
        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.surcharges.len(), 1);
        assert_eq!(quote.surcharges[0].adjustment, Adjustment::Percent { percent: dec!(50) });
        assert_eq!(quote.total.unwrap().low, dec!(375));
    }

    #[test]
    fn extreme_condition_requires_manual_quote() {
        let mut attrs = residential_deep(3);
        attrs.condition = ConditionTier::Extreme;
        let quote = calculate(&table(), &attrs).unwrap();
        assert!(quote.requires_manual_quote);
        assert!(quote.total.is_none());
        assert!(quote.deposit.is_none());
        assert_eq!(
            quote.surcharges[0].adjustment,
            Adjustment::PercentRange { low: dec!(50), high: dec!(100) }
        );
    }

    #[test]
    fn travel_inside_free_radius_is_zero() {
        let mut attrs = residential_deep(1);
        attrs.distance_km = dec!(9.9);
        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.travel, Decimal::ZERO);
        assert_eq!(quote.total, Some(PriceRange::new(dec!(180), dec!(250))));
    }

    #[test]
    fn subscription_supersedes_frequency_discount() {
        let mut attrs = residential_deep(2);
        attrs.frequency = RecurringFrequency::Monthly;
        attrs.subscription = true;
        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.discounts.len(), 1);
        assert_eq!(quote.discounts[0].delta, PriceRange::new(dec!(-37.50), dec!(-52.50)));
        assert_eq!(quote.total, Some(PriceRange::new(dec!(212.50), dec!(297.50))));
    }

    #[test]
    fn commercial_discount_scales_with_visits() {
        let attrs = ServiceAttributes {
            category: ServiceCategory::Commercial,
            service_tier: ServiceTier::Regular,
            size: SizeMetric::FloorAreaSqm(80),
            visits_per_week: Some(3),
            ..residential_deep(1)
        };
        let quote = calculate(&table(), &attrs).unwrap();
        assert_eq!(quote.total, Some(PriceRange::new(dec!(135), dec!(225))));
    }

    #[test]
    fn unknown_combination_and_bad_input_are_rejected() {
        let mut attrs = residential_deep(9);
        assert!(matches!(
            calculate(&table(), &attrs),
            Err(QuoteError::UnknownServiceCombination { .. })
        ));

        attrs = residential_deep(2);
        attrs.size = SizeMetric::FloorAreaSqm(120);
        assert!(matches!(
            calculate(&table(), &attrs),
            Err(QuoteError::UnknownServiceCombination { .. })
        ));

        attrs = residential_deep(2);
        attrs.add_ons.insert("moon-polish".into());
        assert!(matches!(calculate(&table(), &attrs), Err(QuoteError::Validation(_))));

        attrs = residential_deep(2);
        attrs.distance_km = dec!(-1);
        assert!(matches!(calculate(&table(), &attrs), Err(QuoteError::Validation(_))));

        attrs = residential_deep(2);
        attrs.category = ServiceCategory::Airbnb;
        attrs.subscription = true;
        assert!(matches!(calculate(&table(), &attrs), Err(QuoteError::Validation(_))));
    }

    #[test]
    fn identical_input_yields_identical_bytes() {
        let mut attrs = residential_deep(3);
        attrs.add_ons = BTreeSet::from(["fridge".to_string(), "balcony".to_string()]);
        attrs.distance_km = dec!(31);
        let first = serde_json::to_vec(&calculate(&table(), &attrs).unwrap()).unwrap();
        let second = serde_json::to_vec(&calculate(&table(), &attrs).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
