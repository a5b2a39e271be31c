//! Cent-exact money helpers shared by pricing, contracts and invoices.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// The business bills in a single currency.
pub const CURRENCY: &str = "AUD";

pub const DEPOSIT_RATE: Decimal = dec!(0.25);

/// Round to the currency's minor unit, half away from zero.
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Deposit for a negotiated single total.
pub fn deposit_for(amount: Decimal) -> Decimal {
    round_cents(amount * DEPOSIT_RATE)
}

/// Amount in cents, as payment processors expect it.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (round_cents(amount) * Decimal::ONE_HUNDRED).to_i64()
}

/// Render `1234.5` as `$1,234.50`.
pub fn format_money(amount: Decimal) -> String {
    let rounded = round_cents(amount);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    let grouped = whole
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    if negative {
        format!("-${grouped}.{cents}")
    } else {
        format!("${grouped}.{cents}")
    }
}

/// Low/high price range carried through every pricing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub low: Decimal,
    pub high: Decimal,
}

impl PriceRange {
    pub fn new(low: Decimal, high: Decimal) -> Self {
        Self { low, high }
    }

    pub fn single(amount: Decimal) -> Self {
        Self {
            low: amount,
            high: amount,
        }
    }

    pub fn zero() -> Self {
        Self::single(Decimal::ZERO)
    }

    /// Scale each end by its own percentage (`+15` means ×1.15) and round to cents.
    pub fn scale_percent(self, low_percent: Decimal, high_percent: Decimal) -> Self {
        Self {
            low: round_cents(self.low * (Decimal::ONE_HUNDRED + low_percent) / Decimal::ONE_HUNDRED),
            high: round_cents(
                self.high * (Decimal::ONE_HUNDRED + high_percent) / Decimal::ONE_HUNDRED,
            ),
        }
    }

    pub fn add(self, other: PriceRange) -> Self {
        Self {
            low: round_cents(self.low + other.low),
            high: round_cents(self.high + other.high),
        }
    }

    pub fn minus(self, other: PriceRange) -> Self {
        Self {
            low: self.low - other.low,
            high: self.high - other.high,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.low <= self.high
    }
}
