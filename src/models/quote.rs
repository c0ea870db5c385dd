//! Price snapshot model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest price of an asset relative to the previous session's close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteData {
    pub current_price: Decimal,
    pub previous_close_price: Decimal,
    /// Change since the previous close, in percent.
    pub delta_percentage: Decimal,
}

impl QuoteData {
    /// Builds a quote, deriving the delta from the two prices.
    #[must_use]
    pub fn from_prices(current_price: Decimal, previous_close_price: Decimal) -> Self {
        Self {
            current_price,
            previous_close_price,
            delta_percentage: delta_percentage(current_price, previous_close_price),
        }
    }
}

/// `(current - previous) / previous * 100`, or zero when there is no
/// previous price to compare against.
#[must_use]
pub fn delta_percentage(current: Decimal, previous: Decimal) -> Decimal {
    if previous.is_zero() {
        return Decimal::ZERO;
    }
    (current - previous) / previous * Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn derives_delta() {
        let quote = QuoteData::from_prices(dec!(125.91), dec!(126.85));
        assert_eq!(quote.delta_percentage.round_dp(2), dec!(-0.74));
    }

    #[test]
    fn zero_previous_close_yields_zero_delta() {
        assert_eq!(delta_percentage(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }
}
