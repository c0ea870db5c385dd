//! Trade condition semantics.
//!
//! Providers tag every trade print with condition codes (odd lot, form T,
//! average price, ...). [`TradeContext`] folds them into a flag set with a
//! bitwise-OR merge, so the order in which codes are combined never
//! matters and repeating a code changes nothing. Flags are phrased as
//! inhibitions: a single code that must not move the last price wins over
//! any number of regular-sale codes.

use std::ops::{BitOr, BitOrAssign};

use tracing::warn;

/// Composable set of trade condition flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TradeContext(u8);

impl TradeContext {
    /// A regular trade: updates last, high/low and volume.
    pub const REGULAR: Self = Self(0);
    /// Must not update the last price.
    pub const SKIP_LAST: Self = Self(1);
    /// Must not update the session high/low.
    pub const SKIP_HIGH_LOW: Self = Self(1 << 1);
    /// Must not add to the volume.
    pub const SKIP_VOLUME: Self = Self(1 << 2);
    /// Executed outside regular trading hours.
    pub const EXTENDED_HOURS: Self = Self(1 << 3);
    /// Smaller than a round lot.
    pub const ODD_LOT: Self = Self(1 << 4);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Merges another context into this one.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        self | other
    }

    /// Whether this trade may move the last price shown to the user.
    #[must_use]
    pub fn updates_last(self) -> bool {
        !self.contains(Self::SKIP_LAST)
    }

    #[must_use]
    pub fn updates_high_low(self) -> bool {
        !self.contains(Self::SKIP_HIGH_LOW)
    }

    #[must_use]
    pub fn updates_volume(self) -> bool {
        !self.contains(Self::SKIP_VOLUME)
    }

    #[must_use]
    pub fn is_extended_hours(self) -> bool {
        self.contains(Self::EXTENDED_HOURS)
    }

    #[must_use]
    pub fn is_odd_lot(self) -> bool {
        self.contains(Self::ODD_LOT)
    }

    /// Builds a context from provider condition codes using `table`.
    /// Unknown codes are logged and ignored.
    pub fn from_conditions<I, S>(table: ConditionTable, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        codes
            .into_iter()
            .fold(Self::REGULAR, |context, code| match table.lookup(code.as_ref()) {
                Some(flags) => context | flags,
                None => {
                    warn!(
                        table = table.as_str(),
                        code = code.as_ref(),
                        "Unknown trade condition code"
                    );
                    context
                }
            })
    }
}

impl BitOr for TradeContext {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TradeContext {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

const NO_LAST_NO_HIGH_LOW: TradeContext =
    TradeContext(TradeContext::SKIP_LAST.0 | TradeContext::SKIP_HIGH_LOW.0);
const NOTHING: TradeContext = TradeContext(
    TradeContext::SKIP_LAST.0 | TradeContext::SKIP_HIGH_LOW.0 | TradeContext::SKIP_VOLUME.0,
);

/// Alpaca (CTA/UTP letter codes) condition table.
const ALPACA_CONDITIONS: &[(&str, TradeContext)] = &[
    (" ", TradeContext::REGULAR),
    ("@", TradeContext::REGULAR),
    ("A", TradeContext::REGULAR),
    ("B", TradeContext::REGULAR),
    ("C", NO_LAST_NO_HIGH_LOW),
    ("D", TradeContext::REGULAR),
    ("E", TradeContext::REGULAR),
    ("F", TradeContext::REGULAR),
    ("G", TradeContext::SKIP_LAST),
    ("H", NO_LAST_NO_HIGH_LOW),
    (
        "I",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::ODD_LOT.0),
    ),
    ("K", TradeContext::REGULAR),
    ("L", TradeContext::REGULAR),
    ("M", NOTHING),
    ("N", NO_LAST_NO_HIGH_LOW),
    ("O", TradeContext::REGULAR),
    ("P", TradeContext::SKIP_LAST),
    ("Q", NOTHING),
    ("R", NO_LAST_NO_HIGH_LOW),
    ("S", TradeContext::REGULAR),
    (
        "T",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::EXTENDED_HOURS.0),
    ),
    (
        "U",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::EXTENDED_HOURS.0),
    ),
    ("V", NO_LAST_NO_HIGH_LOW),
    ("W", NO_LAST_NO_HIGH_LOW),
    ("X", TradeContext::REGULAR),
    ("Y", TradeContext::REGULAR),
    ("Z", TradeContext::SKIP_LAST),
    ("1", TradeContext::REGULAR),
    ("4", TradeContext::SKIP_LAST),
    ("5", TradeContext::REGULAR),
    ("6", TradeContext::REGULAR),
    ("7", NO_LAST_NO_HIGH_LOW),
    ("8", TradeContext::REGULAR),
    ("9", TradeContext::SKIP_VOLUME),
];

/// Finnhub (numeric codes) condition table.
const FINNHUB_CONDITIONS: &[(&str, TradeContext)] = &[
    ("0", TradeContext::REGULAR),
    ("1", TradeContext::REGULAR),
    ("2", NO_LAST_NO_HIGH_LOW),
    ("3", TradeContext::REGULAR),
    ("4", TradeContext::REGULAR),
    ("5", TradeContext::SKIP_LAST),
    ("6", TradeContext::REGULAR),
    ("7", NO_LAST_NO_HIGH_LOW),
    ("8", TradeContext::REGULAR),
    ("9", TradeContext::REGULAR),
    ("10", TradeContext::SKIP_LAST),
    ("11", TradeContext::REGULAR),
    (
        "12",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::EXTENDED_HOURS.0),
    ),
    (
        "13",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::EXTENDED_HOURS.0),
    ),
    ("14", TradeContext::REGULAR),
    ("15", NOTHING),
    ("16", NOTHING),
    ("17", TradeContext::REGULAR),
    ("18", TradeContext::REGULAR),
    ("19", TradeContext::REGULAR),
    ("20", NO_LAST_NO_HIGH_LOW),
    ("21", NO_LAST_NO_HIGH_LOW),
    ("22", TradeContext::SKIP_LAST),
    ("23", TradeContext::REGULAR),
    ("24", TradeContext::REGULAR),
    ("25", TradeContext::REGULAR),
    ("27", TradeContext::REGULAR),
    ("28", TradeContext::REGULAR),
    ("29", NO_LAST_NO_HIGH_LOW),
    ("30", TradeContext::REGULAR),
    ("33", TradeContext::SKIP_LAST),
    ("34", TradeContext::REGULAR),
    ("35", NO_LAST_NO_HIGH_LOW),
    ("36", TradeContext::REGULAR),
    (
        "37",
        TradeContext(NO_LAST_NO_HIGH_LOW.0 | TradeContext::ODD_LOT.0),
    ),
    ("38", TradeContext::SKIP_VOLUME),
    ("41", TradeContext::REGULAR),
    ("52", NO_LAST_NO_HIGH_LOW),
    ("53", NO_LAST_NO_HIGH_LOW),
];

/// Provider-specific condition code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionTable {
    Alpaca,
    Finnhub,
}

impl ConditionTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alpaca => "alpaca",
            Self::Finnhub => "finnhub",
        }
    }

    /// Flags for a single code, or `None` if the code is unknown.
    #[must_use]
    pub fn lookup(self, code: &str) -> Option<TradeContext> {
        let table = match self {
            Self::Alpaca => ALPACA_CONDITIONS,
            Self::Finnhub => FINNHUB_CONDITIONS,
        };
        table
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, flags)| *flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combination_is_commutative() {
        let forward = TradeContext::from_conditions(ConditionTable::Finnhub, ["1", "2"]);
        let reverse = TradeContext::from_conditions(ConditionTable::Finnhub, ["2", "1"]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn combination_is_idempotent() {
        let once = TradeContext::from_conditions(ConditionTable::Finnhub, ["12"]);
        let twice = TradeContext::from_conditions(ConditionTable::Finnhub, ["12", "12"]);
        assert_eq!(once, twice);
        assert_eq!(once.combine(once), once);
    }

    #[test]
    fn inhibiting_code_wins() {
        let context = TradeContext::from_conditions(ConditionTable::Alpaca, ["@", "I"]);
        assert!(!context.updates_last());
        assert!(!context.updates_high_low());
        assert!(context.updates_volume());
        assert!(context.is_odd_lot());
    }

    #[test]
    fn regular_sale_updates_everything() {
        let context = TradeContext::from_conditions(ConditionTable::Alpaca, ["@"]);
        assert!(context.updates_last());
        assert!(context.updates_high_low());
        assert!(context.updates_volume());
        assert!(!context.is_extended_hours());
    }

    #[test]
    fn form_t_is_extended_hours() {
        let context = TradeContext::from_conditions(ConditionTable::Alpaca, ["@", "T"]);
        assert!(context.is_extended_hours());
        assert!(!context.updates_last());
    }

    #[test]
    fn unknown_codes_are_ignored() {
        let context = TradeContext::from_conditions(ConditionTable::Alpaca, ["@", "?!"]);
        assert_eq!(context, TradeContext::REGULAR);
        assert!(ConditionTable::Finnhub.lookup("999").is_none());
    }

    #[test]
    fn empty_conditions_are_regular() {
        let context = TradeContext::from_conditions(ConditionTable::Finnhub, Vec::<String>::new());
        assert!(context.updates_last());
    }
}
