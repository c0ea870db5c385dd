//! Tradable instrument identity.

use serde::{Deserialize, Serialize};

/// A tradable instrument as seen by one broker.
///
/// Broker-native identifiers are not portable, so the same real-world
/// instrument is recognised across brokers by its [`figi`](Self::figi).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetData {
    pub symbol: String,
    pub name: String,
    /// Lowercased, punctuation-free form of `name` used for search.
    pub name_normalized: String,
    /// Market identifier code of the primary listing (e.g. `XNAS`).
    pub mic: String,
    pub currency: String,
    pub figi: String,
    pub tradable: bool,
}

impl AssetData {
    /// Creates an asset, deriving the normalized name.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        name: impl Into<String>,
        mic: impl Into<String>,
        currency: impl Into<String>,
        figi: impl Into<String>,
        tradable: bool,
    ) -> Self {
        let name = name.into();
        Self {
            symbol: symbol.into(),
            name_normalized: normalize_name(&name),
            name,
            mic: mic.into(),
            currency: currency.into(),
            figi: figi.into(),
            tradable,
        }
    }

    /// Returns a copy carrying a different Figi.
    #[must_use]
    pub fn with_figi(mut self, figi: impl Into<String>) -> Self {
        self.figi = figi.into();
        self
    }

    /// Returns `true` if both values describe the same instrument.
    #[must_use]
    pub fn same_instrument(&self, other: &AssetData) -> bool {
        !self.figi.is_empty() && self.figi == other.figi
    }

    /// Returns `true` if `query` matches the symbol exactly (ignoring case)
    /// or appears in the normalized company name.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        if self.symbol.eq_ignore_ascii_case(query) {
            return true;
        }
        let query = normalize_name(query);
        !query.is_empty() && self.name_normalized.contains(&query)
    }
}

/// Lowercases and strips everything but letters, digits and single spaces.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_company_names() {
        assert_eq!(normalize_name("Apple Inc."), "apple inc");
        assert_eq!(normalize_name("  AT&T  INC "), "at t inc");
    }

    #[test]
    fn matches_symbol_or_name() {
        let asset = AssetData::new("AAPL", "Apple Inc.", "XNAS", "USD", "BBG000B9XRY4", true);
        assert!(asset.matches("aapl"));
        assert!(asset.matches("APPLE"));
        assert!(!asset.matches("AAP"));
        assert!(!asset.matches("..."));
    }

    #[test]
    fn identity_is_figi() {
        let alpaca = AssetData::new("AAPL", "Apple Inc.", "XNAS", "USD", "BBG000B9XRY4", true);
        let finnhub = AssetData::new("AAPL", "APPLE INC", "XNAS", "USD", "BBG000B9XRY4", true);
        assert!(alpaca.same_instrument(&finnhub));
        assert!(!alpaca.same_instrument(&finnhub.clone().with_figi("")));
    }
}
