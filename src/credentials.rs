//! Broker API keys kept in the operating system keychain.
//!
//! Configuration only ever reads environment variables. The keychain is a
//! second source: [`Keychain::export_to_env`] fills in whatever the shell
//! did not set, once, before the async runtime starts.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::broker::BrokerKind;
use crate::{ChartfeedError, Result};

/// A secret one of the brokers needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKey {
    AlpacaApiKey,
    AlpacaApiSecret,
    FinnhubApiKey,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 3] = [
        Self::AlpacaApiKey,
        Self::AlpacaApiSecret,
        Self::FinnhubApiKey,
    ];

    /// Broker the secret belongs to.
    #[must_use]
    pub fn broker(self) -> BrokerKind {
        match self {
            Self::AlpacaApiKey | Self::AlpacaApiSecret => BrokerKind::Alpaca,
            Self::FinnhubApiKey => BrokerKind::Finnhub,
        }
    }

    /// Variable read by [`crate::config::read_config`].
    #[must_use]
    pub fn env_var(self) -> &'static str {
        match self {
            Self::AlpacaApiKey => "ALPACA_API_KEY",
            Self::AlpacaApiSecret => "ALPACA_API_SECRET",
            Self::FinnhubApiKey => "FINNHUB_API_KEY",
        }
    }

    /// Keychain account name: the variable name in lower case.
    fn account(self) -> String {
        self.env_var().to_ascii_lowercase()
    }
}

/// One keychain service holding every broker secret.
#[derive(Clone, Copy, Debug)]
pub struct Keychain {
    service: &'static str,
}

impl Default for Keychain {
    fn default() -> Self {
        Self { service: "chartfeed" }
    }
}

impl Keychain {
    fn entry(self, key: CredentialKey) -> Result<keyring::Entry> {
        keyring::Entry::new(self.service, &key.account())
            .map_err(|e| ChartfeedError::Config(format!("keychain entry {}: {e}", key.env_var())))
    }

    /// Reads a secret. Missing entries and keychain failures both yield
    /// `None`; failures are logged.
    #[must_use]
    pub fn load(self, key: CredentialKey) -> Option<Zeroizing<String>> {
        let entry = match self.entry(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };
        match entry.get_password() {
            Ok(secret) => Some(Zeroizing::new(secret)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key = key.env_var(), error = %e, "Keychain read failed");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ChartfeedError::Config`] if the keychain rejects the write.
    pub fn save(self, key: CredentialKey, secret: &str) -> Result<()> {
        self.entry(key)?
            .set_password(secret)
            .map_err(|e| ChartfeedError::Config(format!("keychain write {}: {e}", key.env_var())))
    }

    #[must_use]
    pub fn is_set(self, key: CredentialKey) -> bool {
        self.load(key).is_some()
    }

    /// Keys of `broker` that are neither in the environment nor stored.
    #[must_use]
    pub fn missing(self, broker: BrokerKind) -> Vec<CredentialKey> {
        CredentialKey::ALL
            .into_iter()
            .filter(|key| key.broker() == broker)
            .filter(|key| std::env::var_os(key.env_var()).is_none() && !self.is_set(*key))
            .collect()
    }

    /// Copies stored secrets into unset environment variables.
    ///
    /// Must run before any other thread exists.
    pub fn export_to_env(self) {
        for key in CredentialKey::ALL {
            if std::env::var_os(key.env_var()).is_some() {
                continue;
            }
            if let Some(secret) = self.load(key) {
                debug!(key = key.env_var(), "Exporting keychain secret");
                // SAFETY: called from main before the runtime spawns threads.
                unsafe {
                    std::env::set_var(key.env_var(), secret.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_follow_env_var_names() {
        let accounts: Vec<_> = CredentialKey::ALL.iter().map(|k| k.account()).collect();
        assert_eq!(
            accounts,
            ["alpaca_api_key", "alpaca_api_secret", "finnhub_api_key"]
        );
    }

    #[test]
    fn every_broker_has_a_key() {
        for broker in BrokerKind::ALL {
            assert!(CredentialKey::ALL.iter().any(|k| k.broker() == broker), "{broker}");
        }
        assert_eq!(CredentialKey::AlpacaApiSecret.broker(), BrokerKind::Alpaca);
    }
}
