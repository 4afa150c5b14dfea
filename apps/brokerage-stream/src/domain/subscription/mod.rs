//! Subscription Domain
//!
//! What a streaming context subscribes to, and how subscriptions are named on
//! the wire.
//!
//! # Reference ids
//!
//! The client assigns every subscription a reference id of the form
//! `{kind}_{sequence}`. The sequence grows monotonically within a context, so a
//! resubscription always gets a fresh id, and the kind of any reference the
//! server mentions can be recovered even after the client has forgotten it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// =============================================================================
// Subscription Kind
// =============================================================================

/// Kind of data a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Client or account balance (singleton).
    Balance,
    /// Open orders (keyed by `OrderId`).
    Orders,
    /// Open positions (keyed by `PositionId`).
    Positions,
    /// Closed positions (keyed by `ClosedPositionUniqueId`).
    ClosedPositions,
    /// Instrument price (singleton).
    Price,
}

impl SubscriptionKind {
    /// All kinds, in subscription order.
    pub const ALL: [Self; 5] = [
        Self::Balance,
        Self::Orders,
        Self::Positions,
        Self::ClosedPositions,
        Self::Price,
    ];

    /// Prefix used in reference ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Orders => "orders",
            Self::Positions => "positions",
            Self::ClosedPositions => "closedpositions",
            Self::Price => "price",
        }
    }

    /// Whether the kind streams a keyed entity collection.
    #[must_use]
    pub const fn is_collection(self) -> bool {
        matches!(self, Self::Orders | Self::Positions | Self::ClosedPositions)
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Reference Id
// =============================================================================

/// Client-assigned subscription reference id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    /// Longest reference id the service accepts.
    pub const MAX_LEN: usize = 50;

    /// Build the reference id for the `sequence`-th subscription of `kind`.
    #[must_use]
    pub fn generate(kind: SubscriptionKind, sequence: u64) -> Self {
        Self(format!("{}_{sequence}", kind.as_str()))
    }

    /// Wrap a reference id received from the server.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the kind from a client-assigned id.
    #[must_use]
    pub fn kind(&self) -> Option<SubscriptionKind> {
        let (prefix, sequence) = self.0.rsplit_once('_')?;
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        SubscriptionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == prefix)
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl PartialEq<str> for ReferenceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// Tradable instrument identified by its universal instrument code and asset type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    /// Universal instrument code.
    pub uic: u64,
    /// Asset type, e.g. `FxSpot` or `Stock`.
    pub asset_type: String,
}

impl Instrument {
    /// Create a new instrument key.
    #[must_use]
    pub fn new(uic: u64, asset_type: impl Into<String>) -> Self {
        Self {
            uic,
            asset_type: asset_type.into(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uic, self.asset_type)
    }
}

/// Error parsing an `uic:AssetType` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instrument '{0}', expected uic:AssetType")]
pub struct InstrumentParseError(pub String);

impl FromStr for Instrument {
    type Err = InstrumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uic, asset_type) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| InstrumentParseError(s.to_string()))?;
        let uic = uic
            .trim()
            .parse()
            .map_err(|_| InstrumentParseError(s.to_string()))?;
        let asset_type = asset_type.trim();
        if asset_type.is_empty() {
            return Err(InstrumentParseError(s.to_string()));
        }
        Ok(Self::new(uic, asset_type))
    }
}

// =============================================================================
// Subscription Scope
// =============================================================================

/// Scope keys identifying one logical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Balance for the whole client, or for one account when `account_key` is set.
    Balance {
        /// Client key.
        client_key: String,
        /// Account key for per-account balances.
        account_key: Option<String>,
    },
    /// Open orders for the client.
    Orders {
        /// Client key.
        client_key: String,
    },
    /// Open positions for the client.
    Positions {
        /// Client key.
        client_key: String,
    },
    /// Closed positions for the client.
    ClosedPositions {
        /// Client key.
        client_key: String,
    },
    /// Price for one instrument.
    Price {
        /// Instrument.
        instrument: Instrument,
    },
}

impl SubscriptionScope {
    /// Kind of data this scope streams.
    #[must_use]
    pub const fn kind(&self) -> SubscriptionKind {
        match self {
            Self::Balance { .. } => SubscriptionKind::Balance,
            Self::Orders { .. } => SubscriptionKind::Orders,
            Self::Positions { .. } => SubscriptionKind::Positions,
            Self::ClosedPositions { .. } => SubscriptionKind::ClosedPositions,
            Self::Price { .. } => SubscriptionKind::Price,
        }
    }

    /// Subscription arguments as sent to the subscribe endpoint.
    #[must_use]
    pub fn arguments(&self) -> Value {
        match self {
            Self::Balance {
                client_key,
                account_key: Some(account_key),
            } => json!({ "ClientKey": client_key, "AccountKey": account_key }),
            Self::Balance {
                client_key,
                account_key: None,
            }
            | Self::Orders { client_key }
            | Self::Positions { client_key }
            | Self::ClosedPositions { client_key } => json!({ "ClientKey": client_key }),
            Self::Price { instrument } => {
                json!({ "Uic": instrument.uic, "AssetType": instrument.asset_type })
            }
        }
    }
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Balance {
                account_key: Some(account_key),
                ..
            } => write!(f, "balance[{account_key}]"),
            Self::Price { instrument } => write!(f, "price[{instrument}]"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

// =============================================================================
// Stream Request
// =============================================================================

/// Everything a context should subscribe to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// Client key owning the accounts.
    pub client_key: String,
    /// Accounts to stream individual balances for.
    pub account_keys: Vec<String>,
    /// Instruments to stream prices for.
    pub instruments: Vec<Instrument>,
}

impl StreamRequest {
    /// Create a request for a client with no per-account balances or prices.
    #[must_use]
    pub fn new(client_key: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            ..Self::default()
        }
    }

    /// Add per-account balance subscriptions.
    #[must_use]
    pub fn with_accounts<I, S>(mut self, account_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.account_keys.extend(account_keys.into_iter().map(Into::into));
        self
    }

    /// Add price subscriptions.
    #[must_use]
    pub fn with_instruments(mut self, instruments: impl IntoIterator<Item = Instrument>) -> Self {
        self.instruments.extend(instruments);
        self
    }

    /// Scopes in the fixed establishment order: client balance, account
    /// balances, orders, positions, closed positions, prices.
    #[must_use]
    pub fn scopes(&self) -> Vec<SubscriptionScope> {
        let client_key = &self.client_key;
        let mut scopes = Vec::with_capacity(4 + self.account_keys.len() + self.instruments.len());

        scopes.push(SubscriptionScope::Balance {
            client_key: client_key.clone(),
            account_key: None,
        });
        scopes.extend(
            self.account_keys
                .iter()
                .map(|account_key| SubscriptionScope::Balance {
                    client_key: client_key.clone(),
                    account_key: Some(account_key.clone()),
                }),
        );
        scopes.push(SubscriptionScope::Orders {
            client_key: client_key.clone(),
        });
        scopes.push(SubscriptionScope::Positions {
            client_key: client_key.clone(),
        });
        scopes.push(SubscriptionScope::ClosedPositions {
            client_key: client_key.clone(),
        });
        scopes.extend(
            self.instruments
                .iter()
                .map(|instrument| SubscriptionScope::Price {
                    instrument: instrument.clone(),
                }),
        );
        scopes
    }
}
