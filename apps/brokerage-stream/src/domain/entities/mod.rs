//! Streamed Business Entities
//!
//! Typed views of the records the streaming service pushes. Only the fields
//! needed to identify and validate an entity are typed; everything else is
//! kept verbatim in `extra` so merges never drop data the client does not
//! model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::merge::{
    EntityCollection, Entity, KeyedEntity, MergeError, StreamState, merge_singleton,
};

/// Buy or sell side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuySell {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

// =============================================================================
// Balance
// =============================================================================

/// Client or account balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Balance {
    /// Cash balance in the account currency.
    pub cash_balance: Decimal,
    /// ISO currency code.
    pub currency: String,
    /// Total account value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_value: Option<Decimal>,
    /// Margin available for new trades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_available_for_trading: Option<Decimal>,
    /// Unrealized P&L across open positions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_positions_value: Option<Decimal>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Balance {
    const NAME: &'static str = "Balance";
}

impl StreamState for Balance {
    fn from_snapshot(snapshot: &Value) -> Result<Self, MergeError> {
        merge_singleton(None, snapshot)
    }

    fn apply_delta(&self, payload: &Value) -> Result<Self, MergeError> {
        merge_singleton(Some(self), payload)
    }
}

// =============================================================================
// Price
// =============================================================================

/// Bid/ask quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Quote {
    /// Best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Mid price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<Decimal>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Instrument price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Price {
    /// Universal instrument code.
    pub uic: u64,
    /// Asset type.
    pub asset_type: String,
    /// Current quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    /// Server time of the last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Price {
    const NAME: &'static str = "Price";
}

impl StreamState for Price {
    fn from_snapshot(snapshot: &Value) -> Result<Self, MergeError> {
        merge_singleton(None, snapshot)
    }

    fn apply_delta(&self, payload: &Value) -> Result<Self, MergeError> {
        merge_singleton(Some(self), payload)
    }
}

// =============================================================================
// Order
// =============================================================================

/// Open order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Order {
    /// Order id (collection key).
    pub order_id: String,
    /// Owning account.
    pub account_key: String,
    /// Universal instrument code.
    pub uic: u64,
    /// Asset type.
    pub asset_type: String,
    /// Side.
    pub buy_sell: BuySell,
    /// Order amount.
    pub amount: Decimal,
    /// Limit or stop price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Order status as reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Order type, e.g. `Limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_order_type: Option<String>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Order {
    const NAME: &'static str = "Order";
}

impl KeyedEntity for Order {
    const KEY_FIELD: &'static str = "OrderId";

    fn key(&self) -> &str {
        &self.order_id
    }
}

// =============================================================================
// Position
// =============================================================================

/// Static part of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionBase {
    /// Owning account.
    pub account_key: String,
    /// Universal instrument code.
    pub uic: u64,
    /// Asset type.
    pub asset_type: String,
    /// Signed position amount.
    pub amount: Decimal,
    /// Opening price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    /// Position status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Market-dependent part of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionView {
    /// Current market price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    /// P&L in instrument currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_loss_on_trade: Option<Decimal>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Position {
    /// Position id (collection key).
    pub position_id: String,
    /// Net position this position belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_position_id: Option<String>,
    /// Static fields.
    pub position_base: PositionBase,
    /// Market-dependent fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_view: Option<PositionView>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Position {
    const NAME: &'static str = "Position";
}

impl KeyedEntity for Position {
    const KEY_FIELD: &'static str = "PositionId";

    fn key(&self) -> &str {
        &self.position_id
    }
}

// =============================================================================
// Closed Position
// =============================================================================

/// Details of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClosedPositionDetails {
    /// Owning account.
    pub account_key: String,
    /// Universal instrument code.
    pub uic: u64,
    /// Asset type.
    pub asset_type: String,
    /// Closed amount.
    pub amount: Decimal,
    /// Opening price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    /// Closing price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_price: Option<Decimal>,
    /// Realized P&L.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_loss_on_trade: Option<Decimal>,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClosedPosition {
    /// Unique id (collection key).
    pub closed_position_unique_id: String,
    /// Net position this closing belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_position_id: Option<String>,
    /// Details.
    pub closed_position: ClosedPositionDetails,
    /// Untyped fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for ClosedPosition {
    const NAME: &'static str = "ClosedPosition";
}

impl KeyedEntity for ClosedPosition {
    const KEY_FIELD: &'static str = "ClosedPositionUniqueId";

    fn key(&self) -> &str {
        &self.closed_position_unique_id
    }
}

/// Open orders in server order.
pub type Orders = EntityCollection<Order>;

/// Open positions in server order.
pub type Positions = EntityCollection<Position>;

/// Closed positions in server order.
pub type ClosedPositions = EntityCollection<ClosedPosition>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn order(id: &str, amount: u32) -> Value {
        json!({
            "OrderId": id,
            "AccountKey": "acc",
            "Uic": 21,
            "AssetType": "FxSpot",
            "BuySell": "Buy",
            "Amount": amount,
            "Status": "Working",
            "Duration": {"DurationType": "GoodTillCancel"}
        })
    }

    #[test]
    fn balance_delta_merges_onto_snapshot() {
        let balance = Balance::from_snapshot(&json!({
            "CashBalance": 1000.5,
            "Currency": "USD",
            "TotalValue": 1200,
            "TransactionsNotBooked": 0
        }))
        .unwrap();

        let next = balance.apply_delta(&json!({"CashBalance": 990})).unwrap();

        assert_eq!(next.cash_balance, dec("990"));
        assert_eq!(next.total_value, Some(dec("1200")));
        assert_eq!(next.currency, "USD");
        assert_eq!(next.extra.get("TransactionsNotBooked"), Some(&json!(0)));
    }

    #[test]
    fn balance_without_currency_fails_validation() {
        let err = Balance::from_snapshot(&json!({"CashBalance": 1})).unwrap_err();
        assert!(err.diagnostics[0].starts_with("Balance failed validation"));
    }

    #[test]
    fn price_quote_merges_nested_fields() {
        let price = Price::from_snapshot(&json!({
            "Uic": 21,
            "AssetType": "FxSpot",
            "Quote": {"Bid": 1.1, "Ask": 1.2, "Amount": 100000},
            "LastUpdated": "2026-10-19T08:00:00Z"
        }))
        .unwrap();

        let next = price.apply_delta(&json!({"Quote": {"Ask": 1.25}})).unwrap();
        let quote = next.quote.unwrap();

        assert_eq!(quote.bid, Some(dec("1.1")));
        assert_eq!(quote.ask, Some(dec("1.25")));
        assert_eq!(quote.extra.get("Amount"), Some(&json!(100_000)));
    }

    #[test]
    fn orders_snapshot_then_delta() {
        let orders = Orders::from_snapshot(&json!({"Data": [order("1", 10), order("2", 20)]})).unwrap();
        let next = orders
            .apply_delta(&json!([
                {"OrderId": "1", "Amount": 15},
                {"OrderId": "2", "__meta_deleted": true},
                order("3", 30)
            ]))
            .unwrap();

        let ids: Vec<_> = next.keys().collect();
        assert_eq!(ids, vec!["1", "3"]);
        let first = next.get("1").unwrap();
        assert_eq!(first.amount, dec("15"));
        assert_eq!(first.buy_sell, BuySell::Buy);
        assert_eq!(
            first.extra.get("Duration"),
            Some(&json!({"DurationType": "GoodTillCancel"}))
        );
    }

    #[test]
    fn orders_delta_as_bare_record_is_rejected() {
        let orders = Orders::from_snapshot(&json!([order("o1", 10)])).unwrap();

        let err = orders
            .apply_delta(&json!({"OrderId": "o1", "Amount": 2}))
            .unwrap_err();

        assert!(err.diagnostics[0].contains("Data array"));
        assert_eq!(orders.get("o1").map(|o| o.amount), Some(dec("10")));
    }

    #[test]
    fn position_view_patch_keeps_base() {
        let positions = Positions::from_snapshot(&json!([{
            "PositionId": "p1",
            "NetPositionId": "21__FxSpot",
            "PositionBase": {"AccountKey": "acc", "Uic": 21, "AssetType": "FxSpot", "Amount": 5000},
            "PositionView": {"CurrentPrice": 1.1, "ProfitLossOnTrade": 3}
        }]))
        .unwrap();

        let next = positions
            .apply_delta(&json!([{"PositionId": "p1", "PositionView": {"CurrentPrice": 1.2}}]))
            .unwrap();
        let position = next.get("p1").unwrap();

        assert_eq!(position.position_base.amount, dec("5000"));
        let view = position.position_view.as_ref().unwrap();
        assert_eq!(view.current_price, Some(dec("1.2")));
        assert_eq!(view.profit_loss_on_trade, Some(dec("3")));
    }

    #[test]
    fn closed_position_requires_details() {
        let err = ClosedPositions::from_snapshot(&json!([{"ClosedPositionUniqueId": "c1"}]))
            .unwrap_err();
        assert!(err.diagnostics[0].contains("new ClosedPosition c1 failed validation"));
    }
}
