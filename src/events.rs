//! Raw user and event records read from the event store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    AddToCart,
    Purchase,
    BotCommand,
    Message,
    CallbackQuery,
    Click,
    Scroll,
    Other(String),
}

impl EventType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "view" => Self::View,
            "add_to_cart" => Self::AddToCart,
            "purchase" => Self::Purchase,
            "bot_command" => Self::BotCommand,
            "message" => Self::Message,
            "callback_query" => Self::CallbackQuery,
            "click" => Self::Click,
            "scroll" => Self::Scroll,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::View => "view",
            Self::AddToCart => "add_to_cart",
            Self::Purchase => "purchase",
            Self::BotCommand => "bot_command",
            Self::Message => "message",
            Self::CallbackQuery => "callback_query",
            Self::Click => "click",
            Self::Scroll => "scroll",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: i64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub properties: Value,
}

/// Outcome of reading `properties.amount` from a purchase payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PurchaseAmount {
    Absent,
    Valid(f64),
    Malformed,
}

impl Event {
    pub fn new(user_id: i64, event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id,
            event_type,
            timestamp,
            properties: Value::Object(Default::default()),
        }
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    pub fn is_purchase(&self) -> bool {
        self.event_type == EventType::Purchase
    }

    /// Numbers and numeric strings are accepted; anything else is malformed.
    pub fn purchase_amount(&self) -> PurchaseAmount {
        match self.properties.get("amount") {
            None | Some(Value::Null) => PurchaseAmount::Absent,
            Some(Value::Number(n)) => match n.as_f64() {
                Some(v) if v.is_finite() => PurchaseAmount::Valid(v),
                _ => PurchaseAmount::Malformed,
            },
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => PurchaseAmount::Valid(v),
                _ => PurchaseAmount::Malformed,
            },
            Some(_) => PurchaseAmount::Malformed,
        }
    }

    pub fn command(&self) -> Option<&str> {
        self.properties
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub telegram_id: i64,
    pub registration_date: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub last_name: Option<String>,
    pub profile_data: Value,
}

impl User {
    pub fn new(user_id: i64, telegram_id: i64, registration_date: DateTime<Utc>) -> Self {
        Self {
            user_id,
            telegram_id,
            registration_date: Some(registration_date),
            username: None,
            last_name: None,
            profile_data: Value::Object(Default::default()),
        }
    }

    pub fn language_code(&self) -> Option<&str> {
        self.profile_data
            .get("language_code")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn purchase(properties: Value) -> Event {
        Event::new(
            1,
            EventType::Purchase,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
        .with_properties(properties)
    }

    #[test]
    fn parses_known_and_unknown_event_types() {
        assert_eq!(EventType::parse("add_to_cart"), EventType::AddToCart);
        assert_eq!(EventType::parse(" Purchase "), EventType::Purchase);
        assert_eq!(
            EventType::parse("share"),
            EventType::Other("share".to_string())
        );
        assert_eq!(EventType::CallbackQuery.as_str(), "callback_query");
    }

    #[test]
    fn purchase_amount_accepts_numbers_and_numeric_strings() {
        assert_eq!(
            purchase(json!({"amount": 500})).purchase_amount(),
            PurchaseAmount::Valid(500.0)
        );
        assert_eq!(
            purchase(json!({"amount": "12.5"})).purchase_amount(),
            PurchaseAmount::Valid(12.5)
        );
        assert_eq!(purchase(json!({})).purchase_amount(), PurchaseAmount::Absent);
        assert_eq!(
            purchase(json!({"amount": "lots"})).purchase_amount(),
            PurchaseAmount::Malformed
        );
        assert_eq!(
            purchase(json!({"amount": [1, 2]})).purchase_amount(),
            PurchaseAmount::Malformed
        );
    }

    #[test]
    fn language_code_ignores_blank_values() {
        let mut user = User::new(1, 10, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(user.language_code(), None);
        user.profile_data = json!({"language_code": "  "});
        assert_eq!(user.language_code(), None);
        user.profile_data = json!({"language_code": "ru"});
        assert_eq!(user.language_code(), Some("ru"));
    }
}
