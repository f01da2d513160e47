//! General user profile and behaviour features, used for segmentation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventType;
use crate::features::{FeatureError, FeatureExtractor, Spend, UserHistory};
use crate::store::EventStore;
use crate::table::{Cell, FeatureRecord, FeatureSet};
use crate::window;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeatures {
    pub user_id: i64,
    pub telegram_id: i64,

    pub days_since_registration: i64,
    pub has_username: bool,
    pub has_last_name: bool,
    pub language_code: Option<String>,

    pub total_events: usize,
    pub unique_days_active: usize,
    pub avg_events_per_day: f64,
    pub days_since_last_activity: Option<i64>,

    pub bot_commands_count: usize,
    pub messages_count: usize,
    pub callback_queries_count: usize,
    pub unique_commands_count: usize,

    pub avg_session_duration: f64,
    pub peak_hour: u32,
    pub weekend_activity_ratio: f64,

    pub purchase_count: usize,
    pub total_spent: f64,
    pub avg_order_value: f64,

    pub product_views_count: usize,
    pub cart_additions_count: usize,

    pub feature_extraction_date: DateTime<Utc>,
}

const USER_COLUMNS: &[&str] = &[
    "days_since_registration",
    "has_username",
    "has_last_name",
    "language_code",
    "total_events",
    "unique_days_active",
    "avg_events_per_day",
    "days_since_last_activity",
    "bot_commands_count",
    "messages_count",
    "callback_queries_count",
    "unique_commands_count",
    "avg_session_duration",
    "peak_hour",
    "weekend_activity_ratio",
    "purchase_count",
    "total_spent",
    "avg_order_value",
    "product_views_count",
    "cart_additions_count",
];

impl FeatureRecord for UserFeatures {
    const FEATURE_SET: FeatureSet = FeatureSet::User;

    fn columns() -> &'static [&'static str] {
        USER_COLUMNS
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Number(self.days_since_registration as f64),
            Cell::Flag(self.has_username),
            Cell::Flag(self.has_last_name),
            Cell::Category(self.language_code.clone()),
            Cell::count(self.total_events),
            Cell::count(self.unique_days_active),
            Cell::Number(self.avg_events_per_day),
            Cell::recency(self.days_since_last_activity),
            Cell::count(self.bot_commands_count),
            Cell::count(self.messages_count),
            Cell::count(self.callback_queries_count),
            Cell::count(self.unique_commands_count),
            Cell::Number(self.avg_session_duration),
            Cell::Number(f64::from(self.peak_hour)),
            Cell::Number(self.weekend_activity_ratio),
            Cell::count(self.purchase_count),
            Cell::Number(self.total_spent),
            Cell::Number(self.avg_order_value),
            Cell::count(self.product_views_count),
            Cell::count(self.cart_additions_count),
        ]
    }

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn extraction_date(&self) -> DateTime<Utc> {
        self.feature_extraction_date
    }
}

pub struct UserFeatureExtractor {
    store: Arc<dyn EventStore>,
}

impl UserFeatureExtractor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

impl FeatureExtractor for UserFeatureExtractor {
    type Record = UserFeatures;

    fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    fn component(&self) -> &'static str {
        "user_features"
    }

    fn compute(
        &self,
        history: &UserHistory,
        prediction_date: DateTime<Utc>,
    ) -> Result<UserFeatures, FeatureError> {
        let user = &history.user;
        let registered = history.registration_date()?;
        let events = history.as_of(prediction_date);
        let spend = Spend::of(user.user_id, events)?;

        let days_since_registration = window::days_between(registered, prediction_date).max(0);
        let avg_events_per_day = if days_since_registration == 0 {
            events.len() as f64
        } else {
            events.len() as f64 / days_since_registration as f64
        };

        let unique_commands: BTreeSet<&str> = events
            .iter()
            .filter(|e| e.event_type == EventType::BotCommand)
            .filter_map(|e| e.command())
            .collect();

        Ok(UserFeatures {
            user_id: user.user_id,
            telegram_id: user.telegram_id,
            days_since_registration,
            has_username: user.username.as_deref().is_some_and(|u| !u.is_empty()),
            has_last_name: user.last_name.as_deref().is_some_and(|n| !n.is_empty()),
            language_code: user.language_code().map(str::to_string),
            total_events: events.len(),
            unique_days_active: window::unique_days(events),
            avg_events_per_day,
            days_since_last_activity: window::days_since_last(events, prediction_date),
            bot_commands_count: window::count_type(events, &EventType::BotCommand),
            messages_count: window::count_type(events, &EventType::Message),
            callback_queries_count: window::count_type(events, &EventType::CallbackQuery),
            unique_commands_count: unique_commands.len(),
            avg_session_duration: window::avg_session_duration(events),
            peak_hour: window::peak_hour(events),
            weekend_activity_ratio: window::weekend_ratio(events),
            purchase_count: spend.purchases,
            total_spent: spend.total,
            avg_order_value: spend.avg_order_value(),
            product_views_count: window::count_type(events, &EventType::View),
            cart_additions_count: window::count_type(events, &EventType::AddToCart),
            feature_extraction_date: prediction_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, User};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn columns_and_cells_line_up() {
        let t0 = Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap();
        let mut user = User::new(5, 50, t0 - Duration::days(10));
        user.username = Some("ann".to_string());
        user.profile_data = json!({"language_code": "en"});
        let history = UserHistory {
            user,
            events: vec![
                Event::new(5, EventType::BotCommand, t0).with_properties(json!({"command": "/start"})),
                Event::new(5, EventType::BotCommand, t0 + Duration::minutes(1))
                    .with_properties(json!({"command": "/start"})),
                Event::new(5, EventType::BotCommand, t0 + Duration::minutes(2))
                    .with_properties(json!({"command": "/help"})),
            ],
        };

        let extractor = UserFeatureExtractor::new(Arc::new(
            crate::store::SqliteStore::open_in_memory().expect("store opens"),
        ));
        let features = extractor
            .compute(&history, t0 + Duration::hours(1))
            .expect("features compute");

        assert_eq!(features.cells().len(), UserFeatures::columns().len());
        assert_eq!(features.unique_commands_count, 2);
        assert_eq!(features.days_since_registration, 10);
        assert!((features.avg_events_per_day - 0.3).abs() < 1e-12);
        assert!(features.has_username);
        assert!(!features.has_last_name);
        assert_eq!(features.days_since_last_activity, Some(0));
        assert_eq!(features.avg_order_value, 0.0);
    }
}
