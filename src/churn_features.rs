//! Features for predicting churn, defined as no events at all in the 30 days
//! after the prediction date.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventType};
use crate::features::{
    FeatureError, FeatureExtractor, LabelledExtractor, Spend, UserHistory,
    PREDICTION_HORIZON_DAYS,
};
use crate::store::EventStore;
use crate::table::{Cell, FeatureRecord, FeatureSet};
use crate::window::{self, last_days};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnPredictionFeatures {
    pub user_id: i64,
    pub telegram_id: i64,

    pub days_since_registration: i64,
    pub total_events: usize,
    pub unique_days_active: usize,

    pub events_last_7_days: usize,
    pub events_last_14_days: usize,
    pub events_last_30_days: usize,
    pub events_last_60_days: usize,
    pub unique_days_active_last_7_days: usize,
    pub unique_days_active_last_14_days: usize,
    pub unique_days_active_last_30_days: usize,
    pub unique_days_active_last_60_days: usize,

    pub activity_drop_7d_vs_14d: f64,
    pub activity_drop_14d_vs_30d: f64,
    pub activity_drop_30d_vs_60d: f64,

    pub avg_days_between_sessions: f64,
    pub max_days_between_sessions: f64,
    pub days_since_last_activity: Option<i64>,

    pub bot_commands_last_7_days: usize,
    pub bot_commands_last_14_days: usize,
    pub bot_commands_last_30_days: usize,
    pub messages_last_7_days: usize,
    pub messages_last_14_days: usize,
    pub messages_last_30_days: usize,
    pub callback_queries_last_7_days: usize,
    pub callback_queries_last_14_days: usize,
    pub callback_queries_last_30_days: usize,

    pub product_views_last_7_days: usize,
    pub product_views_last_14_days: usize,
    pub product_views_last_30_days: usize,
    pub cart_additions_last_7_days: usize,
    pub cart_additions_last_14_days: usize,
    pub cart_additions_last_30_days: usize,

    pub total_purchases: usize,
    pub purchases_last_7_days: usize,
    pub purchases_last_14_days: usize,
    pub purchases_last_30_days: usize,
    pub purchases_last_60_days: usize,
    pub total_spent: f64,
    pub avg_order_value: f64,
    pub days_since_last_purchase: Option<i64>,

    pub avg_session_duration_last_7_days: f64,
    pub avg_session_duration_last_14_days: f64,
    pub avg_session_duration_last_30_days: f64,
    pub session_count_last_7_days: usize,
    pub session_count_last_14_days: usize,
    pub session_count_last_30_days: usize,

    pub session_duration_trend: f64,
    pub engagement_trend: f64,
    pub purchase_trend: f64,

    pub peak_hour: u32,
    pub weekend_activity_ratio: f64,
    pub weekday_activity_ratio: f64,

    pub repeat_purchase_ratio: f64,
    pub avg_days_between_purchases: Option<f64>,
    pub customer_lifetime_value: f64,

    pub feature_extraction_date: DateTime<Utc>,
    pub churn_definition_days: i64,
}

const CHURN_COLUMNS: &[&str] = &[
    "days_since_registration",
    "total_events",
    "unique_days_active",
    "events_last_7_days",
    "events_last_14_days",
    "events_last_30_days",
    "events_last_60_days",
    "unique_days_active_last_7_days",
    "unique_days_active_last_14_days",
    "unique_days_active_last_30_days",
    "unique_days_active_last_60_days",
    "activity_drop_7d_vs_14d",
    "activity_drop_14d_vs_30d",
    "activity_drop_30d_vs_60d",
    "avg_days_between_sessions",
    "max_days_between_sessions",
    "days_since_last_activity",
    "bot_commands_last_7_days",
    "bot_commands_last_14_days",
    "bot_commands_last_30_days",
    "messages_last_7_days",
    "messages_last_14_days",
    "messages_last_30_days",
    "callback_queries_last_7_days",
    "callback_queries_last_14_days",
    "callback_queries_last_30_days",
    "product_views_last_7_days",
    "product_views_last_14_days",
    "product_views_last_30_days",
    "cart_additions_last_7_days",
    "cart_additions_last_14_days",
    "cart_additions_last_30_days",
    "total_purchases",
    "purchases_last_7_days",
    "purchases_last_14_days",
    "purchases_last_30_days",
    "purchases_last_60_days",
    "total_spent",
    "avg_order_value",
    "days_since_last_purchase",
    "avg_session_duration_last_7_days",
    "avg_session_duration_last_14_days",
    "avg_session_duration_last_30_days",
    "session_count_last_7_days",
    "session_count_last_14_days",
    "session_count_last_30_days",
    "session_duration_trend",
    "engagement_trend",
    "purchase_trend",
    "peak_hour",
    "weekend_activity_ratio",
    "weekday_activity_ratio",
    "repeat_purchase_ratio",
    "avg_days_between_purchases",
    "customer_lifetime_value",
];

impl FeatureRecord for ChurnPredictionFeatures {
    const FEATURE_SET: FeatureSet = FeatureSet::ChurnPrediction;

    fn columns() -> &'static [&'static str] {
        CHURN_COLUMNS
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Number(self.days_since_registration as f64),
            Cell::count(self.total_events),
            Cell::count(self.unique_days_active),
            Cell::count(self.events_last_7_days),
            Cell::count(self.events_last_14_days),
            Cell::count(self.events_last_30_days),
            Cell::count(self.events_last_60_days),
            Cell::count(self.unique_days_active_last_7_days),
            Cell::count(self.unique_days_active_last_14_days),
            Cell::count(self.unique_days_active_last_30_days),
            Cell::count(self.unique_days_active_last_60_days),
            Cell::Number(self.activity_drop_7d_vs_14d),
            Cell::Number(self.activity_drop_14d_vs_30d),
            Cell::Number(self.activity_drop_30d_vs_60d),
            Cell::Number(self.avg_days_between_sessions),
            Cell::Number(self.max_days_between_sessions),
            Cell::recency(self.days_since_last_activity),
            Cell::count(self.bot_commands_last_7_days),
            Cell::count(self.bot_commands_last_14_days),
            Cell::count(self.bot_commands_last_30_days),
            Cell::count(self.messages_last_7_days),
            Cell::count(self.messages_last_14_days),
            Cell::count(self.messages_last_30_days),
            Cell::count(self.callback_queries_last_7_days),
            Cell::count(self.callback_queries_last_14_days),
            Cell::count(self.callback_queries_last_30_days),
            Cell::count(self.product_views_last_7_days),
            Cell::count(self.product_views_last_14_days),
            Cell::count(self.product_views_last_30_days),
            Cell::count(self.cart_additions_last_7_days),
            Cell::count(self.cart_additions_last_14_days),
            Cell::count(self.cart_additions_last_30_days),
            Cell::count(self.total_purchases),
            Cell::count(self.purchases_last_7_days),
            Cell::count(self.purchases_last_14_days),
            Cell::count(self.purchases_last_30_days),
            Cell::count(self.purchases_last_60_days),
            Cell::Number(self.total_spent),
            Cell::Number(self.avg_order_value),
            Cell::recency(self.days_since_last_purchase),
            Cell::Number(self.avg_session_duration_last_7_days),
            Cell::Number(self.avg_session_duration_last_14_days),
            Cell::Number(self.avg_session_duration_last_30_days),
            Cell::count(self.session_count_last_7_days),
            Cell::count(self.session_count_last_14_days),
            Cell::count(self.session_count_last_30_days),
            Cell::Number(self.session_duration_trend),
            Cell::Number(self.engagement_trend),
            Cell::Number(self.purchase_trend),
            Cell::Number(f64::from(self.peak_hour)),
            Cell::Number(self.weekend_activity_ratio),
            Cell::Number(self.weekday_activity_ratio),
            Cell::Number(self.repeat_purchase_ratio),
            Cell::recency_f64(self.avg_days_between_purchases),
            Cell::Number(self.customer_lifetime_value),
        ]
    }

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn extraction_date(&self) -> DateTime<Utc> {
        self.feature_extraction_date
    }
}

pub struct ChurnFeatureExtractor {
    store: Arc<dyn EventStore>,
}

impl ChurnFeatureExtractor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

/// Mean interval between consecutive purchases in fractional days.
fn avg_days_between_purchases(events: &[Event]) -> Option<f64> {
    let stamps: Vec<DateTime<Utc>> = window::purchases(events).map(|e| e.timestamp).collect();
    if stamps.len() < 2 {
        return None;
    }
    let gaps: Vec<f64> = stamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds() as f64 / 86_400.0)
        .collect();
    Some(window::mean(&gaps))
}

fn repeat_purchase_ratio(purchases: usize) -> f64 {
    if purchases < 2 {
        0.0
    } else {
        (purchases - 1) as f64 / purchases as f64
    }
}

impl FeatureExtractor for ChurnFeatureExtractor {
    type Record = ChurnPredictionFeatures;

    fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    fn component(&self) -> &'static str {
        "churn_features"
    }

    fn compute(
        &self,
        history: &UserHistory,
        prediction_date: DateTime<Utc>,
    ) -> Result<ChurnPredictionFeatures, FeatureError> {
        let user = &history.user;
        let registered = history.registration_date()?;
        let events = history.as_of(prediction_date);
        let spend = Spend::of(user.user_id, events)?;

        let w7 = last_days(events, prediction_date, 7);
        let w14 = last_days(events, prediction_date, 14);
        let w30 = last_days(events, prediction_date, 30);
        let w60 = last_days(events, prediction_date, 60);
        let count = |w: &[Event], t: EventType| window::count_type(w, &t);
        let purchases_in = |w: &[Event]| window::purchases(w).count();

        let day_gaps = window::active_day_gaps(events);
        let max_gap = day_gaps.iter().copied().fold(0.0_f64, f64::max);

        let duration_7 = window::avg_session_duration(w7);
        let duration_14 = window::avg_session_duration(w14);
        let purchases_7 = purchases_in(w7);
        let purchases_14 = purchases_in(w14);

        let weekend_ratio = window::weekend_ratio(events);
        let weekday_ratio = if events.is_empty() {
            0.0
        } else {
            1.0 - weekend_ratio
        };

        Ok(ChurnPredictionFeatures {
            user_id: user.user_id,
            telegram_id: user.telegram_id,
            days_since_registration: window::days_between(registered, prediction_date).max(0),
            total_events: events.len(),
            unique_days_active: window::unique_days(events),

            events_last_7_days: w7.len(),
            events_last_14_days: w14.len(),
            events_last_30_days: w30.len(),
            events_last_60_days: w60.len(),
            unique_days_active_last_7_days: window::unique_days(w7),
            unique_days_active_last_14_days: window::unique_days(w14),
            unique_days_active_last_30_days: window::unique_days(w30),
            unique_days_active_last_60_days: window::unique_days(w60),

            activity_drop_7d_vs_14d: window::activity_drop(w7.len(), 7, w14.len(), 14),
            activity_drop_14d_vs_30d: window::activity_drop(w14.len(), 14, w30.len(), 30),
            activity_drop_30d_vs_60d: window::activity_drop(w30.len(), 30, w60.len(), 60),

            avg_days_between_sessions: window::mean(&day_gaps),
            max_days_between_sessions: max_gap,
            days_since_last_activity: window::days_since_last(events, prediction_date),

            bot_commands_last_7_days: count(w7, EventType::BotCommand),
            bot_commands_last_14_days: count(w14, EventType::BotCommand),
            bot_commands_last_30_days: count(w30, EventType::BotCommand),
            messages_last_7_days: count(w7, EventType::Message),
            messages_last_14_days: count(w14, EventType::Message),
            messages_last_30_days: count(w30, EventType::Message),
            callback_queries_last_7_days: count(w7, EventType::CallbackQuery),
            callback_queries_last_14_days: count(w14, EventType::CallbackQuery),
            callback_queries_last_30_days: count(w30, EventType::CallbackQuery),

            product_views_last_7_days: count(w7, EventType::View),
            product_views_last_14_days: count(w14, EventType::View),
            product_views_last_30_days: count(w30, EventType::View),
            cart_additions_last_7_days: count(w7, EventType::AddToCart),
            cart_additions_last_14_days: count(w14, EventType::AddToCart),
            cart_additions_last_30_days: count(w30, EventType::AddToCart),

            total_purchases: spend.purchases,
            purchases_last_7_days: purchases_7,
            purchases_last_14_days: purchases_14,
            purchases_last_30_days: purchases_in(w30),
            purchases_last_60_days: purchases_in(w60),
            total_spent: spend.total,
            avg_order_value: spend.avg_order_value(),
            days_since_last_purchase: window::days_since_last_purchase(events, prediction_date),

            avg_session_duration_last_7_days: duration_7,
            avg_session_duration_last_14_days: duration_14,
            avg_session_duration_last_30_days: window::avg_session_duration(w30),
            session_count_last_7_days: window::session_count(w7),
            session_count_last_14_days: window::session_count(w14),
            session_count_last_30_days: window::session_count(w30),

            session_duration_trend: window::relative_change(duration_7, duration_14),
            engagement_trend: window::relative_change(w7.len() as f64, w14.len() as f64),
            purchase_trend: window::relative_change(purchases_7 as f64, purchases_14 as f64),

            peak_hour: window::peak_hour(events),
            weekend_activity_ratio: weekend_ratio,
            weekday_activity_ratio: weekday_ratio,

            repeat_purchase_ratio: repeat_purchase_ratio(spend.purchases),
            avg_days_between_purchases: avg_days_between_purchases(events),
            customer_lifetime_value: spend.total + 0.1 * events.len() as f64,

            feature_extraction_date: prediction_date,
            churn_definition_days: PREDICTION_HORIZON_DAYS,
        })
    }
}

impl LabelledExtractor for ChurnFeatureExtractor {
    /// Churned when the horizon holds no events of any type.
    fn outcome(&self, horizon_events: &[Event]) -> (bool, usize) {
        (horizon_events.is_empty(), horizon_events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::User;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn extractor() -> ChurnFeatureExtractor {
        ChurnFeatureExtractor::new(Arc::new(
            crate::store::SqliteStore::open_in_memory().expect("store opens"),
        ))
    }

    #[test]
    fn loyalty_fields_follow_purchase_history() {
        let pd = Utc.with_ymd_and_hms(2025, 5, 31, 12, 0, 0).unwrap();
        let history = UserHistory {
            user: User::new(3, 30, pd - Duration::days(100)),
            events: vec![
                Event::new(3, EventType::Purchase, pd - Duration::days(20))
                    .with_properties(json!({"amount": 100})),
                Event::new(3, EventType::Purchase, pd - Duration::days(10))
                    .with_properties(json!({"amount": 50})),
                Event::new(3, EventType::Purchase, pd - Duration::days(4))
                    .with_properties(json!({"amount": 30})),
            ],
        };
        let f = extractor().compute(&history, pd).expect("features compute");

        assert!((f.repeat_purchase_ratio - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(f.avg_days_between_purchases, Some(8.0));
        assert!((f.customer_lifetime_value - 180.3).abs() < 1e-9);
        assert_eq!(f.max_days_between_sessions, 10.0);
        assert_eq!(f.days_since_last_activity, Some(4));
        assert_eq!(f.cells().len(), ChurnPredictionFeatures::columns().len());
    }

    #[test]
    fn empty_history_uses_absent_recency_and_zero_trends() {
        let pd = Utc.with_ymd_and_hms(2025, 5, 31, 12, 0, 0).unwrap();
        let history = UserHistory {
            user: User::new(3, 30, pd - Duration::days(5)),
            events: Vec::new(),
        };
        let f = extractor().compute(&history, pd).expect("features compute");

        assert_eq!(f.days_since_last_activity, None);
        assert_eq!(f.avg_days_between_purchases, None);
        assert_eq!(f.activity_drop_7d_vs_14d, 0.0);
        assert_eq!(f.session_count_last_30_days, 0);
        assert_eq!(f.weekday_activity_ratio, 0.0);
        assert_eq!(f.repeat_purchase_ratio, 0.0);
    }

    #[test]
    fn churn_label_requires_an_empty_horizon() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 31, 12, 0, 0).unwrap();
        let e = extractor();
        assert_eq!(e.outcome(&[]), (true, 0));
        assert_eq!(e.outcome(&[Event::new(3, EventType::Scroll, ts)]), (false, 1));
    }
}
