//! Features for predicting a purchase within the next 30 days.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
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
pub struct PurchasePredictionFeatures {
    pub user_id: i64,
    pub telegram_id: i64,

    pub days_since_registration: i64,
    pub total_events: usize,
    pub unique_days_active: usize,

    pub events_last_7_days: usize,
    pub events_last_14_days: usize,
    pub events_last_30_days: usize,
    pub unique_days_active_last_7_days: usize,
    pub unique_days_active_last_14_days: usize,
    pub unique_days_active_last_30_days: usize,

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
    pub purchases_last_90_days: usize,
    pub total_spent: f64,
    pub avg_order_value: f64,
    pub days_since_last_purchase: Option<i64>,

    pub avg_session_duration_last_7_days: f64,
    pub avg_session_duration_last_14_days: f64,
    pub peak_hour: u32,
    pub weekend_activity_ratio_last_7_days: f64,
    pub weekend_activity_ratio_last_14_days: f64,

    pub activity_trend_7d_vs_14d: f64,
    pub activity_trend_14d_vs_30d: f64,
    pub purchase_trend_30d_vs_60d: f64,

    pub is_weekend: bool,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub month: u32,

    pub feature_extraction_date: DateTime<Utc>,
    pub prediction_horizon_days: i64,
}

const PURCHASE_COLUMNS: &[&str] = &[
    "days_since_registration",
    "total_events",
    "unique_days_active",
    "events_last_7_days",
    "events_last_14_days",
    "events_last_30_days",
    "unique_days_active_last_7_days",
    "unique_days_active_last_14_days",
    "unique_days_active_last_30_days",
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
    "purchases_last_90_days",
    "total_spent",
    "avg_order_value",
    "days_since_last_purchase",
    "avg_session_duration_last_7_days",
    "avg_session_duration_last_14_days",
    "peak_hour",
    "weekend_activity_ratio_last_7_days",
    "weekend_activity_ratio_last_14_days",
    "activity_trend_7d_vs_14d",
    "activity_trend_14d_vs_30d",
    "purchase_trend_30d_vs_60d",
    "is_weekend",
    "hour_of_day",
    "day_of_week",
    "month",
];

impl FeatureRecord for PurchasePredictionFeatures {
    const FEATURE_SET: FeatureSet = FeatureSet::PurchasePrediction;

    fn columns() -> &'static [&'static str] {
        PURCHASE_COLUMNS
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Number(self.days_since_registration as f64),
            Cell::count(self.total_events),
            Cell::count(self.unique_days_active),
            Cell::count(self.events_last_7_days),
            Cell::count(self.events_last_14_days),
            Cell::count(self.events_last_30_days),
            Cell::count(self.unique_days_active_last_7_days),
            Cell::count(self.unique_days_active_last_14_days),
            Cell::count(self.unique_days_active_last_30_days),
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
            Cell::count(self.purchases_last_90_days),
            Cell::Number(self.total_spent),
            Cell::Number(self.avg_order_value),
            Cell::recency(self.days_since_last_purchase),
            Cell::Number(self.avg_session_duration_last_7_days),
            Cell::Number(self.avg_session_duration_last_14_days),
            Cell::Number(f64::from(self.peak_hour)),
            Cell::Number(self.weekend_activity_ratio_last_7_days),
            Cell::Number(self.weekend_activity_ratio_last_14_days),
            Cell::Number(self.activity_trend_7d_vs_14d),
            Cell::Number(self.activity_trend_14d_vs_30d),
            Cell::Number(self.purchase_trend_30d_vs_60d),
            Cell::Flag(self.is_weekend),
            Cell::Number(f64::from(self.hour_of_day)),
            Cell::Number(f64::from(self.day_of_week)),
            Cell::Number(f64::from(self.month)),
        ]
    }

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn extraction_date(&self) -> DateTime<Utc> {
        self.feature_extraction_date
    }
}

pub struct PurchaseFeatureExtractor {
    store: Arc<dyn EventStore>,
}

impl PurchaseFeatureExtractor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

fn typed(events: &[Event], event_type: EventType) -> usize {
    window::count_type(events, &event_type)
}

impl FeatureExtractor for PurchaseFeatureExtractor {
    type Record = PurchasePredictionFeatures;

    fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    fn component(&self) -> &'static str {
        "purchase_features"
    }

    fn compute(
        &self,
        history: &UserHistory,
        prediction_date: DateTime<Utc>,
    ) -> Result<PurchasePredictionFeatures, FeatureError> {
        let user = &history.user;
        let registered = history.registration_date()?;
        let events = history.as_of(prediction_date);
        let spend = Spend::of(user.user_id, events)?;

        let w7 = last_days(events, prediction_date, 7);
        let w14 = last_days(events, prediction_date, 14);
        let w30 = last_days(events, prediction_date, 30);
        let w60 = last_days(events, prediction_date, 60);
        let w90 = last_days(events, prediction_date, 90);

        let purchases_in = |w: &[Event]| window::purchases(w).count();
        let purchases_30 = purchases_in(w30);
        let purchases_60 = purchases_in(w60);

        Ok(PurchasePredictionFeatures {
            user_id: user.user_id,
            telegram_id: user.telegram_id,
            days_since_registration: window::days_between(registered, prediction_date).max(0),
            total_events: events.len(),
            unique_days_active: window::unique_days(events),

            events_last_7_days: w7.len(),
            events_last_14_days: w14.len(),
            events_last_30_days: w30.len(),
            unique_days_active_last_7_days: window::unique_days(w7),
            unique_days_active_last_14_days: window::unique_days(w14),
            unique_days_active_last_30_days: window::unique_days(w30),

            bot_commands_last_7_days: typed(w7, EventType::BotCommand),
            bot_commands_last_14_days: typed(w14, EventType::BotCommand),
            bot_commands_last_30_days: typed(w30, EventType::BotCommand),
            messages_last_7_days: typed(w7, EventType::Message),
            messages_last_14_days: typed(w14, EventType::Message),
            messages_last_30_days: typed(w30, EventType::Message),
            callback_queries_last_7_days: typed(w7, EventType::CallbackQuery),
            callback_queries_last_14_days: typed(w14, EventType::CallbackQuery),
            callback_queries_last_30_days: typed(w30, EventType::CallbackQuery),

            product_views_last_7_days: typed(w7, EventType::View),
            product_views_last_14_days: typed(w14, EventType::View),
            product_views_last_30_days: typed(w30, EventType::View),
            cart_additions_last_7_days: typed(w7, EventType::AddToCart),
            cart_additions_last_14_days: typed(w14, EventType::AddToCart),
            cart_additions_last_30_days: typed(w30, EventType::AddToCart),

            total_purchases: spend.purchases,
            purchases_last_7_days: purchases_in(w7),
            purchases_last_14_days: purchases_in(w14),
            purchases_last_30_days: purchases_30,
            purchases_last_60_days: purchases_60,
            purchases_last_90_days: purchases_in(w90),
            total_spent: spend.total,
            avg_order_value: spend.avg_order_value(),
            days_since_last_purchase: window::days_since_last_purchase(events, prediction_date),

            avg_session_duration_last_7_days: window::avg_session_duration(w7),
            avg_session_duration_last_14_days: window::avg_session_duration(w14),
            peak_hour: window::peak_hour(events),
            weekend_activity_ratio_last_7_days: window::weekend_ratio(w7),
            weekend_activity_ratio_last_14_days: window::weekend_ratio(w14),

            activity_trend_7d_vs_14d: window::ratio(w7.len() as f64, w14.len() as f64),
            activity_trend_14d_vs_30d: window::ratio(w14.len() as f64, w30.len() as f64),
            purchase_trend_30d_vs_60d: window::ratio(purchases_30 as f64, purchases_60 as f64),

            is_weekend: prediction_date.weekday().num_days_from_monday() >= 5,
            hour_of_day: prediction_date.hour(),
            day_of_week: prediction_date.weekday().num_days_from_monday(),
            month: prediction_date.month(),

            feature_extraction_date: prediction_date,
            prediction_horizon_days: PREDICTION_HORIZON_DAYS,
        })
    }
}

impl LabelledExtractor for PurchaseFeatureExtractor {
    /// Purchases inside the horizon; positive when there is at least one.
    fn outcome(&self, horizon_events: &[Event]) -> (bool, usize) {
        let purchases = window::purchases(horizon_events).count();
        (purchases > 0, purchases)
    }
}
