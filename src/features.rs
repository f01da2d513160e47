//! Shared extraction plumbing: the extractor capability, per-user history
//! loading, batch extraction and labelled training-set construction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{Event, PurchaseAmount, User};
use crate::store::{EventStore, StoreError};
use crate::table::FeatureRecord;
use crate::window;

/// Forward-looking label horizon for purchase and churn samples.
pub const PREDICTION_HORIZON_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("malformed event payload for user {user_id}: {detail}")]
    MalformedPayload { user_id: i64, detail: String },
    #[error("user {user_id} has no registration date")]
    MissingRegistrationDate { user_id: i64 },
    #[error("invalid extraction range: {0}")]
    InvalidRange(String),
    #[error("event store error: {0}")]
    Store(#[from] StoreError),
}

impl FeatureError {
    /// Per-user failures are skipped in batches; store failures are not.
    pub fn is_per_user(&self) -> bool {
        matches!(
            self,
            Self::MalformedPayload { .. } | Self::MissingRegistrationDate { .. }
        )
    }
}

/// A user together with their full, time-ordered event history.
#[derive(Debug, Clone)]
pub struct UserHistory {
    pub user: User,
    pub events: Vec<Event>,
}

impl UserHistory {
    pub fn load(
        store: &dyn EventStore,
        user_id: i64,
        until: DateTime<Utc>,
    ) -> Result<Option<Self>, FeatureError> {
        let Some(user) = store.user(user_id)? else {
            return Ok(None);
        };
        let mut events = store.user_events(user_id, until)?;
        events.sort_by_key(|e| e.timestamp);
        Ok(Some(Self { user, events }))
    }

    /// Events with `timestamp <= prediction_date`.
    pub fn as_of(&self, prediction_date: DateTime<Utc>) -> &[Event] {
        let end = self
            .events
            .partition_point(|e| e.timestamp <= prediction_date);
        &self.events[..end]
    }

    /// Events in `(prediction_date, prediction_date + days]`.
    pub fn after(&self, prediction_date: DateTime<Utc>, days: i64) -> &[Event] {
        let horizon_end = prediction_date + Duration::days(days);
        let from = self
            .events
            .partition_point(|e| e.timestamp <= prediction_date);
        let to = self.events.partition_point(|e| e.timestamp <= horizon_end);
        &self.events[from..to.max(from)]
    }

    pub fn registration_date(&self) -> Result<DateTime<Utc>, FeatureError> {
        self.user
            .registration_date
            .ok_or(FeatureError::MissingRegistrationDate {
                user_id: self.user.user_id,
            })
    }
}

/// Purchase totals over a slice of events.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Spend {
    pub purchases: usize,
    pub total: f64,
}

impl Spend {
    pub fn of(user_id: i64, events: &[Event]) -> Result<Self, FeatureError> {
        let mut spend = Spend::default();
        for event in window::purchases(events) {
            spend.purchases += 1;
            match event.purchase_amount() {
                PurchaseAmount::Valid(amount) => spend.total += amount,
                PurchaseAmount::Absent => {}
                PurchaseAmount::Malformed => {
                    return Err(FeatureError::MalformedPayload {
                        user_id,
                        detail: format!(
                            "purchase at {} has a non-numeric amount",
                            event.timestamp.to_rfc3339()
                        ),
                    })
                }
            }
        }
        Ok(spend)
    }

    pub fn avg_order_value(&self) -> f64 {
        window::ratio(self.total, self.purchases as f64)
    }
}

/// A feature record with its forward-looking outcome attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample<R> {
    pub features: R,
    pub label: bool,
    /// Qualifying events observed inside the label horizon.
    pub horizon_event_count: usize,
}

pub trait FeatureExtractor: Send + Sync {
    type Record: FeatureRecord + Send;

    fn store(&self) -> &Arc<dyn EventStore>;

    fn component(&self) -> &'static str;

    /// Pure computation over a loaded history as of `prediction_date`.
    fn compute(
        &self,
        history: &UserHistory,
        prediction_date: DateTime<Utc>,
    ) -> Result<Self::Record, FeatureError>;

    /// `Ok(None)` when the user does not exist.
    fn extract(
        &self,
        user_id: i64,
        prediction_date: Option<DateTime<Utc>>,
    ) -> Result<Option<Self::Record>, FeatureError> {
        let now = Utc::now();
        let prediction_date = prediction_date.unwrap_or(now);
        let until = now.max(prediction_date);
        let Some(history) = UserHistory::load(self.store().as_ref(), user_id, until)? else {
            return Ok(None);
        };
        self.compute(&history, prediction_date).map(Some)
    }

    /// Extracts every id, skipping users that fail or do not exist.
    fn extract_batch(
        &self,
        user_ids: &[i64],
        prediction_date: Option<DateTime<Utc>>,
    ) -> Vec<Self::Record> {
        let mut out = Vec::with_capacity(user_ids.len());
        for &user_id in user_ids {
            match self.extract(user_id, prediction_date) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => warn!(
                    component = self.component(),
                    event = "features.extract.not_found",
                    user_id
                ),
                Err(err) => warn!(
                    component = self.component(),
                    event = "features.extract.skipped",
                    user_id,
                    error = %err
                ),
            }
        }
        out
    }

    fn extract_all(
        &self,
        limit: Option<usize>,
        prediction_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<Self::Record>, FeatureError> {
        let user_ids = self.store().user_ids(limit)?;
        info!(
            component = self.component(),
            event = "features.extract_all.start",
            users = user_ids.len()
        );
        let records = self.extract_batch(&user_ids, prediction_date);
        info!(
            component = self.component(),
            event = "features.extract_all.finish",
            users = user_ids.len(),
            extracted = records.len()
        );
        Ok(records)
    }
}

/// Extractors that can attach a forward-looking label for supervised training.
pub trait LabelledExtractor: FeatureExtractor {
    /// `(label, horizon_event_count)` from events in the label horizon.
    fn outcome(&self, horizon_events: &[Event]) -> (bool, usize);

    /// One sample per (user, day) for users active in `[start, end]`.
    ///
    /// Rows for the same user on adjacent days share most of their history,
    /// so a random split over these rows is not leakage-free.
    fn extract_training_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<TrainingSample<Self::Record>>, FeatureError> {
        if end < start {
            return Err(FeatureError::InvalidRange(format!(
                "end {} precedes start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }

        let user_ids = self.store().active_user_ids(start, end, limit)?;
        info!(
            component = self.component(),
            event = "features.training.start",
            start = %start.to_rfc3339(),
            end = %end.to_rfc3339(),
            users = user_ids.len()
        );

        let fetch_until = Utc::now().max(end + Duration::days(PREDICTION_HORIZON_DAYS));
        let mut samples = Vec::new();
        let mut skipped_users = 0usize;

        for user_id in user_ids {
            let history = match UserHistory::load(self.store().as_ref(), user_id, fetch_until) {
                Ok(Some(history)) => history,
                Ok(None) => continue,
                Err(err) if err.is_per_user() => {
                    skipped_users += 1;
                    warn!(
                        component = self.component(),
                        event = "features.training.skipped",
                        user_id,
                        error = %err
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut user_samples = Vec::new();
            let mut failed = None;
            let mut prediction_date = start;
            while prediction_date <= end {
                match self.compute(&history, prediction_date) {
                    Ok(features) => {
                        let (label, horizon_event_count) = self
                            .outcome(history.after(prediction_date, PREDICTION_HORIZON_DAYS));
                        user_samples.push(TrainingSample {
                            features,
                            label,
                            horizon_event_count,
                        });
                    }
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
                prediction_date += Duration::days(1);
            }

            match failed {
                None => samples.extend(user_samples),
                Some(err) => {
                    skipped_users += 1;
                    warn!(
                        component = self.component(),
                        event = "features.training.skipped",
                        user_id,
                        error = %err
                    );
                }
            }
        }

        info!(
            component = self.component(),
            event = "features.training.finish",
            samples = samples.len(),
            skipped_users
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use chrono::TimeZone;
    use serde_json::json;

    fn history(events: Vec<Event>) -> UserHistory {
        UserHistory {
            user: User::new(7, 70, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            events,
        }
    }

    #[test]
    fn as_of_and_after_split_at_prediction_date() {
        let pd = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let h = history(vec![
            Event::new(7, EventType::View, pd - Duration::days(1)),
            Event::new(7, EventType::View, pd),
            Event::new(7, EventType::View, pd + Duration::days(30)),
            Event::new(7, EventType::View, pd + Duration::days(31)),
        ]);
        assert_eq!(h.as_of(pd).len(), 2);
        assert_eq!(h.after(pd, 30).len(), 1);
    }

    #[test]
    fn spend_rejects_non_numeric_amounts() {
        let ts = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let ok = vec![
            Event::new(7, EventType::Purchase, ts).with_properties(json!({"amount": 20})),
            Event::new(7, EventType::Purchase, ts),
        ];
        let spend = Spend::of(7, &ok).expect("valid payloads");
        assert_eq!(spend.purchases, 2);
        assert!((spend.avg_order_value() - 10.0).abs() < 1e-12);

        let bad = vec![Event::new(7, EventType::Purchase, ts).with_properties(json!({"amount": {}}))];
        let err = Spend::of(7, &bad).expect_err("object amount is malformed");
        assert!(err.is_per_user());
    }

    #[test]
    fn missing_registration_is_per_user_failure() {
        let mut h = history(Vec::new());
        h.user.registration_date = None;
        let err = h.registration_date().expect_err("no registration date");
        assert!(matches!(err, FeatureError::MissingRegistrationDate { user_id: 7 }));
    }
}
