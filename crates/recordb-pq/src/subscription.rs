//! Subscription persistence and matching
//!
//! Subscriptions are stored per database and device. Candidates for a
//! changed record are found with a jsonb containment test on the stored
//! query's record type, then filtered in-process by the full predicate.

use recordb_core::device::{NotificationInfo, Subscription};
use recordb_core::error::{Error, Resource, Result};
use recordb_core::matcher;
use recordb_core::query::Query;
use recordb_core::record::Record;
use tokio_postgres::Row;
use tracing::{debug, warn};

use crate::connection::ConnInner;
use crate::error::FOREIGN_KEY_VIOLATION;
use crate::store::{col, expect_one};

/// Foreign key from `_subscription` to `_device`
const DEVICE_FKEY: &str = "_subscription_device_id_fkey";

const SUBSCRIPTION_COLUMNS: &str = "id, device_id, type, notification_info, query";

/// jsonb document a stored query must contain to concern `record_type`
pub fn type_containment(record_type: &str) -> serde_json::Value {
    serde_json::json!({ "Type": record_type })
}

fn subscription_from_row(row: &Row) -> Result<Subscription> {
    let notification_info: Option<serde_json::Value> = col(row, 3)?;
    let notification_info = notification_info
        .map(serde_json::from_value::<NotificationInfo>)
        .transpose()?;
    let query: serde_json::Value = col(row, 4)?;
    Ok(Subscription {
        id: col(row, 0)?,
        device_id: col(row, 1)?,
        sub_type: col(row, 2)?,
        notification_info,
        query: serde_json::from_value::<Query>(query)?,
    })
}

impl ConnInner {
    pub(crate) async fn get_subscription(
        &self,
        database_id: &str,
        key: &str,
        device_id: &str,
    ) -> Result<Subscription> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND device_id = $2 AND id = $3",
            SUBSCRIPTION_COLUMNS,
            self.table("_subscription")
        );
        let row = self
            .query_opt_plain(&sql, &[&database_id, &device_id, &key])
            .await?
            .ok_or_else(|| Error::not_found(Resource::Subscription, key))?;
        subscription_from_row(&row)
    }

    pub(crate) async fn save_subscription(
        &self,
        database_id: &str,
        subscription: &Subscription,
    ) -> Result<()> {
        subscription.validate()?;
        let notification_info = subscription
            .notification_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let query = serde_json::to_value(&subscription.query)?;

        let sql = format!(
            "INSERT INTO {} (id, user_id, device_id, type, notification_info, query) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id, device_id, id) DO UPDATE SET type = EXCLUDED.type, \
             notification_info = EXCLUDED.notification_info, query = EXCLUDED.query",
            self.table("_subscription")
        );
        let result = self
            .client
            .execute(
                sql.as_str(),
                &[
                    &subscription.id,
                    &database_id,
                    &subscription.device_id,
                    &subscription.sub_type,
                    &notification_info,
                    &query,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_device_missing(&e) => Err(Error::not_found(
                Resource::Device,
                subscription.device_id.as_str(),
            )),
            Err(e) => Err(crate::error::from_pg(e, &sql)),
        }
    }

    pub(crate) async fn delete_subscription(
        &self,
        database_id: &str,
        key: &str,
        device_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE user_id = $1 AND device_id = $2 AND id = $3",
            self.table("_subscription")
        );
        let affected = self
            .execute_plain(&sql, &[&database_id, &device_id, &key])
            .await?;
        expect_one(affected, || Error::not_found(Resource::Subscription, key))
    }

    pub(crate) async fn subscriptions_by_device(
        &self,
        database_id: &str,
        device_id: &str,
    ) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND device_id = $2 ORDER BY id",
            SUBSCRIPTION_COLUMNS,
            self.table("_subscription")
        );
        let rows = self.query_plain(&sql, &[&database_id, &device_id]).await?;
        Ok(decode_skipping(&rows, device_id))
    }

    pub(crate) async fn matching_subscriptions(
        &self,
        database_id: &str,
        record: &Record,
    ) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND query @> $2",
            SUBSCRIPTION_COLUMNS,
            self.table("_subscription")
        );
        let containment = type_containment(record.record_type());
        let rows = self.query_plain(&sql, &[&database_id, &containment]).await?;

        let candidates = decode_skipping(&rows, "");
        let matched = filter_matching(candidates, record);
        debug!(
            app = %self.app_name,
            record_id = %record.id,
            matched = matched.len(),
            "Matched subscriptions"
        );
        Ok(matched)
    }
}

fn is_device_missing(err: &tokio_postgres::Error) -> bool {
    err.as_db_error().is_some_and(|db| {
        db.code().code() == FOREIGN_KEY_VIOLATION && db.constraint() == Some(DEVICE_FKEY)
    })
}

/// Decode rows, logging and skipping the ones that fail
fn decode_skipping(rows: &[Row], device_id: &str) -> Vec<Subscription> {
    rows.iter()
        .filter_map(|row| match subscription_from_row(row) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(device_id, error = %e, "Skipping undecodable subscription");
                None
            }
        })
        .collect()
}

/// Subscriptions whose predicate holds for `record`.
///
/// A predicate that cannot be evaluated in-process excludes its
/// subscription instead of failing the whole match.
pub fn filter_matching(candidates: Vec<Subscription>, record: &Record) -> Vec<Subscription> {
    candidates
        .into_iter()
        .filter(|s| match matcher::matches(s.query.predicate.as_ref(), record) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(
                    subscription_id = %s.id,
                    device_id = %s.device_id,
                    error = %e,
                    "Cannot evaluate subscription predicate"
                );
                false
            }
        })
        .collect()
}
