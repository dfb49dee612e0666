use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use recordb_core::conn::DeviceStore;
use recordb_core::device::Device;
use recordb_core::error::{Error, Resource, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, error};

use super::{col, expect_one};
use crate::connection::PgConn;

const DEVICE_COLUMNS: &str = "id, type, token, user_id, last_registered_at";

fn device_from_row(row: &Row) -> Result<Device> {
    let token: Option<String> = col(row, 2)?;
    let last_registered_at: NaiveDateTime = col(row, 4)?;
    Ok(Device {
        id: col(row, 0)?,
        device_type: col(row, 1)?,
        token: token.unwrap_or_default(),
        user_id: col(row, 3)?,
        last_registered_at: last_registered_at.and_utc(),
    })
}

impl PgConn {
    /// Delete devices matching `filter`, optionally registered before `before`
    async fn delete_devices_where(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
        before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut sql = format!("DELETE FROM {} WHERE {}", self.inner.table("_device"), filter);
        let cutoff = before.map(|t| t.naive_utc());
        let mut params = params.to_vec();
        if let Some(cutoff) = &cutoff {
            sql.push_str(&format!(" AND last_registered_at < ${}", params.len() + 1));
            params.push(cutoff);
        }
        self.inner.execute_plain(&sql, &params).await
    }
}

#[async_trait]
impl DeviceStore for PgConn {
    async fn get_device(&self, id: &str) -> Result<Device> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            DEVICE_COLUMNS,
            self.inner.table("_device")
        );
        let row = self
            .inner
            .query_opt_plain(&sql, &[&id])
            .await?
            .ok_or_else(|| Error::not_found(Resource::Device, id))?;
        device_from_row(&row)
    }

    async fn query_devices_by_user(&self, user_id: &str) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 ORDER BY id",
            DEVICE_COLUMNS,
            self.inner.table("_device")
        );
        self.inner
            .query_plain(&sql, &[&user_id])
            .await?
            .iter()
            .map(device_from_row)
            .collect()
    }

    async fn save_device(&self, device: &Device) -> Result<()> {
        device.validate()?;
        let token = (!device.token.is_empty()).then_some(device.token.as_str());
        let sql = format!(
            "INSERT INTO {} AS d ({}) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET type = EXCLUDED.type, \
             token = COALESCE(EXCLUDED.token, d.token), user_id = EXCLUDED.user_id, \
             last_registered_at = EXCLUDED.last_registered_at",
            self.inner.table("_device"),
            DEVICE_COLUMNS
        );
        let registered = device.last_registered_at.naive_utc();
        let result = self
            .inner
            .execute_plain(
                &sql,
                &[
                    &device.id,
                    &device.device_type,
                    &token,
                    &device.user_id,
                    &registered,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::ConstraintViolated { .. }) => {
                Err(Error::not_found(Resource::User, device.user_id.as_str()))
            }
            Err(e) => {
                error!(app = %self.inner.app_name, device_id = %device.id, error = %e, "Failed to save device");
                Err(e)
            }
        }
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let affected = self.delete_devices_where("id = $1", &[&id], None).await?;
        expect_one(affected, || Error::not_found(Resource::Device, id))
    }

    async fn delete_devices_by_token(
        &self,
        token: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self
            .delete_devices_where("token = $1", &[&token], before)
            .await?;
        if affected == 0 {
            return Err(Error::not_found(Resource::Device, format!("token {}", token)));
        }
        debug!(app = %self.inner.app_name, affected, "Deleted devices by token");
        Ok(())
    }

    async fn delete_empty_devices_by_time(&self, before: Option<DateTime<Utc>>) -> Result<()> {
        let affected = self
            .delete_devices_where("token IS NULL", &[], before)
            .await?;
        if affected == 0 {
            return Err(Error::not_found(Resource::Device, "without token"));
        }
        debug!(app = %self.inner.app_name, affected, "Deleted devices without token");
        Ok(())
    }
}
