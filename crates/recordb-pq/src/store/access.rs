use async_trait::async_trait;
use recordb_core::acl::{AclLevel, RecordAcl, RecordAclEntry};
use recordb_core::conn::AccessStore;
use recordb_core::error::{Error, Result};
use recordb_core::field_acl::{FieldAcl, FieldAclEntry, FieldUserRole};
use tracing::{debug, warn};

use super::col;
use crate::connection::PgConn;

/// Roles named by creation grants; other grant kinds cannot create
fn creation_roles(acl: &RecordAcl) -> Vec<String> {
    let mut roles: Vec<String> = acl
        .entries()
        .iter()
        .filter(|e| !e.role.is_empty())
        .map(|e| e.role.clone())
        .collect();
    roles.sort();
    roles.dedup();
    roles
}

#[async_trait]
impl AccessStore for PgConn {
    async fn set_record_access(&self, record_type: &str, acl: &RecordAcl) -> Result<()> {
        let roles = creation_roles(acl);
        if roles.len() != acl.entries().len() {
            warn!(
                app = %self.inner.app_name,
                record_type = %record_type,
                "Creation access only keeps role grants"
            );
        }
        let inner = &self.inner;
        inner
            .within_tx(|| async move {
                inner.ensure_roles(&roles).await?;
                let delete = format!(
                    "DELETE FROM {} WHERE record_type = $1",
                    inner.table("_record_creation")
                );
                inner.execute_plain(&delete, &[&record_type]).await?;
                if roles.is_empty() {
                    return Ok(());
                }
                let insert = format!(
                    "INSERT INTO {} (record_type, role_id) SELECT $1, unnest($2::text[])",
                    inner.table("_record_creation")
                );
                inner.execute_plain(&insert, &[&record_type, &roles]).await?;
                Ok(())
            })
            .await
    }

    async fn get_record_access(&self, record_type: &str) -> Result<RecordAcl> {
        let sql = format!(
            "SELECT role_id FROM {} WHERE record_type = $1 ORDER BY role_id",
            self.inner.table("_record_creation")
        );
        let entries = self
            .inner
            .query_plain(&sql, &[&record_type])
            .await?
            .iter()
            .map(|row| Ok(RecordAclEntry::role(col::<String>(row, 0)?, AclLevel::Create)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordAcl::new(entries))
    }

    async fn set_record_default_access(&self, record_type: &str, acl: &RecordAcl) -> Result<()> {
        let json = serde_json::to_value(acl)?;
        let sql = format!(
            "INSERT INTO {} (record_type, default_access) VALUES ($1, $2) \
             ON CONFLICT (record_type) DO UPDATE SET default_access = EXCLUDED.default_access",
            self.inner.table("_record_default_access")
        );
        self.inner
            .execute_plain(&sql, &[&record_type, &json])
            .await?;
        Ok(())
    }

    async fn get_record_default_access(&self, record_type: &str) -> Result<RecordAcl> {
        let sql = format!(
            "SELECT default_access FROM {} WHERE record_type = $1",
            self.inner.table("_record_default_access")
        );
        let Some(row) = self.inner.query_opt_plain(&sql, &[&record_type]).await? else {
            return Ok(RecordAcl::default());
        };
        match col::<Option<serde_json::Value>>(&row, 0)? {
            Some(json) => Ok(serde_json::from_value(json)?),
            None => Ok(RecordAcl::default()),
        }
    }

    async fn set_record_field_access(&self, acl: &FieldAcl) -> Result<()> {
        let entries: Vec<&FieldAclEntry> = acl.entries().collect();
        let count = entries.len();
        let inner = &self.inner;
        inner
            .within_tx(|| async move {
                let table = inner.table("_record_field_access");
                inner
                    .execute_plain(&format!("DELETE FROM {}", table), &[])
                    .await?;
                let insert = format!(
                    "INSERT INTO {} (record_type, record_field, user_role, \
                     readable, writable, comparable, discoverable) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    table
                );
                for entry in &entries {
                    let user_role = entry.user_role.to_string();
                    inner
                        .execute_plain(
                            &insert,
                            &[
                                &entry.record_type,
                                &entry.record_field,
                                &user_role,
                                &entry.readable,
                                &entry.writable,
                                &entry.comparable,
                                &entry.discoverable,
                            ],
                        )
                        .await
                        .map_err(|e| match e {
                            Error::Duplicated { .. } => Error::duplicated(format!(
                                "field access for {}.{} and {} set twice",
                                entry.record_type, entry.record_field, user_role
                            )),
                            other => other,
                        })?;
                }
                Ok(())
            })
            .await?;
        debug!(app = %inner.app_name, entries = count, "Replaced field access");
        Ok(())
    }

    async fn get_record_field_access(&self) -> Result<FieldAcl> {
        let sql = format!(
            "SELECT record_type, record_field, user_role, \
             readable, writable, comparable, discoverable FROM {}",
            self.inner.table("_record_field_access")
        );
        let mut entries = Vec::new();
        for row in self.inner.query_plain(&sql, &[]).await? {
            let user_role: String = col(&row, 2)?;
            entries.push(FieldAclEntry {
                record_type: col(&row, 0)?,
                record_field: col(&row, 1)?,
                user_role: user_role.parse::<FieldUserRole>()?,
                readable: col(&row, 3)?,
                writable: col(&row, 4)?,
                comparable: col(&row, 5)?,
                discoverable: col(&row, 6)?,
            });
        }
        let default = self.inner.config.default_field_access.to_entry();
        Ok(FieldAcl::with_default(entries, default))
    }
}
