//! Records within one visibility scope
//!
//! Statements come from the builder; this module runs them, maps
//! PostgreSQL failures onto record semantics and decodes rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use recordb_core::conn::{
    AccessControlOptions, Database, DatabaseType, EmptyCursor, RecordCursor,
};
use recordb_core::device::Subscription;
use recordb_core::error::{Error, Resource, Result};
use recordb_core::query::Query;
use recordb_core::record::{Record, RecordId};
use recordb_core::schema::{Index, RecordSchema};
use tracing::{debug, warn};

use crate::builder::predicate::required_record_types;
use crate::builder::select::{count_query, select_by_keys, select_query, Scope, RECORD_COUNT_COLUMN};
use crate::builder::write::{delete_record, sequence_columns, set_sequence_value, upsert_record};
use crate::connection::ConnInner;
use crate::scan::{PgCursor, RowScanner};

/// A [`Database`] over one scope of an application's records
#[derive(Debug, Clone)]
pub struct PgDatabase {
    inner: Arc<ConnInner>,
    database_type: DatabaseType,
    database_id: String,
}

impl PgDatabase {
    pub(crate) fn new(inner: Arc<ConnInner>, database_type: DatabaseType, database_id: &str) -> Self {
        Self {
            inner,
            database_type,
            database_id: database_id.to_string(),
        }
    }

    fn scope(&self) -> Scope<'_> {
        Scope {
            schema_name: &self.inner.schema_name,
            database_type: self.database_type,
            database_id: &self.database_id,
            user_record_type: &self.inner.config.user_record_type,
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.database_type == DatabaseType::Union {
            return Err(Error::DatabaseIsReadOnly);
        }
        Ok(())
    }

    fn ensure_subscribable(&self) -> Result<()> {
        if self.database_type == DatabaseType::Union {
            return Err(Error::not_supported(
                "union database does not implement subscription",
            ));
        }
        Ok(())
    }

    /// `_database_id` filter for writes; none for the union scope
    fn write_scope(&self) -> Option<&str> {
        match self.database_type {
            DatabaseType::Union => None,
            DatabaseType::Public | DatabaseType::Private => Some(&self.database_id),
        }
    }
}

fn validate_for_save(record: &Record) -> Result<()> {
    if record.id.key.is_empty() {
        return Err(Error::invalid_argument("db.save: got empty record id"));
    }
    if record.id.record_type.is_empty() {
        return Err(Error::invalid_argument(format!(
            "db.save {}: got empty record type",
            record.id.key
        )));
    }
    if record.owner_id.is_empty() {
        return Err(Error::invalid_argument(format!(
            "db.save {}: got empty owner id",
            record.id.key
        )));
    }
    Ok(())
}

#[async_trait]
impl Database for PgDatabase {
    fn id(&self) -> &str {
        &self.database_id
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn get(&self, id: &RecordId) -> Result<Record> {
        let typemap = self.inner.remote_column_types(&id.record_type).await?;
        if typemap.is_empty() {
            return Err(Error::record_not_found());
        }

        let plan = select_by_keys(
            self.scope(),
            &id.record_type,
            &typemap,
            std::slice::from_ref(&id.key),
            &AccessControlOptions::bypass(),
        )?;
        let row = self
            .inner
            .query_opt(&plan.statement)
            .await?
            .ok_or_else(Error::record_not_found)?;
        let (record, _) = RowScanner::new(id.record_type.as_str(), plan.typemap).scan(&row)?;
        Ok(record)
    }

    async fn get_by_ids(
        &self,
        ids: &[RecordId],
        options: &AccessControlOptions,
    ) -> Result<Box<dyn RecordCursor>> {
        if ids.is_empty() {
            return Err(Error::invalid_argument("db.get_by_ids received empty array"));
        }
        let record_type = ids
            .iter()
            .map(|id| id.record_type.as_str())
            .find(|t| !t.is_empty())
            .unwrap_or_default()
            .to_string();
        let keys: Vec<String> = ids
            .iter()
            .filter(|id| !id.key.is_empty())
            .map(|id| id.key.clone())
            .collect();

        let typemap = self.inner.remote_column_types(&record_type).await?;
        if typemap.is_empty() {
            debug!(record_type = %record_type, "Record type has not been created");
            return Err(Error::record_not_found());
        }

        let plan = select_by_keys(self.scope(), &record_type, &typemap, &keys, options)?;
        let rows = self.inner.query_stream(&plan.statement).await?;
        Ok(Box::new(PgCursor::new(
            rows,
            RowScanner::new(record_type, plan.typemap),
            plan.statement.sql,
        )))
    }

    async fn save(&self, record: &mut Record) -> Result<()> {
        validate_for_save(record)?;
        self.ensure_writable()?;

        let record_type = record.record_type().to_string();
        let typemap = self.inner.remote_column_types(&record_type).await?;
        if typemap.is_empty() {
            return Err(Error::not_found(Resource::RecordType, record_type));
        }

        for (column, value) in sequence_columns(record, &typemap) {
            let stmt = set_sequence_value(&self.inner.schema_name, &record_type, column, value)?;
            self.inner.query(&stmt).await?;
        }

        let stmt = upsert_record(&self.inner.schema_name, record, &self.database_id, &typemap)?;
        let row = match self.inner.query_opt(&stmt).await {
            Ok(row) => row,
            Err(Error::Duplicated { .. }) => {
                return Err(Error::duplicated("violate unique constraint"))
            }
            Err(Error::InvalidArgument { message }) => {
                return Err(Error::invalid_argument(format!(
                    "failed to save {}: {}",
                    record.id, message
                )))
            }
            Err(e) => return Err(e.with_context("save", &record.id)),
        };
        let row = row.ok_or_else(|| {
            Error::duplicated(format!(
                "record {} already exists in another database",
                record.id
            ))
        })?;

        RowScanner::new(record_type, typemap).scan_into(&row, record)?;
        record.database_id = self.database_id.clone();
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<()> {
        self.ensure_writable()?;
        let stmt = delete_record(
            &self.inner.schema_name,
            &id.record_type,
            &id.key,
            self.write_scope(),
        )?;

        let affected = match self.inner.execute(&stmt).await {
            Ok(n) => n,
            Err(e) if e.is_not_found() => return Err(Error::record_not_found()),
            Err(Error::ConstraintViolated { .. }) => {
                return Err(Error::constraint_violated(format!(
                    "delete {}: failed to delete record because other records have reference to it",
                    id
                )))
            }
            Err(e) => return Err(e.with_context("delete", id)),
        };

        match affected {
            0 => Err(Error::record_not_found()),
            1 => Ok(()),
            n => {
                warn!(id = %id, rows_affected = n, "Unexpected rows deleted");
                Err(Error::internal(format!(
                    "delete {}: got {} rows deleted, want 1",
                    id, n
                )))
            }
        }
    }

    async fn query(&self, query: &Query) -> Result<Box<dyn RecordCursor>> {
        if query.record_type.is_empty() {
            return Err(Error::invalid_argument("got empty query type"));
        }
        query.validate()?;

        let typemap = self.inner.remote_column_types(&query.record_type).await?;
        if typemap.is_empty() {
            return Ok(Box::new(EmptyCursor));
        }

        let types = required_record_types(&query.record_type, &typemap, query.predicate.as_ref());
        let schemas = self.inner.remote_schemas(&types).await?;
        let plan = select_query(self.scope(), query, &schemas)?;

        let rows = self.inner.query_stream(&plan.statement).await?;
        Ok(Box::new(PgCursor::new(
            rows,
            RowScanner::new(query.record_type.as_str(), plan.typemap),
            plan.statement.sql,
        )))
    }

    async fn query_count(&self, query: &Query) -> Result<u64> {
        if query.record_type.is_empty() {
            return Err(Error::invalid_argument("got empty query type"));
        }
        query.validate()?;

        let typemap = self.inner.remote_column_types(&query.record_type).await?;
        if typemap.is_empty() {
            return Ok(0);
        }

        let types = required_record_types(&query.record_type, &typemap, query.predicate.as_ref());
        let schemas = self.inner.remote_schemas(&types).await?;
        let stmt = count_query(self.scope(), query, &schemas)?;

        let row = self.inner.query_opt(&stmt).await?;
        let count: i64 = match row {
            Some(row) => row
                .try_get(RECORD_COUNT_COLUMN)
                .map_err(|e| Error::serialization(e.to_string()))?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn extend(&self, record_type: &str, schema: &RecordSchema) -> Result<bool> {
        self.inner.extend_schema(record_type, schema).await
    }

    async fn rename_schema(&self, record_type: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_column(record_type, old_name, new_name).await
    }

    async fn delete_schema(&self, record_type: &str, column: &str) -> Result<()> {
        self.inner.drop_column(record_type, column).await
    }

    async fn get_schema(&self, record_type: &str) -> Result<RecordSchema> {
        let schema = self.inner.remote_column_types(record_type).await?;
        Ok(schema.user_fields())
    }

    async fn get_record_schemas(&self) -> Result<BTreeMap<String, RecordSchema>> {
        self.inner.record_schemas().await
    }

    async fn get_indexes_by_record_type(
        &self,
        record_type: &str,
    ) -> Result<BTreeMap<String, Index>> {
        self.inner.unique_indexes(record_type).await
    }

    async fn save_index(&self, record_type: &str, name: &str, index: &Index) -> Result<()> {
        self.inner.create_unique_index(record_type, name, index).await
    }

    async fn delete_index(&self, record_type: &str, name: &str) -> Result<()> {
        self.inner.drop_unique_index(record_type, name).await
    }

    async fn get_subscription(&self, key: &str, device_id: &str) -> Result<Subscription> {
        self.ensure_subscribable()?;
        self.inner
            .get_subscription(&self.database_id, key, device_id)
            .await
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.ensure_subscribable()?;
        self.inner
            .save_subscription(&self.database_id, subscription)
            .await
    }

    async fn delete_subscription(&self, key: &str, device_id: &str) -> Result<()> {
        self.ensure_subscribable()?;
        self.inner
            .delete_subscription(&self.database_id, key, device_id)
            .await
    }

    async fn get_subscriptions_by_device_id(&self, device_id: &str) -> Result<Vec<Subscription>> {
        self.ensure_subscribable()?;
        self.inner
            .subscriptions_by_device(&self.database_id, device_id)
            .await
    }

    async fn get_matching_subscriptions(&self, record: &Record) -> Result<Vec<Subscription>> {
        self.ensure_subscribable()?;
        self.inner
            .matching_subscriptions(&self.database_id, record)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_for_save() {
        let ok = Record::new(RecordId::new("note", "1")).with_owner("alice");
        assert!(validate_for_save(&ok).is_ok());

        let no_key = Record::new(RecordId::new("note", "")).with_owner("alice");
        assert!(validate_for_save(&no_key).is_err());

        let no_type = Record::new(RecordId::new("", "1")).with_owner("alice");
        assert!(validate_for_save(&no_type).is_err());

        let no_owner = Record::new(RecordId::new("note", "1"));
        let err = validate_for_save(&no_owner).unwrap_err();
        assert!(err.to_string().contains("owner"));
    }
}
