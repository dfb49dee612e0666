//! JIT schema management
//!
//! Each record type is a table in the application schema. Column types
//! are read back from the catalog and cached per application; the cache
//! is dropped for a type whenever its table is altered through this
//! module, and cleared entirely on rollback.
//!
//! Integer columns backed by a `<type>_<column>_seq` sequence are
//! reported as sequences; text columns with a foreign key are reported
//! as references (or assets when the key points at `_asset`).

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use recordb_core::error::{Error, Result};
use recordb_core::schema::{DataType, FieldType, Index, RecordSchema};
use tokio_postgres::types::Oid;
use tracing::{debug, info};

use crate::builder::{quote_ident, table_name, Statement};
use crate::connection::ConnInner;
use crate::types::{field_type_from_pq, pq_data_type};

/// Table holding asset metadata; references to it are asset fields
pub const ASSET_TABLE: &str = "_asset";

/// Remote column types per record type of one application
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: DashMap<String, RecordSchema>,
}

impl SchemaCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached schema of `record_type`
    pub fn get(&self, record_type: &str) -> Option<RecordSchema> {
        self.tables.get(record_type).map(|s| s.value().clone())
    }

    /// Store the schema read for `record_type`
    pub fn insert(&self, record_type: impl Into<String>, schema: RecordSchema) {
        self.tables.insert(record_type.into(), schema);
    }

    /// Forget one record type
    pub fn invalidate(&self, record_type: &str) {
        self.tables.remove(record_type);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.tables.clear();
    }

    /// Number of cached record types
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// `CREATE TABLE` with the reserved columns, plus the change trigger
pub fn create_table_sql(schema_name: &str, record_type: &str) -> String {
    let table = table_name(schema_name, record_type);
    format!(
        "CREATE TABLE {table} (\
         _id text, \
         _database_id text, \
         _owner_id text, \
         _access jsonb, \
         _created_at timestamp without time zone NOT NULL, \
         _created_by text, \
         _updated_at timestamp without time zone NOT NULL, \
         _updated_by text, \
         PRIMARY KEY(_id, _database_id, _owner_id), \
         UNIQUE (_id)\
         );\n\
         CREATE TRIGGER trigger_notify_record_change \
         AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE PROCEDURE public.notify_record_change();"
    )
}

/// `ALTER TABLE ... ADD` for new columns; `None` when there are none
pub fn add_columns_sql(
    schema_name: &str,
    record_type: &str,
    columns: &RecordSchema,
) -> Result<Option<String>> {
    if columns.is_empty() {
        return Ok(None);
    }

    let mut clauses = Vec::with_capacity(columns.len());
    for (column, field_type) in columns.iter() {
        clauses.push(format!("ADD {} {}", quote_ident(column), pq_data_type(field_type)?));

        let (referent, remote_column) = match field_type.data_type {
            DataType::Reference => (field_type.reference_type.as_str(), "_id"),
            DataType::Asset => (ASSET_TABLE, "id"),
            _ => continue,
        };
        if referent.is_empty() {
            return Err(Error::invalid_argument(format!(
                "reference field {} has no record type",
                column
            )));
        }
        clauses.push(format!(
            "ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_ident(&format!("fk_{}_{}_{}", column, referent, remote_column)),
            quote_ident(column),
            table_name(schema_name, referent),
            quote_ident(remote_column)
        ));
    }

    Ok(Some(format!(
        "ALTER TABLE {} {};",
        table_name(schema_name, record_type),
        clauses.join(", ")
    )))
}

/// Columns of `wanted` missing from `remote`.
///
/// Fails when a column exists with an incompatible definition.
pub fn columns_to_add(remote: &RecordSchema, wanted: &RecordSchema) -> Result<RecordSchema> {
    let mut missing = RecordSchema::new();
    for (column, field_type) in wanted.iter() {
        match remote.get(column) {
            Some(existing) if existing.definition_compatible_to(field_type) => {}
            Some(existing) => {
                return Err(Error::incompatible_schema(format!(
                    "conflicting schema {} => {}",
                    existing.to_simple_name(),
                    field_type.to_simple_name()
                )))
            }
            None => missing.insert(column.clone(), field_type.clone()),
        }
    }
    Ok(missing)
}

fn sequence_pattern(record_type: &str) -> String {
    format!("{}\\_%\\_seq", record_type.replace('_', "\\_"))
}

fn sequence_column<'a>(record_type: &str, sequence: &'a str) -> Option<&'a str> {
    sequence
        .strip_prefix(record_type)?
        .strip_prefix('_')?
        .strip_suffix("_seq")
}

impl ConnInner {
    fn require_migration(&self) -> Result<()> {
        if self.config.can_migrate {
            Ok(())
        } else {
            Err(Error::incompatible_schema(
                "Record schema requires migration but migration is disabled.",
            ))
        }
    }

    /// Column types of the table of `record_type`, empty when there is none
    pub(crate) async fn remote_column_types(&self, record_type: &str) -> Result<RecordSchema> {
        if let Some(schema) = self.schemas.get(record_type) {
            return Ok(schema);
        }

        let schema = self.read_column_types(record_type).await?;
        self.schemas.insert(record_type, schema.clone());
        Ok(schema)
    }

    async fn read_column_types(&self, record_type: &str) -> Result<RecordSchema> {
        let row = self
            .query_opt_plain(
                "SELECT c.oid FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relname = $1 AND n.nspname = $2",
                &[&record_type, &self.schema_name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(RecordSchema::new());
        };
        let oid: Oid = row.try_get(0).map_err(|e| Error::internal(e.to_string()))?;

        let mut schema = RecordSchema::new();
        let rows = self
            .query_plain(
                "SELECT a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod) \
                 FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped",
                &[&oid],
            )
            .await?;
        for row in rows {
            let column: String = row.try_get(0).map_err(|e| Error::internal(e.to_string()))?;
            let pq_type: String = row.try_get(1).map_err(|e| Error::internal(e.to_string()))?;
            let field_type = field_type_from_pq(&column, &pq_type);
            schema.insert(column, field_type);
        }

        let has_integer = schema
            .iter()
            .any(|(_, t)| t.data_type == DataType::Integer);
        if has_integer {
            let rows = self
                .query_plain(
                    "SELECT c.relname::text FROM pg_catalog.pg_class c \
                     LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                     WHERE c.relkind = 'S' AND c.relname LIKE $1 AND n.nspname = $2",
                    &[&sequence_pattern(record_type), &self.schema_name],
                )
                .await?;
            for row in rows {
                let sequence: String =
                    row.try_get(0).map_err(|e| Error::internal(e.to_string()))?;
                let Some(column) = sequence_column(record_type, &sequence) else {
                    continue;
                };
                if schema.get(column).map(|t| t.data_type) == Some(DataType::Integer) {
                    schema.insert(column, FieldType::new(DataType::Sequence));
                }
            }
        }

        let rows = self
            .query_plain(
                "SELECT kcu.column_name::text, ccu.table_name::text \
                 FROM information_schema.table_constraints AS tc \
                 JOIN information_schema.key_column_usage AS kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                 JOIN information_schema.constraint_column_usage AS ccu \
                   ON ccu.constraint_name = tc.constraint_name \
                 WHERE constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2",
                &[&self.schema_name, &record_type],
            )
            .await?;
        for row in rows {
            let column: String = row.try_get(0).map_err(|e| Error::internal(e.to_string()))?;
            let referent: String = row.try_get(1).map_err(|e| Error::internal(e.to_string()))?;
            let field_type = if referent == ASSET_TABLE {
                FieldType::new(DataType::Asset)
            } else {
                FieldType::reference(referent)
            };
            schema.insert(column, field_type);
        }

        debug!(
            app = %self.app_name,
            record_type = %record_type,
            columns = schema.len(),
            "Read remote column types"
        );
        Ok(schema)
    }

    /// Remote schemas of several record types; missing tables map to empty schemas
    pub(crate) async fn remote_schemas<I, S>(&self, record_types: I) -> Result<HashMap<String, RecordSchema>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut schemas = HashMap::new();
        for record_type in record_types {
            let record_type = record_type.as_ref();
            let schema = self.remote_column_types(record_type).await?;
            schemas.insert(record_type.to_string(), schema);
        }
        Ok(schemas)
    }

    /// Create or widen the table of `record_type`; true when altered
    pub(crate) async fn extend_schema(&self, record_type: &str, wanted: &RecordSchema) -> Result<bool> {
        let remote = self.remote_column_types(record_type).await?;
        if !remote.is_empty() && remote.definition_compatible_to(wanted) {
            return Ok(false);
        }
        self.require_migration()?;

        let own_tx = !self.client.in_transaction();
        if own_tx {
            self.begin_tx().await?;
        }
        let result = self.alter_for(record_type, &remote, wanted).await;
        if own_tx {
            match &result {
                Ok(_) => self.commit_tx().await?,
                Err(_) => {
                    let _ = self.rollback_tx().await;
                }
            }
        }
        self.schemas.invalidate(record_type);
        result.map(|()| true)
    }

    async fn alter_for(&self, record_type: &str, remote: &RecordSchema, wanted: &RecordSchema) -> Result<()> {
        if remote.is_empty() {
            info!(app = %self.app_name, record_type = %record_type, "Creating record table");
            self.batch(&create_table_sql(&self.schema_name, record_type))
                .await?;
        }

        let missing = columns_to_add(remote, wanted)?;
        if let Some(sql) = add_columns_sql(&self.schema_name, record_type, &missing)? {
            info!(
                app = %self.app_name,
                record_type = %record_type,
                columns = ?missing.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                "Adding record columns"
            );
            self.batch(&sql).await?;
        }
        Ok(())
    }

    /// Rename a column
    pub(crate) async fn rename_column(&self, record_type: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.require_migration()?;
        let sql = format!(
            "ALTER TABLE {} RENAME {} TO {}",
            self.table(record_type),
            quote_ident(old_name),
            quote_ident(new_name)
        );
        let result = self.execute(&Statement::plain(sql)).await;
        self.schemas.invalidate(record_type);
        result.map(|_| ())
    }

    /// Drop a column
    pub(crate) async fn drop_column(&self, record_type: &str, column: &str) -> Result<()> {
        self.require_migration()?;
        let sql = format!(
            "ALTER TABLE {} DROP {}",
            self.table(record_type),
            quote_ident(column)
        );
        let result = self.execute(&Statement::plain(sql)).await;
        self.schemas.invalidate(record_type);
        result.map(|_| ())
    }

    /// Tables of the application schema that hold records
    pub(crate) async fn record_types(&self) -> Result<Vec<String>> {
        let rows = self
            .query_plain(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE (table_name NOT LIKE '\\_%') AND (table_schema = $1) \
                 ORDER BY table_name",
                &[&self.schema_name],
            )
            .await?;
        rows.into_iter()
            .map(|row| row.try_get(0).map_err(|e| Error::internal(e.to_string())))
            .collect()
    }

    /// User fields of every record type
    pub(crate) async fn record_schemas(&self) -> Result<BTreeMap<String, RecordSchema>> {
        let mut schemas = BTreeMap::new();
        for record_type in self.record_types().await? {
            let schema = self.remote_column_types(&record_type).await?;
            schemas.insert(record_type, schema.user_fields());
        }
        Ok(schemas)
    }

    /// Unique constraints of a record type, excluding the reserved ones
    pub(crate) async fn unique_indexes(&self, record_type: &str) -> Result<BTreeMap<String, Index>> {
        let rows = self
            .query_plain(
                "SELECT i.relname::text, array_to_string(array_agg(a.attname), ',') \
                 FROM pg_class t, pg_class i, pg_index ix, pg_attribute a, pg_namespace ns \
                 WHERE t.oid = ix.indrelid AND i.oid = ix.indexrelid \
                   AND ns.oid = t.relnamespace AND ns.oid = i.relnamespace \
                   AND a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                   AND t.relkind = 'r' AND ix.indisunique = TRUE AND NOT ix.indisprimary \
                   AND ns.nspname = $1 AND t.relname = $2 \
                 GROUP BY ns.nspname, t.relname, i.relname",
                &[&self.schema_name, &record_type],
            )
            .await?;

        let mut indexes = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| Error::internal(e.to_string()))?;
            let fields: String = row.try_get(1).map_err(|e| Error::internal(e.to_string()))?;
            let fields: Vec<&str> = fields.split(',').filter(|f| !f.is_empty()).collect();
            if fields.iter().all(|f| f.starts_with('_')) {
                continue;
            }
            indexes.insert(name, Index::new(fields));
        }
        Ok(indexes)
    }

    /// Add a unique constraint
    pub(crate) async fn create_unique_index(&self, record_type: &str, name: &str, index: &Index) -> Result<()> {
        if index.fields.is_empty() {
            return Err(Error::invalid_argument("index must have at least one field"));
        }
        let columns: Vec<String> = index.fields.iter().map(|f| quote_ident(f)).collect();
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            self.table(record_type),
            quote_ident(name),
            columns.join(", ")
        );
        self.execute(&Statement::plain(sql)).await.map(|_| ())
    }

    /// Drop a unique constraint
    pub(crate) async fn drop_unique_index(&self, record_type: &str, name: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.table(record_type),
            quote_ident(name)
        );
        self.execute(&Statement::plain(sql)).await.map(|_| ())
    }
}
