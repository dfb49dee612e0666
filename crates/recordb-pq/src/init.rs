//! Application schema bootstrap
//!
//! Creates the application schema, its bookkeeping tables and the shared
//! change-notification trigger function. The schema carries a version
//! row; a matching version skips the bootstrap and any other version is
//! refused.

use recordb_core::error::{Error, Result};
use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use crate::builder::quote_ident;
use crate::error::from_pg;
use crate::pool::PooledClient;

/// Version written to `_version` by this bootstrap
pub const SCHEMA_VERSION: &str = "recordb-1";

/// Channel the trigger function notifies on
pub const RECORD_CHANGE_CHANNEL: &str = "record_change";

/// DDL creating the application schema `schema` (quoted)
pub fn bootstrap_sql(schema: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {s};
CREATE TABLE IF NOT EXISTS public.pending_notification (
    id SERIAL NOT NULL PRIMARY KEY,
    op text NOT NULL,
    appname text NOT NULL,
    recordtype text NOT NULL,
    record jsonb NOT NULL
);
CREATE OR REPLACE FUNCTION public.notify_record_change() RETURNS TRIGGER AS $$
    DECLARE
        affected_record RECORD;
        inserted_id integer;
    BEGIN
        IF (TG_OP = 'DELETE') THEN
            affected_record := OLD;
        ELSE
            affected_record := NEW;
        END IF;
        INSERT INTO public.pending_notification (op, appname, recordtype, record)
            VALUES (TG_OP, TG_TABLE_SCHEMA, TG_TABLE_NAME, row_to_json(affected_record)::jsonb)
            RETURNING id INTO inserted_id;
        PERFORM pg_notify('{channel}', inserted_id::TEXT);
        RETURN affected_record;
    END;
$$ LANGUAGE plpgsql;

CREATE TABLE IF NOT EXISTS {s}._version (
    version_num character varying(32) NOT NULL
);
INSERT INTO {s}._version (version_num) VALUES ('{version}');

CREATE TABLE {s}._user (
    id text PRIMARY KEY,
    username text UNIQUE,
    email text UNIQUE
);
CREATE TABLE {s}._role (
    id text PRIMARY KEY,
    is_admin boolean NOT NULL DEFAULT FALSE,
    by_default boolean NOT NULL DEFAULT FALSE
);
CREATE TABLE {s}._user_role (
    user_id text REFERENCES {s}._user (id) ON DELETE CASCADE NOT NULL,
    role_id text REFERENCES {s}._role (id) NOT NULL,
    PRIMARY KEY (user_id, role_id)
);
CREATE TABLE {s}._record_creation (
    record_type text NOT NULL,
    role_id text REFERENCES {s}._role (id),
    UNIQUE (record_type, role_id)
);
CREATE TABLE {s}._record_default_access (
    record_type text NOT NULL PRIMARY KEY,
    default_access jsonb
);
CREATE TABLE {s}._record_field_access (
    record_type text NOT NULL,
    record_field text NOT NULL,
    user_role text NOT NULL,
    readable boolean NOT NULL,
    writable boolean NOT NULL,
    comparable boolean NOT NULL,
    discoverable boolean NOT NULL,
    PRIMARY KEY (record_type, record_field, user_role)
);
CREATE TABLE {s}._asset (
    id text PRIMARY KEY,
    content_type text NOT NULL,
    size bigint NOT NULL,
    public boolean NOT NULL DEFAULT FALSE
);
CREATE TABLE {s}._device (
    id text PRIMARY KEY,
    user_id text REFERENCES {s}._user (id),
    type text NOT NULL,
    token text,
    last_registered_at timestamp without time zone NOT NULL,
    UNIQUE (user_id, type, token)
);
CREATE INDEX ON {s}._device (token, last_registered_at);
CREATE TABLE {s}._subscription (
    id text NOT NULL,
    user_id text NOT NULL,
    device_id text REFERENCES {s}._device (id) ON DELETE CASCADE NOT NULL,
    type text NOT NULL,
    notification_info jsonb,
    query jsonb,
    PRIMARY KEY (user_id, device_id, id)
);
CREATE TABLE {s}._friend (
    left_id text NOT NULL,
    right_id text REFERENCES {s}._user (id) NOT NULL,
    PRIMARY KEY (left_id, right_id)
);
CREATE TABLE {s}._follow (
    left_id text NOT NULL,
    right_id text REFERENCES {s}._user (id) NOT NULL,
    PRIMARY KEY (left_id, right_id)
);
"#,
        s = schema,
        channel = RECORD_CHANGE_CHANNEL,
        version = SCHEMA_VERSION,
    )
}

/// Installed schema version, `None` when the schema was never bootstrapped
async fn installed_version(client: &PooledClient, schema: &str) -> Result<Option<String>> {
    let sql = format!("SELECT version_num::text FROM {}._version", schema);
    match client.query_opt(sql.as_str(), &[]).await {
        Ok(Some(row)) => row
            .try_get::<_, String>(0)
            .map(Some)
            .map_err(|e| Error::serialization(e.to_string())),
        Ok(None) => Ok(None),
        Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => Ok(None),
        Err(e) => Err(from_pg(e, &sql)),
    }
}

/// Bootstrap the schema of `schema_name` unless it is already current
pub async fn ensure_app_schema(client: &PooledClient, schema_name: &str) -> Result<()> {
    let schema = quote_ident(schema_name);
    match installed_version(client, &schema).await? {
        Some(version) if version == SCHEMA_VERSION => {
            debug!(schema = %schema_name, version = %version, "Schema is current");
            return Ok(());
        }
        Some(version) => {
            return Err(Error::incompatible_schema(format!(
                "got version_num = {}, want {}",
                version, SCHEMA_VERSION
            )));
        }
        None => {}
    }

    info!(schema = %schema_name, version = SCHEMA_VERSION, "Bootstrapping application schema");
    let run = |sql: String| async move {
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| from_pg(e, &sql))
    };

    run("BEGIN".to_string()).await?;
    client.set_in_transaction(true);
    let result = match run(bootstrap_sql(&schema)).await {
        Ok(()) => run("COMMIT".to_string()).await,
        Err(e) => {
            if let Err(rollback) = run("ROLLBACK".to_string()).await {
                warn!(schema = %schema_name, error = %rollback, "Rollback of bootstrap failed");
            }
            Err(e)
        }
    };
    client.set_in_transaction(false);

    result.map_err(|e| match e {
        Error::Connection { .. } | Error::Timeout { .. } => e,
        other => Error::config(format!("failed to init database {}: {}", schema_name, other)),
    })
}
