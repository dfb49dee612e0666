use async_trait::async_trait;
use recordb_core::conn::{QueryConfig, RelationStore};
use recordb_core::error::{Error, Resource, Result};
use recordb_core::query::RelationDirection;
use recordb_core::user::{RelationKind, User};
use tracing::debug;

use super::{col, expect_one};
use crate::connection::PgConn;

/// Filter on `"u"."id"` selecting the users related to `$1`
fn relation_filter(relation_table: &str, direction: RelationDirection) -> String {
    let outward = format!("u.id IN (SELECT right_id FROM {} WHERE left_id = $1)", relation_table);
    let inward = format!("u.id IN (SELECT left_id FROM {} WHERE right_id = $1)", relation_table);
    match direction {
        RelationDirection::Outward => outward,
        RelationDirection::Inward => inward,
        RelationDirection::Mutual => format!("{} AND {}", outward, inward),
    }
}

fn relation_sql(
    user_table: &str,
    relation_table: &str,
    direction: RelationDirection,
    config: QueryConfig,
) -> String {
    let mut sql = format!(
        "SELECT u.id, u.username, u.email FROM {} AS u WHERE {} ORDER BY u.id",
        user_table,
        relation_filter(relation_table, direction)
    );
    if config.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", config.limit));
    }
    if config.offset > 0 {
        sql.push_str(&format!(" OFFSET {}", config.offset));
    }
    sql
}

fn relation_count_sql(user_table: &str, relation_table: &str, direction: RelationDirection) -> String {
    format!(
        "SELECT COUNT(*) FROM {} AS u WHERE {}",
        user_table,
        relation_filter(relation_table, direction)
    )
}

#[async_trait]
impl RelationStore for PgConn {
    async fn query_relation(
        &self,
        user: &str,
        kind: RelationKind,
        direction: RelationDirection,
        config: QueryConfig,
    ) -> Result<Vec<User>> {
        debug!(app = %self.inner.app_name, user, relation = %kind, ?direction, "Query relation");
        let sql = relation_sql(
            &self.inner.table("_user"),
            &self.inner.table(kind.table_name()),
            direction,
            config,
        );
        let mut users = Vec::new();
        for row in self.inner.query_plain(&sql, &[&user]).await? {
            let mut related = User::new(col::<String>(&row, 0)?);
            related.username = col(&row, 1)?;
            related.email = col(&row, 2)?;
            users.push(related);
        }
        Ok(users)
    }

    async fn query_relation_count(
        &self,
        user: &str,
        kind: RelationKind,
        direction: RelationDirection,
    ) -> Result<u64> {
        let sql = relation_count_sql(
            &self.inner.table("_user"),
            &self.inner.table(kind.table_name()),
            direction,
        );
        let row = self
            .inner
            .query_opt_plain(&sql, &[&user])
            .await?
            .ok_or_else(|| Error::internal("COUNT returned no row"))?;
        let count: i64 = col(&row, 0)?;
        Ok(count.max(0) as u64)
    }

    async fn add_relation(&self, user: &str, kind: RelationKind, target: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (left_id, right_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            self.inner.table(kind.table_name())
        );
        match self.inner.execute_plain(&sql, &[&user, &target]).await {
            Ok(_) => Ok(()),
            Err(Error::ConstraintViolated { .. }) => Err(Error::not_found(
                Resource::User,
                format!("{} or {}", user, target),
            )),
            Err(e) => Err(e),
        }
    }

    async fn remove_relation(&self, user: &str, kind: RelationKind, target: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE left_id = $1 AND right_id = $2",
            self.inner.table(kind.table_name())
        );
        let affected = self.inner.execute_plain(&sql, &[&user, &target]).await?;
        expect_one(affected, || {
            Error::invalid_argument(format!(
                "{} relation not exist {{{}}} => {{{}}}",
                kind, user, target
            ))
        })
    }
}
