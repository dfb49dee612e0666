use std::collections::HashMap;

use async_trait::async_trait;
use recordb_core::conn::RoleStore;
use recordb_core::error::Result;
use tracing::debug;

use super::col;
use crate::connection::{ConnInner, PgConn};

/// Flag columns of `_role`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleFlag {
    Admin,
    Default,
}

impl RoleFlag {
    const fn column(self) -> &'static str {
        match self {
            Self::Admin => "is_admin",
            Self::Default => "by_default",
        }
    }
}

impl ConnInner {
    /// Create the roles that do not exist yet
    pub(crate) async fn ensure_roles(&self, roles: &[String]) -> Result<()> {
        if roles.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (id) SELECT unnest($1::text[]) ON CONFLICT (id) DO NOTHING",
            self.table("_role")
        );
        let created = self.execute_plain(&sql, &[&roles]).await?;
        if created > 0 {
            debug!(app = %self.app_name, created, "Created roles");
        }
        Ok(())
    }

    /// Grant roles to users, skipping grants that already exist
    pub(crate) async fn grant_roles(&self, user_ids: &[String], roles: &[String]) -> Result<()> {
        self.ensure_roles(roles).await?;
        let sql = format!(
            "INSERT INTO {user_role} (user_id, role_id) \
             SELECT u.id, r.id FROM {user} AS u, {role} AS r \
             WHERE u.id = ANY($1) AND r.id = ANY($2) \
             ON CONFLICT DO NOTHING",
            user_role = self.table("_user_role"),
            user = self.table("_user"),
            role = self.table("_role"),
        );
        self.execute_plain(&sql, &[&user_ids, &roles]).await?;
        Ok(())
    }

    /// Roles per user, with an entry for every requested user
    pub(crate) async fn roles_of(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let mut roles: HashMap<String, Vec<String>> = user_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        if user_ids.is_empty() {
            return Ok(roles);
        }

        let sql = format!(
            "SELECT user_id, role_id FROM {} WHERE user_id = ANY($1) ORDER BY user_id, role_id",
            self.table("_user_role")
        );
        for row in self.query_plain(&sql, &[&user_ids]).await? {
            let user_id: String = col(&row, 0)?;
            let role: String = col(&row, 1)?;
            roles.entry(user_id).or_default().push(role);
        }
        Ok(roles)
    }

    async fn flagged_roles(&self, flag: RoleFlag) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT id FROM {} WHERE {} = TRUE ORDER BY id",
            self.table("_role"),
            flag.column()
        );
        self.query_plain(&sql, &[])
            .await?
            .iter()
            .map(|row| col(row, 0))
            .collect()
    }

    async fn set_flagged_roles(&self, flag: RoleFlag, roles: &[String]) -> Result<()> {
        self.within_tx(|| async move {
            self.ensure_roles(roles).await?;
            let reset = format!(
                "UPDATE {table} SET {col} = FALSE WHERE {col} = TRUE",
                table = self.table("_role"),
                col = flag.column()
            );
            self.execute_plain(&reset, &[]).await?;
            if roles.is_empty() {
                return Ok(());
            }
            let set = format!(
                "UPDATE {} SET {} = TRUE WHERE id = ANY($1)",
                self.table("_role"),
                flag.column()
            );
            self.execute_plain(&set, &[&roles]).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RoleStore for PgConn {
    async fn get_admin_roles(&self) -> Result<Vec<String>> {
        self.inner.flagged_roles(RoleFlag::Admin).await
    }

    async fn set_admin_roles(&self, roles: &[String]) -> Result<()> {
        debug!(app = %self.inner.app_name, ?roles, "Setting admin roles");
        self.inner.set_flagged_roles(RoleFlag::Admin, roles).await
    }

    async fn get_default_roles(&self) -> Result<Vec<String>> {
        self.inner.flagged_roles(RoleFlag::Default).await
    }

    async fn set_default_roles(&self, roles: &[String]) -> Result<()> {
        debug!(app = %self.inner.app_name, ?roles, "Setting default roles");
        self.inner.set_flagged_roles(RoleFlag::Default, roles).await
    }

    async fn assign_roles(&self, user_ids: &[String], roles: &[String]) -> Result<()> {
        if user_ids.is_empty() || roles.is_empty() {
            return Ok(());
        }
        debug!(app = %self.inner.app_name, ?roles, ?user_ids, "Assigning roles");
        let inner = &self.inner;
        inner
            .within_tx(|| async move { inner.grant_roles(user_ids, roles).await })
            .await
    }

    async fn revoke_roles(&self, user_ids: &[String], roles: &[String]) -> Result<()> {
        if user_ids.is_empty() || roles.is_empty() {
            return Ok(());
        }
        debug!(app = %self.inner.app_name, ?roles, ?user_ids, "Revoking roles");
        let sql = format!(
            "DELETE FROM {} WHERE user_id = ANY($1) AND role_id = ANY($2)",
            self.inner.table("_user_role")
        );
        self.inner.execute_plain(&sql, &[&user_ids, &roles]).await?;
        Ok(())
    }

    async fn get_roles(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.inner.roles_of(user_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flag_columns() {
        assert_eq!(RoleFlag::Admin.column(), "is_admin");
        assert_eq!(RoleFlag::Default.column(), "by_default");
    }
}
