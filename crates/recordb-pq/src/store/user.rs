use async_trait::async_trait;
use recordb_core::conn::UserStore;
use recordb_core::error::{Error, Resource, Result};
use recordb_core::user::User;
use tracing::debug;

use super::{col, expect_one};
use crate::connection::{ConnInner, PgConn};

impl ConnInner {
    async fn find_user(&self, column: &str, value: &str) -> Result<User> {
        let sql = format!(
            "SELECT id, username, email FROM {} WHERE {} = $1",
            self.table("_user"),
            column
        );
        let row = self
            .query_opt_plain(&sql, &[&value])
            .await?
            .ok_or_else(|| Error::not_found(Resource::User, value))?;

        let mut user = User::new(col::<String>(&row, 0)?);
        user.username = col(&row, 1)?;
        user.email = col(&row, 2)?;
        user.roles = self
            .roles_of(std::slice::from_ref(&user.id))
            .await?
            .remove(&user.id)
            .unwrap_or_default();
        Ok(user)
    }

    async fn replace_user_roles(&self, user: &User) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE user_id = $1", self.table("_user_role"));
        self.execute_plain(&sql, &[&user.id]).await?;
        if user.roles.is_empty() {
            return Ok(());
        }
        self.grant_roles(std::slice::from_ref(&user.id), &user.roles)
            .await
    }
}

#[async_trait]
impl UserStore for PgConn {
    async fn create_user(&self, user: &User) -> Result<()> {
        if user.id.is_empty() {
            return Err(Error::invalid_argument("user id cannot be empty"));
        }
        let inner = &self.inner;
        inner
            .within_tx(|| async move {
                let sql = format!(
                    "INSERT INTO {} (id, username, email) VALUES ($1, $2, $3)",
                    inner.table("_user")
                );
                match inner
                    .execute_plain(&sql, &[&user.id, &user.username, &user.email])
                    .await
                {
                    Ok(_) => {}
                    Err(Error::Duplicated { .. }) => {
                        return Err(Error::duplicated(format!(
                            "user {} already exists",
                            user.id
                        )))
                    }
                    Err(e) => return Err(e),
                }
                inner.replace_user_roles(user).await
            })
            .await?;
        debug!(app = %inner.app_name, user_id = %user.id, "Created user");
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let inner = &self.inner;
        inner
            .within_tx(|| async move {
                let sql = format!(
                    "UPDATE {} SET username = $2, email = $3 WHERE id = $1",
                    inner.table("_user")
                );
                let affected = inner
                    .execute_plain(&sql, &[&user.id, &user.username, &user.email])
                    .await?;
                expect_one(affected, || Error::not_found(Resource::User, user.id.as_str()))?;
                inner.replace_user_roles(user).await
            })
            .await
    }

    async fn get_user(&self, id: &str) -> Result<User> {
        self.inner.find_user("id", id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.inner.find_user("username", username).await
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.inner.table("_user"));
        let affected = self.inner.execute_plain(&sql, &[&id]).await?;
        expect_one(affected, || Error::not_found(Resource::User, id))
    }
}
