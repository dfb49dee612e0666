use async_trait::async_trait;
use recordb_core::conn::AssetStore;
use recordb_core::error::{Error, Resource, Result};
use recordb_core::value::Asset;
use tokio_postgres::Row;

use super::col;
use crate::connection::PgConn;
use crate::schema::ASSET_TABLE;

fn asset_from_row(row: &Row) -> Result<Asset> {
    Ok(Asset {
        name: col(row, 0)?,
        content_type: col(row, 1)?,
        size: col(row, 2)?,
        public: col(row, 3)?,
    })
}

#[async_trait]
impl AssetStore for PgConn {
    async fn get_asset(&self, name: &str) -> Result<Asset> {
        let sql = format!(
            "SELECT id, content_type, size, public FROM {} WHERE id = $1",
            self.inner.table(ASSET_TABLE)
        );
        let row = self
            .inner
            .query_opt_plain(&sql, &[&name])
            .await?
            .ok_or_else(|| Error::not_found(Resource::Asset, name))?;
        asset_from_row(&row)
    }

    async fn get_assets(&self, names: &[String]) -> Result<Vec<Asset>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, content_type, size, public FROM {} WHERE id = ANY($1)",
            self.inner.table(ASSET_TABLE)
        );
        let rows = self.inner.query_plain(&sql, &[&names]).await?;
        let mut assets = rows.iter().map(asset_from_row).collect::<Result<Vec<_>>>()?;
        // keep the caller's order
        assets.sort_by_key(|a| names.iter().position(|n| *n == a.name));
        Ok(assets)
    }

    async fn save_asset(&self, asset: &Asset) -> Result<()> {
        if asset.name.is_empty() {
            return Err(Error::invalid_argument("asset name cannot be empty"));
        }
        let sql = format!(
            "INSERT INTO {} (id, content_type, size, public) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET content_type = EXCLUDED.content_type, \
             size = EXCLUDED.size, public = EXCLUDED.public",
            self.inner.table(ASSET_TABLE)
        );
        self.inner
            .execute_plain(
                &sql,
                &[&asset.name, &asset.content_type, &asset.size, &asset.public],
            )
            .await?;
        Ok(())
    }
}
