//! The document store: query statistics, custom flavours, share records and
//! the user-data mirror, kept as JSONB rows in PostgreSQL.

use indexmap::IndexMap;
use models::{CustomFlavour, FlavourOwner, QueryStat, ShareRecord};
use sqlx::Row;

#[derive(Clone)]
pub struct DocStore {
    pool: sqlx::PgPool,
}

impl DocStore {
    /// Connect lazily; the store only has to be reachable when a request
    /// actually touches it.
    pub fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> sqlx::PgPool {
        self.pool.clone()
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS search_queries (
                id BIGSERIAL PRIMARY KEY,
                metadata JSONB NOT NULL,
                query JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS flavours (
                flavour_name TEXT NOT NULL,
                owner TEXT NOT NULL,
                mapping JSONB NOT NULL,
                PRIMARY KEY (flavour_name, owner)
            )",
            "CREATE TABLE IF NOT EXISTS shares (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                signature TEXT NOT NULL,
                expires_at BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS user_data (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                metadata JSONB NOT NULL
            )",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Inserted after every search; failures are logged, never surfaced.
    pub async fn insert_stat(&self, stat: &QueryStat) {
        let metadata = serde_json::to_value(&stat.metadata).expect("stat serializes");
        let query = serde_json::to_value(&stat.query).expect("stat serializes");
        let result = sqlx::query("INSERT INTO search_queries (metadata, query) VALUES ($1, $2)")
            .bind(metadata)
            .bind(query)
            .execute(&self.pool)
            .await;
        if let Err(error) = result {
            tracing::warn!(%error, "could not store query statistics");
        }
    }

    pub async fn get_flavour(
        &self,
        name: &str,
        owner: &FlavourOwner,
    ) -> Result<Option<CustomFlavour>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT mapping FROM flavours WHERE flavour_name = $1 AND owner = $2",
        )
        .bind(name)
        .bind(owner.key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let mapping: serde_json::Value = row.get("mapping");
            CustomFlavour {
                flavour_name: name.to_string(),
                owner: owner.clone(),
                mapping: mapping_of(&mapping),
            }
        }))
    }

    /// Global flavours plus the caller's personal ones.
    pub async fn list_flavours(
        &self,
        user: Option<&str>,
    ) -> Result<Vec<CustomFlavour>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT flavour_name, owner, mapping FROM flavours \
             WHERE owner = 'global' OR owner = $1 ORDER BY flavour_name, owner",
        )
        .bind(user.unwrap_or(""))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let owner: String = row.get("owner");
                let mapping: serde_json::Value = row.get("mapping");
                CustomFlavour {
                    flavour_name: row.get("flavour_name"),
                    owner: if owner == "global" {
                        FlavourOwner::Global
                    } else {
                        FlavourOwner::User(owner)
                    },
                    mapping: mapping_of(&mapping),
                }
            })
            .collect())
    }

    /// Returns false when the flavour already existed and `overwrite` was
    /// not allowed.
    pub async fn put_flavour(
        &self,
        flavour: &CustomFlavour,
        overwrite: bool,
    ) -> Result<bool, sqlx::Error> {
        let mapping = serde_json::to_value(&flavour.mapping).expect("mapping serializes");
        if overwrite {
            sqlx::query(
                "INSERT INTO flavours (flavour_name, owner, mapping) VALUES ($1, $2, $3) \
                 ON CONFLICT (flavour_name, owner) DO UPDATE SET mapping = EXCLUDED.mapping",
            )
            .bind(&flavour.flavour_name)
            .bind(flavour.owner.key())
            .bind(mapping)
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }
        let result = sqlx::query(
            "INSERT INTO flavours (flavour_name, owner, mapping) VALUES ($1, $2, $3) \
             ON CONFLICT (flavour_name, owner) DO NOTHING",
        )
        .bind(&flavour.flavour_name)
        .bind(flavour.owner.key())
        .bind(mapping)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_flavour(
        &self,
        name: &str,
        owner: &FlavourOwner,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM flavours WHERE flavour_name = $1 AND owner = $2",
        )
        .bind(name)
        .bind(owner.key())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-sharing a path replaces its record.
    pub async fn put_share(&self, record: &ShareRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO shares (id, token, signature, expires_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET token = EXCLUDED.token, \
             signature = EXCLUDED.signature, expires_at = EXCLUDED.expires_at",
        )
        .bind(&record.id)
        .bind(&record.token)
        .bind(&record.signature)
        .bind(record.expires_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Share verification requires a live record; deleting it revokes the
    /// URL.
    pub async fn get_share(&self, id: &str) -> Result<Option<ShareRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT token, signature, expires_at FROM shares WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ShareRecord {
            id: id.to_string(),
            token: row.get("token"),
            signature: row.get("signature"),
            expires_at: row.get::<i64, _>("expires_at").max(0) as u64,
        }))
    }

    pub async fn upsert_userdata(
        &self,
        id: &str,
        username: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_data (id, username, metadata) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET metadata = EXCLUDED.metadata, \
             username = EXCLUDED.username",
        )
        .bind(id)
        .bind(username)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the caller's mirrored documents whose metadata matches every
    /// search key.
    pub async fn delete_userdata(
        &self,
        username: &str,
        search_keys: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<u64, sqlx::Error> {
        let filter = serde_json::Value::Object(search_keys.clone());
        let result = sqlx::query(
            "DELETE FROM user_data WHERE username = $1 AND metadata @> $2",
        )
        .bind(username)
        .bind(filter)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn mapping_of(value: &serde_json::Value) -> IndexMap<String, String> {
    let mut mapping = IndexMap::new();
    if let Some(map) = value.as_object() {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                mapping.insert(key.clone(), value.to_string());
            }
        }
    }
    mapping
}
