//! RDBMS backend: SQL assembly over a flat file table, key-set pagination
//! by the configured pagination column.

use crate::backend::{page_field_list, PageFields, RawFacets, RdbmsConfig, BATCH_SIZE};
use crate::constraints::{SelectMethod, TimeRange};
use crate::{Document, SearchError};
use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use models::UniqKey;
use sqlx::Row;

#[derive(Clone)]
#[derive(Debug)]
enum Bind {
    Text(String),
    Time(NaiveDateTime),
}

#[derive(Debug, Clone)]
pub struct RdbmsBackend {
    pool: sqlx::PgPool,
    table: String,
    pagination_column: String,
    lookup: IndexMap<String, String>,
    fields: Vec<String>,
    uniq_key: UniqKey,
    where_sql: String,
    binds: Vec<Bind>,
}

fn is_negated(key: &str, value: &str) -> (bool, String) {
    if value.to_lowercase().starts_with("not ") {
        (true, value[4..].to_string())
    } else if value.starts_with('!') || value.starts_with('-') {
        (true, value[1..].to_string())
    } else {
        (key.contains("_not_"), value.to_string())
    }
}

impl RdbmsBackend {
    pub(crate) fn new(
        config: &RdbmsConfig,
        uniq_key: UniqKey,
        facets: &IndexMap<String, Vec<String>>,
        time: Option<&TimeRange>,
    ) -> Self {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();

        for (key, values) in facets {
            let field = key.to_lowercase().replace("_not_", "");
            let Some(column) = config.lookup.get(&field) else {
                continue;
            };
            let mut positive = Vec::new();
            let mut negative = Vec::new();
            for value in values {
                let (negated, value) = is_negated(key, value);
                let value = if field == "file" || field == "uri" {
                    value
                } else {
                    value.to_lowercase()
                };
                binds.push(Bind::Text(value));
                let placeholder = format!("${}", binds.len());
                if negated {
                    negative.push(format!("NOT ({column} = {placeholder})"));
                } else {
                    positive.push(format!("{column} = {placeholder}"));
                }
            }
            let mut clauses: Vec<String> = Vec::new();
            clauses.extend(positive);
            clauses.extend(negative);
            if !clauses.is_empty() {
                conditions.push(format!("({})", clauses.join(" OR ")));
            }
        }

        if let Some(range) = time {
            let time_min = config
                .lookup
                .get("time_min")
                .cloned()
                .unwrap_or_else(|| "time_min".to_string());
            let time_max = config
                .lookup
                .get("time_max")
                .cloned()
                .unwrap_or_else(|| "time_max".to_string());
            binds.push(Bind::Time(range.start));
            let start = format!("${}", binds.len());
            binds.push(Bind::Time(range.end));
            let end = format!("${}", binds.len());
            let condition = match range.method {
                SelectMethod::Flexible => format!(
                    "CAST({time_max} AS timestamp) >= CAST({start} AS timestamp) \
                     AND CAST({time_min} AS timestamp) <= CAST({end} AS timestamp)"
                ),
                SelectMethod::Strict => format!(
                    "CAST({time_min} AS timestamp) <= CAST({start} AS timestamp) \
                     AND CAST({time_max} AS timestamp) >= CAST({end} AS timestamp)"
                ),
                SelectMethod::File => format!(
                    "CAST({time_min} AS timestamp) >= CAST({start} AS timestamp) \
                     AND CAST({time_max} AS timestamp) <= CAST({end} AS timestamp)"
                ),
            };
            conditions.push(format!("({condition})"));
        }

        let where_sql = if conditions.is_empty() {
            "TRUE".to_string()
        } else {
            conditions.join(" AND ")
        };

        Self {
            pool: config.pool.clone(),
            table: config.table.clone(),
            pagination_column: config.pagination_column.clone(),
            lookup: config.lookup.clone(),
            fields: config.fields.clone(),
            uniq_key,
            where_sql,
            binds,
        }
    }

    pub(crate) fn fields(&self) -> Vec<String> {
        self.fields.clone()
    }

    fn bound<'q>(
        &self,
        sql: &'q str,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query(sql);
        for bind in &self.binds {
            query = match bind {
                Bind::Text(v) => query.bind(v.clone()),
                Bind::Time(v) => query.bind(*v),
            };
        }
        query
    }

    fn upstream(error: sqlx::Error) -> SearchError {
        tracing::error!(%error, "RDBMS query failed");
        SearchError::Upstream(format!("search backend error: {error}"))
    }

    pub(crate) async fn count(&self) -> Result<(u16, u64), SearchError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.table, self.where_sql
        );
        let row = self
            .bound(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::upstream)?;
        let total: i64 = row.try_get(0).map_err(Self::upstream)?;
        Ok((200, total.max(0) as u64))
    }

    pub(crate) async fn raw_facet_search(
        &self,
        fields: &[String],
        max_results: i64,
    ) -> Result<RawFacets, SearchError> {
        let (_, total) = self.count().await?;

        let mut facets = IndexMap::new();
        for field in fields {
            let Some(column) = self.lookup.get(field) else {
                continue;
            };
            let sql = format!(
                "SELECT {column} AS value, COUNT(*) AS num FROM {} WHERE {} \
                 GROUP BY {column} ORDER BY {column}",
                self.table, self.where_sql
            );
            let rows = self
                .bound(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(Self::upstream)?;
            let mut counts = Vec::with_capacity(rows.len() * 2);
            for row in rows {
                let value: Option<String> = row.try_get("value").map_err(Self::upstream)?;
                let num: i64 = row.try_get("num").map_err(Self::upstream)?;
                if let Some(value) = value {
                    counts.push(serde_json::Value::String(value));
                    counts.push(serde_json::Value::from(num));
                }
            }
            if !counts.is_empty() {
                facets.insert(field.clone(), counts);
            }
        }

        let mut docs = Vec::new();
        if max_results > 0 {
            let uniq_column = self
                .lookup
                .get(self.uniq_key.as_str())
                .cloned()
                .unwrap_or_else(|| self.uniq_key.as_str().to_string());
            let fs_type = self
                .lookup
                .get("fs_type")
                .cloned()
                .unwrap_or_else(|| "fs_type".to_string());
            let sql = format!(
                "SELECT {uniq_column} AS uniq, {fs_type} AS fs_type FROM {} WHERE {} \
                 ORDER BY {} DESC LIMIT {max_results}",
                self.table, self.where_sql, self.pagination_column
            );
            let rows = self
                .bound(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(Self::upstream)?;
            for row in rows {
                let mut doc = Document::new();
                let uniq: Option<String> = row.try_get("uniq").map_err(Self::upstream)?;
                let fs: Option<String> = row.try_get("fs_type").unwrap_or(None);
                doc.insert(
                    self.uniq_key.as_str().to_string(),
                    serde_json::Value::from(uniq.unwrap_or_default()),
                );
                doc.insert(
                    "fs_type".to_string(),
                    serde_json::Value::from(fs.unwrap_or_else(|| "posix".to_string())),
                );
                docs.push(doc);
            }
        }

        Ok(RawFacets {
            status: 200,
            total,
            facets,
            docs,
        })
    }

    /// Key-set pagination: strictly descending pagination column, the last
    /// seen id as the next page's upper bound.
    pub(crate) fn pages(
        &self,
        fields: PageFields,
    ) -> BoxStream<'static, Result<Document, SearchError>> {
        let this = self.clone();
        let wanted = page_field_list(fields, self.uniq_key);

        futures::stream::try_unfold(
            (None::<i64>, false),
            move |(last_id, done)| {
                let this = this.clone();
                let wanted = wanted.clone();
                async move {
                    if done {
                        return Ok(None);
                    }
                    let mut select: Vec<String> = vec![format!(
                        "{} AS __page_id",
                        this.pagination_column
                    )];
                    for field in &wanted {
                        if let Some(column) = this.lookup.get(field) {
                            select.push(format!("{column} AS {field}"));
                        }
                    }
                    let page_filter = match last_id {
                        Some(id) => format!(" AND {} < {id}", this.pagination_column),
                        None => String::new(),
                    };
                    let sql = format!(
                        "SELECT {} FROM {} WHERE {}{page_filter} ORDER BY {} DESC LIMIT {BATCH_SIZE}",
                        select.join(", "),
                        this.table,
                        this.where_sql,
                        this.pagination_column,
                    );
                    let rows = this
                        .bound(&sql)
                        .fetch_all(&this.pool)
                        .await
                        .map_err(Self::upstream)?;

                    let mut docs = Vec::with_capacity(rows.len());
                    let mut next_id = last_id;
                    for row in &rows {
                        let id: i64 = row.try_get("__page_id").map_err(Self::upstream)?;
                        next_id = Some(id);
                        let mut doc = Document::new();
                        for field in &wanted {
                            if this.lookup.contains_key(field) {
                                let value: Option<String> =
                                    row.try_get(field.as_str()).unwrap_or(None);
                                if let Some(value) = value {
                                    doc.insert(field.clone(), serde_json::Value::from(value));
                                }
                            }
                        }
                        docs.push(doc);
                    }
                    let done = rows.len() < BATCH_SIZE;
                    Ok(Some((docs, (next_id, done))))
                }
            },
        )
        .map_ok(|docs| futures::stream::iter(docs.into_iter().map(Ok::<Document, SearchError>)))
        .try_flatten()
        .boxed()
    }
}
