use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool, Postgres, Row as _};
use std::collections::HashSet;

use crate::model::{
    Fields, ManyToMany, OneToMany, RecordId, Relationship, Row, SyncEntry, SyncTarget, ID_KEY,
};
use crate::store::traits::{AssociationSync, RelationStore, RelationTransaction};
use crate::store::StoreError;

/// Relationship store over user tables in PostgreSQL.
///
/// Related tables need a `BIGINT id` primary key. Attribute maps are bound as a
/// single `jsonb` parameter and expanded with `jsonb_populate_record`, so column
/// types come from the table definition.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }
}

/// Quotes a table or column name. Only plain identifiers are accepted since
/// names reach the SQL text.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

fn attribute_columns(attributes: &Fields) -> Result<Vec<String>, StoreError> {
    attributes
        .keys()
        .filter(|key| key.as_str() != ID_KEY)
        .map(|key| quote_ident(key))
        .collect()
}

fn select_one_to_many_sql(rel: &OneToMany) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT to_jsonb(r) AS record FROM {} r WHERE r.{} = $1 ORDER BY r.\"id\"",
        quote_ident(&rel.related_table)?,
        quote_ident(&rel.foreign_key)?
    ))
}

fn select_many_to_many_sql(rel: &ManyToMany) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT to_jsonb(r) AS record FROM {} r JOIN {} p ON p.{} = r.\"id\" WHERE p.{} = $1 ORDER BY r.\"id\"",
        quote_ident(&rel.related_table)?,
        quote_ident(&rel.pivot_table)?,
        quote_ident(&rel.related_pivot_key)?,
        quote_ident(&rel.foreign_pivot_key)?
    ))
}

fn insert_sql(table: &str, attributes: &Fields) -> Result<String, StoreError> {
    let table = quote_ident(table)?;
    let columns = attribute_columns(attributes)?;
    if columns.is_empty() {
        return Ok(format!("INSERT INTO {} DEFAULT VALUES RETURNING \"id\"", table));
    }
    let columns = columns.join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) RETURNING \"id\""
    ))
}

/// `$1` is the id, `$2` the attributes, `$3` the parent id when `owner_column` is set.
fn update_sql(table: &str, attributes: &Fields, owner_column: Option<&str>) -> Result<Option<String>, StoreError> {
    let columns = attribute_columns(attributes)?;
    if columns.is_empty() {
        return Ok(None);
    }
    let quoted_table = quote_ident(table)?;
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = r.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "UPDATE {quoted_table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{quoted_table}, $2) AS r WHERE t.\"id\" = $1"
    );
    if let Some(owner_column) = owner_column {
        sql.push_str(&format!(" AND t.{} = $3", quote_ident(owner_column)?));
    }
    Ok(Some(sql))
}

fn attributes_value(attributes: &Fields) -> serde_json::Value {
    let mut object = attributes.clone();
    object.remove(ID_KEY);
    serde_json::Value::Object(object)
}

async fn fetch_related_on(conn: &mut PgConnection, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
    let (sql, parent_id) = match relationship {
        Relationship::OneToMany(rel) => (select_one_to_many_sql(rel)?, rel.parent.id),
        Relationship::ManyToMany(rel) => (select_many_to_many_sql(rel)?, rel.parent.id),
    };

    let records = sqlx::query(&sql).bind(parent_id).fetch_all(&mut *conn).await?;

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let value: serde_json::Value = record.try_get("record")?;
        rows.push(Row::from_value(value)?);
    }
    Ok(rows)
}

async fn insert_on(conn: &mut PgConnection, table: &str, attributes: &Fields) -> Result<RecordId, StoreError> {
    let sql = insert_sql(table, attributes)?;
    let row = sqlx::query(&sql)
        .bind(attributes_value(attributes))
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("id")?)
}

#[async_trait::async_trait]
impl RelationStore for PostgresStore {
    async fn fetch_related(&self, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_related_on(&mut conn, relationship).await
    }

    async fn begin(&self) -> Result<Box<dyn RelationTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| {
            StoreError::transaction(format!("Failed to begin transaction: {}", e))
        })?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// One reconciliation pass. sqlx rolls back on drop if neither commit nor rollback ran.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl RelationTransaction for PostgresTransaction {
    async fn fetch_related(&mut self, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
        fetch_related_on(&mut self.tx, relationship).await
    }

    async fn detach(&mut self, relation: &ManyToMany, ids: &[RecordId]) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1 AND {} = ANY($2)",
            quote_ident(&relation.pivot_table)?,
            quote_ident(&relation.foreign_pivot_key)?,
            quote_ident(&relation.related_pivot_key)?
        );
        sqlx::query(&sql)
            .bind(relation.parent.id)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn sync_associations(
        &mut self,
        relation: &ManyToMany,
        entries: &[SyncEntry],
    ) -> Result<AssociationSync, StoreError> {
        let related = quote_ident(&relation.related_table)?;
        let pivot = quote_ident(&relation.pivot_table)?;
        let fpk = quote_ident(&relation.foreign_pivot_key)?;
        let rpk = quote_ident(&relation.related_pivot_key)?;

        let exists_sql = format!("SELECT EXISTS(SELECT 1 FROM {related} WHERE \"id\" = $1) AS found");
        let attach_sql = format!(
            "INSERT INTO {pivot} ({fpk}, {rpk}) SELECT $1, $2 \
             WHERE NOT EXISTS (SELECT 1 FROM {pivot} WHERE {fpk} = $1 AND {rpk} = $2)"
        );
        let prune_sql = format!("DELETE FROM {pivot} WHERE {fpk} = $1 AND NOT ({rpk} = ANY($2))");

        let mut outcome = AssociationSync::default();
        let mut seen = HashSet::new();

        for entry in entries {
            let related_id = match &entry.target {
                SyncTarget::Existing(id) => {
                    let found: bool = sqlx::query(&exists_sql)
                        .bind(*id)
                        .fetch_one(&mut *self.tx)
                        .await?
                        .try_get("found")?;
                    if !found {
                        return Err(StoreError::constraint(format!(
                            "{} {} does not exist",
                            relation.related_table, id
                        )));
                    }
                    if let Some(sql) = update_sql(&relation.related_table, &entry.attributes, None)? {
                        sqlx::query(&sql)
                            .bind(*id)
                            .bind(attributes_value(&entry.attributes))
                            .execute(&mut *self.tx)
                            .await?;
                        outcome.updated.push(*id);
                    }
                    *id
                }
                SyncTarget::New(_) => {
                    let id = insert_on(&mut self.tx, &relation.related_table, &entry.attributes).await?;
                    outcome.created.push(id);
                    id
                }
            };

            if seen.insert(related_id) {
                sqlx::query(&attach_sql)
                    .bind(relation.parent.id)
                    .bind(related_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            outcome.members.push(related_id);
        }

        sqlx::query(&prune_sql)
            .bind(relation.parent.id)
            .bind(outcome.members.clone())
            .execute(&mut *self.tx)
            .await?;

        Ok(outcome)
    }

    async fn delete_by_ids(&mut self, relation: &OneToMany, ids: &[RecordId]) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE \"id\" = ANY($1) AND {} = $2",
            quote_ident(&relation.related_table)?,
            quote_ident(&relation.foreign_key)?
        );
        let result = sqlx::query(&sql)
            .bind(ids.to_vec())
            .bind(relation.parent.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_owned(&mut self, relation: &OneToMany, attributes: &Fields) -> Result<RecordId, StoreError> {
        let mut owned = attributes.clone();
        owned.insert(relation.foreign_key.clone(), relation.parent.id.into());
        insert_on(&mut self.tx, &relation.related_table, &owned).await
    }

    async fn update_by_id(
        &mut self,
        relation: &OneToMany,
        id: RecordId,
        attributes: &Fields,
    ) -> Result<bool, StoreError> {
        let mut owned = attributes.clone();
        owned.insert(relation.foreign_key.clone(), relation.parent.id.into());
        let Some(sql) = update_sql(&relation.related_table, &owned, Some(&relation.foreign_key))? else {
            return Ok(false);
        };
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(attributes_value(&owned))
            .bind(relation.parent.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to commit transaction: {}", e)))?;
        log::debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to rollback transaction: {}", e)))?;
        log::debug!("Transaction rolled back");
        Ok(())
    }
}
