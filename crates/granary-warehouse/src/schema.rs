//! DW schema manager: idempotent CREATE and additive ALTER.
//!
//! Column types are derived from the staged file's Arrow schema via the
//! dialect type map. Two audit columns ride along on every table:
//! `_loaded_at` (timestamp, defaults to the warehouse clock) and
//! `_source_file` (text lineage). Columns only ever grow; nothing is
//! dropped or retyped.

use std::collections::HashSet;

use arrow::datatypes::SchemaRef;
use sqlx::Row;
use tracing::info;

use granary_core::{DbEngine, Dialect, EtlError};

/// Ensure `table` exists with at least the columns of `schema_ref` plus the
/// audit columns, adding any that are missing. All DDL runs in one
/// transaction.
pub async fn ensure_table_exists(
    engine: &DbEngine,
    table: &str,
    schema_ref: &SchemaRef,
    dw_schema: Option<&str>,
) -> Result<(), EtlError> {
    let dialect = engine.dialect();
    let qualified = dialect.qualified_table(dw_schema, table);

    let mut required: Vec<(String, String)> = schema_ref
        .fields()
        .iter()
        .map(|field| {
            (
                field.name().clone(),
                dialect.sql_type(field.data_type()).to_string(),
            )
        })
        .collect();
    required.push((
        "_loaded_at".to_string(),
        format!("{} DEFAULT {}", dialect.timestamp_type(), dialect.now_expr()),
    ));
    required.push(("_source_file".to_string(), dialect.text_type().to_string()));

    let mut tx = engine
        .pool()
        .begin()
        .await
        .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;

    let definitions: Vec<String> = required
        .iter()
        .map(|(name, column_type)| format!("{} {}", dialect.quote_ident(name), column_type))
        .collect();
    let create_sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified,
        definitions.join(", ")
    );
    info!(ddl = %create_sql, "ensuring target table");
    sqlx::query(&create_sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;

    let existing = existing_columns(&mut tx, dialect, table, dw_schema).await?;
    for (name, column_type) in required
        .iter()
        .filter(|(name, _)| !existing.contains(name))
    {
        let alter_sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            qualified,
            dialect.quote_ident(name),
            column_type
        );
        info!(ddl = %alter_sql, column = %name, "adding missing column");
        sqlx::query(&alter_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;
    }

    tx.commit()
        .await
        .map_err(|e| EtlError::SchemaFailed(e.to_string()))
}

async fn existing_columns(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    dialect: Dialect,
    table: &str,
    dw_schema: Option<&str>,
) -> Result<HashSet<String>, EtlError> {
    let mut columns = HashSet::new();

    match dialect {
        Dialect::Sqlite => {
            let sql = format!("PRAGMA table_info({})", dialect.quote_ident(table));
            let rows = sqlx::query(&sql)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;
            for row in rows {
                let name: String = row
                    .try_get("name")
                    .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;
                columns.insert(name);
            }
        }
        _ => {
            let sql = format!(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = {} AND table_name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2)
            );
            let rows = sqlx::query(&sql)
                .bind(dw_schema.unwrap_or("public"))
                .bind(table)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;
            for row in rows {
                let name: String = row
                    .try_get(0)
                    .map_err(|e| EtlError::SchemaFailed(e.to_string()))?;
                columns.insert(name);
            }
        }
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    async fn sqlite_engine(dir: &tempfile::TempDir) -> DbEngine {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("dw.db").display());
        DbEngine::connect(&url, 5).await.unwrap()
    }

    fn schema(fields: &[(&str, DataType)]) -> SchemaRef {
        Arc::new(Schema::new(
            fields
                .iter()
                .map(|(name, dt)| Field::new(*name, dt.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    async fn column_names(engine: &DbEngine, table: &str) -> Vec<String> {
        let sql = format!("PRAGMA table_info(\"{}\")", table);
        let rows = sqlx::query(&sql).fetch_all(engine.pool()).await.unwrap();
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").unwrap())
            .collect()
    }

    async fn column_types(engine: &DbEngine, table: &str) -> Vec<(String, String)> {
        let sql = format!("PRAGMA table_info(\"{}\")", table);
        let rows = sqlx::query(&sql).fetch_all(engine.pool()).await.unwrap();
        rows.iter()
            .map(|row| {
                (
                    row.try_get::<String, _>("name").unwrap(),
                    row.try_get::<String, _>("type").unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn create_includes_audit_columns() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sqlite_engine(&dir).await;

        ensure_table_exists(
            &engine,
            "stg_users",
            &schema(&[("id", DataType::Int64), ("name", DataType::Utf8)]),
            None,
        )
        .await
        .unwrap();

        let names = column_names(&engine, "stg_users").await;
        assert!(names.contains(&"id".to_string()));
        assert!(names.contains(&"name".to_string()));
        assert!(names.contains(&"_loaded_at".to_string()));
        assert!(names.contains(&"_source_file".to_string()));
        engine.close().await;
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sqlite_engine(&dir).await;
        let frame = schema(&[("id", DataType::Int64)]);

        ensure_table_exists(&engine, "stg_idem", &frame, None).await.unwrap();
        ensure_table_exists(&engine, "stg_idem", &frame, None).await.unwrap();

        let names = column_names(&engine, "stg_idem").await;
        assert_eq!(names.iter().filter(|n| *n == "id").count(), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn columns_grow_additively_and_keep_their_types() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sqlite_engine(&dir).await;

        ensure_table_exists(&engine, "stg_grow", &schema(&[("a", DataType::Int64)]), None)
            .await
            .unwrap();
        let before = column_types(&engine, "stg_grow").await;

        ensure_table_exists(
            &engine,
            "stg_grow",
            &schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]),
            None,
        )
        .await
        .unwrap();
        ensure_table_exists(
            &engine,
            "stg_grow",
            &schema(&[
                ("a", DataType::Int64),
                ("b", DataType::Utf8),
                ("c", DataType::Float64),
            ]),
            None,
        )
        .await
        .unwrap();

        let after = column_types(&engine, "stg_grow").await;
        let names: Vec<&String> = after.iter().map(|(n, _)| n).collect();
        assert!(names.contains(&&"a".to_string()));
        assert!(names.contains(&&"b".to_string()));
        assert!(names.contains(&&"c".to_string()));

        // No historical column changed type.
        for (name, column_type) in &before {
            let kept = after.iter().find(|(n, _)| n == name).unwrap();
            assert_eq!(&kept.1, column_type, "column {} was retyped", name);
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn quoted_identifiers_survive_awkward_names() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sqlite_engine(&dir).await;

        ensure_table_exists(
            &engine,
            "stg quoted",
            &schema(&[("select", DataType::Utf8)]),
            None,
        )
        .await
        .unwrap();

        let names = column_names(&engine, "stg quoted").await;
        assert!(names.contains(&"select".to_string()));
        engine.close().await;
    }
}
