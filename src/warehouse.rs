use crate::config::{LoadMode, WarehouseConfig};
use crate::models::{ColumnKind, ColumnValue, TickerRecord};
use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

const APPLICATION_NAME: &str = "ticker-sync";
const STAGING_SUFFIX: &str = "__staging_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub table: String,
    pub rows_inserted: u64,
    pub mode: LoadMode,
}

/// A single warehouse session. The connection closes when this is dropped.
pub struct Warehouse {
    client: Client,
}

impl Warehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        log_connection_parameters(config);

        let mut pg_config = match config.url.as_deref() {
            Some(url) => url
                .parse::<tokio_postgres::Config>()
                .context("WAREHOUSE_URL is not a valid connection string")?,
            None => tokio_postgres::Config::new(),
        };
        if let Some(user) = config.user.as_deref() {
            pg_config.user(user);
        }
        if let Some(password) = config.password.as_deref() {
            pg_config.password(password);
        }
        if let Some(account) = config.account.as_deref() {
            pg_config.host(account);
        }
        if let Some(port) = config.port {
            pg_config.port(port);
        }
        if let Some(database) = config.database.as_deref() {
            pg_config.dbname(database);
        }
        match config.warehouse.as_deref() {
            Some(warehouse) => {
                pg_config.application_name(&format!("{}:{}", APPLICATION_NAME, warehouse));
            }
            None => {
                pg_config.application_name(APPLICATION_NAME);
            }
        }

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .context("failed to connect to the warehouse")?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("Warehouse connection error: {}", err);
            }
        });

        if let Some(role) = config.role.as_deref() {
            client
                .batch_execute(&format!("SET ROLE {}", quote_identifier(role)))
                .await
                .with_context(|| format!("failed to assume role {}", role))?;
        }
        if let Some(schema) = config.schema.as_deref() {
            client
                .batch_execute(&format!("SET search_path TO {}", quote_identifier(schema)))
                .await
                .with_context(|| format!("failed to select schema {}", schema))?;
        }

        Ok(Self { client })
    }

    /// Replaces `table` with `records`, typed from `fields`. In `Replace` mode the
    /// old table is dropped before the new one exists; a failure after the drop
    /// leaves the table absent.
    pub async fn replace_table(
        &mut self,
        table: &str,
        records: &[TickerRecord],
        fields: &[&str],
        mode: LoadMode,
    ) -> Result<LoadSummary> {
        validate_table_name(table)?;
        if fields.is_empty() {
            return Err(anyhow!("cannot create {} without any columns", table));
        }

        let rows_inserted = match mode {
            LoadMode::Replace => {
                for statement in replace_statements(table, fields) {
                    info!("Executing: {}", statement);
                    self.client
                        .batch_execute(&statement)
                        .await
                        .with_context(|| format!("failed to execute `{}`", statement))?;
                }
                self.insert_records(table, records, fields).await?
            }
            LoadMode::Swap => self.swap_in(table, records, fields).await?,
        };

        info!(
            "Loaded {} rows into {} ({} mode)",
            rows_inserted,
            table,
            mode.label()
        );
        Ok(LoadSummary {
            table: table.to_string(),
            rows_inserted,
            mode,
        })
    }

    pub async fn row_count(&self, table: &str) -> Result<i64> {
        validate_table_name(table)?;
        let row = self
            .client
            .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
            .await
            .with_context(|| format!("failed to count rows in {}", table))?;
        Ok(row.get(0))
    }

    async fn swap_in(
        &mut self,
        table: &str,
        records: &[TickerRecord],
        fields: &[&str],
    ) -> Result<u64> {
        let staging = staging_table_name(table);
        for statement in replace_statements(&staging, fields) {
            info!("Executing: {}", statement);
            self.client
                .batch_execute(&statement)
                .await
                .with_context(|| format!("failed to execute `{}`", statement))?;
        }

        let inserted = match self.insert_records(&staging, records, fields).await {
            Ok(inserted) => inserted,
            Err(err) => {
                self.discard_staging(&staging).await;
                return Err(err);
            }
        };

        let swap_result = async {
            let tx = self.client.transaction().await?;
            tx.batch_execute(&drop_table_sql(table)).await?;
            tx.batch_execute(&format!(
                "ALTER TABLE {} RENAME TO {}",
                staging,
                unqualified_name(table)
            ))
            .await?;
            tx.commit().await?;
            Ok::<(), tokio_postgres::Error>(())
        }
        .await;

        if let Err(err) = swap_result {
            self.discard_staging(&staging).await;
            return Err(err).with_context(|| format!("failed to swap {} into {}", staging, table));
        }
        info!("Swapped {} into {}", staging, table);
        Ok(inserted)
    }

    async fn discard_staging(&self, staging: &str) {
        if let Err(err) = self.client.batch_execute(&drop_table_sql(staging)).await {
            warn!("Failed to drop staging table {}: {}", staging, err);
        }
    }

    async fn insert_records(
        &mut self,
        table: &str,
        records: &[TickerRecord],
        fields: &[&str],
    ) -> Result<u64> {
        if records.is_empty() {
            info!("No records to insert into {}", table);
            return Ok(0);
        }

        let insert = insert_sql(table, fields);
        let tx = self.client.transaction().await?;
        let statement = tx
            .prepare(&insert)
            .await
            .with_context(|| format!("failed to prepare `{}`", insert))?;

        let mut inserted = 0u64;
        for record in records {
            let values = record.conform(fields);
            let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(sql_param).collect();
            inserted += tx.execute(&statement, &params).await.with_context(|| {
                format!(
                    "failed to insert ticker {} into {}",
                    record.ticker.as_deref().unwrap_or("<unknown>"),
                    table
                )
            })?;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

fn sql_param(value: &ColumnValue) -> &(dyn ToSql + Sync) {
    match value {
        ColumnValue::Text(text) => text,
        ColumnValue::Boolean(flag) => flag,
        ColumnValue::Timestamp(timestamp) => timestamp,
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn column_definitions(fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .map(|field| {
            format!(
                "{} {}",
                quote_identifier(&field.to_uppercase()),
                ColumnKind::for_field(field).sql_type()
            )
        })
        .collect()
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", table)
}

pub fn create_table_sql(table: &str, fields: &[&str]) -> String {
    format!(
        "CREATE TABLE {} ( {} )",
        table,
        column_definitions(fields).join(", ")
    )
}

/// The DDL issued before inserting: always the drop, then the create.
pub fn replace_statements(table: &str, fields: &[&str]) -> [String; 2] {
    [drop_table_sql(table), create_table_sql(table, fields)]
}

pub fn insert_sql(table: &str, fields: &[&str]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|field| quote_identifier(&field.to_uppercase()))
        .collect();
    let placeholders: Vec<String> = (1..=fields.len()).map(|idx| format!("${}", idx)).collect();
    format!(
        "INSERT INTO {} ( {} ) VALUES ( {} )",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Accepts `name` or `schema.name` where each part is a plain SQL identifier.
pub fn validate_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        });
    if valid {
        Ok(())
    } else {
        Err(anyhow!(
            "WAREHOUSE_TABLE must be a table name or schema.table made of letters, digits and underscores (value: {})",
            table
        ))
    }
}

fn unqualified_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

fn staging_table_name(table: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}{}", table, STAGING_SUFFIX, &suffix[..8])
}

pub fn mask_secret(value: Option<&str>) -> String {
    match value {
        Some(secret) if !secret.is_empty() => "*".repeat(secret.chars().count()),
        _ => "NOT SET".to_string(),
    }
}

fn log_connection_parameters(config: &WarehouseConfig) {
    let or_unset = |value: Option<&str>| value.unwrap_or("NOT SET").to_string();
    info!("Warehouse connection parameters:");
    info!("  URL: {}", if config.url.is_some() { "SET" } else { "NOT SET" });
    info!("  User: {}", or_unset(config.user.as_deref()));
    info!("  Account: {}", or_unset(config.account.as_deref()));
    info!("  Database: {}", or_unset(config.database.as_deref()));
    info!("  Schema: {}", or_unset(config.schema.as_deref()));
    info!("  Warehouse: {}", or_unset(config.warehouse.as_deref()));
    info!("  Role: {}", or_unset(config.role.as_deref()));
    info!("  Password: {}", mask_secret(config.password.as_deref()));
}
