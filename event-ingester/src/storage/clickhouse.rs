use anyhow::Context;
use async_trait::async_trait;
use clickhouse::Client;
use tracing::{debug, info};

use super::StorageWriter;
use crate::config::Config;
use crate::error::StorageError;
use crate::events::EventRow;

#[derive(Clone)]
pub struct ClickHouseWriter {
    client: Client,
    table: String,
}

impl ClickHouseWriter {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone())
            .with_option("load_balancing", "in_order")
            .with_option("insert_distributed_sync", "1");

        // Verify connection
        client
            .query("SELECT 1")
            .execute()
            .await
            .context("Failed to connect to ClickHouse")?;

        info!(
            "Successfully connected to ClickHouse at {}",
            config.clickhouse_url
        );

        Ok(Self::from_client(client, config.clickhouse_table.clone()))
    }

    pub fn from_client(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl StorageWriter for ClickHouseWriter {
    async fn write(&self, rows: &[EventRow]) -> Result<(), StorageError> {
        let mut insert = self.client.insert::<EventRow>(&self.table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;

        debug!(table = %self.table, rows = rows.len(), "Inserted rows");
        Ok(())
    }
}
