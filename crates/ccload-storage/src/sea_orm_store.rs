use std::str::FromStr;

use async_trait::async_trait;
use ccload_common::{ChannelId, ChannelType, KeyIndex, KeyStrategy};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DbBackend, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Schema,
    Set, Statement, TransactionTrait,
};
use time::OffsetDateTime;

use crate::entities::{api_key, channel, channel_cooldown, key_cooldown, log_entry, setting};
use crate::error::{StorageError, StorageResult};
use crate::store::{Store, UsageAggregateFilter};
use crate::types::{
    ApiKey, Channel, ChannelSuccessRate, LogEntry, ModelEntry, NewChannel, UsageAggregate,
};

pub struct SeaOrmStore {
    conn: DatabaseConnection,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let mut opts = ConnectOptions::new(dsn.to_owned());
        opts.sqlx_logging(false);
        let conn = Database::connect(opts).await?;
        Ok(Self { conn })
    }

    /// Entity-first schema sync, mirroring the teacher's bootstrap-time
    /// `sync()` call; acceptable for a single-process sqlite deployment.
    pub async fn sync(&self) -> StorageResult<()> {
        let backend = self.conn.get_database_backend();
        if backend != DbBackend::Sqlite {
            return Ok(());
        }
        let schema = Schema::new(backend);
        for stmt in [
            schema.create_table_from_entity(channel::Entity).if_not_exists(),
            schema.create_table_from_entity(api_key::Entity).if_not_exists(),
            schema
                .create_table_from_entity(channel_cooldown::Entity)
                .if_not_exists(),
            schema
                .create_table_from_entity(key_cooldown::Entity)
                .if_not_exists(),
            schema.create_table_from_entity(log_entry::Entity).if_not_exists(),
            schema.create_table_from_entity(setting::Entity).if_not_exists(),
        ] {
            self.conn
                .execute(backend.build(&stmt))
                .await
                .map_err(StorageError::Db)?;
        }
        Ok(())
    }

    fn row_to_channel(
        row: channel::Model,
        key_count: u32,
    ) -> StorageResult<Channel> {
        let channel_type = ChannelType::from_str(&row.channel_type)
            .map_err(|_| StorageError::InvalidChannelType(row.channel_type.clone()))?;
        let key_strategy = KeyStrategy::from_str(&row.key_strategy).unwrap_or(KeyStrategy::Sequential);
        let models: Vec<ModelEntry> = serde_json::from_str(&row.models_json)?;
        Ok(Channel {
            id: row.id,
            name: row.name,
            url: row.url,
            channel_type,
            priority: row.priority,
            enabled: row.enabled,
            models,
            key_strategy,
            key_count,
        })
    }
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn list_configs(&self) -> StorageResult<Vec<Channel>> {
        let rows = channel::Entity::find()
            .order_by_asc(channel::Column::Id)
            .all(&self.conn)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key_count = api_key::Entity::find()
                .filter(api_key::Column::ChannelId.eq(row.id))
                .count(&self.conn)
                .await? as u32;
            out.push(Self::row_to_channel(row, key_count)?);
        }
        Ok(out)
    }

    async fn get_config(&self, id: ChannelId) -> StorageResult<Option<Channel>> {
        let Some(row) = channel::Entity::find_by_id(id).one(&self.conn).await? else {
            return Ok(None);
        };
        let key_count = api_key::Entity::find()
            .filter(api_key::Column::ChannelId.eq(id))
            .count(&self.conn)
            .await? as u32;
        Ok(Some(Self::row_to_channel(row, key_count)?))
    }

    async fn get_enabled_channels_by_model(&self, model: &str) -> StorageResult<Vec<Channel>> {
        let all = self.list_configs().await?;
        Ok(all
            .into_iter()
            .filter(|c| {
                c.enabled
                    && (model == "*" || c.models.iter().any(|m| m.name == model))
            })
            .collect())
    }

    async fn get_enabled_channels_by_type(&self, t: ChannelType) -> StorageResult<Vec<Channel>> {
        let all = self.list_configs().await?;
        Ok(all
            .into_iter()
            .filter(|c| c.enabled && c.channel_type as u8 == t as u8)
            .collect())
    }

    async fn create_config(&self, new: NewChannel) -> StorageResult<ChannelId> {
        let now = OffsetDateTime::now_utc();
        let active = channel::ActiveModel {
            id: ActiveValue::NotSet,
            name: Set(new.name.clone()),
            url: Set(new.url.trim_end_matches('/').to_owned()),
            channel_type: Set(new.channel_type.as_str().to_owned()),
            priority: Set(new.priority),
            enabled: Set(new.enabled),
            models_json: Set(serde_json::to_string(&new.models)?),
            key_strategy: Set(match new.key_strategy {
                KeyStrategy::Sequential => "sequential".to_owned(),
                KeyStrategy::RoundRobin => "round_robin".to_owned(),
            }),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        let inserted = active.insert(&self.conn).await?;
        if !new.api_keys.is_empty() {
            self.create_api_keys_batch(inserted.id, &new.api_keys).await?;
        }
        Ok(inserted.id)
    }

    async fn update_config(&self, id: ChannelId, new: NewChannel) -> StorageResult<()> {
        let Some(existing) = channel::Entity::find_by_id(id).one(&self.conn).await? else {
            return Err(StorageError::NotFound(format!("channel {id}")));
        };
        let mut active: channel::ActiveModel = existing.into();
        active.name = Set(new.name);
        active.url = Set(new.url.trim_end_matches('/').to_owned());
        active.channel_type = Set(new.channel_type.as_str().to_owned());
        active.priority = Set(new.priority);
        active.enabled = Set(new.enabled);
        active.models_json = Set(serde_json::to_string(&new.models)?);
        active.key_strategy = Set(match new.key_strategy {
            KeyStrategy::Sequential => "sequential".to_owned(),
            KeyStrategy::RoundRobin => "round_robin".to_owned(),
        });
        active.updated_at = Set(OffsetDateTime::now_utc().into());
        active.update(&self.conn).await?;

        api_key::Entity::delete_many()
            .filter(api_key::Column::ChannelId.eq(id))
            .exec(&self.conn)
            .await?;
        if !new.api_keys.is_empty() {
            self.create_api_keys_batch(id, &new.api_keys).await?;
        }
        Ok(())
    }

    async fn delete_config(&self, id: ChannelId) -> StorageResult<()> {
        channel::Entity::delete_by_id(id).exec(&self.conn).await?;
        api_key::Entity::delete_many()
            .filter(api_key::Column::ChannelId.eq(id))
            .exec(&self.conn)
            .await?;
        self.clear_channel_cooldown(id).await?;
        key_cooldown::Entity::delete_many()
            .filter(key_cooldown::Column::ChannelId.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_api_keys(&self, channel_id: ChannelId) -> StorageResult<Vec<ApiKey>> {
        let rows = api_key::Entity::find()
            .filter(api_key::Column::ChannelId.eq(channel_id))
            .order_by_asc(api_key::Column::KeyIndex)
            .all(&self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ApiKey {
                channel_id: r.channel_id,
                key_index: r.key_index as KeyIndex,
                secret: r.secret,
            })
            .collect())
    }

    async fn get_all_api_keys(&self) -> StorageResult<Vec<ApiKey>> {
        let rows = api_key::Entity::find().all(&self.conn).await?;
        Ok(rows
            .into_iter()
            .map(|r| ApiKey {
                channel_id: r.channel_id,
                key_index: r.key_index as KeyIndex,
                secret: r.secret,
            })
            .collect())
    }

    async fn create_api_keys_batch(
        &self,
        channel_id: ChannelId,
        secrets: &[String],
    ) -> StorageResult<()> {
        let existing = api_key::Entity::find()
            .filter(api_key::Column::ChannelId.eq(channel_id))
            .count(&self.conn)
            .await? as i32;
        let models = secrets.iter().enumerate().map(|(i, secret)| api_key::ActiveModel {
            id: ActiveValue::NotSet,
            channel_id: Set(channel_id),
            key_index: Set(existing + i as i32),
            secret: Set(secret.clone()),
        });
        api_key::Entity::insert_many(models).exec(&self.conn).await?;
        Ok(())
    }

    async fn get_channel_cooldown(&self, id: ChannelId) -> StorageResult<Option<OffsetDateTime>> {
        Ok(channel_cooldown::Entity::find_by_id(id)
            .one(&self.conn)
            .await?
            .map(|r| r.expires_at.assume_utc()))
    }

    async fn set_channel_cooldown(
        &self,
        id: ChannelId,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()> {
        let active = channel_cooldown::ActiveModel {
            channel_id: Set(id),
            expires_at: Set(expires_at.into()),
        };
        channel_cooldown::Entity::insert(active)
            .on_conflict(
                OnConflict::column(channel_cooldown::Column::ChannelId)
                    .update_column(channel_cooldown::Column::ExpiresAt)
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_all_channel_cooldowns(&self) -> StorageResult<Vec<(ChannelId, OffsetDateTime)>> {
        let rows = channel_cooldown::Entity::find().all(&self.conn).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.channel_id, r.expires_at.assume_utc()))
            .collect())
    }

    async fn clear_channel_cooldown(&self, id: ChannelId) -> StorageResult<()> {
        channel_cooldown::Entity::delete_by_id(id)
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_key_cooldown(
        &self,
        id: ChannelId,
        key_index: KeyIndex,
    ) -> StorageResult<Option<OffsetDateTime>> {
        Ok(key_cooldown::Entity::find_by_id((id, key_index as i32))
            .one(&self.conn)
            .await?
            .map(|r| r.expires_at.assume_utc()))
    }

    async fn set_key_cooldown(
        &self,
        id: ChannelId,
        key_index: KeyIndex,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()> {
        let active = key_cooldown::ActiveModel {
            channel_id: Set(id),
            key_index: Set(key_index as i32),
            expires_at: Set(expires_at.into()),
        };
        key_cooldown::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([key_cooldown::Column::ChannelId, key_cooldown::Column::KeyIndex])
                    .update_column(key_cooldown::Column::ExpiresAt)
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_all_key_cooldowns(
        &self,
    ) -> StorageResult<Vec<(ChannelId, KeyIndex, OffsetDateTime)>> {
        let rows = key_cooldown::Entity::find().all(&self.conn).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.channel_id, r.key_index as KeyIndex, r.expires_at.assume_utc()))
            .collect())
    }

    async fn clear_key_cooldown(&self, id: ChannelId, key_index: KeyIndex) -> StorageResult<()> {
        key_cooldown::Entity::delete_by_id((id, key_index as i32))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn add_log(&self, entry: LogEntry) -> StorageResult<()> {
        self.batch_add_logs(std::slice::from_ref(&entry)).await
    }

    async fn batch_add_logs(&self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let models = entries.iter().map(|e| log_entry::ActiveModel {
            id: ActiveValue::NotSet,
            at: Set(e.at.into()),
            channel_id: Set(e.channel_id),
            model: Set(e.model.clone()),
            caller_token_hash: Set(e.caller_token_hash.clone()),
            caller_token_id: Set(e.caller_token_id.clone()),
            status: Set(e.status),
            duration_ms: Set(e.duration_ms),
            first_byte_ms: Set(e.first_byte_ms),
            is_stream: Set(e.is_stream),
            message: Set(e.message.clone()),
            input_tokens: Set(e.input_tokens),
            output_tokens: Set(e.output_tokens),
            cache_read_input_tokens: Set(e.cache_read_input_tokens),
            cache_creation_input_tokens: Set(e.cache_creation_input_tokens),
            cost_usd: Set(e.cost_usd),
        });
        let txn = self.conn.begin().await?;
        log_entry::Entity::insert_many(models).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn list_logs_range(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<LogEntry>> {
        let rows = log_entry::Entity::find()
            .filter(log_entry::Column::At.gte(from))
            .filter(log_entry::Column::At.lt(to))
            .order_by_desc(log_entry::Column::At)
            .offset(offset as u64)
            .limit(limit as u64)
            .all(&self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| LogEntry {
                at: r.at.assume_utc(),
                channel_id: r.channel_id,
                model: r.model,
                caller_token_hash: r.caller_token_hash,
                caller_token_id: r.caller_token_id,
                status: r.status,
                duration_ms: r.duration_ms,
                first_byte_ms: r.first_byte_ms,
                is_stream: r.is_stream,
                message: r.message,
                input_tokens: r.input_tokens,
                output_tokens: r.output_tokens,
                cache_read_input_tokens: r.cache_read_input_tokens,
                cache_creation_input_tokens: r.cache_creation_input_tokens,
                cost_usd: r.cost_usd,
            })
            .collect())
    }

    async fn count_logs_range(&self, from: OffsetDateTime, to: OffsetDateTime) -> StorageResult<i64> {
        Ok(log_entry::Entity::find()
            .filter(log_entry::Column::At.gte(from))
            .filter(log_entry::Column::At.lt(to))
            .count(&self.conn)
            .await? as i64)
    }

    async fn cleanup_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        let res = log_entry::Entity::delete_many()
            .filter(log_entry::Column::At.lt(cutoff))
            .exec(&self.conn)
            .await?;
        Ok(res.rows_affected)
    }

    async fn aggregate(&self, filter: UsageAggregateFilter) -> StorageResult<UsageAggregate> {
        let mut q = log_entry::Entity::find()
            .filter(log_entry::Column::At.gte(filter.from))
            .filter(log_entry::Column::At.lt(filter.to));
        if let Some(id) = filter.channel_id {
            q = q.filter(log_entry::Column::ChannelId.eq(id));
        }
        if let Some(model) = filter.model {
            q = q.filter(log_entry::Column::Model.eq(model));
        }
        let rows = q.all(&self.conn).await?;
        let mut agg = UsageAggregate::default();
        for r in &rows {
            agg.matched_rows += 1;
            agg.input_tokens += r.input_tokens;
            agg.output_tokens += r.output_tokens;
            agg.cache_read_input_tokens += r.cache_read_input_tokens;
            agg.cache_creation_input_tokens += r.cache_creation_input_tokens;
            agg.total_cost_usd += r.cost_usd;
        }
        Ok(agg)
    }

    async fn get_channel_success_rates(
        &self,
        since: OffsetDateTime,
    ) -> StorageResult<Vec<ChannelSuccessRate>> {
        let rows = log_entry::Entity::find()
            .filter(log_entry::Column::At.gte(since))
            .filter(log_entry::Column::ChannelId.is_not_null())
            .all(&self.conn)
            .await?;
        use std::collections::HashMap;
        let mut counts: HashMap<ChannelId, (u64, u64)> = HashMap::new();
        for r in rows {
            let Some(id) = r.channel_id else { continue };
            let entry = counts.entry(id).or_default();
            entry.1 += 1;
            if (200..300).contains(&r.status) {
                entry.0 += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(channel_id, (success, total))| ChannelSuccessRate {
                channel_id,
                success_rate: if total == 0 {
                    1.0
                } else {
                    success as f64 / total as f64
                },
                sample_count: total,
            })
            .collect())
    }

    async fn get_distinct_models(&self) -> StorageResult<Vec<String>> {
        let channels = self.list_configs().await?;
        let mut models: Vec<String> = channels
            .into_iter()
            .flat_map(|c| c.models.into_iter().map(|m| m.name))
            .collect();
        models.sort();
        models.dedup();
        Ok(models)
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(setting::Entity::find_by_id(key.to_owned())
            .one(&self.conn)
            .await?
            .map(|r| r.value))
    }

    async fn update_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.batch_update_settings(&[(key.to_owned(), value.to_owned())])
            .await
    }

    async fn batch_update_settings(&self, entries: &[(String, String)]) -> StorageResult<()> {
        for (key, value) in entries {
            let active = setting::ActiveModel {
                key: Set(key.clone()),
                value: Set(value.clone()),
            };
            setting::Entity::insert(active)
                .on_conflict(
                    OnConflict::column(setting::Column::Key)
                        .update_column(setting::Column::Value)
                        .to_owned(),
                )
                .exec(&self.conn)
                .await?;
        }
        Ok(())
    }

    async fn list_all_settings(&self) -> StorageResult<Vec<(String, String)>> {
        let rows = setting::Entity::find().all(&self.conn).await?;
        Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        self.conn
            .execute(Statement::from_string(
                self.conn.get_database_backend(),
                "SELECT 1",
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::ChannelType;

    async fn memory_store() -> SeaOrmStore {
        let store = SeaOrmStore::connect("sqlite::memory:").await.unwrap();
        store.sync().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_and_fetch_channel_round_trips() {
        let store = memory_store().await;
        let id = store
            .create_config(NewChannel {
                name: "primary".into(),
                url: "https://api.example.com/".into(),
                channel_type: ChannelType::Anthropic,
                priority: 10,
                enabled: true,
                models: vec![ModelEntry {
                    name: "claude-3-5-sonnet".into(),
                    redirect: None,
                }],
                key_strategy: KeyStrategy::Sequential,
                api_keys: vec!["sk-one".into(), "sk-two".into()],
            })
            .await
            .unwrap();

        let channel = store.get_config(id).await.unwrap().unwrap();
        assert_eq!(channel.url, "https://api.example.com");
        assert_eq!(channel.key_count, 2);

        let keys = store.get_api_keys(id).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_index, 0);
        assert_eq!(keys[1].key_index, 1);
    }

    #[tokio::test]
    async fn channel_cooldown_round_trips() {
        let store = memory_store().await;
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        store.set_channel_cooldown(1, expires).await.unwrap();
        let loaded = store.get_channel_cooldown(1).await.unwrap().unwrap();
        assert_eq!(loaded.unix_timestamp(), expires.unix_timestamp());
    }

    #[tokio::test]
    async fn delete_config_cascades_keys_and_cooldowns() {
        let store = memory_store().await;
        let id = store
            .create_config(NewChannel {
                name: "to-delete".into(),
                url: "https://api.example.com".into(),
                channel_type: ChannelType::Openai,
                priority: 1,
                enabled: true,
                models: vec![],
                key_strategy: KeyStrategy::Sequential,
                api_keys: vec!["sk-x".into()],
            })
            .await
            .unwrap();
        store
            .set_channel_cooldown(id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        store.delete_config(id).await.unwrap();
        assert!(store.get_config(id).await.unwrap().is_none());
        assert!(store.get_api_keys(id).await.unwrap().is_empty());
        assert!(store.get_channel_cooldown(id).await.unwrap().is_none());
    }
}
