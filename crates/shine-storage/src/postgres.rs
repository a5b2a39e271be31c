use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shine_core::{AttemptState, Contract, Invoice, PaymentLinkage};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ContractFilter, InvoiceFilter, Record, SortOrder, Store, StoreError, CONTRACT_SEQUENCE,
    INVOICE_SEQUENCE,
};

/// Postgres-backed store. Records live in a JSONB `data` column next to the
/// handful of columns the filters and the version check need.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|err| classify("database", "connection", err))?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn insert<T: PgRecord>(&self, record: &T) -> Result<T, StoreError> {
        let mut stored = record.clone();
        stored.set_version(1);
        let columns = stored.columns();
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, number, status, client_email, external_id, external_order_id,
                            attempt_state, version, created_at, updated_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            T::TABLE
        ))
        .bind(stored.id())
        .bind(stored.number())
        .bind(columns.status)
        .bind(columns.client_email)
        .bind(columns.external_id)
        .bind(columns.external_order_id)
        .bind(columns.attempt_state)
        .bind(1_i64)
        .bind(stored.created_at())
        .bind(columns.updated_at)
        .bind(Json(&stored))
        .execute(&self.pool)
        .await
        .map_err(|err| classify(T::ENTITY, stored.number(), err))?;
        Ok(stored)
    }

    async fn get<T: PgRecord>(&self, id: Uuid) -> Result<T, StoreError> {
        let row = sqlx::query(&format!("SELECT version, data FROM {} WHERE id = $1", T::TABLE))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| classify(T::ENTITY, &id.to_string(), err))?
            .ok_or_else(|| StoreError::NotFound {
                entity: T::ENTITY,
                key: id.to_string(),
            })?;
        decode(&row)
    }

    async fn update<T: PgRecord>(&self, record: &T) -> Result<T, StoreError> {
        let expected = record.version();
        let mut stored = record.clone();
        stored.set_version(expected + 1);
        let columns = stored.columns();
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
               SET status = $2,
                   client_email = $3,
                   external_id = $4,
                   external_order_id = $5,
                   attempt_state = $6,
                   version = $7,
                   updated_at = $8,
                   data = $9
             WHERE id = $1
               AND version = $10
            "#,
            T::TABLE
        ))
        .bind(stored.id())
        .bind(columns.status)
        .bind(columns.client_email)
        .bind(columns.external_id)
        .bind(columns.external_order_id)
        .bind(columns.attempt_state)
        .bind(to_db_version(expected + 1))
        .bind(columns.updated_at)
        .bind(Json(&stored))
        .bind(to_db_version(expected))
        .execute(&self.pool)
        .await
        .map_err(|err| classify(T::ENTITY, stored.number(), err))?;

        if result.rows_affected() == 1 {
            return Ok(stored);
        }
        let current: Option<i64> =
            sqlx::query_scalar(&format!("SELECT version FROM {} WHERE id = $1", T::TABLE))
                .bind(stored.id())
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| classify(T::ENTITY, stored.number(), err))?;
        debug!(entity = T::ENTITY, number = stored.number(), expected, ?current, "conditional update missed");
        Err(match current {
            None => StoreError::NotFound {
                entity: T::ENTITY,
                key: stored.id().to_string(),
            },
            Some(_) => StoreError::Conflict {
                entity: T::ENTITY,
                key: stored.number().to_string(),
                expected,
            },
        })
    }

    async fn query<T: PgRecord>(&self, criteria: Criteria) -> Result<Vec<T>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT version, data FROM {} WHERE TRUE",
            T::TABLE
        ));
        if let Some(status) = criteria.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(email) = criteria.client_email {
            qb.push(" AND lower(client_email) = lower(").push_bind(email).push(")");
        }
        if let Some(number) = criteria.number {
            qb.push(" AND number = ").push_bind(number);
        }
        if let Some(reference) = criteria.payment_ref {
            qb.push(" AND (external_id = ")
                .push_bind(reference.clone())
                .push(" OR external_order_id = ")
                .push_bind(reference)
                .push(")");
        }
        if criteria.ambiguous_only {
            qb.push(" AND attempt_state = 'ambiguous'");
        }
        qb.push(match criteria.order {
            SortOrder::NewestFirst => " ORDER BY created_at DESC, number DESC",
            SortOrder::OldestFirst => " ORDER BY created_at ASC, number ASC",
        });
        if let Some(limit) = criteria.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify(T::ENTITY, "query", err))?;
        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_contract(&self, contract: &Contract) -> Result<Contract, StoreError> {
        self.insert(contract).await
    }

    async fn get_contract(&self, id: Uuid) -> Result<Contract, StoreError> {
        self.get(id).await
    }

    async fn update_contract(&self, contract: &Contract) -> Result<Contract, StoreError> {
        self.update(contract).await
    }

    async fn query_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, StoreError> {
        self.query(Criteria {
            status: filter.status.map(|s| s.as_str().to_string()),
            client_email: filter.client_email.clone(),
            number: filter.contract_number.clone(),
            payment_ref: filter.payment_ref.clone(),
            ambiguous_only: filter.ambiguous_only,
            order: filter.order,
            limit: filter.limit,
        })
        .await
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError> {
        self.insert(invoice).await
    }

    async fn get_invoice(&self, id: Uuid) -> Result<Invoice, StoreError> {
        self.get(id).await
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError> {
        self.update(invoice).await
    }

    async fn query_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        self.query(Criteria {
            status: filter.status.map(|s| s.as_str().to_string()),
            client_email: None,
            number: filter.invoice_number.clone(),
            payment_ref: filter.payment_ref.clone(),
            ambiguous_only: filter.ambiguous_only,
            order: filter.order,
            limit: filter.limit,
        })
        .await
    }

    async fn next_sequence_value(&self, name: &str) -> Result<u64, StoreError> {
        if name != CONTRACT_SEQUENCE && name != INVOICE_SEQUENCE {
            return Err(StoreError::NotFound {
                entity: "sequence",
                key: name.to_string(),
            });
        }
        let value: i64 = sqlx::query_scalar("SELECT nextval($1::regclass)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| classify("sequence", name, err))?;
        u64::try_from(value)
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("sequence {name} returned {value}")))
    }
}

struct Criteria {
    status: Option<String>,
    client_email: Option<String>,
    number: Option<String>,
    payment_ref: Option<String>,
    ambiguous_only: bool,
    order: SortOrder,
    limit: Option<usize>,
}

/// Denormalised columns kept beside the JSONB document.
struct IndexColumns<'a> {
    status: &'static str,
    client_email: &'a str,
    external_id: Option<&'a str>,
    external_order_id: Option<&'a str>,
    attempt_state: Option<&'static str>,
    updated_at: DateTime<Utc>,
}

trait PgRecord: Record + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    fn columns(&self) -> IndexColumns<'_>;
}

impl PgRecord for Contract {
    const TABLE: &'static str = "contracts";

    fn columns(&self) -> IndexColumns<'_> {
        IndexColumns {
            status: self.status.as_str(),
            client_email: &self.client.email,
            external_id: self.payment.external_id.as_deref(),
            external_order_id: self.payment.external_order_id.as_deref(),
            attempt_state: attempt_label(&self.payment),
            updated_at: self.updated_at,
        }
    }
}

impl PgRecord for Invoice {
    const TABLE: &'static str = "invoices";

    fn columns(&self) -> IndexColumns<'_> {
        IndexColumns {
            status: self.status.as_str(),
            client_email: &self.client.email,
            external_id: self.payment.external_id.as_deref(),
            external_order_id: self.payment.external_order_id.as_deref(),
            attempt_state: attempt_label(&self.payment),
            updated_at: self.updated_at,
        }
    }
}

fn attempt_label(linkage: &PaymentLinkage) -> Option<&'static str> {
    linkage.attempt.as_ref().map(|a| match a.state {
        AttemptState::Pending => "pending",
        AttemptState::Ambiguous => "ambiguous",
        AttemptState::Created => "created",
        AttemptState::Failed { .. } => "failed",
    })
}

fn decode<T: PgRecord>(row: &sqlx::postgres::PgRow) -> Result<T, StoreError> {
    let version: i64 = row
        .try_get("version")
        .map_err(|err| classify(T::ENTITY, "version", err))?;
    let Json(mut record): Json<T> = row
        .try_get("data")
        .map_err(|err| classify(T::ENTITY, "data", err))?;
    record.set_version(u64::try_from(version).unwrap_or_default());
    Ok(record)
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn classify(entity: &'static str, key: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate {
            entity,
            key: key.to_string(),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Backend(anyhow::Error::new(other).context(format!("{entity} {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shine_core::payment::PaymentAttempt;

    #[test]
    fn ambiguous_attempts_get_their_own_label() {
        let mut linkage = PaymentLinkage::default();
        assert_eq!(attempt_label(&linkage), None);
        linkage.attempt = Some(PaymentAttempt {
            idempotency_key: "CSA-26-0001".into(),
            state: AttemptState::Ambiguous,
            attempted_at: Utc::now(),
        });
        assert_eq!(attempt_label(&linkage), Some("ambiguous"));
    }

    #[test]
    fn pool_exhaustion_reads_as_unavailable() {
        assert!(matches!(
            classify("contract", "CSA-26-0001", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify("contract", "CSA-26-0001", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }
}
