use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use leafline_core::{
    Campaign, CampaignId, CampaignKind, CampaignStatus, Channel, ConsentMethod, Contact, ContactId,
    CounterField, GlobalOptOut, JobId, Location, LocationId, Message, MessageId, MessageStatus,
    OptOutLogEntry, TenantId,
};
use leafline_store::error::StoreError;
use leafline_store::store::{StatusApplied, Store, Tenant};

use crate::config::PostgresConfig;
use crate::migrations;

/// Session-variable scope used by the reconciliation lookups, which resolve
/// carrier callbacks without knowing the tenant in advance. The RLS policy
/// accepts it for reads only; writes always require a concrete tenant.
const RECONCILER_SCOPE: &str = "*";

/// PostgreSQL-backed implementation of [`Store`].
///
/// Tenant isolation is enforced twice: every tenant-scoped query carries an
/// explicit `WHERE tenant_id = $n` predicate, and every operation runs inside
/// a transaction that first pins the `app.current_tenant` session variable
/// (transaction-locally, so it is cleared before the connection returns to
/// the pool). The row-level-security policies installed by
/// [`migrations::run_migrations`] are keyed on that variable, so a query
/// that forgets its predicate still cannot see another tenant's rows.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL, create the connection pool, and run
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if pool creation fails, or
    /// [`StoreError::Backend`] if migrations fail.
    pub async fn new(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        migrations::run_migrations(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create a `PostgresStore` from an existing pool. Runs migrations on
    /// creation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if migrations fail.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Begin a transaction with the tenant scope pinned on the acquired
    /// connection. `set_config(..., true)` is transaction-local: the
    /// variable is reset on commit or rollback, so no scope-sensitive state
    /// outlives the transaction or leaks back to the pool.
    async fn begin_scoped(&self, scope: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
            .bind(scope)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(tx)
    }

    /// Run `f` inside a transaction scoped to `tenant`. Commits when `f`
    /// returns `Ok`, rolls back otherwise; the connection is always released
    /// with its scope cleared.
    pub async fn in_tenant_tx<T, F>(&self, tenant: &TenantId, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(db_err)?;
                Ok(value)
            }
            Err(e) => {
                // Rollback failures are secondary to the original error.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// Map a sqlx error onto [`StoreError`].
fn db_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_owned())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

/// Parse a stored enum column, surfacing bad values as serialization errors.
fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(StoreError::Serialization)
}

fn parse_optional_column<T>(value: Option<String>) -> Result<Option<T>, StoreError>
where
    T: FromStr<Err = String>,
{
    value.as_deref().map(parse_column).transpose()
}

fn contact_from_row(row: &PgRow) -> Result<Contact, StoreError> {
    let consent_method: Option<String> = row.try_get("sms_consent_method").map_err(db_err)?;
    Ok(Contact {
        id: ContactId::new(row.try_get::<String, _>("id").map_err(db_err)?),
        tenant: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(db_err)?),
        phone: row.try_get("phone").map_err(db_err)?,
        primary_location_id: row
            .try_get::<Option<String>, _>("primary_location_id")
            .map_err(db_err)?
            .map(LocationId::new),
        sms_consent: row.try_get("sms_consent").map_err(db_err)?,
        sms_consent_at: row.try_get("sms_consent_at").map_err(db_err)?,
        sms_consent_method: parse_optional_column(consent_method)?,
        email: row.try_get("email").map_err(db_err)?,
        email_consent: row.try_get("email_consent").map_err(db_err)?,
        sms_opted_out: row.try_get("sms_opted_out").map_err(db_err)?,
        sms_opted_out_at: row.try_get("sms_opted_out_at").map_err(db_err)?,
        age_verified: row.try_get("age_verified").map_err(db_err)?,
        date_of_birth: row.try_get("date_of_birth").map_err(db_err)?,
        tags: row.try_get("tags").map_err(db_err)?,
        timezone: row.try_get("timezone").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    Ok(Location {
        id: LocationId::new(row.try_get::<String, _>("id").map_err(db_err)?),
        tenant: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(db_err)?),
        name: row.try_get("name").map_err(db_err)?,
        state_code: row.try_get("state_code").map_err(db_err)?,
        timezone: row.try_get("timezone").map_err(db_err)?,
        sms_phone_number: row.try_get("sms_phone_number").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Campaign {
        id: CampaignId::new(row.try_get::<String, _>("id").map_err(db_err)?),
        tenant: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(db_err)?),
        name: row.try_get("name").map_err(db_err)?,
        kind: parse_column(&kind)?,
        sms_content: row.try_get("sms_content").map_err(db_err)?,
        email_subject: row.try_get("email_subject").map_err(db_err)?,
        email_content: row.try_get("email_content").map_err(db_err)?,
        target_location_ids: row
            .try_get::<Vec<String>, _>("target_location_ids")
            .map_err(db_err)?
            .into_iter()
            .map(LocationId::new)
            .collect(),
        target_tags: row.try_get("target_tags").map_err(db_err)?,
        status: parse_column(&status)?,
        total_recipients: row.try_get("total_recipients").map_err(db_err)?,
        sent_count: row.try_get("sent_count").map_err(db_err)?,
        delivered_count: row.try_get("delivered_count").map_err(db_err)?,
        failed_count: row.try_get("failed_count").map_err(db_err)?,
        opened_count: row.try_get("opened_count").map_err(db_err)?,
        clicked_count: row.try_get("clicked_count").map_err(db_err)?,
        opted_out_count: row.try_get("opted_out_count").map_err(db_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let direction: String = row.try_get("direction").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Message {
        id: MessageId::new(row.try_get::<String, _>("id").map_err(db_err)?),
        tenant: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(db_err)?),
        contact_id: row
            .try_get::<Option<String>, _>("contact_id")
            .map_err(db_err)?
            .map(ContactId::new),
        campaign_id: row
            .try_get::<Option<String>, _>("campaign_id")
            .map_err(db_err)?
            .map(CampaignId::new),
        kind: parse_column(&kind)?,
        direction: parse_column(&direction)?,
        to_address: row.try_get("to_address").map_err(db_err)?,
        from_address: row.try_get("from_address").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        segments: row.try_get("segments").map_err(db_err)?,
        provider_message_id: row.try_get("provider_message_id").map_err(db_err)?,
        status: parse_column(&status)?,
        provider_status: row.try_get("provider_status").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        consent_verified_at: row.try_get("consent_verified_at").map_err(db_err)?,
        quiet_hours_checked_at: row.try_get("quiet_hours_checked_at").map_err(db_err)?,
        client_ref: row
            .try_get::<Option<String>, _>("client_ref")
            .map_err(db_err)?
            .map(JobId::new),
        sent_at: row.try_get("sent_at").map_err(db_err)?,
        delivered_at: row.try_get("delivered_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        status_updated_at: row.try_get("status_updated_at").map_err(db_err)?,
    })
}

fn opt_out_log_from_row(row: &PgRow) -> Result<OptOutLogEntry, StoreError> {
    let channel: String = row.try_get("channel").map_err(db_err)?;
    let action: String = row.try_get("action").map_err(db_err)?;
    let method: String = row.try_get("method").map_err(db_err)?;
    Ok(OptOutLogEntry {
        id: row.try_get("id").map_err(db_err)?,
        tenant: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(db_err)?),
        contact_id: row
            .try_get::<Option<String>, _>("contact_id")
            .map_err(db_err)?
            .map(ContactId::new),
        channel: parse_column(&channel)?,
        address: row.try_get("address").map_err(db_err)?,
        action: parse_column(&action)?,
        method: parse_column(&method)?,
        source_message_id: row
            .try_get::<Option<String>, _>("source_message_id")
            .map_err(db_err)?
            .map(MessageId::new),
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

const MESSAGE_COLUMNS: &str = "tenant_id, id, contact_id, campaign_id, kind, direction, \
     to_address, from_address, content, segments, provider_message_id, status, \
     provider_status, error, consent_verified_at, quiet_hours_checked_at, client_ref, \
     sent_at, delivered_at, created_at, status_updated_at";

#[async_trait]
impl Store for PostgresStore {
    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(tenant.id.as_str())
            .bind(&tenant.name)
            .bind(tenant.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let row: Option<(String, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, name, created_at FROM tenants WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(id, name, created_at)| Tenant {
            id: TenantId::new(id),
            name,
            created_at,
        }))
    }

    async fn create_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        sqlx::query(
            "INSERT INTO contacts (tenant_id, id, phone, primary_location_id, sms_consent, \
             sms_consent_at, sms_consent_method, email, email_consent, sms_opted_out, \
             sms_opted_out_at, age_verified, date_of_birth, tags, timezone, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(tenant.as_str())
        .bind(contact.id.as_str())
        .bind(&contact.phone)
        .bind(contact.primary_location_id.as_ref().map(|l| l.as_str()))
        .bind(contact.sms_consent)
        .bind(contact.sms_consent_at)
        .bind(contact.sms_consent_method.map(ConsentMethod::as_str))
        .bind(&contact.email)
        .bind(contact.email_consent)
        .bind(contact.sms_opted_out)
        .bind(contact.sms_opted_out_at)
        .bind(contact.age_verified)
        .bind(contact.date_of_birth)
        .bind(&contact.tags)
        .bind(&contact.timezone)
        .bind(contact.created_at)
        .bind(contact.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn update_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let result = sqlx::query(
            "UPDATE contacts SET phone = $3, primary_location_id = $4, sms_consent = $5, \
             sms_consent_at = $6, sms_consent_method = $7, email = $8, email_consent = $9, \
             sms_opted_out = $10, sms_opted_out_at = $11, age_verified = $12, \
             date_of_birth = $13, tags = $14, timezone = $15, updated_at = $16 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(contact.id.as_str())
        .bind(&contact.phone)
        .bind(contact.primary_location_id.as_ref().map(|l| l.as_str()))
        .bind(contact.sms_consent)
        .bind(contact.sms_consent_at)
        .bind(contact.sms_consent_method.map(ConsentMethod::as_str))
        .bind(&contact.email)
        .bind(contact.email_consent)
        .bind(contact.sms_opted_out)
        .bind(contact.sms_opted_out_at)
        .bind(contact.age_verified)
        .bind(contact.date_of_birth)
        .bind(&contact.tags)
        .bind(&contact.timezone)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("contact {}", contact.id)));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn get_contact(
        &self,
        tenant: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let row = sqlx::query("SELECT * FROM contacts WHERE tenant_id = $1 AND id = $2")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn find_contact_by_phone(
        &self,
        tenant: &TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let row = sqlx::query("SELECT * FROM contacts WHERE tenant_id = $1 AND phone = $2")
            .bind(tenant.as_str())
            .bind(phone)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn record_contact_opt_out(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        // Idempotent: the timestamp of the first opt-out is kept.
        let result = sqlx::query(
            "UPDATE contacts SET \
             sms_opted_out = TRUE, \
             sms_opted_out_at = COALESCE(sms_opted_out_at, $3), \
             updated_at = $3 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(contact.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("contact {contact}")));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn record_contact_opt_in(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        method: ConsentMethod,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let result = sqlx::query(
            "UPDATE contacts SET \
             sms_opted_out = FALSE, \
             sms_opted_out_at = NULL, \
             sms_consent = TRUE, \
             sms_consent_at = $3, \
             sms_consent_method = $4, \
             updated_at = $3 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(contact.as_str())
        .bind(at)
        .bind(method.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("contact {contact}")));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn list_campaign_recipients(
        &self,
        tenant: &TenantId,
        kind: CampaignKind,
        target_locations: &[LocationId],
        target_tags: &[String],
    ) -> Result<Vec<Contact>, StoreError> {
        let locations: Vec<String> = target_locations
            .iter()
            .map(|l| l.as_str().to_owned())
            .collect();
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let rows = sqlx::query(
            "SELECT * FROM contacts \
             WHERE tenant_id = $1 \
               AND age_verified = TRUE \
               AND ($2 = FALSE OR (sms_consent = TRUE AND sms_opted_out = FALSE)) \
               AND ($3 = FALSE OR email_consent = TRUE) \
               AND (cardinality($4::text[]) = 0 OR primary_location_id = ANY($4)) \
               AND (cardinality($5::text[]) = 0 OR tags && $5) \
             ORDER BY created_at",
        )
        .bind(tenant.as_str())
        .bind(kind.touches_sms())
        .bind(kind.touches_email())
        .bind(&locations)
        .bind(target_tags)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn create_location(
        &self,
        tenant: &TenantId,
        location: &Location,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        sqlx::query(
            "INSERT INTO locations (tenant_id, id, name, state_code, timezone, \
             sms_phone_number, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(tenant.as_str())
        .bind(location.id.as_str())
        .bind(&location.name)
        .bind(&location.state_code)
        .bind(&location.timezone)
        .bind(&location.sms_phone_number)
        .bind(location.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn get_location(
        &self,
        tenant: &TenantId,
        id: &LocationId,
    ) -> Result<Option<Location>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let row = sqlx::query("SELECT * FROM locations WHERE tenant_id = $1 AND id = $2")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn create_campaign(
        &self,
        tenant: &TenantId,
        campaign: &Campaign,
    ) -> Result<(), StoreError> {
        let locations: Vec<String> = campaign
            .target_location_ids
            .iter()
            .map(|l| l.as_str().to_owned())
            .collect();
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        sqlx::query(
            "INSERT INTO campaigns (tenant_id, id, name, kind, sms_content, email_subject, \
             email_content, target_location_ids, target_tags, status, total_recipients, \
             sent_count, delivered_count, failed_count, opened_count, clicked_count, \
             opted_out_count, scheduled_at, started_at, completed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21)",
        )
        .bind(tenant.as_str())
        .bind(campaign.id.as_str())
        .bind(&campaign.name)
        .bind(campaign.kind.as_str())
        .bind(&campaign.sms_content)
        .bind(&campaign.email_subject)
        .bind(&campaign.email_content)
        .bind(&locations)
        .bind(&campaign.target_tags)
        .bind(campaign.status.as_str())
        .bind(campaign.total_recipients)
        .bind(campaign.sent_count)
        .bind(campaign.delivered_count)
        .bind(campaign.failed_count)
        .bind(campaign.opened_count)
        .bind(campaign.clicked_count)
        .bind(campaign.opted_out_count)
        .bind(campaign.scheduled_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .bind(campaign.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn get_campaign(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
    ) -> Result<Option<Campaign>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let row = sqlx::query("SELECT * FROM campaigns WHERE tenant_id = $1 AND id = $2")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn mark_campaign_sending(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        total_recipients: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let current =
            fetch_campaign_status(&mut tx, tenant, id).await?;
        if !current.can_transition_to(CampaignStatus::Sending) {
            return Err(StoreError::IllegalTransition(format!(
                "campaign {id}: {current} -> sending"
            )));
        }
        sqlx::query(
            "UPDATE campaigns SET status = 'sending', total_recipients = $3, started_at = $4 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .bind(total_recipients)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn mark_campaign_sent(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let current = fetch_campaign_status(&mut tx, tenant, id).await?;
        if !current.can_transition_to(CampaignStatus::Sent) {
            return Err(StoreError::IllegalTransition(format!(
                "campaign {id}: {current} -> sent"
            )));
        }
        sqlx::query(
            "UPDATE campaigns SET status = 'sent', completed_at = $3 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn increment_campaign_counter(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        field: CounterField,
    ) -> Result<(), StoreError> {
        // Single-statement increment: the database's atomic counter
        // primitive. Concurrent webhook callbacks cannot lose updates.
        let column = field.column();
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let result = sqlx::query(&format!(
            "UPDATE campaigns SET {column} = {column} + 1 WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant.as_str())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("campaign {id}")));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn insert_message(&self, tenant: &TenantId, message: &Message) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21)"
        ))
        .bind(tenant.as_str())
        .bind(message.id.as_str())
        .bind(message.contact_id.as_ref().map(|c| c.as_str()))
        .bind(message.campaign_id.as_ref().map(|c| c.as_str()))
        .bind(message.kind.as_str())
        .bind(message.direction.as_str())
        .bind(&message.to_address)
        .bind(&message.from_address)
        .bind(&message.content)
        .bind(message.segments)
        .bind(&message.provider_message_id)
        .bind(message.status.as_str())
        .bind(&message.provider_status)
        .bind(&message.error)
        .bind(message.consent_verified_at)
        .bind(message.quiet_hours_checked_at)
        .bind(message.client_ref.as_ref().map(|j| j.as_str()))
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.created_at)
        .bind(message.status_updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn find_message_by_client_ref(
        &self,
        tenant: &TenantId,
        job: &JobId,
    ) -> Result<Option<Message>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let row = sqlx::query("SELECT * FROM messages WHERE tenant_id = $1 AND client_ref = $2")
            .bind(tenant.as_str())
            .bind(job.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn mark_message_dispatched(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        provider_message_id: &str,
        segments: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let result = sqlx::query(
            "UPDATE messages SET status = 'sent', provider_message_id = $3, segments = $4, \
             sent_at = $5, error = NULL, status_updated_at = $5 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .bind(provider_message_id)
        .bind(segments)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn mark_message_failed(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let result = sqlx::query(
            "UPDATE messages SET status = 'failed', error = $3, status_updated_at = $4 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .bind(error)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn count_outbound_since(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        kind: Channel,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages \
             WHERE tenant_id = $1 AND contact_id = $2 AND kind = $3 \
               AND direction = 'outbound' AND status <> 'failed' AND created_at >= $4",
        )
        .bind(tenant.as_str())
        .bind(contact.as_str())
        .bind(kind.as_str())
        .bind(since)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(count.unsigned_abs())
    }

    async fn list_messages_to_address(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE tenant_id = $1 AND to_address = $2 ORDER BY created_at",
        )
        .bind(tenant.as_str())
        .bind(address)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        // Cross-tenant by design: carrier callbacks carry only the provider
        // message id, which is globally unique.
        let mut tx = self.begin_scoped(RECONCILER_SCOPE).await?;
        let row = sqlx::query("SELECT * FROM messages WHERE provider_message_id = $1")
            .bind(provider_message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn apply_status_update(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        status: Option<MessageStatus>,
        provider_status: Option<&str>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StatusApplied, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;

        // Row lock so the transition check and the write are atomic under
        // concurrent callbacks for the same message.
        let row = sqlx::query(
            "SELECT status, provider_status FROM messages \
             WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("message {id}")));
        };
        let current: MessageStatus = parse_column(&row.try_get::<String, _>("status").map_err(db_err)?)?;
        let previous_provider_status: Option<String> =
            row.try_get("provider_status").map_err(db_err)?;

        sqlx::query(
            "UPDATE messages SET \
             provider_status = COALESCE($3, provider_status), \
             error = COALESCE($4, error) \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant.as_str())
        .bind(id.as_str())
        .bind(provider_status)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let transitioned = match status {
            Some(next) if current.accepts_transition_to(next) => {
                sqlx::query(
                    "UPDATE messages SET status = $3, status_updated_at = $4, \
                     delivered_at = CASE WHEN $3 = 'delivered' THEN $4 ELSE delivered_at END \
                     WHERE tenant_id = $1 AND id = $2",
                )
                .bind(tenant.as_str())
                .bind(id.as_str())
                .bind(next.as_str())
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                true
            }
            _ => false,
        };

        tx.commit().await.map_err(db_err)?;
        Ok(StatusApplied {
            transitioned,
            previous_status: current,
            previous_provider_status,
        })
    }

    async fn insert_opt_out_log(
        &self,
        tenant: &TenantId,
        entry: &OptOutLogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        sqlx::query(
            "INSERT INTO opt_out_log (tenant_id, id, contact_id, channel, address, action, \
             method, source_message_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(tenant.as_str())
        .bind(&entry.id)
        .bind(entry.contact_id.as_ref().map(|c| c.as_str()))
        .bind(entry.channel.as_str())
        .bind(&entry.address)
        .bind(entry.action.as_str())
        .bind(entry.method.as_str())
        .bind(entry.source_message_id.as_ref().map(|m| m.as_str()))
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn list_opt_out_log(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<OptOutLogEntry>, StoreError> {
        let mut tx = self.begin_scoped(tenant.as_str()).await?;
        let rows = sqlx::query(
            "SELECT * FROM opt_out_log WHERE tenant_id = $1 AND address = $2 ORDER BY created_at",
        )
        .bind(tenant.as_str())
        .bind(address)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        rows.iter().map(opt_out_log_from_row).collect()
    }

    async fn add_global_opt_out(
        &self,
        phone: &str,
        source_tenant: &TenantId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO global_opt_outs (phone, source_tenant, opted_out_at) \
             VALUES ($1, $2, $3) ON CONFLICT (phone) DO NOTHING",
        )
        .bind(phone)
        .bind(source_tenant.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_global_opt_out(&self, phone: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM global_opt_outs WHERE phone = $1")
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_global_opt_out(&self, phone: &str) -> Result<Option<GlobalOptOut>, StoreError> {
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT phone, source_tenant, opted_out_at FROM global_opt_outs WHERE phone = $1",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(phone, source_tenant, opted_out_at)| GlobalOptOut {
            phone,
            source_tenant: TenantId::new(source_tenant),
            opted_out_at,
        }))
    }

    async fn find_location_by_sms_number(
        &self,
        phone: &str,
    ) -> Result<Option<Location>, StoreError> {
        // Cross-tenant by design: inbound webhooks identify the tenant by
        // the destination number.
        let mut tx = self.begin_scoped(RECONCILER_SCOPE).await?;
        let row = sqlx::query("SELECT * FROM locations WHERE sms_phone_number = $1")
            .bind(phone)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.as_ref().map(location_from_row).transpose()
    }
}

/// Read a campaign's current status under a row lock.
async fn fetch_campaign_status(
    tx: &mut Transaction<'static, Postgres>,
    tenant: &TenantId,
    id: &CampaignId,
) -> Result<CampaignStatus, StoreError> {
    let row =
        sqlx::query("SELECT status FROM campaigns WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
    let Some(row) = row else {
        return Err(StoreError::NotFound(format!("campaign {id}")));
    };
    parse_column(&row.try_get::<String, _>("status").map_err(db_err)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_column_surfaces_bad_values() {
        let ok: Result<MessageStatus, _> = parse_column("sent");
        assert_eq!(ok.unwrap(), MessageStatus::Sent);
        let err: Result<MessageStatus, _> = parse_column("exploded");
        assert!(matches!(err, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn reconciler_scope_is_wildcard() {
        assert_eq!(RECONCILER_SCOPE, "*");
    }

    /// Full conformance run against a live database. Requires
    /// `LEAFLINE_TEST_DATABASE_URL` and the `integration` feature.
    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn conformance_against_live_postgres() {
        let url = std::env::var("LEAFLINE_TEST_DATABASE_URL")
            .expect("LEAFLINE_TEST_DATABASE_URL must be set for integration tests");
        let store = PostgresStore::new(&PostgresConfig::new(url))
            .await
            .expect("connect");
        leafline_store::testing::run_store_conformance_tests(&store)
            .await
            .expect("postgres store must pass the conformance suite");
    }
}
