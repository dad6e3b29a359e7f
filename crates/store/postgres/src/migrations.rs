use sqlx::PgPool;

/// Run database migrations, creating required tables and row-level-security
/// policies if they do not exist.
///
/// `tenants` and `global_opt_outs` are global tables and carry no RLS. Every
/// other table is tenant-scoped: RLS is enabled and **forced** (so the table
/// owner is not exempt), with a policy keyed on the `app.current_tenant`
/// session variable. The store sets that variable transaction-locally before
/// every statement; a connection without it set reads zero rows. The policy
/// accepts the `'*'` wildcard scope for reads only — it is used by the
/// reconciliation lookups, which must resolve carrier callbacks without
/// knowing the tenant in advance. Writes always require a concrete tenant.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    const TABLES: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS contacts (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            phone TEXT NOT NULL,
            primary_location_id TEXT,
            sms_consent BOOLEAN NOT NULL DEFAULT FALSE,
            sms_consent_at TIMESTAMPTZ,
            sms_consent_method TEXT,
            email TEXT,
            email_consent BOOLEAN NOT NULL DEFAULT FALSE,
            sms_opted_out BOOLEAN NOT NULL DEFAULT FALSE,
            sms_opted_out_at TIMESTAMPTZ,
            age_verified BOOLEAN NOT NULL DEFAULT FALSE,
            date_of_birth DATE,
            tags TEXT[] NOT NULL DEFAULT '{}',
            timezone TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, id),
            UNIQUE (tenant_id, phone)
        )",
        "CREATE TABLE IF NOT EXISTS locations (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            state_code TEXT NOT NULL,
            timezone TEXT NOT NULL,
            sms_phone_number TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, id)
        )",
        "CREATE TABLE IF NOT EXISTS campaigns (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            sms_content TEXT,
            email_subject TEXT,
            email_content TEXT,
            target_location_ids TEXT[] NOT NULL DEFAULT '{}',
            target_tags TEXT[] NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            total_recipients BIGINT NOT NULL DEFAULT 0,
            sent_count BIGINT NOT NULL DEFAULT 0,
            delivered_count BIGINT NOT NULL DEFAULT 0,
            failed_count BIGINT NOT NULL DEFAULT 0,
            opened_count BIGINT NOT NULL DEFAULT 0,
            clicked_count BIGINT NOT NULL DEFAULT 0,
            opted_out_count BIGINT NOT NULL DEFAULT 0,
            scheduled_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, id)
        )",
        "CREATE TABLE IF NOT EXISTS messages (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            contact_id TEXT,
            campaign_id TEXT,
            kind TEXT NOT NULL,
            direction TEXT NOT NULL,
            to_address TEXT NOT NULL,
            from_address TEXT NOT NULL,
            content TEXT NOT NULL,
            segments INTEGER,
            provider_message_id TEXT UNIQUE,
            status TEXT NOT NULL,
            provider_status TEXT,
            error TEXT,
            consent_verified_at TIMESTAMPTZ,
            quiet_hours_checked_at TIMESTAMPTZ,
            client_ref TEXT,
            sent_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            status_updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, id),
            UNIQUE (tenant_id, client_ref)
        )",
        "CREATE TABLE IF NOT EXISTS opt_out_log (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            contact_id TEXT,
            channel TEXT NOT NULL,
            address TEXT NOT NULL,
            action TEXT NOT NULL,
            method TEXT NOT NULL,
            source_message_id TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, id)
        )",
        "CREATE TABLE IF NOT EXISTS global_opt_outs (
            phone TEXT PRIMARY KEY,
            source_tenant TEXT NOT NULL,
            opted_out_at TIMESTAMPTZ NOT NULL
        )",
    ];

    const INDEXES: &[&str] = &[
        "CREATE INDEX IF NOT EXISTS messages_contact_created_idx
            ON messages (tenant_id, contact_id, created_at)",
        "CREATE INDEX IF NOT EXISTS messages_to_address_idx
            ON messages (tenant_id, to_address)",
        "CREATE INDEX IF NOT EXISTS locations_sms_number_idx
            ON locations (sms_phone_number)",
        "CREATE INDEX IF NOT EXISTS opt_out_log_address_idx
            ON opt_out_log (tenant_id, address)",
    ];

    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    for table in ["contacts", "locations", "campaigns", "messages", "opt_out_log"] {
        apply_tenant_policy(pool, table).await?;
    }

    Ok(())
}

/// Enable and force row-level security on a tenant-scoped table, recreating
/// the isolation policy. `DROP POLICY IF EXISTS` + `CREATE POLICY` keeps the
/// migration idempotent across restarts.
async fn apply_tenant_policy(pool: &PgPool, table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"))
        .execute(pool)
        .await?;
    sqlx::query(&format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"))
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "DROP POLICY IF EXISTS {table}_tenant_isolation ON {table}"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE POLICY {table}_tenant_isolation ON {table}
            USING (tenant_id = current_setting('app.current_tenant', true)
                   OR current_setting('app.current_tenant', true) = '*')
            WITH CHECK (tenant_id = current_setting('app.current_tenant', true))"
    ))
    .execute(pool)
    .await?;
    Ok(())
}
