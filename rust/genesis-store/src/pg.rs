//! Postgres store under the `genesis` schema
//!
//! Runtime-checked sqlx queries. Invariants are enforced at the SQL
//! boundary: the account claim is a single guarded UPDATE, droplet creation
//! is an upsert that only replaces terminal rows, and transitions take a
//! row lock so lifecycle events for one droplet are serialized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genesis_types::{
    AccountId, AccountStatus, CloudAccount, ControlError, ControlResult, DropletHealth, DropletId,
    DropletState, FlowStepRecord, Heartbeat, LifecycleEvent, Rollout, RolloutCounters, RolloutId,
    RolloutStatus, RolloutStrategy, Secret, Tenant, TenantId, Tier, VersionLedgerEntry, Wave,
    WaveStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::{
    CostEvent, CredentialUpdate, FleetSummary, ScheduledCampaign, Store, TenantActivity,
};

fn store_err(err: sqlx::Error) -> ControlError {
    ControlError::Store(err.to_string())
}

fn parse_err(what: &str, err: impl std::fmt::Display) -> ControlError {
    ControlError::Store(format!("bad {} in store row: {}", what, err))
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(store_err)?;
        Ok(Self { pool })
    }

    /// Apply pending migrations (embedded at build time).
    pub async fn migrate(&self) -> ControlResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ControlError::Store(e.to_string()))?;
        info!("store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: String,
    api_token: String,
    region: String,
    max_droplets: i32,
    current_droplets: i32,
    status: String,
    created_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_domain(self) -> ControlResult<CloudAccount> {
        Ok(CloudAccount {
            id: AccountId::new(self.id),
            api_token: Secret::new(self.api_token),
            region: self.region,
            max_droplets: self.max_droplets.max(0) as u32,
            current_droplets: self.current_droplets.max(0) as u32,
            status: self
                .status
                .parse::<AccountStatus>()
                .map_err(|e| parse_err("account status", e))?,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct TenantRow {
    id: String,
    slug: String,
    region: String,
    tier: String,
}

impl TenantRow {
    fn into_domain(self) -> ControlResult<Tenant> {
        Ok(Tenant {
            id: TenantId::new(self.id),
            slug: self.slug,
            region: self.region,
            tier: self.tier.parse::<Tier>().map_err(|e| parse_err("tier", e))?,
        })
    }
}

#[derive(FromRow)]
struct DropletRow {
    tenant_id: String,
    droplet_id: i64,
    account_id: String,
    region: String,
    size_slug: String,
    public_ip: String,
    public_dns: String,
    state: String,
    last_heartbeat: Option<DateTime<Utc>>,
    cpu_pct: f64,
    mem_pct: f64,
    disk_pct: f64,
    engine_healthy: bool,
    sidecar_version: Option<String>,
    credential_fingerprint: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DropletRow {
    fn into_domain(self) -> ControlResult<DropletHealth> {
        Ok(DropletHealth {
            tenant_id: TenantId::new(self.tenant_id),
            droplet_id: DropletId(self.droplet_id.max(0) as u64),
            account_id: AccountId::new(self.account_id),
            region: self.region,
            size_slug: self.size_slug,
            public_ip: self.public_ip,
            public_dns: self.public_dns,
            state: self
                .state
                .parse::<DropletState>()
                .map_err(|e| parse_err("droplet state", e))?,
            last_heartbeat: self.last_heartbeat,
            cpu_pct: self.cpu_pct,
            mem_pct: self.mem_pct,
            disk_pct: self.disk_pct,
            engine_healthy: self.engine_healthy,
            sidecar_version: self.sidecar_version,
            credential_fingerprint: self.credential_fingerprint,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const DROPLET_COLUMNS: &str = "tenant_id, droplet_id, account_id, region, size_slug, public_ip, \
     public_dns, state, last_heartbeat, cpu_pct, mem_pct, disk_pct, engine_healthy, \
     sidecar_version, credential_fingerprint, created_at, updated_at";

#[derive(FromRow)]
struct LifecycleRow {
    droplet_id: i64,
    tenant_id: String,
    from_state: Option<String>,
    to_state: String,
    reason: String,
    actor: String,
    at: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl LifecycleRow {
    fn into_domain(self) -> ControlResult<LifecycleEvent> {
        let from_state = match self.from_state {
            Some(raw) => Some(
                raw.parse::<DropletState>()
                    .map_err(|e| parse_err("from_state", e))?,
            ),
            None => None,
        };
        Ok(LifecycleEvent {
            droplet_id: DropletId(self.droplet_id.max(0) as u64),
            tenant_id: TenantId::new(self.tenant_id),
            from_state,
            to_state: self
                .to_state
                .parse::<DropletState>()
                .map_err(|e| parse_err("to_state", e))?,
            reason: self.reason,
            actor: self.actor,
            at: self.at,
            metadata: self.metadata,
        })
    }
}

#[derive(FromRow)]
struct VersionRow {
    tenant_id: String,
    component: String,
    version: String,
    previous_version: Option<String>,
    rollout_id: Option<uuid::Uuid>,
    recorded_at: DateTime<Utc>,
}

impl VersionRow {
    fn into_domain(self) -> VersionLedgerEntry {
        VersionLedgerEntry {
            tenant_id: TenantId::new(self.tenant_id),
            component: self.component,
            version: self.version,
            previous_version: self.previous_version,
            rollout_id: self.rollout_id.map(RolloutId),
            recorded_at: self.recorded_at,
        }
    }
}

#[derive(FromRow)]
struct RolloutRow {
    id: uuid::Uuid,
    component: String,
    from_version: Option<String>,
    to_version: String,
    strategy: String,
    status: String,
    total_tenants: i32,
    pending_count: i32,
    active_count: i32,
    succeeded_count: i32,
    failed_count: i32,
    wave_sizes: serde_json::Value,
    created_by: String,
    created_at: DateTime<Utc>,
    reason: Option<String>,
    priority_override: Option<i16>,
}

impl RolloutRow {
    fn into_domain(self) -> ControlResult<Rollout> {
        let strategy = match self.strategy.as_str() {
            "canary-staged" => RolloutStrategy::CanaryStaged,
            "fleet-sync" => RolloutStrategy::FleetSync,
            other => return Err(parse_err("strategy", other)),
        };
        let wave_sizes: Vec<u32> =
            serde_json::from_value(self.wave_sizes).map_err(|e| parse_err("wave_sizes", e))?;
        Ok(Rollout {
            id: RolloutId(self.id),
            component: self.component,
            from_version: self.from_version,
            to_version: self.to_version,
            strategy,
            status: self
                .status
                .parse::<RolloutStatus>()
                .map_err(|e| parse_err("rollout status", e))?,
            total_tenants: self.total_tenants.max(0) as u32,
            counters: RolloutCounters {
                pending: self.pending_count.max(0) as u32,
                active: self.active_count.max(0) as u32,
                succeeded: self.succeeded_count.max(0) as u32,
                failed: self.failed_count.max(0) as u32,
            },
            wave_sizes,
            created_by: self.created_by,
            created_at: self.created_at,
            reason: self.reason,
            priority_override: self.priority_override.map(|p| p.max(0) as u8),
        })
    }
}

fn strategy_str(strategy: RolloutStrategy) -> &'static str {
    match strategy {
        RolloutStrategy::CanaryStaged => "canary-staged",
        RolloutStrategy::FleetSync => "fleet-sync",
    }
}

#[derive(FromRow)]
struct WaveRow {
    rollout_id: uuid::Uuid,
    number: i32,
    members: serde_json::Value,
    status: String,
    error_rate: f64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl WaveRow {
    fn into_domain(self) -> ControlResult<Wave> {
        let members: Vec<TenantId> =
            serde_json::from_value(self.members).map_err(|e| parse_err("wave members", e))?;
        Ok(Wave {
            rollout_id: RolloutId(self.rollout_id),
            number: self.number.max(0) as u32,
            members,
            status: self
                .status
                .parse::<WaveStatus>()
                .map_err(|e| parse_err("wave status", e))?,
            error_rate: self.error_rate,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_account(&self, account: &CloudAccount) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.accounts \
             (id, api_token, region, max_droplets, current_droplets, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET api_token = EXCLUDED.api_token, \
             region = EXCLUDED.region, max_droplets = EXCLUDED.max_droplets, \
             status = EXCLUDED.status",
        )
        .bind(account.id.as_str())
        .bind(account.api_token.expose())
        .bind(&account.region)
        .bind(account.max_droplets as i32)
        .bind(account.current_droplets as i32)
        .bind(account.status.as_str())
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<CloudAccount>> {
        let row: Option<AccountRow> =
            sqlx::query_as("SELECT * FROM genesis.accounts WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        row.map(AccountRow::into_domain).transpose()
    }

    async fn list_accounts(&self) -> ControlResult<Vec<CloudAccount>> {
        let rows: Vec<AccountRow> =
            sqlx::query_as("SELECT * FROM genesis.accounts ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        rows.into_iter().map(AccountRow::into_domain).collect()
    }

    async fn claim_account_slot(&self, region: &str) -> ControlResult<CloudAccount> {
        // Selection, increment, and the full-flip happen in one guarded
        // UPDATE so concurrent claims cannot overshoot the cap.
        let row: Option<AccountRow> = sqlx::query_as(
            "UPDATE genesis.accounts a SET \
               current_droplets = a.current_droplets + 1, \
               status = CASE \
                 WHEN (a.current_droplets + 1)::float8 >= a.max_droplets::float8 * 0.95 \
                 THEN 'full' ELSE 'active' END \
             WHERE a.id = ( \
               SELECT id FROM genesis.accounts \
               WHERE region = $1 AND status = 'active' AND current_droplets < max_droplets \
               ORDER BY (max_droplets - current_droplets) DESC, created_at ASC \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING a.*",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        match row {
            Some(row) => row.into_domain(),
            None => Err(ControlError::NoCapacity {
                region: region.to_string(),
            }),
        }
    }

    async fn release_account_slot(&self, id: &AccountId) -> ControlResult<()> {
        sqlx::query(
            "UPDATE genesis.accounts SET \
               current_droplets = GREATEST(current_droplets - 1, 0), \
               status = CASE \
                 WHEN status = 'disabled' THEN 'disabled' \
                 WHEN GREATEST(current_droplets - 1, 0)::float8 >= max_droplets::float8 * 0.95 \
                 THEN 'full' ELSE 'active' END \
             WHERE id = $1",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: &AccountId,
        status: AccountStatus,
    ) -> ControlResult<()> {
        sqlx::query("UPDATE genesis.accounts SET status = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.tenants (id, slug, region, tier) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET slug = EXCLUDED.slug, \
             region = EXCLUDED.region, tier = EXCLUDED.tier",
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.slug)
        .bind(&tenant.region)
        .bind(tenant.tier.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> ControlResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as("SELECT * FROM genesis.tenants WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(TenantRow::into_domain).transpose()
    }

    async fn list_tenants(&self) -> ControlResult<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as("SELECT * FROM genesis.tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(TenantRow::into_domain).collect()
    }

    async fn get_activity(&self, id: &TenantId) -> ControlResult<Option<TenantActivity>> {
        #[derive(FromRow)]
        struct ActivityRow {
            tenant_id: String,
            last_campaign_at: Option<DateTime<Utc>>,
            last_execution_at: Option<DateTime<Utc>>,
            last_login_at: Option<DateTime<Utc>>,
            account_active: bool,
            manual_hold: bool,
        }
        let row: Option<ActivityRow> =
            sqlx::query_as("SELECT * FROM genesis.tenant_activity WHERE tenant_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(row.map(|r| TenantActivity {
            tenant_id: TenantId::new(r.tenant_id),
            last_campaign_at: r.last_campaign_at,
            last_execution_at: r.last_execution_at,
            last_login_at: r.last_login_at,
            account_active: r.account_active,
            manual_hold: r.manual_hold,
        }))
    }

    async fn upsert_activity(&self, activity: &TenantActivity) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.tenant_activity \
             (tenant_id, last_campaign_at, last_execution_at, last_login_at, account_active, manual_hold) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
               last_campaign_at = EXCLUDED.last_campaign_at, \
               last_execution_at = EXCLUDED.last_execution_at, \
               last_login_at = EXCLUDED.last_login_at, \
               account_active = EXCLUDED.account_active, \
               manual_hold = EXCLUDED.manual_hold",
        )
        .bind(activity.tenant_id.as_str())
        .bind(activity.last_campaign_at)
        .bind(activity.last_execution_at)
        .bind(activity.last_login_at)
        .bind(activity.account_active)
        .bind(activity.manual_hold)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn scheduled_campaigns_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ControlResult<Vec<ScheduledCampaign>> {
        #[derive(FromRow)]
        struct CampaignRow {
            tenant_id: String,
            scheduled_at: DateTime<Utc>,
        }
        let rows: Vec<CampaignRow> = sqlx::query_as(
            "SELECT tenant_id, scheduled_at FROM genesis.scheduled_campaigns \
             WHERE scheduled_at >= $1 AND scheduled_at <= $2 ORDER BY scheduled_at",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|r| ScheduledCampaign {
                tenant_id: TenantId::new(r.tenant_id),
                scheduled_at: r.scheduled_at,
            })
            .collect())
    }

    async fn create_droplet(
        &self,
        droplet: &DropletHealth,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        // The tenant_id primary key carries the 1:1 invariant: the upsert
        // only replaces a terminal row.
        let written: Option<(String,)> = sqlx::query_as(
            "INSERT INTO genesis.droplet_health AS dh \
             (tenant_id, droplet_id, account_id, region, size_slug, public_ip, public_dns, \
              state, last_heartbeat, cpu_pct, mem_pct, disk_pct, engine_healthy, \
              sidecar_version, credential_fingerprint, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
               droplet_id = EXCLUDED.droplet_id, account_id = EXCLUDED.account_id, \
               region = EXCLUDED.region, size_slug = EXCLUDED.size_slug, \
               public_ip = EXCLUDED.public_ip, public_dns = EXCLUDED.public_dns, \
               state = EXCLUDED.state, last_heartbeat = EXCLUDED.last_heartbeat, \
               cpu_pct = EXCLUDED.cpu_pct, mem_pct = EXCLUDED.mem_pct, \
               disk_pct = EXCLUDED.disk_pct, engine_healthy = EXCLUDED.engine_healthy, \
               sidecar_version = EXCLUDED.sidecar_version, \
               credential_fingerprint = EXCLUDED.credential_fingerprint, \
               created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at \
             WHERE dh.state IN ('TERMINATED', 'ORPHAN') \
             RETURNING tenant_id",
        )
        .bind(droplet.tenant_id.as_str())
        .bind(droplet.droplet_id.0 as i64)
        .bind(droplet.account_id.as_str())
        .bind(&droplet.region)
        .bind(&droplet.size_slug)
        .bind(&droplet.public_ip)
        .bind(&droplet.public_dns)
        .bind(droplet.state.as_str())
        .bind(droplet.last_heartbeat)
        .bind(droplet.cpu_pct)
        .bind(droplet.mem_pct)
        .bind(droplet.disk_pct)
        .bind(droplet.engine_healthy)
        .bind(&droplet.sidecar_version)
        .bind(&droplet.credential_fingerprint)
        .bind(droplet.created_at)
        .bind(droplet.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if written.is_none() {
            return Err(ControlError::ValidationFailed(format!(
                "tenant {} already owns a live droplet",
                droplet.tenant_id
            )));
        }

        sqlx::query(
            "INSERT INTO genesis.lifecycle_log \
             (droplet_id, tenant_id, from_state, to_state, reason, actor, at, metadata) \
             VALUES ($1, $2, NULL, $3, $4, $5, now(), 'null'::jsonb)",
        )
        .bind(droplet.droplet_id.0 as i64)
        .bind(droplet.tenant_id.as_str())
        .bind(droplet.state.as_str())
        .bind(reason)
        .bind(actor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }

    async fn get_droplet(&self, tenant: &TenantId) -> ControlResult<Option<DropletHealth>> {
        let query = format!(
            "SELECT {} FROM genesis.droplet_health WHERE tenant_id = $1",
            DROPLET_COLUMNS
        );
        let row: Option<DropletRow> = sqlx::query_as(&query)
            .bind(tenant.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(DropletRow::into_domain).transpose()
    }

    async fn get_droplet_by_id(&self, id: DropletId) -> ControlResult<Option<DropletHealth>> {
        let query = format!(
            "SELECT {} FROM genesis.droplet_health WHERE droplet_id = $1",
            DROPLET_COLUMNS
        );
        let row: Option<DropletRow> = sqlx::query_as(&query)
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(DropletRow::into_domain).transpose()
    }

    async fn list_droplets(&self) -> ControlResult<Vec<DropletHealth>> {
        let query = format!("SELECT {} FROM genesis.droplet_health", DROPLET_COLUMNS);
        let rows: Vec<DropletRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(DropletRow::into_domain).collect()
    }

    async fn list_active_droplets(&self) -> ControlResult<Vec<DropletHealth>> {
        let query = format!(
            "SELECT {} FROM genesis.droplet_health \
             WHERE state IN ('ACTIVE_HEALTHY', 'ACTIVE_DEGRADED')",
            DROPLET_COLUMNS
        );
        let rows: Vec<DropletRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(DropletRow::into_domain).collect()
    }

    async fn update_gauges_bulk(&self, heartbeats: &[Heartbeat]) -> ControlResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for hb in heartbeats {
            sqlx::query(
                "UPDATE genesis.droplet_health SET \
                   last_heartbeat = $2, cpu_pct = $3, mem_pct = $4, disk_pct = $5, \
                   engine_healthy = $6, updated_at = now() \
                 WHERE tenant_id = $1",
            )
            .bind(hb.tenant_id.as_str())
            .bind(hb.ts)
            .bind(hb.cpu_pct)
            .bind(hb.mem_pct)
            .bind(hb.disk_pct)
            .bind(hb.engine_healthy)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)
    }

    async fn update_droplet_versions(
        &self,
        tenant: &TenantId,
        sidecar_version: Option<&str>,
        credential_fingerprint: Option<&str>,
    ) -> ControlResult<()> {
        sqlx::query(
            "UPDATE genesis.droplet_health SET \
               sidecar_version = COALESCE($2, sidecar_version), \
               credential_fingerprint = COALESCE($3, credential_fingerprint), \
               updated_at = now() \
             WHERE tenant_id = $1",
        )
        .bind(tenant.as_str())
        .bind(sidecar_version)
        .bind(credential_fingerprint)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn transition(
        &self,
        droplet_id: DropletId,
        to: DropletState,
        reason: &str,
        actor: &str,
        metadata: serde_json::Value,
    ) -> ControlResult<LifecycleEvent> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        // Row lock serializes transitions per droplet.
        let current: Option<(String, String)> = sqlx::query_as(
            "SELECT tenant_id, state FROM genesis.droplet_health \
             WHERE droplet_id = $1 FOR UPDATE",
        )
        .bind(droplet_id.0 as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        let Some((tenant_id, state_raw)) = current else {
            return Err(ControlError::NotFound(format!("droplet {}", droplet_id)));
        };
        let from = state_raw
            .parse::<DropletState>()
            .map_err(|e| parse_err("state", e))?;
        if !from.can_transition_to(to) {
            return Err(ControlError::StateTransitionInvalid { from, to });
        }

        let at = Utc::now();
        sqlx::query(
            "INSERT INTO genesis.lifecycle_log \
             (droplet_id, tenant_id, from_state, to_state, reason, actor, at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(droplet_id.0 as i64)
        .bind(&tenant_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(actor)
        .bind(at)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "UPDATE genesis.droplet_health SET state = $2, updated_at = now() \
             WHERE droplet_id = $1",
        )
        .bind(droplet_id.0 as i64)
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(LifecycleEvent {
            droplet_id,
            tenant_id: TenantId::new(tenant_id),
            from_state: Some(from),
            to_state: to,
            reason: reason.to_string(),
            actor: actor.to_string(),
            at,
            metadata,
        })
    }

    async fn terminate_droplet(
        &self,
        droplet_id: DropletId,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let current: Option<(String, String, String)> = sqlx::query_as(
            "SELECT tenant_id, state, account_id FROM genesis.droplet_health \
             WHERE droplet_id = $1 FOR UPDATE",
        )
        .bind(droplet_id.0 as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        let Some((tenant_id, state_raw, account_id)) = current else {
            return Err(ControlError::NotFound(format!("droplet {}", droplet_id)));
        };
        let from = state_raw
            .parse::<DropletState>()
            .map_err(|e| parse_err("state", e))?;
        if !from.can_transition_to(DropletState::Terminated) {
            return Err(ControlError::StateTransitionInvalid {
                from,
                to: DropletState::Terminated,
            });
        }

        sqlx::query(
            "INSERT INTO genesis.lifecycle_log \
             (droplet_id, tenant_id, from_state, to_state, reason, actor, at, metadata) \
             VALUES ($1, $2, $3, 'TERMINATED', $4, $5, now(), 'null'::jsonb)",
        )
        .bind(droplet_id.0 as i64)
        .bind(&tenant_id)
        .bind(from.as_str())
        .bind(reason)
        .bind(actor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "UPDATE genesis.droplet_health SET state = 'TERMINATED', updated_at = now() \
             WHERE droplet_id = $1",
        )
        .bind(droplet_id.0 as i64)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "UPDATE genesis.accounts SET \
               current_droplets = GREATEST(current_droplets - 1, 0), \
               status = CASE \
                 WHEN status = 'disabled' THEN 'disabled' \
                 WHEN GREATEST(current_droplets - 1, 0)::float8 >= max_droplets::float8 * 0.95 \
                 THEN 'full' ELSE 'active' END \
             WHERE id = $1",
        )
        .bind(&account_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }

    async fn lifecycle_events(&self, droplet_id: DropletId) -> ControlResult<Vec<LifecycleEvent>> {
        let rows: Vec<LifecycleRow> = sqlx::query_as(
            "SELECT droplet_id, tenant_id, from_state, to_state, reason, actor, at, metadata \
             FROM genesis.lifecycle_log WHERE droplet_id = $1 ORDER BY at, id",
        )
        .bind(droplet_id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(LifecycleRow::into_domain).collect()
    }

    async fn record_flow_step(&self, step: &FlowStepRecord) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.flow_steps (droplet_id, tenant_id, flow, step, at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(step.droplet_id.0 as i64)
        .bind(step.tenant_id.as_str())
        .bind(&step.flow)
        .bind(&step.step)
        .bind(step.at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn flow_steps(
        &self,
        droplet_id: DropletId,
        flow: &str,
    ) -> ControlResult<Vec<FlowStepRecord>> {
        #[derive(FromRow)]
        struct StepRow {
            droplet_id: i64,
            tenant_id: String,
            flow: String,
            step: String,
            at: DateTime<Utc>,
        }
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT droplet_id, tenant_id, flow, step, at FROM genesis.flow_steps \
             WHERE droplet_id = $1 AND flow = $2 ORDER BY at, id",
        )
        .bind(droplet_id.0 as i64)
        .bind(flow)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|r| FlowStepRecord {
                droplet_id: DropletId(r.droplet_id.max(0) as u64),
                tenant_id: TenantId::new(r.tenant_id),
                flow: r.flow,
                step: r.step,
                at: r.at,
            })
            .collect())
    }

    async fn record_version(&self, entry: &VersionLedgerEntry) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.tenant_versions \
             (tenant_id, component, version, previous_version, rollout_id, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.tenant_id.as_str())
        .bind(&entry.component)
        .bind(&entry.version)
        .bind(&entry.previous_version)
        .bind(entry.rollout_id.map(|r| r.0))
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn current_version(
        &self,
        tenant: &TenantId,
        component: &str,
    ) -> ControlResult<Option<VersionLedgerEntry>> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT tenant_id, component, version, previous_version, rollout_id, recorded_at \
             FROM genesis.tenant_versions \
             WHERE tenant_id = $1 AND component = $2 \
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(component)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(VersionRow::into_domain))
    }

    async fn versions_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Vec<VersionLedgerEntry>> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            "SELECT DISTINCT ON (tenant_id) \
               tenant_id, component, version, previous_version, rollout_id, recorded_at \
             FROM genesis.tenant_versions WHERE component = $1 \
             ORDER BY tenant_id, recorded_at DESC, id DESC",
        )
        .bind(component)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(VersionRow::into_domain).collect())
    }

    async fn versions_changed_by(
        &self,
        rollout_id: RolloutId,
    ) -> ControlResult<Vec<VersionLedgerEntry>> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            "SELECT tenant_id, component, version, previous_version, rollout_id, recorded_at \
             FROM genesis.tenant_versions WHERE rollout_id = $1 ORDER BY recorded_at",
        )
        .bind(rollout_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(VersionRow::into_domain).collect())
    }

    async fn insert_rollout(&self, rollout: &Rollout) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.rollouts \
             (id, component, from_version, to_version, strategy, status, total_tenants, \
              pending_count, active_count, succeeded_count, failed_count, wave_sizes, \
              created_by, created_at, reason, priority_override) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(rollout.id.0)
        .bind(&rollout.component)
        .bind(&rollout.from_version)
        .bind(&rollout.to_version)
        .bind(strategy_str(rollout.strategy))
        .bind(rollout.status.as_str())
        .bind(rollout.total_tenants as i32)
        .bind(rollout.counters.pending as i32)
        .bind(rollout.counters.active as i32)
        .bind(rollout.counters.succeeded as i32)
        .bind(rollout.counters.failed as i32)
        .bind(serde_json::to_value(&rollout.wave_sizes)?)
        .bind(&rollout.created_by)
        .bind(rollout.created_at)
        .bind(&rollout.reason)
        .bind(rollout.priority_override.map(|p| p as i16))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_rollout(&self, id: RolloutId) -> ControlResult<Option<Rollout>> {
        let row: Option<RolloutRow> =
            sqlx::query_as("SELECT * FROM genesis.rollouts WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        row.map(RolloutRow::into_domain).transpose()
    }

    async fn update_rollout(&self, rollout: &Rollout) -> ControlResult<()> {
        sqlx::query(
            "UPDATE genesis.rollouts SET \
               status = $2, total_tenants = $3, pending_count = $4, active_count = $5, \
               succeeded_count = $6, failed_count = $7, wave_sizes = $8, reason = $9, \
               priority_override = $10 \
             WHERE id = $1",
        )
        .bind(rollout.id.0)
        .bind(rollout.status.as_str())
        .bind(rollout.total_tenants as i32)
        .bind(rollout.counters.pending as i32)
        .bind(rollout.counters.active as i32)
        .bind(rollout.counters.succeeded as i32)
        .bind(rollout.counters.failed as i32)
        .bind(serde_json::to_value(&rollout.wave_sizes)?)
        .bind(&rollout.reason)
        .bind(rollout.priority_override.map(|p| p as i16))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn active_rollout_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Option<Rollout>> {
        let row: Option<RolloutRow> = sqlx::query_as(
            "SELECT * FROM genesis.rollouts \
             WHERE component = $1 AND status IN ('pending', 'active', 'paused') \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(component)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(RolloutRow::into_domain).transpose()
    }

    async fn upsert_wave(&self, wave: &Wave) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.waves \
             (rollout_id, number, members, status, error_rate, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (rollout_id, number) DO UPDATE SET \
               members = EXCLUDED.members, status = EXCLUDED.status, \
               error_rate = EXCLUDED.error_rate, started_at = EXCLUDED.started_at, \
               ended_at = EXCLUDED.ended_at",
        )
        .bind(wave.rollout_id.0)
        .bind(wave.number as i32)
        .bind(serde_json::to_value(&wave.members)?)
        .bind(wave.status.as_str())
        .bind(wave.error_rate)
        .bind(wave.started_at)
        .bind(wave.ended_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_wave(&self, rollout_id: RolloutId, number: u32) -> ControlResult<Option<Wave>> {
        let row: Option<WaveRow> = sqlx::query_as(
            "SELECT * FROM genesis.waves WHERE rollout_id = $1 AND number = $2",
        )
        .bind(rollout_id.0)
        .bind(number as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(WaveRow::into_domain).transpose()
    }

    async fn list_waves(&self, rollout_id: RolloutId) -> ControlResult<Vec<Wave>> {
        let rows: Vec<WaveRow> = sqlx::query_as(
            "SELECT * FROM genesis.waves WHERE rollout_id = $1 ORDER BY number",
        )
        .bind(rollout_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(WaveRow::into_domain).collect()
    }

    async fn upsert_template(
        &self,
        component: &str,
        version: &str,
        body: &serde_json::Value,
    ) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.templates (component, version, body, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (component) DO UPDATE SET \
               version = EXCLUDED.version, body = EXCLUDED.body, updated_at = now()",
        )
        .bind(component)
        .bind(version)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_template(
        &self,
        component: &str,
    ) -> ControlResult<Option<(String, serde_json::Value)>> {
        let row: Option<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT version, body FROM genesis.templates WHERE component = $1",
        )
        .bind(component)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row)
    }

    async fn record_credential_update(&self, update: &CredentialUpdate) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.credential_updates \
             (tenant_id, droplet_id, credential_type, fingerprint, rollout_id, at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(update.tenant_id.as_str())
        .bind(update.droplet_id.0 as i64)
        .bind(&update.credential_type)
        .bind(&update.fingerprint)
        .bind(update.rollout_id.map(|r| r.0))
        .bind(update.at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn credential_updates(&self, tenant: &TenantId) -> ControlResult<Vec<CredentialUpdate>> {
        #[derive(FromRow)]
        struct CredRow {
            tenant_id: String,
            droplet_id: i64,
            credential_type: String,
            fingerprint: String,
            rollout_id: Option<uuid::Uuid>,
            at: DateTime<Utc>,
        }
        let rows: Vec<CredRow> = sqlx::query_as(
            "SELECT tenant_id, droplet_id, credential_type, fingerprint, rollout_id, at \
             FROM genesis.credential_updates WHERE tenant_id = $1 ORDER BY at",
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|r| CredentialUpdate {
                tenant_id: TenantId::new(r.tenant_id),
                droplet_id: DropletId(r.droplet_id.max(0) as u64),
                credential_type: r.credential_type,
                fingerprint: r.fingerprint,
                rollout_id: r.rollout_id.map(RolloutId),
                at: r.at,
            })
            .collect())
    }

    async fn record_cost_event(&self, event: &CostEvent) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO genesis.cost_events (tenant_id, droplet_id, kind, amount_delta, at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.tenant_id.as_str())
        .bind(event.droplet_id.0 as i64)
        .bind(&event.kind)
        .bind(event.amount_delta)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fleet_summary(&self) -> ControlResult<FleetSummary> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, droplets FROM genesis.fleet_summary")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        let mut summary = FleetSummary::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            summary.total += count;
            summary.by_state.insert(state, count);
        }
        Ok(summary)
    }

    async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
