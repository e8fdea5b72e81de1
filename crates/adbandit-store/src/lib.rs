//! # AdBandit Posterior Store
//!
//! Durable, crash-safe persistence for campaigns, arms, per-arm Beta
//! posteriors, metric time series, the append-only allocation change log,
//! and the intended-allocation crash journal.
//!
//! ## Contract
//! - `record_metric` is idempotent on `(arm_id, ts, source)`; re-ingesting
//!   an identical row leaves the table bit-identical.
//! - `update_posterior` is transactional and holds a per-arm lock for the
//!   duration of the read-modify-write.
//! - `append_change` enforces a monotonic timestamp over the change log.
//! - On restart, posteriors are reconstructed from the last committed row
//!   per arm; the metric log is audit/ETL data, never replayed.
//! - A write that cannot be durably committed surfaces a `StoreError`;
//!   the store never silently drops.
//!
//! Busy/locked conditions map to `StoreError::LockTimeout` so the engine
//! can retry once with a fresh snapshot before escalating.

pub mod error;

pub use error::{Result, StoreError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use adbandit_models::{
    AllocationChange, Arm, ArmId, ArmPosterior, Campaign, CampaignId, CampaignStatus,
    Initiator, Metric, MetricQuality, MetricSource, PosteriorUpdate, PrimaryKpi,
    ValidationError,
};
use error::db_err;

/// Outcome of a metric insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    DuplicateIgnored,
}

/// Atomic view of a campaign with its arms and posteriors.
#[derive(Debug, Clone)]
pub struct CampaignState {
    pub campaign: Campaign,
    pub arms: Vec<Arm>,
    pub posteriors: BTreeMap<ArmId, ArmPosterior>,
}

impl CampaignState {
    /// Cumulative spend across all arms.
    pub fn spend_total(&self) -> f64 {
        self.posteriors.values().map(|p| p.spend).sum()
    }
}

/// SQLite-backed store. One logical relational database; see the schema in
/// [`PosteriorStore::init_schema`].
pub struct PosteriorStore {
    conn: Mutex<Connection>,
    arm_locks: Mutex<HashMap<ArmId, Arc<Mutex<()>>>>,
}

fn ts_to_us(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn ts_from_us(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Durable-write deadline when the caller does not supply one.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

impl PosteriorStore {
    /// Open (or create) a store at the given path with the default
    /// durable-write deadline.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_WRITE_TIMEOUT)
    }

    /// Open (or create) a store with an explicit durable-write deadline.
    /// The deadline is enforced as the SQLite busy timeout: a write that
    /// cannot acquire the database within it surfaces as a lock-wait
    /// timeout for the retry policy.
    pub fn open_with_timeout(path: impl AsRef<Path>, write_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn, write_timeout)
    }

    /// In-memory store for tests and simulations.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, DEFAULT_WRITE_TIMEOUT)
    }

    fn with_connection(conn: Connection, write_timeout: Duration) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        conn.busy_timeout(write_timeout).map_err(db_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            arm_locks: Mutex::new(HashMap::new()),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS campaigns (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL,
                budget          REAL NOT NULL,
                start_ts        INTEGER NOT NULL,
                end_ts          INTEGER,
                status          TEXT NOT NULL,
                primary_kpi     TEXT NOT NULL,
                risk_tolerance  REAL NOT NULL,
                variance_limit  REAL NOT NULL,
                cadence_ms      INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS arms (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
                arm_key     TEXT NOT NULL,
                platform    TEXT NOT NULL,
                channel     TEXT NOT NULL,
                creative    TEXT NOT NULL,
                bid         REAL NOT NULL,
                disabled    INTEGER NOT NULL DEFAULT 0,
                UNIQUE (campaign_id, arm_key)
            );
            CREATE TABLE IF NOT EXISTS posteriors (
                arm_id         INTEGER PRIMARY KEY REFERENCES arms(id),
                alpha          REAL NOT NULL,
                beta           REAL NOT NULL,
                spend          REAL NOT NULL,
                reward_sum     REAL NOT NULL,
                reward_sq_sum  REAL NOT NULL,
                trials         INTEGER NOT NULL,
                updated_ts     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS metrics (
                arm_id      INTEGER NOT NULL REFERENCES arms(id),
                ts_us       INTEGER NOT NULL,
                source      TEXT NOT NULL,
                impressions INTEGER NOT NULL,
                clicks      INTEGER NOT NULL,
                conversions INTEGER NOT NULL,
                cost        REAL NOT NULL,
                revenue     REAL NOT NULL,
                quality     TEXT NOT NULL,
                PRIMARY KEY (arm_id, ts_us, source)
            );
            CREATE TABLE IF NOT EXISTS allocation_changes (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id         INTEGER NOT NULL,
                arm_id              INTEGER NOT NULL,
                ts_us               INTEGER NOT NULL,
                old_alloc           REAL NOT NULL,
                new_alloc           REAL NOT NULL,
                reason              TEXT NOT NULL,
                factors_json        TEXT NOT NULL,
                mmm_json            TEXT NOT NULL,
                initiated_by        TEXT NOT NULL,
                state_snapshot_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_changes_campaign_ts
                ON allocation_changes (campaign_id, ts_us);
            CREATE TABLE IF NOT EXISTS intended_allocations (
                campaign_id INTEGER NOT NULL,
                arm_id      INTEGER NOT NULL,
                alloc       REAL NOT NULL,
                ts_us       INTEGER NOT NULL,
                PRIMARY KEY (campaign_id, arm_id)
            );",
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn arm_lock(&self, arm_id: ArmId) -> Arc<Mutex<()>> {
        let mut locks = self.arm_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(arm_id).or_default().clone()
    }

    // -------------------------------------------------------------------
    // Campaigns & arms
    // -------------------------------------------------------------------

    pub fn create_campaign(&self, campaign: &Campaign) -> Result<CampaignId> {
        campaign.validate()?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO campaigns
             (name, budget, start_ts, end_ts, status, primary_kpi,
              risk_tolerance, variance_limit, cadence_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                campaign.name,
                campaign.total_budget,
                ts_to_us(campaign.start),
                campaign.end.map(ts_to_us),
                campaign.status.as_str(),
                campaign.primary_kpi.as_str(),
                campaign.risk_tolerance,
                campaign.variance_limit,
                campaign.cadence_ms,
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        let conn = self.lock_conn();
        Self::read_campaign(&conn, id)
    }

    fn read_campaign(conn: &Connection, id: CampaignId) -> Result<Campaign> {
        let row = conn
            .query_row(
                "SELECT id, name, budget, start_ts, end_ts, status, primary_kpi,
                        risk_tolerance, variance_limit, cadence_ms
                 FROM campaigns WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, f64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, f64>(7)?,
                        r.get::<_, f64>(8)?,
                        r.get::<_, i64>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .ok_or(StoreError::NotFound { what: "campaign", id })?;

        Ok(Campaign {
            id: row.0,
            name: row.1,
            total_budget: row.2,
            start: ts_from_us(row.3),
            end: row.4.map(ts_from_us),
            status: row.5.parse::<CampaignStatus>()?,
            primary_kpi: row.6.parse::<PrimaryKpi>()?,
            risk_tolerance: row.7,
            variance_limit: row.8,
            cadence_ms: row.9,
        })
    }

    pub fn update_campaign_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()> {
        let conn = self.lock_conn();
        let n = conn
            .execute(
                "UPDATE campaigns SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(StoreError::NotFound { what: "campaign", id });
        }
        debug!(campaign_id = id, status = %status, "campaign status updated");
        Ok(())
    }

    /// Campaigns the supervisor resumes at boot: Active or Paused.
    pub fn resumable_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare("SELECT id FROM campaigns WHERE status IN ('active', 'paused')")
            .map_err(db_err)?;
        let ids: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;
        drop(stmt);
        ids.into_iter()
            .map(|id| Self::read_campaign(&conn, id))
            .collect()
    }

    /// Insert an arm, rejecting duplicates of `(campaign_id, arm_key)`.
    pub fn add_arm(&self, arm: &Arm) -> Result<ArmId> {
        arm.validate()?;
        let key = arm.arm_key();
        let conn = self.lock_conn();
        let result = conn.execute(
            "INSERT INTO arms (campaign_id, arm_key, platform, channel, creative, bid, disabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                arm.campaign_id,
                key,
                arm.platform,
                arm.channel,
                arm.creative,
                arm.bid,
                arm.disabled as i64,
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(inner, _))
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ValidationError::DuplicateArmKey(key).into())
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn set_arm_disabled(&self, arm_id: ArmId, disabled: bool) -> Result<()> {
        let conn = self.lock_conn();
        let n = conn
            .execute(
                "UPDATE arms SET disabled = ?1 WHERE id = ?2",
                params![disabled as i64, arm_id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(StoreError::NotFound { what: "arm", id: arm_id });
        }
        Ok(())
    }

    fn read_arms(conn: &Connection, campaign_id: CampaignId) -> Result<Vec<Arm>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, platform, channel, creative, bid, disabled
                 FROM arms WHERE campaign_id = ?1 ORDER BY arm_key",
            )
            .map_err(db_err)?;
        let arms = stmt
            .query_map(params![campaign_id], |r| {
                Ok(Arm {
                    id: r.get(0)?,
                    campaign_id: r.get(1)?,
                    platform: r.get(2)?,
                    channel: r.get(3)?,
                    creative: r.get(4)?,
                    bid: r.get(5)?,
                    disabled: r.get::<_, i64>(6)? != 0,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(arms)
    }

    pub fn arms_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Arm>> {
        let conn = self.lock_conn();
        Self::read_arms(&conn, campaign_id)
    }

    /// Resolve an arm key to `(campaign_id, arm_id)`, e.g. when mapping an
    /// inbound webhook payload onto an arm.
    pub fn resolve_arm(&self, arm_key: &str) -> Result<Option<(CampaignId, ArmId)>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT campaign_id, id FROM arms WHERE arm_key = ?1",
            params![arm_key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)
    }

    /// Atomic snapshot: campaign, arms, and the last committed posterior per
    /// arm, all read inside one transaction.
    pub fn load_campaign(&self, id: CampaignId) -> Result<CampaignState> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        let campaign = Self::read_campaign(&tx, id)?;
        let arms = Self::read_arms(&tx, id)?;
        let mut posteriors = BTreeMap::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT p.arm_id, p.alpha, p.beta, p.spend, p.reward_sum,
                            p.reward_sq_sum, p.trials, p.updated_ts
                     FROM posteriors p JOIN arms a ON a.id = p.arm_id
                     WHERE a.campaign_id = ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id], |r| {
                    Ok(ArmPosterior {
                        arm_id: r.get(0)?,
                        alpha: r.get(1)?,
                        beta: r.get(2)?,
                        spend: r.get(3)?,
                        reward_sum: r.get(4)?,
                        reward_sq_sum: r.get(5)?,
                        trials: r.get::<_, i64>(6)? as u64,
                        updated_ts: ts_from_us(r.get(7)?),
                    })
                })
                .map_err(db_err)?;
            for row in rows {
                let p = row.map_err(db_err)?;
                posteriors.insert(p.arm_id, p);
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(CampaignState { campaign, arms, posteriors })
    }

    /// Consistent read view for a decision cycle. Readers copy the small
    /// numeric posterior vectors out; writers are blocked only for the
    /// duration of the row reads.
    pub fn snapshot(&self, campaign_id: CampaignId) -> Result<CampaignState> {
        self.load_campaign(campaign_id)
    }

    // -------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------

    /// Idempotent insert keyed on `(arm_id, ts, source)`.
    pub fn record_metric(&self, metric: &Metric) -> Result<RecordOutcome> {
        metric.validate()?;
        let conn = self.lock_conn();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO metrics
                 (arm_id, ts_us, source, impressions, clicks, conversions, cost, revenue, quality)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    metric.arm_id,
                    ts_to_us(metric.ts),
                    metric.source.as_str(),
                    metric.impressions as i64,
                    metric.clicks as i64,
                    metric.conversions as i64,
                    metric.cost,
                    metric.revenue,
                    metric.quality.as_str(),
                ],
            )
            .map_err(db_err)?;
        Ok(if n == 0 {
            RecordOutcome::DuplicateIgnored
        } else {
            RecordOutcome::Inserted
        })
    }

    /// Metric rows for one arm since a timestamp, oldest first.
    pub fn metric_history(&self, arm_id: ArmId, since: DateTime<Utc>) -> Result<Vec<Metric>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT arm_id, ts_us, source, impressions, clicks, conversions,
                        cost, revenue, quality
                 FROM metrics WHERE arm_id = ?1 AND ts_us >= ?2 ORDER BY ts_us",
            )
            .map_err(db_err)?;
        let raw = stmt
            .query_map(params![arm_id, ts_to_us(since)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, f64>(6)?,
                    r.get::<_, f64>(7)?,
                    r.get::<_, String>(8)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raw.into_iter()
            .map(|t| {
                Ok(Metric {
                    arm_id: t.0,
                    ts: ts_from_us(t.1),
                    source: t.2.parse::<MetricSource>()?,
                    impressions: t.3 as u64,
                    clicks: t.4 as u64,
                    conversions: t.5 as u64,
                    cost: t.6,
                    revenue: t.7,
                    quality: t.8.parse::<MetricQuality>()?,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Posteriors
    // -------------------------------------------------------------------

    /// Transactional read-modify-write of one arm's posterior, serialized
    /// by a per-arm lock.
    pub fn update_posterior(
        &self,
        arm_id: ArmId,
        update: &PosteriorUpdate,
    ) -> Result<ArmPosterior> {
        let lock = self.arm_lock(arm_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT alpha, beta, spend, reward_sum, reward_sq_sum, trials, updated_ts
                 FROM posteriors WHERE arm_id = ?1",
                params![arm_id],
                |r| {
                    Ok(ArmPosterior {
                        arm_id,
                        alpha: r.get(0)?,
                        beta: r.get(1)?,
                        spend: r.get(2)?,
                        reward_sum: r.get(3)?,
                        reward_sq_sum: r.get(4)?,
                        trials: r.get::<_, i64>(5)? as u64,
                        updated_ts: ts_from_us(r.get(6)?),
                    })
                },
            )
            .optional()
            .map_err(db_err)?;

        let mut posterior = existing.unwrap_or_else(|| ArmPosterior::new(arm_id));
        posterior.apply(update, Utc::now());

        tx.execute(
            "INSERT INTO posteriors
             (arm_id, alpha, beta, spend, reward_sum, reward_sq_sum, trials, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (arm_id) DO UPDATE SET
                 alpha = excluded.alpha,
                 beta = excluded.beta,
                 spend = excluded.spend,
                 reward_sum = excluded.reward_sum,
                 reward_sq_sum = excluded.reward_sq_sum,
                 trials = excluded.trials,
                 updated_ts = excluded.updated_ts",
            params![
                arm_id,
                posterior.alpha,
                posterior.beta,
                posterior.spend,
                posterior.reward_sum,
                posterior.reward_sq_sum,
                posterior.trials as i64,
                ts_to_us(posterior.updated_ts),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(posterior)
    }

    pub fn get_posterior(&self, arm_id: ArmId) -> Result<Option<ArmPosterior>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT alpha, beta, spend, reward_sum, reward_sq_sum, trials, updated_ts
             FROM posteriors WHERE arm_id = ?1",
            params![arm_id],
            |r| {
                Ok(ArmPosterior {
                    arm_id,
                    alpha: r.get(0)?,
                    beta: r.get(1)?,
                    spend: r.get(2)?,
                    reward_sum: r.get(3)?,
                    reward_sq_sum: r.get(4)?,
                    trials: r.get::<_, i64>(5)? as u64,
                    updated_ts: ts_from_us(r.get(6)?),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Cumulative spend for a campaign across all arms.
    pub fn campaign_spend(&self, campaign_id: CampaignId) -> Result<f64> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COALESCE(SUM(p.spend), 0.0)
             FROM posteriors p JOIN arms a ON a.id = p.arm_id
             WHERE a.campaign_id = ?1",
            params![campaign_id],
            |r| r.get(0),
        )
        .map_err(db_err)
    }

    // -------------------------------------------------------------------
    // Change log
    // -------------------------------------------------------------------

    /// Append one change with a monotonic timestamp. Out-of-order input
    /// timestamps are nudged forward by one millisecond past the log head.
    pub fn append_change(&self, change: &AllocationChange) -> Result<i64> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let last: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(ts_us), 0) FROM allocation_changes",
                [],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        let mut ts_us = ts_to_us(change.ts);
        if ts_us <= last {
            ts_us = last + 1_000;
        }
        tx.execute(
            "INSERT INTO allocation_changes
             (campaign_id, arm_id, ts_us, old_alloc, new_alloc, reason,
              factors_json, mmm_json, initiated_by, state_snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                change.campaign_id,
                change.arm_id,
                ts_us,
                change.old_alloc,
                change.new_alloc,
                change.reason,
                serde_json::to_string(&change.factors)?,
                serde_json::to_string(&change.mmm_factors)?,
                change.initiated_by.as_str(),
                serde_json::to_string(&change.state_snapshot)?,
            ],
        )
        .map_err(db_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err)?;
        Ok(id)
    }

    /// Range query over the change log, ordered by timestamp.
    pub fn changes_range(
        &self,
        campaign_id: CampaignId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AllocationChange>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, arm_id, ts_us, old_alloc, new_alloc, reason,
                        factors_json, mmm_json, initiated_by, state_snapshot_json
                 FROM allocation_changes
                 WHERE campaign_id = ?1 AND ts_us >= ?2 AND ts_us < ?3
                 ORDER BY ts_us, id",
            )
            .map_err(db_err)?;
        let raw = stmt
            .query_map(params![campaign_id, ts_to_us(from), ts_to_us(to)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, f64>(4)?,
                    r.get::<_, f64>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                    r.get::<_, String>(9)?,
                    r.get::<_, String>(10)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raw.into_iter()
            .map(|t| {
                Ok(AllocationChange {
                    id: t.0,
                    campaign_id: t.1,
                    arm_id: t.2,
                    ts: ts_from_us(t.3),
                    old_alloc: t.4,
                    new_alloc: t.5,
                    reason: t.6,
                    factors: serde_json::from_str(&t.7)?,
                    mmm_factors: serde_json::from_str(&t.8)?,
                    initiated_by: t.9.parse::<Initiator>()?,
                    state_snapshot: serde_json::from_str(&t.10)?,
                })
            })
            .collect()
    }

    /// Delete change rows older than the retention window. Returns the
    /// number of rows removed.
    pub fn sweep_changes(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let conn = self.lock_conn();
        let n = conn
            .execute(
                "DELETE FROM allocation_changes WHERE ts_us < ?1",
                params![ts_to_us(cutoff)],
            )
            .map_err(db_err)?;
        if n > 0 {
            warn!(rows = n, retention_days, "swept aged allocation changes");
        }
        Ok(n)
    }

    // -------------------------------------------------------------------
    // Intended-allocation journal
    // -------------------------------------------------------------------

    /// Journal the allocation a cycle intended to apply, replacing any
    /// previous journal rows for the campaign.
    pub fn journal_intended(
        &self,
        campaign_id: CampaignId,
        allocs: &[(ArmId, f64)],
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM intended_allocations WHERE campaign_id = ?1",
            params![campaign_id],
        )
        .map_err(db_err)?;
        for (arm_id, alloc) in allocs {
            tx.execute(
                "INSERT INTO intended_allocations (campaign_id, arm_id, alloc, ts_us)
                 VALUES (?1, ?2, ?3, ?4)",
                params![campaign_id, arm_id, alloc, ts_to_us(ts)],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Consume journaled intentions for a campaign (read + clear).
    pub fn take_intended(&self, campaign_id: CampaignId) -> Result<Vec<(ArmId, f64)>> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let rows = {
            let mut stmt = tx
                .prepare(
                    "SELECT arm_id, alloc FROM intended_allocations
                     WHERE campaign_id = ?1 ORDER BY arm_id",
                )
                .map_err(db_err)?;
            let x = stmt
                .query_map(params![campaign_id], |r| Ok((r.get(0)?, r.get(1)?)))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<(ArmId, f64)>, _>>()
                .map_err(db_err)?;
            x
        };
        tx.execute(
            "DELETE FROM intended_allocations WHERE campaign_id = ?1",
            params![campaign_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(rows)
    }

    /// Campaigns that have journaled intentions pending reconciliation.
    pub fn campaigns_with_intended(&self) -> Result<Vec<CampaignId>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT campaign_id FROM intended_allocations")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |r| r.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Force pending WAL pages to the main database file. The checkpoint
    /// pragma returns a status row, so it goes through a query.
    pub fn flush(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()
            .map_err(db_err)?;
        Ok(())
    }
}
