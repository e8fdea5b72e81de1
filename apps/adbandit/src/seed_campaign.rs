//! Seed a campaign and its arm grid from a TOML definition.
//!
//! The arm grid is the cross product of platforms, channels, creatives and
//! bids, the way campaigns are usually set up for grid exploration.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use adbandit_models::{Arm, Campaign, CampaignStatus, EngineConfig, PrimaryKpi};
use adbandit_store::PosteriorStore;

#[derive(Debug, Deserialize)]
struct CampaignFile {
    name: String,
    budget: f64,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    risk_tolerance: Option<f64>,
    #[serde(default)]
    variance_limit: Option<f64>,
    #[serde(default)]
    cadence_ms: Option<i64>,
    arms: ArmGrid,
}

#[derive(Debug, Deserialize)]
struct ArmGrid {
    platforms: Vec<String>,
    channels: Vec<String>,
    creatives: Vec<String>,
    bids: Vec<f64>,
}

pub fn run(campaign_path: &str, engine_config_path: &str) -> anyhow::Result<()> {
    let cfg = EngineConfig::load(engine_config_path).unwrap_or_default();
    let raw = std::fs::read_to_string(campaign_path)
        .map_err(|e| anyhow::anyhow!("could not read {campaign_path}: {e}"))?;
    let spec: CampaignFile =
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("failed to parse campaign: {e}"))?;

    let store = Arc::new(PosteriorStore::open_with_timeout(
        &cfg.db_path,
        cfg.write_timeout(),
    )?);
    let campaign = Campaign {
        id: 0,
        name: spec.name.clone(),
        total_budget: spec.budget,
        start: spec.start.unwrap_or_else(Utc::now),
        end: spec.end,
        status: CampaignStatus::Draft,
        primary_kpi: PrimaryKpi::Roas,
        risk_tolerance: spec.risk_tolerance.unwrap_or(cfg.risk_tolerance_default),
        variance_limit: spec.variance_limit.unwrap_or(cfg.variance_limit_default),
        cadence_ms: spec.cadence_ms.unwrap_or(cfg.cycle_default_ms),
    };
    let cid = store.create_campaign(&campaign)?;

    let mut created = 0;
    for platform in &spec.arms.platforms {
        for channel in &spec.arms.channels {
            for creative in &spec.arms.creatives {
                for &bid in &spec.arms.bids {
                    let arm = Arm::new(cid, platform.clone(), channel.clone(), creative.clone(), bid);
                    store.add_arm(&arm)?;
                    created += 1;
                }
            }
        }
    }

    info!(campaign_id = cid, arms = created, "campaign seeded");
    println!(
        "Created campaign `{}` (id {cid}) with {created} arms in {}.",
        spec.name, cfg.db_path
    );
    println!("Activate it by setting status=active, then start `adbandit run`.");
    Ok(())
}
