//! Bounded paper run against the simulated platform.
//!
//! Seeds a three-arm campaign with distinct funnel profiles, polls the
//! simulator each cycle, runs the decision loop, and prints a summary.

use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;

use adbandit_connectors::{SimArmProfile, SimPlatform};
use adbandit_engine::{run_cycle, CampaignRuntime, CycleOutcome, Engine};
use adbandit_ingest::PlatformPoller;
use adbandit_models::{Arm, Campaign, CampaignStatus, EngineConfig, PrimaryKpi};
use adbandit_store::PosteriorStore;

pub async fn run(cycles: u64, budget: f64, seed: u64) -> anyhow::Result<()> {
    let cfg = EngineConfig::default();
    let store = Arc::new(PosteriorStore::open_in_memory()?);

    let campaign = Campaign {
        id: 0,
        name: "simulated_campaign".into(),
        total_budget: budget,
        start: Utc::now(),
        end: None,
        status: CampaignStatus::Active,
        primary_kpi: PrimaryKpi::Roas,
        risk_tolerance: cfg.risk_tolerance_default,
        variance_limit: cfg.variance_limit_default,
        cadence_ms: cfg.cycle_default_ms,
    };
    let cid = store.create_campaign(&campaign)?;

    // Three creatives with distinct funnels; the optimizer should find A.
    let profiles = [
        ("Creative A", SimArmProfile { ctr: 0.08, cvr: 0.15, revenue_per_conversion: 15.0, cost_per_click: 0.8 }),
        ("Creative B", SimArmProfile { ctr: 0.05, cvr: 0.10, revenue_per_conversion: 10.0, cost_per_click: 1.0 }),
        ("Creative C", SimArmProfile { ctr: 0.02, cvr: 0.04, revenue_per_conversion: 8.0, cost_per_click: 1.4 }),
    ];
    let mut platform = SimPlatform::new("sim", seed, 30_000);
    let mut arm_ids = Vec::new();
    for (creative, profile) in &profiles {
        let arm = Arm::new(cid, "sim", "Search", *creative, 1.0);
        platform = platform.with_profile(arm.arm_key(), *profile);
        arm_ids.push((store.add_arm(&arm)?, *creative));
    }
    let platform = Arc::new(platform);

    let mut engine = Engine::new(cfg, store.clone());
    engine.register_platform(platform.clone());

    let poller = PlatformPoller::new(
        platform,
        engine.ingestor.clone(),
        100.0,
        StdDuration::from_secs(30),
        "sim-account",
    );

    let arms = store.arms_for_campaign(cid)?;
    let bindings = engine.bindings_for(arms.iter(), "sim");
    let mut rt = CampaignRuntime::new(cid, engine.cfg.mmm.clone());
    let mut window = Utc::now();

    println!("Running {cycles} simulated cycles (budget ${budget:.0})...");
    for cycle in 0..cycles {
        poller.poll_once(cid, &bindings, window).await?;
        window = window + Duration::minutes(15);
        match run_cycle(&engine, &mut rt).await {
            Ok(CycleOutcome::Completed) => {
                info!(cycle, "budget exhausted");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(cycle, error = %e, "cycle failed");
                break;
            }
        }
    }

    // Summary.
    let state = store.load_campaign(cid)?;
    println!("\n=== Simulation Summary ===");
    println!("Campaign: {}", state.campaign.name);
    println!("Status:   {}", state.campaign.status);
    println!("Spend:    ${:.2} of ${:.2}", state.spend_total(), budget);
    println!();
    let mut rows: Vec<_> = arm_ids
        .iter()
        .map(|(id, creative)| {
            let alloc = rt.prev_alloc().get(id).copied().unwrap_or(0.0);
            let (mean, trials) = state
                .posteriors
                .get(id)
                .map(|p| (p.mean_reward(), p.trials))
                .unwrap_or((0.0, 0));
            (*creative, alloc, mean, trials)
        })
        .collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (creative, alloc, mean_roas, trials) in rows {
        println!(
            "  {creative:<12} alloc {:>5.1}%  mean ROAS {mean_roas:>6.2}  trials {trials}",
            alloc * 100.0
        );
    }
    Ok(())
}
