#![deny(warnings)]

//! Headless CLI: runs a deterministic mining session against the in-memory
//! store and prints the resulting account position.

use anyhow::Result;
use chrono::{Duration, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rim_core::{parse_referral_token, ItemCatalog, ItemId, TierTable, UserId};
use rim_econ::{EconParams, EconomyEngine, TierPolicy};
use rim_session::{sample_rig_telemetry, SessionController};
use rim_store::MemoryStore;
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

struct Args {
    ticks: u32,
    seed: u64,
    grant: u32,
    policy: TierPolicy,
    referral: Option<String>,
    buy: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = Args {
        ticks: 12,
        seed: 42,
        grant: 0,
        policy: TierPolicy::OwnershipGated,
        referral: None,
        buy: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--ticks" => args.ticks = it.next().and_then(|s| s.parse().ok()).unwrap_or(args.ticks),
            "--seed" => args.seed = it.next().and_then(|s| s.parse().ok()).unwrap_or(args.seed),
            "--grant" => args.grant = it.next().and_then(|s| s.parse().ok()).unwrap_or(args.grant),
            "--policy" => {
                args.policy = match it.next().as_deref() {
                    Some("balance") => TierPolicy::BalanceGated,
                    _ => TierPolicy::OwnershipGated,
                }
            }
            "--ref" => args.referral = it.next(),
            "--buy" => {
                if let Some(id) = it.next() {
                    args.buy.push(id);
                }
            }
            _ => {}
        }
    }
    args
}

const TICK_SECS: i64 = 5;
const FLUSH_EVERY: u32 = 6;

fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args();
    let referred_by = args.referral.as_deref().and_then(parse_referral_token);
    info!(
        ticks = args.ticks,
        seed = args.seed,
        policy = ?args.policy,
        ?referred_by,
        build = env!("GIT_SHA"),
        "starting session"
    );

    let store = MemoryStore::new();
    let engine = EconomyEngine::new(TierTable::standard(), args.policy, EconParams::default())?;
    let catalog = ItemCatalog::standard();
    let mut now = Utc::now();
    let mut session = SessionController::load(
        &store,
        UserId(1),
        Decimal::from(args.grant),
        referred_by,
        engine,
        args.seed,
        now,
    )?;

    for id in &args.buy {
        let Some(item) = catalog.get(&ItemId(id.clone())) else {
            warn!(item = %id, "unknown catalog item, skipping");
            continue;
        };
        if let Err(err) = session.purchase(&store, item, now) {
            warn!(item = %id, %err, "purchase rejected");
        }
    }

    match session.toggle(now) {
        Ok(state) => info!(?state, "uplink initialized"),
        Err(err) => warn!(%err, "cannot start earning"),
    }

    let mut telemetry_rng = ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(1));
    let mut earned = Decimal::ZERO;
    for i in 0..args.ticks {
        now = now + Duration::seconds(TICK_SECS);
        earned += session.tick(now, TICK_SECS)?;
        if (i + 1) % FLUSH_EVERY == 0 {
            session.flush(&store);
            session.reconcile(&store);
        }
        let telemetry = sample_rig_telemetry(&mut telemetry_rng);
        info!(
            npu_load = telemetry.npu_load_pct,
            "> {}",
            telemetry.log_line
        );
    }
    session.flush(&store);

    let ctx = session.context(now);
    let tier = session
        .engine()
        .table()
        .get(ctx.tier_id)
        .map(|t| t.name.clone())
        .unwrap_or_default();
    println!(
        "Session OK | state: {:?} | tier: {} | multiplier: {:.2}x | referrals: {}",
        session.state(),
        tier,
        ctx.effective_multiplier,
        ctx.active_referrals
    );
    println!(
        "Balance | earned this run: {} RIM | total: {} RIM | locked: {}",
        earned,
        session.account().balance,
        ctx.is_locked
    );

    Ok(())
}
