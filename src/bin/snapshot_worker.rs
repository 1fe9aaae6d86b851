//! Validation and final arbitrage stage.
//!
//! For each match: quick budgeted simulation on the embedded snapshots, then
//! the verdict gate (cache hit SAFE passes, UNSAFE drops, miss asks the LLM
//! and caches the answer), then a fresh re-fetch of both markets and a final
//! simulation whose result is persisted. Validator errors drop the pair for
//! this event without caching, so the next arrival retries.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use arb_pipeline::arb::{self, DustThresholds, SimConfig, EPSILON};
use arb_pipeline::cache::{RedisVerdictCache, VerdictCache};
use arb_pipeline::config::{env_bool, env_f64, env_string, env_u64, env_usize, CacheConfig};
use arb_pipeline::hash::verdict_cache_key;
use arb_pipeline::kalshi::{KalshiClient, KalshiConfig};
use arb_pipeline::llm::{LlmClient, LlmConfig};
use arb_pipeline::matches::{FreshSnapshots, MatchPayload, ResolutionVerdict};
use arb_pipeline::polymarket::{PolymarketClient, PolymarketConfig};
use arb_pipeline::storage::StorageChannel;
use arb_pipeline::types::Venue;
use arb_pipeline::validator::{PdfExtractor, ValidatorService};
use arb_pipeline::{queue, storage, workers};

struct WorkerDeps {
    validator: ValidatorService,
    pm_client: PolymarketClient,
    kx_client: KalshiClient,
    verdict_cache: Option<Arc<dyn VerdictCache>>,
    store: StorageChannel,
    quick_cfg: SimConfig,
    final_cfg: SimConfig,
    bypass_llm: bool,
    fresh_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arb_pipeline=info".parse().unwrap()),
        )
        .init();

    let shutdown = workers::shutdown_signal();

    let brokers = queue::brokers();
    let topic = queue::topic_from_env("MATCHES_KAFKA_TOPIC", queue::DEFAULT_MATCH_TOPIC);
    let group = env_string("SNAPSHOT_WORKER_GROUP", "snapshot-worker");
    let worker_count = env_usize("SNAPSHOT_WORKER_CONCURRENCY", 1);
    let budget = env_f64("SNAPSHOT_WORKER_BUDGET_USD", 100.0);
    let final_budget = env_f64("FINAL_BUDGET_USD", budget);

    queue::wait_for_broker(&brokers, Duration::from_secs(45))
        .await
        .context("[snapshot-worker] wait for broker")?;
    if let Err(err) = queue::ensure_topic(&brokers, &topic).await {
        warn!("[snapshot-worker] ensure topic warning: {err:#}");
    }

    let llm = LlmClient::new(LlmConfig::from_env()?)?;
    let pdf = match PdfExtractor::new() {
        Ok(extractor) => Some(extractor),
        Err(err) => {
            warn!("[snapshot-worker] pdf extractor unavailable: {err:#}");
            None
        }
    };
    let validator = ValidatorService::new(
        llm,
        pdf,
        std::env::var("VALIDATOR_SYSTEM_PROMPT").ok(),
    );

    let verdict_cache: Option<Arc<dyn VerdictCache>> = match CacheConfig::from_env() {
        Some(cache_cfg) => Some(Arc::new(
            RedisVerdictCache::connect(&cache_cfg)
                .await
                .context("[snapshot-worker] verdict cache")?,
        )),
        None => {
            warn!("[snapshot-worker] verdict cache disabled, every pair re-validates");
            None
        }
    };

    let store = storage::create_storage_channel(&env_string("SQLITE_PATH", "data/arb.db"));
    let dust = DustThresholds::from_env();

    let deps = Arc::new(WorkerDeps {
        validator,
        pm_client: PolymarketClient::new(PolymarketConfig::default())?,
        kx_client: KalshiClient::new(KalshiConfig::default())?,
        verdict_cache,
        store: store.clone(),
        quick_cfg: SimConfig {
            budget_usd: budget,
            force_verdict: env_bool("SNAPSHOT_WORKER_FORCE_VALIDATION", false),
            dust,
        },
        final_cfg: SimConfig {
            budget_usd: final_budget,
            force_verdict: false,
            dust,
        },
        bypass_llm: env_bool("SNAPSHOT_WORKER_BYPASS_LLM", false),
        fresh_timeout: Duration::from_secs(env_u64("FRESH_FETCH_TIMEOUT_SECONDS", 15)),
    });

    info!(
        "[snapshot-worker] consuming {topic} with group {group} ({worker_count} workers, budget={budget:.2})"
    );
    workers::run::<MatchPayload, _, _>(
        shutdown,
        &brokers,
        &topic,
        &group,
        worker_count,
        move |payload: MatchPayload| {
            let deps = deps.clone();
            async move {
                handle_match(&deps, payload).await;
                Ok(())
            }
        },
    )
    .await;

    store.shutdown();
    Ok(())
}

async fn handle_match(deps: &WorkerDeps, mut payload: MatchPayload) {
    // Matcher-attached cached SAFE verdicts are authoritative: skip straight
    // to the final stage.
    if payload.cached_verdict
        && payload
            .resolution_verdict
            .as_ref()
            .is_some_and(|verdict| verdict.valid_resolution)
    {
        info!("[snapshot-worker] pair={} using cached SAFE verdict", payload.pair_id);
        log_llm_result(&payload);
        append_json_log("validator.log", &payload);
        if let Err(err) = run_final_stage(deps, &mut payload).await {
            error!("[snapshot-worker] final stage error pair={}: {err:#}", payload.pair_id);
        }
        return;
    }

    // Quick pass over the snapshots embedded in the payload.
    let result = arb::evaluate(&payload, &deps.quick_cfg);
    if result.untradable {
        info!(
            "[snapshot-worker] pair={} skipped (untradable: {})",
            payload.pair_id, result.reason
        );
        return;
    }
    let profitable = result
        .best
        .as_ref()
        .map(|best| best.profit_usd > EPSILON && best.quantity > EPSILON)
        .unwrap_or(false);
    if !profitable {
        info!(
            "[snapshot-worker] pair={} skipped (no profitable direction)",
            payload.pair_id
        );
        return;
    }
    payload.arbitrage = result.best.clone();

    // Verdict gate.
    let verdict_key = verdict_cache_key(&payload.source, &payload.target);
    let cached = match &deps.verdict_cache {
        Some(cache) => match cache.get(&verdict_key).await {
            Ok(cached) => cached,
            Err(err) => {
                error!("[verdict-cache] get error key={verdict_key}: {err:#}");
                None
            }
        },
        None => None,
    };

    let verdict = match cached {
        Some(true) => ResolutionVerdict::new(true, "cached"),
        Some(false) => {
            info!(
                "[snapshot-worker] pair={} dropped (cached UNSAFE verdict)",
                payload.pair_id
            );
            return;
        }
        None => {
            let verdict = if deps.bypass_llm {
                ResolutionVerdict::new(true, "bypassed via SNAPSHOT_WORKER_BYPASS_LLM")
            } else {
                match deps.validator.validate(&payload).await {
                    Ok(verdict) => verdict,
                    Err(err) => {
                        // reported, dropped, never cached: the next arrival retries
                        error!(
                            "[snapshot-worker] validator error pair={}: {err:#}",
                            payload.pair_id
                        );
                        return;
                    }
                }
            };
            if let Some(cache) = &deps.verdict_cache {
                match cache.set(&verdict_key, verdict.valid_resolution).await {
                    Ok(()) => info!(
                        "[verdict-cache] stored key={verdict_key} valid={}",
                        verdict.valid_resolution
                    ),
                    Err(err) => error!("[verdict-cache] set error key={verdict_key}: {err:#}"),
                }
            }
            verdict
        }
    };

    payload.resolution_verdict = Some(verdict.clone());
    log_llm_result(&payload);
    append_json_log("validator.log", &payload);

    if verdict.valid_resolution {
        if let Err(err) = run_final_stage(deps, &mut payload).await {
            error!("[snapshot-worker] final stage error pair={}: {err:#}", payload.pair_id);
        }
    }
}

/// Fetches one fresh snapshot from each venue, re-runs the simulator with the
/// final budget, and persists the outcome.
async fn run_final_stage(deps: &WorkerDeps, payload: &mut MatchPayload) -> Result<()> {
    let pm_ref = payload
        .snapshot_for(Venue::Polymarket)
        .context("missing polymarket snapshot")?;
    let kx_ref = payload
        .snapshot_for(Venue::Kalshi)
        .context("missing kalshi snapshot")?;
    let (pm_event, pm_market) = (pm_ref.event.event_id.clone(), pm_ref.market.market_id.clone());
    let (kx_event, kx_market) = (kx_ref.event.event_id.clone(), kx_ref.market.market_id.clone());

    let (fresh_pm, fresh_kx) = tokio::time::timeout(deps.fresh_timeout, async {
        let pm = deps
            .pm_client
            .market_snapshot(&pm_event, &pm_market)
            .await
            .context("refresh polymarket")?;
        let kx = deps
            .kx_client
            .market_snapshot(&kx_event, &kx_market)
            .await
            .context("refresh kalshi")?;
        anyhow::Ok((pm, kx))
    })
    .await
    .context("fresh fetch deadline")??;

    payload.fresh = Some(FreshSnapshots {
        polymarket: Some(fresh_pm.clone()),
        kalshi: Some(fresh_kx.clone()),
    });

    let fresh_payload = MatchPayload::new(fresh_pm, fresh_kx, payload.similarity, payload.distance);
    let result = arb::evaluate(&fresh_payload, &deps.final_cfg);
    payload.final_opportunity = result.best.clone();

    match &result.best {
        Some(best) => {
            deps.store.record_opportunity(payload, &result);
            info!(
                "[snapshot-worker] final pair={} dir={} qty={:.2} profit={:.4}",
                payload.pair_id, best.direction, best.quantity, best.profit_usd
            );
        }
        None => info!(
            "[snapshot-worker] final pair={} no profitable direction after refresh",
            payload.pair_id
        ),
    }
    append_json_log("final_arb.log", payload);
    Ok(())
}

fn log_llm_result(payload: &MatchPayload) {
    let Some(verdict) = &payload.resolution_verdict else {
        return;
    };
    let pm = question_for(payload, Venue::Polymarket);
    let kx = question_for(payload, Venue::Kalshi);
    info!(
        "[snapshot-worker] LLM pair={} polymarket=\"{pm}\" kalshi=\"{kx}\" valid={} reason={}",
        payload.pair_id, verdict.valid_resolution, verdict.resolution_reason
    );
}

fn question_for(payload: &MatchPayload, venue: Venue) -> String {
    payload
        .snapshot_for(venue)
        .map(|snap| {
            if snap.market.question.is_empty() {
                snap.event.title.clone()
            } else {
                snap.market.question.clone()
            }
        })
        .unwrap_or_default()
}

/// Appends a structured entry to one of the stage's JSON logs.
fn append_json_log(path: &str, payload: &MatchPayload) {
    let entry = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "payload": payload,
    });
    let line = match serde_json::to_string(&entry) {
        Ok(line) => line,
        Err(err) => {
            error!("[snapshot-worker] log marshal error: {err}");
            return;
        }
    };
    match OpenOptions::new().append(true).create(true).open(path) {
        Ok(mut file) => {
            if let Err(err) = writeln!(file, "{line}") {
                error!("[snapshot-worker] log write error ({path}): {err}");
            }
        }
        Err(err) => error!("[snapshot-worker] log open error ({path}): {err}"),
    }
}
