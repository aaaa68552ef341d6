//! Setlist simulator (setlist-sim) - Main entry point
//!
//! Runs several composers against one in-memory store, drives them with a
//! seeded stream of random edits, and checks that every client converges on
//! the store's order. Completes the service at the end and prints the
//! resulting song availability.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use setlist_common::config::ComposerConfig;
use setlist_common::models::OverridesPatch;
use setlist_common::{time, ClientId, EntryId, ServiceId, SongId, TenantId, UserId};
use setlist_compose::authz::Role;
use setlist_compose::identity::StaticIdentity;
use setlist_compose::store::{InMemoryStore, StoreLink};
use setlist_compose::usage::UsageLedger;
use setlist_compose::{Composer, Dispatcher, DispatcherHandle, EntryView, Notice};

const KEYS: [&str; 6] = ["C", "D", "E", "F", "G", "A"];

/// Command-line arguments for setlist-sim
#[derive(Parser, Debug)]
#[command(name = "setlist-sim")]
#[command(about = "Concurrent setlist editing simulator")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent clients
    #[arg(long, default_value = "3", env = "SETLIST_SIM_CLIENTS")]
    clients: usize,

    /// Number of random edits across all clients
    #[arg(long, default_value = "60", env = "SETLIST_SIM_OPS")]
    ops: usize,

    /// Random seed
    #[arg(long, default_value = "7", env = "SETLIST_SIM_SEED")]
    seed: u64,

    /// Maximum wait for clients to settle, in milliseconds
    #[arg(long, default_value = "5000")]
    settle_ms: u64,

    /// Maximum simulated store latency, in milliseconds
    #[arg(long, default_value = "15")]
    latency_ms: u64,

    /// Print the final state as JSON instead of text
    #[arg(long)]
    json: bool,
}

/// Final state of one client, for the JSON report
#[derive(Serialize)]
struct ClientReport {
    client: ClientId,
    pending: usize,
    notices: Vec<Notice>,
    entries: Vec<EntryView>,
}

struct SimClient {
    composer: Composer,
    link: StoreLink,
    dispatcher: DispatcherHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "setlist_sim=info,setlist_compose=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.clients == 0 {
        bail!("At least one client is required");
    }

    let config = ComposerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(
        clients = args.clients,
        ops = args.ops,
        seed = args.seed,
        "Starting setlist simulation"
    );

    let store = Arc::new(InMemoryStore::new(config.sync.event_channel_capacity));
    let tenant = TenantId::new();
    let service = store.create_service(tenant, "Simulated service", time::now() + ChronoDuration::days(3));
    let ledger = Arc::new(Mutex::new(UsageLedger::new()));
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut clients = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let user = UserId::new();
        store.grant(user, tenant, Role::Leader);
        let identity = StaticIdentity::new(user).with_role(tenant, Role::Leader);
        let link = store.link();
        if args.latency_ms > 0 {
            link.set_latency(Duration::from_millis(rng.gen_range(0..=args.latency_ms)));
        }

        let composer = Composer::connect(&identity, &link, &service, ClientId::new(), &config)
            .await
            .context("Failed to connect composer")?
            .with_ledger(Arc::clone(&ledger));
        let dispatcher = Dispatcher::start(
            composer.clone(),
            Arc::new(link.clone()),
            config.sync.clone(),
        )
        .await
        .context("Failed to start dispatcher")?;
        clients.push(SimClient {
            composer,
            link,
            dispatcher,
        });
    }

    let catalog: Vec<SongId> = (0..12).map(|_| SongId::new()).collect();
    for op in 0..args.ops {
        let client = &clients[rng.gen_range(0..clients.len())];
        if let Err(e) = random_edit(&mut rng, &client.composer, &catalog) {
            debug!(op, error = %e, "Edit rejected");
        }
        if rng.gen_bool(0.3) {
            tokio::time::sleep(Duration::from_millis(rng.gen_range(1..=5))).await;
        }
    }

    let converged = settle(&clients, &store, service.id, Duration::from_millis(args.settle_ms)).await;

    if args.json {
        let report: Vec<ClientReport> = clients
            .iter()
            .map(|c| ClientReport {
                client: c.composer.client_id(),
                pending: c.composer.pending_count(),
                notices: c.composer.notices(),
                entries: c.composer.ordered_entries(),
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_summary(&clients, &store, service.id);
    }

    if converged {
        let leader = &clients[0];
        leader
            .composer
            .complete_service(&leader.link, time::now())
            .await
            .context("Failed to complete service")?;
        let now = time::now();
        if !args.json {
            for song in &catalog {
                println!("song {}: {}", song, leader.composer.availability_for(*song, now));
            }
        }
    }

    for client in clients {
        client.dispatcher.stop().await;
    }

    if !converged {
        bail!("Clients did not converge on the store's order");
    }
    info!("All clients converged");
    Ok(())
}

fn print_summary(clients: &[SimClient], store: &InMemoryStore, service_id: ServiceId) {
    println!("store: {} entries", store.entries(service_id).len());
    for (i, client) in clients.iter().enumerate() {
        let entries = client.composer.ordered_entries();
        println!(
            "client {}: {} entries, {} pending, {} notices",
            i,
            entries.len(),
            client.composer.pending_count(),
            client.composer.notices().len()
        );
        for entry in &entries {
            println!(
                "  {} song={} key={}",
                entry.position,
                entry.song_id,
                entry.overrides.key.as_deref().unwrap_or("-")
            );
        }
    }
}

/// Propose one random add, move, remove, or edit
fn random_edit(rng: &mut StdRng, composer: &Composer, catalog: &[SongId]) -> setlist_compose::Result<()> {
    let entries = composer.ordered_entries();
    let pick = |rng: &mut StdRng| entries.get(rng.gen_range(0..entries.len().max(1))).map(|e| e.id);
    let roll = rng.gen_range(0..100);

    if entries.is_empty() || roll < 40 {
        let song = catalog[rng.gen_range(0..catalog.len())];
        let after = if rng.gen_bool(0.2) { None } else { pick(rng) };
        composer.propose_add(song, after)?;
    } else if roll < 70 {
        if let Some(entry) = pick(rng) {
            let after = if rng.gen_bool(0.25) { None } else { pick(rng) };
            if after != Some(entry) {
                composer.propose_move(entry, after)?;
            }
        }
    } else if roll < 85 {
        if let Some(entry) = pick(rng) {
            composer.propose_remove(entry)?;
        }
    } else if let Some(entry) = pick(rng) {
        let key = KEYS[rng.gen_range(0..KEYS.len())].to_string();
        composer.propose_edit(
            entry,
            OverridesPatch {
                key: Some(Some(key)),
                ..Default::default()
            },
        )?;
    }
    Ok(())
}

/// Wait until every client has no pending work and matches the store
async fn settle(
    clients: &[SimClient],
    store: &InMemoryStore,
    service_id: ServiceId,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let canonical: Vec<EntryId> = store.entries(service_id).iter().map(|e| e.id).collect();
        let settled = clients.iter().all(|c| {
            c.composer.pending_count() == 0
                && c.composer
                    .ordered_entries()
                    .iter()
                    .map(|e| e.id)
                    .eq(canonical.iter().copied())
        });
        if settled {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Clients did not settle in time");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
