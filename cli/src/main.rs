//! Synapse CLI: command-line driver for the consensus and network-state core.
//!
//! Single-process simulation with in-memory state and, when configured, a
//! filesystem archive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use synapse_chain::archive::{open_archive, MemoryStateBackend, StateBackend};
use synapse_chain::block::{aggregated_state_root, Block, BlockBody, BlockHeader};
use synapse_chain::config::ChainConfig;
use synapse_chain::consensus::ranked;
use synapse_chain::emission::{Pool, SupplyLedger};
use synapse_chain::fork_choice::ForkChoiceTracker;
use synapse_chain::proof::CommitmentVerifier;
use synapse_chain::registry::ValidatorRegistry;
use synapse_chain::round::{ConsensusRoundOrchestrator, RoundRequest};
use synapse_chain::selection::{derive_epoch_seed, select_validator, RegistrySnapshot, SelectionEngine};
use synapse_chain::submission::ScoreSubmission;
use synapse_chain::tasks::{AIResultValidator, AITask, TaskId, TaskStatus};
use synapse_chain::types::{current_timestamp, Address, Hash, Hashable, Keypair, SubnetId, Uid};
use synapse_chain::weight_matrix::WeightMatrixStore;
use synapse_chain::worker::RoundScheduler;

/// Subnet the demo runs its consensus round on.
const DEMO_SUBNET: SubnetId = SubnetId(1);
/// Slots produced per demo epoch.
const DEMO_SLOTS: u64 = 10;

#[derive(Parser)]
#[command(name = "synapse")]
#[command(about = "Synapse consensus core: stake selection, fork choice and subnet rounds")]
#[command(version)]
struct Cli {
    /// Chain configuration (TOML). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Destination of the generated file
        #[arg(long, default_value = "synapse.toml")]
        output: PathBuf,
    },
    /// Run deterministic proposer selection on a demo registry
    Select {
        #[arg(long)]
        seed: u64,
        #[arg(long)]
        slot: u64,
    },
    /// Run one full epoch: block production, finality, AI tasks and a consensus round
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ChainConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChainConfig::default(),
    };

    match cli.command {
        Commands::Init { output } => cmd_init(&config, &output),
        Commands::Select { seed, slot } => cmd_select(seed, slot),
        Commands::Demo => cmd_demo(config).await,
    }
}

fn cmd_init(config: &ChainConfig, output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    config.save(output)?;
    println!("Wrote configuration to {}", output.display());
    println!("\nRun `synapse --config {} demo` to use it.", output.display());
    Ok(())
}

fn cmd_select(seed: u64, slot: u64) -> anyhow::Result<()> {
    let snapshot = RegistrySnapshot::new(demo_stakes());
    let proposer = select_validator(&snapshot, seed, slot)?;

    println!("=== Proposer Selection ===\n");
    println!("  Epoch seed:  {seed}");
    println!("  Slot:        {slot}");
    println!("  Snapshot:    {}", snapshot.hash());
    println!("  Total stake: {}", snapshot.total_stake());
    for (address, stake) in snapshot.entries() {
        let marker = if *address == proposer { "  <- selected" } else { "" };
        println!("    {address}  stake {stake:>5}{marker}");
    }
    Ok(())
}

/// Fixed registry used by `select`, so results can be reproduced anywhere.
fn demo_stakes() -> Vec<(Address, u64)> {
    (1..=5u8)
        .map(|i| (Address::from_bytes([i; 32]), u64::from(i) * 100))
        .collect()
}

async fn cmd_demo(config: ChainConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("=== Synapse Epoch Demo ===\n");

    // --- Registry and genesis ---
    let validators: Vec<Keypair> = (1..=5u8).map(|i| Keypair::from_seed([i; 32])).collect();
    let registry = Arc::new(RwLock::new(ValidatorRegistry::with_validators(
        config.registry.clone(),
        validators
            .iter()
            .enumerate()
            .map(|(i, kp)| (kp.address(), 1_000 + 250 * i as u64)),
    )?));
    let genesis = Block::genesis(validators[0].address(), current_timestamp());
    let fork_choice = Arc::new(RwLock::new(ForkChoiceTracker::new(
        config.fork_choice.clone(),
        &genesis.header,
    )));
    println!("[Genesis] {} validators, genesis {}", validators.len(), genesis.block_hash());

    // --- Block production ---
    let seed = derive_epoch_seed(0, &genesis.block_hash());
    let engine = SelectionEngine::new(registry.clone());
    let mut head = genesis.header.clone();
    println!("\n[Slots 1-{DEMO_SLOTS}] Producing blocks (seed {seed})...");
    for slot in 1..=DEMO_SLOTS {
        let proposer = engine.select_for_slot(seed, slot)?;
        let block = next_block(&head, slot, proposer.clone(), BlockBody::empty());
        fork_choice.write().add_block(&block.header, &registry.read())?;
        registry.write().record_block_produced(slot, &proposer)?;
        head = block.header;
    }
    let (finalized, pruned) = {
        let mut tracker = fork_choice.write();
        let finalized = tracker.try_finalize(&registry.read());
        (finalized, tracker.prune_orphaned())
    };
    {
        let tracker = fork_choice.read();
        println!("  Canonical head:   {} (height {})", tracker.canonical_head(), head.height);
        match finalized {
            Some(hash) => println!("  Finalized:        {hash} (height {})", tracker.finalized_height()),
            None => println!("  Finalized:        nothing new"),
        }
        if pruned > 0 {
            println!("  Orphans pruned:   {pruned}");
        }
    }

    // --- AI tasks ---
    println!("\n[Tasks] Verifying AI results...");
    let prover = CommitmentVerifier::new(CommitmentVerifier::generate_key());
    let tasks = Arc::new(RwLock::new(AIResultValidator::new(
        config.tasks.clone(),
        Arc::new(prover.clone()),
    )));
    {
        let mut tasks = tasks.write();
        tasks.sweep_expired(1);
        for (n, difficulty) in [(1u64, 90u32), (2, 60), (3, 30)] {
            let input = Hash::compute(format!("prompt-{n}").as_bytes());
            tasks.submit_task(AITask::new(TaskId(n), DEMO_SUBNET, difficulty, input))?;
            tasks.assign(&TaskId(n), Uid(n as u32))?;

            let payload = format!("completion-{n}").into_bytes();
            let task = tasks
                .task(&TaskId(n))
                .context("task vanished after assignment")?;
            // Task 3's worker sends a proof for a different payload.
            let proof = if n == 3 {
                prover.prove(&task.public_inputs(b"forged"))
            } else {
                prover.prove(&task.public_inputs(&payload))
            };
            let submitter = validators[n as usize % validators.len()].address();
            let status = tasks.submit_result(&TaskId(n), &submitter, payload, proof)?;
            println!("  {}: difficulty {difficulty:>3} -> {status}", TaskId(n));
        }
        println!(
            "  Verified: {}  Rejected: {}",
            tasks.count_with_status(TaskStatus::Verified),
            tasks.count_with_status(TaskStatus::Rejected)
        );
    }

    // --- Score submissions, carried by the next block ---
    let now = current_timestamp();
    let submissions: Vec<ScoreSubmission> = validators
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            // Validator 4 tries to push everything onto uid 3.
            let scores: BTreeMap<Uid, f64> = if i == 4 {
                BTreeMap::from([(Uid(3), 1.0)])
            } else {
                BTreeMap::from([(Uid(1), 5.0), (Uid(2), 3.0 + i as f64 * 0.1), (Uid(3), 1.0)])
            };
            let mut submission = ScoreSubmission::new(DEMO_SUBNET, 1, kp.address(), scores, now);
            submission.sign(kp);
            submission
        })
        .collect();

    let carrier_slot = DEMO_SLOTS + 1;
    let proposer = engine.select_for_slot(seed, carrier_slot)?;
    let carrier = next_block(
        &head,
        carrier_slot,
        proposer.clone(),
        BlockBody {
            score_submissions: submissions.clone(),
        },
    );
    let anchor = fork_choice.write().add_block(&carrier.header, &registry.read())?;
    registry.write().record_block_produced(carrier_slot, &proposer)?;
    println!(
        "\n[Slot {carrier_slot}] Block {anchor} carries {} score submissions",
        carrier.body.len()
    );

    // --- Consensus round ---
    let archive = open_archive(&config.storage)?;
    let backend = Arc::new(MemoryStateBackend::new());
    let store = Arc::new(WeightMatrixStore::new(
        archive,
        backend.clone(),
        config.storage.cache_capacity,
    ));
    let supply = Arc::new(SupplyLedger::recover(
        config.emission.max_supply,
        backend.as_ref(),
        &[DEMO_SUBNET],
    )?);
    let orchestrator =
        ConsensusRoundOrchestrator::new(DEMO_SUBNET, config.clone(), store.clone(), backend.clone())?
            .with_tasks(tasks.clone())
            .with_fork_choice(fork_choice.clone())
            .with_supply(supply.clone());

    let mut scheduler = RoundScheduler::new(config.retry.clone());
    scheduler.add_subnet(orchestrator)?;
    let stakes = registry.read().active_stakes();
    let request = RoundRequest::new(DEMO_SUBNET, submissions, stakes)
        .with_anchor(anchor)
        .at(now);
    let outcome = scheduler.submit(request).await?;
    scheduler.shutdown().await;

    let datum = &outcome.datum;
    println!("\n=== Committed {} epoch {} ===", datum.subnet_id, datum.epoch);
    println!("  Weight matrix root:    {}", datum.weight_matrix_hash);
    println!("  Weight matrix archive: {}", datum.weight_matrix_archive_ref);
    println!("  Consensus scores root: {}", datum.consensus_scores_root);
    println!("  Emission root:         {}", datum.emission_schedule_root);
    println!("  Emission archive:      {}", datum.emission_schedule_archive_ref);
    println!("  Datum hash:            {}", datum.hash());

    println!("\n  Consensus scores:");
    for (uid, score) in ranked(&outcome.consensus_scores) {
        println!("    {uid}: {score:.4}");
    }

    let schedule = &outcome.schedule;
    println!(
        "\n  Utility {:.3}, budget {}, paid {} (miners {}, validators {}, dao {})",
        datum.metrics.utility_score,
        schedule.budget,
        schedule.total_paid(),
        schedule.paid_from(Pool::Miner),
        schedule.paid_from(Pool::Validator),
        schedule.paid_from(Pool::Dao),
    );
    println!("  Balance events: {}", outcome.balance_deltas.len());
    println!("  Supply minted {} of {}", supply.minted(), supply.max_supply());

    // Cold read: archive + on-chain datum only.
    store.evict(DEMO_SUBNET, datum.epoch);
    let entries = store.get(DEMO_SUBNET, datum.epoch)?;
    println!("  Re-fetched {} matrix entries, root verified", entries.len());

    // --- Epoch close ---
    let report = registry.write().process_epoch_end();
    println!("\n=== Epoch {} closed ===", report.closed_epoch);
    for (address, reward) in &report.rewards {
        println!("  {address}  block reward {reward}");
    }
    if !report.jailed.is_empty() {
        println!("  Jailed: {}", report.jailed.len());
    }
    let committed: Vec<Hash> = backend.all().iter().map(Hashable::hash).collect();
    println!("  Aggregated state root: {}", aggregated_state_root(&committed));
    if let Some(latest) = backend.latest(DEMO_SUBNET)? {
        info!(epoch = latest.epoch, "demo finished");
    }
    Ok(())
}

fn next_block(parent: &BlockHeader, slot: u64, proposer: Address, body: BlockBody) -> Block {
    Block::new(
        parent.hash(),
        parent.height + 1,
        0,
        slot,
        current_timestamp(),
        proposer,
        body,
        Hash::zero(),
    )
}
