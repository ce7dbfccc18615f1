// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - VALIDATOR BINARY
//
// Runs one validator against an in-process devnet: simulated chain with a
// block producer, sled object store, static peer lists and a handful of
// simulated miners publishing top-k gradients every window.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use anyhow::{anyhow, Result};
use clap::Parser;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tpl_core::{Hparams, Model, TopKCodec, Uid};
use tpl_network::{Neuron, WindowClock};
use tpl_node::devnet::{
    BigramModel, CheckpointCatchUp, SimulatedChain, SimulatedMiner, SledObjectStore,
    StaticPeerDirectory, SyntheticDataset,
};
use tpl_node::{Collaborators, Validator, ValidatorMetrics, ValidatorOptions};
use tracing_subscriber::EnvFilter;
use warp::Filter;

/// Windows of gradients kept in the devnet store
const RETAINED_WINDOWS: u64 = 20;

/// Checkpoints kept in the devnet checkpoint index
const RETAINED_CHECKPOINTS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "tpl-validator", about = "Templar window validator")]
struct NodeConfig {
    /// Subnet the validator serves
    #[arg(long, env = "TPL_NETUID", default_value = "3")]
    netuid: u16,

    /// Hotkey this validator is registered under
    #[arg(long, env = "TPL_HOTKEY", default_value = "validator")]
    hotkey: String,

    /// Hyperparameter file (TOML, or JSON by extension)
    #[arg(long, env = "TPL_HPARAMS")]
    hparams: Option<PathBuf>,

    /// Directory for the local object store
    #[arg(long, env = "TPL_DATA_DIR", default_value = "tpl-data")]
    data_dir: PathBuf,

    /// Fixed gather peer list, e.g. --peers 1,2,3
    #[arg(long, value_delimiter = ',')]
    peers: Option<Vec<Uid>>,

    /// Upload every window's gather result
    #[arg(long, default_value = "false")]
    store_gathers: bool,

    #[arg(long, default_value = "false")]
    debug: bool,

    #[arg(long, default_value = "false")]
    trace: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "TPL_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Number of simulated miners (uids 1..=n)
    #[arg(long, default_value = "4")]
    miners: u16,

    /// Vocabulary of the devnet model and dataset
    #[arg(long, default_value = "32")]
    vocab: usize,

    /// Milliseconds between simulated blocks
    #[arg(long, default_value = "1000")]
    block_time_ms: u64,

    /// Windows behind the chain before a checkpoint is adopted
    #[arg(long, default_value = "20")]
    catch_up_lag: u64,
}

impl NodeConfig {
    fn log_filter(&self) -> EnvFilter {
        if self.trace {
            EnvFilter::new("trace")
        } else if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
        }
    }

    fn load_hparams(&self) -> Result<Hparams> {
        let hparams = match &self.hparams {
            Some(path) => Hparams::load_from_file(path)
                .map_err(|e| anyhow!("cannot read {}: {}", path.display(), e))?
                .apply_env(),
            None => Hparams::load_from_env(),
        }
        .map_err(|e| anyhow!("bad TPL_* override: {}", e))?;
        hparams.validate().map_err(|e| anyhow!(e))?;
        Ok(hparams)
    }
}

fn with_state<T: Clone + Send>(
    state: T,
) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn spawn_metrics_server(metrics: Arc<ValidatorMetrics>, port: u16) -> tokio::task::JoinHandle<()> {
    let route = warp::path("metrics")
        .and(with_state(metrics))
        .map(|m: Arc<ValidatorMetrics>| match m.export() {
            Ok(output) => warp::reply::with_header(output, "Content-Type", "text/plain; version=0.0.4"),
            Err(e) => warp::reply::with_header(
                format!("# Error exporting metrics: {}", e),
                "Content-Type",
                "text/plain; version=0.0.4",
            ),
        });
    log::info!("Serving metrics on 0.0.0.0:{}/metrics", port);
    tokio::spawn(warp::serve(route).run(([0, 0, 0, 0], port)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = NodeConfig::parse();
    tracing_subscriber::fmt()
        .with_env_filter(cfg.log_filter())
        .init();

    let hparams = cfg.load_hparams()?;
    log::info!(
        "Starting validator {} on netuid {} ({} blocks per window, offset {})",
        cfg.hotkey,
        cfg.netuid,
        hparams.blocks_per_window,
        hparams.validator_offset
    );

    // ─────────────────────────────────────────────────────────────────
    // Devnet collaborators
    // ─────────────────────────────────────────────────────────────────

    let store = SledObjectStore::open(cfg.data_dir.join("store"))
        .map_err(|e| anyhow!("cannot open store at {}: {}", cfg.data_dir.display(), e))?;
    let store = Arc::new(store);

    let miner_uids: Vec<Uid> = (1..=cfg.miners).collect();
    let mut neurons = vec![Neuron {
        uid: 0,
        hotkey: cfg.hotkey.clone(),
        stake: 1_000.0,
    }];
    neurons.extend(miner_uids.iter().map(|&uid| Neuron {
        uid,
        hotkey: format!("miner-{}", uid),
        stake: 10.0,
    }));

    let chain = Arc::new(SimulatedChain::new(neurons, 0));
    let block_time = Duration::from_millis(cfg.block_time_ms);
    let producer = chain.spawn_producer(block_time);

    let clock = WindowClock::new(hparams.blocks_per_window, chain.block());
    let clock_task = clock.spawn(chain.clone(), Duration::from_secs(1));

    let dataset = Arc::new(SyntheticDataset::new(
        cfg.vocab,
        hparams.batch_size,
        hparams.sequence_length,
        2,
    ));
    let model = BigramModel::new(cfg.vocab);
    let codec = Arc::new(TopKCodec::for_parameters(model.parameters()));

    let mut miners: Vec<SimulatedMiner> = miner_uids
        .iter()
        .map(|&uid| {
            SimulatedMiner::new(
                uid,
                cfg.vocab,
                dataset.clone(),
                store.clone(),
                hparams.pages_per_window,
                hparams.topk_compression,
                hparams.learning_rate,
            )
        })
        .collect();

    let miner_clock = clock.clone();
    let miner_store = store.clone();
    let miner_task = tokio::spawn(async move {
        let mut last_window = None;
        loop {
            let window = miner_clock.current_window();
            if last_window != Some(window) {
                for miner in miners.iter_mut() {
                    if let Err(e) = miner.submit(window).await {
                        log::warn!("Miner {} failed in window {}: {}", miner.uid(), window, e);
                    }
                }
                if let Err(e) = miner_store.prune_before(window.saturating_sub(RETAINED_WINDOWS)) {
                    log::warn!("Store pruning failed: {}", e);
                }
                if let Err(e) = miner_store.prune_checkpoints(RETAINED_CHECKPOINTS) {
                    log::warn!("Checkpoint pruning failed: {}", e);
                }
                last_window = Some(window);
            }
            tokio::time::sleep(block_time).await;
        }
    });

    let metrics = ValidatorMetrics::new().map_err(|e| anyhow!("metrics registry: {}", e))?;
    let metrics_server = cfg
        .metrics_port
        .map(|port| spawn_metrics_server(metrics.clone(), port));

    let collab = Collaborators {
        chain: chain.clone(),
        store: store.clone(),
        directory: Arc::new(StaticPeerDirectory::new(miner_uids.clone(), miner_uids)),
        dataset,
        catch_up: Arc::new(CheckpointCatchUp::new((*store).clone(), cfg.catch_up_lag)),
        codec,
    };
    let options = ValidatorOptions {
        hotkey: cfg.hotkey.clone(),
        pinned_peers: cfg.peers.clone(),
        store_gathers: cfg.store_gathers,
    };

    // ─────────────────────────────────────────────────────────────────
    // Validator
    // ─────────────────────────────────────────────────────────────────

    let mut validator =
        Validator::new(hparams, options, collab, Box::new(model), clock, metrics).await?;
    validator.startup().await?;

    tokio::select! {
        _ = validator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl+C received, shutting down");
        }
    }

    validator.shutdown().await;
    miner_task.abort();
    clock_task.abort();
    producer.abort();
    if let Some(server) = metrics_server {
        server.abort();
    }
    Ok(())
}
