//! Runnable three-party demo: spins up P0, P1, and P2 on loopback TCP, each
//! on its own thread, and walks through the same scenario as the original
//! implementation's own end-to-end test (set-up, private/public construction,
//! share, reveal, and a linear and a product combination).
//!
//! Grounded in the teacher's `src/kmprt17/main.rs` (spawn one thread per
//! party, join, print the result) and `src/cli_utils.rs` (clap-derived args).

use anyhow::{Context, Result};
use clap::Parser;
use rtas::{AddressMap, Config, Engine, NdTensor, Party};

/// Run the three-party demo scenario locally over loopback TCP.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Base TCP port; P0/P1/P2 bind to base, base+1, base+2.
    #[arg(short = 'p', long, default_value_t = 4900)]
    port: u16,

    /// Standard deviation used for share and triple masks.
    #[arg(long, default_value_t = 5.0)]
    share_std: f64,

    /// Number of triples P2 batches per cache refill.
    #[arg(long, default_value_t = 8)]
    cached_triples: usize,
}

fn address_map(port: u16) -> Result<AddressMap> {
    AddressMap::new(vec![
        (format!("127.0.0.1:{port}"), Party::P0),
        (format!("127.0.0.1:{}", port + 1), Party::P1),
        (format!("127.0.0.1:{}", port + 2), Party::P2),
    ])
    .context("building address map")
}

/// The scenario one party runs. Returns whatever it revealed, so `main` can
/// print P2's view once every thread has finished.
fn run_party(map: AddressMap, party: Party, config: Config) -> Result<Option<NdTensor>> {
    let mut engine: Engine<NdTensor> =
        Engine::bind(map, party, config).with_context(|| format!("{party}: bind"))?;
    engine.connect().with_context(|| format!("{party}: connect"))?;
    engine.set_up().with_context(|| format!("{party}: set_up"))?;
    tracing::info!(%party, "connected and set up");

    let priv_p0 = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
    let private_p0 = engine
        .new_private(|| priv_p0.clone(), vec![Party::P0], Some(vec![3]))
        .with_context(|| format!("{party}: new_private(P0)"))?;

    let pub_p2 = NdTensor::from_shape_vec(&[3], vec![10.0, 20.0, 30.0]);
    let public_p2 = engine
        .new_public(|| pub_p2.clone(), Party::P2)
        .with_context(|| format!("{party}: new_public(P2)"))?;

    let to_share = NdTensor::from_shape_vec(&[3], vec![4.0, 5.0, 6.0]);
    let private_to_share = engine
        .new_private(|| to_share.clone(), vec![Party::P0], Some(vec![3]))
        .with_context(|| format!("{party}: new_private(to_share)"))?;
    let shared = engine.share(private_to_share).with_context(|| format!("{party}: share"))?;

    let revealed_priv = engine
        .reveal_to(&private_p0, Party::P2)
        .with_context(|| format!("{party}: reveal_to(private, P2)"))?;
    tracing::debug!(%party, ?revealed_priv, "revealed private value to P2");

    let revealed_shared = engine
        .reveal_to(&shared, Party::P2)
        .with_context(|| format!("{party}: reveal_to(shared, P2)"))?;

    let added = engine
        .linear(&shared, &public_p2, NdTensor::add_kernel)
        .with_context(|| format!("{party}: linear"))?;
    let revealed_sum = engine
        .reveal_to(&added, Party::P2)
        .with_context(|| format!("{party}: reveal_to(sum, P2)"))?;

    let multiplied = engine
        .product(
            &shared,
            &shared,
            NdTensor::mul_kernel,
            Some(vec![3]),
            Some(vec![3]),
            "demo-square",
            "mul",
        )
        .with_context(|| format!("{party}: product"))?;
    let revealed_square = engine
        .reveal_to(&multiplied, Party::P2)
        .with_context(|| format!("{party}: reveal_to(square, P2)"))?;

    engine.terminate();

    if party == Party::P2 {
        tracing::info!(?revealed_shared, ?revealed_sum, ?revealed_square, "demo scenario complete");
    }

    Ok(revealed_square.or(revealed_sum).or(revealed_shared))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config {
        share_std: args.share_std,
        cached_triples: args.cached_triples,
        ..Config::default()
    };

    let map0 = address_map(args.port)?;
    let map1 = map0.clone();
    let map2 = map0.clone();

    let result = std::thread::scope(|scope| -> Result<Option<NdTensor>> {
        let h0 = scope.spawn(|| run_party(map0, Party::P0, config));
        let h1 = scope.spawn(|| run_party(map1, Party::P1, config));
        let h2 = scope.spawn(|| run_party(map2, Party::P2, config));

        let r0 = h0.join().map_err(|_| anyhow::anyhow!("P0 thread panicked"))??;
        let r1 = h1.join().map_err(|_| anyhow::anyhow!("P1 thread panicked"))??;
        let r2 = h2.join().map_err(|_| anyhow::anyhow!("P2 thread panicked"))??;

        let _ = (r0, r1);
        Ok(r2)
    })?;

    match result {
        Some(square) => println!("P2 revealed the squared shared value: {:?}", square.0),
        None => println!("demo completed with no revealed value"),
    }

    Ok(())
}

