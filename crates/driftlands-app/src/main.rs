//! Headless orchestrator for the Driftlands simulation.
//!
//! Boots a world registry from a content root, streams the starting world
//! in, and drives the fixed-tick `update` → `detect` pipeline with a player
//! walking right, crossing world edges as they become eligible. Rendering
//! and input are external; this shell exists to run the simulation and
//! surface its events through tracing.

use anyhow::{Context, Result, bail};
use driftlands_core::{Player, SimOutcome, WorldConfig};
use driftlands_stream::{StreamingContext, WorldRegistry};
use rand::rngs::SmallRng;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Milliseconds per simulation tick (20 ticks per second).
const TICK_MS: f32 = 50.0;

struct RunOptions {
    root: PathBuf,
    start: String,
    ticks: u64,
    seed: Option<u64>,
}

fn parse_args() -> Result<RunOptions> {
    let mut args = std::env::args().skip(1);
    let root = PathBuf::from(args.next().unwrap_or_else(|| "assets/world".to_string()));
    let start = args.next().unwrap_or_else(|| "town.xml".to_string());
    let ticks = match args.next() {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("tick count `{raw}` is not a number"))?,
        None => 2_000,
    };
    let seed = match args.next() {
        Some(raw) => Some(
            raw.parse()
                .with_context(|| format!("seed `{raw}` is not a number"))?,
        ),
        None => None,
    };
    if args.next().is_some() {
        bail!("usage: driftlands [world-root] [start-world] [ticks] [seed]");
    }
    Ok(RunOptions {
        root,
        start,
        ticks,
        seed,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Drive the tick loop until the budget runs out or the player dies.
fn run(
    registry: &mut WorldRegistry,
    ctx: &mut StreamingContext,
    player: &mut Player,
    rng: &mut SmallRng,
    config: &WorldConfig,
    ticks: u64,
) -> Result<SimOutcome> {
    // Keep walking right; the streaming layer decides when that becomes a
    // world crossing.
    player.data.velocity.vx = 0.05;

    for _ in 0..ticks {
        let before = ctx.active().to_string();

        {
            let world = registry.get_mut(&before)?;
            let events = world.update(player, config, TICK_MS, rng);
            if let Some(village) = events.village_entered {
                info!(%village, "welcome");
            }
            let summary = world.detect(player, config, TICK_MS, rng);
            if summary.deaths > 0 {
                debug!(deaths = summary.deaths, "entities removed");
            }
            if summary.outcome == SimOutcome::GameOver {
                return Ok(SimOutcome::GameOver);
            }
        }

        let switch = ctx.go_world_right(registry, player)?;
        if !switch.is_stay(&before) {
            let cue = {
                let incoming = registry.get(ctx.active())?;
                incoming.music_cue(registry.get(&before).ok())
            };
            if let Some(cue) = cue {
                info!(?cue, "music cue");
            }
            info!(from = %before, to = %ctx.active(), "world crossed");
        }
    }
    Ok(SimOutcome::Alive)
}

fn main() -> Result<()> {
    init_tracing();
    let opts = parse_args()?;

    let config = WorldConfig {
        rng_seed: opts.seed,
        ..WorldConfig::default()
    };
    let mut rng = config.seeded_rng();
    let mut registry = WorldRegistry::new(&opts.root, config.clone())
        .with_context(|| format!("bootstrapping registry at {}", opts.root.display()))?;
    let mut ctx = StreamingContext::new(&mut registry, &opts.start)
        .with_context(|| format!("streaming in start world `{}`", opts.start))?;

    let mut player = Player::default();
    {
        // Start standing on the terrain at the world origin.
        let world = ctx.active_world(&registry)?;
        let column = world.terrain().column_index(0.0, player.data.width);
        player.data.position.x = 0.0;
        player.data.position.y = world.terrain().ground_height(column);
    }
    info!(world = %ctx.active(), ticks = opts.ticks, "simulation starting");

    let outcome = run(
        &mut registry,
        &mut ctx,
        &mut player,
        &mut rng,
        &config,
        opts.ticks,
    )?;
    match outcome {
        SimOutcome::Alive => info!(world = %ctx.active(), "tick budget exhausted"),
        SimOutcome::GameOver => info!(world = %ctx.active(), "game over"),
    }

    registry
        .save(ctx.active())
        .context("saving the active world on shutdown")?;
    Ok(())
}
