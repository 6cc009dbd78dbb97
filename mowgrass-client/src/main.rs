//! MowGrass headless client
//!
//! Connects to a server, joins the first game in the lobby (or creates one)
//! and random-walks its player while logging what it sees.

use std::time::{Duration, Instant};
use anyhow::{bail, Context};
use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mowgrass::game::state::InputPatch;
use mowgrass_client::network::{now_secs, ActorConfig, ConnectionPhase, NetworkActor};

/// Render this far behind the newest snapshot so there is something to blend.
const RENDER_DELAY_SECS: f64 = 0.1;

const FRAME: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8765")]
    url: String,

    /// Player name
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Connect attempts before giving up (0 = unlimited)
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Seconds to play before exiting
    #[arg(long, default_value = "30")]
    seconds: u64,
}

/// Demo flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoState {
    WaitingForLobby,
    Creating,
    Joining,
    Playing,
}

/// Player-side random walk.
struct Walker {
    x: f64,
    y: f64,
    hp: i64,
    score: i64,
}

impl Walker {
    fn step(&mut self, rng: &mut impl Rng) -> InputPatch {
        self.x += rng.gen_range(-5.0..5.0);
        self.y += rng.gen_range(-5.0..5.0);
        if rng.gen_ratio(1, 4) {
            self.hp = (self.hp - 1).max(0);
        }
        if rng.gen_bool(0.5) {
            self.score += 1;
        }
        InputPatch {
            x: Some(self.x),
            y: Some(self.y),
            hp: Some(self.hp),
            score: Some(self.score),
            equipment: None,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let args = Args::parse();
    info!("Connecting to {} as {}", args.url, args.name);

    let actor = NetworkActor::new(ActorConfig::new(&args.url).with_max_retries(args.max_retries));
    actor.start();

    let mut rng = rand::thread_rng();
    let mut walker = Walker { x: 0.0, y: 0.0, hp: 100, score: 0 };
    let mut state = DemoState::WaitingForLobby;
    let mut state_since = Instant::now();
    let mut last_report = Instant::now();
    let deadline = Instant::now() + Duration::from_secs(args.seconds);

    while Instant::now() < deadline {
        if actor.phase() == ConnectionPhase::Exhausted {
            bail!(
                "could not reach {}: {}",
                args.url,
                actor.last_error().unwrap_or_else(|| "unknown error".into())
            );
        }

        let next = match state {
            DemoState::WaitingForLobby if actor.is_connected() => {
                let lobby = actor.latest_lobby();
                if let Some(game) = lobby.first() {
                    info!("Lobby: {} game(s), joining {}", lobby.len(), game.name);
                    actor.join_game(&game.id, &args.name);
                    Some(DemoState::Joining)
                } else if state_since.elapsed() > Duration::from_secs(1) {
                    info!("Lobby empty, creating a game");
                    actor.create_game("Demo Game");
                    Some(DemoState::Creating)
                } else {
                    None
                }
            }
            DemoState::Creating => actor.last_created().map(|session_id| {
                info!("Created game {}", session_id);
                actor.join_game(session_id, &args.name);
                DemoState::Joining
            }),
            DemoState::Joining if actor.is_joined() => {
                info!(
                    "Joined {} as {}",
                    actor.session_id().unwrap_or_default(),
                    actor.player_id().unwrap_or_default()
                );
                Some(DemoState::Playing)
            }
            DemoState::Playing if !actor.is_joined() => {
                info!("Lost session binding, rejoining");
                Some(DemoState::WaitingForLobby)
            }
            DemoState::Playing => {
                if let (Some(session_id), Some(player_id)) = (actor.session_id(), actor.player_id()) {
                    actor.send_input(session_id, player_id, walker.step(&mut rng));
                }
                if last_report.elapsed() >= Duration::from_secs(1) {
                    let players = actor.get_interpolated_snapshot(now_secs() - RENDER_DELAY_SECS);
                    info!("State: players={} connected={}", players.len(), actor.is_connected());
                    last_report = Instant::now();
                }
                None
            }
            _ => None,
        };

        if let Some(next) = next {
            state = next;
            state_since = Instant::now();
        }

        std::thread::sleep(FRAME);
    }

    actor.stop();
    Ok(())
}
