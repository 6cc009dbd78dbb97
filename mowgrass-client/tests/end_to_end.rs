//! Network actor against a real in-process server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use mowgrass::game::state::InputPatch;
use mowgrass::{GameServer, ServerConfig};
use mowgrass_client::network::{now_secs, ActorConfig, ConnectionPhase, NetworkActor};

async fn start_server() -> (Arc<GameServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (serve_on(listener), addr)
}

/// Bind `addr` again once the previous server has let go of it.
async fn restart_server(addr: SocketAddr) -> Arc<GameServer> {
    for _ in 0..100 {
        if let Ok(listener) = TcpListener::bind(addr).await {
            return serve_on(listener);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not bind {} again", addr);
}

fn serve_on(listener: TcpListener) -> Arc<GameServer> {
    let server = Arc::new(GameServer::new(ServerConfig {
        bind_addr: listener.local_addr().unwrap(),
        broadcast_period: Duration::from_millis(20),
        ..Default::default()
    }));

    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });

    server
}

fn actor_for(addr: SocketAddr) -> NetworkActor {
    let config = ActorConfig::new(format!("ws://{}", addr))
        .with_poll_interval(Duration::from_millis(10));
    NetworkActor::new(config)
}

/// Poll `check` until it holds or `limit` passes.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actor_creates_joins_and_interpolates() {
    let (server, addr) = start_server().await;
    let actor = actor_for(addr);

    // queued before the connection exists
    actor.create_game("Alpha");
    actor.start();

    assert!(eventually(Duration::from_secs(5), || actor.last_created().is_some()).await);
    assert!(actor.is_connected());
    let session_id = actor.last_created().unwrap();

    actor.join_game(&session_id, "P1");
    assert!(eventually(Duration::from_secs(5), || actor.is_joined()).await);
    assert_eq!(actor.session_id().as_deref(), Some(session_id.as_str()));
    let player_id = actor.player_id().unwrap();

    actor.send_input(&session_id, &player_id, InputPatch::with_position(5.0, 5.0));
    let moved = eventually(Duration::from_secs(5), || {
        actor
            .latest_snapshot()
            .and_then(|players| players.get(&player_id).map(|p| p.position() == (5.0, 5.0)))
            .unwrap_or(false)
    })
    .await;
    assert!(moved);

    // render time past the newest sample gives the newest records
    let players = actor.get_interpolated_snapshot(now_secs() + 60.0);
    assert_eq!(players[&player_id].position(), (5.0, 5.0));
    assert_eq!(players[&player_id].hp, 100);

    assert!(
        eventually(Duration::from_secs(5), || {
            actor
                .latest_lobby()
                .iter()
                .any(|game| game.id == session_id && game.players == 1)
        })
        .await
    );

    actor.stop();
    assert!(!actor.is_connected());

    // last player gone: the session is deleted
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.session_count().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.session_count().await, 0);

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_actors_share_a_session() {
    let (server, addr) = start_server().await;
    let host = actor_for(addr);
    let guest = actor_for(addr);
    host.start();
    guest.start();

    host.create_game("Shared");
    assert!(eventually(Duration::from_secs(5), || host.last_created().is_some()).await);
    let session_id = host.last_created().unwrap();

    host.join_game(&session_id, "Host");
    assert!(eventually(Duration::from_secs(5), || host.is_joined()).await);

    // the guest learns about the session from the lobby push
    assert!(
        eventually(Duration::from_secs(5), || {
            guest.latest_lobby().iter().any(|game| game.id == session_id)
        })
        .await
    );
    guest.join_game(&session_id, "Guest");
    assert!(eventually(Duration::from_secs(5), || guest.is_joined()).await);

    let both_visible = |actor: &NetworkActor| {
        actor.latest_snapshot().map(|players| players.len() == 2).unwrap_or(false)
    };
    assert!(eventually(Duration::from_secs(5), || both_visible(&host) && both_visible(&guest)).await);

    // host leaves: session stays for the guest, with one player
    host.stop();
    assert!(
        eventually(Duration::from_secs(5), || {
            guest
                .latest_lobby()
                .iter()
                .any(|game| game.id == session_id && game.players == 1)
        })
        .await
    );
    assert_eq!(server.session_count().await, 1);

    guest.stop();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_unknown_session_reports_error() {
    let (server, addr) = start_server().await;
    let actor = actor_for(addr);
    actor.start();

    actor.join_game("no-such-session", "P1");

    assert!(
        eventually(Duration::from_secs(5), || {
            actor.last_error().as_deref() == Some("game not found")
        })
        .await
    );
    assert!(actor.is_connected());
    assert!(!actor.is_joined());

    actor.stop();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_retries() {
    // grab a free port, then close it so every connect is refused
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let config = ActorConfig::new(format!("ws://{}", addr))
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(20))
        .with_poll_interval(Duration::from_millis(5));
    let actor = NetworkActor::new(config);
    actor.start();

    assert!(eventually(Duration::from_secs(5), || actor.phase() == ConnectionPhase::Exhausted).await);
    assert_eq!(actor.attempts(), 3);
    assert!(!actor.is_connected());

    // terminal: no further attempts
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(actor.attempts(), 3);
    assert_eq!(actor.phase(), ConnectionPhase::Exhausted);
    assert!(actor.last_error().unwrap().contains("3 connection attempts"));

    // commands still return immediately
    actor.request_lobby();
    actor.stop();
    actor.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_unbound_after_server_restart() {
    let (first, addr) = start_server().await;
    let config = ActorConfig::new(format!("ws://{}", addr))
        .with_max_retries(0)
        .with_backoff(Duration::from_millis(20), Duration::from_millis(50))
        .with_poll_interval(Duration::from_millis(10));
    let actor = NetworkActor::new(config);
    actor.start();

    actor.create_game("Alpha");
    assert!(eventually(Duration::from_secs(5), || actor.last_created().is_some()).await);
    let old_session = actor.last_created().unwrap();
    actor.join_game(&old_session, "P1");
    assert!(eventually(Duration::from_secs(5), || actor.latest_snapshot().is_some()).await);
    assert!(actor.is_joined());
    let attempts_before = actor.attempts();
    assert_eq!(attempts_before, 1);

    // the server goes away and takes the binding with it
    first.shutdown();
    assert!(eventually(Duration::from_secs(5), || !actor.is_connected() && !actor.is_joined()).await);
    assert!(actor.session_id().is_none());
    assert!(actor.player_id().is_none());
    assert!(actor.latest_snapshot().is_none());
    assert!(actor.get_interpolated_snapshot(now_secs()).is_empty());

    let second = restart_server(addr).await;
    assert!(eventually(Duration::from_secs(5), || actor.is_connected()).await);
    assert!(actor.attempts() > attempts_before);
    assert_eq!(actor.phase(), ConnectionPhase::Connected);
    assert!(!actor.is_joined());
    assert_eq!(second.session_count().await, 0);

    // joining works again on the new server
    actor.create_game("Beta");
    assert!(eventually(Duration::from_secs(5), || actor.last_created().is_some()).await);
    let new_session = actor.last_created().unwrap();
    assert_ne!(new_session, old_session);
    actor.join_game(&new_session, "P1");
    assert!(eventually(Duration::from_secs(5), || actor.is_joined()).await);
    assert_eq!(actor.session_id().as_deref(), Some(new_session.as_str()));

    actor.stop();
    second.shutdown();
}
