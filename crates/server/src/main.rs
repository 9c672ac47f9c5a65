mod config;
mod demo;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use tether::{
    ConditionedTransport, FixedTimestep, Game, LOCAL_CLIENT_NUM, NetworkSystem, ServerEvent,
    SyncCoordinator, ThreadedUdpTransport,
};

use config::Args;
use demo::{Arena, MoveInput};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const LOCAL_CHAT_EVERY: u64 = 300;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = args.bind_addr();
    let transport = ThreadedUdpTransport::bind(&bind_addr, 1024)
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let config = args.server_config();
    let now = Instant::now();
    let conditions = args.link_conditions();
    let mut server = if conditions.is_perfect() {
        SyncCoordinator::new(transport, config, now)
    } else {
        log::warn!(
            "simulating impairment: loss {:.1}% duplicate {:.1}% reorder {:.1}%",
            args.loss_percent,
            args.duplicate_percent,
            args.reorder_percent
        );
        SyncCoordinator::new(ConditionedTransport::new(transport, conditions, args.seed), config, now)
    };

    log::info!("Server started on {}", server.local_addr());

    let mut arena = Arena::new(args.tick_rate);
    if args.listen {
        let client_num = server.attach_local_client();
        arena.spawn(client_num);
        log::info!("Local client attached as {client_num}");
    }

    run(&mut server, &mut arena, &args)?;

    server.shutdown(Instant::now());
    log::info!("Server shutting down");
    Ok(())
}

fn run(server: &mut SyncCoordinator, arena: &mut Arena, args: &Args) -> Result<()> {
    let mut timestep = FixedTimestep::new(args.tick_rate);
    let mut last_frame = Instant::now();
    let mut last_stats = last_frame;

    loop {
        let now = Instant::now();
        let ticks = timestep.advance(now - last_frame);
        last_frame = now;

        for _ in 0..ticks {
            if args.listen {
                drive_local_client(server, arena, timestep.tick())?;
            }

            server.tick(arena, now);

            let events: Vec<ServerEvent> = server.drain_events().collect();
            for event in &events {
                log_event(event);
                arena.handle_event(event);
            }

            if args.ticks.is_some_and(|limit| timestep.tick() >= limit) {
                return Ok(());
            }
        }

        if now.duration_since(last_stats) >= STATS_INTERVAL {
            log_stats(server, now);
            last_stats = now;
        }

        thread::sleep(Duration::from_millis(1));
    }
}

/// The in-process player walks in a circle and chats now and then.
fn drive_local_client(server: &mut SyncCoordinator, arena: &mut Arena, tick: u64) -> Result<()> {
    let angle = tick as f32 * 0.02;
    let input = MoveInput {
        direction: [angle.cos(), 0.0, angle.sin()],
        sprint: false,
    }
    .encode()?;
    arena.consume_input(LOCAL_CLIENT_NUM, &input);

    if tick % LOCAL_CHAT_EVERY == 0 {
        let mut network = NetworkSystem::new(Some(&mut *server), None);
        network.client_send_reliable(format!("tick {tick}").as_bytes())?;
    }

    for message in server.drain_local_reliable() {
        log::debug!("local client got {} reliable bytes", message.len());
    }
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::PeerConnecting { client_num, addr } => {
            log::info!("Connection request from {addr} (client {client_num})");
        }
        ServerEvent::PeerConnected { client_num, addr } => {
            log::info!("Client {client_num} connected from {addr}");
        }
        ServerEvent::PeerDisconnected { client_num, reason } => {
            log::info!("Client {client_num} {reason}");
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {addr}: {reason}");
        }
        ServerEvent::PeerResync { client_num } => {
            log::warn!("Client {client_num} fell out of reliable sync, resending full state");
        }
    }
}

fn log_stats(server: &mut SyncCoordinator, now: Instant) {
    let client_nums = server.peers().client_nums();
    let snapshot = server.snapshot_sequence();
    let network = NetworkSystem::new(Some(server), None);
    log::info!("snapshot {snapshot}, {} clients", client_nums.len());
    for client_num in client_nums {
        log::info!(
            "  client {client_num}: ping {}ms prediction {}ms out {}B/s in {}B/s loss {:.1}% idle {}ms",
            network.server_client_ping(client_num),
            network.server_client_prediction(client_num),
            network.server_client_outgoing_rate(client_num, now),
            network.server_client_incoming_rate(client_num, now),
            network.server_client_incoming_packet_loss(client_num) * 100.0,
            network.server_client_time_since_last_input(client_num, now),
        );
    }
}
