//! End-to-end sync against an in-process fake of the MPD line protocol.

mod common;

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::wait_until;
use oledviz::cancellation::ShutdownSignal;
use oledviz::metadata::{
    MetadataSyncClient, MpdConnector, SyncState, SyncTiming, NO_SONG_TEXT,
};
use oledviz::metrics::MetricsRegistry;
use parking_lot::Mutex;

#[derive(Default)]
struct Player {
    /// Raw `currentsong` body, without the trailing OK.
    current: Mutex<String>,
    version: AtomicU64,
    connections: AtomicUsize,
}

impl Player {
    fn play(&self, body: &str) {
        *self.current.lock() = body.to_string();
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_fake_mpd(player: Arc<Player>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            player.connections.fetch_add(1, Ordering::SeqCst);
            let player = Arc::clone(&player);
            std::thread::spawn(move || serve(stream, &player));
        }
    });
    port
}

fn serve(mut stream: TcpStream, player: &Player) {
    if stream.write_all(b"OK MPD 0.23.5\n").is_err() {
        return;
    }
    let _ = stream.set_read_timeout(Some(Duration::from_millis(10)));
    let Ok(read_half) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut seen = player.version.load(Ordering::SeqCst);
    let mut idle = false;

    loop {
        let version = player.version.load(Ordering::SeqCst);
        if idle && version != seen {
            seen = version;
            idle = false;
            if stream.write_all(b"changed: player\nOK\n").is_err() {
                return;
            }
        }

        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                let command = line.trim().to_string();
                line.clear();
                let reply = match command.as_str() {
                    "currentsong" => {
                        let body = player.current.lock().clone();
                        format!("{body}OK\n")
                    }
                    "idle player" => {
                        idle = true;
                        continue;
                    }
                    "noidle" if idle => {
                        idle = false;
                        seen = version;
                        "OK\n".to_string()
                    }
                    "noidle" => continue,
                    "close" => return,
                    other => format!("ACK [5@0] {{{other}}} unknown command\n"),
                };
                if stream.write_all(reply.as_bytes()).is_err() {
                    return;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }
}

fn start_client(port: u16, idle_timeout: Duration) -> MetadataSyncClient<MpdConnector> {
    let connector = MpdConnector::new("127.0.0.1", port)
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(200));
    MetadataSyncClient::start(
        connector,
        SyncTiming {
            idle_timeout,
            reconnect_delay: Duration::from_millis(100),
            suspend_poll: Duration::from_millis(20),
        },
        ShutdownSignal::new(),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("spawn sync thread")
}

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn follows_player_changes_over_tcp() {
    let player = Arc::new(Player::default());
    player.play("file: a.flac\nPos: 0\nTitle: First\nArtist: Band\nDate: 2020-02-02\n");
    let port = spawn_fake_mpd(Arc::clone(&player));
    let client = start_client(port, Duration::from_secs(1));

    assert!(wait_until(WAIT, || client.formatted_track_text() == "01. First - Band (2020)"));

    player.play("file: b.flac\nPos: 1\nTitle: Second\n");
    assert!(wait_until(WAIT, || client.formatted_track_text() == "02. Second"));

    player.play("");
    assert!(wait_until(WAIT, || client.formatted_track_text() == NO_SONG_TEXT));
}

#[test]
fn idle_timeout_keeps_connection_alive_with_noidle() {
    let player = Arc::new(Player::default());
    player.play("Pos: 2\nTitle: Steady\n");
    let port = spawn_fake_mpd(Arc::clone(&player));
    let client = start_client(port, Duration::from_millis(30));

    assert!(wait_until(WAIT, || client.formatted_track_text() == "03. Steady"));
    std::thread::sleep(Duration::from_millis(200));
    assert!(client.is_connected());
    assert_eq!(player.connections.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_breaks_a_long_idle_promptly() {
    let player = Arc::new(Player::default());
    let port = spawn_fake_mpd(Arc::clone(&player));
    let client = start_client(port, Duration::from_secs(10));

    assert!(wait_until(WAIT, || client.sync_state() == SyncState::IdleWait));
    std::thread::sleep(Duration::from_millis(50));
    let t0 = Instant::now();
    client.stop();
    assert!(t0.elapsed() < Duration::from_secs(2), "stop took {:?}", t0.elapsed());
    assert!(!client.is_connected());
}
