//! Now-playing metadata synchronisation.
//!
//! A background thread keeps one connection to the metadata service and
//! long-polls it for player changes:
//!
//! ```text
//! Disconnected → Connecting → IdleWait ⇄ Updating
//!        ↑            │ (fail: retry after delay)
//!        └── error ───┘
//! any active state ── Asleep ──→ Suspended ── Awake ──→ Connecting
//! ```
//!
//! The connection is owned by the thread alone. Other threads only read the
//! formatted track snapshot, flip the sleep flag, or interrupt a blocked wait
//! through the connector's side channel, so none of them can contend with the
//! thread's use of the connection.

pub mod mpd;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancellation::ShutdownSignal;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::power::{PowerAware, PowerState};

pub use mpd::{MpdConnection, MpdConnector};

pub const WAITING_TEXT: &str = "Waiting for MPD...";
pub const NO_SONG_TEXT: &str = "No song playing";
pub const UNKNOWN_TITLE: &str = "Unknown Title";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata service i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve metadata service address {0}")]
    Resolve(String),
    #[error("metadata service rejected command: {0}")]
    Ack(String),
    #[error("metadata protocol violation: {0}")]
    Protocol(String),
    #[error("metadata service closed the connection")]
    Closed,
}

/// Fields of the current song as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongInfo {
    /// Zero-based playlist position.
    pub position: Option<u32>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub date: Option<String>,
}

/// Display-ready track record. `formatted` is rebuilt by every constructor,
/// so it always matches the fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackMetadata {
    pub track_number: String,
    pub title: String,
    pub artist: String,
    pub year: String,
    formatted: String,
}

impl TrackMetadata {
    fn placeholder(text: &str) -> Self {
        Self {
            track_number: String::new(),
            title: text.to_string(),
            artist: String::new(),
            year: String::new(),
            formatted: text.to_string(),
        }
    }

    /// Before the first successful fetch, and after a lost connection.
    pub fn waiting() -> Self {
        Self::placeholder(WAITING_TEXT)
    }

    /// Service reachable, nothing playing.
    pub fn no_song() -> Self {
        Self::placeholder(NO_SONG_TEXT)
    }

    pub fn from_song(song: &SongInfo) -> Self {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let track_number = song
            .position
            .map(|p| format!("{:02}", p.saturating_add(1)))
            .unwrap_or_default();
        let title = non_empty(&song.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string());
        let artist = non_empty(&song.artist).unwrap_or_default();
        // Dates shorter than a full year are dropped.
        let year = non_empty(&song.date)
            .filter(|d| d.chars().count() >= 4)
            .map(|d| d.chars().take(4).collect::<String>())
            .unwrap_or_default();

        let mut formatted = String::new();
        if !track_number.is_empty() {
            formatted.push_str(&track_number);
            formatted.push_str(". ");
        }
        formatted.push_str(&title);
        if !artist.is_empty() {
            formatted.push_str(" - ");
            formatted.push_str(&artist);
        }
        if !year.is_empty() {
            formatted.push_str(" (");
            formatted.push_str(&year);
            formatted.push(')');
        }

        Self {
            track_number,
            title,
            artist,
            year,
            formatted,
        }
    }

    pub fn formatted(&self) -> &str {
        &self.formatted
    }
}

impl Default for TrackMetadata {
    fn default() -> Self {
        Self::waiting()
    }
}

/// Result of one bounded long-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The player changed; the wait is over.
    Changed,
    /// The wait ended without a change (cancelled from elsewhere).
    Cancelled,
    /// Nothing arrived within the timeout; the wait is still outstanding.
    TimedOut,
}

/// One live connection to the metadata service.
pub trait MetadataConnection: Send {
    /// `None` when no track is active.
    fn fetch_current_track(&mut self) -> Result<Option<SongInfo>, MetadataError>;

    /// Start (or continue) waiting for a player change, for at most `timeout`.
    fn wait_for_change(&mut self, timeout: Duration) -> Result<IdleOutcome, MetadataError>;

    /// End an outstanding wait. A no-op returning `false` when none is
    /// outstanding; otherwise returns whether the cancel reply reported a change.
    fn cancel_wait(&mut self) -> Result<bool, MetadataError>;

    fn close(&mut self);
}

/// Opens connections. Shared between the sync thread and its owner.
pub trait Connector: Send + Sync + 'static {
    type Connection: MetadataConnection + 'static;

    fn connect(&self) -> Result<Self::Connection, MetadataError>;

    /// Best-effort nudge to a wait blocked on another thread, over a channel
    /// independent of that thread's connection.
    fn interrupt(&self) {}

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String {
        String::from("metadata service")
    }
}

/// Where the sync thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Disconnected,
    Connecting,
    IdleWait,
    Updating,
    Suspended,
}

#[derive(Debug, Clone)]
pub struct SyncTiming {
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub suspend_poll: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            suspend_poll: Duration::from_millis(500),
        }
    }
}

/// Type-erased view of a running sync client.
pub trait MetadataSource: Send + Sync {
    fn formatted_track_text(&self) -> String;
    fn sync_state(&self) -> SyncState;
    fn is_connected(&self) -> bool;
    fn stop(&self);
}

struct Inner<C: Connector> {
    connector: C,
    timing: SyncTiming,
    track: Mutex<TrackMetadata>,
    state: Mutex<SyncState>,
    sleeping: AtomicBool,
    connected: AtomicBool,
    stop_flag: AtomicBool,
    shutdown: ShutdownSignal,
    metrics: Arc<MetricsRegistry>,
}

pub struct MetadataSyncClient<C: Connector = MpdConnector> {
    inner: Arc<Inner<C>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> MetadataSyncClient<C> {
    /// Spawn the sync thread. It starts Awake and connects immediately.
    pub fn start(
        connector: C,
        timing: SyncTiming,
        shutdown: ShutdownSignal,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, MetadataError> {
        let inner = Arc::new(Inner {
            connector,
            timing,
            track: Mutex::new(TrackMetadata::waiting()),
            state: Mutex::new(SyncState::Disconnected),
            sleeping: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            shutdown,
            metrics,
        });

        let worker = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("metadata-sync".into())
            .spawn(move || {
                info!(endpoint = %worker.connector.describe(), "metadata sync started");
                worker.run();
                info!("metadata sync stopped");
            })?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Snapshot of the current track record.
    pub fn track(&self) -> TrackMetadata {
        self.inner.track.lock().clone()
    }

    pub fn formatted_track_text(&self) -> String {
        self.inner.track.lock().formatted().to_string()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Stop the thread, breaking any blocked wait, and join it.
    pub fn stop(&self) {
        self.inner.stop_flag.store(true, Ordering::SeqCst);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.inner.connector.interrupt();
        if handle.join().is_err() {
            warn!("metadata sync thread panicked");
        }
    }
}

impl<C: Connector> PowerAware for MetadataSyncClient<C> {
    fn set_power_state(&self, state: PowerState) {
        let asleep = state == PowerState::Asleep;
        if self.inner.sleeping.swap(asleep, Ordering::SeqCst) != asleep {
            debug!(state = %state, "metadata_power_state");
        }
    }
}

impl<C: Connector> MetadataSource for MetadataSyncClient<C> {
    fn formatted_track_text(&self) -> String {
        MetadataSyncClient::formatted_track_text(self)
    }

    fn sync_state(&self) -> SyncState {
        MetadataSyncClient::sync_state(self)
    }

    fn is_connected(&self) -> bool {
        MetadataSyncClient::is_connected(self)
    }

    fn stop(&self) {
        MetadataSyncClient::stop(self)
    }
}

impl<C: Connector> Drop for MetadataSyncClient<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: Connector> Inner<C> {
    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed) || self.shutdown.is_requested()
    }

    fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock() = state;
    }

    fn set_track(&self, track: TrackMetadata) {
        let mut current = self.track.lock();
        if *current != track {
            info!(text = %track.formatted(), "track_changed");
            *current = track;
        }
    }

    fn run(&self) {
        let mut conn: Option<C::Connection> = None;

        while !self.should_stop() {
            if self.is_sleeping() {
                if let Some(mut c) = conn.take() {
                    if let Err(e) = c.cancel_wait() {
                        debug!(error = %e, "cancel before suspend failed");
                    }
                    c.close();
                    self.connected.store(false, Ordering::SeqCst);
                    info!("metadata_suspended");
                }
                self.set_state(SyncState::Suspended);
                self.shutdown.wait_for(self.timing.suspend_poll, || {
                    !self.is_sleeping() || self.stop_flag.load(Ordering::Relaxed)
                });
                continue;
            }

            if conn.is_none() {
                match self.establish() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_ms = self.timing.reconnect_delay.as_millis() as u64,
                            "metadata_connect_failed"
                        );
                        self.connection_lost();
                        self.shutdown.wait_for(self.timing.reconnect_delay, || {
                            self.is_sleeping() || self.stop_flag.load(Ordering::Relaxed)
                        });
                    }
                }
                continue;
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            if let Err(e) = self.poll_once(c) {
                if self.should_stop() {
                    break;
                }
                warn!(error = %e, "metadata_connection_lost");
                if let Some(mut c) = conn.take() {
                    c.close();
                }
                self.connection_lost();
            }
        }

        if let Some(mut c) = conn.take() {
            c.close();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.set_state(SyncState::Disconnected);
    }

    /// Connect and fetch the current track right away.
    fn establish(&self) -> Result<C::Connection, MetadataError> {
        self.set_state(SyncState::Connecting);
        let span = self.metrics.span(metric_names::METADATA_CONNECT);
        let mut conn = self.connector.connect()?;
        span.finish();
        self.connected.store(true, Ordering::SeqCst);
        info!("metadata_connected");

        if let Err(e) = self.refresh(&mut conn) {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// One bounded idle wait, then a refresh if the player changed.
    fn poll_once(&self, conn: &mut C::Connection) -> Result<(), MetadataError> {
        self.set_state(SyncState::IdleWait);
        let changed = match conn.wait_for_change(self.timing.idle_timeout)? {
            IdleOutcome::Changed => true,
            IdleOutcome::Cancelled => false,
            IdleOutcome::TimedOut => conn.cancel_wait()?,
        };
        if changed {
            debug!("player_changed");
            self.refresh(conn)?;
        }
        Ok(())
    }

    fn refresh(&self, conn: &mut C::Connection) -> Result<(), MetadataError> {
        self.set_state(SyncState::Updating);
        let span = self.metrics.span(metric_names::METADATA_FETCH);
        let song = conn.fetch_current_track()?;
        span.finish();
        self.set_track(match song {
            Some(song) => TrackMetadata::from_song(&song),
            None => TrackMetadata::no_song(),
        });
        Ok(())
    }

    fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.set_state(SyncState::Disconnected);
        self.set_track(TrackMetadata::waiting());
    }
}
