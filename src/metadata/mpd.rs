//! MPD line protocol over TCP.
//!
//! Every command is a single line; replies are `key: value` lines ending in
//! `OK`, or a single `ACK [err@line] {cmd} message`. `idle player` blocks
//! server-side until the player changes; `noidle` ends it early.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Connector, IdleOutcome, MetadataConnection, MetadataError, SongInfo};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6600;

const GREETING_PREFIX: &str = "OK MPD ";
/// `set_read_timeout` rejects a zero duration.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct MpdConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    cancel_timeout: Duration,
    /// Socket of the live connection, kept so `interrupt` can break a
    /// blocked read without touching the connection itself.
    active: LiveSocket,
}

type LiveSocket = Arc<Mutex<Option<TcpStream>>>;

impl Default for MpdConnector {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl MpdConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(2),
            cancel_timeout: Duration::from_millis(500),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// `connect_timeout` also bounds every non-idle reply.
    pub fn with_timeouts(mut self, connect_timeout: Duration, cancel_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(MIN_TIMEOUT);
        self.cancel_timeout = cancel_timeout.max(MIN_TIMEOUT);
        self
    }

    fn resolve(&self) -> Result<SocketAddr, MetadataError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| MetadataError::Resolve(self.describe()))?
            .next()
            .ok_or_else(|| MetadataError::Resolve(self.describe()))
    }

    fn open(&self, timeout: Duration) -> Result<MpdConnection, MetadataError> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        MpdConnection::handshake(stream, timeout)
    }
}

impl Connector for MpdConnector {
    type Connection = MpdConnection;

    fn connect(&self) -> Result<MpdConnection, MetadataError> {
        let mut conn = self.open(self.connect_timeout)?;
        *self.active.lock() = conn.writer.try_clone().ok();
        conn.registration = Some(Arc::clone(&self.active));
        debug!(endpoint = %self.describe(), version = %conn.version(), "mpd handshake complete");
        Ok(conn)
    }

    /// Sends `noidle` over a short-lived side connection, then shuts down the
    /// live socket so a read blocked in `idle` returns immediately.
    fn interrupt(&self) {
        match self.open(self.cancel_timeout) {
            Ok(mut side) => {
                if let Err(e) = side.send("noidle") {
                    debug!(error = %e, "noidle on side connection failed");
                }
                side.close();
            }
            Err(e) => debug!(error = %e, "side connection for noidle failed"),
        }
        if let Some(live) = self.active.lock().take() {
            let _ = live.shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct MpdConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Partial line carried across a read timeout.
    line: String,
    version: String,
    reply_timeout: Duration,
    idle_pending: bool,
    /// `changed:` seen for the pending idle before its `OK` arrived.
    change_seen: bool,
    /// Connector slot holding a clone of this socket, cleared on close.
    registration: Option<LiveSocket>,
}

impl MpdConnection {
    fn handshake(stream: TcpStream, reply_timeout: Duration) -> Result<Self, MetadataError> {
        let writer = stream.try_clone()?;
        let mut conn = Self {
            reader: BufReader::new(stream),
            writer,
            line: String::new(),
            version: String::new(),
            reply_timeout,
            idle_pending: false,
            change_seen: false,
            registration: None,
        };

        conn.set_timeout(reply_timeout)?;
        let greeting = conn.expect_line()?;
        match greeting.strip_prefix(GREETING_PREFIX) {
            Some(version) => conn.version = version.trim().to_string(),
            None => {
                return Err(MetadataError::Protocol(format!(
                    "unexpected greeting {greeting:?}"
                )))
            }
        }
        Ok(conn)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_idle(&self) -> bool {
        self.idle_pending
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), MetadataError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), MetadataError> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Next complete line, or `None` if the read timed out first.
    fn next_line(&mut self) -> Result<Option<String>, MetadataError> {
        match self.reader.read_line(&mut self.line) {
            Ok(0) => Err(MetadataError::Closed),
            Ok(_) if !self.line.ends_with('\n') => Err(MetadataError::Closed),
            Ok(_) => {
                let line = self.line.trim_end_matches(['\r', '\n']).to_string();
                self.line.clear();
                Ok(Some(line))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(MetadataError::Io(e)),
        }
    }

    fn expect_line(&mut self) -> Result<String, MetadataError> {
        self.next_line()?
            .ok_or_else(|| MetadataError::Protocol("timed out waiting for reply".into()))
    }

    /// Read through the terminating `OK` of a command reply, collecting the
    /// `key: value` pairs.
    fn read_pairs(&mut self) -> Result<Vec<(String, String)>, MetadataError> {
        let mut pairs = Vec::new();
        loop {
            let line = self.expect_line()?;
            if line == "OK" {
                return Ok(pairs);
            }
            if line.starts_with("ACK") {
                return Err(MetadataError::Ack(line));
            }
            match line.split_once(": ") {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => {
                    return Err(MetadataError::Protocol(format!("malformed line {line:?}")))
                }
            }
        }
    }

    /// Read the rest of an idle/noidle reply. `Ok(None)` on timeout, with the
    /// idle still pending.
    fn read_idle_reply(&mut self) -> Result<Option<bool>, MetadataError> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            if line == "OK" {
                self.idle_pending = false;
                return Ok(Some(std::mem::take(&mut self.change_seen)));
            }
            if line.starts_with("ACK") {
                self.idle_pending = false;
                self.change_seen = false;
                return Err(MetadataError::Ack(line));
            }
            match line.strip_prefix("changed: ") {
                Some(subsystem) => {
                    debug!(subsystem, "mpd subsystem changed");
                    self.change_seen = true;
                }
                None => {
                    return Err(MetadataError::Protocol(format!(
                        "unexpected idle line {line:?}"
                    )))
                }
            }
        }
    }
}

impl MetadataConnection for MpdConnection {
    fn fetch_current_track(&mut self) -> Result<Option<SongInfo>, MetadataError> {
        if self.idle_pending {
            self.cancel_wait()?;
        }
        self.set_timeout(self.reply_timeout)?;
        self.send("currentsong")?;
        let pairs = self.read_pairs()?;
        if pairs.is_empty() {
            return Ok(None);
        }

        let mut song = SongInfo::default();
        for (key, value) in pairs {
            match key.as_str() {
                "Pos" => song.position = value.trim().parse().ok(),
                "Title" => song.title = Some(value),
                "Artist" => song.artist = Some(value),
                "Date" => song.date = Some(value),
                _ => {}
            }
        }
        Ok(Some(song))
    }

    fn wait_for_change(&mut self, timeout: Duration) -> Result<IdleOutcome, MetadataError> {
        if !self.idle_pending {
            self.send("idle player")?;
            self.idle_pending = true;
        }
        self.set_timeout(timeout)?;
        Ok(match self.read_idle_reply()? {
            None => IdleOutcome::TimedOut,
            Some(true) => IdleOutcome::Changed,
            Some(false) => IdleOutcome::Cancelled,
        })
    }

    fn cancel_wait(&mut self) -> Result<bool, MetadataError> {
        if !self.idle_pending {
            return Ok(false);
        }
        self.send("noidle")?;
        self.set_timeout(self.reply_timeout)?;
        self.read_idle_reply()?
            .ok_or_else(|| MetadataError::Protocol("no reply to noidle".into()))
    }

    fn close(&mut self) {
        self.unregister();
        if let Err(e) = self.send("close") {
            debug!(error = %e, "mpd close command failed");
        }
        let _ = self.writer.shutdown(Shutdown::Both);
        self.idle_pending = false;
    }
}

impl MpdConnection {
    /// Empty the connector slot if it still holds this socket, so the
    /// descriptor closes with the connection.
    fn unregister(&mut self) {
        let Some(slot) = self.registration.take() else {
            return;
        };
        let ours = self.writer.local_addr().ok();
        let mut active = slot.lock();
        let registered = active.as_ref().and_then(|s| s.local_addr().ok());
        if ours.is_some() && registered == ours {
            *active = None;
        }
    }
}

impl Drop for MpdConnection {
    fn drop(&mut self) {
        self.unregister();
    }
}
