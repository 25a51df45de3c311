//! Per-session record with guaranteed teardown
//!
//! One `SessionRecord` is created when a handler starts, populated as the
//! session progresses, and flushed to the recorder exactly once no matter
//! how the handler exits.

use crate::core::hooks::Recorder;
use crate::error::ProxyError;
use crate::transport::ConnectionMeta;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::info;

/// Identity of one accepted connection as seen by the handler
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub sid: u64,
}

/// Ephemeral per-connection record handed to the recorder
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub service: String,
    pub sid: u64,
    pub remote_addr: String,
    pub local_addr: String,
    pub client_ip: String,
    pub time: SystemTime,
    /// Destination network, set once the destination is resolved
    pub network: String,
    /// Destination host:port, set once the destination is resolved
    pub host: String,
    /// Empty on success
    pub err: String,
    pub duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl SessionRecord {
    pub fn new(service: &str, meta: &ConnectionMeta, sid: u64) -> Self {
        Self {
            service: service.to_string(),
            sid,
            remote_addr: meta.peer_addr.to_string(),
            local_addr: meta.local_addr.to_string(),
            client_ip: meta.peer_addr.ip().to_string(),
            time: SystemTime::now(),
            network: String::new(),
            host: String::new(),
            err: String::new(),
            duration: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

/// Scoped owner of a `SessionRecord`.
///
/// Dropping the guard (or calling `finish`) stamps the duration, flushes the
/// record to the recorder and emits the completion log line. Whichever
/// happens first wins; the flush never runs twice.
pub struct SessionGuard {
    record: SessionRecord,
    recorder: Option<Arc<dyn Recorder>>,
    started: Instant,
    flushed: bool,
}

impl SessionGuard {
    pub fn new(record: SessionRecord, recorder: Option<Arc<dyn Recorder>>) -> Self {
        Self {
            record,
            recorder,
            started: Instant::now(),
            flushed: false,
        }
    }

    pub fn set_error(&mut self, err: &ProxyError) {
        self.record.err = err.to_string();
    }

    /// Flush explicitly; the normal exit path of a handler.
    pub fn finish(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        self.record.duration = self.started.elapsed();
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.record);
        }
        info!(
            sid = self.record.sid,
            duration = ?self.record.duration,
            err = %self.record.err,
            "{} >< {}",
            self.record.remote_addr,
            self.record.local_addr,
        );
    }
}

impl Deref for SessionGuard {
    type Target = SessionRecord;

    fn deref(&self) -> &SessionRecord {
        &self.record
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.flush();
    }
}
