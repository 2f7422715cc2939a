//! The replication CSN generator.
//!
//! One generator serves one replica. It issues strictly increasing CSNs in
//! the face of local clock skew (via `local_offset`) and of peers whose
//! clocks run ahead (via `remote_offset`), and survives restarts through a
//! persisted state attribute.

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::csn::Csn;
use crate::error::LdapError;

/// Largest sequence number; reaching it rolls the generator into the next
/// logical second.
pub const CSN_MAX_SEQNUM: u16 = 0xffff;

/// Maximum allowed time adjustment in seconds (one day).
pub const CSN_MAX_TIME_ADJUST: i64 = 24 * 60 * 60;

/// Attribute type under which generator state persists.
pub const ATTR_CSN_GENERATOR_STATE: &str = "nsState";

const STATE_STRSIZE: usize = 40;

/// Wall-clock skew beyond which the generator recycles sequence numbers by
/// advancing its own notion of time one second at a time.
const SKEW_RECYCLE_SECS: i64 = 300;

fn wall_clock_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The process-wide sampled time cell. The housekeeping tick refreshes it
/// periodically; every generator reads it instead of calling the clock.
#[derive(Debug, Clone)]
pub struct SampledTime(Arc<AtomicI64>);

impl SampledTime {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(wall_clock_secs())))
    }

    /// Refreshes the cell from the wall clock.
    pub fn update(&self) {
        self.0.store(wall_clock_secs(), AtomicOrdering::SeqCst);
    }

    /// Pins the cell to an explicit value (tests, skew simulation).
    pub fn set(&self, secs: i64) {
        self.0.store(secs, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

impl Default for SampledTime {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by the generator. The generator remains usable after any
/// of them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsnError {
    #[error("time adjustment limit exceeded; value {value}, limit {limit}")]
    LimitExceeded { value: i64, limit: i64 },

    #[error("invalid generator state: {0}")]
    InvalidState(String),
}

impl From<CsnError> for LdapError {
    fn from(e: CsnError) -> Self {
        match e {
            CsnError::LimitExceeded { .. } => LdapError::LimitExceeded(e.to_string()),
            CsnError::InvalidState(_) => LdapError::OperationsError(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenPhase {
    Fresh,
    Running,
}

#[derive(Debug, Clone)]
struct GenState {
    rid: u16,
    sampled_time: i64,
    local_offset: i64,
    remote_offset: i64,
    seq: u16,
    phase: GenPhase,
}

impl GenState {
    fn tstamp(&self) -> i64 {
        self.sampled_time + self.local_offset + self.remote_offset
    }
}

/// Callback invoked when a CSN is issued or aborted.
pub type CsnCallback = Arc<dyn Fn(&Csn) + Send + Sync>;

struct CallbackNode {
    id: Uuid,
    on_new: Option<CsnCallback>,
    on_abort: Option<CsnCallback>,
}

/// A per-replica monotonic CSN source.
pub struct CsnGenerator {
    state: RwLock<GenState>,
    // Kept apart from the state lock: callbacks may re-enter the generator.
    callbacks: RwLock<Vec<CallbackNode>>,
    time: SampledTime,
}

impl CsnGenerator {
    /// Creates a generator for `rid`, optionally rebuilding it from a
    /// persisted state string. A supplied state must carry the same replica
    /// id.
    pub fn new(rid: u16, persisted: Option<&str>, time: SampledTime) -> Result<Self, CsnError> {
        let state = match persisted {
            Some(s) => {
                let state = Self::parse_state(s)?;
                if state.rid != rid {
                    return Err(CsnError::InvalidState(format!(
                        "replica id mismatch; current {rid}, state {}",
                        state.rid
                    )));
                }
                state
            }
            None => {
                let now = match time.get() {
                    0 => wall_clock_secs(),
                    t => t,
                };
                GenState {
                    rid,
                    sampled_time: now,
                    local_offset: 0,
                    remote_offset: 0,
                    seq: 0,
                    phase: GenPhase::Fresh,
                }
            }
        };
        Ok(Self {
            state: RwLock::new(state),
            callbacks: RwLock::new(Vec::new()),
            time,
        })
    }

    #[must_use]
    pub fn rid(&self) -> u16 {
        self.state.read().rid
    }

    /// Whether the CSN was issued by this generator's replica.
    #[must_use]
    pub fn is_local_csn(&self, csn: &Csn) -> bool {
        self.rid() == csn.rid
    }

    /// Issues the next CSN. Strictly greater than everything issued before.
    pub fn new_csn(&self, notify: bool) -> Result<Csn, CsnError> {
        let csn = {
            let mut state = self.state.write();
            if self.time.get() == 0 {
                self.time.update();
            }
            let cur = self.time.get();
            let delta = cur - state.sampled_time;
            if delta > 0 {
                Self::adjust_local_time(&mut state, cur)?;
            } else if delta < -SKEW_RECYCLE_SECS {
                // The sequence space covers skews up to ~300s at sane update
                // rates; past that, recycle it by advancing our own second.
                warn!(delta, seq = state.seq, "too much time skew, recycling seqnum");
                let target = state.sampled_time + 1;
                Self::adjust_local_time(&mut state, target)?;
            }

            if state.seq == CSN_MAX_SEQNUM {
                info!("sequence rollover; local offset updated");
                state.local_offset += 1;
                state.seq = 0;
            }

            let csn = Csn {
                tstamp: state.tstamp(),
                seq: state.seq,
                rid: state.rid,
                subseq: 0,
            };
            state.seq += 1;
            state.phase = GenPhase::Running;
            csn
            // The state lock drops here, before callback fan-out, so a
            // callback may call back into the generator.
        };
        if notify {
            self.call_callbacks(&csn, false);
        }
        Ok(csn)
    }

    /// Reports a CSN the caller issued with `notify` but never used. Only
    /// the abort callbacks run; nothing is un-issued.
    pub fn abort_csn(&self, csn: &Csn) {
        self.call_callbacks(csn, true);
    }

    /// Pulls the generator's notion of time forward so it never issues a
    /// CSN at or below one observed from a peer.
    pub fn adjust_time(&self, remote: &Csn) -> Result<(), CsnError> {
        let mut state = self.state.write();
        if self.time.get() == 0 {
            self.time.update();
        }
        let cur = self.time.get();
        if cur > state.sampled_time {
            if let Err(e) = Self::adjust_local_time(&mut state, cur) {
                Self::dump_state(&state);
                return Err(e);
            }
        }

        let cur_ts = state.tstamp();
        let mut remote_ts = remote.tstamp;
        if remote_ts >= cur_ts {
            if remote.seq > state.seq {
                if remote.seq < CSN_MAX_SEQNUM {
                    state.seq = remote.seq + 1;
                } else {
                    // The peer exhausted its second; cascade into the next.
                    remote_ts += 1;
                }
            }
            let remote_offset = remote_ts - cur_ts;
            if remote_offset > state.remote_offset {
                if remote_offset <= CSN_MAX_TIME_ADJUST {
                    state.remote_offset = remote_offset;
                } else {
                    error!(
                        value = remote_offset,
                        limit = CSN_MAX_TIME_ADJUST,
                        "remote time adjustment limit exceeded"
                    );
                    Self::dump_state(&state);
                    return Err(CsnError::LimitExceeded {
                        value: remote_offset,
                        limit: CSN_MAX_TIME_ADJUST,
                    });
                }
            }
        }
        // A remote time in our past never decreases remote_offset: doing so
        // could re-issue CSNs we have already handed out.
        state.phase = GenPhase::Running;
        Ok(())
    }

    /// Registers issue/abort callbacks; returns the cookie for
    /// [`CsnGenerator::unregister_callbacks`].
    pub fn register_callbacks(
        &self,
        on_new: Option<CsnCallback>,
        on_abort: Option<CsnCallback>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.callbacks.write().push(CallbackNode {
            id,
            on_new,
            on_abort,
        });
        id
    }

    pub fn unregister_callbacks(&self, cookie: Uuid) {
        self.callbacks.write().retain(|n| n.id != cookie);
    }

    /// Serializes the state for persistence alongside the RUV.
    #[must_use]
    pub fn get_state(&self) -> String {
        let state = self.state.read();
        format!(
            "{:04x}{:016x}{:08x}{:08x}{:04x}",
            state.rid,
            state.sampled_time as u64,
            state.local_offset as u64,
            state.remote_offset as u64,
            state.seq
        )
    }

    fn parse_state(s: &str) -> Result<GenState, CsnError> {
        if s.len() != STATE_STRSIZE {
            return Err(CsnError::InvalidState(format!(
                "state must be {STATE_STRSIZE} characters, got {}",
                s.len()
            )));
        }
        let field = |range: std::ops::Range<usize>| {
            u64::from_str_radix(&s[range], 16)
                .map_err(|_| CsnError::InvalidState("non-hex state field".into()))
        };
        Ok(GenState {
            rid: field(0..4)? as u16,
            sampled_time: field(4..20)? as i64,
            local_offset: field(20..28)? as i64,
            remote_offset: field(28..36)? as i64,
            seq: field(36..40)? as u16,
            phase: GenPhase::Fresh,
        })
    }

    /// The positive-delta path moves sampled time up and burns down the
    /// local offset; the negative path absorbs a clock set back into the
    /// local offset, up to the adjustment limit.
    fn adjust_local_time(state: &mut GenState, cur_time: i64) -> Result<(), CsnError> {
        let time_diff = cur_time - state.sampled_time;
        if time_diff == 0 {
            return Ok(());
        }
        if time_diff > 0 {
            state.sampled_time = cur_time;
            if time_diff > state.local_offset {
                state.local_offset = 0;
            } else {
                state.local_offset -= time_diff;
            }
            state.seq = 0;
            Ok(())
        } else {
            if -time_diff > CSN_MAX_TIME_ADJUST {
                error!(
                    value = -time_diff,
                    limit = CSN_MAX_TIME_ADJUST,
                    "local time adjustment limit exceeded"
                );
                return Err(CsnError::LimitExceeded {
                    value: -time_diff,
                    limit: CSN_MAX_TIME_ADJUST,
                });
            }
            state.sampled_time = cur_time;
            state.local_offset = state.local_offset.max(-time_diff);
            state.seq = 0;
            Ok(())
        }
    }

    fn call_callbacks(&self, csn: &Csn, abort: bool) {
        let callbacks = self.callbacks.read();
        for node in callbacks.iter() {
            let f = if abort { &node.on_abort } else { &node.on_new };
            if let Some(f) = f {
                f(csn);
            }
        }
    }

    fn dump_state(state: &GenState) {
        info!(
            rid = state.rid,
            sampled_time = state.sampled_time,
            local_offset = state.local_offset,
            remote_offset = state.remote_offset,
            seq = state.seq,
            "CSN generator state"
        );
    }
}
