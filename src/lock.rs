// lock.rs
//! Bounded-retry table locking. Each attempt runs under a short statement
//! timeout; the longer the wait, the harder we push on whoever is in the way.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ReorgError, Result};
use crate::session::{Isolation, Session};
use crate::{params, sql};

const SAVEPOINT: &str = "repack_sp1";
const MAX_ATTEMPT_TIMEOUT_MS: u64 = 1000;
const ATTEMPT_TIMEOUT_STEP_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Waiting,
    CancelSent,
    TerminateSent,
    Acquired,
    Failed,
}

/// What to do to blocking sessions before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerAction {
    Cancel,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Attempt {
        timeout_ms: u64,
        blockers: Option<BlockerAction>,
    },
    GiveUp,
}

/// Escalation driven purely by elapsed time:
/// `Waiting` up to `wait_timeout`, then `CancelSent`, `TerminateSent` past
/// twice the timeout, and `Failed` once terminating has not helped for a
/// further full timeout.
#[derive(Debug, Clone)]
pub struct LockEscalation {
    wait_timeout: Duration,
    state: LockState,
    attempt: u64,
}

impl LockEscalation {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            wait_timeout,
            state: LockState::Waiting,
            attempt: 0,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn next_attempt(&mut self, elapsed: Duration) -> Step {
        let next = if elapsed > self.wait_timeout * 3 && self.state == LockState::TerminateSent {
            LockState::Failed
        } else if elapsed > self.wait_timeout * 2 {
            LockState::TerminateSent
        } else if elapsed > self.wait_timeout {
            LockState::CancelSent
        } else {
            LockState::Waiting
        };
        self.state = next;
        let blockers = match next {
            LockState::Failed => return Step::GiveUp,
            LockState::TerminateSent => Some(BlockerAction::Terminate),
            LockState::CancelSent => Some(BlockerAction::Cancel),
            _ => None,
        };
        self.attempt += 1;
        Step::Attempt {
            timeout_ms: (self.attempt * ATTEMPT_TIMEOUT_STEP_MS).min(MAX_ATTEMPT_TIMEOUT_MS),
            blockers,
        }
    }

    pub fn acquired(&mut self) {
        self.state = LockState::Acquired;
    }
}

/// Take the exclusive lock `lock_statement` describes on `relid`.
///
/// With `start_xact`, each attempt runs in a fresh transaction which is left
/// open on success. Otherwise the caller's transaction is kept and each
/// attempt is wrapped in a savepoint.
pub fn acquire_exclusive(
    session: &mut Session,
    relid: u32,
    table: &str,
    lock_statement: &str,
    start_xact: bool,
    wait_timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut escalation = LockEscalation::new(wait_timeout);
    loop {
        let (timeout_ms, blockers) = match escalation.next_attempt(start.elapsed()) {
            Step::Attempt {
                timeout_ms,
                blockers,
            } => (timeout_ms, blockers),
            Step::GiveUp => {
                return Err(ReorgError::LockTimeout {
                    table: table.to_string(),
                    elapsed: start.elapsed(),
                });
            }
        };
        if start_xact {
            session.begin(Isolation::ReadCommitted)?;
        } else {
            session.savepoint(SAVEPOINT)?;
        }
        match blockers {
            Some(BlockerAction::Cancel) => {
                warn!("canceling conflicting backends on \"{table}\"");
                session.command(sql::CANCEL_CONFLICTING, params![relid])?;
            }
            Some(BlockerAction::Terminate) => {
                warn!("terminating conflicting backends on \"{table}\"");
                session.command(sql::TERMINATE_CONFLICTING, params![relid])?;
            }
            None => {}
        }
        session.command(&sql::set_local_statement_timeout(timeout_ms), params![])?;
        match session.try_execute(lock_statement, params![])? {
            Ok(_) => break,
            Err(e) if e.is_query_canceled() => {
                debug!(attempt = escalation.attempt(), "lock on \"{table}\" timed out, retrying");
                if start_xact {
                    session.rollback()?;
                } else {
                    session.rollback_to(SAVEPOINT)?;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    escalation.acquired();
    session.command(sql::RESET_STATEMENT_TIMEOUT, params![])?;
    debug!(attempts = escalation.attempt(), "locked \"{table}\" exclusively");
    Ok(())
}

/// Take ACCESS SHARE on `table` inside the session's open transaction,
/// clearing away DDL that queues for ACCESS EXCLUSIVE while we wait.
pub fn acquire_shared(
    session: &mut Session,
    relid: u32,
    table: &str,
    wait_timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut escalation = LockEscalation::new(wait_timeout);
    let statement = sql::lock_access_share(table);
    loop {
        let timeout_ms = match escalation.next_attempt(start.elapsed()) {
            Step::Attempt { timeout_ms, .. } => timeout_ms,
            Step::GiveUp => {
                return Err(ReorgError::LockTimeout {
                    table: table.to_string(),
                    elapsed: start.elapsed(),
                });
            }
        };
        let terminate = escalation.state() == LockState::TerminateSent;
        kill_ddl(session, relid, table, terminate)?;
        session.savepoint(SAVEPOINT)?;
        session.command(&sql::set_local_statement_timeout(timeout_ms), params![])?;
        match session.try_execute(&statement, params![])? {
            Ok(_) => break,
            Err(e) if e.is_query_canceled() => {
                debug!(attempt = escalation.attempt(), "share lock on \"{table}\" timed out, retrying");
                session.rollback_to(SAVEPOINT)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    escalation.acquired();
    session.command(sql::RESET_STATEMENT_TIMEOUT, params![])?;
    Ok(())
}

/// Cancel sessions waiting (not yet granted) for ACCESS EXCLUSIVE on
/// `relid`. With `terminate`, the ones that were found are killed as well.
/// Returns how many were signalled.
pub fn kill_ddl(session: &mut Session, relid: u32, table: &str, terminate: bool) -> Result<usize> {
    let canceled = session.execute(sql::CANCEL_COMPETING_DDL, params![relid])?.len();
    if canceled == 0 {
        return Ok(0);
    }
    if !terminate {
        warn!("canceled {canceled} backend(s) waiting to lock \"{table}\" exclusively");
        return Ok(canceled);
    }
    let terminated = session.execute(sql::TERMINATE_COMPETING_DDL, params![relid])?.len();
    warn!(
        "canceled {canceled} and terminated {terminated} backend(s) waiting to lock \"{table}\" exclusively"
    );
    Ok(canceled + terminated)
}
