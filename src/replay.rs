// replay.rs
// Applies captured changes from the log table to the shadow table.

use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::session::Session;
use crate::snapshot::SnapshotFingerprint;
use crate::{params, sql};
use crate::target::ReorgTarget;

/// Log rows applied per `drain` call in the catch-up loop.
pub const APPLY_COUNT: usize = 1000;
/// Pause between liveness checks while old transactions are still running.
pub const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// The captured change stream of one table.
pub trait ChangeLog {
    /// Apply up to `batch_size` captured changes, oldest first, and remove
    /// them from the log. A batch size of 0 applies everything.
    fn drain(&mut self, batch_size: usize) -> Result<usize>;

    /// Backend pids still running a transaction from `fingerprint`.
    fn alive(&mut self, fingerprint: &SnapshotFingerprint) -> Result<Vec<String>>;
}

/// The log table of `target`, replayed through `repack.repack_apply`.
pub struct LogTableReplay<'a> {
    pub session: &'a mut Session,
    pub target: &'a ReorgTarget,
}

impl<'a> LogTableReplay<'a> {
    pub fn new(session: &'a mut Session, target: &'a ReorgTarget) -> Self {
        Self { session, target }
    }
}

impl ChangeLog for LogTableReplay<'_> {
    fn drain(&mut self, batch_size: usize) -> Result<usize> {
        let replay = &self.target.replay;
        let count = i32::try_from(batch_size).unwrap_or(i32::MAX);
        let applied = self
            .session
            .query_value(
                sql::APPLY_LOG,
                params![
                    replay.peek.clone(),
                    replay.insert.clone(),
                    replay.delete.clone(),
                    replay.update.clone(),
                    replay.pop.clone(),
                    count,
                ],
            )?
            .unwrap_or_default();
        let applied: usize = applied
            .trim()
            .parse()
            .map_err(|_| DbError::new(sql::APPLY_LOG, None, format!("bad row count {applied:?}")))?;
        if applied > 0 {
            debug!("applied {applied} log row(s) to {}", self.target.shadow_table());
        }
        Ok(applied)
    }

    fn alive(&mut self, fingerprint: &SnapshotFingerprint) -> Result<Vec<String>> {
        if fingerprint.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .session
            .execute(sql::XID_ALIVE, params![fingerprint.vxids().to_vec()])?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().next().flatten().unwrap_or_default())
            .collect())
    }
}

/// Drain the log until it is empty and no transaction from `fingerprint`
/// is still running. Emptiness alone is not enough: a transaction older
/// than the snapshot can still add rows after a drain came back empty.
pub fn replay_until_caught_up<L: ChangeLog>(
    log: &mut L,
    fingerprint: &SnapshotFingerprint,
    wait_interval: Duration,
) -> Result<usize> {
    let mut total = 0;
    let mut waiting_for = 0;
    loop {
        let applied = log.drain(APPLY_COUNT)?;
        total += applied;
        if applied > 0 {
            continue;
        }
        let alive = log.alive(fingerprint)?;
        if alive.is_empty() {
            break;
        }
        if alive.len() != waiting_for {
            info!(
                "waiting for {} transaction(s) to finish, first pid {}",
                alive.len(),
                alive[0]
            );
            waiting_for = alive.len();
        }
        thread::sleep(wait_interval);
    }
    Ok(total)
}
