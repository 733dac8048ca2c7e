// swap.rs
//! Final catch-up, storage swap and teardown of the derived objects.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock;
use crate::replay::{ChangeLog, LogTableReplay};
use crate::session::{Isolation, Session, SessionSet};
use crate::{params, sql};
use crate::target::ReorgTarget;

/// Upgrade the peer's share lock to exclusive, apply the rest of the log,
/// swap storage and commit; then drop what is left over on the primary.
pub fn swap_and_finalize(
    sessions: &mut SessionSet,
    target: &ReorgTarget,
    wait_timeout: Duration,
) -> Result<()> {
    lock::acquire_exclusive(
        &mut sessions.peer,
        target.oid,
        &target.name,
        &target.lock_table,
        false,
        wait_timeout,
    )?;
    let tail = LogTableReplay::new(&mut sessions.peer, target).drain(0)?;
    debug!("applied final {tail} log row(s)");
    sessions.peer.command(sql::SWAP, params![target.oid])?;
    sessions.peer.commit()?;
    info!("swapped storage of \"{}\"", target.name);

    drop_objects(&mut sessions.primary, target.oid)
}

/// Remove trigger, log, shadow table and row type of `relid`; whichever
/// of them still exist.
pub fn drop_objects(session: &mut Session, relid: u32) -> Result<()> {
    session.begin(Isolation::ReadCommitted)?;
    session.command(sql::DROP, params![relid])?;
    session.commit()
}

/// Refresh planner statistics. The table is already reorganized by now, so
/// a failure of any kind is only reported.
pub fn analyze_table(session: &mut Session, target: &ReorgTarget) {
    if let Err(e) = run_analyze(session, target) {
        warn!("could not analyze \"{}\": {e}", target.name);
        if let Err(e) = session.abort() {
            warn!("could not reset {} session: {e}", session.name());
        }
    }
}

fn run_analyze(session: &mut Session, target: &ReorgTarget) -> Result<()> {
    session.begin(Isolation::ReadCommitted)?;
    session.command(&sql::analyze(&target.name), params![])?;
    session.commit()
}
