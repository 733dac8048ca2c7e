// capture.rs
//! Installs the change-capture trigger and its log table under an exclusive
//! lock, then hands the table over to the peer session's share lock.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::lock;
use crate::session::{Isolation, SessionSet};
use crate::{params, sql};
use crate::target::ReorgTarget;

/// Create the row-identity type, log table and trigger in one transaction,
/// queue the peer's ACCESS SHARE request behind our exclusive lock, then
/// commit. On return the derived objects exist and the peer is waiting for
/// (or already holds) its share lock.
pub fn install_capture(
    sessions: &mut SessionSet,
    target: &ReorgTarget,
    wait_timeout: Duration,
) -> Result<()> {
    let primary = &mut sessions.primary;
    lock::acquire_exclusive(
        primary,
        target.oid,
        &target.name,
        &target.lock_table,
        true,
        wait_timeout,
    )?;

    let conflicts = primary.execute(sql::CONFLICTED_TRIGGERS, params![target.oid])?;
    if let Some(trigger) = conflicts.into_iter().find_map(|row| row.into_iter().next().flatten()) {
        return Err(ConfigError::TriggerConflict {
            table: target.name.clone(),
            trigger,
        }
        .into());
    }

    primary.command(&target.create_pktype, params![])?;
    primary.command(&target.create_log, params![])?;
    primary.command(&target.create_trigger, params![])?;
    primary.command(&target.enable_trigger, params![])?;
    primary.command(sql::DISABLE_AUTOVACUUM, params![target.log_table()])?;
    debug!(
        "{} installed on \"{}\" with row type {}",
        sql::CAPTURE_TRIGGER,
        target.name,
        target.pk_type()
    );

    reserve_share_lock(sessions, target)?;
    lock::kill_ddl(&mut sessions.primary, target.oid, &target.name, true)?;
    sessions.primary.commit()?;
    info!("capturing changes to \"{}\" in {}", target.name, target.log_table());
    Ok(())
}

/// Queue the peer's share lock while we still hold the exclusive one, so no
/// DDL can slip in between our commit and the peer's grant.
fn reserve_share_lock(sessions: &mut SessionSet, target: &ReorgTarget) -> Result<()> {
    let peer = &mut sessions.peer;
    peer.begin(Isolation::ReadCommitted)?;
    peer.send_async(&sql::lock_access_share(&target.name))
}
