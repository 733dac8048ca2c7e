// snapshot.rs
//! Records which transactions were in flight, then builds the shadow copy.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::OrderMode;
use crate::error::Result;
use crate::lock;
use crate::session::{Isolation, SessionSet};
use crate::{params, sql};
use crate::target::ReorgTarget;
use crate::version::ServerVersion;

/// Virtual transaction ids active when the copy's snapshot was taken.
/// Replay may not finish while any of them is still running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFingerprint {
    vxids: Vec<String>,
}

impl SnapshotFingerprint {
    pub fn new(vxids: Vec<String>) -> Self {
        Self { vxids }
    }

    /// Parse the text form of a `text[]`, e.g. `{3/17,5/2}`. NULL is empty.
    pub fn parse(array: Option<&str>) -> Self {
        let vxids = array
            .map(|a| a.trim().trim_start_matches('{').trim_end_matches('}'))
            .into_iter()
            .flat_map(|inner| inner.split(','))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .collect();
        Self { vxids }
    }

    pub fn is_empty(&self) -> bool {
        self.vxids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vxids.len()
    }

    pub fn vxids(&self) -> &[String] {
        &self.vxids
    }
}

/// Wait for the peer's share lock, then in one serializable transaction take
/// the fingerprint, clear the log and copy the table into the shadow.
pub fn capture_and_copy(
    sessions: &mut SessionSet,
    target: &ReorgTarget,
    order: &OrderMode,
    version: ServerVersion,
    wait_timeout: Duration,
) -> Result<SnapshotFingerprint> {
    sessions.peer.wait_async()?;
    debug!("peer holds ACCESS SHARE on \"{}\"", target.name);

    let peer_pid = sessions.peer.pid();
    let primary = &mut sessions.primary;
    primary.begin(Isolation::Serializable)?;
    primary.command(sql::COPY_WORK_MEM, params![])?;
    if *order == OrderMode::Unordered {
        primary.command(sql::DISABLE_SYNC_SEQSCANS, params![])?;
    }

    let snapshot_query = version
        .xid_snapshot_query()
        .unwrap_or(sql::XID_SNAPSHOT_90200);
    let array = primary.query_value(snapshot_query, params![peer_pid, sql::APPLICATION_NAME])?;
    let fingerprint = SnapshotFingerprint::parse(array.as_deref());
    debug!("snapshot taken with {} transaction(s) in flight", fingerprint.len());

    primary.command(&target.delete_log, params![])?;
    lock::acquire_shared(primary, target.oid, &target.name, wait_timeout)?;
    primary.command(&target.create_table, params![])?;
    if let Some(drop_columns) = &target.drop_columns {
        primary.command(drop_columns, params![])?;
    }
    primary.command(sql::DISABLE_AUTOVACUUM, params![target.shadow_table()])?;
    primary.commit()?;
    info!("copied \"{}\" into {}", target.name, target.shadow_table());
    Ok(fingerprint)
}
