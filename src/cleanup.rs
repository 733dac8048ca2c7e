// cleanup.rs
//! Process-wide stack of tables whose derived objects exist and must be
//! dropped if their reorganization does not finish.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::interrupt::CleanupScope;
use crate::session::{Connector, Session, SessionSet};
use crate::swap;
use crate::target::ReorgTarget;

#[derive(Clone)]
pub struct Registration {
    pub table: String,
    pub relid: u32,
    pub database: String,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("table", &self.table)
            .field("relid", &self.relid)
            .field("database", &self.database)
            .finish()
    }
}

/// LIFO stack of registrations.
#[derive(Debug, Default)]
pub struct CleanupStack {
    entries: Vec<Registration>,
}

impl CleanupStack {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, registration: Registration) {
        self.entries.push(registration);
    }

    /// Remove the entry for `relid` in `database`. Returns whether one was found.
    pub fn remove(&mut self, database: &str, relid: u32) -> bool {
        match self
            .entries
            .iter()
            .rposition(|r| r.database == database && r.relid == relid)
        {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Take every entry, most recent first, keeping only those `filter` accepts.
    pub fn take_where(&mut self, filter: impl Fn(&Registration) -> bool) -> Vec<Registration> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|r| filter(r));
        self.entries = kept;
        taken.into_iter().rev().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static REGISTRY: Mutex<CleanupStack> = Mutex::new(CleanupStack::new());

fn registry() -> MutexGuard<'static, CleanupStack> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Record that `target`'s derived objects now exist in `connector`'s database.
pub fn register(target: &ReorgTarget, connector: Arc<dyn Connector>) {
    registry().push(Registration {
        table: target.name.clone(),
        relid: target.oid,
        database: connector.database().to_string(),
        connector,
    });
}

/// The derived objects of `target` are gone; nothing left to clean up.
pub fn unregister(target: &ReorgTarget, database: &str) {
    registry().remove(database, target.oid);
}

/// Names of the tables still registered, most recent last.
pub fn registered() -> Vec<String> {
    registry().entries.iter().map(|r| r.table.clone()).collect()
}

/// Reset every session of a failed table and drop the derived objects of
/// every registration in their database, most recent first. Never fails:
/// problems are logged and the registration is kept for [`sweep_remaining`].
pub fn sweep(sessions: &mut SessionSet) -> usize {
    let _scope = CleanupScope::enter();
    if let Err(e) = sessions.abort_all() {
        warn!("could not reset every session before cleanup: {e}");
    }
    let database = sessions.primary.database().to_string();
    let entries = registry().take_where(|r| r.database == database);
    let mut dropped = 0;
    for entry in entries {
        if drop_registered(&mut sessions.primary, &entry) {
            dropped += 1;
        } else {
            registry().push(entry);
        }
    }
    dropped
}

/// Last-chance sweep at process exit over whatever is still registered,
/// each on a fresh connection.
pub fn sweep_remaining() -> usize {
    let _scope = CleanupScope::enter();
    let entries = registry().take_where(|_| true);
    let mut dropped = 0;
    for entry in entries {
        let mut session = match Session::connect("cleanup", entry.connector.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "could not connect to clean up \"{}\": {e}; drop it with SELECT repack.repack_drop({})",
                    entry.table, entry.relid
                );
                continue;
            }
        };
        if drop_registered(&mut session, &entry) {
            dropped += 1;
        }
    }
    dropped
}

fn drop_registered(session: &mut Session, entry: &Registration) -> bool {
    match swap::drop_objects(session, entry.relid) {
        Ok(()) => {
            info!("cleaned up temporary objects of \"{}\"", entry.table);
            true
        }
        Err(e) => {
            warn!("could not clean up \"{}\": {e}", entry.table);
            if let Err(e) = session.abort() {
                warn!("could not reset {} session: {e}", session.name());
            }
            false
        }
    }
}
