// coordinator.rs
//! Drives each table through capture, copy, index rebuild, replay and swap,
//! one table at a time, and each database in turn.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::capture;
use crate::cleanup;
use crate::config::{ReorgConfig, Scope};
use crate::error::{ConfigError, ReorgError, Result};
use crate::index;
use crate::interrupt::{self, CleanupScope};
use crate::metadata;
use crate::replay::{self, LogTableReplay};
use crate::session::{Connector, Session, SessionSet};
use crate::snapshot;
use crate::{params, sql};
use crate::swap;
use crate::target::ReorgTarget;
use crate::version::{self, ServerVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOutcome {
    Reorganized,
    /// Dry run: would have been reorganized.
    Planned,
    /// Ruled out by configuration (no key, trigger conflict, already running).
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseReport {
    pub database: String,
    pub tables: Vec<TableReport>,
    /// Why the database as a whole was passed over, in `--all` mode.
    pub skipped: Option<String>,
}

impl DatabaseReport {
    pub fn count(&self, matches: impl Fn(&TableOutcome) -> bool) -> usize {
        self.tables.iter().filter(|t| matches(&t.outcome)).count()
    }
}

/// Opens connectors to a named database.
pub trait ConnectorFactory {
    fn connector(&self, database: &str) -> Result<Arc<dyn Connector>>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Connector>>,
{
    fn connector(&self, database: &str) -> Result<Arc<dyn Connector>> {
        self(database)
    }
}

pub struct Coordinator<'a> {
    config: &'a ReorgConfig,
}

impl<'a> Coordinator<'a> {
    pub fn new(config: &'a ReorgConfig) -> Self {
        Self { config }
    }

    /// Reorganize everything the configuration selects.
    pub fn run(&self, factory: &dyn ConnectorFactory) -> Result<Vec<DatabaseReport>> {
        match &self.config.scope {
            Scope::AllDatabases => self.reorg_all_databases(factory),
            Scope::Database | Scope::Tables(_) => {
                let connector = factory.connector(&self.config.dbname)?;
                Ok(vec![self.reorg_database(connector)?])
            }
        }
    }

    pub fn reorg_all_databases(&self, factory: &dyn ConnectorFactory) -> Result<Vec<DatabaseReport>> {
        let databases = {
            let mut session = Session::connect("primary", factory.connector(&self.config.dbname)?)?;
            metadata::check_superuser(&mut session)?;
            metadata::list_databases(&mut session)?
        };
        let mut reports = Vec::with_capacity(databases.len());
        for database in databases {
            interrupt::check()?;
            let attempt = factory
                .connector(&database)
                .and_then(|connector| self.reorg_database(connector));
            match attempt {
                Ok(report) => reports.push(report),
                Err(e) if e.is_run_fatal() && !matches!(e, ReorgError::Connect { .. }) => return Err(e),
                Err(e) => {
                    if e.is_not_installed() {
                        debug!("{database}: skipped: {e}");
                    } else {
                        info!("{database}: skipped: {e}");
                    }
                    reports.push(DatabaseReport {
                        database,
                        tables: Vec::new(),
                        skipped: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(reports)
    }

    /// Reorganize the selected tables of one database, strictly one after another.
    pub fn reorg_database(&self, connector: Arc<dyn Connector>) -> Result<DatabaseReport> {
        let database = connector.database().to_string();
        let mut sessions = SessionSet::open(connector.clone(), self.config.jobs)?;
        metadata::check_superuser(&mut sessions.primary)?;
        metadata::check_support_version(&mut sessions.primary, &database)?;
        let version = version::detect_server_version(&mut sessions.primary)?;
        let candidates =
            metadata::fetch_targets(&mut sessions.primary, self.config.tables(), &self.config.order)?;

        let single = self.config.single_table();
        let mut tables = Vec::with_capacity(candidates.len());
        for (name, candidate) in candidates {
            interrupt::check()?;
            let target = match candidate {
                Ok(target) => target,
                Err(e) if single => return Err(e.into()),
                Err(e) => {
                    warn!("skipping \"{name}\": {e}");
                    tables.push(TableReport {
                        table: name,
                        outcome: TableOutcome::Skipped(e.to_string()),
                    });
                    continue;
                }
            };
            if self.config.dry_run {
                info!("would repack table \"{}\"", target.name);
                tables.push(TableReport {
                    table: name,
                    outcome: TableOutcome::Planned,
                });
                continue;
            }
            let outcome = match self.reorg_table(&mut sessions, &target, version, &connector) {
                Ok(()) => TableOutcome::Reorganized,
                Err(e) if single => return Err(e),
                // a lost connection that cleanup could re-establish only fails the table
                Err(e) if e.is_run_fatal() && !(is_lost(&e) && sessions.is_connected()) => return Err(e),
                Err(ReorgError::Config(e)) => {
                    warn!("skipping \"{name}\": {e}");
                    TableOutcome::Skipped(e.to_string())
                }
                Err(e) => {
                    error!("could not repack \"{name}\": {e}");
                    TableOutcome::Failed(e.to_string())
                }
            };
            tables.push(TableReport { table: name, outcome });
        }
        Ok(DatabaseReport {
            database,
            tables,
            skipped: None,
        })
    }

    /// One table, start to finish. On failure every session is reset and the
    /// table's derived objects are dropped before the error is returned.
    pub fn reorg_table(
        &self,
        sessions: &mut SessionSet,
        target: &ReorgTarget,
        version: ServerVersion,
        connector: &Arc<dyn Connector>,
    ) -> Result<()> {
        info!("repacking table \"{}\"", target.name);
        acquire_advisory_lock(&mut sessions.primary, target)?;
        let result = self.run_phases(sessions, target, version, connector);
        if result.is_err() {
            let dropped = cleanup::sweep(sessions);
            debug!("cleanup dropped objects of {dropped} table(s)");
        }
        release_advisory_lock(&mut sessions.primary, target);
        result
    }

    fn run_phases(
        &self,
        sessions: &mut SessionSet,
        target: &ReorgTarget,
        version: ServerVersion,
        connector: &Arc<dyn Connector>,
    ) -> Result<()> {
        let wait_timeout = self.config.wait_timeout;
        capture::install_capture(sessions, target, wait_timeout)?;
        cleanup::register(target, connector.clone());

        let fingerprint =
            snapshot::capture_and_copy(sessions, target, &self.config.order, version, wait_timeout)?;
        let built = index::rebuild_indexes(sessions, target)?;
        debug!("rebuilt {built} index(es)");

        let mut log = LogTableReplay::new(&mut sessions.primary, target);
        let applied = replay::replay_until_caught_up(&mut log, &fingerprint, replay::WAIT_INTERVAL)?;
        debug!("replayed {applied} log row(s) before the swap");

        swap::swap_and_finalize(sessions, target, wait_timeout)?;
        cleanup::unregister(target, connector.database());

        if self.config.analyze {
            swap::analyze_table(&mut sessions.primary, target);
        }
        Ok(())
    }
}

fn is_lost(e: &ReorgError) -> bool {
    matches!(e, ReorgError::ConnectionLost { .. })
}

fn acquire_advisory_lock(session: &mut Session, target: &ReorgTarget) -> Result<()> {
    let locked = session.query_value(sql::TRY_ADVISORY_LOCK, params![i64::from(target.oid)])?;
    if locked.as_deref() != Some("t") {
        return Err(ConfigError::AlreadyRunning {
            table: target.name.clone(),
        }
        .into());
    }
    Ok(())
}

fn release_advisory_lock(session: &mut Session, target: &ReorgTarget) {
    let _scope = CleanupScope::enter();
    if let Err(e) = session.command(sql::ADVISORY_UNLOCK, params![i64::from(target.oid)]) {
        warn!("could not release advisory lock on \"{}\": {e}", target.name);
    }
}
