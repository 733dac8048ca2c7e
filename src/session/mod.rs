//! Database sessions. Each session owns one connection on a dedicated I/O
//! thread, so a statement can be left running on one session (a lock
//! request, an index build) while the coordinator keeps working on another.

pub mod pg;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::error::{DbError, ReorgError, Result};
use crate::interrupt::{self, InFlight};
use crate::sql;

pub use pg::{PgBackend, PgConnector};
pub use postgres::types::ToSql;

/// One result row, every column in text form.
pub type TextRow = Vec<Option<String>>;

/// A statement parameter, owned so it can be handed to the session's I/O thread.
pub type Param = Box<dyn ToSql + Send + Sync>;

/// Build a `Vec<Param>` from values the driver can bind.
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::session::Param>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$(::std::boxed::Box::new($value) as $crate::session::Param),+]
    };
}

/// Sends a cancel request for whatever statement a backend is running.
pub trait Canceller: Send + Sync {
    fn cancel(&self) -> std::result::Result<(), DbError>;
}

/// A single blocking database connection.
pub trait Backend: Send {
    /// Run `sql` with `params` bound to `$1..$n`.
    fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<TextRow>, DbError>;
    fn backend_pid(&self) -> i32;
    fn is_closed(&self) -> bool;
    fn canceller(&self) -> Arc<dyn Canceller>;
}

/// Opens backends against one database.
pub trait Connector: Send + Sync {
    fn connect(&self) -> std::result::Result<Box<dyn Backend>, DbError>;
    fn database(&self) -> &str;
}

/// A finished statement, routed back to whoever is waiting on `tag`.
#[derive(Debug)]
pub struct Completion {
    pub tag: usize,
    pub outcome: std::result::Result<Vec<TextRow>, DbError>,
}

struct Request {
    sql: String,
    params: Vec<Param>,
    tag: usize,
    reply: Sender<Completion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransactionOpen,
    AwaitingAsyncResult { in_transaction: bool },
}

impl SessionState {
    pub fn describe(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::TransactionOpen => "in transaction",
            SessionState::AwaitingAsyncResult { .. } => "awaiting an asynchronous result",
        }
    }

    fn in_transaction(&self) -> bool {
        match self {
            SessionState::Idle => false,
            SessionState::TransactionOpen => true,
            SessionState::AwaitingAsyncResult { in_transaction } => *in_transaction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    Serializable,
}

impl Isolation {
    fn begin_statement(self) -> &'static str {
        match self {
            Isolation::ReadCommitted => sql::BEGIN_READ_COMMITTED,
            Isolation::Serializable => sql::BEGIN_SERIALIZABLE,
        }
    }
}

enum Pending {
    Own { sql: String, reply: Receiver<Completion> },
    Routed { sql: String },
}

pub struct Session {
    name: String,
    connector: Arc<dyn Connector>,
    requests: Sender<Request>,
    closed: Arc<AtomicBool>,
    canceller: Arc<dyn Canceller>,
    pid: i32,
    state: SessionState,
    pending: Option<Pending>,
}

impl Session {
    pub fn connect(name: &str, connector: Arc<dyn Connector>) -> Result<Self> {
        let backend = connector
            .connect()
            .map_err(|e| ReorgError::Connect {
                database: connector.database().to_string(),
                reason: e.message,
            })?;
        let (requests, closed, canceller, pid) = spawn_io(name, backend);
        let mut session = Session {
            name: name.to_string(),
            connector,
            requests,
            closed,
            canceller,
            pid,
            state: SessionState::Idle,
            pending: None,
        };
        for statement in sql::SESSION_SETUP {
            session.command(statement, params![])?;
        }
        debug!(session = %session.name, pid = session.pid, "connected");
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn database(&self) -> &str {
        self.connector.database()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn misuse(&self, expected: &'static str) -> ReorgError {
        ReorgError::SessionState {
            session: self.name.clone(),
            expected,
            actual: self.state.describe(),
        }
    }

    fn lost(&self, reason: &str) -> ReorgError {
        ReorgError::ConnectionLost {
            session: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn submit(&self, sql: &str, params: Vec<Param>, tag: usize, reply: Sender<Completion>) -> Result<()> {
        let request = Request {
            sql: sql.to_string(),
            params,
            tag,
            reply,
        };
        self.requests
            .send(request)
            .map_err(|_| self.lost("session thread has exited"))
    }

    /// Run a statement and return the server's error, if any, unconverted.
    /// Used where particular SQLSTATEs are part of the protocol (lock waits).
    pub fn try_execute(
        &mut self,
        sql: &str,
        params: Vec<Param>,
    ) -> Result<std::result::Result<Vec<TextRow>, DbError>> {
        interrupt::check()?;
        if let SessionState::AwaitingAsyncResult { .. } = self.state {
            return Err(self.misuse("idle or in transaction"));
        }
        debug!(session = %self.name, ?params, "{sql}");
        let (tx, rx) = mpsc::channel();
        let _in_flight = InFlight::enter(self.canceller.clone());
        self.submit(sql, params, 0, tx)?;
        let completion = rx.recv().map_err(|_| self.lost("no reply from session thread"))?;
        if self.is_closed() {
            return Err(self.lost(
                completion.outcome.as_ref().err().map_or("connection closed", |e| e.message.as_str()),
            ));
        }
        interrupt::check()?;
        Ok(completion.outcome)
    }

    pub fn execute(&mut self, sql: &str, params: Vec<Param>) -> Result<Vec<TextRow>> {
        Ok(self.try_execute(sql, params)??)
    }

    pub fn command(&mut self, sql: &str, params: Vec<Param>) -> Result<()> {
        self.execute(sql, params).map(|_| ())
    }

    /// First column of the first row, if there is one.
    pub fn query_value(&mut self, sql: &str, params: Vec<Param>) -> Result<Option<String>> {
        let rows = self.execute(sql, params)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next().flatten()))
    }

    /// Reconnect first if the connection has gone away.
    pub fn ensure_connected(&mut self) -> Result<()> {
        if self.is_closed() {
            warn!(session = %self.name, "connection is not usable, reconnecting");
            self.reconnect()?;
        }
        Ok(())
    }

    pub fn reconnect(&mut self) -> Result<()> {
        let backend = self.connector.connect().map_err(|e| self.lost(&e.message))?;
        let (requests, closed, canceller, pid) = spawn_io(&self.name, backend);
        self.requests = requests;
        self.closed = closed;
        self.canceller = canceller;
        self.pid = pid;
        self.state = SessionState::Idle;
        self.pending = None;
        for statement in sql::SESSION_SETUP {
            self.command(statement, params![])?;
        }
        debug!(session = %self.name, pid = self.pid, "reconnected");
        Ok(())
    }

    pub fn begin(&mut self, isolation: Isolation) -> Result<()> {
        self.ensure_connected()?;
        if self.state != SessionState::Idle {
            return Err(self.misuse("idle"));
        }
        self.command(isolation.begin_statement(), params![])?;
        self.state = SessionState::TransactionOpen;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.state != SessionState::TransactionOpen {
            return Err(self.misuse("in transaction"));
        }
        // the transaction is over whether or not COMMIT succeeds
        let result = self.command(sql::COMMIT, params![]);
        self.state = SessionState::Idle;
        result
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.state != SessionState::TransactionOpen {
            return Err(self.misuse("in transaction"));
        }
        let result = self.command(sql::ROLLBACK, params![]);
        self.state = SessionState::Idle;
        result
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        if self.state != SessionState::TransactionOpen {
            return Err(self.misuse("in transaction"));
        }
        self.command(&sql::savepoint(name), params![])
    }

    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        if self.state != SessionState::TransactionOpen {
            return Err(self.misuse("in transaction"));
        }
        self.command(&sql::rollback_to_savepoint(name), params![])
    }

    /// Submit a statement without waiting for it. Collect with [`Session::wait_async`].
    pub fn send_async(&mut self, sql: &str) -> Result<()> {
        interrupt::check()?;
        if let SessionState::AwaitingAsyncResult { .. } = self.state {
            return Err(self.misuse("idle or in transaction"));
        }
        debug!(session = %self.name, "async: {sql}");
        let (tx, rx) = mpsc::channel();
        self.submit(sql, params![], 0, tx)?;
        self.pending = Some(Pending::Own {
            sql: sql.to_string(),
            reply: rx,
        });
        self.state = SessionState::AwaitingAsyncResult {
            in_transaction: self.state.in_transaction(),
        };
        Ok(())
    }

    pub fn wait_async(&mut self) -> Result<Vec<TextRow>> {
        let SessionState::AwaitingAsyncResult { in_transaction } = self.state else {
            return Err(self.misuse("awaiting an asynchronous result"));
        };
        let Some(Pending::Own { sql, reply }) = self.pending.take() else {
            return Err(self.misuse("awaiting an asynchronous result"));
        };
        let completion = {
            let _in_flight = InFlight::enter(self.canceller.clone());
            reply.recv().map_err(|_| self.lost("no reply from session thread"))?
        };
        self.state = if in_transaction {
            SessionState::TransactionOpen
        } else {
            SessionState::Idle
        };
        debug!(session = %self.name, "async finished: {sql}");
        interrupt::check()?;
        Ok(completion.outcome?)
    }

    /// Submit a statement whose completion is delivered, tagged, to `notify`.
    /// The owner of `notify` must call [`Session::finish_dispatch`] on delivery.
    pub fn dispatch(&mut self, sql: &str, tag: usize, notify: &Sender<Completion>) -> Result<()> {
        interrupt::check()?;
        if let SessionState::AwaitingAsyncResult { .. } = self.state {
            return Err(self.misuse("idle or in transaction"));
        }
        debug!(session = %self.name, tag, "dispatch: {sql}");
        self.submit(sql, params![], tag, notify.clone())?;
        self.pending = Some(Pending::Routed { sql: sql.to_string() });
        self.state = SessionState::AwaitingAsyncResult {
            in_transaction: self.state.in_transaction(),
        };
        Ok(())
    }

    pub fn finish_dispatch(&mut self) -> Result<()> {
        let SessionState::AwaitingAsyncResult { in_transaction } = self.state else {
            return Err(self.misuse("awaiting an asynchronous result"));
        };
        if let Some(Pending::Routed { sql }) = self.pending.take() {
            debug!(session = %self.name, "dispatch finished: {sql}");
        }
        self.state = if in_transaction {
            SessionState::TransactionOpen
        } else {
            SessionState::Idle
        };
        Ok(())
    }

    /// Ask the server to cancel whatever this session is running.
    pub fn cancel(&self) -> Result<()> {
        self.canceller.cancel().map_err(ReorgError::from)
    }

    /// Abandon any in-flight work and open transaction. Best effort: used on
    /// the failure path, where the session may be in any state.
    pub fn abort(&mut self) -> Result<()> {
        if let SessionState::AwaitingAsyncResult { .. } = self.state {
            if let Err(e) = self.cancel() {
                warn!(session = %self.name, "could not cancel pending statement: {e}");
            }
            // the I/O thread handles requests in order, so the rollback
            // below runs once the cancelled statement has returned
            self.pending = None;
        }
        self.state = SessionState::Idle;
        if self.is_closed() {
            return self.reconnect();
        }
        match self.try_execute(sql::ROLLBACK, params![])? {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(session = %self.name, "rollback failed: {}", e.message);
                Ok(())
            }
        }
    }
}

fn spawn_io(
    name: &str,
    backend: Box<dyn Backend>,
) -> (Sender<Request>, Arc<AtomicBool>, Arc<dyn Canceller>, i32) {
    let (tx, rx) = mpsc::channel::<Request>();
    let closed = Arc::new(AtomicBool::new(false));
    let canceller = backend.canceller();
    let pid = backend.backend_pid();
    let thread_closed = closed.clone();
    let thread_name = format!("reorg-{name}");
    let spawned = thread::Builder::new()
        .name(thread_name)
        .spawn(move || serve(backend, rx, thread_closed));
    if let Err(e) = spawned {
        // without an I/O thread every request fails as a lost connection
        warn!("could not start session thread: {e}");
        closed.store(true, Ordering::SeqCst);
    }
    (tx, closed, canceller, pid)
}

fn serve(mut backend: Box<dyn Backend>, requests: Receiver<Request>, closed: Arc<AtomicBool>) {
    for request in requests {
        let params: Vec<&(dyn ToSql + Sync)> = request
            .params
            .iter()
            .map(|p| &**p as &(dyn ToSql + Sync))
            .collect();
        let outcome = backend.query(&request.sql, &params);
        closed.store(backend.is_closed(), Ordering::SeqCst);
        let _ = request.reply.send(Completion {
            tag: request.tag,
            outcome,
        });
    }
}

/// Every session one reorganization needs.
pub struct SessionSet {
    pub primary: Session,
    /// Holds the ACCESS SHARE lock between capture setup and the swap.
    pub peer: Session,
    pub workers: Vec<Session>,
}

impl SessionSet {
    /// Open the primary and peer sessions, plus `jobs` index workers when `jobs > 1`.
    pub fn open(connector: Arc<dyn Connector>, jobs: usize) -> Result<Self> {
        let primary = Session::connect("primary", connector.clone())?;
        let peer = Session::connect("peer", connector.clone())?;
        let mut workers = Vec::new();
        if jobs > 1 {
            for i in 0..jobs {
                workers.push(Session::connect(&format!("worker-{i}"), connector.clone())?);
            }
        }
        Ok(SessionSet {
            primary,
            peer,
            workers,
        })
    }

    /// Pids of our own sessions, which must never count as blockers.
    pub fn pids(&self) -> Vec<i32> {
        std::iter::once(self.primary.pid())
            .chain(std::iter::once(self.peer.pid()))
            .chain(self.workers.iter().map(Session::pid))
            .collect()
    }

    /// Whether every session still has a live connection.
    pub fn is_connected(&self) -> bool {
        !self.primary.is_closed() && !self.peer.is_closed() && self.workers.iter().all(|w| !w.is_closed())
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        std::iter::once(&mut self.primary)
            .chain(std::iter::once(&mut self.peer))
            .chain(self.workers.iter_mut())
    }

    /// Roll back every session, reconnecting any whose connection is gone.
    /// Keeps going past failures and reports the first one.
    pub fn abort_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for session in self.all_mut() {
            if let Err(e) = session.abort() {
                warn!(session = %session.name(), "could not reset session: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
