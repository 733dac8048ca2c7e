//! A simulated server that understands the statements the reorganizer
//! issues: table locks with blocking waits and statement timeouts,
//! serializable snapshots, the capture trigger and its log, the swap and
//! drop primitives, and hooks for injecting writes and failures.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use postgres_reorg::config::{OrderMode, ReorgConfig, Scope};
use postgres_reorg::coordinator::{Coordinator, DatabaseReport};
use postgres_reorg::error::{DbError, ReorgError};
use postgres_reorg::session::{Backend, Canceller, Connector, TextRow, ToSql};
use postgres_reorg::sql;
use postgres_reorg::version::program_version;

const POLL: Duration = Duration::from_millis(10);
const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    AccessShare,
    RowExclusive,
    AccessExclusive,
}

impl LockMode {
    fn parse(mode: &str) -> Option<Self> {
        match mode {
            "ACCESS SHARE" => Some(LockMode::AccessShare),
            "ROW EXCLUSIVE" => Some(LockMode::RowExclusive),
            "ACCESS EXCLUSIVE" => Some(LockMode::AccessExclusive),
            _ => None,
        }
    }

    fn conflicts(self, other: LockMode) -> bool {
        self == LockMode::AccessExclusive || other == LockMode::AccessExclusive
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    id: u64,
    pid: i32,
    relid: u32,
    mode: LockMode,
    granted: bool,
    depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub oid: u32,
    pub def: String,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub oid: u32,
    pub storage: u32,
    pub rows: BTreeMap<i64, String>,
    pub has_pk: bool,
    pub ckey: Option<String>,
    pub indexes: Vec<Index>,
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    id: u64,
    seq: u64,
    pk: Option<i64>,
    row: Option<(i64, String)>,
}

#[derive(Debug, Clone)]
pub struct Shadow {
    pub rows: BTreeMap<i64, String>,
    pub storage: u32,
    pub indexes: Vec<u32>,
    pub order_by: Option<String>,
}

/// Objects the reorganizer creates for one table.
#[derive(Debug, Clone, Default)]
pub struct Derived {
    pub pktype: bool,
    pub log: Option<Vec<LogEntry>>,
    pub trigger: bool,
    pub shadow: Option<Shadow>,
}

impl Derived {
    pub fn is_empty(&self) -> bool {
        !self.pktype && self.log.is_none() && !self.trigger && self.shadow.is_none()
    }
}

enum Undo {
    PkType(u32),
    Log(u32),
    Trigger(u32),
    Shadow(u32),
}

enum WriteOp {
    Insert(u32, i64, String),
    Update(u32, i64, String),
    Delete(u32, i64),
}

struct Snapshot {
    seq: u64,
    rows: HashMap<u32, BTreeMap<i64, String>>,
}

#[derive(Default)]
struct Proc {
    repack: bool,
    immune: bool,
    vxid: Option<String>,
    in_txn: bool,
    serializable: bool,
    snapshot: Option<Snapshot>,
    savepoints: Vec<String>,
    local_timeout_ms: u64,
    waiting: bool,
    cancel: bool,
    terminated: bool,
    undo: Vec<Undo>,
    pending: Vec<WriteOp>,
}

#[derive(Clone)]
pub enum Action {
    Fail(&'static str, String),
    Sleep(Duration),
    /// Drop the connection executing the statement.
    Terminate,
    Run(Arc<dyn Fn(&Arc<Engine>) + Send + Sync>),
}

struct Hook {
    needle: String,
    nth: Option<usize>,
    seen: usize,
    action: Action,
}

pub struct State {
    pub tables: BTreeMap<u32, Table>,
    pub derived: HashMap<u32, Derived>,
    procs: HashMap<i32, Proc>,
    locks: Vec<LockEntry>,
    pub advisory: HashMap<String, i32>,
    hooks: Vec<Hook>,
    next_pid: i32,
    next_vxid: u32,
    next_oid: u32,
    next_storage: u32,
    next_lock_id: u64,
    next_log_id: u64,
    seq: u64,
    /// Every statement as executed, with parameters bound, plus `-- ` events.
    pub journal: Vec<String>,
    /// Statement text as sent, with its parameters kept apart.
    pub calls: Vec<(String, Vec<String>)>,
    pub signals: Vec<(Instant, &'static str, i32)>,
    /// `(batch size, rows applied)` per replay call.
    pub applied: Vec<(usize, usize)>,
    /// `(index oid, backend pid)` per index built on a shadow table.
    pub built_indexes: Vec<(u32, i32)>,
    pub analyzed: Vec<String>,
    pub support_version: Option<String>,
    pub superuser: bool,
    pub server_version: i32,
    pub databases: Vec<String>,
    pub refuse_connections: bool,
}

pub struct Engine {
    pub name: String,
    state: Mutex<State>,
    cond: Condvar,
}

static ENGINES: AtomicUsize = AtomicUsize::new(0);

/// Text form of a bound parameter: strings unquoted, lists as `{a,b}`.
fn param_text(param: &(dyn ToSql + Sync)) -> String {
    let debug = format!("{param:?}");
    if let Some(items) = debug.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        let items: Vec<String> = items
            .split(", ")
            .filter(|item| !item.is_empty())
            .map(unquote)
            .collect();
        return format!("{{{}}}", items.join(","));
    }
    unquote(&debug)
}

fn unquote(debug: &str) -> String {
    let Some(inner) = debug.strip_prefix('"').and_then(|d| d.strip_suffix('"')) else {
        return debug.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// `sql` with each `$n` placeholder replaced by its quoted parameter, for
/// the journal and hook matching.
fn bind(sql: &str, params: &[&str]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(i) = rest.find('$') {
        out.push_str(&rest[..i]);
        let digits = rest[i + 1..].chars().take_while(char::is_ascii_digit).count();
        match rest[i + 1..i + 1 + digits].parse::<usize>().ok().and_then(|n| params.get(n.wrapping_sub(1))) {
            Some(value) => {
                out.push('\'');
                out.push_str(value);
                out.push('\'');
            }
            None => out.push_str(&rest[i..i + 1 + digits]),
        }
        rest = &rest[i + 1 + digits..];
    }
    out.push_str(rest);
    out
}

fn one(value: impl Into<String>) -> Vec<TextRow> {
    vec![vec![Some(value.into())]]
}

fn number_after(text: &str, marker: &str) -> Option<u32> {
    let start = text.find(marker)? + marker.len();
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn parse_array(array: &str) -> Vec<String> {
    array
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

impl Engine {
    pub fn new() -> Arc<Self> {
        let n = ENGINES.fetch_add(1, Ordering::SeqCst);
        Self::named(&format!("db_{n}"))
    }

    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Engine {
            name: name.to_string(),
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                derived: HashMap::new(),
                procs: HashMap::new(),
                locks: Vec::new(),
                advisory: HashMap::new(),
                hooks: Vec::new(),
                next_pid: 1000,
                next_vxid: 1,
                next_oid: 16384,
                next_storage: 50000,
                next_lock_id: 1,
                next_log_id: 1,
                seq: 0,
                journal: Vec::new(),
                calls: Vec::new(),
                signals: Vec::new(),
                applied: Vec::new(),
                built_indexes: Vec::new(),
                analyzed: Vec::new(),
                support_version: Some(program_version()),
                superuser: true,
                server_version: 160002,
                databases: Vec::new(),
                refuse_connections: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            engine: self.clone(),
        })
    }

    /// A table `public.<name>` with rows `1..=rows`, each `v<id>`.
    pub fn add_table(&self, name: &str, rows: i64, has_pk: bool, ckey: Option<&str>) -> u32 {
        let mut st = self.state();
        let oid = st.next_oid;
        st.next_oid += 100;
        let storage = st.next_storage;
        st.next_storage += 1;
        let qualified = format!("public.{name}");
        let indexes = if has_pk {
            vec![Index {
                oid: oid + 1,
                def: format!("CREATE UNIQUE INDEX {name}_pkey ON {qualified} USING btree (id)"),
                valid: true,
            }]
        } else {
            Vec::new()
        };
        st.tables.insert(
            oid,
            Table {
                name: qualified,
                oid,
                storage,
                rows: (1..=rows).map(|i| (i, format!("v{i}"))).collect(),
                has_pk,
                ckey: ckey.map(str::to_string),
                indexes,
                triggers: Vec::new(),
            },
        );
        oid
    }

    pub fn add_index(&self, oid: u32, column: &str, valid: bool) -> u32 {
        let mut st = self.state();
        let table = st.tables.get_mut(&oid).unwrap();
        let index_oid = oid + 1 + table.indexes.len() as u32;
        let def = format!(
            "CREATE INDEX idx_{index_oid} ON {} USING btree ({column})",
            table.name
        );
        table.indexes.push(Index {
            oid: index_oid,
            def,
            valid,
        });
        index_oid
    }

    pub fn add_trigger(&self, oid: u32, trigger: &str) {
        self.state()
            .tables
            .get_mut(&oid)
            .unwrap()
            .triggers
            .push(trigger.to_string());
    }

    pub fn table(&self, oid: u32) -> Table {
        self.state().tables[&oid].clone()
    }

    pub fn derived(&self, oid: u32) -> Derived {
        self.state().derived.get(&oid).cloned().unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Parameters of every call of exactly `sql`.
    pub fn calls(&self, sql: &str) -> Vec<Vec<String>> {
        self.state()
            .calls
            .iter()
            .filter(|(text, _)| text == sql)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.state().journal.iter().filter(|s| s.contains(needle)).count()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.state().journal.iter().position(|s| s.contains(needle))
    }

    pub fn signals(&self, kind: &str) -> Vec<Instant> {
        self.state()
            .signals
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(at, _, _)| *at)
            .collect()
    }

    /// Run `action` when a statement containing `needle` (in its template or
    /// bound text) is executed for the `nth` time, or every time.
    pub fn on(&self, needle: &str, nth: Option<usize>, action: Action) {
        self.state().hooks.push(Hook {
            needle: needle.to_string(),
            nth,
            seen: 0,
            action,
        });
    }

    pub fn fail_on(&self, needle: &str, nth: usize) {
        self.on(
            needle,
            Some(nth),
            Action::Fail("XX000", format!("injected failure at {needle}")),
        );
    }

    pub fn run_on(&self, needle: &str, nth: usize, f: impl Fn(&Arc<Engine>) + Send + Sync + 'static) {
        self.on(needle, Some(nth), Action::Run(Arc::new(f)));
    }

    pub fn writer(self: &Arc<Self>) -> Writer {
        let mut st = self.state();
        let pid = st.new_pid(false);
        Writer {
            engine: self.clone(),
            pid,
        }
    }

    fn before(&self, sql: &str, params: &[&str]) -> Vec<Action> {
        let mut st = self.state();
        let bound = bind(sql, params);
        let mut actions = Vec::new();
        for hook in st.hooks.iter_mut() {
            if sql.contains(&hook.needle) || bound.contains(&hook.needle) {
                hook.seen += 1;
                if hook.nth.is_none_or(|n| n == hook.seen) {
                    actions.push(hook.action.clone());
                }
            }
        }
        st.journal.push(bound);
        st.calls
            .push((sql.to_string(), params.iter().map(|p| p.to_string()).collect()));
        actions
    }

    fn exec(&self, pid: i32, sql: &str, params: &[&str]) -> Result<Vec<TextRow>, DbError> {
        let mut st = self.state();
        if st.procs.get(&pid).is_none_or(|p| p.terminated) {
            return Err(DbError::new(
                sql,
                Some("57P01"),
                "terminating connection due to administrator command",
            ));
        }
        st.take_snapshot_if_needed(pid, sql);
        if let Some(rest) = sql.strip_prefix("LOCK TABLE ") {
            let Some((name, mode)) = rest.split_once(" IN ") else {
                return Err(DbError::new(sql, Some("42601"), "syntax error"));
            };
            let mode = mode
                .strip_suffix(" MODE")
                .and_then(LockMode::parse)
                .ok_or_else(|| DbError::new(sql, Some("42601"), "bad lock mode"))?;
            let relid = st
                .oid_of(name)
                .ok_or_else(|| DbError::new(sql, Some("42P01"), format!("relation \"{name}\" does not exist")))?;
            let timeout = st.procs[&pid].local_timeout_ms;
            let deadline = (timeout > 0).then(|| Instant::now() + Duration::from_millis(timeout));
            let (st, result) = self.acquire(st, pid, relid, mode, deadline, sql);
            drop(st);
            self.cond.notify_all();
            return result.map(|()| Vec::new());
        }
        let result = st.run(pid, sql, params);
        drop(st);
        self.cond.notify_all();
        result
    }

    fn acquire<'a>(
        &'a self,
        mut st: MutexGuard<'a, State>,
        pid: i32,
        relid: u32,
        mode: LockMode,
        deadline: Option<Instant>,
        statement: &str,
    ) -> (MutexGuard<'a, State>, Result<(), DbError>) {
        let depth = st.procs.get(&pid).map_or(0, |p| p.savepoints.len());
        let id = st.next_lock_id;
        st.next_lock_id += 1;
        st.locks.push(LockEntry {
            id,
            pid,
            relid,
            mode,
            granted: false,
            depth,
        });
        if let Some(p) = st.procs.get_mut(&pid) {
            p.waiting = true;
            p.cancel = false;
        }
        loop {
            let outcome = match st.procs.get(&pid) {
                None => Some(Err(("57P01", "terminating connection"))),
                Some(p) if p.terminated => Some(Err((
                    "57P01",
                    "terminating connection due to administrator command",
                ))),
                Some(p) if p.cancel => Some(Err(("57014", "canceling statement due to user request"))),
                Some(_) if st.grantable(pid, relid, mode) => Some(Ok(())),
                Some(_) if deadline.is_some_and(|d| Instant::now() >= d) => Some(Err((
                    "57014",
                    "canceling statement due to statement timeout",
                ))),
                Some(_) => None,
            };
            match outcome {
                Some(result) => {
                    match result {
                        Ok(()) => {
                            if let Some(entry) = st.locks.iter_mut().find(|l| l.id == id) {
                                entry.granted = true;
                            }
                        }
                        Err(_) => st.locks.retain(|l| l.id != id),
                    }
                    if let Some(p) = st.procs.get_mut(&pid) {
                        p.waiting = false;
                        p.cancel = false;
                    }
                    let result = result.map_err(|(code, message)| DbError::new(statement, Some(code), message));
                    return (st, result);
                }
                None => st = self.cond.wait_timeout(st, POLL).unwrap().0,
            }
        }
    }

    fn cancel(&self, pid: i32) {
        let mut st = self.state();
        if let Some(p) = st.procs.get_mut(&pid) {
            if p.waiting {
                p.cancel = true;
            }
        }
        drop(st);
        self.cond.notify_all();
    }

    pub fn terminate(&self, pid: i32) {
        let mut st = self.state();
        st.terminate(pid, true);
        drop(st);
        self.cond.notify_all();
    }

    fn disconnect(&self, pid: i32) {
        let mut st = self.state();
        st.terminate(pid, true);
        st.procs.remove(&pid);
        drop(st);
        self.cond.notify_all();
    }
}

impl State {
    fn new_pid(&mut self, repack: bool) -> i32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.procs.insert(
            pid,
            Proc {
                repack,
                ..Proc::default()
            },
        );
        pid
    }

    fn oid_of(&self, name: &str) -> Option<u32> {
        let qualified = if name.contains('.') {
            name.to_string()
        } else {
            format!("public.{name}")
        };
        self.tables.values().find(|t| t.name == qualified).map(|t| t.oid)
    }

    fn grantable(&self, pid: i32, relid: u32, mode: LockMode) -> bool {
        !self
            .locks
            .iter()
            .any(|l| l.granted && l.pid != pid && l.relid == relid && l.mode.conflicts(mode))
    }

    fn take_snapshot_if_needed(&mut self, pid: i32, sql: &str) {
        let needed = self
            .procs
            .get(&pid)
            .is_some_and(|p| p.in_txn && p.serializable && p.snapshot.is_none());
        if !needed || sql.starts_with("BEGIN") {
            return;
        }
        let snapshot = Snapshot {
            seq: self.seq,
            rows: self.tables.iter().map(|(oid, t)| (*oid, t.rows.clone())).collect(),
        };
        if let Some(p) = self.procs.get_mut(&pid) {
            p.snapshot = Some(snapshot);
        }
    }

    fn proc_mut(&mut self, pid: i32) -> &mut Proc {
        self.procs.entry(pid).or_default()
    }

    fn undo(&mut self, undo: Undo) {
        let oid = match undo {
            Undo::PkType(oid) | Undo::Log(oid) | Undo::Trigger(oid) | Undo::Shadow(oid) => oid,
        };
        let Some(d) = self.derived.get_mut(&oid) else {
            return;
        };
        match undo {
            Undo::PkType(_) => d.pktype = false,
            Undo::Log(_) => d.log = None,
            Undo::Trigger(_) => d.trigger = false,
            Undo::Shadow(_) => d.shadow = None,
        }
        if d.is_empty() {
            self.derived.remove(&oid);
        }
    }

    fn end_txn(&mut self, pid: i32, commit: bool) {
        let undo = {
            let p = self.proc_mut(pid);
            p.in_txn = false;
            p.serializable = false;
            p.snapshot = None;
            p.savepoints.clear();
            p.local_timeout_ms = 0;
            std::mem::take(&mut p.undo)
        };
        if !commit {
            for u in undo.into_iter().rev() {
                self.undo(u);
            }
        }
        self.locks.retain(|l| l.pid != pid);
    }

    fn terminate(&mut self, pid: i32, disconnect: bool) -> bool {
        match self.procs.get_mut(&pid) {
            Some(p) if p.immune && !disconnect => return false,
            Some(p) => {
                p.terminated = true;
                p.vxid = None;
                p.pending.clear();
            }
            None => return false,
        }
        self.end_txn(pid, false);
        self.advisory.retain(|_, holder| *holder != pid);
        true
    }

    fn signal(&mut self, caller: i32, relid: u32, ddl_waiters_only: bool, terminate: bool) -> Vec<TextRow> {
        let mut pids: Vec<i32> = self
            .locks
            .iter()
            .filter(|l| l.relid == relid && l.pid != caller)
            .filter(|l| !ddl_waiters_only || (!l.granted && l.mode == LockMode::AccessExclusive))
            .map(|l| l.pid)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        let now = Instant::now();
        for pid in &pids {
            if terminate {
                self.terminate(*pid, false);
                self.signals.push((now, "terminate", *pid));
            } else {
                if let Some(p) = self.procs.get_mut(pid) {
                    if p.waiting {
                        p.cancel = true;
                    }
                }
                self.signals.push((now, "cancel", *pid));
            }
        }
        pids.iter().map(|_| vec![Some("t".to_string())]).collect()
    }

    fn metadata_row(table: &Table) -> TextRow {
        let oid = table.oid;
        let name = &table.name;
        let text = |s: String| Some(s);
        vec![
            text(name.clone()),
            text(oid.to_string()),
            table.has_pk.then(|| (oid + 1).to_string()),
            text(format!("CREATE TYPE repack.pk_{oid} AS (id bigint)")),
            text(format!(
                "CREATE TABLE repack.log_{oid} (id bigserial PRIMARY KEY, pk repack.pk_{oid}, row {name})"
            )),
            text(format!(
                "CREATE TRIGGER z_repack_trigger BEFORE INSERT OR DELETE OR UPDATE ON {name} FOR EACH ROW EXECUTE PROCEDURE repack.repack_trigger('repack.log_{oid}')"
            )),
            text(format!("ALTER TABLE {name} ENABLE ALWAYS TRIGGER z_repack_trigger")),
            text(format!(
                "CREATE TABLE repack.table_{oid} WITH (oids = false) AS SELECT id, val FROM ONLY {name}"
            )),
            None,
            text(format!("DELETE FROM repack.log_{oid}")),
            text(format!("LOCK TABLE {name} IN ACCESS EXCLUSIVE MODE")),
            table.ckey.clone(),
            text(format!("SELECT * FROM repack.log_{oid} ORDER BY id LIMIT $1")),
            text(format!("INSERT INTO repack.table_{oid} VALUES ($1.*)")),
            text(format!("DELETE FROM repack.table_{oid} WHERE (id) = ($1.id)")),
            text(format!("UPDATE repack.table_{oid} SET (id, val) = ($2.id, $2.val) WHERE (id) = ($1.id)")),
            text(format!("DELETE FROM repack.log_{oid} WHERE id IN (")),
        ]
    }

    fn run(&mut self, pid: i32, sql: &str, params: &[&str]) -> Result<Vec<TextRow>, DbError> {
        let err = |code: &str, message: String| DbError::new(sql, Some(code), message);
        let param_oid = |i: usize| -> Result<u32, DbError> {
            params
                .get(i)
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| err("22P02", format!("invalid oid parameter {i}")))
        };

        if sql::SESSION_SETUP.contains(&sql)
            || sql == sql::COPY_WORK_MEM
            || sql == sql::DISABLE_SYNC_SEQSCANS
            || sql == sql::DISABLE_AUTOVACUUM
        {
            return Ok(Vec::new());
        }
        if sql == sql::BEGIN_READ_COMMITTED || sql == sql::BEGIN_SERIALIZABLE {
            let p = self.proc_mut(pid);
            p.in_txn = true;
            p.serializable = sql == sql::BEGIN_SERIALIZABLE;
            return Ok(Vec::new());
        }
        if sql == sql::COMMIT || sql == sql::ROLLBACK {
            self.end_txn(pid, sql == sql::COMMIT);
            return Ok(Vec::new());
        }
        if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            let p = self.proc_mut(pid);
            if !p.in_txn {
                return Err(err("25P01", "SAVEPOINT can only be used in transaction blocks".into()));
            }
            p.savepoints.push(name.to_string());
            return Ok(Vec::new());
        }
        if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let p = self.proc_mut(pid);
            let Some(i) = p.savepoints.iter().rposition(|s| s == name) else {
                return Err(err("3B001", format!("savepoint \"{name}\" does not exist")));
            };
            p.savepoints.truncate(i + 1);
            p.local_timeout_ms = 0;
            self.locks.retain(|l| !(l.pid == pid && l.depth > i));
            return Ok(Vec::new());
        }
        if let Some(ms) = sql.strip_prefix("SET LOCAL statement_timeout = ") {
            let p = self.proc_mut(pid);
            if p.in_txn {
                p.local_timeout_ms = ms.parse().unwrap_or(0);
            }
            return Ok(Vec::new());
        }
        if sql == sql::RESET_STATEMENT_TIMEOUT {
            self.proc_mut(pid).local_timeout_ms = 0;
            return Ok(Vec::new());
        }
        if sql == sql::SERVER_VERSION {
            return Ok(one(self.server_version.to_string()));
        }
        if sql == sql::IS_SUPERUSER {
            return Ok(one(if self.superuser { "on" } else { "off" }));
        }
        if sql == sql::SUPPORT_VERSION {
            return match &self.support_version {
                Some(v) => Ok(vec![vec![Some(v.clone()), Some(v.clone())]]),
                None => Err(err("3F000", "schema \"repack\" does not exist".into())),
            };
        }
        if sql == sql::LIST_DATABASES {
            return Ok(self.databases.iter().map(|d| vec![Some(d.clone())]).collect());
        }
        if sql == sql::TRY_ADVISORY_LOCK {
            let key = params[0].to_string();
            return Ok(match self.advisory.get(&key).copied() {
                Some(holder) if holder != pid => one("f"),
                _ => {
                    self.advisory.insert(key, pid);
                    one("t")
                }
            });
        }
        if sql == sql::ADVISORY_UNLOCK {
            let key = params[0];
            let held = self.advisory.get(key) == Some(&pid);
            if held {
                self.advisory.remove(key);
            }
            return Ok(one(if held { "t" } else { "f" }));
        }
        if sql.starts_with("SELECT relname::text, relid::text") {
            let selected: Vec<&Table> = if params.is_empty() {
                let need_ck = sql.contains("ckid IS NOT NULL");
                self.tables
                    .values()
                    .filter(|t| t.has_pk && (!need_ck || t.ckey.is_some()))
                    .collect()
            } else {
                let mut selected = Vec::new();
                for name in params {
                    let oid = self
                        .oid_of(name)
                        .ok_or_else(|| err("42P01", format!("relation \"{name}\" does not exist")))?;
                    selected.push(&self.tables[&oid]);
                }
                selected
            };
            return Ok(selected.into_iter().map(State::metadata_row).collect());
        }
        if sql == sql::CONFLICTED_TRIGGERS {
            let oid = param_oid(0)?;
            let mut conflicts: Vec<String> = self.tables[&oid]
                .triggers
                .iter()
                .filter(|t| t.as_str() >= sql::CAPTURE_TRIGGER)
                .cloned()
                .collect();
            if self.derived.get(&oid).is_some_and(|d| d.trigger) {
                conflicts.push(sql::CAPTURE_TRIGGER.to_string());
            }
            return Ok(conflicts.into_iter().map(|t| vec![Some(t)]).collect());
        }
        if sql.starts_with("CREATE TYPE repack.pk_") {
            let oid = number_after(sql, "repack.pk_").unwrap_or(0);
            let d = self.derived.entry(oid).or_default();
            if d.pktype {
                return Err(err("42710", format!("type \"pk_{oid}\" already exists")));
            }
            d.pktype = true;
            self.proc_mut(pid).undo.push(Undo::PkType(oid));
            return Ok(Vec::new());
        }
        if sql.starts_with("CREATE TABLE repack.log_") {
            let oid = number_after(sql, "repack.log_").unwrap_or(0);
            let d = self.derived.entry(oid).or_default();
            if d.log.is_some() {
                return Err(err("42P07", format!("relation \"log_{oid}\" already exists")));
            }
            d.log = Some(Vec::new());
            self.proc_mut(pid).undo.push(Undo::Log(oid));
            return Ok(Vec::new());
        }
        if sql.starts_with("CREATE TRIGGER ") {
            let oid = number_after(sql, "repack.log_").unwrap_or(0);
            self.derived.entry(oid).or_default().trigger = true;
            self.proc_mut(pid).undo.push(Undo::Trigger(oid));
            return Ok(Vec::new());
        }
        if sql.starts_with("ALTER TABLE ") && sql.ends_with("ENABLE ALWAYS TRIGGER z_repack_trigger") {
            return Ok(Vec::new());
        }
        if sql == sql::XID_SNAPSHOT_90200 || sql == sql::XID_SNAPSHOT_90000 {
            let peer: i32 = params.first().and_then(|p| p.parse().ok()).unwrap_or(0);
            let mut vxids: Vec<String> = self
                .procs
                .iter()
                .filter(|(p, proc_)| **p != pid && **p != peer && !proc_.repack)
                .filter_map(|(_, proc_)| proc_.vxid.clone())
                .collect();
            vxids.sort();
            return Ok(if vxids.is_empty() {
                vec![vec![None]]
            } else {
                one(format!("{{{}}}", vxids.join(",")))
            });
        }
        if sql.starts_with("DELETE FROM repack.log_") {
            let oid = number_after(sql, "repack.log_").unwrap_or(0);
            let horizon = self.procs.get(&pid).and_then(|p| p.snapshot.as_ref()).map(|s| s.seq);
            let Some(log) = self.derived.get_mut(&oid).and_then(|d| d.log.as_mut()) else {
                return Err(err("42P01", format!("relation \"repack.log_{oid}\" does not exist")));
            };
            match horizon {
                Some(seq) => log.retain(|e| e.seq > seq),
                None => log.clear(),
            }
            return Ok(Vec::new());
        }
        if sql.starts_with("CREATE TABLE repack.table_") {
            let oid = number_after(sql, "repack.table_").unwrap_or(0);
            let rows = self
                .procs
                .get(&pid)
                .and_then(|p| p.snapshot.as_ref())
                .and_then(|s| s.rows.get(&oid).cloned())
                .unwrap_or_else(|| self.tables[&oid].rows.clone());
            let order_by = sql.split_once(" ORDER BY ").map(|(_, key)| key.to_string());
            let storage = self.next_storage;
            self.next_storage += 1;
            let d = self.derived.entry(oid).or_default();
            if d.shadow.is_some() {
                return Err(err("42P07", format!("relation \"table_{oid}\" already exists")));
            }
            d.shadow = Some(Shadow {
                rows,
                storage,
                indexes: Vec::new(),
                order_by,
            });
            self.proc_mut(pid).undo.push(Undo::Shadow(oid));
            return Ok(Vec::new());
        }
        if sql == sql::INVALID_INDEXES || sql == sql::VALID_INDEXES {
            let oid = param_oid(0)?;
            let valid = sql == sql::VALID_INDEXES;
            return Ok(self.tables[&oid]
                .indexes
                .iter()
                .filter(|i| i.valid == valid)
                .map(|i| {
                    if valid {
                        vec![Some(i.oid.to_string()), Some(i.def.clone())]
                    } else {
                        vec![Some(i.def.clone())]
                    }
                })
                .collect());
        }
        if sql.starts_with("CREATE INDEX ") || sql.starts_with("CREATE UNIQUE INDEX ") {
            let index_oid = number_after(sql, "index_").unwrap_or(0);
            let oid = number_after(sql, "repack.table_").unwrap_or(0);
            let Some(shadow) = self.derived.get_mut(&oid).and_then(|d| d.shadow.as_mut()) else {
                return Err(err("42P01", format!("relation \"repack.table_{oid}\" does not exist")));
            };
            shadow.indexes.push(index_oid);
            self.built_indexes.push((index_oid, pid));
            return Ok(Vec::new());
        }
        if sql == sql::APPLY_LOG {
            let oid = params.first().and_then(|p| number_after(p, "repack.log_")).unwrap_or(0);
            let count: usize = params.get(5).and_then(|c| c.parse().ok()).unwrap_or(0);
            let Some(Derived {
                log: Some(log),
                shadow: Some(shadow),
                ..
            }) = self.derived.get_mut(&oid)
            else {
                return Err(err("42P01", format!("relation \"repack.log_{oid}\" does not exist")));
            };
            let n = if count == 0 { log.len() } else { count.min(log.len()) };
            for entry in log.drain(..n) {
                match (entry.pk, entry.row) {
                    (None, Some((id, val))) => {
                        shadow.rows.insert(id, val);
                    }
                    (Some(pk), None) => {
                        shadow.rows.remove(&pk);
                    }
                    (Some(pk), Some((id, val))) => {
                        shadow.rows.remove(&pk);
                        shadow.rows.insert(id, val);
                    }
                    (None, None) => {}
                }
            }
            self.applied.push((count, n));
            return Ok(one(n.to_string()));
        }
        if sql == sql::SWAP {
            let oid = param_oid(0)?;
            let State { tables, derived, journal, .. } = self;
            let (Some(table), Some(shadow)) = (
                tables.get_mut(&oid),
                derived.get_mut(&oid).and_then(|d| d.shadow.as_mut()),
            ) else {
                return Err(err("XX000", format!("no shadow table for {oid}")));
            };
            std::mem::swap(&mut table.rows, &mut shadow.rows);
            std::mem::swap(&mut table.storage, &mut shadow.storage);
            journal.push(format!("-- swapped {oid}"));
            return Ok(one(""));
        }
        if sql == sql::DROP {
            let oid = param_oid(0)?;
            self.derived.remove(&oid);
            return Ok(one(""));
        }
        if sql == sql::XID_ALIVE {
            let wanted = parse_array(params.first().copied().unwrap_or("{}"));
            let mut pids: Vec<i32> = self
                .procs
                .iter()
                .filter(|(p, proc_)| **p != pid && proc_.vxid.as_ref().is_some_and(|v| wanted.contains(v)))
                .map(|(p, _)| *p)
                .collect();
            pids.sort_unstable();
            return Ok(pids.into_iter().map(|p| vec![Some(p.to_string())]).collect());
        }
        if sql == sql::CANCEL_CONFLICTING || sql == sql::TERMINATE_CONFLICTING {
            let oid = param_oid(0)?;
            return Ok(self.signal(pid, oid, false, sql == sql::TERMINATE_CONFLICTING));
        }
        if sql == sql::CANCEL_COMPETING_DDL || sql == sql::TERMINATE_COMPETING_DDL {
            let oid = param_oid(0)?;
            return Ok(self.signal(pid, oid, true, sql == sql::TERMINATE_COMPETING_DDL));
        }
        if let Some(name) = sql.strip_prefix("ANALYZE ") {
            self.analyzed.push(name.to_string());
            return Ok(Vec::new());
        }
        Err(err("42601", format!("syntax error in simulated statement: {sql}")))
    }
}

struct FakeConnector {
    engine: Arc<Engine>,
}

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn Backend>, DbError> {
        let mut st = self.engine.state();
        if st.refuse_connections {
            return Err(DbError::new("connect", Some("08006"), "connection refused"));
        }
        let pid = st.new_pid(true);
        Ok(Box::new(FakeBackend {
            engine: self.engine.clone(),
            pid,
        }))
    }

    fn database(&self) -> &str {
        &self.engine.name
    }
}

struct FakeBackend {
    engine: Arc<Engine>,
    pid: i32,
}

impl Backend for FakeBackend {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<TextRow>, DbError> {
        let params: Vec<String> = params.iter().map(|p| param_text(*p)).collect();
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        let params = params.as_slice();
        for action in self.engine.before(sql, params) {
            match action {
                Action::Fail(code, message) => return Err(DbError::new(sql, Some(code), message)),
                Action::Sleep(d) => thread::sleep(d),
                Action::Terminate => {
                    self.engine.terminate(self.pid);
                    return Err(DbError::new(
                        sql,
                        Some("57P01"),
                        "terminating connection due to administrator command",
                    ));
                }
                Action::Run(f) => f(&self.engine),
            }
        }
        self.engine.exec(self.pid, sql, params)
    }

    fn backend_pid(&self) -> i32 {
        self.pid
    }

    fn is_closed(&self) -> bool {
        self.engine
            .state()
            .procs
            .get(&self.pid)
            .is_none_or(|p| p.terminated)
    }

    fn canceller(&self) -> Arc<dyn Canceller> {
        Arc::new(FakeCanceller {
            engine: self.engine.clone(),
            pid: self.pid,
        })
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.engine.disconnect(self.pid);
    }
}

struct FakeCanceller {
    engine: Arc<Engine>,
    pid: i32,
}

impl Canceller for FakeCanceller {
    fn cancel(&self) -> Result<(), DbError> {
        self.engine.cancel(self.pid);
        Ok(())
    }
}

/// An application session writing to tables directly, outside the reorganizer.
pub struct Writer {
    engine: Arc<Engine>,
    pub pid: i32,
}

impl Writer {
    pub fn begin(&self) {
        let mut st = self.engine.state();
        let vxid = format!("{}/{}", self.pid, st.next_vxid);
        st.next_vxid += 1;
        let p = st.proc_mut(self.pid);
        p.vxid = Some(vxid);
        p.in_txn = true;
    }

    /// Never gives in to pg_terminate_backend.
    pub fn immune(&self) {
        self.engine.state().proc_mut(self.pid).immune = true;
    }

    pub fn lock(&self, table: &str, mode: LockMode, timeout: Duration) -> Result<(), DbError> {
        let st = self.engine.state();
        let relid = st
            .oid_of(table)
            .ok_or_else(|| DbError::new("LOCK TABLE", Some("42P01"), "no such table"))?;
        if !st.procs[&self.pid].in_txn {
            drop(st);
            self.begin();
            return self.lock(table, mode, timeout);
        }
        let deadline = Some(Instant::now() + timeout);
        let (st, result) = self.engine.acquire(st, self.pid, relid, mode, deadline, "LOCK TABLE");
        drop(st);
        self.engine.cond.notify_all();
        result
    }

    fn write(&self, table: &str, op: impl FnOnce(u32) -> WriteOp) -> Result<(), DbError> {
        self.lock(table, LockMode::RowExclusive, WRITER_LOCK_TIMEOUT)?;
        let mut st = self.engine.state();
        let oid = st.oid_of(table).unwrap_or(0);
        st.proc_mut(self.pid).pending.push(op(oid));
        Ok(())
    }

    pub fn insert(&self, table: &str, id: i64, val: &str) -> Result<(), DbError> {
        self.write(table, |oid| WriteOp::Insert(oid, id, val.to_string()))
    }

    pub fn update(&self, table: &str, id: i64, val: &str) -> Result<(), DbError> {
        self.write(table, |oid| WriteOp::Update(oid, id, val.to_string()))
    }

    pub fn delete(&self, table: &str, id: i64) -> Result<(), DbError> {
        self.write(table, |oid| WriteOp::Delete(oid, id))
    }

    pub fn commit(&self) -> Result<(), DbError> {
        let mut st = self.engine.state();
        if st.procs.get(&self.pid).is_none_or(|p| p.terminated) {
            return Err(DbError::new("COMMIT", Some("57P01"), "connection terminated"));
        }
        let ops = std::mem::take(&mut st.proc_mut(self.pid).pending);
        st.seq += 1;
        let seq = st.seq;
        let State {
            tables,
            derived,
            next_log_id,
            ..
        } = &mut *st;
        for op in ops {
            let (oid, entry) = match op {
                WriteOp::Insert(oid, id, val) => {
                    tables.get_mut(&oid).unwrap().rows.insert(id, val.clone());
                    (oid, (None, Some((id, val))))
                }
                WriteOp::Update(oid, id, val) => {
                    tables.get_mut(&oid).unwrap().rows.insert(id, val.clone());
                    (oid, (Some(id), Some((id, val))))
                }
                WriteOp::Delete(oid, id) => {
                    tables.get_mut(&oid).unwrap().rows.remove(&id);
                    (oid, (Some(id), None))
                }
            };
            if let Some(Derived {
                trigger: true,
                log: Some(log),
                ..
            }) = derived.get_mut(&oid)
            {
                log.push(LogEntry {
                    id: *next_log_id,
                    seq,
                    pk: entry.0,
                    row: entry.1,
                });
                *next_log_id += 1;
            }
        }
        let p = st.proc_mut(self.pid);
        p.vxid = None;
        st.end_txn(self.pid, true);
        st.journal.push(format!("-- writer {} commit", self.pid));
        drop(st);
        self.engine.cond.notify_all();
        Ok(())
    }

    pub fn rollback(&self) {
        let mut st = self.engine.state();
        let p = st.proc_mut(self.pid);
        p.pending.clear();
        p.vxid = None;
        st.end_txn(self.pid, false);
        drop(st);
        self.engine.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.engine
            .state()
            .procs
            .get(&self.pid)
            .is_none_or(|p| p.terminated)
    }
}

pub fn config(database: &str, tables: &[&str]) -> ReorgConfig {
    ReorgConfig {
        connection: postgres::Config::new(),
        dbname: database.to_string(),
        scope: if tables.is_empty() {
            Scope::Database
        } else {
            Scope::Tables(tables.iter().map(|t| t.to_string()).collect())
        },
        order: OrderMode::ClusterKey,
        wait_timeout: Duration::from_secs(1),
        jobs: 0,
        analyze: true,
        dry_run: false,
    }
}

pub fn run(engine: &Arc<Engine>, config: &ReorgConfig) -> Result<Vec<DatabaseReport>, ReorgError> {
    let engine = engine.clone();
    let factory = move |_database: &str| -> Result<Arc<dyn Connector>, ReorgError> { Ok(engine.connector()) };
    Coordinator::new(config).run(&factory)
}

/// Several databases; the first answers the database list.
pub fn run_cluster(engines: &[Arc<Engine>], config: &ReorgConfig) -> Result<Vec<DatabaseReport>, ReorgError> {
    let names: Vec<String> = engines.iter().map(|e| e.name.clone()).collect();
    engines[0].state().databases = names;
    let engines: Vec<Arc<Engine>> = engines.to_vec();
    let factory = move |database: &str| -> Result<Arc<dyn Connector>, ReorgError> {
        engines
            .iter()
            .find(|e| e.name == database)
            .map(|e| e.connector())
            .ok_or_else(|| ReorgError::Connect {
                database: database.to_string(),
                reason: "no such database".into(),
            })
    };
    Coordinator::new(config).run(&factory)
}
