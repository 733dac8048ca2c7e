// index.rs
//! Rebuilds the source table's indexes on the shadow table, either in
//! order on the primary session or greedily across worker sessions.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use pg_query::NodeEnum;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DbError, ReorgError, Result};
use crate::interrupt;
use crate::session::{Completion, Session, SessionSet};
use crate::{params, sql};
use crate::target::ReorgTarget;

/// How long to wait for any worker before checking for an interrupt again.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Unprocessed,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexJob {
    pub index_oid: u32,
    pub create_sql: String,
    pub status: JobStatus,
    pub worker: Option<usize>,
}

impl IndexJob {
    pub fn new(index_oid: u32, create_sql: String) -> Self {
        Self {
            index_oid,
            create_sql,
            status: JobStatus::Unprocessed,
            worker: None,
        }
    }
}

/// Rewrite a `pg_get_indexdef` result to build `index_<index_oid>` on the
/// shadow table of `target_oid`.
pub fn rewrite_index_def(indexdef: &str, index_oid: u32, target_oid: u32) -> Result<String, ConfigError> {
    let unexpected = || ConfigError::UnexpectedIndexDef(indexdef.to_string());
    let trimmed = indexdef.trim_start();
    if !(trimmed.starts_with("CREATE INDEX") || trimmed.starts_with("CREATE UNIQUE INDEX")) {
        return Err(unexpected());
    }
    let mut parsed = pg_query::parse(indexdef).map_err(|_| unexpected())?;
    let mut rewritten = false;
    for stmt in &mut parsed.protobuf.stmts {
        if let Some(NodeEnum::IndexStmt(index)) = stmt.stmt.as_mut().and_then(|s| s.node.as_mut()) {
            index.idxname = ReorgTarget::shadow_index(index_oid);
            let relation = index.relation.as_mut().ok_or_else(unexpected)?;
            relation.schemaname = "repack".to_string();
            relation.relname = format!("table_{target_oid}");
            rewritten = true;
        }
    }
    if !rewritten {
        return Err(unexpected());
    }
    pg_query::deparse(&parsed.protobuf).map_err(|_| unexpected())
}

/// Index jobs for every valid index on the target. Invalid indexes are
/// reported and left out.
pub fn collect_jobs(session: &mut Session, target: &ReorgTarget) -> Result<Vec<IndexJob>> {
    for row in session.execute(sql::INVALID_INDEXES, params![target.oid])? {
        if let Some(def) = row.into_iter().next().flatten() {
            warn!("skipping invalid index: {def}");
        }
    }
    let mut jobs = Vec::new();
    for row in session.execute(sql::VALID_INDEXES, params![target.oid])? {
        let mut cols = row.into_iter();
        let (Some(oid), Some(def)) = (cols.next().flatten(), cols.next().flatten()) else {
            continue;
        };
        let index_oid: u32 = oid
            .parse()
            .map_err(|_| DbError::new(sql::VALID_INDEXES, None, format!("bad index oid {oid}")))?;
        let create_sql = rewrite_index_def(&def, index_oid, target.oid)?;
        jobs.push(IndexJob::new(index_oid, create_sql));
    }
    Ok(jobs)
}

/// Build every index of `target` on its shadow table. Returns how many were built.
pub fn rebuild_indexes(sessions: &mut SessionSet, target: &ReorgTarget) -> Result<usize> {
    let mut jobs = collect_jobs(&mut sessions.primary, target)?;
    if jobs.is_empty() {
        return Ok(0);
    }
    if sessions.workers.len() <= 1 {
        info!("building {} index(es) on {}", jobs.len(), target.shadow_table());
        build_in_order(&mut sessions.primary, &mut jobs)?;
    } else {
        info!(
            "building {} index(es) on {} with {} workers",
            jobs.len(),
            target.shadow_table(),
            sessions.workers.len()
        );
        WorkerPool::new(&mut sessions.workers).run(&mut jobs)?;
    }
    Ok(jobs.len())
}

fn build_in_order(session: &mut Session, jobs: &mut [IndexJob]) -> Result<()> {
    for job in jobs.iter_mut() {
        job.status = JobStatus::InProgress;
        if let Err(source) = session.try_execute(&job.create_sql, params![])? {
            return Err(ReorgError::IndexBuild {
                index: job.create_sql.clone(),
                source,
            });
        }
        job.status = JobStatus::Finished;
    }
    Ok(())
}

/// Greedy ready-queue over worker sessions: whichever worker finishes first
/// takes the next unprocessed job.
pub struct WorkerPool<'a> {
    workers: &'a mut [Session],
}

impl<'a> WorkerPool<'a> {
    pub fn new(workers: &'a mut [Session]) -> Self {
        Self { workers }
    }

    pub fn run(&mut self, jobs: &mut [IndexJob]) -> Result<()> {
        let (notify, completions) = mpsc::channel::<Completion>();
        let mut ready: VecDeque<usize> = (0..jobs.len()).collect();
        for worker in 0..self.workers.len().min(jobs.len()) {
            if let Some(next) = ready.pop_front() {
                self.dispatch(jobs, next, worker, &notify)?;
            }
        }
        while jobs.iter().any(|job| job.status == JobStatus::InProgress) {
            interrupt::check()?;
            let completion = match completions.recv_timeout(POLL_TIMEOUT) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DbError::new("index build", None, "worker channel closed").into());
                }
            };
            let job = &mut jobs[completion.tag];
            let Some(worker) = job.worker.take() else {
                continue;
            };
            self.workers[worker].finish_dispatch()?;
            if let Err(source) = completion.outcome {
                return Err(ReorgError::IndexBuild {
                    index: job.create_sql.clone(),
                    source,
                });
            }
            job.status = JobStatus::Finished;
            debug!(worker, "built index_{}", job.index_oid);
            if let Some(next) = ready.pop_front() {
                self.dispatch(jobs, next, worker, &notify)?;
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        jobs: &mut [IndexJob],
        job: usize,
        worker: usize,
        notify: &mpsc::Sender<Completion>,
    ) -> Result<()> {
        self.workers[worker].dispatch(&jobs[job].create_sql, job, notify)?;
        jobs[job].status = JobStatus::InProgress;
        jobs[job].worker = Some(worker);
        Ok(())
    }
}
