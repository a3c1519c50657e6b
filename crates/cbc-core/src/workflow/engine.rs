//! Executes runs against the state machine.
//!
//! A run advances through states until it reaches a terminal state or a task
//! fails with a retryable error. In the latter case the engine stores the
//! wake-up time in the run's durable timer and returns; a later [`Engine::tick`]
//! (in this process or another one sharing the database) picks it up.
//!
//! A run is claimed before it is advanced and stays `Running` until it
//! suspends or terminates, so concurrent workers never share a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::endpoint::EvaluationEndpoint;
use crate::error::{CbcError, Result};
use crate::event::TriggerEvent;
use crate::locator::ObjectLocator;
use crate::paths;
use crate::store::{ComplianceStore, ObjectStore, UrlReader};
use crate::tasks::{
    ComplianceStatus, ComplianceVerifier, EvaluationPublisher, ExistencePoller, InputMode,
    OrderingTimestamp, ReportFetcher, ReportSource, Submitter, VerifyRequest,
};
use crate::workflow::clock::{Clock, SystemClock};
use crate::workflow::db::RunDb;
use crate::workflow::definition::{Condition, State, StateMachine, TaskKind};
use crate::workflow::run::{Run, RunStatus, StepOutcome, StepRecord};

/// How long `run_to_completion` waits before re-checking a run that another
/// worker currently holds in `Running`.
const RUNNING_RECHECK: Duration = Duration::from_millis(250);

/// External collaborators, injected so that tests can substitute fakes.
#[derive(Clone)]
pub struct Services {
    pub objects: Arc<dyn ObjectStore>,
    pub compliance: Arc<dyn ComplianceStore>,
    pub endpoint: Arc<dyn EvaluationEndpoint>,
    pub urls: Option<Arc<UrlReader>>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub orchestrator_id: String,
    pub raw_input_bucket: String,
    /// When set, report locators outside this bucket are logged.
    pub results_bucket: Option<String>,
    pub environment: String,
    pub input_mode: InputMode,
    pub ordering_timestamp: OrderingTimestamp,
}

/// Outcome counts for one pass over the due runs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub suspended: usize,
}

pub struct Engine {
    definition: StateMachine,
    db: RunDb,
    compliance: Arc<dyn ComplianceStore>,
    submitter: Submitter,
    poller: ExistencePoller,
    fetcher: ReportFetcher,
    verifier: ComplianceVerifier,
    publisher: EvaluationPublisher,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    /// Serializes run advancement within one process.
    advance_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        definition: StateMachine,
        db: RunDb,
        services: Services,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        definition.validate()?;
        info!(
            objects = services.objects.backend(),
            compliance = services.compliance.backend(),
            "engine ready"
        );
        let source = ReportSource::new(services.objects.clone(), services.urls.clone());
        Ok(Self {
            submitter: Submitter::new(
                services.objects.clone(),
                services.endpoint.clone(),
                settings.raw_input_bucket.clone(),
                settings.environment.clone(),
                settings.input_mode,
            ),
            poller: ExistencePoller::new(source.clone()),
            fetcher: ReportFetcher::new(source),
            verifier: ComplianceVerifier::new(services.compliance.clone()),
            publisher: EvaluationPublisher::new(
                services.compliance.clone(),
                settings.ordering_timestamp,
            ),
            compliance: services.compliance,
            definition,
            db,
            settings,
            clock,
            advance_lock: Mutex::new(()),
        })
    }

    /// Build an engine for the project at `root` from its configuration,
    /// using real service clients and the system clock.
    pub fn open(root: &Path, config: &Config) -> Result<Self> {
        let db = RunDb::open(&paths::runs_db_path(root))?;
        let services = config.services(root)?;
        let definition = StateMachine::standard(&config.definition_params());
        Self::new(definition, db, services, config.engine_settings(), Arc::new(SystemClock))
    }

    pub fn definition(&self) -> &StateMachine {
        &self.definition
    }

    pub fn db(&self) -> &RunDb {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Intake and scheduling
    // -----------------------------------------------------------------------

    /// Accept an event: create its run, due immediately.
    pub fn start(&self, event: TriggerEvent) -> Result<Run> {
        self.compliance.observe_trigger(&event)?;
        let run = Run::new(
            &self.settings.orchestrator_id,
            event,
            &self.definition.start_at,
            self.clock.now(),
        );
        self.db.save(&run)?;
        info!(
            run_id = %run.id,
            rule = %run.event.config_rule_name,
            resource_id = %run.event.resource_id,
            "run started"
        );
        Ok(run)
    }

    /// Advance every run whose timer has expired.
    pub fn tick(&self) -> Result<TickReport> {
        let _guard = self.lock()?;
        let now = self.clock.now();
        let mut report = TickReport::default();
        for due in self.db.range_due(now)? {
            let Some(run) = self.db.claim(due.id, now)? else {
                debug!(run_id = %due.id, "run claimed elsewhere");
                continue;
            };
            report.due += 1;
            let run = self.advance(run)?;
            match run.status {
                RunStatus::Succeeded => report.succeeded += 1,
                RunStatus::Failed { .. } => report.failed += 1,
                RunStatus::Pending | RunStatus::Running => report.suspended += 1,
            }
        }
        if report.due > 0 {
            debug!(?report, "tick");
        }
        Ok(report)
    }

    /// Drive one run until it terminates, sleeping on the clock across
    /// retry delays.
    pub fn run_to_completion(&self, id: Uuid) -> Result<Run> {
        loop {
            let run = self.db.get(id)?;
            if run.is_terminal() {
                return Ok(run);
            }
            let now = self.clock.now();
            match run.status {
                RunStatus::Pending if run.next_tick_at <= now => {
                    let _guard = self.lock()?;
                    // Another worker may have advanced it while we waited.
                    if let Some(run) = self.db.claim(id, self.clock.now())? {
                        self.advance(run)?;
                    }
                }
                RunStatus::Pending => {
                    let wait = (run.next_tick_at - now).to_std().unwrap_or(Duration::ZERO);
                    self.clock.sleep(wait);
                }
                _ => self.clock.sleep(RUNNING_RECHECK),
            }
        }
    }

    /// Re-queue runs interrupted mid-task. Call once at worker startup.
    pub fn recover(&self, max_age: Duration) -> Result<u32> {
        let n = self.db.startup_recovery(max_age, self.clock.now())?;
        if n > 0 {
            warn!(count = n, "re-queued interrupted runs");
        }
        Ok(n)
    }

    /// Delete finished runs older than `retention`.
    pub fn prune(&self, retention: Duration) -> Result<u32> {
        let n = self.db.prune_finished(retention, self.clock.now())?;
        if n > 0 {
            info!(count = n, retention_secs = retention.as_secs(), "pruned finished runs");
        }
        Ok(n)
    }

    /// When the next timer fires, if any run is waiting.
    pub fn next_wake(&self) -> Result<Option<DateTime<Utc>>> {
        self.db.next_due_at()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.advance_lock
            .lock()
            .map_err(|_| CbcError::RunDb("engine lock poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // State execution
    // -----------------------------------------------------------------------

    fn advance(&self, mut run: Run) -> Result<Run> {
        loop {
            let name = run.state.clone();
            let state = self.definition.state(&name)?.clone();
            match state {
                State::Choice { choices, default } => {
                    let next = choices
                        .iter()
                        .find(|c| self.holds(c.condition, &run))
                        .map(|c| c.next.clone())
                        .unwrap_or(default);
                    debug!(run_id = %run.id, state = %name, next = %next, "choice");
                    run.state = next;
                }
                State::Pass { next } => run.state = next,
                State::Succeed => {
                    run.status = RunStatus::Succeeded;
                    run.updated_at = self.clock.now();
                    self.db.save(&run)?;
                    info!(run_id = %run.id, state = %name, "run succeeded");
                    return Ok(run);
                }
                State::Fail { error, cause } => {
                    let cause = cause
                        .or_else(|| run.context.last_error.clone())
                        .unwrap_or_default();
                    warn!(run_id = %run.id, error = %error, cause = %cause, "run failed");
                    run.status = RunStatus::Failed { error, cause };
                    run.updated_at = self.clock.now();
                    self.db.save(&run)?;
                    return Ok(run);
                }
                State::Task {
                    resource,
                    next,
                    retry,
                    catch,
                } => {
                    let attempt = run.attempts_for(&name) + 1;
                    run.attempts.insert(name.clone(), attempt);
                    let started_at = self.clock.now();
                    run.status = RunStatus::Running;
                    run.updated_at = started_at;
                    self.db.save(&run)?;

                    debug!(run_id = %run.id, state = %name, attempt, "task started");
                    let result = self.execute(resource, &mut run);
                    let finished_at = self.clock.now();
                    let record = |outcome: StepOutcome| StepRecord {
                        state: name.clone(),
                        attempt,
                        started_at,
                        finished_at,
                        outcome,
                    };

                    let err = match result {
                        Ok(()) => {
                            run.history.push(record(StepOutcome::Completed));
                            run.state = next;
                            run.next_tick_at = finished_at;
                            run.updated_at = finished_at;
                            self.db.save(&run)?;
                            continue;
                        }
                        Err(e) => e,
                    };

                    let kind = err.kind();
                    run.context.last_error = Some(err.to_string());

                    let delay = retry
                        .iter()
                        .find(|p| p.matches(kind))
                        .and_then(|p| p.delay_for(attempt));
                    if let Some(delay) = delay {
                        let retry_at = finished_at
                            + chrono::Duration::from_std(delay).map_err(|e| CbcError::RunDb(e.to_string()))?;
                        info!(
                            run_id = %run.id,
                            state = %name,
                            attempt,
                            error = %kind,
                            delay_ms = delay.as_millis() as u64,
                            "task will be retried"
                        );
                        run.history.push(record(StepOutcome::Retrying {
                            error: kind.to_string(),
                            retry_at,
                        }));
                        run.status = RunStatus::Pending;
                        run.next_tick_at = retry_at;
                        run.updated_at = finished_at;
                        self.db.save(&run)?;
                        return Ok(run);
                    }

                    if let Some(rule) = catch.iter().find(|c| c.matches(kind)) {
                        info!(run_id = %run.id, state = %name, error = %kind, next = %rule.next, "task error caught");
                        run.history.push(record(StepOutcome::Caught {
                            error: kind.to_string(),
                            next: rule.next.clone(),
                        }));
                        run.state = rule.next.clone();
                        run.updated_at = finished_at;
                        continue;
                    }

                    warn!(run_id = %run.id, state = %name, error = %err, "task failed");
                    run.history.push(record(StepOutcome::Failed {
                        error: kind.to_string(),
                    }));
                    run.status = RunStatus::Failed {
                        error: kind.to_string(),
                        cause: err.to_string(),
                    };
                    run.updated_at = finished_at;
                    self.db.save(&run)?;
                    return Ok(run);
                }
            }
        }
    }

    fn holds(&self, condition: Condition, run: &Run) -> bool {
        match condition {
            Condition::ResourceDeleted => run.event.is_resource_deleted(),
            Condition::FinalStatusMatchesVerdict => match (run.context.verdict, run.context.final_status) {
                (Some(verdict), Some(status)) => ComplianceStatus::from_verdict(verdict) == status,
                _ => false,
            },
        }
    }

    fn execute(&self, task: TaskKind, run: &mut Run) -> Result<()> {
        match task {
            TaskKind::SubmitRequest => {
                if run.context.ack.is_some() && run.context.report_locator.is_some() {
                    debug!(run_id = %run.id, "submission already acknowledged");
                    return Ok(());
                }
                let ack = self.submitter.submit(&run.event)?;
                let locator = ack.results_report_locator()?;
                self.check_results_bucket(run, &locator);
                run.context.ack = Some(ack);
                run.context.report_locator = Some(locator);
            }
            TaskKind::QueryComplianceInitial => {
                let status = self.verifier.verify(&verify_request(run, None))?;
                run.context.initial_status = Some(status);
            }
            TaskKind::PollForReport => {
                self.poller.check_exists(locator(run)?)?;
            }
            TaskKind::FetchReport => {
                let report = self.fetcher.fetch(locator(run)?)?;
                run.context.report = Some(report);
            }
            TaskKind::PublishVerdict => {
                let report = run
                    .context
                    .report
                    .as_ref()
                    .ok_or_else(|| missing("results report"))?;
                let verdict = report.is_compliant()?;
                match self.publisher.publish(&run.event, verdict, self.clock.now()) {
                    Ok(_) => {}
                    // Redelivery after a crash between the write and the step
                    // save. The final query confirms or rejects the stored value.
                    Err(CbcError::ResultTokenUsed(_)) if run.attempts_for(&run.state) > 1 => {
                        warn!(
                            run_id = %run.id,
                            token = %run.event.result_token,
                            "result token already consumed by an earlier attempt; verifying instead"
                        );
                    }
                    Err(e) => return Err(e),
                }
                run.context.verdict = Some(verdict);
            }
            TaskKind::QueryComplianceFinal => {
                let verdict = run.context.verdict.ok_or_else(|| missing("verdict"))?;
                let status = self.verifier.verify(&verify_request(run, Some(verdict)))?;
                run.context.final_status = Some(status);
            }
        }
        Ok(())
    }

    fn check_results_bucket(&self, run: &Run, locator: &ObjectLocator) {
        if let (Some(expected), ObjectLocator::Object { bucket, .. }) =
            (&self.settings.results_bucket, locator)
        {
            if bucket != expected {
                warn!(
                    run_id = %run.id,
                    bucket = %bucket,
                    expected = %expected,
                    "results report is outside the configured results bucket"
                );
            }
        }
    }
}

fn verify_request(run: &Run, expected: Option<bool>) -> VerifyRequest {
    VerifyRequest {
        resource_type: run.event.resource_type.clone(),
        resource_id: run.event.resource_id.clone(),
        config_rule_name: run.event.config_rule_name.clone(),
        expected,
    }
}

fn locator(run: &Run) -> Result<&ObjectLocator> {
    run.context
        .report_locator
        .as_ref()
        .ok_or_else(|| missing("results report locator"))
}

fn missing(what: &str) -> CbcError {
    CbcError::InvalidDefinition(format!("{what} is not available at this state"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
