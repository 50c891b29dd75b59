//! Sweep controller: drives trials from the generator through the dispatcher
//! with a bounded worker pool and keeps the best result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hs_optimizer::{
    AbortReason, RunOutcome, RunResult, SweepId, SweepPhase, SweepState, Trial, TrialGenerator,
};
use hs_types::{internal_error, ConfigError, DispatchResult, HsResult, Method, Objective, RunError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::CommandTemplate;
use crate::config::SweepDefinition;
use crate::dispatch::{
    LaunchRequest, OutputStream, ProcessDispatcher, RetryingDispatcher, RunDispatcher, StopHandle,
};
use crate::metric::{InMemoryReporter, MetricCollector, MetricReporter};

/// Lines of stderr attached to the log when a run fails.
const FAILURE_TAIL_LINES: usize = 20;

/// Everything a finished sweep produced.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep_id: SweepId,
    pub name: String,
    pub project: Option<String>,
    pub entity: Option<String>,
    pub method: Method,
    pub objective: Objective,
    pub phase: SweepPhase,
    /// Recorded results in completion order.
    pub results: Vec<RunResult>,
    pub best: Option<RunResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn exit_code(&self) -> i32 {
        self.phase.exit_code()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_failure())
            .count()
    }
}

/// Budget and context fixed for the lifetime of one sweep.
#[derive(Debug)]
struct SweepSettings {
    name: String,
    project: Option<String>,
    entity: Option<String>,
    method: Method,
    objective: Objective,
    template: CommandTemplate,
    environment: Vec<(String, String)>,
    run_dir: Option<PathBuf>,
    run_cap: Option<usize>,
    max_duration: Option<Duration>,
    concurrency: usize,
    max_consecutive_failures: Option<usize>,
}

struct SweepInner {
    sweep_id: SweepId,
    settings: SweepSettings,
    /// Taken before `state` whenever both are needed.
    generator: Mutex<TrialGenerator>,
    state: Mutex<SweepState>,
    phase: Mutex<SweepPhase>,
    abort: Mutex<Option<AbortReason>>,
    dispatcher: Arc<dyn RunDispatcher>,
    collector: MetricCollector,
    stop: StopHandle,
}

/// Cloneable handle to one sweep execution.
#[derive(Clone)]
pub struct SweepController {
    inner: Arc<SweepInner>,
}

impl SweepController {
    pub fn new(
        definition: SweepDefinition,
        dispatcher: Arc<dyn RunDispatcher>,
        reporter: Arc<dyn MetricReporter>,
    ) -> Result<Self, ConfigError> {
        let generator = definition.trial_generator()?;
        Ok(Self::with_generator(definition, generator, dispatcher, reporter))
    }

    /// Runs trials as local child processes, reporting into an in-memory
    /// reporter.
    pub fn local(definition: SweepDefinition) -> Result<Self, ConfigError> {
        let process = ProcessDispatcher::new(definition.grace_period);
        let dispatcher: Arc<dyn RunDispatcher> = match definition.retry {
            Some(retry) => Arc::new(RetryingDispatcher::new(
                process,
                retry.max_attempts,
                Duration::from_millis(retry.backoff_ms),
            )),
            None => Arc::new(process),
        };
        Self::new(definition, dispatcher, Arc::new(InMemoryReporter::new()))
    }

    pub fn with_generator(
        definition: SweepDefinition,
        generator: TrialGenerator,
        dispatcher: Arc<dyn RunDispatcher>,
        reporter: Arc<dyn MetricReporter>,
    ) -> Self {
        let settings = SweepSettings {
            name: definition.name,
            project: definition.project,
            entity: definition.entity,
            method: definition.method,
            objective: definition.objective.clone(),
            template: definition.template,
            environment: definition.environment,
            run_dir: definition.run_dir,
            run_cap: definition.budget.run_cap,
            max_duration: definition.budget.max_duration,
            concurrency: definition.concurrency.max(1),
            max_consecutive_failures: definition.max_consecutive_failures,
        };

        Self {
            inner: Arc::new(SweepInner {
                sweep_id: Uuid::new_v4(),
                settings,
                generator: Mutex::new(generator),
                state: Mutex::new(SweepState::new(definition.objective)),
                phase: Mutex::new(SweepPhase::Idle),
                abort: Mutex::new(None),
                dispatcher,
                collector: MetricCollector::new(reporter),
                stop: StopHandle::new(),
            }),
        }
    }

    pub fn sweep_id(&self) -> SweepId {
        self.inner.sweep_id
    }

    /// Handle that stops the sweep from any task or signal handler.
    pub fn stop_handle(&self) -> StopHandle {
        self.inner.stop.clone()
    }

    pub fn phase(&self) -> SweepPhase {
        *self.inner.phase.lock()
    }

    /// Snapshot of the results recorded so far.
    pub fn results(&self) -> Vec<RunResult> {
        self.inner.state.lock().results().to_vec()
    }

    pub fn best(&self) -> Option<RunResult> {
        self.inner.state.lock().best().cloned()
    }

    /// Execute the sweep to completion, cancellation or abort.
    pub async fn run(&self) -> HsResult<SweepReport> {
        {
            let mut phase = self.inner.phase.lock();
            if phase.is_terminal() {
                return Err(internal_error!("sweep {} already finished", self.inner.sweep_id));
            }
            if *phase != SweepPhase::Idle {
                return Err(internal_error!("sweep {} already started", self.inner.sweep_id));
            }
            *phase = SweepPhase::Running;
        }

        let started_at = Utc::now();
        let deadline = self.inner.settings.max_duration.map(|d| Instant::now() + d);
        let settings = &self.inner.settings;
        let strategy = self.inner.generator.lock().strategy_name().to_string();
        info!(
            sweep_id = %self.inner.sweep_id,
            sweep = %settings.name,
            method = %settings.method,
            strategy = %strategy,
            metric = %settings.objective.name,
            goal = ?settings.objective.goal,
            concurrency = settings.concurrency,
            "sweep started"
        );

        let mut workers = JoinSet::new();
        for worker in 0..settings.concurrency {
            let inner = self.inner.clone();
            workers.spawn(async move { inner.work(worker, deadline).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(sweep_id = %self.inner.sweep_id, error = %e, "sweep worker panicked");
                self.inner.abort_with(AbortReason::Cancelled);
            }
        }

        let phase = self.inner.final_phase();
        *self.inner.phase.lock() = phase;

        let (results, best) = {
            let state = self.inner.state.lock();
            (state.results().to_vec(), state.best().cloned())
        };
        let report = SweepReport {
            sweep_id: self.inner.sweep_id,
            name: settings.name.clone(),
            project: settings.project.clone(),
            entity: settings.entity.clone(),
            method: settings.method,
            objective: settings.objective.clone(),
            phase,
            results,
            best,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            sweep_id = %report.sweep_id,
            phase = ?report.phase,
            trials = report.results.len(),
            failed = report.failed_count(),
            best_trial = report.best.as_ref().map(|b| b.trial.number),
            best_value = report.best.as_ref().and_then(RunResult::metric),
            "sweep finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for SweepController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepController")
            .field("sweep_id", &self.inner.sweep_id)
            .field("name", &self.inner.settings.name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SweepInner {
    async fn work(&self, worker: usize, deadline: Option<Instant>) {
        while let Some(trial) = self.next_trial(deadline) {
            debug!(worker, trial = trial.number, "worker picked trial");
            match self.execute(trial).await {
                Some(result) => self.record(result),
                None => break,
            }
        }
        debug!(worker, "worker finished");
    }

    fn next_trial(&self, deadline: Option<Instant>) -> Option<Trial> {
        if self.stop.is_stopped() {
            return None;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            debug!(sweep_id = %self.sweep_id, "time budget elapsed");
            return None;
        }

        let mut generator = self.generator.lock();
        // Re-checked under the lock so a concurrent abort is never overtaken.
        if self.stop.is_stopped() {
            return None;
        }
        if let Some(cap) = self.settings.run_cap {
            if generator.issued() >= cap {
                return None;
            }
        }
        let state = self.state.lock();
        generator.next_trial(state.results())
    }

    /// Run one trial. `None` if the run was cancelled mid-flight.
    async fn execute(&self, trial: Trial) -> Option<RunResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let outcome = match self.dispatch(run_id, &trial).await {
            Ok(value) => RunOutcome::Succeeded { value },
            Err(RunError::Cancelled { .. }) => {
                info!(run_id = %run_id, trial = trial.number, "run cancelled, not recorded");
                return None;
            }
            Err(e) => RunOutcome::from_error(&e),
        };
        Some(RunResult::new(run_id, trial, outcome, started_at))
    }

    async fn dispatch(&self, run_id: Uuid, trial: &Trial) -> DispatchResult<f64> {
        let command = self
            .settings
            .template
            .render(trial)
            .map_err(|e| RunError::Launch {
                program: String::new(),
                message: e.to_string(),
            })?;

        let request = LaunchRequest {
            run_id,
            command,
            environment: self.settings.environment.clone(),
            context: self.context(run_id, trial),
            run_dir: self
                .settings
                .run_dir
                .as_ref()
                .map(|dir| dir.join(run_id.to_string())),
        };

        info!(
            run_id = %run_id,
            trial = trial.number,
            command = %request.command,
            "dispatching trial"
        );

        if self.stop.is_stopped() {
            return Err(RunError::Cancelled {
                run_id: run_id.to_string(),
            });
        }
        let mut handle = self.dispatcher.launch(request).await?;
        let completion = handle.wait(self.stop.signal()).await?;
        if let Err(e) = completion.check() {
            let tail = completion.output.tail(OutputStream::Stderr, FAILURE_TAIL_LINES);
            warn!(
                run_id = %run_id,
                trial = trial.number,
                exit_code = completion.exit_code,
                stderr = %tail.join("\n"),
                "run failed"
            );
            return Err(e);
        }

        self.collector
            .extract(run_id, &self.settings.objective.name, &completion.output)
    }

    fn context(&self, run_id: Uuid, trial: &Trial) -> Vec<(String, String)> {
        let mut context = vec![
            ("HS_SWEEP_ID".to_string(), self.sweep_id.to_string()),
            ("HS_RUN_ID".to_string(), run_id.to_string()),
            ("HS_TRIAL_NUMBER".to_string(), trial.number.to_string()),
        ];
        if let Some(project) = &self.settings.project {
            context.push(("HS_PROJECT".to_string(), project.clone()));
        }
        if let Some(entity) = &self.settings.entity {
            context.push(("HS_ENTITY".to_string(), entity.clone()));
        }
        context
    }

    fn record(&self, result: RunResult) {
        let (became_best, consecutive) = {
            let mut state = self.state.lock();
            let became_best = state.record(result.clone());
            (became_best, state.consecutive_failures())
        };

        match &result.outcome {
            RunOutcome::Succeeded { value } => info!(
                run_id = %result.run_id,
                trial = result.trial.number,
                value,
                best = became_best,
                duration_secs = result.duration_seconds(),
                "trial succeeded"
            ),
            other => warn!(
                run_id = %result.run_id,
                trial = result.trial.number,
                outcome = ?other,
                duration_secs = result.duration_seconds(),
                "trial produced no objective value"
            ),
        }

        self.generator.lock().observe(&result);

        if let Some(limit) = self.settings.max_consecutive_failures {
            if consecutive >= limit {
                warn!(
                    sweep_id = %self.sweep_id,
                    consecutive,
                    limit,
                    "consecutive failure threshold reached, aborting sweep"
                );
                self.abort_with(AbortReason::FailureThreshold { consecutive });
            }
        }
    }

    /// First abort reason wins. Stops dispatching and terminates in-flight runs.
    fn abort_with(&self, reason: AbortReason) {
        self.abort.lock().get_or_insert(reason);
        self.stop.stop();
    }

    fn final_phase(&self) -> SweepPhase {
        if let Some(reason) = *self.abort.lock() {
            return SweepPhase::Aborted(reason);
        }
        if self.stop.is_stopped() {
            return SweepPhase::Aborted(AbortReason::Cancelled);
        }
        if self.state.lock().is_empty() {
            return SweepPhase::Aborted(AbortReason::NoTrials);
        }
        SweepPhase::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{
        CapturedOutput, OutputLine, RunCompletion, RunHandle, StopSignal,
    };
    use async_trait::async_trait;
    use hs_types::ParameterValue;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    enum Script {
        /// Exit 0 printing `val_loss=<value>`.
        Metric(f64),
        /// Exit 0 without reporting anything.
        Silent,
        Exit(i32),
        LaunchError,
        /// Run until the sweep is stopped.
        Hang,
        /// Report a metric after a delay.
        Slow(f64, Duration),
    }

    #[derive(Default)]
    struct ScriptedDispatcher {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<LaunchRequest>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ScriptedDispatcher {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }
    }

    struct ScriptedHandle {
        run_id: Uuid,
        script: Script,
        in_flight: Arc<AtomicUsize>,
    }

    fn completion(exit_code: i32, lines: &[String]) -> RunCompletion {
        let mut output = CapturedOutput::default();
        for text in lines {
            output.push(OutputLine {
                stream: OutputStream::Stdout,
                text: text.clone(),
            });
        }
        RunCompletion {
            exit_code: Some(exit_code),
            success: exit_code == 0,
            output,
        }
    }

    #[async_trait]
    impl RunDispatcher for ScriptedDispatcher {
        async fn launch(&self, request: LaunchRequest) -> DispatchResult<Box<dyn RunHandle>> {
            let run_id = request.run_id;
            let program = request.command.program.clone();
            self.requests.lock().push(request);
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Silent);
            if let Script::LaunchError = script {
                return Err(RunError::Launch {
                    program,
                    message: "No such file or directory".into(),
                });
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(ScriptedHandle {
                run_id,
                script,
                in_flight: self.in_flight.clone(),
            }))
        }
    }

    #[async_trait]
    impl RunHandle for ScriptedHandle {
        fn run_id(&self) -> Uuid {
            self.run_id
        }

        async fn wait(&mut self, mut stop: StopSignal) -> DispatchResult<RunCompletion> {
            let result = match self.script.clone() {
                Script::Metric(value) => Ok(completion(0, &[format!("val_loss={value}")])),
                Script::Silent => Ok(completion(0, &["done".to_string()])),
                Script::Exit(code) => Ok(completion(code, &[])),
                Script::LaunchError => unreachable!(),
                Script::Hang => {
                    stop.stopped().await;
                    Err(RunError::Cancelled {
                        run_id: self.run_id.to_string(),
                    })
                }
                Script::Slow(value, delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(completion(0, &[format!("val_loss={value}")]))
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn definition(extra: &str, candidates: usize) -> SweepDefinition {
        let values: Vec<String> = (1..=candidates).map(|i| format!("{}", i as f64 / 10.0)).collect();
        let yaml = format!(
            "project: decorr-mamba\nentity: lab\nprogram: sweep.py\nmethod: grid\nmetric: {{name: val_loss, goal: minimize}}\nparameters:\n  backprop_lr: {{values: [{}]}}\n{extra}",
            values.join(", ")
        );
        SweepDefinition::from_yaml_str(&yaml).unwrap()
    }

    fn controller(definition: SweepDefinition, dispatcher: Arc<ScriptedDispatcher>) -> SweepController {
        SweepController::new(definition, dispatcher, Arc::new(InMemoryReporter::new())).unwrap()
    }

    #[tokio::test]
    async fn keeps_strictly_best_trial() {
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Metric(0.9),
            Script::Metric(0.4),
            Script::Metric(0.6),
            Script::Metric(0.4),
        ]);
        let sweep = controller(definition("", 4), dispatcher);
        assert_eq!(sweep.phase(), SweepPhase::Idle);

        let report = sweep.run().await.unwrap();
        assert_eq!(report.phase, SweepPhase::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 4);
        let best = report.best.as_ref().unwrap();
        assert_eq!(best.trial.number, 1);
        assert_eq!(best.metric(), Some(0.4));
        assert_eq!(sweep.phase(), SweepPhase::Completed);
    }

    #[tokio::test]
    async fn missing_metric_is_recorded_but_never_best() {
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Silent,
            Script::Metric(0.4),
            Script::Metric(0.6),
        ]);
        let report = controller(definition("", 3), dispatcher).run().await.unwrap();
        assert_eq!(report.results.len(), 3);
        assert!(matches!(
            report.results[0].outcome,
            RunOutcome::MissingMetric { .. }
        ));
        assert_eq!(report.best.as_ref().unwrap().trial.number, 1);
        assert_eq!(report.phase, SweepPhase::Completed);
    }

    #[tokio::test]
    async fn failed_run_does_not_stop_the_sweep() {
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Exit(1),
            Script::LaunchError,
            Script::Metric(0.7),
        ]);
        let report = controller(definition("", 3), dispatcher).run().await.unwrap();
        assert_eq!(report.results.len(), 3);
        assert!(matches!(
            report.results[0].outcome,
            RunOutcome::Failed {
                exit_code: Some(1),
                ..
            }
        ));
        assert!(matches!(
            report.results[1].outcome,
            RunOutcome::LaunchFailed { .. }
        ));
        assert_eq!(report.failed_count(), 2);
        assert_eq!(report.best.as_ref().unwrap().metric(), Some(0.7));
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn consecutive_failures_abort_with_exit_code_three() {
        let dispatcher = ScriptedDispatcher::new(vec![Script::Exit(1); 6]);
        let sweep = controller(definition("max_consecutive_failures: 2\n", 6), dispatcher);
        let report = sweep.run().await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(
            report.phase,
            SweepPhase::Aborted(AbortReason::FailureThreshold { consecutive: 2 })
        );
        assert_eq!(report.exit_code(), 3);
    }

    #[tokio::test]
    async fn clean_exit_resets_failure_count() {
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Exit(1),
            Script::Silent,
            Script::Exit(1),
            Script::Metric(0.3),
        ]);
        let report = controller(definition("max_consecutive_failures: 2\n", 4), dispatcher)
            .run()
            .await
            .unwrap();
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.phase, SweepPhase::Completed);
    }

    #[tokio::test]
    async fn cancelling_keeps_recorded_results() {
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Metric(0.5),
            Script::Metric(0.4),
            Script::Hang,
        ]);
        let sweep = controller(definition("", 6), dispatcher.clone());
        let running = tokio::spawn({
            let sweep = sweep.clone();
            async move { sweep.run().await }
        });

        while sweep.results().len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(sweep.phase(), SweepPhase::Running);
        sweep.stop_handle().stop();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.phase, SweepPhase::Aborted(AbortReason::Cancelled));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.best.as_ref().unwrap().metric(), Some(0.4));
        assert!(dispatcher.requests.lock().len() <= 3);
    }

    #[tokio::test]
    async fn run_cap_bounds_trials() {
        let dispatcher = ScriptedDispatcher::new(vec![Script::Metric(0.5); 10]);
        let report = controller(definition("run_cap: 3\n", 10), dispatcher)
            .run()
            .await
            .unwrap();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.phase, SweepPhase::Completed);
    }

    #[tokio::test]
    async fn zero_budget_attempts_nothing() {
        let dispatcher = ScriptedDispatcher::new(vec![]);
        let report = controller(definition("run_cap: 0\n", 3), dispatcher.clone())
            .run()
            .await
            .unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.phase, SweepPhase::Aborted(AbortReason::NoTrials));
        assert_eq!(report.exit_code(), 1);
        assert!(dispatcher.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn elapsed_time_budget_stops_dispatch() {
        let dispatcher = ScriptedDispatcher::new(vec![]);
        let report = controller(definition("max_duration_secs: 0\n", 3), dispatcher)
            .run()
            .await
            .unwrap();
        assert_eq!(report.phase, SweepPhase::Aborted(AbortReason::NoTrials));
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_lapsing_mid_sweep_keeps_finished_runs() {
        let delay = Duration::from_millis(400);
        let dispatcher = ScriptedDispatcher::new(
            (1..=10).map(|i| Script::Slow(i as f64 / 10.0, delay)).collect(),
        );
        let report = controller(definition("max_duration_secs: 1\n", 10), dispatcher.clone())
            .run()
            .await
            .unwrap();

        // Runs start at 0.0s, 0.4s and 0.8s; the fourth would start past the budget.
        assert_eq!(report.results.len(), 3);
        assert_eq!(dispatcher.requests.lock().len(), 3);
        assert_eq!(report.phase, SweepPhase::Completed);
        assert_eq!(report.best.as_ref().unwrap().metric(), Some(0.1));
    }

    #[tokio::test]
    async fn stopped_sweep_never_launches() {
        let dispatcher = ScriptedDispatcher::new(vec![Script::Metric(0.5); 2]);
        let sweep = controller(definition("", 2), dispatcher.clone());
        let trial = sweep.inner.generator.lock().next_trial(&[]).unwrap();

        sweep.stop_handle().stop();
        assert!(sweep.inner.next_trial(None).is_none());
        assert!(sweep.inner.execute(trial).await.is_none());
        assert!(dispatcher.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn workers_run_concurrently_within_bound() {
        let delay = Duration::from_millis(30);
        let dispatcher = ScriptedDispatcher::new(vec![
            Script::Slow(0.6, delay),
            Script::Slow(0.5, delay),
            Script::Slow(0.4, delay),
            Script::Slow(0.3, delay),
            Script::Slow(0.2, delay),
            Script::Slow(0.1, delay),
        ]);
        let report = controller(definition("concurrency: 3\n", 6), dispatcher.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.best.as_ref().unwrap().metric(), Some(0.1));
        let peak = dispatcher.max_in_flight.load(Ordering::SeqCst);
        assert!((2..=3).contains(&peak), "peak in-flight runs: {peak}");

        let mut numbers: Vec<usize> = report.results.iter().map(|r| r.trial.number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn requests_carry_sweep_context() {
        let dispatcher = ScriptedDispatcher::new(vec![Script::Metric(0.5)]);
        let base = PathBuf::from("/tmp/hs-runs");
        let sweep = controller(
            definition("run_dir: /tmp/hs-runs\nenvironment: {OMP_NUM_THREADS: 4}\n", 1),
            dispatcher.clone(),
        );
        let report = sweep.run().await.unwrap();

        let requests = dispatcher.requests.lock();
        let request = &requests[0];
        assert_eq!(request.run_id, report.results[0].run_id);
        assert_eq!(request.command.program, "python");
        assert_eq!(request.command.args, vec!["sweep.py", "--backprop_lr", "0.1"]);
        assert_eq!(
            request.environment,
            vec![("OMP_NUM_THREADS".to_string(), "4".to_string())]
        );
        assert_eq!(request.run_dir, Some(base.join(request.run_id.to_string())));

        let context: std::collections::HashMap<_, _> = request.context.iter().cloned().collect();
        assert_eq!(context["HS_SWEEP_ID"], sweep.sweep_id().to_string());
        assert_eq!(context["HS_RUN_ID"], request.run_id.to_string());
        assert_eq!(context["HS_TRIAL_NUMBER"], "0");
        assert_eq!(context["HS_PROJECT"], "decorr-mamba");
        assert_eq!(context["HS_ENTITY"], "lab");
    }

    #[tokio::test]
    async fn model_guided_sweep_respects_run_cap() {
        let dispatcher = ScriptedDispatcher::new(
            (0..8).map(|i| Script::Metric(1.0 / (i + 1) as f64)).collect(),
        );
        let yaml = "program: sweep.py\nmethod: bayes\nmetric: {name: val_loss}\nseed: 7\nrun_cap: 8\nparameters:\n  backprop_lr: {values: [0.05, 0.01, 0.005, 0.001]}\n  decorr_lr: {values: [0.0, 0.01, 0.001]}\n";
        let definition = SweepDefinition::from_yaml_str(yaml).unwrap();
        let report = controller(definition, dispatcher).run().await.unwrap();
        assert_eq!(report.results.len(), 8);
        assert_eq!(report.method, Method::Bayes);
        for result in &report.results {
            assert_eq!(result.trial.parameters.len(), 2);
            assert!(matches!(
                result.trial.parameters["backprop_lr"],
                ParameterValue::Float(_)
            ));
        }
    }

    #[tokio::test]
    async fn sweep_runs_only_once() {
        let sweep = controller(definition("", 1), ScriptedDispatcher::new(vec![Script::Metric(0.1)]));
        sweep.run().await.unwrap();
        assert!(sweep.run().await.is_err());
    }

    #[tokio::test]
    async fn report_serializes_outcomes() {
        let dispatcher = ScriptedDispatcher::new(vec![Script::Metric(0.25), Script::Exit(2)]);
        let report = controller(definition("", 2), dispatcher).run().await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["phase"], "completed");
        assert_eq!(json["results"][0]["outcome"]["status"], "succeeded");
        assert_eq!(json["results"][1]["outcome"]["status"], "failed");
        assert_eq!(json["best"]["outcome"]["value"], 0.25);
    }
}
