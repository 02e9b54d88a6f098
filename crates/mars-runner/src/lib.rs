//! The perturb/adapt lifecycle.
//!
//! An [`Orchestrator`] owns one perturbation at a time. Callers list what may
//! be perturbed, inject a mutation, then start a bounded repair search that
//! runs on a background thread and reports through [`Callbacks`].
//!
//! State changes only happen while the orchestration gate is held, and the
//! state together with the live repair problem is published through a single
//! lock so readers never observe one without the other.
//!
//! ```text
//! READY_TO_PERTURB --begin-perturb--> PERTURBING
//! PERTURBING --perturb-succeeded--> READY_TO_ADAPT
//! PERTURBING --perturb-failed--> READY_TO_PERTURB
//! READY_TO_ADAPT --begin-adapt--> SEARCHING
//! SEARCHING --search-completed--> FINISHED
//! SEARCHING --search-failed--> ERROR
//! ```

use anyhow::anyhow;
use mars_core::{
    Analyzer, FileLine, Mutant, Mutation, MutationEngine, MutantGuard, OrchestratorConfig,
    OrchestratorError, PatternMatcher, SandboxPlatform, Snapshot, StaticFacts, TestSuiteCoverage,
};
use mars_coverage::{mutant_fails_test, BaselineCoverage, CoverageService};
use mars_localize::{greedy, localize, Localization, Suspiciousness};
use mars_search::{
    build_search_space, CandidateEvaluation, DonorPool, ProblemError, RepairProblem, SearchLimits,
    Searcher, SpaceOptions,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/* ---------- lifecycle ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    ReadyToPerturb,
    Perturbing,
    ReadyToAdapt,
    Searching,
    Finished,
    Error,
}

impl OrchestratorState {
    pub const ALL: [OrchestratorState; 6] = [
        OrchestratorState::ReadyToPerturb,
        OrchestratorState::Perturbing,
        OrchestratorState::ReadyToAdapt,
        OrchestratorState::Searching,
        OrchestratorState::Finished,
        OrchestratorState::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, OrchestratorState::Finished | OrchestratorState::Error)
    }

    /// Whether a repair problem and its localization are live in this state.
    pub fn has_problem(self) -> bool {
        matches!(
            self,
            OrchestratorState::ReadyToAdapt
                | OrchestratorState::Searching
                | OrchestratorState::Finished
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorState::ReadyToPerturb => "READY_TO_PERTURB",
            OrchestratorState::Perturbing => "PERTURBING",
            OrchestratorState::ReadyToAdapt => "READY_TO_ADAPT",
            OrchestratorState::Searching => "SEARCHING",
            OrchestratorState::Finished => "FINISHED",
            OrchestratorState::Error => "ERROR",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    BeginPerturb,
    PerturbSucceeded,
    PerturbFailed,
    BeginAdapt,
    SearchCompleted,
    SearchFailed,
}

impl Event {
    pub const ALL: [Event; 6] = [
        Event::BeginPerturb,
        Event::PerturbSucceeded,
        Event::PerturbFailed,
        Event::BeginAdapt,
        Event::SearchCompleted,
        Event::SearchFailed,
    ];
}

/// The next state, or `None` when `event` is illegal in `state`.
pub fn transition(state: OrchestratorState, event: Event) -> Option<OrchestratorState> {
    use Event::*;
    use OrchestratorState::*;
    match (state, event) {
        (ReadyToPerturb, BeginPerturb) => Some(Perturbing),
        (Perturbing, PerturbSucceeded) => Some(ReadyToAdapt),
        (Perturbing, PerturbFailed) => Some(ReadyToPerturb),
        (ReadyToAdapt, BeginAdapt) => Some(Searching),
        (Searching, SearchCompleted) => Some(Finished),
        (Searching, SearchFailed) => Some(Error),

        (Perturbing | ReadyToAdapt | Searching | Finished | Error, BeginPerturb) => None,
        (
            ReadyToPerturb | ReadyToAdapt | Searching | Finished | Error,
            PerturbSucceeded | PerturbFailed,
        ) => None,
        (ReadyToPerturb | Perturbing | Searching | Finished | Error, BeginAdapt) => None,
        (
            ReadyToPerturb | Perturbing | ReadyToAdapt | Finished | Error,
            SearchCompleted | SearchFailed,
        ) => None,
    }
}

/* ---------- reporting ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorOutcome {
    CompleteRepair,
    /// Reserved for multi-objective searches; single-edit search never reports it.
    PartialRepair,
    NoRepair,
}

impl fmt::Display for OrchestratorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrchestratorOutcome::CompleteRepair => "COMPLETE_REPAIR",
            OrchestratorOutcome::PartialRepair => "PARTIAL_REPAIR",
            OrchestratorOutcome::NoRepair => "NO_REPAIR",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub evaluations: Vec<CandidateEvaluation>,
    pub attempts: usize,
    pub outcome: OrchestratorOutcome,
    pub elapsed: f64,
}

impl SearchReport {
    pub fn patches(&self) -> Vec<&CandidateEvaluation> {
        self.evaluations.iter().filter(|e| e.is_repair).collect()
    }
}

pub type ProgressCallback = Arc<dyn Fn(&CandidateEvaluation, &[CandidateEvaluation]) + Send + Sync>;
pub type DoneCallback = Arc<dyn Fn(&SearchReport) + Send + Sync>;
/// Receives the error kind and its message.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    progress: Option<ProgressCallback>,
    done: Option<DoneCallback>,
    error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&CandidateEvaluation, &[CandidateEvaluation]) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: Fn(&SearchReport) + Send + Sync + 'static,
    {
        self.done = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }
}

/// Snapshot of the orchestrator for observers.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: OrchestratorState,
    pub attempts: usize,
    pub elapsed: f64,
    pub patches: Vec<CandidateEvaluation>,
}

/* ---------- shared state ---------- */

pub struct Collaborators {
    pub platform: Arc<dyn SandboxPlatform>,
    pub engine: Arc<dyn MutationEngine>,
    pub matcher: Arc<dyn PatternMatcher>,
    pub analyzer: Arc<dyn Analyzer>,
}

struct Session {
    problem: Arc<RepairProblem>,
    localization: Arc<Localization>,
}

struct Published {
    state: OrchestratorState,
    session: Option<Arc<Session>>,
}

#[derive(Debug, Clone, Default)]
struct Progress {
    attempts: usize,
    elapsed: f64,
    patches: Vec<CandidateEvaluation>,
}

struct Shared {
    gate: Mutex<()>,
    published: RwLock<Published>,
    progress: RwLock<Progress>,
    /// The kept mutant; outlives the session so shutdown can destroy it.
    mutant: Mutex<Option<Mutant>>,
}

impl Shared {
    /// Applies `event`; the held gate proves the caller owns the lifecycle.
    fn advance<F>(&self, _held: &MutexGuard<'_, ()>, event: Event, update: F) -> Option<OrchestratorState>
    where
        F: FnOnce(&mut Option<Arc<Session>>),
    {
        let mut published = self.published.write();
        let next = transition(published.state, event)?;
        info!(from = %published.state, to = %next, "state transition");
        published.state = next;
        update(&mut published.session);
        Some(next)
    }

    fn state(&self) -> OrchestratorState {
        self.published.read().state
    }
}

/* ---------- orchestrator ---------- */

pub struct Orchestrator {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    coverage: CoverageService,
    baseline_coverage: Arc<BaselineCoverage>,
    baseline: Snapshot,
    instrumented: Snapshot,
    donors: DonorPool,
    policy: Suspiciousness,
    callbacks: Callbacks,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Resolves the baseline snapshots and the donor pool. The instrumented
    /// baseline is derived from the baseline and registered when missing.
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        callbacks: Callbacks,
    ) -> Result<Self, OrchestratorError> {
        let platform = collaborators.platform.clone();
        let baseline = platform.snapshot(&config.baseline)?;
        let instrumented = match platform.snapshot(&config.instrumented_baseline) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!("instrumented baseline not registered: {:#}", err);
                info!(name = %config.instrumented_baseline, "registering instrumented baseline");
                let snapshot = baseline.instrumented_as(&config.instrumented_baseline);
                platform.register(snapshot.clone())?;
                snapshot
            }
        };
        let donors = DonorPool::load(config.donor_pool.as_deref())?;
        let coverage = CoverageService::from_config(platform, &config);
        let baseline_coverage = Arc::new(BaselineCoverage::from_config(&config));
        Ok(Self {
            config,
            collaborators,
            coverage,
            baseline_coverage,
            baseline,
            instrumented,
            donors,
            policy: greedy,
            callbacks,
            shared: Arc::new(Shared {
                gate: Mutex::new(()),
                published: RwLock::new(Published {
                    state: OrchestratorState::ReadyToPerturb,
                    session: None,
                }),
                progress: RwLock::new(Progress::default()),
                mutant: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn with_baseline_coverage(mut self, coverage: Arc<BaselineCoverage>) -> Self {
        self.baseline_coverage = coverage;
        self
    }

    pub fn with_suspiciousness(mut self, policy: Suspiciousness) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        self.shared.state()
    }

    pub fn problem(&self) -> Option<Arc<RepairProblem>> {
        self.shared
            .published
            .read()
            .session
            .as_ref()
            .map(|s| s.problem.clone())
    }

    pub fn localization(&self) -> Option<Arc<Localization>> {
        self.shared
            .published
            .read()
            .session
            .as_ref()
            .map(|s| s.localization.clone())
    }

    pub fn baseline_coverage(&self) -> Result<Arc<TestSuiteCoverage>, OrchestratorError> {
        self.baseline_coverage.get(&self.coverage, &self.instrumented)
    }

    /// Recomputes baseline coverage and refreshes the cache file.
    pub fn precompute_coverage(&self) -> Result<Arc<TestSuiteCoverage>, OrchestratorError> {
        self.baseline_coverage
            .precompute(&self.coverage, &self.instrumented)
    }

    /// Mutable files executed by at least one test.
    pub fn files(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.baseline_coverage()?.lines().files())
    }

    pub fn lines(&self) -> Result<Vec<FileLine>, OrchestratorError> {
        Ok(self.baseline_coverage()?.lines().iter().collect())
    }

    /// Mutations the engine offers on covered lines of `file`.
    ///
    /// Arguments are validated before the engine is consulted.
    pub fn perturbations(
        &self,
        file: &str,
        line: Option<usize>,
        operator: Option<&str>,
    ) -> Result<Vec<Mutation>, OrchestratorError> {
        let covered = self.baseline_coverage()?.lines();
        if !covered.contains_file(file) {
            return Err(OrchestratorError::FileNotFound(file.to_string()));
        }
        if let Some(line) = line {
            let at = FileLine::new(file, line);
            if !covered.contains(&at) {
                return Err(OrchestratorError::LineNotFound(at));
            }
        }
        let known = self.collaborators.engine.operators();
        let operators: Vec<String> = match operator {
            Some(op) if known.iter().any(|k| k == op) => vec![op.to_string()],
            Some(op) => return Err(OrchestratorError::OperatorNotFound(op.to_string())),
            None => self
                .config
                .operators
                .iter()
                .filter(|op| known.contains(op))
                .cloned()
                .collect(),
        };
        let mutations =
            self.collaborators
                .engine
                .mutations(&self.baseline, file, line, &operators)?;
        let total = mutations.len();
        let mutations: Vec<Mutation> = mutations
            .into_iter()
            .filter(|m| covered.contains(&FileLine::new(file, m.location.start.line)))
            .collect();
        debug!(file, total, covered = mutations.len(), "found perturbations");
        Ok(mutations)
    }

    /// Injects `mutation` and prepares the repair problem it creates.
    ///
    /// Holds the orchestration gate for the whole pipeline. On any failure the
    /// mutant is destroyed and the orchestrator returns to `READY_TO_PERTURB`.
    pub fn perturb(&self, mutation: Mutation) -> Result<(), OrchestratorError> {
        let gate = self.shared.gate.lock();
        self.shared
            .advance(&gate, Event::BeginPerturb, |_| {})
            .ok_or(OrchestratorError::NotReadyToPerturb)?;
        info!(
            operator = %mutation.operator,
            location = %mutation.location,
            "perturbing baseline"
        );
        match self.prepare_problem(mutation) {
            Ok(session) => {
                *self.shared.mutant.lock() = Some(session.problem.mutant.clone());
                let session = Arc::new(session);
                self.shared
                    .advance(&gate, Event::PerturbSucceeded, |slot| *slot = Some(session))
                    .ok_or_else(|| anyhow!("lost track of the perturbation"))?;
                Ok(())
            }
            Err(err) => {
                warn!(kind = err.kind(), "perturbation rejected: {}", err);
                self.shared.advance(&gate, Event::PerturbFailed, |_| {});
                Err(err)
            }
        }
    }

    fn prepare_problem(&self, mutation: Mutation) -> Result<Session, OrchestratorError> {
        let platform = self.collaborators.platform.as_ref();
        let engine = self.collaborators.engine.as_ref();
        let known = engine.operators();
        if !known.contains(&mutation.operator) {
            return Err(OrchestratorError::OperatorNotFound(mutation.operator));
        }
        let baseline = self.baseline_coverage()?;
        let covered = baseline.lines();
        let file = &mutation.location.file;
        if !covered.contains_file(file) {
            return Err(OrchestratorError::FileNotFound(file.clone()));
        }
        let at = FileLine::new(file, mutation.location.start.line);
        if !covered.contains(&at) {
            return Err(OrchestratorError::LineNotFound(at));
        }

        let mutant = engine.mutate(&self.baseline, std::slice::from_ref(&mutation))?;
        let mutant = MutantGuard::new(engine, mutant);
        info!(mutant = %mutant.mutant().id, "generated mutant");

        if !mutant_fails_test(platform, &baseline, mutant.mutant())? {
            return Err(OrchestratorError::NeutralPerturbation);
        }
        let coverage = self.coverage.compute_mutant_coverage(
            engine,
            &self.instrumented,
            mutant.mutant(),
            &baseline,
        )?;
        let snapshot = platform.snapshot(&mutant.mutant().snapshot)?;
        let mut problem = RepairProblem::new(
            snapshot,
            mutant.mutant().clone(),
            coverage,
            StaticFacts::default(),
        )
        .map_err(|err| match err {
            ProblemError::NoFailingTests => OrchestratorError::NeutralPerturbation,
        })?;

        let localization = localize(&problem.coverage, self.policy, &problem.mutated_files())
            .map_err(OrchestratorError::coverage)?;
        problem.facts = self
            .collaborators
            .analyzer
            .analyze(&problem.snapshot, &localization.files())?;
        info!(
            failing = problem.failing_tests().len(),
            suspicious = localization.len(),
            "prepared repair problem"
        );

        problem.mutant = mutant.keep();
        Ok(Session {
            problem: Arc::new(problem),
            localization: Arc::new(localization),
        })
    }

    /// Starts a bounded repair search in the background.
    ///
    /// Zero limits count as absent; at least one limit is required.
    pub fn adapt(&self, minutes: Option<u64>, attempts: Option<usize>) -> Result<(), OrchestratorError> {
        let minutes = minutes.filter(|m| *m > 0);
        let attempts = attempts.filter(|a| *a > 0);
        if minutes.is_none() && attempts.is_none() {
            return Err(OrchestratorError::NoSearchLimits);
        }
        let limits = SearchLimits {
            time: minutes.map(|m| Duration::from_secs(m * 60)),
            attempts,
        };

        let gate = self.shared.gate.lock();
        let session = {
            let published = self.shared.published.read();
            if transition(published.state, Event::BeginAdapt).is_none() {
                return Err(OrchestratorError::NotReadyToAdapt);
            }
            published
                .session
                .clone()
                .ok_or_else(|| anyhow!("no repair problem is live"))?
        };
        self.shared.advance(&gate, Event::BeginAdapt, |_| {});
        *self.shared.progress.write() = Progress::default();
        info!(?limits, "starting repair search");

        let task = SearchTask {
            platform: self.collaborators.platform.clone(),
            matcher: self.collaborators.matcher.clone(),
            session,
            donors: self.donors.clone(),
            options: SpaceOptions::from_config(&self.config),
            build: self.config.build.clone(),
            limits,
            shared: self.shared.clone(),
            callbacks: self.callbacks.clone(),
        };
        let spawned = thread::Builder::new()
            .name("mars-search".to_string())
            .spawn(move || task.run());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.advance(&gate, Event::SearchFailed, |slot| *slot = None);
                Err(anyhow!("failed to start search thread: {}", err).into())
            }
        }
    }

    pub fn status(&self) -> Status {
        let state = self.shared.state();
        let progress = self.shared.progress.read().clone();
        Status {
            state,
            attempts: progress.attempts,
            elapsed: progress.elapsed,
            patches: progress.patches,
        }
    }

    /// Blocks until a running search has finished.
    pub fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("search thread panicked");
            }
        }
    }

    /// Waits for any search, then destroys the live mutant. Safe to call twice.
    pub fn shutdown(&self) {
        self.wait();
        let mutant = self.shared.mutant.lock().take();
        if let Some(mutant) = mutant {
            info!(mutant = %mutant.id, "destroying mutant");
            if let Err(err) = self.collaborators.engine.destroy(&mutant) {
                warn!(mutant = %mutant.id, "failed to destroy mutant: {:#}", err);
            }
        }
    }
}

/* ---------- background search ---------- */

struct SearchTask {
    platform: Arc<dyn SandboxPlatform>,
    matcher: Arc<dyn PatternMatcher>,
    session: Arc<Session>,
    donors: DonorPool,
    options: SpaceOptions,
    build: mars_core::BuildConfig,
    limits: SearchLimits,
    shared: Arc<Shared>,
    callbacks: Callbacks,
}

impl SearchTask {
    fn run(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.search()))
            .unwrap_or_else(|_| Err(anyhow!("search panicked").into()));
        let gate = self.shared.gate.lock();
        match result {
            Ok(report) => {
                {
                    let mut progress = self.shared.progress.write();
                    progress.attempts = report.attempts;
                    progress.elapsed = report.elapsed;
                }
                self.shared.advance(&gate, Event::SearchCompleted, |_| {});
                drop(gate);
                info!(
                    outcome = ?report.outcome,
                    attempts = report.attempts,
                    seconds = report.elapsed,
                    "search finished"
                );
                if let Some(done) = &self.callbacks.done {
                    done(&report);
                }
            }
            Err(err) => {
                self.shared.advance(&gate, Event::SearchFailed, |slot| *slot = None);
                drop(gate);
                error!(kind = err.kind(), "search failed: {}", err);
                if let Some(on_error) = &self.callbacks.error {
                    on_error(err.kind(), &err.to_string());
                }
            }
        }
    }

    fn search(&self) -> Result<SearchReport, OrchestratorError> {
        let problem = self.session.problem.clone();
        let space = build_search_space(
            problem.clone(),
            &self.session.localization,
            self.platform.clone(),
            self.matcher.clone(),
            self.donors.clone(),
            self.options,
        );
        let mut searcher = Searcher::new(
            self.platform.clone(),
            problem,
            self.build.clone(),
            space,
            self.limits,
        );
        let mut history = Vec::new();
        let mut patches: Vec<CandidateEvaluation> = Vec::new();
        while let Some(evaluation) = searcher.next() {
            let evaluation = evaluation?;
            if evaluation.is_repair {
                patches.push(evaluation.clone());
            }
            {
                let mut progress = self.shared.progress.write();
                progress.attempts = searcher.num_candidate_evals();
                progress.elapsed = searcher.time_running().as_secs_f64();
                if evaluation.is_repair {
                    progress.patches.push(evaluation.clone());
                }
            }
            if let Some(progress) = &self.callbacks.progress {
                progress(&evaluation, &patches);
            }
            history.push(evaluation);
        }
        let outcome = if patches.is_empty() {
            OrchestratorOutcome::NoRepair
        } else {
            OrchestratorOutcome::CompleteRepair
        };
        Ok(SearchReport {
            evaluations: history,
            attempts: searcher.num_candidate_evals(),
            outcome,
            elapsed: searcher.time_running().as_secs_f64(),
        })
    }
}
