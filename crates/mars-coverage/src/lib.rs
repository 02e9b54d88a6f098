//! Coverage computation for baselines and mutants, plus the liveness check
//! that rejects mutants no test can observe.
//!
//! Every sandbox is owned by exactly one test execution and is released on all
//! exit paths through [`ContainerGuard`].

use anyhow::{anyhow, Result};
use mars_core::{
    atomic_write_json_pretty, load_json_file, ContainerGuard, MutableFiles, MutationEngine,
    Mutant, MutantGuard, OrchestratorConfig, OrchestratorError, SandboxPlatform, Snapshot,
    TestCase, TestCoverage, TestSuiteCoverage,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct CoverageService {
    platform: Arc<dyn SandboxPlatform>,
    mutable: MutableFiles,
    threads: usize,
}

impl CoverageService {
    pub fn new(platform: Arc<dyn SandboxPlatform>, mutable: MutableFiles, threads: usize) -> Self {
        Self {
            platform,
            mutable,
            threads: threads.max(1),
        }
    }

    pub fn from_config(platform: Arc<dyn SandboxPlatform>, config: &OrchestratorConfig) -> Self {
        Self::new(
            platform,
            config.mutable_files.clone(),
            config.worker_threads(),
        )
    }

    pub fn platform(&self) -> &dyn SandboxPlatform {
        self.platform.as_ref()
    }

    pub fn mutable_files(&self) -> &MutableFiles {
        &self.mutable
    }

    /// Runs one test in a fresh sandbox and returns the lines it executed in mutable files.
    pub fn compute_test_coverage(
        &self,
        snapshot: &Snapshot,
        test: &TestCase,
    ) -> Result<TestCoverage, OrchestratorError> {
        info!(test = %test.name, snapshot = %snapshot.name, "getting coverage for test");
        self.test_coverage_inner(snapshot, test).map_err(|err| {
            warn!(
                test = %test.name,
                snapshot = %snapshot.name,
                "failed to compute coverage: {:#}",
                err
            );
            OrchestratorError::coverage(format!("test {}: {:#}", test.name, err))
        })
    }

    fn test_coverage_inner(&self, snapshot: &Snapshot, test: &TestCase) -> Result<TestCoverage> {
        let guard = ContainerGuard::provision(self.platform.as_ref(), snapshot)?;
        let outcome = self.platform.run_test(guard.container(), test)?;
        let lines = self.platform.extract_coverage(guard.container())?;
        let lines = lines.restricted_to_files(|file| self.mutable.is_mutable(file));
        Ok(TestCoverage {
            test: test.name.clone(),
            outcome,
            lines,
        })
    }

    /// Maps [`Self::compute_test_coverage`] over `tests` on a pool of at most
    /// `threads` workers, so at most `threads` sandboxes are live at once.
    pub fn compute_coverage(
        &self,
        snapshot: &Snapshot,
        tests: &[TestCase],
    ) -> Result<TestSuiteCoverage, OrchestratorError> {
        let started = Instant::now();
        if tests.is_empty() {
            return Ok(TestSuiteCoverage::new());
        }
        let workers = self.threads.min(tests.len());
        debug!(tests = tests.len(), workers, snapshot = %snapshot.name, "computing coverage");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("mars-coverage-{}", idx))
            .build()
            .map_err(|err| OrchestratorError::coverage(format!("worker pool: {}", err)))?;
        let computed: Vec<TestCoverage> = pool.install(|| {
            tests
                .par_iter()
                .map(|test| self.compute_test_coverage(snapshot, test))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let coverage: TestSuiteCoverage = computed.into_iter().collect();
        debug!(
            "computed coverage (took {:.2} seconds)",
            started.elapsed().as_secs_f64()
        );
        Ok(coverage)
    }

    /// Coverage of `mutant`, recomputed only for tests whose baseline coverage
    /// touches a mutated file. Other tests keep their baseline entries.
    ///
    /// Coverage is collected from a temporary variant built by applying the same
    /// mutations to `instrumented_base`; the variant is destroyed before returning.
    pub fn compute_mutant_coverage(
        &self,
        engine: &dyn MutationEngine,
        instrumented_base: &Snapshot,
        mutant: &Mutant,
        baseline: &TestSuiteCoverage,
    ) -> Result<TestSuiteCoverage, OrchestratorError> {
        info!(mutant = %mutant.id, "computing coverage for mutant");
        let snapshot = self
            .platform
            .snapshot(&mutant.snapshot)
            .map_err(OrchestratorError::coverage)?;

        let mut observing: BTreeSet<String> = BTreeSet::new();
        for file in mutant.files() {
            observing.extend(baseline.tests_covering_file(&file));
        }
        let (fresh, reused): (Vec<TestCase>, Vec<TestCase>) = snapshot
            .tests
            .iter()
            .cloned()
            .partition(|t| observing.contains(&t.name) || baseline.get(&t.name).is_none());
        info!(
            fresh = fresh.len(),
            reused = reused.len(),
            "restricted mutant coverage to tests covering the mutated files"
        );
        let reused: TestSuiteCoverage = reused
            .iter()
            .filter_map(|t| baseline.get(&t.name).cloned())
            .collect();

        info!("creating temporary instrumented mutant");
        let variant = engine
            .mutate(instrumented_base, &mutant.mutations)
            .map_err(|err| {
                warn!(mutant = %mutant.id, "failed to create instrumented mutant: {:#}", err);
                OrchestratorError::coverage(format!("instrumented mutant: {:#}", err))
            })?;
        let variant = MutantGuard::new(engine, variant);
        info!(variant = %variant.mutant().id, "created temporary instrumented mutant");

        let variant_snapshot = self
            .platform
            .snapshot(&variant.mutant().snapshot)
            .map_err(OrchestratorError::coverage)?;
        let computed = self.compute_coverage(&variant_snapshot, &fresh)?;
        Ok(reused.merge(computed))
    }
}

/// Lazily computed, memoised coverage of the unperturbed system.
pub struct BaselineCoverage {
    cache_path: Option<PathBuf>,
    mutable: MutableFiles,
    cell: Mutex<Option<Arc<TestSuiteCoverage>>>,
}

impl BaselineCoverage {
    pub fn new(cache_path: Option<PathBuf>, mutable: MutableFiles) -> Self {
        Self {
            cache_path,
            mutable,
            cell: Mutex::new(None),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.coverage_cache.clone(), config.mutable_files.clone())
    }

    /// A cache that is already populated.
    pub fn preloaded(coverage: TestSuiteCoverage, mutable: MutableFiles) -> Self {
        let restricted = coverage.restricted_to_files(|f| mutable.is_mutable(f));
        Self {
            cache_path: None,
            mutable,
            cell: Mutex::new(Some(Arc::new(restricted))),
        }
    }

    pub fn cached(&self) -> Option<Arc<TestSuiteCoverage>> {
        self.cell.lock().clone()
    }

    /// Returns the memoised coverage, loading it from the cache file or
    /// computing it on `instrumented` on first use.
    pub fn get(
        &self,
        service: &CoverageService,
        instrumented: &Snapshot,
    ) -> Result<Arc<TestSuiteCoverage>, OrchestratorError> {
        let mut cell = self.cell.lock();
        if let Some(coverage) = cell.as_ref() {
            return Ok(coverage.clone());
        }
        let coverage = match self.cache_path.as_deref().filter(|p| p.exists()) {
            Some(path) => load_baseline_coverage(path, &self.mutable)
                .map_err(|err| OrchestratorError::coverage(format!("{:#}", err)))?,
            None => self.compute_and_persist(service, instrumented)?,
        };
        let coverage = Arc::new(coverage);
        *cell = Some(coverage.clone());
        Ok(coverage)
    }

    /// Computes baseline coverage regardless of any cache file and writes it out.
    pub fn precompute(
        &self,
        service: &CoverageService,
        instrumented: &Snapshot,
    ) -> Result<Arc<TestSuiteCoverage>, OrchestratorError> {
        let mut cell = self.cell.lock();
        let coverage = Arc::new(self.compute_and_persist(service, instrumented)?);
        *cell = Some(coverage.clone());
        Ok(coverage)
    }

    fn compute_and_persist(
        &self,
        service: &CoverageService,
        instrumented: &Snapshot,
    ) -> Result<TestSuiteCoverage, OrchestratorError> {
        info!(snapshot = %instrumented.name, "computing baseline coverage");
        let coverage = service
            .compute_coverage(instrumented, &instrumented.tests)?
            .restricted_to_files(|f| self.mutable.is_mutable(f));
        if let Some(path) = &self.cache_path {
            info!(path = %path.display(), "writing coverage information to disk");
            atomic_write_json_pretty(path, &coverage)
                .map_err(|err| OrchestratorError::coverage(format!("{:#}", err)))?;
        }
        Ok(coverage)
    }
}

pub fn load_baseline_coverage(path: &Path, mutable: &MutableFiles) -> Result<TestSuiteCoverage> {
    info!(path = %path.display(), "loading precomputed baseline coverage");
    let coverage: TestSuiteCoverage = load_json_file(path)?;
    if coverage.is_empty() {
        return Err(anyhow!("precomputed coverage at {} is empty", path.display()));
    }
    Ok(coverage.restricted_to_files(|f| mutable.is_mutable(f)))
}

/// Whether the mutant fails at least one of the tests covering its own lines.
///
/// Runs the candidate tests sequentially in a single sandbox and stops at the
/// first failure.
pub fn mutant_fails_test(
    platform: &dyn SandboxPlatform,
    baseline: &TestSuiteCoverage,
    mutant: &Mutant,
) -> Result<bool> {
    info!(mutant = %mutant.id, "ensuring that mutant fails at least one test");
    let snapshot = platform.snapshot(&mutant.snapshot)?;
    let lines = mutant.lines();
    debug!(
        "lines changed by mutant: {}",
        lines
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let covering = baseline.tests_covering_any(&lines);
    let tests: Vec<&TestCase> = snapshot
        .tests
        .iter()
        .filter(|t| covering.contains(&t.name))
        .collect();
    info!(tests = tests.len(), "tests covering the mutated lines");
    if tests.is_empty() {
        info!("mutant was not killed by any of the test cases");
        return Ok(false);
    }

    let guard = ContainerGuard::provision(platform, &snapshot)?;
    for test in tests {
        let outcome = platform.run_test(guard.container(), test)?;
        if !outcome.passed {
            info!(test = %test.name, "mutant killed by test");
            return Ok(true);
        }
    }
    info!("mutant was not killed by any of the test cases");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mars_core::testing::{FakeEngine, FakePlatform};
    use mars_core::{FileLine, FileLocationRange, Location, Mutation};
    use std::time::Duration;

    const BASE: &str = "mars:baseline";
    const INSTR: &str = "mars:instrument";

    fn system() -> Arc<FakePlatform> {
        let platform = Arc::new(FakePlatform::new());
        platform.add_system(
            BASE,
            INSTR,
            &[
                ("t1", true, &["src/a.cpp:1", "src/a.cpp:2", "src/b.h:4"]),
                ("t2", true, &["src/a.cpp:5", "src/a.cpp:6"]),
                ("t3", true, &["src/c.cpp:9"]),
                ("t4", true, &["src/a.cpp:5"]),
            ],
        );
        platform
    }

    fn service(platform: &Arc<FakePlatform>, threads: usize) -> CoverageService {
        CoverageService::new(platform.clone(), MutableFiles::default(), threads)
    }

    fn flip_at(line: usize) -> Mutation {
        Mutation {
            operator: "flip-relational-operator".to_string(),
            location: FileLocationRange::new(
                "src/a.cpp",
                Location::new(line, 10),
                Location::new(line, 11),
            ),
            replacement: ">=".to_string(),
        }
    }

    fn snapshot(platform: &FakePlatform, name: &str) -> Snapshot {
        platform.snapshot(name).expect("snapshot")
    }

    #[test]
    fn test_coverage_filters_immutable_files_and_releases_sandbox() {
        let platform = system();
        let svc = service(&platform, 2);
        let snap = snapshot(&platform, INSTR);
        let cov = svc
            .compute_test_coverage(&snap, &TestCase::named("t1"))
            .expect("coverage");
        assert_eq!(cov.lines.files(), vec!["src/a.cpp".to_string()]);
        assert!(cov.outcome.passed);
        assert_eq!(platform.provisioned(), 1);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn test_coverage_failure_is_classified_and_sandbox_released() {
        let platform = system();
        let svc = service(&platform, 2);
        // not instrumented: extraction fails after the container exists
        let snap = snapshot(&platform, BASE);
        let err = svc
            .compute_test_coverage(&snap, &TestCase::named("t1"))
            .expect_err("must fail");
        assert_eq!(err.kind(), "FailedToComputeCoverage");
        assert_eq!(platform.provisioned(), 1);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn compute_coverage_bounds_live_sandboxes() {
        let platform = system();
        platform.set_test_delay(Duration::from_millis(30));
        let svc = service(&platform, 2);
        let snap = snapshot(&platform, INSTR);
        let cov = svc.compute_coverage(&snap, &snap.tests).expect("coverage");
        assert_eq!(cov.len(), 4);
        assert!(platform.peak() <= 2, "peak was {}", platform.peak());
        assert_eq!(platform.provisioned(), 4);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn compute_coverage_is_partition_independent() {
        let platform = system();
        let svc = service(&platform, 3);
        let snap = snapshot(&platform, INSTR);
        let all = svc.compute_coverage(&snap, &snap.tests).expect("all");
        let (left, right) = snap.tests.split_at(1);
        let merged = svc
            .compute_coverage(&snap, right)
            .expect("right")
            .merge(svc.compute_coverage(&snap, left).expect("left"));
        assert_eq!(all, merged);
    }

    #[test]
    fn compute_coverage_error_releases_every_sandbox() {
        let platform = system();
        let svc = service(&platform, 2);
        let snap = snapshot(&platform, INSTR);
        let mut tests = snap.tests.clone();
        tests.push(TestCase::named("missing"));
        let err = svc.compute_coverage(&snap, &tests).expect_err("unknown test");
        assert_eq!(err.kind(), "FailedToComputeCoverage");
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn mutant_coverage_reuses_entries_for_unrelated_tests() {
        let platform = system();
        let engine = FakeEngine::new(platform.clone());
        engine.add_mutation(flip_at(5), &["t2"]);
        let svc = service(&platform, 2);
        let instr = snapshot(&platform, INSTR);
        let baseline = svc.compute_coverage(&instr, &instr.tests).expect("baseline");
        let runs_before = platform.tests_run().len();

        let base = snapshot(&platform, BASE);
        let mutant = engine.mutate(&base, &[flip_at(5)]).expect("mutant");
        let cov = svc
            .compute_mutant_coverage(&engine, &instr, &mutant, &baseline)
            .expect("mutant coverage");

        let rerun: Vec<String> = platform.tests_run()[runs_before..]
            .iter()
            .map(|(_, t)| t.clone())
            .collect();
        let mut rerun_sorted = rerun.clone();
        rerun_sorted.sort();
        assert_eq!(rerun_sorted, vec!["t1", "t2", "t4"]);
        assert_eq!(cov.len(), 4);
        assert!(!cov.get("t2").expect("t2").outcome.passed);
        assert_eq!(cov.get("t3"), baseline.get("t3"));
        // the temporary instrumented variant is gone, the mutant itself is not
        assert_eq!(engine.live_mutants(), vec![mutant.id.clone()]);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn mutant_coverage_destroys_variant_on_failure() {
        let platform = system();
        let engine = FakeEngine::new(platform.clone());
        engine.add_mutation(flip_at(5), &["t2"]);
        let svc = service(&platform, 2);
        let instr = snapshot(&platform, INSTR);
        let baseline = svc.compute_coverage(&instr, &instr.tests).expect("baseline");
        let base = snapshot(&platform, BASE);
        let mutant = engine.mutate(&base, &[flip_at(5)]).expect("mutant");
        let variant_id = mars_core::mutant_id(INSTR, &[flip_at(5)]).expect("id");
        platform.break_snapshot(&format!("mutant:{}", variant_id));

        let err = svc
            .compute_mutant_coverage(&engine, &instr, &mutant, &baseline)
            .expect_err("provisioning fails");
        assert_eq!(err.kind(), "FailedToComputeCoverage");
        assert_eq!(engine.live_mutants(), vec![mutant.id.clone()]);
        assert_eq!(engine.destroyed(), 1);
    }

    #[test]
    fn liveness_short_circuits_on_first_failure() {
        let platform = system();
        let engine = FakeEngine::new(platform.clone());
        engine.add_mutation(flip_at(5), &["t2", "t4"]);
        let svc = service(&platform, 2);
        let instr = snapshot(&platform, INSTR);
        let baseline = svc.compute_coverage(&instr, &instr.tests).expect("baseline");
        let before = platform.tests_run().len();
        let mutant = engine
            .mutate(&snapshot(&platform, BASE), &[flip_at(5)])
            .expect("mutant");

        assert!(mutant_fails_test(platform.as_ref(), &baseline, &mutant).expect("liveness"));
        let ran = &platform.tests_run()[before..];
        assert_eq!(ran.len(), 1, "ran {:?}", ran);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn liveness_only_considers_tests_covering_mutated_lines() {
        let platform = system();
        let engine = FakeEngine::new(platform.clone());
        // t3 fails but never executes src/a.cpp:1
        engine.add_mutation(flip_at(1), &["t3"]);
        let svc = service(&platform, 2);
        let instr = snapshot(&platform, INSTR);
        let baseline = svc.compute_coverage(&instr, &instr.tests).expect("baseline");
        let mutant = engine
            .mutate(&snapshot(&platform, BASE), &[flip_at(1)])
            .expect("mutant");
        assert!(!mutant_fails_test(platform.as_ref(), &baseline, &mutant).expect("liveness"));
        assert!(mutant.lines().contains(&FileLine::new("src/a.cpp", 1)));
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn baseline_cache_computes_once_and_persists() {
        let platform = system();
        let svc = service(&platform, 2);
        let instr = snapshot(&platform, INSTR);
        let dir = std::env::temp_dir().join(format!(
            "mars_baseline_cache_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let path = dir.join("baseline.coverage.json");
        let cache = BaselineCoverage::new(Some(path.clone()), MutableFiles::default());
        let first = cache.get(&svc, &instr).expect("first");
        let provisioned = platform.provisioned();
        let second = cache.get(&svc, &instr).expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(platform.provisioned(), provisioned);
        assert!(path.exists());

        let reloaded = BaselineCoverage::new(Some(path.clone()), MutableFiles::default());
        let loaded = reloaded.get(&svc, &instr).expect("loaded");
        assert_eq!(*loaded, *first);
        assert_eq!(platform.provisioned(), provisioned);
        let _ = std::fs::remove_dir_all(dir);
    }
}
