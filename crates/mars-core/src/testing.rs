//! In-memory collaborators for unit tests.
//!
//! `FakePlatform` keeps a behaviour table per snapshot (outcome and executed
//! lines for every test) and counts container usage, including the peak number
//! of simultaneously live containers. `FakeEngine` derives mutant snapshots from
//! a declared effect: the set of tests each mutation makes fail.

use crate::{
    mutant_id, Container, ExecOutcome, FileLine, FileLineSet, MutationEngine, Mutant, Mutation,
    SandboxPlatform, Snapshot, TestCase, TestOutcome,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FakeTest {
    pub passed: bool,
    pub lines: FileLineSet,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    snapshot: String,
    diffs: Vec<String>,
    last_lines: Option<FileLineSet>,
}

pub fn lines(spec: &[&str]) -> FileLineSet {
    spec.iter()
        .map(|s| s.parse::<FileLine>().expect("FILE:LINE"))
        .collect()
}

#[derive(Default)]
pub struct FakePlatform {
    snapshots: Mutex<BTreeMap<String, Snapshot>>,
    behaviour: Mutex<BTreeMap<String, BTreeMap<String, FakeTest>>>,
    sources: Mutex<BTreeMap<String, String>>,
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    fixes: Mutex<Vec<String>>,
    broken: Mutex<BTreeSet<String>>,
    test_delay: Mutex<Duration>,
    tests_run: Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
    provisioned: AtomicUsize,
    destroyed: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with tests given as `(test, passed, ["file:line", ..])`.
    pub fn add_snapshot(&self, name: &str, instrumented: bool, tests: &[(&str, bool, &[&str])]) {
        let snapshot = Snapshot {
            name: name.to_string(),
            image: None,
            source: None,
            build: None,
            instrumented,
            default_oracle: None,
            tests: tests.iter().map(|(t, _, _)| TestCase::named(*t)).collect(),
        };
        let table = tests
            .iter()
            .map(|(t, passed, covered)| {
                (
                    t.to_string(),
                    FakeTest {
                        passed: *passed,
                        lines: lines(covered),
                    },
                )
            })
            .collect();
        self.snapshots.lock().insert(name.to_string(), snapshot);
        self.behaviour.lock().insert(name.to_string(), table);
    }

    /// Registers a plain and an instrumented snapshot sharing one behaviour table.
    pub fn add_system(&self, baseline: &str, instrumented: &str, tests: &[(&str, bool, &[&str])]) {
        self.add_snapshot(baseline, false, tests);
        self.add_snapshot(instrumented, true, tests);
    }

    pub fn add_source(&self, file: &str, content: &str) {
        self.sources
            .lock()
            .insert(file.to_string(), content.to_string());
    }

    /// Any container whose applied diffs contain `text` passes every test.
    pub fn add_fix(&self, text: &str) {
        self.fixes.lock().push(text.to_string());
    }

    pub fn break_snapshot(&self, name: &str) {
        self.broken.lock().insert(name.to_string());
    }

    pub fn set_test_delay(&self, delay: Duration) {
        *self.test_delay.lock() = delay;
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn tests_run(&self) -> Vec<(String, String)> {
        self.tests_run.lock().clone()
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots.lock().contains_key(name)
    }

    fn derive(&self, base: &str, name: &str, kills: &BTreeSet<String>) -> Result<()> {
        let mut snapshot = self
            .snapshots
            .lock()
            .get(base)
            .cloned()
            .ok_or_else(|| anyhow!("unknown snapshot: {}", base))?;
        let mut table = self
            .behaviour
            .lock()
            .get(base)
            .cloned()
            .ok_or_else(|| anyhow!("no behaviour for snapshot: {}", base))?;
        for (test, behaviour) in table.iter_mut() {
            if kills.contains(test) {
                behaviour.passed = false;
            }
        }
        snapshot.name = name.to_string();
        self.snapshots.lock().insert(name.to_string(), snapshot);
        self.behaviour.lock().insert(name.to_string(), table);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.behaviour.lock().remove(name);
        self.snapshots
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown snapshot: {}", name))
    }

    fn container_state(&self, container: &Container) -> Result<FakeContainer> {
        self.containers
            .lock()
            .get(&container.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown container: {}", container.id))
    }
}

impl SandboxPlatform for FakePlatform {
    fn register(&self, snapshot: Snapshot) -> Result<()> {
        let inherited = {
            let snapshots = self.snapshots.lock();
            snapshots
                .values()
                .find(|s| s.tests == snapshot.tests && s.source == snapshot.source)
                .map(|s| s.name.clone())
        };
        if let Some(from) = inherited {
            let table = self.behaviour.lock().get(&from).cloned();
            if let Some(table) = table {
                self.behaviour
                    .lock()
                    .entry(snapshot.name.clone())
                    .or_insert(table);
            }
        }
        self.snapshots.lock().insert(snapshot.name.clone(), snapshot);
        Ok(())
    }

    fn snapshot(&self, name: &str) -> Result<Snapshot> {
        self.snapshots
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown snapshot: {}", name))
    }

    fn provision(&self, snapshot: &Snapshot) -> Result<Container> {
        if self.broken.lock().contains(&snapshot.name) {
            return Err(anyhow!("failed to provision {}", snapshot.name));
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                snapshot: snapshot.name.clone(),
                diffs: Vec::new(),
                last_lines: None,
            },
        );
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Container {
            id,
            snapshot: snapshot.name.clone(),
        })
    }

    fn run_test(&self, container: &Container, test: &TestCase) -> Result<TestOutcome> {
        let delay = *self.test_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let state = self.container_state(container)?;
        let behaviour = self
            .behaviour
            .lock()
            .get(&state.snapshot)
            .and_then(|table| table.get(&test.name))
            .cloned()
            .ok_or_else(|| anyhow!("unknown test {} in {}", test.name, state.snapshot))?;
        let fixed = {
            let fixes = self.fixes.lock();
            state
                .diffs
                .iter()
                .any(|d| fixes.iter().any(|fix| d.contains(fix.as_str())))
        };
        if let Some(entry) = self.containers.lock().get_mut(&container.id) {
            entry.last_lines = Some(behaviour.lines.clone());
        }
        self.tests_run
            .lock()
            .push((state.snapshot.clone(), test.name.clone()));
        Ok(TestOutcome {
            passed: behaviour.passed || fixed,
            duration: delay.as_secs_f64(),
        })
    }

    fn extract_coverage(&self, container: &Container) -> Result<FileLineSet> {
        let state = self.container_state(container)?;
        let instrumented = self
            .snapshots
            .lock()
            .get(&state.snapshot)
            .map(|s| s.instrumented)
            .unwrap_or(false);
        if !instrumented {
            return Err(anyhow!("snapshot {} is not instrumented", state.snapshot));
        }
        self.containers
            .lock()
            .get_mut(&container.id)
            .and_then(|entry| entry.last_lines.take())
            .ok_or_else(|| anyhow!("no coverage recorded in {}", container.id))
    }

    fn apply_diff(&self, container: &Container, diff: &str) -> Result<()> {
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(&container.id)
            .ok_or_else(|| anyhow!("unknown container: {}", container.id))?;
        entry.diffs.push(diff.to_string());
        Ok(())
    }

    fn exec(&self, container: &Container, _command: &str, _workdir: Option<&str>) -> Result<ExecOutcome> {
        let state = self.container_state(container)?;
        let broken = state.diffs.iter().any(|d| d.contains("BROKEN_BUILD"));
        Ok(ExecOutcome {
            code: Some(if broken { 1 } else { 0 }),
            output: String::new(),
            duration: 0.0,
        })
    }

    fn read_source(&self, _snapshot: &Snapshot, file: &str) -> Result<String> {
        self.sources
            .lock()
            .get(file)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", file))
    }

    fn destroy(&self, container: &Container) -> Result<()> {
        self.containers
            .lock()
            .remove(&container.id)
            .ok_or_else(|| anyhow!("unknown container: {}", container.id))?;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeEngine {
    platform: Arc<FakePlatform>,
    operators: Vec<String>,
    catalogue: Mutex<Vec<(Mutation, Vec<String>)>>,
    live: Mutex<BTreeSet<String>>,
    fail_mutate: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl FakeEngine {
    pub fn new(platform: Arc<FakePlatform>) -> Self {
        Self {
            platform,
            operators: crate::OrchestratorConfig::default().operators,
            catalogue: Mutex::new(Vec::new()),
            live: Mutex::new(BTreeSet::new()),
            fail_mutate: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Declares a mutation and the tests it makes fail.
    pub fn add_mutation(&self, mutation: Mutation, kills: &[&str]) {
        self.catalogue
            .lock()
            .push((mutation, kills.iter().map(|s| s.to_string()).collect()));
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutate.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live_mutants(&self) -> Vec<String> {
        self.live.lock().iter().cloned().collect()
    }
}

impl MutationEngine for FakeEngine {
    fn operators(&self) -> Vec<String> {
        self.operators.clone()
    }

    fn mutations(
        &self,
        _snapshot: &Snapshot,
        file: &str,
        line: Option<usize>,
        operators: &[String],
    ) -> Result<Vec<Mutation>> {
        Ok(self
            .catalogue
            .lock()
            .iter()
            .map(|(m, _)| m)
            .filter(|m| m.location.file == file)
            .filter(|m| line.map(|l| m.location.start.line == l).unwrap_or(true))
            .filter(|m| operators.iter().any(|op| *op == m.operator))
            .cloned()
            .collect())
    }

    fn mutate(&self, snapshot: &Snapshot, mutations: &[Mutation]) -> Result<Mutant> {
        if self.fail_mutate.load(Ordering::SeqCst) {
            return Err(anyhow!("mutation engine unavailable"));
        }
        let kills: BTreeSet<String> = {
            let catalogue = self.catalogue.lock();
            mutations
                .iter()
                .flat_map(|m| {
                    catalogue
                        .iter()
                        .filter(|(known, _)| known == m)
                        .flat_map(|(_, kills)| kills.clone())
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let id = mutant_id(&snapshot.name, mutations)?;
        let name = format!("mutant:{}", id);
        self.platform.derive(&snapshot.name, &name, &kills)?;
        self.live.lock().insert(id.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Mutant {
            id,
            base: snapshot.name.clone(),
            snapshot: name,
            mutations: mutations.to_vec(),
        })
    }

    fn destroy(&self, mutant: &Mutant) -> Result<()> {
        if !self.live.lock().remove(&mutant.id) {
            return Err(anyhow!("unknown mutant: {}", mutant.id));
        }
        self.platform.remove(&mutant.snapshot)?;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
