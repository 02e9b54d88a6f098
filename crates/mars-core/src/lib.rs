use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub const DEFAULT_KILL_AFTER_SECS: u64 = 10;

/* ---------- source locations ---------- */

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileLine {
    pub file: String,
    pub line: usize,
}

impl FileLine {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for FileLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl FromStr for FileLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (file, line) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("expected FILE:LINE, got {}", s))?;
        let line = line
            .parse::<usize>()
            .with_context(|| format!("invalid line number in {}", s))?;
        if file.is_empty() {
            return Err(anyhow!("missing file name in {}", s));
        }
        Ok(FileLine::new(file, line))
    }
}

/// A set of lines grouped by file. Iteration order is sorted by file, then line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileLineSet {
    lines: BTreeMap<String, BTreeSet<usize>>,
}

impl FileLineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, line: FileLine) {
        self.lines.entry(line.file).or_default().insert(line.line);
    }

    pub fn contains(&self, line: &FileLine) -> bool {
        self.lines
            .get(&line.file)
            .map(|lines| lines.contains(&line.line))
            .unwrap_or(false)
    }

    pub fn contains_file(&self, file: &str) -> bool {
        self.lines.contains_key(file)
    }

    pub fn files(&self) -> Vec<String> {
        self.lines.keys().cloned().collect()
    }

    pub fn lines_in(&self, file: &str) -> Option<&BTreeSet<usize>> {
        self.lines.get(file)
    }

    pub fn len(&self) -> usize {
        self.lines.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = FileLine> + '_ {
        self.lines.iter().flat_map(|(file, lines)| {
            lines
                .iter()
                .map(move |line| FileLine::new(file.clone(), *line))
        })
    }

    pub fn extend(&mut self, other: &FileLineSet) {
        for (file, lines) in &other.lines {
            self.lines
                .entry(file.clone())
                .or_default()
                .extend(lines.iter().copied());
        }
    }

    pub fn restricted_to_files<F>(&self, keep: F) -> FileLineSet
    where
        F: Fn(&str) -> bool,
    {
        FileLineSet {
            lines: self
                .lines
                .iter()
                .filter(|(file, lines)| keep(file) && !lines.is_empty())
                .map(|(file, lines)| (file.clone(), lines.clone()))
                .collect(),
        }
    }
}

impl FromIterator<FileLine> for FileLineSet {
    fn from_iter<I: IntoIterator<Item = FileLine>>(iter: I) -> Self {
        let mut set = FileLineSet::new();
        for line in iter {
            set.insert(line);
        }
        set
    }
}

/// A 1-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open character range `[start, stop)` within one file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileLocationRange {
    pub file: String,
    pub start: Location,
    pub stop: Location,
}

impl FileLocationRange {
    pub fn new(file: impl Into<String>, start: Location, stop: Location) -> Self {
        Self {
            file: file.into(),
            start,
            stop,
        }
    }

    /// Every line the half-open range touches. A stop at column 1 of a
    /// later line touches nothing on that line.
    pub fn lines(&self) -> Vec<FileLine> {
        let mut last = self.stop.line.max(self.start.line);
        if self.stop.column == 1 && self.stop.line > self.start.line {
            last -= 1;
        }
        (self.start.line..=last)
            .map(|line| FileLine::new(self.file.clone(), line))
            .collect()
    }
}

impl fmt::Display for FileLocationRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}::{}", self.file, self.start, self.stop)
    }
}

/// Replaces the text covered by `[start, stop)` in `source`.
pub fn splice(source: &str, start: Location, stop: Location, replacement: &str) -> Result<String> {
    let from = byte_offset(source, start)?;
    let to = byte_offset(source, stop)?;
    if to < from {
        return Err(anyhow!("range {}::{} is inverted", start, stop));
    }
    let mut out = String::with_capacity(source.len() + replacement.len());
    out.push_str(&source[..from]);
    out.push_str(replacement);
    out.push_str(&source[to..]);
    Ok(out)
}

fn byte_offset(source: &str, loc: Location) -> Result<usize> {
    if loc.line == 0 || loc.column == 0 {
        return Err(anyhow!("locations are 1-based, got {}", loc));
    }
    let mut offset = 0;
    for (idx, line) in source.split_inclusive('\n').enumerate() {
        if idx + 1 == loc.line {
            let body = line.trim_end_matches('\n');
            let col = loc.column - 1;
            return body
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(body.len()))
                .nth(col)
                .map(|i| offset + i)
                .ok_or_else(|| anyhow!("column out of range at {}", loc));
        }
        offset += line.len();
    }
    // a location one past the final newline addresses the empty trailing line
    if loc.column == 1 && loc.line == source.split_inclusive('\n').count() + 1 {
        return Ok(source.len());
    }
    Err(anyhow!("line out of range at {}", loc))
}

/* ---------- snapshots and tests ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oracle {
    pub contains: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub kill_after: Option<u64>,
    #[serde(default)]
    pub oracle: Option<Oracle>,
}

impl TestCase {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            kill_after: None,
            oracle: None,
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.kill_after.unwrap_or(DEFAULT_KILL_AFTER_SECS))
    }
}

/// Description of a buildable, testable version of the system under repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub instrumented: bool,
    #[serde(default)]
    pub default_oracle: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl Snapshot {
    pub fn test(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// The same system with coverage collection switched on.
    pub fn instrumented_as(&self, name: &str) -> Snapshot {
        let mut snapshot = self.clone();
        snapshot.name = name.to_string();
        snapshot.instrumented = true;
        snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    /// Wall-clock seconds.
    pub duration: f64,
}

impl TestOutcome {
    pub fn new(passed: bool, duration: Duration) -> Self {
        Self {
            passed,
            duration: duration.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCoverage {
    pub test: String,
    pub outcome: TestOutcome,
    pub lines: FileLineSet,
}

/// Per-test coverage keyed by (unique) test name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestSuiteCoverage {
    tests: BTreeMap<String, TestCoverage>,
}

impl TestSuiteCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coverage: TestCoverage) {
        self.tests.insert(coverage.test.clone(), coverage);
    }

    pub fn get(&self, test: &str) -> Option<&TestCoverage> {
        self.tests.get(test)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn test_names(&self) -> Vec<String> {
        self.tests.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCoverage> {
        self.tests.values()
    }

    pub fn passing(&self) -> TestSuiteCoverage {
        self.tests
            .values()
            .filter(|c| c.outcome.passed)
            .cloned()
            .collect()
    }

    pub fn failing(&self) -> TestSuiteCoverage {
        self.tests
            .values()
            .filter(|c| !c.outcome.passed)
            .cloned()
            .collect()
    }

    /// Union of the lines executed by any test.
    pub fn lines(&self) -> FileLineSet {
        let mut lines = FileLineSet::new();
        for coverage in self.tests.values() {
            lines.extend(&coverage.lines);
        }
        lines
    }

    pub fn restricted_to_files<F>(&self, keep: F) -> TestSuiteCoverage
    where
        F: Fn(&str) -> bool,
    {
        self.tests
            .values()
            .map(|c| TestCoverage {
                test: c.test.clone(),
                outcome: c.outcome,
                lines: c.lines.restricted_to_files(&keep),
            })
            .collect()
    }

    /// Name-keyed union; entries of `newer` win on collision.
    pub fn merge(mut self, newer: TestSuiteCoverage) -> TestSuiteCoverage {
        self.tests.extend(newer.tests);
        self
    }

    pub fn tests_covering_file(&self, file: &str) -> BTreeSet<String> {
        self.tests
            .values()
            .filter(|c| c.lines.contains_file(file))
            .map(|c| c.test.clone())
            .collect()
    }

    pub fn tests_covering_any(&self, lines: &[FileLine]) -> BTreeSet<String> {
        self.tests
            .values()
            .filter(|c| lines.iter().any(|l| c.lines.contains(l)))
            .map(|c| c.test.clone())
            .collect()
    }
}

impl FromIterator<TestCoverage> for TestSuiteCoverage {
    fn from_iter<I: IntoIterator<Item = TestCoverage>>(iter: I) -> Self {
        let mut suite = TestSuiteCoverage::new();
        for coverage in iter {
            suite.insert(coverage);
        }
        suite
    }
}

/* ---------- mutations ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutation {
    pub operator: String,
    pub location: FileLocationRange,
    pub replacement: String,
}

/// A snapshot derived from a base by applying mutations. Whoever creates it destroys it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutant {
    pub id: String,
    pub base: String,
    pub snapshot: String,
    pub mutations: Vec<Mutation>,
}

impl Mutant {
    pub fn files(&self) -> BTreeSet<String> {
        self.mutations
            .iter()
            .map(|m| m.location.file.clone())
            .collect()
    }

    pub fn lines(&self) -> Vec<FileLine> {
        let set: BTreeSet<FileLine> = self
            .mutations
            .iter()
            .flat_map(|m| m.location.lines())
            .collect();
        set.into_iter().collect()
    }
}

/// Deterministic id for the result of applying `mutations` to `base`.
pub fn mutant_id(base: &str, mutations: &[Mutation]) -> Result<String> {
    let payload = serde_json::to_vec(&(base, mutations))?;
    let digest = sha256_bytes(&payload);
    Ok(digest[..16].to_string())
}

/* ---------- sandboxes ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub code: Option<i32>,
    pub output: String,
    pub duration: f64,
}

impl ExecOutcome {
    pub fn successful(&self) -> bool {
        self.code == Some(0)
    }
}

/* ---------- static analysis ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFact {
    pub file: String,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub returns_void: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFacts {
    pub functions: Vec<FunctionFact>,
}

impl StaticFacts {
    /// Innermost function whose body spans `line`.
    pub fn enclosing_function(&self, line: &FileLine) -> Option<&FunctionFact> {
        self.functions
            .iter()
            .filter(|f| f.file == line.file && f.start_line < line.line && line.line < f.end_line)
            .min_by_key(|f| f.end_line - f.start_line)
    }
}

/* ---------- pattern matching ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub start: Location,
    pub stop: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub start: Location,
    pub stop: Location,
    /// Captured holes keyed by their number (as written in the template).
    pub environment: BTreeMap<String, Fragment>,
}

/* ---------- collaborators ---------- */

pub trait SandboxPlatform: Send + Sync {
    fn register(&self, snapshot: Snapshot) -> Result<()>;
    fn snapshot(&self, name: &str) -> Result<Snapshot>;
    fn provision(&self, snapshot: &Snapshot) -> Result<Container>;
    fn run_test(&self, container: &Container, test: &TestCase) -> Result<TestOutcome>;
    fn extract_coverage(&self, container: &Container) -> Result<FileLineSet>;
    fn apply_diff(&self, container: &Container, diff: &str) -> Result<()>;
    fn exec(&self, container: &Container, command: &str, workdir: Option<&str>)
        -> Result<ExecOutcome>;
    fn read_source(&self, snapshot: &Snapshot, file: &str) -> Result<String>;
    fn destroy(&self, container: &Container) -> Result<()>;
}

pub trait MutationEngine: Send + Sync {
    fn operators(&self) -> Vec<String>;
    fn mutations(
        &self,
        snapshot: &Snapshot,
        file: &str,
        line: Option<usize>,
        operators: &[String],
    ) -> Result<Vec<Mutation>>;
    fn mutate(&self, snapshot: &Snapshot, mutations: &[Mutation]) -> Result<Mutant>;
    fn destroy(&self, mutant: &Mutant) -> Result<()>;
}

pub trait PatternMatcher: Send + Sync {
    fn matches(&self, source: &str, template: &str) -> Result<Vec<Match>>;
}

pub trait Analyzer: Send + Sync {
    fn analyze(&self, snapshot: &Snapshot, files: &[String]) -> Result<StaticFacts>;
}

/// Releases its container when dropped.
pub struct ContainerGuard<'a> {
    platform: &'a dyn SandboxPlatform,
    container: Container,
}

impl<'a> ContainerGuard<'a> {
    pub fn provision(platform: &'a dyn SandboxPlatform, snapshot: &Snapshot) -> Result<Self> {
        let container = platform.provision(snapshot)?;
        Ok(Self {
            platform,
            container,
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.platform.destroy(&self.container) {
            warn!(container = %self.container.id, "failed to destroy container: {:#}", err);
        }
    }
}

/// Destroys its mutant when dropped unless released with [`MutantGuard::keep`].
pub struct MutantGuard<'a> {
    engine: &'a dyn MutationEngine,
    mutant: Mutant,
    armed: bool,
}

impl<'a> MutantGuard<'a> {
    pub fn new(engine: &'a dyn MutationEngine, mutant: Mutant) -> Self {
        Self {
            engine,
            mutant,
            armed: true,
        }
    }

    pub fn mutant(&self) -> &Mutant {
        &self.mutant
    }

    pub fn keep(mut self) -> Mutant {
        self.armed = false;
        self.mutant.clone()
    }
}

impl Drop for MutantGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.engine.destroy(&self.mutant) {
            warn!(mutant = %self.mutant.id, "failed to destroy mutant: {:#}", err);
        }
    }
}

/* ---------- errors ---------- */

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator is not ready to accept a perturbation")]
    NotReadyToPerturb,
    #[error("orchestrator is not ready to adapt")]
    NotReadyToAdapt,
    #[error("invalid perturbation: no test failures")]
    NeutralPerturbation,
    #[error("invalid perturbation: failed to obtain coverage information ({reason})")]
    FailedToComputeCoverage { reason: String },
    #[error("a time limit or an attempt limit must be given")]
    NoSearchLimits,
    #[error("file does not exist or may not be perturbed: {0}")]
    FileNotFound(String),
    #[error("line does not exist or may not be perturbed: {0}")]
    LineNotFound(FileLine),
    #[error("operator does not exist: {0}")]
    OperatorNotFound(String),
    #[error("unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn coverage(reason: impl fmt::Display) -> Self {
        OrchestratorError::FailedToComputeCoverage {
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NotReadyToPerturb => "NotReadyToPerturb",
            OrchestratorError::NotReadyToAdapt => "NotReadyToAdapt",
            OrchestratorError::NeutralPerturbation => "NeutralPerturbation",
            OrchestratorError::FailedToComputeCoverage { .. } => "FailedToComputeCoverage",
            OrchestratorError::NoSearchLimits => "NoSearchLimits",
            OrchestratorError::FileNotFound(_) => "FileNotFound",
            OrchestratorError::LineNotFound(_) => "LineNotFound",
            OrchestratorError::OperatorNotFound(_) => "OperatorNotFound",
            OrchestratorError::Unexpected(_) => "UnexpectedError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::NotReadyToPerturb | OrchestratorError::NotReadyToAdapt => 409,
            OrchestratorError::Unexpected(_) => 500,
            _ => 400,
        }
    }
}

/* ---------- configuration ---------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutableFiles {
    pub extensions: Vec<String>,
    /// Ordered path prefixes that are never perturbed.
    pub exclude: Vec<String>,
}

impl Default for MutableFiles {
    fn default() -> Self {
        Self {
            extensions: vec![".cpp".to_string()],
            exclude: Vec::new(),
        }
    }
}

impl MutableFiles {
    pub fn is_mutable(&self, file: &str) -> bool {
        let extension_ok =
            self.extensions.is_empty() || self.extensions.iter().any(|ext| file.ends_with(ext));
        extension_ok && !self.exclude.iter().any(|prefix| file.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// May contain `{package}`.
    pub command: Option<String>,
    pub workdir: Option<String>,
    /// Top-level directories that hold several packages each.
    pub stacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub donor_schemas: bool,
    pub donor_samples: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            donor_schemas: false,
            donor_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".mars"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub baseline: String,
    pub instrumented_baseline: String,
    pub threads: usize,
    pub seed: u64,
    pub operators: Vec<String>,
    pub mutable_files: MutableFiles,
    pub coverage_cache: Option<PathBuf>,
    pub donor_pool: Option<PathBuf>,
    pub build: BuildConfig,
    pub search: SearchConfig,
    pub local: LocalConfig,
    pub server: ServerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            baseline: "mars:baseline".to_string(),
            instrumented_baseline: "mars:instrument".to_string(),
            threads: 4,
            seed: 0,
            operators: [
                "delete-void-function-call",
                "flip-arithmetic-operator",
                "flip-boolean-operator",
                "flip-relational-operator",
                "delete-conditional-control-flow",
                "flip-signedness",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            mutable_files: MutableFiles::default(),
            coverage_cache: None,
            donor_pool: None,
            build: BuildConfig::default(),
            search: SearchConfig::default(),
            local: LocalConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: OrchestratorConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.max(1)
    }
}

/* ---------- fs helpers ---------- */

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
