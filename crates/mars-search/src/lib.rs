//! Repair problems, the lazy candidate search space and the bounded
//! candidate evaluation loop.

use anyhow::{anyhow, Context, Result};
use mars_core::{
    atomic_write_json_pretty, load_json_file, splice, BuildConfig, ContainerGuard, FileLine,
    FileLocationRange, Fragment, Location, Match, Mutant, OrchestratorConfig, PatternMatcher,
    SandboxPlatform, Snapshot, StaticFacts, TestCase, TestOutcome, TestSuiteCoverage,
};
use mars_localize::Localization;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/* ---------- problem ---------- */

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProblemError {
    #[error("coverage contains no failing tests")]
    NoFailingTests,
}

/// A perturbed snapshot together with the evidence needed to repair it.
#[derive(Debug, Clone)]
pub struct RepairProblem {
    pub snapshot: Snapshot,
    pub mutant: Mutant,
    pub coverage: TestSuiteCoverage,
    pub facts: StaticFacts,
}

impl RepairProblem {
    pub fn new(
        snapshot: Snapshot,
        mutant: Mutant,
        coverage: TestSuiteCoverage,
        facts: StaticFacts,
    ) -> Result<Self, ProblemError> {
        if coverage.failing().is_empty() {
            return Err(ProblemError::NoFailingTests);
        }
        Ok(Self {
            snapshot,
            mutant,
            coverage,
            facts,
        })
    }

    pub fn failing_tests(&self) -> Vec<String> {
        self.coverage.failing().test_names()
    }

    pub fn mutated_files(&self) -> Vec<String> {
        self.mutant.files().into_iter().collect()
    }

    /// Tests of the snapshot, those failing under coverage first.
    pub fn tests(&self) -> Vec<TestCase> {
        let failing: BTreeSet<String> = self.failing_tests().into_iter().collect();
        let mut tests = self.snapshot.tests.clone();
        tests.sort_by_key(|t| !failing.contains(&t.name));
        tests
    }
}

/* ---------- transformation schemas ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub name: &'static str,
    pub pattern: &'static str,
    pub rewrite: &'static str,
}

const fn schema(name: &'static str, pattern: &'static str, rewrite: &'static str) -> Schema {
    Schema {
        name,
        pattern,
        rewrite,
    }
}

pub const SCHEMAS: &[Schema] = &[
    schema("AndToOr", ":[1] && :[2]", ":[1] || :[2]"),
    schema("OrToAnd", ":[1] || :[2]", ":[1] && :[2]"),
    schema("LEToGT", ":[1] <= :[2]", ":[1] > :[2]"),
    schema("GTToLE", ":[1] > :[2]", ":[1] <= :[2]"),
    schema("GEToLT", ":[1] >= :[2]", ":[1] < :[2]"),
    schema("LTToGE", ":[1] < :[2]", ":[1] >= :[2]"),
    schema("EQToNEQ", ":[1] == :[2]", ":[1] != :[2]"),
    schema("NEQToEQ", ":[1] != :[2]", ":[1] == :[2]"),
    schema("PlusToMinus", ":[1] + :[2]", ":[1] - :[2]"),
    schema("MinusToPlus", ":[1] - :[2]", ":[1] + :[2]"),
    schema("MulToDiv", ":[1] * :[2]", ":[1] / :[2]"),
    schema("DivToMul", ":[1] / :[2]", ":[1] * :[2]"),
    schema("SignedToUnsigned", "int :[1] =", "unsigned int :[1] ="),
];

pub const INSERT_CONDITIONAL_RETURN: &str = "InsertConditionalReturn";

/// Fills the `:[n]` holes of `template` from a match environment.
pub fn instantiate(template: &str, environment: &BTreeMap<String, Fragment>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find(":[") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find(']')
            .ok_or_else(|| anyhow!("unterminated hole in template: {}", template))?;
        let name = &after[..close];
        let fragment = environment
            .get(name)
            .ok_or_else(|| anyhow!("hole :[{}] is unbound in template: {}", name, template))?;
        out.push_str(&fragment.text);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    pub schema: String,
    pub location: FileLocationRange,
    pub replacement: String,
}

/// A patch: a set of transformations plus the unified diff they produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub transformations: Vec<Transformation>,
    pub diff: String,
}

impl Candidate {
    pub fn new(
        transformations: Vec<Transformation>,
        sources: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let diff = render_diff(&transformations, sources)?;
        Ok(Self {
            transformations,
            diff,
        })
    }

    /// Modified files in order of first appearance.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for t in &self.transformations {
            if !files.contains(&t.location.file) {
                files.push(t.location.file.clone());
            }
        }
        files
    }
}

fn render_diff(
    transformations: &[Transformation],
    sources: &BTreeMap<String, String>,
) -> Result<String> {
    let mut by_file: BTreeMap<&str, Vec<&Transformation>> = BTreeMap::new();
    for t in transformations {
        by_file.entry(t.location.file.as_str()).or_default().push(t);
    }
    let mut diff = String::new();
    for (file, mut edits) in by_file {
        let original = sources
            .get(file)
            .ok_or_else(|| anyhow!("source of {} is unavailable", file))?;
        // later edits first so earlier locations stay valid
        edits.sort_by(|a, b| b.location.start.cmp(&a.location.start));
        let mut patched = original.clone();
        for edit in edits {
            patched = splice(
                &patched,
                edit.location.start,
                edit.location.stop,
                &edit.replacement,
            )
            .with_context(|| format!("failed to apply {} at {}", edit.schema, edit.location))?;
        }
        if patched == *original {
            continue;
        }
        let text = TextDiff::from_lines(original.as_str(), patched.as_str())
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{}", file), &format!("b/{}", file))
            .to_string();
        diff.push_str(&text);
    }
    if diff.is_empty() {
        return Err(anyhow!("candidate leaves the source unchanged"));
    }
    Ok(diff)
}

/* ---------- donor pool ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub content: String,
    /// Originating location, `file@line:col::line:col`.
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DonorPool {
    snippets: Vec<Snippet>,
}

pub const GUARD_SCHEMA: &str = "if (:[1])";

impl DonorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `snippet` unless a snippet with the same content is present.
    pub fn insert(&mut self, snippet: Snippet) -> bool {
        if self.snippets.iter().any(|s| s.content == snippet.content) {
            return false;
        }
        self.snippets.push(snippet);
        true
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    pub fn snippets(&self) -> &[Snippet] {
        &self.snippets
    }

    pub fn at(&self, location: &str) -> Option<&Snippet> {
        self.snippets.iter().find(|s| s.location == location)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, amount: usize) -> Vec<&Snippet> {
        self.snippets.choose_multiple(rng, amount).collect()
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::new());
        };
        info!(path = %path.display(), "loading donor pool");
        let pool: DonorPool = load_json_file(path)?;
        info!(snippets = pool.len(), "loaded donor pool");
        Ok(pool)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), snippets = self.len(), "writing donor pool");
        atomic_write_json_pretty(path, self)
    }
}

/// Collects the condition of every `if` statement in `files` as a snippet.
pub fn extract_guards(
    platform: &dyn SandboxPlatform,
    matcher: &dyn PatternMatcher,
    snapshot: &Snapshot,
    files: &[String],
) -> Result<DonorPool> {
    let mut pool = DonorPool::new();
    for file in files {
        info!(file = %file, "finding snippets in file");
        let source = platform
            .read_source(snapshot, file)
            .with_context(|| format!("failed to read {} from {}", file, snapshot.name))?;
        for found in matcher.matches(&source, GUARD_SCHEMA)? {
            let Some(guard) = found.environment.get("1") else {
                continue;
            };
            let location = FileLocationRange::new(file.as_str(), guard.start, guard.stop);
            let added = pool.insert(Snippet {
                content: guard.text.clone(),
                location: location.to_string(),
            });
            if added {
                debug!(file = %file, snippet = %guard.text, "found snippet");
            }
        }
    }
    info!(snippets = pool.len(), "found snippets");
    Ok(pool)
}

/* ---------- search space ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceOptions {
    pub seed: u64,
    pub donor_schemas: bool,
    pub donor_samples: usize,
}

impl SpaceOptions {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            seed: config.seed,
            donor_schemas: config.search.donor_schemas,
            donor_samples: config.search.donor_samples,
        }
    }
}

/// Single-edit candidates, generated location by location on demand.
///
/// Locations are visited in a seeded order biased toward suspicious lines.
/// Sources and schema matches are cached per file.
pub struct SearchSpace {
    problem: Arc<RepairProblem>,
    platform: Arc<dyn SandboxPlatform>,
    matcher: Arc<dyn PatternMatcher>,
    donors: DonorPool,
    options: SpaceOptions,
    rng: StdRng,
    locations: std::vec::IntoIter<FileLine>,
    pending: VecDeque<Candidate>,
    sources: BTreeMap<String, String>,
    unreadable: BTreeSet<String>,
    matches: HashMap<(String, &'static str), Vec<Match>>,
}

pub fn build_search_space(
    problem: Arc<RepairProblem>,
    localization: &Localization,
    platform: Arc<dyn SandboxPlatform>,
    matcher: Arc<dyn PatternMatcher>,
    donors: DonorPool,
    options: SpaceOptions,
) -> SearchSpace {
    info!("constructing search space");
    let mut rng = StdRng::seed_from_u64(options.seed);
    let locations = localization.weighted_order(&mut rng);
    info!(
        locations = locations.len(),
        donors = donors.len(),
        "constructed search space"
    );
    SearchSpace {
        problem,
        platform,
        matcher,
        donors,
        options,
        rng,
        locations: locations.into_iter(),
        pending: VecDeque::new(),
        sources: BTreeMap::new(),
        unreadable: BTreeSet::new(),
        matches: HashMap::new(),
    }
}

impl SearchSpace {
    fn ensure_source(&mut self, file: &str) -> bool {
        if self.sources.contains_key(file) {
            return true;
        }
        if self.unreadable.contains(file) {
            return false;
        }
        match self.platform.read_source(&self.problem.snapshot, file) {
            Ok(text) => {
                self.sources.insert(file.to_string(), text);
                true
            }
            Err(err) => {
                warn!(file = %file, "skipping unreadable file: {:#}", err);
                self.unreadable.insert(file.to_string());
                false
            }
        }
    }

    fn ensure_matches(&mut self, file: &str, schema: &Schema) {
        let key = (file.to_string(), schema.name);
        if self.matches.contains_key(&key) {
            return;
        }
        let found = match self.sources.get(file) {
            Some(source) => self
                .matcher
                .matches(source, schema.pattern)
                .unwrap_or_else(|err| {
                    warn!(file = %file, schema = schema.name, "pattern matching failed: {:#}", err);
                    Vec::new()
                }),
            None => Vec::new(),
        };
        self.matches.insert(key, found);
    }

    fn candidates_at(&mut self, line: &FileLine) -> Vec<Candidate> {
        if !self.ensure_source(&line.file) {
            return Vec::new();
        }
        for schema in SCHEMAS {
            self.ensure_matches(&line.file, schema);
        }
        let Some(source) = self.sources.get(&line.file) else {
            return Vec::new();
        };

        let mut transformations = Vec::new();
        for schema in SCHEMAS {
            let Some(matches) = self.matches.get(&(line.file.clone(), schema.name)) else {
                continue;
            };
            for found in matches.iter().filter(|m| m.start.line == line.line) {
                match instantiate(schema.rewrite, &found.environment) {
                    Ok(replacement) => transformations.push(Transformation {
                        schema: schema.name.to_string(),
                        location: FileLocationRange::new(line.file.as_str(), found.start, found.stop),
                        replacement,
                    }),
                    Err(err) => debug!(schema = schema.name, "skipping match: {:#}", err),
                }
            }
        }
        if self.options.donor_schemas {
            transformations.extend(conditional_returns(
                line,
                source,
                &self.problem.facts,
                &self.donors,
                &mut self.rng,
                self.options.donor_samples,
            ));
        }

        transformations
            .into_iter()
            .filter_map(|t| match Candidate::new(vec![t], &self.sources) {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    debug!(line = %line, "discarding candidate: {:#}", err);
                    None
                }
            })
            .collect()
    }
}

fn conditional_returns(
    line: &FileLine,
    source: &str,
    facts: &StaticFacts,
    donors: &DonorPool,
    rng: &mut StdRng,
    samples: usize,
) -> Vec<Transformation> {
    match facts.enclosing_function(line) {
        Some(function) if function.returns_void => {}
        _ => return Vec::new(),
    }
    let Some(text) = line.line.checked_sub(1).and_then(|idx| source.lines().nth(idx)) else {
        return Vec::new();
    };
    let indent: String = text.chars().take_while(|c| c.is_whitespace()).collect();
    let at = Location::new(line.line, 1);
    donors
        .sample(rng, samples)
        .into_iter()
        .map(|snippet| Transformation {
            schema: INSERT_CONDITIONAL_RETURN.to_string(),
            location: FileLocationRange::new(line.file.as_str(), at, at),
            replacement: format!("{}if ({}) {{ return; }}\n", indent, snippet.content),
        })
        .collect()
}

impl Iterator for SearchSpace {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        loop {
            if let Some(candidate) = self.pending.pop_front() {
                return Some(candidate);
            }
            let line = self.locations.next()?;
            let found = self.candidates_at(&line);
            debug!(line = %line, candidates = found.len(), "expanded location");
            self.pending.extend(found);
        }
    }
}

/* ---------- evaluation ---------- */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchLimits {
    pub time: Option<Duration>,
    pub attempts: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub successful: bool,
    pub duration: f64,
}

impl BuildOutcome {
    fn trivial(successful: bool) -> Self {
        Self {
            successful,
            duration: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    pub candidate: Candidate,
    pub build: BuildOutcome,
    pub tests: BTreeMap<String, TestOutcome>,
    pub is_repair: bool,
}

impl CandidateEvaluation {
    pub fn diff(&self) -> &str {
        &self.candidate.diff
    }
}

/// Package of a workspace path such as `src/<pkg>/..` or `src/<stack>/<pkg>/..`.
pub fn package_of(file: &str, stacks: &[String]) -> Option<String> {
    let parts: Vec<&str> = file.split('/').skip(1).collect();
    let first = *parts.first()?;
    if stacks.iter().any(|s| s == first) {
        if parts.len() < 3 {
            return None;
        }
        return Some(parts[1].to_string());
    }
    if parts.len() < 2 {
        return None;
    }
    Some(first.to_string())
}

/// Evaluates candidates until the stream ends or a limit is reached.
pub struct Searcher<I> {
    platform: Arc<dyn SandboxPlatform>,
    problem: Arc<RepairProblem>,
    build: BuildConfig,
    candidates: I,
    limits: SearchLimits,
    tests: Vec<TestCase>,
    started: Instant,
    evaluations: usize,
    exhausted: bool,
}

impl<I: Iterator<Item = Candidate>> Searcher<I> {
    pub fn new(
        platform: Arc<dyn SandboxPlatform>,
        problem: Arc<RepairProblem>,
        build: BuildConfig,
        candidates: I,
        limits: SearchLimits,
    ) -> Self {
        let tests = problem.tests();
        Self {
            platform,
            problem,
            build,
            candidates,
            limits,
            tests,
            started: Instant::now(),
            evaluations: 0,
            exhausted: false,
        }
    }

    pub fn num_candidate_evals(&self) -> usize {
        self.evaluations
    }

    pub fn time_running(&self) -> Duration {
        self.started.elapsed()
    }

    fn limit_reached(&self) -> bool {
        if let Some(attempts) = self.limits.attempts {
            if self.evaluations >= attempts {
                info!(attempts, "reached attempt limit");
                return true;
            }
        }
        if let Some(time) = self.limits.time {
            if self.started.elapsed() >= time {
                info!(seconds = time.as_secs(), "reached time limit");
                return true;
            }
        }
        false
    }

    fn build_patch(
        &self,
        container: &mars_core::Container,
        candidate: &Candidate,
    ) -> Result<BuildOutcome> {
        let (command, workdir) = match (&self.build.command, &self.problem.snapshot.build) {
            (Some(template), _) if template.contains("{package}") => {
                let package = candidate
                    .files()
                    .first()
                    .and_then(|f| package_of(f, &self.build.stacks));
                let Some(package) = package else {
                    warn!("could not determine the package modified by the patch");
                    return Ok(BuildOutcome::trivial(false));
                };
                (
                    template.replace("{package}", &package),
                    self.build.workdir.clone(),
                )
            }
            (Some(command), _) => (command.clone(), self.build.workdir.clone()),
            (None, Some(command)) => (command.clone(), None),
            (None, None) => return Ok(BuildOutcome::trivial(true)),
        };
        debug!(command = %command, "building patch");
        let outcome = self.platform.exec(container, &command, workdir.as_deref())?;
        Ok(BuildOutcome {
            successful: outcome.successful(),
            duration: outcome.duration,
        })
    }

    fn evaluate(&self, candidate: Candidate) -> Result<CandidateEvaluation> {
        let guard = ContainerGuard::provision(self.platform.as_ref(), &self.problem.snapshot)?;
        let build = match self.platform.apply_diff(guard.container(), &candidate.diff) {
            Ok(()) => self.build_patch(guard.container(), &candidate)?,
            Err(err) => {
                debug!("patch does not apply: {:#}", err);
                BuildOutcome::trivial(false)
            }
        };
        let mut tests = BTreeMap::new();
        if build.successful {
            for test in &self.tests {
                let outcome = self.platform.run_test(guard.container(), test)?;
                tests.insert(test.name.clone(), outcome);
                if !outcome.passed {
                    break;
                }
            }
        }
        let is_repair = build.successful
            && tests.len() == self.tests.len()
            && tests.values().all(|o| o.passed);
        if is_repair {
            info!("found repair:\n{}", candidate.diff);
        }
        Ok(CandidateEvaluation {
            candidate,
            build,
            tests,
            is_repair,
        })
    }
}

impl<I: Iterator<Item = Candidate>> Iterator for Searcher<I> {
    type Item = Result<CandidateEvaluation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.limit_reached() {
            return None;
        }
        let Some(candidate) = self.candidates.next() else {
            self.exhausted = true;
            return None;
        };
        self.evaluations += 1;
        Some(self.evaluate(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mars_core::testing::FakePlatform;
    use mars_core::{FunctionFact, Mutation, TestCoverage};
    use mars_local::TemplateMatcher;

    const FILE: &str = "src/a.cpp";
    const SOURCE: &str = "void Planner::update(int goal) {\n  if (goal < limit && ready) {\n    step(goal + 1);\n  }\n}\n";

    fn coverage(entries: &[(&str, bool)]) -> TestSuiteCoverage {
        entries
            .iter()
            .map(|(name, passed)| TestCoverage {
                test: name.to_string(),
                outcome: TestOutcome {
                    passed: *passed,
                    duration: 0.0,
                },
                lines: mars_core::testing::lines(&["src/a.cpp:2", "src/a.cpp:3"]),
            })
            .collect()
    }

    fn mutant() -> Mutant {
        Mutant {
            id: "0123456789abcdef".to_string(),
            base: "mars:baseline".to_string(),
            snapshot: "mutant:0123456789abcdef".to_string(),
            mutations: vec![Mutation {
                operator: "flip-relational-operator".to_string(),
                location: FileLocationRange::new(FILE, Location::new(2, 12), Location::new(2, 13)),
                replacement: "<".to_string(),
            }],
        }
    }

    fn platform() -> Arc<FakePlatform> {
        let platform = Arc::new(FakePlatform::new());
        platform.add_snapshot(
            "mutant:0123456789abcdef",
            false,
            &[
                ("t1", true, &["src/a.cpp:2"]),
                ("t2", false, &["src/a.cpp:2", "src/a.cpp:3"]),
                ("t3", true, &["src/a.cpp:3"]),
            ],
        );
        platform.add_source(FILE, SOURCE);
        platform
    }

    fn problem(platform: &FakePlatform) -> Arc<RepairProblem> {
        let snapshot = platform.snapshot("mutant:0123456789abcdef").expect("snapshot");
        let facts = StaticFacts {
            functions: vec![FunctionFact {
                file: FILE.to_string(),
                name: "Planner::update".to_string(),
                start_line: 1,
                end_line: 5,
                returns_void: true,
            }],
        };
        Arc::new(
            RepairProblem::new(
                snapshot,
                mutant(),
                coverage(&[("t1", true), ("t2", false), ("t3", true)]),
                facts,
            )
            .expect("problem"),
        )
    }

    fn localization() -> Localization {
        Localization::from_scores(vec![
            (FileLine::new(FILE, 2), 0.5),
            (FileLine::new(FILE, 3), 0.25),
        ])
    }

    fn space(platform: &Arc<FakePlatform>, options: SpaceOptions, donors: DonorPool) -> SearchSpace {
        build_search_space(
            problem(platform),
            &localization(),
            platform.clone(),
            Arc::new(TemplateMatcher),
            donors,
            options,
        )
    }

    fn options(seed: u64, donor_schemas: bool) -> SpaceOptions {
        SpaceOptions {
            seed,
            donor_schemas,
            donor_samples: 3,
        }
    }

    fn plain(diff: &str) -> Candidate {
        Candidate {
            transformations: Vec::new(),
            diff: diff.to_string(),
        }
    }

    #[test]
    fn problem_requires_failing_tests_and_orders_them_first() {
        let platform = platform();
        let snapshot = platform.snapshot("mutant:0123456789abcdef").expect("snapshot");
        let err = RepairProblem::new(
            snapshot,
            mutant(),
            coverage(&[("t1", true)]),
            StaticFacts::default(),
        )
        .expect_err("no failing tests");
        assert_eq!(err, ProblemError::NoFailingTests);

        let problem = problem(&platform);
        let order: Vec<String> = problem.tests().into_iter().map(|t| t.name).collect();
        assert_eq!(order, vec!["t2", "t1", "t3"]);
        assert_eq!(problem.mutated_files(), vec![FILE.to_string()]);
    }

    #[test]
    fn instantiate_fills_numbered_holes() {
        let mut env = BTreeMap::new();
        for (name, text) in [("1", "goal"), ("2", "limit")] {
            env.insert(
                name.to_string(),
                Fragment {
                    text: text.to_string(),
                    start: Location::new(1, 1),
                    stop: Location::new(1, 2),
                },
            );
        }
        assert_eq!(
            instantiate(":[1] >= :[2]", &env).expect("instantiate"),
            "goal >= limit"
        );
        let err = instantiate(":[3] + 1", &env).expect_err("unbound");
        assert!(err.to_string().contains(":[3]"), "unexpected error: {}", err);
    }

    #[test]
    fn package_resolution_handles_stacks() {
        let stacks = vec!["ros_comm".to_string()];
        assert_eq!(
            package_of("src/ros_comm/roscpp/src/libros/node_handle.cpp", &stacks).as_deref(),
            Some("roscpp")
        );
        assert_eq!(
            package_of("src/navigation/src/planner.cpp", &stacks).as_deref(),
            Some("navigation")
        );
        assert_eq!(package_of("src/planner.cpp", &stacks), None);
    }

    #[test]
    fn candidate_renders_unified_diff() {
        let mut sources = BTreeMap::new();
        sources.insert(FILE.to_string(), SOURCE.to_string());
        let candidate = Candidate::new(
            vec![Transformation {
                schema: "LTToGE".to_string(),
                location: FileLocationRange::new(FILE, Location::new(2, 7), Location::new(2, 19)),
                replacement: "goal >= limit".to_string(),
            }],
            &sources,
        )
        .expect("candidate");
        assert!(candidate.diff.contains("--- a/src/a.cpp"), "{}", candidate.diff);
        assert!(candidate.diff.contains("+++ b/src/a.cpp"), "{}", candidate.diff);
        assert!(
            candidate.diff.contains("+  if (goal >= limit && ready) {"),
            "{}",
            candidate.diff
        );
        assert_eq!(candidate.files(), vec![FILE.to_string()]);

        let noop = Candidate::new(
            vec![Transformation {
                schema: "LTToGE".to_string(),
                location: FileLocationRange::new(FILE, Location::new(2, 7), Location::new(2, 11)),
                replacement: "goal".to_string(),
            }],
            &sources,
        );
        assert!(noop.is_err());
    }

    #[test]
    fn donor_guards_are_extracted_and_deduplicated() {
        let platform = platform();
        platform.add_source(
            "src/b.cpp",
            "void f() {\n  if (ready) { go(); }\n  if (ready) { stop(); }\n  if (count(x) > 2) {}\n}\n",
        );
        let snapshot = platform.snapshot("mutant:0123456789abcdef").expect("snapshot");
        let pool = extract_guards(
            platform.as_ref(),
            &TemplateMatcher,
            &snapshot,
            &["src/b.cpp".to_string()],
        )
        .expect("extract");
        let contents: Vec<&str> = pool.snippets().iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["ready", "count(x) > 2"]);
        assert_eq!(
            pool.at("src/b.cpp@2:7::2:12").map(|s| s.content.as_str()),
            Some("ready")
        );

        let dir = std::env::temp_dir().join(format!(
            "mars_donor_pool_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let path = dir.join("snippets.json");
        pool.save(&path).expect("save");
        assert_eq!(DonorPool::load(Some(&path)).expect("load"), pool);
        assert!(DonorPool::load(None).expect("empty").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn search_space_is_deterministic_for_a_seed() {
        let platform = platform();
        let a: Vec<Candidate> = space(&platform, options(11, false), DonorPool::new()).collect();
        let b: Vec<Candidate> = space(&platform, options(11, false), DonorPool::new()).collect();
        assert_eq!(a, b);
        assert!(!a.is_empty());
        for candidate in &a {
            for t in &candidate.transformations {
                assert!(t.location.start.line == 2 || t.location.start.line == 3);
            }
        }
        assert!(a.iter().any(|c| c.transformations[0].schema == "LTToGE"
            && c.transformations[0].replacement == "goal >= limit"));
        assert!(a.iter().any(|c| c.transformations[0].schema == "PlusToMinus"));
    }

    #[test]
    fn donor_schema_inserts_guarded_return_in_void_function() {
        let platform = platform();
        let mut donors = DonorPool::new();
        donors.insert(Snippet {
            content: "goal == 0".to_string(),
            location: "src/b.cpp@2:7::2:16".to_string(),
        });
        let candidates: Vec<Candidate> = space(&platform, options(3, true), donors).collect();
        let inserted: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.transformations[0].schema == INSERT_CONDITIONAL_RETURN)
            .collect();
        assert_eq!(inserted.len(), 2);
        assert!(inserted
            .iter()
            .any(|c| c.diff.contains("+  if (goal == 0) { return; }")));
    }

    #[test]
    fn searcher_stops_at_attempt_limit_and_releases_containers() {
        let platform = platform();
        let problem = problem(&platform);
        let candidates = (0..10).map(|i| plain(&format!("edit {}", i)));
        let mut searcher = Searcher::new(
            platform.clone(),
            problem,
            BuildConfig::default(),
            candidates,
            SearchLimits {
                time: None,
                attempts: Some(3),
            },
        );
        let evaluations: Vec<CandidateEvaluation> = searcher
            .by_ref()
            .collect::<Result<Vec<_>>>()
            .expect("evaluations");
        assert_eq!(evaluations.len(), 3);
        assert_eq!(searcher.num_candidate_evals(), 3);
        assert_eq!(platform.provisioned(), 3);
        assert_eq!(platform.live(), 0);
        for evaluation in &evaluations {
            assert!(!evaluation.is_repair);
            // the failing test runs first and ends the evaluation
            assert_eq!(evaluation.tests.keys().collect::<Vec<_>>(), vec!["t2"]);
        }
    }

    #[test]
    fn searcher_detects_repairs_and_failed_builds() {
        let platform = platform();
        platform.add_fix("FIX");
        let problem = problem(&platform);
        let candidates = vec![plain("BROKEN_BUILD"), plain("FIX")].into_iter();
        let build = BuildConfig {
            command: Some("make".to_string()),
            workdir: None,
            stacks: Vec::new(),
        };
        let evaluations: Vec<CandidateEvaluation> = Searcher::new(
            platform.clone(),
            problem,
            build,
            candidates,
            SearchLimits {
                time: Some(Duration::from_secs(600)),
                attempts: None,
            },
        )
        .collect::<Result<Vec<_>>>()
        .expect("evaluations");
        assert_eq!(evaluations.len(), 2);
        assert!(!evaluations[0].build.successful);
        assert!(evaluations[0].tests.is_empty());
        assert!(evaluations[1].build.successful);
        assert!(evaluations[1].is_repair);
        assert_eq!(evaluations[1].tests.len(), 3);
        assert_eq!(platform.live(), 0);
    }

    #[test]
    fn searcher_with_elapsed_time_limit_evaluates_nothing() {
        let platform = platform();
        let problem = problem(&platform);
        let mut searcher = Searcher::new(
            platform.clone(),
            problem,
            BuildConfig::default(),
            vec![plain("edit")].into_iter(),
            SearchLimits {
                time: Some(Duration::ZERO),
                attempts: None,
            },
        );
        assert!(searcher.next().is_none());
        assert_eq!(platform.provisioned(), 0);
    }
}
