//! Process and filesystem implementations of the collaborator traits.
//!
//! Snapshots are YAML manifests under `<root>/snapshots`, containers are
//! filtered copies of a snapshot's source tree under `<root>/containers`, and
//! mutants are patched copies under `<root>/mutants`. Commands run through
//! `sh -c` inside the copy.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mars_core::{
    atomic_write_bytes, ensure_dir, mutant_id, splice, Analyzer, Container, ExecOutcome,
    FileLineSet, FileLocationRange, Fragment, FunctionFact, Location, Match, MutationEngine,
    Mutant, Mutation, PatternMatcher, SandboxPlatform, Snapshot, StaticFacts, TestCase,
    TestOutcome,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const COVERAGE_ENV: &str = "MARS_COVERAGE_FILE";
const COVERAGE_FILE: &str = ".mars-coverage.json";
const PATCH_FILE: &str = ".mars.patch";

pub const OPERATORS: &[&str] = &[
    "delete-void-function-call",
    "flip-arithmetic-operator",
    "flip-boolean-operator",
    "flip-relational-operator",
    "delete-conditional-control-flow",
    "flip-signedness",
];

#[derive(Debug, Clone)]
struct ContainerRecord {
    dir: PathBuf,
    snapshot: Snapshot,
}

pub struct LocalBackend {
    root: PathBuf,
    containers: Mutex<BTreeMap<String, ContainerRecord>>,
    next_id: AtomicUsize,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["snapshots", "containers", "mutants", "logs"] {
            ensure_dir(&root.join(sub))?;
        }
        Ok(Self {
            root,
            containers: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("{}.yml", name.replace([':', '/'], "_")))
    }

    /// Resolves a snapshot's source tree; relative paths are relative to the root.
    pub fn source_dir(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let source = snapshot
            .source
            .as_ref()
            .ok_or_else(|| anyhow!("snapshot {} has no source directory", snapshot.name))?;
        if source.is_absolute() {
            Ok(source.clone())
        } else {
            Ok(self.root.join(source))
        }
    }

    fn record(&self, container: &Container) -> Result<ContainerRecord> {
        self.containers
            .lock()
            .get(&container.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown container: {}", container.id))
    }

    fn unique_id(&self) -> String {
        format!(
            "{}-{}",
            Utc::now().timestamp_micros(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn run_shell(
        &self,
        command: &str,
        dir: &Path,
        env: &[(&str, PathBuf)],
        limit: Option<Duration>,
    ) -> Result<ShellRun> {
        let logs = self.root.join("logs");
        let id = self.unique_id();
        let stdout_path = logs.join(format!("{}.out", id));
        let stderr_path = logs.join(format!("{}.err", id));

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(fs::File::create(&stdout_path)?);
        cmd.stderr(fs::File::create(&stderr_path)?);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn: {}", command))?;
        let mut timed_out = false;
        let code = loop {
            if let Some(status) = child.try_wait()? {
                break status.code();
            }
            if limit.map(|l| started.elapsed() >= l).unwrap_or(false) {
                let _ = child.kill();
                let _ = child.wait();
                timed_out = true;
                break None;
            }
            thread::sleep(Duration::from_millis(20));
        };
        let duration = started.elapsed();

        let stdout = String::from_utf8_lossy(&fs::read(&stdout_path).unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&fs::read(&stderr_path).unwrap_or_default()).into_owned();
        let _ = fs::remove_file(&stdout_path);
        let _ = fs::remove_file(&stderr_path);
        Ok(ShellRun {
            code,
            stdout,
            stderr,
            duration,
            timed_out,
        })
    }
}

struct ShellRun {
    code: Option<i32>,
    stdout: String,
    stderr: String,
    duration: Duration,
    timed_out: bool,
}

impl ShellRun {
    fn into_exec_outcome(self) -> ExecOutcome {
        let mut output = self.stdout;
        output.push_str(&self.stderr);
        ExecOutcome {
            code: self.code,
            output,
            duration: self.duration.as_secs_f64(),
        }
    }
}

fn load_manifest(path: &Path) -> Result<Snapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot manifest {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse snapshot manifest {}", path.display()))
}

fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true;
        }
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    ensure_dir(dst)?;
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target).with_context(|| {
                format!("failed to copy {} to {}", path.display(), target.display())
            })?;
        }
    }
    Ok(())
}

impl SandboxPlatform for LocalBackend {
    fn register(&self, snapshot: Snapshot) -> Result<()> {
        let path = self.manifest_path(&snapshot.name);
        info!(snapshot = %snapshot.name, path = %path.display(), "registering snapshot");
        let raw = serde_yaml::to_string(&snapshot)?;
        atomic_write_bytes(&path, raw.as_bytes())
    }

    fn snapshot(&self, name: &str) -> Result<Snapshot> {
        let path = self.manifest_path(name);
        if path.exists() {
            return load_manifest(&path);
        }
        for entry in fs::read_dir(self.root.join("snapshots"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            match load_manifest(&path) {
                Ok(snapshot) if snapshot.name == name => return Ok(snapshot),
                Ok(_) => {}
                Err(err) => debug!("ignoring manifest: {:#}", err),
            }
        }
        Err(anyhow!("unknown snapshot: {}", name))
    }

    fn provision(&self, snapshot: &Snapshot) -> Result<Container> {
        let source = self.source_dir(snapshot)?;
        let id = self.unique_id();
        let dir = self.root.join("containers").join(&id);
        if let Err(err) = copy_dir_filtered(&source, &dir, &[".git"]) {
            let _ = fs::remove_dir_all(&dir);
            return Err(err.context(format!("failed to provision {}", snapshot.name)));
        }
        debug!(container = %id, snapshot = %snapshot.name, "provisioned container");
        self.containers.lock().insert(
            id.clone(),
            ContainerRecord {
                dir,
                snapshot: snapshot.clone(),
            },
        );
        Ok(Container {
            id,
            snapshot: snapshot.name.clone(),
        })
    }

    fn run_test(&self, container: &Container, test: &TestCase) -> Result<TestOutcome> {
        let record = self.record(container)?;
        let command = test
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("test {} has no command", test.name))?;
        let mut env = Vec::new();
        if record.snapshot.instrumented {
            env.push((COVERAGE_ENV, record.dir.join(COVERAGE_FILE)));
        }
        let run = self.run_shell(command, &record.dir, &env, Some(test.time_limit()))?;
        let oracle = test
            .oracle
            .as_ref()
            .map(|o| o.contains.as_str())
            .or(record.snapshot.default_oracle.as_deref());
        let passed = !run.timed_out
            && run.code == Some(0)
            && oracle.map(|text| run.stdout.contains(text)).unwrap_or(true);
        debug!(
            test = %test.name,
            passed,
            timed_out = run.timed_out,
            "ran test (took {:.2} seconds)",
            run.duration.as_secs_f64()
        );
        Ok(TestOutcome::new(passed, run.duration))
    }

    fn extract_coverage(&self, container: &Container) -> Result<FileLineSet> {
        let record = self.record(container)?;
        if !record.snapshot.instrumented {
            return Err(anyhow!("snapshot {} is not instrumented", record.snapshot.name));
        }
        let path = record.dir.join(COVERAGE_FILE);
        let raw = fs::read(&path)
            .with_context(|| format!("no coverage written to {}", path.display()))?;
        let lines: FileLineSet = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse coverage {}", path.display()))?;
        let _ = fs::remove_file(&path);
        Ok(lines)
    }

    fn apply_diff(&self, container: &Container, diff: &str) -> Result<()> {
        let record = self.record(container)?;
        atomic_write_bytes(&record.dir.join(PATCH_FILE), diff.as_bytes())?;
        let run = self.run_shell(
            &format!("patch -p1 -i {}", PATCH_FILE),
            &record.dir,
            &[],
            None,
        )?;
        let _ = fs::remove_file(record.dir.join(PATCH_FILE));
        if run.code != Some(0) {
            return Err(anyhow!(
                "failed to apply patch: {}",
                run.into_exec_outcome().output.trim()
            ));
        }
        Ok(())
    }

    fn exec(
        &self,
        container: &Container,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<ExecOutcome> {
        let record = self.record(container)?;
        let dir = match workdir {
            Some(w) => record.dir.join(w.trim_start_matches('/')),
            None => record.dir.clone(),
        };
        Ok(self.run_shell(command, &dir, &[], None)?.into_exec_outcome())
    }

    fn read_source(&self, snapshot: &Snapshot, file: &str) -> Result<String> {
        let path = workspace_path(&self.source_dir(snapshot)?, file)?;
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn destroy(&self, container: &Container) -> Result<()> {
        let record = self
            .containers
            .lock()
            .remove(&container.id)
            .ok_or_else(|| anyhow!("unknown container: {}", container.id))?;
        fs::remove_dir_all(&record.dir)
            .with_context(|| format!("failed to remove {}", record.dir.display()))?;
        debug!(container = %container.id, "destroyed container");
        Ok(())
    }
}

/* ---------- mutation engine ---------- */

impl MutationEngine for LocalBackend {
    fn operators(&self) -> Vec<String> {
        OPERATORS.iter().map(|s| s.to_string()).collect()
    }

    fn mutations(
        &self,
        snapshot: &Snapshot,
        file: &str,
        line: Option<usize>,
        operators: &[String],
    ) -> Result<Vec<Mutation>> {
        let source = self.read_source(snapshot, file)?;
        Ok(source_mutations(file, &source, line, operators))
    }

    fn mutate(&self, snapshot: &Snapshot, mutations: &[Mutation]) -> Result<Mutant> {
        let id = mutant_id(&snapshot.name, mutations)?;
        let rel = PathBuf::from("mutants").join(&id);
        let dir = self.root.join(&rel);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let result = (|| -> Result<()> {
            copy_dir_filtered(&self.source_dir(snapshot)?, &dir, &[".git"])?;
            apply_mutations(&dir, mutations)?;
            let mut derived = snapshot.clone();
            derived.name = format!("mutant:{}", id);
            derived.source = Some(rel.clone());
            self.register(derived)
        })();
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&dir);
            return Err(err.context(format!("failed to create mutant of {}", snapshot.name)));
        }
        info!(mutant = %id, base = %snapshot.name, "created mutant");
        Ok(Mutant {
            id: id.clone(),
            base: snapshot.name.clone(),
            snapshot: format!("mutant:{}", id),
            mutations: mutations.to_vec(),
        })
    }

    fn destroy(&self, mutant: &Mutant) -> Result<()> {
        let dir = self.root.join("mutants").join(&mutant.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        let manifest = self.manifest_path(&mutant.snapshot);
        if manifest.exists() {
            fs::remove_file(&manifest)?;
        }
        info!(mutant = %mutant.id, "destroyed mutant");
        Ok(())
    }
}

/// Resolves a workspace-relative `file` under `dir`; absolute paths and `..` are refused.
fn workspace_path(dir: &Path, file: &str) -> Result<PathBuf> {
    let rel = Path::new(file);
    let plain = rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if file.is_empty() || !plain {
        return Err(anyhow!("path escapes the workspace: {}", file));
    }
    Ok(dir.join(rel))
}

fn apply_mutations(dir: &Path, mutations: &[Mutation]) -> Result<()> {
    let mut by_file: BTreeMap<&str, Vec<&Mutation>> = BTreeMap::new();
    for m in mutations {
        by_file.entry(m.location.file.as_str()).or_default().push(m);
    }
    for (file, mut edits) in by_file {
        let path = workspace_path(dir, file)?;
        let mut text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        edits.sort_by(|a, b| b.location.start.cmp(&a.location.start));
        for edit in edits {
            text = splice(&text, edit.location.start, edit.location.stop, &edit.replacement)?;
        }
        fs::write(&path, text)?;
    }
    Ok(())
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_operator(c: char) -> bool {
    "<>=!&|+-*/%^".contains(c)
}

/// Index of a `//` comment outside string/char literals, or the line length.
fn code_end(chars: &[char]) -> usize {
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '/' && chars.get(i + 1) == Some(&'/') {
                    return i;
                }
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
            }
        }
        i += 1;
    }
    chars.len()
}

/// Positions outside string/char literals and before a `//` comment.
fn code_mask(chars: &[char]) -> Vec<bool> {
    let end = code_end(chars);
    let mut mask = vec![false; chars.len()];
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < end {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => quote = Some(c),
            None => mask[i] = true,
        }
        i += 1;
    }
    mask
}

fn is_code_line(text: &str) -> bool {
    let t = text.trim_start();
    !(t.is_empty() || t.starts_with('#') || t.starts_with("/*") || t.starts_with('*'))
}

/// Start of every whitespace-delimited occurrence of `token` in code.
fn find_token(chars: &[char], mask: &[bool], token: &str) -> Vec<usize> {
    let token: Vec<char> = token.chars().collect();
    let mut out = Vec::new();
    if chars.len() < token.len() + 2 {
        return out;
    }
    for start in 1..chars.len() - token.len() {
        let end = start + token.len();
        if chars[start..end] == token[..]
            && mask[start..end].iter().all(|m| *m)
            && chars[start - 1].is_whitespace()
            && chars[end].is_whitespace()
        {
            out.push(start);
        }
    }
    out
}

fn find_word(chars: &[char], mask: &[bool], word: &str) -> Vec<usize> {
    let word: Vec<char> = word.chars().collect();
    let mut out = Vec::new();
    if chars.len() < word.len() {
        return out;
    }
    for start in 0..=chars.len() - word.len() {
        let end = start + word.len();
        if chars[start..end] == word[..]
            && mask[start..end].iter().all(|m| *m)
            && (start == 0 || !is_ident(chars[start - 1]))
            && (end == chars.len() || !is_ident(chars[end]))
        {
            out.push(start);
        }
    }
    out
}

/// The statement on a line: first non-blank char to the end of code, trimmed.
fn statement_span(chars: &[char]) -> Option<(usize, usize)> {
    let start = chars.iter().position(|c| !c.is_whitespace())?;
    let mut end = code_end(chars);
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (end > start).then_some((start, end))
}

const KEYWORDS: &[&str] = &[
    "return", "if", "while", "for", "switch", "delete", "throw", "else", "case", "do", "new",
    "sizeof", "catch",
];

fn first_word(stmt: &str) -> &str {
    let end = stmt.find(|c: char| !is_ident(c)).unwrap_or(stmt.len());
    &stmt[..end]
}

fn balanced(text: &str) -> bool {
    let mut depth: i64 = 0;
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn is_discarded_call(stmt: &str) -> bool {
    if !stmt.ends_with(");") || KEYWORDS.contains(&first_word(stmt)) {
        return false;
    }
    let Some(open) = stmt.find('(') else {
        return false;
    };
    let callee = &stmt[..open];
    !callee.is_empty()
        && !callee.starts_with(|c: char| c.is_ascii_digit())
        && callee
            .chars()
            .all(|c| is_ident(c) || c == '.' || c == ':' || c == '-' || c == '>')
        && balanced(&stmt[open..stmt.len() - 1])
}

fn is_conditional_exit(stmt: &str) -> bool {
    if first_word(stmt) != "if" || !stmt.ends_with(';') {
        return false;
    }
    let rest = stmt[2..].trim_start();
    if !rest.starts_with('(') {
        return false;
    }
    let mut depth = 0;
    for (idx, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let body = rest[idx + 1..].trim_start();
                    return ["return", "break", "continue"].contains(&first_word(body));
                }
            }
            _ => {}
        }
    }
    false
}

const RELATIONAL: &[(&str, &str)] = &[
    ("<", ">="),
    ("<=", ">"),
    (">", "<="),
    (">=", "<"),
    ("==", "!="),
    ("!=", "=="),
];
const BOOLEAN: &[(&str, &str)] = &[("&&", "||"), ("||", "&&")];
const ARITHMETIC: &[(&str, &str)] = &[("+", "-"), ("-", "+"), ("*", "/"), ("/", "*")];

fn range(file: &str, line: usize, start: usize, stop: usize) -> FileLocationRange {
    FileLocationRange::new(file, Location::new(line, start + 1), Location::new(line, stop + 1))
}

/// Token-level mutations of `source`, ordered by line, then operator, then column.
pub fn source_mutations(
    file: &str,
    source: &str,
    line: Option<usize>,
    operators: &[String],
) -> Vec<Mutation> {
    let mut out = Vec::new();
    for (idx, text) in source.lines().enumerate() {
        let number = idx + 1;
        if line.map(|l| l != number).unwrap_or(false) || !is_code_line(text) {
            continue;
        }
        let chars: Vec<char> = text.chars().collect();
        let mask = code_mask(&chars);
        for operator in operators {
            let mut found = match operator.as_str() {
                "flip-relational-operator" => flips(file, number, &chars, &mask, operator, RELATIONAL),
                "flip-boolean-operator" => flips(file, number, &chars, &mask, operator, BOOLEAN),
                "flip-arithmetic-operator" => flips(file, number, &chars, &mask, operator, ARITHMETIC),
                "flip-signedness" => signedness(file, number, &chars, &mask),
                "delete-void-function-call" | "delete-conditional-control-flow" => {
                    statement_deletion(file, number, &chars, operator)
                }
                _ => Vec::new(),
            };
            found.sort_by_key(|m| m.location.start);
            out.extend(found);
        }
    }
    out
}

fn flips(
    file: &str,
    line: usize,
    chars: &[char],
    mask: &[bool],
    operator: &str,
    table: &[(&str, &str)],
) -> Vec<Mutation> {
    let mut out = Vec::new();
    for (token, replacement) in table {
        for start in find_token(chars, mask, token) {
            out.push(Mutation {
                operator: operator.to_string(),
                location: range(file, line, start, start + token.chars().count()),
                replacement: replacement.to_string(),
            });
        }
    }
    out
}

fn statement_deletion(file: &str, line: usize, chars: &[char], operator: &str) -> Vec<Mutation> {
    let Some((start, end)) = statement_span(chars) else {
        return Vec::new();
    };
    let stmt: String = chars[start..end].iter().collect();
    let matched = if operator == "delete-void-function-call" {
        is_discarded_call(&stmt)
    } else {
        is_conditional_exit(&stmt)
    };
    if !matched {
        return Vec::new();
    }
    vec![Mutation {
        operator: operator.to_string(),
        location: range(file, line, start, end),
        replacement: String::new(),
    }]
}

fn signedness(file: &str, line: usize, chars: &[char], mask: &[bool]) -> Vec<Mutation> {
    let mut out = Vec::new();
    let unsigned = find_word(chars, mask, "unsigned");
    for &start in &unsigned {
        let mut end = start + "unsigned".len();
        while end < chars.len() && chars[end].is_whitespace() {
            end += 1;
        }
        if end < chars.len() && is_ident(chars[end]) {
            out.push(Mutation {
                operator: "flip-signedness".to_string(),
                location: range(file, line, start, end),
                replacement: String::new(),
            });
        }
    }
    for start in find_word(chars, mask, "int") {
        let qualified = unsigned.iter().any(|&u| {
            let after = u + "unsigned".len();
            after <= start && chars[after..start].iter().all(|c| c.is_whitespace())
        });
        if !qualified {
            out.push(Mutation {
                operator: "flip-signedness".to_string(),
                location: range(file, line, start, start + 3),
                replacement: "unsigned int".to_string(),
            });
        }
    }
    out
}

/* ---------- static analysis ---------- */

impl Analyzer for LocalBackend {
    fn analyze(&self, snapshot: &Snapshot, files: &[String]) -> Result<StaticFacts> {
        let mut facts = StaticFacts::default();
        for file in files {
            match self.read_source(snapshot, file) {
                Ok(source) => facts.functions.extend(scan_functions(file, &source)),
                Err(err) => warn!(file = %file, "skipping analysis: {:#}", err),
            }
        }
        debug!(functions = facts.functions.len(), "analyzed source files");
        Ok(facts)
    }
}

const NOT_FUNCTIONS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "else", "do", "return", "namespace", "class",
    "struct", "enum", "union", "template", "using", "typedef",
];

/// Name and void-ness of a function definition header.
fn function_header(code: &str) -> Option<(String, bool)> {
    if code.ends_with(';') || !code.starts_with(|c: char| is_ident(c) || c == '~') {
        return None;
    }
    if NOT_FUNCTIONS.contains(&first_word(code)) {
        return None;
    }
    let open = code.find('(')?;
    let prefix = code[..open].trim();
    if prefix.is_empty() || prefix.contains('=') || prefix.ends_with(is_operator) {
        return None;
    }
    let tokens: Vec<&str> = prefix.split_whitespace().collect();
    let (name, ret) = tokens.split_last()?;
    let returns_void = ret.last() == Some(&"void") && !name.starts_with('*');
    Some((name.trim_start_matches(['*', '&']).to_string(), returns_void))
}

fn brace_delta(text: &str) -> (i64, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mask = code_mask(&chars);
    let mut delta = 0;
    let mut opened = false;
    for (c, code) in chars.iter().zip(mask) {
        if !code {
            continue;
        }
        match *c {
            '{' => {
                delta += 1;
                opened = true;
            }
            '}' => delta -= 1,
            _ => {}
        }
    }
    (delta, opened)
}

fn scan_functions(file: &str, source: &str) -> Vec<FunctionFact> {
    let lines: Vec<&str> = source.lines().collect();
    let mut facts = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let chars: Vec<char> = lines[idx].chars().collect();
        let mask = code_mask(&chars);
        let code: String = chars
            .iter()
            .zip(&mask)
            .map(|(c, m)| if *m { *c } else { ' ' })
            .collect();
        let code = code.trim();
        let Some((name, returns_void)) = function_header(code) else {
            idx += 1;
            continue;
        };
        let open = if code.ends_with('{') {
            Some(idx)
        } else if lines
            .get(idx + 1)
            .map(|l| l.trim_start().starts_with('{'))
            .unwrap_or(false)
        {
            Some(idx + 1)
        } else {
            None
        };
        let Some(open) = open else {
            idx += 1;
            continue;
        };
        let mut depth = 0;
        let mut close = None;
        for (offset, text) in lines[open..].iter().enumerate() {
            let (delta, opened) = brace_delta(text);
            depth += delta;
            if (opened || offset > 0) && depth <= 0 {
                close = Some(open + offset);
                break;
            }
        }
        match close {
            Some(close) => {
                facts.push(FunctionFact {
                    file: file.to_string(),
                    name,
                    start_line: idx + 1,
                    end_line: close + 1,
                    returns_void,
                });
                idx = close + 1;
            }
            None => idx += 1,
        }
    }
    facts
}

/* ---------- pattern matching ---------- */

/// Single-line templates with numbered holes `:[n]`.
///
/// Whitespace in the template matches any run of whitespace. A hole matches
/// the shortest non-blank, bracket-balanced span that lets the rest of the
/// template match; holes and literals never split identifiers or operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(Vec<char>),
    Hole(String),
}

fn parse_template(template: &str) -> Result<Vec<Piece>> {
    let template = template.trim();
    if template.is_empty() {
        return Err(anyhow!("empty template"));
    }
    if template.contains('\n') {
        return Err(anyhow!("multi-line templates are not supported"));
    }
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find(":[") {
        if open > 0 {
            pieces.push(Piece::Literal(rest[..open].chars().collect()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find(']')
            .ok_or_else(|| anyhow!("unterminated hole in template: {}", template))?;
        let name = &after[..close];
        if name.is_empty() || !name.chars().all(is_ident) {
            return Err(anyhow!("invalid hole name in template: {}", template));
        }
        if matches!(pieces.last(), Some(Piece::Hole(_))) {
            return Err(anyhow!("adjacent holes in template: {}", template));
        }
        pieces.push(Piece::Hole(name.to_string()));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest.chars().collect()));
    }
    Ok(pieces)
}

fn conflicts(a: char, b: char) -> bool {
    (is_ident(a) && is_ident(b)) || (is_operator(a) && is_operator(b))
}

fn match_literal(text: &[char], chars: &[char], pos: usize) -> Option<usize> {
    let (mut i, mut j) = (0, pos);
    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;
    while i < text.len() {
        if text[i].is_whitespace() {
            while i < text.len() && text[i].is_whitespace() {
                i += 1;
            }
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            continue;
        }
        if j >= chars.len() || chars[j] != text[i] {
            return None;
        }
        first.get_or_insert(j);
        last = Some(j);
        i += 1;
        j += 1;
    }
    if let Some(f) = first {
        if f > 0 && conflicts(chars[f - 1], chars[f]) {
            return None;
        }
    }
    if let Some(l) = last {
        if l + 1 < chars.len() && conflicts(chars[l], chars[l + 1]) {
            return None;
        }
    }
    Some(j)
}

fn valid_hole(chars: &[char], start: usize, end: usize) -> bool {
    let span = &chars[start..end];
    let (Some(&head), Some(&tail)) = (span.first(), span.last()) else {
        return false;
    };
    if head.is_whitespace() || tail.is_whitespace() {
        return false;
    }
    if start > 0 && is_ident(chars[start - 1]) && is_ident(head) {
        return false;
    }
    if end < chars.len() && is_ident(chars[end]) && is_ident(tail) {
        return false;
    }
    if span.contains(&';') || span.iter().filter(|c| **c == '"').count() % 2 != 0 {
        return false;
    }
    balanced(&span.iter().collect::<String>())
}

fn match_pieces(
    pieces: &[Piece],
    chars: &[char],
    pos: usize,
    env: &mut Vec<(String, usize, usize)>,
) -> Option<usize> {
    let Some((first, rest)) = pieces.split_first() else {
        return Some(pos);
    };
    match first {
        Piece::Literal(text) => {
            let end = match_literal(text, chars, pos)?;
            match_pieces(rest, chars, end, env)
        }
        Piece::Hole(name) => {
            for end in pos + 1..=chars.len() {
                if !valid_hole(chars, pos, end) {
                    continue;
                }
                env.push((name.clone(), pos, end));
                if let Some(stop) = match_pieces(rest, chars, end, env) {
                    return Some(stop);
                }
                env.pop();
            }
            None
        }
    }
}

impl PatternMatcher for TemplateMatcher {
    fn matches(&self, source: &str, template: &str) -> Result<Vec<Match>> {
        let pieces = parse_template(template)?;
        let mut out = Vec::new();
        for (idx, text) in source.lines().enumerate() {
            let line = idx + 1;
            let chars: Vec<char> = text.chars().collect();
            let mut pos = 0;
            while pos < chars.len() {
                if chars[pos].is_whitespace() {
                    pos += 1;
                    continue;
                }
                let mut env = Vec::new();
                match match_pieces(&pieces, &chars, pos, &mut env) {
                    Some(end) if end > pos => {
                        let environment = env
                            .into_iter()
                            .map(|(name, s, e)| {
                                (
                                    name,
                                    Fragment {
                                        text: chars[s..e].iter().collect(),
                                        start: Location::new(line, s + 1),
                                        stop: Location::new(line, e + 1),
                                    },
                                )
                            })
                            .collect();
                        out.push(Match {
                            start: Location::new(line, pos + 1),
                            stop: Location::new(line, end + 1),
                            environment,
                        });
                        pos = end;
                    }
                    _ => pos += 1,
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANNER: &str = concat!(
        "#include <vector>\n",
        "void Planner::update(int goal) {\n",
        "  if (goal < limit && ready) {\n",
        "    publish(goal + 1);\n",
        "  }\n",
        "  if (done) return;\n",
        "  // a < b is ignored here\n",
        "}\n",
        "\n",
        "int Planner::limit() const\n",
        "{\n",
        "  return limit_ * 2;\n",
        "}\n",
    );

    fn ops(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "mars_local_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn texts(matches: &[Match], hole: &str) -> Vec<String> {
        matches
            .iter()
            .map(|m| m.environment[hole].text.clone())
            .collect()
    }

    #[test]
    fn template_holes_respect_identifiers_and_brackets() {
        let matcher = TemplateMatcher;
        let found = matcher
            .matches("  if (goal < limit && ready) {\n", ":[1] < :[2]")
            .expect("matches");
        assert_eq!(found.len(), 1);
        assert_eq!(texts(&found, "1"), vec!["goal"]);
        assert_eq!(texts(&found, "2"), vec!["limit"]);
        assert_eq!(found[0].start, Location::new(1, 7));
        assert_eq!(found[0].stop, Location::new(1, 19));

        let guards = matcher
            .matches("if (count(x) > 2) {}\nelif (y) {}\n", "if (:[1])")
            .expect("matches");
        assert_eq!(texts(&guards, "1"), vec!["count(x) > 2"]);
    }

    #[test]
    fn template_literals_do_not_split_operators() {
        let matcher = TemplateMatcher;
        assert!(matcher
            .matches("x = a >= b;\ny = p->q;\n", ":[1] > :[2]")
            .expect("matches")
            .is_empty());
        assert!(parse_template(":[1]:[2]").is_err());
        assert!(parse_template(":[1 + 2").is_err());
    }

    #[test]
    fn relational_and_boolean_flips_skip_comments_and_preprocessor() {
        let found = source_mutations(
            "src/planner.cpp",
            PLANNER,
            None,
            &ops(&["flip-relational-operator", "flip-boolean-operator"]),
        );
        let summary: Vec<(usize, usize, &str)> = found
            .iter()
            .map(|m| (m.location.start.line, m.location.start.column, m.replacement.as_str()))
            .collect();
        assert_eq!(summary, vec![(3, 12, ">="), (3, 20, "||")]);
    }

    #[test]
    fn statement_operators_find_calls_and_guarded_exits() {
        let calls = source_mutations(
            "src/planner.cpp",
            PLANNER,
            None,
            &ops(&["delete-void-function-call"]),
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].location.start, Location::new(4, 5));
        assert_eq!(calls[0].location.stop, Location::new(4, 23));

        let exits = source_mutations(
            "src/planner.cpp",
            PLANNER,
            Some(6),
            &ops(&["delete-conditional-control-flow", "flip-arithmetic-operator"]),
        );
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].operator, "delete-conditional-control-flow");

        let arithmetic = source_mutations(
            "src/planner.cpp",
            PLANNER,
            None,
            &ops(&["flip-arithmetic-operator"]),
        );
        let lines: Vec<usize> = arithmetic.iter().map(|m| m.location.start.line).collect();
        assert_eq!(lines, vec![4, 12]);
    }

    #[test]
    fn signedness_flips_both_ways() {
        let found = source_mutations(
            "a.cpp",
            "int a = 1;\nunsigned int b = 2;\n",
            None,
            &ops(&["flip-signedness"]),
        );
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].replacement, "unsigned int");
        assert_eq!(found[1].location.start, Location::new(2, 1));
        assert_eq!(found[1].location.stop, Location::new(2, 10));
        assert_eq!(found[1].replacement, "");
    }

    #[test]
    fn scanner_reports_function_extents() {
        let facts = scan_functions("src/planner.cpp", PLANNER);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].name, "Planner::update");
        assert!(facts[0].returns_void);
        assert_eq!((facts[0].start_line, facts[0].end_line), (2, 8));
        assert_eq!(facts[1].name, "Planner::limit");
        assert!(!facts[1].returns_void);
        assert_eq!((facts[1].start_line, facts[1].end_line), (10, 13));
    }

    #[test]
    fn backend_runs_tests_with_oracle_timeout_and_coverage() {
        let root = temp_root("backend");
        let source = root.join("src-tree");
        ensure_dir(&source.join("src")).expect("source dir");
        fs::write(source.join("src/planner.cpp"), PLANNER).expect("write source");
        let backend = LocalBackend::new(root.join("state")).expect("backend");

        let snapshot: Snapshot = serde_yaml::from_str(&format!(
            "name: mars:instrument\nsource: {}\ninstrumented: true\ndefault-oracle: \"[  PASSED  ]\"\ntests:\n  - name: ok\n    command: \"echo '[  PASSED  ]'; printf '{{\\\"src/planner.cpp\\\": [3, 4]}}' > \\\"$MARS_COVERAGE_FILE\\\"\"\n  - name: quiet\n    command: \"true\"\n  - name: slow\n    command: \"sleep 5\"\n    kill-after: 1\n",
            source.display()
        ))
        .expect("manifest");
        backend.register(snapshot).expect("register");
        let snapshot = backend.snapshot("mars:instrument").expect("lookup");
        assert_eq!(snapshot.tests.len(), 3);

        let container = backend.provision(&snapshot).expect("provision");
        let ok = backend
            .run_test(&container, snapshot.test("ok").expect("ok"))
            .expect("run ok");
        assert!(ok.passed);
        let lines = backend.extract_coverage(&container).expect("coverage");
        assert_eq!(lines.len(), 2);

        let quiet = backend
            .run_test(&container, snapshot.test("quiet").expect("quiet"))
            .expect("run quiet");
        assert!(!quiet.passed, "oracle text is missing from stdout");

        let slow = backend
            .run_test(&container, snapshot.test("slow").expect("slow"))
            .expect("run slow");
        assert!(!slow.passed);
        assert!(slow.duration < 4.0, "took {}", slow.duration);

        let built = backend
            .exec(&container, "test -f planner.cpp", Some("/src"))
            .expect("exec");
        assert!(built.successful());
        assert_eq!(
            backend
                .read_source(&snapshot, "src/planner.cpp")
                .expect("read")
                .lines()
                .count(),
            13
        );

        SandboxPlatform::destroy(&backend, &container).expect("destroy");
        assert!(!root.join("state/containers").join(&container.id).exists());
        assert!(SandboxPlatform::destroy(&backend, &container).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn backend_mutants_are_patched_copies() {
        let root = temp_root("mutants");
        let source = root.join("src-tree");
        ensure_dir(&source.join("src")).expect("source dir");
        fs::write(source.join("src/planner.cpp"), PLANNER).expect("write source");
        let backend = LocalBackend::new(root.join("state")).expect("backend");
        backend
            .register(Snapshot {
                name: "mars:baseline".to_string(),
                image: None,
                source: Some(source.clone()),
                build: None,
                instrumented: false,
                default_oracle: None,
                tests: vec![TestCase::named("t1")],
            })
            .expect("register");
        let baseline = backend.snapshot("mars:baseline").expect("baseline");

        let mutations = backend
            .mutations(&baseline, "src/planner.cpp", Some(3), &ops(&["flip-relational-operator"]))
            .expect("mutations");
        assert_eq!(mutations.len(), 1);
        let mutant = backend.mutate(&baseline, &mutations).expect("mutate");
        assert_eq!(mutant.snapshot, format!("mutant:{}", mutant.id));

        let derived = backend.snapshot(&mutant.snapshot).expect("derived");
        let text = backend
            .read_source(&derived, "src/planner.cpp")
            .expect("read mutant");
        assert!(text.contains("if (goal >= limit && ready)"), "{}", text);
        assert!(fs::read_to_string(source.join("src/planner.cpp"))
            .expect("original")
            .contains("goal < limit"));

        MutationEngine::destroy(&backend, &mutant).expect("destroy mutant");
        assert!(backend.snapshot(&mutant.snapshot).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn mutations_cannot_write_outside_the_mutant() {
        let root = temp_root("escape");
        let source = root.join("src-tree");
        ensure_dir(&source.join("src")).expect("source dir");
        fs::write(source.join("src/planner.cpp"), PLANNER).expect("write source");
        let secret = root.join("secret.txt");
        fs::write(&secret, "SECRET\n").expect("write secret");
        let backend = LocalBackend::new(root.join("state")).expect("backend");
        backend
            .register(Snapshot {
                name: "mars:baseline".to_string(),
                image: None,
                source: Some(source.clone()),
                build: None,
                instrumented: false,
                default_oracle: None,
                tests: vec![TestCase::named("t1")],
            })
            .expect("register");
        let baseline = backend.snapshot("mars:baseline").expect("baseline");

        let overwrite = |file: String| Mutation {
            operator: "delete-statement".to_string(),
            location: range(&file, 1, 1, 7),
            replacement: "PWNED!".to_string(),
        };
        let absolute = secret.to_string_lossy().into_owned();
        for file in [absolute, "../../secret.txt".to_string()] {
            let err = backend
                .mutate(&baseline, &[overwrite(file.clone())])
                .expect_err("escaping path");
            assert!(format!("{:#}", err).contains("escapes the workspace"), "{:#}", err);
        }
        assert_eq!(fs::read_to_string(&secret).expect("secret"), "SECRET\n");
        assert!(backend.read_source(&baseline, "../secret.txt").is_err());
        assert!(!root.join("state/mutants").exists()
            || fs::read_dir(root.join("state/mutants")).expect("mutants").next().is_none());
        let _ = fs::remove_dir_all(root);
    }
}
