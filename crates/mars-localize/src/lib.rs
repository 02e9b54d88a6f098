//! Spectrum-based fault localization over per-test coverage.

use mars_core::{FileLine, FileLineSet, TestSuiteCoverage};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

/// Scores a line from its spectrum: executed-by-passing, not-executed-by-passing,
/// executed-by-failing, not-executed-by-failing.
pub type Suspiciousness = fn(ep: usize, np: usize, ef: usize, nf: usize) -> f64;

/// Zero unless every failing test executes the line, then the share of passing
/// tests that do not execute it.
pub fn greedy(ep: usize, np: usize, _ef: usize, nf: usize) -> f64 {
    if nf != 0 {
        return 0.0;
    }
    np as f64 / (ep + np + 1) as f64
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocalizeError {
    #[error("no lines are implicated by the failing tests")]
    NoImplicatedLines,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Spectrum {
    pub ep: usize,
    pub np: usize,
    pub ef: usize,
    pub nf: usize,
}

/// Suspiciousness per line. Only lines with a positive score are stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Localization {
    scores: BTreeMap<FileLine, f64>,
}

impl Localization {
    pub fn from_scores<I: IntoIterator<Item = (FileLine, f64)>>(scores: I) -> Self {
        Self {
            scores: scores.into_iter().filter(|(_, s)| *s > 0.0).collect(),
        }
    }

    pub fn from_coverage(coverage: &TestSuiteCoverage, policy: Suspiciousness) -> Self {
        Self::from_scores(
            spectra(coverage)
                .into_iter()
                .map(|(line, s)| (line, policy(s.ep, s.np, s.ef, s.nf))),
        )
    }

    pub fn get(&self, line: &FileLine) -> f64 {
        self.scores.get(line).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn files(&self) -> Vec<String> {
        let files: BTreeSet<&String> = self.scores.keys().map(|l| &l.file).collect();
        files.into_iter().cloned().collect()
    }

    pub fn lines(&self) -> FileLineSet {
        self.scores.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileLine, f64)> {
        self.scores.iter().map(|(l, s)| (l, *s))
    }

    pub fn restricted_to_files(&self, files: &[String]) -> Localization {
        Self {
            scores: self
                .scores
                .iter()
                .filter(|(l, _)| files.iter().any(|f| *f == l.file))
                .map(|(l, s)| (l.clone(), *s))
                .collect(),
        }
    }

    pub fn restricted_to_lines(&self, lines: &FileLineSet) -> Localization {
        Self {
            scores: self
                .scores
                .iter()
                .filter(|(l, _)| lines.contains(l))
                .map(|(l, s)| (l.clone(), *s))
                .collect(),
        }
    }

    /// Every line exactly once, in a seeded order biased toward higher scores.
    ///
    /// Each line draws the key `u^(1/score)` and lines are taken by descending
    /// key, which samples without replacement proportionally to score.
    pub fn weighted_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<FileLine> {
        let mut keyed: Vec<(f64, &FileLine)> = self
            .scores
            .iter()
            .map(|(line, score)| {
                let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                (u.powf(1.0 / score), line)
            })
            .collect();
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        keyed.into_iter().map(|(_, line)| line.clone()).collect()
    }
}

impl fmt::Display for Localization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (line, score) in &self.scores {
            writeln!(f, "  {}: {:.3}", line, score)?;
        }
        Ok(())
    }
}

/// Spectrum of every line executed by at least one test.
pub fn spectra(coverage: &TestSuiteCoverage) -> BTreeMap<FileLine, Spectrum> {
    let passing = coverage.passing();
    let failing = coverage.failing();
    let (n_pass, n_fail) = (passing.len(), failing.len());
    let mut out = BTreeMap::new();
    for line in coverage.lines().iter() {
        let ep = passing.iter().filter(|t| t.lines.contains(&line)).count();
        let ef = failing.iter().filter(|t| t.lines.contains(&line)).count();
        out.insert(
            line,
            Spectrum {
                ep,
                np: n_pass - ep,
                ef,
                nf: n_fail - ef,
            },
        );
    }
    out
}

/// Scores every executed line with `policy`, then drops files holding at most
/// one suspicious line unless they appear in `protected`.
pub fn localize(
    coverage: &TestSuiteCoverage,
    policy: Suspiciousness,
    protected: &[String],
) -> Result<Localization, LocalizeError> {
    info!("computing fault localization");
    debug!(
        passing = coverage.passing().len(),
        failing = coverage.failing().len(),
        "coverage spectra"
    );
    let localization = Localization::from_coverage(coverage, policy);
    let lines = localization.lines();
    let mut keep = Vec::new();
    for file in lines.files() {
        let count = lines.lines_in(&file).map(|l| l.len()).unwrap_or(0);
        if count > 1 || protected.contains(&file) {
            debug!(file = %file, lines = count, "keeping file");
            keep.push(file);
        } else {
            debug!(file = %file, lines = count, "dropping file");
        }
    }
    let localization = localization.restricted_to_files(&keep);
    if localization.is_empty() {
        return Err(LocalizeError::NoImplicatedLines);
    }
    info!(
        files = localization.files().len(),
        lines = localization.len(),
        "computed fault localization"
    );
    debug!("suspicious lines:\n{}", localization);
    Ok(localization)
}
