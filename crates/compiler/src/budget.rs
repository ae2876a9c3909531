//! The stub-budget ratchet.
//!
//! A JSON side-car holds, per module, the last accepted stub counts per
//! root-cause category. A build whose counts exceed the budget fails; a
//! build that improves any category rewrites the side-car with the new,
//! lower numbers. The update is monotone — counts only ever go down — so
//! the file doubles as a regression fence and a progress record.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::{CATEGORIES, StubAnalysis};
use crate::error::{CompileError, Result};

/// Per-module budget entry: one integer per root-cause category plus the
/// total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEntry {
    #[serde(default)]
    pub clr_internal_type: usize,
    #[serde(default)]
    pub unknown_parameter_types: usize,
    #[serde(default)]
    pub unknown_body_references: usize,
    #[serde(default)]
    pub undeclared_function: usize,
    #[serde(default)]
    pub known_broken_pattern: usize,
    #[serde(default)]
    pub rendered_body_error: usize,
    #[serde(default)]
    pub missing_body: usize,
    #[serde(default)]
    pub cascade: usize,
    #[serde(default)]
    pub total: usize,
}

impl BudgetEntry {
    pub fn from_counts(counts: &BTreeMap<String, usize>, total: usize) -> BudgetEntry {
        let get = |name: &str| counts.get(name).copied().unwrap_or(0);
        BudgetEntry {
            clr_internal_type: get("ClrInternalType"),
            unknown_parameter_types: get("UnknownParameterTypes"),
            unknown_body_references: get("UnknownBodyReferences"),
            undeclared_function: get("UndeclaredFunction"),
            known_broken_pattern: get("KnownBrokenPattern"),
            rendered_body_error: get("RenderedBodyError"),
            missing_body: get("MissingBody"),
            cascade: get("Cascade"),
            total,
        }
    }

    fn field(&self, category: &str) -> usize {
        match category {
            "ClrInternalType" => self.clr_internal_type,
            "UnknownParameterTypes" => self.unknown_parameter_types,
            "UnknownBodyReferences" => self.unknown_body_references,
            "UndeclaredFunction" => self.undeclared_function,
            "KnownBrokenPattern" => self.known_broken_pattern,
            "RenderedBodyError" => self.rendered_body_error,
            "MissingBody" => self.missing_body,
            "Cascade" => self.cascade,
            _ => 0,
        }
    }
}

/// Result of applying the ratchet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RatchetOutcome {
    /// No budget file configured or no entry for this module; counts
    /// recorded fresh.
    Recorded,
    /// Every category equal to its budget; file untouched.
    Unchanged,
    /// At least one category improved; file rewritten with lower counts.
    Ratcheted,
}

/// Compare current counts to the persisted budget and ratchet downward.
///
/// Overruns fail the build with one line per exceeded category. The file
/// is only rewritten on improvement, never on equality.
pub fn check_and_ratchet(
    path: &Path,
    module: &str,
    analysis: &StubAnalysis,
) -> Result<RatchetOutcome> {
    let current = BudgetEntry::from_counts(&analysis.counts, analysis.total);

    let mut budgets: BTreeMap<String, BudgetEntry> = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).unwrap_or_default()
    } else {
        BTreeMap::new()
    };

    let Some(budget) = budgets.get(module) else {
        budgets.insert(module.to_string(), current);
        write_budgets(path, &budgets)?;
        return Ok(RatchetOutcome::Recorded);
    };

    let mut overruns = Vec::new();
    for category in CATEGORIES {
        let allowed = budget.field(category);
        let actual = current.field(category);
        if actual > allowed {
            overruns.push(format!("{category}: {actual} > budget {allowed}"));
        }
    }
    if current.total > budget.total {
        overruns.push(format!(
            "total: {} > budget {}",
            current.total, budget.total
        ));
    }
    if !overruns.is_empty() {
        return Err(CompileError::BudgetExceeded { overruns });
    }

    let improved = CATEGORIES
        .iter()
        .any(|c| current.field(c) < budget.field(c))
        || current.total < budget.total;
    if improved {
        budgets.insert(module.to_string(), current);
        write_budgets(path, &budgets)?;
        Ok(RatchetOutcome::Ratcheted)
    } else {
        Ok(RatchetOutcome::Unchanged)
    }
}

fn write_budgets(path: &Path, budgets: &BTreeMap<String, BudgetEntry>) -> Result<()> {
    let text = serde_json::to_string_pretty(budgets)
        .map_err(|e| CompileError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StubAnalysis;

    fn analysis_with(counts: &[(&str, usize)]) -> StubAnalysis {
        let mut analysis = StubAnalysis::default();
        let mut total = 0;
        for (name, value) in counts {
            analysis.counts.insert((*name).to_string(), *value);
            total += value;
        }
        analysis.total = total;
        analysis
    }

    #[test]
    fn first_run_records_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub-budget.json");
        let analysis = analysis_with(&[("MissingBody", 3)]);
        let outcome = check_and_ratchet(&path, "app", &analysis).unwrap();
        assert_eq!(outcome, RatchetOutcome::Recorded);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"missing_body\": 3"));
    }

    #[test]
    fn equal_counts_leave_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub-budget.json");
        let analysis = analysis_with(&[("MissingBody", 3)]);
        check_and_ratchet(&path, "app", &analysis).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        let outcome = check_and_ratchet(&path, "app", &analysis).unwrap();
        assert_eq!(outcome, RatchetOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn improvement_ratchets_downward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub-budget.json");
        check_and_ratchet(&path, "app", &analysis_with(&[("MissingBody", 3)])).unwrap();
        let outcome =
            check_and_ratchet(&path, "app", &analysis_with(&[("MissingBody", 1)])).unwrap();
        assert_eq!(outcome, RatchetOutcome::Ratcheted);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"missing_body\": 1"));
        // And the ratchet holds: going back up now fails.
        let err = check_and_ratchet(&path, "app", &analysis_with(&[("MissingBody", 3)]));
        assert!(matches!(err, Err(CompileError::BudgetExceeded { .. })));
    }

    #[test]
    fn regressions_fail_with_the_overrun_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub-budget.json");
        check_and_ratchet(
            &path,
            "app",
            &analysis_with(&[("MissingBody", 1), ("Cascade", 2)]),
        )
        .unwrap();
        let err = check_and_ratchet(
            &path,
            "app",
            &analysis_with(&[("MissingBody", 2), ("Cascade", 2)]),
        );
        match err {
            Err(CompileError::BudgetExceeded { overruns }) => {
                assert!(overruns.iter().any(|o| o.contains("MissingBody")));
            }
            other => panic!("expected budget failure, got {other:?}"),
        }
    }

    #[test]
    fn modules_are_budgeted_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub-budget.json");
        check_and_ratchet(&path, "app", &analysis_with(&[("MissingBody", 1)])).unwrap();
        let outcome =
            check_and_ratchet(&path, "lib", &analysis_with(&[("MissingBody", 9)])).unwrap();
        assert_eq!(outcome, RatchetOutcome::Recorded);
    }
}
