//! Stub classification and impact analysis.
//!
//! Consumes the stub records and the call graph from emission. Groups
//! stubs by root cause, re-attributes `UndeclaredFunction` stubs to the
//! root they cascade from, computes transitive-dependent counts over the
//! reverse call graph, and ranks the actionable items by how many methods
//! fixing each would unlock. Output is a pair of text reports plus the
//! machine-readable result the budget ratchet consumes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

use crate::codegen::StubRecord;
use crate::ir::StubReason;

/// The fixed root-cause taxonomy, in report order.
pub const CATEGORIES: &[&str] = &[
    "ClrInternalType",
    "UnknownParameterTypes",
    "UnknownBodyReferences",
    "UndeclaredFunction",
    "KnownBrokenPattern",
    "RenderedBodyError",
    "MissingBody",
    "Cascade",
];

/// One stub after cascade attribution.
#[derive(Debug, Clone)]
pub struct AttributedStub {
    pub method_key: String,
    pub symbol: String,
    /// Category after attribution (`Cascade` when re-attributed).
    pub category: String,
    /// Original reason detail, or the root item for cascades.
    pub detail: String,
}

/// One actionable item in the unlock ranking.
#[derive(Debug, Clone)]
pub struct UnlockItem {
    pub category: String,
    pub item: String,
    pub direct: usize,
    pub cascade: usize,
}

impl UnlockItem {
    pub fn impact(&self) -> usize {
        self.direct + self.cascade
    }
}

#[derive(Debug, Default)]
pub struct StubAnalysis {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
    pub stubs: Vec<AttributedStub>,
    pub ranking: Vec<UnlockItem>,
    pub stub_report: String,
    pub analysis_report: String,
}

pub fn analyze(
    module_name: &str,
    records: &[StubRecord],
    call_graph: &BTreeMap<String, BTreeSet<String>>,
) -> StubAnalysis {
    let by_symbol: BTreeMap<&str, &StubRecord> =
        records.iter().map(|r| (r.symbol.as_str(), r)).collect();

    // Cascade tracing: an UndeclaredFunction stub is re-attributed to the
    // first non-cascade root cause reachable through its callees.
    let mut stubs: Vec<AttributedStub> = Vec::with_capacity(records.len());
    for record in records {
        let (category, detail) = match &record.reason {
            StubReason::UndeclaredFunction(original) => {
                match trace_root(record, &by_symbol, call_graph) {
                    Some(root) => ("Cascade".to_string(), root),
                    None => ("UndeclaredFunction".to_string(), original.clone()),
                }
            }
            other => (other.category().to_string(), other.detail().to_string()),
        };
        stubs.push(AttributedStub {
            method_key: record.method_key.clone(),
            symbol: record.symbol.clone(),
            category,
            detail,
        });
    }
    stubs.sort_by(|a, b| (&a.category, &a.method_key).cmp(&(&b.category, &b.method_key)));

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for cat in CATEGORIES {
        counts.insert((*cat).to_string(), 0);
    }
    for stub in &stubs {
        *counts.entry(stub.category.clone()).or_insert(0) += 1;
    }
    let total = stubs.len();

    // Reverse call graph, for dependent counting.
    let mut reverse: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (caller, callees) in call_graph {
        for callee in callees {
            reverse
                .entry(callee.as_str())
                .or_default()
                .insert(caller.as_str());
        }
    }

    // Unlock ranking over the actionable categories.
    let mut items: BTreeMap<(String, String), Vec<&AttributedStub>> = BTreeMap::new();
    for stub in &stubs {
        if matches!(
            stub.category.as_str(),
            "ClrInternalType" | "KnownBrokenPattern" | "RenderedBodyError"
        ) {
            items
                .entry((stub.category.clone(), stub.detail.clone()))
                .or_default()
                .push(stub);
        }
    }
    let mut ranking: Vec<UnlockItem> = items
        .into_iter()
        .map(|((category, item), affected)| {
            let direct = affected.len();
            let cascade = transitive_dependents(&affected, &reverse);
            UnlockItem {
                category,
                item,
                direct,
                cascade,
            }
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.impact()
            .cmp(&a.impact())
            .then_with(|| a.item.cmp(&b.item))
    });

    let stub_report = render_stub_report(module_name, &counts, total, &stubs);
    let analysis_report = render_analysis_report(module_name, &counts, total, &ranking);

    StubAnalysis {
        counts,
        total,
        stubs,
        ranking,
        stub_report,
        analysis_report,
    }
}

/// Walk forward through the call graph from an UndeclaredFunction stub
/// until a stub with a non-cascade root cause appears.
fn trace_root(
    record: &StubRecord,
    by_symbol: &BTreeMap<&str, &StubRecord>,
    call_graph: &BTreeMap<String, BTreeSet<String>>,
) -> Option<String> {
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    queue.push_back(record.symbol.as_str());
    visited.insert(record.symbol.as_str());
    while let Some(symbol) = queue.pop_front() {
        if symbol != record.symbol {
            if let Some(target) = by_symbol.get(symbol) {
                match &target.reason {
                    StubReason::UndeclaredFunction(_) => {}
                    other => {
                        return Some(format!("{}: {}", other.category(), other.detail()));
                    }
                }
            }
        }
        if let Some(callees) = call_graph.get(symbol) {
            for callee in callees {
                if visited.insert(callee.as_str()) {
                    queue.push_back(callee.as_str());
                }
            }
        }
    }
    None
}

/// Methods that transitively call the directly-affected set (reverse-graph
/// breadth-first traversal).
fn transitive_dependents(
    affected: &[&AttributedStub],
    reverse: &BTreeMap<&str, BTreeSet<&str>>,
) -> usize {
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for stub in affected {
        visited.insert(stub.symbol.as_str());
        queue.push_back(stub.symbol.as_str());
    }
    let direct: BTreeSet<&str> = affected.iter().map(|s| s.symbol.as_str()).collect();
    while let Some(symbol) = queue.pop_front() {
        if let Some(callers) = reverse.get(symbol) {
            for caller in callers {
                if visited.insert(caller) {
                    queue.push_back(caller);
                }
            }
        }
    }
    visited.len() - direct.len()
}

fn render_stub_report(
    module_name: &str,
    counts: &BTreeMap<String, usize>,
    total: usize,
    stubs: &[AttributedStub],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Stub report for {module_name}: {total} stubbed methods");
    let _ = writeln!(out);
    for category in CATEGORIES {
        let count = counts.get(*category).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        let _ = writeln!(out, "[{category}] {count}");
        for stub in stubs.iter().filter(|s| s.category == *category) {
            if stub.detail.is_empty() {
                let _ = writeln!(out, "  {}", stub.method_key);
            } else {
                let _ = writeln!(out, "  {} ({})", stub.method_key, stub.detail);
            }
        }
        let _ = writeln!(out);
    }
    out
}

fn render_analysis_report(
    module_name: &str,
    counts: &BTreeMap<String, usize>,
    total: usize,
    ranking: &[UnlockItem],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Stub analysis for {module_name}");
    let _ = writeln!(out);
    let _ = writeln!(out, "Counts by root cause ({total} total):");
    for category in CATEGORIES {
        let count = counts.get(*category).copied().unwrap_or(0);
        let _ = writeln!(out, "  {category:<24} {count}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Unlock ranking (direct + cascade, descending):");
    if ranking.is_empty() {
        let _ = writeln!(out, "  (nothing actionable)");
    }
    for item in ranking {
        let _ = writeln!(
            out,
            "  {:<5} {:<20} {} (direct {}, cascade {})",
            item.impact(),
            item.category,
            item.item,
            item.direct,
            item.cascade
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodId;

    fn record(symbol: &str, reason: StubReason) -> StubRecord {
        StubRecord {
            method: MethodId(0),
            method_key: format!("T::{symbol}()"),
            symbol: symbol.to_string(),
            reason,
        }
    }

    fn graph(edges: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        let mut g: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (a, b) in edges {
            g.entry((*a).to_string()).or_default().insert((*b).to_string());
        }
        g
    }

    #[test]
    fn cascades_attribute_to_the_non_cascade_root() {
        let records = vec![
            record(
                "root",
                StubReason::ClrInternalType("System.RuntimeType".into()),
            ),
            record("mid", StubReason::UndeclaredFunction("root/1".into())),
        ];
        let cg = graph(&[("mid", "root")]);
        let analysis = analyze("m", &records, &cg);
        let mid = analysis.stubs.iter().find(|s| s.symbol == "mid").unwrap();
        assert_eq!(mid.category, "Cascade");
        assert!(mid.detail.contains("ClrInternalType"));
        assert_eq!(analysis.counts["Cascade"], 1);
        assert_eq!(analysis.counts["ClrInternalType"], 1);
        assert_eq!(analysis.counts["UndeclaredFunction"], 0);
    }

    #[test]
    fn unresolvable_cascade_stays_undeclared() {
        let records = vec![record(
            "lonely",
            StubReason::UndeclaredFunction("ghost/2".into()),
        )];
        let analysis = analyze("m", &records, &BTreeMap::new());
        assert_eq!(analysis.counts["UndeclaredFunction"], 1);
    }

    #[test]
    fn unlock_ranking_counts_transitive_dependents() {
        let records = vec![record(
            "broken",
            StubReason::KnownBrokenPattern("simd-intrinsic".into()),
        )];
        // a -> b -> broken; both a and b depend on the broken method.
        let cg = graph(&[("a", "b"), ("b", "broken")]);
        let analysis = analyze("m", &records, &cg);
        assert_eq!(analysis.ranking.len(), 1);
        let item = &analysis.ranking[0];
        assert_eq!(item.direct, 1);
        assert_eq!(item.cascade, 2);
        assert_eq!(item.impact(), 3);
    }

    #[test]
    fn reports_group_by_category_in_fixed_order() {
        let records = vec![
            record("x", StubReason::MissingBody),
            record(
                "y",
                StubReason::ClrInternalType("System.RuntimeType".into()),
            ),
        ];
        let analysis = analyze("m", &records, &BTreeMap::new());
        let internal_pos = analysis.stub_report.find("[ClrInternalType]").unwrap();
        let missing_pos = analysis.stub_report.find("[MissingBody]").unwrap();
        assert!(internal_pos < missing_pos);
        // Stable across runs: identical input yields identical text.
        let again = analyze("m", &records, &BTreeMap::new());
        assert_eq!(analysis.stub_report, again.stub_report);
        assert_eq!(analysis.analysis_report, again.analysis_report);
    }
}
