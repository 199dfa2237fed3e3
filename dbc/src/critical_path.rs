//! Post-hoc analysis of a finished remote build's per-rule trace.
//!
//! Two derived views are produced:
//!
//! - per-minion "virtual threads": each minion's rule windows greedily packed
//!   into non-overlapping lanes, approximating worker concurrency;
//! - the critical path: the chain of cacheable rules with the largest
//!   accumulated wall-clock time, found by bubbling chain lengths from each
//!   rule to its dependents in start-time order.

use dbc_common::MinionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// One recorded execution window of a rule on a minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleWindow {
    pub rule: String,
    pub start_ms: u64,
    pub finish_ms: u64,
}

impl RuleWindow {
    pub fn new(rule: impl Into<String>, start_ms: u64, finish_ms: u64) -> Self {
        Self {
            rule: rule.into(),
            start_ms,
            finish_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.finish_ms.saturating_sub(self.start_ms)
    }
}

/// Per-rule state carried through the critical-path pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleTrace {
    pub rule: String,
    pub start_ms: u64,
    pub finish_ms: u64,
    /// Longest dependency chain ending at this rule. Only grows.
    pub longest_chain_ms: u64,
    /// Every rule that transitively depends on this one.
    pub dependent_count: usize,
    pub predecessor: Option<String>,
}

impl RuleTrace {
    fn from_window(window: &RuleWindow) -> Self {
        Self {
            rule: window.rule.clone(),
            start_ms: window.start_ms,
            finish_ms: window.finish_ms,
            longest_chain_ms: window.duration_ms(),
            dependent_count: 0,
            predecessor: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.finish_ms.saturating_sub(self.start_ms)
    }
}

/// A lane of non-overlapping rule windows on one minion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MinionThread {
    pub rules: Vec<RuleWindow>,
}

impl MinionThread {
    fn available_at(&self, start_ms: u64) -> bool {
        self.rules
            .last()
            .is_none_or(|last| last.finish_ms <= start_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinionTrace {
    pub minion_id: MinionId,
    pub threads: Vec<MinionThread>,
}

/// Build dependency graph, materialized before the pass.
#[derive(Debug, Clone, Default)]
pub struct RuleGraph {
    dependents: HashMap<String, BTreeSet<String>>,
    cacheable: HashSet<String>,
}

impl RuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `rule` depends on `depends_on`.
    pub fn add_dependency(&mut self, rule: impl Into<String>, depends_on: impl Into<String>) {
        self.dependents
            .entry(depends_on.into())
            .or_default()
            .insert(rule.into());
    }

    pub fn mark_cacheable(&mut self, rule: impl Into<String>) {
        self.cacheable.insert(rule.into());
    }

    pub fn is_cacheable(&self, rule: &str) -> bool {
        self.cacheable.contains(rule)
    }

    /// Number of rules that depend on `rule`, directly or transitively.
    pub fn transitive_dependent_count(&self, rule: &str) -> usize {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([rule]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if dependent != rule && seen.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        seen.len()
    }

    /// Cacheable rules reachable from `rule` through dependent edges.
    ///
    /// Non-cacheable dependents are walked through but not returned.
    pub fn cacheable_dependents(&self, rule: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(rule);
        seen.insert(rule);

        while let Some(current) = queue.pop_front() {
            let Some(next) = self.dependents.get(current) else {
                continue;
            };
            for dependent in next {
                if !seen.insert(dependent.as_str()) {
                    continue;
                }
                if self.is_cacheable(dependent) {
                    found.push(dependent.clone());
                } else {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        found
    }
}

/// Recorded rule windows grouped by minion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTrace {
    pub minions: BTreeMap<MinionId, Vec<RuleWindow>>,
}

impl BuildTrace {
    pub fn record(&mut self, minion_id: MinionId, window: RuleWindow) {
        self.minions.entry(minion_id).or_default().push(window);
    }
}

/// Edge in a trace file: `rule` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub rule: String,
    pub depends_on: String,
}

/// On-disk trace consumed by `dbc critical-path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFile {
    #[serde(default)]
    pub minions: BTreeMap<MinionId, Vec<RuleWindow>>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// Cacheable rules. When absent every traced rule is cacheable.
    #[serde(default)]
    pub cacheable: Option<Vec<String>>,
}

impl TraceFile {
    pub fn into_parts(self) -> (BuildTrace, RuleGraph) {
        let mut graph = RuleGraph::new();
        for edge in self.dependencies {
            graph.add_dependency(edge.rule, edge.depends_on);
        }
        match self.cacheable {
            Some(rules) => rules.into_iter().for_each(|rule| graph.mark_cacheable(rule)),
            None => {
                for window in self.minions.values().flatten() {
                    graph.mark_cacheable(window.rule.clone());
                }
            }
        }
        (
            BuildTrace {
                minions: self.minions,
            },
            graph,
        )
    }
}

/// Entry on the reported critical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalPathEntry {
    pub rule: String,
    pub start_ms: u64,
    pub finish_ms: u64,
    pub duration_ms: u64,
    pub longest_chain_ms: u64,
    pub dependent_count: usize,
}

impl From<&RuleTrace> for CriticalPathEntry {
    fn from(trace: &RuleTrace) -> Self {
        Self {
            rule: trace.rule.clone(),
            start_ms: trace.start_ms,
            finish_ms: trace.finish_ms,
            duration_ms: trace.duration_ms(),
            longest_chain_ms: trace.longest_chain_ms,
            dependent_count: trace.dependent_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalPathReport {
    pub minions: Vec<MinionTrace>,
    /// Root first, then each predecessor back to the origin.
    pub critical_path: Vec<CriticalPathEntry>,
    pub longest_chain_ms: u64,
}

impl CriticalPathReport {
    pub fn root(&self) -> Option<&CriticalPathEntry> {
        self.critical_path.first()
    }
}

/// Greedy interval partitioning of one minion's windows into lanes.
pub fn partition_into_threads(windows: &[RuleWindow]) -> Vec<MinionThread> {
    let mut sorted = windows.to_vec();
    sorted.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then(a.finish_ms.cmp(&b.finish_ms)));

    let mut threads: Vec<MinionThread> = Vec::new();
    for window in sorted {
        match threads.iter_mut().find(|t| t.available_at(window.start_ms)) {
            Some(thread) => thread.rules.push(window),
            None => threads.push(MinionThread {
                rules: vec![window],
            }),
        }
    }
    threads
}

fn dedup_latest_finish(trace: &BuildTrace) -> HashMap<String, RuleTrace> {
    let mut rules: HashMap<String, RuleTrace> = HashMap::new();
    for window in trace.minions.values().flatten() {
        match rules.get(&window.rule) {
            Some(existing) if existing.finish_ms >= window.finish_ms => {}
            _ => {
                rules.insert(window.rule.clone(), RuleTrace::from_window(window));
            }
        }
    }
    rules
}

/// Run the bubble-up pass and return the critical path, root first.
pub fn compute_critical_path(trace: &BuildTrace, graph: &RuleGraph) -> Vec<RuleTrace> {
    let mut rules = dedup_latest_finish(trace);

    let mut order: Vec<(u64, String)> = rules
        .values()
        .map(|r| (r.start_ms, r.rule.clone()))
        .collect();
    order.sort();

    for (_, rule) in &order {
        let Some(own_chain) = rules.get(rule).map(|r| r.longest_chain_ms) else {
            continue;
        };
        let dependents = graph.cacheable_dependents(rule);
        if let Some(current) = rules.get_mut(rule) {
            current.dependent_count = graph.transitive_dependent_count(rule);
        }
        for dependent in dependents {
            let Some(target) = rules.get_mut(&dependent) else {
                debug!("Dependent {} of {} has no recorded trace, skipping", dependent, rule);
                continue;
            };
            let candidate = own_chain.saturating_add(target.duration_ms());
            if candidate > target.longest_chain_ms {
                target.longest_chain_ms = candidate;
                target.predecessor = Some(rule.clone());
            }
        }
    }

    let Some(root) = rules
        .values()
        .max_by(|a, b| {
            a.longest_chain_ms
                .cmp(&b.longest_chain_ms)
                .then(a.finish_ms.cmp(&b.finish_ms))
                .then(b.rule.cmp(&a.rule))
        })
        .cloned()
    else {
        return Vec::new();
    };

    let mut path = vec![root];
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(path[0].rule.clone());
    while let Some(prev) = path.last().and_then(|r| r.predecessor.clone()) {
        if !visited.insert(prev.clone()) {
            warn!("Predecessor cycle at {}, truncating critical path", prev);
            break;
        }
        match rules.get(&prev) {
            Some(trace) => path.push(trace.clone()),
            None => break,
        }
    }
    path
}

/// Full report: virtual-thread layout per minion plus the critical path.
pub fn analyze(trace: &BuildTrace, graph: &RuleGraph) -> CriticalPathReport {
    let minions = trace
        .minions
        .iter()
        .map(|(minion_id, windows)| MinionTrace {
            minion_id: minion_id.clone(),
            threads: partition_into_threads(windows),
        })
        .collect();
    let path = compute_critical_path(trace, graph);
    let longest_chain_ms = path.first().map(|r| r.longest_chain_ms).unwrap_or(0);
    CriticalPathReport {
        minions,
        critical_path: path.iter().map(CriticalPathEntry::from).collect(),
        longest_chain_ms,
    }
}
