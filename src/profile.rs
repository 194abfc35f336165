//! Aggregation of synthesized call stacks into a hierarchical profile

use activity_stacks::{asylum::CallStackInterner, ActivityKind, CallStackIndex};
use std::collections::HashMap;

/// Number of samples that fell somewhere
pub type SampleCount = usize;

/// Hierarchical profile built from sampled synthesized call stacks
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackProfile {
    /// Number of samples whose stack goes through each node
    inclusive: HashMap<CallStackIndex, SampleCount>,

    /// Number of samples whose leaf is each node
    exclusive: HashMap<CallStackIndex, SampleCount>,

    /// Direct callees of each node, in order of first appearance
    callees: HashMap<CallStackIndex, Vec<CallStackIndex>>,

    /// Nodes without a caller, in order of first appearance
    roots: Vec<CallStackIndex>,

    /// Number of samples taken while each kind of activity was running
    kinds: HashMap<ActivityKind, SampleCount>,

    /// Total number of samples
    total: SampleCount,
}
//
impl StackProfile {
    /// Start with an empty profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, taken while an activity of a certain kind was running
    pub fn record(
        &mut self,
        output: &CallStackInterner,
        stack: CallStackIndex,
        kind: ActivityKind,
    ) {
        self.total += 1;
        *self.exclusive.entry(stack).or_default() += 1;
        *self.kinds.entry(kind).or_default() += 1;
        for node in std::iter::successors(Some(stack), |&node| output.caller(node)) {
            let first_sample = {
                let count = self.inclusive.entry(node).or_default();
                *count += 1;
                *count == 1
            };
            if first_sample {
                match output.caller(node) {
                    Some(caller) => self.callees.entry(caller).or_default().push(node),
                    None => self.roots.push(node),
                }
            }
        }
    }

    /// Total number of samples
    pub fn total(&self) -> SampleCount {
        self.total
    }

    /// Number of samples whose stack goes through some node
    pub fn inclusive(&self, node: CallStackIndex) -> SampleCount {
        self.inclusive.get(&node).copied().unwrap_or(0)
    }

    /// Number of samples whose leaf is some node
    pub fn exclusive(&self, node: CallStackIndex) -> SampleCount {
        self.exclusive.get(&node).copied().unwrap_or(0)
    }

    /// Fraction of all samples that go through some node
    pub fn fraction(&self, node: CallStackIndex) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.inclusive(node) as f64 / self.total as f64
        }
    }

    /// Outermost nodes that reach some fraction of all samples, hottest first
    pub fn hottest_roots(&self, threshold: f64) -> Box<[CallStackIndex]> {
        self.hottest(&self.roots, threshold)
    }

    /// Direct callees of a node
    pub fn callees(&self, node: CallStackIndex) -> &[CallStackIndex] {
        self.callees
            .get(&node)
            .map(|callees| &callees[..])
            .unwrap_or(&[])
    }

    /// Direct callees of a node that reach some fraction of all samples,
    /// hottest first
    pub fn hottest_callees(&self, node: CallStackIndex, threshold: f64) -> Box<[CallStackIndex]> {
        self.hottest(self.callees(node), threshold)
    }

    /// Breakdown of samples by kind of running activity, largest first
    pub fn kind_breakdown(&self) -> Box<[(ActivityKind, SampleCount)]> {
        let mut breakdown = self
            .kinds
            .iter()
            .map(|(&kind, &count)| (kind, count))
            .collect::<Box<[_]>>();
        breakdown.sort_unstable_by(|(k1, c1), (k2, c2)| {
            c2.cmp(c1).then(k1.name().cmp(k2.name()))
        });
        breakdown
    }

    /// Filter and sort nodes by inclusive sample count
    fn hottest(&self, nodes: &[CallStackIndex], threshold: f64) -> Box<[CallStackIndex]> {
        let mut hottest = nodes
            .iter()
            .copied()
            .filter(|&node| self.fraction(node) >= threshold)
            .collect::<Box<[_]>>();
        hottest.sort_by_key(|&node| std::cmp::Reverse(self.inclusive(node)));
        hottest
    }
}
