//! Static analyses over the grammar graph: minimum-size fixpoint, edge
//! token reserves, immutable-rule detection, and reachability checks.

use std::collections::VecDeque;

use tracing::{info, warn};

use super::{GrammarGraph, Vertex, VertexId, append_unique};
use crate::tree::RuleSize;

/// Result of [`GrammarGraph::analyze`], also logged through `tracing`.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    /// Farthest reachable rule from the start rule and its distance in
    /// rule steps.
    pub farthest_rule: Option<(String, usize)>,
    /// Rules not reachable from the start rule.
    pub unreachable_rules: Vec<String>,
    /// `(rule, alternation idx, alternative idx)` triples whose derivation
    /// can never terminate.
    pub infinite_alternatives: Vec<(String, usize, usize)>,
    /// Rules whose derivation can never terminate.
    pub infinite_rules: Vec<String>,
}

impl GrammarGraph {
    /// Computes the `(min_depth, min_tokens)` of every vertex by iterating
    /// to a fixpoint, fills the shared alternation/quantifier size tables,
    /// and caches on every edge the token reserve owed to its right
    /// siblings. Convergence is guaranteed because sizes only ever
    /// decrease.
    pub fn calc_min_sizes(&mut self) {
        let mut sizes = vec![RuleSize::MAX; self.vertex_count()];

        let mut changed = true;
        while changed {
            changed = false;
            for id in self.vertex_ids() {
                let children = || self.edges(id).iter().map(|edge| sizes[edge.dst.index()]);
                let candidate = match self.vertex(id) {
                    Vertex::UnlexerRule(_) => RuleSize {
                        depth: max_depth(children()).saturating_add(1),
                        tokens: sum_tokens(children()).saturating_add(1),
                    },
                    Vertex::UnparserRule(_) => RuleSize {
                        depth: max_depth(children()).saturating_add(1),
                        tokens: sum_tokens(children()),
                    },
                    Vertex::Alternative(_) => RuleSize {
                        depth: max_depth(children()),
                        tokens: sum_tokens(children()),
                    },
                    Vertex::Alternation(_) => RuleSize {
                        depth: children().map(|c| c.depth).min().unwrap_or(0),
                        tokens: children().map(|c| c.tokens).min().unwrap_or(0),
                    },
                    Vertex::Quantifier(quant) if quant.start > 0 => RuleSize {
                        depth: max_depth(children()),
                        tokens: sum_tokens(children()),
                    },
                    _ => RuleSize::ZERO,
                };

                let current = &mut sizes[id.index()];
                if candidate.depth < current.depth {
                    current.depth = candidate.depth;
                    changed = true;
                }
                if candidate.tokens < current.tokens {
                    current.tokens = candidate.tokens;
                    changed = true;
                }
            }
        }

        // Move the computed metrics onto the vertices that participate in
        // generator decisions.
        for id in self.vertex_ids() {
            let children: Vec<RuleSize> = self
                .edges(id)
                .iter()
                .map(|edge| sizes[edge.dst.index()])
                .collect();
            match self.vertex(id) {
                Vertex::UnlexerRule(_) | Vertex::UnparserRule(_) => {
                    let min_size = sizes[id.index()];
                    self.vertex_mut(id)
                        .as_rule_mut()
                        .expect("rule vertex")
                        .min_size = min_size;
                }
                Vertex::Quantifier(_) => {
                    let body = RuleSize {
                        depth: max_depth(children.iter().copied()),
                        tokens: sum_tokens(children.iter().copied()),
                    };
                    let idx = append_unique(&mut self.quant_sizes, body);
                    let Vertex::Quantifier(quant) = self.vertex_mut(id) else {
                        unreachable!()
                    };
                    quant.min_size = idx;
                }
                Vertex::Alternation(_) => {
                    // Lift the alternatives' sizes to the alternation,
                    // where the decision happens.
                    let idx = append_unique(&mut self.alt_sizes, children);
                    let Vertex::Alternation(alt) = self.vertex_mut(id) else {
                        unreachable!()
                    };
                    alt.min_sizes = idx;
                }
                _ => {}
            }
        }

        // Walking each vertex's edges backwards, accumulate the minimum
        // token cost of finishing everything after the current edge.
        // Alternatives of an alternation are mutually exclusive, so
        // alternation vertices carry no reserves.
        for id in self.vertex_ids() {
            if matches!(self.vertex(id), Vertex::Alternation(_)) {
                continue;
            }
            let mut reserve = 0usize;
            let dsts: Vec<VertexId> = self.edges(id).iter().map(|edge| edge.dst).collect();
            for (slot, dst) in dsts.into_iter().enumerate().rev() {
                self.vertices[id.index()].out_edges[slot].reserve = reserve;
                reserve = reserve.saturating_add(sizes[dst.index()].tokens);
            }
        }
    }

    /// Finds rules whose derivations consist solely of literals or other
    /// immutable rules, by fixpoint. Their tokens are constant text and
    /// are skipped by structural mutation.
    pub fn find_immutable_rules(&mut self) {
        let mut immutable = vec![false; self.vertex_count()];
        let mut changed = true;
        while changed {
            changed = false;
            for id in self.vertex_ids() {
                if immutable[id.index()] || self.vertex(id).as_rule().is_none() {
                    continue;
                }
                let all_textual = self.edges(id).iter().all(|edge| {
                    matches!(self.vertex(edge.dst), Vertex::Literal { .. })
                        || immutable[edge.dst.index()]
                });
                if all_textual {
                    immutable[id.index()] = true;
                    changed = true;
                }
            }
        }

        let mut names: Vec<String> = self
            .vertex_ids()
            .filter(|id| immutable[id.index()])
            .filter_map(|id| self.vertex(id).as_rule())
            .map(|rule| rule.id.display_name())
            .collect();
        names.sort_unstable();
        names.dedup();
        self.immutables = names;
    }

    /// Breadth-first reachability from the start rule. Reports (and logs)
    /// the farthest rule, unreachable rules, and alternatives or rules with
    /// an infinite minimum derivation depth.
    pub fn analyze(&self, root: Option<&str>) -> AnalysisReport {
        let root = root.unwrap_or(&self.default_rule);
        let mut report = AnalysisReport::default();
        let Some(root_id) = self.rule_by_name(root) else {
            warn!(rule = root, "start rule not found in grammar graph");
            return report;
        };

        let mut distances: Vec<Option<usize>> = vec![None; self.vertex_count()];
        distances[root_id.index()] = Some(0);
        let mut work_list = VecDeque::from([root_id]);
        while let Some(id) = work_list.pop_front() {
            let base = distances[id.index()].expect("queued vertices have a distance");
            for edge in self.edges(id) {
                let step = usize::from(self.vertex(edge.dst).as_rule().is_some());
                let candidate = base + step;
                if distances[edge.dst.index()].is_none_or(|d| candidate < d) {
                    distances[edge.dst.index()] = Some(candidate);
                    work_list.push_back(edge.dst);
                }
            }
        }

        report.farthest_rule = self
            .rule_vertices()
            .filter_map(|(id, rule)| {
                distances[id.index()].map(|d| (rule.id.display_name(), d))
            })
            .max_by_key(|&(_, d)| d);
        report.unreachable_rules = self
            .rule_vertices()
            .filter(|(id, _)| distances[id.index()].is_none())
            .map(|(_, rule)| rule.id.display_name())
            .collect();

        for id in self.vertex_ids() {
            match self.vertex(id) {
                Vertex::Alternation(alt) => {
                    for (alt_idx, edge) in self.edges(id).iter().enumerate() {
                        if self.alt_sizes[alt.min_sizes][alt_idx].depth == usize::MAX {
                            let Vertex::Alternative(alternative) = self.vertex(edge.dst) else {
                                continue;
                            };
                            report.infinite_alternatives.push((
                                alternative.rule.clone(),
                                alt.idx,
                                alternative.idx,
                            ));
                        }
                    }
                }
                Vertex::UnlexerRule(rule) | Vertex::UnparserRule(rule) => {
                    if rule.min_size.depth == usize::MAX {
                        report.infinite_rules.push(rule.id.display_name());
                    }
                }
                _ => {}
            }
        }

        if let Some((name, distance)) = &report.farthest_rule {
            info!(rule = %name, distance, "farthest rule from start rule");
        }
        if !report.unreachable_rules.is_empty() {
            warn!(
                count = report.unreachable_rules.len(),
                rules = report.unreachable_rules.join(", "),
                "rules unreachable from the start rule"
            );
        }
        if !report.infinite_alternatives.is_empty() {
            warn!(
                count = report.infinite_alternatives.len(),
                "alternatives with infinite derivation"
            );
        }
        if !report.infinite_rules.is_empty() {
            warn!(
                rules = report.infinite_rules.join(", "),
                "rules with infinite derivation (possible cycles)"
            );
        }
        report
    }
}

fn max_depth(children: impl Iterator<Item = RuleSize>) -> usize {
    children.map(|c| c.depth).max().unwrap_or(0)
}

fn sum_tokens(children: impl Iterator<Item = RuleSize>) -> usize {
    children.fold(0usize, |acc, c| acc.saturating_add(c.tokens))
}
