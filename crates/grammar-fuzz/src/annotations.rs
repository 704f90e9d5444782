//! Tree metadata for the mutation engine: per-node levels, subtree
//! heights and token counts, plus buckets of nodes grouped by structural
//! identity (rule name, alternation site, quantifier site).
//!
//! Annotations are derived in one pre-order pass and never updated in
//! place; mutated trees get fresh annotations through a fresh
//! [`Individual`](crate::population::Individual).

use indexmap::IndexMap;

use crate::tree::{NodeId, NodeKind, Tree};

/// Structural identity of a mutation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum NodeKey {
    /// A rule node, by display name.
    #[display("{_0}")]
    Rule(String),
    /// An alternation site: `(containing rule, alternation index)`.
    #[display("({_0}, a, {_1})")]
    Alt(String, usize),
    /// A quantifier site: `(containing rule, quantifier index)`.
    #[display("({_0}, q, {_1})")]
    Quant(String, usize),
}

/// Precomputed metadata of one tree.
#[derive(Debug, Default)]
pub struct Annotations {
    node_levels: Vec<usize>,
    node_depths: Vec<usize>,
    node_tokens: Vec<usize>,
    pub rules_by_name: IndexMap<NodeKey, Vec<NodeId>>,
    pub alts_by_name: IndexMap<NodeKey, Vec<NodeId>>,
    pub quants_by_name: IndexMap<NodeKey, Vec<NodeId>>,
}

impl Annotations {
    pub fn new(tree: &Tree) -> Self {
        let mut annotations = Self {
            node_levels: vec![0; tree.node_count()],
            node_depths: vec![0; tree.node_count()],
            node_tokens: vec![0; tree.node_count()],
            rules_by_name: IndexMap::new(),
            alts_by_name: IndexMap::new(),
            quants_by_name: IndexMap::new(),
        };
        annotations.annotate(tree, tree.root(), 0, None);
        annotations
    }

    /// Distance of `node` from the root.
    pub fn level(&self, node: NodeId) -> usize {
        self.node_levels[node.index()]
    }

    /// Height of the subtree rooted at `node`; tokens count as leaves.
    pub fn depth(&self, node: NodeId) -> usize {
        self.node_depths[node.index()]
    }

    /// Token weight of the subtree rooted at `node`.
    pub fn tokens(&self, node: NodeId) -> usize {
        self.node_tokens[node.index()]
    }

    /// All bucketed rule nodes.
    pub fn rules(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.rules_by_name.values().flatten().copied()
    }

    /// All bucketed quantifier nodes.
    pub fn quants(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.quants_by_name.values().flatten().copied()
    }

    fn annotate(
        &mut self,
        tree: &Tree,
        node: NodeId,
        level: usize,
        enclosing_rule: Option<&str>,
    ) -> (usize, usize) {
        self.node_levels[node.index()] = level;

        match tree.kind(node) {
            NodeKind::UnlexerRule {
                name,
                size,
                immutable,
                ..
            } => {
                // Tokens are leaves of the structural tree: their chunk
                // children are text, not mutation targets. The +1 counts
                // the token itself on top of its recorded sub-token count.
                if let Some(name) = name.as_deref().filter(|&n| n != "<INVALID>") {
                    if tree.parent(node).is_some() && !immutable {
                        self.rules_by_name
                            .entry(NodeKey::Rule(name.to_owned()))
                            .or_default()
                            .push(node);
                    }
                }
                let tokens = size.tokens + 1;
                self.node_tokens[node.index()] = tokens;
                return (0, tokens);
            }

            NodeKind::UnparserRule { name } => {
                let rule = (name != "<INVALID>").then_some(name.as_str());
                if let Some(rule) = rule {
                    if tree.parent(node).is_some() {
                        self.rules_by_name
                            .entry(NodeKey::Rule(rule.to_owned()))
                            .or_default()
                            .push(node);
                    }
                }
                let rule = rule.map(str::to_owned);
                return self.annotate_children(tree, node, level, rule.as_deref());
            }

            NodeKind::Quantifier { idx, .. } => {
                if let Some(rule) = enclosing_rule {
                    self.quants_by_name
                        .entry(NodeKey::Quant(rule.to_owned(), *idx))
                        .or_default()
                        .push(node);
                }
            }

            NodeKind::Alternative { alt_idx, .. } => {
                if let Some(rule) = enclosing_rule {
                    self.alts_by_name
                        .entry(NodeKey::Alt(rule.to_owned(), *alt_idx))
                        .or_default()
                        .push(node);
                }
            }

            NodeKind::Quantified => {}
        }

        self.annotate_children(tree, node, level, enclosing_rule)
    }

    fn annotate_children(
        &mut self,
        tree: &Tree,
        node: NodeId,
        level: usize,
        enclosing_rule: Option<&str>,
    ) -> (usize, usize) {
        let mut depth = 0;
        let mut tokens = 0;
        for i in 0..tree.children(node).len() {
            let child = tree.children(node)[i];
            let (child_depth, child_tokens) =
                self.annotate(tree, child, level + 1, enclosing_rule);
            depth = depth.max(child_depth + 1);
            tokens += child_tokens;
        }
        self.node_depths[node.index()] = depth;
        self.node_tokens[node.index()] = tokens;
        (depth, tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Suffix;
    use crate::generator::Generator;
    use crate::model::DefaultModel;
    use crate::testing::*;
    use crate::tree::RuleSize;

    fn star_tree(seed: u64) -> Tree {
        // S: A* 'end'; A: [x]; — A is a charset rule so that its tokens
        // stay mutable and show up in the rule buckets.
        let graph = compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Star), lit("end")])),
            lexer_rule(
                "A",
                seq(vec![crate::compiler::ast::Element::Charset { value: "x".into() }]),
            ),
        ]);
        Generator::new(&graph)
            .with_model(Box::new(DefaultModel::with_seed(seed)))
            .with_limit(RuleSize::new(10, 10))
            .generate(None)
            .expect("generation succeeds")
    }

    #[test]
    fn buckets_group_by_structural_identity() {
        let tree = star_tree(5);
        let annotations = Annotations::new(&tree);
        let quants = &annotations.quants_by_name[&NodeKey::Quant("S".into(), 0)];
        assert_eq!(quants.len(), 1);
        // The root is excluded from the rule buckets.
        assert!(
            !annotations
                .rules_by_name
                .get(&NodeKey::Rule("S".into()))
                .is_some_and(|nodes| nodes.contains(&tree.root()))
        );
        // Every generated A is bucketed under its name.
        let iterations = tree.children(quants[0]).len();
        let a_bucket = annotations
            .rules_by_name
            .get(&NodeKey::Rule("A".into()))
            .map_or(0, Vec::len);
        assert_eq!(a_bucket, iterations);
    }

    #[test]
    fn levels_and_depths_are_consistent() {
        let tree = star_tree(9);
        let annotations = Annotations::new(&tree);
        assert_eq!(annotations.level(tree.root()), 0);
        for node in tree.iter_depth_first(tree.root()) {
            for &child in tree.children(node) {
                if !matches!(tree.kind(node), NodeKind::UnlexerRule { .. }) {
                    assert_eq!(annotations.level(child), annotations.level(node) + 1);
                    assert!(annotations.depth(node) > annotations.depth(child));
                }
            }
        }
    }

    #[test]
    fn token_counts_sum_over_subtrees() {
        let tree = star_tree(3);
        let annotations = Annotations::new(&tree);
        let quantifier = tree.children(tree.root())[0];
        let iterations = tree.children(quantifier).len();
        // Each iteration holds one simple token (counting 2: itself plus
        // its recorded context), plus the trailing 'end' token.
        assert_eq!(annotations.tokens(quantifier), iterations * 2);
        assert_eq!(annotations.tokens(tree.root()), iterations * 2 + 2);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let tree = star_tree(12);
        let first = Annotations::new(&tree);
        let second = Annotations::new(&tree);
        assert_eq!(first.rules_by_name, second.rules_by_name);
        assert_eq!(first.alts_by_name, second.alts_by_name);
        assert_eq!(first.quants_by_name, second.quants_by_name);
        for node in tree.iter_depth_first(tree.root()) {
            assert_eq!(first.level(node), second.level(node));
            assert_eq!(first.depth(node), second.depth(node));
            assert_eq!(first.tokens(node), second.tokens(node));
        }
    }
}
