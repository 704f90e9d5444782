//! The mutation and recombination operators.
//!
//! Every operator is budget-aware: candidates are filtered so that the
//! result stays within the configured size limit (levels plus subtree
//! heights against the depth limit, root token weight against the token
//! limit). Operators return `None` when no candidate qualifies; the
//! dispatcher then tries the next operator.
//!
//! Operators never mutate the recipient individual: they clone its arena
//! (annotation node ids stay valid in the clone) and edit the clone.

use indexmap::IndexMap;
use rand::Rng;

use super::{GeneratorTool, ToolError};
use crate::annotations::{Annotations, NodeKey};
use crate::population::Individual;
use crate::tree::{NodeId, NodeKind, RuleSize, Tree};

impl GeneratorTool<'_> {
    /// Discards the subtree at a random rule node whose regeneration can
    /// fit the limits, and re-generates it from the grammar. Falls back
    /// to regenerating the whole tree from its root rule.
    pub fn regenerate_rule(&mut self, individual: &Individual) -> Result<Tree, ToolError> {
        let tree = individual.tree();
        let annot = individual.annotations();
        let root_tokens = annot.tokens(tree.root());

        let options: Vec<NodeId> = annot
            .rules()
            .filter(|&node| {
                let Some(name) = tree.kind(node).name() else {
                    return false;
                };
                let min_size = self.graph.min_size_of(name);
                tree.parent(node).is_some()
                    && annot.level(node).saturating_add(min_size.depth) < self.limit.depth
                    && (root_tokens - annot.tokens(node)).saturating_add(min_size.tokens)
                        < self.limit.tokens
            })
            .collect();

        if let Some(node) = self.choose(&options) {
            let name = tree
                .kind(node)
                .name()
                .expect("candidates carry a name")
                .to_owned();
            let reserve = RuleSize::new(annot.level(node), root_tokens - annot.tokens(node));
            let replacement = self.generate(Some(&name), reserve)?;
            let mut tree = tree.clone();
            let subtree = tree.copy_from(&replacement, replacement.root());
            tree.replace(node, subtree);
            return Ok(tree);
        }

        // No node qualifies; discard the whole tree and start over.
        let root_name = tree.kind(tree.root()).name().map(str::to_owned);
        Ok(self.generate(root_name.as_deref(), RuleSize::ZERO)?)
    }

    /// Recombines two trees: a random subtree of the recipient is
    /// replaced by a same-keyed subtree of the donor, provided the result
    /// fits the limits.
    pub fn replace_node(&mut self, recipient: &Individual, donor: &Individual) -> Option<Tree> {
        let rtree = recipient.tree();
        let rannot = recipient.annotations();
        let dtree = donor.tree();
        let dannot = donor.annotations();

        let recipient_lookup = merged_buckets(rannot);
        let donor_lookup = merged_buckets(dannot);
        let root_tokens = rannot.tokens(rtree.root());

        let recipient_options: Vec<(&NodeKey, NodeId)> = recipient_lookup
            .iter()
            .filter(|(key, _)| donor_lookup.contains_key(*key))
            .flat_map(|(&key, nodes)| nodes.iter().map(move |&node| (key, node)))
            .filter(|&(_, node)| rtree.parent(node).is_some())
            .collect();

        for (key, recipient_node) in self.shuffled(recipient_options) {
            let level = rannot.level(recipient_node);
            let tokens = rannot.tokens(recipient_node);
            for donor_node in self.shuffled(donor_lookup[key].iter().copied()) {
                if level.saturating_add(dannot.depth(donor_node)) <= self.limit.depth
                    && (root_tokens - tokens).saturating_add(dannot.tokens(donor_node))
                        < self.limit.tokens
                {
                    let mut tree = rtree.clone();
                    let subtree = tree.copy_from(dtree, donor_node);
                    tree.replace(recipient_node, subtree);
                    return Some(tree);
                }
            }
        }
        None
    }

    /// Recombines two trees by adding one quantified subtree of the donor
    /// to a compatible, not-yet-full quantifier of the recipient, at a
    /// random position.
    pub fn insert_quantified(&mut self, recipient: &Individual, donor: &Individual) -> Option<Tree> {
        let rtree = recipient.tree();
        let rannot = recipient.annotations();
        let dtree = donor.tree();
        let dannot = donor.annotations();
        let root_tokens = rannot.tokens(rtree.root());

        let recipient_options: Vec<(&NodeKey, NodeId)> = rannot
            .quants_by_name
            .iter()
            .filter(|(key, _)| dannot.quants_by_name.contains_key(*key))
            .flat_map(|(key, nodes)| nodes.iter().map(move |&node| (key, node)))
            .filter(|&(_, node)| quantifier_not_full(rtree, node))
            .collect();

        for (key, recipient_node) in self.shuffled(recipient_options) {
            let level = rannot.level(recipient_node);
            let donor_options: Vec<NodeId> = dannot.quants_by_name[key]
                .iter()
                .flat_map(|&quantifier| dtree.children(quantifier).iter().copied())
                .collect();
            for donor_node in self.shuffled(donor_options) {
                if level.saturating_add(dannot.depth(donor_node)) <= self.limit.depth
                    && root_tokens.saturating_add(dannot.tokens(donor_node)) < self.limit.tokens
                {
                    let mut tree = rtree.clone();
                    let subtree = tree.copy_from(dtree, donor_node);
                    let at = self
                        .rng
                        .random_range(0..=tree.children(recipient_node).len());
                    tree.insert_child(recipient_node, at, subtree);
                    return Some(tree);
                }
            }
        }
        None
    }

    /// Detaches a random optional subtree from a quantifier that holds
    /// more children than its lower bound.
    pub fn delete_quantified(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let annot = individual.annotations();
        let options: Vec<NodeId> = annot
            .quants()
            .filter(|&node| {
                let NodeKind::Quantifier { start, .. } = tree.kind(node) else {
                    return false;
                };
                tree.children(node).len() > *start
            })
            .flat_map(|node| tree.children(node).iter().copied())
            .collect();
        let node = self.choose(&options)?;
        let mut tree = tree.clone();
        tree.detach(node);
        Some(tree)
    }

    /// Detaches a random non-root rule node without further restriction.
    /// The result may no longer conform to the grammar.
    pub fn unrestricted_delete(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let options: Vec<NodeId> = individual.annotations().rules().collect();
        let node = self.choose(&options)?;
        let mut tree = tree.clone();
        tree.detach(node);
        Some(tree)
    }

    /// Replicates a quantified subtree 1..k times, where k is bounded by
    /// the remaining token budget.
    pub fn replicate_quantified(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let annot = individual.annotations();
        let root_tokens = annot.tokens(tree.root());

        let options: Vec<NodeId> = annot
            .quants()
            .filter(|&node| quantifier_not_full(tree, node))
            .flat_map(|node| tree.children(node).iter().copied())
            .filter(|&child| {
                annot.tokens(child) > 0
                    && root_tokens.saturating_add(annot.tokens(child)) <= self.limit.tokens
            })
            .collect();
        let node = self.choose(&options)?;

        let max_repeat = if self.limit.tokens != usize::MAX {
            (self.limit.tokens - root_tokens) / annot.tokens(node)
        } else {
            1
        };
        let repeat = if max_repeat > 1 {
            self.rng.random_range(1..=max_repeat)
        } else {
            1
        };

        let mut tree = tree.clone();
        let parent = tree.parent(node).expect("quantified nodes have a parent");
        for _ in 0..repeat {
            let copy = tree.deep_copy(node);
            let at = self.rng.random_range(0..=tree.children(parent).len());
            tree.insert_child(parent, at, copy);
        }
        Some(tree)
    }

    /// Shuffles the iterations of a quantifier with at least two of them.
    pub fn shuffle_quantifieds(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let options: Vec<NodeId> = individual
            .annotations()
            .quants()
            .filter(|&node| tree.children(node).len() > 1)
            .collect();
        let node = self.choose(&options)?;
        let mut tree = tree.clone();
        let order = self.shuffled(tree.children(node).iter().copied());
        tree.reorder_children(node, order);
        Some(tree)
    }

    /// Replaces an ancestor rule by a descendant rule of the same name,
    /// shrinking the tree while keeping it grammatical.
    pub fn hoist_rule(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let rules: Vec<NodeId> = individual.annotations().rules().collect();
        for rule in self.shuffled(rules) {
            let Some(name) = tree.kind(rule).name() else {
                continue;
            };
            let mut parent = tree.parent(rule);
            while let Some(ancestor) = parent {
                if tree.kind(ancestor).name() == Some(name) {
                    let mut tree = tree.clone();
                    tree.replace(ancestor, rule);
                    return Some(tree);
                }
                parent = tree.parent(ancestor);
            }
        }
        None
    }

    /// Replaces an ancestor by a descendant without a name-compatibility
    /// check; only multi-child parser-rule ancestors with a differing
    /// token sequence qualify. The result may no longer conform to the
    /// grammar.
    pub fn unrestricted_hoist_rule(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let root = tree.root();
        let rules: Vec<NodeId> = individual.annotations().rules().collect();
        for rule in self.shuffled(rules) {
            let mut options = Vec::new();
            let mut parent = tree.parent(rule);
            while let Some(ancestor) = parent {
                if ancestor == root {
                    break;
                }
                if matches!(tree.kind(ancestor), NodeKind::UnparserRule { .. })
                    && tree.children(ancestor).len() > 1
                    && !tree.equal_tokens(rule, ancestor)
                {
                    options.push(ancestor);
                }
                parent = tree.parent(ancestor);
            }
            if let Some(ancestor) = self.choose(&options) {
                let mut tree = tree.clone();
                tree.replace(ancestor, rule);
                return Some(tree);
            }
        }
        None
    }

    /// Swaps two disjoint, same-keyed, token-differing subtrees within a
    /// single tree, provided both ends respect the depth limit.
    pub fn swap_local_nodes(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let annot = individual.annotations();
        let buckets = merged_buckets(annot);

        for (_, nodes) in self.shuffled(buckets.iter().map(|(&k, &v)| (k, v))) {
            if nodes.len() < 2 {
                continue;
            }
            let nodes = self.shuffled(nodes.iter().copied());
            for (i, &first) in nodes[..nodes.len() - 1].iter().enumerate() {
                let first_level = annot.level(first);
                let first_depth = annot.depth(first);
                for &second in &nodes[i + 1..] {
                    let second_level = annot.level(second);
                    let second_depth = annot.depth(second);
                    if first_level.saturating_add(second_depth) > self.limit.depth
                        || second_level.saturating_add(first_depth) > self.limit.depth
                    {
                        continue;
                    }
                    // Swapping identical subtrees would be a no-op.
                    if tree.equal_tokens(first, second) {
                        continue;
                    }
                    let (upper, lower) = if first_level < second_level {
                        (first, second)
                    } else {
                        (second, first)
                    };
                    if tree.has_ancestor(lower, upper) {
                        continue;
                    }
                    let mut tree = tree.clone();
                    tree.swap(first, second);
                    return Some(tree);
                }
            }
        }
        None
    }

    /// Copies a quantified subtree from one quantifier into another
    /// same-keyed quantifier of the same tree, respecting both bounds and
    /// budget.
    pub fn insert_local_node(&mut self, individual: &Individual) -> Option<Tree> {
        let tree = individual.tree();
        let annot = individual.annotations();
        let options: Vec<&[NodeId]> = annot
            .quants_by_name
            .values()
            .filter(|nodes| nodes.len() > 1)
            .map(Vec::as_slice)
            .collect();
        if options.is_empty() {
            return Some(tree.clone());
        }

        let root_tokens = annot.tokens(tree.root());
        for quantifiers in self.shuffled(options) {
            let quantifiers = self.shuffled(quantifiers.iter().copied());
            for (i, &recipient_node) in quantifiers[..quantifiers.len() - 1].iter().enumerate() {
                if !quantifier_not_full(tree, recipient_node) {
                    continue;
                }
                let level = annot.level(recipient_node);
                for &donor_quantifier in &quantifiers[i + 1..] {
                    for &donor_node in tree.children(donor_quantifier) {
                        if level.saturating_add(annot.depth(donor_node)) <= self.limit.depth
                            && root_tokens.saturating_add(annot.tokens(donor_node))
                                <= self.limit.tokens
                        {
                            let mut tree = tree.clone();
                            let copy = tree.deep_copy(donor_node);
                            let at = self
                                .rng
                                .random_range(0..=tree.children(recipient_node).len());
                            tree.insert_child(recipient_node, at, copy);
                            return Some(tree);
                        }
                    }
                }
            }
        }
        None
    }

    pub(crate) fn choose<T: Copy>(&mut self, options: &[T]) -> Option<T> {
        if options.is_empty() {
            None
        } else {
            Some(options[self.rng.random_range(0..options.len())])
        }
    }
}

/// One lookup over every structural bucket; the key kinds keep rules,
/// alternations and quantifiers apart.
fn merged_buckets(annotations: &Annotations) -> IndexMap<&NodeKey, &[NodeId]> {
    annotations
        .rules_by_name
        .iter()
        .chain(&annotations.quants_by_name)
        .chain(&annotations.alts_by_name)
        .map(|(key, nodes)| (key, nodes.as_slice()))
        .collect()
}

fn quantifier_not_full(tree: &Tree, node: NodeId) -> bool {
    match tree.kind(node) {
        NodeKind::Quantifier { stop, .. } => {
            stop.is_none_or(|stop| tree.children(node).len() < stop)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Element, Suffix};
    use crate::generator::Generator;
    use crate::graph::GrammarGraph;
    use crate::model::DefaultModel;
    use crate::testing::*;

    /// S: A+ 'end'; A: [x]; — every structural operator has something to
    /// work with: a quantifier, mutable tokens, and rule nodes.
    fn plus_grammar() -> GrammarGraph {
        compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Plus), lit("end")])),
            lexer_rule("A", seq(vec![Element::Charset { value: "x".into() }])),
        ])
    }

    fn individual(graph: &GrammarGraph, seed: u64, limit: RuleSize) -> Individual {
        let tree = Generator::new(graph)
            .with_model(Box::new(DefaultModel::with_seed(seed)))
            .with_limit(limit)
            .generate(None)
            .expect("generation succeeds");
        Individual::new(tree)
    }

    /// Builds `S ( A x ) * n` with an explicit quantifier `start=1`,
    /// `stop=3`.
    fn bounded_tree(n: usize) -> Tree {
        let mut tree = Tree::new(NodeKind::UnparserRule { name: "S".into() });
        let root = tree.root();
        let quantifier = tree.add_node(NodeKind::Quantifier {
            idx: 0,
            start: 1,
            stop: Some(3),
        });
        tree.add_child(root, quantifier);
        for _ in 0..n {
            let quantified = tree.add_node(NodeKind::Quantified);
            tree.add_child(quantifier, quantified);
            let token = tree.add_node(NodeKind::UnlexerRule {
                name: Some("A".into()),
                src: Some("x".into()),
                size: RuleSize::new(1, 1),
                immutable: false,
            });
            tree.add_child(quantified, token);
        }
        tree
    }

    #[test]
    fn delete_quantified_respects_lower_bound() {
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 20))
            .with_seed(1);
        let ind = Individual::new(bounded_tree(3));
        let mutated = tool.delete_quantified(&ind).expect("has optional children");
        assert_eq!(mutated.text(mutated.root()), "xx");

        // At the lower bound there is nothing left to delete.
        let ind = Individual::new(bounded_tree(1));
        assert!(tool.delete_quantified(&ind).is_none());
    }

    #[test]
    fn insert_quantified_honors_stop_bound() {
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 100))
            .with_seed(2);
        let donor = Individual::new(bounded_tree(3));

        // A full recipient (3 of at most 3 children) accepts nothing.
        let full = Individual::new(bounded_tree(3));
        assert!(tool.insert_quantified(&full, &donor).is_none());

        // A recipient with room grows by exactly one iteration.
        let recipient = Individual::new(bounded_tree(2));
        let grown = tool
            .insert_quantified(&recipient, &donor)
            .expect("recipient has room");
        assert_eq!(grown.text(grown.root()), "xxx");
    }

    #[test]
    fn replicate_quantified_fits_token_budget() {
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 20))
            .with_seed(3);
        let ind = Individual::new(bounded_tree(2));
        let mutated = tool.replicate_quantified(&ind).expect("budget allows copies");
        let text = mutated.text(mutated.root());
        assert!(text.len() > 2, "replication added nothing: {text:?}");
        assert!(text.chars().all(|c| c == 'x'));
        // Tokens weigh 2 each (the token and its context); the budget of
        // 20 admits at most 10.
        assert!(text.len() <= 10);
    }

    #[test]
    fn shuffle_quantifieds_keeps_the_token_multiset() {
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 100))
            .with_seed(4);
        let ind = Individual::new(bounded_tree(3));
        let mutated = tool.shuffle_quantifieds(&ind).expect("enough children");
        assert_eq!(mutated.text(mutated.root()), "xxx");
    }

    #[test]
    fn regenerate_rule_stays_in_language() {
        let graph = plus_grammar();
        let limit = RuleSize::new(10, 20);
        let mut tool = GeneratorTool::new(&graph).with_limit(limit).with_seed(5);
        for seed in 0..20 {
            let ind = individual(&graph, seed, limit);
            let mutated = tool.regenerate_rule(&ind).expect("regeneration succeeds");
            let text = mutated.text(mutated.root());
            let xs = text.strip_suffix("end").expect("ends with the literal");
            assert!(!xs.is_empty() && xs.chars().all(|c| c == 'x'), "bad {text:?}");
        }
    }

    #[test]
    fn hoist_rule_requires_same_name_ancestry() {
        // L: 'a' L | 'b';
        let graph = compile(vec![parser_rule(
            "L",
            alts(vec![vec![lit("a"), rref("L")], vec![lit("b")]]),
        )]);
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 20))
            .with_seed(6);
        // Find a seed producing a recursive derivation (some 'a's).
        let mut hoisted = None;
        for seed in 0..50 {
            let ind = individual(&graph, seed, RuleSize::new(10, 20));
            if ind.tree().text(ind.tree().root()).len() > 1 {
                hoisted = tool.hoist_rule(&ind).map(|tree| {
                    let before = ind.tree().text(ind.tree().root());
                    let after = tree.text(tree.root());
                    (before, after)
                });
                if hoisted.is_some() {
                    break;
                }
            }
        }
        let (before, after) = hoisted.expect("a recursive derivation was hoistable");
        assert!(after.len() < before.len(), "{after:?} not shorter than {before:?}");
        assert!(before.ends_with(&after));
    }

    #[test]
    fn swap_local_nodes_needs_differing_disjoint_subtrees() {
        // All tokens identical: nothing to swap.
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 100))
            .with_seed(7);
        let ind = Individual::new(bounded_tree(3));
        assert!(tool.swap_local_nodes(&ind).is_none());
    }

    #[test]
    fn unrestricted_delete_can_break_the_grammar() {
        let graph = plus_grammar();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(10, 100))
            .with_seed(8);
        let ind = Individual::new(bounded_tree(1));
        let mutated = tool.unrestricted_delete(&ind).expect("rule nodes exist");
        // The only A was removed, violating start >= 1.
        assert_eq!(mutated.text(mutated.root()), "");
    }
}
