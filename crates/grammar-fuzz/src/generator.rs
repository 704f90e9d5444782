//! The generation runtime.
//!
//! [`Generator`] walks the grammar graph and grows a derivation tree,
//! keeping a mutable *current* size (depth, tokens) against a limit,
//! consulting the decision model at alternations, quantifiers and
//! charsets, and notifying listeners on rule entry and exit. Emitted
//! per-rule procedures drive exactly the same bookkeeping; the interpreter
//! here is the in-process rendition of that contract.
//!
//! Bookkeeping per construct:
//!
//! - entering a rule increments the current depth, exiting decrements it;
//!   token rules additionally count one token and track their own subtree
//!   size;
//! - descending into an edge adds the edge's `reserve` (the minimum token
//!   cost of the right siblings) to the current token count for the
//!   duration of the descent;
//! - an alternation masks the weight of every alternative that no longer
//!   fits the limit; if nothing fits, the limit is temporarily raised to
//!   the cheapest viable alternative's requirement (the depth component is
//!   restored on exit, the token component keeps the relaxation);
//! - a quantifier iterates unconditionally up to `start`, then keeps
//!   iterating only while the body's minimum size still fits and the model
//!   agrees.

use tracing::{debug, warn};

use crate::graph::{Conditions, GrammarGraph, Vertex, VertexId};
use crate::listener::Listener;
use crate::model::{DefaultModel, Model};
use crate::tree::{NodeId, NodeKind, RuleSize, Tree};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("unknown rule {name:?}")]
    UnknownRule { name: String },
    #[error("minimum depth of rule {rule:?} ({min_depth}) exceeds the depth limit ({limit})")]
    Capacity {
        rule: String,
        min_depth: usize,
        limit: usize,
    },
    #[error("no viable alternative in rule {rule:?}")]
    NoViableAlternative { rule: String },
}

/// Callback evaluating a symbolic semantic predicate to a weight.
pub type PredicateEvaluator = Box<dyn Fn(&str) -> f64>;

/// Graph-walking generator of random derivation trees.
pub struct Generator<'g> {
    graph: &'g GrammarGraph,
    model: Box<dyn Model>,
    listeners: Vec<Box<dyn Listener>>,
    predicates: Option<PredicateEvaluator>,
    base_limit: RuleSize,
    limit: RuleSize,
    size: RuleSize,
    predicate_warned: bool,
}

/// Rule scope the walker currently operates in: the name decisions are
/// attributed to, and whether tree nodes for decisions are suppressed
/// (inside token rules the derivation is textual only).
struct Frame {
    name: String,
    lexer: bool,
}

impl std::fmt::Debug for Generator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("graph", &self.graph.name)
            .field("limit", &self.base_limit)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl<'g> Generator<'g> {
    pub fn new(graph: &'g GrammarGraph) -> Self {
        Self {
            graph,
            model: Box::new(DefaultModel::new()),
            listeners: Vec::new(),
            predicates: None,
            base_limit: RuleSize::MAX,
            limit: RuleSize::MAX,
            size: RuleSize::ZERO,
            predicate_warned: false,
        }
    }

    pub fn with_model(mut self, model: Box<dyn Model>) -> Self {
        self.model = model;
        self
    }

    pub fn with_listener(mut self, listener: Box<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the limit on the depth and token count of generated trees.
    pub fn with_limit(mut self, limit: RuleSize) -> Self {
        self.base_limit = limit;
        self
    }

    /// Installs the evaluator for symbolic semantic predicates. Without
    /// one, non-numeric predicates weigh 1 and a warning is logged once.
    pub fn with_predicates(mut self, evaluator: PredicateEvaluator) -> Self {
        self.predicates = Some(evaluator);
        self
    }

    /// Generates a fresh tree from `rule` (default: the graph's default
    /// rule).
    pub fn generate(&mut self, rule: Option<&str>) -> Result<Tree, GenerationError> {
        let name = rule.unwrap_or(&self.graph.default_rule);
        let vid = self
            .graph
            .rule_by_display_name(name)
            .ok_or_else(|| GenerationError::UnknownRule {
                name: name.to_owned(),
            })?;
        let rule_vertex =
            self.graph
                .vertex(vid)
                .as_rule()
                .ok_or_else(|| GenerationError::UnknownRule {
                    name: name.to_owned(),
                })?;
        let display = rule_vertex.id.display_name();
        if rule_vertex.min_size.depth > self.base_limit.depth {
            return Err(GenerationError::Capacity {
                rule: display,
                min_depth: rule_vertex.min_size.depth,
                limit: self.base_limit.depth,
            });
        }

        self.size = RuleSize::ZERO;
        self.limit = self.base_limit;

        let lexer = self.graph.vertex(vid).is_lexer_rule();
        let mut tree = if lexer {
            Tree::new(NodeKind::UnlexerRule {
                name: Some(display.clone()),
                src: None,
                size: RuleSize::ZERO,
                immutable: self.graph.is_immutable(&display),
            })
        } else {
            Tree::new(NodeKind::UnparserRule {
                name: display.clone(),
            })
        };
        let root = tree.root();
        if lexer {
            self.run_unlexer(vid, &mut tree, root, &display, true)?;
        } else {
            self.run_unparser(vid, &mut tree, root, &display)?;
        }
        Ok(tree)
    }

    fn run_unparser(
        &mut self,
        vid: VertexId,
        tree: &mut Tree,
        node: NodeId,
        display: &str,
    ) -> Result<(), GenerationError> {
        self.size.depth += 1;
        self.enter_rule(tree, node);
        let frame = Frame {
            name: display.to_owned(),
            lexer: false,
        };
        self.gen_children(vid, tree, node, &frame)?;
        self.exit_rule(tree, node);
        self.size.depth -= 1;
        Ok(())
    }

    /// Generates the body of a token rule into `token`. An inner (sub-)
    /// rule reuses the same token node, renamed for the duration of the
    /// scope; only the outermost scope normalizes the token's recorded
    /// subtree depth.
    fn run_unlexer(
        &mut self,
        vid: VertexId,
        tree: &mut Tree,
        token: NodeId,
        display: &str,
        outer: bool,
    ) -> Result<(), GenerationError> {
        let saved_name = if outer {
            None
        } else {
            let NodeKind::UnlexerRule { name, .. } = tree.kind_mut(token) else {
                unreachable!("token scope points at a token node");
            };
            let saved = name.take();
            *name = Some(display.to_owned());
            Some(saved)
        };
        let start_depth = outer.then_some(self.size.depth);

        self.size.depth += 1;
        self.enter_rule(tree, token);
        self.size.tokens += 1;
        if let NodeKind::UnlexerRule { size, .. } = tree.kind_mut(token) {
            size.tokens += 1;
            size.depth = size.depth.max(self.size.depth);
        }

        let frame = Frame {
            name: display.to_owned(),
            lexer: true,
        };
        self.gen_children(vid, tree, token, &frame)?;

        self.exit_rule(tree, token);
        self.size.depth -= 1;
        if let Some(start) = start_depth {
            if let NodeKind::UnlexerRule { size, .. } = tree.kind_mut(token) {
                size.depth -= start;
            }
        }
        if let Some(saved) = saved_name {
            if let NodeKind::UnlexerRule { name, .. } = tree.kind_mut(token) {
                *name = saved;
            }
        }
        Ok(())
    }

    fn gen_children(
        &mut self,
        vid: VertexId,
        tree: &mut Tree,
        cur: NodeId,
        frame: &Frame,
    ) -> Result<(), GenerationError> {
        let graph = self.graph;
        for edge in graph.edges(vid) {
            let reserve = edge.reserve;
            match graph.vertex(edge.dst) {
                Vertex::UnparserRule(rule) => {
                    let display = rule.id.display_name();
                    self.size.tokens = self.size.tokens.saturating_add(reserve);
                    let node = tree.add_node(NodeKind::UnparserRule {
                        name: display.clone(),
                    });
                    tree.add_child(cur, node);
                    self.run_unparser(edge.dst, tree, node, &display)?;
                    self.size.tokens = self.size.tokens.saturating_sub(reserve);
                }

                Vertex::UnlexerRule(rule) => {
                    let display = rule.id.display_name();
                    self.size.tokens = self.size.tokens.saturating_add(reserve);
                    if frame.lexer {
                        self.run_unlexer(edge.dst, tree, cur, &display, false)?;
                    } else {
                        let node = tree.add_node(NodeKind::UnlexerRule {
                            name: Some(display.clone()),
                            src: None,
                            size: RuleSize::ZERO,
                            immutable: self.graph.is_immutable(&display),
                        });
                        tree.add_child(cur, node);
                        self.run_unlexer(edge.dst, tree, node, &display, true)?;
                    }
                    self.size.tokens = self.size.tokens.saturating_sub(reserve);
                }

                Vertex::ImagRule { name } => {
                    debug!(token = %name, "skipping imaginary token without a rule body");
                }

                Vertex::Literal { src } => {
                    let chunk = tree.add_node(NodeKind::token(src.clone()));
                    tree.add_child(cur, chunk);
                }

                Vertex::Charset(charset) => {
                    let picked = self.model.charset(
                        &frame.name,
                        charset.idx,
                        &graph.charsets[charset.charset],
                    );
                    let chunk = tree.add_node(NodeKind::token(picked.to_string()));
                    tree.add_child(cur, chunk);
                }

                Vertex::Alternation(_) => {
                    self.run_alternation(edge.dst, tree, cur, frame, reserve)?;
                }

                Vertex::Quantifier(_) => {
                    self.run_quantifier(edge.dst, tree, cur, frame, reserve)?;
                }

                Vertex::Lambda
                | Vertex::Action { .. }
                | Vertex::Variable { .. }
                | Vertex::Alternative(_) => {}
            }
        }
        Ok(())
    }

    fn run_alternation(
        &mut self,
        vid: VertexId,
        tree: &mut Tree,
        cur: NodeId,
        frame: &Frame,
        reserve: usize,
    ) -> Result<(), GenerationError> {
        let graph = self.graph;
        let Vertex::Alternation(alt) = graph.vertex(vid) else {
            unreachable!("alternation arm matches alternation vertices");
        };

        self.size.tokens = self.size.tokens.saturating_add(reserve);
        let orig_depth_limit = self.limit.depth;

        let conditions = self.eval_conditions(&alt.conditions);
        let min_sizes = &graph.alt_sizes[alt.min_sizes];
        let mask = |size: RuleSize, limit: RuleSize| -> Vec<f64> {
            conditions
                .iter()
                .enumerate()
                .map(|(i, &w)| if size + min_sizes[i] <= limit { w } else { 0.0 })
                .collect()
        };

        let mut weights = mask(self.size, self.limit);
        if weights.iter().sum::<f64>() == 0.0 {
            // Nothing fits. Find the alternative with the smallest demand
            // among those whose condition holds, and raise the limit to the
            // minimum needed to finish the derivation.
            let min_size = conditions
                .iter()
                .enumerate()
                .filter(|&(_, &w)| w > 0.0)
                .map(|(i, _)| min_sizes[i])
                .min_by_key(|s| (s.depth, s.tokens))
                .ok_or_else(|| GenerationError::NoViableAlternative {
                    rule: frame.name.clone(),
                })?;
            let new_limit = self.size + min_size;
            if new_limit.depth > self.limit.depth {
                debug!(
                    from = self.limit.depth,
                    to = new_limit.depth,
                    "temporarily raising the depth limit"
                );
                self.limit.depth = new_limit.depth;
            }
            if new_limit.tokens > self.limit.tokens {
                debug!(
                    from = self.limit.tokens,
                    to = new_limit.tokens,
                    "raising the token limit"
                );
                self.limit.tokens = new_limit.tokens;
            }
            weights = mask(self.size, self.limit);
        }

        let choice = self.model.choice(&frame.name, alt.idx, &weights);
        let branch_cur = if frame.lexer {
            cur
        } else {
            let node = tree.add_node(NodeKind::Alternative {
                alt_idx: alt.idx,
                idx: choice,
            });
            tree.add_child(cur, node);
            node
        };
        let branch = graph.edges(vid)[choice].dst;
        self.gen_children(branch, tree, branch_cur, frame)?;

        self.limit.depth = orig_depth_limit;
        self.size.tokens = self.size.tokens.saturating_sub(reserve);
        Ok(())
    }

    fn run_quantifier(
        &mut self,
        vid: VertexId,
        tree: &mut Tree,
        cur: NodeId,
        frame: &Frame,
        reserve: usize,
    ) -> Result<(), GenerationError> {
        let graph = self.graph;
        let Vertex::Quantifier(quant) = graph.vertex(vid) else {
            unreachable!("quantifier arm matches quantifier vertices");
        };

        self.size.tokens = self.size.tokens.saturating_add(reserve);
        let qcur = if frame.lexer {
            cur
        } else {
            let node = tree.add_node(NodeKind::Quantifier {
                idx: quant.idx,
                start: quant.start,
                stop: quant.stop,
            });
            tree.add_child(cur, node);
            node
        };

        let min_size = graph.quant_sizes[quant.min_size];
        let mut cnt = 0;
        loop {
            let proceed = cnt < quant.start
                || (quant.stop.is_none_or(|stop| cnt < stop)
                    && self.size + min_size <= self.limit
                    && self
                        .model
                        .quantify(&frame.name, quant.idx, cnt, quant.start, quant.stop));
            if !proceed {
                break;
            }
            cnt += 1;
            let body_cur = if frame.lexer {
                qcur
            } else {
                let node = tree.add_node(NodeKind::Quantified);
                tree.add_child(qcur, node);
                node
            };
            self.gen_children(vid, tree, body_cur, frame)?;
        }

        self.size.tokens = self.size.tokens.saturating_sub(reserve);
        Ok(())
    }

    fn eval_conditions(&mut self, conditions: &Conditions) -> Vec<f64> {
        match conditions {
            Conditions::Weights(idx) => self.graph.alt_conds[*idx].clone(),
            Conditions::Predicates(predicates) => predicates
                .iter()
                .map(|predicate| {
                    if let Ok(weight) = predicate.trim().parse::<f64>() {
                        weight
                    } else if let Some(evaluator) = &self.predicates {
                        evaluator(predicate)
                    } else {
                        if !self.predicate_warned {
                            warn!(
                                predicate,
                                "no predicate evaluator installed; symbolic predicates weigh 1"
                            );
                            self.predicate_warned = true;
                        }
                        1.0
                    }
                })
                .collect(),
        }
    }

    fn enter_rule(&mut self, tree: &Tree, node: NodeId) {
        for listener in &mut self.listeners {
            listener.enter_rule(tree, node);
        }
    }

    fn exit_rule(&mut self, tree: &Tree, node: NodeId) {
        for listener in self.listeners.iter_mut().rev() {
            listener.exit_rule(tree, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Element, Suffix};
    use crate::model::DefaultModel;
    use crate::testing::*;

    fn generate_text(graph: &GrammarGraph, limit: RuleSize, seed: u64) -> String {
        let mut generator = Generator::new(graph)
            .with_model(Box::new(DefaultModel::with_seed(seed)))
            .with_limit(limit);
        let tree = generator.generate(None).expect("generation succeeds");
        tree.text(tree.root())
    }

    #[test]
    fn alternation_produces_only_declared_literals() {
        // S: 'a' | 'b';
        let graph = compile(vec![parser_rule(
            "S",
            alts(vec![vec![lit("a")], vec![lit("b")]]),
        )]);
        for seed in 0..100 {
            let text = generate_text(&graph, RuleSize::new(5, 5), seed);
            assert!(text == "a" || text == "b", "unexpected output {text:?}");
        }
    }

    #[test]
    fn plus_quantifier_yields_at_least_one_iteration() {
        // S: A+; A: 'x';
        let graph = compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Plus)])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        for seed in 0..50 {
            let text = generate_text(&graph, RuleSize::new(10, 10), seed);
            assert!(!text.is_empty());
            assert!(text.chars().all(|c| c == 'x'), "unexpected output {text:?}");
            assert!(text.len() <= 10);
        }
    }

    #[test]
    fn depth_limit_bounds_recursion() {
        // L: 'a' L | ; — with a depth limit of 3 at most two 'a's fit.
        let graph = compile(vec![parser_rule(
            "L",
            alts(vec![vec![lit("a"), rref("L")], vec![]]),
        )]);
        for seed in 0..100 {
            let text = generate_text(&graph, RuleSize::new(3, 100), seed);
            assert!(text.len() <= 2, "too deep: {text:?}");
        }
    }

    #[test]
    fn alternation_records_decision_on_tree() {
        let graph = compile(vec![parser_rule(
            "S",
            alts(vec![vec![lit("a")], vec![lit("b")]]),
        )]);
        let mut generator = Generator::new(&graph)
            .with_model(Box::new(DefaultModel::with_seed(0)))
            .with_limit(RuleSize::new(5, 5));
        let tree = generator.generate(None).unwrap();
        let alternative = tree.children(tree.root())[0];
        let NodeKind::Alternative { alt_idx, idx } = *tree.kind(alternative) else {
            panic!("expected an alternative node under the rule");
        };
        assert_eq!(alt_idx, 0);
        let expected = if tree.text(tree.root()) == "a" { 0 } else { 1 };
        assert_eq!(idx, expected);
    }

    #[test]
    fn quantifier_children_are_quantified_nodes() {
        let graph = compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Star)])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        let mut generator = Generator::new(&graph)
            .with_model(Box::new(DefaultModel::with_seed(11)))
            .with_limit(RuleSize::new(10, 5));
        let tree = generator.generate(None).unwrap();
        let quantifier = tree.children(tree.root())[0];
        let NodeKind::Quantifier { start, stop, .. } = *tree.kind(quantifier) else {
            panic!("expected a quantifier node under the rule");
        };
        assert_eq!((start, stop), (0, None));
        for &child in tree.children(quantifier) {
            assert!(matches!(tree.kind(child), NodeKind::Quantified));
        }
    }

    #[test]
    fn token_rules_track_their_size() {
        // Token with a nested sub-token: B: A A; A: 'x';
        let graph = compile(vec![
            parser_rule("S", seq(vec![rref("B")])),
            lexer_rule("B", seq(vec![rref("A"), rref("A")])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        let mut generator = Generator::new(&graph)
            .with_model(Box::new(DefaultModel::with_seed(2)))
            .with_limit(RuleSize::new(10, 10));
        let tree = generator.generate(None).unwrap();
        let token = tree.children(tree.root())[0];
        let NodeKind::UnlexerRule { size, name, .. } = tree.kind(token) else {
            panic!("expected a token under S");
        };
        assert_eq!(name.as_deref(), Some("B"));
        // One context for B itself plus one per sub-rule entry.
        assert_eq!(size.tokens, 3);
        assert_eq!(tree.text(token), "xx");
    }

    #[test]
    fn capacity_error_when_rule_cannot_fit() {
        let graph = compile(vec![
            parser_rule("S", seq(vec![rref("A"), rref("A")])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        let mut generator = Generator::new(&graph).with_limit(RuleSize::new(1, 100));
        let result = generator.generate(None);
        assert!(matches!(result, Err(GenerationError::Capacity { .. })));
    }

    #[test]
    fn unsatisfiable_alternation_relaxes_the_limit() {
        // S: A; A: 'x' 'y' 'z' | 'x'; with a token limit of 0 every
        // alternative is masked; the cheaper one is enabled by relaxation.
        let graph = compile(vec![
            parser_rule("S", seq(vec![rref("A")])),
            parser_rule("A", alts(vec![vec![lit("x"), lit("y"), lit("z")], vec![lit("x")]])),
        ]);
        for seed in 0..20 {
            let mut generator = Generator::new(&graph)
                .with_model(Box::new(DefaultModel::with_seed(seed)))
                .with_limit(RuleSize::new(100, 0));
            let tree = generator.generate(None).unwrap();
            assert_eq!(tree.text(tree.root()), "x");
        }
    }

    #[test]
    fn charsets_generate_members() {
        let graph = compile(vec![
            parser_rule("S", seq(vec![rref("D")])),
            lexer_rule("D", seq(vec![Element::Charset { value: "0-9".into() }])),
        ]);
        for seed in 0..30 {
            let text = generate_text(&graph, RuleSize::new(5, 5), seed);
            assert_eq!(text.len(), 1);
            assert!(text.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
