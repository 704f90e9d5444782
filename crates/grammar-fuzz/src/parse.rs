//! Converting externally parsed inputs into derivation trees.
//!
//! Parse trees produced by a conventional parser are a plain rule
//! hierarchy: they carry no record of which alternatives were chosen or
//! how often quantifiers iterated, so they cannot participate in
//! evolution as-is. The adapter rebuilds that decision structure by
//! matching every rule node's children against the grammar graph —
//! rule-local matching suffices, because the parser already validated
//! the input.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::{GrammarGraph, Vertex, VertexId};
use crate::serializer::Transformer;
use crate::tree::{NodeId, NodeKind, RuleSize, Tree};

/// Name reserved for tokens the parser could not recognize.
pub const INVALID_TOKEN_NAME: &str = "<INVALID>";

/// The external parse tree contract: rule applications with an optional
/// alternative label, and tokens with their matched text. Hidden-channel
/// tokens appear inline among the children and are recognized by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseNode {
    Rule {
        name: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        children: Vec<ParseNode>,
    },
    Token { name: String, text: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AdaptError {
    #[error("parse tree root must be a rule application")]
    RuleRootExpected,
    #[error("unknown rule {name:?} in parse tree")]
    UnknownRule { name: String },
    #[error("children of rule {rule:?} do not match its grammar definition")]
    Mismatch { rule: String },
    #[error("parse tree depth {depth} exceeds the limit {limit}")]
    TooDeep { depth: usize, limit: usize },
    #[error("parse tree contains unrecognized tokens")]
    SyntaxErrors,
}

/// Adapter turning external parse trees into derivation trees with
/// reconstructed alternation and quantifier structure.
pub struct ParserAdapter<'g> {
    graph: &'g GrammarGraph,
    hidden: HashSet<String>,
    max_depth: usize,
    strict: bool,
    transformers: Vec<Transformer>,
}

impl std::fmt::Debug for ParserAdapter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserAdapter")
            .field("graph", &self.graph.name)
            .field("hidden", &self.hidden)
            .field("max_depth", &self.max_depth)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl<'g> ParserAdapter<'g> {
    pub fn new(graph: &'g GrammarGraph) -> Self {
        Self {
            graph,
            hidden: HashSet::new(),
            max_depth: usize::MAX,
            strict: false,
            transformers: Vec::new(),
        }
    }

    /// Names of hidden rules to keep in the tree (hidden tokens are
    /// dropped from matching and re-inserted at their original
    /// positions).
    pub fn with_hidden(mut self, hidden: impl IntoIterator<Item = String>) -> Self {
        self.hidden = hidden.into_iter().collect();
        self
    }

    /// Trees deeper than this are rejected.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// In strict mode, trees containing unrecognized tokens are rejected
    /// instead of being kept with `<INVALID>` tokens.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_transformers(mut self, transformers: Vec<Transformer>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn adapt(&self, root: &ParseNode) -> Result<Tree, AdaptError> {
        let ParseNode::Rule { name, label, children } = root else {
            return Err(AdaptError::RuleRootExpected);
        };

        let mut tree = Tree::new(NodeKind::UnparserRule { name: name.clone() });
        let mut state = BuildState::default();
        state.rules.push(tree.root());
        let mut attach_to = tree.root();
        if let Some(label) = label {
            let labeled = tree.add_node(NodeKind::UnparserRule {
                name: format!("{name}_{label}"),
            });
            tree.add_child(tree.root(), labeled);
            state.labeled.insert(labeled, name.clone());
            state.rules.push(labeled);
            attach_to = labeled;
        }
        let mut depth = 0;
        for child in children {
            depth = depth.max(self.build(&mut tree, attach_to, child, &mut state) + 1);
        }

        if depth > self.max_depth {
            return Err(AdaptError::TooDeep {
                depth,
                limit: self.max_depth,
            });
        }
        if self.strict && state.invalid > 0 {
            return Err(AdaptError::SyntaxErrors);
        }
        if state.invalid > 0 {
            warn!(count = state.invalid, "keeping a tree with unrecognized tokens");
        }

        for &rule in &state.rules {
            if tree.children(rule).is_empty() {
                continue;
            }
            self.adjust_rule(&mut tree, rule)?;
        }
        self.flatten_recurring_labels(&mut tree, &state);

        for transformer in &self.transformers {
            transformer(&mut tree);
        }
        Ok(tree)
    }

    /// Builds the skeletal tree (rules and tokens only) and returns the
    /// subtree depth.
    fn build(
        &self,
        tree: &mut Tree,
        parent: NodeId,
        node: &ParseNode,
        state: &mut BuildState,
    ) -> usize {
        match node {
            ParseNode::Rule { name, label, children } => {
                let rule = tree.add_node(NodeKind::UnparserRule { name: name.clone() });
                tree.add_child(parent, rule);
                state.rules.push(rule);
                let mut attach_to = rule;
                if let Some(label) = label {
                    // A labeled alternative gets a nested rule of its own,
                    // mirroring the context classes the parser generates.
                    let labeled = tree.add_node(NodeKind::UnparserRule {
                        name: format!("{name}_{label}"),
                    });
                    tree.add_child(rule, labeled);
                    state.labeled.insert(labeled, name.clone());
                    state.rules.push(labeled);
                    attach_to = labeled;
                }
                let mut depth = 0;
                for child in children {
                    depth = depth.max(self.build(tree, attach_to, child, state) + 1);
                }
                depth
            }
            ParseNode::Token { name, .. } if name == "EOF" => 0,
            ParseNode::Token { name, text } => {
                if name == INVALID_TOKEN_NAME {
                    state.invalid += 1;
                }
                let token = tree.add_node(NodeKind::UnlexerRule {
                    name: Some(name.clone()),
                    src: Some(text.clone()),
                    size: RuleSize::ZERO,
                    immutable: self.graph.is_immutable(name),
                });
                tree.add_child(parent, token);
                0
            }
        }
    }

    /// Matches the children of one rule node against the rule's grammar
    /// definition and rebuilds the alternative/quantifier wrappers around
    /// them.
    fn adjust_rule(&self, tree: &mut Tree, rule: NodeId) -> Result<(), AdaptError> {
        let rule_name = tree
            .kind(rule)
            .name()
            .expect("skeleton rules are named")
            .to_owned();
        let vid = self
            .graph
            .rule_by_display_name(&rule_name)
            .ok_or_else(|| AdaptError::UnknownRule {
                name: rule_name.clone(),
            })?;

        // Hidden tokens do not participate in matching; remember each one
        // together with its left neighbor for re-insertion.
        let mut tree_nodes = Vec::new();
        let mut hidden_nodes = Vec::new();
        let mut prev_child = None;
        for &child in tree.children(rule) {
            match tree.kind(child) {
                NodeKind::UnlexerRule { name: Some(name), .. } if self.hidden.contains(name) => {
                    hidden_nodes.push((child, prev_child));
                }
                _ => tree_nodes.push(child),
            }
            prev_child = Some(child);
        }

        let mut syms: Vec<Option<VertexId>> =
            self.graph.edges(vid).iter().map(|edge| Some(edge.dst)).collect();
        syms.push(None);
        let Some((children, _)) = self.match_seq(tree, &tree_nodes, &syms, 0) else {
            warn!(rule = %rule_name, "failed to match a tree node against its grammar rule");
            return Err(AdaptError::Mismatch { rule: rule_name });
        };

        for child in tree.children(rule).to_vec() {
            tree.detach(child);
        }
        reattach(tree, rule, children);

        for (hidden, prev) in hidden_nodes {
            match prev {
                None => tree.insert_child(rule, 0, hidden),
                Some(prev) => {
                    let parent = tree
                        .parent(prev)
                        .expect("matched neighbors are reattached");
                    let slot = tree
                        .children(parent)
                        .iter()
                        .position(|&c| c == prev)
                        .expect("attached node is among its parent's children");
                    tree.insert_child(parent, slot + 1, hidden);
                }
            }
        }
        Ok(())
    }

    /// Sequence matcher: consumes `nodes` left to right against the
    /// grammar symbols. A `None` symbol is the end-of-rule marker and
    /// requires full consumption. Returns the structured children and the
    /// new position.
    fn match_seq(
        &self,
        tree: &Tree,
        nodes: &[NodeId],
        syms: &[Option<VertexId>],
        mut pos: usize,
    ) -> Option<(Vec<Matched>, usize)> {
        let mut seq = Vec::new();

        for (sym_pos, sym) in syms.iter().enumerate() {
            let Some(vid) = *sym else {
                return (pos == nodes.len()).then_some((seq, pos));
            };

            match self.graph.vertex(vid) {
                Vertex::Lambda | Vertex::Action { .. } | Vertex::Variable { .. } => continue,

                Vertex::UnparserRule(rule) => {
                    let display = rule.id.display_name();
                    if pos < nodes.len()
                        && matches!(tree.kind(nodes[pos]), NodeKind::UnparserRule { .. })
                        && tree.kind(nodes[pos]).name() == Some(display.as_str())
                    {
                        seq.push(Matched::Node(nodes[pos]));
                        pos += 1;
                        continue;
                    }
                    return None;
                }

                Vertex::UnlexerRule(rule) => {
                    if pos < nodes.len() {
                        if let NodeKind::UnlexerRule { name, src, .. } = tree.kind(nodes[pos]) {
                            let display = rule.id.display_name();
                            let name_matches = name.as_deref() == Some(display.as_str());
                            // An unrecognized token still matches an
                            // interned literal with identical text.
                            let invalid_matches = name.as_deref() == Some(INVALID_TOKEN_NAME)
                                && display.starts_with("T__")
                                && src.as_deref() == self.literal_src(vid);
                            if name_matches || invalid_matches {
                                seq.push(Matched::Node(nodes[pos]));
                                pos += 1;
                                continue;
                            }
                        }
                    }
                    return None;
                }

                Vertex::Alternation(alternation) => {
                    for edge in self.graph.edges(vid) {
                        let Vertex::Alternative(alternative) = self.graph.vertex(edge.dst) else {
                            continue;
                        };
                        let mut body: Vec<VertexId> = self
                            .graph
                            .edges(edge.dst)
                            .iter()
                            .map(|edge| edge.dst)
                            .collect();
                        // A recurring labeled alternative points at an
                        // ordinal rule that has no counterpart in the
                        // parsed tree; match against its content instead.
                        if let [single] = body.as_slice() {
                            if let Vertex::UnparserRule(inner) = self.graph.vertex(*single) {
                                if inner.id.ordinal.is_some()
                                    && inner.id.display_name() == alternation.rule
                                {
                                    body = self
                                        .graph
                                        .edges(*single)
                                        .iter()
                                        .map(|edge| edge.dst)
                                        .collect();
                                }
                            }
                        }
                        let body_syms: Vec<Option<VertexId>> =
                            body.into_iter().map(Some).collect();
                        if let Some((alt_children, alt_pos)) =
                            self.match_seq(tree, nodes, &body_syms, pos)
                        {
                            if let Some((rest, rest_pos)) =
                                self.match_seq(tree, nodes, &syms[sym_pos + 1..], alt_pos)
                            {
                                seq.push(Matched::Wrapped(
                                    NodeKind::Alternative {
                                        alt_idx: alternative.alt_idx,
                                        idx: alternative.idx,
                                    },
                                    alt_children,
                                ));
                                seq.extend(rest);
                                return Some((seq, rest_pos));
                            }
                        }
                    }
                    return None;
                }

                Vertex::Quantifier(quantifier) => {
                    let body_syms: Vec<Option<VertexId>> = self
                        .graph
                        .edges(vid)
                        .iter()
                        .map(|edge| Some(edge.dst))
                        .collect();
                    let quantifier_kind = NodeKind::Quantifier {
                        idx: quantifier.idx,
                        start: quantifier.start,
                        stop: quantifier.stop,
                    };
                    let mut iterations = Vec::new();

                    for _ in 0..quantifier.start {
                        let (body, body_pos) = self.match_seq(tree, nodes, &body_syms, pos)?;
                        iterations.push(Matched::Wrapped(NodeKind::Quantified, body));
                        pos = body_pos;
                    }

                    let mut count = quantifier.start;
                    while quantifier.stop.is_none_or(|stop| count < stop) {
                        match self.match_seq(tree, nodes, &body_syms, pos) {
                            Some((body, body_pos)) => {
                                iterations.push(Matched::Wrapped(NodeKind::Quantified, body));
                                pos = body_pos;
                                count += 1;
                            }
                            None => break,
                        }
                    }

                    let (rest, rest_pos) = self.match_seq(tree, nodes, &syms[sym_pos + 1..], pos)?;
                    seq.push(Matched::Wrapped(quantifier_kind, iterations));
                    seq.extend(rest);
                    return Some((seq, rest_pos));
                }

                // Parser-rule charsets and declared-only tokens have no
                // matchable counterpart in a parsed tree.
                Vertex::Charset(_) | Vertex::Literal { .. } | Vertex::ImagRule { .. } => {
                    return None;
                }

                Vertex::Alternative(_) => {
                    unreachable!("alternatives occur only under alternations")
                }
            }
        }

        Some((seq, pos))
    }

    fn literal_src(&self, vid: VertexId) -> Option<&str> {
        self.graph.edges(vid).first().and_then(|edge| {
            match self.graph.vertex(edge.dst) {
                Vertex::Literal { src } => Some(src.as_str()),
                _ => None,
            }
        })
    }

    /// Removes the artificial nesting introduced for recurring labeled
    /// alternatives, transferring the inner decision index outward.
    fn flatten_recurring_labels(&self, tree: &mut Tree, state: &BuildState) {
        for &rule in &state.rules {
            if state.labeled.contains_key(&rule) {
                continue;
            }
            let Some(rule_name) = tree.kind(rule).name().map(str::to_owned) else {
                continue;
            };
            for child in tree.children(rule).to_vec() {
                let NodeKind::Alternative { alt_idx, .. } = *tree.kind(child) else {
                    continue;
                };
                let [grandchild] = tree.children(child) else {
                    continue;
                };
                let grandchild = *grandchild;
                if state.labeled.get(&grandchild) != Some(&rule_name) {
                    continue;
                }
                let [great] = tree.children(grandchild) else {
                    continue;
                };
                let great = *great;
                let NodeKind::Alternative {
                    alt_idx: inner_alt_idx,
                    idx: inner_idx,
                } = *tree.kind(great)
                else {
                    continue;
                };
                if alt_idx != inner_alt_idx {
                    continue;
                }
                if let NodeKind::Alternative { idx, .. } = tree.kind_mut(child) {
                    *idx = inner_idx;
                }
                let hoisted = tree.children(great).to_vec();
                tree.detach(great);
                for node in hoisted {
                    tree.detach(node);
                    tree.add_child(grandchild, node);
                }
            }
        }
    }
}

/// Result of matching: either an existing skeleton node or a structural
/// wrapper to be created around its children.
enum Matched {
    Node(NodeId),
    Wrapped(NodeKind, Vec<Matched>),
}

fn reattach(tree: &mut Tree, parent: NodeId, children: Vec<Matched>) {
    for child in children {
        match child {
            Matched::Node(node) => {
                tree.detach(node);
                tree.add_child(parent, node);
            }
            Matched::Wrapped(kind, grandchildren) => {
                let node = tree.add_node(kind);
                reattach(tree, node, grandchildren);
                tree.add_child(parent, node);
            }
        }
    }
}

#[derive(Debug, Default)]
struct BuildState {
    rules: Vec<NodeId>,
    labeled: HashMap<NodeId, String>,
    invalid: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Suffix;
    use crate::testing::*;

    fn token(name: &str, text: &str) -> ParseNode {
        ParseNode::Token {
            name: name.to_owned(),
            text: text.to_owned(),
        }
    }

    fn rule(name: &str, children: Vec<ParseNode>) -> ParseNode {
        ParseNode::Rule {
            name: name.to_owned(),
            label: None,
            children,
        }
    }

    #[test]
    fn plain_sequence_gets_no_wrappers() {
        // S: 'a' 'b'; — the parsed "a b" yields exactly two token
        // children and no alternation or quantifier wrappers.
        let graph = compile(vec![parser_rule("S", seq(vec![lit("a"), lit("b")]))]);
        let parsed = rule("S", vec![token("T__0", "a"), token("T__1", "b")]);
        let tree = ParserAdapter::new(&graph).adapt(&parsed).unwrap();
        let root = tree.root();
        assert_eq!(tree.children(root).len(), 2);
        for &child in tree.children(root) {
            assert!(matches!(tree.kind(child), NodeKind::UnlexerRule { .. }));
        }
        assert_eq!(tree.text(root), "ab");
    }

    #[test]
    fn alternation_structure_is_reconstructed() {
        // S: A | B;
        let graph = compile(vec![
            parser_rule("S", alts(vec![vec![rref("A")], vec![rref("B")]])),
            lexer_rule("B", seq(vec![lit("b")])),
            lexer_rule("A", seq(vec![lit("a")])),
        ]);
        let parsed = rule("S", vec![token("B", "b")]);
        let tree = ParserAdapter::new(&graph).adapt(&parsed).unwrap();
        let alternative = tree.children(tree.root())[0];
        let NodeKind::Alternative { alt_idx, idx } = *tree.kind(alternative) else {
            panic!("expected an alternative wrapper");
        };
        assert_eq!((alt_idx, idx), (0, 1));
        assert_eq!(tree.text(tree.root()), "b");
    }

    #[test]
    fn quantifier_structure_is_reconstructed() {
        // S: A+ 'end'; A: 'x';
        let graph = compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Plus), lit("end")])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        let parsed = rule(
            "S",
            vec![
                token("A", "x"),
                token("A", "x"),
                token("A", "x"),
                token("T__0", "end"),
            ],
        );
        let tree = ParserAdapter::new(&graph).adapt(&parsed).unwrap();
        let quantifier = tree.children(tree.root())[0];
        let NodeKind::Quantifier { start, stop, .. } = *tree.kind(quantifier) else {
            panic!("expected a quantifier wrapper");
        };
        assert_eq!((start, stop), (1, None));
        assert_eq!(tree.children(quantifier).len(), 3);
        for &quantified in tree.children(quantifier) {
            assert!(matches!(tree.kind(quantified), NodeKind::Quantified));
        }
        assert_eq!(tree.text(tree.root()), "xxxend");
    }

    #[test]
    fn hidden_tokens_are_reinserted() {
        let graph = compile(vec![
            parser_rule("S", seq(vec![rref("A"), rref("A")])),
            lexer_rule("A", seq(vec![lit("a")])),
            lexer_rule("WS", seq(vec![lit(" ")])),
        ]);
        let parsed = rule(
            "S",
            vec![token("A", "a"), token("WS", " "), token("A", "a")],
        );
        let tree = ParserAdapter::new(&graph)
            .with_hidden(["WS".to_owned()])
            .adapt(&parsed)
            .unwrap();
        assert_eq!(tree.text(tree.root()), "a a");
    }

    #[test]
    fn mismatching_trees_are_rejected() {
        let graph = compile(vec![parser_rule("S", seq(vec![lit("a")]))]);
        let parsed = rule("S", vec![token("T__0", "a"), token("T__0", "a")]);
        assert!(matches!(
            ParserAdapter::new(&graph).adapt(&parsed),
            Err(AdaptError::Mismatch { .. })
        ));
    }

    #[test]
    fn strict_mode_rejects_invalid_tokens() {
        let graph = compile(vec![parser_rule("S", seq(vec![lit("a")]))]);
        let parsed = rule("S", vec![token(INVALID_TOKEN_NAME, "a")]);
        assert!(matches!(
            ParserAdapter::new(&graph).with_strict(true).adapt(&parsed),
            Err(AdaptError::SyntaxErrors)
        ));
        // Non-strict mode accepts the tree: the invalid token still
        // matches the interned literal by text.
        let tree = ParserAdapter::new(&graph).adapt(&parsed).unwrap();
        assert_eq!(tree.text(tree.root()), "a");
    }

    #[test]
    fn depth_gate_rejects_deep_trees() {
        let graph = compile(vec![parser_rule("S", seq(vec![lit("a")]))]);
        let parsed = rule("S", vec![rule("S", vec![token("T__0", "a")])]);
        assert!(matches!(
            ParserAdapter::new(&graph).with_max_depth(1).adapt(&parsed),
            Err(AdaptError::TooDeep { .. })
        ));
    }

    #[test]
    fn adapted_trees_support_mutation_lookups() {
        // The reconstructed wrappers land in the annotation buckets under
        // the same keys generation produces.
        use crate::annotations::NodeKey;
        use crate::population::Individual;

        let graph = compile(vec![
            parser_rule("S", seq(vec![quant(rref("A"), Suffix::Star), lit("end")])),
            lexer_rule("A", seq(vec![lit("x")])),
        ]);
        let parsed = rule("S", vec![token("A", "x"), token("T__0", "end")]);
        let tree = ParserAdapter::new(&graph).adapt(&parsed).unwrap();
        let individual = Individual::new(tree);
        assert!(
            individual
                .annotations()
                .quants_by_name
                .contains_key(&NodeKey::Quant("S".into(), 0))
        );
    }
}
