//! Folds a parsed grammar into a [`GrammarGraph`].
//!
//! The traversal is largely mechanical; the interesting parts are literal
//! interning (string literals in parser rules become implicit lexer rules,
//! shared by text), recurring-label synthesis, wildcard resolution, escape
//! decoding, and charset canonicalization.

pub mod ast;

mod args;
mod escapes;

use std::collections::HashMap;

use indexmap::IndexMap;

use self::args::{ArgUseCase, parse_arg_action_block};
use self::ast::{Alternation, Alternative, Element, GrammarAst, RuleKind, RuleSpec, Suffix};
use self::escapes::{charset_intervals, dot_ranges, multirange_diff, range_interval, set_literal, unescape_string};
use crate::graph::{
    AlternationVertex, AlternativeVertex, CallArg, Charset, CharsetVertex, Conditions,
    GrammarGraph, QuantifierVertex, RuleId, RuleVertex, Vertex, VertexId, append_unique,
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("rule redefinition(s): {rules}")]
    DuplicateRules { rules: String },
    #[error("reference to unknown rule {name:?}")]
    UnknownRule { name: String },
    #[error("invalid escape in {src:?}: {message}")]
    InvalidEscape { src: String, message: String },
    #[error("charset must not be empty ({src:?})")]
    EmptyCharset { src: String },
    #[error("charset range must not be empty: U+{start:04X}..U+{end:04X}")]
    EmptyRange { start: u32, end: u32 },
    #[error("unknown unicode property {name:?}")]
    UnknownProperty { name: String },
    #[error("unknown dot policy {policy:?}")]
    UnknownDotPolicy { policy: String },
    #[error("invalid argument action block: {message}")]
    ArgBlock { message: String },
    #[error("rule {rule:?} labels only some of its alternatives")]
    MixedLabels { rule: String },
    #[error("charset in parser rule {rule:?}")]
    MisplacedCharset { rule: String },
    #[error("token reference {name:?} in a set does not refer to a lexer rule")]
    InvalidSetReference { name: String },
}

/// Grammar-to-graph compiler. Construct, configure, then call
/// [`Compiler::compile`] with the lexer (or combined) and parser grammar
/// ASTs.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: IndexMap<String, String>,
    default_rule: Option<String>,
    skip_actions: bool,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides or extends the options set in the grammar (e.g. `dot`).
    pub fn with_options(mut self, options: IndexMap<String, String>) -> Self {
        self.options = options;
        self
    }

    /// Names the rule generation starts from (default: the first rule of
    /// the parser or combined grammar).
    pub fn with_default_rule(mut self, rule: impl Into<String>) -> Self {
        self.default_rule = Some(rule.into());
        self
    }

    /// Disables inline actions and semantic predicates: no action vertices
    /// are built and every alternative weighs 1.
    pub fn without_actions(mut self) -> Self {
        self.skip_actions = true;
        self
    }

    pub fn compile(
        &self,
        lexer: Option<&GrammarAst>,
        parser: Option<&GrammarAst>,
    ) -> Result<GrammarGraph, CompileError> {
        let mut graph = GrammarGraph::new();
        let lambda = graph.add_vertex(Vertex::Lambda);

        for ast in [lexer, parser].into_iter().flatten() {
            Self::build_prequel(&mut graph, ast, !self.skip_actions);
        }
        graph.options.extend(self.options.clone());

        let mut builder = Builder {
            graph,
            actions: !self.skip_actions,
            lambda,
            dot_base: Vec::new(),
            dot_charset: 0,
            literal_lookup: HashMap::new(),
            lit_cnt: 0,
            alt_idx: HashMap::new(),
            quant_idx: HashMap::new(),
            chr_idx: HashMap::new(),
        };
        let dot_base = dot_ranges(builder.graph.dot())?;
        builder.dot_charset = builder.unique_charset(dot_base)?;
        builder.dot_base = builder.graph.charsets[builder.dot_charset].ranges().to_vec();

        // Register every rule vertex up front so references resolve
        // regardless of definition order, then build the bodies with lexer
        // rules first (parser literals look up tokens by text).
        let mut pending: Vec<(VertexId, &RuleSpec)> = Vec::new();
        let mut duplicates: Vec<String> = Vec::new();
        for ast in [lexer, parser].into_iter().flatten() {
            for spec in &ast.rules {
                let id = RuleId::plain(spec.name.as_str());
                if builder.graph.rule(&id).is_some() {
                    duplicates.push(spec.name.clone());
                    continue;
                }
                let vertex = RuleVertex::new(id);
                let vid = builder.graph.add_vertex(match spec.kind {
                    RuleKind::Lexer => Vertex::UnlexerRule(vertex),
                    RuleKind::Parser => Vertex::UnparserRule(vertex),
                });
                pending.push((vid, spec));
            }
            if let Some(rule) = &self.default_rule {
                builder.graph.default_rule = rule.clone();
            } else if ast.kind != ast::GrammarKind::Lexer {
                if let Some(first) = ast.rules.first() {
                    builder.graph.default_rule = first.name.clone();
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(CompileError::DuplicateRules {
                rules: duplicates.join(", "),
            });
        }

        pending.sort_by_key(|(_, spec)| spec.kind == RuleKind::Parser);
        for (vid, spec) in pending {
            builder.build_rule(vid, spec)?;
        }

        let mut graph = builder.graph;
        graph.calc_min_sizes();
        graph.find_immutable_rules();
        Ok(graph)
    }

    fn build_prequel(graph: &mut GrammarGraph, ast: &GrammarAst, actions: bool) {
        if graph.name.is_empty() {
            let base = ast
                .name
                .strip_suffix("Lexer")
                .or_else(|| ast.name.strip_suffix("Parser"))
                .unwrap_or(&ast.name);
            graph.name = format!("{base}Generator");
        }
        for (key, value) in &ast.options {
            graph.options.insert(key.clone(), value.clone());
        }
        for token in &ast.tokens {
            graph.add_vertex(Vertex::ImagRule {
                name: token.clone(),
            });
        }
        if actions {
            for action in &ast.actions {
                // Members and header chunks are appended verbatim; defining
                // them in a sensible order is the grammar author's business.
                match action.name.as_str() {
                    "members" => graph.members.push_str(&action.code),
                    "header" => graph.header.push_str(&action.code),
                    _ => {}
                }
            }
        }
    }
}

/// Per-rule context threaded through the body traversal.
#[derive(Debug, Clone)]
struct RuleCtx {
    vid: VertexId,
    /// Display name of the rule under construction; decision indices are
    /// numbered per display name.
    name: String,
    lexer: bool,
}

struct Builder {
    graph: GrammarGraph,
    actions: bool,
    lambda: VertexId,
    /// Canonical ranges of the wildcard charset; the universe negated sets
    /// subtract from.
    dot_base: Vec<(u32, u32)>,
    dot_charset: usize,
    /// Literal text to the lexer rule (explicit or synthesized) deriving
    /// exactly that text.
    literal_lookup: HashMap<String, VertexId>,
    lit_cnt: usize,
    alt_idx: HashMap<String, usize>,
    quant_idx: HashMap<String, usize>,
    chr_idx: HashMap<String, usize>,
}

impl Builder {
    fn build_rule(&mut self, vid: VertexId, spec: &RuleSpec) -> Result<(), CompileError> {
        let ctx = RuleCtx {
            vid,
            name: spec.name.clone(),
            lexer: spec.kind == RuleKind::Lexer,
        };

        if self.actions && !ctx.lexer {
            let parse = |block: &Option<String>,
                         use_case: ArgUseCase|
             -> Result<Vec<CallArg>, CompileError> {
                block
                    .as_deref()
                    .map(|src| parse_arg_action_block(src, use_case))
                    .transpose()
                    .map(Option::unwrap_or_default)
            };
            let args = parse(&spec.args, ArgUseCase::Args)?;
            let locals = parse(&spec.locals, ArgUseCase::Locals)?;
            let returns = parse(&spec.returns, ArgUseCase::Returns)?;
            let rule = self.rule_mut(vid);
            rule.args = args;
            rule.locals = locals;
            rule.returns = returns;
            rule.init = spec.init.clone().unwrap_or_default();
            rule.after = spec.after.clone().unwrap_or_default();
        }

        self.build_alternation(vid, &spec.block, &ctx, true)?;

        // A lexer rule deriving a single constant literal doubles as the
        // interned token for that text in parser rules.
        if ctx.lexer && self.graph.edges(vid).len() == 1 {
            let dst = self.graph.edges(vid)[0].dst;
            if let Vertex::Literal { src } = self.graph.vertex(dst) {
                self.literal_lookup.entry(src.clone()).or_insert(vid);
            }
        }
        Ok(())
    }

    fn build_alternation(
        &mut self,
        parent: VertexId,
        node: &Alternation,
        ctx: &RuleCtx,
        rule_block: bool,
    ) -> Result<(), CompileError> {
        if let [single] = node.alternatives.as_slice() {
            return self.build_alternative(parent, single, ctx);
        }

        let conditions: Vec<String> = node
            .alternatives
            .iter()
            .map(|alt| self.effective_guard(alt))
            .collect();

        let labels: Vec<String> = if rule_block && !ctx.lexer {
            let labeled: Vec<&String> = node
                .alternatives
                .iter()
                .filter_map(|alt| alt.label.as_ref())
                .collect();
            if labeled.is_empty() {
                Vec::new()
            } else if labeled.len() != node.alternatives.len() {
                return Err(CompileError::MixedLabels {
                    rule: ctx.name.clone(),
                });
            } else {
                // ANTLR capitalizes alternative labels for the generated
                // contexts; parsed trees are matched against that spelling.
                labeled.into_iter().map(|label| capitalize(label)).collect()
            }
        } else {
            Vec::new()
        };
        let recurring: Vec<String> = labels
            .iter()
            .filter(|label| labels.iter().filter(|other| other == label).count() > 1)
            .fold(Vec::new(), |mut acc, label| {
                if !acc.contains(label) {
                    acc.push(label.clone());
                }
                acc
            });

        let idx = next_index(&mut self.alt_idx, &ctx.name);
        let alt_conditions = self.make_conditions(&conditions);
        let alt_id = self.graph.add_vertex(Vertex::Alternation(AlternationVertex {
            rule: ctx.name.clone(),
            idx,
            conditions: alt_conditions,
            min_sizes: 0,
        }));
        self.graph.add_edge(parent, alt_id, None);

        for (i, alternative) in node.alternatives.iter().enumerate() {
            let alternative_id = self
                .graph
                .add_vertex(Vertex::Alternative(AlternativeVertex {
                    rule: ctx.name.clone(),
                    alt_idx: idx,
                    idx: i,
                }));
            self.graph.add_edge(alt_id, alternative_id, None);

            if labels.is_empty() {
                self.build_alternative(alternative_id, alternative, ctx)?;
                continue;
            }

            // Labeled alternatives become rules of their own; recurring
            // labels additionally carry an ordinal to keep their identities
            // apart.
            let label = &labels[i];
            let rule_id = if recurring.contains(label) {
                let ordinal = labels[..=i].iter().filter(|l| *l == label).count() - 1;
                RuleId::with_ordinal(ctx.name.as_str(), label.as_str(), ordinal)
            } else {
                RuleId::labeled(ctx.name.as_str(), label.as_str())
            };
            let display = rule_id.display_name();
            let labeled_vid = self
                .graph
                .add_vertex(Vertex::UnparserRule(RuleVertex::new(rule_id)));
            self.graph.add_edge(alternative_id, labeled_vid, None);
            let labeled_ctx = RuleCtx {
                vid: labeled_vid,
                name: display,
                lexer: false,
            };
            self.build_alternative(labeled_vid, alternative, &labeled_ctx)?;
        }

        // For every recurring label, add a synthetic rule with a single
        // alternation over the original alternatives, masked so that only
        // the alternatives with this label stay selectable. Regenerating a
        // subtree produced under a recurring label goes through this rule.
        for label in &recurring {
            let masked: Vec<String> = conditions
                .iter()
                .enumerate()
                .map(|(ci, cond)| {
                    if labels[ci] == *label {
                        cond.clone()
                    } else {
                        "0".to_owned()
                    }
                })
                .collect();
            let trampoline_id = RuleId::labeled(ctx.name.as_str(), label.as_str());
            let trampoline_name = trampoline_id.display_name();
            let trampoline_vid = self.graph.add_vertex(Vertex::UnparserRule(RuleVertex {
                trampoline: true,
                ..RuleVertex::new(trampoline_id)
            }));
            let masked_conditions = self.make_conditions(&masked);
            let labeled_alt = self.graph.add_vertex(Vertex::Alternation(AlternationVertex {
                rule: trampoline_name.clone(),
                idx: 0,
                conditions: masked_conditions,
                min_sizes: 0,
            }));
            self.graph.add_edge(trampoline_vid, labeled_alt, None);
            let mut recurring_idx = 0;
            for i in 0..node.alternatives.len() {
                let alternative_vid =
                    self.graph
                        .add_vertex(Vertex::Alternative(AlternativeVertex {
                            rule: trampoline_name.clone(),
                            alt_idx: 0,
                            idx: i,
                        }));
                self.graph.add_edge(labeled_alt, alternative_vid, None);
                let dst = if labels[i] == *label {
                    let target = RuleId::with_ordinal(ctx.name.as_str(), label.as_str(), recurring_idx);
                    recurring_idx += 1;
                    self.graph
                        .rule(&target)
                        .expect("ordinal-labeled rule was just created")
                } else {
                    self.lambda
                };
                self.graph.add_edge(alternative_vid, dst, None);
            }
        }

        Ok(())
    }

    fn build_alternative(
        &mut self,
        parent: VertexId,
        alternative: &Alternative,
        ctx: &RuleCtx,
    ) -> Result<(), CompileError> {
        for element in &alternative.elements {
            self.build_element(parent, element, ctx)?;
        }
        if self.graph.edges(parent).is_empty() {
            self.graph.add_edge(parent, self.lambda, None);
        }
        Ok(())
    }

    fn build_element(
        &mut self,
        parent: VertexId,
        element: &Element,
        ctx: &RuleCtx,
    ) -> Result<(), CompileError> {
        match element {
            // Predicates participate as alternative weights, never as body
            // content.
            Element::Predicate { .. } => {}

            Element::Action { code } => {
                if self.actions {
                    let action = self.graph.add_vertex(Vertex::Action { code: code.clone() });
                    self.graph.add_edge(parent, action, None);
                }
            }

            Element::Quantified { element, suffix } => {
                let (start, stop) = match suffix {
                    Suffix::Optional => (0, Some(1)),
                    Suffix::Star => (0, None),
                    Suffix::Plus => (1, None),
                };
                let idx = next_index(&mut self.quant_idx, &ctx.name);
                let quant = self.graph.add_vertex(Vertex::Quantifier(QuantifierVertex {
                    rule: ctx.name.clone(),
                    idx,
                    start,
                    stop,
                    min_size: 0,
                }));
                self.graph.add_edge(parent, quant, None);
                self.build_element(quant, element, ctx)?;
            }

            Element::Labeled {
                label,
                is_list,
                element,
            } => {
                self.build_element(parent, element, ctx)?;
                if self.actions {
                    let variable = self.graph.add_vertex(Vertex::Variable {
                        name: label.clone(),
                        is_list: *is_list,
                    });
                    self.graph.add_edge(parent, variable, None);
                    self.rule_mut(ctx.vid).labels.insert(label.clone(), *is_list);
                }
            }

            Element::Rule { name, .. } if name == "EOF" => {}

            Element::Rule { name, args } => {
                let dst = self
                    .graph
                    .rule_by_name(name)
                    .ok_or_else(|| CompileError::UnknownRule { name: name.clone() })?;
                let args = match args {
                    Some(src) if self.actions => {
                        Some(parse_arg_action_block(src, ArgUseCase::Call)?)
                    }
                    _ => None,
                };
                self.graph.add_edge(parent, dst, args);
            }

            Element::Literal { value } => {
                let src = unescape_string(value)?;
                if ctx.lexer {
                    if let Some(first) = src.chars().next() {
                        self.rule_mut(ctx.vid)
                            .start_ranges
                            .push((first as u32, first as u32 + 1));
                    }
                    let literal = self.graph.add_vertex(Vertex::Literal { src });
                    self.graph.add_edge(parent, literal, None);
                } else {
                    // Every inline literal of a parser rule resolves to a
                    // lexer rule, synthesized on first sight.
                    let vid = match self.literal_lookup.get(&src) {
                        Some(&vid) => vid,
                        None => {
                            let name = format!("T__{}", self.lit_cnt);
                            self.lit_cnt += 1;
                            let vid = self.graph.add_vertex(Vertex::UnlexerRule(
                                RuleVertex::new(RuleId::plain(name)),
                            ));
                            let literal = self.graph.add_vertex(Vertex::Literal { src: src.clone() });
                            self.graph.add_edge(vid, literal, None);
                            self.literal_lookup.insert(src, vid);
                            vid
                        }
                    };
                    self.graph.add_edge(parent, vid, None);
                }
            }

            Element::Charset { value } => {
                if !ctx.lexer {
                    return Err(CompileError::MisplacedCharset {
                        rule: ctx.name.clone(),
                    });
                }
                let ranges = charset_intervals(value)?;
                self.rule_mut(ctx.vid).start_ranges.extend(ranges.iter().copied());
                let charset = self.unique_charset(ranges)?;
                self.add_charset_vertex(parent, ctx, charset);
            }

            Element::Range { start, stop } => {
                if !ctx.lexer {
                    return Err(CompileError::MisplacedCharset {
                        rule: ctx.name.clone(),
                    });
                }
                let range = range_interval(start, stop)?;
                self.rule_mut(ctx.vid).start_ranges.push(range);
                let charset = self.unique_charset(vec![range])?;
                self.add_charset_vertex(parent, ctx, charset);
            }

            Element::Dot => {
                if ctx.lexer {
                    let charset = self.dot_charset;
                    self.add_charset_vertex(parent, ctx, charset);
                } else {
                    let dot = self.ensure_parser_dot();
                    self.graph.add_edge(parent, dot, None);
                }
            }

            Element::Not(inner) => {
                let not_ranges = self.set_element_ranges(inner)?;
                self.add_negated_charset(parent, ctx, not_ranges)?;
            }

            Element::NotBlock(elements) => {
                let mut not_ranges = Vec::new();
                for element in elements {
                    not_ranges.extend(self.set_element_ranges(element)?);
                }
                self.add_negated_charset(parent, ctx, not_ranges)?;
            }

            Element::Block(alternation) => {
                self.build_alternation(parent, alternation, ctx, false)?;
            }

            Element::Eof => {}
        }
        Ok(())
    }

    /// Ranges of one element of a negated set.
    fn set_element_ranges(&self, element: &Element) -> Result<Vec<(u32, u32)>, CompileError> {
        match element {
            Element::Charset { value } => charset_intervals(value),
            Element::Literal { value } => Ok(vec![set_literal(value)?]),
            Element::Range { start, stop } => Ok(vec![range_interval(start, stop)?]),
            Element::Rule { name, .. } => {
                let ranges = self
                    .graph
                    .rule_by_name(name)
                    .and_then(|vid| match self.graph.vertex(vid) {
                        Vertex::UnlexerRule(rule) => Some(rule.start_ranges.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| CompileError::InvalidSetReference { name: name.clone() })?;
                Ok(ranges)
            }
            _ => Err(CompileError::InvalidSetReference {
                name: format!("{element:?}"),
            }),
        }
    }

    fn add_negated_charset(
        &mut self,
        parent: VertexId,
        ctx: &RuleCtx,
        mut not_ranges: Vec<(u32, u32)>,
    ) -> Result<(), CompileError> {
        not_ranges.sort_unstable_by_key(|&(start, _)| start);
        let ranges = multirange_diff(self.dot_base.clone(), &not_ranges);
        let charset = self.unique_charset(ranges)?;
        self.add_charset_vertex(parent, ctx, charset);
        Ok(())
    }

    fn add_charset_vertex(&mut self, parent: VertexId, ctx: &RuleCtx, charset: usize) {
        let idx = next_index(&mut self.chr_idx, &ctx.name);
        let vertex = self.graph.add_vertex(Vertex::Charset(CharsetVertex {
            rule: ctx.name.clone(),
            idx,
            charset,
        }));
        self.graph.add_edge(parent, vertex, None);
    }

    /// On-demand synthetic `_dot` rule: an alternation over every lexer
    /// rule known so far, standing in for the wildcard in parser rules.
    fn ensure_parser_dot(&mut self) -> VertexId {
        if let Some(vid) = self.graph.rule_by_name("_dot") {
            return vid;
        }
        let lexer_rules: Vec<VertexId> = self
            .graph
            .vertex_ids()
            .filter(|&vid| self.graph.vertex(vid).is_lexer_rule())
            .collect();
        let dot_vid = self.graph.add_vertex(Vertex::UnparserRule(
            RuleVertex::new(RuleId::plain("_dot")),
        ));
        let conditions = append_unique(&mut self.graph.alt_conds, vec![1.0; lexer_rules.len()]);
        let alt_vid = self.graph.add_vertex(Vertex::Alternation(AlternationVertex {
            rule: "_dot".to_owned(),
            idx: 0,
            conditions: Conditions::Weights(conditions),
            min_sizes: 0,
        }));
        self.graph.add_edge(dot_vid, alt_vid, None);
        for (i, lexer_vid) in lexer_rules.into_iter().enumerate() {
            let alternative = self
                .graph
                .add_vertex(Vertex::Alternative(AlternativeVertex {
                    rule: "_dot".to_owned(),
                    alt_idx: 0,
                    idx: i,
                }));
            self.graph.add_edge(alt_vid, alternative, None);
            self.graph.add_edge(alternative, lexer_vid, None);
        }
        dot_vid
    }

    fn effective_guard(&self, alternative: &Alternative) -> String {
        if !self.actions {
            return "1".to_owned();
        }
        alternative
            .guard
            .clone()
            .or_else(|| match alternative.elements.first() {
                Some(Element::Predicate { code }) => Some(code.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "1".to_owned())
    }

    fn make_conditions(&mut self, conditions: &[String]) -> Conditions {
        let numeric: Option<Vec<f64>> = conditions
            .iter()
            .map(|cond| cond.trim().parse::<f64>().ok())
            .collect();
        match numeric {
            Some(weights) => {
                Conditions::Weights(append_unique(&mut self.graph.alt_conds, weights))
            }
            None => Conditions::Predicates(conditions.to_vec()),
        }
    }

    fn unique_charset(&mut self, ranges: Vec<(u32, u32)>) -> Result<usize, CompileError> {
        if ranges.is_empty() {
            return Err(CompileError::EmptyCharset {
                src: "negated or property set".to_owned(),
            });
        }
        for &(start, end) in &ranges {
            if end <= start {
                return Err(CompileError::EmptyRange {
                    start,
                    end: end.saturating_sub(1),
                });
            }
        }
        Ok(append_unique(&mut self.graph.charsets, Charset::new(ranges)))
    }

    fn rule_mut(&mut self, vid: VertexId) -> &mut RuleVertex {
        self.graph
            .vertex_mut(vid)
            .as_rule_mut()
            .expect("rule context points at a rule vertex")
    }
}

fn next_index(counter: &mut HashMap<String, usize>, rule: &str) -> usize {
    let slot = counter.entry(rule.to_owned()).or_insert(0);
    let idx = *slot;
    *slot += 1;
    idx
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::tree::RuleSize;

    #[test]
    fn literal_interning_reuses_tokens() {
        // S: 'a' 'a' A; A: 'a';
        let graph = compile(vec![
            parser_rule("S", seq(vec![lit("a"), lit("a"), rref("A")])),
            lexer_rule("A", seq(vec![lit("a")])),
        ]);
        // The explicit lexer rule already derives 'a', so no T__ rule is
        // synthesized and all three references point at A.
        let s = graph.rule_by_name("S").unwrap();
        assert!(graph.rule_by_name("T__0").is_none());
        let a = graph.rule_by_name("A").unwrap();
        assert!(graph.edges(s).iter().all(|edge| edge.dst == a));
    }

    #[test]
    fn literal_interning_synthesizes_tokens() {
        let graph = compile(vec![parser_rule("S", seq(vec![lit("x"), lit("x")]))]);
        let t0 = graph.rule_by_name("T__0").expect("synthesized token");
        assert!(graph.rule_by_name("T__1").is_none());
        let s = graph.rule_by_name("S").unwrap();
        assert_eq!(graph.edges(s).len(), 2);
        assert!(graph.edges(s).iter().all(|edge| edge.dst == t0));
    }

    #[test]
    fn min_sizes_of_alternation() {
        // S: 'a' | S 'b';
        let graph = compile(vec![parser_rule(
            "S",
            alts(vec![vec![lit("a")], vec![rref("S"), lit("b")]]),
        )]);
        let s = graph.rule_by_name("S").unwrap();
        let rule = graph.vertex(s).as_rule().unwrap();
        // Token 'a' has size (1, 1); S therefore (2, 1).
        assert_eq!(rule.min_size, RuleSize::new(2, 1));
        // The alternation's per-alternative sizes: 'a' is (1, 1); the
        // recursive alternative needs S plus 'b'.
        let Vertex::Alternation(alt) = graph.vertex(graph.edges(s)[0].dst) else {
            panic!("expected alternation under S");
        };
        assert_eq!(
            graph.alt_sizes[alt.min_sizes],
            vec![RuleSize::new(1, 1), RuleSize::new(2, 2)]
        );
    }

    #[test]
    fn quantifier_reserve_accounts_right_siblings() {
        // S: A* 'b' 'c'; A: 'a';
        let graph = compile(vec![
            parser_rule(
                "S",
                seq(vec![
                    quant(rref("A"), Suffix::Star),
                    lit("b"),
                    lit("c"),
                ]),
            ),
            lexer_rule("A", seq(vec![lit("a")])),
        ]);
        let s = graph.rule_by_name("S").unwrap();
        let edges = graph.edges(s);
        // Descending into the quantifier must reserve the two trailing
        // tokens; the last edge owes nothing.
        assert_eq!(edges[0].reserve, 2);
        assert_eq!(edges[1].reserve, 1);
        assert_eq!(edges[2].reserve, 0);
    }

    #[test]
    fn immutable_rules_fixpoint() {
        // A: 'a'; B: A 'b'; C: c-charset
        let graph = compile(vec![
            lexer_rule("A", seq(vec![lit("a")])),
            lexer_rule("B", seq(vec![rref("A"), lit("b")])),
            lexer_rule("C", seq(vec![Element::Charset { value: "0-9".into() }])),
            parser_rule("S", seq(vec![rref("B"), rref("C")])),
        ]);
        assert!(graph.is_immutable("A"));
        assert!(graph.is_immutable("B"));
        assert!(!graph.is_immutable("C"));
        assert!(!graph.is_immutable("S"));
    }

    #[test]
    fn recurring_labels_get_trampoline_rules() {
        // S: A #One | B #Two | C #One;
        let graph = compile(vec![
            parser_rule(
                "S",
                Alternation {
                    alternatives: vec![
                        labeled_alt("One", vec![rref("A")]),
                        labeled_alt("Two", vec![rref("B")]),
                        labeled_alt("One", vec![rref("C")]),
                    ],
                },
            ),
            lexer_rule("A", seq(vec![lit("a")])),
            lexer_rule("B", seq(vec![lit("b")])),
            lexer_rule("C", seq(vec![lit("c")])),
        ]);
        // Two ordinal rules plus the masked trampoline.
        assert!(graph.rule(&RuleId::with_ordinal("S", "One", 0)).is_some());
        assert!(graph.rule(&RuleId::with_ordinal("S", "One", 1)).is_some());
        assert!(graph.rule(&RuleId::labeled("S", "Two")).is_some());
        let trampoline = graph.rule(&RuleId::labeled("S", "One")).expect("trampoline");
        let rule = graph.vertex(trampoline).as_rule().unwrap();
        assert!(rule.trampoline);
        // The trampoline's alternation masks the middle alternative.
        let Vertex::Alternation(alt) = graph.vertex(graph.edges(trampoline)[0].dst) else {
            panic!("expected alternation under trampoline");
        };
        let Conditions::Weights(w) = alt.conditions else {
            panic!("expected numeric conditions");
        };
        assert_eq!(graph.alt_conds[w], vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn duplicate_rules_are_fatal() {
        let ast = grammar(
            "Dup",
            vec![
                parser_rule("S", seq(vec![lit("a")])),
                parser_rule("S", seq(vec![lit("b")])),
            ],
        );
        let result = Compiler::new().compile(Some(&ast), None);
        assert!(matches!(result, Err(CompileError::DuplicateRules { .. })));
    }

    #[test]
    fn unreachable_and_infinite_rules_are_reported() {
        // S: 'a'; Dead: 'd'; Loop: Loop 'x';
        let graph = compile(vec![
            parser_rule("S", seq(vec![lit("a")])),
            parser_rule("Dead", seq(vec![lit("d")])),
            parser_rule("Loop", seq(vec![rref("Loop"), lit("x")])),
        ]);
        let report = graph.analyze(None);
        assert!(report.unreachable_rules.iter().any(|r| r == "Dead"));
        assert!(report.infinite_rules.iter().any(|r| r == "Loop"));
    }

    #[test]
    fn parser_dot_builds_synthetic_rule() {
        let graph = compile(vec![
            parser_rule("S", seq(vec![Element::Dot])),
            lexer_rule("A", seq(vec![lit("a")])),
        ]);
        let dot = graph.rule_by_name("_dot").expect("synthetic _dot rule");
        let Vertex::Alternation(_) = graph.vertex(graph.edges(dot)[0].dst) else {
            panic!("expected alternation under _dot");
        };
    }

    #[test]
    fn default_rule_is_first_of_parser_grammar() {
        let graph = compile(vec![
            parser_rule("start", seq(vec![lit("a")])),
            parser_rule("other", seq(vec![lit("b")])),
        ]);
        assert_eq!(graph.default_rule, "start");
    }
}
