//! The grammar graph: a typed, directed representation of a context-free
//! grammar with precomputed size metrics.
//!
//! The graph is built once per grammar by the [compiler](crate::compiler),
//! analyzed, and immutable afterwards. The generation runtime walks it to
//! produce derivation trees, the parser adapter walks it to reconstruct
//! decision structure, and the mutation engine consults its size tables to
//! keep mutated trees within budget.

mod analysis;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use analysis::AnalysisReport;

use crate::tree::RuleSize;

/// Index of a vertex within its [`GrammarGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexId(usize);

impl VertexId {
    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

/// Structured identity of a rule vertex.
///
/// Plain rules are identified by their grammar name. Labeled alternatives
/// get a rule of their own identified by `(rule, label)`; when the same
/// label recurs within one alternation, an `ordinal` distinguishes the
/// otherwise identical identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId {
    pub name: String,
    pub label: Option<String>,
    pub ordinal: Option<usize>,
}

impl RuleId {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            ordinal: None,
        }
    }

    pub fn labeled(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
            ordinal: None,
        }
    }

    pub fn with_ordinal(name: impl Into<String>, label: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
            ordinal: Some(ordinal),
        }
    }

    /// The name rule nodes carry in derivation trees: the rule name, with
    /// the label appended if there is one. Ordinals do not show up here.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{}_{}", self.name, label),
            None => self.name.clone(),
        }
    }
}

/// A typed argument of a rule invocation or declaration, parsed from a
/// `(k=v, …)` action block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallArg {
    pub ty: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
}

/// An ordered edge of the graph. `reserve` is the summed minimum token
/// count of the edges following this one in the source vertex: the token
/// budget owed to the right siblings while the edge is being descended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub dst: VertexId,
    pub args: Option<Vec<CallArg>>,
    pub reserve: usize,
}

/// Payload common to lexer and parser rule vertices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVertex {
    pub id: RuleId,
    /// Minimum size of a derivation closing at this rule; computed by the
    /// fixpoint analysis.
    pub min_size: RuleSize,
    /// Synthetic rule standing in for a recurring labeled alternative.
    pub trampoline: bool,
    /// Labeled elements of the rule body (`label=element`); the flag marks
    /// list labels (`label+=element`).
    pub labels: IndexMap<String, bool>,
    pub args: Vec<CallArg>,
    pub locals: Vec<CallArg>,
    pub returns: Vec<CallArg>,
    pub init: String,
    pub after: String,
    /// For lexer rules: ranges the first character of the token may come
    /// from, used to resolve token references inside negated sets.
    pub start_ranges: Vec<(u32, u32)>,
}

impl RuleVertex {
    pub fn new(id: RuleId) -> Self {
        Self {
            id,
            min_size: RuleSize::MAX,
            trampoline: false,
            labels: IndexMap::new(),
            args: Vec::new(),
            locals: Vec::new(),
            returns: Vec::new(),
            init: String::new(),
            after: String::new(),
            start_ranges: Vec::new(),
        }
    }
}

/// Weights of an alternation's alternatives: either constant numeric
/// weights (an index into [`GrammarGraph::alt_conds`]) or raw semantic
/// predicate strings evaluated by a host-supplied callback at generation
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Conditions {
    Weights(usize),
    Predicates(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternationVertex {
    /// Display name of the containing rule.
    pub rule: String,
    /// Index of the alternation within the containing rule.
    pub idx: usize,
    pub conditions: Conditions,
    /// Index into [`GrammarGraph::alt_sizes`].
    pub min_sizes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeVertex {
    pub rule: String,
    pub alt_idx: usize,
    pub idx: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantifierVertex {
    pub rule: String,
    /// Index of the quantifier within the containing rule.
    pub idx: usize,
    pub start: usize,
    /// `None` is unbounded.
    pub stop: Option<usize>,
    /// Index into [`GrammarGraph::quant_sizes`].
    pub min_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharsetVertex {
    pub rule: String,
    /// Index of the charset within the containing rule.
    pub idx: usize,
    /// Index into [`GrammarGraph::charsets`].
    pub charset: usize,
}

/// A vertex of the grammar graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Vertex {
    UnlexerRule(RuleVertex),
    UnparserRule(RuleVertex),
    /// A token declared in the `tokens {}` section without a rule body.
    ImagRule { name: String },
    Literal { src: String },
    Charset(CharsetVertex),
    /// The empty derivation.
    Lambda,
    Alternation(AlternationVertex),
    Alternative(AlternativeVertex),
    Quantifier(QuantifierVertex),
    /// An inline action block; carried through for emitted generators,
    /// inert during interpretation.
    Action { code: String },
    /// A labeled element binding (`label=…` or `label+=…`).
    Variable { name: String, is_list: bool },
}

impl Vertex {
    pub fn as_rule(&self) -> Option<&RuleVertex> {
        match self {
            Vertex::UnlexerRule(rule) | Vertex::UnparserRule(rule) => Some(rule),
            _ => None,
        }
    }

    pub fn as_rule_mut(&mut self) -> Option<&mut RuleVertex> {
        match self {
            Vertex::UnlexerRule(rule) | Vertex::UnparserRule(rule) => Some(rule),
            _ => None,
        }
    }

    pub fn is_lexer_rule(&self) -> bool {
        matches!(self, Vertex::UnlexerRule(_))
    }
}

/// A deduplicated set of Unicode scalar values, stored as sorted,
/// collapsed, half-open codepoint ranges. Surrogates are excluded at
/// construction, so every contained codepoint is a valid `char`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charset {
    ranges: Vec<(u32, u32)>,
    len: usize,
}

impl Charset {
    pub fn new(ranges: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut ranges: Vec<(u32, u32)> = ranges
            .into_iter()
            .flat_map(|(start, end)| {
                // Split around the surrogate gap and clamp to the scalar
                // value range.
                let end = end.min(0x0011_0000);
                [
                    (start.min(0xD800), end.min(0xD800)),
                    (start.max(0xE000), end.max(0xE000)),
                ]
            })
            .filter(|&(start, end)| start < end)
            .collect();
        ranges.sort_unstable();
        let mut collapsed: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match collapsed.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => collapsed.push((start, end)),
            }
        }
        let len = collapsed.iter().map(|&(s, e)| (e - s) as usize).sum();
        Self {
            ranges: collapsed,
            len,
        }
    }

    /// Number of scalar values in the set.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `i`-th scalar value in codepoint order.
    pub fn nth(&self, mut i: usize) -> Option<char> {
        for &(start, end) in &self.ranges {
            let span = (end - start) as usize;
            if i < span {
                return char::from_u32(start + i as u32);
            }
            i -= span;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.ranges
            .iter()
            .flat_map(|&(start, end)| (start..end).filter_map(char::from_u32))
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }
}

/// Appends `element` to `container` unless an equal element is already
/// present; returns the element's index either way.
pub(crate) fn append_unique<T: PartialEq>(container: &mut Vec<T>, element: T) -> usize {
    match container.iter().position(|existing| *existing == element) {
        Some(idx) => idx,
        None => {
            container.push(element);
            container.len() - 1
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VertexData {
    vertex: Vertex,
    out_edges: Vec<Edge>,
}

/// The grammar as a directed graph of typed vertices with shared tables
/// for charsets, numeric alternation weights, and minimum sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarGraph {
    pub name: String,
    vertices: Vec<VertexData>,
    #[serde(with = "indexmap::map::serde_seq")]
    rules: IndexMap<RuleId, VertexId>,
    pub options: IndexMap<String, String>,
    pub charsets: Vec<Charset>,
    /// Constant numeric weight vectors shared between alternations.
    pub alt_conds: Vec<Vec<f64>>,
    /// Per-alternative minimum sizes, indexed by `AlternationVertex::min_sizes`.
    pub alt_sizes: Vec<Vec<RuleSize>>,
    /// Quantifier body minimum sizes, indexed by `QuantifierVertex::min_size`.
    pub quant_sizes: Vec<RuleSize>,
    /// Display names of rules whose derivations are entirely textual.
    pub immutables: Vec<String>,
    pub header: String,
    pub members: String,
    pub default_rule: String,
}

impl GrammarGraph {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            vertices: Vec::new(),
            rules: IndexMap::new(),
            options: IndexMap::new(),
            charsets: Vec::new(),
            alt_conds: Vec::new(),
            alt_sizes: Vec::new(),
            quant_sizes: Vec::new(),
            immutables: Vec::new(),
            header: String::new(),
            members: String::new(),
            default_rule: String::new(),
        }
    }

    /// How the `.` wildcard is resolved; one of `any_ascii_letter`,
    /// `any_ascii_char`, `any_unicode_char`.
    pub fn dot(&self) -> &str {
        self.options.get("dot").map_or("any_ascii_char", String::as_str)
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId(self.vertices.len());
        if let Some(rule) = vertex.as_rule() {
            self.rules.insert(rule.id.clone(), id);
        } else if let Vertex::ImagRule { name } = &vertex {
            self.rules.insert(RuleId::plain(name.clone()), id);
        }
        self.vertices.push(VertexData {
            vertex,
            out_edges: Vec::new(),
        });
        id
    }

    pub fn add_edge(&mut self, from: VertexId, to: VertexId, args: Option<Vec<CallArg>>) {
        self.vertices[from.0].out_edges.push(Edge {
            dst: to,
            args,
            reserve: 0,
        });
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0].vertex
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        &mut self.vertices[id.0].vertex
    }

    pub fn edges(&self, id: VertexId) -> &[Edge] {
        &self.vertices[id.0].out_edges
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + use<> {
        (0..self.vertices.len()).map(VertexId)
    }

    /// Looks up a rule (or imaginary token) vertex by structured identity.
    pub fn rule(&self, id: &RuleId) -> Option<VertexId> {
        self.rules.get(id).copied()
    }

    /// Looks up a rule vertex by plain grammar name.
    pub fn rule_by_name(&self, name: &str) -> Option<VertexId> {
        self.rules.get(&RuleId::plain(name)).copied()
    }

    /// Looks up a rule vertex by the name its tree nodes carry
    /// (`rule` or `rule_Label`).
    pub fn rule_by_display_name(&self, name: &str) -> Option<VertexId> {
        self.rules
            .iter()
            .find(|(id, _)| id.ordinal.is_none() && id.display_name() == name)
            .map(|(_, &id)| id)
    }

    /// All rule vertices, in insertion order.
    pub fn rule_vertices(&self) -> impl Iterator<Item = (VertexId, &RuleVertex)> {
        self.rules.values().filter_map(|&id| {
            self.vertices[id.0].vertex.as_rule().map(|rule| (id, rule))
        })
    }

    /// Minimum size needed to close a derivation of the named rule.
    pub fn min_size_of(&self, display_name: &str) -> RuleSize {
        self.rule_by_display_name(display_name)
            .and_then(|id| self.vertex(id).as_rule())
            .map_or(RuleSize::ZERO, |rule| rule.min_size)
    }

    pub fn is_immutable(&self, display_name: &str) -> bool {
        self.immutables.iter().any(|name| name == display_name)
    }
}

impl Default for GrammarGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_collapses_and_sorts() {
        let charset = Charset::new([(97, 100), (99, 105), (65, 66)]);
        assert_eq!(charset.ranges(), [(65, 66), (97, 105)]);
        assert_eq!(charset.len(), 9);
        assert_eq!(charset.nth(0), Some('A'));
        assert_eq!(charset.nth(1), Some('a'));
        assert_eq!(charset.nth(8), Some('h'));
        assert_eq!(charset.nth(9), None);
    }

    #[test]
    fn charset_excludes_surrogates() {
        let charset = Charset::new([(0xD7FF, 0xE001)]);
        assert_eq!(charset.ranges(), [(0xD7FF, 0xD800), (0xE000, 0xE001)]);
        assert_eq!(charset.len(), 2);
        assert!(charset.iter().all(|c| c as u32 != 0xD800));
    }

    #[test]
    fn append_unique_deduplicates() {
        let mut table = vec![];
        assert_eq!(append_unique(&mut table, vec![1, 2]), 0);
        assert_eq!(append_unique(&mut table, vec![3]), 1);
        assert_eq!(append_unique(&mut table, vec![1, 2]), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn display_names() {
        assert_eq!(RuleId::plain("expr").display_name(), "expr");
        assert_eq!(RuleId::labeled("expr", "Add").display_name(), "expr_Add");
        assert_eq!(
            RuleId::with_ordinal("expr", "Add", 1).display_name(),
            "expr_Add"
        );
    }
}
