//! The parsed-grammar contract.
//!
//! The grammar file parser itself is an external collaborator: any parser
//! for the ANTLR-style dialect can feed this compiler, as long as it
//! produces the data shapes below (they mirror the dialect's standard
//! `grammarSpec / ruleSpec / …` structure). The shapes are serde types, so
//! a parser in another process can hand trees over as JSON.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarKind {
    Lexer,
    Parser,
    Combined,
}

/// A parsed grammar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarAst {
    pub name: String,
    pub kind: GrammarKind,
    #[serde(default)]
    pub options: IndexMap<String, String>,
    /// Names of delegate grammars to import.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Imaginary tokens declared in the `tokens {}` section.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Named `@header` / `@members` action blocks.
    #[serde(default)]
    pub actions: Vec<NamedAction>,
    pub rules: Vec<RuleSpec>,
}

impl GrammarAst {
    /// Whether this grammar contributes lexer rules (lexer and combined
    /// grammars are processed first so token references resolve).
    pub fn has_lexer_rules(&self) -> bool {
        self.kind != GrammarKind::Parser
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedAction {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Lexer,
    Parser,
}

/// A single lexer or parser rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub kind: RuleKind,
    /// Raw `[...]` argument declaration block, if any.
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub locals: Option<String>,
    #[serde(default)]
    pub returns: Option<String>,
    /// `@init` action code.
    #[serde(default)]
    pub init: Option<String>,
    /// `@after` action code.
    #[serde(default)]
    pub after: Option<String>,
    pub block: Alternation,
}

/// A `… | … | …` block. A block with a single alternative is a plain
/// sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternation {
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    /// Alternative label (`# Label`), only meaningful in parser rules.
    #[serde(default)]
    pub label: Option<String>,
    /// Leading semantic predicate (`{…}?`) guarding this alternative.
    #[serde(default)]
    pub guard: Option<String>,
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suffix {
    /// `?`
    Optional,
    /// `*`
    Star,
    /// `+`
    Plus,
}

/// One element of an alternative's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Element {
    /// Reference to a parser rule or token, with an optional raw argument
    /// block.
    Rule {
        name: String,
        #[serde(default)]
        args: Option<String>,
    },
    /// A quoted string literal; escape sequences undecoded.
    Literal { value: String },
    /// A `[...]` lexer charset body; escape sequences undecoded.
    Charset { value: String },
    /// A `'a'..'z'` character range; endpoint escapes undecoded.
    Range { start: String, stop: String },
    /// The `.` wildcard.
    Dot,
    /// A `~x` negated set element.
    Not(Box<Element>),
    /// A `~( … | … )` negated block of set elements.
    NotBlock(Vec<Element>),
    /// A parenthesized sub-block.
    Block(Alternation),
    /// An element with a `?`, `*` or `+` suffix.
    Quantified { element: Box<Element>, suffix: Suffix },
    /// An inline `{…}` action.
    Action { code: String },
    /// A non-leading `{…}?` semantic predicate.
    Predicate { code: String },
    /// A labeled element (`label=…`, or `label+=…` when `is_list`).
    Labeled {
        label: String,
        #[serde(default)]
        is_list: bool,
        element: Box<Element>,
    },
    /// The `EOF` token.
    Eof,
}
