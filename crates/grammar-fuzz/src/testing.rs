//! Shorthands for building small grammars in tests.

use crate::compiler::Compiler;
use crate::compiler::ast::{
    Alternation, Alternative, Element, GrammarAst, GrammarKind, RuleKind, RuleSpec, Suffix,
};
use crate::graph::GrammarGraph;

pub(crate) fn lit(value: &str) -> Element {
    Element::Literal {
        value: value.to_owned(),
    }
}

pub(crate) fn rref(name: &str) -> Element {
    Element::Rule {
        name: name.to_owned(),
        args: None,
    }
}

pub(crate) fn quant(element: Element, suffix: Suffix) -> Element {
    Element::Quantified {
        element: Box::new(element),
        suffix,
    }
}

pub(crate) fn seq(elements: Vec<Element>) -> Alternation {
    Alternation {
        alternatives: vec![Alternative {
            label: None,
            guard: None,
            elements,
        }],
    }
}

pub(crate) fn alts(alternatives: Vec<Vec<Element>>) -> Alternation {
    Alternation {
        alternatives: alternatives
            .into_iter()
            .map(|elements| Alternative {
                label: None,
                guard: None,
                elements,
            })
            .collect(),
    }
}

pub(crate) fn labeled_alt(label: &str, elements: Vec<Element>) -> Alternative {
    Alternative {
        label: Some(label.to_owned()),
        guard: None,
        elements,
    }
}

pub(crate) fn parser_rule(name: &str, block: Alternation) -> RuleSpec {
    RuleSpec {
        name: name.to_owned(),
        kind: RuleKind::Parser,
        args: None,
        locals: None,
        returns: None,
        init: None,
        after: None,
        block,
    }
}

pub(crate) fn lexer_rule(name: &str, block: Alternation) -> RuleSpec {
    RuleSpec {
        kind: RuleKind::Lexer,
        ..parser_rule(name, block)
    }
}

pub(crate) fn grammar(name: &str, rules: Vec<RuleSpec>) -> GrammarAst {
    GrammarAst {
        name: name.to_owned(),
        kind: GrammarKind::Combined,
        options: Default::default(),
        imports: Vec::new(),
        tokens: Vec::new(),
        actions: Vec::new(),
        rules,
    }
}

pub(crate) fn compile(rules: Vec<RuleSpec>) -> GrammarGraph {
    let ast = grammar("Test", rules);
    Compiler::new()
        .compile(Some(&ast), None)
        .expect("test grammar compiles")
}
