//! Tree codecs: conversion between derivation trees and bytes.
//!
//! Two interchangeable wire formats share one recursive node table: a
//! human-debuggable JSON form and a dense binary (CBOR) form. Unbounded
//! quantifier `stop` encodes as `-1` in both. Decoding malformed bytes
//! fails with a recognizable [`CodecError`] instead of producing an
//! invalid tree.

use serde::{Deserialize, Serialize};

use crate::annotations::Annotations;
use crate::tree::{NodeId, NodeKind, RuleSize, Tree};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON tree: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed binary tree: {0}")]
    Binary(#[from] serde_cbor::Error),
    #[error("invalid tree field: {message}")]
    Invalid { message: String },
}

/// Converts between trees and byte arrays.
pub trait TreeCodec {
    fn encode(&self, tree: &Tree) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<Tree, CodecError>;
}

/// A codec that may carry precomputed annotations along with the tree.
///
/// The default implementation discards annotations on encode and
/// re-derives nothing on decode; loaders recompute lazily.
pub trait AnnotatedTreeCodec: TreeCodec {
    fn encode_annotated(
        &self,
        tree: &Tree,
        annotations: Option<&Annotations>,
    ) -> Result<Vec<u8>, CodecError> {
        let _ = annotations;
        self.encode(tree)
    }

    fn decode_annotated(&self, data: &[u8]) -> Result<(Tree, Option<Annotations>), CodecError> {
        Ok((self.decode(data)?, None))
    }
}

/// The recursive node record shared by both wire formats. The `t` tag
/// selects the variant and thereby which fields are meaningful.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t")]
enum NodeRepr {
    #[serde(rename = "l")]
    Lexer {
        n: Option<String>,
        s: Option<String>,
        z: (usize, usize),
        i: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        c: Vec<NodeRepr>,
    },
    #[serde(rename = "p")]
    Parser { n: String, c: Vec<NodeRepr> },
    #[serde(rename = "a")]
    Alternative {
        ai: usize,
        i: usize,
        c: Vec<NodeRepr>,
    },
    #[serde(rename = "qd")]
    Quantified { c: Vec<NodeRepr> },
    #[serde(rename = "q")]
    Quantifier {
        i: usize,
        b: usize,
        e: i64,
        c: Vec<NodeRepr>,
    },
}

fn to_repr(tree: &Tree, node: NodeId) -> NodeRepr {
    let children = || tree.children(node).iter().map(|&c| to_repr(tree, c)).collect();
    match tree.kind(node) {
        NodeKind::UnlexerRule {
            name,
            src,
            size,
            immutable,
        } => NodeRepr::Lexer {
            n: name.clone(),
            s: src.clone(),
            z: (size.depth, size.tokens),
            i: *immutable,
            c: children(),
        },
        NodeKind::UnparserRule { name } => NodeRepr::Parser {
            n: name.clone(),
            c: children(),
        },
        NodeKind::Alternative { alt_idx, idx } => NodeRepr::Alternative {
            ai: *alt_idx,
            i: *idx,
            c: children(),
        },
        NodeKind::Quantified => NodeRepr::Quantified { c: children() },
        NodeKind::Quantifier { idx, start, stop } => NodeRepr::Quantifier {
            i: *idx,
            b: *start,
            e: stop.map_or(-1, |stop| stop as i64),
            c: children(),
        },
    }
}

fn split_repr(repr: NodeRepr) -> Result<(NodeKind, Vec<NodeRepr>), CodecError> {
    let (kind, children) = match repr {
        NodeRepr::Lexer { n, s, z, i, c } => (
            NodeKind::UnlexerRule {
                name: n,
                src: s,
                size: RuleSize::new(z.0, z.1),
                immutable: i,
            },
            c,
        ),
        NodeRepr::Parser { n, c } => (NodeKind::UnparserRule { name: n }, c),
        NodeRepr::Alternative { ai, i, c } => (
            NodeKind::Alternative {
                alt_idx: ai,
                idx: i,
            },
            c,
        ),
        NodeRepr::Quantified { c } => (NodeKind::Quantified, c),
        NodeRepr::Quantifier { i, b, e, c } => {
            let stop = match e {
                -1 => None,
                e if e >= 0 => Some(e as usize),
                e => {
                    return Err(CodecError::Invalid {
                        message: format!("quantifier stop {e} is negative"),
                    });
                }
            };
            (
                NodeKind::Quantifier {
                    idx: i,
                    start: b,
                    stop,
                },
                c,
            )
        }
    };
    Ok((kind, children))
}

fn from_repr(repr: NodeRepr) -> Result<Tree, CodecError> {
    fn attach(tree: &mut Tree, parent: NodeId, repr: NodeRepr) -> Result<(), CodecError> {
        let (kind, children) = split_repr(repr)?;
        let node = tree.add_node(kind);
        tree.add_child(parent, node);
        for child in children {
            attach(tree, node, child)?;
        }
        Ok(())
    }

    let (kind, children) = split_repr(repr)?;
    let mut tree = Tree::new(kind);
    let root = tree.root();
    for child in children {
        attach(&mut tree, root, child)?;
    }
    Ok(tree)
}

/// JSON tree codec; human-debuggable.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTreeCodec;

impl TreeCodec for JsonTreeCodec {
    fn encode(&self, tree: &Tree) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&to_repr(tree, tree.root()))?)
    }

    fn decode(&self, data: &[u8]) -> Result<Tree, CodecError> {
        from_repr(serde_json::from_slice(data)?)
    }
}

/// Dense binary tree codec over the same recursive record, framed as
/// CBOR.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryTreeCodec;

impl TreeCodec for BinaryTreeCodec {
    fn encode(&self, tree: &Tree) -> Result<Vec<u8>, CodecError> {
        Ok(serde_cbor::to_vec(&to_repr(tree, tree.root()))?)
    }

    fn decode(&self, data: &[u8]) -> Result<Tree, CodecError> {
        from_repr(serde_cbor::from_slice(data)?)
    }
}

impl AnnotatedTreeCodec for JsonTreeCodec {}
impl AnnotatedTreeCodec for BinaryTreeCodec {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        let mut tree = Tree::new(NodeKind::UnparserRule { name: "S".into() });
        let root = tree.root();
        let alternative = tree.add_node(NodeKind::Alternative { alt_idx: 0, idx: 1 });
        tree.add_child(root, alternative);
        let quantifier = tree.add_node(NodeKind::Quantifier {
            idx: 0,
            start: 1,
            stop: None,
        });
        tree.add_child(alternative, quantifier);
        let quantified = tree.add_node(NodeKind::Quantified);
        tree.add_child(quantifier, quantified);
        let token = tree.add_node(NodeKind::UnlexerRule {
            name: Some("A".into()),
            src: Some("x".into()),
            size: RuleSize::new(1, 1),
            immutable: true,
        });
        tree.add_child(quantified, token);
        tree
    }

    #[test]
    fn json_round_trip_is_structural_identity() {
        let tree = sample_tree();
        let codec = JsonTreeCodec;
        let decoded = codec.decode(&codec.encode(&tree).unwrap()).unwrap();
        assert!(tree.structural_eq(&decoded));
    }

    #[test]
    fn binary_round_trip_is_structural_identity() {
        let tree = sample_tree();
        let codec = BinaryTreeCodec;
        let decoded = codec.decode(&codec.encode(&tree).unwrap()).unwrap();
        assert!(tree.structural_eq(&decoded));
    }

    #[test]
    fn unbounded_stop_encodes_as_minus_one() {
        let tree = sample_tree();
        let encoded = JsonTreeCodec.encode(&tree).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["c"][0]["c"][0]["e"], -1);

        // And decodes back to unbounded, through the binary form as well.
        let decoded = BinaryTreeCodec
            .decode(&BinaryTreeCodec.encode(&tree).unwrap())
            .unwrap();
        let alternative = decoded.children(decoded.root())[0];
        let quantifier = decoded.children(alternative)[0];
        let NodeKind::Quantifier { stop, .. } = decoded.kind(quantifier) else {
            panic!("expected quantifier");
        };
        assert_eq!(*stop, None);
    }

    #[test]
    fn token_text_survives_byte_for_byte() {
        let tree = Tree::new(NodeKind::UnlexerRule {
            name: Some("T".into()),
            src: Some("\u{1F600} \t\\\"ű".into()),
            size: RuleSize::new(1, 1),
            immutable: false,
        });
        for codec in [&JsonTreeCodec as &dyn TreeCodec, &BinaryTreeCodec] {
            let decoded = codec.decode(&codec.encode(&tree).unwrap()).unwrap();
            assert_eq!(decoded.text(decoded.root()), "\u{1F600} \t\\\"ű");
        }
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        assert!(JsonTreeCodec.decode(b"{\"t\": \"nope\"}").is_err());
        assert!(JsonTreeCodec.decode(b"garbage").is_err());
        assert!(BinaryTreeCodec.decode(b"\xff\xff").is_err());
    }
}
