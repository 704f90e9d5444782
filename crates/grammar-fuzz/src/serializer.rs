//! Tree-to-string serializers and tree-to-tree transformers applied
//! before serialization.

use itertools::Itertools;

use crate::tree::{NodeId, NodeKind, Tree};

/// A serializer turns a finished tree into test-case text.
pub type Serializer = fn(&Tree) -> String;

/// A transformer post-processes a tree in place before serialization.
pub type Transformer = fn(&mut Tree);

/// The default serializer: the concatenated token text of the tree.
pub fn concat_serializer(tree: &Tree) -> String {
    tree.text(tree.root())
}

/// Simple serializer joining the token leaves with single spaces.
pub fn simple_space_serializer(tree: &Tree) -> String {
    tree.tokens(tree.root()).format(" ").to_string()
}

/// Simple transformer appending a space token after every child of every
/// parser rule node.
pub fn simple_space_transformer(tree: &mut Tree) {
    let nodes: Vec<NodeId> = tree.iter_depth_first(tree.root()).collect();
    for node in nodes {
        if !matches!(tree.kind(node), NodeKind::UnparserRule { .. }) {
            continue;
        }
        let children: Vec<NodeId> = tree.children(node).to_vec();
        for child in children {
            let slot = tree
                .children(node)
                .iter()
                .position(|&c| c == child)
                .expect("child list is stable during traversal");
            let space = tree.add_node(NodeKind::token(" "));
            tree.insert_child(node, slot + 1, space);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{RuleSize, Tree};

    fn two_token_tree() -> Tree {
        let mut tree = Tree::new(NodeKind::UnparserRule { name: "S".into() });
        let root = tree.root();
        for src in ["a", "b"] {
            let token = tree.add_node(NodeKind::UnlexerRule {
                name: Some(src.to_uppercase()),
                src: Some(src.into()),
                size: RuleSize::ZERO,
                immutable: false,
            });
            tree.add_child(root, token);
        }
        tree
    }

    #[test]
    fn space_serializer_joins_tokens() {
        let tree = two_token_tree();
        assert_eq!(concat_serializer(&tree), "ab");
        assert_eq!(simple_space_serializer(&tree), "a b");
    }

    #[test]
    fn space_transformer_inserts_separators() {
        let mut tree = two_token_tree();
        simple_space_transformer(&mut tree);
        assert_eq!(concat_serializer(&tree), "a b ");
    }
}
