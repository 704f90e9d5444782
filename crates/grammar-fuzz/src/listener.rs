//! Listeners get notified whenever the generator enters or exits a rule.
//! Notifications follow registration order on entry and reverse order on
//! exit.

use crate::tree::{NodeId, Tree};

pub trait Listener {
    /// Called before the derivation of `node` is generated; the node is
    /// attached but childless.
    fn enter_rule(&mut self, tree: &Tree, node: NodeId) {
        let _ = (tree, node);
    }

    /// Called after the subtree of `node` has been generated.
    fn exit_rule(&mut self, tree: &Tree, node: NodeId) {
        let _ = (tree, node);
    }
}
