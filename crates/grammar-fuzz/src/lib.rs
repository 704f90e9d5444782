//! Grammar-based random test generation.
//!
//! This crate compiles context-free grammars (in the common parser
//! generator dialect, handed over as parsed ASTs) into a typed grammar
//! graph, generates syntactically valid random trees from the graph
//! under depth and token budgets, mutates and recombines previously
//! generated trees, and converts externally parsed inputs into the same
//! tree model so they can join the evolution.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod annotations;
pub mod codec;
pub mod compiler;
pub mod generator;
pub mod graph;
pub mod listener;
pub mod model;
pub mod parse;
pub mod population;
pub mod serializer;
pub mod tool;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use annotations::{Annotations, NodeKey};
pub use codec::{AnnotatedTreeCodec, BinaryTreeCodec, CodecError, JsonTreeCodec, TreeCodec};
pub use compiler::{CompileError, Compiler};
pub use generator::{GenerationError, Generator};
pub use graph::GrammarGraph;
pub use listener::Listener;
pub use model::{CooldownModel, DefaultModel, DispatchingModel, Model, WeightedModel};
pub use parse::{AdaptError, ParseNode, ParserAdapter};
pub use population::{FilePopulation, Individual, Population, PopulationError};
pub use tool::{GeneratorTool, ToolError};
pub use tree::{NodeId, NodeKind, RuleSize, Tree};
