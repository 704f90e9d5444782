//! The generator tool: orchestrates one creation attempt end to end —
//! operator selection, generation or mutation, transformation,
//! serialization, memoization of recent unique outputs, and persistence.

mod mutators;

use std::fs;
use std::hash::BuildHasher as _;
use std::io::Write as _;
use std::path::PathBuf;

use indexmap::IndexMap;
use rand::Rng;
use rand::rngs::StdRng;
use rand::{SeedableRng, seq::SliceRandom};
use tracing::debug;

use crate::generator::{GenerationError, Generator};
use crate::graph::GrammarGraph;
use crate::model::{DefaultModel, Model};
use crate::population::{Individual, Population, PopulationError};
use crate::serializer::{Serializer, Transformer, concat_serializer};
use crate::tree::{RuleSize, Tree};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Population(#[from] PopulationError),
    #[error("no enabled creator could produce a tree")]
    NoCreator,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces a fresh decision model for every generation; the seed is
/// drawn from the tool's own random stream so that runs are reproducible
/// from a single configured seed.
pub type ModelFactory = Box<dyn Fn(u64) -> Box<dyn Model>>;

/// The tree creators the dispatcher chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Generate,
    RegenerateRule,
    DeleteQuantified,
    ReplicateQuantified,
    ShuffleQuantifieds,
    HoistRule,
    SwapLocalNodes,
    InsertLocalNode,
    UnrestrictedDelete,
    UnrestrictedHoistRule,
    ReplaceNode,
    InsertQuantified,
}

/// Tool to create new test cases from a compiled grammar graph, by
/// generating from scratch and by mutating or recombining population
/// individuals.
pub struct GeneratorTool<'g> {
    graph: &'g GrammarGraph,
    model_factory: ModelFactory,
    rule: Option<String>,
    limit: RuleSize,
    population: Option<Box<dyn Population>>,
    enable_generation: bool,
    enable_mutation: bool,
    enable_recombination: bool,
    unrestricted: bool,
    keep_trees: bool,
    transformers: Vec<Transformer>,
    serializer: Serializer,
    memo: IndexMap<u64, ()>,
    memo_size: usize,
    unique_attempts: usize,
    hasher: ahash::RandomState,
    out_format: Option<String>,
    dry_run: bool,
    pub(crate) rng: StdRng,
}

impl std::fmt::Debug for GeneratorTool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorTool")
            .field("graph", &self.graph.name)
            .field("rule", &self.rule)
            .field("limit", &self.limit)
            .field("memo_size", &self.memo_size)
            .finish_non_exhaustive()
    }
}

impl<'g> GeneratorTool<'g> {
    pub fn new(graph: &'g GrammarGraph) -> Self {
        Self {
            graph,
            model_factory: Box::new(|seed| Box::new(DefaultModel::with_seed(seed))),
            rule: None,
            limit: RuleSize::MAX,
            population: None,
            enable_generation: true,
            enable_mutation: true,
            enable_recombination: true,
            unrestricted: true,
            keep_trees: false,
            transformers: Vec::new(),
            serializer: concat_serializer,
            memo: IndexMap::new(),
            memo_size: 0,
            unique_attempts: 2,
            hasher: ahash::RandomState::new(),
            out_format: None,
            dry_run: false,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = factory;
        self
    }

    /// Rule to start generation from (default: the graph's default rule).
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_limit(mut self, limit: RuleSize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_population(mut self, population: Box<dyn Population>) -> Self {
        self.population = Some(population);
        self
    }

    /// Enables or disables the operator classes: generation from scratch,
    /// mutation, recombination, and the possibly grammar-violating
    /// unrestricted mutators.
    pub fn with_creators(
        mut self,
        generate: bool,
        mutate: bool,
        recombine: bool,
        unrestricted: bool,
    ) -> Self {
        self.enable_generation = generate;
        self.enable_mutation = mutate;
        self.enable_recombination = recombine;
        self.unrestricted = unrestricted;
        self
    }

    /// Writes created trees back into the population so they participate
    /// in further evolution.
    pub fn with_keep_trees(mut self, keep: bool) -> Self {
        self.keep_trees = keep;
        self
    }

    pub fn with_transformers(mut self, transformers: Vec<Transformer>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Remembers the hashes of the last `memo_size` unique outputs and
    /// retries creation up to `unique_attempts` times to avoid repeating
    /// them.
    pub fn with_memo(mut self, memo_size: usize, unique_attempts: usize) -> Self {
        self.memo_size = memo_size;
        self.unique_attempts = unique_attempts.max(1);
        self
    }

    /// Output path pattern; a `%d` placeholder is replaced by the test
    /// index. Without a pattern, tests are printed to standard output.
    pub fn with_out_format(mut self, out_format: impl Into<String>) -> Self {
        self.out_format = Some(out_format.into());
        self
    }

    /// Skips writing and printing results.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Re-seeds the random stream, e.g. with `seed + index` per test case
    /// so individual outputs are reproducible. The output memo is kept.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Creates one test case: builds a tree, serializes it, retries while
    /// the output is memoized, then persists it. Returns the output path,
    /// or `None` when printing to stdout or dry-running.
    pub fn create_test(&mut self, index: usize) -> Result<Option<PathBuf>, ToolError> {
        let mut tree = None;
        let mut test = String::new();
        for attempt in 1..=self.unique_attempts {
            let candidate = self.create()?;
            test = (self.serializer)(&candidate);
            tree = Some(candidate);
            if self.memoize(&test) {
                break;
            }
            debug!(
                index,
                attempt,
                memo = self.memo.len(),
                "test case already generated among the recent unique outputs"
            );
        }
        let tree = tree.expect("at least one creation attempt ran");

        if self.dry_run {
            return Ok(None);
        }

        let path = self.out_format.as_ref().map(|pattern| {
            PathBuf::from(pattern.replace("%d", &index.to_string()))
        });

        if self.keep_trees {
            if let Some(population) = &mut self.population {
                population.add_individual(&tree, path.as_deref())?;
            }
        }

        match &path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, test.as_bytes())?;
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(test.as_bytes())?;
                stdout.write_all(b"\n")?;
            }
        }
        Ok(path)
    }

    /// Creates a new tree with a randomly selected creator from the
    /// enabled operator classes, applying the configured transformers.
    pub fn create(&mut self) -> Result<Tree, ToolError> {
        let (recipient, donor) = match &mut self.population {
            Some(population) if !population.empty() => {
                let recipient = population.select_individual(None)?;
                let donor = population.select_individual(Some(&recipient))?;
                (Some(recipient), Some(donor))
            }
            _ => (None, None),
        };

        let mut creators = Vec::new();
        if self.enable_generation {
            creators.push(Operator::Generate);
        }
        if recipient.is_some() {
            if self.enable_mutation {
                creators.extend(self.mutation_operators());
            }
            if self.enable_recombination {
                creators.extend(RECOMBINATION_OPERATORS);
            }
        }
        self.create_tree(creators, recipient.as_ref(), donor.as_ref())
    }

    /// Dispatcher for the mutation operators, ignoring the enable flags.
    pub fn mutate(&mut self, individual: Option<Individual>) -> Result<Tree, ToolError> {
        let individual = self.ensure_individual(individual)?;
        let creators = self.mutation_operators();
        self.create_tree(creators, Some(&individual), None)
    }

    /// Dispatcher for the recombination operators, ignoring the enable
    /// flags.
    pub fn recombine(
        &mut self,
        recipient: Option<Individual>,
        donor: Option<Individual>,
    ) -> Result<Tree, ToolError> {
        let recipient = self.ensure_individual(recipient)?;
        let donor = match donor {
            Some(donor) => donor,
            None => match &mut self.population {
                Some(population) => population.select_individual(Some(&recipient))?,
                None => return Err(ToolError::NoCreator),
            },
        };
        self.create_tree(
            RECOMBINATION_OPERATORS.to_vec(),
            Some(&recipient),
            Some(&donor),
        )
    }

    /// Instantiates a fresh generator and generates a tree from scratch.
    /// `reserve` is the size budget already consumed by the surrounding
    /// context of the new subtree.
    pub fn generate(
        &mut self,
        rule: Option<&str>,
        reserve: RuleSize,
    ) -> Result<Tree, GenerationError> {
        let seed = self.rng.random();
        let mut generator = Generator::new(self.graph)
            .with_model((self.model_factory)(seed))
            .with_limit(self.limit - reserve);
        generator.generate(rule.or(self.rule.as_deref()))
    }

    fn mutation_operators(&self) -> Vec<Operator> {
        let mut operators = MUTATION_OPERATORS.to_vec();
        if self.unrestricted {
            operators.extend(UNRESTRICTED_OPERATORS);
        }
        operators
    }

    /// Applies randomly selected creators until one produces a tree;
    /// creators that report "no change" leave the pool. When every
    /// creator fails, the recipient is reused as-is.
    fn create_tree(
        &mut self,
        mut creators: Vec<Operator>,
        recipient: Option<&Individual>,
        donor: Option<&Individual>,
    ) -> Result<Tree, ToolError> {
        let mut created = None;
        while !creators.is_empty() {
            let slot = self.rng.random_range(0..creators.len());
            match self.apply(creators[slot], recipient, donor)? {
                Some(tree) => {
                    created = Some(tree);
                    break;
                }
                None => {
                    creators.remove(slot);
                }
            }
        }

        let mut tree = match created {
            Some(tree) => tree,
            None => recipient.ok_or(ToolError::NoCreator)?.tree().clone(),
        };
        for transformer in &self.transformers {
            transformer(&mut tree);
        }
        Ok(tree)
    }

    fn apply(
        &mut self,
        operator: Operator,
        recipient: Option<&Individual>,
        donor: Option<&Individual>,
    ) -> Result<Option<Tree>, ToolError> {
        match operator {
            Operator::Generate => Ok(Some(self.generate(None, RuleSize::ZERO)?)),
            mutation => {
                let Some(recipient) = recipient else {
                    return Ok(None);
                };
                match mutation {
                    Operator::RegenerateRule => self.regenerate_rule(recipient).map(Some),
                    Operator::DeleteQuantified => Ok(self.delete_quantified(recipient)),
                    Operator::ReplicateQuantified => Ok(self.replicate_quantified(recipient)),
                    Operator::ShuffleQuantifieds => Ok(self.shuffle_quantifieds(recipient)),
                    Operator::HoistRule => Ok(self.hoist_rule(recipient)),
                    Operator::SwapLocalNodes => Ok(self.swap_local_nodes(recipient)),
                    Operator::InsertLocalNode => Ok(self.insert_local_node(recipient)),
                    Operator::UnrestrictedDelete => Ok(self.unrestricted_delete(recipient)),
                    Operator::UnrestrictedHoistRule => {
                        Ok(self.unrestricted_hoist_rule(recipient))
                    }
                    Operator::ReplaceNode => {
                        Ok(donor.and_then(|donor| self.replace_node(recipient, donor)))
                    }
                    Operator::InsertQuantified => {
                        Ok(donor.and_then(|donor| self.insert_quantified(recipient, donor)))
                    }
                    Operator::Generate => unreachable!("handled above"),
                }
            }
        }
    }

    fn ensure_individual(
        &mut self,
        individual: Option<Individual>,
    ) -> Result<Individual, ToolError> {
        match individual {
            Some(individual) => Ok(individual),
            None => match &mut self.population {
                Some(population) => Ok(population.select_individual(None)?),
                None => Err(ToolError::NoCreator),
            },
        }
    }

    /// Memoizes the hash of a serialized test. Returns `false` if it was
    /// already among the last `memo_size` unique outputs. The memo is an
    /// insertion-ordered bounded map; the oldest entry leaves on overflow.
    fn memoize(&mut self, test: &str) -> bool {
        if self.memo_size < 1 {
            return true;
        }
        let hash = self.hasher.hash_one(test);
        if self.memo.contains_key(&hash) {
            return false;
        }
        self.memo.insert(hash, ());
        if self.memo.len() > self.memo_size {
            self.memo.shift_remove_index(0);
        }
        true
    }

    pub(crate) fn shuffled<T: Copy>(&mut self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut items: Vec<T> = items.into_iter().collect();
        items.shuffle(&mut self.rng);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn ab_graph() -> GrammarGraph {
        // S: 'a' | 'b';
        compile(vec![parser_rule(
            "S",
            alts(vec![vec![lit("a")], vec![lit("b")]]),
        )])
    }

    #[test]
    fn create_produces_trees_in_the_language() {
        let graph = ab_graph();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(5, 5))
            .with_seed(1);
        for _ in 0..100 {
            let tree = tool.create().expect("creation succeeds");
            let text = tree.text(tree.root());
            assert!(text == "a" || text == "b", "unexpected output {text:?}");
        }
    }

    #[test]
    fn memo_rejects_recent_outputs_and_evicts_the_oldest() {
        let graph = ab_graph();
        let mut tool = GeneratorTool::new(&graph).with_memo(2, 2).with_seed(2);
        assert!(tool.memoize("a"));
        assert!(!tool.memoize("a"));
        assert!(tool.memoize("b"));
        // Overflow drops the oldest entry ("a"), which then counts as
        // fresh again.
        assert!(tool.memoize("c"));
        assert!(tool.memoize("a"));
        assert!(!tool.memoize("c"));
    }

    #[test]
    fn memo_disabled_accepts_everything() {
        let graph = ab_graph();
        let mut tool = GeneratorTool::new(&graph).with_seed(3);
        assert!(tool.memoize("x"));
        assert!(tool.memoize("x"));
    }

    #[test]
    fn create_test_retries_memoized_outputs() {
        // With only two possible outputs and a memo covering both, every
        // creation attempt after the second must go through retries.
        let graph = ab_graph();
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(5, 5))
            .with_memo(1, 4)
            .with_dry_run(true)
            .with_seed(4);
        for index in 0..20 {
            tool.create_test(index).expect("creation succeeds");
        }
    }

    #[test]
    fn mutation_falls_back_to_the_recipient() {
        // A tree with no quantifiers and no optional structure defeats
        // most mutators; the dispatcher must still return a tree.
        let graph = compile(vec![parser_rule("S", seq(vec![lit("a")]))]);
        let mut tool = GeneratorTool::new(&graph)
            .with_limit(RuleSize::new(5, 5))
            .with_seed(5);
        let tree = tool.generate(None, RuleSize::ZERO).unwrap();
        let individual = crate::population::Individual::new(tree);
        let mutated = tool.mutate(Some(individual)).expect("dispatcher falls back");
        assert_eq!(mutated.text(mutated.root()), "a");
    }
}

const MUTATION_OPERATORS: [Operator; 7] = [
    Operator::RegenerateRule,
    Operator::DeleteQuantified,
    Operator::ReplicateQuantified,
    Operator::ShuffleQuantifieds,
    Operator::HoistRule,
    Operator::SwapLocalNodes,
    Operator::InsertLocalNode,
];

const UNRESTRICTED_OPERATORS: [Operator; 2] =
    [Operator::UnrestrictedDelete, Operator::UnrestrictedHoistRule];

const RECOMBINATION_OPERATORS: [Operator; 2] =
    [Operator::ReplaceNode, Operator::InsertQuantified];
