use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use grammar_fuzz::graph::GrammarGraph;
use grammar_fuzz::model::{AltKey, CooldownModel, DefaultModel, Model, WeightedModel};
use grammar_fuzz::population::FilePopulation;
use grammar_fuzz::serializer::{simple_space_serializer, simple_space_transformer};
use grammar_fuzz::tool::GeneratorTool;
use grammar_fuzz::tree::RuleSize;
use rayon::prelude::*;
use tracing::info;

use super::{GlobalOptions, TreeFormat};

#[derive(Debug, clap::Parser)]
pub struct GenerateCommand {
    /// Compiled grammar graph produced by `process`.
    graph: PathBuf,

    /// Rule to start generation from (default: the graph's default rule).
    #[clap(short, long)]
    rule: Option<String>,

    /// Maximum derivation depth of generated trees.
    #[clap(short = 'd', long, default_value_t = usize::MAX)]
    max_depth: usize,

    /// Maximum token count of generated trees.
    #[clap(long, default_value_t = usize::MAX)]
    max_tokens: usize,

    /// Number of test cases to create.
    #[clap(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Output file pattern; a `%d` placeholder is replaced by the test
    /// index. Tests print to stdout when omitted.
    #[clap(short, long)]
    out: Option<String>,

    /// Directory of the tree population used for mutation and
    /// recombination.
    #[clap(long)]
    population: Option<PathBuf>,

    #[clap(long, value_enum, default_value = "binary")]
    tree_format: TreeFormat,

    /// Disable generating test cases from scratch.
    #[clap(long)]
    no_generate: bool,

    /// Disable mutating population individuals.
    #[clap(long)]
    no_mutate: bool,

    /// Disable recombining population individuals.
    #[clap(long)]
    no_recombine: bool,

    /// Disable the possibly grammar-violating mutation operators.
    #[clap(long)]
    no_unrestricted: bool,

    /// Write created trees back into the population.
    #[clap(long)]
    keep_trees: bool,

    /// Number of recent unique outputs remembered to avoid repetition.
    #[clap(long, default_value_t = 0)]
    memo_size: usize,

    /// Creation retries while the output is among the memoized ones.
    #[clap(long, default_value_t = 2)]
    unique_attempts: usize,

    /// Join tokens with spaces instead of concatenating them.
    #[clap(long)]
    space_serializer: bool,

    /// Append a space token after every parser-rule child before
    /// serialization.
    #[clap(long)]
    space_transformer: bool,

    /// Cooldown factor (< 1) applied to the weight of every chosen
    /// alternative; the weight map is shared across workers.
    #[clap(long)]
    cooldown: Option<f64>,

    /// Static alternative weights: a JSON array of
    /// `[rule, alternation, alternative, weight]` entries.
    #[clap(long)]
    weights: Option<PathBuf>,

    /// Create trees but skip writing or printing them.
    #[clap(long)]
    dry_run: bool,
}

impl GenerateCommand {
    pub fn run(self, global_options: GlobalOptions) -> anyhow::Result<()> {
        let data = fs::read(&self.graph)
            .with_context(|| format!("Reading {}", self.graph.display()))?;
        let graph: GrammarGraph =
            serde_json::from_slice(&data).context("Parsing the grammar graph")?;

        let start_rule = self.rule.as_deref().unwrap_or(&graph.default_rule);
        if graph.rule_by_display_name(start_rule).is_none() {
            bail!("unknown start rule {start_rule:?}");
        }

        let static_weights = self
            .weights
            .as_deref()
            .map(|path| -> anyhow::Result<HashMap<AltKey, f64>> {
                let data =
                    fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
                let entries: Vec<(String, usize, usize, f64)> =
                    serde_json::from_slice(&data).context("Parsing the weights file")?;
                Ok(entries
                    .into_iter()
                    .map(|(rule, alternation, alternative, weight)| {
                        ((rule, alternation, alternative), weight)
                    })
                    .collect())
            })
            .transpose()?;
        let cooldown_weights: Arc<Mutex<HashMap<AltKey, f64>>> = Arc::default();

        (0..self.count)
            .into_par_iter()
            .map_init(
                || self.build_tool(&graph, &static_weights, &cooldown_weights, &global_options),
                |tool, index| -> anyhow::Result<()> {
                    let tool = match tool {
                        Ok(tool) => tool,
                        Err(error) => bail!("setting up the generator failed: {error}"),
                    };
                    if let Some(seed) = global_options.random_seed {
                        tool.reseed(seed + index as u64);
                    }
                    tool.create_test(index)
                        .with_context(|| format!("Creating test case #{index}"))?;
                    Ok(())
                },
            )
            .collect::<Result<Vec<()>, _>>()?;

        info!(count = self.count, "test case creation finished");
        Ok(())
    }

    fn build_tool<'g>(
        &self,
        graph: &'g GrammarGraph,
        static_weights: &Option<HashMap<AltKey, f64>>,
        cooldown_weights: &Arc<Mutex<HashMap<AltKey, f64>>>,
        global_options: &GlobalOptions,
    ) -> anyhow::Result<GeneratorTool<'g>> {
        let mut tool = GeneratorTool::new(graph)
            .with_limit(RuleSize::new(self.max_depth, self.max_tokens))
            .with_creators(
                !self.no_generate,
                !self.no_mutate,
                !self.no_recombine,
                !self.no_unrestricted,
            )
            .with_keep_trees(self.keep_trees)
            .with_memo(self.memo_size, self.unique_attempts)
            .with_dry_run(self.dry_run);
        if let Some(rule) = &self.rule {
            tool = tool.with_rule(rule);
        }
        if let Some(out) = &self.out {
            tool = tool.with_out_format(out);
        }
        if let Some(seed) = global_options.random_seed {
            tool = tool.with_seed(seed);
        }
        if let Some(directory) = &self.population {
            let population = FilePopulation::new(
                directory,
                self.tree_format.extension(),
                self.tree_format.codec(),
            )
            .context("Opening the population")?;
            tool = tool.with_population(Box::new(population));
        }
        if self.space_serializer {
            tool = tool.with_serializer(simple_space_serializer);
        }
        if self.space_transformer {
            tool = tool.with_transformers(vec![simple_space_transformer]);
        }

        let static_weights = static_weights.clone();
        let cooldown = self.cooldown;
        let cooldown_weights = Arc::clone(cooldown_weights);
        tool = tool.with_model_factory(Box::new(move |seed| {
            let mut model: Box<dyn Model> = Box::new(DefaultModel::with_seed(seed));
            if let Some(weights) = &static_weights {
                model = Box::new(WeightedModel::new(model, weights.clone()));
            }
            if let Some(factor) = cooldown {
                model = Box::new(CooldownModel::new(
                    model,
                    factor,
                    Arc::clone(&cooldown_weights),
                ));
            }
            model
        }));
        Ok(tool)
    }
}
