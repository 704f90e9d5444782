use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use grammar_fuzz::graph::GrammarGraph;
use grammar_fuzz::parse::{ParseNode, ParserAdapter};
use grammar_fuzz::population::{FilePopulation, Population as _};
use grammar_fuzz::serializer::simple_space_transformer;
use tracing::{info, warn};

use super::{GlobalOptions, TreeFormat};

#[derive(Debug, clap::Parser)]
pub struct ParseCommand {
    /// Compiled grammar graph produced by `process`.
    graph: PathBuf,

    /// Parse-tree files (JSON) produced by the external parser.
    trees: Vec<PathBuf>,

    /// Directory of the tree population to extend.
    #[clap(short, long)]
    population: PathBuf,

    #[clap(long, value_enum, default_value = "binary")]
    tree_format: TreeFormat,

    /// Hidden rule names to keep in the trees.
    #[clap(long)]
    hidden: Vec<String>,

    /// Discard trees containing unrecognized tokens.
    #[clap(long)]
    strict: bool,

    /// Discard trees deeper than this.
    #[clap(long, default_value_t = usize::MAX)]
    max_depth: usize,

    /// Append a space token after every parser-rule child.
    #[clap(long)]
    space_transformer: bool,
}

impl ParseCommand {
    pub fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        let data = fs::read(&self.graph)
            .with_context(|| format!("Reading {}", self.graph.display()))?;
        let graph: GrammarGraph =
            serde_json::from_slice(&data).context("Parsing the grammar graph")?;

        let mut adapter = ParserAdapter::new(&graph)
            .with_hidden(self.hidden.clone())
            .with_max_depth(self.max_depth)
            .with_strict(self.strict);
        if self.space_transformer {
            adapter = adapter.with_transformers(vec![simple_space_transformer]);
        }

        let mut population = FilePopulation::new(
            &self.population,
            self.tree_format.extension(),
            self.tree_format.codec(),
        )
        .context("Opening the population")?;

        let mut added = 0usize;
        for path in &self.trees {
            info!(path = %path.display(), "processing file");
            let parse_node: ParseNode = match fs::read(path)
                .map_err(anyhow::Error::from)
                .and_then(|data| serde_json::from_slice(&data).map_err(Into::into))
            {
                Ok(node) => node,
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to read parse tree");
                    continue;
                }
            };
            match adapter.adapt(&parse_node) {
                Ok(tree) => {
                    population
                        .add_individual(&tree, Some(path))
                        .with_context(|| format!("Storing the tree of {}", path.display()))?;
                    added += 1;
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to adapt parse tree");
                }
            }
        }
        info!(added, total = self.trees.len(), "population extended");
        Ok(())
    }
}
