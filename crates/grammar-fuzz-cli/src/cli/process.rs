use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use grammar_fuzz::compiler::Compiler;
use grammar_fuzz::compiler::ast::GrammarAst;
use indexmap::IndexMap;
use tracing::info;

use super::GlobalOptions;

#[derive(Debug, clap::Parser)]
pub struct ProcessCommand {
    /// Grammar AST files (JSON) — a lexer and a parser grammar, or a
    /// single combined grammar.
    grammars: Vec<PathBuf>,

    /// Path of the compiled grammar graph (default: `<Name>.json` next to
    /// the current directory).
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Rule to start generation from (default: the first rule of the
    /// parser or combined grammar).
    #[clap(short, long)]
    rule: Option<String>,

    /// Wildcard resolution policy: any_ascii_letter, any_ascii_char or
    /// any_unicode_char.
    #[clap(long)]
    dot: Option<String>,

    /// Disregard inline actions and semantic predicates.
    #[clap(long)]
    no_actions: bool,

    /// Additional directory to resolve grammar imports against.
    #[clap(long)]
    lib_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        if self.grammars.is_empty() {
            bail!("no grammar files given");
        }

        let mut lexer: Option<GrammarAst> = None;
        let mut parser: Option<GrammarAst> = None;
        for path in &self.grammars {
            let ast = load_grammar(path, self.lib_dir.as_deref())
                .with_context(|| format!("Loading grammar {}", path.display()))?;
            // Lexer and combined grammars occupy the lexer slot so their
            // token definitions are processed first.
            if ast.has_lexer_rules() {
                lexer = Some(ast);
            } else {
                parser = Some(ast);
            }
        }

        let mut compiler = Compiler::new();
        if let Some(rule) = &self.rule {
            compiler = compiler.with_default_rule(rule);
        }
        if let Some(dot) = &self.dot {
            let mut options = IndexMap::new();
            options.insert("dot".to_owned(), dot.clone());
            compiler = compiler.with_options(options);
        }
        if self.no_actions {
            compiler = compiler.without_actions();
        }

        let graph = compiler
            .compile(lexer.as_ref(), parser.as_ref())
            .context("Compiling the grammar")?;
        graph.analyze(None);

        let out = self
            .out
            .unwrap_or_else(|| PathBuf::from(format!("{}.json", graph.name)));
        fs::write(&out, serde_json::to_vec(&graph).context("Encoding the grammar graph")?)
            .with_context(|| format!("Writing {}", out.display()))?;
        info!(path = %out.display(), "compiled grammar graph written");
        Ok(())
    }
}

/// Loads a grammar AST and folds the rules of its (transitive) imports
/// into it. Imports resolve against the library directory first, then
/// against the importing grammar's directory.
fn load_grammar(path: &Path, lib_dir: Option<&Path>) -> anyhow::Result<GrammarAst> {
    let mut root: GrammarAst = read_ast(path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut work_list = root.imports.clone();
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(name) = work_list.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let file = format!("{name}.json");
        let candidate = lib_dir
            .map(|dir| dir.join(&file))
            .filter(|p| p.exists())
            .unwrap_or_else(|| base_dir.join(&file));
        let imported = read_ast(&candidate)
            .with_context(|| format!("Resolving import {name:?}"))?;
        work_list.extend(imported.imports);
        root.rules.extend(imported.rules);
    }
    Ok(root)
}

fn read_ast(path: &Path) -> anyhow::Result<GrammarAst> {
    let data = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Parsing {}", path.display()))
}
