//! Populations: stores of individuals that mutation and recombination
//! draw from, with a pluggable selection strategy.

use std::cell::OnceCell;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::annotations::Annotations;
use crate::codec::{AnnotatedTreeCodec, CodecError};
use crate::tree::Tree;

#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    #[error("the population is empty")]
    Empty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A population entry: a tree with lazily derived annotations.
#[derive(Debug)]
pub struct Individual {
    tree: Tree,
    annotations: OnceCell<Annotations>,
}

impl Individual {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            annotations: OnceCell::new(),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The associated annotations, computed on first access.
    pub fn annotations(&self) -> &Annotations {
        self.annotations.get_or_init(|| Annotations::new(&self.tree))
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

/// Abstract store of individuals.
pub trait Population {
    fn empty(&self) -> bool;

    /// Adds a tree; `path` is the test case the tree corresponds to, used
    /// to derive a debuggable storage name.
    fn add_individual(&mut self, tree: &Tree, path: Option<&Path>) -> Result<(), PopulationError>;

    /// Selects an individual. With `recipient` of `None` the caller wants
    /// a mutation or recombination recipient; otherwise a donor to cross
    /// with the given recipient (which may select the same underlying
    /// tree again).
    fn select_individual(
        &mut self,
        recipient: Option<&Individual>,
    ) -> Result<Individual, PopulationError>;
}

/// File-backed population: one encoded tree per file in a directory,
/// selected uniformly at random.
pub struct FilePopulation {
    directory: PathBuf,
    extension: String,
    codec: Box<dyn AnnotatedTreeCodec>,
    files: Vec<PathBuf>,
    rng: StdRng,
}

impl std::fmt::Debug for FilePopulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePopulation")
            .field("directory", &self.directory)
            .field("extension", &self.extension)
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

impl FilePopulation {
    pub fn new(
        directory: impl Into<PathBuf>,
        extension: impl Into<String>,
        codec: Box<dyn AnnotatedTreeCodec>,
    ) -> Result<Self, PopulationError> {
        let directory = directory.into();
        let extension = extension.into();
        fs::create_dir_all(&directory)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| *ext == *extension) {
                files.push(path);
            }
        }
        Ok(Self {
            directory,
            extension,
            codec,
            files,
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Derives the storage stem from the test case path: the base name up
    /// to the first period, with a fixed fallback.
    fn stem(path: Option<&Path>) -> String {
        path.and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').next())
            .filter(|stem| !stem.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| "tree".to_owned())
    }

}

impl Population for FilePopulation {
    fn empty(&self) -> bool {
        self.files.is_empty()
    }

    fn add_individual(&mut self, tree: &Tree, path: Option<&Path>) -> Result<(), PopulationError> {
        let encoded = self
            .codec
            .encode_annotated(tree, None)
            .map_err(PopulationError::Codec)?;
        // Write-then-rename so that concurrent readers never observe a
        // half-written individual.
        let mut temp = tempfile::NamedTempFile::new_in(&self.directory)?;
        temp.write_all(&encoded)?;
        let unique: u64 = self.rng.random();
        let final_path = self.directory.join(format!(
            "{}.{unique:016x}.{}",
            Self::stem(path),
            self.extension
        ));
        temp.persist(&final_path).map_err(|e| e.error)?;
        self.files.push(final_path);
        Ok(())
    }

    fn select_individual(
        &mut self,
        _recipient: Option<&Individual>,
    ) -> Result<Individual, PopulationError> {
        while !self.files.is_empty() {
            let slot = self.rng.random_range(0..self.files.len());
            let path = &self.files[slot];
            let loaded = fs::read(path)
                .map_err(PopulationError::Io)
                .and_then(|data| Ok(self.codec.decode_annotated(&data)?));
            match loaded {
                Ok((tree, annotations)) => {
                    let individual = Individual::new(tree);
                    if let Some(annotations) = annotations {
                        let _ = individual.annotations.set(annotations);
                    }
                    return Ok(individual);
                }
                Err(error) => {
                    // Skip individuals that no longer decode; they stay on
                    // disk for postmortem but leave the selection pool.
                    warn!(path = %path.display(), %error, "failed to load individual");
                    self.files.swap_remove(slot);
                }
            }
        }
        Err(PopulationError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonTreeCodec;
    use crate::tree::{NodeKind, RuleSize};

    fn token_tree(src: &str) -> Tree {
        let mut tree = Tree::new(NodeKind::UnparserRule { name: "S".into() });
        let root = tree.root();
        let token = tree.add_node(NodeKind::UnlexerRule {
            name: Some("A".into()),
            src: Some(src.into()),
            size: RuleSize::new(1, 1),
            immutable: false,
        });
        tree.add_child(root, token);
        tree
    }

    #[test]
    fn add_then_select_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut population =
            FilePopulation::new(dir.path(), "grt", Box::new(JsonTreeCodec)).unwrap();
        assert!(population.empty());

        let tree = token_tree("x");
        population
            .add_individual(&tree, Some(Path::new("case_1.txt")))
            .unwrap();
        assert!(!population.empty());

        let individual = population.select_individual(None).unwrap();
        assert!(individual.tree().structural_eq(&tree));
        // Annotations derive lazily on demand.
        assert_eq!(individual.annotations().tokens(individual.tree().root()), 2);
    }

    #[test]
    fn storage_names_derive_from_test_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut population =
            FilePopulation::new(dir.path(), "grt", Box::new(JsonTreeCodec)).unwrap();
        population
            .add_individual(&token_tree("x"), Some(Path::new("/out/test.42.txt")))
            .unwrap();
        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.starts_with("test."), "unexpected name {name}");
        assert!(name.ends_with(".grt"));
    }

    #[test]
    fn reopening_scans_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut population =
                FilePopulation::new(dir.path(), "grt", Box::new(JsonTreeCodec)).unwrap();
            population.add_individual(&token_tree("x"), None).unwrap();
        }
        let mut population =
            FilePopulation::new(dir.path(), "grt", Box::new(JsonTreeCodec)).unwrap();
        assert_eq!(population.len(), 1);
        assert!(population.select_individual(None).is_ok());
    }

    #[test]
    fn malformed_individuals_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.grt"), b"not a tree").unwrap();
        let mut population =
            FilePopulation::new(dir.path(), "grt", Box::new(JsonTreeCodec)).unwrap();
        assert_eq!(population.len(), 1);
        assert!(matches!(
            population.select_individual(None),
            Err(PopulationError::Empty)
        ));
    }
}
