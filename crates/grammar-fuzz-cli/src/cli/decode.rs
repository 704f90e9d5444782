use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use grammar_fuzz::codec::{BinaryTreeCodec, JsonTreeCodec, TreeCodec as _};
use grammar_fuzz::serializer::{concat_serializer, simple_space_serializer};
use grammar_fuzz::tree::Tree;
use tracing::warn;

use super::GlobalOptions;

#[derive(Debug, clap::Parser)]
pub struct DecodeCommand {
    /// Persisted tree files, in either wire format.
    trees: Vec<PathBuf>,

    /// Output file pattern; a `%d` placeholder is replaced by the input
    /// index. Tests print to stdout when omitted.
    #[clap(short, long)]
    out: Option<String>,

    /// Join tokens with spaces instead of concatenating them.
    #[clap(long)]
    space_serializer: bool,
}

impl DecodeCommand {
    pub fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        let serializer = if self.space_serializer {
            simple_space_serializer
        } else {
            concat_serializer
        };

        for (index, path) in self.trees.iter().enumerate() {
            let data =
                fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
            // Both wire formats are accepted; try the binary one first.
            let tree: Tree = match BinaryTreeCodec
                .decode(&data)
                .or_else(|_| JsonTreeCodec.decode(&data))
            {
                Ok(tree) => tree,
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to decode tree");
                    continue;
                }
            };
            let test = serializer(&tree);
            match &self.out {
                Some(pattern) => {
                    let out = PathBuf::from(pattern.replace("%d", &index.to_string()));
                    if let Some(parent) = out.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&out, test.as_bytes())
                        .with_context(|| format!("Writing {}", out.display()))?;
                }
                None => println!("{test}"),
            }
        }
        Ok(())
    }
}
