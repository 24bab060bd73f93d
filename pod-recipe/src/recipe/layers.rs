use anyhow::Result;
use blake3;
use log::debug;
use std::path::Path;

use super::{Instruction, Recipe, Stage};
use crate::{error::RecipeError, hasher::DigestHasher};

/// Cache key of one Containerfile instruction. A key covers the instruction,
/// the content it copies and every key before it, so a layer is reused
/// exactly when nothing it depends on has changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerKey {
    pub stage: Stage,
    pub instruction: String,
    pub key: blake3::Hash,
}

impl Recipe {
    pub fn layer_keys<P: AsRef<Path>>(&self, context: P) -> Result<Vec<LayerKey>> {
        let context = context.as_ref();
        let mut keys: Vec<LayerKey> = Vec::new();

        for (stage, instructions) in self.stages() {
            for instruction in instructions {
                let mut hasher = blake3::Hasher::new();
                if let Some(previous) = keys.last() {
                    hasher.update(previous.key.as_bytes());
                }

                let rendered = instruction.to_string();
                hasher.input(&rendered);

                if let Instruction::Copy { source, tree, .. } = &instruction {
                    let path = context.join(source);
                    if *tree {
                        if !path.is_dir() {
                            return Err(RecipeError::MissingPayload(path).into());
                        }
                        hasher.input_tree(context, &path)?;
                    } else {
                        if !path.is_file() {
                            return Err(RecipeError::MissingManifest(path).into());
                        }
                        hasher.input_file(&path)?;
                    }
                }

                let key = hasher.finalize();
                debug!("{} layer {:?} -> {}", stage, rendered, key.to_hex());
                keys.push(LayerKey {
                    stage,
                    instruction: rendered,
                    key,
                });
            }
        }

        Ok(keys)
    }

    /// Key of the final layer, used to label the built image.
    pub fn image_hash<P: AsRef<Path>>(&self, context: P) -> Result<String> {
        let keys = self.layer_keys(context)?;
        let last = keys
            .last()
            .map(|layer| layer.key.to_hex().to_string())
            .unwrap_or_default();
        Ok(last)
    }
}
