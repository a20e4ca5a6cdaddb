//! Checkpoint loading
//!
//! A checkpoint directory holds Meta's `params.json` and one or more
//! `*.safetensors` files using the Meta tensor names
//! (`layers.{i}.attention.wq.weight`, ...). Files are memory-mapped and
//! tensors are decoded to f32 on demand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::Mmap;
use safetensors::SafeTensors;

use meshlm_core::{decode_f32, DType};

use crate::args::ModelArgs;
use crate::error::{ModelError, Result};
use crate::weights::{LayerWeights, ModelWeights};

/// Memory-mapped safetensors checkpoint
pub struct CheckpointLoader {
    ckpt_dir: PathBuf,
    args: ModelArgs,
    /// Memory-mapped files, sorted by name
    mmaps: Vec<(String, Mmap)>,
    /// Tensor name -> index into `mmaps`
    index: HashMap<String, usize>,
}

impl CheckpointLoader {
    /// Open a checkpoint directory
    pub fn open(ckpt_dir: impl AsRef<Path>) -> Result<Self> {
        let ckpt_dir = ckpt_dir.as_ref().to_path_buf();
        let args = ModelArgs::from_json_file(&ckpt_dir.join("params.json"))?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&ckpt_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "safetensors") {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(ModelError::MissingWeight(format!(
                "no *.safetensors files in {}",
                ckpt_dir.display()
            )));
        }

        let mut mmaps = Vec::with_capacity(files.len());
        let mut index = HashMap::new();
        for path in files {
            let file = std::fs::File::open(&path)?;
            // The checkpoint is treated as immutable while mapped
            let mmap = unsafe { Mmap::map(&file)? };
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            {
                let tensors = SafeTensors::deserialize(&mmap)
                    .map_err(|e| ModelError::Safetensors(format!("{filename}: {e}")))?;
                for name in tensors.names() {
                    index.insert(name.to_string(), mmaps.len());
                }
            }
            mmaps.push((filename, mmap));
        }

        tracing::info!(
            "Opened checkpoint {} ({} files, {} tensors)",
            ckpt_dir.display(),
            mmaps.len(),
            index.len()
        );
        Ok(Self {
            ckpt_dir,
            args,
            mmaps,
            index,
        })
    }

    /// Hyperparameters from params.json
    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn ckpt_dir(&self) -> &Path {
        &self.ckpt_dir
    }

    /// All tensor names, sorted
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total bytes of the mapped files
    pub fn total_size_bytes(&self) -> usize {
        self.mmaps.iter().map(|(_, m)| m.len()).sum()
    }

    /// Load a tensor as f32, checking its shape
    pub fn load_f32(&self, name: &str, expected_shape: &[usize]) -> Result<Vec<f32>> {
        let &file_idx = self
            .index
            .get(name)
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))?;
        let (filename, mmap) = &self.mmaps[file_idx];

        let tensors = SafeTensors::deserialize(mmap)
            .map_err(|e| ModelError::Safetensors(format!("{filename}: {e}")))?;
        let tensor = tensors
            .tensor(name)
            .map_err(|_| ModelError::MissingWeight(name.to_string()))?;

        if tensor.shape() != expected_shape {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                got: tensor.shape().to_vec(),
            });
        }

        let dtype = DType::from_safetensors(tensor.dtype())?;
        Ok(decode_f32(tensor.data(), dtype)?)
    }

    fn load_layer(&self, args: &ModelArgs, layer_idx: usize) -> Result<LayerWeights> {
        let dim = args.dim;
        let q_dim = args.n_heads * args.head_dim();
        let kv_dim = args.kv_heads() * args.head_dim();
        let hidden = args.ffn_hidden_dim();
        let prefix = format!("layers.{layer_idx}");

        Ok(LayerWeights {
            wq: self.load_f32(&format!("{prefix}.attention.wq.weight"), &[q_dim, dim])?,
            wk: self.load_f32(&format!("{prefix}.attention.wk.weight"), &[kv_dim, dim])?,
            wv: self.load_f32(&format!("{prefix}.attention.wv.weight"), &[kv_dim, dim])?,
            wo: self.load_f32(&format!("{prefix}.attention.wo.weight"), &[dim, q_dim])?,
            w1: self.load_f32(&format!("{prefix}.feed_forward.w1.weight"), &[hidden, dim])?,
            w2: self.load_f32(&format!("{prefix}.feed_forward.w2.weight"), &[dim, hidden])?,
            w3: self.load_f32(&format!("{prefix}.feed_forward.w3.weight"), &[hidden, dim])?,
            attention_norm: self.load_f32(&format!("{prefix}.attention_norm.weight"), &[dim])?,
            ffn_norm: self.load_f32(&format!("{prefix}.ffn_norm.weight"), &[dim])?,
        })
    }

    /// Load every weight of the model described by `args`
    pub fn load_weights(&self, args: &ModelArgs) -> Result<ModelWeights> {
        let start = Instant::now();
        let vocab = args.vocab()?;
        let dim = args.dim;

        let tok_embeddings = self.load_f32("tok_embeddings.weight", &[vocab, dim])?;
        let mut layers = Vec::with_capacity(args.n_layers);
        for layer_idx in 0..args.n_layers {
            layers.push(self.load_layer(args, layer_idx)?);
            tracing::debug!("Loaded layer {}/{}", layer_idx + 1, args.n_layers);
        }
        let norm = self.load_f32("norm.weight", &[dim])?;
        let output = self.load_f32("output.weight", &[vocab, dim])?;

        tracing::info!(
            "Loaded {} layers from {} in {:.2}s",
            args.n_layers,
            self.ckpt_dir.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(ModelWeights {
            args: args.clone(),
            tok_embeddings,
            layers,
            norm,
            output,
        })
    }
}
