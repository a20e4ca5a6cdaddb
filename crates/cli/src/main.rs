//! MeshLM CLI
//!
//! Runs Llama 2 chat and text completion on a simulated device mesh, and
//! prints sharding plans for a checkpoint's params.json.
//!
//! Settings are resolved in order: defaults, `--config` TOML file,
//! `MESHLM_*` environment variables, command-line flags.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshlm_core::{Mesh, MeshConfig, RuntimeConfig, ShardingPlan};
use meshlm_model::kv_cache::KvCacheConfig;
use meshlm_model::{Dialog, Llama, Message, ModelArgs};

#[derive(Parser)]
#[command(name = "meshlm")]
#[command(version)]
#[command(about = "Llama 2 inference over a sharded device mesh with a static KV cache")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat completion over a batch of dialogs
    Chat {
        #[command(flatten)]
        model: ModelOpts,

        /// User message
        #[arg(short, long, default_value = "Hello!! How are you?")]
        prompt: String,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Number of copies of the dialog in the batch (defaults to max batch size)
        #[arg(long)]
        replicate: Option<usize>,

        /// Print predictions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Text completion for one or more prompts
    Complete {
        #[command(flatten)]
        model: ModelOpts,

        /// Prompt to complete (repeatable)
        #[arg(short, long, required = true)]
        prompt: Vec<String>,

        /// Include the prompt in the output
        #[arg(long)]
        echo: bool,
    },

    /// Print the weight sharding plan for a mesh
    Plan {
        /// Path to params.json
        #[arg(long)]
        params: PathBuf,

        /// Mesh shape, `DxM` (data x model) or `M`
        #[arg(long, default_value = "1x1")]
        mesh: MeshConfig,

        /// Vocabulary size when params.json leaves it unset
        #[arg(long, default_value = "32000")]
        vocab_size: usize,

        /// Plan INT8 weights
        #[arg(long)]
        quantize: bool,

        #[arg(long, default_value = "1024")]
        max_seq_len: usize,

        #[arg(long, default_value = "8")]
        max_batch_size: usize,
    },
}

/// Options shared by the generation commands
#[derive(Args)]
struct ModelOpts {
    /// Checkpoint directory (params.json + *.safetensors)
    #[arg(long)]
    ckpt_dir: Option<PathBuf>,

    /// Path to tokenizer.json
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long)]
    max_seq_len: Option<usize>,

    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Mesh shape, `DxM` (data x model) or `M`
    #[arg(long)]
    mesh: Option<MeshConfig>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    max_gen_len: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Store linear weights as INT8
    #[arg(long)]
    quantize: bool,
}

impl ModelOpts {
    fn resolve(&self, config_path: Option<&PathBuf>) -> Result<RuntimeConfig> {
        let mut config = match config_path {
            Some(path) => RuntimeConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        config.apply_env();

        if let Some(dir) = &self.ckpt_dir {
            config.ckpt_dir = dir.clone();
        }
        if let Some(path) = &self.tokenizer {
            config.tokenizer_path = path.clone();
        }
        if let Some(n) = self.max_seq_len {
            config.max_seq_len = n;
        }
        if let Some(n) = self.max_batch_size {
            config.max_batch_size = n;
        }
        if let Some(mesh) = self.mesh {
            config.mesh = mesh;
        }
        if let Some(t) = self.temperature {
            config.generation.temperature = t;
        }
        if let Some(p) = self.top_p {
            config.generation.top_p = p;
        }
        if self.max_gen_len.is_some() {
            config.generation.max_gen_len = self.max_gen_len;
        }
        if let Some(seed) = self.seed {
            config.generation.seed = seed;
        }
        config.quantize |= self.quantize;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshlm=info,meshlm_model=info,meshlm_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Chat {
            model,
            prompt,
            system,
            replicate,
            json,
        } => {
            let config = model.resolve(cli.config.as_ref())?;
            run_chat(&config, prompt, system, replicate, json)
        }
        Commands::Complete { model, prompt, echo } => {
            let mut config = model.resolve(cli.config.as_ref())?;
            config.generation.echo = echo;
            run_complete(&config, &prompt)
        }
        Commands::Plan {
            params,
            mesh,
            vocab_size,
            quantize,
            max_seq_len,
            max_batch_size,
        } => run_plan(&params, mesh, vocab_size, quantize, max_seq_len, max_batch_size),
    }
}

fn run_chat(
    config: &RuntimeConfig,
    prompt: String,
    system: Option<String>,
    replicate: Option<usize>,
    json: bool,
) -> Result<()> {
    let copies = replicate.unwrap_or(config.max_batch_size);
    if copies == 0 || copies > config.max_batch_size {
        bail!(
            "--replicate must be between 1 and max batch size {}, got {copies}",
            config.max_batch_size
        );
    }

    let mut dialog: Dialog = Vec::new();
    if let Some(system) = system {
        dialog.push(Message::system(system));
    }
    dialog.push(Message::user(prompt));
    let dialogs = vec![dialog; copies];

    let mut generator = Llama::build(config).context("building model")?;
    let start = Instant::now();
    let (results, tokens) = generator.chat_completion(&dialogs, &config.generation)?;
    let elapsed = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (dialog, result) in dialogs.iter().zip(&results) {
            for msg in dialog {
                println!("{:?}: {}\n", msg.role, msg.content);
            }
            println!("> Assistant: {}", result.generation.content);
            println!("\n==================================\n");
        }
    }

    let generated: usize = tokens.iter().map(Vec::len).sum();
    tracing::info!(
        "Generated {} tokens for {} dialogs in {:.2}s ({:.1} tok/s)",
        generated,
        dialogs.len(),
        elapsed.as_secs_f64(),
        generated as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    Ok(())
}

fn run_complete(config: &RuntimeConfig, prompts: &[String]) -> Result<()> {
    let mut generator = Llama::build(config).context("building model")?;
    let results = generator.text_completion(prompts, &config.generation)?;
    for (prompt, result) in prompts.iter().zip(&results) {
        println!("{prompt}");
        println!("> {}", result.generation);
        println!("\n==================================\n");
    }
    Ok(())
}

fn run_plan(
    params: &Path,
    mesh: MeshConfig,
    vocab_size: usize,
    quantize: bool,
    max_seq_len: usize,
    max_batch_size: usize,
) -> Result<()> {
    let mesh = Mesh::from_config(&mesh)?;
    let (plan, cache) = build_plan(params, mesh, vocab_size, quantize, max_seq_len, max_batch_size)?;
    print!("{}", plan.summary());
    println!(
        "KV cache ({} x {} tokens): {:.2} GB total, {:.2} GB per device",
        max_batch_size,
        max_seq_len,
        cache.estimate_memory_gb(),
        cache.estimate_memory_gb() / mesh.size() as f64
    );
    Ok(())
}

/// Sharding plan and KV cache size for a params.json on `mesh`
fn build_plan(
    params: &Path,
    mesh: Mesh,
    vocab_size: usize,
    quantize: bool,
    max_seq_len: usize,
    max_batch_size: usize,
) -> Result<(ShardingPlan, KvCacheConfig)> {
    let mut args = ModelArgs::from_json_file(params)
        .with_context(|| format!("reading {}", params.display()))?;
    if args.vocab_size <= 0 {
        args.vocab_size = vocab_size as i64;
    }
    args.max_seq_len = max_seq_len;
    args.max_batch_size = max_batch_size;
    args.validate(mesh.model_size())
        .with_context(|| format!("invalid model in {}", params.display()))?;

    let plan = ShardingPlan::for_model(args.dims()?, mesh, if quantize { 1 } else { 4 })?;
    let cache = KvCacheConfig {
        max_batch_size,
        max_seq_len,
        num_layers: args.n_layers,
        num_kv_heads: args.kv_heads(),
        head_dim: args.head_dim(),
    };
    Ok((plan, cache))
}
