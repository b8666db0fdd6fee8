use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_nn::VarMap;
use clap::{ArgGroup, Args, Parser, Subcommand};
use tracing::info;

use captune::model::{AdapterBuilder, AdapterMetadata, ModelAssets};
use captune::{
    CaptionConfig, CaptionDataset, CaptionModel, CaptionProcessor, Captioner, Collator,
    ComputeProfile, GenerationParams, LoraConfig, ProcessorConfig, TrainConfig, Trainer,
    DEFAULT_MODEL_ID,
};

#[derive(Parser)]
#[command(name = "captune")]
#[command(about = "LoRA fine-tuning, inference and evaluation for image captioning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a captioning model with a low-rank adapter
    Train(TrainArgs),
    /// Caption a single image or a JSONL batch
    Caption(CaptionArgs),
    /// Score a predictions file against its references
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Training dataset (JSONL with image_path/text per line)
    #[arg(long, default_value = "data/train.jsonl")]
    train_jsonl: PathBuf,

    /// Optional validation dataset
    #[arg(long)]
    val_jsonl: Option<PathBuf>,

    /// Base model: hub id or local directory
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Output directory for the trained adapter
    #[arg(long, default_value = "outputs/lora_adapter")]
    out_dir: PathBuf,

    /// Micro-batch size
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Micro-batches per optimizer step
    #[arg(long, default_value_t = 4)]
    grad_accum: usize,

    /// Number of epochs
    #[arg(long, default_value_t = 1)]
    epochs: usize,

    /// Peak learning rate
    #[arg(long, default_value_t = 2e-4)]
    lr: f64,

    /// Warmup steps
    #[arg(long, default_value_t = 200)]
    warmup_steps: usize,

    /// Hard cap on training steps
    #[arg(long, default_value_t = 2000)]
    max_train_steps: usize,

    /// Shuffling seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Adapter rank
    #[arg(long, default_value_t = 8)]
    lora_rank: usize,

    /// Adapter alpha
    #[arg(long, default_value_t = 16.0)]
    lora_alpha: f64,

    /// Adapter dropout
    #[arg(long, default_value_t = 0.05)]
    lora_dropout: f32,
}

#[derive(Args)]
#[command(group(ArgGroup::new("input").required(true).args(["image", "jsonl"])))]
struct CaptionArgs {
    /// Path to an image file
    #[arg(long)]
    image: Option<PathBuf>,

    /// Path to a JSONL file with an image_path field per row
    #[arg(long)]
    jsonl: Option<PathBuf>,

    /// Base model: hub id or local directory
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Directory of a trained adapter to attach
    #[arg(long)]
    adapter: Option<PathBuf>,

    /// Cap on generated tokens
    #[arg(long, default_value_t = 40)]
    max_new_tokens: usize,

    /// Beam width
    #[arg(long, default_value_t = 3)]
    num_beams: usize,

    /// Limit number of captioned rows for --jsonl (0 = all)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Where to save predictions (only for --jsonl mode)
    #[arg(long, default_value = "outputs/predictions/preds.jsonl")]
    out: PathBuf,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Predictions JSONL (rows need text and pred_text)
    #[arg(long)]
    preds: PathBuf,

    /// Metrics report output path
    #[arg(long, default_value = "outputs/metrics.json")]
    out_metrics: PathBuf,

    /// Samples report output path
    #[arg(long, default_value = "outputs/samples.md")]
    out_samples: PathBuf,

    /// Maximum number of triples in the samples report
    #[arg(long, default_value_t = 50)]
    max_samples: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Caption(args) => run_caption(args),
        Commands::Evaluate(args) => run_evaluate(args),
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let profile = ComputeProfile::detect()?;
    profile
        .require_accelerator()
        .context("training must run on an accelerator, not the CPU fallback")?;
    info!(device = ?profile.kind, dtype = ?profile.dtype, "resolved compute profile");

    let dataset =
        CaptionDataset::load(&args.train_jsonl).context("loading the training dataset")?;
    let val_dataset = args
        .val_jsonl
        .as_deref()
        .map(CaptionDataset::load)
        .transpose()
        .context("loading the validation dataset")?;

    let assets = ModelAssets::resolve(&args.model).context("resolving base model assets")?;
    let processor = Arc::new(CaptionProcessor::from_files(
        &assets.tokenizer,
        ProcessorConfig::default(),
    )?);

    let lora = LoraConfig {
        rank: args.lora_rank,
        alpha: args.lora_alpha,
        dropout: args.lora_dropout,
        ..Default::default()
    };
    let model_config = CaptionConfig::blip_base();
    let varmap = VarMap::new();
    let adapters = AdapterBuilder::new(lora.clone(), &varmap, &profile.device)?;
    let weights = assets.load_weights(profile.dtype, &profile.device)?;
    let model = CaptionModel::new(&model_config, weights, Some(&adapters))
        .context("building the adapter-augmented model")?;

    let train_config = TrainConfig {
        batch_size: args.batch_size,
        grad_accum_steps: args.grad_accum,
        epochs: args.epochs,
        learning_rate: args.lr,
        warmup_steps: args.warmup_steps,
        max_steps: args.max_train_steps,
        seed: args.seed,
        ..Default::default()
    };
    let mut trainer = Trainer::new(
        model,
        varmap,
        Collator::new(processor.clone()),
        profile,
        train_config,
    )?;
    let report = trainer.train(&dataset, val_dataset.as_ref())?;

    let metadata = AdapterMetadata::new(&args.model, &lora, model_config.text.num_hidden_layers);
    trainer.save_adapter(&args.out_dir, &metadata, &processor)?;
    if let Some(loss) = report.final_loss {
        info!(final_loss = loss, steps = report.steps, "done");
    }
    println!("Saved LoRA adapter to: {}", args.out_dir.display());
    Ok(())
}

fn run_caption(args: CaptionArgs) -> Result<()> {
    let profile = ComputeProfile::detect()?;
    let captioner = Captioner::load(&args.model, args.adapter.as_deref(), profile)
        .context("loading the caption model")?;
    let params = GenerationParams {
        max_new_tokens: args.max_new_tokens,
        num_beams: args.num_beams,
    };

    if let Some(image) = &args.image {
        if !image.exists() {
            bail!("Image not found: {}", image.display());
        }
        let caption = captioner.caption(image, &params)?;
        println!("{caption}");
        return Ok(());
    }

    let input = args.jsonl.expect("clap enforces --image or --jsonl");
    if !input.exists() {
        bail!("jsonl not found: {}", input.display());
    }
    let limit = (args.limit > 0).then_some(args.limit);
    let stats = captioner.caption_file(&input, &args.out, &params, limit)?;
    println!(
        "Saved {} predictions to {}",
        stats.written,
        args.out.display()
    );
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    if !args.preds.exists() {
        bail!("preds file not found: {}", args.preds.display());
    }
    let report = captune::eval::evaluate_file(
        &args.preds,
        &args.out_metrics,
        &args.out_samples,
        args.max_samples,
    )?;
    println!("Saved metrics to: {}", args.out_metrics.display());
    println!("Saved samples to: {}", args.out_samples.display());
    println!(
        "Metrics: sacrebleu={:.2} rouge1={:.4} rouge2={:.4} rougeL={:.4} rougeLsum={:.4} n={}",
        report.sacrebleu, report.rouge1, report.rouge2, report.rouge_l, report.rouge_lsum, report.n
    );
    Ok(())
}
