use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use loramix_common::{parse_token_lines, LoramixConfig};
use loramix_core::{GatedModel, LoraTransformer, ModelInput};
use loramix_train::{make_batches, GatingTrainer, LrDecay, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "loramix", about = "Gated mixture of LoRA experts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default backbone + gating config.
    Init(InitArgs),
    /// Build the model, attach gating and report slots and parameters.
    Inspect(InspectArgs),
    /// Run one gated forward over a token sequence.
    Predict(PredictArgs),
    /// Train the gating classifier against frozen experts.
    Train(TrainArgs),
}

#[derive(Parser, Debug)]
struct InitArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct ModelArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Backbone + expert weights (safetensors). Random init when omitted.
    #[arg(long)]
    backbone_weights: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Parser, Debug)]
struct PredictArgs {
    #[command(flatten)]
    model: ModelArgs,
    /// Comma-separated token ids.
    #[arg(long, value_delimiter = ',', required = true)]
    tokens: Vec<u32>,
    /// Directory written by `train` or `save_classifier`.
    #[arg(long)]
    classifier_dir: Option<PathBuf>,
    /// Log the next N predicted coefficient tensors (shown with RUST_LOG=info).
    #[arg(long, default_value_t = 0)]
    print_predictions: usize,
    /// Write the predicted coefficients to this `.npy` file.
    #[arg(long)]
    log_to: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[command(flatten)]
    model: ModelArgs,
    /// Token ids, one sequence per line.
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value = "gating")]
    output_dir: PathBuf,
    /// Resume from a saved classifier.
    #[arg(long)]
    classifier_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 64)]
    seq_len: usize,
    #[arg(long, default_value_t = 1000)]
    max_steps: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 1e-5)]
    lr_min: f64,
    #[arg(long, default_value_t = 50)]
    lr_warmup_steps: usize,
    #[arg(long, default_value = "cosine", value_parser = ["cosine", "linear", "constant"])]
    lr_decay: String,
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,
    #[arg(long, default_value_t = 1.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f64,
    #[arg(long, default_value_t = 10)]
    log_every: usize,
    #[arg(long, default_value_t = 0)]
    save_every: usize,
    /// Batches held out for the final evaluation.
    #[arg(long, default_value_t = 4)]
    eval_batches: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => cmd_init(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::Predict(args) => cmd_predict(args),
        Command::Train(args) => cmd_train(args),
    }
}

fn build_model(args: &ModelArgs, device: &Device) -> Result<GatedModel<LoraTransformer>> {
    let config = LoramixConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate()?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let backbone = LoraTransformer::new(vb, &config.backbone)?;
    if let Some(path) = &args.backbone_weights {
        varmap
            .load(path)
            .with_context(|| format!("loading backbone weights {}", path.display()))?;
    }
    let model = GatedModel::attach(
        backbone,
        config.backbone.expert_names(),
        config.gating,
        DType::F32,
        device,
    )?;
    Ok(model)
}

fn load_classifier(model: &mut GatedModel<LoraTransformer>, dir: Option<&Path>) -> Result<()> {
    if let Some(dir) = dir {
        model
            .load_classifier(dir)
            .with_context(|| format!("loading classifier from {}", dir.display()))?;
    }
    Ok(())
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init(args: InitArgs) -> Result<()> {
    LoramixConfig::default().save(&args.output)?;
    eprintln!("Wrote default config to {}", args.output.display());
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let model = build_model(&args.model, &device)?;
    println!("experts: {}", model.expert_names().join(", "));
    println!("gated layers: {}", model.n_layers());
    for (i, name) in model.slot_names().iter().enumerate() {
        println!("  [{i:>3}] {name}");
    }
    println!("{}", model.parameter_report());
    Ok(())
}

fn cmd_predict(args: PredictArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mut model = build_model(&args.model, &device)?;
    load_classifier(&mut model, args.classifier_dir.as_deref())?;

    model.set_print_predictions(args.print_predictions);
    if args.log_to.is_some() {
        model.enable_logging();
    }

    let n = args.tokens.len();
    let ids = Tensor::from_vec(args.tokens, (1, n), &device)?;
    let mask = Tensor::ones((1, n), DType::U32, &device)?;
    let output = model.forward(&ModelInput::from_ids(ids).with_attention_mask(mask))?;

    let coefficients = model.channel().get()?;
    let names = model.expert_names();
    for (layer, row) in coefficients.to_vec3::<f32>()?[0].iter().enumerate() {
        let cells: Vec<String> = names
            .iter()
            .zip(row)
            .map(|(name, w)| format!("{name}={w:.4}"))
            .collect();
        println!("{:<24} {}", model.slot_names()[layer], cells.join("  "));
    }
    let next = output
        .logits
        .get(0)?
        .get(n - 1)?
        .argmax(D::Minus1)?
        .to_scalar::<u32>()?;
    println!("next token: {next}");

    if let Some(path) = &args.log_to {
        model.flush_log(path)?;
        eprintln!("Wrote coefficients to {}", path.display());
    }
    Ok(())
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mut model = build_model(&args.model, &device)?;
    load_classifier(&mut model, args.classifier_dir.as_deref())?;

    let sequences = parse_token_lines(&args.data)?;
    let mut batches = make_batches(&sequences, args.seq_len, args.batch_size, args.seed);
    if batches.is_empty() {
        anyhow::bail!(
            "no training batches; need at least {} windows of {} tokens",
            args.batch_size,
            args.seq_len + 1
        );
    }
    let eval = if batches.len() > args.eval_batches {
        batches.split_off(batches.len() - args.eval_batches)
    } else {
        Vec::new()
    };
    eprintln!(
        "Loaded {} sequences: {} train / {} eval batches",
        sequences.len(),
        batches.len(),
        eval.len()
    );

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        seq_len: args.seq_len,
        max_steps: args.max_steps,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: args.lr_decay.parse::<LrDecay>().map_err(anyhow::Error::msg)?,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        label_smoothing: args.label_smoothing,
        log_every: args.log_every,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
    };
    let mut trainer = GatingTrainer::new(model, trainer_config, device)?;

    let pb = ProgressBar::new(args.max_steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")?
            .progress_chars("=>-"),
    );
    for step in 0..args.max_steps {
        let i = step % batches.len();
        let m = trainer.step(&batches[i..i + 1])?;
        pb.set_message(format!("loss {:.4} lr {:.2e}", m.loss, m.lr));
        pb.inc(1);
        if args.save_every > 0 && trainer.global_step % args.save_every == 0 {
            let dir = trainer.save_checkpoint()?;
            pb.println(format!("saved {}", dir.display()));
        }
    }
    pb.finish_with_message("done");

    if !eval.is_empty() {
        let (loss, ppl) = trainer.evaluate(&eval)?;
        eprintln!("eval loss {loss:.4} perplexity {ppl:.2}");
    }
    trainer.save(&args.output_dir)?;
    eprintln!("Saved classifier to {}", args.output_dir.display());
    Ok(())
}
