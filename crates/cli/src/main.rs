//! CLI tool for encoding conversation datasets with a chat template.
//!
//! This tool reads JSONL/CSV conversation files, encodes them into
//! `input_ids`/`labels`/`loss_scale` records with a registered template and
//! writes training/validation JSONL splits. It uses the HuggingFace
//! tokenizers Rust library for tokenization.

use std::path::PathBuf;

use clap::Parser;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dialog_encoder_core::{
    encode_dataset, get_template, load_all_examples, template_ids, write_jsonl_output, BindOptions,
    EncodeResult, PipelineConfig, PipelineResult, SpecialToken, TemplateError, Tokenizer,
    TruncationStrategy,
};

/// Encode conversation datasets into token id records.
#[derive(Parser, Debug)]
#[command(name = "dialog-encode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory containing .jsonl/.csv dataset files
    #[arg(long, required_unless_present = "list_templates")]
    data_root: Option<PathBuf>,

    /// Output directory for JSONL files
    #[arg(long, required_unless_present = "list_templates")]
    output_dir: Option<PathBuf>,

    /// HuggingFace tokenizer model name or path to a tokenizer.json
    #[arg(long, required_unless_present = "list_templates")]
    tokenizer: Option<String>,

    /// Registered template id
    #[arg(long, default_value = "default")]
    template: String,

    /// Maximum encoded length
    #[arg(long, default_value = "2048")]
    max_length: usize,

    /// Strategy for overlong examples (delete, truncation_left)
    #[arg(long, default_value = "delete")]
    truncation_strategy: String,

    /// Override the template's default system text ("" disables it)
    #[arg(long)]
    system: Option<String>,

    /// JSON file with additional binding options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Fraction of examples for validation (0.0-1.0)
    #[arg(long, default_value = "0.1")]
    val_ratio: f64,

    /// Print the registered template ids and exit
    #[arg(long)]
    list_templates: bool,
}

/// Wrapper around a HuggingFace tokenizer.
///
/// The Rust-native tokenizer is `Send + Sync`, so one instance is shared by
/// all encoding threads.
struct RustTokenizer {
    inner: HfTokenizer,
}

impl RustTokenizer {
    /// Load a tokenizer from a `tokenizer.json` path or a hub model name.
    fn load(name: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::path::Path::new(name);
        let inner = if path.is_file() {
            HfTokenizer::from_file(path)
        } else {
            HfTokenizer::from_pretrained(name, None)
        }
        .map_err(|e| e as Box<dyn std::error::Error>)?;
        Ok(Self { inner })
    }

    fn first_known(&self, candidates: &[&str]) -> Option<u32> {
        candidates.iter().find_map(|token| self.inner.token_to_id(token))
    }
}

impl Tokenizer for RustTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> EncodeResult<Vec<u32>> {
        self.inner
            .encode(text, add_special_tokens)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| TemplateError::Tokenizer(e.to_string()))
    }

    fn decode(&self, ids: &[u32]) -> EncodeResult<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| TemplateError::Tokenizer(e.to_string()))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn special_token_id(&self, token: SpecialToken) -> Option<u32> {
        match token {
            SpecialToken::Bos => self.first_known(&["<s>", "<|begin_of_text|>", "<bos>"]),
            SpecialToken::Eos => {
                self.first_known(&["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>", "<|im_end|>"])
            }
            SpecialToken::Pad => self.first_known(&["<pad>", "[PAD]", "<|pad|>"]),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    if args.list_templates {
        for id in template_ids() {
            println!("{id}");
        }
        return Ok(());
    }

    let data_root = args.data_root.clone().ok_or("--data-root is required")?;
    let output_dir = args.output_dir.clone().ok_or("--output-dir is required")?;
    let tokenizer_name = args.tokenizer.clone().ok_or("--tokenizer is required")?;

    info!("Loading tokenizer from {}...", tokenizer_name);
    let tokenizer = RustTokenizer::load(&tokenizer_name)?;

    let config = PipelineConfig {
        max_length: Some(args.max_length),
        truncation_strategy: TruncationStrategy::from(args.truncation_strategy.as_str()),
        system: args.system.clone(),
        val_ratio: args.val_ratio,
    };
    let options = match &args.options {
        Some(path) => {
            let file_options: BindOptions = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            BindOptions {
                default_system: config.system.clone().or(file_options.default_system.clone()),
                max_length: config.max_length,
                truncation_strategy: config.truncation_strategy.clone(),
                ..file_options
            }
        }
        None => config.bind_options(),
    };
    let template = get_template(&args.template, tokenizer, options)?;

    info!("Loading examples from {:?}...", data_root);
    let examples = load_all_examples(&data_root)?;
    info!("Loaded {} examples", examples.len());

    let dataset = encode_dataset(&examples, &template);
    info!(
        "Encoded {} examples ({} dropped, {} failed)",
        dataset.records.len(),
        dataset.dropped,
        dataset.failed
    );

    info!("Writing output to {:?}...", output_dir);
    let result: PipelineResult = write_jsonl_output(dataset, &output_dir, config.val_ratio)?;

    let metadata_path = output_dir.join("metadata.json");
    let metadata = serde_json::json!({
        "config": {
            "data_root": data_root.to_string_lossy(),
            "output_dir": output_dir.to_string_lossy(),
            "tokenizer": tokenizer_name,
            "template": args.template,
            "max_length": args.max_length,
            "truncation_strategy": args.truncation_strategy,
            "system": args.system,
            "val_ratio": args.val_ratio,
        },
        "template": {
            "meta": template.meta(),
            "stop_words": template.stop_words(),
        },
        "counts": {
            "total_examples": result.total_examples,
            "train_examples": result.train_examples,
            "val_examples": result.val_examples,
            "dropped_examples": result.dropped_examples,
            "failed_examples": result.failed_examples,
        },
        "stats": {
            "total_tokens": result.total_tokens,
            "length": result.length_stats,
        },
        "files": {
            "train_path": output_dir.join("training.jsonl").to_string_lossy(),
            "val_path": output_dir.join("validation.jsonl").to_string_lossy(),
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Template: {}", template.template_id());
    println!("  Total examples: {}", result.total_examples);
    println!("  Train examples: {}", result.train_examples);
    println!("  Val examples: {}", result.val_examples);
    println!("  Dropped (too long): {}", result.dropped_examples);
    println!("  Failed: {}", result.failed_examples);
    println!("  Lengths: {}", result.length_stats);
    println!("  Output: {:?}/{{training,validation}}.jsonl", output_dir);
    println!("  Metadata: {:?}", metadata_path);

    Ok(())
}
