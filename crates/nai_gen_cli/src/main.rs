use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing_subscriber::EnvFilter;

use nai_gen::prelude::*;

/// CLI for requesting AI-created images from a NovelAI-compatible generation server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
struct Args {
    /// The prompt for the image, `__name__` tokens are expanded from the wildcard dir
    #[arg(short, long, default_value = "1girl")]
    prompt: String,

    /// The negative prompt for the image
    #[arg(short, long, default_value = "bad quality")]
    negative: String,

    /// The seed, -1 lets the server pick one
    #[arg(short, long, default_value_t = -1, allow_hyphen_values = true)]
    seed: i64,

    /// The cfg scale
    #[arg(short = 'S', long, default_value_t = 5.0)]
    scale: f64,

    /// The width of the image, takes precedence over --ar
    #[arg(short, long)]
    width: Option<u32>,

    /// The height of the image, takes precedence over --ar
    #[arg(short, long)]
    height: Option<u32>,

    /// The number of steps for the generation to use
    #[arg(short = 't', long, default_value_t = 28)]
    steps: u32,

    /// The sampler to use
    #[arg(short = 'm', long, value_enum, default_value_t = Sampler::KEuler)]
    sampler: Sampler,

    /// The noise schedule to use
    #[arg(long, value_enum, default_value_t = Schedule::Native)]
    schedule: Schedule,

    /// Sinusoidal Multipass Euler Ancestral, improves coherency at higher resolutions
    #[arg(long)]
    smea: bool,

    /// SMEA DYN, spends less time on the early steps of the generation
    #[arg(long = "dyn")]
    sm_dyn: bool,

    /// Dynamic thresholding
    #[arg(long)]
    dyn_threshold: bool,

    /// The cfg rescale
    #[arg(long, default_value_t = 0.0)]
    cfg_rescale: f64,

    /// Sub folder the server should save to, if it permits it
    #[arg(long, default_value = "")]
    sub_folder: String,

    /// Directory of wildcard tag files
    #[arg(short = 'W', long)]
    wildcard_dir: Option<PathBuf>,

    /// Aspect ratio preset, ignored for any dimension given explicitly
    #[arg(long, value_enum)]
    ar: Option<AspectRatio>,

    /// Append the quality tags to the prompt
    #[arg(long)]
    quality_tags: bool,

    /// Prepend a preset to the negative prompt
    #[arg(long, value_enum)]
    uc_preset: Option<UcPreset>,

    /// The host (generation server) to connect to
    #[arg(long, env = "NAI_GEN_HOST", default_value = "127.0.0.1:7000")]
    host: String,

    /// The number of images to generate at once
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    batch_count: u32,

    /// The auth password to use
    #[arg(long)]
    auth: Option<String>,

    /// Also write every returned image to this directory
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Re-encode written images as WebP, keeping their metadata
    #[arg(long, requires = "out_dir")]
    webp: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    if args.auth.is_some() {
        bail!("--auth is not implemented yet");
    }

    let mut prompt = args.prompt.clone();
    if let Some(dir) = &args.wildcard_dir {
        let mut cache = WildcardCache::new(dir)?;
        prompt = wildcard::resolve(&prompt, &mut cache);
        tracing::info!("processed prompt: {prompt}");
    }

    let request = build_request(&args, prompt)?;

    let smea = if args.smea { " smea" } else { "" };
    let sm_dyn = if args.sm_dyn { " dyn" } else { "" };
    let rescale = if args.cfg_rescale != 0.0 {
        format!(" rescale={}", args.cfg_rescale)
    } else {
        String::new()
    };
    tracing::info!(
        "{}@{} with {} ({}{smea}{sm_dyn}) at cfg {}{rescale}",
        request.dimensions(),
        args.steps,
        args.sampler,
        args.schedule,
        args.scale
    );
    if !request.is_free() {
        tracing::info!("request is outside of the free generation tier");
    }

    let client = GenClient::new(&args.host)?;
    let results = client
        .run_batch(&request, &args.sub_folder, args.batch_count as usize)
        .await;

    report(results, args.out_dir.as_deref(), args.webp).await?;

    Ok(())
}

fn build_request(args: &Args, prompt: String) -> Result<GenerateRequest> {
    let dimensions = resolve_dimensions(args.width, args.height, args.ar);

    let mut request = GenerateRequest::new(prompt)
        .update_negative_prompt(args.negative.as_str())
        .update_seed(args.seed)
        .update_scale(args.scale)
        .update_dimensions(dimensions)
        .update_steps(args.steps)
        .update_sampler(args.sampler)
        .update_schedule(args.schedule)
        .update_smea(args.smea)
        .update_dyn(args.sm_dyn)
        .update_dyn_threshold(args.dyn_threshold)
        .update_cfg_rescale(args.cfg_rescale);
    if args.quality_tags {
        request = request.with_quality_tags();
    }
    if let Some(preset) = args.uc_preset {
        request = request.with_uc_preset(preset);
    }
    request.validate()?;

    Ok(request)
}

/// Logs every slot and writes the successful ones out. A slot that fails to
/// be written is logged and skipped. Errors only when no request succeeded.
async fn report<B: AsRef<[u8]>>(
    results: Vec<nai_gen::Result<B>>,
    out_dir: Option<&Path>,
    webp: bool,
) -> Result<usize> {
    let total = results.len();
    let mut succeeded = 0;
    for (slot, result) in results.into_iter().enumerate() {
        match result {
            Ok(image) => {
                succeeded += 1;
                let Some(dir) = out_dir else { continue };
                match save_image(dir, image.as_ref(), webp).await {
                    Ok(path) => tracing::info!("image written to {}", path.display()),
                    Err(e) => tracing::error!(slot, "could not write image: {e}"),
                }
            }
            Err(e) => tracing::error!(slot, "Error: {e}"),
        }
    }

    if succeeded == 0 {
        bail!("all {total} requests failed");
    }
    tracing::info!("{succeeded}/{total} requests succeeded");

    Ok(succeeded)
}

async fn save_image(dir: &Path, data: &[u8], webp: bool) -> Result<PathBuf> {
    let (binary, extension) = if webp {
        let source = SourceImage::from_bytes(data)?;
        let encoded = encode_webp(&source, None, &EncodeOptions::default())?;
        (encoded, "webp")
    } else {
        let extension = image::guess_format(data)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("bin");
        (data.to_vec(), extension)
    };

    let hash = Sha256::digest(&binary);
    let path = dir.join(format!("{}.{}", hex::encode(hash), extension));

    fs::create_dir_all(dir).await?;
    fs::write(&path, binary).await?;

    Ok(path)
}
