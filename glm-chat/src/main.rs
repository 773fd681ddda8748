//! Interactive command-line chat for converted ChatGLM checkpoints.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use glm_core::{ChatMessage, GenerationConfig, Image};
use glm_runtime::{
    ChatSession, CpuSampler, PerfStreamer, Pipeline, Streamer, StreamerGroup, TextStreamer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glm-chat", about = "Chat with a ChatGLM model on the CPU")]
struct Cli {
    /// Directory holding config.json, tokenizer.json and *.safetensors
    #[arg(short, long)]
    model: PathBuf,

    /// Single prompt; omit to start an interactive session
    #[arg(short, long)]
    prompt: Option<String>,

    /// Image attached to the first user turn (GLM-4V only)
    #[arg(long)]
    image: Option<PathBuf>,

    /// System prompt opening the conversation
    #[arg(short, long)]
    system: Option<String>,

    /// Keep chatting after answering --prompt
    #[arg(short, long)]
    interactive: bool,

    /// Context length cap; defaults to the model's own
    #[arg(short = 'l', long)]
    max_length: Option<usize>,

    /// Tokens to generate per turn, -1 for no limit
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_new_tokens: i32,

    #[arg(short = 'c', long, default_value_t = 512)]
    max_context_length: usize,

    /// Greedy decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    #[arg(long, default_value_t = 0)]
    top_k: usize,

    #[arg(long, default_value_t = 0.7)]
    top_p: f32,

    #[arg(long, default_value_t = 0.95)]
    temp: f32,

    #[arg(long, default_value_t = 1.0)]
    repeat_penalty: f32,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Log timing statistics after each reply
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn gen_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_length: self.max_length.unwrap_or(GenerationConfig::default().max_length),
            max_new_tokens: self.max_new_tokens,
            max_context_length: self.max_context_length,
            do_sample: !self.greedy,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temp,
            repetition_penalty: self.repeat_penalty,
        }
    }
}

fn load_image(path: &Path) -> anyhow::Result<Image> {
    let rgb = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Image::new(width as usize, height as usize, rgb.into_raw())?)
}

/// Run one turn, printing the reply as it is generated.
fn reply(
    session: &mut ChatSession,
    message: ChatMessage,
    sampler: &mut CpuSampler,
    verbose: bool,
) -> anyhow::Result<()> {
    let tokenizer = session.pipeline().tokenizer();
    let mut text = TextStreamer::new(io::stdout(), tokenizer);
    let mut perf = PerfStreamer::new();
    let mut group = StreamerGroup::new();
    group.push(&mut text);
    if verbose {
        group.push(&mut perf);
    }
    print!("ChatGLM > ");
    io::stdout().flush()?;
    session.send(message, sampler, Some(&mut group as &mut dyn Streamer))?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let gen_config = cli.gen_config();
    gen_config.validate()?;

    let pipeline = Pipeline::from_path(&cli.model, cli.max_length)
        .with_context(|| format!("failed to load model from {}", cli.model.display()))?;
    info!(
        model = pipeline.model().config().model_type_name(),
        max_length = pipeline.max_length(),
        "model loaded"
    );

    let mut sampler = match cli.seed {
        Some(seed) => CpuSampler::seeded(seed),
        None => CpuSampler::from_entropy(),
    };
    let mut session = ChatSession::new(pipeline, gen_config);
    if let Some(system) = &cli.system {
        session = session.with_system(system.clone());
    }
    let mut image = cli.image.as_deref().map(load_image).transpose()?;

    if let Some(prompt) = &cli.prompt {
        let mut message = ChatMessage::user(prompt.clone());
        if let Some(image) = image.take() {
            message = message.with_image(image);
        }
        reply(&mut session, message, &mut sampler, cli.verbose)?;
        if !cli.interactive {
            return Ok(());
        }
    }

    println!("Type 'clear' to start over, 'stop' or Ctrl-D to quit.");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("Prompt > ");
        io::stdout().flush()?;
        let Some(line) = lines.next().transpose()? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "stop" => break,
            "clear" => {
                session.clear();
                continue;
            }
            _ => {}
        }
        let mut message = ChatMessage::user(line);
        if let Some(image) = image.take() {
            message = message.with_image(image);
        }
        if let Err(err) = reply(&mut session, message, &mut sampler, cli.verbose) {
            eprintln!("error: {err:#}");
        }
    }
    println!("Bye");
    Ok(())
}
