//! Token streamers: callbacks the pipeline invokes between decode steps.
//!
//! The first `put` of a generation carries the prompt ids, every later one a
//! single sampled id. `end` closes the generation and rearms the streamer.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glm_core::{Result, Tokenizer};
use glm_tokenizer::IncrementalDecoder;
use tracing::info;

pub trait Streamer {
    fn put(&mut self, output_ids: &[u32]) -> Result<()>;
    fn end(&mut self) -> Result<()>;
}

/// Writes decoded text to `writer` as soon as it forms complete characters.
pub struct TextStreamer<W: Write> {
    writer: W,
    tokenizer: Arc<dyn Tokenizer>,
    decoder: IncrementalDecoder,
    is_prompt: bool,
}

impl<W: Write> TextStreamer<W> {
    pub fn new(writer: W, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            writer,
            tokenizer,
            decoder: IncrementalDecoder::new(),
            is_prompt: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Streamer for TextStreamer<W> {
    fn put(&mut self, output_ids: &[u32]) -> Result<()> {
        if self.is_prompt {
            // The prompt was typed by the user; never echo it.
            self.is_prompt = false;
            return Ok(());
        }
        for &id in output_ids {
            if let Some(text) = self.decoder.add_token(id, self.tokenizer.as_ref()) {
                self.writer.write_all(text.as_bytes())?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if let Some(text) = self.decoder.flush(self.tokenizer.as_ref()) {
            self.writer.write_all(text.as_bytes())?;
        }
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.decoder = IncrementalDecoder::new();
        self.is_prompt = true;
        Ok(())
    }
}

/// Timings of one generation as seen by a [`PerfStreamer`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfStats {
    pub num_prompt_tokens: usize,
    pub num_output_tokens: usize,
    /// Prompt submission to first sampled token.
    pub prompt_time: Duration,
    /// First sampled token to the last one.
    pub output_time: Duration,
}

impl PerfStats {
    pub fn prompt_ms_per_token(&self) -> f64 {
        per_token_ms(self.prompt_time, self.num_prompt_tokens)
    }

    /// The first sampled token is billed to the prompt.
    pub fn output_ms_per_token(&self) -> f64 {
        per_token_ms(self.output_time, self.num_output_tokens.saturating_sub(1))
    }
}

fn per_token_ms(elapsed: Duration, tokens: usize) -> f64 {
    if tokens == 0 {
        return 0.0;
    }
    elapsed.as_secs_f64() * 1000.0 / tokens as f64
}

/// Records prompt and output token counts with their timings and logs a
/// summary when the generation ends.
#[derive(Debug, Default)]
pub struct PerfStreamer {
    start: Option<Instant>,
    prompt_done: Option<Instant>,
    last_token: Option<Instant>,
    num_prompt_tokens: usize,
    num_output_tokens: usize,
    last: PerfStats,
}

impl PerfStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats of the most recently finished generation.
    pub fn stats(&self) -> PerfStats {
        self.last
    }

    fn current(&self) -> PerfStats {
        let elapsed = |from: Option<Instant>, to: Option<Instant>| match (from, to) {
            (Some(from), Some(to)) => to.saturating_duration_since(from),
            _ => Duration::ZERO,
        };
        PerfStats {
            num_prompt_tokens: self.num_prompt_tokens,
            num_output_tokens: self.num_output_tokens,
            prompt_time: elapsed(self.start, self.prompt_done),
            output_time: elapsed(self.prompt_done, self.last_token),
        }
    }
}

impl Streamer for PerfStreamer {
    fn put(&mut self, output_ids: &[u32]) -> Result<()> {
        let now = Instant::now();
        if self.start.is_none() {
            self.start = Some(now);
            self.num_prompt_tokens = output_ids.len();
            return Ok(());
        }
        if self.prompt_done.is_none() {
            self.prompt_done = Some(now);
        }
        self.last_token = Some(now);
        self.num_output_tokens += output_ids.len();
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let stats = self.current();
        info!(
            prompt_tokens = stats.num_prompt_tokens,
            prompt_ms_per_token = stats.prompt_ms_per_token(),
            output_tokens = stats.num_output_tokens,
            output_ms_per_token = stats.output_ms_per_token(),
            "generation finished"
        );
        *self = Self {
            last: stats,
            ..Self::default()
        };
        Ok(())
    }
}

/// Fans every event out to several streamers in order.
#[derive(Default)]
pub struct StreamerGroup<'a> {
    streamers: Vec<&'a mut dyn Streamer>,
}

impl<'a> StreamerGroup<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, streamer: &'a mut dyn Streamer) {
        self.streamers.push(streamer);
    }
}

impl Streamer for StreamerGroup<'_> {
    fn put(&mut self, output_ids: &[u32]) -> Result<()> {
        for streamer in self.streamers.iter_mut() {
            streamer.put(output_ids)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        for streamer in self.streamers.iter_mut() {
            streamer.end()?;
        }
        Ok(())
    }
}
