//! Streaming token generation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::batch::LlamaBatch;
use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::sampler::SamplingParams;
use crate::token::{LlamaToken, Utf8Decoder, token_to_bytes};

/// Parameters for a generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Pre-tokenized prompt.
    pub tokens: Vec<LlamaToken>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Stop-word strings.
    pub stop_words: Vec<String>,
    /// Sampling configuration.
    pub sampling_params: SamplingParams,
}

impl GenerateRequest {
    pub fn new(tokens: Vec<LlamaToken>) -> Self {
        Self {
            tokens,
            max_tokens: 256,
            stop_words: Vec::new(),
            sampling_params: SamplingParams::default(),
        }
    }
}

/// Events emitted during streaming generation.
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    /// A new text piece was decoded.
    Token(String),
    /// Generation finished.
    Done {
        finish_reason: FinishReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An error occurred mid-generation.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop (end-of-generation token).
    Stop,
    /// Reached `max_tokens` or the context size.
    Length,
    /// Matched a stop word.
    StopWord(String),
    /// The consumer went away.
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a non-streaming [`generate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

//  Stop words

/// Scans streamed text for stop words.
///
/// Text that could still turn into a stop word is held back until it
/// either completes the word (and is dropped) or diverges (and is
/// released), so stop text never reaches the consumer.
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    /// Feed text. Returns the text that is safe to emit and the stop word
    /// if one completed; after a match the rest of the input is discarded.
    pub fn push(&mut self, text: &str) -> (String, Option<String>) {
        self.pending.push_str(text);

        let hit = self
            .stops
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()).map(|pos| (pos, s)))
            .min_by_key(|(pos, _)| *pos);
        if let Some((pos, word)) = hit {
            let word = word.clone();
            let mut emit = std::mem::take(&mut self.pending);
            emit.truncate(pos);
            return (emit, Some(word));
        }

        let hold_from = self
            .pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stops.iter().any(|s| s.starts_with(tail))
            })
            .unwrap_or(self.pending.len());
        let held = self.pending.split_off(hold_from);
        let emit = std::mem::replace(&mut self.pending, held);
        (emit, None)
    }

    /// Bytes currently withheld.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Release whatever is still withheld.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

//  Generation loop

/// Consumer of generated text.
trait TextSink {
    /// Deliver a piece of text; `false` means the consumer has gone away.
    fn send(&mut self, text: &str) -> bool;

    /// Polled once per sampled token, including tokens that produce no
    /// visible text yet.
    fn is_closed(&self) -> bool {
        false
    }
}

impl TextSink for String {
    fn send(&mut self, text: &str) -> bool {
        self.push_str(text);
        true
    }
}

impl TextSink for mpsc::Sender<GenerateEvent> {
    fn send(&mut self, text: &str) -> bool {
        self.blocking_send(GenerateEvent::Token(text.to_owned())).is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Turns the bytes of sampled tokens into text for a [`TextSink`],
/// holding back split characters and stop-word prefixes.
struct TextStream {
    decoder: Utf8Decoder,
    stops: StopMatcher,
}

impl TextStream {
    fn new(stop_words: &[String]) -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            stops: StopMatcher::new(stop_words),
        }
    }

    /// Feed one token. Returns the reason to stop, if any.
    fn push(&mut self, bytes: &[u8], sink: &mut impl TextSink) -> Option<FinishReason> {
        if sink.is_closed() {
            return Some(FinishReason::Cancelled);
        }
        let text = self.decoder.push(bytes);
        let (emit, stop) = self.stops.push(&text);
        if !emit.is_empty() && !sink.send(&emit) {
            return Some(FinishReason::Cancelled);
        }
        stop.map(FinishReason::StopWord)
    }

    /// Flush withheld text at the end of generation. Returns `false` if
    /// the sink refused it.
    fn finish(&mut self, sink: &mut impl TextSink) -> bool {
        let mut tail = self.stops.push(&self.decoder.finish()).0;
        tail.push_str(&self.stops.finish());
        tail.is_empty() || sink.send(&tail)
    }
}

/// Core loop shared by [`generate_blocking`] and [`generate`].
///
/// Returns the finish reason and the number of sampled tokens.
fn run(
    ctx: &mut LlamaContext,
    request: &GenerateRequest,
    sink: &mut impl TextSink,
) -> Result<(FinishReason, u32)> {
    if request.tokens.is_empty() {
        return Err(LlamaError::InvalidArgument("prompt is empty".into()));
    }
    let n_ctx = ctx.n_ctx() as usize;
    if request.tokens.len() >= n_ctx {
        return Err(LlamaError::InvalidArgument(format!(
            "prompt of {} tokens does not fit a context of {n_ctx}",
            request.tokens.len()
        )));
    }

    let model = Arc::clone(ctx.model_arc());
    let vocab = model.vocab();
    let mut sampler = request.sampling_params.build_chain(&model)?;
    ctx.kv_cache_clear();

    //  Prompt processing, in chunks of n_batch
    let n_batch = (ctx.n_batch() as usize).max(1);
    let mut batch = LlamaBatch::new(n_batch, 1)?;
    let last = request.tokens.len() - 1;
    for (c, chunk) in request.tokens.chunks(n_batch).enumerate() {
        if sink.is_closed() {
            debug!("generation cancelled during prompt processing");
            return Ok((FinishReason::Cancelled, 0));
        }
        batch.clear();
        for (j, &tok) in chunk.iter().enumerate() {
            let pos = c * n_batch + j;
            batch.add(tok, pos as i32, &[0], pos == last)?;
        }
        ctx.decode(&batch)?;
    }
    debug!(prompt_tokens = request.tokens.len(), "prompt processed");

    let mut n_cur = request.tokens.len();
    let mut completion_tokens = 0u32;
    let mut stream = TextStream::new(&request.stop_words);

    //  Token generation loop
    let reason = loop {
        if completion_tokens >= request.max_tokens {
            break FinishReason::Length;
        }

        // Sampling also accepts the token into every stage of the chain.
        let token = sampler.sample(ctx, -1)?;
        completion_tokens += 1;
        trace!(token = token.0, "sampled");

        if vocab.is_eog(token) {
            break FinishReason::Stop;
        }

        if let Some(reason) = stream.push(&token_to_bytes(&vocab, token, 0, false), sink) {
            if reason == FinishReason::Cancelled {
                debug!(completion_tokens, "generation cancelled");
            }
            return Ok((reason, completion_tokens));
        }

        if n_cur >= n_ctx {
            break FinishReason::Length;
        }

        batch.clear();
        batch.add(token, n_cur as i32, &[0], true)?;
        n_cur += 1;
        ctx.decode(&batch)?;
    };

    if !stream.finish(sink) {
        return Ok((FinishReason::Cancelled, completion_tokens));
    }
    Ok((reason, completion_tokens))
}

/// Run a synchronous (blocking) generation loop.
///
/// This is intended to be called inside `tokio::task::spawn_blocking`.
/// Produced text is sent over `tx`; the function returns when
/// generation finishes or the receiver is dropped or closed. No `Done`
/// event follows a cancellation.
pub fn generate_blocking(ctx: &mut LlamaContext, request: &GenerateRequest, mut tx: mpsc::Sender<GenerateEvent>) {
    let prompt_tokens = request.tokens.len() as u32;
    let event = match run(ctx, request, &mut tx) {
        Ok((FinishReason::Cancelled, _)) => return,
        Ok((finish_reason, completion_tokens)) => GenerateEvent::Done {
            finish_reason,
            prompt_tokens,
            completion_tokens,
        },
        Err(e) => GenerateEvent::Error(e.to_string()),
    };
    let _ = tx.blocking_send(event);
}

/// Generate to completion and return the collected text.
pub fn generate(ctx: &mut LlamaContext, request: &GenerateRequest) -> Result<Completion> {
    let mut text = String::new();
    let (finish_reason, completion_tokens) = run(ctx, request, &mut text)?;
    Ok(Completion {
        text,
        finish_reason,
        prompt_tokens: request.tokens.len() as u32,
        completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(words: &[&str]) -> StopMatcher {
        StopMatcher::new(&words.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_stop_matcher_passes_plain_text() {
        let mut m = matcher(&["</s>"]);
        assert_eq!(m.push("hello "), ("hello ".to_string(), None));
        assert_eq!(m.push("world"), ("world".to_string(), None));
        assert_eq!(m.finish(), "");
    }

    #[test]
    fn test_stop_matcher_withholds_partial_prefix() {
        let mut m = matcher(&["\nUser:"]);
        assert_eq!(m.push("Sure.\nUs"), ("Sure.".to_string(), None));
        assert_eq!(m.pending(), "\nUs");
        let (emit, stop) = m.push("er: next");
        assert_eq!(emit, "");
        assert_eq!(stop.as_deref(), Some("\nUser:"));
    }

    #[test]
    fn test_stop_matcher_releases_diverging_prefix() {
        let mut m = matcher(&["STOP"]);
        assert_eq!(m.push("ST"), (String::new(), None));
        assert_eq!(m.push("ill going"), ("STill going".to_string(), None));
    }

    #[test]
    fn test_stop_matcher_earliest_word_wins() {
        let mut m = matcher(&["bb", "a"]);
        let (emit, stop) = m.push("xxbbya");
        assert_eq!(emit, "xx");
        assert_eq!(stop.as_deref(), Some("bb"));
    }

    #[test]
    fn test_stop_matcher_finish_flushes() {
        let mut m = matcher(&["<end>"]);
        assert_eq!(m.push("done <en"), ("done ".to_string(), None));
        assert_eq!(m.finish(), "<en");
    }

    #[test]
    fn test_stop_matcher_multibyte_boundaries() {
        let mut m = matcher(&["é!"]);
        assert_eq!(m.push("caféé"), ("café".to_string(), None));
        let (emit, stop) = m.push("!");
        assert_eq!(emit, "");
        assert_eq!(stop.as_deref(), Some("é!"));
    }

    #[test]
    fn test_empty_stop_words_ignored() {
        let mut m = matcher(&[""]);
        assert_eq!(m.push("abc"), ("abc".to_string(), None));
    }

    /// Records what it receives and can be closed from the test.
    #[derive(Default)]
    struct Recorder {
        pieces: Vec<String>,
        closed: bool,
    }

    impl TextSink for Recorder {
        fn send(&mut self, text: &str) -> bool {
            if self.closed {
                return false;
            }
            self.pieces.push(text.to_owned());
            true
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn stream(words: &[&str]) -> TextStream {
        TextStream::new(&words.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_text_stream_forwards_text_and_stops() {
        let mut sink = Recorder::default();
        let mut s = stream(&["###"]);
        assert_eq!(s.push(b"Hello", &mut sink), None);
        assert_eq!(s.push(b" ##", &mut sink), None);
        assert_eq!(s.push(b"# tail", &mut sink), Some(FinishReason::StopWord("###".into())));
        assert_eq!(sink.pieces, vec!["Hello", " "]);
    }

    #[test]
    fn test_text_stream_cancels_while_withholding_text() {
        let mut sink = Recorder::default();
        let mut s = stream(&["</s>"]);
        // A stop-word prefix and half a character: nothing is sent.
        assert_eq!(s.push(b"</", &mut sink), None);
        assert_eq!(s.push(&[0xC3], &mut sink), None);
        assert!(sink.pieces.is_empty());

        sink.closed = true;
        assert_eq!(s.push(b"", &mut sink), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_text_stream_notices_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel::<GenerateEvent>(4);
        let mut s = stream(&[]);
        assert_eq!(s.push(b"a", &mut tx), None);
        drop(rx);
        // A control token renders as no bytes; the closed channel is still seen.
        assert_eq!(s.push(b"", &mut tx), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_text_stream_finish_flushes_tail() {
        let mut sink = Recorder::default();
        let mut s = stream(&["<end>"]);
        assert_eq!(s.push(b"done <en", &mut sink), None);
        assert_eq!(s.push(&[0xE2, 0x82], &mut sink), None);
        assert!(s.finish(&mut sink));
        assert_eq!(sink.pieces, vec!["done ", "<en\u{FFFD}"]);

        let mut s = stream(&["<end>"]);
        assert_eq!(s.push(b"<e", &mut sink), None);
        sink.closed = true;
        assert!(!s.finish(&mut sink));
    }

    #[test]
    fn test_finish_reason_display() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::StopWord("###".into()).to_string(), "stop_word:###");
        assert_eq!(FinishReason::Cancelled.to_string(), "cancelled");
    }
}
