use genie::{GenerationFailure, GenerationRequest, PromptBuilder, StoryDraft, StoryPipeline};
use genie_config::GenieConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use utils::init_logging;

#[allow(unused_imports)]
use tracing::{info, debug, error, warn};

mod utils;

const ANONYMOUS_CALLER: &str = "anonymous";

#[derive(Deserialize)]
struct StoryJob {
    #[serde(default)]
    caller: Option<String>,
    #[serde(flatten)]
    request: GenerationRequest,
}

#[derive(Serialize)]
struct StoryReply {
    caller: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    story: Option<StoryDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StoryReply {
    fn from_result(caller: String, result: Result<StoryDraft, GenerationFailure>) -> Self {
        match result {
            Ok(story) => StoryReply { caller, status: "OK", story: Some(story), error: None },
            Err(failure) => StoryReply { caller, status: "ERROR", story: None, error: Some(failure.to_string()) },
        }
    }
}

fn emit(reply: &StoryReply) {
    match serde_json::to_string(reply) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize reply: {}", e),
    }
}

/// Decodes one raw input line. Blank lines yield `None`.
fn parse_job(raw: &[u8]) -> Result<Option<StoryJob>, GenerationFailure> {
    let line = std::str::from_utf8(raw).map_err(|e| GenerationFailure::InvalidRequest(e.to_string()))?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| GenerationFailure::InvalidRequest(e.to_string()))
}

/// Runs one job per input line until the input ends or fails, then waits for every started job.
async fn serve<C, R>(pipeline: Arc<StoryPipeline<C>>, mut input: R, replies: mpsc::UnboundedSender<StoryReply>)
where
    C: PromptBuilder + 'static,
    R: AsyncBufRead + Unpin,
{
    let mut jobs = JoinSet::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match input.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read request input: {}", e);
                break;
            }
        }

        let job = match parse_job(&line) {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(failure) => {
                warn!("Rejected malformed request line: {}", failure);
                let _ = replies.send(StoryReply::from_result(ANONYMOUS_CALLER.to_string(), Err(failure)));
                continue;
            }
        };

        let pipeline = Arc::clone(&pipeline);
        let replies = replies.clone();
        jobs.spawn(async move {
            let caller = job.caller.unwrap_or_else(|| ANONYMOUS_CALLER.to_string());
            let result = pipeline.draft(&job.request, &caller).await;
            let _ = replies.send(StoryReply::from_result(caller, result));
        });
    }

    info!(outstanding = jobs.len(), "Input closed, waiting for outstanding jobs");
    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            error!("Story job panicked: {}", e);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GenieConfig::new()?;

    init_logging(config.debug)?;

    info!("Starting StoryGenie");

    let pipeline = Arc::new(StoryPipeline::new(&config)?);
    if let Err(e) = pipeline.initialize().await {
        error!("Story pipeline initialization failed: {}", e);
    }

    let (replies, mut outbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(async move {
        while let Some(reply) = outbox.recv().await {
            emit(&reply);
        }
    });

    serve(Arc::clone(&pipeline), BufReader::new(tokio::io::stdin()), replies).await;
    if let Err(e) = writer.await {
        error!("Reply writer failed: {}", e);
    }

    pipeline.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use genie::{DemonstrationBank, ExecutorConfig, ModelLoader, OutputSanitizer, PromptComposer};
    use genie_inference_engine::{CancelFlag, GenerationParameters, TextGenerator};
    use genie_models::{AdapterStatus, LoadedModel};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, ReadBuf};

    const STORY: &str = "The knight lowered his sword when the dragon began to sing.\n\
                         Together they walked back to the village before the sun rose.";

    /// Takes a while, then echoes the prompt and a fixed story.
    #[derive(Debug)]
    struct SlowStoryteller;

    impl TextGenerator for SlowStoryteller {
        fn generate(&self, prompt: &str, _params: &GenerationParameters, _cancel: &CancelFlag) -> anyhow::Result<String> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(format!("{prompt}{STORY}<end_of_turn><eos>"))
        }
    }

    struct StorytellerLoader;

    impl ModelLoader for StorytellerLoader {
        fn load(&self) -> anyhow::Result<LoadedModel> {
            Ok(LoadedModel { generator: Arc::new(SlowStoryteller), adapter: AdapterStatus::Absent })
        }
    }

    /// Serves `data`, then fails every read.
    struct BrokenInput {
        data: &'static [u8],
    }

    impl BrokenInput {
        fn failure() -> io::Error {
            io::Error::new(io::ErrorKind::ConnectionReset, "input went away")
        }
    }

    impl AsyncRead for BrokenInput {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.data.is_empty() {
                return Poll::Ready(Err(Self::failure()));
            }
            let n = this.data.len().min(buf.remaining());
            buf.put_slice(&this.data[..n]);
            this.data = &this.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncBufRead for BrokenInput {
        fn poll_fill_buf(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
            let this = self.get_mut();
            if this.data.is_empty() {
                return Poll::Ready(Err(Self::failure()));
            }
            Poll::Ready(Ok(this.data))
        }

        fn consume(self: Pin<&mut Self>, amt: usize) {
            let this = self.get_mut();
            this.data = &this.data[amt..];
        }
    }

    async fn ready_pipeline() -> Arc<StoryPipeline> {
        let config = ExecutorConfig {
            worker_pool_size: 2,
            timeout: Duration::from_secs(5),
            max_input_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        };
        let pipeline = StoryPipeline::with_parts(
            PromptComposer::new(DemonstrationBank::default()).unwrap(),
            Arc::new(StorytellerLoader),
            config,
            OutputSanitizer::default(),
        );
        pipeline.initialize().await.unwrap();
        Arc::new(pipeline)
    }

    fn collect(mut outbox: mpsc::UnboundedReceiver<StoryReply>) -> Vec<StoryReply> {
        let mut replies = Vec::new();
        while let Ok(reply) = outbox.try_recv() {
            replies.push(reply);
        }
        replies
    }

    #[test]
    fn test_parse_job() {
        let job = parse_job(br#"{"caller": "alice", "prompt": "A dragon meets a knight", "genre": "fantasy", "language": "en", "length": "short"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(job.caller.as_deref(), Some("alice"));
        assert_eq!(job.request.prompt, "A dragon meets a knight");

        assert!(parse_job(b"  \r\n").unwrap().is_none());
        assert!(matches!(parse_job(b"{\"prompt\": 5}\n"), Err(GenerationFailure::InvalidRequest(_))));
    }

    #[test]
    fn test_non_utf8_line_is_invalid_request() {
        let result = parse_job(b"{\"prompt\": \"caf\xe9\"}\n");
        assert!(matches!(result, Err(GenerationFailure::InvalidRequest(reason)) if reason.contains("utf-8")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_non_utf8_line_does_not_stop_serving() {
        let pipeline = ready_pipeline().await;
        let input: &[u8] = b"\xff\xfe\n\n{\"caller\": \"bob\", \"prompt\": \"A dragon meets a knight\", \"genre\": \"fantasy\", \"language\": \"en\", \"length\": \"short\"}\n";
        let (replies, outbox) = mpsc::unbounded_channel();

        serve(Arc::clone(&pipeline), input, replies).await;

        let replies = collect(outbox);
        assert_eq!(replies.len(), 2);
        assert_eq!((replies[0].caller.as_str(), replies[0].status), (ANONYMOUS_CALLER, "ERROR"));
        assert!(replies[0].error.as_deref().unwrap().starts_with("Invalid story request:"));
        assert_eq!((replies[1].caller.as_str(), replies[1].status), ("bob", "OK"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_failure_drains_outstanding_jobs() {
        let pipeline = ready_pipeline().await;
        let input = BrokenInput {
            data: b"{\"caller\": \"carol\", \"prompt\": \"A dragon meets a knight\", \"genre\": \"fantasy\", \"language\": \"en\", \"length\": \"short\"}\n",
        };
        let (replies, outbox) = mpsc::unbounded_channel();

        serve(Arc::clone(&pipeline), input, replies).await;

        let replies = collect(outbox);
        assert_eq!(replies.len(), 1);
        assert_eq!((replies[0].caller.as_str(), replies[0].status), ("carol", "OK"));
        assert!(replies[0].story.is_some());
        assert_eq!(pipeline.executor().in_flight(), 0);

        pipeline.shutdown().await;
    }
}
