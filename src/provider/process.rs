//! Process plumbing shared by every backend.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::ProviderError;

/// One event observed on a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// Terminal event. `status` is the provider's text, e.g. `exit status 3`.
    Exit { code: i32, status: String },
}

/// A started process.
pub(crate) struct Process {
    /// Provider-assigned process identifier, if the backend has one.
    pub pid: Option<String>,
    pub events: BoxStream<'static, Result<ProcessEvent, ProviderError>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Output of a process that exited zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Completed {
    pub stdout: String,
    pub stderr: String,
}

/// Drains a process and reports its outcome.
///
/// A non-zero exit becomes [`ProviderError::Exit`] carrying the captured output.
pub(crate) async fn collect(mut process: Process) -> Result<Completed, ProviderError> {
    let mut output = Completed::default();

    while let Some(event) = process.events.next().await {
        match event? {
            ProcessEvent::Stdout(text) => output.stdout.push_str(&text),
            ProcessEvent::Stderr(text) => output.stderr.push_str(&text),
            ProcessEvent::Exit { code: 0, .. } => return Ok(output),
            ProcessEvent::Exit { status, .. } => {
                return Err(ProviderError::Exit {
                    message: status,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
        }
    }

    Err(ProviderError::connection(
        "process output ended before an exit status was reported",
    ))
}

/// Incremental UTF-8 decoder that keeps multi-byte sequences split across
/// chunk boundaries intact.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes `chunk`, holding back a trailing incomplete sequence.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let rest = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    /// Flushes whatever is left, replacing invalid bytes.
    pub(crate) fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

/// Length of an unfinished multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn process(events: Vec<ProcessEvent>) -> Process {
        Process {
            pid: Some("42".to_string()),
            events: stream::iter(events.into_iter().map(Ok)).boxed(),
        }
    }

    #[tokio::test]
    async fn test_collect_success() {
        let completed = collect(process(vec![
            ProcessEvent::Stdout("hel".to_string()),
            ProcessEvent::Stderr("warn\n".to_string()),
            ProcessEvent::Stdout("lo\n".to_string()),
            ProcessEvent::Exit {
                code: 0,
                status: "exit status 0".to_string(),
            },
        ]))
        .await
        .unwrap();

        assert_eq!(completed.stdout, "hello\n");
        assert_eq!(completed.stderr, "warn\n");
    }

    #[tokio::test]
    async fn test_collect_nonzero_exit() {
        let err = collect(process(vec![
            ProcessEvent::Stderr("nope\n".to_string()),
            ProcessEvent::Exit {
                code: 3,
                status: "exit status 3".to_string(),
            },
        ]))
        .await
        .unwrap_err();

        match err {
            ProviderError::Exit {
                message, stderr, ..
            } => {
                assert_eq!(message, "exit status 3");
                assert_eq!(stderr, "nope\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collect_without_exit_event() {
        let err = collect(process(vec![ProcessEvent::Stdout("partial".to_string())]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Connection { .. }));
    }

    #[test]
    fn test_decoder_split_multibyte() {
        let bytes = "héllo €".as_bytes();
        let mut decoder = Utf8Decoder::default();

        // Split inside 'é' (2 bytes) and inside '€' (3 bytes)
        let mut text = decoder.push(&bytes[..2]);
        text.push_str(&decoder.push(&bytes[2..8]));
        text.push_str(&decoder.push(&bytes[8..]));
        text.push_str(&decoder.finish());

        assert_eq!(text, "héllo €");
    }

    #[test]
    fn test_decoder_holds_back_only_incomplete_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.push(&[0xAC, b'b']), "€b");
        assert_eq!(decoder.finish(), "");
    }
}
