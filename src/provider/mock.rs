//! Scripted provider for unit tests.
//!
//! Behaviour is configured through `&self` setters so a clone can be handed
//! to the code under test while the test keeps one for scripting and for
//! reading the call counters.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    ByteStream, CommandApi, CreateRequest, FileContent, FilesystemApi, Process, ProcessEvent,
    ProviderError, RemoteSandbox, SandboxProvider,
};

/// Scripted outcome for a command.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Process runs and exits with `code`.
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Process cannot be started.
    SpawnError(String),
    /// Provider fails for a reason other than the exit status.
    Fail(String),
    /// Delays the inner reply's output.
    Delayed(Duration, Box<MockReply>),
    /// Emits the inner reply's output at once but delays its exit.
    Lingering(Duration, Box<MockReply>),
}

impl MockReply {
    pub(crate) fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    pub(crate) fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    pub(crate) fn linger(self, delay: Duration) -> Self {
        Self::Lingering(delay, Box::new(self))
    }
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    creates: AtomicUsize,
    kills: AtomicUsize,
    next_pid: AtomicUsize,
    connect_delay: Mutex<Duration>,
    connect_failures: Mutex<VecDeque<ProviderError>>,
    commandless_connects: AtomicUsize,
    /// Command-surface switches of every handle handed out so far.
    command_switches: Mutex<Vec<Arc<AtomicBool>>>,
    /// Failed readiness probes before the filesystem appears. `None` = never.
    fs_ready_after: Mutex<Option<usize>>,
    replies: Mutex<Vec<(String, MockReply)>>,
    without_pids: Mutex<bool>,
    reject_bytes: Mutex<bool>,
    write_delay: Mutex<Duration>,
    hostname_fails: Mutex<bool>,
    /// Sandbox id -> instant after which it is gone.
    expiry: Mutex<HashMap<String, Instant>>,
    files: Mutex<HashMap<String, Bytes>>,
    runs: Mutex<Vec<Vec<String>>>,
}

/// Provider whose every answer is scripted by the test.
#[derive(Clone)]
pub(crate) struct MockProvider {
    state: Arc<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        let state = MockState {
            fs_ready_after: Mutex::new(Some(0)),
            next_pid: AtomicUsize::new(1000),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Queues errors returned by the next connect calls, in order.
    pub(crate) fn fail_connects(&self, errors: Vec<ProviderError>) {
        self.state.connect_failures.lock().unwrap().extend(errors);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    /// The next `n` connected handles expose no command surface.
    pub(crate) fn commandless_connects(&self, n: usize) {
        self.state.commandless_connects.store(n, Ordering::SeqCst);
    }

    /// Every handle handed out so far loses its command surface.
    pub(crate) fn drop_command_surfaces(&self) {
        for switch in self.state.command_switches.lock().unwrap().iter() {
            switch.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn filesystem_ready_after(&self, failed_probes: usize) {
        *self.state.fs_ready_after.lock().unwrap() = Some(failed_probes);
    }

    pub(crate) fn without_filesystem(&self) {
        *self.state.fs_ready_after.lock().unwrap() = None;
    }

    /// Replies with `reply` to any command line containing `needle`.
    pub(crate) fn reply(&self, needle: &str, reply: MockReply) {
        self.state
            .replies
            .lock()
            .unwrap()
            .push((needle.to_string(), reply));
    }

    pub(crate) fn without_pids(&self) {
        *self.state.without_pids.lock().unwrap() = true;
    }

    /// Native writes only accept text content.
    pub(crate) fn reject_bytes(&self) {
        *self.state.reject_bytes.lock().unwrap() = true;
    }

    /// Native file writes take `delay` before landing.
    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.state.write_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fail_hostname(&self) {
        *self.state.hostname_fails.lock().unwrap() = true;
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn creates(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn kills(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    /// Command lines seen so far, in dispatch order.
    pub(crate) fn runs(&self) -> Vec<Vec<String>> {
        self.state.runs.lock().unwrap().clone()
    }

    /// Content written natively to `path` in `sandbox_id`.
    pub(crate) fn file(&self, sandbox_id: &str, path: &str) -> Option<Bytes> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(&file_key(sandbox_id, path))
            .cloned()
    }

    fn handle(&self, id: String) -> Arc<dyn RemoteSandbox> {
        let has_commands = self
            .state
            .commandless_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err();
        let has_commands = Arc::new(AtomicBool::new(has_commands));
        self.state
            .command_switches
            .lock()
            .unwrap()
            .push(has_commands.clone());

        Arc::new(MockSandbox {
            id,
            has_commands,
            probes: AtomicUsize::new(0),
            state: self.state.clone(),
        })
    }
}

fn file_key(sandbox_id: &str, path: &str) -> String {
    format!("{sandbox_id}:{path}")
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, request: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let n = self.state.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{n}");
        self.state
            .expiry
            .lock()
            .unwrap()
            .insert(id.clone(), Instant::now() + request.timeout);
        Ok(self.handle(id))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.state.connect_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        // Unknown ids are treated as live sandboxes created elsewhere.
        let expired = self
            .state
            .expiry
            .lock()
            .unwrap()
            .get(sandbox_id)
            .is_some_and(|deadline| Instant::now() >= *deadline);
        if expired {
            return Err(ProviderError::unavailable(format!("Sandbox {sandbox_id} not found")));
        }

        Ok(self.handle(sandbox_id.to_string()))
    }
}

struct MockSandbox {
    id: String,
    has_commands: Arc<AtomicBool>,
    probes: AtomicUsize,
    state: Arc<MockState>,
}

#[async_trait]
impl RemoteSandbox for MockSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn commands(&self) -> Option<Arc<dyn CommandApi>> {
        self.has_commands.load(Ordering::SeqCst).then(|| {
            Arc::new(MockCommands {
                state: self.state.clone(),
            }) as Arc<dyn CommandApi>
        })
    }

    async fn filesystem(&self) -> Option<Arc<dyn FilesystemApi>> {
        let probe = self.probes.fetch_add(1, Ordering::SeqCst);
        let ready_after = (*self.state.fs_ready_after.lock().unwrap())?;
        (probe >= ready_after).then(|| {
            Arc::new(MockFilesystem {
                sandbox_id: self.id.clone(),
                state: self.state.clone(),
            }) as Arc<dyn FilesystemApi>
        })
    }

    async fn hostname(&self, port: u16) -> Result<String, ProviderError> {
        if *self.state.hostname_fails.lock().unwrap() {
            return Err(ProviderError::other("hostname lookup failed"));
        }
        Ok(format!("{port}-{}.mock.dev", self.id))
    }

    async fn kill(&self) -> Result<(), ProviderError> {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        self.state
            .expiry
            .lock()
            .unwrap()
            .insert(self.id.clone(), Instant::now());
        Ok(())
    }
}

struct MockCommands {
    state: Arc<MockState>,
}

#[async_trait]
impl CommandApi for MockCommands {
    async fn spawn(&self, argv: &[String]) -> Result<Process, ProviderError> {
        self.state.runs.lock().unwrap().push(argv.to_vec());

        let line = argv.join(" ");
        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| MockReply::exit(0, "", ""));

        let (delay, linger, reply) = match reply {
            MockReply::Delayed(delay, inner) => (delay, Duration::ZERO, *inner),
            MockReply::Lingering(linger, inner) => (Duration::ZERO, linger, *inner),
            other => (Duration::ZERO, Duration::ZERO, other),
        };

        let (code, stdout, stderr) = match reply {
            MockReply::Exit {
                code,
                stdout,
                stderr,
            } => (code, stdout, stderr),
            MockReply::SpawnError(message) => return Err(ProviderError::spawn(message)),
            MockReply::Fail(message) => return Err(ProviderError::other(message)),
            MockReply::Delayed(..) | MockReply::Lingering(..) => {
                return Err(ProviderError::other("nested delay"))
            }
        };

        let pid = if *self.state.without_pids.lock().unwrap() {
            None
        } else {
            Some(self.state.next_pid.fetch_add(1, Ordering::SeqCst).to_string())
        };

        let events = async_stream::stream! {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !stdout.is_empty() {
                yield Ok(ProcessEvent::Stdout(stdout));
            }
            if !stderr.is_empty() {
                yield Ok(ProcessEvent::Stderr(stderr));
            }
            if !linger.is_zero() {
                tokio::time::sleep(linger).await;
            }
            yield Ok(ProcessEvent::Exit { code, status: format!("exit status {code}") });
        };

        Ok(Process {
            pid,
            events: events.boxed(),
        })
    }
}

struct MockFilesystem {
    sandbox_id: String,
    state: Arc<MockState>,
}

#[async_trait]
impl FilesystemApi for MockFilesystem {
    async fn write(&self, path: &str, content: FileContent) -> Result<(), ProviderError> {
        if *self.state.reject_bytes.lock().unwrap() && matches!(content, FileContent::Bytes(_)) {
            return Err(ProviderError::other("binary content is not supported"));
        }
        let delay = *self.state.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state
            .files
            .lock()
            .unwrap()
            .insert(file_key(&self.sandbox_id, path), content.into_bytes());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<ByteStream, ProviderError> {
        let content = self
            .state
            .files
            .lock()
            .unwrap()
            .get(&file_key(&self.sandbox_id, path))
            .cloned()
            .ok_or_else(|| ProviderError::file_not_found(path))?;
        Ok(stream::iter([Ok(content)]).boxed())
    }
}
