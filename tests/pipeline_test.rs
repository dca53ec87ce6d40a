//! End-to-end scenarios with fake channel, backend, VCS and launcher.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use warden::channel::ChannelDriver;
use warden::config::WardenConfig;
use warden::dedup::BlockReason;
use warden::evolution::{notify, workspace};
use warden::git_ops::{GitRepo, VersionControl};
use warden::pipeline::{Admission, Delivery};
use warden::reasoning::{ReasoningBackend, ReasoningError, ReasoningOutput, ReasoningRequest};
use warden::runtime::WorkerRuntime;
use warden::state::Database;
use warden::supervisor::{ChildProcess, ChildStatus, ProcessLauncher, StopReason, Supervisor};
use warden::types::*;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

type Outbox = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Clone, Default)]
struct FakeChannel {
    inbox: Arc<Mutex<VecDeque<InboundEvent>>>,
    outbox: Outbox,
    failing_sends: Arc<Mutex<u32>>,
}

impl FakeChannel {
    fn deliver(&self, sender: &str, uid: Option<u64>, text: &str) {
        self.inbox.lock().unwrap().push_back(InboundEvent {
            sender: sender.into(),
            text: text.into(),
            room: None,
            sender_uid: uid,
            kind: MessageKind::Text,
            handle: String::new(),
        });
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.outbox.lock().unwrap().clone()
    }

    /// Make the next `n` sends fail.
    fn fail_next(&self, n: u32) {
        *self.failing_sends.lock().unwrap() = n;
    }
}

#[async_trait]
impl ChannelDriver for FakeChannel {
    async fn poll(&mut self) -> Result<Vec<InboundEvent>> {
        Ok(self.inbox.lock().unwrap().drain(..).collect())
    }

    async fn send(&mut self, recipient: &str, content: &OutboundContent) -> Result<()> {
        {
            let mut failing = self.failing_sends.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("client window not found");
            }
        }
        if let OutboundContent::Text(text) = content {
            self.outbox
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.clone()));
        }
        Ok(())
    }
}

/// Replies with a canned text per input; counts calls.
#[derive(Default)]
struct CannedBackend {
    replies: Vec<(&'static str, &'static str)>,
    calls: Mutex<u32>,
}

#[async_trait]
impl ReasoningBackend for CannedBackend {
    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError> {
        *self.calls.lock().unwrap() += 1;
        let reply = self
            .replies
            .iter()
            .find(|(input, _)| *input == request.input)
            .map(|(_, reply)| *reply)
            .unwrap_or("I see.");
        Ok(ReasoningOutput::text(reply))
    }
}

/// Proposes one file change, then asks for a hot reload.
struct EvolvingBackend {
    path: &'static str,
    content: &'static str,
    reason: &'static str,
}

impl EvolvingBackend {
    fn greeting() -> Self {
        Self {
            path: "prompts/greeting.md",
            content: "Good morning!",
            reason: "friendlier greeting",
        }
    }

    fn terse_prompt() -> Self {
        Self {
            path: "prompts/system.md",
            content: "You answer in one short sentence.",
            reason: "terser answers",
        }
    }
}

#[async_trait]
impl ReasoningBackend for EvolvingBackend {
    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError> {
        let call = match request.exchanges.len() {
            0 => ToolCall {
                id: "call-1".into(),
                name: "evolve_code".into(),
                arguments: serde_json::json!({
                    "path": self.path,
                    "content": self.content,
                    "reason": self.reason,
                }),
            },
            1 => ToolCall {
                id: "call-2".into(),
                name: "request_hot_reload".into(),
                arguments: serde_json::json!({ "reason": self.reason }),
            },
            _ => return Ok(ReasoningOutput::text("Done.")),
        };
        Ok(ReasoningOutput {
            tool_calls: vec![call],
            ..Default::default()
        })
    }
}

/// Remembers the system prompt of every request.
#[derive(Default)]
struct RecordingBackend {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ReasoningBackend for RecordingBackend {
    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError> {
        self.prompts.lock().unwrap().push(request.system_prompt.clone());
        Ok(ReasoningOutput::text("Noted."))
    }
}

/// Always out of balance.
struct BrokeBackend;

#[async_trait]
impl ReasoningBackend for BrokeBackend {
    async fn invoke(&self, _: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError> {
        Err(ReasoningError::TerminalUpstream("insufficient balance".into()))
    }
}

/// Its poll panics, taking the listener task down.
struct PanickingChannel;

#[async_trait]
impl ChannelDriver for PanickingChannel {
    async fn poll(&mut self) -> Result<Vec<InboundEvent>> {
        panic!("bridge state corrupted");
    }

    async fn send(&mut self, _: &str, _: &OutboundContent) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeVcs {
    commits: Mutex<Vec<String>>,
    reverts: Mutex<u32>,
}

impl VersionControl for FakeVcs {
    fn commit(&self, _paths: &[PathBuf], message: &str) -> Result<Option<String>> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(Some(format!("commit{}", commits.len())))
    }

    fn revert_to_previous(&self) -> Result<String> {
        *self.reverts.lock().unwrap() += 1;
        Ok("commit0".into())
    }

    fn head(&self) -> Result<Option<String>> {
        Ok(self.commits.lock().unwrap().last().cloned())
    }
}

struct ScriptedLauncher {
    codes: Mutex<VecDeque<i32>>,
}

struct Finished(i32);

impl ChildProcess for Finished {
    fn poll(&mut self) -> Result<ChildStatus> {
        Ok(ChildStatus::Exited(Some(self.0)))
    }
    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
    fn id(&self) -> Option<u32> {
        None
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn spawn(&self, _command: &[String]) -> Result<Box<dyn ChildProcess>> {
        let code = self.codes.lock().unwrap().pop_front().unwrap_or(0);
        Ok(Box::new(Finished(code)))
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn test_config(dir: &Path) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.auth.root_uid = Some(1);
    config.auth.root_name = "owner".into();
    config.reasoning.api_key = "test".into();
    config.reasoning.calls_per_minute = 6000;
    config.channel.cooldown_ms = 0;
    config.channel.send_retry_delay_ms = 1;
    config.db_path = dir.join("state.db").to_string_lossy().into_owned();
    config.evolution.repo_dir = dir.join("workspace").to_string_lossy().into_owned();
    config.evolution.pending_path = dir.join("pending.json").to_string_lossy().into_owned();
    config.scheduler.enabled = false;
    config.validate_worker().unwrap();
    config
}

fn open_db(config: &WardenConfig) -> Database {
    let db = Database::open(Path::new(&config.resolved_db_path())).unwrap();
    db.set_permission("alice", RoleLevel::Guest, "test").unwrap();
    db.set_permission("bob", RoleLevel::Guest, "test").unwrap();
    db
}

fn build(
    config: &WardenConfig,
    backend: Arc<dyn ReasoningBackend>,
    channel: &FakeChannel,
    vcs: Arc<dyn VersionControl>,
) -> WorkerRuntime {
    WorkerRuntime::build(
        config.clone(),
        open_db(config),
        backend,
        Box::new(channel.clone()),
        vcs,
    )
}

async fn next_message(runtime: &WorkerRuntime) -> IncomingMessage {
    runtime
        .queue
        .pop_timeout(Duration::from_millis(100))
        .await
        .expect("queued message")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_hello_is_processed_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let backend = Arc::new(CannedBackend {
        replies: vec![("hello", "Hello alice, how can I help?")],
        ..Default::default()
    });
    let runtime = build(&config, backend.clone(), &channel, Arc::new(FakeVcs::default()));

    channel.deliver("alice", Some(42), "hello");
    channel.deliver("alice", Some(42), "hello");
    let admissions = runtime.listener.poll_once().await.unwrap();
    assert_eq!(
        admissions,
        vec![Admission::Queued { evicted: false }, Admission::Duplicate]
    );
    assert_eq!(runtime.queue.len(), 1);

    let msg = next_message(&runtime).await;
    let delivery = runtime.worker.process(msg).await.unwrap();
    assert_eq!(delivery, Delivery::Sent("Hello alice, how can I help?".into()));
    assert_eq!(*backend.calls.lock().unwrap(), 1);
    assert_eq!(
        channel.sent(),
        vec![("alice".to_string(), "Hello alice, how can I help? (AI)".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_reply_is_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let backend = Arc::new(CannedBackend {
        replies: vec![("thanks for the help", "Thanks!"), ("thanks again", "Thanks!")],
        ..Default::default()
    });
    let runtime = build(&config, backend, &channel, Arc::new(FakeVcs::default()));

    channel.deliver("bob", Some(7), "thanks for the help");
    channel.deliver("bob", Some(7), "thanks again");
    runtime.listener.poll_once().await.unwrap();

    let first = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(first, Delivery::Sent("Thanks!".into()));
    let second = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(second, Delivery::Suppressed(BlockReason::Duplicate));
    assert_eq!(BlockReason::Duplicate.to_string(), "duplicate reply");
    assert_eq!(channel.sent().len(), 1);

    let audit = runtime.db.lock().await.recent_audit(1).unwrap();
    assert_eq!(audit[0].outcome, AuditOutcome::Fail);
    assert!(audit[0].action.as_deref().unwrap().contains("duplicate reply"));
}

#[tokio::test(flavor = "multi_thread")]
async fn echoed_reply_is_not_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let runtime = build(
        &config,
        Arc::new(CannedBackend::default()),
        &channel,
        Arc::new(FakeVcs::default()),
    );

    channel.deliver("alice", Some(42), "what time is it");
    runtime.listener.poll_once().await.unwrap();
    runtime.worker.process(next_message(&runtime).await).await.unwrap();

    // The client echoes our own reply back into the inbox.
    channel.deliver("alice", Some(42), "I see. (AI)");
    let admissions = runtime.listener.poll_once().await.unwrap();
    assert_eq!(admissions, vec![Admission::Ignored]);
    assert!(runtime.queue.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn spoofed_privileged_command_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let runtime = build(
        &config,
        Arc::new(CannedBackend::default()),
        &channel,
        Arc::new(FakeVcs::default()),
    );

    channel.deliver("owner", Some(666), "#restart");
    let admissions = runtime.listener.poll_once().await.unwrap();
    assert_eq!(admissions, vec![Admission::Spoofed]);

    let audit = runtime.db.lock().await.recent_audit(5).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].outcome, AuditOutcome::Denied);
    assert_eq!(audit[0].command, "#restart");
    assert!(!runtime.exit.is_stopping());
    assert!(runtime.queue.is_empty());
    assert!(channel.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stranger_is_ignored_and_root_command_is_challenged() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let runtime = build(
        &config,
        Arc::new(CannedBackend::default()),
        &channel,
        Arc::new(FakeVcs::default()),
    );

    channel.deliver("mallory", Some(99), "hi");
    channel.deliver("owner", Some(1), "#isolate");
    let admissions = runtime.listener.poll_once().await.unwrap();
    assert_eq!(admissions[0], Admission::Stranger);
    match &admissions[1] {
        Admission::Command(outcome) => {
            assert!(outcome.reply.starts_with("Confirm with #confirm"));
            assert_eq!(outcome.exit, None);
        }
        other => panic!("expected command, got {:?}", other),
    }
    assert!(!runtime.exit.is_stopping());
}

#[tokio::test(flavor = "multi_thread")]
async fn evolution_hot_reload_reports_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let vcs = Arc::new(FakeVcs::default());
    let channel = FakeChannel::default();
    let runtime = build(&config, Arc::new(EvolvingBackend::greeting()), &channel, vcs.clone());

    channel.deliver("owner", Some(1), "please make the greeting friendlier");
    runtime.listener.poll_once().await.unwrap();
    let delivery = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(delivery, Delivery::Sent("Restarting to apply changes.".into()));

    assert_eq!(runtime.exit.signal(), ExitSignal::HotReload);
    assert_eq!(
        *vcs.commits.lock().unwrap(),
        vec!["[auto-evolve] friendlier greeting".to_string()]
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("workspace/prompts/greeting.md")).unwrap(),
        "Good morning!"
    );
    let pending_path = PathBuf::from(config.resolved_pending_path());
    let pending = notify::read_pending(&pending_path).unwrap().unwrap();
    assert_eq!(pending.target.as_deref(), Some("owner"));
    drop(runtime);

    // Next worker generation.
    let channel = FakeChannel::default();
    let runtime = build(&config, Arc::new(EvolvingBackend::greeting()), &channel, vcs);
    runtime.complete_reload().await.unwrap();
    assert_eq!(
        channel.sent(),
        vec![(
            "owner".to_string(),
            "Restart complete: friendlier greeting (AI)".to_string()
        )]
    );
    assert!(notify::read_pending(&pending_path).unwrap().is_none());
    let records = runtime.db.lock().await.recent_evolutions(1).unwrap();
    assert_eq!(records[0].stage, EvolutionStage::Reloaded);

    // Marker is gone: a second start sends nothing.
    runtime.complete_reload().await.unwrap();
    assert_eq!(channel.sent().len(), 1);
}

fn supervisor(codes: &[i32], vcs: Arc<dyn VersionControl>) -> Supervisor {
    let config = warden::config::schema::SupervisorConfig {
        restart_delay_ms: 0,
        reload_delay_ms: 0,
        poll_interval_ms: 1,
        ..Default::default()
    };
    let launcher = Arc::new(ScriptedLauncher {
        codes: Mutex::new(codes.iter().copied().collect()),
    });
    Supervisor::new(&config, vec!["warden".into(), "run".into()], launcher, vcs)
}

#[tokio::test]
async fn three_hot_reloads_respawn_without_counting() {
    let vcs = Arc::new(FakeVcs::default());
    let mut s = supervisor(&[100, 100, 100, 0], vcs.clone());
    let report = s.run(CancellationToken::new()).await;
    assert_eq!(report.reloads, 3);
    assert_eq!(report.spawns, 4);
    assert_eq!(report.stop, StopReason::Normal);
    assert_eq!(s.crash_count(), 0);
    assert_eq!(*vcs.reverts.lock().unwrap(), 0);
}

#[tokio::test]
async fn three_quick_crashes_roll_back_once() {
    let vcs = Arc::new(FakeVcs::default());
    let mut s = supervisor(&[7, 7, 7, 0], vcs.clone());
    let report = s.run(CancellationToken::new()).await;
    assert_eq!(*vcs.reverts.lock().unwrap(), 1);
    assert_eq!(report.rollbacks, 1);
    assert_eq!(report.spawns, 4);
    assert_eq!(s.crash_count(), 0);
}

#[tokio::test]
async fn isolation_is_never_respawned() {
    let vcs = Arc::new(FakeVcs::default());
    let mut s = supervisor(&[999, 0], vcs);
    let report = s.run(CancellationToken::new()).await;
    assert_eq!(report.stop, StopReason::Isolated);
    assert_eq!(report.spawns, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn short_questions_still_get_answers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let backend = Arc::new(CannedBackend {
        replies: vec![
            ("?", "Could you tell me more about what you need?"),
            ("1", "Great, option one it is."),
        ],
        ..Default::default()
    });
    let runtime = build(&config, backend, &channel, Arc::new(FakeVcs::default()));

    channel.deliver("alice", Some(42), "?");
    channel.deliver("bob", Some(7), "1");
    runtime.listener.poll_once().await.unwrap();

    let first = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(
        first,
        Delivery::Sent("Could you tell me more about what you need?".into())
    );
    let second = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(second, Delivery::Sent("Great, option one it is.".into()));
    assert_eq!(channel.sent().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_credit_notice_is_repeated_per_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let runtime = build(&config, Arc::new(BrokeBackend), &channel, Arc::new(FakeVcs::default()));

    channel.deliver("alice", Some(42), "hello");
    channel.deliver("alice", Some(42), "are you there?");
    runtime.listener.poll_once().await.unwrap();

    let notice = config.reasoning.terminal_message.clone();
    for _ in 0..2 {
        let delivery = runtime.worker.process(next_message(&runtime).await).await.unwrap();
        assert_eq!(delivery, Delivery::Notice(notice.clone()));
    }
    let sent = channel.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1, format!("{} (AI)", notice));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_send_is_retried_and_not_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = FakeChannel::default();
    let backend = Arc::new(CannedBackend {
        replies: vec![
            ("ping", "pong"),
            ("ping again", "pong twice"),
            ("ping once more", "pong twice"),
        ],
        ..Default::default()
    });
    let runtime = build(&config, backend, &channel, Arc::new(FakeVcs::default()));

    // One failure is absorbed by the retry.
    channel.fail_next(1);
    channel.deliver("alice", Some(42), "ping");
    runtime.listener.poll_once().await.unwrap();
    let delivery = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(delivery, Delivery::Sent("pong".into()));
    assert_eq!(channel.sent().len(), 1);

    // Every attempt fails: the message is dropped with an error.
    channel.fail_next(config.channel.send_attempts);
    channel.deliver("alice", Some(42), "ping again");
    runtime.listener.poll_once().await.unwrap();
    assert!(runtime.worker.process(next_message(&runtime).await).await.is_err());
    assert_eq!(channel.sent().len(), 1);

    // The undelivered reply was never recorded, so it may go out now.
    channel.deliver("alice", Some(42), "ping once more");
    runtime.listener.poll_once().await.unwrap();
    let delivery = runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(delivery, Delivery::Sent("pong twice".into()));
    assert_eq!(channel.sent().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn evolved_prompt_reaches_the_next_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    workspace::seed(&config).unwrap();
    let vcs = Arc::new(FakeVcs::default());

    let channel = FakeChannel::default();
    let runtime = build(&config, Arc::new(EvolvingBackend::terse_prompt()), &channel, vcs.clone());
    channel.deliver("owner", Some(1), "answer more briefly from now on");
    runtime.listener.poll_once().await.unwrap();
    runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(runtime.exit.signal(), ExitSignal::HotReload);
    drop(runtime);

    let backend = Arc::new(RecordingBackend::default());
    let channel = FakeChannel::default();
    let runtime = build(&config, backend.clone(), &channel, vcs);
    channel.deliver("alice", Some(42), "hello");
    runtime.listener.poll_once().await.unwrap();
    runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_eq!(
        *backend.prompts.lock().unwrap(),
        vec!["You answer in one short sentence.".to_string()]
    );
}

fn git_repo(config: &WardenConfig) -> Arc<GitRepo> {
    let repo = GitRepo::new(
        Path::new(&config.resolved_repo_dir()),
        &config.evolution.author_name,
        &config.evolution.author_email,
    )
    .with_evolution_prefix(&config.evolution.commit_prefix);
    repo.init().unwrap();
    Arc::new(repo)
}

#[tokio::test]
async fn fresh_install_crash_loops_keep_supervising() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    workspace::seed(&config).unwrap();
    let repo = git_repo(&config);
    let baseline = repo.head().unwrap();

    let mut s = supervisor(&[7, 7, 7, 7, 7, 7, 0], repo.clone());
    let report = s.run(CancellationToken::new()).await;
    assert_eq!(report.stop, StopReason::Normal);
    assert_eq!(report.spawns, 7);
    assert_eq!(report.rollbacks, 2);
    assert_eq!(repo.head().unwrap(), baseline);
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_loop_rolls_back_the_evolved_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    workspace::seed(&config).unwrap();
    let repo = git_repo(&config);
    let baseline = repo.head().unwrap();

    let channel = FakeChannel::default();
    let runtime = build(&config, Arc::new(EvolvingBackend::terse_prompt()), &channel, repo.clone());
    channel.deliver("owner", Some(1), "answer more briefly from now on");
    runtime.listener.poll_once().await.unwrap();
    runtime.worker.process(next_message(&runtime).await).await.unwrap();
    assert_ne!(repo.head().unwrap(), baseline);
    assert_eq!(
        workspace::load_system_prompt(&config).unwrap(),
        "You answer in one short sentence."
    );
    drop(runtime);

    let state = Database::open(Path::new(&config.resolved_db_path())).unwrap();
    let mut s = supervisor(&[7, 7, 7, 0], repo.clone()).with_state(state);
    let report = s.run(CancellationToken::new()).await;
    assert_eq!(report.rollbacks, 1);
    assert_eq!(report.spawns, 4);
    assert_eq!(report.stop, StopReason::Normal);

    assert_eq!(repo.head().unwrap(), baseline);
    assert_eq!(
        workspace::load_system_prompt(&config).unwrap(),
        config.reasoning.system_prompt
    );
    let records = s.state().unwrap().recent_evolutions(1).unwrap();
    assert_eq!(records[0].stage, EvolutionStage::RolledBack);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_listener_ends_the_worker_as_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let runtime = WorkerRuntime::build(
        config.clone(),
        open_db(&config),
        Arc::new(CannedBackend::default()),
        Box::new(PanickingChannel),
        Arc::new(FakeVcs::default()),
    );

    let signal = tokio::time::timeout(Duration::from_secs(20), runtime.run())
        .await
        .expect("worker stopped")
        .unwrap();
    assert_eq!(signal, ExitSignal::Crash(None));
}
