//! The dual-shell orchestrator.
//!
//! [`App`] owns every piece of mutable state: the remote session handle, the
//! local runner, the deployment sequencer and the three content buffers.
//! Background tasks never touch it directly. They feed bounded channels which
//! [`App::tick`] drains a bounded number of messages at a time, so a chatty
//! stream cannot starve the other one or the renderer.

pub mod buffer;
pub mod event;
pub mod input;
pub mod keys;

pub use buffer::{ContentBuffer, LogBuffer, LogEntry, LogLevel};
pub use event::{AppEvent, ConnectionState};
pub use input::{History, InputLine};
pub use keys::{Action, EditMode, ShellMode};

use std::sync::Arc;
use std::time::Duration;

use crossterm::event::KeyEvent;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::deploy::{DeploymentCursor, DeploymentPlan, Dispatch, Sequencer, SequencerState};
use crate::resolver::{self, ConnectionEndpoint};
use crate::session::{
    ConnectError, Connected, Connector, InvocationId, LocalCommandError, LocalEvent,
    LocalRunner, OutputQueue, QueueStats, RemoteEvent, RemoteSession, SessionError,
};

/// Maximum messages taken from each channel per tick.
pub const DRAIN_BUDGET: usize = 10;

const LOCAL_CHANNEL_CAPACITY: usize = 100;
const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// End-of-text, what a terminal sends for Ctrl+C.
const ETX: u8 = 0x03;

/// Orchestrator settings derived from the configuration.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub instance_name: String,
    pub shell: String,
    pub settle_delay: Duration,
    pub shell_warmup: Duration,
    pub initial_command: Option<String>,
    pub show_debug: bool,
    /// `user@host` shown before echoed local commands.
    pub local_identity: String,
}

impl AppSettings {
    pub fn from_config(config: &Config, show_debug: bool) -> Self {
        Self {
            instance_name: config.instance.name.clone(),
            shell: config.session.shell.clone(),
            settle_delay: config.session.settle_delay(),
            shell_warmup: config.session.shell_warmup(),
            initial_command: config.initial_command().map(str::to_string),
            show_debug,
            local_identity: format!(
                "{}@{}",
                resolver::local_username(),
                resolver::local_hostname()
            ),
        }
    }
}

/// Scroll offsets in lines up from the bottom of each pane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scroll {
    pub local: u16,
    pub remote: u16,
}

/// Who started the running local command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalOwner {
    Operator,
    Step(usize),
}

/// The orchestrator state.
pub struct App<C> {
    connector: Arc<C>,
    settings: AppSettings,
    cancel: CancellationToken,

    session: Option<RemoteSession>,
    endpoint: Option<ConnectionEndpoint>,
    connection: ConnectionState,
    remote_queue: OutputQueue<RemoteEvent>,
    remote_rx: mpsc::Receiver<RemoteEvent>,
    pending_size: Option<(u16, u16)>,

    runner: LocalRunner,
    local_rx: mpsc::Receiver<LocalEvent>,
    local_owner: Option<(InvocationId, LocalOwner)>,

    control_tx: mpsc::Sender<AppEvent>,
    control_rx: mpsc::Receiver<AppEvent>,

    sequencer: Sequencer,
    deferred: Option<Dispatch>,

    local: ContentBuffer,
    remote: ContentBuffer,
    log: LogBuffer,

    input: InputLine,
    history: History,
    shell_mode: ShellMode,
    edit_mode: EditMode,
    prompting: bool,
    scroll: Scroll,

    dirty: bool,
    should_quit: bool,
}

impl<C: Connector> App<C> {
    /// Must be called from within a tokio runtime.
    pub fn new(connector: C, plan: DeploymentPlan, settings: AppSettings) -> Self {
        let cancel = CancellationToken::new();
        let (remote_queue, remote_rx) = OutputQueue::new("remote");
        let (local_tx, local_rx) = mpsc::channel(LOCAL_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let runner = LocalRunner::new(settings.shell.clone(), local_tx, cancel.child_token());
        let log = LogBuffer::new(buffer::LOG_CAPACITY, settings.show_debug);

        Self {
            connector: Arc::new(connector),
            settings,
            cancel,
            session: None,
            endpoint: None,
            connection: ConnectionState::Connecting,
            remote_queue,
            remote_rx,
            pending_size: None,
            runner,
            local_rx,
            local_owner: None,
            control_tx,
            control_rx,
            sequencer: Sequencer::new(plan),
            deferred: None,
            local: ContentBuffer::new(),
            remote: ContentBuffer::new(),
            log,
            input: InputLine::new(),
            history: History::new(),
            shell_mode: ShellMode::default(),
            edit_mode: EditMode::default(),
            prompting: false,
            scroll: Scroll::default(),
            dirty: true,
            should_quit: false,
        }
    }

    /// Starts the first connection attempt.
    pub fn start(&mut self) {
        self.log
            .info(format!("Connecting to {}...", self.settings.instance_name));
        self.spawn_connect(SecretString::from(String::new()));
    }

    /// Sender for events from outside the control loop.
    pub fn event_sender(&self) -> mpsc::Sender<AppEvent> {
        self.control_tx.clone()
    }

    /// One pass of the control loop. Never waits.
    ///
    /// Returns whether anything changed.
    pub fn tick(&mut self) -> bool {
        let mut changed = false;

        for _ in 0..DRAIN_BUDGET {
            let Ok(event) = self.control_rx.try_recv() else {
                break;
            };
            self.handle_event(event);
            changed = true;
        }

        for _ in 0..DRAIN_BUDGET {
            let Ok(event) = self.remote_rx.try_recv() else {
                break;
            };
            self.on_remote_event(event);
            changed = true;
        }

        for _ in 0..DRAIN_BUDGET {
            let Ok(event) = self.local_rx.try_recv() else {
                break;
            };
            self.on_local_event(event);
            changed = true;
        }

        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Handles one event.
    pub fn handle_event(&mut self, event: AppEvent) {
        self.dirty = true;
        match event {
            AppEvent::Key(key) => self.handle_key(key),
            AppEvent::Resize { cols, rows } => self.on_resize(cols, rows),
            AppEvent::Connected(result) => self.on_connected(*result),
            AppEvent::ShellReady => self.on_shell_ready(),
            AppEvent::RemoteStepSettled { index } => self.on_step_settled(index),
            AppEvent::Quit => self.quit(),
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) {
        let action = keys::map_key(key, self.edit_mode, self.prompting);
        self.apply(action);
    }

    /// Returns whether a render is due and clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Closes the remote session and cancels all background work.
    pub fn quit(&mut self) {
        if self.should_quit {
            return;
        }
        self.should_quit = true;
        info!("Shutting down");
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.cancel.cancel();
    }

    /// Closes the session and waits for its pump to stop.
    pub async fn shutdown(&mut self) {
        self.quit();
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
    }

    pub fn local_buffer(&self) -> &ContentBuffer {
        &self.local
    }

    pub fn remote_buffer(&self) -> &ContentBuffer {
        &self.remote
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn input(&self) -> &InputLine {
        &self.input
    }

    pub fn is_prompting(&self) -> bool {
        self.prompting
    }

    pub fn shell_mode(&self) -> ShellMode {
        self.shell_mode
    }

    pub fn edit_mode(&self) -> EditMode {
        self.edit_mode
    }

    pub fn scroll(&self) -> Scroll {
        self.scroll
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn endpoint(&self) -> Option<&ConnectionEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn sequencer_state(&self) -> &SequencerState {
        self.sequencer.state()
    }

    pub fn cursor(&self) -> DeploymentCursor {
        self.sequencer.cursor()
    }

    pub fn plan_len(&self) -> usize {
        self.sequencer.plan().len()
    }

    pub fn remote_stats(&self) -> Option<QueueStats> {
        self.session.as_ref().map(RemoteSession::stats)
    }

    pub fn local_busy(&self) -> bool {
        self.runner.is_busy()
    }

    pub fn instance_name(&self) -> &str {
        &self.settings.instance_name
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Quit => self.quit(),
            Action::EnterNormal => self.edit_mode = EditMode::Normal,
            Action::EnterInsert => self.edit_mode = EditMode::Insert,
            Action::ToggleShell => {
                self.shell_mode = self.shell_mode.toggle();
                self.log
                    .debug(format!("Switched to {} shell", self.shell_mode.label()));
            }
            Action::Submit => self.submit(),
            Action::Cancel => self.cancel_prompt(),
            Action::Interrupt => self.interrupt(),
            Action::HistoryPrev => {
                if let Some(entry) = self.history.prev(self.input.as_str()) {
                    self.input.set(entry);
                }
            }
            Action::HistoryNext => {
                if let Some(entry) = self.history.next() {
                    self.input.set(entry);
                }
            }
            Action::Insert(c) => self.input.insert(c),
            Action::Backspace => self.input.backspace(),
            Action::Delete => self.input.delete(),
            Action::Left => self.input.left(),
            Action::Right => self.input.right(),
            Action::Home => self.input.home(),
            Action::End => self.input.end(),
            Action::ScrollUp(n) => {
                let max = self.active_buffer().max_scroll();
                let offset = self.active_scroll();
                *offset = offset.saturating_add(n).min(max);
            }
            Action::ScrollDown(n) => {
                let offset = self.active_scroll();
                *offset = offset.saturating_sub(n);
            }
            Action::ScrollBottom => *self.active_scroll() = 0,
            Action::None => {}
        }
    }

    fn active_buffer(&self) -> &ContentBuffer {
        match self.shell_mode {
            ShellMode::Remote => &self.remote,
            ShellMode::Local => &self.local,
        }
    }

    fn active_scroll(&mut self) -> &mut u16 {
        match self.shell_mode {
            ShellMode::Remote => &mut self.scroll.remote,
            ShellMode::Local => &mut self.scroll.local,
        }
    }

    fn submit(&mut self) {
        if self.prompting {
            self.submit_passphrase();
            return;
        }

        if self.sequencer.is_running() {
            self.log
                .info("Deployment in progress, manual input is disabled until it finishes");
            return;
        }

        let line = self.input.take();
        self.history.push(&line);

        match self.shell_mode {
            ShellMode::Remote => {
                self.scroll.remote = 0;
                if let Err(e) = self.write_remote_line(&line) {
                    self.log.error(format!("Failed to send command: {e}"));
                }
            }
            ShellMode::Local => {
                if line.trim().is_empty() {
                    return;
                }
                self.scroll.local = 0;
                if self.runner.is_busy() {
                    self.log.error("A local command is still running");
                    return;
                }
                self.run_local(&line, LocalOwner::Operator);
            }
        }
    }

    fn submit_passphrase(&mut self) {
        if self.input.is_empty() {
            self.log.info("Passphrase cannot be empty");
            return;
        }
        let passphrase = SecretString::from(self.input.take());
        self.prompting = false;
        self.log.info("Retrying connection with passphrase...");
        self.spawn_connect(passphrase);
    }

    fn cancel_prompt(&mut self) {
        if !self.prompting {
            return;
        }
        self.prompting = false;
        self.input.clear();
        self.connection = ConnectionState::Failed("passphrase entry cancelled".to_string());
        self.log
            .info("Passphrase entry cancelled, remote session not started");
    }

    fn interrupt(&mut self) {
        match self.shell_mode {
            ShellMode::Remote => match self.session.as_ref() {
                Some(session) => {
                    if let Err(e) = session.write(&[ETX]) {
                        self.log.error(format!("Failed to send interrupt: {e}"));
                    }
                }
                None => self.log.debug("No remote session to interrupt"),
            },
            ShellMode::Local => match self.runner.interrupt() {
                Ok(true) => self.log.debug("Sent SIGINT to local command"),
                Ok(false) => self.log.debug("No local command to interrupt"),
                Err(e) => self.log.error(format!("Failed to interrupt: {e}")),
            },
        }
    }

    fn on_resize(&mut self, cols: u16, rows: u16) {
        self.pending_size = Some((cols, rows));
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.resize(cols, rows) {
                debug!(error = %e, cols, rows, "Resize not applied");
            }
        }
    }

    fn spawn_connect(&mut self, passphrase: SecretString) {
        self.connection = ConnectionState::Connecting;
        let connector = Arc::clone(&self.connector);
        let queue = self.remote_queue.clone();
        let cancel = self.cancel.child_token();
        let tx = self.control_tx.clone();

        tokio::spawn(async move {
            let result = connector.connect(passphrase, queue, cancel).await;
            if tx.send(AppEvent::Connected(Box::new(result))).await.is_err() {
                debug!("Control loop gone before connection finished");
            }
        });
    }

    fn on_connected(&mut self, result: Result<Connected, ConnectError>) {
        match result {
            Ok(Connected {
                mut session,
                endpoint,
            }) => {
                if self.should_quit {
                    session.close();
                    return;
                }
                if let Some((cols, rows)) = self.pending_size {
                    if let Err(e) = session.resize(cols, rows) {
                        debug!(error = %e, "Initial resize not applied");
                    }
                }
                self.log.success(format!(
                    "Connected to {} ({}) as {}",
                    endpoint.name, endpoint.address, endpoint.login_user
                ));
                self.session = Some(session);
                self.endpoint = Some(endpoint);
                self.connection = ConnectionState::Connected;
                self.schedule(self.settings.shell_warmup, AppEvent::ShellReady);
            }
            Err(e) if e.needs_passphrase() => {
                self.connection = ConnectionState::AwaitingPassphrase;
                self.prompting = true;
                self.edit_mode = EditMode::Insert;
                self.input.clear();
                self.log
                    .info("SSH key is encrypted. Enter passphrase and press Enter (Esc to cancel)");
            }
            Err(e) => {
                self.log.error(format!("Failed to connect: {e}"));
                self.connection = ConnectionState::Failed(e.to_string());
            }
        }
    }

    fn on_shell_ready(&mut self) {
        if self.session.is_none() {
            return;
        }

        if self.sequencer.plan().is_empty() {
            // An empty plan completes without dispatching anything.
            if self.sequencer.start().is_ok() {
                if let Some(command) = self.settings.initial_command.clone() {
                    match self.write_remote_line(&command) {
                        Ok(()) => self.log.info(format!("Sent initial command: {command}")),
                        Err(e) => self.log.error(format!("Failed to send command: {e}")),
                    }
                }
            }
            return;
        }

        match self.sequencer.start() {
            Ok(dispatch) => {
                self.log.info(format!(
                    "Starting deployment ({} steps)",
                    self.sequencer.plan().len()
                ));
                self.dispatch(dispatch);
            }
            Err(e) => debug!(error = %e, "Deployment not started"),
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let total = self.sequencer.plan().len();
        match dispatch {
            Dispatch::Local { index, command } => {
                if self.runner.is_busy() {
                    debug!(step = index, "Waiting for running local command");
                    self.deferred = Some(Dispatch::Local { index, command });
                    return;
                }
                self.log
                    .step(format!("[{}/{}] local: {}", index + 1, total, command));
                self.run_local(&command, LocalOwner::Step(index));
            }
            Dispatch::Remote { index, command } => {
                self.log
                    .step(format!("[{}/{}] remote: {}", index + 1, total, command));
                match self.write_remote_line(&command) {
                    Ok(()) => self.schedule(
                        self.settings.settle_delay,
                        AppEvent::RemoteStepSettled { index },
                    ),
                    Err(e) => self.fail_step(index, &format!("remote shell unavailable: {e}")),
                }
            }
            Dispatch::Complete => {
                self.log.success(
                    "Deployment script completed. SSH session preserved for manual use.",
                );
            }
        }
    }

    fn fail_step(&mut self, index: usize, reason: &str) {
        if let Err(e) = self.sequencer.step_failed(index, reason) {
            debug!(error = %e, "Step failure not recorded");
            return;
        }
        self.log
            .error(format!("Deployment step {} failed: {}", index + 1, reason));
        self.log
            .info("Deployment aborted. Both shells remain available for manual use.");
    }

    fn on_step_settled(&mut self, index: usize) {
        match self.sequencer.step_finished(index) {
            Ok(dispatch) => self.dispatch(dispatch),
            Err(e) => debug!(error = %e, step = index, "Ignoring settle timer"),
        }
    }

    fn run_local(&mut self, command: &str, owner: LocalOwner) {
        self.local
            .push_line(&format!("{} $ {}", self.settings.local_identity, command));
        match self.runner.run(command) {
            Ok(id) => self.local_owner = Some((id, owner)),
            Err(e) => {
                self.local.push_line(&format!("Error: {e}"));
                if let LocalOwner::Step(index) = owner {
                    self.fail_step(index, &e.to_string());
                }
            }
        }
    }

    fn on_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Output { data, .. } => self.local.append(&data),
            LocalEvent::Finished { id, result } => {
                self.runner.complete(id);
                let owner = match self.local_owner {
                    Some((owner_id, owner)) if owner_id == id => {
                        self.local_owner = None;
                        Some(owner)
                    }
                    _ => None,
                };
                self.on_local_finished(owner, result);

                if !self.runner.is_busy() {
                    if let Some(dispatch) = self.deferred.take() {
                        self.dispatch(dispatch);
                    }
                }
            }
        }
    }

    fn on_local_finished(
        &mut self,
        owner: Option<LocalOwner>,
        result: Result<(), LocalCommandError>,
    ) {
        if let Err(e) = &result {
            self.local.push_line(&format!("Error: {e}"));
        }

        let Some(LocalOwner::Step(index)) = owner else {
            return;
        };
        match result {
            Ok(()) => match self.sequencer.step_finished(index) {
                Ok(dispatch) => self.dispatch(dispatch),
                Err(e) => debug!(error = %e, "Ignoring local completion"),
            },
            Err(e) => self.fail_step(index, &e.to_string()),
        }
    }

    fn on_remote_event(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Output(data) => self.remote.append(&data),
            RemoteEvent::WriteFailed(msg) => {
                self.log
                    .error(format!("Failed to write to remote shell: {msg}"));
            }
            RemoteEvent::Closed { exit_status, error } => {
                self.session = None;
                self.connection = ConnectionState::Closed;
                match error {
                    Some(e) => {
                        self.remote.push_line(&format!("[connection error: {e}]"));
                        self.log.error(format!("Remote session lost: {e}"));
                    }
                    None => match exit_status {
                        Some(code) => self
                            .log
                            .info(format!("Remote session closed (exit status {code})")),
                        None => self.log.info("Remote session closed"),
                    },
                }
            }
        }
    }

    fn write_remote_line(&self, line: &str) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::Closed)?;
        session.write(format!("{line}\n").as_bytes())
    }

    /// Delivers `event` to the control loop after `delay`, unless shut down.
    fn schedule(&self, delay: Duration, event: AppEvent) {
        let tx = self.control_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if tx.send(event).await.is_err() {
                        debug!("Control loop gone before timer fired");
                    }
                }
            }
        });
    }
}

impl<C> Drop for App<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialError;
    use crate::deploy::DeploymentStep;
    use crate::session::{ChannelEvent, ShellChannel};
    use crossterm::event::{KeyCode, KeyModifiers};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Remote channel that records writes and never produces output.
    struct SilentChannel {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl ShellChannel for SilentChannel {
        async fn next_event(&mut self) -> Result<Option<ChannelEvent>, SessionError> {
            std::future::pending().await
        }

        async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Needs a passphrase until it is given `expected`.
    struct PassphraseConnector {
        expected: &'static str,
        attempts: Arc<Mutex<Vec<String>>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Connector for PassphraseConnector {
        async fn connect(
            &self,
            passphrase: SecretString,
            output: OutputQueue<RemoteEvent>,
            cancel: CancellationToken,
        ) -> Result<Connected, ConnectError> {
            use secrecy::ExposeSecret;
            let given = passphrase.expose_secret().to_string();
            self.attempts.lock().unwrap().push(given.clone());
            if given != self.expected {
                return Err(ConnectError::Credentials(
                    CredentialError::NeedsPassphrase {
                        path: PathBuf::from("/keys/id"),
                    },
                ));
            }
            let channel = SilentChannel {
                written: Arc::clone(&self.written),
            };
            Ok(Connected {
                session: RemoteSession::attach(channel, output, cancel),
                endpoint: ConnectionEndpoint {
                    name: "vm".into(),
                    address: "192.0.2.1".into(),
                    internal_address: None,
                    login_user: "ops".into(),
                    status: "RUNNING".into(),
                },
            })
        }
    }

    struct Fixture {
        app: App<PassphraseConnector>,
        attempts: Arc<Mutex<Vec<String>>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    fn settings() -> AppSettings {
        AppSettings {
            instance_name: "vm".into(),
            shell: "/bin/sh".into(),
            settle_delay: Duration::from_millis(20),
            shell_warmup: Duration::from_millis(10),
            initial_command: Some("uptime".into()),
            show_debug: true,
            local_identity: "me@here".into(),
        }
    }

    fn fixture(expected: &'static str, plan: DeploymentPlan) -> Fixture {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::new(Mutex::new(Vec::new()));
        let connector = PassphraseConnector {
            expected,
            attempts: Arc::clone(&attempts),
            written: Arc::clone(&written),
        };
        Fixture {
            app: App::new(connector, plan, settings()),
            attempts,
            written,
        }
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text<C: Connector>(app: &mut App<C>, text: &str) {
        for c in text.chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
    }

    async fn tick_until<C: Connector>(app: &mut App<C>, mut done: impl FnMut(&App<C>) -> bool) {
        for _ in 0..300 {
            app.tick();
            if done(app) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_sends_initial_command() {
        let mut f = fixture("", DeploymentPlan::default());
        f.app.start();

        let written = Arc::clone(&f.written);
        tick_until(&mut f.app, |_| written.lock().unwrap().as_slice() == b"uptime\n").await;

        assert_eq!(f.app.connection(), &ConnectionState::Connected);
        assert_eq!(f.app.sequencer_state(), &SequencerState::Complete);
        assert!(f.app.log().contains("Connected to vm (192.0.2.1) as ops"));
        f.app.shutdown().await;
    }

    #[tokio::test]
    async fn test_passphrase_prompt_and_retry() {
        let mut f = fixture("correct horse", DeploymentPlan::default());
        f.app.start();

        tick_until(&mut f.app, |app| app.is_prompting()).await;
        assert_eq!(f.app.connection(), &ConnectionState::AwaitingPassphrase);

        // Empty submission is refused.
        f.app.handle_key(key(KeyCode::Enter));
        assert!(f.app.is_prompting());

        type_text(&mut f.app, "correct horse");
        assert_eq!(f.app.input().display(true), "*************");
        f.app.handle_key(key(KeyCode::Enter));
        assert!(!f.app.is_prompting());
        assert!(f.app.input().is_empty());

        tick_until(&mut f.app, |app| {
            app.connection() == &ConnectionState::Connected
        })
        .await;
        assert_eq!(
            f.attempts.lock().unwrap().as_slice(),
            &["".to_string(), "correct horse".to_string()]
        );
        f.app.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_passphrase_prompt() {
        let mut f = fixture("secret", DeploymentPlan::default());
        f.app.start();
        tick_until(&mut f.app, |app| app.is_prompting()).await;

        type_text(&mut f.app, "abc");
        f.app.handle_key(key(KeyCode::Esc));
        assert!(!f.app.is_prompting());
        assert!(matches!(f.app.connection(), ConnectionState::Failed(_)));
        assert_eq!(f.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_command_echoes_prompt() {
        let mut f = fixture("unreachable", DeploymentPlan::default());
        f.app.handle_key(key(KeyCode::BackTab));
        assert_eq!(f.app.shell_mode(), ShellMode::Local);

        type_text(&mut f.app, "echo hi");
        f.app.handle_key(key(KeyCode::Enter));

        tick_until(&mut f.app, |app| !app.local_busy()).await;
        tick_until(&mut f.app, |app| app.local_buffer().text().contains("hi\n")).await;
        assert!(f.app.local_buffer().text().starts_with("me@here $ echo hi\n"));
    }

    #[tokio::test]
    async fn test_local_failure_is_scoped_to_local_pane() {
        let mut f = fixture("unreachable", DeploymentPlan::default());
        f.app.handle_key(key(KeyCode::BackTab));
        type_text(&mut f.app, "exit 4");
        f.app.handle_key(key(KeyCode::Enter));

        tick_until(&mut f.app, |app| {
            app.local_buffer().text().contains("Error: exit status 4")
        })
        .await;
        assert!(f.app.remote_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_manual_input_refused_while_plan_runs() {
        let plan = DeploymentPlan::new(vec![DeploymentStep::local("sleep 0.3")]);
        let mut f = fixture("", plan);
        f.app.start();
        tick_until(&mut f.app, |app| {
            app.sequencer_state() == &SequencerState::Running(0)
        })
        .await;

        type_text(&mut f.app, "ls");
        f.app.handle_key(key(KeyCode::Enter));
        assert!(f.app.log().contains("manual input is disabled"));
        assert_eq!(f.app.input().as_str(), "ls");

        tick_until(&mut f.app, |app| {
            app.sequencer_state() == &SequencerState::Complete
        })
        .await;
        // The initial command is not sent when a plan runs.
        assert!(f.written.lock().unwrap().is_empty());
        f.app.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_local_step_aborts_plan() {
        let plan = DeploymentPlan::new(vec![
            DeploymentStep::local("exit 2"),
            DeploymentStep::remote("echo never"),
        ]);
        let mut f = fixture("", plan);
        f.app.start();

        tick_until(&mut f.app, |app| app.sequencer_state().is_terminal()).await;
        assert_eq!(
            f.app.sequencer_state(),
            &SequencerState::Aborted {
                index: 0,
                reason: "exit status 2".into()
            }
        );
        assert_eq!(f.app.cursor().current_index, 0);

        // The remote session survives and still takes manual input.
        assert_eq!(f.app.connection(), &ConnectionState::Connected);
        type_text(&mut f.app, "whoami");
        f.app.handle_key(key(KeyCode::Enter));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.written.lock().unwrap().as_slice(), b"whoami\n");
        f.app.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_step_waits_for_operator_command() {
        let plan = DeploymentPlan::new(vec![DeploymentStep::local("echo step")]);
        let mut f = fixture("", plan);
        f.app.handle_key(key(KeyCode::BackTab));
        type_text(&mut f.app, "sleep 0.3; echo operator");
        f.app.handle_key(key(KeyCode::Enter));
        assert!(f.app.local_busy());
        f.app.start();

        tick_until(&mut f.app, |app| {
            app.sequencer_state() == &SequencerState::Running(0)
        })
        .await;
        // The step is held back while the operator's command runs.
        assert!(f.app.local_busy());
        assert!(!f.app.local_buffer().text().contains("$ echo step"));

        tick_until(&mut f.app, |app| app.sequencer_state().is_terminal()).await;
        assert_eq!(f.app.sequencer_state(), &SequencerState::Complete);

        let text = f.app.local_buffer().text();
        let operator = text.find("\noperator\n").expect("operator output");
        let step = text.find("me@here $ echo step").expect("step prompt");
        assert!(operator < step);
        assert!(text.ends_with("step\n"));
        f.app.shutdown().await;
    }

    #[tokio::test]
    async fn test_normal_mode_scroll_and_quit() {
        let mut f = fixture("", DeploymentPlan::default());
        for i in 0..30 {
            f.app.remote.push_line(&format!("line {i}"));
        }
        // A 5 row pane over 30 lines can scroll up 25.
        f.app.remote.visible_lines(40, 5, 0);

        f.app.handle_key(key(KeyCode::Esc));
        assert_eq!(f.app.edit_mode(), EditMode::Normal);

        f.app.handle_key(key(KeyCode::Char('k')));
        f.app.handle_key(key(KeyCode::PageUp));
        assert_eq!(f.app.scroll().remote, 11);
        f.app.handle_key(key(KeyCode::Char('j')));
        assert_eq!(f.app.scroll().remote, 10);
        f.app.handle_key(key(KeyCode::Char('G')));
        assert_eq!(f.app.scroll().remote, 0);

        // Scrolling stops at the top of the content.
        for _ in 0..5 {
            f.app.handle_key(key(KeyCode::PageUp));
        }
        assert_eq!(f.app.scroll().remote, 25);
        f.app.handle_key(key(KeyCode::Char('j')));
        assert_eq!(f.app.scroll().remote, 24);

        // The local pane has nothing to scroll.
        f.app.handle_key(key(KeyCode::BackTab));
        f.app.handle_key(key(KeyCode::PageUp));
        assert_eq!(f.app.scroll().local, 0);

        f.app.handle_key(key(KeyCode::Char('q')));
        assert!(f.app.should_quit());
    }

    #[tokio::test]
    async fn test_history_recall() {
        let mut f = fixture("unreachable", DeploymentPlan::default());
        type_text(&mut f.app, "ls -la");
        f.app.handle_key(key(KeyCode::Enter));
        assert!(f.app.log().contains("Failed to send command"));

        f.app.handle_key(key(KeyCode::Up));
        assert_eq!(f.app.input().as_str(), "ls -la");
        f.app.handle_key(key(KeyCode::Down));
        assert_eq!(f.app.input().as_str(), "");
    }

    #[tokio::test]
    async fn test_take_dirty() {
        let mut f = fixture("", DeploymentPlan::default());
        assert!(f.app.take_dirty());
        assert!(!f.app.take_dirty());
        assert!(!f.app.tick());
        assert!(!f.app.take_dirty());

        f.app.handle_key(key(KeyCode::Char('x')));
        f.app.handle_event(AppEvent::Resize { cols: 90, rows: 30 });
        assert!(f.app.take_dirty());
    }
}
