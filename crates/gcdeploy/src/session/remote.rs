//! Remote terminal session.
//!
//! A [`RemoteSession`] is a handle to a pump task that owns the live shell
//! channel. The control loop only ever enqueues writes and resizes on the
//! handle; the pump performs them, and forwards everything the remote shell
//! prints into a bounded, lossy output queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{OutputQueue, QueueMonitor, QueueStats};

/// Default pseudo-terminal geometry.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Capacity of the write/resize command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur on an established remote session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("remote session is closed")]
    Closed,

    #[error("remote session is busy, write queue is full")]
    Busy,

    #[error("partial write: sent {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something the remote side produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
}

/// A live interactive shell on the remote host.
///
/// `next_event` must be cancel safe: the pump polls it inside `select!`.
pub trait ShellChannel: Send + 'static {
    /// Waits for the next event. `Ok(None)` means the channel is closed.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<ChannelEvent>, SessionError>> + Send;

    /// Sends bytes to the shell's input, returning how many were transmitted.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<usize, SessionError>> + Send;

    /// Changes the pseudo-terminal size.
    fn resize(&mut self, cols: u16, rows: u16)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Closes the channel and the transport underneath it.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Events delivered to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Bytes printed by the remote shell, stdout and stderr alike.
    Output(Vec<u8>),
    /// A queued write could not be fully transmitted.
    WriteFailed(String),
    /// The remote side went away. Not sent after an explicit close.
    Closed {
        exit_status: Option<u32>,
        error: Option<String>,
    },
}

enum SessionCommand {
    Write(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Handle to an open remote shell.
pub struct RemoteSession {
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    size: (u16, u16),
    monitor: QueueMonitor,
    task: Option<JoinHandle<()>>,
}

impl RemoteSession {
    /// Starts the pump for `channel`.
    ///
    /// `cancel` governs the pump; cancelling it (or calling [`close`]) stops
    /// all background work for this session.
    ///
    /// [`close`]: RemoteSession::close
    pub fn attach<C: ShellChannel>(
        channel: C,
        output: OutputQueue<RemoteEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let monitor = output.monitor();

        let task = tokio::spawn(pump(
            channel,
            command_rx,
            output,
            cancel.clone(),
            Arc::clone(&alive),
        ));

        Self {
            commands,
            cancel,
            alive,
            size: (DEFAULT_COLS, DEFAULT_ROWS),
            monitor,
            task: Some(task),
        }
    }

    /// Returns whether the session can still accept writes.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Last requested terminal size as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    /// Output queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.monitor.stats()
    }

    /// Queues `data` for the remote shell without waiting.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.send(SessionCommand::Write(data.to_vec()))
    }

    /// Queues a terminal resize. Repeating the current size is a no-op.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.size == (cols, rows) {
            return Ok(());
        }
        self.send(SessionCommand::Resize { cols, rows })?;
        self.size = (cols, rows);
        Ok(())
    }

    /// Stops the pump and closes the channel. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            info!("Closing remote session");
        }
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Closes the session and waits for the pump to exit.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Remote session task failed");
            }
        }
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Closed);
        }
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Busy,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump<C: ShellChannel>(
    mut channel: C,
    mut commands: mpsc::Receiver<SessionCommand>,
    output: OutputQueue<RemoteEvent>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    let mut exit_status = None;

    let error = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Remote session pump cancelled");
                break None;
            }

            command = commands.recv() => match command {
                Some(SessionCommand::Write(data)) => {
                    let result = match channel.write(&data).await {
                        Ok(n) if n == data.len() => Ok(()),
                        Ok(n) => Err(SessionError::PartialWrite {
                            written: n,
                            expected: data.len(),
                        }),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "Remote write failed");
                        alive.store(false, Ordering::SeqCst);
                        output.deliver(RemoteEvent::WriteFailed(e.to_string())).await;
                        break Some(e.to_string());
                    }
                }
                Some(SessionCommand::Resize { cols, rows }) => {
                    debug!(cols, rows, "Resizing remote terminal");
                    if let Err(e) = channel.resize(cols, rows).await {
                        warn!(error = %e, cols, rows, "Remote resize failed");
                    }
                }
                None => break None,
            },

            event = channel.next_event() => match event {
                Ok(Some(ChannelEvent::Stdout(data))) | Ok(Some(ChannelEvent::Stderr(data))) => {
                    output.offer_bytes(&data, RemoteEvent::Output);
                }
                Ok(Some(ChannelEvent::ExitStatus(code))) => {
                    debug!(exit_status = code, "Remote shell exited");
                    exit_status = Some(code);
                }
                Ok(Some(ChannelEvent::Eof)) => {
                    debug!("Remote shell sent EOF");
                }
                Ok(None) => break None,
                Err(e) => {
                    warn!(error = %e, "Remote read failed");
                    break Some(e.to_string());
                }
            },
        }
    };

    alive.store(false, Ordering::SeqCst);
    channel.close().await;

    if !cancel.is_cancelled() {
        info!(?exit_status, "Remote session ended");
        output
            .deliver(RemoteEvent::Closed { exit_status, error })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        written: Vec<u8>,
        resizes: Vec<(u16, u16)>,
        closed: bool,
    }

    struct FakeChannel {
        events: mpsc::Receiver<ChannelEvent>,
        recorded: Arc<Mutex<Recorded>>,
        short_writes: bool,
    }

    impl ShellChannel for FakeChannel {
        async fn next_event(&mut self) -> Result<Option<ChannelEvent>, SessionError> {
            Ok(self.events.recv().await)
        }

        async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
            let n = if self.short_writes { data.len() / 2 } else { data.len() };
            self.recorded.lock().unwrap().written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
            self.recorded.lock().unwrap().resizes.push((cols, rows));
            Ok(())
        }

        async fn close(&mut self) {
            self.recorded.lock().unwrap().closed = true;
        }
    }

    struct Harness {
        session: RemoteSession,
        events: mpsc::Sender<ChannelEvent>,
        output: mpsc::Receiver<RemoteEvent>,
        recorded: Arc<Mutex<Recorded>>,
    }

    fn harness(capacity: usize, short_writes: bool) -> Harness {
        let (events, event_rx) = mpsc::channel(16);
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let channel = FakeChannel {
            events: event_rx,
            recorded: Arc::clone(&recorded),
            short_writes,
        };
        let (queue, output) = OutputQueue::with_capacity("remote", capacity);
        let session = RemoteSession::attach(channel, queue, CancellationToken::new());
        Harness {
            session,
            events,
            output,
            recorded,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_resize_before_output_then_write() {
        let mut h = harness(8, false);
        assert_eq!(h.session.size(), (DEFAULT_COLS, DEFAULT_ROWS));

        h.session.resize(100, 40).unwrap();
        h.events
            .send(ChannelEvent::Stdout(b"$ ".to_vec()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), h.output.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(RemoteEvent::Output(b"$ ".to_vec())));

        h.session.write(b"ls\n").unwrap();
        h.session.write(b"pwd\n").unwrap();
        settle().await;

        let recorded = h.recorded.lock().unwrap();
        assert_eq!(recorded.resizes, vec![(100, 40)]);
        assert_eq!(recorded.written, b"ls\npwd\n");
        assert_eq!(h.session.size(), (100, 40));
    }

    #[tokio::test]
    async fn test_resize_is_idempotent() {
        let mut h = harness(8, false);
        h.session.resize(120, 50).unwrap();
        h.session.resize(120, 50).unwrap();
        h.session.resize(DEFAULT_COLS, DEFAULT_ROWS).unwrap();
        settle().await;

        assert_eq!(
            h.recorded.lock().unwrap().resizes,
            vec![(120, 50), (DEFAULT_COLS, DEFAULT_ROWS)]
        );
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_queue() {
        let mut h = harness(8, false);
        h.events
            .send(ChannelEvent::Stdout(b"out".to_vec()))
            .await
            .unwrap();
        h.events
            .send(ChannelEvent::Stderr(b"err".to_vec()))
            .await
            .unwrap();

        assert_eq!(
            h.output.recv().await,
            Some(RemoteEvent::Output(b"out".to_vec()))
        );
        assert_eq!(
            h.output.recv().await,
            Some(RemoteEvent::Output(b"err".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_close_mid_read_then_write_fails() {
        let mut h = harness(8, false);

        // The pump is parked in next_event with nothing to read.
        settle().await;
        h.session.close();
        h.session.close();

        assert!(!h.session.is_alive());
        assert!(matches!(h.session.write(b"ls\n"), Err(SessionError::Closed)));
        assert!(matches!(
            h.session.resize(90, 30),
            Err(SessionError::Closed)
        ));

        tokio::time::timeout(Duration::from_secs(1), h.session.shutdown())
            .await
            .unwrap();
        assert!(h.recorded.lock().unwrap().closed);

        // An explicit close does not report Closed back.
        assert_eq!(h.output.recv().await, None);
    }

    #[tokio::test]
    async fn test_remote_exit_reports_closed() {
        let mut h = harness(8, false);
        h.events.send(ChannelEvent::ExitStatus(0)).await.unwrap();
        h.events.send(ChannelEvent::Eof).await.unwrap();
        drop(h.events);

        let event = tokio::time::timeout(Duration::from_secs(1), h.output.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(RemoteEvent::Closed {
                exit_status: Some(0),
                error: None
            })
        );

        settle().await;
        assert!(!h.session.is_alive());
        assert!(matches!(h.session.write(b"x"), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let mut h = harness(8, true);
        h.session.write(b"echo hello\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), h.output.recv())
            .await
            .unwrap();
        match event {
            Some(RemoteEvent::WriteFailed(msg)) => assert!(msg.contains("partial write")),
            other => panic!("unexpected event: {other:?}"),
        }

        let closed = h.output.recv().await;
        assert!(matches!(
            closed,
            Some(RemoteEvent::Closed { error: Some(_), .. })
        ));
        assert!(!h.session.is_alive());
    }

    #[tokio::test]
    async fn test_full_queue_drops_output() {
        let mut h = harness(2, false);
        for i in 0..5u8 {
            h.events.send(ChannelEvent::Stdout(vec![i])).await.unwrap();
        }
        settle().await;

        let stats = h.session.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);

        assert_eq!(h.output.recv().await, Some(RemoteEvent::Output(vec![0])));
        assert_eq!(h.output.recv().await, Some(RemoteEvent::Output(vec![1])));
    }

    #[tokio::test]
    async fn test_drop_cancels_pump() {
        let h = harness(8, false);
        let recorded = Arc::clone(&h.recorded);
        drop(h.session);
        settle().await;
        assert!(recorded.lock().unwrap().closed);
    }
}
