//! Frame layout and widgets.
//!
//! Rendering only reads the orchestrator state.

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph},
    Frame,
};

use crate::app::{App, ConnectionState, ContentBuffer, EditMode, LogBuffer, LogLevel, ShellMode};
use crate::deploy::SequencerState;
use crate::session::Connector;

/// Local pane accent.
pub const LOCAL_COLOR: Color = Color::Rgb(0xCE, 0x41, 0x2B);

/// Remote pane accent.
pub const REMOTE_COLOR: Color = Color::Rgb(0x00, 0xAD, 0xD8);

/// Visible log lines.
const LOG_LINES: u16 = 4;

/// Areas of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub local: Rect,
    pub remote: Rect,
    pub log: Rect,
    pub command: Rect,
    pub help: Rect,
}

/// Splits the terminal area into panes.
pub fn layout(area: Rect) -> FrameLayout {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),                // Panes
            Constraint::Length(LOG_LINES + 2), // Log
            Constraint::Length(3),             // Command line
            Constraint::Length(1),             // Help
        ])
        .split(area);

    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[0]);

    FrameLayout {
        local: panes[0],
        remote: panes[1],
        log: rows[1],
        command: rows[2],
        help: rows[3],
    }
}

/// Remote PTY size (cols, rows) for a terminal of the given area.
pub fn remote_pty_size(area: Rect) -> (u16, u16) {
    let pane = layout(area).remote;
    (
        pane.width.saturating_sub(2).max(1),
        pane.height.saturating_sub(2).max(1),
    )
}

/// Draws the whole frame.
pub fn draw<C: Connector>(frame: &mut Frame, app: &App<C>) {
    let areas = layout(frame.area());
    let mode = app.shell_mode();

    render_pane(
        frame,
        areas.local,
        " Local ",
        LOCAL_COLOR,
        app.local_buffer(),
        app.scroll().local,
        mode == ShellMode::Local,
    );

    let remote_title = match app.endpoint() {
        Some(endpoint) => format!(
            " Remote: {}@{} ",
            endpoint.login_user, endpoint.address
        ),
        None => format!(" Remote: {} ({}) ", app.instance_name(), app.connection().label()),
    };
    render_pane(
        frame,
        areas.remote,
        &remote_title,
        REMOTE_COLOR,
        app.remote_buffer(),
        app.scroll().remote,
        mode == ShellMode::Remote,
    );

    render_log(frame, areas.log, app.log());
    render_command(frame, areas.command, app);
    render_help(frame, areas.help, app);
}

/// Renders one shell pane, bottom-aligned unless scrolled.
fn render_pane(
    frame: &mut Frame,
    area: Rect,
    title: &str,
    color: Color,
    buffer: &ContentBuffer,
    scroll: u16,
    active: bool,
) {
    let border_type = if active {
        BorderType::Thick
    } else {
        BorderType::Rounded
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(border_type)
        .border_style(Style::default().fg(color))
        .title(Span::styled(
            title.to_string(),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ));

    let inner = block.inner(area);
    let text: Vec<Line> = buffer
        .visible_lines(inner.width, inner.height, scroll)
        .into_iter()
        .map(Line::from)
        .collect();

    frame.render_widget(Paragraph::new(text).block(block), area);
}

fn render_log(frame: &mut Frame, area: Rect, log: &LogBuffer) {
    let visible = usize::from(area.height.saturating_sub(2));
    let skip = log.len().saturating_sub(visible);

    let lines: Vec<Line> = log
        .entries()
        .skip(skip)
        .map(|entry| {
            let color = match entry.level {
                LogLevel::Info => Color::Gray,
                LogLevel::Success => Color::Green,
                LogLevel::Error => Color::Red,
                LogLevel::Step => Color::Yellow,
                LogLevel::Debug => Color::DarkGray,
            };
            Line::from(vec![
                Span::styled(
                    entry.level.tag(),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ),
                Span::raw(" "),
                Span::raw(entry.message.as_str()),
            ])
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .title(" Log ");
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_command<C: Connector>(frame: &mut Frame, area: Rect, app: &App<C>) {
    let (title, color) = if app.is_prompting() {
        (" Passphrase ".to_string(), Color::Yellow)
    } else {
        let color = match app.shell_mode() {
            ShellMode::Local => LOCAL_COLOR,
            ShellMode::Remote => REMOTE_COLOR,
        };
        (
            format!(
                " {} | {} ",
                app.shell_mode().label(),
                app.edit_mode().label()
            ),
            color,
        )
    };

    let prompt = "> ";
    let text = Line::from(vec![
        Span::styled(prompt, Style::default().fg(color)),
        Span::raw(app.input().display(app.is_prompting())),
    ]);
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(color))
        .title(title);
    let inner = block.inner(area);
    frame.render_widget(Paragraph::new(text).block(block), area);

    if app.edit_mode() == EditMode::Insert && inner.width > 0 && inner.height > 0 {
        let offset = u16::try_from(prompt.len() + app.input().cursor()).unwrap_or(u16::MAX);
        let x = inner.x.saturating_add(offset).min(inner.right().saturating_sub(1));
        frame.set_cursor_position((x, inner.y));
    }
}

fn render_help<C: Connector>(frame: &mut Frame, area: Rect, app: &App<C>) {
    let deploy = match app.sequencer_state() {
        SequencerState::Idle if app.plan_len() == 0 => String::new(),
        SequencerState::Idle => format!("deploy: {} steps pending", app.plan_len()),
        SequencerState::Running(i) => format!("deploy: step {}/{}", i + 1, app.plan_len()),
        SequencerState::Complete if app.plan_len() == 0 => String::new(),
        SequencerState::Complete => "deploy: complete".to_string(),
        SequencerState::Aborted { index, .. } => format!("deploy: aborted at step {}", index + 1),
    };

    let connection_color = match app.connection() {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Failed(_) | ConnectionState::Closed => Color::Red,
        _ => Color::Yellow,
    };

    let mut spans = vec![
        Span::styled(
            format!(" {} ", app.connection().label()),
            Style::default().fg(connection_color),
        ),
        Span::styled(
            "| Shift+Tab: switch shell | Esc: normal mode | q: quit | Ctrl+C: interrupt ",
            Style::default().fg(Color::DarkGray),
        ),
    ];
    if !deploy.is_empty() {
        spans.push(Span::styled(
            format!("| {deploy}"),
            Style::default().fg(Color::Yellow),
        ));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppEvent, AppSettings};
    use crate::deploy::DeploymentPlan;
    use crate::session::{ConnectError, Connected, OutputQueue, RemoteEvent};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::{backend::TestBackend, Terminal};
    use secrecy::SecretString;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NeverConnects;

    impl Connector for NeverConnects {
        async fn connect(
            &self,
            _passphrase: SecretString,
            _output: OutputQueue<RemoteEvent>,
            _cancel: CancellationToken,
        ) -> Result<Connected, ConnectError> {
            std::future::pending().await
        }
    }

    fn app() -> App<NeverConnects> {
        App::new(
            NeverConnects,
            DeploymentPlan::default(),
            AppSettings {
                instance_name: "web-1".into(),
                shell: "/bin/sh".into(),
                settle_delay: Duration::from_millis(10),
                shell_warmup: Duration::from_millis(10),
                initial_command: None,
                show_debug: false,
                local_identity: "me@here".into(),
            },
        )
    }

    fn screen(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let mut out = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                out.push_str(buffer[(x, y)].symbol());
            }
            out.push('\n');
        }
        out
    }

    #[test]
    fn test_layout_split() {
        let areas = layout(Rect::new(0, 0, 100, 40));
        assert_eq!(areas.local.width + areas.remote.width, 100);
        assert_eq!(areas.log.height, 6);
        assert_eq!(areas.command.height, 3);
        assert_eq!(areas.help.height, 1);
        assert_eq!(areas.local.height, 40 - 6 - 3 - 1);
    }

    #[test]
    fn test_remote_pty_size() {
        assert_eq!(remote_pty_size(Rect::new(0, 0, 100, 40)), (48, 28));
        assert_eq!(remote_pty_size(Rect::new(0, 0, 2, 2)), (1, 1));
    }

    #[tokio::test]
    async fn test_draw_panes_and_output() {
        let mut app = app();
        app.handle_event(AppEvent::Key(KeyEvent::new(
            KeyCode::BackTab,
            KeyModifiers::NONE,
        )));
        for c in "echo rendered".chars() {
            app.handle_key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE));
        }
        app.handle_key(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE));

        for _ in 0..200 {
            app.tick();
            if !app.local_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|frame| draw(frame, &app)).unwrap();
        let text = screen(&terminal);

        assert!(text.contains("Local"));
        assert!(text.contains("Remote: web-1 (connecting)"));
        assert!(text.contains("me@here $ echo rendered"));
        assert!(text.contains("LOCAL | INSERT"));
        assert!(text.contains("Shift+Tab: switch shell"));
    }

    #[tokio::test]
    async fn test_passphrase_is_masked() {
        let mut app = app();
        app.handle_event(AppEvent::Connected(Box::new(Err(ConnectError::Credentials(
            crate::credentials::CredentialError::NeedsPassphrase {
                path: "/k".into(),
            },
        )))));
        for c in "hunter2".chars() {
            app.handle_key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE));
        }

        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|frame| draw(frame, &app)).unwrap();
        let text = screen(&terminal);

        assert!(text.contains("Passphrase"));
        assert!(text.contains("*******"));
        assert!(!text.contains("hunter2"));
    }
}
