//! Terminal setup and the control loop driver.
//!
//! The loop polls the terminal for input with the remaining tick time as the
//! timeout, runs one [`App::tick`] per interval and redraws only when the
//! orchestrator reports a change.

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, layout::Rect, Terminal};
use tracing::debug;

use super::render;
use crate::app::{App, AppEvent};
use crate::session::Connector;

/// Owns the terminal while the TUI runs.
pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    /// Switches the terminal to raw mode on the alternate screen.
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;
        Ok(Self { terminal })
    }

    /// Current terminal area.
    pub fn area(&self) -> io::Result<Rect> {
        let size = self.terminal.size()?;
        Ok(Rect::new(0, 0, size.width, size.height))
    }

    pub fn draw<C: Connector>(&mut self, app: &App<C>) -> io::Result<()> {
        self.terminal.draw(|frame| render::draw(frame, app))?;
        Ok(())
    }

    /// Restores the terminal to its original state.
    pub fn restore(&mut self) -> io::Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Runs the orchestrator until the operator quits.
pub async fn run<C: Connector>(app: &mut App<C>, tick_rate: Duration) -> Result<()> {
    let mut tui = Tui::new()?;
    let result = event_loop(&mut tui, app, tick_rate).await;
    app.shutdown().await;
    tui.restore()?;
    result
}

async fn event_loop<C: Connector>(
    tui: &mut Tui,
    app: &mut App<C>,
    tick_rate: Duration,
) -> Result<()> {
    let (cols, rows) = render::remote_pty_size(tui.area()?);
    app.handle_event(AppEvent::Resize { cols, rows });
    app.start();

    let mut last_tick = Instant::now();
    loop {
        if app.take_dirty() {
            tui.draw(app)?;
        }

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) => app.handle_event(AppEvent::Key(key)),
                Event::Resize(width, height) => {
                    let (cols, rows) = render::remote_pty_size(Rect::new(0, 0, width, height));
                    debug!(cols, rows, "Terminal resized");
                    app.handle_event(AppEvent::Resize { cols, rows });
                }
                _ => {}
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.tick();
            last_tick = Instant::now();
        }

        if app.should_quit() {
            break;
        }

        // Let spawned tasks on this worker make progress.
        tokio::task::yield_now().await;
    }

    Ok(())
}
