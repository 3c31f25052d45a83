use crate::{
    AcqStatus, AcquisitionController, Counter, DaqResult, SessionReport, Snapshot, StatsSnapshot,
};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{error, info};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::{sync::Arc, time::Duration};

/// Operator console: start/stop the acquisition and watch counters and the latest snapshot.
pub struct Console {
    pub controller: AcquisitionController,
    pub counter: Counter,
    pub stats: StatsSnapshot,
    pub telemetry_dropped: u64,
    pub snapshot: Arc<Snapshot>,
    pub message: String,
    pub exit: bool,
}

impl Console {
    pub fn new(controller: AcquisitionController) -> Self {
        Self {
            controller,
            counter: Counter::default(),
            stats: StatsSnapshot::default(),
            telemetry_dropped: 0,
            snapshot: Arc::default(),
            message: "Press <S> to start".into(),
            exit: false,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let ticker = tick(Duration::from_millis(250));

        while !self.exit {
            let _ = ticker.recv();

            if let Some(result) = self.controller.reap() {
                self.finished(result);
            }
            if let Some(stats) = self.controller.session_stats() {
                self.stats = stats;
                self.counter.update_total(stats.events_written);
                self.telemetry_dropped = self.controller.telemetry_dropped();
            }
            self.snapshot = self.controller.snapshots().latest();

            self.handle_events()?;
            terminal.draw(|f| self.draw(f))?;
        }

        if self.controller.status() == AcqStatus::Acquiring {
            let result = self.controller.stop();
            self.finished(result);
        }
        Ok(())
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        match key_event.code {
            KeyCode::Char('s') => self.start(),
            KeyCode::Char('x') => {
                let result = self.controller.stop();
                self.finished(result);
            }
            KeyCode::Char('q') => self.exit = true,
            _ => {}
        }
    }

    fn start(&mut self) {
        match self.controller.start() {
            Ok(()) => {
                self.counter.reset();
                self.stats = StatsSnapshot::default();
                self.telemetry_dropped = 0;
                self.message = match self.controller.current_file() {
                    Some(file) => format!("Writing {}", file.display()),
                    None => "Acquiring".into(),
                };
            }
            Err(e) => {
                error!("Start rejected: {e}");
                self.message = e.to_string();
            }
        }
    }

    fn finished(&mut self, result: DaqResult<SessionReport>) {
        self.message = match result {
            Ok(report) => {
                info!("Session report: {report:?}");
                format!(
                    "Wrote {} events to {}",
                    report.events_written,
                    report.file.display()
                )
            }
            Err(e) => e.to_string(),
        };
    }
}

impl Widget for &Console {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let status = self.controller.status();
        let title = Line::from(format!(" SoftGlue DAQ: {status} ").bold());
        let instructions = Line::from(vec![
            " Start ".into(),
            "<S>".blue().bold(),
            " Stop ".into(),
            "<X>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);
        let inner = block.inner(area);
        block.render(area, buf);

        let [counters, snapshot, message] = Layout::vertical([
            Constraint::Length(2),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .areas(inner);

        let counter_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.counter
                    .t_begin
                    .elapsed()
                    .as_secs()
                    .to_string()
                    .yellow(),
                " s".into(),
                " Events: ".into(),
                self.stats.events_written.to_string().yellow(),
                " Rate: ".into(),
                format!("{:.1}", self.counter.rate()).yellow(),
                " ev/s".into(),
            ]),
            Line::from(vec![
                "Packets: ".into(),
                self.stats.packets.to_string().yellow(),
                " Long events: ".into(),
                self.stats.long_events.to_string().yellow(),
                " Empty polls: ".into(),
                self.stats.empty_polls.to_string().yellow(),
                " Snapshots dropped: ".into(),
                self.telemetry_dropped.to_string().yellow(),
            ]),
        ]);
        Paragraph::new(counter_text)
            .centered()
            .render(counters, buf);

        let mut lines = vec![Line::from(format!(
            "Latest batch: {} events from #{}",
            self.snapshot.num_events, self.snapshot.first_event_id
        ))];
        for stream in &self.snapshot.streams {
            lines.push(Line::from(vec![
                format!("{:>12}: ", stream.label).into(),
                stream
                    .events
                    .last()
                    .map_or("-".to_string(), |v| v.to_string())
                    .cyan(),
            ]));
        }
        for output in &self.snapshot.derived {
            lines.push(Line::from(vec![
                format!("{:>12}: ", output.name).into(),
                output
                    .values
                    .last()
                    .map_or("-".to_string(), |v| format!("{v:.3}"))
                    .magenta(),
            ]));
        }
        Paragraph::new(Text::from(lines)).render(snapshot, buf);

        Paragraph::new(self.message.as_str())
            .centered()
            .italic()
            .render(message, buf);
    }
}
