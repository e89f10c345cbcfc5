use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use leafview_core::{
    Command, Document, FlipDirection, Placement, RenderPlan, Resource, Slot, ViewMode,
    ZoomDirection,
};

pub struct TextRenderer<W: Write> {
    writer: W,
}

impl<W: Write> TextRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Paints the plan description, one line per terminal row, with the
    /// status line on the last row.
    pub fn draw(
        &mut self,
        plan: &RenderPlan,
        document: &Document,
        rows: u16,
        status: &str,
    ) -> Result<()> {
        let lines = render_plan_lines(plan, document);
        let body_rows = rows.saturating_sub(1) as usize;
        crossterm::queue!(&mut self.writer, Clear(ClearType::All))?;
        for (row, line) in lines.iter().take(body_rows).enumerate() {
            crossterm::queue!(&mut self.writer, cursor::MoveTo(0, row as u16))?;
            self.writer.write_all(line.as_bytes())?;
        }
        crossterm::queue!(&mut self.writer, cursor::MoveTo(0, rows.saturating_sub(1)))?;
        write_status_line(&mut self.writer, status)?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Human-readable description of a frame.
pub fn render_plan_lines(plan: &RenderPlan, document: &Document) -> Vec<String> {
    let label = document
        .page_at(plan.current_index)
        .map_or("?", |page| page.label.as_str());
    let mut lines = vec![format!(
        "{} | page {} ({}/{}) | reduce {} | scroll {:.0}/{:.0}",
        plan.mode,
        label,
        plan.current_index + 1,
        document.len(),
        plan.reduction,
        plan.scroll.top,
        plan.content_height,
    )];
    if let Some(flip) = &plan.flip {
        let arrow = match flip.direction {
            FlipDirection::Forward => "->",
            FlipDirection::Backward => "<-",
            FlipDirection::None => "--",
        };
        lines.push(format!(
            "flip {:?} {} {:?} {:.0}%",
            flip.from,
            arrow,
            flip.to,
            flip.progress * 100.0
        ));
    }
    lines.extend(
        plan.placements
            .iter()
            .map(|placement| placement_line(placement, document)),
    );
    if !plan.staged.is_empty() {
        lines.push(format!("staged {:?}", plan.staged));
    }
    lines
}

fn placement_line(placement: &Placement, document: &Document) -> String {
    let marker = if placement.highlighted { '>' } else { ' ' };
    let slot = match placement.slot {
        Slot::Page { index } => document
            .page_at(index)
            .map_or_else(|| format!("#{index}"), |page| page.label.clone()),
        Slot::UnviewableRun { start, end } => format!("unviewable {}..={}", start, end),
        Slot::Blank { .. } => "blank".to_owned(),
    };
    let state = match &placement.resource {
        Resource::Resolved { reduction, .. } => format!("ready@{}", reduction),
        Resource::Pending { .. } => "loading".to_owned(),
        Resource::Failed { reason, .. } => format!("failed: {}", reason),
        Resource::Blank => String::new(),
    };
    let rect = placement.rect;
    format!(
        "{} {:<12} {:>5.0}x{:<5.0} at {:.0},{:.0} {}",
        marker, slot, rect.width, rect.height, rect.x, rect.y, state
    )
    .trim_end()
    .to_owned()
}


#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    /// Open whatever page is current, used by the thumbnail grid.
    ActivateCurrent,
    LabelInputChanged { input: String },
    LabelCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Label,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    label_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.label_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Label => self.map_event_label(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::PageDown, _) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::PageUp, _) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Down, _) | (KeyCode::Char(' '), _) => self.command(Command::ScrollDown),
            (KeyCode::Up, _) => self.command(Command::ScrollUp),
            (KeyCode::Left, _) | (KeyCode::Char('h'), KeyModifiers::NONE) => {
                self.command(Command::Left)
            }
            (KeyCode::Right, _) | (KeyCode::Char('l'), KeyModifiers::NONE) => {
                self.command(Command::Right)
            }
            (KeyCode::Char('H'), _) => self.command(Command::Leftmost),
            (KeyCode::Char('L'), _) => self.command(Command::Rightmost),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                match self.pending_count.take().filter(|&count| count > 0) {
                    Some(page) => {
                        self.reset_count();
                        UiEvent::Command(Command::GotoIndex { index: page - 1 })
                    }
                    None => self.command(Command::FirstPage),
                }
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => self.command(Command::LastPage),
            (KeyCode::Char('+'), _) => self.zoom(ZoomDirection::In),
            (KeyCode::Char('-'), _) => self.zoom(ZoomDirection::Out),
            (KeyCode::Char('='), _) => self.zoom(ZoomDirection::Auto),
            (KeyCode::Char('w'), _) => self.zoom(ZoomDirection::Width),
            (KeyCode::Char('z'), _) => self.zoom(ZoomDirection::Height),
            (KeyCode::Char('s'), _) => self.switch(ViewMode::SinglePage),
            (KeyCode::Char('d'), _) => self.switch(ViewMode::TwoPageSpread),
            (KeyCode::Char('t'), _) => self.switch(ViewMode::ThumbnailGrid),
            (KeyCode::Char('f'), _) => self.command(Command::ToggleFullscreen),
            (KeyCode::Char('r'), _) => self.command(Command::RetryFailed),
            (KeyCode::Enter, _) => {
                self.reset_count();
                UiEvent::ActivateCurrent
            }
            (KeyCode::Char(':'), _) => {
                self.set_mode(InputMode::Label);
                UiEvent::LabelInputChanged {
                    input: String::new(),
                }
            }
            (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_label(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::LabelCancel
            }
            (KeyCode::Enter, _) => {
                let label = self.label_buffer.trim().to_owned();
                self.set_mode(InputMode::Normal);
                if label.is_empty() {
                    UiEvent::LabelCancel
                } else {
                    UiEvent::Command(Command::GotoPage { label })
                }
            }
            (KeyCode::Backspace, _) => {
                self.label_buffer.pop();
                UiEvent::LabelInputChanged {
                    input: self.label_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.label_buffer.push(c);
                UiEvent::LabelInputChanged {
                    input: self.label_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn command(&mut self, command: Command) -> UiEvent {
        self.reset_count();
        UiEvent::Command(command)
    }

    fn zoom(&mut self, direction: ZoomDirection) -> UiEvent {
        self.command(Command::Zoom { direction })
    }

    fn switch(&mut self, mode: ViewMode) -> UiEvent {
        self.command(Command::SwitchMode { mode })
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if matches!(self.mode, InputMode::Label) {
            return Some(format!(":{}", self.label_buffer));
        }
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
