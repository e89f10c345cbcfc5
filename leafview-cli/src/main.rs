use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use leafview_core::{
    Clock, Command, FetchCompletion, ManualClock, RenderPlan, SystemClock, ViewMode,
    ViewerConfig, ViewerEvent, ViewportController, ViewportSize, ViewportState, ZoomDirection,
};
use leafview_loader::{open_path, spawn_fetch_worker};
use leafview_tty::{render_plan_lines, EventMapper, InputMode, TextRenderer, UiEvent};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Terminal cells are mapped to this many layout pixels.
const CELL_WIDTH: f32 = 8.0;
const CELL_HEIGHT: f32 = 16.0;
const SETTLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(
    name = "leafview",
    version,
    about = "Paginated page-image viewer for the terminal"
)]
struct Args {
    /// JSON manifest, or a directory of page images
    path: PathBuf,

    /// Initial view mode: 1up, 2up or thumb
    #[arg(short = 'm', long = "mode")]
    mode: Option<ViewMode>,

    /// Page label to open on
    #[arg(short = 'p', long = "page")]
    page: Option<String>,

    /// Run `;`-separated steps instead of the interactive viewer.
    /// `@file` reads one step per line from a file.
    #[arg(short = 's', long = "script")]
    script: Option<String>,

    /// Print scripted frames as JSON lines
    #[arg(long = "json", requires = "script")]
    json: bool,

    /// Config file; defaults to config.toml in the platform config dir
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Viewport used by scripted runs, as WIDTHxHEIGHT
    #[arg(long = "viewport", default_value = "1024x768", value_parser = parse_viewport)]
    viewport: ViewportSize,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let project_dirs = ProjectDirs::from("org", "leafview", "leafview");
    let _log_guard = init_logging(project_dirs.as_ref(), args.script.is_some())?;

    let config = load_config(args.config.as_deref(), project_dirs.as_ref())?;
    let opened = open_path(&args.path)
        .await
        .with_context(|| format!("failed to open {:?}", args.path))?;
    info!(
        pages = opened.document.len(),
        id = %opened.document.id(),
        "document opened"
    );

    let (fetcher, completions) = spawn_fetch_worker();
    let manual_clock = Arc::new(ManualClock::new());
    let clock: Arc<dyn Clock> = match args.script {
        Some(_) => manual_clock.clone(),
        None => Arc::new(SystemClock::new()),
    };
    let mut controller = ViewportController::new(
        Arc::clone(&opened.document),
        config,
        opened.loader.clone(),
        Box::new(fetcher),
        Arc::clone(&clock),
    )?;

    let viewport = match args.script {
        Some(_) => args.viewport,
        None => terminal_viewport()?,
    };
    controller.initialize(viewport, args.mode.unwrap_or(ViewMode::SinglePage));
    if let Some(label) = &args.page {
        controller.apply(Command::GotoPage {
            label: label.clone(),
        })?;
    }

    match &args.script {
        Some(script) => {
            let steps = load_script(script)?;
            let mut run = ScriptRun {
                controller,
                clock: manual_clock,
                completions,
                json: args.json,
                seen_events: 0,
            };
            run.execute(&steps).await
        }
        None => run_interactive(controller, clock, completions).await,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScriptStep {
    Command(Command),
    /// Advance the manual clock and run due timers.
    Tick(Duration),
    /// Wait for outstanding fetches to report back.
    Load,
}

fn load_script(script: &str) -> Result<Vec<(String, ScriptStep)>> {
    let text = match script.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read script {:?}", path))?,
        None => script.replace(';', "\n"),
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Ok((line.to_owned(), parse_step(line)?)))
        .collect()
}

fn parse_step(line: &str) -> Result<ScriptStep> {
    if line.starts_with('{') {
        let command = serde_json::from_str(line)
            .with_context(|| format!("invalid command object `{line}`"))?;
        return Ok(ScriptStep::Command(command));
    }
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let arg = words.next();
    let count = || -> Result<usize> {
        arg.map_or(Ok(1), |value| {
            value
                .parse()
                .with_context(|| format!("invalid count `{value}`"))
        })
    };
    let required = |what: &str| arg.ok_or_else(|| anyhow!("`{verb}` needs {what}"));

    let command = match verb {
        "next" => Command::NextPage { count: count()? },
        "prev" => Command::PrevPage { count: count()? },
        "goto" => Command::GotoPage {
            label: required("a page label")?.to_owned(),
        },
        "index" => Command::GotoIndex {
            index: required("an index")?.parse().context("invalid index")?,
        },
        "first" => Command::FirstPage,
        "last" => Command::LastPage,
        "left" => Command::Left,
        "right" => Command::Right,
        "leftmost" => Command::Leftmost,
        "rightmost" => Command::Rightmost,
        "zoom" => Command::Zoom {
            direction: required("a direction")?
                .parse::<ZoomDirection>()
                .map_err(|err| anyhow!(err))?,
        },
        "mode" => Command::SwitchMode {
            mode: required("a mode")?
                .parse::<ViewMode>()
                .map_err(|err| anyhow!(err))?,
        },
        "scroll" => Command::ScrollBy {
            delta: required("a distance")?
                .parse()
                .context("invalid scroll distance")?,
        },
        "down" => Command::ScrollDown,
        "up" => Command::ScrollUp,
        "resize" => Command::Resize {
            viewport: parse_viewport(required("WIDTHxHEIGHT")?).map_err(|err| anyhow!(err))?,
        },
        "fullscreen" => Command::ToggleFullscreen,
        "open" => Command::ActivateThumbnail {
            index: required("an index")?.parse().context("invalid index")?,
        },
        "finish" => Command::FinishAnimations,
        "retry" => Command::RetryFailed,
        "tick" => {
            let millis: u64 = required("milliseconds")?
                .parse()
                .context("invalid tick duration")?;
            return Ok(ScriptStep::Tick(Duration::from_millis(millis)));
        }
        "load" => return Ok(ScriptStep::Load),
        other => bail!("unknown script step `{other}`"),
    };
    Ok(ScriptStep::Command(command))
}

fn parse_viewport(value: &str) -> Result<ViewportSize, String> {
    let (width, height) = value
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{value}`"))?;
    let width: f32 = width.parse().map_err(|_| format!("bad width `{width}`"))?;
    let height: f32 = height.parse().map_err(|_| format!("bad height `{height}`"))?;
    if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
        return Err(format!("viewport must be finite and positive, got `{value}`"));
    }
    Ok(ViewportSize::new(width, height))
}

#[derive(Serialize)]
struct Frame<'a> {
    step: &'a str,
    state: ViewportState,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<&'a RenderPlan>,
    events: Vec<ViewerEvent>,
}

struct ScriptRun {
    controller: ViewportController,
    clock: Arc<ManualClock>,
    completions: UnboundedReceiver<FetchCompletion>,
    json: bool,
    seen_events: usize,
}

impl ScriptRun {
    async fn execute(&mut self, steps: &[(String, ScriptStep)]) -> Result<()> {
        let mut stdout = io::stdout().lock();
        self.emit(&mut stdout, "init")?;
        for (line, step) in steps {
            match step {
                ScriptStep::Command(command) => self
                    .controller
                    .apply(command.clone())
                    .with_context(|| format!("step `{line}` failed"))?,
                ScriptStep::Tick(by) => {
                    self.advance(*by);
                }
                ScriptStep::Load => self.settle().await,
            }
            self.emit(&mut stdout, line)?;
        }
        Ok(())
    }

    fn advance(&mut self, by: Duration) {
        // Step in small increments so staggered timers fire in order.
        let step = Duration::from_millis(10);
        let mut remaining = by;
        while !remaining.is_zero() {
            let delta = remaining.min(step);
            self.clock.advance(delta);
            self.controller.tick();
            remaining -= delta;
        }
    }

    async fn settle(&mut self) {
        while let Ok(Some(completion)) =
            tokio::time::timeout(SETTLE_WAIT, self.completions.recv()).await
        {
            self.controller.handle_fetch_completed(completion);
        }
        self.controller.tick();
    }

    fn emit(&mut self, out: &mut impl Write, step: &str) -> Result<()> {
        let events = {
            let log = self.controller.events();
            let log = log.lock();
            let fresh = log[self.seen_events.min(log.len())..].to_vec();
            self.seen_events = log.len();
            fresh
        };
        if self.json {
            let frame = Frame {
                step,
                state: self.controller.state(),
                plan: self.controller.plan(),
                events,
            };
            serde_json::to_writer(&mut *out, &frame)?;
            writeln!(out)?;
        } else {
            writeln!(out, "== {step}")?;
            if let Some(plan) = self.controller.plan() {
                for line in render_plan_lines(plan, self.controller.document()) {
                    writeln!(out, "{line}")?;
                }
            }
        }
        Ok(())
    }
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

async fn run_interactive(
    mut controller: ViewportController,
    clock: Arc<dyn Clock>,
    mut completions: UnboundedReceiver<FetchCompletion>,
) -> Result<()> {
    let dirty = Arc::new(AtomicBool::new(true));
    {
        let dirty = Arc::clone(&dirty);
        controller.subscribe(Box::new(move |event| {
            if matches!(event, ViewerEvent::RedrawNeeded) {
                dirty.store(true, Ordering::Relaxed);
            }
        }));
    }

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All))?;
    let mut renderer = TextRenderer::new(stdout);
    let mut mapper = EventMapper::new();
    let mut message: Option<String> = None;

    loop {
        while let Ok(completion) = completions.try_recv() {
            controller.handle_fetch_completed(completion);
        }
        controller.tick();

        if dirty.swap(false, Ordering::Relaxed) {
            redraw(&mut renderer, &controller, &mapper, message.as_deref())?;
        }

        let timeout = controller
            .next_deadline()
            .map(|due| due.saturating_sub(clock.now()))
            .unwrap_or(Duration::from_millis(100))
            .clamp(Duration::from_millis(5), Duration::from_millis(100));
        if !event::poll(timeout)? {
            tokio::task::yield_now().await;
            continue;
        }

        let action = match event::read()? {
            Event::Resize(columns, rows) => {
                controller.resize(cells_to_viewport(columns, rows));
                LoopAction::ContinueRedraw
            }
            other => {
                let ui_event = mapper.map_event(other);
                handle_event(ui_event, &mut controller, &mut message)
            }
        };
        match action {
            LoopAction::ContinueRedraw => dirty.store(true, Ordering::Relaxed),
            LoopAction::Continue => {}
            LoopAction::Quit => break,
        }
        if mapper.mode() == InputMode::Label || mapper.pending_input().is_some() {
            dirty.store(true, Ordering::Relaxed);
        }
    }

    renderer.clear_all()?;
    Ok(())
}

fn handle_event(
    event: UiEvent,
    controller: &mut ViewportController,
    message: &mut Option<String>,
) -> LoopAction {
    match event {
        UiEvent::Command(command) => {
            *message = None;
            if let Err(err) = controller.apply(command) {
                warn!(%err, "command failed");
                *message = Some(err.to_string());
            }
            LoopAction::ContinueRedraw
        }
        UiEvent::ActivateCurrent => {
            if controller.mode() == ViewMode::ThumbnailGrid {
                controller.activate_thumbnail(controller.current_index());
            }
            LoopAction::ContinueRedraw
        }
        UiEvent::LabelInputChanged { .. } | UiEvent::LabelCancel => LoopAction::ContinueRedraw,
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn redraw<W: Write>(
    renderer: &mut TextRenderer<W>,
    controller: &ViewportController,
    mapper: &EventMapper,
    message: Option<&str>,
) -> Result<()> {
    let Some(plan) = controller.plan() else {
        return Ok(());
    };
    let (columns, rows) = terminal::size()?;
    let status = status_line(controller, mapper.pending_input().as_deref(), message);
    renderer.begin_sync_update()?;
    renderer.draw(
        plan,
        controller.document(),
        rows,
        &fit_to_width(status, columns as usize),
    )?;
    renderer.end_sync_update()
}

fn status_line(
    controller: &ViewportController,
    pending: Option<&str>,
    message: Option<&str>,
) -> String {
    let document = controller.document();
    let index = controller.current_index();
    let label = document
        .page_at(index)
        .map_or("?", |page| page.label.as_str());
    let mut status = format!(
        "{} {}/{} [{}]",
        label,
        index + 1,
        document.len(),
        controller.mode()
    );
    if controller.is_fullscreen() {
        status.push_str(" [full]");
    }
    if let Some(pending) = pending {
        status.push(' ');
        status.push_str(pending);
    }
    if let Some(message) = message {
        status.push_str(" | ");
        status.push_str(message);
    }
    status
}

fn fit_to_width(mut text: String, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    if text.chars().count() > width {
        text = text.chars().take(width).collect();
    }
    text
}

fn terminal_viewport() -> Result<ViewportSize> {
    let (columns, rows) = terminal::size()?;
    Ok(cells_to_viewport(columns, rows))
}

fn cells_to_viewport(columns: u16, rows: u16) -> ViewportSize {
    ViewportSize::new(
        f32::from(columns.max(1)) * CELL_WIDTH,
        f32::from(rows.saturating_sub(1).max(1)) * CELL_HEIGHT,
    )
}

fn load_config(path: Option<&Path>, project_dirs: Option<&ProjectDirs>) -> Result<ViewerConfig> {
    match (path, project_dirs) {
        (Some(path), _) => ViewerConfig::load(path),
        (None, Some(dirs)) => ViewerConfig::load_or_default(&dirs.config_dir().join("config.toml")),
        (None, None) => Ok(ViewerConfig::default()),
    }
}

/// File logging goes to the platform data dir. Scripted runs also log to
/// stderr so stdout stays machine readable.
fn init_logging(project_dirs: Option<&ProjectDirs>, console: bool) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = project_dirs.map(|dirs| dirs.data_local_dir().join("logs"));
    let (file_layer, guard) = match log_dir.map(|dir| fs::create_dir_all(&dir).map(|_| dir)) {
        Some(Ok(dir)) => {
            let file_appender = tracing_appender::rolling::never(dir, "leafview.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_steps_parse_words_and_json() {
        let steps = load_script("next 3; mode 2up;tick 400;{\"command\":\"last_page\"}").unwrap();
        let parsed: Vec<ScriptStep> = steps.into_iter().map(|(_, step)| step).collect();
        assert_eq!(
            parsed,
            vec![
                ScriptStep::Command(Command::NextPage { count: 3 }),
                ScriptStep::Command(Command::SwitchMode {
                    mode: ViewMode::TwoPageSpread
                }),
                ScriptStep::Tick(Duration::from_millis(400)),
                ScriptStep::Command(Command::LastPage),
            ]
        );
    }

    #[test]
    fn unknown_steps_are_rejected() {
        assert!(parse_step("teleport 4").is_err());
        assert!(parse_step("zoom sideways").is_err());
        assert!(parse_step("goto").is_err());
    }

    #[test]
    fn viewport_argument_parses() {
        assert_eq!(
            parse_viewport("800x600").unwrap(),
            ViewportSize::new(800.0, 600.0)
        );
        assert!(parse_viewport("800").is_err());
        assert!(parse_viewport("0x600").is_err());
        assert!(parse_viewport("NaNx600").is_err());
        assert!(parse_viewport("800xinf").is_err());
        assert!(parse_viewport("-800x600").is_err());
    }

    #[test]
    fn status_is_truncated_to_terminal_width() {
        assert_eq!(fit_to_width("n1 2/10 [1up]".into(), 6), "n1 2/1");
        assert_eq!(fit_to_width("short".into(), 0), "");
    }
}
