// feed-dash
//
// Terminal dashboard: live anomaly feed plus paced batch analysis results.
//
// Keys:  a analyze --file / d download anomalies CSV / Enter dismiss
// Quit:  q / Esc / Ctrl-C

use anomaly_feed::api::{Job, RequestError, RequestWorker};
use anomaly_feed::auth::TokenProvider;
use anomaly_feed::dashboard::{DashboardView, Notice};
use anomaly_feed::event::Record;
use anomaly_feed::reveal::RevealPhase;
use anomaly_feed::stream::ConnectionState;
use anomaly_feed::Dashboard;
use anomaly_feed_tools::{describe_event, FeedOpts};
use chrono::{DateTime, Local};
use clap::Parser;
use crossbeam::channel;
use crossterm::style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::event::{KeyCode, KeyEventKind, KeyModifiers};
use crossterm::{cursor, event, style, terminal, ExecutableCommand, QueueableCommand};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "feed-dash",
    version,
    about = "Live network traffic anomaly dashboard"
)]
struct Cli {
    #[command(flatten)]
    feed: FeedOpts,

    /// Traffic log uploaded when pressing 'a'
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Where 'd' stores the anomaly CSV
    #[arg(short = 'o', long = "output", default_value = "anomalies.csv")]
    output: PathBuf,

    /// UI refresh rate
    #[arg(long, default_value_t = 10)]
    fps: u64,

    /// Live rows shown
    #[arg(long = "live-rows", default_value_t = 12)]
    live_rows: usize,

    /// Batch rows shown
    #[arg(long = "batch-rows", default_value_t = 8)]
    batch_rows: usize,

    /// Max status events to show
    #[arg(long = "event-log-size", default_value_t = 5)]
    event_log_size: usize,

    /// Write diagnostics (RUST_LOG, default info) to this file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

struct LoggedEvent {
    timestamp: DateTime<Local>,
    event: String,
}

const SPARK: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Anomaly scores of the most recent `width` revealed rows.
fn sparkline(series: &[(usize, f64)], width: usize) -> String {
    let start = series.len().saturating_sub(width);
    series[start..]
        .iter()
        .map(|(_, score)| {
            let level = (score.clamp(0.0, 1.0) * 8.0).round() as usize;
            SPARK[level]
        })
        .collect()
}

/// Cut `text` to at most `width` characters.
fn fit(mut text: String, width: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(width) {
        text.truncate(idx);
    }
    text
}

fn row_line(row: &Record) -> String {
    row.columns()
        .filter(|c| *c != "anomaly" && *c != "anomaly_reason")
        .map(|c| format!("{}={}", c, row.cell(c)))
        .collect::<Vec<_>>()
        .join(" ")
}

struct Tui {
    stdout: io::Stdout,
}

impl Tui {
    fn setup() -> io::Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        stdout.execute(terminal::EnterAlternateScreen)?;
        stdout.execute(cursor::Hide)?;
        Ok(Self { stdout })
    }

    fn teardown(&mut self) {
        let _ = self.stdout.execute(cursor::Show);
        let _ = self.stdout.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        let _ = self.stdout.flush();
    }

    fn heading(&mut self, text: &str) -> io::Result<()> {
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(style::Print(text))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        Ok(())
    }

    fn line(&mut self, color: Color, text: &str) -> io::Result<()> {
        self.stdout.queue(SetForegroundColor(color))?;
        self.stdout.queue(style::Print(text))?;
        self.stdout.queue(ResetColor)?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        Ok(())
    }

    fn draw(
        &mut self,
        cli: &Cli,
        view: &DashboardView,
        series: &[(usize, f64)],
        event_log: &VecDeque<LoggedEvent>,
        hint: Option<&str>,
    ) -> io::Result<()> {
        let (width, _) = terminal::size().unwrap_or((80, 24));
        let width = width as usize;

        self.stdout.queue(cursor::MoveTo(0, 0))?;
        self.stdout
            .queue(terminal::Clear(terminal::ClearType::All))?;

        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(style::Print(format!(
            "feed-dash  api={}  stream={}",
            cli.feed.api, cli.feed.stream
        )))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        // Connection
        let (conn, color) = if !view.authenticated {
            ("not signed in".to_string(), Color::DarkGrey)
        } else {
            let color = match view.connection {
                ConnectionState::Open => Color::Green,
                ConnectionState::Connecting | ConnectionState::Closing => Color::Yellow,
                ConnectionState::Disconnected => Color::Red,
            };
            (format!("{:?}", view.connection).to_lowercase(), color)
        };
        let stats = view.stream_stats;
        self.line(
            color,
            &format!(
                "live: {}  attempts={} received={} dropped={}",
                conn, stats.attempts, stats.received, stats.dropped
            ),
        )?;

        // Batch analysis
        let phase = match view.reveal {
            RevealPhase::Idle => "idle",
            RevealPhase::Revealing => "revealing",
            RevealPhase::Complete => "complete",
        };
        let busy = if view.busy { "  [uploading...]" } else { "" };
        self.heading(&format!(
            "Batch analysis: {}/{} rows ({}){}",
            view.batch_rows.len(),
            view.batch_total,
            phase,
            busy
        ))?;
        if let Some(summary) = view.summary {
            self.line(
                Color::White,
                &format!(
                    "file {}  total={} anomalies={} normal={} ({:.1}%)",
                    view.file_id.unwrap_or("-"),
                    summary.total,
                    summary.anomalies,
                    summary.normal,
                    summary.anomaly_ratio() * 100.0
                ),
            )?;
            self.line(
                Color::Magenta,
                &sparkline(series, width.saturating_sub(1)),
            )?;
        }
        let start = view.batch_rows.len().saturating_sub(cli.batch_rows);
        for (i, row) in view.batch_rows.iter().enumerate().skip(start) {
            let color = if row.is_anomaly() { Color::Red } else { Color::White };
            let text = fit(format!("{:>6}  {}", i, row_line(row)), width.saturating_sub(1));
            self.line(color, &text)?;
        }

        // Live feed
        self.heading(&format!(
            "Live feed: {} events, {} anomalies",
            view.live_rows.len(),
            view.live_anomalies
        ))?;
        for event in view.live_rows.iter().take(cli.live_rows) {
            let (color, reason) = if event.is_anomaly() {
                (Color::Red, event.anomaly_reason().unwrap_or("anomaly"))
            } else {
                (Color::Green, "ok")
            };
            let text = fit(
                format!(
                    "{:<20} {:<24} {}",
                    event.timestamp().unwrap_or("-"),
                    reason,
                    row_line(event)
                ),
                width.saturating_sub(1),
            );
            self.line(color, &text)?;
        }

        // Status events
        if !event_log.is_empty() {
            self.heading(&format!(
                "Recent Events ({} of {}):",
                event_log.len(),
                cli.event_log_size
            ))?;
            for logged in event_log {
                self.line(
                    Color::DarkGrey,
                    &format!(
                        "[{}] {}",
                        logged.timestamp.format("%H:%M:%S%.3f"),
                        logged.event
                    ),
                )?;
            }
        }

        self.stdout.queue(cursor::MoveToNextLine(1))?;
        match view.notice {
            Some(Notice::UploadFailed(msg)) => self.line(Color::Red, &format!("Upload failed: {}", msg))?,
            Some(Notice::DownloadFailed(msg)) => {
                self.line(Color::Red, &format!("Download failed: {}", msg))?
            }
            Some(Notice::Downloaded { path, bytes }) => self.line(
                Color::Green,
                &format!("Saved {} bytes to {}", bytes, path.display()),
            )?,
            None => {}
        }
        if let Some(hint) = hint {
            self.line(Color::Yellow, hint)?;
        }
        self.stdout
            .queue(style::Print("a: analyze  d: download  Enter: dismiss  q/Esc: quit"))?;

        self.stdout.flush()
    }
}

fn init_logging(path: &Option<PathBuf>) -> io::Result<()> {
    // Diagnostics would corrupt the screen, so they only go to a file.
    if let Some(path) = path {
        let file = File::create(path)?;
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_file) {
        eprintln!("Failed to open log file: {}", e);
        return ExitCode::FAILURE;
    }
    let api = match cli.feed.api_client() {
        Ok(api) => api,
        Err(e) => {
            eprintln!("Invalid API address: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cli.feed.stream_url() {
        eprintln!("Invalid stream address: {}", e);
        return ExitCode::FAILURE;
    }
    let worker = match RequestWorker::spawn(api, cli.feed.provider()) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Failed to start request worker: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let auth = cli.feed.provider();

    let mut tui = match Tui::setup() {
        Ok(tui) => tui,
        Err(e) => {
            eprintln!("TUI setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let mut t = Tui {
            stdout: io::stdout(),
        };
        t.teardown();
        original_hook(panic_info);
    }));

    let (status_tx, status_rx) = channel::bounded(64);
    let mut dash = Dashboard::new();
    let mut event_log = VecDeque::<LoggedEvent>::new();
    let mut hint: Option<String> = None;

    // Keyboard handler
    let (key_tx, key_rx) = channel::unbounded();
    std::thread::spawn(move || {
        if let Err(e) = forward_input(event::read, key_tx) {
            log::error!("terminal input failed: {}", e);
        }
    });

    let frame = Duration::from_millis(1000 / cli.fps.max(1));
    let tick = channel::tick(frame);
    let auth_check = channel::tick(Duration::from_secs(1));
    let mut check_auth = true;

    'main: loop {
        // Follow credential availability: a viewer with a token gets the
        // live feed, one without loses it.
        if check_auth {
            check_auth = false;
            let signed_in = auth.token().is_ok();
            if signed_in && !dash.is_authenticated() {
                match cli.feed.live_client() {
                    Ok(client) => {
                        dash.attach_live(client.with_status_queue(status_tx.clone()), Instant::now())
                    }
                    Err(e) => log::error!("invalid stream address: {}", e),
                }
            } else if !signed_in && dash.is_authenticated() {
                dash.detach_live();
            }
        }

        let live = dash.live_inbound();
        let timeout = dash
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(frame);
        crossbeam::select! {
            recv(live) -> msg => dash.handle_inbound(msg, Instant::now()),

            recv(worker.replies()) -> reply => {
                if let Ok(reply) = reply {
                    dash.handle_reply(reply, Instant::now());
                }
            }

            recv(status_rx) -> ev => {
                if let Ok(ev) = ev {
                    event_log.push_front(LoggedEvent {
                        timestamp: Local::now(),
                        event: describe_event(&ev),
                    });
                    event_log.truncate(cli.event_log_size);
                }
            }

            recv(key_rx) -> ev => match ev {
                // Release and repeat events are ignored.
                Ok(event::Event::Key(k)) if k.kind == KeyEventKind::Press => {
                    let quit = k.code == KeyCode::Char('q')
                             || k.code == KeyCode::Esc
                             || (k.code == KeyCode::Char('c') && k.modifiers == KeyModifiers::CONTROL);
                    if quit { break 'main; }
                    hint = None;
                    match k.code {
                        KeyCode::Char('a') => match &cli.file {
                            Some(file) => {
                                if dash.begin_upload() && !worker.submit(Job::Analyze(file.clone())) {
                                    dash.finish_upload(Err(worker_gone()), Instant::now());
                                }
                            }
                            None => hint = Some("no file to analyze, start with --file".to_string()),
                        },
                        KeyCode::Char('d') => match dash.file_id() {
                            Some(file_id) => {
                                let job = Job::Download {
                                    file_id: file_id.to_string(),
                                    dest: cli.output.clone(),
                                };
                                if !worker.submit(job) {
                                    dash.finish_download(Err(worker_gone()));
                                }
                            }
                            None => hint = Some("nothing to download yet, analyze a file first".to_string()),
                        },
                        KeyCode::Enter => dash.dismiss_notice(),
                        _ => {}
                    }
                }
                // Without input there is no way to quit.
                Err(_) => break 'main,
                _ => {}
            },

            recv(auth_check) -> _ => check_auth = true,

            recv(tick) -> _ => {
                let view = dash.view();
                let series = dash.anomaly_series();
                if tui.draw(&cli, &view, &series, &event_log, hint.as_deref()).is_err() {
                    break 'main;
                }
            }

            default(timeout) => {}
        }
        dash.poll(Instant::now());
    }

    dash.teardown();
    tui.teardown();
    ExitCode::SUCCESS
}

/// Forward terminal events until a read fails or the receiver is gone.
fn forward_input<F>(mut read: F, tx: channel::Sender<event::Event>) -> io::Result<()>
where
    F: FnMut() -> io::Result<event::Event>,
{
    loop {
        let ev = read()?;
        if tx.send(ev).is_err() {
            return Ok(());
        }
    }
}

fn worker_gone() -> RequestError {
    RequestError::IO(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "request worker stopped",
    ))
}
