use anomaly_feed::event::{AnalysisResult, BatchRow, LiveEvent};
use anomaly_feed::reveal::RevealScheduler;
use anomaly_feed::EventWindow;
use anomaly_feed_tools::{describe_event, FeedOpts};
use clap::{Parser, Subcommand};
use crossbeam::channel;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

macro_rules! log{
    ($msg:expr)=>{
    {
        eprintln!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), $msg);
    }
    };
    ($f:expr,$($a:tt)*)=>{
    {
        log!(format!($f, $($a)*));
    }
    };
}

#[derive(Parser, Debug)]
#[command(
    name = "feed-tool",
    version,
    about = "Network traffic anomaly analysis from the command line"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a traffic log for analysis and print the result
    Analyze {
        #[command(flatten)]
        feed: FeedOpts,

        /// Traffic log to analyze
        file: PathBuf,

        /// Print rows in timed chunks, as the dashboard reveals them
        #[arg(long)]
        paced: bool,

        /// Print the raw JSON response instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Download the anomaly CSV of a previous analysis
    Download {
        #[command(flatten)]
        feed: FeedOpts,

        /// File id returned by `analyze`
        file_id: String,

        /// Path of file where to store the CSV
        #[arg(short = 'o', long = "output", default_value = "anomalies.csv")]
        output: PathBuf,
    },

    /// Print live events as they arrive
    Tail {
        #[command(flatten)]
        feed: FeedOpts,

        /// Exit after this many events (default: run until interrupted)
        #[arg(short = 'n', long = "count")]
        count: Option<u64>,
    },
}

fn print_row_header(row: &BatchRow) {
    let cols: Vec<&str> = row.columns().collect();
    println!("{:>6}  {}", "#", cols.join("\t"));
}

fn print_row(index: usize, row: &BatchRow) {
    let cells: Vec<String> = row.columns().map(|c| row.cell(c)).collect();
    let mark = if row.is_anomaly() { "*" } else { " " };
    println!("{:>5}{}  {}", index, mark, cells.join("\t"));
}

fn print_summary(res: &AnalysisResult) {
    let s = &res.summary;
    println!("file id:   {}", res.file_id);
    println!("total:     {}", s.total);
    println!(
        "anomalies: {} ({:.1}%)",
        s.anomalies,
        s.anomaly_ratio() * 100.0
    );
    println!("normal:    {}", s.normal);
    for (key, value) in &s.extra {
        println!("{}: {}", key, value);
    }
}

fn analyze(feed: &FeedOpts, file: PathBuf, paced: bool, json: bool) -> Result<(), ()> {
    let api = feed.api_client().map_err(|e| {
        eprintln!("Invalid API address: {}", e);
    })?;
    let provider = feed.provider();
    log!("uploading {} to {}", file.display(), api.base());
    let res = api.analyze(&*provider, &file).map_err(|e| {
        eprintln!("Analysis failed: {}", e);
    })?;

    if json {
        let text = serde_json::to_string_pretty(&res).map_err(|e| {
            eprintln!("Failed to encode result: {}", e);
        })?;
        println!("{}", text);
        return Ok(());
    }

    print_summary(&res);
    if let Some(first) = res.rows.first() {
        println!();
        print_row_header(first);
    }

    if !paced {
        for (i, row) in res.rows.iter().enumerate() {
            print_row(i, row);
        }
        return Ok(());
    }

    let mut reveal = RevealScheduler::new();
    reveal.start(res.rows, Instant::now());
    let mut shown = 0;
    while let Some(deadline) = reveal.next_deadline() {
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        reveal.poll(Instant::now());
        for (i, row) in reveal.revealed().iter().enumerate().skip(shown) {
            print_row(i, row);
        }
        shown = reveal.revealed().len();
    }
    Ok(())
}

fn download(feed: &FeedOpts, file_id: String, output: PathBuf) -> Result<(), ()> {
    let api = feed.api_client().map_err(|e| {
        eprintln!("Invalid API address: {}", e);
    })?;
    let provider = feed.provider();
    let size = api.download_to(&*provider, &file_id, &output).map_err(|e| {
        eprintln!("Download failed: {}", e);
    })?;
    log!("wrote {} bytes to {}", size, output.display());
    Ok(())
}

fn print_event(event: &LiveEvent) {
    let fields: Vec<String> = event
        .columns()
        .filter(|c| *c != "timestamp")
        .map(|c| format!("{}={}", c, event.cell(c)))
        .collect();
    let mark = if event.is_anomaly() { "ANOMALY" } else { "ok" };
    println!(
        "{} {:<7} {}",
        event.timestamp().unwrap_or("-"),
        mark,
        fields.join(" ")
    );
}

fn tail(feed: &FeedOpts, count: Option<u64>) -> Result<(), ()> {
    let (status_tx, status_rx) = channel::bounded(64);
    let mut client = feed
        .live_client()
        .map_err(|e| {
            eprintln!("Invalid stream address: {}", e);
        })?
        .with_status_queue(status_tx);
    let mut window = EventWindow::new();

    client.start(Instant::now());
    let mut printed = 0;
    loop {
        let timeout = client
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(1));
        let inbound = client.inbound();
        crossbeam::select! {
            recv(inbound) -> msg => {
                let received = client.stats().received;
                match msg {
                    Ok(msg) => client.handle(msg, &mut window, Instant::now()),
                    Err(_) => client.link_lost(Instant::now()),
                }
                if client.stats().received > received {
                    if let Some(event) = window.newest() {
                        print_event(event);
                    }
                    printed += 1;
                }
            }
            recv(status_rx) -> ev => {
                if let Ok(ev) = ev {
                    log!("live feed: {}", describe_event(&ev));
                }
            }
            default(timeout) => {}
        }
        client.poll(Instant::now());
        if count.map_or(false, |n| printed >= n) {
            break;
        }
    }
    client.teardown();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            feed,
            file,
            paced,
            json,
        } => analyze(&feed, file, paced, json),
        Commands::Download {
            feed,
            file_id,
            output,
        } => download(&feed, file_id, output),
        Commands::Tail { feed, count } => tail(&feed, count),
    };

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        eprintln!("FAILED");
        ExitCode::FAILURE
    }
}
