//! Dashboard controller
//!
//! Owns everything one dashboard screen shows: the live window fed by a
//! `LiveStreamClient`, the paced reveal of the last batch analysis, and the
//! state of the upload/download actions. Each dashboard creates its own
//! window and scheduler; nothing is shared between instances.
//!
//! The controller is driven by a single loop, for example:
//! ```ignore
//! loop {
//!     let live = dash.live_inbound();
//!     let timeout = dash.next_deadline().map(|d| d.saturating_duration_since(Instant::now()));
//!     crossbeam::select! {
//!         recv(live) -> msg => dash.handle_inbound(msg, Instant::now()),
//!         default(timeout.unwrap_or(FRAME)) => {}
//!     }
//!     dash.poll(Instant::now());
//!     render(&dash.view());
//! }
//! ```

use crate::api::{Reply, RequestError};
use crate::event::{anomaly_series, AnalysisResult, BatchRow, LiveEvent, Summary};
use crate::reveal::{RevealPhase, RevealScheduler};
use crate::stream::{ConnectionState, Inbound, LiveStreamClient, StreamStats};
use crate::window::EventWindow;

use std::path::PathBuf;
use std::time::Instant;

use crossbeam::channel;

/// User visible outcome of an explicit action
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    UploadFailed(String),
    DownloadFailed(String),
    Downloaded { path: PathBuf, bytes: u64 },
}

/// Renderable state of a dashboard
#[derive(Debug)]
pub struct DashboardView<'a> {
    /// A live client is attached (the viewer is authenticated).
    pub authenticated: bool,
    pub connection: ConnectionState,
    pub stream_stats: StreamStats,
    pub busy: bool,
    pub summary: Option<&'a Summary>,
    pub file_id: Option<&'a str>,
    /// Revealed batch rows, in batch order.
    pub batch_rows: &'a [BatchRow],
    pub batch_total: usize,
    pub reveal: RevealPhase,
    /// Live events, newest first.
    pub live_rows: Vec<&'a LiveEvent>,
    pub live_anomalies: usize,
    pub notice: Option<&'a Notice>,
}

pub struct Dashboard {
    live: Option<LiveStreamClient>,
    window: EventWindow,
    reveal: RevealScheduler,
    summary: Option<Summary>,
    file_id: Option<String>,
    busy: bool,
    notice: Option<Notice>,
    torn_down: bool,
}

impl Default for Dashboard {
    fn default() -> Self {
        Dashboard::new()
    }
}

impl Dashboard {
    pub fn new() -> Dashboard {
        Dashboard {
            live: None,
            window: EventWindow::new(),
            reveal: RevealScheduler::new(),
            summary: None,
            file_id: None,
            busy: false,
            notice: None,
            torn_down: false,
        }
    }

    /// The viewer is authenticated: take ownership of `client` and start it.
    /// Any previously attached client is torn down first.
    pub fn attach_live(&mut self, mut client: LiveStreamClient, now: Instant) {
        if self.torn_down {
            client.teardown();
            return;
        }
        self.detach_live();
        client.start(now);
        self.live = Some(client);
    }

    /// Authentication was lost: stop the live feed. Already received events
    /// stay in the window.
    pub fn detach_live(&mut self) {
        if let Some(mut client) = self.live.take() {
            client.teardown();
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.live.is_some()
    }

    /// Receiver for the live link. Never ready without one.
    pub fn live_inbound(&self) -> channel::Receiver<Inbound> {
        match &self.live {
            Some(client) => client.inbound(),
            None => channel::never(),
        }
    }

    /// Feed the result of receiving on `live_inbound()`.
    pub fn handle_inbound(&mut self, msg: Result<Inbound, channel::RecvError>, now: Instant) {
        if self.torn_down {
            return;
        }
        if let Some(client) = self.live.as_mut() {
            match msg {
                Ok(inbound) => client.handle(inbound, &mut self.window, now),
                Err(channel::RecvError) => client.link_lost(now),
            }
        }
    }

    /// Earliest time at which `poll()` has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let live = self.live.as_ref().and_then(|c| c.next_deadline());
        match (live, self.reveal.next_deadline()) {
            (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
            (a, b) => a.or(b),
        }
    }

    /// Run due timers. Returns true if anything visible changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.torn_down {
            return false;
        }
        let state_before = self.live.as_ref().map(|c| c.state());
        if let Some(client) = self.live.as_mut() {
            client.poll(now);
        }
        let revealed = self.reveal.poll(now);
        revealed > 0 || state_before != self.live.as_ref().map(|c| c.state())
    }

    /// An upload is about to be sent. Returns false if one is already in
    /// flight, in which case nothing should be sent.
    pub fn begin_upload(&mut self) -> bool {
        if self.busy || self.torn_down {
            return false;
        }
        self.busy = true;
        self.notice = None;
        true
    }

    /// Apply the outcome of an upload. A successful result replaces the
    /// previous one and starts revealing its rows from scratch.
    pub fn finish_upload(&mut self, result: Result<AnalysisResult, RequestError>, now: Instant) {
        self.busy = false;
        if self.torn_down {
            return;
        }
        match result {
            Ok(res) => {
                log::info!(
                    "analysis {}: {} rows, {} anomalies",
                    res.file_id,
                    res.rows.len(),
                    res.summary.anomalies
                );
                self.summary = Some(res.summary);
                self.file_id = Some(res.file_id);
                self.reveal.start(res.rows, now);
            }
            Err(err) => {
                log::error!("upload failed: {}", err);
                self.notice = Some(Notice::UploadFailed(err.to_string()));
            }
        }
    }

    pub fn finish_download(&mut self, result: Result<(PathBuf, u64), RequestError>) {
        if self.torn_down {
            return;
        }
        self.notice = Some(match result {
            Ok((path, bytes)) => Notice::Downloaded { path, bytes },
            Err(err) => {
                log::error!("download failed: {}", err);
                Notice::DownloadFailed(err.to_string())
            }
        });
    }

    /// Route a `RequestWorker` reply.
    pub fn handle_reply(&mut self, reply: Reply, now: Instant) {
        match reply {
            Reply::Analyzed(result) => self.finish_upload(result, now),
            Reply::Downloaded(result) => self.finish_download(result),
        }
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    pub fn file_id(&self) -> Option<&str> {
        self.file_id.as_deref()
    }

    pub fn window(&self) -> &EventWindow {
        &self.window
    }

    pub fn reveal(&self) -> &RevealScheduler {
        &self.reveal
    }

    pub fn live(&self) -> Option<&LiveStreamClient> {
        self.live.as_ref()
    }

    /// (index, anomaly score) of each revealed batch row.
    pub fn anomaly_series(&self) -> Vec<(usize, f64)> {
        anomaly_series(self.reveal.revealed())
    }

    pub fn view(&self) -> DashboardView<'_> {
        let (_, batch_total) = self.reveal.progress();
        DashboardView {
            authenticated: self.live.is_some(),
            connection: self
                .live
                .as_ref()
                .map_or(ConnectionState::Disconnected, |c| c.state()),
            stream_stats: self.live.as_ref().map(|c| c.stats()).unwrap_or_default(),
            busy: self.busy,
            summary: self.summary.as_ref(),
            file_id: self.file_id.as_deref(),
            batch_rows: self.reveal.revealed(),
            batch_total,
            reveal: self.reveal.phase(),
            live_rows: self.window.iter().collect(),
            live_anomalies: self.window.anomaly_count(),
            notice: self.notice.as_ref(),
        }
    }

    /// Synchronously stop the live feed and the reveal, and discard their
    /// state. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.detach_live();
        self.reveal.cancel();
        self.window.clear();
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.teardown();
    }
}
