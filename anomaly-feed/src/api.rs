//! Batch analysis requests
//!
//! Uploading a log file for analysis and downloading the resulting anomaly
//! CSV are explicit user actions: failures are returned to the caller as a
//! `RequestError` and never retried here.
//!
//! `ApiClient` performs the requests synchronously. `RequestWorker` runs
//! them on a dedicated thread and hands back `Reply`s over a channel, so an
//! event loop can keep going while a request is in flight.

use crate::auth::{auth_header, AuthError, TokenProvider};
use crate::event::AnalysisResult;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::AUTHORIZATION;
use url::Url;

/// Upper bound for a single request, upload included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Possible errors when performing a request
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("not authenticated: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid address: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

pub struct ApiClient {
    base: Url,
    http: Client,
}

impl ApiClient {
    pub fn new(base: &str) -> Result<ApiClient, RequestError> {
        let mut base = Url::parse(base)?;
        // Make sure join() appends to the base path instead of replacing
        // its last segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(ApiClient { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn analyze_url(&self) -> Result<Url, RequestError> {
        Ok(self.base.join("analyze")?)
    }

    fn download_url(&self, file_id: &str) -> Result<Url, RequestError> {
        let mut url = self.base.join("download/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(file_id);
        Ok(url)
    }

    /// Upload the file at `path` for analysis.
    pub fn analyze<P: TokenProvider + ?Sized>(
        &self,
        provider: &P,
        path: &Path,
    ) -> Result<AnalysisResult, RequestError> {
        let form = multipart::Form::new().file("file", path)?;
        self.analyze_form(provider, form)
    }

    /// Upload in-memory file contents for analysis.
    pub fn analyze_bytes<P: TokenProvider + ?Sized>(
        &self,
        provider: &P,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<AnalysisResult, RequestError> {
        let part = multipart::Part::bytes(contents).file_name(file_name.to_string());
        self.analyze_form(provider, multipart::Form::new().part("file", part))
    }

    fn analyze_form<P: TokenProvider + ?Sized>(
        &self,
        provider: &P,
        form: multipart::Form,
    ) -> Result<AnalysisResult, RequestError> {
        let mut req: RequestBuilder = self.http.post(self.analyze_url()?).multipart(form);
        // The upload goes out anonymously if there is no credential; the
        // backend decides whether that is acceptable.
        if let Some(header) = auth_header(provider) {
            req = req.header(AUTHORIZATION, header);
        }
        let resp = check_status(req.send()?)?;
        let body = resp.bytes()?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch the anomaly CSV for a previous analysis. Requires a credential.
    pub fn download<P: TokenProvider + ?Sized>(
        &self,
        provider: &P,
        file_id: &str,
    ) -> Result<Vec<u8>, RequestError> {
        let token = provider.token()?;
        let resp = self
            .http
            .get(self.download_url(file_id)?)
            .header(AUTHORIZATION, token.bearer())
            .send()?;
        let resp = check_status(resp)?;
        Ok(resp.bytes()?.to_vec())
    }

    /// Like `download()`, writing the CSV to `dest`. Returns its size.
    pub fn download_to<P: TokenProvider + ?Sized>(
        &self,
        provider: &P,
        file_id: &str,
        dest: &Path,
    ) -> Result<u64, RequestError> {
        let contents = self.download(provider, file_id)?;
        fs::write(dest, &contents)?;
        Ok(contents.len() as u64)
    }
}

/// Turn a non-success response into `RequestError::Status`, using the
/// backend's `detail` message when there is one.
fn check_status(resp: Response) -> Result<Response, RequestError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.canonical_reason().unwrap_or("").to_string()
            } else {
                text
            }
        });
    Err(RequestError::Status {
        status: status.as_u16(),
        detail,
    })
}

/// Work for a `RequestWorker`
#[derive(Debug, Clone)]
pub enum Job {
    Analyze(PathBuf),
    Download { file_id: String, dest: PathBuf },
}

/// Outcome of a `Job`
#[derive(Debug)]
pub enum Reply {
    Analyzed(Result<AnalysisResult, RequestError>),
    Downloaded(Result<(PathBuf, u64), RequestError>),
}

/// Runs requests one at a time on a dedicated thread.
pub struct RequestWorker {
    jobs: channel::Sender<Job>,
    replies: channel::Receiver<Reply>,
}

impl RequestWorker {
    pub fn spawn(
        api: ApiClient,
        provider: Box<dyn TokenProvider + Send>,
    ) -> io::Result<RequestWorker> {
        let (jobs, job_rx) = channel::unbounded::<Job>();
        let (reply_tx, replies) = channel::unbounded::<Reply>();
        thread::Builder::new()
            .name("requests".to_string())
            .spawn(move || {
                // Exits once the worker handle (and with it the job sender)
                // is dropped.
                for job in job_rx.iter() {
                    let reply = match job {
                        Job::Analyze(path) => {
                            log::info!("analyzing {}", path.display());
                            Reply::Analyzed(api.analyze(&*provider, &path))
                        }
                        Job::Download { file_id, dest } => {
                            log::info!("downloading {} to {}", file_id, dest.display());
                            Reply::Downloaded(
                                api.download_to(&*provider, &file_id, &dest)
                                    .map(|size| (dest, size)),
                            )
                        }
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            })?;
        Ok(RequestWorker { jobs, replies })
    }

    /// Queue a job. Returns false if the worker thread is gone.
    pub fn submit(&self, job: Job) -> bool {
        self.jobs.send(job).is_ok()
    }

    pub fn replies(&self) -> &channel::Receiver<Reply> {
        &self.replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_keep_base_path() {
        let api = ApiClient::new("http://example.com/api").unwrap();
        assert_eq!(api.analyze_url().unwrap().as_str(), "http://example.com/api/analyze");
        assert_eq!(
            api.download_url("abc-123").unwrap().as_str(),
            "http://example.com/api/download/abc-123"
        );
        let api = ApiClient::new("http://localhost:8000").unwrap();
        assert_eq!(api.analyze_url().unwrap().as_str(), "http://localhost:8000/analyze");
    }

    #[test]
    fn file_id_is_one_segment() {
        let api = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(
            api.download_url("../x?y").unwrap().as_str(),
            "http://localhost:8000/download/..%2Fx%3Fy"
        );
    }

    #[test]
    fn download_requires_credential() {
        let api = ApiClient::new("http://localhost:8000/").unwrap();
        let res = api.download(&crate::auth::StaticToken::anonymous(), "abc");
        assert!(matches!(res, Err(RequestError::Auth(AuthError::Unauthenticated))));
    }

    #[test]
    fn bad_base_is_rejected() {
        assert!(matches!(ApiClient::new("not a url"), Err(RequestError::Url(_))));
    }
}
