pub mod api;
pub mod auth;
pub mod dashboard;
pub mod event;
pub mod reveal;
pub mod stream;
pub mod util;
pub mod window;

pub use dashboard::Dashboard;
pub use event::{AnalysisResult, BatchRow, LiveEvent, Summary};
pub use reveal::RevealScheduler;
pub use stream::{ConnectionState, LiveStreamClient};
pub use window::EventWindow;
