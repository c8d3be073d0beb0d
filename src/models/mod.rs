pub mod abab;
pub mod event;
pub mod its;
pub mod run;

pub use abab::{AbabAnalyzeRequest, AbabAnalyzeResponse, AbabHistoryResponse, WwcDetails};
pub use event::{BehavioralEvent, CompletionQuality, EngagementLevel, EventType, RawEventRecord};
pub use its::{ItsAnalyzeRequest, ItsAnalyzeResponse, ItsHistoryResponse};
pub use run::{AnalysisRun, RunBuilder};
