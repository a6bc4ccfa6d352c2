//! Sync engine: locate, parse, fetch and materialize invoices
//!
//! Runs are leased per connection and idempotent per message, so a push, a
//! poll and a retry can overlap safely.

mod fetch;
mod locate;
mod materialize;
mod normalizer;
mod orchestrator;
mod parse;
mod push;
mod timing;

pub use fetch::{AttachmentFetcher, DownloadedFile, Downloader, HttpDownloader};
pub use locate::{LocateResult, MessageLocator, SyncMode, build_search_query};
pub use materialize::{MaterializeHints, Materializer, Payload};
pub use normalizer::{NormalizerSession, PreviewNormalizer, TickReport};
pub use orchestrator::{
    SyncContext, SyncOrchestrator, SyncPhase, SyncReport, due_connections, register_watch,
    run_batch,
};
pub use parse::{
    MAX_LINKS_PER_MESSAGE, attachment_descriptor, decode_base64url, extract_links, parse_message,
};
pub use push::{ConnectionPush, PushHandler, PushNotification, PushOutcome, check_newer, decode_notification};
pub use timing::{cooldown_elapsed, cooldown_elapsed_at};
