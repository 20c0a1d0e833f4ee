//! media-relay
//!
//! Watches an intake tree for request files, hands them to an external
//! consumer through a drop-off directory, and files the finished artifacts
//! into a media library once they show up in the completed-output directory.

pub mod category;
pub mod classify;
pub mod finalize;
pub mod intake;
pub mod matcher;
pub mod pipeline;
pub mod registrar;
pub mod registry;
pub mod relocate;
pub mod scan;
pub mod startup;
pub mod stats;

pub use media_relay_config as config;
pub use media_relay_config::Config;
pub use category::{Categorizer, Category, KeywordCategorizer};
pub use classify::{classify_event, DiscardReason, IntakeRules, Route};
pub use finalize::{
    final_destination, select_largest, DestinationError, FileEntry, FinalizeError, Finalizer,
    FinalizerSettings,
};
pub use intake::{consume, IntakeError, IntakeMover, IntakeSettings};
pub use matcher::{
    find_matches, tokenize, tokens_match, CompletionMatcher, FinalizeRequest, MatcherSettings,
    TokenSet,
};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings};
pub use registrar::{
    NotifyBackend, Registrar, RegistrarCommand, RegistrarError, WatchBackend, WatchEvent,
    WatchEventKind, WatchRegistrationError,
};
pub use registry::{ActiveFile, ActiveFileRegistry};
pub use relocate::{move_with_timeout, MoveError, MovePolicy};
pub use scan::{discover_directories, discover_intake_files};
pub use startup::{check_required_paths, PipelinePaths, StartupError};
pub use stats::{new_shared_stats, PipelineStats, SharedStats};
