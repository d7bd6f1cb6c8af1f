//! Public post log.
//!
//! - [`post`]: the post payload
//! - [`command_log`]: newest-first command log with merge and invariant checks
//! - [`sync`]: walking a feed's epoch chain and uploading unsynced commands

pub mod command_log;
pub mod post;
pub mod sync;

pub use command_log::{
    merge_post_command_logs, sort_and_filter_post_commands, LogError, PostCommand, PostCommandLog,
    PostCommandType,
};
pub use post::{ImageData, Post};
pub use sync::{
    fetch_post_command_log, post_command_log_topic, sync_post_command_log_with_remote,
    upload_unsynced_post_commands, SyncError,
};
