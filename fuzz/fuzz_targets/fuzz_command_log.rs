#![no_main]
use libfuzzer_sys::fuzz_target;
use arbitrary::Arbitrary;

use feedsync::serialization;
use feedsync::{PostCommand, PostCommandLog};

/// Fuzz the post command log decoders and merge.
///
/// Remote feeds hand us arbitrary bytes; decoding must never panic, and
/// building, merging and querying logs from whatever decodes must not
/// either.

#[derive(Arbitrary, Debug)]
struct LogInput {
    /// Raw bytes as read from a feed version
    feed_bytes: Vec<u8>,
    /// JSON text for a whole log
    log_json: String,
    /// Number of posts to ask for
    count: Option<u8>,
}

fuzz_target!(|input: LogInput| {
    if input.feed_bytes.len() > 65536 || input.log_json.len() > 65536 {
        return;
    }

    let single = serialization::deserialize_bytes::<PostCommand>(&input.feed_bytes);
    let log = match serialization::deserialize::<Vec<PostCommand>>(&input.log_json) {
        Ok(commands) => PostCommandLog::from_commands(commands),
        Err(_) => PostCommandLog::new(),
    };

    // Canonical order is stable under re-sorting.
    let resorted = PostCommandLog::from_commands(log.commands().to_vec());
    assert_eq!(resorted, log);

    let other = match single {
        Ok(command) => PostCommandLog::from_commands(vec![command]),
        Err(_) => PostCommandLog::new(),
    };
    let merged = log.merge(&other);
    merged.check_ordering().unwrap();
    assert_eq!(merged, other.merge(&log));
    assert_eq!(merged.merge(&log), merged);
    assert_eq!(merged.merge(&other), merged);

    // Uploading renumbers unsynced commands above the synced history.
    if !merged.unsynced_commands().is_empty() && merged.highest_seen_timestamp() < u64::MAX / 2 {
        let rebased = merged.rebased();
        rebased.check_invariants().unwrap();
        assert_eq!(rebased.commands().len(), merged.commands().len());
        assert_eq!(rebased.rebased(), rebased);
    }
    let _ = merged.latest_posts(input.count.map(usize::from));
    let _ = merged.highest_seen_timestamp();
});
