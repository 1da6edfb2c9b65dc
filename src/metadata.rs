//! Parser for the isolation tool's `--meta` report.
//!
//! The report is a list of `key:value` lines, e.g.
//!
//! ```text
//! time:0.012
//! time-wall:0.034
//! max-rss:3280
//! exitcode:0
//! ```
//!
//! Keys are not validated; unknown keys pass through unchanged.

use std::collections::HashMap;

/// Parsed metadata report.
pub type Metadata = HashMap<String, String>;

/// Parse a metadata report. `None` and empty text yield an empty map.
pub fn parse(text: Option<&str>) -> Metadata {
    let Some(text) = text else {
        return Metadata::new();
    };

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn seconds_as_ms(meta: &Metadata, key: &str) -> Option<u64> {
    meta.get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as u64)
}

fn integer(meta: &Metadata, key: &str) -> Option<i64> {
    meta.get(key).and_then(|v| v.parse().ok())
}

/// CPU time in milliseconds (`time`).
pub fn time_ms(meta: &Metadata) -> u64 {
    seconds_as_ms(meta, "time").unwrap_or(0)
}

/// Wall-clock time in milliseconds (`time-wall`).
pub fn wall_time_ms(meta: &Metadata) -> u64 {
    seconds_as_ms(meta, "time-wall").unwrap_or(0)
}

/// Peak memory in KiB: the larger of `max-rss` and `cg-mem`.
pub fn memory_kb(meta: &Metadata) -> u64 {
    let rss = integer(meta, "max-rss").unwrap_or(0);
    let cg = integer(meta, "cg-mem").unwrap_or(0);
    rss.max(cg).max(0) as u64
}

/// Fatal signal number (`exitsig`), if any.
pub fn exit_signal(meta: &Metadata) -> Option<i32> {
    integer(meta, "exitsig").map(|s| s as i32)
}

/// Exit code reported by the tool (`exitcode`), if any.
pub fn exit_code(meta: &Metadata) -> Option<i32> {
    integer(meta, "exitcode").map(|c| c as i32)
}

/// Whether the program was killed by the tool (`killed:1`).
pub fn is_killed(meta: &Metadata) -> bool {
    meta.get("killed").is_some_and(|v| v != "0")
}

/// Whether the cgroup OOM killer fired (`cg-oom-killed`).
pub fn is_oom_killed(meta: &Metadata) -> bool {
    meta.get("cg-oom-killed").is_some_and(|v| v != "0")
}

/// Two-letter status: `RE`, `SG`, `TO` or `XX`. Absent on success.
pub fn status(meta: &Metadata) -> Option<&str> {
    meta.get("status").map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let meta = parse(Some("status:TO\ntime:0.5\n"));
        assert_eq!(meta.len(), 2);
        assert_eq!(meta["status"], "TO");
        assert_eq!(meta["time"], "0.5");
    }

    #[test]
    fn empty_and_missing_input() {
        assert!(parse(Some("")).is_empty());
        assert!(parse(None).is_empty());
    }

    #[test]
    fn skips_blank_lines_and_trims() {
        let meta = parse(Some("\n  time : 0.010 \n\n\nmax-rss:2048\n   \n"));
        assert_eq!(meta["time"], "0.010");
        assert_eq!(meta["max-rss"], "2048");
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn splits_on_first_colon_only() {
        let meta = parse(Some("message:Caught fatal signal 11: SIGSEGV\n"));
        assert_eq!(meta["message"], "Caught fatal signal 11: SIGSEGV");
    }

    #[test]
    fn unknown_keys_pass_through() {
        let meta = parse(Some("csw-voluntary:3\nsomething-new:yes\n"));
        assert_eq!(meta["csw-voluntary"], "3");
        assert_eq!(meta["something-new"], "yes");
    }

    #[test]
    fn typed_accessors() {
        let meta = parse(Some(
            "time:0.123\ntime-wall:0.5\nmax-rss:1000\ncg-mem:4000\nexitsig:11\nkilled:1\nstatus:SG\n",
        ));
        assert_eq!(time_ms(&meta), 123);
        assert_eq!(wall_time_ms(&meta), 500);
        assert_eq!(memory_kb(&meta), 4000);
        assert_eq!(exit_signal(&meta), Some(11));
        assert_eq!(exit_code(&meta), None);
        assert!(is_killed(&meta));
        assert!(!is_oom_killed(&meta));
        assert_eq!(status(&meta), Some("SG"));
    }

    #[test]
    fn accessors_default_on_empty_report() {
        let meta = parse(None);
        assert_eq!(time_ms(&meta), 0);
        assert_eq!(memory_kb(&meta), 0);
        assert!(!is_killed(&meta));
        assert!(status(&meta).is_none());
    }
}
