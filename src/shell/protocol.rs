//! Sentinel framing for commands sent to a persistent shell.
//!
//! Each command runs in a brace group with stdin from `/dev/null`, since the
//! shell's own stdin carries the command stream. After it the shell echoes a
//! marker carrying `$?` on stdout and a bare marker on stderr:
//!
//! ```text
//! { <command>
//! } </dev/null
//! __sbx_rc=$?; echo "<marker>:$__sbx_rc"; echo "<marker>" 1>&2
//! ```
//!
//! A stream is complete once its buffer ends with the marker line. The
//! marker may directly follow program output that lacks a final newline.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MARKER: AtomicU64 = AtomicU64::new(0);

/// Build a marker that will not occur in ordinary program output.
pub fn new_marker() -> String {
    let seq = NEXT_MARKER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("__SBX_DONE_{}_{seq}_{nanos:x}__", std::process::id())
}

/// Detach a command from the shell's stdin and append the sentinel echoes.
pub fn wrap_command(command: &str, marker: &str) -> String {
    // An empty brace group is a syntax error, which would end the shell.
    let body = if command.trim().is_empty() { ":" } else { command };
    format!(
        "{{ {body}\n}} </dev/null\n__sbx_rc=$?; echo \"{marker}:$__sbx_rc\"; echo \"{marker}\" 1>&2\n"
    )
}

/// If `buf` ends with the stdout sentinel, return where the program's own
/// output ends and the exit code carried by the sentinel.
pub fn split_stdout(buf: &[u8], marker: &str) -> Option<(usize, i32)> {
    let body = buf.strip_suffix(b"\n")?;
    let start = rfind(body, marker.as_bytes())?;
    let tail = &body[start + marker.len()..];
    let code = std::str::from_utf8(tail.strip_prefix(b":")?).ok()?;
    let code = code.parse().ok()?;
    Some((start, code))
}

/// If `buf` ends with the stderr sentinel, return where the program's own
/// stderr output ends.
pub fn split_stderr(buf: &[u8], marker: &str) -> Option<usize> {
    let body = buf.strip_suffix(b"\n")?;
    body.strip_suffix(marker.as_bytes()).map(<[u8]>::len)
}

/// Quote one word for the shell. Safe words are left as they are.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_-./=:,+@%".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Quote every word and join them into one command line.
pub fn join_quoted<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}
