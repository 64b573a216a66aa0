pub struct Utils {}

impl Utils {
    /// Current wall-clock time as Unix milliseconds (UTC)
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Truncate to at most `max_chars` characters, never splitting a UTF-8 sequence
    pub fn truncate_chars(s: &str, max_chars: usize) -> String {
        match s.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => s[..byte_idx].to_string(),
            None => s.to_string(),
        }
    }

    pub fn usize_to_i64(value: usize) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    pub fn i64_to_usize(value: i64) -> usize {
        usize::try_from(value).unwrap_or(0)
    }
}
