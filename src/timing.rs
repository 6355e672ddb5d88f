//! # Timing Line Parser
//!
//! The handshake binaries report their internal timers on standard output,
//! one timer per line:
//!
//! ```text
//! CLIENT HELLO SENT: 183402 ns
//! HANDSHAKE COMPLETED: 2918340 ns
//! ```
//!
//! A label is made of uppercase ASCII letters and spaces, the value is a
//! non-negative nanosecond count. Anything else on the stream is noise and is
//! skipped. Timers accumulate into a [`TimingRecord`] until the terminal label
//! is seen, at which point the record is sealed and a new one is started.
//!
//! Parsers are cheap and hold no state beyond the record in progress, so a
//! fresh one is created for each server lifetime and each client batch.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Label that closes one handshake's record on both endpoints.
pub const TERMINAL_LABEL: &str = "HANDSHAKE COMPLETED";

fn timer_regex() -> &'static Regex {
    static TIMER: OnceLock<Regex> = OnceLock::new();
    TIMER.get_or_init(|| {
        Regex::new(r"^(?P<label>[A-Z ]+): (?P<timing>\d+) ns$").expect("timer regex is valid")
    })
}

/// Match a single line against the timer format.
///
/// Trailing `\r`/`\n` are tolerated so raw lines from a pipe can be passed
/// straight in. Values that do not fit in a `u64` are treated as noise.
pub fn parse_timer_line(line: &str) -> Option<(&str, u64)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = timer_regex().captures(line)?;
    let label = caps.name("label")?.as_str();
    let timing = caps.name("timing")?.as_str().parse().ok()?;
    Some((label, timing))
}

/// Timers of one handshake, keyed by label, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingRecord {
    timers: BTreeMap<String, u64>,
}

impl TimingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, nanos: u64) {
        self.timers.insert(label.into(), nanos);
    }

    pub fn get(&self, label: &str) -> Option<u64> {
        self.timers.get(label).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.timers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.timers.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for TimingRecord {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        let mut record = TimingRecord::new();
        for (label, nanos) in iter {
            record.insert(label, nanos);
        }
        record
    }
}

/// Incremental parser turning timer lines into sealed records.
#[derive(Debug, Clone)]
pub struct TimingParser {
    terminal_label: String,
    current: TimingRecord,
}

impl TimingParser {
    pub fn new(terminal_label: impl Into<String>) -> Self {
        Self {
            terminal_label: terminal_label.into(),
            current: TimingRecord::new(),
        }
    }

    /// Feed one line. Returns the sealed record when the line carried the
    /// terminal label.
    pub fn feed(&mut self, line: &str) -> Option<TimingRecord> {
        let (label, nanos) = parse_timer_line(line)?;
        let sealed = label == self.terminal_label;
        self.current.insert(label, nanos);
        if sealed {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        }
    }

    /// The record still being assembled, not yet sealed.
    pub fn in_progress(&self) -> &TimingRecord {
        &self.current
    }

    /// Lazily parse `lines`, yielding each record as it is sealed.
    pub fn records<I>(self, lines: I) -> SealedRecords<I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        SealedRecords {
            parser: self,
            lines: lines.into_iter(),
        }
    }

    /// Parse a whole captured output buffer.
    pub fn parse_output(terminal_label: &str, output: &str) -> Vec<TimingRecord> {
        TimingParser::new(terminal_label).records(output.lines()).collect()
    }
}

impl Default for TimingParser {
    fn default() -> Self {
        Self::new(TERMINAL_LABEL)
    }
}

/// Iterator returned by [`TimingParser::records`].
#[derive(Debug)]
pub struct SealedRecords<I> {
    parser: TimingParser,
    lines: I,
}

impl<I> SealedRecords<I> {
    /// Give back the parser, including any unsealed partial record.
    pub fn into_parser(self) -> TimingParser {
        self.parser
    }
}

impl<I> Iterator for SealedRecords<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = TimingRecord;

    fn next(&mut self) -> Option<TimingRecord> {
        for line in self.lines.by_ref() {
            if let Some(record) = self.parser.feed(line.as_ref()) {
                return Some(record);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, u64)]) -> TimingRecord {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_terminal_label_seals_record() {
        let lines = ["A: 1 ns", "B: 2 ns", "HANDSHAKE COMPLETED: 3 ns", "A: 4 ns"];
        let mut sealed = TimingParser::new(TERMINAL_LABEL).records(lines);

        assert_eq!(
            sealed.next(),
            Some(record(&[("A", 1), ("B", 2), ("HANDSHAKE COMPLETED", 3)]))
        );
        assert_eq!(sealed.next(), None);

        let parser = sealed.into_parser();
        assert_eq!(parser.in_progress(), &record(&[("A", 4)]));
    }

    #[test]
    fn test_regex_boundaries() {
        assert_eq!(parse_timer_line("HANDSHAKE COMPLETED: 3 ns"), Some(("HANDSHAKE COMPLETED", 3)));
        assert_eq!(parse_timer_line("WRITE: 1234567890 ns"), Some(("WRITE", 1234567890)));
        assert_eq!(parse_timer_line("WRITE: 12 ns\n"), Some(("WRITE", 12)));
        assert_eq!(parse_timer_line("WRITE: 12 ns\r\n"), Some(("WRITE", 12)));

        // lowercase label
        assert_eq!(parse_timer_line("write: 12 ns"), None);
        // missing unit suffix
        assert_eq!(parse_timer_line("WRITE: 12"), None);
        assert_eq!(parse_timer_line("WRITE: 12 ms"), None);
        // negative or fractional values
        assert_eq!(parse_timer_line("WRITE: -12 ns"), None);
        assert_eq!(parse_timer_line("WRITE: 1.5 ns"), None);
        // digits in the label, leading noise, trailing noise
        assert_eq!(parse_timer_line("TLS13 WRITE: 12 ns"), None);
        assert_eq!(parse_timer_line("[x] WRITE: 12 ns"), None);
        assert_eq!(parse_timer_line("WRITE: 12 ns total"), None);
        // does not fit in u64
        assert_eq!(parse_timer_line("WRITE: 99999999999999999999999 ns"), None);
        assert_eq!(parse_timer_line(""), None);
    }

    #[test]
    fn test_noise_lines_are_ignored() {
        let output = "Connecting to servername\nA: 1 ns\nsome log line\nHANDSHAKE COMPLETED: 5 ns\n\nGET / HTTP/1.1\n";
        let records = TimingParser::parse_output(TERMINAL_LABEL, output);
        assert_eq!(records, vec![record(&[("A", 1), ("HANDSHAKE COMPLETED", 5)])]);
    }

    #[test]
    fn test_repeated_label_keeps_last_value() {
        let records = TimingParser::parse_output(
            TERMINAL_LABEL,
            "A: 1 ns\nA: 7 ns\nHANDSHAKE COMPLETED: 9 ns",
        );
        assert_eq!(records[0].get("A"), Some(7));
    }

    #[test]
    fn test_custom_terminal_label() {
        let records = TimingParser::parse_output("DONE", "A: 1 ns\nDONE: 2 ns\nHANDSHAKE COMPLETED: 3 ns");
        assert_eq!(records, vec![record(&[("A", 1), ("DONE", 2)])]);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let lines: Vec<String> = (0..5)
            .flat_map(|i| {
                vec![
                    format!("CLIENT HELLO: {} ns", i * 10),
                    "noise".to_string(),
                    format!("SERVER HELLO: {} ns", i * 10 + 1),
                    format!("HANDSHAKE COMPLETED: {} ns", i * 10 + 2),
                ]
            })
            .collect();

        let whole: Vec<_> = TimingParser::default().records(&lines).collect();
        assert_eq!(whole.len(), 5);

        // Feed the same lines split at every possible boundary into one parser
        // across two invocations.
        for split in 0..=lines.len() {
            let (head, tail) = lines.split_at(split);
            let mut first = TimingParser::default().records(head);
            let mut chunked: Vec<_> = first.by_ref().collect();
            let parser = first.into_parser();
            chunked.extend(parser.records(tail));
            assert_eq!(chunked, whole, "split at {}", split);
        }

        // Same sequence twice from fresh parsers.
        let again: Vec<_> = TimingParser::default().records(&lines).collect();
        assert_eq!(again, whole);
    }
}
