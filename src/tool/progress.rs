use std::sync::OnceLock;

use log::{debug, info};
use regex::Regex;

/// Receives progress updates as a fraction in `[0, 1]` and a short description
pub trait ProgressSink {
    fn report(&self, fraction: f64, text: &str);
}

impl<F: Fn(f64, &str)> ProgressSink for F {
    fn report(&self, fraction: f64, text: &str) {
        self(fraction, text)
    }
}

/// Writes progress updates to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, fraction: f64, text: &str) {
        info!("[{:>5.1}%] {text}", fraction * 100.0);
    }
}

/// Discards progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64, _text: &str) {}
}

/// Line prefixes TOPP tools print when they move on to a new phase of work
pub const PHASE_MARKERS: &[&str] = &[
    "Progress of",
    "Loading",
    "Reading",
    "Writing",
    "Storing",
    "Searching",
    "Aligning",
    "Mapping",
    "Detecting",
    "Quantifying",
    "Indexing",
    "Filtering",
    "Normalizing",
];

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid percent pattern"))
}

fn quoted_phase_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Progress of '([^']*)'").expect("valid phase pattern"))
}

/**
Follows a tool's standard output, tracking the label of the phase it is in
and turning percentage lines into progress fractions.
*/
#[derive(Debug, Clone)]
pub struct ToolProgressParser {
    phase: String,
}

impl ToolProgressParser {
    pub fn new(initial_phase: impl Into<String>) -> Self {
        Self {
            phase: initial_phase.into(),
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    fn update_phase(&mut self, line: &str) {
        let trimmed = line.trim();
        if !PHASE_MARKERS.iter().any(|m| trimmed.starts_with(m)) {
            return;
        }
        let phase = match quoted_phase_pattern().captures(trimmed) {
            Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(trimmed).to_string(),
            // A marker line may also carry the percentage, which is not part of the label
            None => percent_pattern()
                .replace_all(trimmed, "")
                .trim_end_matches(['.', ':', ' '])
                .to_string(),
        };
        if phase.is_empty() {
            return;
        }
        if phase != self.phase {
            debug!("Tool entered phase {phase:?}");
            self.phase = phase;
        }
    }

    /// Consume one line of output, returning a progress update if the line carried one
    pub fn feed(&mut self, line: &str) -> Option<(f64, String)> {
        self.update_phase(line);
        if !line.contains('%') {
            return None;
        }
        let caps = percent_pattern().captures(line)?;
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        Some((fraction, format!("{}: {percent:.0}%", self.phase)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tracks_phase_and_percent() {
        let mut parser = ToolProgressParser::new("FeatureFinderCentroided");
        assert_eq!(parser.feed("some chatter"), None);
        assert_eq!(parser.feed("Progress of 'loading mzML file':"), None);
        assert_eq!(parser.phase(), "loading mzML file");
        assert_eq!(
            parser.feed("  50.00 %"),
            Some((0.5, "loading mzML file: 50%".to_string()))
        );
        parser.feed("Writing results...");
        assert_eq!(parser.phase(), "Writing results");
        assert_eq!(
            parser.feed("Writing results 120%"),
            Some((1.0, "Writing results: 120%".to_string()))
        );
        assert_eq!(parser.feed("no number here %"), None);
        assert_eq!(
            parser.feed("Loading 25 % ..."),
            Some((0.25, "Loading: 25%".to_string()))
        );
        assert_eq!(parser.phase(), "Loading");
    }
}
