//! Init-progress normalisation
//!
//! Engines report either a numeric fraction or a status line with the
//! percentage embedded ("Fetching param cache[12/40]: 37% completed").

use once_cell::sync::Lazy;
use regex::Regex;

use super::engine::InitReport;
use crate::types::InitProgress;

static PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)%").unwrap());

const FINISHED_MARKER: &str = "Finish loading";

/// Convert a raw engine report into an [`InitProgress`]
pub fn normalize(report: &InitReport) -> InitProgress {
    let percent = report
        .progress
        .filter(|p| p.is_finite())
        .map(|p| (p * 100.0).round().clamp(0.0, 100.0) as u8)
        .or_else(|| text_percent(&report.text))
        .unwrap_or(0);

    InitProgress {
        percent,
        text: report.text.clone(),
        finished: percent >= 100 || report.text.contains(FINISHED_MARKER),
    }
}

fn text_percent(text: &str) -> Option<u8> {
    PERCENT
        .captures(text)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
}
