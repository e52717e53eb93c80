// src/run/identifier.rs

//! Labnumber / run id helpers.
//!
//! Run ids look like `12345-01A`: the labnumber, a zero padded aliquot and an
//! optional step letter. Special labnumbers (blanks, air, ...) use a short
//! analysis-type prefix such as `bu-01-01`.

use crate::types::AnalysisType;

const ALPHAS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Short names used as the prefix of special labnumbers.
const SPECIAL_PREFIXES: &[&str] = &["ba", "bc", "bu", "bg", "u", "c", "a", "pa", "dg"];

/// Infer the analysis type from a labnumber.
///
/// `bg` is checked before the `b*` blank prefixes.
pub fn analysis_type_for(labnumber: &str) -> AnalysisType {
    let idn = labnumber.trim().to_lowercase();
    if idn.starts_with("bg") {
        AnalysisType::Background
    } else if idn.starts_with("ba") {
        AnalysisType::BlankAir
    } else if idn.starts_with("bu") {
        AnalysisType::BlankUnknown
    } else if idn.starts_with("bc") {
        AnalysisType::BlankCocktail
    } else if idn.starts_with('a') {
        AnalysisType::Air
    } else if idn.starts_with('c') {
        AnalysisType::Cocktail
    } else if idn.starts_with("dg") {
        AnalysisType::Degas
    } else if idn.starts_with("pa") {
        AnalysisType::Pause
    } else {
        AnalysisType::Unknown
    }
}

/// Step letter for a zero based step index (`0 -> "A"`).
pub fn step_letter(index: usize) -> Option<char> {
    ALPHAS.get(index).map(|b| *b as char)
}

/// Zero based index of a step letter (`'B' -> 1`).
pub fn step_index(step: char) -> Option<usize> {
    let upper = step.to_ascii_uppercase() as u8;
    ALPHAS.iter().position(|b| *b == upper)
}

/// Format a run id: `12345-01A`.
pub fn make_runid(labnumber: &str, aliquot: u32, step: Option<char>) -> String {
    match step {
        Some(s) => format!("{labnumber}-{aliquot:02}{s}"),
        None => format!("{labnumber}-{aliquot:02}"),
    }
}

/// Split a run id back into `(labnumber, aliquot, step)`.
///
/// Special labnumbers contain dashes themselves, so the aliquot is taken
/// from the last dash-separated segment.
pub fn strip_runid(runid: &str) -> Option<(String, u32, Option<char>)> {
    let (labnumber, tail) = runid.rsplit_once('-')?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    let aliquot = digits.parse().ok()?;
    let rest = &tail[digits.len()..];
    let step = match rest.len() {
        0 => None,
        1 => rest.chars().next().filter(|c| c.is_ascii_alphabetic()),
        _ => return None,
    };
    if !rest.is_empty() && step.is_none() {
        return None;
    }
    Some((labnumber.to_string(), aliquot, step))
}

/// Whether the labnumber is a special (non-sample) identifier like `bu-01-01`.
pub fn is_special(labnumber: &str) -> bool {
    match labnumber.split_once('-') {
        Some((prefix, _)) => SPECIAL_PREFIXES.contains(&prefix.to_lowercase().as_str()),
        None => false,
    }
}

/// Normalise an extract device display name: `"Fusions CO2"` -> `"fusions_co2"`.
pub fn convert_extract_device(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Whether a queue's extract device names a real device.
pub fn is_device_named(name: &str) -> bool {
    let name = name.trim();
    !(name.is_empty() || name == "---" || name == "Extract Device")
}
