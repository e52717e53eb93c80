use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of analysis a queued run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Unknown,
    BlankUnknown,
    BlankAir,
    BlankCocktail,
    Air,
    Cocktail,
    Background,
    Pause,
    Degas,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Unknown => "unknown",
            AnalysisType::BlankUnknown => "blank_unknown",
            AnalysisType::BlankAir => "blank_air",
            AnalysisType::BlankCocktail => "blank_cocktail",
            AnalysisType::Air => "air",
            AnalysisType::Cocktail => "cocktail",
            AnalysisType::Background => "background",
            AnalysisType::Pause => "pause",
            AnalysisType::Degas => "degas",
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(
            self,
            AnalysisType::BlankUnknown | AnalysisType::BlankAir | AnalysisType::BlankCocktail
        )
    }

    /// The blank type that must precede this type, if any.
    ///
    /// Only air, unknown and cocktail runs require a blank.
    pub fn preceding_blank(&self) -> Option<AnalysisType> {
        match self {
            AnalysisType::Unknown => Some(AnalysisType::BlankUnknown),
            AnalysisType::Air => Some(AnalysisType::BlankAir),
            AnalysisType::Cocktail => Some(AnalysisType::BlankCocktail),
            _ => None,
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(' ', "_").as_str() {
            "unknown" => Ok(AnalysisType::Unknown),
            "blank_unknown" => Ok(AnalysisType::BlankUnknown),
            "blank_air" => Ok(AnalysisType::BlankAir),
            "blank_cocktail" => Ok(AnalysisType::BlankCocktail),
            "air" => Ok(AnalysisType::Air),
            "cocktail" => Ok(AnalysisType::Cocktail),
            "background" => Ok(AnalysisType::Background),
            "pause" => Ok(AnalysisType::Pause),
            "degas" => Ok(AnalysisType::Degas),
            other => Err(format!("invalid analysis type: {other}")),
        }
    }
}

/// How a measuring run is cut short.
///
/// - `Normal`: counting stops at the current step; acquired data is kept.
/// - `Quick`: counting continues, but only up to a quarter of the configured
///   counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateStyle {
    Normal,
    Quick,
}

impl Default for TruncateStyle {
    fn default() -> Self {
        TruncateStyle::Normal
    }
}

impl FromStr for TruncateStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(TruncateStyle::Normal),
            "quick" => Ok(TruncateStyle::Quick),
            other => Err(format!(
                "invalid truncate style: {other} (expected \"normal\" or \"quick\")"
            )),
        }
    }
}

/// Scope of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStyle {
    /// Stop the whole queue.
    Queue,
    /// Cancel only the measuring run; the queue proceeds.
    Run,
}

/// Colour the display collaborator should use for a message or label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleColor {
    Green,
    Orange,
    Red,
    Black,
}

/// Answer to a confirmation dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Cancel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_type_parses_display_names() {
        assert_eq!(
            "Blank Unknown".parse::<AnalysisType>(),
            Ok(AnalysisType::BlankUnknown)
        );
        assert_eq!("air".parse::<AnalysisType>(), Ok(AnalysisType::Air));
        assert!("rock".parse::<AnalysisType>().is_err());
    }

    #[test]
    fn only_measured_types_need_blanks() {
        assert_eq!(
            AnalysisType::Unknown.preceding_blank(),
            Some(AnalysisType::BlankUnknown)
        );
        assert_eq!(AnalysisType::BlankAir.preceding_blank(), None);
        assert_eq!(AnalysisType::Degas.preceding_blank(), None);
    }
}
