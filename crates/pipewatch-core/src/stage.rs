//! Ordered development stage scale.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Development stage of an asset for one indication.
///
/// Variant order is the scale order, so `Ord` gives "higher stage" directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "Preclinical")]
    Preclinical,
    #[serde(rename = "Phase 1")]
    Phase1,
    #[serde(rename = "Phase 2")]
    Phase2,
    #[serde(rename = "Phase 3")]
    Phase3,
    #[serde(rename = "Registration")]
    Registration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized stage {0:?}")]
pub struct UnknownStage(pub String);

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Preclinical,
        Stage::Phase1,
        Stage::Phase2,
        Stage::Phase3,
        Stage::Registration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preclinical => "Preclinical",
            Stage::Phase1 => "Phase 1",
            Stage::Phase2 => "Phase 2",
            Stage::Phase3 => "Phase 3",
            Stage::Registration => "Registration",
        }
    }

    /// Parse the loose spellings pipeline disclosures use.
    ///
    /// Mixed phases ("Phase 1/2") resolve to the lower phase.
    pub fn parse_loose(input: &str) -> Result<Self, UnknownStage> {
        let compact = input
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.' && *c != '_')
            .collect::<String>();

        match compact.as_str() {
            "preclinical" | "discovery" | "indenabling" | "research" => {
                return Ok(Stage::Preclinical)
            }
            "registration" | "filed" | "submitted" | "underreview" | "regulatoryreview"
            | "registrationfiled" => return Ok(Stage::Registration),
            _ => {}
        }

        let rest = compact
            .strip_prefix("phase")
            .or_else(|| compact.strip_prefix("ph"))
            .ok_or_else(|| UnknownStage(input.to_string()))?;

        // post-approval studies sit outside the development scale
        if rest.starts_with("iv") || rest.starts_with('4') {
            Err(UnknownStage(input.to_string()))
        } else if rest.starts_with("iii") || rest.starts_with('3') {
            Ok(Stage::Phase3)
        } else if rest.starts_with("ii") || rest.starts_with('2') {
            Ok(Stage::Phase2)
        } else if rest.starts_with('i') || rest.starts_with('1') {
            Ok(Stage::Phase1)
        } else {
            Err(UnknownStage(input.to_string()))
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::parse_loose(s)
    }
}

/// Direction of a recorded stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDirection {
    Advance,
    Downgrade,
}

impl StageDirection {
    pub fn between(from: Stage, to: Stage) -> Self {
        if to >= from {
            StageDirection::Advance
        } else {
            StageDirection::Downgrade
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_is_ordered() {
        assert!(Stage::Preclinical < Stage::Phase1);
        assert!(Stage::Phase1 < Stage::Phase2);
        assert!(Stage::Phase2 < Stage::Phase3);
        assert!(Stage::Phase3 < Stage::Registration);
        assert_eq!(Stage::ALL.iter().max(), Some(&Stage::Registration));
    }

    #[test]
    fn parses_disclosure_spellings() {
        assert_eq!("Phase 3".parse::<Stage>().unwrap(), Stage::Phase3);
        assert_eq!("Phase III".parse::<Stage>().unwrap(), Stage::Phase3);
        assert_eq!("phase ii".parse::<Stage>().unwrap(), Stage::Phase2);
        assert_eq!("Ph1b".parse::<Stage>().unwrap(), Stage::Phase1);
        assert_eq!("Phase 1/2".parse::<Stage>().unwrap(), Stage::Phase1);
        assert_eq!("PHASE2".parse::<Stage>().unwrap(), Stage::Phase2);
        assert_eq!("Pre-clinical".parse::<Stage>().unwrap(), Stage::Preclinical);
        assert_eq!("Registration".parse::<Stage>().unwrap(), Stage::Registration);
        assert_eq!("Filed".parse::<Stage>().unwrap(), Stage::Registration);
    }

    #[test]
    fn rejects_unknown_stage() {
        assert!("Unknown".parse::<Stage>().is_err());
        assert!("Phase".parse::<Stage>().is_err());
        assert!("".parse::<Stage>().is_err());
    }

    #[test]
    fn serde_uses_display_names() {
        let json = serde_json::to_string(&Stage::Phase2).unwrap();
        assert_eq!(json, "\"Phase 2\"");
        let back: Stage = serde_json::from_str("\"Registration\"").unwrap();
        assert_eq!(back, Stage::Registration);
    }

    #[test]
    fn direction_between_stages() {
        assert_eq!(
            StageDirection::between(Stage::Phase3, Stage::Registration),
            StageDirection::Advance
        );
        assert_eq!(
            StageDirection::between(Stage::Phase3, Stage::Phase2),
            StageDirection::Downgrade
        );
    }
}
