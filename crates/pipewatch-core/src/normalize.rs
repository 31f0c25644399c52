//! Label normalization shared by the canonicalizer and the trial linker.

use serde::{Deserialize, Serialize};

/// Characters that mark footnotes in pipeline tables and never belong to a name.
const FOOTNOTE_GLYPHS: &[char] = &[
    '†', '‡', '*', '§', '®', '™', '©', '¹', '²', '³', '⁰', '⁴', '⁵', '⁶', '⁷', '⁸', '⁹',
];

const LEADING_BULLETS: &[char] = &['•', '·', '*', '-', '–'];

const EDGE_PUNCTUATION: &[char] = &['-', '+', '.', '/', ' '];

/// Configurable normalization and plausibility rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationRules {
    /// Noise prefixes that leak from table layout, e.g. `system)`.
    pub strip_prefixes: Vec<String>,
    /// Labels that are column headers or section titles, never assets.
    pub stop_labels: Vec<String>,
    pub placeholders: Vec<String>,
    pub max_label_len: usize,
    pub max_words: usize,
    /// Minimum normalized length for containment matches and trial queries.
    pub min_alias_len: usize,
    /// Whole words that mark a partner or company name, e.g. `gmbh`.
    pub corporate_tokens: Vec<String>,
    /// Stop labels compared with all spaces and punctuation removed, for
    /// OCR output such as `Factor XIa` split across cells.
    pub stop_labels_compact: Vec<String>,
    /// Labels containing one of these are allowed past `max_words`.
    pub max_words_exempt: Vec<String>,
    /// Phrases that start footer or disclaimer text bleeding into an
    /// indication cell. The indication is cut at the first one.
    pub indication_cutoffs: Vec<String>,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self {
            strip_prefixes: vec!["system)".to_string(), "platform)".to_string()],
            stop_labels: [
                "indication",
                "indications",
                "delivery",
                "system",
                "platform",
                "mechanism",
                "target",
                "targets",
                "oncology",
                "immunology",
                "neuroscience",
                "select other areas",
                "pediatrics",
                "autoleucel",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            placeholders: ["other", "others", "unknown", "undisclosed"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_label_len: 70,
            max_words: 6,
            min_alias_len: 4,
            corporate_tokens: [
                "plc",
                "biosciences",
                "therapeutics",
                "pharma",
                "pharmaceutical",
                "corporation",
                "gmbh",
                "ltd",
                "inc",
                "ag",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            stop_labels_compact: vec!["factorxia".to_string(), "actorxia".to_string()],
            max_words_exempt: vec!["jnj-".to_string()],
            indication_cutoffs: [
                "inclusion in",
                "inclusion of",
                "through clinical trials",
                "to the best of the company's knowledge",
                "to the best of the companys knowledge",
                "the company assumes no obligation",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Why a label cannot name an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelRejection {
    Empty,
    StopLabel,
    Placeholder,
    TooLong,
    TooManyWords,
    CorporateToken,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: NormalizationRules,
    stop_keys: Vec<String>,
    stop_compact_keys: Vec<String>,
    placeholder_keys: Vec<String>,
}

impl Normalizer {
    pub fn new(rules: NormalizationRules) -> Self {
        let mut this = Self {
            rules,
            stop_keys: Vec::new(),
            stop_compact_keys: Vec::new(),
            placeholder_keys: Vec::new(),
        };
        this.stop_keys = this.rules.stop_labels.iter().map(|s| this.key(s)).collect();
        this.stop_compact_keys = this
            .rules
            .stop_labels_compact
            .iter()
            .map(|s| {
                s.chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase()
            })
            .collect();
        this.placeholder_keys = this
            .rules
            .placeholders
            .iter()
            .map(|s| this.key(s))
            .collect();
        this
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    /// Lookup key: case-folded, footnotes and noise prefixes removed,
    /// punctuation stripped, whitespace collapsed.
    pub fn key(&self, raw: &str) -> String {
        let lowered = strip_bracketed(&raw.replace('\u{00a0}', " ").to_lowercase());
        let mut text = lowered
            .chars()
            .filter(|c| !FOOTNOTE_GLYPHS.contains(c))
            .collect::<String>();
        text = self.strip_noise_prefixes(text.trim());

        let filtered = text
            .chars()
            .filter_map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '/') {
                    Some(c)
                } else if c.is_whitespace() {
                    Some(' ')
                } else {
                    None
                }
            })
            .collect::<String>();

        collapse_whitespace(&filtered)
            .trim_matches(EDGE_PUNCTUATION)
            .to_string()
    }

    /// Display form of a raw label: whitespace collapsed, bullets, noise
    /// prefixes and unbalanced edge parentheses removed. Case is preserved.
    pub fn clean_label(&self, raw: &str) -> Option<String> {
        let text = collapse_whitespace(&raw.replace('\u{00a0}', " "));
        let text = text.trim_start_matches(LEADING_BULLETS).trim();
        let text = self.strip_noise_prefixes(text);
        let text = strip_unbalanced_parens(&strip_bracketed(&text));
        let text = collapse_spaced_letters(&collapse_whitespace(&text));
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Indication text with whitespace collapsed and anything from the first
    /// configured cutoff phrase onwards removed.
    pub fn clean_indication(&self, raw: &str) -> String {
        let text = collapse_whitespace(&raw.replace('\u{00a0}', " "));
        // ASCII folding keeps byte offsets aligned with `text`
        let lowered = text.to_ascii_lowercase();
        let cut = self
            .rules
            .indication_cutoffs
            .iter()
            .filter_map(|phrase| find_phrase(&lowered, &phrase.to_ascii_lowercase()))
            .min();
        match cut {
            Some(at) => text[..at].trim_end_matches([' ', ';', ',', '-']).to_string(),
            None => text,
        }
    }

    /// Plausibility check applied after cleaning, from the stop lists and
    /// size limits in the rules.
    pub fn check_plausible(&self, label: &str) -> Result<(), LabelRejection> {
        let key = self.key(label);
        if key.is_empty() {
            return Err(LabelRejection::Empty);
        }
        if self.stop_keys.iter().any(|k| *k == key) {
            return Err(LabelRejection::StopLabel);
        }
        let compact = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>();
        if self.stop_compact_keys.iter().any(|k| *k == compact) {
            return Err(LabelRejection::StopLabel);
        }
        if self.placeholder_keys.iter().any(|k| *k == key) {
            return Err(LabelRejection::Placeholder);
        }
        if label.chars().count() > self.rules.max_label_len {
            return Err(LabelRejection::TooLong);
        }
        let lowered = label.to_lowercase();
        let exempt = self
            .rules
            .max_words_exempt
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()));
        if !exempt && label.split_whitespace().count() > self.rules.max_words {
            return Err(LabelRejection::TooManyWords);
        }
        let corporate = lowered.split(|c: char| !c.is_alphanumeric()).any(|word| {
            self.rules
                .corporate_tokens
                .iter()
                .any(|t| t.eq_ignore_ascii_case(word))
        });
        if corporate {
            return Err(LabelRejection::CorporateToken);
        }
        Ok(())
    }

    fn strip_noise_prefixes(&self, text: &str) -> String {
        let mut out = text.to_string();
        loop {
            let lowered = out.to_lowercase();
            let hit = self
                .rules
                .strip_prefixes
                .iter()
                .find(|p| !p.is_empty() && lowered.starts_with(&p.to_lowercase()));
            match hit {
                Some(prefix) => {
                    // prefixes are matched case-insensitively, byte lengths agree for ASCII prefixes
                    let cut = prefix.len().min(out.len());
                    if !out.is_char_boundary(cut) {
                        return out;
                    }
                    out = out[cut..].trim_start().to_string();
                }
                None => return out,
            }
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NormalizationRules::default())
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes `[...]` footnote references.
fn strip_bracketed(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    for ch in input.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

fn strip_unbalanced_parens(input: &str) -> String {
    let mut s = input.trim().to_string();
    while s.ends_with(')') && s.matches('(').count() < s.matches(')').count() {
        s.pop();
        s = s.trim_end().to_string();
    }
    while s.starts_with('(') && s.matches('(').count() > s.matches(')').count() {
        s.remove(0);
        s = s.trim_start().to_string();
    }
    s
}

/// Rejoins OCR output that spaced a word out letter by letter:
/// `"a c t o r X I a"` becomes `"actorXIa"`. Needs at least six tokens, five
/// or more of them single letters or digits making up 60% of the label.
fn collapse_spaced_letters(input: &str) -> String {
    let tokens = input.split(' ').filter(|t| !t.is_empty()).collect::<Vec<_>>();
    let single = tokens
        .iter()
        .filter(|t| {
            let mut chars = t.chars();
            matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphanumeric())
        })
        .count();
    if tokens.len() >= 6 && single >= 5 && single * 5 >= tokens.len() * 3 {
        tokens.concat()
    } else {
        input.to_string()
    }
}

/// Byte offset of the first occurrence of `phrase` bounded by non-word characters.
fn find_phrase(haystack: &str, phrase: &str) -> Option<usize> {
    if phrase.is_empty() {
        return None;
    }
    haystack.match_indices(phrase).map(|(at, _)| at).find(|&at| {
        let before = haystack[..at].chars().next_back();
        let after = haystack[at + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Secondary names carried in a trailing parenthetical:
/// `"RYBREVANT (amivantamab)"` yields `["amivantamab", "RYBREVANT"]`.
pub fn parenthetical_aliases(label: &str) -> Vec<String> {
    let trimmed = label.trim();
    let (Some(open), true) = (trimmed.find('('), trimmed.ends_with(')')) else {
        return Vec::new();
    };
    let outer = trimmed[..open].trim();
    let inner = &trimmed[open + 1..trimmed.len() - 1];

    let mut out = inner
        .split([';', '/', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if !outer.is_empty() {
        out.push(outer.to_string());
    }
    out
}

/// True when `needle`'s tokens appear contiguously in `haystack`'s tokens.
/// Both sides are expected to be normalized keys.
pub fn contains_tokens(haystack: &str, needle: &str) -> bool {
    let hay = haystack.split(' ').collect::<Vec<_>>();
    let pin = needle.split(' ').collect::<Vec<_>>();
    if pin.is_empty() || pin.len() > hay.len() || needle.is_empty() {
        return false;
    }
    hay.windows(pin.len()).any(|w| w == pin.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_case_folds_and_strips_punctuation() {
        let n = Normalizer::default();
        assert_eq!(n.key("DARZALEX (daratumumab)"), "darzalex daratumumab");
        assert_eq!(n.key("RYBREVANT"), "rybrevant");
        assert_eq!(n.key("Rybrevant "), "rybrevant");
        assert_eq!(n.key("(amivantamab)"), "amivantamab");
        assert_eq!(n.key("mRNA-4203"), "mrna-4203");
        assert_eq!(n.key("TALVEY + TECVAYLI"), "talvey + tecvayli");
    }

    #[test]
    fn key_drops_footnotes_and_trailing_punctuation() {
        let n = Normalizer::default();
        assert_eq!(n.key("RYBREVANT[1]"), "rybrevant");
        assert_eq!(n.key("RYBREVANT†"), "rybrevant");
        assert_eq!(n.key("RYBREVANT*."), "rybrevant");
        assert_eq!(n.key("IMA402 /"), "ima402");
        assert_eq!(n.key("  JNJ-1900\u{00a0}\u{00a0}(NBTXR3)  "), "jnj-1900 nbtxr3");
    }

    #[test]
    fn key_strips_configured_noise_prefixes() {
        let n = Normalizer::default();
        assert_eq!(n.key("system) RYBREVANT"), "rybrevant");
        assert_eq!(n.key("Platform) IMA203"), "ima203");
    }

    #[test]
    fn key_of_pure_noise_is_empty() {
        let n = Normalizer::default();
        assert_eq!(n.key("[a]"), "");
        assert_eq!(n.key(" † * "), "");
        assert_eq!(n.key("()"), "");
    }

    #[test]
    fn clean_label_preserves_case() {
        let n = Normalizer::default();
        assert_eq!(n.clean_label("  RYBREVANT  ").as_deref(), Some("RYBREVANT"));
        assert_eq!(n.clean_label("• TECVAYLI").as_deref(), Some("TECVAYLI"));
        assert_eq!(n.clean_label("system) RYBREVANT").as_deref(), Some("RYBREVANT"));
        assert_eq!(n.clean_label("autoleucel)").as_deref(), Some("autoleucel"));
        assert_eq!(n.clean_label("   "), None);
    }

    #[test]
    fn plausibility_rejects_headers_and_placeholders() {
        let n = Normalizer::default();
        assert_eq!(n.check_plausible("Indications"), Err(LabelRejection::StopLabel));
        assert_eq!(n.check_plausible("Undisclosed"), Err(LabelRejection::Placeholder));
        assert_eq!(
            n.check_plausible("one two three four five six seven"),
            Err(LabelRejection::TooManyWords)
        );
        assert_eq!(n.check_plausible("†"), Err(LabelRejection::Empty));
        assert!(n.check_plausible("RYBREVANT").is_ok());
    }

    #[test]
    fn corporate_names_are_not_assets() {
        let n = Normalizer::default();
        assert_eq!(
            n.check_plausible("Immatics Biosciences"),
            Err(LabelRejection::CorporateToken)
        );
        assert_eq!(n.check_plausible("Bayer AG"), Err(LabelRejection::CorporateToken));
        assert_eq!(
            n.check_plausible("Legend Biotech, Inc."),
            Err(LabelRejection::CorporateToken)
        );
        // token match only
        assert!(n.check_plausible("AGEN1181").is_ok());
        assert!(n.check_plausible("pharmakon-1").is_ok());
    }

    #[test]
    fn spaced_out_ocr_labels_are_rejoined_then_stopped() {
        let n = Normalizer::default();
        let cleaned = n.clean_label("a c t o r X I a").expect("label");
        assert_eq!(cleaned, "actorXIa");
        assert_eq!(n.check_plausible(&cleaned), Err(LabelRejection::StopLabel));
        assert_eq!(n.check_plausible("Factor XIa"), Err(LabelRejection::StopLabel));
        assert_eq!(
            n.clean_label("JNJ 2113 (icotrokinra)").as_deref(),
            Some("JNJ 2113 (icotrokinra)")
        );
    }

    #[test]
    fn jnj_codes_are_exempt_from_word_limit() {
        let n = Normalizer::default();
        let label = "JNJ-4804 co-antibody therapy with two bispecific arms";
        assert!(label.split_whitespace().count() > n.rules().max_words);
        assert!(n.check_plausible(label).is_ok());
    }

    #[test]
    fn indication_footer_leakage_is_cut() {
        let n = Normalizer::default();
        assert_eq!(
            n.clean_indication(
                "Non-small cell lung cancer; Inclusion in this pipeline does not imply approval"
            ),
            "Non-small cell lung cancer"
        );
        assert_eq!(
            n.clean_indication("Multiple myeloma -  To the best of the Company's knowledge, ..."),
            "Multiple myeloma"
        );
        assert_eq!(n.clean_indication("  Solid   tumors "), "Solid tumors");
        // whole words only
        assert_eq!(
            n.clean_indication("AML with noninclusion of CNS disease"),
            "AML with noninclusion of CNS disease"
        );
    }

    #[test]
    fn cutoffs_come_from_the_rules() {
        let rules = NormalizationRules {
            indication_cutoffs: vec!["see footnote".to_string()],
            ..NormalizationRules::default()
        };
        let n = Normalizer::new(rules);
        assert_eq!(n.clean_indication("AML, see footnote 4"), "AML");
        assert_eq!(
            n.clean_indication("AML through clinical trials"),
            "AML through clinical trials"
        );
    }

    #[test]
    fn parenthetical_aliases_split_inner_terms() {
        assert_eq!(
            parenthetical_aliases("RYBREVANT (amivantamab)"),
            vec!["amivantamab".to_string(), "RYBREVANT".to_string()]
        );
        assert_eq!(
            parenthetical_aliases("anzu-cel (anzutresgene autoleucel; IMA203)"),
            vec![
                "anzutresgene autoleucel".to_string(),
                "IMA203".to_string(),
                "anzu-cel".to_string()
            ]
        );
        assert!(parenthetical_aliases("TECVAYLI").is_empty());
    }

    #[test]
    fn token_containment_respects_boundaries() {
        assert!(contains_tokens("actengine ima203", "ima203"));
        assert!(contains_tokens("ima402 + ici", "ima402"));
        assert!(!contains_tokens("ima2030", "ima203"));
        assert!(!contains_tokens("ima203", "actengine ima203"));
        assert!(!contains_tokens("ima203", ""));
    }
}
