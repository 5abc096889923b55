//! Prompt-injection guard applied to work item text at intake and patch.
//!
//! A fixed set of case-insensitive patterns is compiled once per guard.
//! Matches are reported per field; what happens next depends on the
//! configured [`GuardMode`].

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// What the guard does with a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    /// Reject the write.
    Block,
    /// Record the match and let the write through.
    Warn,
    /// Do not scan.
    Off,
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Off => "off",
        };
        f.write_str(s)
    }
}

impl FromStr for GuardMode {
    type Err = GuardModeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "warn" => Ok(Self::Warn),
            "off" => Ok(Self::Off),
            other => Err(GuardModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GuardMode`] string.
#[derive(Debug, Clone)]
pub struct GuardModeParseError(pub String);

impl fmt::Display for GuardModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid prompt injection mode: {:?} (expected block, warn or off)",
            self.0
        )
    }
}

impl std::error::Error for GuardModeParseError {}

/// Named patterns scanned by default.
pub const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (
        "ignore-previous-instructions",
        r"\b(ignore|disregard|forget)\s+(all\s+|any\s+)?(the\s+|your\s+)?(previous|prior|above|earlier|preceding)\s+(instructions|prompts|directions|rules|messages)",
    ),
    (
        "reveal-system-prompt",
        r"\b(reveal|show|print|output|leak|repeat|dump)\s+(me\s+)?((your|the)\s+)?(system|hidden|initial|original)\s+(prompt|instructions|message)",
    ),
    (
        "role-override",
        r"\byou\s+are\s+now\s+(in\s+)?(developer|dan|jailbreak|god|unrestricted)\s+mode",
    ),
    ("do-anything-now", r"\bdo\s+anything\s+now\b"),
    ("role-tag", r"</?\s*(system|assistant|im_start|im_end)\s*>"),
    (
        "override-safety",
        r"\b(override|bypass|disable)\s+(your|the|all)\s+(safety|security|content)\s+(rules|guidelines|settings|policies|filters)",
    ),
    (
        "exfiltrate-secrets",
        r"\b(exfiltrate|leak)\s+[^\n]{0,40}(api[_\s-]?keys?|secrets?|tokens?|credentials?|passwords?)",
    ),
];

/// Longest excerpt kept from a match.
const EXCERPT_LIMIT: usize = 80;

/// One pattern match in one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFinding {
    pub field: String,
    pub pattern: String,
    pub excerpt: String,
}

/// Outcome of screening a set of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Clean,
    Warned(Vec<GuardFinding>),
    Blocked(Vec<GuardFinding>),
}

impl GuardVerdict {
    /// Findings carried by the verdict, if any.
    pub fn findings(&self) -> &[GuardFinding] {
        match self {
            Self::Clean => &[],
            Self::Warned(f) | Self::Blocked(f) => f,
        }
    }
}

/// Compiled prompt-injection patterns plus the active mode.
pub struct PromptGuard {
    mode: GuardMode,
    patterns: Vec<(Regex, String)>,
}

impl fmt::Debug for PromptGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptGuard")
            .field("mode", &self.mode)
            .field(
                "patterns",
                &self.patterns.iter().map(|(_, name)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PromptGuard {
    /// Guard with [`DEFAULT_PATTERNS`].
    pub fn new(mode: GuardMode) -> Result<Self> {
        Self::with_patterns(mode, DEFAULT_PATTERNS)
    }

    /// Guard with an explicit `(name, regex)` list.
    pub fn with_patterns(mode: GuardMode, patterns: &[(&str, &str)]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for (name, pattern) in patterns {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid prompt guard pattern {name}"))?;
            compiled.push((regex, (*name).to_string()));
        }
        Ok(Self {
            mode,
            patterns: compiled,
        })
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Scan one field regardless of mode.
    pub fn scan(&self, field: &str, text: &str) -> Vec<GuardFinding> {
        self.patterns
            .iter()
            .filter_map(|(regex, name)| {
                regex.find(text).map(|m| GuardFinding {
                    field: field.to_string(),
                    pattern: name.clone(),
                    excerpt: excerpt(m.as_str()),
                })
            })
            .collect()
    }

    /// Screen `(field, text)` pairs under the active mode.
    pub fn evaluate(&self, fields: &[(&str, &str)]) -> GuardVerdict {
        if self.mode == GuardMode::Off {
            return GuardVerdict::Clean;
        }
        let findings: Vec<GuardFinding> = fields
            .iter()
            .flat_map(|(field, text)| self.scan(field, text))
            .collect();
        match (findings.is_empty(), self.mode) {
            (true, _) => GuardVerdict::Clean,
            (false, GuardMode::Block) => GuardVerdict::Blocked(findings),
            (false, _) => GuardVerdict::Warned(findings),
        }
    }
}

fn excerpt(matched: &str) -> String {
    if matched.chars().count() <= EXCERPT_LIMIT {
        matched.to_string()
    } else {
        let cut: String = matched.chars().take(EXCERPT_LIMIT).collect();
        format!("{cut}...")
    }
}

/// Unique pattern names in first-seen order.
pub fn pattern_names(findings: &[GuardFinding]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for finding in findings {
        if !names.contains(&finding.pattern) {
            names.push(finding.pattern.clone());
        }
    }
    names
}
