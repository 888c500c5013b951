//! The resolver's output: one unambiguous operation, or a clarification

use super::indexer::IndexedImage;
use serde::Serialize;
use std::fmt;

const MAX_DESCRIPTION_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Generate,
    Edit,
    StyleTransfer,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Generate => write!(f, "generate"),
            OperationKind::Edit => write!(f, "edit"),
            OperationKind::StyleTransfer => write!(f, "style_transfer"),
        }
    }
}

/// Which step of the rule cascade produced a descriptor
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    Capability,
    HoldStop,
    UploadsOnly,
    StyleOnly,
    Mixed,
    Edit,
    Generate,
    Fallback,
    Ambiguous,
    Classifier,
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionRule::Capability => "capability",
            ResolutionRule::HoldStop => "hold_stop",
            ResolutionRule::UploadsOnly => "uploads_only",
            ResolutionRule::StyleOnly => "style_only",
            ResolutionRule::Mixed => "mixed",
            ResolutionRule::Edit => "edit",
            ResolutionRule::Generate => "generate",
            ResolutionRule::Fallback => "fallback",
            ResolutionRule::Ambiguous => "ambiguous",
            ResolutionRule::Classifier => "classifier",
        };
        write!(f, "{name}")
    }
}

/// Structured decision for one request.
///
/// When `needs_clarification` is set every execution field is advisory and
/// the operation must not be executed. `base` never appears in `references`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    pub kind: Option<OperationKind>,
    pub base: Option<IndexedImage>,
    pub references: Vec<IndexedImage>,
    pub instruction_text: String,
    pub apply_style_transfer: bool,
    pub result_description: String,
    pub needs_clarification: bool,
    pub clarification_reason: String,
    /// Instruction fell back to a generic edit
    pub low_confidence: bool,
    pub rule: ResolutionRule,
    /// Produced by the contextual fallback rule rather than a keyword rule
    pub advisory: bool,
}

impl OperationDescriptor {
    pub fn clarify(rule: ResolutionRule, reason: impl Into<String>) -> Self {
        Self {
            kind: None,
            base: None,
            references: Vec::new(),
            instruction_text: String::new(),
            apply_style_transfer: false,
            result_description: String::new(),
            needs_clarification: true,
            clarification_reason: reason.into(),
            low_confidence: false,
            rule,
            advisory: false,
        }
    }

    pub fn generate(instruction: impl Into<String>, rule: ResolutionRule) -> Self {
        let instruction_text = instruction.into();
        Self {
            kind: Some(OperationKind::Generate),
            base: None,
            references: Vec::new(),
            result_description: describe(&instruction_text),
            instruction_text,
            apply_style_transfer: false,
            needs_clarification: false,
            clarification_reason: String::new(),
            low_confidence: false,
            rule,
            advisory: false,
        }
    }

    /// An operation on an existing image. References equal to the base are dropped.
    pub fn on_image(
        kind: OperationKind,
        base: IndexedImage,
        references: Vec<IndexedImage>,
        instruction: impl Into<String>,
        apply_style_transfer: bool,
        rule: ResolutionRule,
    ) -> Self {
        let base_key = base.key();
        let mut kept: Vec<IndexedImage> = Vec::new();
        for reference in references {
            if reference.key() != base_key && !kept.iter().any(|k| k.key() == reference.key()) {
                kept.push(reference);
            }
        }
        let instruction_text = instruction.into();

        Self {
            kind: Some(kind),
            base: Some(base),
            references: kept,
            result_description: describe(&instruction_text),
            instruction_text,
            apply_style_transfer,
            needs_clarification: false,
            clarification_reason: String::new(),
            low_confidence: false,
            rule,
            advisory: false,
        }
    }

    pub fn with_low_confidence(mut self) -> Self {
        self.low_confidence = true;
        self
    }

    pub fn with_advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    pub fn is_executable(&self) -> bool {
        !self.needs_clarification && self.kind.is_some()
    }

    /// Label for logs: the kind, or "clarify"
    pub fn outcome_label(&self) -> String {
        match (self.needs_clarification, self.kind) {
            (true, _) | (false, None) => "clarify".to_string(),
            (false, Some(kind)) => kind.to_string(),
        }
    }
}

/// One-line description of a result, bounded to 80 characters
pub fn describe(instruction: &str) -> String {
    let line = instruction
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();

    if line.chars().count() <= MAX_DESCRIPTION_CHARS {
        return line.to_string();
    }
    let mut truncated: String = line.chars().take(MAX_DESCRIPTION_CHARS - 1).collect();
    truncated = truncated.trim_end().to_string();
    truncated.push('…');
    truncated
}
