//! Deterministic rule cascade from (request, indexed images) to an operation
//!
//! Rules are evaluated top to bottom and the first match wins:
//!
//! 1. capability question → clarification with a capability summary
//! 2. hold/stop → clarification with an empty reason
//! 3. empty prompt with uploads → style transfer of the first upload
//! 4. style vocabulary only, no uploads → style transfer of the default base
//! 5. style and structural edit vocabulary → edit, then stylize
//! 6. structural edit vocabulary → edit
//! 7. nothing to edit and new imagery requested → generate
//! 8. anything else → contextual edit, marked advisory
//!
//! Outcomes of rules 3–8 other than Generate pass through the ambiguity
//! override, which turns noise or unresolvable context into a clarification.

use super::descriptor::{OperationDescriptor, OperationKind, ResolutionRule};
use super::indexer::{ImageIndex, IndexedImage, SourceKind};
use super::references::{
    extract_named_images, extract_recolor_targets, is_insertion, NamedImage, RecolorTargets,
};
use super::vocabulary::{self as vocab, contains_any};
use super::ResolveError;
use crate::protocol::messages::ImageTaskRequest;

pub const GENERIC_EDIT_INSTRUCTION: &str = "Improve this image";
pub const GENERIC_STYLE_INSTRUCTION: &str = "Apply the requested style";
pub const PRESERVE_SUBJECT_SENTENCE: &str = "Keep the subject, foreground, faces, hands, clothing and held items unchanged; change only the requested part.";

/// Everything the cascade reads from the prompt, computed once
#[derive(Debug, Clone)]
pub struct Signals {
    pub prompt: String,
    pub text: String,
    pub empty: bool,
    pub well_formed: bool,
    pub korean: bool,
    pub capability: bool,
    pub hold: bool,
    pub style: bool,
    pub structural_edit: bool,
    pub generate: bool,
    pub vague: bool,
    pub context_reference: bool,
    pub insertion: bool,
    pub background: bool,
    pub recolor: RecolorTargets,
    pub named: Vec<NamedImage>,
}

impl Signals {
    pub fn extract(prompt: &str, index: &ImageIndex) -> Result<Self, ResolveError> {
        let prompt = prompt.trim().to_string();
        let text = vocab::normalize(&prompt);
        let recolor = extract_recolor_targets(&text);
        let named = extract_named_images(&text, index)?;

        Ok(Self {
            empty: text.is_empty(),
            well_formed: vocab::is_well_formed(&text),
            korean: vocab::is_korean(&text),
            capability: contains_any(&text, vocab::CAPABILITY)
                || vocab::CAPABILITY_EXACT.contains(&text.as_str()),
            hold: contains_any(&text, vocab::HOLD_STOP),
            style: contains_any(&text, vocab::STYLE),
            structural_edit: contains_any(&text, vocab::STRUCTURAL_EDIT),
            generate: contains_any(&text, vocab::GENERATE),
            vague: contains_any(&text, vocab::VAGUE),
            context_reference: contains_any(&text, vocab::UNRESOLVABLE_CONTEXT),
            insertion: is_insertion(&text),
            background: contains_any(&text, vocab::BACKGROUND),
            recolor,
            named,
            prompt,
            text,
        })
    }

    /// Structural edit vocabulary or a recolor phrase
    pub fn edit(&self) -> bool {
        self.structural_edit || !self.recolor.is_empty()
    }
}

/// Resolve a request into an operation descriptor.
///
/// Only structurally invalid explicit references (`upload#9` past the end,
/// `foo#1`) are errors; every other failure to decide is a clarification.
pub fn resolve(
    request: &ImageTaskRequest,
    index: &ImageIndex,
) -> Result<OperationDescriptor, ResolveError> {
    let signals = Signals::extract(&request.prompt, index)?;
    Ok(resolve_with_signals(index, &signals))
}

pub fn resolve_with_signals(index: &ImageIndex, signals: &Signals) -> OperationDescriptor {
    if signals.capability {
        return OperationDescriptor::clarify(
            ResolutionRule::Capability,
            capability_summary(signals.korean),
        );
    }
    if signals.hold {
        return OperationDescriptor::clarify(ResolutionRule::HoldStop, "");
    }

    let candidate = cascade(index, signals);
    if candidate.kind == Some(OperationKind::Generate) {
        return candidate;
    }

    match ambiguity_reason(index, signals, candidate.rule) {
        Some(reason) => OperationDescriptor::clarify(ResolutionRule::Ambiguous, reason),
        None => candidate,
    }
}

fn cascade(index: &ImageIndex, signals: &Signals) -> OperationDescriptor {
    let has_images = !index.is_empty();
    // with nothing to edit, generate vocabulary means style/edit words describe the new image
    let fresh_generate = !has_images && signals.generate;

    if signals.empty {
        if let Some(first) = index.uploads().first() {
            return OperationDescriptor::on_image(
                OperationKind::StyleTransfer,
                first.clone(),
                Vec::new(),
                GENERIC_STYLE_INSTRUCTION,
                true,
                ResolutionRule::UploadsOnly,
            );
        }
    }

    if !fresh_generate {
        if !index.has_uploads() && signals.style && !signals.edit() {
            return on_existing_image(
                OperationKind::StyleTransfer,
                true,
                ResolutionRule::StyleOnly,
                index,
                signals,
                None,
            );
        }
        if signals.style && signals.edit() {
            return on_existing_image(
                OperationKind::Edit,
                true,
                ResolutionRule::Mixed,
                index,
                signals,
                None,
            );
        }
        if signals.edit() {
            return on_existing_image(
                OperationKind::Edit,
                false,
                ResolutionRule::Edit,
                index,
                signals,
                None,
            );
        }
    }

    if !has_images
        && !signals.empty
        && signals.well_formed
        && (signals.generate || (!signals.edit() && !signals.style))
    {
        return OperationDescriptor::generate(signals.prompt.clone(), ResolutionRule::Generate);
    }

    on_existing_image(
        OperationKind::Edit,
        signals.style,
        ResolutionRule::Fallback,
        index,
        signals,
        None,
    )
    .with_advisory()
}

/// Build a descriptor for `kind` using the deterministic base/reference policy.
///
/// `instruction` overrides the synthesised instruction text.
pub fn descriptor_for_kind(
    kind: OperationKind,
    rule: ResolutionRule,
    index: &ImageIndex,
    signals: &Signals,
    instruction: Option<&str>,
) -> OperationDescriptor {
    match kind {
        OperationKind::Generate => {
            let text = instruction
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(&signals.prompt);
            if text.is_empty() {
                OperationDescriptor::clarify(
                    ResolutionRule::Ambiguous,
                    ambiguous_request_reason(signals.korean),
                )
            } else {
                OperationDescriptor::generate(text, rule)
            }
        }
        OperationKind::Edit => {
            on_existing_image(kind, signals.style, rule, index, signals, instruction)
        }
        OperationKind::StyleTransfer => {
            on_existing_image(kind, true, rule, index, signals, instruction)
        }
    }
}

fn on_existing_image(
    kind: OperationKind,
    apply_style_transfer: bool,
    rule: ResolutionRule,
    index: &ImageIndex,
    signals: &Signals,
    instruction: Option<&str>,
) -> OperationDescriptor {
    let Some((base, references)) = select_images(index, signals) else {
        return OperationDescriptor::clarify(rule, missing_image_reason(signals.korean));
    };

    let (instruction_text, low_confidence) = match instruction.map(str::trim) {
        Some(text) if !text.is_empty() => (text.to_string(), false),
        _ => instruction_for(kind, signals),
    };

    let descriptor = OperationDescriptor::on_image(
        kind,
        base,
        references,
        instruction_text,
        apply_style_transfer,
        rule,
    );
    if low_confidence {
        descriptor.with_low_confidence()
    } else {
        descriptor
    }
}

/// Choose the base image and ordered references.
///
/// Returns `None` when there is nothing to operate on.
pub fn select_images(
    index: &ImageIndex,
    signals: &Signals,
) -> Option<(IndexedImage, Vec<IndexedImage>)> {
    let named: Vec<&IndexedImage> = signals.named.iter().map(|n| &n.image).collect();

    // "insert this into what you made": the latest AI result hosts the uploads,
    // but only when the prompt actually points at that result
    if signals.insertion && index.has_uploads() {
        if let Some(latest_ai) = index.latest_ai() {
            let names_result = signals
                .named
                .iter()
                .any(|n| n.via_ai_phrase || n.image.key() == latest_ai.key());
            let only_uploads_or_result = named
                .iter()
                .all(|img| img.source_kind == SourceKind::Upload || img.key() == latest_ai.key());
            if names_result && only_uploads_or_result {
                let mut references: Vec<IndexedImage> = index.uploads().to_vec();
                references.extend(named.iter().map(|img| (*img).clone()));
                return Some((latest_ai.clone(), references));
            }
        }
    }

    if let Some((first, rest)) = named.split_first() {
        if signals.insertion {
            if let Some((last, earlier)) = named.split_last() {
                return Some((
                    (*last).clone(),
                    earlier.iter().map(|img| (*img).clone()).collect(),
                ));
            }
        }
        return Some((
            (*first).clone(),
            rest.iter().map(|img| (*img).clone()).collect(),
        ));
    }

    if let Some((first, rest)) = index.uploads().split_first() {
        return Some((first.clone(), rest.to_vec()));
    }

    index
        .latest_user()
        .or_else(|| index.latest_ai())
        .map(|image| (image.clone(), Vec::new()))
}

/// Instruction text for an operation when no override is supplied.
///
/// The boolean marks the generic low-confidence fallback.
fn instruction_for(kind: OperationKind, signals: &Signals) -> (String, bool) {
    match kind {
        OperationKind::Generate => (signals.prompt.clone(), false),
        OperationKind::StyleTransfer => {
            if signals.empty {
                (GENERIC_STYLE_INSTRUCTION.to_string(), false)
            } else {
                (signals.prompt.clone(), false)
            }
        }
        OperationKind::Edit => {
            if signals.structural_edit && !signals.empty {
                if signals.background {
                    return (
                        format!("{} {PRESERVE_SUBJECT_SENTENCE}", signals.prompt),
                        false,
                    );
                }
                return (signals.prompt.clone(), false);
            }
            if let Some(synthesized) = signals.recolor.synthesize() {
                return (synthesized, false);
            }
            if !signals.empty {
                return (signals.prompt.clone(), false);
            }
            (GENERIC_EDIT_INSTRUCTION.to_string(), true)
        }
    }
}

fn ambiguity_reason(
    index: &ImageIndex,
    signals: &Signals,
    rule: ResolutionRule,
) -> Option<String> {
    if !signals.empty && !signals.well_formed {
        return Some(unreadable_prompt_reason(signals.korean));
    }
    if signals.context_reference && signals.named.is_empty() && index.chat().is_empty() {
        return Some(unresolvable_context_reason(signals.korean));
    }
    if signals.vague && rule == ResolutionRule::Fallback {
        return Some(ambiguous_request_reason(signals.korean));
    }
    None
}

struct Clarification<'a> {
    missing: &'a str,
    options: &'a [&'a str],
    default: &'a str,
    example: &'a str,
}

impl Clarification<'_> {
    fn render(&self, korean: bool) -> String {
        let (lead, default_label, example_label) = if korean {
            ("다음 중 하나를 알려주세요:", "잘 모르겠다면", "예시 답변:")
        } else {
            ("You could:", "If you're not sure,", "For example:")
        };
        let options = self
            .options
            .iter()
            .enumerate()
            .map(|(i, option)| format!("{}. {option}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\n{lead}\n{options}\n{default_label} {}\n{example_label} \"{}\"",
            self.missing, self.default, self.example
        )
    }
}

pub fn capability_summary(korean: bool) -> String {
    if korean {
        "설명만으로 새 이미지를 생성하고, 업로드하거나 이전에 만든 이미지를 편집(객체 추가·교체·삭제, 색상 변경, 배경 변경)하며, 수채화·애니메이션·고흐 풍 같은 스타일로 바꿀 수 있어요. 이미지를 올리거나 원하는 장면을 설명해 주세요.".to_string()
    } else {
        "I can generate new images from a description, edit an uploaded or earlier image (add, replace, remove or recolor objects, change the background), and restyle an image, for example as a watercolor, anime or Van Gogh painting. Upload an image or describe what you'd like to see.".to_string()
    }
}

fn missing_image_reason(korean: bool) -> String {
    if korean {
        Clarification {
            missing: "작업할 이미지를 찾지 못했어요.",
            options: &[
                "바꾸고 싶은 이미지를 업로드하기",
                "이전 이미지를 지칭하기 (예: \"두 번째 이미지\", \"방금 만든 이미지\")",
                "새 이미지를 그려 달라고 요청하기 (예: \"고양이를 그려줘\")",
            ],
            default: "설명하신 내용으로 새 이미지를 만들어 드릴 수 있어요.",
            example: "방금 올린 사진의 배경을 바다로 바꿔줘",
        }
        .render(true)
    } else {
        Clarification {
            missing: "I couldn't find an image to work on.",
            options: &[
                "Upload the image you want to change",
                "Point to an earlier image, e.g. \"the second image\" or \"the one you just made\"",
                "Ask for a brand new image instead, e.g. \"draw a cat on a beach\"",
            ],
            default: "I can create a new image from your description.",
            example: "Use the photo I just uploaded and make the background a beach",
        }
        .render(false)
    }
}

fn unreadable_prompt_reason(korean: bool) -> String {
    if korean {
        Clarification {
            missing: "요청 내용을 이해하지 못했어요. 어떤 작업을 원하시는지 문장으로 알려주세요.",
            options: &[
                "새 이미지 생성 (무엇을 그릴지 설명)",
                "기존 이미지 편집 (무엇을 어떻게 바꿀지)",
                "스타일 변환 (원하는 화풍)",
                "궁금한 기능 질문하기",
            ],
            default: "마지막 이미지를 그대로 두고 다시 요청을 기다릴게요.",
            example: "마지막 이미지를 수채화 느낌으로 바꿔줘",
        }
        .render(true)
    } else {
        Clarification {
            missing: "I couldn't read a request in that message. Please describe what you'd like in words.",
            options: &[
                "Generate a new image (describe what to draw)",
                "Edit an existing image (say what to change and how)",
                "Restyle an image (name the style)",
                "Ask what I can do",
            ],
            default: "I'll leave your images unchanged until you tell me more.",
            example: "Make the last image look like a watercolor painting",
        }
        .render(false)
    }
}

fn unresolvable_context_reason(korean: bool) -> String {
    if korean {
        Clarification {
            missing: "말씀하신 이전 내용을 대화에서 찾을 수 없어요.",
            options: &[
                "해당 이미지를 다시 업로드하기",
                "원하는 내용을 처음부터 다시 설명하기",
                "새 이미지를 그려 달라고 요청하기",
            ],
            default: "설명해 주신 내용으로 새 이미지를 만들어 드릴 수 있어요.",
            example: "이 사진 속 강아지를 빨간 모자를 쓴 모습으로 바꿔줘",
        }
        .render(true)
    } else {
        Clarification {
            missing: "I can't find the earlier content you're referring to in this conversation.",
            options: &[
                "Upload that image again",
                "Describe what you want from scratch",
                "Ask for a new image instead",
            ],
            default: "I can create a new image from a fresh description.",
            example: "Put a red hat on the dog in this photo",
        }
        .render(false)
    }
}

pub fn ambiguous_request_reason(korean: bool) -> String {
    if korean {
        Clarification {
            missing: "어떤 변경을 원하시는지 조금 더 구체적으로 알려주세요.",
            options: &[
                "바꿀 대상과 방식 (예: \"하늘을 노을 색으로\")",
                "원하는 스타일 (예: \"지브리 풍으로\")",
                "추가하거나 지울 물체",
                "새 이미지로 생성",
            ],
            default: "현재 이미지의 색감과 선명도를 살짝 개선해 드릴 수 있어요.",
            example: "두 번째 이미지의 배경을 눈 오는 숲으로 바꿔줘",
        }
        .render(true)
    } else {
        Clarification {
            missing: "I need a little more detail about the change you want.",
            options: &[
                "What to change and how, e.g. \"make the sky a sunset\"",
                "A style to apply, e.g. \"in Ghibli style\"",
                "An object to add or remove",
                "A brand new image instead",
            ],
            default: "I can gently improve the colors and sharpness of the current image.",
            example: "Change the background of the second image to a snowy forest",
        }
        .render(false)
    }
}
