//! Extraction of explicit image references and recolor targets from a prompt
//!
//! References are reported in the order the prompt names them. Positions are
//! byte offsets into the normalised prompt.

use super::indexer::{ImageIndex, IndexedImage, SourceKind};
use super::vocabulary::{self, AI_RESULT, COLORS, INSERTION_TARGETS, INSERTION_VERBS, UPLOAD_DEICTIC};
use super::ResolveError;
use once_cell::sync::Lazy;
use regex::Regex;

static SOURCE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-z_]+)#(\d+)\b").expect("source token pattern is valid"));

static ORDINAL_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(first|second|third|fourth|fifth|sixth|seventh|eighth|ninth|tenth|1st|2nd|3rd|4th|5th|last|latest|previous|most recent)\b(?:\s+[a-z]+){0,2}?\s+(images?|pictures?|photos?|pics?|one)\b",
    )
    .expect("english ordinal pattern is valid")
});

static ORDINAL_KO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(첫|두|세|네|다섯|여섯|일곱|여덟|아홉|열)\s*번째\s*(?:\S+\s+)?(이미지|사진|그림)|(마지막|최근)\s*(이미지|사진|그림)")
        .expect("korean ordinal pattern is valid")
});

static RECOLOR_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:make|turn|paint|color|colour|change)\s+(?:the\s+|his\s+|her\s+|its\s+|their\s+)?([a-z]+(?:\s+[a-z]+)?)\s+(?:to\s+|into\s+)?(red|orange|yellow|green|blue|purple|violet|pink|black|white|gray|grey|brown|gold|silver|navy|beige)\b",
    )
    .expect("recolor pattern is valid")
});

static RECOLOR_KO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\S+?)(?:을|를|은|는|이|가)\s*(빨간|빨강|주황|노란|노랑|초록|파란|파랑|보라|분홍|검은|검정|흰|하얀|회색|갈색|금색|은색|남색)\s*(?:색|색깔)?\s*(?:으로|로)")
        .expect("korean recolor pattern is valid")
});

/// An image named by the prompt, with the offset where it was named
#[derive(Debug, Clone, PartialEq)]
pub struct NamedImage {
    pub position: usize,
    pub image: IndexedImage,
    /// Named through an "AI result" phrase rather than an index
    pub via_ai_phrase: bool,
}

/// Extract every image the prompt names explicitly, in prompt order, without duplicates.
///
/// `upload#N`/`chat#N` tokens that point outside the index, or use an
/// unknown source, are hard validation errors.
pub fn extract_named_images(
    text: &str,
    index: &ImageIndex,
) -> Result<Vec<NamedImage>, ResolveError> {
    let mut named = Vec::new();

    for caps in SOURCE_TOKEN.captures_iter(text) {
        let (Some(whole), Some(source), Some(number)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let kind = match source.as_str() {
            "upload" | "uploads" => SourceKind::Upload,
            "chat" => SourceKind::Chat,
            other => {
                return Err(ResolveError::UnknownSource {
                    token: format!("{other}#{}", number.as_str()),
                })
            }
        };
        let position: usize = number.as_str().parse().map_err(|_| ResolveError::IndexOutOfRange {
            kind,
            index: usize::MAX,
            available: index.len_of(kind),
        })?;
        let image = index
            .get(kind, position)
            .ok_or(ResolveError::IndexOutOfRange {
                kind,
                index: position,
                available: index.len_of(kind),
            })?;
        named.push(NamedImage {
            position: whole.start(),
            image: image.clone(),
            via_ai_phrase: false,
        });
    }

    for caps in ORDINAL_EN.captures_iter(text) {
        let (Some(whole), Some(ordinal)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Some(image) = chat_by_ordinal(index, ordinal.as_str()) {
            named.push(NamedImage {
                position: whole.start(),
                image: image.clone(),
                via_ai_phrase: false,
            });
        }
    }

    for caps in ORDINAL_KO.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let ordinal = caps
            .get(1)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if let Some(image) = chat_by_ordinal(index, ordinal) {
            named.push(NamedImage {
                position: whole.start(),
                image: image.clone(),
                via_ai_phrase: false,
            });
        }
    }

    if let Some(position) = first_keyword(text, AI_RESULT) {
        if let Some(image) = index.latest_ai() {
            named.push(NamedImage {
                position,
                image: image.clone(),
                via_ai_phrase: true,
            });
        }
    }

    if let Some(position) = first_keyword(text, UPLOAD_DEICTIC) {
        for image in index.uploads() {
            named.push(NamedImage {
                position,
                image: image.clone(),
                via_ai_phrase: false,
            });
        }
    }

    // stable sort keeps upload order for a shared deictic position
    named.sort_by_key(|n| n.position);
    let mut seen = Vec::new();
    named.retain(|n| {
        let key = n.image.key();
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });

    Ok(named)
}

fn first_keyword(text: &str, keywords: &[&str]) -> Option<usize> {
    keywords
        .iter()
        .filter_map(|kw| vocabulary::find_keyword(text, kw))
        .min()
}

/// Resolve an ordinal against chat images ordered oldest-first
fn chat_by_ordinal<'a>(index: &'a ImageIndex, ordinal: &str) -> Option<&'a IndexedImage> {
    let nth = match ordinal {
        "first" | "1st" | "첫" => 1,
        "second" | "2nd" | "두" => 2,
        "third" | "3rd" | "세" => 3,
        "fourth" | "4th" | "네" => 4,
        "fifth" | "5th" | "다섯" => 5,
        "sixth" | "여섯" => 6,
        "seventh" | "일곱" => 7,
        "eighth" | "여덟" => 8,
        "ninth" | "아홉" => 9,
        "tenth" | "열" => 10,
        "last" | "latest" | "previous" | "most recent" | "마지막" | "최근" => {
            return index.chat().last();
        }
        _ => return None,
    };
    index.chat().get(nth - 1)
}

/// Whether the prompt has the "put A into B" shape
pub fn is_insertion(text: &str) -> bool {
    if INSERTION_VERBS
        .iter()
        .filter(|v| !v.is_ascii())
        .any(|v| text.contains(v))
    {
        return true;
    }

    INSERTION_VERBS
        .iter()
        .filter(|v| v.is_ascii())
        .filter_map(|v| vocabulary::find_keyword(text, v).map(|pos| pos + v.len()))
        .any(|after| {
            INSERTION_TARGETS
                .iter()
                .filter(|t| t.is_ascii())
                .any(|t| vocabulary::find_keyword(&text[after..], t).is_some())
        })
}

/// Target objects and colors named by recolor phrases, each in prompt order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecolorTargets {
    pub objects: Vec<String>,
    pub colors: Vec<String>,
}

impl RecolorTargets {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() || self.colors.is_empty()
    }

    /// Pair objects with colors in list order; the shorter list wins.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.objects
            .iter()
            .zip(self.colors.iter())
            .map(|(o, c)| (o.as_str(), c.as_str()))
            .collect()
    }

    /// Instruction text for the executor, or `None` when nothing pairs up
    pub fn synthesize(&self) -> Option<String> {
        let pairs = self.pairs();
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(object, color)| format!("Change the color of the {object} to {color}."))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

pub fn extract_recolor_targets(text: &str) -> RecolorTargets {
    let mut found: Vec<(usize, String, String)> = Vec::new();

    for caps in RECOLOR_EN.captures_iter(text) {
        if let (Some(whole), Some(object), Some(color)) = (caps.get(0), caps.get(1), caps.get(2)) {
            let object = object.as_str().trim();
            if object == "it" || COLORS.contains(&object) {
                continue;
            }
            found.push((whole.start(), object.to_string(), color.as_str().to_string()));
        }
    }
    for caps in RECOLOR_KO.captures_iter(text) {
        if let (Some(whole), Some(object), Some(color)) = (caps.get(0), caps.get(1), caps.get(2)) {
            found.push((whole.start(), object.as_str().to_string(), color.as_str().to_string()));
        }
    }

    found.sort_by_key(|(pos, _, _)| *pos);
    RecolorTargets {
        objects: found.iter().map(|(_, o, _)| o.clone()).collect(),
        colors: found.into_iter().map(|(_, _, c)| c).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Content, ImageTaskRequest, Role, Turn};
    use crate::resolution::indexer::index_request;

    fn image_turn(role: Role, locator: &str) -> Turn {
        Turn {
            role,
            contents: vec![Content::Image {
                locator: locator.to_string(),
                description: String::new(),
                derived_from_style_transfer: false,
            }],
        }
    }

    fn sample_index() -> ImageIndex {
        let request = ImageTaskRequest {
            request_id: "r".into(),
            uploads: vec!["u/a.png".into(), "u/b.png".into()],
            chat: vec![
                image_turn(Role::User, "c/0.png"),
                image_turn(Role::Ai, "c/1.png"),
                image_turn(Role::User, "c/2.png"),
            ],
            ..Default::default()
        };
        index_request(&request)
    }

    #[test]
    fn test_source_tokens_in_prompt_order() {
        let index = sample_index();
        let named = extract_named_images("blend chat#2 with upload#1", &index).unwrap();

        let keys: Vec<_> = named.iter().map(|n| n.image.key()).collect();
        assert_eq!(
            keys,
            vec![(SourceKind::Chat, 2), (SourceKind::Upload, 1)]
        );
    }

    #[test]
    fn test_out_of_range_token_is_error() {
        let index = sample_index();
        let err = extract_named_images("edit chat#7", &index).unwrap_err();
        assert_eq!(
            err,
            ResolveError::IndexOutOfRange {
                kind: SourceKind::Chat,
                index: 7,
                available: 3
            }
        );
    }

    #[test]
    fn test_unknown_source_is_error() {
        let index = sample_index();
        let err = extract_named_images("use gallery#1", &index).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownSource { .. }));
    }

    #[test]
    fn test_ordinals_count_oldest_first() {
        let index = sample_index();

        let named = extract_named_images("use the second image", &index).unwrap();
        assert_eq!(named[0].image.key(), (SourceKind::Chat, 1));

        let named = extract_named_images("the last picture please", &index).unwrap();
        assert_eq!(named[0].image.key(), (SourceKind::Chat, 2));

        let named = extract_named_images("첫 번째 이미지를 수정해줘", &index).unwrap();
        assert_eq!(named[0].image.key(), (SourceKind::Chat, 0));
    }

    #[test]
    fn test_ai_phrase_names_latest_ai_image() {
        let index = sample_index();
        let named = extract_named_images("edit the one you just made", &index).unwrap();

        assert_eq!(named.len(), 1);
        assert_eq!(named[0].image.key(), (SourceKind::Chat, 1));
        assert!(named[0].via_ai_phrase);
    }

    #[test]
    fn test_deictic_names_all_uploads() {
        let index = sample_index();
        let named = extract_named_images("put this image into the one you made", &index).unwrap();

        let keys: Vec<_> = named.iter().map(|n| n.image.key()).collect();
        assert_eq!(
            keys,
            vec![
                (SourceKind::Upload, 0),
                (SourceKind::Upload, 1),
                (SourceKind::Chat, 1)
            ]
        );
    }

    #[test]
    fn test_duplicates_keep_first_mention() {
        let index = sample_index();
        let named = extract_named_images("chat#1 and the one you made", &index).unwrap();
        assert_eq!(named.len(), 1);
        assert!(!named[0].via_ai_phrase);
    }

    #[test]
    fn test_insertion_detection() {
        assert!(is_insertion("put the cat into the second image"));
        assert!(is_insertion("이 이미지를 가운데에 넣어줘"));
        assert!(!is_insertion("put more light"));
        assert!(!is_insertion("make the sky blue"));
    }

    #[test]
    fn test_recolor_pairs_shorter_list_wins() {
        let targets = extract_recolor_targets("make the shirt red and turn the hat blue");
        assert_eq!(targets.pairs(), vec![("shirt", "red"), ("hat", "blue")]);
        assert_eq!(
            targets.synthesize().as_deref(),
            Some("Change the color of the shirt to red. Change the color of the hat to blue.")
        );

        let uneven = RecolorTargets {
            objects: vec!["car".into(), "door".into()],
            colors: vec!["green".into()],
        };
        assert_eq!(uneven.pairs(), vec![("car", "green")]);
    }

    #[test]
    fn test_korean_recolor() {
        let targets = extract_recolor_targets("셔츠를 빨간색으로 바꿔줘");
        assert_eq!(targets.pairs(), vec![("셔츠", "빨간")]);
    }

    #[test]
    fn test_no_recolor_targets() {
        assert!(extract_recolor_targets("remove the dog").synthesize().is_none());
    }
}
