//! Keyword tables driving the resolver's rule cascade
//!
//! Matching is case-insensitive over a normalised prompt. ASCII keywords must
//! sit on word boundaries ("move" does not match "remove"); Hangul keywords
//! match as substrings since Korean attaches particles directly to words.

/// Questions about what the worker can do
pub const CAPABILITY: &[&str] = &[
    "what can you do",
    "what do you do",
    "how do i use",
    "how to use",
    "how does this work",
    "what are your features",
    "what features",
    "뭘 할 수",
    "무엇을 할 수",
    "뭐 할 수 있",
    "사용법",
    "기능이 뭐",
    "어떻게 써",
    "어떻게 사용",
];

/// Prompts that are nothing but a request for help
pub const CAPABILITY_EXACT: &[&str] = &["help", "?", "도움말", "도움"];

pub const HOLD_STOP: &[&str] = &[
    "stop",
    "cancel",
    "wait",
    "hold on",
    "never mind",
    "nevermind",
    "pause",
    "그만",
    "취소",
    "멈춰",
    "잠깐",
    "보류",
];

pub const STYLE: &[&str] = &[
    "style",
    "styled",
    "stylize",
    "stylise",
    "watercolor",
    "watercolour",
    "oil painting",
    "anime",
    "cartoon",
    "sketch",
    "pixel art",
    "ghibli",
    "van gogh",
    "gogh",
    "monet",
    "impressionist",
    "vintage",
    "retro",
    "pastel",
    "comic",
    "화풍",
    "스타일",
    "느낌으로",
    "풍으로",
    "수채화",
    "유화",
    "애니",
    "만화",
    "지브리",
    "고흐",
];

pub const STRUCTURAL_EDIT: &[&str] = &[
    "edit",
    "replace",
    "insert",
    "add",
    "put",
    "place",
    "remove",
    "delete",
    "erase",
    "recolor",
    "recolour",
    "change the color",
    "change the colour",
    "background",
    "swap",
    "move",
    "crop",
    "resize",
    "bigger",
    "smaller",
    "바꿔",
    "바꾸",
    "교체",
    "넣어",
    "넣고",
    "추가",
    "지워",
    "제거",
    "삭제",
    "배경",
    "옮겨",
    "잘라",
    "합성",
    "색깔",
    "색으로",
];

pub const GENERATE: &[&str] = &[
    "draw",
    "generate",
    "create",
    "paint",
    "render",
    "illustrate",
    "make a",
    "make an",
    "make me",
    "new image",
    "new picture",
    "그려",
    "만들어",
    "생성",
];

pub const VAGUE: &[&str] = &[
    "whatever",
    "do your thing",
    "something nice",
    "anything",
    "surprise me",
    "대충",
    "알아서",
    "그 느낌",
    "아무거나",
];

pub const UNRESOLVABLE_CONTEXT: &[&str] = &[
    "from before",
    "that thing",
    "the one i said",
    "the one i mentioned",
    "like last time",
    "어제 그거",
    "그거 있잖아",
    "그걸로",
    "저번에 그",
];

/// "put A into B" style requests; the last named image is the destination
pub const INSERTION_VERBS: &[&str] = &[
    "put", "insert", "place", "paste", "add", "넣어", "넣고", "올려", "끼워", "합성",
];

pub const INSERTION_TARGETS: &[&str] = &["into", "onto", "in", "on", "inside", "에", "위에", "안에"];

pub const BACKGROUND: &[&str] = &["background", "backdrop", "배경"];

pub const AI_RESULT: &[&str] = &[
    "you just made",
    "you made",
    "you created",
    "you generated",
    "your result",
    "the result",
    "generated one",
    "generated image",
    "방금 만든",
    "네가 만든",
    "만들어준",
    "생성한 이미지",
];

pub const UPLOAD_DEICTIC: &[&str] = &[
    "this image",
    "this picture",
    "this photo",
    "these images",
    "these pictures",
    "these photos",
    "uploaded",
    "이 이미지",
    "이 사진",
    "이 그림",
    "올린",
];

pub const COLORS: &[&str] = &[
    "red", "orange", "yellow", "green", "blue", "purple", "violet", "pink", "black", "white",
    "gray", "grey", "brown", "gold", "silver", "navy", "beige", "빨간", "빨강", "주황", "노란",
    "노랑", "초록", "파란", "파랑", "보라", "분홍", "검은", "검정", "흰", "하얀", "회색",
    "갈색", "금색", "은색", "남색",
];

/// Lowercase and collapse whitespace
pub fn normalize(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whether `text` (already normalised) contains any keyword
pub fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| find_keyword(text, kw).is_some())
}

/// Byte offset of the first occurrence of `keyword` honouring word boundaries
pub fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    if !keyword.is_ascii() {
        return text.find(keyword);
    }

    let mut from = 0;
    while let Some(rel) = text[from..].find(keyword) {
        let start = from + rel;
        let end = start + keyword.len();
        let before_ok = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = text[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + keyword.len().max(1);
        if from >= text.len() {
            break;
        }
    }
    None
}

/// Whether the prompt reads as natural language.
///
/// Non-empty prompts with no letters, or where letters make up less than a
/// third of the visible characters, are treated as noise.
pub fn is_well_formed(prompt: &str) -> bool {
    let visible: Vec<char> = prompt.chars().filter(|c| !c.is_whitespace()).collect();
    if visible.is_empty() {
        return true;
    }
    let letters = visible.iter().filter(|c| c.is_alphabetic()).count();
    letters > 0 && letters * 3 >= visible.len()
}

/// Whether the prompt is written in Korean
pub fn is_korean(prompt: &str) -> bool {
    prompt
        .chars()
        .any(|c| ('\u{AC00}'..='\u{D7A3}').contains(&c) || ('\u{3131}'..='\u{318E}').contains(&c))
}
