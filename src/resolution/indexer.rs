//! Addressable view of every image a request can refer to
//!
//! Chat images get one monotonic counter shared across all turns, in the order
//! turns and contents are provided (oldest first). Uploads keep their position
//! in the upload list. The index is rebuilt per request and never mutated.

use crate::protocol::messages::{Content, ImageTaskRequest, Role};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Chat,
    Upload,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Chat => write!(f, "chat"),
            SourceKind::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedImage {
    pub source_kind: SourceKind,
    pub index: usize,
    pub locator: String,
    /// Author of the turn; only set for chat images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub derived_from_style_transfer: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl IndexedImage {
    /// Identity of the image within its request
    pub fn key(&self) -> (SourceKind, usize) {
        (self.source_kind, self.index)
    }

    /// Label in the `upload#N` / `chat#N` form prompts use
    pub fn label(&self) -> String {
        format!("{}#{}", self.source_kind, self.index)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageIndex {
    chat: Vec<IndexedImage>,
    uploads: Vec<IndexedImage>,
}

impl ImageIndex {
    /// Chat images, oldest first
    pub fn chat(&self) -> &[IndexedImage] {
        &self.chat
    }

    /// Non-empty uploads in upload order
    pub fn uploads(&self) -> &[IndexedImage] {
        &self.uploads
    }

    pub fn get(&self, kind: SourceKind, index: usize) -> Option<&IndexedImage> {
        let pool = match kind {
            SourceKind::Chat => &self.chat,
            SourceKind::Upload => &self.uploads,
        };
        pool.iter().find(|image| image.index == index)
    }

    /// One past the largest addressable index for `kind`
    pub fn len_of(&self, kind: SourceKind) -> usize {
        let pool = match kind {
            SourceKind::Chat => &self.chat,
            SourceKind::Upload => &self.uploads,
        };
        pool.last().map_or(0, |image| image.index + 1)
    }

    pub fn has_uploads(&self) -> bool {
        !self.uploads.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.chat.is_empty() && self.uploads.is_empty()
    }

    pub fn latest_user(&self) -> Option<&IndexedImage> {
        self.latest_by(Role::User)
    }

    pub fn latest_ai(&self) -> Option<&IndexedImage> {
        self.latest_by(Role::Ai)
    }

    fn latest_by(&self, role: Role) -> Option<&IndexedImage> {
        self.chat.iter().rev().find(|image| image.role == Some(role))
    }
}

/// Project a request into its addressable images. Never fails.
pub fn index_request(request: &ImageTaskRequest) -> ImageIndex {
    let mut chat = Vec::new();
    let mut counter = 0;

    for turn in &request.chat {
        for content in &turn.contents {
            let Content::Image {
                locator,
                description,
                derived_from_style_transfer,
            } = content
            else {
                continue;
            };
            if locator.is_empty() {
                continue;
            }
            chat.push(IndexedImage {
                source_kind: SourceKind::Chat,
                index: counter,
                locator: locator.clone(),
                role: Some(turn.role),
                derived_from_style_transfer: *derived_from_style_transfer,
                description: description.clone(),
            });
            counter += 1;
        }
    }

    let uploads = request
        .uploads
        .iter()
        .enumerate()
        .filter(|(_, locator)| !locator.is_empty())
        .map(|(index, locator)| IndexedImage {
            source_kind: SourceKind::Upload,
            index,
            locator: locator.clone(),
            role: None,
            derived_from_style_transfer: false,
            description: String::new(),
        })
        .collect();

    ImageIndex { chat, uploads }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Turn;

    fn image(locator: &str) -> Content {
        Content::Image {
            locator: locator.to_string(),
            description: String::new(),
            derived_from_style_transfer: false,
        }
    }

    #[test]
    fn test_counter_is_shared_across_turns() {
        let request = ImageTaskRequest {
            request_id: "r".into(),
            chat: vec![
                Turn {
                    role: Role::User,
                    contents: vec![
                        Content::Text {
                            text: "two cats".into(),
                        },
                        image("c/a.png"),
                        image("c/b.png"),
                    ],
                },
                Turn {
                    role: Role::Ai,
                    contents: vec![image("c/c.png")],
                },
            ],
            ..Default::default()
        };

        let index = index_request(&request);
        let labels: Vec<_> = index.chat().iter().map(IndexedImage::label).collect();

        assert_eq!(labels, vec!["chat#0", "chat#1", "chat#2"]);
        assert_eq!(index.chat()[2].role, Some(Role::Ai));
        assert!(index.uploads().is_empty());
    }

    #[test]
    fn test_empty_locators_are_skipped() {
        let request = ImageTaskRequest {
            request_id: "r".into(),
            chat: vec![Turn {
                role: Role::User,
                contents: vec![image(""), image("c/a.png")],
            }],
            uploads: vec!["u/0.png".into(), "".into(), "u/2.png".into()],
            ..Default::default()
        };

        let index = index_request(&request);

        assert_eq!(index.chat().len(), 1);
        assert_eq!(index.chat()[0].index, 0);
        let upload_indices: Vec<_> = index.uploads().iter().map(|i| i.index).collect();
        assert_eq!(upload_indices, vec![0, 2]);
        assert!(index.get(SourceKind::Upload, 1).is_none());
        assert_eq!(index.len_of(SourceKind::Upload), 3);
    }

    #[test]
    fn test_empty_request_yields_empty_index() {
        let index = index_request(&ImageTaskRequest::default());
        assert!(index.is_empty());
        assert!(index.latest_user().is_none());
    }

    #[test]
    fn test_latest_by_role() {
        let request = ImageTaskRequest {
            request_id: "r".into(),
            chat: vec![
                Turn {
                    role: Role::User,
                    contents: vec![image("c/0.png")],
                },
                Turn {
                    role: Role::Ai,
                    contents: vec![image("c/1.png")],
                },
                Turn {
                    role: Role::User,
                    contents: vec![image("c/2.png")],
                },
                Turn {
                    role: Role::Ai,
                    contents: vec![image("c/3.png")],
                },
            ],
            ..Default::default()
        };

        let index = index_request(&request);
        assert_eq!(index.latest_user().map(|i| i.index), Some(2));
        assert_eq!(index.latest_ai().map(|i| i.index), Some(3));
    }
}
