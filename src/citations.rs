use crate::api::{ChatApi, CitationData};
use crate::constants::WORKSPACE_PREFIX_PATTERN;
use crate::types::*;
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WORKSPACE_PREFIX: Option<Regex> = match Regex::new(WORKSPACE_PREFIX_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid workspace prefix pattern: {}", e);
            None
        }
    };
}

/// A citation ready for display, pages 1-indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayCitation {
    pub id: String,
    pub chunk_id: String,
    pub title: String,
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub page: u32,
    pub contract_workspace: String,
    pub content: String,
    pub citation_text: Option<String>,
    pub citation_position: Option<CitationPosition>,
    pub reasoning: Option<Vec<String>>,
}

impl DisplayCitation {
    /// Highlight detail from the citation service wins when it is non-empty.
    pub fn merge(&mut self, data: &CitationData) {
        if let Some(text) = data.citation_text.as_deref().filter(|t| !t.is_empty()) {
            self.citation_text = Some(text.to_string());
            self.content = text.to_string();
        }
        if let Some(position) = &data.citation_position {
            self.citation_position = Some(position.clone());
        }
    }
}

/// A citation opened for viewing.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationView {
    pub citation: DisplayCitation,
    pub url: Option<String>,
    pub document: Option<Bytes>,
}

/// Looks up where `citation` points and downloads the source document.
pub async fn open_citation(api: &ChatApi, citation: &DisplayCitation) -> Result<CitationView> {
    let data = api.citation_data(&citation.file_id, citation.page).await?;
    let url = data.citation_url.clone().filter(|u| !u.is_empty());
    let document = match url.as_deref() {
        Some(u) => Some(api.citation_document(u).await?),
        None => {
            tracing::warn!(
                "[☁️  -> ⚙️ ] No document URL for file {} page {}",
                citation.file_id,
                citation.page
            );
            None
        }
    };

    let mut merged = citation.clone();
    merged.merge(&data);
    Ok(CitationView {
        citation: merged,
        url,
        document,
    })
}

/// `UCW_1234_Acme MSA` -> `Acme MSA`
pub fn clean_workspace_name(name: &str) -> Cow<'_, str> {
    match WORKSPACE_PREFIX.as_ref() {
        Some(re) => re.replace(name, ""),
        None => Cow::Borrowed(name),
    }
}

pub fn extract_citations(message: &Message, mode: ResponseMode) -> Vec<DisplayCitation> {
    let metadata = match &message.citation_metadata {
        Some(m) => m,
        None => return Vec::new(),
    };

    match metadata {
        CitationMetadata::Loading => Vec::new(),
        CitationMetadata::Multiple(items) => items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| from_list_item(item, index))
            .collect(),
        CitationMetadata::Single(item) => match from_single(item, message, mode) {
            Some(c) => vec![c],
            None => Vec::new(),
        },
    }
}

fn from_list_item(item: &Citation, index: usize) -> Option<DisplayCitation> {
    let file_id = item.file_id.as_deref()?;
    let page_number = item.page_number?;
    let page = page_number.saturating_add(1);
    let workspace = match item.contract_workspace.as_deref() {
        Some(w) => clean_workspace_name(w).into_owned(),
        None => "Unknown Contract".to_string(),
    };
    let file_name = match item.file_name.as_deref() {
        Some(f) => f.to_string(),
        None => "Unknown file".to_string(),
    };

    Some(DisplayCitation {
        id: format!("{}-{}-{}", file_id, page_number, index),
        chunk_id: format!("{}-{}", file_id, page_number),
        title: format!("{} - {} - Page {}", workspace, file_name, page),
        file_id: file_id.to_string(),
        file_name,
        file_type: match item.file_type.as_deref() {
            Some(t) => t.to_string(),
            None => "pdf".to_string(),
        },
        page,
        contract_workspace: workspace,
        content: item.citation_text.clone().unwrap_or_default(),
        citation_text: item.citation_text.clone(),
        citation_position: item.citation_position.clone(),
        reasoning: item.reasoning.clone(),
    })
}

fn from_single(item: &Citation, message: &Message, mode: ResponseMode) -> Option<DisplayCitation> {
    let file_id = item.file_id.as_deref()?;
    let page_number = item.page_number?;
    let page = page_number.saturating_add(1);
    let workspace = match message.contract_workspace.as_deref() {
        Some(w) => w.to_string(),
        None => String::new(),
    };
    let file_name = match item.file_name.as_deref() {
        Some(f) => f.to_string(),
        None => "Unknown file".to_string(),
    };
    // fast mode trades highlight detail for latency
    let (citation_text, citation_position) = if mode.is_fast() {
        (None, None)
    } else {
        (item.citation_text.clone(), item.citation_position.clone())
    };

    Some(DisplayCitation {
        id: format!("{}-{}", file_id, page_number),
        chunk_id: format!("{}-{}", file_id, page_number),
        title: format!("{} - Page {}", file_name, page),
        file_id: file_id.to_string(),
        file_name,
        file_type: "pdf".to_string(),
        page,
        contract_workspace: workspace,
        content: item.citation_text.clone().unwrap_or_default(),
        citation_text,
        citation_position,
        reasoning: item.reasoning.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(metadata: CitationMetadata) -> Message {
        let mut m = Message::new("a1", Role::Assistant, "Acme");
        m.contract_workspace = Some("ws-1".into());
        m.citation_metadata = Some(metadata);
        m
    }

    #[test]
    fn pages_are_one_indexed() {
        let m = answer(CitationMetadata::Multiple(vec![Citation {
            file_id: Some("42".into()),
            page_number: Some(2),
            contract_workspace: Some("UCW_991_Acme MSA".into()),
            ..Default::default()
        }]));
        let citations = extract_citations(&m, ResponseMode::Standard);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].file_id, "42");
        assert_eq!(citations[0].page, 3);
        assert_eq!(citations[0].contract_workspace, "Acme MSA");
        assert_eq!(citations[0].title, "Acme MSA - Unknown file - Page 3");
    }

    #[test]
    fn incomplete_list_items_are_skipped() {
        let m = answer(CitationMetadata::Multiple(vec![
            Citation {
                file_id: Some("1".into()),
                ..Default::default()
            },
            Citation {
                file_id: Some("2".into()),
                page_number: Some(0),
                ..Default::default()
            },
        ]));
        let citations = extract_citations(&m, ResponseMode::Standard);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].id, "2-0-1");
    }

    #[test]
    fn loading_shows_nothing() {
        let m = answer(CitationMetadata::Loading);
        assert!(extract_citations(&m, ResponseMode::Standard).is_empty());
        assert!(extract_citations(&m, ResponseMode::Fast).is_empty());
    }

    #[test]
    fn fast_mode_strips_highlight_detail() {
        let m = answer(CitationMetadata::Single(Citation {
            file_id: Some("9".into()),
            page_number: Some(4),
            citation_text: Some("Term: 3 years".into()),
            citation_position: Some(CitationPosition::default()),
            ..Default::default()
        }));
        let standard = extract_citations(&m, ResponseMode::Standard);
        assert_eq!(standard[0].citation_text.as_deref(), Some("Term: 3 years"));
        assert!(standard[0].citation_position.is_some());

        let fast = extract_citations(&m, ResponseMode::Fast);
        assert_eq!(fast[0].citation_text, None);
        assert_eq!(fast[0].citation_position, None);
        assert_eq!(fast[0].page, 5);
        assert_eq!(fast[0].contract_workspace, "ws-1");
    }

    #[test]
    fn huge_page_number_saturates() {
        let m = answer(CitationMetadata::Multiple(vec![Citation {
            file_id: Some("1".into()),
            page_number: Some(u32::MAX),
            ..Default::default()
        }]));
        let citations = extract_citations(&m, ResponseMode::Standard);
        assert_eq!(citations[0].page, u32::MAX);

        let single = answer(CitationMetadata::Single(Citation {
            file_id: Some("1".into()),
            page_number: Some(u32::MAX),
            ..Default::default()
        }));
        assert_eq!(extract_citations(&single, ResponseMode::Fast)[0].page, u32::MAX);
    }

    #[test]
    fn service_highlight_overrides_answer_highlight() {
        let m = answer(CitationMetadata::Single(Citation {
            file_id: Some("9".into()),
            page_number: Some(0),
            citation_text: Some("old".into()),
            ..Default::default()
        }));
        let mut citation = extract_citations(&m, ResponseMode::Standard).remove(0);

        citation.merge(&CitationData {
            citation_text: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(citation.citation_text.as_deref(), Some("old"));

        citation.merge(&CitationData {
            citation_text: Some("Supplier: Acme".into()),
            citation_position: Some(CitationPosition::default()),
            ..Default::default()
        });
        assert_eq!(citation.citation_text.as_deref(), Some("Supplier: Acme"));
        assert_eq!(citation.content, "Supplier: Acme");
        assert!(citation.citation_position.is_some());
    }
}
