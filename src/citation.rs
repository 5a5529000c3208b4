//! Inline citation detection over a streamed answer.
//!
//! [`CitationParser`] is a two-state character machine. In `Text` every
//! character passes straight through; `[` opens a lookahead buffer
//! (`MaybeRef`). A closing `]` around the decimal number of a known
//! fragment becomes a [`Citation`]; anything else is released verbatim.
//! Lookahead is capped at [`MAX_REF_BUFFER`] characters, so a stray `[`
//! never holds back more than a few characters of output.
//!
//! The parser counts the characters of literal text it has released. A
//! citation's `offset` is that count at the moment the marker closes, which
//! makes it a position in the concatenated answer text with markers
//! removed.

use std::collections::HashMap;

use crate::models::{BBox, Citation, RetrievedFragment};

pub const MAX_REF_BUFFER: usize = 8;

/// Fragments keyed by the number they carry in the prompt. A fresh turn
/// numbers from 1; a continuation keeps the numbers of the original turn,
/// which may leave gaps.
#[derive(Debug, Clone, Default)]
pub struct FragmentSet {
    entries: Vec<(u32, RetrievedFragment)>,
}

impl FragmentSet {
    pub fn sequential(fragments: Vec<RetrievedFragment>) -> Self {
        Self {
            entries: fragments
                .into_iter()
                .enumerate()
                .map(|(i, f)| (i as u32 + 1, f))
                .collect(),
        }
    }

    /// Sorted by number; the first fragment wins on a repeated number.
    pub fn numbered(mut entries: Vec<(u32, RetrievedFragment)>) -> Self {
        entries.sort_by_key(|(n, _)| *n);
        entries.dedup_by_key(|(n, _)| *n);
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, RetrievedFragment)> {
        self.entries.iter()
    }

    pub fn get(&self, number: u32) -> Option<&RetrievedFragment> {
        self.entries
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Text(String),
    Citation(Citation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    MaybeRef,
}

pub struct CitationParser {
    fragments: HashMap<u32, RetrievedFragment>,
    snippet_chars: usize,
    state: State,
    buffer: String,
    offset: usize,
}

impl CitationParser {
    pub fn new(fragments: &FragmentSet, snippet_chars: usize) -> Self {
        Self::with_offset(fragments, snippet_chars, 0)
    }

    /// Parser for a continuation, primed with the length of the text that
    /// is already stored.
    pub fn with_offset(fragments: &FragmentSet, snippet_chars: usize, offset: usize) -> Self {
        let fragments = fragments.iter().cloned().collect();
        Self {
            fragments,
            snippet_chars,
            state: State::Text,
            buffer: String::new(),
            offset,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Consume one streamed token. Adjacent literal characters are
    /// coalesced into a single [`ParseEvent::Text`].
    pub fn feed(&mut self, token: &str) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        let mut text = String::new();

        for ch in token.chars() {
            match self.state {
                State::Text => {
                    if ch == '[' {
                        self.state = State::MaybeRef;
                        self.buffer.push(ch);
                    } else {
                        text.push(ch);
                        self.offset += 1;
                    }
                }
                State::MaybeRef => {
                    if ch == '[' {
                        // A new marker may start here; release the old lookahead.
                        self.release_buffer(&mut text);
                        self.buffer.push(ch);
                        continue;
                    }
                    self.buffer.push(ch);
                    if ch == ']' {
                        match self.resolve() {
                            Some(citation) => {
                                if !text.is_empty() {
                                    events.push(ParseEvent::Text(std::mem::take(&mut text)));
                                }
                                events.push(ParseEvent::Citation(citation));
                                self.buffer.clear();
                            }
                            None => self.release_buffer(&mut text),
                        }
                        self.state = State::Text;
                    } else if self.buffer.chars().count() > MAX_REF_BUFFER {
                        self.release_buffer(&mut text);
                        self.state = State::Text;
                    }
                }
            }
        }

        if !text.is_empty() {
            events.push(ParseEvent::Text(text));
        }
        events
    }

    /// Release any pending lookahead at end of stream.
    pub fn flush(&mut self) -> Vec<ParseEvent> {
        let mut text = String::new();
        self.release_buffer(&mut text);
        self.state = State::Text;
        if text.is_empty() {
            Vec::new()
        } else {
            vec![ParseEvent::Text(text)]
        }
    }

    fn release_buffer(&mut self, out: &mut String) {
        self.offset += self.buffer.chars().count();
        out.push_str(&self.buffer);
        self.buffer.clear();
    }

    /// Citation for a complete `[n]` buffer, if `n` names a fragment.
    fn resolve(&self) -> Option<Citation> {
        let inner = self.buffer.strip_prefix('[')?.strip_suffix(']')?;
        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let ref_index: u32 = inner.parse().ok()?;
        let fragment = self.fragments.get(&ref_index)?;
        Some(Citation {
            ref_index,
            chunk_id: fragment.chunk_id.clone(),
            page: fragment.page,
            bboxes: primary_page_bboxes(&fragment.bboxes, fragment.page),
            text_snippet: fragment.text.chars().take(self.snippet_chars).collect(),
            offset: self.offset,
            document_id: fragment.document_id.clone(),
            document_filename: fragment.document_filename.clone(),
        })
    }
}

/// Boxes on the fragment's primary page in reading order (y, then x).
/// Falls back to every box when none lie on that page.
pub fn primary_page_bboxes(bboxes: &[BBox], page: u32) -> Vec<BBox> {
    let mut selected: Vec<BBox> = bboxes.iter().filter(|b| b.page == page).copied().collect();
    if selected.is_empty() {
        selected = bboxes.to_vec();
    }
    selected.sort_by(|a, b| {
        a.y.partial_cmp(&b.y)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
    });
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(chunk_id: &str, page: u32, text: &str) -> RetrievedFragment {
        RetrievedFragment {
            chunk_id: chunk_id.into(),
            text: text.into(),
            page,
            bboxes: vec![
                BBox { page: page + 1, x: 0.1, y: 0.1, w: 0.5, h: 0.1 },
                BBox { page, x: 0.5, y: 0.4, w: 0.2, h: 0.1 },
                BBox { page, x: 0.1, y: 0.4, w: 0.2, h: 0.1 },
                BBox { page, x: 0.1, y: 0.2, w: 0.8, h: 0.1 },
            ],
            similarity_score: 0.9,
            section_title: None,
            document_id: None,
            document_filename: None,
        }
    }

    fn set(fragments: Vec<RetrievedFragment>) -> FragmentSet {
        FragmentSet::sequential(fragments)
    }

    fn collect(events: &[ParseEvent]) -> (String, Vec<Citation>) {
        let mut text = String::new();
        let mut cites = Vec::new();
        for e in events {
            match e {
                ParseEvent::Text(t) => text.push_str(t),
                ParseEvent::Citation(c) => cites.push(c.clone()),
            }
        }
        (text, cites)
    }

    #[test]
    fn known_marker_becomes_citation_unknown_stays_literal() {
        let input = "profit [1] grew [99].";
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 3, "Profit rose sharply.")]), 80);
        let mut events = parser.feed(input);
        events.extend(parser.flush());
        let (text, cites) = collect(&events);

        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].ref_index, 1);
        assert_eq!(cites[0].chunk_id, "c1");
        assert_eq!(cites[0].page, 3);
        assert_eq!(cites[0].offset, "profit ".len());
        assert_eq!(text, "profit  grew [99].");
        assert!(text.contains("[99]"));
        assert_eq!(text.chars().count() + "[1]".len(), input.chars().count());
        assert_eq!(parser.offset(), text.chars().count());
    }

    #[test]
    fn markers_split_across_tokens() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a"), fragment("c2", 1, "b")]), 80);
        let mut events = Vec::new();
        for tok in ["See", " [", "2", "]", "[1", "] ok"] {
            events.extend(parser.feed(tok));
        }
        events.extend(parser.flush());
        let (text, cites) = collect(&events);
        assert_eq!(text, "See  ok");
        assert_eq!(cites.iter().map(|c| c.ref_index).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(cites[0].offset, 4);
        assert_eq!(cites[1].offset, 4);
    }

    #[test]
    fn long_bracket_text_is_released_after_limit() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a")]), 80);
        let events = parser.feed("x [see appendix] y");
        let (text, cites) = collect(&events);
        assert!(cites.is_empty());
        assert_eq!(text, "x [see appendix] y");
    }

    #[test]
    fn non_numeric_and_empty_markers_are_literal() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a")]), 80);
        let mut events = parser.feed("a[] b[x] c[1a] d[ 1]");
        events.extend(parser.flush());
        let (text, cites) = collect(&events);
        assert!(cites.is_empty());
        assert_eq!(text, "a[] b[x] c[1a] d[ 1]");
    }

    #[test]
    fn nested_open_bracket_restarts_marker() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a")]), 80);
        let (text, cites) = collect(&parser.feed("[[1]"));
        assert_eq!(text, "[");
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].offset, 1);
    }

    #[test]
    fn flush_releases_pending_buffer() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a")]), 80);
        let (text, _) = collect(&parser.feed("end [1"));
        assert_eq!(text, "end ");
        let (rest, _) = collect(&parser.flush());
        assert_eq!(rest, "[1");
        assert_eq!(parser.offset(), 6);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn continuation_offset_is_primed() {
        let mut parser = CitationParser::with_offset(&set(vec![fragment("c1", 1, "a")]), 80, 120);
        let (_, cites) = collect(&parser.feed("more[1]"));
        assert_eq!(cites[0].offset, 124);
    }

    #[test]
    fn citation_bboxes_are_primary_page_in_reading_order() {
        let text = "x".repeat(200);
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 2, &text)]), 80);
        let (_, cites) = collect(&parser.feed("[1]"));
        let boxes = &cites[0].bboxes;
        assert_eq!(boxes.len(), 3);
        assert!(boxes.iter().all(|b| b.page == 2));
        assert_eq!((boxes[0].x, boxes[0].y), (0.1, 0.2));
        assert_eq!((boxes[1].x, boxes[1].y), (0.1, 0.4));
        assert_eq!((boxes[2].x, boxes[2].y), (0.5, 0.4));
        assert_eq!(cites[0].text_snippet.chars().count(), 80);
    }

    #[test]
    fn numbered_set_keeps_gaps() {
        let frags = FragmentSet::numbered(vec![
            (5, fragment("c5", 1, "e")),
            (2, fragment("c2", 1, "b")),
            (5, fragment("dup", 1, "x")),
        ]);
        assert_eq!(frags.len(), 2);
        assert!(frags.get(1).is_none());
        let mut parser = CitationParser::new(&frags, 80);
        let (text, cites) = collect(&parser.feed("[1][5]"));
        assert_eq!(text, "[1]");
        assert_eq!(cites[0].chunk_id, "c5");
    }

    #[test]
    fn bboxes_fall_back_when_page_has_none() {
        let boxes = vec![BBox { page: 5, x: 0.0, y: 0.0, w: 1.0, h: 1.0 }];
        assert_eq!(primary_page_bboxes(&boxes, 1), boxes);
    }

    #[test]
    fn multibyte_text_counts_chars() {
        let mut parser = CitationParser::new(&set(vec![fragment("c1", 1, "a")]), 80);
        let (_, cites) = collect(&parser.feed("毛利率为35.2%[1]"));
        assert_eq!(cites[0].offset, "毛利率为35.2%".chars().count());
    }
}
