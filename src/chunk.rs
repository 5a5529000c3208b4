//! Layout-aware sentence chunker.
//!
//! Turns extracted [`Page`]s into retrieval-sized [`Chunk`]s:
//!
//! 1. Repeated text in the top/bottom band of most pages is dropped as
//!    header/footer boilerplate (documents with at least three pages).
//! 2. Blocks set noticeably larger than the median font size become section
//!    headings and are excluded from chunk text.
//! 3. Content blocks are split into sentences (CJK and Latin terminators).
//! 4. Sentences are packed greedily into windows of `target_min_tokens` to
//!    `target_max_tokens`, with about `overlap_tokens` carried into the next
//!    window.
//! 5. Chunks shorter than `min_chunk_chars` are merged into their predecessor.
//!
//! Bounding boxes are normalized to `[0,1]` per page with a top-left origin.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{BBox, Chunk, CleanBlock, Page};

const SENTENCE_DELIMS: &[char] = &['。', '！', '？', '；', '.', '!', '?'];
const DEFAULT_FONT_SIZE: f32 = 12.0;
const MAX_TITLE_CHARS: usize = 200;

/// Estimate tokens for a span of text.
///
/// Text with fewer than 5% spaces is treated as CJK-dense (about two
/// characters per token); otherwise whitespace-delimited words are counted.
pub fn estimate_tokens(text: &str) -> usize {
    let len = text.chars().count();
    if len == 0 {
        return 0;
    }
    let spaces = text.chars().filter(|c| *c == ' ').count();
    if (spaces as f64) / (len as f64) < 0.05 {
        return (len / 2).max(1);
    }
    text.split_whitespace().count().max(1)
}

/// Replace non-breaking spaces, collapse runs of spaces and trim.
pub fn normalize_inline_text(text: &str) -> String {
    let replaced = text.replace('\u{a0}', " ");
    let mut out = String::with_capacity(replaced.len());
    let mut prev_space = false;
    for ch in replaced.chars() {
        if ch == ' ' {
            if !prev_space {
                out.push(ch);
            }
            prev_space = true;
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

/// True when the page set carries no usable text layer.
///
/// An empty page set counts as scanned.
pub fn is_scanned(pages: &[Page], cfg: &ChunkingConfig) -> bool {
    if pages.is_empty() {
        return true;
    }
    let low = pages
        .iter()
        .filter(|p| p.char_count() < cfg.low_text_chars)
        .count();
    (low as f32) / (pages.len() as f32) > cfg.scanned_page_ratio
}

/// Text repeated in the header and footer bands on more than
/// `repeat_threshold` of all pages.
pub fn detect_headers_footers(
    pages: &[Page],
    cfg: &ChunkingConfig,
) -> (HashSet<String>, HashSet<String>) {
    if pages.len() < 3 {
        return (HashSet::new(), HashSet::new());
    }

    let mut top_counts: HashMap<String, usize> = HashMap::new();
    let mut bottom_counts: HashMap<String, usize> = HashMap::new();

    for page in pages {
        let top_cutoff = page.height * cfg.edge_band;
        let bottom_cutoff = page.height * (1.0 - cfg.edge_band);
        let mut seen_top = HashSet::new();
        let mut seen_bottom = HashSet::new();
        for block in &page.blocks {
            let text = normalize_inline_text(&block.text);
            if text.is_empty() {
                continue;
            }
            if block.y0 <= top_cutoff {
                seen_top.insert(text);
            } else if block.y1 >= bottom_cutoff {
                seen_bottom.insert(text);
            }
        }
        for t in seen_top {
            *top_counts.entry(t).or_insert(0) += 1;
        }
        for t in seen_bottom {
            *bottom_counts.entry(t).or_insert(0) += 1;
        }
    }

    let total = pages.len() as f32;
    let frequent = |counts: HashMap<String, usize>| -> HashSet<String> {
        counts
            .into_iter()
            .filter(|(_, c)| (*c as f32) / total > cfg.repeat_threshold)
            .map(|(t, _)| t)
            .collect()
    };
    (frequent(top_counts), frequent(bottom_counts))
}

/// Remove header/footer blocks from one page and order the rest
/// top-to-bottom, left-to-right.
pub fn clean_page(
    page: &Page,
    headers: &HashSet<String>,
    footers: &HashSet<String>,
    cfg: &ChunkingConfig,
) -> Vec<CleanBlock> {
    let top_cutoff = page.height * cfg.edge_band;
    let bottom_cutoff = page.height * (1.0 - cfg.edge_band);

    let mut cleaned: Vec<CleanBlock> = page
        .blocks
        .iter()
        .filter_map(|b| {
            let text = normalize_inline_text(&b.text);
            if b.y0 <= top_cutoff && headers.contains(&text) {
                return None;
            }
            if b.y1 >= bottom_cutoff && footers.contains(&text) {
                return None;
            }
            Some(CleanBlock {
                page_number: page.page_number,
                text,
                bbox: (b.x0, b.y0, b.x1, b.y1),
                font_size: b.font_size,
            })
        })
        .collect();

    cleaned.sort_by(|a, b| {
        a.bbox
            .1
            .total_cmp(&b.bbox.1)
            .then(a.bbox.0.total_cmp(&b.bbox.0))
    });
    cleaned
}

/// Split at sentence terminators, keeping each terminator with its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut buf = String::new();
    for ch in text.chars() {
        buf.push(ch);
        if SENTENCE_DELIMS.contains(&ch) {
            sentences.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        sentences.push(buf);
    }
    sentences
}

/// Normalize a point-space bbox against its page dimensions.
pub fn normalize_bbox(page: u32, bbox: (f32, f32, f32, f32), width: f32, height: f32) -> BBox {
    let (x0, y0, x1, y1) = bbox;
    let w = (x1 - x0).max(0.0);
    let h = (y1 - y0).max(0.0);
    let scale = |v: f32, d: f32| if d > 0.0 { (v / d).clamp(0.0, 1.0) } else { 0.0 };
    BBox {
        page,
        x: scale(x0, width),
        y: scale(y0, height),
        w: scale(w, width),
        h: scale(h, height),
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return DEFAULT_FONT_SIZE;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Join two text pieces. Latin text gets a separating space; CJK runs are
/// concatenated directly.
fn join_text(buf: &mut String, next: &str) {
    let needs_space = match (buf.chars().last(), next.chars().next()) {
        (Some(a), Some(b)) => a.is_ascii() && b.is_ascii() && !a.is_whitespace(),
        _ => false,
    };
    if needs_space {
        buf.push(' ');
    }
    buf.push_str(next);
}

struct Sentence {
    text: String,
    page: u32,
    bbox: (f32, f32, f32, f32),
    section_title: Option<String>,
    tokens: usize,
}

/// Run the full cleaning and chunking pipeline over a document's pages.
///
/// Returns chunks with dense indices starting at 0. An empty result means the
/// document had no content text.
pub fn chunk_pages(document_id: &str, pages: &[Page], cfg: &ChunkingConfig) -> Vec<Chunk> {
    let (headers, footers) = detect_headers_footers(pages, cfg);

    let mut page_dims: HashMap<u32, (f32, f32)> = HashMap::new();
    let mut page_titles: HashMap<u32, String> = HashMap::new();
    let mut blocks: Vec<CleanBlock> = Vec::new();
    for page in pages {
        page_dims.insert(page.page_number, (page.width, page.height));
        if let Some(title) = &page.section_title {
            page_titles.insert(page.page_number, title.clone());
        }
        blocks.extend(clean_page(page, &headers, &footers, cfg));
    }
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut sizes: Vec<f32> = blocks
        .iter()
        .map(|b| b.font_size)
        .filter(|s| *s > 0.0)
        .collect();
    let heading_cutoff = median(&mut sizes) * cfg.heading_ratio;

    let sentences = collect_sentences(&blocks, &page_titles, heading_cutoff);
    let chunks = assemble(document_id, &sentences, &page_dims, cfg);
    merge_micro_chunks(chunks, cfg.min_chunk_chars)
}

fn collect_sentences(
    blocks: &[CleanBlock],
    page_titles: &HashMap<u32, String>,
    heading_cutoff: f32,
) -> Vec<Sentence> {
    let mut current_title: Option<String> = None;
    let mut last_page: Option<u32> = None;
    let mut sentences = Vec::new();

    for block in blocks {
        if last_page != Some(block.page_number) {
            last_page = Some(block.page_number);
            if let Some(title) = page_titles.get(&block.page_number) {
                current_title = Some(truncate_chars(title.trim(), MAX_TITLE_CHARS));
            }
        }

        if block.font_size > heading_cutoff {
            let title = block.text.trim();
            current_title = if title.is_empty() {
                None
            } else {
                Some(truncate_chars(title, MAX_TITLE_CHARS))
            };
            continue;
        }

        for sentence in split_sentences(&block.text) {
            let text = sentence.trim();
            if text.is_empty() {
                continue;
            }
            sentences.push(Sentence {
                text: text.to_string(),
                page: block.page_number,
                bbox: block.bbox,
                section_title: current_title.clone(),
                tokens: estimate_tokens(text),
            });
        }
    }
    sentences
}

fn assemble(
    document_id: &str,
    sentences: &[Sentence],
    page_dims: &HashMap<u32, (f32, f32)>,
    cfg: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let n = sentences.len();
    let mut start = 0usize;

    while start < n {
        let mut sum = 0usize;
        let mut end = start;

        while end < n && sum < cfg.target_min_tokens {
            sum += sentences[end].tokens;
            end += 1;
        }
        while end < n && sum + sentences[end].tokens <= cfg.target_max_tokens {
            sum += sentences[end].tokens;
            end += 1;
        }

        let window = &sentences[start..end];
        let mut text = String::new();
        let mut bboxes: Vec<BBox> = Vec::new();
        for s in window {
            join_text(&mut text, &s.text);
            let (w, h) = page_dims.get(&s.page).copied().unwrap_or((1.0, 1.0));
            let bbox = normalize_bbox(s.page, s.bbox, w, h);
            if bboxes.last() != Some(&bbox) {
                bboxes.push(bbox);
            }
        }
        let page_start = window.iter().map(|s| s.page).min().unwrap_or(1);
        let page_end = window.iter().map(|s| s.page).max().unwrap_or(page_start);

        chunks.push(Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index: chunks.len() as i64,
            token_count: estimate_tokens(&text) as i64,
            text,
            page_start,
            page_end,
            bboxes,
            section_title: window[0].section_title.clone(),
            vector_id: None,
        });

        if end >= n {
            break;
        }

        // Step back until the tail carries at least `overlap_tokens`.
        let mut k = 0usize;
        let mut acc = 0usize;
        let mut j = end;
        while j > start && acc < cfg.overlap_tokens {
            j -= 1;
            acc += sentences[j].tokens;
            k += 1;
        }
        start = (end - k).max(start + 1);
    }
    chunks
}

fn merge_micro_chunks(chunks: Vec<Chunk>, min_chars: usize) -> Vec<Chunk> {
    let mut kept: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.text.trim().chars().count() >= min_chars {
            kept.push(chunk);
            continue;
        }
        // A leading micro-chunk has nothing to merge into and is dropped.
        if let Some(prev) = kept.last_mut() {
            join_text(&mut prev.text, &chunk.text);
            for bbox in chunk.bboxes {
                if !prev.bboxes.contains(&bbox) {
                    prev.bboxes.push(bbox);
                }
            }
            prev.page_end = prev.page_end.max(chunk.page_end);
            prev.token_count += chunk.token_count;
        }
    }
    for (i, chunk) in kept.iter_mut().enumerate() {
        chunk.chunk_index = i as i64;
    }
    kept
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
