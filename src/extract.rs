//! Multi-format page extraction (PDF, DOCX, PPTX, XLSX, TXT, Markdown).
//!
//! Every extractor returns the same shape: an ordered list of [`Page`]s made
//! of positioned [`TextBlock`]s. PDFs carry real geometry and font sizes
//! from their content streams. The other formats have no physical layout, so
//! their paragraphs are stacked onto a virtual US-Letter page inside the
//! body band, which keeps bounding-box normalization and header detection
//! uniform downstream.

use std::collections::HashMap;
use std::io::Read;

use lopdf::{Document as PdfDocument, Object, ObjectId};

use crate::error::ExtractError;
use crate::models::{Page, TextBlock};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TXT: &str = "text/plain";
pub const MIME_MD: &str = "text/markdown";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Widest sheet Excel allows (column XFD).
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Maximum cells in the padded grid of one sheet.
const XLSX_MAX_GRID_CELLS: usize = 1_000_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_TITLE_CHARS: usize = 200;

// Virtual page used for formats without layout.
const VIRTUAL_WIDTH: f32 = 612.0;
const VIRTUAL_HEIGHT: f32 = 792.0;
const VIRTUAL_TOP: f32 = 90.0;
const VIRTUAL_BOTTOM: f32 = 700.0;
const VIRTUAL_MARGIN_X: f32 = 72.0;
const BODY_FONT: f32 = 12.0;
const CHARS_PER_VIRTUAL_LINE: usize = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Txt,
    Md,
}

impl DocFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            DocFormat::Pdf => MIME_PDF,
            DocFormat::Docx => MIME_DOCX,
            DocFormat::Pptx => MIME_PPTX,
            DocFormat::Xlsx => MIME_XLSX,
            DocFormat::Txt => MIME_TXT,
            DocFormat::Md => MIME_MD,
        }
    }

    /// Resolve from a MIME type, falling back to the filename extension for
    /// generic types such as `application/octet-stream`.
    pub fn detect(content_type: &str, filename: &str) -> Option<Self> {
        let by_mime = match content_type.split(';').next().unwrap_or("").trim() {
            MIME_PDF => Some(DocFormat::Pdf),
            MIME_DOCX => Some(DocFormat::Docx),
            MIME_PPTX => Some(DocFormat::Pptx),
            MIME_XLSX => Some(DocFormat::Xlsx),
            MIME_TXT => Some(DocFormat::Txt),
            MIME_MD => Some(DocFormat::Md),
            _ => None,
        };
        by_mime.or_else(|| {
            let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
            match ext.as_str() {
                "pdf" => Some(DocFormat::Pdf),
                "docx" => Some(DocFormat::Docx),
                "pptx" => Some(DocFormat::Pptx),
                "xlsx" => Some(DocFormat::Xlsx),
                "txt" => Some(DocFormat::Txt),
                "md" | "markdown" => Some(DocFormat::Md),
                _ => None,
            }
        })
    }
}

/// Extract pages from raw document bytes.
pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<Page>, ExtractError> {
    let format = DocFormat::detect(content_type, "")
        .ok_or_else(|| ExtractError::UnsupportedContentType(content_type.to_string()))?;
    extract_format(bytes, format, 3000)
}

/// Extract pages for a known format. `page_split_chars` sizes the virtual
/// pages of DOCX, TXT and Markdown input.
pub fn extract_format(
    bytes: &[u8],
    format: DocFormat,
    page_split_chars: usize,
) -> Result<Vec<Page>, ExtractError> {
    match format {
        DocFormat::Pdf => extract_pdf(bytes),
        DocFormat::Docx => extract_docx(bytes, page_split_chars),
        DocFormat::Pptx => extract_pptx(bytes),
        DocFormat::Xlsx => extract_xlsx(bytes),
        DocFormat::Txt => extract_plain(bytes, false, page_split_chars),
        DocFormat::Md => extract_plain(bytes, true, page_split_chars),
    }
}

// ============ PDF ============

/// Affine matrix `[a b c d e f]` in PDF row-vector convention.
#[derive(Debug, Clone, Copy)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f32, ty: f32) -> Matrix {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self × other`.
    fn mul(&self, other: &Matrix) -> Matrix {
        let [a1, b1, c1, d1, e1, f1] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a1 * a2 + b1 * c2,
            a1 * b2 + b1 * d2,
            c1 * a2 + d1 * c2,
            c1 * b2 + d1 * d2,
            e1 * a2 + f1 * c2 + e2,
            e1 * b2 + f1 * d2 + f2,
        ])
    }
}

#[derive(Debug)]
struct Line {
    text: String,
    x0: f32,
    x1: f32,
    baseline: f32,
    size: f32,
}

/// Walks a page content stream, tracking text and graphics matrices, and
/// groups shown strings into baseline-aligned lines.
struct LineCollector {
    ctm: Matrix,
    ctm_stack: Vec<Matrix>,
    tm: Matrix,
    tlm: Matrix,
    font_size: f32,
    leading: f32,
    lines: Vec<Line>,
}

impl LineCollector {
    fn new() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            ctm_stack: Vec::new(),
            tm: Matrix::IDENTITY,
            tlm: Matrix::IDENTITY,
            font_size: BODY_FONT,
            leading: 0.0,
            lines: Vec::new(),
        }
    }

    fn next_line(&mut self, tx: f32, ty: f32) {
        self.tlm = Matrix::translate(tx, ty).mul(&self.tlm);
        self.tm = self.tlm;
    }

    fn show(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let trm = self.tm.mul(&self.ctm);
        let [_, b, _, d, x, y] = trm.0;
        let scale = (b * b + d * d).sqrt();
        let size = (self.font_size * if scale > 0.0 { scale } else { 1.0 }).abs();
        let chars = text.chars().count() as f32;
        let advance = chars * self.font_size * 0.5;
        let device_width = advance * trm.0[0].abs().max(scale);

        let same_line = self
            .lines
            .last()
            .map(|l| (l.baseline - y).abs() <= size.max(l.size) * 0.5)
            .unwrap_or(false);
        match self.lines.last_mut() {
            Some(line) if same_line => {
                if x - line.x1 > size * 0.25 && !line.text.ends_with(' ') {
                    line.text.push(' ');
                }
                line.text.push_str(text);
                line.x1 = line.x1.max(x + device_width);
                line.x0 = line.x0.min(x);
                line.size = line.size.max(size);
            }
            _ => self.lines.push(Line {
                text: text.to_string(),
                x0: x,
                x1: x + device_width,
                baseline: y,
                size,
            }),
        }
        self.tm = Matrix::translate(advance, 0.0).mul(&self.tm);
    }

    fn apply(&mut self, op: &lopdf::content::Operation) {
        let nums: Vec<f32> = op.operands.iter().filter_map(number).collect();
        match op.operator.as_str() {
            "q" => self.ctm_stack.push(self.ctm),
            "Q" => {
                if let Some(m) = self.ctm_stack.pop() {
                    self.ctm = m;
                }
            }
            "cm" if nums.len() == 6 => {
                let m = Matrix([nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]]);
                self.ctm = m.mul(&self.ctm);
            }
            "BT" => {
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
            }
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(number) {
                    self.font_size = size;
                }
            }
            "TL" if !nums.is_empty() => self.leading = nums[0],
            "Td" if nums.len() == 2 => self.next_line(nums[0], nums[1]),
            "TD" if nums.len() == 2 => {
                self.leading = -nums[1];
                self.next_line(nums[0], nums[1]);
            }
            "Tm" if nums.len() == 6 => {
                self.tlm = Matrix([nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]]);
                self.tm = self.tlm;
            }
            "T*" => self.next_line(0.0, -self.leading),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    self.show(&decode_pdf_string(bytes));
                }
            }
            "'" => {
                self.next_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    self.show(&decode_pdf_string(bytes));
                }
            }
            "\"" => {
                self.next_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = op.operands.get(2) {
                    self.show(&decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    let mut text = String::new();
                    for item in items {
                        match item {
                            Object::String(bytes, _) => text.push_str(&decode_pdf_string(bytes)),
                            other => {
                                // Large negative kerning is a word gap.
                                if number(other).map(|n| n < -200.0).unwrap_or(false)
                                    && !text.ends_with(' ')
                                {
                                    text.push(' ');
                                }
                            }
                        }
                    }
                    self.show(&text);
                }
            }
            _ => {}
        }
    }
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Decode a PDF string operand: UTF-16BE with BOM, else Latin-1.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn inherited<'a>(doc: &'a PdfDocument, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut dict = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(obj) = dict.get(key) {
            return match obj {
                Object::Reference(id) => doc.get_object(*id).ok(),
                other => Some(other),
            };
        }
        let parent = dict.get(b"Parent").ok()?.as_reference().ok()?;
        dict = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Page box as `(llx, lly, width, height)`; US Letter when absent.
fn media_box(doc: &PdfDocument, page_id: ObjectId) -> (f32, f32, f32, f32) {
    let values: Vec<f32> = match inherited(doc, page_id, b"MediaBox") {
        Some(Object::Array(items)) => items.iter().filter_map(number).collect(),
        _ => Vec::new(),
    };
    if values.len() == 4 {
        let (llx, lly) = (values[0].min(values[2]), values[1].min(values[3]));
        let width = (values[2] - values[0]).abs();
        let height = (values[3] - values[1]).abs();
        if width > 0.0 && height > 0.0 {
            return (llx, lly, width, height);
        }
    }
    (0.0, 0.0, VIRTUAL_WIDTH, VIRTUAL_HEIGHT)
}

/// True when content-stream decoding produced nothing readable, which
/// happens with composite (CID) fonts.
fn looks_undecoded(blocks: &[TextBlock]) -> bool {
    let total: usize = blocks.iter().map(|b| b.text.chars().count()).sum();
    if total == 0 {
        return true;
    }
    let bad = blocks
        .iter()
        .flat_map(|b| b.text.chars())
        .filter(|c| (c.is_control() && *c != '\t') || *c == '\u{fffd}')
        .count();
    bad * 10 > total * 3
}

/// Per-page plain text from pdf-extract, which resolves font encodings
/// and ToUnicode maps. pdf-extract can panic on malformed input.
fn pdf_extract_page_texts(bytes: &[u8]) -> Vec<String> {
    let owned = bytes.to_vec();
    match std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem_by_pages(&owned)) {
        Ok(Ok(pages)) => pages,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "pdf-extract fallback failed");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("pdf-extract panicked during fallback extraction");
            Vec::new()
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    let doc = PdfDocument::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let mut fallback: Option<Vec<String>> = None;
    let mut pages = Vec::new();

    for (page_number, page_id) in doc.get_pages() {
        let (llx, lly, width, height) = media_box(&doc, page_id);
        let rotation = inherited(&doc, page_id, b"Rotate")
            .and_then(|o| o.as_i64().ok())
            .unwrap_or(0) as i32;

        let content = doc.get_page_content(page_id).unwrap_or_default();
        let ops = lopdf::content::Content::decode(&content)
            .map(|c| c.operations)
            .unwrap_or_default();

        let mut collector = LineCollector::new();
        for op in &ops {
            collector.apply(op);
        }

        let mut blocks: Vec<TextBlock> = collector
            .lines
            .into_iter()
            .filter(|l| !l.text.trim().is_empty())
            .map(|l| {
                let base = l.baseline - lly;
                TextBlock {
                    text: l.text,
                    x0: (l.x0 - llx).max(0.0),
                    y0: (height - (base + l.size * 0.8)).max(0.0),
                    x1: (l.x1 - llx).max(0.0),
                    y1: (height - (base - l.size * 0.2)).max(0.0),
                    font_size: l.size,
                }
            })
            .collect();

        if looks_undecoded(&blocks) {
            let texts = fallback.get_or_insert_with(|| pdf_extract_page_texts(bytes));
            if let Some(text) = texts.get(page_number.saturating_sub(1) as usize) {
                let paragraphs: Vec<(String, f32)> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| (l.to_string(), BODY_FONT))
                    .collect();
                blocks = layout_blocks(&paragraphs, width, height);
            }
        }

        pages.push(Page {
            page_number,
            width,
            height,
            rotation,
            blocks,
            section_title: None,
        });
    }
    Ok(pages)
}

// ============ Virtual layout ============

/// Stack paragraphs top-to-bottom inside the body band of a page. Heights
/// are compressed proportionally when a page holds more text than fits.
fn layout_blocks(paragraphs: &[(String, f32)], width: f32, height: f32) -> Vec<TextBlock> {
    let top = height * (VIRTUAL_TOP / VIRTUAL_HEIGHT);
    let bottom = height * (VIRTUAL_BOTTOM / VIRTUAL_HEIGHT);
    let heights: Vec<f32> = paragraphs
        .iter()
        .map(|(text, size)| {
            let lines = text.chars().count().div_ceil(CHARS_PER_VIRTUAL_LINE).max(1);
            lines as f32 * size * 1.2
        })
        .collect();
    let gap = 4.0;
    let needed: f32 = heights.iter().sum::<f32>() + gap * paragraphs.len() as f32;
    let scale = if needed > bottom - top {
        (bottom - top) / needed
    } else {
        1.0
    };

    let mut y = top;
    paragraphs
        .iter()
        .zip(heights)
        .map(|((text, size), h)| {
            let h = h * scale;
            let block = TextBlock {
                text: text.clone(),
                x0: VIRTUAL_MARGIN_X,
                y0: y,
                x1: width - VIRTUAL_MARGIN_X,
                y1: y + h,
                font_size: *size,
            };
            y += h + gap * scale;
            block
        })
        .collect()
}

/// Virtual page from text lines. Blank lines are dropped.
fn virtual_page(page_number: u32, lines: &[String], section_title: Option<String>) -> Page {
    let paragraphs: Vec<(String, f32)> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| (l.to_string(), BODY_FONT))
        .collect();
    Page {
        page_number,
        width: VIRTUAL_WIDTH,
        height: VIRTUAL_HEIGHT,
        rotation: 0,
        blocks: layout_blocks(&paragraphs, VIRTUAL_WIDTH, VIRTUAL_HEIGHT),
        section_title,
    }
}

fn placeholder_page(text: &str) -> Vec<Page> {
    vec![virtual_page(1, &[text.to_string()], None)]
}

/// Accumulates text lines into virtual pages, flushing at heading
/// boundaries and when the character budget is reached.
struct PageBuilder {
    pages: Vec<Page>,
    lines: Vec<String>,
    chars: usize,
    title: Option<String>,
    max_chars: usize,
}

impl PageBuilder {
    fn new(max_chars: usize) -> Self {
        Self {
            pages: Vec::new(),
            lines: Vec::new(),
            chars: 0,
            title: None,
            max_chars,
        }
    }

    fn push(&mut self, line: String) {
        self.chars += line.chars().count();
        self.lines.push(line);
        if self.chars >= self.max_chars {
            self.flush();
        }
    }

    fn heading(&mut self, title: &str) {
        self.flush();
        self.title = Some(title.chars().take(MAX_TITLE_CHARS).collect());
    }

    fn flush(&mut self) {
        if self.lines.iter().any(|l| !l.trim().is_empty()) {
            let number = self.pages.len() as u32 + 1;
            self.pages
                .push(virtual_page(number, &self.lines, self.title.clone()));
        }
        self.lines.clear();
        self.chars = 0;
    }

    fn finish(mut self) -> Vec<Page> {
        self.flush();
        self.pages
    }
}

// ============ Plain text / Markdown ============

fn extract_plain(bytes: &[u8], markdown: bool, max_chars: usize) -> Result<Vec<Page>, ExtractError> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Ok(placeholder_page("(empty file)"));
    }

    let mut builder = PageBuilder::new(max_chars);
    for line in text.lines() {
        let stripped = line.trim();
        if markdown && stripped.starts_with('#') {
            let heading = stripped.trim_start_matches('#').trim();
            if !heading.is_empty() {
                builder.heading(heading);
                continue;
            }
        }
        builder.push(line.to_string());
    }
    let pages = builder.finish();
    if pages.is_empty() {
        let head: String = text.chars().take(max_chars).collect();
        return Ok(placeholder_page(&head));
    }
    Ok(pages)
}

// ============ OOXML ============

/// Minimal owned XML element tree. Names are local (namespace prefix
/// stripped); attribute keys keep their prefix.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
    text: String,
}

impl XmlNode {
    fn from_start(e: &quick_xml::events::BytesStart) -> Self {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let attrs = e
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                let value = a
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_default();
                (key, value)
            })
            .collect();
        Self {
            name,
            attrs,
            ..Default::default()
        }
    }

    /// Attribute by exact key or by local part of a prefixed key.
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key || k.rsplit(':').next() == Some(key))
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First descendant with the given name, depth-first.
    fn find(&self, name: &str) -> Option<&XmlNode> {
        for c in &self.children {
            if c.name == name {
                return Some(c);
            }
            if let Some(found) = c.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        for c in &self.children {
            if c.name == name {
                out.push(c);
            } else {
                c.find_all(name, out);
            }
        }
    }

    /// Concatenated run text (`t` elements) with tabs and breaks.
    fn run_text(&self) -> String {
        let mut out = String::new();
        self.collect_run_text(&mut out);
        out
    }

    fn collect_run_text(&self, out: &mut String) {
        for c in &self.children {
            match c.name.as_str() {
                "t" => out.push_str(&c.text),
                "tab" => out.push('\t'),
                "br" | "cr" => out.push('\n'),
                _ => c.collect_run_text(out),
            }
        }
    }
}

fn parse_xml(xml: &[u8]) -> Result<XmlNode, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(XmlNode::from_start(&e)),
            Ok(Event::Empty(e)) => {
                let node = XmlNode::from_start(&e);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() > 1 {
                    if let Some(node) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
            }
            Ok(Event::Text(te)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::CData(cd)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(cd.as_ref()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    // Close anything left open by truncated input.
    while stack.len() > 1 {
        if let Some(node) = stack.pop() {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(node);
            }
        }
    }
    stack
        .pop()
        .ok_or_else(|| ExtractError::Ooxml("empty XML document".to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn read_xml(archive: &mut Archive<'_>, name: &str) -> Result<XmlNode, ExtractError> {
    let bytes = read_zip_entry_bounded(archive, name, MAX_XML_ENTRY_BYTES)?;
    parse_xml(&bytes)
}

fn has_entry(archive: &Archive<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

/// Entries matching `prefix<N>.xml`, sorted by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|n| {
            let num = n.strip_prefix(prefix)?.strip_suffix(".xml")?.parse::<u32>().ok()?;
            Some((num, n.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, n)| n).collect()
}

/// Relationship id to target path, resolved against `base_dir`.
fn read_relationships(
    archive: &mut Archive<'_>,
    rels_path: &str,
    base_dir: &str,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if !has_entry(archive, rels_path) {
        return map;
    }
    let Ok(root) = read_xml(archive, rels_path) else {
        return map;
    };
    let mut rels = Vec::new();
    root.find_all("Relationship", &mut rels);
    for rel in rels {
        if let (Some(id), Some(target)) = (rel.attr("Id"), rel.attr("Target")) {
            map.insert(id.to_string(), resolve_zip_path(base_dir, target));
        }
    }
    map
}

fn resolve_zip_path(base_dir: &str, target: &str) -> String {
    if let Some(abs) = target.strip_prefix('/') {
        return abs.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for seg in target.split('/') {
        match seg {
            ".." => {
                parts.pop();
            }
            "." | "" => {}
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn markdown_table(rows: &[Vec<String>]) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };
    let cols = header.len();
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("| {} |", vec!["---"; cols].join(" | ")));
    for row in &rows[1..] {
        let mut cells: Vec<String> = row.iter().take(cols).cloned().collect();
        cells.resize(cols, String::new());
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

/// Rows of a `w:tbl` or `a:tbl`; cell paragraphs are joined with spaces.
fn table_rows(table: &XmlNode) -> Vec<Vec<String>> {
    table
        .children_named("tr")
        .map(|tr| {
            tr.children_named("tc")
                .map(|tc| {
                    let mut paras = Vec::new();
                    tc.find_all("p", &mut paras);
                    paras
                        .iter()
                        .map(|p| p.run_text().trim().replace('\n', " "))
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect()
        })
        .filter(|row: &Vec<String>| !row.is_empty())
        .collect()
}

fn extract_docx(bytes: &[u8], max_chars: usize) -> Result<Vec<Page>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    if !has_entry(&archive, "word/document.xml") {
        return Err(ExtractError::Ooxml(
            "word/document.xml not found".to_string(),
        ));
    }
    let root = read_xml(&mut archive, "word/document.xml")?;
    let Some(body) = root.find("body") else {
        return Ok(placeholder_page("(empty document)"));
    };

    let mut builder = PageBuilder::new(max_chars);
    for element in &body.children {
        match element.name.as_str() {
            "p" => {
                let text = element.run_text().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let style = element
                    .child("pPr")
                    .and_then(|p| p.child("pStyle"))
                    .and_then(|s| s.attr("val"))
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if style.starts_with("heading") || style == "title" {
                    builder.heading(&text);
                    continue;
                }
                builder.push(text);
            }
            "tbl" => {
                let table = markdown_table(&table_rows(element));
                if !table.is_empty() {
                    for line in table.lines() {
                        builder.push(line.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let pages = builder.finish();
    if pages.is_empty() {
        return Ok(placeholder_page("(empty document)"));
    }
    Ok(pages)
}

fn shape_is_title(shape: &XmlNode) -> bool {
    shape
        .find("ph")
        .and_then(|ph| ph.attr("type"))
        .map(|t| t == "title" || t == "ctrTitle")
        .unwrap_or(false)
}

fn text_body_lines(shape: &XmlNode) -> Vec<String> {
    let Some(body) = shape.child("txBody") else {
        return Vec::new();
    };
    body.children_named("p")
        .map(|p| p.run_text())
        .filter(|t| !t.trim().is_empty())
        .collect()
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut pages = Vec::new();

    for (idx, slide_path) in slides.iter().enumerate() {
        let slide = read_xml(&mut archive, slide_path)?;
        let mut lines: Vec<String> = Vec::new();
        let mut title: Option<String> = None;

        let mut shapes = Vec::new();
        slide.find_all("sp", &mut shapes);
        for shape in shapes {
            let shape_lines = text_body_lines(shape);
            if shape_lines.is_empty() {
                continue;
            }
            if title.is_none() && shape_is_title(shape) {
                let t = shape_lines.join(" ");
                title = Some(t.trim().chars().take(MAX_TITLE_CHARS).collect());
            }
            lines.extend(shape_lines);
        }

        let mut tables = Vec::new();
        slide.find_all("tbl", &mut tables);
        for table in tables {
            let md = markdown_table(&table_rows(table));
            if !md.is_empty() {
                lines.extend(md.lines().map(str::to_string));
            }
        }

        let notes = slide_notes(&mut archive, slide_path);
        if !notes.is_empty() {
            lines.push("**Speaker Notes:**".to_string());
            lines.extend(notes);
        }

        if lines.iter().any(|l| !l.trim().is_empty()) {
            pages.push(virtual_page(idx as u32 + 1, &lines, title));
        }
    }

    if pages.is_empty() {
        return Ok(placeholder_page("(empty presentation)"));
    }
    Ok(pages)
}

/// Body text of the notes slide linked from a slide, if any.
fn slide_notes(archive: &mut Archive<'_>, slide_path: &str) -> Vec<String> {
    let Some((dir, file)) = slide_path.rsplit_once('/') else {
        return Vec::new();
    };
    let rels = read_relationships(archive, &format!("{}/_rels/{}.rels", dir, file), dir);
    let Some(notes_path) = rels.values().find(|t| t.contains("notesSlide")).cloned() else {
        return Vec::new();
    };
    let Ok(notes) = read_xml(archive, &notes_path) else {
        return Vec::new();
    };
    let mut shapes = Vec::new();
    notes.find_all("sp", &mut shapes);
    shapes
        .into_iter()
        .filter(|s| {
            s.find("ph")
                .and_then(|ph| ph.attr("type"))
                .map(|t| t == "body")
                .unwrap_or(false)
        })
        .flat_map(text_body_lines)
        .collect()
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    if !has_entry(archive, "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let root = read_xml(archive, "xl/sharedStrings.xml")?;
    Ok(root.children_named("si").map(|si| si.run_text()).collect())
}

/// Workbook sheets as `(name, zip path)` in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> Vec<(String, String)> {
    let rels = read_relationships(archive, "xl/_rels/workbook.xml.rels", "xl");
    let workbook = if has_entry(archive, "xl/workbook.xml") {
        read_xml(archive, "xl/workbook.xml").ok()
    } else {
        None
    };

    let mut sheets = Vec::new();
    if let Some(wb) = workbook {
        let mut nodes = Vec::new();
        wb.find_all("sheet", &mut nodes);
        for node in nodes {
            let name = node.attr("name").unwrap_or("Sheet").to_string();
            if let Some(path) = node.attr("r:id").and_then(|id| rels.get(id)) {
                sheets.push((name, path.clone()));
            }
        }
    }
    if sheets.is_empty() {
        sheets = numbered_entries(archive, "xl/worksheets/sheet")
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("Sheet{}", i + 1), p))
            .collect();
    }
    sheets
}

/// Zero-based column index from a cell reference such as `AB12`. `None`
/// for references without letters or past column XFD.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: Vec<char> = cell_ref
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .take(4)
        .collect();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let idx = letters.iter().fold(0usize, |acc, c| {
        acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
    });
    (idx <= XLSX_MAX_COLUMNS).then(|| idx - 1)
}

fn sheet_rows(sheet: &XmlNode, shared: &[String]) -> Vec<Vec<String>> {
    let Some(data) = sheet.find("sheetData") else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    let mut cells_seen = 0usize;
    let mut grid_cells = 0usize;
    for row in data.children_named("row") {
        let mut cells: Vec<String> = Vec::new();
        for cell in row.children_named("c") {
            if cells_seen >= XLSX_MAX_CELLS_PER_SHEET {
                break;
            }
            cells_seen += 1;
            let raw = cell.child("v").map(|v| v.text.trim().to_string());
            let value = match cell.attr("t") {
                Some("s") => raw
                    .and_then(|v| v.parse::<usize>().ok())
                    .and_then(|i| shared.get(i).cloned())
                    .unwrap_or_default(),
                Some("inlineStr") => cell.child("is").map(|is| is.run_text()).unwrap_or_default(),
                Some("b") => match raw.as_deref() {
                    Some("1") => "TRUE".to_string(),
                    Some(_) => "FALSE".to_string(),
                    None => String::new(),
                },
                _ => raw.unwrap_or_default(),
            };
            let mut col = cell
                .attr("r")
                .and_then(column_index)
                .unwrap_or(cells.len());
            if col >= cells.len() {
                if grid_cells + (col + 1 - cells.len()) > XLSX_MAX_GRID_CELLS {
                    col = cells.len();
                }
                grid_cells += col + 1 - cells.len();
                cells.resize(col + 1, String::new());
            }
            cells[col] = value.replace('\n', " ");
        }
        if cells.iter().any(|c| !c.trim().is_empty()) {
            rows.push(cells);
        }
    }
    let width = rows
        .iter()
        .map(|r| r.len())
        .max()
        .unwrap_or(0)
        .min(XLSX_MAX_GRID_CELLS / rows.len().max(1));
    for r in &mut rows {
        r.resize(width, String::new());
    }
    rows
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive);

    let mut pages = Vec::new();
    for (idx, (name, path)) in sheets.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet = read_xml(&mut archive, &path)?;
        let rows = sheet_rows(&sheet, &shared);
        if rows.is_empty() {
            continue;
        }
        let table = markdown_table(&rows);
        let lines: Vec<String> = table.lines().map(str::to_string).collect();
        pages.push(virtual_page(idx as u32 + 1, &lines, Some(name)));
    }

    if pages.is_empty() {
        return Ok(placeholder_page("(empty spreadsheet)"));
    }
    Ok(pages)
}
