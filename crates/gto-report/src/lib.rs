//! GTO report layout + PDF rendering.
//!
//! The report is first built as a flat list of [`Block`]s so its content can
//! be inspected without parsing PDF output, then painted onto US Letter pages.

use std::io::{BufWriter, Cursor};
use std::path::Path;

use anyhow::Context;
use gto_core::{
    Property, Recommendation, MARKET_ANALYSIS_FILE, PROPERTIES_FILE, RECOMMENDATIONS_FILE,
};
use gto_storage::{read_json_file, read_text_file, ArtifactStore};
use printpdf::{
    BuiltinFont, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
    Point,
};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "gto-report";

pub const REPORT_TITLE: &str = "GTO Real Estate Investment Report";
pub const EXECUTIVE_SUMMARY_HEADING: &str = "Executive Summary";
pub const MARKET_ANALYSIS_HEADING: &str = "Market Intelligence Analysis";
pub const RECOMMENDATIONS_HEADING: &str = "GTO Recommendations";
pub const SNAPSHOT_HEADING: &str = "Raw Property Data (Top 5)";
pub const FORECAST_HEADING: &str = "Strategic Forecast Notes";

pub const EXECUTIVE_SUMMARY_TEXT: &str =
    "This report provides a Game Theory Optimal (GTO) analysis of NYC commercial properties...";
pub const FORECAST_TEXT: &str =
    "Add your own notes here based on future outlook, assumptions, or team discussion.";

pub const MISSING_FIELD: &str = "N/A";
pub const RATIONALE_MAX_CHARS: usize = 100;
pub const SNAPSHOT_PROPERTIES: usize = 5;

pub const TABLE_HEADERS: [&str; 4] = ["Property ID", "Score", "Recommendation", "Rationale"];
pub const TABLE_COLUMN_WIDTHS_PT: [f32; 4] = [100.0, 50.0, 80.0, 250.0];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("pdf backend error: {0}")]
    Pdf(String),
    #[error("flushing pdf buffer: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub column_widths_pt: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Title(String),
    Heading(String),
    Paragraph(String),
    /// `label: value` pairs with the label set in bold.
    Labeled(Vec<(String, String)>),
    Table(Table),
    Spacer(f32),
    PageBreak,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportDocument {
    pub blocks: Vec<Block>,
}

impl ReportDocument {
    /// Blocks between the named heading and the next heading.
    pub fn section(&self, heading: &str) -> &[Block] {
        let Some(start) = self
            .blocks
            .iter()
            .position(|b| matches!(b, Block::Heading(h) if h == heading))
        else {
            return &[];
        };
        let body = &self.blocks[start + 1..];
        let end = body
            .iter()
            .position(|b| matches!(b, Block::Heading(_)))
            .unwrap_or(body.len());
        &body[..end]
    }

    pub fn section_text(&self, heading: &str) -> String {
        self.section(heading)
            .iter()
            .filter_map(|b| match b {
                Block::Paragraph(text) => Some(text.clone()),
                Block::Labeled(pairs) => Some(
                    pairs
                        .iter()
                        .map(|(k, v)| format!("{k} {v}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn recommendation_table(&self) -> Option<&Table> {
        self.section(RECOMMENDATIONS_HEADING).iter().find_map(|b| match b {
            Block::Table(t) => Some(t),
            _ => None,
        })
    }
}

/// The three persisted pipeline artifacts the report is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportInputs {
    pub market_analysis: String,
    pub recommendations: Vec<Recommendation>,
    pub properties: Vec<Property>,
}

impl ReportInputs {
    pub async fn load(dir: &Path) -> anyhow::Result<Self> {
        let market_analysis = read_text_file(dir.join(MARKET_ANALYSIS_FILE)).await?;
        let recommendations = read_json_file(dir.join(RECOMMENDATIONS_FILE)).await?;
        let properties = read_json_file(dir.join(PROPERTIES_FILE)).await?;
        Ok(Self {
            market_analysis,
            recommendations,
            properties,
        })
    }

    pub fn layout(&self) -> ReportDocument {
        build_layout(&self.market_analysis, &self.recommendations, &self.properties)
    }
}

pub fn build_layout(
    market_analysis: &str,
    recommendations: &[Recommendation],
    properties: &[Property],
) -> ReportDocument {
    let mut blocks = vec![
        Block::Title(REPORT_TITLE.into()),
        Block::Spacer(12.0),
        Block::Heading(EXECUTIVE_SUMMARY_HEADING.into()),
        Block::Paragraph(EXECUTIVE_SUMMARY_TEXT.into()),
        Block::Spacer(12.0),
        Block::Heading(MARKET_ANALYSIS_HEADING.into()),
    ];

    for line in market_analysis.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blocks.push(Block::Spacer(6.0));
        } else {
            blocks.push(Block::Paragraph(line.to_string()));
        }
    }
    blocks.push(Block::PageBreak);

    blocks.push(Block::Heading(RECOMMENDATIONS_HEADING.into()));
    blocks.push(Block::Table(Table {
        headers: TABLE_HEADERS.iter().map(|h| h.to_string()).collect(),
        rows: recommendations.iter().map(recommendation_row).collect(),
        column_widths_pt: TABLE_COLUMN_WIDTHS_PT.to_vec(),
    }));
    blocks.push(Block::PageBreak);

    blocks.push(Block::Heading(SNAPSHOT_HEADING.into()));
    for property in properties.iter().take(SNAPSHOT_PROPERTIES) {
        blocks.push(Block::Labeled(property_snapshot(property)));
        blocks.push(Block::Spacer(10.0));
    }

    blocks.push(Block::PageBreak);
    blocks.push(Block::Heading(FORECAST_HEADING.into()));
    blocks.push(Block::Paragraph(FORECAST_TEXT.into()));

    ReportDocument { blocks }
}

pub fn recommendation_row(rec: &Recommendation) -> Vec<String> {
    vec![
        rec.property_id.clone().unwrap_or_else(|| MISSING_FIELD.into()),
        rec.gto_score
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| MISSING_FIELD.into()),
        rec.recommendation.clone().unwrap_or_else(|| MISSING_FIELD.into()),
        truncate_rationale(rec.rationale.as_deref().unwrap_or(MISSING_FIELD)),
    ]
}

/// First 100 characters plus an ellipsis marker, always appended.
pub fn truncate_rationale(rationale: &str) -> String {
    let mut out: String = rationale.chars().take(RATIONALE_MAX_CHARS).collect();
    out.push_str("...");
    out
}

pub fn property_snapshot(property: &Property) -> Vec<(String, String)> {
    vec![
        ("Address:".into(), property.address.clone()),
        ("SqFt:".into(), property.square_footage.to_string()),
        ("Price/SF:".into(), format!("${}", property.price_per_sqft)),
        ("Sale Price:".into(), format!("${}", thousands(property.sale_price))),
        ("Cap Rate:".into(), format!("{}%", property.cap_rate)),
    ]
}

pub fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Map text onto the ASCII subset the built-in Helvetica faces render reliably.
pub fn pdf_safe_text(text: &str) -> String {
    text.chars()
        .filter_map(|ch| match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => Some('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => Some('"'),
            '\u{2010}'..='\u{2015}' | '\u{2212}' => Some('-'),
            '\u{2022}' | '\u{25CF}' | '\u{25AA}' => Some('*'),
            '\u{00A0}' | '\t' => Some(' '),
            '\u{2026}' => Some('.'),
            c if c.is_control() => None,
            c if c.is_ascii() => Some(c),
            _ => Some('?'),
        })
        .collect()
}

/// Helvetica advance widths (1/1000 em) for ' '..='~', from the standard AFM metrics.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556,
    278, 278, 584, 584, 584, 556, 1015,
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833,
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611,
    278, 278, 278, 469, 556, 333,
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833,
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500,
    334, 260, 334, 584,
];

const HELVETICA_BOLD_WIDTHS: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556,
    333, 333, 584, 584, 584, 611, 975,
    722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833,
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611,
    333, 278, 333, 584, 556, 333,
    556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889,
    611, 611, 611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500,
    389, 280, 389, 584,
];

/// Width of `text` in points when set in Helvetica (or Helvetica-Bold) at `size`.
pub fn text_width_pt(text: &str, size: f32, bold: bool) -> f32 {
    let table = if bold { &HELVETICA_BOLD_WIDTHS } else { &HELVETICA_WIDTHS };
    let units: u32 = text
        .chars()
        .map(|ch| match ch {
            ' '..='~' => u32::from(table[ch as usize - 0x20]),
            _ => 556,
        })
        .sum();
    units as f32 * size / 1000.0
}

/// Greedy word wrap so no line is wider than `max_width_pt`; over-long words are split.
pub fn wrap_to_width(text: &str, max_width_pt: f32, size: f32, bold: bool) -> Vec<String> {
    let fits = |line: &str| text_width_pt(line, size, bold) <= max_width_pt;
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if fits(&candidate) {
            current = candidate;
            continue;
        }
        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        for ch in word.chars() {
            current.push(ch);
            if !fits(&current) && current.chars().count() > 1 {
                current.pop();
                lines.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Largest size up to `max_size` at which `text` fits on one line of `width_pt`.
pub fn fit_font_size(text: &str, width_pt: f32, max_size: f32, bold: bool) -> f32 {
    let natural = text_width_pt(text, max_size, bold);
    if natural <= width_pt || natural <= 0.0 {
        max_size
    } else {
        max_size * width_pt / natural
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPdf {
    pub bytes: Vec<u8>,
    pub page_count: usize,
}

pub fn render_pdf(doc: &ReportDocument) -> Result<RenderedPdf, ReportError> {
    let mut painter = PdfPainter::new(REPORT_TITLE)?;
    for block in &doc.blocks {
        painter.block(block);
    }
    painter.finish()
}

/// Load the persisted artifacts from `inputs_dir` and write the PDF to `output_path`.
pub async fn create_pdf(inputs_dir: &Path, output_path: &Path) -> anyhow::Result<ReportDocument> {
    let inputs = ReportInputs::load(inputs_dir).await?;
    let layout = inputs.layout();
    let rendered = render_pdf(&layout).context("rendering report pdf")?;

    let parent = output_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = output_path
        .file_name()
        .with_context(|| format!("report path {} has no file name", output_path.display()))?
        .to_string_lossy();
    ArtifactStore::new(parent)
        .store_bytes(parent, &name, &rendered.bytes)
        .await?;
    info!(path = %output_path.display(), pages = rendered.page_count, "pdf report generated");
    Ok(layout)
}

const PAGE_WIDTH_PT: f32 = 612.0;
const PAGE_HEIGHT_PT: f32 = 792.0;
const MARGIN_PT: f32 = 72.0;
const CELL_PADDING_PT: f32 = 4.0;
const HEADER_BOTTOM_PADDING_PT: f32 = 12.0;

#[derive(Debug, Clone, Copy)]
struct TextStyle {
    size: f32,
    leading: f32,
    space_after: f32,
    bold: bool,
}

const TITLE_STYLE: TextStyle = TextStyle { size: 16.0, leading: 20.0, space_after: 12.0, bold: true };
const HEADING_STYLE: TextStyle = TextStyle { size: 12.0, leading: 16.0, space_after: 10.0, bold: true };
const BODY_STYLE: TextStyle = TextStyle { size: 10.0, leading: 12.0, space_after: 6.0, bold: false };
const TABLE_STYLE: TextStyle = TextStyle { size: 9.0, leading: 11.0, space_after: 0.0, bold: false };

fn mm(pt: f32) -> Mm {
    Mm(pt * 25.4 / 72.0)
}

fn pdf_err(err: impl std::fmt::Debug) -> ReportError {
    ReportError::Pdf(format!("{err:?}"))
}

struct PdfPainter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    cursor: f32,
    page_count: usize,
}

impl PdfPainter {
    fn new(title: &str) -> Result<Self, ReportError> {
        let (doc, page, layer) =
            PdfDocument::new(title, mm(PAGE_WIDTH_PT), mm(PAGE_HEIGHT_PT), "Layer 1");
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_err)?;
        let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_err)?;
        let layer = doc.get_page(page).get_layer(layer);
        layer.set_outline_thickness(0.5);
        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            cursor: PAGE_HEIGHT_PT - MARGIN_PT,
            page_count: 1,
        })
    }

    fn at_page_top(&self) -> bool {
        self.cursor >= PAGE_HEIGHT_PT - MARGIN_PT
    }

    fn new_page(&mut self) {
        let (page, layer) = self
            .doc
            .add_page(mm(PAGE_WIDTH_PT), mm(PAGE_HEIGHT_PT), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.layer.set_outline_thickness(0.5);
        self.cursor = PAGE_HEIGHT_PT - MARGIN_PT;
        self.page_count += 1;
    }

    fn ensure_space(&mut self, height: f32) {
        if self.cursor - height < MARGIN_PT && !self.at_page_top() {
            self.new_page();
        }
    }

    fn text_at(&self, text: &str, size: f32, x: f32, baseline: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer
            .use_text(pdf_safe_text(text), size, mm(x), mm(baseline), font);
    }

    fn rule(&self, x1: f32, y1: f32, x2: f32, y2: f32) {
        self.layer.add_line(Line {
            points: vec![
                (Point::new(mm(x1), mm(y1)), false),
                (Point::new(mm(x2), mm(y2)), false),
            ],
            is_closed: false,
        });
    }

    fn block(&mut self, block: &Block) {
        match block {
            Block::Title(text) => self.paragraph(text, TITLE_STYLE),
            Block::Heading(text) => self.paragraph(text, HEADING_STYLE),
            Block::Paragraph(text) => self.paragraph(text, BODY_STYLE),
            Block::Labeled(pairs) => self.labeled(pairs),
            Block::Table(table) => self.table(table),
            Block::Spacer(height) => {
                if !self.at_page_top() {
                    self.cursor -= height;
                }
            }
            Block::PageBreak => {
                if !self.at_page_top() {
                    self.new_page();
                }
            }
        }
    }

    fn paragraph(&mut self, text: &str, style: TextStyle) {
        let width = PAGE_WIDTH_PT - 2.0 * MARGIN_PT;
        for line in wrap_to_width(&pdf_safe_text(text), width, style.size, style.bold) {
            self.ensure_space(style.leading);
            self.text_at(&line, style.size, MARGIN_PT, self.cursor - style.size, style.bold);
            self.cursor -= style.leading;
        }
        self.cursor -= style.space_after;
    }

    fn labeled(&mut self, pairs: &[(String, String)]) {
        let style = BODY_STYLE;
        self.ensure_space(style.leading * pairs.len() as f32);
        for (label, value) in pairs {
            self.ensure_space(style.leading);
            let baseline = self.cursor - style.size;
            self.text_at(label, style.size, MARGIN_PT, baseline, true);
            let offset = text_width_pt(&pdf_safe_text(label), style.size, true) + 4.0;
            self.text_at(value, style.size, MARGIN_PT + offset, baseline, false);
            self.cursor -= style.leading;
        }
        self.cursor -= style.space_after;
    }

    fn table(&mut self, table: &Table) {
        let total_width: f32 = table.column_widths_pt.iter().sum();
        let left = (PAGE_WIDTH_PT - total_width) / 2.0;

        self.table_row(table, left, &table.headers, true);
        for row in &table.rows {
            let lines = layout_cells(table, row, false);
            let height = row_height(&lines, false);
            if self.cursor - height < MARGIN_PT {
                self.new_page();
                self.table_row(table, left, &table.headers, true);
            }
            self.paint_row(table, left, &lines, false);
        }
        self.cursor -= BODY_STYLE.space_after;
    }

    fn table_row(&mut self, table: &Table, left: f32, cells: &[String], header: bool) {
        let lines = layout_cells(table, cells, header);
        self.ensure_space(row_height(&lines, header));
        self.paint_row(table, left, &lines, header);
    }

    fn paint_row(&mut self, table: &Table, left: f32, lines: &[CellText], header: bool) {
        let height = row_height(lines, header);
        let top = self.cursor;
        let bottom = top - height;

        let mut x = left;
        for (cell, width) in lines.iter().zip(&table.column_widths_pt) {
            let mut baseline = top - CELL_PADDING_PT - TABLE_STYLE.size;
            for line in &cell.lines {
                self.text_at(line, cell.size, x + CELL_PADDING_PT, baseline, header);
                baseline -= TABLE_STYLE.leading;
            }
            self.rule(x, top, x, bottom);
            x += width;
        }
        self.rule(x, top, x, bottom);
        self.rule(left, top, x, top);
        self.rule(left, bottom, x, bottom);

        self.cursor = bottom;
    }

    fn finish(self) -> Result<RenderedPdf, ReportError> {
        let page_count = self.page_count;
        let mut writer = BufWriter::new(Cursor::new(Vec::new()));
        self.doc.save(&mut writer).map_err(pdf_err)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| ReportError::Io(e.into_error()))?
            .into_inner();
        Ok(RenderedPdf { bytes, page_count })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CellText {
    lines: Vec<String>,
    size: f32,
}

/// Header labels stay on one line and shrink to fit; body cells wrap at the table size.
fn layout_cells(table: &Table, cells: &[String], header: bool) -> Vec<CellText> {
    cells
        .iter()
        .zip(&table.column_widths_pt)
        .map(|(cell, width)| {
            let text = pdf_safe_text(cell);
            let available = width - 2.0 * CELL_PADDING_PT;
            if header {
                CellText {
                    size: fit_font_size(&text, available, TABLE_STYLE.size, true),
                    lines: vec![text],
                }
            } else {
                CellText {
                    lines: wrap_to_width(&text, available, TABLE_STYLE.size, false),
                    size: TABLE_STYLE.size,
                }
            }
        })
        .collect()
}

fn row_height(lines: &[CellText], header: bool) -> f32 {
    let max_lines = lines.iter().map(|c| c.lines.len()).max().unwrap_or(1).max(1) as f32;
    let bottom_padding = if header {
        HEADER_BOTTOM_PADDING_PT
    } else {
        CELL_PADDING_PT
    };
    max_lines * TABLE_STYLE.leading + CELL_PADDING_PT + bottom_padding
}
