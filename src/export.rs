//! Tabular PDF export of a call's applications.

use std::panic;

use pdfium_render::prelude::*;
use thiserror::Error;

const PAGE_TOP: f32 = 800.0;
const PAGE_BOTTOM: f32 = 50.0;
const LEFT_MARGIN: f32 = 40.0;
const LINE_HEIGHT: f32 = 16.0;
const TITLE_SIZE: f32 = 16.0;
const BODY_SIZE: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct ExportRow {
    pub applicant: String,
    pub status: String,
    pub submitted_at: Option<String>,
    pub attachment_count: i64,
    pub review_count: i64,
    pub average_score: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("pdf renderer unavailable")]
    RendererUnavailable,
    #[error("pdf rendering failed: {0}")]
    Render(String),
}

pub fn format_row(row: &ExportRow) -> String {
    let average = row
        .average_score
        .map(|score| format!("{score:.1}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} | {} | submitted {} | {} attachment(s) | {} review(s) | avg {}",
        row.applicant,
        row.status,
        row.submitted_at.as_deref().unwrap_or("-"),
        row.attachment_count,
        row.review_count,
        average
    )
}

/// Lines grouped per page; the first page reserves room for the title.
pub fn paginate(lines: &[String]) -> Vec<Vec<String>> {
    let per_page = ((PAGE_TOP - PAGE_BOTTOM) / LINE_HEIGHT) as usize;
    let first_page = per_page.saturating_sub(2).max(1);

    let mut pages = Vec::new();
    let mut rest = lines;
    let mut capacity = first_page;
    loop {
        let take = capacity.min(rest.len());
        pages.push(rest[..take].to_vec());
        rest = &rest[take..];
        if rest.is_empty() {
            break;
        }
        capacity = per_page;
    }
    pages
}

/// Renders the export. Blocking: call from `spawn_blocking`.
pub fn render_applications_pdf(title: &str, rows: &[ExportRow]) -> Result<Vec<u8>, ExportError> {
    let pdfium = panic::catch_unwind(Pdfium::default).map_err(|_| ExportError::RendererUnavailable)?;

    let lines: Vec<String> = if rows.is_empty() {
        vec!["No applications.".to_string()]
    } else {
        rows.iter().map(format_row).collect()
    };

    let mut document = pdfium
        .create_new_pdf()
        .map_err(|err| ExportError::Render(format!("create document: {err}")))?;
    let font = document.fonts_mut().helvetica();
    let bold = document.fonts_mut().helvetica_bold();

    for (index, page_lines) in paginate(&lines).iter().enumerate() {
        let mut page = document
            .pages_mut()
            .create_page_at_end(PdfPagePaperSize::a4())
            .map_err(|err| ExportError::Render(format!("create page: {err}")))?;

        let mut y = PAGE_TOP;
        if index == 0 {
            page.objects_mut()
                .create_text_object(
                    PdfPoints::new(LEFT_MARGIN),
                    PdfPoints::new(y),
                    title,
                    bold,
                    PdfPoints::new(TITLE_SIZE),
                )
                .map_err(|err| ExportError::Render(format!("write title: {err}")))?;
            y -= LINE_HEIGHT * 2.0;
        }

        for line in page_lines {
            page.objects_mut()
                .create_text_object(
                    PdfPoints::new(LEFT_MARGIN),
                    PdfPoints::new(y),
                    line,
                    font,
                    PdfPoints::new(BODY_SIZE),
                )
                .map_err(|err| ExportError::Render(format!("write line: {err}")))?;
            y -= LINE_HEIGHT;
        }
    }

    document
        .save_to_bytes()
        .map_err(|err| ExportError::Render(format!("save document: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(score: Option<f64>) -> ExportRow {
        ExportRow {
            applicant: "ada@example.org".into(),
            status: "submitted".into(),
            submitted_at: Some("2024-03-01 10:00".into()),
            attachment_count: 2,
            review_count: 3,
            average_score: score,
        }
    }

    #[test]
    fn rows_render_one_line_each() {
        assert_eq!(
            format_row(&row(Some(72.333))),
            "ada@example.org | submitted | submitted 2024-03-01 10:00 | 2 attachment(s) | 3 review(s) | avg 72.3"
        );
        assert!(format_row(&row(None)).ends_with("avg -"));
    }

    #[test]
    fn pagination_keeps_every_line() {
        let lines: Vec<String> = (0..120).map(|i| format!("line {i}")).collect();
        let pages = paginate(&lines);
        assert!(pages.len() > 1);
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 120);
        assert!(pages[0].len() < pages[1].len());
        assert_eq!(pages.concat(), lines);
    }

    #[test]
    fn empty_input_still_yields_a_page() {
        assert_eq!(paginate(&[]), vec![Vec::<String>::new()]);
    }
}
