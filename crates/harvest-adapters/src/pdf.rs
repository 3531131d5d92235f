// SPDX-License-Identifier: MIT OR Apache-2.0
//! PDF text and table extraction.

use std::collections::BTreeMap;

/// The PDF interface the engine sees.
pub trait PdfExtractor: Send + Sync {
    /// Extract plain text from PDF bytes.
    fn extract_pdf_text(&self, bytes: &[u8]) -> String;

    /// Split extracted text into table rows (cells per row).
    fn extract_tables(&self, text: &str) -> Vec<Vec<String>>;

    /// Interpret rows as a two-column spec table.
    fn parse_pdf_spec_table(&self, tables: &[Vec<String>]) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for row in tables {
            if let [label, value, ..] = row.as_slice()
                && !label.trim().is_empty()
                && !value.trim().is_empty()
            {
                out.insert(
                    label.trim().trim_end_matches(':').to_lowercase(),
                    value.trim().to_string(),
                );
            }
        }
        out
    }
}

/// Treats the PDF bytes as UTF-8 text; rows split on 2+ spaces or tabs.
/// Stands in for a real extractor in tests and smoke runs.
#[derive(Debug, Default)]
pub struct PlainTextPdf;

impl PdfExtractor for PlainTextPdf {
    fn extract_pdf_text(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn extract_tables(&self, text: &str) -> Vec<Vec<String>> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split('\t')
                    .flat_map(|part| part.split("  "))
                    .map(str::trim)
                    .filter(|cell| !cell.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|cells: &Vec<String>| cells.len() >= 2)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_sheet_round_trip() {
        let pdf = PlainTextPdf;
        let text = pdf.extract_pdf_text(b"Weight:  54 g\nSensor:\tFocus Pro 35K\nJust prose\n");
        let tables = pdf.extract_tables(&text);
        assert_eq!(tables.len(), 2);
        let spec = pdf.parse_pdf_spec_table(&tables);
        assert_eq!(spec["weight"], "54 g");
        assert_eq!(spec["sensor"], "Focus Pro 35K");
    }

    #[test]
    fn single_column_lines_are_not_rows() {
        let pdf = PlainTextPdf;
        let tables = pdf.extract_tables("one-cell-line\nanother");
        assert!(tables.is_empty());
    }
}
