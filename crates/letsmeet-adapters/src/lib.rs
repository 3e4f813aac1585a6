//! Source adapter contracts + loaders for the three Let's Meet source shapes.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Days, NaiveDate};
use letsmeet_core::parse::{
    clean_text, extract_hobbies, normalize_phone, parse_address, parse_date, split_name,
    DATE_FORMAT,
};
use letsmeet_core::{ContactDraft, HobbyDraft, ImportDraft, PersonDraft, RecordOrigin, SourceKind};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "letsmeet-adapters";

/// Number of positional columns in the spreadsheet export.
pub const TABULAR_COLUMNS: usize = 8;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Map the raw source bytes to drafts. `path` only names the source.
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<ImportDraft>, AdapterError>;

    /// Load the whole source and map every record to a draft.
    fn read(&self, path: &Path) -> Result<Vec<ImportDraft>, AdapterError> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        self.parse(path, &bytes)
    }
}

pub fn adapter_for(source_id: &str, kind: SourceKind) -> Box<dyn SourceAdapter> {
    let source_id = source_id.to_string();
    match kind {
        SourceKind::Tabular => Box::new(TabularSheetAdapter { source_id }),
        SourceKind::Document => Box::new(DocumentDumpAdapter { source_id }),
        SourceKind::Hierarchical => Box::new(HobbyCatalogAdapter { source_id }),
    }
}

fn origin(source_id: &str, position: usize) -> RecordOrigin {
    RecordOrigin {
        source_id: source_id.to_string(),
        position,
    }
}

// ---------------------------------------------------------------------------
// Tabular
// ---------------------------------------------------------------------------

/// One spreadsheet row, columns in export order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularRow {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub hobbies: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub interested_in: Option<String>,
    pub birth_date: Option<String>,
}

impl TabularRow {
    /// Positional mapping; missing trailing cells are absent, extra cells ignored.
    pub fn from_cells(cells: Vec<Option<String>>) -> Self {
        let mut cells = cells.into_iter();
        let mut next = || cells.next().flatten();
        Self {
            name: next(),
            address: next(),
            phone: next(),
            hobbies: next(),
            email: next(),
            gender: next(),
            interested_in: next(),
            birth_date: next(),
        }
    }

    fn is_empty(&self) -> bool {
        [
            &self.name,
            &self.address,
            &self.phone,
            &self.hobbies,
            &self.email,
            &self.gender,
            &self.interested_in,
            &self.birth_date,
        ]
        .iter()
        .all(|cell| cell.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

pub fn parse_tabular_row(source_id: &str, position: usize, row: &TabularRow) -> PersonDraft {
    PersonDraft {
        origin: origin(source_id, position),
        name: split_name(row.name.as_deref()),
        address: parse_address(row.address.as_deref()),
        phone: normalize_phone(row.phone.as_deref()),
        email: clean_text(row.email.as_deref()),
        gender: clean_text(row.gender.as_deref()),
        interested_in: clean_text(row.interested_in.as_deref()),
        birth_date: parse_date(row.birth_date.as_deref()),
        hobbies: extract_hobbies(row.hobbies.as_deref()),
    }
}

#[derive(Debug, Clone)]
pub struct TabularSheetAdapter {
    source_id: String,
}

impl TabularSheetAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl SourceAdapter for TabularSheetAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Tabular
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<ImportDraft>, AdapterError> {
        let rows = tabular_rows_from_bytes(path, bytes)?;
        Ok(rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.is_empty())
            .map(|(idx, row)| ImportDraft::Person(parse_tabular_row(&self.source_id, idx + 1, row)))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabularFormat {
    Csv,
    Workbook,
}

fn tabular_format(path: &Path) -> Result<TabularFormat, AdapterError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(TabularFormat::Csv),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(TabularFormat::Workbook),
        other => Err(AdapterError::Message(format!(
            "unsupported tabular source extension '{other}' for {}",
            path.display()
        ))),
    }
}

/// Read data rows (header skipped) from a workbook or a CSV export.
pub fn load_tabular_rows(path: &Path) -> Result<Vec<TabularRow>, AdapterError> {
    tabular_format(path)?;
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    tabular_rows_from_bytes(path, &bytes)
}

/// Same as [`load_tabular_rows`] for bytes already in memory; the extension of `path` picks the format.
pub fn tabular_rows_from_bytes(path: &Path, bytes: &[u8]) -> Result<Vec<TabularRow>, AdapterError> {
    match tabular_format(path)? {
        TabularFormat::Csv => csv_rows(path, bytes),
        TabularFormat::Workbook => workbook_rows(path, bytes),
    }
}

fn csv_rows(path: &Path, bytes: &[u8]) -> Result<Vec<TabularRow>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading {} record {}", path.display(), idx + 1))?;
        let cells = record
            .iter()
            .take(TABULAR_COLUMNS)
            .map(|cell| Some(cell.to_string()).filter(|s| !s.is_empty()))
            .collect();
        rows.push(TabularRow::from_cells(cells));
    }
    Ok(rows)
}

fn workbook_rows(path: &Path, bytes: &[u8]) -> Result<Vec<TabularRow>, AdapterError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .with_context(|| format!("opening workbook {}", path.display()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AdapterError::Message(format!("{} contains no sheets", path.display())))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("reading sheet '{sheet_name}' of {}", path.display()))?;

    // First row holds the column headers.
    Ok(range
        .rows()
        .skip(1)
        .map(|row| {
            TabularRow::from_cells(row.iter().take(TABULAR_COLUMNS).map(cell_text).collect())
        })
        .collect())
}

/// Render a workbook cell the way the field parsers expect it as text.
pub fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
            Some(s.clone()).filter(|s| !s.is_empty())
        }
        Data::Float(n) => Some(if n.fract() == 0.0 && n.abs() < 1e15 {
            format!("{}", *n as i64)
        } else {
            format!("{n}")
        }),
        Data::Int(n) => Some(n.to_string()),
        Data::Bool(b) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()).map(|d| d.format(DATE_FORMAT).to_string()),
    }
}

/// 1900 date system; serials before 1900-03-01 are not supported.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 61.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.floor() as u64))
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// One document of the user collection dump.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonDocument {
    #[serde(rename = "_id", default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub name: Option<JsonValue>,
    #[serde(default)]
    pub phone: Option<JsonValue>,
    #[serde(default)]
    pub friends: Vec<JsonValue>,
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_person_document(source_id: &str, position: usize, doc: &PersonDocument) -> ContactDraft {
    let text = |v: &Option<JsonValue>| v.as_ref().and_then(json_text);
    ContactDraft {
        origin: origin(source_id, position),
        name: split_name(text(&doc.name).as_deref()),
        phone: normalize_phone(text(&doc.phone).as_deref()),
        email: clean_text(text(&doc.id).as_deref()),
        friends: doc
            .friends
            .iter()
            .map(|f| json_text(f).map(|s| s.trim().to_string()).unwrap_or_default())
            .collect(),
    }
}

/// Parse a collection dump: a JSON array or one document per line.
pub fn parse_document_dump(text: &str) -> Result<Vec<PersonDocument>, AdapterError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| AdapterError::Message(format!("invalid document array: {e}")));
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|e| AdapterError::Message(format!("invalid document at line {}: {e}", idx + 1)))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DocumentDumpAdapter {
    source_id: String,
}

impl DocumentDumpAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl SourceAdapter for DocumentDumpAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Document
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<ImportDraft>, AdapterError> {
        let text = std::str::from_utf8(bytes).with_context(|| format!("decoding {}", path.display()))?;
        let docs = parse_document_dump(text)?;
        Ok(docs
            .iter()
            .enumerate()
            .map(|(idx, doc)| ImportDraft::Contact(parse_person_document(&self.source_id, idx + 1, doc)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Hierarchical
// ---------------------------------------------------------------------------

pub const HOBBY_ELEMENT: &[u8] = b"hobby";

fn xml_error(err: impl std::fmt::Display, reader: &quick_xml::Reader<&[u8]>) -> AdapterError {
    AdapterError::Message(format!(
        "invalid hobby markup at byte {}: {err}",
        reader.buffer_position()
    ))
}

/// Own text (including CDATA) of every `<hobby>` child of the root element, in document order.
///
/// Element names are matched case-sensitively; deeper `<hobby>` elements are ignored.
pub fn parse_hobby_catalog(markup: &str) -> Result<Vec<String>, AdapterError> {
    let mut reader = quick_xml::Reader::from_str(markup);
    let mut names = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(e, &reader))?;
        match event {
            Event::Start(ref e) => {
                depth += 1;
                if depth == 2 && e.name().as_ref() == HOBBY_ELEMENT {
                    current = Some(String::new());
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some(text) = current.take() {
                        names.extend(clean_text(Some(text.as_str())));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(ref e) if depth == 2 => {
                if let Some(text) = current.as_mut() {
                    text.push_str(&e.decode().map_err(|err| xml_error(err, &reader))?);
                }
            }
            Event::CData(ref e) if depth == 2 => {
                if let Some(text) = current.as_mut() {
                    text.push_str(&e.decode().map_err(|err| xml_error(err, &reader))?);
                }
            }
            Event::GeneralRef(ref e) if depth == 2 => {
                if let Some(text) = current.as_mut() {
                    if let Some(ch) = e.resolve_char_ref().map_err(|err| xml_error(err, &reader))? {
                        text.push(ch);
                    } else {
                        let name = e.decode().map_err(|err| xml_error(err, &reader))?;
                        let resolved = resolve_predefined_entity(&name)
                            .ok_or_else(|| xml_error(format!("unknown entity &{name};"), &reader))?;
                        text.push_str(resolved);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct HobbyCatalogAdapter {
    source_id: String,
}

impl HobbyCatalogAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl SourceAdapter for HobbyCatalogAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Hierarchical
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<ImportDraft>, AdapterError> {
        let markup = std::str::from_utf8(bytes).with_context(|| format!("decoding {}", path.display()))?;
        Ok(parse_hobby_catalog(markup)?
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                ImportDraft::Hobby(HobbyDraft {
                    origin: origin(&self.source_id, idx + 1),
                    name,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letsmeet_core::HobbyPriority;

    fn row(cells: &[&str]) -> TabularRow {
        TabularRow::from_cells(
            cells
                .iter()
                .map(|c| Some(c.to_string()).filter(|s| !s.is_empty()))
                .collect(),
        )
    }

    #[test]
    fn tabular_row_maps_columns_positionally() {
        let r = row(&[
            "Müller, Hans",
            "Hauptstr. 12, 10115, Berlin",
            "+49 (030) 123-456",
            "Chess%1%;Reading",
            " hans@example.org ",
            "m",
            "w",
            "07.03.1991",
        ]);
        let draft = parse_tabular_row("sheet", 1, &r);
        assert_eq!(draft.origin.to_string(), "sheet#1");
        assert_eq!(draft.name.last_name, "Müller");
        assert_eq!(draft.name.first_name, "Hans");
        assert_eq!(draft.address.street.as_deref(), Some("Hauptstr."));
        assert_eq!(draft.address.house_no.as_deref(), Some("12"));
        assert_eq!(draft.phone.as_deref(), Some("+49030123456"));
        assert_eq!(draft.email.as_deref(), Some("hans@example.org"));
        assert_eq!(draft.gender.as_deref(), Some("m"));
        assert_eq!(draft.interested_in.as_deref(), Some("w"));
        assert_eq!(draft.birth_date, NaiveDate::from_ymd_opt(1991, 3, 7));
        assert_eq!(
            draft.hobbies,
            vec![HobbyPriority::new("Chess", 1), HobbyPriority::new("Reading", 0)]
        );
    }

    #[test]
    fn bad_date_degrades_only_that_field() {
        let r = row(&["Schmidt, Anna", "", "", "", "anna@example.org", "w", "", "31.02.2020"]);
        let draft = parse_tabular_row("sheet", 2, &r);
        assert_eq!(draft.birth_date, None);
        assert_eq!(draft.email.as_deref(), Some("anna@example.org"));
        assert_eq!(draft.name.first_name, "Anna");
        assert!(draft.address.is_blank());
    }

    #[test]
    fn short_rows_leave_trailing_columns_absent() {
        let r = TabularRow::from_cells(vec![Some("Weber".into()), None]);
        assert_eq!(r.name.as_deref(), Some("Weber"));
        assert_eq!(r.email, None);
        assert_eq!(r.birth_date, None);
        assert!(!r.is_empty());
        assert!(TabularRow::from_cells(vec![Some("  ".into())]).is_empty());
    }

    #[test]
    fn workbook_cells_render_as_parser_text() {
        assert_eq!(cell_text(&Data::Empty), None);
        assert_eq!(cell_text(&Data::Float(4917012345.0)).as_deref(), Some("4917012345"));
        assert_eq!(cell_text(&Data::Float(1.5)).as_deref(), Some("1.5"));
        assert_eq!(cell_text(&Data::Int(42)).as_deref(), Some("42"));
        assert_eq!(cell_text(&Data::String(String::new())), None);
        assert_eq!(cell_text(&Data::String("Chess%1%".into())).as_deref(), Some("Chess%1%"));
    }

    #[test]
    fn excel_serials_convert_to_dates() {
        // 33304 is 1991-03-07 in the 1900 date system.
        assert_eq!(excel_serial_to_date(33304.0), NaiveDate::from_ymd_opt(1991, 3, 7));
        assert_eq!(excel_serial_to_date(33304.75), NaiveDate::from_ymd_opt(1991, 3, 7));
        assert_eq!(excel_serial_to_date(12.0), None);
        assert_eq!(excel_serial_to_date(f64::NAN), None);
    }

    #[test]
    fn document_dump_accepts_array_and_lines() {
        let array = r#"[{"_id": "a@example.org", "name": "A, B"}, {"_id": "c@example.org"}]"#;
        assert_eq!(parse_document_dump(array).unwrap().len(), 2);

        let lines = "{\"_id\": \"a@example.org\"}\n\n{\"_id\": \"c@example.org\", \"friends\": []}\n";
        assert_eq!(parse_document_dump(lines).unwrap().len(), 2);

        let err = parse_document_dump("{\"_id\": \"a\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn person_document_maps_to_contact_draft() {
        let doc: PersonDocument = serde_json::from_str(
            r#"{"_id": "tim@example.org", "name": "Wolf, Tim", "phone": 4917012345,
                "friends": [" anna@example.org ", 7, null]}"#,
        )
        .unwrap();
        let draft = parse_person_document("mongo", 4, &doc);
        assert_eq!(draft.email.as_deref(), Some("tim@example.org"));
        assert_eq!(draft.name.first_name, "Tim");
        assert_eq!(draft.phone.as_deref(), Some("4917012345"));
        assert_eq!(draft.friends, vec!["anna@example.org".to_string(), "7".into(), String::new()]);
    }

    #[test]
    fn document_without_id_has_no_email() {
        let doc: PersonDocument = serde_json::from_str(r#"{"_id": {"$oid": "65f0"}, "name": "X"}"#).unwrap();
        let draft = parse_person_document("mongo", 1, &doc);
        assert_eq!(draft.email, None);
        assert!(draft.friends.is_empty());
    }

    #[test]
    fn hobby_catalog_reads_leaf_text() {
        let markup = r#"<?xml version="1.0"?>
            <hobbies>
              <hobby>Chess</hobby>
              <hobby>  Fotografie </hobby>
              <hobby></hobby>
              <hobby>Töpfern</hobby>
            </hobbies>"#;
        assert_eq!(
            parse_hobby_catalog(markup).unwrap(),
            vec!["Chess".to_string(), "Fotografie".into(), "Töpfern".into()]
        );
    }

    #[test]
    fn hobby_catalog_keeps_cdata_and_entities() {
        let markup = "<hobbies><hobby><![CDATA[Rock & Roll]]></hobby><hobby>Chess</hobby><hobby>Kaffee &amp; Kuchen</hobby></hobbies>";
        assert_eq!(
            parse_hobby_catalog(markup).unwrap(),
            vec!["Rock & Roll".to_string(), "Chess".into(), "Kaffee & Kuchen".into()]
        );
    }

    #[test]
    fn hobby_catalog_matches_element_names_exactly() {
        let markup = "<hobbies><Hobby>Tanzen</Hobby><hobby>Chess</hobby><HOBBY>Segeln</HOBBY></hobbies>";
        assert_eq!(parse_hobby_catalog(markup).unwrap(), vec!["Chess".to_string()]);
    }

    #[test]
    fn hobby_catalog_reads_only_direct_children_of_root() {
        let markup = r#"<hobbies>
              <hobby>Chess<note>since 2001</note></hobby>
              <group><hobby>Segeln</hobby></group>
              <hobby/>
              <hobby>Reading</hobby>
            </hobbies>"#;
        assert_eq!(
            parse_hobby_catalog(markup).unwrap(),
            vec!["Chess".to_string(), "Reading".into()]
        );
    }

    #[test]
    fn malformed_hobby_markup_is_an_error() {
        let err = parse_hobby_catalog("<hobbies><hobby>Chess</hobbies>").unwrap_err();
        assert!(err.to_string().contains("invalid hobby markup"));
    }

    #[test]
    fn parse_uses_the_given_bytes() {
        let csv = "name,address,phone,hobbies,email,gender,interested_in,birth_date\n\
                   \"Becker, Jonas\",,,,jonas@example.org,m,w,\n";
        let drafts = adapter_for("sheet", SourceKind::Tabular)
            .parse(Path::new("in-memory.csv"), csv.as_bytes())
            .unwrap();
        assert_eq!(drafts.len(), 1);
        let ImportDraft::Person(jonas) = &drafts[0] else {
            panic!("expected person draft");
        };
        assert_eq!(jonas.email.as_deref(), Some("jonas@example.org"));
    }

    #[test]
    fn factory_returns_adapter_per_kind() {
        for kind in [SourceKind::Tabular, SourceKind::Document, SourceKind::Hierarchical] {
            let adapter = adapter_for("src", kind);
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.source_id(), "src");
        }
    }

    #[test]
    fn unsupported_tabular_extension_is_an_error() {
        let err = load_tabular_rows(Path::new("dump.txt")).unwrap_err();
        assert!(err.to_string().contains("unsupported tabular source extension"));
    }
}
