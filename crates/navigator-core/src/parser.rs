use std::collections::BTreeMap;

use csv::{Position, StringRecord, StringRecordsIntoIter};

use crate::mapper::ColumnMapping;
use crate::taxonomy::{LikertScale, Taxonomy};
use crate::{MalformedRowError, ResponseRow, SurveyError};

/// Streaming reader over one uploaded CSV file.
///
/// The header row is read eagerly so the schema mapper can inspect it; data
/// rows are only decoded once the reader is turned into [`ResponseRows`].
pub struct SurveyCsvReader<'a> {
    bytes: &'a [u8],
    reader: csv::Reader<&'a [u8]>,
    headers: Vec<String>,
}

impl<'a> SurveyCsvReader<'a> {
    /// Open `bytes` as delimited text and read its header row.
    ///
    /// # Errors
    /// Returns [`SurveyError::Header`] when the header row is missing or cannot be decoded.
    pub fn new(bytes: &'a [u8], delimiter: u8) -> Result<Self, SurveyError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|err| SurveyError::Header(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        if headers.iter().all(|header| header.trim().is_empty()) {
            return Err(SurveyError::Header("missing header row".to_string()));
        }

        Ok(Self { bytes, reader, headers })
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Consume the reader into a lazy sequence of decoded rows.
    #[must_use]
    pub fn into_rows<'m>(
        self,
        mapping: &'m ColumnMapping,
        taxonomy: &'m Taxonomy,
    ) -> ResponseRows<'a, 'm> {
        ResponseRows {
            width: self.headers.len(),
            lines: LineCounter::new(self.bytes),
            records: self.reader.into_records(),
            mapping,
            taxonomy,
            ordinal: 0,
            ignored_answers: 0,
        }
    }
}

/// Lazy, single-pass iterator of decoded respondent rows.
pub struct ResponseRows<'a, 'm> {
    records: StringRecordsIntoIter<&'a [u8]>,
    lines: LineCounter<'a>,
    mapping: &'m ColumnMapping,
    taxonomy: &'m Taxonomy,
    width: usize,
    ordinal: u32,
    ignored_answers: u32,
}

impl ResponseRows<'_, '_> {
    /// Answers dropped so far because the question does not apply to the
    /// respondent's constituency.
    #[must_use]
    pub fn ignored_answers(&self) -> u32 {
        self.ignored_answers
    }

    fn decode(&mut self, record: &StringRecord) -> Result<ResponseRow, MalformedRowError> {
        let row_number = self.row_number(record.position());
        let malformed = |reason: String| MalformedRowError { row_number, reason };

        if record.len() != self.width {
            return Err(malformed(format!(
                "expected {} columns, found {}",
                self.width,
                record.len()
            )));
        }

        let raw_constituency = record.get(self.mapping.constituency_column).unwrap_or("").trim();
        if raw_constituency.is_empty() {
            return Err(malformed("missing constituency".to_string()));
        }
        let constituency = self
            .taxonomy
            .resolve_constituency(raw_constituency)
            .ok_or_else(|| malformed(format!("unknown constituency '{raw_constituency}'")))?;

        let mut answers = BTreeMap::new();
        let mut ignored = 0_u32;
        for mapped in &self.mapping.questions {
            let cell = record.get(mapped.column).unwrap_or("").trim();
            if cell.is_empty() {
                continue;
            }
            // Cells of questions the respondent was never asked are not validated.
            if !self.taxonomy.applies_to(mapped.question, constituency) {
                ignored += 1;
                continue;
            }
            let score = parse_score(cell, self.taxonomy.scale)
                .map_err(|reason| malformed(format!("{}: {reason}", mapped.header.trim())))?;
            let question_id = self.taxonomy.questions[mapped.question].id.clone();
            answers.insert(question_id, score);
        }

        self.ignored_answers += ignored;
        Ok(ResponseRow {
            respondent_id: self.ordinal,
            constituency: self.taxonomy.constituencies[constituency].name.clone(),
            answers,
        })
    }

    fn row_number(&mut self, position: Option<&Position>) -> u64 {
        match position {
            Some(position) => self.lines.line_at(position.byte()),
            None => u64::from(self.ordinal) + 1,
        }
    }
}

/// Maps record byte offsets to 1-based file line numbers.
///
/// The csv reader counts a CRLF terminator as two lines, so lines are
/// counted from `\n` bytes instead. A record offset may still sit on the
/// tail of the previous terminator or on skipped blank lines; those bytes
/// belong before the record. Offsets arrive in increasing order, which lets
/// the counter resume from the previous record.
struct LineCounter<'a> {
    bytes: &'a [u8],
    offset: usize,
    line: u64,
}

impl<'a> LineCounter<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0, line: 1 }
    }

    fn line_at(&mut self, byte: u64) -> u64 {
        let mut target =
            usize::try_from(byte).map_or(self.bytes.len(), |byte| byte.min(self.bytes.len()));
        while self.bytes.get(target).is_some_and(|&byte| matches!(byte, b'\r' | b'\n')) {
            target += 1;
        }
        if target < self.offset {
            self.offset = 0;
            self.line = 1;
        }
        let newlines = self.bytes[self.offset..target].iter().filter(|&&byte| byte == b'\n').count();
        self.line += u64::try_from(newlines).unwrap_or(u64::MAX);
        self.offset = target;
        self.line
    }
}

impl Iterator for ResponseRows<'_, '_> {
    type Item = Result<ResponseRow, MalformedRowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.records.next()?;
        self.ordinal += 1;
        Some(match next {
            Ok(record) => self.decode(&record),
            Err(err) => {
                let row_number = self.row_number(err.position());
                Err(MalformedRowError { row_number, reason: format!("unreadable record: {err}") })
            }
        })
    }
}

/// Parse one answer cell as an integral score on `scale`.
///
/// # Errors
/// Returns a human-readable reason when the cell is not a number, is not a
/// whole number, or lies outside the scale.
pub fn parse_score(cell: &str, scale: LikertScale) -> Result<u8, String> {
    let value = match cell.parse::<i64>() {
        Ok(value) => value,
        Err(_) if cell.parse::<f64>().is_ok_and(f64::is_finite) => {
            return Err(format!("non-integral score '{cell}'"));
        }
        Err(_) => return Err(format!("non-numeric score '{cell}'")),
    };
    if !scale.contains(value) {
        return Err(format!("score {value} outside {}-{}", scale.min, scale.max));
    }
    u8::try_from(value).map_err(|_| format!("score {value} outside {}-{}", scale.min, scale.max))
}
