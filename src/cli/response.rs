//! Array response parsing
//!
//! Array listings come in two layouts:
//!
//! - **Table**: a header row followed by data rows, fields separated by a
//!   delimiter. A row whose field count differs from the header is an
//!   integrity error, never silently truncated.
//! - **Detail**: one `key<delim>value` per line. A blank line starts a new
//!   record; a key repeated inside one record collects every value, which
//!   is how the array lists ports and other per-object collections.
//!
//! Records keep field order as printed.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::ops::Index;

/// Output layout of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Header row then data rows
    Table,
    /// `key<delim>value` lines
    Detail,
}

/// Value of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    /// First (or only) value
    pub fn first(&self) -> &str {
        match self {
            FieldValue::Single(v) => v,
            FieldValue::Multi(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values, a single value counts as a one-item list
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(v) => vec![v.as_str()],
            FieldValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            FieldValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = FieldValue::Multi(vec![first, value]);
            }
            FieldValue::Multi(vs) => vs.push(value),
        }
    }
}

/// One parsed object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: IndexMap<String, FieldValue>,
}

impl Record {
    /// First value of a field
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(FieldValue::first)
    }

    /// Every value of a field, empty when absent
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.fields
            .get(key)
            .map(FieldValue::values)
            .unwrap_or_default()
    }

    /// Field that must be present
    pub fn require(&self, key: &str, command: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::MalformedResponse {
            command: command.to_string(),
            reason: format!("missing field {}", key),
        })
    }

    /// Field that must be present and numeric
    pub fn require_u64(&self, key: &str, command: &str) -> Result<u64> {
        let raw = self.require(key, command)?;
        raw.parse().map_err(|_| Error::MalformedResponse {
            command: command.to_string(),
            reason: format!("field {} is not a number: '{}'", key, raw),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names in printed order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn insert(&mut self, key: String, value: String) {
        match self.fields.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.fields.insert(key, FieldValue::Single(value));
            }
        }
    }
}

/// Parsed listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliResponse {
    records: Vec<Record>,
}

impl CliResponse {
    /// Parse raw stdout. `command` labels integrity errors.
    pub fn parse(command: &str, raw: &str, delim: char, layout: Layout) -> Result<Self> {
        let records = match layout {
            Layout::Table => parse_table(command, raw, delim)?,
            Layout::Detail => parse_detail(raw, delim),
        };
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Collect several fields from every record in one pass.
    ///
    /// Within a record the selected fields are zipped positionally, so a
    /// record with repeated `port_id`/`port_status` keys yields one tuple
    /// per port. Zipping stops at the shortest field; a record missing any
    /// selected field contributes nothing.
    pub fn select(&self, keys: &[&str]) -> Vec<Vec<&str>> {
        let mut out = Vec::new();
        for record in &self.records {
            let columns: Vec<Vec<&str>> = keys.iter().map(|k| record.get_all(k)).collect();
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            for i in 0..rows {
                out.push(columns.iter().map(|c| c[i]).collect());
            }
        }
        out
    }
}

impl Index<usize> for CliResponse {
    type Output = Record;

    fn index(&self, index: usize) -> &Record {
        &self.records[index]
    }
}

impl<'a> IntoIterator for &'a CliResponse {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

fn split_fields(line: &str, delim: char) -> Vec<String> {
    if delim.is_whitespace() {
        line.split_whitespace().map(str::to_string).collect()
    } else {
        line.split(delim).map(|f| f.trim().to_string()).collect()
    }
}

fn parse_table(command: &str, raw: &str, delim: char) -> Result<Vec<Record>> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(line) => split_fields(line, delim),
        None => return Ok(Vec::new()),
    };

    let mut records = Vec::new();
    for (row_no, line) in lines.enumerate() {
        let row = split_fields(line, delim);
        if row.len() != header.len() {
            return Err(Error::MalformedResponse {
                command: command.to_string(),
                reason: format!(
                    "row {} has {} fields but the header has {}",
                    row_no + 1,
                    row.len(),
                    header.len()
                ),
            });
        }
        let mut record = Record::default();
        for (key, value) in header.iter().zip(row) {
            record.insert(key.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_detail(raw: &str, delim: char) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::default();

    for line in raw.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let mut fields = split_fields(line, delim).into_iter();
        let key = fields.next().unwrap_or_default();
        let rest: Vec<String> = fields.collect();
        let separator = if delim.is_whitespace() {
            " ".to_string()
        } else {
            delim.to_string()
        };
        current.insert(key, rest.join(&separator));
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_table_parse() {
        let resp = CliResponse::parse("lsnode", "id!name\n1!node1\n2!node2\n", '!', Layout::Table)
            .unwrap();
        assert_eq!(resp.len(), 2);
        assert_eq!(resp[0].get("id"), Some("1"));
        assert_eq!(resp[1].get("id"), Some("2"));
        assert_eq!(resp[1].get("name"), Some("node2"));
    }

    #[test]
    fn test_empty_input() {
        for layout in [Layout::Table, Layout::Detail] {
            let resp = CliResponse::parse("lshost", "", '!', layout).unwrap();
            assert!(resp.is_empty());
            let resp = CliResponse::parse("lshost", "\n\n", '!', layout).unwrap();
            assert!(resp.is_empty());
        }
    }

    #[test]
    fn test_header_row_mismatch() {
        let raw = "id!name!WWNN\n1!node1\n";
        let result = CliResponse::parse("lsnodecanister", raw, '!', Layout::Table);
        assert_matches!(
            result,
            Err(Error::MalformedResponse { ref command, .. }) if command == "lsnodecanister"
        );
    }

    #[test]
    fn test_detail_records_and_repeats() {
        let raw = "id!1\nname!Bill\nhome address!s1\nhome address!s2\n\nid! 7\nname!John\nhome address!s3\nhome address!s4\n";
        let resp = CliResponse::parse("lsuser", raw, '!', Layout::Detail).unwrap();
        assert_eq!(resp.len(), 2);
        assert_eq!(resp[1].get("id"), Some("7"));

        let selected = resp.select(&["home address", "name", "home address"]);
        assert_eq!(
            selected,
            vec![
                vec!["s1", "Bill", "s1"],
                vec!["s3", "John", "s3"],
            ]
        );
        assert_eq!(resp[0].get_all("home address"), vec!["s1", "s2"]);
    }

    #[test]
    fn test_select_zips_repeated_keys() {
        let raw = "id!1\nname!node1\nport_id!500507680210C744\nport_status!active\nport_speed!8Gb\nport_id!500507680220C744\nport_status!active\nport_speed!8Gb\n";
        let resp = CliResponse::parse("lsnode", raw, '!', Layout::Detail).unwrap();
        assert_eq!(resp.len(), 1);
        let ports = resp.select(&["port_id", "port_status"]);
        assert_eq!(
            ports,
            vec![
                vec!["500507680210C744", "active"],
                vec!["500507680220C744", "active"],
            ]
        );
    }

    #[test]
    fn test_select_skips_records_missing_a_field() {
        let raw = "id!name\n1!a\n";
        let resp = CliResponse::parse("lshost", raw, '!', Layout::Table).unwrap();
        assert!(resp.select(&["id", "iscsi_name"]).is_empty());
        assert_eq!(resp.select(&["name", "id"]), vec![vec!["a", "1"]]);
    }

    #[test]
    fn test_detail_value_keeps_delimiters() {
        let resp = CliResponse::parse("lssystem", "name!a!b\n", '!', Layout::Detail).unwrap();
        assert_eq!(resp[0].get("name"), Some("a!b"));
    }

    #[test]
    fn test_whitespace_delimiter() {
        let raw = "id  name   status\n1   node1  online\n";
        let resp = CliResponse::parse("lsnode", raw, ' ', Layout::Table).unwrap();
        assert_eq!(resp[0].get("status"), Some("online"));
    }

    #[test]
    fn test_require_fields() {
        let resp = CliResponse::parse("lsmdiskgrp", "capacity!10\nname!p\n", '!', Layout::Detail)
            .unwrap();
        assert_eq!(resp[0].require_u64("capacity", "lsmdiskgrp").unwrap(), 10);
        assert_matches!(
            resp[0].require("extent_size", "lsmdiskgrp"),
            Err(Error::MalformedResponse { .. })
        );
        assert_matches!(
            resp[0].require_u64("name", "lsmdiskgrp"),
            Err(Error::MalformedResponse { .. })
        );
    }
}
