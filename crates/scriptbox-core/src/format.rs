//! Output formatter: renders a script result in a caller-selected format.
//!
//! Every structured format walks the value tree (lists, dicts, nested
//! combinations) rather than escaping a flattened string. A result that
//! cannot be represented in the requested format is a [`FormatError`],
//! never a silent fallback to plain text.
//!
//! JSON and YAML round-trip. Table and CSV are lossy by construction:
//! cell values are rendered as text and type information is dropped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use unicode_width::UnicodeWidthStr;

use crate::interp::Value;

/// Closed set of output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Plain,
    Json,
    Xml,
    Yaml,
    Table,
    Csv,
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Plain => "plain",
            OutputFormat::Json => "json",
            OutputFormat::Xml => "xml",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Table => "table",
            OutputFormat::Csv => "csv",
            OutputFormat::Markdown => "markdown",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, FormatError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(OutputFormat::Plain),
            "json" => Ok(OutputFormat::Json),
            "xml" => Ok(OutputFormat::Xml),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            _ => Err(FormatError::UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("unknown output format \"{0}\": must be plain, json, xml, yaml, table, csv, or markdown")]
    UnknownFormat(String),

    #[error("cannot render result as {format}: {reason} (offending value: {value})")]
    Unrepresentable {
        format: OutputFormat,
        reason: String,
        value: String,
    },

    #[error("{format} serialization failed: {message}")]
    Serialization {
        format: OutputFormat,
        message: String,
    },
}

/// Structured view of a result.
///
/// List and dict values map directly. A string that holds a JSON object or
/// array is treated as that structure.
pub fn structured_view(value: &Value) -> Json {
    if let Value::Str(s) = value {
        let trimmed = s.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed @ (Json::Object(_) | Json::Array(_))) = serde_json::from_str(s) {
                return parsed;
            }
        }
    }
    value.to_json()
}

/// Render `value` as `format`.
pub fn format_value(value: &Value, format: OutputFormat) -> Result<String, FormatError> {
    if format == OutputFormat::Plain {
        return Ok(value.as_str().into_owned());
    }
    let json = structured_view(value);
    match format {
        OutputFormat::Plain => Ok(value.as_str().into_owned()),
        OutputFormat::Json => {
            serde_json::to_string_pretty(&json).map_err(|e| FormatError::Serialization {
                format,
                message: e.to_string(),
            })
        }
        OutputFormat::Yaml => serde_yaml::to_string(&json).map_err(|e| FormatError::Serialization {
            format,
            message: e.to_string(),
        }),
        OutputFormat::Xml => render_xml(&json),
        OutputFormat::Csv => render_csv(&json),
        OutputFormat::Table => Ok(render_table(&json)),
        OutputFormat::Markdown => Ok(render_markdown(&json)),
    }
}

fn unrepresentable(format: OutputFormat, reason: impl Into<String>, value: &Json) -> FormatError {
    let mut shown = value.to_string();
    if shown.len() > 80 {
        let cut = (0..=77).rev().find(|&i| shown.is_char_boundary(i)).unwrap_or(0);
        shown.truncate(cut);
        shown.push_str("...");
    }
    FormatError::Unrepresentable {
        format,
        reason: reason.into(),
        value: shown,
    }
}

fn cell_text(value: &Json) -> String {
    match value {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_scalar(value: &Json) -> bool {
    !matches!(value, Json::Object(_) | Json::Array(_))
}

// -- tabular shape ------------------------------------------------------------

/// Rows and optional header derived from a value.
struct Tabular {
    headers: Option<Vec<String>>,
    rows: Vec<Vec<Json>>,
}

fn tabulate(value: &Json) -> Tabular {
    match value {
        Json::Array(items) if items.is_empty() => Tabular {
            headers: None,
            rows: Vec::new(),
        },
        Json::Array(items) if items.iter().all(Json::is_object) => {
            let mut headers: Vec<String> = Vec::new();
            for item in items {
                if let Json::Object(map) = item {
                    for key in map.keys() {
                        if !headers.contains(key) {
                            headers.push(key.clone());
                        }
                    }
                }
            }
            let rows = items
                .iter()
                .map(|item| {
                    headers
                        .iter()
                        .map(|h| item.get(h).cloned().unwrap_or(Json::Null))
                        .collect()
                })
                .collect();
            Tabular {
                headers: Some(headers),
                rows,
            }
        }
        Json::Array(items) if items.iter().all(Json::is_array) => {
            let width = items
                .iter()
                .filter_map(Json::as_array)
                .map(Vec::len)
                .max()
                .unwrap_or(0);
            let rows = items
                .iter()
                .filter_map(Json::as_array)
                .map(|row| {
                    let mut row = row.clone();
                    row.resize(width, Json::Null);
                    row
                })
                .collect();
            Tabular {
                headers: None,
                rows,
            }
        }
        Json::Array(items) => Tabular {
            headers: Some(vec!["value".to_string()]),
            rows: items.iter().map(|item| vec![item.clone()]).collect(),
        },
        Json::Object(map) => Tabular {
            headers: Some(vec!["key".to_string(), "value".to_string()]),
            rows: map
                .iter()
                .map(|(k, v)| vec![Json::String(k.clone()), v.clone()])
                .collect(),
        },
        scalar => Tabular {
            headers: Some(vec!["value".to_string()]),
            rows: vec![vec![scalar.clone()]],
        },
    }
}

// -- CSV ----------------------------------------------------------------------

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn render_csv(value: &Json) -> Result<String, FormatError> {
    let table = tabulate(value);
    let mut out = String::new();
    if let Some(headers) = &table.headers {
        let line: Vec<String> = headers.iter().map(|h| csv_field(h)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    for row in &table.rows {
        let mut line = Vec::with_capacity(row.len());
        for cell in row {
            if !is_scalar(cell) {
                return Err(unrepresentable(
                    OutputFormat::Csv,
                    "nested values cannot be placed in a CSV cell",
                    cell,
                ));
            }
            line.push(csv_field(&cell_text(cell)));
        }
        out.push_str(&line.join(","));
        out.push('\n');
    }
    Ok(out)
}

// -- table --------------------------------------------------------------------

fn table_cell(value: &Json) -> String {
    cell_text(value).replace(['\n', '\r'], " ")
}

fn render_table(value: &Json) -> String {
    let table = tabulate(value);
    let body: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| row.iter().map(table_cell).collect())
        .collect();
    let columns = table
        .headers
        .as_ref()
        .map(Vec::len)
        .or_else(|| body.first().map(Vec::len))
        .unwrap_or(0);
    if columns == 0 {
        return String::new();
    }

    let mut widths = vec![0usize; columns];
    let all_rows = table.headers.iter().chain(body.iter());
    for row in all_rows {
        for (i, cell) in row.iter().enumerate().take(columns) {
            widths[i] = widths[i].max(UnicodeWidthStr::width(cell.as_str()));
        }
    }

    let border = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line.push('\n');
        line
    };
    let render_row = |row: &[String]| {
        let mut line = String::from("|");
        for (i, width) in widths.iter().enumerate() {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let pad = width - UnicodeWidthStr::width(cell);
            line.push(' ');
            line.push_str(cell);
            line.push_str(&" ".repeat(pad + 1));
            line.push('|');
        }
        line.push('\n');
        line
    };

    let mut out = border.clone();
    if let Some(headers) = &table.headers {
        out.push_str(&render_row(headers));
        out.push_str(&border);
    }
    for row in &body {
        out.push_str(&render_row(row));
    }
    if !body.is_empty() {
        out.push_str(&border);
    }
    out
}

// -- markdown -----------------------------------------------------------------

fn markdown_cell(value: &Json) -> String {
    table_cell(value).replace('|', "\\|")
}

fn render_markdown(value: &Json) -> String {
    match value {
        Json::Array(items) if !items.is_empty() && items.iter().all(is_scalar) => items
            .iter()
            .map(|item| format!("- {}\n", cell_text(item)))
            .collect(),
        Json::Array(_) | Json::Object(_) => {
            let table = tabulate(value);
            let columns = table
                .headers
                .as_ref()
                .map(Vec::len)
                .or_else(|| table.rows.first().map(Vec::len))
                .unwrap_or(0);
            if columns == 0 {
                return String::new();
            }
            let headers = table
                .headers
                .unwrap_or_else(|| (1..=columns).map(|i| format!("col{i}")).collect());
            let mut out = format!(
                "| {} |\n|{}\n",
                headers
                    .iter()
                    .map(|h| h.replace('|', "\\|"))
                    .collect::<Vec<_>>()
                    .join(" | "),
                " --- |".repeat(columns)
            );
            for row in &table.rows {
                let cells: Vec<String> = row.iter().map(markdown_cell).collect();
                out.push_str(&format!("| {} |\n", cells.join(" | ")));
            }
            out
        }
        scalar => cell_text(scalar),
    }
}

// -- XML ----------------------------------------------------------------------

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.to_ascii_lowercase().starts_with("xml")
}

fn write_xml(out: &mut String, name: &str, value: &Json, depth: usize) -> Result<(), FormatError> {
    let indent = "  ".repeat(depth);
    match value {
        Json::Null => out.push_str(&format!("{indent}<{name}/>\n")),
        Json::Object(map) => {
            out.push_str(&format!("{indent}<{name}>\n"));
            for (key, child) in map {
                if !is_xml_name(key) {
                    return Err(unrepresentable(
                        OutputFormat::Xml,
                        format!("key \"{key}\" is not a valid XML element name"),
                        value,
                    ));
                }
                write_xml(out, key, child, depth + 1)?;
            }
            out.push_str(&format!("{indent}</{name}>\n"));
        }
        Json::Array(items) => {
            out.push_str(&format!("{indent}<{name}>\n"));
            for item in items {
                write_xml(out, "item", item, depth + 1)?;
            }
            out.push_str(&format!("{indent}</{name}>\n"));
        }
        scalar => out.push_str(&format!(
            "{indent}<{name}>{}</{name}>\n",
            xml_escape(&cell_text(scalar))
        )),
    }
    Ok(())
}

fn render_xml(value: &Json) -> Result<String, FormatError> {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write_xml(&mut out, "result", value, 0)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Value {
        Value::List(vec![
            Value::Dict(vec![
                ("name".into(), Value::from("ada")),
                ("age".into(), Value::Int(36)),
            ]),
            Value::Dict(vec![
                ("name".into(), Value::from("grace, rear admiral")),
                ("age".into(), Value::Int(85)),
            ]),
        ])
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("md".parse::<OutputFormat>(), Ok(OutputFormat::Markdown));
        assert_eq!(
            "pdf".parse::<OutputFormat>(),
            Err(FormatError::UnknownFormat("pdf".into()))
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let value = records();
        let rendered = format_value(&value, OutputFormat::Json).unwrap();
        let parsed: Json = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, value.to_json());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let value = records();
        let rendered = format_value(&value, OutputFormat::Yaml).unwrap();
        let parsed: Json = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, value.to_json());
    }

    #[test]
    fn test_plain_uses_string_form() {
        let value = Value::List(vec![Value::from("a b"), Value::Int(2)]);
        assert_eq!(format_value(&value, OutputFormat::Plain).unwrap(), "{a b} 2");
    }

    #[test]
    fn test_csv_walks_records() {
        let csv = format_value(&records(), OutputFormat::Csv).unwrap();
        assert_eq!(csv, "name,age\nada,36\n\"grace, rear admiral\",85\n");
    }

    #[test]
    fn test_csv_rejects_nested_cells() {
        let value = Value::Dict(vec![(
            "inner".into(),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
        )]);
        let err = format_value(&value, OutputFormat::Csv).unwrap_err();
        assert!(matches!(
            err,
            FormatError::Unrepresentable {
                format: OutputFormat::Csv,
                ..
            }
        ));
    }

    #[test]
    fn test_xml_walks_tree() {
        let value = Value::Dict(vec![
            ("title".into(), Value::from("a < b")),
            (
                "tags".into(),
                Value::List(vec![Value::from("x"), Value::from("y")]),
            ),
        ]);
        let xml = format_value(&value, OutputFormat::Xml).unwrap();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <result>\n  <title>a &lt; b</title>\n  <tags>\n    <item>x</item>\n    <item>y</item>\n  </tags>\n</result>\n"
        );
    }

    #[test]
    fn test_xml_rejects_invalid_names() {
        let value = Value::Dict(vec![("1st place".into(), Value::Int(1))]);
        assert!(format_value(&value, OutputFormat::Xml).is_err());
    }

    #[test]
    fn test_json_string_result_is_structured() {
        let value = Value::from(r#"{"ok": true, "items": [1, 2]}"#);
        let xml = format_value(&value, OutputFormat::Xml).unwrap();
        assert!(xml.contains("<ok>true</ok>"));
        assert!(xml.contains("<item>2</item>"));
    }

    #[test]
    fn test_table_alignment_uses_display_width() {
        let value = Value::Dict(vec![
            ("名前".into(), Value::from("x")),
            ("k".into(), Value::Int(10)),
        ]);
        let table = format_value(&value, OutputFormat::Table).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "+------+-------+");
        assert_eq!(lines[1], "| key  | value |");
        assert_eq!(lines[3], "| 名前 | x     |");
        assert_eq!(lines[4], "| k    | 10    |");
    }

    #[test]
    fn test_markdown_shapes() {
        let list = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(format_value(&list, OutputFormat::Markdown).unwrap(), "- a\n- b\n");

        let md = format_value(&records(), OutputFormat::Markdown).unwrap();
        assert!(md.starts_with("| name | age |\n| --- | --- |\n| ada | 36 |"));
        assert_eq!(format_value(&Value::from("hi"), OutputFormat::Markdown).unwrap(), "hi");
    }
}
