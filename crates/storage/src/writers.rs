//! Loader-file writers: `jsonl` for server-side loads and `insert_values`
//! for insert-statement backends. The insert header carries a `{}`
//! placeholder for the qualified table name, substituted by the client at
//! load time.

use serde_json::{Map, Value};
use std::io::{self, Write};

/// Writes one JSON document per line.
pub fn write_jsonl<W: Write>(out: &mut W, rows: &[Map<String, Value>]) -> io::Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *out, row)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Writes an `INSERT INTO {}(...) VALUES ...;` statement. Missing columns
/// of a row become NULL.
pub fn write_insert_values<W: Write>(
    out: &mut W,
    rows: &[Map<String, Value>],
    columns: &[String],
) -> io::Result<()> {
    let header: Vec<String> = columns.iter().map(|c| escape_identifier(c)).collect();
    writeln!(out, "INSERT INTO {{}}({})", header.join(","))?;
    writeln!(out, "VALUES")?;
    for (i, row) in rows.iter().enumerate() {
        let values: Vec<String> = columns
            .iter()
            .map(|c| escape_literal(row.get(c).unwrap_or(&Value::Null)))
            .collect();
        let terminator = if i + 1 == rows.len() { ";" } else { "," };
        writeln!(out, "({}){}", values.join(","), terminator)?;
    }
    Ok(())
}

/// Escapes a column or table identifier: wrapped in double quotes, with
/// embedded double quotes and backslashes doubled.
pub fn escape_identifier(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Escapes a string literal: wrapped in single quotes, with embedded single
/// quotes and backslashes doubled.
pub fn escape_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Renders a JSON value as a SQL literal. Nested values arrive here only
/// defensively; the normalizer serializes complex leaves to JSON text
/// before rows are written.
pub fn escape_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_string_literal(s),
        nested => escape_string_literal(&nested.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Map<String, Value>> {
        let row1 = json!({"id": 1, "ev": "click", "ok": true});
        let row2 = json!({"id": 2, "ev": null});
        vec![
            row1.as_object().unwrap().clone(),
            row2.as_object().unwrap().clone(),
        ]
    }

    #[test]
    fn simple_insert_writer() {
        let columns = vec!["id".to_string(), "ev".to_string(), "ok".to_string()];
        let mut buf = Vec::new();
        write_insert_values(&mut buf, &rows(), &columns).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(r#"INSERT INTO {}("id","ev","ok")"#, lines[0]);
        assert_eq!("VALUES", lines[1]);
        assert_eq!("(1,'click',true),", lines[2]);
        assert_eq!("(2,NULL,NULL);", lines[3]);
        assert_eq!(4, lines.len());
    }

    #[test]
    fn jsonl_writer_emits_one_document_per_line() {
        let columns = rows();
        let mut buf = Vec::new();
        write_jsonl(&mut buf, &columns).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(2, text.lines().count());
        let round: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(json!({"id": 1, "ev": "click", "ok": true}), round);
    }

    #[test]
    fn string_literal_escape_resists_injection() {
        assert_eq!(
            "', NULL''); DROP TABLE --'",
            escape_string_literal(", NULL'); DROP TABLE --")
        );
        assert_eq!(
            "', NULL'');\n DROP TABLE --'",
            escape_string_literal(", NULL');\n DROP TABLE --")
        );
        assert_eq!(
            "', NULL);\\\\n DROP TABLE --\\\\'",
            escape_string_literal(", NULL);\\n DROP TABLE --\\")
        );
    }

    #[test]
    fn identifier_escape_doubles_quotes() {
        assert_eq!(
            "\", NULL'); DROP TABLE\"\" -\\\\-\"",
            escape_identifier(", NULL'); DROP TABLE\" -\\-")
        );
    }

    #[test]
    fn unicode_passes_through_escaping() {
        assert_eq!(
            "'イロハニホヘト チリヌルヲ ''ワカヨタレソ ツネナラム'",
            escape_string_literal("イロハニホヘト チリヌルヲ 'ワカヨタレソ ツネナラム")
        );
        assert_eq!("\"ąćł\"\"\"", escape_identifier("ąćł\""));
    }

    #[test]
    fn complex_values_are_embedded_as_json_text() {
        assert_eq!("'{\"a\":1}'", escape_literal(&json!({"a": 1})));
        assert_eq!("NULL", escape_literal(&Value::Null));
        assert_eq!("1.5", escape_literal(&json!(1.5)));
    }
}
