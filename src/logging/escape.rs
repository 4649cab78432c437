//! String escaping for the structured log formats.
use std::fmt::{
    self,
    Write,
};


/// How a value is embedded into a log line. `Raw` writes it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    Raw,
    Json,
    Xml,
    Sql,
    Csv,
}

impl Escape {
    /// The template letter selecting this escape (`%js`, `%xs`, ...).
    pub fn from_prefix(prefix: char) -> Option<Escape> {
        match prefix {
            'j' => Some(Escape::Json),
            'x' => Some(Escape::Xml),
            'q' => Some(Escape::Sql),
            'c' => Some(Escape::Csv),
            _ => None,
        }
    }

    pub fn write<W: Write + ?Sized>(self, out: &mut W, text: &str) -> fmt::Result {
        match self {
            Escape::Raw => out.write_str(text),
            Escape::Json => write_json(out, text),
            Escape::Xml => write_xml(out, text),
            Escape::Sql => write_doubled(out, text, '\''),
            Escape::Csv => write_doubled(out, text, '"'),
        }
    }
}

/// Writes `text` as the inside of a JSON string literal. Angle brackets are
/// escaped as well so a line can be embedded into HTML unchanged.
fn write_json<W: Write + ?Sized>(out: &mut W, text: &str) -> fmt::Result {
    let mut start = 0;
    for (index, ch) in text.char_indices() {
        let replacement = match ch {
            '"' => "\\\"",
            '\\' => "\\\\",
            '/' => "\\/",
            '\n' => "\\n",
            '\r' => "\\r",
            '\t' => "\\t",
            '\u{8}' => "\\b",
            '\u{c}' => "\\f",
            '<' => "\\u003c",
            '>' => "\\u003e",
            ch if ch.is_control() && (ch as u32) < 0x20 => "",
            _ => continue,
        };
        out.write_str(&text[start..index])?;
        if replacement.is_empty() {
            write!(out, "\\u{:04x}", ch as u32)?;
        } else {
            out.write_str(replacement)?;
        }
        start = index + ch.len_utf8();
    }
    out.write_str(&text[start..])
}

fn write_xml<W: Write + ?Sized>(out: &mut W, text: &str) -> fmt::Result {
    let mut start = 0;
    for (index, ch) in text.char_indices() {
        let entity = match ch {
            '&' => "&amp;",
            '"' => "&quot;",
            '\'' => "&#39;",
            '<' => "&lt;",
            '>' => "&gt;",
            '\r' => "&#13;",
            '\n' => "&#10;",
            _ => continue,
        };
        out.write_str(&text[start..index])?;
        out.write_str(entity)?;
        start = index + ch.len_utf8();
    }
    out.write_str(&text[start..])
}

/// SQL and CSV quote the same way: the quote character is written twice.
fn write_doubled<W: Write + ?Sized>(out: &mut W, text: &str, quote: char) -> fmt::Result {
    let mut pieces = text.split(quote);
    if let Some(first) = pieces.next() {
        out.write_str(first)?;
    }
    for piece in pieces {
        out.write_char(quote)?;
        out.write_char(quote)?;
        out.write_str(piece)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn escaped(escape: Escape, text: &str) -> String {
        let mut out = String::new();
        escape.write(&mut out, text).unwrap();
        out
    }

    #[test]
    fn json_escapes_quotes_controls_and_brackets() {
        assert_eq!(escaped(Escape::Json, r#"say "hi"\now"#), r#"say \"hi\"\\now"#);
        assert_eq!(escaped(Escape::Json, "a\nb\r\tc"), "a\\nb\\r\\tc");
        assert_eq!(escaped(Escape::Json, "<script>"), "\\u003cscript\\u003e");
        assert_eq!(escaped(Escape::Json, "bell\u{7}"), "bell\\u0007");
        assert_eq!(escaped(Escape::Json, "a/b"), "a\\/b");
        assert_eq!(escaped(Escape::Json, "grüße"), "grüße");
    }

    #[test]
    fn xml_uses_entities() {
        assert_eq!(
            escaped(Escape::Xml, "<a href=\"x\">Tom & Jerry's</a>\r\n"),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/a&gt;&#13;&#10;",
        );
    }

    #[test]
    fn sql_and_csv_double_their_quote() {
        assert_eq!(escaped(Escape::Sql, "it's 'quoted'"), "it''s ''quoted''");
        assert_eq!(escaped(Escape::Sql, "say \"hi\""), "say \"hi\"");
        assert_eq!(escaped(Escape::Csv, "say \"hi\""), "say \"\"hi\"\"");
        assert_eq!(escaped(Escape::Csv, "\""), "\"\"");
        assert_eq!(escaped(Escape::Csv, ""), "");
    }

    #[test]
    fn raw_is_unchanged() {
        assert_eq!(escaped(Escape::Raw, "<\"'&>\n"), "<\"'&>\n");
    }
}
