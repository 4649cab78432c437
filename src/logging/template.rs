//! Log line templates.
//!
//! A template is parsed once into a list of [Token]s. Rendering is lenient: a `%`
//! sequence that doesn't name a placeholder is written out as it was given.
//! [LogTemplate::validate] is the strict counterpart used when the template comes
//! from the command line.
use chrono::{
    DateTime,
    Datelike,
    FixedOffset,
    Timelike,
    Utc,
};
use std::{
    fmt::{
        self,
        Write,
    },
    iter::Peekable,
    str::Chars,
};
use thiserror::Error;
use tracing::Level;

use super::escape::Escape;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    Local,
    Utc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatePart {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Offset,
    /// `2023-01-31 18:04:05+0100`
    Spaced,
    /// `2023-01-31T18:04:05+0100`
    Iso,
    Weekday,
    MonthName,
}

impl DatePart {
    fn from_letter(letter: char) -> Option<DatePart> {
        Some(match letter {
            'Y' => DatePart::Year,
            'm' => DatePart::Month,
            'd' => DatePart::Day,
            'H' => DatePart::Hour,
            'M' => DatePart::Minute,
            'S' => DatePart::Second,
            'z' => DatePart::Offset,
            't' => DatePart::Spaced,
            'T' => DatePart::Iso,
            'a' => DatePart::Weekday,
            'b' => DatePart::MonthName,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Date(Clock, DatePart),
    /// RFC 7231 `IMF-fixdate`, always in GMT.
    HttpDate,
    Message(Escape),
    File(Escape),
    Line,
    Level {
        upper: bool,
        escape: Escape,
    },
    /// A `%` sequence without meaning, rendered verbatim.
    Unknown(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder {0:?} in log template")]
    UnknownPlaceholder(String),
    #[error("log template has no message placeholder (%s, %js, %xs, %qs or %cs)")]
    MissingMessage,
}

/// What a single log line is made of, apart from the time.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: Level,
    pub message: &'a str,
    pub file: &'a str,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTemplate {
    source: String,
    tokens: Vec<Token>,
}

fn placeholder(spec: char, rest: &mut Peekable<Chars<'_>>) -> Token {
    if let Some(part) = DatePart::from_letter(spec) {
        return Token::Date(Clock::Local, part);
    }
    match spec {
        'h' => Token::HttpDate,
        's' => Token::Message(Escape::Raw),
        'f' => Token::File(Escape::Raw),
        'n' => Token::Line,
        'l' => Token::Level { upper: false, escape: Escape::Raw },
        'L' => Token::Level { upper: true, escape: Escape::Raw },
        'g' => {
            let part = match rest.peek().copied() {
                Some('z') | None => None,
                Some(letter) => DatePart::from_letter(letter),
            };
            match part {
                Some(part) => {
                    rest.next();
                    Token::Date(Clock::Utc, part)
                }
                None => Token::Unknown("%g".to_string()),
            }
        }
        prefix => match Escape::from_prefix(prefix) {
            Some(escape) => {
                let token = match rest.peek() {
                    Some('s') => Token::Message(escape),
                    Some('f') => Token::File(escape),
                    Some('l') => Token::Level { upper: false, escape },
                    Some('L') => Token::Level { upper: true, escape },
                    _ => return Token::Unknown(format!("%{}", prefix)),
                };
                rest.next();
                token
            }
            None => Token::Unknown(format!("%{}", prefix)),
        },
    }
}

impl LogTemplate {
    pub fn parse(template: &str) -> LogTemplate {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch != '%' {
                literal.push(ch);
                continue;
            }
            let token = match chars.next() {
                None => Token::Unknown("%".to_string()),
                Some('%') => {
                    literal.push('%');
                    continue;
                }
                Some(spec) => placeholder(spec, &mut chars),
            };
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            tokens.push(token);
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        LogTemplate {
            source: template.to_string(),
            tokens,
        }
    }

    /// Reject templates with unknown placeholders or without any message placeholder.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if let Some(Token::Unknown(text)) = self.tokens.iter().find(|t| matches!(t, Token::Unknown(_))) {
            return Err(TemplateError::UnknownPlaceholder(text.clone()));
        }
        if !self.tokens.iter().any(|t| matches!(t, Token::Message(_))) {
            return Err(TemplateError::MissingMessage);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render one line (without the trailing newline) for `record` logged at `now`.
    pub fn render<W: Write + ?Sized>(&self, out: &mut W, now: &DateTime<FixedOffset>, record: &Record<'_>) -> fmt::Result {
        let utc = now.with_timezone(&Utc);
        for token in &self.tokens {
            match token {
                Token::Literal(text) | Token::Unknown(text) => out.write_str(text)?,
                Token::Date(Clock::Local, part) => write_date(out, now, *part, false)?,
                Token::Date(Clock::Utc, part) => write_date(out, &utc, *part, true)?,
                Token::HttpDate => write!(out, "{}", utc.format("%a, %d %b %Y %H:%M:%S GMT"))?,
                Token::Message(escape) => escape.write(out, record.message)?,
                Token::File(escape) => escape.write(out, record.file)?,
                Token::Line => write!(out, "{}", record.line)?,
                Token::Level { upper, escape } => {
                    let level = record.level.as_str();
                    if *upper {
                        escape.write(out, &level.to_ascii_uppercase())?
                    } else {
                        escape.write(out, &level.to_ascii_lowercase())?
                    }
                }
            }
        }
        Ok(())
    }
}

fn write_date<W, Tz>(out: &mut W, time: &DateTime<Tz>, part: DatePart, zulu: bool) -> fmt::Result
where
    W: Write + ?Sized,
    Tz: chrono::TimeZone,
    Tz::Offset: fmt::Display,
{
    match part {
        DatePart::Year => write!(out, "{:04}", time.year()),
        DatePart::Month => write!(out, "{:02}", time.month()),
        DatePart::Day => write!(out, "{:02}", time.day()),
        DatePart::Hour => write!(out, "{:02}", time.hour()),
        DatePart::Minute => write!(out, "{:02}", time.minute()),
        DatePart::Second => write!(out, "{:02}", time.second()),
        DatePart::Offset => write!(out, "{}", time.format("%z")),
        DatePart::Weekday => write!(out, "{}", time.format("%a")),
        DatePart::MonthName => write!(out, "{}", time.format("%b")),
        DatePart::Spaced | DatePart::Iso => {
            let separator = if part == DatePart::Iso { 'T' } else { ' ' };
            write!(out, "{}{}{}", time.format("%Y-%m-%d"), separator, time.format("%H:%M:%S"))?;
            if zulu {
                out.write_char('Z')
            } else {
                write!(out, "{}", time.format("%z"))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600).unwrap().with_ymd_and_hms(2023, 1, 31, 18, 4, 5).unwrap()
    }

    fn record(message: &str) -> Record<'_> {
        Record {
            level: Level::ERROR,
            message,
            file: "src/supervisor/mod.rs",
            line: 42,
        }
    }

    fn render(template: &str, message: &str) -> String {
        let mut out = String::new();
        LogTemplate::parse(template).render(&mut out, &at(), &record(message)).unwrap();
        out
    }

    #[test]
    fn local_time_placeholders() {
        assert_eq!(render("%Y-%m-%d %H:%M:%S %z", ""), "2023-01-31 18:04:05 +0100");
        assert_eq!(render("%t", ""), "2023-01-31 18:04:05+0100");
        assert_eq!(render("%T", ""), "2023-01-31T18:04:05+0100");
        assert_eq!(render("%a %b", ""), "Tue Jan");
    }

    #[test]
    fn utc_time_placeholders() {
        assert_eq!(render("%gH:%gM", ""), "17:04");
        assert_eq!(render("%gt|%gT", ""), "2023-01-31 17:04:05Z|2023-01-31T17:04:05Z");
        assert_eq!(render("%h", ""), "Tue, 31 Jan 2023 17:04:05 GMT");
    }

    #[test]
    fn message_file_line_and_level() {
        assert_eq!(render("[%L] %f:%n: %s", "boom"), "[ERROR] src/supervisor/mod.rs:42: boom");
        assert_eq!(render("%l", ""), "error");
        assert_eq!(render(r#"{"m":"%js"}"#, "a \"b\""), r#"{"m":"a \"b\""}"#);
        assert_eq!(render("'%qs'", "it's"), "'it''s'");
        assert_eq!(render("<m>%xs</m>", "a<b"), "<m>a&lt;b</m>");
        assert_eq!(render("\"%cs\"", "x\"y"), "\"x\"\"y\"");
        assert_eq!(render("%jL", ""), "ERROR");
    }

    #[test]
    fn unknown_sequences_are_verbatim() {
        assert_eq!(render("100%% %s", "done"), "100% done");
        assert_eq!(render("%y %s", "x"), "%y x");
        assert_eq!(render("%jz%s", "x"), "%jzx");
        assert_eq!(render("%gz", ""), "%gz");
        assert_eq!(render("%s%", "x"), "x%");
    }

    #[test]
    fn validation_requires_a_message() {
        assert_eq!(LogTemplate::parse("[%t] %L").validate(), Err(TemplateError::MissingMessage));
        assert!(LogTemplate::parse("%cs").validate().is_ok());
        assert!(LogTemplate::parse("%h %gT %a %gb %jl %s").validate().is_ok());
    }

    #[test]
    fn validation_rejects_unknown_placeholders() {
        assert_eq!(
            LogTemplate::parse("%s %y").validate(),
            Err(TemplateError::UnknownPlaceholder("%y".to_string())),
        );
        assert!(LogTemplate::parse("%s %jn").validate().is_err());
        assert!(LogTemplate::parse("%s %gz").validate().is_err());
        assert!(LogTemplate::parse("%s %").validate().is_err());
    }
}
