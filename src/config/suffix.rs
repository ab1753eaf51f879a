use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// A validated date-time pattern used as a directory segment of the
/// destination path.
///
/// Patterns containing `%` are taken as strftime. Anything else is read as a
/// `yyyy-MM-dd`-style pattern; quoted text (`'T'`) is literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixPattern {
    source: String,
    strftime: String,
}

impl SuffixPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err("pattern is empty".to_string());
        }

        let strftime = if pattern.contains('%') {
            pattern.to_string()
        } else {
            translate_letter_pattern(pattern)?
        };

        if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
            return Err(format!("'{}' is not a valid date-time pattern", pattern));
        }

        Ok(Self {
            source: pattern.to_string(),
            strftime,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render<Tz>(&self, now: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        now.format(&self.strftime).to_string()
    }
}

fn translate_letter_pattern(pattern: &str) -> Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' {
            let end = chars[i + 1..]
                .iter()
                .position(|&q| q == '\'')
                .ok_or_else(|| format!("unterminated quote in '{}'", pattern))?;
            if end == 0 {
                out.push('\'');
            }
            for &lit in &chars[i + 1..i + 1 + end] {
                push_literal(&mut out, lit);
            }
            i += end + 2;
            continue;
        }

        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }

        let run = chars[i..].iter().take_while(|&&x| x == c).count();
        let spec = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) | ('u', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('S', 3) => "%3f",
            ('S', 6) => "%6f",
            ('S', 9) => "%9f",
            ('a', _) => "%p",
            ('E', n) if n < 4 => "%a",
            ('E', _) => "%A",
            ('D', _) => "%j",
            _ => {
                return Err(format!(
                    "unsupported pattern letter '{}' (x{}) in '{}'",
                    c, run, pattern
                ));
            }
        };
        out.push_str(spec);
        i += run;
    }

    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
