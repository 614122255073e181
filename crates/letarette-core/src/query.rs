//! Query parsing.
//!
//! Search syntax:
//!
//! ```text
//! <phrase> ::= word | "quoted string"
//! <query>  ::= [-] <phrase> [*]
//! <query>  ::= <query> <query>
//! ```
//!
//! A leading `-` excludes the phrase, a trailing `*` makes it a prefix search.
//! The parser never fails: anything it does not understand is skipped.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// One parsed query phrase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Phrase {
    pub text: String,
    pub wildcard: bool,
    pub exclude: bool,
}

impl Phrase {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn wildcard(mut self) -> Self {
        self.wildcard = true;
        self
    }

    pub fn exclude(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// True for phrases spanning more than one word.
    pub fn is_multi_word(&self) -> bool {
        self.text.contains(' ')
    }
}

impl fmt::Display for Phrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclude {
            f.write_str("-")?;
        }
        write!(f, "\"{}\"", self.text)?;
        if self.wildcard {
            f.write_str("*")?;
        }
        Ok(())
    }
}

/// Displays a phrase list as `[p1 p2 ...]`.
pub struct PhraseList<'a>(pub &'a [Phrase]);

impl fmt::Display for PhraseList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, phrase) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", phrase)?;
        }
        f.write_str("]")
    }
}

// ---------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------

enum Token {
    Word(String),
    Quoted(String),
    Char(char),
}

fn is_word_char(c: char, position: usize) -> bool {
    if c == '-' && position == 0 {
        return false;
    }
    if matches!(c, '*' | '"' | '\'' | '(' | ')') {
        return false;
    }
    !c.is_whitespace() && !c.is_control()
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    /// Reads a quoted string, opening quote already consumed. Stops at the
    /// closing quote, a newline or end of input. Returned text keeps the
    /// quotes that were actually present.
    fn quoted(&mut self) -> String {
        let mut text = String::from('"');
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => break,
                '"' => {
                    self.chars.next();
                    text.push('"');
                    break;
                }
                '\\' => {
                    self.chars.next();
                    text.push('\\');
                    if let Some(&escaped) = self.chars.peek() {
                        if escaped != '\n' {
                            self.chars.next();
                            text.push(escaped);
                        }
                    }
                }
                _ => {
                    self.chars.next();
                    text.push(c);
                }
            }
        }
        text
    }
}

impl Iterator for Scanner<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
        let first = self.chars.next()?;
        if is_word_char(first, 0) {
            let mut word = String::from(first);
            while let Some(&c) = self.chars.peek() {
                if !is_word_char(c, word.len()) {
                    break;
                }
                word.push(c);
                self.chars.next();
            }
            return Some(Token::Word(word));
        }
        if first == '"' {
            return Some(Token::Quoted(self.quoted()));
        }
        Some(Token::Char(first))
    }
}

fn unquote(text: &str) -> &str {
    let text = text.strip_prefix('"').unwrap_or(text);
    text.strip_suffix('"').unwrap_or(text)
}

/// Tokenize a query into phrases with exclusion and wildcard flags.
pub fn parse_query(query: &str) -> Vec<Phrase> {
    let mut result: Vec<Phrase> = Vec::new();
    let mut exclude_next = false;

    for token in Scanner::new(query) {
        match token {
            Token::Word(text) => {
                result.push(Phrase {
                    text,
                    wildcard: false,
                    exclude: exclude_next,
                });
                exclude_next = false;
            }
            Token::Quoted(text) => {
                result.push(Phrase {
                    text: unquote(&text).to_string(),
                    wildcard: false,
                    exclude: exclude_next,
                });
                exclude_next = false;
            }
            Token::Char('-') => exclude_next = true,
            Token::Char('*') => {
                if let Some(last) = result.last_mut() {
                    last.wildcard = true;
                }
            }
            Token::Char(_) => {}
        }
    }

    result
}

// ---------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------

static SINGLE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\PL\pL\PL").unwrap());
static SINGLE_CHAR_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\pL\PL").unwrap());
static SINGLE_CHAR_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\PL\pL$").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn reduce_phrase(phrase: &str) -> String {
    let reduced = unquote(phrase);

    let mut chars = reduced.chars();
    if let (Some(only), None) = (chars.next(), chars.next()) {
        if !only.is_numeric() {
            return String::new();
        }
    }

    let reduced = SINGLE_CHARS.replace_all(reduced, " ");
    let reduced = SINGLE_CHAR_START.replace_all(&reduced, " ");
    let reduced = SINGLE_CHAR_END.replace_all(&reduced, " ");
    let reduced = WHITESPACE.replace_all(&reduced, " ");
    reduced.trim().to_string()
}

/// Drop one-letter phrases and cut one-letter words out of longer phrases.
pub fn reduce_phrase_list(phrases: Vec<Phrase>) -> Vec<Phrase> {
    phrases
        .into_iter()
        .filter_map(|mut phrase| {
            phrase.text = reduce_phrase(&phrase.text);
            (!phrase.text.is_empty()).then_some(phrase)
        })
        .collect()
}

/// Lower-case, sort and deduplicate a phrase list. Used as cache key.
pub fn canonicalize_phrase_list(phrases: &[Phrase]) -> Vec<Phrase> {
    let mut result: Vec<Phrase> = phrases
        .iter()
        .map(|p| Phrase {
            text: p.text.to_lowercase(),
            ..p.clone()
        })
        .collect();
    result.sort_by(|a, b| {
        a.text
            .cmp(&b.text)
            .then(a.exclude.cmp(&b.exclude))
            .then(a.wildcard.cmp(&b.wildcard))
    });
    result.dedup();
    result
}
