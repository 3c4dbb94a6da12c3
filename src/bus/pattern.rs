//! Glob-style subject patterns, compiled once at subscribe time.
//!
//! `*` matches any run of characters (including dots), `?` matches a
//! single character. `pm.*` therefore matches `pm.account.loaded` and
//! all of its siblings.

/// A compiled subject pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// A literal run of characters.
    Literal(String),
    /// `*`: any run, possibly empty.
    AnyRun,
    /// `?`: exactly one character.
    AnyChar,
}

impl Pattern {
    pub fn compile(raw: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        for ch in raw.chars() {
            match ch {
                '*' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    // Collapse consecutive stars.
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '?' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::AnyChar);
                }
                _ => literal.push(ch),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Self { raw: raw.to_string(), tokens }
    }

    /// Whether a subscription string needs glob evaluation at all.
    pub fn is_wildcard(raw: &str) -> bool {
        raw.contains(['*', '?'])
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, subject: &str) -> bool {
        Self::match_tokens(&self.tokens, &subject.chars().collect::<Vec<_>>())
    }

    fn match_tokens(tokens: &[Token], chars: &[char]) -> bool {
        match tokens.split_first() {
            None => chars.is_empty(),
            Some((Token::Literal(lit), rest)) => {
                let lit: Vec<char> = lit.chars().collect();
                chars.len() >= lit.len()
                    && chars[..lit.len()] == lit[..]
                    && Self::match_tokens(rest, &chars[lit.len()..])
            }
            Some((Token::AnyChar, rest)) => {
                !chars.is_empty() && Self::match_tokens(rest, &chars[1..])
            }
            Some((Token::AnyRun, rest)) => {
                // Try every possible consumption length, shortest first.
                (0..=chars.len()).any(|n| Self::match_tokens(rest, &chars[n..]))
            }
        }
    }
}
