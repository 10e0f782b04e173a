//! Boolean keyword query language.
//!
//! Grammar (precedence NOT > AND > OR, parentheses override):
//!
//!   query   := or
//!   or      := and ("OR" and)*
//!   and     := unary (("AND")? unary)*      adjacent terms are implicit AND
//!   unary   := "NOT" unary | primary
//!   primary := "(" or ")" | quoted-phrase | bareword
//!
//! A literal matches when it occurs as a case-insensitive substring of the
//! paper's title + abstract. Parsing is total: any input either produces an
//! expression tree or fails with a [`QuerySyntaxError`] before evaluation.

use paperwatch_common::PaperwatchError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuerySyntaxError {
    #[error("empty query")]
    Empty,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("unterminated quoted phrase")]
    UnterminatedPhrase,
    #[error("dangling operator: {0}")]
    DanglingOperator(String),
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
}

impl From<QuerySyntaxError> for PaperwatchError {
    fn from(e: QuerySyntaxError) -> Self {
        PaperwatchError::QuerySyntax(e.to_string())
    }
}

/// Parsed query expression tree. Literals are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpr {
    Literal(String),
    And(Box<QueryExpr>, Box<QueryExpr>),
    Or(Box<QueryExpr>, Box<QueryExpr>),
    Not(Box<QueryExpr>),
}

impl QueryExpr {
    /// Parse a query string into an expression tree.
    pub fn parse(input: &str) -> Result<QueryExpr, QuerySyntaxError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(QuerySyntaxError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(Token::RParen) => Err(QuerySyntaxError::UnbalancedParens),
            Some(t) => Err(QuerySyntaxError::UnexpectedToken(t.describe())),
        }
    }

    /// OR-combine a keyword list into one query (the default digest query).
    /// Returns `None` for an empty list.
    pub fn any_of<S: AsRef<str>>(keywords: &[S]) -> Option<QueryExpr> {
        let mut expr: Option<QueryExpr> = None;
        for kw in keywords {
            let kw = kw.as_ref().trim();
            if kw.is_empty() {
                continue;
            }
            let lit = QueryExpr::Literal(kw.to_lowercase());
            expr = Some(match expr {
                None => lit,
                Some(prev) => QueryExpr::Or(Box::new(prev), Box::new(lit)),
            });
        }
        expr
    }

    /// Evaluate against a text (typically title + abstract).
    pub fn matches(&self, text: &str) -> bool {
        self.eval(&text.to_lowercase())
    }

    /// Literals that must (or may) be present for a match, i.e. every
    /// literal not under a NOT. Used to seed source-adapter keyword
    /// searches from an explicit query.
    pub fn positive_literals(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_positive(&mut out);
        out
    }

    fn collect_positive<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryExpr::Literal(term) => out.push(term.as_str()),
            QueryExpr::And(a, b) | QueryExpr::Or(a, b) => {
                a.collect_positive(out);
                b.collect_positive(out);
            }
            QueryExpr::Not(_) => {}
        }
    }

    fn eval(&self, lowered: &str) -> bool {
        match self {
            QueryExpr::Literal(term) => lowered.contains(term.as_str()),
            QueryExpr::And(a, b)     => a.eval(lowered) && b.eval(lowered),
            QueryExpr::Or(a, b)      => a.eval(lowered) || b.eval(lowered),
            QueryExpr::Not(inner)    => !inner.eval(lowered),
        }
    }
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Literal(s) => format!("\"{s}\""),
            Token::And        => "AND".to_string(),
            Token::Or         => "OR".to_string(),
            Token::Not        => "NOT".to_string(),
            Token::LParen     => "(".to_string(),
            Token::RParen     => ")".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, QuerySyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c)   => phrase.push(c),
                        None      => return Err(QuerySyntaxError::UnterminatedPhrase),
                    }
                }
                let phrase = phrase.trim().to_lowercase();
                if !phrase.is_empty() {
                    tokens.push(Token::Literal(phrase));
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                // Operators are recognized upper-case only, as written in
                // the query language; anything else is a search term.
                match word.as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR"  => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _     => tokens.push(Token::Literal(word.to_lowercase())),
                }
            }
        }
    }

    Ok(tokens)
}

// ── Recursive-descent parser ──────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<QueryExpr, QuerySyntaxError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = QueryExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<QueryExpr, QuerySyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.next();
                    let right = self.parse_unary()?;
                    left = QueryExpr::And(Box::new(left), Box::new(right));
                }
                // Implicit AND between adjacent operands.
                Some(Token::Literal(_)) | Some(Token::Not) | Some(Token::LParen) => {
                    let right = self.parse_unary()?;
                    left = QueryExpr::And(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<QueryExpr, QuerySyntaxError> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                let inner = self.parse_unary()?;
                Ok(QueryExpr::Not(Box::new(inner)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<QueryExpr, QuerySyntaxError> {
        match self.next() {
            Some(Token::Literal(term)) => Ok(QueryExpr::Literal(term)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(QuerySyntaxError::UnbalancedParens),
                }
            }
            Some(t @ (Token::And | Token::Or)) => {
                Err(QuerySyntaxError::DanglingOperator(t.describe()))
            }
            Some(Token::RParen) => Err(QuerySyntaxError::UnbalancedParens),
            Some(Token::Not) => unreachable!("NOT consumed by parse_unary"),
            None => Err(QuerySyntaxError::DanglingOperator("end of query".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_excludes_clinical_trial_abstract() {
        let q = QueryExpr::parse("single cell AND RNA NOT clinical").unwrap();
        assert!(!q.matches("single cell RNA sequencing in a clinical trial"));
    }

    #[test]
    fn matches_heterogeneity_abstract() {
        let q = QueryExpr::parse("single cell AND RNA NOT clinical").unwrap();
        assert!(q.matches("single cell RNA sequencing reveals heterogeneity"));
    }

    #[test]
    fn implicit_and_between_barewords() {
        let q = QueryExpr::parse("single cell").unwrap();
        assert_eq!(
            q,
            QueryExpr::And(
                Box::new(QueryExpr::Literal("single".to_string())),
                Box::new(QueryExpr::Literal("cell".to_string())),
            )
        );
    }

    #[test]
    fn quoted_phrase_is_one_literal() {
        let q = QueryExpr::parse(r#""single cell" AND atlas"#).unwrap();
        assert!(q.matches("a single cell atlas of the liver"));
        // The phrase must appear contiguously.
        assert!(!q.matches("a single atlas of one cell"));
    }

    #[test]
    fn or_has_lowest_precedence() {
        // a OR b AND c == a OR (b AND c)
        let q = QueryExpr::parse("alpha OR beta AND gamma").unwrap();
        assert!(q.matches("contains alpha only"));
        assert!(!q.matches("contains beta only"));
        assert!(q.matches("contains beta and gamma"));
    }

    #[test]
    fn not_binds_tighter_than_and() {
        // NOT a AND b == (NOT a) AND b
        let q = QueryExpr::parse("NOT mouse AND human").unwrap();
        assert!(q.matches("human organoid study"));
        assert!(!q.matches("human and mouse comparison"));
    }

    #[test]
    fn parentheses_override_precedence() {
        let q = QueryExpr::parse("(alpha OR beta) AND gamma").unwrap();
        assert!(!q.matches("contains alpha only"));
        assert!(q.matches("contains alpha and gamma"));
        assert!(q.matches("contains beta and gamma"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let q = QueryExpr::parse("CRISPR").unwrap();
        assert!(q.matches("a crispr screen"));
        let q = QueryExpr::parse("crispr").unwrap();
        assert!(q.matches("a CRISPR screen"));
    }

    #[test]
    fn syntax_errors_are_rejected() {
        assert_eq!(QueryExpr::parse(""), Err(QuerySyntaxError::Empty));
        assert_eq!(QueryExpr::parse("   "), Err(QuerySyntaxError::Empty));
        assert_eq!(
            QueryExpr::parse("(alpha OR beta"),
            Err(QuerySyntaxError::UnbalancedParens)
        );
        assert_eq!(
            QueryExpr::parse("alpha beta)"),
            Err(QuerySyntaxError::UnbalancedParens)
        );
        assert_eq!(
            QueryExpr::parse("alpha AND"),
            Err(QuerySyntaxError::DanglingOperator("end of query".to_string()))
        );
        assert_eq!(
            QueryExpr::parse("AND alpha"),
            Err(QuerySyntaxError::DanglingOperator("AND".to_string()))
        );
        assert_eq!(
            QueryExpr::parse("NOT"),
            Err(QuerySyntaxError::DanglingOperator("end of query".to_string()))
        );
        assert_eq!(
            QueryExpr::parse(r#""unterminated phrase"#),
            Err(QuerySyntaxError::UnterminatedPhrase)
        );
    }

    #[test]
    fn any_of_builds_or_chain() {
        let q = QueryExpr::any_of(&["proteomics", "metabolomics"]).unwrap();
        assert!(q.matches("advances in proteomics"));
        assert!(q.matches("a metabolomics survey"));
        assert!(!q.matches("genomics only"));
        assert!(QueryExpr::any_of::<&str>(&[]).is_none());
    }

    #[test]
    fn positive_literals_skip_negated_terms() {
        let q = QueryExpr::parse(r#"("single cell" OR organoid) AND RNA NOT clinical"#).unwrap();
        assert_eq!(q.positive_literals(), vec!["single cell", "organoid", "rna"]);
    }

    #[test]
    fn lowercase_operators_are_terms() {
        // "and" in lower case is a search term, not an operator.
        let q = QueryExpr::parse("bench and bedside").unwrap();
        assert!(q.matches("from bench and bedside together"));
        assert!(!q.matches("bench bedside"));
    }
}
