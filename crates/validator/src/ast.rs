//! Minimal Bourne-shell grammar for the static pre-filter.
//!
//! This is not an interpreter; it parses just enough structure to answer
//! one question — where are the command-position words, and do they carry
//! parameter expansion? Node coverage: simple commands, pipelines, lists
//! (`;`, `&`, `&&`, `||`), `if`/`while`/`until`/`for`/`select`, `case`,
//! brace groups, subshells, and function bodies. Anything outside the
//! grammar is a parse error, which callers treat as "fall through to the
//! LLM path" — never as safe.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AstError {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("unexpected token '{0}'")]
    Unexpected(String),
    #[error("unexpected end of input (wanted '{0}')")]
    UnexpectedEof(String),
}

/// One shell word, with the single fact the walker cares about precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    /// `$NAME` / `${…}` seen outside single quotes. Command substitution
    /// and arithmetic (`$(`) do not count.
    pub has_param_expansion: bool,
}

impl Word {
    /// `NAME=value` form: identifier, then `=`, anywhere in a command's
    /// leading words or after `export`.
    pub fn is_assignment(&self) -> bool {
        let Some(eq) = self.text.find('=') else {
            return false;
        };
        let name = &self.text[..eq];
        let mut chars = name.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseArm {
    pub patterns: Vec<String>,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Simple command: assignments and words in source order.
    Command { words: Vec<Word> },
    /// Two or more `|`-joined segments.
    Pipeline { segments: Vec<Node> },
    /// `&&` / `||` joined sequence (flattened; the operators don't matter
    /// to the walker).
    List { nodes: Vec<Node> },
    If {
        /// `(condition, body)` for the `if` and each `elif`.
        arms: Vec<(Vec<Node>, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
    },
    /// `for`/`select` share a shape.
    For { var: String, body: Vec<Node> },
    While { cond: Vec<Node>, body: Vec<Node> },
    Until { cond: Vec<Node>, body: Vec<Node> },
    Case { subject: Word, arms: Vec<CaseArm> },
    BraceGroup { body: Vec<Node> },
    Subshell { body: Vec<Node> },
    FunctionDef { name: String, body: Box<Node> },
}

pub fn parse(input: &str) -> Result<Vec<Node>, AstError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let nodes = parser.parse_list(&[])?;
    if parser.pos < parser.tokens.len() {
        return Err(AstError::Unexpected(parser.tokens[parser.pos].display()));
    }
    Ok(nodes)
}

// ── Tokenizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(Word),
    Op(&'static str),
}

impl Token {
    fn display(&self) -> String {
        match self {
            Token::Word(w) => w.text.clone(),
            Token::Op(op) => (*op).to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, AstError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_expansion = false;
    let mut i = 0;

    let flush = |tokens: &mut Vec<Token>, current: &mut String, has_expansion: &mut bool| {
        if !current.is_empty() {
            tokens.push(Token::Word(Word {
                text: std::mem::take(current),
                has_param_expansion: std::mem::take(has_expansion),
            }));
        }
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => {
                flush(&mut tokens, &mut current, &mut has_expansion);
                if c == '\n' {
                    tokens.push(Token::Op(";"));
                }
                i += 1;
            }
            '\\' => {
                // Escaped character, literal; the backslash is kept so the
                // word text mirrors the source.
                current.push(c);
                if i + 1 < chars.len() {
                    current.push(chars[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '\'')
                    .ok_or(AstError::UnterminatedQuote)?;
                current.push('\'');
                current.extend(&chars[i + 1..i + 1 + end]);
                current.push('\'');
                i += end + 2;
            }
            '"' => {
                i += 1;
                current.push('"');
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(AstError::UnterminatedQuote);
                    };
                    match ch {
                        '"' => {
                            current.push('"');
                            i += 1;
                            break;
                        }
                        '\\' if i + 1 < chars.len() => {
                            current.push(ch);
                            current.push(chars[i + 1]);
                            i += 2;
                        }
                        '$' => {
                            i += consume_dollar(&chars[i..], &mut current, &mut has_expansion)?;
                        }
                        _ => {
                            current.push(ch);
                            i += 1;
                        }
                    }
                }
            }
            '$' => {
                i += consume_dollar(&chars[i..], &mut current, &mut has_expansion)?;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .ok_or(AstError::UnterminatedQuote)?;
                current.push('`');
                current.extend(&chars[i + 1..i + 1 + end]);
                current.push('`');
                i += end + 2;
            }
            ';' | '&' | '|' | '(' | ')' => {
                flush(&mut tokens, &mut current, &mut has_expansion);
                let op = match (c, chars.get(i + 1).copied()) {
                    (';', Some(';')) => {
                        i += 2;
                        ";;"
                    }
                    ('&', Some('&')) => {
                        i += 2;
                        "&&"
                    }
                    ('|', Some('|')) => {
                        i += 2;
                        "||"
                    }
                    (';', _) => {
                        i += 1;
                        ";"
                    }
                    ('&', _) => {
                        i += 1;
                        "&"
                    }
                    ('|', _) => {
                        i += 1;
                        "|"
                    }
                    ('(', _) => {
                        i += 1;
                        "("
                    }
                    _ => {
                        i += 1;
                        ")"
                    }
                };
                tokens.push(Token::Op(op));
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    flush(&mut tokens, &mut current, &mut has_expansion);
    Ok(tokens)
}

/// Consume a `$…` construct starting at `chars[0] == '$'`. Returns how many
/// chars were consumed. Parameter expansion sets the flag; `$(…)` and
/// `$((…))` are copied verbatim (balanced) without setting it.
fn consume_dollar(
    chars: &[char],
    current: &mut String,
    has_expansion: &mut bool,
) -> Result<usize, AstError> {
    match chars.get(1).copied() {
        Some('(') => {
            // Command substitution or arithmetic; copy balanced.
            let mut depth = 0usize;
            for (offset, &ch) in chars.iter().enumerate().skip(1) {
                match ch {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            current.extend(&chars[..=offset]);
                            return Ok(offset + 1);
                        }
                    }
                    _ => {}
                }
            }
            Err(AstError::UnterminatedQuote)
        }
        Some('{') => {
            let end = chars
                .iter()
                .position(|&ch| ch == '}')
                .ok_or(AstError::UnterminatedQuote)?;
            current.extend(&chars[..=end]);
            *has_expansion = true;
            Ok(end + 1)
        }
        Some(next) if next.is_ascii_alphanumeric() || next == '_' => {
            let mut len = 1;
            while chars
                .get(len)
                .is_some_and(|&ch| ch.is_ascii_alphanumeric() || ch == '_')
            {
                len += 1;
            }
            current.extend(&chars[..len]);
            *has_expansion = true;
            Ok(len)
        }
        _ => {
            current.push('$');
            Ok(1)
        }
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

const RESERVED_TERMINATORS: &[&str] = &["then", "do", "done", "fi", "elif", "else", "esac", "}"];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_is(&self, what: &str) -> bool {
        match self.peek() {
            Some(Token::Op(op)) => *op == what,
            Some(Token::Word(w)) => w.text == what,
            None => false,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, what: &str) -> Result<(), AstError> {
        if self.peek_is(what) {
            self.pos += 1;
            return Ok(());
        }
        match self.peek() {
            Some(token) => Err(AstError::Unexpected(token.display())),
            None => Err(AstError::UnexpectedEof(what.to_string())),
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(Token::Op(";")) | Some(Token::Op("&"))) {
            self.pos += 1;
        }
    }

    /// Parse commands until end of input or one of `terminators` (matched
    /// against both operators and reserved words, which are not consumed).
    fn parse_list(&mut self, terminators: &[&str]) -> Result<Vec<Node>, AstError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                None => break,
                Some(token) => {
                    let text = token.display();
                    if terminators.contains(&text.as_str()) {
                        break;
                    }
                }
            }
            nodes.push(self.parse_and_or(terminators)?);
        }
        Ok(nodes)
    }

    fn parse_and_or(&mut self, terminators: &[&str]) -> Result<Node, AstError> {
        let first = self.parse_pipeline(terminators)?;
        if !self.peek_is("&&") && !self.peek_is("||") {
            return Ok(first);
        }
        let mut nodes = vec![first];
        while self.peek_is("&&") || self.peek_is("||") {
            self.pos += 1;
            nodes.push(self.parse_pipeline(terminators)?);
        }
        Ok(Node::List { nodes })
    }

    fn parse_pipeline(&mut self, terminators: &[&str]) -> Result<Node, AstError> {
        let first = self.parse_command(terminators)?;
        if !self.peek_is("|") {
            return Ok(first);
        }
        let mut segments = vec![first];
        while self.peek_is("|") {
            self.pos += 1;
            segments.push(self.parse_command(terminators)?);
        }
        Ok(Node::Pipeline { segments })
    }

    fn parse_command(&mut self, terminators: &[&str]) -> Result<Node, AstError> {
        match self.peek() {
            Some(Token::Op("(")) => {
                self.pos += 1;
                let body = self.parse_list(&[")"])?;
                self.expect(")")?;
                return Ok(Node::Subshell { body });
            }
            Some(Token::Word(word)) => match word.text.as_str() {
                "if" => return self.parse_if(),
                "while" => return self.parse_while_until(true),
                "until" => return self.parse_while_until(false),
                "for" | "select" => return self.parse_for(),
                "case" => return self.parse_case(),
                "{" => {
                    self.pos += 1;
                    let body = self.parse_list(&["}"])?;
                    self.expect("}")?;
                    return Ok(Node::BraceGroup { body });
                }
                "function" => {
                    self.pos += 1;
                    let name = self.take_word()?.text;
                    if self.peek_is("(") {
                        self.pos += 1;
                        self.expect(")")?;
                    }
                    let body = self.parse_command(terminators)?;
                    return Ok(Node::FunctionDef {
                        name,
                        body: Box::new(body),
                    });
                }
                _ => {}
            },
            _ => {}
        }
        self.parse_simple(terminators)
    }

    fn parse_simple(&mut self, terminators: &[&str]) -> Result<Node, AstError> {
        let mut words = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Word(word)) => {
                    if RESERVED_TERMINATORS.contains(&word.text.as_str())
                        || terminators.contains(&word.text.as_str())
                    {
                        break;
                    }
                    words.push(word.clone());
                    self.pos += 1;
                }
                // `name()` function definition.
                Some(Token::Op("(")) if words.len() == 1 && !words[0].is_assignment() => {
                    self.pos += 1;
                    self.expect(")")?;
                    self.skip_separators();
                    let name = words.remove(0).text;
                    let body = self.parse_command(terminators)?;
                    return Ok(Node::FunctionDef {
                        name,
                        body: Box::new(body),
                    });
                }
                _ => break,
            }
        }
        if words.is_empty() {
            match self.peek() {
                Some(token) => return Err(AstError::Unexpected(token.display())),
                None => return Err(AstError::UnexpectedEof("command".to_string())),
            }
        }
        Ok(Node::Command { words })
    }

    fn take_word(&mut self) -> Result<Word, AstError> {
        match self.advance() {
            Some(Token::Word(word)) => Ok(word),
            Some(token) => Err(AstError::Unexpected(token.display())),
            None => Err(AstError::UnexpectedEof("word".to_string())),
        }
    }

    fn parse_if(&mut self) -> Result<Node, AstError> {
        self.expect("if")?;
        let mut arms = Vec::new();
        let cond = self.parse_list(&["then"])?;
        self.expect("then")?;
        let body = self.parse_list(&["fi", "elif", "else"])?;
        arms.push((cond, body));
        while self.peek_is("elif") {
            self.pos += 1;
            let cond = self.parse_list(&["then"])?;
            self.expect("then")?;
            let body = self.parse_list(&["fi", "elif", "else"])?;
            arms.push((cond, body));
        }
        let else_body = if self.peek_is("else") {
            self.pos += 1;
            Some(self.parse_list(&["fi"])?)
        } else {
            None
        };
        self.expect("fi")?;
        Ok(Node::If { arms, else_body })
    }

    fn parse_while_until(&mut self, is_while: bool) -> Result<Node, AstError> {
        self.pos += 1; // while / until
        let cond = self.parse_list(&["do"])?;
        self.expect("do")?;
        let body = self.parse_list(&["done"])?;
        self.expect("done")?;
        Ok(if is_while {
            Node::While { cond, body }
        } else {
            Node::Until { cond, body }
        })
    }

    fn parse_for(&mut self) -> Result<Node, AstError> {
        self.pos += 1; // for / select
        let var = self.take_word()?.text;
        if self.peek_is("in") {
            self.pos += 1;
            // The iteration words end at ; or the `do` keyword.
            loop {
                let stop = match self.peek() {
                    Some(Token::Word(word)) => word.text == "do",
                    _ => true,
                };
                if stop {
                    break;
                }
                self.pos += 1;
            }
        }
        self.skip_separators();
        self.expect("do")?;
        let body = self.parse_list(&["done"])?;
        self.expect("done")?;
        Ok(Node::For { var, body })
    }

    fn parse_case(&mut self) -> Result<Node, AstError> {
        self.expect("case")?;
        let subject = self.take_word()?;
        self.expect("in")?;
        let mut arms = Vec::new();
        loop {
            self.skip_separators();
            while self.peek_is(";;") {
                self.pos += 1;
                self.skip_separators();
            }
            if self.peek_is("esac") {
                self.pos += 1;
                break;
            }
            // Optional leading ( before the pattern list.
            if self.peek_is("(") {
                self.pos += 1;
            }
            let mut patterns = Vec::new();
            loop {
                patterns.push(self.take_word()?.text);
                if self.peek_is("|") {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            self.expect(")")?;
            let body = self.parse_list(&[";;", "esac"])?;
            arms.push(CaseArm { patterns, body });
        }
        Ok(Node::Case { subject, arms })
    }
}
