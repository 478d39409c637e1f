//! Tokenizer for devicetree source files.
//!
//! The lexer works one token at a time so that `/include/` can splice another
//! file in at any token boundary. Which recognizer runs after the stateless
//! ones depends on the previous token: after `{`, `;` and the node/property
//! deletion keywords a property or node name is expected, after `[` a byte,
//! and everywhere else a number.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while1, take_while_m_n},
    character::complete::{
        alpha1, alphanumeric1, anychar, char, digit1, hex_digit1, multispace0, multispace1,
        not_line_ending, space1,
    },
    combinator::{eof, map, opt, recognize, value},
    error::ParseError,
    multi::{many0, many1, many_m_n},
    sequence::{delimited, pair, preceded, terminated, tuple},
};
use nom_locate::LocatedSpan;

use super::Error;

pub type Span<'a> = LocatedSpan<&'a str>;

type IResult<'a, T, E> = nom::IResult<Span<'a>, T, E>;

/// A devicetree source token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Integer or character literal.
    Num(u64),
    /// String literal, unescaped and without the NUL terminator.
    Str(Vec<u8>),
    /// Two-digit byte inside `[ ... ]`.
    Byte(u8),
    /// Property or node name.
    Name(String),
    /// Label definition, without the trailing `:`.
    Label(String),
    /// `&label` or `&{/path}`, without the leading `&`.
    Ref(String),
    DtsV1,
    Plugin,
    Memreserve,
    Bits,
    DeleteProp,
    DeleteNode,
    OmitIfNoRef,
    Incbin,
    Punct(&'static str),
    /// Input that no recognizer accepts.
    Bad,
    Eof,
}

impl Token {
    /// Returns true if this is the punctuation or operator `p`.
    pub fn is(&self, p: &str) -> bool {
        matches!(self, Token::Punct(q) if *q == p)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{}\"", String::from_utf8_lossy(s)),
            Token::Byte(b) => write!(f, "{b:02X}"),
            Token::Name(n) => f.write_str(n),
            Token::Label(l) => write!(f, "{l}:"),
            Token::Ref(r) => write!(f, "&{r}"),
            Token::DtsV1 => f.write_str("/dts-v1/"),
            Token::Plugin => f.write_str("/plugin/"),
            Token::Memreserve => f.write_str("/memreserve/"),
            Token::Bits => f.write_str("/bits/"),
            Token::DeleteProp => f.write_str("/delete-property/"),
            Token::DeleteNode => f.write_str("/delete-node/"),
            Token::OmitIfNoRef => f.write_str("/omit-if-no-ref/"),
            Token::Incbin => f.write_str("/incbin/"),
            Token::Punct(p) => f.write_str(p),
            Token::Bad => f.write_str("<unknown token>"),
            Token::Eof => f.write_str("<EOF>"),
        }
    }
}

/// Position of a token, as reported in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (column {})", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    ExpectName,
    ExpectByte,
}

/// One file on the include stack.
#[derive(Debug)]
struct SourceFile {
    path: PathBuf,
    /// Name used in diagnostics. Changed by `#line` markers.
    name: String,
    text: String,
    pos: usize,
    line: u32,
    column: usize,
}

impl SourceFile {
    fn new(path: PathBuf, text: String) -> Self {
        Self {
            name: path.display().to_string(),
            path,
            text,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn location(&self) -> Location {
        Location {
            file: self.name.clone(),
            line: self.line,
            column: self.column,
        }
    }

    /// Moves past the input consumed up to `step`.
    fn advance(&mut self, step: Step) {
        let Step {
            offset,
            line,
            column,
        } = step;

        self.pos += offset;
        if line == 1 {
            self.column += column - 1;
        } else {
            self.line += line - 1;
            self.column = column;
        }
    }
}

/// Where the unconsumed input starts, relative to the slice that was lexed.
#[derive(Debug, Clone, Copy)]
struct Step {
    offset: usize,
    line: u32,
    column: usize,
}

impl Step {
    fn of(rest: &Span) -> Self {
        Self {
            offset: rest.location_offset(),
            line: rest.location_line(),
            column: rest.get_utf8_column(),
        }
    }
}

/// Lexemes that don't depend on the lexer state, plus the state-dependent
/// ones, borrowed from the input.
#[derive(Debug, Clone)]
enum Raw<'a> {
    Include(&'a str),
    LineMarker(&'a str, &'a str),
    Str(&'a str),
    Keyword(Token),
    Label(&'a str),
    Char(&'a str),
    Ref(&'a str),
    Skip,
    Eof,
    Num(&'a str),
    Name(&'a str),
    Byte(&'a str),
    Punct(&'static str),
}

/// Streaming tokenizer over a devicetree source file and the files it
/// includes.
#[derive(Debug)]
pub struct Lexer {
    current: SourceFile,
    stack: Vec<SourceFile>,
    include_path: Vec<PathBuf>,
    state: State,
    peeked: Option<Token>,
    loc: Location,
}

impl Lexer {
    /// Creates a lexer reading the file at `path`.
    pub fn open(path: impl AsRef<Path>, include_path: &[PathBuf]) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(path, text, include_path))
    }

    /// Creates a lexer over `text`. `path` names the source in diagnostics
    /// and anchors relative `/include/` and `/incbin/` lookups.
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>, include_path: &[PathBuf]) -> Self {
        let current = SourceFile::new(path.into(), text.into());
        Self {
            loc: current.location(),
            current,
            stack: Vec::new(),
            include_path: include_path.to_vec(),
            state: State::Default,
            peeked: None,
        }
    }

    /// Location of the most recently lexed token.
    pub fn location(&self) -> &Location {
        &self.loc
    }

    /// Builds a parse error at the most recent token.
    pub fn error(&self, msg: impl Into<String>) -> Error {
        Error::Parse {
            file: self.loc.file.clone(),
            line: self.loc.line,
            column: self.loc.column,
            msg: msg.into(),
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek(&mut self) -> Result<&Token, Error> {
        if self.peeked.is_none() {
            let tok = self.lex()?;
            self.peeked = Some(tok);
        }
        match &self.peeked {
            Some(tok) => Ok(tok),
            None => Err(self.error("lexer lost its lookahead")),
        }
    }

    /// Consumes and returns the next token.
    pub fn next_token(&mut self) -> Result<Token, Error> {
        match self.peeked.take() {
            Some(tok) => Ok(tok),
            None => self.lex(),
        }
    }

    /// Consumes the next token if it is the punctuation `p`.
    pub fn check(&mut self, p: &str) -> Result<bool, Error> {
        if self.peek()?.is(p) {
            self.next_token()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Consumes the punctuation `p` or fails.
    pub fn expect(&mut self, p: &str) -> Result<(), Error> {
        let tok = self.next_token()?;
        if !tok.is(p) {
            return Err(self.error(format!("expected '{p}', not '{tok}'")));
        }
        Ok(())
    }

    /// Finds `name` next to the current file, then along the include path.
    pub fn find_file(&self, name: &str) -> Result<PathBuf, Error> {
        let dir = self.current.path.parent().unwrap_or_else(|| Path::new(""));
        std::iter::once(dir)
            .chain(self.include_path.iter().map(PathBuf::as_path))
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| self.error(format!("'{name}' could not be found")))
    }

    fn lex(&mut self) -> Result<Token, Error> {
        loop {
            let start = self.current.location();
            let input = Span::new(&self.current.text[self.current.pos..]);

            let (rest, raw) = match raw_lexeme::<nom::error::Error<Span>>(
                input,
                self.state,
                self.current.column == 1,
            ) {
                Ok(ok) => ok,
                Err(_) => {
                    self.loc = start;
                    return Ok(Token::Bad);
                }
            };
            self.loc = start;
            let step = Step::of(&rest);

            let tok = match raw {
                Raw::Skip => None,
                Raw::Eof => Some(Token::Eof),
                Raw::Include(name) => {
                    let name = name.to_owned();
                    self.current.advance(step);
                    self.enter_file(&name)?;
                    continue;
                }
                Raw::LineMarker(line, name) => {
                    let line = line
                        .parse::<u32>()
                        .map_err(|_| self.error(format!("bad line number '{line}'")))?;
                    let name = name.to_owned();
                    self.current.advance(step);
                    self.current.line = line.saturating_sub(1);
                    self.current.name = name;
                    continue;
                }
                Raw::Str(s) => Some(Token::Str(unescape(s).map_err(|e| self.error(e))?)),
                Raw::Char(s) => {
                    let bytes = unescape(s).map_err(|e| self.error(e))?;
                    match bytes[..] {
                        [b] => Some(Token::Num(b.into())),
                        _ => return Err(self.error("character literals must be length 1")),
                    }
                }
                Raw::Keyword(tok) => Some(tok),
                Raw::Label(s) => Some(Token::Label(s.to_owned())),
                Raw::Ref(s) => Some(Token::Ref(s.to_owned())),
                Raw::Num(s) => Some(Token::Num(parse_num(s).map_err(|e| self.error(e))?)),
                Raw::Name(s) => Some(Token::Name(s.to_owned())),
                Raw::Byte(s) => Some(Token::Byte(
                    u8::from_str_radix(s, 16).map_err(|e| self.error(e.to_string()))?,
                )),
                Raw::Punct(p) => Some(Token::Punct(p)),
            };
            self.current.advance(step);

            let Some(tok) = tok else {
                continue;
            };

            if tok == Token::Eof {
                if let Some(parent) = self.stack.pop() {
                    self.current = parent;
                    continue;
                }
                return Ok(tok);
            }

            self.state = match &tok {
                Token::DeleteProp | Token::DeleteNode | Token::OmitIfNoRef => State::ExpectName,
                Token::Punct("{") | Token::Punct(";") => State::ExpectName,
                Token::Punct("[") => State::ExpectByte,
                Token::Memreserve | Token::Bits | Token::Punct("]") | Token::Name(_) => {
                    State::Default
                }
                _ => self.state,
            };

            return Ok(tok);
        }
    }

    /// Pushes the `/include/`d file `raw_name` onto the include stack.
    fn enter_file(&mut self, raw_name: &str) -> Result<(), Error> {
        let name = String::from_utf8(unescape(raw_name).map_err(|e| self.error(e))?)
            .map_err(|_| self.error("filename is not valid UTF-8"))?;
        let path = self.find_file(&name)?;

        let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        let active = self.stack.iter().chain(std::iter::once(&self.current));
        if let Some(i) = active.clone().position(|f| {
            fs::canonicalize(&f.path).unwrap_or_else(|_| f.path.clone()) == canonical
        }) {
            let chain = active
                .skip(i)
                .map(|f| format!("{}:{}", f.name, f.line))
                .chain(std::iter::once(name))
                .collect::<Vec<_>>()
                .join(" ->\n");
            return Err(self.error(format!("recursive /include/:\n{chain}")));
        }

        let text = fs::read_to_string(&path).map_err(|e| {
            self.error(format!("could not read '{}': {e}", path.display()))
        })?;
        let parent = std::mem::replace(&mut self.current, SourceFile::new(path, text));
        self.stack.push(parent);
        Ok(())
    }
}

/// Converts the text of an integer literal (suffix already stripped).
fn parse_num(s: &str) -> Result<u64, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None if s.len() > 1 && s.starts_with('0') => (&s[1..], 8),
        None => (s, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("bad number '{s}': {e}"))
}

/// Replaces backslash escapes in a string or character literal.
///
/// Works on bytes since octal and hex escapes need not produce valid UTF-8.
pub(crate) fn unescape(raw: &str) -> Result<Vec<u8>, String> {
    enum Piece<'a> {
        Text(&'a str),
        Octal(&'a str),
        Hex(&'a str),
        Char(char),
    }

    let escape = preceded(
        char::<&str, nom::error::Error<&str>>('\\'),
        alt((
            map(take_while_m_n(1, 3, |c: char| c.is_digit(8)), Piece::Octal),
            map(
                preceded(char('x'), take_while_m_n(1, 2, |c: char| c.is_ascii_hexdigit())),
                Piece::Hex,
            ),
            map(anychar, Piece::Char),
        )),
    );

    let (_, pieces) = many0(alt((escape, map(is_not("\\"), Piece::Text))))(raw)
        .map_err(|e| format!("malformed escape: {e}"))?;

    let mut out = Vec::with_capacity(raw.len());
    for piece in pieces {
        match piece {
            Piece::Text(s) => out.extend_from_slice(s.as_bytes()),
            Piece::Octal(s) => {
                let n = u32::from_str_radix(s, 8).map_err(|e| e.to_string())?;
                let b = u8::try_from(n).map_err(|_| "octal escape out of range (> 255)")?;
                out.push(b);
            }
            Piece::Hex(s) => out.push(u8::from_str_radix(s, 16).map_err(|e| e.to_string())?),
            Piece::Char(c) => match c {
                'a' => out.push(0x07),
                'b' => out.push(0x08),
                't' => out.push(b'\t'),
                'n' => out.push(b'\n'),
                'v' => out.push(0x0b),
                'f' => out.push(0x0c),
                'r' => out.push(b'\r'),
                c => out.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
            },
        }
    }
    Ok(out)
}

/// Recognize the next lexeme.
fn raw_lexeme<'a, E: ParseError<Span<'a>>>(
    input: Span<'a>,
    state: State,
    line_start: bool,
) -> IResult<'a, Raw<'a>, E> {
    if line_start {
        if let Ok((rest, (line, name))) = line_marker::<E>(input) {
            return Ok((rest, Raw::LineMarker(line, name)));
        }
    }

    let stateless = alt((
        map(include_directive, Raw::Include),
        map(string_literal, Raw::Str),
        map(keyword, Raw::Keyword),
        map(label, Raw::Label),
        map(char_literal, Raw::Char),
        map(reference, Raw::Ref),
        value(Raw::Skip, skip),
        value(Raw::Eof, eof),
    ));

    let stateful = move |i: Span<'a>| match state {
        State::Default => map(number, Raw::Num)(i),
        State::ExpectName => map(prop_node_name, Raw::Name)(i),
        State::ExpectByte => map(hex_byte, Raw::Byte)(i),
    };

    alt((stateless, stateful, map(punct, Raw::Punct)))(input)
}

/* === Token recognizers === */

/// Parse an `/include/ "file"` directive, returning the raw file name.
fn include_directive<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    preceded(pair(tag("/include/"), multispace0), string_literal)(input)
}

/// Parse a `#line 12 "file"` directive or a GCC linemarker (`# 12 "file" 2`).
fn line_marker<'a, E: ParseError<Span<'a>>>(
    input: Span<'a>,
) -> IResult<'a, (&'a str, &'a str), E> {
    map(
        tuple((
            char('#'),
            opt(tag("line")),
            space1,
            digit1,
            space1,
            string_literal,
            many_m_n(0, 4, preceded(space1, digit1)),
        )),
        |(_, _, _, line, _, name, _)| (*line.fragment(), name),
    )(input)
}

/// Parse a double-quoted string literal, returning its raw (escaped) contents.
fn string_literal<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        delimited(char('"'), quoted_contents("\\\""), char('"')),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Parse a single-quoted character literal, returning its raw contents.
fn char_literal<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        delimited(char('\''), quoted_contents("\\'"), char('\'')),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Recognize the inside of a quoted literal, skipping over escapes.
fn quoted_contents<'a, E: ParseError<Span<'a>>>(
    stop: &'static str,
) -> impl FnMut(Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(many0(alt((
        recognize(pair(char('\\'), anychar)),
        is_not(stop),
    ))))
}

/// Recognize one of the `/keyword/` directives.
fn keyword<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Token, E> {
    alt((
        value(Token::DtsV1, tag("/dts-v1/")),
        value(Token::Plugin, tag("/plugin/")),
        value(Token::Memreserve, tag("/memreserve/")),
        value(Token::Bits, tag("/bits/")),
        value(Token::DeleteProp, tag("/delete-property/")),
        value(Token::DeleteNode, tag("/delete-node/")),
        value(Token::OmitIfNoRef, tag("/omit-if-no-ref/")),
        value(Token::Incbin, tag("/incbin/")),
    ))(input)
}

/// Recognize a C identifier, as used by labels.
fn identifier<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_")))),
        )),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Parse a label definition (`foo:`).
fn label<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    terminated(identifier, char(':'))(input)
}

/// Parse a label or path reference (`&foo`, `&{/foo/bar}`).
///
/// Path references keep their braces so that they can be told apart later.
fn reference<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    let path = map(
        recognize(delimited(
            char('{'),
            opt(take_while1(|c: char| {
                c.is_ascii_alphanumeric() || ",._+*#?@/-".contains(c)
            })),
            char('}'),
        )),
        |s: Span<'a>| *s.fragment(),
    );

    preceded(char('&'), alt((identifier, path)))(input)
}

/// Parse an integer literal, dropping any C suffix.
fn number<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        terminated(
            recognize(alt((preceded(tag_no_case("0x"), hex_digit1), digit1))),
            opt(alt((tag("ULL"), tag("UL"), tag("LL"), tag("U"), tag("L")))),
        ),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Parse a property or node name. A leading backslash is dropped.
fn prop_node_name<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        preceded(
            opt(char('\\')),
            take_while1(|c: char| c.is_ascii_alphanumeric() || ",._+*#?@-".contains(c)),
        ),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Recognize a byte represented by two hex digits.
fn hex_byte<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'a str, E> {
    map(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: Span<'a>| *s.fragment(),
    )(input)
}

/// Recognize an operator or punctuation character.
///
/// Longer operators are tried before their prefixes.
fn punct<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, &'static str, E> {
    alt((
        alt((
            value("==", tag("==")),
            value("!=", tag("!=")),
            value("!", tag("!")),
            value("=", tag("=")),
            value(",", tag(",")),
            value(";", tag(";")),
            value("+", tag("+")),
            value("-", tag("-")),
            value("*", tag("*")),
            value("/", tag("/")),
            value("%", tag("%")),
            value("~", tag("~")),
            value("?", tag("?")),
            value(":", tag(":")),
            value("^", tag("^")),
        )),
        alt((
            value("(", tag("(")),
            value(")", tag(")")),
            value("{", tag("{")),
            value("}", tag("}")),
            value("[", tag("[")),
            value("]", tag("]")),
            value("<<", tag("<<")),
            value("<=", tag("<=")),
            value("<", tag("<")),
            value(">>", tag(">>")),
            value(">=", tag(">=")),
            value(">", tag(">")),
            value("||", tag("||")),
            value("|", tag("|")),
            value("&&", tag("&&")),
            value("&", tag("&")),
        )),
    ))(input)
}

/* === Low-level syntax parsers === */

/// Consume one or more whitespace characters or comments.
fn skip<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(many1(alt((multispace1, line_comment, block_comment))))(input)
}

/// Parse block comments.
fn block_comment<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(input)
}

/// Parse a single line comment.
///
/// The parser stops just before the newline character but doesn't consume the newline.
fn line_comment<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(pair(tag("//"), not_line_ending))(input)
}

/* === Unit Tests === */
