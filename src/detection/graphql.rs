use super::{Attribution, DetectionStage, RequestRecord, StageContext, StageResult};
use crate::config::GraphqlConfig;
use log::{error, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Nesting beyond this is rejected while parsing, long before any
/// configured depth limit could matter.
const MAX_PARSE_NESTING: usize = 128;
/// Upper bound on fields produced by fragment expansion.
const MAX_EXPANDED_FIELDS: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphqlParseError {
    #[error("unexpected end of query")]
    UnexpectedEnd,
    #[error("unexpected token {found:?} at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },
    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),
    #[error("selection set nested deeper than {0}")]
    TooDeep(usize),
    #[error("unknown fragment {0}")]
    UnknownFragment(String),
    #[error("fragment {0} spreads itself")]
    FragmentCycle(String),
    #[error("query expands to more than {0} fields")]
    TooLarge(usize),
    #[error("document has no operation")]
    NoOperation,
}

/// One field of a selection set, with fragments already flattened in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Field {
    pub name: String,
    pub selections: Vec<Field>,
}

impl Field {
    pub fn leaf(name: &str) -> Self {
        Self {
            name: name.to_string(),
            selections: Vec::new(),
        }
    }

    pub fn with_selections(name: &str, selections: Vec<Field>) -> Self {
        Self {
            name: name.to_string(),
            selections,
        }
    }
}

/// Top-level selections of every operation in a document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionSet {
    pub fields: Vec<Field>,
}

pub trait GraphqlParser: Send + Sync {
    fn parse(&self, query: &str) -> Result<SelectionSet, GraphqlParseError>;
}

/// Depth, cost and introspection use of a parsed query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryAnalysis {
    pub depth: usize,
    pub complexity: u64,
    pub introspection_field: Option<String>,
}

/// Field cost table: one default weight plus per-name overrides.
#[derive(Debug, Clone)]
pub struct FieldWeights {
    default_weight: u64,
    overrides: BTreeMap<String, u64>,
}

impl FieldWeights {
    pub fn new(default_weight: u64, overrides: BTreeMap<String, u64>) -> Self {
        Self {
            default_weight,
            overrides,
        }
    }

    pub fn weight(&self, field: &str) -> u64 {
        self.overrides
            .get(field)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Walk the tree once, computing max depth (top-level fields are depth 1),
/// the summed field weight, and the first introspection field seen.
pub fn analyze_selection(
    selection: &SelectionSet,
    weights: &FieldWeights,
    introspection_fields: &HashSet<String>,
) -> QueryAnalysis {
    let mut analysis = QueryAnalysis::default();
    let mut stack: Vec<(&Field, usize)> = selection.fields.iter().map(|f| (f, 1)).collect();

    while let Some((field, depth)) = stack.pop() {
        analysis.depth = analysis.depth.max(depth);
        analysis.complexity = analysis.complexity.saturating_add(weights.weight(&field.name));
        if analysis.introspection_field.is_none() && introspection_fields.contains(&field.name) {
            analysis.introspection_field = Some(field.name.clone());
        }
        stack.extend(field.selections.iter().map(|f| (f, depth + 1)));
    }
    analysis
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Punct(char),
    Spread,
    Value,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, GraphqlParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' | b',' => i += 1,
            0xEF if input[i..].starts_with('\u{feff}') => i += 3,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'{' | b'}' | b'(' | b')' | b'[' | b']' | b':' | b'@' | b'$' | b'!' | b'=' | b'|'
            | b'&' => {
                tokens.push((Token::Punct(c as char), i));
                i += 1;
            }
            b'.' => {
                if input[i..].starts_with("...") {
                    tokens.push((Token::Spread, i));
                    i += 3;
                } else {
                    return Err(GraphqlParseError::UnexpectedToken {
                        found: ".".to_string(),
                        offset: i,
                    });
                }
            }
            b'"' => {
                let start = i;
                i = skip_string(input, i)?;
                tokens.push((Token::Value, start));
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'.' | b'+' | b'-'))
                {
                    i += 1;
                }
                tokens.push((Token::Value, start));
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                tokens.push((Token::Name(input[start..i].to_string()), start));
            }
            _ => {
                let found = input[i..].chars().next().map(String::from).unwrap_or_default();
                return Err(GraphqlParseError::UnexpectedToken { found, offset: i });
            }
        }
    }
    Ok(tokens)
}

/// Returns the offset just past the closing quote.
fn skip_string(input: &str, start: usize) -> Result<usize, GraphqlParseError> {
    let bytes = input.as_bytes();
    if input[start..].starts_with("\"\"\"") {
        return input[start + 3..]
            .find("\"\"\"")
            .map(|end| start + 3 + end + 3)
            .ok_or(GraphqlParseError::UnterminatedString(start));
    }

    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            b'\n' => return Err(GraphqlParseError::UnterminatedString(start)),
            _ => i += 1,
        }
    }
    Err(GraphqlParseError::UnterminatedString(start))
}

#[derive(Debug, Clone)]
enum Node {
    Field { name: String, children: Vec<Node> },
    Spread(String),
}

struct Cursor {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<Token, GraphqlParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or(GraphqlParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self) -> GraphqlParseError {
        match self.tokens.get(self.pos) {
            Some((token, offset)) => GraphqlParseError::UnexpectedToken {
                found: match token {
                    Token::Name(n) => n.clone(),
                    Token::Punct(c) => c.to_string(),
                    Token::Spread => "...".to_string(),
                    Token::Value => "value".to_string(),
                },
                offset: *offset,
            },
            None => GraphqlParseError::UnexpectedEnd,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.peek() == Some(&Token::Punct(c))
    }

    fn expect_punct(&mut self, c: char) -> Result<(), GraphqlParseError> {
        if self.is_punct(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_name(&mut self) -> Result<String, GraphqlParseError> {
        match self.peek() {
            Some(Token::Name(_)) => match self.next()? {
                Token::Name(name) => Ok(name),
                _ => Err(self.unexpected()),
            },
            _ => Err(self.unexpected()),
        }
    }

    /// Skip a bracketed group such as arguments or variable definitions.
    fn skip_group(&mut self, open: char, close: char) -> Result<(), GraphqlParseError> {
        self.expect_punct(open)?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Token::Punct(c) if c == open => depth += 1,
                Token::Punct(c) if c == close => depth -= 1,
                _ => {}
            }
            if depth > MAX_PARSE_NESTING {
                return Err(GraphqlParseError::TooDeep(MAX_PARSE_NESTING));
            }
        }
        Ok(())
    }

    fn skip_directives(&mut self) -> Result<(), GraphqlParseError> {
        while self.is_punct('@') {
            self.pos += 1;
            self.expect_name()?;
            if self.is_punct('(') {
                self.skip_group('(', ')')?;
            }
        }
        Ok(())
    }

    fn selection_set(&mut self, nesting: usize) -> Result<Vec<Node>, GraphqlParseError> {
        if nesting > MAX_PARSE_NESTING {
            return Err(GraphqlParseError::TooDeep(MAX_PARSE_NESTING));
        }
        self.expect_punct('{')?;
        let mut nodes = Vec::new();

        loop {
            match self.peek() {
                Some(Token::Punct('}')) => {
                    self.pos += 1;
                    break;
                }
                Some(Token::Spread) => {
                    self.pos += 1;
                    self.fragment_selection(nesting, &mut nodes)?;
                }
                Some(Token::Name(_)) => nodes.push(self.field(nesting)?),
                _ => return Err(self.unexpected()),
            }
        }

        if nodes.is_empty() {
            return Err(self.unexpected_before_close());
        }
        Ok(nodes)
    }

    fn unexpected_before_close(&self) -> GraphqlParseError {
        let offset = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map_or(0, |(_, o)| *o);
        GraphqlParseError::UnexpectedToken {
            found: "}".to_string(),
            offset,
        }
    }

    fn fragment_selection(
        &mut self,
        nesting: usize,
        nodes: &mut Vec<Node>,
    ) -> Result<(), GraphqlParseError> {
        match self.peek() {
            // inline fragment: `... on Type { }` or `... @dir { }` or `... { }`
            Some(Token::Name(n)) if n == "on" => {
                self.pos += 1;
                self.expect_name()?;
                self.skip_directives()?;
                nodes.extend(self.selection_set(nesting + 1)?);
            }
            Some(Token::Punct('@')) | Some(Token::Punct('{')) => {
                self.skip_directives()?;
                nodes.extend(self.selection_set(nesting + 1)?);
            }
            Some(Token::Name(_)) => {
                let name = self.expect_name()?;
                self.skip_directives()?;
                nodes.push(Node::Spread(name));
            }
            _ => return Err(self.unexpected()),
        }
        Ok(())
    }

    fn field(&mut self, nesting: usize) -> Result<Node, GraphqlParseError> {
        let mut name = self.expect_name()?;
        if self.is_punct(':') {
            // alias
            self.pos += 1;
            name = self.expect_name()?;
        }
        if self.is_punct('(') {
            self.skip_group('(', ')')?;
        }
        self.skip_directives()?;

        let children = if self.is_punct('{') {
            self.selection_set(nesting + 1)?
        } else {
            Vec::new()
        };
        Ok(Node::Field { name, children })
    }
}

/// Minimal parser for the parts of GraphQL that matter to depth and cost
/// analysis. Arguments, variables and directives are skipped; fragments are
/// inlined into the fields that spread them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionSetParser;

impl SelectionSetParser {
    fn document(
        cursor: &mut Cursor,
    ) -> Result<(Vec<Node>, HashMap<String, Vec<Node>>), GraphqlParseError> {
        let mut operations = Vec::new();
        let mut fragments = HashMap::new();

        while let Some(token) = cursor.peek() {
            match token {
                Token::Punct('{') => operations.extend(cursor.selection_set(1)?),
                Token::Name(keyword) if keyword == "fragment" => {
                    cursor.pos += 1;
                    let name = cursor.expect_name()?;
                    match cursor.expect_name()?.as_str() {
                        "on" => {}
                        _ => return Err(cursor.unexpected()),
                    }
                    cursor.expect_name()?;
                    cursor.skip_directives()?;
                    let body = cursor.selection_set(1)?;
                    fragments.insert(name, body);
                }
                Token::Name(keyword)
                    if matches!(keyword.as_str(), "query" | "mutation" | "subscription") =>
                {
                    cursor.pos += 1;
                    if matches!(cursor.peek(), Some(Token::Name(_))) {
                        cursor.expect_name()?;
                    }
                    if cursor.is_punct('(') {
                        cursor.skip_group('(', ')')?;
                    }
                    cursor.skip_directives()?;
                    operations.extend(cursor.selection_set(1)?);
                }
                _ => return Err(cursor.unexpected()),
            }
        }

        if operations.is_empty() {
            return Err(GraphqlParseError::NoOperation);
        }
        Ok((operations, fragments))
    }
}

struct Expander<'a> {
    fragments: &'a HashMap<String, Vec<Node>>,
    active: Vec<&'a str>,
    produced: usize,
}

impl<'a> Expander<'a> {
    /// `depth` counts field levels and fragment hops together, so a chain of
    /// fragments cannot nest further than one document could.
    fn expand(
        &mut self,
        nodes: &'a [Node],
        out: &mut Vec<Field>,
        depth: usize,
    ) -> Result<(), GraphqlParseError> {
        if depth > MAX_PARSE_NESTING && !nodes.is_empty() {
            return Err(GraphqlParseError::TooDeep(MAX_PARSE_NESTING));
        }
        for node in nodes {
            match node {
                Node::Field { name, children } => {
                    self.produced += 1;
                    if self.produced > MAX_EXPANDED_FIELDS {
                        return Err(GraphqlParseError::TooLarge(MAX_EXPANDED_FIELDS));
                    }
                    let mut selections = Vec::new();
                    self.expand(children, &mut selections, depth + 1)?;
                    out.push(Field {
                        name: name.clone(),
                        selections,
                    });
                }
                Node::Spread(fragment) => {
                    if self.active.contains(&fragment.as_str()) {
                        return Err(GraphqlParseError::FragmentCycle(fragment.clone()));
                    }
                    let body = self
                        .fragments
                        .get(fragment)
                        .ok_or_else(|| GraphqlParseError::UnknownFragment(fragment.clone()))?;
                    self.active.push(fragment.as_str());
                    self.expand(body, out, depth + 1)?;
                    self.active.pop();
                }
            }
        }
        Ok(())
    }
}

impl GraphqlParser for SelectionSetParser {
    fn parse(&self, query: &str) -> Result<SelectionSet, GraphqlParseError> {
        let mut cursor = Cursor {
            tokens: tokenize(query)?,
            pos: 0,
        };
        let (operations, fragments) = Self::document(&mut cursor)?;

        let mut expander = Expander {
            fragments: &fragments,
            active: Vec::new(),
            produced: 0,
        };
        let mut fields = Vec::new();
        expander.expand(&operations, &mut fields, 1)?;
        Ok(SelectionSet { fields })
    }
}

/// Stage 5: GraphQL depth, cost and introspection limits.
pub struct GraphqlStage {
    parser: Arc<dyn GraphqlParser>,
    weights: FieldWeights,
    introspection_fields: HashSet<String>,
    max_depth: usize,
    max_complexity: u64,
}

impl GraphqlStage {
    pub fn new(parser: Arc<dyn GraphqlParser>, config: &GraphqlConfig) -> Self {
        Self {
            parser,
            weights: FieldWeights::new(config.default_field_weight, config.field_weights.clone()),
            introspection_fields: config.introspection_fields.iter().cloned().collect(),
            max_depth: config.max_depth,
            max_complexity: config.max_complexity,
        }
    }

    pub fn analyze(&self, query: &str) -> Result<QueryAnalysis, GraphqlParseError> {
        let selection = self.parser.parse(query)?;
        Ok(analyze_selection(&selection, &self.weights, &self.introspection_fields))
    }
}

impl DetectionStage for GraphqlStage {
    fn evaluate(&self, request: &RequestRecord, _ctx: &mut StageContext) -> StageResult {
        let query = match request.graphql_query.as_deref() {
            Some(query) => query,
            None => return StageResult::Pass,
        };

        let analysis = match panic::catch_unwind(AssertUnwindSafe(|| self.analyze(query))) {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                warn!("Malformed GraphQL query from {}: {}", request.ip, e);
                return StageResult::block(Attribution::Graphql, format!("Malformed GraphQL query: {}", e));
            }
            Err(_) => {
                error!("GraphQL parser panicked on query from {}", request.ip);
                return StageResult::block(Attribution::Graphql, "GraphQL query could not be parsed");
            }
        };

        if let Some(field) = analysis.introspection_field {
            return StageResult::block(
                Attribution::Graphql,
                format!("GraphQL introspection field {} is not allowed", field),
            );
        }
        if analysis.depth > self.max_depth {
            return StageResult::block(
                Attribution::Graphql,
                format!("GraphQL depth {} exceeds max {}", analysis.depth, self.max_depth),
            );
        }
        if analysis.complexity > self.max_complexity {
            return StageResult::block(
                Attribution::Graphql,
                format!(
                    "GraphQL complexity {} exceeds max {}",
                    analysis.complexity, self.max_complexity
                ),
            );
        }
        StageResult::Pass
    }

    fn name(&self) -> &str {
        "GraphQL Complexity"
    }
}
