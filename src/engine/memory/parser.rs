/// Text query subset understood by the in-process engine
///
/// SQL:    SELECT * | col, ... FROM [ns.]table [WHERE col op lit AND ...] [ORDER BY col [ASC|DESC]] [LIMIT n]
/// MQL:    db.<collection>.find({ field: value | { $op: value }, ... })[.limit(n)]
/// Cypher: MATCH (n[:Label]) RETURN n [LIMIT n]
///         MATCH ()-[e[:Label]]->() RETURN e [LIMIT n]

use crate::engine::{CompareOp, GraphElement, Predicate, QueryLanguage};
use crate::error::{StorageError, StorageResult};
use serde_json::Value;

/// Parsed but not yet resolved query
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParsedQuery {
    Select {
        namespace: Option<String>,
        table: String,
        /// `None` for `SELECT *`
        fields: Option<Vec<String>>,
        predicates: Vec<Predicate>,
        order_by: Option<(String, bool)>,
        limit: Option<usize>,
    },
    Find {
        collection: String,
        predicates: Vec<Predicate>,
        limit: Option<usize>,
    },
    Match {
        element: GraphElement,
        label: Option<String>,
        limit: Option<usize>,
    },
}

pub(crate) fn parse(language: QueryLanguage, text: &str) -> StorageResult<ParsedQuery> {
    match language {
        QueryLanguage::Sql => parse_sql(text),
        QueryLanguage::Mql => parse_mql(text),
        QueryLanguage::Cypher => parse_cypher(text),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    /// Double-quoted identifier, case preserved
    Quoted(String),
    Number(Value),
    Str(String),
    Symbol(&'static str),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(text: &str) -> StorageResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() || c == ';' {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = serde_json::from_str::<Value>(&literal)
                .map_err(|_| StorageError::Parse(format!("invalid number '{}'", literal)))?;
            tokens.push(Token::Number(number));
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(StorageError::Parse("unterminated quoted literal".to_string())),
                    // Doubled quote escapes itself
                    Some(&ch) if ch == quote && chars.get(i + 1) == Some(&quote) => {
                        value.push(quote);
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(if quote == '"' { Token::Quoted(value) } else { Token::Str(value) });
        } else {
            let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let symbol = match two.as_str() {
                "<=" => Some("<="),
                ">=" => Some(">="),
                "<>" => Some("<>"),
                "!=" => Some("!="),
                _ => None,
            };
            if let Some(symbol) = symbol {
                tokens.push(Token::Symbol(symbol));
                i += 2;
                continue;
            }
            let symbol = match c {
                '*' => "*",
                ',' => ",",
                '.' => ".",
                '=' => "=",
                '<' => "<",
                '>' => ">",
                '(' => "(",
                ')' => ")",
                '[' => "[",
                ']' => "]",
                ':' => ":",
                '-' => "-",
                other => return Err(StorageError::Parse(format!("unexpected character '{}'", other))),
            };
            tokens.push(Token::Symbol(symbol));
            i += 1;
        }
    }
    Ok(tokens)
}

/// Cursor over a token list
struct Tokens {
    tokens: Vec<Token>,
    pos: usize,
}

impl Tokens {
    fn new(text: &str) -> StorageResult<Self> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> StorageResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> StorageResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(symbol))
        }
    }

    fn identifier(&mut self) -> StorageResult<String> {
        match self.next() {
            Some(Token::Ident(name)) | Some(Token::Quoted(name)) => Ok(name),
            other => Err(StorageError::Parse(format!("expected identifier, found {:?}", other))),
        }
    }

    fn literal(&mut self) -> StorageResult<Value> {
        let negative = self.eat_symbol("-");
        match self.next() {
            Some(Token::Number(Value::Number(n))) if negative => {
                let negated = match n.as_i64() {
                    Some(i) => Value::from(-i),
                    None => Value::from(-n.as_f64().unwrap_or_default()),
                };
                Ok(negated)
            }
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Str(s)) if !negative => Ok(Value::String(s)),
            Some(t) if !negative && t.is_keyword("null") => Ok(Value::Null),
            Some(t) if !negative && t.is_keyword("true") => Ok(Value::Bool(true)),
            Some(t) if !negative && t.is_keyword("false") => Ok(Value::Bool(false)),
            other => Err(StorageError::Parse(format!("expected literal, found {:?}", other))),
        }
    }

    fn limit(&mut self) -> StorageResult<Option<usize>> {
        if !self.eat_keyword("limit") {
            return Ok(None);
        }
        match self.next() {
            Some(Token::Number(n)) => n
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| StorageError::Parse(format!("invalid LIMIT {}", n))),
            other => Err(StorageError::Parse(format!("expected LIMIT count, found {:?}", other))),
        }
    }

    fn finish(&self) -> StorageResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(StorageError::Parse(format!("unexpected trailing input {:?}", token))),
        }
    }

    fn unexpected(&self, expected: &str) -> StorageError {
        StorageError::Parse(format!("expected '{}', found {:?}", expected, self.peek()))
    }
}

fn parse_sql(text: &str) -> StorageResult<ParsedQuery> {
    let mut tokens = Tokens::new(text)?;
    tokens.expect_keyword("select")?;

    let fields = if tokens.eat_symbol("*") {
        None
    } else {
        let mut fields = vec![tokens.identifier()?];
        while tokens.eat_symbol(",") {
            fields.push(tokens.identifier()?);
        }
        Some(fields)
    };

    tokens.expect_keyword("from")?;
    let first = tokens.identifier()?;
    let (namespace, table) = if tokens.eat_symbol(".") {
        (Some(first), tokens.identifier()?)
    } else {
        (None, first)
    };

    let mut predicates = Vec::new();
    if tokens.eat_keyword("where") {
        loop {
            let field = tokens.identifier()?;
            let op = match tokens.next() {
                Some(Token::Symbol("=")) => CompareOp::Eq,
                Some(Token::Symbol("<>")) | Some(Token::Symbol("!=")) => CompareOp::NotEq,
                Some(Token::Symbol("<")) => CompareOp::Lt,
                Some(Token::Symbol("<=")) => CompareOp::LtEq,
                Some(Token::Symbol(">")) => CompareOp::Gt,
                Some(Token::Symbol(">=")) => CompareOp::GtEq,
                other => return Err(StorageError::Parse(format!("expected comparison, found {:?}", other))),
            };
            predicates.push(Predicate::new(field, op, tokens.literal()?));
            if !tokens.eat_keyword("and") {
                break;
            }
        }
    }

    let mut order_by = None;
    if tokens.eat_keyword("order") {
        tokens.expect_keyword("by")?;
        let field = tokens.identifier()?;
        let descending = if tokens.eat_keyword("desc") {
            true
        } else {
            tokens.eat_keyword("asc");
            false
        };
        order_by = Some((field, descending));
    }

    let limit = tokens.limit()?;
    tokens.finish()?;

    Ok(ParsedQuery::Select {
        namespace,
        table,
        fields,
        predicates,
        order_by,
        limit,
    })
}

fn parse_mql(text: &str) -> StorageResult<ParsedQuery> {
    let text = text.trim().trim_end_matches(';');
    let rest = text
        .strip_prefix("db.")
        .ok_or_else(|| StorageError::Parse("MQL queries must start with 'db.'".to_string()))?;
    let (collection, rest) = rest
        .split_once(".find(")
        .ok_or_else(|| StorageError::Parse("only find() is supported".to_string()))?;
    if collection.is_empty() {
        return Err(StorageError::Parse("missing collection name".to_string()));
    }

    let close = matching_paren(rest)
        .ok_or_else(|| StorageError::Parse("unbalanced parentheses in find()".to_string()))?;
    let filter_text = rest[..close].trim();
    let tail = rest[close + 1..].trim();

    let filter: Value = if filter_text.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(filter_text)
            .map_err(|e| StorageError::Parse(format!("invalid find() filter: {}", e)))?
    };
    let predicates = mql_predicates(&filter)?;

    let limit = if tail.is_empty() {
        None
    } else {
        let count = tail
            .strip_prefix(".limit(")
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(|| StorageError::Parse(format!("unsupported cursor method '{}'", tail)))?;
        Some(
            count
                .trim()
                .parse::<usize>()
                .map_err(|_| StorageError::Parse(format!("invalid limit '{}'", count)))?,
        )
    };

    Ok(ParsedQuery::Find {
        collection: collection.to_string(),
        predicates,
        limit,
    })
}

fn matching_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn mql_predicates(filter: &Value) -> StorageResult<Vec<Predicate>> {
    let object = filter
        .as_object()
        .ok_or_else(|| StorageError::Parse("find() filter must be an object".to_string()))?;
    let mut predicates = Vec::new();
    for (field, condition) in object {
        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, value) in ops {
                    let op = match op.as_str() {
                        "$eq" => CompareOp::Eq,
                        "$ne" => CompareOp::NotEq,
                        "$lt" => CompareOp::Lt,
                        "$lte" => CompareOp::LtEq,
                        "$gt" => CompareOp::Gt,
                        "$gte" => CompareOp::GtEq,
                        other => return Err(StorageError::Parse(format!("unsupported operator '{}'", other))),
                    };
                    predicates.push(Predicate::new(field.clone(), op, value.clone()));
                }
            }
            value => predicates.push(Predicate::new(field.clone(), CompareOp::Eq, value.clone())),
        }
    }
    Ok(predicates)
}

fn parse_cypher(text: &str) -> StorageResult<ParsedQuery> {
    let mut tokens = Tokens::new(text)?;
    tokens.expect_keyword("match")?;
    tokens.expect_symbol("(")?;

    let (element, variable, label) = if tokens.eat_symbol(")") {
        // ()-[e:Label]->()
        tokens.expect_symbol("-")?;
        tokens.expect_symbol("[")?;
        let variable = tokens.identifier()?;
        let label = if tokens.eat_symbol(":") { Some(tokens.identifier()?) } else { None };
        tokens.expect_symbol("]")?;
        tokens.expect_symbol("-")?;
        tokens.expect_symbol(">")?;
        tokens.expect_symbol("(")?;
        tokens.expect_symbol(")")?;
        (GraphElement::Edges, variable, label)
    } else {
        let variable = tokens.identifier()?;
        let label = if tokens.eat_symbol(":") { Some(tokens.identifier()?) } else { None };
        tokens.expect_symbol(")")?;
        (GraphElement::Nodes, variable, label)
    };

    tokens.expect_keyword("return")?;
    let returned = tokens.identifier()?;
    if returned != variable {
        return Err(StorageError::Validation(format!(
            "RETURN references unknown variable '{}'",
            returned
        )));
    }
    let limit = tokens.limit()?;
    tokens.finish()?;

    Ok(ParsedQuery::Match { element, label, limit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sql_select() {
        let parsed = parse(
            QueryLanguage::Sql,
            "SELECT _key, name FROM rel_x.t_y_0 WHERE _key > 10 AND name <> 'o''brien' ORDER BY _key DESC LIMIT 5",
        )
        .unwrap();

        assert_eq!(
            parsed,
            ParsedQuery::Select {
                namespace: Some("rel_x".to_string()),
                table: "t_y_0".to_string(),
                fields: Some(vec!["_key".to_string(), "name".to_string()]),
                predicates: vec![
                    Predicate::new("_key", CompareOp::Gt, json!(10)),
                    Predicate::new("name", CompareOp::NotEq, json!("o'brien")),
                ],
                order_by: Some(("_key".to_string(), true)),
                limit: Some(5),
            }
        );
    }

    #[test]
    fn test_parse_sql_rejects_garbage() {
        assert!(matches!(parse(QueryLanguage::Sql, "SELEC * FROM t"), Err(StorageError::Parse(_))));
        assert!(matches!(parse(QueryLanguage::Sql, "SELECT * FROM t LIMIT"), Err(StorageError::Parse(_))));
        assert!(matches!(parse(QueryLanguage::Sql, "SELECT * FROM t WHERE a ~ 1"), Err(StorageError::Parse(_))));
    }

    #[test]
    fn test_parse_mql_find() {
        let parsed = parse(
            QueryLanguage::Mql,
            r#"db.c_a_b_0.find({"age": {"$gte": 18}, "city": "Basel"}).limit(3)"#,
        )
        .unwrap();

        match parsed {
            ParsedQuery::Find { collection, predicates, limit } => {
                assert_eq!(collection, "c_a_b_0");
                assert_eq!(limit, Some(3));
                assert_eq!(predicates.len(), 2);
                assert!(predicates.contains(&Predicate::new("age", CompareOp::GtEq, json!(18))));
            }
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    #[test]
    fn test_parse_cypher_patterns() {
        assert_eq!(
            parse(QueryLanguage::Cypher, "MATCH (n:Person) RETURN n LIMIT 2").unwrap(),
            ParsedQuery::Match {
                element: GraphElement::Nodes,
                label: Some("Person".to_string()),
                limit: Some(2),
            }
        );
        assert_eq!(
            parse(QueryLanguage::Cypher, "MATCH ()-[e]->() RETURN e").unwrap(),
            ParsedQuery::Match {
                element: GraphElement::Edges,
                label: None,
                limit: None,
            }
        );
        assert!(parse(QueryLanguage::Cypher, "MATCH (n) RETURN m").is_err());
    }
}
