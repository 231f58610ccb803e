use crate::evaluate::{Capability, CapabilitySet};
use crate::EvaluationError;

/// Deepest nesting of parenthesised, bracketed or unary sub-expressions the parser accepts.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

/// Collection operators applied with `.?[...]`, `.^[...]`, `.$[...]` and `.![...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOp {
    Select,
    First,
    Last,
    Project,
}

/// Parsed expression tree. A `target` of `None` refers to the active context object (`#this`).
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    Variable(String),
    Property { target: Option<Box<Expression>>, name: String, null_safe: bool },
    MethodCall {
        target: Option<Box<Expression>>,
        name: String,
        args: Vec<Expression>,
        null_safe: bool,
    },
    TypeRef(String),
    Index { target: Box<Expression>, index: Box<Expression> },
    Collection { target: Box<Expression>, op: CollectionOp, body: Box<Expression> },
    Unary { op: UnaryOp, operand: Box<Expression> },
    Binary { op: BinaryOp, left: Box<Expression>, right: Box<Expression> },
    Ternary { condition: Box<Expression>, then: Box<Expression>, otherwise: Box<Expression> },
    Elvis { value: Box<Expression>, fallback: Box<Expression> },
}

impl Expression {
    /// Every capability some path through this expression may exercise.
    #[must_use]
    pub fn required_capabilities(&self) -> CapabilitySet {
        let mut required = CapabilitySet::new();
        self.collect_capabilities(&mut required);
        required
    }

    fn collect_capabilities(&self, required: &mut CapabilitySet) {
        match self {
            Self::Literal(_) | Self::Variable(_) => {}
            Self::Property { target, .. } => {
                required.insert(Capability::ReadProperty);
                if let Some(target) = target {
                    target.collect_capabilities(required);
                }
            }
            Self::MethodCall { target, args, .. } => {
                required.insert(Capability::InvokeMethod);
                if let Some(target) = target {
                    target.collect_capabilities(required);
                }
                for arg in args {
                    arg.collect_capabilities(required);
                }
            }
            Self::TypeRef(_) => {
                required.insert(Capability::ResolveType);
            }
            Self::Index { target, index } => {
                target.collect_capabilities(required);
                index.collect_capabilities(required);
            }
            Self::Collection { target, body, .. } => {
                target.collect_capabilities(required);
                body.collect_capabilities(required);
            }
            Self::Unary { operand, .. } => operand.collect_capabilities(required),
            Self::Binary { left, right, .. } => {
                left.collect_capabilities(required);
                right.collect_capabilities(required);
            }
            Self::Ternary { condition, then, otherwise } => {
                condition.collect_capabilities(required);
                then.collect_capabilities(required);
                otherwise.collect_capabilities(required);
            }
            Self::Elvis { value, fallback } => {
                value.collect_capabilities(required);
                fallback.collect_capabilities(required);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Variable(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    SafeDot,
    Collection(CollectionOp),
    Question,
    Colon,
    Elvis,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    position: usize,
}

fn parse_error(position: usize, message: impl Into<String>) -> EvaluationError {
    EvaluationError::Parse { position, message: message.into() }
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, EvaluationError> {
    let chars = source.char_indices().collect::<Vec<_>>();
    let char_at = |index: usize| chars.get(index).map(|(_, ch)| *ch);
    let mut tokens = Vec::new();
    let mut index = 0;

    while let Some(&(position, ch)) = chars.get(index) {
        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        let (token, width) = match ch {
            '0'..='9' => {
                let mut end = index;
                while char_at(end).is_some_and(|c| c.is_ascii_digit()) {
                    end += 1;
                }
                let is_float = char_at(end) == Some('.')
                    && char_at(end + 1).is_some_and(|c| c.is_ascii_digit());
                if is_float {
                    end += 1;
                    while char_at(end).is_some_and(|c| c.is_ascii_digit()) {
                        end += 1;
                    }
                }
                let text = chars[index..end].iter().map(|(_, c)| *c).collect::<String>();
                let token = if is_float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| {
                                parse_error(position, format!("invalid number `{text}`"))
                            })?,
                    )
                } else {
                    Token::Int(text.parse().map_err(|_| {
                        parse_error(position, format!("integer `{text}` is out of range"))
                    })?)
                };
                (token, end - index)
            }
            '\'' | '"' => {
                let quote = ch;
                let mut value = String::new();
                let mut end = index + 1;
                loop {
                    match char_at(end) {
                        None => return Err(parse_error(position, "unterminated string literal")),
                        Some(c) if c == quote && char_at(end + 1) == Some(quote) => {
                            value.push(quote);
                            end += 2;
                        }
                        Some(c) if c == quote => {
                            end += 1;
                            break;
                        }
                        Some(c) => {
                            value.push(c);
                            end += 1;
                        }
                    }
                }
                (Token::Str(value), end - index)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = index;
                while char_at(end).is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    end += 1;
                }
                let text = chars[index..end].iter().map(|(_, c)| *c).collect::<String>();
                (Token::Ident(text), end - index)
            }
            '#' => {
                let mut end = index + 1;
                while char_at(end).is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    end += 1;
                }
                if end == index + 1 {
                    return Err(parse_error(position, "expected a variable name after `#`"));
                }
                let name = chars[index + 1..end].iter().map(|(_, c)| *c).collect::<String>();
                (Token::Variable(name), end - index)
            }
            '.' => match (char_at(index + 1), char_at(index + 2)) {
                (Some('?'), Some('[')) => (Token::Collection(CollectionOp::Select), 3),
                (Some('^'), Some('[')) => (Token::Collection(CollectionOp::First), 3),
                (Some('$'), Some('[')) => (Token::Collection(CollectionOp::Last), 3),
                (Some('!'), Some('[')) => (Token::Collection(CollectionOp::Project), 3),
                _ => (Token::Dot, 1),
            },
            '?' => match char_at(index + 1) {
                Some('.') => (Token::SafeDot, 2),
                Some(':') => (Token::Elvis, 2),
                _ => (Token::Question, 1),
            },
            '=' if char_at(index + 1) == Some('=') => (Token::EqEq, 2),
            '!' if char_at(index + 1) == Some('=') => (Token::NotEq, 2),
            '!' => (Token::Bang, 1),
            '<' if char_at(index + 1) == Some('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if char_at(index + 1) == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '&' if char_at(index + 1) == Some('&') => (Token::AndAnd, 2),
            '|' if char_at(index + 1) == Some('|') => (Token::OrOr, 2),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            ',' => (Token::Comma, 1),
            ':' => (Token::Colon, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            other => return Err(parse_error(position, format!("unexpected character `{other}`"))),
        };

        tokens.push(Spanned { token, position });
        index += width;
    }

    Ok(tokens)
}

/// Parse an expression such as `#this.?[enabled and (price gt 0)]`.
///
/// # Errors
/// Returns [`EvaluationError::Parse`] for malformed input, including nesting deeper than
/// [`MAX_NESTING_DEPTH`].
pub fn parse_expression(source: &str) -> Result<Expression, EvaluationError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, cursor: 0, depth: 0, end: source.len() };
    let expression = parser.parse_ternary()?;
    if let Some(spanned) = parser.tokens.get(parser.cursor) {
        return Err(parse_error(spanned.position, "unexpected trailing input"));
    }
    Ok(expression)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|spanned| &spanned.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.cursor + offset).map(|spanned| &spanned.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.cursor).map_or(self.end, |spanned| spanned.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|spanned| spanned.token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), EvaluationError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(parse_error(self.position(), format!("expected {what}")))
        }
    }

    fn expect_ident(&mut self) -> Result<String, EvaluationError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            _ => Err(parse_error(position, "expected an identifier")),
        }
    }

    fn enter(&mut self) -> Result<(), EvaluationError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(parse_error(
                self.position(),
                format!("expression nesting exceeds {MAX_NESTING_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.leave_levels(1);
    }

    /// Undo the levels entered while folding an operator chain or postfix chain.
    fn leave_levels(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn parse_ternary(&mut self) -> Result<Expression, EvaluationError> {
        self.enter()?;
        let condition = self.parse_or()?;
        let expression = if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            self.expect(&Token::Colon, "`:` in conditional expression")?;
            let otherwise = self.parse_ternary()?;
            Expression::Ternary {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }
        } else if self.eat(&Token::Elvis) {
            let fallback = self.parse_ternary()?;
            Expression::Elvis { value: Box::new(condition), fallback: Box::new(fallback) }
        } else {
            condition
        };
        self.leave();
        Ok(expression)
    }

    // Each folded operator wraps `left` one level deeper, so it counts toward the nesting limit.
    fn parse_or(&mut self) -> Result<Expression, EvaluationError> {
        let mut left = self.parse_and()?;
        let mut folded = 0;
        while self.eat(&Token::OrOr) || self.eat_keyword("or") {
            self.enter()?;
            folded += 1;
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        self.leave_levels(folded);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, EvaluationError> {
        let mut left = self.parse_relational()?;
        let mut folded = 0;
        while self.eat(&Token::AndAnd) || self.eat_keyword("and") {
            self.enter()?;
            folded += 1;
            let right = self.parse_relational()?;
            left = binary(BinaryOp::And, left, right);
        }
        self.leave_levels(folded);
        Ok(left)
    }

    fn relational_op(&self) -> Option<BinaryOp> {
        match self.peek()? {
            Token::EqEq => Some(BinaryOp::Eq),
            Token::NotEq => Some(BinaryOp::Ne),
            Token::Lt => Some(BinaryOp::Lt),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Le => Some(BinaryOp::Le),
            Token::Ge => Some(BinaryOp::Ge),
            Token::Ident(name) => match name.to_ascii_lowercase().as_str() {
                "eq" => Some(BinaryOp::Eq),
                "ne" => Some(BinaryOp::Ne),
                "lt" => Some(BinaryOp::Lt),
                "gt" => Some(BinaryOp::Gt),
                "le" => Some(BinaryOp::Le),
                "ge" => Some(BinaryOp::Ge),
                _ => None,
            },
            _ => None,
        }
    }

    fn parse_relational(&mut self) -> Result<Expression, EvaluationError> {
        let mut left = self.parse_additive()?;
        let mut folded = 0;
        while let Some(op) = self.relational_op() {
            self.cursor += 1;
            self.enter()?;
            folded += 1;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        self.leave_levels(folded);
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expression, EvaluationError> {
        let mut left = self.parse_multiplicative()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            self.enter()?;
            folded += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        self.leave_levels(folded);
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, EvaluationError> {
        let mut left = self.parse_unary()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                Some(Token::Ident(name)) if name.eq_ignore_ascii_case("div") => BinaryOp::Div,
                Some(Token::Ident(name)) if name.eq_ignore_ascii_case("mod") => BinaryOp::Rem,
                _ => break,
            };
            self.cursor += 1;
            self.enter()?;
            folded += 1;
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        self.leave_levels(folded);
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, EvaluationError> {
        let op = if self.eat(&Token::Bang) || self.eat_keyword("not") {
            Some(UnaryOp::Not)
        } else if self.eat(&Token::Minus) {
            Some(UnaryOp::Neg)
        } else {
            None
        };

        let Some(op) = op else {
            return self.parse_postfix();
        };

        self.enter()?;
        let operand = self.parse_unary()?;
        self.leave();
        Ok(Expression::Unary { op, operand: Box::new(operand) })
    }

    fn parse_postfix(&mut self) -> Result<Expression, EvaluationError> {
        let mut expression = self.parse_primary()?;
        let mut steps = 0;
        loop {
            if matches!(
                self.peek(),
                Some(Token::Dot | Token::SafeDot | Token::Collection(_) | Token::LBracket)
            ) {
                self.enter()?;
                steps += 1;
            }
            match self.peek() {
                Some(Token::Dot | Token::SafeDot) => {
                    let null_safe = self.peek() == Some(&Token::SafeDot);
                    self.cursor += 1;
                    let name = self.expect_ident()?;
                    expression = self.member(Some(expression), name, null_safe)?;
                }
                Some(Token::Collection(op)) => {
                    let op = *op;
                    self.cursor += 1;
                    let body = self.parse_ternary()?;
                    self.expect(&Token::RBracket, "`]` closing the collection operator")?;
                    expression = Expression::Collection {
                        target: Box::new(expression),
                        op,
                        body: Box::new(body),
                    };
                }
                Some(Token::LBracket) => {
                    self.cursor += 1;
                    let index = self.parse_ternary()?;
                    self.expect(&Token::RBracket, "`]` closing the index")?;
                    expression =
                        Expression::Index { target: Box::new(expression), index: Box::new(index) };
                }
                _ => break,
            }
        }
        self.leave_levels(steps);
        Ok(expression)
    }

    fn member(
        &mut self,
        target: Option<Expression>,
        name: String,
        null_safe: bool,
    ) -> Result<Expression, EvaluationError> {
        let target = target.map(Box::new);
        if self.eat(&Token::LParen) {
            let args = self.parse_arguments()?;
            Ok(Expression::MethodCall { target, name, args, null_safe })
        } else {
            Ok(Expression::Property { target, name, null_safe })
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expression>, EvaluationError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_ternary()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen, "`)` closing the argument list")?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, EvaluationError> {
        let position = self.position();
        let is_type_ref = matches!(self.peek(), Some(Token::Ident(name)) if name == "T")
            && self.peek_at(1) == Some(&Token::LParen);
        if is_type_ref {
            self.cursor += 2;
            let mut name = self.expect_ident()?;
            while self.eat(&Token::Dot) {
                name.push('.');
                name.push_str(&self.expect_ident()?);
            }
            self.expect(&Token::RParen, "`)` closing the type reference")?;
            return Ok(Expression::TypeRef(name));
        }

        match self.advance() {
            Some(Token::Int(value)) => Ok(Expression::Literal(Literal::Int(value))),
            Some(Token::Float(value)) => Ok(Expression::Literal(Literal::Float(value))),
            Some(Token::Str(value)) => Ok(Expression::Literal(Literal::Str(value))),
            Some(Token::Variable(name)) => Ok(Expression::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_ternary()?;
                self.expect(&Token::RParen, "`)` closing the group")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Expression::Literal(Literal::Bool(true))),
                "false" => Ok(Expression::Literal(Literal::Bool(false))),
                "null" => Ok(Expression::Literal(Literal::Null)),
                "and" | "or" | "not" | "eq" | "ne" | "lt" | "gt" | "le" | "ge" | "div"
                | "mod" => Err(parse_error(position, format!("unexpected operator `{name}`"))),
                _ => self.member(None, name, false),
            },
            Some(_) => Err(parse_error(position, "unexpected token")),
            None => Err(parse_error(position, "unexpected end of expression")),
        }
    }
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::Binary { op, left: Box::new(left), right: Box::new(right) }
}
