//! Conversion of ruff's Python syntax tree into the UI language tree.
//!
//! Only the subset the compiler understands is accepted. Everything else is rejected
//! here with a [`ParseError::NotSupported`] carrying the source position, so later
//! passes never see unexpected syntax.

use std::{borrow::Cow, fmt};

use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, ElifElseClause, Expr as AstExpr, InterpolatedStringElement, Number,
    Operator as AstOperator, Stmt as AstStmt, UnaryOp,
};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};
use serde::{Deserialize, Serialize};

use crate::expressions::{
    BoolOperator, Call, CmpOperator, Decorators, Expr, ExprLoc, FStringPart, FunctionDef, Identifier, ImportName,
    Kwarg, Literal, Operator, Stmt, UnaryOperator,
};

/// Maximum nesting depth for statements and expressions.
#[cfg(not(debug_assertions))]
pub const MAX_NESTING_DEPTH: u16 = 200;
/// Debug builds use much larger stack frames, so the limit is lower.
#[cfg(debug_assertions)]
pub const MAX_NESTING_DEPTH: u16 = 60;

/// Name of the module-level boundary pragma.
pub const BOUNDARY_PRAGMA: &str = "__boundary__";

/// A line/column position, both 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Source range of a syntax node.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeRange {
    start: CodeLoc,
    end: CodeLoc,
}

impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}

/// Displays the start position as `line:column`.
impl fmt::Display for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start.line, self.start.column)
    }
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> CodeLoc {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> CodeLoc {
        self.end
    }
}

/// Explicit boundary annotation of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Boundary {
    Server,
    Client,
    Shared,
}

/// An import edge found anywhere in a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEdge {
    pub module: String,
    pub position: CodeRange,
}

/// A parsed module, before name resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedModule {
    pub name: String,
    pub boundary: Option<Boundary>,
    pub imports: Vec<ImportEdge>,
    pub body: Vec<Stmt>,
}

/// Errors that can occur while parsing a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid Python syntax.
    Syntax { msg: Cow<'static, str>, position: CodeRange },
    /// Valid Python outside the UI language subset.
    NotSupported { msg: Cow<'static, str>, position: CodeRange },
    /// Unsupported import form.
    Import { msg: Cow<'static, str>, position: CodeRange },
}

impl ParseError {
    fn not_supported(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::NotSupported {
            msg: msg.into(),
            position,
        }
    }

    fn import_error(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::Import {
            msg: msg.into(),
            position,
        }
    }

    pub(crate) fn syntax(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::Syntax {
            msg: msg.into(),
            position,
        }
    }

    #[must_use]
    pub fn position(&self) -> CodeRange {
        match self {
            Self::Syntax { position, .. } | Self::NotSupported { position, .. } | Self::Import { position, .. } => {
                *position
            }
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { msg, position } => write!(f, "{position}: syntax error: {msg}"),
            Self::NotSupported { msg, position } => write!(f, "{position}: not supported: {msg}"),
            Self::Import { msg, position } => write!(f, "{position}: import error: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses one module's source text.
pub fn parse(code: &str, module: &str) -> Result<ParsedModule, ParseError> {
    let mut parser = Parser::new(code);
    let parsed = parse_module(code).map_err(|e| ParseError::syntax(e.to_string(), parser.convert_range(e.range())))?;
    let mut boundary = None;
    let mut body = Vec::new();
    for statement in parsed.into_syntax().body {
        if let Some(pragma) = parser.boundary_pragma(&statement)? {
            boundary = Some(pragma);
            continue;
        }
        body.push(parser.parse_statement(statement)?);
    }
    Ok(ParsedModule {
        name: module.to_owned(),
        boundary,
        imports: parser.imports,
        body,
    })
}

struct Parser {
    /// Byte offset of the start of every line.
    line_starts: Vec<usize>,
    /// Remaining nesting budget.
    depth_remaining: u16,
    imports: Vec<ImportEdge>,
}

impl Parser {
    fn new(code: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(code.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            line_starts,
            depth_remaining: MAX_NESTING_DEPTH,
            imports: Vec::new(),
        }
    }

    /// Recognises `__boundary__ = "server"` at module level.
    fn boundary_pragma(&self, statement: &AstStmt) -> Result<Option<Boundary>, ParseError> {
        let AstStmt::Assign(assign) = statement else {
            return Ok(None);
        };
        let [AstExpr::Name(target)] = assign.targets.as_slice() else {
            return Ok(None);
        };
        if target.id.as_str() != BOUNDARY_PRAGMA {
            return Ok(None);
        }
        let position = self.convert_range(assign.range);
        let AstExpr::StringLiteral(literal) = assign.value.as_ref() else {
            return Err(ParseError::syntax(
                "__boundary__ must be a string literal",
                position,
            ));
        };
        let text = literal.value.to_str();
        text.parse().map(Some).map_err(|_| {
            ParseError::syntax(
                format!("unknown boundary '{text}', expected 'server', 'client' or 'shared'"),
                position,
            )
        })
    }

    fn parse_statements(&mut self, statements: Vec<AstStmt>) -> Result<Vec<Stmt>, ParseError> {
        statements.into_iter().map(|s| self.parse_statement(s)).collect()
    }

    fn parse_statement(&mut self, statement: AstStmt) -> Result<Stmt, ParseError> {
        self.decr_depth_remaining(|| statement.range())?;
        let result = self.parse_statement_impl(statement);
        self.depth_remaining += 1;
        result
    }

    fn parse_statement_impl(&mut self, statement: AstStmt) -> Result<Stmt, ParseError> {
        match statement {
            AstStmt::FunctionDef(function) => {
                let position = self.convert_range(function.range);
                if function.is_async {
                    return Err(ParseError::not_supported("async functions", position));
                }
                let decorators = self.parse_decorators(&function.decorator_list)?;
                let params = self.parse_parameters(&function.parameters, position)?;
                let name = self.identifier(function.name.as_str(), function.name.range);
                let body = self.parse_statements(function.body.into_iter().collect())?;
                Ok(Stmt::FunctionDef(FunctionDef {
                    name,
                    params,
                    body,
                    decorators,
                    is_lambda: false,
                    position,
                    id: None,
                    captures: Vec::new(),
                }))
            }
            AstStmt::Assign(ast::StmtAssign { targets, value, range, .. }) => {
                let position = self.convert_range(range);
                if targets.len() != 1 {
                    return Err(ParseError::not_supported("chained assignment", position));
                }
                let value = self.parse_expression(*value)?;
                match targets.into_iter().next() {
                    Some(AstExpr::Name(ast::ExprName { id, range, .. })) => Ok(Stmt::Assign {
                        target: self.identifier(id.as_str(), range),
                        value,
                    }),
                    Some(AstExpr::Attribute(attribute)) => {
                        let target = self.signal_target(attribute)?;
                        Ok(Stmt::SignalWrite { target, value })
                    }
                    _ => Err(ParseError::not_supported(
                        "assignment targets other than a name or `name.value`",
                        position,
                    )),
                }
            }
            AstStmt::AugAssign(ast::StmtAugAssign {
                target, op, value, range, ..
            }) => {
                let position = self.convert_range(range);
                let op = convert_op(op, position)?;
                let value = self.parse_expression(*value)?;
                match *target {
                    AstExpr::Name(ast::ExprName { id, range, .. }) => Ok(Stmt::OpAssign {
                        target: self.identifier(id.as_str(), range),
                        op,
                        value,
                    }),
                    AstExpr::Attribute(attribute) => {
                        let target = self.signal_target(attribute)?;
                        Ok(Stmt::SignalOpAssign { target, op, value })
                    }
                    _ => Err(ParseError::not_supported(
                        "compound assignment to anything but a name or `name.value`",
                        position,
                    )),
                }
            }
            AstStmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                let test = self.parse_expression(*test)?;
                let body = self.parse_statements(body.into_iter().collect())?;
                let or_else = self.parse_elif_else_clauses(elif_else_clauses)?;
                Ok(Stmt::If {
                    test,
                    body,
                    or_else,
                    position,
                    mode: Default::default(),
                })
            }
            AstStmt::For(ast::StmtFor {
                is_async,
                target,
                iter,
                body,
                orelse,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                if is_async {
                    return Err(ParseError::not_supported("async for", position));
                }
                if !orelse.is_empty() {
                    return Err(ParseError::not_supported("for/else", position));
                }
                let AstExpr::Name(ast::ExprName { id, range, .. }) = *target else {
                    return Err(ParseError::not_supported("loop targets other than a single name", position));
                };
                let target = self.identifier(id.as_str(), range);
                let iter = self.parse_expression(*iter)?;
                let body = self.parse_statements(body.into_iter().collect())?;
                Ok(Stmt::For {
                    target,
                    iter,
                    body,
                    position,
                    mode: Default::default(),
                })
            }
            AstStmt::With(ast::StmtWith {
                is_async,
                items,
                body,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                if is_async || items.len() != 1 {
                    return Err(ParseError::not_supported("`with` over more than one node", position));
                }
                let Some(item) = items.into_iter().next() else {
                    return Err(ParseError::syntax("empty with statement", position));
                };
                if item.optional_vars.is_some() {
                    return Err(ParseError::not_supported("`with ... as name`", position));
                }
                let node = self.parse_expression(item.context_expr)?;
                let body = self.parse_statements(body.into_iter().collect())?;
                Ok(Stmt::With { node, body, position })
            }
            AstStmt::Return(ast::StmtReturn { value, range, .. }) => {
                let position = self.convert_range(range);
                let value = value.map(|v| self.parse_expression(*v)).transpose()?;
                Ok(Stmt::Return { value, position })
            }
            AstStmt::Expr(ast::StmtExpr { value, .. }) => Ok(Stmt::Expr(self.parse_expression(*value)?)),
            AstStmt::Pass(_) => Ok(Stmt::Pass),
            AstStmt::Import(ast::StmtImport { names, range, .. }) => {
                let position = self.convert_range(range);
                let mut imported = Vec::with_capacity(names.len());
                for alias in names {
                    let module = alias.name.as_str().to_owned();
                    let binding = match &alias.asname {
                        Some(asname) => self.identifier(asname.as_str(), asname.range),
                        None if module.contains('.') => {
                            return Err(ParseError::import_error(
                                format!("`import {module}` needs an alias (`import {module} as name`)"),
                                position,
                            ));
                        }
                        None => self.identifier(&module, alias.name.range),
                    };
                    self.imports.push(ImportEdge {
                        module: module.clone(),
                        position,
                    });
                    imported.push(ImportName {
                        name: module,
                        alias: binding,
                    });
                }
                Ok(Stmt::Import {
                    names: imported,
                    position,
                })
            }
            AstStmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                if level > 0 {
                    return Err(ParseError::import_error("relative imports are not supported", position));
                }
                let Some(module) = module else {
                    return Err(ParseError::import_error("missing module name", position));
                };
                let module = module.as_str().to_owned();
                let mut imported = Vec::with_capacity(names.len());
                for alias in names {
                    let name = alias.name.as_str();
                    if name == "*" {
                        return Err(ParseError::import_error("star imports are not supported", position));
                    }
                    let binding = match &alias.asname {
                        Some(asname) => self.identifier(asname.as_str(), asname.range),
                        None => self.identifier(name, alias.name.range),
                    };
                    imported.push(ImportName {
                        name: name.to_owned(),
                        alias: binding,
                    });
                }
                self.imports.push(ImportEdge {
                    module: module.clone(),
                    position,
                });
                Ok(Stmt::ImportFrom {
                    module,
                    names: imported,
                    position,
                })
            }
            other => {
                let position = self.convert_range(other.range());
                Err(ParseError::not_supported(
                    format!("`{}` statements", statement_keyword(&other)),
                    position,
                ))
            }
        }
    }

    fn parse_elif_else_clauses(&mut self, clauses: Vec<ElifElseClause>) -> Result<Vec<Stmt>, ParseError> {
        let mut tail: Vec<Stmt> = Vec::new();
        for clause in clauses.into_iter().rev() {
            match clause.test {
                Some(test) => {
                    let position = self.convert_range(clause.range);
                    let test = self.parse_expression(test)?;
                    let body = self.parse_statements(clause.body.into_iter().collect())?;
                    tail = vec![Stmt::If {
                        test,
                        body,
                        or_else: tail,
                        position,
                        mode: Default::default(),
                    }];
                }
                None => {
                    tail = self.parse_statements(clause.body.into_iter().collect())?;
                }
            }
        }
        Ok(tail)
    }

    /// `name.value` as an assignment target.
    fn signal_target(&self, attribute: ast::ExprAttribute) -> Result<Identifier, ParseError> {
        let position = self.convert_range(attribute.range);
        match *attribute.value {
            AstExpr::Name(ast::ExprName { id, range, .. }) if attribute.attr.as_str() == "value" => {
                Ok(self.identifier(id.as_str(), range))
            }
            _ => Err(ParseError::not_supported(
                "attribute assignment other than `name.value`",
                position,
            )),
        }
    }

    fn parse_decorators(&self, decorators: &[ast::Decorator]) -> Result<Decorators, ParseError> {
        let mut parsed = Decorators::default();
        for decorator in decorators {
            let position = self.convert_range(decorator.range);
            let name = match &decorator.expression {
                AstExpr::Name(name) => name.id.as_str(),
                AstExpr::Attribute(attribute) => attribute.attr.as_str(),
                _ => return Err(ParseError::not_supported("decorator expressions", position)),
            };
            match name {
                "component" => parsed.component = true,
                "server" => parsed.server = true,
                "rpc" => parsed.rpc = true,
                "client" => parsed.client = true,
                other => {
                    return Err(ParseError::not_supported(format!("decorator `@{other}`"), position));
                }
            }
        }
        Ok(parsed)
    }

    fn parse_parameters(&self, parameters: &ast::Parameters, position: CodeRange) -> Result<Vec<Identifier>, ParseError> {
        if parameters.vararg.is_some() || parameters.kwarg.is_some() || !parameters.kwonlyargs.is_empty() {
            return Err(ParseError::not_supported("*args, **kwargs and keyword-only parameters", position));
        }
        parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .map(|param| {
                if param.default.is_some() {
                    return Err(ParseError::not_supported(
                        "parameter defaults",
                        self.convert_range(param.range),
                    ));
                }
                Ok(self.identifier(param.parameter.name.as_str(), param.parameter.name.range))
            })
            .collect()
    }

    fn parse_expression(&mut self, expression: AstExpr) -> Result<ExprLoc, ParseError> {
        self.decr_depth_remaining(|| expression.range())?;
        let result = self.parse_expression_impl(expression);
        self.depth_remaining += 1;
        result
    }

    fn parse_boxed(&mut self, expression: AstExpr) -> Result<Box<ExprLoc>, ParseError> {
        self.parse_expression(expression).map(Box::new)
    }

    fn parse_expression_impl(&mut self, expression: AstExpr) -> Result<ExprLoc, ParseError> {
        let position = self.convert_range(expression.range());
        let expr = match expression {
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let op = match op {
                    BoolOp::And => BoolOperator::And,
                    BoolOp::Or => BoolOperator::Or,
                };
                let mut values = values.into_iter();
                let first = values
                    .next()
                    .ok_or_else(|| ParseError::syntax("empty boolean expression", position))?;
                let mut left = self.parse_expression(first)?;
                for value in values {
                    let right = self.parse_expression(value)?;
                    left = ExprLoc::new(
                        position,
                        Expr::Bool {
                            left: Box::new(left),
                            op,
                            right: Box::new(right),
                        },
                    );
                }
                return Ok(left);
            }
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, .. }) => Expr::Op {
                left: self.parse_boxed(*left)?,
                op: convert_op(op, position)?,
                right: self.parse_boxed(*right)?,
            },
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => match op {
                UnaryOp::Not => Expr::Unary {
                    op: UnaryOperator::Not,
                    operand: self.parse_boxed(*operand)?,
                },
                UnaryOp::USub => Expr::Unary {
                    op: UnaryOperator::Neg,
                    operand: self.parse_boxed(*operand)?,
                },
                UnaryOp::UAdd => return self.parse_expression(*operand),
                UnaryOp::Invert => return Err(ParseError::not_supported("the `~` operator", position)),
            },
            AstExpr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                let params = match parameters {
                    Some(parameters) => self.parse_parameters(&parameters, position)?,
                    None => Vec::new(),
                };
                let body = self.parse_expression(*body)?;
                Expr::Lambda(Box::new(FunctionDef {
                    name: Identifier::new("<lambda>", position),
                    params,
                    body: vec![Stmt::Return {
                        value: Some(body),
                        position,
                    }],
                    decorators: Decorators::default(),
                    is_lambda: true,
                    position,
                    id: None,
                    captures: Vec::new(),
                }))
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => Expr::IfElse {
                test: self.parse_boxed(*test)?,
                body: self.parse_boxed(*body)?,
                orelse: self.parse_boxed(*orelse)?,
            },
            AstExpr::Dict(ast::ExprDict { items, .. }) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    let Some(key) = item.key else {
                        return Err(ParseError::not_supported("`**` unpacking in dict literals", position));
                    };
                    pairs.push((self.parse_expression(key)?, self.parse_expression(item.value)?));
                }
                Expr::Dict(pairs)
            }
            AstExpr::List(ast::ExprList { elts, .. }) => {
                Expr::List(elts.into_iter().map(|e| self.parse_expression(e)).collect::<Result<_, _>>()?)
            }
            AstExpr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                let ops = ops.into_vec();
                let comparators = comparators.into_vec();
                let ([op], [right]) = (ops.as_slice(), comparators.as_slice()) else {
                    return Err(ParseError::not_supported("chained comparisons", position));
                };
                let op = match op {
                    CmpOp::Eq => CmpOperator::Eq,
                    CmpOp::NotEq => CmpOperator::NotEq,
                    CmpOp::Lt => CmpOperator::Lt,
                    CmpOp::LtE => CmpOperator::LtE,
                    CmpOp::Gt => CmpOperator::Gt,
                    CmpOp::GtE => CmpOperator::GtE,
                    other => {
                        return Err(ParseError::not_supported(
                            format!("the `{}` operator", other.as_str()),
                            position,
                        ));
                    }
                };
                Expr::Cmp {
                    left: self.parse_boxed(*left)?,
                    op,
                    right: self.parse_boxed(right.clone())?,
                }
            }
            AstExpr::Call(ast::ExprCall { func, arguments, .. }) => {
                let callee = self.parse_boxed(*func)?;
                let mut args = Vec::new();
                for arg in arguments.args.into_vec() {
                    if matches!(arg, AstExpr::Starred(_)) {
                        return Err(ParseError::not_supported("`*` unpacking in calls", position));
                    }
                    args.push(self.parse_expression(arg)?);
                }
                let mut kwargs = Vec::new();
                for keyword in arguments.keywords {
                    let kw_position = self.convert_range(keyword.range);
                    let Some(name) = keyword.arg else {
                        return Err(ParseError::not_supported("`**` unpacking in calls", kw_position));
                    };
                    kwargs.push(Kwarg {
                        name: name.as_str().to_owned(),
                        value: self.parse_expression(keyword.value)?,
                        position: kw_position,
                    });
                }
                Expr::Call(Call {
                    callee,
                    args,
                    kwargs,
                    target: Default::default(),
                })
            }
            AstExpr::FString(ast::ExprFString { value, .. }) => self.parse_fstring(&value, position)?,
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                Expr::Literal(Literal::Str(value.to_str().to_owned()))
            }
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                Number::Int(i) => match i.as_i64() {
                    Some(i) => Expr::Literal(Literal::Number(i as f64)),
                    None => return Err(ParseError::not_supported("integers wider than 64 bits", position)),
                },
                Number::Float(f) => Expr::Literal(Literal::Number(f)),
                Number::Complex { .. } => return Err(ParseError::not_supported("complex numbers", position)),
            },
            AstExpr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => Expr::Literal(Literal::Bool(value)),
            AstExpr::NoneLiteral(_) => Expr::Literal(Literal::None),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => match *value {
                AstExpr::Name(ast::ExprName { id, range, .. }) => {
                    let object = self.identifier(id.as_str(), range);
                    if attr.as_str() == "value" {
                        Expr::SignalRead(object)
                    } else {
                        Expr::ModuleAttr {
                            module: object,
                            attr: self.identifier(attr.as_str(), attr.range),
                        }
                    }
                }
                _ => {
                    return Err(ParseError::not_supported(
                        "attribute access on anything but a name (method calls are not supported)",
                        position,
                    ));
                }
            },
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                if matches!(*slice, AstExpr::Slice(_)) {
                    return Err(ParseError::not_supported("slices", position));
                }
                Expr::Subscript {
                    object: self.parse_boxed(*value)?,
                    index: self.parse_boxed(*slice)?,
                }
            }
            AstExpr::Name(ast::ExprName { id, range, .. }) => Expr::Name(self.identifier(id.as_str(), range)),
            _ => return Err(ParseError::not_supported("this kind of expression", position)),
        };
        Ok(ExprLoc::new(position, expr))
    }

    fn parse_fstring(&mut self, value: &ast::FStringValue, position: CodeRange) -> Result<Expr, ParseError> {
        let mut parts = Vec::new();
        for fstring_part in value {
            match fstring_part {
                ast::FStringPart::Literal(lit) => {
                    if !lit.value.is_empty() {
                        parts.push(FStringPart::Literal(lit.value.to_string()));
                    }
                }
                ast::FStringPart::FString(fstring) => {
                    for element in &fstring.elements {
                        match element {
                            InterpolatedStringElement::Literal(lit) => {
                                parts.push(FStringPart::Literal(lit.value.to_string()));
                            }
                            InterpolatedStringElement::Interpolation(interp) => {
                                if interp.format_spec.is_some()
                                    || interp.debug_text.is_some()
                                    || interp.conversion != ast::ConversionFlag::None
                                {
                                    return Err(ParseError::not_supported(
                                        "f-string conversions and format specs",
                                        position,
                                    ));
                                }
                                let expr = self.parse_expression((*interp.expression).clone())?;
                                parts.push(FStringPart::Interpolation(expr));
                            }
                        }
                    }
                }
            }
        }
        // an f-string without placeholders is just a string
        if let [FStringPart::Literal(text)] = parts.as_slice() {
            return Ok(Expr::Literal(Literal::Str(text.clone())));
        }
        if parts.is_empty() {
            return Ok(Expr::Literal(Literal::Str(String::new())));
        }
        Ok(Expr::FString(parts))
    }

    fn identifier(&self, name: &str, range: TextRange) -> Identifier {
        Identifier::new(name, self.convert_range(range))
    }

    fn convert_range(&self, range: TextRange) -> CodeRange {
        CodeRange::new(
            self.position(range.start().into()),
            self.position(range.end().into()),
        )
    }

    fn position(&self, offset: usize) -> CodeLoc {
        let line = self.line_starts.partition_point(|start| *start <= offset).max(1);
        let column = offset - self.line_starts[line - 1];
        CodeLoc::new(
            u32::try_from(line).unwrap_or(u32::MAX),
            u32::try_from(column + 1).unwrap_or(u32::MAX),
        )
    }

    fn decr_depth_remaining(&mut self, get_range: impl FnOnce() -> TextRange) -> Result<(), ParseError> {
        if let Some(depth_remaining) = self.depth_remaining.checked_sub(1) {
            self.depth_remaining = depth_remaining;
            Ok(())
        } else {
            let position = self.convert_range(get_range());
            Err(ParseError::syntax("too many nested blocks or parentheses", position))
        }
    }
}

fn convert_op(op: AstOperator, position: CodeRange) -> Result<Operator, ParseError> {
    match op {
        AstOperator::Add => Ok(Operator::Add),
        AstOperator::Sub => Ok(Operator::Sub),
        AstOperator::Mult => Ok(Operator::Mul),
        AstOperator::Div => Ok(Operator::Div),
        AstOperator::Mod => Ok(Operator::Mod),
        other => Err(ParseError::not_supported(
            format!("the `{}` operator", other.as_str()),
            position,
        )),
    }
}

fn statement_keyword(statement: &AstStmt) -> &'static str {
    match statement {
        AstStmt::ClassDef(_) => "class",
        AstStmt::While(_) => "while",
        AstStmt::Try(_) => "try",
        AstStmt::Raise(_) => "raise",
        AstStmt::Delete(_) => "del",
        AstStmt::Global(_) => "global",
        AstStmt::Nonlocal(_) => "nonlocal",
        AstStmt::Assert(_) => "assert",
        AstStmt::Match(_) => "match",
        AstStmt::Break(_) => "break",
        AstStmt::Continue(_) => "continue",
        AstStmt::AnnAssign(_) => "annotated assignment",
        _ => "this kind of",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based_byte_columns() {
        let module = parse("x = 1\nif y.value:\n    Text('a')\n", "main").unwrap();
        let Stmt::If { test, .. } = &module.body[1] else {
            panic!("expected if, got {:?}", module.body[1]);
        };
        assert_eq!(test.position.start(), CodeLoc::new(2, 4));
        assert_eq!(test.position.to_string(), "2:4");
    }

    #[test]
    fn boundary_pragma_is_extracted() {
        let module = parse("__boundary__ = 'server'\nimport sqlite3\n", "db").unwrap();
        assert_eq!(module.boundary, Some(Boundary::Server));
        assert_eq!(module.body.len(), 1);
        assert_eq!(module.imports[0].module, "sqlite3");
    }

    #[test]
    fn unknown_boundary_is_rejected() {
        let err = parse("__boundary__ = 'edge'\n", "m").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }), "{err}");
    }

    #[test]
    fn elif_chains_nest() {
        let module = parse("if a.value:\n    pass\nelif b.value:\n    pass\nelse:\n    pass\n", "m").unwrap();
        let Stmt::If { or_else, .. } = &module.body[0] else {
            panic!("expected if");
        };
        assert!(matches!(or_else.as_slice(), [Stmt::If { or_else, .. }] if or_else.len() == 1));
    }

    #[test]
    fn unsupported_syntax_reports_location() {
        let err = parse("x = 1\nwhile x:\n    pass\n", "m").unwrap_err();
        assert_eq!(err.to_string(), "2:1: not supported: `while` statements");
    }
}
