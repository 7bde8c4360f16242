//! Syntax tree of the UI language.
//!
//! The parser produces these nodes with every [`Binding`], function id and call target
//! unset; [`prepare`](crate::prepare) resolves names and closure captures in place and
//! the [`linker`](crate::link) fills in call targets. Only the parser output is
//! serialized (by the module cache), so the resolved fields are skipped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{intrinsics::Intrinsic, parse::CodeRange};

/// Index of a function (named `def` or lambda) in the prepared program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// What a name refers to, decided during preparation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Binding {
    #[default]
    Unresolved,
    /// Bound in the running frame or one of its block scopes.
    Local(LocalKind),
    /// Free variable of the enclosing function, copied in when the closure is created.
    Capture(LocalKind),
    /// Module-level symbol, by qualified name (`module.name`).
    Global(String),
    /// Built-in form of the UI prelude.
    Builtin(Builtin),
    /// Alias of an imported project module, by module name.
    Module(String),
}

/// How a local binding is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocalKind {
    #[default]
    Plain,
    /// The per-item signal of a reactive iteration; reading the bare name reads the item.
    Item,
}

/// Prelude names that are not ordinary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Signal,
    Computed,
    Style,
    Merge,
    Node(NodeKind),
    Intrinsic(Intrinsic),
    /// Decorator names, only valid in decorator position.
    Decorator,
}

/// Kinds of UI nodes. The discriminant is the byte stored in `CREATE_NODE`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString, strum::FromRepr,
)]
#[repr(u8)]
pub enum NodeKind {
    Root = 0,
    /// Invisible marker for the position of a reactive block.
    Anchor = 1,
    Text = 2,
    Button = 3,
    Input = 4,
    Column = 5,
    Row = 6,
}

impl NodeKind {
    /// Kinds the program may create (the others are created by the VM itself).
    #[must_use]
    pub fn is_constructible(self) -> bool {
        !matches!(self, Self::Root | Self::Anchor)
    }

    /// Whether `with Kind():` may nest children under it.
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, Self::Column | Self::Row)
    }
}

/// Where a call expression goes, decided by the linker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallTarget {
    #[default]
    Unlinked,
    Intrinsic(Intrinsic),
    /// Direct jump to a client function.
    Function(FuncId),
    /// Component instantiation: a direct call whose body builds nodes.
    Component(FuncId),
    Node(NodeKind),
    /// Server function, called over the network by stable name.
    Remote(String),
    /// Call of a closure value held in a variable.
    Dynamic,
    /// `Signal(..)`, `Computed(..)`, `Style(..)`, `merge(..)`: handled by the compiler.
    Form(Builtin),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
    pub position: CodeRange,
    #[serde(skip)]
    pub binding: Binding,
}

impl Identifier {
    #[must_use]
    pub fn new(name: impl Into<String>, position: CodeRange) -> Self {
        Self {
            name: name.into(),
            position,
            binding: Binding::Unresolved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Operator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum CmpOperator {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    LtE,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    GtE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FStringPart {
    Literal(String),
    Interpolation(ExprLoc),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kwarg {
    pub name: String,
    pub value: ExprLoc,
    pub position: CodeRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub callee: Box<ExprLoc>,
    pub args: Vec<ExprLoc>,
    pub kwargs: Vec<Kwarg>,
    #[serde(skip)]
    pub target: CallTarget,
}

impl Call {
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Kwarg> {
        self.kwargs.iter().find(|k| k.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    Name(Identifier),
    /// `name.value`
    SignalRead(Identifier),
    /// `module.attr` on an imported module. `attr` carries the resolved binding.
    ModuleAttr { module: Identifier, attr: Identifier },
    Subscript { object: Box<ExprLoc>, index: Box<ExprLoc> },
    List(Vec<ExprLoc>),
    Dict(Vec<(ExprLoc, ExprLoc)>),
    FString(Vec<FStringPart>),
    Op { left: Box<ExprLoc>, op: Operator, right: Box<ExprLoc> },
    Cmp { left: Box<ExprLoc>, op: CmpOperator, right: Box<ExprLoc> },
    Bool { left: Box<ExprLoc>, op: BoolOperator, right: Box<ExprLoc> },
    Unary { op: UnaryOperator, operand: Box<ExprLoc> },
    IfElse { test: Box<ExprLoc>, body: Box<ExprLoc>, orelse: Box<ExprLoc> },
    Call(Call),
    Lambda(Box<FunctionDef>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExprLoc {
    pub position: CodeRange,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(position: CodeRange, expr: Expr) -> Self {
        Self { position, expr }
    }

    /// The signal name if this is a direct `name.value` read.
    #[must_use]
    pub fn as_signal_read(&self) -> Option<&Identifier> {
        match &self.expr {
            Expr::SignalRead(ident) => Some(ident),
            _ => None,
        }
    }

    /// Whether evaluating this expression statically reads a signal (`x.value` or a
    /// loop item), not counting reads inside nested functions.
    #[must_use]
    pub fn reads_signal(&self) -> bool {
        match &self.expr {
            Expr::SignalRead(_) => true,
            Expr::Name(ident) => matches!(
                ident.binding,
                Binding::Local(LocalKind::Item) | Binding::Capture(LocalKind::Item)
            ),
            Expr::Literal(_) | Expr::ModuleAttr { .. } | Expr::Lambda(_) => false,
            Expr::Subscript { object, index } => object.reads_signal() || index.reads_signal(),
            Expr::List(items) => items.iter().any(Self::reads_signal),
            Expr::Dict(items) => items.iter().any(|(k, v)| k.reads_signal() || v.reads_signal()),
            Expr::FString(parts) => parts.iter().any(|part| match part {
                FStringPart::Literal(_) => false,
                FStringPart::Interpolation(expr) => expr.reads_signal(),
            }),
            Expr::Op { left, right, .. } | Expr::Cmp { left, right, .. } | Expr::Bool { left, right, .. } => {
                left.reads_signal() || right.reads_signal()
            }
            Expr::Unary { operand, .. } => operand.reads_signal(),
            Expr::IfElse { test, body, orelse } => test.reads_signal() || body.reads_signal() || orelse.reads_signal(),
            Expr::Call(call) => {
                call.callee.reads_signal()
                    || call.args.iter().any(Self::reads_signal)
                    || call.kwargs.iter().any(|k| k.value.reads_signal())
            }
        }
    }
}

/// Decorators recognised on `def`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[expect(clippy::struct_excessive_bools, reason = "one flag per decorator")]
pub struct Decorators {
    pub component: bool,
    pub server: bool,
    pub rpc: bool,
    pub client: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Identifier,
    pub params: Vec<Identifier>,
    pub body: Vec<Stmt>,
    pub decorators: Decorators,
    pub is_lambda: bool,
    pub position: CodeRange,
    #[serde(skip)]
    pub id: Option<FuncId>,
    /// Free variables in first-use order, each resolved in the defining scope.
    #[serde(skip)]
    pub captures: Vec<Identifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportName {
    /// Imported name (`b` in `from a import b`), or the module for plain imports.
    pub name: String,
    /// Local binding.
    pub alias: Identifier,
}

/// Whether an `if` / `for` is a reactive block or ordinary control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockMode {
    #[default]
    Undecided,
    Reactive,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    /// `import a as b`
    Import { names: Vec<ImportName>, position: CodeRange },
    /// `from a import b as c`
    ImportFrom {
        module: String,
        names: Vec<ImportName>,
        position: CodeRange,
    },
    Assign { target: Identifier, value: ExprLoc },
    /// `name.value = e`
    SignalWrite { target: Identifier, value: ExprLoc },
    /// `name op= e`
    OpAssign { target: Identifier, op: Operator, value: ExprLoc },
    /// `name.value op= e`
    SignalOpAssign { target: Identifier, op: Operator, value: ExprLoc },
    If {
        test: ExprLoc,
        body: Vec<Stmt>,
        or_else: Vec<Stmt>,
        position: CodeRange,
        #[serde(skip)]
        mode: BlockMode,
    },
    For {
        target: Identifier,
        iter: ExprLoc,
        body: Vec<Stmt>,
        position: CodeRange,
        #[serde(skip)]
        mode: BlockMode,
    },
    /// `with Column(): ...`
    With { node: ExprLoc, body: Vec<Stmt>, position: CodeRange },
    FunctionDef(FunctionDef),
    Return { value: Option<ExprLoc>, position: CodeRange },
    Expr(ExprLoc),
    Pass,
}
