//! The prepared AST the compiler consumes.
//!
//! The lexer and parser live outside the core; they hand over this tree
//! with names already carrying their sigils (`$x`, `@list`, `%opts`) and
//! explicitly-qualified globals marked as such. Source positions are kept
//! at statement granularity, which is what error coordinates report.

/// A sequence of statements (a sub body, loop body, or whole unit).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    #[must_use]
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// A statement with its source line.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

impl Stmt {
    #[must_use]
    pub fn new(line: u32, kind: StmtKind) -> Self {
        Self { line, kind }
    }

    /// Shorthand for an expression statement.
    #[must_use]
    pub fn expr(line: u32, expr: Expr) -> Self {
        Self::new(line, StmtKind::Expr(expr))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StmtKind {
    /// An expression evaluated for effect; its value is the statement's
    /// value (the last one becomes the block's value).
    Expr(Expr),
    /// `my $x;` / `my $x = e;` / `my ($a, $b) = e;` / `my @a = e;`
    My { names: Vec<String>, init: Option<Expr> },
    /// `local $Pkg::var;` — dynamic save, restored at block exit.
    Local { name: String },
    /// `if` / `unless` (the parser folds `unless` by swapping blocks).
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    /// `while` / `until` (`negate` true for `until`).
    While {
        label: Option<String>,
        cond: Expr,
        body: Block,
        negate: bool,
    },
    /// C-style `for (init; cond; step) { ... }`.
    For {
        label: Option<String>,
        init: Option<Expr>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Block,
    },
    /// `foreach my $x (LIST) { ... }`; `var` None iterates `$_`.
    Foreach {
        label: Option<String>,
        var: Option<String>,
        list: Expr,
        body: Block,
    },
    /// A bare (possibly labelled) block.
    Block { label: Option<String>, body: Block },
    /// `last LABEL;`
    Last { label: Option<String> },
    /// `next LABEL;`
    Next { label: Option<String> },
    /// `redo LABEL;`
    Redo { label: Option<String> },
    /// `return;` / `return EXPR;`
    Return(Option<Expr>),
    /// `sub name { ... }` — compiled eagerly and installed under the
    /// current package.
    SubDef { name: String, body: Block },
    /// `package Name;` — switches the package for unqualified globals and
    /// sub definitions that follow.
    Package { name: String },
    /// `goto LABEL;` or `goto &sub;`
    Goto(GotoTarget),
    /// `LABEL: STMT` — a statement label (a `goto` target).
    Labeled { label: String, stmt: Box<Stmt> },
}

/// Target of a `goto` statement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum GotoTarget {
    Label(String),
    Sub(Expr),
}

/// Element vs. key access (`$a[i]` vs. `$h{k}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessKind {
    Array,
    Hash,
}

/// The sigil a dereference applies (`$$r`, `@$r`, `%$r`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Sigil {
    Scalar,
    Array,
    Hash,
}

/// Binary operators with dedicated opcodes or builtin routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    /// String (or list) repetition, `x`.
    Repeat,
    NumEq,
    NumNe,
    NumLt,
    NumGt,
    NumLe,
    NumGe,
    /// `<=>`
    NumCmp,
    StrEq,
    StrNe,
    StrLt,
    StrGt,
    StrLe,
    StrGe,
    /// `cmp`
    StrCmp,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Short-circuit operators; lowered to branches, never to opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogicalOp {
    /// `&&` / `and`
    And,
    /// `||` / `or`
    Or,
    /// `//` — tests definedness, not truthiness.
    DefinedOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnOp {
    /// `!` / `not`
    Not,
    /// Unary minus.
    Neg,
}

/// Named functions of the language with fixed lowering (to a dedicated
/// opcode or a `CALL_BUILTIN` id). User subs go through [`Expr::Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Func {
    Print,
    Say,
    Push,
    Pop,
    Shift,
    Unshift,
    Scalar,
    Keys,
    Values,
    Exists,
    Delete,
    Defined,
    Ref,
    Bless,
    Die,
    Warn,
    Require,
    Rand,
    Join,
    Length,
    Substr,
    Reverse,
    Splice,
    Sort,
    Map,
    Grep,
    Wantarray,
    Sprintf,
    Split,
    Abs,
    Int,
    Sqrt,
    Uc,
    Lc,
    Ucfirst,
    Lcfirst,
    Chr,
    Ord,
    Hex,
    Oct,
    Index,
    Rindex,
    Chomp,
    Chop,
    Open,
    Readline,
    Select,
}

/// Method name in a method call: static or computed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Method {
    Named(String),
    Dynamic(Box<Expr>),
}

/// An expression.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Undef,
    Int(i64),
    Num(f64),
    Str(String),
    /// A sigiled name: lexical if declared in scope, otherwise a global in
    /// the current package.
    Var(String),
    /// An explicitly-qualified global (`$main::count`, `@Foo::ISA`).
    Global(String),
    /// Element access: `$a[i]`, `$h{k}`, `$ref->[i]`, `$ref->{k}`.
    Elem {
        container: Box<Expr>,
        index: Box<Expr>,
        kind: AccessKind,
    },
    /// Slice access: `@a[...]`, `@h{...}`.
    Slice {
        container: Box<Expr>,
        indices: Box<Expr>,
        kind: AccessKind,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    CompoundAssign {
        op: BinOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    PreIncr(Box<Expr>),
    PostIncr(Box<Expr>),
    PreDecr(Box<Expr>),
    PostDecr(Box<Expr>),
    /// A parenthesized list.
    List(Vec<Expr>),
    /// `[ LIST ]` — a fresh array reference.
    AnonArray(Vec<Expr>),
    /// `{ LIST }` — a fresh hash reference from a flat key/value list.
    AnonHash(Vec<Expr>),
    /// Inclusive integer range `lo..hi`.
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    /// Call of a named sub (possibly qualified).
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// Call through a code value: `$f->(...)` / `&$f(...)`.
    DynCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Method call: `$obj->m(...)`, `Class->m(...)`, `$obj->$m(...)`.
    MethodCall {
        invocant: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    /// A named-function call with fixed lowering.
    Func {
        func: Func,
        args: Vec<Expr>,
    },
    /// `sub { ... }`
    AnonSub {
        body: Block,
    },
    /// `eval { ... }`
    Eval {
        body: Block,
    },
    /// `eval EXPR` — dynamic eval of a code string.
    EvalStr(Box<Expr>),
    /// `\EXPR`
    Ref(Box<Expr>),
    /// Sigiled dereference: `$$r`, `@$r`, `%$r`.
    Deref {
        sigil: Sigil,
        expr: Box<Expr>,
    },
    /// `Pkg->isa(...)`-style class check as an operator (`ISA` opcode).
    Isa {
        object: Box<Expr>,
        class: Box<Expr>,
    },
}

impl Expr {
    /// Shorthand for boxing in hand-built trees.
    #[must_use]
    pub fn boxed(self) -> Box<Expr> {
        Box::new(self)
    }

    /// Shorthand for a string literal.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Expr::Str(s.into())
    }

    /// Shorthand for a lexical/global variable by sigiled name.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// True if this expression is a valid assignment target.
    #[must_use]
    pub fn is_lvalue(&self) -> bool {
        match self {
            Expr::Var(_) | Expr::Global(_) | Expr::Elem { .. } | Expr::Slice { .. } | Expr::Deref { .. } => true,
            Expr::List(items) => items.iter().all(Expr::is_lvalue),
            _ => false,
        }
    }
}
