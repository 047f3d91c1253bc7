//! Untyped AST produced by the parser (`spec.md` §3.2).
//!
//! Two discriminated unions, `Statement` and `Expression`; every node
//! carries a source byte offset so later passes (resolver, emitter, VM) can
//! report precise diagnostics without threading position information
//! through every call.

use crate::intern::StringId;

pub type Offset = u32;

#[derive(Debug, Clone)]
pub struct Program {
    pub package: Option<String>,
    pub imports: Vec<Import>,
    pub classes: Vec<ClassDecl>,
    pub functions: Vec<FuncDecl>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub path: Vec<String>,
    pub alias: Option<String>,
    pub is_static: bool,
    pub is_star: bool,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: StringId,
    pub type_name: Option<String>,
    pub default: Option<Expression>,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: StringId,
    pub return_type: Option<String>,
    pub params: Vec<Param>,
    pub body: Block,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: StringId,
    pub type_name: Option<String>,
    pub default: Option<Expression>,
    pub is_const: bool,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: StringId,
    pub parent: Option<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<FuncDecl>,
    pub static_methods: Vec<FuncDecl>,
    pub offset: Offset,
}

pub type Block = Vec<Statement>;

#[derive(Debug, Clone)]
pub enum Statement {
    VarDecl { name: StringId, type_name: Option<String>, init: Option<Expression>, offset: Offset },
    ConstDecl { name: StringId, init: Expression, offset: Offset },
    FuncDecl(Box<FuncDecl>),
    ClassDecl(Box<ClassDecl>),
    Import(Import),
    Package(String),
    Block(Block),
    If { cond: Expression, then_branch: Block, else_branch: Option<Block>, offset: Offset },
    For { init: Option<Box<Statement>>, cond: Option<Expression>, update: Option<Box<Statement>>, body: Block, offset: Offset },
    While { cond: Expression, body: Block, offset: Offset },
    DoUntil { body: Block, cond: Expression, offset: Offset },
    Return { value: Option<Expression>, offset: Offset },
    Break { offset: Offset },
    Continue { offset: Offset },
    Die { value: Expression, offset: Offset },
    ExprStmt(Expression),
    Switch { subject: Expression, arms: Vec<SwitchArm>, offset: Offset },
}

#[derive(Debug, Clone)]
pub struct SwitchArm {
    pub pattern: Pattern,
    pub guard: Option<Expression>,
    pub body: Expression,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard,
    /// `_`: binds nothing, matches anything (distinct from `*`, the glossary
    /// treats both as wildcards but `_` may still be referenced as "ignore").
    Any,
    Literal(Expression),
    /// Comma-separated literal alternatives: `1, 2, 3 -> ...`.
    LiteralList(Vec<Expression>),
    /// `int`, `String`, or a user class name.
    TypeName(String),
    Binding(StringId, Offset),
    Regex { pattern: String, modifiers: String },
    List(Vec<Pattern>),
    Map(Vec<(String, Pattern)>),
    /// `${expr}`: an arbitrary expression evaluated in the pattern's own
    /// scope (sibling bindings declared earlier in the same pattern are
    /// already in scope) and compared to the matched sub-value for equality.
    Computed(Expression),
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal { value: Literal, offset: Offset },
    Identifier { name: StringId, offset: Offset },
    Binop { op: BinOp, lhs: Box<Expression>, rhs: Box<Expression>, offset: Offset },
    Unop { op: UnOp, operand: Box<Expression>, offset: Offset },
    Assign { target: Box<Expression>, op: AssignOp, value: Box<Expression>, offset: Offset },
    Ternary { cond: Box<Expression>, then_expr: Box<Expression>, else_expr: Box<Expression>, offset: Offset },
    Elvis { lhs: Box<Expression>, rhs: Box<Expression>, offset: Offset },
    Call { callee: Box<Expression>, args: Vec<Expression>, trailing_closure: Option<Box<Expression>>, offset: Offset },
    MethodCall { receiver: Box<Expression>, method: StringId, args: Vec<Expression>, trailing_closure: Option<Box<Expression>>, is_safe: bool, offset: Offset },
    FieldAccess { receiver: Box<Expression>, field: StringId, is_safe: bool, offset: Offset },
    Index { receiver: Box<Expression>, index: Box<Expression>, offset: Offset },
    NewInstance { class_name: String, positional: Vec<Expression>, named: Vec<(StringId, Expression)>, offset: Offset },
    ListLit { elements: Vec<Expression>, offset: Offset },
    MapLit { entries: Vec<(Expression, Expression)>, offset: Offset },
    ClosureLit { params: Vec<Param>, body: Block, offset: Offset },
    RegexMatch { subject: Box<Expression>, pattern: String, modifiers: String, offset: Offset },
    RegexSubst { subject: Box<Expression>, pattern: String, replacement: String, modifiers: String, offset: Offset },
    StringInterp { parts: Vec<InterpPart>, offset: Offset },
    Switch { subject: Box<Expression>, arms: Vec<SwitchArm>, offset: Offset },
    InstanceOf { value: Box<Expression>, type_name: String, offset: Offset },
    In { value: Box<Expression>, collection: Box<Expression>, negate: bool, offset: Offset },
    As { value: Box<Expression>, type_name: String, offset: Offset },
    Cast { value: Box<Expression>, type_name: String, offset: Offset },
    MultiAssign { targets: Vec<Expression>, value: Box<Expression>, offset: Offset },
    Do { body: Block, offset: Offset },
    Checkpoint { commit: Box<Expression>, recover: Box<Expression>, offset: Offset },
    /// `$N`: the Nth group of the most recent `=~` match in scope.
    MatchGroup { index: u32, offset: Offset },
}

#[derive(Debug, Clone)]
pub enum InterpPart {
    Literal(String),
    Expr(Expression),
}

#[derive(Debug, Clone)]
pub enum Literal {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(String),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod, TrueMod,
    Eq, Ne, Lt, Le, Gt, Ge, Cmp, IdentEq, IdentNe,
    And, Or,
    BitAnd, BitOr, BitXor, Shl, Shr, UShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg, Not, BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign, AddAssign, SubAssign, MulAssign, DivAssign, ModAssign, ElvisAssign,
}

impl Expression {
    #[must_use]
    pub fn offset(&self) -> Offset {
        match self {
            Expression::Literal { offset, .. }
            | Expression::Identifier { offset, .. }
            | Expression::Binop { offset, .. }
            | Expression::Unop { offset, .. }
            | Expression::Assign { offset, .. }
            | Expression::Ternary { offset, .. }
            | Expression::Elvis { offset, .. }
            | Expression::Call { offset, .. }
            | Expression::MethodCall { offset, .. }
            | Expression::FieldAccess { offset, .. }
            | Expression::Index { offset, .. }
            | Expression::NewInstance { offset, .. }
            | Expression::ListLit { offset, .. }
            | Expression::MapLit { offset, .. }
            | Expression::ClosureLit { offset, .. }
            | Expression::RegexMatch { offset, .. }
            | Expression::RegexSubst { offset, .. }
            | Expression::StringInterp { offset, .. }
            | Expression::Switch { offset, .. }
            | Expression::InstanceOf { offset, .. }
            | Expression::In { offset, .. }
            | Expression::As { offset, .. }
            | Expression::Cast { offset, .. }
            | Expression::MultiAssign { offset, .. }
            | Expression::Do { offset, .. }
            | Expression::Checkpoint { offset, .. }
            | Expression::MatchGroup { offset, .. } => *offset,
        }
    }
}
