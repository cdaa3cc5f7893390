/// Operator priority table for the shunting-yard expression engine.
///
/// Higher priority binds tighter. When an infix operator arrives, every
/// operator on the stack with a higher priority (or an equal one, for
/// left-associative operators) is reduced first.
///
/// | Priority | Operators                          | Assoc |
/// |----------|------------------------------------|-------|
/// | 95       | `!` `~` unary `+` `defined?`       | right |
/// | 90       | `**`                               | right |
/// | 85       | unary `-`                          | right |
/// | 80       | `*` `/` `%`                        | left  |
/// | 75       | `+` `-`                            | left  |
/// | 70       | `<<` `>>`                          | left  |
/// | 65       | `&`                                | left  |
/// | 60       | `\|` `^`                           | left  |
/// | 55       | `<` `<=` `>` `>=`                  | left  |
/// | 50       | `<=>` `==` `===` `!=` `=~` `!~`    | left  |
/// | 45       | `&&`                               | left  |
/// | 40       | `\|\|`                             | left  |
/// | 35       | `..` `...`                         | left  |
/// | 30       | `? :`                              | right |
/// | 20       | `=` and operator assignment        | right |
/// | 15       | `not`                              | right |
/// | 10       | `and` `or`                         | left  |
/// | 5        | splat `*`, `**`, block pass `&`    | right |

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

/// What a reduction of the operator builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `lhs.op(rhs)`, or `recv.op` for prefix operators.
    Method,
    And,
    Or,
    Not,
    Assign,
    /// `lhs op= rhs`; the payload is the operator without `=`.
    OpAssign(&'static str),
    Range,
    ERange,
    /// `cond ? then` awaiting its `:`.
    Ternary,
    /// `cond ? then : else`, reduced with three operands.
    TernaryElse,
    Defined,
    Splat,
    DSplat,
    BlockPass,
    /// Unary minus: `recv.-@`.
    Negate,
    /// Unary plus: `recv.+@`.
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Oper {
    pub sym: &'static str,
    pub pri: u8,
    pub assoc: Assoc,
    pub prefix: bool,
    pub kind: OpKind,
}

impl Oper {
    const fn infix(sym: &'static str, pri: u8, assoc: Assoc, kind: OpKind) -> Self {
        Self {
            sym,
            pri,
            assoc,
            prefix: false,
            kind,
        }
    }

    const fn prefix(sym: &'static str, pri: u8, kind: OpKind) -> Self {
        Self {
            sym,
            pri,
            assoc: Assoc::Right,
            prefix: true,
            kind,
        }
    }

    /// Number of values a reduction pops.
    pub fn arity(&self) -> usize {
        match self.kind {
            OpKind::TernaryElse => 3,
            _ if self.prefix => 1,
            _ => 2,
        }
    }

    /// Whether `self`, on the stack, must be reduced before `incoming` is
    /// pushed.
    pub fn reduces_before(&self, incoming: &Oper) -> bool {
        if incoming.prefix {
            return false;
        }
        // Assignment binds to the value right before it, whatever is on
        // the stack: `a && b = c` is `a && (b = c)`.
        if matches!(incoming.kind, OpKind::Assign | OpKind::OpAssign(_)) {
            return false;
        }
        if self.kind == OpKind::Ternary {
            return false;
        }
        self.pri > incoming.pri || (self.pri == incoming.pri && incoming.assoc == Assoc::Left)
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self.kind, OpKind::Assign | OpKind::OpAssign(_))
    }
}

const INFIX: &[Oper] = &[
    Oper::infix("**", 90, Assoc::Right, OpKind::Method),
    Oper::infix("*", 80, Assoc::Left, OpKind::Method),
    Oper::infix("/", 80, Assoc::Left, OpKind::Method),
    Oper::infix("%", 80, Assoc::Left, OpKind::Method),
    Oper::infix("+", 75, Assoc::Left, OpKind::Method),
    Oper::infix("-", 75, Assoc::Left, OpKind::Method),
    Oper::infix("<<", 70, Assoc::Left, OpKind::Method),
    Oper::infix(">>", 70, Assoc::Left, OpKind::Method),
    Oper::infix("&", 65, Assoc::Left, OpKind::Method),
    Oper::infix("|", 60, Assoc::Left, OpKind::Method),
    Oper::infix("^", 60, Assoc::Left, OpKind::Method),
    Oper::infix("<", 55, Assoc::Left, OpKind::Method),
    Oper::infix("<=", 55, Assoc::Left, OpKind::Method),
    Oper::infix(">", 55, Assoc::Left, OpKind::Method),
    Oper::infix(">=", 55, Assoc::Left, OpKind::Method),
    Oper::infix("<=>", 50, Assoc::Left, OpKind::Method),
    Oper::infix("==", 50, Assoc::Left, OpKind::Method),
    Oper::infix("===", 50, Assoc::Left, OpKind::Method),
    Oper::infix("!=", 50, Assoc::Left, OpKind::Method),
    Oper::infix("=~", 50, Assoc::Left, OpKind::Method),
    Oper::infix("!~", 50, Assoc::Left, OpKind::Method),
    Oper::infix("&&", 45, Assoc::Left, OpKind::And),
    Oper::infix("||", 40, Assoc::Left, OpKind::Or),
    Oper::infix("..", 35, Assoc::Left, OpKind::Range),
    Oper::infix("...", 35, Assoc::Left, OpKind::ERange),
    Oper::infix("?", 30, Assoc::Right, OpKind::Ternary),
    Oper::infix(":", 30, Assoc::Right, OpKind::TernaryElse),
    Oper::infix("=", 20, Assoc::Right, OpKind::Assign),
    Oper::infix("+=", 20, Assoc::Right, OpKind::OpAssign("+")),
    Oper::infix("-=", 20, Assoc::Right, OpKind::OpAssign("-")),
    Oper::infix("*=", 20, Assoc::Right, OpKind::OpAssign("*")),
    Oper::infix("/=", 20, Assoc::Right, OpKind::OpAssign("/")),
    Oper::infix("%=", 20, Assoc::Right, OpKind::OpAssign("%")),
    Oper::infix("**=", 20, Assoc::Right, OpKind::OpAssign("**")),
    Oper::infix("<<=", 20, Assoc::Right, OpKind::OpAssign("<<")),
    Oper::infix(">>=", 20, Assoc::Right, OpKind::OpAssign(">>")),
    Oper::infix("|=", 20, Assoc::Right, OpKind::OpAssign("|")),
    Oper::infix("&=", 20, Assoc::Right, OpKind::OpAssign("&")),
    Oper::infix("^=", 20, Assoc::Right, OpKind::OpAssign("^")),
    Oper::infix("||=", 20, Assoc::Right, OpKind::OpAssign("||")),
    Oper::infix("&&=", 20, Assoc::Right, OpKind::OpAssign("&&")),
    Oper::infix("and", 10, Assoc::Left, OpKind::And),
    Oper::infix("or", 10, Assoc::Left, OpKind::Or),
];

const PREFIX: &[Oper] = &[
    Oper::prefix("!", 95, OpKind::Not),
    Oper::prefix("~", 95, OpKind::Method),
    Oper::prefix("+", 95, OpKind::Plus),
    Oper::prefix("defined?", 95, OpKind::Defined),
    Oper::prefix("-", 85, OpKind::Negate),
    Oper::prefix("not", 15, OpKind::Not),
    Oper::prefix("*", 5, OpKind::Splat),
    Oper::prefix("**", 5, OpKind::DSplat),
    Oper::prefix("&", 5, OpKind::BlockPass),
];

pub fn infix(sym: &str) -> Option<Oper> {
    INFIX.iter().find(|o| o.sym == sym).copied()
}

pub fn prefix(sym: &str) -> Option<Oper> {
    PREFIX.iter().find(|o| o.sym == sym).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(s: &str) -> Oper {
        infix(s).unwrap()
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        assert!(op("*").reduces_before(&op("+")));
        assert!(!op("+").reduces_before(&op("*")));
    }

    #[test]
    fn left_assoc_reduces_on_equal_priority() {
        assert!(op("-").reduces_before(&op("+")));
        assert!(!op("**").reduces_before(&op("**")));
    }

    #[test]
    fn or_reduces_before_ternary() {
        assert!(op("||").reduces_before(&op("?")));
        assert!(!op("?").reduces_before(&op("||")));
    }

    #[test]
    fn assignment_never_triggers_reduction() {
        assert!(!op("&&").reduces_before(&op("=")));
        assert!(!op("+").reduces_before(&op("||=")));
    }

    #[test]
    fn open_ternary_waits_for_colon() {
        assert!(!op("?").reduces_before(&op(":")));
        assert!(op("+").reduces_before(&op(":")));
    }

    #[test]
    fn prefix_lookup() {
        assert_eq!(prefix("-").map(|o| o.kind), Some(OpKind::Negate));
        assert_eq!(prefix("not").map(|o| o.pri), Some(15));
        assert!(prefix("/").is_none());
        assert_eq!(prefix("!").unwrap().arity(), 1);
        assert_eq!(op(":").arity(), 3);
    }
}
