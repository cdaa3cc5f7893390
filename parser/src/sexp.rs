/// Tagged-tuple syntax tree.
///
/// Every compound node is a [`Tag`] plus an ordered list of children.
/// Children are either nodes or scalars (names, literals). The parser
/// builds trees once; later passes consume a tree and build a new one, so
/// nothing is shared or mutated in place. Side tables are keyed by
/// [`NodeId`].
///
/// Child layout per tag (`-` marks an optional child, stored as
/// [`Sexp::Nil`]):
///
/// | Tag         | Children                                        |
/// |-------------|-------------------------------------------------|
/// | `Do`        | statements…                                     |
/// | `Call`      | name, `Args`, -block                            |
/// | `Callm`     | receiver, name, `Args`, -block                  |
/// | `Assign`    | target, value                                   |
/// | `OpAssign`  | target, operator name, value                    |
/// | `MAsgn`     | `Array` of targets, value                       |
/// | `If`        | condition, then, -else                          |
/// | `While`     | condition, body                                 |
/// | `Case`      | -subject, `When`…, -else                        |
/// | `When`      | `Array` of tests, body                          |
/// | `Defm`      | name, `Args`, body                              |
/// | `Defs`      | receiver, name, `Args`, body                    |
/// | `Class`     | path, -superclass, body                         |
/// | `Module`    | path, body                                      |
/// | `SClass`    | object, body                                    |
/// | `Lambda`    | `Args`, body                                    |
/// | `Begin`     | body, `Rescue`…, -else, -ensure                 |
/// | `Rescue`    | `Array` of classes, -target, body               |
/// | `Defun`     | label, `Args`, body (lifted block)              |
/// | `Index`     | frame expression, slot number                   |
use crate::quoted;
use crate::span::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Do,
    Call,
    Callm,
    SafeCallm,
    Assign,
    OpAssign,
    MAsgn,
    If,
    While,
    DoWhile,
    Case,
    When,
    For,
    Defm,
    Defs,
    Class,
    Module,
    SClass,
    Lambda,
    Yield,
    BlockGiven,
    Super,
    ZSuper,
    Return,
    Break,
    Next,
    Redo,
    Retry,
    Begin,
    Rescue,
    Array,
    Hash,
    Pair,
    Splat,
    DSplat,
    BlockPass,
    And,
    Or,
    Not,
    Range,
    ERange,
    Regex,
    Interp,
    Colon2,
    Colon3,
    Args,
    Rest,
    BlockArg,
    Default,
    Destruct,
    KwArg,
    Include,
    Alias,
    Defined,
    /// A method chain holding an `&.` link below its last call. A nil
    /// receiver at that link makes the whole chain nil.
    SafeChain,
    // Produced by the transform passes.
    Const,
    Numargs,
    Defun,
    ProcNew,
    Index,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Do => "do",
            Tag::Call => "call",
            Tag::Callm => "callm",
            Tag::SafeCallm => "safecallm",
            Tag::Assign => "assign",
            Tag::OpAssign => "opassign",
            Tag::MAsgn => "masgn",
            Tag::If => "if",
            Tag::While => "while",
            Tag::DoWhile => "dowhile",
            Tag::Case => "case",
            Tag::When => "when",
            Tag::For => "for",
            Tag::Defm => "defm",
            Tag::Defs => "defs",
            Tag::Class => "class",
            Tag::Module => "module",
            Tag::SClass => "sclass",
            Tag::Lambda => "lambda",
            Tag::Yield => "yield",
            Tag::BlockGiven => "block_given",
            Tag::Super => "super",
            Tag::ZSuper => "zsuper",
            Tag::Return => "return",
            Tag::Break => "break",
            Tag::Next => "next",
            Tag::Redo => "redo",
            Tag::Retry => "retry",
            Tag::Begin => "begin",
            Tag::Rescue => "rescue",
            Tag::Array => "array",
            Tag::Hash => "hash",
            Tag::Pair => "pair",
            Tag::Splat => "splat",
            Tag::DSplat => "dsplat",
            Tag::BlockPass => "blockpass",
            Tag::And => "and",
            Tag::Or => "or",
            Tag::Not => "not",
            Tag::Range => "range",
            Tag::ERange => "erange",
            Tag::Regex => "regex",
            Tag::Interp => "interp",
            Tag::Colon2 => "colon2",
            Tag::Colon3 => "colon3",
            Tag::Args => "args",
            Tag::Rest => "rest",
            Tag::BlockArg => "blockarg",
            Tag::Default => "default",
            Tag::Destruct => "destruct",
            Tag::KwArg => "kwarg",
            Tag::Include => "include",
            Tag::Alias => "alias",
            Tag::Defined => "defined",
            Tag::SafeChain => "safechain",
            Tag::Const => "const",
            Tag::Numargs => "numargs",
            Tag::Defun => "defun",
            Tag::ProcNew => "proc_new",
            Tag::Index => "index",
        }
    }
}

/// Identity of a node, unique within one compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Source of fresh [`NodeId`]s. One per unit, shared by the parser and
/// every pass that builds nodes.
#[derive(Debug, Default)]
pub struct NodeIds {
    next: u32,
}

impl NodeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    /// Build a node with a fresh id.
    pub fn node(&mut self, tag: Tag, span: Span, children: Vec<Sexp>) -> Sexp {
        Sexp::Node(Node {
            tag,
            children,
            span,
            id: self.fresh(),
        })
    }

    /// Assignment of `value` to `target`. `recv.attr` becomes a call to
    /// `attr=`, `recv[i]` a call to `[]=`.
    pub fn assign(&mut self, target: Sexp, value: Sexp, span: Span) -> Sexp {
        if let Sexp::Node(node) = &target {
            if node.tag == Tag::SafeChain {
                let inner = self.assign(node.child(0).clone(), value, span);
                return self.node(Tag::SafeChain, span, vec![inner]);
            }
            if matches!(node.tag, Tag::Callm | Tag::SafeCallm) {
                if let Some(name) = node.child(1).as_name() {
                    let setter = if name == "[]" {
                        "[]=".to_string()
                    } else {
                        format!("{name}=")
                    };
                    let mut args = node.child(2).children().to_vec();
                    args.push(value);
                    let args = self.node(Tag::Args, span, args);
                    return self.node(
                        node.tag,
                        span,
                        vec![node.child(0).clone(), Sexp::Name(setter), args, Sexp::Nil],
                    );
                }
            }
        }
        self.node(Tag::Assign, span, vec![target, value])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub tag: Tag,
    pub children: Vec<Sexp>,
    pub span: Span,
    pub id: NodeId,
}

impl Node {
    pub fn child(&self, i: usize) -> &Sexp {
        self.children.get(i).unwrap_or(&Sexp::Nil)
    }

    /// Same tag, span and identity with new children.
    pub fn rebuild(&self, children: Vec<Sexp>) -> Sexp {
        Sexp::Node(Node {
            tag: self.tag,
            children,
            span: self.span,
            id: self.id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    /// Absent optional child.
    Nil,
    Int(i64),
    /// Integer literal beyond 64 bits, decimal text.
    BigInt(String),
    Float(String),
    Str(Vec<u8>),
    /// Symbol literal `:name`.
    Sym(String),
    /// Identifier: local, `@ivar`, `@@cvar`, `$global`, constant, method
    /// name, or one of `self nil true false`.
    Name(String),
    Node(Node),
}

impl Sexp {
    pub fn name(s: impl Into<String>) -> Sexp {
        Sexp::Name(s.into())
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Sexp::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Sexp::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        self.as_node().map(|n| n.tag)
    }

    pub fn is(&self, tag: Tag) -> bool {
        self.tag() == Some(tag)
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Sexp::Name(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Sexp::Nil)
    }

    pub fn span(&self) -> Option<Span> {
        self.as_node().map(|n| n.span)
    }

    pub fn children(&self) -> &[Sexp] {
        match self {
            Sexp::Node(n) => &n.children,
            _ => &[],
        }
    }

    /// Visit this tree in pre-order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Sexp)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}

/// Names that read back unquoted after a `:`: identifiers, ivars,
/// globals, and predicate, bang or setter method names.
fn is_plain_name(s: &str) -> bool {
    let body = s.trim_start_matches('@');
    let body = body.strip_prefix('$').unwrap_or(body);
    let body = body.strip_suffix(['?', '!', '=']).unwrap_or(body);
    s.len() - body.len() <= 3
        && body.starts_with(|c: char| c.is_alphabetic() || c == '_')
        && body.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn write_symbol(f: &mut std::fmt::Formatter<'_>, s: &str) -> std::fmt::Result {
    if is_plain_name(s) {
        write!(f, ":{s}")
    } else {
        write!(f, ":\"{}\"", quoted::escape_bytes(s.as_bytes()))
    }
}

impl std::fmt::Display for Sexp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sexp::Nil => write!(f, "nil"),
            Sexp::Int(n) => write!(f, "{n}"),
            Sexp::BigInt(s) | Sexp::Float(s) => write!(f, "{s}"),
            Sexp::Str(bytes) => write!(f, "\"{}\"", quoted::escape_bytes(bytes)),
            Sexp::Sym(s) => {
                write!(f, "[:sym, ")?;
                write_symbol(f, s)?;
                write!(f, "]")
            }
            Sexp::Name(s) => write_symbol(f, s),
            Sexp::Node(n) => {
                write!(f, "[:{}", n.tag.as_str())?;
                for child in &n.children {
                    write!(f, ", {child}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_bracketed() {
        let mut ids = NodeIds::new();
        let args = ids.node(Tag::Args, Span::default(), vec![Sexp::Int(1)]);
        let call = ids.node(
            Tag::Callm,
            Span::default(),
            vec![Sexp::name("a"), Sexp::name("+"), args, Sexp::Nil],
        );
        assert_eq!(call.to_string(), "[:callm, :a, :\"+\", [:args, 1], nil]");
    }

    #[test]
    fn symbols_quote_when_not_plain_names() {
        assert_eq!(Sexp::Sym("a".into()).to_string(), "[:sym, :a]");
        assert_eq!(Sexp::Sym("empty?".into()).to_string(), "[:sym, :empty?]");
        assert_eq!(Sexp::Sym("a b".into()).to_string(), "[:sym, :\"a b\"]");
        assert_eq!(Sexp::Sym("say \"hi\"".into()).to_string(), "[:sym, :\"say \\\"hi\\\"\"]");
        assert_eq!(Sexp::Sym("<=>".into()).to_string(), "[:sym, :\"<=>\"]");
        assert_eq!(Sexp::name("@@count").to_string(), ":@@count");
        assert_eq!(Sexp::name("$stdout").to_string(), ":$stdout");
        assert_eq!(Sexp::name("a?b").to_string(), ":\"a?b\"");
    }

    #[test]
    fn fresh_ids_are_unique() {
        let mut ids = NodeIds::new();
        let a = ids.fresh();
        let b = ids.fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn rebuild_keeps_identity() {
        let mut ids = NodeIds::new();
        let n = ids.node(Tag::Array, Span::default(), vec![Sexp::Int(1)]);
        let node = n.as_node().unwrap();
        let m = node.rebuild(vec![Sexp::Int(2)]);
        assert_eq!(m.as_node().unwrap().id, node.id);
        assert_eq!(m.children(), &[Sexp::Int(2)]);
    }

    #[test]
    fn assign_to_attribute_calls_setter() {
        let mut ids = NodeIds::new();
        let args = ids.node(Tag::Args, Span::default(), vec![]);
        let target = ids.node(
            Tag::Callm,
            Span::default(),
            vec![Sexp::name("o"), Sexp::name("x"), args, Sexp::Nil],
        );
        let set = ids.assign(target, Sexp::Int(5), Span::default());
        assert_eq!(set.to_string(), "[:callm, :o, :x=, [:args, 5], nil]");
    }

    #[test]
    fn assign_to_index_calls_index_setter() {
        let mut ids = NodeIds::new();
        let args = ids.node(Tag::Args, Span::default(), vec![Sexp::Int(0)]);
        let target = ids.node(
            Tag::Callm,
            Span::default(),
            vec![Sexp::name("a"), Sexp::name("[]"), args, Sexp::Nil],
        );
        let set = ids.assign(target, Sexp::Int(1), Span::default());
        assert_eq!(set.to_string(), "[:callm, :a, :\"[]=\", [:args, 0, 1], nil]");
    }

    #[test]
    fn assign_through_safe_chain_keeps_the_chain() {
        let mut ids = NodeIds::new();
        let args = ids.node(Tag::Args, Span::default(), vec![]);
        let link = ids.node(
            Tag::SafeCallm,
            Span::default(),
            vec![Sexp::name("a"), Sexp::name("b"), args.clone(), Sexp::Nil],
        );
        let last = ids.node(
            Tag::Callm,
            Span::default(),
            vec![link, Sexp::name("c"), args, Sexp::Nil],
        );
        let chain = ids.node(Tag::SafeChain, Span::default(), vec![last]);
        let set = ids.assign(chain, Sexp::Int(1), Span::default());
        assert_eq!(
            set.to_string(),
            "[:safechain, [:callm, [:safecallm, :a, :b, [:args], nil], :c=, [:args, 1], nil]]"
        );
    }

    #[test]
    fn walk_is_preorder() {
        let mut ids = NodeIds::new();
        let inner = ids.node(Tag::Not, Span::default(), vec![Sexp::name("x")]);
        let outer = ids.node(Tag::Do, Span::default(), vec![inner, Sexp::Int(3)]);
        let mut seen = Vec::new();
        outer.walk(&mut |s| seen.push(s.to_string()));
        assert_eq!(seen, vec!["[:do, [:not, :x], 3]", "[:not, :x]", ":x", "3"]);
    }
}
