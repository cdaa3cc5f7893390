/// `yield` and `block_given?`.
///
/// Both refer to the block of the enclosing method: its `&name`
/// parameter, or the implicit `__closure__` otherwise. Blocks and lambdas
/// do not change which method is enclosing, so a `yield` inside a nested
/// block reads the method's block through the environment like any other
/// captured variable. A lambda's own implicit block parameter is named
/// `__lblock__` so it never shadows the method's.
use parser::{Node, NodeIds, Sexp, Tag};

use super::{Build, boolean, map_children};
use crate::error::{CompileError, Result};

pub const METHOD_BLOCK: &str = "__closure__";
pub const LAMBDA_BLOCK: &str = "__lblock__";

pub fn rewrite(body: Sexp, ids: &mut NodeIds) -> Result<Sexp> {
    Yields { ids, block: None }.expr(body)
}

/// Name of the block parameter declared by `params`, if any.
pub fn block_param(params: &Sexp) -> Option<&str> {
    params
        .children()
        .iter()
        .find(|p| p.is(Tag::BlockArg))
        .and_then(|p| p.children().first())
        .and_then(Sexp::as_name)
}

struct Yields<'a> {
    ids: &'a mut NodeIds,
    /// Block variable of the enclosing method; `None` outside methods.
    block: Option<String>,
}

impl Yields<'_> {
    fn expr(&mut self, e: Sexp) -> Result<Sexp> {
        let Sexp::Node(node) = e else {
            return Ok(e);
        };
        match node.tag {
            Tag::Defm | Tag::Defs => {
                let params = if node.tag == Tag::Defm { node.child(1) } else { node.child(2) };
                let name = block_param(params).unwrap_or(METHOD_BLOCK).to_string();
                self.scoped(node, Some(name))
            }
            Tag::Class | Tag::Module | Tag::SClass => self.scoped(node, None),
            Tag::Yield => {
                let Some(block) = self.block.clone() else {
                    return Err(CompileError::transform(
                        "yield called outside of a method",
                        Some(node.span),
                    ));
                };
                let args = self.expr(node.child(0).clone())?;
                Ok(self.ids.node(
                    Tag::Callm,
                    node.span,
                    vec![Sexp::Name(block), Sexp::name("call"), args, Sexp::Nil],
                ))
            }
            Tag::Call if is_block_given(&node) => match &self.block {
                Some(block) => Ok(self.ids.if_(
                    node.span,
                    Sexp::name(block.as_str()),
                    boolean(true),
                    boolean(false),
                )),
                None => Ok(boolean(false)),
            },
            _ => map_children(node, |c| self.expr(c)),
        }
    }

    fn scoped(&mut self, node: Node, block: Option<String>) -> Result<Sexp> {
        let saved = std::mem::replace(&mut self.block, block);
        let out = map_children(node, |c| self.expr(c));
        self.block = saved;
        out
    }
}

fn is_block_given(node: &Node) -> bool {
    matches!(node.child(0).as_name(), Some("block_given?" | "iterator?"))
        && node.child(1).children().is_empty()
        && node.child(2).is_nil()
}
