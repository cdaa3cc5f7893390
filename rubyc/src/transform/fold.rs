/// Integer constant folding.
///
/// `lit op lit` with integer literals on both sides is computed with the
/// compiler's own integer model, so results that leave the fixnum range
/// come out exactly as the runtime would produce them: a heap literal
/// (`BigInt`) or, after demotion, a plain `Int`.
use parser::{Sexp, Tag};

use crate::integer::Integer;

/// Exponents above this are left to the runtime.
const MAX_FOLDED_EXPONENT: i64 = 256;

pub fn fold(e: Sexp) -> Sexp {
    let Sexp::Node(node) = e else {
        return e;
    };
    let children: Vec<Sexp> = node.children.iter().cloned().map(fold).collect();
    let folded = node.rebuild(children);
    if node.tag != Tag::Callm {
        return folded;
    }
    try_fold(&folded).unwrap_or(folded)
}

fn literal(e: &Sexp) -> Option<Integer> {
    match e {
        Sexp::Int(n) => Some(Integer::from_i64(*n)),
        Sexp::BigInt(s) => Integer::parse(s),
        _ => None,
    }
}

fn to_sexp(value: Integer) -> Sexp {
    match value.to_i64() {
        Some(n) => Sexp::Int(n),
        None => Sexp::BigInt(value.to_string()),
    }
}

fn try_fold(call: &Sexp) -> Option<Sexp> {
    let node = call.as_node()?;
    if !node.child(3).is_nil() {
        return None;
    }
    let lhs = literal(node.child(0))?;
    let op = node.child(1).as_name()?;
    let args = node.child(2).children();
    if op == "-@" && args.is_empty() {
        return Some(to_sexp(-&lhs));
    }
    let [rhs] = args else {
        return None;
    };
    let rhs = literal(rhs)?;
    let out = match op {
        "+" => to_sexp(&lhs + &rhs),
        "-" => to_sexp(&lhs - &rhs),
        "*" => to_sexp(&lhs * &rhs),
        "**" => to_sexp(power(&lhs, rhs.to_i64()?)?),
        "<" => super::boolean(lhs < rhs),
        "<=" => super::boolean(lhs <= rhs),
        ">" => super::boolean(lhs > rhs),
        ">=" => super::boolean(lhs >= rhs),
        "==" => super::boolean(lhs == rhs),
        _ => return None,
    };
    log::trace!("folded {call} to {out}");
    Some(out)
}

fn power(base: &Integer, exponent: i64) -> Option<Integer> {
    if !(0..=MAX_FOLDED_EXPONENT).contains(&exponent) {
        return None;
    }
    let mut acc = Integer::from_i64(1);
    for _ in 0..exponent {
        acc = &acc * base;
    }
    Some(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folded(src: &str) -> String {
        let program = parser::parse(src).unwrap_or_else(|e| panic!("{e}"));
        fold(program.body).to_string()
    }

    #[test]
    fn small_arithmetic() {
        assert_eq!(folded("2 + 3 * 4"), "[:do, 14]");
        assert_eq!(folded("1 - 5"), "[:do, -4]");
    }

    #[test]
    fn crossing_the_fixnum_boundary_stays_exact() {
        assert_eq!(folded("1073741823 + 1"), "[:do, 1073741824]");
        assert_eq!(folded("1073741824 * -1"), "[:do, -1073741824]");
        assert_eq!(folded("1073741824 * -2"), "[:do, -2147483648]");
    }

    #[test]
    fn big_results_become_heap_literals() {
        assert_eq!(folded("2 ** 100"), "[:do, 1267650600228229401496703205376]");
        assert_eq!(
            folded("18446744073709551616 - 18446744073709551615"),
            "[:do, 1]"
        );
    }

    #[test]
    fn comparisons_fold_to_booleans() {
        assert_eq!(folded("1 < 2"), "[:do, :true]");
        assert_eq!(folded("3 == 4"), "[:do, :false]");
    }

    #[test]
    fn non_literals_are_left_alone() {
        assert_eq!(folded("x = 1\nx + 2"), "[:do, [:assign, :x, 1], [:callm, :x, :\"+\", [:args, 2], nil]]");
        assert_eq!(folded("7 / 2"), "[:do, [:callm, 7, :\"/\", [:args, 2], nil]]");
    }

    #[test]
    fn negative_exponents_are_not_folded() {
        assert!(folded("2 ** -1").contains(":\"**\""));
    }
}
