//! `${…}` expression evaluation for flow conditions, script tasks, and
//! conditional events.
//!
//! Expressions are parsed with nom into a small AST and evaluated against a
//! read-only variable map plus optional extra bindings (bindings win). No
//! side effects, no variable writes. Malformed input surfaces as
//! `ExpressionSyntax`, references to undefined variables or type mismatches
//! as `ExpressionRuntime`; both are fatal to the current element.

use crate::error::{EngineError, Result};
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde_json::{Map, Number, Value};

// ─── AST ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Variable reference with property/index segments: `order.items[0].sku`.
    Path(String, Vec<PathSeg>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PathSeg {
    Key(String),
    Index(Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

// ─── Public API ───────────────────────────────────────────────

/// Parse an expression, accepting either bare (`x > 10`) or delimited
/// (`${x > 10}`) form.
pub fn parse(input: &str) -> Result<Expr> {
    let trimmed = input.trim();
    let body = match trimmed.strip_prefix("${") {
        Some(rest) => rest.strip_suffix('}').ok_or_else(|| EngineError::ExpressionSyntax {
            expression: input.to_string(),
            detail: "unterminated `${`".to_string(),
        })?,
        None => trimmed,
    };
    match all_consuming(ws(expr))(body) {
        Ok((_, ast)) => Ok(ast),
        Err(e) => Err(EngineError::ExpressionSyntax {
            expression: input.to_string(),
            detail: e.to_string(),
        }),
    }
}

/// Evaluate an expression against a variable map plus optional extra
/// bindings; bindings shadow variables.
pub fn evaluate(
    expression: &str,
    vars: &Map<String, Value>,
    bindings: Option<&Map<String, Value>>,
) -> Result<Value> {
    let ast = parse(expression)?;
    eval(&ast, expression, vars, bindings)
}

/// Evaluate an expression that must yield a boolean.
pub fn evaluate_condition(
    expression: &str,
    vars: &Map<String, Value>,
    bindings: Option<&Map<String, Value>>,
) -> Result<bool> {
    match evaluate(expression, vars, bindings)? {
        Value::Bool(b) => Ok(b),
        other => Err(runtime(
            expression,
            format!("condition evaluated to non-boolean `{other}`"),
        )),
    }
}

// ─── Parser ───────────────────────────────────────────────────

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn expr(i: &str) -> IResult<&str, Expr> {
    ternary(i)
}

fn ternary(i: &str) -> IResult<&str, Expr> {
    let (i, cond) = or_expr(i)?;
    let (i, rest) = opt(tuple((
        ws(char('?')),
        expr,
        ws(char(':')),
        expr,
    )))(i)?;
    Ok(match rest {
        Some((_, then, _, otherwise)) => (
            i,
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
        ),
        None => (i, cond),
    })
}

fn fold_binary(
    init: Expr,
    rest: Vec<(BinOp, Expr)>,
) -> Expr {
    rest.into_iter().fold(init, |lhs, (op, rhs)| {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    })
}

fn or_expr(i: &str) -> IResult<&str, Expr> {
    let (i, init) = and_expr(i)?;
    let (i, rest) = many0(pair(value(BinOp::Or, ws(tag("||"))), and_expr))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn and_expr(i: &str) -> IResult<&str, Expr> {
    let (i, init) = equality(i)?;
    let (i, rest) = many0(pair(value(BinOp::And, ws(tag("&&"))), equality))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn equality(i: &str) -> IResult<&str, Expr> {
    let (i, init) = relational(i)?;
    let (i, rest) = many0(pair(
        ws(alt((
            value(BinOp::Eq, tag("==")),
            value(BinOp::Ne, tag("!=")),
        ))),
        relational,
    ))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn relational(i: &str) -> IResult<&str, Expr> {
    let (i, init) = additive(i)?;
    let (i, rest) = many0(pair(
        ws(alt((
            value(BinOp::Le, tag("<=")),
            value(BinOp::Ge, tag(">=")),
            value(BinOp::Lt, tag("<")),
            value(BinOp::Gt, tag(">")),
        ))),
        additive,
    ))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn additive(i: &str) -> IResult<&str, Expr> {
    let (i, init) = multiplicative(i)?;
    let (i, rest) = many0(pair(
        ws(alt((
            value(BinOp::Add, tag("+")),
            value(BinOp::Sub, tag("-")),
        ))),
        multiplicative,
    ))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn multiplicative(i: &str) -> IResult<&str, Expr> {
    let (i, init) = unary(i)?;
    let (i, rest) = many0(pair(
        ws(alt((
            value(BinOp::Mul, tag("*")),
            value(BinOp::Div, tag("/")),
            value(BinOp::Rem, tag("%")),
        ))),
        unary,
    ))(i)?;
    Ok((i, fold_binary(init, rest)))
}

fn unary(i: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| {
            Expr::Unary(UnaryOp::Not, Box::new(e))
        }),
        map(preceded(ws(char('-')), unary), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        primary,
    ))(i)
}

fn primary(i: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), ws(expr), char(')')),
        number,
        string_literal,
        path_or_keyword,
    )))(i)
}

fn ident(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(i)
}

fn path_or_keyword(i: &str) -> IResult<&str, Expr> {
    let (i, head) = ident(i)?;
    let (i, segs) = many0(alt((
        map(preceded(char('.'), ident), |k: &str| {
            PathSeg::Key(k.to_string())
        }),
        map(delimited(ws(char('[')), expr, ws(char(']'))), |e| {
            PathSeg::Index(Box::new(e))
        }),
    )))(i)?;
    if segs.is_empty() {
        match head {
            "true" => return Ok((i, Expr::Literal(Value::Bool(true)))),
            "false" => return Ok((i, Expr::Literal(Value::Bool(false)))),
            "null" => return Ok((i, Expr::Literal(Value::Null))),
            _ => {}
        }
    }
    Ok((i, Expr::Path(head.to_string(), segs)))
}

fn number(i: &str) -> IResult<&str, Expr> {
    let (rest, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(i)?;
    let lit = if text.contains('.') {
        let f: f64 = text.parse().map_err(|_| {
            nom::Err::Error(nom::error::Error::new(i, nom::error::ErrorKind::Float))
        })?;
        Value::Number(Number::from_f64(f).unwrap_or_else(|| Number::from(0)))
    } else {
        match text.parse::<i64>() {
            Ok(n) => Value::Number(Number::from(n)),
            Err(_) => {
                let f: f64 = text.parse().map_err(|_| {
                    nom::Err::Error(nom::error::Error::new(i, nom::error::ErrorKind::Digit))
                })?;
                Value::Number(Number::from_f64(f).unwrap_or_else(|| Number::from(0)))
            }
        }
    };
    Ok((rest, Expr::Literal(lit)))
}

fn string_literal(i: &str) -> IResult<&str, Expr> {
    let double = delimited(
        char('"'),
        opt(escaped_transform(
            none_of("\"\\"),
            '\\',
            alt((
                value("\"", char('"')),
                value("\\", char('\\')),
                value("\n", char('n')),
                value("\t", char('t')),
            )),
        )),
        char('"'),
    );
    let single = delimited(
        char('\''),
        opt(escaped_transform(
            none_of("'\\"),
            '\\',
            alt((
                value("'", char('\'')),
                value("\\", char('\\')),
                value("\n", char('n')),
                value("\t", char('t')),
            )),
        )),
        char('\''),
    );
    map(alt((double, single)), |s: Option<String>| {
        Expr::Literal(Value::String(s.unwrap_or_default()))
    })(i)
}

// ─── Evaluation ───────────────────────────────────────────────

fn runtime(expression: &str, detail: String) -> EngineError {
    EngineError::ExpressionRuntime {
        expression: expression.to_string(),
        detail,
    }
}

fn eval(
    ast: &Expr,
    source: &str,
    vars: &Map<String, Value>,
    bindings: Option<&Map<String, Value>>,
) -> Result<Value> {
    match ast {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(head, segs) => {
            let mut current = bindings
                .and_then(|b| b.get(head))
                .or_else(|| vars.get(head))
                .cloned()
                .ok_or_else(|| runtime(source, format!("undefined variable `{head}`")))?;
            for seg in segs {
                current = match seg {
                    PathSeg::Key(k) => match &current {
                        Value::Object(obj) => obj.get(k).cloned().ok_or_else(|| {
                            runtime(source, format!("undefined property `{k}`"))
                        })?,
                        other => {
                            return Err(runtime(
                                source,
                                format!("cannot access `{k}` on non-object `{other}`"),
                            ))
                        }
                    },
                    PathSeg::Index(idx_expr) => {
                        let idx = eval(idx_expr, source, vars, bindings)?;
                        match (&current, &idx) {
                            (Value::Array(items), Value::Number(n)) => {
                                let i = n.as_u64().ok_or_else(|| {
                                    runtime(source, format!("bad array index `{n}`"))
                                })? as usize;
                                items.get(i).cloned().ok_or_else(|| {
                                    runtime(source, format!("index {i} out of bounds"))
                                })?
                            }
                            (Value::Object(obj), Value::String(k)) => {
                                obj.get(k).cloned().ok_or_else(|| {
                                    runtime(source, format!("undefined property `{k}`"))
                                })?
                            }
                            (c, idx) => {
                                return Err(runtime(
                                    source,
                                    format!("cannot index `{c}` with `{idx}`"),
                                ))
                            }
                        }
                    }
                };
            }
            Ok(current)
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, source, vars, bindings)?;
            match (op, v) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Number(n)) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::Number(Number::from(-i)))
                    } else {
                        let f = n.as_f64().unwrap_or(0.0);
                        Ok(Value::Number(
                            Number::from_f64(-f).unwrap_or_else(|| Number::from(0)),
                        ))
                    }
                }
                (op, v) => Err(runtime(source, format!("cannot apply {op:?} to `{v}`"))),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit logical operators before evaluating the rhs.
            if matches!(op, BinOp::And | BinOp::Or) {
                let l = as_bool(eval(lhs, source, vars, bindings)?, source)?;
                return match (op, l) {
                    (BinOp::And, false) => Ok(Value::Bool(false)),
                    (BinOp::Or, true) => Ok(Value::Bool(true)),
                    _ => {
                        let r = as_bool(eval(rhs, source, vars, bindings)?, source)?;
                        Ok(Value::Bool(r))
                    }
                };
            }
            let l = eval(lhs, source, vars, bindings)?;
            let r = eval(rhs, source, vars, bindings)?;
            eval_binary(*op, l, r, source)
        }
        Expr::Ternary(cond, then, otherwise) => {
            let c = as_bool(eval(cond, source, vars, bindings)?, source)?;
            if c {
                eval(then, source, vars, bindings)
            } else {
                eval(otherwise, source, vars, bindings)
            }
        }
    }
}

fn as_bool(v: Value, source: &str) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(runtime(source, format!("expected boolean, got `{other}`"))),
    }
}

fn eval_binary(op: BinOp, l: Value, r: Value, source: &str) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(json_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!json_eq(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .unwrap_or(f64::NAN)
                    .partial_cmp(&b.as_f64().unwrap_or(f64::NAN)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                runtime(source, format!("cannot order `{l}` against `{r}`"))
            })?;
            let result = match op {
                BinOp::Lt => ord == std::cmp::Ordering::Less,
                BinOp::Le => ord != std::cmp::Ordering::Greater,
                BinOp::Gt => ord == std::cmp::Ordering::Greater,
                BinOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (&l, &r) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", as_str(&l), as_str(&r))))
            }
            _ => arith(op, l, r, source),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arith(op, l, r, source),
        BinOp::And | BinOp::Or => unreachable!("handled via short-circuit"),
    }
}

fn arith(op: BinOp, l: Value, r: Value, source: &str) -> Result<Value> {
    let (a, b) = match (&l, &r) {
        (Value::Number(a), Value::Number(b)) => (a.clone(), b.clone()),
        _ => {
            return Err(runtime(
                source,
                format!("arithmetic on non-numbers `{l}` and `{r}`"),
            ))
        }
    };
    if matches!(op, BinOp::Div | BinOp::Rem) && b.as_f64() == Some(0.0) {
        return Err(runtime(source, "division by zero".to_string()));
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Rem => Some(x % y),
            BinOp::Div if x % y == 0 => Some(x / y),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::Number(Number::from(n)));
        }
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let f = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Rem => x % y,
        _ => unreachable!(),
    };
    Ok(Value::Number(
        Number::from_f64(f).ok_or_else(|| runtime(source, "non-finite result".to_string()))?,
    ))
}

/// Equality with numeric coercion (1 == 1.0).
fn json_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => l == r,
    }
}

fn as_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn bare_and_delimited_forms_agree() {
        let env = vars(&[("x", json!(20))]);
        assert_eq!(evaluate_condition("x > 10", &env, None).unwrap(), true);
        assert_eq!(evaluate_condition("${x > 10}", &env, None).unwrap(), true);
    }

    #[test]
    fn literals() {
        let env = Map::new();
        assert_eq!(evaluate("42", &env, None).unwrap(), json!(42));
        assert_eq!(evaluate("3.5", &env, None).unwrap(), json!(3.5));
        assert_eq!(evaluate("'hi'", &env, None).unwrap(), json!("hi"));
        assert_eq!(evaluate("\"hi\"", &env, None).unwrap(), json!("hi"));
        assert_eq!(evaluate("true", &env, None).unwrap(), json!(true));
        assert_eq!(evaluate("null", &env, None).unwrap(), Value::Null);
    }

    #[test]
    fn path_navigation() {
        let env = vars(&[(
            "order",
            json!({"items": [{"sku": "A-1", "qty": 3}], "total": 40}),
        )]);
        assert_eq!(
            evaluate("order.items[0].sku", &env, None).unwrap(),
            json!("A-1")
        );
        assert_eq!(
            evaluate_condition("order.total >= 40 && order.items[0].qty < 5", &env, None).unwrap(),
            true
        );
    }

    #[test]
    fn undefined_variable_is_runtime_error() {
        let env = Map::new();
        let err = evaluate_condition("${x > 10}", &env, None).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionRuntime { .. }));
    }

    #[test]
    fn malformed_is_syntax_error() {
        let env = Map::new();
        let err = evaluate("${x >}", &env, None).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionSyntax { .. }));
        let err = evaluate("${x > 1", &env, None).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionSyntax { .. }));
    }

    #[test]
    fn bindings_shadow_variables() {
        let env = vars(&[("x", json!(1))]);
        let extra = vars(&[("x", json!(99))]);
        assert_eq!(evaluate("x", &env, Some(&extra)).unwrap(), json!(99));
    }

    #[test]
    fn arithmetic_and_precedence() {
        let env = vars(&[("a", json!(2)), ("b", json!(3))]);
        assert_eq!(evaluate("a + b * 4", &env, None).unwrap(), json!(14));
        assert_eq!(evaluate("(a + b) * 4", &env, None).unwrap(), json!(20));
        assert_eq!(evaluate("7 / 2", &env, None).unwrap(), json!(3.5));
        assert_eq!(evaluate("6 / 2", &env, None).unwrap(), json!(3));
        assert_eq!(evaluate("7 % 2", &env, None).unwrap(), json!(1));
        assert_eq!(evaluate("-a", &env, None).unwrap(), json!(-2));
    }

    #[test]
    fn string_concat_and_comparison() {
        let env = vars(&[("who", json!("world"))]);
        assert_eq!(
            evaluate("'hello ' + who", &env, None).unwrap(),
            json!("hello world")
        );
        assert_eq!(
            evaluate_condition("'abc' < 'abd'", &env, None).unwrap(),
            true
        );
    }

    #[test]
    fn numeric_coercion_in_equality() {
        let env = Map::new();
        assert_eq!(evaluate_condition("1 == 1.0", &env, None).unwrap(), true);
    }

    #[test]
    fn logical_short_circuit_skips_rhs() {
        // Rhs references an undefined variable; short-circuit must not touch it.
        let env = vars(&[("ready", json!(false))]);
        assert_eq!(
            evaluate_condition("ready && missing > 1", &env, None).unwrap(),
            false
        );
    }

    #[test]
    fn ternary() {
        let env = vars(&[("x", json!(5))]);
        assert_eq!(
            evaluate("x > 3 ? 'big' : 'small'", &env, None).unwrap(),
            json!("big")
        );
    }

    #[test]
    fn non_boolean_condition_rejected() {
        let env = vars(&[("x", json!(5))]);
        let err = evaluate_condition("x + 1", &env, None).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionRuntime { .. }));
    }

    #[test]
    fn division_by_zero() {
        let env = Map::new();
        let err = evaluate("1 / 0", &env, None).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionRuntime { .. }));
    }
}
