//! Datalog query over a snapshot.
//!
//! Supported shape:
//! ```text
//! [:find  ?a ?b | ?a . | [?a ...] | [?a ?b] | (pull ?e [..])
//!  :in    $ ?scalar [?coll ...] [?t1 ?t2]
//!  :where [?e :attr ?v ?tx] [(< ?v 10)] ...]
//! ```
//! Clauses run in written order as nested-loop joins. Entity ids and ref
//! values bind as `Long`, so `[?b :block/page ?p] [?p :block/name ?n]`
//! joins without coercion.

use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashMap};

use crate::datom::{Components, IndexKind};
use crate::db::Db;
use crate::edn::{self, Edn};
use crate::error::{CoreError, CoreResult};
use crate::pull::{self, PullPattern};
use crate::value::Value;

type Row = FxHashMap<String, Value>;

fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::InvalidQuery(msg.into())
}

#[derive(Debug, Clone, PartialEq)]
enum FindElem {
    Var(String),
    Pull(String, PullPattern),
}

#[derive(Debug, Clone, PartialEq)]
enum FindSpec {
    Relation(Vec<FindElem>),
    Scalar(FindElem),
    Collection(FindElem),
    Tuple(Vec<FindElem>),
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
    Source,
    Scalar(String),
    Collection(String),
    Tuple(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Var(String),
    Blank,
    Const(Value),
}

impl Term {
    fn parse(form: &Edn) -> CoreResult<Self> {
        if form.is_blank() {
            return Ok(Term::Blank);
        }
        if let Some(var) = form.as_variable() {
            return Ok(Term::Var(var.to_string()));
        }
        Ok(Term::Const(form.to_value()?))
    }

    /// Bound value under `row`, if any.
    fn value<'r>(&'r self, row: &'r Row) -> Option<&'r Value> {
        match self {
            Term::Var(v) => row.get(v),
            Term::Const(c) => Some(c),
            Term::Blank => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Pred {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "=" => Pred::Eq,
            "!=" | "not=" => Pred::Ne,
            "<" => Pred::Lt,
            "<=" => Pred::Le,
            ">" => Pred::Gt,
            ">=" => Pred::Ge,
            _ => return None,
        })
    }

    fn holds(self, x: &Value, y: &Value) -> bool {
        match self {
            Pred::Eq => x == y,
            Pred::Ne => x != y,
            Pred::Lt => x < y,
            Pred::Le => x <= y,
            Pred::Gt => x > y,
            Pred::Ge => x >= y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Pattern {
        e: Term,
        a: Term,
        v: Term,
        tx: Term,
    },
    Predicate {
        pred: Pred,
        args: Vec<Term>,
    },
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    find: FindSpec,
    inputs: Vec<Binding>,
    clauses: Vec<Clause>,
}

fn parse_find_elem(form: &Edn) -> CoreResult<FindElem> {
    if let Some(var) = form.as_variable() {
        return Ok(FindElem::Var(var.to_string()));
    }
    if let Edn::List(items) = form {
        if let [Edn::Symbol(head), var, pattern] = items.as_slice() {
            if head == "pull" {
                let var = var
                    .as_variable()
                    .ok_or_else(|| invalid("pull expects a variable"))?;
                return Ok(FindElem::Pull(var.to_string(), PullPattern::from_edn(pattern)?));
            }
        }
    }
    Err(invalid(format!("unsupported find element {form:?}")))
}

fn parse_find(forms: &[Edn]) -> CoreResult<FindSpec> {
    match forms {
        [elem, Edn::Symbol(dot)] if dot == "." => Ok(FindSpec::Scalar(parse_find_elem(elem)?)),
        [Edn::Vector(inner)] => match inner.as_slice() {
            [elem, Edn::Symbol(dots)] if dots == "..." => {
                Ok(FindSpec::Collection(parse_find_elem(elem)?))
            }
            elems => Ok(FindSpec::Tuple(
                elems.iter().map(parse_find_elem).collect::<CoreResult<_>>()?,
            )),
        },
        [] => Err(invalid(":find requires at least one element")),
        elems => Ok(FindSpec::Relation(
            elems.iter().map(parse_find_elem).collect::<CoreResult<_>>()?,
        )),
    }
}

fn parse_binding(form: &Edn) -> CoreResult<Binding> {
    match form {
        Edn::Symbol(s) if s.starts_with('$') => Ok(Binding::Source),
        Edn::Symbol(s) if s.starts_with('?') => Ok(Binding::Scalar(s.clone())),
        Edn::Vector(items) => match items.as_slice() {
            [var, Edn::Symbol(dots)] if dots == "..." => var
                .as_variable()
                .map(|v| Binding::Collection(v.to_string()))
                .ok_or_else(|| invalid("collection binding needs a variable")),
            vars => vars
                .iter()
                .map(|v| {
                    v.as_variable()
                        .map(str::to_string)
                        .ok_or_else(|| invalid("tuple binding needs variables"))
                })
                .collect::<CoreResult<Vec<_>>>()
                .map(Binding::Tuple),
        },
        other => Err(invalid(format!("unsupported :in binding {other:?}"))),
    }
}

fn parse_clause(form: &Edn) -> CoreResult<Clause> {
    let items = match form {
        Edn::Vector(items) => items.as_slice(),
        other => return Err(invalid(format!("clause must be a vector: {other:?}"))),
    };
    if let [Edn::List(call)] = items {
        let (head, args) = call
            .split_first()
            .ok_or_else(|| invalid("empty predicate"))?;
        let pred = head
            .as_symbol()
            .and_then(Pred::parse)
            .ok_or_else(|| invalid(format!("unsupported predicate {head:?}")))?;
        if args.len() != 2 {
            return Err(invalid("predicates take two arguments"));
        }
        return Ok(Clause::Predicate {
            pred,
            args: args.iter().map(Term::parse).collect::<CoreResult<_>>()?,
        });
    }
    let items = match items.split_first() {
        Some((Edn::Symbol(src), rest)) if src.starts_with('$') => rest,
        _ => items,
    };
    let term = |i: usize| items.get(i).map_or(Ok(Term::Blank), Term::parse);
    if items.is_empty() || items.len() > 4 {
        return Err(invalid(format!("bad data pattern {form:?}")));
    }
    Ok(Clause::Pattern {
        e: term(0)?,
        a: term(1)?,
        v: term(2)?,
        tx: term(3)?,
    })
}

impl Query {
    pub fn parse(text: &str) -> CoreResult<Self> {
        let form = edn::parse(text)?;
        let items = form
            .as_seq()
            .ok_or_else(|| invalid("query must be a vector"))?;

        let mut sections: HashMap<&str, Vec<Edn>> = HashMap::new();
        let mut current: Option<&str> = None;
        for item in items {
            match item.as_keyword() {
                Some(k @ ("find" | "in" | "where")) => {
                    current = Some(k);
                    sections.entry(k).or_default();
                }
                Some(other) => return Err(invalid(format!("unsupported query section :{other}"))),
                None => match current {
                    Some(k) => sections.entry(k).or_default().push(item.clone()),
                    None => return Err(invalid("query must start with :find")),
                },
            }
        }

        let find = parse_find(sections.get("find").map(Vec::as_slice).unwrap_or_default())?;
        let inputs = match sections.get("in") {
            Some(forms) => forms.iter().map(parse_binding).collect::<CoreResult<_>>()?,
            None => vec![Binding::Source],
        };
        let clauses = sections
            .get("where")
            .map(|forms| forms.iter().map(parse_clause).collect::<CoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(Query {
            find,
            inputs,
            clauses,
        })
    }

    fn bind_inputs(&self, inputs: &[Value]) -> CoreResult<Vec<Row>> {
        let expected = self.inputs.iter().filter(|b| **b != Binding::Source).count();
        if expected != inputs.len() {
            return Err(invalid(format!(
                "query expects {expected} inputs, got {}",
                inputs.len()
            )));
        }
        let mut rows = vec![Row::default()];
        let mut args = inputs.iter();
        for binding in &self.inputs {
            let arg = match binding {
                Binding::Source => continue,
                _ => args.next().ok_or_else(|| invalid("missing input"))?,
            };
            rows = match binding {
                Binding::Source => rows,
                Binding::Scalar(var) => rows
                    .into_iter()
                    .map(|mut r| {
                        r.insert(var.clone(), normalize(arg.clone()));
                        r
                    })
                    .collect(),
                Binding::Collection(var) => {
                    let items = arg
                        .as_vec()
                        .ok_or_else(|| invalid(format!("{var} expects a collection")))?;
                    let mut out = Vec::with_capacity(rows.len() * items.len());
                    for row in &rows {
                        for item in items {
                            let mut r = row.clone();
                            r.insert(var.clone(), normalize(item.clone()));
                            out.push(r);
                        }
                    }
                    out
                }
                Binding::Tuple(vars) => {
                    let items = arg
                        .as_vec()
                        .filter(|items| items.len() == vars.len())
                        .ok_or_else(|| invalid("tuple input arity mismatch"))?;
                    rows.into_iter()
                        .map(|mut r| {
                            for (var, item) in vars.iter().zip(items) {
                                r.insert(var.clone(), normalize(item.clone()));
                            }
                            r
                        })
                        .collect()
                }
            };
        }
        Ok(rows)
    }

    /// Evaluate against `db`.
    pub fn run(&self, db: &Db, inputs: &[Value]) -> CoreResult<Value> {
        let mut rows = self.bind_inputs(inputs)?;
        for clause in &self.clauses {
            rows = match clause {
                Clause::Pattern { e, a, v, tx } => match_pattern(db, &rows, e, a, v, tx)?,
                Clause::Predicate { pred, args } => filter_predicate(&rows, *pred, args)?,
            };
            if rows.is_empty() {
                break;
            }
        }
        self.project(db, rows)
    }

    fn project(&self, db: &Db, rows: Vec<Row>) -> CoreResult<Value> {
        let elems: &[FindElem] = match &self.find {
            FindSpec::Relation(elems) | FindSpec::Tuple(elems) => elems,
            FindSpec::Scalar(elem) | FindSpec::Collection(elem) => std::slice::from_ref(elem),
        };
        let mut tuples = BTreeSet::new();
        for row in &rows {
            let mut tuple = Vec::with_capacity(elems.len());
            for elem in elems {
                tuple.push(match elem {
                    FindElem::Var(var) => row
                        .get(var)
                        .cloned()
                        .ok_or_else(|| invalid(format!("{var} is not bound by :where")))?,
                    FindElem::Pull(var, pattern) => {
                        let e = row
                            .get(var)
                            .ok_or_else(|| invalid(format!("{var} is not bound by :where")))?;
                        pull::pull(db, pattern, e)?
                    }
                });
            }
            tuples.insert(tuple);
        }

        Ok(match &self.find {
            FindSpec::Relation(_) => Value::Vec(tuples.into_iter().map(Value::Vec).collect()),
            FindSpec::Tuple(_) => tuples.into_iter().next().map_or(Value::Nil, Value::Vec),
            FindSpec::Scalar(_) => tuples
                .into_iter()
                .next()
                .and_then(|mut t| t.pop())
                .unwrap_or(Value::Nil),
            FindSpec::Collection(_) => {
                Value::Vec(tuples.into_iter().filter_map(|mut t| t.pop()).collect())
            }
        })
    }
}

/// Parse and run `text` against `db`.
pub fn q(db: &Db, text: &str, inputs: &[Value]) -> CoreResult<Value> {
    Query::parse(text)?.run(db, inputs)
}

fn normalize(v: Value) -> Value {
    match v {
        Value::Ref(e) => Value::Long(e),
        other => other,
    }
}

/// Bind `term` to `value` in `row`, or check consistency if already bound.
fn unify(row: &mut Row, term: &Term, value: Value) -> bool {
    match term {
        Term::Blank => true,
        Term::Const(c) => normalize(c.clone()) == value,
        Term::Var(var) => match row.get(var) {
            Some(bound) => *bound == value,
            None => {
                row.insert(var.clone(), value);
                true
            }
        },
    }
}

fn match_pattern(db: &Db, rows: &[Row], e: &Term, a: &Term, v: &Term, tx: &Term) -> CoreResult<Vec<Row>> {
    let mut out = Vec::new();
    for row in rows {
        let mut comps = Components::default();
        if let Some(bound) = e.value(row) {
            comps.e = Some(
                bound
                    .as_entity_id()
                    .ok_or_else(|| invalid(format!("entity position bound to {bound}")))?,
            );
        }
        if let Some(bound) = a.value(row) {
            comps.a = Some(
                bound
                    .as_attr()
                    .ok_or_else(|| invalid(format!("attribute position bound to {bound}")))?
                    .to_string(),
            );
        }
        if comps.a.is_some() {
            comps.v = v.value(row).cloned();
        }
        let kind = match (&comps.e, &comps.a, &comps.v) {
            (Some(_), _, _) => IndexKind::Eavt,
            (None, Some(_), Some(_)) => IndexKind::Avet,
            (None, Some(_), None) => IndexKind::Aevt,
            (None, None, _) => IndexKind::Eavt,
        };
        for d in db.datoms(kind, &comps)? {
            let mut r = row.clone();
            if unify(&mut r, e, Value::Long(d.e))
                && (comps.a.is_some() || unify(&mut r, a, Value::Keyword(d.a.clone())))
                && unify(&mut r, v, normalize(d.v))
                && unify(&mut r, tx, Value::Long(d.tx))
            {
                out.push(r);
            }
        }
    }
    Ok(out)
}

fn filter_predicate(rows: &[Row], pred: Pred, args: &[Term]) -> CoreResult<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let resolve = |t: &Term| {
            t.value(row)
                .map(|v| normalize(v.clone()))
                .ok_or_else(|| invalid(format!("predicate argument {t:?} is unbound")))
        };
        let x = resolve(&args[0])?;
        let y = resolve(&args[1])?;
        if pred.holds(&x, &y) {
            out.push(row.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find_forms() {
        let q = Query::parse("[:find ?n . :where [_ :name ?n]]").unwrap();
        assert_eq!(q.find, FindSpec::Scalar(FindElem::Var("?n".into())));
        let q = Query::parse("[:find [?n ...] :where [_ :name ?n]]").unwrap();
        assert_eq!(q.find, FindSpec::Collection(FindElem::Var("?n".into())));
        let q = Query::parse("[:find ?e ?n :where [?e :name ?n]]").unwrap();
        assert!(matches!(q.find, FindSpec::Relation(ref v) if v.len() == 2));
        let q = Query::parse("[:find (pull ?e [*]) :where [?e :name _]]").unwrap();
        assert!(matches!(q.find, FindSpec::Relation(ref v) if matches!(v[0], FindElem::Pull(..))));
    }

    #[test]
    fn test_parse_inputs_and_clauses() {
        let q = Query::parse(
            "[:find ?e :in $ ?name [?tag ...] :where [$ ?e :name ?name] [(not= ?name \"x\")]]",
        )
        .unwrap();
        assert_eq!(
            q.inputs,
            vec![
                Binding::Source,
                Binding::Scalar("?name".into()),
                Binding::Collection("?tag".into()),
            ]
        );
        assert!(matches!(q.clauses[1], Clause::Predicate { pred: Pred::Ne, .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Query::parse("[:where [?e :a ?v]]").is_err());
        assert!(Query::parse("[:find ?e :with ?x]").is_err());
        assert!(Query::parse("[:find ?e :where [(like ?e 1)]]").is_err());
        assert!(Query::parse("{:find [?e]}").is_err());
    }

    #[test]
    fn test_bind_input_arity() {
        let q = Query::parse("[:find ?x :in $ ?x]").unwrap();
        assert!(q.bind_inputs(&[]).is_err());
        let rows = q.bind_inputs(&[Value::Ref(3)]).unwrap();
        assert_eq!(rows[0]["?x"], Value::Long(3));
    }
}
