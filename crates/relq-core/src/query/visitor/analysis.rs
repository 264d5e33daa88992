//! Pre-passes over the query model: type-test rewriting, source typing,
//! and materialization analysis. They run once per compilation, before
//! any clause is visited.

use crate::{
    model::{Model, NavigationKind},
    query::{
        BodyClause, Expr, FromClause, JoinClause, Ordering, QueryModel, QuerySourceId,
        ResultOperator, context::QueryCompilationContext,
    },
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};

///
/// TYPE TESTS
///

/// Replace type tests against mapped entity types with discriminator
/// comparisons, in this model and every nested subquery.
pub(super) fn rewrite_type_tests(model: &Model, query: &QueryModel) -> QueryModel {
    map_model(query, &mut |expr| rewrite_type_tests_in(model, expr))
}

fn rewrite_type_tests_in(model: &Model, expr: &Expr) -> Expr {
    expr.rewrite(&mut |node| match node {
        Expr::SubQuery(inner) => Some(Expr::subquery(rewrite_type_tests(model, inner))),
        Expr::TypeIs(inner, entity_type) => {
            let inner = rewrite_type_tests_in(model, inner);
            Some(type_test(model, inner, entity_type))
        }
        _ => None,
    })
}

fn type_test(model: &Model, inner: Expr, entity_type: &str) -> Expr {
    let Some(ty) = model.entity(entity_type) else {
        return inner.type_is(entity_type);
    };

    let concrete = model.concrete_types(entity_type);
    if let [only] = concrete.as_slice()
        && only.base.is_none()
    {
        return Expr::constant(true);
    }

    let Some(discriminator) = ty.discriminator_property.as_deref() else {
        return inner.type_is(entity_type);
    };

    concrete
        .iter()
        .filter_map(|t| t.discriminator_value.clone())
        .map(|value| inner.clone().member(discriminator).equal(Expr::Constant(value)))
        .reduce(Expr::or)
        .unwrap_or(Expr::Constant(Value::Bool(false)))
}

/// Apply `f` to every top-level expression slot of `query`.
fn map_model(query: &QueryModel, f: &mut dyn FnMut(&Expr) -> Expr) -> QueryModel {
    fn map_from(from: &FromClause, f: &mut dyn FnMut(&Expr) -> Expr) -> FromClause {
        FromClause {
            id: from.id,
            item_name: from.item_name.clone(),
            source: f(&from.source),
        }
    }

    fn map_join(join: &JoinClause, f: &mut dyn FnMut(&Expr) -> Expr) -> JoinClause {
        JoinClause {
            id: join.id,
            item_name: join.item_name.clone(),
            inner: f(&join.inner),
            outer_key: f(&join.outer_key),
            inner_key: f(&join.inner_key),
        }
    }

    let main_from = map_from(&query.main_from, &mut *f);

    let mut body = Vec::with_capacity(query.body.len());
    for clause in &query.body {
        body.push(match clause {
            BodyClause::Where(predicate) => BodyClause::Where(f(predicate)),
            BodyClause::OrderBy(orderings) => {
                let mut mapped = Vec::with_capacity(orderings.len());
                for o in orderings {
                    mapped.push(Ordering {
                        expr: f(&o.expr),
                        direction: o.direction,
                    });
                }
                BodyClause::OrderBy(mapped)
            }
            BodyClause::AdditionalFrom(from) => BodyClause::AdditionalFrom(map_from(from, &mut *f)),
            BodyClause::Join(join) => BodyClause::Join(map_join(join, &mut *f)),
            BodyClause::GroupJoin(group) => {
                let mut group = group.clone();
                group.join = map_join(&group.join, &mut *f);
                BodyClause::GroupJoin(group)
            }
        });
    }

    let select = f(&query.select);

    let mut result_operators = Vec::with_capacity(query.result_operators.len());
    for op in &query.result_operators {
        result_operators.push(match op {
            ResultOperator::All(e) => ResultOperator::All(f(e)),
            ResultOperator::Contains(e) => ResultOperator::Contains(f(e)),
            ResultOperator::Take(e) => ResultOperator::Take(f(e)),
            ResultOperator::Skip(e) => ResultOperator::Skip(f(e)),
            ResultOperator::GroupBy { key, element } => ResultOperator::GroupBy {
                key: f(key),
                element: f(element),
            },
            other => other.clone(),
        });
    }

    QueryModel {
        main_from,
        body,
        select,
        result_operators,
    }
}

///
/// MODELS
///

// Every model of a compilation. `as_source` marks models used as a
// from or join source rather than inside an expression.
struct ModelRef<'a> {
    model: &'a QueryModel,
    as_source: bool,
}

fn gather_models(query: &QueryModel) -> Vec<ModelRef<'_>> {
    let mut out = Vec::new();
    gather(query, false, &mut out);

    out
}

fn gather<'a>(model: &'a QueryModel, as_source: bool, out: &mut Vec<ModelRef<'a>>) {
    out.push(ModelRef { model, as_source });

    source(&model.main_from.source, out);
    for clause in &model.body {
        match clause {
            BodyClause::Where(predicate) => nested(predicate, out),
            BodyClause::OrderBy(orderings) => orderings.iter().for_each(|o| nested(&o.expr, out)),
            BodyClause::AdditionalFrom(from) => source(&from.source, out),
            BodyClause::Join(join) => {
                source(&join.inner, out);
                nested(&join.outer_key, out);
                nested(&join.inner_key, out);
            }
            BodyClause::GroupJoin(group) => {
                source(&group.join.inner, out);
                nested(&group.join.outer_key, out);
                nested(&group.join.inner_key, out);
            }
        }
    }
    nested(&model.select, out);
    for op in &model.result_operators {
        match op {
            ResultOperator::All(e)
            | ResultOperator::Contains(e)
            | ResultOperator::Take(e)
            | ResultOperator::Skip(e) => nested(e, out),
            ResultOperator::GroupBy { key, element } => {
                nested(key, out);
                nested(element, out);
            }
            _ => {}
        }
    }
}

fn source<'a>(expr: &'a Expr, out: &mut Vec<ModelRef<'a>>) {
    match expr {
        Expr::SubQuery(inner) => gather(inner, true, out),
        other => nested(other, out),
    }
}

// Subqueries inside an expression, without entering them.
fn nested<'a>(expr: &'a Expr, out: &mut Vec<ModelRef<'a>>) {
    match expr {
        Expr::SubQuery(inner) => gather(inner, false, out),
        Expr::Constant(_)
        | Expr::Parameter(_)
        | Expr::EntitySet(_)
        | Expr::QuerySource(_)
        | Expr::Current => {}
        Expr::Member(inner, _) | Expr::Not(inner) | Expr::IsNull(inner) | Expr::TypeIs(inner, _) => {
            nested(inner, out);
        }
        Expr::Binary(_, l, r) => {
            nested(l, out);
            nested(r, out);
        }
        Expr::Conditional(t, a, b) => {
            nested(t, out);
            nested(a, out);
            nested(b, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| nested(a, out)),
        Expr::New(fields) => fields.iter().for_each(|(_, e)| nested(e, out)),
    }
}

// Every source clause of `model`: (id, source expression).
fn source_clauses(model: &QueryModel) -> Vec<(QuerySourceId, &Expr)> {
    let mut out = vec![(model.main_from.id, &model.main_from.source)];
    for clause in &model.body {
        match clause {
            BodyClause::AdditionalFrom(from) => out.push((from.id, &from.source)),
            BodyClause::Join(join) => out.push((join.id, &join.inner)),
            BodyClause::GroupJoin(group) => out.push((group.join.id, &group.join.inner)),
            BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
        }
    }

    out
}

// True when `model` yields its main source unchanged, one element per row.
fn is_identity(model: &QueryModel) -> bool {
    model.select == Expr::QuerySource(model.main_from.id)
        && model
            .result_operators
            .iter()
            .all(|op| !op.is_terminal() && !matches!(op, ResultOperator::GroupBy { .. }))
}

///
/// SOURCE TYPES
///

/// Record the entity type of every query source whose elements are
/// entities of a mapped type.
pub(super) fn collect_source_types(ctx: &mut QueryCompilationContext, query: &QueryModel) {
    let models = gather_models(query);
    let model = Arc::clone(ctx.model());

    // group id -> element id, for every group join
    let mut groups = BTreeMap::new();
    for m in &models {
        for clause in &m.model.body {
            if let BodyClause::GroupJoin(group) = clause {
                groups.insert(group.id, group.join.id);
            }
        }
    }

    loop {
        let mut changed = false;
        for m in &models {
            for (id, source) in source_clauses(m.model) {
                if ctx.source_type(id).is_some() {
                    continue;
                }
                let entity_type = match source {
                    Expr::EntitySet(entity_type) => Some(entity_type.clone()),
                    Expr::SubQuery(inner) if is_identity(inner) => {
                        ctx.source_type(inner.main_from.id).map(str::to_string)
                    }
                    Expr::QuerySource(group) => groups
                        .get(group)
                        .and_then(|element| ctx.source_type(*element))
                        .map(str::to_string),
                    Expr::Member(target, name) => match **target {
                        Expr::QuerySource(owner) => ctx
                            .source_type(owner)
                            .and_then(|ty| model.entity(ty))
                            .and_then(|ty| ty.navigation(name))
                            .filter(|nav| nav.kind == NavigationKind::Collection)
                            .map(|nav| nav.target.clone()),
                        _ => None,
                    },
                    _ => None,
                };

                if let Some(entity_type) = entity_type {
                    ctx.set_source_type(id, entity_type);
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }
}

///
/// MATERIALIZATION
///

/// Mark the sources whose rows must become entity instances. Everything
/// else is shaped as a raw buffer and read by ordinal.
pub(super) fn collect_materialization(ctx: &mut QueryCompilationContext, query: &QueryModel) {
    let models = gather_models(query);
    let model = Arc::clone(ctx.model());

    for m in &models {
        let query = m.model;
        let identity_source = m.as_source && is_identity(query) && !has_include(query);

        let scan = |expr: &Expr, ctx: &mut QueryCompilationContext| {
            scan_expr(expr, &model, ctx);
        };

        scan(&query.main_from.source, ctx);
        for clause in &query.body {
            match clause {
                BodyClause::Where(predicate) => scan(predicate, ctx),
                BodyClause::OrderBy(orderings) => orderings.iter().for_each(|o| scan(&o.expr, ctx)),
                BodyClause::AdditionalFrom(from) => scan(&from.source, ctx),
                BodyClause::Join(join) => {
                    scan(&join.inner, ctx);
                    scan(&join.outer_key, ctx);
                    scan(&join.inner_key, ctx);
                }
                BodyClause::GroupJoin(group) => {
                    scan(&group.join.inner, ctx);
                    scan(&group.join.outer_key, ctx);
                    scan(&group.join.inner_key, ctx);
                    ctx.mark_materialized(group.join.id);
                }
            }
        }
        if !identity_source {
            scan(&query.select, ctx);
        }
        for op in &query.result_operators {
            match op {
                ResultOperator::All(e)
                | ResultOperator::Contains(e)
                | ResultOperator::Take(e)
                | ResultOperator::Skip(e) => scan(e, ctx),
                ResultOperator::GroupBy { key, element } => {
                    scan(key, ctx);
                    scan(element, ctx);
                }
                _ => {}
            }
        }

        // Typed sources fed by client sequences carry entities already.
        for (id, source) in source_clauses(query) {
            if !matches!(source, Expr::EntitySet(_) | Expr::SubQuery(_))
                && ctx.source_type(id).is_some()
            {
                ctx.mark_materialized(id);
            }
        }
    }

    loop {
        let mut changed = false;
        for m in &models {
            for (id, source) in source_clauses(m.model) {
                if let Expr::SubQuery(inner) = source
                    && is_identity(inner)
                    && ctx.is_materialized(id)
                {
                    changed |= ctx.mark_materialized(inner.main_from.id);
                }
            }
        }

        if !changed {
            break;
        }
    }
}

fn has_include(query: &QueryModel) -> bool {
    query
        .result_operators
        .iter()
        .any(|op| matches!(op, ResultOperator::Include(_)))
}

// Whole-source references and non-column members need entities.
// Subquery bodies are scanned as models of their own.
fn scan_expr(expr: &Expr, model: &Model, ctx: &mut QueryCompilationContext) {
    match expr {
        Expr::QuerySource(source) => {
            ctx.mark_materialized(*source);
        }
        Expr::Member(target, name) => match **target {
            Expr::QuerySource(source) => {
                let is_column = ctx
                    .source_type(source)
                    .and_then(|ty| model.entity(ty))
                    .and_then(|ty| ty.property(name))
                    .is_some_and(|p| p.column().is_some());
                if !is_column {
                    ctx.mark_materialized(source);
                }
            }
            _ => scan_expr(target, model, ctx),
        },
        Expr::Constant(_)
        | Expr::Parameter(_)
        | Expr::EntitySet(_)
        | Expr::Current
        | Expr::SubQuery(_) => {}
        Expr::Not(inner) | Expr::IsNull(inner) | Expr::TypeIs(inner, _) => {
            scan_expr(inner, model, ctx);
        }
        Expr::Binary(_, l, r) => {
            scan_expr(l, model, ctx);
            scan_expr(r, model, ctx);
        }
        Expr::Conditional(t, a, b) => {
            scan_expr(t, model, ctx);
            scan_expr(a, model, ctx);
            scan_expr(b, model, ctx);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| scan_expr(a, model, ctx)),
        Expr::New(fields) => fields.iter().for_each(|(_, e)| scan_expr(e, model, ctx)),
    }
}
