use super::{Operator, SyncHost};
use crate::{
    error::InternalError,
    exec::{
        ExecutionError, QueryContext, QueryResult, Scope,
        context::{SavedParameters, SyncCursor},
        evaluate,
        ops::{
            ClientGroups, CollectionRun, Distinct, GroupByAccumulator, GroupJoinAccumulator,
            GroupJoinRow, JoinLookup, Reducer, Window, attach_collection, bind_item,
            count_operand, group_element, merge_rows, principal_of, sequence_items,
            sort_by_keys,
        },
    },
    query::{
        ClientExpr, ClientOp, OrderDirection, QueryPlan, QuerySourceId, ShapedQuery,
        plan::CollectionInclude, shaper::materialize_entity,
    },
    value::Value,
};
use std::{collections::VecDeque, sync::Arc};

/// Operator tree for `plan`. Nothing touches the provider until the first
/// pull.
pub(crate) fn open(
    ctx: &Arc<QueryContext>,
    plan: &QueryPlan,
    parent: Option<Arc<Scope>>,
) -> Box<dyn Operator> {
    let env = Env {
        ctx: Arc::clone(ctx),
        parent,
    };

    match plan {
        QueryPlan::Shaped(shaped) => Box::new(ShapedOp {
            env,
            shaped: shaped.clone(),
            cursor: None,
            started: false,
        }),
        QueryPlan::Sequence(expr) => Box::new(SequenceOp {
            env,
            expr: expr.clone(),
            items: None,
        }),
        QueryPlan::FromSequence { source, input } => Box::new(FromSequenceOp {
            input: env.open(input),
            source: *source,
        }),
        QueryPlan::Where { input, predicate } => Box::new(WhereOp {
            input: env.open(input),
            predicate: predicate.clone(),
            env,
        }),
        QueryPlan::Select { input, selector } => Box::new(SelectOp {
            input: env.open(input),
            selector: selector.clone(),
            env,
        }),
        QueryPlan::OrderBy { input, orderings } => Box::new(OrderByOp {
            input: Some(env.open(input)),
            orderings: orderings.clone(),
            sorted: None,
            env,
        }),
        QueryPlan::Join {
            outer,
            inner,
            outer_key,
            inner_key,
        } => Box::new(JoinOp {
            outer: env.open(outer),
            inner: Some(env.open(inner)),
            outer_key: outer_key.clone(),
            inner_key: inner_key.clone(),
            lookup: JoinLookup::default(),
            pending: VecDeque::new(),
            env,
        }),
        QueryPlan::GroupJoin {
            outer,
            inner,
            outer_key,
            inner_key,
            element,
            group,
        } => Box::new(GroupJoinOp {
            outer: env.open(outer),
            inner: Some(env.open(inner)),
            outer_key: outer_key.clone(),
            inner_key: inner_key.clone(),
            element: *element,
            group: *group,
            lookup: JoinLookup::default(),
            env,
        }),
        QueryPlan::SelectMany { outer, inner } => Box::new(SelectManyOp {
            outer: env.open(outer),
            inner_plan: (**inner).clone(),
            current: None,
            env,
        }),
        QueryPlan::StreamingGroupJoin {
            input,
            outer_width,
            element,
            group,
            outer_key,
            inner_key,
        } => Box::new(StreamingGroupJoinOp {
            input: env.open(input),
            accumulator: GroupJoinAccumulator::new(
                *outer_width,
                *element,
                *group,
                ctx.options().verify_row_ordering,
            ),
            outer_key: outer_key.clone(),
            inner_key: inner_key.clone(),
            env,
        }),
        QueryPlan::StreamingGroupBy {
            input,
            key,
            element,
        } => Box::new(StreamingGroupByOp {
            input: env.open(input),
            accumulator: GroupByAccumulator::new(ctx.options().verify_row_ordering),
            key: key.clone(),
            element: element.clone(),
            env,
        }),
        QueryPlan::Include { input, collections } => Box::new(IncludeOp {
            input: env.open(input),
            collections: collections.clone(),
            loaders: None,
            env,
        }),
        QueryPlan::InjectParameters {
            input,
            names,
            values,
        } => Box::new(InjectParametersOp {
            input: env.open(input),
            names: names.clone(),
            values: values.clone(),
            saved: None,
            started: false,
            env,
        }),
        QueryPlan::ResultOp { input, op } => open_result_op(env, input, op),
    }
}

fn open_result_op(env: Env, input: &QueryPlan, op: &ClientOp) -> Box<dyn Operator> {
    let input = env.open(input);

    match op {
        ClientOp::Distinct => Box::new(DistinctOp {
            input,
            distinct: Distinct::default(),
        }),
        ClientOp::Take(count) | ClientOp::Skip(count) => Box::new(WindowOp {
            input: Some(input),
            take: matches!(op, ClientOp::Take(_)),
            count: count.clone(),
            window: None,
            env,
        }),
        ClientOp::DefaultIfEmpty => Box::new(DefaultIfEmptyOp {
            input,
            seen: false,
            done: false,
        }),
        ClientOp::GroupBy { key, element } => Box::new(ClientGroupByOp {
            input: Some(input),
            key: key.clone(),
            element: element.clone(),
            groups: None,
            env,
        }),
        terminal => Box::new(ReduceOp {
            input: Some(input),
            op: terminal.clone(),
            env,
        }),
    }
}

///
/// Env
///
/// Context and outer scope shared by the operators of one plan.
///

struct Env {
    ctx: Arc<QueryContext>,
    parent: Option<Arc<Scope>>,
}

impl Env {
    const fn host(&self) -> SyncHost<'_> {
        SyncHost { ctx: &self.ctx }
    }

    fn open(&self, plan: &QueryPlan) -> Box<dyn Operator> {
        open(&self.ctx, plan, self.parent.clone())
    }

    fn scope(&self, item: &QueryResult) -> Arc<Scope> {
        Scope::for_item(item, self.parent.as_ref())
    }

    fn eval(&self, expr: &ClientExpr, item: &QueryResult) -> Result<QueryResult, ExecutionError> {
        evaluate(expr, &self.scope(item), &self.host())
    }

    fn eval_outer(&self, expr: &ClientExpr) -> Result<QueryResult, ExecutionError> {
        evaluate(expr, &Scope::root(self.parent.clone()), &self.host())
    }
}

/// Drain `op` into memory.
fn drain(op: &mut dyn Operator) -> Result<Vec<QueryResult>, ExecutionError> {
    let mut items = Vec::new();
    while let Some(item) = op.pull()? {
        items.push(item);
    }

    Ok(items)
}

///
/// ShapedOp
///

struct ShapedOp {
    env: Env,
    shaped: ShapedQuery,
    cursor: Option<SyncCursor>,
    started: bool,
}

impl Operator for ShapedOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        let row = if self.started {
            match &self.cursor {
                Some(cursor) => cursor.next_row()?,
                None => None,
            }
        } else {
            self.started = true;
            let command = self.shaped.command.as_deref().ok_or_else(|| {
                InternalError::executor_invariant(format!(
                    "{} has no command",
                    self.shaped.select
                ))
            })?;
            let cursor = self.env.ctx.open_cursor(command, None)?;
            let first = cursor.next_row()?;
            self.cursor = Some(cursor);

            first.filter(|row| !(self.shaped.default_if_empty && row.is_all_null()))
        };

        let Some(row) = row else {
            self.cursor = None;
            return Ok(None);
        };

        self.shaped
            .shaper
            .shape(&row, &self.env.host(), self.env.parent.as_ref())
            .map(Some)
    }
}

///
/// SequenceOp
///

struct SequenceOp {
    env: Env,
    expr: ClientExpr,
    items: Option<VecDeque<QueryResult>>,
}

impl Operator for SequenceOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.items.is_none() {
            let value = self.env.eval_outer(&self.expr)?;
            self.items = Some(sequence_items(value)?.into());
        }

        Ok(self.items.as_mut().and_then(VecDeque::pop_front))
    }
}

struct FromSequenceOp {
    input: Box<dyn Operator>,
    source: QuerySourceId,
}

impl Operator for FromSequenceOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        Ok(self.input.pull()?.map(|item| bind_item(self.source, item)))
    }
}

struct WhereOp {
    env: Env,
    input: Box<dyn Operator>,
    predicate: ClientExpr,
}

impl Operator for WhereOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull()? {
            if self.env.eval(&self.predicate, &item)?.is_true() {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }
}

struct SelectOp {
    env: Env,
    input: Box<dyn Operator>,
    selector: ClientExpr,
}

impl Operator for SelectOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        match self.input.pull()? {
            Some(item) => self.env.eval(&self.selector, &item).map(Some),
            None => Ok(None),
        }
    }
}

///
/// OrderByOp
///
/// Buffers the whole input on the first pull, then sorts stably.
///

struct OrderByOp {
    env: Env,
    input: Option<Box<dyn Operator>>,
    orderings: Vec<(ClientExpr, OrderDirection)>,
    sorted: Option<VecDeque<QueryResult>>,
}

impl Operator for OrderByOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut input) = self.input.take() {
            let mut keyed = Vec::new();
            for item in drain(input.as_mut())? {
                let keys = self
                    .orderings
                    .iter()
                    .map(|(expr, _)| self.env.eval(expr, &item).map(|k| k.as_key()))
                    .collect::<Result<Vec<Value>, _>>()?;
                keyed.push((keys, item));
            }
            let directions: Vec<_> = self.orderings.iter().map(|(_, d)| *d).collect();
            self.sorted = Some(sort_by_keys(keyed, &directions));
        }

        Ok(self.sorted.as_mut().and_then(VecDeque::pop_front))
    }
}

///
/// JoinOp
///
/// Hash join: the inner side is read in full before the first outer row.
///

struct JoinOp {
    env: Env,
    outer: Box<dyn Operator>,
    inner: Option<Box<dyn Operator>>,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
    lookup: JoinLookup,
    pending: VecDeque<QueryResult>,
}

impl Operator for JoinOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut inner) = self.inner.take() {
            for item in drain(inner.as_mut())? {
                let key = self.env.eval(&self.inner_key, &item)?.as_key();
                self.lookup.insert(key, item);
            }
        }

        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(outer) = self.outer.pull()? else {
                return Ok(None);
            };

            let key = self.env.eval(&self.outer_key, &outer)?.as_key();
            for inner in self.lookup.matches(&key) {
                self.pending.push_back(merge_rows(outer.clone(), inner)?);
            }
        }
    }
}

///
/// GroupJoinOp
///
/// Client group join: every outer row carries the sequence of matching
/// inner elements, possibly empty.
///

struct GroupJoinOp {
    env: Env,
    outer: Box<dyn Operator>,
    inner: Option<Box<dyn Operator>>,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
    element: QuerySourceId,
    group: QuerySourceId,
    lookup: JoinLookup,
}

impl Operator for GroupJoinOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut inner) = self.inner.take() {
            for item in drain(inner.as_mut())? {
                let key = self.env.eval(&self.inner_key, &item)?.as_key();
                self.lookup.insert(key, group_element(item, self.element));
            }
        }

        let Some(outer) = self.outer.pull()? else {
            return Ok(None);
        };
        let key = self.env.eval(&self.outer_key, &outer)?.as_key();
        let matches = self.lookup.matches(&key);

        merge_rows(outer, bind_item(self.group, QueryResult::Sequence(matches))).map(Some)
    }
}

///
/// SelectManyOp
///
/// Runs the inner plan once per outer row with that row in scope.
///

struct SelectManyOp {
    env: Env,
    outer: Box<dyn Operator>,
    inner_plan: QueryPlan,
    current: Option<(QueryResult, Box<dyn Operator>)>,
}

impl Operator for SelectManyOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        loop {
            if let Some((outer, inner)) = &mut self.current {
                if let Some(item) = inner.pull()? {
                    return merge_rows(outer.clone(), item).map(Some);
                }
                self.current = None;
            }

            let Some(outer) = self.outer.pull()? else {
                return Ok(None);
            };
            let scope = self.env.scope(&outer);
            let inner = open(&self.env.ctx, &self.inner_plan, Some(scope));
            self.current = Some((outer, inner));
        }
    }
}

struct StreamingGroupJoinOp {
    env: Env,
    input: Box<dyn Operator>,
    accumulator: GroupJoinAccumulator,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
}

impl Operator for StreamingGroupJoinOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull()? {
            let outer_key = self.env.eval(&self.outer_key, &item)?.as_key();
            let inner_key = self.env.eval(&self.inner_key, &item)?.as_key();
            let QueryResult::Row(row) = item else {
                return Err(InternalError::executor_invariant("GroupJoin input is not a row").into());
            };

            let pushed = self.accumulator.push(GroupJoinRow {
                row,
                outer_key,
                inner_key,
            })?;
            if pushed.is_some() {
                return Ok(pushed);
            }
        }

        Ok(self.accumulator.finish())
    }
}

struct StreamingGroupByOp {
    env: Env,
    input: Box<dyn Operator>,
    accumulator: GroupByAccumulator,
    key: ClientExpr,
    element: ClientExpr,
}

impl Operator for StreamingGroupByOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull()? {
            let key = self.env.eval(&self.key, &item)?;
            let element = self.env.eval(&self.element, &item)?;

            if let Some(group) = self.accumulator.push(key, element)? {
                return Ok(Some(group));
            }
        }

        Ok(self.accumulator.finish())
    }
}

///
/// IncludeOp
///
/// Collection loaders open before the first principal row is read; each
/// principal row then takes its run of secondary rows.
///

struct IncludeOp {
    env: Env,
    input: Box<dyn Operator>,
    collections: Vec<CollectionInclude>,
    loaders: Option<Vec<CollectionLoader>>,
}

struct CollectionLoader {
    include: CollectionInclude,
    cursor: SyncCursor,
    run: CollectionRun,
    last_principal: Option<Vec<Value>>,
}

impl IncludeOp {
    fn open_loaders(&self) -> Result<Vec<CollectionLoader>, ExecutionError> {
        let verify = self.env.ctx.options().verify_row_ordering;

        self.collections
            .iter()
            .map(|include| {
                let command = include.command.as_deref().ok_or_else(|| {
                    InternalError::executor_invariant(format!(
                        "Include({}) has no command",
                        include.navigation
                    ))
                })?;
                let cursor = self.env.ctx.open_cursor(command, Some(include.depth))?;

                Ok(CollectionLoader {
                    include: include.clone(),
                    cursor,
                    run: CollectionRun::new(include.foreign_ordinals.clone(), verify),
                    last_principal: None,
                })
            })
            .collect()
    }
}

impl Operator for IncludeOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.loaders.is_none() {
            self.loaders = Some(self.open_loaders()?);
        }
        let Some(item) = self.input.pull()? else {
            self.loaders = Some(Vec::new());
            return Ok(None);
        };

        let host = self.env.host();
        for loader in self.loaders.iter_mut().flatten() {
            loader.load(&host, &item)?;
        }

        Ok(Some(item))
    }
}

impl CollectionLoader {
    fn load(&mut self, host: &SyncHost<'_>, item: &QueryResult) -> Result<(), ExecutionError> {
        let Some(principal) = principal_of(item, &self.include) else {
            return Ok(());
        };
        let key: Vec<Value> = self
            .include
            .principal_key
            .iter()
            .map(|p| principal.get(p))
            .collect();
        if self.last_principal.as_ref() == Some(&key) {
            return Ok(());
        }

        let mut related = Vec::new();
        loop {
            let row = match self.run.lookahead.take() {
                Some(row) => row,
                None => match self.cursor.next_row()? {
                    Some(row) => row,
                    None => break,
                },
            };
            let foreign = self.run.foreign_key(&row)?;
            if !CollectionRun::belongs_to(&foreign, &key) {
                self.run.lookahead = Some(row);
                break;
            }
            if let Some(entity) = materialize_entity(host, &row, &self.include.target_type)? {
                related.push(entity);
            }
        }
        self.run.served(&key);
        self.last_principal = Some(key);

        attach_collection(host, &principal, &self.include, related)
    }
}

///
/// InjectParametersOp
///
/// Registers outer values as parameters on the first pull; the previous
/// values come back when the input ends, fails, or is dropped.
///

struct InjectParametersOp {
    env: Env,
    input: Box<dyn Operator>,
    names: Vec<String>,
    values: Vec<ClientExpr>,
    saved: Option<SavedParameters>,
    started: bool,
}

impl InjectParametersOp {
    fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.env.ctx.restore_parameters(saved);
        }
    }
}

impl Operator for InjectParametersOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if !self.started {
            self.started = true;
            let values = self
                .values
                .iter()
                .map(|expr| self.env.eval_outer(expr).map(|v| v.as_key()))
                .collect::<Result<Vec<_>, _>>()?;
            self.saved = Some(self.env.ctx.inject_parameters(&self.names, values));
        }

        match self.input.pull() {
            Ok(Some(item)) => Ok(Some(item)),
            other => {
                self.restore();
                other
            }
        }
    }
}

impl Drop for InjectParametersOp {
    fn drop(&mut self) {
        self.restore();
    }
}

///
/// RESULT OPERATORS
///

struct ReduceOp {
    env: Env,
    input: Option<Box<dyn Operator>>,
    op: ClientOp,
}

impl Operator for ReduceOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        let Some(mut input) = self.input.take() else {
            return Ok(None);
        };

        let target = match &self.op {
            ClientOp::Contains(expr) => Some(self.env.eval_outer(expr)?.as_key()),
            _ => None,
        };
        let mut reducer = Reducer::new(&self.op, target).ok_or_else(|| {
            InternalError::executor_invariant(format!("{} is not a reducing operator", self.op.name()))
        })?;

        while let Some(item) = input.pull()? {
            let probe = match &self.op {
                ClientOp::All(predicate) => Some(self.env.eval(predicate, &item)?),
                _ => None,
            };
            if reducer.push(item, probe.as_ref())? {
                break;
            }
        }
        drop(input);

        reducer.finish().map(Some)
    }
}

struct DistinctOp {
    input: Box<dyn Operator>,
    distinct: Distinct,
}

impl Operator for DistinctOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull()? {
            if self.distinct.admit(&item) {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }
}

struct WindowOp {
    env: Env,
    input: Option<Box<dyn Operator>>,
    take: bool,
    count: ClientExpr,
    window: Option<Window>,
}

impl Operator for WindowOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.window.is_none() {
            let operation = if self.take { "Take" } else { "Skip" };
            let count = count_operand(operation, &self.env.eval_outer(&self.count)?)?;
            self.window = Some(if self.take {
                Window::take(count)
            } else {
                Window::skip(count)
            });
        }
        let Some(window) = self.window.as_mut() else {
            return Ok(None);
        };

        loop {
            if window.is_closed() {
                self.input = None;
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            let Some(item) = input.pull()? else {
                self.input = None;
                return Ok(None);
            };
            if window.admit() {
                return Ok(Some(item));
            }
        }
    }
}

struct DefaultIfEmptyOp {
    input: Box<dyn Operator>,
    seen: bool,
    done: bool,
}

impl Operator for DefaultIfEmptyOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.done {
            return Ok(None);
        }
        if let Some(item) = self.input.pull()? {
            self.seen = true;
            return Ok(Some(item));
        }

        self.done = true;
        Ok((!self.seen).then_some(QueryResult::NULL))
    }
}

struct ClientGroupByOp {
    env: Env,
    input: Option<Box<dyn Operator>>,
    key: ClientExpr,
    element: ClientExpr,
    groups: Option<VecDeque<QueryResult>>,
}

impl Operator for ClientGroupByOp {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut input) = self.input.take() {
            let mut groups = ClientGroups::default();
            while let Some(item) = input.pull()? {
                let key = self.env.eval(&self.key, &item)?;
                let element = self.env.eval(&self.element, &item)?;
                groups.push(key, element);
            }
            self.groups = Some(groups.into_groupings());
        }

        Ok(self.groups.as_mut().and_then(VecDeque::pop_front))
    }
}
