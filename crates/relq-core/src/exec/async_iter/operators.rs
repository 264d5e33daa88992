use super::{AsyncEnv, AsyncOperator};
use crate::{
    error::InternalError,
    exec::{
        ExecutionError, QueryResult,
        context::{AsyncCursor, SavedParameters},
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
use async_trait::async_trait;
use std::collections::VecDeque;

/// Operator tree for `plan` in `env`. Nothing touches the provider until
/// the first pull.
pub(crate) fn open(env: &AsyncEnv, plan: &QueryPlan) -> Box<dyn AsyncOperator> {
    let verify = env.ctx.options().verify_row_ordering;
    let env = env.clone();

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
            input: open(&env, input),
            source: *source,
        }),
        QueryPlan::Where { input, predicate } => Box::new(WhereOp {
            input: open(&env, input),
            predicate: predicate.clone(),
            env,
        }),
        QueryPlan::Select { input, selector } => Box::new(SelectOp {
            input: open(&env, input),
            selector: selector.clone(),
            env,
        }),
        QueryPlan::OrderBy { input, orderings } => Box::new(OrderByOp {
            input: Some(open(&env, input)),
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
            outer: open(&env, outer),
            inner: Some(open(&env, inner)),
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
            outer: open(&env, outer),
            inner: Some(open(&env, inner)),
            outer_key: outer_key.clone(),
            inner_key: inner_key.clone(),
            element: *element,
            group: *group,
            lookup: JoinLookup::default(),
            env,
        }),
        QueryPlan::SelectMany { outer, inner } => Box::new(SelectManyOp {
            outer: open(&env, outer),
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
            input: open(&env, input),
            accumulator: GroupJoinAccumulator::new(*outer_width, *element, *group, verify),
            outer_key: outer_key.clone(),
            inner_key: inner_key.clone(),
            env,
        }),
        QueryPlan::StreamingGroupBy {
            input,
            key,
            element,
        } => Box::new(StreamingGroupByOp {
            input: open(&env, input),
            accumulator: GroupByAccumulator::new(verify),
            key: key.clone(),
            element: element.clone(),
            env,
        }),
        QueryPlan::Include { input, collections } => Box::new(IncludeOp {
            input: open(&env, input),
            collections: collections.clone(),
            loaders: None,
            env,
        }),
        QueryPlan::InjectParameters {
            input,
            names,
            values,
        } => Box::new(InjectParametersOp {
            input: open(&env, input),
            names: names.clone(),
            values: values.clone(),
            saved: None,
            started: false,
            env,
        }),
        QueryPlan::ResultOp { input, op } => open_result_op(env, input, op),
    }
}

fn open_result_op(env: AsyncEnv, input: &QueryPlan, op: &ClientOp) -> Box<dyn AsyncOperator> {
    let input = open(&env, input);

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

async fn drain(op: &mut dyn AsyncOperator) -> Result<Vec<QueryResult>, ExecutionError> {
    let mut items = Vec::new();
    while let Some(item) = op.pull().await? {
        items.push(item);
    }

    Ok(items)
}

///
/// ShapedOp
///

struct ShapedOp {
    env: AsyncEnv,
    shaped: ShapedQuery,
    cursor: Option<AsyncCursor>,
    started: bool,
}

#[async_trait]
impl AsyncOperator for ShapedOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        let row = if self.started {
            match &self.cursor {
                Some(cursor) => cursor.next_row(&self.env.cancel).await?,
                None => None,
            }
        } else {
            self.started = true;
            let command = self.shaped.command.clone().ok_or_else(|| {
                InternalError::executor_invariant(format!(
                    "{} has no command",
                    self.shaped.select
                ))
            })?;
            let cursor = self
                .env
                .ctx
                .open_cursor(&command, None, &self.env.cancel)
                .await?;
            let first = cursor.next_row(&self.env.cancel).await?;
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

struct SequenceOp {
    env: AsyncEnv,
    expr: ClientExpr,
    items: Option<VecDeque<QueryResult>>,
}

#[async_trait]
impl AsyncOperator for SequenceOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.items.is_none() {
            let value = self.env.eval_outer(&self.expr).await?;
            self.items = Some(sequence_items(value)?.into());
        }

        Ok(self.items.as_mut().and_then(VecDeque::pop_front))
    }
}

struct FromSequenceOp {
    input: Box<dyn AsyncOperator>,
    source: QuerySourceId,
}

#[async_trait]
impl AsyncOperator for FromSequenceOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        Ok(self.input.pull().await?.map(|item| bind_item(self.source, item)))
    }
}

struct WhereOp {
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
    predicate: ClientExpr,
}

#[async_trait]
impl AsyncOperator for WhereOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull().await? {
            if self.env.eval(&self.predicate, &item).await?.is_true() {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }
}

struct SelectOp {
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
    selector: ClientExpr,
}

#[async_trait]
impl AsyncOperator for SelectOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        match self.input.pull().await? {
            Some(item) => self.env.eval(&self.selector, &item).await.map(Some),
            None => Ok(None),
        }
    }
}

struct OrderByOp {
    env: AsyncEnv,
    input: Option<Box<dyn AsyncOperator>>,
    orderings: Vec<(ClientExpr, OrderDirection)>,
    sorted: Option<VecDeque<QueryResult>>,
}

#[async_trait]
impl AsyncOperator for OrderByOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut input) = self.input.take() {
            let mut keyed = Vec::new();
            for item in drain(input.as_mut()).await? {
                let mut keys = Vec::with_capacity(self.orderings.len());
                for (expr, _) in &self.orderings {
                    keys.push(self.env.eval(expr, &item).await?.as_key());
                }
                keyed.push((keys, item));
            }
            let directions: Vec<_> = self.orderings.iter().map(|(_, d)| *d).collect();
            self.sorted = Some(sort_by_keys(keyed, &directions));
        }

        Ok(self.sorted.as_mut().and_then(VecDeque::pop_front))
    }
}

struct JoinOp {
    env: AsyncEnv,
    outer: Box<dyn AsyncOperator>,
    inner: Option<Box<dyn AsyncOperator>>,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
    lookup: JoinLookup,
    pending: VecDeque<QueryResult>,
}

#[async_trait]
impl AsyncOperator for JoinOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Some(mut inner) = self.inner.take() {
            for item in drain(inner.as_mut()).await? {
                let key = self.env.eval(&self.inner_key, &item).await?.as_key();
                self.lookup.insert(key, item);
            }
        }

        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(outer) = self.outer.pull().await? else {
                return Ok(None);
            };

            let key = self.env.eval(&self.outer_key, &outer).await?.as_key();
            for inner in self.lookup.matches(&key) {
                self.pending.push_back(merge_rows(outer.clone(), inner)?);
            }
        }
    }
}

struct GroupJoinOp {
    env: AsyncEnv,
    outer: Box<dyn AsyncOperator>,
    inner: Option<Box<dyn AsyncOperator>>,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
    element: QuerySourceId,
    group: QuerySourceId,
    lookup: JoinLookup,
}

#[async_trait]
impl AsyncOperator for GroupJoinOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        self.env.ensure_not_cancelled()?;

        if let Some(mut inner) = self.inner.take() {
            for item in drain(inner.as_mut()).await? {
                let key = self.env.eval(&self.inner_key, &item).await?.as_key();
                self.lookup.insert(key, group_element(item, self.element));
            }
        }

        let Some(outer) = self.outer.pull().await? else {
            return Ok(None);
        };
        let key = self.env.eval(&self.outer_key, &outer).await?.as_key();
        let matches = self.lookup.matches(&key);

        merge_rows(outer, bind_item(self.group, QueryResult::Sequence(matches))).map(Some)
    }
}

struct SelectManyOp {
    env: AsyncEnv,
    outer: Box<dyn AsyncOperator>,
    inner_plan: QueryPlan,
    current: Option<(QueryResult, Box<dyn AsyncOperator>)>,
}

#[async_trait]
impl AsyncOperator for SelectManyOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        loop {
            if let Some((outer, inner)) = &mut self.current {
                if let Some(item) = inner.pull().await? {
                    return merge_rows(outer.clone(), item).map(Some);
                }
                self.current = None;
            }

            let Some(outer) = self.outer.pull().await? else {
                return Ok(None);
            };
            let env = self.env.with_parent(Some(self.env.scope(&outer)));
            let inner = open(&env, &self.inner_plan);
            self.current = Some((outer, inner));
        }
    }
}

struct StreamingGroupJoinOp {
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
    accumulator: GroupJoinAccumulator,
    outer_key: ClientExpr,
    inner_key: ClientExpr,
}

#[async_trait]
impl AsyncOperator for StreamingGroupJoinOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        self.env.ensure_not_cancelled()?;

        while let Some(item) = self.input.pull().await? {
            let outer_key = self.env.eval(&self.outer_key, &item).await?.as_key();
            let inner_key = self.env.eval(&self.inner_key, &item).await?.as_key();
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
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
    accumulator: GroupByAccumulator,
    key: ClientExpr,
    element: ClientExpr,
}

#[async_trait]
impl AsyncOperator for StreamingGroupByOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        self.env.ensure_not_cancelled()?;

        while let Some(item) = self.input.pull().await? {
            let key = self.env.eval(&self.key, &item).await?;
            let element = self.env.eval(&self.element, &item).await?;

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

struct IncludeOp {
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
    collections: Vec<CollectionInclude>,
    loaders: Option<Vec<CollectionLoader>>,
}

struct CollectionLoader {
    include: CollectionInclude,
    cursor: AsyncCursor,
    run: CollectionRun,
    last_principal: Option<Vec<Value>>,
}

impl IncludeOp {
    async fn open_loaders(&mut self) -> Result<Vec<CollectionLoader>, ExecutionError> {
        let verify = self.env.ctx.options().verify_row_ordering;
        let mut loaders = Vec::with_capacity(self.collections.len());

        for include in &self.collections {
            let command = include.command.clone().ok_or_else(|| {
                InternalError::executor_invariant(format!(
                    "Include({}) has no command",
                    include.navigation
                ))
            })?;
            let cursor = self
                .env
                .ctx
                .open_cursor(&command, Some(include.depth), &self.env.cancel)
                .await?;

            loaders.push(CollectionLoader {
                include: include.clone(),
                cursor,
                run: CollectionRun::new(include.foreign_ordinals.clone(), verify),
                last_principal: None,
            });
        }

        Ok(loaders)
    }
}

#[async_trait]
impl AsyncOperator for IncludeOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.loaders.is_none() {
            self.loaders = Some(self.open_loaders().await?);
        }
        let Some(item) = self.input.pull().await? else {
            self.loaders = Some(Vec::new());
            return Ok(None);
        };

        for loader in self.loaders.iter_mut().flatten() {
            loader.load(&self.env, &item).await?;
        }

        Ok(Some(item))
    }
}

impl CollectionLoader {
    async fn load(&mut self, env: &AsyncEnv, item: &QueryResult) -> Result<(), ExecutionError> {
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
                None => match self.cursor.next_row(&env.cancel).await? {
                    Some(row) => row,
                    None => break,
                },
            };
            let foreign = self.run.foreign_key(&row)?;
            if !CollectionRun::belongs_to(&foreign, &key) {
                self.run.lookahead = Some(row);
                break;
            }
            if let Some(entity) = materialize_entity(&env.host(), &row, &self.include.target_type)? {
                related.push(entity);
            }
        }
        self.run.served(&key);
        self.last_principal = Some(key);

        attach_collection(&env.host(), &principal, &self.include, related)
    }
}

///
/// InjectParametersOp
///

struct InjectParametersOp {
    env: AsyncEnv,
    input: Box<dyn AsyncOperator>,
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

#[async_trait]
impl AsyncOperator for InjectParametersOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if let Err(err) = self.env.ensure_not_cancelled() {
            self.restore();
            return Err(err);
        }

        if !self.started {
            self.started = true;
            let mut values = Vec::with_capacity(self.values.len());
            for expr in &self.values {
                values.push(self.env.eval_outer(expr).await?.as_key());
            }
            self.saved = Some(self.env.ctx.inject_parameters(&self.names, values));
        }

        match self.input.pull().await {
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
    env: AsyncEnv,
    input: Option<Box<dyn AsyncOperator>>,
    op: ClientOp,
}

#[async_trait]
impl AsyncOperator for ReduceOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        let Some(mut input) = self.input.take() else {
            return Ok(None);
        };

        let target = match &self.op {
            ClientOp::Contains(expr) => Some(self.env.eval_outer(expr).await?.as_key()),
            _ => None,
        };
        let mut reducer = Reducer::new(&self.op, target).ok_or_else(|| {
            InternalError::executor_invariant(format!("{} is not a reducing operator", self.op.name()))
        })?;

        while let Some(item) = input.pull().await? {
            let probe = match &self.op {
                ClientOp::All(predicate) => Some(self.env.eval(predicate, &item).await?),
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
    input: Box<dyn AsyncOperator>,
    distinct: Distinct,
}

#[async_trait]
impl AsyncOperator for DistinctOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        while let Some(item) = self.input.pull().await? {
            if self.distinct.admit(&item) {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }
}

struct WindowOp {
    env: AsyncEnv,
    input: Option<Box<dyn AsyncOperator>>,
    take: bool,
    count: ClientExpr,
    window: Option<Window>,
}

#[async_trait]
impl AsyncOperator for WindowOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.window.is_none() {
            let operation = if self.take { "Take" } else { "Skip" };
            let count = count_operand(operation, &self.env.eval_outer(&self.count).await?)?;
            self.window = Some(if self.take {
                Window::take(count)
            } else {
                Window::skip(count)
            });
        }

        loop {
            let Some(window) = self.window.as_mut() else {
                return Ok(None);
            };
            if window.is_closed() {
                self.input = None;
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            let Some(item) = input.pull().await? else {
                self.input = None;
                return Ok(None);
            };
            if self.window.as_mut().is_some_and(Window::admit) {
                return Ok(Some(item));
            }
        }
    }
}

struct DefaultIfEmptyOp {
    input: Box<dyn AsyncOperator>,
    seen: bool,
    done: bool,
}

#[async_trait]
impl AsyncOperator for DefaultIfEmptyOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.done {
            return Ok(None);
        }
        if let Some(item) = self.input.pull().await? {
            self.seen = true;
            return Ok(Some(item));
        }

        self.done = true;
        Ok((!self.seen).then_some(QueryResult::NULL))
    }
}

struct ClientGroupByOp {
    env: AsyncEnv,
    input: Option<Box<dyn AsyncOperator>>,
    key: ClientExpr,
    element: ClientExpr,
    groups: Option<VecDeque<QueryResult>>,
}

#[async_trait]
impl AsyncOperator for ClientGroupByOp {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        self.env.ensure_not_cancelled()?;

        if let Some(mut input) = self.input.take() {
            let mut groups = ClientGroups::default();
            while let Some(item) = input.pull().await? {
                let key = self.env.eval(&self.key, &item).await?;
                let element = self.env.eval(&self.element, &item).await?;
                groups.push(key, element);
            }
            self.groups = Some(groups.into_groupings());
        }

        Ok(self.groups.as_mut().and_then(VecDeque::pop_front))
    }
}
