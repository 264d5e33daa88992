//! Operator state shared by the sync and async families. Everything here
//! is pure: callers pull rows, evaluate expressions, and feed the results
//! in.

use crate::{
    error::InternalError,
    exec::{Bindings, EvalHost, ExecutionError, QueryResult, eval::client_eq},
    model::{EntityRef, NavigationValue},
    query::{ClientOp, OrderDirection, QuerySourceId, plan::CollectionInclude},
    value::{ArithmeticOp, OrderedValue, Value, canonical_cmp},
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, VecDeque},
};

/// Bind `item` to `source` in a fresh row.
#[must_use]
pub(crate) fn bind_item(source: QuerySourceId, item: QueryResult) -> QueryResult {
    let mut bindings = Bindings::default();
    bindings.bind(source, item);

    QueryResult::Row(bindings)
}

/// Combine an outer row with one inner row.
pub(crate) fn merge_rows(
    outer: QueryResult,
    inner: QueryResult,
) -> Result<QueryResult, ExecutionError> {
    match (outer, inner) {
        (QueryResult::Row(outer), QueryResult::Row(inner)) => Ok(QueryResult::Row(outer.merged(inner))),
        (outer, inner) => Err(InternalError::executor_invariant(format!(
            "cannot merge {:?} with {:?}; both sides must be rows",
            outer.as_key(),
            inner.as_key()
        ))
        .into()),
    }
}

/// Elements of a client value read as a sequence. Null is empty.
pub(crate) fn sequence_items(value: QueryResult) -> Result<Vec<QueryResult>, ExecutionError> {
    match value {
        QueryResult::Sequence(items) => Ok(items),
        QueryResult::Grouping { elements, .. } => Ok(elements),
        QueryResult::Value(Value::Null) => Ok(Vec::new()),
        QueryResult::Value(Value::List(values)) => {
            Ok(values.into_iter().map(QueryResult::Value).collect())
        }
        other => Err(ExecutionError::invalid_operand(
            "sequence",
            format!("{:?} is not a sequence", other.as_key()),
        )),
    }
}

/// Non-negative count operand of Take/Skip.
pub(crate) fn count_operand(operation: &str, value: &QueryResult) -> Result<usize, ExecutionError> {
    match value.as_value() {
        Some(Value::Int(n)) => Ok(usize::try_from(*n).unwrap_or(0)),
        _ => Err(ExecutionError::invalid_operand(
            operation,
            format!("expected an integer count, found {:?}", value.as_key()),
        )),
    }
}

fn keys_equal(left: &[Value], right: &[Value]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| client_eq(l, r))
}

fn describe(key: &Value) -> String {
    key.to_string()
}

/// The element an inner row contributes to its group.
pub(crate) fn group_element(item: QueryResult, element: QuerySourceId) -> QueryResult {
    match &item {
        QueryResult::Row(row) => row.get(element).cloned().unwrap_or(item),
        _ => item,
    }
}

/// Principal entity of an include item, if it materialized.
pub(crate) fn principal_of(
    item: &QueryResult,
    include: &CollectionInclude,
) -> Option<EntityRef> {
    match item {
        QueryResult::Row(row) => row.get(include.source)?.as_entity().cloned(),
        QueryResult::Entity(entity) => Some(entity.clone()),
        _ => None,
    }
}

pub(crate) fn attach_collection(
    host: &dyn EvalHost,
    principal: &EntityRef,
    include: &CollectionInclude,
    related: Vec<EntityRef>,
) -> Result<(), ExecutionError> {
    let model = host.model();
    let owner = principal.entity_type();
    let navigation = model
        .entity(&owner)
        .and_then(|ty| ty.navigation(&include.navigation))
        .ok_or_else(|| {
            InternalError::executor_invariant(format!(
                "entity type '{owner}' has no navigation '{}'",
                include.navigation
            ))
        })?;

    host.query_buffer().include(
        model,
        principal,
        navigation,
        NavigationValue::Collection(related),
    );

    Ok(())
}

///
/// RunTracker
///
/// Remembers keys whose run has ended so a reappearing key fails loudly.
/// Inert unless row-ordering verification is on.
///

#[derive(Debug)]
pub(crate) struct RunTracker {
    operator: &'static str,
    enabled: bool,
    finished: BTreeSet<OrderedValue>,
}

impl RunTracker {
    pub(crate) const fn new(operator: &'static str, enabled: bool) -> Self {
        Self {
            operator,
            enabled,
            finished: BTreeSet::new(),
        }
    }

    pub(crate) fn end_run(&mut self, key: &Value) {
        if self.enabled {
            self.finished.insert(OrderedValue(key.clone()));
        }
    }

    pub(crate) fn check(&self, key: &Value) -> Result<(), ExecutionError> {
        if self.enabled && self.finished.contains(&OrderedValue(key.clone())) {
            return Err(ExecutionError::OrderingViolation {
                operator: self.operator,
                key: describe(key),
            });
        }

        Ok(())
    }
}

///
/// GroupByAccumulator
///
/// Streaming GroupBy: consecutive equal keys form one group.
///

#[derive(Debug)]
pub(crate) struct GroupByAccumulator {
    current: Option<(QueryResult, Value, Vec<QueryResult>)>,
    tracker: RunTracker,
}

impl GroupByAccumulator {
    pub(crate) const fn new(verify: bool) -> Self {
        Self {
            current: None,
            tracker: RunTracker::new("GroupBy", verify),
        }
    }

    /// Feed one element; returns the finished group when the key changes.
    pub(crate) fn push(
        &mut self,
        key: QueryResult,
        element: QueryResult,
    ) -> Result<Option<QueryResult>, ExecutionError> {
        let key_value = key.as_key();

        if let Some((_, current, elements)) = &mut self.current
            && canonical_cmp(current, &key_value) == Ordering::Equal
        {
            elements.push(element);
            return Ok(None);
        }

        self.tracker.check(&key_value)?;
        let finished = self.finish();
        self.current = Some((key, key_value, vec![element]));

        Ok(finished)
    }

    /// The group still open, if any.
    pub(crate) fn finish(&mut self) -> Option<QueryResult> {
        let (key, key_value, elements) = self.current.take()?;
        self.tracker.end_run(&key_value);

        Some(QueryResult::Grouping {
            key: Box::new(key),
            elements,
        })
    }
}

///
/// GroupJoinRow
///
/// One LEFT JOINed row with its join keys already evaluated.
///

#[derive(Debug)]
pub(crate) struct GroupJoinRow {
    pub row: Bindings,
    pub outer_key: Value,
    pub inner_key: Value,
}

///
/// GroupJoinAccumulator
///
/// Streaming GroupJoin over rows ordered by the outer block: rows sharing
/// the outer columns collapse into one outer row carrying its matches.
///

#[derive(Debug)]
pub(crate) struct GroupJoinAccumulator {
    outer_width: usize,
    element: QuerySourceId,
    group: QuerySourceId,
    current: Option<(Bindings, Value, Vec<QueryResult>)>,
    tracker: RunTracker,
}

impl GroupJoinAccumulator {
    pub(crate) const fn new(
        outer_width: usize,
        element: QuerySourceId,
        group: QuerySourceId,
        verify: bool,
    ) -> Self {
        Self {
            outer_width,
            element,
            group,
            current: None,
            tracker: RunTracker::new("GroupJoin", verify),
        }
    }

    pub(crate) fn push(&mut self, row: GroupJoinRow) -> Result<Option<QueryResult>, ExecutionError> {
        let block = Value::List(
            row.row
                .buffer()
                .map(|b| b.prefix(self.outer_width))
                .unwrap_or_default(),
        );
        let matched = Self::matched_element(&row, self.element);

        if let Some((_, current, elements)) = &mut self.current
            && canonical_cmp(current, &block) == Ordering::Equal
        {
            elements.extend(matched);
            return Ok(None);
        }

        self.tracker.check(&block)?;
        let finished = self.finish();
        self.current = Some((row.row, block, matched.into_iter().collect()));

        Ok(finished)
    }

    pub(crate) fn finish(&mut self) -> Option<QueryResult> {
        let (mut bindings, block, elements) = self.current.take()?;
        self.tracker.end_run(&block);

        let _ = bindings.remove(self.element);
        bindings.bind(self.group, QueryResult::Sequence(elements));

        Some(QueryResult::Row(bindings))
    }

    // The inner element of a row, unless the LEFT JOIN found no match.
    fn matched_element(row: &GroupJoinRow, element: QuerySourceId) -> Option<QueryResult> {
        if row.inner_key.is_null() || !client_eq(&row.outer_key, &row.inner_key) {
            return None;
        }

        match row.row.get(element)? {
            QueryResult::Value(Value::Null) => None,
            QueryResult::Buffer(buffer) if buffer.is_all_null() => None,
            other => Some(other.clone()),
        }
    }
}

///
/// JoinLookup
///
/// Inner side of a client hash join, keyed by canonical key. Null keys
/// never match.
///

#[derive(Debug, Default)]
pub(crate) struct JoinLookup {
    entries: BTreeMap<OrderedValue, Vec<QueryResult>>,
}

impl JoinLookup {
    pub(crate) fn insert(&mut self, key: Value, item: QueryResult) {
        if key.is_null() {
            return;
        }
        self.entries.entry(OrderedValue(key)).or_default().push(item);
    }

    #[must_use]
    pub(crate) fn matches(&self, key: &Value) -> Vec<QueryResult> {
        if key.is_null() {
            return Vec::new();
        }

        self.entries
            .get(&OrderedValue(key.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Stable sort of `items` by their pre-evaluated keys.
#[must_use]
pub(crate) fn sort_by_keys(
    mut items: Vec<(Vec<Value>, QueryResult)>,
    directions: &[OrderDirection],
) -> VecDeque<QueryResult> {
    items.sort_by(|(a, _), (b, _)| {
        for ((l, r), direction) in a.iter().zip(b).zip(directions) {
            let ordering = canonical_cmp(l, r);
            let ordering = match direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    items.into_iter().map(|(_, item)| item).collect()
}

///
/// ClientGroups
///
/// Client GroupBy over unordered input; groups keep first-seen order.
///

#[derive(Debug, Default)]
pub(crate) struct ClientGroups {
    index: BTreeMap<OrderedValue, usize>,
    groups: Vec<(QueryResult, Vec<QueryResult>)>,
}

impl ClientGroups {
    pub(crate) fn push(&mut self, key: QueryResult, element: QueryResult) {
        let ordered = OrderedValue(key.as_key());
        match self.index.get(&ordered) {
            Some(&i) => self.groups[i].1.push(element),
            None => {
                self.index.insert(ordered, self.groups.len());
                self.groups.push((key, vec![element]));
            }
        }
    }

    #[must_use]
    pub(crate) fn into_groupings(self) -> VecDeque<QueryResult> {
        self.groups
            .into_iter()
            .map(|(key, elements)| QueryResult::Grouping {
                key: Box::new(key),
                elements,
            })
            .collect()
    }
}

///
/// Distinct
///

#[derive(Debug, Default)]
pub(crate) struct Distinct {
    seen: BTreeSet<OrderedValue>,
}

impl Distinct {
    /// True the first time an equal item is offered.
    pub(crate) fn admit(&mut self, item: &QueryResult) -> bool {
        self.seen.insert(OrderedValue(item.as_key()))
    }
}

///
/// Window
///
/// Client Skip/Take.
///

#[derive(Debug)]
pub(crate) struct Window {
    skip: usize,
    take: Option<usize>,
}

impl Window {
    pub(crate) const fn skip(count: usize) -> Self {
        Self {
            skip: count,
            take: None,
        }
    }

    pub(crate) const fn take(count: usize) -> Self {
        Self {
            skip: 0,
            take: Some(count),
        }
    }

    /// True once no further item can pass.
    #[must_use]
    pub(crate) fn is_closed(&self) -> bool {
        self.take == Some(0)
    }

    pub(crate) fn admit(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        match &mut self.take {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

///
/// Reducer
///
/// Terminal client operator folding a sequence into one value.
///

#[derive(Debug)]
pub(crate) struct Reducer {
    kind: ReduceKind,
    count: u64,
    item: Option<QueryResult>,
    accumulator: Option<Value>,
    verdict: bool,
}

#[derive(Debug)]
enum ReduceKind {
    First { or_default: bool },
    Single { or_default: bool },
    Last { or_default: bool },
    Count,
    Any,
    All,
    Contains(Value),
    Min,
    Max,
    Sum,
    Average,
}

impl Reducer {
    /// Reducer for a terminal operator. `target` is the evaluated operand
    /// of `Contains`.
    #[must_use]
    pub(crate) fn new(op: &ClientOp, target: Option<Value>) -> Option<Self> {
        let kind = match op {
            ClientOp::First { or_default } => ReduceKind::First {
                or_default: *or_default,
            },
            ClientOp::Single { or_default } => ReduceKind::Single {
                or_default: *or_default,
            },
            ClientOp::Last { or_default } => ReduceKind::Last {
                or_default: *or_default,
            },
            ClientOp::Count | ClientOp::LongCount => ReduceKind::Count,
            ClientOp::Any => ReduceKind::Any,
            ClientOp::All(_) => ReduceKind::All,
            ClientOp::Contains(_) => ReduceKind::Contains(target.unwrap_or_default()),
            ClientOp::Min => ReduceKind::Min,
            ClientOp::Max => ReduceKind::Max,
            ClientOp::Sum => ReduceKind::Sum,
            ClientOp::Average => ReduceKind::Average,
            ClientOp::Distinct
            | ClientOp::Take(_)
            | ClientOp::Skip(_)
            | ClientOp::DefaultIfEmpty
            | ClientOp::GroupBy { .. } => return None,
        };
        let verdict = matches!(kind, ReduceKind::All);

        Some(Self {
            kind,
            count: 0,
            item: None,
            accumulator: None,
            verdict,
        })
    }

    /// Feed one item; `probe` is the evaluated predicate of `All`.
    /// Returns true once the result is decided.
    pub(crate) fn push(
        &mut self,
        item: QueryResult,
        probe: Option<&QueryResult>,
    ) -> Result<bool, ExecutionError> {
        self.count += 1;

        match &self.kind {
            ReduceKind::First { .. } => {
                self.item = Some(item);
                Ok(true)
            }
            ReduceKind::Single { .. } => {
                if self.count > 1 {
                    return Err(ExecutionError::MoreThanOneElement);
                }
                self.item = Some(item);
                Ok(false)
            }
            ReduceKind::Last { .. } => {
                self.item = Some(item);
                Ok(false)
            }
            ReduceKind::Count => Ok(false),
            ReduceKind::Any => {
                self.verdict = true;
                Ok(true)
            }
            ReduceKind::All => {
                if probe.is_some_and(QueryResult::is_true) {
                    return Ok(false);
                }
                self.verdict = false;
                Ok(true)
            }
            ReduceKind::Contains(target) => {
                if client_eq(&item.as_key(), target) {
                    self.verdict = true;
                    return Ok(true);
                }
                Ok(false)
            }
            ReduceKind::Min | ReduceKind::Max => {
                let value = item.as_key();
                if value.is_null() {
                    return Ok(false);
                }
                let keep_new = self.accumulator.as_ref().is_none_or(|current| {
                    let ordering = canonical_cmp(&value, current);
                    if matches!(self.kind, ReduceKind::Min) {
                        ordering == Ordering::Less
                    } else {
                        ordering == Ordering::Greater
                    }
                });
                if keep_new {
                    self.accumulator = Some(value);
                }
                Ok(false)
            }
            ReduceKind::Sum | ReduceKind::Average => {
                let value = item.as_key();
                if value.is_null() {
                    self.count -= 1;
                    return Ok(false);
                }
                let sum = match self.accumulator.take() {
                    None => value,
                    Some(sum) => sum.arithmetic(ArithmeticOp::Add, &value).ok_or_else(|| {
                        ExecutionError::invalid_operand("Sum", format!("{sum} and {value}"))
                    })?,
                };
                self.accumulator = Some(sum);
                Ok(false)
            }
        }
    }

    pub(crate) fn finish(self) -> Result<QueryResult, ExecutionError> {
        match self.kind {
            ReduceKind::First { or_default }
            | ReduceKind::Single { or_default }
            | ReduceKind::Last { or_default } => match self.item {
                Some(item) => Ok(item),
                None if or_default => Ok(QueryResult::NULL),
                None => Err(ExecutionError::EmptySequence),
            },
            ReduceKind::Count => Ok(Value::Int(i64::try_from(self.count).unwrap_or(i64::MAX)).into()),
            ReduceKind::Any | ReduceKind::All | ReduceKind::Contains(_) => {
                Ok(Value::Bool(self.verdict).into())
            }
            ReduceKind::Min | ReduceKind::Max => {
                Ok(self.accumulator.map_or(QueryResult::NULL, QueryResult::Value))
            }
            ReduceKind::Sum => Ok(self.accumulator.unwrap_or(Value::Int(0)).into()),
            ReduceKind::Average => {
                let Some(sum) = self.accumulator.and_then(|s| s.as_f64()) else {
                    return Ok(QueryResult::NULL);
                };
                #[expect(clippy::cast_precision_loss)]
                let count = self.count as f64;

                Ok(Value::Float(sum / count).into())
            }
        }
    }
}

///
/// CollectionRun
///
/// Cursor-side state of one collection include: the row read past the
/// current principal and the principal keys already served.
///

#[derive(Debug)]
pub(crate) struct CollectionRun {
    pub lookahead: Option<crate::query::ValueBuffer>,
    foreign_ordinals: Vec<usize>,
    tracker: RunTracker,
}

impl CollectionRun {
    pub(crate) fn new(foreign_ordinals: Vec<usize>, verify: bool) -> Self {
        Self {
            lookahead: None,
            foreign_ordinals,
            tracker: RunTracker::new("Include", verify),
        }
    }

    /// Foreign key of a secondary row; errors if its principal was
    /// already served.
    pub(crate) fn foreign_key(
        &self,
        row: &crate::query::ValueBuffer,
    ) -> Result<Vec<Value>, ExecutionError> {
        let key: Vec<Value> = self
            .foreign_ordinals
            .iter()
            .map(|i| row.get(*i).clone())
            .collect();
        self.tracker.check(&Value::List(key.clone()))?;

        Ok(key)
    }

    #[must_use]
    pub(crate) fn belongs_to(foreign_key: &[Value], principal_key: &[Value]) -> bool {
        keys_equal(foreign_key, principal_key)
    }

    pub(crate) fn served(&mut self, principal_key: &[Value]) {
        self.tracker.end_run(&Value::List(principal_key.to_vec()));
    }
}
