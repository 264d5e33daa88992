use crate::query::SelectExpression;
use std::fmt;

///
/// SelectId
///
/// Handle of one `SelectExpression` in the compilation arena.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SelectId(usize);

impl fmt::Display for SelectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "select#{}", self.0)
    }
}

#[derive(Debug)]
enum Slot {
    Live(SelectExpression),
    Absorbed(SelectId),
}

///
/// SelectArena
///
/// Owner of every select built during one compilation. Absorbing a
/// select into another leaves a forwarding slot, so handles held by
/// shapers and scopes keep resolving to the live select.
///

#[derive(Debug, Default)]
pub struct SelectArena {
    slots: Vec<Slot>,
}

impl SelectArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, select: SelectExpression) -> SelectId {
        self.slots.push(Slot::Live(select));

        SelectId(self.slots.len() - 1)
    }

    /// Follow forwarding slots to the live select `id` was absorbed into.
    #[must_use]
    pub fn resolve(&self, id: SelectId) -> SelectId {
        let mut current = id;
        for _ in 0..=self.slots.len() {
            match self.slots.get(current.0) {
                Some(Slot::Absorbed(parent)) => current = *parent,
                _ => return current,
            }
        }

        current
    }

    #[must_use]
    pub fn is_live(&self, id: SelectId) -> bool {
        matches!(self.slots.get(id.0), Some(Slot::Live(_)))
    }

    #[must_use]
    pub fn get(&self, id: SelectId) -> Option<&SelectExpression> {
        match self.slots.get(self.resolve(id).0) {
            Some(Slot::Live(select)) => Some(select),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SelectId) -> Option<&mut SelectExpression> {
        let resolved = self.resolve(id);
        match self.slots.get_mut(resolved.0) {
            Some(Slot::Live(select)) => Some(select),
            _ => None,
        }
    }

    /// Move `child` out of the arena, forwarding its handle to `into`.
    /// Returns `None` when `child` is already absorbed or is `into` itself.
    pub fn absorb(&mut self, child: SelectId, into: SelectId) -> Option<SelectExpression> {
        let into = self.resolve(into);
        if child == into || !self.is_live(child) || !self.is_live(into) {
            return None;
        }

        match std::mem::replace(&mut self.slots[child.0], Slot::Absorbed(into)) {
            Slot::Live(select) => Some(select),
            Slot::Absorbed(_) => None,
        }
    }

    #[must_use]
    pub fn live_ids(&self) -> Vec<SelectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(i, _)| SelectId(i))
            .collect()
    }
}
