use crate::gci::{ObjInfo, Oop};
use indexmap::IndexSet;

/// What a variables reference expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarRef {
    /// Arguments and temporaries of a stack level.
    FrameLocals(u32),
    /// Receiver of a frame, shown as a single `self` entry.
    Receiver(Oop),
    /// Named instance variables of an object.
    Named(Oop),
    /// Indexed slots of an object with their total count.
    Indexed { oop: Oop, size: i64 },
}

impl VarRef {
    /// Child reference of `oop`: indexed slots when there are any, named ones otherwise.
    ///
    /// Nil and special objects are never expandable.
    pub fn child_of(oop: Oop, info: Option<&ObjInfo>) -> Option<VarRef> {
        if oop.is_nil() || oop.is_special() {
            return None;
        }
        let info = info?;
        let indexed = info.indexed_oops();
        if indexed > 0 {
            Some(VarRef::Indexed { oop, size: indexed })
        } else if info.named_size > 0 {
            Some(VarRef::Named(oop))
        } else {
            None
        }
    }
}

/// Handles of variable references. Handles start at 1 and are never reused until
/// the registry is cleared, the same reference always gets the same handle.
#[derive(Default)]
pub struct VarRegistry {
    refs: IndexSet<VarRef>,
}

impl VarRegistry {
    pub fn alloc(&mut self, var_ref: VarRef) -> i64 {
        let (idx, _) = self.refs.insert_full(var_ref);
        idx as i64 + 1
    }

    pub fn get(&self, handle: i64) -> Option<VarRef> {
        if handle <= 0 {
            return None;
        }
        self.refs.get_index(handle as usize - 1).copied()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn clear(&mut self) {
        self.refs.clear()
    }
}

/// A variable as presented to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableView {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    /// 0 when the value is not expandable.
    pub reference: i64,
    pub named_variables: Option<i64>,
    pub indexed_variables: Option<i64>,
}

/// Paging of indexed slots, 0-based start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub count: Option<usize>,
}

impl Window {
    /// Clamp the window to `size` slots: `(start, count)`.
    pub fn clamp(&self, size: usize) -> (usize, usize) {
        let start = self.start.min(size);
        let count = self.count.unwrap_or(size).min(size - start);
        (start, count)
    }
}

/// A scope of a stack level.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeView {
    pub name: &'static str,
    pub reference: i64,
    pub named_variables: Option<i64>,
}
