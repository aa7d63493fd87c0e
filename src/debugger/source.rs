use crate::debugger::breakpoint::{build_line_offsets, line_of_offset};
use crate::gci::{GciError, Oop};
use crate::query::QueryFacade;
use indexmap::IndexSet;
use std::collections::HashMap;

/// Source text of a compiled method with its offset tables.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSource {
    pub text: String,
    pub line_offsets: Vec<usize>,
    /// 0-based offset of every step point, step point `n` at index `n - 1`.
    pub step_offsets: Vec<usize>,
}

impl MethodSource {
    pub fn new(text: String, step_offsets: Vec<usize>) -> Self {
        Self {
            line_offsets: build_line_offsets(&text),
            text,
            step_offsets,
        }
    }

    /// Fetch source and step point offsets of `method`.
    pub fn fetch(query: &QueryFacade, method: Oop) -> Result<Self, GciError> {
        let text = query.perform(method, "sourceString", &[])?;
        let text = query.fetch_string(text)?;
        let offsets = query.perform(method, "_sourceOffsets", &[])?;
        // the VM answers 1-based offsets
        let step_offsets = query
            .fetch_all_oops(offsets)?
            .into_iter()
            .map(|oop| QueryFacade::expect_int(oop).map(|o| (o - 1).max(0) as usize))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(text, step_offsets))
    }

    pub fn line_count(&self) -> usize {
        self.line_offsets.len() - 1
    }

    /// Line of a 1-based step point, 1 when unknown.
    pub fn line_of_step_point(&self, step_point: i64) -> u32 {
        if step_point <= 0 {
            return 1;
        }
        self.step_offsets
            .get(step_point as usize - 1)
            .map(|&offset| line_of_offset(offset, &self.line_offsets))
            .unwrap_or(1)
    }
}

/// Source references of one debug attach, one per method.
#[derive(Default)]
pub struct SourceRegistry {
    methods: IndexSet<Oop>,
    sources: HashMap<Oop, MethodSource>,
}

impl SourceRegistry {
    /// Reference of `method`, the same one for every request.
    pub fn reference(&mut self, method: Oop) -> i64 {
        let (idx, _) = self.methods.insert_full(method);
        idx as i64 + 1
    }

    pub fn method(&self, reference: i64) -> Option<Oop> {
        if reference <= 0 {
            return None;
        }
        self.methods.get_index(reference as usize - 1).copied()
    }

    /// Cached source of `method`, fetched on first use.
    pub fn source(&mut self, query: &QueryFacade, method: Oop) -> Result<&MethodSource, GciError> {
        if !self.sources.contains_key(&method) {
            let source = MethodSource::fetch(query, method)?;
            self.sources.insert(method, source);
        }
        self.sources
            .get(&method)
            .ok_or(GciError::UnexpectedResult(method, "cached method source"))
    }

    pub fn clear(&mut self) {
        self.methods.clear();
        self.sources.clear();
    }
}
