//! Editor lines <-> VM step points.
//!
//! All offsets are 0-based character offsets into the method source.

use crate::debugger::error::Error;
use crate::debugger::keyword::{expand_keyword_parts, StepPointInfo};
use crate::debugger::source::MethodSource;
use crate::gci::Oop;
use crate::query::QueryFacade;
use crate::weak_error;
use indexmap::IndexMap;

/// Result of a line lookup: the step point and the line it actually lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMapping {
    /// 1-based step point number.
    pub step_point: u32,
    pub actual_line: u32,
}

/// Start offset of every line. Index 0 is an unused placeholder, `offsets[1] == 0`.
pub fn build_line_offsets(source: &str) -> Vec<usize> {
    let mut offsets = vec![0, 0];
    offsets.extend(
        source
            .chars()
            .enumerate()
            .filter(|(_, c)| *c == '\n')
            .map(|(i, _)| i + 1),
    );
    offsets
}

/// 1-based line containing `offset`.
pub fn line_of_offset(offset: usize, line_offsets: &[usize]) -> u32 {
    let lines = line_offsets.get(1..).unwrap_or_default();
    lines.partition_point(|&start| start <= offset).max(1) as u32
}

/// Find the step point for an editor line.
///
/// A step point inside the line wins, otherwise the first one after the line start. Ties are
/// broken by the smallest offset, never by the step point number.
pub fn map_line_to_step_point(
    line: i64,
    line_offsets: &[usize],
    step_offsets: &[usize],
) -> Option<LineMapping> {
    if line <= 0 || line as usize >= line_offsets.len() {
        return None;
    }
    let line = line as usize;
    let start = line_offsets[line];
    let end = line_offsets.get(line + 1).copied().unwrap_or(usize::MAX);

    let first_from = |from: usize, to: usize| {
        step_offsets
            .iter()
            .enumerate()
            .filter(|(_, &offset)| offset >= from && offset < to)
            .min_by_key(|(_, &offset)| offset)
            .map(|(idx, &offset)| (idx as u32 + 1, offset))
    };

    if let Some((step_point, _)) = first_from(start, end) {
        return Some(LineMapping {
            step_point,
            actual_line: line as u32,
        });
    }

    first_from(start, usize::MAX).map(|(step_point, offset)| LineMapping {
        step_point,
        actual_line: line_of_offset(offset, line_offsets),
    })
}

/// Breakpointable position presented to an editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointLocation {
    pub step_point: u32,
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// Step point positions on lines `line..=end_line`, including the trailing parts of
/// multi-keyword selectors.
pub fn breakpoint_locations(
    source: &MethodSource,
    line: u32,
    end_line: u32,
) -> Vec<BreakpointLocation> {
    let infos: Vec<StepPointInfo> = source
        .step_offsets
        .iter()
        .enumerate()
        .map(|(idx, &offset)| StepPointInfo::at(&source.text, idx as u32 + 1, offset))
        .collect();

    let mut locations: Vec<_> = expand_keyword_parts(&source.text, &infos)
        .into_iter()
        .filter_map(|info| {
            let at = line_of_offset(info.offset, &source.line_offsets);
            if at < line || at > end_line {
                return None;
            }
            let line_start = source.line_offsets[at as usize];
            Some(BreakpointLocation {
                step_point: info.step_point,
                line: at,
                column: (info.offset - line_start) as u32 + 1,
            })
        })
        .collect();
    locations.sort_by_key(|l| (l.line, l.column));
    locations.dedup_by_key(|l| (l.line, l.column));
    locations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedBreakpoint {
    pub step_point: u32,
    pub actual_line: u32,
}

/// Outcome of one requested breakpoint line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointView {
    pub verified: bool,
    /// Actual line when verified, the requested one otherwise.
    pub line: i64,
    pub step_point: Option<u32>,
    pub message: Option<String>,
}

impl BreakpointView {
    fn unverified(line: i64, message: impl Into<String>) -> Self {
        Self {
            verified: false,
            line,
            step_point: None,
            message: Some(message.into()),
        }
    }
}

/// Breakpoints per editor document. A document always maps to a single method.
#[derive(Default)]
pub struct BreakpointMapper {
    documents: IndexMap<String, (Oop, Vec<TrackedBreakpoint>)>,
}

impl BreakpointMapper {
    /// Replace all breakpoints of `method` by breakpoints on `lines`.
    ///
    /// A failed VM call never fails the request, the affected lines come back unverified.
    /// When the old breakpoints cannot be cleared the tracked ones are kept as is.
    pub fn set_breakpoints_for_source(
        &mut self,
        query: &QueryFacade,
        document: &str,
        method: Oop,
        lines: &[i64],
    ) -> Result<Vec<BreakpointView>, Error> {
        if let Err(e) = query.perform(method, "clearAllBreaks", &[]) {
            log::warn!(target: "debugger", "clear breakpoints of {method:?}: {e:#}");
            let msg = format!("breakpoints could not be cleared: {e}");
            return Ok(lines
                .iter()
                .map(|&line| BreakpointView::unverified(line, msg.clone()))
                .collect());
        }
        self.documents.shift_remove(document);
        if lines.is_empty() {
            return Ok(vec![]);
        }

        let source = match MethodSource::fetch(query, method) {
            Ok(source) => source,
            Err(e) => {
                log::warn!(target: "debugger", "source of {method:?}: {e:#}");
                let msg = format!("method source unavailable: {e}");
                return Ok(lines
                    .iter()
                    .map(|&line| BreakpointView::unverified(line, msg.clone()))
                    .collect());
            }
        };

        let mut tracked = vec![];
        let views = lines
            .iter()
            .map(|&line| {
                let Some(mapping) =
                    map_line_to_step_point(line, &source.line_offsets, &source.step_offsets)
                else {
                    return BreakpointView::unverified(line, "no step point at or after this line");
                };
                let step = Oop::from_i32(mapping.step_point as i32);
                match weak_error!(
                    query.perform(method, "setBreakAtStepPoint:", &[step]),
                    "set breakpoint:"
                ) {
                    Some(_) => {
                        tracked.push(TrackedBreakpoint {
                            step_point: mapping.step_point,
                            actual_line: mapping.actual_line,
                        });
                        BreakpointView {
                            verified: true,
                            line: mapping.actual_line as i64,
                            step_point: Some(mapping.step_point),
                            message: None,
                        }
                    }
                    None => BreakpointView::unverified(line, "breakpoint rejected by the VM"),
                }
            })
            .collect();

        log::debug!(
            target: "debugger",
            "{document}: {} of {} breakpoints set",
            tracked.len(),
            lines.len()
        );
        self.documents.insert(document.to_string(), (method, tracked));
        Ok(views)
    }

    pub fn tracked(&self, document: &str) -> Option<(Oop, &[TrackedBreakpoint])> {
        self.documents
            .get(document)
            .map(|(method, bps)| (*method, bps.as_slice()))
    }

    /// Forget breakpoints of a recompiled method, its step points no longer exist.
    pub fn invalidate_method(&mut self, method: Oop) {
        self.documents.retain(|_, (m, _)| *m != method);
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }
}
